// Level-of-detail decimation for live traces
//
// A viewport a few thousand pixels wide cannot show a window of hundreds of
// thousands of samples one by one. The routines here reduce a run of samples
// to a budget sized to the viewport:
//
// - min/max: one (min, max) pair per output bin, keeps spike amplitudes
// - average: mean of consecutive runs, smooths mild oversampling
// - `LodCache`: power-of-two min/max levels precomputed from one snapshot
//
// NaN samples are skipped by every reduction. A bin that holds nothing but
// NaN reduces to NaN. Infinities are ordinary ordered values.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// How a run of samples is reduced for a given viewport
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DecimationStrategy {
    /// Fewer samples than pixels, draw as-is
    PassThrough,
    /// Mean of each run of `factor` samples
    Average { factor: usize },
    /// `bins` interleaved (min, max) pairs
    MinMax { bins: usize },
}

/// Pick a strategy from the oversampling ratio `len / viewport_width`
///
/// ratio <= 1 passes through, ratio <= 2 averages, anything higher uses
/// min/max because peak fidelity matters more than smoothing there.
pub fn select_strategy(len: usize, viewport_width: usize) -> DecimationStrategy {
    if len == 0 {
        return DecimationStrategy::PassThrough;
    }
    if viewport_width == 0 {
        return DecimationStrategy::MinMax { bins: 0 };
    }

    let ratio = len as f64 / viewport_width as f64;
    if ratio <= 1.0 {
        DecimationStrategy::PassThrough
    } else if ratio <= 2.0 {
        DecimationStrategy::Average {
            factor: ratio.ceil() as usize,
        }
    } else {
        DecimationStrategy::MinMax {
            bins: viewport_width,
        }
    }
}

/// Reduce `data` for a viewport `viewport_width` pixels wide
///
/// Inputs that already fit are returned borrowed and unchanged.
pub fn auto_decimate(data: &[f32], viewport_width: usize) -> Cow<'_, [f32]> {
    match select_strategy(data.len(), viewport_width) {
        DecimationStrategy::PassThrough => Cow::Borrowed(data),
        DecimationStrategy::Average { factor } => Cow::Owned(decimate_average(data, factor)),
        DecimationStrategy::MinMax { bins } => Cow::Owned(decimate_min_max(data, bins)),
    }
}

/// Min-max decimation into exactly `target_points` bins
///
/// Returns `2 * target_points` values, `[min0, max0, min1, max1, ...]`. Bin
/// `i` covers `floor(i*len/target) .. floor((i+1)*len/target)`. When there
/// are fewer samples than bins, an empty bin repeats the sample at its start
/// so the output length stays fixed.
pub fn decimate_min_max(data: &[f32], target_points: usize) -> Vec<f32> {
    let len = data.len();
    if len == 0 || target_points == 0 {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(target_points * 2);
    for bin in 0..target_points {
        let start = bin_edge(bin, len, target_points);
        let end = bin_edge(bin + 1, len, target_points);

        if start >= end {
            let value = data[start.min(len - 1)];
            result.push(value);
            result.push(value);
            continue;
        }

        let (min, max) = min_max(&data[start..end]);
        result.push(min);
        result.push(max);
    }

    result
}

/// Mean of each consecutive run of `factor` samples; the last bin may be shorter
///
/// A factor of zero is treated as one.
pub fn decimate_average(data: &[f32], factor: usize) -> Vec<f32> {
    data.chunks(factor.max(1)).map(mean).collect()
}

fn bin_edge(bin: usize, len: usize, bins: usize) -> usize {
    (bin as u128 * len as u128 / bins as u128) as usize
}

fn min_max(bin: &[f32]) -> (f32, f32) {
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    let mut seen = false;

    for &value in bin {
        if value.is_nan() {
            continue;
        }
        seen = true;
        if value < min {
            min = value;
        }
        if value > max {
            max = value;
        }
    }

    if seen {
        (min, max)
    } else {
        (f32::NAN, f32::NAN)
    }
}

fn mean(bin: &[f32]) -> f32 {
    let (sum, count) = bin
        .iter()
        .filter(|v| !v.is_nan())
        .fold((0.0f64, 0usize), |(sum, count), &v| (sum + v as f64, count + 1));

    if count == 0 {
        f32::NAN
    } else {
        (sum / count as f64) as f32
    }
}

/// One cached min/max level
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LodLevel {
    /// Source samples per output pair (a power of two)
    pub factor: usize,
    /// Interleaved (min, max) pairs, `ceil(source_len / factor)` of them
    pub points: Vec<f32>,
}

impl LodLevel {
    pub fn pair_count(&self) -> usize {
        self.points.len() / 2
    }
}

/// Power-of-two min/max levels derived from one source snapshot
///
/// Levels go stale as soon as the source they were built from changes; the
/// owner is expected to call [`rebuild`](Self::rebuild) or
/// [`invalidate`](Self::invalidate) when that happens.
#[derive(Debug, Clone, Default)]
pub struct LodCache {
    levels: Vec<LodLevel>,
    source_len: usize,
}

impl LodCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Precompute levels at factors 2, 4, ..., 2^max_levels
    pub fn build(data: &[f32], max_levels: u32) -> Self {
        let mut cache = Self::new();
        cache.rebuild(data, max_levels);
        cache
    }

    /// Replace every level with ones derived from `data`
    ///
    /// Stops early once a level would have fewer than two points.
    pub fn rebuild(&mut self, data: &[f32], max_levels: u32) {
        self.levels.clear();
        self.source_len = data.len();

        for exponent in 1..=max_levels.min(usize::BITS - 1) {
            let factor = 1usize << exponent;
            let pairs = data.len().div_ceil(factor);
            if pairs < 2 {
                break;
            }
            self.levels.push(LodLevel {
                factor,
                points: decimate_min_max(data, pairs),
            });
        }
    }

    /// Level to draw `sample_count` samples across `viewport_width` pixels
    ///
    /// `None` means "draw raw data": either no reduction is needed
    /// (`sample_count <= viewport_width`) or no cached level is fine enough.
    /// Otherwise this is the coarsest level whose factor does not exceed the
    /// desired one, so the trace is never reduced more than necessary.
    pub fn level_for(&self, sample_count: usize, viewport_width: usize) -> Option<&LodLevel> {
        let desired = if viewport_width == 0 {
            f64::INFINITY
        } else {
            sample_count as f64 / viewport_width as f64
        };

        if desired <= 1.0 {
            return None;
        }

        self.levels
            .iter()
            .rev()
            .find(|level| level.factor as f64 <= desired)
    }

    pub fn levels(&self) -> &[LodLevel] {
        &self.levels
    }

    /// Length of the snapshot the levels were derived from
    pub fn source_len(&self) -> usize {
        self.source_len
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Drop every level; `level_for` returns `None` until the next rebuild
    pub fn invalidate(&mut self) {
        self.levels.clear();
        self.source_len = 0;
    }
}
