// Render path: ring buffer window -> drawable trace
//
// Each paint reads the latest `window_len` samples of a channel and reduces
// them for the viewport. With LOD caching on, wide windows (more than twice
// the viewport) are served from a per-channel `LodCache`. The cache is rebuilt
// when the window length changes or once the channel has received at least
// one bin (`factor` samples) of the level being drawn; until then the trace
// lags the buffer by less than one output pair. A rebuild derives every level
// from the window, so on a stream that fills a bin between paints the cache
// costs more than direct decimation; it pays off on paused or slow streams
// and on repeated paints.

use crate::buffer::ChannelRingBuffer;
use crate::config::ClientConfig;
use crate::lod::{auto_decimate, select_strategy, DecimationStrategy, LodCache};
use serde::Serialize;
use std::collections::HashMap;

/// How the points of a trace were produced
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TraceLayout {
    Direct(DecimationStrategy),
    /// Interleaved (min, max) pairs from a cached level
    CachedLevel { factor: usize },
}

/// Points ready for drawing
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RenderedTrace {
    pub channel: usize,
    pub strategy: TraceLayout,
    pub points: Vec<f32>,
    /// Samples in the window the points were derived from
    pub source_len: usize,
}

struct CachedChannel {
    cache: LodCache,
    /// (total_written, window_len) the cache was built for
    built: Option<(u64, usize)>,
}

impl CachedChannel {
    fn is_stale(&self, written: u64, window_len: usize, viewport_width: usize) -> bool {
        match self.built {
            Some((at, len)) if len == window_len && written >= at => {
                let step = self
                    .cache
                    .level_for(window_len, viewport_width)
                    .map_or(1, |level| level.factor as u64);
                written - at >= step
            }
            _ => true,
        }
    }
}

pub struct RenderPath {
    caches: HashMap<usize, CachedChannel>,
    max_lod_levels: u32,
    lod_caching: bool,
}

impl RenderPath {
    pub fn new(max_lod_levels: u32, lod_caching: bool) -> Self {
        Self {
            caches: HashMap::new(),
            max_lod_levels,
            lod_caching,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.max_lod_levels, config.lod_caching)
    }

    /// Produce the trace for one channel
    ///
    /// Unknown channels render as zeros, like any other buffer read.
    pub fn render(
        &mut self,
        buffer: &ChannelRingBuffer,
        channel: usize,
        window_len: usize,
        viewport_width: usize,
    ) -> RenderedTrace {
        let mut window = None;

        if self.lod_caching && window_len > viewport_width.saturating_mul(2) {
            let written = buffer.total_written(channel);
            let entry = self.caches.entry(channel).or_insert_with(|| CachedChannel {
                cache: LodCache::new(),
                built: None,
            });

            if entry.is_stale(written, window_len, viewport_width) {
                let samples = buffer.latest(channel, window_len);
                entry.cache.rebuild(&samples, self.max_lod_levels);
                entry.built = Some((written, window_len));
                window = Some(samples);
            }

            if let Some(level) = entry.cache.level_for(window_len, viewport_width) {
                return RenderedTrace {
                    channel,
                    strategy: TraceLayout::CachedLevel {
                        factor: level.factor,
                    },
                    points: level.points.clone(),
                    source_len: window_len,
                };
            }
        }

        let samples = window.unwrap_or_else(|| buffer.latest(channel, window_len));
        RenderedTrace {
            channel,
            strategy: TraceLayout::Direct(select_strategy(samples.len(), viewport_width)),
            points: auto_decimate(&samples, viewport_width).into_owned(),
            source_len: samples.len(),
        }
    }

    /// Render several channels with the same window and viewport
    pub fn render_all(
        &mut self,
        buffer: &ChannelRingBuffer,
        channels: &[usize],
        window_len: usize,
        viewport_width: usize,
    ) -> Vec<RenderedTrace> {
        channels
            .iter()
            .map(|&channel| self.render(buffer, channel, window_len, viewport_width))
            .collect()
    }

    /// Drop every cached level, e.g. after `ChannelRingBuffer::clear`
    pub fn invalidate(&mut self) {
        self.caches.clear();
    }

    pub fn cached_channels(&self) -> usize {
        self.caches.len()
    }
}
