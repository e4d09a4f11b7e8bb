// Per-channel circular sample buffer
//
// Holds the most recent `capacity` samples of every channel in a fixed
// allocation. Appends are slice copies (at most two per channel per push) and
// reads are computed from the cursor at call time, so a read that interleaves
// with a push on the same channel always sees a consistent window.
//
// Out-of-range channels never panic: reads return zeros and writes are
// ignored, because the render path must survive a transient mismatch between
// the configured channel count and what the UI asks for. The `try_*` reads
// give an explicit error for callers that prefer one.

use crate::error::{ClientError, ClientResult};

/// Fixed-capacity ring store with one write cursor per channel
#[derive(Debug, Clone)]
pub struct ChannelRingBuffer {
    rings: Vec<Vec<f32>>,
    cursors: Vec<usize>,
    total_written: Vec<u64>,
    capacity: usize,
}

impl ChannelRingBuffer {
    /// Allocate `channel_count` rings of `capacity` samples each
    pub fn new(channel_count: usize, capacity: usize) -> ClientResult<Self> {
        if capacity == 0 {
            return Err(ClientError::InvalidConfig(
                "ring buffer capacity must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            rings: vec![vec![0.0; capacity]; channel_count],
            cursors: vec![0; channel_count],
            total_written: vec![0; channel_count],
            capacity,
        })
    }

    /// Samples kept per channel
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn channel_count(&self) -> usize {
        self.rings.len()
    }

    /// Append one run per channel; payload `i` goes to channel `i`
    ///
    /// Payloads beyond `channel_count` are ignored.
    pub fn push<S: AsRef<[f32]>>(&mut self, channel_payloads: &[S]) {
        if channel_payloads.len() > self.rings.len() {
            log::debug!(
                "Ignoring {} payloads for channels beyond {}",
                channel_payloads.len() - self.rings.len(),
                self.rings.len()
            );
        }

        for (channel, samples) in channel_payloads.iter().enumerate().take(self.rings.len()) {
            self.push_channel(channel, samples.as_ref());
        }
    }

    /// Append a run of samples to a single channel
    pub fn push_channel(&mut self, channel: usize, samples: &[f32]) {
        let capacity = self.capacity;
        let Some(ring) = self.rings.get_mut(channel) else {
            log::debug!("Dropping write to unknown channel {}", channel);
            return;
        };

        let len = samples.len();
        if len == 0 {
            return;
        }

        let cursor = &mut self.cursors[channel];
        if len >= capacity {
            // Only the trailing `capacity` samples survive
            ring.copy_from_slice(&samples[len - capacity..]);
            *cursor = 0;
        } else {
            let room = capacity - *cursor;
            if len <= room {
                ring[*cursor..*cursor + len].copy_from_slice(samples);
                *cursor = (*cursor + len) % capacity;
            } else {
                let (head, tail) = samples.split_at(room);
                ring[*cursor..].copy_from_slice(head);
                ring[..tail.len()].copy_from_slice(tail);
                *cursor = tail.len();
            }
        }

        self.total_written[channel] += len as u64;
    }

    /// Fill `out` with samples starting at `cursor + start_offset`, wrapping
    ///
    /// A negative offset reads into the past. Unknown channels yield zeros.
    pub fn window_into(&self, channel: usize, start_offset: isize, out: &mut [f32]) {
        let Some(ring) = self.rings.get(channel) else {
            log::debug!("Read from unknown channel {}, returning zeros", channel);
            out.fill(0.0);
            return;
        };

        let capacity = self.capacity;
        let mut pos = (self.cursors[channel] as isize + start_offset).rem_euclid(capacity as isize)
            as usize;
        let mut written = 0;
        while written < out.len() {
            let chunk = (capacity - pos).min(out.len() - written);
            out[written..written + chunk].copy_from_slice(&ring[pos..pos + chunk]);
            written += chunk;
            pos = 0;
        }
    }

    /// Read `len` samples starting at `cursor + start_offset`
    pub fn window(&self, channel: usize, start_offset: isize, len: usize) -> Vec<f32> {
        let mut out = vec![0.0; len];
        self.window_into(channel, start_offset, &mut out);
        out
    }

    /// The most recent `len` samples, oldest first
    pub fn latest(&self, channel: usize, len: usize) -> Vec<f32> {
        self.window(channel, -(len as isize), len)
    }

    /// Like [`window`](Self::window), but rejects unknown channels
    pub fn try_window(
        &self,
        channel: usize,
        start_offset: isize,
        len: usize,
    ) -> ClientResult<Vec<f32>> {
        self.check_channel(channel)?;
        Ok(self.window(channel, start_offset, len))
    }

    /// Like [`latest`](Self::latest), but rejects unknown channels
    pub fn try_latest(&self, channel: usize, len: usize) -> ClientResult<Vec<f32>> {
        self.check_channel(channel)?;
        Ok(self.latest(channel, len))
    }

    /// `min(1, total_written / capacity)`; zero for unknown channels
    pub fn fill_level(&self, channel: usize) -> f32 {
        self.total_written
            .get(channel)
            .map(|&total| (total as f64 / self.capacity as f64).min(1.0) as f32)
            .unwrap_or(0.0)
    }

    /// Samples ever written to a channel since the last clear
    pub fn total_written(&self, channel: usize) -> u64 {
        self.total_written.get(channel).copied().unwrap_or(0)
    }

    /// Current write cursor of a channel, always in `[0, capacity)`
    pub fn cursor(&self, channel: usize) -> Option<usize> {
        self.cursors.get(channel).copied()
    }

    /// Reset every channel in place, keeping the allocation
    pub fn clear(&mut self) {
        for ring in &mut self.rings {
            ring.fill(0.0);
        }
        self.cursors.fill(0);
        self.total_written.fill(0);
    }

    fn check_channel(&self, channel: usize) -> ClientResult<()> {
        if channel < self.rings.len() {
            Ok(())
        } else {
            Err(ClientError::ChannelOutOfRange {
                channel,
                channel_count: self.rings.len(),
            })
        }
    }
}
