// Wire formats shared by the relay and its clients
//
// Binary sample frame:
//
//   offset 0  u32 LE  channel_count
//   offset 4  u32 LE  samples_per_channel
//   offset 8  f32 LE  channel_count * samples_per_channel values, sample-major
//                     (sample 0 of every channel, then sample 1, ...)
//
// Text frames are JSON: either one payload or a batch envelope (a JSON array
// of payloads) produced by the relay's flush timer.

use crate::error::{ClientError, ClientResult};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use serde_json::Value;
use std::io::Cursor;

/// Size of the binary frame header in bytes
pub const FRAME_HEADER_LEN: usize = 8;

const SAMPLE_LEN: usize = 4;

/// Geometry carried by a binary frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub channel_count: u32,
    pub samples_per_channel: u32,
}

impl FrameHeader {
    /// Parse the header without touching the payload
    pub fn parse(bytes: &[u8]) -> ClientResult<Self> {
        if bytes.len() < FRAME_HEADER_LEN {
            return Err(ClientError::TruncatedFrame {
                expected: FRAME_HEADER_LEN,
                actual: bytes.len(),
            });
        }

        Ok(Self {
            channel_count: LittleEndian::read_u32(&bytes[0..4]),
            samples_per_channel: LittleEndian::read_u32(&bytes[4..8]),
        })
    }

    /// Total frame size implied by this header, saturating on absurd geometry
    pub fn frame_len(&self) -> usize {
        (self.channel_count as usize)
            .saturating_mul(self.samples_per_channel as usize)
            .saturating_mul(SAMPLE_LEN)
            .saturating_add(FRAME_HEADER_LEN)
    }

    /// Check that `bytes` is exactly one frame with this header
    pub fn validate(bytes: &[u8]) -> ClientResult<Self> {
        let header = Self::parse(bytes)?;
        let expected = header.frame_len();
        if bytes.len() != expected {
            return Err(ClientError::FrameLengthMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        Ok(header)
    }
}

/// Decoded binary frame, transposed into one contiguous run per channel
#[derive(Debug, Clone, PartialEq)]
pub struct SampleFrame {
    pub channels: Vec<Vec<f32>>,
}

impl SampleFrame {
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn samples_per_channel(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    /// Decode and transpose a binary frame
    pub fn decode(bytes: &[u8]) -> ClientResult<Self> {
        let header = FrameHeader::validate(bytes)?;
        let channel_count = header.channel_count as usize;
        let samples = header.samples_per_channel as usize;

        let mut channels = vec![Vec::with_capacity(samples); channel_count];
        let mut reader = Cursor::new(&bytes[FRAME_HEADER_LEN..]);
        for _ in 0..samples {
            for channel in channels.iter_mut() {
                channel.push(reader.read_f32::<LittleEndian>()?);
            }
        }

        Ok(Self { channels })
    }

    /// Encode per-channel runs as a binary frame
    ///
    /// Every channel must hold the same number of samples.
    pub fn encode<S: AsRef<[f32]>>(channels: &[S]) -> ClientResult<Vec<u8>> {
        let samples = channels.first().map(|c| c.as_ref().len()).unwrap_or(0);
        if let Some(bad) = channels.iter().position(|c| c.as_ref().len() != samples) {
            return Err(ClientError::InvalidConfig(format!(
                "channel {} has {} samples, expected {}",
                bad,
                channels[bad].as_ref().len(),
                samples
            )));
        }

        let channel_count = u32::try_from(channels.len())
            .map_err(|_| ClientError::InvalidConfig("too many channels".to_string()))?;
        let samples_per_channel = u32::try_from(samples)
            .map_err(|_| ClientError::InvalidConfig("too many samples".to_string()))?;

        let header = FrameHeader {
            channel_count,
            samples_per_channel,
        };
        let mut out = Vec::with_capacity(header.frame_len());
        out.write_u32::<LittleEndian>(channel_count)?;
        out.write_u32::<LittleEndian>(samples_per_channel)?;
        for index in 0..samples {
            for channel in channels {
                out.write_f32::<LittleEndian>(channel.as_ref()[index])?;
            }
        }

        Ok(out)
    }
}

/// Split a text frame into its payloads
///
/// A batch envelope yields each element; any other JSON value is a single
/// payload.
pub fn decode_text(text: &str) -> ClientResult<Vec<Value>> {
    match serde_json::from_str::<Value>(text)? {
        Value::Array(items) => Ok(items),
        single => Ok(vec![single]),
    }
}
