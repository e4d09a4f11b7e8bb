//! Receiving side of the Neuroscope telemetry pipeline
//!
//! Samples arrive from the relay over a websocket ([`ingest`]), are decoded
//! ([`wire`]) into a fixed-size per-channel ring ([`buffer`]) and reduced for
//! the viewport on every paint ([`lod`], [`render`]).

pub mod buffer;
pub mod config;
pub mod error;
pub mod ingest;
pub mod lod;
pub mod render;
pub mod wire;

pub use buffer::ChannelRingBuffer;
pub use config::{ClientConfig, ReconnectPolicy};
pub use error::{ClientError, ClientResult};
pub use ingest::{
    IngestLoop, IngestStats, IngestStatsSnapshot, SequenceEvent, SequenceTracker, StreamWatchdog,
};
pub use lod::{
    auto_decimate, decimate_average, decimate_min_max, select_strategy, DecimationStrategy,
    LodCache, LodLevel,
};
pub use render::{RenderPath, RenderedTrace, TraceLayout};
pub use wire::{decode_text, FrameHeader, SampleFrame, FRAME_HEADER_LEN};
