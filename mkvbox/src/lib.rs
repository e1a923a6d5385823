//! Matroska muxing and extraction core.
//!
//! Source readers parse heterogeneous containers into per-track packet
//! queues through codec-specific packetizers; the mux orchestrator pulls
//! packets in timecode order and renders them into Matroska clusters. The
//! extract pipeline walks a Matroska segment and feeds per-codec sinks,
//! the inverse of the packetizers.

pub mod codec;
pub mod ebml;
pub mod error;
pub mod extract;
pub mod format;
pub mod io;
pub mod media;
pub mod mux;
pub mod packet;
pub mod span;

pub use error::{Error, Result, Warnings};
pub use media::{Track, TrackType};
pub use span::Span;
