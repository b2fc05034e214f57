//! Foundational utilities and the shared transcript data model for Quill.
//!
//! Provides time helpers, atomic file writes, the cooperative stop token,
//! and the message/block types passed between the retrieval, chunking, and
//! coordination crates.

pub mod atomic_io;
pub mod block;
pub mod cancellation;
pub mod message;
pub mod sink;
pub mod time_utils;

pub use atomic_io::write_text_atomic;
pub use block::{
    derive_block_id, render_transcript, BlockMetadata, MemoryBlock, MEMORY_BLOCK_SCHEMA_VERSION,
};
pub use cancellation::{sleep_unless_stopped, StopToken};
pub use message::{
    Channel, ChangeEvent, ContentFlavor, ContentPart, NodeHandle, StructuredMessage,
};
pub use sink::{NullStateSink, StateSink, TracingStateSink};
pub use time_utils::{current_unix_timestamp, current_unix_timestamp_ms};
