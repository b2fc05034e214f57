//! Live event-to-block coordination: change events in, persisted memory
//! blocks out.
//!
//! Bridges a message indexer's change events into the windowed chunker,
//! owning session priming, per-event retry, ordered persistence, and
//! block/message pub-sub fan-out.

pub mod coordinator;
pub mod indexer;
pub mod store;

pub use coordinator::{
    ListenerGuard, StreamConfig, StreamCoordinator, STREAM_STATE_KEY,
};
pub use indexer::MessageIndexer;
pub use store::{BlockStore, BlockStoreStats, InMemoryBlockStore, JsonlBlockStore};
