//! Transcript chunking: batch dedup/merge and the windowed block builder.
//!
//! `batch_merge` reconciles overlapping snapshots of a scrolled window;
//! `block_builder` segments the reconstructed transcript into overlapping
//! fixed-size memory blocks.

pub mod batch_merge;
pub mod block_builder;

pub use batch_merge::merge_batches;
pub use block_builder::{AppendOptions, BlockBuilder, BlockBuilderConfig, FlushOptions};
