//! Committed memory blocks: immutable overlapping chunks of a transcript.

use serde::{Deserialize, Serialize};

use crate::message::StructuredMessage;

pub const MEMORY_BLOCK_SCHEMA_VERSION: u32 = 1;

fn memory_block_schema_version() -> u32 {
    MEMORY_BLOCK_SCHEMA_VERSION
}

/// Chunking parameters and provenance recorded alongside a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMetadata {
    pub block_size: usize,
    pub overlap: usize,
    /// Ordinals of every source message in the window, narration included.
    pub source_ordinals: Vec<u64>,
}

/// A committed, immutable chunk of the transcript.
///
/// Full blocks satisfy `end - start + 1 == source_ordinals.len()`; partial
/// blocks produced by an explicit flush may be shorter. Never mutated after
/// creation and persisted exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryBlock {
    #[serde(default = "memory_block_schema_version")]
    pub schema_version: u32,
    pub id: String,
    pub session_url: String,
    pub raw_text: String,
    pub messages: Vec<StructuredMessage>,
    pub ordinal_range: (u64, u64),
    pub created_unix_ms: u64,
    pub metadata: BlockMetadata,
}

impl MemoryBlock {
    /// Number of messages in the persisted list (narration may be excluded).
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Width of the ordinal range covered by this block.
    pub fn ordinal_span(&self) -> u64 {
        let (start, end) = self.ordinal_range;
        end.saturating_sub(start).saturating_add(1)
    }

    /// Highest source ordinal recorded in the block metadata.
    pub fn max_source_ordinal(&self) -> u64 {
        self.metadata
            .source_ordinals
            .iter()
            .copied()
            .max()
            .unwrap_or(self.ordinal_range.1)
    }
}

/// Derives the deterministic block identifier from the ordinal range, the
/// creation timestamp, and the builder's monotonic counter.
pub fn derive_block_id(start: u64, end: u64, created_unix_ms: u64, counter: u64) -> String {
    format!("block-{start:06}-{end:06}-{created_unix_ms}-{counter:04}")
}

/// Renders the flattened `speaker: text` transcript form of a window.
///
/// The first content line of each message is prefixed with its speaker;
/// continuation lines follow unprefixed. Narration-only messages are skipped
/// when `exclude_narration` is set.
pub fn render_transcript(messages: &[StructuredMessage], exclude_narration: bool) -> String {
    let mut rendered = Vec::new();
    for message in messages {
        if exclude_narration && message.is_narration() {
            continue;
        }
        let lines = message.content_lines();
        let Some(first) = lines.first() else {
            continue;
        };
        rendered.push(format!("{}: {}", message.speaker.trim(), first));
        for line in lines.iter().skip(1) {
            rendered.push(line.clone());
        }
    }
    rendered.join("\n")
}
