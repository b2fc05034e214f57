//! Windowed chunker turning an ordinal-ordered message stream into
//! overlapping memory blocks.

use std::collections::HashSet;

use anyhow::{bail, Result};

use quill_core::{
    current_unix_timestamp_ms, derive_block_id, render_transcript, BlockMetadata, MemoryBlock,
    StructuredMessage, MEMORY_BLOCK_SCHEMA_VERSION,
};

/// Chunking configuration.
///
/// `block_size` is clamped to at least 1 and `overlap` to below the block
/// size; the overlap is the number of trailing messages each block shares
/// with its successor so retrieval-context consumers keep continuity across
/// block boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuilderConfig {
    pub block_size: usize,
    pub overlap: usize,
    pub exclude_narration: bool,
}

impl Default for BlockBuilderConfig {
    fn default() -> Self {
        Self {
            block_size: 5,
            overlap: 2,
            exclude_narration: false,
        }
    }
}

impl BlockBuilderConfig {
    fn normalized(&self) -> (usize, usize) {
        let block_size = self.block_size.max(1);
        let overlap = self.overlap.min(block_size.saturating_sub(1));
        (block_size, overlap)
    }
}

/// Per-append options.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppendOptions {
    /// Explicit 1-based ordinal; overrides any ordinal carried by the message.
    pub ordinal: Option<u64>,
}

/// Flush options.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlushOptions {
    /// Also emit one final short block from any remainder below full size.
    pub include_partial: bool,
}

/// Stateful windowed chunker.
///
/// Owns its buffer exclusively; messages cross its boundary by value and
/// emitted blocks are never mutated afterwards.
#[derive(Debug)]
pub struct BlockBuilder {
    block_size: usize,
    overlap: usize,
    exclude_narration: bool,
    buffer: Vec<StructuredMessage>,
    seen_ids: HashSet<String>,
    ordinal_cursor: u64,
    block_counter: u64,
    session_url: Option<String>,
}

impl BlockBuilder {
    pub fn new(config: BlockBuilderConfig) -> Self {
        let (block_size, overlap) = config.normalized();
        Self {
            block_size,
            overlap,
            exclude_narration: config.exclude_narration,
            buffer: Vec::new(),
            seen_ids: HashSet::new(),
            ordinal_cursor: 0,
            block_counter: 0,
            session_url: None,
        }
    }

    /// Appends one message and returns any blocks thereby completed.
    ///
    /// Messages with an already-seen stable id are dropped. The assigned
    /// ordinal is the explicit option when positive, else the message's own
    /// positive ordinal, else one past the internal cursor.
    pub fn append(
        &mut self,
        mut message: StructuredMessage,
        options: AppendOptions,
    ) -> Result<Vec<MemoryBlock>> {
        if let Some(stable_id) = message.stable_id.as_deref() {
            if !stable_id.is_empty() && !self.seen_ids.insert(stable_id.to_string()) {
                tracing::debug!(stable_id = stable_id, "dropping duplicate message");
                return Ok(Vec::new());
            }
        }

        let ordinal = match options.ordinal {
            Some(explicit) if explicit > 0 => explicit,
            _ if message.ordinal > 0 => message.ordinal,
            _ => self.ordinal_cursor.saturating_add(1),
        };
        message.ordinal = ordinal;
        self.ordinal_cursor = self.ordinal_cursor.max(ordinal);

        self.buffer.push(message);
        self.drain_full_windows()
    }

    /// Appends a batch of messages; ordinals resolve per message as in
    /// `append`.
    pub fn append_many(&mut self, messages: Vec<StructuredMessage>) -> Result<Vec<MemoryBlock>> {
        let mut emitted = Vec::new();
        for message in messages {
            emitted.extend(self.append(message, AppendOptions::default())?);
        }
        Ok(emitted)
    }

    /// Drains all complete windows; with `include_partial`, also emits one
    /// final block from any remainder below full size, leaving the buffer
    /// empty.
    pub fn flush(&mut self, options: FlushOptions) -> Result<Vec<MemoryBlock>> {
        let mut emitted = self.drain_full_windows()?;
        if options.include_partial && !self.buffer.is_empty() {
            self.buffer.sort_by_key(|message| message.ordinal);
            let remainder: Vec<StructuredMessage> = self.buffer.drain(..).collect();
            emitted.push(self.build_block(&remainder)?);
        }
        Ok(emitted)
    }

    /// Resets buffer, seen-id set, ordinal cursor, and block counter.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.seen_ids.clear();
        self.ordinal_cursor = 0;
        self.block_counter = 0;
    }

    /// Buffered-but-uncommitted messages; ordinal-sorted whenever a window
    /// has drained since the last append.
    pub fn buffer(&self) -> &[StructuredMessage] {
        &self.buffer
    }

    pub fn session_url(&self) -> Option<&str> {
        self.session_url.as_deref()
    }

    /// Switches sessions; a change clears all uncommitted state since
    /// ordinals are not comparable across sessions.
    pub fn set_session_url(&mut self, next: Option<String>) {
        if self.session_url == next {
            return;
        }
        tracing::debug!(
            previous = self.session_url.as_deref().unwrap_or(""),
            next = next.as_deref().unwrap_or(""),
            "session change clears chunker state"
        );
        self.clear();
        self.session_url = next;
    }

    /// Seeds the seen-id set and advances the ordinal cursor and block
    /// counter from already-persisted blocks so a resumed session never
    /// re-creates or re-numbers a block. Never decreases either counter.
    pub fn prime_from_blocks(&mut self, existing_blocks: &[MemoryBlock]) {
        for block in existing_blocks {
            for message in &block.messages {
                if let Some(stable_id) = message.stable_id.as_deref() {
                    if !stable_id.is_empty() {
                        self.seen_ids.insert(stable_id.to_string());
                    }
                }
            }
            self.ordinal_cursor = self.ordinal_cursor.max(block.max_source_ordinal());
        }
        self.block_counter = self.block_counter.max(existing_blocks.len() as u64);
        tracing::debug!(
            primed_blocks = existing_blocks.len(),
            ordinal_cursor = self.ordinal_cursor,
            "primed chunker from persisted blocks"
        );
    }

    fn drain_full_windows(&mut self) -> Result<Vec<MemoryBlock>> {
        let mut emitted = Vec::new();
        while self.buffer.len() >= self.block_size {
            self.buffer.sort_by_key(|message| message.ordinal);
            let window: Vec<StructuredMessage> =
                self.buffer[..self.block_size].to_vec();
            emitted.push(self.build_block(&window)?);
            let step = self.block_size.saturating_sub(self.overlap).max(1);
            self.buffer.drain(..step);
        }
        Ok(emitted)
    }

    fn build_block(&mut self, window: &[StructuredMessage]) -> Result<MemoryBlock> {
        let (Some(first), Some(last)) = (window.first(), window.last()) else {
            bail!("block window must not be empty");
        };

        let source_ordinals: Vec<u64> = window.iter().map(|message| message.ordinal).collect();
        let messages: Vec<StructuredMessage> = window
            .iter()
            .filter(|message| !(self.exclude_narration && message.is_narration()))
            .cloned()
            .collect();
        let raw_text = render_transcript(window, self.exclude_narration);

        let created_unix_ms = current_unix_timestamp_ms();
        self.block_counter = self.block_counter.saturating_add(1);
        Ok(MemoryBlock {
            schema_version: MEMORY_BLOCK_SCHEMA_VERSION,
            id: derive_block_id(first.ordinal, last.ordinal, created_unix_ms, self.block_counter),
            session_url: self.session_url.clone().unwrap_or_default(),
            raw_text,
            messages,
            ordinal_range: (first.ordinal, last.ordinal),
            created_unix_ms,
            metadata: BlockMetadata {
                block_size: self.block_size,
                overlap: self.overlap,
                source_ordinals,
            },
        })
    }
}
