//! Block persistence seam and the JSONL / in-memory reference backends.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;

use quill_core::MemoryBlock;

const BLOCKS_FILE_NAME: &str = "blocks.jsonl";

/// Aggregate store counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockStoreStats {
    pub total_blocks: usize,
    pub total_messages: usize,
}

/// Durable home for committed memory blocks.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Persists one block. Blocks arrive in commit order, one at a time.
    async fn save(&self, block: &MemoryBlock) -> Result<()>;

    /// All previously persisted blocks for a session, in persisted order.
    async fn get_by_session(&self, session_url: &str) -> Result<Vec<MemoryBlock>>;

    async fn get_stats(&self) -> Result<BlockStoreStats>;
}

/// Append-only JSONL block store.
///
/// One serialized block per line. Corrupt lines are skipped on read so a
/// torn write never poisons an entire store.
#[derive(Debug, Clone)]
pub struct JsonlBlockStore {
    path: PathBuf,
}

impl JsonlBlockStore {
    /// Store rooted at `root_dir`, writing `blocks.jsonl` inside it.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: root_dir.into().join(BLOCKS_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<Vec<MemoryBlock>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let mut blocks = Vec::new();
        for (line_number, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<MemoryBlock>(line) {
                Ok(block) => blocks.push(block),
                Err(error) => {
                    tracing::warn!(
                        line = line_number.saturating_add(1),
                        error = %error,
                        "skipping corrupt block record"
                    );
                }
            }
        }
        Ok(blocks)
    }
}

#[async_trait]
impl BlockStore for JsonlBlockStore {
    async fn save(&self, block: &MemoryBlock) -> Result<()> {
        use std::io::Write;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let line = serde_json::to_string(block).context("serialize block record")?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("failed to append {}", self.path.display()))?;
        file.flush()
            .with_context(|| format!("failed to flush {}", self.path.display()))?;
        Ok(())
    }

    async fn get_by_session(&self, session_url: &str) -> Result<Vec<MemoryBlock>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|block| block.session_url == session_url)
            .collect())
    }

    async fn get_stats(&self) -> Result<BlockStoreStats> {
        let blocks = self.read_all()?;
        Ok(BlockStoreStats {
            total_blocks: blocks.len(),
            total_messages: blocks
                .iter()
                .map(|block| block.message_count())
                .sum(),
        })
    }
}

/// Volatile store for tests and in-memory-only operation.
#[derive(Debug, Default)]
pub struct InMemoryBlockStore {
    blocks: std::sync::Mutex<Vec<MemoryBlock>>,
}

impl InMemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every saved block, in save order.
    pub fn snapshot(&self) -> Vec<MemoryBlock> {
        self.blocks.lock().expect("block store lock").clone()
    }
}

#[async_trait]
impl BlockStore for InMemoryBlockStore {
    async fn save(&self, block: &MemoryBlock) -> Result<()> {
        self.blocks
            .lock()
            .expect("block store lock")
            .push(block.clone());
        Ok(())
    }

    async fn get_by_session(&self, session_url: &str) -> Result<Vec<MemoryBlock>> {
        Ok(self
            .blocks
            .lock()
            .expect("block store lock")
            .iter()
            .filter(|block| block.session_url == session_url)
            .cloned()
            .collect())
    }

    async fn get_stats(&self) -> Result<BlockStoreStats> {
        let blocks = self.blocks.lock().expect("block store lock");
        Ok(BlockStoreStats {
            total_blocks: blocks.len(),
            total_messages: blocks.iter().map(|block| block.message_count()).sum(),
        })
    }
}

#[cfg(test)]
mod tests {
    use quill_core::{derive_block_id, BlockMetadata, Channel, StructuredMessage};

    use super::*;

    fn block(session: &str, start: u64, end: u64) -> MemoryBlock {
        let messages: Vec<StructuredMessage> = (start..=end)
            .map(|ordinal| {
                let mut message =
                    StructuredMessage::text(Channel::User, "alice", format!("m{ordinal}"));
                message.ordinal = ordinal;
                message
            })
            .collect();
        MemoryBlock {
            schema_version: quill_core::MEMORY_BLOCK_SCHEMA_VERSION,
            id: derive_block_id(start, end, 1_000, start),
            session_url: session.to_string(),
            raw_text: String::new(),
            messages,
            ordinal_range: (start, end),
            created_unix_ms: 1_000,
            metadata: BlockMetadata {
                block_size: (end - start + 1) as usize,
                overlap: 0,
                source_ordinals: (start..=end).collect(),
            },
        }
    }

    #[tokio::test]
    async fn functional_jsonl_store_round_trips_blocks_by_session() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let store = JsonlBlockStore::new(tempdir.path());

        store.save(&block("s-a", 1, 3)).await.expect("save a1");
        store.save(&block("s-b", 1, 2)).await.expect("save b1");
        store.save(&block("s-a", 2, 4)).await.expect("save a2");

        let session_a = store.get_by_session("s-a").await.expect("get a");
        assert_eq!(session_a.len(), 2);
        assert_eq!(session_a[0].ordinal_range, (1, 3));
        assert_eq!(session_a[1].ordinal_range, (2, 4));

        let stats = store.get_stats().await.expect("stats");
        assert_eq!(stats.total_blocks, 3);
        assert_eq!(stats.total_messages, 8);
    }

    #[tokio::test]
    async fn regression_jsonl_store_skips_corrupt_lines() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let store = JsonlBlockStore::new(tempdir.path());
        store.save(&block("s-a", 1, 2)).await.expect("save");

        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(store.path())
            .expect("open");
        writeln!(file, "{{ not json").expect("corrupt line");
        drop(file);
        store.save(&block("s-a", 3, 4)).await.expect("save after corrupt");

        let blocks = store.get_by_session("s-a").await.expect("get");
        assert_eq!(blocks.len(), 2);
    }

    #[tokio::test]
    async fn unit_in_memory_store_preserves_save_order() {
        let store = InMemoryBlockStore::new();
        store.save(&block("s", 1, 2)).await.expect("save");
        store.save(&block("s", 2, 3)).await.expect("save");
        let snapshot = store.snapshot();
        assert_eq!(snapshot[0].ordinal_range, (1, 2));
        assert_eq!(snapshot[1].ordinal_range, (2, 3));
    }

    #[tokio::test]
    async fn unit_missing_store_file_reads_empty() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let store = JsonlBlockStore::new(tempdir.path().join("nested"));
        assert!(store.get_by_session("s").await.expect("get").is_empty());
        assert_eq!(store.get_stats().await.expect("stats").total_blocks, 0);
    }
}
