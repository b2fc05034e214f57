//! Collaborator seam for the host-tree watcher that announces messages.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use quill_core::{ChangeEvent, NodeHandle, StructuredMessage};

/// Watches the host document tree and announces message-bearing nodes.
///
/// Events drain in arrival order from the subscription channel. Extraction
/// is a separate call because a just-announced node may not have finished
/// rendering; the coordinator retries it against the same handle.
#[async_trait]
pub trait MessageIndexer: Send + Sync {
    /// Subscribes to change events. Each coordinator holds one receiver.
    fn subscribe_events(&self) -> mpsc::UnboundedReceiver<ChangeEvent>;

    /// Requests a re-scan of the tree; `immediate` skips any debounce.
    async fn refresh(&self, immediate: bool) -> Result<()>;

    fn start(&self);

    fn stop(&self);

    /// Extracts the structured message behind a previously announced handle;
    /// `None` while the node holds no recognizable message yet.
    async fn extract(&self, handle: NodeHandle) -> Result<Option<StructuredMessage>>;

    /// 1-based ordinal for a raw source index, when known.
    fn ordinal_by_index(&self, index: u64) -> Option<u64>;

    /// 1-based ordinal for a stable message id, when known.
    fn ordinal_by_id(&self, stable_id: &str) -> Option<u64>;
}
