//! Collaborator seam for site-specific element discovery and extraction.

use anyhow::{bail, Result};
use async_trait::async_trait;

use quill_core::{NodeHandle, StructuredMessage};

/// Scroll geometry of the conversation container at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollMetrics {
    pub scroll_top: f64,
    pub scroll_height: f64,
    pub viewport_height: f64,
}

impl ScrollMetrics {
    /// Largest reachable scroll offset.
    pub fn max_scroll_top(&self) -> f64 {
        (self.scroll_height - self.viewport_height).max(0.0)
    }

    /// Returns true when the position is within `tolerance_px` of the bottom.
    pub fn at_bottom(&self, tolerance_px: f64) -> bool {
        self.scroll_top >= self.max_scroll_top() - tolerance_px
    }
}

/// Host-page collaborator.
///
/// Implementations own the live document tree; the controller only ever sees
/// arena-style `NodeHandle` ids and value-typed messages, never node
/// references. All methods may suspend; none may block.
#[async_trait]
pub trait PageAdapter: Send + Sync {
    /// Locates the scrollable conversation container, returning its current
    /// metrics, or `None` when the page carries no recognizable container.
    async fn find_container(&self) -> Result<Option<ScrollMetrics>>;

    /// Current container geometry.
    async fn scroll_metrics(&self) -> Result<ScrollMetrics>;

    /// Moves the container scroll position to `offset_px` (clamped by the
    /// host).
    async fn scroll_to(&self, offset_px: f64) -> Result<()>;

    /// Bounded wait for document-tree growth: resolves `true` as soon as the
    /// host reports growth, `false` once `timeout_ms` elapses without any.
    async fn await_growth(&self, timeout_ms: u64) -> Result<bool>;

    /// Handles of the message elements currently present in the tree.
    async fn list_visible_messages(&self) -> Result<Vec<NodeHandle>>;

    /// Extracts a structured message from one element; `None` when the
    /// element holds no recognizable message content.
    async fn extract_structured_message(
        &self,
        handle: NodeHandle,
    ) -> Result<Option<StructuredMessage>>;

    /// Whether the host exposes a one-shot bulk transcript fetch.
    fn supports_bulk_fetch(&self) -> bool {
        false
    }

    /// One-shot bulk fetch of the full transcript.
    async fn bulk_fetch_all(&self) -> Result<Vec<StructuredMessage>> {
        bail!("page adapter does not support bulk fetch");
    }

    /// Whether the host virtualizes its render window (only a subset of
    /// messages exists in the tree at any time).
    fn is_virtualized_renderer(&self) -> bool {
        false
    }

    /// Stable URL of the conversation currently rendered, when known.
    fn session_url(&self) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_scroll_metrics_bottom_detection() {
        let metrics = ScrollMetrics {
            scroll_top: 896.0,
            scroll_height: 1500.0,
            viewport_height: 600.0,
        };
        assert_eq!(metrics.max_scroll_top(), 900.0);
        assert!(metrics.at_bottom(5.0));
        assert!(!metrics.at_bottom(1.0));
    }

    #[test]
    fn unit_max_scroll_top_never_negative() {
        let metrics = ScrollMetrics {
            scroll_top: 0.0,
            scroll_height: 200.0,
            viewport_height: 600.0,
        };
        assert_eq!(metrics.max_scroll_top(), 0.0);
        assert!(metrics.at_bottom(0.0));
    }
}
