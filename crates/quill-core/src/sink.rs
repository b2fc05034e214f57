//! State/notification sink seam for surfacing progress and errors.

use std::sync::Arc;

/// Receives keyed state payloads from the collection pipeline.
///
/// Implementations must not block; sinks are called from inside async loops
/// between suspension points.
pub trait StateSink: Send + Sync {
    fn set_state(&self, state_key: &str, payload: serde_json::Value);
}

/// Sink that discards every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStateSink;

impl StateSink for NullStateSink {
    fn set_state(&self, _state_key: &str, _payload: serde_json::Value) {}
}

/// Sink that forwards updates to structured logging.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingStateSink;

impl StateSink for TracingStateSink {
    fn set_state(&self, state_key: &str, payload: serde_json::Value) {
        tracing::debug!(state_key = state_key, payload = %payload, "state update");
    }
}

impl<T: StateSink + ?Sized> StateSink for Arc<T> {
    fn set_state(&self, state_key: &str, payload: serde_json::Value) {
        (**self).set_state(state_key, payload);
    }
}
