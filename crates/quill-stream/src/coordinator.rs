//! Bridges live change events into committed, persisted memory blocks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use serde_json::json;
use tokio::sync::mpsc;

use quill_chunker::{AppendOptions, BlockBuilder, BlockBuilderConfig, FlushOptions};
use quill_core::{
    sleep_unless_stopped, ChangeEvent, MemoryBlock, StateSink, StopToken, StructuredMessage,
};

use crate::indexer::MessageIndexer;
use crate::store::BlockStore;

pub const STREAM_STATE_KEY: &str = "stream";

type BlockListener = Arc<dyn Fn(&MemoryBlock) + Send + Sync>;
type MessageListener = Arc<dyn Fn(&StructuredMessage) + Send + Sync>;

/// Coordinator timing and chunking configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Initial wait after a change event before the first extraction attempt,
    /// letting the host finish rendering.
    pub settle_delay_ms: u64,
    /// Wait between extraction attempts for one event.
    pub retry_delay_ms: u64,
    /// Extraction attempts per event before the event is dropped.
    pub max_extract_attempts: usize,
    pub chunking: BlockBuilderConfig,
    pub session_url: Option<String>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 4_000,
            retry_delay_ms: 2_000,
            max_extract_attempts: 8,
            chunking: BlockBuilderConfig::default(),
            session_url: None,
        }
    }
}

#[derive(Debug, Default)]
struct PrimingState {
    in_progress: bool,
    current_priming_session: Option<String>,
    last_primed_session: Option<String>,
}

struct MutableState {
    builder: BlockBuilder,
    priming: PrimingState,
    pending_events: Vec<ChangeEvent>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ListenerKind {
    Blocks,
    Messages,
}

struct CoordinatorInner {
    config: StreamConfig,
    indexer: Arc<dyn MessageIndexer>,
    store: Option<Arc<dyn BlockStore>>,
    sink: Arc<dyn StateSink>,
    token: StopToken,
    running: AtomicBool,
    /// Monotonic session-priming generation; async resolutions commit side
    /// effects only while their captured generation is still current.
    generation: AtomicU64,
    state: Mutex<MutableState>,
    save_tx: Mutex<Option<mpsc::UnboundedSender<MemoryBlock>>>,
    block_listeners: Mutex<HashMap<u64, BlockListener>>,
    message_listeners: Mutex<HashMap<u64, MessageListener>>,
    listener_counter: AtomicU64,
    store_failure_logged: AtomicBool,
}

/// Subscription handle; dropping it (or calling `unsubscribe`) removes the
/// listener.
pub struct ListenerGuard {
    inner: Arc<CoordinatorInner>,
    id: u64,
    kind: ListenerKind,
}

impl ListenerGuard {
    pub fn unsubscribe(self) {}
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        match self.kind {
            ListenerKind::Blocks => {
                self.inner
                    .block_listeners
                    .lock()
                    .expect("listener registry lock")
                    .remove(&self.id);
            }
            ListenerKind::Messages => {
                self.inner
                    .message_listeners
                    .lock()
                    .expect("listener registry lock")
                    .remove(&self.id);
            }
        }
    }
}

/// Event-to-block coordinator.
///
/// Owns its paired chunker exclusively; all mutation funnels through the
/// internal state lock between suspension points.
#[derive(Clone)]
pub struct StreamCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl StreamCoordinator {
    pub fn new(
        config: StreamConfig,
        indexer: Arc<dyn MessageIndexer>,
        store: Option<Arc<dyn BlockStore>>,
        sink: Arc<dyn StateSink>,
    ) -> Result<Self> {
        if config.max_extract_attempts == 0 {
            bail!("max_extract_attempts must be >= 1");
        }
        let mut builder = BlockBuilder::new(config.chunking.clone());
        builder.set_session_url(config.session_url.clone());
        Ok(Self {
            inner: Arc::new(CoordinatorInner {
                config,
                indexer,
                store,
                sink,
                token: StopToken::new(),
                running: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                state: Mutex::new(MutableState {
                    builder,
                    priming: PrimingState::default(),
                    pending_events: Vec::new(),
                }),
                save_tx: Mutex::new(None),
                block_listeners: Mutex::new(HashMap::new()),
                message_listeners: Mutex::new(HashMap::new()),
                listener_counter: AtomicU64::new(0),
                store_failure_logged: AtomicBool::new(false),
            }),
        })
    }

    /// Starts the event pump, the save chain, and priming for the current
    /// session. Idempotent while running. Must be called inside a runtime.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.token.reset();
        self.inner.store_failure_logged.store(false, Ordering::SeqCst);

        if let Some(store) = self.inner.store.clone() {
            let (save_tx, mut save_rx) = mpsc::unbounded_channel::<MemoryBlock>();
            *self.inner.save_tx.lock().expect("save chain lock") = Some(save_tx);
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                // Serialized save chain: each save strictly follows the prior
                // one's completion, preserving commit order.
                while let Some(block) = save_rx.recv().await {
                    if let Err(error) = store.save(&block).await {
                        if !inner.store_failure_logged.swap(true, Ordering::SeqCst) {
                            tracing::warn!(
                                error = %error,
                                "block store unavailable; continuing in memory only"
                            );
                        }
                    }
                }
            });
        }

        let mut events = self.inner.indexer.subscribe_events();
        self.inner.indexer.start();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = inner.token.stopped() => break,
                    maybe_event = events.recv() => match maybe_event {
                        Some(event) => CoordinatorInner::handle_incoming(&inner, event),
                        None => break,
                    },
                }
            }
        });

        let session = self.session_url();
        CoordinatorInner::schedule_prime(&self.inner, session);
    }

    /// Requests a cooperative stop: the pump exits, pending events and the
    /// save sender are cleared, and in-flight tasks bail at their next
    /// resumption point.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.token.stop();
        self.inner.indexer.stop();
        {
            let mut state = self.inner.state.lock().expect("coordinator state lock");
            state.pending_events.clear();
            state.priming.in_progress = false;
        }
        *self.inner.save_tx.lock().expect("save chain lock") = None;
        self.inner
            .sink
            .set_state(STREAM_STATE_KEY, json!({ "phase": "stopped" }));
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Drains complete windows (and optionally the partial remainder) out of
    /// the chunker, announcing and persisting the emitted blocks. Returns the
    /// number of blocks emitted.
    pub fn flush(&self, include_partial: bool) -> Result<usize> {
        let blocks = {
            let mut state = self.inner.state.lock().expect("coordinator state lock");
            state.builder.flush(FlushOptions { include_partial })?
        };
        let count = blocks.len();
        CoordinatorInner::dispatch_blocks(&self.inner, blocks);
        Ok(count)
    }

    /// Buffered-but-uncommitted messages.
    pub fn buffer(&self) -> Vec<StructuredMessage> {
        self.inner
            .state
            .lock()
            .expect("coordinator state lock")
            .builder
            .buffer()
            .to_vec()
    }

    pub fn session_url(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .expect("coordinator state lock")
            .builder
            .session_url()
            .map(str::to_string)
    }

    /// Switches sessions. While running this re-primes against the new
    /// session; stale priming resolutions from the previous session are
    /// discarded by the generation guard.
    pub fn set_session_url(&self, next: Option<String>) {
        {
            let state = self.inner.state.lock().expect("coordinator state lock");
            if state.builder.session_url().map(str::to_string) == next {
                return;
            }
        }
        if self.is_running() {
            CoordinatorInner::schedule_prime(&self.inner, next);
        } else {
            let mut state = self.inner.state.lock().expect("coordinator state lock");
            state.builder.set_session_url(next);
        }
    }

    /// Subscribes to committed blocks.
    pub fn subscribe_blocks(
        &self,
        listener: impl Fn(&MemoryBlock) + Send + Sync + 'static,
    ) -> ListenerGuard {
        let id = self
            .inner
            .listener_counter
            .fetch_add(1, Ordering::SeqCst);
        self.inner
            .block_listeners
            .lock()
            .expect("listener registry lock")
            .insert(id, Arc::new(listener));
        ListenerGuard {
            inner: Arc::clone(&self.inner),
            id,
            kind: ListenerKind::Blocks,
        }
    }

    /// Subscribes to committed messages.
    pub fn subscribe_messages(
        &self,
        listener: impl Fn(&StructuredMessage) + Send + Sync + 'static,
    ) -> ListenerGuard {
        let id = self
            .inner
            .listener_counter
            .fetch_add(1, Ordering::SeqCst);
        self.inner
            .message_listeners
            .lock()
            .expect("listener registry lock")
            .insert(id, Arc::new(listener));
        ListenerGuard {
            inner: Arc::clone(&self.inner),
            id,
            kind: ListenerKind::Messages,
        }
    }
}

impl CoordinatorInner {
    fn handle_incoming(inner: &Arc<Self>, event: ChangeEvent) {
        if !inner.running.load(Ordering::SeqCst) {
            return;
        }
        let generation = inner.generation.load(Ordering::SeqCst);
        {
            let mut state = inner.state.lock().expect("coordinator state lock");
            if state.priming.in_progress {
                state.pending_events.push(event);
                return;
            }
        }
        Self::spawn_event_task(inner, event, generation);
    }

    fn spawn_event_task(inner: &Arc<Self>, event: ChangeEvent, generation: u64) {
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            Self::process_event(inner, event, generation).await;
        });
    }

    /// Per-event retry state machine: settle, then extract with bounded
    /// retries, then commit or drop.
    async fn process_event(inner: Arc<Self>, event: ChangeEvent, generation: u64) {
        if !sleep_unless_stopped(
            &inner.token,
            Duration::from_millis(inner.config.settle_delay_ms),
        )
        .await
        {
            return;
        }

        let mut attempt = 1usize;
        loop {
            if !inner.running.load(Ordering::SeqCst)
                || inner.generation.load(Ordering::SeqCst) != generation
            {
                return;
            }

            let extracted = inner.indexer.extract(event.handle).await;
            match extracted {
                Ok(Some(message)) if message.has_renderable_text() => {
                    Self::commit_message(&inner, &event, message, generation);
                    return;
                }
                other => {
                    if attempt >= inner.config.max_extract_attempts {
                        if let Ok(Some(message)) = other {
                            // A structured message exists even though it never
                            // produced renderable text; commit what we have.
                            Self::commit_message(&inner, &event, message, generation);
                        } else {
                            tracing::debug!(
                                handle = event.handle.0,
                                attempts = attempt,
                                "dropping event after exhausting extraction attempts"
                            );
                        }
                        return;
                    }
                    if let Err(error) = other {
                        tracing::debug!(
                            handle = event.handle.0,
                            attempt = attempt,
                            error = %error,
                            "extraction attempt failed"
                        );
                    }
                }
            }

            attempt = attempt.saturating_add(1);
            if !sleep_unless_stopped(
                &inner.token,
                Duration::from_millis(inner.config.retry_delay_ms),
            )
            .await
            {
                return;
            }
        }
    }

    fn commit_message(
        inner: &Arc<Self>,
        event: &ChangeEvent,
        mut message: StructuredMessage,
        generation: u64,
    ) {
        let (announced, blocks) = {
            let mut state = inner.state.lock().expect("coordinator state lock");
            if inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }

            if message.stable_id.is_none() {
                message.stable_id = event.stable_id.clone();
            }
            if message.index == 0 {
                message.index = event.index;
            }
            if message.ordinal == 0 {
                message.ordinal = message
                    .stable_id
                    .as_deref()
                    .and_then(|stable_id| inner.indexer.ordinal_by_id(stable_id))
                    .or_else(|| inner.indexer.ordinal_by_index(event.index))
                    .unwrap_or(0);
            }

            let announced = message.clone();
            let blocks = match state.builder.append(message, AppendOptions::default()) {
                Ok(blocks) => blocks,
                Err(error) => {
                    tracing::warn!(error = %error, "chunker rejected committed message");
                    Vec::new()
                }
            };
            (announced, blocks)
        };

        let listeners: Vec<MessageListener> = inner
            .message_listeners
            .lock()
            .expect("listener registry lock")
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener(&announced);
        }

        Self::dispatch_blocks(inner, blocks);
    }

    fn dispatch_blocks(inner: &Arc<Self>, blocks: Vec<MemoryBlock>) {
        for block in blocks {
            let listeners: Vec<BlockListener> = inner
                .block_listeners
                .lock()
                .expect("listener registry lock")
                .values()
                .cloned()
                .collect();
            for listener in listeners {
                listener(&block);
            }
            let sender = inner
                .save_tx
                .lock()
                .expect("save chain lock")
                .clone();
            if let Some(sender) = sender {
                let _ = sender.send(block);
            }
        }
    }

    /// Starts priming for `session`: bump the generation, queue incoming
    /// events, fetch prior blocks, and apply them only if the generation is
    /// still current when the fetch resolves.
    fn schedule_prime(inner: &Arc<Self>, session: Option<String>) {
        let generation = inner
            .generation
            .fetch_add(1, Ordering::SeqCst)
            .saturating_add(1);
        {
            let mut state = inner.state.lock().expect("coordinator state lock");
            state.priming.in_progress = true;
            state.priming.current_priming_session = session.clone();
            state.builder.set_session_url(session.clone());
        }
        inner.sink.set_state(
            STREAM_STATE_KEY,
            json!({ "phase": "priming", "session": session.clone() }),
        );

        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            let fetched = match (inner.store.as_ref(), session.as_deref()) {
                (Some(store), Some(session_url)) => store.get_by_session(session_url).await,
                _ => Ok(Vec::new()),
            };

            let pending = {
                let mut state = inner.state.lock().expect("coordinator state lock");
                if inner.generation.load(Ordering::SeqCst) != generation {
                    tracing::debug!(
                        session = session.as_deref().unwrap_or(""),
                        superseded_by = state
                            .priming
                            .current_priming_session
                            .as_deref()
                            .unwrap_or(""),
                        "discarding stale priming resolution"
                    );
                    return;
                }
                match fetched {
                    Ok(blocks) => {
                        state.builder.prime_from_blocks(&blocks);
                    }
                    Err(error) => {
                        tracing::warn!(
                            error = %error,
                            "priming fetch failed; treating session as having no prior blocks"
                        );
                    }
                }
                state.priming.in_progress = false;
                let previous =
                    std::mem::replace(&mut state.priming.last_primed_session, session.clone());
                tracing::debug!(
                    session = session.as_deref().unwrap_or(""),
                    previous = previous.as_deref().unwrap_or(""),
                    "session primed"
                );
                std::mem::take(&mut state.pending_events)
            };

            if let Err(error) = inner.indexer.refresh(true).await {
                tracing::debug!(error = %error, "indexer refresh after priming failed");
            }
            inner.sink.set_state(
                STREAM_STATE_KEY,
                json!({ "phase": "ready", "session": session, "queued_events": pending.len() }),
            );
            for event in pending {
                Self::spawn_event_task(&inner, event, generation);
            }
        });
    }
}
