//! End-to-end scenarios: retrieval to chunker to store, and a live
//! coordinator session that survives a restart.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use quill_chunker::{BlockBuilder, BlockBuilderConfig, FlushOptions};
use quill_core::{Channel, ChangeEvent, NodeHandle, NullStateSink, StructuredMessage};
use quill_retrieval::{
    PageAdapter, RetrievalConfig, RetrievalController, RetrievalMode, ScrollMetrics,
    ScrollProfileSet,
};
use quill_stream::{
    BlockStore, JsonlBlockStore, MessageIndexer, StreamConfig, StreamCoordinator,
};

const ROW_HEIGHT: f64 = 100.0;

fn turn(ordinal: u64, text: &str) -> StructuredMessage {
    let mut message = StructuredMessage::text(Channel::User, "alice", text);
    message.stable_id = Some(format!("id-{ordinal}"));
    message.ordinal = ordinal;
    message.index = ordinal;
    message
}

/// Virtualized host page: only rows under the viewport exist in the tree.
struct VirtualizedPage {
    messages: Vec<StructuredMessage>,
    scroll_top: Mutex<f64>,
    viewport: f64,
}

impl VirtualizedPage {
    fn new(total: u64) -> Self {
        Self {
            messages: (1..=total)
                .map(|ordinal| turn(ordinal, &format!("turn number {ordinal}")))
                .collect(),
            scroll_top: Mutex::new(0.0),
            viewport: 400.0,
        }
    }

    fn metrics(&self) -> ScrollMetrics {
        ScrollMetrics {
            scroll_top: *self.scroll_top.lock().expect("scroll lock"),
            scroll_height: self.messages.len() as f64 * ROW_HEIGHT,
            viewport_height: self.viewport,
        }
    }
}

#[async_trait]
impl PageAdapter for VirtualizedPage {
    async fn find_container(&self) -> Result<Option<ScrollMetrics>> {
        Ok(Some(self.metrics()))
    }

    async fn scroll_metrics(&self) -> Result<ScrollMetrics> {
        Ok(self.metrics())
    }

    async fn scroll_to(&self, offset_px: f64) -> Result<()> {
        let clamped = offset_px.clamp(0.0, self.metrics().max_scroll_top());
        *self.scroll_top.lock().expect("scroll lock") = clamped;
        Ok(())
    }

    async fn await_growth(&self, _timeout_ms: u64) -> Result<bool> {
        Ok(false)
    }

    async fn list_visible_messages(&self) -> Result<Vec<NodeHandle>> {
        let scroll_top = *self.scroll_top.lock().expect("scroll lock");
        Ok(self
            .messages
            .iter()
            .enumerate()
            .filter(|(position, _)| {
                let row_top = *position as f64 * ROW_HEIGHT;
                row_top + ROW_HEIGHT > scroll_top && row_top < scroll_top + self.viewport
            })
            .map(|(position, _)| NodeHandle(position as u64))
            .collect())
    }

    async fn extract_structured_message(
        &self,
        handle: NodeHandle,
    ) -> Result<Option<StructuredMessage>> {
        Ok(self.messages.get(handle.0 as usize).cloned())
    }

    fn is_virtualized_renderer(&self) -> bool {
        true
    }

    fn session_url(&self) -> Option<String> {
        Some("https://example.test/c/roundtrip".to_string())
    }
}

#[derive(Default)]
struct ScriptedIndexer {
    tx: Mutex<Option<mpsc::UnboundedSender<ChangeEvent>>>,
    extractions: Mutex<HashMap<u64, VecDeque<Option<StructuredMessage>>>>,
    started: AtomicBool,
}

impl ScriptedIndexer {
    fn script(&self, handle: u64, attempts: Vec<Option<StructuredMessage>>) {
        self.extractions
            .lock()
            .expect("extractions lock")
            .insert(handle, attempts.into());
    }

    fn send(&self, event: ChangeEvent) {
        let guard = self.tx.lock().expect("tx lock");
        guard
            .as_ref()
            .expect("subscribed sender")
            .send(event)
            .expect("send event");
    }
}

#[async_trait]
impl MessageIndexer for ScriptedIndexer {
    fn subscribe_events(&self) -> mpsc::UnboundedReceiver<ChangeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.tx.lock().expect("tx lock") = Some(tx);
        rx
    }

    async fn refresh(&self, _immediate: bool) -> Result<()> {
        Ok(())
    }

    fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    async fn extract(&self, handle: NodeHandle) -> Result<Option<StructuredMessage>> {
        let mut extractions = self.extractions.lock().expect("extractions lock");
        let Some(queue) = extractions.get_mut(&handle.0) else {
            return Ok(None);
        };
        if queue.len() > 1 {
            Ok(queue.pop_front().flatten())
        } else {
            Ok(queue.front().cloned().flatten())
        }
    }

    fn ordinal_by_index(&self, index: u64) -> Option<u64> {
        (index > 0).then_some(index)
    }

    fn ordinal_by_id(&self, _stable_id: &str) -> Option<u64> {
        None
    }
}

fn change_event(handle: u64, index: u64) -> ChangeEvent {
    ChangeEvent {
        handle: NodeHandle(handle),
        stable_id: None,
        index,
        channel_hint: None,
        timestamp_unix_ms: 1_000,
    }
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

fn fast_profiles() -> (ScrollProfileSet, tempfile::TempDir) {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let path = tempdir.path().join("profiles.json");
    std::fs::write(
        &path,
        r#"{
  "schema_version": 1,
  "profiles": [
    {
      "name": "integration",
      "settle_timeout_ms": 1,
      "cycle_delay_ms": 1,
      "guard_limit": 16,
      "max_stable_rounds": 2
    }
  ]
}"#,
    )
    .expect("write profiles");
    let mut set = ScrollProfileSet::builtin();
    set.load_overrides(&path).expect("load overrides");
    (set, tempdir)
}

#[tokio::test]
async fn integration_collect_chunk_and_persist_roundtrip() {
    let (profiles, _profiles_dir) = fast_profiles();
    let adapter = Arc::new(VirtualizedPage::new(12));
    let mut config = RetrievalConfig::new(adapter, Arc::new(NullStateSink));
    config.profiles = profiles;
    config.profile_name = "integration".to_string();
    let controller = RetrievalController::new(config).expect("controller");

    let collection = controller.collect(RetrievalMode::All).await;
    assert_eq!(collection.stats.error, None);
    assert_eq!(collection.stats.total_message_count, 12);
    assert_eq!(collection.stats.user_message_count, 12);

    let mut chunker = BlockBuilder::new(BlockBuilderConfig {
        block_size: 5,
        overlap: 2,
        exclude_narration: false,
    });
    chunker.set_session_url(collection.stats.session.clone());
    let mut blocks = chunker
        .append_many(collection.messages)
        .expect("append transcript");
    blocks.extend(
        chunker
            .flush(FlushOptions {
                include_partial: true,
            })
            .expect("flush remainder"),
    );
    let ranges: Vec<(u64, u64)> = blocks.iter().map(|block| block.ordinal_range).collect();
    assert_eq!(ranges, vec![(1, 5), (4, 8), (7, 11), (10, 12)]);

    let store_dir = tempfile::tempdir().expect("store dir");
    let store = JsonlBlockStore::new(store_dir.path());
    for block in &blocks {
        store.save(block).await.expect("save block");
    }

    let reloaded = store
        .get_by_session("https://example.test/c/roundtrip")
        .await
        .expect("reload");
    assert_eq!(reloaded.len(), 4);
    for (left, right) in reloaded.iter().zip(reloaded.iter().skip(1)) {
        // Consecutive blocks overlap by the configured two ordinals.
        assert_eq!(left.ordinal_range.1.saturating_sub(1), right.ordinal_range.0);
    }
    let stats = store.get_stats().await.expect("stats");
    assert_eq!(stats.total_blocks, 4);
    assert_eq!(stats.total_messages, 18);
}

#[tokio::test]
async fn integration_coordinator_restart_resumes_without_renumbering() {
    let store_dir = tempfile::tempdir().expect("store dir");
    let store = Arc::new(JsonlBlockStore::new(store_dir.path()));
    let session = "https://example.test/c/resume";

    let stream_config = |session_url: &str| StreamConfig {
        settle_delay_ms: 1,
        retry_delay_ms: 1,
        max_extract_attempts: 4,
        chunking: BlockBuilderConfig {
            block_size: 2,
            overlap: 0,
            exclude_narration: false,
        },
        session_url: Some(session_url.to_string()),
    };

    // First run: four turns, two full blocks persisted.
    let indexer = Arc::new(ScriptedIndexer::default());
    let coordinator = StreamCoordinator::new(
        stream_config(session),
        indexer.clone(),
        Some(store.clone()),
        Arc::new(NullStateSink),
    )
    .expect("first coordinator");
    let committed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = Arc::clone(&committed);
    let _messages = coordinator.subscribe_messages(move |_message| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    coordinator.start();
    assert!(indexer.started.load(Ordering::SeqCst));
    for position in 1u64..=4 {
        indexer.script(position, vec![Some(turn(position, &format!("m{position}")))]);
        indexer.send(change_event(position, position));
        let counter = Arc::clone(&committed);
        let expected = position as usize;
        wait_until("first-run commits", move || {
            counter.load(Ordering::SeqCst) >= expected
        })
        .await;
    }
    let store_path = store.path().to_path_buf();
    wait_until("two persisted blocks", move || {
        persisted_block_count(&store_path) >= 2
    })
    .await;
    coordinator.stop();
    assert!(!indexer.started.load(Ordering::SeqCst));

    // Second run against the same store: the replayed turn is suppressed and
    // a new turn continues the ordinal sequence.
    let indexer = Arc::new(ScriptedIndexer::default());
    let coordinator = StreamCoordinator::new(
        stream_config(session),
        indexer.clone(),
        Some(store.clone()),
        Arc::new(NullStateSink),
    )
    .expect("second coordinator");
    coordinator.start();

    indexer.script(1, vec![Some(turn(2, "m2"))]);
    indexer.send(change_event(1, 0));
    indexer.script(2, vec![Some(new_unnumbered_turn("a fifth turn", "id-5"))]);
    indexer.send(change_event(2, 0));

    let view = coordinator.clone();
    wait_until("resumed commit", move || view.buffer().len() == 1).await;
    let buffer = coordinator.buffer();
    assert_eq!(buffer[0].ordinal, 5);

    let flushed = coordinator.flush(true).expect("flush");
    assert_eq!(flushed, 1);
    let store_path = store.path().to_path_buf();
    wait_until("third persisted block", move || {
        persisted_block_count(&store_path) >= 3
    })
    .await;

    let blocks = store.get_by_session(session).await.expect("reload");
    assert_eq!(blocks.len(), 3);
    assert_eq!(blocks[0].ordinal_range, (1, 2));
    assert_eq!(blocks[1].ordinal_range, (3, 4));
    assert_eq!(blocks[2].ordinal_range, (5, 5));
    coordinator.stop();
}

fn new_unnumbered_turn(text: &str, stable_id: &str) -> StructuredMessage {
    let mut message = StructuredMessage::text(Channel::User, "alice", text);
    message.stable_id = Some(stable_id.to_string());
    message
}

fn persisted_block_count(path: &std::path::Path) -> usize {
    std::fs::read_to_string(path)
        .map(|raw| raw.lines().filter(|line| !line.trim().is_empty()).count())
        .unwrap_or(0)
}
