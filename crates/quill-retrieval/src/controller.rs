//! The scroll/fetch state machine that surfaces a complete transcript.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use serde_json::json;

use quill_chunker::merge_batches;
use quill_core::{sleep_unless_stopped, Channel, StateSink, StopToken, StructuredMessage};

use crate::page_adapter::PageAdapter;
use crate::profiles::{ScrollProfile, ScrollProfileSet};

pub const RETRIEVAL_STATE_KEY: &str = "retrieval";
pub const RETRIEVAL_ERROR_CONTAINER_NOT_FOUND: &str = "container_not_found";
pub const RETRIEVAL_ERROR_EXTRACTION_FAILED: &str = "extraction_failed";

const SCROLL_BOTTOM_TOLERANCE_PX: f64 = 5.0;
const GROWTH_THRESHOLD_PX: f64 = 6.0;
const MIN_FORWARD_STEP_PX: f64 = 200.0;
const FORWARD_STEP_VIEWPORT_FRACTION: f64 = 0.5;

/// What the caller wants collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalMode {
    /// Surface everything the host will yield within guard limits.
    All,
    /// Stop early once this many user messages are known. Only the backward
    /// strategy honors the early stop; the others always collect everything.
    TargetCount(usize),
}

/// Which retrieval strategy a collection ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalStrategy {
    BulkFetch,
    ProgressiveForward,
    BackwardInfinite,
}

impl RetrievalStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            RetrievalStrategy::BulkFetch => "bulk_fetch",
            RetrievalStrategy::ProgressiveForward => "progressive_forward",
            RetrievalStrategy::BackwardInfinite => "backward_infinite",
        }
    }
}

/// Counters and outcome of one collection run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievalStats {
    pub user_message_count: usize,
    pub assistant_message_count: usize,
    pub total_message_count: usize,
    pub session: Option<String>,
    pub error: Option<String>,
    pub strategy: Option<RetrievalStrategy>,
    pub cycles_run: usize,
    pub batches_merged: usize,
    pub extraction_failures: usize,
    pub bulk_fetch_fell_back: bool,
}

/// Collected transcript plus its stats summary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievalCollection {
    pub messages: Vec<StructuredMessage>,
    pub stats: RetrievalStats,
}

/// Retrieval controller construction parameters.
#[derive(Clone)]
pub struct RetrievalConfig {
    pub adapter: Arc<dyn PageAdapter>,
    pub sink: Arc<dyn StateSink>,
    pub profiles: ScrollProfileSet,
    pub profile_name: String,
    /// Multiplier applied to `guard_limit` for the forward strategy, which
    /// takes many small steps per screen of content.
    pub forward_guard_multiplier: usize,
}

impl RetrievalConfig {
    pub fn new(adapter: Arc<dyn PageAdapter>, sink: Arc<dyn StateSink>) -> Self {
        Self {
            adapter,
            sink,
            profiles: ScrollProfileSet::builtin(),
            profile_name: "default".to_string(),
            forward_guard_multiplier: 3,
        }
    }
}

/// Scroll/fetch state machine over a page adapter.
pub struct RetrievalController {
    adapter: Arc<dyn PageAdapter>,
    sink: Arc<dyn StateSink>,
    profiles: ScrollProfileSet,
    profile: ScrollProfile,
    forward_guard_multiplier: usize,
    token: StopToken,
}

impl RetrievalController {
    pub fn new(config: RetrievalConfig) -> Result<Self> {
        if config.forward_guard_multiplier == 0 {
            bail!("forward_guard_multiplier must be >= 1");
        }
        let resolved = config.profiles.resolve(&config.profile_name)?;
        tracing::debug!(
            profile = resolved.profile.name.as_str(),
            reason_code = resolved.reason_code.as_str(),
            "retrieval profile resolved"
        );
        Ok(Self {
            adapter: config.adapter,
            sink: config.sink,
            profiles: config.profiles,
            profile: resolved.profile,
            forward_guard_multiplier: config.forward_guard_multiplier,
            token: StopToken::new(),
        })
    }

    /// Switches the active timing profile by name.
    pub fn set_profile(&mut self, name: &str) -> Result<()> {
        self.profile = self.profiles.resolve(name)?.profile;
        Ok(())
    }

    /// Requests a cooperative stop; in-flight loops exit at their next
    /// resumption point.
    pub fn stop(&self) {
        self.token.stop();
    }

    /// Token shared with any caller that wants to stop a run externally.
    pub fn stop_token(&self) -> StopToken {
        self.token.clone()
    }

    /// Runs one collection. Failures are reported through the sink and the
    /// returned stats; this method does not error.
    pub async fn collect(&self, mode: RetrievalMode) -> RetrievalCollection {
        self.token.reset();
        let mut stats = RetrievalStats {
            session: self.adapter.session_url(),
            ..RetrievalStats::default()
        };

        let messages = match self.run_strategies(mode, &mut stats).await {
            Ok(messages) => messages,
            Err(error) => {
                tracing::warn!(error = %error, "retrieval run failed after scrolling");
                stats
                    .error
                    .get_or_insert_with(|| RETRIEVAL_ERROR_EXTRACTION_FAILED.to_string());
                self.sink.set_state(
                    RETRIEVAL_STATE_KEY,
                    json!({ "phase": "error", "reason": stats.error.clone() }),
                );
                Vec::new()
            }
        };

        for message in &messages {
            match message.channel {
                Channel::User => {
                    stats.user_message_count = stats.user_message_count.saturating_add(1)
                }
                Channel::Assistant => {
                    stats.assistant_message_count =
                        stats.assistant_message_count.saturating_add(1)
                }
                Channel::System => {}
            }
        }
        stats.total_message_count = messages.len();

        self.sink.set_state(
            RETRIEVAL_STATE_KEY,
            json!({
                "phase": if stats.error.is_some() { "failed" } else { "complete" },
                "strategy": stats.strategy.map(RetrievalStrategy::as_str),
                "total_messages": stats.total_message_count,
                "cycles": stats.cycles_run,
            }),
        );

        RetrievalCollection { messages, stats }
    }

    async fn run_strategies(
        &self,
        mode: RetrievalMode,
        stats: &mut RetrievalStats,
    ) -> Result<Vec<StructuredMessage>> {
        if self.adapter.supports_bulk_fetch() {
            stats.strategy = Some(RetrievalStrategy::BulkFetch);
            match self.adapter.bulk_fetch_all().await {
                Ok(messages) => return Ok(messages),
                Err(error) => {
                    tracing::warn!(error = %error, "bulk fetch failed, falling back to scrolling");
                    stats.bulk_fetch_fell_back = true;
                }
            }
        }

        if self.adapter.is_virtualized_renderer() {
            stats.strategy = Some(RetrievalStrategy::ProgressiveForward);
            self.progressive_forward(stats).await
        } else {
            stats.strategy = Some(RetrievalStrategy::BackwardInfinite);
            self.backward_infinite(mode, stats).await
        }
    }

    /// Forward strategy for virtualized renderers: jump to the top, then
    /// step the window down and merge every snapshot seen along the way.
    async fn progressive_forward(
        &self,
        stats: &mut RetrievalStats,
    ) -> Result<Vec<StructuredMessage>> {
        if self.adapter.find_container().await?.is_none() {
            self.record_missing_container(stats);
            return Ok(Vec::new());
        }

        self.adapter.scroll_to(0.0).await?;
        self.settle().await;
        let mut accumulated = self.collect_visible_batch(stats).await?;

        let guard = self
            .profile
            .guard_limit
            .saturating_mul(self.forward_guard_multiplier);
        while !self.token.is_stopped() {
            if stats.cycles_run >= guard {
                tracing::debug!(cycles = stats.cycles_run, "forward guard limit reached");
                break;
            }
            let metrics = self.adapter.scroll_metrics().await?;
            if metrics.at_bottom(SCROLL_BOTTOM_TOLERANCE_PX) {
                break;
            }

            let step = (metrics.viewport_height * FORWARD_STEP_VIEWPORT_FRACTION)
                .max(MIN_FORWARD_STEP_PX);
            self.adapter.scroll_to(metrics.scroll_top + step).await?;
            if !self.settle().await {
                break;
            }

            let batch = self.collect_visible_batch(stats).await?;
            accumulated = merge_batches(&accumulated, &batch);
            stats.batches_merged = stats.batches_merged.saturating_add(1);
            stats.cycles_run = stats.cycles_run.saturating_add(1);
            self.sink.set_state(
                RETRIEVAL_STATE_KEY,
                json!({
                    "phase": "scrolling",
                    "strategy": RetrievalStrategy::ProgressiveForward.as_str(),
                    "cycle": stats.cycles_run,
                    "collected": accumulated.len(),
                }),
            );
        }

        Ok(accumulated)
    }

    /// Backward strategy for hosts that retain content: repeatedly scroll to
    /// the top and await growth until the history is exhausted.
    async fn backward_infinite(
        &self,
        mode: RetrievalMode,
        stats: &mut RetrievalStats,
    ) -> Result<Vec<StructuredMessage>> {
        let Some(initial) = self.adapter.find_container().await? else {
            self.record_missing_container(stats);
            return Ok(Vec::new());
        };

        let mut last_height = initial.scroll_height;
        let mut stable_rounds = 0usize;
        let mut stagnant_rounds = 0usize;
        let mut last_user_count: Option<usize> = None;

        while !self.token.is_stopped() {
            if stats.cycles_run >= self.profile.guard_limit {
                tracing::debug!(cycles = stats.cycles_run, "backward guard limit reached");
                break;
            }

            self.adapter.scroll_to(0.0).await?;
            let grew_signal = self
                .adapter
                .await_growth(self.profile.settle_timeout_ms)
                .await?;
            if self.token.is_stopped() {
                break;
            }

            let metrics = self.adapter.scroll_metrics().await?;
            let growth = metrics.scroll_height - last_height;
            last_height = metrics.scroll_height;
            if !grew_signal || growth < GROWTH_THRESHOLD_PX {
                stable_rounds = stable_rounds.saturating_add(1);
            } else {
                stable_rounds = 0;
            }
            stats.cycles_run = stats.cycles_run.saturating_add(1);

            if stable_rounds >= self.profile.max_stable_rounds {
                break;
            }

            if let RetrievalMode::TargetCount(target) = mode {
                let batch = self.collect_visible_batch(stats).await?;
                let user_count = batch
                    .iter()
                    .filter(|message| message.channel == Channel::User)
                    .count();
                if user_count >= target {
                    tracing::debug!(user_count = user_count, target = target, "target reached");
                    break;
                }
                if last_user_count == Some(user_count) {
                    stagnant_rounds = stagnant_rounds.saturating_add(1);
                    if stagnant_rounds >= self.profile.guard_limit {
                        tracing::debug!(user_count = user_count, "user count stagnated");
                        break;
                    }
                } else {
                    stagnant_rounds = 0;
                }
                last_user_count = Some(user_count);
            }

            self.sink.set_state(
                RETRIEVAL_STATE_KEY,
                json!({
                    "phase": "scrolling",
                    "strategy": RetrievalStrategy::BackwardInfinite.as_str(),
                    "cycle": stats.cycles_run,
                    "stable_rounds": stable_rounds,
                }),
            );
            if !sleep_unless_stopped(
                &self.token,
                Duration::from_millis(self.profile.cycle_delay_ms),
            )
            .await
            {
                break;
            }
        }

        self.collect_visible_batch(stats).await
    }

    /// Extracts every currently-listed message element, skipping failures.
    async fn collect_visible_batch(
        &self,
        stats: &mut RetrievalStats,
    ) -> Result<Vec<StructuredMessage>> {
        let handles = self.adapter.list_visible_messages().await?;
        let mut batch = Vec::with_capacity(handles.len());
        for handle in handles {
            match self.adapter.extract_structured_message(handle).await {
                Ok(Some(message)) => batch.push(message),
                Ok(None) => {}
                Err(error) => {
                    stats.extraction_failures = stats.extraction_failures.saturating_add(1);
                    tracing::debug!(handle = handle.0, error = %error, "extraction failed");
                }
            }
        }
        Ok(batch)
    }

    async fn settle(&self) -> bool {
        sleep_unless_stopped(
            &self.token,
            Duration::from_millis(self.profile.settle_timeout_ms),
        )
        .await
    }

    fn record_missing_container(&self, stats: &mut RetrievalStats) {
        stats.error = Some(RETRIEVAL_ERROR_CONTAINER_NOT_FOUND.to_string());
        tracing::warn!("no scrollable conversation container found");
        self.sink.set_state(
            RETRIEVAL_STATE_KEY,
            json!({ "phase": "error", "reason": RETRIEVAL_ERROR_CONTAINER_NOT_FOUND }),
        );
    }
}
