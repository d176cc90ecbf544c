//! Batch enrichment coordinator (C12).
//!
//! Drives the research orchestrator across many rows with adaptive
//! concurrency: ramp up after sustained success, collapse to a single lane
//! and cool down on transport (SSL/connection) errors. Row outcomes are
//! cached by normalized website so a resumed batch skips finished work.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::app_state::Engine;
use crate::core::errors::EngineError;
use crate::core::types::{
    BatchProgress, BatchReport, BatchRequest, BatchRow, Phase, PhaseState, ResearchRequest,
    RowOutcome, RowStatus, ScrapeStatus,
};
use crate::llm::backoff_with_jitter;

#[derive(Clone, Debug)]
pub struct BatchCoordinatorConfig {
    pub concurrency_start: usize,
    pub concurrency_max: usize,
    pub cooldown: Duration,
    pub success_streak: usize,
    pub row_retries: u32,
    pub resume_ttl: Duration,
}

impl Default for BatchCoordinatorConfig {
    fn default() -> Self {
        Self {
            concurrency_start: 3,
            concurrency_max: 10,
            cooldown: Duration::from_secs(60),
            success_streak: 5,
            row_retries: 3,
            resume_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Adaptive-concurrency state machine. All transitions happen under one
/// mutex; the waiters are woken through a `Notify`.
#[derive(Debug)]
pub(crate) struct AdaptiveState {
    pub current: usize,
    pub in_flight: usize,
    pub streak: usize,
    pub cooldown_until: Option<Instant>,
}

impl AdaptiveState {
    fn new(start: usize) -> Self {
        Self {
            current: start.max(1),
            in_flight: 0,
            streak: 0,
            cooldown_until: None,
        }
    }

    /// Concurrency limit right now: 1 while a cooldown is active.
    pub(crate) fn effective_limit(&self, now: Instant) -> usize {
        match self.cooldown_until {
            Some(until) if now < until => 1,
            _ => self.current,
        }
    }

    pub(crate) fn on_success(&mut self, config: &BatchCoordinatorConfig, now: Instant) {
        if self.cooldown_until.is_some_and(|until| now >= until) {
            self.cooldown_until = None;
        }
        if self.cooldown_until.is_some() {
            return;
        }
        self.streak += 1;
        if self.streak >= config.success_streak && self.current < config.concurrency_max {
            self.current += 1;
            self.streak = 0;
        }
    }

    pub(crate) fn on_transport_error(&mut self, config: &BatchCoordinatorConfig, now: Instant) {
        self.current = 1;
        self.streak = 0;
        self.cooldown_until = Some(now + config.cooldown);
    }

    pub(crate) fn on_other_failure(&mut self) {
        self.streak = 0;
    }
}

struct Counters {
    processed: usize,
    successful: usize,
    failed: usize,
    current_message: String,
}

pub struct BatchCoordinator {
    engine: Arc<Engine>,
    config: BatchCoordinatorConfig,
    state: Arc<Mutex<AdaptiveState>>,
    notify: Arc<Notify>,
    resume_cache: moka::future::Cache<String, RowOutcome>,
}

impl BatchCoordinator {
    pub fn new(engine: Arc<Engine>, config: BatchCoordinatorConfig) -> Self {
        let state = Arc::new(Mutex::new(AdaptiveState::new(config.concurrency_start)));
        let resume_cache = moka::future::Cache::builder()
            .max_capacity(100_000)
            .time_to_live(config.resume_ttl)
            .build();
        Self {
            engine,
            config,
            state,
            notify: Arc::new(Notify::new()),
            resume_cache,
        }
    }

    /// Process every row, streaming aggregate progress into `progress` when
    /// supplied. Individual row failures never fail the batch.
    pub async fn run(
        &self,
        request: BatchRequest,
        cancel: &CancellationToken,
        progress: Option<mpsc::Sender<BatchProgress>>,
    ) -> BatchReport {
        let started = Instant::now();
        let total = request.rows.len();
        let batch_job_id = format!("batch-{}", uuid::Uuid::new_v4());

        if let Some(start) = request.concurrency {
            let mut state = self.state.lock().expect("batch state lock");
            state.current = start.clamp(1, self.config.concurrency_max);
        }

        // Batch-level progress rides the same bus as per-job events.
        let _ = self
            .engine
            .progress
            .create(&batch_job_id, &[Phase::Job])
            .await;

        let counters = Arc::new(Mutex::new(Counters {
            processed: 0,
            successful: 0,
            failed: 0,
            current_message: String::new(),
        }));

        info!(
            "batch started: {} rows (concurrency {} → max {})",
            total,
            self.state.lock().expect("batch state lock").current,
            self.config.concurrency_max
        );

        let mut outcomes: Vec<(usize, RowOutcome)> = stream::iter(
            request.rows.iter().cloned().enumerate(),
        )
        .map(|(index, row)| {
            let counters = Arc::clone(&counters);
            let progress = progress.clone();
            let batch_job_id = batch_job_id.clone();
            async move {
                let outcome = self.process_row(&row, request.resume, cancel).await;

                let snapshot = {
                    let mut c = counters.lock().expect("batch counters lock");
                    c.processed += 1;
                    match outcome.status {
                        RowStatus::Success | RowStatus::Partial => c.successful += 1,
                        RowStatus::Failed => c.failed += 1,
                        RowStatus::SkippedCached => {}
                    }
                    c.current_message = match &outcome.error {
                        Some(e) => format!("{}: {}", outcome.name, e),
                        None => format!("{}: {:?}", outcome.name, outcome.status),
                    };
                    let elapsed_h = started.elapsed().as_secs_f64() / 3600.0;
                    BatchProgress {
                        processed: c.processed,
                        successful: c.successful,
                        failed: c.failed,
                        current_message: c.current_message.clone(),
                        rate_per_hour: if elapsed_h > 0.0 {
                            c.processed as f64 / elapsed_h
                        } else {
                            0.0
                        },
                    }
                };

                if let Some(tx) = &progress {
                    let _ = tx.send(snapshot.clone()).await;
                }
                let _ = self
                    .engine
                    .progress
                    .update(
                        &batch_job_id,
                        Phase::Job,
                        PhaseState::Running,
                        Some(snapshot.current_message.clone()),
                        Some(BTreeMap::from([
                            ("processed".to_string(), snapshot.processed as u64),
                            ("successful".to_string(), snapshot.successful as u64),
                            ("failed".to_string(), snapshot.failed as u64),
                        ])),
                    )
                    .await;

                (index, outcome)
            }
        })
        .buffer_unordered(self.config.concurrency_max.max(1))
        .collect()
        .await;

        outcomes.sort_by_key(|(i, _)| *i);
        let rows: Vec<RowOutcome> = outcomes.into_iter().map(|(_, o)| o).collect();

        let successful = rows
            .iter()
            .filter(|r| matches!(r.status, RowStatus::Success | RowStatus::Partial))
            .count();
        let failed = rows.iter().filter(|r| r.status == RowStatus::Failed).count();
        let skipped = rows
            .iter()
            .filter(|r| r.status == RowStatus::SkippedCached)
            .count();

        let terminal = if cancel.is_cancelled() {
            PhaseState::Cancelled
        } else {
            PhaseState::Completed
        };
        let _ = self
            .engine
            .progress
            .update(
                &batch_job_id,
                Phase::Job,
                terminal,
                Some(format!("{successful} ok, {failed} failed, {skipped} skipped")),
                None,
            )
            .await;

        info!(
            "batch finished: {}/{} ok, {} failed, {} skipped in {:.1}s",
            successful,
            total,
            failed,
            skipped,
            started.elapsed().as_secs_f64()
        );

        BatchReport {
            total,
            successful,
            failed,
            skipped,
            total_duration_ms: started.elapsed().as_millis() as u64,
            rows,
        }
    }

    async fn process_row(
        &self,
        row: &BatchRow,
        resume: bool,
        cancel: &CancellationToken,
    ) -> RowOutcome {
        let row_started = Instant::now();
        let key = row_key(row);

        if resume {
            if let Some(prev) = self.resume_cache.get(&key).await {
                return RowOutcome {
                    status: RowStatus::SkippedCached,
                    duration_ms: 0,
                    ..prev
                };
            }
        }

        let mut attempts: u32 = 0;
        let outcome = loop {
            if cancel.is_cancelled() {
                break RowOutcome {
                    name: row.name.clone(),
                    website: row.website.clone(),
                    status: RowStatus::Failed,
                    record_id: None,
                    error: Some("batch cancelled".to_string()),
                    attempts,
                    duration_ms: row_started.elapsed().as_millis() as u64,
                };
            }

            if !self.acquire_slot(cancel).await {
                continue; // cancellation is observed at the top of the loop
            }
            attempts += 1;

            let request = ResearchRequest {
                name: row.name.clone(),
                website: row.website.clone(),
                options: None,
            };
            let result = self.engine.research(request).await;
            self.release_slot(&result);

            match result {
                Ok(record) => {
                    let status = match record.scrape_status {
                        ScrapeStatus::Success => RowStatus::Success,
                        _ => RowStatus::Partial,
                    };
                    break RowOutcome {
                        name: row.name.clone(),
                        website: row.website.clone(),
                        status,
                        record_id: Some(record.id),
                        error: record.scrape_error,
                        attempts,
                        duration_ms: row_started.elapsed().as_millis() as u64,
                    };
                }
                Err(e) => {
                    let retryable = e.kind.retryable() && attempts <= self.config.row_retries;
                    if retryable {
                        let delay = backoff_with_jitter(attempts);
                        warn!(
                            "row '{}' attempt {} failed ({}), retrying in {delay:?}",
                            row.name, attempts, e.code
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    break RowOutcome {
                        name: row.name.clone(),
                        website: row.website.clone(),
                        status: RowStatus::Failed,
                        record_id: None,
                        error: Some(e.to_string()),
                        attempts,
                        duration_ms: row_started.elapsed().as_millis() as u64,
                    };
                }
            }
        };

        if matches!(outcome.status, RowStatus::Success | RowStatus::Partial) {
            self.resume_cache.insert(key, outcome.clone()).await;
        }
        outcome
    }

    /// Wait for an adaptive-concurrency slot. The limit shrinks to one lane
    /// during a transport cooldown. Returns false (no slot taken) when the
    /// batch is cancelled while waiting.
    async fn acquire_slot(&self, cancel: &CancellationToken) -> bool {
        loop {
            {
                let mut state = self.state.lock().expect("batch state lock");
                if state.in_flight < state.effective_limit(Instant::now()) {
                    state.in_flight += 1;
                    return true;
                }
            }
            if cancel.is_cancelled() {
                return false;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                // Cooldown expiry is time-driven, not notify-driven.
                _ = tokio::time::sleep(Duration::from_millis(250)) => {}
            }
        }
    }

    fn release_slot(&self, result: &Result<crate::core::types::CompanyRecord, EngineError>) {
        let mut state = self.state.lock().expect("batch state lock");
        state.in_flight = state.in_flight.saturating_sub(1);
        let now = Instant::now();
        match result {
            Ok(_) => state.on_success(&self.config, now),
            Err(e) if e.is_transport() => {
                warn!("transport error — collapsing batch concurrency to 1 for cooldown");
                state.on_transport_error(&self.config, now);
            }
            Err(_) => state.on_other_failure(),
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// Current in-flight row count (test and metrics hook).
    pub fn in_flight(&self) -> usize {
        self.state.lock().expect("batch state lock").in_flight
    }
}

/// Resume-cache key: normalized website host, falling back to the name.
pub fn row_key(row: &BatchRow) -> String {
    if let Some(website) = row.website.as_deref() {
        let with_scheme = if website.contains("://") {
            website.to_string()
        } else {
            format!("https://{website}")
        };
        if let Ok(url) = url::Url::parse(&with_scheme) {
            if let Some(host) = url.host_str() {
                return host.trim_start_matches("www.").to_ascii_lowercase();
            }
        }
    }
    row.name.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BatchCoordinatorConfig {
        BatchCoordinatorConfig::default()
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramp_up_after_success_streak() {
        let cfg = config();
        let mut state = AdaptiveState::new(3);
        let now = Instant::now();

        for _ in 0..cfg.success_streak {
            state.on_success(&cfg, now);
        }
        assert_eq!(state.current, 4);
        assert_eq!(state.streak, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramp_caps_at_max() {
        let cfg = config();
        let mut state = AdaptiveState::new(cfg.concurrency_max);
        let now = Instant::now();
        for _ in 0..cfg.success_streak * 3 {
            state.on_success(&cfg, now);
        }
        assert_eq!(state.current, cfg.concurrency_max);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_collapses_to_one() {
        let cfg = config();
        let mut state = AdaptiveState::new(5);
        let now = Instant::now();

        state.on_transport_error(&cfg, now);
        assert_eq!(state.current, 1);
        assert_eq!(state.effective_limit(now), 1);

        // Successes during the cooldown do not ramp.
        state.on_success(&cfg, now + Duration::from_secs(1));
        assert_eq!(state.current, 1);

        // After the cooldown the limit is back to `current` and successes
        // ramp again.
        let after = now + cfg.cooldown + Duration::from_secs(1);
        assert_eq!(state.effective_limit(after), 1);
        for _ in 0..cfg.success_streak {
            state.on_success(&cfg, after);
        }
        assert_eq!(state.current, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_failures_only_reset_streak() {
        let cfg = config();
        let mut state = AdaptiveState::new(4);
        let now = Instant::now();
        state.on_success(&cfg, now);
        state.on_other_failure();
        assert_eq!(state.current, 4);
        assert_eq!(state.streak, 0);
        assert_eq!(state.effective_limit(now), 4);
    }

    #[test]
    fn test_row_key_normalizes_website() {
        let row = BatchRow {
            name: "Acme".into(),
            website: Some("https://www.Acme.com/about".into()),
        };
        assert_eq!(row_key(&row), "acme.com");

        let row = BatchRow {
            name: "Acme".into(),
            website: Some("acme.com".into()),
        };
        assert_eq!(row_key(&row), "acme.com");

        let row = BatchRow {
            name: " Acme Inc ".into(),
            website: None,
        };
        assert_eq!(row_key(&row), "acme inc");
    }
}
