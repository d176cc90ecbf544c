use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Instant;
use tracing::debug;

use crate::core::errors::{EngineError, EngineResult};
use crate::core::types::{JobProgress, Phase, PhaseProgress, PhaseState, ProgressEvent};

const SHARD_COUNT: usize = 16;

/// In-process pub/sub for research-job progress (C1).
///
/// Jobs are sharded by id so concurrent writers never contend on one lock.
/// Each job carries a broadcast channel with a bounded per-subscriber buffer:
/// a slow subscriber loses the oldest events and receives an explicit loss
/// marker instead of stalling the writer. Terminated jobs are swept after the
/// retention window.
pub struct ProgressBus {
    shards: Vec<RwLock<HashMap<String, Arc<Mutex<JobEntry>>>>>,
    retention: Duration,
    buffer: usize,
}

struct JobEntry {
    job_id: String,
    phases: Vec<Phase>,
    records: HashMap<Phase, PhaseProgress>,
    log: Vec<String>,
    seq: u64,
    started_at: DateTime<Utc>,
    last_ts: DateTime<Utc>,
    terminal: Option<PhaseState>,
    terminal_since: Option<Instant>,
    tx: broadcast::Sender<ProgressEvent>,
}

impl ProgressBus {
    pub fn new(retention: Duration, subscriber_buffer: usize) -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            retention,
            buffer: subscriber_buffer.max(8),
        }
    }

    fn shard(&self, job_id: &str) -> &RwLock<HashMap<String, Arc<Mutex<JobEntry>>>> {
        let mut hasher = DefaultHasher::new();
        job_id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Register a job and its phase list. Fails if the id already exists.
    pub async fn create(&self, job_id: &str, phases: &[Phase]) -> EngineResult<()> {
        let mut shard = self.shard(job_id).write().await;

        // Lazy sweep: evict expired jobs that happen to live in this shard.
        shard.retain(|_, entry| {
            entry
                .try_lock()
                .map(|e| match e.terminal_since {
                    Some(t) => t.elapsed() < self.retention,
                    None => true,
                })
                .unwrap_or(true)
        });

        if shard.contains_key(job_id) {
            return Err(EngineError::input(
                "job_exists",
                format!("job '{job_id}' is already registered"),
            ));
        }

        let now = Utc::now();
        let (tx, _) = broadcast::channel(self.buffer);
        let records = phases
            .iter()
            .map(|p| {
                (
                    *p,
                    PhaseProgress {
                        phase: *p,
                        state: PhaseState::Pending,
                        started_at: None,
                        finished_at: None,
                    },
                )
            })
            .collect();

        shard.insert(
            job_id.to_string(),
            Arc::new(Mutex::new(JobEntry {
                job_id: job_id.to_string(),
                phases: phases.to_vec(),
                records,
                log: Vec::new(),
                seq: 0,
                started_at: now,
                last_ts: now,
                terminal: None,
                terminal_since: None,
                tx,
            })),
        );
        Ok(())
    }

    async fn entry(&self, job_id: &str) -> Option<Arc<Mutex<JobEntry>>> {
        self.shard(job_id).read().await.get(job_id).cloned()
    }

    /// Append a phase transition. Timestamps are monotonic per job even if
    /// the wall clock steps backwards between updates.
    pub async fn update(
        &self,
        job_id: &str,
        phase: Phase,
        state: PhaseState,
        message: Option<String>,
        counters: Option<BTreeMap<String, u64>>,
    ) -> EngineResult<()> {
        let entry = self
            .entry(job_id)
            .await
            .ok_or_else(|| EngineError::input("job_unknown", format!("job '{job_id}' not found")))?;
        let mut e = entry.lock().await;

        if e.terminal.is_some() {
            // Append-only log stays frozen once the job terminated.
            return Ok(());
        }

        e.seq += 1;
        let ts = Utc::now().max(e.last_ts);
        e.last_ts = ts;

        let rec = e.records.entry(phase).or_insert(PhaseProgress {
            phase,
            state: PhaseState::Pending,
            started_at: None,
            finished_at: None,
        });
        if rec.started_at.is_none() && state != PhaseState::Pending {
            rec.started_at = Some(ts);
        }
        if state.is_terminal() {
            rec.finished_at = Some(ts);
        }
        rec.state = state;
        let started_at = rec.started_at.unwrap_or(ts);
        let finished_at = rec.finished_at;

        let line = match &message {
            Some(m) => format!("{} {}: {:?} — {}", ts.to_rfc3339(), phase, state, m),
            None => format!("{} {}: {:?}", ts.to_rfc3339(), phase, state),
        };
        e.log.push(line.clone());

        if phase == Phase::Job && state.is_terminal() {
            e.terminal = Some(state);
            e.terminal_since = Some(Instant::now());
            debug!(job = %e.job_id, ?state, "job reached terminal state");
        }

        let event = ProgressEvent {
            job_id: e.job_id.clone(),
            seq: e.seq,
            phase,
            state,
            started_at,
            finished_at,
            counters,
            message,
            log: Some(line),
            lost: None,
        };
        // No subscribers is fine.
        let _ = e.tx.send(event);
        Ok(())
    }

    /// Synchronous read of current job state.
    pub async fn snapshot(&self, job_id: &str) -> Option<JobProgress> {
        let entry = self.entry(job_id).await?;
        let e = entry.lock().await;
        let phases = e
            .phases
            .iter()
            .filter_map(|p| e.records.get(p).cloned())
            .collect();
        Some(JobProgress {
            job_id: e.job_id.clone(),
            phases,
            log: e.log.clone(),
            terminal: e.terminal,
            started_at: e.started_at,
            updated_at: e.last_ts,
        })
    }

    /// Live event stream for a job, finite once the job terminates.
    ///
    /// The first item is a synthetic snapshot of the job's current state so a
    /// late subscriber knows where things stand. If the subscriber falls more
    /// than the buffer behind, it receives a marker event with `lost` set and
    /// the stream resumes from the oldest retained event.
    pub async fn subscribe(
        &self,
        job_id: &str,
    ) -> Option<impl Stream<Item = ProgressEvent> + Send + Unpin> {
        let entry = self.entry(job_id).await?;
        let (rx, first, done) = {
            let e = entry.lock().await;
            let state = e.terminal.unwrap_or(PhaseState::Running);
            let first = ProgressEvent {
                job_id: e.job_id.clone(),
                seq: e.seq,
                phase: Phase::Job,
                state,
                started_at: e.started_at,
                finished_at: e.terminal.map(|_| e.last_ts),
                counters: None,
                message: Some("snapshot".to_string()),
                log: e.log.last().cloned(),
                lost: None,
            };
            (e.tx.subscribe(), first, e.terminal.is_some())
        };

        let job_id = job_id.to_string();
        let stream = futures::stream::unfold(
            SubState {
                rx,
                pending: Some(first),
                done,
                job_id,
            },
            |mut st| async move {
                if let Some(ev) = st.pending.take() {
                    let terminal = ev.phase == Phase::Job && ev.state.is_terminal();
                    if terminal {
                        st.done = true;
                    }
                    return Some((ev, st));
                }
                if st.done {
                    return None;
                }
                match st.rx.recv().await {
                    Ok(ev) => {
                        if ev.phase == Phase::Job && ev.state.is_terminal() {
                            st.done = true;
                        }
                        Some((ev, st))
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        let marker = ProgressEvent {
                            job_id: st.job_id.clone(),
                            seq: 0,
                            phase: Phase::Job,
                            state: PhaseState::Running,
                            started_at: Utc::now(),
                            finished_at: None,
                            counters: None,
                            message: Some(format!("{n} events dropped (slow subscriber)")),
                            log: None,
                            lost: Some(n),
                        };
                        Some((marker, st))
                    }
                    Err(broadcast::error::RecvError::Closed) => None,
                }
            },
        );
        Some(Box::pin(stream))
    }

    /// Evict jobs whose terminal state is older than the retention window.
    pub async fn gc(&self) {
        for shard in &self.shards {
            let mut shard = shard.write().await;
            shard.retain(|_, entry| {
                entry
                    .try_lock()
                    .map(|e| match e.terminal_since {
                        Some(t) => t.elapsed() < self.retention,
                        None => true,
                    })
                    .unwrap_or(true)
            });
        }
    }

    /// Periodic GC driver; spawned once by the engine container.
    pub fn spawn_janitor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                bus.gc().await;
            }
        })
    }
}

struct SubState {
    rx: broadcast::Receiver<ProgressEvent>,
    pending: Option<ProgressEvent>,
    done: bool,
    job_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn bus() -> Arc<ProgressBus> {
        Arc::new(ProgressBus::new(Duration::from_secs(1800), 256))
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let bus = bus();
        bus.create("j1", &Phase::PIPELINE).await.unwrap();
        assert!(bus.create("j1", &Phase::PIPELINE).await.is_err());
    }

    #[tokio::test]
    async fn test_update_unknown_job_rejected() {
        let bus = bus();
        let err = bus
            .update("nope", Phase::LinkDiscovery, PhaseState::Running, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code, "job_unknown");
    }

    #[tokio::test]
    async fn test_events_arrive_in_order_with_monotonic_timestamps() {
        let bus = bus();
        bus.create("j2", &Phase::PIPELINE).await.unwrap();
        let stream = bus.subscribe("j2").await.unwrap();

        for phase in [Phase::LinkDiscovery, Phase::PageSelection] {
            bus.update("j2", phase, PhaseState::Running, None, None)
                .await
                .unwrap();
            bus.update("j2", phase, PhaseState::Completed, None, None)
                .await
                .unwrap();
        }
        bus.update("j2", Phase::Job, PhaseState::Completed, None, None)
            .await
            .unwrap();

        let events: Vec<ProgressEvent> = stream.collect().await;
        // snapshot + 4 phase events + terminal
        assert_eq!(events.len(), 6);

        let mut last_seq = 0;
        let mut last_ts = events[0].started_at;
        for ev in events.iter().skip(1) {
            assert!(ev.seq > last_seq);
            assert!(ev.started_at >= last_ts || ev.finished_at.is_some());
            last_seq = ev.seq;
            last_ts = ev.started_at.max(last_ts);
        }
        let terminal = events.last().unwrap();
        assert_eq!(terminal.phase, Phase::Job);
        assert_eq!(terminal.state, PhaseState::Completed);
    }

    #[tokio::test]
    async fn test_exactly_one_terminal_event() {
        let bus = bus();
        bus.create("j3", &Phase::PIPELINE).await.unwrap();
        let stream = bus.subscribe("j3").await.unwrap();

        bus.update("j3", Phase::Job, PhaseState::Failed, Some("boom".into()), None)
            .await
            .unwrap();
        // Updates after terminal are ignored.
        bus.update("j3", Phase::Job, PhaseState::Completed, None, None)
            .await
            .unwrap();

        let events: Vec<ProgressEvent> = stream.collect().await;
        let terminals: Vec<_> = events
            .iter()
            .filter(|e| e.phase == Phase::Job && e.state.is_terminal())
            .collect();
        assert_eq!(terminals.len(), 1);
        assert_eq!(terminals[0].state, PhaseState::Failed);
    }

    #[tokio::test]
    async fn test_slow_subscriber_gets_loss_marker() {
        let bus = Arc::new(ProgressBus::new(Duration::from_secs(1800), 8));
        bus.create("j4", &Phase::PIPELINE).await.unwrap();
        let stream = bus.subscribe("j4").await.unwrap();

        // Flood well past the 8-event buffer without consuming.
        for i in 0..40 {
            bus.update(
                "j4",
                Phase::ContentExtraction,
                PhaseState::Running,
                Some(format!("page {i}")),
                None,
            )
            .await
            .unwrap();
        }
        bus.update("j4", Phase::Job, PhaseState::Completed, None, None)
            .await
            .unwrap();

        let events: Vec<ProgressEvent> = stream.collect().await;
        assert!(
            events.iter().any(|e| e.lost.unwrap_or(0) > 0),
            "expected a loss marker, got {} events",
            events.len()
        );
        assert_eq!(events.last().unwrap().state, PhaseState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_evicts_terminated_jobs() {
        let bus = Arc::new(ProgressBus::new(Duration::from_secs(60), 256));
        bus.create("j5", &Phase::PIPELINE).await.unwrap();
        bus.update("j5", Phase::Job, PhaseState::Completed, None, None)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;
        bus.gc().await;
        assert!(bus.snapshot("j5").await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_after_terminal_is_finite() {
        let bus = bus();
        bus.create("j6", &Phase::PIPELINE).await.unwrap();
        bus.update("j6", Phase::Job, PhaseState::Cancelled, None, None)
            .await
            .unwrap();

        let events: Vec<ProgressEvent> = bus.subscribe("j6").await.unwrap().collect().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].state, PhaseState::Cancelled);
    }
}
