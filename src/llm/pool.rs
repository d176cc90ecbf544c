use std::sync::Arc;
use std::time::Duration;

use rand::RngExt;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::errors::{EngineError, EngineResult, ErrorKind};
use crate::llm::provider::{CompletionRequest, LlmProvider};
use crate::llm::rate_limit::TokenBucket;

/// A unit of LLM work. Every call in the process goes through the pool as one
/// of these; nothing performs completions on its own stack.
#[derive(Debug, Clone)]
pub struct LlmTask {
    pub id: String,
    /// Pipeline stage label (selection, aggregation, classification, …).
    pub purpose: String,
    pub prompt: String,
    pub system: Option<String>,
    /// Model override; pool default applies when absent.
    pub model: Option<String>,
    /// JSON schema the reply must conform to. When set, the pool parses and
    /// validates the reply and returns the JSON value.
    pub schema: Option<serde_json::Value>,
    /// Hard per-attempt deadline.
    pub deadline: Duration,
    pub max_tokens: u32,
    /// Cancellation signal of the owning job. Queued tasks are dropped and
    /// dispatched tasks aborted when it fires.
    pub cancel: CancellationToken,
}

impl LlmTask {
    pub fn new(purpose: &str, prompt: String, deadline: Duration, cancel: CancellationToken) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            purpose: purpose.to_string(),
            prompt,
            system: None,
            model: None,
            schema: None,
            deadline,
            max_tokens: 1024,
            cancel,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Derive the JSON schema handed to an `LlmTask` from the struct its reply is
/// parsed into.
pub fn json_schema_for<T: schemars::JsonSchema>() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(T))
        .unwrap_or_else(|_| serde_json::json!({"type": "object"}))
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub workers: usize,
    pub requests_per_minute: f64,
    pub transient_retries: u32,
    pub schema_retries: u32,
    pub default_model: String,
    pub queue_depth: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            requests_per_minute: 8.0,
            transient_retries: 3,
            schema_retries: 2,
            default_model: "gpt-4o-mini".to_string(),
            queue_depth: 256,
        }
    }
}

struct QueuedTask {
    task: LlmTask,
    reply: oneshot::Sender<EngineResult<serde_json::Value>>,
}

/// Bounded, rate-limited dispatcher for all LLM calls (C2).
///
/// A fixed set of worker tasks consumes a FIFO queue; dequeue is gated by the
/// token bucket. Submitters never touch the provider: `submit` enqueues and
/// hands back a future to await. The queue is bounded, so a saturated pool
/// back-pressures its callers instead of growing memory.
pub struct LlmPool {
    tx: mpsc::Sender<QueuedTask>,
    bucket: Arc<TokenBucket>,
    config: PoolConfig,
}

impl LlmPool {
    pub fn new(provider: Arc<dyn LlmProvider>, config: PoolConfig) -> Self {
        let (tx, rx) = mpsc::channel::<QueuedTask>(config.queue_depth);
        let bucket = Arc::new(TokenBucket::per_minute(config.requests_per_minute));

        // Workers share one receiver; locking per-dequeue preserves FIFO order.
        let rx = Arc::new(Mutex::new(rx));
        for worker_id in 0..config.workers.max(1) {
            let rx = Arc::clone(&rx);
            let provider = Arc::clone(&provider);
            let bucket = Arc::clone(&bucket);
            let config = config.clone();
            tokio::spawn(async move {
                worker_loop(worker_id, rx, provider, bucket, config).await;
            });
        }

        Self { tx, bucket, config }
    }

    /// The pool's token bucket, for adapters that must share the same rate
    /// discipline as completions without going through the queue.
    pub fn bucket(&self) -> Arc<TokenBucket> {
        Arc::clone(&self.bucket)
    }

    pub fn default_model(&self) -> &str {
        &self.config.default_model
    }

    /// Enqueue a task and wait for its result.
    ///
    /// With a schema, the result is the parsed, validated JSON reply;
    /// otherwise the raw text wrapped as a JSON string.
    pub async fn submit(&self, task: LlmTask) -> EngineResult<serde_json::Value> {
        if task.cancel.is_cancelled() {
            return Err(EngineError::cancelled());
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(QueuedTask {
                task,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::internal("llm pool is shut down"))?;
        reply_rx
            .await
            .map_err(|_| EngineError::internal("llm worker dropped the reply channel"))?
    }

    /// `submit` plus a typed parse of the validated reply.
    pub async fn submit_parsed<T: DeserializeOwned>(&self, task: LlmTask) -> EngineResult<T> {
        let value = self.submit(task).await?;
        serde_json::from_value(value)
            .map_err(|e| EngineError::schema("llm_schema", format!("typed parse failed: {e}")))
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<QueuedTask>>>,
    provider: Arc<dyn LlmProvider>,
    bucket: Arc<TokenBucket>,
    config: PoolConfig,
) {
    loop {
        let queued = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };
        let Some(QueuedTask { task, reply }) = queued else {
            debug!("llm worker {worker_id} shutting down (queue closed)");
            return;
        };

        // Drop queued tasks whose job was cancelled while they waited.
        if task.cancel.is_cancelled() {
            let _ = reply.send(Err(EngineError::cancelled()));
            continue;
        }

        debug!(task = %task.id, purpose = %task.purpose, "llm task dispatched");
        let result = run_task(&*provider, &bucket, &config, &task).await;
        if let Err(e) = &result {
            debug!(task = %task.id, purpose = %task.purpose, kind = ?e.kind, "llm task failed");
        }
        // A dropped receiver just means the submitter went away.
        let _ = reply.send(result);
    }
}

async fn run_task(
    provider: &dyn LlmProvider,
    bucket: &TokenBucket,
    config: &PoolConfig,
    task: &LlmTask,
) -> EngineResult<serde_json::Value> {
    let mut transient_attempts: u32 = 0;
    let mut schema_attempts: u32 = 0;
    let mut repair_note: Option<String> = None;

    loop {
        // Every attempt (including retries) consumes a fresh token.
        tokio::select! {
            _ = task.cancel.cancelled() => return Err(EngineError::cancelled()),
            _ = bucket.acquire() => {}
        }

        let mut prompt = task.prompt.clone();
        if let Some(note) = &repair_note {
            prompt.push_str("\n\n");
            prompt.push_str(note);
        }
        let request = CompletionRequest {
            purpose: task.purpose.clone(),
            model: task
                .model
                .clone()
                .unwrap_or_else(|| config.default_model.clone()),
            system: task.system.clone(),
            prompt,
            schema: task.schema.clone(),
            max_tokens: task.max_tokens,
            temperature: 0.2,
        };

        let outcome = tokio::select! {
            _ = task.cancel.cancelled() => {
                // Dropping the in-flight future aborts the HTTP call.
                return Err(EngineError::cancelled());
            }
            r = tokio::time::timeout(task.deadline, provider.complete(&request)) => r,
        };

        let text = match outcome {
            Err(_) => {
                // The attempt never did useful provider work; hand the token back.
                bucket.refund();
                return Err(EngineError::timeout(
                    "llm_timeout",
                    format!("{} exceeded {:?}", task.purpose, task.deadline),
                ));
            }
            Ok(Err(e)) => match e.kind {
                ErrorKind::Transient => {
                    transient_attempts += 1;
                    if transient_attempts > config.transient_retries {
                        return Err(e);
                    }
                    let delay = backoff_with_jitter(transient_attempts);
                    warn!(
                        task = %task.id,
                        attempt = transient_attempts,
                        "transient llm error, retrying in {delay:?}: {}",
                        e.message
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                ErrorKind::Quota => {
                    transient_attempts += 1;
                    if transient_attempts > config.transient_retries {
                        return Err(e);
                    }
                    // Back off one full bucket window before trying again.
                    let delay = bucket.window();
                    warn!(task = %task.id, "llm quota hit, backing off {delay:?}");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                _ => return Err(e),
            },
            Ok(Ok(text)) => text,
        };

        match validate_output(task.schema.as_ref(), &text) {
            Ok(value) => return Ok(value),
            Err(reason) => {
                schema_attempts += 1;
                if schema_attempts > config.schema_retries {
                    return Err(EngineError::schema(
                        "llm_schema",
                        format!("{} reply failed validation: {reason}", task.purpose),
                    ));
                }
                warn!(
                    task = %task.id,
                    attempt = schema_attempts,
                    "llm reply failed schema validation ({reason}), requesting a fix"
                );
                repair_note = Some(format!(
                    "Your previous reply was rejected: {reason}. \
                     Reply again with a single JSON object that strictly matches the schema."
                ));
            }
        }
    }
}

/// Exponential backoff with full jitter, capped at 30s.
pub fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = 500u64.saturating_mul(1u64 << attempt.min(6));
    let capped = base.min(30_000);
    let jittered = rand::rng().random_range(capped / 2..=capped);
    Duration::from_millis(jittered)
}

/// Parse the reply and check it structurally against the task schema.
///
/// The pool enforces that the reply is a JSON object carrying every required
/// property; the caller's typed deserialization is the final gate.
fn validate_output(
    schema: Option<&serde_json::Value>,
    text: &str,
) -> Result<serde_json::Value, String> {
    let Some(schema) = schema else {
        return Ok(serde_json::Value::String(text.to_string()));
    };

    let cleaned = strip_fences(text);
    let value: serde_json::Value = serde_json::from_str(cleaned)
        .or_else(|_| {
            // Salvage the outermost object from replies with leading prose.
            match (cleaned.find('{'), cleaned.rfind('}')) {
                (Some(start), Some(end)) if end > start => {
                    serde_json::from_str(&cleaned[start..=end])
                }
                _ => serde_json::from_str(cleaned),
            }
        })
        .map_err(|e| format!("not valid JSON: {e}"))?;

    let obj = value
        .as_object()
        .ok_or_else(|| "top-level value is not an object".to_string())?;

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            if !obj.contains_key(key) {
                return Err(format!("missing required property '{key}'"));
            }
        }
    }

    Ok(value)
}

fn strip_fences(text: &str) -> &str {
    let t = text.trim();
    let Some(rest) = t.strip_prefix("```") else {
        return t;
    };
    // Drop the fence line (possibly "```json") and the closing fence.
    let rest = rest.split_once('\n').map(|(_, r)| r).unwrap_or(rest);
    rest.trim_end().trim_end_matches("```").trim()
}
