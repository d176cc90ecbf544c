pub mod pool;
pub mod provider;
pub mod rate_limit;

pub use pool::{backoff_with_jitter, json_schema_for, LlmPool, LlmTask, PoolConfig};
pub use provider::{CompletionRequest, LlmProvider, OpenAiCompatProvider};
pub use rate_limit::TokenBucket;
