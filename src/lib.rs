pub mod batch;
pub mod core;
pub mod embedding;
pub mod llm;
pub mod progress;
pub mod research;
pub mod scraping;
pub mod similarity;
pub mod vector;

// --- Primary core exports ---
pub use core::errors::{EngineError, EngineResult, ErrorKind};
pub use core::taxonomy::Taxonomy;
pub use core::types;
pub use core::types::*;
pub use core::Engine;

// --- Convenience re-exports ---
pub use batch::{BatchCoordinator, BatchCoordinatorConfig};
pub use embedding::{build_embedding_text, EmbeddingProvider, HttpEmbedder, LocalEmbedder};
pub use llm::{LlmPool, LlmProvider, LlmTask, OpenAiCompatProvider, PoolConfig, TokenBucket};
pub use progress::ProgressBus;
pub use similarity::{SimilarityEngine, SimilarityEngineConfig};
pub use vector::{LanceStore, MemoryStore, VectorFilters, VectorStore};
