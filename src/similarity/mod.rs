pub mod engine;
pub mod scoring;

pub use engine::{company_key, SimilarityEngine, SimilarityEngineConfig};
pub use scoring::{factor_breakdown, overall_score, pair_confidence};
