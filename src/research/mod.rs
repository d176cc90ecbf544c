pub mod aggregate;
pub mod classify;
pub mod extract;
pub mod orchestrator;
pub mod select;

pub use extract::{ExtractionReport, PageContent};
pub use orchestrator::normalize_website;
pub use select::{heuristic_select, PageSelection, SelectionMethod};
