//! Per-item harvesting.
//!
//! - **Traits**: [`EnrichmentStep`] and the [`StepContext`] it sees
//! - **Pipeline**: [`ItemProcessor`] runs the steps for one item inside a
//!   scoped [`ItemWorkspace`]

pub mod pipeline;
pub mod traits;

pub use pipeline::{ItemProcessor, ItemWorkspace};
pub use traits::{EnrichmentStep, StepContext};
