//! Peon data models — repositories, builds and their steps.

pub mod build;
pub mod repo;
pub mod step;

pub use build::{Build, BuildStatus, RefMode};
pub use repo::Repo;
pub use step::{Step, StepStatus};

/// Error returned when a stored enum column holds an unknown value.
#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}
