//! Build status persistence.
//!
//! [`Datastore`] is the seam between the status service and the storage
//! backend; production uses PostgreSQL, tests an in-memory store.

#[cfg(test)]
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::build::{BuildChanges, ImportedBuild};
use crate::models::{Build, BuildStatus, RefMode, Repo, Step, StepStatus, UnknownVariant};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("database pool error: {0}")]
    Pool(String),
    #[error("build {0} not found")]
    BuildNotFound(i64),
    #[error("build {id} cannot go from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: BuildStatus,
        to: BuildStatus,
    },
    #[error("corrupt record: {0}")]
    Corrupt(#[from] UnknownVariant),
}

#[async_trait]
pub trait Datastore: Send + Sync {
    async fn get_or_create_repo(&self, name: &str, url: &str) -> Result<Repo, StoreError>;

    async fn get_repos(&self) -> Result<Vec<Repo>, StoreError>;

    /// Insert a `pending` build and return its id.
    async fn create_build(
        &self,
        repo_id: i64,
        ref_mode: RefMode,
        ref_name: &str,
        sha: &str,
    ) -> Result<i64, StoreError>;

    async fn update_build(
        &self,
        id: i64,
        status: BuildStatus,
        extra: Option<serde_json::Value>,
    ) -> Result<(), StoreError>;

    async fn get_build(&self, id: i64) -> Result<Option<Build>, StoreError>;

    /// Builds of a repository, newest first.
    async fn get_builds(&self, repo_id: i64) -> Result<Vec<Build>, StoreError>;

    async fn get_builds_for(
        &self,
        repo_name: &str,
        ref_mode: RefMode,
        ref_name: &str,
    ) -> Result<Vec<Build>, StoreError>;

    /// Most recently updated builds across all repositories.
    async fn get_last_updated_builds(&self, limit: usize) -> Result<Vec<Build>, StoreError>;

    /// Builds left `pending` or `running`.
    async fn get_stale_builds(&self) -> Result<Vec<Build>, StoreError>;

    /// Upsert the step `(build_id, description)` and mark its build running.
    async fn update_step(
        &self,
        build_id: i64,
        description: &str,
        status: StepStatus,
        output: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Steps of a build in creation order.
    async fn get_steps(&self, build_id: i64) -> Result<Vec<Step>, StoreError>;

    /// Insert a historical build with its timestamps and steps, bypassing transitions.
    async fn import_build(&self, repo_id: i64, build: &ImportedBuild) -> Result<i64, StoreError>;
}

/// Column changes for moving build `id` from `current` to `next`.
///
/// `updated_at` is left alone for `cleaned`; `started_at` is set once;
/// `ended_at` is set on every terminal status.
pub(crate) fn build_changes(
    id: i64,
    current: BuildStatus,
    started_at: Option<DateTime<Utc>>,
    next: BuildStatus,
    extra: Option<serde_json::Value>,
    now: DateTime<Utc>,
) -> Result<BuildChanges, StoreError> {
    if !current.accepts(next) {
        return Err(StoreError::InvalidTransition {
            id,
            from: current,
            to: next,
        });
    }

    Ok(BuildChanges {
        status: Some(next.as_str().to_string()),
        updated_at: (next != BuildStatus::Cleaned).then_some(now),
        started_at: (started_at.is_none()
            && matches!(next, BuildStatus::Running | BuildStatus::Success))
        .then_some(now),
        ended_at: matches!(
            next,
            BuildStatus::Success | BuildStatus::Failed | BuildStatus::Cancelled
        )
        .then_some(now),
        extra,
    })
}
