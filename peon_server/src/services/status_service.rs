//! Status service — records build and step transitions.
//!
//! Every mutation goes to the datastore first, then to the commit-status
//! sink, then triggers a coalesced re-render of the status pages.

use std::path::Path;
use std::sync::Arc;

use crate::metrics;
use crate::models::{BuildStatus, RefMode, StepStatus};
use crate::services::github_service::{CommitState, CommitStatusSink};
use crate::services::render_service::RenderCoordinator;
use crate::store::Datastore;

const STALE_STEP_NOTE: &str = "(stale build was aborted)";

pub struct StatusService {
    store: Arc<dyn Datastore>,
    sink: Arc<dyn CommitStatusSink>,
    renderer: RenderCoordinator,
}

impl StatusService {
    pub fn new(
        store: Arc<dyn Datastore>,
        sink: Arc<dyn CommitStatusSink>,
        renderer: RenderCoordinator,
    ) -> Self {
        Self {
            store,
            sink,
            renderer,
        }
    }

    /// Record a queued build and return its id.
    pub async fn start_build(
        &self,
        repo_name: &str,
        repo_url: &str,
        ref_mode: RefMode,
        ref_name: &str,
        sha: &str,
    ) -> anyhow::Result<i64> {
        let repo = self.store.get_or_create_repo(repo_name, repo_url).await?;
        let build_id = self
            .store
            .create_build(repo.id, ref_mode, ref_name, sha)
            .await?;

        tracing::info!(build_id, repo = %repo_name, %ref_mode, ref_name, sha, "build queued");
        metrics::build_status_changed(BuildStatus::Pending.as_str());
        self.sink
            .update(build_id, CommitState::Pending, "Peon build is queued");
        self.renderer.render();

        Ok(build_id)
    }

    pub async fn update_step(
        &self,
        build_id: i64,
        description: &str,
        status: StepStatus,
        output: Option<&str>,
    ) -> anyhow::Result<()> {
        self.store
            .update_step(build_id, description, status, output)
            .await?;

        self.sink.update(
            build_id,
            CommitState::Pending,
            &format!("Peon build is running '{description}'"),
        );
        self.renderer.render();
        Ok(())
    }

    /// Record the output of a running step so far.
    pub async fn update_step_output(
        &self,
        build_id: i64,
        description: &str,
        output: &str,
    ) -> anyhow::Result<()> {
        self.store
            .update_step(build_id, description, StepStatus::Running, Some(output))
            .await?;
        self.renderer.render();
        Ok(())
    }

    pub async fn finish_build(
        &self,
        build_id: i64,
        status: BuildStatus,
        extra: Option<serde_json::Value>,
    ) -> anyhow::Result<()> {
        self.store.update_build(build_id, status, extra).await?;

        let (state, description) = match status {
            BuildStatus::Success => (CommitState::Success, "Peon build is finished"),
            BuildStatus::Cancelled => (CommitState::Failure, "Peon build was cancelled"),
            _ => (CommitState::Failure, "Peon build has failed"),
        };
        tracing::info!(build_id, %status, "build finished");
        metrics::build_status_changed(status.as_str());
        if let Some(build) = self.store.get_build(build_id).await? {
            if let (Some(started), Some(ended)) = (build.started_at, build.ended_at) {
                metrics::build_duration((ended - started).num_milliseconds() as f64 / 1000.0);
            }
        }

        self.sink.update(build_id, state, description);
        self.renderer.render();
        Ok(())
    }

    /// Cancel builds left pending or running by a previous process.
    pub async fn abort_stale_builds(&self) -> anyhow::Result<usize> {
        let stale = self.store.get_stale_builds().await?;

        for build in &stale {
            for step in self.store.get_steps(build.id).await? {
                if step.status != StepStatus::Running {
                    continue;
                }
                let output = match step.output {
                    Some(output) => format!("{output}\n{STALE_STEP_NOTE}"),
                    None => STALE_STEP_NOTE.to_string(),
                };
                self.store
                    .update_step(build.id, &step.description, StepStatus::Failed, Some(&output))
                    .await?;
            }

            self.store
                .update_build(build.id, BuildStatus::Cancelled, None)
                .await?;
            tracing::warn!(build_id = build.id, repo = %build.repo_name, "aborted stale build");
            self.sink
                .update(build.id, CommitState::Error, "Peon stale build was aborted");
        }

        if !stale.is_empty() {
            self.renderer.render();
        }
        Ok(stale.len())
    }

    /// Remove the local output of successful builds of a ref and mark them cleaned.
    ///
    /// `keep` is a directory that must survive (the one just deployed to);
    /// `except` is a build left untouched.
    pub async fn cleanup_local_builds(
        &self,
        repo_name: &str,
        ref_mode: RefMode,
        ref_name: &str,
        keep: Option<&Path>,
        except: Option<i64>,
    ) -> anyhow::Result<usize> {
        let mut cleaned = 0;

        for build in self
            .store
            .get_builds_for(repo_name, ref_mode, ref_name)
            .await?
        {
            if build.status != BuildStatus::Success || Some(build.id) == except {
                continue;
            }
            let Some(directory) = build.extra_str("local_directory") else {
                continue;
            };

            let directory = Path::new(directory);
            if keep != Some(directory) {
                tracing::debug!(build_id = build.id, directory = %directory.display(), "removing local build");
                match tokio::fs::remove_dir_all(directory).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        tracing::warn!(build_id = build.id, "could not remove {}: {e}", directory.display());
                        continue;
                    }
                }
            }

            self.store
                .update_build(build.id, BuildStatus::Cleaned, None)
                .await?;
            cleaned += 1;
        }

        if cleaned > 0 {
            tracing::info!(repo = %repo_name, %ref_mode, ref_name, cleaned, "cleaned local builds");
            self.renderer.render();
        }
        Ok(cleaned)
    }
}
