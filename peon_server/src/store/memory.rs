//! In-memory datastore used by tests.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use super::{build_changes, Datastore, StoreError};
use crate::models::build::ImportedBuild;
use crate::models::{Build, BuildStatus, RefMode, Repo, Step, StepStatus};

#[derive(Default)]
pub struct MemoryDatastore {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    repos: Vec<Repo>,
    builds: Vec<Build>,
    steps: Vec<Step>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

impl State {
    fn transition(
        &mut self,
        id: i64,
        next: BuildStatus,
        extra: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        let build = self
            .builds
            .iter_mut()
            .find(|b| b.id == id)
            .ok_or(StoreError::BuildNotFound(id))?;
        let changes = build_changes(id, build.status, build.started_at, next, extra, Utc::now())?;

        build.status = next;
        if let Some(updated_at) = changes.updated_at {
            build.updated_at = updated_at;
        }
        if changes.started_at.is_some() {
            build.started_at = changes.started_at;
        }
        if changes.ended_at.is_some() {
            build.ended_at = changes.ended_at;
        }
        if changes.extra.is_some() {
            build.extra = changes.extra;
        }
        Ok(())
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn get_or_create_repo(&self, name: &str, url: &str) -> Result<Repo, StoreError> {
        let mut state = self.state();
        if let Some(repo) = state.repos.iter().find(|r| r.name == name) {
            return Ok(repo.clone());
        }
        let repo = Repo {
            id: state.repos.len() as i64 + 1,
            name: name.to_string(),
            url: url.to_string(),
        };
        state.repos.push(repo.clone());
        Ok(repo)
    }

    async fn get_repos(&self) -> Result<Vec<Repo>, StoreError> {
        Ok(self.state().repos.clone())
    }

    async fn create_build(
        &self,
        repo_id: i64,
        ref_mode: RefMode,
        ref_name: &str,
        sha: &str,
    ) -> Result<i64, StoreError> {
        let mut state = self.state();
        let repo = state
            .repos
            .iter()
            .find(|r| r.id == repo_id)
            .cloned()
            .ok_or(StoreError::Database(diesel::result::Error::NotFound))?;
        let id = state.builds.len() as i64 + 1;
        let now = Utc::now();
        state.builds.push(Build {
            id,
            repo_id,
            repo_name: repo.name,
            repo_url: repo.url,
            ref_mode,
            ref_name: ref_name.to_string(),
            sha: sha.to_string(),
            status: BuildStatus::Pending,
            enqueued_at: now,
            updated_at: now,
            started_at: None,
            ended_at: None,
            extra: None,
        });
        Ok(id)
    }

    async fn update_build(
        &self,
        id: i64,
        status: BuildStatus,
        extra: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        self.state().transition(id, status, extra)
    }

    async fn get_build(&self, id: i64) -> Result<Option<Build>, StoreError> {
        Ok(self.state().builds.iter().find(|b| b.id == id).cloned())
    }

    async fn get_builds(&self, repo_id: i64) -> Result<Vec<Build>, StoreError> {
        let mut builds: Vec<_> = self
            .state()
            .builds
            .iter()
            .filter(|b| b.repo_id == repo_id)
            .cloned()
            .collect();
        builds.reverse();
        Ok(builds)
    }

    async fn get_builds_for(
        &self,
        repo_name: &str,
        ref_mode: RefMode,
        ref_name: &str,
    ) -> Result<Vec<Build>, StoreError> {
        let mut builds: Vec<_> = self
            .state()
            .builds
            .iter()
            .filter(|b| b.repo_name == repo_name && b.ref_mode == ref_mode && b.ref_name == ref_name)
            .cloned()
            .collect();
        builds.reverse();
        Ok(builds)
    }

    async fn get_last_updated_builds(&self, limit: usize) -> Result<Vec<Build>, StoreError> {
        let mut builds = self.state().builds.clone();
        builds.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        builds.truncate(limit);
        Ok(builds)
    }

    async fn get_stale_builds(&self) -> Result<Vec<Build>, StoreError> {
        Ok(self
            .state()
            .builds
            .iter()
            .filter(|b| b.status.is_active())
            .cloned()
            .collect())
    }

    async fn update_step(
        &self,
        build_id: i64,
        description: &str,
        status: StepStatus,
        output: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        let ended_at = status.is_terminal().then(Utc::now);

        match state
            .steps
            .iter_mut()
            .find(|s| s.build_id == build_id && s.description == description)
        {
            Some(step) => {
                step.status = status;
                if output.is_some() {
                    step.output = output.map(str::to_string);
                }
                if ended_at.is_some() {
                    step.ended_at = ended_at;
                }
            }
            None => state.steps.push(Step {
                build_id,
                description: description.to_string(),
                status,
                output: output.map(str::to_string),
                started_at: Utc::now(),
                ended_at,
            }),
        }

        let current = state
            .builds
            .iter()
            .find(|b| b.id == build_id)
            .map(|b| b.status)
            .ok_or(StoreError::BuildNotFound(build_id))?;
        if current.accepts(BuildStatus::Running) {
            state.transition(build_id, BuildStatus::Running, None)?;
        }
        Ok(())
    }

    async fn get_steps(&self, build_id: i64) -> Result<Vec<Step>, StoreError> {
        Ok(self
            .state()
            .steps
            .iter()
            .filter(|s| s.build_id == build_id)
            .cloned()
            .collect())
    }

    async fn import_build(&self, repo_id: i64, build: &ImportedBuild) -> Result<i64, StoreError> {
        let mut state = self.state();
        let repo = state
            .repos
            .iter()
            .find(|r| r.id == repo_id)
            .cloned()
            .ok_or(StoreError::Database(diesel::result::Error::NotFound))?;
        let id = state.builds.len() as i64 + 1;
        state.builds.push(Build {
            id,
            repo_id,
            repo_name: repo.name,
            repo_url: repo.url,
            ref_mode: build.ref_mode,
            ref_name: build.ref_name.clone(),
            sha: build.sha.clone(),
            status: build.status,
            enqueued_at: build.enqueued_at,
            updated_at: build.updated_at,
            started_at: build.started_at,
            ended_at: build.ended_at,
            extra: Some(build.extra.clone()),
        });
        state.steps.extend(build.steps.iter().map(|step| Step {
            build_id: id,
            description: step.description.clone(),
            status: step.status,
            output: step.output.clone(),
            started_at: step.started_at,
            ended_at: step.ended_at,
        }));
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn step_updates_are_idempotent_per_description() {
        let store = MemoryDatastore::new();
        let repo = store.get_or_create_repo("app", "git@host:app.git").await.unwrap();
        let id = store.create_build(repo.id, RefMode::Branch, "main", "abc").await.unwrap();

        store.update_step(id, "build", StepStatus::Running, None).await.unwrap();
        store.update_step(id, "build", StepStatus::Running, Some("partial")).await.unwrap();
        store.update_step(id, "build", StepStatus::Success, Some("done")).await.unwrap();

        let steps = store.get_steps(id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, StepStatus::Success);
        assert_eq!(steps[0].output.as_deref(), Some("done"));
        assert!(steps[0].ended_at.is_some());

        let build = store.get_build(id).await.unwrap().unwrap();
        assert_eq!(build.status, BuildStatus::Running);
        assert!(build.started_at.is_some());
    }

    #[tokio::test]
    async fn repo_is_created_once() {
        let store = MemoryDatastore::new();
        let a = store.get_or_create_repo("app", "url1").await.unwrap();
        let b = store.get_or_create_repo("app", "url1").await.unwrap();

        assert_eq!(a, b);
        assert_eq!(store.get_repos().await.unwrap().len(), 1);
    }
}
