//! Polling watcher — fetches watched repositories and reports moved branches.
//!
//! The watcher keeps its own bare mirrors, separate from the ones builds
//! fetch into, so polling never races a running build.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::WatchedRepository;
use crate::services::dispatcher::{Dispatcher, PushEvent};
use crate::services::git_service;

pub struct Watcher {
    mirrors_directory: PathBuf,
    interval: Duration,
}

impl Watcher {
    pub fn new(mirrors_directory: PathBuf, interval: Duration) -> Self {
        Self {
            mirrors_directory,
            interval,
        }
    }

    /// Start one polling task per repository.
    pub fn spawn(
        self: Arc<Self>,
        repositories: &[WatchedRepository],
        dispatcher: Arc<Dispatcher>,
    ) -> Vec<JoinHandle<()>> {
        repositories
            .iter()
            .cloned()
            .map(|repo| {
                let watcher = self.clone();
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move { watcher.watch(repo, dispatcher).await })
            })
            .collect()
    }

    async fn watch(&self, repo: WatchedRepository, dispatcher: Arc<Dispatcher>) {
        let branches = repo
            .branches
            .as_ref()
            .map_or_else(|| "all branches".to_string(), |b| b.join(", "));
        tracing::info!(url = %repo.url, "starting watcher on {branches}");

        loop {
            tokio::time::sleep(self.interval).await;

            let events = match self.poll(&repo).await {
                Ok(events) => events,
                Err(e) => {
                    tracing::warn!(url = %repo.url, "could not check repository: {e:#}");
                    continue;
                }
            };
            for event in events {
                if let Err(e) = dispatcher.dispatch(event).await {
                    tracing::error!(url = %repo.url, "could not dispatch change: {e:#}");
                }
            }
        }
    }

    /// Fetch `repo` and return a push event for every branch whose head moved.
    ///
    /// Every branch counts as moved when the mirror is first cloned.
    pub async fn poll(&self, repo: &WatchedRepository) -> anyhow::Result<Vec<PushEvent>> {
        let name = git_service::repo_name_from_url(&repo.url);
        let mirror = self.mirrors_directory.join(&name);

        let before = if tokio::fs::try_exists(mirror.join("HEAD")).await.unwrap_or(false) {
            git_service::branch_heads(&mirror).await?
        } else {
            BTreeMap::new()
        };
        git_service::update_mirror(&repo.url, &mirror).await?;
        let after = git_service::branch_heads(&mirror).await?;

        let events = after
            .into_iter()
            .filter(|(branch, _)| {
                repo.branches
                    .as_ref()
                    .map_or(true, |allowed| allowed.contains(branch))
            })
            .filter(|(branch, sha)| before.get(branch) != Some(sha))
            .map(|(branch, sha)| {
                tracing::info!(repo = %name, %branch, %sha, "branch changed");
                PushEvent::new(format!("refs/heads/{branch}"), sha, repo.url.clone())
            })
            .collect();
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::services::git_service::tests::{commit_files, create_branch, init_repo};

    fn refs(events: &[PushEvent]) -> Vec<(String, String)> {
        events
            .iter()
            .map(|e| {
                let sha = e.head_commit.as_ref().map(|c| c.id.clone()).unwrap_or_default();
                (e.reference.clone(), sha)
            })
            .collect()
    }

    #[tokio::test]
    async fn reports_branches_whose_head_moved() {
        let root = tempfile::tempdir().unwrap();
        let source = root.path().join("app");
        init_repo(&source);
        let first = commit_files(&source, &[("a", "1")]);
        let repo = WatchedRepository {
            url: source.to_string_lossy().to_string(),
            branches: None,
        };
        let watcher = Watcher::new(root.path().join("watch"), Duration::from_secs(60));

        let initial = watcher.poll(&repo).await.unwrap();
        assert_eq!(refs(&initial), vec![("refs/heads/main".to_string(), first)]);

        assert!(watcher.poll(&repo).await.unwrap().is_empty());

        create_branch(&source, "feature");
        let second = commit_files(&source, &[("a", "2")]);
        let changed = watcher.poll(&repo).await.unwrap();
        assert_eq!(changed.len(), 2);
        assert!(refs(&changed).contains(&("refs/heads/main".to_string(), second)));
    }

    #[tokio::test]
    async fn ignores_branches_not_listed() {
        let root = tempfile::tempdir().unwrap();
        let source = root.path().join("app");
        init_repo(&source);
        commit_files(&source, &[("a", "1")]);
        create_branch(&source, "feature");
        let repo = WatchedRepository {
            url: source.to_string_lossy().to_string(),
            branches: Some(vec!["feature".to_string()]),
        };
        let watcher = Watcher::new(root.path().join("watch"), Duration::from_secs(60));

        let events = watcher.poll(&repo).await.unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reference, "refs/heads/feature");
    }
}
