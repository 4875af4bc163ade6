//! Dispatcher — turns push events into builds, one build at a time per repository.
//!
//! Every repository gets its own FIFO worker task; builds of different
//! repositories run concurrently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::config::{WatchedRepository, WatcherConfig};
use crate::models::{BuildStatus, RefMode};
use crate::services::git_service::repo_name_from_url;
use crate::services::pipeline::BuildJob;
use crate::services::status_service::StatusService;

/// A GitHub-style push event, from the webhook server or the watcher.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PushEvent {
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(default)]
    pub head_commit: Option<HeadCommit>,
    pub repository: PushRepository,
    /// Set when the ref was deleted.
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HeadCommit {
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PushRepository {
    #[serde(default)]
    pub ssh_url: Option<String>,
    #[serde(default)]
    pub clone_url: Option<String>,
}

impl PushEvent {
    pub fn new(reference: impl Into<String>, sha: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            head_commit: Some(HeadCommit { id: sha.into() }),
            repository: PushRepository {
                ssh_url: Some(url.into()),
                ..Default::default()
            },
            deleted: false,
        }
    }

    pub fn url(&self) -> Option<&str> {
        self.repository
            .ssh_url
            .as_deref()
            .or(self.repository.clone_url.as_deref())
    }
}

/// Repository and ref an event resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoConfig {
    pub name: String,
    pub url: String,
    pub ref_mode: RefMode,
    pub ref_name: String,
    pub branches: Option<Vec<String>>,
}

/// Executes queued work for a repository.
#[async_trait]
pub trait BuildRunner: Send + Sync {
    async fn run_build(&self, job: BuildJob) -> BuildStatus;

    /// Remove the local output of every build of a deleted ref.
    async fn clean_ref(&self, repo_name: &str, ref_mode: RefMode, ref_name: &str) -> anyhow::Result<()>;
}

enum QueuedJob {
    Build(BuildJob),
    Clean {
        repo_name: String,
        ref_mode: RefMode,
        ref_name: String,
    },
}

pub struct Dispatcher {
    watcher_enabled: bool,
    watched: Vec<WatchedRepository>,
    webhooks_enabled: bool,
    status: Arc<StatusService>,
    runner: Arc<dyn BuildRunner>,
    queues: Mutex<HashMap<String, mpsc::UnboundedSender<QueuedJob>>>,
}

impl Dispatcher {
    pub fn new(
        watcher: &WatcherConfig,
        webhooks_enabled: bool,
        status: Arc<StatusService>,
        runner: Arc<dyn BuildRunner>,
    ) -> Self {
        Self {
            watcher_enabled: watcher.enabled,
            watched: watcher.repositories.clone(),
            webhooks_enabled,
            status,
            runner,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Repository configuration handling `event`, if any.
    ///
    /// Watched repositories are matched by URL; with webhooks enabled any
    /// other repository is accepted too. A watched repository's `branches`
    /// list restricts which branches are built.
    pub fn resolve(&self, event: &PushEvent) -> Option<RepoConfig> {
        let Some((ref_mode, ref_name)) = RefMode::parse_ref(&event.reference) else {
            tracing::debug!(reference = %event.reference, "will not handle ref");
            return None;
        };
        let url = event.url()?;

        let watched = self
            .watcher_enabled
            .then(|| self.watched.iter().find(|r| r.url == url))
            .flatten();
        let branches = match watched {
            Some(repo) => repo.branches.clone(),
            None if self.webhooks_enabled => None,
            None => {
                tracing::debug!(url, "cannot find configured repository");
                return None;
            }
        };

        let name = repo_name_from_url(url);
        if ref_mode == RefMode::Branch {
            if let Some(branches) = &branches {
                if !branches.iter().any(|b| *b == ref_name) {
                    tracing::debug!(repo = %name, reference = %event.reference, "will not handle ref");
                    return None;
                }
            }
        }

        Some(RepoConfig {
            name,
            url: url.to_string(),
            ref_mode,
            ref_name,
            branches,
        })
    }

    /// Queue a build for `event`; returns the new build id.
    ///
    /// Deleted refs queue a cleanup of their local builds instead.
    pub async fn dispatch(&self, event: PushEvent) -> anyhow::Result<Option<i64>> {
        let Some(repo) = self.resolve(&event) else {
            return Ok(None);
        };

        if event.deleted {
            tracing::info!(repo = %repo.name, ref_mode = %repo.ref_mode, ref_name = %repo.ref_name, "ref deleted, queueing cleanup");
            self.enqueue(
                &repo.name,
                QueuedJob::Clean {
                    repo_name: repo.name.clone(),
                    ref_mode: repo.ref_mode,
                    ref_name: repo.ref_name.clone(),
                },
            );
            return Ok(None);
        }

        let Some(sha) = event.head_commit.map(|c| c.id) else {
            tracing::debug!(repo = %repo.name, "push event without head commit");
            return Ok(None);
        };

        let build_id = self
            .status
            .start_build(&repo.name, &repo.url, repo.ref_mode, &repo.ref_name, &sha)
            .await?;
        tracing::debug!(build_id, repo = %repo.name, "enqueuing build");

        self.enqueue(
            &repo.name,
            QueuedJob::Build(BuildJob {
                build_id,
                repo_name: repo.name.clone(),
                repo_url: repo.url,
                ref_mode: repo.ref_mode,
                ref_name: repo.ref_name,
                sha,
            }),
        );
        Ok(Some(build_id))
    }

    fn enqueue(&self, repo_name: &str, job: QueuedJob) {
        let mut queues = match self.queues.lock() {
            Ok(queues) => queues,
            Err(poisoned) => poisoned.into_inner(),
        };

        // A closed queue means its worker died; it is replaced below.
        let job = match queues.get(repo_name) {
            Some(queue) => match queue.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let (queue, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run_queue(repo_name.to_string(), self.runner.clone(), receiver));
        // The receiver was just created, so this send cannot fail.
        let _ = queue.send(job);
        queues.insert(repo_name.to_string(), queue);
    }
}

async fn run_queue(
    repo_name: String,
    runner: Arc<dyn BuildRunner>,
    mut receiver: mpsc::UnboundedReceiver<QueuedJob>,
) {
    tracing::debug!(repo = %repo_name, "build queue started");
    while let Some(job) = receiver.recv().await {
        match job {
            QueuedJob::Build(job) => {
                runner.run_build(job).await;
            }
            QueuedJob::Clean {
                repo_name,
                ref_mode,
                ref_name,
            } => {
                if let Err(e) = runner.clean_ref(&repo_name, ref_mode, &ref_name).await {
                    tracing::warn!(repo = %repo_name, "could not clean {ref_mode} {ref_name}: {e:#}");
                }
            }
        }
    }
}
