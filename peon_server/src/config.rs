//! Peon configuration — loaded from a JSON file, secrets overridable from the environment.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
pub struct PeonConfig {
    /// Root for build mirrors (`repos/`), watcher mirrors (`watch/`) and cache archives (`cache/`).
    pub working_directory: PathBuf,
    /// PostgreSQL connection URL for the status store.
    #[serde(default)]
    pub database_url: String,
    /// Maximum age of a cache archive, in seconds.
    #[serde(default = "default_cache_validity")]
    pub cache_validity_secs: u64,
    /// Maximum total size of the cache directory, in bytes.
    #[serde(default)]
    pub cache_max_size: Option<u64>,
    /// Deployment targets, referenced by name from `.peon.yml`.
    #[serde(default)]
    pub destinations: HashMap<String, Destination>,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub webhooks: WebhookConfig,
    /// GitHub token for commit statuses.
    #[serde(default)]
    pub github_token: Option<String>,
    /// Public base URL of the rendered status pages.
    #[serde(default)]
    pub status_url: String,
    /// Where status pages are written.
    pub status_directory: PathBuf,
    /// Number of builds listed on the index page.
    #[serde(default = "default_index_build_count")]
    pub index_build_count: usize,
    /// Prometheus scrape endpoint; metrics stay in-process when unset.
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Destination {
    /// Local directory or rsync target (`host:path`).
    pub target: String,
    /// URL path under which deployed builds are served, exposed as `PEON_ROOT_URL`.
    #[serde(default)]
    pub root_url: String,
    /// Externally reachable URL of `target`.
    pub absolute_url: String,
    /// Remote shell passed to rsync with `-e`.
    #[serde(default)]
    pub shell: Option<String>,
}

impl Destination {
    pub fn is_remote(&self) -> bool {
        self.target.contains(':')
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct WatcherConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_watch_interval")]
    pub interval_secs: u64,
    #[serde(default)]
    pub repositories: Vec<WatchedRepository>,
}

impl WatcherConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct WatchedRepository {
    pub url: String,
    /// Branches to build; all branches when absent.
    #[serde(default)]
    pub branches: Option<Vec<String>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_webhook_listen")]
    pub listen: SocketAddr,
    /// Shared secret for `X-Hub-Signature-256` validation.
    #[serde(default)]
    pub secret: String,
    /// Public URL of the webhook endpoint, used for retrigger commands.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_webhook_listen(),
            secret: String::new(),
            url: None,
        }
    }
}

fn default_cache_validity() -> u64 {
    7 * 24 * 3600
}

fn default_index_build_count() -> usize {
    100
}

fn default_watch_interval() -> u64 {
    60
}

fn default_webhook_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

impl PeonConfig {
    /// Read the config file and apply environment overrides.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let mut config = Self::parse(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.apply_env();
        config.warn_missing_secrets();
        Ok(config)
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        if config.watcher.enabled && config.watcher.repositories.is_empty() {
            anyhow::bail!("watcher is enabled but no repositories are configured");
        }
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("PEON_DATABASE_URL") {
            self.database_url = url;
        }
        if let Ok(token) = std::env::var("PEON_GITHUB_TOKEN") {
            self.github_token = Some(token);
        }
        if let Ok(secret) = std::env::var("PEON_WEBHOOK_SECRET") {
            self.webhooks.secret = secret;
        }
    }

    fn warn_missing_secrets(&self) {
        if self.webhooks.enabled && self.webhooks.secret.is_empty() {
            tracing::warn!("webhook secret not set -- webhook signature validation disabled");
        }
        if self.github_token.as_deref().unwrap_or_default().is_empty() {
            tracing::warn!("GitHub token not set -- GitHub status updates disabled");
        }
    }

    pub fn repos_directory(&self) -> PathBuf {
        self.working_directory.join("repos")
    }

    /// Mirrors polled by the watcher, apart from the build mirrors.
    pub fn watch_directory(&self) -> PathBuf {
        self.working_directory.join("watch")
    }

    pub fn cache_directory(&self) -> PathBuf {
        self.working_directory.join("cache")
    }

    /// Per-repository JSON status files written by older releases.
    pub fn legacy_status_directory(&self) -> PathBuf {
        self.working_directory.join("status")
    }

    pub fn cache_validity(&self) -> Duration {
        Duration::from_secs(self.cache_validity_secs)
    }
}
