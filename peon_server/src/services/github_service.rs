//! GitHub integration — webhook signatures and commit statuses.

use std::sync::{Arc, OnceLock};

use hmac::{Hmac, Mac};
use regex::Regex;
use sha2::Sha256;
use tokio::sync::mpsc;

use crate::store::Datastore;

type HmacSha256 = Hmac<Sha256>;

const STATUS_CONTEXT: &str = "peon";

/// Validate a GitHub webhook signature (X-Hub-Signature-256).
pub fn validate_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    if secret.is_empty() {
        tracing::warn!("Webhook secret not configured, skipping validation");
        return true;
    }

    let sig = signature.strip_prefix("sha256=").unwrap_or(signature);
    let sig_bytes = match hex::decode(sig) {
        Ok(b) => b,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(payload);

    mac.verify_slice(&sig_bytes).is_ok()
}

/// `sha256=<hex>` signature of `payload`, as GitHub sends it.
pub fn sign_payload(secret: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// `(owner, repo)` for GitHub SSH or HTTPS remote URLs.
pub fn extract_github_repo(url: &str) -> Option<(String, String)> {
    static GITHUB_URL: OnceLock<Regex> = OnceLock::new();
    let re = GITHUB_URL.get_or_init(|| {
        Regex::new(
            r"^(?:git@github\.com:|(?:https?|ssh|git)://(?:[^@/]+@)?github\.com/)([^/]+)/([^/]+?)(?:\.git)?/?$",
        )
        .expect("static pattern")
    });
    let caps = re.captures(url)?;
    Some((caps[1].to_string(), caps[2].to_string()))
}

/// Commit status states understood by GitHub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    Pending,
    Success,
    Failure,
    Error,
}

impl CommitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitState::Pending => "pending",
            CommitState::Success => "success",
            CommitState::Failure => "failure",
            CommitState::Error => "error",
        }
    }
}

/// Receiver of per-commit build states.
pub trait CommitStatusSink: Send + Sync {
    fn update(&self, build_id: i64, state: CommitState, description: &str);
}

struct StatusUpdate {
    build_id: i64,
    state: CommitState,
    description: String,
}

/// Posts commit statuses to GitHub, one at a time and in submission order.
pub struct GithubStatus {
    queue: Option<mpsc::UnboundedSender<StatusUpdate>>,
}

impl GithubStatus {
    /// Start the posting task; without a token every update is dropped.
    pub fn spawn(token: Option<String>, status_url: String, store: Arc<dyn Datastore>) -> Self {
        let Some(token) = token.filter(|t| !t.is_empty()) else {
            return Self { queue: None };
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<StatusUpdate>();
        let client = reqwest::Client::new();
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                if let Err(e) = send_update(&client, &token, &status_url, store.as_ref(), update).await
                {
                    tracing::warn!("could not update GitHub status: {e:#}");
                }
            }
        });

        Self { queue: Some(tx) }
    }
}

impl CommitStatusSink for GithubStatus {
    fn update(&self, build_id: i64, state: CommitState, description: &str) {
        if let Some(queue) = &self.queue {
            let _ = queue.send(StatusUpdate {
                build_id,
                state,
                description: description.to_string(),
            });
        }
    }
}

/// Link to a build's status page.
pub fn target_url(status_url: &str, build_id: i64) -> String {
    format!("{}/{build_id}.html", status_url.trim_end_matches('/'))
}

async fn send_update(
    client: &reqwest::Client,
    token: &str,
    status_url: &str,
    store: &dyn Datastore,
    update: StatusUpdate,
) -> anyhow::Result<()> {
    let Some(build) = store.get_build(update.build_id).await? else {
        return Ok(());
    };
    let Some((owner, repo)) = extract_github_repo(&build.repo_url) else {
        tracing::debug!(repo = %build.repo_url, "not a GitHub repository, skipping status");
        return Ok(());
    };

    post_status(
        client,
        token,
        &format!("{owner}/{repo}"),
        &build.sha,
        update.state.as_str(),
        &update.description,
        &target_url(status_url, update.build_id),
        STATUS_CONTEXT,
    )
    .await
}

/// Post a commit status to GitHub.
#[allow(clippy::too_many_arguments)]
pub async fn post_status(
    client: &reqwest::Client,
    token: &str,
    repo: &str,
    sha: &str,
    state: &str,
    description: &str,
    target_url: &str,
    context: &str,
) -> anyhow::Result<()> {
    let url = format!("https://api.github.com/repos/{repo}/statuses/{sha}");
    let body = serde_json::json!({
        "state": state,
        "description": description,
        "target_url": target_url,
        "context": context,
    });

    let resp = client
        .post(&url)
        .header("Authorization", format!("Bearer {token}"))
        .header("Accept", "application/vnd.github+json")
        .header("User-Agent", "peon")
        .json(&body)
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        tracing::warn!("GitHub status update failed: {} {}", status, text);
    }

    Ok(())
}
