//! Static HTML status pages rendered with tera.
//!
//! Output layout inside the status directory:
//! `index.html`, `<repo>.html`, `<build id>.html`, plus redirect stubs for
//! builds carrying an `old_build_id`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tera::{Context, Tera};

use crate::models::{Build, Repo, Step};
use crate::services::github_service;
use crate::services::render_service::RenderPass;
use crate::store::Datastore;

/// Where and how to resend a build's push event.
#[derive(Debug, Clone)]
pub struct Retrigger {
    pub url: String,
    pub secret: String,
}

pub struct StatusPages {
    store: Arc<dyn Datastore>,
    directory: PathBuf,
    index_build_count: usize,
    retrigger: Option<Retrigger>,
    tera: Tera,
}

#[derive(Serialize)]
struct BuildView {
    id: i64,
    repo_name: String,
    repo_link: String,
    build_link: String,
    ref_mode: &'static str,
    ref_name: String,
    sha: String,
    short_sha: String,
    status: &'static str,
    enqueued: String,
    queue_time: String,
    run_time: String,
    output_url: Option<String>,
    is_cleaned: bool,
}

#[derive(Serialize)]
struct StepView {
    description: String,
    status: &'static str,
    output: Option<String>,
    started: String,
    duration: String,
}

impl From<&Build> for BuildView {
    fn from(build: &Build) -> Self {
        Self {
            id: build.id,
            repo_name: build.repo_name.clone(),
            repo_link: format!("{}.html", build.repo_name),
            build_link: format!("{}.html", build.id),
            ref_mode: build.ref_mode.as_str(),
            ref_name: build.ref_name.clone(),
            sha: build.sha.clone(),
            short_sha: short_sha(&build.sha).to_string(),
            status: build.status.as_str(),
            enqueued: iso_date(build.enqueued_at),
            queue_time: elapsed(Some(build.enqueued_at), build.started_at),
            run_time: elapsed(build.started_at, build.ended_at),
            output_url: build.extra_str("output_url").map(str::to_string),
            is_cleaned: build.status == crate::models::BuildStatus::Cleaned,
        }
    }
}

impl From<&Step> for StepView {
    fn from(step: &Step) -> Self {
        Self {
            description: step.description.clone(),
            status: step.status.as_str(),
            output: step.output.clone(),
            started: iso_date(step.started_at),
            duration: elapsed(Some(step.started_at), step.ended_at),
        }
    }
}

/// Page name for a legacy `repo#N` build id (`repo/N.html`) and the
/// relative link from it back to the build page.
fn redirect_stub(old_id: &str, build_id: i64) -> Option<(String, String)> {
    let relative = old_id.replace('#', "/");
    let parts: Vec<&str> = relative.split('/').collect();
    if parts.iter().any(|p| p.is_empty() || *p == "." || *p == "..") {
        return None;
    }
    let target = format!("{}{build_id}.html", "../".repeat(parts.len() - 1));
    Some((format!("{relative}.html"), target))
}

pub fn short_sha(sha: &str) -> &str {
    sha.get(..8).unwrap_or(sha)
}

fn iso_date(date: DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn elapsed(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> String {
    match (from, to) {
        (Some(from), Some(to)) => format_duration((to - from).num_milliseconds()),
        _ => String::new(),
    }
}

/// `850ms`, `12.3s`, `4m05s`.
pub fn format_duration(milliseconds: i64) -> String {
    if milliseconds < 1000 {
        format!("{milliseconds}ms")
    } else if milliseconds < 60_000 {
        format!("{:.1}s", milliseconds as f64 / 1000.0)
    } else {
        let seconds = milliseconds / 1000;
        format!("{}m{:02}s", seconds / 60, seconds % 60)
    }
}

impl StatusPages {
    pub fn new(
        store: Arc<dyn Datastore>,
        directory: PathBuf,
        index_build_count: usize,
        retrigger: Option<Retrigger>,
    ) -> anyhow::Result<Self> {
        let mut tera = Tera::default();
        tera.add_raw_templates(vec![
            ("layout.html", LAYOUT_TEMPLATE),
            ("index.html", INDEX_TEMPLATE),
            ("repo.html", REPO_TEMPLATE),
            ("build.html", BUILD_TEMPLATE),
            ("buildredir.html", BUILD_REDIRECT_TEMPLATE),
        ])
        .context("Failed to compile status templates")?;

        Ok(Self {
            store,
            directory,
            index_build_count,
            retrigger,
            tera,
        })
    }

    async fn write(&self, name: &str, template: &str, context: &Context) -> anyhow::Result<()> {
        let html = self
            .tera
            .render(template, context)
            .with_context(|| format!("rendering {template} for {name}"))?;
        let path = self.directory.join(name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        tokio::fs::write(&path, html)
            .await
            .with_context(|| format!("writing {}", path.display()))
    }

    async fn render_repo(&self, repo: &Repo, builds: &[Build]) -> anyhow::Result<()> {
        let mut context = Context::new();
        context.insert("repo", repo);
        context.insert("builds", &builds.iter().map(BuildView::from).collect::<Vec<_>>());
        self.write(&format!("{}.html", repo.name), "repo.html", &context).await
    }

    async fn render_build(&self, repo: &Repo, build: &Build) -> anyhow::Result<()> {
        tracing::debug!(build_id = build.id, "rendering build page");

        let steps = self.store.get_steps(build.id).await?;
        let mut context = Context::new();
        context.insert("repo", repo);
        context.insert("build", &BuildView::from(build));
        context.insert("steps", &steps.iter().map(StepView::from).collect::<Vec<_>>());
        context.insert("retrigger", &self.retrigger_command(repo, build));
        self.write(&format!("{}.html", build.id), "build.html", &context).await?;

        if let Some(old_id) = build.extra.as_ref().and_then(|e| e.get("old_build_id")) {
            let old_id = match old_id {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            match redirect_stub(&old_id, build.id) {
                Some((name, target)) => {
                    let mut context = Context::new();
                    context.insert("target", &target);
                    self.write(&name, "buildredir.html", &context).await?;
                }
                None => tracing::warn!(build_id = build.id, %old_id, "ignoring unsafe legacy build id"),
            }
        }
        Ok(())
    }

    /// `curl` command resending the push event for a finished build.
    fn retrigger_command(&self, repo: &Repo, build: &Build) -> Option<String> {
        let retrigger = self.retrigger.as_ref()?;
        if build.status.is_active() {
            return None;
        }

        let payload = serde_json::json!({
            "ref": build.ref_mode.full_ref(&build.ref_name),
            "head_commit": { "id": build.sha },
            "repository": { "name": repo.name, "ssh_url": repo.url },
        })
        .to_string();
        let signature = github_service::sign_payload(&retrigger.secret, payload.as_bytes());

        Some(format!(
            "curl -X POST -H 'Content-Type: application/json' -H 'X-GitHub-Event: push' \
             -H 'X-GitHub-Delivery: manual-peon-retrigger' -H 'X-Hub-Signature-256: {signature}' \
             --data '{}' '{}'",
            payload.replace('\'', r"'\''"),
            retrigger.url
        ))
    }
}

#[async_trait]
impl RenderPass for StatusPages {
    async fn render(&self, since: Option<DateTime<Utc>>) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .with_context(|| format!("creating {}", self.directory.display()))?;
        let is_updated = |build: &Build| since.map_or(true, |since| build.updated_at > since);

        for repo in self.store.get_repos().await? {
            let builds = self.store.get_builds(repo.id).await?;
            if !builds.iter().any(|b| is_updated(b)) {
                continue;
            }

            tracing::debug!(repo = %repo.name, "rendering repository page");
            self.render_repo(&repo, &builds).await?;
            for build in builds.iter().filter(|b| is_updated(*b)) {
                self.render_build(&repo, build).await?;
            }
        }

        let latest = self
            .store
            .get_last_updated_builds(self.index_build_count)
            .await?;
        let mut context = Context::new();
        context.insert("builds", &latest.iter().map(BuildView::from).collect::<Vec<_>>());
        self.write("index.html", "index.html", &context).await
    }
}

const LAYOUT_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  <title>{% block title %}peon{% endblock title %}</title>
  <style>
    body { font-family: sans-serif; margin: 2em; color: #222; }
    table { border-collapse: collapse; }
    td, th { padding: 0.3em 0.8em; text-align: left; border-bottom: 1px solid #ddd; }
    .status-success { color: #2a7d2a; }
    .status-failed { color: #b32424; }
    .status-cancelled, .status-cleaned { color: #777; }
    .status-running, .status-pending { color: #b07d00; }
    pre { background: #f4f4f4; padding: 0.8em; overflow-x: auto; }
  </style>
</head>
<body>
{% block content %}{% endblock content %}
</body>
</html>
"#;

const INDEX_TEMPLATE: &str = r#"{% extends "layout.html" %}
{% block title %}peon builds{% endblock title %}
{% block content %}
<h1>Recent builds</h1>
<table>
  <tr><th>Build</th><th>Repository</th><th>Ref</th><th>Commit</th><th>Status</th><th>Queued</th><th>Run time</th></tr>
  {%- for build in builds %}
  <tr>
    <td><a href="{{ build.build_link }}">#{{ build.id }}</a></td>
    <td><a href="{{ build.repo_link }}">{{ build.repo_name }}</a></td>
    <td>{{ build.ref_mode }} {{ build.ref_name }}</td>
    <td title="{{ build.sha }}">{{ build.short_sha }}</td>
    <td class="status-{{ build.status }}">{{ build.status }}</td>
    <td>{{ build.enqueued }}</td>
    <td>{{ build.run_time }}</td>
  </tr>
  {%- endfor %}
</table>
{% endblock content %}
"#;

const REPO_TEMPLATE: &str = r#"{% extends "layout.html" %}
{% block title %}{{ repo.name }} builds{% endblock title %}
{% block content %}
<p><a href="index.html">all builds</a></p>
<h1>{{ repo.name }}</h1>
<p>{{ repo.url }}</p>
<table>
  <tr><th>Build</th><th>Ref</th><th>Commit</th><th>Status</th><th>Queued</th><th>Wait</th><th>Run time</th><th>Output</th></tr>
  {%- for build in builds %}
  <tr>
    <td><a href="{{ build.build_link }}">#{{ build.id }}</a></td>
    <td>{{ build.ref_mode }} {{ build.ref_name }}</td>
    <td title="{{ build.sha }}">{{ build.short_sha }}</td>
    <td class="status-{{ build.status }}">{{ build.status }}</td>
    <td>{{ build.enqueued }}</td>
    <td>{{ build.queue_time }}</td>
    <td>{{ build.run_time }}</td>
    <td>{% if build.output_url and not build.is_cleaned %}<a href="{{ build.output_url }}">view</a>{% endif %}</td>
  </tr>
  {%- endfor %}
</table>
{% endblock content %}
"#;

const BUILD_TEMPLATE: &str = r#"{% extends "layout.html" %}
{% block title %}{{ repo.name }} #{{ build.id }}{% endblock title %}
{% block content %}
<p><a href="index.html">all builds</a> / <a href="{{ build.repo_link }}">{{ repo.name }}</a></p>
<h1>{{ repo.name }} #{{ build.id }}</h1>
<table>
  <tr><th>Ref</th><td>{{ build.ref_mode }} {{ build.ref_name }}</td></tr>
  <tr><th>Commit</th><td>{{ build.sha }}</td></tr>
  <tr><th>Status</th><td class="status-{{ build.status }}">{{ build.status }}</td></tr>
  <tr><th>Queued</th><td>{{ build.enqueued }} (waited {{ build.queue_time }})</td></tr>
  <tr><th>Run time</th><td>{{ build.run_time }}</td></tr>
  {%- if build.output_url %}
  <tr><th>Output</th><td>{% if build.is_cleaned %}cleaned up{% else %}<a href="{{ build.output_url }}">{{ build.output_url }}</a>{% endif %}</td></tr>
  {%- endif %}
</table>
{%- for step in steps %}
<h2 class="status-{{ step.status }}">{{ step.description }}</h2>
<p>{{ step.status }}, started {{ step.started }}{% if step.duration %}, took {{ step.duration }}{% endif %}</p>
{%- if step.output %}
<pre>{{ step.output }}</pre>
{%- endif %}
{%- endfor %}
{%- if retrigger %}
<h2>Retrigger</h2>
<pre>{{ retrigger }}</pre>
{%- endif %}
{% endblock content %}
"#;

const BUILD_REDIRECT_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  <meta http-equiv="refresh" content="0; url={{ target }}">
</head>
<body><a href="{{ target }}">moved</a></body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BuildStatus, RefMode, StepStatus};
    use crate::store::memory::MemoryDatastore;

    #[test]
    fn formats_durations() {
        assert_eq!(format_duration(850), "850ms");
        assert_eq!(format_duration(12_340), "12.3s");
        assert_eq!(format_duration(245_000), "4m05s");
    }

    #[test]
    fn shortens_shas() {
        assert_eq!(short_sha("0123456789abcdef"), "01234567");
        assert_eq!(short_sha("abc"), "abc");
    }

    #[test]
    fn legacy_ids_map_to_nested_pages() {
        assert_eq!(
            redirect_stub("app#12", 40),
            Some(("app/12.html".to_string(), "../40.html".to_string()))
        );
        assert_eq!(redirect_stub("../etc#1", 40), None);
        assert_eq!(redirect_stub("#1", 40), None);
    }

    async fn seeded_store() -> (Arc<MemoryDatastore>, i64) {
        let store = Arc::new(MemoryDatastore::new());
        let repo = store
            .get_or_create_repo("app", "git@github.com:org/app.git")
            .await
            .unwrap();
        let id = store
            .create_build(repo.id, RefMode::Branch, "main", "0123456789abcdef")
            .await
            .unwrap();
        store
            .update_step(id, "echo <hi>", StepStatus::Success, Some("[stdout] <hi>\n"))
            .await
            .unwrap();
        store
            .update_build(
                id,
                BuildStatus::Success,
                Some(serde_json::json!({ "output_url": "https://example.com/app/main", "old_build_id": "app#4" })),
            )
            .await
            .unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn renders_all_pages_for_updated_builds() {
        let dir = tempfile::tempdir().unwrap();
        let (store, id) = seeded_store().await;
        let pages = StatusPages::new(
            store,
            dir.path().to_path_buf(),
            10,
            Some(Retrigger {
                url: "https://ci.example.com/webhooks".to_string(),
                secret: "s3cret".to_string(),
            }),
        )
        .unwrap();

        pages.render(None).await.unwrap();

        let index = std::fs::read_to_string(dir.path().join("index.html")).unwrap();
        let repo = std::fs::read_to_string(dir.path().join("app.html")).unwrap();
        let build = std::fs::read_to_string(dir.path().join(format!("{id}.html"))).unwrap();
        let redirect = std::fs::read_to_string(dir.path().join("app/4.html")).unwrap();

        assert!(index.contains("01234567"));
        assert!(repo.contains("https://example.com/app/main"));
        assert!(build.contains("[stdout] &lt;hi&gt;"));
        assert!(build.contains("X-Hub-Signature-256: sha256="));
        assert!(redirect.contains(&format!("url=../{id}.html")));
    }

    #[tokio::test]
    async fn skips_pages_of_untouched_repositories() {
        let dir = tempfile::tempdir().unwrap();
        let (store, id) = seeded_store().await;
        let pages = StatusPages::new(store, dir.path().to_path_buf(), 10, None).unwrap();

        pages.render(Some(Utc::now())).await.unwrap();

        assert!(dir.path().join("index.html").exists());
        assert!(!dir.path().join("app.html").exists());
        assert!(!dir.path().join(format!("{id}.html")).exists());
    }
}
