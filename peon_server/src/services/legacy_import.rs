//! Import of the per-repository JSON status files written by older releases.
//!
//! Each `<repo>.json` holds builds keyed `<repo>#<n>`. Imported builds keep
//! that key as `extra.old_build_id` so the status pages can redirect old
//! links, and the file is renamed to `<repo>.json.imported`.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::models::build::ImportedBuild;
use crate::models::step::ImportedStep;
use crate::models::{BuildStatus, RefMode, StepStatus};
use crate::store::Datastore;

/// JSON files in the status directory that do not describe a repository.
const NON_REPO_FILES: [&str; 2] = ["peon-status.json", "render-state.json"];

#[derive(Debug, Deserialize)]
struct LegacyStatus {
    #[serde(default)]
    builds: BTreeMap<String, LegacyBuild>,
}

#[derive(Debug, Deserialize)]
struct LegacyBuild {
    branch: Option<String>,
    tag: Option<String>,
    #[serde(default)]
    sha: String,
    url: Option<String>,
    enqueued: i64,
    updated: Option<i64>,
    start: Option<i64>,
    end: Option<i64>,
    status: String,
    #[serde(default)]
    steps: Vec<LegacyStep>,
    extra: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct LegacyStep {
    description: String,
    start: i64,
    status: String,
    output: Option<String>,
    end: Option<i64>,
}

/// Import every legacy status file in `status_root`; returns the number of builds imported.
pub async fn import_legacy_status(store: &dyn Datastore, status_root: &Path) -> anyhow::Result<usize> {
    let mut entries = match tokio::fs::read_dir(status_root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).with_context(|| format!("reading {}", status_root.display())),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".json") && !NON_REPO_FILES.contains(&name.as_str()) {
            files.push(name);
        }
    }
    files.sort();

    let mut imported = 0;
    for file in files {
        let path = status_root.join(&file);
        let repo_name = file.trim_end_matches(".json");
        tracing::info!(repo = repo_name, file = %path.display(), "importing legacy build status");

        let count = import_file(store, repo_name, &path)
            .await
            .with_context(|| format!("importing {}", path.display()))?;
        tokio::fs::rename(&path, status_root.join(format!("{file}.imported")))
            .await
            .with_context(|| format!("renaming {}", path.display()))?;

        tracing::info!(repo = repo_name, "imported {} builds", count);
        imported += count;
    }
    Ok(imported)
}

async fn import_file(store: &dyn Datastore, repo_name: &str, path: &Path) -> anyhow::Result<usize> {
    let raw = tokio::fs::read_to_string(path).await?;
    let status: LegacyStatus = serde_json::from_str(&raw)?;

    let mut builds: Vec<_> = status.builds.into_iter().collect();
    builds.sort_by_key(|(old_id, _)| build_number(old_id));
    let count = builds.len();

    let mut repo = None;
    for (old_id, legacy) in builds {
        let repo_id = match repo {
            Some(id) => id,
            None => {
                let url = legacy.url.as_deref().unwrap_or_default();
                let id = store.get_or_create_repo(repo_name, url).await?.id;
                repo = Some(id);
                id
            }
        };
        let build = convert(&old_id, legacy).with_context(|| format!("build {old_id}"))?;
        store.import_build(repo_id, &build).await?;
    }
    Ok(count)
}

/// `n` from `repo#n`; unnumbered ids sort last.
fn build_number(old_id: &str) -> (u64, String) {
    let number = old_id
        .rsplit_once('#')
        .and_then(|(_, n)| n.parse().ok())
        .unwrap_or(u64::MAX);
    (number, old_id.to_string())
}

fn convert(old_id: &str, legacy: LegacyBuild) -> anyhow::Result<ImportedBuild> {
    let (ref_mode, ref_name) = match (legacy.branch, legacy.tag) {
        (Some(branch), _) => (RefMode::Branch, branch),
        (None, Some(tag)) => (RefMode::Tag, tag),
        (None, None) => anyhow::bail!("neither branch nor tag"),
    };
    let status: BuildStatus = legacy.status.parse()?;

    let mut extra = legacy.extra.unwrap_or_default();
    extra
        .entry("old_build_id")
        .or_insert_with(|| Value::String(old_id.to_string()));

    let steps = legacy
        .steps
        .into_iter()
        .map(|step| {
            Ok(ImportedStep {
                status: step.status.parse::<StepStatus>()?,
                description: step.description,
                output: step.output,
                started_at: timestamp(step.start)?,
                ended_at: step.end.map(timestamp).transpose()?,
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let enqueued_at = timestamp(legacy.enqueued)?;
    Ok(ImportedBuild {
        ref_mode,
        ref_name,
        sha: legacy.sha,
        status,
        enqueued_at,
        updated_at: legacy.updated.map(timestamp).transpose()?.unwrap_or(enqueued_at),
        started_at: legacy.start.map(timestamp).transpose()?,
        ended_at: legacy.end.map(timestamp).transpose()?,
        extra: Value::Object(extra),
        steps,
    })
}

/// Legacy timestamps are milliseconds since the epoch.
fn timestamp(millis: i64) -> anyhow::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).with_context(|| format!("invalid timestamp {millis}"))
}
