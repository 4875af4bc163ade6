//! peon.build — one run of a repository's pipeline for a single commit.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use super::UnknownVariant;
use crate::schema::builds;

/// Whether a build was triggered by a branch or a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefMode {
    Branch,
    Tag,
}

impl RefMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefMode::Branch => "branch",
            RefMode::Tag => "tag",
        }
    }

    /// Split a full git ref (`refs/heads/x`, `refs/tags/x`) into mode and short name.
    pub fn parse_ref(full_ref: &str) -> Option<(RefMode, String)> {
        if let Some(branch) = full_ref.strip_prefix("refs/heads/") {
            Some((RefMode::Branch, branch.to_string()))
        } else {
            full_ref
                .strip_prefix("refs/tags/")
                .map(|tag| (RefMode::Tag, tag.to_string()))
        }
    }

    pub fn full_ref(&self, name: &str) -> String {
        match self {
            RefMode::Branch => format!("refs/heads/{name}"),
            RefMode::Tag => format!("refs/tags/{name}"),
        }
    }
}

impl fmt::Display for RefMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RefMode {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "branch" => Ok(RefMode::Branch),
            "tag" => Ok(RefMode::Tag),
            other => Err(UnknownVariant {
                kind: "ref mode",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
    Cleaned,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Running => "running",
            BuildStatus::Success => "success",
            BuildStatus::Failed => "failed",
            BuildStatus::Cancelled => "cancelled",
            BuildStatus::Cleaned => "cleaned",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, BuildStatus::Pending | BuildStatus::Running)
    }

    /// Whether a build may move from `self` to `next`.
    ///
    /// `pending → running → {success, failed, cancelled}` and `success → cleaned`.
    /// Pending builds may also be closed directly (stale sweep), and
    /// `running → running` is accepted so step reports can touch the build.
    pub fn accepts(&self, next: BuildStatus) -> bool {
        use BuildStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Running)
                | (Running, Success)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Success, Cleaned)
        )
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BuildStatus::Pending),
            "running" => Ok(BuildStatus::Running),
            "success" => Ok(BuildStatus::Success),
            "failed" => Ok(BuildStatus::Failed),
            "cancelled" => Ok(BuildStatus::Cancelled),
            "cleaned" => Ok(BuildStatus::Cleaned),
            other => Err(UnknownVariant {
                kind: "build status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Build {
    pub id: i64,
    pub repo_id: i64,
    pub repo_name: String,
    pub repo_url: String,
    pub ref_mode: RefMode,
    pub ref_name: String,
    pub sha: String,
    pub status: BuildStatus,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub extra: Option<serde_json::Value>,
}

impl Build {
    /// Value of a string field in `extra`, if present.
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.as_ref()?.get(key)?.as_str()
    }
}

// ── Diesel rows ──

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = builds)]
pub struct BuildRow {
    pub id: i64,
    pub repo_id: i64,
    pub ref_type: String,
    pub ref_name: String,
    pub sha: String,
    pub status: String,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub extra: Option<serde_json::Value>,
}

impl BuildRow {
    pub fn into_build(self, repo_name: String, repo_url: String) -> Result<Build, UnknownVariant> {
        Ok(Build {
            id: self.id,
            repo_id: self.repo_id,
            repo_name,
            repo_url,
            ref_mode: self.ref_type.parse()?,
            ref_name: self.ref_name,
            sha: self.sha,
            status: self.status.parse()?,
            enqueued_at: self.enqueued_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            extra: self.extra,
        })
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = builds)]
pub struct NewBuild<'a> {
    pub repo_id: i64,
    pub ref_type: &'a str,
    pub ref_name: &'a str,
    pub sha: &'a str,
    pub status: &'a str,
}

/// A build carried over from the legacy JSON status files, inserted as-is.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportedBuild {
    pub ref_mode: RefMode,
    pub ref_name: String,
    pub sha: String,
    pub status: BuildStatus,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub extra: serde_json::Value,
    pub steps: Vec<super::step::ImportedStep>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = builds)]
pub struct NewImportedBuild<'a> {
    pub repo_id: i64,
    pub ref_type: &'a str,
    pub ref_name: &'a str,
    pub sha: &'a str,
    pub status: &'a str,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub extra: Option<serde_json::Value>,
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Default, AsChangeset)]
#[diesel(table_name = builds)]
pub struct BuildChanges {
    pub status: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub extra: Option<serde_json::Value>,
}
