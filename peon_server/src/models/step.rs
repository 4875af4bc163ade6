//! peon.step — a named stage of a build, keyed by `(build_id, description)`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;

use super::UnknownVariant;
use crate::schema::steps;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Running,
    Success,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Running => "running",
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::Running)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(StepStatus::Running),
            "success" => Ok(StepStatus::Success),
            "failed" => Ok(StepStatus::Failed),
            other => Err(UnknownVariant {
                kind: "step status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Step {
    pub build_id: i64,
    pub description: String,
    pub status: StepStatus,
    pub output: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = steps)]
pub struct StepRow {
    pub id: i64,
    pub build_id: i64,
    pub description: String,
    pub status: String,
    pub output: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl TryFrom<StepRow> for Step {
    type Error = UnknownVariant;

    fn try_from(row: StepRow) -> Result<Self, Self::Error> {
        Ok(Step {
            build_id: row.build_id,
            description: row.description,
            status: row.status.parse()?,
            output: row.output,
            started_at: row.started_at,
            ended_at: row.ended_at,
        })
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = steps)]
pub struct NewStep<'a> {
    pub build_id: i64,
    pub description: &'a str,
    pub status: &'a str,
    pub output: Option<&'a str>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportedStep {
    pub description: String,
    pub status: StepStatus,
    pub output: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = steps)]
pub struct NewImportedStep<'a> {
    pub build_id: i64,
    pub description: &'a str,
    pub status: &'a str,
    pub output: Option<&'a str>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, AsChangeset)]
#[diesel(table_name = steps)]
pub struct StepChanges<'a> {
    pub status: &'a str,
    pub output: Option<&'a str>,
    pub ended_at: Option<DateTime<Utc>>,
}
