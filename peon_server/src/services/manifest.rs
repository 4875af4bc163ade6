//! `.peon.yml` — the build manifest each repository carries at its root.
//!
//! The YAML document is deserialized loosely and then validated into a
//! [`Manifest`] before any build stage uses it; every structural problem
//! surfaces as a [`ManifestError`].

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use regex::Regex;
use serde::Deserialize;

use crate::config::Destination;
use crate::models::RefMode;
use crate::services::cache_service::CacheEntry;

pub const MANIFEST_FILE: &str = ".peon.yml";

/// Path inside a destination when the manifest does not give one.
pub const DEFAULT_PATH_TEMPLATE: &str = "$PEON_REPO_NAME/$PEON_REF";

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("could not read .peon.yml: {0}")]
    Read(std::io::Error),
    #[error("invalid .peon.yml: {0}")]
    Syntax(serde_yaml::Error),
    #[error("missing output parameter in .peon.yml")]
    MissingOutput,
    #[error("no build commands in .peon.yml")]
    NoCommands,
    #[error("invalid pattern '{pattern}' in .peon.yml: {error}")]
    Pattern { pattern: String, error: regex::Error },
    #[error("unknown build destination: '{0}' in .peon.yml")]
    UnknownDestination(String),
    #[error("could not find a destination matching {mode} '{reference}' in .peon.yml")]
    NoDestination { mode: RefMode, reference: String },
    #[error("invalid relative destination path '{template}' (resolves to '{resolved}') in .peon.yml")]
    PathTraversal { template: String, resolved: String },
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    output: Option<serde_yaml::Value>,
    commands: Option<serde_yaml::Value>,
    branches: Option<Vec<String>>,
    tags: Option<Vec<String>>,
    #[serde(default)]
    destinations: Vec<RawDestination>,
    #[serde(default)]
    cache: Vec<RawCacheEntry>,
    #[serde(default)]
    environment: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Deserialize)]
struct RawDestination {
    name: String,
    branch: Option<String>,
    tag: Option<String>,
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCacheEntry {
    path: String,
    source: String,
}

#[derive(Debug, Clone)]
pub struct Manifest {
    pub output: String,
    pub commands: Vec<String>,
    branches: Option<Vec<Regex>>,
    tags: Vec<Regex>,
    pub destinations: Vec<DestinationRule>,
    pub cache: Vec<CacheEntry>,
    pub environment: BTreeMap<String, String>,
}

/// One `destinations` entry: a registered destination name plus ref filters.
#[derive(Debug, Clone)]
pub struct DestinationRule {
    pub name: String,
    branch: Option<Regex>,
    tag: Option<Regex>,
    pub path: Option<String>,
}

impl DestinationRule {
    /// An entry with neither filter matches every ref; otherwise only the
    /// filter for the current ref mode is consulted.
    fn matches(&self, mode: RefMode, reference: &str) -> bool {
        if self.branch.is_none() && self.tag.is_none() {
            return true;
        }
        let pattern = match mode {
            RefMode::Branch => &self.branch,
            RefMode::Tag => &self.tag,
        };
        pattern.as_ref().is_some_and(|re| re.is_match(reference))
    }

    pub fn path_template(&self) -> &str {
        self.path.as_deref().unwrap_or(DEFAULT_PATH_TEMPLATE)
    }
}

/// Destination picked for a build, with its unevaluated path template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDestination {
    pub name: String,
    pub destination: Destination,
    pub path_template: String,
}

impl Manifest {
    pub async fn load(workspace: &Path) -> Result<Self, ManifestError> {
        let raw = tokio::fs::read_to_string(workspace.join(MANIFEST_FILE))
            .await
            .map_err(ManifestError::Read)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ManifestError> {
        let raw: RawManifest = serde_yaml::from_str(raw).map_err(ManifestError::Syntax)?;

        let output = match raw.output {
            Some(serde_yaml::Value::String(output)) => output,
            _ => return Err(ManifestError::MissingOutput),
        };

        let commands: Vec<String> = match raw.commands {
            Some(serde_yaml::Value::Sequence(items)) => items
                .into_iter()
                .map(|item| scalar_to_string(item).ok_or(ManifestError::NoCommands))
                .collect::<Result<_, _>>()?,
            _ => Vec::new(),
        };
        if commands.is_empty() {
            return Err(ManifestError::NoCommands);
        }

        let destinations = raw
            .destinations
            .into_iter()
            .map(|d| -> Result<DestinationRule, ManifestError> {
                Ok(DestinationRule {
                    name: d.name,
                    branch: d.branch.as_deref().map(compile).transpose()?,
                    tag: d.tag.as_deref().map(compile).transpose()?,
                    path: d.path,
                })
            })
            .collect::<Result<_, _>>()?;

        let environment = raw
            .environment
            .into_iter()
            .map(|(key, value)| (key, scalar_to_string(value).unwrap_or_default()))
            .collect();

        Ok(Self {
            output,
            commands,
            branches: raw
                .branches
                .map(|patterns| patterns.iter().map(|p| compile(p)).collect::<Result<Vec<_>, _>>())
                .transpose()?,
            tags: raw
                .tags
                .unwrap_or_default()
                .iter()
                .map(|p| compile(p))
                .collect::<Result<_, _>>()?,
            destinations,
            cache: raw
                .cache
                .into_iter()
                .map(|c| CacheEntry::new(c.path, c.source))
                .collect(),
            environment,
        })
    }

    /// `Err(reason)` when the manifest's ref filters exclude this ref.
    ///
    /// Tags are only built when they match one of `tags`. Branches are all
    /// built unless `branches` is given, in which case one must match.
    pub fn admits(&self, mode: RefMode, reference: &str) -> Result<(), String> {
        let admitted = match mode {
            RefMode::Tag => self.tags.iter().any(|re| re.is_match(reference)),
            RefMode::Branch => self
                .branches
                .as_ref()
                .map_or(true, |patterns| patterns.iter().any(|re| re.is_match(reference))),
        };
        if admitted {
            Ok(())
        } else {
            Err(format!("{mode} {reference} is not present in .peon.yml"))
        }
    }

    /// First destination entry, in declaration order, matching the ref.
    pub fn resolve_destination(
        &self,
        registry: &HashMap<String, Destination>,
        mode: RefMode,
        reference: &str,
    ) -> Result<ResolvedDestination, ManifestError> {
        for rule in &self.destinations {
            let destination = registry
                .get(&rule.name)
                .ok_or_else(|| ManifestError::UnknownDestination(rule.name.clone()))?;

            if rule.matches(mode, reference) {
                return Ok(ResolvedDestination {
                    name: rule.name.clone(),
                    destination: destination.clone(),
                    path_template: rule.path_template().to_string(),
                });
            }
        }

        Err(ManifestError::NoDestination {
            mode,
            reference: reference.to_string(),
        })
    }
}

/// Reject destination paths that leave the destination root or name the root itself.
pub fn check_destination_path(template: &str, resolved: &str) -> Result<(), ManifestError> {
    let escapes = resolved == ".."
        || resolved.starts_with('/')
        || resolved.starts_with("../")
        || resolved.ends_with("/..")
        || resolved.contains("/../");
    let is_root = resolved.split('/').all(|part| part.is_empty() || part == ".");
    if escapes || is_root {
        Err(ManifestError::PathTraversal {
            template: template.to_string(),
            resolved: resolved.to_string(),
        })
    } else {
        Ok(())
    }
}

fn compile(pattern: &str) -> Result<Regex, ManifestError> {
    Regex::new(pattern).map_err(|error| ManifestError::Pattern {
        pattern: pattern.to_string(),
        error,
    })
}

fn scalar_to_string(value: serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
