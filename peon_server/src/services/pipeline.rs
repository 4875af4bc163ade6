//! Build pipeline — runs one build of one commit from mirror to deployment.
//!
//! Stages, each reported as a build step:
//! update repository → create workspace → read .peon.yml → [restore cache]
//! → run <command>… → [save cache] → deploy.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use tempfile::TempDir;

use crate::config::Destination;
use crate::metrics;
use crate::models::{BuildStatus, RefMode};
use crate::services::cache_service::CacheService;
use crate::services::deploy_service::{self, DeployOutcome};
use crate::services::dispatcher::BuildRunner;
use crate::services::environment::Environment;
use crate::services::executor;
use crate::services::git_service;
use crate::services::manifest::{self, Manifest, ResolvedDestination};
use crate::services::status_service::StatusService;
use crate::services::step_executor::{StageError, StageResult, StepOutput, StepRunner};

/// A queued build of one commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildJob {
    pub build_id: i64,
    pub repo_name: String,
    pub repo_url: String,
    pub ref_mode: RefMode,
    pub ref_name: String,
    pub sha: String,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Parent of the per-repository mirrors.
    pub repos_directory: PathBuf,
    /// Parent of the per-build workspaces.
    pub workspace_root: PathBuf,
    pub destinations: HashMap<String, Destination>,
}

pub struct Pipeline {
    settings: PipelineSettings,
    status: Arc<StatusService>,
    cache: Arc<CacheService>,
}

/// State accumulated by the stages of one build.
struct BuildRun<'a> {
    pipeline: &'a Pipeline,
    job: &'a BuildJob,
    started: DateTime<Utc>,
    workspace: Option<TempDir>,
    manifest: Option<Manifest>,
    destination: Option<ResolvedDestination>,
    env: BTreeMap<String, String>,
    path: String,
    deployed: Option<DeployOutcome>,
}

impl Pipeline {
    pub fn new(settings: PipelineSettings, status: Arc<StatusService>, cache: Arc<CacheService>) -> Self {
        Self {
            settings,
            status,
            cache,
        }
    }

    /// Run `job` to completion and record its final status.
    pub async fn run(&self, job: &BuildJob) -> BuildStatus {
        tracing::info!(build_id = job.build_id, repo = %job.repo_name, sha = %job.sha, "building commit");
        metrics::build_started();

        let steps = StepRunner::new(job.build_id, self.status.clone());
        let mut build = BuildRun {
            pipeline: self,
            job,
            started: Utc::now(),
            workspace: None,
            manifest: None,
            destination: None,
            env: BTreeMap::new(),
            path: String::new(),
            deployed: None,
        };

        let (status, extra) = match build.execute(&steps).await {
            Ok(()) => {
                let extra = build.deployed.as_ref().map(|outcome| {
                    serde_json::json!({
                        "output_url": outcome.output_url,
                        "local_directory": outcome.local_directory,
                    })
                });
                (BuildStatus::Success, extra)
            }
            Err(StageError::Cancelled(reason)) => {
                tracing::info!(build_id = job.build_id, "cancelled build, {reason}");
                (BuildStatus::Cancelled, None)
            }
            Err(e) => {
                tracing::error!(build_id = job.build_id, "build failed: {e}");
                (BuildStatus::Failed, None)
            }
        };

        if let Some(workspace) = build.workspace.take() {
            let location = workspace.path().display().to_string();
            if let Err(e) = workspace.close() {
                tracing::warn!(build_id = job.build_id, "could not remove workspace {location}: {e}");
            }
        }

        if let Err(e) = self.status.finish_build(job.build_id, status, extra).await {
            tracing::error!(build_id = job.build_id, "could not record build result: {e:#}");
        }

        if let Some(directory) = build.deployed.and_then(|d| d.local_directory) {
            if status == BuildStatus::Success {
                let cleaned = self
                    .status
                    .cleanup_local_builds(
                        &job.repo_name,
                        job.ref_mode,
                        &job.ref_name,
                        Some(&directory),
                        Some(job.build_id),
                    )
                    .await;
                if let Err(e) = cleaned {
                    tracing::warn!(build_id = job.build_id, "could not clean previous builds: {e:#}");
                }
            }
        }

        metrics::build_ended();
        status
    }

    fn mirror_path(&self, repo_name: &str) -> PathBuf {
        self.settings.repos_directory.join(repo_name)
    }
}

#[async_trait]
impl BuildRunner for Pipeline {
    async fn run_build(&self, job: BuildJob) -> BuildStatus {
        self.run(&job).await
    }

    async fn clean_ref(&self, repo_name: &str, ref_mode: RefMode, ref_name: &str) -> anyhow::Result<()> {
        self.status
            .cleanup_local_builds(repo_name, ref_mode, ref_name, None, None)
            .await?;
        Ok(())
    }
}

/// `root_url` and `path` joined with a single slash.
fn url_path_join(root_url: &str, path: &str) -> String {
    let path = path.trim_start_matches('/');
    if root_url.is_empty() {
        path.to_string()
    } else {
        format!("{}/{path}", root_url.trim_end_matches('/'))
    }
}

impl BuildRun<'_> {
    async fn execute(&mut self, steps: &StepRunner) -> Result<(), StageError> {
        steps.run("update repository", self.update_repository()).await?;
        steps.run("create workspace", self.create_workspace()).await?;
        steps.run("read .peon.yml", self.read_config()).await?;

        let (commands, has_cache) = {
            let manifest = self.manifest()?;
            (manifest.commands.clone(), !manifest.cache.is_empty())
        };

        if has_cache {
            steps.run("restore cache", self.restore_cache()).await?;
        }

        for command in &commands {
            let step = steps.start(&format!("run {command}")).await?;
            let result = self.run_command(command, step.output()).await;
            step.finish(result).await?;
        }

        if has_cache {
            steps.run("save cache", self.save_cache()).await?;
        }

        steps.run("deploy", self.deploy()).await
    }

    fn workspace(&self) -> Result<&Path, StageError> {
        self.workspace
            .as_ref()
            .map(TempDir::path)
            .ok_or_else(|| StageError::fatal(anyhow::anyhow!("workspace was not created")))
    }

    fn manifest(&self) -> Result<&Manifest, StageError> {
        self.manifest
            .as_ref()
            .ok_or_else(|| StageError::fatal(anyhow::anyhow!(".peon.yml was not read")))
    }

    async fn update_repository(&self) -> StageResult {
        let mirror = self.pipeline.mirror_path(&self.job.repo_name);
        let cloned = git_service::update_mirror(&self.job.repo_url, &mirror)
            .await
            .map_err(StageError::Fatal)?;

        let action = if cloned { "cloned" } else { "fetched" };
        tracing::debug!(build_id = self.job.build_id, mirror = %mirror.display(), "{action} repository");
        Ok(Some(format!("{action} {}", self.job.repo_url)))
    }

    async fn create_workspace(&mut self) -> StageResult {
        let root = &self.pipeline.settings.workspace_root;
        tokio::fs::create_dir_all(root)
            .await
            .map_err(StageError::fatal)?;
        let workspace = tempfile::Builder::new()
            .prefix(&format!("peon-workspace-{}-", self.job.repo_name))
            .tempdir_in(root)
            .map_err(StageError::fatal)?;

        tracing::debug!(build_id = self.job.build_id, workspace = %workspace.path().display(), "checking out {}", self.job.sha);
        let mirror = self.pipeline.mirror_path(&self.job.repo_name);
        let checkout = git_service::checkout_workspace(&mirror, workspace.path(), &self.job.sha).await;
        self.workspace = Some(workspace);
        checkout.map_err(StageError::Fatal)?;
        Ok(None)
    }

    async fn read_config(&mut self) -> StageResult {
        let job = self.job;
        let manifest = Manifest::load(self.workspace()?)
            .await
            .map_err(StageError::fatal)?;

        manifest
            .admits(job.ref_mode, &job.ref_name)
            .map_err(StageError::Cancelled)?;

        let resolved = manifest
            .resolve_destination(&self.pipeline.settings.destinations, job.ref_mode, &job.ref_name)
            .map_err(StageError::fatal)?;

        let (branch, tag) = match job.ref_mode {
            RefMode::Branch => (job.ref_name.as_str(), ""),
            RefMode::Tag => ("", job.ref_name.as_str()),
        };
        let mut env = Environment::new();
        env.insert("PEON_BUILD_ID", job.build_id.to_string());
        env.insert(
            "PEON_BUILD_DATE",
            self.started.to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        env.insert(
            "PEON_ROOT_URL",
            url_path_join(&resolved.destination.root_url, &resolved.path_template),
        );
        env.insert("PEON_REPO_NAME", job.repo_name.as_str());
        env.insert("PEON_BRANCH", branch);
        env.insert("PEON_TAG", tag);
        env.insert("PEON_REF", job.ref_name.as_str());
        env.insert("PEON_COMMIT", job.sha.as_str());
        env.extend(manifest.environment.clone());

        let path = env
            .evaluate(&resolved.path_template)
            .map_err(StageError::fatal)?;
        manifest::check_destination_path(&resolved.path_template, &path)
            .map_err(StageError::fatal)?;
        self.env = env.evaluate_all().map_err(StageError::fatal)?;

        tracing::info!(build_id = job.build_id, destination = %resolved.name, path = %path, "resolved destination");
        let summary = format!("deploying to {} under {path}", resolved.name);
        self.path = path;
        self.destination = Some(resolved);
        self.manifest = Some(manifest);
        Ok(Some(summary))
    }

    async fn restore_cache(&mut self) -> StageResult {
        let (Some(manifest), Some(workspace)) = (self.manifest.as_mut(), self.workspace.as_ref()) else {
            return Err(StageError::fatal(anyhow::anyhow!("workspace was not prepared")));
        };

        let restored = self
            .pipeline
            .cache
            .restore(&self.job.repo_name, workspace.path(), &mut manifest.cache)
            .await
            .map_err(|e| StageError::Warning(e.to_string()))?;

        Ok(Some(if restored.is_empty() {
            "found nothing to restore".to_string()
        } else {
            format!("restored paths {}", restored.join(", "))
        }))
    }

    async fn save_cache(&mut self) -> StageResult {
        let (Some(manifest), Some(workspace)) = (self.manifest.as_mut(), self.workspace.as_ref()) else {
            return Err(StageError::fatal(anyhow::anyhow!("workspace was not prepared")));
        };

        let saved = self
            .pipeline
            .cache
            .save(&self.job.repo_name, workspace.path(), &mut manifest.cache)
            .await
            .map_err(|e| StageError::Warning(e.to_string()))?;

        Ok(Some(if saved.is_empty() {
            "found nothing to save".to_string()
        } else {
            format!("saved paths {}", saved.join(", "))
        }))
    }

    async fn run_command(&self, command: &str, output: StepOutput) -> StageResult {
        let captured = executor::run_shell(command, self.workspace()?, &self.env, |line| {
            output.push(line)
        })
        .await
        .map_err(StageError::fatal)?;
        Ok(Some(captured))
    }

    async fn deploy(&mut self) -> StageResult {
        let output_dir = self.workspace()?.join(&self.manifest()?.output);
        let destination = self
            .destination
            .as_ref()
            .ok_or_else(|| StageError::fatal(anyhow::anyhow!("no destination resolved")))?;

        let outcome = deploy_service::deploy(
            &self.job.repo_name,
            &output_dir,
            &destination.destination,
            &self.path,
        )
        .await
        .map_err(StageError::Fatal)?;

        tracing::info!(build_id = self.job.build_id, url = %outcome.output_url, "built {} successfully", self.job.sha);
        let summary = format!("deployed to {}", outcome.output_url);
        self.deployed = Some(outcome);
        Ok(Some(summary))
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::models::StepStatus;
    use crate::services::git_service::tests::{commit_files, init_repo};
    use crate::services::status_service::tests::test_service;
    use crate::store::memory::MemoryDatastore;
    use crate::store::Datastore;

    struct Fixture {
        root: TempDir,
        source: PathBuf,
        pipeline: Pipeline,
        status: Arc<StatusService>,
        store: Arc<MemoryDatastore>,
        cache: Arc<CacheService>,
    }

    impl Fixture {
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            let source = root.path().join("source/app");
            init_repo(&source);

            let (status, store, _) = test_service();
            let cache = Arc::new(CacheService::new(
                root.path().join("cache"),
                Duration::from_secs(3600),
                None,
            ));
            let destinations = HashMap::from([(
                "local".to_string(),
                Destination {
                    target: root.path().join("www").to_string_lossy().to_string(),
                    root_url: "/builds".to_string(),
                    absolute_url: "https://builds.example.com".to_string(),
                    shell: None,
                },
            )]);
            let pipeline = Pipeline::new(
                PipelineSettings {
                    repos_directory: root.path().join("repos"),
                    workspace_root: root.path().join("tmp"),
                    destinations,
                },
                status.clone(),
                cache.clone(),
            );

            Self {
                root,
                source,
                pipeline,
                status,
                store,
                cache,
            }
        }

        fn commit(&self, files: &[(&str, &str)]) -> String {
            commit_files(&self.source, files)
        }

        async fn build(&self, ref_mode: RefMode, ref_name: &str, sha: &str) -> (i64, BuildStatus) {
            let url = self.source.to_string_lossy().to_string();
            let build_id = self
                .status
                .start_build("app", &url, ref_mode, ref_name, sha)
                .await
                .unwrap();
            let job = BuildJob {
                build_id,
                repo_name: "app".to_string(),
                repo_url: url,
                ref_mode,
                ref_name: ref_name.to_string(),
                sha: sha.to_string(),
            };
            (build_id, self.pipeline.run(&job).await)
        }

        async fn steps(&self, build_id: i64) -> Vec<(String, StepStatus, String)> {
            self.store
                .get_steps(build_id)
                .await
                .unwrap()
                .into_iter()
                .map(|s| (s.description, s.status, s.output.unwrap_or_default()))
                .collect()
        }

        fn path(&self, relative: &str) -> PathBuf {
            self.root.path().join(relative)
        }
    }

    const SIMPLE_MANIFEST: &str = r#"
output: dist
commands:
  - mkdir -p dist && echo "$PEON_REF $GREETING" > dist/file
destinations:
  - name: local
environment:
  GREETING: hello from $PEON_REPO_NAME
"#;

    #[tokio::test]
    async fn builds_and_deploys_a_branch() {
        let fixture = Fixture::new();
        let sha = fixture.commit(&[(".peon.yml", SIMPLE_MANIFEST)]);

        let (id, status) = fixture.build(RefMode::Branch, "main", &sha).await;

        assert_eq!(status, BuildStatus::Success);
        assert_eq!(
            std::fs::read_to_string(fixture.path("www/app/main/file")).unwrap(),
            "main hello from app\n"
        );
        let steps = fixture.steps(id).await;
        let descriptions: Vec<_> = steps.iter().map(|(d, _, _)| d.as_str()).collect();
        assert_eq!(
            descriptions,
            vec![
                "update repository",
                "create workspace",
                "read .peon.yml",
                "run mkdir -p dist && echo \"$PEON_REF $GREETING\" > dist/file",
                "deploy",
            ]
        );
        assert!(steps.iter().all(|(_, s, _)| *s == StepStatus::Success));

        let build = fixture.store.get_build(id).await.unwrap().unwrap();
        assert_eq!(
            build.extra_str("output_url"),
            Some("https://builds.example.com/app/main")
        );
        let leftovers = std::fs::read_dir(fixture.path("tmp")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn rebuilding_a_ref_marks_the_previous_build_cleaned() {
        let fixture = Fixture::new();
        let sha = fixture.commit(&[(".peon.yml", SIMPLE_MANIFEST)]);

        let (first, _) = fixture.build(RefMode::Branch, "main", &sha).await;
        let (second, status) = fixture.build(RefMode::Branch, "main", &sha).await;

        assert_eq!(status, BuildStatus::Success);
        let first = fixture.store.get_build(first).await.unwrap().unwrap();
        let second = fixture.store.get_build(second).await.unwrap().unwrap();
        assert_eq!(first.status, BuildStatus::Cleaned);
        assert_eq!(second.status, BuildStatus::Success);
        assert!(fixture.path("www/app/main/file").exists());
    }

    #[tokio::test]
    async fn tags_are_built_only_when_listed() {
        let fixture = Fixture::new();
        let sha = fixture.commit(&[(
            ".peon.yml",
            r#"
output: dist
commands:
  - mkdir -p dist && echo "$PEON_TAG" > dist/tag
tags: ["^v"]
destinations:
  - name: local
    path: $PEON_REPO_NAME/tags/$PEON_TAG
"#,
        )]);

        let (_, released) = fixture.build(RefMode::Tag, "v1.0", &sha).await;
        let (beta, cancelled) = fixture.build(RefMode::Tag, "beta", &sha).await;

        assert_eq!(released, BuildStatus::Success);
        assert_eq!(
            std::fs::read_to_string(fixture.path("www/app/tags/v1.0/tag")).unwrap(),
            "v1.0\n"
        );
        assert_eq!(cancelled, BuildStatus::Cancelled);
        let steps = fixture.steps(beta).await;
        assert_eq!(steps.len(), 3);
        assert_eq!(
            steps[2],
            (
                "read .peon.yml".to_string(),
                StepStatus::Failed,
                "tag beta is not present in .peon.yml".to_string()
            )
        );
    }

    #[tokio::test]
    async fn failing_command_aborts_before_deploy() {
        let fixture = Fixture::new();
        let sha = fixture.commit(&[(
            ".peon.yml",
            r#"
output: dist
commands:
  - echo oops >&2; exit 2
  - mkdir dist
destinations:
  - name: local
"#,
        )]);

        let (id, status) = fixture.build(RefMode::Branch, "main", &sha).await;

        assert_eq!(status, BuildStatus::Failed);
        let steps = fixture.steps(id).await;
        let (description, step_status, output) = steps.last().unwrap();
        assert_eq!(description, "run echo oops >&2; exit 2");
        assert_eq!(*step_status, StepStatus::Failed);
        assert!(output.contains("[stderr] oops"), "{output}");
        assert!(output.contains("exited with error code 2"), "{output}");
        assert!(!fixture.path("www/app/main").exists());
    }

    #[tokio::test]
    async fn rejects_destination_paths_leaving_the_root() {
        let fixture = Fixture::new();
        let sha = fixture.commit(&[(
            ".peon.yml",
            r#"
output: dist
commands: ["mkdir dist"]
destinations:
  - name: local
    path: ../$PEON_REF
"#,
        )]);

        let (id, status) = fixture.build(RefMode::Branch, "main", &sha).await;

        assert_eq!(status, BuildStatus::Failed);
        let steps = fixture.steps(id).await;
        assert_eq!(
            steps.last().unwrap().2,
            "invalid relative destination path '../$PEON_REF' (resolves to '../main') in .peon.yml"
        );
    }

    #[tokio::test]
    async fn rejects_destination_paths_naming_the_root() {
        let fixture = Fixture::new();
        let sha = fixture.commit(&[(".peon.yml", SIMPLE_MANIFEST)]);
        fixture.build(RefMode::Branch, "main", &sha).await;
        let sha = fixture.commit(&[(
            ".peon.yml",
            r#"
output: dist
commands: ["mkdir dist"]
destinations:
  - name: local
    path: $UNSET
"#,
        )]);

        let (id, status) = fixture.build(RefMode::Branch, "main", &sha).await;

        assert_eq!(status, BuildStatus::Failed);
        let steps = fixture.steps(id).await;
        assert_eq!(
            steps.last().unwrap().2,
            "invalid relative destination path '$UNSET' (resolves to '') in .peon.yml"
        );
        assert!(fixture.path("www/app/main/file").exists());
    }

    #[tokio::test]
    async fn caches_paths_keyed_by_source_file() {
        let fixture = Fixture::new();
        let manifest = r#"
output: dist
commands:
  - test -f deps/marker || (mkdir -p deps && echo fresh > deps/marker)
  - mkdir -p dist
cache:
  - path: deps
    source: deps.lock
destinations:
  - name: local
"#;
        let sha = fixture.commit(&[(".peon.yml", manifest), ("deps.lock", "v1")]);

        let (first, _) = fixture.build(RefMode::Branch, "main", &sha).await;
        let (second, _) = fixture.build(RefMode::Branch, "main", &sha).await;

        let output_of = |steps: &[(String, StepStatus, String)], name: &str| {
            steps
                .iter()
                .find(|(d, _, _)| d == name)
                .map(|(_, _, o)| o.clone())
                .unwrap()
        };
        let first_steps = fixture.steps(first).await;
        assert_eq!(output_of(&first_steps, "restore cache"), "found nothing to restore");
        assert_eq!(output_of(&first_steps, "save cache"), "saved paths deps");
        let second_steps = fixture.steps(second).await;
        assert_eq!(output_of(&second_steps, "restore cache"), "restored paths deps");
        assert_eq!(output_of(&second_steps, "save cache"), "found nothing to save");

        let archives = |fixture: &Fixture| -> Vec<PathBuf> {
            let mut found: Vec<_> = std::fs::read_dir(fixture.cache.directory())
                .unwrap()
                .map(|e| e.unwrap().path())
                .filter(|p| p.extension().is_some_and(|e| e == "tar"))
                .collect();
            found.sort();
            found
        };
        let stale = archives(&fixture);
        assert_eq!(stale.len(), 1);

        let updated = fixture.commit(&[("deps.lock", "v2")]);
        let (third, _) = fixture.build(RefMode::Branch, "main", &updated).await;
        let third_steps = fixture.steps(third).await;
        assert_eq!(output_of(&third_steps, "save cache"), "saved paths deps");
        assert_eq!(archives(&fixture).len(), 2);

        let expired = SystemTime::now() - Duration::from_secs(2 * 3600);
        std::fs::File::options()
            .write(true)
            .open(&stale[0])
            .unwrap()
            .set_modified(expired)
            .unwrap();
        assert_eq!(fixture.cache.prune().await.unwrap(), 1);
        let remaining = archives(&fixture);
        assert_eq!(remaining.len(), 1);
        assert_ne!(remaining[0], stale[0]);
    }
}
