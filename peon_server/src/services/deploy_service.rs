//! Deploy service — publishes a build's output directory to its destination.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};

use crate::config::Destination;
use crate::services::executor::run_tool;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployOutcome {
    /// Where the deployed output is served.
    pub output_url: String,
    /// Deployed directory, for local destinations only.
    pub local_directory: Option<PathBuf>,
}

/// Publish `output_dir` under `path` inside `destination`.
pub async fn deploy(
    repo_name: &str,
    output_dir: &Path,
    destination: &Destination,
    path: &str,
) -> anyhow::Result<DeployOutcome> {
    let is_dir = tokio::fs::metadata(output_dir)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    if !is_dir {
        bail!("output directory {} not found", output_dir.display());
    }

    let local_directory = if destination.is_remote() {
        deploy_remote(repo_name, output_dir, destination, path).await?;
        None
    } else {
        let target = Path::new(&destination.target).join(path);
        tracing::info!(repo = repo_name, target = %target.display(), "copying output");
        tokio::fs::create_dir_all(&target)
            .await
            .with_context(|| format!("creating {}", target.display()))?;
        copy_dir(output_dir, &target).await?;
        Some(target)
    };

    Ok(DeployOutcome {
        output_url: output_url(&destination.absolute_url, path),
        local_directory,
    })
}

/// `absolute_url` joined with `path`; not a filesystem join because of the scheme.
pub fn output_url(absolute_url: &str, path: &str) -> String {
    if absolute_url.ends_with('/') {
        format!("{absolute_url}{path}")
    } else {
        format!("{absolute_url}/{path}")
    }
}

/// rsync only creates the last missing directory on the remote side, so the
/// output is first staged as `<tmp>/<path>` and `<tmp>/` is sent to the
/// destination root.
async fn deploy_remote(
    repo_name: &str,
    output_dir: &Path,
    destination: &Destination,
    path: &str,
) -> anyhow::Result<()> {
    let staging = tempfile::Builder::new()
        .prefix(&format!("peon-output-{repo_name}-"))
        .tempdir()
        .context("creating staging directory")?;
    stage_output(output_dir, staging.path(), path).await?;

    let args = rsync_args(staging.path(), destination);
    tracing::info!(repo = repo_name, target = %destination.target, "sending output with rsync");
    run_tool("rsync", &args, None)
        .await
        .context("transferring output")?;
    Ok(())
}

/// Sends the contents of `staging` (not the directory itself) to the destination root.
fn rsync_args(staging: &Path, destination: &Destination) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["--partial".into(), "--recursive".into(), "--compress".into()];
    if let Some(shell) = &destination.shell {
        args.push("-e".into());
        args.push(shell.into());
    }
    args.push(with_trailing_slash(&staging.to_string_lossy()).into());
    args.push(with_trailing_slash(&destination.target).into());
    args
}

/// Move `output_dir` to `staging/path`, creating intermediate directories.
async fn stage_output(output_dir: &Path, staging: &Path, path: &str) -> anyhow::Result<PathBuf> {
    let staged = staging.join(path);
    if let Some(parent) = staged.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    tracing::debug!(from = %output_dir.display(), to = %staged.display(), "staging output");

    // rename fails across filesystems; the temp dir is often on another one.
    if tokio::fs::rename(output_dir, &staged).await.is_err() {
        tokio::fs::create_dir_all(&staged)
            .await
            .with_context(|| format!("creating {}", staged.display()))?;
        copy_dir(output_dir, &staged).await?;
        tokio::fs::remove_dir_all(output_dir)
            .await
            .with_context(|| format!("removing {}", output_dir.display()))?;
    }
    Ok(staged)
}

fn with_trailing_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

/// Copy the contents of `from` into the existing directory `to`, overwriting files.
pub async fn copy_dir(from: &Path, to: &Path) -> anyhow::Result<()> {
    let mut pending = vec![(from.to_path_buf(), to.to_path_buf())];

    while let Some((source, target)) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&source)
            .await
            .with_context(|| format!("reading {}", source.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let destination = target.join(entry.file_name());

            if file_type.is_dir() {
                tokio::fs::create_dir_all(&destination)
                    .await
                    .with_context(|| format!("creating {}", destination.display()))?;
                pending.push((entry.path(), destination));
            } else if file_type.is_symlink() {
                let link = tokio::fs::read_link(entry.path()).await?;
                let _ = tokio::fs::remove_file(&destination).await;
                tokio::fs::symlink(&link, &destination)
                    .await
                    .with_context(|| format!("linking {}", destination.display()))?;
            } else {
                tokio::fs::copy(entry.path(), &destination)
                    .await
                    .with_context(|| format!("copying to {}", destination.display()))?;
            }
        }
    }
    Ok(())
}
