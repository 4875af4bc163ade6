//! Git plumbing: bare mirrors, per-build workspaces and branch heads.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::Path;

use anyhow::Context;

use crate::services::executor::run_tool;

/// Branch every workspace checks the build commit out on.
pub const WORKSPACE_BRANCH: &str = "peon-build";

/// Last path segment of a repository URL, without `.git`.
pub fn repo_name_from_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let last = trimmed
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(trimmed);
    last.strip_suffix(".git").unwrap_or(last).to_string()
}

/// Clone `url` as a bare mirror at `mirror`, or fetch into it when it exists.
///
/// Returns `true` when the mirror was freshly cloned.
pub async fn update_mirror(url: &str, mirror: &Path) -> anyhow::Result<bool> {
    if tokio::fs::try_exists(mirror.join("HEAD")).await.unwrap_or(false) {
        run_tool("git", ["fetch", "--prune", "origin"], Some(mirror))
            .await
            .with_context(|| format!("fetching {url}"))?;
        return Ok(false);
    }

    if let Some(parent) = mirror.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    run_tool(
        "git",
        [
            OsStr::new("clone"),
            OsStr::new("--mirror"),
            OsStr::new(url),
            mirror.as_os_str(),
        ],
        None,
    )
    .await
    .with_context(|| format!("cloning {url}"))?;
    Ok(true)
}

/// Clone `mirror` into `workspace` and check out `sha` on [`WORKSPACE_BRANCH`].
pub async fn checkout_workspace(mirror: &Path, workspace: &Path, sha: &str) -> anyhow::Result<()> {
    run_tool(
        "git",
        [
            OsStr::new("clone"),
            OsStr::new("-q"),
            mirror.as_os_str(),
            workspace.as_os_str(),
        ],
        None,
    )
    .await
    .context("cloning mirror into workspace")?;

    run_tool(
        "git",
        ["checkout", "-q", "-b", WORKSPACE_BRANCH, sha],
        Some(workspace),
    )
    .await
    .with_context(|| format!("checking out {sha}"))?;
    Ok(())
}

/// Branch name to head commit for every branch of `mirror`.
pub async fn branch_heads(mirror: &Path) -> anyhow::Result<BTreeMap<String, String>> {
    let listing = run_tool(
        "git",
        ["for-each-ref", "--format=%(refname) %(objectname)", "refs/heads"],
        Some(mirror),
    )
    .await
    .context("listing branches")?;

    Ok(listing
        .lines()
        .filter_map(|line| {
            let (reference, sha) = line.split_once(' ')?;
            let branch = reference.strip_prefix("refs/heads/")?;
            Some((branch.to_string(), sha.to_string()))
        })
        .collect())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::path::Path;
    use std::process::Command;

    use pretty_assertions::assert_eq;

    use super::*;

    fn git(dir: &Path, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(["-c", "user.name=peon", "-c", "user.email=peon@localhost"])
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// Initialise a repository on branch `main`.
    pub(crate) fn init_repo(dir: &Path) {
        std::fs::create_dir_all(dir).unwrap();
        git(dir, &["init", "-q"]);
        git(dir, &["checkout", "-q", "-b", "main"]);
    }

    /// Write `files` and commit them on the current branch, returning the commit.
    pub(crate) fn commit_files(dir: &Path, files: &[(&str, &str)]) -> String {
        for (path, content) in files {
            let path = dir.join(path);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
        git(dir, &["add", "-A"]);
        git(dir, &["commit", "-q", "-m", "change"]);
        git(dir, &["rev-parse", "HEAD"])
    }

    pub(crate) fn create_branch(dir: &Path, branch: &str) {
        git(dir, &["branch", branch]);
    }

    #[test]
    fn names_repositories_after_their_url() {
        assert_eq!(repo_name_from_url("git@github.com:org/app.git"), "app");
        assert_eq!(repo_name_from_url("https://github.com/org/app"), "app");
        assert_eq!(repo_name_from_url("/srv/git/app.git/"), "app");
        assert_eq!(repo_name_from_url("git@host:app.git"), "app");
    }

    #[tokio::test]
    async fn mirrors_and_checks_out_commits() {
        let root = tempfile::tempdir().unwrap();
        let source = root.path().join("source");
        init_repo(&source);
        let first = commit_files(&source, &[("a.txt", "one")]);
        let second = commit_files(&source, &[("a.txt", "two")]);

        let mirror = root.path().join("repos/app");
        let url = source.to_string_lossy().to_string();
        assert!(update_mirror(&url, &mirror).await.unwrap());
        assert!(!update_mirror(&url, &mirror).await.unwrap());

        let workspace = root.path().join("workspace");
        checkout_workspace(&mirror, &workspace, &first).await.unwrap();

        assert_eq!(std::fs::read_to_string(workspace.join("a.txt")).unwrap(), "one");
        assert_eq!(git(&workspace, &["rev-parse", "--abbrev-ref", "HEAD"]), WORKSPACE_BRANCH);
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn lists_branch_heads_after_fetch() {
        let root = tempfile::tempdir().unwrap();
        let source = root.path().join("source");
        init_repo(&source);
        let main = commit_files(&source, &[("a.txt", "one")]);
        let mirror = root.path().join("mirror");
        let url = source.to_string_lossy().to_string();
        update_mirror(&url, &mirror).await.unwrap();

        create_branch(&source, "feature");
        let newer = commit_files(&source, &[("a.txt", "two")]);
        update_mirror(&url, &mirror).await.unwrap();

        let heads = branch_heads(&mirror).await.unwrap();
        assert_eq!(
            heads,
            BTreeMap::from([
                ("feature".to_string(), main),
                ("main".to_string(), newer),
            ])
        );
    }
}
