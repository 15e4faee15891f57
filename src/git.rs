use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::info;

use crate::error::{Result, ReviewError};

/// Run git with *repo* as working tree and return stdout.
pub fn git(repo: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ReviewError::Git(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Run git and report only whether it exited zero.
pub fn git_ok(repo: &Path, args: &[&str]) -> bool {
    Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Transient snapshot of the repository, reconstructed from disk each run.
#[derive(Debug, Clone)]
pub struct RepoState {
    pub root: PathBuf,
    pub branch: String,
    pub head: Option<String>,
    pub dirty: bool,
    pub written_paths: std::collections::BTreeSet<String>,
}

impl RepoState {
    pub fn read(root: &Path) -> Result<Self> {
        if !root.join(".git").exists() {
            return Err(ReviewError::Git(format!(
                "not a git repository: {}",
                root.display()
            )));
        }

        let branch = git(root, &["rev-parse", "--abbrev-ref", "HEAD"])
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "HEAD".to_string());
        let head = head_commit(root);
        let dirty = !git(root, &["status", "--porcelain"])?.trim().is_empty();

        Ok(Self {
            root: root.to_path_buf(),
            branch,
            head,
            dirty,
            written_paths: Default::default(),
        })
    }

    pub fn mark_written(&mut self, rel_path: &str) {
        self.written_paths.insert(rel_path.to_string());
    }

    pub fn refresh_head(&mut self) {
        self.head = head_commit(&self.root);
    }
}

/// HEAD commit id, or `None` on an unborn branch.
pub fn head_commit(repo: &Path) -> Option<String> {
    git(repo, &["rev-parse", "--verify", "-q", "HEAD"])
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// True when *rel_path* differs from HEAD, staged or unstaged.
pub fn has_local_changes(repo: &Path, rel_path: &str) -> Result<bool> {
    let status = git(repo, &["status", "--porcelain", "--", rel_path])?;
    Ok(!status.trim().is_empty())
}

/// True when *rel_path* is present in the index.
pub fn is_tracked(repo: &Path, rel_path: &str) -> bool {
    git_ok(repo, &["ls-files", "--error-unmatch", "--", rel_path])
}

/// True when the index holds staged changes pending commit.
pub fn index_has_changes(repo: &Path) -> bool {
    !git_ok(repo, &["diff", "--cached", "--quiet"])
}

/// Stage exactly the given pathspecs. Never `add -A`, never wildcards.
pub fn stage_paths(repo: &Path, paths: &[&str]) -> Result<()> {
    for path in paths {
        git(repo, &["add", "--", path])?;
    }
    Ok(())
}

/// Drop any staged changes for the given pathspecs (error-path cleanup).
pub fn unstage_paths(repo: &Path, paths: &[&str]) {
    for path in paths {
        let _ = Command::new("git")
            .args(["reset", "-q", "--", path])
            .current_dir(repo)
            .output();
    }
}

pub fn commit(repo: &Path, message: &str) -> Result<String> {
    git(repo, &["commit", "-m", message])?;
    head_commit(repo).ok_or_else(|| {
        ReviewError::GitIndexCorrupt("commit succeeded but HEAD is unreadable".into())
    })
}

/// Files touched by *commit_id*, for commit-scope assertions and logs.
pub fn commit_files(repo: &Path, commit_id: &str) -> Result<Vec<String>> {
    let out = git(
        repo,
        &["diff-tree", "--no-commit-id", "--name-only", "-r", "--root", commit_id],
    )?;
    Ok(out.lines().map(|l| l.to_string()).filter(|l| !l.is_empty()).collect())
}

/// Create (or reset) branch *name* at the current HEAD and switch to it.
pub fn checkout_branch(repo: &Path, name: &str) -> Result<()> {
    git(repo, &["switch", "-C", name])?;
    info!(
        "switched to branch {name} (base={})",
        head_commit(repo).as_deref().unwrap_or("<no-commits-yet>")
    );
    Ok(())
}

pub fn push_branch(repo: &Path, remote: &str, branch: &str) -> Result<()> {
    info!("pushing {branch} to {remote}");
    git(repo, &["push", "-u", remote, branch])?;
    Ok(())
}

/// Shallow-clone *url* into *dest*.
pub fn clone_shallow(url: &str, dest: &Path) -> Result<()> {
    info!("cloning {url} into {}", dest.display());
    let output = Command::new("git")
        .args(["clone", "--depth", "1", url])
        .arg(dest)
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ReviewError::Git(format!("clone failed: {}", stderr.trim())));
    }
    Ok(())
}

/// Loose match for things that are clone URLs rather than local paths.
pub fn looks_like_git_url(arg: &str) -> bool {
    let arg = arg.trim();
    arg.starts_with("https://")
        || arg.starts_with("http://")
        || arg.starts_with("git@")
        || arg.starts_with("ssh://")
        || arg.ends_with(".git")
}

/// Record an executable-bit change directly in the index. Used where the
/// filesystem cannot represent permissions; git still tracks the mode.
#[cfg(not(unix))]
pub fn index_chmod(repo: &Path, rel_path: &str, executable: bool) -> Result<()> {
    let flag = if executable { "--chmod=+x" } else { "--chmod=-x" };
    tracing::debug!("index chmod {flag} {rel_path}");
    git(repo, &["update-index", flag, "--", rel_path])?;
    Ok(())
}
