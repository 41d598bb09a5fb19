//! Version-control publish step.
//!
//! Every persisted backlog mutation is followed by a commit-and-push so the
//! next invocation observes a consistent view. Push rejection is not fatal:
//! the helper rebases and retries once, then leaves the commit local. A
//! superseded invocation simply does not publish, and the work is recomputed
//! by the run that owns the up-to-date backlog.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

/// Version-control collaborator contract.
pub trait Vcs: Send + Sync {
    /// Stage `paths`, commit with `message`, and push. Returns `false` when
    /// nothing was staged (a no-op, not an error).
    fn commit_and_push(&self, paths: &[&str], message: &str) -> Result<bool>;
}

/// Shells out to `git` in the repository root.
pub struct GitVcs {
    root: PathBuf,
}

impl GitVcs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn git(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .with_context(|| format!("failed to run git {}", args.join(" ")))
    }

    fn git_ok(&self, args: &[&str]) -> Result<()> {
        let output = self.git(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(())
    }

    fn has_staged_changes(&self) -> Result<bool> {
        // `diff --cached --quiet` exits 1 when the index differs from HEAD
        let output = self.git(&["diff", "--cached", "--quiet"])?;
        Ok(!output.status.success())
    }
}

impl Vcs for GitVcs {
    fn commit_and_push(&self, paths: &[&str], message: &str) -> Result<bool> {
        let mut add = vec!["add", "--"];
        add.extend(paths);
        self.git_ok(&add)?;

        if !self.has_staged_changes()? {
            debug!(message, "nothing staged, skipping commit");
            return Ok(false);
        }
        self.git_ok(&["commit", "-m", message])?;

        let push = self.git(&["push"])?;
        if push.status.success() {
            return Ok(true);
        }

        // Rejected push: the remote advanced. Rebase and retry once, then
        // leave the commit local for the next run to publish.
        warn!("push rejected, rebasing and retrying once");
        let rebase = self.git(&["pull", "--rebase"])?;
        if rebase.status.success() {
            let retry = self.git(&["push"])?;
            if retry.status.success() {
                return Ok(true);
            }
        }
        warn!(
            message,
            "push still rejected after rebase; leaving commit unpublished"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn init_repo(dir: &Path) {
        let run = |args: &[&str]| {
            let out = Command::new("git")
                .args(args)
                .current_dir(dir)
                .output()
                .unwrap();
            assert!(out.status.success(), "git {args:?} failed");
        };
        run(&["init", "-q"]);
        run(&["config", "user.email", "test@triad.dev"]);
        run(&["config", "user.name", "Triad Test"]);
        fs::write(dir.join("seed.txt"), "seed").unwrap();
        run(&["add", "-A"]);
        run(&["commit", "-q", "-m", "seed"]);
    }

    #[test]
    fn test_commit_without_remote_still_records_the_commit() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        fs::write(dir.path().join("backlog.txt"), "items").unwrap();

        let vcs = GitVcs::new(dir.path());
        // no remote configured: push fails, rebase fails, commit stays local
        let committed = vcs
            .commit_and_push(&["backlog.txt"], "backlog: update")
            .unwrap();
        assert!(committed);

        let log = Command::new("git")
            .args(["log", "--oneline"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        let log = String::from_utf8_lossy(&log.stdout);
        assert!(log.contains("backlog: update"));
    }

    #[test]
    fn test_nothing_staged_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());

        let vcs = GitVcs::new(dir.path());
        let committed = vcs.commit_and_push(&["seed.txt"], "no change").unwrap();
        assert!(!committed);
    }
}
