//! Git worktree management for parallel feature development.
//!
//! Each feature gets an isolated checkout at
//! `<project>/<worktree_base>/<feature_id>` on branch `feature/<id>`, so
//! several assistant sessions can work simultaneously without branch
//! switching.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use forge_core::types::Feature;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("worktree already exists: {0}")]
    AlreadyExists(PathBuf),
    #[error("worktree does not exist: {0}")]
    Missing(PathBuf),
    #[error("branch {0} is not merged into {1}; use force to remove anyway")]
    NotMerged(String, String),
    #[error("uncommitted changes exist; commit or stash first:\n{0}")]
    DirtyWorktree(String),
    #[error("rebase conflict, aborted:\n{0}")]
    RebaseConflict(String),
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

/// One entry from `git worktree list --porcelain`.
#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub commit: String,
    pub is_main: bool,
}

/// Git status of a feature's worktree.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorktreeStatus {
    pub exists: bool,
    pub has_changes: bool,
    pub commit_count: usize,
    pub changes: Vec<String>,
    pub ahead_of_main: usize,
    pub behind_main: usize,
}

/// Manages worktrees for one project.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    repo_root: PathBuf,
    worktree_base: PathBuf,
    trunk: String,
}

impl WorktreeManager {
    pub fn new(repo_root: &Path, worktree_base: &str, trunk: impl Into<String>) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            worktree_base: repo_root.join(worktree_base),
            trunk: trunk.into(),
        }
    }

    pub fn worktree_path(&self, feature_id: &str) -> PathBuf {
        self.worktree_base.join(feature_id)
    }

    /// Worktree path if it exists on disk.
    pub fn existing_worktree_path(&self, feature_id: &str) -> Option<PathBuf> {
        let path = self.worktree_path(feature_id);
        path.exists().then_some(path)
    }

    fn run_git(&self, args: &[&str], cwd: Option<&Path>) -> Result<Output> {
        Ok(Command::new("git")
            .args(args)
            .current_dir(cwd.unwrap_or(&self.repo_root))
            .output()?)
    }

    fn run_git_checked(&self, args: &[&str], cwd: Option<&Path>) -> Result<Output> {
        let output = self.run_git(args, cwd)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorktreeError::CommandFailed(format!(
                "git {}: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(output)
    }

    /// Create a worktree for a feature.
    ///
    /// Creates branch `feature/<id>` from `base_branch` when it does not
    /// exist yet, then adds the worktree. Fails if the target directory is
    /// already present. The base directory is created on demand.
    pub fn create(&self, feature_id: &str, base_branch: &str) -> Result<PathBuf> {
        let branch = Feature::branch_name(feature_id);
        let worktree_path = self.worktree_path(feature_id);

        if worktree_path.exists() {
            return Err(WorktreeError::AlreadyExists(worktree_path));
        }

        std::fs::create_dir_all(&self.worktree_base)?;

        let exists = self
            .run_git(&["rev-parse", "--verify", &branch], None)?
            .status
            .success();
        if !exists {
            self.run_git_checked(&["branch", &branch, base_branch], None)?;
        }

        let path_str = worktree_path.to_string_lossy();
        self.run_git_checked(&["worktree", "add", path_str.as_ref(), &branch], None)?;

        Ok(worktree_path)
    }

    /// Remove a feature's worktree and optionally its branch.
    ///
    /// Refuses when the branch is not merged into trunk unless forced.
    /// With force, the force flag is passed through to `worktree remove`.
    /// Removing a missing worktree is a no-op.
    pub fn remove(&self, feature_id: &str, force: bool, delete_branch: bool) -> Result<()> {
        let worktree_path = self.worktree_path(feature_id);
        let branch = Feature::branch_name(feature_id);

        if !worktree_path.exists() {
            return Ok(());
        }

        if !force {
            let merged = self.run_git(&["branch", "--merged", &self.trunk], None)?;
            let merged_out = String::from_utf8_lossy(&merged.stdout);
            if !merged_out
                .lines()
                .any(|l| l.trim().trim_start_matches('*').trim() == branch)
            {
                return Err(WorktreeError::NotMerged(branch, self.trunk.clone()));
            }
        }

        let path_str = worktree_path.to_string_lossy().into_owned();
        if force {
            self.run_git_checked(&["worktree", "remove", &path_str, "--force"], None)?;
        } else {
            self.run_git_checked(&["worktree", "remove", &path_str], None)?;
        }

        if delete_branch {
            // Tolerate a missing branch.
            let flag = if force { "-D" } else { "-d" };
            self.run_git(&["branch", flag, &branch], None)?;
        }

        Ok(())
    }

    /// Git status for a feature's worktree: dirty paths plus ahead/behind
    /// counts relative to trunk.
    pub fn status(&self, feature_id: &str) -> Result<WorktreeStatus> {
        let worktree_path = self.worktree_path(feature_id);
        if !worktree_path.exists() {
            return Ok(WorktreeStatus::default());
        }

        let status = self.run_git(&["status", "--porcelain"], Some(&worktree_path))?;
        let changes: Vec<String> = String::from_utf8_lossy(&status.stdout)
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(ToString::to_string)
            .collect();

        let log = self.run_git(
            &["log", &format!("{}..HEAD", self.trunk), "--oneline"],
            Some(&worktree_path),
        )?;
        let commit_count = String::from_utf8_lossy(&log.stdout)
            .lines()
            .filter(|l| !l.trim().is_empty())
            .count();

        let mut ahead = commit_count;
        let mut behind = 0;
        let rev_list = self.run_git(
            &[
                "rev-list",
                "--left-right",
                "--count",
                &format!("{}...HEAD", self.trunk),
            ],
            Some(&worktree_path),
        )?;
        if rev_list.status.success() {
            let counts = String::from_utf8_lossy(&rev_list.stdout);
            let parts: Vec<&str> = counts.split_whitespace().collect();
            if parts.len() == 2 {
                behind = parts[0].parse().unwrap_or(0);
                ahead = parts[1].parse().unwrap_or(ahead);
            }
        }

        Ok(WorktreeStatus {
            exists: true,
            has_changes: !changes.is_empty(),
            commit_count,
            changes,
            ahead_of_main: ahead,
            behind_main: behind,
        })
    }

    /// Rebase a feature branch onto the fetched trunk head.
    ///
    /// Refuses on uncommitted changes. On conflict the rebase is aborted
    /// and the error carries a resolution hint; nothing is auto-resolved.
    pub fn sync_from_trunk(&self, feature_id: &str) -> Result<String> {
        let worktree_path = self.worktree_path(feature_id);
        if !worktree_path.exists() {
            return Err(WorktreeError::Missing(worktree_path));
        }

        let status = self.run_git(&["status", "--porcelain"], Some(&worktree_path))?;
        let dirty = String::from_utf8_lossy(&status.stdout);
        if !dirty.trim().is_empty() {
            return Err(WorktreeError::DirtyWorktree(format!(
                "cd {} && git add -A && git commit -m 'WIP: save progress'",
                worktree_path.display()
            )));
        }

        // Fetch may fail without a remote; the rebase below then targets
        // the local trunk ref.
        self.run_git(&["fetch", "origin", &self.trunk], None)?;

        let rebase_target = if self.has_remote_trunk()? {
            format!("origin/{}", self.trunk)
        } else {
            self.trunk.clone()
        };

        let rebase = self.run_git(&["rebase", &rebase_target], Some(&worktree_path))?;
        if !rebase.status.success() {
            self.run_git(&["rebase", "--abort"], Some(&worktree_path))?;
            return Err(WorktreeError::RebaseConflict(format!(
                "{}\nResolve manually:\n  cd {}\n  git rebase {}\n  # resolve conflicts\n  git rebase --continue",
                String::from_utf8_lossy(&rebase.stderr).trim(),
                worktree_path.display(),
                rebase_target
            )));
        }

        Ok(format!("Rebased {feature_id} onto {rebase_target}"))
    }

    fn has_remote_trunk(&self) -> Result<bool> {
        Ok(self
            .run_git(
                &[
                    "rev-parse",
                    "--verify",
                    &format!("refs/remotes/origin/{}", self.trunk),
                ],
                None,
            )?
            .status
            .success())
    }

    /// List all worktrees for the repository.
    pub fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>> {
        let output = self.run_git_checked(&["worktree", "list", "--porcelain"], None)?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_worktree_porcelain(&stdout, &self.repo_root))
    }

    /// Prune stale worktree references. Returns the number pruned.
    pub fn prune(&self) -> Result<usize> {
        let before = self.list_worktrees()?.len();
        self.run_git(&["worktree", "prune"], None)?;
        let after = self.list_worktrees()?.len();
        Ok(before.saturating_sub(after))
    }
}

/// Parse `git worktree list --porcelain` output.
pub fn parse_worktree_porcelain(stdout: &str, repo_root: &Path) -> Vec<WorktreeInfo> {
    let mut worktrees = Vec::new();
    let mut path: Option<PathBuf> = None;
    let mut commit: Option<String> = None;
    let mut branch: Option<String> = None;

    let mut flush =
        |path: &mut Option<PathBuf>, commit: &mut Option<String>, branch: &mut Option<String>| {
            if let Some(p) = path.take() {
                worktrees.push(WorktreeInfo {
                    is_main: p == repo_root,
                    path: p,
                    commit: commit.take().unwrap_or_else(|| "unknown".to_string()),
                    branch: branch.take(),
                });
            }
        };

    for line in stdout.lines() {
        if let Some(p) = line.strip_prefix("worktree ") {
            flush(&mut path, &mut commit, &mut branch);
            path = Some(PathBuf::from(p));
        } else if let Some(c) = line.strip_prefix("HEAD ") {
            commit = Some(c.chars().take(8).collect());
        } else if let Some(b) = line.strip_prefix("branch ") {
            branch = Some(b.trim_start_matches("refs/heads/").to_string());
        }
    }
    flush(&mut path, &mut commit, &mut branch);

    worktrees
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn git(dir: &Path, args: &[&str]) {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn setup_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        git(dir.path(), &["init", "-b", "main"]);
        git(dir.path(), &["config", "user.email", "test@test.com"]);
        git(dir.path(), &["config", "user.name", "Test"]);
        std::fs::write(dir.path().join("README.md"), "# Test").unwrap();
        git(dir.path(), &["add", "."]);
        git(dir.path(), &["commit", "-m", "Initial commit"]);
        dir
    }

    fn manager(dir: &TempDir) -> WorktreeManager {
        WorktreeManager::new(dir.path(), ".flowforge-worktrees", "main")
    }

    #[test]
    fn create_makes_branch_and_worktree() {
        let dir = setup_repo();
        let mgr = manager(&dir);

        let path = mgr.create("dark-mode", "main").unwrap();
        assert_eq!(path, dir.path().join(".flowforge-worktrees/dark-mode"));
        assert!(path.join("README.md").exists());

        let branches = Command::new("git")
            .args(["branch", "--list", "feature/dark-mode"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        assert!(String::from_utf8_lossy(&branches.stdout).contains("feature/dark-mode"));
    }

    #[test]
    fn create_fails_when_directory_exists() {
        let dir = setup_repo();
        let mgr = manager(&dir);
        mgr.create("dark-mode", "main").unwrap();

        assert!(matches!(
            mgr.create("dark-mode", "main"),
            Err(WorktreeError::AlreadyExists(_))
        ));
    }

    #[test]
    fn remove_unmerged_requires_force() {
        let dir = setup_repo();
        let mgr = manager(&dir);
        let path = mgr.create("dark-mode", "main").unwrap();

        // Commit something only on the feature branch.
        std::fs::write(path.join("new.txt"), "data").unwrap();
        git(&path, &["add", "."]);
        git(&path, &["commit", "-m", "feature work"]);

        assert!(matches!(
            mgr.remove("dark-mode", false, true),
            Err(WorktreeError::NotMerged(_, _))
        ));

        mgr.remove("dark-mode", true, true).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn remove_merged_branch_without_force() {
        let dir = setup_repo();
        let mgr = manager(&dir);
        let path = mgr.create("dark-mode", "main").unwrap();

        // Branch equals trunk, so it counts as merged.
        mgr.remove("dark-mode", false, true).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn remove_missing_worktree_is_noop() {
        let dir = setup_repo();
        let mgr = manager(&dir);
        mgr.remove("ghost", false, true).unwrap();
    }

    #[test]
    fn status_reports_changes_and_ahead_count() {
        let dir = setup_repo();
        let mgr = manager(&dir);
        let path = mgr.create("dark-mode", "main").unwrap();

        let clean = mgr.status("dark-mode").unwrap();
        assert!(clean.exists);
        assert!(!clean.has_changes);
        assert_eq!(clean.ahead_of_main, 0);

        std::fs::write(path.join("wip.txt"), "wip").unwrap();
        let dirty = mgr.status("dark-mode").unwrap();
        assert!(dirty.has_changes);
        assert_eq!(dirty.changes.len(), 1);

        git(&path, &["add", "."]);
        git(&path, &["commit", "-m", "wip"]);
        let ahead = mgr.status("dark-mode").unwrap();
        assert_eq!(ahead.ahead_of_main, 1);
        assert_eq!(ahead.behind_main, 0);
        assert_eq!(ahead.commit_count, 1);
    }

    #[test]
    fn status_for_missing_worktree() {
        let dir = setup_repo();
        let status = manager(&dir).status("ghost").unwrap();
        assert!(!status.exists);
    }

    #[test]
    fn sync_refuses_dirty_worktree() {
        let dir = setup_repo();
        let mgr = manager(&dir);
        let path = mgr.create("dark-mode", "main").unwrap();
        std::fs::write(path.join("wip.txt"), "wip").unwrap();

        assert!(matches!(
            mgr.sync_from_trunk("dark-mode"),
            Err(WorktreeError::DirtyWorktree(_))
        ));
    }

    #[test]
    fn sync_rebases_onto_local_trunk() {
        let dir = setup_repo();
        let mgr = manager(&dir);
        let path = mgr.create("dark-mode", "main").unwrap();

        // Advance trunk.
        std::fs::write(dir.path().join("trunk.txt"), "trunk").unwrap();
        git(dir.path(), &["add", "."]);
        git(dir.path(), &["commit", "-m", "trunk moves on"]);

        let message = mgr.sync_from_trunk("dark-mode").unwrap();
        assert!(message.contains("Rebased dark-mode"));
        assert!(path.join("trunk.txt").exists());
    }

    #[test]
    fn sync_aborts_on_conflict() {
        let dir = setup_repo();
        let mgr = manager(&dir);
        let path = mgr.create("dark-mode", "main").unwrap();

        // Conflicting edits to the same file on both branches.
        std::fs::write(path.join("README.md"), "# feature version").unwrap();
        git(&path, &["add", "."]);
        git(&path, &["commit", "-m", "feature edit"]);

        std::fs::write(dir.path().join("README.md"), "# trunk version").unwrap();
        git(dir.path(), &["add", "."]);
        git(dir.path(), &["commit", "-m", "trunk edit"]);

        let err = mgr.sync_from_trunk("dark-mode").unwrap_err();
        assert!(matches!(err, WorktreeError::RebaseConflict(_)));

        // The rebase was aborted; the worktree is usable and clean.
        let status = mgr.status("dark-mode").unwrap();
        assert!(!status.has_changes);
    }

    #[test]
    fn list_worktrees_includes_main_and_features() {
        let dir = setup_repo();
        let mgr = manager(&dir);
        mgr.create("dark-mode", "main").unwrap();

        let worktrees = mgr.list_worktrees().unwrap();
        assert_eq!(worktrees.len(), 2);
        assert!(worktrees.iter().any(|w| w.is_main));
        assert!(worktrees
            .iter()
            .any(|w| w.branch.as_deref() == Some("feature/dark-mode")));
    }

    #[test]
    fn parse_porcelain_handles_detached() {
        let out = "worktree /repo\nHEAD abcdef1234567890\nbranch refs/heads/main\n\nworktree /repo/.wt/x\nHEAD 1111111234567890\ndetached\n";
        let infos = parse_worktree_porcelain(out, Path::new("/repo"));
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].branch.as_deref(), Some("main"));
        assert!(infos[0].is_main);
        assert!(infos[1].branch.is_none());
        assert_eq!(infos[1].commit, "11111112");
    }

    #[test]
    fn prune_reports_removed_entries() {
        let dir = setup_repo();
        let mgr = manager(&dir);
        let path = mgr.create("dark-mode", "main").unwrap();

        // Delete the directory behind git's back, then prune.
        std::fs::remove_dir_all(&path).unwrap();
        let pruned = mgr.prune().unwrap();
        assert_eq!(pruned, 1);
    }
}
