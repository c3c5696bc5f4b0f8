//! Merge orchestration: conflict probes, dependency-aware ordering,
//! validated merges with rollback, and cleanup.
//!
//! Registry updates are only applied after the git operation succeeds;
//! rollback is atomic at the git level (one reset). Merges run one at a
//! time even in bulk since trunk needs exclusive access.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use forge_core::registry::{FeaturePatch, FeatureRegistry};
use forge_core::types::{now_rfc3339, FeatureStatus};
use serde::Serialize;
use tracing::warn;

/// Result of a merge-related operation.
#[derive(Debug, Clone, Serialize)]
pub struct MergeResult {
    pub success: bool,
    pub message: String,
    pub feature_id: String,
    pub conflict_files: Vec<String>,
    pub needs_resolution: bool,
    pub validation_output: Option<String>,
}

impl MergeResult {
    fn ok(feature_id: &str, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            feature_id: feature_id.to_string(),
            conflict_files: Vec::new(),
            needs_resolution: false,
            validation_output: None,
        }
    }

    fn fail(feature_id: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            feature_id: feature_id.to_string(),
            conflict_files: Vec::new(),
            needs_resolution: false,
            validation_output: None,
        }
    }
}

/// Orchestrates merging feature branches into trunk for one project.
#[derive(Debug)]
pub struct MergeOrchestrator {
    project_root: PathBuf,
    trunk: String,
    build_command: Option<String>,
}

impl MergeOrchestrator {
    pub fn new(
        project_root: &Path,
        trunk: impl Into<String>,
        build_command: Option<String>,
    ) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            trunk: trunk.into(),
            build_command,
        }
    }

    fn run_git(&self, args: &[&str], cwd: Option<&Path>) -> std::io::Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(cwd.unwrap_or(&self.project_root))
            .output()
    }

    /// Dry-run merge to detect conflicts. Side-effect-free: the probe
    /// merge is always aborted, even when it would have succeeded.
    pub fn check_conflicts(&self, registry: &FeatureRegistry, feature_id: &str) -> MergeResult {
        let Some(feature) = registry.get_feature(feature_id) else {
            return MergeResult::fail(feature_id, format!("Feature not found: {feature_id}"));
        };
        let Some(branch) = feature.branch.clone() else {
            return MergeResult::fail(feature_id, "Feature has no branch");
        };

        // Trunk must be current before probing. Pull tolerates a missing
        // remote.
        let _ = self.run_git(&["checkout", &self.trunk], None);
        let _ = self.run_git(&["pull", "origin", &self.trunk], None);

        let merge = self.run_git(&["merge", "--no-commit", "--no-ff", &branch], None);
        let merge_failed = merge.map(|o| !o.status.success()).unwrap_or(true);

        let mut conflict_files = Vec::new();
        if merge_failed {
            if let Ok(diff) = self.run_git(&["diff", "--name-only", "--diff-filter=U"], None) {
                conflict_files = String::from_utf8_lossy(&diff.stdout)
                    .lines()
                    .filter(|l| !l.trim().is_empty())
                    .map(ToString::to_string)
                    .collect();
            }
        }

        let _ = self.run_git(&["merge", "--abort"], None);

        if !conflict_files.is_empty() {
            return MergeResult {
                success: false,
                message: format!("Conflicts detected in {} file(s)", conflict_files.len()),
                feature_id: feature_id.to_string(),
                conflict_files,
                needs_resolution: true,
                validation_output: None,
            };
        }
        if merge_failed {
            return MergeResult::fail(feature_id, "Merge probe failed");
        }

        MergeResult::ok(feature_id, "No conflicts detected. Ready to merge.")
    }

    /// Compute a dependency-safe merge order over the features in review.
    ///
    /// Kahn's topological sort restricted to the review set, tie-breaking
    /// ready nodes by ascending priority. A cycle implies a corrupt
    /// registry; the ordering stops at the first unresolvable node and the
    /// prefix is returned.
    pub fn compute_merge_order(&self, registry: &FeatureRegistry) -> Vec<String> {
        let candidates = registry.get_merge_candidates();
        let review_ids: Vec<&str> = candidates.iter().map(|f| f.id.as_str()).collect();

        // Edges restricted to the review set.
        let mut in_degree: Vec<(usize, &str, u8)> = Vec::new();
        for f in &candidates {
            let degree = f
                .depends_on
                .iter()
                .filter(|d| review_ids.contains(&d.as_str()))
                .count();
            in_degree.push((degree, f.id.as_str(), f.priority));
        }

        let mut order = Vec::new();
        while order.len() < in_degree.len() {
            // Ready nodes, lowest priority value first.
            let next = in_degree
                .iter()
                .filter(|(deg, id, _)| *deg == 0 && !order.contains(&(*id).to_string()))
                .min_by_key(|(_, id, priority)| (*priority, *id))
                .map(|(_, id, _)| (*id).to_string());

            let Some(next_id) = next else {
                // Remaining nodes all have unmet in-review dependencies.
                break;
            };

            // Release dependents.
            for entry in &mut in_degree {
                let depends = candidates
                    .iter()
                    .find(|f| f.id == entry.1)
                    .map(|f| f.depends_on.iter().any(|d| d == &next_id))
                    .unwrap_or(false);
                if depends && entry.0 > 0 {
                    entry.0 -= 1;
                }
            }

            order.push(next_id);
        }

        order
    }

    /// Merge a feature into trunk.
    ///
    /// 1. Re-run the conflict probe, abort on conflict.
    /// 2. Check out trunk and pull.
    /// 3. Non-fast-forward merge with a structured commit message.
    /// 4. Optionally run the configured build command from the project root.
    /// 5. On validation failure, hard-reset trunk by one commit and fail;
    ///    the feature stays in review.
    /// 6. Mark the feature completed with a completion timestamp.
    /// 7. With auto-cleanup, remove the worktree and branch, then clear
    ///    those fields on the feature.
    pub fn merge_feature(
        &self,
        registry: &mut FeatureRegistry,
        feature_id: &str,
        validate: bool,
        auto_cleanup: bool,
    ) -> MergeResult {
        let Some(feature) = registry.get_feature(feature_id).cloned() else {
            return MergeResult::fail(feature_id, format!("Feature not found: {feature_id}"));
        };
        let Some(branch) = feature.branch.clone() else {
            return MergeResult::fail(feature_id, "Feature has no branch");
        };

        let conflict_check = self.check_conflicts(registry, feature_id);
        if !conflict_check.success {
            return conflict_check;
        }

        let _ = self.run_git(&["checkout", &self.trunk], None);
        let _ = self.run_git(&["pull", "origin", &self.trunk], None);

        let merge_message = format!(
            "Merge feature: {}\n\nFeature ID: {}\nBranch: {}",
            feature.title, feature_id, branch
        );
        let merge = self.run_git(&["merge", "--no-ff", &branch, "-m", &merge_message], None);
        match merge {
            Ok(output) if output.status.success() => {}
            Ok(output) => {
                return MergeResult::fail(
                    feature_id,
                    format!(
                        "Merge failed: {}",
                        String::from_utf8_lossy(&output.stderr).trim()
                    ),
                );
            }
            Err(e) => return MergeResult::fail(feature_id, format!("Merge failed: {e}")),
        }

        if validate {
            if let Some(build_command) = &self.build_command {
                let validation = Command::new("sh")
                    .arg("-c")
                    .arg(build_command)
                    .current_dir(&self.project_root)
                    .output();

                let (ok, output_text) = match validation {
                    Ok(output) => {
                        let text = if output.stderr.is_empty() {
                            String::from_utf8_lossy(&output.stdout).into_owned()
                        } else {
                            String::from_utf8_lossy(&output.stderr).into_owned()
                        };
                        (output.status.success(), text)
                    }
                    Err(e) => (false, e.to_string()),
                };

                if !ok {
                    // Undo the merge commit; trunk returns to its pre-merge
                    // head and the feature stays in review.
                    let _ = self.run_git(&["reset", "--hard", "HEAD~1"], None);
                    let mut result =
                        MergeResult::fail(feature_id, "Validation failed, merge rolled back");
                    result.validation_output = Some(output_text);
                    return result;
                }
            }
        }

        // Git succeeded; only now touch the registry.
        let update = registry.update_feature(
            feature_id,
            &FeaturePatch {
                status: Some(FeatureStatus::Completed),
                completed_at: Some(Some(now_rfc3339())),
                ..FeaturePatch::default()
            },
        );
        if let Err(e) = update {
            return MergeResult::fail(
                feature_id,
                format!("Merged but registry update failed: {e}"),
            );
        }

        if auto_cleanup {
            if let Some(worktree_path) = feature.worktree_path.as_deref() {
                let cleanup_failed = self.cleanup_worktree(worktree_path, &branch);
                if cleanup_failed {
                    // Eventually consistent: the feature is completed, the
                    // orphan worktree/branch is reported as a warning.
                    warn!(
                        feature_id,
                        worktree_path, "cleanup failed after successful merge"
                    );
                } else {
                    let _ = registry.update_feature(
                        feature_id,
                        &FeaturePatch {
                            worktree_path: Some(None),
                            branch: Some(None),
                            ..FeaturePatch::default()
                        },
                    );
                }
            } else {
                let _ = registry.update_feature(
                    feature_id,
                    &FeaturePatch {
                        branch: Some(None),
                        ..FeaturePatch::default()
                    },
                );
            }
        }

        MergeResult::ok(
            feature_id,
            format!("Successfully merged {} into {}", feature.title, self.trunk),
        )
    }

    /// Remove worktree and branch after a merge. Returns true on failure.
    fn cleanup_worktree(&self, worktree_path: &str, branch: &str) -> bool {
        let mut failed = false;
        if Path::new(worktree_path).exists() {
            match self.run_git(&["worktree", "remove", worktree_path], None) {
                Ok(output) if output.status.success() => {}
                _ => failed = true,
            }
        }
        // Branch delete tolerates a missing branch.
        let _ = self.run_git(&["branch", "-d", branch], None);
        failed
    }

    /// Merge every conflict-free feature in dependency order, stopping at
    /// the first failure; later features may depend on the failed one and
    /// are never touched.
    pub fn merge_all_safe(
        &self,
        registry: &mut FeatureRegistry,
        validate: bool,
    ) -> Vec<MergeResult> {
        let order = self.compute_merge_order(registry);
        let mut results = Vec::new();

        for feature_id in order {
            let check = self.check_conflicts(registry, &feature_id);
            if !check.success {
                results.push(check);
                continue;
            }

            let result = self.merge_feature(registry, &feature_id, validate, true);
            let stop = !result.success;
            results.push(result);
            if stop {
                break;
            }
        }

        results
    }

    /// Rebase a feature branch onto trunk. Refuses on uncommitted changes;
    /// aborts and returns a hint on conflicts.
    pub fn sync_feature(&self, registry: &FeatureRegistry, feature_id: &str) -> (bool, String) {
        let Some(feature) = registry.get_feature(feature_id) else {
            return (false, format!("Feature not found: {feature_id}"));
        };
        let Some(worktree_path) = feature.worktree_path.as_deref() else {
            return (
                false,
                "Feature has no worktree. Start it first.".to_string(),
            );
        };
        let worktree = Path::new(worktree_path);
        if !worktree.exists() {
            return (false, format!("Worktree does not exist: {worktree_path}"));
        }

        match self.run_git(&["status", "--porcelain"], Some(worktree)) {
            Ok(status) if String::from_utf8_lossy(&status.stdout).trim().is_empty() => {}
            Ok(_) => {
                return (
                    false,
                    format!(
                        "Uncommitted changes exist. Commit or stash first:\n  cd {worktree_path}\n  git add -A && git commit -m 'WIP: save progress'"
                    ),
                );
            }
            Err(e) => return (false, format!("git status failed: {e}")),
        }

        let _ = self.run_git(&["fetch", "origin", &self.trunk], None);

        let target = if self.has_remote_trunk() {
            format!("origin/{}", self.trunk)
        } else {
            self.trunk.clone()
        };

        match self.run_git(&["rebase", &target], Some(worktree)) {
            Ok(output) if output.status.success() => (
                true,
                format!("Successfully rebased {feature_id} onto {target}"),
            ),
            Ok(output) => {
                let _ = self.run_git(&["rebase", "--abort"], Some(worktree));
                (
                    false,
                    format!(
                        "Rebase conflict detected. Aborted.\n{}\nResolve manually:\n  cd {worktree_path}\n  git rebase {target}",
                        String::from_utf8_lossy(&output.stderr).trim()
                    ),
                )
            }
            Err(e) => (false, format!("rebase failed: {e}")),
        }
    }

    fn has_remote_trunk(&self) -> bool {
        self.run_git(
            &[
                "rev-parse",
                "--verify",
                &format!("refs/remotes/origin/{}", self.trunk),
            ],
            None,
        )
        .map(|o| o.status.success())
        .unwrap_or(false)
    }

    /// Render a resolution document for a conflicted feature. Pure
    /// function of the feature record and its conflict set.
    pub fn generate_conflict_prompt(&self, registry: &FeatureRegistry, feature_id: &str) -> String {
        let Some(feature) = registry.get_feature(feature_id) else {
            return format!("Feature not found: {feature_id}");
        };

        let check = self.check_conflicts(registry, feature_id);
        if check.success {
            return "No conflicts to resolve.".to_string();
        }

        let conflict_list = check
            .conflict_files
            .iter()
            .map(|f| format!("- `{f}`"))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "# Merge Conflict Resolution\n\n\
            You are resolving merge conflicts for feature: **{title}**\n\n\
            ## Conflicting Files\n{conflict_list}\n\n\
            ## Context\n\
            - Feature branch: `{branch}`\n\
            - Target branch: `{trunk}`\n\
            - Description: {description}\n\n\
            ## Instructions\n\n\
            1. Navigate to the worktree:\n   cd {worktree}\n\n\
            2. Start the merge:\n   git fetch origin {trunk}\n   git merge origin/{trunk}\n\n\
            3. Resolve each conflicting file, keeping the feature's new\n\
               functionality and preserving bug fixes from {trunk}.\n\n\
            4. Complete the merge:\n   git add -A\n   git commit -m \"fix: Resolve merge conflicts for {title}\"\n\n\
            ## Resolution Strategy\n\n\
            Prefer the feature branch changes unless they conflict with\n\
            critical fixes from {trunk}. When unsure, preserve both changes\n\
            if they affect different parts of the file.\n",
            title = feature.title,
            conflict_list = conflict_list,
            branch = feature.branch.as_deref().unwrap_or("(none)"),
            trunk = self.trunk,
            description = feature.description,
            worktree = feature.worktree_path.as_deref().unwrap_or("(no worktree)"),
        )
    }
}
