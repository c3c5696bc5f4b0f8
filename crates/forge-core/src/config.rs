//! Project configuration for FlowForge.
//!
//! Stored at `<project>/.flowforge/config.json`.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("flowforge not initialized; expected config at {0}")]
    NotInitialized(PathBuf),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),
}

fn default_main_branch() -> String {
    "main".to_string()
}

fn default_claude_md_path() -> String {
    "CLAUDE.md".to_string()
}

fn default_worktree_base() -> String {
    ".flowforge-worktrees".to_string()
}

fn default_claude_command() -> String {
    "claude".to_string()
}

fn default_claude_flags() -> Vec<String> {
    vec!["--dangerously-skip-permissions".to_string()]
}

/// Project-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default = "default_main_branch")]
    pub main_branch: String,
    #[serde(default = "default_claude_md_path")]
    pub claude_md_path: String,
    #[serde(default)]
    pub build_command: Option<String>,
    #[serde(default)]
    pub test_command: Option<String>,
    #[serde(default = "default_worktree_base")]
    pub worktree_base: String,
    #[serde(default)]
    pub default_persona: Option<String>,

    // Coding-assistant integration
    #[serde(default = "default_claude_command")]
    pub claude_command: String,
    #[serde(default = "default_claude_flags")]
    pub claude_flags: Vec<String>,
}

impl ProjectConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            main_branch: default_main_branch(),
            claude_md_path: default_claude_md_path(),
            build_command: None,
            test_command: None,
            worktree_base: default_worktree_base(),
            default_persona: None,
            claude_command: default_claude_command(),
            claude_flags: default_claude_flags(),
        }
    }
}

/// Top-level config document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgeConfig {
    pub version: String,
    pub project: ProjectConfig,
}

impl ForgeConfig {
    pub fn config_path_for(project_root: &Path) -> PathBuf {
        project_root.join(".flowforge").join("config.json")
    }

    /// Load config from `.flowforge/config.json`.
    pub fn load(project_root: &Path) -> Result<Self, ConfigError> {
        let config_path = Self::config_path_for(project_root);
        if !config_path.exists() {
            return Err(ConfigError::NotInitialized(config_path));
        }
        let content = std::fs::read_to_string(&config_path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn new(project: ProjectConfig) -> Self {
        Self {
            version: "1.0.0".to_string(),
            project,
        }
    }

    pub fn save(&self, project_root: &Path) -> Result<(), ConfigError> {
        let config_path = Self::config_path_for(project_root);
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&config_path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Find the project root by walking up from `start` until a `.flowforge`
/// directory appears. Falls back to `start` itself (for init).
pub fn find_project_root(start: &Path) -> PathBuf {
    let mut current = start.to_path_buf();
    loop {
        if current.join(".flowforge").exists() {
            return current;
        }
        let Some(parent) = current.parent() else {
            return start.to_path_buf();
        };
        if parent == current {
            return start.to_path_buf();
        }
        current = parent.to_path_buf();
    }
}

/// Auto-detect project settings from existing files.
///
/// Infers the project name from the directory, the main branch from the
/// remote HEAD symref, the CLAUDE.md location, and a build command from
/// common project markers.
pub fn detect_project_settings(project_root: &Path) -> ProjectConfig {
    let name = project_root
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("project")
        .to_string();

    let mut claude_md_path = "CLAUDE.md".to_string();
    if !project_root.join("CLAUDE.md").exists() {
        for alt in ["claude.md", "docs/CLAUDE.md", ".claude/CLAUDE.md"] {
            if project_root.join(alt).exists() {
                claude_md_path = alt.to_string();
                break;
            }
        }
    }

    let build_command = if project_root.join("package.json").exists() {
        Some("npm run build".to_string())
    } else if project_root.join("Cargo.toml").exists() {
        Some("cargo build".to_string())
    } else if project_root.join("pyproject.toml").exists() {
        Some("pip install -e . && python -m pytest".to_string())
    } else if project_root.join("Makefile").exists() {
        Some("make".to_string())
    } else {
        None
    };

    let mut config = ProjectConfig::new(name);
    config.main_branch = detect_main_branch(project_root);
    config.claude_md_path = claude_md_path;
    config.build_command = build_command;
    config
}

/// Detect the trunk branch for a repository.
///
/// Tries the remote HEAD symref first, then local `main`, then `master`.
pub fn detect_main_branch(project_root: &Path) -> String {
    let symref = Command::new("git")
        .args(["symbolic-ref", "refs/remotes/origin/HEAD"])
        .current_dir(project_root)
        .output();
    if let Ok(output) = symref {
        if output.status.success() {
            if let Ok(full_ref) = String::from_utf8(output.stdout) {
                if let Some(branch) = full_ref.trim().strip_prefix("refs/remotes/origin/") {
                    return branch.to_string();
                }
            }
        }
    }

    for candidate in ["main", "master"] {
        let check = Command::new("git")
            .args(["rev-parse", "--verify", &format!("refs/heads/{candidate}")])
            .current_dir(project_root)
            .output();
        if check.map(|o| o.status.success()).unwrap_or(false) {
            return candidate.to_string();
        }
    }

    "main".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn load_missing_config_reports_not_initialized() {
        let dir = TempDir::new().unwrap();
        let result = ForgeConfig::load(dir.path());
        assert!(matches!(result, Err(ConfigError::NotInitialized(_))));
    }

    #[test]
    fn save_and_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let mut project = ProjectConfig::new("AirFit");
        project.build_command = Some("make build".to_string());
        ForgeConfig::new(project).save(dir.path()).unwrap();

        let loaded = ForgeConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.project.name, "AirFit");
        assert_eq!(loaded.project.main_branch, "main");
        assert_eq!(loaded.project.build_command.as_deref(), Some("make build"));
        assert_eq!(loaded.project.worktree_base, ".flowforge-worktrees");
        assert_eq!(
            loaded.project.claude_flags,
            vec!["--dangerously-skip-permissions"]
        );
    }

    #[test]
    fn config_tolerates_missing_optional_fields() {
        let dir = TempDir::new().unwrap();
        let config_dir = dir.path().join(".flowforge");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join("config.json"),
            r#"{"version": "1.0.0", "project": {"name": "Bare"}}"#,
        )
        .unwrap();

        let loaded = ForgeConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.project.name, "Bare");
        assert_eq!(loaded.project.claude_command, "claude");
    }

    #[test]
    fn find_project_root_walks_up() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".flowforge")).unwrap();
        let nested = dir.path().join("src/deep/nested");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(find_project_root(&nested), dir.path());
    }

    #[test]
    fn find_project_root_falls_back_to_start() {
        let dir = TempDir::new().unwrap();
        assert_eq!(find_project_root(dir.path()), dir.path());
    }

    #[test]
    fn detect_settings_uses_directory_name() {
        let dir = TempDir::new().unwrap();
        let config = detect_project_settings(dir.path());
        assert!(!config.name.is_empty());
        assert!(config.build_command.is_none());
    }

    #[test]
    fn detect_settings_finds_build_command() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        let config = detect_project_settings(dir.path());
        assert_eq!(config.build_command.as_deref(), Some("npm run build"));
    }
}
