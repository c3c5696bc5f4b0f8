//! Pi-local registry storage.
//!
//! Mirrors workstation registries at `<base>/<project>/registry.json` in
//! the exact on-disk format, so viewing and adding features keeps working
//! while the workstation is asleep. Git operations still require the
//! workstation. Constructed once and handed to the RPC layer; there is no
//! process-wide instance.

use std::path::{Path, PathBuf};

use forge_core::registry::{FeatureRegistry, RegistryDocument};
use forge_core::ForgeConfig;
use serde::Serialize;
use thiserror::Error;

/// Environment variable overriding the registry base path.
pub const REGISTRY_PATH_ENV: &str = "FLOWFORGE_REGISTRY_PATH";
/// Default base when the environment variable is unset.
pub const DEFAULT_REGISTRY_BASE: &str = "/var/flowforge/registries";

#[derive(Debug, Error)]
pub enum PiRegistryError {
    #[error("registry not found for: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PiRegistryError>;

/// A project known to the local registry store.
#[derive(Debug, Clone, Serialize)]
pub struct LocalProject {
    pub name: String,
    /// Workstation path, from the stored config's `mac_path`.
    pub path: String,
}

/// Manages pi-local registry storage.
#[derive(Debug, Clone)]
pub struct PiRegistryManager {
    base_path: PathBuf,
}

impl PiRegistryManager {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    /// Base from `FLOWFORGE_REGISTRY_PATH`, defaulting to
    /// `/var/flowforge/registries`.
    pub fn from_env() -> Self {
        let base = std::env::var(REGISTRY_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_REGISTRY_BASE));
        Self::new(base)
    }

    fn project_dir(&self, project_name: &str) -> PathBuf {
        self.base_path.join(project_name)
    }

    fn registry_path(&self, project_name: &str) -> PathBuf {
        self.project_dir(project_name).join("registry.json")
    }

    fn config_path(&self, project_name: &str) -> PathBuf {
        self.project_dir(project_name).join("config.json")
    }

    pub fn registry_exists(&self, project_name: &str) -> bool {
        self.registry_path(project_name).exists()
    }

    /// All projects with a local registry, sorted by name.
    pub fn list_projects(&self) -> Vec<LocalProject> {
        let Ok(entries) = std::fs::read_dir(&self.base_path) else {
            return Vec::new();
        };

        let mut projects: Vec<LocalProject> = entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .filter_map(|e| {
                let name = e.file_name().to_str()?.to_string();
                if !self.registry_exists(&name) {
                    return None;
                }
                let path = self
                    .mac_path(&name)
                    .unwrap_or_else(|| format!("(unknown)/{name}"));
                Some(LocalProject { name, path })
            })
            .collect();

        projects.sort_by(|a, b| a.name.cmp(&b.name));
        projects
    }

    /// Load a project's registry from local storage, rooted at the
    /// workstation path so stored paths keep their meaning.
    pub fn get_registry(&self, project_name: &str) -> Result<FeatureRegistry> {
        let registry_path = self.registry_path(project_name);
        if !registry_path.exists() {
            return Err(PiRegistryError::NotFound(project_name.to_string()));
        }

        let content = std::fs::read_to_string(&registry_path)?;
        let doc: RegistryDocument = serde_json::from_str(&content)?;

        let mac_path = self
            .mac_path(project_name)
            .unwrap_or_else(|| format!("(unknown)/{project_name}"));

        Ok(FeatureRegistry::from_document(
            Path::new(&mac_path),
            registry_path,
            doc,
        ))
    }

    /// Persist a registry document to local storage.
    pub fn save_registry(&self, project_name: &str, doc: &RegistryDocument) -> Result<()> {
        let project_dir = self.project_dir(project_name);
        std::fs::create_dir_all(&project_dir)?;
        std::fs::write(
            self.registry_path(project_name),
            serde_json::to_string_pretty(doc)?,
        )?;
        Ok(())
    }

    /// Load a project's config, if stored.
    pub fn get_config(&self, project_name: &str) -> Option<ForgeConfig> {
        let content = std::fs::read_to_string(self.config_path(project_name)).ok()?;
        let data: serde_json::Value = serde_json::from_str(&content).ok()?;
        serde_json::from_value(data).ok()
    }

    /// Persist a project's config plus the workstation path it mirrors.
    pub fn save_config(
        &self,
        project_name: &str,
        config: &ForgeConfig,
        mac_path: &str,
    ) -> Result<()> {
        let project_dir = self.project_dir(project_name);
        std::fs::create_dir_all(&project_dir)?;

        let mut data = serde_json::to_value(config)?;
        data["mac_path"] = serde_json::Value::String(mac_path.to_string());
        std::fs::write(
            self.config_path(project_name),
            serde_json::to_string_pretty(&data)?,
        )?;
        Ok(())
    }

    /// Import raw registry/config JSON fetched from the workstation.
    pub fn import_from_mac(
        &self,
        project_name: &str,
        registry_json: &str,
        config_json: Option<&str>,
        mac_path: &str,
    ) -> Result<()> {
        let project_dir = self.project_dir(project_name);
        std::fs::create_dir_all(&project_dir)?;

        std::fs::write(self.registry_path(project_name), registry_json)?;

        if let Some(config_json) = config_json {
            let mut data: serde_json::Value = serde_json::from_str(config_json)?;
            data["mac_path"] = serde_json::Value::String(mac_path.to_string());
            std::fs::write(
                self.config_path(project_name),
                serde_json::to_string_pretty(&data)?,
            )?;
        }
        Ok(())
    }

    /// Delete a project's local registry. Returns false when absent.
    pub fn delete_project(&self, project_name: &str) -> Result<bool> {
        let project_dir = self.project_dir(project_name);
        if !project_dir.exists() {
            return Ok(false);
        }
        std::fs::remove_dir_all(project_dir)?;
        Ok(true)
    }

    fn mac_path(&self, project_name: &str) -> Option<String> {
        let content = std::fs::read_to_string(self.config_path(project_name)).ok()?;
        let data: serde_json::Value = serde_json::from_str(&content).ok()?;
        data.get("mac_path")
            .and_then(|v| v.as_str())
            .map(ToString::to_string)
    }
}
