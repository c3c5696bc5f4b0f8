//! Feature registry persistence and queries.
//!
//! The registry is a single JSON document at
//! `<project>/.flowforge/registry.json`, owned by one writer per process.
//! Saves are full-file rewrites after in-memory mutation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::types::{now_rfc3339, Complexity, Feature, FeatureStatus, MergeQueueItem};

/// Registry document format version.
pub const REGISTRY_VERSION: &str = "1.0.0";

/// Hard cap on the number of features in `planned` status per project.
///
/// Applies only to planned features; any number may be in-progress,
/// review, or completed.
pub const MAX_PLANNED_FEATURES: usize = 3;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid registry json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("feature not found: {0}")]
    NotFound(String),
    #[error("feature already exists: {0}")]
    AlreadyExists(String),
    #[error("feature has children: {0:?}; use force to remove")]
    HasChildren(Vec<String>),
    #[error("feature is in-progress; use force to remove")]
    InProgress,
    #[error("planned feature limit reached ({limit}); currently planned: {planned_titles:?}")]
    PlannedCapReached {
        limit: usize,
        planned_titles: Vec<String>,
    },
    #[error("invalid {field}: {value}")]
    InvalidField { field: String, value: String },
    #[error("dependency cycle involving: {0}")]
    DependencyCycle(String),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// The on-disk registry document.
///
/// `shipping_stats` is opaque to the core and round-trips unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryDocument {
    pub version: String,
    pub features: BTreeMap<String, Feature>,
    pub merge_queue: Vec<MergeQueueItem>,
    pub shipping_stats: serde_json::Value,
}

impl RegistryDocument {
    pub fn new() -> Self {
        Self {
            version: REGISTRY_VERSION.to_string(),
            features: BTreeMap::new(),
            merge_queue: Vec::new(),
            shipping_stats: serde_json::Value::Object(serde_json::Map::new()),
        }
    }
}

/// Patch-style update for a feature. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeaturePatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<FeatureStatus>,
    pub priority: Option<u8>,
    pub complexity: Option<Complexity>,
    pub tags: Option<Vec<String>>,
    pub depends_on: Option<Vec<String>>,
    pub blocked_by: Option<Vec<String>>,
    pub notes: Option<String>,
    pub branch: Option<Option<String>>,
    pub worktree_path: Option<Option<String>>,
    pub prompt_path: Option<Option<String>>,
    pub spec_path: Option<Option<String>>,
    pub session_id: Option<Option<String>>,
    pub completed_at: Option<Option<String>>,
}

/// Summary statistics for a project registry.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub active_worktrees: usize,
    pub ready_to_start: usize,
    pub ready_to_merge: usize,
}

/// Manages the feature registry for a single project.
#[derive(Debug)]
pub struct FeatureRegistry {
    project_root: PathBuf,
    registry_path: PathBuf,
    doc: RegistryDocument,
}

impl FeatureRegistry {
    /// Registry path for a project root.
    pub fn registry_path_for(project_root: &Path) -> PathBuf {
        project_root.join(".flowforge").join("registry.json")
    }

    /// Load the registry from disk, or start empty if the file is absent.
    pub fn load(project_root: &Path) -> Result<Self> {
        let registry_path = Self::registry_path_for(project_root);
        let doc = if registry_path.exists() {
            let content = std::fs::read_to_string(&registry_path)?;
            serde_json::from_str(&content)?
        } else {
            RegistryDocument::new()
        };

        Ok(Self {
            project_root: project_root.to_path_buf(),
            registry_path,
            doc,
        })
    }

    /// Create a new empty registry and write it to disk.
    pub fn create_new(project_root: &Path) -> Result<Self> {
        let mut registry = Self {
            project_root: project_root.to_path_buf(),
            registry_path: Self::registry_path_for(project_root),
            doc: RegistryDocument::new(),
        };
        registry.save()?;
        Ok(registry)
    }

    /// Construct a registry around an already-parsed document, persisted at
    /// an explicit path. Used by the pi-local registry store.
    pub fn from_document(project_root: &Path, registry_path: PathBuf, doc: RegistryDocument) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            registry_path,
            doc,
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn document(&self) -> &RegistryDocument {
        &self.doc
    }

    /// Full-file rewrite of the registry document.
    pub fn save(&mut self) -> Result<()> {
        if self.doc.version.is_empty() {
            self.doc.version = REGISTRY_VERSION.to_string();
        }
        if let Some(parent) = self.registry_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&self.doc)?;
        std::fs::write(&self.registry_path, content)?;
        Ok(())
    }

    // --- CRUD ---

    /// Add a new feature, enforcing id uniqueness and the planned cap.
    pub fn add_feature(&mut self, feature: Feature) -> Result<Feature> {
        if self.doc.features.contains_key(&feature.id) {
            return Err(RegistryError::AlreadyExists(feature.id));
        }

        if feature.status == FeatureStatus::Planned && !self.can_add_planned() {
            return Err(RegistryError::PlannedCapReached {
                limit: MAX_PLANNED_FEATURES,
                planned_titles: self.planned_titles(),
            });
        }

        self.check_acyclic_with(&feature)?;

        let id = feature.id.clone();
        let parent_id = feature.parent_id.clone();
        self.doc.features.insert(id.clone(), feature.clone());

        // Keep the parent's children list consistent.
        if let Some(pid) = parent_id {
            if let Some(parent) = self.doc.features.get_mut(&pid) {
                if !parent.children.contains(&id) {
                    parent.children.push(id.clone());
                    parent.updated_at = now_rfc3339();
                }
            }
        }

        self.save()?;
        Ok(feature)
    }

    pub fn get_feature(&self, feature_id: &str) -> Option<&Feature> {
        self.doc.features.get(feature_id)
    }

    /// Apply a patch to a feature and bump its updated-at timestamp.
    pub fn update_feature(&mut self, feature_id: &str, patch: &FeaturePatch) -> Result<Feature> {
        if !self.doc.features.contains_key(feature_id) {
            return Err(RegistryError::NotFound(feature_id.to_string()));
        }

        if let Some(deps) = &patch.depends_on {
            let mut candidate = self.doc.features[feature_id].clone();
            candidate.depends_on = deps.clone();
            self.check_acyclic_with(&candidate)?;
        }

        let feature = self
            .doc
            .features
            .get_mut(feature_id)
            .ok_or_else(|| RegistryError::NotFound(feature_id.to_string()))?;

        if let Some(v) = &patch.title {
            feature.title = v.clone();
        }
        if let Some(v) = &patch.description {
            feature.description = v.clone();
        }
        if let Some(v) = patch.status {
            feature.status = v;
        }
        if let Some(v) = patch.priority {
            feature.priority = v;
        }
        if let Some(v) = patch.complexity {
            feature.complexity = v;
        }
        if let Some(v) = &patch.tags {
            feature.tags = v.clone();
        }
        if let Some(v) = &patch.depends_on {
            feature.depends_on = v.clone();
        }
        if let Some(v) = &patch.blocked_by {
            feature.blocked_by = v.clone();
        }
        if let Some(v) = &patch.notes {
            feature.notes = Some(v.clone());
        }
        if let Some(v) = &patch.branch {
            feature.branch = v.clone();
        }
        if let Some(v) = &patch.worktree_path {
            feature.worktree_path = v.clone();
        }
        if let Some(v) = &patch.prompt_path {
            feature.prompt_path = v.clone();
        }
        if let Some(v) = &patch.spec_path {
            feature.spec_path = v.clone();
        }
        if let Some(v) = &patch.session_id {
            feature.session_id = v.clone();
        }
        if let Some(v) = &patch.completed_at {
            feature.completed_at = v.clone();
        }
        feature.updated_at = now_rfc3339();

        let updated = feature.clone();
        self.save()?;
        Ok(updated)
    }

    /// Remove a feature.
    ///
    /// Refuses when the feature has children or is in-progress, unless
    /// `force` is set. Removing an unknown id is a no-op.
    pub fn remove_feature(&mut self, feature_id: &str, force: bool) -> Result<()> {
        let Some(feature) = self.doc.features.get(feature_id) else {
            return Ok(());
        };

        if !force {
            if !feature.children.is_empty() {
                return Err(RegistryError::HasChildren(feature.children.clone()));
            }
            if feature.status == FeatureStatus::InProgress {
                return Err(RegistryError::InProgress);
            }
        }

        let parent_id = feature.parent_id.clone();
        self.doc.features.remove(feature_id);

        if let Some(pid) = parent_id {
            if let Some(parent) = self.doc.features.get_mut(&pid) {
                parent.children.retain(|c| c != feature_id);
            }
        }

        self.save()?;
        Ok(())
    }

    // --- Queries ---

    /// List features with optional filters, sorted by (priority, created_at).
    pub fn list_features(
        &self,
        status: Option<FeatureStatus>,
        parent_id: Option<&str>,
        tags: Option<&[String]>,
    ) -> Vec<&Feature> {
        let mut features: Vec<&Feature> = self
            .doc
            .features
            .values()
            .filter(|f| status.is_none_or(|s| f.status == s))
            .filter(|f| match parent_id {
                Some(pid) => f.parent_id.as_deref() == Some(pid),
                None => true,
            })
            .filter(|f| match tags {
                Some(tags) => tags.iter().any(|t| f.tags.contains(t)),
                None => true,
            })
            .collect();

        features.sort_by(|a, b| {
            (a.priority, a.created_at.as_str()).cmp(&(b.priority, b.created_at.as_str()))
        });
        features
    }

    /// Top-level features (no parent).
    pub fn get_root_features(&self) -> Vec<&Feature> {
        let mut features: Vec<&Feature> = self
            .doc
            .features
            .values()
            .filter(|f| f.parent_id.is_none())
            .collect();
        features.sort_by(|a, b| {
            (a.priority, a.created_at.as_str()).cmp(&(b.priority, b.created_at.as_str()))
        });
        features
    }

    pub fn get_children(&self, feature_id: &str) -> Vec<&Feature> {
        self.list_features(None, Some(feature_id), None)
    }

    /// Planned features whose dependencies are all completed and whose
    /// blocked list is empty.
    pub fn get_ready_features(&self) -> Vec<&Feature> {
        self.list_features(Some(FeatureStatus::Planned), None, None)
            .into_iter()
            .filter(|f| {
                f.blocked_by.is_empty()
                    && f.depends_on.iter().all(|dep| {
                        self.doc
                            .features
                            .get(dep)
                            .is_some_and(|d| d.status == FeatureStatus::Completed)
                    })
            })
            .collect()
    }

    /// Features in review status, ready for merge consideration.
    pub fn get_merge_candidates(&self) -> Vec<&Feature> {
        self.list_features(Some(FeatureStatus::Review), None, None)
    }

    pub fn get_stats(&self) -> RegistryStats {
        let mut by_status = BTreeMap::new();
        for status in FeatureStatus::all() {
            let count = self
                .doc
                .features
                .values()
                .filter(|f| f.status == status)
                .count();
            by_status.insert(status.as_str().to_string(), count);
        }

        RegistryStats {
            total: self.doc.features.len(),
            by_status,
            active_worktrees: self
                .doc
                .features
                .values()
                .filter(|f| f.worktree_path.is_some())
                .count(),
            ready_to_start: self.get_ready_features().len(),
            ready_to_merge: self.get_merge_candidates().len(),
        }
    }

    // --- Planned cap ---

    pub fn count_planned(&self) -> usize {
        self.doc
            .features
            .values()
            .filter(|f| f.status == FeatureStatus::Planned)
            .count()
    }

    pub fn can_add_planned(&self) -> bool {
        self.count_planned() < MAX_PLANNED_FEATURES
    }

    /// Titles of currently planned features, in (priority, created_at) order.
    pub fn planned_titles(&self) -> Vec<String> {
        self.list_features(Some(FeatureStatus::Planned), None, None)
            .into_iter()
            .map(|f| f.title.clone())
            .collect()
    }

    // --- Dependency graph ---

    /// Reject self-dependencies and cycles that would be introduced by
    /// inserting `candidate` into the graph.
    fn check_acyclic_with(&self, candidate: &Feature) -> Result<()> {
        if candidate.depends_on.iter().any(|d| d == &candidate.id) {
            return Err(RegistryError::DependencyCycle(candidate.id.clone()));
        }

        // DFS from the candidate through depends_on edges; revisiting the
        // candidate means a cycle.
        let mut stack: Vec<&str> = candidate.depends_on.iter().map(String::as_str).collect();
        let mut seen: Vec<&str> = Vec::new();
        while let Some(id) = stack.pop() {
            if id == candidate.id {
                return Err(RegistryError::DependencyCycle(candidate.id.clone()));
            }
            if seen.contains(&id) {
                continue;
            }
            seen.push(id);
            if let Some(f) = self.doc.features.get(id) {
                stack.extend(f.depends_on.iter().map(String::as_str));
            }
        }
        Ok(())
    }
}

/// Deterministic hash of a registry document for change detection.
///
/// Serializes with sorted keys, takes SHA-256, and keeps the first 16 hex
/// characters. Depends only on key/value content, not insertion order.
pub fn compute_registry_hash(registry: &serde_json::Value) -> String {
    let mut normalized = String::new();
    write_canonical(registry, &mut normalized);
    let digest = Sha256::digest(normalized.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex.chars().take(16).collect()
}

/// Canonical JSON rendering: object keys sorted at every level.
fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<(&String, &serde_json::Value)> = map.iter().collect();
            entries.sort_by_key(|(key, _)| *key);
            out.push('{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry() -> (FeatureRegistry, TempDir) {
        let dir = TempDir::new().unwrap();
        let registry = FeatureRegistry::create_new(dir.path()).unwrap();
        (registry, dir)
    }

    #[test]
    fn create_new_writes_registry_file() {
        let (_registry, dir) = registry();
        assert!(dir.path().join(".flowforge/registry.json").exists());
    }

    #[test]
    fn add_and_reload_round_trips() {
        let (mut reg, dir) = registry();
        reg.add_feature(Feature::new("Dark mode")).unwrap();

        let reloaded = FeatureRegistry::load(dir.path()).unwrap();
        let f = reloaded.get_feature("dark-mode").unwrap();
        assert_eq!(f.title, "Dark mode");
        assert_eq!(f.status, FeatureStatus::Planned);
        assert_eq!(reloaded.document().version, REGISTRY_VERSION);
    }

    #[test]
    fn add_duplicate_id_fails() {
        let (mut reg, _dir) = registry();
        reg.add_feature(Feature::new("Dark mode")).unwrap();
        let result = reg.add_feature(Feature::new("Dark mode"));
        assert!(matches!(result, Err(RegistryError::AlreadyExists(_))));
    }

    #[test]
    fn planned_cap_rejects_fourth_feature() {
        let (mut reg, _dir) = registry();
        for title in ["A", "B", "C"] {
            reg.add_feature(Feature::new(title)).unwrap();
        }

        let err = reg.add_feature(Feature::new("D")).unwrap_err();
        match err {
            RegistryError::PlannedCapReached {
                limit,
                planned_titles,
            } => {
                assert_eq!(limit, 3);
                assert_eq!(planned_titles, vec!["A", "B", "C"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn planned_cap_ignores_other_statuses() {
        let (mut reg, _dir) = registry();
        for title in ["A", "B", "C"] {
            reg.add_feature(Feature::new(title)).unwrap();
        }
        reg.update_feature(
            "a",
            &FeaturePatch {
                status: Some(FeatureStatus::Review),
                ..FeaturePatch::default()
            },
        )
        .unwrap();

        // One planned slot freed; a fourth add now succeeds.
        reg.add_feature(Feature::new("D")).unwrap();
        assert_eq!(reg.count_planned(), 3);
    }

    #[test]
    fn update_bumps_updated_at_and_applies_patch() {
        let (mut reg, _dir) = registry();
        reg.add_feature(Feature::new("Dark mode")).unwrap();

        let updated = reg
            .update_feature(
                "dark-mode",
                &FeaturePatch {
                    status: Some(FeatureStatus::InProgress),
                    branch: Some(Some("feature/dark-mode".to_string())),
                    worktree_path: Some(Some("/tmp/wt".to_string())),
                    ..FeaturePatch::default()
                },
            )
            .unwrap();

        assert_eq!(updated.status, FeatureStatus::InProgress);
        assert_eq!(updated.branch.as_deref(), Some("feature/dark-mode"));
    }

    #[test]
    fn update_missing_feature_fails() {
        let (mut reg, _dir) = registry();
        let result = reg.update_feature("nope", &FeaturePatch::default());
        assert!(matches!(result, Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn remove_in_progress_requires_force() {
        let (mut reg, _dir) = registry();
        reg.add_feature(Feature::new("Dark mode")).unwrap();
        reg.update_feature(
            "dark-mode",
            &FeaturePatch {
                status: Some(FeatureStatus::InProgress),
                ..FeaturePatch::default()
            },
        )
        .unwrap();

        assert!(matches!(
            reg.remove_feature("dark-mode", false),
            Err(RegistryError::InProgress)
        ));
        reg.remove_feature("dark-mode", true).unwrap();
        assert!(reg.get_feature("dark-mode").is_none());
    }

    #[test]
    fn remove_with_children_requires_force() {
        let (mut reg, _dir) = registry();
        reg.add_feature(Feature::new("Parent")).unwrap();
        let mut child = Feature::new("Child");
        child.parent_id = Some("parent".to_string());
        reg.add_feature(child).unwrap();

        assert!(matches!(
            reg.remove_feature("parent", false),
            Err(RegistryError::HasChildren(_))
        ));
    }

    #[test]
    fn parent_children_stay_consistent() {
        let (mut reg, _dir) = registry();
        reg.add_feature(Feature::new("Parent")).unwrap();
        let mut child = Feature::new("Child");
        child.parent_id = Some("parent".to_string());
        reg.add_feature(child).unwrap();

        assert_eq!(reg.get_feature("parent").unwrap().children, vec!["child"]);

        reg.remove_feature("child", false).unwrap();
        assert!(reg.get_feature("parent").unwrap().children.is_empty());
    }

    #[test]
    fn self_dependency_is_rejected() {
        let (mut reg, _dir) = registry();
        let mut f = Feature::new("Loop");
        f.depends_on = vec!["loop".to_string()];
        assert!(matches!(
            reg.add_feature(f),
            Err(RegistryError::DependencyCycle(_))
        ));
    }

    #[test]
    fn dependency_cycle_is_rejected_on_update() {
        let (mut reg, _dir) = registry();
        reg.add_feature(Feature::new("A")).unwrap();
        let mut b = Feature::new("B");
        b.depends_on = vec!["a".to_string()];
        reg.add_feature(b).unwrap();

        let result = reg.update_feature(
            "a",
            &FeaturePatch {
                depends_on: Some(vec!["b".to_string()]),
                ..FeaturePatch::default()
            },
        );
        assert!(matches!(result, Err(RegistryError::DependencyCycle(_))));
    }

    #[test]
    fn ready_features_require_completed_deps_and_no_blockers() {
        let (mut reg, _dir) = registry();
        reg.add_feature(Feature::new("Base")).unwrap();
        let mut dependent = Feature::new("Dependent");
        dependent.depends_on = vec!["base".to_string()];
        reg.add_feature(dependent).unwrap();

        let ready: Vec<&str> = reg.get_ready_features().iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ready, vec!["base"]);

        reg.update_feature(
            "base",
            &FeaturePatch {
                status: Some(FeatureStatus::Completed),
                ..FeaturePatch::default()
            },
        )
        .unwrap();

        let ready: Vec<&str> = reg.get_ready_features().iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ready, vec!["dependent"]);
    }

    #[test]
    fn list_sorts_by_priority_then_created() {
        let (mut reg, _dir) = registry();
        let mut low = Feature::new("Low");
        low.priority = 9;
        let mut high = Feature::new("High");
        high.priority = 1;
        reg.add_feature(low).unwrap();
        reg.add_feature(high).unwrap();

        let ids: Vec<&str> = reg
            .list_features(None, None, None)
            .iter()
            .map(|f| f.id.as_str())
            .collect();
        assert_eq!(ids, vec!["high", "low"]);
    }

    #[test]
    fn stats_counts_statuses() {
        let (mut reg, _dir) = registry();
        reg.add_feature(Feature::new("A")).unwrap();
        reg.add_feature(Feature::new("B")).unwrap();
        reg.update_feature(
            "b",
            &FeaturePatch {
                status: Some(FeatureStatus::Review),
                ..FeaturePatch::default()
            },
        )
        .unwrap();

        let stats = reg.get_stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_status["planned"], 1);
        assert_eq!(stats.by_status["review"], 1);
        assert_eq!(stats.ready_to_merge, 1);
    }

    #[test]
    fn registry_hash_ignores_insertion_order() {
        let a: serde_json::Value =
            serde_json::from_str(r#"{"x": 1, "y": {"b": 2, "a": 3}}"#).unwrap();
        let b: serde_json::Value =
            serde_json::from_str(r#"{"y": {"a": 3, "b": 2}, "x": 1}"#).unwrap();
        assert_eq!(compute_registry_hash(&a), compute_registry_hash(&b));
    }

    #[test]
    fn registry_hash_is_16_hex_chars() {
        let v = serde_json::json!({"features": {}});
        let hash = compute_registry_hash(&v);
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn registry_hash_changes_with_content() {
        let a = serde_json::json!({"features": {"x": {"title": "X"}}});
        let b = serde_json::json!({"features": {"x": {"title": "Y"}}});
        assert_ne!(compute_registry_hash(&a), compute_registry_hash(&b));
    }

    #[test]
    fn shipping_stats_round_trips_opaquely() {
        let (mut reg, dir) = registry();
        reg.doc.shipping_stats = serde_json::json!({"shipped": 7, "streak_days": 3});
        reg.save().unwrap();

        let reloaded = FeatureRegistry::load(dir.path()).unwrap();
        assert_eq!(
            reloaded.document().shipping_stats["streak_days"],
            serde_json::json!(3)
        );
    }
}
