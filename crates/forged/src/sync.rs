//! Synchronization between the local cache and the workstation.
//!
//! Two cooperative background tasks: a health probe that detects
//! workstation reachability transitions, and a sync loop that drains the
//! pending-operation queue once the workstation comes back. The cache is
//! the only local truth; the workstation registry is authoritative and is
//! re-read after every replay pass.

use std::sync::Arc;
use std::time::Duration;

use forge_core::registry::compute_registry_hash;
use forge_core::types::{now_rfc3339, OperationKind, PendingOperation, SyncStatus};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cache::CacheManager;
use crate::transport::SshTransport;

/// Default health probe period.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
/// Default sync loop period.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(60);
/// Ceiling for the health probe; a timeout reads as "unreachable".
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of a sync pass.
#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub success: bool,
    pub message: String,
    pub synced_projects: Vec<String>,
    pub failed_operations: Vec<i64>,
    pub conflicts: Vec<serde_json::Value>,
}

impl SyncResult {
    fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            synced_projects: Vec::new(),
            failed_operations: Vec::new(),
            conflicts: Vec::new(),
        }
    }
}

/// Current workstation connectivity as seen by the engine.
#[derive(Debug, Clone, Serialize)]
pub struct WorkstationStatus {
    pub online: bool,
    pub last_check: Option<String>,
    pub last_successful_sync: Option<String>,
    pub pending_operations: i64,
}

type StatusCallback = Box<dyn Fn(bool) + Send + Sync>;

#[derive(Debug, Default)]
struct EngineState {
    online: bool,
    last_check: Option<String>,
    last_sync: Option<String>,
}

/// Reconciles the local cache with the workstation registry.
pub struct SyncEngine {
    transport: SshTransport,
    cache: Arc<CacheManager>,
    health_interval: Duration,
    sync_interval: Duration,
    state: Mutex<EngineState>,
    on_status_change: std::sync::Mutex<Option<StatusCallback>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine").finish_non_exhaustive()
    }
}

impl SyncEngine {
    pub fn new(transport: SshTransport, cache: Arc<CacheManager>) -> Arc<Self> {
        Self::with_intervals(transport, cache, HEALTH_CHECK_INTERVAL, SYNC_INTERVAL)
    }

    pub fn with_intervals(
        transport: SshTransport,
        cache: Arc<CacheManager>,
        health_interval: Duration,
        sync_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            cache,
            health_interval,
            sync_interval,
            state: Mutex::new(EngineState::default()),
            on_status_change: std::sync::Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// Register the callback fired once per reachability transition.
    pub fn on_status_change(&self, callback: impl Fn(bool) + Send + Sync + 'static) {
        *self
            .on_status_change
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Box::new(callback));
    }

    pub async fn is_online(&self) -> bool {
        self.state.lock().await.online
    }

    pub async fn status(&self) -> WorkstationStatus {
        let state = self.state.lock().await;
        WorkstationStatus {
            online: state.online,
            last_check: state.last_check.clone(),
            last_successful_sync: state.last_sync.clone(),
            pending_operations: self.cache.get_pending_count(None).await.unwrap_or(0),
        }
    }

    /// Probe workstation reachability with a tiny no-op command.
    ///
    /// A probe timeout is indistinguishable from "unreachable". On a
    /// transition in either direction the registered callback fires
    /// exactly once.
    pub async fn check_health(&self) -> bool {
        let argv = vec!["echo".to_string(), "ok".to_string()];
        let result = self
            .transport
            .run(&argv, None, None, HEALTH_PROBE_TIMEOUT)
            .await;
        let online = result.success() && result.stdout.trim().ends_with("ok");

        let transitioned = {
            let mut state = self.state.lock().await;
            let was_online = state.online;
            state.online = online;
            state.last_check = Some(now_rfc3339());
            was_online != online
        };

        if transitioned {
            info!(online, "workstation reachability changed");
            let guard = self
                .on_status_change
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(callback) = guard.as_ref() {
                callback(online);
            }
        }

        online
    }

    /// Sync one project with the workstation.
    ///
    /// 1. Read the authoritative registry over the transport.
    /// 2. Hash-compare against the last-seen workstation hash; a change
    ///    with local pending ops means conflicts are detected (recorded,
    ///    never auto-resolved).
    /// 3. Drain pending operations in creation order; failures are
    ///    recorded and do not block later operations.
    /// 4. Re-read the registry, refresh the cache, update sync state.
    pub async fn sync_project(&self, project_name: &str, project_path: &str) -> SyncResult {
        let registry_path = format!("{project_path}/.flowforge/registry.json");

        let Some(remote_registry_json) = self.transport.read_file(&registry_path).await else {
            return SyncResult::failure(format!("Could not read registry for {project_name}"));
        };
        let remote_registry: serde_json::Value = match serde_json::from_str(&remote_registry_json) {
            Ok(v) => v,
            Err(e) => return SyncResult::failure(format!("Invalid remote registry: {e}")),
        };
        let remote_hash = compute_registry_hash(&remote_registry);

        let pending = match self.cache.get_pending_operations(Some(project_name)).await {
            Ok(ops) => ops,
            Err(e) => return SyncResult::failure(format!("Cache error: {e}")),
        };

        let mut conflicts = Vec::new();
        if let Ok(Some(state)) = self.cache.get_sync_state(project_name).await {
            if let Some(last_hash) = state.last_mac_registry_hash {
                if last_hash != remote_hash && !pending.is_empty() {
                    conflicts = detect_conflicts(&pending, &remote_registry);
                }
            }
        }

        let mut failed_operations = Vec::new();
        for op in &pending {
            let _ = self.cache.mark_operation_syncing(op.id).await;
            match self.replay_operation(op, project_path).await {
                Ok(()) => {
                    let _ = self.cache.mark_operation_completed(op.id).await;
                }
                Err(message) => {
                    error!(operation_id = op.id, %message, "pending operation failed to sync");
                    let _ = self.cache.mark_operation_failed(op.id, &message).await;
                    failed_operations.push(op.id);
                }
            }
        }

        // The registry changed under our writes; re-read and re-cache.
        if let Some(updated_json) = self.transport.read_file(&registry_path).await {
            if let Ok(updated_registry) = serde_json::from_str::<serde_json::Value>(&updated_json) {
                let updated_hash = compute_registry_hash(&updated_registry);

                let config_path = format!("{project_path}/.flowforge/config.json");
                let config = match self.transport.read_file(&config_path).await {
                    Some(json) => serde_json::from_str(&json).ok(),
                    None => None,
                };

                let _ = self
                    .cache
                    .cache_project(
                        project_name,
                        project_path,
                        config.as_ref(),
                        Some(&updated_registry),
                    )
                    .await;

                let status = if conflicts.is_empty() {
                    SyncStatus::Synced
                } else {
                    SyncStatus::Conflict
                };
                let _ = self
                    .cache
                    .update_sync_state(project_name, Some(&updated_hash), status)
                    .await;
            }
        }

        self.state.lock().await.last_sync = Some(now_rfc3339());

        SyncResult {
            success: failed_operations.is_empty(),
            message: if failed_operations.is_empty() {
                "Sync complete".to_string()
            } else {
                format!("{} operation(s) failed", failed_operations.len())
            },
            synced_projects: vec![project_name.to_string()],
            failed_operations,
            conflicts,
        }
    }

    /// Sync every cached project.
    pub async fn sync_all_projects(&self) -> SyncResult {
        if !self.is_online().await {
            return SyncResult::failure("Workstation is offline");
        }

        let projects = match self.cache.get_all_cached_projects().await {
            Ok(projects) => projects,
            Err(e) => return SyncResult::failure(format!("Cache error: {e}")),
        };

        let mut synced = Vec::new();
        let mut failed = Vec::new();
        let mut conflicts = Vec::new();
        for (name, path) in projects {
            let result = self.sync_project(&name, &path).await;
            synced.extend(result.synced_projects);
            failed.extend(result.failed_operations);
            conflicts.extend(result.conflicts);
        }

        SyncResult {
            success: failed.is_empty(),
            message: format!("Synced {} project(s)", synced.len()),
            synced_projects: synced,
            failed_operations: failed,
            conflicts,
        }
    }

    /// Replay one queued mutation against the workstation.
    async fn replay_operation(
        &self,
        op: &PendingOperation,
        project_path: &str,
    ) -> Result<(), String> {
        let payload: serde_json::Value =
            serde_json::from_str(&op.payload_json).map_err(|e| format!("invalid payload: {e}"))?;

        match op.operation {
            OperationKind::AddFeature => {
                let argv = build_add_feature_argv(&payload)?;
                let result = self
                    .transport
                    .run(&argv, Some(project_path), None, Duration::from_secs(60))
                    .await;
                if result.success() {
                    Ok(())
                } else {
                    Err(format!("forge add failed: {}", result.stderr.trim()))
                }
            }
            OperationKind::UpdateFeature => self.replay_update(&payload, project_path).await,
            OperationKind::DeleteFeature => {
                let feature_id = payload
                    .get("feature_id")
                    .and_then(|v| v.as_str())
                    .ok_or("missing feature_id")?;
                let argv: Vec<String> = ["forge", "delete", feature_id, "--force"]
                    .iter()
                    .map(ToString::to_string)
                    .collect();
                let result = self
                    .transport
                    .run(&argv, Some(project_path), None, Duration::from_secs(60))
                    .await;
                if result.success() {
                    Ok(())
                } else {
                    Err(format!("forge delete failed: {}", result.stderr.trim()))
                }
            }
        }
    }

    /// Read-modify-write of the workstation registry for a feature
    /// update. Only user-authored fields are written; system fields
    /// (status, branch, worktree path) are left to the workstation.
    async fn replay_update(
        &self,
        payload: &serde_json::Value,
        project_path: &str,
    ) -> Result<(), String> {
        let feature_id = payload
            .get("feature_id")
            .and_then(|v| v.as_str())
            .ok_or("missing feature_id")?;

        let registry_path = format!("{project_path}/.flowforge/registry.json");
        let registry_json = self
            .transport
            .read_file(&registry_path)
            .await
            .ok_or("could not read remote registry")?;
        let mut registry: serde_json::Value =
            serde_json::from_str(&registry_json).map_err(|e| format!("invalid registry: {e}"))?;

        let feature = registry
            .get_mut("features")
            .and_then(|f| f.get_mut(feature_id))
            .ok_or_else(|| format!("feature {feature_id} not found"))?;

        for key in ["title", "description", "tags", "priority", "complexity"] {
            if let Some(value) = payload.get(key) {
                feature[key] = value.clone();
            }
        }
        feature["updated_at"] = serde_json::Value::String(now_rfc3339());

        let updated = serde_json::to_string_pretty(&registry)
            .map_err(|e| format!("serialize failed: {e}"))?;
        let result = self
            .transport
            .write_file(&registry_path, updated.as_bytes())
            .await;
        if result.success() {
            Ok(())
        } else {
            Err(format!("registry write failed: {}", result.stderr.trim()))
        }
    }

    // --- Background tasks ---

    /// Start the health probe and sync loop. Both stop when `shutdown`
    /// is triggered.
    pub fn start_background_tasks(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.health_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        engine.check_health().await;
                    }
                    () = engine.shutdown.cancelled() => break,
                }
            }
        });

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.sync_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if engine.is_online().await {
                            let pending = engine.cache.get_pending_count(None).await.unwrap_or(0);
                            if pending > 0 {
                                info!(pending, "draining pending operations");
                                engine.sync_all_projects().await;
                            }
                        }
                    }
                    () = engine.shutdown.cancelled() => break,
                }
            }
        });
    }

    pub fn stop_background_tasks(&self) {
        self.shutdown.cancel();
    }
}

/// Build the remote CLI argv for an `add_feature` replay.
fn build_add_feature_argv(payload: &serde_json::Value) -> Result<Vec<String>, String> {
    let title = payload
        .get("title")
        .and_then(|v| v.as_str())
        .ok_or("missing title")?;

    let mut argv = vec!["forge".to_string(), "add".to_string(), title.to_string()];

    if let Some(description) = payload.get("description").and_then(|v| v.as_str()) {
        if !description.is_empty() {
            argv.push("--description".to_string());
            argv.push(description.to_string());
        }
    }
    if let Some(priority) = payload.get("priority").and_then(serde_json::Value::as_i64) {
        argv.push("--priority".to_string());
        argv.push(priority.to_string());
    }
    if let Some(complexity) = payload.get("complexity").and_then(|v| v.as_str()) {
        argv.push("--complexity".to_string());
        argv.push(complexity.to_string());
    }
    if let Some(tags) = payload.get("tags").and_then(|v| v.as_array()) {
        let joined = tags
            .iter()
            .filter_map(|t| t.as_str())
            .collect::<Vec<_>>()
            .join(",");
        if !joined.is_empty() {
            argv.push("--tags".to_string());
            argv.push(joined);
        }
    }

    Ok(argv)
}

/// Compare pending local mutations against the authoritative registry.
///
/// `add_feature` with a title that already exists remotely
/// (case-insensitive) is a `duplicate_feature` conflict. Updates carry no
/// conflict entry: replay writes user-authored fields only, so the
/// workstation keeps its system fields either way.
fn detect_conflicts(
    pending: &[PendingOperation],
    remote_registry: &serde_json::Value,
) -> Vec<serde_json::Value> {
    let mut conflicts = Vec::new();
    let empty = serde_json::Map::new();
    let remote_features = remote_registry
        .get("features")
        .and_then(|f| f.as_object())
        .unwrap_or(&empty);

    for op in pending {
        if op.operation != OperationKind::AddFeature {
            continue;
        }
        let Ok(payload) = serde_json::from_str::<serde_json::Value>(&op.payload_json) else {
            continue;
        };
        let Some(local_title) = payload.get("title").and_then(|v| v.as_str()) else {
            continue;
        };

        for (remote_id, remote_feature) in remote_features {
            let remote_title = remote_feature
                .get("title")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            if remote_title.to_lowercase() == local_title.to_lowercase() {
                conflicts.push(serde_json::json!({
                    "type": "duplicate_feature",
                    "local_title": local_title,
                    "remote_id": remote_id,
                    "remote_title": remote_title,
                }));
                break;
            }
        }
    }

    conflicts
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::types::OperationStatus;
    use std::path::Path;
    use tempfile::TempDir;

    fn pending_op(id: i64, kind: OperationKind, payload: serde_json::Value) -> PendingOperation {
        PendingOperation {
            id,
            project_name: "P".to_string(),
            operation: kind,
            payload_json: payload.to_string(),
            created_at: now_rfc3339(),
            status: OperationStatus::Pending,
            error_message: None,
        }
    }

    #[test]
    fn detect_conflicts_flags_duplicate_titles_case_insensitive() {
        let pending = vec![pending_op(
            1,
            OperationKind::AddFeature,
            serde_json::json!({"title": "dark MODE"}),
        )];
        let remote = serde_json::json!({
            "features": {"dark-mode": {"title": "Dark Mode"}}
        });

        let conflicts = detect_conflicts(&pending, &remote);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0]["type"], "duplicate_feature");
        assert_eq!(conflicts[0]["remote_id"], "dark-mode");
    }

    #[test]
    fn detect_conflicts_ignores_new_titles_and_updates() {
        let pending = vec![
            pending_op(
                1,
                OperationKind::AddFeature,
                serde_json::json!({"title": "Brand new"}),
            ),
            pending_op(
                2,
                OperationKind::UpdateFeature,
                serde_json::json!({"feature_id": "dark-mode", "title": "Renamed"}),
            ),
        ];
        let remote = serde_json::json!({"features": {"dark-mode": {"title": "Dark Mode"}}});

        assert!(detect_conflicts(&pending, &remote).is_empty());
    }

    #[test]
    fn add_feature_argv_includes_optional_fields() {
        let argv = build_add_feature_argv(&serde_json::json!({
            "title": "Dark mode",
            "description": "toggle",
            "priority": 2,
            "complexity": "small",
            "tags": ["ui", "theme"],
        }))
        .unwrap();

        assert_eq!(argv[..3], ["forge", "add", "Dark mode"]);
        assert!(argv.windows(2).any(|w| w == ["--priority", "2"]));
        assert!(argv.windows(2).any(|w| w == ["--tags", "ui,theme"]));
    }

    #[test]
    fn add_feature_argv_requires_title() {
        assert!(build_add_feature_argv(&serde_json::json!({})).is_err());
    }

    // --- End-to-end tests against a fake ssh that executes locally ---

    /// Write a stub `ssh` that ignores options and evaluates the remote
    /// command locally, so transport calls hit the local filesystem.
    fn fake_ssh(dir: &Path) -> String {
        use std::os::unix::fs::PermissionsExt;
        let script = dir.join("fake-ssh");
        std::fs::write(
            &script,
            "#!/bin/sh\nfor arg in \"$@\"; do last=\"$arg\"; done\neval \"$last\"\n",
        )
        .unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();
        script.display().to_string()
    }

    async fn engine_with_fake_ssh(dir: &Path) -> (Arc<SyncEngine>, Arc<CacheManager>) {
        let cache = Arc::new(CacheManager::new(&dir.join("cache.db")).await.unwrap());
        let transport = SshTransport::new("mac", "brian").with_program(fake_ssh(dir));
        let engine = SyncEngine::new(transport, Arc::clone(&cache));
        (engine, cache)
    }

    fn write_remote_registry(project_dir: &Path, registry: &serde_json::Value) {
        let flowforge = project_dir.join(".flowforge");
        std::fs::create_dir_all(&flowforge).unwrap();
        std::fs::write(
            flowforge.join("registry.json"),
            serde_json::to_string_pretty(registry).unwrap(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn health_check_fires_callback_once_per_edge() {
        let dir = TempDir::new().unwrap();
        let (engine, _cache) = engine_with_fake_ssh(dir.path()).await;

        let transitions = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = Arc::clone(&transitions);
        engine.on_status_change(move |online| seen.lock().unwrap().push(online));

        // Offline -> online: one transition, repeated checks add nothing.
        assert!(engine.check_health().await);
        assert!(engine.check_health().await);
        assert_eq!(*transitions.lock().unwrap(), vec![true]);
        assert!(engine.is_online().await);
    }

    #[tokio::test]
    async fn health_check_detects_unreachable() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(CacheManager::new(&dir.path().join("c.db")).await.unwrap());
        let transport = SshTransport::new("mac", "brian").with_program("/nonexistent/ssh-binary");
        let engine = SyncEngine::new(transport, cache);

        assert!(!engine.check_health().await);
        assert!(!engine.is_online().await);
    }

    #[tokio::test]
    async fn sync_project_fails_when_registry_unreadable() {
        let dir = TempDir::new().unwrap();
        let (engine, _cache) = engine_with_fake_ssh(dir.path()).await;

        let result = engine
            .sync_project("ghost", &dir.path().join("missing").display().to_string())
            .await;
        assert!(!result.success);
        assert!(result.message.contains("Could not read registry"));
    }

    #[tokio::test]
    async fn sync_project_replays_update_and_refreshes_cache() {
        let dir = TempDir::new().unwrap();
        let project_dir = dir.path().join("proj");
        write_remote_registry(
            &project_dir,
            &serde_json::json!({
                "version": "1.0.0",
                "features": {
                    "dark-mode": {"id": "dark-mode", "title": "Dark mode",
                                   "status": "in-progress", "branch": "feature/dark-mode"}
                },
                "merge_queue": []
            }),
        );

        let (engine, cache) = engine_with_fake_ssh(dir.path()).await;
        let project_path = project_dir.display().to_string();

        // Queue a local rename made while offline.
        let op_id = cache
            .queue_operation(
                "proj",
                OperationKind::UpdateFeature,
                &serde_json::json!({"feature_id": "dark-mode", "title": "Dark mode v2"}),
            )
            .await
            .unwrap();

        let result = engine.sync_project("proj", &project_path).await;
        assert!(result.success, "{}", result.message);

        // The workstation registry took the user-authored field but kept
        // its system fields.
        let remote: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(project_dir.join(".flowforge/registry.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(remote["features"]["dark-mode"]["title"], "Dark mode v2");
        assert_eq!(remote["features"]["dark-mode"]["status"], "in-progress");

        // Cache refreshed, op completed, sync state synced.
        let cached = cache.get_cached_registry("proj").await.unwrap().unwrap();
        assert_eq!(cached["features"]["dark-mode"]["title"], "Dark mode v2");
        assert_eq!(cache.get_pending_count(Some("proj")).await.unwrap(), 0);
        let state = cache.get_sync_state("proj").await.unwrap().unwrap();
        assert_eq!(state.sync_status, SyncStatus::Synced);
        assert!(state.last_mac_registry_hash.is_some());
        let _ = op_id;
    }

    #[tokio::test]
    async fn failed_operation_does_not_block_later_ones() {
        let dir = TempDir::new().unwrap();
        let project_dir = dir.path().join("proj");
        write_remote_registry(
            &project_dir,
            &serde_json::json!({
                "version": "1.0.0",
                "features": {"x": {"id": "x", "title": "X"}},
                "merge_queue": []
            }),
        );

        let (engine, cache) = engine_with_fake_ssh(dir.path()).await;
        let project_path = project_dir.display().to_string();

        // First op targets a missing feature and fails; second succeeds.
        let bad = cache
            .queue_operation(
                "proj",
                OperationKind::UpdateFeature,
                &serde_json::json!({"feature_id": "ghost", "title": "nope"}),
            )
            .await
            .unwrap();
        cache
            .queue_operation(
                "proj",
                OperationKind::UpdateFeature,
                &serde_json::json!({"feature_id": "x", "title": "X renamed"}),
            )
            .await
            .unwrap();

        let result = engine.sync_project("proj", &project_path).await;
        assert!(!result.success);
        assert_eq!(result.failed_operations, vec![bad]);

        let remote: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(project_dir.join(".flowforge/registry.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(remote["features"]["x"]["title"], "X renamed");
    }

    #[tokio::test]
    async fn remote_change_with_pending_ops_records_conflict() {
        let dir = TempDir::new().unwrap();
        let project_dir = dir.path().join("proj");
        write_remote_registry(
            &project_dir,
            &serde_json::json!({
                "version": "1.0.0",
                "features": {"dark-mode": {"id": "dark-mode", "title": "Dark Mode"}},
                "merge_queue": []
            }),
        );

        let (engine, cache) = engine_with_fake_ssh(dir.path()).await;
        let project_path = project_dir.display().to_string();

        // Seed sync state with a stale hash so the remote reads as changed.
        cache
            .update_sync_state("proj", Some("0000000000000000"), SyncStatus::Synced)
            .await
            .unwrap();

        // Pending add duplicates a remote title; replay would run the
        // remote CLI, which the stub cannot satisfy, so it fails, but the
        // conflict is still recorded first.
        cache
            .queue_operation(
                "proj",
                OperationKind::AddFeature,
                &serde_json::json!({"title": "dark mode"}),
            )
            .await
            .unwrap();

        let result = engine.sync_project("proj", &project_path).await;
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0]["type"], "duplicate_feature");

        let state = cache.get_sync_state("proj").await.unwrap().unwrap();
        assert_eq!(state.sync_status, SyncStatus::Conflict);
    }

    #[tokio::test]
    async fn sync_all_requires_online() {
        let dir = TempDir::new().unwrap();
        let (engine, _cache) = engine_with_fake_ssh(dir.path()).await;

        // Engine starts offline; no health check has run.
        let result = engine.sync_all_projects().await;
        assert!(!result.success);
        assert!(result.message.contains("offline"));
    }
}
