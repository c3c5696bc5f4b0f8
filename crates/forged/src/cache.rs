//! SQLite cache for offline-first operation.
//!
//! Mirrors project config and registry documents locally so the remote
//! device stays usable while the workstation is unreachable, and queues
//! mutations for later replay. The `features` rows are a flat denormalized
//! projection of the project's `registry_json`; they are rewritten
//! together in one transaction and only read for fast per-feature queries.

use std::path::{Path, PathBuf};

use forge_core::types::{
    now_rfc3339, OperationKind, OperationStatus, PendingOperation, ProjectSyncState, SyncStatus,
};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Row, Sqlite};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("unknown operation kind: {0}")]
    UnknownOperation(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// A cached project row.
#[derive(Debug, Clone)]
pub struct CachedProject {
    pub name: String,
    pub path: String,
    pub cached_at: String,
    pub config_json: Option<String>,
    pub registry_json: Option<String>,
}

/// Cache statistics for diagnostics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub projects_cached: i64,
    pub features_cached: i64,
    pub pending_operations: i64,
    pub db_path: String,
}

/// SQLite-backed cache manager.
#[derive(Debug)]
pub struct CacheManager {
    pool: Pool<Sqlite>,
    db_path: PathBuf,
}

impl CacheManager {
    /// Default cache location: `~/.flowforge-cache/flowforge.db`.
    pub fn default_db_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".flowforge-cache")
            .join("flowforge.db")
    }

    /// Open (creating if needed) the cache database and apply the schema.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        let cache = Self {
            pool,
            db_path: db_path.to_path_buf(),
        };
        cache.migrate_embedded().await?;
        Ok(cache)
    }

    /// Apply the embedded schema, idempotently.
    async fn migrate_embedded(&self) -> Result<()> {
        let migration = include_str!("../../../migrations/0001_init.sql");
        let cleaned: String = migration
            .lines()
            .filter(|line| !line.trim().starts_with("--"))
            .collect::<Vec<_>>()
            .join("\n");

        for statement in cleaned.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed).execute(&self.pool).await?;
            }
        }
        Ok(())
    }

    // --- Project cache ---

    /// Replace a project's cached row and rebuild its per-feature rows,
    /// atomically in one transaction.
    pub async fn cache_project(
        &self,
        name: &str,
        path: &str,
        config: Option<&serde_json::Value>,
        registry: Option<&serde_json::Value>,
    ) -> Result<()> {
        let config_json = config.map(serde_json::Value::to_string);
        let registry_json = registry.map(serde_json::Value::to_string);
        let now = now_rfc3339();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT OR REPLACE INTO projects (name, path, cached_at, config_json, registry_json) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(name)
        .bind(path)
        .bind(&now)
        .bind(&config_json)
        .bind(&registry_json)
        .execute(&mut *tx)
        .await?;

        if let Some(registry) = registry {
            sqlx::query("DELETE FROM features WHERE project_name = ?1")
                .bind(name)
                .execute(&mut *tx)
                .await?;

            if let Some(features) = registry.get("features").and_then(|f| f.as_object()) {
                for (feature_id, data) in features {
                    sqlx::query(
                        "INSERT INTO features (id, project_name, data_json, cached_at) \
                         VALUES (?1, ?2, ?3, ?4)",
                    )
                    .bind(feature_id)
                    .bind(name)
                    .bind(data.to_string())
                    .bind(&now)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_cached_project(&self, name: &str) -> Result<Option<CachedProject>> {
        let row = sqlx::query(
            "SELECT name, path, cached_at, config_json, registry_json FROM projects WHERE name = ?1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| CachedProject {
            name: r.get("name"),
            path: r.get("path"),
            cached_at: r.get("cached_at"),
            config_json: r.get("config_json"),
            registry_json: r.get("registry_json"),
        }))
    }

    /// All cached projects, name and path only.
    pub async fn get_all_cached_projects(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT name, path FROM projects ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get("name"), r.get("path")))
            .collect())
    }

    /// Denormalized feature documents for a project.
    pub async fn get_cached_features(&self, project_name: &str) -> Result<Vec<serde_json::Value>> {
        let rows =
            sqlx::query("SELECT data_json FROM features WHERE project_name = ?1 ORDER BY id")
                .bind(project_name)
                .fetch_all(&self.pool)
                .await?;

        let mut features = Vec::with_capacity(rows.len());
        for row in rows {
            let data: String = row.get("data_json");
            features.push(serde_json::from_str(&data)?);
        }
        Ok(features)
    }

    /// Full cached registry document for a project.
    pub async fn get_cached_registry(
        &self,
        project_name: &str,
    ) -> Result<Option<serde_json::Value>> {
        let project = self.get_cached_project(project_name).await?;
        match project.and_then(|p| p.registry_json) {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    // --- Pending operation queue ---

    /// Queue a mutation for later replay. Returns the assigned id.
    pub async fn queue_operation(
        &self,
        project_name: &str,
        operation: OperationKind,
        payload: &serde_json::Value,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO pending_operations (project_name, operation, payload_json, created_at, status) \
             VALUES (?1, ?2, ?3, ?4, 'pending')",
        )
        .bind(project_name)
        .bind(operation.as_str())
        .bind(payload.to_string())
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Pending operations in creation order, optionally per project.
    pub async fn get_pending_operations(
        &self,
        project_name: Option<&str>,
    ) -> Result<Vec<PendingOperation>> {
        let rows = match project_name {
            Some(project) => {
                sqlx::query(
                    "SELECT id, project_name, operation, payload_json, created_at, status, error_message \
                     FROM pending_operations WHERE project_name = ?1 AND status = 'pending' \
                     ORDER BY created_at, id",
                )
                .bind(project)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, project_name, operation, payload_json, created_at, status, error_message \
                     FROM pending_operations WHERE status = 'pending' ORDER BY created_at, id",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter()
            .map(|r| {
                let operation: String = r.get("operation");
                let status: String = r.get("status");
                Ok(PendingOperation {
                    id: r.get("id"),
                    project_name: r.get("project_name"),
                    operation: OperationKind::parse(&operation)
                        .ok_or(CacheError::UnknownOperation(operation))?,
                    payload_json: r.get("payload_json"),
                    created_at: r.get("created_at"),
                    status: OperationStatus::parse(&status).unwrap_or_default(),
                    error_message: r.get("error_message"),
                })
            })
            .collect()
    }

    pub async fn get_pending_count(&self, project_name: Option<&str>) -> Result<i64> {
        let count: (i64,) = match project_name {
            Some(project) => {
                sqlx::query_as(
                    "SELECT COUNT(*) FROM pending_operations \
                     WHERE project_name = ?1 AND status = 'pending'",
                )
                .bind(project)
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as("SELECT COUNT(*) FROM pending_operations WHERE status = 'pending'")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count.0)
    }

    pub async fn mark_operation_syncing(&self, operation_id: i64) -> Result<()> {
        self.set_operation_status(operation_id, "syncing", None)
            .await
    }

    pub async fn mark_operation_completed(&self, operation_id: i64) -> Result<()> {
        self.set_operation_status(operation_id, "completed", None)
            .await
    }

    pub async fn mark_operation_failed(&self, operation_id: i64, error: &str) -> Result<()> {
        self.set_operation_status(operation_id, "failed", Some(error))
            .await
    }

    async fn set_operation_status(
        &self,
        operation_id: i64,
        status: &str,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE pending_operations SET status = ?1, error_message = ?2 WHERE id = ?3")
            .bind(status)
            .bind(error)
            .bind(operation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn clear_completed_operations(&self) -> Result<()> {
        sqlx::query("DELETE FROM pending_operations WHERE status = 'completed'")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Sync state ---

    pub async fn get_sync_state(&self, project_name: &str) -> Result<Option<ProjectSyncState>> {
        let row = sqlx::query(
            "SELECT project_name, last_sync, last_mac_registry_hash, sync_status \
             FROM sync_state WHERE project_name = ?1",
        )
        .bind(project_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| {
            let status: String = r.get("sync_status");
            ProjectSyncState {
                project_name: r.get("project_name"),
                last_sync: r.get("last_sync"),
                last_mac_registry_hash: r.get("last_mac_registry_hash"),
                sync_status: SyncStatus::parse(&status).unwrap_or_default(),
            }
        }))
    }

    /// Record a completed sync pass.
    pub async fn update_sync_state(
        &self,
        project_name: &str,
        registry_hash: Option<&str>,
        sync_status: SyncStatus,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO sync_state \
             (project_name, last_sync, last_mac_registry_hash, sync_status) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(project_name)
        .bind(now_rfc3339())
        .bind(registry_hash)
        .bind(sync_status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Flag a project as having local changes awaiting sync.
    pub async fn set_sync_pending(&self, project_name: &str) -> Result<()> {
        sqlx::query("UPDATE sync_state SET sync_status = 'pending' WHERE project_name = ?1")
            .bind(project_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Utilities ---

    pub async fn get_cache_stats(&self) -> Result<CacheStats> {
        let projects: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM projects")
            .fetch_one(&self.pool)
            .await?;
        let features: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM features")
            .fetch_one(&self.pool)
            .await?;
        let pending: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM pending_operations WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;

        Ok(CacheStats {
            projects_cached: projects.0,
            features_cached: features.0,
            pending_operations: pending.0,
            db_path: self.db_path.display().to_string(),
        })
    }

    /// Wipe all cached data. Test support.
    pub async fn clear_all(&self) -> Result<()> {
        for table in ["pending_operations", "sync_state", "features", "projects"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct TestCache {
        cache: CacheManager,
        _dir: TempDir,
    }

    async fn create_test_cache() -> TestCache {
        let dir = TempDir::new().unwrap();
        let cache = CacheManager::new(&dir.path().join("test.db"))
            .await
            .unwrap();
        TestCache { cache, _dir: dir }
    }

    fn sample_registry() -> serde_json::Value {
        serde_json::json!({
            "version": "1.0.0",
            "features": {
                "dark-mode": {"id": "dark-mode", "title": "Dark mode", "status": "planned"},
                "oauth": {"id": "oauth", "title": "OAuth", "status": "review"}
            },
            "merge_queue": []
        })
    }

    #[tokio::test]
    async fn cache_project_round_trips() {
        let tc = create_test_cache().await;
        let config = serde_json::json!({"version": "1.0.0", "project": {"name": "AirFit"}});

        tc.cache
            .cache_project(
                "AirFit",
                "/Users/Brian/AirFit",
                Some(&config),
                Some(&sample_registry()),
            )
            .await
            .unwrap();

        let cached = tc
            .cache
            .get_cached_project("AirFit")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.path, "/Users/Brian/AirFit");
        assert!(cached.config_json.is_some());

        let registry = tc
            .cache
            .get_cached_registry("AirFit")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(registry["features"]["dark-mode"]["title"], "Dark mode");
    }

    #[tokio::test]
    async fn cache_project_rebuilds_feature_rows() {
        let tc = create_test_cache().await;
        tc.cache
            .cache_project("P", "/p", None, Some(&sample_registry()))
            .await
            .unwrap();

        let features = tc.cache.get_cached_features("P").await.unwrap();
        assert_eq!(features.len(), 2);

        // Re-cache with one feature removed; rows are replaced, not merged.
        let smaller = serde_json::json!({
            "features": {"oauth": {"id": "oauth", "title": "OAuth"}}
        });
        tc.cache
            .cache_project("P", "/p", None, Some(&smaller))
            .await
            .unwrap();
        let features = tc.cache.get_cached_features("P").await.unwrap();
        assert_eq!(features.len(), 1);
        assert_eq!(features[0]["id"], "oauth");
    }

    #[tokio::test]
    async fn get_missing_project_returns_none() {
        let tc = create_test_cache().await;
        assert!(tc
            .cache
            .get_cached_project("ghost")
            .await
            .unwrap()
            .is_none());
        assert!(tc
            .cache
            .get_cached_registry("ghost")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn queue_operation_assigns_increasing_ids() {
        let tc = create_test_cache().await;
        let first = tc
            .cache
            .queue_operation(
                "P",
                OperationKind::AddFeature,
                &serde_json::json!({"title": "A"}),
            )
            .await
            .unwrap();
        let second = tc
            .cache
            .queue_operation(
                "P",
                OperationKind::DeleteFeature,
                &serde_json::json!({"feature_id": "a"}),
            )
            .await
            .unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn pending_operations_ordered_and_filtered() {
        let tc = create_test_cache().await;
        tc.cache
            .queue_operation(
                "A",
                OperationKind::AddFeature,
                &serde_json::json!({"title": "1"}),
            )
            .await
            .unwrap();
        tc.cache
            .queue_operation(
                "B",
                OperationKind::AddFeature,
                &serde_json::json!({"title": "2"}),
            )
            .await
            .unwrap();
        tc.cache
            .queue_operation(
                "A",
                OperationKind::UpdateFeature,
                &serde_json::json!({"feature_id": "1"}),
            )
            .await
            .unwrap();

        let all = tc.cache.get_pending_operations(None).await.unwrap();
        assert_eq!(all.len(), 3);

        let for_a = tc.cache.get_pending_operations(Some("A")).await.unwrap();
        assert_eq!(for_a.len(), 2);
        assert_eq!(for_a[0].operation, OperationKind::AddFeature);
        assert_eq!(for_a[1].operation, OperationKind::UpdateFeature);
        assert!(for_a[0].id < for_a[1].id);

        assert_eq!(tc.cache.get_pending_count(Some("A")).await.unwrap(), 2);
        assert_eq!(tc.cache.get_pending_count(None).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn operation_status_transitions() {
        let tc = create_test_cache().await;
        let id = tc
            .cache
            .queue_operation(
                "P",
                OperationKind::AddFeature,
                &serde_json::json!({"title": "A"}),
            )
            .await
            .unwrap();

        tc.cache.mark_operation_syncing(id).await.unwrap();
        // Syncing ops are no longer pending.
        assert_eq!(tc.cache.get_pending_count(Some("P")).await.unwrap(), 0);

        tc.cache
            .mark_operation_failed(id, "ssh timeout")
            .await
            .unwrap();
        tc.cache.mark_operation_completed(id).await.unwrap();
        tc.cache.clear_completed_operations().await.unwrap();
        assert_eq!(tc.cache.get_pending_count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sync_state_round_trips() {
        let tc = create_test_cache().await;
        assert!(tc.cache.get_sync_state("P").await.unwrap().is_none());

        tc.cache
            .update_sync_state("P", Some("abcd1234abcd1234"), SyncStatus::Synced)
            .await
            .unwrap();

        let state = tc.cache.get_sync_state("P").await.unwrap().unwrap();
        assert_eq!(state.sync_status, SyncStatus::Synced);
        assert_eq!(
            state.last_mac_registry_hash.as_deref(),
            Some("abcd1234abcd1234")
        );
        assert!(state.last_sync.is_some());

        tc.cache.set_sync_pending("P").await.unwrap();
        let state = tc.cache.get_sync_state("P").await.unwrap().unwrap();
        assert_eq!(state.sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn cache_stats_counts() {
        let tc = create_test_cache().await;
        tc.cache
            .cache_project("P", "/p", None, Some(&sample_registry()))
            .await
            .unwrap();
        tc.cache
            .queue_operation("P", OperationKind::AddFeature, &serde_json::json!({}))
            .await
            .unwrap();

        let stats = tc.cache.get_cache_stats().await.unwrap();
        assert_eq!(stats.projects_cached, 1);
        assert_eq!(stats.features_cached, 2);
        assert_eq!(stats.pending_operations, 1);
    }

    #[tokio::test]
    async fn clear_all_wipes_everything() {
        let tc = create_test_cache().await;
        tc.cache
            .cache_project("P", "/p", None, Some(&sample_registry()))
            .await
            .unwrap();
        tc.cache
            .queue_operation("P", OperationKind::AddFeature, &serde_json::json!({}))
            .await
            .unwrap();

        tc.cache.clear_all().await.unwrap();
        let stats = tc.cache.get_cache_stats().await.unwrap();
        assert_eq!(stats.projects_cached, 0);
        assert_eq!(stats.features_cached, 0);
        assert_eq!(stats.pending_operations, 0);
    }

    #[tokio::test]
    async fn migration_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        let first = CacheManager::new(&path).await.unwrap();
        drop(first);
        // Re-opening re-applies the schema without error.
        let second = CacheManager::new(&path).await.unwrap();
        second.cache_project("P", "/p", None, None).await.unwrap();
    }
}
