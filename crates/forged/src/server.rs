//! RPC control plane for forged.
//!
//! A single tool-call dispatch façade over HTTP, bound to localhost:
//! `POST /rpc` takes `{name, arguments}` and answers
//! `{success, message, data?}`. External collaborators (CLI, chat server)
//! sit on top of this surface.
//!
//! Two modes: on the workstation every tool operates on the local
//! filesystem; on a remote device reads are served from the pi-local
//! mirror, mutations join the pending queue (draining immediately when
//! the workstation is reachable), and git-bound tools go through the
//! transport or refuse while offline.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{extract::State, routing::get, routing::post, Json, Router};
use forge_core::prompt::build_implementation_prompt;
use forge_core::registry::{FeaturePatch, FeatureRegistry, MAX_PLANNED_FEATURES};
use forge_core::types::{generate_id, Complexity, Feature, FeatureStatus};
use forge_core::{ForgeConfig, PathTranslator};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::cache::CacheManager;
use crate::executor::{ExecutionRequest, ParallelExecutor};
use crate::merge::MergeOrchestrator;
use crate::pi_registry::PiRegistryManager;
use crate::sync::SyncEngine;
use crate::transport::SshTransport;
use crate::worktree::{WorktreeError, WorktreeManager};

/// Tool-call envelope.
#[derive(Debug, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Tool-call result envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ToolResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
        }
    }

    pub fn ok_with(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }

    pub fn fail_with(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: Some(data),
        }
    }
}

/// Where the daemon runs relative to the repositories it manages.
pub enum ServerMode {
    /// On the workstation: direct filesystem and git access.
    Local { projects_base: PathBuf },
    /// On a remote device: pi-local mirror plus transport to the
    /// workstation.
    Remote {
        transport: SshTransport,
        translator: PathTranslator,
        /// Workstation directory that contains the projects.
        projects_base: String,
        cache: Arc<CacheManager>,
        sync: Arc<SyncEngine>,
        pi_registry: PiRegistryManager,
    },
}

impl std::fmt::Debug for ServerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local { projects_base } => f
                .debug_struct("Local")
                .field("projects_base", projects_base)
                .finish(),
            Self::Remote { projects_base, .. } => f
                .debug_struct("Remote")
                .field("projects_base", projects_base)
                .finish_non_exhaustive(),
        }
    }
}

/// Shared state for RPC handlers.
#[derive(Debug)]
pub struct AppState {
    pub mode: ServerMode,
    pub executor: Arc<ParallelExecutor>,
    /// Per-process config cache keyed by project path; registries are
    /// re-read on every call, configs are invalidated on mutation.
    config_cache: Mutex<HashMap<PathBuf, ForgeConfig>>,
}

impl AppState {
    pub fn new(mode: ServerMode, executor: Arc<ParallelExecutor>) -> Self {
        Self {
            mode,
            executor,
            config_cache: Mutex::new(HashMap::new()),
        }
    }
}

/// Build the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/rpc", post(handle_rpc))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the RPC surface on localhost.
pub async fn start_server(
    state: Arc<AppState>,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let router = create_router(state);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("RPC server listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn handle_rpc(
    State(state): State<Arc<AppState>>,
    Json(call): Json<ToolCall>,
) -> Json<ToolResult> {
    let args = &call.arguments;
    let result = match call.name.as_str() {
        "list_projects" => list_projects(&state).await,
        "list_features" => list_features(&state, args).await,
        "status" => project_status(&state, args).await,
        "start_feature" => start_feature(&state, args).await,
        "stop_feature" => stop_feature(&state, args).await,
        "merge_check" => merge_check(&state, args).await,
        "merge" => merge(&state, args).await,
        "add_feature" => add_feature(&state, args).await,
        "update_feature" => update_feature(&state, args).await,
        "delete_feature" => delete_feature(&state, args).await,
        other => ToolResult::fail(format!("Unknown tool: {other}")),
    };
    Json(result)
}

// --- Argument helpers ---

fn arg_str<'a>(args: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str())
}

fn arg_bool(args: &serde_json::Value, key: &str) -> bool {
    args.get(key)
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
}

fn require_str<'a>(args: &'a serde_json::Value, key: &str) -> Result<&'a str, ToolResult> {
    arg_str(args, key).ok_or_else(|| ToolResult::fail(format!("Missing required argument: {key}")))
}

// --- Local project context ---

struct ProjectContext {
    project_path: PathBuf,
    config: ForgeConfig,
    registry: FeatureRegistry,
}

impl AppState {
    /// Load config (cached) and a fresh registry for a project.
    async fn project_context(&self, project: &str) -> Result<ProjectContext, ToolResult> {
        let ServerMode::Local { projects_base } = &self.mode else {
            return Err(ToolResult::fail("Not in local mode"));
        };

        let project_path = projects_base.join(project);
        if !project_path.exists() {
            return Err(ToolResult::fail(format!("Project not found: {project}")));
        }
        if !project_path.join(".flowforge").exists() {
            return Err(ToolResult::fail(format!(
                "FlowForge not initialized in: {project}"
            )));
        }

        let mut cache = self.config_cache.lock().await;
        let config = match cache.get(&project_path) {
            Some(config) => config.clone(),
            None => {
                let config = ForgeConfig::load(&project_path)
                    .map_err(|e| ToolResult::fail(e.to_string()))?;
                cache.insert(project_path.clone(), config.clone());
                config
            }
        };
        drop(cache);

        let registry =
            FeatureRegistry::load(&project_path).map_err(|e| ToolResult::fail(e.to_string()))?;

        Ok(ProjectContext {
            project_path,
            config,
            registry,
        })
    }

    async fn invalidate(&self, project_path: &PathBuf) {
        self.config_cache.lock().await.remove(project_path);
    }
}

// --- Tool handlers ---

async fn list_projects(state: &AppState) -> ToolResult {
    match &state.mode {
        ServerMode::Local { projects_base } => {
            let Ok(entries) = std::fs::read_dir(projects_base) else {
                return ToolResult::fail(format!(
                    "Projects base not readable: {}",
                    projects_base.display()
                ));
            };

            let mut projects = Vec::new();
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() && path.join(".flowforge").exists() {
                    if let Ok(config) = ForgeConfig::load(&path) {
                        projects.push(json!({
                            "name": config.project.name,
                            "path": path.display().to_string(),
                            "main_branch": config.project.main_branch,
                        }));
                    }
                }
            }
            projects.sort_by_key(|p| p["name"].as_str().unwrap_or("").to_string());

            ToolResult::ok_with(
                format!("Found {} project(s)", projects.len()),
                json!({"projects": projects}),
            )
        }
        ServerMode::Remote {
            transport,
            sync,
            projects_base,
            pi_registry,
            ..
        } => {
            if sync.is_online().await {
                let projects = transport.get_projects(projects_base).await;
                ToolResult::ok_with(
                    format!("Found {} project(s)", projects.len()),
                    json!({"projects": projects}),
                )
            } else {
                let projects = pi_registry.list_projects();
                ToolResult::ok_with(
                    format!(
                        "Found {} cached project(s) (workstation offline)",
                        projects.len()
                    ),
                    json!({"projects": projects}),
                )
            }
        }
    }
}

async fn list_features(state: &AppState, args: &serde_json::Value) -> ToolResult {
    let project = match require_str(args, "project") {
        Ok(p) => p,
        Err(e) => return e,
    };

    let status_filter = match arg_str(args, "status") {
        Some(s) => match FeatureStatus::parse(s) {
            Some(status) => Some(status),
            None => {
                return ToolResult::fail(format!(
                    "Invalid status: {s}. Use: planned, in-progress, review, completed, blocked"
                ))
            }
        },
        None => None,
    };

    let registry = match load_registry(state, project).await {
        Ok(registry) => registry,
        Err(e) => return e,
    };

    let features: Vec<&Feature> = registry.list_features(status_filter, None, None);
    ToolResult::ok_with(
        format!("Found {} feature(s)", features.len()),
        json!({"features": features}),
    )
}

async fn project_status(state: &AppState, args: &serde_json::Value) -> ToolResult {
    let project = match require_str(args, "project") {
        Ok(p) => p,
        Err(e) => return e,
    };

    let registry = match load_registry(state, project).await {
        Ok(registry) => registry,
        Err(e) => return e,
    };
    let stats = registry.get_stats();

    let mut data = json!({"project_name": project, "stats": stats});
    if let ServerMode::Local { .. } = &state.mode {
        if let Ok(ctx) = state.project_context(project).await {
            data["main_branch"] = json!(ctx.config.project.main_branch);
        }
    }
    if let ServerMode::Remote { sync, .. } = &state.mode {
        data["workstation"] = serde_json::to_value(sync.status().await).unwrap_or_default();
    }

    ToolResult::ok_with(format!("Project {project} status"), data)
}

/// Registry for reads: local filesystem or the pi-local mirror.
async fn load_registry(state: &AppState, project: &str) -> Result<FeatureRegistry, ToolResult> {
    match &state.mode {
        ServerMode::Local { .. } => Ok(state.project_context(project).await?.registry),
        ServerMode::Remote { pi_registry, .. } => pi_registry
            .get_registry(project)
            .map_err(|e| ToolResult::fail(e.to_string())),
    }
}

async fn start_feature(state: &AppState, args: &serde_json::Value) -> ToolResult {
    let project = match require_str(args, "project") {
        Ok(p) => p,
        Err(e) => return e,
    };
    let feature_id = match require_str(args, "feature_id") {
        Ok(f) => f,
        Err(e) => return e,
    };
    let execute = arg_bool(args, "execute");

    match &state.mode {
        ServerMode::Local { .. } => local_start_feature(state, project, feature_id, execute).await,
        ServerMode::Remote {
            transport,
            translator,
            sync,
            pi_registry,
            ..
        } => {
            if !sync.is_online().await {
                return ToolResult::fail(
                    "Workstation is offline; starting a feature requires workspace creation",
                );
            }
            remote_start_feature(transport, translator, pi_registry, project, feature_id).await
        }
    }
}

async fn local_start_feature(
    state: &AppState,
    project: &str,
    feature_id: &str,
    execute: bool,
) -> ToolResult {
    let mut ctx = match state.project_context(project).await {
        Ok(ctx) => ctx,
        Err(e) => return e,
    };

    let Some(feature) = ctx.registry.get_feature(feature_id).cloned() else {
        return ToolResult::fail(format!("Feature not found: {feature_id}"));
    };
    if feature.status == FeatureStatus::Completed {
        return ToolResult::fail("Feature is already completed");
    }

    let manager = WorktreeManager::new(
        &ctx.project_path,
        &ctx.config.project.worktree_base,
        ctx.config.project.main_branch.clone(),
    );
    let worktree_path = match manager.existing_worktree_path(feature_id) {
        Some(path) => path,
        None => match manager.create(feature_id, &ctx.config.project.main_branch) {
            Ok(path) => path,
            Err(WorktreeError::AlreadyExists(path)) => path,
            Err(e) => return ToolResult::fail(format!("Failed to create worktree: {e}")),
        },
    };

    // The upstream spec pipeline is external; the prompt substitutes the
    // feature's own description.
    let spec_text = if feature.description.is_empty() {
        feature.title.clone()
    } else {
        feature.description.clone()
    };
    let prompt = build_implementation_prompt(&ctx.config.project.name, &spec_text);

    let prompt_dir = ctx.project_path.join(".flowforge").join("prompts");
    if let Err(e) = std::fs::create_dir_all(&prompt_dir) {
        return ToolResult::fail(format!("Failed to create prompt dir: {e}"));
    }
    let prompt_path = prompt_dir.join(format!("{feature_id}.md"));
    if let Err(e) = std::fs::write(&prompt_path, &prompt) {
        return ToolResult::fail(format!("Failed to write prompt: {e}"));
    }

    // Workspace and branch exist; now flip the registry. A failure here
    // rolls the workspace back so the feature stays planned.
    let update = ctx.registry.update_feature(
        feature_id,
        &FeaturePatch {
            status: Some(FeatureStatus::InProgress),
            branch: Some(Some(Feature::branch_name(feature_id))),
            worktree_path: Some(Some(worktree_path.display().to_string())),
            prompt_path: Some(Some(prompt_path.display().to_string())),
            ..FeaturePatch::default()
        },
    );
    if let Err(e) = update {
        let _ = manager.remove(feature_id, true, true);
        return ToolResult::fail(format!("Failed to update registry: {e}"));
    }

    state.invalidate(&ctx.project_path).await;

    if execute {
        let request = ExecutionRequest {
            feature_id: feature_id.to_string(),
            spec: spec_text,
            project_name: ctx.config.project.name.clone(),
            project_root: ctx.project_path.clone(),
            worktree_base: ctx.config.project.worktree_base.clone(),
            main_branch: ctx.config.project.main_branch.clone(),
        };
        // Progress flows through the executor's broadcast stream.
        let _ = state.executor.execute_feature(request).await;
    }

    ToolResult::ok_with(
        format!("Started feature: {}", feature.title),
        json!({
            "feature_id": feature_id,
            "worktree_path": worktree_path.display().to_string(),
            "prompt_path": prompt_path.display().to_string(),
            "launch_command": format!(
                "cd {} && {} {}",
                worktree_path.display(),
                ctx.config.project.claude_command,
                ctx.config.project.claude_flags.join(" ")
            ),
            "executing": execute,
        }),
    )
}

async fn remote_start_feature(
    transport: &SshTransport,
    translator: &PathTranslator,
    pi_registry: &PiRegistryManager,
    project: &str,
    feature_id: &str,
) -> ToolResult {
    let mut registry = match pi_registry.get_registry(project) {
        Ok(registry) => registry,
        Err(e) => return ToolResult::fail(e.to_string()),
    };
    let Some(feature) = registry.get_feature(feature_id).cloned() else {
        return ToolResult::fail(format!("Feature not found: {feature_id}"));
    };
    if feature.status == FeatureStatus::Completed {
        return ToolResult::fail("Feature is already completed");
    }

    let config = pi_registry.get_config(project);
    let worktree_base = config
        .as_ref()
        .map(|c| c.project.worktree_base.clone())
        .unwrap_or_else(|| ".flowforge-worktrees".to_string());

    // Mirror paths may carry the local namespace; transport commands need
    // the workstation form.
    let project_path = translator.resolve_for_mac(&registry.project_root().display().to_string());
    let branch = Feature::branch_name(feature_id);
    let worktree_path = format!("{project_path}/{worktree_base}/{feature_id}");

    let result = transport
        .add_worktree(&project_path, &worktree_path, &branch, true)
        .await;
    if !result.success() && !result.stderr.contains("already exists") {
        return ToolResult::fail(format!(
            "Failed to create worktree: {}",
            result.stderr.trim()
        ));
    }

    // Mirror the transition locally; the sync engine reconciles with the
    // workstation registry on its next pass.
    let update = registry.update_feature(
        feature_id,
        &FeaturePatch {
            status: Some(FeatureStatus::InProgress),
            branch: Some(Some(branch.clone())),
            worktree_path: Some(Some(worktree_path.clone())),
            ..FeaturePatch::default()
        },
    );
    if let Err(e) = update {
        return ToolResult::fail(format!("Worktree created but mirror update failed: {e}"));
    }

    ToolResult::ok_with(
        format!("Started feature: {}", feature.title),
        json!({
            "feature_id": feature_id,
            "worktree_path": worktree_path,
            "branch": branch,
        }),
    )
}

async fn stop_feature(state: &AppState, args: &serde_json::Value) -> ToolResult {
    let project = match require_str(args, "project") {
        Ok(p) => p,
        Err(e) => return e,
    };
    let feature_id = match require_str(args, "feature_id") {
        Ok(f) => f,
        Err(e) => return e,
    };

    let mut registry = match load_registry(state, project).await {
        Ok(registry) => registry,
        Err(e) => return e,
    };

    let Some(feature) = registry.get_feature(feature_id).cloned() else {
        return ToolResult::fail(format!("Feature not found: {feature_id}"));
    };

    let update = registry.update_feature(
        feature_id,
        &FeaturePatch {
            status: Some(FeatureStatus::Review),
            ..FeaturePatch::default()
        },
    );
    if let Err(e) = update {
        return ToolResult::fail(format!("Failed to update feature: {e}"));
    }

    if let ServerMode::Local { .. } = &state.mode {
        if let Ok(ctx) = state.project_context(project).await {
            state.invalidate(&ctx.project_path).await;
        }
    }

    ToolResult::ok_with(
        format!("Feature '{}' marked as ready for review", feature.title),
        json!({
            "feature_id": feature_id,
            "next_steps": [
                "Run merge_check to verify no conflicts",
                "Run merge to merge into trunk",
            ],
        }),
    )
}

async fn merge_check(state: &AppState, args: &serde_json::Value) -> ToolResult {
    let project = match require_str(args, "project") {
        Ok(p) => p,
        Err(e) => return e,
    };
    let feature_id = arg_str(args, "feature_id");

    match &state.mode {
        ServerMode::Local { .. } => {
            let ctx = match state.project_context(project).await {
                Ok(ctx) => ctx,
                Err(e) => return e,
            };
            let orchestrator = MergeOrchestrator::new(
                &ctx.project_path,
                ctx.config.project.main_branch.clone(),
                ctx.config.project.build_command.clone(),
            );

            match feature_id {
                Some(id) => {
                    let result = orchestrator.check_conflicts(&ctx.registry, id);
                    ToolResult {
                        success: result.success,
                        message: result.message.clone(),
                        data: Some(json!({
                            "feature_id": id,
                            "ready": result.success,
                            "conflict_files": result.conflict_files,
                        })),
                    }
                }
                None => {
                    let order = orchestrator.compute_merge_order(&ctx.registry);
                    let mut checks = Vec::new();
                    for id in &order {
                        let title = ctx
                            .registry
                            .get_feature(id)
                            .map(|f| f.title.clone())
                            .unwrap_or_default();
                        let result = orchestrator.check_conflicts(&ctx.registry, id);
                        checks.push(json!({
                            "feature_id": id,
                            "title": title,
                            "ready": result.success,
                            "conflict_files": result.conflict_files,
                        }));
                    }
                    let ready = checks.iter().filter(|c| c["ready"] == json!(true)).count();
                    ToolResult::ok_with(
                        format!("{ready}/{} features ready to merge", checks.len()),
                        json!({"merge_order": order, "checks": checks}),
                    )
                }
            }
        }
        ServerMode::Remote {
            transport,
            translator,
            sync,
            pi_registry,
            ..
        } => {
            if !sync.is_online().await {
                return ToolResult::fail(
                    "Workstation is offline; merge checks need the repository",
                );
            }
            let Some(id) = feature_id else {
                return ToolResult::fail("feature_id is required for remote merge checks");
            };
            let registry = match pi_registry.get_registry(project) {
                Ok(registry) => registry,
                Err(e) => return ToolResult::fail(e.to_string()),
            };
            let Some(branch) = registry.get_feature(id).and_then(|f| f.branch.clone()) else {
                return ToolResult::fail("Feature has no branch");
            };
            let project_path =
                translator.resolve_for_mac(&registry.project_root().display().to_string());
            let probe = transport.probe_merge(&project_path, &branch).await;
            ToolResult {
                success: probe.success(),
                message: if probe.success() {
                    "No conflicts detected. Ready to merge.".to_string()
                } else {
                    "Merge probe reported conflicts".to_string()
                },
                data: Some(json!({"feature_id": id, "ready": probe.success()})),
            }
        }
    }
}

async fn merge(state: &AppState, args: &serde_json::Value) -> ToolResult {
    let project = match require_str(args, "project") {
        Ok(p) => p,
        Err(e) => return e,
    };
    let feature_id = match require_str(args, "feature_id") {
        Ok(f) => f,
        Err(e) => return e,
    };
    let skip_validation = arg_bool(args, "skip_validation");

    let ServerMode::Local { .. } = &state.mode else {
        return ToolResult::fail(
            "Merging runs on the workstation daemon; the remote surface only checks readiness",
        );
    };

    let mut ctx = match state.project_context(project).await {
        Ok(ctx) => ctx,
        Err(e) => return e,
    };
    let orchestrator = MergeOrchestrator::new(
        &ctx.project_path,
        ctx.config.project.main_branch.clone(),
        ctx.config.project.build_command.clone(),
    );

    let result = orchestrator.merge_feature(&mut ctx.registry, feature_id, !skip_validation, true);
    state.invalidate(&ctx.project_path).await;

    if result.success {
        ToolResult::ok_with(
            result.message.clone(),
            json!({
                "feature_id": feature_id,
                "merged_into": ctx.config.project.main_branch,
            }),
        )
    } else {
        let mut data = json!({
            "feature_id": feature_id,
            "conflict_files": result.conflict_files,
        });
        if result.needs_resolution {
            data["resolution_prompt"] =
                json!(orchestrator.generate_conflict_prompt(&ctx.registry, feature_id));
        }
        if let Some(validation_output) = &result.validation_output {
            data["validation_output"] = json!(validation_output);
        }
        ToolResult::fail_with(result.message, data)
    }
}

async fn add_feature(state: &AppState, args: &serde_json::Value) -> ToolResult {
    let project = match require_str(args, "project") {
        Ok(p) => p,
        Err(e) => return e,
    };
    let title = match require_str(args, "title") {
        Ok(t) => t,
        Err(e) => return e,
    };

    let mut registry = match load_registry(state, project).await {
        Ok(registry) => registry,
        Err(e) => return e,
    };

    // Shipping-machine constraint: a hard cap on planned features.
    if !registry.can_add_planned() {
        let planned_titles = registry.planned_titles();
        return ToolResult::fail_with(
            format!(
                "You have {MAX_PLANNED_FEATURES} planned features. \
                 Finish or delete one first to stay focused!\n\nCurrently planned:\n{}",
                planned_titles
                    .iter()
                    .map(|t| format!("  - {t}"))
                    .collect::<Vec<_>>()
                    .join("\n")
            ),
            json!({
                "constraint": "max_planned_features",
                "limit": MAX_PLANNED_FEATURES,
                "current": registry.count_planned(),
                "planned_titles": planned_titles,
            }),
        );
    }

    let feature_id = generate_id(title);
    if registry.get_feature(&feature_id).is_some() {
        return ToolResult::fail(format!("Feature already exists: {feature_id}"));
    }

    let mut feature = Feature::new(title);
    if let Some(description) = arg_str(args, "description") {
        feature.description = description.to_string();
    }
    if let Some(priority) = args.get("priority").and_then(serde_json::Value::as_u64) {
        feature.priority = priority.min(10) as u8;
    }
    if let Some(complexity) = arg_str(args, "complexity").and_then(Complexity::parse) {
        feature.complexity = complexity;
    }
    if let Some(tags) = args.get("tags").and_then(|t| t.as_array()) {
        feature.tags = tags
            .iter()
            .filter_map(|t| t.as_str().map(ToString::to_string))
            .collect();
    }

    if let Err(e) = registry.add_feature(feature) {
        return ToolResult::fail(format!("Failed to add feature: {e}"));
    }

    // Remote mode: record the mutation for replay against the
    // workstation; drain immediately when it is reachable.
    if let ServerMode::Remote { cache, sync, .. } = &state.mode {
        let payload = json!({
            "title": title,
            "description": arg_str(args, "description").unwrap_or(""),
            "priority": args.get("priority").and_then(serde_json::Value::as_u64).unwrap_or(5),
            "complexity": arg_str(args, "complexity").unwrap_or("medium"),
            "tags": args.get("tags").cloned().unwrap_or_else(|| json!([])),
        });
        match cache
            .queue_operation(project, forge_core::OperationKind::AddFeature, &payload)
            .await
        {
            Ok(_) => {
                let _ = cache.set_sync_pending(project).await;
                if sync.is_online().await {
                    let project_path = registry.project_root().display().to_string();
                    sync.sync_project(project, &project_path).await;
                }
            }
            Err(e) => return ToolResult::fail(format!("Failed to queue operation: {e}")),
        }
    }

    if let ServerMode::Local { .. } = &state.mode {
        if let Ok(ctx) = state.project_context(project).await {
            state.invalidate(&ctx.project_path).await;
        }
    }

    let remaining = MAX_PLANNED_FEATURES - registry.count_planned();
    ToolResult::ok_with(
        format!(
            "Added feature: {title} ({remaining} slot{} remaining)",
            if remaining == 1 { "" } else { "s" }
        ),
        json!({
            "feature_id": feature_id,
            "title": title,
            "status": "planned",
            "planned_count": registry.count_planned(),
            "slots_remaining": remaining,
        }),
    )
}

async fn update_feature(state: &AppState, args: &serde_json::Value) -> ToolResult {
    let project = match require_str(args, "project") {
        Ok(p) => p,
        Err(e) => return e,
    };
    let feature_id = match require_str(args, "feature_id") {
        Ok(f) => f,
        Err(e) => return e,
    };

    let mut patch = FeaturePatch::default();
    if let Some(title) = arg_str(args, "title") {
        patch.title = Some(title.to_string());
    }
    if let Some(description) = arg_str(args, "description") {
        patch.description = Some(description.to_string());
    }
    if let Some(status) = arg_str(args, "status") {
        match FeatureStatus::parse(status) {
            Some(parsed) => patch.status = Some(parsed),
            None => return ToolResult::fail(format!("Invalid status: {status}")),
        }
    }
    if let Some(priority) = args.get("priority").and_then(serde_json::Value::as_u64) {
        patch.priority = Some(priority.min(10) as u8);
    }
    if let Some(complexity) = arg_str(args, "complexity") {
        match Complexity::parse(complexity) {
            Some(parsed) => patch.complexity = Some(parsed),
            None => return ToolResult::fail(format!("Invalid complexity: {complexity}")),
        }
    }
    if let Some(tags) = args.get("tags").and_then(|t| t.as_array()) {
        patch.tags = Some(
            tags.iter()
                .filter_map(|t| t.as_str().map(ToString::to_string))
                .collect(),
        );
    }

    if patch.title.is_none()
        && patch.description.is_none()
        && patch.status.is_none()
        && patch.priority.is_none()
        && patch.complexity.is_none()
        && patch.tags.is_none()
    {
        return ToolResult::fail("No updates provided");
    }

    let mut registry = match load_registry(state, project).await {
        Ok(registry) => registry,
        Err(e) => return e,
    };

    let updated = match registry.update_feature(feature_id, &patch) {
        Ok(updated) => updated,
        Err(e) => return ToolResult::fail(e.to_string()),
    };

    if let ServerMode::Remote { cache, sync, .. } = &state.mode {
        let mut payload = json!({"feature_id": feature_id});
        for key in ["title", "description", "tags", "priority", "complexity"] {
            if let Some(value) = args.get(key) {
                payload[key] = value.clone();
            }
        }
        match cache
            .queue_operation(project, forge_core::OperationKind::UpdateFeature, &payload)
            .await
        {
            Ok(_) => {
                let _ = cache.set_sync_pending(project).await;
                if sync.is_online().await {
                    let project_path = registry.project_root().display().to_string();
                    sync.sync_project(project, &project_path).await;
                }
            }
            Err(e) => return ToolResult::fail(format!("Failed to queue operation: {e}")),
        }
    }

    if let ServerMode::Local { .. } = &state.mode {
        if let Ok(ctx) = state.project_context(project).await {
            state.invalidate(&ctx.project_path).await;
        }
    }

    ToolResult::ok_with(
        format!("Updated feature: {}", updated.title),
        json!({
            "feature_id": feature_id,
            "title": updated.title,
            "status": updated.status,
            "priority": updated.priority,
            "tags": updated.tags,
        }),
    )
}

async fn delete_feature(state: &AppState, args: &serde_json::Value) -> ToolResult {
    let project = match require_str(args, "project") {
        Ok(p) => p,
        Err(e) => return e,
    };
    let feature_id = match require_str(args, "feature_id") {
        Ok(f) => f,
        Err(e) => return e,
    };
    let force = arg_bool(args, "force");

    let mut registry = match load_registry(state, project).await {
        Ok(registry) => registry,
        Err(e) => return e,
    };

    let Some(feature) = registry.get_feature(feature_id).cloned() else {
        return ToolResult::fail(format!("Feature not found: {feature_id}"));
    };

    if let Err(e) = registry.remove_feature(feature_id, force) {
        return ToolResult::fail(e.to_string());
    }

    if let ServerMode::Remote { cache, sync, .. } = &state.mode {
        let payload = json!({"feature_id": feature_id});
        match cache
            .queue_operation(project, forge_core::OperationKind::DeleteFeature, &payload)
            .await
        {
            Ok(_) => {
                let _ = cache.set_sync_pending(project).await;
                if sync.is_online().await {
                    let project_path = registry.project_root().display().to_string();
                    sync.sync_project(project, &project_path).await;
                }
            }
            Err(e) => return ToolResult::fail(format!("Failed to queue operation: {e}")),
        }
    }

    if let ServerMode::Local { .. } = &state.mode {
        if let Ok(ctx) = state.project_context(project).await {
            state.invalidate(&ctx.project_path).await;
        }
    }

    ToolResult::ok_with(
        format!("Deleted feature: {}", feature.title),
        json!({"feature_id": feature_id}),
    )
}
