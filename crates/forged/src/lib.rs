//! forged - FlowForge orchestrator daemon.
//!
//! Library components for the daemon process: the SSH transport, worktree
//! manager, parallel executor, merge orchestrator, offline cache, sync
//! engine, pi-local registry store, chat bridge, and the RPC surface that
//! ties them together.

pub mod cache;
pub mod chat;
pub mod executor;
pub mod merge;
pub mod pi_registry;
pub mod server;
pub mod sync;
pub mod transport;
pub mod worktree;

use std::path::PathBuf;
use std::sync::Arc;

use forge_core::PathTranslator;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::CacheManager;
use crate::executor::{ExecutorConfig, ParallelExecutor, SshTarget};
use crate::pi_registry::PiRegistryManager;
use crate::server::{AppState, ServerMode};
use crate::sync::SyncEngine;
use crate::transport::SshTransport;

/// Application-level errors with context.
pub type AppResult<T> = eyre::Result<T>;

/// Daemon configuration, from CLI flags and environment.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// RPC port.
    pub port: u16,
    /// Directory containing FlowForge projects (local mode), or the
    /// workstation projects directory (remote mode).
    pub projects_base: PathBuf,
    /// Cache database path (remote mode).
    pub db_path: PathBuf,
    /// Executor concurrency cap.
    pub max_concurrent: usize,
    /// Workstation SSH host; set together with `ssh_user` for remote mode.
    pub ssh_host: Option<String>,
    pub ssh_user: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: 8347,
            projects_base: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("Projects"),
            db_path: CacheManager::default_db_path(),
            max_concurrent: executor::DEFAULT_MAX_CONCURRENT,
            ssh_host: None,
            ssh_user: None,
        }
    }
}

/// Daemon state: the RPC surface plus background machinery.
pub struct Daemon {
    config: DaemonConfig,
    state: Arc<AppState>,
    sync: Option<Arc<SyncEngine>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Daemon {
    /// Wire up the daemon. Remote mode is selected when an SSH target is
    /// configured; otherwise every tool runs against the local filesystem.
    pub async fn new(config: DaemonConfig) -> AppResult<Self> {
        let ssh_target = match (&config.ssh_host, &config.ssh_user) {
            (Some(host), Some(user)) => Some(SshTarget {
                host: host.clone(),
                user: user.clone(),
            }),
            _ => None,
        };

        let executor = ParallelExecutor::new(ExecutorConfig {
            max_concurrent: config.max_concurrent,
            ssh: ssh_target.clone(),
            ..ExecutorConfig::default()
        });

        // Mirror executor progress into the daemon log.
        let mut events = executor.subscribe();
        tokio::spawn(async move {
            while let Ok(progress) = events.recv().await {
                if progress.output_chunk.is_none() {
                    info!(
                        feature_id = %progress.feature_id,
                        status = progress.status.as_str(),
                        "{}", progress.message
                    );
                }
            }
        });

        let (mode, sync) = match ssh_target {
            Some(target) => {
                let transport = SshTransport::new(target.host, target.user);
                let translator = PathTranslator::from_env();
                let cache = Arc::new(CacheManager::new(&config.db_path).await?);
                let sync = SyncEngine::new(transport.clone(), Arc::clone(&cache));
                sync.on_status_change(|online| {
                    info!(online, "workstation status changed");
                });

                let mode = ServerMode::Remote {
                    transport,
                    translator,
                    projects_base: config.projects_base.display().to_string(),
                    cache,
                    sync: Arc::clone(&sync),
                    pi_registry: PiRegistryManager::from_env(),
                };
                (mode, Some(sync))
            }
            None => (
                ServerMode::Local {
                    projects_base: config.projects_base.clone(),
                },
                None,
            ),
        };

        Ok(Self {
            config,
            state: Arc::new(AppState::new(mode, executor)),
            sync,
            shutdown: CancellationToken::new(),
        })
    }

    /// Run until shutdown: background sync tasks plus the RPC server.
    pub async fn run(&self) -> AppResult<()> {
        if let Some(sync) = &self.sync {
            sync.start_background_tasks();
            // Establish reachability before the first sync tick.
            sync.check_health().await;
        }

        let state = Arc::clone(&self.state);
        let port = self.config.port;
        tokio::select! {
            result = server::start_server(state, port) => {
                result.map_err(|e| eyre::eyre!("server error: {e}"))
            }
            () = self.shutdown.cancelled() => Ok(()),
        }
    }

    pub fn shutdown(&self) {
        if let Some(sync) = &self.sync {
            sync.stop_background_tasks();
        }
        self.shutdown.cancel();
    }

    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }
}
