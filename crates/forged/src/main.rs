//! forged - FlowForge orchestrator daemon.
//!
//! Binary entry point: flag parsing, tracing setup, graceful shutdown.

use std::path::PathBuf;

use clap::Parser;
use forged::{Daemon, DaemonConfig};
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(
    name = "forged",
    about = "FlowForge parallel development orchestrator daemon"
)]
struct Args {
    /// RPC port (localhost only).
    #[arg(long, default_value_t = 8347)]
    port: u16,

    /// Directory containing FlowForge projects.
    #[arg(long, env = "FORGE_PROJECTS_PATH")]
    projects_base: Option<PathBuf>,

    /// Cache database path (remote mode).
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Maximum concurrently running assistant processes.
    #[arg(long, default_value_t = forged::executor::DEFAULT_MAX_CONCURRENT)]
    max_concurrent: usize,

    /// Workstation SSH host; enables remote mode together with --ssh-user.
    #[arg(long)]
    ssh_host: Option<String>,

    /// Workstation SSH user.
    #[arg(long)]
    ssh_user: Option<String>,
}

fn main() {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let defaults = DaemonConfig::default();
    let config = DaemonConfig {
        port: args.port,
        projects_base: args.projects_base.unwrap_or(defaults.projects_base),
        db_path: args.db_path.unwrap_or(defaults.db_path),
        max_concurrent: args.max_concurrent,
        ssh_host: args.ssh_host,
        ssh_user: args.ssh_user,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    runtime.block_on(async {
        match Daemon::new(config).await {
            Ok(daemon) => {
                let daemon_ref = &daemon;
                tokio::select! {
                    result = daemon.run() => {
                        if let Err(e) = result {
                            error!("daemon error: {e}");
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("received SIGINT");
                        daemon_ref.shutdown();
                    }
                }
            }
            Err(e) => {
                error!("failed to initialize daemon: {e}");
                std::process::exit(1);
            }
        }
    });
}
