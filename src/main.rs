//! code-runner
//!
//! Executes submitted programs and returns their output. Serves HTTP by
//! default; `--stdio` speaks MCP instead.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use code_runner::backend::LocalRunner;
use code_runner::config::Config;
use code_runner::{http, mcp, JobCoordinator};

/// How long running jobs get to clean up after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "code-runner")]
#[command(about = "Compile and run untrusted programs in per-job workspaces")]
struct Args {
    /// Run in stdio mode (for MCP clients)
    #[arg(long)]
    stdio: bool,

    /// HTTP listen address, overriding the configuration
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Path to a JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // stderr keeps stdout free for the MCP protocol
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config =
        Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    info!(
        sandbox_root = %config.sandbox_root.display(),
        max_concurrent_jobs = config.admission.max_concurrent_jobs,
        policy = ?config.admission.policy,
        "Loaded configuration"
    );

    let coordinator = JobCoordinator::new(&config, LocalRunner::new())?;

    let swept = coordinator
        .allocator()
        .sweep_stale(config.stale_workspace_age())
        .await;
    if swept > 0 {
        info!(count = swept, "Removed stale workspaces");
    }

    let serve = async {
        if args.stdio {
            mcp::serve_stdio(coordinator.clone()).await
        } else {
            http::serve_http(config.listen, coordinator.clone(), config.max_source_bytes).await
        }
    };

    let served = tokio::select! {
        result = serve => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    };

    // Kill and reap every job before the runtime goes away.
    coordinator.shutdown(SHUTDOWN_GRACE).await;
    served
}
