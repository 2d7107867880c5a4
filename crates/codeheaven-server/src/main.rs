//! codeheaven-server binary
//!
//! Runs the execution gateway against the local Docker daemon.

use anyhow::{Context, Result};
use clap::Parser;
use codeheaven_core::{ConfigLoader, DockerEngine, SandboxExecutor};
use codeheaven_server::{shutdown_signal, CodeHeavenServer, ServerConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "codeheaven-server")]
#[command(about = "Sandboxed code execution service for the CodeHeaven editor")]
#[command(version)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "codeheaven.yaml")]
    config: PathBuf,

    /// Override the bind address from the configuration
    #[arg(short, long)]
    bind: Option<String>,

    /// Disable CORS
    #[arg(long)]
    no_cors: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    let config = ConfigLoader::from_file_or_default(&args.config)
        .await
        .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?;
    let registry = config.registry()?;

    let mut server_config = ServerConfig::from_settings(&config.server)?;
    if let Some(bind) = &args.bind {
        let addr: SocketAddr = bind
            .parse()
            .with_context(|| format!("Invalid bind address '{}'", bind))?;
        server_config = server_config.with_bind_addr(addr);
    }
    if args.no_cors {
        server_config = server_config.with_cors(false);
    }

    let engine = DockerEngine::connect(&config.docker).with_context(|| {
        format!(
            "Failed to connect to Docker at {}",
            config.docker.socket_path.display()
        )
    })?;
    if let Err(e) = engine.ping().await {
        log::warn!(
            "Docker daemon did not answer a ping ({}); executions will fail until it is reachable",
            e
        );
    }

    let executor = SandboxExecutor::new(Arc::new(engine), config.limits.clone())
        .with_prune_on_failure(config.docker.prune_on_failure);

    log::info!("Configuration:");
    log::info!("  Bind address: {}", server_config.bind_addr);
    log::info!("  CORS enabled: {}", server_config.enable_cors);
    log::info!("  Docker socket: {}", config.docker.socket_path.display());
    log::info!(
        "  Limits: {} MiB memory, {}/{} CPU quota, {} pids",
        config.limits.memory_mb,
        config.limits.cpu_quota,
        config.limits.cpu_period,
        config.limits.pids_limit
    );
    for profile in registry.profiles() {
        log::info!(
            "  {}: {} ({} ms)",
            profile.language,
            profile.image,
            profile.timeout_ms()
        );
    }

    let server = CodeHeavenServer::new(registry, executor, server_config);
    server.serve_with_shutdown(shutdown_signal()).await?;

    Ok(())
}
