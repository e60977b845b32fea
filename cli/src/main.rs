// Copyright (c) 2026 Termflux
// SPDX-License-Identifier: AGPL-3.0

//! Termflux daemon entry point.
//!
//! Process-wide resources (container driver, cache pool, database pool,
//! job queue) are initialized once at startup and closed in reverse order
//! on shutdown.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use termflux_core::application::provisioner::WorkspaceProvisioner;
use termflux_core::application::secret_service::SecretService;
use termflux_core::application::terminal_gateway::TerminalGateway;
use termflux_core::application::workflow_engine::{RunJob, WorkflowEngine};
use termflux_core::domain::container::ContainerDriver;
use termflux_core::infrastructure::cache::RedisCache;
use termflux_core::infrastructure::crypto::{EnvelopeCipher, MasterKey};
use termflux_core::infrastructure::db::Database;
use termflux_core::infrastructure::queue::JobQueue;
use termflux_core::infrastructure::repositories::{
    PostgresAppInstallRepository, PostgresAuthTokenRepository, PostgresRunRepository,
    PostgresSecretRepository, PostgresSessionRepository, PostgresWorkflowRepository,
    PostgresWorkspaceRepository,
};
use termflux_core::infrastructure::runtime::DockerDriver;
use termflux_core::presentation::gateway;

#[derive(Parser)]
#[command(name = "termflux", about = "Termflux workspace runtime daemon", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway daemon.
    Serve,
    /// Remove exited managed containers older than the given age.
    Cleanup {
        /// Age threshold in hours.
        #[arg(long, default_value_t = 24)]
        older_than_hours: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = config::Config::from_env()?;

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Cleanup { older_than_hours } => cleanup(config, older_than_hours).await,
    }
}

async fn serve(config: config::Config) -> Result<()> {
    // Startup order: driver, cache, database, then the services on top.
    let docker = DockerDriver::new(config.docker_socket.as_deref())?;
    docker.healthcheck().await?;
    let driver: Arc<dyn ContainerDriver> = Arc::new(docker);

    let cache = Arc::new(RedisCache::connect(&config.redis_url).await?);
    let database = Database::connect(&config.database_url)
        .await
        .context("failed to connect to PostgreSQL")?;
    let pool = database.pool().clone();

    let workspaces = Arc::new(PostgresWorkspaceRepository::new(pool.clone()));
    let sessions = Arc::new(PostgresSessionRepository::new(pool.clone()));
    let workflows = Arc::new(PostgresWorkflowRepository::new(pool.clone()));
    let runs = Arc::new(PostgresRunRepository::new(pool.clone()));
    let secrets_repo = Arc::new(PostgresSecretRepository::new(pool.clone()));
    let auth_tokens = Arc::new(PostgresAuthTokenRepository::new(pool.clone()));
    let app_installs = Arc::new(PostgresAppInstallRepository::new(pool));

    let cipher = EnvelopeCipher::new(MasterKey::new(config.master_key.clone())?);
    let secrets = Arc::new(SecretService::new(secrets_repo, cipher, Arc::clone(&driver)));

    // Handed to the HTTP management surface, which lives outside this crate.
    let _provisioner = Arc::new(WorkspaceProvisioner::new(
        Arc::clone(&driver),
        cache.clone(),
        workspaces.clone(),
        sessions.clone(),
        app_installs,
        Arc::clone(&secrets),
        config.workspace_image.clone(),
    ));

    let queue: Arc<JobQueue<RunJob>> = Arc::new(JobQueue::new());
    let engine = Arc::new(WorkflowEngine::new(
        Arc::clone(&driver),
        workflows,
        runs,
        Arc::clone(&queue),
        Some(Arc::clone(&secrets)),
    ));
    let workers = engine.spawn_workers();

    let terminal_gateway = Arc::new(TerminalGateway::new(
        Arc::clone(&driver),
        cache,
        sessions,
        workspaces,
        auth_tokens,
    ));
    let app = gateway::router(terminal_gateway);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "Termflux gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Shutdown in reverse order of startup.
    info!("Shutting down");
    workers.abort();
    database.close().await;
    Ok(())
}

async fn cleanup(config: config::Config, older_than_hours: i64) -> Result<()> {
    let driver = DockerDriver::new(config.docker_socket.as_deref())?;
    driver.healthcheck().await?;
    let removed = driver.cleanup(older_than_hours * 3600).await?;
    info!(removed, "Removed stale workspace containers");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}
