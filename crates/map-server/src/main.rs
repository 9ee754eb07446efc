//! map-server - MAP experiment orchestrator
//!
//! Receives status and measurement callbacks from facilities, places
//! proposed experiments, watches running ones and drives the campaign /
//! ML advisor loop.

use clap::Parser;
use map_core::Database;
use map_core::auth::{ServiceToken, TokenRegistry};
use map_core::client::HttpFacilityClient;
use map_core::ml::HttpMlAdvisor;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod config;
mod error;
mod middleware;
mod routes;
mod services;
mod state;
#[cfg(test)]
mod testing;

use services::{
    CampaignService, MonitorService, PlacementService, TaskMetrics, TaskRunner, WorkerPool,
};

#[derive(Parser)]
#[command(name = "map-server", version, about = "MAP experiment orchestrator")]
struct Cli {
    /// Config file (defaults to $MAP_CONFIG or ~/.map-orchestrator/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load(cli.config)?;

    // Initialize logging
    let filter = EnvFilter::from_default_env().add_directive("map_server=info".parse()?);
    if config.server.json_logs {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    info!("map-server v{}", env!("CARGO_PKG_VERSION"));
    info!("Config loaded from {:?}", config.config_path);

    if let Some(parent) = config.database.path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Arc::new(Database::open_path(&config.database.path)?);
    info!(path = %config.database.path.display(), "Database ready");

    let service_token = ServiceToken::load_or_generate(&config.auth.token_file)?;
    info!(token_file = %config.auth.token_file.display(), "Service token loaded");
    let tokens = config
        .auth
        .facility_tokens
        .iter()
        .fold(TokenRegistry::new(service_token), |registry, (name, token)| {
            registry.with_facility(name.as_str(), token)
        });

    let mut facility_client = HttpFacilityClient::new(config.http.timeout())?;
    if let Some(token) = &config.http.facility_token {
        facility_client = facility_client.with_token(token.as_str());
    }
    let facilities = Arc::new(facility_client);
    let advisor = Arc::new(HttpMlAdvisor::new(config.http.timeout())?);

    let pool = Arc::new(WorkerPool::new(Arc::new(TaskMetrics::new())));
    let campaigns = Arc::new(CampaignService::new(
        db.clone(),
        pool.clone(),
        advisor,
        config.ml.callback_url.clone(),
    ));
    let runner = Arc::new(TaskRunner::new(
        Arc::new(MonitorService::new(db.clone(), facilities.clone())),
        Arc::new(PlacementService::new(db.clone(), facilities)),
        campaigns.clone(),
        pool.clone(),
        config.scheduler.retry_policy(),
        pool.metrics(),
    ));
    pool.start(runner, config.scheduler.workers);

    let listen = config.server.listen.clone();
    let metrics = pool.metrics();
    let state = state::AppState::new(config, db, tokens, pool, campaigns, metrics);
    let app = routes::create_router(state);

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!(listen = %listen, "Server ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down...");
        })
        .await?;

    Ok(())
}
