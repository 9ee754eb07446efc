//! Application state.

use map_core::auth::TokenRegistry;
use map_core::tasks::Scheduler;
use map_core::Database;
use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::services::{CampaignService, StatusService, TaskMetrics};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Server configuration
    pub config: Arc<Config>,
    /// Database connection
    pub db: Arc<Database>,
    /// Accepted API credentials
    pub tokens: Arc<TokenRegistry>,
    /// Status notifications from facilities
    pub status: Arc<StatusService>,
    /// Campaign loop and ML callbacks
    pub campaigns: Arc<CampaignService>,
    /// Task engine counters
    pub metrics: Arc<TaskMetrics>,
    /// Server start time
    pub start_time: Instant,
}

impl AppState {
    /// Create new application state
    pub fn new(
        config: Config,
        db: Arc<Database>,
        tokens: TokenRegistry,
        scheduler: Arc<dyn Scheduler>,
        campaigns: Arc<CampaignService>,
        metrics: Arc<TaskMetrics>,
    ) -> Arc<Self> {
        let status = StatusService::new(
            Arc::clone(&db),
            scheduler,
            config.monitoring.clone(),
        );
        Arc::new(Self {
            config: Arc::new(config),
            status: Arc::new(status),
            db,
            tokens: Arc::new(tokens),
            campaigns,
            metrics,
            start_time: Instant::now(),
        })
    }
}
