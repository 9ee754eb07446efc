//! Campaign driver routes.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::post,
};
use map_core::types::ProposedExperiment;
use std::sync::Arc;

use crate::error::ApiResult;
use crate::services::CampaignAction;
use crate::state::AppState;

/// Create campaign router
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/campaigns/{campaign}/run", post(run_campaign))
        .route(
            "/campaigns/{campaign}/experiments/random",
            post(propose_random),
        )
}

/// Advance a campaign one step
pub async fn run_campaign(
    State(state): State<Arc<AppState>>,
    Path(campaign): Path<String>,
) -> ApiResult<Json<CampaignAction>> {
    Ok(Json(state.campaigns.run(&campaign)?))
}

/// Propose an experiment with random inputs
pub async fn propose_random(
    State(state): State<Arc<AppState>>,
    Path(campaign): Path<String>,
) -> ApiResult<(StatusCode, Json<ProposedExperiment>)> {
    let created = state.campaigns.propose_random(&campaign)?;
    Ok((StatusCode::CREATED, Json(created)))
}
