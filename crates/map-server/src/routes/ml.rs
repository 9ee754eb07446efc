//! Callbacks from the ML advisor.

use axum::{
    Extension, Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    routing::post,
};
use map_core::auth::AuthContext;
use map_core::types::{Proposal, ProposedExperiment};
use std::sync::Arc;
use tracing::info;

use crate::error::ApiResult;
use crate::services::CampaignAction;
use crate::state::AppState;

/// Create ML callback router
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ml/{campaign}/trained", post(model_trained))
        .route("/ml/{campaign}/failed", post(model_failed))
        .route("/ml/{campaign}/propose", post(propose_experiment))
}

/// Training finished
pub async fn model_trained(
    State(state): State<Arc<AppState>>,
    Path(campaign): Path<String>,
) -> ApiResult<Json<CampaignAction>> {
    Ok(Json(state.campaigns.ml_trained(&campaign)?))
}

/// Training failed
pub async fn model_failed(
    State(state): State<Arc<AppState>>,
    Path(campaign): Path<String>,
) -> ApiResult<Json<CampaignAction>> {
    Ok(Json(state.campaigns.ml_failed(&campaign)?))
}

/// Advisor proposes the next experiment
pub async fn propose_experiment(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(campaign): Path<String>,
    body: Result<Json<Proposal>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<ProposedExperiment>)> {
    let Json(proposal) = body?;
    info!(
        principal = %auth.principal(),
        campaign = %campaign,
        mode = %proposal.mode,
        inputs = proposal.inputs.len(),
        "Experiment proposal received"
    );
    let created = state.campaigns.propose(&campaign, &proposal)?;
    Ok((StatusCode::CREATED, Json(created)))
}
