//! Facility-facing experiment routes: status notifications and measured
//! values, plus a read-only experiment view.

use axum::{
    Extension, Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    routing::{get, post, put},
};
use map_core::auth::AuthContext;
use map_core::types::{
    ExperimentDetail, InputDetail, OutputDetail, OutputPayload, StatusResponse, StatusUpdate,
    ValuePayload,
};
use std::sync::Arc;
use tracing::info;

use crate::error::ApiResult;
use crate::state::AppState;

/// Create experiment router
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/experiments/{campaign}/{experiment}", get(get_experiment))
        .route(
            "/experiments/{campaign}/{experiment}/status",
            post(update_experiment_status),
        )
        .route(
            "/experiments/{campaign}/{experiment}/stages/{stage}/status",
            post(update_stage_status),
        )
        .route(
            "/experiments/{campaign}/{experiment}/inputs/{input}",
            put(set_input_value),
        )
        .route(
            "/experiments/{campaign}/{experiment}/outputs",
            post(record_outputs).put(record_outputs),
        )
        .route(
            "/experiments/{campaign}/{experiment}/outputs/{output}",
            put(set_output_value),
        )
}

/// Experiment status notification
pub async fn update_experiment_status(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((campaign, experiment)): Path<(String, String)>,
    body: Result<Json<StatusUpdate>, JsonRejection>,
) -> ApiResult<Json<StatusResponse>> {
    let Json(update) = body?;
    info!(
        principal = %auth.principal(),
        campaign = %campaign,
        experiment = %experiment,
        status = %update.status,
        "Experiment status notification"
    );
    let updated = state
        .status
        .update_experiment(&campaign, &experiment, &update)?;
    Ok(Json(StatusResponse::from(&updated)))
}

/// Stage status notification
pub async fn update_stage_status(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((campaign, experiment, stage)): Path<(String, String, String)>,
    body: Result<Json<StatusUpdate>, JsonRejection>,
) -> ApiResult<Json<StatusResponse>> {
    let Json(update) = body?;
    info!(
        principal = %auth.principal(),
        campaign = %campaign,
        experiment = %experiment,
        stage = %stage,
        status = %update.status,
        "Stage status notification"
    );
    let updated = state
        .status
        .update_stage(&campaign, &experiment, &stage, &update)?;
    Ok(Json(StatusResponse::from(&updated)))
}

/// Set the measured value of an input
pub async fn set_input_value(
    State(state): State<Arc<AppState>>,
    Path((campaign, experiment, input)): Path<(String, String, String)>,
    body: Result<Json<ValuePayload>, JsonRejection>,
) -> ApiResult<Json<InputDetail>> {
    let Json(payload) = body?;
    let exp = state.db.require_experiment(&campaign, &experiment)?;
    let row = state.db.set_input_actual(exp.id, &input, payload.value)?;
    Ok(Json(InputDetail {
        name: row.name,
        value_request: row.value_request,
        value_actual: row.value_actual,
    }))
}

/// Record one or more output values
pub async fn record_outputs(
    State(state): State<Arc<AppState>>,
    Path((campaign, experiment)): Path<(String, String)>,
    body: Result<Json<OutputPayload>, JsonRejection>,
) -> ApiResult<Json<Vec<OutputDetail>>> {
    let Json(payload) = body?;
    let entries: Vec<(String, f64)> = payload
        .into_entries()
        .into_iter()
        .map(|entry| (entry.name, entry.value))
        .collect();

    let exp = state.db.require_experiment(&campaign, &experiment)?;
    let rows = state.db.record_outputs(exp.id, &entries)?;
    Ok(Json(
        rows.into_iter()
            .map(|row| OutputDetail {
                name: row.name,
                value: row.value,
            })
            .collect(),
    ))
}

/// Set a single output value by name
pub async fn set_output_value(
    State(state): State<Arc<AppState>>,
    Path((campaign, experiment, output)): Path<(String, String, String)>,
    body: Result<Json<ValuePayload>, JsonRejection>,
) -> ApiResult<Json<OutputDetail>> {
    let Json(payload) = body?;
    let exp = state.db.require_experiment(&campaign, &experiment)?;
    let rows = state
        .db
        .record_outputs(exp.id, &[(output.clone(), payload.value)])?;
    let row = rows
        .into_iter()
        .find(|row| row.name == output)
        .ok_or_else(|| map_core::Error::not_found("Output", output))?;
    Ok(Json(OutputDetail {
        name: row.name,
        value: row.value,
    }))
}

/// Full experiment view
pub async fn get_experiment(
    State(state): State<Arc<AppState>>,
    Path((campaign, experiment)): Path<(String, String)>,
) -> ApiResult<Json<ExperimentDetail>> {
    let exp = state.db.require_experiment(&campaign, &experiment)?;
    let facility = match exp.facility_id {
        Some(id) => state.db.get_facility(id)?.map(|f| f.name),
        None => None,
    };
    let stages = state.db.list_stages(exp.id)?;
    let inputs = state.db.list_input_values(exp.id)?;
    let outputs = state.db.list_output_values(exp.id)?;

    Ok(Json(ExperimentDetail::assemble(
        &campaign, &exp, facility, &stages, &inputs, &outputs,
    )))
}
