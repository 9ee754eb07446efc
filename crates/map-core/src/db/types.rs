//! Database types for map-core.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::status::{ExperimentStatus, MlModelStatus, StageStatus, StatusGroup, Tracked};

// ─────────────────────────────────────────────────────────────────────────────
// Definition Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapDefinition {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapStage {
    pub id: i64,
    pub map_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapInput {
    pub id: i64,
    pub map_id: i64,
    pub name: String,
    pub min_val: f64,
    pub max_val: f64,
    pub for_stage: Option<i64>,
    pub units: Option<String>,
}

impl MapInput {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min_val && value <= self.max_val
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapOutput {
    pub id: i64,
    pub map_id: i64,
    pub name: String,
    pub from_stage: Option<i64>,
    pub units: Option<String>,
}

/// A remote facility implementing a MAP. `location` is its API base URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Facility {
    pub id: i64,
    pub map_id: i64,
    pub name: String,
    pub location: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlFacility {
    pub id: i64,
    pub name: String,
    pub location: String,
    pub train_script: String,
    pub probe_script: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: i64,
    pub name: String,
    pub map_id: i64,
    pub max_experiments: i64,
    pub ml_facility_id: Option<i64>,
    pub ml_model_status: MlModelStatus,
    pub goal: Option<String>,
    pub uid_node: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Experiment Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: i64,
    pub campaign_id: i64,
    pub name: String,
    pub status: ExperimentStatus,
    pub facility_id: Option<i64>,
    pub facility_expid: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl Experiment {
    pub fn is_placed(&self) -> bool {
        self.facility_id.is_some()
    }
}

/// Stage instance; `name` is joined from its template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub id: i64,
    pub experiment_id: i64,
    pub map_stage_id: i64,
    pub name: String,
    pub status: StageStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputValue {
    pub id: i64,
    pub experiment_id: i64,
    pub input_id: i64,
    pub name: String,
    pub for_stage: Option<i64>,
    pub value_request: f64,
    pub value_actual: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputValue {
    pub id: i64,
    pub experiment_id: i64,
    pub output_id: i64,
    pub name: String,
    pub from_stage: Option<i64>,
    pub value: Option<f64>,
}

/// Values still waiting on a measurement
#[derive(Debug, Clone, Default)]
pub struct PendingValues {
    pub inputs: Vec<InputValue>,
    pub outputs: Vec<OutputValue>,
}

impl PendingValues {
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty() && self.outputs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inputs.len() + self.outputs.len()
    }
}

impl Tracked for Experiment {
    type Status = ExperimentStatus;

    fn status(&self) -> ExperimentStatus {
        self.status
    }
    fn set_status(&mut self, status: ExperimentStatus) {
        self.status = status;
    }
    fn start_time_mut(&mut self) -> &mut Option<DateTime<Utc>> {
        &mut self.start_time
    }
    fn end_time_mut(&mut self) -> &mut Option<DateTime<Utc>> {
        &mut self.end_time
    }
}

impl Tracked for Stage {
    type Status = StageStatus;

    fn status(&self) -> StageStatus {
        self.status
    }
    fn set_status(&mut self, status: StageStatus) {
        self.status = status;
    }
    fn start_time_mut(&mut self) -> &mut Option<DateTime<Utc>> {
        &mut self.start_time
    }
    fn end_time_mut(&mut self) -> &mut Option<DateTime<Utc>> {
        &mut self.end_time
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Input Types (for creating entities)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NewMapInput {
    pub map_id: i64,
    pub name: String,
    pub min_val: f64,
    pub max_val: f64,
    pub for_stage: Option<i64>,
    pub units: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewMapOutput {
    pub map_id: i64,
    pub name: String,
    pub from_stage: Option<i64>,
    pub units: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewMlFacility {
    pub name: String,
    pub location: String,
    pub train_script: String,
    pub probe_script: String,
}

#[derive(Debug, Clone)]
pub struct NewCampaign {
    pub name: String,
    pub map_id: i64,
    pub max_experiments: i64,
    pub ml_facility_id: Option<i64>,
    pub goal: Option<String>,
}

/// Experiment to create with its requested input values (by template id).
///
/// Stages and output placeholders are fanned out from the campaign's MAP.
#[derive(Debug, Clone)]
pub struct NewExperiment {
    pub campaign_id: i64,
    pub name: String,
    pub inputs: Vec<(i64, f64)>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Column Conversions
// ─────────────────────────────────────────────────────────────────────────────

macro_rules! sql_status {
    ($($ty:ty),*) => {
        $(
            impl ToSql for $ty {
                fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                    Ok(ToSqlOutput::from(self.code()))
                }
            }

            impl FromSql for $ty {
                fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                    let code = value.as_str()?;
                    <$ty>::from_code(code).ok_or_else(|| {
                        FromSqlError::Other(format!("unknown status code '{}'", code).into())
                    })
                }
            }
        )*
    };
}

sql_status!(ExperimentStatus, StageStatus, MlModelStatus);

/// Timestamps are stored as epoch milliseconds.
pub(crate) fn to_millis(time: Option<DateTime<Utc>>) -> Option<i64> {
    time.map(|t| t.timestamp_millis())
}

pub(crate) fn from_millis(millis: Option<i64>) -> Option<DateTime<Utc>> {
    millis.and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}
