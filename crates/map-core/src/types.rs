//! Wire types shared by the orchestrator API and its clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{Experiment, InputValue, OutputValue, Stage};
use crate::status::{ExperimentStatus, StageStatus, StatusGroup};

// ─────────────────────────────────────────────────────────────────────────────
// Status Updates
// ─────────────────────────────────────────────────────────────────────────────

/// Incoming status notification. `status` may be a code or a label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
}

/// Canonical status representation returned after an update
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    pub label: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl From<&Experiment> for StatusResponse {
    fn from(exp: &Experiment) -> Self {
        Self {
            status: exp.status.code().to_string(),
            label: exp.status.label().to_string(),
            start_time: exp.start_time,
            end_time: exp.end_time,
        }
    }
}

impl From<&Stage> for StatusResponse {
    fn from(stage: &Stage) -> Self {
        Self {
            status: stage.status.code().to_string(),
            label: stage.status.label().to_string(),
            start_time: stage.start_time,
            end_time: stage.end_time,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Measured Values
// ─────────────────────────────────────────────────────────────────────────────

/// Body of a single-value PUT
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValuePayload {
    pub value: f64,
}

/// A named output measurement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputEntry {
    pub name: String,
    pub value: f64,
}

/// Outputs POST body: one entry or a list of them
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputPayload {
    Many(Vec<OutputEntry>),
    One(OutputEntry),
}

impl OutputPayload {
    pub fn into_entries(self) -> Vec<OutputEntry> {
        match self {
            OutputPayload::Many(entries) => entries,
            OutputPayload::One(entry) => vec![entry],
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Proposals
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalInput {
    pub name: String,
    pub value: f64,
}

/// Experiment proposal sent by the ML advisor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub mode: String,
    pub inputs: Vec<ProposalInput>,
}

/// Identity of a newly proposed experiment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedExperiment {
    pub campaign_name: String,
    pub experiment_name: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Experiment Detail
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDetail {
    pub name: String,
    pub status: StageStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputDetail {
    pub name: String,
    pub value_request: f64,
    pub value_actual: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputDetail {
    pub name: String,
    pub value: Option<f64>,
}

/// Full view of one experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentDetail {
    pub campaign: String,
    pub name: String,
    pub status: ExperimentStatus,
    pub facility: Option<String>,
    pub facility_expid: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub stages: Vec<StageDetail>,
    pub inputs: Vec<InputDetail>,
    pub outputs: Vec<OutputDetail>,
}

impl ExperimentDetail {
    pub fn assemble(
        campaign: &str,
        experiment: &Experiment,
        facility: Option<String>,
        stages: &[Stage],
        inputs: &[InputValue],
        outputs: &[OutputValue],
    ) -> Self {
        Self {
            campaign: campaign.to_string(),
            name: experiment.name.clone(),
            status: experiment.status,
            facility,
            facility_expid: experiment.facility_expid.clone(),
            start_time: experiment.start_time,
            end_time: experiment.end_time,
            stages: stages
                .iter()
                .map(|s| StageDetail {
                    name: s.name.clone(),
                    status: s.status,
                    start_time: s.start_time,
                    end_time: s.end_time,
                })
                .collect(),
            inputs: inputs
                .iter()
                .map(|i| InputDetail {
                    name: i.name.clone(),
                    value_request: i.value_request,
                    value_actual: i.value_actual,
                })
                .collect(),
            outputs: outputs
                .iter()
                .map(|o| OutputDetail {
                    name: o.name.clone(),
                    value: o.value,
                })
                .collect(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Identifiers
// ─────────────────────────────────────────────────────────────────────────────

/// Generate a campaign model identifier.
///
/// Six random bytes rendered as twelve hex characters, with the low nibble
/// of the first byte forced to `0x7`.
pub fn generate_uid_node() -> String {
    let mut bytes: [u8; 6] = rand::random();
    bytes[0] = (bytes[0] & 0xF0) | 0x07;
    hex::encode(bytes)
}

/// Name for the next proposed experiment of `mode`, given existing names.
pub fn next_experiment_name<'a>(mode: &str, existing: impl IntoIterator<Item = &'a str>) -> String {
    let prefix = format!("Experiment - {} ", mode);
    let highest = existing
        .into_iter()
        .filter_map(|name| name.strip_prefix(&prefix))
        .filter_map(|suffix| suffix.parse::<u32>().ok())
        .max()
        .unwrap_or(0);
    format!("{}{}", prefix, highest + 1)
}
