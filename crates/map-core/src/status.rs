//! Status model for experiments, stages and campaign ML models.
//!
//! Every status group is an enum with a fixed lookup table of
//! `(variant, code, label)` rows. A status string coming over the wire may be
//! either the one-letter code or the human-readable label; [`StatusGroup::resolve`]
//! maps both to the canonical variant.
//!
//! Experiments and stages additionally carry `start_time`/`end_time`. The
//! rules for setting those live in [`LifecycleStatus`] and are applied by a
//! single generic [`apply_status`] for any [`Tracked`] entity:
//!
//! ```text
//!   {Proposed, NotStarted}                    ──► Running    sets start_time
//!   {Proposed, NotStarted, Running, Suspended} ──► Completed  sets end_time
//! ```
//!
//! A timestamp that is already set is never rewritten.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// A closed set of statuses with a bidirectional code/label table.
pub trait StatusGroup: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    /// Lookup table: variant, canonical code, display label.
    const CHOICES: &'static [(Self, &'static str, &'static str)];

    /// Canonical one-letter code
    fn code(self) -> &'static str {
        Self::CHOICES
            .iter()
            .find(|(status, _, _)| *status == self)
            .map(|(_, code, _)| *code)
            .unwrap_or("?")
    }

    /// Human-readable label
    fn label(self) -> &'static str {
        Self::CHOICES
            .iter()
            .find(|(status, _, _)| *status == self)
            .map(|(_, _, label)| *label)
            .unwrap_or("Unknown")
    }

    /// Parse a stored code
    fn from_code(code: &str) -> Option<Self> {
        Self::CHOICES
            .iter()
            .find(|(_, c, _)| *c == code)
            .map(|(status, _, _)| *status)
    }

    /// Resolve either a code or a label to the canonical status.
    fn resolve(value: &str) -> Result<Self> {
        Self::CHOICES
            .iter()
            .find(|(_, code, label)| *code == value || *label == value)
            .map(|(status, _, _)| *status)
            .ok_or_else(|| Error::InvalidChoice {
                value: value.to_string(),
            })
    }
}

/// Status groups whose entities track start/end timestamps.
pub trait LifecycleStatus: StatusGroup {
    const RUNNING: Self;
    const COMPLETED: Self;
    /// Statuses from which entering `RUNNING` sets `start_time`
    const STARTS_FROM: &'static [Self];
    /// Statuses from which entering `COMPLETED` sets `end_time`
    const ENDS_FROM: &'static [Self];

    fn starts_clock(from: Self, to: Self) -> bool {
        to == Self::RUNNING && Self::STARTS_FROM.contains(&from)
    }

    fn stops_clock(from: Self, to: Self) -> bool {
        to == Self::COMPLETED && Self::ENDS_FROM.contains(&from)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Status Groups
// ─────────────────────────────────────────────────────────────────────────────

/// Experiment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExperimentStatus {
    #[serde(rename = "P")]
    Proposed,
    #[serde(rename = "Q")]
    NotStarted,
    #[serde(rename = "R")]
    Running,
    #[serde(rename = "C")]
    Completed,
    #[serde(rename = "T")]
    TerminatedEarly,
    #[serde(rename = "H")]
    Suspended,
    #[serde(rename = "X")]
    HardReject,
    #[serde(rename = "Z")]
    SoftReject,
}

impl StatusGroup for ExperimentStatus {
    const CHOICES: &'static [(Self, &'static str, &'static str)] = &[
        (Self::Proposed, "P", "Proposed"),
        (Self::NotStarted, "Q", "Not Started"),
        (Self::Running, "R", "Running"),
        (Self::Completed, "C", "Completed"),
        (Self::TerminatedEarly, "T", "Terminated Early"),
        (Self::Suspended, "H", "Suspended"),
        (Self::HardReject, "X", "Hard Reject"),
        (Self::SoftReject, "Z", "Soft Reject"),
    ];
}

impl LifecycleStatus for ExperimentStatus {
    const RUNNING: Self = Self::Running;
    const COMPLETED: Self = Self::Completed;
    const STARTS_FROM: &'static [Self] = &[Self::Proposed, Self::NotStarted];
    const ENDS_FROM: &'static [Self] = &[
        Self::Proposed,
        Self::NotStarted,
        Self::Running,
        Self::Suspended,
    ];
}

/// Stage status (experiment statuses minus the reject states)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageStatus {
    #[serde(rename = "P")]
    Proposed,
    #[serde(rename = "Q")]
    NotStarted,
    #[serde(rename = "R")]
    Running,
    #[serde(rename = "C")]
    Completed,
    #[serde(rename = "T")]
    TerminatedEarly,
    #[serde(rename = "H")]
    Suspended,
}

impl StatusGroup for StageStatus {
    const CHOICES: &'static [(Self, &'static str, &'static str)] = &[
        (Self::Proposed, "P", "Proposed"),
        (Self::NotStarted, "Q", "Not Started"),
        (Self::Running, "R", "Running"),
        (Self::Completed, "C", "Completed"),
        (Self::TerminatedEarly, "T", "Terminated Early"),
        (Self::Suspended, "H", "Suspended"),
    ];
}

impl LifecycleStatus for StageStatus {
    const RUNNING: Self = Self::Running;
    const COMPLETED: Self = Self::Completed;
    const STARTS_FROM: &'static [Self] = &[Self::Proposed, Self::NotStarted];
    const ENDS_FROM: &'static [Self] = &[
        Self::Proposed,
        Self::NotStarted,
        Self::Running,
        Self::Suspended,
    ];
}

/// Campaign ML model status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MlModelStatus {
    #[serde(rename = "U")]
    Untrained,
    #[serde(rename = "O")]
    OutOfDate,
    #[serde(rename = "R")]
    Running,
    #[serde(rename = "T")]
    Trained,
    #[serde(rename = "E")]
    Error,
}

impl StatusGroup for MlModelStatus {
    const CHOICES: &'static [(Self, &'static str, &'static str)] = &[
        (Self::Untrained, "U", "Untrained"),
        (Self::OutOfDate, "O", "Out of date"),
        (Self::Running, "R", "Running training"),
        (Self::Trained, "T", "Trained"),
        (Self::Error, "E", "Error during training"),
    ];
}

impl MlModelStatus {
    /// Whether a training run should be started from this status.
    ///
    /// A model that is training or was just trained is left alone.
    pub fn needs_training(self) -> bool {
        !matches!(self, Self::Running | Self::Trained)
    }
}

macro_rules! display_as_code {
    ($($ty:ty),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(self.code())
                }
            }
        )*
    };
}

display_as_code!(ExperimentStatus, StageStatus, MlModelStatus);

// ─────────────────────────────────────────────────────────────────────────────
// Transitions
// ─────────────────────────────────────────────────────────────────────────────

/// Entity with a lifecycle status and start/end timestamps.
pub trait Tracked {
    type Status: LifecycleStatus;

    fn status(&self) -> Self::Status;
    fn set_status(&mut self, status: Self::Status);
    fn start_time_mut(&mut self) -> &mut Option<DateTime<Utc>>;
    fn end_time_mut(&mut self) -> &mut Option<DateTime<Utc>>;
}

/// Outcome of applying a status to an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition<S> {
    pub from: S,
    pub to: S,
    /// `start_time` was set by this transition
    pub started: bool,
    /// `end_time` was set by this transition
    pub ended: bool,
}

impl<S: PartialEq> Transition<S> {
    /// Whether the status actually changed
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Apply a resolved status to an entity, setting timestamps per its rules.
///
/// `time` defaults to now.
pub fn apply_status<T: Tracked>(
    entity: &mut T,
    to: T::Status,
    time: Option<DateTime<Utc>>,
) -> Transition<T::Status> {
    let from = entity.status();
    let at = time.unwrap_or_else(Utc::now);
    entity.set_status(to);

    let mut started = false;
    let mut ended = false;

    if T::Status::starts_clock(from, to) {
        let slot = entity.start_time_mut();
        if slot.is_none() {
            *slot = Some(at);
            started = true;
        }
    } else if T::Status::stops_clock(from, to) {
        let slot = entity.end_time_mut();
        if slot.is_none() {
            *slot = Some(at);
            ended = true;
        }
    }

    Transition {
        from,
        to,
        started,
        ended,
    }
}

/// Resolve a raw status string (code or label) and apply it.
///
/// On an unrecognized string the entity is left untouched.
pub fn apply_raw_status<T: Tracked>(
    entity: &mut T,
    raw: &str,
    time: Option<DateTime<Utc>>,
) -> Result<Transition<T::Status>> {
    let to = T::Status::resolve(raw)?;
    Ok(apply_status(entity, to, time))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[derive(Debug, Default)]
    struct Probe {
        status: Option<StageStatus>,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    }

    impl Tracked for Probe {
        type Status = StageStatus;

        fn status(&self) -> StageStatus {
            self.status.unwrap_or(StageStatus::Proposed)
        }
        fn set_status(&mut self, status: StageStatus) {
            self.status = Some(status);
        }
        fn start_time_mut(&mut self) -> &mut Option<DateTime<Utc>> {
            &mut self.start_time
        }
        fn end_time_mut(&mut self) -> &mut Option<DateTime<Utc>> {
            &mut self.end_time
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_resolve_code_and_label() {
        assert_eq!(
            ExperimentStatus::resolve("R").unwrap(),
            ExperimentStatus::Running
        );
        assert_eq!(
            ExperimentStatus::resolve("Running").unwrap(),
            ExperimentStatus::Running
        );
        assert_eq!(
            ExperimentStatus::resolve("Not Started").unwrap(),
            ExperimentStatus::NotStarted
        );
        assert_eq!(
            MlModelStatus::resolve("Out of date").unwrap(),
            MlModelStatus::OutOfDate
        );
    }

    #[test]
    fn test_resolve_rejects_unknown() {
        let err = ExperimentStatus::resolve("Garbage").unwrap_err();
        assert!(err.is_validation());
        assert!(ExperimentStatus::resolve("G").is_err());
        // Reject states are experiment-only
        assert!(StageStatus::resolve("X").is_err());
        assert!(ExperimentStatus::resolve("X").is_ok());
    }

    #[test]
    fn test_code_label_table_is_bijective() {
        for (status, code, label) in ExperimentStatus::CHOICES {
            assert_eq!(status.code(), *code);
            assert_eq!(status.label(), *label);
            assert_eq!(ExperimentStatus::from_code(code), Some(*status));
        }
        assert_eq!(StageStatus::Suspended.to_string(), "H");
    }

    #[test]
    fn test_serde_uses_codes() {
        let json = serde_json::to_string(&ExperimentStatus::Completed).unwrap();
        assert_eq!(json, "\"C\"");
        let parsed: MlModelStatus = serde_json::from_str("\"T\"").unwrap();
        assert_eq!(parsed, MlModelStatus::Trained);
    }

    #[test]
    fn test_running_sets_start_time_once() {
        let mut probe = Probe::default();
        let t = apply_status(&mut probe, StageStatus::Running, Some(at(0)));
        assert!(t.changed());
        assert!(t.started);
        assert_eq!(probe.start_time, Some(at(0)));

        let t = apply_status(&mut probe, StageStatus::Running, Some(at(60)));
        assert!(!t.changed());
        assert!(!t.started);
        assert_eq!(probe.start_time, Some(at(0)));
    }

    #[test]
    fn test_running_from_suspended_does_not_start_clock() {
        let mut probe = Probe {
            status: Some(StageStatus::Suspended),
            ..Default::default()
        };
        apply_status(&mut probe, StageStatus::Running, Some(at(0)));
        assert!(probe.start_time.is_none());
    }

    #[test]
    fn test_completed_sets_end_time_from_allowed_states() {
        for from in [
            StageStatus::Proposed,
            StageStatus::NotStarted,
            StageStatus::Running,
            StageStatus::Suspended,
        ] {
            let mut probe = Probe {
                status: Some(from),
                ..Default::default()
            };
            let t = apply_status(&mut probe, StageStatus::Completed, Some(at(5)));
            assert!(t.ended, "from {:?}", from);
            assert_eq!(probe.end_time, Some(at(5)));

            let t = apply_status(&mut probe, StageStatus::Completed, Some(at(9)));
            assert!(!t.ended);
            assert_eq!(probe.end_time, Some(at(5)));
        }

        let mut probe = Probe {
            status: Some(StageStatus::TerminatedEarly),
            ..Default::default()
        };
        apply_status(&mut probe, StageStatus::Completed, None);
        assert!(probe.end_time.is_none());
    }

    #[test]
    fn test_timestamps_never_rewritten() {
        let mut probe = Probe::default();
        apply_status(&mut probe, StageStatus::Running, Some(at(0)));
        apply_status(&mut probe, StageStatus::NotStarted, Some(at(10)));
        apply_status(&mut probe, StageStatus::Running, Some(at(20)));
        assert_eq!(probe.start_time, Some(at(0)));
    }

    #[test]
    fn test_raw_status_leaves_entity_untouched_on_error() {
        let mut probe = Probe::default();
        assert!(apply_raw_status(&mut probe, "Garbage", None).is_err());
        assert_eq!(probe.status(), StageStatus::Proposed);
        assert!(probe.start_time.is_none());

        let t = apply_raw_status(&mut probe, "Running", None).unwrap();
        assert_eq!(t.to, StageStatus::Running);
        assert!(probe.start_time.is_some());
    }

    #[test]
    fn test_ml_needs_training() {
        assert!(MlModelStatus::Untrained.needs_training());
        assert!(MlModelStatus::OutOfDate.needs_training());
        assert!(MlModelStatus::Error.needs_training());
        assert!(!MlModelStatus::Running.needs_training());
        assert!(!MlModelStatus::Trained.needs_training());
    }
}
