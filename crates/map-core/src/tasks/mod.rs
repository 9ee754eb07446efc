//! Background task definitions and scheduling abstractions.
//!
//! A [`Task`] names one unit of background work. A [`Job`] wraps a task with
//! its retry attempt and the follow-up tasks to run once it completes, so a
//! monitor can chain into a model update without the two knowing about each
//! other:
//!
//! ```text
//!   Job { MonitorExperiment(C), followups: [UpdateModel] }
//!       │ Done
//!       ▼
//!   Job { UpdateModel, followups: [] }
//! ```
//!
//! Work is submitted through the [`Scheduler`] trait. The server backs it
//! with a tokio worker pool; tests use [`RecordingScheduler`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use crate::status::{ExperimentStatus, StageStatus};

// ─────────────────────────────────────────────────────────────────────────────
// Tasks
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum Task {
    /// Offer an experiment to the campaign's facilities until one accepts
    PlaceExperiment { campaign: String, experiment: String },
    /// Watch an experiment while it holds `expected`
    MonitorExperiment {
        campaign: String,
        experiment: String,
        expected: ExperimentStatus,
    },
    /// Watch a single stage while it holds `expected`
    MonitorStage {
        campaign: String,
        experiment: String,
        stage: String,
        expected: StageStatus,
    },
    /// Dispatch a training run for the campaign model
    UpdateModel { campaign: String },
    /// Ask the campaign model for a new proposal
    ProbeModel { campaign: String },
}

impl Task {
    pub fn place(campaign: impl Into<String>, experiment: impl Into<String>) -> Self {
        Self::PlaceExperiment {
            campaign: campaign.into(),
            experiment: experiment.into(),
        }
    }

    pub fn monitor_experiment(
        campaign: impl Into<String>,
        experiment: impl Into<String>,
        expected: ExperimentStatus,
    ) -> Self {
        Self::MonitorExperiment {
            campaign: campaign.into(),
            experiment: experiment.into(),
            expected,
        }
    }

    pub fn monitor_stage(
        campaign: impl Into<String>,
        experiment: impl Into<String>,
        stage: impl Into<String>,
        expected: StageStatus,
    ) -> Self {
        Self::MonitorStage {
            campaign: campaign.into(),
            experiment: experiment.into(),
            stage: stage.into(),
            expected,
        }
    }

    pub fn update_model(campaign: impl Into<String>) -> Self {
        Self::UpdateModel {
            campaign: campaign.into(),
        }
    }

    pub fn probe_model(campaign: impl Into<String>) -> Self {
        Self::ProbeModel {
            campaign: campaign.into(),
        }
    }

    /// Short task kind, used as a log field
    pub fn kind(&self) -> &'static str {
        match self {
            Task::PlaceExperiment { .. } => "place_experiment",
            Task::MonitorExperiment { .. } => "monitor_experiment",
            Task::MonitorStage { .. } => "monitor_stage",
            Task::UpdateModel { .. } => "update_model",
            Task::ProbeModel { .. } => "probe_model",
        }
    }

    pub fn campaign(&self) -> &str {
        match self {
            Task::PlaceExperiment { campaign, .. }
            | Task::MonitorExperiment { campaign, .. }
            | Task::MonitorStage { campaign, .. }
            | Task::UpdateModel { campaign }
            | Task::ProbeModel { campaign } => campaign,
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::PlaceExperiment {
                campaign,
                experiment,
            } => write!(f, "place_experiment({}/{})", campaign, experiment),
            Task::MonitorExperiment {
                campaign,
                experiment,
                expected,
            } => write!(f, "monitor_experiment({}/{}, {})", campaign, experiment, expected),
            Task::MonitorStage {
                campaign,
                experiment,
                stage,
                expected,
            } => write!(
                f,
                "monitor_stage({}/{}/{}, {})",
                campaign, experiment, stage, expected
            ),
            Task::UpdateModel { campaign } => write!(f, "update_model({})", campaign),
            Task::ProbeModel { campaign } => write!(f, "probe_model({})", campaign),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Jobs
// ─────────────────────────────────────────────────────────────────────────────

/// A task plus its chain of follow-ups and retry attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub task: Task,
    /// Run in order after `task` completes; dropped if it goes stale
    pub followups: Vec<Task>,
    /// Retries of this task so far
    pub attempt: u32,
}

impl Job {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            followups: Vec::new(),
            attempt: 0,
        }
    }

    /// Append a follow-up
    pub fn then(mut self, task: Task) -> Self {
        self.followups.push(task);
        self
    }

    /// Same task and chain, one attempt further
    pub fn retry(&self) -> Self {
        Self {
            task: self.task.clone(),
            followups: self.followups.clone(),
            attempt: self.attempt.saturating_add(1),
        }
    }

    /// Replace the task but keep the chain.
    ///
    /// Used when a monitor moves on to watching a new status; the attempt
    /// count starts over.
    pub fn continue_with(&self, task: Task) -> Self {
        Self {
            task,
            followups: self.followups.clone(),
            attempt: 0,
        }
    }

    /// The next job in the chain, if any
    pub fn into_followup(self) -> Option<Self> {
        let mut rest = self.followups.into_iter();
        let task = rest.next()?;
        Some(Self {
            task,
            followups: rest.collect(),
            attempt: 0,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scheduling
// ─────────────────────────────────────────────────────────────────────────────

/// Task submission. Implementations must not block the caller.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, job: Job, delay: Duration);
}

/// A job captured by [`RecordingScheduler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledJob {
    pub job: Job,
    pub delay: Duration,
}

/// Scheduler that only records submissions.
#[derive(Debug, Default)]
pub struct RecordingScheduler {
    jobs: Mutex<Vec<ScheduledJob>>,
}

impl RecordingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything scheduled so far
    pub fn scheduled(&self) -> Vec<ScheduledJob> {
        self.jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Drain recorded jobs
    pub fn take(&self) -> Vec<ScheduledJob> {
        std::mem::take(
            &mut *self
                .jobs
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.scheduled().is_empty()
    }
}

impl Scheduler for RecordingScheduler {
    fn schedule(&self, job: Job, delay: Duration) {
        self.jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(ScheduledJob { job, delay });
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Retry Policy
// ─────────────────────────────────────────────────────────────────────────────

/// Exponential backoff: `min(base * 2^attempt, max)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever
    pub max_retries: Option<u32>,
    /// Attempt count from which each retry is logged as a warning
    pub alert_after: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(180),
            max_delay: Duration::from_secs(30 * 60),
            max_retries: None,
            alert_after: Some(20),
        }
    }
}

/// What to do with a job that asked to be retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

impl RetryPolicy {
    /// Backoff before retry number `attempt + 1`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn decide(&self, attempt: u32) -> RetryDecision {
        match self.max_retries {
            Some(max) if attempt >= max => RetryDecision::GiveUp,
            _ => RetryDecision::Retry {
                delay: self.delay_for(attempt),
            },
        }
    }

    pub fn should_alert(&self, attempt: u32) -> bool {
        self.alert_after.is_some_and(|threshold| attempt >= threshold)
    }
}
