//! StatusService - applies facility status notifications.
//!
//! A notification is resolved through the status model and written in one
//! atomic read-modify-write. Only a real change schedules monitoring:
//!
//! - experiment → Running: watch Running, then update the model
//! - experiment → Completed: watch Completed, then update the model
//! - stage → Running or Completed: watch the stage on its own

use map_core::db::{Experiment, Stage};
use map_core::status::{ExperimentStatus, StageStatus, apply_raw_status};
use map_core::tasks::{Job, Scheduler, Task};
use map_core::types::StatusUpdate;
use map_core::{Database, Result};
use std::sync::Arc;
use tracing::info;

use crate::config::MonitoringConfig;

pub struct StatusService {
    db: Arc<Database>,
    scheduler: Arc<dyn Scheduler>,
    delays: MonitoringConfig,
}

impl StatusService {
    pub fn new(db: Arc<Database>, scheduler: Arc<dyn Scheduler>, delays: MonitoringConfig) -> Self {
        Self {
            db,
            scheduler,
            delays,
        }
    }

    /// Apply a status notification to an experiment
    pub fn update_experiment(
        &self,
        campaign: &str,
        experiment: &str,
        update: &StatusUpdate,
    ) -> Result<Experiment> {
        let (updated, transition) = self.db.modify_experiment(campaign, experiment, |exp| {
            apply_raw_status(exp, &update.status, update.time)
        })?;

        if !transition.changed() {
            return Ok(updated);
        }

        info!(
            campaign = %campaign,
            experiment = %experiment,
            from = %transition.from,
            to = %transition.to,
            "Experiment status changed"
        );

        let delay = match transition.to {
            ExperimentStatus::Running => Some(self.delays.running_delay()),
            ExperimentStatus::Completed => Some(self.delays.completed_delay()),
            _ => None,
        };
        if let Some(delay) = delay {
            let job = Job::new(Task::monitor_experiment(campaign, experiment, transition.to))
                .then(Task::update_model(campaign));
            self.scheduler.schedule(job, delay);
        }

        Ok(updated)
    }

    /// Apply a status notification to one stage of an experiment
    pub fn update_stage(
        &self,
        campaign: &str,
        experiment: &str,
        stage: &str,
        update: &StatusUpdate,
    ) -> Result<Stage> {
        let (updated, transition) = self.db.modify_stage(campaign, experiment, stage, |row| {
            apply_raw_status(row, &update.status, update.time)
        })?;

        if !transition.changed() {
            return Ok(updated);
        }

        info!(
            campaign = %campaign,
            experiment = %experiment,
            stage = %stage,
            from = %transition.from,
            to = %transition.to,
            "Stage status changed"
        );

        if matches!(transition.to, StageStatus::Running | StageStatus::Completed) {
            let job = Job::new(Task::monitor_stage(campaign, experiment, stage, transition.to));
            self.scheduler.schedule(job, self.delays.stage_delay());
        }

        Ok(updated)
    }
}
