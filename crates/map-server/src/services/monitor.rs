//! MonitorService - one invocation of an experiment or stage watch.
//!
//! Each call re-reads stored state before acting and reports what the task
//! engine should do next; it never schedules anything itself.
//!
//! Watching Completed means waiting for measurements: pending inputs and
//! outputs are filled from the facility's results until none remain. An
//! experiment whose values are all in marks its campaign model OutOfDate.
//! A stage watch leaves the campaign alone.
//!
//! Watching any other status polls the facility for a change. If stored
//! state has moved on since the watch was scheduled, the watch is stale.

use map_core::client::FacilityApi;
use map_core::db::{Experiment, Stage};
use map_core::status::{ExperimentStatus, StageStatus, StatusGroup, apply_status};
use map_core::{Database, MlModelStatus, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a watch invocation concluded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome<S> {
    /// Terminal watch found every value; chain may continue
    Resolved,
    /// Nothing conclusive; watch again with the same arguments
    Retry,
    /// Facility reported a new status, now stored; watch that status next
    Transitioned(S),
    /// Stored status no longer matches the watch
    Stale,
}

pub struct MonitorService {
    db: Arc<Database>,
    facilities: Arc<dyn FacilityApi>,
}

impl MonitorService {
    pub fn new(db: Arc<Database>, facilities: Arc<dyn FacilityApi>) -> Self {
        Self { db, facilities }
    }

    /// Where to poll for this experiment, if it has been placed
    fn binding(&self, experiment: &Experiment) -> Result<Option<(String, String)>> {
        let (Some(facility_id), Some(expid)) = (experiment.facility_id, &experiment.facility_expid)
        else {
            return Ok(None);
        };
        Ok(self
            .db
            .get_facility(facility_id)?
            .map(|facility| (facility.location, expid.clone())))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Experiment Watch
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn watch_experiment(
        &self,
        campaign: &str,
        experiment: &str,
        expected: ExperimentStatus,
    ) -> Result<MonitorOutcome<ExperimentStatus>> {
        let exp = self.db.require_experiment(campaign, experiment)?;

        if expected == ExperimentStatus::Completed {
            if !self.collect_results(&exp, None).await? {
                return Ok(MonitorOutcome::Retry);
            }
            self.db.set_ml_status(campaign, MlModelStatus::OutOfDate)?;
            info!(
                campaign = %campaign,
                experiment = %experiment,
                "All results in; campaign model out of date"
            );
            return Ok(MonitorOutcome::Resolved);
        }

        if exp.status != expected {
            debug!(
                campaign = %campaign,
                experiment = %experiment,
                expected = %expected,
                current = %exp.status,
                "Stale experiment watch"
            );
            return Ok(MonitorOutcome::Stale);
        }

        let Some((location, expid)) = self.binding(&exp)? else {
            return Ok(MonitorOutcome::Retry);
        };
        let raw = match self.facilities.poll_status(&location, &expid, None).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(campaign = %campaign, experiment = %experiment, error = %e, "Status poll failed");
                return Ok(MonitorOutcome::Retry);
            }
        };
        let reported = match ExperimentStatus::resolve(&raw) {
            Ok(status) => status,
            Err(_) => {
                warn!(campaign = %campaign, experiment = %experiment, status = %raw, "Facility reported unknown status");
                return Ok(MonitorOutcome::Retry);
            }
        };
        if reported == expected {
            return Ok(MonitorOutcome::Retry);
        }

        let (_, applied) = self.db.modify_experiment(campaign, experiment, |exp| {
            Ok((exp.status == expected).then(|| apply_status(exp, reported, None)))
        })?;
        match applied {
            Some(transition) => {
                info!(
                    campaign = %campaign,
                    experiment = %experiment,
                    from = %transition.from,
                    to = %transition.to,
                    "Experiment status changed at facility"
                );
                Ok(MonitorOutcome::Transitioned(reported))
            }
            None => Ok(MonitorOutcome::Stale),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Stage Watch
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn watch_stage(
        &self,
        campaign: &str,
        experiment: &str,
        stage: &str,
        expected: StageStatus,
    ) -> Result<MonitorOutcome<StageStatus>> {
        let exp = self.db.require_experiment(campaign, experiment)?;
        let row = self.db.require_stage(campaign, experiment, stage)?;

        if expected == StageStatus::Completed {
            if !self.collect_results(&exp, Some(&row)).await? {
                return Ok(MonitorOutcome::Retry);
            }
            info!(
                campaign = %campaign,
                experiment = %experiment,
                stage = %stage,
                "All stage results in"
            );
            return Ok(MonitorOutcome::Resolved);
        }

        if row.status != expected {
            debug!(
                campaign = %campaign,
                experiment = %experiment,
                stage = %stage,
                expected = %expected,
                current = %row.status,
                "Stale stage watch"
            );
            return Ok(MonitorOutcome::Stale);
        }

        let Some((location, expid)) = self.binding(&exp)? else {
            return Ok(MonitorOutcome::Retry);
        };
        let raw = match self
            .facilities
            .poll_status(&location, &expid, Some(stage))
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                warn!(campaign = %campaign, experiment = %experiment, stage = %stage, error = %e, "Stage status poll failed");
                return Ok(MonitorOutcome::Retry);
            }
        };
        let reported = match StageStatus::resolve(&raw) {
            Ok(status) => status,
            Err(_) => {
                warn!(campaign = %campaign, experiment = %experiment, stage = %stage, status = %raw, "Facility reported unknown stage status");
                return Ok(MonitorOutcome::Retry);
            }
        };
        if reported == expected {
            return Ok(MonitorOutcome::Retry);
        }

        let (_, applied) = self.db.modify_stage(campaign, experiment, stage, |row| {
            Ok((row.status == expected).then(|| apply_status(row, reported, None)))
        })?;
        match applied {
            Some(_) => {
                info!(
                    campaign = %campaign,
                    experiment = %experiment,
                    stage = %stage,
                    to = %reported,
                    "Stage status changed at facility"
                );
                Ok(MonitorOutcome::Transitioned(reported))
            }
            None => Ok(MonitorOutcome::Stale),
        }
    }

    /// Fill pending values in scope; true once none remain.
    async fn collect_results(&self, exp: &Experiment, stage: Option<&Stage>) -> Result<bool> {
        let scope = stage.map(|s| s.map_stage_id);
        let pending = self.db.pending_values(exp.id, scope)?;
        if pending.is_empty() {
            return Ok(true);
        }

        let Some((location, expid)) = self.binding(exp)? else {
            return Ok(false);
        };
        let results = match self
            .facilities
            .poll_results(&location, &expid, stage.map(|s| s.name.as_str()))
            .await
        {
            Ok(results) => results,
            Err(e) => {
                warn!(experiment = %exp.name, error = %e, "Results poll failed");
                return Ok(false);
            }
        };

        let remaining = self.db.fill_pending(exp.id, scope, &results)?;
        debug!(
            experiment = %exp.name,
            pending = pending.len(),
            remaining = remaining.len(),
            "Collected facility results"
        );
        Ok(remaining.is_empty())
    }
}
