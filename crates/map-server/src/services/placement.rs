//! PlacementService - finds a facility for a proposed experiment.
//!
//! Facilities of the campaign's MAP are offered the experiment one at a time,
//! in id order. The first one to answer 201 Created wins: its experiment id is
//! bound, each stage gets its requested inputs pushed, and the experiment is
//! appended to that facility's queue. No other facility is contacted after a
//! win. If nobody accepts, the caller retries later.

use map_core::client::{ConfigEntry, CreateExperimentRequest, CreateReply, FacilityApi};
use map_core::db::{Experiment, Facility};
use map_core::{Database, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Result of one placement attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementOutcome {
    Placed {
        facility: String,
        facility_expid: String,
        /// Every config push and the queue append succeeded
        configured: bool,
    },
    /// Bound by an earlier attempt
    AlreadyPlaced,
    NoFacilityAccepted,
}

pub struct PlacementService {
    db: Arc<Database>,
    facilities: Arc<dyn FacilityApi>,
}

impl PlacementService {
    pub fn new(db: Arc<Database>, facilities: Arc<dyn FacilityApi>) -> Self {
        Self { db, facilities }
    }

    pub async fn place(&self, campaign: &str, experiment: &str) -> Result<PlacementOutcome> {
        let camp = self.db.require_campaign(campaign)?;
        let exp = self.db.require_experiment(campaign, experiment)?;
        if exp.is_placed() {
            return Ok(PlacementOutcome::AlreadyPlaced);
        }

        let request = CreateExperimentRequest {
            campaign_name: campaign.to_string(),
            experiment_name: experiment.to_string(),
        };

        for facility in self.db.list_facilities(camp.map_id)? {
            let facility_expid = match self
                .facilities
                .create_experiment(&facility.location, &request)
                .await
            {
                Ok(CreateReply::Created { id }) => id,
                Ok(CreateReply::Declined { status }) => {
                    info!(
                        campaign = %campaign,
                        experiment = %experiment,
                        facility = %facility.name,
                        status,
                        "Facility declined experiment"
                    );
                    continue;
                }
                Err(e) => {
                    warn!(
                        campaign = %campaign,
                        experiment = %experiment,
                        facility = %facility.name,
                        error = %e,
                        "Facility unavailable for placement"
                    );
                    continue;
                }
            };

            let bound = match self
                .db
                .bind_facility(campaign, experiment, facility.id, &facility_expid)
            {
                Ok(bound) => bound,
                Err(e) if e.is_conflict() => {
                    warn!(
                        campaign = %campaign,
                        experiment = %experiment,
                        facility = %facility.name,
                        facility_expid = %facility_expid,
                        "Experiment was placed concurrently; facility acceptance ignored"
                    );
                    return Ok(PlacementOutcome::AlreadyPlaced);
                }
                Err(e) => return Err(e),
            };

            info!(
                campaign = %campaign,
                experiment = %experiment,
                facility = %facility.name,
                facility_expid = %facility_expid,
                "Experiment placed"
            );

            let configured = self.configure(&facility, &bound, &facility_expid).await?;
            return Ok(PlacementOutcome::Placed {
                facility: facility.name,
                facility_expid,
                configured,
            });
        }

        Ok(PlacementOutcome::NoFacilityAccepted)
    }

    /// Push each stage's inputs, then queue the experiment.
    ///
    /// Failures here are logged, not retried: the binding is already final.
    async fn configure(
        &self,
        facility: &Facility,
        experiment: &Experiment,
        facility_expid: &str,
    ) -> Result<bool> {
        let stages = self.db.list_stages(experiment.id)?;
        let inputs = self.db.list_input_values(experiment.id)?;
        let mut configured = true;

        for stage in &stages {
            let entries: Vec<ConfigEntry> = inputs
                .iter()
                .filter(|input| input.for_stage == Some(stage.map_stage_id))
                .map(|input| ConfigEntry {
                    input_name: input.name.clone(),
                    input_value: input.value_request,
                })
                .collect();

            if let Err(e) = self
                .facilities
                .push_config(&facility.location, facility_expid, &stage.name, &entries)
                .await
            {
                error!(
                    experiment = %experiment.name,
                    facility = %facility.name,
                    stage = %stage.name,
                    error = %e,
                    "Failed to push stage configuration"
                );
                configured = false;
            }
        }

        if let Err(e) = self
            .facilities
            .queue_append(&facility.location, facility_expid)
            .await
        {
            error!(
                experiment = %experiment.name,
                facility = %facility.name,
                error = %e,
                "Failed to append experiment to facility queue"
            );
            configured = false;
        }

        Ok(configured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use map_core::ExperimentStatus;
    use map_core::db::fixtures::{ALPHA_URL, BETA_URL};

    fn service(h: &Harness) -> PlacementService {
        PlacementService::new(h.db.clone(), h.facility.clone())
    }

    #[tokio::test]
    async fn test_first_accepting_facility_wins() {
        let h = Harness::new();
        h.fixture.propose(&h.db, "exp").unwrap();
        h.facility.accept(BETA_URL, "42");

        let outcome = service(&h).place("camp", "exp").await.unwrap();
        assert_eq!(
            outcome,
            PlacementOutcome::Placed {
                facility: "beta".into(),
                facility_expid: "42".into(),
                configured: true,
            }
        );

        let exp = h.db.require_experiment("camp", "exp").unwrap();
        assert_eq!(exp.status, ExperimentStatus::NotStarted);
        assert_eq!(exp.facility_id, Some(h.fixture.beta.id));
        assert_eq!(exp.facility_expid.as_deref(), Some("42"));

        assert_eq!(
            h.facility.calls(),
            vec![
                format!("create {} exp", ALPHA_URL),
                format!("create {} exp", BETA_URL),
                format!("config {} 42 mix [temperature]", BETA_URL),
                format!("config {} 42 measure [flow_rate]", BETA_URL),
                format!("queue {} 42", BETA_URL),
            ]
        );
    }

    #[tokio::test]
    async fn test_later_facilities_not_contacted() {
        let h = Harness::new();
        h.fixture.propose(&h.db, "exp").unwrap();
        h.facility.accept(ALPHA_URL, "7");
        h.facility.accept(BETA_URL, "8");

        service(&h).place("camp", "exp").await.unwrap();
        assert!(h.facility.calls().iter().all(|c| !c.contains(BETA_URL)));
    }

    #[tokio::test]
    async fn test_no_facility_accepted() {
        let h = Harness::new();
        h.fixture.propose(&h.db, "exp").unwrap();

        let outcome = service(&h).place("camp", "exp").await.unwrap();
        assert_eq!(outcome, PlacementOutcome::NoFacilityAccepted);

        let exp = h.db.require_experiment("camp", "exp").unwrap();
        assert_eq!(exp.status, ExperimentStatus::Proposed);
        assert!(exp.facility_id.is_none());
    }

    #[tokio::test]
    async fn test_already_placed_is_not_offered_again() {
        let h = Harness::new();
        h.fixture.propose(&h.db, "exp").unwrap();
        h.facility.accept(ALPHA_URL, "7");

        let svc = service(&h);
        svc.place("camp", "exp").await.unwrap();
        let calls_before = h.facility.calls().len();

        assert_eq!(
            svc.place("camp", "exp").await.unwrap(),
            PlacementOutcome::AlreadyPlaced
        );
        assert_eq!(h.facility.calls().len(), calls_before);
    }

    #[tokio::test]
    async fn test_missing_experiment() {
        let h = Harness::new();
        let err = service(&h).place("camp", "ghost").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
