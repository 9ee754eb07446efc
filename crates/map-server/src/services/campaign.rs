//! CampaignService - the campaign / ML advisor loop.
//!
//! ```text
//!   experiment completes ──► monitor resolves values ──► UpdateModel
//!                                                          │ train job
//!                                                          ▼
//!   propose ◄── advisor probes model ◄── ProbeModel ◄── ml trained callback
//!      │
//!      └──► PlaceExperiment
//! ```
//!
//! Model status moves Untrained → Running → Trained, with OutOfDate or Error
//! sending it back through Running on the next update.

use map_core::db::{Campaign, MapInput, MlFacility, NewExperiment};
use map_core::ml::{MlAdvisor, ProbeRequest, TrainRequest};
use map_core::tasks::{Job, Scheduler, Task};
use map_core::types::{Proposal, ProposedExperiment, next_experiment_name};
use map_core::{Database, Error, MlModelStatus, Result};
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// What a campaign call did
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignAction {
    pub campaign: String,
    pub ml_model_status: MlModelStatus,
    /// Tasks queued, in display form
    pub scheduled: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experiment: Option<String>,
}

pub struct CampaignService {
    db: Arc<Database>,
    scheduler: Arc<dyn Scheduler>,
    advisor: Arc<dyn MlAdvisor>,
    callback_url: Option<String>,
}

impl CampaignService {
    pub fn new(
        db: Arc<Database>,
        scheduler: Arc<dyn Scheduler>,
        advisor: Arc<dyn MlAdvisor>,
        callback_url: Option<String>,
    ) -> Self {
        Self {
            db,
            scheduler,
            advisor,
            callback_url,
        }
    }

    fn submit(&self, job: Job, scheduled: &mut Vec<String>) {
        scheduled.push(job.task.to_string());
        scheduled.extend(job.followups.iter().map(ToString::to_string));
        self.scheduler.schedule(job, Duration::ZERO);
    }

    fn below_max(&self, campaign: &Campaign) -> Result<bool> {
        Ok(self.db.count_experiments(campaign.id)? < campaign.max_experiments)
    }

    fn ml_facility(&self, campaign: &Campaign) -> Result<Option<MlFacility>> {
        match campaign.ml_facility_id {
            Some(id) => self.db.get_ml_facility(id),
            None => Ok(None),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Advisor Callbacks
    // ─────────────────────────────────────────────────────────────────────────

    /// The advisor finished training the campaign model
    pub fn ml_trained(&self, campaign: &str) -> Result<CampaignAction> {
        let prior = self.db.set_ml_status(campaign, MlModelStatus::Trained)?;
        let camp = self.db.require_campaign(campaign)?;
        let mut scheduled = Vec::new();

        if self.below_max(&camp)? {
            match prior {
                MlModelStatus::Running => {
                    self.submit(Job::new(Task::probe_model(campaign)), &mut scheduled);
                }
                MlModelStatus::Untrained | MlModelStatus::OutOfDate => {
                    let job = Job::new(Task::probe_model(campaign)).then(Task::update_model(campaign));
                    self.submit(job, &mut scheduled);
                }
                MlModelStatus::Trained | MlModelStatus::Error => {}
            }
        }

        info!(campaign = %campaign, prior = %prior, scheduled = scheduled.len(), "Model trained");
        Ok(CampaignAction {
            campaign: campaign.to_string(),
            ml_model_status: MlModelStatus::Trained,
            scheduled,
            experiment: None,
        })
    }

    /// The advisor reported a training failure
    pub fn ml_failed(&self, campaign: &str) -> Result<CampaignAction> {
        let prior = self.db.set_ml_status(campaign, MlModelStatus::Error)?;
        warn!(campaign = %campaign, prior = %prior, "Model training failed");
        Ok(CampaignAction {
            campaign: campaign.to_string(),
            ml_model_status: MlModelStatus::Error,
            scheduled: Vec::new(),
            experiment: None,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Proposals
    // ─────────────────────────────────────────────────────────────────────────

    /// Create an experiment from advisor-chosen inputs and queue placement
    pub fn propose(&self, campaign: &str, proposal: &Proposal) -> Result<ProposedExperiment> {
        if proposal.mode.trim().is_empty() {
            return Err(Error::validation("Proposal mode must not be empty"));
        }
        let camp = self.db.require_campaign(campaign)?;
        let templates = self.db.list_map_inputs(camp.map_id)?;
        let by_name: HashMap<&str, &MapInput> =
            templates.iter().map(|t| (t.name.as_str(), t)).collect();

        let mut values: HashMap<i64, f64> = HashMap::new();
        for input in &proposal.inputs {
            let template = by_name.get(input.name.as_str()).ok_or_else(|| {
                Error::validation(format!("Unknown input '{}'", input.name))
            })?;
            if !template.contains(input.value) {
                return Err(Error::validation(format!(
                    "Input '{}' value {} is outside [{}, {}]",
                    input.name, input.value, template.min_val, template.max_val
                )));
            }
            if values.insert(template.id, input.value).is_some() {
                return Err(Error::conflict(format!(
                    "Input '{}' supplied more than once",
                    input.name
                )));
            }
        }

        let missing: Vec<&str> = templates
            .iter()
            .filter(|t| !values.contains_key(&t.id))
            .map(|t| t.name.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(Error::validation(format!(
                "Missing inputs: {}",
                missing.join(", ")
            )));
        }

        let inputs = templates.iter().map(|t| (t.id, values[&t.id])).collect();
        self.create_and_place(&camp, &proposal.mode, inputs)
    }

    /// Create an experiment with inputs drawn uniformly from their ranges
    pub fn propose_random(&self, campaign: &str) -> Result<ProposedExperiment> {
        let camp = self.db.require_campaign(campaign)?;
        let templates = self.db.list_map_inputs(camp.map_id)?;
        let mut rng = rand::thread_rng();
        let inputs = templates
            .iter()
            .map(|t| (t.id, rng.gen_range(t.min_val..=t.max_val)))
            .collect();
        self.create_and_place(&camp, "random", inputs)
    }

    fn create_and_place(
        &self,
        campaign: &Campaign,
        mode: &str,
        inputs: Vec<(i64, f64)>,
    ) -> Result<ProposedExperiment> {
        let existing = self.db.list_experiments(campaign.id)?;
        let name = next_experiment_name(mode, existing.iter().map(|e| e.name.as_str()));

        self.db.create_experiment(&NewExperiment {
            campaign_id: campaign.id,
            name: name.clone(),
            inputs,
        })?;
        info!(campaign = %campaign.name, experiment = %name, mode = %mode, "Experiment proposed");

        self.scheduler
            .schedule(Job::new(Task::place(&campaign.name, &name)), Duration::ZERO);

        Ok(ProposedExperiment {
            campaign_name: campaign.name.clone(),
            experiment_name: name,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Campaign Driver
    // ─────────────────────────────────────────────────────────────────────────

    /// Kick a campaign: train, probe or seed it with a random experiment
    pub fn run(&self, campaign: &str) -> Result<CampaignAction> {
        let camp = self.db.require_campaign(campaign)?;
        let count = self.db.count_experiments(camp.id)?;
        let mut scheduled = Vec::new();
        let mut experiment = None;

        if count > 0 {
            match camp.ml_model_status {
                MlModelStatus::Untrained | MlModelStatus::OutOfDate => {
                    self.submit(Job::new(Task::update_model(campaign)), &mut scheduled);
                }
                MlModelStatus::Trained if count < camp.max_experiments => {
                    self.submit(Job::new(Task::probe_model(campaign)), &mut scheduled);
                }
                _ => {}
            }
        } else if camp.max_experiments > 0 {
            let proposed = self.propose_random(campaign)?;
            scheduled.push(Task::place(campaign, &proposed.experiment_name).to_string());
            experiment = Some(proposed.experiment_name);
        }

        info!(campaign = %campaign, experiments = count, scheduled = scheduled.len(), "Campaign run");
        Ok(CampaignAction {
            campaign: campaign.to_string(),
            ml_model_status: camp.ml_model_status,
            scheduled,
            experiment,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Model Jobs (run by the task engine)
    // ─────────────────────────────────────────────────────────────────────────

    /// Start a training run unless one is running or the model is current.
    ///
    /// Returns whether a job was dispatched. A dispatch failure puts the
    /// prior status back and surfaces as a retryable error.
    pub async fn update_model(&self, campaign: &str) -> Result<bool> {
        let camp = self.db.require_campaign(campaign)?;
        let Some(ml) = self.ml_facility(&camp)? else {
            info!(campaign = %campaign, "No ML facility; skipping model update");
            return Ok(false);
        };

        let (prior, next) = self.db.transition_ml_status(campaign, |c| {
            c.ml_model_status
                .needs_training()
                .then_some(MlModelStatus::Running)
        })?;
        if next.is_none() {
            info!(campaign = %campaign, status = %prior, "Model busy or current; skipping update");
            return Ok(false);
        }

        let request = TrainRequest::for_campaign(&camp, &ml, self.callback_url.clone());
        if let Err(e) = self.advisor.train(&ml, &request).await {
            self.db.transition_ml_status(campaign, |c| {
                (c.ml_model_status == MlModelStatus::Running).then_some(prior)
            })?;
            return Err(e);
        }

        info!(campaign = %campaign, model = %camp.uid_node, "Training dispatched");
        Ok(true)
    }

    /// Ask the advisor for a new proposal
    pub async fn probe_model(&self, campaign: &str) -> Result<bool> {
        let camp = self.db.require_campaign(campaign)?;
        let Some(ml) = self.ml_facility(&camp)? else {
            info!(campaign = %campaign, "No ML facility; skipping probe");
            return Ok(false);
        };

        let request = ProbeRequest::for_campaign(&camp, &ml, self.callback_url.clone());
        self.advisor.probe(&ml, &request).await?;
        info!(campaign = %campaign, model = %camp.uid_node, "Probe dispatched");
        Ok(true)
    }
}
