//! Seed data shared by unit tests across the workspace.
//!
//! One MAP ("flow-reactor") with two stages, two inputs, two outputs, two
//! facilities and an ML advisor, plus a campaign named `camp`.

use super::*;

pub struct Fixture {
    pub map: MapDefinition,
    pub mix: MapStage,
    pub measure: MapStage,
    /// [20, 80], consumed by `mix`
    pub temperature: MapInput,
    /// [0.1, 5.0], consumed by `measure`
    pub flow_rate: MapInput,
    /// produced by `measure`
    pub yield_output: MapOutput,
    /// not tied to a stage
    pub purity: MapOutput,
    pub alpha: Facility,
    pub beta: Facility,
    pub advisor: MlFacility,
    pub campaign: Campaign,
}

pub const ALPHA_URL: &str = "http://alpha.facility.test";
pub const BETA_URL: &str = "http://beta.facility.test";
pub const ADVISOR_URL: &str = "http://advisor.ml.test";

impl Fixture {
    pub fn install(db: &Database) -> Result<Self> {
        let map = db.create_map("flow-reactor")?;
        let mix = db.create_map_stage(map.id, "mix")?;
        let measure = db.create_map_stage(map.id, "measure")?;

        let temperature = db.create_map_input(&NewMapInput {
            map_id: map.id,
            name: "temperature".into(),
            min_val: 20.0,
            max_val: 80.0,
            for_stage: Some(mix.id),
            units: Some("C".into()),
        })?;
        let flow_rate = db.create_map_input(&NewMapInput {
            map_id: map.id,
            name: "flow_rate".into(),
            min_val: 0.1,
            max_val: 5.0,
            for_stage: Some(measure.id),
            units: Some("mL/min".into()),
        })?;

        let yield_output = db.create_map_output(&NewMapOutput {
            map_id: map.id,
            name: "yield".into(),
            from_stage: Some(measure.id),
            units: None,
        })?;
        let purity = db.create_map_output(&NewMapOutput {
            map_id: map.id,
            name: "purity".into(),
            from_stage: None,
            units: None,
        })?;

        let alpha = db.create_facility(map.id, "alpha", ALPHA_URL)?;
        let beta = db.create_facility(map.id, "beta", BETA_URL)?;

        let advisor = db.create_ml_facility(&NewMlFacility {
            name: "advisor".into(),
            location: ADVISOR_URL.into(),
            train_script: "train_gp".into(),
            probe_script: "probe_gp".into(),
        })?;

        let campaign = db.create_campaign(&NewCampaign {
            name: "camp".into(),
            map_id: map.id,
            max_experiments: 3,
            ml_facility_id: Some(advisor.id),
            goal: Some("maximize yield".into()),
        })?;

        Ok(Self {
            map,
            mix,
            measure,
            temperature,
            flow_rate,
            yield_output,
            purity,
            alpha,
            beta,
            advisor,
            campaign,
        })
    }

    /// Create a Proposed experiment in `camp` with mid-range inputs
    pub fn propose(&self, db: &Database, name: &str) -> Result<Experiment> {
        db.create_experiment(&NewExperiment {
            campaign_id: self.campaign.id,
            name: name.to_string(),
            inputs: vec![(self.temperature.id, 50.0), (self.flow_rate.id, 1.0)],
        })
    }
}
