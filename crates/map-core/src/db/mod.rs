//! SQLite persistence for the orchestrator.
//!
//! All access goes through [`Database`], which serializes callers on a single
//! connection. Read-modify-write operations on experiments, stages and
//! campaigns run inside a transaction while the lock is held, so a concurrent
//! monitor and status endpoint never interleave on the same row.

pub mod types;

#[cfg(any(test, feature = "test-util"))]
pub mod fixtures;

pub use types::*;

use crate::error::{Error, Result};
use crate::status::{ExperimentStatus, MlModelStatus, StageStatus, apply_status};
use crate::types::generate_uid_node;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SCHEMA: &str = include_str!("schema.sql");

const EXPERIMENT_COLUMNS: &str = "e.id, e.campaign_id, e.name, e.status, e.facility_id,
     e.facility_expid, e.start_time, e.end_time";

const STAGE_COLUMNS: &str = "s.id, s.experiment_id, s.map_stage_id, ms.name, s.status,
     s.start_time, s.end_time";

const CAMPAIGN_COLUMNS: &str = "id, name, map_id, max_experiments, ml_facility_id,
     ml_model_status, goal, uid_node";

/// Database connection wrapper.
///
/// Thread-safe via internal Mutex. All database operations acquire the lock.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (and bootstrap) the database at a path
    pub fn open_path(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(Error::Database)?;
        Self::bootstrap(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(Error::Database)?;
        Self::bootstrap(conn)
    }

    fn bootstrap(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(Error::Database)?;
        conn.execute_batch(SCHEMA).map_err(Error::Database)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::LockPoisoned)
    }

    /// Check database connectivity
    pub fn ping(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch("SELECT 1").map_err(Error::Database)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // MAP Definitions
    // ─────────────────────────────────────────────────────────────────────────

    pub fn create_map(&self, name: &str) -> Result<MapDefinition> {
        let conn = self.lock()?;
        conn.execute("INSERT INTO map_definition (name) VALUES (?1)", params![name])?;
        Ok(MapDefinition {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
        })
    }

    pub fn create_map_stage(&self, map_id: i64, name: &str) -> Result<MapStage> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO map_stage (map_id, name) VALUES (?1, ?2)",
            params![map_id, name],
        )?;
        Ok(MapStage {
            id: conn.last_insert_rowid(),
            map_id,
            name: name.to_string(),
        })
    }

    pub fn create_map_input(&self, input: &NewMapInput) -> Result<MapInput> {
        if input.min_val > input.max_val {
            return Err(Error::validation(format!(
                "Input '{}' has min_val above max_val",
                input.name
            )));
        }
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO map_input (map_id, name, min_val, max_val, for_stage, units)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                input.map_id,
                input.name,
                input.min_val,
                input.max_val,
                input.for_stage,
                input.units
            ],
        )?;
        Ok(MapInput {
            id: conn.last_insert_rowid(),
            map_id: input.map_id,
            name: input.name.clone(),
            min_val: input.min_val,
            max_val: input.max_val,
            for_stage: input.for_stage,
            units: input.units.clone(),
        })
    }

    pub fn create_map_output(&self, output: &NewMapOutput) -> Result<MapOutput> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO map_output (map_id, name, from_stage, units) VALUES (?1, ?2, ?3, ?4)",
            params![output.map_id, output.name, output.from_stage, output.units],
        )?;
        Ok(MapOutput {
            id: conn.last_insert_rowid(),
            map_id: output.map_id,
            name: output.name.clone(),
            from_stage: output.from_stage,
            units: output.units.clone(),
        })
    }

    /// Stage templates of a MAP, in definition order
    pub fn list_map_stages(&self, map_id: i64) -> Result<Vec<MapStage>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT id, map_id, name FROM map_stage WHERE map_id = ?1 ORDER BY id")?;
        let stages = stmt
            .query_map(params![map_id], |row| {
                Ok(MapStage {
                    id: row.get(0)?,
                    map_id: row.get(1)?,
                    name: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(stages)
    }

    /// Input templates of a MAP, in definition order
    pub fn list_map_inputs(&self, map_id: i64) -> Result<Vec<MapInput>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, map_id, name, min_val, max_val, for_stage, units
             FROM map_input WHERE map_id = ?1 ORDER BY id",
        )?;
        let inputs = stmt
            .query_map(params![map_id], |row| {
                Ok(MapInput {
                    id: row.get(0)?,
                    map_id: row.get(1)?,
                    name: row.get(2)?,
                    min_val: row.get(3)?,
                    max_val: row.get(4)?,
                    for_stage: row.get(5)?,
                    units: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(inputs)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Facilities
    // ─────────────────────────────────────────────────────────────────────────

    pub fn create_facility(&self, map_id: i64, name: &str, location: &str) -> Result<Facility> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO facility (map_id, name, location) VALUES (?1, ?2, ?3)",
            params![map_id, name, location],
        )?;
        Ok(Facility {
            id: conn.last_insert_rowid(),
            map_id,
            name: name.to_string(),
            location: location.to_string(),
        })
    }

    /// Facilities implementing a MAP, in placement trial order
    pub fn list_facilities(&self, map_id: i64) -> Result<Vec<Facility>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, map_id, name, location FROM facility WHERE map_id = ?1 ORDER BY id",
        )?;
        let facilities = stmt
            .query_map(params![map_id], Self::map_facility)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(facilities)
    }

    pub fn get_facility(&self, facility_id: i64) -> Result<Option<Facility>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT id, map_id, name, location FROM facility WHERE id = ?1",
                params![facility_id],
                Self::map_facility,
            )
            .optional()?)
    }

    fn map_facility(row: &rusqlite::Row) -> rusqlite::Result<Facility> {
        Ok(Facility {
            id: row.get(0)?,
            map_id: row.get(1)?,
            name: row.get(2)?,
            location: row.get(3)?,
        })
    }

    pub fn create_ml_facility(&self, facility: &NewMlFacility) -> Result<MlFacility> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO ml_facility (name, location, train_script, probe_script)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                facility.name,
                facility.location,
                facility.train_script,
                facility.probe_script
            ],
        )?;
        Ok(MlFacility {
            id: conn.last_insert_rowid(),
            name: facility.name.clone(),
            location: facility.location.clone(),
            train_script: facility.train_script.clone(),
            probe_script: facility.probe_script.clone(),
        })
    }

    pub fn get_ml_facility(&self, ml_facility_id: i64) -> Result<Option<MlFacility>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT id, name, location, train_script, probe_script
                 FROM ml_facility WHERE id = ?1",
                params![ml_facility_id],
                |row| {
                    Ok(MlFacility {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        location: row.get(2)?,
                        train_script: row.get(3)?,
                        probe_script: row.get(4)?,
                    })
                },
            )
            .optional()?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Campaigns
    // ─────────────────────────────────────────────────────────────────────────

    pub fn create_campaign(&self, campaign: &NewCampaign) -> Result<Campaign> {
        let conn = self.lock()?;
        let uid_node = generate_uid_node();
        conn.execute(
            "INSERT INTO campaign (name, map_id, max_experiments, ml_facility_id, ml_model_status,
                                   goal, uid_node)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                campaign.name,
                campaign.map_id,
                campaign.max_experiments,
                campaign.ml_facility_id,
                MlModelStatus::Untrained,
                campaign.goal,
                uid_node
            ],
        )?;
        Ok(Campaign {
            id: conn.last_insert_rowid(),
            name: campaign.name.clone(),
            map_id: campaign.map_id,
            max_experiments: campaign.max_experiments,
            ml_facility_id: campaign.ml_facility_id,
            ml_model_status: MlModelStatus::Untrained,
            goal: campaign.goal.clone(),
            uid_node,
        })
    }

    pub fn get_campaign(&self, name: &str) -> Result<Option<Campaign>> {
        let conn = self.lock()?;
        Self::find_campaign(&conn, name)
    }

    /// Get a campaign or fail with not-found
    pub fn require_campaign(&self, name: &str) -> Result<Campaign> {
        self.get_campaign(name)?
            .ok_or_else(|| Error::not_found("Campaign", name))
    }

    fn find_campaign(conn: &Connection, name: &str) -> Result<Option<Campaign>> {
        let sql = format!("SELECT {} FROM campaign WHERE name = ?1", CAMPAIGN_COLUMNS);
        Ok(conn
            .query_row(&sql, params![name], Self::map_campaign)
            .optional()?)
    }

    fn map_campaign(row: &rusqlite::Row) -> rusqlite::Result<Campaign> {
        Ok(Campaign {
            id: row.get(0)?,
            name: row.get(1)?,
            map_id: row.get(2)?,
            max_experiments: row.get(3)?,
            ml_facility_id: row.get(4)?,
            ml_model_status: row.get(5)?,
            goal: row.get(6)?,
            uid_node: row.get(7)?,
        })
    }

    /// Atomically read and update a campaign's ML model status.
    ///
    /// The closure sees the current campaign and returns the status to store,
    /// or `None` to leave it as is. Returns the prior status and whether a
    /// write happened.
    pub fn transition_ml_status(
        &self,
        name: &str,
        decide: impl FnOnce(&Campaign) -> Option<MlModelStatus>,
    ) -> Result<(MlModelStatus, Option<MlModelStatus>)> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let campaign =
            Self::find_campaign(&tx, name)?.ok_or_else(|| Error::not_found("Campaign", name))?;
        let prior = campaign.ml_model_status;
        let next = decide(&campaign);
        if let Some(status) = next {
            tx.execute(
                "UPDATE campaign SET ml_model_status = ?1 WHERE id = ?2",
                params![status, campaign.id],
            )?;
        }
        tx.commit()?;
        Ok((prior, next))
    }

    /// Set the ML model status unconditionally, returning the prior one
    pub fn set_ml_status(&self, name: &str, status: MlModelStatus) -> Result<MlModelStatus> {
        let (prior, _) = self.transition_ml_status(name, |_| Some(status))?;
        Ok(prior)
    }

    /// Point a campaign at a different ML facility.
    ///
    /// A changed facility invalidates the model, so the status drops back to
    /// Untrained.
    pub fn set_campaign_ml_facility(&self, name: &str, ml_facility_id: Option<i64>) -> Result<Campaign> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut campaign =
            Self::find_campaign(&tx, name)?.ok_or_else(|| Error::not_found("Campaign", name))?;
        if campaign.ml_facility_id != ml_facility_id {
            campaign.ml_facility_id = ml_facility_id;
            campaign.ml_model_status = MlModelStatus::Untrained;
            tx.execute(
                "UPDATE campaign SET ml_facility_id = ?1, ml_model_status = ?2 WHERE id = ?3",
                params![ml_facility_id, campaign.ml_model_status, campaign.id],
            )?;
        }
        tx.commit()?;
        Ok(campaign)
    }

    pub fn count_experiments(&self, campaign_id: i64) -> Result<i64> {
        let conn = self.lock()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM experiment WHERE campaign_id = ?1",
            params![campaign_id],
            |row| row.get(0),
        )?)
    }

    pub fn list_experiments(&self, campaign_id: i64) -> Result<Vec<Experiment>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM experiment e WHERE e.campaign_id = ?1 ORDER BY e.id",
            EXPERIMENT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let experiments = stmt
            .query_map(params![campaign_id], Self::map_experiment)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(experiments)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Experiments
    // ─────────────────────────────────────────────────────────────────────────

    /// Create an experiment with its input values, stages and output slots.
    ///
    /// Runs in one transaction: a duplicate name or repeated input template
    /// fails with a conflict and leaves nothing behind.
    pub fn create_experiment(&self, new: &NewExperiment) -> Result<Experiment> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let map_id: i64 = tx
            .query_row(
                "SELECT map_id FROM campaign WHERE id = ?1",
                params![new.campaign_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::not_found("Campaign", new.campaign_id.to_string()))?;

        tx.execute(
            "INSERT INTO experiment (campaign_id, name, status) VALUES (?1, ?2, ?3)",
            params![new.campaign_id, new.name, ExperimentStatus::Proposed],
        )?;
        let experiment_id = tx.last_insert_rowid();

        for (input_id, value_request) in &new.inputs {
            let belongs: Option<i64> = tx
                .query_row(
                    "SELECT id FROM map_input WHERE id = ?1 AND map_id = ?2",
                    params![input_id, map_id],
                    |row| row.get(0),
                )
                .optional()?;
            if belongs.is_none() {
                return Err(Error::validation(format!(
                    "Input template {} is not part of this campaign's MAP",
                    input_id
                )));
            }
            tx.execute(
                "INSERT INTO input_value (experiment_id, input_id, value_request)
                 VALUES (?1, ?2, ?3)",
                params![experiment_id, input_id, value_request],
            )?;
        }

        tx.execute(
            "INSERT INTO stage (experiment_id, map_stage_id, status)
             SELECT ?1, id, ?2 FROM map_stage WHERE map_id = ?3 ORDER BY id",
            params![experiment_id, StageStatus::Proposed, map_id],
        )?;
        tx.execute(
            "INSERT INTO output_value (experiment_id, output_id)
             SELECT ?1, id FROM map_output WHERE map_id = ?2 ORDER BY id",
            params![experiment_id, map_id],
        )?;

        let sql = format!("SELECT {} FROM experiment e WHERE e.id = ?1", EXPERIMENT_COLUMNS);
        let experiment = tx.query_row(&sql, params![experiment_id], Self::map_experiment)?;
        tx.commit()?;
        Ok(experiment)
    }

    pub fn get_experiment(&self, campaign: &str, name: &str) -> Result<Option<Experiment>> {
        let conn = self.lock()?;
        Self::find_experiment(&conn, campaign, name)
    }

    /// Get an experiment or fail with not-found
    pub fn require_experiment(&self, campaign: &str, name: &str) -> Result<Experiment> {
        self.get_experiment(campaign, name)?
            .ok_or_else(|| Error::not_found("Experiment", format!("{}/{}", campaign, name)))
    }

    fn find_experiment(conn: &Connection, campaign: &str, name: &str) -> Result<Option<Experiment>> {
        let sql = format!(
            "SELECT {} FROM experiment e
             JOIN campaign c ON c.id = e.campaign_id
             WHERE c.name = ?1 AND e.name = ?2",
            EXPERIMENT_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![campaign, name], Self::map_experiment)
            .optional()?)
    }

    fn map_experiment(row: &rusqlite::Row) -> rusqlite::Result<Experiment> {
        Ok(Experiment {
            id: row.get(0)?,
            campaign_id: row.get(1)?,
            name: row.get(2)?,
            status: row.get(3)?,
            facility_id: row.get(4)?,
            facility_expid: row.get(5)?,
            start_time: from_millis(row.get(6)?),
            end_time: from_millis(row.get(7)?),
        })
    }

    /// Atomic read-modify-write of an experiment's status and timestamps.
    ///
    /// The closure runs with the row freshly read under the lock; if it
    /// fails, nothing is written. Facility binding is not writable here,
    /// see [`Database::bind_facility`].
    pub fn modify_experiment<R>(
        &self,
        campaign: &str,
        name: &str,
        f: impl FnOnce(&mut Experiment) -> Result<R>,
    ) -> Result<(Experiment, R)> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut experiment = Self::find_experiment(&tx, campaign, name)?
            .ok_or_else(|| Error::not_found("Experiment", format!("{}/{}", campaign, name)))?;
        let out = f(&mut experiment)?;
        tx.execute(
            "UPDATE experiment SET status = ?1, start_time = ?2, end_time = ?3 WHERE id = ?4",
            params![
                experiment.status,
                to_millis(experiment.start_time),
                to_millis(experiment.end_time),
                experiment.id
            ],
        )?;
        tx.commit()?;
        Ok((experiment, out))
    }

    /// Record the facility that accepted an experiment and mark it NotStarted.
    ///
    /// The binding is written once; a second bind fails with a conflict.
    pub fn bind_facility(
        &self,
        campaign: &str,
        name: &str,
        facility_id: i64,
        facility_expid: &str,
    ) -> Result<Experiment> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut experiment = Self::find_experiment(&tx, campaign, name)?
            .ok_or_else(|| Error::not_found("Experiment", format!("{}/{}", campaign, name)))?;
        if experiment.is_placed() {
            return Err(Error::conflict(format!(
                "Experiment {}/{} is already bound to a facility",
                campaign, name
            )));
        }

        apply_status(&mut experiment, ExperimentStatus::NotStarted, None);
        experiment.facility_id = Some(facility_id);
        experiment.facility_expid = Some(facility_expid.to_string());

        let updated = tx.execute(
            "UPDATE experiment
             SET facility_id = ?1, facility_expid = ?2, status = ?3, start_time = ?4, end_time = ?5
             WHERE id = ?6 AND facility_id IS NULL",
            params![
                facility_id,
                facility_expid,
                experiment.status,
                to_millis(experiment.start_time),
                to_millis(experiment.end_time),
                experiment.id
            ],
        )?;
        if updated == 0 {
            return Err(Error::conflict(format!(
                "Experiment {}/{} is already bound to a facility",
                campaign, name
            )));
        }
        tx.commit()?;
        Ok(experiment)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Stages
    // ─────────────────────────────────────────────────────────────────────────

    pub fn list_stages(&self, experiment_id: i64) -> Result<Vec<Stage>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM stage s
             JOIN map_stage ms ON ms.id = s.map_stage_id
             WHERE s.experiment_id = ?1 ORDER BY ms.id",
            STAGE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let stages = stmt
            .query_map(params![experiment_id], Self::map_stage)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(stages)
    }

    pub fn get_stage(&self, campaign: &str, experiment: &str, stage: &str) -> Result<Option<Stage>> {
        let conn = self.lock()?;
        Self::find_stage(&conn, campaign, experiment, stage)
    }

    /// Get a stage or fail with not-found
    pub fn require_stage(&self, campaign: &str, experiment: &str, stage: &str) -> Result<Stage> {
        self.get_stage(campaign, experiment, stage)?.ok_or_else(|| {
            Error::not_found("Stage", format!("{}/{}/{}", campaign, experiment, stage))
        })
    }

    fn find_stage(
        conn: &Connection,
        campaign: &str,
        experiment: &str,
        stage: &str,
    ) -> Result<Option<Stage>> {
        let sql = format!(
            "SELECT {} FROM stage s
             JOIN map_stage ms ON ms.id = s.map_stage_id
             JOIN experiment e ON e.id = s.experiment_id
             JOIN campaign c ON c.id = e.campaign_id
             WHERE c.name = ?1 AND e.name = ?2 AND ms.name = ?3",
            STAGE_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![campaign, experiment, stage], Self::map_stage)
            .optional()?)
    }

    fn map_stage(row: &rusqlite::Row) -> rusqlite::Result<Stage> {
        Ok(Stage {
            id: row.get(0)?,
            experiment_id: row.get(1)?,
            map_stage_id: row.get(2)?,
            name: row.get(3)?,
            status: row.get(4)?,
            start_time: from_millis(row.get(5)?),
            end_time: from_millis(row.get(6)?),
        })
    }

    /// Atomic read-modify-write of a stage's status and timestamps
    pub fn modify_stage<R>(
        &self,
        campaign: &str,
        experiment: &str,
        stage: &str,
        f: impl FnOnce(&mut Stage) -> Result<R>,
    ) -> Result<(Stage, R)> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut row = Self::find_stage(&tx, campaign, experiment, stage)?.ok_or_else(|| {
            Error::not_found("Stage", format!("{}/{}/{}", campaign, experiment, stage))
        })?;
        let out = f(&mut row)?;
        tx.execute(
            "UPDATE stage SET status = ?1, start_time = ?2, end_time = ?3 WHERE id = ?4",
            params![
                row.status,
                to_millis(row.start_time),
                to_millis(row.end_time),
                row.id
            ],
        )?;
        tx.commit()?;
        Ok((row, out))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Input / Output Values
    // ─────────────────────────────────────────────────────────────────────────

    /// Create one input value. A second value for the same template conflicts.
    pub fn create_input_value(
        &self,
        experiment_id: i64,
        input_id: i64,
        value_request: f64,
    ) -> Result<InputValue> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO input_value (experiment_id, input_id, value_request) VALUES (?1, ?2, ?3)",
            params![experiment_id, input_id, value_request],
        )?;
        let id = conn.last_insert_rowid();
        Ok(conn.query_row(
            "SELECT iv.id, iv.experiment_id, iv.input_id, mi.name, mi.for_stage,
                    iv.value_request, iv.value_actual
             FROM input_value iv JOIN map_input mi ON mi.id = iv.input_id
             WHERE iv.id = ?1",
            params![id],
            Self::map_input_value,
        )?)
    }

    pub fn list_input_values(&self, experiment_id: i64) -> Result<Vec<InputValue>> {
        let conn = self.lock()?;
        Self::query_input_values(&conn, experiment_id)
    }

    fn query_input_values(conn: &Connection, experiment_id: i64) -> Result<Vec<InputValue>> {
        let mut stmt = conn.prepare(
            "SELECT iv.id, iv.experiment_id, iv.input_id, mi.name, mi.for_stage,
                    iv.value_request, iv.value_actual
             FROM input_value iv JOIN map_input mi ON mi.id = iv.input_id
             WHERE iv.experiment_id = ?1 ORDER BY mi.id",
        )?;
        let values = stmt
            .query_map(params![experiment_id], Self::map_input_value)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(values)
    }

    fn map_input_value(row: &rusqlite::Row) -> rusqlite::Result<InputValue> {
        Ok(InputValue {
            id: row.get(0)?,
            experiment_id: row.get(1)?,
            input_id: row.get(2)?,
            name: row.get(3)?,
            for_stage: row.get(4)?,
            value_request: row.get(5)?,
            value_actual: row.get(6)?,
        })
    }

    /// Record the measured value of an input
    pub fn set_input_actual(&self, experiment_id: i64, input_name: &str, value: f64) -> Result<InputValue> {
        let conn = self.lock()?;
        let id: i64 = conn
            .query_row(
                "SELECT iv.id FROM input_value iv JOIN map_input mi ON mi.id = iv.input_id
                 WHERE iv.experiment_id = ?1 AND mi.name = ?2",
                params![experiment_id, input_name],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::not_found("InputValue", input_name))?;
        conn.execute(
            "UPDATE input_value SET value_actual = ?1 WHERE id = ?2",
            params![value, id],
        )?;
        Ok(conn.query_row(
            "SELECT iv.id, iv.experiment_id, iv.input_id, mi.name, mi.for_stage,
                    iv.value_request, iv.value_actual
             FROM input_value iv JOIN map_input mi ON mi.id = iv.input_id
             WHERE iv.id = ?1",
            params![id],
            Self::map_input_value,
        )?)
    }

    pub fn list_output_values(&self, experiment_id: i64) -> Result<Vec<OutputValue>> {
        let conn = self.lock()?;
        Self::query_output_values(&conn, experiment_id)
    }

    fn query_output_values(conn: &Connection, experiment_id: i64) -> Result<Vec<OutputValue>> {
        let mut stmt = conn.prepare(
            "SELECT ov.id, ov.experiment_id, ov.output_id, mo.name, mo.from_stage, ov.value
             FROM output_value ov JOIN map_output mo ON mo.id = ov.output_id
             WHERE ov.experiment_id = ?1 ORDER BY mo.id",
        )?;
        let values = stmt
            .query_map(params![experiment_id], |row| {
                Ok(OutputValue {
                    id: row.get(0)?,
                    experiment_id: row.get(1)?,
                    output_id: row.get(2)?,
                    name: row.get(3)?,
                    from_stage: row.get(4)?,
                    value: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(values)
    }

    /// Write output measurements by name, creating missing rows.
    ///
    /// Every name must be an output of the experiment's MAP. An unknown name
    /// fails the whole batch with a validation error and nothing is written.
    pub fn record_outputs(&self, experiment_id: i64, entries: &[(String, f64)]) -> Result<Vec<OutputValue>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let map_id: i64 = tx
            .query_row(
                "SELECT c.map_id FROM experiment e JOIN campaign c ON c.id = e.campaign_id
                 WHERE e.id = ?1",
                params![experiment_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::not_found("Experiment", experiment_id.to_string()))?;

        for (name, value) in entries {
            let output_id: i64 = tx
                .query_row(
                    "SELECT id FROM map_output WHERE map_id = ?1 AND name = ?2",
                    params![map_id, name],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| Error::validation(format!("Unknown output '{}'", name)))?;
            tx.execute(
                "INSERT INTO output_value (experiment_id, output_id, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT (experiment_id, output_id) DO UPDATE SET value = excluded.value",
                params![experiment_id, output_id, value],
            )?;
        }

        let values = Self::query_output_values(&tx, experiment_id)?;
        tx.commit()?;
        Ok(values)
    }

    /// Inputs without an actual value and outputs without a value.
    ///
    /// With a `stage` template id the scope narrows to inputs consumed by and
    /// outputs produced by that stage.
    pub fn pending_values(&self, experiment_id: i64, stage: Option<i64>) -> Result<PendingValues> {
        let conn = self.lock()?;
        Self::query_pending(&conn, experiment_id, stage)
    }

    fn query_pending(conn: &Connection, experiment_id: i64, stage: Option<i64>) -> Result<PendingValues> {
        let in_scope = |template_stage: Option<i64>| stage.is_none() || template_stage == stage;
        let inputs = Self::query_input_values(conn, experiment_id)?
            .into_iter()
            .filter(|v| v.value_actual.is_none() && in_scope(v.for_stage))
            .collect();
        let outputs = Self::query_output_values(conn, experiment_id)?
            .into_iter()
            .filter(|v| v.value.is_none() && in_scope(v.from_stage))
            .collect();
        Ok(PendingValues { inputs, outputs })
    }

    /// Fill pending values from a facility results mapping.
    ///
    /// Only rows that are still unset and have a matching name are written.
    /// Returns what remains pending afterwards.
    pub fn fill_pending(
        &self,
        experiment_id: i64,
        stage: Option<i64>,
        results: &HashMap<String, f64>,
    ) -> Result<PendingValues> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let pending = Self::query_pending(&tx, experiment_id, stage)?;

        for input in &pending.inputs {
            if let Some(value) = results.get(&input.name) {
                tx.execute(
                    "UPDATE input_value SET value_actual = ?1 WHERE id = ?2 AND value_actual IS NULL",
                    params![value, input.id],
                )?;
            }
        }
        for output in &pending.outputs {
            if let Some(value) = results.get(&output.name) {
                tx.execute(
                    "UPDATE output_value SET value = ?1 WHERE id = ?2 AND value IS NULL",
                    params![value, output.id],
                )?;
            }
        }

        let remaining = Self::query_pending(&tx, experiment_id, stage)?;
        tx.commit()?;
        Ok(remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fixtures::Fixture;
    use crate::status::apply_raw_status;
    use chrono::{TimeZone, Utc};

    fn setup() -> (Database, Fixture) {
        let db = Database::open_in_memory().unwrap();
        let fixture = Fixture::install(&db).unwrap();
        (db, fixture)
    }

    #[test]
    fn test_create_experiment_fans_out() {
        let (db, fx) = setup();
        let exp = fx.propose(&db, "Manual 1").unwrap();

        assert_eq!(exp.status, ExperimentStatus::Proposed);
        assert!(exp.facility_id.is_none());

        let stages = db.list_stages(exp.id).unwrap();
        assert_eq!(
            stages.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            vec!["mix", "measure"]
        );
        assert!(stages.iter().all(|s| s.status == StageStatus::Proposed));

        let inputs = db.list_input_values(exp.id).unwrap();
        assert_eq!(inputs.len(), 2);
        assert!(inputs.iter().all(|i| i.value_actual.is_none()));

        let outputs = db.list_output_values(exp.id).unwrap();
        assert_eq!(outputs.len(), 2);
        assert!(outputs.iter().all(|o| o.value.is_none()));
    }

    #[test]
    fn test_duplicate_experiment_name_conflicts_without_partial_write() {
        let (db, fx) = setup();
        fx.propose(&db, "Manual 1").unwrap();
        let err = fx.propose(&db, "Manual 1").unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(db.count_experiments(fx.campaign.id).unwrap(), 1);
    }

    #[test]
    fn test_second_input_value_conflicts() {
        let (db, fx) = setup();
        let exp = fx.propose(&db, "Manual 1").unwrap();
        let before = db.list_input_values(exp.id).unwrap();

        let err = db
            .create_input_value(exp.id, fx.temperature.id, 75.0)
            .unwrap_err();
        assert!(err.is_conflict());

        let after = db.list_input_values(exp.id).unwrap();
        assert_eq!(after.len(), before.len());
        assert_eq!(after[0].value_request, before[0].value_request);
    }

    #[test]
    fn test_modify_experiment_is_atomic() {
        let (db, fx) = setup();
        fx.propose(&db, "Manual 1").unwrap();

        let err = db
            .modify_experiment("camp", "Manual 1", |exp| {
                apply_raw_status(exp, "Garbage", None).map(|_| ())
            })
            .unwrap_err();
        assert!(err.is_validation());
        let exp = db.require_experiment("camp", "Manual 1").unwrap();
        assert_eq!(exp.status, ExperimentStatus::Proposed);

        let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let (exp, t) = db
            .modify_experiment("camp", "Manual 1", |exp| {
                apply_raw_status(exp, "Running", Some(at))
            })
            .unwrap();
        assert!(t.started);
        assert_eq!(exp.start_time, Some(at));

        let stored = db.require_experiment("camp", "Manual 1").unwrap();
        assert_eq!(stored.status, ExperimentStatus::Running);
        assert_eq!(stored.start_time, Some(at));
    }

    #[test]
    fn test_missing_experiment_is_not_found() {
        let (db, _) = setup();
        let err = db
            .modify_experiment("camp", "nope", |_| Ok(()))
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(db.get_stage("camp", "nope", "mix").unwrap().is_none());
    }

    #[test]
    fn test_bind_facility_once() {
        let (db, fx) = setup();
        fx.propose(&db, "Manual 1").unwrap();

        let exp = db
            .bind_facility("camp", "Manual 1", fx.beta.id, "42")
            .unwrap();
        assert_eq!(exp.status, ExperimentStatus::NotStarted);
        assert_eq!(exp.facility_id, Some(fx.beta.id));
        assert_eq!(exp.facility_expid.as_deref(), Some("42"));

        let err = db
            .bind_facility("camp", "Manual 1", fx.alpha.id, "7")
            .unwrap_err();
        assert!(err.is_conflict());
        let stored = db.require_experiment("camp", "Manual 1").unwrap();
        assert_eq!(stored.facility_id, Some(fx.beta.id));
        assert_eq!(stored.facility_expid.as_deref(), Some("42"));
    }

    #[test]
    fn test_record_outputs_rejects_unknown_name() {
        let (db, fx) = setup();
        let exp = fx.propose(&db, "Manual 1").unwrap();
        db.record_outputs(exp.id, &[("yield".to_string(), 0.5)])
            .unwrap();

        let err = db
            .record_outputs(
                exp.id,
                &[("purity".to_string(), 0.9), ("bogus".to_string(), 1.0)],
            )
            .unwrap_err();
        assert!(err.is_validation());

        let outputs = db.list_output_values(exp.id).unwrap();
        assert_eq!(outputs.len(), 2);
        let by_name: HashMap<_, _> = outputs.iter().map(|o| (o.name.as_str(), o.value)).collect();
        assert_eq!(by_name["yield"], Some(0.5));
        assert_eq!(by_name["purity"], None);
    }

    #[test]
    fn test_set_input_actual() {
        let (db, fx) = setup();
        let exp = fx.propose(&db, "Manual 1").unwrap();
        let value = db.set_input_actual(exp.id, "temperature", 41.5).unwrap();
        assert_eq!(value.value_actual, Some(41.5));
        assert!(db.set_input_actual(exp.id, "pressure", 1.0).unwrap_err().is_not_found());
    }

    #[test]
    fn test_pending_values_scoped_by_stage() {
        let (db, fx) = setup();
        let exp = fx.propose(&db, "Manual 1").unwrap();

        let all = db.pending_values(exp.id, None).unwrap();
        assert_eq!(all.len(), 4);

        let measure = db.pending_values(exp.id, Some(fx.measure.id)).unwrap();
        assert_eq!(measure.inputs.len(), 1);
        assert_eq!(measure.inputs[0].name, "flow_rate");
        assert_eq!(measure.outputs.len(), 1);
        assert_eq!(measure.outputs[0].name, "yield");
    }

    #[test]
    fn test_fill_pending_writes_only_unset_rows() {
        let (db, fx) = setup();
        let exp = fx.propose(&db, "Manual 1").unwrap();
        db.record_outputs(exp.id, &[("yield".to_string(), 0.25)])
            .unwrap();

        let results = HashMap::from([
            ("yield".to_string(), 0.99),
            ("temperature".to_string(), 40.0),
            ("unrelated".to_string(), 1.0),
        ]);
        let remaining = db.fill_pending(exp.id, None, &results).unwrap();
        assert_eq!(remaining.len(), 2);

        let outputs = db.list_output_values(exp.id).unwrap();
        let yield_value = outputs.iter().find(|o| o.name == "yield").unwrap();
        assert_eq!(yield_value.value, Some(0.25));
        let inputs = db.list_input_values(exp.id).unwrap();
        assert_eq!(inputs[0].value_actual, Some(40.0));
    }

    #[test]
    fn test_ml_status_transitions() {
        let (db, fx) = setup();
        assert_eq!(fx.campaign.ml_model_status, MlModelStatus::Untrained);
        assert_eq!(fx.campaign.uid_node.len(), 12);

        let (prior, next) = db
            .transition_ml_status("camp", |c| {
                c.ml_model_status
                    .needs_training()
                    .then_some(MlModelStatus::Running)
            })
            .unwrap();
        assert_eq!(prior, MlModelStatus::Untrained);
        assert_eq!(next, Some(MlModelStatus::Running));

        let (_, next) = db
            .transition_ml_status("camp", |c| {
                c.ml_model_status
                    .needs_training()
                    .then_some(MlModelStatus::Running)
            })
            .unwrap();
        assert_eq!(next, None);
    }

    #[test]
    fn test_changing_ml_facility_resets_status() {
        let (db, fx) = setup();
        db.set_ml_status("camp", MlModelStatus::Trained).unwrap();

        let same = db
            .set_campaign_ml_facility("camp", fx.campaign.ml_facility_id)
            .unwrap();
        assert_eq!(same.ml_model_status, MlModelStatus::Trained);

        let other = db
            .create_ml_facility(&NewMlFacility {
                name: "other".into(),
                location: "http://other.test".into(),
                train_script: "train.sh".into(),
                probe_script: "probe.sh".into(),
            })
            .unwrap();
        let changed = db.set_campaign_ml_facility("camp", Some(other.id)).unwrap();
        assert_eq!(changed.ml_model_status, MlModelStatus::Untrained);
        assert_eq!(
            db.require_campaign("camp").unwrap().ml_model_status,
            MlModelStatus::Untrained
        );
    }

    #[test]
    fn test_campaign_name_unique() {
        let (db, fx) = setup();
        let err = db
            .create_campaign(&NewCampaign {
                name: "camp".into(),
                map_id: fx.map.id,
                max_experiments: 1,
                ml_facility_id: None,
                goal: None,
            })
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_open_path_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.db");
        {
            let db = Database::open_path(&path).unwrap();
            db.create_map("persisted").unwrap();
        }
        let db = Database::open_path(&path).unwrap();
        let err = db.create_map("persisted").unwrap_err();
        assert!(err.is_conflict());
        db.ping().unwrap();
    }
}
