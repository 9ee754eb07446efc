//! In-process fakes for service and route tests.

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use map_core::auth::{ServiceToken, TokenRegistry};
use map_core::client::{ConfigEntry, CreateExperimentRequest, CreateReply, FacilityApi};
use map_core::db::MlFacility;
use map_core::db::fixtures::Fixture;
use map_core::ml::{MlAdvisor, ProbeRequest, TrainRequest};
use map_core::tasks::RecordingScheduler;
use map_core::{Database, Error, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower::ServiceExt;

use crate::config::Config;
use crate::routes::create_router;
use crate::services::{CampaignService, TaskMetrics};
use crate::state::AppState;

/// Token the fake `alpha` facility presents
pub const FACILITY_TOKEN: &str = "alpha-callback-token";

/// Scripted facility. Unscripted creation requests are declined with 404;
/// unscripted polls fail as unreachable.
#[derive(Default)]
pub struct FakeFacility {
    replies: Mutex<HashMap<String, CreateReply>>,
    status: Mutex<Option<String>>,
    results: Mutex<Option<HashMap<String, f64>>>,
    calls: Mutex<Vec<String>>,
}

impl FakeFacility {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&self, location: &str, id: &str) {
        self.replies.lock().unwrap().insert(
            location.to_string(),
            CreateReply::Created { id: id.to_string() },
        );
    }

    pub fn report_status(&self, status: &str) {
        *self.status.lock().unwrap() = Some(status.to_string());
    }

    pub fn report_results(&self, results: &[(&str, f64)]) {
        *self.results.lock().unwrap() = Some(
            results
                .iter()
                .map(|(name, value)| (name.to_string(), *value))
                .collect(),
        );
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl FacilityApi for FakeFacility {
    async fn create_experiment(
        &self,
        location: &str,
        request: &CreateExperimentRequest,
    ) -> Result<CreateReply> {
        self.record(format!("create {} {}", location, request.experiment_name));
        Ok(self
            .replies
            .lock()
            .unwrap()
            .get(location)
            .cloned()
            .unwrap_or(CreateReply::Declined { status: 404 }))
    }

    async fn push_config(
        &self,
        location: &str,
        facility_expid: &str,
        stage: &str,
        entries: &[ConfigEntry],
    ) -> Result<()> {
        let names: Vec<_> = entries.iter().map(|e| e.input_name.as_str()).collect();
        self.record(format!(
            "config {} {} {} [{}]",
            location,
            facility_expid,
            stage,
            names.join(",")
        ));
        Ok(())
    }

    async fn queue_append(&self, location: &str, facility_expid: &str) -> Result<()> {
        self.record(format!("queue {} {}", location, facility_expid));
        Ok(())
    }

    async fn poll_status(
        &self,
        location: &str,
        facility_expid: &str,
        stage: Option<&str>,
    ) -> Result<String> {
        self.record(format!(
            "status {} {} {}",
            location,
            facility_expid,
            stage.unwrap_or("-")
        ));
        self.status
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::unreachable(location, "no status scripted"))
    }

    async fn poll_results(
        &self,
        location: &str,
        facility_expid: &str,
        stage: Option<&str>,
    ) -> Result<HashMap<String, f64>> {
        self.record(format!(
            "results {} {} {}",
            location,
            facility_expid,
            stage.unwrap_or("-")
        ));
        self.results
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::unreachable(location, "no results scripted"))
    }
}

/// Records dispatched jobs; can be told to fail.
#[derive(Default)]
pub struct FakeAdvisor {
    pub trains: Mutex<Vec<TrainRequest>>,
    pub probes: Mutex<Vec<ProbeRequest>>,
    failing: AtomicBool,
}

impl FakeAdvisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self, ml: &MlFacility) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(Error::unreachable(&ml.location, "advisor down"))
        } else {
            Ok(())
        }
    }

    pub fn train_count(&self) -> usize {
        self.trains.lock().unwrap().len()
    }

    pub fn probe_count(&self) -> usize {
        self.probes.lock().unwrap().len()
    }
}

#[async_trait]
impl MlAdvisor for FakeAdvisor {
    async fn train(&self, ml: &MlFacility, request: &TrainRequest) -> Result<()> {
        self.check(ml)?;
        self.trains.lock().unwrap().push(request.clone());
        Ok(())
    }

    async fn probe(&self, ml: &MlFacility, request: &ProbeRequest) -> Result<()> {
        self.check(ml)?;
        self.probes.lock().unwrap().push(request.clone());
        Ok(())
    }
}

/// Seeded database plus fakes
pub struct Harness {
    pub db: Arc<Database>,
    pub fixture: Fixture,
    pub scheduler: Arc<RecordingScheduler>,
    pub facility: Arc<FakeFacility>,
    pub advisor: Arc<FakeAdvisor>,
}

impl Harness {
    pub fn new() -> Self {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let fixture = Fixture::install(&db).unwrap();
        Self {
            db,
            fixture,
            scheduler: Arc::new(RecordingScheduler::new()),
            facility: Arc::new(FakeFacility::new()),
            advisor: Arc::new(FakeAdvisor::new()),
        }
    }
}

impl Harness {
    /// Router over this harness, plus a valid service token
    pub fn app(&self) -> (Router, String) {
        let token = ServiceToken::generate();
        let encoded = token.encoded();
        let campaigns = Arc::new(CampaignService::new(
            self.db.clone(),
            self.scheduler.clone(),
            self.advisor.clone(),
            None,
        ));
        let state = AppState::new(
            Config::default(),
            self.db.clone(),
            TokenRegistry::new(token).with_facility("alpha", FACILITY_TOKEN),
            self.scheduler.clone(),
            campaigns,
            Arc::new(TaskMetrics::new()),
        );
        (create_router(state), encoded)
    }
}

/// Send one request and decode the JSON reply (`Null` when empty)
pub async fn send(
    app: Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        request = request.header(header::AUTHORIZATION, format!("Token {}", token));
    }
    let request = match body {
        Some(body) => request
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}
