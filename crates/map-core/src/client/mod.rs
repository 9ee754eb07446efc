//! Client for remote MAP facilities.
//!
//! A facility executes experiments on behalf of the orchestrator. Every call
//! takes the facility's base URL (its `location`); paths follow the facility
//! API:
//!
//! | Call                   | Request                                          |
//! |------------------------|--------------------------------------------------|
//! | create experiment      | `POST {loc}/experiment/new/` → 201 `{id}`        |
//! | push stage config      | `POST {loc}/experiment/{id}/config/{stage}/`     |
//! | append to queue        | `POST {loc}/queue/append/` `{id}`                |
//! | poll status            | `GET {loc}/experiment/{id}/status[/{stage}]/`    |
//! | poll results           | `GET {loc}/experiment/{id}/results[/{stage}]/`   |
//!
//! Network failures and non-2xx replies surface as
//! [`Error::FacilityUnreachable`]. Nothing here retries; that is the task
//! engine's job.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Result;
#[cfg(feature = "client")]
use crate::error::Error;

// ─────────────────────────────────────────────────────────────────────────────
// Wire Types
// ─────────────────────────────────────────────────────────────────────────────

/// Body of `POST /experiment/new/`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateExperimentRequest {
    pub campaign_name: String,
    pub experiment_name: String,
}

/// One requested input value pushed to a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub input_name: String,
    pub input_value: f64,
}

/// Body of `POST /queue/append/`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueAppendRequest {
    pub id: String,
}

/// Reply to a creation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateReply {
    /// 201 Created with the facility's experiment id
    Created { id: String },
    /// Any other HTTP status
    Declined { status: u16 },
}

#[derive(Debug, Deserialize)]
struct CreatedBody {
    id: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: String,
}

/// Facility experiment ids may come back as numbers or strings.
fn id_to_string(id: &serde_json::Value) -> Option<String> {
    match id {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Keep the entries of a results mapping that carry a number.
///
/// Values reported as numeric strings are accepted; nulls and anything else
/// count as not yet measured.
pub fn numeric_results(raw: HashMap<String, serde_json::Value>) -> HashMap<String, f64> {
    raw.into_iter()
        .filter_map(|(name, value)| {
            let number = match &value {
                serde_json::Value::Number(n) => n.as_f64(),
                serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            number.map(|v| (name, v))
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Facility API
// ─────────────────────────────────────────────────────────────────────────────

/// Outbound calls to a remote facility.
#[async_trait]
pub trait FacilityApi: Send + Sync {
    /// Ask a facility to take an experiment
    async fn create_experiment(
        &self,
        location: &str,
        request: &CreateExperimentRequest,
    ) -> Result<CreateReply>;

    /// Push the requested inputs for one stage
    async fn push_config(
        &self,
        location: &str,
        facility_expid: &str,
        stage: &str,
        entries: &[ConfigEntry],
    ) -> Result<()>;

    /// Append an experiment to the facility's run queue
    async fn queue_append(&self, location: &str, facility_expid: &str) -> Result<()>;

    /// Current status string (code or label) reported by the facility
    async fn poll_status(
        &self,
        location: &str,
        facility_expid: &str,
        stage: Option<&str>,
    ) -> Result<String>;

    /// Measured values reported by the facility, by name
    async fn poll_results(
        &self,
        location: &str,
        facility_expid: &str,
        stage: Option<&str>,
    ) -> Result<HashMap<String, f64>>;
}

fn scoped_path(facility_expid: &str, kind: &str, stage: Option<&str>) -> String {
    match stage {
        Some(stage) => format!("/experiment/{}/{}/{}/", facility_expid, kind, stage),
        None => format!("/experiment/{}/{}/", facility_expid, kind),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Implementation
// ─────────────────────────────────────────────────────────────────────────────

/// reqwest-backed facility client
#[cfg(feature = "client")]
#[derive(Clone)]
pub struct HttpFacilityClient {
    client: reqwest::Client,
    /// Token sent as `Authorization: Token <t>`
    token: Option<String>,
}

#[cfg(feature = "client")]
impl HttpFacilityClient {
    /// Create a client with a per-request timeout
    pub fn new(timeout: std::time::Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Other(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            token: None,
        })
    }

    /// Set the token presented to facilities
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn url(location: &str, path: &str) -> String {
        format!("{}{}", location.trim_end_matches('/'), path)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        tracing::debug!(%method, url, "facility request");
        let req = self.client.request(method, url);
        match &self.token {
            Some(token) => req.header("Authorization", format!("Token {}", token)),
            None => req,
        }
    }

    async fn send(&self, url: &str, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let resp = req.send().await.map_err(|e| Error::unreachable(url, e))?;
        let status = resp.status();
        if status.is_success() {
            Ok(resp)
        } else {
            Err(Error::unreachable(url, format!("HTTP {}", status)))
        }
    }
}

#[cfg(feature = "client")]
#[async_trait]
impl FacilityApi for HttpFacilityClient {
    async fn create_experiment(
        &self,
        location: &str,
        request: &CreateExperimentRequest,
    ) -> Result<CreateReply> {
        let url = Self::url(location, "/experiment/new/");
        let resp = self
            .request(reqwest::Method::POST, &url)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::unreachable(&url, e))?;

        if resp.status() != reqwest::StatusCode::CREATED {
            return Ok(CreateReply::Declined {
                status: resp.status().as_u16(),
            });
        }

        let body: CreatedBody = resp
            .json()
            .await
            .map_err(|e| Error::unreachable(&url, format!("bad creation reply: {}", e)))?;
        let id = id_to_string(&body.id)
            .ok_or_else(|| Error::unreachable(&url, "creation reply has no usable id"))?;
        Ok(CreateReply::Created { id })
    }

    async fn push_config(
        &self,
        location: &str,
        facility_expid: &str,
        stage: &str,
        entries: &[ConfigEntry],
    ) -> Result<()> {
        let url = Self::url(
            location,
            &format!("/experiment/{}/config/{}/", facility_expid, stage),
        );
        let req = self.request(reqwest::Method::POST, &url).json(entries);
        self.send(&url, req).await?;
        Ok(())
    }

    async fn queue_append(&self, location: &str, facility_expid: &str) -> Result<()> {
        let url = Self::url(location, "/queue/append/");
        let req = self
            .request(reqwest::Method::POST, &url)
            .json(&QueueAppendRequest {
                id: facility_expid.to_string(),
            });
        self.send(&url, req).await?;
        Ok(())
    }

    async fn poll_status(
        &self,
        location: &str,
        facility_expid: &str,
        stage: Option<&str>,
    ) -> Result<String> {
        let url = Self::url(location, &scoped_path(facility_expid, "status", stage));
        let req = self.request(reqwest::Method::GET, &url);
        let body: StatusBody = self
            .send(&url, req)
            .await?
            .json()
            .await
            .map_err(|e| Error::unreachable(&url, format!("bad status reply: {}", e)))?;
        Ok(body.status)
    }

    async fn poll_results(
        &self,
        location: &str,
        facility_expid: &str,
        stage: Option<&str>,
    ) -> Result<HashMap<String, f64>> {
        let url = Self::url(location, &scoped_path(facility_expid, "results", stage));
        let req = self.request(reqwest::Method::GET, &url);
        let raw: HashMap<String, serde_json::Value> = self
            .send(&url, req)
            .await?
            .json()
            .await
            .map_err(|e| Error::unreachable(&url, format!("bad results reply: {}", e)))?;
        Ok(numeric_results(raw))
    }
}
