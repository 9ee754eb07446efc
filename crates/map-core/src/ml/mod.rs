//! Client for the ML advisor facility.
//!
//! The advisor trains a campaign model from completed results and, when
//! probed, proposes the next experiment by calling back into the
//! orchestrator's propose endpoint. Dispatching a job only needs a 2xx reply;
//! the outcome arrives later through the trained/failed callbacks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::db::{Campaign, MlFacility};
use crate::error::Result;
#[cfg(feature = "client")]
use crate::error::Error;

/// Body of `POST {ml}/train/`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainRequest {
    pub campaign_name: String,
    pub model_name: String,
    pub script: String,
    /// Where the advisor reports back, when configured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

/// Body of `POST {ml}/probe/`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeRequest {
    pub campaign_name: String,
    pub model_name: String,
    pub script: String,
    pub num_samples: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

impl TrainRequest {
    pub fn for_campaign(campaign: &Campaign, ml: &MlFacility, callback_url: Option<String>) -> Self {
        Self {
            campaign_name: campaign.name.clone(),
            model_name: campaign.uid_node.clone(),
            script: ml.train_script.clone(),
            callback_url,
        }
    }
}

impl ProbeRequest {
    /// A probe always asks for a single proposal
    pub fn for_campaign(campaign: &Campaign, ml: &MlFacility, callback_url: Option<String>) -> Self {
        Self {
            campaign_name: campaign.name.clone(),
            model_name: campaign.uid_node.clone(),
            script: ml.probe_script.clone(),
            num_samples: 1,
            callback_url,
        }
    }
}

/// Job dispatch to an ML facility.
#[async_trait]
pub trait MlAdvisor: Send + Sync {
    async fn train(&self, ml: &MlFacility, request: &TrainRequest) -> Result<()>;
    async fn probe(&self, ml: &MlFacility, request: &ProbeRequest) -> Result<()>;
}

/// reqwest-backed ML advisor client
#[cfg(feature = "client")]
#[derive(Clone)]
pub struct HttpMlAdvisor {
    client: reqwest::Client,
}

#[cfg(feature = "client")]
impl HttpMlAdvisor {
    pub fn new(timeout: std::time::Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Other(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    async fn dispatch<B: Serialize + Sync>(&self, location: &str, job: &str, body: &B) -> Result<()> {
        let url = format!("{}/{}/", location.trim_end_matches('/'), job);
        tracing::debug!(url = %url, "dispatching ML job");
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::unreachable(&url, e))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Error::unreachable(&url, format!("HTTP {}", resp.status())))
        }
    }
}

#[cfg(feature = "client")]
#[async_trait]
impl MlAdvisor for HttpMlAdvisor {
    async fn train(&self, ml: &MlFacility, request: &TrainRequest) -> Result<()> {
        self.dispatch(&ml.location, "train", request).await
    }

    async fn probe(&self, ml: &MlFacility, request: &ProbeRequest) -> Result<()> {
        self.dispatch(&ml.location, "probe", request).await
    }
}

#[cfg(all(test, feature = "client"))]
mod tests {
    use super::*;
    use crate::status::MlModelStatus;
    use axum::{Json, Router, http::StatusCode, routing::post};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn campaign() -> Campaign {
        Campaign {
            id: 1,
            name: "camp".into(),
            map_id: 1,
            max_experiments: 3,
            ml_facility_id: Some(1),
            ml_model_status: MlModelStatus::Untrained,
            goal: None,
            uid_node: "a7b2c3d4e5f6".into(),
        }
    }

    fn facility(location: String) -> MlFacility {
        MlFacility {
            id: 1,
            name: "advisor".into(),
            location,
            train_script: "train_gp".into(),
            probe_script: "probe_gp".into(),
        }
    }

    #[test]
    fn test_requests_carry_model_and_script() {
        let ml = facility("http://ml".into());
        let train = TrainRequest::for_campaign(&campaign(), &ml, None);
        assert_eq!(train.model_name, "a7b2c3d4e5f6");
        assert_eq!(train.script, "train_gp");

        let probe = ProbeRequest::for_campaign(&campaign(), &ml, Some("http://orch/".into()));
        assert_eq!(probe.num_samples, 1);
        assert_eq!(probe.script, "probe_gp");

        let json = serde_json::to_value(&train).unwrap();
        assert!(json.get("callback_url").is_none());
    }

    #[tokio::test]
    async fn test_dispatch_train_and_probe() {
        let seen: Arc<Mutex<Vec<serde_json::Value>>> = Arc::new(Mutex::new(Vec::new()));
        let train_log = seen.clone();
        let probe_log = seen.clone();
        let app = Router::new()
            .route(
                "/train/",
                post(move |Json(body): Json<serde_json::Value>| {
                    let log = train_log.clone();
                    async move {
                        log.lock().unwrap().push(body);
                        StatusCode::ACCEPTED
                    }
                }),
            )
            .route(
                "/probe/",
                post(move |Json(body): Json<serde_json::Value>| {
                    let log = probe_log.clone();
                    async move {
                        log.lock().unwrap().push(body);
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let ml = facility(format!("http://{}", addr));
        let advisor = HttpMlAdvisor::new(Duration::from_secs(5)).unwrap();

        advisor
            .train(&ml, &TrainRequest::for_campaign(&campaign(), &ml, None))
            .await
            .unwrap();
        let err = advisor
            .probe(&ml, &ProbeRequest::for_campaign(&campaign(), &ml, None))
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0]["script"], "train_gp");
        assert_eq!(seen[1]["num_samples"], 1);
    }
}
