//! Planner RPC adapter.
//!
//! The planner is an opaque peer reached over JSON-over-HTTP. The trait
//! is the seam: the cycle loop never depends on a concrete planner, and
//! the loop tests use a mock. Every call carries the configured
//! deadline, strictly shorter than the cycle delay, so a hung planner
//! costs at most one cycle.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};

use crate::protocol::{Ack, Capabilities, ClockModel, HelloRequest, HelloResponse, PlanRequest, PlanResponse};

#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    #[error("planner unavailable: {0}")]
    Unavailable(String),
    #[error("planner deadline exceeded")]
    Timeout,
    #[error("planner rejected the request: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn hello(&self, req: &HelloRequest) -> Result<HelloResponse, PlannerError>;
    async fn describe(&self) -> Result<Capabilities, PlannerError>;
    async fn set_clock_model(&self, clock: &ClockModel) -> Result<Ack, PlannerError>;
    async fn plan_cycle(&self, req: &PlanRequest) -> Result<PlanResponse, PlannerError>;
}

pub struct HttpPlanner {
    base_url: String,
    client: reqwest::Client,
}

impl HttpPlanner {
    /// Build a client against the planner endpoint. `ca` adds a PEM
    /// bundle to the trust store for private deployments.
    pub fn new(
        base_url: &str,
        timeout: Duration,
        ca: Option<&Path>,
    ) -> Result<Self, PlannerError> {
        let client = build_client(timeout, ca)
            .map_err(|e| PlannerError::Unavailable(format!("client build failed: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, PlannerError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(classify_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PlannerError::Rejected(format!("{status}: {body}")));
        }
        response
            .json::<R>()
            .await
            .map_err(|e| PlannerError::Rejected(format!("malformed response: {e}")))
    }
}

fn classify_error(e: reqwest::Error) -> PlannerError {
    if e.is_timeout() {
        PlannerError::Timeout
    } else {
        PlannerError::Unavailable(e.to_string())
    }
}

pub(crate) fn build_client(
    timeout: Duration,
    ca: Option<&Path>,
) -> Result<reqwest::Client, Box<dyn std::error::Error + Send + Sync>> {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    if let Some(path) = ca {
        let pem = std::fs::read(path)?;
        builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
    }
    Ok(builder.build()?)
}

#[async_trait]
impl Planner for HttpPlanner {
    async fn hello(&self, req: &HelloRequest) -> Result<HelloResponse, PlannerError> {
        self.post("/v1/hello", req).await
    }

    async fn describe(&self) -> Result<Capabilities, PlannerError> {
        self.post("/v1/describe", &serde_json::json!({})).await
    }

    async fn set_clock_model(&self, clock: &ClockModel) -> Result<Ack, PlannerError> {
        self.post("/v1/set_clock_model", clock).await
    }

    async fn plan_cycle(&self, req: &PlanRequest) -> Result<PlanResponse, PlannerError> {
        self.post("/v1/plan_cycle", req).await
    }
}
