//! Hardware controller RPC adapter.
//!
//! The bridge uses a narrow slice of the controller surface: session
//! configuration, keying start/stop, status, decoy profile, shutter,
//! and calibration. Telemetry streaming is a separate TCP connection
//! handled by the telemetry listener; see `telemetry::run_stream_listener`.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::planner::build_client;
use crate::protocol::{Ack, Telemetry};

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("controller unavailable: {0}")]
    Unavailable(String),
    #[error("controller deadline exceeded")]
    Timeout,
    #[error("controller rejected the command: {0}")]
    Rejected(String),
}

/// Session setup parameters for a BB84 time-bin link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigureRequest {
    pub mode: String,
    pub wavelength_nm: f64,
    pub symbol_rate_mhz: f64,
    pub divergence_urad: f64,
    pub use_spad: bool,
    pub ptp_enable: bool,
}

impl ConfigureRequest {
    /// Standard session shape; only the symbol rate varies per call.
    pub fn bb84_time_bin(symbol_rate_mhz: f64) -> Self {
        Self {
            mode: "BB84_TIME_BIN".to_string(),
            wavelength_nm: 1550.0,
            symbol_rate_mhz,
            divergence_urad: 100.0,
            use_spad: false,
            ptp_enable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigureResponse {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShutterRequest {
    pub open: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoyProfileRequest {
    pub session_id: String,
    pub mu_signal: f64,
    pub mu_decoy: f64,
    pub vacuum_prob: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRequest {
    pub kind: String,
}

#[async_trait]
pub trait Controller: Send + Sync {
    async fn configure(&self, req: &ConfigureRequest) -> Result<ConfigureResponse, ControllerError>;
    async fn start_keying(&self, session_id: &str) -> Result<Ack, ControllerError>;
    async fn stop_keying(&self, session_id: &str) -> Result<Ack, ControllerError>;
    async fn status(&self) -> Result<Telemetry, ControllerError>;
    async fn set_decoy_profile(&self, req: &DecoyProfileRequest) -> Result<Ack, ControllerError>;
    async fn set_shutter(&self, open: bool) -> Result<Ack, ControllerError>;
    async fn calibrate(&self, kind: &str) -> Result<Ack, ControllerError>;
}

pub struct HttpController {
    base_url: String,
    client: reqwest::Client,
}

impl HttpController {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        ca: Option<&Path>,
    ) -> Result<Self, ControllerError> {
        let client = build_client(timeout, ca)
            .map_err(|e| ControllerError::Unavailable(format!("client build failed: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, ControllerError>
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
            return Err(ControllerError::Rejected(format!("{status}: {body}")));
        }
        response
            .json::<R>()
            .await
            .map_err(|e| ControllerError::Rejected(format!("malformed response: {e}")))
    }
}

fn classify_error(e: reqwest::Error) -> ControllerError {
    if e.is_timeout() {
        ControllerError::Timeout
    } else {
        ControllerError::Unavailable(e.to_string())
    }
}

#[async_trait]
impl Controller for HttpController {
    async fn configure(&self, req: &ConfigureRequest) -> Result<ConfigureResponse, ControllerError> {
        self.post("/v1/configure", req).await
    }

    async fn start_keying(&self, session_id: &str) -> Result<Ack, ControllerError> {
        self.post(
            "/v1/start",
            &SessionRequest {
                session_id: session_id.to_string(),
            },
        )
        .await
    }

    async fn stop_keying(&self, session_id: &str) -> Result<Ack, ControllerError> {
        self.post(
            "/v1/stop",
            &SessionRequest {
                session_id: session_id.to_string(),
            },
        )
        .await
    }

    async fn status(&self) -> Result<Telemetry, ControllerError> {
        self.post("/v1/status", &serde_json::json!({})).await
    }

    async fn set_decoy_profile(&self, req: &DecoyProfileRequest) -> Result<Ack, ControllerError> {
        self.post("/v1/decoy_profile", req).await
    }

    async fn set_shutter(&self, open: bool) -> Result<Ack, ControllerError> {
        self.post("/v1/shutter", &ShutterRequest { open }).await
    }

    async fn calibrate(&self, kind: &str) -> Result<Ack, ControllerError> {
        self.post(
            "/v1/calibrate",
            &CalibrationRequest {
                kind: kind.to_string(),
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn controller_for(server: &MockServer) -> HttpController {
        HttpController::new(&server.uri(), Duration::from_millis(200), None).unwrap()
    }

    fn ok_ack() -> serde_json::Value {
        json!({"ok": true, "msg": "done"})
    }

    #[tokio::test]
    async fn configure_returns_the_session_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/configure"))
            .and(body_partial_json(json!({
                "mode": "BB84_TIME_BIN",
                "wavelength_nm": 1550.0
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"session_id": "sess-7"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let controller = controller_for(&server);
        let response = controller
            .configure(&ConfigureRequest::bb84_time_bin(100.0))
            .await
            .unwrap();
        assert_eq!(response.session_id, "sess-7");
    }

    #[tokio::test]
    async fn shutter_close_posts_open_false() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/shutter"))
            .and(body_json(json!({"open": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_ack()))
            .expect(1)
            .mount(&server)
            .await;

        let controller = controller_for(&server);
        let ack = controller.set_shutter(false).await.unwrap();
        assert!(ack.ok);
    }

    #[tokio::test]
    async fn start_and_stop_carry_the_session_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/start"))
            .and(body_json(json!({"session_id": "sess-7"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_ack()))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/stop"))
            .and(body_json(json!({"session_id": "sess-7"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_ack()))
            .expect(1)
            .mount(&server)
            .await;

        let controller = controller_for(&server);
        controller.start_keying("sess-7").await.unwrap();
        controller.stop_keying("sess-7").await.unwrap();
    }

    #[tokio::test]
    async fn hung_controller_is_a_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/shutter"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(ok_ack())
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let controller = controller_for(&server);
        let err = controller.set_shutter(false).await.unwrap_err();
        assert!(matches!(err, ControllerError::Timeout), "got {err}");
    }

    #[tokio::test]
    async fn rejected_command_surfaces_the_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/decoy_profile"))
            .respond_with(ResponseTemplate::new(422).set_body_string("no active session"))
            .mount(&server)
            .await;

        let controller = controller_for(&server);
        let err = controller
            .set_decoy_profile(&DecoyProfileRequest {
                session_id: "sess-7".to_string(),
                mu_signal: 0.5,
                mu_decoy: 0.08,
                vacuum_prob: 0.1,
            })
            .await
            .unwrap_err();
        match err {
            ControllerError::Rejected(msg) => assert!(msg.contains("no active session")),
            other => panic!("expected Rejected, got {other}"),
        }
    }
}
