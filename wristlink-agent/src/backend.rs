//! Backend client for the telemetry service
//!
//! Two calls: fetch the monitoring mode, and post a reading or location
//! sample in exchange for a haptic command. Transport failures on posts are
//! retried internally with the unbounded post policy, re-issuing the same
//! payload: at-least-once delivery against backend instability, at the cost
//! of possible duplicate posts when the backend is slow rather than
//! unreachable.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::identity::{DeviceIdentity, UNKNOWN_ANDROID, UNKNOWN_USER, UNKNOWN_WATCH};
use crate::protocol::{HapticCommand, MonitoringMode, Reading};
use crate::retry::{RetryPolicy, RetryState};

/// Location payload produced in celestial modes, independently of the
/// device link.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationSample {
    pub lat: f64,
    pub lon: f64,
    pub identity: DeviceIdentity,
}

#[derive(Debug, Clone, Error)]
pub enum NetworkError {
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("backend returned HTTP {0}")]
    Status(u16),
    #[error("monitoring type missing or Unknown")]
    UnknownMode,
    #[error("invalid response body: {0}")]
    InvalidBody(String),
}

impl NetworkError {
    /// Transport-level failures are the ones the post path retries.
    fn is_transport(&self) -> bool {
        matches!(
            self,
            NetworkError::Timeout | NetworkError::Transport(_) | NetworkError::Status(_)
        )
    }
}

fn classify(err: reqwest::Error) -> NetworkError {
    if err.is_timeout() {
        NetworkError::Timeout
    } else if err.is_decode() {
        NetworkError::InvalidBody(err.to_string())
    } else {
        NetworkError::Transport(err.to_string())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LocationBody<'a> {
    lat: f64,
    lon: f64,
    user_id: &'a str,
    smart_watch_id: &'a str,
    android_id: &'a str,
}

#[derive(Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    post_retry: RetryPolicy,
}

impl BackendClient {
    pub fn new(base_url: &str, request_timeout: Duration, post_retry: RetryPolicy) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build backend HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            post_retry,
        })
    }

    /// Single request/response exchange. A response whose mode field is
    /// absent or equals the literal `Unknown` is an error, not a result.
    /// Retrying is the orchestrator's responsibility.
    pub async fn fetch_mode(&self) -> Result<MonitoringMode, NetworkError> {
        let url = format!("{}/get-monitoring-config", self.base_url);
        let response = self.http.get(&url).send().await.map_err(classify)?;
        if !response.status().is_success() {
            return Err(NetworkError::Status(response.status().as_u16()));
        }
        let body: serde_json::Value = response.json().await.map_err(classify)?;
        debug!(%body, "monitoring config received");

        let mode = body
            .get("monitoringType")
            .and_then(|v| v.as_str())
            .map(MonitoringMode::parse)
            .unwrap_or(MonitoringMode::Unknown);
        if mode == MonitoringMode::Unknown {
            return Err(NetworkError::UnknownMode);
        }
        Ok(mode)
    }

    /// Post a decoded heart-rate reading; the body is the raw decoded
    /// key/value map with identity fields already recovered.
    pub async fn post_heart_rate(&self, reading: &Reading) -> Result<HapticCommand, NetworkError> {
        let url = format!("{}/heartRate", self.base_url);
        self.post_with_retry(&url, &reading.raw).await
    }

    /// Post a location sample to the sun or moon endpoint depending on the
    /// active celestial mode.
    pub async fn post_location(
        &self,
        sample: &LocationSample,
        mode: MonitoringMode,
    ) -> Result<HapticCommand, NetworkError> {
        let path = match mode {
            MonitoringMode::SunAzimuth => "/sun-data",
            MonitoringMode::MoonAzimuth => "/moon-data",
            other => {
                error!(%other, "location post requested for a non-celestial mode");
                return Err(NetworkError::UnknownMode);
            }
        };
        let body = LocationBody {
            lat: sample.lat,
            lon: sample.lon,
            user_id: sample.identity.user_id.as_wire(UNKNOWN_USER),
            smart_watch_id: sample.identity.watch_id.as_wire(UNKNOWN_WATCH),
            android_id: sample.identity.android_id.as_wire(UNKNOWN_ANDROID),
        };
        let url = format!("{}{}", self.base_url, path);
        self.post_with_retry(&url, &body).await
    }

    async fn post_with_retry<B: Serialize>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<HapticCommand, NetworkError> {
        let mut state = RetryState::default();
        loop {
            match self.try_post(url, body).await {
                Ok(cmd) => {
                    if state.attempt > 0 {
                        info!(attempts = state.attempt + 1, %url, "backend accepted payload after retries");
                    }
                    return Ok(cmd);
                }
                Err(err) if err.is_transport() => {
                    state.record_failure();
                    if !state.should_retry(&self.post_retry) {
                        error!(%err, %url, "backend post abandoned by retry policy");
                        return Err(err);
                    }
                    warn!(%err, attempt = state.attempt, %url, "backend post failed, retrying");
                    tokio::time::sleep(self.post_retry.next_delay(state.attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_post<B: Serialize>(&self, url: &str, body: &B) -> Result<HapticCommand, NetworkError> {
        let response = self.http.post(url).json(body).send().await.map_err(classify)?;
        if !response.status().is_success() {
            return Err(NetworkError::Status(response.status().as_u16()));
        }
        let body: serde_json::Value = response.json().await.map_err(classify)?;
        if let Some(message) = body.get("message").and_then(|m| m.as_str()) {
            debug!(%message, "backend message");
        }
        serde_json::from_value(body).map_err(|e| NetworkError::InvalidBody(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdField;
    use crate::protocol::{decode_line, IdentityHints};
    use wristlink_devkit::backend_stub::StubBackend;

    fn client(stub: &StubBackend) -> BackendClient {
        BackendClient::new(
            &stub.base_url(),
            Duration::from_secs(2),
            RetryPolicy::unbounded(Duration::from_millis(20)),
        )
        .unwrap()
    }

    fn sample_reading() -> Reading {
        decode_line(
            "MonitoringType:HeartRate,Value:72,AndroidID:50,UserID:7,SmartWatchID:3",
            &IdentityHints::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn fetch_mode_parses_known_modes() {
        let stub = StubBackend::start().await.unwrap();
        stub.set_mode("SunAzimuth");
        assert_eq!(client(&stub).fetch_mode().await.unwrap(), MonitoringMode::SunAzimuth);
    }

    #[tokio::test]
    async fn unknown_mode_is_an_error() {
        let stub = StubBackend::start().await.unwrap();
        stub.set_mode("Unknown");
        assert!(matches!(
            client(&stub).fetch_mode().await,
            Err(NetworkError::UnknownMode)
        ));

        stub.set_mode_response(serde_json::json!({}));
        assert!(matches!(
            client(&stub).fetch_mode().await,
            Err(NetworkError::UnknownMode)
        ));
    }

    #[tokio::test]
    async fn fetch_mode_surfaces_server_errors_without_retrying() {
        let stub = StubBackend::start().await.unwrap();
        stub.set_mode("HeartRate");
        stub.fail_next_mode_fetches(1);
        assert!(matches!(
            client(&stub).fetch_mode().await,
            Err(NetworkError::Status(500))
        ));
        assert_eq!(stub.mode_fetch_count(), 1);
    }

    #[tokio::test]
    async fn heart_rate_posts_are_retried_until_accepted() {
        let stub = StubBackend::start().await.unwrap();
        stub.set_haptic_response(serde_json::json!({
            "pulses": 3, "intensity": 2, "duration": 250, "interval": 500
        }));
        stub.fail_next_posts(2);

        let cmd = client(&stub).post_heart_rate(&sample_reading()).await.unwrap();
        assert_eq!(cmd.pulses, 3);
        assert_eq!(stub.post_count(), 3);

        let posts = stub.heart_posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0]["Value"], "72");
        assert_eq!(posts[0]["AndroidID"], "50");
    }

    #[tokio::test]
    async fn location_posts_route_by_mode_and_carry_identifiers() {
        let stub = StubBackend::start().await.unwrap();
        stub.set_haptic_response(serde_json::json!({ "message": "ok", "pulses": 0 }));

        let sample = LocationSample {
            lat: 48.85,
            lon: 2.35,
            identity: DeviceIdentity {
                android_id: IdField::Known("50".into()),
                user_id: IdField::Known("7".into()),
                watch_id: IdField::Known("3".into()),
            },
        };
        let cmd = client(&stub)
            .post_location(&sample, MonitoringMode::MoonAzimuth)
            .await
            .unwrap();
        assert_eq!(cmd, HapticCommand { pulses: 0, ..Default::default() });

        let posts = stub.moon_posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0]["lat"], 48.85);
        assert_eq!(posts[0]["userId"], "7");
        assert_eq!(posts[0]["smartWatchId"], "3");
        assert_eq!(posts[0]["androidId"], "50");
        assert!(stub.sun_posts().is_empty());
    }
}
