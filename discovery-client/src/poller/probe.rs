use std::time::Duration;
use anyhow::{Context, Result};
use reqwest::Client;
use serde::de::DeserializeOwned;
use shared::protocol::{HEALTH_PATH, SERVER_HEALTH_PATH};
use shared::types::{Address, HealthDocument, HealthStatus, ServerHealthDocument};
use thiserror::Error;

/// Longest error body kept in a poll result
const MAX_ERROR_BODY: usize = 256;

/// Why a single health endpoint did not produce a document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ProbeError {
    /// Transport failures mean nothing answered; anything else means the
    /// robot answered but is not healthy.
    pub fn health_status(&self) -> HealthStatus {
        match self {
            ProbeError::Timeout | ProbeError::Connection(_) => HealthStatus::Unreachable,
            ProbeError::Status { .. } | ProbeError::Malformed(_) => HealthStatus::NotOk,
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProbeError::Timeout
        } else {
            ProbeError::Connection(err.to_string())
        }
    }
}

/// One poll of one address. Exactly one of these is produced per address
/// per poll cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct PollResult {
    pub ip: String,
    pub port: u16,
    pub health: Result<HealthDocument, ProbeError>,
    pub server_health: Result<ServerHealthDocument, ProbeError>,
}

impl PollResult {
    pub fn address(&self) -> Address {
        Address::new(self.ip.clone(), self.port)
    }

    pub fn ok(&self) -> bool {
        self.health.is_ok()
    }

    /// Robot identity reported by whichever endpoint answered
    pub fn reported_name(&self) -> Option<&str> {
        match (&self.health, &self.server_health) {
            (Ok(health), _) => Some(health.name.as_str()),
            (_, Ok(server)) => Some(server.name.as_str()),
            _ => None,
        }
    }

    pub fn advertised_model(&self) -> Option<&str> {
        self.health.as_ref().ok()?.robot_model.as_deref()
    }
}

/// Issues bounded-timeout health requests against candidate addresses.
#[derive(Clone)]
pub struct Prober {
    http: Client,
}

impl Prober {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { http })
    }

    /// Probe both health endpoints of `address` concurrently.
    pub async fn probe(&self, address: Address) -> PollResult {
        let base = address.base_url();
        let health_url = format!("{}{}", base, HEALTH_PATH);
        let server_url = format!("{}{}", base, SERVER_HEALTH_PATH);

        let (health, server_health) = tokio::join!(
            self.fetch::<HealthDocument>(&health_url),
            self.fetch::<ServerHealthDocument>(&server_url),
        );

        let health = health.and_then(|doc| {
            if doc.name.trim().is_empty() {
                Err(ProbeError::Malformed("health document has an empty name".to_string()))
            } else {
                Ok(doc)
            }
        });
        let server_health = server_health.and_then(|doc| {
            if doc.name.trim().is_empty() {
                Err(ProbeError::Malformed("server health document has an empty name".to_string()))
            } else {
                Ok(doc)
            }
        });

        if let Err(ProbeError::Malformed(reason)) = &health {
            tracing::warn!("Dropping malformed health document from {}: {}", address, reason);
        }

        PollResult {
            ip: address.ip,
            port: address.port,
            health,
            server_health,
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, url: &str) -> Result<T, ProbeError> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(ProbeError::from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ProbeError::Status {
                status: status.as_u16(),
                body: read_error_body(resp).await,
            });
        }

        let bytes = resp.bytes().await.map_err(ProbeError::from_reqwest)?;
        serde_json::from_slice(&bytes).map_err(|e| ProbeError::Malformed(e.to_string()))
    }
}

/// At most `MAX_ERROR_BODY` bytes of the body; the rest is never read.
async fn read_error_body(mut resp: reqwest::Response) -> String {
    let mut buf = Vec::new();
    while buf.len() < MAX_ERROR_BODY {
        match resp.chunk().await {
            Ok(Some(chunk)) => buf.extend_from_slice(&chunk),
            _ => break,
        }
    }
    buf.truncate(MAX_ERROR_BODY);

    let mut body = String::from_utf8_lossy(&buf).into_owned();
    truncate(&mut body, MAX_ERROR_BODY);
    body
}

fn truncate(s: &mut String, max: usize) {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Json, Router};
    use serde_json::json;

    async fn serve(app: Router) -> Address {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Address::new("127.0.0.1", port)
    }

    #[tokio::test]
    async fn test_probe_healthy_robot() {
        let app = Router::new()
            .route("/health", get(|| async {
                Json(json!({
                    "name": "robotA",
                    "api_version": "7.0.0",
                    "robot_model": "OT-3 Standard",
                }))
            }))
            .route("/server/update/health", get(|| async {
                Json(json!({ "name": "robotA", "capabilities": { "systemUpdate": "/server/update" } }))
            }));
        let address = serve(app).await;

        let prober = Prober::new(Duration::from_secs(2)).unwrap();
        let result = prober.probe(address.clone()).await;

        assert!(result.ok());
        assert_eq!(result.address(), address);
        assert_eq!(result.reported_name(), Some("robotA"));
        assert_eq!(result.advertised_model(), Some("OT-3 Standard"));
        assert_eq!(result.server_health.unwrap().capabilities.len(), 1);
    }

    #[tokio::test]
    async fn test_probe_error_status_is_not_ok() {
        let app = Router::new()
            .route("/health", get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "booting") }));
        let address = serve(app).await;

        let prober = Prober::new(Duration::from_secs(2)).unwrap();
        let result = prober.probe(address).await;

        assert!(!result.ok());
        let err = result.health.unwrap_err();
        assert_eq!(
            err,
            ProbeError::Status { status: 503, body: "booting".to_string() }
        );
        assert_eq!(err.health_status(), HealthStatus::NotOk);
        // Missing route answers 404
        assert!(matches!(result.server_health, Err(ProbeError::Status { status: 404, .. })));
    }

    #[tokio::test]
    async fn test_error_body_is_capped() {
        let app = Router::new().route("/health", get(|| async {
            (StatusCode::INTERNAL_SERVER_ERROR, "x".repeat(1 << 20))
        }));
        let address = serve(app).await;

        let prober = Prober::new(Duration::from_secs(2)).unwrap();
        let result = prober.probe(address).await;

        match result.health {
            Err(ProbeError::Status { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body.len(), MAX_ERROR_BODY);
                assert!(body.chars().all(|c| c == 'x'));
            }
            other => panic!("expected status error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_probe_malformed_document() {
        let app = Router::new()
            .route("/health", get(|| async { Json(json!({ "api_version": "7.0.0" })) }))
            .route("/server/update/health", get(|| async { Json(json!({ "name": "" })) }));
        let address = serve(app).await;

        let prober = Prober::new(Duration::from_secs(2)).unwrap();
        let result = prober.probe(address).await;

        assert!(matches!(result.health, Err(ProbeError::Malformed(_))));
        assert!(matches!(result.server_health, Err(ProbeError::Malformed(_))));
        assert_eq!(result.reported_name(), None);
    }

    #[tokio::test]
    async fn test_probe_unreachable() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let prober = Prober::new(Duration::from_secs(2)).unwrap();
        let result = prober.probe(Address::new("127.0.0.1", port)).await;

        let err = result.health.unwrap_err();
        assert_eq!(err.health_status(), HealthStatus::Unreachable);
    }

    #[tokio::test]
    async fn test_probe_times_out() {
        let app = Router::new().route("/health", get(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            "late"
        }));
        let address = serve(app).await;

        let prober = Prober::new(Duration::from_millis(200)).unwrap();
        let result = prober.probe(address).await;

        assert_eq!(result.health.unwrap_err(), ProbeError::Timeout);
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        let mut s = "ééé".to_string();
        truncate(&mut s, 3);
        assert_eq!(s, "é");
    }
}
