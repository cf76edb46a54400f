//! Health check module.
//!
//! One probe is a single HTTP(S) GET against a daemon's health endpoint plus
//! a parse of the response body. Services need a moment to open their port
//! after starting, so connection failures are retried with a doubling
//! backoff before the probe gives up.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::pki::Certificate;

/// Initial backoff after a connection failure.
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Once the backoff exceeds this, the service is considered down.
const BACKOFF_LIMIT: Duration = Duration::from_secs(7);

/// Health verdict emitted on a supervisor's health channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthMessage {
    /// Whether the probe succeeded.
    pub healthy: bool,
    /// Diagnostic when it did not.
    pub error: Option<String>,
}

/// Error types for health probing.
#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    /// The service never opened its port within the backoff window.
    #[error("Timeout waiting for service to come up")]
    StartupTimeout,

    /// The request itself failed.
    #[error("health check failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Probe TLS material could not be read.
    #[error("credential load failed: {0}")]
    Credentials(#[from] std::io::Error),

    /// The response body was not the expected JSON.
    #[error("JSON decode of response failed: {0}")]
    Decode(#[from] serde_json::Error),

    /// The service answered but reported itself unhealthy.
    #[error("unexpected health response: {0}")]
    Unhealthy(String),
}

/// TLS material presented during probes.
#[derive(Debug, Clone)]
pub struct ProbeTls {
    /// CA the server certificate must chain to.
    pub ca_path: PathBuf,
    /// Client certificate presented to the server.
    pub client_cert_path: PathBuf,
    /// Key matching the client certificate.
    pub client_key_path: PathBuf,
}

impl ProbeTls {
    /// Build probe material from a CA and a client certificate.
    #[must_use]
    pub fn from_certs(ca: &Certificate, client: &Certificate) -> Self {
        Self {
            ca_path: ca.cert_path.clone(),
            client_cert_path: client.cert_path.clone(),
            client_key_path: client.key_path.clone(),
        }
    }
}

/// How to decode a daemon's health response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyValidator {
    /// etcd: JSON body whose `health` field must be the string `"true"`.
    EtcdJson,
    /// kube-apiserver, controller-manager, scheduler, kubelet: plain text
    /// body that trims to `ok`.
    PlainOk,
    /// kube-proxy: JSON body with non-empty `lastUpdated` and `currentTime`.
    KubeProxyJson,
}

impl BodyValidator {
    /// Check one response body.
    ///
    /// # Errors
    ///
    /// Returns [`HealthError::Decode`] for malformed JSON and
    /// [`HealthError::Unhealthy`] when the body reports an unhealthy
    /// service.
    pub fn validate(&self, body: &[u8]) -> Result<(), HealthError> {
        match self {
            Self::EtcdJson => {
                #[derive(Deserialize)]
                struct EtcdStatus {
                    #[serde(default)]
                    health: String,
                }
                let status: EtcdStatus = serde_json::from_slice(body)?;
                if status.health == "true" {
                    Ok(())
                } else {
                    Err(HealthError::Unhealthy(format!(
                        "etcd reports health {:?}",
                        status.health
                    )))
                }
            }
            Self::PlainOk => {
                let text = String::from_utf8_lossy(body);
                let trimmed = text.trim_matches([' ', '\r', '\n']);
                if trimmed == "ok" {
                    Ok(())
                } else {
                    Err(HealthError::Unhealthy(format!("health != ok: {trimmed}")))
                }
            }
            Self::KubeProxyJson => {
                #[derive(Deserialize)]
                #[serde(rename_all = "camelCase")]
                struct KubeProxyStatus {
                    #[serde(default)]
                    last_updated: String,
                    #[serde(default)]
                    current_time: String,
                }
                let status: KubeProxyStatus = serde_json::from_slice(body)?;
                if status.last_updated.is_empty() || status.current_time.is_empty() {
                    Err(HealthError::Unhealthy(
                        "kube-proxy has not synced yet".to_string(),
                    ))
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// Run one probe and fold the outcome into a [`HealthMessage`].
pub async fn probe(
    url: &str,
    tls: Option<&ProbeTls>,
    validator: BodyValidator,
) -> HealthMessage {
    match probe_inner(url, tls, validator).await {
        Ok(()) => HealthMessage {
            healthy: true,
            error: None,
        },
        Err(err) => HealthMessage {
            healthy: false,
            error: Some(err.to_string()),
        },
    }
}

async fn probe_inner(
    url: &str,
    tls: Option<&ProbeTls>,
    validator: BodyValidator,
) -> Result<(), HealthError> {
    let client = build_client(tls)?;

    let mut wait = INITIAL_BACKOFF;
    let response = loop {
        match client.get(url).send().await {
            Ok(response) => break response,
            Err(err) if err.is_connect() => {
                // Most services need a moment to open their port.
                if wait > BACKOFF_LIMIT {
                    return Err(HealthError::StartupTimeout);
                }
                tokio::time::sleep(wait).await;
                wait *= 2;
            }
            Err(err) => return Err(err.into()),
        }
    };

    let body = response.bytes().await?;
    validator.validate(&body)
}

/// Build a one-shot HTTP client. With TLS material the configured CA is the
/// only trust root and the client certificate is presented; keep-alives are
/// disabled either way so every probe opens a fresh connection.
fn build_client(tls: Option<&ProbeTls>) -> Result<reqwest::Client, HealthError> {
    let builder = reqwest::Client::builder().pool_max_idle_per_host(0);

    let builder = if let Some(tls) = tls {
        let ca = std::fs::read(&tls.ca_path)?;
        let mut identity = std::fs::read(&tls.client_cert_path)?;
        identity.extend_from_slice(&std::fs::read(&tls.client_key_path)?);

        builder
            .use_rustls_tls()
            .add_root_certificate(reqwest::Certificate::from_pem(&ca)?)
            .identity(reqwest::Identity::from_pem(&identity)?)
    } else {
        builder
    };

    Ok(builder.build()?)
}
