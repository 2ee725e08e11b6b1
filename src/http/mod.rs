// Provider transport
// Blocking ureq calls moved onto tokio's blocking pool, with failures sorted into
// transient and permanent causes.


use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

/// Failure of a single call to an external provider
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("request timed out")]
    Timeout,

    #[error("rate limited by provider (HTTP 429)")]
    RateLimited,

    #[error("network error: {0}")]
    Network(String),

    #[error("server error: HTTP {0}")]
    Server(u16),

    #[error("client error: HTTP {0}")]
    Client(u16),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Timeouts, throttling, transport failures and 5xx responses are worth retrying
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::RateLimited | Self::Network(_) | Self::Server(_)
        )
    }
}

impl From<ureq::Error> for ProviderError {
    fn from(error: ureq::Error) -> Self {
        match error {
            ureq::Error::StatusCode(429) => Self::RateLimited,
            ureq::Error::StatusCode(status) if status >= 500 => Self::Server(status),
            ureq::Error::StatusCode(status) => Self::Client(status),
            ureq::Error::Timeout(_) => Self::Timeout,
            ureq::Error::ConnectionFailed | ureq::Error::HostNotFound | ureq::Error::Io(_) => {
                Self::Network(error.to_string())
            }
            other => Self::InvalidResponse(other.to_string()),
        }
    }
}

/// Build a ureq agent whose every request is bounded by `timeout`
#[inline]
pub fn agent_with_timeout(timeout: Duration) -> ureq::Agent {
    ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .build()
        .into()
}

/// POST a JSON body and return the response text
///
/// The request runs on the blocking pool so the async caller can abandon it
/// (for example through `tokio::time::timeout`) without stalling the runtime.
#[inline]
pub async fn post_json(
    agent: &ureq::Agent,
    url: &str,
    headers: &[(&'static str, String)],
    body: String,
) -> Result<String, ProviderError> {
    let agent = agent.clone();
    let url = url.to_string();
    let headers = headers.to_vec();

    debug!("POST {} ({} bytes)", url, body.len());

    tokio::task::spawn_blocking(move || {
        let mut request = agent
            .post(url.as_str())
            .header("Content-Type", "application/json");
        for (name, value) in &headers {
            request = request.header(*name, value.as_str());
        }
        request
            .send(&body)
            .and_then(|mut resp| resp.body_mut().read_to_string())
            .map_err(|e| {
                let error = ProviderError::from(e);
                warn!("POST {} failed: {}", url, error);
                error
            })
    })
    .await
    .map_err(|e| ProviderError::Network(format!("request task failed: {}", e)))?
}

/// GET a URL and return the response text
#[inline]
pub async fn get_text(agent: &ureq::Agent, url: &str) -> Result<String, ProviderError> {
    let agent = agent.clone();
    let url = url.to_string();

    debug!("GET {}", url);

    tokio::task::spawn_blocking(move || {
        agent
            .get(url.as_str())
            .call()
            .and_then(|mut resp| resp.body_mut().read_to_string())
            .map_err(ProviderError::from)
    })
    .await
    .map_err(|e| ProviderError::Network(format!("request task failed: {}", e)))?
}

/// Bound a provider future by `timeout`, turning expiry into [`ProviderError::Timeout`]
///
/// Expiry drops the inner future, which is how in-flight calls are cancelled.
#[inline]
pub async fn with_timeout<T, F>(timeout: Duration, call: F) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => {
            warn!("Provider call exceeded {:?}", timeout);
            Err(ProviderError::Timeout)
        }
    }
}
