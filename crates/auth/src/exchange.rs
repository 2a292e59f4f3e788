use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header;

use crate::AuthError;

#[derive(Debug, Clone)]
pub struct SessionExchangeConfig {
    pub url: String,
    pub referrer: Option<String>,
    pub timeout: Duration,
}

/// Trades a browser session credential for a signed identity token.
#[derive(Clone)]
pub struct SessionExchange {
    config: SessionExchangeConfig,
    http: reqwest::Client,
}

impl SessionExchange {
    pub fn new(config: SessionExchangeConfig) -> Result<Self, AuthError> {
        if config.url.trim().is_empty() {
            return Err(AuthError::new(
                "ERR_INVALID_CONFIG",
                "session exchange url must be non-empty",
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|_| {
                AuthError::new("ERR_INTERNAL", "failed to initialize exchange http client")
            })?;

        Ok(Self { config, http })
    }

    /// `Ok(None)` means the endpoint answered and there is no identity.
    /// Transport failures, timeouts and 5xx answers are `ERR_AUTH_UNAVAILABLE`.
    pub async fn exchange(&self, raw_credential: &str) -> Result<Option<String>, AuthError> {
        let mut request = self
            .http
            .get(&self.config.url)
            .header(header::COOKIE, format!("IAMSESSION={}", raw_credential));
        if let Some(referrer) = self.config.referrer.as_ref() {
            request = request.header(header::REFERER, referrer);
        }

        let response = request.send().await.map_err(|err| {
            tracing::warn!(timeout = err.is_timeout(), "auth.exchange_unreachable");
            AuthError::new("ERR_AUTH_UNAVAILABLE", "session exchange endpoint unreachable")
        })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            tracing::info!(status = status.as_u16(), "auth.exchange_rejected");
            return Ok(None);
        }
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), "auth.exchange_unavailable");
            return Err(AuthError::new(
                "ERR_AUTH_UNAVAILABLE",
                format!("session exchange returned {}", status.as_u16()),
            ));
        }
        if !status.is_success() {
            tracing::info!(status = status.as_u16(), "auth.exchange_rejected");
            return Ok(None);
        }

        let body = response.text().await.map_err(|_| {
            AuthError::new("ERR_AUTH_UNAVAILABLE", "failed to read session exchange body")
        })?;
        let token = body.trim();
        if token.is_empty() {
            return Ok(None);
        }
        Ok(Some(token.to_string()))
    }
}
