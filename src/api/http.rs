use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::UpstreamError;

/// Transport settings for calls to one external service
#[derive(Debug, Clone)]
pub struct HttpSecurityConfig {
    /// Require HTTPS for all external communications
    pub require_https: bool,
    /// Verify TLS certificates
    pub verify_certificates: bool,
    /// Whole-request timeout in seconds
    pub timeout_secs: u64,
    /// Maximum response size in bytes
    pub max_response_size: usize,
    pub user_agent: String,
}

impl Default for HttpSecurityConfig {
    fn default() -> Self {
        Self {
            require_https: true,
            verify_certificates: true,
            timeout_secs: 30,
            max_response_size: 10 * 1024 * 1024, // 10MB max
            user_agent: "sidecompute/0.1".to_string(),
        }
    }
}

impl HttpSecurityConfig {
    pub fn with_timeout(&self, timeout_secs: u64) -> Self {
        Self {
            timeout_secs,
            ..self.clone()
        }
    }
}

/// JSON-over-HTTP client that maps every failure onto [`UpstreamError`]
#[derive(Clone)]
pub struct SecureHttpClient {
    client: Client,
    config: HttpSecurityConfig,
    service: &'static str,
}

impl SecureHttpClient {
    /// Create a client for `service` (the name shows up in errors and logs)
    pub fn new(service: &'static str, config: HttpSecurityConfig) -> Result<Self> {
        let mut client_builder = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone());

        if config.require_https {
            client_builder = client_builder.https_only(true);
            info!("HTTPS enforcement enabled for {}", service);
        }

        if !config.verify_certificates {
            warn!(
                "TLS certificate verification disabled for {} - this is insecure!",
                service
            );
            client_builder = client_builder.danger_accept_invalid_certs(true);
        }

        let client = client_builder
            .build()
            .with_context(|| format!("Failed to create HTTP client for {}", service))?;

        Ok(Self {
            client,
            config,
            service,
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    fn validate_url(&self, url: &str) -> Result<Url, UpstreamError> {
        let parsed_url = Url::parse(url).map_err(|e| UpstreamError::Unreachable {
            service: self.service,
            message: format!("invalid URL {}: {}", url, e),
        })?;

        if self.config.require_https && parsed_url.scheme() != "https" {
            return Err(UpstreamError::Unreachable {
                service: self.service,
                message: format!(
                    "HTTPS is required but URL uses {}: {}",
                    parsed_url.scheme(),
                    url
                ),
            });
        }

        if parsed_url.host_str().is_none() {
            return Err(UpstreamError::Unreachable {
                service: self.service,
                message: format!("URL must have a valid host: {}", url),
            });
        }

        Ok(parsed_url)
    }

    /// GET `url` with `query` parameters and decode the JSON body
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, UpstreamError> {
        let validated_url = self.validate_url(url)?;
        debug!("GET {} ({})", validated_url.path(), self.service);

        let request = self
            .client
            .get(validated_url)
            .query(query)
            .header("Accept", "application/json");

        self.execute(request).await
    }

    /// POST a JSON body to `url`, optionally with a bearer token, and decode the reply
    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: &str,
        bearer: Option<&str>,
        body: &B,
    ) -> Result<T, UpstreamError> {
        let validated_url = self.validate_url(url)?;
        debug!("POST {} ({})", validated_url.path(), self.service);

        let mut request = self
            .client
            .post(validated_url)
            .header("Accept", "application/json")
            .json(body);

        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        self.execute(request).await
    }

    async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, UpstreamError> {
        let response = request
            .send()
            .await
            .map_err(|e| UpstreamError::from_reqwest(self.service, self.timeout(), e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Status {
                service: self.service,
                status: status.as_u16(),
            });
        }

        let content_length = response.content_length().unwrap_or(0);
        if content_length > self.config.max_response_size as u64 {
            return Err(UpstreamError::Malformed {
                service: self.service,
                message: format!(
                    "response too large: {} bytes (max: {})",
                    content_length, self.config.max_response_size
                ),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| UpstreamError::from_reqwest(self.service, self.timeout(), e))?;

        if body.len() > self.config.max_response_size {
            return Err(UpstreamError::Malformed {
                service: self.service,
                message: format!(
                    "response body too large: {} bytes (max: {})",
                    body.len(),
                    self.config.max_response_size
                ),
            });
        }

        serde_json::from_slice(&body).map_err(|e| UpstreamError::Malformed {
            service: self.service,
            message: e.to_string(),
        })
    }
}
