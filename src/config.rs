use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::api::http::HttpSecurityConfig;
use crate::broker::{
    DispatchConfig, InferenceConfig, RateClientConfig, RateSector, RetryPolicy, SelectorConfig,
};

/// Configuration for the sidecompute broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub server: ServerConfig,
    pub security: SecurityConfig,
    /// Run-time estimation service
    pub inference: InferenceSettings,
    /// Geocoder and utility-rate services
    pub rates: RateSettings,
    /// Provider execution API
    pub dispatch: DispatchSettings,
    pub selection: SelectionSettings,
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host to bind to
    pub host: String,
    /// Server port to bind to
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Require HTTPS for external services and provider endpoints
    pub require_https: bool,
    /// Verify TLS certificates
    pub verify_certificates: bool,
    /// Enable API authentication
    pub enable_auth: bool,
    /// Accepted API keys
    #[serde(skip_serializing)]
    pub api_keys: Vec<String>,
    /// Rate limit per minute per IP
    pub rate_limit_per_minute: u32,
    /// Maximum request body size in bytes (workload uploads included)
    pub max_request_size: usize,
    /// Maximum external response size in bytes
    pub max_response_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceSettings {
    /// OpenAI-compatible chat completions URL
    pub completions_url: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
    /// Kept small, each attempt is a paid completion
    pub max_attempts: u32,
    /// Memoize estimates per workload and hardware
    pub cache: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateSettings {
    pub geocoder_url: String,
    pub rates_url: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub country: String,
    pub sector: String,
    pub timeout_secs: u64,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSettings {
    pub image: String,
    pub mode: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionSettings {
    pub max_concurrency: usize,
    pub deadline_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory workload files are written to
    pub task_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection string
    #[serde(skip_serializing)]
    pub postgres_url: String,
    /// Enable PostgreSQL (if false, uses in-memory stores)
    pub postgres_enabled: bool,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Mask client IPs and secrets in logs
    pub sanitize_logs: bool,
    /// Enable request/response logging
    pub log_requests: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            postgres_url: "postgresql://localhost:5432/sidecompute".to_string(),
            postgres_enabled: false,
            max_connections: 10,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8000,
            },
            security: SecurityConfig {
                require_https: true,
                verify_certificates: true,
                enable_auth: false,
                api_keys: Vec::new(),
                rate_limit_per_minute: 120,
                max_request_size: 5 * 1024 * 1024, // 5MB
                max_response_size: 10 * 1024 * 1024,
            },
            inference: InferenceSettings {
                completions_url:
                    "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions"
                        .to_string(),
                api_key: String::new(), // MUST be configured
                model: "gemini-2.0-flash".to_string(),
                timeout_secs: 60,
                max_attempts: 2,
                cache: true,
            },
            rates: RateSettings {
                geocoder_url: "https://nominatim.openstreetmap.org/search".to_string(),
                rates_url: "https://developer.nrel.gov/api/utility_rates/v3.json".to_string(),
                api_key: String::new(), // MUST be configured
                country: "USA".to_string(),
                sector: "residential".to_string(),
                timeout_secs: 15,
                max_attempts: 3,
            },
            dispatch: DispatchSettings {
                image: "python:3.9-ubuntu20.04".to_string(),
                mode: "query".to_string(),
                timeout_secs: 30,
            },
            selection: SelectionSettings {
                max_concurrency: 8,
                deadline_secs: 120,
            },
            storage: StorageConfig {
                task_dir: "tasks".to_string(),
            },
            database: DatabaseConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                sanitize_logs: true,
                log_requests: true,
            },
        }
    }
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => {
            let value = raw
                .trim()
                .parse()
                .with_context(|| format!("Invalid {} value", name))?;
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}

impl BrokerConfig {
    /// Load configuration from `SIDECOMPUTE_*` environment variables and validate it
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        // Server configuration
        if let Ok(host) = env::var("SIDECOMPUTE_HOST") {
            config.server.host = host;
        }
        if let Some(port) = parse_var("SIDECOMPUTE_PORT")? {
            config.server.port = port;
        }

        // Security configuration
        if let Some(require_https) = parse_var("SIDECOMPUTE_REQUIRE_HTTPS")? {
            config.security.require_https = require_https;
        }
        if let Some(verify) = parse_var("SIDECOMPUTE_VERIFY_CERTIFICATES")? {
            config.security.verify_certificates = verify;
        }
        if let Some(enable_auth) = parse_var("SIDECOMPUTE_ENABLE_AUTH")? {
            config.security.enable_auth = enable_auth;
        }
        config.security.api_keys = api_keys_from_env();
        if let Some(rate_limit) = parse_var("SIDECOMPUTE_RATE_LIMIT_PER_MINUTE")? {
            config.security.rate_limit_per_minute = rate_limit;
        }
        if let Some(max_request_size) = parse_var("SIDECOMPUTE_MAX_REQUEST_SIZE")? {
            config.security.max_request_size = max_request_size;
        }

        // Inference configuration
        if let Ok(url) = env::var("SIDECOMPUTE_INFERENCE_URL") {
            config.inference.completions_url = url;
        }
        if let Ok(key) = env::var("SIDECOMPUTE_INFERENCE_API_KEY") {
            config.inference.api_key = key;
        }
        if let Ok(model) = env::var("SIDECOMPUTE_INFERENCE_MODEL") {
            config.inference.model = model;
        }
        if let Some(timeout) = parse_var("SIDECOMPUTE_INFERENCE_TIMEOUT_SECS")? {
            config.inference.timeout_secs = timeout;
        }
        if let Some(attempts) = parse_var("SIDECOMPUTE_INFERENCE_MAX_ATTEMPTS")? {
            config.inference.max_attempts = attempts;
        }
        if let Some(cache) = parse_var("SIDECOMPUTE_INFERENCE_CACHE")? {
            config.inference.cache = cache;
        }

        // Rate lookup configuration
        if let Ok(url) = env::var("SIDECOMPUTE_GEOCODER_URL") {
            config.rates.geocoder_url = url;
        }
        if let Ok(url) = env::var("SIDECOMPUTE_RATES_URL") {
            config.rates.rates_url = url;
        }
        if let Ok(key) = env::var("SIDECOMPUTE_RATES_API_KEY") {
            config.rates.api_key = key;
        }
        if let Ok(country) = env::var("SIDECOMPUTE_RATES_COUNTRY") {
            config.rates.country = country;
        }
        if let Ok(sector) = env::var("SIDECOMPUTE_RATES_SECTOR") {
            config.rates.sector = sector;
        }
        if let Some(timeout) = parse_var("SIDECOMPUTE_RATES_TIMEOUT_SECS")? {
            config.rates.timeout_secs = timeout;
        }
        if let Some(attempts) = parse_var("SIDECOMPUTE_RATES_MAX_ATTEMPTS")? {
            config.rates.max_attempts = attempts;
        }

        // Dispatch configuration
        if let Ok(image) = env::var("SIDECOMPUTE_DISPATCH_IMAGE") {
            config.dispatch.image = image;
        }
        if let Ok(mode) = env::var("SIDECOMPUTE_DISPATCH_MODE") {
            config.dispatch.mode = mode;
        }
        if let Some(timeout) = parse_var("SIDECOMPUTE_DISPATCH_TIMEOUT_SECS")? {
            config.dispatch.timeout_secs = timeout;
        }

        // Selection configuration
        if let Some(concurrency) = parse_var("SIDECOMPUTE_SELECTION_CONCURRENCY")? {
            config.selection.max_concurrency = concurrency;
        }
        if let Some(deadline) = parse_var("SIDECOMPUTE_SELECTION_DEADLINE_SECS")? {
            config.selection.deadline_secs = deadline;
        }

        // Storage and database configuration
        if let Ok(dir) = env::var("SIDECOMPUTE_TASK_DIR") {
            config.storage.task_dir = dir;
        }
        if let Ok(url) = env::var("SIDECOMPUTE_POSTGRES_URL") {
            config.database.postgres_url = url;
        }
        if let Some(enabled) = parse_var("SIDECOMPUTE_POSTGRES_ENABLED")? {
            config.database.postgres_enabled = enabled;
        }
        if let Some(max_connections) = parse_var("SIDECOMPUTE_POSTGRES_MAX_CONNECTIONS")? {
            config.database.max_connections = max_connections;
        }

        // Logging configuration
        if let Ok(level) = env::var("SIDECOMPUTE_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Some(sanitize) = parse_var("SIDECOMPUTE_SANITIZE_LOGS")? {
            config.logging.sanitize_logs = sanitize;
        }
        if let Some(log_requests) = parse_var("SIDECOMPUTE_LOG_REQUESTS")? {
            config.logging.log_requests = log_requests;
        }

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration for security and consistency
    pub fn validate(&self) -> Result<()> {
        if self.server.host.is_empty() {
            return Err(anyhow::anyhow!("Server host cannot be empty"));
        }

        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port must be non-zero"));
        }

        if self.security.require_https {
            for (name, url) in [
                ("inference", &self.inference.completions_url),
                ("geocoder", &self.rates.geocoder_url),
                ("utility rates", &self.rates.rates_url),
            ] {
                if !url.starts_with("https://") {
                    return Err(anyhow::anyhow!(
                        "HTTPS is required but {} URL is not HTTPS: {}",
                        name,
                        url
                    ));
                }
            }
        }

        if self.inference.api_key.is_empty() {
            return Err(anyhow::anyhow!(
                "Inference API key is required (SIDECOMPUTE_INFERENCE_API_KEY)"
            ));
        }

        if self.rates.api_key.is_empty() {
            return Err(anyhow::anyhow!(
                "Utility rates API key is required (SIDECOMPUTE_RATES_API_KEY)"
            ));
        }

        self.rate_sector()?;

        for (name, secs) in [
            ("inference", self.inference.timeout_secs),
            ("rates", self.rates.timeout_secs),
            ("dispatch", self.dispatch.timeout_secs),
            ("selection deadline", self.selection.deadline_secs),
        ] {
            if secs == 0 {
                return Err(anyhow::anyhow!("{} timeout must be non-zero", name));
            }
        }

        if self.inference.max_attempts == 0 || self.rates.max_attempts == 0 {
            return Err(anyhow::anyhow!("Retry attempt budgets must be at least 1"));
        }

        if self.selection.max_concurrency == 0 {
            return Err(anyhow::anyhow!("Selection concurrency must be at least 1"));
        }

        if self.security.rate_limit_per_minute == 0 {
            return Err(anyhow::anyhow!("Rate limit must be non-zero"));
        }

        if self.security.enable_auth && self.security.api_keys.is_empty() {
            return Err(anyhow::anyhow!(
                "Authentication is enabled but no API keys are configured (SIDECOMPUTE_API_KEYS)"
            ));
        }

        if self.storage.task_dir.trim().is_empty() {
            return Err(anyhow::anyhow!("Task directory cannot be empty"));
        }

        if self.database.postgres_enabled && self.database.postgres_url.is_empty() {
            return Err(anyhow::anyhow!(
                "PostgreSQL is enabled but no connection string is set"
            ));
        }

        Ok(())
    }

    pub fn rate_sector(&self) -> Result<RateSector> {
        self.rates.sector.parse()
    }

    /// Transport settings for one external service
    pub fn http_security(&self, timeout_secs: u64) -> HttpSecurityConfig {
        HttpSecurityConfig {
            require_https: self.security.require_https,
            verify_certificates: self.security.verify_certificates,
            timeout_secs,
            max_response_size: self.security.max_response_size,
            ..Default::default()
        }
    }

    pub fn inference_client_config(&self) -> InferenceConfig {
        InferenceConfig {
            completions_url: self.inference.completions_url.clone(),
            api_key: self.inference.api_key.clone(),
            model: self.inference.model.clone(),
            retry: RetryPolicy {
                max_attempts: self.inference.max_attempts,
                ..Default::default()
            },
        }
    }

    pub fn rate_client_config(&self) -> Result<RateClientConfig> {
        Ok(RateClientConfig {
            geocoder_url: self.rates.geocoder_url.clone(),
            rates_url: self.rates.rates_url.clone(),
            rates_api_key: self.rates.api_key.clone(),
            country: self.rates.country.clone(),
            sector: self.rate_sector()?,
            retry: RetryPolicy {
                max_attempts: self.rates.max_attempts,
                ..Default::default()
            },
        })
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            image: self.dispatch.image.clone(),
            mode: self.dispatch.mode.clone(),
            timeout_secs: self.dispatch.timeout_secs,
        }
    }

    pub fn selector_config(&self) -> SelectorConfig {
        SelectorConfig {
            max_concurrency: self.selection.max_concurrency,
            deadline: Duration::from_secs(self.selection.deadline_secs),
        }
    }
}

/// API keys from `SIDECOMPUTE_API_KEY` and the comma-separated `SIDECOMPUTE_API_KEYS`
fn api_keys_from_env() -> Vec<String> {
    let mut keys = Vec::new();

    if let Ok(key) = env::var("SIDECOMPUTE_API_KEY")
        && !key.trim().is_empty()
    {
        keys.push(key.trim().to_string());
    }

    if let Ok(extra_keys) = env::var("SIDECOMPUTE_API_KEYS") {
        keys.extend(
            extra_keys
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string),
        );
    }

    if keys.is_empty() {
        warn!("No API keys configured");
    }

    keys
}

/// Mask a secret for logging, keeping a few characters at each end
pub fn sanitize_for_logging(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}***{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> BrokerConfig {
        let mut config = BrokerConfig::default();
        config.inference.api_key = "inference-key-0123456789".to_string();
        config.rates.api_key = "nrel-key-0123456789".to_string();
        config
    }

    #[test]
    fn test_sanitize_for_logging() {
        assert_eq!(sanitize_for_logging("short"), "*****");
        assert_eq!(sanitize_for_logging("sk-abcdefghijkl"), "sk-a***ijkl");
    }

    #[test]
    fn test_default_config_needs_api_keys() {
        assert!(BrokerConfig::default().validate().is_err());
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_https_required_for_external_services() {
        let mut config = valid_config();
        config.rates.geocoder_url = "http://localhost:8080/search".to_string();
        assert!(config.validate().is_err());

        config.security.require_https = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_limits() {
        let mut config = valid_config();
        config.selection.max_concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.dispatch.timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.rates.sector = "agricultural".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_auth_requires_keys() {
        let mut config = valid_config();
        config.security.enable_auth = true;
        assert!(config.validate().is_err());

        config.security.api_keys = vec!["client-key".to_string()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_component_configs() {
        let config = valid_config();
        assert_eq!(config.inference_client_config().retry.max_attempts, 2);
        assert_eq!(config.rate_client_config().unwrap().sector, RateSector::Residential);
        assert_eq!(config.dispatch_config().image, "python:3.9-ubuntu20.04");
        assert_eq!(config.selector_config().deadline, Duration::from_secs(120));
        assert_eq!(config.http_security(7).timeout_secs, 7);
    }
}
