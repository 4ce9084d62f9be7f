//! Provider and task records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use super::cost::CostBreakdown;
use crate::error::BrokerError;

/// Opaque provider identity, chosen by the provider at registration
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
    pub fn new(id: impl Into<String>) -> Result<Self, BrokerError> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(BrokerError::validation("Provider uuid cannot be empty"));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for TaskId {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| BrokerError::validation(format!("Invalid task id: {}", s)))
    }
}

/// Normalize a provider's API endpoint. A bare `host:port` gets an
/// `https://` scheme; trailing slashes are dropped so paths can be appended.
pub fn normalize_endpoint(raw: &str, require_https: bool) -> Result<String, BrokerError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(BrokerError::validation("Provider host cannot be empty"));
    }

    let with_scheme = if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else {
        format!("https://{}", raw)
    };

    let url = Url::parse(&with_scheme)
        .map_err(|e| BrokerError::validation(format!("Invalid provider host {}: {}", raw, e)))?;

    if url.host_str().is_none() {
        return Err(BrokerError::validation(format!(
            "Provider host has no hostname: {}",
            raw
        )));
    }

    if require_https && url.scheme() != "https" {
        return Err(BrokerError::validation(format!(
            "HTTPS is required but provider host uses {}: {}",
            url.scheme(),
            raw
        )));
    }

    Ok(url.as_str().trim_end_matches('/').to_string())
}

/// Economic attributes from the second registration step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Economics {
    /// Dollars per minute the owner will not serve below
    pub min_rate_per_minute: f64,
    /// 5-digit US ZIP code
    pub postal_code: u32,
    /// Dollars per kWh, when the owner supplied it directly
    pub price_per_kwh: Option<f64>,
}

/// A registered GPU resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeProvider {
    pub id: ProviderId,
    pub endpoint: String,
    #[serde(skip_serializing, default)]
    pub credential: String,
    pub throughput_flops: f64,
    pub max_power_watts: u32,
    pub economics: Option<Economics>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ComputeProvider {
    /// Both registration steps completed
    pub fn is_eligible(&self) -> bool {
        self.economics.is_some() && self.max_power_watts > 0
    }

    pub fn apply_capability(&mut self, registration: CapabilityRegistration) {
        self.endpoint = registration.endpoint;
        self.credential = registration.credential;
        self.throughput_flops = registration.throughput_flops;
        self.max_power_watts = registration.max_power_watts;
        self.updated_at = Utc::now();
    }

    pub fn apply_economics(&mut self, registration: EconomicsRegistration) {
        self.economics = Some(Economics {
            min_rate_per_minute: registration.min_rate_per_minute,
            postal_code: registration.postal_code,
            price_per_kwh: registration.price_per_kwh,
        });
        self.updated_at = Utc::now();
    }
}

impl From<CapabilityRegistration> for ComputeProvider {
    fn from(registration: CapabilityRegistration) -> Self {
        let now = Utc::now();
        Self {
            id: registration.id,
            endpoint: registration.endpoint,
            credential: registration.credential,
            throughput_flops: registration.throughput_flops,
            max_power_watts: registration.max_power_watts,
            economics: None,
            registered_at: now,
            updated_at: now,
        }
    }
}

/// First registration step: hardware and network attributes
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityRegistration {
    pub id: ProviderId,
    pub endpoint: String,
    pub credential: String,
    pub throughput_flops: f64,
    pub max_power_watts: u32,
}

impl CapabilityRegistration {
    /// Check ranges and normalize the endpoint in place
    pub fn validate(mut self, require_https: bool) -> Result<Self, BrokerError> {
        self.endpoint = normalize_endpoint(&self.endpoint, require_https)?;

        if self.credential.trim().is_empty() {
            return Err(BrokerError::validation("Provider auth cannot be empty"));
        }
        if !self.throughput_flops.is_finite() || self.throughput_flops < 0.0 {
            return Err(BrokerError::validation(format!(
                "flops must be a non-negative number, got {}",
                self.throughput_flops
            )));
        }
        if self.max_power_watts == 0 {
            return Err(BrokerError::validation("power must be a positive number of watts"));
        }

        Ok(self)
    }
}

/// Second registration step: pricing and location
#[derive(Debug, Clone, PartialEq)]
pub struct EconomicsRegistration {
    pub id: ProviderId,
    pub min_rate_per_minute: f64,
    pub postal_code: u32,
    pub price_per_kwh: Option<f64>,
}

impl EconomicsRegistration {
    pub fn validate(self) -> Result<Self, BrokerError> {
        if !self.min_rate_per_minute.is_finite() || self.min_rate_per_minute < 0.0 {
            return Err(BrokerError::validation(format!(
                "rpm must be a non-negative number, got {}",
                self.min_rate_per_minute
            )));
        }
        if self.postal_code > 99_999 {
            return Err(BrokerError::validation(format!(
                "zip must be a 5-digit postal code, got {}",
                self.postal_code
            )));
        }
        if let Some(price) = self.price_per_kwh
            && (!price.is_finite() || price < 0.0)
        {
            return Err(BrokerError::validation(format!(
                "dpkwh must be a non-negative number, got {}",
                price
            )));
        }

        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskStatus {
    /// Persisted, dispatch not yet resolved
    Pending,
    Dispatched { session_id: String, run_id: String },
    Failed { reason: String },
}

impl TaskStatus {
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Dispatched { .. } => "dispatched",
            TaskStatus::Failed { .. } => "failed",
        }
    }
}

/// A submitted workload placed on a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub workload_path: String,
    pub provider_id: ProviderId,
    /// Unix seconds; 0 means run immediately
    pub scheduled_time: u64,
    pub not_later_than: DateTime<Utc>,
    pub estimate: CostBreakdown,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn pending(
        workload_path: String,
        provider_id: ProviderId,
        not_later_than: DateTime<Utc>,
        estimate: CostBreakdown,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::generate(),
            workload_path,
            provider_id,
            scheduled_time: 0,
            not_later_than,
            estimate,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}
