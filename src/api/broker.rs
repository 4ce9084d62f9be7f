//! Broker HTTP endpoints
//!
//! Endpoints:
//!   POST /gpu_info            -> Register provider capability
//!   POST /api/compute/add     -> Register provider economics
//!   POST /api/task/add        -> Submit a workload (multipart: file, latest-time, max-rate)
//!   GET  /api/compute         -> List providers
//!   GET  /api/compute/{id}    -> Get one provider
//!   GET  /api/task/{id}       -> Get one task
//!   GET  /health              -> Liveness and store counts

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Multipart, Path, State},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

use crate::broker::{
    BrokerService, CapabilityRegistration, ComputeProvider, EconomicsRegistration, ProviderId,
    SubmissionReceipt, Task, TaskId, TaskSubmission,
};
use crate::error::BrokerError;

#[derive(Clone)]
pub struct BrokerApiState {
    pub service: Arc<BrokerService>,
}

#[derive(Debug, Serialize)]
pub struct ProviderResponse {
    pub success: bool,
    pub provider: ComputeProvider,
}

#[derive(Debug, Serialize)]
pub struct ProviderListResponse {
    pub success: bool,
    pub count: usize,
    pub providers: Vec<ComputeProvider>,
}

#[derive(Debug, Serialize)]
pub struct SubmissionResponse {
    pub success: bool,
    #[serde(flatten)]
    pub receipt: SubmissionReceipt,
}

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub success: bool,
    pub task: Task,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub success: bool,
    pub status: &'static str,
    pub providers: usize,
}

pub fn create_router(state: BrokerApiState) -> Router {
    Router::new()
        .route("/gpu_info", post(register_gpu))
        .route("/gpu_info/", post(register_gpu))
        .route("/api/compute", get(list_compute))
        .route("/api/compute/add", post(add_compute))
        .route("/api/compute/add/", post(add_compute))
        .route("/api/compute/{id}", get(get_compute))
        .route("/api/task/add", post(add_task))
        .route("/api/task/add/", post(add_task))
        .route("/api/task/{id}", get(get_task))
        .route("/health", get(health))
        .with_state(state)
}

// ============================================================================
// Field coercion
// ============================================================================

/// JSON object with lenient scalar coercion: numeric fields accept numbers
/// or numeric strings, text fields accept strings or numbers.
struct Fields(Map<String, Value>);

impl Fields {
    fn parse(body: &[u8]) -> Result<Self, BrokerError> {
        match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(map)) => Ok(Self(map)),
            Ok(_) => Err(BrokerError::validation("Request body must be a JSON object")),
            Err(e) => Err(BrokerError::validation(format!("Invalid JSON body: {}", e))),
        }
    }

    fn present(&self, name: &str) -> bool {
        self.0.get(name).is_some_and(|v| !v.is_null())
    }

    fn require(&self, names: &[&str]) -> Result<(), BrokerError> {
        let missing: Vec<&str> = names
            .iter()
            .copied()
            .filter(|name| !self.present(name))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(BrokerError::validation(format!(
                "Missing fields: {}",
                missing.join(", ")
            )))
        }
    }

    fn text(&self, name: &str) -> Result<String, BrokerError> {
        match self.0.get(name) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            _ => Err(invalid(name, "a string")),
        }
    }

    fn number(&self, name: &str) -> Result<f64, BrokerError> {
        let value = match self.0.get(name) {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        value
            .filter(|v| v.is_finite())
            .ok_or_else(|| invalid(name, "a number"))
    }

    fn optional_number(&self, name: &str) -> Result<Option<f64>, BrokerError> {
        if self.present(name) {
            self.number(name).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Whole, non-negative number
    fn integer(&self, name: &str) -> Result<u64, BrokerError> {
        let value = match self.0.get(name) {
            Some(Value::Number(n)) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64)),
            Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
            _ => None,
        };
        value.ok_or_else(|| invalid(name, "a non-negative integer"))
    }

    fn u32(&self, name: &str) -> Result<u32, BrokerError> {
        u32::try_from(self.integer(name)?).map_err(|_| invalid(name, "a smaller integer"))
    }
}

fn invalid(name: &str, expected: &str) -> BrokerError {
    BrokerError::validation(format!("Invalid data format: {} must be {}", name, expected))
}

/// RFC 3339 timestamp or unix seconds
pub fn parse_latest_time(raw: &str) -> Result<DateTime<Utc>, BrokerError> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .ok_or_else(|| {
            BrokerError::validation(format!(
                "latest-time must be an RFC 3339 timestamp or unix seconds, got {:?}",
                raw
            ))
        })
}

// ============================================================================
// Handlers
// ============================================================================

/// Capability registration: `{uuid, host, auth, flops, power}`
pub async fn register_gpu(
    State(state): State<BrokerApiState>,
    body: Bytes,
) -> Result<Json<ProviderResponse>, BrokerError> {
    let fields = Fields::parse(&body)?;
    fields.require(&["uuid", "host", "auth", "flops", "power"])?;

    let registration = CapabilityRegistration {
        id: ProviderId::new(fields.text("uuid")?)?,
        endpoint: fields.text("host")?,
        credential: fields.text("auth")?,
        throughput_flops: fields.number("flops")?,
        max_power_watts: fields.u32("power")?,
    };

    let provider = state.service.register_capability(registration).await?;
    Ok(Json(ProviderResponse {
        success: true,
        provider,
    }))
}

/// Economics registration: `{uuid, rpm, zip, dpkwh?}`
pub async fn add_compute(
    State(state): State<BrokerApiState>,
    body: Bytes,
) -> Result<Json<ProviderResponse>, BrokerError> {
    let fields = Fields::parse(&body)?;
    fields.require(&["uuid", "rpm", "zip"])?;

    let registration = EconomicsRegistration {
        id: ProviderId::new(fields.text("uuid")?)?,
        min_rate_per_minute: fields.number("rpm")?,
        postal_code: fields.u32("zip")?,
        price_per_kwh: fields.optional_number("dpkwh")?,
    };

    let provider = state.service.register_economics(registration).await?;
    Ok(Json(ProviderResponse {
        success: true,
        provider,
    }))
}

/// Workload submission (multipart)
pub async fn add_task(
    State(state): State<BrokerApiState>,
    mut multipart: Multipart,
) -> Result<Json<SubmissionResponse>, BrokerError> {
    let mut workload: Option<String> = None;
    let mut latest_time: Option<String> = None;
    let mut max_rate: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| BrokerError::validation(format!("Invalid multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| BrokerError::validation(format!("Failed to read field {}: {}", name, e)))?;

        match name.as_str() {
            "file" => {
                let text = String::from_utf8(data.to_vec())
                    .map_err(|_| BrokerError::validation("file must be UTF-8 text"))?;
                workload = Some(text);
            }
            "latest-time" => latest_time = Some(String::from_utf8_lossy(&data).into_owned()),
            "max-rate" => max_rate = Some(String::from_utf8_lossy(&data).into_owned()),
            other => debug!("Ignoring multipart field {}", other),
        }
    }

    let missing: Vec<&str> = [
        ("file", workload.is_none()),
        ("latest-time", latest_time.is_none()),
    ]
    .into_iter()
    .filter_map(|(name, absent)| absent.then_some(name))
    .collect();
    if !missing.is_empty() {
        return Err(BrokerError::validation(format!(
            "Missing fields: {}",
            missing.join(", ")
        )));
    }

    let max_rate_per_minute = match max_rate.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(
            raw.parse::<f64>()
                .map_err(|_| invalid("max-rate", "a number"))?,
        ),
    };

    let submission = TaskSubmission {
        workload: workload.unwrap_or_default(),
        not_later_than: parse_latest_time(latest_time.as_deref().unwrap_or_default())?,
        max_rate_per_minute,
    };

    let receipt = state.service.submit_task(submission).await?;
    info!(
        task_id = %receipt.task_id,
        provider_id = %receipt.provider_id,
        "Task submitted"
    );

    Ok(Json(SubmissionResponse {
        success: true,
        receipt,
    }))
}

pub async fn list_compute(
    State(state): State<BrokerApiState>,
) -> Result<Json<ProviderListResponse>, BrokerError> {
    let providers = state.service.list_providers().await?;
    Ok(Json(ProviderListResponse {
        success: true,
        count: providers.len(),
        providers,
    }))
}

pub async fn get_compute(
    State(state): State<BrokerApiState>,
    Path(id): Path<String>,
) -> Result<Json<ProviderResponse>, BrokerError> {
    let provider = state.service.get_provider(&ProviderId::new(id)?).await?;
    Ok(Json(ProviderResponse {
        success: true,
        provider,
    }))
}

pub async fn get_task(
    State(state): State<BrokerApiState>,
    Path(id): Path<String>,
) -> Result<Json<TaskResponse>, BrokerError> {
    let id: TaskId = id.parse()?;
    let task = state.service.get_task(&id).await?;
    Ok(Json(TaskResponse {
        success: true,
        task,
    }))
}

pub async fn health(
    State(state): State<BrokerApiState>,
) -> Result<Json<HealthResponse>, BrokerError> {
    let providers = state.service.list_providers().await?.len();
    Ok(Json(HealthResponse {
        success: true,
        status: "ok",
        providers,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(json: &str) -> Fields {
        Fields::parse(json.as_bytes()).unwrap()
    }

    #[test]
    fn test_missing_fields_are_named() {
        let body = fields(r#"{"uuid": "gpu-1", "flops": null}"#);
        let err = body
            .require(&["uuid", "host", "auth", "flops", "power"])
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "validation error: Missing fields: host, auth, flops, power"
        );
    }

    #[test]
    fn test_numeric_strings_are_coerced() {
        let body = fields(r#"{"flops": "35.6e12", "power": "350", "zip": 2139, "uuid": 42}"#);
        assert_eq!(body.number("flops").unwrap(), 35.6e12);
        assert_eq!(body.u32("power").unwrap(), 350);
        assert_eq!(body.u32("zip").unwrap(), 2139);
        assert_eq!(body.text("uuid").unwrap(), "42");
    }

    #[test]
    fn test_bad_numbers_are_rejected() {
        let body = fields(r#"{"flops": "fast", "power": 350.5, "neg": -3, "obj": {}}"#);
        assert!(body.number("flops").is_err());
        assert!(body.integer("power").is_err());
        assert!(body.integer("neg").is_err());
        assert!(body.text("obj").is_err());
    }

    #[test]
    fn test_non_object_body() {
        assert!(Fields::parse(b"[1, 2]").is_err());
        assert!(Fields::parse(b"not json").is_err());
    }

    #[test]
    fn test_parse_latest_time() {
        let rfc = parse_latest_time("2026-10-15T12:00:00Z").unwrap();
        let unix = parse_latest_time("1792065600").unwrap();
        assert_eq!(rfc, unix);
        assert!(parse_latest_time("tomorrow").is_err());
    }
}
