//! Workload run-time estimation
//!
//! The estimate comes from an external inference service behind the
//! [`DurationEstimator`] trait, so a local model or a cache can stand in for it.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

use super::prompts::{TIME_ANALYSIS_SYS_PROMPT, run_time_prompt};
use super::retry::RetryPolicy;
use crate::api::http::{HttpSecurityConfig, SecureHttpClient};
use crate::error::UpstreamError;

const INFERENCE: &str = "inference";

/// Estimates how many hours `workload` runs on the described hardware
#[async_trait]
pub trait DurationEstimator: Send + Sync {
    async fn estimate(
        &self,
        workload: &str,
        throughput_flops: f64,
        max_power_watts: u32,
    ) -> Result<f64, UpstreamError>;
}

/// Parse the model's reply. Anything but a single non-negative finite
/// number is an error.
pub fn parse_hours(reply: &str) -> Result<f64, UpstreamError> {
    let text = reply.trim();
    let hours = text.parse::<f64>().map_err(|_| UpstreamError::Malformed {
        service: INFERENCE,
        message: format!("expected a number of hours, got {:?}", truncate(text, 64)),
    })?;

    if !hours.is_finite() || hours < 0.0 {
        return Err(UpstreamError::Malformed {
            service: INFERENCE,
            message: format!("estimate out of range: {}", hours),
        });
    }

    Ok(hours)
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// OpenAI-compatible chat completions endpoint
    pub completions_url: String,
    pub api_key: String,
    pub model: String,
    pub retry: RetryPolicy,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// Asks a chat-completions model for the run time
pub struct LlmDurationEstimator {
    http: SecureHttpClient,
    config: InferenceConfig,
}

impl LlmDurationEstimator {
    pub fn new(config: InferenceConfig, http: &HttpSecurityConfig) -> Result<Self> {
        Ok(Self {
            http: SecureHttpClient::new(INFERENCE, http.clone())?,
            config,
        })
    }
}

#[async_trait]
impl DurationEstimator for LlmDurationEstimator {
    async fn estimate(
        &self,
        workload: &str,
        throughput_flops: f64,
        max_power_watts: u32,
    ) -> Result<f64, UpstreamError> {
        let prompt = run_time_prompt(workload, throughput_flops, max_power_watts);
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: TIME_ANALYSIS_SYS_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            temperature: 0.0,
        };

        let response: ChatResponse = self
            .config
            .retry
            .run("run-time estimate", || {
                self.http.post_json(
                    &self.config.completions_url,
                    Some(self.config.api_key.as_str()),
                    &request,
                )
            })
            .await?;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| UpstreamError::Malformed {
                service: INFERENCE,
                message: "response has no message content".to_string(),
            })?;

        let hours = parse_hours(&content)?;
        debug!(
            flops = throughput_flops,
            watts = max_power_watts,
            "Estimated run time {} h",
            hours
        );
        Ok(hours)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EstimateKey {
    workload_digest: [u8; 32],
    throughput_bits: u64,
    max_power_watts: u32,
}

/// Memoizes estimates per (workload digest, hardware). Failures are not cached.
pub struct CachedDurationEstimator {
    inner: Arc<dyn DurationEstimator>,
    cache: DashMap<EstimateKey, f64>,
}

impl CachedDurationEstimator {
    pub fn new(inner: Arc<dyn DurationEstimator>) -> Self {
        Self {
            inner,
            cache: DashMap::new(),
        }
    }

    fn key(workload: &str, throughput_flops: f64, max_power_watts: u32) -> EstimateKey {
        EstimateKey {
            workload_digest: Sha256::digest(workload.as_bytes()).into(),
            throughput_bits: throughput_flops.to_bits(),
            max_power_watts,
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[async_trait]
impl DurationEstimator for CachedDurationEstimator {
    async fn estimate(
        &self,
        workload: &str,
        throughput_flops: f64,
        max_power_watts: u32,
    ) -> Result<f64, UpstreamError> {
        let key = Self::key(workload, throughput_flops, max_power_watts);
        if let Some(hours) = self.cache.get(&key) {
            return Ok(*hours);
        }

        let hours = self
            .inner
            .estimate(workload, throughput_flops, max_power_watts)
            .await?;
        self.cache.insert(key, hours);
        Ok(hours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, http::HeaderMap, routing::post};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_parse_hours() {
        assert_eq!(parse_hours("1.5").unwrap(), 1.5);
        assert_eq!(parse_hours("  0.25\n").unwrap(), 0.25);
        assert_eq!(parse_hours("3").unwrap(), 3.0);

        assert!(parse_hours("about two hours").is_err());
        assert!(parse_hours("").is_err());
        assert!(parse_hours("-1").is_err());
        assert!(parse_hours("NaN").is_err());
        assert!(parse_hours("inf").is_err());
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    async fn estimator_for(reply: &'static str) -> LlmDurationEstimator {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(move |headers: HeaderMap, Json(body): Json<serde_json::Value>| async move {
                assert_eq!(
                    headers.get("authorization").and_then(|v| v.to_str().ok()),
                    Some("Bearer inference-key")
                );
                assert_eq!(body["messages"][0]["role"], "system");
                assert!(
                    body["messages"][1]["content"]
                        .as_str()
                        .unwrap_or_default()
                        .contains("GPU max power consumption: 300")
                );
                Json(serde_json::json!({
                    "choices": [{ "message": { "role": "assistant", "content": reply } }]
                }))
            }),
        );
        let base = serve(app).await;

        LlmDurationEstimator::new(
            InferenceConfig {
                completions_url: format!("{}/v1/chat/completions", base),
                api_key: "inference-key".to_string(),
                model: "gemini-2.0-flash".to_string(),
                retry: RetryPolicy::no_retry(),
            },
            &HttpSecurityConfig {
                require_https: false,
                timeout_secs: 5,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_estimate_parses_reply() {
        let estimator = estimator_for("2.75").await;
        let hours = estimator.estimate("import torch", 1.0e13, 300).await.unwrap();
        assert_eq!(hours, 2.75);
    }

    #[tokio::test]
    async fn test_non_numeric_reply_is_an_error() {
        let estimator = estimator_for("It depends on the dataset size.").await;
        let result = estimator.estimate("import torch", 1.0e13, 300).await;
        assert!(matches!(result, Err(UpstreamError::Malformed { .. })));
    }

    struct Counting {
        calls: AtomicU32,
    }

    #[async_trait]
    impl DurationEstimator for Counting {
        async fn estimate(&self, _: &str, flops: f64, _: u32) -> Result<f64, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(1.0e13 / flops)
        }
    }

    #[tokio::test]
    async fn test_cache_is_keyed_by_workload_and_hardware() {
        let inner = Arc::new(Counting {
            calls: AtomicU32::new(0),
        });
        let cached = CachedDurationEstimator::new(inner.clone());

        assert_eq!(cached.estimate("job a", 1.0e13, 300).await.unwrap(), 1.0);
        assert_eq!(cached.estimate("job a", 1.0e13, 300).await.unwrap(), 1.0);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        assert_eq!(cached.estimate("job a", 2.0e13, 300).await.unwrap(), 0.5);
        cached.estimate("job b", 1.0e13, 300).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
        assert_eq!(cached.len(), 3);
    }
}
