//! Hand-off of a workload to the chosen provider's execution API
//!
//! Two round-trips: open a session, then submit the code into it. Neither is
//! retried since a duplicate submission would run the workload twice.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use url::Url;

use super::models::{ComputeProvider, TaskId};
use crate::api::http::{HttpSecurityConfig, SecureHttpClient};
use crate::error::{DispatchError, DispatchStage, UpstreamError};

const PROVIDER: &str = "provider";

/// Remote identifiers for a dispatched workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReceipt {
    pub session_id: String,
    pub run_id: String,
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(
        &self,
        provider: &ComputeProvider,
        task_id: &TaskId,
        workload: &str,
    ) -> Result<DispatchReceipt, DispatchError>;
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Container image the session runs in
    pub image: String,
    pub mode: String,
    pub timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            image: "python:3.9-ubuntu20.04".to_string(),
            mode: "query".to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OpenSessionRequest<'a> {
    image: &'a str,
    client_session_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenSessionResponse {
    sess_id: String,
}

#[derive(Debug, Serialize)]
struct SubmitRunRequest<'a> {
    code: &'a str,
    mode: &'a str,
}

#[derive(Debug, Deserialize)]
struct SubmitRunResponse {
    result: RunResult,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunResult {
    run_id: String,
}

pub struct HttpDispatcher {
    http: SecureHttpClient,
    config: DispatchConfig,
}

impl HttpDispatcher {
    pub fn new(config: DispatchConfig, http: &HttpSecurityConfig) -> Result<Self> {
        Ok(Self {
            http: SecureHttpClient::new(PROVIDER, http.with_timeout(config.timeout_secs))?,
            config,
        })
    }

    async fn open_session(
        &self,
        provider: &ComputeProvider,
        task_id: &TaskId,
    ) -> Result<String, UpstreamError> {
        let request = OpenSessionRequest {
            image: &self.config.image,
            client_session_token: task_id.to_string(),
        };
        let response: OpenSessionResponse = self
            .http
            .post_json(
                &session_url(&provider.endpoint, None)?,
                Some(provider.credential.as_str()),
                &request,
            )
            .await?;

        non_empty(response.sess_id, "sessId")
    }

    async fn submit_run(
        &self,
        provider: &ComputeProvider,
        session_id: &str,
        workload: &str,
    ) -> Result<String, UpstreamError> {
        let request = SubmitRunRequest {
            code: workload,
            mode: &self.config.mode,
        };
        let response: SubmitRunResponse = self
            .http
            .post_json(
                &session_url(&provider.endpoint, Some(session_id))?,
                Some(provider.credential.as_str()),
                &request,
            )
            .await?;

        non_empty(response.result.run_id, "result.runId")
    }
}

/// `{endpoint}/session`, or `{endpoint}/session/{id}` with `id` escaped as a
/// single path segment
fn session_url(endpoint: &str, session_id: Option<&str>) -> Result<String, UpstreamError> {
    let malformed = |message: String| UpstreamError::Malformed {
        service: PROVIDER,
        message,
    };

    if let Some(id) = session_id
        && (id == "." || id == "..")
    {
        return Err(malformed(format!("sessId {:?} is not a usable path segment", id)));
    }

    let mut url = Url::parse(endpoint)
        .map_err(|e| malformed(format!("invalid endpoint {}: {}", endpoint, e)))?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| malformed(format!("endpoint {} cannot take a path", endpoint)))?;
        segments.pop_if_empty().push("session");
        if let Some(id) = session_id {
            segments.push(id);
        }
    }
    Ok(url.into())
}

fn non_empty(value: String, field: &str) -> Result<String, UpstreamError> {
    if value.trim().is_empty() {
        return Err(UpstreamError::Malformed {
            service: PROVIDER,
            message: format!("{} is empty", field),
        });
    }
    Ok(value)
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn dispatch(
        &self,
        provider: &ComputeProvider,
        task_id: &TaskId,
        workload: &str,
    ) -> Result<DispatchReceipt, DispatchError> {
        let fail = |stage: DispatchStage| {
            move |source: UpstreamError| {
                error!(
                    provider_id = %provider.id,
                    task_id = %task_id,
                    "Dispatch failed during {}: {}",
                    stage,
                    source
                );
                DispatchError {
                    provider_id: provider.id.to_string(),
                    stage,
                    source,
                }
            }
        };

        let session_id = self
            .open_session(provider, task_id)
            .await
            .map_err(fail(DispatchStage::OpenSession))?;

        let run_id = self
            .submit_run(provider, &session_id, workload)
            .await
            .map_err(fail(DispatchStage::SubmitRun))?;

        info!(
            provider_id = %provider.id,
            task_id = %task_id,
            session_id = %session_id,
            run_id = %run_id,
            "Workload dispatched"
        );

        Ok(DispatchReceipt { session_id, run_id })
    }
}
