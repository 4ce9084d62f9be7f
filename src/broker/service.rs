//! Broker orchestration: registration, submission, lookup
//!
//! Submission flow:
//!
//! ```text
//! store workload file → snapshot providers → select → persist pending task
//!     → dispatch → mark dispatched | failed
//! ```
//!
//! Selection failures leave no task behind and remove the stored file.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::cost::CostBreakdown;
use super::dispatcher::{DispatchReceipt, Dispatcher};
use super::models::{
    CapabilityRegistration, ComputeProvider, EconomicsRegistration, ProviderId, Task, TaskId,
    TaskStatus,
};
use super::registry::ProviderStore;
use super::selector::{CandidateFailure, Selection, SelectionRequest, Selector};
use super::task_store::TaskStore;
use super::workload::WorkloadStore;
use crate::error::BrokerError;

/// A workload submission after request parsing
#[derive(Debug, Clone)]
pub struct TaskSubmission {
    pub workload: String,
    pub not_later_than: DateTime<Utc>,
    pub max_rate_per_minute: Option<f64>,
}

impl TaskSubmission {
    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.workload.trim().is_empty() {
            return Err(BrokerError::validation("Workload file is empty"));
        }
        if let Some(rate) = self.max_rate_per_minute
            && (!rate.is_finite() || rate < 0.0)
        {
            return Err(BrokerError::validation(format!(
                "max-rate must be a non-negative number, got {}",
                rate
            )));
        }
        Ok(())
    }
}

/// What a successful submission reports back
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionReceipt {
    pub task_id: TaskId,
    pub provider_id: ProviderId,
    pub estimate: CostBreakdown,
    pub session_id: String,
    pub run_id: String,
    pub candidates_evaluated: usize,
    pub skipped: Vec<CandidateFailure>,
}

pub struct BrokerService {
    providers: Arc<dyn ProviderStore>,
    tasks: Arc<dyn TaskStore>,
    selector: Selector,
    dispatcher: Arc<dyn Dispatcher>,
    workloads: WorkloadStore,
    require_https: bool,
    shutdown: CancellationToken,
}

impl BrokerService {
    pub fn new(
        providers: Arc<dyn ProviderStore>,
        tasks: Arc<dyn TaskStore>,
        selector: Selector,
        dispatcher: Arc<dyn Dispatcher>,
        workloads: WorkloadStore,
    ) -> Self {
        Self {
            providers,
            tasks,
            selector,
            dispatcher,
            workloads,
            require_https: true,
            shutdown: CancellationToken::new(),
        }
    }

    /// Whether provider endpoints must use HTTPS
    pub fn with_require_https(mut self, require_https: bool) -> Self {
        self.require_https = require_https;
        self
    }

    /// Cancelling `shutdown` aborts every selection in flight
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub async fn register_capability(
        &self,
        registration: CapabilityRegistration,
    ) -> Result<ComputeProvider, BrokerError> {
        let registration = registration.validate(self.require_https)?;
        self.providers.register_capability(registration).await
    }

    pub async fn register_economics(
        &self,
        registration: EconomicsRegistration,
    ) -> Result<ComputeProvider, BrokerError> {
        let registration = registration.validate()?;
        self.providers.register_economics(registration).await
    }

    pub async fn list_providers(&self) -> Result<Vec<ComputeProvider>, BrokerError> {
        self.providers.snapshot().await
    }

    pub async fn get_provider(&self, id: &ProviderId) -> Result<ComputeProvider, BrokerError> {
        self.providers
            .get(id)
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("provider {}", id)))
    }

    pub async fn get_task(&self, id: &TaskId) -> Result<Task, BrokerError> {
        self.tasks
            .get(id)
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("task {}", id)))
    }

    /// Place a workload on the cheapest provider and hand it off
    pub async fn submit_task(
        &self,
        submission: TaskSubmission,
    ) -> Result<SubmissionReceipt, BrokerError> {
        submission.validate()?;

        let path = self.workloads.save(&submission.workload).await?;

        let selection = match self.select(&submission).await {
            Ok(selection) => selection,
            Err(e) => {
                self.workloads.remove(&path).await;
                return Err(e);
            }
        };

        let task = Task::pending(
            path.display().to_string(),
            selection.provider.id.clone(),
            submission.not_later_than,
            selection.breakdown,
        );
        if let Err(e) = self.tasks.insert(&task).await {
            self.workloads.remove(&path).await;
            return Err(e);
        }
        info!(
            task_id = %task.id,
            provider_id = %task.provider_id,
            "Task created, estimated ${:.6}",
            task.estimate.cost
        );

        let receipt = self.dispatch(&task, &selection, &path).await?;

        Ok(SubmissionReceipt {
            task_id: task.id,
            provider_id: task.provider_id,
            estimate: selection.breakdown,
            session_id: receipt.session_id,
            run_id: receipt.run_id,
            candidates_evaluated: selection.outcomes.len(),
            skipped: selection.failures().cloned().collect(),
        })
    }

    async fn select(&self, submission: &TaskSubmission) -> Result<Selection, BrokerError> {
        let candidates = self.providers.snapshot().await?;
        let request = SelectionRequest::new(&submission.workload)
            .with_max_rate(submission.max_rate_per_minute);
        let cancel = self.shutdown.child_token();

        self.selector.select(&candidates, &request, &cancel).await
    }

    async fn dispatch(
        &self,
        task: &Task,
        selection: &Selection,
        path: &Path,
    ) -> Result<DispatchReceipt, BrokerError> {
        let workload = match self.workloads.read(path).await {
            Ok(workload) => workload,
            Err(e) => {
                self.mark_failed(&task.id, e.to_string()).await;
                return Err(e);
            }
        };

        match self
            .dispatcher
            .dispatch(&selection.provider, &task.id, &workload)
            .await
        {
            Ok(receipt) => {
                self.tasks
                    .update_status(
                        &task.id,
                        TaskStatus::Dispatched {
                            session_id: receipt.session_id.clone(),
                            run_id: receipt.run_id.clone(),
                        },
                    )
                    .await?;
                Ok(receipt)
            }
            Err(e) => {
                self.mark_failed(&task.id, e.to_string()).await;
                Err(e.into())
            }
        }
    }

    async fn mark_failed(&self, id: &TaskId, reason: String) {
        if let Err(e) = self
            .tasks
            .update_status(id, TaskStatus::Failed { reason })
            .await
        {
            warn!(task_id = %id, "Failed to mark task failed: {}", e);
        }
    }
}
