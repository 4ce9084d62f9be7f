//! Task Repository - PostgreSQL-backed task records

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use crate::broker::cost::CostBreakdown;
use crate::broker::models::{ProviderId, Task, TaskId, TaskStatus};
use crate::broker::task_store::TaskStore;
use crate::error::BrokerError;

const COLUMNS: &str = "task_id, workload_path, provider_id, scheduled_time, not_later_than, \
                       duration_hours, price_per_kwh, power_watts, energy_kwh, cost, \
                       status, session_id, run_id, failure_reason, created_at, updated_at";

pub struct TaskRepository {
    pool: PgPool,
}

/// Flattened status: (label, session_id, run_id, failure_reason)
type StatusColumns<'a> = (&'static str, Option<&'a str>, Option<&'a str>, Option<&'a str>);

fn status_columns(status: &TaskStatus) -> StatusColumns<'_> {
    match status {
        TaskStatus::Pending => ("pending", None, None, None),
        TaskStatus::Dispatched { session_id, run_id } => (
            "dispatched",
            Some(session_id.as_str()),
            Some(run_id.as_str()),
            None,
        ),
        TaskStatus::Failed { reason } => ("failed", None, None, Some(reason.as_str())),
    }
}

fn status_from_columns(
    label: &str,
    session_id: Option<String>,
    run_id: Option<String>,
    failure_reason: Option<String>,
) -> Result<TaskStatus, BrokerError> {
    match label {
        "pending" => Ok(TaskStatus::Pending),
        "dispatched" => Ok(TaskStatus::Dispatched {
            session_id: session_id.unwrap_or_default(),
            run_id: run_id.unwrap_or_default(),
        }),
        "failed" => Ok(TaskStatus::Failed {
            reason: failure_reason.unwrap_or_default(),
        }),
        other => Err(BrokerError::Storage(format!("Unknown task status: {}", other))),
    }
}

fn task_from_row(row: &PgRow) -> Result<Task, BrokerError> {
    let task_id: Uuid = row.get("task_id");
    let provider_id: String = row.get("provider_id");
    let scheduled_time: i64 = row.get("scheduled_time");
    let power_watts: i64 = row.get("power_watts");
    let label: String = row.get("status");

    Ok(Task {
        id: TaskId::from_uuid(task_id),
        workload_path: row.get("workload_path"),
        provider_id: ProviderId::new(provider_id)?,
        scheduled_time: u64::try_from(scheduled_time).unwrap_or(0),
        not_later_than: row.get("not_later_than"),
        estimate: CostBreakdown {
            duration_hours: row.get("duration_hours"),
            price_per_kwh: row.get("price_per_kwh"),
            power_watts: u32::try_from(power_watts).map_err(|_| {
                BrokerError::Storage(format!("Stored power out of range: {}", power_watts))
            })?,
            energy_kwh: row.get("energy_kwh"),
            cost: row.get("cost"),
        },
        status: status_from_columns(
            &label,
            row.get("session_id"),
            row.get("run_id"),
            row.get("failure_reason"),
        )?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

impl TaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskStore for TaskRepository {
    async fn insert(&self, task: &Task) -> Result<(), BrokerError> {
        let (label, session_id, run_id, failure_reason) = status_columns(&task.status);
        let scheduled_time = i64::try_from(task.scheduled_time)
            .map_err(|_| BrokerError::Storage("Scheduled time out of range".to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO broker.tasks
            (task_id, workload_path, provider_id, scheduled_time, not_later_than,
             duration_hours, price_per_kwh, power_watts, energy_kwh, cost,
             status, session_id, run_id, failure_reason, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(task.id.as_uuid())
        .bind(&task.workload_path)
        .bind(task.provider_id.as_str())
        .bind(scheduled_time)
        .bind(task.not_later_than)
        .bind(task.estimate.duration_hours)
        .bind(task.estimate.price_per_kwh)
        .bind(i64::from(task.estimate.power_watts))
        .bind(task.estimate.energy_kwh)
        .bind(task.estimate.cost)
        .bind(label)
        .bind(session_id)
        .bind(run_id)
        .bind(failure_reason)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| BrokerError::Storage(format!("Failed to insert task: {}", e)))?;

        debug!(task_id = %task.id, provider_id = %task.provider_id, "Task inserted");
        Ok(())
    }

    async fn get(&self, id: &TaskId) -> Result<Option<Task>, BrokerError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM broker.tasks WHERE task_id = $1",
            COLUMNS
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BrokerError::Storage(format!("Failed to get task: {}", e)))?;

        row.as_ref().map(task_from_row).transpose()
    }

    async fn update_status(&self, id: &TaskId, status: TaskStatus) -> Result<(), BrokerError> {
        let (label, session_id, run_id, failure_reason) = status_columns(&status);

        let result = sqlx::query(
            r#"
            UPDATE broker.tasks
            SET status = $2, session_id = $3, run_id = $4, failure_reason = $5, updated_at = $6
            WHERE task_id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(label)
        .bind(session_id)
        .bind(run_id)
        .bind(failure_reason)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| BrokerError::Storage(format!("Failed to update task status: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(BrokerError::Storage(format!("Task {} not found", id)));
        }

        debug!(task_id = %id, status = label, "Task status updated");
        Ok(())
    }

    async fn count(&self) -> Result<usize, BrokerError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM broker.tasks")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| BrokerError::Storage(format!("Failed to count tasks: {}", e)))?;

        let count: i64 = row.get("count");
        Ok(usize::try_from(count).unwrap_or(0))
    }
}
