//! Task records

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use super::models::{Task, TaskId, TaskStatus};
use crate::error::BrokerError;

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: &Task) -> Result<(), BrokerError>;

    async fn get(&self, id: &TaskId) -> Result<Option<Task>, BrokerError>;

    async fn update_status(&self, id: &TaskId, status: TaskStatus) -> Result<(), BrokerError>;

    async fn count(&self) -> Result<usize, BrokerError>;
}

#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: &Task) -> Result<(), BrokerError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(BrokerError::Storage(format!("Task {} already exists", task.id)));
        }
        tasks.insert(task.id, task.clone());
        debug!(task_id = %task.id, "Task inserted");
        Ok(())
    }

    async fn get(&self, id: &TaskId) -> Result<Option<Task>, BrokerError> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn update_status(&self, id: &TaskId, status: TaskStatus) -> Result<(), BrokerError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| BrokerError::Storage(format!("Task {} not found", id)))?;

        debug!(task_id = %id, status = status.label(), "Task status updated");
        task.status = status;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn count(&self) -> Result<usize, BrokerError> {
        Ok(self.tasks.read().await.len())
    }
}
