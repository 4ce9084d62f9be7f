//! PostgreSQL Database Module
//!
//! Durable backends for the provider registry and task records.

pub mod pool;
pub mod providers;
pub mod tasks;

pub use pool::DatabasePool;
pub use providers::ProviderRepository;
pub use tasks::TaskRepository;
