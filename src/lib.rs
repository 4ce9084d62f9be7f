//! Sidecompute
//!
//! Energy-cost GPU broker: GPU owners register spare capacity together with
//! their electricity economics, and each submitted workload is placed on the
//! provider where running it is estimated to cost the least.
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── lib.rs         - Crate root with re-exports
//! ├── main.rs        - Server entrypoint
//! ├── config.rs      - Environment configuration
//! ├── error.rs       - Error taxonomy and HTTP mapping
//! ├── broker/        - Brokering core
//! │   ├── models.rs     - Providers, tasks, registrations
//! │   ├── cost.rs       - Energy cost formula
//! │   ├── rates.rs      - Utility rate lookup by postal code
//! │   ├── duration.rs   - Run-time estimation via a language model
//! │   ├── selector.rs   - Concurrent lowest-cost selection
//! │   ├── dispatcher.rs - Remote session and run creation
//! │   ├── registry.rs   - In-memory provider registry
//! │   ├── task_store.rs - In-memory task records
//! │   ├── workload.rs   - Workload files on disk
//! │   └── service.rs    - Registration and submission flows
//! ├── api/           - HTTP API
//! │   ├── broker.rs     - Broker endpoints
//! │   ├── middleware.rs - Auth, rate limiting, headers, logging
//! │   └── http.rs       - Secure HTTP client
//! └── database/      - PostgreSQL persistence
//! ```

pub mod api;
pub mod broker;
pub mod config;
pub mod database;
pub mod error;

// Re-export main types for convenience
pub use config::BrokerConfig;
pub use error::{BrokerError, DispatchError, DispatchStage, UpstreamError};

pub use broker::{
    BrokerService, CandidateFailure, CapabilityRegistration, ComputeProvider, CostBreakdown,
    DispatchReceipt, Dispatcher, DurationEstimator, EconomicsRegistration, ProviderId,
    ProviderRegistry, ProviderStore, RateLookup, Selection, SelectionRequest, Selector,
    SelectorConfig, SubmissionReceipt, Task, TaskId, TaskStatus, TaskStore, TaskSubmission,
    WorkloadStore, energy_cost,
};

pub use api::{BrokerApiState, SecurityState, build_app};
pub use database::{DatabasePool, ProviderRepository, TaskRepository};
