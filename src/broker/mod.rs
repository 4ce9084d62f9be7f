//! Energy-cost GPU brokering
//!
//! Providers register hardware and economics; submitted workloads go to the
//! provider with the lowest estimated electricity cost.

pub mod cost;
pub mod dispatcher;
pub mod duration;
pub mod models;
pub mod prompts;
pub mod rates;
pub mod registry;
pub mod retry;
pub mod selector;
pub mod service;
pub mod task_store;
pub mod workload;

pub use cost::{CostBreakdown, energy_cost};
pub use dispatcher::{DispatchConfig, DispatchReceipt, Dispatcher, HttpDispatcher};
pub use duration::{CachedDurationEstimator, DurationEstimator, InferenceConfig, LlmDurationEstimator};
pub use models::{
    CapabilityRegistration, ComputeProvider, Economics, EconomicsRegistration, ProviderId, Task,
    TaskId, TaskStatus,
};
pub use rates::{CachedRateLookup, RateClientConfig, RateLookup, RateSector, UtilityRateClient};
pub use registry::{ProviderRegistry, ProviderStore};
pub use retry::RetryPolicy;
pub use selector::{
    CandidateFailure, CandidateOutcome, Selection, SelectionRequest, Selector, SelectorConfig,
    SkipKind,
};
pub use service::{BrokerService, SubmissionReceipt, TaskSubmission};
pub use task_store::{InMemoryTaskStore, TaskStore};
pub use workload::WorkloadStore;
