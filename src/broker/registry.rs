//! Provider registry
//!
//! Registration happens in two steps: capability first, economics second.
//! Selection reads a copy of the registry so concurrent registrations never
//! leak into a run in progress.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::info;

use super::models::{CapabilityRegistration, ComputeProvider, EconomicsRegistration, ProviderId};
use crate::error::BrokerError;

#[async_trait]
pub trait ProviderStore: Send + Sync {
    /// Create the provider, or update its capability fields in place
    async fn register_capability(
        &self,
        registration: CapabilityRegistration,
    ) -> Result<ComputeProvider, BrokerError>;

    /// Set economic fields on an existing provider. Unknown ids are a
    /// validation error and create nothing.
    async fn register_economics(
        &self,
        registration: EconomicsRegistration,
    ) -> Result<ComputeProvider, BrokerError>;

    async fn get(&self, id: &ProviderId) -> Result<Option<ComputeProvider>, BrokerError>;

    /// Every provider, in registration order
    async fn snapshot(&self) -> Result<Vec<ComputeProvider>, BrokerError>;
}

pub fn unknown_provider(id: &ProviderId) -> BrokerError {
    BrokerError::validation(format!("Unknown provider uuid: {}", id))
}

#[derive(Default)]
struct ProviderTable {
    providers: HashMap<ProviderId, ComputeProvider>,
    order: Vec<ProviderId>,
}

/// In-memory provider registry
#[derive(Default)]
pub struct ProviderRegistry {
    table: RwLock<ProviderTable>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.read().await.order.is_empty()
    }
}

#[async_trait]
impl ProviderStore for ProviderRegistry {
    async fn register_capability(
        &self,
        registration: CapabilityRegistration,
    ) -> Result<ComputeProvider, BrokerError> {
        let mut table = self.table.write().await;

        if let Some(existing) = table.providers.get_mut(&registration.id) {
            existing.apply_capability(registration);
            info!(
                provider_id = %existing.id,
                "Updated provider capability ({} W, {} FLOPS)",
                existing.max_power_watts,
                existing.throughput_flops
            );
            return Ok(existing.clone());
        }

        let provider = ComputeProvider::from(registration);
        table.order.push(provider.id.clone());
        table.providers.insert(provider.id.clone(), provider.clone());
        info!(
            provider_id = %provider.id,
            "Registered provider ({} W, {} FLOPS)",
            provider.max_power_watts,
            provider.throughput_flops
        );
        Ok(provider)
    }

    async fn register_economics(
        &self,
        registration: EconomicsRegistration,
    ) -> Result<ComputeProvider, BrokerError> {
        let mut table = self.table.write().await;

        let provider = table
            .providers
            .get_mut(&registration.id)
            .ok_or_else(|| unknown_provider(&registration.id))?;

        provider.apply_economics(registration);
        info!(provider_id = %provider.id, "Updated provider economics");
        Ok(provider.clone())
    }

    async fn get(&self, id: &ProviderId) -> Result<Option<ComputeProvider>, BrokerError> {
        Ok(self.table.read().await.providers.get(id).cloned())
    }

    async fn snapshot(&self) -> Result<Vec<ComputeProvider>, BrokerError> {
        let table = self.table.read().await;
        Ok(table
            .order
            .iter()
            .filter_map(|id| table.providers.get(id).cloned())
            .collect())
    }
}
