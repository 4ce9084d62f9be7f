//! Provider Repository - PostgreSQL-backed provider registry

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use crate::broker::models::{
    CapabilityRegistration, ComputeProvider, Economics, EconomicsRegistration, ProviderId,
};
use crate::broker::registry::{ProviderStore, unknown_provider};
use crate::error::BrokerError;

const COLUMNS: &str = "provider_id, endpoint, credential, throughput_flops, max_power_watts, \
                       min_rate_per_minute, postal_code, price_per_kwh, registered_at, updated_at";

pub struct ProviderRepository {
    pool: PgPool,
}

fn storage(action: &'static str) -> impl FnOnce(sqlx::Error) -> BrokerError {
    move |e| BrokerError::Storage(format!("Failed to {}: {}", action, e))
}

fn provider_from_row(row: &PgRow) -> Result<ComputeProvider, BrokerError> {
    let id: String = row.get("provider_id");
    let max_power_watts: i64 = row.get("max_power_watts");
    let min_rate: Option<f64> = row.get("min_rate_per_minute");
    let postal_code: Option<i32> = row.get("postal_code");

    let economics = match (min_rate, postal_code) {
        (Some(min_rate_per_minute), Some(postal_code)) => Some(Economics {
            min_rate_per_minute,
            postal_code: u32::try_from(postal_code).map_err(|_| {
                BrokerError::Storage(format!("Stored postal code out of range: {}", postal_code))
            })?,
            price_per_kwh: row.get("price_per_kwh"),
        }),
        _ => None,
    };

    Ok(ComputeProvider {
        id: ProviderId::new(id)?,
        endpoint: row.get("endpoint"),
        credential: row.get("credential"),
        throughput_flops: row.get("throughput_flops"),
        max_power_watts: u32::try_from(max_power_watts).map_err(|_| {
            BrokerError::Storage(format!("Stored power out of range: {}", max_power_watts))
        })?,
        economics,
        registered_at: row.get("registered_at"),
        updated_at: row.get("updated_at"),
    })
}

impl ProviderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProviderStore for ProviderRepository {
    async fn register_capability(
        &self,
        registration: CapabilityRegistration,
    ) -> Result<ComputeProvider, BrokerError> {
        let now = Utc::now();
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO broker.providers
            (provider_id, endpoint, credential, throughput_flops, max_power_watts, registered_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            ON CONFLICT (provider_id) DO UPDATE SET
                endpoint = EXCLUDED.endpoint,
                credential = EXCLUDED.credential,
                throughput_flops = EXCLUDED.throughput_flops,
                max_power_watts = EXCLUDED.max_power_watts,
                updated_at = EXCLUDED.updated_at
            RETURNING {}
            "#,
            COLUMNS
        ))
        .bind(registration.id.as_str())
        .bind(&registration.endpoint)
        .bind(&registration.credential)
        .bind(registration.throughput_flops)
        .bind(i64::from(registration.max_power_watts))
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(storage("register provider"))?;

        let provider = provider_from_row(&row)?;
        info!(provider_id = %provider.id, "Provider capability stored");
        Ok(provider)
    }

    async fn register_economics(
        &self,
        registration: EconomicsRegistration,
    ) -> Result<ComputeProvider, BrokerError> {
        let postal_code = i32::try_from(registration.postal_code)
            .map_err(|_| BrokerError::validation("zip out of range"))?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE broker.providers SET
                min_rate_per_minute = $2,
                postal_code = $3,
                price_per_kwh = $4,
                updated_at = $5
            WHERE provider_id = $1
            RETURNING {}
            "#,
            COLUMNS
        ))
        .bind(registration.id.as_str())
        .bind(registration.min_rate_per_minute)
        .bind(postal_code)
        .bind(registration.price_per_kwh)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage("update provider economics"))?;

        let row = row.ok_or_else(|| unknown_provider(&registration.id))?;
        let provider = provider_from_row(&row)?;
        info!(provider_id = %provider.id, "Provider economics stored");
        Ok(provider)
    }

    async fn get(&self, id: &ProviderId) -> Result<Option<ComputeProvider>, BrokerError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM broker.providers WHERE provider_id = $1",
            COLUMNS
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage("get provider"))?;

        row.as_ref().map(provider_from_row).transpose()
    }

    async fn snapshot(&self) -> Result<Vec<ComputeProvider>, BrokerError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM broker.providers ORDER BY seq",
            COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(storage("list providers"))?;

        debug!(count = rows.len(), "Loaded provider snapshot");
        rows.iter().map(provider_from_row).collect()
    }
}
