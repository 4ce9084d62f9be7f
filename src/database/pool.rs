//! Database Connection Pool using sqlx

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::sync::Arc;
use tracing::info;

use crate::database::providers::ProviderRepository;
use crate::database::tasks::TaskRepository;

pub struct DatabasePool {
    pool: PgPool,
    providers: Arc<ProviderRepository>,
    tasks: Arc<TaskRepository>,
}

const SCHEMA: &[(&str, &str)] = &[
    ("broker schema", "CREATE SCHEMA IF NOT EXISTS broker"),
    (
        "providers table",
        r#"
        CREATE TABLE IF NOT EXISTS broker.providers (
            seq                 BIGSERIAL,
            provider_id         TEXT PRIMARY KEY,
            endpoint            TEXT NOT NULL,
            credential          TEXT NOT NULL,
            throughput_flops    DOUBLE PRECISION NOT NULL,
            max_power_watts     BIGINT NOT NULL,
            min_rate_per_minute DOUBLE PRECISION,
            postal_code         INTEGER,
            price_per_kwh       DOUBLE PRECISION,
            registered_at       TIMESTAMPTZ NOT NULL,
            updated_at          TIMESTAMPTZ NOT NULL
        )
        "#,
    ),
    (
        "tasks table",
        r#"
        CREATE TABLE IF NOT EXISTS broker.tasks (
            task_id           UUID PRIMARY KEY,
            workload_path     TEXT NOT NULL,
            provider_id       TEXT NOT NULL REFERENCES broker.providers (provider_id),
            scheduled_time    BIGINT NOT NULL DEFAULT 0,
            not_later_than    TIMESTAMPTZ NOT NULL,
            duration_hours    DOUBLE PRECISION NOT NULL,
            price_per_kwh     DOUBLE PRECISION NOT NULL,
            power_watts       BIGINT NOT NULL,
            energy_kwh        DOUBLE PRECISION NOT NULL,
            cost              DOUBLE PRECISION NOT NULL,
            status            TEXT NOT NULL,
            session_id        TEXT,
            run_id            TEXT,
            failure_reason    TEXT,
            created_at        TIMESTAMPTZ NOT NULL,
            updated_at        TIMESTAMPTZ NOT NULL
        )
        "#,
    ),
    (
        "tasks provider index",
        "CREATE INDEX IF NOT EXISTS tasks_provider_idx ON broker.tasks (provider_id)",
    ),
];

impl DatabasePool {
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self, String> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(connection_string)
            .await
            .map_err(|e| format!("Failed to connect to PostgreSQL: {}", e))?;

        info!("Connected to PostgreSQL");

        Ok(Self {
            providers: Arc::new(ProviderRepository::new(pool.clone())),
            tasks: Arc::new(TaskRepository::new(pool.clone())),
            pool,
        })
    }

    pub async fn init_schema(&self) -> Result<(), String> {
        info!("Initializing database schema...");

        for (name, statement) in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| format!("Failed to create {}: {}", name, e))?;
        }

        info!("Database schema initialized");
        Ok(())
    }

    pub fn providers(&self) -> Arc<ProviderRepository> {
        self.providers.clone()
    }

    pub fn tasks(&self) -> Arc<TaskRepository> {
        self.tasks.clone()
    }
}
