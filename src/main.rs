use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};
use tracing_subscriber::fmt::format::FmtSpan;

use sidecompute::{
    BrokerService, ProviderStore, Selector, TaskStore, WorkloadStore,
    api::{MiddlewareConfig, SecurityState, build_app},
    broker::{
        CachedDurationEstimator, CachedRateLookup, DurationEstimator, HttpDispatcher,
        InMemoryTaskStore, LlmDurationEstimator, ProviderRegistry, RateLookup, UtilityRateClient,
    },
    config::{BrokerConfig, sanitize_for_logging},
    database::DatabasePool,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Configuration is validated before anything else starts
    let config = BrokerConfig::from_env().map_err(|e| {
        eprintln!("Configuration error: {}", e);
        eprintln!("Please check SIDECOMPUTE_* environment variables.");
        e
    })?;

    init_logging(&config)?;

    info!("Starting sidecompute GPU broker");
    info!(
        "Security settings: HTTPS required: {}, Auth enabled: {}",
        config.security.require_https, config.security.enable_auth
    );
    log_credentials(&config);

    let shutdown = CancellationToken::new();

    let rates = build_rate_lookup(&config)?;
    let durations = build_duration_estimator(&config)?;
    let selector = Selector::new(rates, durations, config.selector_config());
    info!(
        "Selector: concurrency={}, deadline={}s",
        config.selection.max_concurrency, config.selection.deadline_secs
    );

    let dispatcher = Arc::new(
        HttpDispatcher::new(
            config.dispatch_config(),
            &config.http_security(config.dispatch.timeout_secs),
        )
        .context("Failed to create dispatch client")?,
    );

    let (providers, tasks) = build_stores(&config).await?;

    let workloads = WorkloadStore::open(&config.storage.task_dir)
        .await
        .with_context(|| format!("Failed to open task directory {}", config.storage.task_dir))?;
    info!("Workloads stored under {}", workloads.dir().display());

    let service = Arc::new(
        BrokerService::new(providers, tasks, selector, dispatcher, workloads)
            .with_require_https(config.security.require_https)
            .with_shutdown(shutdown.clone()),
    );

    let security_state = SecurityState::new(MiddlewareConfig::from(&config));
    spawn_rate_limit_cleanup(security_state.clone(), shutdown.clone());

    let app = build_app(service, security_state);

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", bind_addr, e))?;

    info!("Broker listening on {}", bind_addr);
    info!(
        "Security middleware: Auth={}, Rate limit={}/min, Max body={}KB",
        config.security.enable_auth,
        config.security.rate_limit_per_minute,
        config.security.max_request_size / 1024
    );

    // Serve with connect info for client IP extraction
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown))
    .await?;

    info!("Broker stopped");
    Ok(())
}

fn init_logging(config: &BrokerConfig) -> Result<()> {
    let log_level = match config.logging.level.to_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" => Level::WARN,
        "info" => Level::INFO,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(if config.logging.log_requests {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        })
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to set logging subscriber: {}", e))?;

    Ok(())
}

fn log_credentials(config: &BrokerConfig) {
    if !config.logging.sanitize_logs {
        warn!("Log sanitization disabled - credentials will not be logged at all");
        return;
    }

    info!(
        "Inference key: {}, rates key: {}",
        sanitize_for_logging(&config.inference.api_key),
        sanitize_for_logging(&config.rates.api_key)
    );
    if config.security.enable_auth {
        info!("Loaded {} API key(s) for authentication", config.security.api_keys.len());
    }
}

fn build_rate_lookup(config: &BrokerConfig) -> Result<Arc<dyn RateLookup>> {
    let client = UtilityRateClient::new(
        config.rate_client_config()?,
        &config.http_security(config.rates.timeout_secs),
    )
    .context("Failed to create utility rate client")?;

    info!(
        "Rate lookup: sector={}, attempts={}",
        config.rates.sector, config.rates.max_attempts
    );
    Ok(Arc::new(CachedRateLookup::new(Arc::new(client))))
}

fn build_duration_estimator(config: &BrokerConfig) -> Result<Arc<dyn DurationEstimator>> {
    let estimator: Arc<dyn DurationEstimator> = Arc::new(
        LlmDurationEstimator::new(
            config.inference_client_config(),
            &config.http_security(config.inference.timeout_secs),
        )
        .context("Failed to create inference client")?,
    );

    info!(
        "Duration estimator: model={}, cache={}",
        config.inference.model, config.inference.cache
    );
    if config.inference.cache {
        Ok(Arc::new(CachedDurationEstimator::new(estimator)))
    } else {
        Ok(estimator)
    }
}

async fn build_stores(
    config: &BrokerConfig,
) -> Result<(Arc<dyn ProviderStore>, Arc<dyn TaskStore>)> {
    if !config.database.postgres_enabled {
        info!("Using in-memory provider and task stores");
        let providers: Arc<dyn ProviderStore> = Arc::new(ProviderRegistry::new());
        let tasks: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        return Ok((providers, tasks));
    }

    let db = DatabasePool::new(&config.database.postgres_url, config.database.max_connections)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    db.init_schema().await.map_err(|e| anyhow::anyhow!(e))?;

    info!("Using PostgreSQL provider and task stores");
    let providers: Arc<dyn ProviderStore> = db.providers();
    let tasks: Arc<dyn TaskStore> = db.tasks();
    Ok((providers, tasks))
}

fn spawn_rate_limit_cleanup(security: SecurityState, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    security.rate_limiter.cleanup();
                    tracing::debug!(
                        clients = security.rate_limiter.tracked_clients(),
                        "Rate limiter cleanup"
                    );
                }
            }
        }
    });
}

/// Resolves on Ctrl+C and cancels in-flight selections
async fn shutdown_signal(shutdown: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            warn!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    }
    shutdown.cancel();
}
