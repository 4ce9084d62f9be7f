//! HTTP surface of the broker
//!
//! - Broker endpoints (registration, submission, lookups)
//! - Secure HTTP client for external services
//! - Security middleware (auth, rate limiting, headers, body limits)

pub mod broker;
pub mod http;
pub mod middleware;

use axum::{Router, extract::DefaultBodyLimit, middleware as axum_middleware};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::broker::BrokerService;

pub use broker::{BrokerApiState, create_router};
pub use http::{HttpSecurityConfig, SecureHttpClient};
pub use middleware::{
    MiddlewareConfig, RateLimiter, SecurityState, auth_middleware, body_size_middleware,
    logging_middleware, rate_limit_middleware, security_headers_middleware,
};

/// Broker routes wrapped in the security middleware stack
pub fn build_app(service: Arc<BrokerService>, security: SecurityState) -> Router {
    let max_request_size = security.config.max_request_size;

    create_router(BrokerApiState { service })
        .layer(DefaultBodyLimit::max(max_request_size))
        .layer(axum_middleware::from_fn_with_state(
            security.clone(),
            body_size_middleware,
        ))
        .layer(axum_middleware::from_fn_with_state(
            security.clone(),
            auth_middleware,
        ))
        .layer(axum_middleware::from_fn_with_state(
            security.clone(),
            rate_limit_middleware,
        ))
        .layer(axum_middleware::from_fn_with_state(
            security,
            logging_middleware,
        ))
        .layer(axum_middleware::from_fn(security_headers_middleware))
        .layer(TraceLayer::new_for_http())
}
