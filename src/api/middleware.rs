//! Request middleware for the broker API
//!
//! Provides:
//! - API key authentication (`x-api-key` or bearer token)
//! - Per-IP rate limiting
//! - Request body size limits
//! - Security headers
//! - Request logging with client IP masking

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;

#[derive(Debug, Clone)]
pub struct MiddlewareConfig {
    pub enable_auth: bool,
    pub api_keys: Vec<String>,
    /// Requests per minute per client IP
    pub rate_limit_per_minute: u32,
    /// Maximum request body size in bytes
    pub max_request_size: usize,
    pub log_requests: bool,
    /// Mask client IPs in request logs
    pub sanitize_logs: bool,
    /// Path prefixes that skip authentication
    pub public_paths: Vec<String>,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            enable_auth: false,
            api_keys: Vec::new(),
            rate_limit_per_minute: 120,
            max_request_size: 5 * 1024 * 1024,
            log_requests: true,
            sanitize_logs: true,
            public_paths: vec!["/health".to_string()],
        }
    }
}

impl From<&BrokerConfig> for MiddlewareConfig {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            enable_auth: config.security.enable_auth,
            api_keys: config.security.api_keys.clone(),
            rate_limit_per_minute: config.security.rate_limit_per_minute,
            max_request_size: config.security.max_request_size,
            log_requests: config.logging.log_requests,
            sanitize_logs: config.logging.sanitize_logs,
            ..Default::default()
        }
    }
}

/// Fixed-window request counter per client IP
#[derive(Debug)]
pub struct RateLimiter {
    /// IP -> (requests in window, window start)
    windows: DashMap<String, (u32, Instant)>,
    limit: u32,
    window: Duration,
}

/// Outcome of one rate-limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_after_secs: u64,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        Self::with_window(requests_per_minute, Duration::from_secs(60))
    }

    pub fn with_window(limit: u32, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            limit,
            window,
        }
    }

    pub fn check(&self, ip: &str) -> RateDecision {
        let now = Instant::now();

        let mut entry = self.windows.entry(ip.to_string()).or_insert((0, now));
        let (count, window_start) = entry.value_mut();

        if now.duration_since(*window_start) >= self.window {
            *count = 0;
            *window_start = now;
        }

        let reset_after_secs = self
            .window
            .checked_sub(now.duration_since(*window_start))
            .map(|d| d.as_secs())
            .unwrap_or(0);

        if *count >= self.limit {
            return RateDecision {
                allowed: false,
                remaining: 0,
                reset_after_secs,
            };
        }

        *count += 1;
        RateDecision {
            allowed: true,
            remaining: self.limit - *count,
            reset_after_secs,
        }
    }

    /// Drop windows idle for more than two periods
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.windows
            .retain(|_, (_, window_start)| now.duration_since(*window_start) < self.window * 2);
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }
}

#[derive(Clone)]
pub struct SecurityState {
    pub config: MiddlewareConfig,
    pub rate_limiter: Arc<RateLimiter>,
}

impl SecurityState {
    pub fn new(config: MiddlewareConfig) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_per_minute));
        Self {
            config,
            rate_limiter,
        }
    }
}

/// Client IP, preferring proxy headers over the socket address
fn client_ip(request: &Request) -> String {
    let headers = request.headers();

    if let Some(ip) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
    {
        return ip.to_string();
    }

    if let Some(ip) = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
    {
        return ip.to_string();
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Mask the middle of a value for logging
pub fn sanitize_for_log(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

fn is_public_path(path: &str, public_paths: &[String]) -> bool {
    public_paths.iter().any(|p| path.starts_with(p.as_str()))
}

fn presented_api_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key.trim());
    }
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

pub async fn auth_middleware(
    State(state): State<SecurityState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let path = request.uri().path().to_string();

    if !state.config.enable_auth || is_public_path(&path, &state.config.public_paths) {
        return Ok(next.run(request).await);
    }

    let presented = presented_api_key(request.headers()).map(str::to_string);
    match presented {
        Some(key) if state.config.api_keys.contains(&key) => {
            debug!("API key authenticated for path: {}", path);
            Ok(next.run(request).await)
        }
        Some(_) => {
            warn!("Invalid API key attempt for path: {}", path);
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            warn!("Missing API key for path: {}", path);
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

fn insert_rate_headers(headers: &mut HeaderMap, limit: u32, decision: RateDecision) {
    headers.insert("X-RateLimit-Limit", HeaderValue::from(limit));
    headers.insert("X-RateLimit-Remaining", HeaderValue::from(decision.remaining));
    headers.insert(
        "X-RateLimit-Reset",
        HeaderValue::from(decision.reset_after_secs),
    );
}

pub async fn rate_limit_middleware(
    State(state): State<SecurityState>,
    request: Request,
    next: Next,
) -> Response {
    let ip = client_ip(&request);
    let decision = state.rate_limiter.check(&ip);
    let limit = state.config.rate_limit_per_minute;

    if !decision.allowed {
        warn!(
            "Rate limit exceeded for IP: {} on path: {}",
            sanitize_for_log(&ip),
            request.uri().path()
        );

        let mut response = StatusCode::TOO_MANY_REQUESTS.into_response();
        insert_rate_headers(response.headers_mut(), limit, decision);
        response.headers_mut().insert(
            "Retry-After",
            HeaderValue::from(decision.reset_after_secs),
        );
        return response;
    }

    let mut response = next.run(request).await;
    insert_rate_headers(response.headers_mut(), limit, decision);
    response
}

pub async fn security_headers_middleware(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert(
        "X-Content-Type-Options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        "Strict-Transport-Security",
        HeaderValue::from_static("max-age=31536000; includeSubDomains"),
    );
    headers.insert(
        "Content-Security-Policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    headers.insert("Referrer-Policy", HeaderValue::from_static("no-referrer"));
    headers.insert(
        "Cache-Control",
        HeaderValue::from_static("no-store, no-cache, must-revalidate"),
    );
    headers.remove("Server");

    response
}

pub async fn logging_middleware(
    State(state): State<SecurityState>,
    request: Request,
    next: Next,
) -> Response {
    if !state.config.log_requests {
        return next.run(request).await;
    }

    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let ip = client_ip(&request);
    let log_ip = if state.config.sanitize_logs {
        sanitize_for_log(&ip)
    } else {
        ip
    };

    let response = next.run(request).await;
    let duration_ms = start.elapsed().as_millis() as u64;
    let status = response.status().as_u16();

    if response.status().is_server_error() {
        error!(%method, %path, status, duration_ms, client_ip = %log_ip, "Request failed");
    } else if response.status().is_client_error() {
        warn!(%method, %path, status, duration_ms, client_ip = %log_ip, "Client error");
    } else {
        info!(%method, %path, status, duration_ms, client_ip = %log_ip, "Request completed");
    }

    response
}

/// Rejects requests whose declared Content-Length exceeds the limit
pub async fn body_size_middleware(
    State(state): State<SecurityState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if let Some(length) = request
        .headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
        && length > state.config.max_request_size
    {
        warn!(
            "Request body too large: {} bytes (max: {})",
            length, state.config.max_request_size
        );
        return Err(StatusCode::PAYLOAD_TOO_LARGE);
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter() {
        let limiter = RateLimiter::new(3);

        assert_eq!(limiter.check("127.0.0.1").remaining, 2);
        assert!(limiter.check("127.0.0.1").allowed);
        assert!(limiter.check("127.0.0.1").allowed);

        let denied = limiter.check("127.0.0.1");
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);

        assert!(limiter.check("192.168.1.1").allowed);
        assert_eq!(limiter.tracked_clients(), 2);
    }

    #[test]
    fn test_rate_window_resets() {
        let limiter = RateLimiter::with_window(1, Duration::ZERO);
        assert!(limiter.check("10.0.0.1").allowed);
        assert!(limiter.check("10.0.0.1").allowed);
    }

    #[test]
    fn test_sanitize_for_log() {
        assert_eq!(sanitize_for_log("short"), "*****");
        assert_eq!(sanitize_for_log("192.168.1.100"), "192.....100");
        assert_eq!(sanitize_for_log("2001:db8::ff00:42:8329"), "2001...8329");
        // Masking counts characters, so multi-byte input never splits a code point
        assert_eq!(sanitize_for_log("ÄÖÜäöüßéèê"), "ÄÖÜä...ßéèê");
        assert_eq!(sanitize_for_log("ÄÖÜäöüßé"), "********");
    }

    #[test]
    fn test_is_public_path() {
        let public = vec!["/health".to_string()];
        assert!(is_public_path("/health", &public));
        assert!(!is_public_path("/api/task/add", &public));
        assert!(!is_public_path("/gpu_info", &public));
    }

    #[test]
    fn test_presented_api_key() {
        let mut headers = HeaderMap::new();
        assert_eq!(presented_api_key(&headers), None);

        headers.insert("authorization", HeaderValue::from_static("Bearer abc"));
        assert_eq!(presented_api_key(&headers), Some("abc"));

        headers.insert("x-api-key", HeaderValue::from_static("xyz"));
        assert_eq!(presented_api_key(&headers), Some("xyz"));
    }
}
