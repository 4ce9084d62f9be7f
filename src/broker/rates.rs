//! Local electricity price lookup
//!
//! A postal code is geocoded to latitude/longitude, then the utility-rate
//! service is asked for the average rate at those coordinates.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::retry::RetryPolicy;
use crate::api::http::{HttpSecurityConfig, SecureHttpClient};
use crate::error::UpstreamError;

const GEOCODER: &str = "geocoder";
const UTILITY_RATES: &str = "utility rates";

/// Resolves a postal code to a price in dollars per kWh
#[async_trait]
pub trait RateLookup: Send + Sync {
    async fn rate(&self, postal_code: u32) -> Result<f64, UpstreamError>;
}

/// Which customer class's rate to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateSector {
    Residential,
    Commercial,
    Industrial,
}

impl std::str::FromStr for RateSector {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "residential" => Ok(RateSector::Residential),
            "commercial" => Ok(RateSector::Commercial),
            "industrial" => Ok(RateSector::Industrial),
            other => Err(anyhow::anyhow!("Unknown rate sector: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateClientConfig {
    /// Geocoder search endpoint (Nominatim-compatible)
    pub geocoder_url: String,
    /// Utility rate endpoint (NREL utility_rates v3 compatible)
    pub rates_url: String,
    pub rates_api_key: String,
    /// Country passed to the geocoder
    pub country: String,
    pub sector: RateSector,
    pub retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
struct GeocodeHit {
    lat: String,
    lon: String,
}

#[derive(Debug, Deserialize)]
struct UtilityRatesResponse {
    #[serde(default)]
    outputs: Option<UtilityRatesOutputs>,
    #[serde(default)]
    errors: Vec<String>,
}

/// Rates come back as numbers, or as the string "no data" where unknown
#[derive(Debug, Deserialize)]
struct UtilityRatesOutputs {
    #[serde(default)]
    residential: serde_json::Value,
    #[serde(default)]
    commercial: serde_json::Value,
    #[serde(default)]
    industrial: serde_json::Value,
    #[serde(default)]
    utility_name: Option<String>,
}

impl UtilityRatesOutputs {
    fn rate_for(&self, sector: RateSector) -> Option<f64> {
        let value = match sector {
            RateSector::Residential => &self.residential,
            RateSector::Commercial => &self.commercial,
            RateSector::Industrial => &self.industrial,
        };
        value.as_f64().filter(|r| r.is_finite() && *r >= 0.0)
    }
}

/// Geocoder + utility-rate client
pub struct UtilityRateClient {
    geocoder: SecureHttpClient,
    rates: SecureHttpClient,
    config: RateClientConfig,
}

impl UtilityRateClient {
    pub fn new(config: RateClientConfig, http: &HttpSecurityConfig) -> Result<Self> {
        Ok(Self {
            geocoder: SecureHttpClient::new(GEOCODER, http.clone())?,
            rates: SecureHttpClient::new(UTILITY_RATES, http.clone())?,
            config,
        })
    }

    /// Latitude and longitude of the first geocoder match
    pub async fn coordinates(&self, postal_code: u32) -> Result<(f64, f64), UpstreamError> {
        let query = [
            ("postalcode", format!("{:05}", postal_code)),
            ("country", self.config.country.clone()),
            ("format", "json".to_string()),
            ("limit", "1".to_string()),
        ];

        let hits: Vec<GeocodeHit> = self
            .config
            .retry
            .run("geocode", || {
                self.geocoder.get_json(&self.config.geocoder_url, &query)
            })
            .await?;

        let hit = hits
            .first()
            .ok_or(UpstreamError::UnknownLocation(postal_code))?;

        let parse = |field: &str, value: &str| {
            value.parse::<f64>().map_err(|_| UpstreamError::Malformed {
                service: GEOCODER,
                message: format!("{} is not a number: {}", field, value),
            })
        };

        Ok((parse("lat", &hit.lat)?, parse("lon", &hit.lon)?))
    }
}

#[async_trait]
impl RateLookup for UtilityRateClient {
    async fn rate(&self, postal_code: u32) -> Result<f64, UpstreamError> {
        let (lat, lon) = self.coordinates(postal_code).await?;

        let query = [
            ("api_key", self.config.rates_api_key.clone()),
            ("lat", lat.to_string()),
            ("lon", lon.to_string()),
        ];

        let response: UtilityRatesResponse = self
            .config
            .retry
            .run("utility rate lookup", || {
                self.rates.get_json(&self.config.rates_url, &query)
            })
            .await?;

        if !response.errors.is_empty() {
            return Err(UpstreamError::Malformed {
                service: UTILITY_RATES,
                message: response.errors.join("; "),
            });
        }

        let outputs = response.outputs.ok_or_else(|| UpstreamError::Malformed {
            service: UTILITY_RATES,
            message: "response has no outputs".to_string(),
        })?;

        let rate = outputs
            .rate_for(self.config.sector)
            .ok_or_else(|| UpstreamError::Malformed {
                service: UTILITY_RATES,
                message: format!("no {:?} rate for postal code {:05}", self.config.sector, postal_code),
            })?;

        debug!(
            postal_code = postal_code,
            utility = outputs.utility_name.as_deref().unwrap_or("unknown"),
            "Resolved rate {} $/kWh",
            rate
        );

        Ok(rate)
    }
}

/// Memoizes successful lookups per postal code. Failures are not cached.
///
/// Concurrent lookups of the same postal code share one upstream call.
pub struct CachedRateLookup {
    inner: Arc<dyn RateLookup>,
    cache: DashMap<u32, Arc<OnceCell<f64>>>,
}

impl CachedRateLookup {
    pub fn new(inner: Arc<dyn RateLookup>) -> Self {
        Self {
            inner,
            cache: DashMap::new(),
        }
    }

    pub fn cached(&self, postal_code: u32) -> Option<f64> {
        self.cache
            .get(&postal_code)
            .and_then(|cell| cell.get().copied())
    }

    /// Postal codes with a resolved rate
    pub fn len(&self) -> usize {
        self.cache
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RateLookup for CachedRateLookup {
    async fn rate(&self, postal_code: u32) -> Result<f64, UpstreamError> {
        let cell = self.cache.entry(postal_code).or_default().clone();

        let rate = cell
            .get_or_try_init(|| async {
                let rate = self.inner.rate(postal_code).await?;
                info!("Cached energy rate for postal code {:05}: {} $/kWh", postal_code, rate);
                Ok::<_, UpstreamError>(rate)
            })
            .await?;
        Ok(*rate)
    }
}
