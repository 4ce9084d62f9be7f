//! Minimum-energy-cost provider selection
//!
//! ```text
//! snapshot of providers
//!          ↓
//! per candidate (bounded concurrency): price → duration → cost
//!          ↓
//! fold in candidate order, strict `<`  (first seen wins ties)
//!          ↓
//! Selection { winner, breakdown, every candidate's outcome }
//! ```
//!
//! A candidate that cannot be priced is skipped and recorded, it never fails
//! the run. The run as a whole is bounded by a deadline and a cancellation
//! token.

use futures::{FutureExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cost::CostBreakdown;
use super::duration::DurationEstimator;
use super::models::{ComputeProvider, ProviderId};
use super::rates::RateLookup;
use crate::error::BrokerError;

// ============================================================================
// Outcomes
// ============================================================================

/// Why a candidate dropped out of a selection run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipKind {
    /// Economics step of registration never completed
    Unregistered,
    /// Owner's minimum rate is above what the submitter will pay
    AboveMaxRate,
    RateLookup,
    DurationEstimate,
    Cost,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateFailure {
    pub provider_id: ProviderId,
    pub kind: SkipKind,
    pub reason: String,
}

impl CandidateFailure {
    fn new(provider_id: &ProviderId, kind: SkipKind, reason: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.clone(),
            kind,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CandidateOutcome {
    Priced {
        provider_id: ProviderId,
        breakdown: CostBreakdown,
    },
    Skipped(CandidateFailure),
}

/// Result of a successful run
#[derive(Debug, Clone)]
pub struct Selection {
    pub provider: ComputeProvider,
    pub breakdown: CostBreakdown,
    /// One entry per candidate, in candidate order
    pub outcomes: Vec<CandidateOutcome>,
}

impl Selection {
    pub fn failures(&self) -> impl Iterator<Item = &CandidateFailure> {
        self.outcomes.iter().filter_map(|o| match o {
            CandidateOutcome::Skipped(failure) => Some(failure),
            CandidateOutcome::Priced { .. } => None,
        })
    }
}

// ============================================================================
// Selector
// ============================================================================

#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Candidates evaluated at once
    pub max_concurrency: usize,
    /// Upper bound on a whole run
    pub deadline: Duration,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            deadline: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SelectionRequest<'a> {
    pub workload: &'a str,
    /// Dollars per minute the submitter will pay at most. `None` ignores
    /// provider minimum rates.
    pub max_rate_per_minute: Option<f64>,
}

impl<'a> SelectionRequest<'a> {
    pub fn new(workload: &'a str) -> Self {
        Self {
            workload,
            max_rate_per_minute: None,
        }
    }

    pub fn with_max_rate(mut self, max_rate_per_minute: Option<f64>) -> Self {
        self.max_rate_per_minute = max_rate_per_minute;
        self
    }
}

pub struct Selector {
    rates: Arc<dyn RateLookup>,
    durations: Arc<dyn DurationEstimator>,
    config: SelectorConfig,
}

impl Selector {
    pub fn new(
        rates: Arc<dyn RateLookup>,
        durations: Arc<dyn DurationEstimator>,
        config: SelectorConfig,
    ) -> Self {
        Self {
            rates,
            durations,
            config,
        }
    }

    /// Price one candidate
    pub async fn evaluate(
        &self,
        provider: &ComputeProvider,
        request: &SelectionRequest<'_>,
    ) -> Result<CostBreakdown, CandidateFailure> {
        let id = &provider.id;

        let economics = match &provider.economics {
            Some(economics) if provider.is_eligible() => economics,
            _ => {
                return Err(CandidateFailure::new(
                    id,
                    SkipKind::Unregistered,
                    "economic fields not registered",
                ));
            }
        };

        if let Some(max_rate) = request.max_rate_per_minute
            && economics.min_rate_per_minute > max_rate
        {
            return Err(CandidateFailure::new(
                id,
                SkipKind::AboveMaxRate,
                format!(
                    "minimum rate {} $/min exceeds offered {} $/min",
                    economics.min_rate_per_minute, max_rate
                ),
            ));
        }

        let price = match economics.price_per_kwh {
            Some(price) => price,
            None => self
                .rates
                .rate(economics.postal_code)
                .await
                .map_err(|e| CandidateFailure::new(id, SkipKind::RateLookup, e.to_string()))?,
        };

        let hours = self
            .durations
            .estimate(
                request.workload,
                provider.throughput_flops,
                provider.max_power_watts,
            )
            .await
            .map_err(|e| CandidateFailure::new(id, SkipKind::DurationEstimate, e.to_string()))?;

        CostBreakdown::compute(hours, price, provider.max_power_watts)
            .map_err(|e| CandidateFailure::new(id, SkipKind::Cost, e.to_string()))
    }

    /// Pick the candidate with the lowest energy cost.
    ///
    /// `candidates` is copied up front; ties go to the earliest candidate.
    pub async fn select(
        &self,
        candidates: &[ComputeProvider],
        request: &SelectionRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<Selection, BrokerError> {
        let candidates = candidates.to_vec();
        info!(
            candidates = candidates.len(),
            max_concurrency = self.config.max_concurrency,
            "Starting provider selection"
        );

        // Boxed so the stream holds plain `Send` futures
        let pending: Vec<_> = candidates
            .iter()
            .map(|provider| {
                async move { (provider, self.evaluate(provider, request).await) }.boxed()
            })
            .collect();
        let evaluations = futures::stream::iter(pending)
            .buffered(self.config.max_concurrency.max(1))
            .collect::<Vec<_>>();

        let results = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Provider selection cancelled");
                return Err(BrokerError::Cancelled);
            }
            finished = tokio::time::timeout(self.config.deadline, evaluations) => match finished {
                Ok(results) => results,
                Err(_) => {
                    warn!(deadline = ?self.config.deadline, "Provider selection exceeded its deadline");
                    return Err(BrokerError::DeadlineExceeded(self.config.deadline));
                }
            },
        };

        let mut best: Option<(&ComputeProvider, CostBreakdown)> = None;
        let mut outcomes = Vec::with_capacity(results.len());

        for (provider, result) in results {
            match result {
                Ok(breakdown) => {
                    debug!(
                        provider_id = %provider.id,
                        hours = breakdown.duration_hours,
                        price = breakdown.price_per_kwh,
                        "Candidate costs ${:.6}",
                        breakdown.cost
                    );
                    if best.as_ref().is_none_or(|(_, b)| breakdown.cost < b.cost) {
                        best = Some((provider, breakdown));
                    }
                    outcomes.push(CandidateOutcome::Priced {
                        provider_id: provider.id.clone(),
                        breakdown,
                    });
                }
                Err(failure) => {
                    warn!(
                        provider_id = %failure.provider_id,
                        kind = ?failure.kind,
                        "Skipping candidate: {}",
                        failure.reason
                    );
                    outcomes.push(CandidateOutcome::Skipped(failure));
                }
            }
        }

        let Some((provider, breakdown)) = best else {
            let failures = outcomes
                .into_iter()
                .filter_map(|o| match o {
                    CandidateOutcome::Skipped(failure) => Some(failure),
                    CandidateOutcome::Priced { .. } => None,
                })
                .collect();
            return Err(BrokerError::NoEligibleProvider { failures });
        };

        info!(
            provider_id = %provider.id,
            "Selected provider at ${:.6} ({:.3} h, {} $/kWh)",
            breakdown.cost,
            breakdown.duration_hours,
            breakdown.price_per_kwh
        );

        Ok(Selection {
            provider: provider.clone(),
            breakdown,
            outcomes,
        })
    }
}
