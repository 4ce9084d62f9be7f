//! Energy cost of running a workload

use serde::{Deserialize, Serialize};

use crate::error::BrokerError;

/// Inputs and result of one cost estimate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub duration_hours: f64,
    pub price_per_kwh: f64,
    pub power_watts: u32,
    pub energy_kwh: f64,
    /// Dollars
    pub cost: f64,
}

/// Dollar cost of drawing `power_watts` for `duration_hours` at `price_per_kwh`.
///
/// Rejects negative or non-finite durations and prices and non-positive power
/// instead of producing a number that would distort comparisons.
pub fn energy_cost(
    duration_hours: f64,
    price_per_kwh: f64,
    power_watts: f64,
) -> Result<f64, BrokerError> {
    if !duration_hours.is_finite() || duration_hours < 0.0 {
        return Err(BrokerError::validation(format!(
            "duration must be a non-negative number of hours, got {}",
            duration_hours
        )));
    }
    if !price_per_kwh.is_finite() || price_per_kwh < 0.0 {
        return Err(BrokerError::validation(format!(
            "price must be a non-negative number of dollars per kWh, got {}",
            price_per_kwh
        )));
    }
    if !power_watts.is_finite() || power_watts <= 0.0 {
        return Err(BrokerError::validation(format!(
            "power must be a positive number of watts, got {}",
            power_watts
        )));
    }

    let power_kw = power_watts / 1000.0;
    let energy_kwh = power_kw * duration_hours;
    Ok(energy_kwh * price_per_kwh)
}

impl CostBreakdown {
    pub fn compute(
        duration_hours: f64,
        price_per_kwh: f64,
        power_watts: u32,
    ) -> Result<Self, BrokerError> {
        let cost = energy_cost(duration_hours, price_per_kwh, power_watts as f64)?;
        Ok(Self {
            duration_hours,
            price_per_kwh,
            power_watts,
            energy_kwh: power_watts as f64 / 1000.0 * duration_hours,
            cost,
        })
    }
}
