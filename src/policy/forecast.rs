//! `HeatForecaster`: spec.md §4.6.2 step 3 names only "a chain of
//! sub-forecasters" with no concrete algorithm. This supplies one concrete
//! forecaster and the chain structure the wording implies (decision
//! recorded in DESIGN.md).
use std::collections::HashMap;

use crate::heatmap::HeatRange;

/// A single forecasting strategy over one pid's `HeatRange` list. `history`
/// is the real, just-observed heat; implementations that need memory across
/// ticks record it here before returning the prediction.
pub trait Forecaster: Send {
    fn forecast(&mut self, history: &[HeatRange], now_ns: u64) -> Vec<HeatRange>;
}

/// Extrapolates each range's heat linearly from its last two observed
/// decayed values. Falls back to identity when there is no prior sample to
/// compare against.
#[derive(Default)]
pub struct LinearTrendForecaster {
    last_seen: HashMap<u64, (u64, f64)>,
}

impl Forecaster for LinearTrendForecaster {
    fn forecast(&mut self, history: &[HeatRange], _now_ns: u64) -> Vec<HeatRange> {
        let predicted = history
            .iter()
            .map(|hr| {
                let predicted = match self.last_seen.get(&hr.addr) {
                    Some(&(prev_ns, prev_heat)) if hr.updated_ns > prev_ns => {
                        let dt = (hr.updated_ns - prev_ns) as f64;
                        let slope = (hr.heat - prev_heat) / dt.max(1.0);
                        (hr.heat + slope * dt).clamp(0.0, f64::MAX)
                    }
                    _ => hr.heat,
                };
                HeatRange { heat: predicted, ..*hr }
            })
            .collect();

        self.observe(history);
        predicted
    }
}

impl LinearTrendForecaster {
    /// Records this tick's observed heats as history for the next
    /// `forecast` call.
    pub fn observe(&mut self, history: &[HeatRange]) {
        for hr in history {
            self.last_seen.insert(hr.addr, (hr.updated_ns, hr.heat));
        }
    }
}

/// Composes forecasters in sequence; each stage's output feeds the next.
#[derive(Default)]
pub struct ForecasterChain {
    stages: Vec<Box<dyn Forecaster>>,
}

impl ForecasterChain {
    pub fn new(stages: Vec<Box<dyn Forecaster>>) -> Self {
        ForecasterChain { stages }
    }

    pub fn forecast(&mut self, history: &[HeatRange], now_ns: u64) -> Vec<HeatRange> {
        if self.stages.is_empty() {
            return history.to_vec();
        }

        let mut current = history.to_vec();
        for stage in &mut self.stages {
            current = stage.forecast(&current, now_ns);
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_forecast_without_history() {
        let mut forecaster = LinearTrendForecaster::default();
        let hr = HeatRange { addr: 0x1000, length: 1, heat: 0.5, created_ns: 0, updated_ns: 1 };
        let forecast = forecaster.forecast(&[hr], 2);
        assert_eq!(forecast[0].heat, 0.5);
    }

    #[test]
    fn extrapolates_linear_trend() {
        let mut forecaster = LinearTrendForecaster::default();
        let first = HeatRange { addr: 0x1000, length: 1, heat: 0.2, created_ns: 0, updated_ns: 1_000_000_000 };
        forecaster.observe(&[first]);

        let second = HeatRange { addr: 0x1000, length: 1, heat: 0.4, created_ns: 0, updated_ns: 2_000_000_000 };
        let forecast = forecaster.forecast(&[second], 3_000_000_000);
        assert!(forecast[0].heat > 0.4);
    }

    #[test]
    fn empty_chain_is_identity() {
        let mut chain = ForecasterChain::default();
        let hr = HeatRange { addr: 0, length: 1, heat: 0.1, created_ns: 0, updated_ns: 0 };
        let forecast = chain.forecast(&[hr], 0);
        assert_eq!(forecast.len(), 1);
    }
}
