//! Load-balance metrics.

use serde::{Deserialize, Serialize};

/// Per-worker loads and derived imbalance.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BalanceMetrics {
    pub loads: Vec<f64>,
    pub max: f64,
    pub mean: f64,
    /// `max / mean`; `1.0` for an empty or all-zero load vector.
    pub imbalance: f64,
}

impl BalanceMetrics {
    pub fn from_loads(loads: Vec<f64>) -> Self {
        let max = loads.iter().copied().fold(0.0, f64::max);
        let mean = if loads.is_empty() {
            0.0
        } else {
            loads.iter().sum::<f64>() / loads.len() as f64
        };
        let imbalance = if mean > 0.0 { max / mean } else { 1.0 };
        Self {
            loads,
            max,
            mean,
            imbalance,
        }
    }
}
