//! Configuration for redistribution passes.

use serde::{Deserialize, Serialize};

use crate::redist_error::RedistError;

/// Shape of the reduction tree.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReduceTopology {
    /// Every worker sends straight to the root.
    Linear,
    /// Binomial tree rooted at the root; `ceil(log2 n)` levels.
    #[default]
    BinomialTree,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedistConfig {
    /// Relative target weight per worker; `None` balances uniformly.
    pub target_fractions: Option<Vec<f64>>,
    /// Relative slack for the "worth moving" test; `0.0` is strict.
    pub tolerance: f64,
    pub reduce_topology: ReduceTopology,
    /// Default root for reductions.
    pub root: usize,
    /// Run the collective partition check after every pass, also in
    /// release builds.
    pub verify_partition: bool,
}

impl Default for RedistConfig {
    fn default() -> Self {
        Self {
            target_fractions: None,
            tolerance: 0.0,
            reduce_topology: ReduceTopology::BinomialTree,
            root: 0,
            verify_partition: false,
        }
    }
}

impl RedistConfig {
    /// Set the relative target of workers `start..=stop` to `weight`; other
    /// workers keep their previous target (1.0 when unset).
    pub fn with_weight_range(mut self, size: usize, start: usize, stop: usize, weight: f64) -> Self {
        let fr = self.target_fractions.get_or_insert_with(|| vec![1.0; size]);
        if fr.len() < size {
            fr.resize(size, 1.0);
        }
        for r in start..=stop.min(size.saturating_sub(1)) {
            fr[r] = weight;
        }
        self
    }

    pub fn validate(&self, size: usize) -> Result<(), RedistError> {
        if size == 0 {
            return Err(RedistError::ZeroWorkers);
        }
        if self.root >= size {
            return Err(RedistError::RankOutOfRange {
                rank: self.root,
                size,
            });
        }
        if !(self.tolerance.is_finite() && self.tolerance >= 0.0) {
            return Err(RedistError::InvalidConfig(format!(
                "tolerance must be a finite non-negative number, got {}",
                self.tolerance
            )));
        }
        if let Some(fr) = &self.target_fractions {
            if fr.len() != size {
                return Err(RedistError::InvalidTargets(format!(
                    "{} fractions for {size} workers",
                    fr.len()
                )));
            }
            if let Some((r, f)) = fr
                .iter()
                .enumerate()
                .find(|(_, f)| !(f.is_finite() && **f >= 0.0))
            {
                return Err(RedistError::InvalidTargets(format!(
                    "fraction {f} for worker {r}"
                )));
            }
            if fr.iter().sum::<f64>() <= 0.0 {
                return Err(RedistError::InvalidTargets("all fractions are zero".into()));
            }
        }
        Ok(())
    }

    /// Normalized per-worker fractions summing to one.
    pub fn fractions(&self, size: usize) -> Vec<f64> {
        match &self.target_fractions {
            Some(fr) if fr.len() == size => {
                let sum: f64 = fr.iter().sum();
                fr.iter().map(|f| f / sum).collect()
            }
            _ => vec![1.0 / size as f64; size],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_range_sets_inclusive_span() {
        let cfg = RedistConfig::default().with_weight_range(4, 1, 2, 3.0);
        assert_eq!(cfg.target_fractions.as_deref(), Some(&[1.0, 3.0, 3.0, 1.0][..]));
        assert_eq!(cfg.fractions(4), vec![0.125, 0.375, 0.375, 0.125]);
        cfg.validate(4).unwrap();
    }

    #[test]
    fn rejects_bad_targets() {
        let cfg = RedistConfig {
            target_fractions: Some(vec![1.0, -1.0]),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(2), Err(RedistError::InvalidTargets(_))));
        assert!(matches!(cfg.validate(3), Err(RedistError::InvalidTargets(_))));
        assert!(matches!(
            RedistConfig::default().validate(0),
            Err(RedistError::ZeroWorkers)
        ));
        let zero = RedistConfig {
            target_fractions: Some(vec![0.0, 0.0]),
            ..Default::default()
        };
        assert!(zero.validate(2).unwrap_err().is_configuration());
    }

    #[test]
    fn uniform_by_default() {
        assert_eq!(RedistConfig::default().fractions(4), vec![0.25; 4]);
    }
}
