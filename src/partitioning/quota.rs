//! Global weight flow between over- and under-loaded workers.
//!
//! Every worker computes the same [`QuotaPlan`] from the gathered totals, so
//! the plan itself never travels on the wire.
//!
//! Sources pick items without talking to each other, so each flow also
//! carries a hard capacity. A destination's headroom above its target (up
//! to the heaviest worker before the pass) is split between its incoming
//! flows in proportion to their amounts; no destination can end above the
//! old maximum however the sources round.

/// `amount` of weight planned to move from `from` to `to`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Flow {
    pub from: usize,
    pub to: usize,
    pub amount: f64,
}

/// One source's share of a flow: aim for `amount`, never exceed `cap`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Quota {
    pub dest: usize,
    pub amount: f64,
    pub cap: f64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct QuotaPlan {
    targets: Vec<f64>,
    flows: Vec<Flow>,
    max_load: f64,
}

impl QuotaPlan {
    /// Match surplus workers to deficit workers, both walked in ascending
    /// rank order. `fractions` must sum to one and have `totals.len()` entries.
    pub fn compute(totals: &[f64], fractions: &[f64]) -> Self {
        debug_assert_eq!(totals.len(), fractions.len());
        let total: f64 = totals.iter().sum();
        let targets: Vec<f64> = fractions.iter().map(|f| f * total).collect();
        let max_load = totals.iter().copied().fold(0.0, f64::max);
        if total <= 0.0 {
            return Self {
                targets,
                flows: Vec::new(),
                max_load,
            };
        }
        let eps = total * 1e-12;

        let mut surplus: Vec<(usize, f64)> = Vec::new();
        let mut deficit: Vec<(usize, f64)> = Vec::new();
        for (r, (&have, &want)) in totals.iter().zip(&targets).enumerate() {
            let excess = have - want;
            if excess > eps {
                surplus.push((r, excess));
            } else if excess < -eps {
                deficit.push((r, -excess));
            }
        }

        let mut flows = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < surplus.len() && j < deficit.len() {
            let amount = surplus[i].1.min(deficit[j].1);
            if amount > eps {
                flows.push(Flow {
                    from: surplus[i].0,
                    to: deficit[j].0,
                    amount,
                });
            }
            surplus[i].1 -= amount;
            deficit[j].1 -= amount;
            if surplus[i].1 <= eps {
                i += 1;
            }
            if deficit[j].1 <= eps {
                j += 1;
            }
        }
        Self {
            targets,
            flows,
            max_load,
        }
    }

    pub fn targets(&self) -> &[f64] {
        &self.targets
    }

    pub fn flows(&self) -> &[Flow] {
        &self.flows
    }

    /// Heaviest worker load before the pass.
    pub fn max_load(&self) -> f64 {
        self.max_load
    }

    /// Quotas of `rank`, ascending by destination.
    pub fn outgoing(&self, rank: usize) -> Vec<Quota> {
        let mut out: Vec<Quota> = self
            .flows
            .iter()
            .filter(|f| f.from == rank)
            .map(|f| {
                let headroom = (self.max_load - self.targets[f.to]).max(0.0);
                let share = f.amount / self.incoming(f.to);
                Quota {
                    dest: f.to,
                    amount: f.amount,
                    cap: f.amount + headroom * share,
                }
            })
            .collect();
        out.sort_by_key(|q| q.dest);
        out
    }

    /// Total weight planned to arrive at `rank`.
    pub fn incoming(&self, rank: usize) -> f64 {
        self.flows.iter().filter(|f| f.to == rank).map(|f| f.amount).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_source_splits_evenly() {
        let plan = QuotaPlan::compute(&[9.0, 0.0, 0.0], &[1.0 / 3.0; 3]);
        assert_eq!(plan.outgoing(0).len(), 2);
        for q in plan.outgoing(0) {
            assert!(q.dest == 1 || q.dest == 2);
            assert!((q.amount - 3.0).abs() < 1e-9);
            // sole feeder: the whole headroom up to the old maximum
            assert!((q.cap - 9.0).abs() < 1e-9);
        }
        assert!(plan.outgoing(1).is_empty());
    }

    #[test]
    fn lowest_ranks_matched_first() {
        let plan = QuotaPlan::compute(&[6.0, 6.0, 0.0, 0.0], &[0.25; 4]);
        assert_eq!(
            plan.flows(),
            &[
                Flow { from: 0, to: 2, amount: 3.0 },
                Flow { from: 1, to: 3, amount: 3.0 },
            ]
        );
    }

    #[test]
    fn shared_destination_splits_headroom() {
        let plan = QuotaPlan::compute(&[10.0, 10.0, 0.0], &[1.0 / 3.0; 3]);
        let (a, b) = (plan.outgoing(0)[0], plan.outgoing(1)[0]);
        assert_eq!((a.dest, b.dest), (2, 2));
        assert!((a.cap - 5.0).abs() < 1e-9 && (b.cap - 5.0).abs() < 1e-9);
        let target = plan.targets()[2];
        assert!(target + (a.cap - a.amount) + (b.cap - b.amount) <= plan.max_load() + 1e-9);
    }

    #[test]
    fn balanced_and_empty_need_no_flow() {
        assert!(QuotaPlan::compute(&[2.0, 2.0], &[0.5, 0.5]).flows().is_empty());
        assert!(QuotaPlan::compute(&[0.0, 0.0], &[0.5, 0.5]).flows().is_empty());
    }

    #[test]
    fn weighted_targets() {
        let plan = QuotaPlan::compute(&[4.0, 0.0], &[0.25, 0.75]);
        assert_eq!(plan.targets(), &[1.0, 3.0]);
        assert_eq!(plan.incoming(1), 3.0);
    }
}
