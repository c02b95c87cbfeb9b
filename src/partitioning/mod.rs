//! Weighted work partitioning.
//!
//! The partitioner turns the local item weights of every worker into a
//! [`TransferSchedule`] per worker. It costs one collective (the per-worker
//! totals); everything after that is pure computation that every worker
//! repeats identically for the global part ([`QuotaPlan`]) and privately for
//! its own items.

pub mod metrics;
pub mod quota;
pub mod schedule;

pub use metrics::BalanceMetrics;
pub use quota::{Flow, Quota, QuotaPlan};
pub use schedule::{ReplicaEntry, ScheduleEntry, TransferSchedule};

use rayon::slice::ParallelSliceMut;
use std::cmp::Ordering;

use crate::algs::communicator::{Communicator, Round, RoundTags};
use crate::algs::exchange::allgather_bytes;
use crate::algs::wire::{WireReader, put_f64, put_u64};
use crate::redist_error::RedistError;
use crate::topology::{PassGuard, Worker};

/// Below this many items the local sort stays serial.
const PAR_SORT_THRESHOLD: usize = 1 << 14;

/// Weight and item count of one worker.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct LoadSummary {
    pub weight: f64,
    pub count: u64,
}

/// Pipeline capability "can partition".
pub trait Partitioner {
    /// Collective: every worker calls this in the same pass.
    ///
    /// `preflight` is the caller's own verdict on its input. A failure on
    /// any worker is shared in the totals round, so either every worker
    /// gets a schedule or every worker gets a configuration error.
    fn schedule<C: Communicator>(
        &self,
        worker: &Worker<'_, C>,
        pass: &PassGuard<'_, C>,
        weights: &[f64],
        preflight: Result<(), RedistError>,
    ) -> Result<TransferSchedule, RedistError>;
}

/// Reject negative, NaN and infinite weights.
pub fn validate_weights(weights: &[f64]) -> Result<(), RedistError> {
    match weights
        .iter()
        .enumerate()
        .find(|(_, w)| !(w.is_finite() && **w >= 0.0))
    {
        Some((index, &weight)) => Err(RedistError::InvalidWeight { index, weight }),
        None => Ok(()),
    }
}

const TOTALS_OK: u8 = 0;
const TOTALS_REJECTED: u8 = 1;

/// Collective: every worker's [`LoadSummary`], indexed by rank.
///
/// A worker passing `Err` still takes part in the round and gets its own
/// error back; every other worker gets [`RedistError::PeerRejected`] naming
/// the lowest rejecting rank.
pub fn gather_totals<C: Communicator>(
    worker: &Worker<'_, C>,
    tags: RoundTags,
    mine: Result<LoadSummary, RedistError>,
) -> Result<Vec<LoadSummary>, RedistError> {
    let mut buf = Vec::with_capacity(17);
    match &mine {
        Ok(load) => {
            buf.push(TOTALS_OK);
            put_f64(&mut buf, load.weight);
            put_u64(&mut buf, load.count);
        }
        Err(e) => {
            buf.push(TOTALS_REJECTED);
            buf.extend_from_slice(e.to_string().as_bytes());
        }
    }
    let all = allgather_bytes(worker.comm(), tags, buf)?;
    let mut loads = Vec::with_capacity(all.len());
    let mut rejected = None;
    for (rank, bytes) in all.iter().enumerate() {
        match decode_load(bytes) {
            Ok(Ok(load)) => loads.push(load),
            Ok(Err(reason)) => {
                rejected.get_or_insert(RedistError::PeerRejected { rank, reason });
            }
            Err(reason) => return Err(RedistError::MalformedRecord { neighbor: rank, reason }),
        }
    }
    mine?;
    match rejected {
        Some(e) => Err(e),
        None => Ok(loads),
    }
}

/// A load, or the reason the sender rejected the pass.
fn decode_load(bytes: &[u8]) -> Result<Result<LoadSummary, String>, String> {
    let Some((&status, body)) = bytes.split_first() else {
        return Err("empty totals record".into());
    };
    match status {
        TOTALS_OK => {
            let mut r = WireReader::new(body);
            let weight = r.read_f64()?;
            let count = r.read_u64()?;
            r.finish()?;
            Ok(Ok(LoadSummary { weight, count }))
        }
        TOTALS_REJECTED => Ok(Err(String::from_utf8_lossy(body).into_owned())),
        s => Err(format!("unknown totals status {s}")),
    }
}

/// Quota-driven greedy partitioner.
///
/// Items are visited heaviest first; each one goes to the destination with
/// the largest remaining quota (lowest rank on ties) when that brings the
/// quota closer to zero, i.e. when `w < 2 * remaining * (1 + tolerance)`,
/// and it fits in what is left of the flow's [`Quota::cap`]. Items are
/// atomic; an item heavier than every useful quota stays put. The caps keep
/// the heaviest load of the group from growing, even when several sources
/// feed the same destination.
#[derive(Clone, Debug, Default)]
pub struct WeightedPartitioner {
    pub tolerance: f64,
    pub fractions: Option<Vec<f64>>,
}

impl WeightedPartitioner {
    pub fn from_config(cfg: &crate::config::RedistConfig) -> Self {
        Self {
            tolerance: cfg.tolerance,
            fractions: cfg.target_fractions.clone(),
        }
    }

    fn normalized_fractions(&self, size: usize) -> Vec<f64> {
        crate::config::RedistConfig {
            target_fractions: self.fractions.clone(),
            ..Default::default()
        }
        .fractions(size)
    }

    /// The local half of the partitioner: pick items for `rank`'s quotas.
    pub fn plan_local(&self, rank: usize, weights: &[f64], plan: &QuotaPlan) -> Vec<ScheduleEntry> {
        let quotas = plan.outgoing(rank);
        if quotas.is_empty() {
            return Vec::new();
        }

        let mut order: Vec<usize> = (0..weights.len()).filter(|&i| weights[i] > 0.0).collect();
        let heaviest_first = |a: &usize, b: &usize| -> Ordering {
            weights[*b].total_cmp(&weights[*a]).then(a.cmp(b))
        };
        if order.len() >= PAR_SORT_THRESHOLD {
            order.par_sort_unstable_by(heaviest_first);
        } else {
            order.sort_unstable_by(heaviest_first);
        }

        let mut remaining: Vec<f64> = quotas.iter().map(|q| q.amount).collect();
        let mut room: Vec<f64> = quotas.iter().map(|q| q.cap).collect();
        let mut picked: Vec<Vec<usize>> = vec![Vec::new(); quotas.len()];
        let mut moved: Vec<f64> = vec![0.0; quotas.len()];
        let slack = 1.0 + self.tolerance;
        for idx in order {
            let w = weights[idx];
            // largest remaining quota; strict `>` keeps the lowest rank on ties
            let mut best = 0;
            for j in 1..remaining.len() {
                if remaining[j] > remaining[best] {
                    best = j;
                }
            }
            if w < 2.0 * remaining[best] * slack && w <= room[best] {
                remaining[best] -= w;
                room[best] -= w;
                moved[best] += w;
                picked[best].push(idx);
            }
        }

        quotas
            .iter()
            .zip(picked)
            .zip(moved)
            .filter(|((_, items), _)| !items.is_empty())
            .map(|((q, items), weight)| ScheduleEntry {
                dest: q.dest,
                items,
                weight,
            })
            .collect()
    }
}

impl Partitioner for WeightedPartitioner {
    fn schedule<C: Communicator>(
        &self,
        worker: &Worker<'_, C>,
        pass: &PassGuard<'_, C>,
        weights: &[f64],
        preflight: Result<(), RedistError>,
    ) -> Result<TransferSchedule, RedistError> {
        let (rank, size) = (worker.rank(), worker.size());
        let mine = preflight.and_then(|_| validate_weights(weights)).map(|_| LoadSummary {
            weight: weights.iter().sum(),
            count: weights.len() as u64,
        });
        let loads = gather_totals(worker, pass.tags(Round::Totals), mine)?;
        let totals: Vec<f64> = loads.iter().map(|l| l.weight).collect();
        let total: f64 = totals.iter().sum();

        if total <= 0.0 {
            log::warn!(
                "rank {rank}: pass {} has zero total weight over {} items; schedule is a no-op",
                pass.id(),
                loads.iter().map(|l| l.count).sum::<u64>()
            );
            return Ok(TransferSchedule::degenerate(pass.id(), rank, size, weights.len()));
        }

        let plan = QuotaPlan::compute(&totals, &self.normalized_fractions(size));
        let entries = self.plan_local(rank, weights, &plan);
        let schedule = TransferSchedule::from_entries(pass.id(), rank, size, weights.len(), entries)?;
        log::debug!(
            "rank {rank}: pass {} schedules {} items ({:.3} of {:.3}) to {} workers",
            pass.id(),
            schedule.items_out(),
            schedule.weight_out(),
            totals[rank],
            schedule.entries().len()
        );
        Ok(schedule)
    }
}

#[cfg(test)]
#[path = "tests/partition_property_tests.rs"]
mod partition_property_tests;
