//! One redistribution pass, end to end.
//!
//! [`Redistributor::run`] composes the stages: begin a pass, schedule with
//! the configured [`Partitioner`], execute the schedule, reconcile region
//! ids, verify and measure the new distribution, finish the pass.
//!
//! Configuration problems that one worker detects locally (bad weights, bad
//! ghost requests) are shared in the totals round: every worker rejects the
//! pass with a configuration error and the group stays usable. A failure
//! inside a round drops the pass unfinished, which poisons the group.

use hashbrown::HashSet;

use crate::algs::communicator::{Communicator, Round};
use crate::algs::exchange::allgather_bytes;
use crate::algs::reconcile::{RegionMap, reconcile};
use crate::algs::transfer::{ExchangeStats, run_schedule};
use crate::algs::wire::{WireReader, put_f64, put_u64};
use crate::config::RedistConfig;
use crate::data::item::{ItemCodec, Origin, WorkItem};
use crate::partitioning::{
    BalanceMetrics, Partitioner, ReplicaEntry, TransferSchedule, WeightedPartitioner,
    validate_weights,
};
use crate::redist_error::{PassWarning, RedistError};
use crate::topology::{PassGuard, Worker};

/// What this worker's schedule did.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScheduleSummary {
    pub items_out: usize,
    pub weight_out: f64,
    /// `(dest, items)` per destination, ascending.
    pub destinations: Vec<(usize, usize)>,
    pub replicas_out: usize,
    pub degenerate: bool,
}

impl ScheduleSummary {
    fn of(schedule: &TransferSchedule) -> Self {
        Self {
            items_out: schedule.items_out(),
            weight_out: schedule.weight_out(),
            destinations: schedule
                .entries()
                .iter()
                .map(|e| (e.dest, e.items.len()))
                .collect(),
            replicas_out: schedule.replicas().iter().map(|r| r.items.len()).sum(),
            degenerate: schedule.is_degenerate(),
        }
    }
}

/// Result of one pass on one worker.
#[derive(Clone, Debug)]
pub struct PassReport<T> {
    pub pass: u32,
    /// New local item set.
    pub items: Vec<WorkItem<T>>,
    /// Group-wide region numbering; empty if reconciliation was skipped.
    pub region_map: RegionMap,
    pub summary: ScheduleSummary,
    pub exchange: ExchangeStats,
    pub warnings: Vec<PassWarning>,
    /// Non-ghost weight per worker after the pass.
    pub balance: BalanceMetrics,
}

/// The redistribution pipeline over a partitioning strategy.
#[derive(Clone, Debug)]
pub struct Redistributor<P = WeightedPartitioner> {
    partitioner: P,
    reconcile: bool,
    verify: bool,
}

impl Redistributor<WeightedPartitioner> {
    /// Weighted partitioning as configured in `cfg`.
    pub fn from_config(cfg: &RedistConfig) -> Self {
        Self::new(WeightedPartitioner::from_config(cfg)).verify_partition(cfg.verify_partition)
    }
}

impl<P: Partitioner> Redistributor<P> {
    pub fn new(partitioner: P) -> Self {
        Self {
            partitioner,
            reconcile: true,
            verify: false,
        }
    }

    /// Skip region reconciliation (the report's map stays empty).
    pub fn reconcile_regions(mut self, on: bool) -> Self {
        self.reconcile = on;
        self
    }

    /// Run the full duplicate check after every pass, also in release
    /// builds. Every worker of the group must agree on this setting.
    pub fn verify_partition(mut self, on: bool) -> Self {
        self.verify = on;
        self
    }

    pub fn partitioner(&self) -> &P {
        &self.partitioner
    }

    fn full_check(&self) -> bool {
        self.verify || cfg!(any(debug_assertions, feature = "check-invariants"))
    }

    /// Collective: one redistribution pass without ghost copies.
    pub fn run<C, T>(
        &self,
        worker: &Worker<'_, C>,
        items: Vec<WorkItem<T>>,
    ) -> Result<PassReport<T>, RedistError>
    where
        C: Communicator,
        T: ItemCodec,
    {
        self.run_with_ghosts(worker, items, &[])
    }

    /// Collective: one pass that also copies `ghosts` (local indices into
    /// `items`) to the named workers. Copies arrive flagged as ghosts and do
    /// not count towards the partition.
    pub fn run_with_ghosts<C, T>(
        &self,
        worker: &Worker<'_, C>,
        items: Vec<WorkItem<T>>,
        ghosts: &[ReplicaEntry],
    ) -> Result<PassReport<T>, RedistError>
    where
        C: Communicator,
        T: ItemCodec,
    {
        let (rank, size) = (worker.rank(), worker.size());
        let weights: Vec<f64> = items
            .iter()
            .map(|it| if it.ghost { 0.0 } else { it.weight })
            .collect();
        let preflight =
            validate_weights(&weights).and_then(|_| check_ghosts(rank, size, items.len(), ghosts));

        let pass = worker.begin_pass()?;
        let mut warnings = Vec::new();

        let mut schedule = match self.partitioner.schedule(worker, &pass, &weights, preflight) {
            Ok(s) => s,
            // the whole group agreed to reject; no round is left open
            Err(e) if e.is_configuration() => {
                pass.finish();
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        if schedule.is_degenerate() {
            warnings.push(PassWarning::DegenerateInput { pass: pass.id() });
        }
        for g in ghosts {
            schedule = schedule.with_replica(g.dest, g.items.clone())?;
        }
        let summary = ScheduleSummary::of(&schedule);
        let before = items.iter().filter(|it| !it.ghost).count() as u64;

        let (mut items, exchange) = run_schedule(worker, &pass, &schedule, items)?;

        let region_map = if self.reconcile {
            reconcile(worker, &pass, &mut items)?
        } else {
            RegionMap::default()
        };

        let balance = match self.verify_pass(worker, &pass, &items, before) {
            Err(e) if !matches!(e, RedistError::PartitionViolation(_)) => return Err(e),
            checked => checked,
        };
        let id = pass.id();
        pass.finish();
        Ok(PassReport {
            pass: id,
            items,
            region_map,
            summary,
            exchange,
            warnings,
            balance: balance?,
        })
    }

    /// Verify round: per-worker loads, item conservation and, when enabled,
    /// origin uniqueness. Every worker reaches the same verdict. A violation
    /// is reported after the pass has been finished, since all rounds have
    /// drained by then.
    fn verify_pass<C, T>(
        &self,
        worker: &Worker<'_, C>,
        pass: &PassGuard<'_, C>,
        items: &[WorkItem<T>],
        before: u64,
    ) -> Result<BalanceMetrics, RedistError>
    where
        C: Communicator,
    {
        let tags = pass.tags(Round::Verify);
        let owned = || items.iter().filter(|it| !it.ghost);
        let mut buf = Vec::with_capacity(24);
        put_f64(&mut buf, owned().map(|it| it.weight).sum());
        put_u64(&mut buf, owned().count() as u64);
        put_u64(&mut buf, before);

        let mut loads = Vec::with_capacity(worker.size());
        let (mut total_before, mut total_after) = (0u64, 0u64);
        for (r, bytes) in allgather_bytes(worker.comm(), tags, buf)?.iter().enumerate() {
            let (w, after, before) = decode_verify(bytes)
                .map_err(|reason| RedistError::MalformedRecord { neighbor: r, reason })?;
            loads.push(w);
            total_after += after;
            total_before += before;
        }

        let mut violation = None;
        if total_before != total_after {
            violation = Some(format!(
                "{total_before} items before pass {}, {total_after} after",
                pass.id()
            ));
        }
        if self.full_check() {
            let mut mine = Vec::new();
            for it in owned() {
                put_u64(&mut mine, it.origin.rank as u64);
                put_u64(&mut mine, it.origin.local_id);
            }
            let mut seen: HashSet<Origin> = HashSet::new();
            let gathered = allgather_bytes(worker.comm(), pass.tags(Round::VerifyOrigins), mine)?;
            for (r, bytes) in gathered.iter().enumerate() {
                let origins = decode_origins(bytes)
                    .map_err(|reason| RedistError::MalformedRecord { neighbor: r, reason })?;
                for o in origins {
                    if !seen.insert(o) && violation.is_none() {
                        violation = Some(format!(
                            "item ({}, {}) is owned twice after pass {}",
                            o.rank,
                            o.local_id,
                            pass.id()
                        ));
                    }
                }
            }
        }

        let balance = BalanceMetrics::from_loads(loads);
        match violation {
            Some(msg) => {
                log::warn!("rank {}: {msg}", worker.rank());
                Err(RedistError::PartitionViolation(msg))
            }
            None => {
                log::debug!(
                    "rank {}: pass {} balanced to max {:.3} (imbalance {:.3})",
                    worker.rank(),
                    pass.id(),
                    balance.max,
                    balance.imbalance
                );
                Ok(balance)
            }
        }
    }
}

fn check_ghosts(rank: usize, size: usize, n: usize, ghosts: &[ReplicaEntry]) -> Result<(), RedistError> {
    for g in ghosts {
        if g.dest >= size {
            return Err(RedistError::RankOutOfRange { rank: g.dest, size });
        }
        if g.dest == rank {
            return Err(RedistError::InvalidConfig(format!(
                "rank {rank} asked for ghost copies on itself"
            )));
        }
        if let Some(&i) = g.items.iter().find(|&&i| i >= n) {
            return Err(RedistError::InvalidConfig(format!(
                "ghost index {i} out of range ({n} local items)"
            )));
        }
    }
    Ok(())
}

fn decode_verify(bytes: &[u8]) -> Result<(f64, u64, u64), String> {
    let mut r = WireReader::new(bytes);
    let w = r.read_f64()?;
    let after = r.read_u64()?;
    let before = r.read_u64()?;
    r.finish()?;
    Ok((w, after, before))
}

fn decode_origins(bytes: &[u8]) -> Result<Vec<Origin>, String> {
    if bytes.len() % 16 != 0 {
        return Err(format!("{} bytes is not a whole number of origins", bytes.len()));
    }
    let mut r = WireReader::new(bytes);
    let mut out = Vec::with_capacity(bytes.len() / 16);
    while r.remaining() > 0 {
        let rank = u32::try_from(r.read_u64()?).map_err(|e| e.to_string())?;
        out.push(Origin {
            rank,
            local_id: r.read_u64()?,
        });
    }
    Ok(out)
}
