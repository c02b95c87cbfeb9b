//! Execute a [`TransferSchedule`]: move items, then copy ghosts.
//!
//! Two rounds, always both, on every worker:
//! 1. `Transfer`: one batch per destination with the items that leave.
//! 2. `Replicate`: one batch per destination with ghost copies.
//!
//! Received batches are decoded only after both rounds have completed, so
//! a malformed batch cannot leave the group half a round apart.

use std::collections::BTreeMap;

use crate::algs::communicator::{Communicator, Round};
use crate::algs::exchange::execute_round;
use crate::data::item::{ItemCodec, WorkItem, decode_batch, encode_batch};
use crate::debug_invariants::DebugInvariants;
use crate::partitioning::TransferSchedule;
use crate::redist_error::RedistError;
use crate::topology::{PassGuard, Worker};

/// Byte and item counts of one executed schedule.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExchangeStats {
    /// Bytes sent per destination, both rounds.
    pub bytes_sent: BTreeMap<usize, usize>,
    /// Bytes received per source, both rounds.
    pub bytes_received: BTreeMap<usize, usize>,
    pub items_sent: usize,
    pub items_received: usize,
    pub ghosts_received: usize,
}

fn pack<'s, T: ItemCodec>(
    round: Round,
    items: &[WorkItem<T>],
    batches: impl Iterator<Item = (usize, &'s [usize])>,
    ghost: bool,
) -> BTreeMap<usize, Vec<u8>> {
    batches
        .map(|(dest, idx)| {
            let body = encode_batch(round as u16, idx.iter().map(|&i| &items[i]), ghost);
            (dest, body)
        })
        .collect()
}

/// Collective: run `schedule` over this worker's `items`.
///
/// Returns the new local item set: kept items in their original order,
/// then moved-in items by source rank and send order, then ghost copies
/// in the same order.
pub fn run_schedule<C, T>(
    worker: &Worker<'_, C>,
    pass: &PassGuard<'_, C>,
    schedule: &TransferSchedule,
    items: Vec<WorkItem<T>>,
) -> Result<(Vec<WorkItem<T>>, ExchangeStats), RedistError>
where
    C: Communicator,
    T: ItemCodec,
{
    let rank = worker.rank();
    if schedule.source() != rank || schedule.pass() != pass.id() {
        return Err(RedistError::InvalidConfig(format!(
            "schedule for rank {} pass {} executed on rank {rank} pass {}",
            schedule.source(),
            schedule.pass(),
            pass.id()
        )));
    }
    if schedule.n_items() != items.len() {
        return Err(RedistError::ShapeMismatch {
            what: "schedule items",
            expected: schedule.n_items(),
            got: items.len(),
        });
    }

    schedule.debug_assert_invariants();

    let moves = pack(
        Round::Transfer,
        &items,
        schedule.entries().iter().map(|e| (e.dest, e.items.as_slice())),
        false,
    );
    let copies = pack(
        Round::Replicate,
        &items,
        schedule.replicas().iter().map(|r| (r.dest, r.items.as_slice())),
        true,
    );

    let mut stats = ExchangeStats {
        items_sent: schedule.items_out(),
        ..Default::default()
    };
    for (&dest, body) in moves.iter().chain(copies.iter()) {
        *stats.bytes_sent.entry(dest).or_default() += body.len();
    }

    let comm = worker.comm();
    let moved_in = execute_round(comm, pass.tags(Round::Transfer), &moves)?;
    let copied_in = execute_round(comm, pass.tags(Round::Replicate), &copies)?;

    for (&src, body) in moved_in.iter().chain(copied_in.iter()) {
        *stats.bytes_received.entry(src).or_default() += body.len();
    }

    let mut leaving = vec![false; items.len()];
    for i in schedule.moved() {
        leaving[i] = true;
    }
    let mut out: Vec<WorkItem<T>> = items
        .into_iter()
        .zip(leaving)
        .filter_map(|(it, gone)| (!gone).then_some(it))
        .collect();

    for (src, body) in &moved_in {
        let batch = decode_batch::<T>(*src, Round::Transfer as u16, body)?;
        stats.items_received += batch.len();
        out.extend(batch);
    }
    for (src, body) in &copied_in {
        let batch = decode_batch::<T>(*src, Round::Replicate as u16, body)?;
        stats.ghosts_received += batch.len();
        out.extend(batch);
    }

    log::debug!(
        "rank {rank}: pass {} sent {} items, received {} items and {} ghosts",
        pass.id(),
        stats.items_sent,
        stats.items_received,
        stats.ghosts_received
    );
    Ok((out, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::topology::WorkerGroup;

    #[test]
    fn single_worker_noop_keeps_order() {
        let group = WorkerGroup::new(NoComm).unwrap();
        let w = group.worker();
        let pass = w.begin_pass().unwrap();
        let items: Vec<WorkItem<u64>> = (0..4).map(|i| WorkItem::new(0, i, 1.0, i * 10)).collect();
        let sched = TransferSchedule::noop(pass.id(), 0, 1, items.len());
        let (out, stats) = run_schedule(&w, &pass, &sched, items.clone()).unwrap();
        pass.finish();
        assert_eq!(out, items);
        assert_eq!(stats, ExchangeStats::default());
    }

    #[test]
    fn foreign_schedule_is_rejected() {
        let group = WorkerGroup::new(NoComm).unwrap();
        let w = group.worker();
        let pass = w.begin_pass().unwrap();
        let sched = TransferSchedule::noop(pass.id() + 1, 0, 1, 0);
        let err = run_schedule::<_, ()>(&w, &pass, &sched, Vec::new()).unwrap_err();
        assert!(err.is_configuration());
        let sched = TransferSchedule::noop(pass.id(), 0, 1, 3);
        assert!(matches!(
            run_schedule::<_, ()>(&w, &pass, &sched, Vec::new()),
            Err(RedistError::ShapeMismatch { expected: 3, got: 0, .. })
        ));
        pass.finish();
    }
}
