//! Collective reduction of [`Statistic`]s.
//!
//! Partial statistics travel up a binomial tree (or straight to the root for
//! [`ReduceTopology::Linear`]) as framed messages. Each frame starts with a
//! status byte so that a failure below a node reaches the root instead of
//! leaving its parent waiting:
//!
//! | status | body                         |
//! |--------|------------------------------|
//! | 0      | `Statistic::to_wire` bytes   |
//! | 1      | configuration failure (utf8) |
//! | 2      | transport failure (utf8)     |
//!
//! The binomial tree works on virtual ranks `v = (rank - root) mod p`, so any
//! worker can be the root.

use crate::algs::communicator::{Communicator, Round, RoundTags};
use crate::algs::exchange::{recv_framed, send_framed};
use crate::config::ReduceTopology;
use crate::data::histogram::Histogram;
use crate::data::statistic::{Bounds, Statistic};
use crate::redist_error::RedistError;
use crate::topology::{PassGuard, Worker};
use num_traits::ToPrimitive;

const FRAME_OK: u8 = 0;
const FRAME_CONFIG: u8 = 1;
const FRAME_TRANSPORT: u8 = 2;

fn frame_ok(body: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(FRAME_OK);
    out.extend(body);
    out
}

fn frame_err(err: &RedistError) -> Vec<u8> {
    let status = if err.is_configuration() {
        FRAME_CONFIG
    } else {
        FRAME_TRANSPORT
    };
    let mut out = vec![status];
    out.extend_from_slice(err.to_string().as_bytes());
    out
}

/// Payload of a frame from `src`, or the failure it reports.
fn open_frame(src: usize, frame: Vec<u8>) -> Result<Vec<u8>, RedistError> {
    let Some((&status, body)) = frame.split_first() else {
        return Err(RedistError::MalformedRecord {
            neighbor: src,
            reason: "empty reduction frame".into(),
        });
    };
    let text = || String::from_utf8_lossy(body).into_owned();
    match status {
        FRAME_OK => Ok(body.to_vec()),
        FRAME_CONFIG => Err(RedistError::InvalidConfig(format!(
            "reduction failed below rank {src}: {}",
            text()
        ))),
        FRAME_TRANSPORT => Err(RedistError::comm(src, text())),
        s => Err(RedistError::MalformedRecord {
            neighbor: src,
            reason: format!("unknown frame status {s}"),
        }),
    }
}

fn recv_stat<C: Communicator, S: Statistic>(
    comm: &C,
    tags: RoundTags,
    src: usize,
) -> Result<S, RedistError> {
    let body = open_frame(src, recv_framed(comm, tags, src)?)?;
    S::from_wire(&body).map_err(|reason| RedistError::MalformedRecord { neighbor: src, reason })
}

fn check_root(root: usize, size: usize) -> Result<(), RedistError> {
    if root >= size {
        return Err(RedistError::RankOutOfRange { rank: root, size });
    }
    Ok(())
}

/// Ranks this worker receives from, then the rank it sends to (if any).
fn reduce_links(rank: usize, size: usize, root: usize, topology: ReduceTopology) -> (Vec<usize>, Option<usize>) {
    match topology {
        ReduceTopology::Linear => {
            if rank == root {
                ((0..size).filter(|&r| r != root).collect(), None)
            } else {
                (Vec::new(), Some(root))
            }
        }
        ReduceTopology::BinomialTree => {
            let v = (rank + size - root) % size;
            let real = |vr: usize| (vr + root) % size;
            let mut children = Vec::new();
            let mut mask = 1;
            while mask < size {
                if v & mask != 0 {
                    return (children, Some(real(v - mask)));
                }
                if v + mask < size {
                    children.push(real(v + mask));
                }
                mask <<= 1;
            }
            (children, None)
        }
    }
}

/// Collective reduction to `root` on explicit tags.
pub fn reduce_on<C, S>(
    worker: &Worker<'_, C>,
    tags: RoundTags,
    local: S,
    root: usize,
    topology: ReduceTopology,
) -> Result<Option<S>, RedistError>
where
    C: Communicator,
    S: Statistic,
{
    let (rank, size) = (worker.rank(), worker.size());
    check_root(root, size)?;
    let comm = worker.comm();
    let (children, parent) = reduce_links(rank, size, root, topology);

    let mut acc = Ok(local);
    for child in children {
        // keep receiving after a failure; every child still sends once
        let incoming = recv_stat::<C, S>(comm, tags, child);
        acc = match (acc, incoming) {
            (Ok(mut a), Ok(b)) => a.merge(b).map(|_| a),
            (Err(e), _) | (Ok(_), Err(e)) => Err(e),
        };
    }

    match parent {
        None => {
            log::trace!("rank {rank}: reduction complete at root");
            acc.map(Some)
        }
        Some(p) => {
            let frame = match &acc {
                Ok(a) => frame_ok(a.to_wire()),
                Err(e) => frame_err(e),
            };
            send_framed(comm, tags, p, &frame)?;
            acc.map(|_| None)
        }
    }
}

/// Collective broadcast of `value` (given on `root` only) on explicit tags.
pub fn broadcast_on<C>(
    worker: &Worker<'_, C>,
    tags: RoundTags,
    value: Option<Vec<u8>>,
    root: usize,
    topology: ReduceTopology,
) -> Result<Vec<u8>, RedistError>
where
    C: Communicator,
{
    let (rank, size) = (worker.rank(), worker.size());
    check_root(root, size)?;
    let comm = worker.comm();
    let (children, parent) = reduce_links(rank, size, root, topology);

    let payload = match parent {
        None => value.ok_or_else(|| {
            RedistError::InvalidConfig(format!("broadcast root {root} has no value"))
        })?,
        Some(p) => recv_framed(comm, tags, p)?,
    };
    // reverse of the reduction order: the largest subtree is served first
    for &child in children.iter().rev() {
        send_framed(comm, tags, child, &payload)?;
    }
    Ok(payload)
}

/// Collective: merge every worker's `local` at `root` over [`Round::Reduce`].
/// Non-root workers get `None`.
pub fn reduce<C, S>(
    worker: &Worker<'_, C>,
    pass: &PassGuard<'_, C>,
    local: S,
    root: usize,
    topology: ReduceTopology,
) -> Result<Option<S>, RedistError>
where
    C: Communicator,
    S: Statistic,
{
    reduce_on(worker, pass.tags(Round::Reduce), local, root, topology)
}

/// Collective: send `root`'s bytes to everyone over [`Round::Broadcast`].
pub fn broadcast<C>(
    worker: &Worker<'_, C>,
    pass: &PassGuard<'_, C>,
    value: Option<Vec<u8>>,
    root: usize,
    topology: ReduceTopology,
) -> Result<Vec<u8>, RedistError>
where
    C: Communicator,
{
    broadcast_on(worker, pass.tags(Round::Broadcast), value, root, topology)
}

fn all_reduce_on<C, S>(
    worker: &Worker<'_, C>,
    reduce_tags: RoundTags,
    bcast_tags: RoundTags,
    local: S,
    topology: ReduceTopology,
) -> Result<S, RedistError>
where
    C: Communicator,
    S: Statistic,
{
    let root = worker.config().root;
    let reduced = reduce_on(worker, reduce_tags, local, root, topology);
    // the root broadcasts its outcome, failure included
    let value = if worker.rank() == root {
        Some(match &reduced {
            Ok(Some(s)) => frame_ok(s.to_wire()),
            Ok(None) => frame_err(&RedistError::InvalidConfig("root holds no result".into())),
            Err(e) => frame_err(e),
        })
    } else {
        None
    };
    let frame = broadcast_on(worker, bcast_tags, value, root, topology)?;
    // a local failure wins over the one reported by the root
    reduced?;
    let body = open_frame(root, frame)?;
    S::from_wire(&body).map_err(|reason| RedistError::MalformedRecord { neighbor: root, reason })
}

/// Collective: every worker gets the merged statistic.
pub fn all_reduce<C, S>(
    worker: &Worker<'_, C>,
    pass: &PassGuard<'_, C>,
    local: S,
    topology: ReduceTopology,
) -> Result<S, RedistError>
where
    C: Communicator,
    S: Statistic,
{
    all_reduce_on(
        worker,
        pass.tags(Round::Reduce),
        pass.tags(Round::Broadcast),
        local,
        topology,
    )
}

/// Collective histogram over values spread across the group.
///
/// The value range is all-reduced first so that every worker bins with the
/// same boundaries; the counts are then reduced to `root` over
/// [`Round::HistogramCounts`], leaving [`Round::Reduce`] free for the
/// caller's own statistics in the same pass. Non-finite values
/// are ignored. With no values anywhere the histogram spans `[0, 1]`.
pub fn parallel_histogram<C, V>(
    worker: &Worker<'_, C>,
    pass: &PassGuard<'_, C>,
    values: &[V],
    bins: usize,
    root: usize,
) -> Result<Option<Histogram>, RedistError>
where
    C: Communicator,
    V: ToPrimitive,
{
    if bins == 0 {
        return Err(RedistError::InvalidConfig("histogram needs at least one bin".into()));
    }
    check_root(root, worker.size())?;
    let topology = worker.config().reduce_topology;

    let mut local = Bounds::empty(1);
    for x in values.iter().filter_map(|v| v.to_f64()).filter(|x| x.is_finite()) {
        local.include(&[x])?;
    }
    let range = all_reduce_on(
        worker,
        pass.tags(Round::RangeReduce),
        pass.tags(Round::RangeBroadcast),
        local,
        topology,
    )?;
    let (lo, hi) = range.range(0).unwrap_or((0.0, 0.0));
    let mut hist = Histogram::new(lo, hi, bins)?;
    hist.accumulate(values.iter().filter_map(|v| v.to_f64()));
    log::debug!(
        "rank {}: histogram over [{lo}, {hi}] with {bins} bins, {} local samples",
        worker.rank(),
        hist.total()
    );
    reduce_on(worker, pass.tags(Round::HistogramCounts), hist, root, topology)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::data::statistic::Counts;
    use crate::topology::WorkerGroup;

    #[test]
    fn binomial_links_cover_every_rank_once() {
        for size in 1..=9 {
            for root in 0..size {
                let mut parents = vec![None; size];
                let mut child_count = 0;
                for r in 0..size {
                    let (children, parent) = reduce_links(r, size, root, ReduceTopology::BinomialTree);
                    parents[r] = parent;
                    child_count += children.len();
                    for c in children {
                        assert_eq!(
                            reduce_links(c, size, root, ReduceTopology::BinomialTree).1,
                            Some(r)
                        );
                    }
                }
                assert_eq!(parents[root], None);
                assert_eq!(child_count, size - 1);
            }
        }
    }

    #[test]
    fn single_worker_reduce_is_identity() {
        let group = WorkerGroup::new(NoComm).unwrap();
        let w = group.worker();
        let pass = w.begin_pass().unwrap();
        let out = reduce(&w, &pass, Counts(vec![1, 2]), 0, ReduceTopology::BinomialTree).unwrap();
        assert_eq!(out, Some(Counts(vec![1, 2])));
        let all = all_reduce(&w, &pass, Counts(vec![3]), ReduceTopology::Linear).unwrap();
        assert_eq!(all, Counts(vec![3]));
        assert!(matches!(
            reduce(&w, &pass, Counts(vec![]), 1, ReduceTopology::Linear),
            Err(RedistError::RankOutOfRange { rank: 1, size: 1 })
        ));
        pass.finish();
    }

    #[test]
    fn single_worker_histogram() {
        let group = WorkerGroup::new(NoComm).unwrap();
        let w = group.worker();
        let pass = w.begin_pass().unwrap();
        let h = parallel_histogram(&w, &pass, &[1.0, 2.0, 3.0, f64::NAN], 2, 0)
            .unwrap()
            .unwrap();
        pass.finish();
        assert_eq!(h.range(), (1.0, 3.0));
        assert_eq!(h.counts(), &[1, 2]);
    }

    #[test]
    fn frames_carry_failures() {
        let err = RedistError::InvalidConfig("bad".into());
        let back = open_frame(4, frame_err(&err)).unwrap_err();
        assert!(back.is_configuration());
        let back = open_frame(4, frame_err(&RedistError::comm(2, "lost"))).unwrap_err();
        assert!(back.is_transport());
        assert!(open_frame(4, Vec::new()).unwrap_err().is_transport());
    }
}
