#![allow(dead_code)]
use mesh_redistribute::{
    algs::communicator::RayonComm,
    config::RedistConfig,
    data::WorkItem,
    topology::{Worker, WorkerGroup},
};
use std::time::Duration;

/// Run `f` on `n` in-process workers sharing a private mailbox; results by rank.
pub fn run_group<F, R>(n: usize, cfg: RedistConfig, f: F) -> Vec<R>
where
    F: Fn(Worker<'_, RayonComm>) -> R + Sync,
    R: Send,
{
    let world = RayonComm::world(n);
    let f = &f;
    std::thread::scope(|s| {
        let handles: Vec<_> = world
            .into_iter()
            .map(|comm| {
                let cfg = cfg.clone();
                s.spawn(move || {
                    let group = WorkerGroup::with_config(comm, cfg).unwrap();
                    f(group.worker())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

/// Like [`run_group`] but receives give up after `timeout`.
pub fn run_group_with_timeout<F, R>(n: usize, timeout: Duration, f: F) -> Vec<R>
where
    F: Fn(RayonComm) -> R + Sync,
    R: Send,
{
    let world: Vec<RayonComm> = RayonComm::world(n)
        .into_iter()
        .map(|c| c.with_timeout(timeout))
        .collect();
    let f = &f;
    std::thread::scope(|s| {
        let handles: Vec<_> = world.into_iter().map(|comm| s.spawn(move || f(comm))).collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

/// Unit-payload items with the given weights, created on `rank`.
pub fn items_on(rank: usize, weights: &[f64]) -> Vec<WorkItem<u64>> {
    weights
        .iter()
        .enumerate()
        .map(|(i, &w)| WorkItem::new(rank, i as u64, w, (rank * 1000 + i) as u64))
        .collect()
}

/// Sorted `(origin rank, local id)` of the non-ghost items of every worker.
pub fn owned_origins<T>(sets: &[Vec<WorkItem<T>>]) -> Vec<(u32, u64)> {
    let mut all: Vec<(u32, u64)> = sets
        .iter()
        .flatten()
        .filter(|it| !it.ghost)
        .map(|it| (it.origin.rank, it.origin.local_id))
        .collect();
    all.sort_unstable();
    all
}

/// Assert vec is a permutation of another vec (order-agnostic).
pub fn assert_permutation<T: Ord + Clone + std::fmt::Debug>(got: &[T], want: &[T]) {
    let mut a = got.to_vec();
    a.sort();
    let mut b = want.to_vec();
    b.sort();
    assert_eq!(a, b, "not a permutation\n got={:?}\nwant={:?}", got, want);
}
