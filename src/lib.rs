#![cfg_attr(docsrs, feature(doc_cfg))]
//! # mesh-redistribute
//!
//! mesh-redistribute balances irregularly weighted work items (mesh cells,
//! particle buckets, records) across a fixed group of cooperating workers,
//! renumbers the regions those items belong to so every worker agrees on
//! the ids, and reduces statistics over the new distribution.
//!
//! ## Features
//! - Quota-driven weighted partitioning with atomic items and optional
//!   per-worker target fractions
//! - Tagged length-then-body exchanges; every message tag names its pass,
//!   round and channel so rounds never cross-talk
//! - Deterministic global region ids, independent of arrival order and
//!   group size
//! - Linear and binomial-tree reductions of bounds, counts, histograms and
//!   per-region totals
//! - Pluggable communication backends (serial, in-process threads, MPI)
//!
//! ## Usage
//!
//! ```toml
//! [dependencies]
//! mesh-redistribute = "0.3"
//! # Optional features:
//! # features = ["mpi-support", "check-invariants"]
//! ```
//!
//! A pass is collective: every worker of the group calls
//! [`Redistributor::run`](algs::Redistributor::run) with its own items.
//!
//! ```no_run
//! use mesh_redistribute::prelude::*;
//!
//! let world = RayonComm::world(3);
//! std::thread::scope(|s| {
//!     for comm in world {
//!         s.spawn(move || {
//!             let group = WorkerGroup::new(comm).unwrap();
//!             let w = group.worker();
//!             let n = if w.rank() == 0 { 10 } else { 0 };
//!             let items: Vec<WorkItem<()>> =
//!                 (0..n).map(|i| WorkItem::new(w.rank(), i, 1.0, ())).collect();
//!             let report = Redistributor::from_config(w.config()).run(&w, items).unwrap();
//!             assert!(report.balance.max <= 4.0);
//!         });
//!     }
//! });
//! ```
//!
//! ## Invariant checks
//! Schedule constructors always validate their input and return an error.
//! Debug builds, and builds with `check-invariants` or `strict-invariants`,
//! additionally assert [`DebugInvariants`] on every schedule right before it
//! is executed and on every region table as it is built. Debug builds
//! and `check-invariants` also run the group-wide duplicate check after
//! every pass; release builds can opt in with
//! [`RedistConfig::verify_partition`](config::RedistConfig::verify_partition).

pub mod algs;
pub mod config;
pub mod data;
pub mod debug_invariants;
pub mod partitioning;
pub mod redist_error;
pub mod topology;

pub use debug_invariants::DebugInvariants;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::algs::communicator::{Communicator, NoComm, RayonComm};
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::algs::reconcile::{RegionKey, RegionMap};
    pub use crate::algs::redistribute::{PassReport, Redistributor};
    pub use crate::algs::reduction::{all_reduce, parallel_histogram, reduce};
    pub use crate::config::{RedistConfig, ReduceTopology};
    pub use crate::data::{
        Bounds, Counts, GlobalRegionId, Histogram, ItemCodec, RegionTotals, Statistic, WorkItem,
    };
    pub use crate::debug_invariants::DebugInvariants;
    pub use crate::partitioning::{Partitioner, TransferSchedule, WeightedPartitioner};
    pub use crate::redist_error::{PassWarning, RedistError};
    pub use crate::topology::{Worker, WorkerGroup};
}
