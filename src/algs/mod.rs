//! Re-export public algorithms.

pub mod communicator;
pub mod exchange;
pub mod reconcile;
pub mod redistribute;
pub mod reduction;
pub mod transfer;
pub mod wire;

pub use reconcile::{RegionKey, RegionMap, reconcile};
pub use redistribute::{PassReport, Redistributor, ScheduleSummary};
pub use reduction::{all_reduce, broadcast, parallel_histogram, reduce};
pub use transfer::{ExchangeStats, run_schedule};
