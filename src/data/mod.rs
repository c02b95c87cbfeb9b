//! Work items and reducible statistics.

pub mod histogram;
pub mod item;
pub mod region_totals;
pub mod statistic;

pub use histogram::Histogram;
pub use item::{GlobalRegionId, ItemCodec, Origin, WorkItem};
pub use region_totals::RegionTotals;
pub use statistic::{Bounds, Counts, Statistic};
