//! Transfer schedules: which local items leave this worker, and where to.

use std::collections::BTreeSet;

use crate::debug_invariants::DebugInvariants;
use crate::redist_error::RedistError;

/// Items (local indices) moving to one destination.
#[derive(Clone, Debug, PartialEq)]
pub struct ScheduleEntry {
    pub dest: usize,
    pub items: Vec<usize>,
    pub weight: f64,
}

/// Ghost copies of local items sent to `dest`; the originals stay.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplicaEntry {
    pub dest: usize,
    pub items: Vec<usize>,
}

/// The planned transfers of one worker for one pass.
///
/// Built once by a partitioner, optionally extended with ghost replicas,
/// then consumed by [`run_schedule`](crate::algs::transfer::run_schedule).
#[derive(Clone, Debug, PartialEq)]
pub struct TransferSchedule {
    pass: u32,
    source: usize,
    size: usize,
    n_items: usize,
    entries: Vec<ScheduleEntry>,
    replicas: Vec<ReplicaEntry>,
    degenerate: bool,
}

impl TransferSchedule {
    /// Schedule that moves nothing.
    pub fn noop(pass: u32, source: usize, size: usize, n_items: usize) -> Self {
        Self {
            pass,
            source,
            size,
            n_items,
            entries: Vec::new(),
            replicas: Vec::new(),
            degenerate: false,
        }
    }

    /// No-op schedule produced for an all-zero global weight.
    pub fn degenerate(pass: u32, source: usize, size: usize, n_items: usize) -> Self {
        Self {
            degenerate: true,
            ..Self::noop(pass, source, size, n_items)
        }
    }

    /// Build from explicit entries; entries are ordered by destination and
    /// validated.
    pub fn from_entries(
        pass: u32,
        source: usize,
        size: usize,
        n_items: usize,
        mut entries: Vec<ScheduleEntry>,
    ) -> Result<Self, RedistError> {
        entries.retain(|e| !e.items.is_empty());
        entries.sort_by_key(|e| e.dest);
        let s = Self {
            entries,
            ..Self::noop(pass, source, size, n_items)
        };
        s.validate_invariants()?;
        Ok(s)
    }

    /// Add ghost copies of `items` for `dest`.
    pub fn with_replica(mut self, dest: usize, items: Vec<usize>) -> Result<Self, RedistError> {
        if items.is_empty() {
            return Ok(self);
        }
        match self.replicas.iter_mut().find(|r| r.dest == dest) {
            Some(r) => r.items.extend(items),
            None => {
                self.replicas.push(ReplicaEntry { dest, items });
                self.replicas.sort_by_key(|r| r.dest);
            }
        }
        self.validate_invariants()?;
        Ok(self)
    }

    pub fn pass(&self) -> u32 {
        self.pass
    }

    pub fn source(&self) -> usize {
        self.source
    }

    /// Number of local items the schedule was computed for.
    pub fn n_items(&self) -> usize {
        self.n_items
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    pub fn replicas(&self) -> &[ReplicaEntry] {
        &self.replicas
    }

    pub fn is_degenerate(&self) -> bool {
        self.degenerate
    }

    /// True if nothing moves and nothing is copied.
    pub fn is_noop(&self) -> bool {
        self.entries.is_empty() && self.replicas.is_empty()
    }

    /// Local indices that leave this worker.
    pub fn moved(&self) -> BTreeSet<usize> {
        self.entries.iter().flat_map(|e| e.items.iter().copied()).collect()
    }

    pub fn weight_out(&self) -> f64 {
        self.entries.iter().map(|e| e.weight).sum()
    }

    pub fn items_out(&self) -> usize {
        self.entries.iter().map(|e| e.items.len()).sum()
    }

    fn check_dest(&self, dest: usize) -> Result<(), RedistError> {
        if dest >= self.size {
            return Err(RedistError::RankOutOfRange {
                rank: dest,
                size: self.size,
            });
        }
        if dest == self.source {
            return Err(RedistError::InvalidConfig(format!(
                "schedule of rank {} targets itself",
                self.source
            )));
        }
        Ok(())
    }
}

impl DebugInvariants for TransferSchedule {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "TransferSchedule");
    }

    fn validate_invariants(&self) -> Result<(), RedistError> {
        let mut seen = BTreeSet::new();
        for e in &self.entries {
            self.check_dest(e.dest)?;
            for &i in &e.items {
                if i >= self.n_items {
                    return Err(RedistError::InvalidConfig(format!(
                        "item index {i} out of range ({} local items)",
                        self.n_items
                    )));
                }
                if !seen.insert(i) {
                    return Err(RedistError::InvalidConfig(format!(
                        "item {i} scheduled to move twice"
                    )));
                }
            }
        }
        for r in &self.replicas {
            self.check_dest(r.dest)?;
            if let Some(&i) = r.items.iter().find(|&&i| i >= self.n_items) {
                return Err(RedistError::InvalidConfig(format!(
                    "replica index {i} out of range ({} local items)",
                    self.n_items
                )));
            }
        }
        Ok(())
    }
}
