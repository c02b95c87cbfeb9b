//! Global region id reconciliation.
//!
//! After a transfer the pieces of one region may sit on several workers.
//! Every region is named by the worker that labelled it, as a
//! [`RegionKey`] `(origin rank, local region id)`. Reconciliation gathers the
//! distinct keys of all workers, sorts them, and numbers them densely. The
//! numbering depends only on the global key set, so it is the same on every
//! worker, for every arrival order, and for every group size the keys were
//! exchanged over.

use hashbrown::HashSet;
use itertools::Itertools;

use crate::algs::communicator::{Communicator, Round};
use crate::algs::exchange::allgather_bytes;
use crate::algs::wire::{WireReader, WireRegionKey, cast_slice};
use crate::data::item::{GlobalRegionId, WorkItem};
use crate::debug_invariants::DebugInvariants;
use crate::redist_error::RedistError;
use crate::topology::{PassGuard, Worker};

/// A region as labelled by its origin worker. Ordered by rank, then local id.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionKey {
    pub rank: u32,
    pub local: u64,
}

impl RegionKey {
    pub fn new(rank: u32, local: u64) -> Self {
        Self { rank, local }
    }

    /// Key of `item`, or `None` for background items.
    pub fn of<T>(item: &WorkItem<T>) -> Option<Self> {
        item.region.map(|local| Self::new(item.origin.rank, local))
    }
}

/// Sorted key table; the global id of a key is its position.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegionMap {
    keys: Vec<RegionKey>,
}

impl RegionMap {
    pub fn from_keys<I: IntoIterator<Item = RegionKey>>(keys: I) -> Self {
        let map = Self {
            keys: keys.into_iter().sorted_unstable().dedup().collect(),
        };
        map.debug_assert_invariants();
        map
    }

    /// Global id of `key`; [`GlobalRegionId::NONE`] for unknown keys.
    pub fn lookup(&self, key: RegionKey) -> GlobalRegionId {
        self.keys
            .binary_search(&key)
            .map_or(GlobalRegionId::NONE, |i| GlobalRegionId(i as u64))
    }

    /// Write `global_region` on every item. Background items get the
    /// sentinel. Returns the number of items that received a real id.
    pub fn assign<T>(&self, items: &mut [WorkItem<T>]) -> usize {
        let mut n = 0;
        for it in items.iter_mut() {
            it.global_region = RegionKey::of(it).map_or(GlobalRegionId::NONE, |k| self.lookup(k));
            if !it.global_region.is_none() {
                n += 1;
            }
        }
        n
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[RegionKey] {
        &self.keys
    }
}

impl DebugInvariants for RegionMap {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "RegionMap");
    }

    /// Keys strictly ascending, so that ids are dense and lookups exact.
    fn validate_invariants(&self) -> Result<(), RedistError> {
        match self.keys.windows(2).position(|w| w[0] >= w[1]) {
            Some(i) => Err(RedistError::InvalidConfig(format!(
                "region keys out of order at global id {}",
                i + 1
            ))),
            None => Ok(()),
        }
    }
}

/// Distinct region keys of `items`, ascending.
pub fn local_keys<T>(items: &[WorkItem<T>]) -> Vec<RegionKey> {
    let set: HashSet<RegionKey> = items.iter().filter_map(RegionKey::of).collect();
    set.into_iter().sorted_unstable().collect()
}

fn encode_keys(keys: &[RegionKey]) -> Vec<u8> {
    let wire: Vec<WireRegionKey> = keys.iter().map(|k| WireRegionKey::new(k.rank, k.local)).collect();
    cast_slice(&wire).to_vec()
}

fn decode_keys(bytes: &[u8]) -> Result<Vec<RegionKey>, String> {
    let rec = std::mem::size_of::<WireRegionKey>();
    if bytes.len() % rec != 0 {
        return Err(format!("{} bytes is not a whole number of region keys", bytes.len()));
    }
    let mut r = WireReader::new(bytes);
    let mut out = Vec::with_capacity(bytes.len() / rec);
    while r.remaining() > 0 {
        let (rank, local) = r.read::<WireRegionKey>()?.decode();
        out.push(RegionKey::new(rank, local));
    }
    Ok(out)
}

/// Collective: build the group-wide [`RegionMap`] and assign ids to `items`.
pub fn reconcile<C, T>(
    worker: &Worker<'_, C>,
    pass: &PassGuard<'_, C>,
    items: &mut [WorkItem<T>],
) -> Result<RegionMap, RedistError>
where
    C: Communicator,
{
    let mine = local_keys(items);
    let all = allgather_bytes(worker.comm(), pass.tags(Round::Reconcile), encode_keys(&mine))?;
    let mut keys = Vec::new();
    for (rank, bytes) in all.iter().enumerate() {
        let decoded = decode_keys(bytes)
            .map_err(|reason| RedistError::MalformedRecord { neighbor: rank, reason })?;
        keys.extend(decoded);
    }
    let map = RegionMap::from_keys(keys);
    let assigned = map.assign(items);
    log::debug!(
        "rank {}: pass {} reconciled {} local keys into {} global regions ({assigned} items labelled)",
        worker.rank(),
        pass.id(),
        mine.len(),
        map.len()
    );
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_follow_key_order_not_input_order() {
        let a = RegionMap::from_keys([
            RegionKey::new(1, 5),
            RegionKey::new(0, 9),
            RegionKey::new(1, 5),
            RegionKey::new(0, 2),
        ]);
        let b = RegionMap::from_keys([RegionKey::new(0, 2), RegionKey::new(1, 5), RegionKey::new(0, 9)]);
        assert_eq!(a, b);
        assert_eq!(a.lookup(RegionKey::new(0, 2)), GlobalRegionId(0));
        assert_eq!(a.lookup(RegionKey::new(0, 9)), GlobalRegionId(1));
        assert_eq!(a.lookup(RegionKey::new(1, 5)), GlobalRegionId(2));
        assert!(a.lookup(RegionKey::new(7, 7)).is_none());
    }

    #[test]
    fn unsorted_table_fails_validation() {
        let good = RegionMap::from_keys([RegionKey::new(2, 0), RegionKey::new(1, 3)]);
        assert!(good.validate_invariants().is_ok());
        let bad = RegionMap {
            keys: vec![RegionKey::new(2, 0), RegionKey::new(1, 3)],
        };
        assert!(bad.validate_invariants().unwrap_err().is_configuration());
    }

    #[test]
    fn background_items_keep_sentinel() {
        let map = RegionMap::from_keys([RegionKey::new(0, 4)]);
        let mut items = vec![
            WorkItem::new(0, 0, 1.0, ()).with_region(4),
            WorkItem::new(0, 1, 1.0, ()),
        ];
        assert_eq!(map.assign(&mut items), 1);
        assert_eq!(items[0].global_region, GlobalRegionId(0));
        assert_eq!(items[1].global_region, GlobalRegionId::NONE);
    }

    #[test]
    fn key_wire_roundtrip_and_truncation() {
        let keys = vec![RegionKey::new(3, u64::MAX - 1), RegionKey::new(0, 0)];
        assert_eq!(decode_keys(&encode_keys(&keys)).unwrap(), keys);
        assert!(decode_keys(&[0u8; 15]).is_err());
        assert!(decode_keys(&[]).unwrap().is_empty());
    }
}
