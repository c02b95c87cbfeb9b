//! Per-region weight sums over reconciled global region ids.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::algs::wire::{WireReader, put_f64, put_u64};
use crate::data::item::{GlobalRegionId, WorkItem};
use crate::data::statistic::Statistic;
use crate::redist_error::RedistError;

/// `global region id → (item count, summed weight)`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RegionTotals(pub BTreeMap<u64, (u64, f64)>);

impl RegionTotals {
    /// Totals of the non-ghost items that carry a reconciled region.
    pub fn from_items<T>(items: &[WorkItem<T>]) -> Self {
        let mut out = BTreeMap::new();
        for it in items.iter().filter(|it| !it.ghost) {
            if let Some(id) = it.global_region.get() {
                let e = out.entry(id).or_insert((0u64, 0.0f64));
                e.0 += 1;
                e.1 += it.weight;
            }
        }
        RegionTotals(out)
    }

    pub fn get(&self, id: GlobalRegionId) -> Option<(u64, f64)> {
        id.get().and_then(|k| self.0.get(&k).copied())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Statistic for RegionTotals {
    fn merge(&mut self, other: Self) -> Result<(), RedistError> {
        for (id, (n, w)) in other.0 {
            let e = self.0.entry(id).or_insert((0, 0.0));
            e.0 += n;
            e.1 += w;
        }
        Ok(())
    }

    fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + 24 * self.0.len());
        put_u64(&mut out, self.0.len() as u64);
        for (&id, &(n, w)) in &self.0 {
            put_u64(&mut out, id);
            put_u64(&mut out, n);
            put_f64(&mut out, w);
        }
        out
    }

    fn from_wire(bytes: &[u8]) -> Result<Self, String> {
        let mut r = WireReader::new(bytes);
        let n = r.read_u64()? as usize;
        r.expect_records(n, 24, "region totals")?;
        let mut out = BTreeMap::new();
        for _ in 0..n {
            let id = r.read_u64()?;
            let count = r.read_u64()?;
            let w = r.read_f64()?;
            out.insert(id, (count, w));
        }
        r.finish()?;
        Ok(RegionTotals(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_background_and_ghosts() {
        let mut a = WorkItem::new(0, 1, 2.0, ());
        a.global_region = GlobalRegionId(7);
        let b = WorkItem::new(0, 2, 5.0, ());
        let mut c = a.clone();
        c.ghost = true;
        let t = RegionTotals::from_items(&[a, b, c]);
        assert_eq!(t.len(), 1);
        assert_eq!(t.get(GlobalRegionId(7)), Some((1, 2.0)));
        assert_eq!(t.get(GlobalRegionId::NONE), None);
    }
}
