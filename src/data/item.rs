//! Redistributable work items and their payload codecs.
//!
//! A [`WorkItem`] is a locally owned unit of work (a mesh cell, a particle
//! bucket, a record) with a non-negative weight, a local identifier and an
//! optional region label. Its [`Origin`] records where it was created so the
//! reconciler can recognise pieces of one region after they were scattered.

use crate::algs::wire::{
    FLAG_GHOST, WireBatchHdr, WireItemHdr, WireReader, cast_slice, put_f64, put_u64,
};
use crate::redist_error::RedistError;

/// Where an item was created: `(rank, local id)` at creation time.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Origin {
    pub rank: u32,
    pub local_id: u64,
}

/// Global identifier assigned to a region after reconciliation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalRegionId(pub u64);

impl GlobalRegionId {
    /// Sentinel for boundary/background items that belong to no region.
    pub const NONE: GlobalRegionId = GlobalRegionId(u64::MAX);

    #[inline]
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }

    #[inline]
    pub fn get(self) -> Option<u64> {
        (!self.is_none()).then_some(self.0)
    }
}

impl Default for GlobalRegionId {
    fn default() -> Self {
        Self::NONE
    }
}

/// One unit of redistributable work.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkItem<T> {
    pub origin: Origin,
    pub weight: f64,
    /// Region label in the numbering of `origin.rank`; `None` = background.
    pub region: Option<u64>,
    /// Filled in by reconciliation.
    pub global_region: GlobalRegionId,
    /// Ghost copies are replicas and do not count towards the partition.
    pub ghost: bool,
    pub payload: T,
}

impl<T> WorkItem<T> {
    /// A fresh, non-ghost item created on `rank`.
    pub fn new(rank: usize, local_id: u64, weight: f64, payload: T) -> Self {
        Self {
            origin: Origin {
                rank: rank as u32,
                local_id,
            },
            weight,
            region: None,
            global_region: GlobalRegionId::NONE,
            ghost: false,
            payload,
        }
    }

    pub fn with_region(mut self, region: u64) -> Self {
        self.region = Some(region);
        self
    }
}

/// Serialization of item payloads to and from byte buffers.
pub trait ItemCodec: Sized {
    fn encode(&self, out: &mut Vec<u8>);
    fn decode(bytes: &[u8]) -> Result<Self, String>;
}

impl ItemCodec for () {
    fn encode(&self, _out: &mut Vec<u8>) {}
    fn decode(bytes: &[u8]) -> Result<Self, String> {
        if bytes.is_empty() {
            Ok(())
        } else {
            Err(format!("unit payload carries {} bytes", bytes.len()))
        }
    }
}

impl ItemCodec for Vec<u8> {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }
    fn decode(bytes: &[u8]) -> Result<Self, String> {
        Ok(bytes.to_vec())
    }
}

impl ItemCodec for u64 {
    fn encode(&self, out: &mut Vec<u8>) {
        put_u64(out, *self);
    }
    fn decode(bytes: &[u8]) -> Result<Self, String> {
        let mut r = WireReader::new(bytes);
        let v = r.read_u64()?;
        r.finish()?;
        Ok(v)
    }
}

impl ItemCodec for f64 {
    fn encode(&self, out: &mut Vec<u8>) {
        put_f64(out, *self);
    }
    fn decode(bytes: &[u8]) -> Result<Self, String> {
        let mut r = WireReader::new(bytes);
        let v = r.read_f64()?;
        r.finish()?;
        Ok(v)
    }
}

impl<const N: usize> ItemCodec for [f64; N] {
    fn encode(&self, out: &mut Vec<u8>) {
        for &x in self {
            put_f64(out, x);
        }
    }
    fn decode(bytes: &[u8]) -> Result<Self, String> {
        let mut r = WireReader::new(bytes);
        let mut out = [0.0; N];
        for x in out.iter_mut() {
            *x = r.read_f64()?;
        }
        r.finish()?;
        Ok(out)
    }
}

impl ItemCodec for Vec<f64> {
    fn encode(&self, out: &mut Vec<u8>) {
        for &x in self {
            put_f64(out, x);
        }
    }
    fn decode(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() % 8 != 0 {
            return Err(format!("{} bytes is not a whole number of f64", bytes.len()));
        }
        let mut r = WireReader::new(bytes);
        (0..bytes.len() / 8).map(|_| r.read_f64()).collect()
    }
}

/// Serialize a batch of items: header, then one record per item.
pub(crate) fn encode_batch<'a, T, I>(round: u16, items: I, ghost: bool) -> Vec<u8>
where
    T: ItemCodec + 'a,
    I: ExactSizeIterator<Item = &'a WorkItem<T>>,
{
    let mut out = Vec::new();
    let hdr = WireBatchHdr::new(round, items.len());
    out.extend_from_slice(cast_slice(std::slice::from_ref(&hdr)));
    let mut payload = Vec::new();
    for item in items {
        payload.clear();
        item.payload.encode(&mut payload);
        let flags = if ghost || item.ghost { FLAG_GHOST } else { 0 };
        let rec = WireItemHdr::new(
            item.origin.rank,
            flags,
            item.origin.local_id,
            item.region,
            item.weight,
            payload.len(),
        );
        out.extend_from_slice(cast_slice(std::slice::from_ref(&rec)));
        out.extend_from_slice(&payload);
    }
    out
}

/// Decode a batch produced by [`encode_batch`], received from `neighbor`.
pub(crate) fn decode_batch<T: ItemCodec>(
    neighbor: usize,
    round: u16,
    bytes: &[u8],
) -> Result<Vec<WorkItem<T>>, RedistError> {
    let malformed = |reason: String| RedistError::MalformedRecord { neighbor, reason };
    let mut r = WireReader::new(bytes);
    let hdr: WireBatchHdr = r.read().map_err(malformed)?;
    if hdr.version() != crate::algs::wire::WIRE_VERSION {
        return Err(malformed(format!("wire version {}", hdr.version())));
    }
    if hdr.round() != round {
        return Err(malformed(format!(
            "batch for round {} arrived in round {round}",
            hdr.round()
        )));
    }
    // the count comes from the peer; never reserve more than the bytes can hold
    let mut items = Vec::with_capacity(hdr.count().min(r.remaining() / WireItemHdr::SIZE));
    for _ in 0..hdr.count() {
        let rec: WireItemHdr = r.read().map_err(malformed)?;
        let payload = T::decode(r.take(rec.payload_len()).map_err(malformed)?).map_err(malformed)?;
        items.push(WorkItem {
            origin: Origin {
                rank: rec.origin_rank(),
                local_id: rec.local_id(),
            },
            weight: rec.weight(),
            region: rec.region(),
            global_region: GlobalRegionId::NONE,
            ghost: rec.flags() & FLAG_GHOST != 0,
            payload,
        });
    }
    r.finish().map_err(malformed)?;
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_preserves_order_and_flags() {
        let items = vec![
            WorkItem::new(1, 10, 1.5, vec![1.0, 2.0]).with_region(4),
            WorkItem::new(1, 11, 0.0, vec![]),
        ];
        let bytes = encode_batch(1, items.iter(), false);
        let back: Vec<WorkItem<Vec<f64>>> = decode_batch(1, 1, &bytes).unwrap();
        assert_eq!(back, items);

        let ghosts = encode_batch(2, items.iter(), true);
        let back: Vec<WorkItem<Vec<f64>>> = decode_batch(1, 2, &ghosts).unwrap();
        assert!(back.iter().all(|it| it.ghost));
    }

    #[test]
    fn largest_region_id_survives_the_wire() {
        let items = vec![
            WorkItem::new(0, 0, 1.0, ()).with_region(u64::MAX),
            WorkItem::new(0, 1, 1.0, ()),
        ];
        let back: Vec<WorkItem<()>> = decode_batch(0, 1, &encode_batch(1, items.iter(), false)).unwrap();
        assert_eq!(back[0].region, Some(u64::MAX));
        assert_eq!(back[1].region, None);
    }

    #[test]
    fn oversized_count_is_malformed() {
        let hdr = WireBatchHdr::new(1, u32::MAX as usize);
        let bytes = cast_slice(std::slice::from_ref(&hdr)).to_vec();
        assert!(decode_batch::<()>(0, 1, &bytes).unwrap_err().is_transport());
    }

    #[test]
    fn wrong_round_is_malformed() {
        let items = vec![WorkItem::new(0, 1, 1.0, 7u64)];
        let bytes = encode_batch(1, items.iter(), false);
        let err = decode_batch::<u64>(0, 2, &bytes).unwrap_err();
        assert!(err.is_transport());
    }

    #[test]
    fn truncated_payload_is_malformed() {
        let items = vec![WorkItem::new(0, 1, 1.0, [1.0f64, 2.0, 3.0])];
        let mut bytes = encode_batch(1, items.iter(), false);
        bytes.pop();
        assert!(matches!(
            decode_batch::<[f64; 3]>(5, 1, &bytes),
            Err(RedistError::MalformedRecord { neighbor: 5, .. })
        ));
    }

    #[test]
    fn sentinel_region_id() {
        assert!(GlobalRegionId::default().is_none());
        assert_eq!(GlobalRegionId(3).get(), Some(3));
    }
}
