//! Fixed, versioned, little-endian wire types for exchange and reduction paths.

use bytemuck::{Pod, Zeroable};
use static_assertions::{assert_eq_align, assert_eq_size};

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

pub fn cast_slice_mut<T: Pod>(v: &mut [T]) -> &mut [u8] {
    bytemuck::cast_slice_mut(v)
}

pub fn expect_exact_len(actual: usize, expected: usize) -> Result<(), String> {
    if actual == expected {
        Ok(())
    } else {
        Err(format!("expected {expected} bytes, got {actual}"))
    }
}

/// Bump when the layout or semantics change in incompatible ways.
pub const WIRE_VERSION: u16 = 2;

/// All multi-byte integers in these structs are **little-endian** on the wire.
/// We store them pre-LE with `.to_le()` and decode with `.from_le()`.

/// Length header preceding every body message.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireLen {
    pub n_le: u64,
}

impl WireLen {
    pub fn new(n: usize) -> Self {
        Self {
            n_le: (n as u64).to_le(),
        }
    }
    pub fn get(&self) -> usize {
        u64::from_le(self.n_le) as usize
    }
}

/// Header of a batch of item records.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireBatchHdr {
    pub version_le: u16,
    pub round_le: u16,
    pub count_le: u32,
}

impl WireBatchHdr {
    pub fn new(round: u16, count: usize) -> Self {
        Self {
            version_le: WIRE_VERSION.to_le(),
            round_le: round.to_le(),
            count_le: (count as u32).to_le(),
        }
    }
    pub fn version(&self) -> u16 {
        u16::from_le(self.version_le)
    }
    pub fn round(&self) -> u16 {
        u16::from_le(self.round_le)
    }
    pub fn count(&self) -> usize {
        u32::from_le(self.count_le) as usize
    }
}

/// Flag bit: the record is a ghost copy, not a moved item.
pub const FLAG_GHOST: u32 = 1;

/// Flag bit: `region_le` holds a region id. Every `u64` is a valid id.
pub const FLAG_REGION: u32 = 2;

/// Fixed part of one transferred item record; `payload_len` payload bytes follow.
/// NOTE: `origin_rank_le` is u32 (never usize) on the wire.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireItemHdr {
    pub origin_rank_le: u32,
    pub flags_le: u32,
    pub local_id_le: u64,
    pub region_le: u64,
    pub weight_bits_le: u64,
    pub payload_len_le: u32,
    pub _pad: u32,
}

impl WireItemHdr {
    pub const SIZE: usize = 40;

    pub fn new(
        origin_rank: u32,
        flags: u32,
        local_id: u64,
        region: Option<u64>,
        weight: f64,
        payload_len: usize,
    ) -> Self {
        Self {
            origin_rank_le: origin_rank.to_le(),
            flags_le: (flags | region.map_or(0, |_| FLAG_REGION)).to_le(),
            local_id_le: local_id.to_le(),
            region_le: region.unwrap_or(0).to_le(),
            weight_bits_le: weight.to_bits().to_le(),
            payload_len_le: (payload_len as u32).to_le(),
            _pad: 0,
        }
    }
    pub fn origin_rank(&self) -> u32 {
        u32::from_le(self.origin_rank_le)
    }
    pub fn flags(&self) -> u32 {
        u32::from_le(self.flags_le)
    }
    pub fn local_id(&self) -> u64 {
        u64::from_le(self.local_id_le)
    }
    pub fn region(&self) -> Option<u64> {
        (self.flags() & FLAG_REGION != 0).then(|| u64::from_le(self.region_le))
    }
    pub fn weight(&self) -> f64 {
        f64::from_bits(u64::from_le(self.weight_bits_le))
    }
    pub fn payload_len(&self) -> usize {
        u32::from_le(self.payload_len_le) as usize
    }
}

/// A region key `(origin rank, local region id)` carried on the wire.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireRegionKey {
    pub rank_le: u32,
    pub _pad: u32,
    pub local_le: u64,
}

impl WireRegionKey {
    pub fn new(rank: u32, local: u64) -> Self {
        Self {
            rank_le: rank.to_le(),
            _pad: 0,
            local_le: local.to_le(),
        }
    }
    pub fn decode(&self) -> (u32, u64) {
        (u32::from_le(self.rank_le), u64::from_le(self.local_le))
    }
}

/// Cursor over a received byte buffer.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Read one `Pod` record; unaligned source bytes are fine.
    pub fn read<T: Pod>(&mut self) -> Result<T, String> {
        let n = std::mem::size_of::<T>();
        let bytes = self.take(n)?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.buf.len())
            .ok_or_else(|| {
                format!(
                    "truncated: need {n} bytes at offset {}, have {}",
                    self.pos,
                    self.buf.len() - self.pos
                )
            })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub fn read_u64(&mut self) -> Result<u64, String> {
        Ok(u64::from_le(self.read::<u64>()?))
    }

    pub fn read_f64(&mut self) -> Result<f64, String> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    /// Check that exactly `n` records of `size` bytes are left.
    pub fn expect_records(&self, n: usize, size: usize, what: &str) -> Result<(), String> {
        match n.checked_mul(size) {
            Some(need) if need == self.remaining() => Ok(()),
            _ => Err(format!(
                "{n} {what} of {size} bytes do not fit the {} bytes left",
                self.remaining()
            )),
        }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn finish(self) -> Result<(), String> {
        expect_exact_len(self.pos, self.buf.len())
    }
}

pub fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_f64(out: &mut Vec<u8>, v: f64) {
    put_u64(out, v.to_bits());
}

// ===== Compile-time sanity checks =========================================

assert_eq_size!(WireLen, [u8; 8]);
assert_eq_size!(WireBatchHdr, [u8; 8]);
assert_eq_size!(WireItemHdr, [u8; WireItemHdr::SIZE]);
assert_eq_align!(WireItemHdr, u64);
assert_eq_size!(WireRegionKey, [u8; 16]);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_header_without_region() {
        let h = WireItemHdr::new(3, FLAG_GHOST, 42, None, 2.5, 7);
        let bytes = cast_slice(std::slice::from_ref(&h)).to_vec();
        let mut r = WireReader::new(&bytes);
        let back: WireItemHdr = r.read().unwrap();
        assert_eq!(back.origin_rank(), 3);
        assert_eq!(back.flags(), FLAG_GHOST);
        assert_eq!(back.local_id(), 42);
        assert_eq!(back.region(), None);
        assert_eq!(back.weight(), 2.5);
        assert_eq!(back.payload_len(), 7);
        r.finish().unwrap();
    }

    #[test]
    fn region_presence_is_a_flag() {
        let h = WireItemHdr::new(0, 0, 1, Some(u64::MAX), 1.0, 0);
        assert_eq!(h.region(), Some(u64::MAX));
        assert_eq!(h.flags() & FLAG_GHOST, 0);
        let h = WireItemHdr::new(0, FLAG_GHOST, 1, Some(0), 1.0, 0);
        assert_eq!(h.region(), Some(0));
        assert_eq!(h.flags(), FLAG_GHOST | FLAG_REGION);
    }

    #[test]
    fn reader_reports_truncation() {
        let bytes = [0u8; 5];
        let mut r = WireReader::new(&bytes);
        let err = r.read_u64().unwrap_err();
        assert!(err.contains("truncated"), "{err}");
    }

    #[test]
    fn record_count_overflow_is_an_error() {
        let bytes = [0u8; 16];
        let r = WireReader::new(&bytes);
        assert!(r.expect_records(2, 8, "counts").is_ok());
        assert!(r.expect_records(3, 8, "counts").is_err());
        assert!(r.expect_records(usize::MAX, 16, "bounds").is_err());
    }

    #[test]
    fn version_guard() {
        let hdr = WireBatchHdr::new(1, 9);
        assert_eq!(hdr.version(), WIRE_VERSION);
        assert_eq!(hdr.count(), 9);
    }
}
