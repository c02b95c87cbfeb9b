//! Fixed-bin histogram statistic.
//!
//! Partial histograms only merge when their binning is bit-for-bit
//! identical; workers agree on the range first (see
//! [`parallel_histogram`](crate::algs::reduction::parallel_histogram)).

use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};

use crate::algs::wire::{WireReader, put_f64, put_u64};
use crate::data::statistic::Statistic;
use crate::redist_error::RedistError;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    lo: f64,
    hi: f64,
    counts: Vec<u64>,
}

impl Histogram {
    /// `bins` equal-width bins over `[lo, hi]`. A zero-width range is
    /// widened to `[lo, lo + 1]`.
    pub fn new(lo: f64, hi: f64, bins: usize) -> Result<Self, RedistError> {
        if bins == 0 {
            return Err(RedistError::InvalidConfig("histogram needs at least one bin".into()));
        }
        if !lo.is_finite() || !hi.is_finite() || hi < lo {
            return Err(RedistError::InvalidConfig(format!(
                "histogram range [{lo}, {hi}] is not a finite interval"
            )));
        }
        let hi = if hi == lo { lo + 1.0 } else { hi };
        Ok(Self {
            lo,
            hi,
            counts: vec![0; bins],
        })
    }

    pub fn bins(&self) -> usize {
        self.counts.len()
    }

    pub fn range(&self) -> (f64, f64) {
        (self.lo, self.hi)
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn bin_width(&self) -> f64 {
        (self.hi - self.lo) / self.bins() as f64
    }

    /// The `bins + 1` bin boundaries.
    pub fn bin_edges(&self) -> Vec<f64> {
        let w = self.bin_width();
        (0..=self.bins())
            .map(|i| if i == self.bins() { self.hi } else { self.lo + w * i as f64 })
            .collect()
    }

    /// Bin index of `v`; `hi` itself lands in the last bin.
    pub fn bin_of(&self, v: f64) -> Option<usize> {
        if !(self.lo..=self.hi).contains(&v) {
            return None;
        }
        let idx = ((v - self.lo) / self.bin_width()).floor() as usize;
        Some(idx.min(self.bins() - 1))
    }

    /// Count `values`; values outside the range or not representable as
    /// `f64` are skipped. Returns how many were binned.
    pub fn accumulate<I>(&mut self, values: I) -> usize
    where
        I: IntoIterator,
        I::Item: ToPrimitive,
    {
        let mut n = 0;
        for v in values {
            if let Some(b) = v.to_f64().and_then(|x| self.bin_of(x)) {
                self.counts[b] += 1;
                n += 1;
            }
        }
        n
    }

    fn same_binning(&self, other: &Self) -> bool {
        self.lo.to_bits() == other.lo.to_bits()
            && self.hi.to_bits() == other.hi.to_bits()
            && self.bins() == other.bins()
    }
}

impl Statistic for Histogram {
    fn merge(&mut self, other: Self) -> Result<(), RedistError> {
        if !self.same_binning(&other) {
            return Err(RedistError::HistogramMismatch {
                lo_a: self.lo,
                hi_a: self.hi,
                bins_a: self.bins(),
                lo_b: other.lo,
                hi_b: other.hi,
                bins_b: other.bins(),
            });
        }
        for (a, b) in self.counts.iter_mut().zip(other.counts) {
            *a += b;
        }
        Ok(())
    }

    fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24 + 8 * self.bins());
        put_f64(&mut out, self.lo);
        put_f64(&mut out, self.hi);
        put_u64(&mut out, self.bins() as u64);
        for &c in &self.counts {
            put_u64(&mut out, c);
        }
        out
    }

    fn from_wire(bytes: &[u8]) -> Result<Self, String> {
        let mut r = WireReader::new(bytes);
        let lo = r.read_f64()?;
        let hi = r.read_f64()?;
        let bins = r.read_u64()? as usize;
        if bins == 0 {
            return Err("histogram with zero bins".into());
        }
        r.expect_records(bins, 8, "histogram bins")?;
        let counts = (0..bins).map(|_| r.read_u64()).collect::<Result<Vec<_>, _>>()?;
        r.finish()?;
        Ok(Self { lo, hi, counts })
    }
}
