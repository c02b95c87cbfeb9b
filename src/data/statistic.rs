//! Reducible statistics.
//!
//! Every [`Statistic`] merge is commutative and associative (exactly for
//! integer counts and min/max, up to rounding for floating-point sums), so
//! a linear and a tree reduction produce the same result.

use serde::{Deserialize, Serialize};

use crate::algs::wire::{WireReader, put_f64, put_u64};
use crate::redist_error::RedistError;

/// A partial result that can be merged across workers.
pub trait Statistic: Sized {
    /// Fold `other` into `self`. Fails on incompatible shapes.
    fn merge(&mut self, other: Self) -> Result<(), RedistError>;
    fn to_wire(&self) -> Vec<u8>;
    fn from_wire(bytes: &[u8]) -> Result<Self, String>;
}

/// Componentwise bounding ranges. An empty range has `min = +inf, max = -inf`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: Vec<f64>,
    pub max: Vec<f64>,
}

impl Bounds {
    /// Merge identity with `dims` components.
    pub fn empty(dims: usize) -> Self {
        Self {
            min: vec![f64::INFINITY; dims],
            max: vec![f64::NEG_INFINITY; dims],
        }
    }

    /// Bounds of a set of points; every point must have `dims` components.
    pub fn from_points<'a, I>(dims: usize, points: I) -> Result<Self, RedistError>
    where
        I: IntoIterator<Item = &'a [f64]>,
    {
        let mut b = Self::empty(dims);
        for p in points {
            b.include(p)?;
        }
        Ok(b)
    }

    pub fn dims(&self) -> usize {
        self.min.len()
    }

    /// Grow to contain `point`. NaN components are ignored.
    pub fn include(&mut self, point: &[f64]) -> Result<(), RedistError> {
        if point.len() != self.dims() {
            return Err(RedistError::ShapeMismatch {
                what: "bounds",
                expected: self.dims(),
                got: point.len(),
            });
        }
        for (d, &x) in point.iter().enumerate() {
            self.min[d] = self.min[d].min(x);
            self.max[d] = self.max[d].max(x);
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.min.iter().zip(&self.max).any(|(lo, hi)| lo > hi)
    }

    /// `(min, max)` of component `dim`, or `None` if nothing was included.
    pub fn range(&self, dim: usize) -> Option<(f64, f64)> {
        let (lo, hi) = (*self.min.get(dim)?, *self.max.get(dim)?);
        (lo <= hi).then_some((lo, hi))
    }
}

impl Statistic for Bounds {
    fn merge(&mut self, other: Self) -> Result<(), RedistError> {
        if other.dims() != self.dims() {
            return Err(RedistError::ShapeMismatch {
                what: "bounds",
                expected: self.dims(),
                got: other.dims(),
            });
        }
        for d in 0..self.dims() {
            self.min[d] = self.min[d].min(other.min[d]);
            self.max[d] = self.max[d].max(other.max[d]);
        }
        Ok(())
    }

    fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + 16 * self.dims());
        put_u64(&mut out, self.dims() as u64);
        for (&lo, &hi) in self.min.iter().zip(&self.max) {
            put_f64(&mut out, lo);
            put_f64(&mut out, hi);
        }
        out
    }

    fn from_wire(bytes: &[u8]) -> Result<Self, String> {
        let mut r = WireReader::new(bytes);
        let dims = r.read_u64()? as usize;
        r.expect_records(dims, 16, "bound pairs")?;
        let mut b = Self::empty(dims);
        for d in 0..dims {
            b.min[d] = r.read_f64()?;
            b.max[d] = r.read_f64()?;
        }
        r.finish()?;
        Ok(b)
    }
}

/// Elementwise counters, e.g. per-material item counts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts(pub Vec<u64>);

impl Statistic for Counts {
    fn merge(&mut self, other: Self) -> Result<(), RedistError> {
        if other.0.len() != self.0.len() {
            return Err(RedistError::ShapeMismatch {
                what: "counts",
                expected: self.0.len(),
                got: other.0.len(),
            });
        }
        for (a, b) in self.0.iter_mut().zip(other.0) {
            *a = a.saturating_add(b);
        }
        Ok(())
    }

    fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 * (self.0.len() + 1));
        put_u64(&mut out, self.0.len() as u64);
        for &c in &self.0 {
            put_u64(&mut out, c);
        }
        out
    }

    fn from_wire(bytes: &[u8]) -> Result<Self, String> {
        let mut r = WireReader::new(bytes);
        let n = r.read_u64()? as usize;
        r.expect_records(n, 8, "counts")?;
        let v = (0..n).map(|_| r.read_u64()).collect::<Result<Vec<_>, _>>()?;
        r.finish()?;
        Ok(Counts(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_merge_is_componentwise() {
        let mut a = Bounds::from_points(2, [&[0.0, 5.0][..], &[1.0, 4.0][..]]).unwrap();
        let b = Bounds::from_points(2, [&[-1.0, 6.0][..]]).unwrap();
        a.merge(b).unwrap();
        assert_eq!(a.range(0), Some((-1.0, 1.0)));
        assert_eq!(a.range(1), Some((4.0, 6.0)));
    }

    #[test]
    fn empty_bounds_is_identity() {
        let mut e = Bounds::empty(1);
        assert!(e.is_empty());
        let b = Bounds::from_points(1, [&[2.0][..]]).unwrap();
        e.merge(b.clone()).unwrap();
        assert_eq!(e, b);
        assert_eq!(Bounds::from_wire(&Bounds::empty(3).to_wire()).unwrap(), Bounds::empty(3));
    }

    #[test]
    fn huge_length_prefix_is_rejected() {
        let mut b = Vec::new();
        put_u64(&mut b, u64::MAX);
        put_f64(&mut b, 0.0);
        assert!(Bounds::from_wire(&b).is_err());
        assert!(Counts::from_wire(&b).is_err());
        assert!(crate::data::RegionTotals::from_wire(&b).is_err());
    }

    #[test]
    fn counts_shape_mismatch_is_config_error() {
        let mut a = Counts(vec![1, 2]);
        let err = a.merge(Counts(vec![1])).unwrap_err();
        assert!(err.is_configuration());
    }
}
