//! RedistError: unified error type for mesh-redistribute public APIs
//!
//! Every collective entry point surfaces its failure synchronously through
//! this enum. Errors fall into two families: configuration errors (reported
//! before any message is posted, or when reduction operands disagree) and
//! transport errors (a send/receive failed mid-round; the pass is lost).

use thiserror::Error;

/// Boxed transport-level cause.
pub type CommSource = Box<dyn std::error::Error + Send + Sync>;

/// Unified error type for redistribution, reconciliation and reduction.
#[derive(Debug, Error)]
pub enum RedistError {
    /// A worker group was formed over a communicator of size zero.
    #[error("worker group must contain at least one worker")]
    ZeroWorkers,
    /// A rank was outside `[0, size)`.
    #[error("rank {rank} is out of range for a group of {size} workers")]
    RankOutOfRange { rank: usize, size: usize },
    /// A new pass was requested while another one still has rounds in flight.
    #[error("pass {active} is still in flight on this worker; drain it before starting pass {requested}")]
    PassInFlight { active: u32, requested: u32 },
    /// An earlier pass was abandoned mid-round; the group state is undefined.
    #[error("worker group poisoned: pass {pass} was abandoned before its rounds completed")]
    GroupPoisoned { pass: u32 },
    /// An item weight was negative or not finite.
    #[error("invalid weight {weight} for local item {index}")]
    InvalidWeight { index: usize, weight: f64 },
    /// Per-worker target fractions were unusable.
    #[error("invalid target fractions: {0}")]
    InvalidTargets(String),
    /// Another worker refused the pass during the totals round.
    #[error("rank {rank} rejected the pass: {reason}")]
    PeerRejected { rank: usize, reason: String },
    /// Other invalid configuration values.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Histograms with different binning were merged.
    #[error(
        "histogram bins differ: [{lo_a}, {hi_a}) x {bins_a} vs [{lo_b}, {hi_b}) x {bins_b}"
    )]
    HistogramMismatch {
        lo_a: f64,
        hi_a: f64,
        bins_a: usize,
        lo_b: f64,
        hi_b: f64,
        bins_b: usize,
    },
    /// Two partial statistics had different shapes.
    #[error("{what} shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },
    /// A send or receive with `neighbor` failed.
    #[error("communication error with rank {neighbor}: {source}")]
    CommError {
        neighbor: usize,
        #[source]
        source: CommSource,
    },
    /// A message arrived with an unexpected byte length.
    #[error("buffer size mismatch from rank {neighbor}: expected {expected} bytes, got {got}")]
    BufferSizeMismatch {
        neighbor: usize,
        expected: usize,
        got: usize,
    },
    /// A received record could not be decoded.
    #[error("malformed record from rank {neighbor}: {reason}")]
    MalformedRecord { neighbor: usize, reason: String },
    /// Items were lost or duplicated by a pass.
    #[error("partition invariant violated: {0}")]
    PartitionViolation(String),
}

impl RedistError {
    /// Fatal configuration problem, detected without corrupting any state.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            RedistError::ZeroWorkers
                | RedistError::RankOutOfRange { .. }
                | RedistError::PassInFlight { .. }
                | RedistError::GroupPoisoned { .. }
                | RedistError::InvalidWeight { .. }
                | RedistError::InvalidTargets(_)
                | RedistError::InvalidConfig(_)
                | RedistError::PeerRejected { .. }
                | RedistError::HistogramMismatch { .. }
                | RedistError::ShapeMismatch { .. }
        )
    }

    /// Failure of the underlying send/receive primitives. Never retried.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RedistError::CommError { .. }
                | RedistError::BufferSizeMismatch { .. }
                | RedistError::MalformedRecord { .. }
        )
    }

    pub(crate) fn comm(neighbor: usize, msg: impl Into<String>) -> Self {
        RedistError::CommError {
            neighbor,
            source: msg.into().into(),
        }
    }
}

/// Recoverable condition reported next to a successful pass.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum PassWarning {
    /// All weights were zero; the distribution was left unchanged.
    #[error("pass {pass}: total weight is zero across all workers; no items moved")]
    DegenerateInput { pass: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_disjoint() {
        let cfg = RedistError::ZeroWorkers;
        assert!(cfg.is_configuration());
        assert!(!cfg.is_transport());

        let tx = RedistError::comm(3, "mailbox closed");
        assert!(tx.is_transport());
        assert!(!tx.is_configuration());
        assert!(tx.to_string().contains("rank 3"));

        let bug = RedistError::PartitionViolation("lost 1 item".into());
        assert!(!bug.is_transport() && !bug.is_configuration());
    }

    #[test]
    fn degenerate_warning_names_pass() {
        let w = PassWarning::DegenerateInput { pass: 7 };
        assert!(w.to_string().starts_with("pass 7"));
    }
}
