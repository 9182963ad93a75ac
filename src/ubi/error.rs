//! The error taxonomy of the attach core.
//!
//! Everything fatal bubbles up to [`attach`](super::attach), which drops the
//! partially built snapshot and returns. Recoverable oddities (bit-flips,
//! zero sequence numbers, read-only internal volumes) are reported and leave
//! the device attached in a degraded mode instead.

use thiserror::Error;

use crate::mtd::MtdError;

/// A fatal attach failure
#[derive(Debug, Error)]
pub enum AttachError {
    /// The medium itself failed underneath us
    #[error(transparent)]
    Io(#[from] MtdError),

    /// The on-flash data is not something this implementation can mount
    #[error(transparent)]
    Format(#[from] FormatError),

    /// Too many PEBs with unexplained corruption
    #[error("too many corrupted PEBs ({count}, limit {limit}), refusing attach")]
    CorruptionBudget { count: u32, limit: u32 },

    /// An apparently empty medium with too many unreadable PEBs; most likely
    /// it holds some other format's data
    #[error("{maybe_bad} maybe-bad PEBs on an apparently empty medium, refusing attach")]
    NotUbi { maybe_bad: u32 },

    /// The early allocator found neither a free PEB nor an erasable one
    #[error("no free or erasable PEBs available")]
    NoSpace,

    /// A post-scan invariant did not hold
    #[error("attach self-check failed: {0}")]
    SelfCheck(String),
}

/// On-flash format problems; all of these abort the attach
#[derive(Debug, Error, Eq, PartialEq, Copy, Clone)]
pub enum FormatError {
    #[error("PEB {pnum}: on-flash format version {version} is not supported")]
    Version { pnum: u32, version: u8 },

    #[error("PEB {pnum}: erase counter {ec} overflows")]
    EcOverflow { pnum: u32, ec: u64 },

    #[error("PEB {pnum}: image sequence number {found:#010x} does not match {expected:#010x}")]
    ImageSeq {
        pnum: u32,
        expected: u32,
        found: u32,
    },

    #[error("PEB {pnum}: bad {field} value in a CRC-valid header")]
    BadField { pnum: u32, field: &'static str },

    #[error("PEB {pnum}: VID header disagrees with volume {vol_id}")]
    VidMismatch { pnum: u32, vol_id: u32 },

    #[error("PEB {pnum}: VID header vanished while resolving LEB copies")]
    VidHeaderLost { pnum: u32 },

    #[error("volume {vol_id}, LEB {lnum}: two PEBs share sequence number {sqnum}")]
    DuplicateSqnum { vol_id: u32, lnum: u32, sqnum: u64 },

    #[error("PEB {pnum}: internal volume {vol_id} is incompatible (compat {compat})")]
    Incompatible { pnum: u32, vol_id: u32, compat: u8 },
}
