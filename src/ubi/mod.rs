//! This module implements UBI attach: reading every PEB of a freshly opened
//! medium, reconciling what is found there, and producing the in-memory
//! snapshot that the wear-leveler, the LEB mapper, and the volume-table
//! reader initialize themselves from.
//!
//! The walk through a single PEB is: read and validate its EC header, then
//! its VID header, classify the block from the two outcomes (in use, free,
//! needs erasure, corrupted, alien, bad), and when the block holds a LEB,
//! insert it into its volume's map, resolving duplicate copies by sequence
//! number and data CRC. After the walk, the mean erase counters are filled
//! into the blocks whose own counters were unreadable and the snapshot gets
//! a final viability analysis.
//!
//! Optionally, the full linear scan is preceded by a fastmap probe (so a
//! large medium can attach without touching every PEB) and followed by the
//! low-page backup recovery pass for paired-page media.

pub mod alloc;
pub mod backup;
pub mod check;
pub mod error;
pub mod fastmap;
pub mod headers;
pub mod io;
pub mod scan;
pub mod snapshot;

#[cfg(test)]
pub(crate) mod testutil;

use crate::mtd::Mtd;

pub use alloc::early_get_peb;
pub use error::{AttachError, FormatError};
pub use fastmap::{FastmapError, FastmapReader};
pub use headers::{Ec, Vid, VolType, UBI_VERSION};
pub use scan::scan_all;
pub use snapshot::{AttachInfo, CompareOutcome, EcStats, PebRecord, Queue, VolumeRecord};

/// Erase counters are stored in 64 bits on flash but only 31 bits are
/// meaningful; anything above this is a format error.
pub const UBI_MAX_ERASECOUNTER: u64 = 0x7FFF_FFFF;

/// Number of user volume ids (0 up to this, exclusive)
pub const UBI_MAX_VOLUMES: u32 = 128;

/// First volume id reserved for internal volumes
pub const UBI_INTERNAL_VOL_START: u32 = 0x7FFF_EFFF;

/// The volume-table (layout) volume
pub const UBI_LAYOUT_VOLUME_ID: u32 = UBI_INTERNAL_VOL_START;

/// The fastmap super-block volume; its PEBs anchor the fastmap
pub const UBI_FM_SB_VOLUME_ID: u32 = UBI_INTERNAL_VOL_START + 1;

/// The fastmap payload volume
pub const UBI_FM_DATA_VOLUME_ID: u32 = UBI_INTERNAL_VOL_START + 2;

/// The low-page backup volume
pub const UBI_BACKUP_VOLUME_ID: u32 = UBI_INTERNAL_VOL_START + 3;

/// The fastmap anchor must sit within the first this-many PEBs
pub const UBI_FM_MAX_START: u32 = 64;

/// LEBs in the low-page backup volume
pub const UBI_BACKUP_VOLUME_EBS: u32 = 2;

/// Compatibility codes unknown internal volumes may carry
pub const UBI_COMPAT_DELETE: u8 = 1;
pub const UBI_COMPAT_RO: u8 = 2;
pub const UBI_COMPAT_PRESERVE: u8 = 4;
pub const UBI_COMPAT_REJECT: u8 = 5;

/// Retries granted to a failing write during recovery before the device
/// drops to read-only
pub const UBI_IO_RETRIES: usize = 3;

/// Optional behaviors of the attach core
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct AttachConfig {
    /// Probe for a fastmap instead of always running the full scan
    pub enable_fastmap: bool,

    /// Track SLC and TLC erase-counter statistics as separate pools
    pub enable_tlc_tracking: bool,

    /// Maintain the waiting queue and run low-page backup recovery
    pub enable_low_page_backup: bool,

    /// Verify the snapshot invariants after scanning
    pub self_check: bool,
}

/// Attach the medium and build its snapshot.
///
/// With fastmap enabled (and a reader wired in), the front of the medium is
/// probed first: a good fastmap replaces the scan entirely, a missing one
/// lets the scan continue behind the probed region, and a bad one discards
/// everything and rescans from PEB 0. Any fatal error drops the partial
/// snapshot and aborts the attach.
pub fn attach<M: Mtd>(
    mtd: &mut M,
    cfg: &AttachConfig,
    fm_reader: Option<&mut dyn FastmapReader<M>>,
    force_scan: bool,
) -> Result<AttachInfo, AttachError> {
    let mut ai = AttachInfo::new(cfg);

    let reader = match fm_reader {
        Some(reader)
            if !force_scan && cfg.enable_fastmap && mtd.peb_count() > UBI_FM_MAX_START =>
        {
            Some(reader)
        }
        _ => None,
    };

    match reader {
        None => scan::scan_all(mtd, cfg, &mut ai, 0)?,
        Some(reader) => match fastmap::scan_fast(mtd, cfg, reader, &mut ai) {
            Ok(()) => {}
            Err(FastmapError::NoFastmap) => scan::scan_all(mtd, cfg, &mut ai, UBI_FM_MAX_START)?,
            Err(FastmapError::BadFastmap) => {
                ai = AttachInfo::new(cfg);
                scan::scan_all(mtd, cfg, &mut ai, 0)?;
            }
            Err(FastmapError::Attach(err)) => return Err(err),
        },
    }

    if cfg.enable_low_page_backup {
        backup::recover_low_pages(mtd, &mut ai)?;
    }

    Ok(ai)
}
