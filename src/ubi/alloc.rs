//! Handing out a usable PEB while attach is still running, before the
//! wear-leveler exists to do it properly.

use crate::mtd::Mtd;

use super::error::{AttachError, FormatError};
use super::headers::Ec;
use super::io;
use super::snapshot::{AttachInfo, PebRecord};
use super::UBI_MAX_ERASECOUNTER;

/// Erase `pnum` and stamp it with a fresh EC header carrying `new_ec`
fn early_erase_peb<M: Mtd>(
    mtd: &mut M,
    ai: &AttachInfo,
    pnum: u32,
    new_ec: u64,
) -> Result<(), AttachError> {
    if new_ec > UBI_MAX_ERASECOUNTER {
        return Err(FormatError::EcOverflow { pnum, ec: new_ec }.into());
    }

    mtd.sync_erase(pnum)?;

    let ec = Ec {
        ec: new_ec,
        vid_hdr_offset: mtd.vid_hdr_offset() as u32,
        data_offset: mtd.data_offset() as u32,
        image_seq: ai.image_seq,
    };
    io::write_ec_hdr(mtd, pnum, ec)
}

/// Produce one writable PEB from the snapshot.
///
/// A free PEB is handed out as-is. Otherwise the erase queue is walked:
/// each candidate is erased synchronously and restamped with its bumped
/// erase counter (the pool mean when the counter is unknown); candidates
/// that refuse to erase are simply passed over.
pub fn early_get_peb<M: Mtd>(mtd: &mut M, ai: &mut AttachInfo) -> Result<PebRecord, AttachError> {
    if let Some(peb) = ai.free.pop_front() {
        return Ok(peb);
    }

    let mut i = 0;
    while i < ai.erase.len() {
        let pnum = ai.erase[i].pnum;
        let ec = ai.erase[i]
            .ec
            .unwrap_or_else(|| ai.ec_stats(mtd.peb_class(pnum)).mean);

        match early_erase_peb(mtd, ai, pnum, ec + 1) {
            Ok(()) => {
                ai.erase.remove(i);
                let mut peb = PebRecord::unknown(pnum);
                peb.ec = Some(ec + 1);
                return Ok(peb);
            }
            // A PEB that will not erase is no loss; try the next one
            Err(_) => i += 1,
        }
    }

    Err(AttachError::NoSpace)
}
