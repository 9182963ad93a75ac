//! This module contains the code that scans flash and determines the contents
//! of every PEB: the per-PEB classifier, the full linear scan, and the
//! post-scan analysis that decides whether the medium is mountable at all.

use howudoin::Tx;

use crate::mtd::{Mtd, PatternExt, ReadKind};

use super::error::{AttachError, FormatError};
use super::io::{self, HdrIo};
use super::snapshot::{AttachInfo, PebRecord, Queue};
use super::{
    AttachConfig, UBI_BACKUP_VOLUME_ID, UBI_COMPAT_DELETE, UBI_COMPAT_PRESERVE, UBI_COMPAT_REJECT,
    UBI_COMPAT_RO, UBI_FM_DATA_VOLUME_ID, UBI_FM_SB_VOLUME_ID, UBI_INTERNAL_VOL_START,
    UBI_LAYOUT_VOLUME_ID,
};

/// What the discriminator concluded about a PEB whose EC header is fine but
/// whose VID header would not decode
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
enum Corruption {
    /// Remnant of an interrupted erase or write; safe to erase again
    PowerCut,

    /// Data is present that no power cut explains; preserve for inspection
    Unexpected,
}

/// Read the data area behind a damaged VID header and decide whether the
/// damage looks like a power cut or like foreign/corrupted data.
fn check_corruption<M: Mtd>(
    mtd: &mut M,
    databuf: &mut [u8],
    pnum: u32,
    rpt: &Tx,
) -> Result<Corruption, AttachError> {
    let buf = &mut databuf[..mtd.leb_size()];

    match io::read_data(mtd, buf, pnum, 0)? {
        // The medium itself reports damage; an interrupted erase looks
        // exactly like this.
        ReadKind::Bitflips | ReadKind::EccError => return Ok(Corruption::PowerCut),
        ReadKind::Clean => {}
    }

    if buf.is_all_ff() {
        Ok(Corruption::PowerCut)
    } else {
        rpt.add_info(format!(
            "PEB {pnum}: corrupted VID header, and the data area is not erased"
        ));
        Ok(Corruption::Unexpected)
    }
}

/// Every EC header carries the image stamp; a nonzero stamp that disagrees
/// with the rest of the medium means two images were mixed together.
fn check_image_seq(ai: &mut AttachInfo, pnum: u32, image_seq: u32) -> Result<(), AttachError> {
    if image_seq == 0 {
        // Headers written before image stamping are always accepted
        return Ok(());
    }
    if ai.image_seq == 0 {
        ai.image_seq = image_seq;
        return Ok(());
    }
    if ai.image_seq != image_seq {
        return Err(FormatError::ImageSeq {
            pnum,
            expected: ai.image_seq,
            found: image_seq,
        }
        .into());
    }
    Ok(())
}

/// Internal volumes this implementation manages itself; everything else in
/// the internal range is handled via its compatibility code.
fn recognized_internal(cfg: &AttachConfig, vol_id: u32) -> bool {
    vol_id == UBI_LAYOUT_VOLUME_ID
        || (cfg.enable_fastmap && (vol_id == UBI_FM_SB_VOLUME_ID || vol_id == UBI_FM_DATA_VOLUME_ID))
        || (cfg.enable_low_page_backup && vol_id == UBI_BACKUP_VOLUME_ID)
}

/// Read both headers of one PEB and route it into the snapshot.
pub(crate) fn scan_peb<M: Mtd>(
    mtd: &mut M,
    cfg: &AttachConfig,
    ai: &mut AttachInfo,
    pnum: u32,
    databuf: &mut [u8],
    rpt: &Tx,
) -> Result<(), AttachError> {
    if mtd.is_bad(pnum)? {
        ai.bad_peb_count += 1;
        return Ok(());
    }

    let class = mtd.peb_class(pnum);
    let mut ec: Option<u64> = None;
    let mut bitflips = false;
    let mut ec_bad = false;
    let mut ec_ecc = false;

    match io::read_ec_hdr(mtd, pnum)? {
        HdrIo::Ok(hdr) => {
            check_image_seq(ai, pnum, hdr.image_seq)?;
            ec = Some(hdr.ec);
        }
        HdrIo::Bitflips(hdr) => {
            bitflips = true;
            check_image_seq(ai, pnum, hdr.image_seq)?;
            ec = Some(hdr.ec);
        }
        HdrIo::AllFf => {
            ai.empty_peb_count += 1;
            ai.add_to_list(PebRecord::unknown(pnum), false, Queue::Erase);
            return Ok(());
        }
        HdrIo::AllFfBitflips => {
            ai.empty_peb_count += 1;
            let mut peb = PebRecord::unknown(pnum);
            peb.scrub = true;
            ai.add_to_list(peb, true, Queue::Erase);
            return Ok(());
        }
        HdrIo::BadHdr => {
            ec_bad = true;
            bitflips = true;
        }
        HdrIo::BadHdrEcc => {
            ec_bad = true;
            ec_ecc = true;
            bitflips = true;
        }
    }

    let vid = match io::read_vid_hdr(mtd, pnum)? {
        HdrIo::Ok(vid) => vid,
        HdrIo::Bitflips(vid) => {
            bitflips = true;
            vid
        }
        HdrIo::AllFf => {
            // EC header but no VID header: the PEB holds nothing. It only
            // counts as free if nothing anywhere hinted at damage.
            let mut peb = PebRecord::unknown(pnum);
            peb.ec = ec;
            if ec_bad || bitflips {
                peb.scrub = true;
                ai.add_to_list(peb, true, Queue::Erase);
            } else {
                ai.add_to_list(peb, false, Queue::Free);
            }
            ai.note_ec(class, ec);
            return Ok(());
        }
        HdrIo::AllFfBitflips => {
            let mut peb = PebRecord::unknown(pnum);
            peb.ec = ec;
            peb.scrub = true;
            ai.add_to_list(peb, true, Queue::Erase);
            ai.note_ec(class, ec);
            return Ok(());
        }
        vid_err @ (HdrIo::BadHdr | HdrIo::BadHdrEcc) => {
            if vid_err == HdrIo::BadHdrEcc && ec_ecc {
                // Both headers took uncorrectable damage; the block itself
                // may be going bad.
                ai.maybe_bad_peb_count += 1;
            }

            let mut peb = PebRecord::unknown(pnum);
            peb.ec = ec;
            peb.scrub = true;

            if ec_bad {
                // Neither header decodes; nothing to discriminate on
                ai.add_to_list(peb, true, Queue::Erase);
            } else {
                match check_corruption(mtd, databuf, pnum, rpt)? {
                    Corruption::PowerCut => ai.add_to_list(peb, true, Queue::Erase),
                    Corruption::Unexpected => ai.add_corrupt(peb),
                }
            }
            ai.note_ec(class, ec);
            return Ok(());
        }
    };

    // Internal volumes we do not manage ourselves are handled per their
    // compatibility code.
    if vid.vol_id >= UBI_INTERNAL_VOL_START && !recognized_internal(cfg, vid.vol_id) {
        match vid.compat {
            UBI_COMPAT_DELETE => {
                rpt.add_info(format!(
                    "PEB {pnum}: \"delete\"-compatible internal volume {}:{}, will remove",
                    vid.vol_id, vid.lnum
                ));
                ai.add_to_list(PebRecord::mapped(pnum, ec, &vid, bitflips), true, Queue::Erase);
                return Ok(());
            }
            UBI_COMPAT_RO => {
                rpt.add_info(format!(
                    "read-only internal volume {} found, attaching read-only",
                    vid.vol_id
                ));
                ai.ro_mode = true;
            }
            UBI_COMPAT_PRESERVE => {
                ai.alien_peb_count += 1;
                ai.add_to_list(PebRecord::mapped(pnum, ec, &vid, bitflips), false, Queue::Alien);
                return Ok(());
            }
            UBI_COMPAT_REJECT => {
                return Err(FormatError::Incompatible {
                    pnum,
                    vol_id: vid.vol_id,
                    compat: vid.compat,
                }
                .into());
            }
            _ => {}
        }
    }

    if ec_bad {
        rpt.add_info(format!(
            "PEB {pnum}: valid VID header but corrupt EC header; erase counter unknown, will scrub"
        ));
    }

    ai.add_to_av(mtd, databuf, pnum, ec, &vid, bitflips)?;
    ai.note_ec(class, ec);
    Ok(())
}

/// Scan every PEB from `start` up, then finish the snapshot: compute the
/// mean erase counters, back-fill the unknown ones, run the viability
/// analysis, and (when configured) the self-check.
pub fn scan_all<M: Mtd>(
    mtd: &mut M,
    cfg: &AttachConfig,
    ai: &mut AttachInfo,
    start: u32,
) -> Result<(), AttachError> {
    let peb_count = mtd.peb_count();
    let rpt = howudoin::new()
        .label("Scanning PEBs")
        .set_len(u64::from(peb_count.saturating_sub(start)));

    let mut databuf = vec![0u8; mtd.leb_size()];
    for pnum in start..peb_count {
        scan_peb(mtd, cfg, ai, pnum, &mut databuf, &rpt)?;
        rpt.inc();
    }

    ai.finalize_ec();
    ai.backfill_ec(mtd);
    late_analysis(mtd, ai, &rpt)?;
    rpt.close();

    if cfg.self_check {
        super::check::self_check_ai(mtd, ai)?;
    }

    Ok(())
}

/// Decide whether what the scan found is mountable.
fn late_analysis<M: Mtd>(mtd: &M, ai: &mut AttachInfo, rpt: &Tx) -> Result<(), AttachError> {
    let peb_count = mtd.peb_count();
    ai.good_peb_count = peb_count - ai.bad_peb_count;

    if ai.corr_peb_count > 0 {
        rpt.add_info(format!(
            "{} PEBs are corrupted and preserved",
            ai.corr_peb_count
        ));

        let limit = (peb_count / 20).max(8);
        if ai.corr_peb_count >= limit {
            return Err(AttachError::CorruptionBudget {
                count: ai.corr_peb_count,
                limit,
            });
        }
    }

    if ai.empty_peb_count + ai.maybe_bad_peb_count == ai.good_peb_count {
        // Nothing on the medium decoded. A handful of unreadable PEBs is
        // normal wear on a blank device; more than that means the medium
        // probably holds something that is not ours to erase.
        if ai.maybe_bad_peb_count <= 2 {
            ai.is_empty = true;
            rpt.add_info("empty flash device detected");
            ai.image_seq = loop {
                let seq: u32 = rand::random();
                if seq != 0 {
                    break seq;
                }
            };
        } else {
            return Err(AttachError::NotUbi {
                maybe_bad: ai.maybe_bad_peb_count,
            });
        }
    }

    Ok(())
}
