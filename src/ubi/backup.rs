//! Low-page backup recovery for MLC/TLC media.
//!
//! Writes to low pages are vulnerable until their paired high page is
//! programmed: an interruption in between can corrupt data that was already
//! on flash. To cover that window, the writer mirrors each risky low page
//! into a dedicated two-LEB internal backup volume, with a descriptor in
//! the page's spare area naming the source. After the main scan, this pass
//! replays the backup log and rebuilds any PEB whose pages took paired-page
//! damage.

use deku::prelude::*;
use retry::{delay::Fixed, retry};

use crate::mtd::{Mtd, ReadKind};

use super::alloc::early_get_peb;
use super::error::AttachError;
use super::headers::{seal, seal_crc, Ec, Vid, VolType, UBI_CRC};
use super::io::{self, HdrIo};
use super::snapshot::{AttachInfo, Queue};
use super::{UBI_BACKUP_VOLUME_EBS, UBI_BACKUP_VOLUME_ID, UBI_IO_RETRIES};

/// Magic stamped on every backup descriptor ("BKP!")
const BACKUP_DESC_MAGIC: u32 = 0x424B_5021;

/// Serialized size of a [`BackupDesc`]
pub const BACKUP_DESC_SIZE: usize = 28;

/// Spare-area descriptor written alongside every backed-up page
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct BackupDesc {
    pub magic: u32,

    /// PEB whose low page was mirrored
    pub source_pnum: u32,

    /// LEB that PEB held when the backup was taken
    pub source_lnum: u32,

    /// Page index within the source PEB's data area
    pub source_page: u32,

    /// Backup-log ordering; replay happens newest-first
    pub sqnum: u64,

    pub desc_crc: u32,
}

impl BackupDesc {
    /// Decode from a spare-area buffer, verifying magic and seal
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (_, desc) = Self::from_bytes((bytes, 0)).ok()?;
        if desc.magic != BACKUP_DESC_MAGIC {
            return None;
        }
        (desc.desc_crc == seal_crc(&bytes[..BACKUP_DESC_SIZE])).then_some(desc)
    }

    /// Serialize, with the magic and the seal filled in
    pub fn encode(mut self) -> Vec<u8> {
        self.magic = BACKUP_DESC_MAGIC;
        seal(self)
    }
}

/// How one rebuild attempt ended
enum Rebuild {
    Done,
    GiveUp,
}

/// Find the first still-empty data page of `pnum` by binary search; pages
/// are programmed strictly in order, so emptiness is monotonic.
fn first_empty_page<M: Mtd>(mtd: &mut M, pnum: u32) -> Result<u32, AttachError> {
    let data_start = (mtd.data_offset() / mtd.min_io_size()) as u32;
    let data_pages = mtd.pages_per_peb() - data_start;

    let (mut lo, mut hi) = (0, data_pages);
    while lo < hi {
        let mid = (lo + hi) / 2;
        if mtd.page_is_empty(pnum, data_start + mid)? {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    Ok(lo)
}

/// Collect every decodable descriptor from both backup LEBs, newest first
fn collect_records<M: Mtd>(
    mtd: &mut M,
    ai: &AttachInfo,
    rpt: &howudoin::Tx,
) -> Result<Vec<(BackupDesc, u32, u32)>, AttachError> {
    let Some(bv) = ai.find_volume(UBI_BACKUP_VOLUME_ID) else {
        return Ok(Vec::new());
    };
    if bv.leb_count > UBI_BACKUP_VOLUME_EBS {
        rpt.add_info(format!(
            "backup volume has {} LEBs, expected at most {}",
            bv.leb_count, UBI_BACKUP_VOLUME_EBS
        ));
    }

    let data_start = (mtd.data_offset() / mtd.min_io_size()) as u32;
    let mut records = Vec::new();

    for (lnum, peb) in &bv.lebs {
        let end = first_empty_page(mtd, peb.pnum)?;
        for page in (0..end).rev() {
            let mut oob = vec![0u8; mtd.oob_size()];
            mtd.read_oob(&mut oob, peb.pnum, data_start + page)?;

            match BackupDesc::decode(&oob) {
                Some(desc) => records.push((desc, peb.pnum, page)),
                None => {
                    rpt.add_info(format!(
                        "backup LEB {lnum}: skipping page {page} with a bad descriptor"
                    ));
                }
            }
        }
    }

    records.sort_by(|a, b| b.0.sqnum.cmp(&a.0.sqnum));
    Ok(records)
}

/// The volume whose `source_lnum` is still held by `source_pnum`, if the
/// mapping survived the scan
fn locate_source(ai: &AttachInfo, desc: &BackupDesc) -> Option<u32> {
    ai.volumes.iter().find_map(|(&vol_id, av)| {
        if vol_id == UBI_BACKUP_VOLUME_ID {
            return None;
        }
        let peb = av.lebs.get(&desc.source_lnum)?;
        (peb.pnum == desc.source_pnum).then_some(vol_id)
    })
}

/// Did the backed-up low page, or its paired high page, take damage?
fn page_damaged<M: Mtd>(
    mtd: &mut M,
    desc: &BackupDesc,
    mapped_sqnum: u64,
) -> Result<bool, AttachError> {
    let min_io = mtd.min_io_size();
    let data_start = (mtd.data_offset() / min_io) as u32;
    let low = data_start + desc.source_page;
    let Some(high) = mtd.paired_page(low) else {
        return Ok(false);
    };

    let mut pagebuf = vec![0u8; min_io];
    let low_read = mtd.read(&mut pagebuf, desc.source_pnum, low as usize * min_io)?;
    let high_read = mtd.read(&mut pagebuf, desc.source_pnum, high as usize * min_io)?;
    if low_read != ReadKind::Clean || high_read != ReadKind::Clean {
        return Ok(true);
    }

    // An empty high page means the pairing window was never closed; if the
    // mapped copy predates the backup record, the low page is suspect.
    if mtd.page_is_empty(desc.source_pnum, high)? && mapped_sqnum < desc.sqnum {
        return Ok(true);
    }

    Ok(false)
}

/// Detach the damaged PEB from its volume into the waiting queue; its data
/// stays readable until downstream commits the rebuilt copy. The record
/// moves whole, erase counter included.
fn retire_damaged(ai: &mut AttachInfo, vol_id: u32, lnum: u32) {
    let av = ai.volumes.get_mut(&vol_id).unwrap();
    if let Some(old) = av.lebs.remove(&lnum) {
        av.leb_count -= 1;
        ai.add_to_list(old, true, Queue::Waiting);
    }
}

/// Rebuild the damaged source PEB onto a freshly allocated one: salvage the
/// data area, overlay the backed-up page, and write a new copy with a fresh
/// sequence number.
fn rebuild_peb<M: Mtd>(
    mtd: &mut M,
    ai: &mut AttachInfo,
    desc: &BackupDesc,
    vol_id: u32,
    bk_pnum: u32,
    bk_page: u32,
    rpt: &howudoin::Tx,
) -> Result<Rebuild, AttachError> {
    let min_io = mtd.min_io_size();
    let leb_size = mtd.leb_size();

    // Salvage whatever the source still holds; degraded reads are fine here
    let mut data = vec![0xFFu8; leb_size];
    io::read_data(mtd, &mut data, desc.source_pnum, 0)?;

    // Overlay the backed-up copy of the low page
    let mut pagebuf = vec![0u8; min_io];
    io::read_data(mtd, &mut pagebuf, bk_pnum, bk_page as usize * min_io)?;
    let at = desc.source_page as usize * min_io;
    data[at..at + min_io].copy_from_slice(&pagebuf);

    // The source volume's geometry decides how much of the buffer the new
    // copy covers; static LEBs keep their original payload size.
    let av = &ai.volumes[&vol_id];
    let (vol_type, compat, used_ebs, data_pad) = (av.vol_type, av.compat, av.used_ebs, av.data_pad);
    let data_len = match vol_type {
        VolType::Static => match io::read_vid_hdr(mtd, desc.source_pnum)? {
            HdrIo::Ok(v) | HdrIo::Bitflips(v) => v.data_size as usize,
            _ => leb_size - data_pad as usize,
        },
        VolType::Dynamic => leb_size - data_pad as usize,
    };

    ai.max_sqnum += 1;
    let vid = Vid {
        vol_type,
        copy_flag: true,
        compat,
        vol_id,
        lnum: desc.source_lnum,
        data_size: data_len as u32,
        used_ebs,
        data_pad,
        data_crc: UBI_CRC.checksum(&data[..data_len]),
        sqnum: ai.max_sqnum,
    };

    let mut target = early_get_peb(mtd, ai)?;
    let image_seq = ai.image_seq;

    let mut size = data_len + min_io - 1;
    size -= size % min_io;

    let mut first = true;
    let wrote = retry(
        Fixed::from_millis(100).take(UBI_IO_RETRIES),
        || -> Result<(), AttachError> {
            if !first {
                // The failed attempt half-programmed the block; wipe it and
                // stamp a fresh EC header before going again.
                mtd.sync_erase(target.pnum)?;
                let new_ec = target.ec.map_or(1, |ec| ec + 1);
                target.ec = Some(new_ec);
                io::write_ec_hdr(
                    mtd,
                    target.pnum,
                    Ec {
                        ec: new_ec,
                        vid_hdr_offset: mtd.vid_hdr_offset() as u32,
                        data_offset: mtd.data_offset() as u32,
                        image_seq,
                    },
                )?;
            }
            first = false;

            io::write_vid_hdr(mtd, target.pnum, vid)?;
            mtd.write(&data[..size], target.pnum, mtd.data_offset())?;
            Ok(())
        },
    );

    match wrote {
        Ok(()) => {
            retire_damaged(ai, vol_id, desc.source_lnum);

            let mut databuf = vec![0u8; leb_size];
            ai.add_to_av(mtd, &mut databuf, target.pnum, target.ec, &vid, false)?;
            Ok(Rebuild::Done)
        }
        Err(err) => {
            rpt.add_info(format!(
                "PEB {}: rebuild keeps failing ({err}), attaching read-only",
                target.pnum
            ));
            ai.add_to_list(target, false, Queue::Erase);
            Ok(Rebuild::GiveUp)
        }
    }
}

/// Replay the backup log against the finished snapshot and rebuild every
/// PEB with paired-page damage. A rebuild that keeps failing flips the
/// attach into read-only mode and stops the pass; everything recovered so
/// far stays recovered.
pub(crate) fn recover_low_pages<M: Mtd>(
    mtd: &mut M,
    ai: &mut AttachInfo,
) -> Result<(), AttachError> {
    let rpt = howudoin::new().label("Replaying low-page backups");
    let records = collect_records(mtd, ai, &rpt)?;
    rpt.set_len(u64::try_from(records.len()).ok());

    for (desc, bk_pnum, bk_page) in records {
        rpt.inc();

        let Some(vol_id) = locate_source(ai, &desc) else {
            // The LEB moved on (or the record is stale); nothing to protect
            continue;
        };
        let mapped_sqnum = ai.volumes[&vol_id].lebs[&desc.source_lnum].sqnum;

        if !page_damaged(mtd, &desc, mapped_sqnum)? {
            continue;
        }

        rpt.add_info(format!(
            "PEB {}: paired-page damage on LEB {vol_id}:{}, rebuilding",
            desc.source_pnum, desc.source_lnum
        ));

        match rebuild_peb(mtd, ai, &desc, vol_id, bk_pnum, bk_page, &rpt)? {
            Rebuild::Done => {}
            Rebuild::GiveUp => {
                ai.ro_mode = true;
                break;
            }
        }
    }

    rpt.close();
    Ok(())
}
