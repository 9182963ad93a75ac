//! Shared fixtures for the attach tests: a standard simulated geometry and
//! helpers to lay realistic PEB contents onto it.

use crate::mtd::sim::{SimLayout, SimMtd};
use crate::mtd::Mtd;

use super::headers::{Ec, Vid, VolType, UBI_CRC};
use super::io;

pub(crate) const IMAGE_SEQ: u32 = 0x1234_5678;

pub(crate) const LAYOUT: SimLayout = SimLayout {
    peb_count: 16,
    pages_per_peb: 16,
    page_size: 128,
    oob_size: 64,
};

/// An erased simulated device with the standard test geometry
pub(crate) fn new_mtd(peb_count: u32) -> SimMtd {
    SimMtd::new(SimLayout {
        peb_count,
        ..LAYOUT
    })
}

/// The EC header every formatted test PEB carries
pub(crate) fn proto_ec(mtd: &SimMtd) -> Ec {
    worn_ec(mtd, 1)
}

/// An EC header showing a specific amount of wear
pub(crate) fn worn_ec(mtd: &SimMtd, count: u64) -> Ec {
    Ec {
        ec: count,
        vid_hdr_offset: mtd.vid_hdr_offset() as u32,
        data_offset: mtd.data_offset() as u32,
        image_seq: IMAGE_SEQ,
    }
}

/// A static-volume VID header matching `data`
pub(crate) fn static_vid(vol_id: u32, lnum: u32, used_ebs: u32, sqnum: u64, data: &[u8]) -> Vid {
    Vid {
        vol_type: VolType::Static,
        vol_id,
        lnum,
        used_ebs,
        sqnum,
        data_size: data.len() as u32,
        data_crc: UBI_CRC.checksum(data),
        ..Default::default()
    }
}

/// A dynamic-volume copy VID header (copy flag set) matching `data`
pub(crate) fn copy_vid(vol_id: u32, lnum: u32, sqnum: u64, data: &[u8]) -> Vid {
    Vid {
        copy_flag: true,
        vol_id,
        lnum,
        sqnum,
        data_size: data.len() as u32,
        data_crc: UBI_CRC.checksum(data),
        ..Default::default()
    }
}

/// Program headers and (page-padded) data into one PEB
pub(crate) fn program_peb(
    mtd: &mut SimMtd,
    pnum: u32,
    ec: Ec,
    vid: Option<Vid>,
    data: &[u8],
) -> anyhow::Result<()> {
    io::write_ec_hdr(mtd, pnum, ec)?;
    if let Some(vid) = vid {
        io::write_vid_hdr(mtd, pnum, vid)?;
    }
    if !data.is_empty() {
        let page = mtd.min_io_size();
        let mut size = data.len() + page - 1;
        size -= size % page;

        let mut padded = data.to_vec();
        padded.resize(size, 0xFF);

        let offset = mtd.data_offset();
        mtd.write(&padded, pnum, offset)?;
    }
    Ok(())
}
