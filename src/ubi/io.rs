//! Header-level I/O: reading EC/VID headers off the medium and folding the
//! read result and the decode result into the outcome the classifier
//! dispatches on.

use crate::mtd::{Mtd, MtdError, PatternExt, ReadKind};

use super::error::{AttachError, FormatError};
use super::headers::{Ec, HdrError, Vid, VolType, UBI_EC_HDR_SIZE, UBI_VID_HDR_SIZE};
use super::{
    UBI_COMPAT_DELETE, UBI_COMPAT_PRESERVE, UBI_COMPAT_REJECT, UBI_COMPAT_RO,
    UBI_INTERNAL_VOL_START, UBI_MAX_ERASECOUNTER, UBI_MAX_VOLUMES,
};

/// The outcome of reading one on-flash header
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum HdrIo<H> {
    /// Header present, CRC good
    Ok(H),

    /// Header present, CRC good, but the read needed ECC corrections; the
    /// PEB should be scrubbed
    Bitflips(H),

    /// The header region is entirely 0xFF
    AllFf,

    /// The header region is entirely 0xFF, read with corrected bit-flips
    AllFfBitflips,

    /// Magic or CRC mismatch, without ECC complaints
    BadHdr,

    /// Magic or CRC mismatch, and the read had uncorrectable ECC errors
    BadHdrEcc,
}

/// Read and validate the EC header of `pnum`.
///
/// Validation failures that no power cut can explain (wrong format version,
/// erase-counter overflow, geometry mismatch) are hard errors; everything
/// else maps onto a [`HdrIo`] outcome.
pub fn read_ec_hdr<M: Mtd>(mtd: &mut M, pnum: u32) -> Result<HdrIo<Ec>, AttachError> {
    let mut buf = [0u8; UBI_EC_HDR_SIZE];
    let kind = mtd.read(&mut buf, pnum, 0)?;

    let ec = match Ec::decode(&buf) {
        Ok(ec) => ec,
        Err(err) => return hdr_outcome(pnum, err, kind, &buf),
    };

    if ec.ec > UBI_MAX_ERASECOUNTER {
        return Err(FormatError::EcOverflow { pnum, ec: ec.ec }.into());
    }
    if ec.vid_hdr_offset as usize != mtd.vid_hdr_offset() {
        return Err(FormatError::BadField {
            pnum,
            field: "vid_hdr_offset",
        }
        .into());
    }
    if ec.data_offset as usize != mtd.data_offset() {
        return Err(FormatError::BadField {
            pnum,
            field: "data_offset",
        }
        .into());
    }

    Ok(match kind {
        ReadKind::Clean => HdrIo::Ok(ec),
        // The header survived the damage; keep it but schedule a scrub.
        ReadKind::Bitflips | ReadKind::EccError => HdrIo::Bitflips(ec),
    })
}

/// Read and validate the VID header of `pnum`.
pub fn read_vid_hdr<M: Mtd>(mtd: &mut M, pnum: u32) -> Result<HdrIo<Vid>, AttachError> {
    let mut buf = [0u8; UBI_VID_HDR_SIZE];
    let kind = mtd.read(&mut buf, pnum, mtd.vid_hdr_offset())?;

    let vid = match Vid::decode(&buf) {
        Ok(vid) => vid,
        Err(err) => return hdr_outcome(pnum, err, kind, &buf),
    };

    validate_vid_fields(mtd, pnum, &vid)?;

    Ok(match kind {
        ReadKind::Clean => HdrIo::Ok(vid),
        ReadKind::Bitflips | ReadKind::EccError => HdrIo::Bitflips(vid),
    })
}

/// Map a decode failure onto a [`HdrIo`] outcome (or a fatal format error)
fn hdr_outcome<H>(
    pnum: u32,
    err: HdrError,
    kind: ReadKind,
    buf: &[u8],
) -> Result<HdrIo<H>, AttachError> {
    Ok(match err {
        HdrError::Magic => match kind {
            ReadKind::EccError => HdrIo::BadHdrEcc,
            _ if !buf.is_all_ff() => HdrIo::BadHdr,
            ReadKind::Bitflips => HdrIo::AllFfBitflips,
            ReadKind::Clean => HdrIo::AllFf,
        },
        HdrError::Crc => match kind {
            ReadKind::EccError => HdrIo::BadHdrEcc,
            _ => HdrIo::BadHdr,
        },
        HdrError::Version(version) => {
            return Err(FormatError::Version { pnum, version }.into());
        }
        HdrError::Field(field) => {
            return Err(FormatError::BadField { pnum, field }.into());
        }
    })
}

/// Sanity rules for a CRC-valid VID header.
///
/// A header that passes CRC but breaks these was not mangled by a power cut;
/// it is a format problem and fails the attach.
fn validate_vid_fields<M: Mtd>(mtd: &M, pnum: u32, vid: &Vid) -> Result<(), AttachError> {
    let bad = |field| Err(AttachError::Format(FormatError::BadField { pnum, field }));
    let leb_size = mtd.leb_size() as u32;

    match vid.compat {
        0 | UBI_COMPAT_DELETE | UBI_COMPAT_RO | UBI_COMPAT_PRESERVE | UBI_COMPAT_REJECT => {}
        _ => return bad("compat"),
    }

    if vid.vol_id < UBI_INTERNAL_VOL_START {
        if vid.vol_id >= UBI_MAX_VOLUMES {
            return bad("vol_id");
        }
        // Compatibility codes only mean something for internal volumes
        if vid.compat != 0 {
            return bad("compat");
        }
    }

    if vid.data_pad >= leb_size {
        return bad("data_pad");
    }
    if vid.data_size > leb_size - vid.data_pad {
        return bad("data_size");
    }

    match vid.vol_type {
        VolType::Static => {
            if vid.used_ebs == 0 {
                return bad("used_ebs");
            }
            if vid.lnum >= vid.used_ebs {
                return bad("lnum");
            }
            if vid.data_size == 0 {
                return bad("data_size");
            }
        }
        VolType::Dynamic => {
            if vid.used_ebs != 0 {
                return bad("used_ebs");
            }
            if !vid.copy_flag && vid.data_size != 0 {
                return bad("data_size");
            }
        }
    }

    Ok(())
}

/// Program an EC header into the first page of `pnum`
pub fn write_ec_hdr<M: Mtd>(mtd: &mut M, pnum: u32, ec: Ec) -> Result<(), AttachError> {
    let mut page = vec![0xFFu8; mtd.min_io_size()];
    let bytes = ec.encode();
    page[..bytes.len()].copy_from_slice(&bytes);
    mtd.write(&page, pnum, 0)?;
    Ok(())
}

/// Program a VID header into the second page of `pnum`
pub fn write_vid_hdr<M: Mtd>(mtd: &mut M, pnum: u32, vid: Vid) -> Result<(), AttachError> {
    let mut page = vec![0xFFu8; mtd.min_io_size()];
    let bytes = vid.encode();
    page[..bytes.len()].copy_from_slice(&bytes);
    mtd.write(&page, pnum, mtd.vid_hdr_offset())?;
    Ok(())
}

/// Read LEB data, starting `offset` bytes into the data area of `pnum`
pub fn read_data<M: Mtd>(
    mtd: &mut M,
    buf: &mut [u8],
    pnum: u32,
    offset: usize,
) -> Result<ReadKind, MtdError> {
    let data_offset = mtd.data_offset();
    mtd.read(buf, pnum, data_offset + offset)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mtd::sim::{SimLayout, SimMtd};

    const LAYOUT: SimLayout = SimLayout {
        peb_count: 4,
        pages_per_peb: 8,
        page_size: 128,
        oob_size: 64,
    };

    fn proto(mtd: &SimMtd) -> Ec {
        Ec {
            ec: 1,
            vid_hdr_offset: mtd.vid_hdr_offset() as u32,
            data_offset: mtd.data_offset() as u32,
            image_seq: 0x11223344,
        }
    }

    #[test]
    fn test_read_ec_outcomes() -> anyhow::Result<()> {
        let mut mtd = SimMtd::new(LAYOUT);
        let ec = proto(&mtd);

        // PEB 0 untouched, PEB 1 valid, PEB 2 garbage, PEB 3 valid-with-flips
        write_ec_hdr(&mut mtd, 1, ec)?;
        mtd.write(&[0xAB; 64], 2, 0)?;
        write_ec_hdr(&mut mtd, 3, ec)?;
        mtd.inject_read_fault(3, 0..64, ReadKind::Bitflips);

        assert_eq!(read_ec_hdr(&mut mtd, 0)?, HdrIo::AllFf);
        assert_eq!(read_ec_hdr(&mut mtd, 1)?, HdrIo::Ok(ec));
        assert_eq!(read_ec_hdr(&mut mtd, 2)?, HdrIo::BadHdr);
        assert_eq!(read_ec_hdr(&mut mtd, 3)?, HdrIo::Bitflips(ec));

        Ok(())
    }

    #[test]
    fn test_read_ec_ecc_damage() -> anyhow::Result<()> {
        let mut mtd = SimMtd::new(LAYOUT);

        mtd.write(&[0xAB; 64], 0, 0)?;
        mtd.inject_read_fault(0, 0..64, ReadKind::EccError);
        assert_eq!(read_ec_hdr(&mut mtd, 0)?, HdrIo::BadHdrEcc);

        // All-0xFF under bit-flips is still "probably erased"
        mtd.inject_read_fault(1, 0..64, ReadKind::Bitflips);
        assert_eq!(read_ec_hdr(&mut mtd, 1)?, HdrIo::AllFfBitflips);

        Ok(())
    }

    #[test]
    fn test_ec_validation_failures() -> anyhow::Result<()> {
        let mut mtd = SimMtd::new(LAYOUT);

        // Erase counter beyond the 31-bit cap
        let mut overflowed = proto(&mtd);
        overflowed.ec = UBI_MAX_ERASECOUNTER + 1;
        write_ec_hdr(&mut mtd, 0, overflowed)?;
        assert!(matches!(
            read_ec_hdr(&mut mtd, 0),
            Err(AttachError::Format(FormatError::EcOverflow { .. }))
        ));

        // Geometry disagreement
        let mut ec = proto(&mtd);
        ec.data_offset = 4096;
        write_ec_hdr(&mut mtd, 1, ec)?;
        assert!(matches!(
            read_ec_hdr(&mut mtd, 1),
            Err(AttachError::Format(FormatError::BadField {
                field: "data_offset",
                ..
            }))
        ));

        Ok(())
    }

    #[test]
    fn test_read_vid_outcomes() -> anyhow::Result<()> {
        let mut mtd = SimMtd::new(LAYOUT);
        let vid = Vid {
            vol_id: 2,
            lnum: 5,
            sqnum: 77,
            ..Default::default()
        };

        write_vid_hdr(&mut mtd, 0, vid)?;
        assert_eq!(read_vid_hdr(&mut mtd, 0)?, HdrIo::Ok(vid));
        assert_eq!(read_vid_hdr(&mut mtd, 1)?, HdrIo::AllFf);

        // A CRC-valid header with nonsense fields is a format error
        let bad = Vid {
            vol_id: 3,
            used_ebs: 9, // nonzero on a dynamic volume
            ..Default::default()
        };
        write_vid_hdr(&mut mtd, 2, bad)?;
        assert!(matches!(
            read_vid_hdr(&mut mtd, 2),
            Err(AttachError::Format(FormatError::BadField {
                field: "used_ebs",
                ..
            }))
        ));

        Ok(())
    }
}
