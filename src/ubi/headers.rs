//! On-flash header codec: decoding and encoding the erase-counter and
//! volume-identifier headers every PEB carries.
//!
//! Both headers are fixed-size big-endian records sealed by a trailing
//! CRC-32. Decoding distinguishes a wrong magic from a failed CRC from an
//! unsupported format version, because the classifier reacts differently to
//! each: the first may still be an erased region, the second is damage a
//! power cut can explain, the third fails the whole attach.

use crc::{Crc, CRC_32_JAMCRC};
use deku::{DekuContainerRead, DekuContainerWrite};
use income::{EcHdr, VidHdr, UBI_EC_HDR_MAGIC, UBI_VID_HDR_MAGIC};
use thiserror::Error;

pub const UBI_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);

/// The on-flash format version this implementation understands
pub const UBI_VERSION: u8 = 1;

/// Size of an EC header on flash, in bytes
pub const UBI_EC_HDR_SIZE: usize = 64;

/// Size of a VID header on flash, in bytes
pub const UBI_VID_HDR_SIZE: usize = 64;

/// Why a header buffer failed to decode
#[derive(Debug, Error, Eq, PartialEq, Copy, Clone)]
pub enum HdrError {
    #[error("bad magic number")]
    Magic,

    #[error("header CRC mismatch")]
    Crc,

    #[error("unsupported on-flash format version {0}")]
    Version(u8),

    #[error("invalid {0} field")]
    Field(&'static str),
}

/// The seal of an on-flash record: CRC-32 over everything that precedes the
/// trailing 32-bit checksum field
pub(crate) fn seal_crc(bytes: &[u8]) -> u32 {
    UBI_CRC.checksum(&bytes[..bytes.len() - std::mem::size_of::<u32>()])
}

/// Serialize a raw on-flash record and stamp its trailing CRC field
pub(crate) fn seal<T: DekuContainerWrite>(raw: T) -> Vec<u8> {
    let mut bytes = raw.to_bytes().unwrap();
    let crc = seal_crc(&bytes).to_be_bytes();
    let at = bytes.len() - crc.len();
    bytes[at..].copy_from_slice(&crc);
    bytes
}

/// Decoded erase-counter header: per-PEB wear metadata plus the geometry
/// the medium was formatted with.
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Ec {
    /// Times the PEB has been erased. Stored in 64 bits on flash, but only
    /// values up to 2^31 - 1 are meaningful.
    pub ec: u64,

    /// Where the VID header sits within the PEB
    pub vid_hdr_offset: u32,

    /// Where the LEB data area starts within the PEB
    pub data_offset: u32,

    /// Per-medium stamp shared by every EC header, used to catch mixed
    /// images; zero on media formatted before stamping existed
    pub image_seq: u32,
}

impl Ec {
    /// Decode one EC header region, verifying magic, CRC, and version
    pub fn decode(bytes: &[u8]) -> Result<Self, HdrError> {
        let (_, raw) = EcHdr::from_bytes((bytes, 0)).map_err(|_| HdrError::Magic)?;

        if raw.magic[..] != *UBI_EC_HDR_MAGIC {
            return Err(HdrError::Magic);
        }
        if raw.hdr_crc != seal_crc(&bytes[..UBI_EC_HDR_SIZE]) {
            return Err(HdrError::Crc);
        }
        if raw.version != UBI_VERSION {
            return Err(HdrError::Version(raw.version));
        }

        Ok(Self {
            ec: raw.ec,
            vid_hdr_offset: raw.vid_hdr_offset,
            data_offset: raw.data_offset,
            image_seq: raw.image_seq,
        })
    }

    /// Serialize into the on-flash layout, seal included
    pub fn encode(self) -> Vec<u8> {
        seal(EcHdr {
            magic: UBI_EC_HDR_MAGIC.try_into().unwrap(),
            version: UBI_VERSION,
            ec: self.ec,
            vid_hdr_offset: self.vid_hdr_offset,
            data_offset: self.data_offset,
            image_seq: self.image_seq,
            hdr_crc: 0,
            padding1: Default::default(),
            padding2: Default::default(),
        })
    }
}

/// The two kinds of volume a LEB can belong to
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum VolType {
    /// LEBs are rewritten freely and carry no per-LEB data CRC
    #[default]
    Dynamic,

    /// The volume is written once, as a fixed number of CRC-protected LEBs
    Static,
}

impl VolType {
    /// Parse the wire encoding: 1 is dynamic, 2 is static
    fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Dynamic),
            2 => Some(Self::Static),
            _ => None,
        }
    }

    fn wire(self) -> u8 {
        match self {
            Self::Dynamic => 1,
            Self::Static => 2,
        }
    }
}

/// Decoded volume-identifier header: which LEB of which volume the PEB
/// holds, and enough to referee duplicate copies of that LEB.
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Vid {
    pub vol_type: VolType,

    /// The PEB was written as a mid-write copy of another PEB holding the
    /// same LEB; its data must pass the CRC check before the copy may win
    /// a conflict
    pub copy_flag: bool,

    /// Compatibility code (delete / read-only / preserve / reject) when
    /// the volume is internal; zero for user volumes
    pub compat: u8,

    /// Volume the LEB belongs to
    pub vol_id: u32,

    /// Which LEB of that volume this PEB holds
    pub lnum: u32,

    /// Bytes of the data area covered by `data_crc`: the payload length
    /// for static LEBs and mid-write copies, zero otherwise
    pub data_size: u32,

    /// Total LEBs of a static volume; zero for dynamic volumes
    pub used_ebs: u32,

    /// Bytes left unused at the end of the data area so LEBs stay a
    /// multiple of the volume's alignment
    pub data_pad: u32,

    /// CRC over the first `data_size` bytes of the data area
    pub data_crc: u32,

    /// Monotonic stamp assigned when the LEB was written; of two copies of
    /// one LEB, the one with the larger stamp is newer
    pub sqnum: u64,
}

impl Vid {
    /// Decode one VID header region, verifying magic, CRC, and version
    pub fn decode(bytes: &[u8]) -> Result<Self, HdrError> {
        let (_, raw) = VidHdr::from_bytes((bytes, 0)).map_err(|_| HdrError::Magic)?;

        if raw.magic[..] != *UBI_VID_HDR_MAGIC {
            return Err(HdrError::Magic);
        }
        if raw.hdr_crc != seal_crc(&bytes[..UBI_VID_HDR_SIZE]) {
            return Err(HdrError::Crc);
        }
        if raw.version != UBI_VERSION {
            return Err(HdrError::Version(raw.version));
        }

        let vol_type = VolType::from_wire(raw.vol_type).ok_or(HdrError::Field("vol_type"))?;

        Ok(Self {
            vol_type,
            copy_flag: raw.copy_flag != 0,
            compat: raw.compat,
            vol_id: raw.vol_id,
            lnum: raw.lnum,
            data_size: raw.data_size,
            used_ebs: raw.used_ebs,
            data_pad: raw.data_pad,
            data_crc: raw.data_crc,
            sqnum: raw.sqnum,
        })
    }

    /// Serialize into the on-flash layout, seal included
    pub fn encode(self) -> Vec<u8> {
        seal(VidHdr {
            magic: UBI_VID_HDR_MAGIC.try_into().unwrap(),
            version: UBI_VERSION,
            vol_type: self.vol_type.wire(),
            copy_flag: self.copy_flag.into(),
            compat: self.compat,
            vol_id: self.vol_id,
            lnum: self.lnum,
            data_size: self.data_size,
            used_ebs: self.used_ebs,
            data_pad: self.data_pad,
            data_crc: self.data_crc,
            sqnum: self.sqnum,
            hdr_crc: 0,
            padding1: Default::default(),
            padding2: Default::default(),
            padding3: Default::default(),
        })
    }
}
