//! Abstractions for the raw flash device underneath the attach logic.

use thiserror::Error;

pub mod sim;

/// Convenience methods for operating on `[u8]`s that represent flash contents
pub trait PatternExt {
    /// Does this buffer contain only the all-1s (erased) bit pattern?
    fn is_all_ff(&self) -> bool;
}

impl PatternExt for [u8] {
    fn is_all_ff(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// How a read completed, short of a hard failure.
///
/// Ordered by severity, so overlapping outcomes can be merged with `max`.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Copy, Clone)]
pub enum ReadKind {
    /// Data returned with no complaints from the medium
    Clean,

    /// Data returned, but ECC corrected bit-flips; the area should be scrubbed
    Bitflips,

    /// ECC could not correct every error; the buffer holds best-effort data
    EccError,
}

impl ReadKind {
    pub fn is_clean(self) -> bool {
        self == ReadKind::Clean
    }
}

/// Cell class of a PEB, for media that mix SLC and TLC regions
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum PebClass {
    Slc,
    Tlc,
}

/// Hard faults reported by the device
#[derive(Debug, Error)]
pub enum MtdError {
    #[error("PEB {pnum} out of range (device has {count})")]
    OutOfRange { pnum: u32, count: u32 },

    #[error("access beyond PEB {pnum} bounds ({offset}+{len} > {size})")]
    OutOfBounds {
        pnum: u32,
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("read of PEB {pnum} failed")]
    Read { pnum: u32 },

    #[error("write to PEB {pnum} failed")]
    Write { pnum: u32 },

    #[error("erase of PEB {pnum} failed")]
    Erase { pnum: u32 },

    #[error("write to PEB {pnum}:{offset} overlaps already-programmed area")]
    Reprogram { pnum: u32, offset: usize },

    #[error("I/O error on PEB {pnum}")]
    Io {
        pnum: u32,
        #[source]
        source: std::io::Error,
    },
}

/// Represents the flash device the attach code drives.
///
/// Geometry is fixed for the life of the device. `read` distinguishes
/// corrected bit-flips and uncorrectable ECC damage from hard faults, the
/// way MTD drivers report them; both still fill the caller's buffer.
pub trait Mtd {
    /// Number of physical eraseblocks
    fn peb_count(&self) -> u32;

    /// Bytes per physical eraseblock
    fn peb_size(&self) -> usize;

    /// Smallest programmable unit (the page size)
    fn min_io_size(&self) -> usize;

    /// Bytes of out-of-band (spare) area per page
    fn oob_size(&self) -> usize;

    /// Byte offset of the VID header within a PEB
    fn vid_hdr_offset(&self) -> usize {
        self.min_io_size()
    }

    /// Byte offset of the data area within a PEB
    fn data_offset(&self) -> usize {
        2 * self.min_io_size()
    }

    /// Bytes of LEB data a PEB can hold
    fn leb_size(&self) -> usize {
        self.peb_size() - self.data_offset()
    }

    /// Pages per PEB
    fn pages_per_peb(&self) -> u32 {
        (self.peb_size() / self.min_io_size()) as u32
    }

    /// Read `buf.len()` bytes from `pnum` starting at byte `offset`
    fn read(&mut self, buf: &mut [u8], pnum: u32, offset: usize) -> Result<ReadKind, MtdError>;

    /// Program `buf` into `pnum` at byte `offset`.
    ///
    /// Flash only permits in-order programming within an eraseblock; writing
    /// at or before an already-programmed offset is an error until the block
    /// is erased.
    fn write(&mut self, buf: &[u8], pnum: u32, offset: usize) -> Result<(), MtdError>;

    /// Erase a PEB and wait for the erase to complete
    fn sync_erase(&mut self, pnum: u32) -> Result<(), MtdError>;

    /// Is this PEB marked bad?
    fn is_bad(&self, pnum: u32) -> Result<bool, MtdError>;

    /// Read the spare area of one page
    fn read_oob(&mut self, buf: &mut [u8], pnum: u32, page: u32) -> Result<ReadKind, MtdError>;

    /// Is this page, data and spare area both, still in the erased state?
    fn page_is_empty(&mut self, pnum: u32, page: u32) -> Result<bool, MtdError> {
        let mut data = vec![0; self.min_io_size()];
        self.read(&mut data, pnum, page as usize * self.min_io_size())?;
        if !data.is_all_ff() {
            return Ok(false);
        }

        let mut oob = vec![0; self.oob_size()];
        self.read_oob(&mut oob, pnum, page)?;
        Ok(oob.is_all_ff())
    }

    /// Which cell class does this PEB live in?
    fn peb_class(&self, _pnum: u32) -> PebClass {
        PebClass::Slc
    }

    /// The high page paired with `page`, on media that pair pages
    fn paired_page(&self, _page: u32) -> Option<u32> {
        None
    }
}

#[test]
fn test_is_all_ff() {
    assert!([0xFFu8; 8].is_all_ff());
    assert!(![0xFFu8, 0xFF, 0x7F].is_all_ff());
    assert!([0u8; 0].is_all_ff());
}
