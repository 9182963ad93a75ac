//! A simulated in-memory flash device, for testing purposes

use std::collections::HashMap;
use std::ops::Range;

use super::{Mtd, MtdError, PatternExt, PebClass, ReadKind};

/// A pub-fields struct describing the data layout of a simulated device
#[derive(Debug, Copy, Clone)]
pub struct SimLayout {
    pub peb_count: u32,
    pub pages_per_peb: u32,
    pub page_size: usize,
    pub oob_size: usize,
}

/// An in-memory flash device with injectable read/write/erase faults
#[derive(Debug, Clone)]
pub struct SimMtd {
    pebs: Vec<SimPeb>,
    layout: SimLayout,

    /// PEBs at or past this index count as TLC
    tlc_from: Option<u32>,

    /// Distance between a low page and its paired high page
    pair_distance: Option<u32>,
}

/// One simulated eraseblock
#[derive(Debug, Clone, Default)]
struct SimPeb {
    /// All bytes programmed so far; flash semantics only allow appending
    data: Vec<u8>,

    /// Spare areas programmed so far, by page
    oob: HashMap<u32, Vec<u8>>,

    /// Is this block marked bad?
    bad: bool,

    /// Byte ranges whose reads report a degraded outcome
    read_faults: Vec<(Range<usize>, ReadKind)>,

    fail_reads: bool,
    fail_writes: bool,
    fail_erases: bool,
}

impl SimMtd {
    /// Create an erased device with the specified layout
    pub fn new(layout: SimLayout) -> Self {
        let pebs = vec![SimPeb::default(); layout.peb_count as usize];

        Self {
            pebs,
            layout,
            tlc_from: None,
            pair_distance: None,
        }
    }

    fn peb(&self, pnum: u32) -> Result<&SimPeb, MtdError> {
        self.pebs.get(pnum as usize).ok_or(MtdError::OutOfRange {
            pnum,
            count: self.layout.peb_count,
        })
    }

    fn peb_mut(&mut self, pnum: u32) -> Result<&mut SimPeb, MtdError> {
        let count = self.layout.peb_count;
        self.pebs
            .get_mut(pnum as usize)
            .ok_or(MtdError::OutOfRange { pnum, count })
    }

    fn check_bounds(&self, pnum: u32, offset: usize, len: usize) -> Result<(), MtdError> {
        let size = self.layout.pages_per_peb as usize * self.layout.page_size;
        if offset + len > size {
            return Err(MtdError::OutOfBounds {
                pnum,
                offset,
                len,
                size,
            });
        }
        Ok(())
    }

    /// Mark a PEB bad, as the factory or a failed erase would
    pub fn mark_bad(&mut self, pnum: u32) {
        self.pebs[pnum as usize].bad = true;
    }

    /// Make all PEBs at or past `pnum` report as TLC
    pub fn set_tlc_from(&mut self, pnum: u32) {
        self.tlc_from = Some(pnum);
    }

    /// Pair each page `p` with high page `p + pages` where both exist
    pub fn set_pair_distance(&mut self, pages: u32) {
        self.pair_distance = Some(pages);
    }

    /// Make reads covering `range` of `pnum` report `kind`
    pub fn inject_read_fault(&mut self, pnum: u32, range: Range<usize>, kind: ReadKind) {
        self.pebs[pnum as usize].read_faults.push((range, kind));
    }

    /// Make every read of `pnum` fail hard
    pub fn fail_reads(&mut self, pnum: u32) {
        self.pebs[pnum as usize].fail_reads = true;
    }

    /// Make every write to `pnum` fail
    pub fn fail_writes(&mut self, pnum: u32) {
        self.pebs[pnum as usize].fail_writes = true;
    }

    /// Make every erase of `pnum` fail
    pub fn fail_erases(&mut self, pnum: u32) {
        self.pebs[pnum as usize].fail_erases = true;
    }

    /// Program the spare area of one page.
    ///
    /// Real devices program OOB alongside the page data; the simulator keeps
    /// it a separate call so tests can build arbitrary layouts.
    pub fn program_oob(&mut self, pnum: u32, page: u32, bytes: &[u8]) {
        assert!(page < self.layout.pages_per_peb);
        assert!(bytes.len() <= self.layout.oob_size);

        let mut oob = vec![0xFFu8; self.layout.oob_size];
        oob[..bytes.len()].copy_from_slice(bytes);
        self.pebs[pnum as usize].oob.insert(page, oob);
    }
}

impl Mtd for SimMtd {
    fn peb_count(&self) -> u32 {
        self.layout.peb_count
    }

    fn peb_size(&self) -> usize {
        self.layout.pages_per_peb as usize * self.layout.page_size
    }

    fn min_io_size(&self) -> usize {
        self.layout.page_size
    }

    fn oob_size(&self) -> usize {
        self.layout.oob_size
    }

    fn read(&mut self, buf: &mut [u8], pnum: u32, offset: usize) -> Result<ReadKind, MtdError> {
        self.check_bounds(pnum, offset, buf.len())?;
        let peb = self.peb(pnum)?;

        if peb.fail_reads {
            return Err(MtdError::Read { pnum });
        }

        // Unprogrammed bytes read back as 0xFF
        for (i, b) in buf.iter_mut().enumerate() {
            *b = peb.data.get(offset + i).copied().unwrap_or(0xFF);
        }

        let span = offset..offset + buf.len();
        let mut kind = ReadKind::Clean;
        for (range, k) in &peb.read_faults {
            if range.start < span.end && span.start < range.end {
                kind = kind.max(*k);
            }
        }

        Ok(kind)
    }

    fn write(&mut self, buf: &[u8], pnum: u32, offset: usize) -> Result<(), MtdError> {
        self.check_bounds(pnum, offset, buf.len())?;
        let peb = self.peb_mut(pnum)?;

        if peb.fail_writes {
            return Err(MtdError::Write { pnum });
        }
        if offset < peb.data.len() {
            return Err(MtdError::Reprogram { pnum, offset });
        }

        // Writing fully-erased content is a no-op.
        if !buf.is_all_ff() {
            peb.data.resize(offset, 0xFF);
            peb.data.extend_from_slice(buf);
        }

        Ok(())
    }

    fn sync_erase(&mut self, pnum: u32) -> Result<(), MtdError> {
        let peb = self.peb_mut(pnum)?;

        if peb.fail_erases {
            return Err(MtdError::Erase { pnum });
        }

        peb.data.clear();
        peb.oob.clear();
        peb.read_faults.clear();
        Ok(())
    }

    fn is_bad(&self, pnum: u32) -> Result<bool, MtdError> {
        Ok(self.peb(pnum)?.bad)
    }

    fn read_oob(&mut self, buf: &mut [u8], pnum: u32, page: u32) -> Result<ReadKind, MtdError> {
        if page >= self.layout.pages_per_peb {
            return Err(MtdError::OutOfBounds {
                pnum,
                offset: page as usize * self.layout.page_size,
                len: buf.len(),
                size: self.peb_size(),
            });
        }

        let peb = self.peb(pnum)?;
        if peb.fail_reads {
            return Err(MtdError::Read { pnum });
        }

        match peb.oob.get(&page) {
            Some(oob) => {
                let len = buf.len().min(oob.len());
                buf[..len].copy_from_slice(&oob[..len]);
                buf[len..].fill(0xFF);
            }
            None => buf.fill(0xFF),
        }

        Ok(ReadKind::Clean)
    }

    fn peb_class(&self, pnum: u32) -> PebClass {
        match self.tlc_from {
            Some(start) if pnum >= start => PebClass::Tlc,
            _ => PebClass::Slc,
        }
    }

    fn paired_page(&self, page: u32) -> Option<u32> {
        let distance = self.pair_distance?;
        let high = page + distance;
        (high < self.layout.pages_per_peb).then_some(high)
    }
}

#[cfg(test)]
pub(crate) const TEST_LAYOUT: SimLayout = SimLayout {
    peb_count: 16,
    pages_per_peb: 16,
    page_size: 128,
    oob_size: 64,
};

#[test]
fn test_sim_read_erased() -> anyhow::Result<()> {
    let mut mtd = SimMtd::new(TEST_LAYOUT);

    let mut buf = vec![0u8; mtd.min_io_size()];
    assert_eq!(mtd.read(&mut buf, 3, 256)?, ReadKind::Clean);
    assert!(buf.is_all_ff());
    assert!(mtd.page_is_empty(3, 2)?);

    Ok(())
}

#[test]
fn test_sim_sequential_program() -> anyhow::Result<()> {
    let mut mtd = SimMtd::new(TEST_LAYOUT);
    let page = vec![0xA5u8; mtd.min_io_size()];

    mtd.write(&page, 0, 256)?;
    assert!(matches!(
        mtd.write(&page, 0, 128),
        Err(MtdError::Reprogram { .. })
    ));

    let mut buf = vec![0u8; mtd.min_io_size()];
    mtd.read(&mut buf, 0, 128)?;
    assert!(buf.is_all_ff());
    mtd.read(&mut buf, 0, 256)?;
    assert_eq!(buf, page);

    mtd.sync_erase(0)?;
    mtd.write(&page, 0, 128)?;

    Ok(())
}

#[test]
fn test_sim_fault_injection() -> anyhow::Result<()> {
    let mut mtd = SimMtd::new(TEST_LAYOUT);
    mtd.inject_read_fault(1, 0..64, ReadKind::Bitflips);
    mtd.inject_read_fault(1, 128..256, ReadKind::EccError);

    let mut buf = vec![0u8; 64];
    assert_eq!(mtd.read(&mut buf, 1, 0)?, ReadKind::Bitflips);
    assert_eq!(mtd.read(&mut buf, 1, 64)?, ReadKind::Clean);
    assert_eq!(mtd.read(&mut buf, 1, 192)?, ReadKind::EccError);

    let mut whole = vec![0u8; mtd.peb_size()];
    assert_eq!(mtd.read(&mut whole, 1, 0)?, ReadKind::EccError);

    mtd.fail_reads(2);
    assert!(mtd.read(&mut buf, 2, 0).is_err());

    Ok(())
}

#[test]
fn test_sim_classes_and_pairing() {
    let mut mtd = SimMtd::new(TEST_LAYOUT);
    mtd.set_tlc_from(8);
    mtd.set_pair_distance(8);

    assert_eq!(mtd.peb_class(0), PebClass::Slc);
    assert_eq!(mtd.peb_class(8), PebClass::Tlc);
    assert_eq!(mtd.paired_page(2), Some(10));
    assert_eq!(mtd.paired_page(8), None);
}
