//! Fast-attach dispatch: probe the front of the medium for a fastmap
//! anchor, hand control to the external fastmap reader, and fall back to
//! the full scan when that goes nowhere.

use thiserror::Error;

use crate::mtd::Mtd;

use super::error::AttachError;
use super::scan;
use super::snapshot::AttachInfo;
use super::{AttachConfig, UBI_FM_MAX_START, UBI_FM_SB_VOLUME_ID};

/// Why fast attach did not produce a snapshot
#[derive(Debug, Error)]
pub enum FastmapError {
    /// No usable fastmap on the medium; continue with the full scan
    #[error("no usable fastmap found")]
    NoFastmap,

    /// A fastmap exists but cannot be trusted; everything must be rescanned
    #[error("fastmap is invalid or fails its CRC")]
    BadFastmap,

    /// The attach itself failed; give up entirely
    #[error(transparent)]
    Attach(#[from] AttachError),
}

/// The external fast-attach reader.
///
/// Given the anchor PEB the probe located, the reader parses the on-flash
/// fastmap and populates `ai` with a complete snapshot. `NoFastmap` and
/// `BadFastmap` select the caller's fallback; any attach error aborts.
pub trait FastmapReader<M: Mtd> {
    fn scan_fastmap(
        &mut self,
        mtd: &mut M,
        ai: &mut AttachInfo,
        anchor: u32,
    ) -> Result<(), FastmapError>;
}

/// The highest-sqnum PEB of the fastmap super-block volume, if the probe
/// found one
fn find_fm_anchor(ai: &AttachInfo) -> Option<u32> {
    let av = ai.find_volume(UBI_FM_SB_VOLUME_ID)?;
    av.lebs
        .values()
        .max_by_key(|peb| peb.sqnum)
        .map(|peb| peb.pnum)
}

/// Probe the first PEBs of the medium for a fastmap anchor and run the
/// reader on it.
///
/// On success `ai` holds the reader's snapshot. On `NoFastmap` the probe
/// results stay in `ai`, so the caller can continue the full scan behind
/// the probed region.
pub(crate) fn scan_fast<M: Mtd>(
    mtd: &mut M,
    cfg: &AttachConfig,
    reader: &mut dyn FastmapReader<M>,
    ai: &mut AttachInfo,
) -> Result<(), FastmapError> {
    let end = UBI_FM_MAX_START.min(mtd.peb_count());
    let rpt = howudoin::new()
        .label("Probing for a fastmap")
        .set_len(u64::from(end));

    let mut databuf = vec![0u8; mtd.leb_size()];
    for pnum in 0..end {
        scan::scan_peb(mtd, cfg, ai, pnum, &mut databuf, &rpt)?;
        rpt.inc();
    }
    rpt.close();

    let anchor = find_fm_anchor(ai).ok_or(FastmapError::NoFastmap)?;

    let mut fm_ai = AttachInfo::new(cfg);
    reader.scan_fastmap(mtd, &mut fm_ai, anchor)?;
    *ai = fm_ai;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::super::headers::Vid;
    use super::super::testutil::{new_mtd, program_peb, proto_ec, static_vid};
    use super::super::{attach, AttachConfig};
    use super::*;
    use crate::mtd::sim::SimMtd;

    /// A scripted stand-in for the real fastmap reader
    struct StubReader {
        result: Result<(), &'static str>,
        calls: u32,
        seen_anchor: Option<u32>,
    }

    impl StubReader {
        fn new(result: Result<(), &'static str>) -> Self {
            Self {
                result,
                calls: 0,
                seen_anchor: None,
            }
        }
    }

    impl FastmapReader<SimMtd> for StubReader {
        fn scan_fastmap(
            &mut self,
            _mtd: &mut SimMtd,
            ai: &mut AttachInfo,
            anchor: u32,
        ) -> Result<(), FastmapError> {
            self.calls += 1;
            self.seen_anchor = Some(anchor);
            match self.result {
                Ok(()) => {
                    // A recognizable marker in place of a real snapshot
                    ai.highest_vol_id = 777;
                    Ok(())
                }
                Err("bad") => Err(FastmapError::BadFastmap),
                Err(_) => Err(FastmapError::NoFastmap),
            }
        }
    }

    fn fm_cfg() -> AttachConfig {
        AttachConfig {
            enable_fastmap: true,
            self_check: true,
            ..Default::default()
        }
    }

    /// 80 PEBs: a small static volume, a fastmap anchor inside the probe
    /// window, the rest formatted-but-empty
    fn fm_medium(with_anchor: bool) -> anyhow::Result<SimMtd> {
        let mut mtd = new_mtd(80);
        let ec = proto_ec(&mtd);

        for lnum in 0..4u32 {
            let data = vec![0x42 + lnum as u8; 96];
            let vid = static_vid(1, lnum, 4, 10 + u64::from(lnum), &data);
            program_peb(&mut mtd, 70 + lnum, ec, Some(vid), &data)?;
        }

        let mut formatted: Vec<u32> = (0..70).collect();
        formatted.extend(74..80);
        for pnum in formatted {
            if with_anchor && pnum == 5 {
                let anchor_vid = Vid {
                    vol_id: UBI_FM_SB_VOLUME_ID,
                    lnum: 0,
                    sqnum: 99,
                    ..Default::default()
                };
                program_peb(&mut mtd, pnum, ec, Some(anchor_vid), &[])?;
            } else {
                program_peb(&mut mtd, pnum, ec, None, &[])?;
            }
        }

        Ok(mtd)
    }

    #[test]
    fn test_fastmap_reader_runs_on_anchor() -> anyhow::Result<()> {
        let mut mtd = fm_medium(true)?;
        let mut reader = StubReader::new(Ok(()));

        let cfg = AttachConfig {
            self_check: false,
            ..fm_cfg()
        };
        let ai = attach(&mut mtd, &cfg, Some(&mut reader), false)?;

        assert_eq!(reader.calls, 1);
        assert_eq!(reader.seen_anchor, Some(5));
        assert_eq!(ai.highest_vol_id, 777);

        Ok(())
    }

    #[test]
    fn test_bad_fastmap_falls_back_to_full_scan() -> anyhow::Result<()> {
        let mut mtd = fm_medium(true)?;
        let mut reader = StubReader::new(Err("bad"));
        let from_fallback = attach(&mut mtd, &fm_cfg(), Some(&mut reader), false)?;

        assert_eq!(reader.calls, 1);

        let forced = attach(&mut mtd, &fm_cfg(), None, true)?;
        assert_eq!(from_fallback, forced);

        Ok(())
    }

    #[test]
    fn test_missing_anchor_continues_behind_probe() -> anyhow::Result<()> {
        let mut mtd = fm_medium(false)?;
        let mut reader = StubReader::new(Ok(()));
        let continued = attach(&mut mtd, &fm_cfg(), Some(&mut reader), false)?;

        // The reader never ran; the probe snapshot was completed in place
        assert_eq!(reader.calls, 0);

        let forced = attach(&mut mtd, &fm_cfg(), None, true)?;
        assert_eq!(continued, forced);

        Ok(())
    }

    #[test]
    fn test_small_medium_skips_fastmap() -> anyhow::Result<()> {
        let mut mtd = new_mtd(16);
        let ec = proto_ec(&mtd);
        for pnum in 0..16 {
            program_peb(&mut mtd, pnum, ec, None, &[])?;
        }

        let mut reader = StubReader::new(Ok(()));
        let ai = attach(&mut mtd, &fm_cfg(), Some(&mut reader), false)?;

        assert_eq!(reader.calls, 0);
        assert_eq!(ai.free.len(), 16);

        Ok(())
    }

    #[test]
    fn test_force_scan_ignores_fastmap() -> anyhow::Result<()> {
        let mut mtd = fm_medium(true)?;
        let mut reader = StubReader::new(Ok(()));
        let ai = attach(&mut mtd, &fm_cfg(), Some(&mut reader), true)?;

        assert_eq!(reader.calls, 0);
        assert_eq!(ai.vols_found, 2); // the user volume and the anchor volume
        assert_ne!(ai.highest_vol_id, 777);

        Ok(())
    }
}
