//! Post-scan verification that the snapshot is internally consistent and
//! still agrees with what is on flash.

use crate::mtd::Mtd;

use super::error::AttachError;
use super::headers::VolType;
use super::io::{self, HdrIo};
use super::snapshot::{AttachInfo, PebRecord};

fn fail(msg: String) -> Result<(), AttachError> {
    Err(AttachError::SelfCheck(msg))
}

/// Mark one PEB as referenced; a second reference is a broken snapshot
fn mark(seen: &mut [bool], pnum: u32) -> Result<(), AttachError> {
    match seen.get_mut(pnum as usize) {
        None => fail(format!("PEB {pnum} is out of range")),
        Some(true) => fail(format!("PEB {pnum} is referenced twice")),
        Some(slot) => {
            *slot = true;
            Ok(())
        }
    }
}

/// Walk the finished snapshot and verify its invariants: per-volume
/// bookkeeping, erase-counter bounds, field-by-field agreement between each
/// mapped PEB's record and its on-flash VID header, and exactly-once
/// ownership of every non-bad PEB.
pub fn self_check_ai<M: Mtd>(mtd: &mut M, ai: &AttachInfo) -> Result<(), AttachError> {
    if ai.vols_found as usize != ai.volumes.len() {
        return fail(format!(
            "vols_found is {} but {} volumes are recorded",
            ai.vols_found,
            ai.volumes.len()
        ));
    }

    for (&vol_id, av) in &ai.volumes {
        if av.vol_id != vol_id {
            return fail(format!("volume {vol_id} recorded under id {}", av.vol_id));
        }
        if av.leb_count as usize != av.lebs.len() {
            return fail(format!(
                "volume {vol_id}: leb_count {} but {} LEBs mapped",
                av.leb_count,
                av.lebs.len()
            ));
        }
        if let Some((&highest, _)) = av.lebs.iter().next_back() {
            if highest != av.highest_lnum {
                return fail(format!(
                    "volume {vol_id}: highest_lnum {} but LEB {highest} is mapped",
                    av.highest_lnum
                ));
            }
        }
        if av.last_data_size as usize > mtd.leb_size() {
            return fail(format!(
                "volume {vol_id}: last_data_size {} exceeds the {}-byte LEB",
                av.last_data_size,
                mtd.leb_size()
            ));
        }
        match av.vol_type {
            VolType::Static if av.used_ebs == 0 => {
                return fail(format!("static volume {vol_id} with zero used_ebs"));
            }
            VolType::Dynamic if av.used_ebs != 0 => {
                return fail(format!("dynamic volume {vol_id} with used_ebs {}", av.used_ebs));
            }
            _ => {}
        }

        for (&lnum, peb) in &av.lebs {
            if peb.vol_id != Some(vol_id) || peb.lnum != Some(lnum) {
                return fail(format!(
                    "volume {vol_id}, LEB {lnum}: PEB {} carries stale identity",
                    peb.pnum
                ));
            }
            if av.vol_type == VolType::Static && lnum >= av.used_ebs {
                return fail(format!(
                    "static volume {vol_id}: LEB {lnum} outside used_ebs {}",
                    av.used_ebs
                ));
            }
            if peb.sqnum > ai.max_sqnum {
                return fail(format!(
                    "PEB {}: sqnum {} above the recorded maximum {}",
                    peb.pnum, peb.sqnum, ai.max_sqnum
                ));
            }
            check_ec_bounds(mtd, ai, peb)?;

            let vid = match io::read_vid_hdr(mtd, peb.pnum)? {
                HdrIo::Ok(vid) | HdrIo::Bitflips(vid) => vid,
                other => {
                    return fail(format!(
                        "PEB {}: mapped VID header no longer reads back ({other:?})",
                        peb.pnum
                    ));
                }
            };
            if vid.vol_id != vol_id
                || vid.lnum != lnum
                || vid.sqnum != peb.sqnum
                || vid.copy_flag != peb.copy_flag
                || vid.vol_type != av.vol_type
                || vid.used_ebs != av.used_ebs
                || vid.data_pad != av.data_pad
            {
                return fail(format!(
                    "PEB {}: on-flash VID header disagrees with the snapshot",
                    peb.pnum
                ));
            }
            if lnum == av.highest_lnum && vid.data_size != av.last_data_size {
                return fail(format!(
                    "PEB {}: highest LEB's data_size {} disagrees with the recorded {}",
                    peb.pnum, vid.data_size, av.last_data_size
                ));
            }
        }
    }

    // Every non-bad PEB must be owned by exactly one container
    let mut seen = vec![false; mtd.peb_count() as usize];
    for av in ai.volumes.values() {
        for peb in av.lebs.values() {
            mark(&mut seen, peb.pnum)?;
        }
    }
    for queue in [&ai.free, &ai.erase, &ai.corrupt, &ai.alien, &ai.waiting] {
        for peb in queue {
            mark(&mut seen, peb.pnum)?;
        }
    }
    for (pnum, referenced) in seen.iter().enumerate() {
        if !referenced && !mtd.is_bad(pnum as u32)? {
            return fail(format!("PEB {pnum} is not referenced anywhere"));
        }
    }

    Ok(())
}

/// A mapped PEB's erase counter must sit inside its pool's observed range
fn check_ec_bounds<M: Mtd>(mtd: &M, ai: &AttachInfo, peb: &PebRecord) -> Result<(), AttachError> {
    let stats = ai.ec_stats(mtd.peb_class(peb.pnum));
    match peb.ec {
        None => fail(format!("PEB {}: erase counter still unknown", peb.pnum)),
        Some(ec) if ec < stats.min || ec > stats.max => fail(format!(
            "PEB {}: erase counter {ec} outside the pool range {}..={}",
            peb.pnum, stats.min, stats.max
        )),
        Some(_) => Ok(()),
    }
}

#[cfg(test)]
mod test {
    use super::super::scan::scan_all;
    use super::super::snapshot::Queue;
    use super::super::testutil::{new_mtd, program_peb, proto_ec, static_vid};
    use super::super::AttachConfig;
    use super::*;
    use crate::mtd::sim::SimMtd;

    fn scanned(mtd: &mut SimMtd) -> anyhow::Result<AttachInfo> {
        let cfg = AttachConfig::default();
        let mut ai = AttachInfo::new(&cfg);
        scan_all(mtd, &cfg, &mut ai, 0)?;
        Ok(ai)
    }

    fn volume_medium() -> anyhow::Result<SimMtd> {
        let mut mtd = new_mtd(8);
        let ec = proto_ec(&mtd);
        for lnum in 0..3u32 {
            let data = vec![0x11 * (lnum as u8 + 1); 64];
            let vid = static_vid(1, lnum, 3, u64::from(lnum) + 1, &data);
            program_peb(&mut mtd, lnum, ec, Some(vid), &data)?;
        }
        for pnum in 3..8 {
            program_peb(&mut mtd, pnum, ec, None, &[])?;
        }
        Ok(mtd)
    }

    #[test]
    fn test_clean_snapshot_passes() -> anyhow::Result<()> {
        let mut mtd = volume_medium()?;
        let ai = scanned(&mut mtd)?;
        self_check_ai(&mut mtd, &ai)?;
        Ok(())
    }

    #[test]
    fn test_detects_bad_leb_count() -> anyhow::Result<()> {
        let mut mtd = volume_medium()?;
        let mut ai = scanned(&mut mtd)?;

        ai.volumes.get_mut(&1).unwrap().leb_count += 1;
        assert!(matches!(
            self_check_ai(&mut mtd, &ai),
            Err(AttachError::SelfCheck(_))
        ));

        Ok(())
    }

    #[test]
    fn test_detects_last_data_size_drift() -> anyhow::Result<()> {
        let mut mtd = volume_medium()?;
        let mut ai = scanned(&mut mtd)?;

        ai.volumes.get_mut(&1).unwrap().last_data_size += 1;
        assert!(matches!(
            self_check_ai(&mut mtd, &ai),
            Err(AttachError::SelfCheck(_))
        ));

        let mut ai = scanned(&mut mtd)?;
        ai.volumes.get_mut(&1).unwrap().last_data_size = mtd.leb_size() as u32 + 1;
        assert!(matches!(
            self_check_ai(&mut mtd, &ai),
            Err(AttachError::SelfCheck(_))
        ));

        Ok(())
    }

    #[test]
    fn test_detects_double_reference() -> anyhow::Result<()> {
        let mut mtd = volume_medium()?;
        let mut ai = scanned(&mut mtd)?;

        let dup = ai.volumes[&1].lebs[&0].clone();
        ai.add_to_list(dup, false, Queue::Erase);
        assert!(matches!(
            self_check_ai(&mut mtd, &ai),
            Err(AttachError::SelfCheck(_))
        ));

        Ok(())
    }

    #[test]
    fn test_detects_lost_peb() -> anyhow::Result<()> {
        let mut mtd = volume_medium()?;
        let mut ai = scanned(&mut mtd)?;

        ai.free.pop_front();
        assert!(matches!(
            self_check_ai(&mut mtd, &ai),
            Err(AttachError::SelfCheck(_))
        ));

        Ok(())
    }

    #[test]
    fn test_ignores_bad_pebs() -> anyhow::Result<()> {
        let mut mtd = volume_medium()?;
        mtd.mark_bad(7);

        let ai = scanned(&mut mtd)?;
        assert_eq!(ai.bad_peb_count, 1);
        self_check_ai(&mut mtd, &ai)?;

        Ok(())
    }

    #[test]
    fn test_detects_rewritten_header() -> anyhow::Result<()> {
        let mut mtd = volume_medium()?;
        let ai = scanned(&mut mtd)?;

        // Clobber a mapped VID header behind the snapshot's back
        let pnum = ai.volumes[&1].lebs[&2].pnum;
        mtd.sync_erase(pnum)?;
        assert!(matches!(
            self_check_ai(&mut mtd, &ai),
            Err(AttachError::SelfCheck(_))
        ));

        Ok(())
    }
}
