//! The attach snapshot: everything the scan learns about PEBs and volumes,
//! plus the reconciliation of duplicate LEB copies.
//!
//! A PEB record is owned by exactly one container at any time: a volume's
//! LEB map or one of the work queues. Records move between containers by
//! value, so single ownership is enforced by the compiler and verified again
//! by the post-scan self-check.

use std::collections::{BTreeMap, VecDeque};

use crate::mtd::{Mtd, PebClass};

use super::error::{AttachError, FormatError};
use super::headers::{Vid, VolType, UBI_CRC};
use super::io::{self, HdrIo};
use super::{AttachConfig, UBI_MAX_ERASECOUNTER};

/// Everything the scan learned about one physical eraseblock
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PebRecord {
    pub pnum: u32,

    /// Erase counter; `None` until known (back-filled with the pool mean)
    pub ec: Option<u64>,

    /// Volume this PEB last belonged to, when known
    pub vol_id: Option<u32>,

    /// LEB this PEB last held, when known
    pub lnum: Option<u32>,

    /// Sequence number from the VID header, 0 when none was readable
    pub sqnum: u64,

    pub copy_flag: bool,

    /// Correctable read problems were seen; the wear-leveler should scrub
    pub scrub: bool,
}

impl PebRecord {
    /// A record for a PEB whose headers taught us nothing
    pub fn unknown(pnum: u32) -> Self {
        Self {
            pnum,
            ec: None,
            vol_id: None,
            lnum: None,
            sqnum: 0,
            copy_flag: false,
            scrub: false,
        }
    }

    /// A record for a PEB holding a valid LEB copy
    pub fn mapped(pnum: u32, ec: Option<u64>, vid: &Vid, scrub: bool) -> Self {
        Self {
            pnum,
            ec,
            vol_id: Some(vid.vol_id),
            lnum: Some(vid.lnum),
            sqnum: vid.sqnum,
            copy_flag: vid.copy_flag,
            scrub,
        }
    }
}

/// Everything the scan learned about one volume
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct VolumeRecord {
    pub vol_id: u32,
    pub vol_type: VolType,
    pub compat: u8,
    pub data_pad: u32,

    /// LEBs this volume claims to use; 0 for dynamic volumes
    pub used_ebs: u32,

    /// Highest LEB number seen so far
    pub highest_lnum: u32,

    /// `data_size` of the VID header holding the highest LEB
    pub last_data_size: u32,

    /// Number of mapped LEBs; always equals `lebs.len()`
    pub leb_count: u32,

    /// LEB number → the PEB currently believed to hold it
    pub lebs: BTreeMap<u32, PebRecord>,
}

impl VolumeRecord {
    fn new(vol_id: u32, vid: &Vid) -> Self {
        Self {
            vol_id,
            vol_type: vid.vol_type,
            compat: vid.compat,
            data_pad: vid.data_pad,
            used_ebs: vid.used_ebs,
            highest_lnum: 0,
            last_data_size: 0,
            leb_count: 0,
            lebs: BTreeMap::new(),
        }
    }
}

/// Which work queue a PEB should land on
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Queue {
    Free,
    Erase,
    Alien,
    Waiting,
}

/// Erase-counter statistics for one cell class
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct EcStats {
    pub sum: u64,
    pub count: u64,
    pub min: u64,
    pub max: u64,
    pub mean: u64,
}

impl Default for EcStats {
    fn default() -> Self {
        Self {
            sum: 0,
            count: 0,
            min: UBI_MAX_ERASECOUNTER,
            max: 0,
            mean: 0,
        }
    }
}

impl EcStats {
    fn record(&mut self, ec: u64) {
        self.sum += ec;
        self.count += 1;
        self.min = self.min.min(ec);
        self.max = self.max.max(ec);
    }

    fn finalize(&mut self) {
        if self.count > 0 {
            self.mean = self.sum / self.count;
        } else {
            self.min = 0;
        }
    }
}

/// The result of reconciling two copies of one LEB
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct CompareOutcome {
    /// The newly scanned PEB holds the newer copy
    pub second_is_newer: bool,

    /// The surviving copy read back with bit-flips and should be scrubbed
    pub bitflips: bool,

    /// The losing copy is corrupted and should be erased first
    pub corrupted: bool,
}

/// The attach snapshot handed to the wear-leveler and the LEB mapper
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AttachInfo {
    /// Volume id → volume record, ordered for deterministic iteration
    pub volumes: BTreeMap<u32, VolumeRecord>,

    /// PEBs that hold no data but carry a good EC header
    pub free: VecDeque<PebRecord>,

    /// PEBs that must be erased before reuse; corrupt-origin entries sit at
    /// the head so they are wiped first
    pub erase: VecDeque<PebRecord>,

    /// PEBs with unexplained corruption, preserved for inspection
    pub corrupt: VecDeque<PebRecord>,

    /// PEBs of preserved-but-unrecognized internal volumes
    pub alien: VecDeque<PebRecord>,

    /// PEBs replaced by the low-page recovery pass, kept until downstream
    /// commits the rebuilt copies
    pub waiting: VecDeque<PebRecord>,

    pub bad_peb_count: u32,
    pub good_peb_count: u32,
    pub empty_peb_count: u32,
    pub alien_peb_count: u32,
    pub corr_peb_count: u32,
    pub maybe_bad_peb_count: u32,

    pub vols_found: u32,
    pub highest_vol_id: u32,

    /// Highest sequence number seen anywhere; monotonic during the attach
    pub max_sqnum: u64,

    /// Image stamp shared by every EC header (zero-stamped legacy headers
    /// are always accepted)
    pub image_seq: u32,

    /// The medium held no data at all
    pub is_empty: bool,

    /// Something forced a degraded, read-only attach
    pub ro_mode: bool,

    /// Erase-counter statistics (the SLC pool, or everything when not split)
    pub ec: EcStats,

    /// Separate TLC pool, present when TLC tracking is enabled
    pub tlc_ec: Option<EcStats>,
}

impl AttachInfo {
    pub fn new(cfg: &AttachConfig) -> Self {
        Self {
            volumes: BTreeMap::new(),
            free: VecDeque::new(),
            erase: VecDeque::new(),
            corrupt: VecDeque::new(),
            alien: VecDeque::new(),
            waiting: VecDeque::new(),
            bad_peb_count: 0,
            good_peb_count: 0,
            empty_peb_count: 0,
            alien_peb_count: 0,
            corr_peb_count: 0,
            maybe_bad_peb_count: 0,
            vols_found: 0,
            highest_vol_id: 0,
            max_sqnum: 0,
            image_seq: 0,
            is_empty: false,
            ro_mode: false,
            ec: EcStats::default(),
            tlc_ec: cfg.enable_tlc_tracking.then(EcStats::default),
        }
    }

    /// The statistics pool covering `class`
    pub fn ec_stats(&self, class: PebClass) -> &EcStats {
        match (&self.tlc_ec, class) {
            (Some(tlc), PebClass::Tlc) => tlc,
            _ => &self.ec,
        }
    }

    fn ec_stats_mut(&mut self, class: PebClass) -> &mut EcStats {
        match (&mut self.tlc_ec, class) {
            (Some(tlc), PebClass::Tlc) => tlc,
            _ => &mut self.ec,
        }
    }

    /// Fold one known erase counter into the right pool
    pub(crate) fn note_ec(&mut self, class: PebClass, ec: Option<u64>) {
        if let Some(ec) = ec {
            self.ec_stats_mut(class).record(ec);
        }
    }

    /// Compute the per-pool means once the scan has seen every PEB
    pub(crate) fn finalize_ec(&mut self) {
        self.ec.finalize();
        if let Some(tlc) = &mut self.tlc_ec {
            tlc.finalize();
        }
    }

    /// Substitute the pool mean for every still-unknown erase counter
    pub(crate) fn backfill_ec<M: Mtd>(&mut self, mtd: &M) {
        let slc_mean = self.ec.mean;
        let tlc_mean = self.tlc_ec.as_ref().map_or(slc_mean, |t| t.mean);
        let mean_for = |pnum: u32| match mtd.peb_class(pnum) {
            PebClass::Tlc => tlc_mean,
            PebClass::Slc => slc_mean,
        };

        for av in self.volumes.values_mut() {
            for peb in av.lebs.values_mut() {
                peb.ec.get_or_insert_with(|| mean_for(peb.pnum));
            }
        }
        for queue in [
            &mut self.free,
            &mut self.erase,
            &mut self.corrupt,
            &mut self.alien,
            &mut self.waiting,
        ] {
            for peb in queue.iter_mut() {
                peb.ec.get_or_insert_with(|| mean_for(peb.pnum));
            }
        }
    }

    /// Create the volume record for `vol_id` if this is its first PEB;
    /// return the record either way
    pub fn add_volume(&mut self, vol_id: u32, vid: &Vid) -> &mut VolumeRecord {
        self.highest_vol_id = self.highest_vol_id.max(vol_id);

        let vols_found = &mut self.vols_found;
        self.volumes.entry(vol_id).or_insert_with(|| {
            *vols_found += 1;
            VolumeRecord::new(vol_id, vid)
        })
    }

    pub fn find_volume(&self, vol_id: u32) -> Option<&VolumeRecord> {
        self.volumes.get(&vol_id)
    }

    /// Detach a volume; all of its PEBs queue for erasure
    pub fn remove_volume(&mut self, vol_id: u32) {
        if let Some(av) = self.volumes.remove(&vol_id) {
            self.vols_found -= 1;
            for (_, peb) in av.lebs {
                self.erase.push_back(peb);
            }
        }
    }

    /// Push a PEB onto one of the work queues
    pub fn add_to_list(&mut self, peb: PebRecord, to_head: bool, queue: Queue) {
        let list = match queue {
            Queue::Free => &mut self.free,
            Queue::Erase => &mut self.erase,
            Queue::Alien => &mut self.alien,
            Queue::Waiting => &mut self.waiting,
        };

        if to_head {
            list.push_front(peb);
        } else {
            list.push_back(peb);
        }
    }

    /// Preserve an unexplainably corrupted PEB
    pub fn add_corrupt(&mut self, peb: PebRecord) {
        self.corr_peb_count += 1;
        self.corrupt.push_back(peb);
    }

    /// Insert a used PEB into its volume's LEB map.
    ///
    /// An empty target slot takes the PEB after validation against the
    /// volume's accumulated invariants. An occupied slot triggers the
    /// reconciler: the loser queues for erasure (at the head when it is
    /// corrupt), the winner keeps the slot.
    pub fn add_to_av<M: Mtd>(
        &mut self,
        mtd: &mut M,
        databuf: &mut [u8],
        pnum: u32,
        ec: Option<u64>,
        vid: &Vid,
        bitflips: bool,
    ) -> Result<(), AttachError> {
        let (vol_id, lnum, sqnum) = (vid.vol_id, vid.lnum, vid.sqnum);

        self.max_sqnum = self.max_sqnum.max(sqnum);
        self.add_volume(vol_id, vid);

        let existing = self.volumes[&vol_id].lebs.get(&lnum).cloned();
        let Some(old) = existing else {
            let av = &self.volumes[&vol_id];
            validate_vid_hdr(vid, av, pnum)?;

            let av = self.volumes.get_mut(&vol_id).unwrap();
            av.lebs.insert(lnum, PebRecord::mapped(pnum, ec, vid, bitflips));
            av.leb_count += 1;
            if lnum >= av.highest_lnum {
                av.highest_lnum = lnum;
                av.last_data_size = vid.data_size;
            }
            return Ok(());
        };

        // Two PEBs claim this LEB; only unwritten legacy images may share a
        // (zero) sequence number.
        if old.sqnum == sqnum && sqnum != 0 {
            return Err(FormatError::DuplicateSqnum {
                vol_id,
                lnum,
                sqnum,
            }
            .into());
        }

        let cmp = compare_lebs(mtd, databuf, &old, pnum, vid)?;

        if cmp.second_is_newer {
            validate_vid_hdr(vid, &self.volumes[&vol_id], pnum)?;

            let av = self.volumes.get_mut(&vol_id).unwrap();
            let newer = PebRecord::mapped(pnum, ec, vid, cmp.bitflips || bitflips);
            let old = av.lebs.insert(lnum, newer).unwrap();
            if av.highest_lnum == lnum {
                av.last_data_size = vid.data_size;
            }
            self.add_to_list(old, cmp.corrupted, Queue::Erase);
        } else {
            let loser = PebRecord::mapped(pnum, ec, vid, bitflips);
            self.add_to_list(loser, cmp.corrupted, Queue::Erase);
        }

        Ok(())
    }
}

/// For any non-first LEB of a volume, the VID header must agree with what
/// the volume's earlier LEBs established.
pub fn validate_vid_hdr(vid: &Vid, av: &VolumeRecord, pnum: u32) -> Result<(), FormatError> {
    if av.leb_count == 0 {
        return Ok(());
    }

    if vid.vol_id != av.vol_id
        || vid.vol_type != av.vol_type
        || vid.used_ebs != av.used_ebs
        || vid.data_pad != av.data_pad
    {
        return Err(FormatError::VidMismatch {
            pnum,
            vol_id: av.vol_id,
        });
    }

    Ok(())
}

/// Decide which of two PEBs carrying the same `vol_id:lnum` is current.
///
/// The larger sequence number nominates the newer copy. A set copy-flag
/// means the nominee was written as a (possibly interrupted) copy, so its
/// data CRC must verify before it may win; a failed CRC hands the win to
/// the other copy and marks the nominee corrupted.
pub fn compare_lebs<M: Mtd>(
    mtd: &mut M,
    databuf: &mut [u8],
    old: &PebRecord,
    pnum: u32,
    vid: &Vid,
) -> Result<CompareOutcome, AttachError> {
    let second_is_newer = vid.sqnum > old.sqnum;

    let (check_pnum, nominee) = if second_is_newer {
        if !vid.copy_flag {
            return Ok(CompareOutcome {
                second_is_newer: true,
                ..Default::default()
            });
        }
        (pnum, *vid)
    } else {
        if !old.copy_flag {
            return Ok(CompareOutcome::default());
        }
        // The held copy's data_size and data_crc live only on flash
        let held = match io::read_vid_hdr(mtd, old.pnum)? {
            HdrIo::Ok(v) | HdrIo::Bitflips(v) => v,
            _ => return Err(FormatError::VidHeaderLost { pnum: old.pnum }.into()),
        };
        (old.pnum, held)
    };

    let buf = &mut databuf[..nominee.data_size as usize];
    let kind = io::read_data(mtd, buf, check_pnum, 0)?;

    if UBI_CRC.checksum(buf) != nominee.data_crc {
        // The nominated copy never finished being written; the other wins.
        Ok(CompareOutcome {
            second_is_newer: !second_is_newer,
            bitflips: false,
            corrupted: true,
        })
    } else {
        Ok(CompareOutcome {
            second_is_newer,
            bitflips: !kind.is_clean(),
            corrupted: false,
        })
    }
}

#[cfg(test)]
mod test {
    use super::super::testutil::{copy_vid, new_mtd, program_peb, proto_ec};
    use super::*;

    fn empty_cfg() -> AttachConfig {
        AttachConfig::default()
    }

    #[test]
    fn test_add_volume_bookkeeping() {
        let mut ai = AttachInfo::new(&empty_cfg());
        let vid = Vid {
            vol_id: 4,
            used_ebs: 0,
            ..Default::default()
        };

        ai.add_volume(4, &vid);
        ai.add_volume(4, &vid);
        ai.add_volume(2, &Vid {
            vol_id: 2,
            ..Default::default()
        });

        assert_eq!(ai.vols_found, 2);
        assert_eq!(ai.highest_vol_id, 4);
        assert!(ai.find_volume(4).is_some());
        assert!(ai.find_volume(3).is_none());
    }

    #[test]
    fn test_remove_volume_drains_to_erase() -> anyhow::Result<()> {
        let mut mtd = new_mtd(8);
        let mut ai = AttachInfo::new(&empty_cfg());
        let mut databuf = vec![0u8; mtd.leb_size()];

        for lnum in 0..3 {
            let vid = Vid {
                vol_id: 1,
                lnum,
                sqnum: u64::from(lnum) + 1,
                ..Default::default()
            };
            ai.add_to_av(&mut mtd, &mut databuf, lnum, Some(5), &vid, false)?;
        }

        ai.remove_volume(1);
        assert!(ai.volumes.is_empty());
        assert_eq!(ai.erase.len(), 3);
        assert_eq!(ai.vols_found, 0);

        Ok(())
    }

    #[test]
    fn test_add_to_av_tracks_highest_lnum() -> anyhow::Result<()> {
        let mut mtd = new_mtd(8);
        let mut ai = AttachInfo::new(&empty_cfg());
        let mut databuf = vec![0u8; mtd.leb_size()];

        for (pnum, lnum, sqnum) in [(0, 2, 10), (1, 0, 11), (2, 5, 12)] {
            let vid = Vid {
                vol_id: 0,
                lnum,
                sqnum,
                ..Default::default()
            };
            ai.add_to_av(&mut mtd, &mut databuf, pnum, Some(1), &vid, false)?;
        }

        let av = ai.find_volume(0).unwrap();
        assert_eq!(av.leb_count, 3);
        assert_eq!(av.lebs.len(), 3);
        assert_eq!(av.highest_lnum, 5);
        assert_eq!(ai.max_sqnum, 12);

        Ok(())
    }

    #[test]
    fn test_vid_mismatch_rejected() -> anyhow::Result<()> {
        let mut mtd = new_mtd(8);
        let mut ai = AttachInfo::new(&empty_cfg());
        let mut databuf = vec![0u8; mtd.leb_size()];

        let vid = Vid {
            vol_id: 1,
            lnum: 0,
            sqnum: 1,
            data_pad: 0,
            ..Default::default()
        };
        ai.add_to_av(&mut mtd, &mut databuf, 0, Some(1), &vid, false)?;

        let clashing = Vid {
            lnum: 1,
            sqnum: 2,
            data_pad: 64,
            ..vid
        };
        assert!(matches!(
            ai.add_to_av(&mut mtd, &mut databuf, 1, Some(1), &clashing, false),
            Err(AttachError::Format(FormatError::VidMismatch { .. }))
        ));

        Ok(())
    }

    #[test]
    fn test_duplicate_nonzero_sqnum() -> anyhow::Result<()> {
        let mut mtd = new_mtd(8);
        let mut ai = AttachInfo::new(&empty_cfg());
        let mut databuf = vec![0u8; mtd.leb_size()];

        let vid = Vid {
            vol_id: 1,
            lnum: 0,
            sqnum: 42,
            ..Default::default()
        };
        ai.add_to_av(&mut mtd, &mut databuf, 0, Some(1), &vid, false)?;
        assert!(matches!(
            ai.add_to_av(&mut mtd, &mut databuf, 1, Some(1), &vid, false),
            Err(AttachError::Format(FormatError::DuplicateSqnum { sqnum: 42, .. }))
        ));

        Ok(())
    }

    #[test]
    fn test_compare_plain_sqnum_decides() -> anyhow::Result<()> {
        let mut mtd = new_mtd(8);
        let mut databuf = vec![0u8; mtd.leb_size()];

        let old = PebRecord::mapped(
            0,
            Some(1),
            &Vid {
                vol_id: 1,
                lnum: 2,
                sqnum: 50,
                ..Default::default()
            },
            false,
        );
        let newer = Vid {
            vol_id: 1,
            lnum: 2,
            sqnum: 51,
            ..Default::default()
        };

        let cmp = compare_lebs(&mut mtd, &mut databuf, &old, 1, &newer)?;
        assert_eq!(
            cmp,
            CompareOutcome {
                second_is_newer: true,
                bitflips: false,
                corrupted: false
            }
        );

        // Equal zero sequence numbers resolve in favor of the held copy
        let legacy = PebRecord::mapped(
            3,
            Some(1),
            &Vid {
                vol_id: 1,
                lnum: 2,
                sqnum: 0,
                ..Default::default()
            },
            false,
        );
        let cmp = compare_lebs(&mut mtd, &mut databuf, &legacy, 4, &legacy_vid(0))?;
        assert!(!cmp.second_is_newer);

        Ok(())
    }

    fn legacy_vid(sqnum: u64) -> Vid {
        Vid {
            vol_id: 1,
            lnum: 2,
            sqnum,
            ..Default::default()
        }
    }

    #[test]
    fn test_compare_copy_flag_crc() -> anyhow::Result<()> {
        let mut mtd = new_mtd(8);
        let mut databuf = vec![0u8; mtd.leb_size()];
        let data = vec![0x5A; 256];

        // PEB 1 carries a mid-write copy whose CRC is good
        let ec = proto_ec(&mtd);
        let good = copy_vid(1, 2, 51, &data);
        program_peb(&mut mtd, 1, ec, Some(good), &data)?;

        let old = PebRecord::mapped(0, Some(1), &legacy_vid(50), false);
        let cmp = compare_lebs(&mut mtd, &mut databuf, &old, 1, &good)?;
        assert_eq!(
            cmp,
            CompareOutcome {
                second_is_newer: true,
                bitflips: false,
                corrupted: false
            }
        );

        // PEB 2 carries the same copy but with a wrong CRC: the held copy wins
        let bad = Vid {
            data_crc: !good.data_crc,
            ..good
        };
        program_peb(&mut mtd, 2, ec, Some(bad), &data)?;
        let cmp = compare_lebs(&mut mtd, &mut databuf, &old, 2, &bad)?;
        assert_eq!(
            cmp,
            CompareOutcome {
                second_is_newer: false,
                bitflips: false,
                corrupted: true
            }
        );

        Ok(())
    }

    #[test]
    fn test_compare_rereads_held_copy() -> anyhow::Result<()> {
        let mut mtd = new_mtd(8);
        let mut databuf = vec![0u8; mtd.leb_size()];
        let data = vec![0x77; 128];

        // The held copy (sqnum 60, copy_flag set, valid CRC) is the nominee
        // when the scanned PEB carries an older sqnum.
        let ec = proto_ec(&mtd);
        let held = copy_vid(1, 2, 60, &data);
        program_peb(&mut mtd, 5, ec, Some(held), &data)?;

        let old = PebRecord::mapped(5, Some(1), &held, false);
        let scanned = legacy_vid(40);
        let cmp = compare_lebs(&mut mtd, &mut databuf, &old, 6, &scanned)?;
        assert_eq!(
            cmp,
            CompareOutcome {
                second_is_newer: false,
                bitflips: false,
                corrupted: false
            }
        );

        Ok(())
    }
}
