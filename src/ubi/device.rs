//! The attached UBI device: the context every EBA operation runs in.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};

use super::config::{UbiConfig, VolumeConfig};
use super::error::{CopyError, Error, Result};
use super::io::PebIo;
use super::ltree::LockTree;
use super::scan::{AttachInfo, AttachLeb, AttachVolume};
use super::table::{EbaTable, Volume};
use super::wl::{PebAccounting, Wl};
use crate::nand::Nand;

/// A UBI device attached on top of a NAND
#[derive(Debug)]
pub struct Ubi<N> {
    pub(crate) io: PebIo<N>,
    pub(crate) wl: Wl,
    pub(crate) config: UbiConfig,
    pub(crate) volumes: RwLock<BTreeMap<u32, Arc<Volume>>>,
    pub(crate) ltree: LockTree,

    /// The sequence number the next VID header gets
    pub(crate) global_sqnum: AtomicU64,

    pub(crate) ro_mode: AtomicBool,

    /// Serializes atomic LEB changes, which share the one PEB reserved for them
    pub(crate) alc_mutex: Mutex<()>,

    /// LEB-sized scratch buffer for relocation and recovery
    pub(crate) peb_buf: Mutex<Vec<u8>>,

    /// Taken shared while a table entry changes, and exclusively to snapshot all tables at once
    pub(crate) fm_eba: RwLock<()>,

    /// Whether the mapping came from a snapshot rather than a scan of every PEB
    pub(crate) fast_attach: bool,
}

impl<N: Nand> Ubi<N> {
    /// Scan the whole NAND, then attach with the volumes given
    pub fn attach_scan(nand: N, config: UbiConfig, volumes: &[VolumeConfig]) -> Result<Self> {
        let io = PebIo::new(nand)?;
        let ai = AttachInfo::scan(&io)?;
        Self::attach_io(io, config, volumes, ai)
    }

    /// Attach using attach information gathered earlier (e.g. from [Ubi::fastmap_snapshot])
    pub fn attach(
        nand: N,
        config: UbiConfig,
        volumes: &[VolumeConfig],
        ai: AttachInfo,
    ) -> Result<Self> {
        Self::attach_io(PebIo::new(nand)?, config, volumes, ai)
    }

    fn attach_io(
        io: PebIo<N>,
        config: UbiConfig,
        volumes: &[VolumeConfig],
        mut ai: AttachInfo,
    ) -> Result<Self> {
        if ai.fast {
            ai.rescan_free(&io)?;
        }

        let wl = Wl::new(&io, &ai, config.bad_allowed)?;
        let peb_buf = Mutex::new(vec![0xFF; io.leb_size()]);

        let ubi = Self {
            io,
            wl,
            config,
            volumes: Default::default(),
            ltree: LockTree::new(),
            global_sqnum: AtomicU64::new(0),
            ro_mode: AtomicBool::new(false),
            alc_mutex: Mutex::new(()),
            peb_buf,
            fm_eba: RwLock::new(()),
            fast_attach: ai.fast,
        };
        ubi.init(volumes, &ai)?;

        let acct = ubi.accounting();
        info!(
            "attached {} volumes: {} PEBs, {} available, {} reserved for bad PEB handling",
            volumes.len(),
            acct.good_peb_count,
            acct.avail_pebs,
            acct.beb_rsvd_pebs
        );

        Ok(ubi)
    }

    /// Give up the device, returning the NAND underneath
    pub fn detach(self) -> N {
        self.io.into_inner()
    }

    pub fn nand(&self) -> &N {
        self.io.nand()
    }

    /// Bytes of data a LEB holds on this device, before volume alignment
    pub fn leb_size(&self) -> usize {
        self.io.leb_size()
    }

    pub fn min_io_size(&self) -> usize {
        self.io.min_io_size()
    }

    pub fn is_read_only(&self) -> bool {
        self.ro_mode.load(Ordering::SeqCst)
    }

    /// The sequence number most recently handed out
    pub fn max_sqnum(&self) -> u64 {
        self.global_sqnum.load(Ordering::SeqCst).saturating_sub(1)
    }

    pub fn accounting(&self) -> PebAccounting {
        self.wl.accounting()
    }

    pub fn scrub_pending(&self) -> usize {
        self.wl.scrub_pending()
    }

    pub fn volume(&self, vol_id: u32) -> Result<Arc<Volume>> {
        self.volumes
            .read()
            .get(&vol_id)
            .cloned()
            .ok_or(Error::NoVolume(vol_id))
    }

    pub fn volume_ids(&self) -> Vec<u32> {
        self.volumes.read().keys().copied().collect()
    }

    /// Take the next sequence number for a VID header
    pub(crate) fn next_sqnum(&self) -> u64 {
        self.global_sqnum.fetch_add(1, Ordering::SeqCst)
    }

    /// Switch to read-only mode; there is no way back short of re-attaching
    pub(crate) fn set_ro_mode(&self) {
        if !self.ro_mode.swap(true, Ordering::SeqCst) {
            error!("switching to read-only mode");
        }
    }

    /// Pass `result` through, switching to read-only mode first if it is an error
    pub(crate) fn ro_on_fatal<T>(&self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.set_ro_mode();
        }
        result
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        match self.is_read_only() {
            true => Err(Error::ReadOnly),
            false => Ok(()),
        }
    }

    /// Add a volume with an empty table
    pub fn create_volume(&self, config: VolumeConfig) -> Result<()> {
        self.check_writable()?;

        let mut volumes = self.volumes.write();
        if volumes.contains_key(&config.vol_id) {
            return Err(Error::VolumeExists(config.vol_id));
        }

        self.wl.accounting_mut().reserve(config.reserved_pebs)?;
        volumes.insert(
            config.vol_id,
            Arc::new(Volume::new(config, self.io.leb_size())),
        );

        info!(
            "created volume {} with {} LEBs",
            config.vol_id, config.reserved_pebs
        );
        Ok(())
    }

    /// Change the number of LEBs of a volume. LEBs cut off are unmapped first.
    ///
    /// Nothing may be writing to the LEBs being cut off while this runs.
    pub fn resize_volume(&self, vol_id: u32, reserved_pebs: u32) -> Result<()> {
        self.check_writable()?;
        let vol = self.volume(vol_id)?;
        let old_pebs = vol.reserved_pebs();

        if reserved_pebs > old_pebs {
            self.wl.accounting_mut().reserve(reserved_pebs - old_pebs)?;
        }

        for lnum in reserved_pebs..old_pebs {
            self.unmap_leb(&vol, lnum)?;
        }

        vol.replace_table(|old| {
            let table = EbaTable::create(reserved_pebs);
            old.copy_into(&table, reserved_pebs);
            table
        });

        if reserved_pebs < old_pebs {
            self.wl.accounting_mut().unreserve(old_pebs - reserved_pebs);
        }

        info!("resized volume {vol_id} from {old_pebs} to {reserved_pebs} LEBs");
        Ok(())
    }

    /// Unmap every LEB of a volume and forget about it
    pub fn remove_volume(&self, vol_id: u32) -> Result<()> {
        self.check_writable()?;
        let vol = self
            .volumes
            .write()
            .remove(&vol_id)
            .ok_or(Error::NoVolume(vol_id))?;

        let reserved_pebs = vol.reserved_pebs();
        for lnum in 0..reserved_pebs {
            self.unmap_leb(&vol, lnum)?;
        }
        self.wl.accounting_mut().unreserve(reserved_pebs);

        info!("removed volume {vol_id}");
        Ok(())
    }

    /// Record the current mapping of every volume, as if it had been written to flash.
    ///
    /// The result can be passed to [Ubi::attach] later; mappings in it are verified on first use.
    pub fn fastmap_snapshot(&self) -> AttachInfo {
        let _fm = self.fm_eba.write();
        let volumes = self.volumes.read();

        let mut ai = AttachInfo {
            free: self.wl.free_pebs(),
            bad_peb_count: self.wl.accounting().bad_peb_count,
            max_sqnum: self.max_sqnum(),
            mean_ec: self.wl.mean_ec(),
            fast: true,
            ..Default::default()
        };

        for vol in volumes.values() {
            let lebs = vol
                .table()
                .mapped()
                .map(|(lnum, pnum)| {
                    let leb = AttachLeb {
                        pnum,
                        ec: self.wl.ec(pnum),
                        sqnum: 0,
                        copy_flag: false,
                    };
                    (lnum, leb)
                })
                .collect();

            ai.volumes.insert(
                vol.vol_id(),
                AttachVolume {
                    vol_type: vol.vol_type(),
                    lebs,
                },
            );
        }

        ai
    }

    /// Move the data off every PEB queued for scrubbing. Returns how many LEBs were moved.
    pub fn scrub(&self) -> Result<usize> {
        let mut moved = 0;

        while let Some(from) = self.wl.next_scrub() {
            let vid = match self.io.read_vid_hdr(from) {
                Ok((vid, _)) => vid,
                Err(e) => {
                    warn!("not scrubbing PEB {from}: {e}");
                    continue;
                }
            };
            let (vol_id, lnum) = (vid.vol_id, vid.lnum);

            let to = match self.wl.get_peb() {
                Ok(to) => to,
                Err(e) => {
                    self.wl.schedule_scrub(from);
                    return Err(e);
                }
            };
            let result = {
                let fm = self.fm_eba.read_recursive();
                self.copy_leb(from, to, &vid, &fm)
            };

            match result {
                Ok(()) => {
                    info!("scrubbed PEB {from} (LEB {vol_id}:{lnum}), data moved to PEB {to}");
                    self.wl.put_peb(&self.io, vol_id, lnum, from, false)?;
                    moved += 1;
                }
                Err(CopyError::Retry) => {
                    debug!("LEB {vol_id}:{lnum} is busy, scrubbing PEB {from} later");
                    self.wl.put_peb(&self.io, vol_id, lnum, to, false)?;
                    self.wl.schedule_scrub(from);
                    break;
                }
                Err(CopyError::CancelRace) => {
                    debug!("LEB {vol_id}:{lnum} changed, PEB {from} needs no scrubbing");
                    self.wl.put_peb(&self.io, vol_id, lnum, to, false)?;
                }
                Err(e @ (CopyError::TargetWrite
                | CopyError::TargetRead
                | CopyError::TargetBitflips)) => {
                    warn!("cannot move LEB {vol_id}:{lnum} to PEB {to}: {e}");
                    self.wl.put_peb(&self.io, vol_id, lnum, to, true)?;
                    self.wl.schedule_scrub(from);
                    break;
                }
                Err(CopyError::SourceRead) => {
                    warn!("PEB {from} (LEB {vol_id}:{lnum}) cannot be read, leaving it in place");
                    self.wl.put_peb(&self.io, vol_id, lnum, to, false)?;
                }
                Err(CopyError::Fatal(e)) => {
                    error!("error while moving LEB {vol_id}:{lnum}: {e}");
                    self.set_ro_mode();
                    return Err(e);
                }
            }
        }

        Ok(moved)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::{NandLayout, PageUtil, ReadFault, SimNand};
    use crate::ubi::config::{InterruptedUnmap, StaleMappingPolicy, Staleness};
    use crate::ubi::headers::VolType;
    use crate::ubi::io::VidHdrRead;
    use crate::ubi::wl::WL_RESERVED_PEBS;
    use crate::ubi::EBA_RESERVED_PEBS;

    const TEST_LAYOUT: NandLayout = NandLayout {
        blocks: 32,
        pages_per_block: 18,
        bytes_per_page: 256,
    };

    fn dynamic(vol_id: u32, lebs: u32) -> VolumeConfig {
        VolumeConfig::new(VolType::Dynamic, vol_id).lebs(lebs)
    }

    fn fresh(volumes: &[VolumeConfig]) -> Result<Ubi<SimNand>> {
        Ubi::attach_scan(SimNand::new(TEST_LAYOUT), Default::default(), volumes)
    }

    fn read_leb(ubi: &Ubi<SimNand>, vol_id: u32, lnum: u32, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; len];
        ubi.read(vol_id, lnum, &mut buf, 0, true)?;
        Ok(buf)
    }

    fn pnum_of(ubi: &Ubi<SimNand>, vol_id: u32, lnum: u32) -> Option<u32> {
        ubi.volume(vol_id).ok()?.table().get(lnum)
    }

    #[test]
    fn test_accounting() -> Result<()> {
        let ubi = fresh(&[dynamic(0, 4), dynamic(1, 2)])?;
        let acct = ubi.accounting();

        assert_eq!(acct.good_peb_count, 32);
        assert_eq!(acct.bad_peb_limit, 1);
        assert_eq!(acct.beb_rsvd_pebs, 1);
        assert_eq!(
            acct.rsvd_pebs,
            WL_RESERVED_PEBS + 6 + EBA_RESERVED_PEBS + acct.beb_rsvd_pebs
        );
        assert_eq!(acct.avail_pebs + acct.rsvd_pebs, 32);
        assert_eq!(ubi.volume_ids(), [0, 1]);
        assert_eq!(ubi.max_sqnum(), 0);

        assert!(matches!(
            fresh(&[dynamic(0, 4), dynamic(0, 2)]),
            Err(Error::VolumeExists(0))
        ));
        assert!(matches!(
            fresh(&[dynamic(0, 40)]),
            Err(Error::NoSpace { needed: 40, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_reattach() -> Result<()> {
        let volumes = [dynamic(0, 4)];
        let ubi = fresh(&volumes)?;
        ubi.write_dynamic(0, 1, &[0x61; 1000], 0)?;
        ubi.atomic_change(0, 2, &[0x62; 3000])?;
        let sqnum = ubi.max_sqnum();
        let mapped = (pnum_of(&ubi, 0, 1), pnum_of(&ubi, 0, 2));

        let ubi = Ubi::attach_scan(ubi.detach(), Default::default(), &volumes)?;
        assert_eq!(ubi.max_sqnum(), sqnum);
        assert_eq!((pnum_of(&ubi, 0, 1), pnum_of(&ubi, 0, 2)), mapped);
        assert_eq!(pnum_of(&ubi, 0, 0), None);

        assert_eq!(read_leb(&ubi, 0, 1, 1000)?, [0x61; 1000]);
        assert_eq!(read_leb(&ubi, 0, 2, 3000)?, [0x62; 3000]);

        // New headers continue the sequence
        ubi.write_dynamic(0, 3, &[0x63; 10], 0)?;
        assert_eq!(ubi.max_sqnum(), sqnum + 1);
        Ok(())
    }

    #[test]
    fn test_power_cut_during_atomic_change() -> Result<()> {
        let volumes = [dynamic(0, 1)];
        let ubi = fresh(&volumes)?;
        ubi.atomic_change(0, 0, &[0x71; 2048])?;
        let old_pnum = pnum_of(&ubi, 0, 0).unwrap();

        // The new copy's header made it to flash, but not all of its data
        let vid = ubi.io.read_vid_hdr(old_pnum)?.0.copy_of(&[0x72; 2048]).sqnum(100);
        let pnum = ubi.wl.get_peb()?;
        ubi.io.write_vid_hdr(pnum, &vid)?;
        ubi.io.write_data(pnum, 0, &[0x72; 1024])?;

        let ubi = Ubi::attach_scan(ubi.nand().clone(), Default::default(), &volumes)?;
        assert_eq!(pnum_of(&ubi, 0, 0), Some(old_pnum));
        assert_eq!(read_leb(&ubi, 0, 0, 2048)?, [0x71; 2048]);
        Ok(())
    }

    #[test]
    fn test_init_erases_leftovers() -> Result<()> {
        let ubi = fresh(&[dynamic(0, 4), dynamic(5, 1)])?;
        ubi.write_dynamic(0, 0, &[1; 256], 0)?;
        ubi.write_dynamic(0, 3, &[2; 256], 0)?;
        ubi.write_dynamic(5, 0, &[3; 256], 0)?;
        let free = ubi.wl.free_count();

        // Volume 0 shrank to 2 LEBs and volume 5 is gone
        let ubi = Ubi::attach_scan(ubi.detach(), Default::default(), &[dynamic(0, 2)])?;
        assert_eq!(ubi.wl.free_count(), free + 2);
        assert_eq!(read_leb(&ubi, 0, 0, 256)?, [1; 256]);
        assert!(matches!(ubi.volume(5), Err(Error::NoVolume(5))));

        let ai = AttachInfo::scan(&ubi.io)?;
        assert_eq!(ai.volumes.len(), 1);
        assert_eq!(ai.volumes[&0].lebs.keys().copied().collect::<Vec<_>>(), [0]);
        Ok(())
    }

    #[test]
    fn test_scrub() -> Result<()> {
        let ubi = fresh(&[dynamic(0, 2)])?;
        ubi.write_dynamic(0, 0, &[0x81; 700], 0)?;
        let pnum = pnum_of(&ubi, 0, 0).unwrap();
        ubi.nand().set_read_fault(pnum, Some(ReadFault::Bitflips));

        assert_eq!(read_leb(&ubi, 0, 0, 700)?, [0x81; 700]);
        assert_eq!(ubi.scrub_pending(), 1);

        // Busy LEBs are scrubbed later
        {
            let _leb = ubi.ltree.read_lock(0, 0);
            assert_eq!(ubi.scrub()?, 0);
        }
        assert_eq!(ubi.scrub_pending(), 1);

        assert_eq!(ubi.scrub()?, 1);
        assert_eq!(ubi.scrub_pending(), 0);
        assert_ne!(pnum_of(&ubi, 0, 0), Some(pnum));
        assert_eq!(read_leb(&ubi, 0, 0, 700)?, [0x81; 700]);
        assert_eq!(ubi.scrub_pending(), 0);

        // Unmapping takes the PEB off the queue
        ubi.wl.schedule_scrub(pnum_of(&ubi, 0, 0).unwrap());
        ubi.unmap(0, 0)?;
        assert_eq!(ubi.scrub()?, 0);
        Ok(())
    }

    #[test]
    fn test_scrub_target_failure() -> Result<()> {
        let ubi = fresh(&[dynamic(0, 1)])?;
        ubi.write_dynamic(0, 0, &[0x91; 256], 0)?;
        let pnum = pnum_of(&ubi, 0, 0).unwrap();
        ubi.wl.schedule_scrub(pnum);

        for other in (0..TEST_LAYOUT.blocks).filter(|&x| x != pnum) {
            ubi.nand().fail_programs(other, 1);
        }
        assert_eq!(ubi.scrub()?, 0);
        assert_eq!(ubi.scrub_pending(), 1);
        assert_eq!(pnum_of(&ubi, 0, 0), Some(pnum));
        assert!(!ubi.is_read_only());
        Ok(())
    }

    #[test]
    fn test_fast_attach() -> Result<()> {
        let volumes = [dynamic(0, 4)];
        let ubi = fresh(&volumes)?;
        ubi.write_dynamic(0, 0, &[0xA1; 512], 0)?;
        ubi.write_dynamic(0, 1, &[0xA2; 512], 0)?;
        ubi.write_dynamic(0, 2, &[0xA3; 512], 0)?;
        let snapshot = ubi.fastmap_snapshot();
        assert!(snapshot.fast);
        assert_eq!(snapshot.volumes[&0].lebs.len(), 3);

        // Changes the snapshot doesn't know about
        ubi.unmap(0, 1)?;
        ubi.atomic_change(0, 2, &[0xB3; 512])?;
        ubi.write_dynamic(0, 3, &[0xB4; 512], 0)?;

        let ubi = Ubi::attach(ubi.detach(), Default::default(), &volumes, snapshot)?;
        assert!(ubi.fast_attach);

        assert_eq!(read_leb(&ubi, 0, 0, 512)?, [0xA1; 512]);
        assert!(read_leb(&ubi, 0, 1, 512)?.is_erased());
        assert_eq!(read_leb(&ubi, 0, 2, 512)?, [0xB3; 512]);
        assert_eq!(read_leb(&ubi, 0, 3, 512)?, [0xB4; 512]);
        assert!(!ubi.is_read_only());

        let scan = AttachInfo::scan(&ubi.io)?;
        ubi.self_check(&ubi.fastmap_snapshot(), &scan)?;
        assert!(!ubi.is_read_only());
        Ok(())
    }

    /// Holds each caller until as many as the barrier counts are classifying at once
    #[derive(Debug)]
    struct Rendezvous(Arc<std::sync::Barrier>);

    impl StaleMappingPolicy for Rendezvous {
        fn classify(&self, hdr: &VidHdrRead) -> Staleness {
            self.0.wait();
            InterruptedUnmap.classify(hdr)
        }
    }

    #[test]
    fn test_stale_mapping_freed_once() -> Result<()> {
        let volumes = [dynamic(0, 2)];
        let ubi = fresh(&volumes)?;
        ubi.write_dynamic(0, 0, &[0xC1; 512], 0)?;
        let stale = pnum_of(&ubi, 0, 0).unwrap();
        let snapshot = ubi.fastmap_snapshot();
        ubi.unmap(0, 0)?;

        let config = UbiConfig::default().stale_policy(Rendezvous(Arc::new(
            std::sync::Barrier::new(2),
        )));
        let ubi = Ubi::attach(ubi.detach(), config, &volumes, snapshot)?;
        let free_before = ubi.wl.free_count();

        // Both readers find the entry unchecked before either of them drops it
        std::thread::scope(|s| {
            let readers: Vec<_> = (0..2)
                .map(|_| s.spawn(|| read_leb(&ubi, 0, 0, 512)))
                .collect();
            for reader in readers {
                assert!(reader.join().unwrap()?.is_erased());
            }
            Ok::<_, Error>(())
        })?;

        assert_eq!(pnum_of(&ubi, 0, 0), None);
        assert_eq!(ubi.wl.free_count(), free_before + 1);
        let free: Vec<_> = ubi.wl.free_pebs().iter().map(|x| x.pnum).collect();
        assert_eq!(free.iter().filter(|&&pnum| pnum == stale).count(), 1);
        Ok(())
    }

    #[test]
    fn test_self_check_mismatch() -> Result<()> {
        let ubi = fresh(&[dynamic(0, 2)])?;
        ubi.write_dynamic(0, 1, &[1; 256], 0)?;
        let pnum = pnum_of(&ubi, 0, 1).unwrap();

        let scan = AttachInfo::scan(&ubi.io)?;
        let mut fast = ubi.fastmap_snapshot();
        ubi.self_check(&fast, &scan)?;

        let wrong = (pnum + 1) % TEST_LAYOUT.blocks;
        fast.volumes.get_mut(&0).unwrap().lebs.get_mut(&1).unwrap().pnum = wrong;
        assert!(matches!(
            ubi.self_check(&fast, &scan),
            Err(Error::MappingMismatch { vol_id: 0, lnum: 1, .. })
        ));
        assert!(ubi.is_read_only());
        Ok(())
    }

    #[test]
    fn test_volumes() -> Result<()> {
        let ubi = fresh(&[dynamic(0, 2)])?;
        let avail = ubi.accounting().avail_pebs;

        ubi.create_volume(dynamic(1, 3))?;
        assert_eq!(ubi.accounting().avail_pebs, avail - 3);
        assert!(matches!(
            ubi.create_volume(dynamic(1, 1)),
            Err(Error::VolumeExists(1))
        ));
        assert!(matches!(
            ubi.create_volume(dynamic(2, avail)),
            Err(Error::NoSpace { .. })
        ));

        ubi.write_dynamic(1, 2, &[7; 256], 0)?;
        let free = ubi.wl.free_count();
        ubi.resize_volume(1, 2)?;
        assert_eq!(ubi.wl.free_count(), free + 1);
        assert_eq!(ubi.volume(1)?.reserved_pebs(), 2);
        assert_eq!(ubi.accounting().avail_pebs, avail - 2);
        assert!(matches!(
            ubi.unmap(1, 2),
            Err(Error::LebOutOfRange { vol_id: 1, lnum: 2 })
        ));

        ubi.write_dynamic(1, 0, &[8; 256], 0)?;
        ubi.resize_volume(1, 5)?;
        assert_eq!(read_leb(&ubi, 1, 0, 256)?, [8; 256]);
        assert!(read_leb(&ubi, 1, 4, 256)?.is_erased());

        ubi.remove_volume(1)?;
        assert_eq!(ubi.accounting().avail_pebs, avail);
        assert!(matches!(ubi.remove_volume(1), Err(Error::NoVolume(1))));
        assert!(matches!(
            ubi.write_dynamic(1, 0, &[8; 256], 0),
            Err(Error::NoVolume(1))
        ));
        Ok(())
    }
}
