//! Per-volume EBA tables (LEB to PEB mapping) and the volumes that own them.
//!
//! A table does no locking of its own. An entry may only change while its LEB is write-locked in
//! the [LockTree](super::ltree::LockTree), or while nothing else can see the table yet. Entries are
//! atomics so that LEBs of the same table can be worked on from several threads at once.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use parking_lot::{RwLock, RwLockReadGuard};

use super::config::VolumeConfig;
use super::headers::VolType;

const UBI_LEB_UNMAPPED: i32 = -1;

#[derive(Debug)]
struct EbaEntry {
    pnum: AtomicI32,

    /// Cleared for mappings installed by a fast attach until the PEB's VID header was looked at
    checked: AtomicBool,
}

impl Default for EbaEntry {
    fn default() -> Self {
        Self {
            pnum: AtomicI32::new(UBI_LEB_UNMAPPED),
            checked: AtomicBool::new(true),
        }
    }
}

/// The LEB to PEB mapping of one volume
#[derive(Debug)]
pub struct EbaTable {
    entries: Box<[EbaEntry]>,
}

impl EbaTable {
    /// Allocate a table of `entry_count` unmapped entries
    pub fn create(entry_count: u32) -> Self {
        let entries = (0..entry_count).map(|_| EbaEntry::default()).collect();
        Self { entries }
    }

    pub fn len(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The PEB that `lnum` is mapped to, if any
    pub fn get(&self, lnum: u32) -> Option<u32> {
        let pnum = self.entries[lnum as usize].pnum.load(Ordering::Acquire);
        u32::try_from(pnum).ok()
    }

    pub fn is_mapped(&self, lnum: u32) -> bool {
        self.get(lnum).is_some()
    }

    /// Map `lnum` to `pnum`; the new mapping counts as verified
    pub fn set(&self, lnum: u32, pnum: u32) {
        let entry = &self.entries[lnum as usize];
        // PebIo refuses devices with more than i32::MAX PEBs
        entry.pnum.store(pnum as i32, Ordering::Release);
        entry.checked.store(true, Ordering::Release);
    }

    /// Mark `lnum` unmapped
    pub fn clear(&self, lnum: u32) {
        self.entries[lnum as usize]
            .pnum
            .store(UBI_LEB_UNMAPPED, Ordering::Release);
    }

    /// Unmap `lnum` only if it still points at `pnum`; returns whether this call did it
    pub fn clear_if(&self, lnum: u32, pnum: u32) -> bool {
        self.entries[lnum as usize]
            .pnum
            .compare_exchange(
                pnum as i32,
                UBI_LEB_UNMAPPED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Does the mapping of `lnum` still have to be verified against the flash?
    pub fn needs_check(&self, lnum: u32) -> bool {
        !self.entries[lnum as usize].checked.load(Ordering::Acquire)
    }

    pub fn set_checked(&self, lnum: u32, checked: bool) {
        self.entries[lnum as usize]
            .checked
            .store(checked, Ordering::Release);
    }

    /// Copy the first `entry_count` entries (or as many as both tables have) into `other`
    pub fn copy_into(&self, other: &EbaTable, entry_count: u32) {
        let count = entry_count.min(self.len()).min(other.len()) as usize;
        for (src, dst) in self.entries[..count].iter().zip(other.entries.iter()) {
            dst.pnum
                .store(src.pnum.load(Ordering::Acquire), Ordering::Release);
            dst.checked
                .store(src.checked.load(Ordering::Acquire), Ordering::Release);
        }
    }

    /// All `(lnum, pnum)` pairs currently mapped
    pub fn mapped(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        (0..self.len()).filter_map(|lnum| self.get(lnum).map(|pnum| (lnum, pnum)))
    }
}

/// A volume attached to the device: its geometry and its EBA table
#[derive(Debug)]
pub struct Volume {
    vol_id: u32,
    vol_type: VolType,
    alignment: u32,
    data_pad: u32,
    usable_leb_size: usize,

    /// Operations hold this shared for as long as they use the table; swapping in a new table
    /// (on resize) takes it exclusively
    table: RwLock<EbaTable>,
}

impl Volume {
    /// Build a volume with an all-unmapped table, for PEBs with `leb_size` bytes of data
    pub(crate) fn new(config: VolumeConfig, leb_size: usize) -> Self {
        let alignment: u32 = config.alignment.into();
        let data_pad = leb_size as u32 % alignment;

        Self {
            vol_id: config.vol_id,
            vol_type: config.vol_type,
            alignment,
            data_pad,
            usable_leb_size: leb_size - data_pad as usize,
            table: RwLock::new(EbaTable::create(config.reserved_pebs)),
        }
    }

    pub fn vol_id(&self) -> u32 {
        self.vol_id
    }

    pub fn vol_type(&self) -> VolType {
        self.vol_type
    }

    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    pub fn data_pad(&self) -> u32 {
        self.data_pad
    }

    /// Bytes of data each LEB of this volume holds
    pub fn usable_leb_size(&self) -> usize {
        self.usable_leb_size
    }

    pub fn reserved_pebs(&self) -> u32 {
        self.table().len()
    }

    /// Readers never queue behind a pending resize, so an operation may wait on other locks while
    /// holding this
    pub fn table(&self) -> RwLockReadGuard<'_, EbaTable> {
        self.table.read_recursive()
    }

    /// Swap in a new table built from the current one, once no operation uses the table
    pub(crate) fn replace_table(&self, build: impl FnOnce(&EbaTable) -> EbaTable) {
        let mut table = self.table.write();
        *table = build(&table);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::num::NonZeroU32;

    #[test]
    fn test_table() {
        let tbl = EbaTable::create(4);
        assert_eq!(tbl.len(), 4);
        assert!((0..4).all(|lnum| !tbl.is_mapped(lnum)));

        tbl.set(2, 17);
        assert_eq!(tbl.get(2), Some(17));
        assert_eq!(tbl.mapped().collect::<Vec<_>>(), [(2, 17)]);

        tbl.clear(2);
        assert_eq!(tbl.get(2), None);
    }

    #[test]
    fn test_clear_if() {
        let tbl = EbaTable::create(2);
        tbl.set(1, 9);

        assert!(!tbl.clear_if(1, 8));
        assert_eq!(tbl.get(1), Some(9));

        assert!(tbl.clear_if(1, 9));
        assert!(!tbl.clear_if(1, 9));
        assert_eq!(tbl.get(1), None);
    }

    #[test]
    fn test_copy_into() {
        let small = EbaTable::create(2);
        small.set(0, 5);
        small.set(1, 6);
        small.set_checked(1, false);

        let big = EbaTable::create(4);
        small.copy_into(&big, 4);
        assert_eq!(big.mapped().collect::<Vec<_>>(), [(0, 5), (1, 6)]);
        assert!(big.needs_check(1));

        let shrunk = EbaTable::create(1);
        big.copy_into(&shrunk, 1);
        assert_eq!(shrunk.mapped().collect::<Vec<_>>(), [(0, 5)]);
    }

    #[test]
    fn test_volume_geometry() {
        let config = VolumeConfig::new(VolType::Dynamic, 0)
            .lebs(3)
            .align(NonZeroU32::new(1000).unwrap());
        let vol = Volume::new(config, 4096);

        assert_eq!(vol.data_pad(), 96);
        assert_eq!(vol.usable_leb_size(), 4000);
        assert_eq!(vol.reserved_pebs(), 3);

        vol.replace_table(|_| EbaTable::create(5));
        assert_eq!(vol.reserved_pebs(), 5);
    }
}
