//! Building the EBA tables at attach time, and checking a snapshot against a full scan.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{error, warn};

use super::config::VolumeConfig;
use super::device::Ubi;
use super::error::{Error, Result};
use super::scan::AttachInfo;
use super::table::Volume;
use crate::nand::Nand;

/// PEBs reserved for atomic LEB change
pub const EBA_RESERVED_PEBS: u32 = 1;

/// `x * numer / denom`, without overflowing on the intermediate product
fn mult_frac(x: u32, numer: u32, denom: u32) -> u32 {
    let (quot, rem) = (x / denom, x % denom);
    quot * numer + rem * numer / denom
}

/// How many bad PEBs a device of `peb_count` PEBs may develop over its lifetime, rounded up
pub fn bad_peb_limit(peb_count: u32, max_beb_per1024: u32) -> u32 {
    if max_beb_per1024 == 0 {
        return 0;
    }

    let limit = mult_frac(peb_count, max_beb_per1024, 1024);
    if mult_frac(limit, 1024, max_beb_per1024) < peb_count {
        limit + 1
    } else {
        limit
    }
}

impl<N: Nand> Ubi<N> {
    /// Create a table for every volume and fill it in from the attach information, then take the
    /// PEB reserves the EBA layer needs.
    pub(crate) fn init(&self, volumes: &[VolumeConfig], ai: &AttachInfo) -> Result<()> {
        let mut tables = BTreeMap::new();
        let mut erase = vec![];

        for config in volumes {
            if tables.contains_key(&config.vol_id) {
                return Err(Error::VolumeExists(config.vol_id));
            }
            self.wl.accounting_mut().reserve(config.reserved_pebs)?;

            let vol = Volume::new(*config, self.io.leb_size());
            if let Some(av) = ai.volumes.get(&config.vol_id) {
                if av.vol_type != config.vol_type {
                    warn!(
                        "volume {} was found as {:?}, attaching it as {:?}",
                        config.vol_id, av.vol_type, config.vol_type
                    );
                }

                let table = vol.table();
                for (&lnum, leb) in &av.lebs {
                    if lnum >= table.len() {
                        // The volume shrank since this LEB was written
                        erase.push((config.vol_id, lnum, leb.pnum));
                        continue;
                    }

                    table.set(lnum, leb.pnum);
                    if ai.fast {
                        table.set_checked(lnum, false);
                    }
                }
            }

            tables.insert(config.vol_id, Arc::new(vol));
        }

        for (&vol_id, av) in &ai.volumes {
            if !tables.contains_key(&vol_id) {
                warn!(
                    "volume {vol_id} was found on flash but not configured, erasing its {} LEBs",
                    av.lebs.len()
                );
                erase.extend(av.lebs.iter().map(|(&lnum, leb)| (vol_id, lnum, leb.pnum)));
            }
        }

        *self.volumes.write() = tables;

        for (vol_id, lnum, pnum) in erase {
            self.wl.put_peb(&self.io, vol_id, lnum, pnum, false)?;
        }

        self.global_sqnum.store(ai.max_sqnum + 1, Ordering::SeqCst);

        let mut acct = self.wl.accounting_mut();
        if let Err(e) = acct.reserve(EBA_RESERVED_PEBS) {
            error!("not enough physical eraseblocks for atomic LEB change: {e}");
            return Err(e);
        }

        if self.config.bad_allowed {
            acct.bad_peb_limit = bad_peb_limit(acct.peb_count, self.config.max_beb_per1024);

            acct.beb_rsvd_level = match acct.bad_peb_limit.checked_sub(acct.bad_peb_count) {
                Some(level) => level,
                None => {
                    warn!(
                        "number of bad PEBs ({}) is above the expected limit ({}), not reserving \
                         any PEBs for bad PEB handling",
                        acct.bad_peb_count, acct.bad_peb_limit
                    );
                    0
                }
            };

            acct.beb_rsvd_pebs = if acct.avail_pebs < acct.beb_rsvd_level {
                warn!(
                    "cannot reserve enough PEBs for bad PEB handling, reserved {}, need {}",
                    acct.avail_pebs, acct.beb_rsvd_level
                );
                acct.avail_pebs
            } else {
                acct.beb_rsvd_level
            };

            acct.avail_pebs -= acct.beb_rsvd_pebs;
            acct.rsvd_pebs += acct.beb_rsvd_pebs;
        }

        Ok(())
    }

    /// Compare the mapping of a snapshot with that of a full scan, volume by volume.
    ///
    /// A LEB one side knows nothing about is fine, but both sides mapping a LEB to different PEBs
    /// means the snapshot can't be trusted, and the device goes read-only.
    pub fn self_check(&self, fast: &AttachInfo, scan: &AttachInfo) -> Result<()> {
        let volumes = self.volumes.read();

        for vol in volumes.values() {
            let vol_id = vol.vol_id();
            let reserved_pebs = vol.reserved_pebs() as usize;

            let mapping = |ai: &AttachInfo| {
                let mut pnums = vec![None; reserved_pebs];
                if let Some(av) = ai.volumes.get(&vol_id) {
                    for (&lnum, leb) in &av.lebs {
                        if let Some(entry) = pnums.get_mut(lnum as usize) {
                            *entry = Some(leb.pnum);
                        }
                    }
                }
                pnums
            };

            let fm_pnums = mapping(fast);
            let scan_pnums = mapping(scan);

            for (lnum, pair) in fm_pnums.into_iter().zip(scan_pnums).enumerate() {
                if let (Some(fast), Some(scan)) = pair {
                    if fast != scan {
                        error!(
                            "PEB mismatch for LEB {vol_id}:{lnum}: snapshot {fast}, scan {scan}"
                        );
                        self.set_ro_mode();
                        return Err(Error::MappingMismatch {
                            vol_id,
                            lnum: lnum as u32,
                            fast,
                            scan,
                        });
                    }
                }
            }
        }

        Ok(())
    }
}

#[test]
fn test_bad_peb_limit() {
    // 20 per 1024 of 4096 PEBs is exact
    assert_eq!(bad_peb_limit(4096, 20), 80);

    // 20 per 1024 of 1000 PEBs is 19.53, rounded up
    assert_eq!(bad_peb_limit(1000, 20), 20);
    assert_eq!(bad_peb_limit(32, 20), 1);
    assert_eq!(bad_peb_limit(32, 0), 0);
}
