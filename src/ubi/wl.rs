//! The PEB pool: hands out erased PEBs, takes used ones back, and keeps the PEB accounting.
//!
//! Erasing is done synchronously in [Wl::put_peb]. PEBs are chosen by a percentile of the erase
//! counter, so that there's still decent wear-leveling, but we don't crowd lots of (probably
//! static) data onto the lowest EC blocks.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use log::{debug, error, warn};
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use super::error::{Error, Result};
use super::headers::Ec;
use super::io::PebIo;
use super::scan::{AttachInfo, AttachPeb};
use crate::nand::{Nand, NandError};

/// Which percentile of the free PEBs' erase counters [Wl::get_peb] picks from
const PERCENTILE: usize = 25;

/// PEBs the pool needs for itself (a free PEB to relocate into)
pub const WL_RESERVED_PEBS: u32 = 1;

/// Where the device's good PEBs went
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct PebAccounting {
    pub peb_count: u32,
    pub good_peb_count: u32,
    pub bad_peb_count: u32,

    /// The most bad PEBs the device is expected to develop over its lifetime
    pub bad_peb_limit: u32,

    /// Good PEBs not promised to anything yet
    pub avail_pebs: u32,

    /// PEBs promised to volumes and internal reserves
    pub rsvd_pebs: u32,

    /// PEBs set aside to replace PEBs going bad
    pub beb_rsvd_pebs: u32,

    /// How many PEBs `beb_rsvd_pebs` ought to be
    pub beb_rsvd_level: u32,
}

impl PebAccounting {
    /// Promise `count` available PEBs to someone
    pub fn reserve(&mut self, count: u32) -> Result<()> {
        if self.avail_pebs < count {
            return Err(Error::NoSpace {
                avail: self.avail_pebs,
                needed: count,
            });
        }
        self.avail_pebs -= count;
        self.rsvd_pebs += count;
        Ok(())
    }

    pub fn unreserve(&mut self, count: u32) {
        let count = count.min(self.rsvd_pebs);
        self.rsvd_pebs -= count;
        self.avail_pebs += count;
    }
}

#[derive(Debug)]
struct WlState {
    /// Erased PEBs with a fresh EC header, grouped by erase counter
    free: BTreeMap<u64, BTreeSet<u32>>,

    /// The erase counter of every PEB
    ec: Box<[u64]>,

    /// PEBs that showed bit-flips and should have their LEB moved elsewhere
    scrub: VecDeque<u32>,

    acct: PebAccounting,
}

impl WlState {
    fn add_free(&mut self, pnum: u32, ec: u64) {
        self.ec[pnum as usize] = ec;
        self.free.entry(ec).or_default().insert(pnum);
    }

    /// Take a free PEB from the erase counter group at the wanted percentile
    fn take_free(&mut self) -> Option<u32> {
        let sum: usize = self.free.values().map(|x| x.len()).sum();
        let mut threshold = sum * PERCENTILE / 100;

        let percentile_ec = self.free.iter().find_map(|(&k, v)| {
            if v.len() >= threshold {
                Some(k)
            } else {
                threshold -= v.len();
                None
            }
        })?;

        let group = self.free.get_mut(&percentile_ec)?;
        let pnum = group.pop_first()?;
        if group.is_empty() {
            self.free.remove(&percentile_ec);
        }
        Some(pnum)
    }
}

/// The PEB pool of one device
#[derive(Debug)]
pub struct Wl {
    /// Written into every freshly erased PEB, with the erase counter filled in
    proto: Ec,
    bad_allowed: bool,
    state: Mutex<WlState>,
}

impl Wl {
    /// Build the pool from the attach information, erasing every PEB that needs it.
    pub fn new<N: Nand>(io: &PebIo<N>, ai: &AttachInfo, bad_allowed: bool) -> Result<Self> {
        let page_size = io.min_io_size() as u32;
        let proto = Ec {
            vid_hdr_offset: page_size,
            data_offset: page_size * 2,
            ..Default::default()
        };

        let peb_count = io.peb_count();
        let mut state = WlState {
            free: BTreeMap::new(),
            ec: vec![ai.mean_ec; peb_count as usize].into(),
            scrub: VecDeque::new(),
            acct: PebAccounting {
                peb_count,
                bad_peb_count: ai.bad_peb_count,
                good_peb_count: peb_count.saturating_sub(ai.bad_peb_count),
                ..Default::default()
            },
        };

        for leb in ai.volumes.values().flat_map(|av| av.lebs.values()) {
            state.ec[leb.pnum as usize] = leb.ec;
        }
        for &AttachPeb { pnum, ec } in &ai.free {
            state.add_free(pnum, ec);
        }

        let wl = Self {
            proto,
            bad_allowed,
            state: Mutex::new(state),
        };

        if !ai.erase.is_empty() {
            let rpt = howudoin::new()
                .label("Erasing blocks")
                .set_len(ai.erase.len() as u64);
            for &AttachPeb { pnum, ec } in &ai.erase {
                wl.state.lock().ec[pnum as usize] = ec;
                wl.erase(io, pnum, false)?;
                rpt.inc();
            }
            rpt.close();
        }

        {
            let mut state = wl.state.lock();
            state.acct.avail_pebs = state.acct.good_peb_count;
            state.acct.reserve(WL_RESERVED_PEBS)?;
        }

        Ok(wl)
    }

    /// Hand out an erased PEB
    pub fn get_peb(&self) -> Result<u32> {
        let pnum = self.state.lock().take_free().ok_or(Error::NoFreePebs)?;
        debug!("PEB {pnum} taken from the free pool");
        Ok(pnum)
    }

    /// Take back a PEB that no longer holds `vol_id:lnum`. It is erased right away (tortured first
    /// if it is suspected bad) and goes back to the free pool, or is marked bad.
    pub fn put_peb<N: Nand>(
        &self,
        io: &PebIo<N>,
        vol_id: u32,
        lnum: u32,
        pnum: u32,
        torture: bool,
    ) -> Result<()> {
        debug!("PEB {pnum} released by LEB {vol_id}:{lnum} (torture: {torture})");
        self.state.lock().scrub.retain(|&x| x != pnum);
        self.erase(io, pnum, torture)
    }

    fn erase<N: Nand>(&self, io: &PebIo<N>, pnum: u32, torture: bool) -> Result<()> {
        let ec = self.state.lock().ec[pnum as usize] + 1;

        let healthy = if torture { io.torture_peb(pnum)? } else { true };
        let result = if healthy {
            io.erase_peb(pnum, self.proto.ec(ec))
        } else {
            Err(NandError::EraseFailed(pnum).into())
        };

        match result {
            Ok(()) => {
                self.state.lock().add_free(pnum, ec);
                Ok(())
            }
            Err(Error::Nand(NandError::EraseFailed(_) | NandError::ProgramFailed { .. }))
                if self.bad_allowed =>
            {
                self.mark_bad(io, pnum)
            }
            Err(e) => Err(e),
        }
    }

    /// Retire a PEB, replacing it from the bad-PEB reserve (or, failing that, the available PEBs)
    fn mark_bad<N: Nand>(&self, io: &PebIo<N>, pnum: u32) -> Result<()> {
        let mut state = self.state.lock();
        let acct = &mut state.acct;

        if acct.beb_rsvd_pebs > 0 {
            acct.beb_rsvd_pebs -= 1;
            acct.rsvd_pebs -= 1;
        } else if acct.avail_pebs > 0 {
            acct.avail_pebs -= 1;
            warn!("bad-PEB reserve is exhausted, PEB {pnum} is replaced from available PEBs");
        } else {
            error!("no reserved or available PEBs left to replace bad PEB {pnum}");
            return Err(Error::NoReservedPebs(pnum));
        }

        acct.bad_peb_count += 1;
        acct.good_peb_count -= 1;
        drop(state);

        warn!("marking PEB {pnum} bad");
        io.mark_bad(pnum)
    }

    /// Queue a PEB that showed bit-flips for relocation
    pub fn schedule_scrub(&self, pnum: u32) {
        let mut state = self.state.lock();
        if !state.scrub.contains(&pnum) {
            warn!("scheduling PEB {pnum} for scrubbing");
            state.scrub.push_back(pnum);
        }
    }

    pub(crate) fn next_scrub(&self) -> Option<u32> {
        self.state.lock().scrub.pop_front()
    }

    pub fn scrub_pending(&self) -> usize {
        self.state.lock().scrub.len()
    }

    pub fn free_count(&self) -> usize {
        self.state.lock().free.values().map(|x| x.len()).sum()
    }

    /// The free PEBs with their erase counters, in PEB order
    pub fn free_pebs(&self) -> Vec<AttachPeb> {
        let state = self.state.lock();
        let mut free: Vec<_> = state
            .free
            .iter()
            .flat_map(|(&ec, pnums)| pnums.iter().map(move |&pnum| AttachPeb { pnum, ec }))
            .collect();
        free.sort_by_key(|x| x.pnum);
        free
    }

    /// The mean erase counter over all PEBs, rounded to nearest integer
    pub fn mean_ec(&self) -> u64 {
        let state = self.state.lock();
        let count = state.ec.len() as u64;
        let sum: u64 = state.ec.iter().sum();
        (sum + count / 2).checked_div(count).unwrap_or(1)
    }

    pub fn ec(&self, pnum: u32) -> u64 {
        self.state.lock().ec[pnum as usize]
    }

    pub fn accounting(&self) -> PebAccounting {
        self.state.lock().acct
    }

    pub(crate) fn accounting_mut(&self) -> MappedMutexGuard<'_, PebAccounting> {
        MutexGuard::map(self.state.lock(), |state| &mut state.acct)
    }
}
