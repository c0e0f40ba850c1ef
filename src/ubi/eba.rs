//! The EBA operations: reading, writing, changing and unmapping LEBs, and moving them between PEBs.
//!
//! Every operation locks its LEB in the lock tree, then holds the volume's table for as long as it
//! looks at or changes the LEB's entry. Table entries are only changed with `fm_eba` held shared,
//! so that [Ubi::fastmap_snapshot] sees every table in a consistent state.
//!
//! Anything that fails halfway through a write, leaving the flash in a state we can't vouch for,
//! switches the device to read-only mode.

use log::{debug, info, warn};
use parking_lot::RwLockReadGuard;

use super::config::Staleness;
use super::device::Ubi;
use super::error::{CopyError, Error, Result};
use super::headers::{data_crc, Vid, VolType};
use super::io::{align_up, VidHdrRead};
use super::table::{EbaTable, Volume};
use crate::nand::{Nand, ReadStatus};

impl<N: Nand> Ubi<N> {
    fn check_lnum(&self, vol: &Volume, table: &EbaTable, lnum: u32) -> Result<()> {
        match lnum < table.len() {
            true => Ok(()),
            false => Err(Error::LebOutOfRange {
                vol_id: vol.vol_id(),
                lnum,
            }),
        }
    }

    fn check_range(&self, vol: &Volume, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= vol.usable_leb_size() => Ok(()),
            _ => Err(Error::InvalidArgument(format!(
                "range {offset}+{len} exceeds LEB size {} of volume {}",
                vol.usable_leb_size(),
                vol.vol_id()
            ))),
        }
    }

    fn wrong_leb(&self, pnum: u32, vol: &Volume, lnum: u32, found: &Vid) -> Error {
        self.set_ro_mode();
        Error::WrongLeb {
            pnum,
            vol_id: vol.vol_id(),
            lnum,
            found_vol_id: found.vol_id,
            found_lnum: found.lnum,
        }
    }

    /// Look up the PEB `lnum` is mapped to, first verifying a mapping that came from a snapshot.
    ///
    /// A snapshot can't tell a mapped LEB from one whose unmap was interrupted, so the VID header
    /// is consulted once; if the mapping turns out stale, it is dropped and the PEB given back.
    /// The LEB must be locked.
    pub(crate) fn check_mapping(
        &self,
        vol: &Volume,
        table: &EbaTable,
        lnum: u32,
    ) -> Result<Option<u32>> {
        let Some(pnum) = table.get(lnum) else {
            return Ok(None);
        };
        if !table.needs_check(lnum) {
            return Ok(Some(pnum));
        }

        let hdr = self.io.probe_vid_hdr(pnum)?;
        if let Staleness::Stale { torture } = self.config.stale_policy.classify(&hdr) {
            // Readers share the LEB lock, so only the one that clears the entry frees the PEB
            let claimed = {
                let _fm = self.fm_eba.read_recursive();
                table.clear_if(lnum, pnum)
            };
            if claimed {
                warn!(
                    "LEB {}:{lnum} was unmapped but PEB {pnum} still held it, dropping it",
                    vol.vol_id()
                );
                self.wl.put_peb(&self.io, vol.vol_id(), lnum, pnum, torture)?;
            }
            return Ok(None);
        }

        if let VidHdrRead::Valid { vid, .. } = hdr {
            if (vid.vol_id, vid.lnum) != (vol.vol_id(), lnum) {
                return Err(self.wrong_leb(pnum, vol, lnum, &vid));
            }
        }

        table.set_checked(lnum, true);
        Ok(Some(pnum))
    }

    /// Is `lnum` mapped to a PEB?
    pub fn is_mapped(&self, vol_id: u32, lnum: u32) -> Result<bool> {
        let vol = self.volume(vol_id)?;
        let _leb = self.ltree.read_lock(vol_id, lnum);
        let table = vol.table();
        self.check_lnum(&vol, &table, lnum)?;
        Ok(self.check_mapping(&vol, &table, lnum)?.is_some())
    }

    /// Read `buf.len()` bytes of a LEB, starting at `offset`.
    ///
    /// Unmapped LEBs of dynamic volumes read as erased (0xFF). With `check` set, data covered by
    /// the CRC in the VID header (static LEBs and copies) is verified against it, and a mismatch
    /// is reported as [Error::Checksum].
    pub fn read(
        &self,
        vol_id: u32,
        lnum: u32,
        buf: &mut [u8],
        offset: usize,
        check: bool,
    ) -> Result<()> {
        let vol = self.volume(vol_id)?;
        self.check_range(&vol, offset, buf.len())?;

        let leb = self.ltree.read_lock(vol_id, lnum);
        let table = vol.table();
        self.check_lnum(&vol, &table, lnum)?;

        let Some(pnum) = self.check_mapping(&vol, &table, lnum)? else {
            if vol.vol_type() == VolType::Static {
                return Err(Error::StaticLebUnmapped { vol_id, lnum });
            }
            buf.fill(0xFF);
            return Ok(());
        };

        let mut check = check;
        let scrub = loop {
            match self.read_pnum(&vol, lnum, pnum, buf, offset, check)? {
                ReadStatus::Clean => break false,
                ReadStatus::Bitflips => break true,
                ReadStatus::Uncorrectable if vol.vol_type() == VolType::Static && !check => {
                    // The CRC may still vouch for the data
                    info!("force data checking on LEB {vol_id}:{lnum} (PEB {pnum})");
                    check = true;
                }
                ReadStatus::Uncorrectable => {
                    warn!("uncorrectable ECC error reading LEB {vol_id}:{lnum} from PEB {pnum}");
                    return Err(Error::Ecc(pnum));
                }
            }
        };

        drop(table);
        leb.unlock();

        if scrub {
            self.wl.schedule_scrub(pnum);
        }
        Ok(())
    }

    /// The mapped half of [Ubi::read]
    fn read_pnum(
        &self,
        vol: &Volume,
        lnum: u32,
        pnum: u32,
        buf: &mut [u8],
        offset: usize,
        check: bool,
    ) -> Result<ReadStatus> {
        let mut hdr_bitflips = false;
        let mut crc_vid = None;

        if check || vol.vol_type() == VolType::Static {
            let vid = match self.io.read_vid_hdr(pnum) {
                Ok((vid, bitflips)) => {
                    hdr_bitflips = bitflips;
                    vid
                }
                Err(e @ (Error::EmptyHeader(_) | Error::BadHeader(_))) => {
                    warn!(
                        "LEB {}:{lnum} is mapped to PEB {pnum}, which has no valid VID header",
                        vol.vol_id()
                    );
                    // A snapshot may legitimately be behind the flash; a full scan may not
                    if !self.fast_attach {
                        self.set_ro_mode();
                    }
                    return Err(e);
                }
                Err(e) => return Err(e),
            };

            if (vid.vol_id, vid.lnum) != (vol.vol_id(), lnum) {
                return Err(self.wrong_leb(pnum, vol, lnum, &vid));
            }
            if check && vid.has_data_crc() {
                crc_vid = Some(vid);
            }
        }

        let status = match crc_vid {
            None => self.io.read_data(pnum, offset, buf)?,
            Some(vid) => {
                let data_size = vid.data_size as usize;
                let mut data = vec![0; data_size.max(offset + buf.len())];
                let status = self.io.read_data(pnum, 0, &mut data)?;

                let calculated = data_crc(&data[..data_size]);
                if calculated != vid.data_crc {
                    warn!(
                        "CRC error on LEB {}:{lnum} (PEB {pnum}): calculated {calculated:#010x}, \
                         must be {:#010x}",
                        vol.vol_id(),
                        vid.data_crc
                    );
                    return Err(Error::Checksum {
                        vol_id: vol.vol_id(),
                        lnum,
                        calculated,
                        stored: vid.data_crc,
                    });
                }

                buf.copy_from_slice(&data[offset..offset + buf.len()]);

                // The data is good, whatever ECC thought about it
                status.min(ReadStatus::Bitflips)
            }
        };

        Ok(match hdr_bitflips {
            true => status.max(ReadStatus::Bitflips),
            false => status,
        })
    }

    /// Run `attempt` until it succeeds, fails for a reason other than a bad PEB, or the retry
    /// budget is spent. Each attempt is expected to use a fresh PEB.
    fn retry_writes(
        &self,
        vol_id: u32,
        lnum: u32,
        mut attempt: impl FnMut(u32) -> Result<()>,
    ) -> Result<()> {
        let mut tries = 0;
        loop {
            match attempt(tries) {
                Err(e)
                    if e.is_write_failure()
                        && self.config.bad_allowed
                        && tries < self.config.io_retries =>
                {
                    tries += 1;
                    warn!(
                        "write to LEB {vol_id}:{lnum} failed ({e}), trying another PEB ({tries}/{})",
                        self.config.io_retries
                    );
                }
                result => return result,
            }
        }
    }

    /// Write `vid` (with a fresh sequence number) and `data` at `offset` to a new PEB, then point
    /// the table at it and give back the PEB previously mapped, if any.
    fn try_write_vid_and_data(
        &self,
        vol: &Volume,
        table: &EbaTable,
        lnum: u32,
        vid: Vid,
        offset: usize,
        data: &[u8],
    ) -> Result<()> {
        let vol_id = vol.vol_id();
        let pnum = self.wl.get_peb()?;
        let old_pnum = table.get(lnum);
        let vid = vid.sqnum(self.next_sqnum());

        debug!(
            "writing LEB {vol_id}:{lnum} to PEB {pnum}, sqnum {}",
            vid.sqnum
        );
        let written = self
            .io
            .write_vid_hdr(pnum, &vid)
            .and_then(|()| self.io.write_data(pnum, offset, data));

        if let Err(e) = written {
            warn!("failed to write LEB {vol_id}:{lnum} to PEB {pnum}: {e}");
            self.wl.put_peb(&self.io, vol_id, lnum, pnum, true)?;
            return Err(e);
        }

        {
            let _fm = self.fm_eba.read_recursive();
            table.set(lnum, pnum);
        }

        if let Some(old_pnum) = old_pnum {
            self.wl.put_peb(&self.io, vol_id, lnum, old_pnum, false)?;
        }
        Ok(())
    }

    /// Write `buf` to a dynamic LEB at `offset`, which must be aligned to the minimum I/O size.
    ///
    /// Writing nothing to an unmapped LEB leaves it unmapped; use [Ubi::map] to map an empty PEB.
    pub fn write_dynamic(&self, vol_id: u32, lnum: u32, buf: &[u8], offset: usize) -> Result<()> {
        self.check_writable()?;

        let vol = self.volume(vol_id)?;
        if vol.vol_type() != VolType::Dynamic {
            return Err(Error::StaticVolume(vol_id));
        }
        self.check_range(&vol, offset, buf.len())?;
        if offset % self.io.min_io_size() != 0 {
            return Err(Error::InvalidArgument(format!(
                "offset {offset} is not aligned to {}",
                self.io.min_io_size()
            )));
        }

        let _leb = self.ltree.write_lock(vol_id, lnum);
        let table = vol.table();
        self.check_lnum(&vol, &table, lnum)?;

        if let Some(pnum) = self.check_mapping(&vol, &table, lnum)? {
            debug!(
                "write {} bytes at offset {offset} of LEB {vol_id}:{lnum}, PEB {pnum}",
                buf.len()
            );

            let result = match self.io.write_data(pnum, offset, buf) {
                Err(e) if e.is_write_failure() && self.config.bad_allowed => {
                    warn!("failed to write data to PEB {pnum}: {e}, recovering");
                    self.recover_peb(&vol, &table, lnum, pnum, offset, buf)
                }
                result => result,
            };
            return self.ro_on_fatal(result);
        }

        if buf.is_empty() {
            return Ok(());
        }

        let vid = Vid::for_leb(VolType::Dynamic, vol_id, lnum, vol.data_pad());
        let result = self.retry_writes(vol_id, lnum, |_| {
            self.try_write_vid_and_data(&vol, &table, lnum, vid, offset, buf)
        });
        self.ro_on_fatal(result)
    }

    /// A write to a mapped PEB failed: move what it holds, plus the new data, to another PEB.
    fn recover_peb(
        &self,
        vol: &Volume,
        table: &EbaTable,
        lnum: u32,
        pnum: u32,
        offset: usize,
        buf: &[u8],
    ) -> Result<()> {
        self.retry_writes(vol.vol_id(), lnum, |_| {
            self.try_recover_peb(vol, table, lnum, pnum, offset, buf)
        })?;

        info!(
            "data of LEB {}:{lnum} recovered from PEB {pnum}",
            vol.vol_id()
        );
        Ok(())
    }

    fn try_recover_peb(
        &self,
        vol: &Volume,
        table: &EbaTable,
        lnum: u32,
        pnum: u32,
        offset: usize,
        buf: &[u8],
    ) -> Result<()> {
        let vol_id = vol.vol_id();
        let new_pnum = self.wl.get_peb()?;

        let copied = {
            let mut peb_buf = self.peb_buf.lock();
            let data = &mut peb_buf[..offset + buf.len()];
            self.copy_with_splice(pnum, new_pnum, data, offset, buf)
        };

        if let Err(e) = copied {
            let torture = e.is_write_failure();
            self.wl.put_peb(&self.io, vol_id, lnum, new_pnum, torture)?;
            return Err(e);
        }

        {
            let _fm = self.fm_eba.read_recursive();
            table.set(lnum, new_pnum);
        }

        // The old PEB just failed a write
        self.wl.put_peb(&self.io, vol_id, lnum, pnum, true)
    }

    /// Fill `data` with the first `offset` bytes of `pnum` followed by `buf`, and write it as a
    /// copy to `new_pnum`.
    fn copy_with_splice(
        &self,
        pnum: u32,
        new_pnum: u32,
        data: &mut [u8],
        offset: usize,
        buf: &[u8],
    ) -> Result<()> {
        let (vid, _) = self.io.read_vid_hdr(pnum)?;

        if self.io.read_data(pnum, 0, &mut data[..offset])? == ReadStatus::Uncorrectable {
            return Err(Error::Ecc(pnum));
        }
        data[offset..].copy_from_slice(buf);

        let vid = vid.copy_of(data).sqnum(self.next_sqnum());
        self.io.write_vid_hdr(new_pnum, &vid)?;
        self.io.write_data(new_pnum, 0, data)
    }

    /// Write one LEB of a static volume of `used_ebs` LEBs. Only the first `len` bytes of `buf`
    /// are data (and covered by the CRC); the LEB must not have been written yet.
    ///
    /// All but the last LEB must hold a multiple of the minimum I/O size. `buf` may carry padding
    /// beyond `len`, of which only what is needed to fill the last I/O unit is written.
    pub fn write_static(
        &self,
        vol_id: u32,
        lnum: u32,
        buf: &[u8],
        len: usize,
        used_ebs: u32,
    ) -> Result<()> {
        self.check_writable()?;

        let vol = self.volume(vol_id)?;
        if vol.vol_type() != VolType::Static {
            return Err(Error::InvalidArgument(format!(
                "volume {vol_id} is not a static volume"
            )));
        }
        if len > buf.len() {
            return Err(Error::InvalidArgument(format!(
                "{len} bytes of data declared, but only {} given",
                buf.len()
            )));
        }
        self.check_range(&vol, 0, len)?;

        let _leb = self.ltree.write_lock(vol_id, lnum);
        let table = vol.table();
        self.check_lnum(&vol, &table, lnum)?;

        if used_ebs == 0 || lnum >= used_ebs || used_ebs > table.len() {
            return Err(Error::InvalidArgument(format!(
                "LEB {lnum} cannot be part of {used_ebs} used LEBs of volume {vol_id}"
            )));
        }
        if lnum != used_ebs - 1 && len % self.io.min_io_size() != 0 {
            return Err(Error::InvalidArgument(format!(
                "LEB {vol_id}:{lnum} is not the last one, so {len} bytes must be aligned to {}",
                self.io.min_io_size()
            )));
        }
        if self.check_mapping(&vol, &table, lnum)?.is_some() {
            return Err(Error::StaticLebMapped { vol_id, lnum });
        }

        let mut vid = Vid::for_leb(VolType::Static, vol_id, lnum, vol.data_pad());
        vid.data_size = len as u32;
        vid.used_ebs = used_ebs;
        vid.data_crc = data_crc(&buf[..len]);

        let data = &buf[..align_up(len, self.io.min_io_size()).min(buf.len())];
        let result = self.retry_writes(vol_id, lnum, |_| {
            self.try_write_vid_and_data(&vol, &table, lnum, vid, 0, data)
        });
        self.ro_on_fatal(result)
    }

    /// Replace the whole content of a LEB so that, even across a power cut, it holds either the
    /// old data or `buf`, never a mix.
    pub fn atomic_change(&self, vol_id: u32, lnum: u32, buf: &[u8]) -> Result<()> {
        self.check_writable()?;
        let vol = self.volume(vol_id)?;
        if vol.vol_type() == VolType::Static {
            return Err(Error::StaticVolume(vol_id));
        }
        if buf.is_empty() {
            self.unmap(vol_id, lnum)?;
            return self.write_dynamic(vol_id, lnum, buf, 0);
        }

        self.check_range(&vol, 0, buf.len())?;

        let _alc = self.alc_mutex.lock();
        let _leb = self.ltree.write_lock(vol_id, lnum);
        let table = vol.table();
        self.check_lnum(&vol, &table, lnum)?;
        self.check_mapping(&vol, &table, lnum)?;

        let vid = Vid::for_leb(VolType::Dynamic, vol_id, lnum, vol.data_pad()).copy_of(buf);
        let result = self.retry_writes(vol_id, lnum, |_| {
            self.try_write_vid_and_data(&vol, &table, lnum, vid, 0, buf)
        });
        self.ro_on_fatal(result)
    }

    /// Map an unmapped LEB of a dynamic volume to a PEB holding no data
    pub fn map(&self, vol_id: u32, lnum: u32) -> Result<()> {
        self.check_writable()?;
        let vol = self.volume(vol_id)?;
        if vol.vol_type() != VolType::Dynamic {
            return Err(Error::StaticVolume(vol_id));
        }

        let _leb = self.ltree.write_lock(vol_id, lnum);
        let table = vol.table();
        self.check_lnum(&vol, &table, lnum)?;
        if self.check_mapping(&vol, &table, lnum)?.is_some() {
            return Err(Error::AlreadyMapped { vol_id, lnum });
        }

        let vid = Vid::for_leb(VolType::Dynamic, vol_id, lnum, vol.data_pad());
        let result = self.retry_writes(vol_id, lnum, |_| {
            self.try_write_vid_and_data(&vol, &table, lnum, vid, 0, &[])
        });
        self.ro_on_fatal(result)
    }

    /// Unmap a LEB, giving its PEB back to be erased. Unmapping an unmapped LEB does nothing.
    pub fn unmap(&self, vol_id: u32, lnum: u32) -> Result<()> {
        self.check_writable()?;
        let vol = self.volume(vol_id)?;
        self.unmap_leb(&vol, lnum)
    }

    pub(crate) fn unmap_leb(&self, vol: &Volume, lnum: u32) -> Result<()> {
        let vol_id = vol.vol_id();
        let _leb = self.ltree.write_lock(vol_id, lnum);
        let table = vol.table();
        self.check_lnum(vol, &table, lnum)?;

        let Some(pnum) = self.check_mapping(vol, &table, lnum)? else {
            return Ok(());
        };

        debug!("unmap LEB {vol_id}:{lnum}, PEB {pnum}");
        {
            let _fm = self.fm_eba.read_recursive();
            table.clear(lnum);
        }
        self.wl.put_peb(&self.io, vol_id, lnum, pnum, false)
    }

    /// Move the LEB described by `vid` from PEB `from` to the erased PEB `to`.
    ///
    /// `fm` must be a guard on this device's `fm_eba` lock. This never blocks on the LEB lock; the
    /// error tells the caller what became of the move and what to do with both PEBs.
    pub fn copy_leb(
        &self,
        from: u32,
        to: u32,
        vid: &Vid,
        fm: &RwLockReadGuard<'_, ()>,
    ) -> Result<(), CopyError> {
        debug_assert!(std::ptr::eq(RwLockReadGuard::rwlock(fm), &self.fm_eba));
        let (vol_id, lnum) = (vid.vol_id, vid.lnum);

        let Some(vol) = self.volumes.read().get(&vol_id).cloned() else {
            debug!("volume {vol_id} was removed, not moving LEB {lnum}");
            return Err(CopyError::CancelRace);
        };

        let Some(_leb) = self.ltree.try_write_lock(vol_id, lnum) else {
            debug!("LEB {vol_id}:{lnum} is locked, cannot move it now");
            return Err(CopyError::Retry);
        };

        let table = vol.table();
        if lnum >= table.len() || table.get(lnum) != Some(from) {
            debug!("LEB {vol_id}:{lnum} is no longer mapped to PEB {from}, not moving it");
            return Err(CopyError::CancelRace);
        }

        let aldata_size = match vol.vol_type() {
            VolType::Static => align_up(vid.data_size as usize, self.io.min_io_size()),
            VolType::Dynamic => vol.usable_leb_size(),
        }
        .min(vol.usable_leb_size());

        let mut peb_buf = self.peb_buf.lock();
        let data = &mut peb_buf[..aldata_size];

        match self.io.read_data(from, 0, data)? {
            ReadStatus::Clean | ReadStatus::Bitflips => (),
            ReadStatus::Uncorrectable => {
                warn!("uncorrectable ECC error reading PEB {from} to move LEB {vol_id}:{lnum}");
                return Err(CopyError::SourceRead);
            }
        }

        // Trailing 0xFF bytes of a dynamic LEB may be written to later; don't commit them
        let data_size = match vol.vol_type() {
            VolType::Static => (vid.data_size as usize).min(aldata_size),
            VolType::Dynamic => self.io.calc_data_len(data).min(aldata_size),
        };

        let mut vid = *vid;
        if data_size > 0 {
            vid = vid.copy_of(&data[..data_size]);
        }
        let vid = vid.sqnum(self.next_sqnum());

        match self.io.write_vid_hdr(to, &vid) {
            Ok(()) => (),
            Err(e) if e.is_write_failure() => return Err(CopyError::TargetWrite),
            Err(e) => return Err(e.into()),
        }

        match self.io.probe_vid_hdr(to)? {
            VidHdrRead::Valid {
                vid: written,
                bitflips: false,
            } if written == vid => (),
            VidHdrRead::Valid { bitflips: true, .. } => {
                warn!("bit-flips in the VID header just written to PEB {to}");
                return Err(CopyError::TargetBitflips);
            }
            _ => {
                warn!("VID header just written to PEB {to} does not read back");
                return Err(CopyError::TargetRead);
            }
        }

        match self.io.write_data(to, 0, &data[..data_size]) {
            Ok(()) => (),
            Err(e) if e.is_write_failure() => return Err(CopyError::TargetWrite),
            Err(e) => return Err(e.into()),
        }
        drop(peb_buf);

        table.set(lnum, to);
        Ok(())
    }
}
