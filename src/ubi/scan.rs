//! This module contains code to scan NAND blocks and determine their contents (per UBI), and to
//! turn the result into the attach information the EBA layer is initialized from.

use std::collections::BTreeMap;

use log::{info, warn};

use super::error::{Error, Result};
use super::headers::*;
use super::io::PebIo;
use crate::nand::{Nand, NandBlock, PageUtil, ReadStatus};

/// These are the states that a given block may be detected in
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum BlockContent {
    /// The block is bad, and cannot be accessed
    Bad,

    /// The block is fully erased, perhaps because UBI has never used it
    Erased,

    /// The block is erased, but has a UBI EC header that should be preserved
    EcErased(Ec),

    /// The block is in normal use, with a UBI EC header that should be preserved
    EcData(Ec, Option<Vid>),

    /// The block is in some other (invalid, per UBI) state, and needs to be erased
    Garbage,
}

impl BlockContent {
    /// Read a NAND block and characterize its content
    fn scan_block<B: NandBlock>(block: &B) -> Result<Self> {
        // How many pages do we read at a time? A higher number helps in high-latency situations.
        const PAGE_CHUNKS: u32 = 4;

        let mut buf = vec![0; block.page_size() * PAGE_CHUNKS as usize];

        let mut echdr: Option<Ec> = None;
        for start_page in (0..block.page_count()).step_by(PAGE_CHUNKS as usize) {
            if echdr.is_some() {
                // Optimization: If we have found an EC header, but we're still looping, it means
                // the first few pages were [EC, erased, ...], so we can probably just assume the
                // rest of the pages are erased.
                break;
            }

            // Clip the buffer down to the size of the page(s) read on this iteration
            let end_page = std::cmp::min(block.page_count(), start_page + PAGE_CHUNKS);
            let buf = &mut buf[..block.page_size() * (end_page - start_page) as usize];

            // Read pages `start_page..end_page`; an ECC failure simply makes the headers unreadable
            let status = block.read(start_page, buf)?;

            for (page, page_bytes) in
                (start_page..end_page).zip(buf.chunks_exact(block.page_size()))
            {
                if page == 0 && status != ReadStatus::Uncorrectable {
                    if let Some(hdr) = Ec::decode(page_bytes) {
                        echdr = Some(hdr);
                        continue;
                    }
                }

                // Not first page, or first page doesn't contain a UBI header, so this loop is now
                // finding out if the block is fully-erased.
                if !page_bytes.is_erased() {
                    let vid = match page {
                        1 => Vid::decode(page_bytes),
                        _ => None,
                    };

                    // Non-erased page found means this block is in use
                    return Ok(echdr.map_or(Self::Garbage, |x| Self::EcData(x, vid)));
                }
            }
        }

        // If we got out of the loop, we didn't encounter any data pages, so it's erased
        Ok(echdr.map_or(Self::Erased, Self::EcErased))
    }
}

/// The (E)rase(b)lock (t)able. A map of the state of the NAND flash as determined by
/// [scan_blocks].
pub type Ebt = Box<[BlockContent]>;

/// Read all blocks of the NAND (only as much as necessary to determine content), return the [Ebt]
pub fn scan_blocks<N: Nand>(nand: &N) -> Result<Ebt> {
    let block_count = nand.get_layout().blocks;
    let rpt = howudoin::new()
        .label("Scanning blocks")
        .set_len(u64::from(block_count));

    let mut ebt = Vec::with_capacity(block_count as usize);
    for n in 0..block_count {
        let content = match nand.block(n)? {
            None => BlockContent::Bad,
            Some(block) => BlockContent::scan_block(&block)?,
        };
        rpt.inc();
        ebt.push(content);
    }

    rpt.close();

    Ok(ebt.into())
}

/// A PEB known at attach time, with its erase counter
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AttachPeb {
    pub pnum: u32,
    pub ec: u64,
}

/// A PEB found holding a LEB
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AttachLeb {
    pub pnum: u32,
    pub ec: u64,
    pub sqnum: u64,
    pub copy_flag: bool,
}

/// Everything found about one volume
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct AttachVolume {
    pub vol_type: VolType,

    /// The LEBs found, keyed by LEB number
    pub lebs: BTreeMap<u32, AttachLeb>,
}

/// The result of attaching: which PEB holds which LEB, and what the remaining PEBs are good for
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct AttachInfo {
    pub volumes: BTreeMap<u32, AttachVolume>,

    /// Erased PEBs carrying a valid EC header, ready for use
    pub free: Vec<AttachPeb>,

    /// PEBs that must be erased before they can be used
    pub erase: Vec<AttachPeb>,

    pub bad_peb_count: u32,

    /// The highest sequence number seen in any VID header
    pub max_sqnum: u64,

    /// The mean erase counter, used for PEBs whose own counter was lost
    pub mean_ec: u64,

    /// Set when the mapping was not taken from the VID headers themselves, so that every mapping
    /// still has to be verified when first used
    pub fast: bool,
}

impl AttachInfo {
    /// Scan every PEB of the device and build the attach information from the VID headers
    pub fn scan<N: Nand>(io: &PebIo<N>) -> Result<Self> {
        let ebt = scan_blocks(io.nand())?;

        let mut ai = AttachInfo {
            mean_ec: mean_ec(ebt.iter()),
            ..Default::default()
        };

        for (pnum, content) in ebt.iter().enumerate() {
            let pnum = pnum as u32;
            match *content {
                BlockContent::Bad => ai.bad_peb_count += 1,
                BlockContent::EcErased(ec) => ai.free.push(AttachPeb { pnum, ec: ec.ec }),
                BlockContent::EcData(ec, Some(vid)) => ai.add_leb(io, pnum, ec.ec, vid)?,
                BlockContent::EcData(ec, None) => ai.erase.push(AttachPeb { pnum, ec: ec.ec }),
                BlockContent::Erased | BlockContent::Garbage => ai.erase.push(AttachPeb {
                    pnum,
                    ec: ai.mean_ec,
                }),
            }
        }

        info!(
            "scanned {} PEBs: {} volumes, {} free, {} to erase, {} bad, max sqnum {}",
            ebt.len(),
            ai.volumes.len(),
            ai.free.len(),
            ai.erase.len(),
            ai.bad_peb_count,
            ai.max_sqnum
        );

        Ok(ai)
    }

    /// A snapshot only knows which PEBs were free when it was taken. Look at each of them again,
    /// picking up LEBs written since then.
    pub fn rescan_free<N: Nand>(&mut self, io: &PebIo<N>) -> Result<()> {
        for AttachPeb { pnum, ec } in std::mem::take(&mut self.free) {
            let content = match io.nand().block(pnum)? {
                None => BlockContent::Bad,
                Some(block) => BlockContent::scan_block(&block)?,
            };

            match content {
                BlockContent::Bad => self.bad_peb_count += 1,
                BlockContent::EcErased(hdr) => self.free.push(AttachPeb { pnum, ec: hdr.ec }),
                BlockContent::EcData(hdr, Some(vid)) => self.add_leb(io, pnum, hdr.ec, vid)?,
                BlockContent::EcData(..) | BlockContent::Erased | BlockContent::Garbage => {
                    self.erase.push(AttachPeb { pnum, ec })
                }
            }
        }

        Ok(())
    }

    /// Record that PEB `pnum` holds the LEB described by `vid`, resolving a collision with a PEB
    /// found earlier for the same LEB
    fn add_leb<N: Nand>(&mut self, io: &PebIo<N>, pnum: u32, ec: u64, vid: Vid) -> Result<()> {
        self.max_sqnum = self.max_sqnum.max(vid.sqnum);

        let candidate = AttachLeb {
            pnum,
            ec,
            sqnum: vid.sqnum,
            copy_flag: vid.copy_flag,
        };

        let av = self
            .volumes
            .entry(vid.vol_id)
            .or_insert_with(|| AttachVolume {
                vol_type: vid.vol_type,
                ..Default::default()
            });

        let existing = match av.lebs.get(&vid.lnum) {
            None => {
                av.lebs.insert(vid.lnum, candidate);
                return Ok(());
            }
            Some(&existing) => existing,
        };

        let (older, newer) = match existing.sqnum.cmp(&candidate.sqnum) {
            std::cmp::Ordering::Less => (existing, candidate),
            std::cmp::Ordering::Greater => (candidate, existing),
            std::cmp::Ordering::Equal => {
                return Err(Error::InvalidArgument(format!(
                    "PEBs {} and {} both carry sqnum {} for LEB {}:{}",
                    existing.pnum, candidate.pnum, candidate.sqnum, vid.vol_id, vid.lnum
                )))
            }
        };

        let (keep, drop) = if newer_copy_is_intact(io, &newer)? {
            (newer, older)
        } else {
            warn!(
                "PEB {} has a broken copy of LEB {}:{}, using older PEB {}",
                newer.pnum, vid.vol_id, vid.lnum, older.pnum
            );
            (older, newer)
        };

        av.lebs.insert(vid.lnum, keep);
        self.erase.push(AttachPeb {
            pnum: drop.pnum,
            ec: drop.ec,
        });
        Ok(())
    }
}

/// A newer PEB wins a collision unless it is a copy whose data did not fully make it to flash
fn newer_copy_is_intact<N: Nand>(io: &PebIo<N>, newer: &AttachLeb) -> Result<bool> {
    if !newer.copy_flag {
        return Ok(true);
    }

    let (vid, _) = io.read_vid_hdr(newer.pnum)?;
    if vid.data_size == 0 {
        return Ok(true);
    }

    let mut data = vec![0; vid.data_size as usize];
    if io.read_data(newer.pnum, 0, &mut data)? == ReadStatus::Uncorrectable {
        return Ok(false);
    }

    Ok(data_crc(&data) == vid.data_crc)
}

/// Compute mean EC value over the blocks that have one, rounded to nearest integer, or 1 if there
/// are none
fn mean_ec<'a>(blocks: impl Iterator<Item = &'a BlockContent>) -> u64 {
    let mut ec_sum = 0;
    let mut ec_count = 0;

    for content in blocks {
        if let BlockContent::EcErased(x) | BlockContent::EcData(x, _) = content {
            ec_sum += x.ec;
            ec_count += 1;
        }
    }

    (ec_sum + ec_count / 2).checked_div(ec_count).unwrap_or(1)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::{NandLayout, SimNand};

    const TEST_LAYOUT: NandLayout = NandLayout {
        blocks: 16,
        pages_per_block: 16,
        bytes_per_page: 128,
    };

    #[test]
    fn test_scan() -> Result<()> {
        let nand = SimNand::new(TEST_LAYOUT);

        // Confirm that, on a fresh NAND, every block scans as "erased"
        let blocks = scan_blocks(&nand)?;
        assert_eq!(blocks.len(), nand.get_layout().blocks as usize);
        assert!(blocks.iter().all(|&x| x == BlockContent::Erased));

        // Now modify several blocks for various states:
        use BlockContent::*;
        let desired_content = [
            Bad,
            Erased,
            EcErased(Default::default()),
            EcData(Default::default(), None),
            Garbage,
            EcErased(Default::default()),
            Erased,
            Garbage,
            EcData(Default::default(), Some(Default::default())),
            Erased,
            Bad,
        ];

        let mut buf = vec![0xFF; nand.get_layout().bytes_per_page];
        for (i, content) in desired_content.iter().enumerate() {
            let mut block = nand.block(i as u32)?.unwrap();
            match content {
                Bad => block.mark_bad()?,
                Erased => block.erase()?,
                EcErased(ec) => {
                    ec.encode(&mut buf)?;
                    block.program(0, &buf)?;
                }
                EcData(ec, vid) => {
                    ec.encode(&mut buf)?;
                    block.program(0, &buf)?;
                    if let Some(vid) = vid {
                        buf.fill(0xFF);
                        vid.encode(&mut buf)?;
                        block.program(1, &buf)?;
                    }
                    buf.fill(0xAA);
                    block.program(i as u32, &buf)?;
                }
                Garbage => {
                    buf.fill(0xAA);
                    block.program(i as u32, &buf)?;
                }
            }
            buf.fill(0xFF);
        }

        // Now scan it again
        let blocks = scan_blocks(&nand)?;
        assert_eq!(blocks[..desired_content.len()], desired_content);

        Ok(())
    }

    fn write_leb(io: &PebIo<SimNand>, pnum: u32, vid: Vid, data: &[u8]) -> Result<()> {
        io.erase_peb(pnum, Ec::default().ec(pnum as u64))?;
        io.write_vid_hdr(pnum, &vid)?;
        io.write_data(pnum, 0, data)
    }

    #[test]
    fn test_attach_info() -> Result<()> {
        let io = PebIo::new(SimNand::new(TEST_LAYOUT))?;
        io.erase_peb(0, Ec::default().ec(4))?;
        io.nand().block(1)?.unwrap().mark_bad()?;

        let vid = Vid::for_leb(VolType::Dynamic, 3, 7, 0);
        write_leb(&io, 2, vid.sqnum(10), &[1; 16])?;
        write_leb(&io, 3, Vid::for_leb(VolType::Static, 4, 0, 0).sqnum(11), &[2; 16])?;

        let ai = AttachInfo::scan(&io)?;
        assert_eq!(ai.bad_peb_count, 1);
        assert_eq!(ai.max_sqnum, 11);
        assert_eq!(ai.free, [AttachPeb { pnum: 0, ec: 4 }]);
        assert_eq!(ai.erase.len(), 12);
        assert_eq!(ai.volumes[&3].lebs[&7].pnum, 2);
        assert_eq!(ai.volumes[&4].vol_type, VolType::Static);
        assert!(!ai.fast);

        Ok(())
    }

    #[test]
    fn test_newest_copy_wins() -> Result<()> {
        let io = PebIo::new(SimNand::new(TEST_LAYOUT))?;
        let vid = Vid::for_leb(VolType::Dynamic, 0, 1, 0);

        write_leb(&io, 5, vid.sqnum(1), &[1; 16])?;
        write_leb(&io, 6, vid.copy_of(&[1; 16]).sqnum(2), &[1; 16])?;

        let ai = AttachInfo::scan(&io)?;
        assert_eq!(ai.volumes[&0].lebs[&1].pnum, 6);
        assert!(ai.erase.contains(&AttachPeb { pnum: 5, ec: 5 }));

        Ok(())
    }

    #[test]
    fn test_broken_copy_loses() -> Result<()> {
        let io = PebIo::new(SimNand::new(TEST_LAYOUT))?;
        let vid = Vid::for_leb(VolType::Dynamic, 0, 1, 0);

        // The copy claims 16 bytes of 0x01 but only garbage made it to flash
        write_leb(&io, 6, vid.copy_of(&[1; 16]).sqnum(2), &[9; 16])?;
        write_leb(&io, 5, vid.sqnum(1), &[1; 16])?;

        let ai = AttachInfo::scan(&io)?;
        assert_eq!(ai.volumes[&0].lebs[&1].pnum, 5);
        assert!(ai.erase.contains(&AttachPeb { pnum: 6, ec: 6 }));

        Ok(())
    }
}
