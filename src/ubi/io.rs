//! Physical eraseblock I/O: EC and VID headers, and the LEB data area that follows them.
//!
//! Every PEB is laid out page-wise:
//!
//! ```text
//! +---------+---------+----------------------------------------+
//! | page 0  | page 1  | pages 2.. (LEB data, `leb_size` bytes) |
//! | EC hdr  | VID hdr |                                        |
//! +---------+---------+----------------------------------------+
//! ```
//!
//! One page is the minimum I/O unit: data writes start on a page boundary and are padded to a
//! whole number of pages with 0xFF (which the medium treats as "not programmed").

use super::error::{Error, Result};
use super::headers::{Ec, Vid};
use crate::nand::{Nand, NandBlock, NandError, PageUtil, ReadStatus};

const EC_HDR_PAGE: u32 = 0;
const VID_HDR_PAGE: u32 = 1;
const DATA_PAGE: u32 = 2;

/// Test patterns written across a PEB while torturing it
const TORTURE_PATTERNS: [u8; 3] = [0xA5, 0x5A, 0x00];

/// What was found in the VID header area of a PEB
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum VidHdrRead {
    /// A well-formed header
    Valid { vid: Vid, bitflips: bool },

    /// The header area is erased
    Blank { bitflips: bool },

    /// Something is there, but it is not a valid header; `ecc` is set if the read also failed ECC
    Corrupt { ecc: bool },
}

/// Round `n` up to a multiple of `align`
pub fn align_up(n: usize, align: usize) -> usize {
    n.div_ceil(align) * align
}

/// Header and data I/O on the PEBs of a [Nand]
#[derive(Debug)]
pub struct PebIo<N> {
    nand: N,
    peb_count: u32,
    page_size: usize,
    leb_size: usize,
}

impl<N: Nand> PebIo<N> {
    pub fn new(nand: N) -> Result<Self> {
        let layout = nand.get_layout();
        if layout.pages_per_block <= DATA_PAGE {
            return Err(Error::InvalidArgument(format!(
                "{} pages per block leave no room for data",
                layout.pages_per_block
            )));
        }
        if i32::try_from(layout.blocks).is_err() {
            return Err(Error::InvalidArgument(format!(
                "{} blocks is too many to map",
                layout.blocks
            )));
        }

        Ok(Self {
            nand,
            peb_count: layout.blocks,
            page_size: layout.bytes_per_page,
            leb_size: layout.bytes_per_page * (layout.pages_per_block - DATA_PAGE) as usize,
        })
    }

    /// Give the underlying NAND back
    pub fn into_inner(self) -> N {
        self.nand
    }

    pub fn nand(&self) -> &N {
        &self.nand
    }

    pub fn peb_count(&self) -> u32 {
        self.peb_count
    }

    /// The size of the data area of every PEB
    pub fn leb_size(&self) -> usize {
        self.leb_size
    }

    pub fn min_io_size(&self) -> usize {
        self.page_size
    }

    fn block(&self, pnum: u32) -> Result<N::Block<'_>> {
        Ok(self.nand.block(pnum)?.ok_or(NandError::BadBlock(pnum))?)
    }

    fn check_range(&self, pnum: u32, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.leb_size => Ok(()),
            _ => Err(Error::InvalidArgument(format!(
                "PEB {pnum}: range {offset}+{len} exceeds LEB size {}",
                self.leb_size
            ))),
        }
    }

    pub fn is_bad(&self, pnum: u32) -> Result<bool> {
        Ok(self.nand.block(pnum)?.is_none())
    }

    pub fn mark_bad(&self, pnum: u32) -> Result<()> {
        Ok(self.block(pnum)?.mark_bad()?)
    }

    /// Read the EC header, if the PEB has a valid one
    pub fn read_ec_hdr(&self, pnum: u32) -> Result<Option<Ec>> {
        let block = self.block(pnum)?;
        let mut page = vec![0; self.page_size];
        if block.read(EC_HDR_PAGE, &mut page)? == ReadStatus::Uncorrectable {
            return Ok(None);
        }
        Ok(Ec::decode(&page))
    }

    /// Erase a PEB and write a fresh EC header to it
    pub fn erase_peb(&self, pnum: u32, ec: Ec) -> Result<()> {
        let mut block = self.block(pnum)?;
        block.erase()?;

        let mut page = vec![0xFF; self.page_size];
        ec.encode(&mut page)?;
        block.program(EC_HDR_PAGE, &page)?;
        Ok(())
    }

    /// Read the VID header area and characterize what is there
    pub fn probe_vid_hdr(&self, pnum: u32) -> Result<VidHdrRead> {
        let block = self.block(pnum)?;
        let mut page = vec![0; self.page_size];
        let status = block.read(VID_HDR_PAGE, &mut page)?;

        Ok(match (Vid::decode(&page), status) {
            (Some(vid), ReadStatus::Clean) => VidHdrRead::Valid {
                vid,
                bitflips: false,
            },
            (Some(vid), _) => VidHdrRead::Valid {
                vid,
                bitflips: true,
            },
            (None, status) if page.is_erased() => VidHdrRead::Blank {
                bitflips: status != ReadStatus::Clean,
            },
            (None, status) => VidHdrRead::Corrupt {
                ecc: status == ReadStatus::Uncorrectable,
            },
        })
    }

    /// Read the VID header, which must be present; also returns whether bit-flips were corrected
    pub fn read_vid_hdr(&self, pnum: u32) -> Result<(Vid, bool)> {
        match self.probe_vid_hdr(pnum)? {
            VidHdrRead::Valid { vid, bitflips } => Ok((vid, bitflips)),
            VidHdrRead::Blank { .. } => Err(Error::EmptyHeader(pnum)),
            VidHdrRead::Corrupt { .. } => Err(Error::BadHeader(pnum)),
        }
    }

    pub fn write_vid_hdr(&self, pnum: u32, vid: &Vid) -> Result<()> {
        let mut page = vec![0xFF; self.page_size];
        vid.encode(&mut page)?;
        self.block(pnum)?.program(VID_HDR_PAGE, &page)?;
        Ok(())
    }

    /// Read `buf.len()` bytes of the data area, starting at any `offset`
    pub fn read_data(&self, pnum: u32, offset: usize, buf: &mut [u8]) -> Result<ReadStatus> {
        self.check_range(pnum, offset, buf.len())?;
        if buf.is_empty() {
            return Ok(ReadStatus::Clean);
        }

        let first_page = offset / self.page_size;
        let end = align_up(offset + buf.len(), self.page_size);
        let mut pages = vec![0; end - first_page * self.page_size];

        let status = self
            .block(pnum)?
            .read(DATA_PAGE + first_page as u32, &mut pages)?;

        let skip = offset - first_page * self.page_size;
        buf.copy_from_slice(&pages[skip..skip + buf.len()]);
        Ok(status)
    }

    /// Program `buf` into the data area at a page-aligned `offset`
    pub fn write_data(&self, pnum: u32, offset: usize, buf: &[u8]) -> Result<()> {
        self.check_range(pnum, offset, buf.len())?;
        if offset % self.page_size != 0 {
            return Err(Error::InvalidArgument(format!(
                "PEB {pnum}: offset {offset} is not aligned to {}",
                self.page_size
            )));
        }
        if buf.is_empty() {
            return Ok(());
        }

        let mut pages = vec![0xFF; align_up(buf.len(), self.page_size)];
        pages[..buf.len()].copy_from_slice(buf);

        let first_page = (offset / self.page_size) as u32;
        self.block(pnum)?.program(DATA_PAGE + first_page, &pages)?;
        Ok(())
    }

    /// Exercise a suspect PEB by writing and verifying test patterns over all of it.
    ///
    /// Returns `false` if the PEB misbehaved and should be marked bad. The PEB is left erased
    /// either way (without an EC header).
    pub fn torture_peb(&self, pnum: u32) -> Result<bool> {
        let mut block = self.block(pnum)?;
        let mut buf = vec![0; self.page_size * block.page_count() as usize];

        for pattern in TORTURE_PATTERNS {
            match block.erase() {
                Ok(()) => (),
                Err(NandError::EraseFailed(_)) => return Ok(false),
                Err(e) => return Err(e.into()),
            }

            if block.read(0, &mut buf)? != ReadStatus::Clean || !buf.is_erased() {
                return Ok(false);
            }

            buf.fill(pattern);
            match block.program(0, &buf) {
                Ok(()) => (),
                Err(NandError::ProgramFailed { .. }) => return Ok(false),
                Err(e) => return Err(e.into()),
            }

            if block.read(0, &mut buf)? != ReadStatus::Clean || buf.iter().any(|&b| b != pattern)
            {
                return Ok(false);
            }
        }

        match block.erase() {
            Ok(()) => Ok(true),
            Err(NandError::EraseFailed(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// The length of `buf` once trailing erased bytes are dropped, rounded up to the I/O unit
    pub fn calc_data_len(&self, buf: &[u8]) -> usize {
        let used = buf.iter().rposition(|&b| b != 0xFF).map_or(0, |i| i + 1);
        align_up(used, self.page_size)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::{NandLayout, ReadFault, SimNand};
    use crate::ubi::headers::VolType;

    const TEST_LAYOUT: NandLayout = NandLayout {
        blocks: 4,
        pages_per_block: 8,
        bytes_per_page: 64,
    };

    #[test]
    fn test_vid_hdr_states() -> Result<()> {
        let io = PebIo::new(SimNand::new(TEST_LAYOUT))?;

        io.erase_peb(0, Ec::default().ec(3))?;
        assert_eq!(io.read_ec_hdr(0)?, Some(Ec::default().ec(3)));
        assert_eq!(io.probe_vid_hdr(0)?, VidHdrRead::Blank { bitflips: false });
        assert!(matches!(io.read_vid_hdr(0), Err(Error::EmptyHeader(0))));

        let vid = Vid::for_leb(VolType::Dynamic, 1, 2, 0).sqnum(5);
        io.write_vid_hdr(0, &vid)?;
        assert_eq!(io.read_vid_hdr(0)?, (vid, false));

        io.nand().set_read_fault(0, Some(ReadFault::Bitflips));
        assert_eq!(io.read_vid_hdr(0)?, (vid, true));

        // Garbage in the header page
        io.nand().block(1)?.unwrap().program(1, &[0x12; 64])?;
        assert_eq!(io.probe_vid_hdr(1)?, VidHdrRead::Corrupt { ecc: false });

        Ok(())
    }

    #[test]
    fn test_data_io() -> Result<()> {
        let io = PebIo::new(SimNand::new(TEST_LAYOUT))?;
        assert_eq!(io.leb_size(), 6 * 64);

        io.write_data(2, 0, &[0xAB; 100])?;
        io.write_data(2, 128, &[0xCD; 64])?;

        let mut buf = vec![0; 120];
        io.read_data(2, 90, &mut buf)?;
        assert_eq!(buf[..10], [0xAB; 10]);
        assert!(buf[10..38].is_erased());
        assert_eq!(buf[38..102], [0xCD; 64]);
        assert!(buf[102..].is_erased());

        assert!(matches!(
            io.write_data(2, 100, &[0; 4]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            io.read_data(2, 300, &mut buf),
            Err(Error::InvalidArgument(_))
        ));

        Ok(())
    }

    #[test]
    fn test_torture() -> Result<()> {
        let io = PebIo::new(SimNand::new(TEST_LAYOUT))?;
        assert!(io.torture_peb(0)?);

        io.nand().fail_programs(1, 1);
        assert!(!io.torture_peb(1)?);

        Ok(())
    }

    #[test]
    fn test_calc_data_len() -> Result<()> {
        let io = PebIo::new(SimNand::new(TEST_LAYOUT))?;
        let mut buf = vec![0xFF; 256];
        assert_eq!(io.calc_data_len(&buf), 0);
        buf[70] = 0;
        assert_eq!(io.calc_data_len(&buf), 128);
        Ok(())
    }
}
