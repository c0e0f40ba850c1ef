//! Abstractions and code to access NAND flash

use std::io::{Read, Write};
use std::str::FromStr;

use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// A pub-fields struct describing the data layout of a NAND flash device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NandLayout {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
}

impl NandLayout {
    /// The number of bytes in one eraseblock
    pub fn block_size(&self) -> usize {
        self.bytes_per_page * self.pages_per_block as usize
    }
}

/// Parse strings like "BLOCKSxPAGESxBYTES"
impl FromStr for NandLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [blocks, pages_per_block, bytes_per_page]: [&str; 3] = s
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#"))?;
        let blocks = blocks.parse()?;
        let pages_per_block = pages_per_block.parse()?;
        let bytes_per_page = bytes_per_page.parse()?;

        Ok(NandLayout {
            blocks,
            pages_per_block,
            bytes_per_page,
        })
    }
}

/// Failures reported by the flash medium itself
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum NandError {
    #[error("block {0} out of range")]
    OutOfRange(u32),

    #[error("block {0} is marked bad")]
    BadBlock(u32),

    /// The medium refused the program operation; the block is suspect.
    #[error("program failed on block {block}, page {page}")]
    ProgramFailed { block: u32, page: u32 },

    #[error("erase failed on block {0}")]
    EraseFailed(u32),

    /// The caller violated the programming model (size, bounds, or write order).
    #[error("invalid access to block {block}: {reason}")]
    Invalid { block: u32, reason: &'static str },
}

/// How trustworthy the bytes returned by a read are
///
/// Ordered from best to worst, so that multi-page reads can report the worst page.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum ReadStatus {
    /// The data was read without any correction
    #[default]
    Clean,

    /// ECC corrected some bit-flips; the data is good but the block should be scrubbed
    Bitflips,

    /// ECC could not correct the data; the bytes were still delivered but may be wrong
    Uncorrectable,
}

/// Represents a NAND flash device
///
/// Implementations must allow concurrent access to distinct blocks from several threads.
pub trait Nand: Send + Sync {
    type Block<'a>: NandBlock + 'a
    where
        Self: 'a;

    /// Get a block
    ///
    /// Returns None if `index` refers to a block marked bad
    fn block(&self, index: u32) -> Result<Option<Self::Block<'_>>, NandError>;

    /// Get the layout of the NAND
    fn get_layout(&self) -> NandLayout;
}

/// Represents a block of a NAND flash device
pub trait NandBlock {
    /// How many pages in this block?
    fn page_count(&self) -> u32;

    /// How many bytes per page?
    fn page_size(&self) -> usize;

    /// Read an integral number of pages, starting at the specified page
    fn read(&self, start_page: u32, content: &mut [u8]) -> Result<ReadStatus, NandError>;

    /// Write the specified content, beginning at the specified page
    ///
    /// Note that `index` must be greater than any previously-written index, or in other words,
    /// writing a page makes it and all skipped pages nonwritable. This is to comply with the
    /// sequential-write requirements of certain MLC NANDs.
    fn program(&mut self, start_page: u32, content: &[u8]) -> Result<(), NandError>;

    /// Erase a block, making all pages writable again
    fn erase(&mut self) -> Result<(), NandError>;

    /// Marks the block as bad, consuming the block object (it cannot be retrieved again).
    fn mark_bad(self) -> Result<(), NandError>;
}

/// Persistent read behavior injected into a [SimNand] block
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReadFault {
    Bitflips,
    Uncorrectable,
}

/// A simulated in-memory NAND flash, for testing purposes
///
/// Besides honoring the append-only programming model, it can be told to fail programs or erases,
/// or to report bit-flips/ECC failures on reads, so that error paths can be exercised.
#[derive(Debug)]
pub struct SimNand {
    blocks: Box<[Mutex<SimBlock>]>,
    layout: NandLayout,
}

/// A block of SimNand
#[derive(Debug, Clone)]
pub struct SimBlock {
    index: u32,

    /// All bytes of all written pages (legally, can only append to this)
    data: Vec<u8>,

    /// How many pages in this block
    page_count: u32,

    /// How many bytes per page
    page_size: usize,

    /// Is this block marked bad?
    marked_bad: bool,

    /// How many upcoming program operations should fail
    program_failures: u32,

    /// How many upcoming erase operations should fail
    erase_failures: u32,

    read_fault: Option<ReadFault>,
}

impl Clone for SimNand {
    /// Take a snapshot of the flash, e.g. to simulate a power cut at this exact moment
    fn clone(&self) -> Self {
        let blocks = self
            .blocks
            .iter()
            .map(|x| Mutex::new(x.lock().clone()))
            .collect();

        Self {
            blocks,
            layout: self.layout,
        }
    }
}

impl SimNand {
    /// Create an empty SimNand with the specified layout
    pub fn new(layout: NandLayout) -> Self {
        let blocks = (0..layout.blocks)
            .map(|index| Mutex::new(SimBlock::new(layout, index)))
            .collect();

        Self { blocks, layout }
    }

    /// Initialize the NAND contents with content read from a type implementing `Read`.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        let mut buf = vec![0; self.layout.block_size()];

        for block in self.blocks.iter_mut() {
            let block = block.get_mut();
            block.marked_bad = false;
            block.data.clear();
            read.read_exact(&mut buf)?;
            block.program_pages(0, &buf)?;
        }

        Ok(())
    }

    /// Write the contents of this simulated NAND block out to a writable stream (such as a File)
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        let mut buf = vec![0; self.layout.block_size()];

        for block in 0..self.layout.blocks {
            match self.block(block)? {
                None => buf.fill(0xBD),
                Some(block) => {
                    block.read(0, &mut buf)?;
                }
            };

            write.write_all(&buf)?;
        }

        Ok(())
    }

    fn sim_block(&self, index: u32) -> MutexGuard<'_, SimBlock> {
        self.blocks[index as usize].lock()
    }

    /// Make the next `count` program operations on block `index` fail
    pub fn fail_programs(&self, index: u32, count: u32) {
        self.sim_block(index).program_failures = count;
    }

    /// Make the next `count` erase operations on block `index` fail
    pub fn fail_erases(&self, index: u32, count: u32) {
        self.sim_block(index).erase_failures = count;
    }

    /// Make every read of block `index` report `fault`, until the block is erased
    pub fn set_read_fault(&self, index: u32, fault: Option<ReadFault>) {
        self.sim_block(index).read_fault = fault;
    }

    /// Has block `index` been marked bad?
    pub fn is_bad(&self, index: u32) -> bool {
        self.sim_block(index).marked_bad
    }
}

impl SimBlock {
    /// Construct an empty block within the given layout
    fn new(layout: NandLayout, index: u32) -> Self {
        Self {
            index,
            data: Default::default(),
            page_count: layout.pages_per_block,
            page_size: layout.bytes_per_page,
            marked_bad: false,
            program_failures: 0,
            erase_failures: 0,
            read_fault: None,
        }
    }

    fn invalid(&self, reason: &'static str) -> NandError {
        NandError::Invalid {
            block: self.index,
            reason,
        }
    }

    fn write_page(&mut self, index: u32, content: &[u8]) -> Result<(), NandError> {
        if content.len() != self.page_size {
            return Err(self.invalid("content not page-sized"));
        }
        if index >= self.page_count {
            return Err(self.invalid("page index out of bounds"));
        }

        let begin = index as usize * self.page_size;

        if begin < self.data.len() {
            return Err(self.invalid("write in already-written area"));
        }

        // Writing fully-erased content is a no-op.
        if !content.is_erased() {
            self.data.resize(begin, 0xFF);
            self.data.extend_from_slice(content);
        }

        Ok(())
    }

    fn read_page(&self, index: u32, content: &mut [u8]) -> Result<(), NandError> {
        if content.len() != self.page_size {
            return Err(self.invalid("content not page-sized"));
        }
        if index >= self.page_count {
            return Err(self.invalid("page index out of bounds"));
        }

        let begin = index as usize * self.page_size;
        let end = begin + self.page_size;

        if let Some(page) = self.data.get(begin..end) {
            content.copy_from_slice(page);
        } else {
            content.fill(0xFF);
        }

        Ok(())
    }

    fn read_pages(&self, start_page: u32, content: &mut [u8]) -> Result<ReadStatus, NandError> {
        let mut page = start_page;
        for chunk in content.chunks_mut(self.page_size) {
            self.read_page(page, chunk)?;
            page += 1;
        }

        Ok(match self.read_fault {
            None => ReadStatus::Clean,
            Some(ReadFault::Bitflips) => ReadStatus::Bitflips,
            Some(ReadFault::Uncorrectable) => ReadStatus::Uncorrectable,
        })
    }

    fn program_pages(&mut self, start_page: u32, content: &[u8]) -> Result<(), NandError> {
        if self.program_failures > 0 {
            self.program_failures -= 1;
            return Err(NandError::ProgramFailed {
                block: self.index,
                page: start_page,
            });
        }

        let mut page = start_page;
        for chunk in content.chunks(self.page_size) {
            self.write_page(page, chunk)?;
            page += 1;
        }
        Ok(())
    }

    fn erase_block(&mut self) -> Result<(), NandError> {
        if self.erase_failures > 0 {
            self.erase_failures -= 1;
            return Err(NandError::EraseFailed(self.index));
        }

        self.data.clear();
        self.read_fault = None;
        Ok(())
    }
}

impl Nand for SimNand {
    type Block<'a> = MutexGuard<'a, SimBlock>;

    fn block(&self, index: u32) -> Result<Option<Self::Block<'_>>, NandError> {
        let block = self
            .blocks
            .get(index as usize)
            .ok_or(NandError::OutOfRange(index))?
            .lock();

        Ok(Some(block).filter(|x| !x.marked_bad))
    }

    fn get_layout(&self) -> NandLayout {
        self.layout
    }
}

impl NandBlock for MutexGuard<'_, SimBlock> {
    fn page_count(&self) -> u32 {
        self.page_count
    }
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read(&self, start_page: u32, content: &mut [u8]) -> Result<ReadStatus, NandError> {
        self.read_pages(start_page, content)
    }

    fn program(&mut self, start_page: u32, content: &[u8]) -> Result<(), NandError> {
        self.program_pages(start_page, content)
    }

    fn erase(&mut self) -> Result<(), NandError> {
        self.erase_block()
    }

    fn mark_bad(mut self) -> Result<(), NandError> {
        self.data.clear();
        self.marked_bad = true;
        Ok(())
    }
}

#[cfg(test)]
const TEST_LAYOUT: NandLayout = NandLayout {
    blocks: 8,
    pages_per_block: 16,
    bytes_per_page: 256,
};

#[test]
fn test_sim_block() {
    let nand = SimNand::new(TEST_LAYOUT);
    assert!(nand.block(0).unwrap().is_some());
    assert!(nand.block(TEST_LAYOUT.blocks - 1).unwrap().is_some());
    assert_eq!(
        nand.block(TEST_LAYOUT.blocks).err(),
        Some(NandError::OutOfRange(TEST_LAYOUT.blocks))
    );
}

#[test]
fn test_sim_mark_bad() {
    let nand = SimNand::new(TEST_LAYOUT);
    assert!(nand.block(0).unwrap().is_some());
    nand.block(0).unwrap().unwrap().mark_bad().unwrap();
    assert!(nand.block(0).unwrap().is_none());
    assert!(nand.is_bad(0));
}

#[test]
fn test_sim_read_write() {
    let nand = SimNand::new(TEST_LAYOUT);

    let data_in = vec![0xA5u8; nand.get_layout().bytes_per_page];
    let mut data_out = data_in.clone();

    let mut block = nand.block(0).unwrap().unwrap();
    block.program(2, &data_in).unwrap();
    assert!(block.program(1, &data_in).is_err());

    block.read(1, &mut data_out).unwrap();
    assert!(data_out.is_erased());

    block.read(2, &mut data_out).unwrap();
    assert_eq!(data_out, data_in);

    block.read(3, &mut data_out).unwrap();
    assert!(data_out.is_erased());
}

#[test]
fn test_sim_load() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.load(&mut std::io::repeat(0x55u8)).unwrap();

    let mut buf = vec![0u8; nand.get_layout().block_size()];

    let block = nand.block(0).unwrap().unwrap();
    block.read(0, &mut buf).unwrap();

    assert!(buf.iter().all(|&x| x == 0x55u8));
}

#[test]
fn test_sim_faults() {
    let nand = SimNand::new(TEST_LAYOUT);
    let page = vec![0x11u8; TEST_LAYOUT.bytes_per_page];
    let mut out = page.clone();

    nand.fail_programs(3, 1);
    let mut block = nand.block(3).unwrap().unwrap();
    assert_eq!(
        block.program(0, &page),
        Err(NandError::ProgramFailed { block: 3, page: 0 })
    );
    block.program(0, &page).unwrap();
    drop(block);

    nand.set_read_fault(3, Some(ReadFault::Bitflips));
    let block = nand.block(3).unwrap().unwrap();
    assert_eq!(block.read(0, &mut out), Ok(ReadStatus::Bitflips));
    assert_eq!(out, page);
    drop(block);

    nand.fail_erases(3, 1);
    let mut block = nand.block(3).unwrap().unwrap();
    assert_eq!(block.erase(), Err(NandError::EraseFailed(3)));
    block.erase().unwrap();
    assert_eq!(block.read(0, &mut out), Ok(ReadStatus::Clean));
    assert!(out.is_erased());
}
