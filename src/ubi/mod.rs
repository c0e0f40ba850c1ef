//! This module implements the eraseblock association (EBA) layer of UBI: the mapping from the
//! logical eraseblocks (LEBs) of each volume to the physical eraseblocks (PEBs) holding them.
//!
//! Every PEB in use starts with an erase counter ("EC") header in its first page and a volume ID
//! ("VID") header in its second, naming the LEB it holds:
//!
//! ```text
//! +---------+---------+------------------------------------+
//! |   EC    |   VID   |  LEB data                          |
//! | ec: 17  | vol: 0  |                                    |
//! |         | lnum: 2 |                                    |
//! |         | sqnum:9 |                                    |
//! +---------+---------+------------------------------------+
//! ```
//!
//! The mapping itself is never written to flash. When attaching, every PEB is scanned and the
//! mapping rebuilt from the VID headers; when two PEBs claim the same LEB, the one with the higher
//! sequence number ("sqnum") wins. From then on, the mapping lives in an [EbaTable] per volume,
//! which the operations on [Ubi] keep up to date:
//!
//! - [Ubi::read] and [Ubi::write_dynamic] for random access to dynamic volumes,
//! - [Ubi::write_static] for the write-once LEBs of static volumes,
//! - [Ubi::atomic_change] to replace a LEB such that a power cut leaves either the old or the new
//!   content,
//! - [Ubi::unmap] to drop a LEB,
//! - [Ubi::copy_leb] to move a LEB to another PEB (used when scrubbing).
//!
//! Concurrent operations on the same LEB are serialized by the [LockTree]; operations on
//! different LEBs run in parallel.

mod attach;
mod config;
mod device;
mod eba;
mod error;
mod headers;
mod io;
mod ltree;
mod scan;
mod table;
mod wl;

pub use attach::{bad_peb_limit, EBA_RESERVED_PEBS};
pub use config::{
    InterruptedUnmap, StaleMappingPolicy, Staleness, UbiConfig, VolumeConfig, MAX_BEB_PER1024,
    UBI_IO_RETRIES,
};
pub use device::Ubi;
pub use error::{CopyError, Error, Result};
pub use headers::{data_crc, Ec, Vid, VolType};
pub use io::{PebIo, VidHdrRead};
pub use ltree::{LebReadGuard, LebWriteGuard, LockTree};
pub use scan::{
    scan_blocks, AttachInfo, AttachLeb, AttachPeb, AttachVolume, BlockContent, Ebt,
};
pub use table::{EbaTable, Volume};
pub use wl::{PebAccounting, Wl, WL_RESERVED_PEBS};
