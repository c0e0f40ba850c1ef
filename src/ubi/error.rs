//! Errors reported by the EBA layer and its collaborators.

use crate::nand::NandError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The device switched to read-only mode after a fatal failure; only reads are allowed.
    #[error("UBI device is in read-only mode")]
    ReadOnly,

    #[error("volume {0} does not exist")]
    NoVolume(u32),

    #[error("volume {0} already exists")]
    VolumeExists(u32),

    #[error("LEB {vol_id}:{lnum} is out of range")]
    LebOutOfRange { vol_id: u32, lnum: u32 },

    #[error("invalid request: {0}")]
    InvalidArgument(String),

    /// The data read back does not match the CRC stored in its VID header.
    #[error("CRC error on LEB {vol_id}:{lnum}: calculated {calculated:#010x}, must be {stored:#010x}")]
    Checksum {
        vol_id: u32,
        lnum: u32,
        calculated: u32,
        stored: u32,
    },

    #[error("PEB {0} has no VID header")]
    EmptyHeader(u32),

    #[error("corrupted VID header at PEB {0}")]
    BadHeader(u32),

    #[error("PEB {pnum} holds LEB {found_vol_id}:{found_lnum} instead of {vol_id}:{lnum}")]
    WrongLeb {
        pnum: u32,
        vol_id: u32,
        lnum: u32,
        found_vol_id: u32,
        found_lnum: u32,
    },

    #[error("uncorrectable ECC error reading PEB {0}")]
    Ecc(u32),

    #[error("LEB {vol_id}:{lnum} is already mapped")]
    AlreadyMapped { vol_id: u32, lnum: u32 },

    #[error("LEB {vol_id}:{lnum} of a static volume is already written")]
    StaticLebMapped { vol_id: u32, lnum: u32 },

    #[error("LEB {vol_id}:{lnum} of a static volume is not mapped")]
    StaticLebUnmapped { vol_id: u32, lnum: u32 },

    #[error("operation not supported on static volume {0}")]
    StaticVolume(u32),

    #[error("not enough physical eraseblocks ({avail} available, {needed} needed)")]
    NoSpace { avail: u32, needed: u32 },

    #[error("no free physical eraseblocks")]
    NoFreePebs,

    #[error("no reserved PEBs left to replace bad PEB {0}")]
    NoReservedPebs(u32),

    #[error("LEB {vol_id}:{lnum} is PEB {fast} in the fast-attach map instead of PEB {scan}")]
    MappingMismatch {
        vol_id: u32,
        lnum: u32,
        fast: u32,
        scan: u32,
    },

    #[error(transparent)]
    Nand(#[from] NandError),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Is this the "this PEB turned out bad" class of failure, which is retried elsewhere?
    pub fn is_write_failure(&self) -> bool {
        matches!(self, Self::Nand(NandError::ProgramFailed { .. }))
    }

    /// Is this a data integrity failure (as opposed to a transport/media failure)?
    pub fn is_checksum(&self) -> bool {
        matches!(self, Self::Checksum { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Why a LEB could not be moved from one PEB to another.
///
/// Only `Fatal` is an actual failure of the device; the others tell the caller what to do with the
/// PEBs involved.
#[derive(Debug, Error)]
pub enum CopyError {
    /// The volume was removed, or the LEB unmapped or rewritten, since the move was decided on
    #[error("LEB changed while it was being moved")]
    CancelRace,

    /// The LEB is locked; the move has to be tried again later
    #[error("LEB is busy")]
    Retry,

    #[error("uncorrectable ECC error reading the source PEB")]
    SourceRead,

    /// Writing to the target PEB failed, so it is probably bad
    #[error("write to the target PEB failed")]
    TargetWrite,

    #[error("VID header did not read back from the target PEB")]
    TargetRead,

    #[error("VID header read back from the target PEB with bit-flips")]
    TargetBitflips,

    #[error(transparent)]
    Fatal(#[from] Error),
}
