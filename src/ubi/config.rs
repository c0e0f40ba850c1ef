//! Device and volume configuration, expressed as by-value builders.

use std::fmt::Debug;
use std::num::NonZeroU32;
use std::sync::Arc;

use super::headers::VolType;
use super::io::VidHdrRead;

/// How many times a failed write is retried on a fresh PEB before giving up
pub const UBI_IO_RETRIES: u32 = 3;

/// Default number of PEBs per 1024 reserved for bad block handling
pub const MAX_BEB_PER1024: u32 = 20;

/// The verdict of a [StaleMappingPolicy] on a PEB referenced by an unverified mapping
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Staleness {
    /// The PEB really holds the LEB (or its header must be validated by the caller as usual)
    Live,

    /// The LEB was unmapped but the mapping never learned about it; the PEB must be given back,
    /// and tortured first if `torture` is set
    Stale { torture: bool },
}

/// Decides whether a mapping that came from a fast attach still refers to live data, based on
/// what is found in the VID header area of the mapped PEB.
pub trait StaleMappingPolicy: Debug + Send + Sync {
    fn classify(&self, hdr: &VidHdrRead) -> Staleness;
}

/// The default policy: an interrupted unmap leaves the PEB erased (or half-erased), so a blank or
/// corrupt VID header means the LEB is really unmapped.
#[derive(Debug, Default, Copy, Clone)]
pub struct InterruptedUnmap;

impl StaleMappingPolicy for InterruptedUnmap {
    fn classify(&self, hdr: &VidHdrRead) -> Staleness {
        match *hdr {
            VidHdrRead::Valid { .. } => Staleness::Live,
            VidHdrRead::Blank { bitflips } => Staleness::Stale { torture: bitflips },
            VidHdrRead::Corrupt { ecc } => Staleness::Stale { torture: ecc },
        }
    }
}

/// Device-wide settings for an attached UBI device
#[derive(Debug, Clone)]
pub struct UbiConfig {
    pub(crate) bad_allowed: bool,
    pub(crate) max_beb_per1024: u32,
    pub(crate) io_retries: u32,
    pub(crate) stale_policy: Arc<dyn StaleMappingPolicy>,
}

impl Default for UbiConfig {
    fn default() -> Self {
        Self {
            bad_allowed: true,
            max_beb_per1024: MAX_BEB_PER1024,
            io_retries: UBI_IO_RETRIES,
            stale_policy: Arc::new(InterruptedUnmap),
        }
    }
}

impl UbiConfig {
    /// Whether the medium may develop bad blocks; without this, any write failure is fatal.
    pub fn bad_allowed(mut self, bad_allowed: bool) -> Self {
        self.bad_allowed = bad_allowed;
        self
    }

    /// The maximum expected number of bad PEBs per 1024, which sizes the bad-PEB reserve.
    pub fn max_beb_per1024(mut self, max_beb_per1024: u32) -> Self {
        self.max_beb_per1024 = max_beb_per1024;
        self
    }

    /// How many extra attempts a failed write gets on freshly allocated PEBs.
    pub fn io_retries(mut self, io_retries: u32) -> Self {
        self.io_retries = io_retries;
        self
    }

    /// Replace the policy that validates mappings installed by a fast attach.
    pub fn stale_policy<P: StaleMappingPolicy + 'static>(mut self, policy: P) -> Self {
        self.stale_policy = Arc::new(policy);
        self
    }
}

/// Describes one volume of the device
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct VolumeConfig {
    pub(crate) vol_id: u32,
    pub(crate) vol_type: VolType,
    pub(crate) reserved_pebs: u32,
    pub(crate) alignment: NonZeroU32,
}

impl VolumeConfig {
    /// Begin describing a volume of a given type and ID, with no LEBs
    pub fn new(vol_type: VolType, vol_id: u32) -> Self {
        Self {
            vol_id,
            vol_type,
            reserved_pebs: 0,
            alignment: NonZeroU32::MIN,
        }
    }

    /// Set how many LEBs the volume has (each backed by one reserved PEB).
    pub fn lebs(mut self, reserved_pebs: u32) -> Self {
        self.reserved_pebs = reserved_pebs;
        self
    }

    /// Set the alignment of the volume. All LEBs will be a multiple of this size.
    ///
    /// The default alignment is 1.
    pub fn align(mut self, alignment: NonZeroU32) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn vol_id(&self) -> u32 {
        self.vol_id
    }

    pub fn vol_type(&self) -> VolType {
        self.vol_type
    }

    pub fn reserved_pebs(&self) -> u32 {
        self.reserved_pebs
    }
}

#[test]
fn test_default_policy() {
    let policy = InterruptedUnmap;
    let vid = Default::default();

    assert_eq!(
        policy.classify(&VidHdrRead::Valid {
            vid,
            bitflips: true
        }),
        Staleness::Live
    );
    assert_eq!(
        policy.classify(&VidHdrRead::Blank { bitflips: false }),
        Staleness::Stale { torture: false }
    );
    assert_eq!(
        policy.classify(&VidHdrRead::Corrupt { ecc: true }),
        Staleness::Stale { torture: true }
    );
}
