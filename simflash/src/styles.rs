//! Flash styles
//!
//! Real NOR parts vary a lot in sector/write granularity. This catalog
//! gives tests a representative spread rather than exercising only one
//! geometry.

use crate::SimFlash;
use flash_api::Result;

/// The configuration of one flash device: geometry only, no tag-space
/// carving (that's `flash_api::SpaceDescriptor`'s job once a `SimFlash`
/// has been built).
pub struct DeviceLayout {
    pub read_size: usize,
    pub write_size: usize,
    pub erase_size: usize,
    pub sectors: usize,
}

impl DeviceLayout {
    pub fn build(&self) -> Result<SimFlash> {
        SimFlash::new(self.read_size, self.write_size, self.erase_size, self.sectors)
    }
}

/// The sector size used throughout this crate's own unit tests: small
/// enough that stress tests covering thousands of writes stay fast.
pub const TEST_SECTOR_SIZE: usize = 8 * 1024;
/// The sector size assumed for production targets unless a board says
/// otherwise.
pub const PRODUCTION_SECTOR_SIZE: usize = 16 * 1024;

/// The geometry used by this crate's own unit tests.
pub static TEST_8K: DeviceLayout = DeviceLayout {
    read_size: 1,
    write_size: 1,
    erase_size: TEST_SECTOR_SIZE,
    sectors: 4,
};

/// Common production geometry: byte-grained writes, 16 KiB sectors.
pub static COMMON_16K: DeviceLayout = DeviceLayout {
    read_size: 1,
    write_size: 1,
    erase_size: PRODUCTION_SECTOR_SIZE,
    sectors: 4,
};

/// Small uniform sectors, as on many K-series parts.
pub static SMALL_UNIFORM: DeviceLayout = DeviceLayout {
    read_size: 1,
    write_size: 8,
    erase_size: 4 * 1024,
    sectors: 32,
};

/// Large write granularity paired with large erase blocks, as on the
/// STM32H7 family.
pub static LARGE_WRITE: DeviceLayout = DeviceLayout {
    read_size: 1,
    write_size: 32,
    erase_size: 128 * 1024,
    sectors: 4,
};

/// Page-style device where write and erase granularity coincide, as on
/// the LPC55S69.
pub static PAGED: DeviceLayout = DeviceLayout {
    read_size: 1,
    write_size: 512,
    erase_size: 512,
    sectors: 256,
};

pub static ALL_DEVICES: [&DeviceLayout; 5] =
    [&TEST_8K, &COMMON_16K, &SMALL_UNIFORM, &LARGE_WRITE, &PAGED];

/// Builds each catalog device in turn.
pub fn all_devices() -> impl Iterator<Item = Result<SimFlash>> {
    ALL_DEVICES.iter().map(|layout| layout.build())
}
