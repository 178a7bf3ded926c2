//! Flash driver and platform descriptor contracts.
//!
//! These are the two interfaces a caller must supply to `nvm-tag`: a driver
//! that can write and erase NOR flash, and a static description of how the
//! flash is carved into spaces and sectors.

#![cfg_attr(not(any(feature = "std", test)), no_std)]

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Error {
    NotAligned,
    OutOfBounds,
    NotWritten,
    NotErased,
}

pub type Result<T> = core::result::Result<T, Error>;

/// Read-only view into flash.
///
/// `read` borrows directly out of the backing memory; callers rely on this
/// to hand out tag payloads without copying.
pub trait ReadFlash {
    /// Alignment and size multiple required of reads.
    fn read_size(&self) -> usize;
    fn capacity(&self) -> usize;
    /// Borrow `len` bytes starting at `offset`.
    fn view(&self, offset: usize, len: usize) -> Result<&[u8]>;
}

/// A NOR flash driver.
///
/// Matches the three operations the core actually needs: initialize,
/// write (only 1-bits may flip to 0), and erase (whole sector back to
/// all-1s). Verification of a write or erase is the driver's
/// responsibility; the core treats `Err` as a hard failure eligible for a
/// single hardware-reset retry.
pub trait FlashDriver: ReadFlash {
    /// Alignment and size multiple required of writes. Many NOR parts allow
    /// byte-granular writes, in which case this is 1.
    fn write_size(&self) -> usize;
    /// Size of one erase block (sector).
    fn erase_size(&self) -> usize;

    /// Idempotent driver bring-up. Takes the supply voltage in millivolts,
    /// since some parts refuse program/erase below a threshold.
    fn init(&mut self, voltage_mv: u32) -> Result<()>;

    /// Invoked after a write or erase failure, before the single retry.
    fn hardware_reset(&mut self);

    /// Program `bytes` at `offset`. Only 1->0 transitions are legal; the
    /// driver is responsible for verifying the write landed.
    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()>;

    /// Erase the sector containing `offset` (an address within that
    /// sector, not necessarily sector-aligned for the caller's convenience,
    /// though the core always passes a sector-aligned address).
    fn erase(&mut self, sector_start: usize) -> Result<()>;
}

pub fn check_read<T: ReadFlash + ?Sized>(flash: &T, offset: usize, length: usize) -> Result<()> {
    check_slice(flash, flash.read_size(), offset, length)
}

pub fn check_erase<T: FlashDriver + ?Sized>(flash: &T, addr: usize) -> Result<()> {
    if addr >= flash.capacity() {
        return Err(Error::OutOfBounds);
    }
    if addr % flash.erase_size() != 0 {
        return Err(Error::NotAligned);
    }
    Ok(())
}

pub fn check_write<T: FlashDriver + ?Sized>(flash: &T, offset: usize, length: usize) -> Result<()> {
    check_slice(flash, flash.write_size(), offset, length)
}

pub fn check_slice<T: ReadFlash + ?Sized>(
    flash: &T,
    align: usize,
    offset: usize,
    length: usize,
) -> Result<()> {
    if length > flash.capacity() || offset > flash.capacity() - length {
        return Err(Error::OutOfBounds);
    }
    if offset % align != 0 || length % align != 0 {
        return Err(Error::NotAligned);
    }
    Ok(())
}

/// Describes one space: a contiguous run of equally-sized sectors and the
/// range of tag numbers it may hold.
///
/// This is the Rust analogue of the original platform descriptor's
/// `space_desc_t` plus `get_tag_ptr_base`: a space's geometry and its tag
/// capacity are fixed at startup and never change, so it is plain `Copy`
/// data rather than a trait with accessor methods.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SpaceDescriptor {
    /// Byte offset of the space's first sector within the flash device.
    pub start_addr: usize,
    /// Size in bytes of each sector in this space. Must be a power of two.
    pub sector_length: usize,
    /// Number of sectors owned by this space.
    pub num_sectors: usize,
    /// Highest tag number usable in this space (tags are numbered
    /// `1..=max_tag_number`).
    pub max_tag_number: u16,
}

impl SpaceDescriptor {
    pub fn end_addr(&self) -> usize {
        self.start_addr + self.sector_length * self.num_sectors
    }

    pub fn sector_start(&self, sector: usize) -> usize {
        self.start_addr + sector * self.sector_length
    }
}

/// A builder mirroring the way flash layouts are assembled in this
/// ecosystem: plain static data plus a `build` step, rather than a config
/// file or a registration API.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SpaceDescriptorBuilder {
    start_addr: usize,
    sector_length: usize,
    num_sectors: usize,
    max_tag_number: u16,
}

impl SpaceDescriptorBuilder {
    pub const fn new(sector_length: usize, num_sectors: usize) -> Self {
        SpaceDescriptorBuilder {
            start_addr: 0,
            sector_length,
            num_sectors,
            max_tag_number: 1,
        }
    }

    pub const fn start_addr(mut self, start_addr: usize) -> Self {
        self.start_addr = start_addr;
        self
    }

    pub const fn max_tag_number(mut self, max_tag_number: u16) -> Self {
        self.max_tag_number = max_tag_number;
        self
    }

    pub const fn build(self) -> SpaceDescriptor {
        SpaceDescriptor {
            start_addr: self.start_addr,
            sector_length: self.sector_length,
            num_sectors: self.num_sectors,
            max_tag_number: self.max_tag_number,
        }
    }
}
