//! Simulated flash
//!
//! The NOR-type flashes used in microcontrollers differ quite a bit in
//! terms of capabilities provided. `SimFlash` is a RAM-backed driver that
//! captures the bit you can't fake: a write may only flip bits from 1 to
//! 0, and only an erase may flip them back.
//!
//! `PowerFailFlash` wraps a `SimFlash` (or any `FlashDriver`) and can cut a
//! write or erase off partway through, so tests can drive the crash-
//! recovery paths without a real power supply.

pub mod gen;
pub mod styles;

use flash_api::{check_erase, check_read, check_write, Error, FlashDriver, ReadFlash, Result};

/// A RAM-backed NOR flash simulator.
pub struct SimFlash {
    read_size: usize,
    write_size: usize,
    erase_size: usize,
    data: Vec<u8>,
}

impl SimFlash {
    pub fn new(read_size: usize, write_size: usize, erase_size: usize, sectors: usize) -> Result<Self> {
        if erase_size % write_size != 0 {
            return Err(Error::NotAligned);
        }
        Ok(SimFlash {
            read_size,
            write_size,
            erase_size,
            data: vec![0xFFu8; erase_size * sectors],
        })
    }

    /// Directly overwrite bytes in the backing buffer, bypassing the
    /// 1-to-0-only check. Used by tests to preload a sector with a
    /// specific pre-crash byte pattern.
    pub fn poke(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn raw(&self) -> &[u8] {
        &self.data
    }
}

impl ReadFlash for SimFlash {
    fn read_size(&self) -> usize {
        self.read_size
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn view(&self, offset: usize, len: usize) -> Result<&[u8]> {
        check_read(self, offset, len)?;
        Ok(&self.data[offset..offset + len])
    }
}

impl FlashDriver for SimFlash {
    fn write_size(&self) -> usize {
        self.write_size
    }

    fn erase_size(&self) -> usize {
        self.erase_size
    }

    fn init(&mut self, _voltage_mv: u32) -> Result<()> {
        Ok(())
    }

    fn hardware_reset(&mut self) {}

    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        check_write(self, offset, bytes.len())?;
        for (i, &b) in bytes.iter().enumerate() {
            let existing = self.data[offset + i];
            if existing & b != b {
                return Err(Error::NotErased);
            }
        }
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn erase(&mut self, sector_start: usize) -> Result<()> {
        check_erase(self, sector_start)?;
        let end = sector_start + self.erase_size;
        self.data[sector_start..end].fill(0xFF);
        Ok(())
    }
}

/// Wraps a `FlashDriver` with a countdown of operations remaining before a
/// simulated power loss. When the countdown reaches zero mid-operation,
/// only the first half of the write (or erase) lands, and this and every
/// subsequent call returns `Err` -- modeling the device going dark.
pub struct PowerFailFlash<D> {
    inner: D,
    remaining: Option<usize>,
}

impl<D: FlashDriver> PowerFailFlash<D> {
    pub fn new(inner: D) -> Self {
        PowerFailFlash {
            inner,
            remaining: None,
        }
    }

    /// Arms the countdown: the `n`th subsequent write/erase call is torn.
    pub fn fail_after(&mut self, n: usize) {
        self.remaining = Some(n);
    }

    pub fn into_inner(self) -> D {
        self.inner
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn tick(&mut self) -> TickResult {
        match self.remaining {
            None => TickResult::Armed,
            Some(0) => TickResult::Dead,
            Some(1) => {
                self.remaining = Some(0);
                TickResult::DiesNow
            }
            Some(n) => {
                self.remaining = Some(n - 1);
                TickResult::Armed
            }
        }
    }
}

enum TickResult {
    Armed,
    DiesNow,
    Dead,
}

impl<D: FlashDriver> ReadFlash for PowerFailFlash<D> {
    fn read_size(&self) -> usize {
        self.inner.read_size()
    }
    fn capacity(&self) -> usize {
        self.inner.capacity()
    }
    fn view(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.inner.view(offset, len)
    }
}

impl<D: FlashDriver> FlashDriver for PowerFailFlash<D> {
    fn write_size(&self) -> usize {
        self.inner.write_size()
    }
    fn erase_size(&self) -> usize {
        self.inner.erase_size()
    }
    fn init(&mut self, voltage_mv: u32) -> Result<()> {
        self.inner.init(voltage_mv)
    }
    fn hardware_reset(&mut self) {
        self.inner.hardware_reset()
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        match self.tick() {
            TickResult::Dead => Err(Error::NotWritten),
            TickResult::Armed => self.inner.write(offset, bytes),
            TickResult::DiesNow => {
                let torn = bytes.len() / 2;
                if torn > 0 {
                    self.inner.write(offset, &bytes[..torn])?;
                }
                Err(Error::NotWritten)
            }
        }
    }

    fn erase(&mut self, sector_start: usize) -> Result<()> {
        match self.tick() {
            TickResult::Dead => Err(Error::NotErased),
            TickResult::Armed => self.inner.erase(sector_start),
            TickResult::DiesNow => {
                // An interrupted erase in practice leaves an arbitrary
                // prefix back at 0xFF and garbage beyond it; zero out only
                // the first write-granule's worth to model that.
                let torn = self.inner.erase_size() / 2;
                // SimFlash::erase doesn't support partial erase directly;
                // approximate by writing 0xFF over the torn prefix, which
                // is itself a legal 1-untouched write.
                let fresh = vec![0xFFu8; torn];
                self.inner.write(sector_start, &fresh).ok();
                Err(Error::NotErased)
            }
        }
    }
}

