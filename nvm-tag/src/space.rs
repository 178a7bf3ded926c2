//! Space manager: per-space vitals, statistics, and the latest-version
//! index, plus address <-> sector-number mapping.

use alloc::vec;
use alloc::vec::Vec;

use flash_api::SpaceDescriptor;

use crate::error::{FatalCode, FatalSink};

/// Sentinel meaning "no sector" for `sector_erasing`/`sector_abandoning`.
pub const NO_SECTOR: usize = usize::MAX;

/// Mutable per-space state that survives across calls but not across a
/// `total_reset`.
#[derive(Debug, Clone)]
pub struct SpaceVitals {
    pub current_write_sector: usize,
    pub dig_deeper_into_garbage: bool,
    pub sector_erasing: usize,
    pub sector_abandoning: usize,
}

impl SpaceVitals {
    fn fresh() -> Self {
        SpaceVitals {
            current_write_sector: 0,
            dig_deeper_into_garbage: false,
            sector_erasing: NO_SECTOR,
            sector_abandoning: NO_SECTOR,
        }
    }
}

/// Cached append point for a sector.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct SectorVitals {
    pub last_tag_address: Option<usize>,
}

/// Per-sector tag/byte accounting, recomputed whenever the sector's
/// contents change (write, repair, or erase).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct SectorStats {
    pub clean_tags: u32,
    pub dirty_tags: u32,
    pub insane_tags: u32,
    pub clean_bytes: usize,
    pub unclean_bytes: usize,
    pub free_bytes: usize,
}

/// Space-wide rollup of the per-sector stats, used by the garbage
/// collector's scoring methods.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct SpaceStats {
    pub total_clean_bytes: usize,
    pub total_unclean_bytes: usize,
    pub total_free_bytes: usize,
    pub max_sector_free_bytes: usize,
}

/// Everything a single space owns: its geometry, its mutable vitals, its
/// latest-version index, and per-sector bookkeeping.
pub struct SpaceState {
    pub desc: SpaceDescriptor,
    pub vitals: SpaceVitals,
    pub stats: SpaceStats,
    /// Indexed by `tag_number - 1`; `None` if no clean version exists.
    pub index: Vec<Option<usize>>,
    pub sector_vitals: Vec<SectorVitals>,
    pub sector_stats: Vec<SectorStats>,
}

impl SpaceState {
    pub fn new(desc: SpaceDescriptor) -> Self {
        let num_sectors = desc.num_sectors;
        let num_tags = desc.max_tag_number as usize;
        SpaceState {
            desc,
            vitals: SpaceVitals::fresh(),
            stats: SpaceStats::default(),
            index: vec![None; num_tags],
            sector_vitals: vec![SectorVitals::default(); num_sectors],
            sector_stats: vec![SectorStats::default(); num_sectors],
        }
    }

    pub fn reset_vitals(&mut self) {
        self.vitals = SpaceVitals::fresh();
        self.stats = SpaceStats::default();
        for slot in self.index.iter_mut() {
            *slot = None;
        }
        for v in self.sector_vitals.iter_mut() {
            *v = SectorVitals::default();
        }
        for s in self.sector_stats.iter_mut() {
            *s = SectorStats::default();
        }
    }

    pub fn sector_address(&self, sink: &mut dyn FatalSink, sector: usize) -> usize {
        if sector >= self.desc.num_sectors {
            sink.register_fatal_error(FatalCode::SectorNumOverrun);
        }
        self.desc.sector_start(sector)
    }

    /// `(start, end_plus_one)` for a sector.
    pub fn sector_span(&self, sink: &mut dyn FatalSink, sector: usize) -> (usize, usize) {
        let start = self.sector_address(sink, sector);
        (start, start + self.desc.sector_length)
    }

    pub fn sector_of_address(&self, sink: &mut dyn FatalSink, addr: usize) -> usize {
        if addr < self.desc.start_addr || addr >= self.desc.end_addr() {
            sink.register_fatal_error(FatalCode::PastSectorNumberInvalid);
        }
        (addr - self.desc.start_addr) / self.desc.sector_length
    }

    pub fn index_slot(&self, sink: &mut dyn FatalSink, tag_number: u16) -> usize {
        if tag_number == 0 || tag_number as usize > self.desc.max_tag_number as usize {
            sink.register_fatal_error(FatalCode::InvalidTagNumber);
        }
        tag_number as usize - 1
    }

    pub fn recompute_space_stats(&mut self) {
        let mut stats = SpaceStats::default();
        for s in self.sector_stats.iter() {
            stats.total_clean_bytes += s.clean_bytes;
            stats.total_unclean_bytes += s.unclean_bytes;
            stats.total_free_bytes += s.free_bytes;
            if s.free_bytes > stats.max_sector_free_bytes {
                stats.max_sector_free_bytes = s.free_bytes;
            }
        }
        self.stats = stats;
    }
}
