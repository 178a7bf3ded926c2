//! `Store`: the top-level type owning one flash driver and every space
//! built on top of it.

use alloc::vec::Vec;

use flash_api::{FlashDriver, SpaceDescriptor};

use crate::error::FatalSink;
use crate::gc::{self, ScoreMethod};
use crate::query::{self, TagInfo};
use crate::recovery;
use crate::space::{SectorStats, SpaceState};
use crate::writer::{self, WriteOutcome};

/// Owns the flash driver, the fatal-error sink, and one `SpaceState` per
/// entry in the platform descriptor it was built from. Generalizes the
/// source material's fixed `SPACE_max` enum and static per-space arrays to
/// an arbitrary number of independently-addressed spaces.
pub struct Store<D: FlashDriver, F: FatalSink> {
    flash: D,
    sink: F,
    spaces: Vec<SpaceState>,
}

impl<D: FlashDriver, F: FatalSink> Store<D, F> {
    pub fn new(flash: D, sink: F, descriptors: &[SpaceDescriptor]) -> Self {
        let spaces = descriptors.iter().copied().map(SpaceState::new).collect();
        Store { flash, sink, spaces }
    }

    /// Direct access to the underlying driver, for tests that need to
    /// simulate flash-level corruption (a crashed erase, preloaded
    /// power-fail fixtures) that no API call could otherwise produce.
    pub fn flash_mut(&mut self) -> &mut D {
        &mut self.flash
    }

    fn space_mut(&mut self, space: usize) -> &mut SpaceState {
        &mut self.spaces[space]
    }

    fn space(&self, space: usize) -> &SpaceState {
        &self.spaces[space]
    }

    /// `init(find_and_erase_bad_sectors)`: brings up the driver, then
    /// re-surveys and repairs every space.
    pub fn init(&mut self, voltage_mv: u32, find_and_erase_bad_sectors: bool) {
        if self.flash.init(voltage_mv).is_err() {
            // The driver contract treats init as idempotent and
            // effectively infallible for a sane part; a failure here has
            // no recoverable meaning at this layer.
            self.sink
                .register_fatal_error(crate::error::FatalCode::BadSpaceVitalsEnum);
        }
        for space in self.spaces.iter_mut() {
            recovery::init_space(&mut self.flash, &mut self.sink, space, find_and_erase_bad_sectors);
        }
    }

    pub fn write_tag(&mut self, space: usize, tag_number: u16, data: &[u8]) -> Option<WriteOutcome> {
        writer::write_tag(&mut self.flash, &mut self.sink, self.space_mut(space), tag_number, data)
    }

    pub fn read_tag(&self, space: usize, tag_number: u16) -> Option<(&[u8], u16)> {
        let mut sink = NullSink;
        query::read_tag(&self.flash, &mut sink, self.space(space), tag_number)
    }

    pub fn latest_tag_info(&self, space: usize, tag_number: u16) -> Option<TagInfo> {
        let mut sink = NullSink;
        query::latest_tag_info(&self.flash, &mut sink, self.space(space), tag_number)
    }

    pub fn n_versions(
        &self,
        space: usize,
        tag_number: u16,
        version_hi: u16,
        version_lo: u16,
        out: &mut [TagInfo],
    ) -> (usize, bool) {
        let mut sink = NullSink;
        query::n_versions(
            &self.flash,
            &mut sink,
            self.space(space),
            tag_number,
            version_hi,
            version_lo,
            out,
        )
    }

    pub fn sanity_check_sector(&self, space: usize, sector: usize) -> bool {
        query::sanity_check_sector(&self.flash, self.space(space), sector)
    }

    pub fn sector_stats(&self, space: usize, sector: usize) -> SectorStats {
        query::sector_stats(self.space(space), sector)
    }

    pub fn total_reset(&mut self, space: usize) {
        query::total_reset(&mut self.flash, &mut self.sink, self.space_mut(space));
    }

    /// Picks a sector via `method` and reclaims it (moves its live tags
    /// out, leaving it only-dirty). Returns the reclaimed sector number,
    /// or `None` if nothing qualified.
    ///
    /// If `dig_deeper_into_garbage` is set (an earlier `write_tag` couldn't
    /// place its tag), every sector is re-surveyed and repaired once before
    /// scoring, and the flag is cleared -- this is the escalation spec.md
    /// promises after an exceptional write failure.
    pub fn garbage_collect_no_erase(&mut self, space: usize, method: ScoreMethod) -> Option<usize> {
        let space_state = &mut self.spaces[space];
        if space_state.vitals.dig_deeper_into_garbage {
            recovery::repair_all_sectors(&mut self.flash, &mut self.sink, space_state);
            space_state.vitals.dig_deeper_into_garbage = false;
        }

        let picked = gc::score(self.space(space), method)?;
        Some(gc::reclaim_sector(&mut self.flash, &mut self.sink, self.space_mut(space), picked))
    }

    /// Acts on a pending abandoned sector only.
    pub fn erase_if_needed(&mut self, space: usize) -> bool {
        gc::erase_if_needed(&mut self.flash, &mut self.sink, self.space_mut(space))
    }

    pub fn erase_sector_foreground(&mut self, space: usize, sector: usize) {
        gc::erase_sector_foreground(&mut self.flash, &mut self.sink, self.space_mut(space), sector);
    }
}

/// Query methods only take `&self` (so they can return borrows into
/// flash), but the shared `query` module still needs a `&mut dyn
/// FatalSink` to report an out-of-range tag number. `Store`'s own sink is
/// behind `&self` here and can't be borrowed mutably, so reads get their
/// own panicking sink rather than `F`'s. This still honors the "never
/// returns" contract; it just can't run the caller's custom sink
/// (whatever that does beyond not returning) for this one invariant.
struct NullSink;

impl FatalSink for NullSink {
    fn register_fatal_error(&mut self, code: crate::error::FatalCode) -> ! {
        panic!("fatal nvm-tag error during query: {:?}", code);
    }
}
