//! Garbage collector: scoring, abandonment, and foreground erase.

use flash_api::FlashDriver;

use crate::codec::{self, HEADER_SIZE};
use crate::error::{FatalCode, FatalSink};
use crate::recovery;
use crate::scanner;
use crate::space::SpaceState;
use crate::writer::{self, SelectPolicy};

/// Reclaim scoring methods from the spec; names kept as given since
/// callers select among them explicitly.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ScoreMethod {
    /// Always reclaim the sector with the most unclean bytes. Used at
    /// startup, where any garbage is worth clearing.
    MostUnclean,
    /// Same candidate, but only reclaim if its garbage ratio crosses
    /// `SINGLE_SECTOR_THRESHOLD`.
    UncleanThreshold,
    /// Reclaim if either the worst sector is very dirty, or total garbage
    /// crosses a threshold that relaxes as free space shrinks.
    Asymptotic,
}

const SINGLE_SECTOR_THRESHOLD_PER_MILLE: u64 = 400;
const THRESHOLD_LO_PER_MILLE: u64 = 50;
const THRESHOLD_HI_PER_MILLE: u64 = 600;
const FREE_KNEE_LO_PER_MILLE: u64 = 50;
const FREE_KNEE_HI_PER_MILLE: u64 = 400;

/// `unclean_bytes * 1000 / denom`, using a wider integer type to sidestep
/// the overflow the original fixed-width scaling trick worked around.
fn per_mille(numerator: usize, denom: usize) -> u64 {
    if denom == 0 {
        return 0;
    }
    (numerator as u64 * 1000) / denom as u64
}

fn worst_sector(space: &SpaceState) -> Option<(usize, usize)> {
    let mut best: Option<(usize, usize)> = None;
    for (sector, stats) in space.sector_stats.iter().enumerate() {
        if space.vitals.sector_erasing == sector || space.vitals.sector_abandoning == sector {
            continue;
        }
        match best {
            Some((_, best_bytes)) if stats.unclean_bytes <= best_bytes => {}
            _ => best = Some((sector, stats.unclean_bytes)),
        }
    }
    best
}

/// Picks a sector to reclaim, or `None` if nothing qualifies under
/// `method`. Does not mutate anything; the caller decides whether to act
/// on the result via `reclaim_sector`.
pub fn score(space: &SpaceState, method: ScoreMethod) -> Option<usize> {
    let (sector, unclean_bytes) = worst_sector(space)?;
    let max_free = space.stats.max_sector_free_bytes.max(1);

    match method {
        ScoreMethod::MostUnclean => Some(sector),
        ScoreMethod::UncleanThreshold => {
            if per_mille(unclean_bytes, max_free) > SINGLE_SECTOR_THRESHOLD_PER_MILLE {
                Some(sector)
            } else {
                None
            }
        }
        ScoreMethod::Asymptotic => {
            let worst_ratio = per_mille(unclean_bytes, max_free);
            if worst_ratio > SINGLE_SECTOR_THRESHOLD_PER_MILLE {
                return Some(sector);
            }
            let total_capacity = space.stats.total_clean_bytes
                + space.stats.total_unclean_bytes
                + space.stats.total_free_bytes;
            let free_ratio = per_mille(space.stats.total_free_bytes, total_capacity.max(1));
            let threshold = if free_ratio <= FREE_KNEE_LO_PER_MILLE {
                THRESHOLD_LO_PER_MILLE
            } else if free_ratio >= FREE_KNEE_HI_PER_MILLE {
                THRESHOLD_HI_PER_MILLE
            } else {
                let span = FREE_KNEE_HI_PER_MILLE - FREE_KNEE_LO_PER_MILLE;
                let pos = free_ratio - FREE_KNEE_LO_PER_MILLE;
                THRESHOLD_LO_PER_MILLE
                    + (THRESHOLD_HI_PER_MILLE - THRESHOLD_LO_PER_MILLE) * pos / span
            };
            let total_ratio = per_mille(space.stats.total_unclean_bytes, total_capacity.max(1));
            if total_ratio > threshold {
                Some(sector)
            } else {
                None
            }
        }
    }
}

fn read_header<D: FlashDriver>(flash: &D, sink: &mut dyn FatalSink, addr: usize) -> codec::DecodedHeader {
    let window = match flash_api::ReadFlash::view(flash, addr, HEADER_SIZE) {
        Ok(w) => w,
        Err(_) => sink.register_fatal_error(FatalCode::BadLastTagAddress),
    };
    let raw: [u8; HEADER_SIZE] = window.try_into().expect("HEADER_SIZE bytes");
    codec::decode(&raw)
}

/// Walks every tag in `sector`, and for each that is both clean and the
/// latest indexed version of its tag number, rewrites it elsewhere (never
/// back into `sector`, since it is marked `sector_abandoning`) and flips
/// the original DIRTY. A failure to find room anywhere else is fatal.
fn abandon_sector<D: FlashDriver>(
    flash: &mut D,
    sink: &mut dyn FatalSink,
    space: &mut SpaceState,
    sector: usize,
) {
    recovery::repair_sector_if_needed(flash, sink, space, sector);

    let sector_start = space.desc.sector_start(sector);
    let (body_start, body_end) = scanner::body_bounds(sector_start, space.desc.sector_length);

    let mut addr = body_start;
    loop {
        if addr + HEADER_SIZE > body_end {
            break;
        }
        let window = match flash_api::ReadFlash::view(flash, addr, HEADER_SIZE) {
            Ok(w) => w,
            Err(_) => break,
        };
        if codec::is_all_fresh(window) {
            break;
        }
        let raw: [u8; HEADER_SIZE] = window.try_into().expect("HEADER_SIZE bytes");
        let decoded = codec::decode(&raw);
        if !codec::basic_sanity_check(&decoded, addr) {
            break;
        }
        let consumed = codec::offset_to_next_tag(decoded.length);

        if codec::is_clean(&decoded, addr) {
            let slot = space.index_slot(sink, decoded.tag_number);
            if space.index[slot] == Some(addr) {
                let mut payload = alloc::vec![0u8; decoded.length as usize];
                if decoded.length > 0 {
                    let src = flash_api::ReadFlash::view(flash, addr + HEADER_SIZE, decoded.length as usize)
                        .unwrap_or_else(|_| sink.register_fatal_error(FatalCode::SectorUnfixable));
                    payload.copy_from_slice(src);
                }
                let moved = writer::write_tag_with_policy(
                    flash,
                    sink,
                    space,
                    decoded.tag_number,
                    &payload,
                    SelectPolicy::NextAndIncrement,
                );
                if moved.is_none() {
                    sink.register_fatal_error(FatalCode::WriteFailedWhileAbandoning);
                }
                // write_tag already flipped DIRTY on this exact address as
                // its "prior version", so there is nothing further to do.
            }
        }

        addr += consumed;
    }
}

/// `reclaim_sector`: marks `sector` abandoning, moves its live tags out,
/// and returns it for the caller to erase.
pub fn reclaim_sector<D: FlashDriver>(
    flash: &mut D,
    sink: &mut dyn FatalSink,
    space: &mut SpaceState,
    sector: usize,
) -> usize {
    space.vitals.sector_abandoning = sector;
    abandon_sector(flash, sink, space, sector);
    sector
}

/// Blocks on the driver erase, verifies the sector came back all-1s, and
/// resets its vitals/stats to the fresh state.
pub fn erase_sector_foreground<D: FlashDriver>(
    flash: &mut D,
    sink: &mut dyn FatalSink,
    space: &mut SpaceState,
    sector: usize,
) {
    space.vitals.sector_erasing = sector;
    let sector_start = space.desc.sector_start(sector);

    if flash.erase(sector_start).is_err() {
        sink.register_fatal_error(FatalCode::EraseVerifyFail);
    }

    let sector_len = space.desc.sector_length;
    let whole = match flash_api::ReadFlash::view(flash, sector_start, sector_len) {
        Ok(w) => w,
        Err(_) => sink.register_fatal_error(FatalCode::EraseVerifyFail),
    };
    if !codec::is_all_fresh(whole) {
        sink.register_fatal_error(FatalCode::EraseVerifyFail);
    }

    let (body_start, body_end) = scanner::body_bounds(sector_start, sector_len);
    space.sector_vitals[sector].last_tag_address = None;
    space.sector_stats[sector] = crate::space::SectorStats {
        clean_tags: 0,
        dirty_tags: 0,
        insane_tags: 0,
        clean_bytes: 0,
        unclean_bytes: 0,
        free_bytes: body_end - body_start,
    };
    space.vitals.sector_erasing = crate::space::NO_SECTOR;
    if space.vitals.sector_abandoning == sector {
        space.vitals.sector_abandoning = crate::space::NO_SECTOR;
    }
    space.recompute_space_stats();
}

/// Acts on a pending `sector_abandoning` only, per the spec: reclamation
/// and erasure are two separate steps the caller invokes in sequence.
pub fn erase_if_needed<D: FlashDriver>(
    flash: &mut D,
    sink: &mut dyn FatalSink,
    space: &mut SpaceState,
) -> bool {
    let pending = space.vitals.sector_abandoning;
    if pending == crate::space::NO_SECTOR {
        return false;
    }
    erase_sector_foreground(flash, sink, space, pending);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use flash_api::SpaceDescriptor;

    fn space_with_stats(per_sector: &[(usize, usize)]) -> SpaceState {
        let desc = SpaceDescriptor {
            start_addr: 0,
            sector_length: 1024,
            num_sectors: per_sector.len(),
            max_tag_number: 4,
        };
        let mut space = SpaceState::new(desc);
        for (i, &(clean, unclean)) in per_sector.iter().enumerate() {
            space.sector_stats[i].clean_bytes = clean;
            space.sector_stats[i].unclean_bytes = unclean;
            space.sector_stats[i].free_bytes = 1024 - clean - unclean;
        }
        space.recompute_space_stats();
        space
    }

    #[test]
    fn most_unclean_always_picks_the_worst_sector() {
        let space = space_with_stats(&[(100, 10), (50, 500)]);
        assert_eq!(score(&space, ScoreMethod::MostUnclean), Some(1));
    }

    #[test]
    fn unclean_threshold_requires_crossing_the_bar() {
        let space = space_with_stats(&[(0, 10), (0, 20)]);
        // unclean_bytes/max_sector_free is tiny here, well under 40%.
        assert_eq!(score(&space, ScoreMethod::UncleanThreshold), None);

        let space = space_with_stats(&[(0, 900)]);
        assert_eq!(score(&space, ScoreMethod::UncleanThreshold), Some(0));
    }

    #[test]
    fn asymptotic_reclaims_a_severely_dirty_single_sector_regardless_of_total() {
        let space = space_with_stats(&[(0, 900), (900, 0)]);
        assert_eq!(score(&space, ScoreMethod::Asymptotic), Some(0));
    }

    #[test]
    fn asymptotic_does_nothing_when_everything_is_roomy_and_clean() {
        let space = space_with_stats(&[(10, 10), (10, 10)]);
        assert_eq!(score(&space, ScoreMethod::Asymptotic), None);
    }
}
