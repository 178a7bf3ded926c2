//! Power-up recovery: find-and-erase interrupted erases, survey and repair
//! every sector, and rebuild the latest-version index.

use flash_api::{FlashDriver, ReadFlash};

use crate::codec::{self, HEADER_SIZE};
use crate::error::{FatalCode, FatalSink};
use crate::scanner::{self, ScanOutcome};
use crate::space::{SectorStats, SpaceState};
use crate::writer;

/// One driver-assisted repair attempt: writes the merged header, then the
/// final status byte, over the suspect tag at `addr`.
fn repair_partial_tag<D: FlashDriver>(flash: &mut D, sink: &mut dyn FatalSink, addr: usize) {
    let window = match flash.view(addr, HEADER_SIZE) {
        Ok(w) => w,
        Err(_) => sink.register_fatal_error(FatalCode::CantFixPartialTag),
    };
    let raw: [u8; HEADER_SIZE] = window.try_into().expect("HEADER_SIZE bytes");
    let plan = codec::plan_repair(&raw);

    if flash.write(addr, &plan.first).is_err() {
        sink.register_fatal_error(FatalCode::TagFixFailed);
    }
    if flash.write(addr + 1, &[plan.final_status_wire]).is_err() {
        sink.register_fatal_error(FatalCode::TagFixFailed);
    }
}

/// Re-surveys `sector` and, if it isn't `Sane`, repairs the one
/// problem tag a `Recoverable` scan reports. A sector that still isn't
/// sane after repair is unfixable.
pub fn repair_sector_if_needed<D: FlashDriver>(
    flash: &mut D,
    sink: &mut dyn FatalSink,
    space: &SpaceState,
    sector: usize,
) {
    let sector_start = space.desc.sector_start(sector);
    let (body_start, body_end) = scanner::body_bounds(sector_start, space.desc.sector_length);

    match scanner::scan_sector(flash, body_start, body_end) {
        ScanOutcome::Sane => {}
        ScanOutcome::Recoverable { problem_tag_address } => {
            repair_partial_tag(flash, sink, problem_tag_address);
            match scanner::scan_sector(flash, body_start, body_end) {
                ScanOutcome::Sane => {}
                _ => sink.register_fatal_error(FatalCode::SectorUnfixable),
            }
        }
        ScanOutcome::Failed => sink.register_fatal_error(FatalCode::SectorUnfixable),
    }
}

/// Walks every sector in `space`; any that fails basic layout sanity is
/// treated as an interrupted erase and handed directly to the driver's
/// erase, rather than attempted header repair. Only run when the caller
/// opts in (`find_and_erase_bad_sectors`), since it discards sector
/// contents outright.
pub fn find_and_erase_bad_sectors<D: FlashDriver>(flash: &mut D, sink: &mut dyn FatalSink, space: &SpaceState) {
    for sector in 0..space.desc.num_sectors {
        let sector_start = space.desc.sector_start(sector);
        let (body_start, body_end) = scanner::body_bounds(sector_start, space.desc.sector_length);
        if let ScanOutcome::Failed = scanner::scan_sector(flash, body_start, body_end) {
            if flash.erase(sector_start).is_err() {
                sink.register_fatal_error(FatalCode::EraseVerifyFail);
            }
        }
    }
}

fn walk_and_account<D: FlashDriver>(
    flash: &mut D,
    sink: &mut dyn FatalSink,
    space: &mut SpaceState,
    sector: usize,
) {
    let sector_start = space.desc.sector_start(sector);
    let (body_start, body_end) = scanner::body_bounds(sector_start, space.desc.sector_length);

    let mut stats = SectorStats::default();
    let mut addr = body_start;
    loop {
        if addr + HEADER_SIZE > body_end {
            break;
        }
        let window = match ReadFlash::view(flash, addr, HEADER_SIZE) {
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
            stats.clean_tags += 1;
            stats.clean_bytes += consumed;

            let slot = space.index_slot(sink, decoded.tag_number);
            match space.index[slot] {
                None => space.index[slot] = Some(addr),
                Some(existing) => {
                    let existing_header = {
                        let w = ReadFlash::view(flash, existing, HEADER_SIZE)
                            .unwrap_or_else(|_| sink.register_fatal_error(FatalCode::BadTagPtrEnum));
                        let r: [u8; HEADER_SIZE] = w.try_into().expect("HEADER_SIZE bytes");
                        codec::decode(&r)
                    };
                    if writer::is_latest_version(decoded.version, true, existing_header.version, true) {
                        writer::mark_dirty(flash, sink, space, existing);
                        space.index[slot] = Some(addr);
                        // mark_dirty already adjusted `existing`'s sector
                        // stats via `space.sector_stats`, but if `existing`
                        // lives in this same sector, this walk's local
                        // `stats` accumulator already counted it clean
                        // (from an earlier iteration) and will overwrite
                        // `space.sector_stats[sector]` wholesale once this
                        // loop finishes -- undoing mark_dirty's adjustment.
                        // Demote it in `stats` too when that's the case.
                        if space.sector_of_address(sink, existing) == sector {
                            let existing_consumed = codec::offset_to_next_tag(existing_header.length);
                            stats.clean_tags = stats.clean_tags.saturating_sub(1);
                            stats.clean_bytes = stats.clean_bytes.saturating_sub(existing_consumed);
                            stats.dirty_tags += 1;
                            stats.unclean_bytes += existing_consumed;
                        }
                    } else {
                        writer::mark_dirty(flash, sink, space, addr);
                        stats.clean_tags -= 1;
                        stats.clean_bytes -= consumed;
                        stats.dirty_tags += 1;
                        stats.unclean_bytes += consumed;
                    }
                }
            }
        } else if codec::is_insane(&decoded, addr) {
            stats.insane_tags += 1;
            stats.unclean_bytes += consumed;
        } else {
            // Dirty (or insane-but-not-flagged, closed by repair earlier
            // this boot) tags are all unclean garbage from GC's point of
            // view.
            stats.dirty_tags += 1;
            stats.unclean_bytes += consumed;
        }

        addr += consumed;
    }

    stats.free_bytes = body_end.saturating_sub(addr);
    space.sector_vitals[sector].last_tag_address = scanner::last_tag_in_sector(flash, body_start, body_end);
    space.sector_stats[sector] = stats;
}

/// Recomputes `sector`'s stats from its current contents without touching
/// the latest-version index. Unlike `walk_and_account`, this is safe to call
/// mid-run: re-walking an already-indexed sector the boot-time way would see
/// its own indexed tags as "existing" entries and flag them as collisions
/// against themselves.
fn recount_sector_stats<D: FlashDriver>(flash: &mut D, space: &mut SpaceState, sector: usize) {
    let sector_start = space.desc.sector_start(sector);
    let (body_start, body_end) = scanner::body_bounds(sector_start, space.desc.sector_length);

    let mut stats = SectorStats::default();
    let mut addr = body_start;
    loop {
        if addr + HEADER_SIZE > body_end {
            break;
        }
        let window = match ReadFlash::view(flash, addr, HEADER_SIZE) {
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
            stats.clean_tags += 1;
            stats.clean_bytes += consumed;
        } else if codec::is_insane(&decoded, addr) {
            stats.insane_tags += 1;
            stats.unclean_bytes += consumed;
        } else {
            stats.dirty_tags += 1;
            stats.unclean_bytes += consumed;
        }

        addr += consumed;
    }

    stats.free_bytes = body_end.saturating_sub(addr);
    space.sector_vitals[sector].last_tag_address = scanner::last_tag_in_sector(flash, body_start, body_end);
    space.sector_stats[sector] = stats;
}

/// `RepairPhonySectorsFull`: re-surveys and repairs every sector in `space`,
/// then refreshes their stats, without disturbing the latest-version index.
/// Run once, ahead of scoring, whenever `dig_deeper_into_garbage` is set --
/// the escalation spec.md describes for GC after an exceptional write
/// failure.
pub fn repair_all_sectors<D: FlashDriver>(flash: &mut D, sink: &mut dyn FatalSink, space: &mut SpaceState) {
    for sector in 0..space.desc.num_sectors {
        repair_sector_if_needed(flash, sink, space, sector);
        recount_sector_stats(flash, space, sector);
    }
    space.recompute_space_stats();
}

/// `InitializeSectors`: survey, repair, cache append point, recompute
/// stats, and rebuild the latest-version index for every sector in
/// `space`.
pub fn initialize_sectors<D: FlashDriver>(flash: &mut D, sink: &mut dyn FatalSink, space: &mut SpaceState) {
    for sector in 0..space.desc.num_sectors {
        repair_sector_if_needed(flash, sink, space, sector);
    }
    for sector in 0..space.desc.num_sectors {
        walk_and_account(flash, sink, space, sector);
    }
}

/// `init(find_and_erase_bad_sectors)` for a single space: the other spaces
/// in a `Store` are handled by the caller looping over this per space.
pub fn init_space<D: FlashDriver>(
    flash: &mut D,
    sink: &mut dyn FatalSink,
    space: &mut SpaceState,
    find_and_erase_bad_sectors_flag: bool,
) {
    space.reset_vitals();

    if find_and_erase_bad_sectors_flag {
        find_and_erase_bad_sectors(flash, sink, space);
    }

    initialize_sectors(flash, sink, space);

    space.recompute_space_stats();
    space.vitals.current_write_sector = writer::select_fullest(flash, space, sink, 1).unwrap_or(0);
}
