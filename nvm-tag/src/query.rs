//! Read-side API: `read_tag`, `latest_tag_info`, `sanity_check_sector`,
//! `n_versions`, `total_reset`, and the direct sector-stats accessor.

use flash_api::{FlashDriver, ReadFlash};

use crate::codec::{self, HEADER_SIZE};
use crate::error::FatalSink;
use crate::scanner::{self, ScanOutcome};
use crate::space::{SectorStats, SpaceState};
use crate::RESERVED;

/// Metadata-only result for a tag's latest clean version.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TagInfo {
    pub version: u16,
    pub length: u16,
    pub address: usize,
}

fn header_at(flash: &dyn ReadFlash, addr: usize) -> Option<codec::DecodedHeader> {
    let window = flash.view(addr, HEADER_SIZE).ok()?;
    let raw: [u8; HEADER_SIZE] = window.try_into().ok()?;
    Some(codec::decode(&raw))
}

/// `(data, length)` for the latest clean version of `tag_number`, or
/// `None` if no clean version exists. The returned slice borrows directly
/// out of flash and is only valid until the next mutating call on this
/// space.
pub fn read_tag<'f, D: FlashDriver>(
    flash: &'f D,
    sink: &mut dyn FatalSink,
    space: &SpaceState,
    tag_number: u16,
) -> Option<(&'f [u8], u16)> {
    let slot = space.index_slot(sink, tag_number);
    let addr = space.index[slot]?;
    let header = header_at(flash, addr)?;
    let data = flash.view(addr + HEADER_SIZE, header.length as usize).ok()?;
    Some((data, header.length))
}

pub fn latest_tag_info<D: FlashDriver>(
    flash: &D,
    sink: &mut dyn FatalSink,
    space: &SpaceState,
    tag_number: u16,
) -> Option<TagInfo> {
    let slot = space.index_slot(sink, tag_number);
    let addr = space.index[slot]?;
    let header = header_at(flash, addr)?;
    Some(TagInfo {
        version: header.version,
        length: header.length,
        address: addr,
    })
}

/// Verifies the reserved regions and headroom are untouched and the
/// payload body scans `Sane`.
pub fn sanity_check_sector<D: FlashDriver>(flash: &D, space: &SpaceState, sector: usize) -> bool {
    let sector_start = space.desc.sector_start(sector);
    let sector_len = space.desc.sector_length;

    let bottom_reserved = match flash.view(sector_start, RESERVED) {
        Ok(b) => b,
        Err(_) => return false,
    };
    if !codec::is_all_fresh(bottom_reserved) {
        return false;
    }

    let (body_start, body_end) = scanner::body_bounds(sector_start, sector_len);
    let top_region_start = body_end;
    let top_region_len = sector_start + sector_len - body_end;
    let top_region = match flash.view(top_region_start, top_region_len) {
        Ok(b) => b,
        Err(_) => return false,
    };
    if !codec::is_all_fresh(top_region) {
        return false;
    }

    matches!(scanner::scan_sector(flash, body_start, body_end), ScanOutcome::Sane)
}

pub fn sector_stats(space: &SpaceState, sector: usize) -> SectorStats {
    space.sector_stats[sector]
}

fn walk_tag_versions<D: FlashDriver>(
    flash: &D,
    space: &SpaceState,
    tag_number: u16,
    lo: u16,
    hi: u16,
    out: &mut [TagInfo],
) -> (usize, bool) {
    let mut count = 0usize;
    let mut truncated = false;

    for sector in 0..space.desc.num_sectors {
        let sector_start = space.desc.sector_start(sector);
        let (body_start, body_end) = scanner::body_bounds(sector_start, space.desc.sector_length);
        let mut addr = body_start;
        loop {
            if addr + HEADER_SIZE > body_end {
                break;
            }
            let window = match flash.view(addr, HEADER_SIZE) {
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

            let matches_tag = decoded.tag_number == tag_number
                && (codec::is_clean(&decoded, addr) || codec::is_dirty(&decoded, addr))
                && decoded.version >= lo
                && decoded.version <= hi;

            if matches_tag {
                if count < out.len() {
                    out[count] = TagInfo {
                        version: decoded.version,
                        length: decoded.length,
                        address: addr,
                    };
                } else {
                    truncated = true;
                }
                count += 1;
            }

            addr += consumed;
        }
    }

    (count, !truncated)
}

/// `n_versions(space, tag, version_hi, version_lo, out, max)`: the special
/// cases are exactly as documented -- `(0, 0)` means every version,
/// `(0, k)` means the `k` versions below the latest, and `(h, 0)` means
/// every version from `VERSION_MIN` up through `h`.
pub fn n_versions<D: FlashDriver>(
    flash: &D,
    sink: &mut dyn FatalSink,
    space: &SpaceState,
    tag_number: u16,
    version_hi: u16,
    version_lo: u16,
    out: &mut [TagInfo],
) -> (usize, bool) {
    let (lo, hi) = if version_hi == 0 && version_lo == 0 {
        (codec::VERSION_MIN, codec::VERSION_MAX_SANE)
    } else if version_hi == 0 {
        let latest = latest_tag_info(flash, sink, space, tag_number)
            .map(|info| info.version)
            .unwrap_or(codec::VERSION_MIN);
        (latest.saturating_sub(version_lo).max(codec::VERSION_MIN), latest)
    } else if version_lo == 0 {
        (codec::VERSION_MIN, version_hi)
    } else {
        (version_lo, version_hi)
    };

    walk_tag_versions(flash, space, tag_number, lo, hi, out)
}

/// Force-erases every sector in `space` and wipes its vitals and index.
/// `init` must be called again before any other API is used.
pub fn total_reset<D: FlashDriver>(flash: &mut D, sink: &mut dyn FatalSink, space: &mut SpaceState) {
    for sector in 0..space.desc.num_sectors {
        let sector_start = space.desc.sector_start(sector);
        if flash.erase(sector_start).is_err() {
            sink.register_fatal_error(crate::error::FatalCode::EraseVerifyFail);
        }
    }
    space.reset_vitals();
}
