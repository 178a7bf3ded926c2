//! Sector scanner: walks a sector's tags and classifies what it finds.
//!
//! Scan results depend only on the sector's current flash contents, so
//! the scanner never touches `ReadFlash` state and never allocates.

use flash_api::ReadFlash;

use crate::codec::{self, HEADER_SIZE};
use crate::{HEADROOM, RESERVED};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ScanOutcome {
    /// The sector's tags are well-formed and the tail is fresh.
    Sane,
    /// A single partially-written tag sits at `problem_tag_address`;
    /// everything else in the sector is sound and the tail past the
    /// problem tag is fresh.
    Recoverable { problem_tag_address: usize },
    /// Something in the sector cannot be explained by a clean append
    /// history; the sector cannot be trusted without driver-level erase.
    Failed,
}

/// Start (inclusive) and end (exclusive) of the writable body of a sector,
/// i.e. excluding the reserved regions and headroom.
pub fn body_bounds(sector_start: usize, sector_length: usize) -> (usize, usize) {
    let start = sector_start + RESERVED;
    let end = sector_start + sector_length - RESERVED - HEADROOM;
    (start, end)
}

fn is_fresh_span(flash: &dyn ReadFlash, addr: usize, len: usize) -> bool {
    if len == 0 {
        return true;
    }
    match flash.view(addr, len) {
        Ok(bytes) => codec::is_all_fresh(bytes),
        Err(_) => false,
    }
}

/// Walk a sector from `body_start` to `body_end`, classifying it as
/// `Sane`, `Recoverable`, or `Failed`.
pub fn scan_sector(flash: &dyn ReadFlash, body_start: usize, body_end: usize) -> ScanOutcome {
    let mut addr = body_start;
    loop {
        if addr + HEADER_SIZE > body_end {
            let tail_len = body_end.saturating_sub(addr);
            return if is_fresh_span(flash, addr, tail_len) {
                ScanOutcome::Sane
            } else {
                ScanOutcome::Failed
            };
        }

        let window = match flash.view(addr, HEADER_SIZE) {
            Ok(w) => w,
            Err(_) => return ScanOutcome::Failed,
        };

        if codec::is_all_fresh(window) {
            let tail_len = body_end - addr;
            return if is_fresh_span(flash, addr, tail_len) {
                ScanOutcome::Sane
            } else {
                ScanOutcome::Failed
            };
        }

        let raw: [u8; HEADER_SIZE] = window.try_into().expect("view returned HEADER_SIZE bytes");
        let decoded = codec::decode(&raw);

        if codec::basic_sanity_check(&decoded, addr) {
            if (decoded.status & codec::status::DATA_WRITTEN) != 0 {
                addr += codec::offset_to_next_tag(decoded.length);
                continue;
            }
            let rest_from = addr + codec::offset_to_next_tag(decoded.length);
            let tail_len = body_end.saturating_sub(rest_from);
            return if rest_from <= body_end && is_fresh_span(flash, rest_from, tail_len) {
                ScanOutcome::Recoverable {
                    problem_tag_address: addr,
                }
            } else {
                ScanOutcome::Failed
            };
        }

        if codec::is_partial_header_correctable(&raw) {
            let rest_from = addr + HEADER_SIZE;
            let tail_len = body_end.saturating_sub(rest_from);
            return if rest_from <= body_end && is_fresh_span(flash, rest_from, tail_len) {
                ScanOutcome::Recoverable {
                    problem_tag_address: addr,
                }
            } else {
                ScanOutcome::Failed
            };
        }

        return ScanOutcome::Failed;
    }
}

/// Address of the last well-formed header in the sector (clean, dirty, or
/// insane-but-structurally-sound), for O(1) append-point lookup. Stops at
/// the first fresh region or the first header that fails
/// `basic_sanity_check`.
pub fn last_tag_in_sector(flash: &dyn ReadFlash, body_start: usize, body_end: usize) -> Option<usize> {
    let mut addr = body_start;
    let mut last = None;
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
        let raw: [u8; HEADER_SIZE] = window.try_into().expect("view returned HEADER_SIZE bytes");
        let decoded = codec::decode(&raw);
        if !codec::basic_sanity_check(&decoded, addr) {
            break;
        }
        last = Some(addr);
        addr += codec::offset_to_next_tag(decoded.length);
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ram(Vec<u8>);
    impl ReadFlash for Ram {
        fn read_size(&self) -> usize {
            1
        }
        fn capacity(&self) -> usize {
            self.0.len()
        }
        fn view(&self, offset: usize, len: usize) -> flash_api::Result<&[u8]> {
            Ok(&self.0[offset..offset + len])
        }
    }

    #[test]
    fn empty_sector_is_sane() {
        let ram = Ram(vec![0xFF; 256]);
        let (start, end) = body_bounds(0, 256);
        assert_eq!(scan_sector(&ram, start, end), ScanOutcome::Sane);
    }

    #[test]
    fn one_clean_tag_then_fresh_is_sane() {
        let mut buf = vec![0xFF; 256];
        let fields = codec::TagFields {
            tag_number: 1,
            version: 1,
            length: 3,
        };
        let mut header = codec::encode(&fields);
        header[1] = 0xFF ^ (codec::status::HEADER_WRITTEN | codec::status::DATA_WRITTEN);
        let (start, _) = body_bounds(0, 256);
        buf[start..start + HEADER_SIZE].copy_from_slice(&header);
        buf[start + HEADER_SIZE..start + HEADER_SIZE + 3].copy_from_slice(&[1, 2, 3]);
        let ram = Ram(buf);
        let (_, end) = body_bounds(0, 256);
        assert_eq!(scan_sector(&ram, start, end), ScanOutcome::Sane);
        assert_eq!(last_tag_in_sector(&ram, start, end), Some(start));
    }

    #[test]
    fn header_only_tag_is_recoverable() {
        let mut buf = vec![0xFF; 256];
        let fields = codec::TagFields {
            tag_number: 1,
            version: 1,
            length: 3,
        };
        let mut header = codec::encode(&fields);
        header[1] = 0xFF ^ codec::status::HEADER_WRITTEN;
        let (start, end) = body_bounds(0, 256);
        buf[start..start + HEADER_SIZE].copy_from_slice(&header);
        let ram = Ram(buf);
        match scan_sector(&ram, start, end) {
            ScanOutcome::Recoverable { problem_tag_address } => assert_eq!(problem_tag_address, start),
            other => panic!("expected Recoverable, got {:?}", other),
        }
    }

    #[test]
    fn garbage_in_middle_is_failed() {
        let mut buf = vec![0xFF; 256];
        let (start, end) = body_bounds(0, 256);
        buf[start] = 0x42;
        let ram = Ram(buf);
        assert_eq!(scan_sector(&ram, start, end), ScanOutcome::Failed);
    }
}
