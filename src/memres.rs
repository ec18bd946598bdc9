// Copyright The Rockboot Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Memory-region reservation.
//!
//! The image loader and boot-image relocator carve their load buffers out of
//! the RAM bank with named reservations; the bank tracks them in a fixed
//! table and answers free-space queries with a first-fit scan. There is no
//! deallocation pressure at boot, so the table stays small and ordered.

use arrayvec::ArrayVec;
use thiserror::Error;
use zerocopy::FromZeros;

/// Creates a zeroed instance of the given type.
///
/// This is equivalent to `FromZeros::new_zeroed()` but const, for statics
/// that are too large to spell out.
pub const fn const_zeroed<T: FromZeros>() -> T {
    // SAFETY: T implements `FromZeros` so it must be safe to initialise
    // with zeros.
    unsafe { core::mem::zeroed() }
}

/// Reservation failures.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum ResourceError {
    /// No gap in the bank fits the request.
    #[error("no free space for the requested region")]
    NoSpace,
    /// A fixed-placement request collides with an existing region.
    #[error("region overlaps an existing reservation")]
    Overlap,
    /// Zero-sized or out-of-bank request.
    #[error("invalid region request")]
    InvalidRequest,
    /// The reservation table is full.
    #[error("reservation table full")]
    TableFull,
}

/// One reserved address range, inclusive of `start`, exclusive of `end`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Region {
    /// First byte of the region.
    pub start: u64,
    /// One past the last byte.
    pub end: u64,
    /// Owner tag, for diagnostics.
    pub name: &'static str,
}

impl Region {
    /// Size of the region in bytes.
    pub fn size(&self) -> u64 {
        self.end - self.start
    }
}

const MAX_REGIONS: usize = 32;

/// One RAM bank with its reservation table, kept sorted by start address.
pub struct MemoryBank {
    start: u64,
    end: u64,
    regions: ArrayVec<Region, MAX_REGIONS>,
}

impl MemoryBank {
    /// Describes a bank covering `size` bytes from `start`.
    pub fn new(start: u64, size: u64) -> Self {
        Self {
            start,
            end: start + size,
            regions: ArrayVec::new(),
        }
    }

    /// Registered reservations, ordered by address.
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    fn insert(&mut self, region: Region) -> Result<Region, ResourceError> {
        let at = self
            .regions
            .iter()
            .position(|r| r.start > region.start)
            .unwrap_or(self.regions.len());
        self.regions
            .try_insert(at, region)
            .map_err(|_| ResourceError::TableFull)?;
        Ok(region)
    }

    /// Reserves an exact range.
    pub fn request_region(
        &mut self,
        name: &'static str,
        start: u64,
        size: u64,
    ) -> Result<Region, ResourceError> {
        if size == 0 || start < self.start || start + size > self.end {
            return Err(ResourceError::InvalidRequest);
        }
        let end = start + size;
        if self
            .regions
            .iter()
            .any(|r| start < r.end && r.start < end)
        {
            return Err(ResourceError::Overlap);
        }
        self.insert(Region { start, end, name })
    }

    /// Reserves `size` bytes at `align`ment from the first fitting gap.
    pub fn allocate(
        &mut self,
        name: &'static str,
        size: u64,
        align: u64,
    ) -> Result<Region, ResourceError> {
        if size == 0 || align == 0 || !align.is_power_of_two() {
            return Err(ResourceError::InvalidRequest);
        }
        let mut candidate = self.start.next_multiple_of(align);
        for region in &self.regions {
            if candidate + size <= region.start {
                break;
            }
            if candidate < region.end {
                candidate = region.end.next_multiple_of(align);
            }
        }
        if candidate + size > self.end {
            return Err(ResourceError::NoSpace);
        }
        self.insert(Region {
            start: candidate,
            end: candidate + size,
            name,
        })
    }

    /// Releases a reservation.
    pub fn release(&mut self, region: &Region) {
        if let Some(at) = self.regions.iter().position(|r| r == region) {
            self.regions.remove(at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_scan_first_fit() {
        let mut bank = MemoryBank::new(0x1000, 0x1000);
        let a = bank.allocate("image", 0x100, 0x10).unwrap();
        assert_eq!(a.start, 0x1000);
        let b = bank.allocate("initrd", 0x100, 0x10).unwrap();
        assert_eq!(b.start, 0x1100);

        // Releasing the first region reopens the gap.
        bank.release(&a);
        let c = bank.allocate("dtb", 0x80, 0x10).unwrap();
        assert_eq!(c.start, 0x1000);
    }

    #[test]
    fn alignment_is_respected() {
        let mut bank = MemoryBank::new(0x1004, 0x1000);
        let region = bank.allocate("image", 0x40, 0x100).unwrap();
        assert_eq!(region.start, 0x1100);
    }

    #[test]
    fn fixed_requests_reject_overlap() {
        let mut bank = MemoryBank::new(0x0, 0x1000);
        bank.request_region("scratch", 0x200, 0x100).unwrap();
        assert_eq!(
            bank.request_region("other", 0x280, 0x100),
            Err(ResourceError::Overlap)
        );
        // Adjacent is fine; ranges are exclusive at the end.
        bank.request_region("other", 0x300, 0x100).unwrap();
    }

    #[test]
    fn allocation_flows_around_fixed_regions() {
        let mut bank = MemoryBank::new(0x0, 0x1000);
        bank.request_region("hole", 0x0, 0x100).unwrap();
        let region = bank.allocate("image", 0x100, 0x10).unwrap();
        assert_eq!(region.start, 0x100);
    }

    #[test]
    fn exhaustion_reports_no_space() {
        let mut bank = MemoryBank::new(0x0, 0x100);
        bank.allocate("a", 0x100, 1).unwrap();
        assert_eq!(bank.allocate("b", 1, 1), Err(ResourceError::NoSpace));
    }

    #[test]
    fn zeroed_helper_builds_large_statics() {
        static SCRATCH: [u8; 4096] = const_zeroed();
        assert_eq!(SCRATCH[0], 0);
        assert_eq!(SCRATCH[4095], 0);
    }
}
