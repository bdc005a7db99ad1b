//! Allocation records and guard-page placement arithmetic.
//!
//! Every allocation carries an [`AllocationRecord`] that is enough to free it
//! without any side table. Where the record and the user pointer go depends
//! on the [`DetectionMode`]:
//!
//! ```text
//!   Overrun mode (small run of N pages, guard last):
//!   ┌──────────── committed ────────────┬───────┐
//!   │ slack ...  [record][ user data   ]│ guard │
//!   └───────────────────────────────────┴───────┘
//!                        ▲             ▲
//!                        user          user + size == guard boundary
//!
//!   Underrun mode (guard first):
//!   ┌───────┬──────────── committed ────────────┐
//!   │ guard │[ user data ] ...  slack  [record] │
//!   └───────┴───────────────────────────────────┘
//!            ▲                          ▲
//!            user (page aligned)        last RECORD_SIZE bytes of the span
//! ```
//!
//! In overrun mode the record sits directly before the user pointer. In
//! underrun mode its offset depends on the size and alignment, so it is
//! found by scanning forward one page at a time for the marker in the last
//! [`RECORD_SIZE`] bytes of each page. The scan assumes the user data never
//! contains a valid-looking record at a page tail before the real one.
//!
//! All placement is expressed as offsets from a region base so the caller
//! keeps pointer provenance.

use super::small_pages::{MIN_ALLOCATION_SIZE, PAGE_SIZE};
use std::ptr::NonNull;

/// Which side of the user data the guard page sits on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DetectionMode {
    /// Guard page after the data: writes past the end fault.
    #[default]
    Overrun,
    /// Guard page before the data: writes before the start fault.
    Underrun,
}

/// Bytes reserved next to every allocation for its record.
pub const RECORD_SIZE: usize = size_of::<AllocationRecord>();

/// Alignment used when the caller passes zero.
pub const DEFAULT_ALIGNMENT: usize = 2 * size_of::<usize>();

/// Largest size a record can describe.
pub(crate) const MAX_RECORDED_SIZE: usize = u32::MAX as usize;

const RECORD_MARKER: u32 = 0xDE7E_C7ED;

const SMALL_FLAG: u64 = 1 << 63;
const GROUP_SHIFT: u32 = 16;
const GROUP_MASK: u64 = 0xFFFF_FFFF;
const PAGE_MASK: u64 = 0xFFFF;
const ALIGN_SHIFT_MASK: u64 = 0x3F;

const _: () = assert!(RECORD_SIZE == 16);
const _: () = assert!(ALIGN_SHIFT_MASK < PAGE_SIZE as u64);

/// Where an allocation's pages came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Backing {
    /// A run inside a small allocation group.
    Small { group: u32, page: usize },
    /// A dedicated reservation. `alignment` is needed to recompute its length.
    Large { base: NonNull<u8>, alignment: usize },
}

/// Header stored next to every allocation.
///
/// `info` packs either a small run's `(group, page)` with the top bit set, or
/// a large reservation's page-aligned base with `log2(alignment)` in its low
/// bits.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct AllocationRecord {
    info: u64,
    marker: u32,
    size: u32,
}

impl AllocationRecord {
    pub(crate) fn small(group: u32, page: usize, size: u32) -> Self {
        debug_assert!(page as u64 <= PAGE_MASK);
        Self {
            info: SMALL_FLAG | (u64::from(group) << GROUP_SHIFT) | (page as u64 & PAGE_MASK),
            marker: RECORD_MARKER,
            size,
        }
    }

    pub(crate) fn large(base: NonNull<u8>, alignment: usize, size: u32) -> Self {
        let addr = base.as_ptr().expose_provenance() as u64;
        debug_assert!(addr & SMALL_FLAG == 0, "reservation base {base:p} uses the top bit");
        debug_assert!(addr.is_multiple_of(PAGE_SIZE as u64), "reservation base {base:p} is not page aligned");
        debug_assert!(alignment.is_power_of_two());
        Self {
            info: addr | u64::from(alignment.trailing_zeros()),
            marker: RECORD_MARKER,
            size,
        }
    }

    #[inline]
    pub(crate) fn is_valid(&self) -> bool {
        self.marker == RECORD_MARKER
    }

    #[inline]
    pub(crate) fn is_small(&self) -> bool {
        self.info & SMALL_FLAG != 0
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.size as usize
    }

    pub(crate) fn backing(&self) -> Backing {
        if self.is_small() {
            Backing::Small {
                group: ((self.info >> GROUP_SHIFT) & GROUP_MASK) as u32,
                page: (self.info & PAGE_MASK) as usize,
            }
        } else {
            let addr = (self.info & !ALIGN_SHIFT_MASK) as usize;
            let base = std::ptr::with_exposed_provenance_mut::<u8>(addr);
            Backing::Large {
                // Large records are only built from a non-null base.
                base: NonNull::new(base).unwrap_or(NonNull::dangling()),
                alignment: 1usize << (self.info & ALIGN_SHIFT_MASK),
            }
        }
    }

    /// # Safety
    /// `addr..addr + RECORD_SIZE` must be writable.
    #[inline]
    pub(crate) unsafe fn write_to(self, addr: NonNull<u8>) {
        // Safety: upheld by caller; records are not necessarily aligned.
        unsafe { addr.cast::<Self>().write_unaligned(self) };
    }

    /// # Safety
    /// `addr..addr + RECORD_SIZE` must be readable.
    #[inline]
    pub(crate) unsafe fn read_from(addr: NonNull<u8>) -> Self {
        // Safety: upheld by caller.
        unsafe { addr.cast::<Self>().read_unaligned() }
    }
}

/// Size-derived layout of one allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Geometry {
    pub size: usize,
    pub alignment: usize,
    /// Data (rounded to the alignment) plus the record, rounded to pages.
    pub required_space: usize,
}

/// Offsets from a region base, as computed by [`Geometry::place_small`] and
/// [`Geometry::place_large`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Placement {
    pub user: usize,
    pub record: usize,
    pub commit_start: usize,
    pub commit_len: usize,
}

impl Geometry {
    /// `alignment` must be a nonzero power of two. Returns `None` when the
    /// layout overflows the address space.
    pub(crate) fn new(size: usize, alignment: usize) -> Option<Self> {
        debug_assert!(alignment.is_power_of_two(), "alignment {alignment} is not a power of two");
        let required_space = size
            .checked_next_multiple_of(alignment)?
            .checked_add(RECORD_SIZE)?
            .checked_next_multiple_of(PAGE_SIZE)?;
        let geometry = Self {
            size,
            alignment,
            required_space,
        };
        // Reject layouts whose large reservation cannot be expressed.
        required_space
            .checked_add(PAGE_SIZE)?
            .checked_add(geometry.large_slack())?;
        Some(geometry)
    }

    /// Space including the guard page.
    #[inline]
    pub(crate) fn required_page_space(&self) -> usize {
        self.required_space + PAGE_SIZE
    }

    /// Whether the allocation is served from a shared small group.
    #[inline]
    pub(crate) fn is_small(&self) -> bool {
        self.required_page_space() <= MIN_ALLOCATION_SIZE && self.alignment < PAGE_SIZE
    }

    /// Pages of a small run, guard included.
    #[inline]
    pub(crate) fn page_count(&self) -> usize {
        self.required_page_space() / PAGE_SIZE
    }

    /// Extra room a large reservation needs to honour a super-page alignment.
    #[inline]
    pub(crate) fn large_slack(&self) -> usize {
        if self.alignment > PAGE_SIZE { self.alignment } else { 0 }
    }

    /// Exact length of a large reservation; recomputed on free.
    #[inline]
    pub(crate) fn large_reservation_size(&self) -> usize {
        self.required_space + PAGE_SIZE + self.large_slack()
    }

    /// Layout within a small run of `page_count()` pages starting at offset 0.
    pub(crate) fn place_small(&self, mode: DetectionMode) -> Placement {
        match mode {
            DetectionMode::Overrun => {
                // Run base is page aligned and alignment < PAGE_SIZE, so
                // offsets align exactly like addresses.
                let user = overrun_user_offset(0, self.required_space, self.size, self.alignment);
                Placement {
                    user,
                    record: user - RECORD_SIZE,
                    commit_start: 0,
                    commit_len: self.required_space,
                }
            }
            DetectionMode::Underrun => Placement {
                user: PAGE_SIZE,
                record: PAGE_SIZE + self.required_space - RECORD_SIZE,
                commit_start: PAGE_SIZE,
                commit_len: self.required_space,
            },
        }
    }

    /// Layout within a reservation of `large_reservation_size()` bytes whose
    /// base address is `base_addr`.
    pub(crate) fn place_large(&self, mode: DetectionMode, base_addr: usize) -> Placement {
        match mode {
            DetectionMode::Overrun => {
                let data_end = self.required_space + self.large_slack();
                let user = overrun_user_offset(base_addr, data_end, self.size, self.alignment);
                let record = user - RECORD_SIZE;
                let commit_start = align_down(record, PAGE_SIZE);
                let guard = guard_start(user, self.size);
                Placement {
                    user,
                    record,
                    commit_start,
                    commit_len: guard - commit_start,
                }
            }
            DetectionMode::Underrun => {
                let user = (base_addr + PAGE_SIZE).next_multiple_of(self.alignment) - base_addr;
                Placement {
                    user,
                    record: user + self.required_space - RECORD_SIZE,
                    commit_start: user,
                    commit_len: self.required_space,
                }
            }
        }
    }
}

#[inline]
pub(crate) const fn align_down(value: usize, alignment: usize) -> usize {
    value & !(alignment - 1)
}

/// Offset (from a region at `base_addr`) of the highest address aligned to
/// `alignment` at which `size` bytes still end at or before `data_end`.
#[inline]
fn overrun_user_offset(base_addr: usize, data_end: usize, size: usize, alignment: usize) -> usize {
    align_down(base_addr + data_end - size, alignment) - base_addr
}

/// First page boundary at or after the end of the user data; the guard page
/// starts here in overrun mode.
#[inline]
pub(crate) fn guard_start(user: usize, size: usize) -> usize {
    (user + size).next_multiple_of(PAGE_SIZE)
}

/// Find the record of a live allocation.
///
/// # Safety
/// `user` must be a live pointer returned by an allocator running in `mode`.
pub(crate) unsafe fn locate(mode: DetectionMode, user: NonNull<u8>) -> NonNull<u8> {
    match mode {
        // Safety: the record precedes the user pointer in the same run.
        DetectionMode::Overrun => unsafe { user.sub(RECORD_SIZE) },
        DetectionMode::Underrun => {
            let misalignment = user.as_ptr().addr() % PAGE_SIZE;
            // Safety: every page from the one holding `user` up to the record
            // is committed, and each candidate lies inside such a page.
            unsafe {
                let mut candidate = user.sub(misalignment).add(PAGE_SIZE - RECORD_SIZE);
                while !AllocationRecord::read_from(candidate).is_valid() {
                    candidate = candidate.add(PAGE_SIZE);
                }
                candidate
            }
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::vm::{PlatformVmOps, VmOps};

    #[test]
    fn test_small_record_codec() {
        let record = AllocationRecord::small(0x00AB_CDEF, 13, 777);
        assert!(record.is_valid());
        assert!(record.is_small());
        assert_eq!(record.size(), 777);
        assert_eq!(record.backing(), Backing::Small { group: 0x00AB_CDEF, page: 13 });
    }

    #[test]
    fn test_large_record_keeps_base_and_alignment() {
        let page = PAGE_SIZE;
        // Safety: Test code.
        let base = unsafe { PlatformVmOps::reserve(page).unwrap() };
        let record = AllocationRecord::large(base, 2 * PAGE_SIZE, 100_000);
        assert!(record.is_valid());
        assert!(!record.is_small());
        assert_eq!(record.size(), 100_000);
        assert_eq!(
            record.backing(),
            Backing::Large {
                base,
                alignment: 2 * PAGE_SIZE
            }
        );
        // Safety: Test code.
        unsafe { PlatformVmOps::release(base, page).unwrap() };
    }

    #[test]
    fn test_unaligned_record_roundtrip_through_memory() {
        let mut buffer = [0u8; RECORD_SIZE + 3];
        let addr = NonNull::new(buffer.as_mut_ptr().wrapping_add(3)).unwrap();
        let record = AllocationRecord::small(4, 2, 9);
        // Safety: Test code; buffer holds RECORD_SIZE bytes past offset 3.
        unsafe {
            record.write_to(addr);
            assert_eq!(AllocationRecord::read_from(addr), record);
        }
    }

    #[test]
    fn test_zeroed_memory_is_not_a_record() {
        let buffer = [0u8; RECORD_SIZE];
        // Safety: Test code.
        let record = unsafe { AllocationRecord::read_from(NonNull::from(&buffer).cast()) };
        assert!(!record.is_valid());
    }

    #[test]
    fn test_sixteen_byte_overrun_scenario() {
        // 16 bytes at default alignment: one data page plus one guard page.
        let geometry = Geometry::new(16, DEFAULT_ALIGNMENT).unwrap();
        assert_eq!(geometry.required_space, PAGE_SIZE);
        assert_eq!(geometry.required_page_space(), 2 * PAGE_SIZE);
        assert!(geometry.is_small());
        assert_eq!(geometry.page_count(), 2);

        let placement = geometry.place_small(DetectionMode::Overrun);
        assert_eq!(placement.user + 16, PAGE_SIZE);
        assert_eq!(placement.record, PAGE_SIZE - 16 - RECORD_SIZE);
        assert_eq!(placement.commit_len, PAGE_SIZE);
    }

    #[test]
    fn test_small_large_boundary() {
        // The largest small allocation fills the group minus the guard page.
        let max_small = MIN_ALLOCATION_SIZE - PAGE_SIZE - RECORD_SIZE;
        let geometry = Geometry::new(max_small, 16).unwrap();
        assert!(geometry.is_small());
        assert_eq!(geometry.page_count(), MIN_ALLOCATION_SIZE / PAGE_SIZE);

        assert!(!Geometry::new(max_small + 1, 16).unwrap().is_small());
        assert!(!Geometry::new(100_000, 16).unwrap().is_small());
        // Page-scale alignment always takes the large path.
        assert!(!Geometry::new(16, PAGE_SIZE).unwrap().is_small());
    }

    #[test]
    fn test_small_overrun_placement_invariants() {
        for alignment in [1, 2, 8, 16, 64, PAGE_SIZE / 2] {
            for size in [0, 1, 15, 16, 17, 100, PAGE_SIZE - RECORD_SIZE, PAGE_SIZE, 3 * PAGE_SIZE + 5] {
                let geometry = Geometry::new(size, alignment).unwrap();
                let p = geometry.place_small(DetectionMode::Overrun);
                assert!(p.user.is_multiple_of(alignment), "size {size} align {alignment}");
                assert!(p.record + RECORD_SIZE <= p.user);
                assert!(p.user + size <= geometry.required_space);
                assert!(geometry.required_space - (p.user + size) < alignment);
                assert_eq!(guard_start(p.user, size), geometry.required_space);
            }
        }
    }

    #[test]
    fn test_small_underrun_placement_invariants() {
        for alignment in [1, 16, 256] {
            for size in [0, 1, PAGE_SIZE - RECORD_SIZE, PAGE_SIZE - RECORD_SIZE + 1, 10_000] {
                let geometry = Geometry::new(size, alignment).unwrap();
                let p = geometry.place_small(DetectionMode::Underrun);
                assert_eq!(p.user, PAGE_SIZE);
                assert!(p.user + size <= p.record);
                // The record occupies the tail of the last committed page.
                assert_eq!((p.record + RECORD_SIZE) % PAGE_SIZE, 0);
                assert_eq!(p.record + RECORD_SIZE, geometry.required_page_space());
            }
        }
    }

    #[test]
    fn test_large_placement_fits_reservation() {
        let base_addrs = [0x7f00_0000_0000usize, 0x7f00_0000_1000, 0x7f00_0000_3000];
        for &base in &base_addrs {
            for alignment in [16, PAGE_SIZE, 4 * PAGE_SIZE, 64 * 1024] {
                for size in [100_000, 65_536, 1, 3 * PAGE_SIZE + 7] {
                    let geometry = Geometry::new(size, alignment).unwrap();
                    let reservation = geometry.large_reservation_size();

                    let o = geometry.place_large(DetectionMode::Overrun, base);
                    assert!((base + o.user).is_multiple_of(alignment));
                    assert!(o.commit_start <= o.record);
                    let guard = o.commit_start + o.commit_len;
                    assert_eq!(guard, guard_start(o.user, size));
                    assert!(guard + PAGE_SIZE <= reservation, "guard page outside reservation");

                    let u = geometry.place_large(DetectionMode::Underrun, base);
                    assert!((base + u.user).is_multiple_of(alignment));
                    assert!(u.user >= PAGE_SIZE, "no room for the leading guard");
                    assert!(u.user + size <= u.record);
                    assert!(u.commit_start + u.commit_len <= reservation);
                    assert_eq!(u.record + RECORD_SIZE, u.commit_start + u.commit_len);
                }
            }
        }
    }

    #[test]
    fn test_geometry_rejects_overflow() {
        assert!(Geometry::new(usize::MAX - 8, 16).is_none());
        assert!(Geometry::new(16, 1 << 63).is_none());
    }

    #[test]
    fn test_locate_scans_to_first_marker() {
        let pages = 4;
        let len = pages * PAGE_SIZE;
        // Safety: Test code.
        unsafe {
            let base = PlatformVmOps::reserve(len).unwrap();
            PlatformVmOps::commit(base, len).unwrap();

            let record = AllocationRecord::small(1, 2, 3 * PAGE_SIZE as u32);
            record.write_to(base.add(len - RECORD_SIZE));

            let user = base.add(8);
            assert_eq!(locate(DetectionMode::Underrun, user), base.add(len - RECORD_SIZE));

            // A stray marker at an earlier page tail wins; the scan trusts
            // the first valid record it meets.
            let stray = AllocationRecord::small(9, 9, 1);
            stray.write_to(base.add(PAGE_SIZE - RECORD_SIZE));
            assert_eq!(locate(DetectionMode::Underrun, user), base.add(PAGE_SIZE - RECORD_SIZE));

            PlatformVmOps::release(base, len).unwrap();
        }
    }

    #[test]
    fn test_locate_overrun_is_fixed_offset() {
        let mut buffer = [0u8; 64];
        let user = NonNull::new(buffer.as_mut_ptr().wrapping_add(32)).unwrap();
        // Safety: Test code.
        let found = unsafe { locate(DetectionMode::Overrun, user) };
        assert_eq!(found.as_ptr(), buffer.as_mut_ptr().wrapping_add(32 - RECORD_SIZE));
    }
}
