//! Page-granularity sub-allocator.
//!
//! The OS hands out address space in [`MIN_ALLOCATION_SIZE`] units. Each unit
//! becomes a [`SmallAllocationGroup`] of [`PAGES_PER_GROUP`] pages, and runs
//! of consecutive pages are carved out of groups on demand. Every run
//! includes exactly one guard page that is never committed.
//!
//! For each run length `L` there is one circular free list holding every
//! group that can currently satisfy an `L`-page request, so finding a group
//! is a single look at the list head. After every allocate or free the
//! touched group recomputes its membership in all lists
//! ([`SmallPageAllocator::update_availability`]).
//!
//! ```text
//!   heads[L-1] ─► group 3 ─► group 0 ─► group 7 ─┐
//!       ▲                                         │
//!       └─────────────────────────────────────────┘
//! ```

use super::page_list::{Link, NodeStore, PageListNode};
use super::record::DetectionMode;
use super::stats;
use super::vm::{PlatformVmOps, VmError, VmOps};
use std::marker::PhantomData;
use std::ptr::NonNull;

/// Page size the placement arithmetic is built for.
#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
pub const PAGE_SIZE: usize = 16 * 1024;
/// Page size the placement arithmetic is built for.
#[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
pub const PAGE_SIZE: usize = 4096;

/// Size of one OS reservation backing a small allocation group.
pub const MIN_ALLOCATION_SIZE: usize = 64 * 1024;

/// Pages in one group; also the largest run a small allocation may use.
pub const PAGES_PER_GROUP: usize = MIN_ALLOCATION_SIZE / PAGE_SIZE;

const _: () = assert!(PAGES_PER_GROUP >= 2 && PAGES_PER_GROUP <= 64);

/// One bit per page of a group; set bits are allocated (guard pages included).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct PageBitmap(u64);

impl PageBitmap {
    #[inline]
    fn mask(start: usize, count: usize) -> u64 {
        debug_assert!(count >= 1 && start + count <= PAGES_PER_GROUP);
        let bits = if count == 64 { u64::MAX } else { (1u64 << count) - 1 };
        bits << start
    }

    #[cfg(test)]
    pub(crate) fn bits(self) -> u64 {
        self.0
    }

    #[inline]
    pub(crate) fn is_set(self, page: usize) -> bool {
        self.0 & (1u64 << page) != 0
    }

    #[inline]
    pub(crate) fn is_range_clear(self, start: usize, count: usize) -> bool {
        self.0 & Self::mask(start, count) == 0
    }

    #[inline]
    pub(crate) fn is_range_set(self, start: usize, count: usize) -> bool {
        let mask = Self::mask(start, count);
        self.0 & mask == mask
    }

    #[inline]
    pub(crate) fn set_range(&mut self, start: usize, count: usize) {
        self.0 |= Self::mask(start, count);
    }

    #[inline]
    pub(crate) fn clear_range(&mut self, start: usize, count: usize) {
        self.0 &= !Self::mask(start, count);
    }

    /// Maximal runs of free pages as `(start, len)`, in ascending order.
    pub(crate) fn free_runs(self) -> impl Iterator<Item = (usize, usize)> {
        let mut page = 0;
        std::iter::from_fn(move || {
            while page < PAGES_PER_GROUP && self.is_set(page) {
                page += 1;
            }
            if page == PAGES_PER_GROUP {
                return None;
            }
            let start = page;
            while page < PAGES_PER_GROUP && !self.is_set(page) {
                page += 1;
            }
            Some((start, page - start))
        })
    }
}

/// One [`MIN_ALLOCATION_SIZE`] reservation subdivided into pages.
///
/// `nodes[r]` is this group's entry in the free list for runs of `r + 1`
/// pages, and `nodes[p].allocated_page_count()` is the length of the
/// allocated run starting at page `p` (zero if none starts there).
pub(crate) struct SmallAllocationGroup {
    base: NonNull<u8>,
    index: u32,
    nodes: [PageListNode; PAGES_PER_GROUP],
    allocated: PageBitmap,
}

impl SmallAllocationGroup {
    fn new(base: NonNull<u8>, index: u32) -> Self {
        Self {
            base,
            index,
            nodes: [PageListNode::new(Link::Group(index)); PAGES_PER_GROUP],
            allocated: PageBitmap::default(),
        }
    }

    #[inline]
    pub(crate) fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub(crate) fn allocated(&self) -> PageBitmap {
        self.allocated
    }

    #[inline]
    pub(crate) fn node(&self, index: usize) -> &PageListNode {
        &self.nodes[index]
    }

    #[inline]
    fn page_ptr(&self, page: usize) -> NonNull<u8> {
        debug_assert!(page < PAGES_PER_GROUP);
        // Safety: page < PAGES_PER_GROUP keeps the offset inside the reservation.
        unsafe { self.base.add(page * PAGE_SIZE) }
    }
}

/// Heads of the per-run-length circular free lists.
pub(crate) struct FreeListHeads {
    nodes: [PageListNode; PAGES_PER_GROUP],
}

impl FreeListHeads {
    fn new() -> Self {
        Self {
            nodes: [PageListNode::new(Link::Head); PAGES_PER_GROUP],
        }
    }

    /// First group on the list for runs of `run + 1` pages, if any.
    #[inline]
    fn first(&self, run: usize) -> Option<u32> {
        match self.nodes[run].next() {
            Link::Group(g) => Some(g),
            Link::Head => None,
        }
    }
}

/// Append-only storage for groups, backed directly by the VM primitive.
///
/// The whole capacity is reserved up front and committed a page at a time
/// as groups are pushed, so groups never move and growth never goes through
/// the heap allocator (which may be this crate).
struct GroupArena<V: VmOps> {
    base: NonNull<SmallAllocationGroup>,
    len: usize,
    capacity: usize,
    reserved_bytes: usize,
    committed_bytes: usize,
    _vm: PhantomData<fn() -> V>,
}

impl<V: VmOps> GroupArena<V> {
    fn new(capacity: usize) -> Result<Self, VmError> {
        let reserved_bytes = capacity
            .checked_mul(size_of::<SmallAllocationGroup>())
            .and_then(|bytes| bytes.checked_next_multiple_of(PAGE_SIZE))
            .ok_or_else(|| {
                VmError::InitializationFailed("group arena size overflow".to_string())
            })?;
        // Safety: FFI call to reserve memory.
        let base = unsafe { V::reserve(reserved_bytes)? };
        stats::TOTAL_RESERVED.add(reserved_bytes);

        Ok(Self {
            base: base.cast(),
            len: 0,
            capacity,
            reserved_bytes,
            committed_bytes: 0,
            _vm: PhantomData,
        })
    }

    #[inline]
    fn len(&self) -> usize {
        self.len
    }

    #[inline]
    fn is_full(&self) -> bool {
        self.len == self.capacity
    }

    fn push(&mut self, group: SmallAllocationGroup) -> Result<(), VmError> {
        if self.is_full() {
            return Err(VmError::GroupsExhausted {
                max_groups: self.capacity,
            });
        }

        let needed = (self.len + 1) * size_of::<SmallAllocationGroup>();
        if needed > self.committed_bytes {
            let target = needed.next_multiple_of(PAGE_SIZE);
            // Safety: committed_bytes < target <= reserved_bytes.
            unsafe {
                let ptr = self.base.cast::<u8>().add(self.committed_bytes);
                V::commit(ptr, target - self.committed_bytes)?;
            }
            stats::TOTAL_COMMITTED.add(target - self.committed_bytes);
            self.committed_bytes = target;
        }

        // Safety: slot `len` is committed and unoccupied.
        unsafe { self.base.add(self.len).write(group) };
        self.len += 1;
        Ok(())
    }

    #[inline]
    fn as_slice(&self) -> &[SmallAllocationGroup] {
        // Safety: the first `len` slots are initialised and never move.
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.len) }
    }

    #[inline]
    fn as_mut_slice(&mut self) -> &mut [SmallAllocationGroup] {
        // Safety: as above, and &mut self guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr(), self.len) }
    }
}

impl<V: VmOps> Drop for GroupArena<V> {
    fn drop(&mut self) {
        // Groups are plain data; nothing to drop in place.
        // Safety: base/reserved_bytes come from `reserve` in `new`.
        let released = unsafe { V::release(self.base.cast(), self.reserved_bytes) };
        if released.is_err() {
            #[cfg(debug_assertions)]
            eprintln!("[guardalloc] failed to release group arena at {:p}", self.base);
        }
        stats::TOTAL_RESERVED.sub(self.reserved_bytes);
        stats::TOTAL_COMMITTED.sub(self.committed_bytes);
    }
}

/// A run of pages handed out by [`SmallPageAllocator::allocate_consecutive_pages`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SmallPages {
    /// First page of the run (guard page included).
    pub base: NonNull<u8>,
    pub group: u32,
    pub page: usize,
}

/// Commit range of a run: every page except the guard, which sits last in
/// overrun mode and first in underrun mode.
#[inline]
fn committed_span(mode: DetectionMode, base: NonNull<u8>, page_count: usize) -> (NonNull<u8>, usize) {
    let len = (page_count - 1) * PAGE_SIZE;
    match mode {
        DetectionMode::Overrun => (base, len),
        // Safety: the run spans page_count >= 2 pages.
        DetectionMode::Underrun => (unsafe { base.add(PAGE_SIZE) }, len),
    }
}

pub(crate) struct SmallPageAllocator<V: VmOps = PlatformVmOps> {
    mode: DetectionMode,
    heads: FreeListHeads,
    groups: GroupArena<V>,
}

// Safety: SmallPageAllocator owns its reservations; raw pointers are addresses
// inside them. Shared access goes through the owning allocator's Mutex.
unsafe impl<V: VmOps> Send for SmallPageAllocator<V> {}

impl<V: VmOps> NodeStore for SmallPageAllocator<V> {
    #[inline]
    fn node(&self, at: Link, run: usize) -> &PageListNode {
        match at {
            Link::Head => &self.heads.nodes[run],
            Link::Group(g) => &self.groups.as_slice()[g as usize].nodes[run],
        }
    }

    #[inline]
    fn node_mut(&mut self, at: Link, run: usize) -> &mut PageListNode {
        match at {
            Link::Head => &mut self.heads.nodes[run],
            Link::Group(g) => &mut self.groups.as_mut_slice()[g as usize].nodes[run],
        }
    }
}

impl<V: VmOps> SmallPageAllocator<V> {
    /// Create an allocator with room for `max_groups` groups. No group
    /// exists until the first allocation.
    ///
    /// # Errors
    ///
    /// Returns `VmError` if `max_groups` is zero or too large, or if the
    /// group arena cannot be reserved.
    pub(crate) fn new(mode: DetectionMode, max_groups: usize) -> Result<Self, VmError> {
        if max_groups == 0 || u32::try_from(max_groups).is_err() {
            return Err(VmError::InitializationFailed(format!(
                "max_groups must be in 1..={}, got {max_groups}",
                u32::MAX
            )));
        }

        Ok(Self {
            mode,
            heads: FreeListHeads::new(),
            groups: GroupArena::new(max_groups)?,
        })
    }

    #[cfg(test)]
    pub(crate) fn group_count(&self) -> usize {
        self.groups.len()
    }

    #[inline]
    pub(crate) fn group(&self, index: u32) -> &SmallAllocationGroup {
        &self.groups.as_slice()[index as usize]
    }

    /// Base of the run starting at `page` in `group`, as passed to
    /// [`deallocate`](Self::deallocate). `None` if no such page exists.
    #[inline]
    pub(crate) fn run_base(&self, group: u32, page: usize) -> Option<NonNull<u8>> {
        if page >= PAGES_PER_GROUP {
            return None;
        }
        let group = self.groups.as_slice().get(group as usize)?;
        Some(group.page_ptr(page))
    }

    /// Hand out `page_count` consecutive pages, the last (overrun mode) or
    /// first (underrun mode) of which stays uncommitted as the guard.
    ///
    /// # Errors
    ///
    /// Returns `VmError` if a new group cannot be reserved or the pages
    /// cannot be committed. Bookkeeping is rolled back in both cases.
    pub(crate) fn allocate_consecutive_pages(
        &mut self,
        page_count: usize,
    ) -> Result<SmallPages, VmError> {
        debug_assert!(
            (2..=PAGES_PER_GROUP).contains(&page_count),
            "page count {page_count} out of range 2..={PAGES_PER_GROUP}"
        );
        let run = page_count - 1;

        let index = match self.heads.first(run) {
            Some(index) => index,
            None => self.create_group()?,
        };

        let group = &mut self.groups.as_mut_slice()[index as usize];
        let page = group.nodes[run].available_page();
        debug_assert!(
            group.allocated.is_range_clear(page, page_count),
            "group {index} advertised pages {page}..{} for run {page_count} but they are in use",
            page + page_count
        );
        group.allocated.set_range(page, page_count);
        group.nodes[page].set_allocated_page_count(page_count);
        let base = group.page_ptr(page);

        self.update_availability(index);

        let (commit_ptr, commit_len) = committed_span(self.mode, base, page_count);
        // Safety: the span lies inside the group's reservation.
        if let Err(e) = unsafe { V::commit(commit_ptr, commit_len) } {
            self.release_run(index, page);
            return Err(e);
        }

        stats::TOTAL_COMMITTED.add(commit_len);
        stats::LIVE_SMALL.add(1);

        Ok(SmallPages { base, group: index, page })
    }

    /// Return a run obtained from [`allocate_consecutive_pages`](Self::allocate_consecutive_pages).
    ///
    /// # Safety
    /// - `(group, page)` must name a live run and `ptr` must be its base.
    /// - Nothing may touch the run's memory afterwards.
    pub(crate) unsafe fn deallocate(&mut self, ptr: NonNull<u8>, group: u32, page: usize) {
        debug_assert!(
            (group as usize) < self.groups.len() && page < PAGES_PER_GROUP,
            "group {group} page {page} does not exist"
        );
        debug_assert_eq!(
            self.group(group).page_ptr(page),
            ptr,
            "pointer does not match group {group} page {page}"
        );

        let Some(page_count) = self.release_run(group, page) else {
            debug_assert!(false, "double free of group {group} page {page}");
            return;
        };

        let (decommit_ptr, decommit_len) = committed_span(self.mode, ptr, page_count);
        // Safety: the span was committed by allocate_consecutive_pages.
        if unsafe { V::decommit(decommit_ptr, decommit_len) }.is_err() {
            #[cfg(debug_assertions)]
            eprintln!("[guardalloc] decommit failed for group {group} page {page}");
        }

        stats::TOTAL_COMMITTED.sub(decommit_len);
        stats::LIVE_SMALL.sub(1);
    }

    /// Clear the bookkeeping for the run starting at `page`. Returns its
    /// length, or `None` if no run starts there.
    fn release_run(&mut self, index: u32, page: usize) -> Option<usize> {
        let group = &mut self.groups.as_mut_slice()[index as usize];
        let page_count = group.nodes[page].allocated_page_count();
        if page_count == 0 {
            return None;
        }
        debug_assert!(
            group.allocated.is_range_set(page, page_count),
            "allocation map of group {index} is corrupted at page {page}"
        );
        group.allocated.clear_range(page, page_count);
        group.nodes[page].set_allocated_page_count(0);

        self.update_availability(index);
        Some(page_count)
    }

    fn create_group(&mut self) -> Result<u32, VmError> {
        if self.groups.is_full() {
            #[cfg(debug_assertions)]
            eprintln!(
                "[guardalloc] small group arena exhausted ({} groups)",
                self.groups.len()
            );
            return Err(VmError::GroupsExhausted {
                max_groups: self.groups.len(),
            });
        }
        let index = u32::try_from(self.groups.len()).map_err(|_| VmError::GroupsExhausted {
            max_groups: self.groups.len(),
        })?;

        // Safety: FFI call to reserve memory.
        let base = unsafe { V::reserve(MIN_ALLOCATION_SIZE)? };
        debug_assert!(base.as_ptr().addr().is_multiple_of(PAGE_SIZE));

        if let Err(e) = self.groups.push(SmallAllocationGroup::new(base, index)) {
            // Safety: base was just reserved with this size.
            drop(unsafe { V::release(base, MIN_ALLOCATION_SIZE) });
            return Err(e);
        }

        stats::TOTAL_RESERVED.add(MIN_ALLOCATION_SIZE);
        stats::SMALL_GROUPS.add(1);

        self.update_availability(index);
        Ok(index)
    }

    /// Recompute which free lists `index` belongs to.
    ///
    /// The longest free run (lowest offset on ties) is advertised for every
    /// length up to its own and the group is linked into those lists.
    /// Longer lengths are unlinked.
    pub(crate) fn update_availability(&mut self, index: u32) {
        let (start, longest) = self
            .group(index)
            .allocated
            .free_runs()
            .fold((0, 0), |best, run| if run.1 > best.1 { run } else { best });

        let at = Link::Group(index);
        for run in 0..PAGES_PER_GROUP {
            if run < longest {
                self.node_mut(at, run).set_available_page(start);
                if !self.node(at, run).is_linked() {
                    self.link_before(at, Link::Head, run);
                }
            } else if self.node(at, run).is_linked() {
                self.unlink(at, run);
            }
        }
    }

    /// Rebuild page ownership from the recorded run lengths and check it
    /// against every bitmap and free-list membership.
    #[cfg(test)]
    pub(crate) fn verify_integrity(&self) -> Result<(), String> {
        use fixedbitset::FixedBitSet;

        for group in self.groups.as_slice() {
            let index = group.index();
            let mut owned = FixedBitSet::with_capacity(PAGES_PER_GROUP);
            let mut page = 0;
            while page < PAGES_PER_GROUP {
                let count = group.node(page).allocated_page_count();
                if count == 0 {
                    page += 1;
                    continue;
                }
                if page + count > PAGES_PER_GROUP {
                    return Err(format!("group {index}: run at {page} overflows the group"));
                }
                owned.insert_range(page..page + count);
                page += count;
            }

            for page in 0..PAGES_PER_GROUP {
                if owned.contains(page) != group.allocated().is_set(page) {
                    return Err(format!(
                        "group {index}: bitmap {:#x} disagrees with runs at page {page}",
                        group.allocated().bits()
                    ));
                }
            }

            let longest = group.allocated().free_runs().map(|(_, len)| len).max().unwrap_or(0);
            for run in 0..PAGES_PER_GROUP {
                let node = group.node(run);
                let should_link = run < longest;
                if node.is_linked() != should_link {
                    return Err(format!(
                        "group {index}: linked={} for run {} but longest free run is {longest}",
                        node.is_linked(),
                        run + 1
                    ));
                }
                if should_link && !group.allocated().is_range_clear(node.available_page(), run + 1)
                {
                    return Err(format!(
                        "group {index}: advertised page {} for run {} is not free",
                        node.available_page(),
                        run + 1
                    ));
                }
            }
        }

        for run in 0..PAGES_PER_GROUP {
            let expected = self
                .groups
                .as_slice()
                .iter()
                .filter(|g| g.node(run).is_linked())
                .count();
            let mut seen = 0;
            let mut cursor = self.heads.nodes[run].next();
            while let Link::Group(g) = cursor {
                seen += 1;
                if seen > expected {
                    return Err(format!("free list for run {} does not terminate", run + 1));
                }
                cursor = self.node(Link::Group(g), run).next();
            }
            if seen != expected {
                return Err(format!(
                    "free list for run {} holds {seen} groups, expected {expected}",
                    run + 1
                ));
            }
        }

        Ok(())
    }
}

impl<V: VmOps> Drop for SmallPageAllocator<V> {
    fn drop(&mut self) {
        let mut live_runs = 0;
        let mut live_committed = 0;
        for group in self.groups.as_slice() {
            for page in 0..PAGES_PER_GROUP {
                let count = group.node(page).allocated_page_count();
                if count != 0 {
                    live_runs += 1;
                    live_committed += (count - 1) * PAGE_SIZE;
                }
            }
            // Safety: each group base was reserved with MIN_ALLOCATION_SIZE.
            if unsafe { V::release(group.base(), MIN_ALLOCATION_SIZE) }.is_err() {
                #[cfg(debug_assertions)]
                eprintln!("[guardalloc] failed to release group {}", group.index());
            }
        }

        #[cfg(debug_assertions)]
        if live_runs > 0 {
            eprintln!("[guardalloc] {live_runs} small allocations still live at teardown");
        }

        let groups = self.groups.len();
        stats::TOTAL_RESERVED.sub(groups * MIN_ALLOCATION_SIZE);
        stats::SMALL_GROUPS.sub(groups);
        stats::TOTAL_COMMITTED.sub(live_committed);
        stats::LIVE_SMALL.sub(live_runs);
        // The arena itself is released by GroupArena::drop.
    }
}
