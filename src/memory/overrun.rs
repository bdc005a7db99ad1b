//! Guard-page allocator front end.
//!
//! Every allocation is placed flush against a page that is never committed,
//! so the first out-of-bounds byte faults. Requests that fit one
//! [`MIN_ALLOCATION_SIZE`] region (guard included) with sub-page alignment
//! share groups through [`SmallPageAllocator`]; everything else gets a
//! dedicated reservation.

use super::record::{self, AllocationRecord, Backing, DEFAULT_ALIGNMENT, Geometry, MAX_RECORDED_SIZE};
use super::small_pages::{MIN_ALLOCATION_SIZE, PAGE_SIZE, SmallPageAllocator};
use super::stats::{self, Counter};
use super::vm::{PlatformVmOps, VmError, VmOps};
use crate::sync::{Mutex, MutexGuard, OnceLock};
use std::ptr::NonNull;
use std::sync::PoisonError;

pub use super::record::DetectionMode;

/// Group slots reserved by [`OverrunDetectionConfig::default`].
pub const DEFAULT_MAX_GROUPS: usize = 1 << 18;

/// Construction parameters for [`OverrunDetectionAllocator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OverrunDetectionConfig {
    pub mode: DetectionMode,
    /// Upper bound on small allocation groups; each one is a
    /// [`MIN_ALLOCATION_SIZE`] reservation.
    pub max_groups: usize,
}

impl Default for OverrunDetectionConfig {
    fn default() -> Self {
        Self {
            mode: DetectionMode::Overrun,
            max_groups: DEFAULT_MAX_GROUPS,
        }
    }
}

impl OverrunDetectionConfig {
    #[must_use]
    pub fn with_mode(mut self, mode: DetectionMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_max_groups(mut self, max_groups: usize) -> Self {
        self.max_groups = max_groups;
        self
    }
}

/// Allocator that traps overruns (or underruns) with guard pages.
///
/// Small-path bookkeeping is serialized by one mutex. Large allocations own
/// independent reservations and take no lock.
pub struct OverrunDetectionAllocator<V: VmOps = PlatformVmOps> {
    mode: DetectionMode,
    small: Mutex<SmallPageAllocator<V>>,
    allocated_bytes: Counter,
}

impl OverrunDetectionAllocator<PlatformVmOps> {
    /// Create an allocator with the default configuration.
    ///
    /// # Errors
    ///
    /// See [`with_config`](Self::with_config).
    pub fn new() -> Result<Self, VmError> {
        Self::with_config(OverrunDetectionConfig::default())
    }
}

impl<V: VmOps> OverrunDetectionAllocator<V> {
    /// Create an allocator for `config`.
    ///
    /// # Errors
    ///
    /// Returns `VmError::PlatformMismatch` if the platform's page size or
    /// allocation granularity differs from [`PAGE_SIZE`] and
    /// [`MIN_ALLOCATION_SIZE`], and `VmError::InitializationFailed` or a
    /// reservation error if the group arena cannot be set up.
    pub fn with_config(config: OverrunDetectionConfig) -> Result<Self, VmError> {
        let info = V::system_info();
        if info.page_size != PAGE_SIZE || info.allocation_granularity != MIN_ALLOCATION_SIZE {
            return Err(VmError::PlatformMismatch {
                page_size: info.page_size,
                allocation_granularity: info.allocation_granularity,
            });
        }

        Ok(Self {
            mode: config.mode,
            small: Mutex::new(SmallPageAllocator::new(config.mode, config.max_groups)?),
            allocated_bytes: Counter::new(),
        })
    }

    #[inline]
    pub fn mode(&self) -> DetectionMode {
        self.mode
    }

    #[inline]
    fn lock_small(&self) -> MutexGuard<'_, SmallPageAllocator<V>> {
        self.small.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate `size` bytes aligned to `alignment` (zero selects
    /// [`DEFAULT_ALIGNMENT`]). `alignment` must be a power of two.
    ///
    /// In overrun mode the returned range ends as close to the guard page as
    /// the alignment allows; in underrun mode it starts right after it.
    ///
    /// # Errors
    ///
    /// Returns `VmError::ObjectTooLarge` for sizes of 4 GiB and more,
    /// `VmError::GroupsExhausted` when no small group slot is left, and the
    /// platform error if address space cannot be reserved or committed.
    pub fn allocate(&self, size: usize, alignment: usize) -> Result<NonNull<u8>, VmError> {
        let alignment = if alignment == 0 { DEFAULT_ALIGNMENT } else { alignment };
        debug_assert!(alignment.is_power_of_two(), "alignment {alignment} is not a power of two");
        debug_assert!(
            size <= MAX_RECORDED_SIZE,
            "allocation of {size} bytes exceeds the record limit of {MAX_RECORDED_SIZE} bytes"
        );

        let too_large = || VmError::ObjectTooLarge {
            size,
            limit: MAX_RECORDED_SIZE,
        };
        let recorded_size = u32::try_from(size).map_err(|_| too_large())?;
        let geometry = Geometry::new(size, alignment).ok_or_else(too_large)?;

        let ptr = if geometry.is_small() {
            self.allocate_small(&geometry, recorded_size)?
        } else {
            self.allocate_large(&geometry, recorded_size)?
        };

        self.allocated_bytes.add(size);
        Ok(ptr)
    }

    fn allocate_small(&self, geometry: &Geometry, recorded_size: u32) -> Result<NonNull<u8>, VmError> {
        let pages = self.lock_small().allocate_consecutive_pages(geometry.page_count())?;
        let placement = geometry.place_small(self.mode);

        // Safety: the run is ours alone now, and the record and user offsets
        // fall inside its committed span.
        unsafe {
            AllocationRecord::small(pages.group, pages.page, recorded_size)
                .write_to(pages.base.add(placement.record));
            Ok(pages.base.add(placement.user))
        }
    }

    fn allocate_large(&self, geometry: &Geometry, recorded_size: u32) -> Result<NonNull<u8>, VmError> {
        let reservation = geometry.large_reservation_size();
        // Safety: FFI call to reserve memory.
        let base = unsafe { V::reserve(reservation)? };
        let placement = geometry.place_large(self.mode, base.as_ptr().addr());

        // Safety: every offset lies inside the reservation (see place_large).
        unsafe {
            if let Err(e) = V::commit(base.add(placement.commit_start), placement.commit_len) {
                drop(V::release(base, reservation));
                return Err(e);
            }
            AllocationRecord::large(base, geometry.alignment, recorded_size)
                .write_to(base.add(placement.record));
        }

        stats::TOTAL_RESERVED.add(reservation);
        stats::TOTAL_COMMITTED.add(placement.commit_len);
        stats::LIVE_LARGE.add(1);

        // Safety: as above.
        Ok(unsafe { base.add(placement.user) })
    }

    /// Free an allocation. `expected_size`, when given, must equal the size
    /// it was allocated with.
    ///
    /// # Safety
    /// `ptr` must be a live allocation from this allocator and must not be
    /// used afterwards.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, expected_size: Option<usize>) {
        // Safety: upheld by caller.
        let record = unsafe { AllocationRecord::read_from(record::locate(self.mode, ptr)) };
        if !record.is_valid() {
            debug_assert!(false, "no allocation record for {ptr:p}");
            return;
        }
        if let Some(expected) = expected_size {
            debug_assert_eq!(
                record.size(),
                expected,
                "size mismatch freeing {ptr:p}"
            );
        }

        self.allocated_bytes.sub(record.size());

        match record.backing() {
            Backing::Small { group, page } => {
                let mut small = self.lock_small();
                let Some(base) = small.run_base(group, page) else {
                    debug_assert!(false, "group {group} page {page} does not exist");
                    return;
                };
                // Safety: the record names the live run holding `ptr`.
                unsafe { small.deallocate(base, group, page) };
            }
            Backing::Large { base, alignment } => {
                // Safety: the record describes the reservation holding `ptr`.
                unsafe { self.release_large(base, record.size(), alignment) };
            }
        }
    }

    /// # Safety
    /// `base` must be a live large reservation made for `(size, alignment)`.
    unsafe fn release_large(&self, base: NonNull<u8>, size: usize, alignment: usize) {
        let Some(geometry) = Geometry::new(size, alignment) else {
            debug_assert!(false, "corrupted large record at {base:p}");
            return;
        };
        let reservation = geometry.large_reservation_size();
        let placement = geometry.place_large(self.mode, base.as_ptr().addr());

        // Safety: upheld by caller; the length matches the original reservation.
        if unsafe { V::release(base, reservation) }.is_err() {
            #[cfg(debug_assertions)]
            eprintln!("[guardalloc] failed to release large allocation at {base:p}");
        }

        stats::TOTAL_RESERVED.sub(reservation);
        stats::TOTAL_COMMITTED.sub(placement.commit_len);
        stats::LIVE_LARGE.sub(1);
    }

    /// C `realloc`: a zero `new_size` frees `ptr` (if any) and returns
    /// `None`, a `None` pointer allocates, anything else moves the data to a
    /// fresh allocation. On error the original allocation is left untouched.
    ///
    /// # Safety
    /// `ptr`, if present, must be a live allocation from this allocator. It
    /// must not be used afterwards unless an error is returned.
    ///
    /// # Errors
    ///
    /// See [`allocate`](Self::allocate).
    pub unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        new_alignment: usize,
    ) -> Result<Option<NonNull<u8>>, VmError> {
        if new_size == 0 {
            if let Some(old) = ptr {
                // Safety: upheld by caller.
                unsafe { self.deallocate(old, None) };
            }
            return Ok(None);
        }
        let Some(old) = ptr else {
            return self.allocate(new_size, new_alignment).map(Some);
        };

        let new = self.allocate(new_size, new_alignment)?;
        // Safety: both ranges are live and distinct, and each is at least
        // the copied length.
        unsafe {
            let old_size = self.allocation_size(old);
            std::ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), old_size.min(new_size));
            self.deallocate(old, Some(old_size));
        }
        Ok(Some(new))
    }

    /// In-place resizing is not supported; always 0.
    pub fn resize(&self, _ptr: NonNull<u8>, _new_size: usize) -> usize {
        0
    }

    /// Size `ptr` was allocated with.
    ///
    /// # Safety
    /// `ptr` must be a live allocation from this allocator.
    pub unsafe fn allocation_size(&self, ptr: NonNull<u8>) -> usize {
        // Safety: upheld by caller.
        let record = unsafe { AllocationRecord::read_from(record::locate(self.mode, ptr)) };
        debug_assert!(record.is_valid(), "no allocation record for {ptr:p}");
        record.size()
    }

    /// Bytes currently handed out, as requested by callers.
    #[inline]
    pub fn num_allocated_bytes(&self) -> usize {
        self.allocated_bytes.get()
    }

    pub fn capacity(&self) -> usize {
        0
    }

    pub fn max_allocation_size(&self) -> usize {
        0
    }

    pub fn max_contiguous_allocation_size(&self) -> usize {
        0
    }

    /// Nothing is cached, so there is nothing to collect.
    pub fn garbage_collect(&self) {}

    #[cfg(test)]
    pub(crate) fn verify_integrity(&self) -> Result<(), String> {
        self.lock_small().verify_integrity()
    }
}

impl<V: VmOps> Drop for OverrunDetectionAllocator<V> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        {
            let leaked = self.allocated_bytes.get();
            if leaked > 0 {
                eprintln!("[guardalloc] {leaked} bytes still allocated at teardown");
            }
        }
    }
}

static GLOBAL_OVERRUN_INSTANCE: OnceLock<OverrunDetectionAllocator> = OnceLock::new();

/// Process-wide instance, installable with `#[global_allocator]`.
///
/// The instance is created with [`OverrunDetectionConfig::default`] on first
/// use unless [`init`](Self::init) ran before.
pub struct GlobalOverrunDetectionAllocator;

impl GlobalOverrunDetectionAllocator {
    /// Initialize the global instance with `config`.
    ///
    /// # Errors
    ///
    /// Returns `VmError::InitializationFailed` if the instance already
    /// exists, or the construction error from
    /// [`OverrunDetectionAllocator::with_config`].
    pub fn init(config: OverrunDetectionConfig) -> Result<(), VmError> {
        GLOBAL_OVERRUN_INSTANCE
            .set(OverrunDetectionAllocator::with_config(config)?)
            .map_err(|_| VmError::InitializationFailed("Already initialized".to_string()))
    }

    /// The global instance, created on first use.
    ///
    /// # Errors
    ///
    /// Returns the construction error if the default instance cannot be
    /// created.
    pub fn get() -> Result<&'static OverrunDetectionAllocator, VmError> {
        if let Some(allocator) = GLOBAL_OVERRUN_INSTANCE.get() {
            return Ok(allocator);
        }
        // Construction makes no heap allocation, so this cannot recurse when
        // installed as the global allocator. A racing initializer may win; its
        // instance is kept and this one dropped.
        drop(GLOBAL_OVERRUN_INSTANCE.set(OverrunDetectionAllocator::new()?));
        GLOBAL_OVERRUN_INSTANCE
            .get()
            .ok_or_else(|| VmError::InitializationFailed("global instance missing".to_string()))
    }
}

// Safety: Implementation follows GlobalAlloc contract.
unsafe impl std::alloc::GlobalAlloc for GlobalOverrunDetectionAllocator {
    unsafe fn alloc(&self, layout: std::alloc::Layout) -> *mut u8 {
        match Self::get().and_then(|allocator| allocator.allocate(layout.size(), layout.align())) {
            Ok(ptr) => ptr.as_ptr(),
            Err(_) => std::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: std::alloc::Layout) {
        if let (Some(ptr), Some(allocator)) = (NonNull::new(ptr), GLOBAL_OVERRUN_INSTANCE.get()) {
            // Safety: ptr came from alloc on this instance.
            unsafe { allocator.deallocate(ptr, Some(layout.size())) };
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: std::alloc::Layout, new_size: usize) -> *mut u8 {
        let (Some(ptr), Some(allocator)) = (NonNull::new(ptr), GLOBAL_OVERRUN_INSTANCE.get()) else {
            return std::ptr::null_mut();
        };
        // Safety: ptr came from alloc on this instance; new_size is nonzero.
        match unsafe { allocator.reallocate(Some(ptr), new_size, layout.align()) } {
            Ok(Some(new)) => new.as_ptr(),
            Ok(None) | Err(_) => std::ptr::null_mut(),
        }
    }
}
