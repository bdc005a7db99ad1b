use std::fmt;
use std::ptr::NonNull;

/// Coarse allocation granularity reported on platforms that have none of
/// their own (POSIX `mmap` maps at page granularity).
const DEFAULT_ALLOCATION_GRANULARITY: usize = 64 * 1024;

#[derive(Debug)]
pub enum VmError {
    ReservationFailed(std::io::Error),
    CommitFailed(std::io::Error),
    DecommitFailed(std::io::Error),
    ReleaseFailed(std::io::Error),
    InitializationFailed(String),
    /// The platform's page geometry does not match the compiled-in constants.
    PlatformMismatch {
        page_size: usize,
        allocation_granularity: usize,
    },
    /// The requested size does not fit the 32-bit size field of a record.
    ObjectTooLarge { size: usize, limit: usize },
    /// Every slot of the small-group arena is in use.
    GroupsExhausted { max_groups: usize },
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::ReservationFailed(e) => write!(f, "VM reservation failed: {e}"),
            VmError::CommitFailed(e) => write!(f, "VM commit failed: {e}"),
            VmError::DecommitFailed(e) => write!(f, "VM decommit failed: {e}"),
            VmError::ReleaseFailed(e) => write!(f, "VM release failed: {e}"),
            VmError::InitializationFailed(msg) => write!(f, "VM initialization failed: {msg}"),
            VmError::PlatformMismatch {
                page_size,
                allocation_granularity,
            } => write!(
                f,
                "Platform reports page size {page_size} and allocation granularity \
                 {allocation_granularity}, expected {} and {}",
                super::small_pages::PAGE_SIZE,
                super::small_pages::MIN_ALLOCATION_SIZE,
            ),
            VmError::ObjectTooLarge { size, limit } => write!(
                f,
                "Object too large: size {size} exceeds the record limit of {limit} bytes"
            ),
            VmError::GroupsExhausted { max_groups } => {
                write!(f, "Small page groups exhausted (limit {max_groups})")
            }
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::ReservationFailed(e)
            | VmError::CommitFailed(e)
            | VmError::DecommitFailed(e)
            | VmError::ReleaseFailed(e) => Some(e),
            VmError::InitializationFailed(_)
            | VmError::PlatformMismatch { .. }
            | VmError::ObjectTooLarge { .. }
            | VmError::GroupsExhausted { .. } => None,
        }
    }
}

/// Page geometry reported by a [`VmOps`] implementation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SystemInfo {
    pub page_size: usize,
    pub allocation_granularity: usize,
}

/// Abstract interface for virtual memory operations.
///
/// The allocator is generic over this trait so the platform primitive can be
/// swapped out (tests wrap [`PlatformVmOps`] to observe calls).
pub trait VmOps {
    /// Reserve address space without committing physical pages.
    /// Returns a pointer to the start of the reserved range.
    ///
    /// # Safety
    /// The returned range is inaccessible until committed.
    ///
    /// # Errors
    /// Returns `VmError::ReservationFailed` when the OS refuses the mapping.
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Commit (back with physical pages) a range within a reservation.
    ///
    /// # Safety
    /// `ptr..ptr + size` must lie inside a live reservation and be page aligned.
    ///
    /// # Errors
    /// Returns `VmError::CommitFailed` when the OS refuses the protection change.
    unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Decommit (return physical pages, keep address range reserved).
    ///
    /// # Safety
    /// `ptr..ptr + size` must lie inside a live reservation and must not be
    /// accessed until committed again.
    ///
    /// # Errors
    /// Returns `VmError::DecommitFailed` when the OS call fails.
    unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Release address space entirely (after which pointers are invalid).
    ///
    /// # Safety
    /// `ptr` must be the base returned by [`reserve`](Self::reserve) and
    /// `size` the size passed to it.
    ///
    /// # Errors
    /// Returns `VmError::ReleaseFailed` when the OS call fails.
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// OS page size (default/minimum).
    fn page_size() -> usize;

    /// Smallest size (and alignment) the OS hands out for a reservation.
    fn allocation_granularity() -> usize;

    fn system_info() -> SystemInfo {
        SystemInfo {
            page_size: Self::page_size(),
            allocation_granularity: Self::allocation_granularity(),
        }
    }
}

pub struct PlatformVmOps;

#[cfg(all(any(target_os = "macos", target_os = "linux"), not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PlatformVmOps, VmError, VmOps};
    use std::io;

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::ReservationFailed(io::Error::last_os_error()));
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(VmError::ReservationFailed(io::Error::other(
                    "mmap returned null",
                ))),
            }
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            } != 0
            {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Drop the physical backing, then remove access so a stale pointer
            // into freed pages faults instead of reading old contents.
            // Safety: FFI call to madvise.
            if unsafe {
                libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_DONTNEED)
            } != 0
            {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            // Safety: FFI call to mprotect.
            if unsafe { libc::mprotect(ptr.as_ptr().cast::<libc::c_void>(), size, libc::PROT_NONE) }
                != 0
            {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // SAFETY/PORTABILITY: this crate supports only 64-bit targets; page size fits in
                // usize there.
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }

        fn allocation_granularity() -> usize {
            super::DEFAULT_ALLOCATION_GRANULARITY.max(Self::page_size())
        }
    }
}

#[cfg(all(target_os = "windows", not(any(loom, miri))))]
mod windows {
    use super::{NonNull, PlatformVmOps, VmError, VmOps};
    use std::ffi::c_void;
    use std::io;

    const MEM_COMMIT: u32 = 0x0000_1000;
    const MEM_RESERVE: u32 = 0x0000_2000;
    const MEM_DECOMMIT: u32 = 0x0000_4000;
    const MEM_RELEASE: u32 = 0x0000_8000;
    const PAGE_NOACCESS: u32 = 0x01;
    const PAGE_READWRITE: u32 = 0x04;

    #[repr(C)]
    struct SystemInfo {
        processor_architecture: u16,
        reserved: u16,
        page_size: u32,
        minimum_application_address: *mut c_void,
        maximum_application_address: *mut c_void,
        active_processor_mask: usize,
        number_of_processors: u32,
        processor_type: u32,
        allocation_granularity: u32,
        processor_level: u16,
        processor_revision: u16,
    }

    unsafe extern "system" {
        fn VirtualAlloc(
            address: *mut c_void,
            size: usize,
            allocation_type: u32,
            protect: u32,
        ) -> *mut c_void;
        fn VirtualFree(address: *mut c_void, size: usize, free_type: u32) -> i32;
        fn GetSystemInfo(info: *mut SystemInfo);
    }

    fn system_info() -> &'static (usize, usize) {
        use crate::sync::OnceLock;
        static CACHED: OnceLock<(usize, usize)> = OnceLock::new();
        CACHED.get_or_init(|| {
            // Safety: FFI call to GetSystemInfo on a zeroed out-parameter.
            unsafe {
                let mut info: SystemInfo = std::mem::zeroed();
                GetSystemInfo(&raw mut info);
                (info.page_size as usize, info.allocation_granularity as usize)
            }
        })
    }

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to VirtualAlloc.
            let ptr =
                unsafe { VirtualAlloc(std::ptr::null_mut(), size, MEM_RESERVE, PAGE_NOACCESS) };

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(VmError::ReservationFailed(io::Error::last_os_error())),
            }
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to VirtualAlloc.
            let result = unsafe {
                VirtualAlloc(ptr.as_ptr().cast::<c_void>(), size, MEM_COMMIT, PAGE_READWRITE)
            };

            if result.is_null() {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to VirtualFree.
            if unsafe { VirtualFree(ptr.as_ptr().cast::<c_void>(), size, MEM_DECOMMIT) } == 0 {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn release(ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
            // VirtualFree with MEM_RELEASE must have size 0 and the base address of the region.
            // Safety: FFI call to VirtualFree.
            if unsafe { VirtualFree(ptr.as_ptr().cast::<c_void>(), 0, MEM_RELEASE) } == 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            system_info().0
        }

        fn allocation_granularity() -> usize {
            system_info().1
        }
    }
}

// ---------------------------------------------------------------------------
// Loom mock: heap-backed VmOps (no real mmap/VirtualAlloc)
//
// Under `cfg(loom)` we cannot issue real VM syscalls; loom runs inside a
// single OS process with its own scheduler. Instead we back every "reservation"
// with a plain heap allocation (via `std::alloc::alloc_zeroed` / `dealloc`).
//
// `commit` / `decommit` are no-ops: the memory is always accessible once
// reserved, so guard pages do not fault here. `release` frees the heap block.
// Fault behaviour is covered by the real platform implementation in normal
// builds.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
impl VmOps for PlatformVmOps {
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size reservation",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
            .map_err(|e| VmError::ReservationFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn commit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(())
    }

    unsafe fn decommit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(())
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
            .map_err(|e| VmError::ReleaseFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `reserve`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        super::small_pages::PAGE_SIZE
    }

    fn allocation_granularity() -> usize {
        DEFAULT_ALLOCATION_GRANULARITY
    }
}
