#[cfg(not(target_pointer_width = "64"))]
compile_error!("guardalloc supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// allocator
pub use memory::overrun::{
    DEFAULT_MAX_GROUPS, DetectionMode, GlobalOverrunDetectionAllocator, OverrunDetectionAllocator,
    OverrunDetectionConfig,
};

// geometry
pub use memory::record::{DEFAULT_ALIGNMENT, RECORD_SIZE};
pub use memory::small_pages::{MIN_ALLOCATION_SIZE, PAGE_SIZE, PAGES_PER_GROUP};

// platform
pub use memory::vm::{PlatformVmOps, SystemInfo, VmError, VmOps};

// stats
pub use memory::stats::{MemoryStats, snapshot as memory_stats};
