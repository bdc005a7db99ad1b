#[cfg(all(test, not(loom)))]
mod tests {
    use crate::memory::overrun::{DetectionMode, OverrunDetectionAllocator, OverrunDetectionConfig};
    use crate::memory::small_pages::PAGE_SIZE;
    use crate::sync::Arc;
    use crate::sync::thread;
    use std::ptr::NonNull;

    fn allocator(mode: DetectionMode) -> OverrunDetectionAllocator {
        OverrunDetectionAllocator::with_config(
            OverrunDetectionConfig::default()
                .with_mode(mode)
                .with_max_groups(4096),
        )
        .unwrap()
    }

    /// Fork, run `touch` in the child, and return the raw wait status.
    ///
    /// The child only touches memory that the parent already set up, then
    /// `_exit`s, so nothing in it depends on locks held by other test threads.
    #[cfg(all(unix, not(miri)))]
    fn run_in_child(touch: impl FnOnce()) -> libc::c_int {
        // Safety: Test code; the child performs no allocation and never
        // returns into the harness.
        unsafe {
            let pid = libc::fork();
            assert!(pid >= 0, "fork failed: {}", std::io::Error::last_os_error());
            if pid == 0 {
                let no_core = libc::rlimit {
                    rlim_cur: 0,
                    rlim_max: 0,
                };
                libc::setrlimit(libc::RLIMIT_CORE, &raw const no_core);
                touch();
                libc::_exit(0);
            }

            let mut status: libc::c_int = 0;
            assert_eq!(libc::waitpid(pid, &raw mut status, 0), pid);
            status
        }
    }

    #[cfg(all(unix, not(miri)))]
    fn died_from_fault(status: libc::c_int) -> bool {
        libc::WIFSIGNALED(status) && matches!(libc::WTERMSIG(status), libc::SIGSEGV | libc::SIGBUS)
    }

    #[cfg(all(unix, not(miri)))]
    fn write_at(ptr: *mut u8) {
        // Safety: Test code; faulting here is the point.
        unsafe { ptr.write_volatile(0xEE) };
    }

    #[cfg(all(unix, not(miri)))]
    #[test]
    fn test_write_past_end_faults_in_overrun_mode() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let alloc = allocator(DetectionMode::Overrun);
        let cases = [(16, 0), (100, 1), (4096, 16), (40_000, 8), (100_000, 16), (5000, 4 * PAGE_SIZE)];

        for (size, alignment) in cases {
            let ptr = alloc.allocate(size, alignment).unwrap();
            let effective = if alignment == 0 { crate::DEFAULT_ALIGNMENT } else { alignment };
            let addr = ptr.as_ptr().addr();
            let guard = (addr + size).next_multiple_of(PAGE_SIZE);
            if effective <= PAGE_SIZE {
                // Data ends flush with the guard page once rounded to the alignment.
                assert_eq!(addr + size.next_multiple_of(effective), guard);
            }
            let end = ptr.as_ptr().wrapping_add(guard - addr);

            let status = run_in_child(|| write_at(end));
            assert!(died_from_fault(status), "size {size} alignment {alignment}: status {status:#x}");

            // Safety: Test code.
            unsafe { alloc.deallocate(ptr, Some(size)) };
        }
    }

    #[cfg(all(unix, not(miri)))]
    #[test]
    fn test_write_before_start_faults_in_underrun_mode() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let alloc = allocator(DetectionMode::Underrun);

        for size in [1, 16, 4096, 40_000, 100_000] {
            let ptr = alloc.allocate(size, 0).unwrap();
            let before = ptr.as_ptr().wrapping_sub(1);

            let status = run_in_child(|| write_at(before));
            assert!(died_from_fault(status), "size {size}: status {status:#x}");

            // Safety: Test code.
            unsafe { alloc.deallocate(ptr, Some(size)) };
        }
    }

    #[cfg(all(unix, not(miri)))]
    #[test]
    fn test_in_bounds_writes_do_not_fault() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        for mode in [DetectionMode::Overrun, DetectionMode::Underrun] {
            let alloc = allocator(mode);
            let size = 3 * PAGE_SIZE + 7;
            let ptr = alloc.allocate(size, 1).unwrap();
            let addr = ptr.as_ptr();

            let status = run_in_child(|| {
                // Safety: Test code; every byte is inside the allocation.
                unsafe { addr.write_bytes(0x11, size) };
            });
            assert!(libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0, "{mode:?}");

            // Safety: Test code.
            unsafe { alloc.deallocate(ptr, Some(size)) };
        }
    }

    #[cfg(all(unix, not(miri)))]
    #[test]
    fn test_use_after_free_faults() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let alloc = allocator(DetectionMode::Overrun);
        // Keep the group alive so the freed pages stay reserved but
        // inaccessible.
        let keep = alloc.allocate(64, 0).unwrap();
        let freed = alloc.allocate(64, 0).unwrap();
        // Safety: Test code.
        unsafe { alloc.deallocate(freed, Some(64)) };

        let status = run_in_child(|| write_at(freed.as_ptr()));
        assert!(died_from_fault(status), "status {status:#x}");

        // Safety: Test code.
        unsafe { alloc.deallocate(keep, Some(64)) };
    }

    #[test]
    fn test_concurrent_small_traffic_keeps_integrity() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let num_threads = 8usize;
        let iters = 300usize;
        let alloc = Arc::new(allocator(DetectionMode::Overrun));
        let barrier = Arc::new(crate::sync::barrier::Barrier::new(num_threads));

        let handles: Vec<_> = (0..num_threads)
            .map(|t| {
                let alloc = alloc.clone();
                let b = barrier.clone();
                thread::spawn(move || {
                    let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();
                    b.wait();

                    for i in 0..iters {
                        if i % 3 == 2 {
                            let (ptr, size, tag) = live.swap_remove(i % live.len());
                            // Safety: Test code.
                            unsafe {
                                assert_eq!(*ptr.as_ptr(), tag, "thread {t} lost its data");
                                assert_eq!(*ptr.as_ptr().add(size - 1), tag);
                                alloc.deallocate(ptr, Some(size));
                            }
                            continue;
                        }

                        let size = 1 + (t * 977 + i * 131) % (12 * PAGE_SIZE);
                        let tag = u8::try_from((t * 31 + i) % 251).unwrap();
                        let ptr = alloc.allocate(size, 0).unwrap();
                        // Safety: Test code.
                        unsafe { ptr.as_ptr().write_bytes(tag, size) };
                        live.push((ptr, size, tag));
                    }

                    for (ptr, size, _) in live {
                        // Safety: Test code.
                        unsafe { alloc.deallocate(ptr, Some(size)) };
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        alloc.verify_integrity().unwrap();
        assert_eq!(alloc.num_allocated_bytes(), 0);
    }

    #[test]
    fn test_live_bytes_return_to_baseline() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let alloc = allocator(DetectionMode::Underrun);
        let keep = alloc.allocate(10, 0).unwrap();
        let baseline = alloc.num_allocated_bytes();
        assert_eq!(baseline, 10);

        for size in [0, 1, 777, 70_000, 300_000] {
            let ptr = alloc.allocate(size, 0).unwrap();
            assert_eq!(alloc.num_allocated_bytes(), baseline + size);
            // Safety: Test code.
            unsafe {
                assert_eq!(alloc.allocation_size(ptr), size);
                alloc.deallocate(ptr, Some(size));
            }
            assert_eq!(alloc.num_allocated_bytes(), baseline);
        }

        // Safety: Test code.
        unsafe { alloc.deallocate(keep, Some(10)) };
        alloc.verify_integrity().unwrap();
    }
}
