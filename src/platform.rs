//! Platform primitives: page-aligned pool allocation, a monotonic clock for
//! scan statistics, and a relaxed atomic counter.
//!
//! `alloc_aligned_pool` over-maps with `libc::mmap` and trims to the
//! requested alignment by hand, producing a block whose *address*, not
//! just whose *content* alignment, is a multiple of its own size, since
//! `pool::header_of` depends on that.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

/// Returns a block of `size` bytes whose address is aligned to `size`
/// (`size` must be a power of two), or `None` on allocation failure.
///
/// Implemented by over-mapping `2 * size` bytes and trimming the unaligned
/// head and tail back to the OS.
pub fn alloc_aligned_pool(size: usize) -> Option<NonNull<u8>> {
    debug_assert!(size.is_power_of_two());

    unsafe {
        let map_size = size * 2;
        let raw = libc::mmap(
            std::ptr::null_mut(),
            map_size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if raw == libc::MAP_FAILED {
            return None;
        }

        let raw_addr = raw as usize;
        let aligned_addr = (raw_addr + size - 1) & !(size - 1);
        let front_slack = aligned_addr - raw_addr;
        let back_slack = map_size - front_slack - size;

        if front_slack > 0 {
            libc::munmap(raw, front_slack);
        }
        if back_slack > 0 {
            libc::munmap((aligned_addr + size) as *mut libc::c_void, back_slack);
        }

        NonNull::new(aligned_addr as *mut u8)
    }
}

/// Releases a block obtained from `alloc_aligned_pool`.
///
/// # Safety
/// `ptr` must be a still-live, unsplit result of `alloc_aligned_pool(size)`.
pub unsafe fn free_pool(ptr: NonNull<u8>, size: usize) {
    libc::munmap(ptr.as_ptr() as *mut libc::c_void, size);
}

/// Nanosecond-resolution monotonic clock, used only for `print_stats`
/// timing. On unix `CLOCK_MONOTONIC` is always available so it is used
/// directly rather than falling back to a stub.
pub fn monotonic_ns() -> u64 {
    unsafe {
        let mut ts = std::mem::MaybeUninit::<libc::timespec>::uninit();
        if libc::clock_gettime(libc::CLOCK_MONOTONIC, ts.as_mut_ptr()) != 0 {
            return 0;
        }
        let ts = ts.assume_init();
        ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
    }
}

/// A relaxed-ordering counter for eventually-consistent statistics. Never
/// read for a correctness decision.
#[derive(Default)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    pub const fn new(v: u64) -> Self {
        AtomicCounter(AtomicU64::new(v))
    }

    #[inline(always)]
    pub fn fetch_add(&self, n: u64) -> u64 {
        self.0.fetch_add(n, Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn load(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn store(&self, v: u64) {
        self.0.store(v, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod platform_tests {
    use super::*;
    use crate::config::POOL_SIZE;

    #[test]
    fn aligned_pool_address_is_aligned() {
        let p = alloc_aligned_pool(POOL_SIZE).expect("mmap should succeed");
        assert_eq!(p.as_ptr() as usize & (POOL_SIZE - 1), 0);
        unsafe { free_pool(p, POOL_SIZE) };
    }

    #[test]
    fn aligned_pool_is_writable_end_to_end() {
        let p = alloc_aligned_pool(POOL_SIZE).unwrap();
        unsafe {
            let bytes = std::slice::from_raw_parts_mut(p.as_ptr(), POOL_SIZE);
            bytes[0] = 0xAB;
            bytes[POOL_SIZE - 1] = 0xCD;
            assert_eq!(bytes[0], 0xAB);
            assert_eq!(bytes[POOL_SIZE - 1], 0xCD);
            free_pool(p, POOL_SIZE);
        }
    }

    #[test]
    fn monotonic_clock_is_nondecreasing() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
    }

    #[test]
    fn counter_is_relaxed_but_exact_single_threaded() {
        let c = AtomicCounter::new(0);
        for _ in 0..100 {
            c.fetch_add(1);
        }
        assert_eq!(c.load(), 100);
    }
}
