//! Compile-time tunables.
//!
//! Size classes and the pool log are module constants rather than runtime
//! configuration, because the masking trick in `pool.rs` depends on
//! `POOL_SIZE` being known at compile time.

use std::env;

/// log2 of the pool size. 14 => 16 KiB pools.
pub const POOL_LOG_SIZE: usize = 14;

/// Size in bytes of one pool. Always a power of two.
pub const POOL_SIZE: usize = 1 << POOL_LOG_SIZE;

/// Fullness fraction (numerator/denominator) at which a pool is demoted to
/// the front of its ring by `try_demote_pool`. Half the pool, a power of
/// two.
pub const DEALLOC_THRESHOLD_NUM: usize = 1;
pub const DEALLOC_THRESHOLD_DEN: usize = 2;

/// Reads `BOXROOT_POOL_LOG_SIZE` once, for benchmarking without a rebuild.
/// Returns the compiled-in default on any parse failure or absence, since
/// this knob must never be the reason `setup()` fails.
pub fn effective_pool_log_size() -> usize {
    match env::var("BOXROOT_POOL_LOG_SIZE") {
        Ok(s) => s.parse().unwrap_or(POOL_LOG_SIZE),
        Err(_) => POOL_LOG_SIZE,
    }
}

/// Whether the slower, assertion-heavy paths (ring validation, freelist
/// well-formedness checks) are compiled in.
#[inline(always)]
pub const fn debug_checks_enabled() -> bool {
    cfg!(feature = "debug-checks")
}
