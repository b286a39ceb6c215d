//! A rooted-handle allocator: lets native code hold long-lived references
//! into a moving, generational, tracing host GC without per-call root
//! registration overhead. See the individual modules for each component's
//! responsibility; [`alloc::Allocator`] is the primary entry point for a
//! Rust embedder, and [`ffi`] is the C-ABI surface for everyone else.

pub mod alloc;
pub mod classify;
pub mod config;
pub mod error;
pub mod ffi;
pub mod platform;
pub mod pool;
pub mod ring;
pub mod scan;
pub mod stats;
pub mod thread;
pub mod value;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

use error::Result;
use ffi::HostHooks;

/// Process-wide status: `{NotSetup, Running, Error}`, guarded by
/// `INIT_LOCK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Status {
    NotSetup = 0,
    Running = 1,
    Error = 2,
}

static STATUS: AtomicU8 = AtomicU8::new(Status::NotSetup as u8);
static INIT_LOCK: Mutex<()> = Mutex::new(());

fn status() -> Status {
    match STATUS.load(Ordering::Acquire) {
        0 => Status::NotSetup,
        1 => Status::Running,
        _ => Status::Error,
    }
}

/// Idempotent: a second call while already running is a no-op success.
/// Must be called while the calling thread holds the host's
/// execution-context lock.
pub(crate) fn setup_with_hooks(hooks: HostHooks) -> Result<()> {
    let _guard = INIT_LOCK.lock()?;

    if status() == Status::Running {
        return Ok(());
    }

    let requested = config::effective_pool_log_size();
    if requested != config::POOL_LOG_SIZE {
        log::warn!(
            "boxroot: BOXROOT_POOL_LOG_SIZE={requested} requested, but POOL_LOG_SIZE ({}) is a \
             compile-time constant baked into the pool-header masking arithmetic; ignoring",
            config::POOL_LOG_SIZE
        );
    }

    // Hooks may already be installed from a prior setup/teardown cycle;
    // that's fine, a host's hooks don't change across a teardown.
    let _ = ffi::install_hooks(hooks);

    STATUS.store(Status::Running as u8, Ordering::Release);
    log::debug!("boxroot: setup complete, pool size = {} bytes", config::POOL_SIZE);
    Ok(())
}

/// Releases every pool reachable from any thread's registered rings (and
/// the Orphaned rings) back to the platform, then flips status back to
/// `NotSetup`. A pool still cached as some live thread's `current_pool` is
/// not reachable from here; callers are expected to have quiesced mutator
/// threads before calling, per the host-lock discipline `create`/`delete`
/// already require.
pub fn teardown() {
    let _guard = INIT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    thread::release_all_registries();
    STATUS.store(Status::NotSetup as u8, Ordering::Release);
    log::debug!("boxroot: teardown");
}

#[cfg(test)]
mod lib_tests {
    use super::*;

    #[test]
    fn status_round_trips_through_setup_and_teardown() {
        assert_eq!(status(), Status::NotSetup);
        teardown();
        assert_eq!(status(), Status::NotSetup);
    }
}
