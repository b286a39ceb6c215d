//! The allocator: `create`/`get`/`delete`/`modify` and their slow paths.

use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::classify::{self, ModifyAction};
use crate::config;
use crate::error::{BoxrootError, Result};
use crate::platform;
use crate::pool::{OwnerId, PoolClass, PoolHeader, Slot};
use crate::ring::{self, Ring};
use crate::stats;
use crate::thread::{self, ThreadLocalState};
use crate::value::{Host, Value};

/// An opaque, stable handle to a live slot. `Handle` is `Copy`: it is a thin
/// wrapper around the slot's address, and the address is the whole point.
#[repr(transparent)]
pub struct Handle<H> {
    slot: NonNull<Slot>,
    _marker: PhantomData<H>,
}

impl<H> Clone for Handle<H> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<H> Copy for Handle<H> {}

impl<H> PartialEq for Handle<H> {
    fn eq(&self, other: &Self) -> bool {
        self.slot == other.slot
    }
}
impl<H> Eq for Handle<H> {}

// SAFETY: a handle is a bare address. Sending it across threads is what the
// remote-delete path requires; all synchronization happens inside the
// allocator (the delayed free list's own mutex), not on the handle itself.
unsafe impl<H> Send for Handle<H> {}
unsafe impl<H> Sync for Handle<H> {}

impl<H> Handle<H> {
    fn from_slot(slot: NonNull<Slot>) -> Self {
        Handle { slot, _marker: PhantomData }
    }

    /// Exposes the handle as the raw pointer an FFI caller stores.
    pub fn as_ptr(self) -> *mut Value {
        self.slot.as_ptr() as *mut Value
    }

    /// Reconstructs a handle from a raw pointer previously returned by
    /// [`Handle::as_ptr`]. Returns `None` only for a null pointer; any other
    /// value is trusted to be a live handle. Passing anything else is
    /// undefined behavior.
    ///
    /// # Safety
    /// `ptr` must be null or a value previously returned by
    /// `Handle::as_ptr` for a handle that has not since been deleted.
    pub unsafe fn from_ptr(ptr: *mut Value) -> Option<Self> {
        NonNull::new(ptr as *mut Slot).map(Self::from_slot)
    }
}

/// Pops the old ring's head only if it has room; a full old pool is left in
/// place rather than becoming current only to immediately overflow on the
/// next allocation.
fn pop_nonfull_old<H>(old: &mut Ring<H>) -> Option<NonNull<PoolHeader<H>>> {
    let head = (*old)?;
    if unsafe { head.as_ref().free_count() } > 0 {
        unsafe { ring::remove(old, head) };
        Some(head)
    } else {
        None
    }
}

/// An explicit, constructible allocator object rather than bare global
/// state: the per-thread registry and Orphaned entry both live behind
/// [`crate::thread::registry`], keyed by `H`, so any number of
/// `Allocator<H>` values for the same host share the same pools. A process
/// wanting a single shared instance can still construct one and reach it
/// through whatever path it likes (the `ffi` module keeps a process-wide
/// default behind a lazily-initialized static for the C-ABI surface).
pub struct Allocator<H: Host> {
    _marker: PhantomData<H>,
}

impl<H: Host> Default for Allocator<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Host> Allocator<H> {
    pub fn new() -> Self {
        Allocator { _marker: PhantomData }
    }

    /// `create(value) -> handle`. Returns `None` on allocation failure.
    pub fn create(&self, value: Value) -> Option<Handle<H>> {
        thread::with_thread_state::<H, _>(|state| self.create_with(state, value).ok())
    }

    /// `get(handle) -> value`. Total; the caller is trusted to hold the
    /// appropriate host lock and to pass a live handle.
    pub fn get(&self, handle: Handle<H>) -> Value {
        unsafe { handle.slot.as_ref().get() }
    }

    /// `delete(handle)`. Total: frees the slot on the owning thread's path,
    /// or queues it on the pool's delayed free list otherwise.
    pub fn delete(&self, handle: Handle<H>) {
        thread::with_thread_state::<H, _>(|state| self.delete_with(state, handle))
    }

    /// `modify(&mut handle, new_value)`. Never fails; the fail-safe pool
    /// demotion path guarantees a live handle never becomes invalid.
    pub fn modify(&self, handle: &mut Handle<H>, new_value: Value) {
        thread::with_thread_state::<H, _>(|state| self.modify_with(state, handle, new_value))
    }

    fn create_with(&self, state: &ThreadLocalState<H>, value: Value) -> Result<Handle<H>> {
        loop {
            if let Some(pool) = state.current_pool.get() {
                if let Some(slot) = unsafe { pool.as_ref() }.pop_freelist() {
                    unsafe { slot.as_ref().set(value) };
                    stats::record_create();
                    return Ok(Handle::from_slot(slot));
                }
            }
            self.refill_current(state)?;
        }
    }

    fn delete_with(&self, state: &ThreadLocalState<H>, handle: Handle<H>) {
        let slot = handle.slot;
        let pool = unsafe { PoolHeader::<H>::header_of(slot.as_ptr()) };
        let owner: OwnerId = unsafe { (*pool).owner.get() };

        if owner == state.owner {
            let before = unsafe { (*pool).alloc_count.get() };
            unsafe { (*pool).push_freelist(slot) };
            stats::record_delete();
            let capacity = unsafe { (*pool).capacity() };
            if classify::crossed_dealloc_threshold(before, capacity) {
                let pool_nn = unsafe { NonNull::new_unchecked(pool as *mut PoolHeader<H>) };
                self.try_demote_pool(state, pool_nn);
            }
        } else {
            // Remote delete: `rings_of_pool` locates and locks the owner's
            // rings, handling the case where ownership changes between the
            // read and the lock. The delayed free list itself, guarded by
            // its own mutex, is the minimum synchronization needed to make
            // delete legal from any thread. The owning thread merges it at
            // its next scan.
            let pool_nn = unsafe { NonNull::new_unchecked(pool as *mut PoolHeader<H>) };
            let owner_rings = thread::registry::<H>().rings_of_pool(pool_nn);
            let _guard = owner_rings.inner.lock().unwrap_or_else(|e| e.into_inner());
            let mut delayed =
                unsafe { (*pool).delayed_fl.lock().unwrap_or_else(|e| e.into_inner()) };
            delayed.push(slot.as_ptr() as *const Slot);
            stats::record_remote_delete();
        }
    }

    fn modify_with(&self, state: &ThreadLocalState<H>, handle: &mut Handle<H>, new_value: Value) {
        let slot = handle.slot;
        let old_value = unsafe { slot.as_ref().get() };
        let from = classify::classify::<H>(old_value);
        let to = classify::classify::<H>(new_value);

        match classify::modify_action(from, to) {
            ModifyAction::InPlace => unsafe { slot.as_ref().set(new_value) },
            ModifyAction::TryReallocateYoung => {
                // Reallocating into `current` rather than hunting for a
                // dedicated young pool satisfies the requirement just as
                // well: `current` is scanned on every minor collection,
                // same as `young`.
                match self.create_with(state, new_value) {
                    Ok(new_handle) => {
                        self.delete_with(state, *handle);
                        *handle = new_handle;
                    }
                    Err(_) => {
                        // Fail-safe: demote the slot's own pool to YOUNG
                        // instead, paid at most once per pool per minor
                        // epoch, then overwrite in place.
                        let pool = unsafe { PoolHeader::<H>::header_of(slot.as_ptr()) };
                        unsafe { (*pool).class.set(classify::next_class_on_fill()) };
                        unsafe { slot.as_ref().set(new_value) };
                    }
                }
            }
        }
    }

    /// Slow path of `create`: reclassifies a full `current` pool to
    /// `YOUNG`, finds a replacement via `find_available_pool`, and installs
    /// it as `current`. Fails only when no pool could be found or
    /// allocated.
    fn refill_current(&self, state: &ThreadLocalState<H>) -> Result<()> {
        let mut inner = state.rings.inner.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(old_current) = state.current_pool.get() {
            unsafe { old_current.as_ref().class.set(classify::next_class_on_fill()) };
            unsafe { ring::push_back(&mut inner.young, old_current) };
        }
        state.current_pool.set(None);

        let found = ring::pop(&mut inner.young)
            .or_else(|| pop_nonfull_old(&mut inner.old))
            .or_else(|| ring::pop(&mut inner.free));

        let pool = match found {
            Some(p) => p,
            None => {
                drop(inner);
                self.allocate_fresh_pool(state.owner)?
            }
        };

        unsafe { pool.as_ref().class.set(PoolClass::Current) };
        state.current_pool.set(Some(pool));
        Ok(())
    }

    fn allocate_fresh_pool(&self, owner: OwnerId) -> Result<NonNull<PoolHeader<H>>> {
        let mem = platform::alloc_aligned_pool(config::POOL_SIZE)
            .ok_or(BoxrootError::AllocationFailed)?;
        unsafe {
            PoolHeader::<H>::init_in_place(mem.as_ptr() as *mut _, owner);
        }
        stats::record_pool_allocated();
        Ok(mem.cast())
    }

    /// Moves `pool` to the front of its ring after a delete crosses the
    /// fullness threshold, or reclassifies it to
    /// `FREE` if it is now empty. Never touches the current pool, which has
    /// no ring position to move within.
    fn try_demote_pool(&self, state: &ThreadLocalState<H>, pool: NonNull<PoolHeader<H>>) {
        if state.current_pool.get() == Some(pool) {
            return;
        }

        let mut inner = state.rings.inner.lock().unwrap_or_else(|e| e.into_inner());
        let class = unsafe { pool.as_ref().class.get() };
        let ring = match class {
            PoolClass::Young => &mut inner.young,
            PoolClass::Old => &mut inner.old,
            PoolClass::Free => &mut inner.free,
            PoolClass::Current => return,
        };
        unsafe { ring::remove(ring, pool) };

        if unsafe { pool.as_ref().alloc_count.get() } == 0 {
            unsafe { pool.as_ref().class.set(classify::next_class_on_empty()) };
            unsafe { ring::push_front(&mut inner.free, pool) };
        } else {
            unsafe { ring::push_front(ring, pool) };
        }
    }
}

#[cfg(test)]
mod alloc_tests {
    use super::*;
    use std::ops::Range;

    #[derive(Clone, Copy)]
    struct TestHost;
    impl Host for TestHost {
        fn is_immediate(v: Value) -> bool {
            v & 1 != 0
        }
        fn young_range() -> Range<usize> {
            0x1000..0x2000
        }
    }

    #[test]
    fn create_then_get_round_trips() {
        let alloc = Allocator::<TestHost>::new();
        let h = alloc.create(0x9002).expect("allocation should succeed");
        assert_eq!(alloc.get(h), 0x9002);
        alloc.delete(h);
    }

    #[test]
    fn create_past_one_pool_capacity_triggers_slow_path() {
        let alloc = Allocator::<TestHost>::new();
        let cap = crate::pool::capacity::<TestHost>();
        let mut handles = Vec::with_capacity(cap + 1);
        for i in 0..cap + 1 {
            let v = (i * 2 + 0x9000) | 0; // even => old, non-immediate
            handles.push(alloc.create(v).expect("should not run out"));
        }
        for (i, h) in handles.iter().enumerate() {
            assert_eq!(alloc.get(*h), i * 2 + 0x9000);
        }
        for h in handles {
            alloc.delete(h);
        }
    }

    #[test]
    fn modify_in_place_for_young_to_young() {
        let alloc = Allocator::<TestHost>::new();
        let mut h = alloc.create(0x1002).unwrap();
        let before = h.as_ptr();
        alloc.modify(&mut h, 0x1804);
        assert_eq!(h.as_ptr(), before, "in-place modify keeps the same address");
        assert_eq!(alloc.get(h), 0x1804);
        alloc.delete(h);
    }

    #[test]
    fn modify_old_to_young_reallocates_or_demotes() {
        let alloc = Allocator::<TestHost>::new();
        let mut h = alloc.create(0x9002).unwrap();
        alloc.modify(&mut h, 0x1804);
        assert_eq!(alloc.get(h), 0x1804);
        alloc.delete(h);
    }

    #[test]
    fn delete_crossing_threshold_moves_pool_to_ring_front() {
        let alloc = Allocator::<TestHost>::new();
        let cap = crate::pool::capacity::<TestHost>();
        let mut handles = Vec::new();
        for i in 0..cap + 1 {
            handles.push(alloc.create((i * 2 + 0x9000) | 0).unwrap());
        }
        for h in handles.drain(..cap / 2 + 2) {
            alloc.delete(h);
        }
        for h in handles {
            alloc.delete(h);
        }
    }
}
