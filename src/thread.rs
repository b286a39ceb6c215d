//! Per-thread pool rings, the thread registry, and orphan adoption.
//!
//! Per-thread GC state lives behind a global table keyed by owner id, the
//! same shape as a lazily-populated cache of per-thread state, but thread
//! termination bookkeeping is done with Rust's own thread-local destructor:
//! `ThreadLocalState` lives in thread-local storage and its `Drop` impl *is*
//! the orphaning step, run automatically whenever a mutator thread exits.
//!
//! Both the process-wide registry and the per-thread state are generic over
//! `H`, but a plain `static`/`thread_local!` cannot itself be parameterized
//! by a caller's type parameter. Both are instead kept in a single
//! non-generic slot, keyed by `TypeId`, and downcast back to the caller's
//! concrete `H` — the same trick `http::Extensions` and similar "one slot
//! per type" registries use.

use std::any::{Any, TypeId};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_utils::CachePadded;
use log::{debug, trace};
use once_cell::sync::OnceCell;

use crate::platform::free_pool;
use crate::pool::{OwnerId, PoolClass, PoolHeader, ORPHANED_OWNER};
use crate::ring;
use crate::ring::Ring;
use crate::value::Host;

/// Reassigns every pool in the ring headed by `head` to `ORPHANED_OWNER`
/// and concatenates it onto `target`.
unsafe fn reassign_and_merge<H>(head: NonNull<PoolHeader<H>>, target: &mut Ring<H>) {
    for p in ring::iter(Some(head)) {
        p.as_ref().owner.set(ORPHANED_OWNER);
    }
    ring::push_back(target, head);
}

/// The rings a thread (or the Orphaned pseudo-thread) owns. The current pool
/// itself is cached outside this mutex, in `ThreadLocalState::current_pool`,
/// so `create`'s hot path never takes this lock; only `young`/`old`/`free`
/// live here.
pub struct RingsInner<H> {
    pub young: Ring<H>,
    pub old: Ring<H>,
    pub free: Ring<H>,
}

impl<H> RingsInner<H> {
    fn empty() -> Self {
        RingsInner { young: None, old: None, free: None }
    }
}

/// One thread's four rings plus the mutex protecting them. `CachePadded`
/// keeps each thread's lock on its own cache line; the registry table packs
/// many `Arc<ThreadRings<H>>` entries together, and without padding a
/// scan on one thread's rings would dirty the cache line backing a
/// neighboring thread's lock.
pub struct ThreadRings<H> {
    pub inner: CachePadded<Mutex<RingsInner<H>>>,
}

impl<H> ThreadRings<H> {
    fn new() -> Self {
        ThreadRings { inner: CachePadded::new(Mutex::new(RingsInner::empty())) }
    }
}

/// The global per-thread table plus the Orphaned pseudo-thread entry. One
/// instance per `Host` type, reached through [`registry`].
pub struct Registry<H> {
    next_owner: AtomicU64,
    table: Mutex<HashMap<OwnerId, Arc<ThreadRings<H>>>>,
    orphaned: Arc<ThreadRings<H>>,
}

impl<H> Registry<H> {
    fn new() -> Self {
        Registry {
            next_owner: AtomicU64::new(0),
            table: Mutex::new(HashMap::new()),
            orphaned: Arc::new(ThreadRings::new()),
        }
    }

    pub fn fresh_owner_id(&self) -> OwnerId {
        self.next_owner.fetch_add(1, Ordering::Relaxed)
    }

    pub fn rings_for(&self, owner: OwnerId) -> Arc<ThreadRings<H>> {
        if owner == ORPHANED_OWNER {
            return self.orphaned.clone();
        }
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.entry(owner).or_insert_with(|| Arc::new(ThreadRings::new())).clone()
    }

    pub fn orphaned(&self) -> Arc<ThreadRings<H>> {
        self.orphaned.clone()
    }

    /// Given a pool, finds and locks the rings of whoever currently owns
    /// it, handling the race where
    /// ownership changes between the read and the lock acquisition by
    /// re-reading and retrying.
    pub fn rings_of_pool(&self, pool: NonNull<PoolHeader<H>>) -> Arc<ThreadRings<H>> {
        loop {
            let owner = unsafe { pool.as_ref().owner.get() };
            let rings = self.rings_for(owner);
            let still_owner = unsafe { pool.as_ref().owner.get() } == owner;
            if still_owner {
                return rings;
            }
        }
    }

    /// Splices `exiting`'s current pool plus its `young`/`old` rings into
    /// the Orphaned rings (O(1) per ring) and returns the `free` ring so the
    /// caller can release it to the platform.
    ///
    /// `current` (passed in separately, since it lives outside
    /// `ThreadRings`'s mutex) and `young` both still need minor scanning, so
    /// both land in Orphaned's `young` ring (reclassifying the former
    /// `current` pool to `YOUNG`, since `CURRENT` is meaningless without an
    /// owning thread); `old` pools stay in Orphaned's `old` ring.
    pub fn orphan(
        &self,
        owner: OwnerId,
        exiting: &ThreadRings<H>,
        current: Option<NonNull<PoolHeader<H>>>,
    ) -> Ring<H> {
        debug!("boxroot: orphaning pools of thread {owner}");
        let mut mine = exiting.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut theirs = self.orphaned.inner.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(head) = current {
            unsafe { head.as_ref().class.set(PoolClass::Young) };
            reassign_and_merge(head, &mut theirs.young);
        }
        if let Some(head) = mine.young.take() {
            reassign_and_merge(head, &mut theirs.young);
        }
        if let Some(head) = mine.old.take() {
            reassign_and_merge(head, &mut theirs.old);
        }
        // `free` holds no live handles, so it is released directly by the
        // caller instead of being handed to Orphaned first.
        mine.free.take()
    }
}

/// Releases every pool in `ring` back to the platform. Used both for a
/// major scan's reclaimed free ring and for the `free` ring at thread exit.
pub fn release_ring<H>(ring: Ring<H>) {
    unsafe {
        let mut remaining = ring;
        while let Some(p) = ring::pop(&mut remaining) {
            trace!("boxroot: releasing pool {:p} to platform", p.as_ptr());
            free_pool(p.cast(), crate::config::POOL_SIZE);
        }
    }
}

/// A type-erased `Registry<H>` entry: `Any` for the downcast back to the
/// concrete host type, plus a non-generic hook so `teardown()` can release
/// every registered host's pools without ever naming `H`.
trait ErasedRegistry: Any + Send + Sync {
    fn release_all(&self);
    fn as_any(&self) -> &dyn Any;
}

impl<H: Send + Sync + 'static> ErasedRegistry for Registry<H> {
    /// Walks every owner's rings plus the Orphaned rings and returns every
    /// pool found to the platform. Does not reach a still-running thread's
    /// `current_pool`, which is cached in that thread's own TLS and outside
    /// this registry's reach.
    fn release_all(&self) {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        for rings in table.values() {
            let mut inner = rings.inner.lock().unwrap_or_else(|e| e.into_inner());
            release_ring(inner.young.take());
            release_ring(inner.old.take());
            release_ring(inner.free.take());
        }
        drop(table);

        let mut orphaned = self.orphaned.inner.lock().unwrap_or_else(|e| e.into_inner());
        release_ring(orphaned.young.take());
        release_ring(orphaned.old.take());
        release_ring(orphaned.free.take());
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// One `Registry<H>` for the whole process, keyed by `H`'s `TypeId` since a
/// plain `static` cannot itself carry a generic parameter.
fn registry_slot() -> &'static Mutex<HashMap<TypeId, Box<dyn ErasedRegistry>>> {
    static SLOT: OnceCell<Mutex<HashMap<TypeId, Box<dyn ErasedRegistry>>>> = OnceCell::new();
    SLOT.get_or_init(|| Mutex::new(HashMap::new()))
}

/// The process-wide registry for host type `H`. Lazily constructed on first
/// use.
pub fn registry<H: Host>() -> &'static Registry<H> {
    let mut table = registry_slot().lock().unwrap_or_else(|e| e.into_inner());
    let entry = table
        .entry(TypeId::of::<H>())
        .or_insert_with(|| Box::new(Registry::<H>::new()) as Box<dyn ErasedRegistry>);
    let ptr: *const Registry<H> =
        entry.as_any().downcast_ref::<Registry<H>>().expect("TypeId collision");
    // SAFETY: entries are never removed or replaced once inserted, and the
    // map itself lives for the process; the reference stays valid as long
    // as the map does, i.e. forever.
    unsafe { &*ptr }
}

/// Releases every outstanding pool across every host type's registry back to
/// the platform. Called from `teardown()`.
pub fn release_all_registries() {
    let table = registry_slot().lock().unwrap_or_else(|e| e.into_inner());
    for registry in table.values() {
        registry.release_all();
    }
}

/// Per-thread hot-path state: which owner id this thread was assigned,
/// which `ThreadRings` it holds (cloned out of the registry once), and a
/// cached pointer to the current pool, so `create`'s hot path reads it
/// without a mutex or table lookup.
pub struct ThreadLocalState<H: Host> {
    pub owner: OwnerId,
    pub rings: Arc<ThreadRings<H>>,
    pub current_pool: Cell<Option<NonNull<PoolHeader<H>>>>,
}

impl<H: Host> ThreadLocalState<H> {
    fn new() -> Self {
        let reg = registry::<H>();
        let owner = reg.fresh_owner_id();
        let rings = reg.rings_for(owner);
        trace!("boxroot: thread {owner} registered");
        ThreadLocalState { owner, rings, current_pool: Cell::new(None) }
    }
}

impl<H: Host> Drop for ThreadLocalState<H> {
    fn drop(&mut self) {
        let reg = registry::<H>();
        let free = reg.orphan(self.owner, &self.rings, self.current_pool.take());
        release_ring(free);
    }
}

thread_local! {
    static TLS_SLOTS: RefCell<HashMap<TypeId, Box<dyn Any>>> = RefCell::new(HashMap::new());
}

/// Runs `f` against this thread's `ThreadLocalState<H>`, creating it (and
/// registering the thread) on first use.
pub fn with_thread_state<H: Host, R>(f: impl FnOnce(&ThreadLocalState<H>) -> R) -> R {
    TLS_SLOTS.with(|slots| {
        let mut slots = slots.borrow_mut();
        let entry = slots
            .entry(TypeId::of::<H>())
            .or_insert_with(|| Box::new(ThreadLocalState::<H>::new()) as Box<dyn Any>);
        let state = entry.downcast_ref::<ThreadLocalState<H>>().expect("TypeId collision");
        f(state)
    })
}

/// Forces this thread's pools to be orphaned immediately, without waiting
/// for the OS thread itself to exit. Hosts whose notion of "thread" is
/// lighter than an OS thread (coroutines, green threads, a GC "domain"
/// distinct from the OS thread carrying it) call this explicitly; ordinary
/// OS thread exit is already covered by `ThreadLocalState`'s `Drop` impl.
/// The next `with_thread_state` call on this OS thread registers a fresh
/// owner id and starts empty.
pub fn force_orphan_current_thread<H: Host>() {
    TLS_SLOTS.with(|slots| {
        slots.borrow_mut().remove(&TypeId::of::<H>());
    });
}

#[cfg(test)]
mod thread_tests {
    use super::*;
    use crate::pool::PoolClass;

    #[derive(Clone, Copy)]
    struct TestHost;
    impl Host for TestHost {
        fn is_immediate(v: usize) -> bool {
            v & 1 != 0
        }
        fn young_range() -> std::ops::Range<usize> {
            0..0
        }
    }

    #[test]
    fn fresh_owner_ids_are_distinct() {
        let reg: Registry<TestHost> = Registry::new();
        let a = reg.fresh_owner_id();
        let b = reg.fresh_owner_id();
        assert_ne!(a, b);
    }

    #[test]
    fn orphaned_rings_are_shared_singleton() {
        let reg: Registry<TestHost> = Registry::new();
        let o1 = reg.orphaned();
        let o2 = reg.rings_for(ORPHANED_OWNER);
        assert!(Arc::ptr_eq(&o1, &o2));
    }

    #[test]
    fn rings_for_same_owner_returns_same_arc() {
        let reg: Registry<TestHost> = Registry::new();
        let a = reg.rings_for(7);
        let b = reg.rings_for(7);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn orphan_moves_non_free_rings_and_reassigns_owner() {
        use crate::config::POOL_SIZE;
        use crate::platform::alloc_aligned_pool;

        let reg: Registry<TestHost> = Registry::new();
        let owner = reg.fresh_owner_id();
        let rings = reg.rings_for(owner);

        let mem = alloc_aligned_pool(POOL_SIZE).unwrap();
        unsafe {
            PoolHeader::<TestHost>::init_in_place(mem.as_ptr() as *mut _, owner);
        }
        let pool: NonNull<PoolHeader<TestHost>> = mem.cast();
        unsafe {
            pool.as_ref().class.set(PoolClass::Young);
        }

        {
            let mut inner = rings.inner.lock().unwrap();
            unsafe { ring::push_back(&mut inner.young, pool) };
        }

        let free = reg.orphan(owner, &rings, None);
        assert!(free.is_none());

        unsafe {
            assert_eq!(pool.as_ref().owner.get(), ORPHANED_OWNER);
        }

        let orphaned = reg.orphaned();
        let inner = orphaned.inner.lock().unwrap();
        let found: Vec<_> = ring::iter(inner.young).collect();
        assert!(found.contains(&pool));
        drop(inner);

        unsafe { free_pool(pool.cast(), POOL_SIZE) };
    }

    #[test]
    fn registry_is_stable_across_calls_for_same_host() {
        let a = registry::<TestHost>() as *const _;
        let b = registry::<TestHost>() as *const _;
        assert_eq!(a, b);
    }
}
