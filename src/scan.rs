//! The scan callback invoked by the host GC.

use std::ptr::NonNull;

use crate::classify;
use crate::pool::{OwnerId, PoolClass, PoolHeader, Slot, ORPHANED_OWNER};
use crate::ring::{self, Ring};
use crate::stats;
use crate::thread::{self, RingsInner, ThreadLocalState};
use crate::value::{Host, Value, Visitor};

/// Runs one scan on the calling thread and returns the number of slots the
/// visitor was invoked on. `only_young` selects the young-specialized scan;
/// `minor` says
/// whether the host GC just completed a minor collection (in which case
/// `young`/`current` are promoted to `old`) or a major one (in which case
/// the `free` ring is returned to the platform).
pub fn scan<H: Host>(only_young: bool, minor: bool, visitor: &mut dyn Visitor) -> usize {
    thread::with_thread_state::<H, _>(|state| scan_with(state, only_young, minor, visitor))
}

fn scan_with<H: Host>(
    state: &ThreadLocalState<H>,
    only_young: bool,
    minor: bool,
    visitor: &mut dyn Visitor,
) -> usize {
    let mut inner = state.rings.inner.lock().unwrap_or_else(|e| e.into_inner());

    #[cfg(any(test, feature = "debug-checks"))]
    validate_rings(&inner, state.current_pool.get());

    // Step 2: merge delayed remote deletes, reclassifying pools that became
    // empty or crossed the demotion threshold.
    if let Some(p) = state.current_pool.get() {
        merge_pool_delayed(p);
    }
    merge_and_reclassify_ring(&mut inner.young, &mut inner.free);
    merge_and_reclassify_ring(&mut inner.old, &mut inner.free);

    // Step 3: adopt orphaned pools.
    adopt_orphans::<H>(&mut inner, state.owner);

    // Step 4: scan current, young, and (if a full scan) old.
    let mut visited = 0;
    if let Some(cur) = state.current_pool.get() {
        visited += scan_pool::<H>(cur, only_young, visitor);
    }
    for pool in ring::iter(inner.young) {
        visited += scan_pool::<H>(pool, only_young, visitor);
    }
    if !only_young {
        for pool in ring::iter(inner.old) {
            visited += scan_pool::<H>(pool, only_young, visitor);
        }
    }

    // Steps 5/6.
    if minor {
        stats::record_minor_scan();
        promote_minor(&mut inner, state.current_pool.get());
        state.current_pool.set(None);
    } else {
        stats::record_major_scan();
        let freed = inner.free.take();
        drop(inner);
        release_freed::<H>(freed);
    }

    visited
}

fn release_freed<H>(ring: Ring<H>) {
    let mut remaining = ring;
    let mut n = 0usize;
    unsafe {
        while let Some(p) = ring::pop(&mut remaining) {
            crate::platform::free_pool(p.cast(), crate::config::POOL_SIZE);
            n += 1;
        }
    }
    for _ in 0..n {
        stats::record_pool_freed();
    }
}

#[cfg(any(test, feature = "debug-checks"))]
fn validate_rings<H>(inner: &RingsInner<H>, current: Option<NonNull<PoolHeader<H>>>) {
    if let Some(p) = current {
        unsafe { p.as_ref().validate_freelist() };
    }
    for r in [inner.young, inner.old, inner.free] {
        for p in ring::iter(r) {
            unsafe { p.as_ref().validate_freelist() };
        }
    }
}

/// Drains a single pool's `delayed_fl` into its main free list, returning
/// `(alloc_count_before, alloc_count_after)`.
fn merge_pool_delayed<H>(pool: NonNull<PoolHeader<H>>) -> (u32, u32) {
    let header = unsafe { pool.as_ref() };
    let before = header.alloc_count.get();
    let mut delayed = header.delayed_fl.lock().unwrap_or_else(|e| e.into_inner());
    for slot_ptr in delayed.drain(..) {
        if let Some(slot) = NonNull::new(slot_ptr as *mut Slot) {
            unsafe { header.push_freelist(slot) };
        }
    }
    (before, header.alloc_count.get())
}

/// Merges delayed deletes for every pool in `ring_ref`, moving pools that
/// became empty into `free_ref` and pools that merely crossed the demotion
/// threshold to the front of `ring_ref`.
fn merge_and_reclassify_ring<H>(ring_ref: &mut Ring<H>, free_ref: &mut Ring<H>) {
    let pools: Vec<_> = ring::iter(*ring_ref).collect();
    for pool in pools {
        let (before, after) = merge_pool_delayed(pool);
        if before == after {
            continue;
        }
        let header = unsafe { pool.as_ref() };
        let cap = header.capacity();
        if header.alloc_count.get() == 0 {
            unsafe { ring::remove(ring_ref, pool) };
            header.class.set(classify::next_class_on_empty());
            unsafe { ring::push_front(free_ref, pool) };
        } else if classify::crossed_dealloc_threshold_range(before, after, cap) {
            unsafe { ring::remove(ring_ref, pool) };
            unsafe { ring::push_front(ring_ref, pool) };
        }
    }
}

/// Adopts Orphaned's pools into the calling thread's rings: the first scan
/// that acquires the Orphaned lock drains orphaned pools into its own
/// rings, becoming responsible for them. The Orphaned pseudo-thread itself
/// never adopts from itself.
fn adopt_orphans<H: Host>(inner: &mut RingsInner<H>, owner: OwnerId) {
    if owner == ORPHANED_OWNER {
        return;
    }
    let reg = thread::registry::<H>();
    let orphaned = reg.orphaned();
    let mut their_inner = orphaned.inner.lock().unwrap_or_else(|e| e.into_inner());

    if let Some(head) = their_inner.young.take() {
        reassign_and_merge(head, owner, &mut inner.young);
    }
    if let Some(head) = their_inner.old.take() {
        reassign_and_merge(head, owner, &mut inner.old);
    }
}

fn reassign_and_merge<H>(head: NonNull<PoolHeader<H>>, owner: OwnerId, target: &mut Ring<H>) {
    unsafe {
        for p in ring::iter(Some(head)) {
            p.as_ref().owner.set(owner);
        }
        ring::push_back(target, head);
    }
}

/// Wholesale promotion of `young` and `current` into `old` by ring
/// concatenation: O(pool-count), never O(slot-count).
fn promote_minor<H>(inner: &mut RingsInner<H>, current: Option<NonNull<PoolHeader<H>>>) {
    if let Some(p) = current {
        unsafe { p.as_ref().class.set(PoolClass::Old) };
        unsafe { ring::push_back(&mut inner.old, p) };
    }
    if let Some(head) = inner.young.take() {
        unsafe {
            for p in ring::iter(Some(head)) {
                p.as_ref().class.set(PoolClass::Old);
            }
            ring::push_back(&mut inner.old, head);
        }
    }
}

/// Visits one pool with the scanner's two modes.
fn scan_pool<H: Host>(
    pool: NonNull<PoolHeader<H>>,
    only_young: bool,
    visitor: &mut dyn Visitor,
) -> usize {
    let header = unsafe { pool.as_ref() };
    let cap = header.capacity();
    let mut visited = 0;

    if only_young {
        // Young-specialized scan: skip `is_pool_member` entirely and rely
        // on young-range membership alone.
        for i in 0..cap {
            let slot = unsafe { header.slot(i) };
            let v = unsafe { (*slot).get() };
            if H::is_young(v) {
                visit_slot(slot, visitor);
                visited += 1;
            }
        }
    } else {
        // Generic scan: stop once every allocated slot has been seen,
        // skipping free-list members by address.
        let alloc_count = header.alloc_count.get() as usize;
        let mut found = 0;
        for i in 0..cap {
            if found >= alloc_count {
                break;
            }
            let slot = unsafe { header.slot(i) };
            let v = unsafe { (*slot).get() };
            if header.is_pool_member(v) {
                continue;
            }
            found += 1;
            visit_slot(slot, visitor);
            visited += 1;
        }
    }

    visited
}

fn visit_slot(slot: *const Slot, visitor: &mut dyn Visitor) {
    // Re-read and re-write around each call instead of caching the value:
    // the visitor is allowed to rewrite the slot, and a cached copy would
    // go stale.
    let mut v: Value = unsafe { (*slot).get() };
    visitor.visit(&mut v);
    unsafe { (*slot).set(v) };
}

#[cfg(test)]
mod scan_tests {
    use super::*;
    use crate::alloc::Allocator;

    #[derive(Clone, Copy)]
    struct TestHost;
    impl Host for TestHost {
        fn is_immediate(v: Value) -> bool {
            v & 1 != 0
        }
        fn young_range() -> std::ops::Range<usize> {
            0x1000..0x2000
        }
    }

    struct CountingVisitor {
        count: usize,
    }
    impl Visitor for CountingVisitor {
        fn visit(&mut self, _slot: &mut Value) {
            self.count += 1;
        }
    }

    #[test]
    fn major_scan_visits_every_live_value_once() {
        let alloc = Allocator::<TestHost>::new();
        let mut handles = Vec::new();
        for i in 0..10 {
            handles.push(alloc.create(0x9000 + i * 2).unwrap());
        }

        let mut v = CountingVisitor { count: 0 };
        scan::<TestHost>(false, false, &mut v);
        assert_eq!(v.count, 10);

        for h in handles {
            alloc.delete(h);
        }
    }

    #[test]
    fn minor_scan_rewrites_young_values_and_promotes_pools() {
        let alloc = Allocator::<TestHost>::new();
        let mut handles = Vec::new();
        for i in 0..10 {
            handles.push(alloc.create(0x1000 + i * 2).unwrap());
        }

        // Rewrite every young value to itself plus 0x8000 (now outside the
        // young window), matching what a real copying minor GC would do.
        struct Rewriter;
        impl Visitor for Rewriter {
            fn visit(&mut self, slot: &mut Value) {
                *slot += 0x8000;
            }
        }
        let mut rewriter = Rewriter;
        let visited = scan::<TestHost>(true, true, &mut rewriter);
        assert_eq!(visited, 10);

        for (i, h) in handles.iter().enumerate() {
            assert_eq!(alloc.get(*h), 0x1000 + i * 2 + 0x8000);
        }

        for h in handles {
            alloc.delete(h);
        }
    }

    #[test]
    fn only_young_scan_skips_old_values() {
        let alloc = Allocator::<TestHost>::new();
        let _old = alloc.create(0x9000).unwrap();
        let _young = alloc.create(0x1000).unwrap();

        let mut v = CountingVisitor { count: 0 };
        scan::<TestHost>(true, false, &mut v);
        assert_eq!(v.count, 1);
    }
}
