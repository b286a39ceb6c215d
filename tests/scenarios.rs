//! End-to-end scenarios exercising the allocator across threads, capacity
//! overflow, minor promotion, and modify reclassification.

use std::ops::Range;
use std::sync::{Arc, Barrier};
use std::thread;

use boxroot::alloc::Allocator;
use boxroot::pool;
use boxroot::scan;
use boxroot::value::{Host, Value, Visitor};

#[derive(Clone, Copy)]
struct TestHost;

const YOUNG_START: usize = 0x1_0000;
const YOUNG_END: usize = 0x2_0000;
const OLD_BASE: usize = 0x9_0000;

impl Host for TestHost {
    fn is_immediate(v: Value) -> bool {
        v & 1 != 0
    }
    fn young_range() -> Range<usize> {
        YOUNG_START..YOUNG_END
    }
}

fn young_value(n: usize) -> usize {
    YOUNG_START + n * 2
}

fn old_value(n: usize) -> usize {
    OLD_BASE + n * 2
}

struct RecordingVisitor {
    visited: Vec<Value>,
}
impl Visitor for RecordingVisitor {
    fn visit(&mut self, slot: &mut Value) {
        self.visited.push(*slot);
    }
}

/// Simulates the host's copying minor collector: every young value is
/// rewritten to an address outside the young window.
struct PromoteVisitor;
impl Visitor for PromoteVisitor {
    fn visit(&mut self, slot: &mut Value) {
        *slot += OLD_BASE;
    }
}

#[test]
fn allocation_past_one_pool_round_trips_all_values() {
    let alloc = Allocator::<TestHost>::new();
    let cap = pool::capacity::<TestHost>();

    let mut handles = Vec::with_capacity(cap + 1);
    for i in 0..=cap {
        handles.push(alloc.create(old_value(i)).expect("allocation should not fail"));
    }
    for (i, h) in handles.iter().enumerate() {
        assert_eq!(alloc.get(*h), old_value(i));
    }
    for h in handles {
        alloc.delete(h);
    }
}

#[test]
fn minor_scan_promotes_young_pools_after_visitor_rewrite() {
    let alloc = Allocator::<TestHost>::new();
    let mut handles = Vec::new();
    for i in 0..100 {
        handles.push(alloc.create(young_value(i)).unwrap());
    }

    let mut visitor = PromoteVisitor;
    let visited = scan::scan::<TestHost>(true, true, &mut visitor);
    assert_eq!(visited, 100);

    for (i, h) in handles.iter().enumerate() {
        let v = alloc.get(*h);
        assert!(!TestHost::is_young(v), "value {v:#x} should have left the young window");
        assert_eq!(v, young_value(i) + OLD_BASE);
    }

    for h in handles {
        alloc.delete(h);
    }
}

#[test]
fn modify_reclassifies_across_generations() {
    let alloc = Allocator::<TestHost>::new();
    let mut h = alloc.create(old_value(0)).unwrap();

    alloc.modify(&mut h, young_value(0));
    assert_eq!(alloc.get(h), young_value(0));

    // An immediate overwrite afterward must stay in place: writing an
    // immediate never needs reallocation regardless of the old class.
    let addr_before = h.as_ptr();
    alloc.modify(&mut h, 0xFF01); // odd => immediate under TestHost
    assert_eq!(h.as_ptr(), addr_before);
    assert_eq!(alloc.get(h), 0xFF01);

    alloc.delete(h);
}

#[test]
fn remote_thread_delete_is_merged_on_next_scan() {
    let alloc = Arc::new(Allocator::<TestHost>::new());
    let mut handles = Vec::new();
    for i in 0..10 {
        handles.push(alloc.create(old_value(i)).unwrap());
    }

    let to_delete: Vec<_> = handles[..5].to_vec();
    let barrier = Arc::new(Barrier::new(2));

    let remote_alloc = alloc.clone();
    let remote_barrier = barrier.clone();
    let remote = thread::spawn(move || {
        remote_barrier.wait();
        for h in to_delete {
            remote_alloc.delete(h);
        }
    });

    barrier.wait();
    remote.join().unwrap();

    // Thread A's next scan merges the delayed deletes into the main free
    // list.
    let mut visitor = RecordingVisitor { visited: Vec::new() };
    scan::scan::<TestHost>(false, false, &mut visitor);
    assert_eq!(visitor.visited.len(), 5, "only the 5 surviving handles should be visited");

    for h in &handles[5..] {
        alloc.delete(*h);
    }
}

#[test]
fn exited_thread_pools_are_adopted_by_another_thread() {
    let alloc = Arc::new(Allocator::<TestHost>::new());

    let creator_alloc = alloc.clone();
    thread::spawn(move || {
        for i in 0..20 {
            creator_alloc.create(old_value(i)).unwrap();
        }
        // Thread exits here; `ThreadLocalState::drop` orphans its pools.
    })
    .join()
    .unwrap();

    // A scan on this thread adopts the orphaned pools and should find all
    // 20 surviving values.
    let mut visitor = RecordingVisitor { visited: Vec::new() };
    let visited = scan::scan::<TestHost>(false, false, &mut visitor);
    assert_eq!(visited, 20);
}

#[test]
fn teardown_succeeds_with_outstanding_handles() {
    let alloc = Allocator::<TestHost>::new();
    let cap = pool::capacity::<TestHost>();
    for i in 0..=cap {
        alloc.create(old_value(i)).unwrap();
    }
    boxroot::teardown();
}
