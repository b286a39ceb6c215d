//! Eventually-consistent counters for observability only; never read for a
//! correctness decision, and never synchronized against the allocator's
//! locks, so a snapshot may race with concurrent mutators.
//!
//! `print_stats` writes to stdout directly, not through the `log` facade: it
//! is an on-demand report a host asks for, not a diagnostic event.

use crate::platform::AtomicCounter;

struct Stats {
    creates: AtomicCounter,
    deletes: AtomicCounter,
    remote_deletes: AtomicCounter,
    pools_allocated: AtomicCounter,
    pools_freed: AtomicCounter,
    minor_scans: AtomicCounter,
    major_scans: AtomicCounter,
}

static STATS: Stats = Stats {
    creates: AtomicCounter::new(0),
    deletes: AtomicCounter::new(0),
    remote_deletes: AtomicCounter::new(0),
    pools_allocated: AtomicCounter::new(0),
    pools_freed: AtomicCounter::new(0),
    minor_scans: AtomicCounter::new(0),
    major_scans: AtomicCounter::new(0),
};

pub fn record_create() {
    STATS.creates.fetch_add(1);
}

pub fn record_delete() {
    STATS.deletes.fetch_add(1);
}

pub fn record_remote_delete() {
    STATS.remote_deletes.fetch_add(1);
}

pub fn record_pool_allocated() {
    STATS.pools_allocated.fetch_add(1);
}

pub fn record_pool_freed() {
    STATS.pools_freed.fetch_add(1);
}

pub fn record_minor_scan() {
    STATS.minor_scans.fetch_add(1);
}

pub fn record_major_scan() {
    STATS.major_scans.fetch_add(1);
}

/// Prints the current snapshot; values may be stale relative to concurrent
/// mutators, by design.
pub fn print_stats() {
    println!("boxroot stats:");
    println!("  creates:          {}", STATS.creates.load());
    println!("  deletes:          {}", STATS.deletes.load());
    println!("  remote deletes:   {}", STATS.remote_deletes.load());
    println!("  pools allocated:  {}", STATS.pools_allocated.load());
    println!("  pools freed:      {}", STATS.pools_freed.load());
    println!("  minor scans:      {}", STATS.minor_scans.load());
    println!("  major scans:      {}", STATS.major_scans.load());
}

#[cfg(test)]
mod stats_tests {
    use super::*;

    #[test]
    fn counters_are_monotonic_under_single_thread_use() {
        let before = STATS.creates.load();
        record_create();
        record_create();
        assert_eq!(STATS.creates.load(), before + 2);
    }
}
