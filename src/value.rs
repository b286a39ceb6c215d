//! The host value ABI: a word whose low bit encodes immediate-vs-pointer,
//! and whose address range for the young generation is queryable.
//!
//! The host GC itself is never implemented here, only consumed as a
//! collaborator: the contract is a trait implemented once per embedding,
//! rather than baked into the allocator against one specific host.

use std::ops::Range;

/// An opaque host word: a tagged pointer or an immediate, exactly as stored
/// in a slot.
pub type Value = usize;

/// The collaborator contract a host GC must satisfy to back a boxroot
/// `Allocator`. Implementations are expected to be stateless marker types:
/// all host state lives on the host side and is reached through whatever
/// the implementation's methods choose to read (globals, FFI calls, atomics
/// set up during `setup()`).
pub trait Host: 'static {
    /// True if `v` is an immediate value: carries no pointer, never moves,
    /// never needs to be visited by a scan.
    fn is_immediate(v: Value) -> bool;

    /// The current bounds of the young generation, `[start, end)`. Queried
    /// fresh on every scan since a moving/compacting host may relocate the
    /// young generation between collections.
    fn young_range() -> Range<usize>;

    /// True iff `v` is a pointer into the young generation. The young-scan
    /// fast path is exactly this test, applied without the `is_pool_member`
    /// check a generic scan would also need.
    #[inline]
    fn is_young(v: Value) -> bool {
        !Self::is_immediate(v) && Self::young_range().contains(&v)
    }
}

/// The host's view of a single root during a scan: `visit` may rewrite the
/// slot in place, which is how a copying collection forwards pointers.
/// Callers must re-read the slot after each visit rather than caching it.
pub trait Visitor {
    fn visit(&mut self, slot: &mut Value);
}

impl<F: FnMut(&mut Value)> Visitor for F {
    fn visit(&mut self, slot: &mut Value) {
        self(slot)
    }
}
