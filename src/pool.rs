//! The pool: a fixed-size, self-aligned block of slots.
//!
//! This is the internal-only primitive everything else resolves to. Rather
//! than a separate free-list `Vec` and age bitmap, the free list is threaded
//! *through the slots themselves*: a free slot's word holds either a
//! pointer to the next free slot or the pool header, overloading the same
//! storage a live value would otherwise occupy. That is the whole reason
//! `create`/`delete` can be a handful of instructions with no separate
//! bookkeeping structure to touch.

use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Mutex;

use crate::config::POOL_SIZE;
use crate::value::Value;

/// One pool slot: a machine-word-sized cell holding either a live host
/// value, a free-list link (a pointer to another slot in the same pool),
/// or the free-list terminator (a pointer to the pool header). Which of the
/// three it is is determined entirely by context: pool class plus free-list
/// traversal, never an in-band tag.
#[repr(transparent)]
pub struct Slot(Cell<usize>);

impl Slot {
    #[inline(always)]
    pub fn get(&self) -> usize {
        self.0.get()
    }

    #[inline(always)]
    pub fn set(&self, v: usize) {
        self.0.set(v);
    }
}

/// Which ring a pool currently belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PoolClass {
    Current = 0,
    Young = 1,
    Old = 2,
    Free = 3,
}

/// A thread id, or the sentinel meaning "owned by the Orphaned
/// pseudo-thread". Plain `u64` so the header stays `Copy`/`repr(C)`-friendly;
/// `thread::ThreadId` itself has no stable numeric representation.
pub type OwnerId = u64;
pub const ORPHANED_OWNER: OwnerId = u64::MAX;

/// The pool header: lives at offset 0 of the pool block, immediately
/// followed by the slot array.
#[repr(C)]
pub struct PoolHeader<H> {
    pub prev: Cell<Option<NonNull<PoolHeader<H>>>>,
    pub next: Cell<Option<NonNull<PoolHeader<H>>>>,
    pub free_list_head: Cell<*const Slot>,
    /// Deletes from a non-owning thread land here instead of on the main
    /// free list; merged in by the owner at its next scan.
    pub delayed_fl: Mutex<Vec<*const Slot>>,
    pub alloc_count: Cell<u32>,
    pub class: Cell<PoolClass>,
    pub owner: Cell<OwnerId>,
    capacity: u32,
    /// Running XOR of every address currently on the free list. Cheap to
    /// maintain incrementally on every push/pop; `validate_freelist` can
    /// then catch a freed cell whose link got overwritten without having to
    /// keep a shadow copy of the whole list.
    #[cfg(feature = "memfence")]
    freelist_canary: Cell<usize>,
    _marker: PhantomData<H>,
}

// SAFETY: a `PoolHeader` is only ever mutated either by its owning thread,
// while holding the host's execution-context lock, or while holding that
// thread's rings mutex (for everything else, including `delayed_fl`, which
// carries its own `Mutex`). The `Cell`s here are not individually
// synchronized; callers must hold the appropriate lock before touching them
// from a non-owning thread.
unsafe impl<H> Send for PoolHeader<H> {}
unsafe impl<H> Sync for PoolHeader<H> {}

/// Number of slots that fit in one pool after the header.
pub fn capacity<H>() -> usize {
    (POOL_SIZE - std::mem::size_of::<PoolHeader<H>>()) / std::mem::size_of::<Slot>()
}

impl<H> PoolHeader<H> {
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Pointer to slot `i` in this pool. Does not bounds-check in release
    /// builds; callers are internal and already trust `i < capacity`.
    #[inline(always)]
    pub unsafe fn slot(&self, i: usize) -> *const Slot {
        debug_assert!(i < self.capacity());
        let base = (self as *const Self as *const u8).add(std::mem::size_of::<Self>());
        (base as *const Slot).add(i)
    }

    #[inline(always)]
    fn as_terminator(&self) -> *const Slot {
        self as *const Self as *const Slot
    }

    /// Pops the head of the free list, or `None` on underflow.
    #[inline(always)]
    pub fn pop_freelist(&self) -> Option<NonNull<Slot>> {
        let head = self.free_list_head.get();
        if head == self.as_terminator() {
            return None;
        }
        unsafe {
            let next = (*head).get() as *const Slot;
            self.free_list_head.set(next);
        }
        #[cfg(feature = "memfence")]
        self.freelist_canary.set(self.freelist_canary.get() ^ head as usize);
        self.alloc_count.set(self.alloc_count.get() + 1);
        NonNull::new(head as *mut Slot)
    }

    /// Pushes `slot` back onto the free list.
    ///
    /// # Safety
    /// `slot` must point at a slot within this pool that is not currently
    /// live (i.e. it was previously popped and has not been pushed back
    /// since).
    #[inline(always)]
    pub unsafe fn push_freelist(&self, slot: NonNull<Slot>) {
        let head = self.free_list_head.get();
        slot.as_ref().set(head as usize);
        self.free_list_head.set(slot.as_ptr());
        #[cfg(feature = "memfence")]
        self.freelist_canary.set(self.freelist_canary.get() ^ slot.as_ptr() as usize);
        self.alloc_count.set(self.alloc_count.get() - 1);
    }

    /// Number of free (not-yet-allocated-or-returned) slots.
    #[inline(always)]
    pub fn free_count(&self) -> usize {
        self.capacity() - self.alloc_count.get() as usize
    }

    /// True iff `value`, read as a pool-relative address, refers to a free
    /// slot or the terminator of *this* pool. The `-2` rather than `-1` in
    /// the mask is deliberate: it lets the terminator, a pointer to the
    /// header word itself, compare equal under the same mask used for
    /// ordinary slot links.
    #[inline(always)]
    pub fn is_pool_member(&self, value: usize) -> bool {
        let mask = !(POOL_SIZE - 2);
        (value & mask) == (self as *const Self as usize)
    }

    /// Initializes a freshly mapped pool block: builds the free list in
    /// forward, contiguous order so the first `CAPACITY` allocations hit
    /// consecutive addresses, for better cache locality in the common case
    /// of allocating a run of short-lived values.
    ///
    /// # Safety
    /// `header` must point at the start of a `POOL_SIZE`-aligned,
    /// `POOL_SIZE`-byte block that is otherwise uninitialized.
    pub unsafe fn init_in_place(header: *mut PoolHeader<H>, owner: OwnerId) {
        let cap = capacity::<H>();
        std::ptr::write(
            header,
            PoolHeader {
                prev: Cell::new(None),
                next: Cell::new(None),
                free_list_head: Cell::new(std::ptr::null()),
                delayed_fl: Mutex::new(Vec::new()),
                alloc_count: Cell::new(0),
                class: Cell::new(PoolClass::Free),
                owner: Cell::new(owner),
                capacity: cap as u32,
                #[cfg(feature = "memfence")]
                freelist_canary: Cell::new(0),
                _marker: PhantomData,
            },
        );
        let header_ref = &*header;
        header_ref.prev.set(NonNull::new(header));
        header_ref.next.set(NonNull::new(header));

        if cap == 0 {
            header_ref.free_list_head.set(header_ref.as_terminator());
            return;
        }

        // slots[CAPACITY-1] terminates the list; slots[i] links to i+1 for
        // the rest, so popping yields consecutive addresses 0, 1, 2, ...
        for i in 0..cap - 1 {
            let s = header_ref.slot(i);
            (*s).set(header_ref.slot(i + 1) as usize);
        }
        (*header_ref.slot(cap - 1)).set(header_ref.as_terminator() as usize);
        header_ref.free_list_head.set(header_ref.slot(0));

        #[cfg(feature = "memfence")]
        {
            let mut xor = 0usize;
            for i in 0..cap {
                xor ^= header_ref.slot(i) as usize;
            }
            header_ref.freelist_canary.set(xor);
        }
    }

    /// Recovers the owning pool header from a live slot address in O(1) by
    /// masking off the low bits, relying on every pool being aligned to its
    /// own size.
    ///
    /// # Safety
    /// `slot` must be an address that was handed out by some pool's
    /// `init_in_place`/allocation path.
    #[inline(always)]
    pub unsafe fn header_of(slot: *const Slot) -> *const PoolHeader<H> {
        ((slot as usize) & !(POOL_SIZE - 1)) as *const PoolHeader<H>
    }

    /// Debug-only well-formedness check: traversing `free_list_head`
    /// terminates at the header in exactly `CAPACITY - alloc_count` steps
    /// and visits each free slot once.
    #[cfg(any(test, feature = "debug-checks"))]
    pub fn validate_freelist(&self) {
        let mut seen = std::collections::HashSet::new();
        let mut cur = self.free_list_head.get();
        let mut steps = 0usize;
        while cur != self.as_terminator() {
            assert!(
                seen.insert(cur as usize),
                "boxroot: freelist cycle detected in pool {:p}",
                self
            );
            steps += 1;
            assert!(steps <= self.capacity(), "boxroot: freelist longer than capacity");
            cur = unsafe { (*cur).get() as *const Slot };
        }
        assert_eq!(
            steps,
            self.capacity() - self.alloc_count.get() as usize,
            "boxroot: freelist length does not match capacity - alloc_count"
        );

        #[cfg(feature = "memfence")]
        {
            let mut xor = 0usize;
            let mut cur = self.free_list_head.get();
            while cur != self.as_terminator() {
                xor ^= cur as usize;
                cur = unsafe { (*cur).get() as *const Slot };
            }
            assert_eq!(
                xor,
                self.freelist_canary.get(),
                "boxroot: freelist canary mismatch, possible corruption in pool {:p}",
                self
            );
        }
    }
}

#[cfg(test)]
mod pool_tests {
    use super::*;
    use crate::platform::{alloc_aligned_pool, free_pool};

    struct TestHost;
    impl crate::value::Host for TestHost {
        fn is_immediate(v: Value) -> bool {
            v & 1 != 0
        }
        fn young_range() -> std::ops::Range<usize> {
            0..0
        }
    }

    fn fresh_pool() -> NonNull<PoolHeader<TestHost>> {
        let mem = alloc_aligned_pool(POOL_SIZE).unwrap();
        unsafe {
            PoolHeader::<TestHost>::init_in_place(mem.as_ptr() as *mut _, 0);
        }
        mem.cast()
    }

    unsafe fn release(p: NonNull<PoolHeader<TestHost>>) {
        free_pool(p.cast(), POOL_SIZE);
    }

    #[test]
    fn fresh_pool_has_full_freelist() {
        let p = fresh_pool();
        unsafe {
            let h = p.as_ref();
            assert_eq!(h.alloc_count.get(), 0);
            assert_eq!(h.free_count(), capacity::<TestHost>());
            h.validate_freelist();
            release(p);
        }
    }

    #[test]
    fn pop_then_push_restores_freelist() {
        let p = fresh_pool();
        unsafe {
            let h = p.as_ref();
            let cap = capacity::<TestHost>();
            let s0 = h.pop_freelist().unwrap();
            assert_eq!(h.alloc_count.get(), 1);
            assert_eq!(h.free_count(), cap - 1);
            h.push_freelist(s0);
            assert_eq!(h.alloc_count.get(), 0);
            h.validate_freelist();
            release(p);
        }
    }

    #[test]
    fn allocating_full_capacity_drains_freelist() {
        let p = fresh_pool();
        unsafe {
            let h = p.as_ref();
            let cap = capacity::<TestHost>();
            let mut slots = Vec::with_capacity(cap);
            for _ in 0..cap {
                slots.push(h.pop_freelist().expect("should not underflow"));
            }
            assert!(h.pop_freelist().is_none(), "pool should be exhausted");
            assert_eq!(h.alloc_count.get() as usize, cap);
            for s in slots {
                h.push_freelist(s);
            }
            h.validate_freelist();
            release(p);
        }
    }

    #[test]
    fn header_of_recovers_pool_from_any_live_slot() {
        let p = fresh_pool();
        unsafe {
            let h = p.as_ref();
            let s = h.pop_freelist().unwrap();
            let recovered = PoolHeader::<TestHost>::header_of(s.as_ptr());
            assert_eq!(recovered as usize, p.as_ptr() as usize);
            h.push_freelist(s);
            release(p);
        }
    }

    #[test]
    fn is_pool_member_true_for_freelist_and_terminator() {
        let p = fresh_pool();
        unsafe {
            let h = p.as_ref();
            // the head of a fresh pool's free list is itself pool-owned
            let head_val = h.free_list_head.get() as usize;
            assert!(h.is_pool_member(head_val));
            release(p);
        }
    }
}
