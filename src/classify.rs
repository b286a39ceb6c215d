//! Young/old/immediate classification and the pool class state machine.

use crate::config::{DEALLOC_THRESHOLD_DEN, DEALLOC_THRESHOLD_NUM};
use crate::pool::PoolClass;
use crate::value::{Host, Value};

/// Classification of a value about to be stored in (or already sitting in)
/// a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueClass {
    Immediate,
    Young,
    Old,
}

pub fn classify<H: Host>(v: Value) -> ValueClass {
    if H::is_immediate(v) {
        ValueClass::Immediate
    } else if H::is_young(v) {
        ValueClass::Young
    } else {
        ValueClass::Old
    }
}

/// What `modify` must do when overwriting a slot whose old value had class
/// `from` with a new value of class `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyAction {
    /// old→old, young→young, young→old, or the new value is an immediate:
    /// the slot's class-correctness is unaffected, just overwrite.
    InPlace,
    /// old→young: the slot must move to a pool that is scanned on minor
    /// collections. Try to reallocate it there first.
    TryReallocateYoung,
}

pub fn modify_action(from: ValueClass, to: ValueClass) -> ModifyAction {
    match (from, to) {
        (ValueClass::Old, ValueClass::Young) => ModifyAction::TryReallocateYoung,
        _ => ModifyAction::InPlace,
    }
}

/// `DEALLOC_THRESHOLD`: the fullness step, in slots, below which a pool is
/// moved to the front of its ring by `try_demote_pool`. A power-of-two
/// fraction of `capacity`.
#[inline(always)]
pub fn dealloc_threshold(capacity: usize) -> usize {
    capacity * DEALLOC_THRESHOLD_NUM / DEALLOC_THRESHOLD_DEN
}

/// Whether deleting a slot that brought `alloc_count` from `before` to
/// `before - 1` crossed the demotion threshold downward, i.e. whether
/// `try_demote_pool` should run.
#[inline(always)]
pub fn crossed_dealloc_threshold(before: u32, capacity: usize) -> bool {
    let threshold = dealloc_threshold(capacity) as u32;
    before == threshold + 1
}

/// Generalization of [`crossed_dealloc_threshold`] for merging a batch of
/// delayed deletes at once, where `alloc_count` may drop by more than one
/// in a single step: true iff `before` was above the threshold and `after`
/// is at or below it.
#[inline(always)]
pub fn crossed_dealloc_threshold_range(before: u32, after: u32, capacity: usize) -> bool {
    let threshold = dealloc_threshold(capacity) as u32;
    before > threshold && after <= threshold
}

/// The pool class transitions, made explicit as functions so the
/// allocator/scanner don't have to re-derive them inline.
pub fn next_class_on_fill() -> PoolClass {
    // CURRENT -> (full) -> YOUNG, on the next create's slow path.
    PoolClass::Young
}

pub fn next_class_on_empty() -> PoolClass {
    PoolClass::Free
}
