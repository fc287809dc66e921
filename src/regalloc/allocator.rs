//! The walk phase of the linear-scan allocator: assigns physical registers to
//! virtual-register intervals in ascending opId order, splitting and
//! spilling as needed.

use crate::lir::OpId;
use crate::operand::{FrameSlot, PReg};
use crate::regalloc::interval::{Interval, IntervalId, IntervalStore, UseKind};
use crate::regalloc::regset::RegisterSet;
use crate::regalloc::spillstate;
use crate::settings::SplitStrategy;
use cranelift_entity::EntityRef;
use log::trace;
use rustc_hash::FxHashMap;

/// A fresh, monotonically increasing source of canonical spill-slot
/// indices, shared by every spill decision made during one allocation.
pub struct SpillSlots {
    next: u32,
}

impl SpillSlots {
    pub fn new() -> Self {
        SpillSlots { next: 0 }
    }

    fn alloc(&mut self) -> FrameSlot {
        let slot = FrameSlot::new(self.next as usize);
        self.next += 1;
        slot
    }

    pub fn count(&self) -> u32 {
        self.next
    }
}

impl Default for SpillSlots {
    fn default() -> Self {
        Self::new()
    }
}

fn ensure_spill_slot(store: &mut IntervalStore, id: IntervalId, slots: &mut SpillSlots) -> FrameSlot {
    if let Some(slot) = store.spill_slot_of(id) {
        slot
    } else {
        let slot = slots.alloc();
        store.assign_spill_slot(id, slot);
        spillstate::note_slot_assigned(store, id);
        slot
    }
}

fn insert_sorted_unhandled(store: &IntervalStore, unhandled: &mut Vec<IntervalId>, id: IntervalId) {
    if store.get(id).is_empty() {
        return;
    }
    let from = store.get(id).from().raw();
    let pos = unhandled.partition_point(|&existing| store.get(existing).from().raw() <= from);
    unhandled.insert(pos, id);
}

/// Runs the walk phase over `roots` (one per virtual register) plus `fixed`
/// precolored intervals (one per physical register, covering calls and
/// fixed-register constraints). Mutates `store` in place: splits are
/// inserted as new intervals, and every interval that ends up with a
/// register has `assigned` set; everything else is expected to be read back
/// from its canonical spill slot.
///
/// `block_boundaries` must be sorted ascending; it is consulted, along with
/// `strategy`, only when a blocked-allocation spill decides where within a
/// legal window to place its split (`spec.md` §4.2 "Splitting rules").
pub fn allocate(
    store: &mut IntervalStore,
    regs: &RegisterSet,
    roots: &[IntervalId],
    fixed: &[IntervalId],
    slots: &mut SpillSlots,
    block_boundaries: &[OpId],
    strategy: SplitStrategy,
) {
    let mut unhandled: Vec<IntervalId> = roots.iter().copied().filter(|&id| !store.get(id).is_empty()).collect();
    unhandled.sort_by_key(|&id| store.get(id).from().raw());

    let mut active: Vec<IntervalId> = Vec::new();
    let mut inactive: Vec<IntervalId> = fixed.iter().copied().filter(|&id| !store.get(id).is_empty()).collect();

    while !unhandled.is_empty() {
        let current = unhandled.remove(0);
        let position = store.get(current).from();
        trace!("walk: considering {:?} at {:?}", current, position);

        // Step 1 + 2: active intervals expire to handled, or fall into a
        // lifetime hole and move to inactive.
        let mut still_active = Vec::new();
        for id in active.drain(..) {
            let iv = store.get(id);
            if iv.covers(position) {
                still_active.push(id);
            } else if iv.to().raw() > position.raw() {
                inactive.push(id);
            }
            // else: current range's `to` <= opId -> handled, drop.
        }
        active = still_active;

        // Step 3: inactive intervals whose next range now covers opId are
        // promoted back to active; those fully expired are dropped.
        let mut still_inactive = Vec::new();
        for id in inactive.drain(..) {
            let iv = store.get(id);
            if iv.covers(position) {
                active.push(id);
            } else if iv.to().raw() > position.raw() {
                still_inactive.push(id);
            }
        }
        inactive = still_inactive;

        // Step 4: try to assign a free register, falling back to blocked
        // allocation (spill) if none is free for long enough.
        if !try_allocate_free_reg(store, regs, &active, &inactive, &mut unhandled, current) {
            allocate_blocked(
                store,
                regs,
                &mut active,
                &mut unhandled,
                current,
                slots,
                block_boundaries,
                strategy,
            );
        } else {
            active.push(current);
        }
    }
}

/// `freeUntilPos` per physical register of `current`'s class: `u32::MAX` if
/// nothing of that class currently occupies it, `0` if an active interval
/// occupies it right now, or the opId of the earliest intersection with an
/// inactive interval otherwise.
fn free_until_positions(
    store: &IntervalStore,
    regs: &RegisterSet,
    active: &[IntervalId],
    inactive: &[IntervalId],
    current: IntervalId,
) -> FxHashMap<PReg, u32> {
    let class = store.get(current).reg_class;
    let mut free_until: FxHashMap<PReg, u32> =
        regs.registers(class).iter().map(|&r| (r, u32::MAX)).collect();

    for &id in active {
        let iv = store.get(id);
        if iv.reg_class != class {
            continue;
        }
        if let Some(preg) = iv.assigned {
            free_until.insert(preg, 0);
        }
    }
    for &id in inactive {
        let iv = store.get(id);
        if iv.reg_class != class {
            continue;
        }
        if let Some(preg) = iv.assigned {
            if let Some(at) = iv.intersects(store.get(current)) {
                let slot = free_until.entry(preg).or_insert(u32::MAX);
                *slot = (*slot).min(at.raw());
            }
        }
    }
    free_until
}

fn try_allocate_free_reg(
    store: &mut IntervalStore,
    regs: &RegisterSet,
    active: &[IntervalId],
    inactive: &[IntervalId],
    unhandled: &mut Vec<IntervalId>,
    current: IntervalId,
) -> bool {
    let free_until = free_until_positions(store, regs, active, inactive, current);
    let to = store.get(current).to().raw();
    let from = store.get(current).from().raw();

    // 4a: an interval's register hint, if still free for the whole span.
    if let Some(hint) = store.get(current).hint {
        if free_until.get(&hint).copied().unwrap_or(0) >= to {
            store.get_mut(current).assigned = Some(hint);
            return true;
        }
    }

    // 4b: otherwise the register free for longest.
    let Some((&best, &best_until)) = free_until.iter().max_by_key(|(_, &until)| until) else {
        return false;
    };
    if best_until == 0 {
        return false;
    }

    if best_until >= to {
        // 4c: free for the interval's entire remaining lifetime.
        store.get_mut(current).assigned = Some(best);
        true
    } else if best_until > from {
        // 4d: free for a prefix; split and retry the (unregistered) tail
        // later.
        let split_at = crate::lir::OpId::from_raw(best_until);
        let tail = store.split(current, split_at);
        store.get_mut(current).assigned = Some(best);
        insert_sorted_unhandled(store, unhandled, tail);
        true
    } else {
        // 4e: no usable register at all -> blocked allocation.
        false
    }
}

/// Chooses a concrete split position at or before `limit` -- the opId
/// `current` needs the victim's register by -- per `spec.md` §4.2's
/// splitting preference order: block boundaries first, then positions with
/// no use, then the latest `shouldHaveRegister`. Searching backward from
/// `limit` keeps the victim's register valid for as long as possible while
/// still freeing it in time for `current`. [`SplitStrategy::Earliest`]
/// skips all of this and splits exactly at `limit`.
fn choose_split_position(
    interval: &Interval,
    limit: OpId,
    block_boundaries: &[OpId],
    strategy: SplitStrategy,
) -> OpId {
    if strategy == SplitStrategy::Earliest {
        return limit;
    }

    let lower = interval.from();
    if lower.raw() >= limit.raw() {
        return limit;
    }

    if let Some(&boundary) =
        block_boundaries.iter().rev().find(|&&b| b.raw() <= limit.raw() && b.raw() > lower.raw())
    {
        return boundary;
    }

    // `use_positions` is sorted descending, so forward order already visits
    // the largest `op_id` (closest to `limit`) first.
    for u in &interval.use_positions {
        if u.op_id.raw() > limit.raw() {
            continue;
        }
        if u.op_id.raw() <= lower.raw() {
            break;
        }
        if u.kind == UseKind::NoUse {
            return u.op_id;
        }
    }

    for u in &interval.use_positions {
        if u.op_id.raw() > limit.raw() {
            continue;
        }
        if u.op_id.raw() <= lower.raw() {
            break;
        }
        if u.kind == UseKind::ShouldHaveRegister {
            return u.op_id;
        }
    }

    limit
}

/// `spec.md` §4.2 "Blocked allocation": every active interval of the same
/// class reports the opId of its own next register-requiring use; the
/// register whose occupant's next use is farthest away is freed by
/// splitting and spilling that occupant at the current position, unless
/// `current` itself needs a register sooner than any candidate victim can
/// vacate one, in which case `current` is split and spilled instead.
#[allow(clippy::too_many_arguments)]
fn allocate_blocked(
    store: &mut IntervalStore,
    regs: &RegisterSet,
    active: &mut Vec<IntervalId>,
    unhandled: &mut Vec<IntervalId>,
    current: IntervalId,
    slots: &mut SpillSlots,
    block_boundaries: &[OpId],
    strategy: SplitStrategy,
) {
    let class = store.get(current).reg_class;
    let position = store.get(current).from();

    let mut next_use: FxHashMap<PReg, u32> =
        regs.registers(class).iter().map(|&r| (r, u32::MAX)).collect();
    let mut victim_of: FxHashMap<PReg, IntervalId> = FxHashMap::default();
    for &id in active.iter() {
        let iv = store.get(id);
        if iv.reg_class != class {
            continue;
        }
        if let Some(preg) = iv.assigned {
            let nu = iv.next_use_requiring_register(position).map(|p| p.raw()).unwrap_or(u32::MAX);
            let slot = next_use.entry(preg).or_insert(u32::MAX);
            if nu > *slot || !victim_of.contains_key(&preg) {
                *slot = nu;
                victim_of.insert(preg, id);
            }
        }
    }

    let Some((&best_preg, &best_next_use)) = next_use.iter().max_by_key(|(_, &u)| u) else {
        panic!("no allocatable register of this class exists for {current:?}");
    };

    let current_need =
        store.get(current).next_use_requiring_register(position).map(|p| p.raw()).unwrap_or(u32::MAX);

    if current_need != u32::MAX && current_need < best_next_use {
        // `current` needs a register sooner than the best victim could free
        // one: spill `current` itself instead of evicting anyone.
        ensure_spill_slot(store, current, slots);
        if current_need > position.raw() {
            // Splits exactly at `current`'s own next mandatory use, not at a
            // preferred position: moving the split any later would strand
            // that very `mustHaveRegister` use in the unregistered head.
            let tail = store.split(current, crate::lir::OpId::from_raw(current_need));
            insert_sorted_unhandled(store, unhandled, tail);
        } else {
            panic!(
                "mustHaveRegister use at {current_need} for {current:?} cannot be satisfied or split"
            );
        }
        // `current` itself (the head) stays unassigned -- it lives only in
        // memory from here on.
        return;
    }

    // Evict the victim: split it at (or, per the split-position preference
    // order, at the latest acceptable point no later than) the current
    // position, spill the head, and requeue the tail (still carrying its
    // original use positions, so it will demand a register again at its
    // next mustHaveRegister use).
    let victim = *victim_of
        .get(&best_preg)
        .unwrap_or_else(|| panic!("no victim recorded for chosen register {best_preg:?}"));
    active.retain(|&id| id != victim);
    ensure_spill_slot(store, victim, slots);
    if store.get(victim).covers(position) {
        let at = choose_split_position(store.get(victim), position, block_boundaries, strategy);
        let tail = store.split(victim, at);
        insert_sorted_unhandled(store, unhandled, tail);
    }

    store.get_mut(current).assigned = Some(best_preg);
    active.push(current);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::OpId;
    use crate::operand::{RegClass, VReg};

    fn op(n: u32) -> OpId {
        OpId::from_raw(n)
    }

    #[test]
    fn two_short_intervals_share_nothing_get_distinct_registers() {
        let mut store = IntervalStore::new();
        let a = store.create_root(VReg::new(0), RegClass::Int);
        let b = store.create_root(VReg::new(1), RegClass::Int);
        store.get_mut(a).add_range(op(0), op(4));
        store.get_mut(a).add_use(op(0), UseKind::MustHaveRegister);
        store.get_mut(b).add_range(op(0), op(4));
        store.get_mut(b).add_use(op(0), UseKind::MustHaveRegister);

        let regs = RegisterSet::fixture();
        let mut slots = SpillSlots::new();
        allocate(&mut store, &regs, &[a, b], &[], &mut slots, &[], SplitStrategy::BlockBoundaryFirst);

        assert_ne!(store.get(a).assigned, None);
        assert_ne!(store.get(b).assigned, None);
        assert_ne!(store.get(a).assigned, store.get(b).assigned);
    }

    #[test]
    fn lifetime_hole_reuse_same_hint_gets_same_register() {
        // Two disjoint intervals hinting the same register should receive
        // it, one after the other.
        let mut store = IntervalStore::new();
        let a = store.create_root(VReg::new(0), RegClass::Int);
        let b = store.create_root(VReg::new(1), RegClass::Int);
        store.get_mut(a).add_range(op(0), op(4));
        store.get_mut(a).add_use(op(0), UseKind::MustHaveRegister);
        store.get_mut(a).hint = Some(PReg::new(0));
        store.get_mut(b).add_range(op(4), op(8));
        store.get_mut(b).add_use(op(4), UseKind::MustHaveRegister);
        store.get_mut(b).hint = Some(PReg::new(0));

        let regs = RegisterSet::fixture();
        let mut slots = SpillSlots::new();
        allocate(&mut store, &regs, &[a, b], &[], &mut slots, &[], SplitStrategy::BlockBoundaryFirst);

        assert_eq!(store.get(a).assigned, Some(PReg::new(0)));
        assert_eq!(store.get(b).assigned, Some(PReg::new(0)));
    }

    #[test]
    fn more_live_values_than_registers_forces_a_spill() {
        let mut store = IntervalStore::new();
        let regs = RegisterSet::new().with_class(RegClass::Int, (0..2).map(PReg::new));
        let mut ids = Vec::new();
        for i in 0..3u32 {
            let id = store.create_root(VReg::new(i), RegClass::Int);
            store.get_mut(id).add_range(op(0), op(10));
            store.get_mut(id).add_use(op(0), UseKind::MustHaveRegister);
            store.get_mut(id).add_use(op(8), UseKind::MustHaveRegister);
            ids.push(id);
        }
        let mut slots = SpillSlots::new();
        allocate(&mut store, &regs, &ids, &[], &mut slots, &[], SplitStrategy::BlockBoundaryFirst);

        let spilled = ids.iter().filter(|&&id| store.spill_slot_of(id).is_some()).count();
        assert!(spilled >= 1, "expected at least one interval to be spilled");
        assert!(slots.count() >= 1);
    }

    #[test]
    fn split_position_prefers_block_boundary_over_exact_conflict_point() {
        let mut store = IntervalStore::new();
        let id = store.create_root(VReg::new(0), RegClass::Int);
        store.get_mut(id).add_range(op(0), op(20));
        store.get_mut(id).add_use(op(0), UseKind::MustHaveRegister);
        store.get_mut(id).add_use(op(18), UseKind::MustHaveRegister);

        let boundaries = [op(0), op(10)];
        let at = choose_split_position(store.get(id), op(12), &boundaries, SplitStrategy::BlockBoundaryFirst);
        assert_eq!(at, op(10), "should back up to the nearest preceding block boundary");

        let earliest = choose_split_position(store.get(id), op(12), &boundaries, SplitStrategy::Earliest);
        assert_eq!(earliest, op(12), "Earliest strategy never moves off the exact conflict point");
    }

    #[test]
    fn split_position_falls_back_to_no_use_then_should_have_register() {
        let mut store = IntervalStore::new();
        let id = store.create_root(VReg::new(0), RegClass::Int);
        store.get_mut(id).add_range(op(0), op(20));
        store.get_mut(id).add_use(op(0), UseKind::MustHaveRegister);
        store.get_mut(id).add_use(op(6), UseKind::NoUse);
        store.get_mut(id).add_use(op(9), UseKind::ShouldHaveRegister);

        // No block boundary in range: falls back to the no-use position.
        let at = choose_split_position(store.get(id), op(12), &[], SplitStrategy::BlockBoundaryFirst);
        assert_eq!(at, op(6));

        // Remove the no-use position: falls back to the latest shouldHaveRegister.
        store.get_mut(id).use_positions.retain(|u| u.kind != UseKind::NoUse);
        let at = choose_split_position(store.get(id), op(12), &[], SplitStrategy::BlockBoundaryFirst);
        assert_eq!(at, op(9));
    }
}
