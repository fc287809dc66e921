//! Live intervals: per-virtual-register (or per-split-child) sets of live
//! ranges and use positions, numbered in the opId space built during the
//! liveness pass.

use crate::lir::OpId;
use crate::operand::{FrameSlot, PReg, RegClass, VReg};
use cranelift_entity::{entity_impl, PrimaryMap, ReservedValue};

/// Identifies one interval (a whole vreg's lifetime, or one split child of
/// it) in the arena owned by [`IntervalStore`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IntervalId(u32);
entity_impl!(IntervalId, "ival");

/// How strongly a use position needs a register, from weakest to strongest.
/// `NoUse` marks a position the interval merely spans (e.g. a call-killed
/// range kept alive only because it is read again after the call);
/// `LoopEndMarker` is a synthetic position inserted at the last instruction
/// of a loop body so that splitting never leaves a hole inside the loop.
#[derive(Clone, Copy, PartialEq, Eq, Debug, PartialOrd, Ord)]
pub enum UseKind {
    NoUse,
    LoopEndMarker,
    ShouldHaveRegister,
    MustHaveRegister,
}

impl UseKind {
    pub fn requires_register(self) -> bool {
        matches!(self, UseKind::ShouldHaveRegister | UseKind::MustHaveRegister)
    }
}

/// A use of an interval's value at a specific opId.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UsePosition {
    pub op_id: OpId,
    pub kind: UseKind,
}

/// A half-open `[from, to)` span of opIds during which an interval holds a
/// live value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Range {
    pub from: OpId,
    pub to: OpId,
}

impl Range {
    pub fn contains(&self, op_id: OpId) -> bool {
        op_id.raw() >= self.from.raw() && op_id.raw() < self.to.raw()
    }

    pub fn intersects(&self, other: &Range) -> bool {
        self.from.raw() < other.to.raw() && other.from.raw() < self.to.raw()
    }
}

/// Monotone state of the "avoid redundant spill stores" optimization: once
/// an interval has been stored to its canonical spill slot, every later
/// split child of the same original vreg can skip re-storing an
/// unmodified value. States only move forward (never backward) as the
/// walk processes splits in opId order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpillState {
    /// No spill slot has been assigned yet.
    NoSpillSlot,
    /// A canonical spill slot exists but nothing has been stored to it.
    NoSpillStore,
    /// Exactly one store has been emitted; further splits can reuse it
    /// as long as the value is not redefined.
    OneSpillStore,
    /// More than one definition site exists; fall back to storing at
    /// every definition (no sharing).
    StoreAtDefinition,
}

/// One live interval: either a whole virtual register (a root, `parent ==
/// None`) or a split child produced by the walk phase.
#[derive(Clone, Debug)]
pub struct Interval {
    pub id: IntervalId,
    pub vreg: VReg,
    pub reg_class: RegClass,
    /// Sorted, non-overlapping, ascending by `from`.
    pub ranges: Vec<Range>,
    /// Sorted strictly descending by `op_id` (`spec.md` §3): the walk
    /// processes uses back-to-front from the end of an interval, so storing
    /// them in that order lets `next_use_after` and
    /// `next_use_requiring_register` return on the first drop below `from`
    /// instead of scanning the whole vector.
    pub use_positions: Vec<UsePosition>,
    pub assigned: Option<PReg>,
    /// The canonical stack slot shared by a root interval and all its
    /// split children.
    pub spill_slot: Option<FrameSlot>,
    pub parent: Option<IntervalId>,
    pub children: Vec<IntervalId>,
    pub spill_state: SpillState,
    /// A preferred physical register, propagated from a move or a call's
    /// fixed-register constraint, used to break free-register ties.
    pub hint: Option<PReg>,
    /// True for a precolored interval representing a physical register's
    /// own occupancy (e.g. "busy across this call"), as opposed to a
    /// virtual register's lifetime. `spec.md` §3: "A fixed (precolored)
    /// interval has no virtual use positions."
    pub is_fixed: bool,
    /// Meaningful only on a root interval (`parent.is_none()`): every split
    /// descendant, including the root itself, in no particular order except
    /// that a recent lookup hit is moved to the front.
    pub flat_members: Vec<IntervalId>,
}

impl Interval {
    fn new_root(id: IntervalId, vreg: VReg, reg_class: RegClass) -> Self {
        Interval {
            id,
            vreg,
            reg_class,
            ranges: Vec::new(),
            use_positions: Vec::new(),
            assigned: None,
            spill_slot: None,
            parent: None,
            children: Vec::new(),
            spill_state: SpillState::NoSpillSlot,
            hint: None,
            is_fixed: false,
            flat_members: vec![id],
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn from(&self) -> OpId {
        self.ranges.first().map(|r| r.from).unwrap_or(OpId::INVALID)
    }

    pub fn to(&self) -> OpId {
        self.ranges.last().map(|r| r.to).unwrap_or(OpId::INVALID)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn covers(&self, op_id: OpId) -> bool {
        self.ranges.iter().any(|r| r.contains(op_id))
    }

    pub fn intersects(&self, other: &Interval) -> Option<OpId> {
        for a in &self.ranges {
            for b in &other.ranges {
                if a.intersects(b) {
                    return Some(OpId::from_raw(a.from.raw().max(b.from.raw())));
                }
            }
        }
        None
    }

    /// First use position at or after `from` that requires a register, if
    /// any. Drives both "farthest next use" spill selection and split
    /// placement.
    ///
    /// `use_positions` is sorted strictly descending, so every entry at or
    /// after `from` forms a prefix; this walks that prefix front-to-back
    /// (largest `op_id` first) and keeps the last qualifying entry seen,
    /// which is the smallest (i.e. nearest) one, stopping as soon as an
    /// entry drops below `from`.
    pub fn next_use_requiring_register(&self, from: OpId) -> Option<OpId> {
        let mut nearest = None;
        for u in &self.use_positions {
            if u.op_id.raw() < from.raw() {
                break;
            }
            if u.kind.requires_register() {
                nearest = Some(u.op_id);
            }
        }
        nearest
    }

    pub fn next_use_after(&self, from: OpId) -> Option<OpId> {
        let mut nearest = None;
        for u in &self.use_positions {
            if u.op_id.raw() < from.raw() {
                break;
            }
            nearest = Some(u.op_id);
        }
        nearest
    }

    pub fn add_range(&mut self, from: OpId, to: OpId) {
        self.ranges.push(Range { from, to });
        self.ranges.sort_by_key(|r| r.from.raw());
    }

    pub fn add_use(&mut self, op_id: OpId, kind: UseKind) {
        self.use_positions.push(UsePosition { op_id, kind });
        self.use_positions.sort_by_key(|u| std::cmp::Reverse(u.op_id.raw()));
    }
}

/// Arena owning every root and split-child interval created during
/// allocation, keyed by [`IntervalId`].
#[derive(Default)]
pub struct IntervalStore {
    intervals: PrimaryMap<IntervalId, Interval>,
}

impl IntervalStore {
    pub fn new() -> Self {
        IntervalStore { intervals: PrimaryMap::new() }
    }

    pub fn create_root(&mut self, vreg: VReg, reg_class: RegClass) -> IntervalId {
        let id = self.intervals.next_key();
        self.intervals.push(Interval::new_root(id, vreg, reg_class));
        id
    }

    /// A precolored interval for one physical register's own occupancy --
    /// used to mark it busy across calls and fixed-register constraints.
    pub fn create_fixed(&mut self, preg: PReg, reg_class: RegClass) -> IntervalId {
        let id = self.intervals.next_key();
        let mut iv = Interval::new_root(id, VReg::reserved_value(), reg_class);
        iv.is_fixed = true;
        iv.assigned = Some(preg);
        self.intervals.push(iv);
        id
    }

    pub fn get(&self, id: IntervalId) -> &Interval {
        &self.intervals[id]
    }

    pub fn get_mut(&mut self, id: IntervalId) -> &mut Interval {
        &mut self.intervals[id]
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (IntervalId, &Interval)> {
        self.intervals.iter()
    }

    /// Canonical root of whatever split chain `id` belongs to, walking
    /// `parent` links to the top.
    pub fn root_of(&self, mut id: IntervalId) -> IntervalId {
        while let Some(p) = self.intervals[id].parent {
            id = p;
        }
        id
    }

    /// Records the canonical spill slot on the root of `id`'s split chain,
    /// so every sibling split child shares one stack location.
    pub fn assign_spill_slot(&mut self, id: IntervalId, slot: FrameSlot) {
        let root = self.root_of(id);
        self.intervals[root].spill_slot = Some(slot);
        self.intervals[id].spill_slot = Some(slot);
    }

    /// The canonical spill slot for `id`'s split chain, if one has been
    /// assigned yet.
    pub fn spill_slot_of(&self, id: IntervalId) -> Option<FrameSlot> {
        self.intervals[self.root_of(id)].spill_slot
    }

    /// Split `id` at `at`: the tail (`[at, to)` plus any use positions at or
    /// after `at`) moves to a newly created child interval, which inherits
    /// the root's vreg, reg class, and canonical spill slot. Returns the new
    /// child's id. `at` must fall strictly inside the interval's span.
    pub fn split(&mut self, id: IntervalId, at: OpId) -> IntervalId {
        let root = self.root_of(id);
        let (vreg, reg_class, spill_slot, hint) = {
            let parent = &self.intervals[id];
            (parent.vreg, parent.reg_class, self.intervals[root].spill_slot, parent.hint)
        };

        let mut tail_ranges = Vec::new();
        let mut head_ranges = Vec::new();
        for r in self.intervals[id].ranges.drain(..) {
            if r.to.raw() <= at.raw() {
                head_ranges.push(r);
            } else if r.from.raw() >= at.raw() {
                tail_ranges.push(r);
            } else {
                head_ranges.push(Range { from: r.from, to: at });
                tail_ranges.push(Range { from: at, to: r.to });
            }
        }
        self.intervals[id].ranges = head_ranges;

        let mut tail_uses = Vec::new();
        let mut head_uses = Vec::new();
        for u in self.intervals[id].use_positions.drain(..) {
            if u.op_id.raw() >= at.raw() {
                tail_uses.push(u);
            } else {
                head_uses.push(u);
            }
        }
        self.intervals[id].use_positions = head_uses;

        let child_id = self.intervals.next_key();
        let mut child = Interval::new_root(child_id, vreg, reg_class);
        child.ranges = tail_ranges;
        child.use_positions = tail_uses;
        child.spill_slot = spill_slot;
        child.parent = Some(id);
        child.hint = hint;
        child.flat_members.clear();
        self.intervals.push(child);
        self.intervals[id].children.push(child_id);
        self.intervals[root].flat_members.push(child_id);
        child_id
    }

    /// Find whichever member of `id`'s split chain currently covers `op_id`,
    /// moving it to the front of the root's flat member list on a hit.
    /// Returns `None` if no split child covers `op_id` at all -- the
    /// interval was not live there.
    pub fn find_covering(&mut self, id: IntervalId, op_id: OpId) -> Option<IntervalId> {
        let root = self.root_of(id);
        let pos = self.intervals[root]
            .flat_members
            .iter()
            .position(|&member| self.intervals[member].covers(op_id))?;
        let hit = self.intervals[root].flat_members[pos];
        if pos != 0 {
            let m = self.intervals[root].flat_members.remove(pos);
            self.intervals[root].flat_members.insert(0, m);
        }
        Some(hit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operand::RegClass;

    fn op(n: u32) -> OpId {
        OpId::from_raw(n)
    }

    #[test]
    fn split_moves_tail_ranges_and_uses() {
        let mut store = IntervalStore::new();
        let root = store.create_root(VReg::new(0), RegClass::Int);
        store.get_mut(root).add_range(op(0), op(20));
        store.get_mut(root).add_use(op(2), UseKind::MustHaveRegister);
        store.get_mut(root).add_use(op(16), UseKind::MustHaveRegister);

        let child = store.split(root, op(10));
        assert_eq!(store.get(root).ranges, vec![Range { from: op(0), to: op(10) }]);
        assert_eq!(store.get(child).ranges, vec![Range { from: op(10), to: op(20) }]);
        assert_eq!(store.get(root).use_positions.len(), 1);
        assert_eq!(store.get(child).use_positions.len(), 1);
        assert_eq!(store.root_of(child), root);
    }

    #[test]
    fn intersects_reports_earliest_overlap() {
        let mut store = IntervalStore::new();
        let a = store.create_root(VReg::new(0), RegClass::Int);
        let b = store.create_root(VReg::new(1), RegClass::Int);
        store.get_mut(a).add_range(op(0), op(10));
        store.get_mut(b).add_range(op(5), op(15));
        let (a, b) = (store.get(a).clone(), store.get(b).clone());
        assert_eq!(a.intersects(&b), Some(op(5)));
    }
}
