//! The spill-store optimization: a small monotone state machine, one
//! instance per root interval, that decides whether a definition needs a
//! fresh store to the canonical spill slot or can rely on one already
//! emitted by an earlier split sibling.

use crate::regalloc::interval::{IntervalId, IntervalStore, SpillState};

/// Advances the state for `id`'s root by one definition, returning whether
/// the caller must emit a store instruction for this particular
/// definition. States only move forward: `NoSpillSlot -> NoSpillStore ->
/// OneSpillStore -> StoreAtDefinition`, and once at `StoreAtDefinition`
/// every further definition stores (no attempt to re-share).
pub fn record_definition(store: &mut IntervalStore, id: IntervalId) -> bool {
    let root = store.root_of(id);
    let state = store.get(root).spill_state;
    let (next, must_store) = match state {
        SpillState::NoSpillSlot => (SpillState::NoSpillStore, false),
        SpillState::NoSpillStore => (SpillState::OneSpillStore, true),
        SpillState::OneSpillStore => (SpillState::StoreAtDefinition, true),
        SpillState::StoreAtDefinition => (SpillState::StoreAtDefinition, true),
    };
    store.get_mut(root).spill_state = next;
    must_store
}

/// Marks that a canonical spill slot now exists for `id`'s root, without
/// charging a definition against the state machine. No-op if a slot (and
/// therefore a state past `NoSpillSlot`) already exists.
pub fn note_slot_assigned(store: &mut IntervalStore, id: IntervalId) {
    let root = store.root_of(id);
    if store.get(root).spill_state == SpillState::NoSpillSlot {
        store.get_mut(root).spill_state = SpillState::NoSpillStore;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operand::{RegClass, VReg};

    #[test]
    fn first_definition_after_slot_assignment_stores_once() {
        let mut store = IntervalStore::new();
        let root = store.create_root(VReg::new(0), RegClass::Int);
        note_slot_assigned(&mut store, root);
        assert!(record_definition(&mut store, root));
        assert!(record_definition(&mut store, root));
        assert_eq!(store.get(root).spill_state, SpillState::StoreAtDefinition);
    }

    #[test]
    fn no_store_demanded_before_a_slot_exists() {
        let mut store = IntervalStore::new();
        let root = store.create_root(VReg::new(0), RegClass::Int);
        assert!(!record_definition(&mut store, root));
    }
}
