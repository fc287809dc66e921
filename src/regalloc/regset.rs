//! The machine's allocatable physical registers, grouped by class.

use crate::operand::{PReg, RegClass};
use cranelift_entity::EntityRef;
use rustc_hash::FxHashMap;

/// The pool of physical registers the walk phase may hand out, split by
/// register class. Callee-saved vs. caller-saved status is not tracked
/// here: the frame map's callee-saved spill area is sized from whichever
/// registers the walk actually assigns, after the fact.
#[derive(Debug, Clone, Default)]
pub struct RegisterSet {
    by_class: FxHashMap<RegClass, Vec<PReg>>,
}

impl RegisterSet {
    pub fn new() -> Self {
        RegisterSet { by_class: FxHashMap::default() }
    }

    pub fn with_class(mut self, class: RegClass, regs: impl IntoIterator<Item = PReg>) -> Self {
        self.by_class.insert(class, regs.into_iter().collect());
        self
    }

    pub fn registers(&self, class: RegClass) -> &[PReg] {
        self.by_class.get(&class).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// A small fixture register set, useful for tests: 4 integer and 4
    /// float registers, numbered from 0 within each class.
    pub fn fixture() -> Self {
        RegisterSet::new()
            .with_class(RegClass::Int, (0..4).map(PReg::new))
            .with_class(RegClass::Float, (4..8).map(PReg::new))
    }

    /// One past the highest [`PReg`] index handed out across every class --
    /// the slot count a register reference map needs to cover every
    /// register this set can ever assign.
    pub fn total_register_slots(&self) -> usize {
        self.by_class.values().flatten().map(|p| p.index() + 1).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixture_has_disjoint_classes() {
        let regs = RegisterSet::fixture();
        assert_eq!(regs.registers(RegClass::Int).len(), 4);
        assert_eq!(regs.registers(RegClass::Float).len(), 4);
    }
}
