//! Resolution: after the walk phase assigns locations, insert moves at
//! block edges where a live value's physical location differs across the
//! edge.
//!
//! The move-ordering half of this is a textbook parallel-move algorithm:
//! emit any move whose destination is not read by another pending move
//! first, and break a cycle (a ring of movements with no safe starting
//! point) by diverting one leg through a scratch location.

use crate::operand::Operand;
use smallvec::SmallVec;

/// Orders an unordered set of `(dst, src)` moves into a safe sequence,
/// breaking any register-cycle through `scratch`.
pub fn order_parallel_moves(moves: &[(Operand, Operand)], scratch: Operand) -> Vec<(Operand, Operand)> {
    let mut pending: Vec<(Operand, Operand)> = moves.iter().filter(|(dst, src)| dst != src).cloned().collect();
    let mut result = Vec::with_capacity(pending.len());

    while !pending.is_empty() {
        if let Some(i) = pending.iter().position(|(dst, _)| !pending.iter().any(|(_, src)| src == dst)) {
            result.push(pending.remove(i));
            continue;
        }
        // Every remaining move is part of a cycle: pick the first, divert
        // its value through `scratch`, and rewrite anyone waiting to read
        // the old destination to read `scratch` instead. The diverted move
        // itself is requeued so its value eventually lands in its real
        // destination.
        let (dst0, src0) = pending.remove(0);
        result.push((scratch, src0));
        for (_, src) in pending.iter_mut() {
            if *src == dst0 {
                *src = scratch;
            }
        }
        pending.push((dst0, scratch));
    }
    result
}

/// One live value's locations on either side of a CFG edge, as seen by
/// [`edge_moves`].
pub struct EdgeValue {
    pub pred_loc: Operand,
    pub succ_loc: Operand,
}

/// Computes the move set needed to resolve one CFG edge: for every value
/// live at the successor's entry, a move from its predecessor-side location
/// to its successor-side location, skipping values already in place.
pub fn edge_moves(values: &[EdgeValue]) -> SmallVec<[(Operand, Operand); 8]> {
    values
        .iter()
        .filter(|v| v.pred_loc != v.succ_loc)
        .map(|v| (v.succ_loc, v.pred_loc))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operand::{Kind, PReg};

    fn preg(n: u32) -> Operand {
        Operand::physical_reg(PReg::new(n as usize), Kind::Int32)
    }

    #[test]
    fn independent_moves_need_no_reordering_help() {
        let moves = vec![(preg(0), preg(1)), (preg(2), preg(3))];
        let scratch = preg(9);
        let ordered = order_parallel_moves(&moves, scratch);
        assert_eq!(ordered.len(), 2);
    }

    #[test]
    fn a_two_cycle_is_broken_through_scratch() {
        // r0 <- r1, r1 <- r0: a true swap, unsafe to do directly in either
        // order without clobbering one side first.
        let moves = vec![(preg(0), preg(1)), (preg(1), preg(0))];
        let scratch = preg(9);
        let ordered = order_parallel_moves(&moves, scratch);

        // Simulate executing the ordered moves against a little register
        // file and check the end state is the swap, not a clobber.
        use std::collections::HashMap;
        let mut regs: HashMap<Operand, &str> = HashMap::new();
        regs.insert(preg(0), "A");
        regs.insert(preg(1), "B");
        for (dst, src) in &ordered {
            let v = *regs.get(src).unwrap();
            regs.insert(*dst, v);
        }
        assert_eq!(*regs.get(&preg(0)).unwrap(), "B");
        assert_eq!(*regs.get(&preg(1)).unwrap(), "A");
    }

    #[test]
    fn moves_already_in_place_are_skipped() {
        let values = vec![
            EdgeValue { pred_loc: preg(0), succ_loc: preg(0) },
            EdgeValue { pred_loc: preg(1), succ_loc: preg(2) },
        ];
        let moves = edge_moves(&values);
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0], (preg(2), preg(1)));
    }
}
