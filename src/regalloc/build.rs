//! The build phase: number every instruction, compute per-block liveness,
//! and turn that into live intervals with use positions.

use crate::lir::block::{Block, BlockGraph, BlockId};
use crate::lir::inst::{OpId, OperandRole};
use crate::operand::{Kind, VReg};
use crate::regalloc::interval::{IntervalId, IntervalStore, UseKind};
use rustc_hash::{FxHashMap, FxHashSet};

/// Assigns an ascending, evenly-spaced opId to every instruction in
/// `linear_scan_order`, leaving the odd slot after each one free for a
/// spill or reload the walk phase inserts later.
pub fn number_instructions(graph: &mut BlockGraph) {
    let mut next = OpId::from_raw(0);
    for &block_id in &graph.linear_scan_order.clone() {
        for inst in graph.blocks[block_id].insts.iter_mut() {
            inst.op_id = next;
            next = next.next_even();
        }
    }
}

/// Per-block live-in/live-out vreg sets, plus a map from root vreg to the
/// interval id built for it.
pub struct Liveness {
    pub live_in: FxHashMap<BlockId, FxHashSet<VReg>>,
    pub live_out: FxHashMap<BlockId, FxHashSet<VReg>>,
}

fn def_use_sets(block: &Block) -> (FxHashSet<VReg>, FxHashSet<VReg>) {
    let mut def = FxHashSet::default();
    let mut used_before_def = FxHashSet::default();
    for inst in &block.insts {
        for (role, operand) in inst.operands_with_roles() {
            let Some(vreg) = operand.as_virtual() else { continue };
            match role {
                OperandRole::Input | OperandRole::AliveThrough => {
                    if !def.contains(&vreg) {
                        used_before_def.insert(vreg);
                    }
                }
                OperandRole::Output => {
                    def.insert(vreg);
                }
                OperandRole::Temp => {}
            }
        }
    }
    (used_before_def, def)
}

/// Classic backward dataflow fixpoint: `live_in(b) = use(b) ∪ (live_out(b)
/// \ def(b))`, `live_out(b) = ∪ live_in(succ)`. Converges in one pass over
/// a reducible graph processed in reverse linear-scan order, repeated until
/// stable (loop back-edges need the extra passes).
pub fn compute_liveness(graph: &BlockGraph) -> Liveness {
    let uses_defs: FxHashMap<BlockId, (FxHashSet<VReg>, FxHashSet<VReg>)> = graph
        .linear_scan_order
        .iter()
        .map(|&b| (b, def_use_sets(&graph.blocks[b])))
        .collect();

    let mut live_in: FxHashMap<BlockId, FxHashSet<VReg>> =
        graph.linear_scan_order.iter().map(|&b| (b, FxHashSet::default())).collect();
    let mut live_out: FxHashMap<BlockId, FxHashSet<VReg>> =
        graph.linear_scan_order.iter().map(|&b| (b, FxHashSet::default())).collect();

    let mut changed = true;
    while changed {
        changed = false;
        for &block_id in graph.linear_scan_order.iter().rev() {
            let mut out = FxHashSet::default();
            for &succ in &graph.blocks[block_id].succs {
                out.extend(live_in[&succ].iter().copied());
            }
            let (use_set, def_set) = &uses_defs[&block_id];
            let mut new_in = use_set.clone();
            new_in.extend(out.iter().filter(|v| !def_set.contains(v)).copied());

            if new_in != live_in[&block_id] {
                live_in.insert(block_id, new_in);
                changed = true;
            }
            if out != live_out[&block_id] {
                live_out.insert(block_id, out);
                changed = true;
            }
        }
    }
    Liveness { live_in, live_out }
}

/// Builds one interval per distinct virtual register, covering every range
/// and use position implied by the given liveness, and returns the store, a
/// lookup from vreg to its root interval, and each vreg's [`Kind`] (needed
/// later to tell reference-kind locations apart for the reference map).
pub fn build_intervals(
    graph: &BlockGraph,
    liveness: &Liveness,
) -> (IntervalStore, FxHashMap<VReg, IntervalId>, FxHashMap<VReg, Kind>) {
    let mut store = IntervalStore::new();
    let mut roots: FxHashMap<VReg, IntervalId> = FxHashMap::default();
    let mut kind_of: FxHashMap<VReg, Kind> = FxHashMap::default();

    for &block_id in &graph.linear_scan_order {
        for inst in &graph.blocks[block_id].insts {
            for (_, operand) in inst.operands_with_roles() {
                if let Some(vreg) = operand.as_virtual() {
                    kind_of.entry(vreg).or_insert(operand.kind);
                }
            }
        }
    }

    let root_for = |store: &mut IntervalStore, roots: &mut FxHashMap<VReg, IntervalId>, vreg: VReg| -> IntervalId {
        *roots.entry(vreg).or_insert_with(|| {
            let reg_class = kind_of.get(&vreg).and_then(|k| k.reg_class()).unwrap_or(crate::operand::RegClass::Int);
            store.create_root(vreg, reg_class)
        })
    };

    // Call-crossing op ids, and every (interval, op_id) that is a def
    // (`mustHaveRegister` outputs are never softened, even for a value
    // that is later spilled across a call).
    let mut call_op_ids: Vec<OpId> = Vec::new();
    let mut def_positions: FxHashSet<(IntervalId, OpId)> = FxHashSet::default();

    for &block_id in &graph.linear_scan_order {
        let block = &graph.blocks[block_id];
        let Some(first_op) = block.insts.first().map(|i| i.op_id) else { continue };
        let last_op = block.insts.last().map(|i| i.op_id).unwrap_or(first_op);
        let block_end = last_op.odd_successor();

        let mut live_to: FxHashMap<VReg, OpId> = FxHashMap::default();
        for &vreg in &liveness.live_out[&block_id] {
            live_to.insert(vreg, block_end);
        }

        for inst in block.insts.iter().rev() {
            let op_id = inst.op_id;
            if inst.has_call() {
                call_op_ids.push(op_id);
            }

            if let Some(vreg) = inst.result.as_virtual() {
                let id = root_for(&mut store, &mut roots, vreg);
                let to = live_to.remove(&vreg).unwrap_or_else(|| op_id.odd_successor());
                store.get_mut(id).add_range(op_id, to);
                store.get_mut(id).add_use(op_id, UseKind::MustHaveRegister);
                def_positions.insert((id, op_id));
            }

            for (index, operand) in inst.inputs.iter().enumerate() {
                let Some(vreg) = operand.as_virtual() else { continue };
                let id = root_for(&mut store, &mut roots, vreg);
                live_to.entry(vreg).or_insert_with(|| op_id.odd_successor());
                let kind = if inst.opcode.allows_memory_operand_at(index) {
                    UseKind::ShouldHaveRegister
                } else {
                    UseKind::MustHaveRegister
                };
                store.get_mut(id).add_use(op_id, kind);
            }

            for operand in &inst.temps {
                let Some(vreg) = operand.as_virtual() else { continue };
                let id = root_for(&mut store, &mut roots, vreg);
                store.get_mut(id).add_range(op_id, op_id.odd_successor());
                store.get_mut(id).add_use(op_id, UseKind::MustHaveRegister);
                def_positions.insert((id, op_id));
            }

            for operand in &inst.alive_through {
                let Some(vreg) = operand.as_virtual() else { continue };
                let id = root_for(&mut store, &mut roots, vreg);
                live_to.entry(vreg).or_insert_with(|| op_id.odd_successor());
                store.get_mut(id).add_use(op_id, UseKind::NoUse);
            }
        }

        for (vreg, to) in live_to.drain() {
            let id = root_for(&mut store, &mut roots, vreg);
            store.get_mut(id).add_range(first_op, to);
        }

        if block.loop_flags.is_loop_end {
            for &vreg in &liveness.live_out[&block_id] {
                let id = root_for(&mut store, &mut roots, vreg);
                store.get_mut(id).add_use(last_op, UseKind::LoopEndMarker);
            }
        }
    }

    // `spec.md` §4.2: "values live across calls → shouldHaveRegister only
    // at their uses, never across". A value whose live range spans a call
    // is a cheap spill candidate (it must either sit in a callee-saved
    // register or be reloaded after the call anyway), so every use of it
    // that is not itself a def is softened from `mustHaveRegister` to
    // `shouldHaveRegister`.
    let crossed: Vec<IntervalId> = store
        .iter()
        .filter(|(_, interval)| call_op_ids.iter().any(|&c| interval.covers(c)))
        .map(|(id, _)| id)
        .collect();
    for id in crossed {
        let def_at = |op_id: OpId| def_positions.contains(&(id, op_id));
        let interval = store.get_mut(id);
        for u in interval.use_positions.iter_mut() {
            if u.kind == UseKind::MustHaveRegister && !def_at(u.op_id) {
                u.kind = UseKind::ShouldHaveRegister;
            }
        }
    }

    (store, roots, kind_of)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::{LirBuilder, Opcode};
    use crate::lir::condcodes::IntCc;
    use crate::operand::{Kind, Operand};

    #[test]
    fn value_defined_before_loop_and_used_after_stays_live_through() {
        let mut b = LirBuilder::new();
        let entry = b.create_block();
        let header = b.create_block();
        let exit = b.create_block();
        b.add_edge(entry, header);
        b.add_edge(header, header);
        b.add_edge(header, exit);

        let v0 = Operand::virtual_reg(VReg::new(0), Kind::Int32);
        let v1 = Operand::virtual_reg(VReg::new(1), Kind::Int32);

        b.switch_to_block(entry);
        b.mov(crate::lir::MoveKind::Normal, v0, Operand::constant(crate::operand::ConstantValue::I32(1)));
        b.jump();

        b.switch_to_block(header);
        b.add(v1, v0, v0);
        b.branch(IntCc::Equal, v1, v1);

        b.switch_to_block(exit);
        b.ret(Some(v0));

        let blocks = b.finish();
        let mut graph = BlockGraph::new(entry, blocks);
        graph.compute_orders().unwrap();
        number_instructions(&mut graph);
        let liveness = compute_liveness(&graph);
        let (store, roots, _kinds) = build_intervals(&graph, &liveness);

        let root0 = roots[&VReg::new(0)];
        let interval = store.get(root0);
        assert!(interval.to().raw() >= interval.from().raw());
        assert!(!interval.is_empty());
        let _ = Opcode::Jump;
    }
}
