//! The code emitter: walks allocated LIR in code-emission
//! order and lowers it through the fixed-width vehicle encoder in [`isa`]
//! into a [`TargetMethod`].
//!
//! Branch relaxation is not needed here -- every encoded instruction in
//! [`isa`] is a fixed 8 bytes, so a taken-branch target is always known in
//! one forward-sizing pass over the block order, before any byte is
//! written. What *is* needed is the same trick the teacher's own branch
//! layout pass uses for an unconditional fallthrough that isn't next in
//! final order: rewrite `brz L` as `brnz L'; jump L` where `L'` is the next
//! block (see `cranelift-codegen/src/binemit/relaxation.rs`'s module doc).
//! [`Opcode::Branch`] only carries the taken edge as an operand-free
//! condition; the not-taken edge is `block.succs[1]`, so this pass inserts
//! a synthetic [`Opcode::Jump`]-equivalent whenever that edge doesn't fall
//! through for free.

use crate::debuginfo::CiDebugInfo;
use crate::error::{CodegenError, CodegenResult};
use crate::framemap::FrameMap;
use crate::isa::{self, Tag};
use crate::lir::block::{BlockGraph, BlockId};
use crate::lir::inst::Inst;
use crate::lir::opcode::{FenceKind, Opcode};
use crate::operand::{StackSlotRef, Variant};
use crate::regalloc::{self, RegallocOutput, RegisterSet};
use crate::settings::Settings;
use crate::target_method::{CallSite, CallingConvention, ExceptionEntry, SafepointEntry, TargetMethod};
use log::{debug, trace};
use rustc_hash::FxHashMap;

/// Upper bound on the number of blocks one method may address by label.
/// Generous but finite, so `spec.md` §7's `LabelSpaceExhausted` has a
/// concrete trigger rather than being unreachable dead code.
pub const MAX_LABELS: usize = 1 << 20;

/// Byte alignment applied to a block whose `align` flag is set. A multiple
/// of [`isa::INSTR_LEN`] so alignment padding is always a whole number of
/// encoded instructions.
const BLOCK_ALIGN_BYTES: u32 = 16;

/// A resolved call site for `Opcode::CallNative`, reported alongside the
/// direct-call fixup table embedded in the returned [`TargetMethod`] so a
/// caller can patch in the real native entry point. Same shape as
/// [`CallSite`], keyed by name instead of a [`crate::lir::CallTarget`] id
/// since native entry points are resolved by symbol, not by method table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeCallSite {
    pub code_offset: u32,
    pub name: &'static str,
}

fn align_up(offset: u32, align: u32) -> u32 {
    offset.div_ceil(align) * align
}

/// One item of the per-block emission plan: either a real LIR instruction,
/// or a synthetic bridging jump inserted because a conditional branch's
/// not-taken edge doesn't fall through to the next block in emission order.
enum PlanOp<'a> {
    Inst(&'a Inst),
    BridgeJump(BlockId),
}

/// Whether `inst` lowers to one isa instruction or more. A `Move` between
/// two stack slots has no single-instruction encoding in [`isa`] (there is
/// no memory-to-memory move tag); the emitter routes it through a scratch
/// register with two instructions, mirroring the same
/// load-then-store-through-scratch shape `regalloc::resolve`'s parallel-move
/// algorithm already uses for register cycles. A `Return` lowers to an
/// epilogue (`Leave`) followed by the `Return` instruction itself.
fn inst_word_count(inst: &Inst) -> u32 {
    match &inst.opcode {
        Opcode::Move(_) if is_mem_to_mem(inst) => 2,
        Opcode::Return => 2,
        _ => 1,
    }
}

fn is_mem_to_mem(inst: &Inst) -> bool {
    let dst_is_stack = matches!(inst.result.variant, Variant::Stack(_));
    let src_is_stack = inst.inputs.first().map(|o| matches!(o.variant, Variant::Stack(_))).unwrap_or(false);
    dst_is_stack && src_is_stack
}

fn build_plan(graph: &BlockGraph) -> Vec<(BlockId, Vec<PlanOp<'_>>)> {
    let order = &graph.code_emission_order;
    let mut plan = Vec::with_capacity(order.len());
    for (i, &block_id) in order.iter().enumerate() {
        let block = &graph.blocks[block_id];
        let mut ops: Vec<PlanOp> = block.insts.iter().map(PlanOp::Inst).collect();
        if let Some(last) = block.insts.last() {
            if matches!(last.opcode, Opcode::Branch(_)) {
                if let Some(&not_taken) = block.succs.get(1) {
                    let next_in_order = order.get(i + 1).copied();
                    if Some(not_taken) != next_in_order {
                        ops.push(PlanOp::BridgeJump(not_taken));
                    }
                }
            }
        }
        plan.push((block_id, ops));
    }
    plan
}

fn plan_word_count(op: &PlanOp<'_>) -> u32 {
    match op {
        PlanOp::Inst(inst) => inst_word_count(inst),
        PlanOp::BridgeJump(_) => 1,
    }
}

/// First pass: walk the plan purely to size it, assigning every block a
/// concrete start offset. No bytes are written -- this is what lets the
/// second pass bake resolved branch targets directly into the instruction
/// stream instead of patching them in afterward.
fn compute_block_offsets(
    graph: &BlockGraph,
    plan: &[(BlockId, Vec<PlanOp<'_>>)],
    prologue_bytes: u32,
) -> FxHashMap<BlockId, u32> {
    let mut offsets = FxHashMap::default();
    let mut offset = prologue_bytes;
    for (block_id, ops) in plan {
        if graph.blocks[*block_id].align {
            offset = align_up(offset, BLOCK_ALIGN_BYTES);
        }
        offsets.insert(*block_id, offset);
        for op in ops {
            offset += plan_word_count(op) * isa::INSTR_LEN as u32;
        }
    }
    offsets
}

fn stack_byte_offset(frame: &FrameMap, slot: &StackSlotRef) -> u32 {
    match slot {
        StackSlotRef::Local(s) => FrameMap::byte_offset(frame.spill_slot_word(*s)) as u32,
        // The caller's outgoing-argument area is addressed relative to this
        // frame's incoming-argument boundary; `spec.md` leaves the exact
        // addressing mode to the target, so this vehicle just scales the
        // index by the word size (documented as a scoping simplification in
        // DESIGN.md).
        StackSlotRef::CallerArg(i) => i * crate::WORD_SIZE,
    }
}

/// Emits `graph` -- already allocated: every operand is physical, spill
/// stores already inserted by `regalloc::run` -- into a [`TargetMethod`].
///
/// `handler_blocks` maps a bytecode index to the [`BlockId`] of its handler
/// entry, used to resolve each safepoint's `exception_handler_bci` (named
/// only in the *innermost* virtual frame, per `spec.md` §3) to a concrete
/// code offset. Each such safepoint contributes one single-instruction-wide
/// [`ExceptionEntry`]; a real implementation would instead track the full
/// range of a try-region, which is out of scope here since LIR carries no
/// explicit region markers (documented in `DESIGN.md`).
pub fn emit(
    graph: &BlockGraph,
    regalloc_out: &RegallocOutput,
    regs: &RegisterSet,
    frame: &FrameMap,
    calling_convention: CallingConvention,
    prologue_len: u32,
    handler_blocks: &FxHashMap<u32, BlockId>,
    settings: &Settings,
) -> CodegenResult<(TargetMethod, Vec<NativeCallSite>)> {
    if graph.blocks.len() > MAX_LABELS {
        return Err(CodegenError::LabelSpaceExhausted);
    }

    let plan = build_plan(graph);
    let prologue_bytes = isa::INSTR_LEN as u32;
    let block_offsets = compute_block_offsets(graph, &plan, prologue_bytes);
    debug!("emit: laid out {} blocks, frame size {} bytes", plan.len(), frame.frame_size_bytes());

    let mut code = Vec::new();
    isa::emit(&mut code, Tag::Enter, frame.frame_size_bytes());

    let mut call_sites = Vec::new();
    let mut native_calls = Vec::new();
    let mut safepoints = Vec::new();
    let mut debug_info_pool: Vec<CiDebugInfo> = Vec::new();
    let mut exception_table = Vec::new();

    for (block_id, ops) in &plan {
        let target_off = block_offsets[block_id];
        while (code.len() as u32) < target_off {
            isa::emit(&mut code, Tag::Nop, 0);
        }
        debug_assert_eq!(code.len() as u32, target_off);

        for op in ops {
            match op {
                PlanOp::BridgeJump(target) => {
                    isa::emit(&mut code, Tag::Jump, block_offsets[target]);
                }
                PlanOp::Inst(inst) => {
                    emit_one(&mut code, *block_id, inst, graph, frame, &block_offsets, &mut call_sites, &mut native_calls);
                }
            }
        }
    }

    // Safepoints are recorded in a second walk over the already-emitted
    // code so each one's offset can be taken from the real instruction
    // start rather than threaded out of `emit_one`.
    record_safepoints(
        &plan,
        &block_offsets,
        regalloc_out,
        regs,
        frame,
        handler_blocks,
        &mut safepoints,
        &mut debug_info_pool,
        &mut exception_table,
    );

    if settings.verify_refmaps {
        verify_reference_maps(&debug_info_pool, regs, frame);
    }

    let method = TargetMethod::new(
        code,
        safepoints,
        debug_info_pool,
        call_sites,
        exception_table,
        frame.frame_size_bytes(),
        calling_convention,
        prologue_len,
    );
    Ok((method, native_calls))
}

#[allow(clippy::too_many_arguments)]
fn emit_one(
    code: &mut Vec<u8>,
    block_id: BlockId,
    inst: &Inst,
    graph: &BlockGraph,
    frame: &FrameMap,
    block_offsets: &FxHashMap<BlockId, u32>,
    call_sites: &mut Vec<CallSite>,
    native_calls: &mut Vec<NativeCallSite>,
) {
    match &inst.opcode {
        Opcode::Move(_) => emit_move(code, inst, frame),
        Opcode::Branch(_cond) => {
            let taken = graph.blocks[block_id].succs[0];
            isa::emit(code, Tag::BranchCond, block_offsets[&taken]);
        }
        Opcode::Jump => {
            let taken = graph.blocks[block_id].succs[0];
            isa::emit(code, Tag::Jump, block_offsets[&taken]);
        }
        Opcode::Return => {
            isa::emit(code, Tag::Leave, frame.frame_size_bytes());
            isa::emit(code, Tag::Return, 0);
        }
        Opcode::CallDirect(target) => {
            let off = isa::emit(code, Tag::CallDirect, target.0);
            call_sites.push(CallSite { code_offset: off, callee: *target });
        }
        Opcode::CallIndirect => {
            isa::emit(code, Tag::CallIndirect, 0);
        }
        Opcode::CallNative(name) => {
            let off = isa::emit(code, Tag::CallIndirect, 0);
            native_calls.push(NativeCallSite { code_offset: off, name });
        }
        Opcode::SafepointPoll => {
            isa::emit(code, Tag::SafepointPoll, 0);
        }
        Opcode::Fence(kind) => {
            let payload = match kind {
                FenceKind::Acquire => 0,
                FenceKind::Release => 1,
                FenceKind::Full => 2,
            };
            isa::emit(code, Tag::Op, payload);
        }
        _ => {
            isa::emit(code, Tag::Op, 0);
        }
    }
}

fn emit_move(code: &mut Vec<u8>, inst: &Inst, frame: &FrameMap) {
    let src = inst.inputs.first();
    match (&inst.result.variant, src.map(|s| &s.variant)) {
        (Variant::Physical(_), Some(Variant::Physical(_))) | (Variant::Physical(_), Some(Variant::Const(_))) => {
            isa::emit(code, Tag::MoveRegReg, 0);
        }
        (Variant::Physical(_), Some(Variant::Stack(slot))) => {
            isa::emit(code, Tag::MoveRegMem, stack_byte_offset(frame, slot));
        }
        (Variant::Stack(slot), Some(Variant::Physical(_))) => {
            isa::emit(code, Tag::MoveMemReg, stack_byte_offset(frame, slot));
        }
        (Variant::Stack(dst_slot), Some(Variant::Stack(src_slot))) => {
            // No memory-to-memory move tag exists; route through a scratch
            // register with a load then a store, same shape as
            // `regalloc::resolve::order_parallel_moves`'s scratch-register
            // cycle break.
            isa::emit(code, Tag::MoveRegMem, stack_byte_offset(frame, src_slot));
            isa::emit(code, Tag::MoveMemReg, stack_byte_offset(frame, dst_slot));
        }
        _ => {
            isa::emit(code, Tag::MoveRegReg, 0);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn record_safepoints(
    plan: &[(BlockId, Vec<PlanOp<'_>>)],
    block_offsets: &FxHashMap<BlockId, u32>,
    regalloc_out: &RegallocOutput,
    regs: &RegisterSet,
    frame: &FrameMap,
    handler_blocks: &FxHashMap<u32, BlockId>,
    safepoints: &mut Vec<SafepointEntry>,
    debug_info_pool: &mut Vec<CiDebugInfo>,
    exception_table: &mut Vec<ExceptionEntry>,
) {
    let register_count = regs.total_register_slots();
    let frame_ref_bits = frame.ref_map_bits();

    for (block_id, ops) in plan {
        let mut offset = block_offsets[block_id];
        for op in ops {
            match op {
                PlanOp::BridgeJump(_) => {
                    offset += isa::INSTR_LEN as u32;
                }
                PlanOp::Inst(inst) => {
                    if inst.is_safepoint() {
                        if let Some(debug_id) = inst.debug_info {
                            let refs = regalloc_out.safepoint_refs.get(&inst.op_id);
                            let resolved = regalloc_out.resolved_debug_info.get(&debug_id).cloned().unwrap_or_default();
                            let exception_handler_bci = resolved.exception_handler_bci;
                            let chain = resolved.chain;
                            let cidebug = regalloc::finalize_debug_info(
                                refs,
                                register_count,
                                frame_ref_bits,
                                chain,
                                exception_handler_bci,
                            );
                            let debug_info_index = debug_info_pool.len() as u32;
                            trace!("emit: safepoint at {offset} -> debug info #{debug_info_index}");
                            debug_info_pool.push(cidebug);
                            safepoints.push(SafepointEntry { code_offset: offset, debug_info_index });

                            if let Some(bci) = exception_handler_bci {
                                if let Some(&handler_block) = handler_blocks.get(&bci) {
                                    let handler_off = block_offsets[&handler_block];
                                    exception_table.push(ExceptionEntry {
                                        start: offset,
                                        end: offset + isa::INSTR_LEN as u32,
                                        handler: handler_off,
                                    });
                                }
                            }
                        }
                    }
                    offset += inst_word_count(inst) * isa::INSTR_LEN as u32;
                }
            }
        }
    }
}

/// `spec.md` §4.4: "disabled in release". A lightweight sanity pass over
/// the finished debug-info pool, gated by [`Settings::verify_refmaps`]
/// rather than `cfg!(debug_assertions)` alone so tests can force it on.
fn verify_reference_maps(pool: &[CiDebugInfo], regs: &RegisterSet, frame: &FrameMap) {
    let register_count = regs.total_register_slots();
    let frame_bits = frame.ref_map_bits();
    for info in pool {
        assert_eq!(info.register_ref_map.len(), register_count);
        assert_eq!(info.frame_ref_map.len(), frame_bits);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debuginfo::DebugInfo;
    use crate::lir::condcodes::IntCc;
    use crate::lir::{CallTarget, LirBuilder, MoveKind};
    use crate::operand::{ConstantValue, Kind, Operand, VReg};
    use crate::regalloc::RegisterSet;

    fn run_pipeline(
        graph: &mut BlockGraph,
        debug_info_in: &FxHashMap<crate::debuginfo::DebugInfoId, DebugInfo>,
    ) -> (RegallocOutput, RegisterSet, FrameMap) {
        graph.compute_orders().unwrap();
        let regs = RegisterSet::fixture();
        let out = regalloc::run(graph, &regs, debug_info_in, &Settings::for_tests());
        let frame = FrameMap::new(0, 0, 0, out.spill_words, FrameMap::DEFAULT_STACK_ALIGN_BYTES);
        (out, regs, frame)
    }

    #[test]
    fn every_instruction_offset_stays_word_aligned() {
        let mut b = LirBuilder::new();
        let entry = b.create_block();
        b.switch_to_block(entry);
        let v0 = Operand::virtual_reg(VReg::new(0), Kind::Int32);
        b.mov(MoveKind::Normal, v0, Operand::constant(ConstantValue::I32(1)));
        b.ret(Some(v0));
        let mut graph = BlockGraph::new(entry, b.finish());
        let (out, regs, frame) = run_pipeline(&mut graph, &FxHashMap::default());

        let handler_blocks = FxHashMap::default();
        let (method, natives) = emit(
            &graph,
            &out,
            &regs,
            &frame,
            CallingConvention::Optimized,
            isa::INSTR_LEN as u32,
            &handler_blocks,
            &Settings::for_tests(),
        )
        .unwrap();
        assert!(natives.is_empty());
        assert_eq!(method.code.len() % isa::INSTR_LEN, 0);
    }

    #[test]
    fn direct_call_site_is_word_aligned_and_recorded() {
        let mut b = LirBuilder::new();
        let entry = b.create_block();
        b.switch_to_block(entry);
        b.call_direct(
            CallTarget(7),
            Operand::illegal(),
            Vec::<Operand>::new(),
            crate::debuginfo::DebugInfoId::new(0),
        );
        b.ret(None);
        let mut graph = BlockGraph::new(entry, b.finish());
        let (out, regs, frame) = run_pipeline(&mut graph, &FxHashMap::default());

        let handler_blocks = FxHashMap::default();
        let (method, _) = emit(
            &graph,
            &out,
            &regs,
            &frame,
            CallingConvention::Optimized,
            isa::INSTR_LEN as u32,
            &handler_blocks,
            &Settings::for_tests(),
        )
        .unwrap();

        assert_eq!(method.call_sites.len(), 1);
        let site = method.call_sites[0];
        assert_eq!(site.callee, CallTarget(7));
        assert_eq!(site.code_offset % 4, 0, "direct-call displacement must be word-aligned");
        assert_eq!(isa::tag_at(&method.code, site.code_offset), Tag::CallDirect);
    }

    #[test]
    fn a_not_taken_branch_edge_gets_a_bridging_jump() {
        let mut b = LirBuilder::new();
        let entry = b.create_block();
        let taken = b.create_block();
        let not_taken = b.create_block();
        b.add_edge(entry, taken);
        b.add_edge(entry, not_taken);

        let v0 = Operand::virtual_reg(VReg::new(0), Kind::Int32);
        b.switch_to_block(entry);
        b.mov(MoveKind::Normal, v0, Operand::constant(ConstantValue::I32(0)));
        b.branch(IntCc::Equal, v0, v0);

        b.switch_to_block(taken);
        b.ret(None);

        b.switch_to_block(not_taken);
        b.ret(None);

        let mut graph = BlockGraph::new(entry, b.finish());
        graph.compute_orders().unwrap();
        // Force `taken` immediately after `entry` in final order, so the
        // not-taken edge (`succs[1]`) can't fall through for free and the
        // bridge-jump path is exercised deterministically.
        graph.code_emission_order = vec![entry, taken, not_taken];
        let regs = RegisterSet::fixture();
        let out = regalloc::run(&mut graph, &regs, &FxHashMap::default(), &Settings::for_tests());
        let frame = FrameMap::new(0, 0, 0, out.spill_words, FrameMap::DEFAULT_STACK_ALIGN_BYTES);

        let handler_blocks = FxHashMap::default();
        let (method, _) = emit(
            &graph,
            &out,
            &regs,
            &frame,
            CallingConvention::Optimized,
            isa::INSTR_LEN as u32,
            &handler_blocks,
            &Settings::for_tests(),
        )
        .unwrap();

        // Prologue + mov + branch + bridge jump + 2x(leave, return) = 8 words.
        assert_eq!(method.code.len(), isa::INSTR_LEN * 8);
    }

    #[test]
    fn a_safepoint_records_a_reference_map_sized_debug_info() {
        let mut b = LirBuilder::new();
        let entry = b.create_block();
        b.switch_to_block(entry);
        let v_obj = Operand::virtual_reg(VReg::new(0), Kind::Object);
        b.mov(MoveKind::Normal, v_obj, Operand::constant(ConstantValue::Object(1)));
        b.call_direct(
            CallTarget(0),
            Operand::illegal(),
            Vec::<Operand>::new(),
            crate::debuginfo::DebugInfoId::new(0),
        );
        b.null_check(v_obj, crate::debuginfo::DebugInfoId::new(1));
        b.ret(None);

        let mut graph = BlockGraph::new(entry, b.finish());
        let (out, regs, frame) = run_pipeline(&mut graph, &FxHashMap::default());

        let handler_blocks = FxHashMap::default();
        let (method, _) = emit(
            &graph,
            &out,
            &regs,
            &frame,
            CallingConvention::Optimized,
            isa::INSTR_LEN as u32,
            &handler_blocks,
            &Settings::for_tests(),
        )
        .unwrap();

        assert!(!method.safepoints.is_empty());
        let has_live_ref = method
            .debug_info_pool
            .iter()
            .any(|d| d.register_ref_map.any_set() || d.frame_ref_map.any_set());
        assert!(has_live_ref, "the live object should show up in some safepoint's reference map");
    }

    #[test]
    fn too_many_blocks_is_reported_not_panicked() {
        use crate::lir::block::Block;
        use cranelift_entity::PrimaryMap;

        let mut blocks = PrimaryMap::new();
        for i in 0..(MAX_LABELS + 1) {
            blocks.push(Block::new(BlockId::new(i)));
        }
        let graph = BlockGraph::new(BlockId::new(0), blocks);

        let regalloc_out = RegallocOutput {
            spill_words: 0,
            safepoint_refs: FxHashMap::default(),
            resolved_debug_info: FxHashMap::default(),
        };
        let regs = RegisterSet::fixture();
        let frame = FrameMap::new(0, 0, 0, 0, FrameMap::DEFAULT_STACK_ALIGN_BYTES);
        let handler_blocks = FxHashMap::default();

        let result = emit(
            &graph,
            &regalloc_out,
            &regs,
            &frame,
            CallingConvention::Optimized,
            isa::INSTR_LEN as u32,
            &handler_blocks,
            &Settings::for_tests(),
        );
        assert_eq!(result.unwrap_err(), CodegenError::LabelSpaceExhausted);
    }
}
