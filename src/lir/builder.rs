//! The LIR builder: a closed set of factory operations that construct
//! operands and append instructions to the current block.

use crate::debuginfo::DebugInfoId;
use crate::lir::block::{Block, BlockId};
use crate::lir::condcodes::IntCc;
use crate::lir::inst::Inst;
use crate::lir::opcode::{CallTarget, FenceKind, MoveKind, Opcode};
use crate::operand::{Kind, Operand};
use cranelift_entity::PrimaryMap;

/// Appends instructions to one block at a time. A higher-IR lowering pass
/// (out of scope) drives one `LirBuilder` per function, switching blocks
/// with [`LirBuilder::switch_to_block`].
pub struct LirBuilder {
    blocks: PrimaryMap<BlockId, Block>,
    current: Option<BlockId>,
}

impl LirBuilder {
    pub fn new() -> Self {
        LirBuilder { blocks: PrimaryMap::new(), current: None }
    }

    pub fn create_block(&mut self) -> BlockId {
        let id = self.blocks.next_key();
        self.blocks.push(Block::new(id));
        id
    }

    pub fn switch_to_block(&mut self, block: BlockId) {
        self.current = Some(block);
    }

    pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
        self.blocks[from].succs.push(to);
        self.blocks[to].preds.push(from);
    }

    fn push(&mut self, inst: Inst) {
        let block = self.current.expect("LirBuilder: no current block");
        self.blocks[block].insts.push(inst);
    }

    pub fn finish(self) -> PrimaryMap<BlockId, Block> {
        self.blocks
    }

    // -- Data movement --

    pub fn mov(&mut self, kind: MoveKind, dst: Operand, src: Operand) {
        self.push(Inst::new(Opcode::Move(kind), dst).with_inputs([src]));
    }

    pub fn lea(&mut self, dst: Operand, addr: Operand) {
        self.push(Inst::new(Opcode::Lea, dst).with_inputs([addr]));
    }

    pub fn object_const(&mut self, dst: Operand, obj: Operand) {
        self.push(Inst::new(Opcode::ObjectConstToReg, dst).with_inputs([obj]));
    }

    pub fn push_value(&mut self, src: Operand) {
        self.push(Inst::new(Opcode::Push, Operand::illegal()).with_inputs([src]));
    }

    pub fn pop_value(&mut self, dst: Operand) {
        self.push(Inst::new(Opcode::Pop, dst));
    }

    // -- Arithmetic / logic (binary ops share one helper) --

    fn binary(&mut self, op: Opcode, dst: Operand, lhs: Operand, rhs: Operand) {
        self.push(Inst::new(op, dst).with_inputs([lhs, rhs]));
    }

    pub fn add(&mut self, dst: Operand, a: Operand, b: Operand) {
        self.binary(Opcode::Add, dst, a, b);
    }
    pub fn sub(&mut self, dst: Operand, a: Operand, b: Operand) {
        self.binary(Opcode::Sub, dst, a, b);
    }
    pub fn mul(&mut self, dst: Operand, a: Operand, b: Operand) {
        self.binary(Opcode::Mul, dst, a, b);
    }
    pub fn div(&mut self, dst: Operand, a: Operand, b: Operand) {
        self.binary(Opcode::Div, dst, a, b);
    }
    pub fn rem(&mut self, dst: Operand, a: Operand, b: Operand) {
        self.binary(Opcode::Rem, dst, a, b);
    }
    pub fn and(&mut self, dst: Operand, a: Operand, b: Operand) {
        self.binary(Opcode::And, dst, a, b);
    }
    pub fn or(&mut self, dst: Operand, a: Operand, b: Operand) {
        self.binary(Opcode::Or, dst, a, b);
    }
    pub fn xor(&mut self, dst: Operand, a: Operand, b: Operand) {
        self.binary(Opcode::Xor, dst, a, b);
    }
    pub fn shl(&mut self, dst: Operand, a: Operand, b: Operand) {
        self.binary(Opcode::Shl, dst, a, b);
    }
    pub fn shr(&mut self, dst: Operand, a: Operand, b: Operand) {
        self.binary(Opcode::Shr, dst, a, b);
    }
    pub fn ushr(&mut self, dst: Operand, a: Operand, b: Operand) {
        self.binary(Opcode::UShr, dst, a, b);
    }

    pub fn neg(&mut self, dst: Operand, src: Operand) {
        self.push(Inst::new(Opcode::Neg, dst).with_inputs([src]));
    }
    pub fn sqrt(&mut self, dst: Operand, src: Operand) {
        self.push(Inst::new(Opcode::Sqrt, dst).with_inputs([src]));
    }
    pub fn abs(&mut self, dst: Operand, src: Operand) {
        self.push(Inst::new(Opcode::Abs, dst).with_inputs([src]));
    }
    pub fn log(&mut self, dst: Operand, src: Operand) {
        self.push(Inst::new(Opcode::Log, dst).with_inputs([src]));
    }
    pub fn sin(&mut self, dst: Operand, src: Operand) {
        self.push(Inst::new(Opcode::Sin, dst).with_inputs([src]));
    }
    pub fn cos(&mut self, dst: Operand, src: Operand) {
        self.push(Inst::new(Opcode::Cos, dst).with_inputs([src]));
    }
    pub fn tan(&mut self, dst: Operand, src: Operand) {
        self.push(Inst::new(Opcode::Tan, dst).with_inputs([src]));
    }

    pub fn float_compare(&mut self, dst: Operand, cond: crate::lir::condcodes::FloatCc, a: Operand, b: Operand) {
        self.binary(Opcode::FloatCompare(cond), dst, a, b);
    }
    pub fn int_compare(&mut self, dst: Operand, cond: IntCc, a: Operand, b: Operand) {
        self.binary(Opcode::IntCompare(cond), dst, a, b);
    }

    // -- Control --

    pub fn branch(&mut self, cond: IntCc, lhs: Operand, rhs: Operand) {
        self.push(Inst::new(Opcode::Branch(cond), Operand::illegal()).with_inputs([lhs, rhs]));
    }

    pub fn jump(&mut self) {
        self.push(Inst::new(Opcode::Jump, Operand::illegal()));
    }

    pub fn table_switch(&mut self, index: Operand) {
        self.push(Inst::new(Opcode::TableSwitch, Operand::illegal()).with_inputs([index]));
    }

    pub fn ret(&mut self, value: Option<Operand>) {
        let mut inst = Inst::new(Opcode::Return, Operand::illegal());
        if let Some(v) = value {
            inst = inst.with_inputs([v]);
        }
        self.push(inst);
    }

    pub fn call_direct(
        &mut self,
        target: CallTarget,
        dst: Operand,
        args: impl IntoIterator<Item = Operand>,
        debug_info: DebugInfoId,
    ) {
        self.push(
            Inst::new(Opcode::CallDirect(target), dst)
                .with_inputs(args)
                .with_debug_info(debug_info),
        );
    }

    pub fn call_indirect(
        &mut self,
        callee: Operand,
        dst: Operand,
        args: impl IntoIterator<Item = Operand>,
        debug_info: DebugInfoId,
    ) {
        let mut inputs = vec![callee];
        inputs.extend(args);
        self.push(
            Inst::new(Opcode::CallIndirect, dst)
                .with_inputs(inputs)
                .with_debug_info(debug_info),
        );
    }

    // -- Memory / atomics --

    pub fn load(&mut self, dst: Operand, addr: Operand) {
        self.push(Inst::new(Opcode::Load, dst).with_inputs([addr]));
    }

    pub fn store(&mut self, kind: MoveKind, addr: Operand, value: Operand) {
        self.push(
            Inst {
                move_kind: Some(kind),
                ..Inst::new(Opcode::Store, Operand::illegal()).with_inputs([addr, value])
            },
        );
    }

    pub fn cmpxchg(&mut self, dst: Operand, addr: Operand, expected: Operand, new: Operand) {
        self.push(Inst::new(Opcode::Cmpxchg, dst).with_inputs([addr, expected, new]));
    }

    pub fn fence(&mut self, kind: FenceKind) {
        self.push(Inst::new(Opcode::Fence(kind), Operand::illegal()));
    }

    // -- Safepoint / polling --

    pub fn safepoint_poll(&mut self, debug_info: DebugInfoId) {
        self.push(
            Inst::new(Opcode::SafepointPoll, Operand::illegal()).with_debug_info(debug_info),
        );
    }

    pub fn null_check(&mut self, value: Operand, debug_info: DebugInfoId) {
        self.push(
            Inst::new(Opcode::NullCheck, Operand::illegal())
                .with_inputs([value])
                .with_debug_info(debug_info),
        );
    }

    pub fn breakpoint(&mut self) {
        self.push(Inst::new(Opcode::Breakpoint, Operand::illegal()));
    }

    // -- Allocation intrinsics --

    pub fn allocate_object(&mut self, dst: Operand, template: Operand, debug_info: DebugInfoId) {
        self.push(
            Inst::new(Opcode::AllocateObject, dst)
                .with_inputs([template])
                .with_debug_info(debug_info),
        );
    }

    pub fn allocate_array(&mut self, dst: Operand, template: Operand, length: Operand, debug_info: DebugInfoId) {
        self.push(
            Inst::new(Opcode::AllocateArray, dst)
                .with_inputs([template, length])
                .with_debug_info(debug_info),
        );
    }

    pub fn monitor_enter(&mut self, obj: Operand, debug_info: DebugInfoId) {
        self.push(
            Inst::new(Opcode::MonitorEnter, Operand::illegal())
                .with_inputs([obj])
                .with_debug_info(debug_info),
        );
    }

    pub fn monitor_exit(&mut self, obj: Operand, debug_info: DebugInfoId) {
        self.push(
            Inst::new(Opcode::MonitorExit, Operand::illegal())
                .with_inputs([obj])
                .with_debug_info(debug_info),
        );
    }

    // -- Type checks --

    pub fn checkcast(&mut self, value: Operand, class: Operand, debug_info: DebugInfoId) {
        self.push(
            Inst::new(Opcode::CheckCast, Operand::illegal())
                .with_inputs([value, class])
                .with_debug_info(debug_info),
        );
    }

    pub fn instance_of(&mut self, dst: Operand, value: Operand, class: Operand) {
        self.push(Inst::new(Opcode::InstanceOf, dst).with_inputs([value, class]));
    }

    pub fn array_store_check(&mut self, array: Operand, value: Operand, debug_info: DebugInfoId) {
        self.push(
            Inst::new(Opcode::ArrayStoreCheck, Operand::illegal())
                .with_inputs([array, value])
                .with_debug_info(debug_info),
        );
    }

    /// Build from a [`Kind`] literal directly (helper for tests/fixtures).
    pub fn illegal_of(kind: Kind) -> Operand {
        Operand { kind, variant: crate::operand::Variant::None }
    }
}

impl Default for LirBuilder {
    fn default() -> Self {
        Self::new()
    }
}
