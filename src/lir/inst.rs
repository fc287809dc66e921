//! LIR instructions and operation-id numbering.

use crate::debuginfo::DebugInfoId;
use crate::lir::opcode::{MoveKind, Opcode};
use crate::operand::Operand;
use core::fmt;
use smallvec::SmallVec;

/// A monotonic position assigned to every LIR instruction in linear-scan
/// order, in increments of two. The gap lets
/// the allocator insert a spill or reload at the odd id between two
/// instructions without renumbering anything. Block boundaries always land
/// on an even id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(u32);

impl OpId {
    pub const INVALID: OpId = OpId(u32::MAX);

    pub fn from_raw(raw: u32) -> Self {
        OpId(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    /// The next instruction's id, in the normal (even) numbering sequence.
    pub fn next_even(self) -> OpId {
        OpId(self.0 + 2)
    }

    /// The id of an inserted spill/reload that must sit strictly between
    /// `self` and `self.next_even()`.
    pub fn odd_successor(self) -> OpId {
        OpId(self.0 + 1)
    }

    pub fn is_even(self) -> bool {
        self.0 % 2 == 0
    }
}

impl fmt::Debug for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == OpId::INVALID {
            write!(f, "op<invalid>")
        } else {
            write!(f, "op{}", self.0)
        }
    }
}

/// The part an operand plays at an instruction, which drives the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandRole {
    /// Written before inputs are re-read; may reuse an input's register once
    /// that input is no longer needed.
    Output,
    /// Read at the instruction; its register must remain valid until the
    /// instruction executes.
    Input,
    /// Scratch space needed only for the duration of the instruction;
    /// never equal to an input or output register.
    Temp,
    /// Live across the instruction without being read or written by it --
    /// therefore cannot share a register with an output.
    AliveThrough,
}

/// One LIR instruction: opcode, result, and role-tagged operand arrays.
#[derive(Debug, Clone)]
pub struct Inst {
    pub opcode: Opcode,
    pub result: Operand,
    pub inputs: SmallVec<[Operand; 4]>,
    pub temps: SmallVec<[Operand; 2]>,
    pub alive_through: SmallVec<[Operand; 2]>,
    pub debug_info: Option<DebugInfoId>,
    pub move_kind: Option<MoveKind>,
    /// Assigned during the allocator's numbering pass;
    /// `OpId::INVALID` before that.
    pub op_id: OpId,
}

impl Inst {
    pub fn new(opcode: Opcode, result: Operand) -> Self {
        let has_call = opcode.has_call();
        let move_kind = match &opcode {
            Opcode::Move(k) => Some(*k),
            _ => None,
        };
        let _ = has_call; // derived on demand via `has_call()`, not stored.
        Inst {
            opcode,
            result,
            inputs: SmallVec::new(),
            temps: SmallVec::new(),
            alive_through: SmallVec::new(),
            debug_info: None,
            move_kind,
            op_id: OpId::INVALID,
        }
    }

    pub fn with_inputs(mut self, inputs: impl IntoIterator<Item = Operand>) -> Self {
        self.inputs.extend(inputs);
        self
    }

    pub fn with_temps(mut self, temps: impl IntoIterator<Item = Operand>) -> Self {
        self.temps.extend(temps);
        self
    }

    pub fn with_alive_through(mut self, vals: impl IntoIterator<Item = Operand>) -> Self {
        self.alive_through.extend(vals);
        self
    }

    pub fn with_debug_info(mut self, info: DebugInfoId) -> Self {
        self.debug_info = Some(info);
        self
    }

    pub fn has_call(&self) -> bool {
        self.opcode.has_call()
    }

    pub fn is_safepoint(&self) -> bool {
        self.opcode.is_safepoint()
    }

    /// Iterate over every register-bearing operand along with its role, in
    /// a stable order (output, inputs, temps, alive-through). Used
    /// uniformly by liveness computation, the emitter's reference-map
    /// verifier, and register-rewriting after allocation, replacing a
    /// visitor-style per-opcode dispatch.
    pub fn operands_with_roles(&self) -> impl Iterator<Item = (OperandRole, &Operand)> {
        std::iter::once((OperandRole::Output, &self.result))
            .filter(|(_, op)| !op.is_illegal())
            .chain(self.inputs.iter().map(|op| (OperandRole::Input, op)))
            .chain(self.temps.iter().map(|op| (OperandRole::Temp, op)))
            .chain(
                self.alive_through
                    .iter()
                    .map(|op| (OperandRole::AliveThrough, op)),
            )
    }

    pub fn operands_with_roles_mut(&mut self) -> impl Iterator<Item = (OperandRole, &mut Operand)> {
        let result_illegal = self.result.is_illegal();
        std::iter::once((OperandRole::Output, &mut self.result))
            .filter(move |_| !result_illegal)
            .chain(self.inputs.iter_mut().map(|op| (OperandRole::Input, op)))
            .chain(self.temps.iter_mut().map(|op| (OperandRole::Temp, op)))
            .chain(
                self.alive_through
                    .iter_mut()
                    .map(|op| (OperandRole::AliveThrough, op)),
            )
    }
}
