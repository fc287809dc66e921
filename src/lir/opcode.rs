//! LIR opcodes.
//!
//! Deep class hierarchies for LIR opcodes collapse into a single tagged
//! sum with a uniform operand-roles array; dispatch becomes a match on the
//! tag instead of a visitor hierarchy. [`Opcode`] is that tagged sum; the
//! operand roles live on [`super::inst::Inst`], uniformly, regardless of
//! opcode.

use crate::lir::condcodes::{FloatCc, IntCc};

/// How a `move` must behave with respect to concurrent observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MoveKind {
    /// No ordering requirements beyond normal program order.
    Normal,
    /// Must act as acquire (if a load) or release (if a store) with respect
    /// to reference kinds.
    Volatile,
    /// Permits byte-granularity access; used for sub-word field writes.
    Unaligned,
}

/// A memory fence's ordering domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FenceKind {
    Acquire,
    Release,
    Full,
}

/// One of a closed set of machine-close operations. Every variant that
/// reads or writes operands does so through the uniform role arrays on
/// [`super::inst::Inst`] -- the opcode itself carries only the information
/// that can't be expressed as an operand (condition codes, fence kind, call
/// target descriptor, move kind).
#[derive(Debug, Clone, PartialEq)]
pub enum Opcode {
    // -- Data movement --
    Move(MoveKind),
    Lea,
    ObjectConstToReg,
    Push,
    Pop,

    // -- Arithmetic / logic --
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Neg,
    Shl,
    Shr,
    UShr,
    Sqrt,
    Abs,
    Log,
    Sin,
    Cos,
    Tan,
    FloatCompare(FloatCc),
    IntCompare(IntCc),

    // -- Control --
    Branch(IntCc),
    Jump,
    TableSwitch,
    Return,
    CallDirect(CallTarget),
    CallIndirect,
    CallNative(&'static str),

    // -- Memory / atomics --
    Load,
    Store,
    Cmpxchg,
    Fence(FenceKind),

    // -- Safepoint / polling --
    SafepointPoll,
    NullCheck,
    Breakpoint,

    // -- Allocation intrinsics --
    AllocateObject,
    AllocateArray,
    MonitorEnter,
    MonitorExit,

    // -- Type checks --
    CheckCast,
    InstanceOf,
    ArrayStoreCheck,
}

/// A resolved direct-call target. Carries enough identity for the emitter to
/// register a fixup-table entry without needing to know how symbols are resolved at link time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallTarget(pub u32);

impl Opcode {
    /// Whether this instruction may clobber caller-saved registers,
    /// i.e. `hasCall` from `spec.md` §3/§4.1. Calls, native calls, and
    /// allocation/monitor intrinsics (which may call into the runtime) all
    /// set this.
    pub fn has_call(&self) -> bool {
        matches!(
            self,
            Opcode::CallDirect(_)
                | Opcode::CallIndirect
                | Opcode::CallNative(_)
                | Opcode::AllocateObject
                | Opcode::AllocateArray
                | Opcode::MonitorEnter
                | Opcode::MonitorExit
        )
    }

    /// Whether this instruction is a safepoint: a position where the
    /// running thread can be stopped and its state precisely described.
    /// Calls, allocations, monitor ops, and explicit polls all are; so is
    /// an explicit null-check, since it may trap.
    pub fn is_safepoint(&self) -> bool {
        self.has_call() || matches!(self, Opcode::SafepointPoll | Opcode::NullCheck)
    }

    /// Whether this instruction is itself a control-flow terminator that
    /// ends a block.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Opcode::Branch(_) | Opcode::Jump | Opcode::TableSwitch | Opcode::Return
        )
    }

    /// Whether the `input_index`'th input operand may be satisfied directly
    /// from a spill slot instead of a register -- i.e. whether this
    /// instruction has a legal memory-operand encoding for that input.
    /// Commutative two-operand ALU ops support one memory source operand in
    /// their two-operand encoding, always the second (right-hand) input;
    /// every other opcode (address computation, calls, shifts by a count,
    /// compares whose flags feed a branch) requires its inputs in
    /// registers. Drives `spec.md` §4.2's "inputs → mustHaveRegister or
    /// shouldHaveRegister depending on addressing legality".
    pub fn allows_memory_operand_at(&self, input_index: usize) -> bool {
        input_index == 1
            && matches!(
                self,
                Opcode::Add
                    | Opcode::Sub
                    | Opcode::And
                    | Opcode::Or
                    | Opcode::Xor
                    | Opcode::IntCompare(_)
                    | Opcode::FloatCompare(_)
            )
    }
}
