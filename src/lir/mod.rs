//! The low-level instruction representation (LIR): a flat per-block
//! sequence of machine-close instructions with input/output/temp/
//! alive-through operand roles.

pub mod block;
pub mod builder;
pub mod condcodes;
pub mod inst;
pub mod opcode;

pub use block::{Block, BlockGraph, BlockId, LoopFlags};
pub use builder::LirBuilder;
pub use inst::{Inst, OpId, OperandRole};
pub use opcode::{CallTarget, FenceKind, MoveKind, Opcode};
