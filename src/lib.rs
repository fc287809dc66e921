//! Optimized code-generation pipeline for a managed, object-oriented bytecode VM.
//!
//! This crate covers the part of an optimizing JIT that sits between the
//! high-level IR (out of scope; see [`collab`]) and running machine code: a
//! low-level instruction representation ([`lir`]), a linear-scan register
//! allocator ([`regalloc`]), frame layout ([`framemap`]), a code emitter
//! ([`emit`]), calling-convention adapter stubs ([`adapter`]), and the
//! deoptimizer that reconstructs baseline frames from optimized ones
//! ([`deopt`]).
//!
//! The front-end bytecode parser, the high-level IR and its optimizations,
//! the garbage collector, the class loader, and the inspector are external
//! collaborators and are represented here only by the narrow trait seams
//! they call through ([`collab`]).

pub mod adapter;
pub mod collab;
pub mod concurrency;
pub mod context;
pub mod debuginfo;
pub mod deopt;
pub mod emit;
pub mod error;
pub mod framemap;
pub mod isa;
pub mod lir;
pub mod operand;
pub mod regalloc;
pub mod settings;
pub mod target_method;

pub use crate::context::CompilerContext;
pub use crate::error::{CodegenError, CodegenResult};
pub use crate::operand::Operand;
pub use crate::target_method::TargetMethod;

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Number of bytes in one frame slot / machine word on the target this crate
/// is compiled for. The core algorithms (interval bookkeeping, frame
/// layout) are word-size generic; only [`emit`] and [`adapter`] bake in an
/// actual encoding.
pub const WORD_SIZE: u32 = 8;
