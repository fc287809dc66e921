//! Recoverable error types.
//!
//! Only a narrow set of failures are recoverable: a
//! compilation can fail with a typed error without corrupting the method's
//! existing (interpreted or previously compiled) entry point. Everything
//! else -- a `mustHaveRegister` use that cannot be satisfied, malformed
//! safepoint debug info, recursive compilation of one method on one thread --
//! is a fatal invariant violation and is reported with `panic!`/`unreachable!`
//! instead, not through this type.
//!
//! This crate keeps this error enum hand-rolled rather than depending on
//! `thiserror`, matching the core codegen crate this one is modeled on,
//! which hand-rolls its own `CodegenError`/`CodegenResult` pair rather than
//! pulling in an error-derive crate; higher-level crates that consume
//! compiled output are free to wrap these in `thiserror` or `anyhow`
//! themselves.

use core::fmt;

/// Result alias used throughout the crate for recoverable failures.
pub type CodegenResult<T> = Result<T, CodegenError>;

/// A recoverable compilation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodegenError {
    /// The LIR builder was asked to construct an instruction this backend
    /// does not support (e.g. an intrinsic with no lowering on this target).
    Unsupported(&'static str),

    /// The input block graph is not reducible -- it has a loop with more
    /// than one entry edge. Reducible input is required; malformed
    /// graphs are reported here rather than panicking, since they originate
    /// from the (out of scope, externally supplied) higher-IR lowering and
    /// are not a codegen-internal invariant violation.
    Irreducible,

    /// The code buffer ran out of room to represent a branch target as
    /// either a short or long-form displacement, and label space was
    /// exhausted. This can legitimately be retried with a larger initial
    /// buffer, so it is recoverable.
    LabelSpaceExhausted,

    /// An adapter was requested for a calling-convention signature this
    /// generator does not know how to bridge (e.g. a value category with no
    /// defined baseline-slot encoding).
    UnsupportedAdapterSignature,
}

impl fmt::Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodegenError::Unsupported(what) => write!(f, "unsupported operation: {what}"),
            CodegenError::Irreducible => write!(f, "input block graph is not reducible"),
            CodegenError::LabelSpaceExhausted => {
                write!(f, "exhausted label space while emitting code")
            }
            CodegenError::UnsupportedAdapterSignature => {
                write!(f, "no adapter available for this calling-convention signature")
            }
        }
    }
}

impl std::error::Error for CodegenError {}
