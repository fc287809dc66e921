//! Narrow seams for the external collaborators that `spec.md` §1 explicitly
//! excludes: the bytecode parser, the high-level IR, the garbage collector,
//! and the baseline (template) compiler. Only the slice of each that the
//! in-scope components must call through is modeled here -- these traits
//! exist so the allocator, emitter, adapter generator, and deoptimizer have
//! something concrete to compile and test against, not to reimplement the
//! excluded subsystems (`SPEC_FULL.md` §4.7).

use crate::debuginfo::MethodId;
use crate::lir::BlockGraph;
use crate::operand::Kind;

/// Supplies the LIR boundary described in `spec.md` §6: a block graph
/// already in linear-scan and code-emission order. Stands in for the
/// higher-IR lowering pass.
pub trait LirSource {
    fn block_graph(&self) -> &BlockGraph;
}

/// The minimal GC-facing surface needed to decide whether a `Kind` must be
/// tracked in reference maps. The collection algorithm itself is a
/// non-goal.
pub trait GcCollaborator {
    fn is_reference_kind(&self, kind: Kind) -> bool {
        kind.is_reference()
    }

    /// Rematerialize a scalar-replaced/escape-analyzed object during
    /// deoptimization reconstruction. Returns the new object's reference, to be placed
    /// in the reconstructed frame slot that named the virtual object. The
    /// allocation algorithm itself is a non-goal; this is the narrow call
    /// this crate must make into it.
    fn materialize_virtual_object(&self, template_id: u32, field_words: &[u64]) -> u64 {
        let _ = (template_id, field_words);
        0
    }
}

/// Default collaborator using the built-in notion of "reference kind".
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultGc;
impl GcCollaborator for DefaultGc {}

/// Layout of one baseline (interpreter/template-compiled) frame at a given
/// bci, as the baseline compiler would report it. Used by the deoptimizer's
/// reconstruction phase and by the adapter generator
/// to know where baseline-convention arguments live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaselineFrameLayout {
    /// Total frame size in words, including the operand stack depth live at
    /// this bci.
    pub frame_words: u32,
    /// Number of argument slots, in baseline (all-on-stack, category-1-sized)
    /// convention.
    pub arg_slots: u32,
}

/// The narrow slice of the template compiler's calling-convention interface
/// that this crate depends on.
pub trait BaselineCompiler {
    /// Compile (or fetch an already-compiled) baseline entry point for
    /// `method`, and report the frame layout active at `bci`.
    fn compile_for_bci(&self, method: MethodId, bci: u32) -> BaselineFrameLayout;

    /// The baseline program-counter corresponding to `bci` in the compiled
    /// entry for `method`, used to compute the deoptimizer's destination IP.
    fn baseline_pc_for_bci(&self, method: MethodId, bci: u32) -> u64;
}

/// A trivial fixed-size-frame baseline stand-in, useful for tests: every bci
/// maps to a frame of `frame_words` and a pc derived from `bci` alone.
#[derive(Debug, Clone, Copy)]
pub struct FixedBaseline {
    pub frame_words: u32,
    pub arg_slots: u32,
    pub code_base: u64,
}

impl BaselineCompiler for FixedBaseline {
    fn compile_for_bci(&self, _method: MethodId, _bci: u32) -> BaselineFrameLayout {
        BaselineFrameLayout { frame_words: self.frame_words, arg_slots: self.arg_slots }
    }

    fn baseline_pc_for_bci(&self, _method: MethodId, bci: u32) -> u64 {
        self.code_base + (bci as u64) * 4
    }
}
