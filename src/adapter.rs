//! The calling-convention adapter generator: builds the
//! small bridge stubs that let optimized code call baseline code and vice
//! versa, without either side needing to know about the other's frame
//! layout.
//!
//! Adapters are cached by signature and shared across every call site that
//! needs the same bridge ; [`AdapterCache`]
//! is that cache, reached through [`crate::context::CompilerContext`] rather
//! than as a global.

use crate::collab::GcCollaborator;
use crate::debuginfo::RefBitmap;
use crate::isa::{self, Tag};
use crate::operand::Kind;
use crate::WORD_SIZE;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Which direction a calling-convention bridge crosses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterDirection {
    /// Baseline (interpreter/template-compiled) code calling into optimized
    /// code.
    BaselineToOptimized,
    /// Optimized code calling into baseline code -- taken whenever a callee
    /// has not (yet, or ever) been optimized.
    OptimizedToBaseline,
}

/// The calling-convention shape one adapter bridges: argument kinds in
/// declaration order, plus which direction. Two calls with the same
/// signature and direction always share one cached adapter, since the
/// bridge code depends on nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub arg_kinds: Vec<Kind>,
    pub direction: AdapterDirection,
}

/// Geometry of one adapter's own stack frame, established only between its
/// prologue and epilogue:
///
/// ```text
/// [callerReturnAddress]      <- sp on entry, not part of this frame
/// [body-entry address]
/// [saved caller frame ptr]
/// [argument slot N]
/// ...
/// [argument slot 0]          <- sp once the frame is established
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterFrameLayout {
    /// Total words pushed by the adapter: one per argument, plus the
    /// body-entry-address slot, plus the saved frame pointer.
    pub frame_words: u32,
    /// `spec.md` §4.5: "a single word's reference map uses the scalar
    /// bitmap layout directly; larger frames fall back to the frame map's
    /// byte-array encoding" -- both representable as one [`RefBitmap`], with
    /// bit `i` set iff argument slot `i` holds a reference.
    pub ref_bits: RefBitmap,
}

impl AdapterFrameLayout {
    fn arg_slot_word(&self, arg_index: u32) -> u32 {
        assert!(arg_index < self.ref_bits.len() as u32, "argument index out of range");
        arg_index
    }
}

/// A generated, immutable adapter: its machine code plus the frame geometry
/// a stack walker needs to cross it.
#[derive(Debug, Clone)]
pub struct AdapterStub {
    pub code: Vec<u8>,
    pub frame: AdapterFrameLayout,
}

impl AdapterStub {
    /// Byte offset of this stub's `Return` instruction -- the second
    /// prologue-boundary the stack walker checks for.
    fn return_offset(&self) -> u32 {
        (self.code.len() - isa::INSTR_LEN) as u32
    }
}

/// Builds one adapter stub for `sig`, using `gc` to decide which argument
/// slots must be tracked as references.
///
/// The bridge itself is schematic -- this crate names no real ISA  -- but it follows the fixed shape every real adapter of
/// this kind takes: push the caller's frame pointer and a return-through
/// address, copy each argument into its slot, make one indirect call to the
/// callee's actual entry point, tear the frame back down, and return.
pub fn build_adapter(sig: &Signature, gc: &dyn GcCollaborator) -> AdapterStub {
    let n_args = sig.arg_kinds.len() as u32;
    let frame_words = n_args + 2;
    let mut ref_bits = RefBitmap::new(n_args as usize);
    for (i, &kind) in sig.arg_kinds.iter().enumerate() {
        if gc.is_reference_kind(kind) {
            ref_bits.set(i);
        }
    }

    let mut code = Vec::with_capacity((n_args as usize + 4) * isa::INSTR_LEN);
    isa::emit(&mut code, Tag::Enter, frame_words);
    for i in 0..n_args {
        isa::emit(&mut code, Tag::MoveMemReg, i);
    }
    isa::emit(&mut code, Tag::CallIndirect, sig.direction as u32);
    isa::emit(&mut code, Tag::Leave, frame_words);
    isa::emit(&mut code, Tag::Return, 0);

    AdapterStub { code, frame: AdapterFrameLayout { frame_words, ref_bits } }
}

/// The process-wide cache of published adapters.
#[derive(Default)]
pub struct AdapterCache {
    stubs: Mutex<HashMap<Signature, Arc<AdapterStub>>>,
}

impl AdapterCache {
    pub fn new() -> Self {
        AdapterCache { stubs: Mutex::new(HashMap::new()) }
    }

    /// Returns the cached stub for `sig`, building and publishing one with
    /// `build` if this is the first request for it. `build` runs under the
    /// cache's lock, so two threads racing to request the same never-before-
    /// seen signature never both build it; the loser simply observes the
    /// winner's result.
    pub fn get_or_insert(&self, sig: Signature, build: impl FnOnce() -> AdapterStub) -> Arc<AdapterStub> {
        let mut stubs = self.stubs.lock().unwrap();
        stubs.entry(sig).or_insert_with(|| Arc::new(build())).clone()
    }

    pub fn len(&self) -> usize {
        self.stubs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One word read from the stack during a walk, supplied by the (out of
/// scope) stack-walker/unwinder this crate's output plugs into.
pub trait StackReader {
    fn read_word(&self, address: u64) -> u64;
}

/// The caller-side state a walk advances from one frame to the next: the
/// return address to resume at, the caller's stack pointer, and the
/// caller's frame pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerFrame {
    pub return_address: u64,
    pub sp: u64,
    pub fp: u64,
}

/// Advances a stack walk across one adapter frame:
///
/// "If the IP is at the first instruction or at a return instruction, the
/// frame has not yet been established (or has already been torn down); SP
/// already points at the return slot. Otherwise, the return slot lies at a
/// fixed offset (the frame size) from SP, and the saved frame pointer lies
/// two words below that."
///
/// `fp` is the walker's current frame-pointer register value, used verbatim
/// as the caller's fp in the not-yet-established case (the adapter has not
/// touched it yet).
pub fn advance_through_adapter(
    stub: &AdapterStub,
    ip_offset: u32,
    sp: u64,
    fp: u64,
    stack: &dyn StackReader,
) -> CallerFrame {
    let at_prologue_entry = ip_offset == 0;
    let at_epilogue_return = ip_offset >= stub.return_offset();

    if at_prologue_entry || at_epilogue_return {
        let return_address = stack.read_word(sp);
        CallerFrame { return_address, sp: sp + WORD_SIZE as u64, fp }
    } else {
        let frame_size_bytes = stub.frame.frame_words as u64 * WORD_SIZE as u64;
        let return_slot = sp + frame_size_bytes;
        let return_address = stack.read_word(return_slot);
        let saved_fp_addr = return_slot - 2 * WORD_SIZE as u64;
        let caller_fp = stack.read_word(saved_fp_addr);
        CallerFrame { return_address, sp: return_slot + WORD_SIZE as u64, fp: caller_fp }
    }
}
