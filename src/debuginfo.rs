//! Debug info: the logical frame state attached to safepoint/call/null-check
//! instructions before allocation, and the concrete per-safepoint record the
//! allocator and emitter produce after it.

use crate::operand::{FrameSlot, PReg, VReg};
use cranelift_entity::entity_impl;
use std::fmt;

/// Identifies one [`DebugInfo`] record, referenced from the LIR instruction
/// it is attached to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DebugInfoId(u32);
entity_impl!(DebugInfoId, "dbg");

/// Opaque identifier for a baseline-compiled method, as seen from the
/// deoptimizer's virtual-frame chain. Resolved by the (out of scope)
/// baseline compiler, not interpreted here.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct MethodId(pub u32);

/// Where one value in a reconstructed bytecode frame comes from.
#[derive(Clone, Debug, PartialEq)]
pub enum ValueLocation {
    ConstantI32(i32),
    ConstantI64(i64),
    ConstantF32(u32),
    ConstantF64(u64),
    /// Interned constant-pool index of a reference.
    ConstantObject(u32),
    Register(PReg),
    FrameSlot(FrameSlot),
    /// A slot in the *caller's* frame, relative to this frame -- used when a
    /// value spilled by an inlined caller is still needed by a callee
    /// virtual frame during reconstruction.
    CallerFrameSlot(u32),
    /// Pre-allocation placeholder: "wherever this virtual register ends up
    /// at this safepoint". Not part of the wire format in `spec.md` §6 --
    /// the allocator's reference-map/debug-info finalization pass resolves
    /// every `Virtual` into a concrete `Register`/`FrameSlot` before the
    /// final [`CiDebugInfo`] is produced, using the split child covering the
    /// safepoint's opId.
    Virtual(VReg),
    /// A synthesized object: a template id plus the locations of its field
    /// values, needed when scalar-replaced/escape-analyzed allocations must
    /// be rematerialized during deoptimization.
    VirtualObject {
        template_id: u32,
        fields: Vec<FrameValue>,
    },
}

/// One value in a reconstructed bytecode-level frame: its kind plus where to
/// find it.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameValue {
    pub is_reference: bool,
    pub location: ValueLocation,
}

/// One element of the debug-info chain: a baseline method, a
/// program-counter-within-baseline (bci), and the values live at that point.
#[derive(Clone, Debug, PartialEq)]
pub struct VirtualFrame {
    pub method: MethodId,
    pub bci: u32,
    pub values: Vec<FrameValue>,
}

/// The logical frame state attached to a safepoint/call/null-check LIR
/// instruction before allocation: a chain of virtual frames (innermost-last,
/// i.e. caller-to-callee) plus an optional exception-handler edge.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DebugInfo {
    pub chain: Vec<VirtualFrame>,
    /// Present if this safepoint can throw; names the bci of the handler in
    /// the *innermost* frame.
    pub exception_handler_bci: Option<u32>,
}

/// A fixed-size bitmap over register units or frame words. Reused for both
/// the register reference map and the frame reference map: each bit says "this location holds a live GC reference right now".
#[derive(Clone, PartialEq, Eq, Default)]
pub struct RefBitmap {
    words: Vec<u64>,
    bits: usize,
}

impl RefBitmap {
    pub fn new(bits: usize) -> Self {
        RefBitmap { words: vec![0u64; bits.div_ceil(64)], bits }
    }

    pub fn len(&self) -> usize {
        self.bits
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn set(&mut self, index: usize) {
        assert!(index < self.bits, "ref bitmap index {index} out of range {}", self.bits);
        self.words[index / 64] |= 1u64 << (index % 64);
    }

    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.bits, "ref bitmap index {index} out of range {}", self.bits);
        (self.words[index / 64] >> (index % 64)) & 1 != 0
    }

    pub fn any_set(&self) -> bool {
        self.words.iter().any(|&w| w != 0)
    }

    pub fn count_ones(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }
}

impl fmt::Debug for RefBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for i in 0..self.bits {
            write!(f, "{}", if self.get(i) { '1' } else { '0' })?;
        }
        write!(f, "]")
    }
}

/// The concrete, post-allocation debug info for one safepoint: register and frame
/// reference bitmaps plus the reconstructed virtual-frame chain.
#[derive(Clone, Debug, PartialEq)]
pub struct CiDebugInfo {
    pub register_ref_map: RefBitmap,
    pub frame_ref_map: RefBitmap,
    pub chain: Vec<VirtualFrame>,
    pub exception_handler_bci: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ref_bitmap_round_trips_bits() {
        let mut bm = RefBitmap::new(70);
        bm.set(0);
        bm.set(63);
        bm.set(64);
        bm.set(69);
        assert!(bm.get(0));
        assert!(bm.get(63));
        assert!(bm.get(64));
        assert!(bm.get(69));
        assert!(!bm.get(1));
        assert_eq!(bm.count_ones(), 4);
    }

    #[test]
    #[should_panic]
    fn ref_bitmap_rejects_out_of_range() {
        let bm = RefBitmap::new(4);
        bm.get(4);
    }
}
