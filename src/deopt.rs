//! The deoptimizer: transforms a running stack of
//! optimized frames back into equivalent baseline frames when a compiled
//! assumption is invalidated.
//!
//! Two phases, matching the spec's own split:
//! - [`mark_and_patch`] and [`DispatchTable`] implement the marking phase,
//!   run once under the global safepoint for a whole invalidation set.
//! - [`reconstruct`] implements the reconstruction phase, run once per stub
//!   invocation on the thread that owns the deoptimizing frame.
//!
//! The actual stack walk that locates `PatchableFrame`s, and the assembly
//! that tail-continues into a [`ReconstructionPlan`], are both out of scope;
//! this module plugs into them the same way [`crate::adapter`] plugs into an
//! external unwinder, via [`crate::adapter::StackReader`] and the
//! [`MutableStack`] extension of it.

use crate::adapter::StackReader;
use crate::collab::{BaselineCompiler, BaselineFrameLayout, GcCollaborator};
use crate::concurrency::patch_word_release;
use crate::debuginfo::{CiDebugInfo, MethodId, RefBitmap, ValueLocation, VirtualFrame};
use crate::operand::{FrameSlot, PReg};
use crate::target_method::TargetMethod;
use std::sync::atomic::AtomicU32;

/// The return-value category a deopt-on-return stub is specialized for.
/// Each variant corresponds to one of the six-plus-void generated stubs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnKind {
    Int,
    Long,
    Float,
    Double,
    Object,
    Word,
    Void,
}

/// Which deopt stub a patched return-address slot points at: the top-frame-via-trap case and the
/// callee-return case are distinct stubs, the latter keyed by return kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeoptStubKind {
    AtSafepoint,
    OnReturn(ReturnKind),
}

/// Code addresses of the generated deopt stubs, looked up by
/// [`DeoptStubKind`]. Building the stubs themselves is the emitter's job
/// ([`crate::emit`]); this table is just the dispatch from kind to address.
#[derive(Debug, Clone, Copy)]
pub struct DeoptStubTable {
    at_safepoint: u64,
    on_return: [u64; 7],
}

impl DeoptStubTable {
    pub fn new(at_safepoint: u64, on_return: [u64; 7]) -> Self {
        DeoptStubTable { at_safepoint, on_return }
    }

    pub fn address_for(&self, kind: DeoptStubKind) -> u64 {
        match kind {
            DeoptStubKind::AtSafepoint => self.at_safepoint,
            DeoptStubKind::OnReturn(rk) => self.on_return[rk as usize],
        }
    }
}

/// A dispatch table (virtual or interface) whose slots this module may need
/// to revert to a trampoline during marking. Slot storage is
/// owned here; the mapping from method to slot index is external (the class
/// hierarchy itself is out of scope).
#[derive(Debug)]
pub struct DispatchTable {
    slots: Vec<AtomicU32>,
}

impl DispatchTable {
    pub fn new(initial: Vec<u32>) -> Self {
        DispatchTable { slots: initial.into_iter().map(AtomicU32::new).collect() }
    }

    pub fn read(&self, slot: usize) -> u32 {
        crate::concurrency::read_word_acquire(&self.slots[slot])
    }

    /// Revert `slot` to `trampoline_id` with a single aligned word write.
    pub fn revert_to_trampoline(&self, slot: usize, trampoline_id: u32) {
        patch_word_release(&self.slots[slot], trampoline_id);
    }
}

/// One frame on a live thread's stack, already identified by the (out of
/// scope) stack walker as executing a method in the invalidation set. This
/// module's job starts where the walker's ends: decide which stub to
/// install and do the patch.
#[derive(Debug, Clone, Copy)]
pub struct PatchableFrame {
    /// Address of the return-address word to overwrite: the trap stub's
    /// return slot for a top frame reached via a trap, or the callee's
    /// return-address slot otherwise.
    pub return_address_site: u64,
    /// Fixed offset in the owning frame where the original return address
    /// is preserved, so the stub can chain to it once reconstruction
    /// finishes.
    pub saved_return_address_site: u64,
    pub stub: DeoptStubKind,
}

/// The stack access this module needs during marking: reading the return
/// address being replaced and writing both the stub address and the saved
/// original. Extends [`StackReader`] rather than duplicating its read side.
pub trait MutableStack: StackReader {
    fn write_word(&self, address: u64, value: u64);
}

/// Runs the marking phase for one invalidation set, under the assumption the caller already holds the
/// global safepoint. Steps 1 and 3 (atomic mark,
/// entry-point redirect) are [`TargetMethod::invalidate`]; this function
/// additionally performs steps 2 (dispatch-slot reversion) and 4 (patching
/// frames already on-stack).
///
/// Returns, in order, whether each method in `methods` was newly
/// invalidated by this call. `false` means a concurrent caller already
/// invalidated it first; later entries still skip already-invalidated
/// methods and continue.
pub fn mark_and_patch(
    methods: &[&TargetMethod],
    trampoline_id: u32,
    dispatch_reversions: &[(&DispatchTable, usize)],
    frames: &[PatchableFrame],
    stack: &dyn MutableStack,
    stubs: &DeoptStubTable,
) -> Vec<bool> {
    let newly_invalidated: Vec<bool> = methods.iter().map(|m| m.invalidate(trampoline_id)).collect();

    for &(table, slot) in dispatch_reversions {
        table.revert_to_trampoline(slot, trampoline_id);
    }

    for frame in frames {
        let original_return_address = stack.read_word(frame.return_address_site);
        stack.write_word(frame.saved_return_address_site, original_return_address);
        stack.write_word(frame.return_address_site, stubs.address_for(frame.stub));
    }

    newly_invalidated
}

/// Explicit handler-frame walk. `exception_handler_bci` names a handler in
/// the innermost (last) chain element only, so the only candidate frame is
/// the top one, and a handler is found there iff one is recorded at all.
pub fn find_exception_handler_frame(
    chain: &[VirtualFrame],
    exception_handler_bci: Option<u32>,
    pending_exception: bool,
) -> Option<usize> {
    if !pending_exception || chain.is_empty() {
        return None;
    }
    exception_handler_bci.map(|_| chain.len() - 1)
}

/// Truncates `chain` to the handler frame found by
/// [`find_exception_handler_frame`], discarding every chain element above it.
fn apply_exception_edge(chain: &[VirtualFrame], handler_frame: Option<usize>) -> &[VirtualFrame] {
    match handler_frame {
        Some(idx) => &chain[..=idx],
        None => chain,
    }
}

/// Read access into the optimized frame being deoptimized, as captured by
/// the stub at entry. The concrete capture format is stub/ABI-specific
/// and out of scope; this is the narrow query surface reconstruction needs.
pub trait CapturedState {
    fn register(&self, preg: PReg) -> u64;
    fn stack_slot(&self, slot: FrameSlot) -> u64;
}

/// One reconstructed baseline frame: a sequence of word-sized slots plus a
/// parallel reference flag per slot.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameImage {
    pub method: MethodId,
    pub words: Vec<u64>,
    pub is_reference: Vec<bool>,
}

/// The finished reconstruction: every frame image bottom (caller) to top
/// (callee), the destination IP, and the total word count the caller needs
/// to reserve when copying the sequence onto the stack.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconstructionPlan {
    pub frame_images: Vec<FrameImage>,
    pub total_words: u32,
    pub destination_ip: u64,
}

impl ReconstructionPlan {
    pub fn top_frame(&self) -> &FrameImage {
        self.frame_images.last().expect("a reconstruction plan always has at least one frame")
    }

    /// The reference map of the newly reconstructed top frame, for the
    /// verification step 7 calls for before tail-continuing.
    pub fn top_frame_ref_map(&self) -> RefBitmap {
        let top = self.top_frame();
        let mut bm = RefBitmap::new(top.words.len());
        for (i, &is_ref) in top.is_reference.iter().enumerate() {
            if is_ref {
                bm.set(i);
            }
        }
        bm
    }
}

/// Resolves one value's location to a concrete word . `caller_frame`, when present, is the
/// already-built image of the frame immediately below this one in the
/// chain, the only frame a [`ValueLocation::CallerFrameSlot`] can name.
fn resolve_word(
    location: &ValueLocation,
    captured: &dyn CapturedState,
    gc: &dyn GcCollaborator,
    caller_frame: Option<&FrameImage>,
) -> u64 {
    match location {
        ValueLocation::ConstantI32(v) => *v as u32 as u64,
        ValueLocation::ConstantI64(v) => *v as u64,
        ValueLocation::ConstantF32(bits) => *bits as u64,
        ValueLocation::ConstantF64(bits) => *bits,
        ValueLocation::ConstantObject(idx) => *idx as u64,
        ValueLocation::Register(preg) => captured.register(*preg),
        ValueLocation::FrameSlot(slot) => captured.stack_slot(*slot),
        ValueLocation::CallerFrameSlot(index) => {
            let caller = caller_frame
                .expect("CallerFrameSlot location with no caller frame image below it");
            *caller
                .words
                .get(*index as usize)
                .unwrap_or_else(|| panic!("caller-frame slot {index} out of range"))
        }
        ValueLocation::Virtual(_) => {
            unreachable!("a Virtual location never survives into a CiDebugInfo; the allocator resolves it during reference-map finalization")
        }
        ValueLocation::VirtualObject { template_id, fields } => {
            let field_words: Vec<u64> = fields
                .iter()
                .map(|f| resolve_word(&f.location, captured, gc, caller_frame))
                .collect();
            gc.materialize_virtual_object(*template_id, &field_words)
        }
    }
}

fn build_frame_image(
    vf: &VirtualFrame,
    layout: &BaselineFrameLayout,
    captured: &dyn CapturedState,
    gc: &dyn GcCollaborator,
    caller_frame: Option<&FrameImage>,
) -> FrameImage {
    let frame_words = layout.frame_words as usize;
    let mut words = vec![0u64; frame_words];
    let mut is_reference = vec![false; frame_words];
    for (i, value) in vf.values.iter().enumerate() {
        assert!(i < frame_words, "baseline frame layout too small for its own debug-info values");
        words[i] = resolve_word(&value.location, captured, gc, caller_frame);
        is_reference[i] = value.is_reference;
    }
    FrameImage { method: vf.method, words, is_reference }
}

/// Runs the reconstruction phase for one deoptimizing frame, given the target method that trapped or
/// was returned into and the IP offset captured by the stub. Panics on the
/// two fatal conditions named in `spec.md` §7: a safepoint that cannot be
/// found for the captured IP ("malformed safepoint debug info"), and a
/// pending exception with no matching handler in the chain.
pub fn reconstruct(
    method: &TargetMethod,
    captured_ip_offset: u32,
    pending_exception: bool,
    captured: &dyn CapturedState,
    baseline: &dyn BaselineCompiler,
    gc: &dyn GcCollaborator,
) -> ReconstructionPlan {
    let safepoint = method
        .nearest_safepoint_at_or_before(captured_ip_offset)
        .expect("malformed safepoint debug info: no frame at the captured IP");
    let debug_info: &CiDebugInfo = &method.debug_info_pool[safepoint.debug_info_index as usize];

    let handler_frame =
        find_exception_handler_frame(&debug_info.chain, debug_info.exception_handler_bci, pending_exception);
    if pending_exception && handler_frame.is_none() {
        panic!("exception thrown with no matching handler during deopt");
    }
    let chain = apply_exception_edge(&debug_info.chain, handler_frame);
    assert!(!chain.is_empty(), "malformed safepoint debug info: empty virtual-frame chain");

    let mut frame_images = Vec::with_capacity(chain.len());
    let mut destination_method = chain[0].method;
    let mut destination_bci = chain[0].bci;
    for (i, vf) in chain.iter().enumerate() {
        let is_handler_frame = pending_exception && handler_frame == Some(i);
        let bci = if is_handler_frame {
            debug_info.exception_handler_bci.expect("handler frame chosen without a handler bci")
        } else {
            vf.bci
        };
        let layout = baseline.compile_for_bci(vf.method, bci);
        let caller = frame_images.last();
        frame_images.push(build_frame_image(vf, &layout, captured, gc, caller));
        destination_method = vf.method;
        destination_bci = bci;
    }

    let total_words = frame_images.iter().map(|f| f.words.len() as u32).sum();
    let destination_ip = baseline.baseline_pc_for_bci(destination_method, destination_bci);

    ReconstructionPlan { frame_images, total_words, destination_ip }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{FixedBaseline, GcCollaborator};
    use crate::debuginfo::{FrameValue, MethodId};
    use crate::operand::PReg;
    use cranelift_entity::EntityRef;
    use std::cell::RefCell;
    use std::collections::HashMap;

    struct FakeGc;
    impl GcCollaborator for FakeGc {
        fn materialize_virtual_object(&self, template_id: u32, field_words: &[u64]) -> u64 {
            0xF000_0000 + template_id as u64 * 100 + field_words.iter().sum::<u64>()
        }
    }

    struct FakeCaptured {
        registers: HashMap<u32, u64>,
        stack: HashMap<u32, u64>,
    }
    impl CapturedState for FakeCaptured {
        fn register(&self, preg: PReg) -> u64 {
            *self.registers.get(&(preg.index() as u32)).unwrap_or(&0)
        }
        fn stack_slot(&self, slot: FrameSlot) -> u64 {
            *self.stack.get(&(slot.index() as u32)).unwrap_or(&0)
        }
    }

    struct FakeStack(RefCell<HashMap<u64, u64>>);
    impl FakeStack {
        fn with(words: &[(u64, u64)]) -> Self {
            FakeStack(RefCell::new(words.iter().copied().collect()))
        }
    }
    impl StackReader for FakeStack {
        fn read_word(&self, address: u64) -> u64 {
            *self.0.borrow().get(&address).unwrap_or_else(|| panic!("no word stubbed at {address:#x}"))
        }
    }
    impl MutableStack for FakeStack {
        fn write_word(&self, address: u64, value: u64) {
            self.0.borrow_mut().insert(address, value);
        }
    }

    fn stub_table() -> DeoptStubTable {
        DeoptStubTable::new(0x1000, [0x2000, 0x2100, 0x2200, 0x2300, 0x2400, 0x2500, 0x2600])
    }

    fn method_fixture(chain: Vec<VirtualFrame>, exception_handler_bci: Option<u32>) -> TargetMethod {
        TargetMethod::new(
            vec![0u8; 16],
            vec![crate::target_method::SafepointEntry { code_offset: 8, debug_info_index: 0 }],
            vec![CiDebugInfo {
                register_ref_map: RefBitmap::new(0),
                frame_ref_map: RefBitmap::new(0),
                chain,
                exception_handler_bci,
            }],
            vec![],
            vec![],
            32,
            crate::target_method::CallingConvention::Optimized,
            0,
        )
    }

    #[test]
    fn marking_phase_is_skipped_for_an_already_invalidated_method() {
        let m1 = method_fixture(vec![], None);
        let m2 = method_fixture(vec![], None);
        let stack = FakeStack::with(&[]);
        let stubs = stub_table();

        let first = mark_and_patch(&[&m1, &m2], 7, &[], &[], &stack, &stubs);
        assert_eq!(first, vec![true, true]);

        let second = mark_and_patch(&[&m1], 8, &[], &[], &stack, &stubs);
        assert_eq!(second, vec![false], "already-invalidated methods are skipped, spec.md §7");
        assert_eq!(m1.entry_redirect(), 7, "the first (winning) trampoline id sticks");
    }

    #[test]
    fn dispatch_slot_reversion_uses_a_single_aligned_word_write() {
        let table = DispatchTable::new(vec![42, 43]);
        table.revert_to_trampoline(1, 99);
        assert_eq!(table.read(0), 42);
        assert_eq!(table.read(1), 99);
    }

    #[test]
    fn patching_a_frame_saves_the_original_return_address_and_installs_the_stub() {
        let m = method_fixture(vec![], None);
        let stack = FakeStack::with(&[(0x8000, 0xDEAD_0000)]);
        let stubs = stub_table();
        let frame = PatchableFrame {
            return_address_site: 0x8000,
            saved_return_address_site: 0x8008,
            stub: DeoptStubKind::OnReturn(ReturnKind::Object),
        };

        mark_and_patch(&[&m], 1, &[], &[frame], &stack, &stubs);

        assert_eq!(stack.0.borrow()[&0x8008], 0xDEAD_0000, "original return address preserved");
        assert_eq!(stack.0.borrow()[&0x8000], stubs.address_for(DeoptStubKind::OnReturn(ReturnKind::Object)));
    }

    #[test]
    fn top_frame_via_trap_gets_the_at_safepoint_stub() {
        let m = method_fixture(vec![], None);
        let stack = FakeStack::with(&[(0x100, 0x1)]);
        let stubs = stub_table();
        let frame = PatchableFrame {
            return_address_site: 0x100,
            saved_return_address_site: 0x108,
            stub: DeoptStubKind::AtSafepoint,
        };
        mark_and_patch(&[&m], 1, &[], &[frame], &stack, &stubs);
        assert_eq!(stack.0.borrow()[&0x100], stubs.address_for(DeoptStubKind::AtSafepoint));
    }

    #[test]
    fn handler_frame_search_finds_the_innermost_frame_only_when_pending_and_recorded() {
        let chain = vec![
            VirtualFrame { method: MethodId(1), bci: 3, values: vec![] },
            VirtualFrame { method: MethodId(2), bci: 9, values: vec![] },
        ];
        assert_eq!(find_exception_handler_frame(&chain, Some(20), true), Some(1));
        assert_eq!(find_exception_handler_frame(&chain, None, true), None, "no handler recorded");
        assert_eq!(find_exception_handler_frame(&chain, Some(20), false), None, "no exception pending");
    }

    #[test]
    #[should_panic(expected = "no matching handler")]
    fn reconstruct_with_a_pending_exception_and_no_handler_is_fatal() {
        let chain = vec![VirtualFrame { method: MethodId(1), bci: 3, values: vec![] }];
        let m = method_fixture(chain, None);
        let captured = FakeCaptured { registers: HashMap::new(), stack: HashMap::new() };
        let baseline = FixedBaseline { frame_words: 4, arg_slots: 0, code_base: 0x9000 };
        reconstruct(&m, 8, true, &captured, &baseline, &FakeGc);
    }

    /// Scenario 3 of `spec.md` §8: "Deopt at a safepoint between a getfield
    /// and its use" -- the loaded value must land on the reconstructed
    /// operand stack at the right slot.
    #[test]
    fn reconstruct_places_a_register_held_value_into_the_baseline_operand_stack_slot() {
        let chain = vec![VirtualFrame {
            method: MethodId(7),
            bci: 12,
            values: vec![
                FrameValue { is_reference: false, location: ValueLocation::FrameSlot(FrameSlot::new(0)) },
                FrameValue { is_reference: true, location: ValueLocation::Register(PReg::new(2)) },
            ],
        }];
        let m = method_fixture(chain, None);
        let mut stack = HashMap::new();
        stack.insert(0u32, 111u64);
        let mut registers = HashMap::new();
        registers.insert(2u32, 0xCAFE_u64);
        let captured = FakeCaptured { registers, stack };
        let baseline = FixedBaseline { frame_words: 4, arg_slots: 0, code_base: 0x9000 };

        let plan = reconstruct(&m, 8, false, &captured, &baseline, &FakeGc);

        assert_eq!(plan.frame_images.len(), 1);
        let top = plan.top_frame();
        assert_eq!(top.words[0], 111, "local slot preserved");
        assert_eq!(top.words[1], 0xCAFE, "the getfield result lands in its operand-stack slot");
        assert!(top.is_reference[1]);
        assert_eq!(plan.destination_ip, 0x9000 + 12 * 4);
        assert_eq!(plan.total_words, 4);
        assert!(plan.top_frame_ref_map().get(1));
        assert!(!plan.top_frame_ref_map().get(0));
    }

    #[test]
    fn reconstruct_resolves_caller_frame_slots_against_the_frame_built_just_before_it() {
        let chain = vec![
            VirtualFrame {
                method: MethodId(1),
                bci: 0,
                values: vec![FrameValue { is_reference: false, location: ValueLocation::ConstantI64(77) }],
            },
            VirtualFrame {
                method: MethodId(2),
                bci: 1,
                values: vec![FrameValue { is_reference: false, location: ValueLocation::CallerFrameSlot(0) }],
            },
        ];
        let m = method_fixture(chain, None);
        let captured = FakeCaptured { registers: HashMap::new(), stack: HashMap::new() };
        let baseline = FixedBaseline { frame_words: 2, arg_slots: 0, code_base: 0 };

        let plan = reconstruct(&m, 8, false, &captured, &baseline, &FakeGc);

        assert_eq!(plan.frame_images[0].words[0], 77);
        assert_eq!(plan.frame_images[1].words[0], 77, "callee reads the caller's slot by value");
    }

    #[test]
    fn reconstruct_materializes_virtual_objects_through_the_gc_collaborator() {
        let chain = vec![VirtualFrame {
            method: MethodId(3),
            bci: 0,
            values: vec![FrameValue {
                is_reference: true,
                location: ValueLocation::VirtualObject {
                    template_id: 5,
                    fields: vec![FrameValue { is_reference: false, location: ValueLocation::ConstantI32(4) }],
                },
            }],
        }];
        let m = method_fixture(chain, None);
        let captured = FakeCaptured { registers: HashMap::new(), stack: HashMap::new() };
        let baseline = FixedBaseline { frame_words: 1, arg_slots: 0, code_base: 0 };

        let plan = reconstruct(&m, 8, false, &captured, &baseline, &FakeGc);
        assert_eq!(plan.top_frame().words[0], 0xF000_0000 + 500 + 4);
    }
}
