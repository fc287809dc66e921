//! The compiled artifact produced by the emitter.

use crate::debuginfo::CiDebugInfo;
use crate::lir::CallTarget;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Whether a method entered through a register-and-stack (optimized) or an
/// all-on-stack (baseline) calling convention. Drives which adapter, if any,
/// is needed at a call crossing the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallingConvention {
    Optimized,
    Baseline,
}

/// One direct-call site recorded during emission: the code offset of its
/// patchable displacement, and the callee it currently resolves to.
/// `spec.md` §6: "a fixup table of direct-call sites (offset → callee
/// descriptor)".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    pub code_offset: u32,
    pub callee: CallTarget,
}

/// One entry of the safepoint table: a code offset paired with the index of
/// its debug info in the method's debug-info pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafepointEntry {
    pub code_offset: u32,
    pub debug_info_index: u32,
}

/// One entry of the exception table: the code range `[start, end)` covered
/// by a handler, and the handler's code offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionEntry {
    pub start: u32,
    pub end: u32,
    pub handler: u32,
}

/// A compiled method is live exactly until it is invalidated once; `state`
/// enforces that transition is one-way and idempotent.
#[derive(Debug)]
struct InvalidationState {
    invalidated: AtomicBool,
    /// Patchable entry-point redirect target: 0 means "run the compiled
    /// body", any other value is an opaque trampoline id the runtime
    /// resolves. Patched under the global safepoint only.
    entry_redirect: AtomicU32,
}

/// The compiled artifact: code buffer, safepoint table, call-site fixups,
/// exception table, and calling-convention metadata.
#[derive(Debug)]
pub struct TargetMethod {
    pub code: Vec<u8>,
    pub safepoints: Vec<SafepointEntry>,
    pub debug_info_pool: Vec<CiDebugInfo>,
    pub call_sites: Vec<CallSite>,
    pub exception_table: Vec<ExceptionEntry>,
    pub frame_size_bytes: u32,
    pub calling_convention: CallingConvention,
    pub prologue_len: u32,
    state: InvalidationState,
}

impl TargetMethod {
    pub fn new(
        code: Vec<u8>,
        safepoints: Vec<SafepointEntry>,
        debug_info_pool: Vec<CiDebugInfo>,
        call_sites: Vec<CallSite>,
        exception_table: Vec<ExceptionEntry>,
        frame_size_bytes: u32,
        calling_convention: CallingConvention,
        prologue_len: u32,
    ) -> Self {
        TargetMethod {
            code,
            safepoints,
            debug_info_pool,
            call_sites,
            exception_table,
            frame_size_bytes,
            calling_convention,
            prologue_len,
            state: InvalidationState {
                invalidated: AtomicBool::new(false),
                entry_redirect: AtomicU32::new(0),
            },
        }
    }

    /// Look up the debug info recorded at `code_offset`, if that offset is a
    /// safepoint.
    pub fn debug_info_at(&self, code_offset: u32) -> Option<&CiDebugInfo> {
        self.safepoints
            .iter()
            .find(|s| s.code_offset == code_offset)
            .map(|s| &self.debug_info_pool[s.debug_info_index as usize])
    }

    /// The safepoint whose code offset is closest to, but not after,
    /// `pc_offset` -- used by the deoptimizer's reconstruction phase.
    pub fn nearest_safepoint_at_or_before(&self, pc_offset: u32) -> Option<&SafepointEntry> {
        self.safepoints.iter().filter(|s| s.code_offset <= pc_offset).max_by_key(|s| s.code_offset)
    }

    pub fn is_invalidated(&self) -> bool {
        self.state.invalidated.load(Ordering::Acquire)
    }

    /// Mark this method invalidated and redirect its entry point to the
    /// static trampoline, identified by a nonzero `trampoline_id`.
    /// Idempotent: a method already invalidated is left untouched and the
    /// call reports `false`.
    pub fn invalidate(&self, trampoline_id: u32) -> bool {
        debug_assert_ne!(trampoline_id, 0, "0 means \"run the compiled body\"");
        match self.state.invalidated.compare_exchange(
            false,
            true,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.state.entry_redirect.store(trampoline_id, Ordering::Release);
                true
            }
            Err(_) => false,
        }
    }

    pub fn entry_redirect(&self) -> u32 {
        self.state.entry_redirect.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> TargetMethod {
        TargetMethod::new(
            vec![0u8; 16],
            vec![SafepointEntry { code_offset: 4, debug_info_index: 0 }, SafepointEntry { code_offset: 10, debug_info_index: 1 }],
            vec![
                CiDebugInfo {
                    register_ref_map: crate::debuginfo::RefBitmap::new(0),
                    frame_ref_map: crate::debuginfo::RefBitmap::new(0),
                    chain: vec![],
                    exception_handler_bci: None,
                },
                CiDebugInfo {
                    register_ref_map: crate::debuginfo::RefBitmap::new(0),
                    frame_ref_map: crate::debuginfo::RefBitmap::new(0),
                    chain: vec![],
                    exception_handler_bci: None,
                },
            ],
            vec![],
            vec![],
            16,
            CallingConvention::Optimized,
            0,
        )
    }

    #[test]
    fn invalidate_is_idempotent() {
        let m = fixture();
        assert!(m.invalidate(99));
        assert!(!m.invalidate(100));
        assert_eq!(m.entry_redirect(), 99);
    }

    #[test]
    fn nearest_safepoint_picks_closest_not_after() {
        let m = fixture();
        assert_eq!(m.nearest_safepoint_at_or_before(10).unwrap().code_offset, 10);
        assert_eq!(m.nearest_safepoint_at_or_before(9).unwrap().code_offset, 4);
        assert!(m.nearest_safepoint_at_or_before(3).is_none());
    }
}
