//! The frame map: translates stack-slot indices to concrete byte offsets,
//! computes frame size, and serializes per-safepoint reference maps.
//!
//! Layout, lowest address (frame base, i.e. the callee-saved-register-area
//! side) to highest, matches the order `spec.md` lists the four areas in:
//! outgoing arguments, callee-saved spill area, monitor area, then the
//! split-parent canonical spill area. Frame slot `i`'s offset is
//! `i * WORD_SIZE` from the frame base, as required.

use crate::debuginfo::RefBitmap;
use crate::operand::FrameSlot;
use crate::WORD_SIZE;
use cranelift_entity::EntityRef;

/// Concrete frame geometry for one compiled method, computed once all
/// canonical spill slots, the clobbered-register set, and the worst-case
/// outgoing-call argument area are known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMap {
    outgoing_args_words: u32,
    callee_saved_words: u32,
    monitor_words: u32,
    spill_words: u32,
    /// Total frame size in words, aligned up to `stack_align_bytes`.
    frame_words: u32,
    stack_align_bytes: u32,
}

impl FrameMap {
    /// Platforms in this corpus generally require 16-byte stack alignment
    /// at call boundaries; this is the default used when none is given.
    pub const DEFAULT_STACK_ALIGN_BYTES: u32 = 16;

    pub fn new(
        outgoing_args_words: u32,
        callee_saved_words: u32,
        monitor_words: u32,
        spill_words: u32,
        stack_align_bytes: u32,
    ) -> Self {
        let raw_words = outgoing_args_words + callee_saved_words + monitor_words + spill_words;
        let align_words = (stack_align_bytes / WORD_SIZE).max(1);
        let frame_words = raw_words.div_ceil(align_words) * align_words;
        FrameMap {
            outgoing_args_words,
            callee_saved_words,
            monitor_words,
            spill_words,
            frame_words,
            stack_align_bytes,
        }
    }

    pub fn frame_size_bytes(&self) -> u32 {
        self.frame_words * WORD_SIZE
    }

    pub fn stack_align_bytes(&self) -> u32 {
        self.stack_align_bytes
    }

    fn base_word(&self, area_start_words: u32, index: u32, area_len_words: u32) -> u32 {
        assert!(index < area_len_words, "frame area index {index} out of range {area_len_words}");
        area_start_words + index
    }

    /// Word index of outgoing-argument slot `index`, from the frame base.
    pub fn outgoing_arg_word(&self, index: u32) -> u32 {
        self.base_word(0, index, self.outgoing_args_words)
    }

    /// Word index of the callee-saved-register spill slot `index`.
    pub fn callee_saved_word(&self, index: u32) -> u32 {
        self.base_word(self.outgoing_args_words, index, self.callee_saved_words)
    }

    /// Word index of monitor-record slot `index`.
    pub fn monitor_word(&self, index: u32) -> u32 {
        self.base_word(
            self.outgoing_args_words + self.callee_saved_words,
            index,
            self.monitor_words,
        )
    }

    /// Word index of a split-parent's canonical spill slot.
    pub fn spill_slot_word(&self, slot: FrameSlot) -> u32 {
        self.base_word(
            self.outgoing_args_words + self.callee_saved_words + self.monitor_words,
            slot.index() as u32,
            self.spill_words,
        )
    }

    pub fn byte_offset(word: u32) -> i32 {
        (word * WORD_SIZE) as i32
    }

    /// Number of bits needed for this frame's reference map: `ceil(frameSize
    /// / wordSize)`, per `spec.md` §4.3.
    pub fn ref_map_bits(&self) -> usize {
        self.frame_words as usize
    }

    /// A zeroed reference map sized for this frame, ready for the allocator
    /// to set bits in at each safepoint.
    pub fn empty_ref_map(&self) -> RefBitmap {
        RefBitmap::new(self.ref_map_bits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_size_aligns_up() {
        // 1 outgoing + 1 callee-saved + 0 monitors + 1 spill = 3 words = 24
        // bytes, rounds up to 32 bytes (4 words) at 16-byte alignment.
        let fm = FrameMap::new(1, 1, 0, 1, FrameMap::DEFAULT_STACK_ALIGN_BYTES);
        assert_eq!(fm.frame_size_bytes(), 32);
    }

    #[test]
    fn slot_to_offset_is_linear_in_word_size() {
        let fm = FrameMap::new(2, 2, 1, 3, 16);
        assert_eq!(fm.outgoing_arg_word(0), 0);
        assert_eq!(fm.outgoing_arg_word(1), 1);
        assert_eq!(fm.callee_saved_word(0), 2);
        assert_eq!(fm.monitor_word(0), 4);
        assert_eq!(fm.spill_slot_word(FrameSlot::new(0)), 5);
        assert_eq!(fm.spill_slot_word(FrameSlot::new(2)), 7);
        assert_eq!(FrameMap::byte_offset(fm.spill_slot_word(FrameSlot::new(0))), 40);
    }

    #[test]
    fn ref_map_sized_from_frame_words() {
        let fm = FrameMap::new(0, 0, 0, 70, 16);
        // 70 words rounded up to 2-word alignment stays 70.
        assert_eq!(fm.ref_map_bits(), 70);
        let rm = fm.empty_ref_map();
        assert_eq!(rm.len(), 70);
    }

    #[test]
    #[should_panic]
    fn out_of_range_slot_panics() {
        let fm = FrameMap::new(0, 0, 0, 2, 16);
        fm.spill_slot_word(FrameSlot::new(5));
    }
}
