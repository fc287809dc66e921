//! A minimal concrete instruction encoder.
//!
//! `spec.md` §1 Non-goals: "It does not prescribe a particular instruction
//! encoder; only the contracts the code-emission layer must satisfy."
//! `SPEC_FULL.md`'s Non-goals section calls for "a minimal concrete encoder
//! (`isa/x64small.rs`-equivalent) ... provided only as the vehicle to make
//! the emitter, patchable call sites, and adapters concrete and testable --
//! it is intentionally small and is not a general-purpose backend."
//!
//! Every encoded instruction is a fixed-size record: a one-byte tag, three
//! bytes of padding, and a 4-byte little-endian payload. The fixed width and
//! 4-byte alignment of the payload field mean any direct-call site's target
//! displacement is word-aligned for free, without this encoder needing to
//! know anything about real variable-length machine instructions.

pub const INSTR_LEN: usize = 8;
/// Byte offset of the payload field within one encoded instruction --
/// where a direct-call fixup's displacement lives.
pub const PAYLOAD_OFFSET: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    Enter = 1,
    Leave = 2,
    MoveRegReg = 3,
    MoveRegMem = 4,
    MoveMemReg = 5,
    CallDirect = 6,
    CallIndirect = 7,
    Jump = 8,
    BranchCond = 9,
    Return = 10,
    Nop = 11,
    SafepointPoll = 12,
    Op = 13,
}

impl Tag {
    fn from_u8(b: u8) -> Option<Tag> {
        Some(match b {
            1 => Tag::Enter,
            2 => Tag::Leave,
            3 => Tag::MoveRegReg,
            4 => Tag::MoveRegMem,
            5 => Tag::MoveMemReg,
            6 => Tag::CallDirect,
            7 => Tag::CallIndirect,
            8 => Tag::Jump,
            9 => Tag::BranchCond,
            10 => Tag::Return,
            11 => Tag::Nop,
            12 => Tag::SafepointPoll,
            13 => Tag::Op,
            _ => return None,
        })
    }
}

/// Encodes one fixed-width instruction record.
pub fn encode(tag: Tag, payload: u32) -> [u8; INSTR_LEN] {
    let mut buf = [0u8; INSTR_LEN];
    buf[0] = tag as u8;
    buf[PAYLOAD_OFFSET..].copy_from_slice(&payload.to_le_bytes());
    buf
}

/// Appends one encoded instruction to `code`, returning the byte offset it
/// was written at (used to register fixup-table entries for direct calls).
pub fn emit(code: &mut Vec<u8>, tag: Tag, payload: u32) -> u32 {
    let offset = code.len() as u32;
    code.extend_from_slice(&encode(tag, payload));
    offset
}

pub fn tag_at(code: &[u8], offset: u32) -> Tag {
    let offset = offset as usize;
    Tag::from_u8(code[offset]).unwrap_or_else(|| panic!("unrecognized instruction tag at offset {offset}"))
}

pub fn payload_at(code: &[u8], offset: u32) -> u32 {
    let start = offset as usize + PAYLOAD_OFFSET;
    u32::from_le_bytes(code[start..start + 4].try_into().unwrap())
}

/// Overwrites the payload of the instruction at `offset` in place -- the
/// mechanism behind every patchable call site.
pub fn patch_payload(code: &mut [u8], offset: u32, payload: u32) {
    let start = offset as usize + PAYLOAD_OFFSET;
    code[start..start + 4].copy_from_slice(&payload.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_tag_and_payload() {
        let mut code = Vec::new();
        let at = emit(&mut code, Tag::CallDirect, 42);
        assert_eq!(tag_at(&code, at), Tag::CallDirect);
        assert_eq!(payload_at(&code, at), 42);
    }

    #[test]
    fn every_instruction_offset_is_word_aligned() {
        let mut code = Vec::new();
        for _ in 0..5 {
            let at = emit(&mut code, Tag::Nop, 0);
            assert_eq!(at % 4, 0, "instruction displacement must be word-aligned");
        }
    }

    #[test]
    fn patch_overwrites_only_the_payload() {
        let mut code = Vec::new();
        let at = emit(&mut code, Tag::CallDirect, 1);
        patch_payload(&mut code, at, 99);
        assert_eq!(tag_at(&code, at), Tag::CallDirect);
        assert_eq!(payload_at(&code, at), 99);
    }
}
