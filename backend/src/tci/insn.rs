//! Host instruction encoding of the portable target.
//!
//! Every host insn is one or two 64-bit words. Word 0:
//!
//! ```text
//!   bits  0..8   opcode
//!   bits  8..16  aux (type flag, condition, memop, slot)
//!   bits 16..32  r0
//!   bits 32..48  r1
//!   bits 48..64  r2
//! ```
//!
//! Two-word insns carry a 64-bit immediate in word 1. Operands name
//! either a CPU env word (`ENV_FLAG` set) or a frame slot.

use tcg_core::{Cond, MemOp};

use crate::ChainTarget;

/// Size of one host code unit.
pub const WORD: usize = 8;
/// Operand refers to an env word rather than a frame slot.
pub const ENV_FLAG: u16 = 0x8000;
/// Operation works on 32-bit values.
pub const AUX_I32: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HostOp {
    CheckExit = 1,
    LoadConst,
    Mov,
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    Neg,
    Not,
    ExtS32,
    ExtU32,
    SetCond,
    GuestLd,
    GuestSt,
    Br,
    BrCond,
    GotoTb,
    ExitTb,
    Raise,
    Call,
    Mb,
}

const HOST_OPS: [HostOp; 26] = [
    HostOp::CheckExit,
    HostOp::LoadConst,
    HostOp::Mov,
    HostOp::Add,
    HostOp::Sub,
    HostOp::Mul,
    HostOp::And,
    HostOp::Or,
    HostOp::Xor,
    HostOp::Shl,
    HostOp::Shr,
    HostOp::Sar,
    HostOp::Neg,
    HostOp::Not,
    HostOp::ExtS32,
    HostOp::ExtU32,
    HostOp::SetCond,
    HostOp::GuestLd,
    HostOp::GuestSt,
    HostOp::Br,
    HostOp::BrCond,
    HostOp::GotoTb,
    HostOp::ExitTb,
    HostOp::Raise,
    HostOp::Call,
    HostOp::Mb,
];

impl HostOp {
    pub fn from_u8(v: u8) -> Option<HostOp> {
        HOST_OPS.get((v as usize).checked_sub(1)?).copied()
    }

    /// Encoded size in bytes.
    pub const fn size(self) -> usize {
        match self {
            HostOp::LoadConst
            | HostOp::Br
            | HostOp::BrCond
            | HostOp::GotoTb
            | HostOp::ExitTb
            | HostOp::Raise
            | HostOp::Call => 2 * WORD,
            _ => WORD,
        }
    }
}

/// Decoded first word of a host insn.
#[derive(Debug, Clone, Copy)]
pub struct Word0 {
    pub op: HostOp,
    pub aux: u8,
    pub r0: u16,
    pub r1: u16,
    pub r2: u16,
}

impl Word0 {
    pub const fn encode(op: HostOp, aux: u8, r0: u16, r1: u16, r2: u16) -> u64 {
        op as u64
            | (aux as u64) << 8
            | (r0 as u64) << 16
            | (r1 as u64) << 32
            | (r2 as u64) << 48
    }

    /// Encode with a 32-bit payload in the upper half (r1/r2).
    pub const fn encode_wide(op: HostOp, aux: u8, r0: u16, hi: u32) -> u64 {
        op as u64 | (aux as u64) << 8 | (r0 as u64) << 16 | (hi as u64) << 32
    }

    pub fn decode(w: u64) -> Option<Word0> {
        Some(Word0 {
            op: HostOp::from_u8(w as u8)?,
            aux: (w >> 8) as u8,
            r0: (w >> 16) as u16,
            r1: (w >> 32) as u16,
            r2: (w >> 48) as u16,
        })
    }

    /// The 32-bit payload of an `encode_wide` word.
    pub fn hi(w: u64) -> u32 {
        (w >> 32) as u32
    }

    pub fn is_i32(&self) -> bool {
        self.aux & AUX_I32 != 0
    }

    pub fn cond(&self) -> Option<Cond> {
        Cond::from_u8(self.aux & 0x1f)
    }

    pub fn memop(&self) -> MemOp {
        MemOp::new((self.aux & 0x7) as u16)
    }
}

/// Link word of a `goto_tb`: 0 when unlinked, otherwise the target's
/// host offset + 1 in the low half and the generation in the high half.
pub fn encode_link(target: ChainTarget) -> u64 {
    assert!(
        target.host_offset < u32::MAX as usize,
        "chain target beyond link range"
    );
    (target.generation as u64) << 32 | (target.host_offset as u64 + 1)
}

pub fn decode_link(link: u64) -> Option<ChainTarget> {
    let off = link as u32;
    (off != 0).then(|| ChainTarget {
        host_offset: off as usize - 1,
        generation: (link >> 32) as u32,
    })
}
