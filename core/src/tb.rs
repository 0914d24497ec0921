use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::context::MAX_INSNS;

/// Number of data words recorded per guest instruction: the guest PC
/// followed by one word of target-defined decode state.
pub const INSN_START_WORDS: usize = 2;

/// Lifecycle of a translation block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TbState {
    /// Guest instructions are being decoded into IR.
    Decoding = 0,
    /// Host code is being generated.
    Codegen = 1,
    /// Published in the cache and executable.
    Cached = 2,
    /// Removed from lookup; code kept alive until the next flush.
    Invalid = 3,
}

impl TbState {
    fn from_u8(v: u8) -> TbState {
        match v {
            0 => TbState::Decoding,
            1 => TbState::Codegen,
            2 => TbState::Cached,
            _ => TbState::Invalid,
        }
    }
}

/// One row of the state-recovery side table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsnSearch {
    /// Host offset of the instruction's first host op, relative to
    /// the TB's `host_offset`.
    pub host_off: u32,
    pub data: [u64; INSN_START_WORDS],
}

/// A chain edge from one TB exit slot to a destination TB, valid only
/// while the cache generation it was made in is current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TbLink {
    pub dst: usize,
    pub generation: u32,
}

/// Chaining bookkeeping of one TB.
#[derive(Debug, Default)]
pub struct TbJmpState {
    /// Outgoing edge per `goto_tb` slot.
    pub jmp_dest: [Option<TbLink>; 2],
    /// Incoming edges as (source TB, slot).
    pub jmp_list: Vec<(usize, usize)>,
}

/// Host code for a run of guest instructions, keyed by
/// `(pc, flags, cflags & CF_HASH_MASK)`.
///
/// Once published only `state`, `hash_next` and `jmp` change.
#[derive(Debug)]
pub struct TranslationBlock {
    pub pc: u64,
    /// Guest mode bits the code was specialized for.
    pub flags: u32,
    pub cflags: u32,
    /// Guest bytes covered.
    pub size: u32,
    pub icount: u16,

    /// Entry point, as a code buffer offset.
    pub host_offset: usize,
    pub host_size: usize,
    /// Code buffer offset of each used `goto_tb`.
    pub jmp_insn_offset: [Option<u32>; 2],
    /// First page, plus the next one when the last instruction
    /// straddles the boundary.
    pub page_addr: [Option<u64>; 2],
    /// Restore rows in host order.
    pub search: Vec<InsnSearch>,
    /// Bucket successor as store index + 1; 0 ends the chain.
    pub hash_next: AtomicUsize,
    state: AtomicU8,
    pub jmp: Mutex<TbJmpState>,
}

pub mod cflags {
    /// Instruction budget; 0 means the default.
    pub const CF_COUNT_MASK: u32 = 0x0000_FFFF;
    pub const CF_SINGLE_STEP: u32 = 0x0002_0000;
    /// Sibling vCPUs run concurrently.
    pub const CF_PARALLEL: u32 = 0x0008_0000;
    /// Built for one execution, never published.
    pub const CF_NOCACHE: u32 = 0x0010_0000;
    /// The part of cflags that belongs to the lookup key.
    pub const CF_HASH_MASK: u32 = CF_COUNT_MASK | CF_SINGLE_STEP | CF_PARALLEL;
}

/// Codes generated code hands back to the loop.
pub mod exit {
    /// Unlinked `goto_tb` slot 0 or 1 was taken.
    pub const TB_EXIT_IDX0: u32 = 0;
    pub const TB_EXIT_IDX1: u32 = 1;
    /// Computed jump; the PC is in the env.
    pub const TB_EXIT_NOCHAIN: u32 = 2;
    /// Entry check saw a pending exit; nothing ran.
    pub const TB_EXIT_REQUESTED: u32 = 3;
}

/// Loop-level exception numbers. Guest exceptions use values below
/// `EXCP_INTERRUPT`.
pub mod excp {
    pub const EXCP_INTERRUPT: u32 = 0x10000;
    pub const EXCP_HLT: u32 = 0x10001;
    pub const EXCP_DEBUG: u32 = 0x10002;
    pub const EXCP_HALTED: u32 = 0x10003;
    pub const EXCP_YIELD: u32 = 0x10004;
    /// Re-execute the current instruction with all other vCPUs stopped.
    pub const EXCP_ATOMIC: u32 = 0x10005;
}

impl TranslationBlock {
    pub fn new(pc: u64, flags: u32, cflags: u32) -> Self {
        Self {
            pc,
            flags,
            cflags,
            size: 0,
            icount: 0,
            host_offset: 0,
            host_size: 0,
            jmp_insn_offset: [None; 2],
            page_addr: [None; 2],
            search: Vec::new(),
            hash_next: AtomicUsize::new(0),
            state: AtomicU8::new(TbState::Decoding as u8),
            jmp: Mutex::new(TbJmpState::default()),
        }
    }

    pub fn hash(pc: u64, flags: u32, cflags: u32) -> usize {
        let key = (flags as u64) ^ ((cflags & cflags::CF_HASH_MASK) as u64) << 32;
        let h = pc.wrapping_mul(0x9e3779b97f4a7c15) ^ key;
        (h as usize ^ (h >> 32) as usize) & (TB_HASH_SIZE - 1)
    }

    pub fn matches(&self, pc: u64, flags: u32, cflags: u32) -> bool {
        self.pc == pc
            && self.flags == flags
            && (self.cflags & cflags::CF_HASH_MASK)
                == (cflags & cflags::CF_HASH_MASK)
    }

    pub fn state(&self) -> TbState {
        TbState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: TbState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_valid(&self) -> bool {
        self.state() == TbState::Cached
    }

    pub fn contains_host_offset(&self, off: usize) -> bool {
        off >= self.host_offset && off < self.host_offset + self.host_size
    }

    /// Side-table row of the guest instruction executing at absolute
    /// host offset `off`: the last row whose offset is <= `off`.
    pub fn find_insn(&self, off: usize) -> Option<usize> {
        if !self.contains_host_offset(off) {
            return None;
        }
        let rel = off - self.host_offset;
        let k = self.search.partition_point(|r| r.host_off as usize <= rel);
        k.checked_sub(1)
    }

    /// Absolute host offset where guest instruction `k` starts.
    pub fn insn_host_offset(&self, k: usize) -> Option<usize> {
        self.search.get(k).map(|r| self.host_offset + r.host_off as usize)
    }

    /// Instruction budget encoded in `cflags`.
    pub fn max_insns(cflags: u32) -> u32 {
        match cflags & cflags::CF_COUNT_MASK {
            0 => MAX_INSNS as u32,
            n => n,
        }
    }
}

pub const TB_HASH_SIZE: usize = 1 << 15;
pub const TB_JMP_CACHE_SIZE: usize = 1 << 12;

/// Direct-mapped per-vCPU cache from PC to store index.
///
/// Entries are hints; the caller re-checks key and validity.
pub struct JumpCache {
    entries: Box<[Option<usize>; TB_JMP_CACHE_SIZE]>,
}

impl JumpCache {
    pub fn new() -> Self {
        Self {
            entries: Box::new([None; TB_JMP_CACHE_SIZE]),
        }
    }

    fn index(pc: u64) -> usize {
        (pc as usize >> 2) & (TB_JMP_CACHE_SIZE - 1)
    }

    pub fn lookup(&self, pc: u64) -> Option<usize> {
        self.entries[Self::index(pc)]
    }

    pub fn insert(&mut self, pc: u64, tb_idx: usize) {
        self.entries[Self::index(pc)] = Some(tb_idx);
    }

    pub fn remove(&mut self, pc: u64) {
        self.entries[Self::index(pc)] = None;
    }

    pub fn invalidate(&mut self) {
        self.entries.fill(None);
    }
}

impl Default for JumpCache {
    fn default() -> Self {
        Self::new()
    }
}
