//! Guest-independent half of translation: the decode loop and the
//! rules for where a TB ends. Guests supply the decoder through
//! [`TranslatorOps`].

use tcg_core::memory::{page_of, same_page};
use tcg_core::tb::cflags::CF_SINGLE_STEP;
use tcg_core::{Context, TranslationBlock};

/// Why decoding stopped (or `Next` while it goes on).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisasJumpType {
    Next,
    /// Instruction budget of the TB used up.
    TooMany,
    /// The following instruction could touch a second page.
    PageEnd,
    /// The instruction left the block itself (branch, exit, raise).
    NoReturn,
}

/// Decode state every guest embeds in its own context.
pub struct DisasContextBase {
    pub pc_first: u64,
    /// Address of the instruction after the current one.
    pub pc_next: u64,
    pub is_jmp: DisasJumpType,
    pub num_insns: u32,
    pub max_insns: u32,
    pub flags: u32,
    pub cflags: u32,
}

impl DisasContextBase {
    pub fn new(pc: u64, flags: u32, cflags: u32) -> Self {
        Self {
            pc_first: pc,
            pc_next: pc,
            is_jmp: DisasJumpType::Next,
            num_insns: 0,
            max_insns: TranslationBlock::max_insns(cflags),
            flags,
            cflags,
        }
    }

    pub fn singlestep(&self) -> bool {
        self.cflags & CF_SINGLE_STEP != 0
    }
}

/// May the block jump to `dest` through a chainable `goto_tb`?
///
/// The target must share the block's first page, so that a write to
/// that page retires the jumping TB along with the target. Blocks
/// built for single-stepping always return to the loop.
pub fn translator_use_goto_tb(base: &DisasContextBase, dest: u64) -> bool {
    !base.singlestep() && same_page(base.pc_first, dest)
}

/// Guest decoder hooks driven by [`translator_loop`].
pub trait TranslatorOps {
    type DisasContext;

    /// Longest guest instruction, in bytes.
    const MAX_INSN_LEN: u64 = 1;

    fn init_disas_context(ctx: &mut Self::DisasContext, ir: &mut Context);

    fn tb_start(ctx: &mut Self::DisasContext, ir: &mut Context);

    /// Emit the `insn_start` of the instruction at `pc_next`.
    fn insn_start(ctx: &mut Self::DisasContext, ir: &mut Context);

    /// Translate the instruction at `pc_next` and move `pc_next` past
    /// it. Sets `is_jmp` when the instruction ends the block; an
    /// undecodable instruction becomes a raised guest exception.
    fn translate_insn(ctx: &mut Self::DisasContext, ir: &mut Context);

    /// Close the block, e.g. with a jump to the fall-through PC.
    fn tb_stop(ctx: &mut Self::DisasContext, ir: &mut Context);

    fn base(ctx: &Self::DisasContext) -> &DisasContextBase;

    fn base_mut(ctx: &mut Self::DisasContext) -> &mut DisasContextBase;
}

/// Translate instructions until one ends the block, the budget runs
/// out, or the next one might cross into another page. Returns the
/// number of guest bytes covered.
pub fn translator_loop<T: TranslatorOps>(ctx: &mut T::DisasContext, ir: &mut Context) -> u32 {
    T::init_disas_context(ctx, ir);
    T::tb_start(ctx, ir);

    let stop = loop {
        T::base_mut(ctx).num_insns += 1;
        T::insn_start(ctx, ir);
        T::translate_insn(ctx, ir);

        let base = T::base(ctx);
        let last_byte = base.pc_next.wrapping_add(T::MAX_INSN_LEN - 1);
        if base.is_jmp != DisasJumpType::Next {
            break base.is_jmp;
        } else if base.num_insns >= base.max_insns {
            break DisasJumpType::TooMany;
        } else if page_of(last_byte) != page_of(base.pc_first) {
            break DisasJumpType::PageEnd;
        }
    };
    T::base_mut(ctx).is_jmp = stop;

    T::tb_stop(ctx, ir);
    let base = T::base(ctx);
    (base.pc_next - base.pc_first) as u32
}
