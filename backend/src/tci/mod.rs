//! Portable host target.
//!
//! Generated code is a stream of fixed-size host insns (see [`insn`])
//! run by a threaded interpreter ([`interp`]). It lives in the same
//! code buffer, is chained by patching link words, and recovers guest
//! state through the same side table a native target would use.

pub mod insn;
pub mod interp;

use std::sync::atomic::{fence, Ordering};

use tcg_core::{Context, Op, Opcode, TempIdx, Type};

use crate::code_buffer::{CodeBuffer, CodeRegion};
use crate::{ChainTarget, HostCodeGen, HostExit, TbRuntime};
use insn::{encode_link, HostOp, Word0, AUX_I32, ENV_FLAG, WORD};

/// Code generator for the portable host target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TciCodeGen;

impl TciCodeGen {
    pub fn new() -> Self {
        Self
    }
}

/// Host operand for temp `t`.
fn reg(ctx: &Context, t: TempIdx) -> u16 {
    let temp = ctx.temp(t);
    if temp.is_global() {
        assert!(temp.env_word < ENV_FLAG as u32, "env word out of range");
        ENV_FLAG | temp.env_word as u16
    } else {
        let slot = t.0 - ctx.nb_globals();
        assert!(slot < interp::FRAME_WORDS as u32, "frame slot out of range");
        slot as u16
    }
}

fn type_aux(ty: Type) -> u8 {
    match ty {
        Type::I32 => AUX_I32,
        Type::I64 => 0,
    }
}

fn label_value(ctx: &Context, id: u32) -> u64 {
    match ctx.label(id).offset {
        Some(off) => off as u64,
        None => panic!("branch to unplaced label L{id}"),
    }
}

impl HostCodeGen for TciCodeGen {
    fn name(&self) -> &'static str {
        "tci"
    }

    fn tb_start_size(&self, ctx: &Context) -> usize {
        HostOp::CheckExit.size() + ctx.consts().count() * HostOp::LoadConst.size()
    }

    fn emit_tb_start(&self, buf: &mut CodeBuffer, ctx: &Context) {
        buf.emit_u64(Word0::encode_wide(HostOp::CheckExit, 0, 0, ctx.tb_idx));
        for c in ctx.consts() {
            buf.emit_u64(Word0::encode(HostOp::LoadConst, 0, reg(ctx, c.idx), 0, 0));
            buf.emit_u64(c.val);
        }
    }

    fn op_size(&self, _ctx: &Context, op: &Op) -> usize {
        match op.opc {
            Opcode::InsnStart
            | Opcode::SetLabel
            | Opcode::Nop
            | Opcode::Discard => 0,
            Opcode::Br
            | Opcode::BrCond
            | Opcode::GotoTb
            | Opcode::ExitTb
            | Opcode::Raise
            | Opcode::Call => 2 * WORD,
            _ => WORD,
        }
    }

    fn tcg_out_op(&self, buf: &mut CodeBuffer, ctx: &Context, op: &Op) {
        let ty = type_aux(op.op_type);
        let a = |n: usize| reg(ctx, op.args[n]);
        match op.opc {
            Opcode::InsnStart
            | Opcode::SetLabel
            | Opcode::Nop
            | Opcode::Discard => {}
            Opcode::Mov => {
                buf.emit_u64(Word0::encode(HostOp::Mov, ty, a(0), a(1), 0));
            }
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor
            | Opcode::Shl
            | Opcode::Shr
            | Opcode::Sar => {
                let hop = match op.opc {
                    Opcode::Add => HostOp::Add,
                    Opcode::Sub => HostOp::Sub,
                    Opcode::Mul => HostOp::Mul,
                    Opcode::And => HostOp::And,
                    Opcode::Or => HostOp::Or,
                    Opcode::Xor => HostOp::Xor,
                    Opcode::Shl => HostOp::Shl,
                    Opcode::Shr => HostOp::Shr,
                    _ => HostOp::Sar,
                };
                buf.emit_u64(Word0::encode(hop, ty, a(0), a(1), a(2)));
            }
            Opcode::Neg => {
                buf.emit_u64(Word0::encode(HostOp::Neg, ty, a(0), a(1), 0));
            }
            Opcode::Not => {
                buf.emit_u64(Word0::encode(HostOp::Not, ty, a(0), a(1), 0));
            }
            Opcode::ExtI32I64 => {
                buf.emit_u64(Word0::encode(HostOp::ExtS32, 0, a(0), a(1), 0));
            }
            Opcode::ExtUI32I64 => {
                buf.emit_u64(Word0::encode(HostOp::ExtU32, 0, a(0), a(1), 0));
            }
            Opcode::SetCond => {
                let aux = ty | (op.carg(0) as u8 & 0x1f);
                buf.emit_u64(Word0::encode(HostOp::SetCond, aux, a(0), a(1), a(2)));
            }
            Opcode::GuestLd => {
                let aux = ty | (op.carg(0) as u8 & 0x7);
                buf.emit_u64(Word0::encode(HostOp::GuestLd, aux, a(0), a(1), 0));
            }
            Opcode::GuestSt => {
                let aux = ty | (op.carg(0) as u8 & 0x7);
                buf.emit_u64(Word0::encode(HostOp::GuestSt, aux, a(0), a(1), 0));
            }
            Opcode::Br => {
                buf.emit_u64(Word0::encode(HostOp::Br, 0, 0, 0, 0));
                buf.emit_u64(label_value(ctx, op.carg(0)));
            }
            Opcode::BrCond => {
                let aux = ty | (op.carg(0) as u8 & 0x1f);
                buf.emit_u64(Word0::encode(HostOp::BrCond, aux, 0, a(0), a(1)));
                buf.emit_u64(label_value(ctx, op.carg(1)));
            }
            Opcode::GotoTb => {
                buf.emit_u64(Word0::encode(HostOp::GotoTb, op.carg(0) as u8, 0, 0, 0));
                // Link word, unlinked until the TB is chained.
                buf.emit_u64(0);
            }
            Opcode::ExitTb => {
                buf.emit_u64(Word0::encode(HostOp::ExitTb, 0, 0, 0, 0));
                buf.emit_u64((ctx.tb_idx as u64) << 32 | op.carg(0) as u64);
            }
            Opcode::Raise => {
                buf.emit_u64(Word0::encode(HostOp::Raise, 0, 0, 0, 0));
                buf.emit_u64(op.carg(0) as u64);
            }
            Opcode::Call => {
                buf.emit_u64(Word0::encode(HostOp::Call, 0, a(0), a(1), a(2)));
                buf.emit_u64((a(3) as u64) << 32 | op.carg(0) as u64);
            }
            Opcode::Mb => {
                buf.emit_u64(Word0::encode(HostOp::Mb, 0, 0, 0, 0));
            }
            Opcode::Count => unreachable!("sentinel opcode in op stream"),
        }
    }

    fn goto_tb_patch_offset(&self) -> usize {
        WORD
    }

    fn patch_jump(
        &self,
        code: CodeRegion,
        jump_offset: usize,
        target: Option<ChainTarget>,
    ) {
        let site = jump_offset + self.goto_tb_patch_offset();
        let word = target.map_or(0, encode_link);
        // SAFETY: `jump_offset` is a goto_tb recorded at generation
        // time; its link word is only ever accessed atomically.
        unsafe { code.link_word(site) }.store(word, Ordering::Release);
        fence(Ordering::SeqCst);
        self.flush_icache(code, site, WORD);
    }

    unsafe fn exec_tb(
        &self,
        code: CodeRegion,
        entry: usize,
        env: &mut [u64],
        rt: &mut dyn TbRuntime,
    ) -> HostExit {
        interp::tb_exec(code, entry, env, rt)
    }
}
