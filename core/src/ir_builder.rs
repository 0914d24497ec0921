//! Op emitters used by frontends to build the IR of a TB.
//!
//! Constant arguments (conditions, labels, memops, exit codes) travel
//! in the `args` array as raw `TempIdx` values.

use crate::context::Context;
use crate::op::Op;
use crate::opcode::Opcode;
use crate::tb::INSN_START_WORDS;
use crate::temp::TempIdx;
use crate::types::{Cond, MemOp, Type};

macro_rules! binary_ops {
    ($($name:ident => $opc:ident),* $(,)?) => {$(
        pub fn $name(&mut self, ty: Type, d: TempIdx, a: TempIdx, b: TempIdx) -> TempIdx {
            self.push(Opcode::$opc, ty, &[d, a, b]);
            d
        }
    )*};
}

macro_rules! unary_ops {
    ($($name:ident => $opc:ident),* $(,)?) => {$(
        pub fn $name(&mut self, ty: Type, d: TempIdx, s: TempIdx) -> TempIdx {
            self.push(Opcode::$opc, ty, &[d, s]);
            d
        }
    )*};
}

impl Context {
    fn push(&mut self, opc: Opcode, ty: Type, args: &[TempIdx]) {
        let op = Op::with_args(self.next_op_idx(), opc, ty, args);
        self.emit_op(op);
    }

    fn push_consts(&mut self, opc: Opcode, vals: &[u32]) {
        let args: Vec<TempIdx> = vals.iter().copied().map(TempIdx).collect();
        self.push(opc, Type::I64, &args);
    }

    binary_ops! {
        gen_add => Add,
        gen_sub => Sub,
        gen_mul => Mul,
        gen_and => And,
        gen_or => Or,
        gen_xor => Xor,
        gen_shl => Shl,
        gen_shr => Shr,
        gen_sar => Sar,
    }

    unary_ops! {
        gen_mov => Mov,
        gen_neg => Neg,
        gen_not => Not,
    }

    /// `d = a + imm`
    pub fn gen_addi(&mut self, ty: Type, d: TempIdx, a: TempIdx, imm: i64) -> TempIdx {
        let c = self.new_const(ty, imm as u64);
        self.gen_add(ty, d, a, c)
    }

    pub fn gen_movi(&mut self, ty: Type, d: TempIdx, val: u64) -> TempIdx {
        let c = self.new_const(ty, val);
        self.gen_mov(ty, d, c)
    }

    pub fn gen_ext_i32_i64(&mut self, d: TempIdx, s: TempIdx) -> TempIdx {
        self.push(Opcode::ExtI32I64, Type::I64, &[d, s]);
        d
    }

    pub fn gen_ext_u32_i64(&mut self, d: TempIdx, s: TempIdx) -> TempIdx {
        self.push(Opcode::ExtUI32I64, Type::I64, &[d, s]);
        d
    }

    /// `d = (a cond b) ? 1 : 0`
    pub fn gen_setcond(
        &mut self,
        ty: Type,
        d: TempIdx,
        a: TempIdx,
        b: TempIdx,
        cond: Cond,
    ) -> TempIdx {
        self.push(Opcode::SetCond, ty, &[d, a, b, TempIdx(cond as u32)]);
        d
    }

    pub fn gen_guest_ld(&mut self, ty: Type, d: TempIdx, addr: TempIdx, memop: MemOp) -> TempIdx {
        self.push(Opcode::GuestLd, ty, &[d, addr, TempIdx(memop.bits() as u32)]);
        d
    }

    pub fn gen_guest_st(&mut self, ty: Type, val: TempIdx, addr: TempIdx, memop: MemOp) {
        self.push(Opcode::GuestSt, ty, &[val, addr, TempIdx(memop.bits() as u32)]);
    }

    pub fn gen_br(&mut self, label: u32) {
        self.push_consts(Opcode::Br, &[label]);
    }

    pub fn gen_brcond(&mut self, ty: Type, a: TempIdx, b: TempIdx, cond: Cond, label: u32) {
        self.push(
            Opcode::BrCond,
            ty,
            &[a, b, TempIdx(cond as u32), TempIdx(label)],
        );
    }

    pub fn gen_set_label(&mut self, label: u32) {
        self.push_consts(Opcode::SetLabel, &[label]);
    }

    /// Direct jump through link slot `slot` (0 or 1).
    pub fn gen_goto_tb(&mut self, slot: u32) {
        assert!(slot < 2, "goto_tb slot out of range");
        self.push_consts(Opcode::GotoTb, &[slot]);
    }

    pub fn gen_exit_tb(&mut self, code: u32) {
        self.push_consts(Opcode::ExitTb, &[code]);
    }

    pub fn gen_raise(&mut self, excp: u32) {
        self.push_consts(Opcode::Raise, &[excp]);
    }

    /// `d = helper(env, args...)`; missing arguments read as zero.
    pub fn gen_call(&mut self, d: TempIdx, helper: u32, args: &[TempIdx]) -> TempIdx {
        assert!(args.len() <= 3, "helpers take at most three arguments");
        let zero = self.new_const(Type::I64, 0);
        let mut all = [d, zero, zero, zero, TempIdx(helper)];
        all[1..=args.len()].copy_from_slice(args);
        self.push(Opcode::Call, Type::I64, &all);
        d
    }

    pub fn gen_mb(&mut self, kind: u32) {
        self.push_consts(Opcode::Mb, &[kind]);
    }

    pub fn gen_discard(&mut self, ty: Type, t: TempIdx) {
        self.push(Opcode::Discard, ty, &[t]);
    }

    /// Open guest instruction number `n`, where `n` counts the
    /// `insn_start`s emitted so far in this TB.
    ///
    /// State recovery hands `data` back to the guest when a fault
    /// lands inside this instruction: its PC first, then any
    /// target-defined decode state.
    pub fn gen_insn_start(&mut self, data: [u64; INSN_START_WORDS]) {
        let n = self.push_insn_data(data);
        self.push_consts(Opcode::InsnStart, &[n]);
    }
}
