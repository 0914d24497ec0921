//! Forward pass over the IR of one TB: constant folding, copy
//! propagation and algebraic simplification.
//!
//! Facts are only trusted inside an extended basic block. A label may
//! be reached from anywhere, so everything is dropped there; helper
//! calls may rewrite any env word, so globals are dropped there.

use tcg_core::op::{Op, OpIdx};
use tcg_core::opcode::Opcode;
use tcg_core::temp::TempIdx;
use tcg_core::types::{Cond, Type};
use tcg_core::Context;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Fact {
    #[default]
    Unknown,
    Const(u64),
    CopyOf(TempIdx),
}

struct Pass<'a> {
    ctx: &'a mut Context,
    facts: Vec<Fact>,
}

pub fn optimize(ctx: &mut Context) {
    let nb_temps = ctx.nb_temps() as usize;
    let mut pass = Pass {
        ctx,
        facts: vec![Fact::Unknown; nb_temps],
    };
    for i in 0..pass.ctx.num_ops() {
        pass.visit(OpIdx(i as u32));
    }
}

impl Pass<'_> {
    fn visit(&mut self, oi: OpIdx) {
        let (opc, ty) = {
            let op = self.ctx.op(oi);
            (op.opc, op.op_type)
        };
        match opc {
            Opcode::SetLabel => {
                self.facts.fill(Fact::Unknown);
                return;
            }
            Opcode::Br | Opcode::GotoTb | Opcode::ExitTb | Opcode::Raise => {
                self.forget_copies();
                return;
            }
            _ => {}
        }

        self.propagate_copies(oi);
        let a = self.ctx.op(oi).args;
        match opc {
            Opcode::Call => {
                self.kill_outputs(oi);
                for g in 0..self.ctx.nb_globals() {
                    self.kill(TempIdx(g));
                }
                self.forget_copies();
            }
            Opcode::Mov => self.fold_mov(a[0], a[1], ty),
            Opcode::Neg | Opcode::Not => self.fold_unary(oi, opc, ty, a[0], a[1]),
            Opcode::ExtI32I64 | Opcode::ExtUI32I64 => self.fold_ext(oi, opc, a[0], a[1]),
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor
            | Opcode::Shl
            | Opcode::Shr
            | Opcode::Sar => self.fold_binary(oi, opc, ty, a[0], a[1], a[2]),
            Opcode::SetCond => {
                let cond = Cond::from_u8(a[3].0 as u8);
                match (cond, self.konst(a[1]), self.konst(a[2])) {
                    (Some(c), Some(x), Some(y)) => {
                        self.to_const(oi, ty, a[0], c.eval(ty, x, y) as u64)
                    }
                    _ => self.kill(a[0]),
                }
            }
            Opcode::BrCond => {
                let cond = Cond::from_u8(a[2].0 as u8);
                if let (Some(c), Some(x), Some(y)) = (cond, self.konst(a[0]), self.konst(a[1])) {
                    if c.eval(ty, x, y) {
                        self.rewrite(oi, Opcode::Br, ty, &[a[3]]);
                    } else {
                        self.rewrite(oi, Opcode::Nop, ty, &[]);
                    }
                }
            }
            _ => self.kill_outputs(oi),
        }
    }

    // ── Facts ───────────────────────────────────────────────

    fn fact(&self, t: TempIdx) -> Fact {
        let temp = self.ctx.temp(t);
        if temp.is_const() {
            return Fact::Const(temp.val);
        }
        self.facts.get(t.0 as usize).copied().unwrap_or_default()
    }

    fn konst(&self, t: TempIdx) -> Option<u64> {
        match self.fact(t) {
            Fact::Const(v) => Some(v),
            _ => None,
        }
    }

    /// `t` is being redefined: drop its fact and every copy of it.
    fn kill(&mut self, t: TempIdx) {
        let i = t.0 as usize;
        if i >= self.facts.len() {
            self.facts.resize(i + 1, Fact::Unknown);
        }
        self.facts[i] = Fact::Unknown;
        for f in &mut self.facts {
            if *f == Fact::CopyOf(t) {
                *f = Fact::Unknown;
            }
        }
    }

    fn set(&mut self, t: TempIdx, fact: Fact) {
        self.kill(t);
        self.facts[t.0 as usize] = fact;
    }

    fn forget_copies(&mut self) {
        for f in &mut self.facts {
            if matches!(f, Fact::CopyOf(_)) {
                *f = Fact::Unknown;
            }
        }
    }

    fn kill_outputs(&mut self, oi: OpIdx) {
        let outs: Vec<TempIdx> = self.ctx.op(oi).oargs().to_vec();
        for t in outs {
            self.kill(t);
        }
    }

    /// Replace each input by the temp it is a copy of.
    fn propagate_copies(&mut self, oi: OpIdx) {
        let def = self.ctx.op(oi).opc.def();
        let start = def.nb_oargs as usize;
        for slot in start..start + def.nb_iargs as usize {
            if let Fact::CopyOf(src) = self.fact(self.ctx.op(oi).args[slot]) {
                self.ctx.op_mut(oi).args[slot] = src;
            }
        }
    }

    // ── Rewrites ────────────────────────────────────────────

    fn rewrite(&mut self, oi: OpIdx, opc: Opcode, ty: Type, args: &[TempIdx]) {
        *self.ctx.op_mut(oi) = Op::with_args(oi, opc, ty, args);
    }

    fn to_const(&mut self, oi: OpIdx, ty: Type, dst: TempIdx, val: u64) {
        let val = ty.mask(val);
        let c = self.ctx.new_const(ty, val);
        self.rewrite(oi, Opcode::Mov, ty, &[dst, c]);
        self.set(dst, Fact::Const(val));
    }

    fn to_mov(&mut self, oi: OpIdx, ty: Type, dst: TempIdx, src: TempIdx) {
        self.rewrite(oi, Opcode::Mov, ty, &[dst, src]);
        self.fold_mov(dst, src, ty);
    }

    // ── Folding ─────────────────────────────────────────────

    fn fold_mov(&mut self, dst: TempIdx, src: TempIdx, ty: Type) {
        if dst == src {
            return;
        }
        match self.fact(src) {
            Fact::Const(v) => self.set(dst, Fact::Const(ty.mask(v))),
            _ => self.set(dst, Fact::CopyOf(src)),
        }
    }

    fn fold_unary(&mut self, oi: OpIdx, opc: Opcode, ty: Type, dst: TempIdx, src: TempIdx) {
        let Some(v) = self.konst(src) else {
            self.kill(dst);
            return;
        };
        let r = match opc {
            Opcode::Neg => v.wrapping_neg(),
            _ => !v,
        };
        self.to_const(oi, ty, dst, r);
    }

    fn fold_ext(&mut self, oi: OpIdx, opc: Opcode, dst: TempIdx, src: TempIdx) {
        let Some(v) = self.konst(src) else {
            self.kill(dst);
            return;
        };
        let r = match opc {
            Opcode::ExtI32I64 => v as u32 as i32 as i64 as u64,
            _ => v as u32 as u64,
        };
        self.to_const(oi, Type::I64, dst, r);
    }

    fn fold_binary(
        &mut self,
        oi: OpIdx,
        opc: Opcode,
        ty: Type,
        dst: TempIdx,
        a: TempIdx,
        b: TempIdx,
    ) {
        use Opcode::*;

        let ca = self.konst(a).map(|v| ty.mask(v));
        let cb = self.konst(b).map(|v| ty.mask(v));
        if let (Some(x), Some(y)) = (ca, cb) {
            if let Some(r) = eval_binary(opc, ty, x, y) {
                return self.to_const(oi, ty, dst, r);
            }
        }

        let ones = ty.mask(u64::MAX);
        match (opc, ca, cb) {
            (Add | Sub | Or | Xor | Shl | Shr | Sar, _, Some(0)) | (Mul, _, Some(1)) => {
                self.to_mov(oi, ty, dst, a)
            }
            (Add | Or | Xor, Some(0), _) | (Mul, Some(1), _) => self.to_mov(oi, ty, dst, b),
            (And, _, Some(y)) if y == ones => self.to_mov(oi, ty, dst, a),
            (And, Some(x), _) if x == ones => self.to_mov(oi, ty, dst, b),
            (Mul | And, _, Some(0)) | (Mul | And | Shl | Shr | Sar, Some(0), _) => {
                self.to_const(oi, ty, dst, 0)
            }
            (Or, _, Some(y)) if y == ones => self.to_const(oi, ty, dst, ones),
            (Or, Some(x), _) if x == ones => self.to_const(oi, ty, dst, ones),
            (Sub, Some(0), _) => {
                self.rewrite(oi, Neg, ty, &[dst, b]);
                self.kill(dst);
            }
            (And | Or, _, _) if a == b => self.to_mov(oi, ty, dst, a),
            (Xor | Sub, _, _) if a == b => self.to_const(oi, ty, dst, 0),
            _ => self.kill(dst),
        }
    }
}

/// Fold a binary op on two constants of type `ty`.
fn eval_binary(opc: Opcode, ty: Type, a: u64, b: u64) -> Option<u64> {
    let sh = (b as u32) % ty.size_bits();
    let r = match opc {
        Opcode::Add => a.wrapping_add(b),
        Opcode::Sub => a.wrapping_sub(b),
        Opcode::Mul => a.wrapping_mul(b),
        Opcode::And => a & b,
        Opcode::Or => a | b,
        Opcode::Xor => a ^ b,
        Opcode::Shl => a << sh,
        Opcode::Shr => a >> sh,
        Opcode::Sar => match ty {
            Type::I32 => ((a as u32 as i32) >> sh) as u32 as u64,
            Type::I64 => ((a as i64) >> sh) as u64,
        },
        _ => return None,
    };
    Some(ty.mask(r))
}
