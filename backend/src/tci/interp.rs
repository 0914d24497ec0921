//! Threaded interpreter for the portable host target.

use std::sync::atomic::{fence, Ordering};

use tcg_core::tb::exit::TB_EXIT_REQUESTED;
use tcg_core::Type;

use super::insn::{decode_link, HostOp, Word0, ENV_FLAG, WORD};
use crate::code_buffer::CodeRegion;
use crate::{HostExit, TbRuntime};

/// Frame slots available to non-global temps.
pub const FRAME_WORDS: usize = tcg_core::context::MAX_TEMPS;

struct Regs<'a> {
    env: &'a mut [u64],
    frame: [u64; FRAME_WORDS],
}

impl Regs<'_> {
    #[inline]
    fn get(&self, r: u16) -> u64 {
        if r & ENV_FLAG != 0 {
            self.env[(r & !ENV_FLAG) as usize]
        } else {
            self.frame[r as usize]
        }
    }

    #[inline]
    fn set(&mut self, r: u16, val: u64) {
        if r & ENV_FLAG != 0 {
            self.env[(r & !ENV_FLAG) as usize] = val;
        } else {
            self.frame[r as usize] = val;
        }
    }
}

fn alu(op: HostOp, ty: Type, a: u64, b: u64) -> u64 {
    let bits = ty.size_bits();
    let sh = (b as u32) & (bits - 1);
    let r = match op {
        HostOp::Add => a.wrapping_add(b),
        HostOp::Sub => a.wrapping_sub(b),
        HostOp::Mul => a.wrapping_mul(b),
        HostOp::And => a & b,
        HostOp::Or => a | b,
        HostOp::Xor => a ^ b,
        HostOp::Shl => a.wrapping_shl(sh),
        HostOp::Shr => ty.mask(a).wrapping_shr(sh),
        HostOp::Sar => match ty {
            Type::I32 => ((a as u32 as i32) >> sh) as u32 as u64,
            Type::I64 => ((a as i64) >> sh) as u64,
        },
        _ => unreachable!("{op:?} is not a binary ALU op"),
    };
    ty.mask(r)
}

/// Run host code from `entry` until it leaves generated code.
///
/// # Safety
/// `entry` must be the entry of a published TB in `code`, every insn
/// reachable from it must be fully emitted, and the buffer owning
/// `code` must outlive the call.
pub unsafe fn tb_exec(
    code: CodeRegion,
    entry: usize,
    env: &mut [u64],
    rt: &mut dyn TbRuntime,
) -> HostExit {
    let mut regs = Regs {
        env,
        frame: [0; FRAME_WORDS],
    };
    let mut pc = entry;
    let mut stop_at: Option<usize> = None;

    loop {
        // Past the first stale instruction, whether by falling through
        // or by a forward branch.
        if stop_at.is_some_and(|off| pc >= off) {
            return HostExit::CodeModified { resume_off: pc };
        }
        let w = code.read_u64(pc);
        let Some(i) = Word0::decode(w) else {
            panic!("corrupt host code at {pc:#x}: {w:#018x}");
        };
        let ty = if i.is_i32() { Type::I32 } else { Type::I64 };
        let next = pc + i.op.size();

        match i.op {
            HostOp::CheckExit => {
                if rt.exit_requested() {
                    return HostExit::Exit {
                        tb: Word0::hi(w) as usize,
                        code: TB_EXIT_REQUESTED,
                    };
                }
            }
            HostOp::LoadConst => {
                regs.set(i.r0, code.read_u64(pc + WORD));
            }
            HostOp::Mov => {
                let v = regs.get(i.r1);
                regs.set(i.r0, ty.mask(v));
            }
            HostOp::Add
            | HostOp::Sub
            | HostOp::Mul
            | HostOp::And
            | HostOp::Or
            | HostOp::Xor
            | HostOp::Shl
            | HostOp::Shr
            | HostOp::Sar => {
                let v = alu(i.op, ty, regs.get(i.r1), regs.get(i.r2));
                regs.set(i.r0, v);
            }
            HostOp::Neg => {
                let v = 0u64.wrapping_sub(regs.get(i.r1));
                regs.set(i.r0, ty.mask(v));
            }
            HostOp::Not => {
                let v = !regs.get(i.r1);
                regs.set(i.r0, ty.mask(v));
            }
            HostOp::ExtS32 => {
                let v = regs.get(i.r1) as u32 as i32 as i64 as u64;
                regs.set(i.r0, v);
            }
            HostOp::ExtU32 => {
                let v = regs.get(i.r1) as u32 as u64;
                regs.set(i.r0, v);
            }
            HostOp::SetCond => {
                let cond = i.cond().unwrap_or_else(|| panic!("bad cond at {pc:#x}"));
                let v = cond.eval(ty, regs.get(i.r1), regs.get(i.r2));
                regs.set(i.r0, v as u64);
            }
            HostOp::GuestLd => {
                let memop = i.memop();
                let addr = regs.get(i.r1);
                match rt.load(pc, addr, memop) {
                    Ok(raw) => regs.set(i.r0, ty.mask(memop.extend(raw))),
                    Err(fault) => {
                        return HostExit::Fault { host_off: pc, fault };
                    }
                }
            }
            HostOp::GuestSt => {
                let addr = regs.get(i.r1);
                let val = regs.get(i.r0);
                match rt.store(pc, addr, i.memop(), val) {
                    Ok(Some(off)) => stop_at = Some(off),
                    Ok(None) => {}
                    Err(fault) => {
                        return HostExit::Fault { host_off: pc, fault };
                    }
                }
            }
            HostOp::Br => {
                pc = code.read_u64(pc + WORD) as usize;
                continue;
            }
            HostOp::BrCond => {
                let cond = i.cond().unwrap_or_else(|| panic!("bad cond at {pc:#x}"));
                if cond.eval(ty, regs.get(i.r1), regs.get(i.r2)) {
                    pc = code.read_u64(pc + WORD) as usize;
                    continue;
                }
            }
            HostOp::GotoTb => {
                let link = code.link_word(pc + WORD).load(Ordering::Acquire);
                if let Some(target) = decode_link(link) {
                    if rt.follow_chain(target) {
                        stop_at = None;
                        pc = target.host_offset;
                        continue;
                    }
                }
            }
            HostOp::ExitTb => {
                let v = code.read_u64(pc + WORD);
                return HostExit::Exit {
                    tb: (v >> 32) as usize,
                    code: v as u32,
                };
            }
            HostOp::Raise => {
                let excp = code.read_u64(pc + WORD) as u32;
                return HostExit::Exception { host_off: pc, excp };
            }
            HostOp::Call => {
                let w1 = code.read_u64(pc + WORD);
                let idx = w1 as u32;
                let Some(helper) = rt.helper(idx) else {
                    panic!("call to unknown helper #{idx} at {pc:#x}");
                };
                let args = [
                    regs.get(i.r1),
                    regs.get(i.r2),
                    regs.get((w1 >> 32) as u16),
                ];
                let v = helper(&mut *regs.env, args);
                regs.set(i.r0, v);
            }
            HostOp::Mb => fence(Ordering::SeqCst),
        }
        pc = next;
    }
}
