//! IR dump: human-readable text output for IR ops.

use std::fmt::Write as FmtWrite;
use std::io::Write;

use crate::context::Context;
use crate::op::Op;
use crate::opcode::Opcode;
use crate::temp::{TempIdx, TempKind};
use crate::types::{Cond, Type};

fn cond_name(c: u32) -> &'static str {
    Cond::from_u8(c as u8).map_or("???", Cond::name)
}

/// Format a temp reference for display.
fn fmt_temp(ctx: &Context, idx: TempIdx, buf: &mut String) {
    let i = idx.0 as usize;
    if i >= ctx.nb_temps() as usize {
        let _ = write!(buf, "$0x{:x}", idx.0);
        return;
    }
    let t = ctx.temp(idx);
    let _ = match t.kind {
        TempKind::Const => write!(buf, "$0x{:x}", t.val),
        TempKind::Global => match t.name {
            Some(name) => write!(buf, "{name}"),
            None => write!(buf, "g{i}"),
        },
        TempKind::Ebb => {
            let local = i as u32 - ctx.nb_globals();
            write!(buf, "tmp{local}")
        }
    };
}

/// Build the opcode name with type suffix for polymorphic ops.
fn op_name(op: &Op) -> String {
    let def = op.opc.def();
    if op.opc.is_int_polymorphic() {
        let suffix = match op.op_type {
            Type::I32 => "_i32",
            Type::I64 => "_i64",
        };
        format!("{}{suffix}", def.name)
    } else {
        def.name.to_string()
    }
}

/// Dump all IR ops in `ctx` to the given writer.
pub fn dump_ops(ctx: &Context, w: &mut impl Write) -> std::io::Result<()> {
    let mut buf = String::with_capacity(128);

    for op in ctx.ops() {
        match op.opc {
            Opcode::InsnStart => {
                let data = ctx.insn_data(op.carg(0));
                writeln!(w, " ---- 0x{:016x} 0x{:x}", data[0], data[1])?;
                continue;
            }
            Opcode::SetLabel => {
                writeln!(w, " L{}:", op.carg(0))?;
                continue;
            }
            _ => {}
        }

        buf.clear();
        buf.push(' ');
        buf.push_str(&op_name(op));
        let mut first = true;
        for &a in op.oargs().iter().chain(op.iargs()) {
            buf.push_str(if first { " " } else { ", " });
            first = false;
            fmt_temp(ctx, a, &mut buf);
        }

        let cargs = op.cargs();
        let sep = if first { " " } else { ", " };
        let _ = match op.opc {
            Opcode::BrCond => write!(
                buf,
                "{sep}{}, L{}",
                cond_name(cargs[0].0),
                cargs[1].0
            ),
            Opcode::SetCond => write!(buf, "{sep}{}", cond_name(cargs[0].0)),
            Opcode::Br => write!(buf, " L{}", cargs[0].0),
            Opcode::Call => write!(buf, "{sep}helper#{}", cargs[0].0),
            _ => {
                for (i, c) in cargs.iter().enumerate() {
                    let s = if i == 0 { sep } else { ", " };
                    let _ = write!(buf, "{s}$0x{:x}", c.0);
                }
                Ok(())
            }
        };

        writeln!(w, "{buf}")?;
    }
    Ok(())
}
