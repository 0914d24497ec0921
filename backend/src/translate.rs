use crate::code_buffer::CodeBuffer;
use crate::optimize::optimize;
use crate::HostCodeGen;
use tcg_core::op::OpIdx;
use tcg_core::{Context, InsnSearch, Opcode};

/// Host code generated for one TB.
#[derive(Debug, Clone)]
pub struct GenOutput {
    /// Buffer offset of the TB's entry.
    pub host_offset: usize,
    pub host_size: usize,
    /// One row per guest instruction, sorted by host offset.
    pub search: Vec<InsnSearch>,
    /// Buffer offset of each `goto_tb` slot used.
    pub jmp_insn_offset: [Option<u32>; 2],
}

/// Full translation pipeline: optimize -> layout -> emit.
///
/// Layout assigns every label its final offset from the backend's op
/// sizes, so emission is a single pass. Returns `None`, with the
/// buffer untouched, when the TB does not fit in the remaining space.
pub fn translate(
    ctx: &mut Context,
    backend: &impl HostCodeGen,
    buf: &mut CodeBuffer,
) -> Option<GenOutput> {
    optimize(ctx);

    let start = buf.offset();
    let mut off = start + backend.tb_start_size(ctx);
    for i in 0..ctx.num_ops() {
        let op = ctx.op(OpIdx(i as u32));
        if op.opc == Opcode::SetLabel {
            let id = op.carg(0);
            ctx.label_mut(id).place(off);
            continue;
        }
        off += backend.op_size(ctx, op);
    }
    let host_size = off - start;
    if host_size > buf.remaining() {
        return None;
    }

    backend.emit_tb_start(buf, ctx);
    let mut search = Vec::with_capacity(ctx.num_insns());
    let mut jmp_insn_offset = [None; 2];
    for op in ctx.ops() {
        match op.opc {
            Opcode::InsnStart => search.push(InsnSearch {
                host_off: (buf.offset() - start) as u32,
                data: *ctx.insn_data(op.carg(0)),
            }),
            Opcode::GotoTb => {
                jmp_insn_offset[op.carg(0) as usize] = Some(buf.offset() as u32);
            }
            _ => {}
        }
        let before = buf.offset();
        backend.tcg_out_op(buf, ctx, op);
        debug_assert_eq!(
            buf.offset() - before,
            backend.op_size(ctx, op),
            "{:?} emitted a different size than laid out",
            op.opc
        );
    }
    assert_eq!(buf.offset() - start, host_size, "layout/emission mismatch");

    Some(GenOutput {
        host_offset: start,
        host_size,
        search,
        jmp_insn_offset,
    })
}
