use tcg_backend::code_buffer::CodeBuffer;
use tcg_backend::tci::insn::WORD;
use tcg_backend::{translate, HostCodeGen, TciCodeGen};
use tcg_core::tb::exit::TB_EXIT_NOCHAIN;
use tcg_core::{Cond, Context, TempIdx, Type};

/// Three guest insns: add, a conditional goto_tb pair, exit.
fn sample_ctx() -> Context {
    let mut ctx = Context::new();
    let r0 = ctx.new_global(Type::I64, 0, "r0");
    let r1 = ctx.new_global(Type::I64, 1, "r1");
    let l = ctx.new_label();
    ctx.gen_insn_start([0x1000, 0]);
    ctx.gen_add(Type::I64, r0, r0, r1);
    ctx.gen_insn_start([0x1004, 0]);
    ctx.gen_brcond(Type::I64, r0, r1, Cond::Eq, l);
    ctx.gen_goto_tb(0);
    ctx.gen_exit_tb(0);
    ctx.gen_set_label(l);
    ctx.gen_goto_tb(1);
    ctx.gen_exit_tb(1);
    ctx
}

#[test]
fn test_layout_matches_emission() {
    let mut ctx = sample_ctx();
    let mut buf = CodeBuffer::new(4096).unwrap();
    buf.emit_u64(0);
    let out = translate(&mut ctx, &TciCodeGen, &mut buf).unwrap();
    assert_eq!(out.host_offset, WORD);
    assert_eq!(out.host_offset + out.host_size, buf.offset());
}

#[test]
fn test_search_rows_per_insn() {
    let mut ctx = sample_ctx();
    let mut buf = CodeBuffer::new(4096).unwrap();
    let out = translate(&mut ctx, &TciCodeGen, &mut buf).unwrap();
    assert_eq!(out.search.len(), 2);
    assert_eq!(out.search[0].data, [0x1000, 0]);
    assert_eq!(out.search[1].data, [0x1004, 0]);
    // Rows start after the entry sequence and are sorted.
    let prologue = TciCodeGen.tb_start_size(&ctx) as u32;
    assert_eq!(out.search[0].host_off, prologue);
    assert!(out.search[0].host_off < out.search[1].host_off);
}

#[test]
fn test_goto_tb_sites_recorded() {
    let mut ctx = sample_ctx();
    let mut buf = CodeBuffer::new(4096).unwrap();
    let out = translate(&mut ctx, &TciCodeGen, &mut buf).unwrap();
    let [j0, j1] = out.jmp_insn_offset;
    let (j0, j1) = (j0.unwrap() as usize, j1.unwrap() as usize);
    assert!(j0 < j1);
    let code = buf.region();
    // SAFETY: both sites were emitted; link words start unlinked.
    unsafe {
        assert_eq!(code.read_u64(j0 + TciCodeGen.goto_tb_patch_offset()), 0);
        assert_eq!(code.read_u64(j1 + TciCodeGen.goto_tb_patch_offset()), 0);
    }
}

#[test]
fn test_labels_resolved_before_emission() {
    let mut ctx = sample_ctx();
    let mut buf = CodeBuffer::new(4096).unwrap();
    let out = translate(&mut ctx, &TciCodeGen, &mut buf).unwrap();
    // The label sits on the second goto_tb.
    assert_eq!(ctx.label(0).offset, Some(out.jmp_insn_offset[1].unwrap() as usize));
}

#[test]
fn test_no_room_leaves_buffer_untouched() {
    let mut ctx = sample_ctx();
    let mut buf = CodeBuffer::new(4096).unwrap();
    let fill = buf.capacity() - 2 * WORD;
    buf.set_offset(fill);
    assert!(translate(&mut ctx, &TciCodeGen, &mut buf).is_none());
    assert_eq!(buf.offset(), fill);
}

#[test]
fn test_consts_loaded_in_prologue() {
    let mut ctx = Context::new();
    let r0 = ctx.new_global(Type::I64, 0, "r0");
    ctx.gen_insn_start([0, 0]);
    ctx.gen_addi(Type::I64, r0, r0, 5);
    ctx.gen_exit_tb(TB_EXIT_NOCHAIN);
    let mut buf = CodeBuffer::new(4096).unwrap();
    let out = translate(&mut ctx, &TciCodeGen, &mut buf).unwrap();
    // check_exit + one constant load (two words).
    assert_eq!(out.search[0].host_off as usize, 3 * WORD);
    assert_eq!(ctx.consts().count(), 1);
    assert_eq!(ctx.temp(TempIdx(1)).val, 5);
}
