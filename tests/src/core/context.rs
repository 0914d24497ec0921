use tcg_core::dump::dump_ops;
use tcg_core::opcode::Opcode;
use tcg_core::temp::TempKind;
use tcg_core::{Context, Cond, MemOp, TempIdx, Type};

fn ctx_with_globals() -> Context {
    let mut ctx = Context::new();
    ctx.new_global(Type::I64, 0, "r0");
    ctx.new_global(Type::I64, 1, "r1");
    ctx.new_global(Type::I64, 2, "pc");
    ctx
}

#[test]
fn globals_come_first() {
    let mut ctx = ctx_with_globals();
    assert_eq!(ctx.nb_globals(), 3);
    let t = ctx.new_temp(Type::I64);
    assert_eq!(t, TempIdx(3));
    assert_eq!(ctx.temp(TempIdx(1)).kind, TempKind::Global);
    assert_eq!(ctx.temp(TempIdx(1)).env_word, 1);
    assert_eq!(ctx.temp(t).kind, TempKind::Ebb);
}

#[test]
#[should_panic(expected = "globals must be registered before locals")]
fn global_after_local_panics() {
    let mut ctx = Context::new();
    ctx.new_temp(Type::I64);
    ctx.new_global(Type::I64, 0, "late");
}

#[test]
fn reset_preserves_globals() {
    let mut ctx = ctx_with_globals();
    let t = ctx.new_temp(Type::I64);
    ctx.gen_movi(Type::I64, t, 5);
    ctx.new_label();
    ctx.gen_insn_start([0x1000, 0]);
    ctx.tb_idx = 9;

    ctx.reset();
    assert_eq!(ctx.nb_globals(), 3);
    assert_eq!(ctx.nb_temps(), 3);
    assert_eq!(ctx.num_ops(), 0);
    assert!(ctx.labels().is_empty());
    assert_eq!(ctx.num_insns(), 0);
    assert_eq!(ctx.tb_idx, 0);
    assert_eq!(ctx.temp(TempIdx(2)).name, Some("pc"));
}

#[test]
fn consts_are_deduplicated_per_type() {
    let mut ctx = Context::new();
    let a = ctx.new_const(Type::I64, 42);
    let b = ctx.new_const(Type::I64, 42);
    let c = ctx.new_const(Type::I32, 42);
    assert_eq!(a, b);
    assert_ne!(a, c);
    // I32 constants are stored truncated.
    let d = ctx.new_const(Type::I32, 0x1_0000_002A);
    assert_eq!(c, d);
    assert_eq!(ctx.consts().count(), 2);
}

#[test]
fn insn_start_records_data() {
    let mut ctx = ctx_with_globals();
    ctx.gen_insn_start([0x1000, 1]);
    ctx.gen_insn_start([0x1004, 2]);
    assert_eq!(ctx.num_insns(), 2);
    assert_eq!(ctx.insn_data(1), &[0x1004, 2]);
    let starts: Vec<u32> = ctx
        .ops()
        .iter()
        .filter(|op| op.opc == Opcode::InsnStart)
        .map(|op| op.carg(0))
        .collect();
    assert_eq!(starts, vec![0, 1]);
}

#[test]
fn op_arg_views() {
    let mut ctx = ctx_with_globals();
    let l = ctx.new_label();
    ctx.gen_brcond(Type::I64, TempIdx(0), TempIdx(1), Cond::Ltu, l);
    let op = &ctx.ops()[0];
    assert!(op.oargs().is_empty());
    assert_eq!(op.iargs(), &[TempIdx(0), TempIdx(1)]);
    assert_eq!(op.carg(0), Cond::Ltu as u32);
    assert_eq!(op.carg(1), l);
}

#[test]
fn call_pads_missing_args() {
    let mut ctx = ctx_with_globals();
    let d = ctx.new_temp(Type::I64);
    ctx.gen_call(d, 3, &[TempIdx(1)]);
    let op = ctx.ops().last().unwrap();
    assert_eq!(op.opc, Opcode::Call);
    assert_eq!(op.oargs(), &[d]);
    assert_eq!(op.iargs()[0], TempIdx(1));
    assert!(ctx.temp(op.iargs()[1]).is_const());
    assert_eq!(op.carg(0), 3);
}

#[test]
#[should_panic(expected = "goto_tb slot out of range")]
fn goto_tb_slot_checked() {
    let mut ctx = Context::new();
    ctx.gen_goto_tb(2);
}

#[test]
fn dump_ops_format() {
    let mut ctx = ctx_with_globals();
    let t = ctx.new_temp(Type::I64);
    let l = ctx.new_label();
    ctx.gen_insn_start([0x1000, 0]);
    ctx.gen_addi(Type::I64, t, TempIdx(1), 4);
    ctx.gen_guest_ld(Type::I64, TempIdx(0), t, MemOp::uq());
    ctx.gen_brcond(Type::I64, TempIdx(0), TempIdx(1), Cond::Eq, l);
    ctx.gen_set_label(l);
    ctx.gen_exit_tb(2);

    let mut out = Vec::new();
    dump_ops(&ctx, &mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains(" ---- 0x0000000000001000 0x0"), "{text}");
    assert!(text.contains("r1"), "{text}");
    assert!(text.contains("eq, L0"), "{text}");
    assert!(text.contains(" L0:"), "{text}");
}
