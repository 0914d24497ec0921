use tcg_backend::code_buffer::CodeBuffer;
use tcg_backend::tci::insn::{decode_link, encode_link, HostOp, Word0, AUX_I32, WORD};
use tcg_backend::{
    translate, ChainTarget, GenOutput, HostCodeGen, HostExit, TbRuntime, TciCodeGen,
};
use tcg_core::tb::exit::{TB_EXIT_IDX0, TB_EXIT_NOCHAIN, TB_EXIT_REQUESTED};
use tcg_core::{
    Cond, Context, FlatMemory, GuestMemory, HelperFn, MemFault, MemOp, TempIdx, Type,
};

/// Runtime backed by flat memory, recording what the code asked for.
struct TestRuntime {
    mem: FlatMemory,
    helpers: &'static [HelperFn],
    generation: u32,
    exit_requested: bool,
    /// Host offset returned by the next store, simulating a write to
    /// the running TB.
    stop_after_store: Option<usize>,
    followed: u32,
}

impl TestRuntime {
    fn new() -> Self {
        Self {
            mem: FlatMemory::new(0, 0x1000),
            helpers: &[],
            generation: 0,
            exit_requested: false,
            stop_after_store: None,
            followed: 0,
        }
    }
}

impl TbRuntime for TestRuntime {
    fn load(&mut self, _host_off: usize, addr: u64, memop: MemOp) -> Result<u64, MemFault> {
        self.mem.load(addr, memop)
    }

    fn store(
        &mut self,
        _host_off: usize,
        addr: u64,
        memop: MemOp,
        val: u64,
    ) -> Result<Option<usize>, MemFault> {
        self.mem.store(addr, memop, val)?;
        Ok(self.stop_after_store.take())
    }

    fn helper(&self, idx: u32) -> Option<HelperFn> {
        self.helpers.get(idx as usize).copied()
    }

    fn follow_chain(&mut self, target: ChainTarget) -> bool {
        if target.generation != self.generation {
            return false;
        }
        self.followed += 1;
        true
    }

    fn exit_requested(&self) -> bool {
        self.exit_requested
    }
}

const NREGS: u32 = 4;

fn new_ctx() -> Context {
    let mut ctx = Context::new();
    for (i, name) in ["r0", "r1", "r2", "r3"].into_iter().enumerate() {
        ctx.new_global(Type::I64, i as u32, name);
    }
    ctx
}

fn r(i: u32) -> TempIdx {
    assert!(i < NREGS);
    TempIdx(i)
}

fn emit(ctx: &mut Context, buf: &mut CodeBuffer) -> GenOutput {
    translate(ctx, &TciCodeGen, buf).expect("TB fits")
}

fn run(buf: &CodeBuffer, entry: usize, env: &mut [u64], rt: &mut TestRuntime) -> HostExit {
    // SAFETY: entry is a TB emitted into buf, which outlives the call.
    unsafe { TciCodeGen.exec_tb(buf.region(), entry, env, rt) }
}

// ── Arithmetic ──────────────────────────────────────────────

#[test]
fn test_alu_ops() {
    let mut ctx = new_ctx();
    let t = ctx.new_temp(Type::I64);
    ctx.gen_insn_start([0, 0]);
    ctx.gen_mul(Type::I64, t, r(0), r(1)); // 6 * 7
    ctx.gen_sub(Type::I64, r(2), t, r(1)); // 42 - 7
    ctx.gen_shl(Type::I64, r(3), r(1), r(1)); // 7 << 7
    ctx.gen_xor(Type::I64, r(0), r(0), r(0));
    ctx.gen_exit_tb(TB_EXIT_NOCHAIN);

    let mut buf = CodeBuffer::new(4096).unwrap();
    let out = emit(&mut ctx, &mut buf);
    let mut env = [6, 7, 0, 0];
    let exit = run(&buf, out.host_offset, &mut env, &mut TestRuntime::new());
    assert_eq!(exit, HostExit::Exit { tb: 0, code: TB_EXIT_NOCHAIN });
    assert_eq!(env, [0, 7, 35, 7 << 7]);
}

#[test]
fn test_i32_results_zero_extended() {
    let mut ctx = new_ctx();
    ctx.gen_insn_start([0, 0]);
    ctx.gen_add(Type::I32, r(2), r(0), r(1));
    ctx.gen_sar(Type::I32, r(3), r(0), r(1));
    ctx.gen_ext_i32_i64(r(1), r(0));
    ctx.gen_exit_tb(TB_EXIT_NOCHAIN);

    let mut buf = CodeBuffer::new(4096).unwrap();
    let out = emit(&mut ctx, &mut buf);
    let mut env = [0xFFFF_FFFF_8000_0000, 1, 0, 0];
    run(&buf, out.host_offset, &mut env, &mut TestRuntime::new());
    assert_eq!(env[2], 0x8000_0001);
    assert_eq!(env[3], 0xC000_0000);
    assert_eq!(env[1], 0xFFFF_FFFF_8000_0000);
}

#[test]
fn test_setcond_and_countdown_loop() {
    // r1 = sum(1..=r0) via a backward branch.
    let mut ctx = new_ctx();
    let top = ctx.new_label();
    let zero = ctx.new_const(Type::I64, 0);
    ctx.gen_insn_start([0, 0]);
    ctx.gen_set_label(top);
    ctx.gen_add(Type::I64, r(1), r(1), r(0));
    ctx.gen_addi(Type::I64, r(0), r(0), -1);
    ctx.gen_brcond(Type::I64, r(0), zero, Cond::Ne, top);
    ctx.gen_setcond(Type::I64, r(2), r(1), zero, Cond::Gtu);
    ctx.gen_exit_tb(TB_EXIT_NOCHAIN);

    let mut buf = CodeBuffer::new(4096).unwrap();
    let out = emit(&mut ctx, &mut buf);
    let mut env = [10, 0, 0, 0];
    run(&buf, out.host_offset, &mut env, &mut TestRuntime::new());
    assert_eq!(env[..3], [0, 55, 1]);
}

// ── Guest memory ────────────────────────────────────────────

#[test]
fn test_guest_load_store() {
    let mut ctx = new_ctx();
    ctx.gen_insn_start([0, 0]);
    ctx.gen_guest_st(Type::I64, r(1), r(0), MemOp::uq());
    ctx.gen_guest_ld(Type::I64, r(2), r(0), MemOp::sb());
    ctx.gen_guest_ld(Type::I32, r(3), r(0), MemOp::sw());
    ctx.gen_exit_tb(TB_EXIT_NOCHAIN);

    let mut buf = CodeBuffer::new(4096).unwrap();
    let out = emit(&mut ctx, &mut buf);
    let mut rt = TestRuntime::new();
    let mut env = [0x100, 0x8180, 0, 0];
    run(&buf, out.host_offset, &mut env, &mut rt);
    assert_eq!(env[2], 0xFFFF_FFFF_FFFF_FF80);
    // Sign-extended to 32 bits, kept zero-extended in the slot.
    assert_eq!(env[3], 0xFFFF_8180);
    assert_eq!(rt.mem.load(0x100, MemOp::uq()).unwrap(), 0x8180);
}

#[test]
fn test_fault_reports_faulting_insn() {
    let mut ctx = new_ctx();
    ctx.gen_insn_start([0x1000, 0]);
    ctx.gen_addi(Type::I64, r(1), r(1), 1);
    ctx.gen_insn_start([0x1004, 0]);
    ctx.gen_guest_ld(Type::I64, r(2), r(0), MemOp::uq());
    ctx.gen_exit_tb(TB_EXIT_NOCHAIN);

    let mut buf = CodeBuffer::new(4096).unwrap();
    let out = emit(&mut ctx, &mut buf);
    let mut env = [0xFFFF_0000, 0, 0, 0];
    let exit = run(&buf, out.host_offset, &mut env, &mut TestRuntime::new());
    let HostExit::Fault { host_off, fault } = exit else {
        panic!("expected fault, got {exit:?}");
    };
    assert_eq!(fault.addr, 0xFFFF_0000);
    assert!(!fault.write);
    // The faulting op lies inside the second instruction's code.
    let rel = (host_off - out.host_offset) as u32;
    assert!(rel >= out.search[1].host_off);
    // Work before the fault is committed.
    assert_eq!(env[1], 1);
}

#[test]
fn test_store_hitting_running_code_stops_at_boundary() {
    let mut ctx = new_ctx();
    ctx.gen_insn_start([0x1000, 0]);
    ctx.gen_guest_st(Type::I64, r(1), r(0), MemOp::uq());
    ctx.gen_insn_start([0x1004, 0]);
    ctx.gen_addi(Type::I64, r(2), r(2), 1);
    ctx.gen_exit_tb(TB_EXIT_NOCHAIN);

    let mut buf = CodeBuffer::new(4096).unwrap();
    let out = emit(&mut ctx, &mut buf);
    let resume = out.host_offset + out.search[1].host_off as usize;
    let mut rt = TestRuntime::new();
    rt.stop_after_store = Some(resume);
    let mut env = [0x10, 5, 0, 0];
    let exit = run(&buf, out.host_offset, &mut env, &mut rt);
    assert_eq!(exit, HostExit::CodeModified { resume_off: resume });
    assert_eq!(env[2], 0, "the next instruction must not run");
}

#[test]
fn test_store_then_forward_branch_stops_at_target() {
    let mut ctx = new_ctx();
    let skip = ctx.new_label();
    ctx.gen_insn_start([0x1000, 0]);
    ctx.gen_guest_st(Type::I64, r(1), r(0), MemOp::uq());
    ctx.gen_br(skip);
    ctx.gen_insn_start([0x1004, 0]);
    ctx.gen_addi(Type::I64, r(2), r(2), 1);
    ctx.gen_insn_start([0x1008, 0]);
    ctx.gen_set_label(skip);
    ctx.gen_addi(Type::I64, r(3), r(3), 1);
    ctx.gen_exit_tb(TB_EXIT_NOCHAIN);

    let mut buf = CodeBuffer::new(4096).unwrap();
    let out = emit(&mut ctx, &mut buf);
    let next = out.host_offset + out.search[1].host_off as usize;
    let target = out.host_offset + out.search[2].host_off as usize;
    let mut rt = TestRuntime::new();
    rt.stop_after_store = Some(next);
    let mut env = [0x10, 5, 0, 0];
    let exit = run(&buf, out.host_offset, &mut env, &mut rt);
    assert_eq!(exit, HostExit::CodeModified { resume_off: target });
    assert_eq!(env[2..], [0, 0], "stale code ran after the store");
}

// ── Exits ───────────────────────────────────────────────────

#[test]
fn test_raise_reports_offset() {
    let mut ctx = new_ctx();
    ctx.gen_insn_start([0x2000, 0]);
    ctx.gen_raise(9);

    let mut buf = CodeBuffer::new(4096).unwrap();
    let out = emit(&mut ctx, &mut buf);
    let exit = run(&buf, out.host_offset, &mut [0; 4], &mut TestRuntime::new());
    assert_eq!(
        exit,
        HostExit::Exception {
            host_off: out.host_offset + out.search[0].host_off as usize,
            excp: 9
        }
    );
}

#[test]
fn test_check_exit_at_entry() {
    let mut ctx = new_ctx();
    ctx.tb_idx = 17;
    ctx.gen_insn_start([0, 0]);
    ctx.gen_addi(Type::I64, r(0), r(0), 1);
    ctx.gen_exit_tb(TB_EXIT_NOCHAIN);

    let mut buf = CodeBuffer::new(4096).unwrap();
    let out = emit(&mut ctx, &mut buf);
    let mut rt = TestRuntime::new();
    rt.exit_requested = true;
    let mut env = [0; 4];
    let exit = run(&buf, out.host_offset, &mut env, &mut rt);
    assert_eq!(exit, HostExit::Exit { tb: 17, code: TB_EXIT_REQUESTED });
    assert_eq!(env[0], 0);
}

fn helper_add3(_env: &mut [u64], args: [u64; 3]) -> u64 {
    args[0] + args[1] + args[2]
}

fn helper_write_env(env: &mut [u64], args: [u64; 3]) -> u64 {
    env[3] = args[0];
    0
}

static HELPERS: [HelperFn; 2] = [helper_add3, helper_write_env];

#[test]
fn test_helper_call() {
    let mut ctx = new_ctx();
    ctx.gen_insn_start([0, 0]);
    ctx.gen_call(r(2), 0, &[r(0), r(1), r(1)]);
    let t = ctx.new_temp(Type::I64);
    ctx.gen_call(t, 1, &[r(2)]);
    ctx.gen_exit_tb(TB_EXIT_NOCHAIN);

    let mut buf = CodeBuffer::new(4096).unwrap();
    let out = emit(&mut ctx, &mut buf);
    let mut rt = TestRuntime::new();
    rt.helpers = &HELPERS;
    let mut env = [1, 2, 0, 0];
    run(&buf, out.host_offset, &mut env, &mut rt);
    assert_eq!(env[2], 5);
    assert_eq!(env[3], 5);
}

#[test]
#[should_panic(expected = "call to unknown helper")]
fn test_unknown_helper_panics() {
    let mut ctx = new_ctx();
    ctx.gen_insn_start([0, 0]);
    ctx.gen_call(r(0), 4, &[]);
    ctx.gen_exit_tb(TB_EXIT_NOCHAIN);

    let mut buf = CodeBuffer::new(4096).unwrap();
    let out = emit(&mut ctx, &mut buf);
    run(&buf, out.host_offset, &mut [0; 4], &mut TestRuntime::new());
}

// ── Chaining ────────────────────────────────────────────────

/// TB A: r0 += 1, then goto_tb 0. TB B: r1 += 1, exit.
fn two_tbs(buf: &mut CodeBuffer) -> (GenOutput, GenOutput) {
    let mut a = new_ctx();
    a.gen_insn_start([0x1000, 0]);
    a.gen_addi(Type::I64, r(0), r(0), 1);
    a.gen_goto_tb(0);
    a.gen_exit_tb(TB_EXIT_IDX0);
    let out_a = emit(&mut a, buf);

    let mut b = new_ctx();
    b.tb_idx = 1;
    b.gen_insn_start([0x2000, 0]);
    b.gen_addi(Type::I64, r(1), r(1), 1);
    b.gen_exit_tb(TB_EXIT_NOCHAIN);
    let out_b = emit(&mut b, buf);
    (out_a, out_b)
}

#[test]
fn test_unlinked_goto_tb_falls_through_to_exit() {
    let mut buf = CodeBuffer::new(4096).unwrap();
    let (a, _) = two_tbs(&mut buf);
    let mut env = [0; 4];
    let exit = run(&buf, a.host_offset, &mut env, &mut TestRuntime::new());
    assert_eq!(exit, HostExit::Exit { tb: 0, code: TB_EXIT_IDX0 });
    assert_eq!(env[..2], [1, 0]);
}

#[test]
fn test_linked_goto_tb_enters_target() {
    let mut buf = CodeBuffer::new(4096).unwrap();
    let (a, b) = two_tbs(&mut buf);
    let site = a.jmp_insn_offset[0].unwrap() as usize;
    let target = ChainTarget {
        host_offset: b.host_offset,
        generation: 3,
    };
    TciCodeGen.patch_jump(buf.region(), site, Some(target));

    let mut rt = TestRuntime::new();
    rt.generation = 3;
    let mut env = [0; 4];
    let exit = run(&buf, a.host_offset, &mut env, &mut rt);
    assert_eq!(exit, HostExit::Exit { tb: 1, code: TB_EXIT_NOCHAIN });
    assert_eq!(env[..2], [1, 1]);
    assert_eq!(rt.followed, 1);
}

#[test]
fn test_stale_generation_not_followed() {
    let mut buf = CodeBuffer::new(4096).unwrap();
    let (a, b) = two_tbs(&mut buf);
    let site = a.jmp_insn_offset[0].unwrap() as usize;
    let target = ChainTarget {
        host_offset: b.host_offset,
        generation: 3,
    };
    TciCodeGen.patch_jump(buf.region(), site, Some(target));

    let mut rt = TestRuntime::new();
    rt.generation = 4;
    let mut env = [0; 4];
    let exit = run(&buf, a.host_offset, &mut env, &mut rt);
    assert_eq!(exit, HostExit::Exit { tb: 0, code: TB_EXIT_IDX0 });
    assert_eq!(env[1], 0);
}

#[test]
fn test_unpatch_restores_exit() {
    let mut buf = CodeBuffer::new(4096).unwrap();
    let (a, b) = two_tbs(&mut buf);
    let site = a.jmp_insn_offset[0].unwrap() as usize;
    let target = ChainTarget {
        host_offset: b.host_offset,
        generation: 0,
    };
    TciCodeGen.patch_jump(buf.region(), site, Some(target));
    TciCodeGen.patch_jump(buf.region(), site, None);
    // SAFETY: site is a goto_tb emitted into buf.
    let link = unsafe { buf.region().read_u64(site + WORD) };
    assert_eq!(link, 0);
    let exit = run(&buf, a.host_offset, &mut [0; 4], &mut TestRuntime::new());
    assert_eq!(exit, HostExit::Exit { tb: 0, code: TB_EXIT_IDX0 });
}

// ── Encoding ────────────────────────────────────────────────

#[test]
fn test_word0_fields() {
    let w = Word0::encode(HostOp::Add, AUX_I32, 1, 0x8002, 3);
    let d = Word0::decode(w).unwrap();
    assert_eq!(d.op, HostOp::Add);
    assert!(d.is_i32());
    assert_eq!((d.r0, d.r1, d.r2), (1, 0x8002, 3));
    assert_eq!(Word0::hi(Word0::encode_wide(HostOp::CheckExit, 0, 0, 99)), 99);
    assert!(Word0::decode(0).is_none());
    assert!(Word0::decode(0xFF).is_none());
}

#[test]
fn test_link_encoding() {
    assert_eq!(decode_link(0), None);
    let t = ChainTarget {
        host_offset: 0,
        generation: 7,
    };
    // Offset 0 must stay distinguishable from "unlinked".
    assert_ne!(encode_link(t), 0);
    assert_eq!(decode_link(encode_link(t)), Some(t));
}

#[test]
fn test_op_sizes() {
    assert_eq!(HostOp::Add.size(), WORD);
    assert_eq!(HostOp::GotoTb.size(), 2 * WORD);
    assert_eq!(HostOp::LoadConst.size(), 2 * WORD);
    assert_eq!(HostOp::from_u8(HostOp::Mb as u8), Some(HostOp::Mb));
}
