use std::sync::Arc;

use tracing::{debug, error, trace};

use tcg_backend::translate::translate;
use tcg_backend::{ChainTarget, HostCodeGen, HostExit, TbRuntime};
use tcg_core::dump::dump_ops;
use tcg_core::memory::{page_of, same_page};
use tcg_core::tb::cflags::{
    CF_COUNT_MASK, CF_NOCACHE, CF_PARALLEL, CF_SINGLE_STEP,
};
use tcg_core::tb::excp::{
    EXCP_ATOMIC, EXCP_DEBUG, EXCP_HALTED, EXCP_HLT, EXCP_INTERRUPT, EXCP_YIELD,
};
use tcg_core::tb::exit::{
    TB_EXIT_IDX0, TB_EXIT_IDX1, TB_EXIT_NOCHAIN, TB_EXIT_REQUESTED,
};
use tcg_core::{
    GuestMemory, HelperFn, MemFault, MemOp, TbState, TranslationBlock,
};

use crate::control::interrupt::{
    CPU_INTERRUPT_DEBUG, CPU_INTERRUPT_EXITTB, CPU_INTERRUPT_HALT,
    CPU_INTERRUPT_HARD,
};
use crate::stats::SharedStats;
use crate::{
    CpuControl, ExecEnv, GuestCpu, SharedState, MIN_CODE_BUF_REMAINING,
};

/// Reason `cpu_exec` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Guest exception the CPU did not handle itself (syscall, trap).
    Exception(u32),
    /// An exit was requested or the CPU yielded.
    Interrupted,
    /// The CPU halted and has no work.
    Halted,
    /// Single step finished or a debug event fired.
    Debug,
}

/// Services for one run of generated code.
struct ExecRuntime<'a, B: HostCodeGen> {
    shared: &'a SharedState<B>,
    ctl: &'a CpuControl,
    mem: &'a mut dyn GuestMemory,
    helpers: &'static [HelperFn],
    /// Running inside our own exclusive section.
    exclusive: bool,
    chained: u64,
}

impl<B: HostCodeGen> TbRuntime for ExecRuntime<'_, B> {
    fn load(
        &mut self,
        _host_off: usize,
        addr: u64,
        memop: MemOp,
    ) -> Result<u64, MemFault> {
        self.mem.load(addr, memop)
    }

    fn store(
        &mut self,
        host_off: usize,
        addr: u64,
        memop: MemOp,
        val: u64,
    ) -> Result<Option<usize>, MemFault> {
        self.mem.store(addr, memop, val)?;
        let len = memop.size_bytes() as u64;
        let store = &self.shared.tb_store;
        if !store.may_have_code(addr, len) {
            return Ok(None);
        }
        let current = store.find_by_host_offset(host_off);
        let retired = self.shared.tb_invalidate_phys_range(addr, len);
        let Some(cur) = current.filter(|c| retired.contains(c)) else {
            return Ok(None);
        };
        // The running block is stale from the next instruction on.
        let tb = store.get(cur);
        let stop = tb
            .find_insn(host_off)
            .and_then(|k| tb.insn_host_offset(k + 1));
        trace!(tb = cur, addr, ?stop, "store hit running TB");
        Ok(stop)
    }

    fn helper(&self, idx: u32) -> Option<HelperFn> {
        self.helpers.get(idx as usize).copied()
    }

    fn follow_chain(&mut self, target: ChainTarget) -> bool {
        if target.generation != self.shared.tb_store.generation() {
            return false;
        }
        self.chained += 1;
        true
    }

    fn exit_requested(&self) -> bool {
        self.ctl.tb_exit_pending()
            || (!self.exclusive && self.shared.gate.exclusive_pending())
    }
}

/// Main CPU execution loop.
///
/// Repeatedly looks up or translates TBs and executes them until
/// something needs the caller's attention: an unhandled guest
/// exception, an exit request, a halt or a debug event. Cache
/// exhaustion is handled here and never reaches the caller.
pub fn cpu_exec<B, C>(env: &mut ExecEnv<B>, cpu: &mut C) -> ExitReason
where
    B: HostCodeGen,
    C: GuestCpu + ?Sized,
{
    if !cpu_handle_halt(&env.ctl) {
        return ExitReason::Halted;
    }
    let shared = Arc::clone(&env.shared);
    shared.gate.cpu_exec_start();
    let reason = cpu_exec_loop(env, cpu, &shared);
    shared.gate.cpu_exec_end();
    trace!(?reason, "cpu_exec returned");
    reason
}

fn cpu_handle_halt(ctl: &CpuControl) -> bool {
    if !ctl.halted() {
        return true;
    }
    if ctl.interrupt_request() & CPU_INTERRUPT_HARD != 0 {
        ctl.set_halted(false);
        return true;
    }
    false
}

fn cpu_exec_loop<B, C>(
    env: &mut ExecEnv<B>,
    cpu: &mut C,
    shared: &SharedState<B>,
) -> ExitReason
where
    B: HostCodeGen,
    C: GuestCpu + ?Sized,
{
    // Exit slot of the previous TB, candidate for chaining.
    let mut last_tb: Option<(usize, usize)> = None;

    loop {
        env.stats.loop_iters += 1;
        if let Some(reason) = cpu_handle_interrupt(env, cpu, &mut last_tb) {
            return reason;
        }
        if shared.gate.exclusive_pending() {
            shared.gate.cpu_exec_end();
            shared.gate.cpu_exec_start();
            last_tb = None;
        }
        if env.sync_flush() {
            last_tb = None;
        }

        let pc = cpu.get_pc();
        let flags = cpu.get_flags();
        let cflags = curr_cflags(env);
        let Some(tb_idx) = tb_find(env, cpu, pc, flags, cflags) else {
            debug!(pc = %format_args!("{pc:#x}"), "translation cache full");
            let seen = env.flush_seen();
            shared.gate.cpu_exec_end();
            shared.flush_at_safe_point(seen);
            shared.gate.cpu_exec_start();
            last_tb = None;
            continue;
        };

        if let Some((src, slot)) = last_tb.take() {
            tb_add_jump(shared, src, slot, tb_idx);
        }

        let exit = cpu_tb_exec(env, cpu, tb_idx, false);
        let ran = !matches!(
            exit,
            HostExit::Exit { code: TB_EXIT_REQUESTED, .. }
        );
        if let Some(reason) = handle_exit(env, cpu, exit, &mut last_tb, false) {
            return reason;
        }
        if ran && cflags & CF_SINGLE_STEP != 0 {
            return ExitReason::Debug;
        }
    }
}

/// Handle pending interrupt and exit requests at dispatcher entry.
fn cpu_handle_interrupt<B, C>(
    env: &mut ExecEnv<B>,
    cpu: &mut C,
    last_tb: &mut Option<(usize, usize)>,
) -> Option<ExitReason>
where
    B: HostCodeGen,
    C: GuestCpu + ?Sized,
{
    let ctl = Arc::clone(&env.ctl);
    ctl.clear_tb_exit();

    let req = ctl.interrupt_request();
    if req != 0 {
        if req & CPU_INTERRUPT_DEBUG != 0 {
            ctl.reset_interrupt(CPU_INTERRUPT_DEBUG);
            return Some(ExitReason::Debug);
        }
        if req & CPU_INTERRUPT_HALT != 0 {
            ctl.reset_interrupt(CPU_INTERRUPT_HALT);
            ctl.set_halted(true);
            return Some(ExitReason::Halted);
        }
        if req & CPU_INTERRUPT_HARD != 0 && cpu.exec_interrupt(req) {
            ctl.reset_interrupt(CPU_INTERRUPT_HARD);
            *last_tb = None;
        }
        if ctl.interrupt_request() & CPU_INTERRUPT_EXITTB != 0 {
            ctl.reset_interrupt(CPU_INTERRUPT_EXITTB);
            *last_tb = None;
        }
    }

    if ctl.take_exit_request() {
        return Some(ExitReason::Interrupted);
    }
    None
}

fn curr_cflags<B: HostCodeGen>(env: &ExecEnv<B>) -> u32 {
    let mut cflags = 0;
    if env.shared.parallel() {
        cflags |= CF_PARALLEL;
    }
    if env.ctl.singlestep() {
        cflags |= CF_SINGLE_STEP | 1;
    } else if env.shared.config.one_insn_per_tb {
        cflags |= 1;
    }
    cflags
}

/// Find a TB for the given key, translating if needed.
///
/// Returns `None` if the cache is too full to translate.
fn tb_find<B, C>(
    env: &mut ExecEnv<B>,
    cpu: &mut C,
    pc: u64,
    flags: u32,
    cflags: u32,
) -> Option<usize>
where
    B: HostCodeGen,
    C: GuestCpu + ?Sized,
{
    let store = &env.shared.tb_store;

    // Fast path: jump cache
    if let Some(idx) = env.jump_cache.lookup(pc) {
        if idx < store.len() {
            let tb = store.get(idx);
            if tb.is_valid() && tb.matches(pc, flags, cflags) {
                env.stats.jc_hits += 1;
                return Some(idx);
            }
        }
    }

    // Slow path: hash table, then translation
    let idx = match store.lookup(pc, flags, cflags) {
        Some(idx) => {
            env.stats.hash_hits += 1;
            idx
        }
        None => tb_gen_code(env, cpu, pc, flags, cflags)?,
    };
    env.jump_cache.insert(pc, idx);
    Some(idx)
}

/// Translate guest code at `pc` into a new TB.
///
/// Returns `None` if the code buffer or the TB store is full.
fn tb_gen_code<B, C>(
    env: &mut ExecEnv<B>,
    cpu: &mut C,
    pc: u64,
    flags: u32,
    cflags: u32,
) -> Option<usize>
where
    B: HostCodeGen,
    C: GuestCpu + ?Sized,
{
    let shared = &*env.shared;
    let store = &shared.tb_store;
    let mut guard = shared.lock_translate();
    let t = &mut *guard;

    // Another vCPU may have translated it while we waited.
    if cflags & CF_NOCACHE == 0 {
        if let Some(idx) = store.lookup(pc, flags, cflags) {
            return Some(idx);
        }
    }
    if store.is_full() || t.code_buf.remaining() < MIN_CODE_BUF_REMAINING {
        return None;
    }

    let mut tb = TranslationBlock::new(pc, flags, cflags);
    tb.set_state(TbState::Codegen);
    // The TB keeps the caller's cflags as its key; only the decode
    // budget shrinks when the block cannot fit an empty buffer.
    let mut gen_cflags = cflags;
    let (size, out) = loop {
        t.ir.reset();
        t.ir.tb_idx = store.next_index() as u32;
        let size = cpu.gen_code(&mut t.ir, pc, flags, gen_cflags);
        if tracing::enabled!(tracing::Level::TRACE) {
            let mut text = Vec::new();
            if dump_ops(&t.ir, &mut text).is_ok() {
                trace!(pc = %format_args!("{pc:#x}"), "IR\n{}", String::from_utf8_lossy(&text));
            }
        }
        if let Some(out) = translate(&mut t.ir, &shared.backend, &mut t.code_buf) {
            break (size, out);
        }
        if t.code_buf.offset() != shared.code_gen_start() {
            return None;
        }
        let max = TranslationBlock::max_insns(gen_cflags);
        if max <= 1 {
            error!(pc, "single instruction does not fit the code buffer");
            panic!("instruction at {pc:#x} does not fit an empty code buffer");
        }
        gen_cflags = (gen_cflags & !CF_COUNT_MASK) | (max / 2);
        debug!(pc = %format_args!("{pc:#x}"), max_insns = max / 2, "TB too large, retrying shorter");
    };

    tb.size = size;
    tb.icount = out.search.len() as u16;
    tb.host_offset = out.host_offset;
    tb.host_size = out.host_size;
    tb.jmp_insn_offset = out.jmp_insn_offset;
    tb.search = out.search;
    let last = pc.wrapping_add(u64::from(size.max(1)) - 1);
    tb.page_addr = [
        Some(page_of(pc)),
        (!same_page(pc, last)).then(|| page_of(last)),
    ];
    let (icount, host_size) = (tb.icount, tb.host_size);

    // SAFETY: the translate lock is held.
    let tb_idx = unsafe { store.alloc(tb) };
    if cflags & CF_NOCACHE == 0 {
        store.insert(tb_idx);
    } else {
        store.get(tb_idx).set_state(TbState::Cached);
    }
    drop(guard);

    let s = &shared.stats;
    SharedStats::bump(&s.translations, 1);
    SharedStats::bump(&s.translated_insns, u64::from(icount));
    SharedStats::bump(&s.guest_bytes, u64::from(size));
    SharedStats::bump(&s.host_bytes, host_size as u64);
    env.stats.translations += 1;
    debug!(
        "translated TB {tb_idx} at {pc:#x} flags={flags:#x} \
         cflags={cflags:#x}: {icount} insns, {host_size} host bytes"
    );
    Some(tb_idx)
}

/// Chain exit `slot` of `src` directly to `dst`.
///
/// Later runs of `src` enter `dst` without returning to the
/// dispatcher while the link's generation is current.
fn tb_add_jump<B: HostCodeGen>(
    shared: &SharedState<B>,
    src: usize,
    slot: usize,
    dst: usize,
) {
    let store = &shared.tb_store;
    if store.get(src).cflags & CF_NOCACHE != 0 {
        return;
    }
    if store.link(src, slot, dst, shared.code_region(), &shared.backend) {
        SharedStats::bump(&shared.stats.chain_links, 1);
        trace!(src, slot, dst, "chained");
    }
}

/// Execute a single TB (and whatever it chains into).
fn cpu_tb_exec<B, C>(
    env: &mut ExecEnv<B>,
    cpu: &mut C,
    tb_idx: usize,
    exclusive: bool,
) -> HostExit
where
    B: HostCodeGen,
    C: GuestCpu + ?Sized,
{
    let shared = &*env.shared;
    let entry = shared.tb_store.get(tb_idx).host_offset;
    let helpers = cpu.helpers();
    let (regs, mem) = cpu.env_and_memory();
    let mut rt = ExecRuntime {
        shared,
        ctl: &env.ctl,
        mem,
        helpers,
        exclusive,
        chained: 0,
    };
    // SAFETY: entry is the host entry of a published TB, and regs is
    // the register file whose globals the TB was generated against.
    let exit = unsafe {
        shared
            .backend
            .exec_tb(shared.code_region(), entry, regs, &mut rt)
    };
    let chained = rt.chained;
    env.stats.tb_exec += 1 + chained;
    env.stats.chained += chained;
    exit
}

fn handle_exit<B, C>(
    env: &mut ExecEnv<B>,
    cpu: &mut C,
    exit: HostExit,
    last_tb: &mut Option<(usize, usize)>,
    in_atomic: bool,
) -> Option<ExitReason>
where
    B: HostCodeGen,
    C: GuestCpu + ?Sized,
{
    match exit {
        HostExit::Exit { tb, code } => match code {
            TB_EXIT_IDX0 | TB_EXIT_IDX1 => {
                *last_tb = Some((tb, code as usize));
                None
            }
            TB_EXIT_NOCHAIN => None,
            TB_EXIT_REQUESTED => {
                env.stats.exits_requested += 1;
                let entry = env.shared.tb_store.get(tb).search.first().map(|r| r.data);
                if let Some(data) = entry {
                    cpu.restore_state_to_opc(&data);
                }
                None
            }
            _ => {
                error!(tb, code, "invalid TB exit code");
                panic!("invalid exit code {code} from TB {tb}");
            }
        },
        HostExit::Exception { host_off, excp } => {
            restore_at(env, cpu, host_off);
            handle_exception(env, cpu, excp, in_atomic)
        }
        HostExit::Fault { host_off, fault } => {
            restore_at(env, cpu, host_off);
            let excp = cpu.mem_fault_exception(fault);
            trace!(?fault, excp, "guest memory fault");
            handle_exception(env, cpu, excp, in_atomic)
        }
        HostExit::CodeModified { resume_off } => {
            restore_at(env, cpu, resume_off);
            None
        }
    }
}

fn restore_at<B, C>(env: &ExecEnv<B>, cpu: &mut C, host_off: usize)
where
    B: HostCodeGen,
    C: GuestCpu + ?Sized,
{
    if !cpu_restore_state(&env.shared, cpu, host_off) {
        error!(host_off, "no TB covers host offset");
        panic!("no TB covers host offset {host_off:#x}");
    }
}

fn handle_exception<B, C>(
    env: &mut ExecEnv<B>,
    cpu: &mut C,
    excp: u32,
    in_atomic: bool,
) -> Option<ExitReason>
where
    B: HostCodeGen,
    C: GuestCpu + ?Sized,
{
    env.stats.exceptions += 1;
    match excp {
        EXCP_ATOMIC if !in_atomic => cpu_exec_step_atomic(env, cpu),
        EXCP_INTERRUPT | EXCP_YIELD => Some(ExitReason::Interrupted),
        EXCP_HLT | EXCP_HALTED => {
            env.ctl.set_halted(true);
            Some(ExitReason::Halted)
        }
        EXCP_DEBUG => Some(ExitReason::Debug),
        e if e >= EXCP_INTERRUPT => {
            error!(excp = e, "unexpected loop exception");
            panic!("unexpected loop exception {e:#x}");
        }
        e => {
            if cpu.deliver_exception(e) {
                None
            } else {
                Some(ExitReason::Exception(e))
            }
        }
    }
}

/// Restore guest state for the instruction executing at host offset
/// `host_off`. Returns false if no TB covers that offset.
pub fn cpu_restore_state<B, C>(
    shared: &SharedState<B>,
    cpu: &mut C,
    host_off: usize,
) -> bool
where
    B: HostCodeGen,
    C: GuestCpu + ?Sized,
{
    let store = &shared.tb_store;
    let Some(idx) = store.find_by_host_offset(host_off) else {
        return false;
    };
    let tb = store.get(idx);
    let Some(k) = tb.find_insn(host_off) else {
        return false;
    };
    cpu.restore_state_to_opc(&tb.search[k].data);
    SharedStats::bump(&shared.stats.restores, 1);
    trace!(tb = idx, insn = k, "restored guest state");
    true
}

/// Execute the current instruction alone, with every other vCPU
/// stopped, in an uncached non-parallel TB.
///
/// Called from the dispatcher on `EXCP_ATOMIC`, inside the running
/// region of `cpu_exec`.
pub fn cpu_exec_step_atomic<B, C>(
    env: &mut ExecEnv<B>,
    cpu: &mut C,
) -> Option<ExitReason>
where
    B: HostCodeGen,
    C: GuestCpu + ?Sized,
{
    let shared = Arc::clone(&env.shared);
    shared.gate.cpu_exec_end();
    shared.gate.start_exclusive();
    env.sync_flush();

    let pc = cpu.get_pc();
    let flags = cpu.get_flags();
    let cflags =
        (curr_cflags(env) & !(CF_PARALLEL | CF_COUNT_MASK)) | CF_NOCACHE | 1;
    let tb_idx = match tb_gen_code(env, cpu, pc, flags, cflags) {
        Some(idx) => idx,
        None => {
            shared.flush_exclusive();
            env.sync_flush();
            match tb_gen_code(env, cpu, pc, flags, cflags) {
                Some(idx) => idx,
                None => {
                    error!(pc, "cannot translate atomic step");
                    panic!("cannot translate atomic step at {pc:#x}");
                }
            }
        }
    };
    trace!(tb = tb_idx, pc = %format_args!("{pc:#x}"), "atomic step");

    let exit = cpu_tb_exec(env, cpu, tb_idx, true);
    shared
        .tb_store
        .invalidate(tb_idx, shared.code_region(), &shared.backend);
    env.stats.atomic_steps += 1;
    let mut no_chain = None;
    let reason = handle_exit(env, cpu, exit, &mut no_chain, true);

    shared.gate.end_exclusive();
    shared.gate.cpu_exec_start();
    reason
}
