//! TCG execution engine: translation cache, block chaining, guest
//! state recovery and the per-vCPU dispatcher loop.
//!
//! State shared by every vCPU lives in [`SharedState`]; each vCPU
//! thread owns an [`ExecEnv`] with its jump cache and counters.

pub mod config;
pub mod control;
pub mod error;
pub mod exclusive;
pub mod exec_loop;
pub mod page;
pub mod stats;
pub mod tb_store;

pub use config::TcgConfig;
pub use control::{interrupt, CpuControl};
pub use error::ExecError;
pub use exclusive::ExclusiveGate;
pub use exec_loop::{cpu_exec, cpu_exec_step_atomic, cpu_restore_state, ExitReason};
pub use stats::{ExecStats, SharedStats};
pub use tb_store::TbStore;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use tcg_backend::code_buffer::{CodeBuffer, CodeRegion};
use tcg_backend::HostCodeGen;
use tcg_core::tb::{JumpCache, INSN_START_WORDS};
use tcg_core::{Context, GuestMemory, HelperFn, MemFault};

/// Guest CPU seen by the execution loop.
///
/// Each guest architecture implements this to expose its PC, its
/// translation-relevant flags and its frontend.
pub trait GuestCpu {
    /// Return the current guest program counter.
    fn get_pc(&self) -> u64;

    /// Return CPU flags that affect translation.
    fn get_flags(&self) -> u32;

    /// Translate guest code starting at `pc` into IR.
    ///
    /// Returns the number of guest bytes translated. Implementations
    /// register their globals on the first call; later calls find
    /// them already present in `ir`.
    fn gen_code(&mut self, ir: &mut Context, pc: u64, flags: u32, cflags: u32) -> u32;

    /// The register file generated code runs on, and guest memory.
    fn env_and_memory(&mut self) -> (&mut [u64], &mut dyn GuestMemory);

    /// Helper functions reachable from `call` ops, by index.
    fn helpers(&self) -> &'static [HelperFn] {
        &[]
    }

    /// Restore the guest state recorded for one instruction.
    fn restore_state_to_opc(&mut self, data: &[u64; INSN_START_WORDS]);

    /// Take a pending interrupt. Returns true if it was delivered;
    /// the hard-interrupt request is then cleared.
    fn exec_interrupt(&mut self, _request: u32) -> bool {
        false
    }

    /// Deliver guest exception `excp`. Returns true when the guest
    /// handles it itself and execution can continue.
    fn deliver_exception(&mut self, _excp: u32) -> bool {
        false
    }

    /// Guest exception number for a failed memory access.
    fn mem_fault_exception(&mut self, fault: MemFault) -> u32;
}

/// Minimum remaining bytes in code buffer before refusing
/// to translate a new TB.
pub(crate) const MIN_CODE_BUF_REMAINING: usize = 4096;

/// State owned by the holder of the translate lock.
pub(crate) struct TranslateCtx {
    pub(crate) code_buf: CodeBuffer,
    pub(crate) ir: Context,
}

/// Translation state shared by all vCPUs of a machine.
pub struct SharedState<B: HostCodeGen> {
    pub tb_store: TbStore,
    pub backend: B,
    pub gate: ExclusiveGate,
    pub stats: SharedStats,
    pub config: TcgConfig,
    code: CodeRegion,
    translate: Mutex<TranslateCtx>,
    parallel: AtomicBool,
    code_gen_start: usize,
}

impl<B: HostCodeGen> SharedState<B> {
    pub fn new(backend: B, config: TcgConfig) -> Result<Arc<Self>, ExecError> {
        config.validate()?;
        let code_buf = CodeBuffer::new(config.tb_size).map_err(|source| {
            ExecError::CodeBuffer {
                size: config.tb_size,
                source,
            }
        })?;
        let code = code_buf.region();
        let code_gen_start = code_buf.offset();
        debug!(
            backend = backend.name(),
            tb_size = config.tb_size,
            max_tbs = config.max_tbs,
            "translation cache ready"
        );
        Ok(Arc::new(Self {
            tb_store: TbStore::new(config.max_tbs),
            backend,
            gate: ExclusiveGate::new(),
            stats: SharedStats::default(),
            config,
            code,
            translate: Mutex::new(TranslateCtx {
                code_buf,
                ir: Context::new(),
            }),
            parallel: AtomicBool::new(false),
            code_gen_start,
        }))
    }

    /// Write offset of an empty code buffer.
    pub(crate) fn code_gen_start(&self) -> usize {
        self.code_gen_start
    }

    pub fn code_region(&self) -> CodeRegion {
        self.code
    }

    /// Bytes of generated code and buffer capacity.
    pub fn code_usage(&self) -> (usize, usize) {
        let t = self.translate.lock().unwrap();
        (t.code_buf.offset() - self.code_gen_start, t.code_buf.capacity())
    }

    /// Mark whether several vCPUs run concurrently. Affects the
    /// cflags of TBs translated from now on.
    pub fn set_parallel(&self, on: bool) {
        self.parallel.store(on, Ordering::Relaxed);
    }

    pub fn parallel(&self) -> bool {
        self.parallel.load(Ordering::Relaxed)
    }

    pub(crate) fn lock_translate(&self) -> std::sync::MutexGuard<'_, TranslateCtx> {
        self.translate.lock().unwrap()
    }

    /// Invalidate all TBs with code on pages touched by
    /// `[addr, addr + len)`. Returns the retired TB indices.
    pub fn tb_invalidate_phys_range(&self, addr: u64, len: u64) -> Vec<usize> {
        if !self.tb_store.may_have_code(addr, len) {
            return Vec::new();
        }
        let retired = self
            .tb_store
            .invalidate_range(addr, len, self.code, &self.backend);
        if !retired.is_empty() {
            SharedStats::bump(&self.stats.invalidations, retired.len() as u64);
            debug!(addr, len, count = retired.len(), "invalidated TBs");
        }
        retired
    }

    /// Retire one TB.
    pub fn tb_phys_invalidate(&self, idx: usize) -> bool {
        let done = self.tb_store.invalidate(idx, self.code, &self.backend);
        if done {
            SharedStats::bump(&self.stats.invalidations, 1);
        }
        done
    }

    /// Flush the whole cache with every vCPU stopped.
    ///
    /// Must not be called from inside `cpu_exec`.
    pub fn tb_flush(&self) {
        self.flush_at_safe_point(self.tb_store.flush_count());
    }

    /// Flush unless someone already flushed since `seen` was read.
    pub(crate) fn flush_at_safe_point(&self, seen: u64) {
        self.gate.start_exclusive();
        if self.tb_store.flush_count() == seen {
            self.flush_exclusive();
        }
        self.gate.end_exclusive();
    }

    /// Caller owns the exclusive section.
    pub(crate) fn flush_exclusive(&self) {
        let mut t = self.lock_translate();
        // SAFETY: every vCPU is outside generated code and the
        // translate lock is held.
        unsafe { self.tb_store.flush() };
        t.code_buf.set_offset(self.code_gen_start);
        SharedStats::bump(&self.stats.flushes, 1);
        debug!(flushes = self.tb_store.flush_count(), "flushed translation cache");
    }
}

/// Per-vCPU execution environment.
pub struct ExecEnv<B: HostCodeGen> {
    pub shared: Arc<SharedState<B>>,
    pub jump_cache: JumpCache,
    pub ctl: Arc<CpuControl>,
    pub stats: ExecStats,
    /// Flush count the jump cache was filled under.
    flush_seen: u64,
}

impl<B: HostCodeGen> ExecEnv<B> {
    /// Attach a new vCPU to shared translation state.
    pub fn new(shared: Arc<SharedState<B>>) -> Self {
        Self::with_control(shared, Arc::new(CpuControl::new()))
    }

    pub fn with_control(shared: Arc<SharedState<B>>, ctl: Arc<CpuControl>) -> Self {
        let flush_seen = shared.tb_store.flush_count();
        Self {
            shared,
            jump_cache: JumpCache::new(),
            ctl,
            stats: ExecStats::default(),
            flush_seen,
        }
    }

    /// Single-vCPU environment with its own translation state.
    pub fn with_backend(backend: B, config: TcgConfig) -> Result<Self, ExecError> {
        Ok(Self::new(SharedState::new(backend, config)?))
    }

    /// Report a guest store done outside generated code (DMA, a
    /// debugger, the loader) so stale translations are dropped.
    pub fn notify_write(&self, addr: u64, len: u64) -> usize {
        self.shared.tb_invalidate_phys_range(addr, len).len()
    }

    /// Drop the jump cache if the shared cache was flushed since it
    /// was filled. Returns true if it was.
    pub(crate) fn sync_flush(&mut self) -> bool {
        let fc = self.shared.tb_store.flush_count();
        if fc == self.flush_seen {
            return false;
        }
        self.jump_cache.invalidate();
        self.flush_seen = fc;
        true
    }

    pub(crate) fn flush_seen(&self) -> u64 {
        self.flush_seen
    }
}
