pub mod code_buffer;
pub mod optimize;
pub mod tci;
pub mod translate;

pub use code_buffer::{CodeBuffer, CodeRegion};
pub use tci::TciCodeGen;
pub use translate::{translate, GenOutput};

use tcg_core::{Context, HelperFn, MemFault, MemOp, Op};

/// Destination of a chained `goto_tb`: the target TB's host entry and
/// the cache generation the link was made in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainTarget {
    pub host_offset: usize,
    pub generation: u32,
}

/// How a run of generated code ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostExit {
    /// `exit_tb` of TB `tb` with exit code `code`.
    Exit { tb: usize, code: u32 },
    /// A `raise` op executed at host offset `host_off`.
    Exception { host_off: usize, excp: u32 },
    /// A guest memory access at `host_off` failed.
    Fault { host_off: usize, fault: MemFault },
    /// A store invalidated the running TB; execution stopped at
    /// `resume_off`, the first guest instruction boundary reached
    /// after the store.
    CodeModified { resume_off: usize },
}

/// Services generated code needs from the execution loop.
pub trait TbRuntime {
    /// Guest load issued by the host insn at `host_off`.
    fn load(
        &mut self,
        host_off: usize,
        addr: u64,
        memop: MemOp,
    ) -> Result<u64, MemFault>;

    /// Guest store issued by the host insn at `host_off`. Returns the
    /// host offset at which execution must stop if the store
    /// invalidated the running TB.
    fn store(
        &mut self,
        host_off: usize,
        addr: u64,
        memop: MemOp,
        val: u64,
    ) -> Result<Option<usize>, MemFault>;

    fn helper(&self, idx: u32) -> Option<HelperFn>;

    /// Whether a linked `goto_tb` may be followed into `target`.
    fn follow_chain(&mut self, target: ChainTarget) -> bool;

    /// Checked at every TB entry.
    fn exit_requested(&self) -> bool;
}

/// Trait for host code generators.
///
/// A generator reports the exact size of everything it will emit
/// before emitting it, so block layout is fixed in one pass and
/// emission never back-patches.
pub trait HostCodeGen: Send + Sync {
    fn name(&self) -> &'static str;

    /// Size of the code emitted at TB entry (exit check, constants).
    fn tb_start_size(&self, ctx: &Context) -> usize;

    /// Emit the TB entry sequence.
    fn emit_tb_start(&self, buf: &mut CodeBuffer, ctx: &Context);

    /// Exact number of host bytes `tcg_out_op` emits for `op`.
    fn op_size(&self, ctx: &Context, op: &Op) -> usize;

    /// Emit host code for a single IR op. Label values are already
    /// resolved.
    fn tcg_out_op(&self, buf: &mut CodeBuffer, ctx: &Context, op: &Op);

    /// Offset of the patch site inside a `goto_tb` sequence.
    fn goto_tb_patch_offset(&self) -> usize;

    /// Point the `goto_tb` patch site at `jump_offset` to `target`, or
    /// back to the dispatcher when `None`.
    ///
    /// Takes `&self` and a [`CodeRegion`] so chaining can happen
    /// concurrently from multiple vCPU threads.
    fn patch_jump(
        &self,
        code: CodeRegion,
        jump_offset: usize,
        target: Option<ChainTarget>,
    );

    /// Make patched code visible to instruction fetch.
    fn flush_icache(&self, _code: CodeRegion, _start: usize, _len: usize) {}

    /// Run generated code starting at host offset `entry`.
    ///
    /// # Safety
    /// `entry` must be the host entry of a published TB inside `code`,
    /// and `env` must match the globals the TB was generated with.
    unsafe fn exec_tb(
        &self,
        code: CodeRegion,
        entry: usize,
        env: &mut [u64],
        rt: &mut dyn TbRuntime,
    ) -> HostExit;
}
