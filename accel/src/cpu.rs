//! CPU classes, their op tables and the realize protocol.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::debug;

use tcg_exec::{CpuControl, ExecStats, ExitReason, GuestCpu};

use crate::arch::{AccelCpuOps, ArchTag};
use crate::class::{AccelState, BackendKind};
use crate::error::AccelError;

/// Who last wrote a [`Hook`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOrigin {
    /// Unset.
    None,
    /// The CPU class's own class-init.
    Base,
    /// The backend's `cpu_class_init`.
    Accel,
    /// The CPU class's `init_accel_cpu` callback.
    Cpu,
}

/// One entry of a CPU class op table, with its provenance.
#[derive(Debug, Clone, Copy)]
pub struct Hook<T> {
    value: Option<T>,
    origin: HookOrigin,
}

impl<T: Copy> Hook<T> {
    pub const fn unset() -> Self {
        Self {
            value: None,
            origin: HookOrigin::None,
        }
    }

    pub fn get(&self) -> Option<T> {
        self.value
    }

    pub fn origin(&self) -> HookOrigin {
        self.origin
    }

    /// Accel and CPU customizations must write disjoint fields; base
    /// entries may be overridden by either.
    fn set(
        &mut self,
        field: &'static str,
        arch: ArchTag,
        origin: HookOrigin,
        value: T,
    ) -> Result<(), AccelError> {
        let clash = matches!(
            (self.origin, origin),
            (HookOrigin::Accel, HookOrigin::Cpu) | (HookOrigin::Cpu, HookOrigin::Accel)
        );
        if clash {
            return Err(AccelError::HookOverlap { field, arch });
        }
        self.value = Some(value);
        self.origin = origin;
        Ok(())
    }
}

impl<T: Copy> Default for Hook<T> {
    fn default() -> Self {
        Self::unset()
    }
}

pub type ResetFn = fn(&mut VCpu);
pub type HasWorkFn = fn(&VCpu) -> bool;
pub type DumpStateFn = fn(&VCpu) -> String;
pub type SyncStateFn = fn(&mut VCpu);

/// Op table of a CPU class.
#[derive(Debug, Clone, Default)]
pub struct CpuClassOps {
    pub reset: Hook<ResetFn>,
    pub has_work: Hook<HasWorkFn>,
    pub dump_state: Hook<DumpStateFn>,
    pub synchronize_from_tb: Hook<SyncStateFn>,
}

/// Write access to a class op table on behalf of one side.
pub struct ClassCustomizer<'a> {
    ops: &'a mut CpuClassOps,
    arch: ArchTag,
    origin: HookOrigin,
}

impl<'a> ClassCustomizer<'a> {
    pub fn new(ops: &'a mut CpuClassOps, arch: ArchTag, origin: HookOrigin) -> Self {
        Self { ops, arch, origin }
    }

    pub fn ops(&self) -> &CpuClassOps {
        &*self.ops
    }

    pub fn set_reset(&mut self, f: ResetFn) -> Result<(), AccelError> {
        self.ops.reset.set("reset", self.arch, self.origin, f)
    }

    pub fn set_has_work(&mut self, f: HasWorkFn) -> Result<(), AccelError> {
        self.ops.has_work.set("has_work", self.arch, self.origin, f)
    }

    pub fn set_dump_state(&mut self, f: DumpStateFn) -> Result<(), AccelError> {
        self.ops.dump_state.set("dump_state", self.arch, self.origin, f)
    }

    pub fn set_synchronize_from_tb(&mut self, f: SyncStateFn) -> Result<(), AccelError> {
        self.ops
            .synchronize_from_tb
            .set("synchronize_from_tb", self.arch, self.origin, f)
    }
}

/// CPU-side customization callback, run after the backend's hooks.
pub type InitAccelCpuFn = fn(&mut ClassCustomizer<'_>, BackendKind) -> Result<(), AccelError>;

/// A CPU model.
#[derive(Clone)]
pub struct CpuClass {
    pub name: &'static str,
    pub arch: ArchTag,
    pub ops: CpuClassOps,
    /// Backend hooks recorded by `init_cpu_interfaces`.
    pub accel_cpu: Option<Arc<dyn AccelCpuOps>>,
    pub init_accel_cpu: Option<InitAccelCpuFn>,
}

impl CpuClass {
    pub fn new(name: &'static str, arch: ArchTag) -> Self {
        Self {
            name,
            arch,
            ops: CpuClassOps::default(),
            accel_cpu: None,
            init_accel_cpu: None,
        }
    }

    /// Class-init entries, overridable by either customization side.
    pub fn base_ops(&mut self) -> ClassCustomizer<'_> {
        ClassCustomizer::new(&mut self.ops, self.arch, HookOrigin::Base)
    }

    pub fn with_init_accel_cpu(mut self, f: InitAccelCpuFn) -> Self {
        self.init_accel_cpu = Some(f);
        self
    }

    /// Copy of this class customized for `backend`.
    pub(crate) fn customized(
        &self,
        backend: BackendKind,
        hooks: Arc<dyn AccelCpuOps>,
    ) -> Result<CpuClass, AccelError> {
        let mut cc = self.clone();
        cc.accel_cpu = Some(Arc::clone(&hooks));
        hooks.cpu_class_init(&mut ClassCustomizer::new(
            &mut cc.ops,
            cc.arch,
            HookOrigin::Accel,
        ))?;
        if let Some(f) = cc.init_accel_cpu {
            f(
                &mut ClassCustomizer::new(&mut cc.ops, cc.arch, HookOrigin::Cpu),
                backend,
            )?;
        }
        Ok(cc)
    }
}

impl fmt::Debug for CpuClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuClass")
            .field("name", &self.name)
            .field("arch", &self.arch)
            .field("ops", &self.ops)
            .field("accel_cpu", &self.accel_cpu.is_some())
            .finish()
    }
}

/// Guest CPU handed to a vCPU thread.
pub type BoxedGuest = Box<dyn GuestCpu + Send>;

/// What a vCPU thread hands back when it ends.
pub struct VcpuOutcome {
    pub guest: Option<BoxedGuest>,
    /// Last exit that ended or paused the thread.
    pub exit: Option<ExitReason>,
    pub stats: ExecStats,
}

impl fmt::Debug for VcpuOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VcpuOutcome")
            .field("exit", &self.exit)
            .field("stats", &self.stats)
            .finish()
    }
}

/// A virtual CPU instance.
pub struct VCpu {
    pub index: usize,
    class: Arc<CpuClass>,
    ctl: Arc<CpuControl>,
    guest: Option<BoxedGuest>,
    thread: Option<JoinHandle<VcpuOutcome>>,
    backend_state: Option<Box<dyn Any + Send>>,
    realized: bool,
    /// Features enabled by instance init.
    pub features: Vec<&'static str>,
}

impl VCpu {
    /// Construct a vCPU; runs the backend's `cpu_instance_init` if
    /// the class was customized.
    pub fn new(class: Arc<CpuClass>, index: usize) -> Self {
        let mut cpu = Self {
            index,
            class: Arc::clone(&class),
            ctl: Arc::new(CpuControl::new()),
            guest: None,
            thread: None,
            backend_state: None,
            realized: false,
            features: Vec::new(),
        };
        if let Some(hooks) = &class.accel_cpu {
            hooks.cpu_instance_init(&mut cpu);
        }
        cpu
    }

    pub fn with_guest(mut self, guest: BoxedGuest) -> Self {
        self.guest = Some(guest);
        self
    }

    pub fn class(&self) -> &Arc<CpuClass> {
        &self.class
    }

    pub fn ctl(&self) -> &Arc<CpuControl> {
        &self.ctl
    }

    pub fn is_realized(&self) -> bool {
        self.realized
    }

    pub fn has_thread(&self) -> bool {
        self.thread.is_some()
    }

    pub fn take_guest(&mut self) -> Option<BoxedGuest> {
        self.guest.take()
    }

    pub(crate) fn set_thread(&mut self, handle: JoinHandle<VcpuOutcome>) {
        self.thread = Some(handle);
    }

    pub fn set_backend_state(&mut self, state: Box<dyn Any + Send>) {
        self.backend_state = Some(state);
    }

    pub fn backend_state<T: 'static>(&self) -> Option<&T> {
        self.backend_state.as_ref()?.downcast_ref()
    }

    /// Realize under `accel`: the arch hook first, then the backend's
    /// common realize. A failing arch hook stops the sequence.
    pub fn realize(&mut self, accel: &AccelState) -> Result<(), AccelError> {
        if let Some(hooks) = self.class.accel_cpu.clone() {
            hooks
                .cpu_target_realize(self)
                .map_err(|source| AccelError::ArchRealize {
                    arch: self.class.arch,
                    source,
                })?;
        }
        accel.accel().cpu_common_realize(self)?;
        self.realized = true;
        debug!(cpu = self.index, accel = accel.name(), "vCPU realized");
        Ok(())
    }

    /// Realize, then start the backend execution unit.
    pub fn start(&mut self, accel: &AccelState) -> Result<(), AccelError> {
        if !self.realized {
            self.realize(accel)?;
        }
        accel.ops().create_vcpu_thread(accel, self)
    }

    /// Ask the execution unit to stop and wait for it.
    pub fn join(&mut self) -> Result<Option<VcpuOutcome>, AccelError> {
        let Some(handle) = self.thread.take() else {
            return Ok(None);
        };
        self.ctl.request_stop();
        handle
            .join()
            .map(Some)
            .map_err(|_| AccelError::VcpuPanicked(self.index))
    }

    /// Wait for the execution unit to end on its own.
    pub fn wait(&mut self) -> Result<Option<VcpuOutcome>, AccelError> {
        let Some(handle) = self.thread.take() else {
            return Ok(None);
        };
        handle
            .join()
            .map(Some)
            .map_err(|_| AccelError::VcpuPanicked(self.index))
    }

    /// Tear down whatever exists. Safe at any construction stage.
    pub fn unrealize(&mut self) {
        if let Some(handle) = self.thread.take() {
            self.ctl.request_stop();
            if let Ok(outcome) = handle.join() {
                self.guest = outcome.guest;
            }
        }
        self.backend_state = None;
        self.realized = false;
    }
}

impl fmt::Debug for VCpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VCpu")
            .field("index", &self.index)
            .field("class", &self.class.name)
            .field("realized", &self.realized)
            .field("running", &self.thread.is_some())
            .finish()
    }
}

impl Drop for VCpu {
    fn drop(&mut self) {
        self.unrealize();
    }
}
