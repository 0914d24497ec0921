use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cpu::VCpu;
use crate::error::AccelError;
use crate::machine::Machine;
use crate::ops::BackendOps;

/// Single-step capability bits.
pub const SSTEP_ENABLE: u32 = 0x1;
pub const SSTEP_NOIRQ: u32 = 0x2;
pub const SSTEP_NOTIMER: u32 = 0x4;

/// Backend axis of the customization table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Tcg,
    Kvm,
    Qtest,
}

impl BackendKind {
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Tcg => "tcg",
            BackendKind::Kvm => "kvm",
            BackendKind::Qtest => "qtest",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An accelerator instance.
///
/// Built from its [`AccelClass`], configured through `set_property`,
/// then frozen into an [`AccelState`] once `init_machine` succeeds.
pub trait Accelerator: Send + Sync {
    /// Apply one `-accel name,key=value` property.
    fn set_property(&mut self, key: &str, _value: &str) -> Result<(), AccelError> {
        Err(AccelError::InvalidOption {
            accel: self.name().to_string(),
            reason: format!("unknown property '{key}'"),
        })
    }

    fn name(&self) -> &'static str;

    /// Backend VM setup.
    fn init_machine(&mut self, machine: &Machine) -> Result<(), AccelError>;

    /// Generic part of CPU realize, run after the arch hook.
    fn cpu_common_realize(&self, _cpu: &mut VCpu) -> Result<(), AccelError> {
        Ok(())
    }

    fn supported_sstep_flags(&self) -> u32 {
        0
    }

    fn as_any(&self) -> &dyn Any;
}

/// Constructor of a fresh accelerator instance.
pub type AccelFactory = Box<dyn Fn() -> Box<dyn Accelerator> + Send + Sync>;

/// Describes one backend. Registered by name; instances are only
/// built by `init_machine`.
pub struct AccelClass {
    pub name: &'static str,
    pub kind: BackendKind,
    allowed: AtomicBool,
    factory: AccelFactory,
}

impl AccelClass {
    pub fn new(
        name: &'static str,
        kind: BackendKind,
        factory: impl Fn() -> Box<dyn Accelerator> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            kind,
            allowed: AtomicBool::new(false),
            factory: Box::new(factory),
        }
    }

    /// Whether this backend is the one chosen for the running VM.
    pub fn allowed(&self) -> bool {
        self.allowed.load(Ordering::Acquire)
    }

    pub(crate) fn set_allowed(&self, on: bool) {
        self.allowed.store(on, Ordering::Release);
    }

    pub(crate) fn instantiate(&self) -> Box<dyn Accelerator> {
        (self.factory)()
    }
}

impl fmt::Debug for AccelClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccelClass")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("allowed", &self.allowed())
            .finish()
    }
}

/// The active accelerator of a VM.
pub struct AccelState {
    class: Arc<AccelClass>,
    accel: Box<dyn Accelerator>,
    ops: Arc<dyn BackendOps>,
}

impl AccelState {
    pub(crate) fn new(
        class: Arc<AccelClass>,
        accel: Box<dyn Accelerator>,
        ops: Arc<dyn BackendOps>,
    ) -> Self {
        Self { class, accel, ops }
    }

    pub fn name(&self) -> &'static str {
        self.class.name
    }

    pub fn kind(&self) -> BackendKind {
        self.class.kind
    }

    pub fn class(&self) -> &Arc<AccelClass> {
        &self.class
    }

    pub fn accel(&self) -> &dyn Accelerator {
        self.accel.as_ref()
    }

    pub fn ops(&self) -> &Arc<dyn BackendOps> {
        &self.ops
    }

    /// Downcast the instance to its concrete backend type.
    pub fn downcast<T: 'static>(&self) -> Option<&T> {
        self.accel.as_any().downcast_ref()
    }

    pub fn supported_sstep_flags(&self) -> u32 {
        self.accel.supported_sstep_flags()
    }
}

impl fmt::Debug for AccelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccelState").field("name", &self.name()).finish()
    }
}
