//! Per (backend, architecture) CPU customization.

use std::fmt;

use crate::class::BackendKind;
use crate::cpu::{ClassCustomizer, VCpu};
use crate::error::{AccelError, RealizeError};

/// Opaque guest architecture tag, used only as a lookup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchTag(&'static str);

impl ArchTag {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for ArchTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Key of the customization table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccelArchKey {
    pub backend: BackendKind,
    pub arch: ArchTag,
}

impl AccelArchKey {
    pub const fn new(backend: BackendKind, arch: ArchTag) -> Self {
        Self { backend, arch }
    }
}

/// Hooks one backend supplies for one guest architecture.
pub trait AccelCpuOps: Send + Sync {
    /// Customize the CPU class op table. Runs once per class.
    fn cpu_class_init(&self, _cc: &mut ClassCustomizer<'_>) -> Result<(), AccelError> {
        Ok(())
    }

    /// Runs when a vCPU of a customized class is constructed.
    fn cpu_instance_init(&self, _cpu: &mut VCpu) {}

    /// Runs before the backend's common realize.
    fn cpu_target_realize(&self, _cpu: &mut VCpu) -> Result<(), RealizeError> {
        Ok(())
    }
}
