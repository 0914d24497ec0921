//! Accelerator dispatch: backend selection, per-architecture CPU
//! customization, the CPU realize protocol and the built-in `tcg`,
//! `kvm` and `qtest` backends.

pub mod arch;
pub mod class;
pub mod config;
pub mod context;
pub mod cpu;
pub mod error;
pub mod kvm;
pub mod machine;
pub mod ops;
pub mod qtest;
pub mod registry;
pub mod tcg;

pub use arch::{AccelArchKey, AccelCpuOps, ArchTag};
pub use class::{
    AccelClass, AccelState, Accelerator, BackendKind, SSTEP_ENABLE, SSTEP_NOIRQ, SSTEP_NOTIMER,
};
pub use config::{AccelOpts, AccelSelector};
pub use context::{AccelContext, Mode, DEFAULT_ACCEL};
pub use cpu::{
    BoxedGuest, ClassCustomizer, CpuClass, CpuClassOps, Hook, HookOrigin, VCpu, VcpuOutcome,
};
pub use error::{AccelError, RealizeError};
pub use machine::{accel_init_machine, Machine};
pub use ops::{ops_module_name, BackendOps, ACCEL_OPS_SUFFIX};
pub use registry::AccelRegistry;
