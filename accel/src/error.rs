use thiserror::Error;

use tcg_exec::ExecError;

use crate::arch::ArchTag;

/// Boxed error returned by architecture realize hooks.
pub type RealizeError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum AccelError {
    #[error("invalid accelerator {0}")]
    UnknownAccelerator(String),
    #[error("accelerator ops module '{0}' not registered")]
    MissingOpsModule(String),
    #[error("invalid option for accelerator {accel}: {reason}")]
    InvalidOption { accel: String, reason: String },
    #[error("no accelerator found (tried {0})")]
    NoAcceleratorAvailable(String),
    #[error("failed to initialize {name}")]
    InitFailed {
        name: String,
        #[source]
        source: Box<AccelError>,
    },
    #[error("accelerator not initialized")]
    NotInitialized,
    #[error("machine already has accelerator {0}")]
    AlreadyInitialized(String),
    #[error("{arch} CPU realize failed")]
    ArchRealize {
        arch: ArchTag,
        #[source]
        source: RealizeError,
    },
    #[error("{arch}: field '{field}' set by both accelerator and CPU customization")]
    HookOverlap { field: &'static str, arch: ArchTag },
    #[error("vCPU {0} has no guest to run")]
    NoGuest(usize),
    #[error("vCPU {0} thread panicked")]
    VcpuPanicked(usize),
    #[error("{0} not supported")]
    Unsupported(String),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
