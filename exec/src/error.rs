use thiserror::Error;

/// Errors raised while setting up the execution engine.
///
/// Guest faults never show up here: they are guest exceptions and
/// travel through [`crate::ExitReason`].
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to allocate {size} byte code buffer")]
    CodeBuffer {
        size: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid TCG configuration: {0}")]
    InvalidConfig(String),
}
