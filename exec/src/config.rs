use std::env;

use tcg_backend::code_buffer::DEFAULT_CODE_BUF_SIZE;

use crate::error::ExecError;

/// Default number of TB slots in the translation cache.
pub const DEFAULT_MAX_TBS: usize = 65536;

/// Smallest code buffer accepted.
pub const MIN_TB_SIZE: usize = 64 * 1024;

/// Largest code buffer accepted. Chain links store host offsets in
/// 32 bits.
pub const MAX_TB_SIZE: usize = 1 << 31;

/// Tunables of the translation engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcgConfig {
    /// Code buffer size in bytes.
    pub tb_size: usize,
    /// Number of TB slots before a flush is forced.
    pub max_tbs: usize,
    /// Translate one guest instruction per TB.
    pub one_insn_per_tb: bool,
}

impl Default for TcgConfig {
    fn default() -> Self {
        Self {
            tb_size: DEFAULT_CODE_BUF_SIZE,
            max_tbs: DEFAULT_MAX_TBS,
            one_insn_per_tb: false,
        }
    }
}

/// Parse an on/off switch the way accelerator options spell it.
pub fn parse_switch(value: &str) -> Option<bool> {
    match value {
        "on" | "yes" | "true" | "1" => Some(true),
        "off" | "no" | "false" | "0" => Some(false),
        _ => None,
    }
}

impl TcgConfig {
    /// Defaults overridden by `TCG_TB_SIZE` (MiB) and
    /// `TCG_ONE_INSN_PER_TB`.
    pub fn from_env() -> Result<Self, ExecError> {
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Like [`TcgConfig::from_env`], reading variables through `var`.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ExecError> {
        let mut cfg = Self::default();
        if let Some(v) = var("TCG_TB_SIZE") {
            cfg.set_tb_size_mib(&v)?;
        }
        if let Some(v) = var("TCG_ONE_INSN_PER_TB") {
            cfg.one_insn_per_tb = parse_switch(&v).ok_or_else(|| {
                ExecError::InvalidConfig(format!("TCG_ONE_INSN_PER_TB={v}"))
            })?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Set the code buffer size from a MiB count.
    pub fn set_tb_size_mib(&mut self, value: &str) -> Result<(), ExecError> {
        let mib: usize = value.trim().parse().map_err(|_| {
            ExecError::InvalidConfig(format!("tb-size '{value}' is not a number"))
        })?;
        self.tb_size = mib
            .checked_mul(1024 * 1024)
            .ok_or_else(|| ExecError::InvalidConfig(format!("tb-size {mib} too large")))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ExecError> {
        if !(MIN_TB_SIZE..=MAX_TB_SIZE).contains(&self.tb_size) {
            return Err(ExecError::InvalidConfig(format!(
                "tb-size {} out of range [{MIN_TB_SIZE}, {MAX_TB_SIZE}] bytes",
                self.tb_size
            )));
        }
        if self.max_tbs == 0 {
            return Err(ExecError::InvalidConfig("max-tbs must be non-zero".into()));
        }
        Ok(())
    }
}
