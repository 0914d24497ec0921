use crate::error::AccelError;

/// One `-accel` option: a backend name plus properties, e.g.
/// `tcg,tb-size=32,one-insn-per-tb=on`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccelOpts {
    pub name: String,
    pub props: Vec<(String, String)>,
}

impl AccelOpts {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            props: Vec::new(),
        }
    }

    pub fn parse(s: &str) -> Result<Self, AccelError> {
        let mut parts = s.split(',');
        let name = parts.next().unwrap_or("").trim();
        if name.is_empty() {
            return Err(AccelError::InvalidOption {
                accel: String::new(),
                reason: format!("missing accelerator name in '{s}'"),
            });
        }
        let mut opts = Self::new(name);
        for part in parts {
            let Some((key, value)) = part.split_once('=') else {
                return Err(AccelError::InvalidOption {
                    accel: name.to_string(),
                    reason: format!("expected key=value, got '{part}'"),
                });
            };
            opts.props
                .push((key.trim().to_string(), value.trim().to_string()));
        }
        Ok(opts)
    }
}

/// Colon-separated accelerator priority list, e.g. `kvm:tcg`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccelSelector {
    pub names: Vec<String>,
}

impl AccelSelector {
    pub fn parse(s: &str) -> Result<Self, AccelError> {
        let names: Vec<String> = s
            .split(':')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .collect();
        if names.is_empty() {
            return Err(AccelError::InvalidOption {
                accel: String::new(),
                reason: format!("empty accelerator list '{s}'"),
            });
        }
        Ok(Self { names })
    }

    pub fn into_opts(self) -> Vec<AccelOpts> {
        self.names.into_iter().map(AccelOpts::new).collect()
    }
}
