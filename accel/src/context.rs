use std::sync::{Arc, Mutex, OnceLock};

use tracing::warn;

use crate::class::AccelState;
use crate::config::{AccelOpts, AccelSelector};
use crate::error::AccelError;
use crate::machine::{accel_init_machine, Machine};
use crate::registry::AccelRegistry;

/// Backend used when nothing is selected.
pub const DEFAULT_ACCEL: &str = "tcg";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Full machine emulation: the accelerator comes from the machine.
    System,
    /// Process emulation: one lazily built `tcg` instance.
    User,
}

/// Process-wide accelerator context.
pub struct AccelContext {
    mode: Mode,
    registry: Arc<AccelRegistry>,
    machine: OnceLock<Arc<Machine>>,
    user: OnceLock<Arc<AccelState>>,
    user_init: Mutex<()>,
}

static GLOBAL: OnceLock<AccelContext> = OnceLock::new();

impl AccelContext {
    pub fn new(mode: Mode, registry: Arc<AccelRegistry>) -> Self {
        Self {
            mode,
            registry,
            machine: OnceLock::new(),
            user: OnceLock::new(),
            user_init: Mutex::new(()),
        }
    }

    pub fn system(registry: Arc<AccelRegistry>) -> Self {
        Self::new(Mode::System, registry)
    }

    pub fn user(registry: Arc<AccelRegistry>) -> Self {
        Self::new(Mode::User, registry)
    }

    /// Make `ctx` the process-wide context. Fails, handing `ctx`
    /// back, if one is already installed.
    pub fn install(ctx: AccelContext) -> Result<&'static AccelContext, AccelContext> {
        GLOBAL.set(ctx)?;
        Ok(GLOBAL.get().unwrap_or_else(|| unreachable!()))
    }

    pub fn global() -> Option<&'static AccelContext> {
        GLOBAL.get()
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn registry(&self) -> &Arc<AccelRegistry> {
        &self.registry
    }

    pub fn find(&self, name: &str) -> Option<Arc<crate::class::AccelClass>> {
        self.registry.find(name)
    }

    /// Attach the machine whose slot `current()` reads.
    pub fn attach_machine(&self, machine: Arc<Machine>) -> Result<(), AccelError> {
        self.machine
            .set(machine)
            .map_err(|m| AccelError::AlreadyInitialized(m.name.clone()))
    }

    pub fn machine(&self) -> Option<&Arc<Machine>> {
        self.machine.get()
    }

    /// The active accelerator.
    pub fn current(&self) -> Result<Arc<AccelState>, AccelError> {
        match self.mode {
            Mode::System => self
                .machine
                .get()
                .and_then(|m| m.accelerator())
                .cloned()
                .ok_or(AccelError::NotInitialized),
            Mode::User => self.current_user(),
        }
    }

    fn current_user(&self) -> Result<Arc<AccelState>, AccelError> {
        if let Some(state) = self.user.get() {
            return Ok(Arc::clone(state));
        }
        let _guard = self.user_init.lock().unwrap();
        if let Some(state) = self.user.get() {
            return Ok(Arc::clone(state));
        }
        let class = self
            .registry
            .find(DEFAULT_ACCEL)
            .ok_or_else(|| AccelError::UnknownAccelerator(DEFAULT_ACCEL.to_string()))?;
        let machine = Machine::new("user", 1);
        let state = accel_init_machine(&self.registry, &class, &machine, &[])?;
        let _ = self.user.set(Arc::clone(&state));
        Ok(state)
    }

    /// Capability query; 0 when no accelerator is active.
    pub fn supported_sstep_flags(&self) -> u32 {
        let active = match self.mode {
            Mode::System => self.machine.get().and_then(|m| m.accelerator()).cloned(),
            Mode::User => self.user.get().cloned(),
        };
        active.map_or(0, |s| s.supported_sstep_flags())
    }

    /// Pick an accelerator for `machine` from a priority list such as
    /// `"kvm:tcg"`. Without a selector, `tcg` if registered, else
    /// `kvm`.
    pub fn configure_accelerators(
        &self,
        machine: &Machine,
        selector: Option<&str>,
    ) -> Result<Arc<AccelState>, AccelError> {
        let opts = match selector {
            Some(s) => AccelSelector::parse(s)?.into_opts(),
            None if self.registry.find(DEFAULT_ACCEL).is_some() => {
                vec![AccelOpts::new(DEFAULT_ACCEL)]
            }
            None => vec![AccelOpts::new("kvm")],
        };
        self.configure_with(machine, &opts)
    }

    /// Try each `-accel` option in order until one initializes.
    pub fn configure_with(
        &self,
        machine: &Machine,
        opts: &[AccelOpts],
    ) -> Result<Arc<AccelState>, AccelError> {
        let mut classes = Vec::with_capacity(opts.len());
        for o in opts {
            let class = self
                .registry
                .find(&o.name)
                .ok_or_else(|| AccelError::UnknownAccelerator(o.name.clone()))?;
            classes.push((class, o));
        }

        for (class, o) in classes {
            match accel_init_machine(&self.registry, &class, machine, &o.props) {
                Ok(state) => return Ok(state),
                Err(e @ AccelError::InitFailed { .. }) => {
                    warn!(accel = class.name, error = %e, "accelerator unavailable, trying next");
                }
                Err(e) => return Err(e),
            }
        }
        let tried: Vec<&str> = opts.iter().map(|o| o.name.as_str()).collect();
        Err(AccelError::NoAcceleratorAvailable(tried.join(":")))
    }
}
