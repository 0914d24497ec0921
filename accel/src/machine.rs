use std::sync::{Arc, OnceLock};

use tracing::info;

use tcg_exec::ExecError;

use crate::class::{AccelClass, AccelState, Accelerator};
use crate::error::AccelError;
use crate::registry::AccelRegistry;

/// The running machine. Owns the single accelerator slot.
#[derive(Debug)]
pub struct Machine {
    pub name: String,
    pub smp_cpus: usize,
    accel: OnceLock<Arc<AccelState>>,
}

impl Machine {
    pub fn new(name: impl Into<String>, smp_cpus: usize) -> Self {
        Self {
            name: name.into(),
            smp_cpus: smp_cpus.max(1),
            accel: OnceLock::new(),
        }
    }

    pub fn accelerator(&self) -> Option<&Arc<AccelState>> {
        self.accel.get()
    }

    fn set_accelerator(&self, state: Arc<AccelState>) -> Result<(), AccelError> {
        self.accel.set(state).map_err(|_| {
            let cur = self.accel.get().map_or("?", |s| s.name());
            AccelError::AlreadyInitialized(cur.to_string())
        })
    }
}

/// Bring up accelerator `class` on `machine`.
///
/// Marks the class allowed, runs backend VM setup, resolves the ops
/// module and customizes the CPU classes for the backend. Only then is
/// the machine's slot written and `ops_init` run. Any failure rolls
/// the flag back, drops the instance and leaves the slot empty.
pub fn accel_init_machine(
    registry: &AccelRegistry,
    class: &Arc<AccelClass>,
    machine: &Machine,
    props: &[(String, String)],
) -> Result<Arc<AccelState>, AccelError> {
    if let Some(cur) = machine.accelerator() {
        return Err(AccelError::AlreadyInitialized(cur.name().to_string()));
    }

    let mut accel = class.instantiate();
    for (key, value) in props {
        accel.set_property(key, value)?;
    }

    class.set_allowed(true);
    let state = bring_up(registry, class, machine, accel).and_then(|state| {
        machine.set_accelerator(Arc::clone(&state))?;
        Ok(state)
    });
    let state = match state {
        Ok(state) => state,
        Err(e) => {
            class.set_allowed(false);
            return Err(e);
        }
    };
    state.ops().ops_init(&state);
    info!(accel = class.name, machine = %machine.name, "accelerator initialized");
    Ok(state)
}

fn bring_up(
    registry: &AccelRegistry,
    class: &Arc<AccelClass>,
    machine: &Machine,
    mut accel: Box<dyn Accelerator>,
) -> Result<Arc<AccelState>, AccelError> {
    accel.init_machine(machine).map_err(|e| match e {
        // Configuration errors never fall back to the next backend.
        e @ (AccelError::InvalidOption { .. } | AccelError::Exec(ExecError::InvalidConfig(_))) => e,
        e => AccelError::InitFailed {
            name: class.name.to_string(),
            source: Box::new(e),
        },
    })?;
    let ops = registry.ops_module(class.name)?;
    registry.init_cpu_interfaces(class.kind)?;
    Ok(Arc::new(AccelState::new(Arc::clone(class), accel, ops)))
}
