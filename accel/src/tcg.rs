//! Software translation backend.

use std::any::Any;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use tcg_backend::TciCodeGen;
use tcg_exec::config::parse_switch;
use tcg_exec::{cpu_exec, CpuControl, ExecEnv, ExecError, ExitReason, SharedState, TcgConfig};

use crate::class::{
    AccelClass, AccelState, Accelerator, BackendKind, SSTEP_ENABLE, SSTEP_NOIRQ, SSTEP_NOTIMER,
};
use crate::cpu::{BoxedGuest, VCpu, VcpuOutcome};
use crate::error::AccelError;
use crate::machine::Machine;
use crate::ops::BackendOps;
use crate::registry::AccelRegistry;

/// How long a halted vCPU sleeps between checks.
const HALT_POLL: Duration = Duration::from_millis(10);

pub struct TcgAccel {
    config: TcgConfig,
    /// Bad environment override, reported by `init_machine`.
    env_error: Option<ExecError>,
    shared: OnceLock<Arc<SharedState<TciCodeGen>>>,
}

impl TcgAccel {
    /// Configuration from the process environment.
    pub fn new() -> Self {
        Self::from_config(TcgConfig::from_env())
    }

    /// Configuration from a config read that may have failed; the
    /// failure surfaces when the machine is initialized.
    pub fn from_config(config: Result<TcgConfig, ExecError>) -> Self {
        match config {
            Ok(config) => Self::with_config(config),
            Err(e) => Self {
                env_error: Some(e),
                ..Self::with_config(TcgConfig::default())
            },
        }
    }

    pub fn with_config(config: TcgConfig) -> Self {
        Self {
            config,
            env_error: None,
            shared: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &TcgConfig {
        &self.config
    }

    /// Translation state shared by the vCPUs; set by `init_machine`.
    pub fn shared(&self) -> Option<&Arc<SharedState<TciCodeGen>>> {
        self.shared.get()
    }

    fn invalid(&self, reason: String) -> AccelError {
        AccelError::InvalidOption {
            accel: "tcg".to_string(),
            reason,
        }
    }
}

impl Default for TcgAccel {
    fn default() -> Self {
        Self::new()
    }
}

impl Accelerator for TcgAccel {
    fn name(&self) -> &'static str {
        "tcg"
    }

    fn set_property(&mut self, key: &str, value: &str) -> Result<(), AccelError> {
        match key {
            "tb-size" => self
                .config
                .set_tb_size_mib(value)
                .map_err(|e| self.invalid(e.to_string())),
            "one-insn-per-tb" => {
                let on = parse_switch(value)
                    .ok_or_else(|| self.invalid(format!("one-insn-per-tb={value}")))?;
                self.config.one_insn_per_tb = on;
                Ok(())
            }
            _ => Err(self.invalid(format!("unknown property '{key}'"))),
        }
    }

    fn init_machine(&mut self, machine: &Machine) -> Result<(), AccelError> {
        if let Some(e) = self.env_error.take() {
            warn!(error = %e, "bad TCG environment override");
            return Err(e.into());
        }
        let shared = SharedState::new(TciCodeGen::new(), self.config.clone())?;
        shared.set_parallel(machine.smp_cpus > 1);
        let _ = self.shared.set(shared);
        debug!(smp = machine.smp_cpus, "tcg ready");
        Ok(())
    }

    fn supported_sstep_flags(&self) -> u32 {
        SSTEP_ENABLE | SSTEP_NOIRQ | SSTEP_NOTIMER
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// vCPU operations of the `tcg` backend: one thread per vCPU.
#[derive(Debug, Default)]
pub struct TcgAccelOps;

impl BackendOps for TcgAccelOps {
    fn create_vcpu_thread(&self, accel: &AccelState, cpu: &mut VCpu) -> Result<(), AccelError> {
        let tcg = accel
            .downcast::<TcgAccel>()
            .ok_or_else(|| AccelError::Unsupported(format!("tcg ops on {}", accel.name())))?;
        let shared = Arc::clone(tcg.shared().ok_or(AccelError::NotInitialized)?);
        let guest = cpu.take_guest().ok_or(AccelError::NoGuest(cpu.index))?;
        let ctl = Arc::clone(cpu.ctl());
        let index = cpu.index;
        let handle = thread::Builder::new()
            .name(format!("CPU {index}/TCG"))
            .spawn(move || tcg_cpu_thread_fn(shared, ctl, guest, index))?;
        cpu.set_thread(handle);
        Ok(())
    }

    fn supports_guest_debug(&self) -> bool {
        true
    }
}

fn stats_enabled() -> bool {
    std::env::var_os("TCG_STATS").is_some()
}

fn tcg_cpu_thread_fn(
    shared: Arc<SharedState<TciCodeGen>>,
    ctl: Arc<CpuControl>,
    mut guest: BoxedGuest,
    index: usize,
) -> VcpuOutcome {
    let mut env = ExecEnv::with_control(shared, Arc::clone(&ctl));
    let mut exit = None;
    debug!(cpu = index, "vCPU thread started");

    while !ctl.stop_requested() {
        let r = cpu_exec(&mut env, guest.as_mut());
        match r {
            ExitReason::Interrupted => {}
            ExitReason::Halted => {
                ctl.take_exit_request();
                ctl.wait_for_work(HALT_POLL);
            }
            ExitReason::Debug | ExitReason::Exception(_) => {
                exit = Some(r);
                break;
            }
        }
    }

    debug!(cpu = index, ?exit, "vCPU thread exiting");
    if stats_enabled() {
        info!(cpu = index, "\n{}\n{}", env.stats, env.shared.dump_exec_info());
    }
    VcpuOutcome {
        guest: Some(guest),
        exit,
        stats: env.stats,
    }
}

pub(crate) fn register(reg: &AccelRegistry) {
    reg.register_class(AccelClass::new("tcg", BackendKind::Tcg, || {
        Box::new(TcgAccel::new())
    }));
    reg.register_ops("tcg", Arc::new(TcgAccelOps));
}
