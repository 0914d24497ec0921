//! Test-harness backend: vCPUs never execute guest code.

use std::any::Any;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tcg_exec::ExecStats;

use crate::class::{AccelClass, AccelState, Accelerator, BackendKind};
use crate::cpu::{VCpu, VcpuOutcome};
use crate::error::AccelError;
use crate::machine::Machine;
use crate::ops::BackendOps;
use crate::registry::AccelRegistry;

#[derive(Debug, Default)]
pub struct QtestAccel;

impl Accelerator for QtestAccel {
    fn name(&self) -> &'static str {
        "qtest"
    }

    fn init_machine(&mut self, _machine: &Machine) -> Result<(), AccelError> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Idle vCPU threads that only wait to be stopped.
#[derive(Debug, Default)]
pub struct QtestAccelOps;

impl BackendOps for QtestAccelOps {
    fn create_vcpu_thread(&self, _accel: &AccelState, cpu: &mut VCpu) -> Result<(), AccelError> {
        let ctl = Arc::clone(cpu.ctl());
        let handle = thread::Builder::new()
            .name(format!("CPU {}/QTest", cpu.index))
            .spawn(move || {
                while !ctl.stop_requested() {
                    ctl.take_exit_request();
                    ctl.wait_for_work(Duration::from_millis(10));
                }
                VcpuOutcome {
                    guest: None,
                    exit: None,
                    stats: ExecStats::default(),
                }
            })?;
        cpu.set_thread(handle);
        Ok(())
    }
}

pub(crate) fn register(reg: &AccelRegistry) {
    reg.register_class(AccelClass::new("qtest", BackendKind::Qtest, || {
        Box::new(QtestAccel)
    }));
    reg.register_ops("qtest", Arc::new(QtestAccelOps));
}
