use crate::class::AccelState;
use crate::cpu::VCpu;
use crate::error::AccelError;

/// Suffix of an accelerator's ops module name: `"tcg"` resolves
/// `"tcg-accel-ops"`.
pub const ACCEL_OPS_SUFFIX: &str = "-accel-ops";

/// Name of the ops module for accelerator `accel`.
pub fn ops_module_name(accel: &str) -> String {
    format!("{accel}{ACCEL_OPS_SUFFIX}")
}

/// Per-backend vCPU operations.
///
/// Only `create_vcpu_thread` is mandatory.
pub trait BackendOps: Send + Sync {
    /// Runs once, after the accelerator is installed.
    fn ops_init(&self, _accel: &AccelState) {}

    /// Start the execution unit of `cpu`.
    fn create_vcpu_thread(&self, accel: &AccelState, cpu: &mut VCpu) -> Result<(), AccelError>;

    /// Make a running vCPU return to its outer loop.
    fn kick_vcpu_thread(&self, cpu: &VCpu) {
        cpu.ctl().request_exit();
    }

    /// Raise interrupt bits on `cpu`.
    fn handle_interrupt(&self, cpu: &VCpu, mask: u32) {
        cpu.ctl().interrupt(mask);
    }

    /// Bring the emulator's view of CPU state up to date.
    fn synchronize_state(&self, _cpu: &mut VCpu) {}

    fn synchronize_post_reset(&self, _cpu: &mut VCpu) {}

    fn synchronize_post_init(&self, _cpu: &mut VCpu) {}

    fn supports_guest_debug(&self) -> bool {
        false
    }
}
