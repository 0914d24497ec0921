use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Interrupt request bits.
pub mod interrupt {
    /// External hardware interrupt line.
    pub const CPU_INTERRUPT_HARD: u32 = 0x0002;
    /// Leave the current TB chain; nothing to deliver.
    pub const CPU_INTERRUPT_EXITTB: u32 = 0x0004;
    /// Halt the CPU.
    pub const CPU_INTERRUPT_HALT: u32 = 0x0020;
    /// Stop in the debugger.
    pub const CPU_INTERRUPT_DEBUG: u32 = 0x0080;
}

/// Cross-thread control block of one vCPU.
///
/// Any thread may request an exit or raise an interrupt; the vCPU
/// notices at its next TB entry.
#[derive(Debug, Default)]
pub struct CpuControl {
    exit_request: AtomicBool,
    /// Makes the next TB entry leave generated code. Cleared by the
    /// dispatcher before it looks at pending requests.
    tb_exit: AtomicBool,
    interrupt_request: AtomicU32,
    halted: AtomicBool,
    singlestep: AtomicBool,
    stop: AtomicBool,
    wake_lock: Mutex<()>,
    wake: Condvar,
}

impl CpuControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the vCPU to return from `cpu_exec`.
    pub fn request_exit(&self) {
        self.exit_request.store(true, Ordering::SeqCst);
        self.tb_exit.store(true, Ordering::SeqCst);
        self.kick();
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_request.load(Ordering::SeqCst)
    }

    pub fn take_exit_request(&self) -> bool {
        self.exit_request.swap(false, Ordering::SeqCst)
    }

    pub fn tb_exit_pending(&self) -> bool {
        self.tb_exit.load(Ordering::SeqCst)
    }

    pub(crate) fn clear_tb_exit(&self) {
        self.tb_exit.store(false, Ordering::SeqCst);
    }

    /// Raise interrupt bits.
    pub fn interrupt(&self, mask: u32) {
        self.interrupt_request.fetch_or(mask, Ordering::SeqCst);
        self.tb_exit.store(true, Ordering::SeqCst);
        self.kick();
    }

    pub fn reset_interrupt(&self, mask: u32) {
        self.interrupt_request.fetch_and(!mask, Ordering::SeqCst);
    }

    pub fn interrupt_request(&self) -> u32 {
        self.interrupt_request.load(Ordering::SeqCst)
    }

    pub fn set_halted(&self, halted: bool) {
        self.halted.store(halted, Ordering::SeqCst);
    }

    pub fn halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn set_singlestep(&self, on: bool) {
        self.singlestep.store(on, Ordering::SeqCst);
    }

    pub fn singlestep(&self) -> bool {
        self.singlestep.load(Ordering::SeqCst)
    }

    /// Ask the vCPU thread to terminate.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.request_exit();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Whether a halted CPU has something to do.
    pub fn has_work(&self) -> bool {
        self.interrupt_request() & interrupt::CPU_INTERRUPT_HARD != 0
    }

    /// Wake a vCPU thread sleeping in [`CpuControl::wait_for_work`].
    pub fn kick(&self) {
        let _g = self.wake_lock.lock().unwrap();
        self.wake.notify_all();
    }

    /// Sleep until kicked or `timeout` elapses.
    pub fn wait_for_work(&self, timeout: Duration) {
        let g = self.wake_lock.lock().unwrap();
        if self.has_work() || self.exit_requested() || self.stop_requested() {
            return;
        }
        let _ = self.wake.wait_timeout(g, timeout).unwrap();
    }
}
