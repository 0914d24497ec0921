use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Stops every vCPU at a safe point so one thread can do work that
/// must not race with generated code, such as flushing the cache or
/// stepping an atomic instruction.
///
/// vCPU threads bracket dispatcher work with `cpu_exec_start` and
/// `cpu_exec_end`. While an exclusive section is pending, running
/// vCPUs see [`ExclusiveGate::exclusive_pending`] and leave generated
/// code at the next TB entry.
#[derive(Debug, Default)]
pub struct ExclusiveGate {
    running: AtomicUsize,
    pending: AtomicBool,
    /// True while some thread owns the exclusive section.
    active: Mutex<bool>,
    cond: Condvar,
}

impl ExclusiveGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the region where generated code may run. Blocks while an
    /// exclusive section is in progress.
    pub fn cpu_exec_start(&self) {
        loop {
            self.running.fetch_add(1, Ordering::SeqCst);
            if !self.pending.load(Ordering::SeqCst) {
                return;
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
            let mut active = self.active.lock().unwrap();
            self.cond.notify_all();
            while self.pending.load(Ordering::SeqCst) {
                active = self.cond.wait(active).unwrap();
            }
        }
    }

    /// Leave the region entered by `cpu_exec_start`.
    pub fn cpu_exec_end(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
        if self.pending.load(Ordering::SeqCst) {
            let _active = self.active.lock().unwrap();
            self.cond.notify_all();
        }
    }

    /// Wait until no vCPU is inside its running region, then own the
    /// exclusive section. The caller must not be inside its own
    /// running region.
    pub fn start_exclusive(&self) {
        let mut active = self.active.lock().unwrap();
        while *active {
            active = self.cond.wait(active).unwrap();
        }
        *active = true;
        self.pending.store(true, Ordering::SeqCst);
        while self.running.load(Ordering::SeqCst) > 0 {
            active = self
                .cond
                .wait_timeout(active, Duration::from_millis(1))
                .unwrap()
                .0;
        }
    }

    pub fn end_exclusive(&self) {
        let mut active = self.active.lock().unwrap();
        *active = false;
        self.pending.store(false, Ordering::SeqCst);
        self.cond.notify_all();
    }

    /// Run `f` with every vCPU stopped.
    pub fn run_exclusive<R>(&self, f: impl FnOnce() -> R) -> R {
        self.start_exclusive();
        let r = f();
        self.end_exclusive();
        r
    }

    /// Whether an exclusive section is waiting for or holding the
    /// vCPUs.
    pub fn exclusive_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    /// Number of vCPUs inside their running region.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }
}
