//! Multi-threaded execution: several vCPUs sharing one translation
//! cache, cross-thread flushes, invalidation and exclusive sections.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use tcg_backend::TciCodeGen;
use tcg_exec::{cpu_exec, ExclusiveGate, ExecEnv, ExecStats, ExitReason, SharedState, TcgConfig};

use crate::guest::*;

type Shared = Arc<SharedState<TciCodeGen>>;

fn shared() -> Shared {
    crate::init_tracing();
    SharedState::new(TciCodeGen::new(), TcgConfig::default()).unwrap()
}

fn sum_loop() -> Vec<u32> {
    vec![addi(1, 1, 1), add(2, 1), bne(1, 3, -2), syscall()]
}

/// Run the sum loop up to `n` on a fresh vCPU of `shared`.
fn run_sum(shared: Shared, n: u64) -> (MiniCpu, ExecStats) {
    let mut env = ExecEnv::new(shared);
    let mut cpu = MiniCpu::new(&sum_loop());
    cpu.env[3] = n;
    let r = cpu_exec(&mut env, &mut cpu);
    assert_eq!(r, ExitReason::Exception(EXCP_SYSCALL));
    (cpu, env.stats)
}

fn triangle(n: u64) -> u64 {
    n * (n + 1) / 2
}

// ── Shared translation cache ────────────────────────────────

#[test]
fn test_vcpus_share_translations() {
    let shared = shared();
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let s = Arc::clone(&shared);
            thread::spawn(move || run_sum(s, 100 + i))
        })
        .collect();
    for (i, h) in handles.into_iter().enumerate() {
        let (cpu, _) = h.join().unwrap();
        assert_eq!(cpu.reg(2), triangle(100 + i as u64));
    }
    // Loop body and syscall block, translated once between them.
    assert_eq!(shared.tb_store.len(), 2);
    assert_eq!(shared.stats.translations.load(Ordering::Relaxed), 2);
    assert_eq!(shared.gate.running(), 0);
}

#[test]
fn test_flush_while_vcpus_run() {
    const N: u64 = 20_000;
    let shared = shared();
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let s = Arc::clone(&shared);
            thread::spawn(move || run_sum(s, N))
        })
        .collect();
    for _ in 0..10 {
        thread::sleep(Duration::from_millis(1));
        shared.tb_flush();
    }
    for h in handles {
        let (cpu, _) = h.join().unwrap();
        assert_eq!(cpu.reg(1), N);
        assert_eq!(cpu.reg(2), triangle(N));
    }
    assert_eq!(shared.tb_store.flush_count(), 10);
}

#[test]
fn test_invalidate_while_vcpus_run() {
    const N: u64 = 20_000;
    let shared = shared();
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let s = Arc::clone(&shared);
            thread::spawn(move || run_sum(s, N))
        })
        .collect();
    for _ in 0..10 {
        thread::sleep(Duration::from_millis(1));
        shared.tb_invalidate_phys_range(CODE_BASE, 4);
    }
    for h in handles {
        let (cpu, _) = h.join().unwrap();
        assert_eq!(cpu.reg(2), triangle(N));
    }
    // Whatever survived is reachable and consistent.
    let store = &shared.tb_store;
    let live = (0..store.len()).filter(|&i| store.get(i).is_valid()).count();
    assert!(live <= 2);
}

#[test]
fn test_exit_request_per_vcpu() {
    let shared = shared();
    let started = Arc::new(Barrier::new(4));
    let mut ctls = Vec::new();
    let mut handles = Vec::new();
    for _ in 0..3 {
        let mut env = ExecEnv::new(Arc::clone(&shared));
        ctls.push(Arc::clone(&env.ctl));
        let started = Arc::clone(&started);
        handles.push(thread::spawn(move || {
            let mut cpu = MiniCpu::new(&[jmp(0)]);
            started.wait();
            cpu_exec(&mut env, &mut cpu)
        }));
    }
    started.wait();
    thread::sleep(Duration::from_millis(10));
    for ctl in &ctls {
        ctl.request_exit();
    }
    for h in handles {
        assert_eq!(h.join().unwrap(), ExitReason::Interrupted);
    }
    assert_eq!(shared.gate.running(), 0);
}

#[test]
fn test_atomic_step_with_running_sibling() {
    let shared = shared();
    shared.set_parallel(true);

    let sibling = {
        let s = Arc::clone(&shared);
        thread::spawn(move || run_sum(s, 50_000))
    };
    let stepper = {
        let s = Arc::clone(&shared);
        thread::spawn(move || {
            let mut env = ExecEnv::new(s);
            let mut cpu =
                MiniCpu::new(&[addi(1, 0, 2), addi(2, 0, 0x800), amoadd(1, 2), syscall()]);
            cpu.write_u64(0x800, 40);
            let r = cpu_exec(&mut env, &mut cpu);
            (r, cpu, env.stats)
        })
    };

    let (r, cpu, stats) = stepper.join().unwrap();
    assert_eq!(r, ExitReason::Exception(EXCP_SYSCALL));
    assert_eq!(cpu.read_u64(0x800), 42);
    assert_eq!(stats.atomic_steps, 1);

    let (cpu, stats) = sibling.join().unwrap();
    assert_eq!(cpu.reg(2), triangle(50_000));
    assert_eq!(stats.atomic_steps, 0);
}

// ── Exclusive gate ──────────────────────────────────────────

#[test]
fn test_run_exclusive_without_vcpus() {
    let gate = ExclusiveGate::new();
    assert_eq!(gate.run_exclusive(|| 7), 7);
    assert!(!gate.exclusive_pending());
    assert_eq!(gate.running(), 0);
}

#[test]
fn test_exclusive_waits_for_running_vcpu() {
    let gate = Arc::new(ExclusiveGate::new());
    let done = Arc::new(AtomicBool::new(false));
    let entered = Arc::new(Barrier::new(2));

    let vcpu = {
        let (gate, done, entered) = (Arc::clone(&gate), Arc::clone(&done), Arc::clone(&entered));
        thread::spawn(move || {
            gate.cpu_exec_start();
            entered.wait();
            thread::sleep(Duration::from_millis(30));
            done.store(true, Ordering::SeqCst);
            gate.cpu_exec_end();
        })
    };

    entered.wait();
    gate.start_exclusive();
    assert!(done.load(Ordering::SeqCst));
    assert_eq!(gate.running(), 0);
    gate.end_exclusive();
    vcpu.join().unwrap();
}

#[test]
fn test_vcpu_blocks_during_exclusive() {
    let gate = Arc::new(ExclusiveGate::new());
    let entered = Arc::new(AtomicBool::new(false));

    gate.start_exclusive();
    assert!(gate.exclusive_pending());
    let vcpu = {
        let (gate, entered) = (Arc::clone(&gate), Arc::clone(&entered));
        thread::spawn(move || {
            gate.cpu_exec_start();
            entered.store(true, Ordering::SeqCst);
            gate.cpu_exec_end();
        })
    };
    thread::sleep(Duration::from_millis(30));
    assert!(!entered.load(Ordering::SeqCst));

    gate.end_exclusive();
    vcpu.join().unwrap();
    assert!(entered.load(Ordering::SeqCst));
}

#[test]
fn test_exclusive_sections_serialize() {
    let gate = Arc::new(ExclusiveGate::new());
    let inside = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let (gate, inside) = (Arc::clone(&gate), Arc::clone(&inside));
            thread::spawn(move || {
                for _ in 0..50 {
                    gate.run_exclusive(|| {
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert!(!gate.exclusive_pending());
}
