//! Hardware virtualization backend.
//!
//! Probes `/dev/kvm`, creates the VM and one vCPU fd per CPU. Running
//! guest code needs device models this workspace does not carry, so
//! starting a vCPU stops at fd creation.

use std::any::Any;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd};
use std::sync::Arc;

use tracing::debug;

use crate::class::{AccelClass, AccelState, Accelerator, BackendKind};
use crate::cpu::VCpu;
use crate::error::AccelError;
use crate::machine::Machine;
use crate::ops::BackendOps;
use crate::registry::AccelRegistry;

pub const KVM_DEVICE: &str = "/dev/kvm";
pub const KVM_API_VERSION: i32 = 12;

const KVMIO: u64 = 0xAE;
const KVM_GET_API_VERSION: u64 = KVMIO << 8;
const KVM_CREATE_VM: u64 = (KVMIO << 8) | 0x01;
const KVM_CREATE_VCPU: u64 = (KVMIO << 8) | 0x41;

/// Issue an ioctl that returns a count or a new fd.
fn kvm_ioctl(fd: &File, request: u64, arg: u64) -> io::Result<i32> {
    // SAFETY: the requests used here take an integer argument and
    // write no memory.
    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), request as _, arg as libc::c_ulong) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret)
}

fn into_file(fd: i32) -> File {
    // SAFETY: fd was just returned by the kernel and is owned by us.
    unsafe { File::from_raw_fd(fd) }
}

#[derive(Debug, Default)]
pub struct KvmAccel {
    kvm: Option<File>,
    vm: Option<File>,
}

impl KvmAccel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vm_fd(&self) -> Option<&File> {
        self.vm.as_ref()
    }
}

impl Accelerator for KvmAccel {
    fn name(&self) -> &'static str {
        "kvm"
    }

    fn init_machine(&mut self, machine: &Machine) -> Result<(), AccelError> {
        let kvm = OpenOptions::new().read(true).write(true).open(KVM_DEVICE)?;
        let version = kvm_ioctl(&kvm, KVM_GET_API_VERSION, 0)?;
        if version != KVM_API_VERSION {
            return Err(AccelError::Unsupported(format!(
                "KVM API version {version}"
            )));
        }
        let vm = into_file(kvm_ioctl(&kvm, KVM_CREATE_VM, 0)?);
        debug!(machine = %machine.name, "KVM VM created");
        self.kvm = Some(kvm);
        self.vm = Some(vm);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Per-vCPU backend state.
#[derive(Debug)]
pub struct KvmVcpu {
    pub fd: File,
}

#[derive(Debug, Default)]
pub struct KvmAccelOps;

impl BackendOps for KvmAccelOps {
    fn create_vcpu_thread(&self, accel: &AccelState, cpu: &mut VCpu) -> Result<(), AccelError> {
        let vm = accel
            .downcast::<KvmAccel>()
            .and_then(KvmAccel::vm_fd)
            .ok_or(AccelError::NotInitialized)?;
        let fd = into_file(kvm_ioctl(vm, KVM_CREATE_VCPU, cpu.index as u64)?);
        cpu.set_backend_state(Box::new(KvmVcpu { fd }));
        debug!(cpu = cpu.index, "KVM vCPU created");
        Err(AccelError::Unsupported("running guest code under kvm".into()))
    }
}

pub(crate) fn register(reg: &AccelRegistry) {
    reg.register_class(AccelClass::new("kvm", BackendKind::Kvm, || {
        Box::new(KvmAccel::new())
    }));
    reg.register_ops("kvm", Arc::new(KvmAccelOps));
}
