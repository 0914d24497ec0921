use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::arch::{AccelArchKey, AccelCpuOps};
use crate::class::{AccelClass, BackendKind};
use crate::cpu::CpuClass;
use crate::error::AccelError;
use crate::ops::{ops_module_name, BackendOps};
use crate::{kvm, qtest, tcg};

/// Everything registered at load time: accelerator classes, their
/// ops modules, CPU classes and the (backend, arch) hook table.
#[derive(Default)]
pub struct AccelRegistry {
    classes: RwLock<HashMap<&'static str, Arc<AccelClass>>>,
    ops_modules: RwLock<HashMap<String, Arc<dyn BackendOps>>>,
    cpu_classes: RwLock<HashMap<&'static str, Arc<CpuClass>>>,
    accel_cpu_ops: RwLock<HashMap<AccelArchKey, Arc<dyn AccelCpuOps>>>,
}

impl AccelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `tcg`, `kvm` and `qtest` backends.
    pub fn with_builtin() -> Self {
        let reg = Self::new();
        tcg::register(&reg);
        kvm::register(&reg);
        qtest::register(&reg);
        reg
    }

    pub fn register_class(&self, class: AccelClass) -> Arc<AccelClass> {
        let class = Arc::new(class);
        self.classes
            .write()
            .unwrap()
            .insert(class.name, Arc::clone(&class));
        class
    }

    /// Register the ops module `"<accel>-accel-ops"`.
    pub fn register_ops(&self, accel: &str, ops: Arc<dyn BackendOps>) {
        self.ops_modules
            .write()
            .unwrap()
            .insert(ops_module_name(accel), ops);
    }

    pub fn register_cpu_class(&self, class: CpuClass) {
        self.cpu_classes
            .write()
            .unwrap()
            .insert(class.name, Arc::new(class));
    }

    pub fn register_accel_cpu_ops(&self, key: AccelArchKey, ops: Arc<dyn AccelCpuOps>) {
        self.accel_cpu_ops.write().unwrap().insert(key, ops);
    }

    /// Look up an accelerator class by name. Never builds an instance.
    pub fn find(&self, name: &str) -> Option<Arc<AccelClass>> {
        self.classes.read().unwrap().get(name).cloned()
    }

    /// Resolve the ops module of accelerator `accel`.
    pub fn ops_module(&self, accel: &str) -> Result<Arc<dyn BackendOps>, AccelError> {
        let name = ops_module_name(accel);
        self.ops_modules
            .read()
            .unwrap()
            .get(&name)
            .cloned()
            .ok_or(AccelError::MissingOpsModule(name))
    }

    pub fn cpu_class(&self, name: &str) -> Option<Arc<CpuClass>> {
        self.cpu_classes.read().unwrap().get(name).cloned()
    }

    pub fn accel_cpu_ops(&self, key: AccelArchKey) -> Option<Arc<dyn AccelCpuOps>> {
        self.accel_cpu_ops.read().unwrap().get(&key).cloned()
    }

    /// Customize every CPU class that has hooks for `backend`.
    /// Returns the number of classes customized. On error no class
    /// is replaced.
    pub fn init_cpu_interfaces(&self, backend: BackendKind) -> Result<usize, AccelError> {
        let mut classes = self.cpu_classes.write().unwrap();
        let mut customized = Vec::new();
        for (&name, class) in classes.iter() {
            let key = AccelArchKey::new(backend, class.arch);
            if let Some(hooks) = self.accel_cpu_ops(key) {
                customized.push((name, Arc::new(class.customized(backend, hooks)?)));
            }
        }
        let count = customized.len();
        for (name, class) in customized {
            debug!(cpu = name, %backend, "CPU class customized");
            classes.insert(name, class);
        }
        Ok(count)
    }
}
