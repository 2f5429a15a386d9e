#![allow(dead_code)]

use kestrel_kernel::{Kernel, KernelConfig, Priority};
use std::sync::{Arc, Mutex};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn pri(value: u8) -> Priority {
    Priority::new(value).unwrap()
}

pub fn boot_with(config: KernelConfig) -> Arc<Kernel> {
    init_logging();
    Kernel::boot(config).unwrap()
}

/// Boots a kernel whose main thread runs at `main`.
pub fn boot_at(main: u8) -> Arc<Kernel> {
    boot_with(KernelConfig {
        main_priority: pri(main),
        ..KernelConfig::default()
    })
}

/// Ordered record of what kernel threads did.
#[derive(Clone, Default)]
pub struct Trace(Arc<Mutex<Vec<String>>>);

impl Trace {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}
