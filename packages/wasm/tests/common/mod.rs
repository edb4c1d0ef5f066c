//! Shared helpers for integration tests
//!
//! Tests drive the boundary with an [`InProcessModule`]: exports and function
//! table entries are Rust closures standing in for compiled module code.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use wasm_boundary::{AbiValue, Boundary, BoundaryConfig, BoundaryResult, InProcessModule};

pub fn config() -> BoundaryConfig {
    BoundaryConfig::development()
}

/// Boundary over one page of memory with `module` attached
pub fn attach(module: InProcessModule) -> (Boundary, Arc<InProcessModule>) {
    let cx = Boundary::in_memory(config(), 1).expect("boundary");
    let module = Arc::new(module);
    cx.attach(module.clone()).expect("attach");
    (cx, module)
}

pub fn attach_default() -> (Boundary, Arc<InProcessModule>) {
    attach(InProcessModule::new())
}

/// Destructor table entry counting its calls and recording each `(a, b)`
pub struct Destructor {
    pub index: u32,
    pub calls: Arc<AtomicUsize>,
    pub envs: Arc<parking_lot::Mutex<Vec<(u32, u32)>>>,
}

impl Destructor {
    pub fn install(module: &InProcessModule) -> Self {
        let calls = Arc::new(AtomicUsize::new(0));
        let envs = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let (counter, seen) = (Arc::clone(&calls), Arc::clone(&envs));
        let index = module.add_function(move |_, args| {
            counter.fetch_add(1, Ordering::SeqCst);
            let a = args[0].as_u32().unwrap_or_default();
            let b = args[1].as_u32().unwrap_or_default();
            seen.lock().push((a, b));
            Ok(Vec::new())
        });
        Self { index, calls, envs }
    }

    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Invoke shim that frees every argument handle it receives and returns
/// nothing
pub fn install_noop_invoke(module: &InProcessModule) -> u32 {
    module.add_function(|cx, args| {
        release_arg_handles(cx, args)?;
        Ok(Vec::new())
    })
}

/// Free the handle arguments following `(a, b)`
pub fn release_arg_handles(cx: &Boundary, args: &[AbiValue]) -> BoundaryResult<()> {
    for arg in &args[2..] {
        if let Some(handle) = arg.as_u32() {
            cx.free_ref(handle)?;
        }
    }
    Ok(())
}
