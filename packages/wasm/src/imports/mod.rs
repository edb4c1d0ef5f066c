//! Host imports
//!
//! The functions a module links against: ABI intrinsics that are always
//! present plus capability-gated families (closures, promises, streams,
//! console). Imports are keyed by `(module, name)` like a wasm import section.

mod linker;
pub mod logging;

pub use logging::{LogEntry, LogLevel};

use crate::abi::AbiValue;
use crate::boundary::Boundary;
use crate::config::HostCapabilities;
use crate::error::{BoundaryError, BoundaryResult};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A host import as the module sees it
pub type ImportFn = dyn Fn(&Boundary, &[AbiValue]) -> BoundaryResult<Vec<AbiValue>> + Send + Sync;

/// Registry of host imports
#[derive(Default)]
pub struct ImportLinker {
    funcs: HashMap<(String, String), Arc<ImportFn>>,
}

impl ImportLinker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Linker with the intrinsics and every import family in `capabilities`
    pub fn with_host_imports(capabilities: HostCapabilities) -> BoundaryResult<Self> {
        let mut linker = Self::new();
        linker::register_host_imports(&mut linker, capabilities)?;
        tracing::trace!(imports = linker.len(), ?capabilities, "host imports registered");
        Ok(linker)
    }

    /// Register `module::name`. Registering a name twice is an error.
    pub fn func_wrap<F>(&mut self, module: &str, name: &str, f: F) -> BoundaryResult<()>
    where
        F: Fn(&Boundary, &[AbiValue]) -> BoundaryResult<Vec<AbiValue>> + Send + Sync + 'static,
    {
        let key = (module.to_string(), name.to_string());
        if self.funcs.contains_key(&key) {
            return Err(BoundaryError::Initialization(format!(
                "Failed to register {}::{}: already defined",
                module, name
            )));
        }
        self.funcs.insert(key, Arc::new(f));
        Ok(())
    }

    /// Register an import whose host throws are parked in the exception slot.
    /// On a throw the module receives `results` zero words.
    pub fn func_wrap_fallible<F>(
        &mut self,
        module: &str,
        name: &str,
        results: usize,
        f: F,
    ) -> BoundaryResult<()>
    where
        F: Fn(&Boundary, &[AbiValue]) -> BoundaryResult<Vec<AbiValue>> + Send + Sync + 'static,
    {
        self.func_wrap(module, name, move |cx, args| {
            let returned = cx.handle_error(|| f(cx, args).map(Some))?;
            Ok(returned.unwrap_or_else(|| vec![AbiValue::I32(0); results]))
        })
    }

    pub fn get(&self, module: &str, name: &str) -> Option<Arc<ImportFn>> {
        self.funcs
            .get(&(module.to_string(), name.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }

    /// Define every function import `module` declares on a wasmtime linker,
    /// typed by the declaration. Returns how many were defined.
    #[cfg(feature = "wasmtime")]
    pub fn define_on(
        &self,
        linker: &mut wasmtime::Linker<crate::instance::StoreData>,
        module: &wasmtime::Module,
    ) -> BoundaryResult<usize> {
        let mut defined = 0;
        for import in module.imports() {
            let wasmtime::ExternType::Func(ty) = import.ty() else {
                continue;
            };
            let (module_name, name) = (import.module(), import.name());
            let host = self
                .get(module_name, name)
                .ok_or_else(|| BoundaryError::MissingImport {
                    module: module_name.to_string(),
                    name: name.to_string(),
                })?;
            let label = format!("{}::{}", module_name, name);
            let result_types: Vec<wasmtime::ValType> = ty.results().collect();

            let registered = label.clone();
            linker
                .func_new(module_name, name, ty, move |mut caller, params, results| {
                    crate::instance::dispatch_import(
                        &mut caller,
                        &label,
                        host.as_ref(),
                        &result_types,
                        params,
                        results,
                    )
                })
                .map_err(|e| {
                    BoundaryError::Initialization(format!("Failed to register {}: {}", registered, e))
                })?;
            defined += 1;
        }
        Ok(defined)
    }

    /// Registered `(module, name)` pairs, sorted
    pub fn names(&self) -> Vec<(String, String)> {
        let mut names: Vec<_> = self.funcs.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for ImportLinker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportLinker")
            .field("imports", &self.funcs.len())
            .finish()
    }
}
