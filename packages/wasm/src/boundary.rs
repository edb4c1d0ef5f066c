//! Boundary context
//!
//! [`Boundary`] owns everything one module instance shares with the host:
//! linear memory views, the extern reference table, the exception slot, the
//! closure and adapter registries, the microtask queue and the import linker.
//! It is cheap to clone. Locks are held only for the duration of a single
//! table or memory operation and never across a call into the module or into
//! a host function. The one exception is the re-entrant execution lock, which
//! a thread holds for the whole of a module call or memory access so that
//! calls from other threads wait their turn.

use crate::abi::{exports, AbiValue, WasmAbi};
use crate::closure::ClosureRegistry;
use crate::config::BoundaryConfig;
use crate::error::{BoundaryError, BoundaryResult};
use crate::exception::ExceptionSlot;
use crate::imports::logging::ConsoleBuffer;
use crate::imports::{ImportFn, ImportLinker};
use crate::memory::{LinearMemory, MemoryViews, VecMemory};
use crate::module::ModuleExports;
use crate::promise::MicrotaskQueue;
use crate::streams::AdapterLeaks;
use crate::table::ExternRefTable;
use crate::value::HostValue;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard, RwLock};
use std::fmt;
use std::sync::{Arc, Weak};

pub(crate) struct BoundaryInner {
    pub(crate) config: BoundaryConfig,
    pub(crate) memory: Mutex<MemoryViews>,
    pub(crate) table: Mutex<ExternRefTable>,
    pub(crate) exception: ExceptionSlot,
    pub(crate) closures: ClosureRegistry,
    pub(crate) adapters: AdapterLeaks,
    pub(crate) microtasks: MicrotaskQueue,
    pub(crate) console: ConsoleBuffer,
    exec: ReentrantMutex<()>,
    module: RwLock<Option<Arc<dyn ModuleExports>>>,
    imports: RwLock<ImportLinker>,
}

/// Host-side context for one module instance
#[derive(Clone)]
pub struct Boundary {
    pub(crate) inner: Arc<BoundaryInner>,
}

/// Non-owning reference to a [`Boundary`], held by host functions and
/// adapters the boundary itself may own.
#[derive(Clone)]
pub(crate) struct WeakBoundary(Weak<BoundaryInner>);

impl WeakBoundary {
    pub(crate) fn upgrade(&self) -> Option<Boundary> {
        self.0.upgrade().map(|inner| Boundary { inner })
    }
}

/// Result of [`Boundary::sweep_finalizers`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Leaked closures whose destructor ran
    pub closures: usize,
    /// Leaked stream adapters freed
    pub adapters: usize,
}

impl Boundary {
    /// Create a boundary over `memory` with the host imports selected by
    /// `config.capabilities`
    pub fn new(config: BoundaryConfig, memory: impl LinearMemory + 'static) -> BoundaryResult<Self> {
        let imports = ImportLinker::with_host_imports(config.capabilities)?;
        let table = ExternRefTable::new(
            config.limits.initial_table_size,
            config.limits.max_table_slots,
        );

        tracing::debug!(
            capabilities = ?config.capabilities,
            initial_table_size = config.limits.initial_table_size,
            "creating boundary"
        );

        Ok(Self {
            inner: Arc::new(BoundaryInner {
                memory: Mutex::new(MemoryViews::new(Box::new(memory))),
                table: Mutex::new(table),
                exception: ExceptionSlot::default(),
                closures: ClosureRegistry::default(),
                adapters: AdapterLeaks::default(),
                microtasks: MicrotaskQueue::default(),
                console: ConsoleBuffer::default(),
                exec: ReentrantMutex::new(()),
                module: RwLock::new(None),
                imports: RwLock::new(imports),
                config,
            }),
        })
    }

    /// Boundary over an in-process memory of `initial_pages`, capped at the
    /// configured page limit
    pub fn in_memory(config: BoundaryConfig, initial_pages: u32) -> BoundaryResult<Self> {
        let memory = VecMemory::new(initial_pages).with_maximum(config.limits.max_memory_pages);
        Self::new(config, memory)
    }

    pub fn config(&self) -> &BoundaryConfig {
        &self.inner.config
    }

    pub(crate) fn downgrade(&self) -> WeakBoundary {
        WeakBoundary(Arc::downgrade(&self.inner))
    }

    /// Attach a module: adopt its linear memory if it brings one, reset
    /// cached views, seed the reserved table slots and run `__wbindgen_start`
    /// if the module exports it
    pub fn attach(&self, module: Arc<dyn ModuleExports>) -> BoundaryResult<()> {
        let _exec = self.lock_execution();
        *self.inner.module.write() = Some(Arc::clone(&module));
        match module.memory() {
            Some(memory) => *self.inner.memory.lock() = MemoryViews::new(memory),
            None => self.inner.memory.lock().invalidate(),
        }
        self.init_externref_table();
        tracing::info!(memory_size = self.memory_size(), "module attached");

        if module.has_export(exports::START) {
            module.call(self, exports::START, &[])?;
        }
        Ok(())
    }

    pub fn module(&self) -> BoundaryResult<Arc<dyn ModuleExports>> {
        self.inner
            .module
            .read()
            .clone()
            .ok_or(BoundaryError::ModuleNotAttached)
    }

    pub fn is_attached(&self) -> bool {
        self.inner.module.read().is_some()
    }

    /// Hold off module calls and memory access from other threads
    pub(crate) fn lock_execution(&self) -> ReentrantMutexGuard<'_, ()> {
        self.inner.exec.lock()
    }

    // Linear memory

    /// Run `f` with the view cache locked. `f` must not call back into the
    /// boundary.
    pub fn with_views<R>(&self, f: impl FnOnce(&mut MemoryViews) -> R) -> R {
        let _exec = self.lock_execution();
        f(&mut self.inner.memory.lock())
    }

    pub fn memory_size(&self) -> usize {
        self.with_views(|views| views.size())
    }

    /// Grow linear memory by `pages`, returning the previous size in pages
    pub fn grow_memory(&self, pages: u64) -> BoundaryResult<u64> {
        let max = self.inner.config.limits.max_memory_pages as u64;
        let previous = self.with_views(|memory| {
            let current = memory.size_pages();
            if current.saturating_add(pages) > max {
                return Err(BoundaryError::MemoryGrow {
                    pages,
                    message: format!("limit is {} pages, currently {}", max, current),
                });
            }
            memory.grow(pages)
        })?;
        tracing::debug!(previous, pages, "grew linear memory");
        Ok(previous)
    }

    pub fn read_bytes(&self, ptr: u32, len: u32) -> BoundaryResult<Vec<u8>> {
        self.with_views(|views| views.bytes().read(ptr, len).map(<[u8]>::to_vec))
    }

    pub fn write_bytes(&self, ptr: u32, data: &[u8]) -> BoundaryResult<()> {
        self.with_views(|views| views.bytes().write(ptr, data))
    }

    pub fn read_u32(&self, ptr: u32) -> BoundaryResult<u32> {
        self.with_views(|views| views.data_view().get_u32(ptr))
    }

    pub fn write_u32(&self, ptr: u32, value: u32) -> BoundaryResult<()> {
        self.with_views(|views| views.data_view().set_u32(ptr, value))
    }

    pub fn read_f64(&self, ptr: u32) -> BoundaryResult<f64> {
        self.with_views(|views| views.data_view().get_f64(ptr))
    }

    pub fn write_f64(&self, ptr: u32, value: f64) -> BoundaryResult<()> {
        self.with_views(|views| views.data_view().set_f64(ptr, value))
    }

    /// Number of view rebuilds so far
    pub fn view_rebuilds(&self) -> u64 {
        self.with_views(|views| views.rebuild_count())
    }

    // Extern reference table

    /// Re-seed the reserved constants in slots 0..=3
    pub fn init_externref_table(&self) {
        self.inner.table.lock().init_reserved();
    }

    pub fn alloc_ref(&self, value: HostValue) -> BoundaryResult<u32> {
        self.inner.table.lock().alloc(value)
    }

    pub fn get_ref(&self, handle: u32) -> BoundaryResult<HostValue> {
        self.inner.table.lock().get(handle)
    }

    /// Read and release a handle
    pub fn take_ref(&self, handle: u32) -> BoundaryResult<HostValue> {
        let value = self.inner.table.lock().take(handle)?;
        Ok(value)
    }

    pub fn free_ref(&self, handle: u32) -> BoundaryResult<()> {
        let value = self.inner.table.lock().free(handle)?;
        drop(value);
        Ok(())
    }

    pub fn clone_ref(&self, handle: u32) -> BoundaryResult<u32> {
        self.inner.table.lock().clone_ref(handle)
    }

    /// Resolve `len` little-endian u32 handles stored at `ptr` and release
    /// them. Nothing is released unless every handle resolves.
    pub fn get_multiple(&self, ptr: u32, len: u32) -> BoundaryResult<Vec<HostValue>> {
        let handles = self.with_views(|views| {
            let view = views.data_view();
            (0..len)
                .map(|i| {
                    let addr = i
                        .checked_mul(4)
                        .and_then(|offset| ptr.checked_add(offset))
                        .ok_or_else(|| {
                            BoundaryError::memory_access(format!(
                                "handle list of {} entries at {:#x} overflows",
                                len, ptr
                            ))
                        })?;
                    view.get_u32(addr)
                })
                .collect::<BoundaryResult<Vec<u32>>>()
        })?;
        self.inner.table.lock().take_many(&handles)
    }

    /// Live non-reserved handles
    pub fn live_refs(&self) -> usize {
        self.inner.table.lock().live_count()
    }

    pub fn table_capacity(&self) -> u32 {
        self.inner.table.lock().capacity()
    }

    // Module calls

    pub fn has_export(&self, name: &str) -> bool {
        self.module().map(|m| m.has_export(name)).unwrap_or(false)
    }

    pub fn call_export(&self, name: &str, args: &[AbiValue]) -> BoundaryResult<Vec<AbiValue>> {
        let module = self.module()?;
        let _exec = self.lock_execution();
        module.call(self, name, args)
    }

    pub fn call_indirect(&self, index: u32, args: &[AbiValue]) -> BoundaryResult<Vec<AbiValue>> {
        let module = self.module()?;
        let _exec = self.lock_execution();
        module.call_indirect(self, index, args)
    }

    /// `__wbindgen_malloc(size, align)`
    pub fn malloc(&self, size: u32, align: u32) -> BoundaryResult<u32> {
        let results = self.call_export(exports::MALLOC, &[size.into(), align.into()])?;
        WasmAbi::result_u32(exports::MALLOC, &results, 0)
    }

    /// `__wbindgen_realloc(ptr, old_size, new_size, align)`
    pub fn realloc(&self, ptr: u32, old_size: u32, new_size: u32, align: u32) -> BoundaryResult<u32> {
        let results = self.call_export(
            exports::REALLOC,
            &[ptr.into(), old_size.into(), new_size.into(), align.into()],
        )?;
        WasmAbi::result_u32(exports::REALLOC, &results, 0)
    }

    /// `__wbindgen_free(ptr, size, align)`
    pub fn free(&self, ptr: u32, size: u32, align: u32) -> BoundaryResult<()> {
        self.call_export(exports::FREE, &[ptr.into(), size.into(), align.into()])?;
        Ok(())
    }

    // Imports

    /// Invoke the host import `module::name` as the module would
    pub fn call_import(
        &self,
        module: &str,
        name: &str,
        args: &[AbiValue],
    ) -> BoundaryResult<Vec<AbiValue>> {
        let import = self.resolve_import(module, name)?;
        import(self, args)
    }

    pub(crate) fn resolve_import(&self, module: &str, name: &str) -> BoundaryResult<Arc<ImportFn>> {
        self.inner
            .imports
            .read()
            .get(module, name)
            .ok_or_else(|| BoundaryError::MissingImport {
                module: module.to_string(),
                name: name.to_string(),
            })
    }

    /// Define every function import `module` declares on `linker`
    #[cfg(feature = "wasmtime")]
    pub(crate) fn link_imports(
        &self,
        linker: &mut wasmtime::Linker<crate::instance::StoreData>,
        module: &wasmtime::Module,
    ) -> BoundaryResult<usize> {
        self.inner.imports.read().define_on(linker, module)
    }

    pub fn has_import(&self, module: &str, name: &str) -> bool {
        self.inner.imports.read().get(module, name).is_some()
    }

    /// Register an embedder-defined import
    pub fn define_import<F>(&self, module: &str, name: &str, f: F) -> BoundaryResult<()>
    where
        F: Fn(&Boundary, &[AbiValue]) -> BoundaryResult<Vec<AbiValue>> + Send + Sync + 'static,
    {
        self.inner.imports.write().func_wrap(module, name, f)
    }

    // Scheduling and lifetime

    /// Drain the microtask queue, returning how many tasks ran
    pub fn run_microtasks(&self) -> usize {
        self.inner.microtasks.run_until_idle()
    }

    pub fn pending_microtasks(&self) -> usize {
        self.inner.microtasks.len()
    }

    /// Release module resources whose host-side owners were dropped without
    /// an explicit release. Never the primary release path.
    pub fn sweep_finalizers(&self) -> SweepReport {
        let report = SweepReport {
            closures: self.sweep_closures(),
            adapters: self.sweep_adapters(),
        };
        if report != SweepReport::default() {
            tracing::debug!(?report, "finalizer sweep released leaked resources");
        }
        report
    }
}

impl fmt::Debug for Boundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Boundary")
            .field("attached", &self.is_attached())
            .field("memory_size", &self.memory_size())
            .field("live_refs", &self.live_refs())
            .field("capabilities", &self.inner.config.capabilities)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BoundaryLimits;
    use crate::memory::PAGE_SIZE;
    use crate::module::InProcessModule;

    fn boundary() -> Boundary {
        Boundary::in_memory(BoundaryConfig::development(), 1).unwrap()
    }

    #[test]
    fn test_calls_without_module_fail() {
        let cx = boundary();
        assert!(matches!(cx.malloc(4, 1), Err(BoundaryError::ModuleNotAttached)));
        assert!(!cx.has_export(exports::MALLOC));
    }

    #[test]
    fn test_attach_runs_start() {
        let cx = boundary();
        let module = InProcessModule::new().export(exports::START, |cx, _| {
            cx.write_u32(0, 0xfeed)?;
            Ok(Vec::new())
        });
        cx.attach(Arc::new(module)).unwrap();
        assert_eq!(cx.read_u32(0).unwrap(), 0xfeed);
    }

    #[test]
    fn test_grow_memory_respects_limit() {
        let config = BoundaryConfig::development()
            .with_limits(BoundaryLimits::default().with_max_memory_pages(2));
        let cx = Boundary::in_memory(config, 1).unwrap();
        assert_eq!(cx.grow_memory(1).unwrap(), 1);
        assert_eq!(cx.memory_size(), 2 * PAGE_SIZE);
        assert!(matches!(cx.grow_memory(1), Err(BoundaryError::MemoryGrow { .. })));
    }

    #[test]
    fn test_get_multiple_reads_handle_list() {
        let cx = boundary();
        let a = cx.alloc_ref("a".into()).unwrap();
        let b = cx.alloc_ref(2.0.into()).unwrap();
        cx.write_u32(64, a).unwrap();
        cx.write_u32(68, b).unwrap();

        let values = cx.get_multiple(64, 2).unwrap();
        assert_eq!(values[0].as_str(), Some("a"));
        assert_eq!(values[1].as_f64(), Some(2.0));
        assert_eq!(cx.live_refs(), 0);
    }

    #[test]
    fn test_get_multiple_leaves_table_untouched_on_failure() {
        let cx = boundary();
        let a = cx.alloc_ref("a".into()).unwrap();
        cx.write_u32(64, a).unwrap();
        cx.write_u32(68, 500).unwrap();

        assert!(matches!(cx.get_multiple(64, 2), Err(BoundaryError::InvalidHandle(500))));
        assert_eq!(cx.get_ref(a).unwrap().as_str(), Some("a"));
    }

    #[test]
    fn test_missing_import() {
        let cx = boundary();
        let err = cx.call_import("wbg", "__wbg_nope", &[]).unwrap_err();
        assert!(matches!(err, BoundaryError::MissingImport { .. }));

        cx.define_import("env", "answer", |_, _| Ok(vec![AbiValue::I32(42)])).unwrap();
        assert_eq!(cx.call_import("env", "answer", &[]).unwrap(), vec![AbiValue::I32(42)]);
        assert!(cx.define_import("env", "answer", |_, _| Ok(Vec::new())).is_err());
    }
}
