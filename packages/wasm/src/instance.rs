//! Modules compiled and instantiated with wasmtime
//!
//! [`WasmtimeModule`] owns the store of one instance. Exports are called
//! through [`Func`] handles and closure shims through the module's exported
//! function table. Host imports are defined on a [`Linker`] from the
//! boundary's [`ImportLinker`](crate::imports::ImportLinker), typed by the
//! module's own import declarations.
//!
//! While a host import runs, the store is reachable only through its
//! [`Caller`]. The import lends the caller to the [`StoreCell`] for its
//! duration, so memory access and nested export calls made by the host go
//! through the caller instead of re-locking the store.

use crate::abi::{exports, AbiValue};
use crate::boundary::{Boundary, WeakBoundary};
use crate::config::BoundaryConfig;
use crate::error::{BoundaryError, BoundaryResult};
use crate::imports::ImportFn;
use crate::memory::{LinearMemory, WasmtimeMemory};
use crate::module::ModuleExports;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;
use std::sync::{Arc, OnceLock, Weak};
use wasmtime::{
    AsContextMut, Caller, Engine, Extern, Func, Instance, Linker, Memory, Module, Ref, RefType,
    Store, StoreContextMut, Table, Val, ValType,
};

/// Data carried by every store the boundary creates
pub struct StoreData {
    boundary: WeakBoundary,
    cell: OnceLock<Weak<StoreCell>>,
}

impl StoreData {
    fn new(cx: &Boundary) -> Self {
        Self {
            boundary: cx.downgrade(),
            cell: OnceLock::new(),
        }
    }

    /// Boundary and store cell behind a host import
    fn resolve(&self) -> BoundaryResult<(Boundary, Arc<StoreCell>)> {
        let cx = self.boundary.upgrade().ok_or(BoundaryError::ModuleNotAttached)?;
        let cell = self
            .cell
            .get()
            .and_then(Weak::upgrade)
            .ok_or(BoundaryError::ModuleNotAttached)?;
        Ok((cx, cell))
    }
}

/// A caller lent by a running host import
struct LentCaller(NonNull<Caller<'static, StoreData>>);

// SAFETY: a lent caller is only dereferenced by the thread running the import
// that lent it. That thread holds the boundary's execution lock for the whole
// module call, so no other thread reaches the lent stack meanwhile.
unsafe impl Send for LentCaller {}

/// Store of one instance plus the callers lent by host imports in flight
pub(crate) struct StoreCell {
    store: Mutex<Store<StoreData>>,
    lent: Mutex<Vec<Option<LentCaller>>>,
    /// Host error raised by an import, kept while the trap unwinds the module
    unwinding: Mutex<Option<BoundaryError>>,
}

impl StoreCell {
    fn new(store: Store<StoreData>) -> Arc<Self> {
        let cell = Arc::new(Self {
            store: Mutex::new(store),
            lent: Mutex::new(Vec::new()),
            unwinding: Mutex::new(None),
        });
        let _ = cell.store.lock().data().cell.set(Arc::downgrade(&cell));
        cell
    }

    /// Run `f` against the innermost lent caller, or against the owned store
    /// when no import is running. Callers must hold the boundary's execution
    /// lock.
    pub(crate) fn with_context<R>(
        &self,
        f: impl FnOnce(StoreContextMut<'_, StoreData>) -> R,
    ) -> BoundaryResult<R> {
        let lent = {
            let mut lent = self.lent.lock();
            match lent.last_mut() {
                Some(slot) => Some(slot.take().ok_or_else(store_busy)?),
                None => None,
            }
        };

        match lent {
            Some(LentCaller(mut ptr)) => {
                let _give_back = GiveBack { lent: &self.lent, ptr };
                // SAFETY: `lend` pushed this pointer from a `&mut Caller` that
                // outlives the import still on the stack. The slot was emptied
                // above, so this is the only live borrow until `GiveBack` runs,
                // and the context cannot escape `f`.
                let caller = unsafe { ptr.as_mut() };
                Ok(f(caller.as_context_mut()))
            }
            None => {
                let mut store = self.store.try_lock().ok_or_else(store_busy)?;
                Ok(f(store.as_context_mut()))
            }
        }
    }

    /// Make `caller` the store context for everything `f` does
    fn lend<R>(&self, caller: &mut Caller<'_, StoreData>, f: impl FnOnce() -> R) -> R {
        let ptr = NonNull::from(caller).cast::<Caller<'static, StoreData>>();
        self.lent.lock().push(Some(LentCaller(ptr)));
        let _pop = PopLent(&self.lent);
        f()
    }

    fn park_unwinding(&self, error: BoundaryError) {
        *self.unwinding.lock() = Some(error);
    }

    /// The host error behind a failed module call, or the trap itself
    fn unwound(&self, function: &str, error: wasmtime::Error) -> BoundaryError {
        self.unwinding
            .lock()
            .take()
            .unwrap_or_else(|| BoundaryError::trap(function, format!("{:#}", error)))
    }
}

struct GiveBack<'a> {
    lent: &'a Mutex<Vec<Option<LentCaller>>>,
    ptr: NonNull<Caller<'static, StoreData>>,
}

impl Drop for GiveBack<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.lent.lock().last_mut() {
            *slot = Some(LentCaller(self.ptr));
        }
    }
}

struct PopLent<'a>(&'a Mutex<Vec<Option<LentCaller>>>);

impl Drop for PopLent<'_> {
    fn drop(&mut self) {
        self.0.lock().pop();
    }
}

fn store_busy() -> BoundaryError {
    BoundaryError::trap("store", "store is already in use by this call")
}

fn to_val(value: &AbiValue, ty: &ValType) -> Option<Val> {
    match ty {
        ValType::I32 => value.as_i32().map(Val::I32),
        ValType::I64 => value.as_i64().map(Val::I64),
        ValType::F32 => value.as_f64().map(|v| Val::F32((v as f32).to_bits())),
        ValType::F64 => value.as_f64().map(|v| Val::F64(v.to_bits())),
        _ => None,
    }
}

fn from_val(val: &Val) -> Option<AbiValue> {
    match val {
        Val::I32(v) => Some(AbiValue::I32(*v)),
        Val::I64(v) => Some(AbiValue::I64(*v)),
        Val::F32(bits) => Some(AbiValue::F32(f32::from_bits(*bits))),
        Val::F64(bits) => Some(AbiValue::F64(f64::from_bits(*bits))),
        _ => None,
    }
}

fn unsupported(function: &str, what: &str, value: impl fmt::Debug) -> BoundaryError {
    BoundaryError::trap(function, format!("unsupported {} {:?}", what, value))
}

/// Body of every host import defined on a wasmtime linker
pub(crate) fn dispatch_import(
    caller: &mut Caller<'_, StoreData>,
    label: &str,
    import: &ImportFn,
    result_types: &[ValType],
    params: &[Val],
    results: &mut [Val],
) -> wasmtime::Result<()> {
    let (cx, cell) = match caller.data().resolve() {
        Ok(resolved) => resolved,
        Err(e) => return Err(wasmtime::Error::msg(format!("{}: {}", label, e))),
    };

    let outcome = params
        .iter()
        .map(|val| from_val(val).ok_or_else(|| unsupported(label, "argument", val)))
        .collect::<BoundaryResult<Vec<AbiValue>>>()
        .and_then(|args| cell.lend(caller, || import(&cx, &args)))
        .and_then(|values| {
            if values.len() != result_types.len() {
                return Err(BoundaryError::trap(
                    label,
                    format!("returned {} values, module expects {}", values.len(), result_types.len()),
                ));
            }
            for ((slot, value), ty) in results.iter_mut().zip(&values).zip(result_types) {
                *slot = to_val(value, ty).ok_or_else(|| unsupported(label, "result", value))?;
            }
            Ok(())
        });

    outcome.map_err(|e| {
        let message = format!("{}: {}", label, e);
        cell.park_unwinding(e);
        wasmtime::Error::msg(message)
    })
}

/// A module instantiated against the boundary's host imports
pub struct WasmtimeModule {
    cell: Arc<StoreCell>,
    instance: Instance,
    memory: Memory,
    funcs: HashMap<String, Func>,
    table: Option<Table>,
}

impl WasmtimeModule {
    /// Link the imports `module` declares and instantiate it. The module is
    /// not attached; pass it to [`Boundary::attach`].
    pub fn instantiate(cx: &Boundary, engine: &Engine, module: &Module) -> BoundaryResult<Arc<Self>> {
        let mut linker = Linker::new(engine);
        linker.allow_shadowing(true);
        let linked = cx.link_imports(&mut linker, module)?;

        let cell = StoreCell::new(Store::new(engine, StoreData::new(cx)));
        let _exec = cx.lock_execution();

        let instance = cell
            .with_context(|mut ctx| linker.instantiate(&mut ctx, module))?
            .map_err(|e| match cell.unwinding.lock().take() {
                Some(host) => host,
                None => BoundaryError::Initialization(format!("Failed to instantiate module: {:#}", e)),
            })?;

        let (memory, funcs, tables) = cell.with_context(|mut ctx| {
            let mut memory = None;
            let mut funcs = HashMap::new();
            let mut tables = Vec::new();
            for export in instance.exports(&mut ctx) {
                let name = export.name().to_string();
                match export.into_extern() {
                    Extern::Func(func) => {
                        funcs.insert(name, func);
                    }
                    Extern::Memory(m) if name == exports::MEMORY => memory = Some(m),
                    Extern::Table(table) => tables.push((name, table)),
                    _ => {}
                }
            }
            let tables: Vec<(String, Table)> = tables
                .into_iter()
                .filter(|(_, table)| table.ty(&ctx).element().matches(&RefType::FUNCREF))
                .collect();
            (memory, funcs, tables)
        })?;

        let memory = memory.ok_or_else(|| BoundaryError::missing_export(exports::MEMORY))?;
        let table = tables
            .iter()
            .find(|(name, _)| name == exports::FUNCTION_TABLE)
            .or_else(|| tables.first())
            .map(|(_, table)| *table);

        tracing::info!(
            imports = linked,
            exports = funcs.len(),
            function_table = table.is_some(),
            "module instantiated"
        );

        Ok(Arc::new(Self {
            cell,
            instance,
            memory,
            funcs,
            table,
        }))
    }

    pub fn instance(&self) -> Instance {
        self.instance
    }

    /// Names of the exported functions, sorted
    pub fn export_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.funcs.keys().cloned().collect();
        names.sort();
        names
    }

    fn call_func(&self, function: &str, func: Func, args: &[AbiValue]) -> BoundaryResult<Vec<AbiValue>> {
        self.cell.with_context(|mut ctx| {
            let ty = func.ty(&ctx);
            if ty.params().len() != args.len() {
                return Err(BoundaryError::trap(
                    function,
                    format!("called with {} arguments, expects {}", args.len(), ty.params().len()),
                ));
            }
            let params = ty
                .params()
                .zip(args)
                .map(|(ty, arg)| to_val(arg, &ty).ok_or_else(|| unsupported(function, "argument", arg)))
                .collect::<BoundaryResult<Vec<Val>>>()?;
            let mut results = vec![Val::I32(0); ty.results().len()];

            func.call(&mut ctx, &params, &mut results)
                .map_err(|e| self.cell.unwound(function, e))?;

            results
                .iter()
                .map(|val| from_val(val).ok_or_else(|| unsupported(function, "result", val)))
                .collect()
        })?
    }
}

impl ModuleExports for WasmtimeModule {
    fn call(&self, cx: &Boundary, name: &str, args: &[AbiValue]) -> BoundaryResult<Vec<AbiValue>> {
        let _exec = cx.lock_execution();
        let func = *self
            .funcs
            .get(name)
            .ok_or_else(|| BoundaryError::missing_export(name))?;
        self.call_func(name, func, args)
    }

    fn call_indirect(
        &self,
        cx: &Boundary,
        index: u32,
        args: &[AbiValue],
    ) -> BoundaryResult<Vec<AbiValue>> {
        let _exec = cx.lock_execution();
        let table = self
            .table
            .ok_or_else(|| BoundaryError::missing_export(exports::FUNCTION_TABLE))?;
        let func = self.cell.with_context(|mut ctx| match table.get(&mut ctx, u64::from(index)) {
            Some(Ref::Func(Some(func))) => Ok(func),
            _ => Err(BoundaryError::trap(
                "call_indirect",
                format!("table entry {} is null or out of range", index),
            )),
        })??;
        self.call_func("call_indirect", func, args)
    }

    fn has_export(&self, name: &str) -> bool {
        self.funcs.contains_key(name)
    }

    fn memory(&self) -> Option<Box<dyn LinearMemory>> {
        Some(Box::new(WasmtimeMemory::new(self.memory, Arc::clone(&self.cell))))
    }
}

impl fmt::Debug for WasmtimeModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WasmtimeModule")
            .field("exports", &self.funcs.len())
            .field("function_table", &self.table.is_some())
            .finish()
    }
}

impl Boundary {
    /// Boundary with `module` instantiated and attached. Linear memory is the
    /// instance's `memory` export.
    pub fn instantiate(config: BoundaryConfig, engine: &Engine, module: &Module) -> BoundaryResult<Self> {
        let cx = Self::in_memory(config, 0)?;
        let instance = WasmtimeModule::instantiate(&cx, engine, module)?;
        cx.attach(instance)?;
        Ok(cx)
    }
}
