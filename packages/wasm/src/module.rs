//! Compiled module interface
//!
//! The boundary talks to the module only through [`ModuleExports`]: named
//! export calls and indirect calls through the module's function table
//! (destructors and invoke shims). [`InProcessModule`] implements it with
//! native functions; compiled modules go through
//! [`WasmtimeModule`](crate::instance::WasmtimeModule).

use crate::abi::{exports, AbiValue, WasmAbi};
use crate::boundary::Boundary;
use crate::error::{BoundaryError, BoundaryResult};
use crate::memory::{LinearMemory, PAGE_SIZE};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Exports of an attached module
pub trait ModuleExports: Send + Sync {
    /// Call a named export
    fn call(&self, cx: &Boundary, name: &str, args: &[AbiValue]) -> BoundaryResult<Vec<AbiValue>>;

    /// Call entry `index` of the module's function table
    fn call_indirect(
        &self,
        cx: &Boundary,
        index: u32,
        args: &[AbiValue],
    ) -> BoundaryResult<Vec<AbiValue>>;

    fn has_export(&self, name: &str) -> bool;

    /// Linear memory the module brings with it. Modules without one use the
    /// memory the boundary was created over.
    fn memory(&self) -> Option<Box<dyn LinearMemory>> {
        None
    }
}

/// Native function standing in for module code
pub type ExportFn = dyn Fn(&Boundary, &[AbiValue]) -> BoundaryResult<Vec<AbiValue>> + Send + Sync;

/// Default start of the in-process heap
pub const DEFAULT_HEAP_BASE: u32 = 1024;

/// Allocator traffic recorded by [`InProcessModule`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocEvent {
    Malloc {
        size: u32,
        align: u32,
        ptr: u32,
    },
    Realloc {
        ptr: u32,
        old_size: u32,
        new_size: u32,
        result: u32,
    },
    Free {
        ptr: u32,
        size: u32,
    },
}

#[derive(Debug)]
struct BumpAllocator {
    next: u32,
    last: Option<u32>,
    live: HashMap<u32, u32>,
}

impl BumpAllocator {
    fn malloc(&mut self, cx: &Boundary, size: u32, align: u32) -> BoundaryResult<u32> {
        check_align(exports::MALLOC, align)?;
        if size == 0 {
            return Ok(align);
        }
        let ptr = align_up(self.next, align)
            .ok_or_else(|| BoundaryError::trap(exports::MALLOC, "heap address overflow"))?;
        let end = ptr
            .checked_add(size)
            .ok_or_else(|| BoundaryError::trap(exports::MALLOC, "heap address overflow"))?;
        ensure_capacity(cx, end)?;
        self.next = end;
        self.last = Some(ptr);
        self.live.insert(ptr, size);
        Ok(ptr)
    }

    fn realloc(
        &mut self,
        cx: &Boundary,
        ptr: u32,
        old_size: u32,
        new_size: u32,
        align: u32,
    ) -> BoundaryResult<u32> {
        if old_size == 0 {
            return self.malloc(cx, new_size, align);
        }
        if self.live.get(&ptr) != Some(&old_size) {
            return Err(BoundaryError::trap(
                exports::REALLOC,
                format!("no live allocation of {} bytes at {:#x}", old_size, ptr),
            ));
        }

        // The most recent allocation is resized in place.
        if self.last == Some(ptr) && ptr + old_size == self.next {
            let end = ptr
                .checked_add(new_size)
                .ok_or_else(|| BoundaryError::trap(exports::REALLOC, "heap address overflow"))?;
            ensure_capacity(cx, end)?;
            self.next = end;
            self.live.insert(ptr, new_size);
            return Ok(ptr);
        }

        let moved = self.malloc(cx, new_size, align)?;
        cx.with_views(|views| views.bytes().copy_within(ptr, moved, old_size.min(new_size)))?;
        self.live.remove(&ptr);
        Ok(moved)
    }

    fn free(&mut self, ptr: u32, size: u32) -> BoundaryResult<()> {
        if size == 0 {
            return Ok(());
        }
        match self.live.remove(&ptr) {
            Some(recorded) if recorded == size => {
                if self.last == Some(ptr) && ptr + size == self.next {
                    self.next = ptr;
                    self.last = None;
                }
                Ok(())
            }
            Some(recorded) => {
                self.live.insert(ptr, recorded);
                Err(BoundaryError::trap(
                    exports::FREE,
                    format!(
                        "free of {:#x} with size {} but {} bytes were allocated",
                        ptr, size, recorded
                    ),
                ))
            }
            None => Err(BoundaryError::trap(
                exports::FREE,
                format!("free of unknown pointer {:#x}", ptr),
            )),
        }
    }
}

fn check_align(function: &str, align: u32) -> BoundaryResult<()> {
    if align.is_power_of_two() {
        Ok(())
    } else {
        Err(BoundaryError::trap(
            function,
            format!("alignment {} is not a power of two", align),
        ))
    }
}

fn align_up(value: u32, align: u32) -> Option<u32> {
    let mask = align - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

fn ensure_capacity(cx: &Boundary, end: u32) -> BoundaryResult<()> {
    let size = cx.memory_size();
    if end as usize > size {
        let missing = end as usize - size;
        let pages = missing.div_ceil(PAGE_SIZE) as u64;
        cx.grow_memory(pages)?;
    }
    Ok(())
}

/// Module implemented by native closures over a boundary-owned memory.
///
/// Provides the allocator exports with a bump allocator and records its
/// traffic. Function table entry 0 is the null function.
pub struct InProcessModule {
    exports: RwLock<HashMap<String, Arc<ExportFn>>>,
    table: RwLock<Vec<Option<Arc<ExportFn>>>>,
    heap: Mutex<BumpAllocator>,
    log: Mutex<Vec<AllocEvent>>,
    realloc: bool,
}

impl Default for InProcessModule {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessModule {
    pub fn new() -> Self {
        Self {
            exports: RwLock::new(HashMap::new()),
            table: RwLock::new(vec![None]),
            heap: Mutex::new(BumpAllocator {
                next: DEFAULT_HEAP_BASE,
                last: None,
                live: HashMap::new(),
            }),
            log: Mutex::new(Vec::new()),
            realloc: true,
        }
    }

    pub fn with_heap_base(self, base: u32) -> Self {
        self.heap.lock().next = base;
        self
    }

    /// Do not export `__wbindgen_realloc`
    pub fn without_realloc(mut self) -> Self {
        self.realloc = false;
        self
    }

    pub fn export<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Boundary, &[AbiValue]) -> BoundaryResult<Vec<AbiValue>> + Send + Sync + 'static,
    {
        self.define_export(name, f);
        self
    }

    pub fn define_export<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&Boundary, &[AbiValue]) -> BoundaryResult<Vec<AbiValue>> + Send + Sync + 'static,
    {
        self.exports.write().insert(name.into(), Arc::new(f));
    }

    /// Append a function table entry and return its index
    pub fn add_function<F>(&self, f: F) -> u32
    where
        F: Fn(&Boundary, &[AbiValue]) -> BoundaryResult<Vec<AbiValue>> + Send + Sync + 'static,
    {
        let mut table = self.table.write();
        table.push(Some(Arc::new(f)));
        (table.len() - 1) as u32
    }

    pub fn alloc_log(&self) -> Vec<AllocEvent> {
        self.log.lock().clone()
    }

    pub fn clear_alloc_log(&self) {
        self.log.lock().clear();
    }

    /// Allocations not yet freed
    pub fn live_allocations(&self) -> usize {
        self.heap.lock().live.len()
    }

    fn record(&self, event: AllocEvent) {
        self.log.lock().push(event);
    }
}

impl ModuleExports for InProcessModule {
    fn call(&self, cx: &Boundary, name: &str, args: &[AbiValue]) -> BoundaryResult<Vec<AbiValue>> {
        match name {
            exports::MALLOC => {
                let size = WasmAbi::arg_u32(name, args, 0)?;
                let align = WasmAbi::arg_u32(name, args, 1)?;
                let ptr = self.heap.lock().malloc(cx, size, align)?;
                self.record(AllocEvent::Malloc { size, align, ptr });
                Ok(vec![ptr.into()])
            }
            exports::REALLOC if self.realloc => {
                let ptr = WasmAbi::arg_u32(name, args, 0)?;
                let old_size = WasmAbi::arg_u32(name, args, 1)?;
                let new_size = WasmAbi::arg_u32(name, args, 2)?;
                let align = WasmAbi::arg_u32(name, args, 3)?;
                let result = self.heap.lock().realloc(cx, ptr, old_size, new_size, align)?;
                self.record(AllocEvent::Realloc {
                    ptr,
                    old_size,
                    new_size,
                    result,
                });
                Ok(vec![result.into()])
            }
            exports::FREE => {
                let ptr = WasmAbi::arg_u32(name, args, 0)?;
                let size = WasmAbi::arg_u32(name, args, 1)?;
                self.heap.lock().free(ptr, size)?;
                self.record(AllocEvent::Free { ptr, size });
                Ok(Vec::new())
            }
            _ => {
                let export = self
                    .exports
                    .read()
                    .get(name)
                    .cloned()
                    .ok_or_else(|| BoundaryError::missing_export(name))?;
                export(cx, args)
            }
        }
    }

    fn call_indirect(
        &self,
        cx: &Boundary,
        index: u32,
        args: &[AbiValue],
    ) -> BoundaryResult<Vec<AbiValue>> {
        let entry = self
            .table
            .read()
            .get(index as usize)
            .cloned()
            .flatten()
            .ok_or_else(|| {
                BoundaryError::trap(
                    "call_indirect",
                    format!("table entry {} is null or out of range", index),
                )
            })?;
        entry(cx, args)
    }

    fn has_export(&self, name: &str) -> bool {
        match name {
            exports::MALLOC | exports::FREE => true,
            exports::REALLOC => self.realloc,
            _ => self.exports.read().contains_key(name),
        }
    }
}

impl fmt::Debug for InProcessModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self.exports.read().keys().cloned().collect();
        names.sort();
        f.debug_struct("InProcessModule")
            .field("exports", &names)
            .field("table_len", &self.table.read().len())
            .field("realloc", &self.realloc)
            .finish()
    }
}
