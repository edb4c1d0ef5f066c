//! Closure adapter registry
//!
//! Wraps a module closure environment `(a, b)` plus its destructor and invoke
//! shim table indices into a [`HostFunction`]. The module-side environment is
//! destroyed exactly once: by an explicit drop, by the cleanup step of the
//! call that brings the reference count to zero, or by a finalizer sweep
//! after the last host wrapper was dropped without release.

use crate::abi::{AbiValue, WasmAbi};
use crate::boundary::Boundary;
use crate::error::{BoundaryError, BoundaryResult};
use crate::value::{HostFunction, HostValue};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Invocation flavor of a module closure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosureKind {
    /// Valid for a single invocation
    OneShot,
    /// Reusable; the environment is detached during a call so re-entrant
    /// calls are rejected
    Mutable,
    /// Reusable; re-entrant calls are allowed
    Shared,
}

impl ClosureKind {
    pub fn from_abi(code: u32) -> Option<Self> {
        match code {
            0 => Some(ClosureKind::OneShot),
            1 => Some(ClosureKind::Mutable),
            2 => Some(ClosureKind::Shared),
            _ => None,
        }
    }
}

/// How the invoke shim returns its result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReturnKind {
    #[default]
    Unit,
    /// A single `f64`
    Number,
    /// A handle the host takes ownership of
    Handle,
    /// Packed `(ptr, len)` of `len` handles; the host frees the list
    HandleList,
}

impl ReturnKind {
    pub fn from_abi(code: u32) -> Option<Self> {
        match code {
            0 => Some(ReturnKind::Unit),
            1 => Some(ReturnKind::Number),
            2 => Some(ReturnKind::Handle),
            3 => Some(ReturnKind::HandleList),
            _ => None,
        }
    }
}

/// Everything needed to wrap a module closure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosureSpec {
    pub a: u32,
    pub b: u32,
    /// Function table index of the destructor, called with `(a, b)`
    pub dtor: u32,
    /// Function table index of the invoke shim, called with `(a, b, ...args)`
    pub invoke: u32,
    pub kind: ClosureKind,
    pub returns: ReturnKind,
}

impl ClosureSpec {
    /// A mutable closure returning nothing
    pub fn new(a: u32, b: u32, dtor: u32, invoke: u32) -> Self {
        Self {
            a,
            b,
            dtor,
            invoke,
            kind: ClosureKind::Mutable,
            returns: ReturnKind::Unit,
        }
    }

    pub fn one_shot(mut self) -> Self {
        self.kind = ClosureKind::OneShot;
        self
    }

    pub fn shared(mut self) -> Self {
        self.kind = ClosureKind::Shared;
        self
    }

    pub fn returning(mut self, returns: ReturnKind) -> Self {
        self.returns = returns;
        self
    }
}

/// Snapshot of a closure's state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosureInfo {
    pub id: u64,
    pub kind: ClosureKind,
    pub a: u32,
    pub b: u32,
    pub dtor: u32,
    /// Owner references plus calls in flight
    pub ref_count: u32,
    /// Owner references not yet given up through `drop_closure`
    pub owners: u32,
    pub released: bool,
    pub in_call: bool,
}

#[derive(Debug)]
struct ClosureState {
    a: u32,
    b: u32,
    owners: u32,
    calls: u32,
    released: bool,
}

#[derive(Debug)]
pub(crate) struct ClosureCell {
    id: u64,
    dtor: u32,
    invoke: u32,
    kind: ClosureKind,
    returns: ReturnKind,
    state: Mutex<ClosureState>,
}

impl ClosureCell {
    fn new(id: u64, spec: ClosureSpec) -> Self {
        Self {
            id,
            dtor: spec.dtor,
            invoke: spec.invoke,
            kind: spec.kind,
            returns: spec.returns,
            state: Mutex::new(ClosureState {
                a: spec.a,
                b: spec.b,
                owners: 1,
                calls: 0,
                released: false,
            }),
        }
    }

    pub(crate) fn info(&self) -> ClosureInfo {
        let state = self.state.lock();
        ClosureInfo {
            id: self.id,
            kind: self.kind,
            a: state.a,
            b: state.b,
            dtor: self.dtor,
            ref_count: state.owners + state.calls,
            owners: state.owners,
            released: state.released,
            in_call: state.calls > 0,
        }
    }

    pub(crate) fn is_released(&self) -> bool {
        self.state.lock().released
    }

    /// Mark released and hand out the environment. Returns `None` if some
    /// other path already released it.
    fn release(&self) -> Option<(u32, u32)> {
        let mut state = self.state.lock();
        if state.released {
            return None;
        }
        state.released = true;
        state.owners = 0;
        Some((std::mem::take(&mut state.a), std::mem::take(&mut state.b)))
    }

    /// Validate liveness and take a reference for the duration of a call
    fn enter(&self) -> BoundaryResult<(u32, u32)> {
        let mut state = self.state.lock();
        if state.released {
            return Err(BoundaryError::ClosureConsumed { id: self.id });
        }
        if state.calls > 0 && self.kind != ClosureKind::Shared {
            return Err(BoundaryError::ClosureReentered { id: self.id });
        }
        state.calls += 1;
        match self.kind {
            ClosureKind::Mutable => Ok((std::mem::take(&mut state.a), state.b)),
            ClosureKind::OneShot | ClosureKind::Shared => Ok((state.a, state.b)),
        }
    }

    /// Cleanup step of a call. Returns the environment if it must be
    /// destroyed now.
    fn leave(&self, a: u32, b: u32) -> Option<(u32, u32)> {
        let mut state = self.state.lock();
        state.calls = state.calls.saturating_sub(1);
        if state.released {
            return None;
        }

        let destroy = match self.kind {
            ClosureKind::OneShot => true,
            ClosureKind::Mutable | ClosureKind::Shared => state.owners == 0 && state.calls == 0,
        };
        if destroy {
            state.released = true;
            state.owners = 0;
            state.a = 0;
            state.b = 0;
            Some((a, b))
        } else {
            if self.kind == ClosureKind::Mutable {
                state.a = a;
            }
            None
        }
    }

    /// Explicit release by an owner. Calls in flight keep the environment
    /// alive until the last of them leaves.
    fn drop_ref(&self) -> BoundaryResult<Option<(u32, u32)>> {
        let mut state = self.state.lock();
        if state.released || state.owners == 0 {
            return Err(BoundaryError::ClosureConsumed { id: self.id });
        }
        state.owners -= 1;
        if state.owners > 0 || state.calls > 0 {
            return Ok(None);
        }
        state.released = true;
        Ok(Some((std::mem::take(&mut state.a), std::mem::take(&mut state.b))))
    }

    #[cfg(test)]
    pub(crate) fn detached_for_tests() -> Arc<Self> {
        Arc::new(Self::new(0, ClosureSpec::new(8, 0, 1, 2)))
    }
}

/// Closure bookkeeping for one boundary
#[derive(Debug, Default)]
pub(crate) struct ClosureRegistry {
    next_id: AtomicU64,
    created: AtomicU64,
    destroyed: AtomicU64,
    leaked: Mutex<Vec<Arc<ClosureCell>>>,
}

/// Closure counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClosureStats {
    pub created: u64,
    pub destroyed: u64,
    /// Dropped without release and awaiting a finalizer sweep
    pub pending_leaks: usize,
}

impl ClosureStats {
    pub fn live(&self) -> u64 {
        self.created - self.destroyed
    }
}

impl Boundary {
    /// Wrap a module closure into a host function
    pub fn wrap_closure(&self, spec: ClosureSpec) -> HostFunction {
        let registry = &self.inner.closures;
        let id = registry.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        registry.created.fetch_add(1, Ordering::Relaxed);
        let cell = Arc::new(ClosureCell::new(id, spec));
        tracing::trace!(closure = id, kind = ?spec.kind, "wrapped module closure");

        let call_cell = Arc::clone(&cell);
        let call_cx = self.downgrade();
        let leak_cell = Arc::clone(&cell);
        let leak_cx = self.downgrade();
        let leak_detection = self.inner.config.leak_detection;

        HostFunction::from_closure(
            cell,
            move |args| {
                let cx = call_cx.upgrade().ok_or(BoundaryError::ModuleNotAttached)?;
                cx.invoke_closure(&call_cell, args)
            },
            Box::new(move || {
                if leak_cell.is_released() {
                    return;
                }
                if let Some(cx) = leak_cx.upgrade() {
                    if leak_detection {
                        tracing::warn!(
                            closure = leak_cell.id,
                            "closure dropped without release; queued for finalizer sweep"
                        );
                    }
                    cx.inner.closures.leaked.lock().push(leak_cell);
                }
            }),
        )
    }

    /// Release one owner reference. Returns whether the closure was destroyed
    /// by this call; `false` means a call in flight will destroy it when it
    /// returns. Dropping a closure with no owner reference left is
    /// `ClosureConsumed`.
    pub fn drop_closure(&self, function: &HostFunction) -> BoundaryResult<bool> {
        let cell = function
            .closure_cell()
            .ok_or(BoundaryError::TypeMismatch {
                expected: "module closure",
                actual: "function",
            })?;
        match cell.drop_ref()? {
            Some((a, b)) => {
                self.destroy_closure(cell, a, b)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Call the function behind `handle` with host arguments
    pub fn call_handle(&self, handle: u32, args: &[HostValue]) -> BoundaryResult<HostValue> {
        let value = self.get_ref(handle)?;
        value.expect_function()?.call(args)
    }

    pub fn closure_stats(&self) -> ClosureStats {
        let registry = &self.inner.closures;
        ClosureStats {
            created: registry.created.load(Ordering::Relaxed),
            destroyed: registry.destroyed.load(Ordering::Relaxed),
            pending_leaks: registry.leaked.lock().len(),
        }
    }

    fn invoke_closure(&self, cell: &ClosureCell, args: &[HostValue]) -> BoundaryResult<HostValue> {
        let (a, b) = cell.enter()?;
        let outcome = self.invoke_target(cell, a, b, args);

        if let Some((a, b)) = cell.leave(a, b) {
            if let Err(e) = self.destroy_closure(cell, a, b) {
                if outcome.is_ok() {
                    return Err(e);
                }
                tracing::warn!(closure = cell.id, error = %e, "closure destructor failed");
            }
        }
        outcome
    }

    fn invoke_target(
        &self,
        cell: &ClosureCell,
        a: u32,
        b: u32,
        args: &[HostValue],
    ) -> BoundaryResult<HostValue> {
        let handles = self.alloc_args(args)?;
        let mut call_args: Vec<AbiValue> = vec![a.into(), b.into()];
        call_args.extend(handles.iter().map(|&handle| AbiValue::from(handle)));
        let results = self
            .call_indirect(cell.invoke, &call_args)
            .inspect_err(|e| self.reclaim_args(&handles, e))?;
        self.convert_return(cell.returns, &results)
    }

    /// Allocate one handle per argument; the module owns them afterwards
    pub(crate) fn alloc_args(&self, args: &[HostValue]) -> BoundaryResult<Vec<u32>> {
        let mut handles = Vec::with_capacity(args.len());
        for arg in args {
            match self.alloc_ref(arg.clone()) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    for handle in handles {
                        let _ = self.free_ref(handle);
                    }
                    return Err(e);
                }
            }
        }
        Ok(handles)
    }

    /// Free argument handles after a failed call. A host throw means module
    /// code ran and owns them; any other failure leaves them with us.
    /// Handles the module already released are skipped.
    pub(crate) fn reclaim_args(&self, handles: &[u32], error: &BoundaryError) {
        if error.is_recoverable() {
            return;
        }
        for &handle in handles {
            if self.free_ref(handle).is_ok() {
                tracing::trace!(handle, error = %error, "reclaimed argument handle");
            }
        }
    }

    fn convert_return(&self, kind: ReturnKind, results: &[AbiValue]) -> BoundaryResult<HostValue> {
        const SHIM: &str = "closure invoke shim";
        match kind {
            ReturnKind::Unit => Ok(HostValue::Undefined),
            ReturnKind::Number => Ok(HostValue::Number(WasmAbi::result_f64(SHIM, results, 0)?)),
            ReturnKind::Handle => self.take_ref(WasmAbi::result_u32(SHIM, results, 0)?),
            ReturnKind::HandleList => {
                let (ptr, len) = WasmAbi::result_ptr_len(SHIM, results)?;
                let values = self.get_multiple(ptr, len)?;
                self.free(ptr, len * 4, 4)?;
                Ok(HostValue::array(values))
            }
        }
    }

    fn destroy_closure(&self, cell: &ClosureCell, a: u32, b: u32) -> BoundaryResult<()> {
        self.inner.closures.destroyed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(closure = cell.id, dtor = cell.dtor, "destroying closure");
        self.call_indirect(cell.dtor, &[a.into(), b.into()])?;
        Ok(())
    }

    pub(crate) fn sweep_closures(&self) -> usize {
        let leaked = std::mem::take(&mut *self.inner.closures.leaked.lock());
        let mut swept = 0;
        for cell in leaked {
            if let Some((a, b)) = cell.release() {
                match self.destroy_closure(&cell, a, b) {
                    Ok(()) => swept += 1,
                    Err(e) => {
                        tracing::warn!(closure = cell.id, error = %e, "finalizer destructor failed")
                    }
                }
            }
        }
        swept
    }
}
