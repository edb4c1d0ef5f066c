//! Stream adapters
//!
//! Host stream protocols (pull, write, close, abort) delegated to objects the
//! module owns. Each adapter wraps one module pointer. Operations that end the
//! object's life take the pointer exactly once; anything after that fails
//! with [`BoundaryError::AdapterConsumed`].

mod byte_source;
mod controller;
mod sink;
mod source;

pub use byte_source::ByteSourceAdapter;
pub use controller::{ByobRequest, ByteRead, ReadableByteStreamController, ReadableStreamDefaultController, SourceRead};
pub use sink::SinkAdapter;
pub use source::SourceAdapter;

use crate::abi::{exports, AbiValue, WasmAbi};
use crate::boundary::{Boundary, WeakBoundary};
use crate::error::{BoundaryError, BoundaryResult};
use crate::promise::HostPromise;
use parking_lot::Mutex;

/// Module-side object type behind an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    ByteSource,
    Sink,
    Source,
}

impl AdapterKind {
    pub fn name(&self) -> &'static str {
        match self {
            AdapterKind::ByteSource => "IntoUnderlyingByteSource",
            AdapterKind::Sink => "IntoUnderlyingSink",
            AdapterKind::Source => "IntoUnderlyingSource",
        }
    }

    /// `__wbg_<kind>_free(ptr, from_finalizer)`
    pub fn free_export(&self) -> &'static str {
        match self {
            AdapterKind::ByteSource => exports::BYTE_SOURCE_FREE,
            AdapterKind::Sink => exports::SINK_FREE,
            AdapterKind::Source => exports::SOURCE_FREE,
        }
    }
}

/// Adapters dropped while still owning their module pointer
#[derive(Debug, Default)]
pub(crate) struct AdapterLeaks {
    leaked: Mutex<Vec<(AdapterKind, u32)>>,
}

/// One module pointer with take-once ownership
struct AdapterHandle {
    kind: AdapterKind,
    ptr: Mutex<Option<u32>>,
    cx: WeakBoundary,
}

impl AdapterHandle {
    fn new(cx: &Boundary, kind: AdapterKind, ptr: u32) -> Self {
        tracing::trace!(kind = kind.name(), ptr, "adapter created");
        Self {
            kind,
            ptr: Mutex::new(Some(ptr)),
            cx: cx.downgrade(),
        }
    }

    fn boundary(&self) -> BoundaryResult<Boundary> {
        self.cx.upgrade().ok_or(BoundaryError::ModuleNotAttached)
    }

    /// Borrow the pointer for a non-consuming call
    fn ptr(&self) -> BoundaryResult<u32> {
        self.ptr.lock().ok_or(BoundaryError::AdapterConsumed {
            kind: self.kind.name(),
        })
    }

    /// Take ownership of the pointer
    fn take(&self) -> BoundaryResult<u32> {
        self.ptr.lock().take().ok_or(BoundaryError::AdapterConsumed {
            kind: self.kind.name(),
        })
    }

    fn is_consumed(&self) -> bool {
        self.ptr.lock().is_none()
    }

    /// Explicit `free()`: the module is told the call is not from a finalizer
    fn free(&self) -> BoundaryResult<()> {
        let ptr = self.take()?;
        let cx = self.boundary()?;
        cx.call_export(self.kind.free_export(), &[ptr.into(), 0u32.into()])?;
        Ok(())
    }
}

impl Drop for AdapterHandle {
    fn drop(&mut self) {
        let Some(ptr) = self.ptr.get_mut().take() else {
            return;
        };
        let Some(cx) = self.cx.upgrade() else {
            return;
        };
        if cx.inner.config.leak_detection {
            tracing::warn!(
                kind = self.kind.name(),
                ptr,
                "stream adapter dropped while owning module memory; queued for finalizer sweep"
            );
        }
        cx.inner.adapters.leaked.lock().push((self.kind, ptr));
    }
}

impl std::fmt::Debug for AdapterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterHandle")
            .field("kind", &self.kind)
            .field("ptr", &*self.ptr.lock())
            .finish()
    }
}

impl Boundary {
    /// Call an export that returns a promise handle. A host throw during the
    /// call becomes a rejected promise; everything else propagates after the
    /// `passed` handles are reclaimed.
    pub(crate) fn call_for_promise(
        &self,
        name: &str,
        args: &[AbiValue],
        passed: &[u32],
    ) -> BoundaryResult<HostPromise> {
        match self.call_export(name, args) {
            Ok(results) => {
                let handle = WasmAbi::result_u32(name, &results, 0)?;
                let value = self.take_ref(handle)?;
                Ok(self.promise_resolve(value))
            }
            Err(BoundaryError::Thrown(reason)) => {
                tracing::debug!(export = name, "stream operation rejected");
                Ok(self.promise_reject(reason))
            }
            Err(e) => {
                self.reclaim_args(passed, &e);
                Err(e)
            }
        }
    }

    /// Leaked adapters awaiting a sweep
    pub fn pending_adapter_leaks(&self) -> usize {
        self.inner.adapters.leaked.lock().len()
    }

    pub(crate) fn sweep_adapters(&self) -> usize {
        let leaked = std::mem::take(&mut *self.inner.adapters.leaked.lock());
        let mut swept = 0;
        for (kind, ptr) in leaked {
            match self.call_export(kind.free_export(), &[ptr.into(), 1u32.into()]) {
                Ok(_) => swept += 1,
                Err(e) => tracing::warn!(kind = kind.name(), ptr, error = %e, "finalizer free failed"),
            }
        }
        swept
    }
}
