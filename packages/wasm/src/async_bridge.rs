//! Promise construction with module-provided executors
//!
//! `new Promise((resolve, reject) => ...)` where the executor body lives in
//! the module: the host creates the promise, hands the module a resolve and a
//! reject function by handle, and runs the module callback synchronously.
//! The callback environment `(a, b)` is only borrowed for that one call.

use crate::boundary::Boundary;
use crate::error::{BoundaryError, BoundaryResult};
use crate::promise::{HostPromise, Settlement};
use crate::value::{HostFunction, HostValue};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

struct OpState {
    target: Mutex<Option<HostPromise>>,
    settled: AtomicBool,
    released: AtomicU32,
}

impl OpState {
    /// First settlement wins; later calls are ignored
    fn settle(&self, outcome: Settlement) -> bool {
        let Some(promise) = self.target.lock().take() else {
            return false;
        };
        self.settled.store(true, Ordering::Release);
        match outcome {
            Ok(value) => promise.resolve(value),
            Err(reason) => promise.reject(reason),
        }
        true
    }
}

/// A promise whose settlement is in the module's hands
#[derive(Clone)]
pub struct PendingAsyncOp {
    promise: HostPromise,
    state: Arc<OpState>,
}

impl PendingAsyncOp {
    fn new(promise: HostPromise) -> Self {
        Self {
            state: Arc::new(OpState {
                target: Mutex::new(Some(promise.clone())),
                settled: AtomicBool::new(false),
                released: AtomicU32::new(0),
            }),
            promise,
        }
    }

    pub fn promise(&self) -> &HostPromise {
        &self.promise
    }

    pub fn is_settled(&self) -> bool {
        self.state.settled.load(Ordering::Acquire)
    }

    /// How many of the two resolver functions have become unreachable
    pub fn released_resolvers(&self) -> u32 {
        self.state.released.load(Ordering::Acquire)
    }

    /// Returns whether this call settled the promise
    pub fn resolve(&self, value: HostValue) -> bool {
        self.state.settle(Ok(value))
    }

    pub fn reject(&self, reason: HostValue) -> bool {
        self.state.settle(Err(reason))
    }

    fn resolver(&self, name: &'static str, fulfil: bool) -> HostFunction {
        let settle = Arc::clone(&self.state);
        let release = Arc::clone(&self.state);
        HostFunction::with_finalizer(
            name,
            move |args| {
                let value = args.first().cloned().unwrap_or_default();
                let outcome = if fulfil { Ok(value) } else { Err(value) };
                if !settle.settle(outcome) {
                    tracing::trace!(resolver = name, "promise already settled");
                }
                Ok(HostValue::Undefined)
            },
            Box::new(move || {
                release.released.fetch_add(1, Ordering::AcqRel);
            }),
        )
    }
}

impl std::fmt::Debug for PendingAsyncOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingAsyncOp")
            .field("promise", &self.promise.id())
            .field("settled", &self.is_settled())
            .field("released_resolvers", &self.released_resolvers())
            .finish()
    }
}

impl Boundary {
    /// Create a promise and run the module executor at table index `invoke`
    /// with `(a, b, resolve_handle, reject_handle)`. A throw from the executor
    /// rejects the promise instead of propagating.
    pub fn new_promise(&self, a: u32, b: u32, invoke: u32) -> BoundaryResult<PendingAsyncOp> {
        let op = PendingAsyncOp::new(self.pending_promise());
        let handles = self.alloc_args(&[
            op.resolver("resolve", true).into(),
            op.resolver("reject", false).into(),
        ])?;

        match self.call_indirect(invoke, &[a.into(), b.into(), handles[0].into(), handles[1].into()]) {
            Ok(_) => {}
            Err(BoundaryError::Thrown(reason)) => {
                tracing::debug!(promise = op.promise.id(), "promise executor threw");
                op.reject(reason);
            }
            Err(e) => return Err(e),
        }
        Ok(op)
    }

    /// Attach module continuations to `promise`
    pub fn chain(
        &self,
        promise: &HostPromise,
        on_fulfilled: HostFunction,
        on_rejected: Option<HostFunction>,
    ) -> HostPromise {
        promise.then(Some(on_fulfilled), on_rejected)
    }
}
