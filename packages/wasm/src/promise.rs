//! Host promises and the microtask queue
//!
//! A small promise implementation with host semantics: settlement is final,
//! resolving with another promise adopts its state, and reactions always run
//! as microtasks after the current synchronous call returns, in settlement
//! order. The embedder drains the queue with [`Boundary::run_microtasks`].

use crate::boundary::Boundary;
use crate::error::{BoundaryError, BoundaryResult};
use crate::value::{HostFunction, HostValue};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};

type Microtask = Box<dyn FnOnce() + Send>;
type TaskList = Mutex<VecDeque<Microtask>>;

/// `Ok` for fulfillment, `Err` for rejection
pub type Settlement = Result<HostValue, HostValue>;

type Reaction = Box<dyn FnOnce(Settlement) + Send>;

/// FIFO of continuations
#[derive(Clone, Default)]
pub(crate) struct MicrotaskQueue {
    tasks: Arc<TaskList>,
}

impl MicrotaskQueue {
    pub(crate) fn enqueue(&self, task: impl FnOnce() + Send + 'static) {
        self.tasks.lock().push_back(Box::new(task));
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Run tasks until the queue is empty, including tasks queued while
    /// draining
    pub(crate) fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        loop {
            let task = self.tasks.lock().pop_front();
            match task {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
}

impl fmt::Debug for MicrotaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MicrotaskQueue")
            .field("pending", &self.len())
            .finish()
    }
}

enum PromiseState {
    Pending {
        reactions: Vec<Reaction>,
        wakers: Vec<Waker>,
    },
    Fulfilled(HostValue),
    Rejected(HostValue),
}

struct PromiseInner {
    id: u64,
    state: Mutex<PromiseState>,
    /// Set once resolve/reject was called, even if settlement is still
    /// pending on an adopted promise
    locked: AtomicBool,
    queue: Weak<TaskList>,
}

/// Observable promise state
#[derive(Debug, Clone)]
pub enum PromiseStatus {
    Pending,
    Fulfilled(HostValue),
    Rejected(HostValue),
}

/// A host promise
#[derive(Clone)]
pub struct HostPromise {
    inner: Arc<PromiseInner>,
}

static NEXT_PROMISE_ID: AtomicU64 = AtomicU64::new(1);

impl HostPromise {
    pub(crate) fn pending(queue: &MicrotaskQueue) -> Self {
        Self::with_queue(Arc::downgrade(&queue.tasks))
    }

    fn with_queue(queue: Weak<TaskList>) -> Self {
        Self {
            inner: Arc::new(PromiseInner {
                id: NEXT_PROMISE_ID.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(PromiseState::Pending {
                    reactions: Vec::new(),
                    wakers: Vec::new(),
                }),
                locked: AtomicBool::new(false),
                queue,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn ptr_eq(&self, other: &HostPromise) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn status(&self) -> PromiseStatus {
        match &*self.inner.state.lock() {
            PromiseState::Pending { .. } => PromiseStatus::Pending,
            PromiseState::Fulfilled(value) => PromiseStatus::Fulfilled(value.clone()),
            PromiseState::Rejected(reason) => PromiseStatus::Rejected(reason.clone()),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(&*self.inner.state.lock(), PromiseState::Pending { .. })
    }

    /// Resolve with `value`, adopting its state if it is a promise. Ignored
    /// once the promise was resolved or rejected.
    pub fn resolve(&self, value: HostValue) {
        if self.inner.locked.swap(true, Ordering::AcqRel) {
            return;
        }
        match value {
            HostValue::Promise(other) if other.ptr_eq(self) => {
                self.settle(Err(HostValue::type_error("Chaining cycle detected for promise")));
            }
            HostValue::Promise(other) => {
                let this = self.clone();
                other.subscribe(move |outcome| this.settle(outcome));
            }
            value => self.settle(Ok(value)),
        }
    }

    /// Reject with `reason`. Ignored once the promise was resolved or rejected.
    pub fn reject(&self, reason: HostValue) {
        if self.inner.locked.swap(true, Ordering::AcqRel) {
            return;
        }
        self.settle(Err(reason));
    }

    fn settle(&self, outcome: Settlement) {
        let (reactions, wakers) = {
            let mut state = self.inner.state.lock();
            let settled = match &outcome {
                Ok(value) => PromiseState::Fulfilled(value.clone()),
                Err(reason) => PromiseState::Rejected(reason.clone()),
            };
            match std::mem::replace(&mut *state, settled) {
                PromiseState::Pending { reactions, wakers } => (reactions, wakers),
                previous => {
                    *state = previous;
                    return;
                }
            }
        };

        tracing::trace!(promise = self.inner.id, fulfilled = outcome.is_ok(), "promise settled");
        for waker in wakers {
            waker.wake();
        }
        for reaction in reactions {
            let outcome = outcome.clone();
            self.enqueue(move || reaction(outcome));
        }
    }

    fn enqueue(&self, task: impl FnOnce() + Send + 'static) {
        match self.inner.queue.upgrade() {
            Some(queue) => queue.lock().push_back(Box::new(task)),
            None => tracing::trace!(promise = self.inner.id, "microtask queue gone; reaction dropped"),
        }
    }

    /// Run `reaction` as a microtask once this promise settles
    pub(crate) fn subscribe(&self, reaction: impl FnOnce(Settlement) + Send + 'static) {
        let settled = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                PromiseState::Pending { reactions, .. } => {
                    reactions.push(Box::new(reaction));
                    return;
                }
                PromiseState::Fulfilled(value) => Ok(value.clone()),
                PromiseState::Rejected(reason) => Err(reason.clone()),
            }
        };
        self.enqueue(move || reaction(settled));
    }

    /// Two-branch continuation. A missing handler passes the outcome through;
    /// a handler that throws rejects the derived promise.
    pub fn then(
        &self,
        on_fulfilled: Option<HostFunction>,
        on_rejected: Option<HostFunction>,
    ) -> HostPromise {
        let derived = HostPromise::with_queue(self.inner.queue.clone());
        let target = derived.clone();
        self.subscribe(move |outcome| {
            let (handler, value, fulfilled) = match outcome {
                Ok(value) => (on_fulfilled, value, true),
                Err(reason) => (on_rejected, reason, false),
            };
            match handler {
                Some(handler) => match handler.call(&[value]) {
                    Ok(result) => target.resolve(result),
                    Err(e) => target.reject(e.into_thrown()),
                },
                None if fulfilled => target.resolve(value),
                None => target.reject(value),
            }
        });
        derived
    }

    /// Await settlement from async Rust
    pub fn future(&self) -> PromiseFuture {
        PromiseFuture {
            promise: self.clone(),
        }
    }
}

impl fmt::Debug for HostPromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostPromise")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}

/// Future over a [`HostPromise`]. Rejection surfaces as
/// [`BoundaryError::Thrown`].
pub struct PromiseFuture {
    promise: HostPromise,
}

impl Future for PromiseFuture {
    type Output = BoundaryResult<HostValue>;

    fn poll(self: Pin<&mut Self>, task: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.promise.inner.state.lock();
        match &mut *state {
            PromiseState::Fulfilled(value) => Poll::Ready(Ok(value.clone())),
            PromiseState::Rejected(reason) => Poll::Ready(Err(BoundaryError::Thrown(reason.clone()))),
            PromiseState::Pending { wakers, .. } => {
                if !wakers.iter().any(|w| w.will_wake(task.waker())) {
                    wakers.push(task.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

impl IntoFuture for HostPromise {
    type Output = BoundaryResult<HostValue>;
    type IntoFuture = PromiseFuture;

    fn into_future(self) -> PromiseFuture {
        PromiseFuture { promise: self }
    }
}

impl Boundary {
    /// A pending promise bound to this boundary's microtask queue
    pub fn pending_promise(&self) -> HostPromise {
        HostPromise::pending(&self.inner.microtasks)
    }

    /// `Promise.resolve`: promises are returned as-is
    pub fn promise_resolve(&self, value: HostValue) -> HostPromise {
        if let HostValue::Promise(promise) = value {
            return promise;
        }
        let promise = self.pending_promise();
        promise.resolve(value);
        promise
    }

    /// `Promise.reject`
    pub fn promise_reject(&self, reason: HostValue) -> HostPromise {
        let promise = self.pending_promise();
        promise.reject(reason);
        promise
    }

    /// Queue `callback` to run with no arguments as a microtask
    pub fn queue_microtask(&self, callback: HostFunction) {
        self.inner.microtasks.enqueue(move || {
            if let Err(e) = callback.call(&[]) {
                crate::exception::report_uncaught(&e);
            }
        });
    }

    /// Settle a new promise from a Rust future. The returned driver must be
    /// polled (spawned or awaited) for the promise to settle.
    pub fn future_to_promise<F>(&self, future: F) -> (HostPromise, impl Future<Output = ()> + Send)
    where
        F: Future<Output = BoundaryResult<HostValue>> + Send + 'static,
    {
        let promise = self.pending_promise();
        let target = promise.clone();
        let driver = async move {
            match future.await {
                Ok(value) => target.resolve(value),
                Err(e) => target.reject(e.into_thrown()),
            }
        };
        (promise, driver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn queue() -> MicrotaskQueue {
        MicrotaskQueue::default()
    }

    #[test]
    fn test_reactions_run_only_when_drained() {
        let queue = queue();
        let promise = HostPromise::pending(&queue);
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        promise.subscribe(move |outcome| *sink.lock() = Some(outcome.is_ok()));

        promise.resolve(42.0.into());
        assert!(matches!(promise.status(), PromiseStatus::Fulfilled(HostValue::Number(n)) if n == 42.0));
        assert!(seen.lock().is_none());

        assert_eq!(queue.run_until_idle(), 1);
        assert_eq!(*seen.lock(), Some(true));
    }

    #[test]
    fn test_first_settlement_wins() {
        let queue = queue();
        let promise = HostPromise::pending(&queue);
        promise.reject("no".into());
        promise.resolve(1.0.into());
        assert!(matches!(promise.status(), PromiseStatus::Rejected(_)));
    }

    #[test]
    fn test_then_order_follows_settlement_order() {
        let queue = queue();
        let first = HostPromise::pending(&queue);
        let second = HostPromise::pending(&queue);
        let order = Arc::new(Mutex::new(Vec::new()));

        for (promise, tag) in [(&first, "first"), (&second, "second")] {
            let order = Arc::clone(&order);
            promise.then(
                Some(HostFunction::new(move |_| {
                    order.lock().push(tag);
                    Ok(HostValue::Undefined)
                })),
                None,
            );
        }

        second.resolve(HostValue::Null);
        first.resolve(HostValue::Null);
        queue.run_until_idle();
        assert_eq!(*order.lock(), vec!["second", "first"]);
    }

    #[test]
    fn test_adopts_resolved_promise_state() {
        let queue = queue();
        let inner = HostPromise::pending(&queue);
        let outer = HostPromise::pending(&queue);
        outer.resolve(inner.clone().into());
        assert!(outer.is_pending());

        inner.reject("inner failed".into());
        queue.run_until_idle();
        assert!(matches!(outer.status(), PromiseStatus::Rejected(r) if r.as_str() == Some("inner failed")));
    }

    #[test]
    fn test_self_resolution_is_type_error() {
        let queue = queue();
        let promise = HostPromise::pending(&queue);
        promise.resolve(promise.clone().into());
        match promise.status() {
            PromiseStatus::Rejected(reason) => {
                assert_eq!(reason.as_error().unwrap().name(), "TypeError")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_then_handler_error_rejects_derived() {
        let queue = queue();
        let promise = HostPromise::pending(&queue);
        let derived = promise.then(
            Some(HostFunction::new(|_| Err(BoundaryError::thrown("handler failed")))),
            None,
        );
        let recovered = derived.then(
            None,
            Some(HostFunction::new(|args| {
                Ok(args[0].as_error().map(|e| e.message().len() as f64).unwrap_or(0.0).into())
            })),
        );

        promise.resolve(HostValue::Undefined);
        queue.run_until_idle();
        assert!(matches!(derived.status(), PromiseStatus::Rejected(_)));
        assert!(matches!(recovered.status(), PromiseStatus::Fulfilled(HostValue::Number(n)) if n == 14.0));
    }

    #[test]
    fn test_future_wakes_on_settlement() {
        let queue = queue();
        let promise = HostPromise::pending(&queue);
        let polls = Arc::new(AtomicUsize::new(0));

        let resolver = promise.clone();
        let counter = Arc::clone(&polls);
        let result = futures::executor::block_on(async move {
            let future = promise.future();
            futures::pin_mut!(future);
            let first = futures::poll!(future.as_mut());
            counter.fetch_add(1, Ordering::SeqCst);
            assert!(first.is_pending());
            resolver.resolve("done".into());
            future.await
        });

        assert_eq!(result.unwrap().as_str(), Some("done"));
        assert_eq!(polls.load(Ordering::SeqCst), 1);
    }
}
