//! Exception bridge
//!
//! Host throws during a capability call are parked in a single-slot register
//! as a table handle so the module can branch on them. Module-side errors come
//! back either as a message in linear memory or as a handle in the error word
//! of a fallible return.

use crate::abi::FallibleReturn;
use crate::boundary::Boundary;
use crate::error::{BoundaryError, BoundaryResult};
use crate::value::HostValue;
use parking_lot::Mutex;

/// Per-boundary pending exception handle
#[derive(Debug, Default)]
pub(crate) struct ExceptionSlot {
    pending: Mutex<Option<u32>>,
}

impl Boundary {
    /// Store a thrown value. Fails if an exception is already pending.
    pub fn store_exception(&self, error: HostValue) -> BoundaryResult<u32> {
        let mut slot = self.inner.exception.pending.lock();
        if let Some(pending) = *slot {
            return Err(BoundaryError::ExceptionSlotOccupied { pending });
        }
        let handle = self.alloc_ref(error)?;
        *slot = Some(handle);
        tracing::debug!(handle, "stored pending exception");
        Ok(handle)
    }

    /// Park a handle the module already holds
    pub fn store_exception_handle(&self, handle: u32) -> BoundaryResult<()> {
        self.get_ref(handle)?;
        let mut slot = self.inner.exception.pending.lock();
        if let Some(pending) = *slot {
            return Err(BoundaryError::ExceptionSlotOccupied { pending });
        }
        *slot = Some(handle);
        Ok(())
    }

    /// Clear the slot and hand its handle to the caller, who now owns it
    pub fn take_exception_handle(&self) -> Option<u32> {
        self.inner.exception.pending.lock().take()
    }

    /// Clear the slot and release its handle
    pub fn take_exception(&self) -> BoundaryResult<Option<HostValue>> {
        match self.take_exception_handle() {
            Some(handle) => self.take_ref(handle).map(Some),
            None => Ok(None),
        }
    }

    pub fn has_pending_exception(&self) -> bool {
        self.inner.exception.pending.lock().is_some()
    }

    /// Decode a module error message into a thrown host `Error`
    pub fn raise(&self, ptr: u32, len: u32) -> BoundaryError {
        match self.decode_string(ptr, len) {
            Ok(message) => BoundaryError::thrown(message),
            Err(e) => e,
        }
    }

    /// Re-throw the value behind a handle the module gave up
    pub fn rethrow(&self, handle: u32) -> BoundaryError {
        match self.take_ref(handle) {
            Ok(value) => BoundaryError::Thrown(value),
            Err(e) => e,
        }
    }

    /// Run a host capability call. A host throw is stored in the exception
    /// slot and the default value returned; any other error propagates.
    pub fn handle_error<T: Default>(
        &self,
        f: impl FnOnce() -> BoundaryResult<T>,
    ) -> BoundaryResult<T> {
        match f() {
            Ok(value) => Ok(value),
            Err(BoundaryError::Thrown(value)) => {
                self.store_exception(value)?;
                Ok(T::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Check the error word of a fallible return, re-throwing on failure
    pub fn check_fallible(&self, ret: FallibleReturn) -> BoundaryResult<u32> {
        if ret.is_error() {
            Err(self.rethrow(ret.error))
        } else {
            Ok(ret.value)
        }
    }

    /// Call a fallible export returning `[error, value]`
    pub fn call_fallible(
        &self,
        name: &str,
        args: &[crate::abi::AbiValue],
    ) -> BoundaryResult<u32> {
        let results = self.call_export(name, args)?;
        let ret = FallibleReturn::from_results(name, &results)?;
        self.check_fallible(ret)
    }
}

/// Report an error nobody handled to the log channel with a stack trace
pub fn report_uncaught(err: &BoundaryError) {
    let backtrace = std::backtrace::Backtrace::force_capture();
    tracing::error!(
        code = %err.code(),
        error = %err,
        backtrace = %backtrace,
        "uncaught boundary error"
    );
}
