use super::{AdapterHandle, AdapterKind, ReadableStreamDefaultController};
use crate::abi::exports;
use crate::boundary::Boundary;
use crate::error::BoundaryResult;
use crate::promise::HostPromise;
use crate::value::{HostObject, HostValue};
use std::sync::Arc;

/// Underlying value source implemented by the module
#[derive(Debug)]
pub struct SourceAdapter {
    handle: AdapterHandle,
}

impl SourceAdapter {
    pub fn new(cx: &Boundary, ptr: u32) -> Self {
        Self {
            handle: AdapterHandle::new(cx, AdapterKind::Source, ptr),
        }
    }

    pub fn pull(&self, controller: &Arc<ReadableStreamDefaultController>) -> BoundaryResult<HostPromise> {
        let ptr = self.handle.ptr()?;
        let cx = self.handle.boundary()?;
        let controller = HostValue::Object(HostObject::from_arc(Arc::clone(controller)));
        let controller = cx.alloc_ref(controller)?;
        cx.call_for_promise(exports::SOURCE_PULL, &[ptr.into(), controller.into()], &[controller])
    }

    pub fn cancel(&self) -> BoundaryResult<()> {
        let ptr = self.handle.take()?;
        let cx = self.handle.boundary()?;
        cx.call_export(exports::SOURCE_CANCEL, &[ptr.into()])?;
        Ok(())
    }

    pub fn free(&self) -> BoundaryResult<()> {
        self.handle.free()
    }

    pub fn is_consumed(&self) -> bool {
        self.handle.is_consumed()
    }
}
