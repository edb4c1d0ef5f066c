use super::{AdapterHandle, AdapterKind, ReadableByteStreamController};
use crate::abi::{exports, WasmAbi};
use crate::boundary::Boundary;
use crate::error::BoundaryResult;
use crate::promise::HostPromise;
use crate::value::{HostObject, HostValue};
use std::sync::Arc;

/// Underlying byte source implemented by the module
#[derive(Debug)]
pub struct ByteSourceAdapter {
    handle: AdapterHandle,
}

impl ByteSourceAdapter {
    /// Take ownership of the module object at `ptr`
    pub fn new(cx: &Boundary, ptr: u32) -> Self {
        Self {
            handle: AdapterHandle::new(cx, AdapterKind::ByteSource, ptr),
        }
    }

    /// Stream type reported by the module, normally `"bytes"`
    pub fn kind(&self) -> BoundaryResult<String> {
        let ptr = self.handle.ptr()?;
        let cx = self.handle.boundary()?;
        let results = cx.call_export(exports::BYTE_SOURCE_TYPE, &[ptr.into()])?;
        let (str_ptr, len) = WasmAbi::result_ptr_len(exports::BYTE_SOURCE_TYPE, &results)?;
        let kind = cx.decode_cached(str_ptr, len)?;
        if str_ptr != 0 {
            cx.free(str_ptr, len, 1)?;
        }
        Ok(kind)
    }

    pub fn auto_allocate_chunk_size(&self) -> BoundaryResult<u32> {
        let ptr = self.handle.ptr()?;
        let cx = self.handle.boundary()?;
        let results = cx.call_export(exports::BYTE_SOURCE_AUTO_ALLOCATE_CHUNK_SIZE, &[ptr.into()])?;
        WasmAbi::result_u32(exports::BYTE_SOURCE_AUTO_ALLOCATE_CHUNK_SIZE, &results, 0)
    }

    pub fn start(&self, controller: &Arc<ReadableByteStreamController>) -> BoundaryResult<()> {
        let ptr = self.handle.ptr()?;
        let cx = self.handle.boundary()?;
        let controller = cx.alloc_ref(controller_value(controller))?;
        cx.call_export(exports::BYTE_SOURCE_START, &[ptr.into(), controller.into()])
            .inspect_err(|e| cx.reclaim_args(&[controller], e))?;
        Ok(())
    }

    /// Ask the module for more data. A module failure rejects the returned
    /// promise and leaves the source usable.
    pub fn pull(&self, controller: &Arc<ReadableByteStreamController>) -> BoundaryResult<HostPromise> {
        let ptr = self.handle.ptr()?;
        let cx = self.handle.boundary()?;
        let controller = cx.alloc_ref(controller_value(controller))?;
        cx.call_for_promise(exports::BYTE_SOURCE_PULL, &[ptr.into(), controller.into()], &[controller])
    }

    /// Hand the object back to the module for cancellation
    pub fn cancel(&self) -> BoundaryResult<()> {
        let ptr = self.handle.take()?;
        let cx = self.handle.boundary()?;
        cx.call_export(exports::BYTE_SOURCE_CANCEL, &[ptr.into()])?;
        Ok(())
    }

    pub fn free(&self) -> BoundaryResult<()> {
        self.handle.free()
    }

    pub fn is_consumed(&self) -> bool {
        self.handle.is_consumed()
    }
}

fn controller_value(controller: &Arc<ReadableByteStreamController>) -> HostValue {
    HostValue::Object(HostObject::from_arc(Arc::clone(controller)))
}
