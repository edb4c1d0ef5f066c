use super::{AdapterHandle, AdapterKind};
use crate::abi::exports;
use crate::boundary::Boundary;
use crate::error::BoundaryResult;
use crate::promise::HostPromise;
use crate::value::HostValue;

/// Underlying sink implemented by the module
#[derive(Debug)]
pub struct SinkAdapter {
    handle: AdapterHandle,
}

impl SinkAdapter {
    pub fn new(cx: &Boundary, ptr: u32) -> Self {
        Self {
            handle: AdapterHandle::new(cx, AdapterKind::Sink, ptr),
        }
    }

    /// Write one chunk. The chunk is passed by a handle the module owns.
    pub fn write(&self, chunk: HostValue) -> BoundaryResult<HostPromise> {
        let ptr = self.handle.ptr()?;
        let cx = self.handle.boundary()?;
        let chunk = cx.alloc_ref(chunk)?;
        cx.call_for_promise(exports::SINK_WRITE, &[ptr.into(), chunk.into()], &[chunk])
    }

    pub fn close(&self) -> BoundaryResult<HostPromise> {
        let ptr = self.handle.take()?;
        let cx = self.handle.boundary()?;
        cx.call_for_promise(exports::SINK_CLOSE, &[ptr.into()], &[])
    }

    pub fn abort(&self, reason: HostValue) -> BoundaryResult<HostPromise> {
        let ptr = self.handle.take()?;
        let cx = self.handle.boundary()?;
        let reason = cx.alloc_ref(reason)?;
        cx.call_for_promise(exports::SINK_ABORT, &[ptr.into(), reason.into()], &[reason])
    }

    pub fn free(&self) -> BoundaryResult<()> {
        self.handle.free()
    }

    pub fn is_consumed(&self) -> bool {
        self.handle.is_consumed()
    }
}
