//! Host-side stream controllers handed to module sources

use crate::error::{BoundaryError, BoundaryResult};
use crate::value::{ByteArray, ErrorObject, HostValue};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

fn type_error(message: &str) -> BoundaryError {
    BoundaryError::Thrown(HostValue::type_error(message))
}

fn range_error(message: String) -> BoundaryError {
    BoundaryError::Thrown(ErrorObject::with_name("RangeError", message).into())
}

/// What a reader gets from a byte stream
#[derive(Debug, Clone)]
pub enum ByteRead {
    /// A chunk passed through `enqueue`
    Chunk(Bytes),
    /// A BYOB request filled in place; the first `len` bytes of `view` are valid
    Filled { view: ByteArray, len: usize },
    Pending,
    Done,
    Errored(HostValue),
}

#[derive(Debug, Default)]
struct ByteState {
    queue: VecDeque<ByteRead>,
    byob: Option<ByteArray>,
    closed: bool,
    error: Option<HostValue>,
}

/// Controller of a readable byte stream.
///
/// The module either enqueues owned chunks, or fills the pending BYOB request
/// in place and reports the byte count with [`ByobRequest::respond`].
#[derive(Debug)]
pub struct ReadableByteStreamController {
    auto_allocate_chunk_size: Option<u32>,
    state: Mutex<ByteState>,
}

impl ReadableByteStreamController {
    /// `auto_allocate_chunk_size` of zero disables auto allocation
    pub fn new(auto_allocate_chunk_size: u32) -> Arc<Self> {
        Arc::new(Self {
            auto_allocate_chunk_size: (auto_allocate_chunk_size > 0).then_some(auto_allocate_chunk_size),
            state: Mutex::new(ByteState::default()),
        })
    }

    /// Offer a reader-owned buffer for the next read
    pub fn provide_buffer(&self, view: ByteArray) -> BoundaryResult<()> {
        let mut state = self.state.lock();
        if state.byob.is_some() {
            return Err(type_error("a BYOB request is already pending"));
        }
        if view.is_empty() {
            return Err(type_error("BYOB buffer must not be empty"));
        }
        state.byob = Some(view);
        Ok(())
    }

    /// The pending BYOB request, auto-allocating one when the stream was set
    /// up with a chunk size and no data is queued
    pub fn byob_request(self: &Arc<Self>) -> Option<ByobRequest> {
        let mut state = self.state.lock();
        if state.closed || state.error.is_some() {
            return None;
        }
        if state.byob.is_none() && state.queue.is_empty() {
            if let Some(size) = self.auto_allocate_chunk_size {
                state.byob = Some(ByteArray::new_zeroed(size as usize));
            }
        }
        state.byob.clone().map(|view| ByobRequest {
            controller: Arc::clone(self),
            view,
        })
    }

    pub fn enqueue(&self, chunk: &ByteArray) -> BoundaryResult<()> {
        let mut state = self.state.lock();
        if state.closed || state.error.is_some() {
            return Err(type_error("cannot enqueue into a closed stream"));
        }
        if chunk.is_empty() {
            return Err(type_error("chunk must not be empty"));
        }
        state.byob = None;
        state.queue.push_back(ByteRead::Chunk(Bytes::from(chunk.to_vec())));
        Ok(())
    }

    pub fn close(&self) -> BoundaryResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(type_error("stream is already closed"));
        }
        state.closed = true;
        Ok(())
    }

    /// Error the stream; queued data is discarded
    pub fn error(&self, reason: HostValue) {
        let mut state = self.state.lock();
        if state.error.is_none() {
            state.queue.clear();
            state.byob = None;
            state.error = Some(reason);
        }
    }

    pub fn read(&self) -> ByteRead {
        let mut state = self.state.lock();
        if let Some(reason) = &state.error {
            return ByteRead::Errored(reason.clone());
        }
        match state.queue.pop_front() {
            Some(item) => item,
            None if state.closed => ByteRead::Done,
            None => ByteRead::Pending,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }
}

/// A reader buffer waiting to be filled
#[derive(Debug, Clone)]
pub struct ByobRequest {
    controller: Arc<ReadableByteStreamController>,
    view: ByteArray,
}

impl ByobRequest {
    pub fn view(&self) -> &ByteArray {
        &self.view
    }

    /// Report that `written` bytes were placed at the start of the view
    pub fn respond(&self, written: usize) -> BoundaryResult<()> {
        let mut state = self.controller.state.lock();
        match &state.byob {
            Some(pending) if pending.shares_buffer(&self.view) => {}
            _ => return Err(type_error("BYOB request is no longer valid")),
        }
        if written > self.view.len() {
            return Err(range_error(format!(
                "bytesWritten {} exceeds view length {}",
                written,
                self.view.len()
            )));
        }
        if written == 0 && !state.closed {
            return Err(type_error("bytesWritten must be positive while the stream is readable"));
        }
        state.byob = None;
        if written > 0 {
            state.queue.push_back(ByteRead::Filled {
                view: self.view.subarray(0, written),
                len: written,
            });
        }
        Ok(())
    }
}

/// What a reader gets from a default stream
#[derive(Debug, Clone)]
pub enum SourceRead {
    Value(HostValue),
    Pending,
    Done,
    Errored(HostValue),
}

#[derive(Debug, Default)]
struct SourceState {
    queue: VecDeque<HostValue>,
    closed: bool,
    error: Option<HostValue>,
}

/// Controller of a readable stream of arbitrary host values
#[derive(Debug, Default)]
pub struct ReadableStreamDefaultController {
    state: Mutex<SourceState>,
}

impl ReadableStreamDefaultController {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn enqueue(&self, chunk: HostValue) -> BoundaryResult<()> {
        let mut state = self.state.lock();
        if state.closed || state.error.is_some() {
            return Err(type_error("cannot enqueue into a closed stream"));
        }
        state.queue.push_back(chunk);
        Ok(())
    }

    pub fn close(&self) -> BoundaryResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(type_error("stream is already closed"));
        }
        state.closed = true;
        Ok(())
    }

    pub fn error(&self, reason: HostValue) {
        let mut state = self.state.lock();
        if state.error.is_none() {
            state.queue.clear();
            state.error = Some(reason);
        }
    }

    pub fn read(&self) -> SourceRead {
        let mut state = self.state.lock();
        if let Some(reason) = &state.error {
            return SourceRead::Errored(reason.clone());
        }
        match state.queue.pop_front() {
            Some(value) => SourceRead::Value(value),
            None if state.closed => SourceRead::Done,
            None => SourceRead::Pending,
        }
    }

    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byob_fill_in_place() {
        let controller = ReadableByteStreamController::new(0);
        assert!(controller.byob_request().is_none());

        let buffer = ByteArray::new_zeroed(8);
        controller.provide_buffer(buffer.clone()).unwrap();
        let request = controller.byob_request().unwrap();
        request.view().copy_from(b"abc", 0).unwrap();
        request.respond(3).unwrap();

        match controller.read() {
            ByteRead::Filled { view, len } => {
                assert_eq!(len, 3);
                assert!(view.shares_buffer(&buffer));
                assert_eq!(buffer.to_vec()[..3], *b"abc");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(request.respond(1), Err(BoundaryError::Thrown(_))));
    }

    #[test]
    fn test_respond_rejects_overrun() {
        let controller = ReadableByteStreamController::new(4);
        let request = controller.byob_request().unwrap();
        assert_eq!(request.view().len(), 4);
        match request.respond(5) {
            Err(BoundaryError::Thrown(value)) => {
                assert_eq!(value.as_error().unwrap().name(), "RangeError")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_enqueue_close_and_drain() {
        let controller = ReadableByteStreamController::new(0);
        controller.enqueue(&ByteArray::from_slice(b"one")).unwrap();
        controller.close().unwrap();
        assert!(controller.enqueue(&ByteArray::from_slice(b"two")).is_err());

        assert!(matches!(controller.read(), ByteRead::Chunk(b) if b.as_ref() == b"one"));
        assert!(matches!(controller.read(), ByteRead::Done));
    }

    #[test]
    fn test_error_discards_queue() {
        let controller = ReadableStreamDefaultController::new();
        controller.enqueue(1.0.into()).unwrap();
        controller.error("broken".into());
        assert!(matches!(controller.read(), SourceRead::Errored(r) if r.as_str() == Some("broken")));
        assert_eq!(controller.queued(), 0);
    }
}
