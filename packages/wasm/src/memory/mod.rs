//! Linear memory and typed views
//!
//! The module exclusively owns a single growable byte buffer. The host never
//! keeps a raw slice across calls: every access goes through [`MemoryViews`],
//! which revalidates its cached view descriptors against the buffer identity.

mod views;
#[cfg(feature = "wasmtime")]
mod wasmtime_memory;

pub use views::{ByteView, DataView, FloatView, MemoryViews};
#[cfg(feature = "wasmtime")]
pub use wasmtime_memory::WasmtimeMemory;

use crate::error::{BoundaryError, BoundaryResult};

/// Wasm page size (64 KiB)
pub const PAGE_SIZE: usize = 65536;

/// Identity of the current backing buffer.
///
/// Changes whenever the buffer is reallocated, grown or detached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId {
    base: usize,
    len: usize,
}

impl BufferId {
    pub fn of(data: &[u8]) -> Self {
        Self {
            base: data.as_ptr() as usize,
            len: data.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A growable linear memory owned by the module
pub trait LinearMemory: Send {
    fn data(&self) -> &[u8];

    fn data_mut(&mut self) -> &mut [u8];

    /// Grow by `pages`, returning the previous size in pages
    fn grow(&mut self, pages: u64) -> BoundaryResult<u64>;

    fn buffer_id(&self) -> BufferId {
        BufferId::of(self.data())
    }

    fn size_pages(&self) -> u64 {
        (self.data().len() / PAGE_SIZE) as u64
    }
}

/// In-process linear memory. Growing always moves the buffer.
#[derive(Debug)]
pub struct VecMemory {
    data: Vec<u8>,
    maximum_pages: Option<u64>,
}

impl VecMemory {
    pub fn new(initial_pages: u32) -> Self {
        Self {
            data: vec![0; initial_pages as usize * PAGE_SIZE],
            maximum_pages: None,
        }
    }

    pub fn with_maximum(mut self, pages: u32) -> Self {
        self.maximum_pages = Some(pages as u64);
        self
    }
}

impl LinearMemory for VecMemory {
    fn data(&self) -> &[u8] {
        &self.data
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn grow(&mut self, pages: u64) -> BoundaryResult<u64> {
        let previous = self.size_pages();
        let target = previous.checked_add(pages).ok_or_else(|| BoundaryError::MemoryGrow {
            pages,
            message: "page count overflow".to_string(),
        })?;

        if let Some(max) = self.maximum_pages {
            if target > max {
                return Err(BoundaryError::MemoryGrow {
                    pages,
                    message: format!("maximum is {} pages, currently {}", max, previous),
                });
            }
        }

        if pages == 0 {
            return Ok(previous);
        }

        // Allocate the new buffer while the old one is alive so the base moves.
        let mut next = vec![0; target as usize * PAGE_SIZE];
        next[..self.data.len()].copy_from_slice(&self.data);
        self.data = next;
        Ok(previous)
    }
}
