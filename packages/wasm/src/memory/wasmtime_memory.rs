use super::LinearMemory;
use crate::error::{BoundaryError, BoundaryResult};
use crate::instance::StoreCell;
use std::sync::Arc;
use wasmtime::Memory;

/// Linear memory of a [`WasmtimeModule`](crate::instance::WasmtimeModule).
///
/// Reaches the store through the module's store cell, so accesses made while
/// a host import runs go through that import's caller.
pub struct WasmtimeMemory {
    memory: Memory,
    cell: Arc<StoreCell>,
}

impl WasmtimeMemory {
    pub(crate) fn new(memory: Memory, cell: Arc<StoreCell>) -> Self {
        Self { memory, cell }
    }

    fn raw_parts(&self) -> Option<(*mut u8, usize)> {
        let memory = self.memory;
        match self
            .cell
            .with_context(|ctx| (memory.data_ptr(&ctx), memory.data_size(&ctx)))
        {
            Ok(parts) => Some(parts),
            Err(e) => {
                tracing::error!(error = %e, "linear memory unreachable");
                None
            }
        }
    }
}

impl LinearMemory for WasmtimeMemory {
    fn data(&self) -> &[u8] {
        match self.raw_parts() {
            Some((ptr, len)) if len > 0 => {
                // SAFETY: views are only taken under the boundary's execution
                // lock with no module code running, so the memory can neither
                // grow nor be written by the module while the slice lives.
                unsafe { std::slice::from_raw_parts(ptr, len) }
            }
            _ => &[],
        }
    }

    fn data_mut(&mut self) -> &mut [u8] {
        match self.raw_parts() {
            Some((ptr, len)) if len > 0 => {
                // SAFETY: as in `data`. `&mut self` is the only view borrow.
                unsafe { std::slice::from_raw_parts_mut(ptr, len) }
            }
            _ => &mut [],
        }
    }

    fn grow(&mut self, pages: u64) -> BoundaryResult<u64> {
        let memory = self.memory;
        self.cell
            .with_context(|mut ctx| memory.grow(&mut ctx, pages))?
            .map_err(|e| BoundaryError::MemoryGrow {
                pages,
                message: e.to_string(),
            })
    }

    fn size_pages(&self) -> u64 {
        let memory = self.memory;
        self.cell.with_context(|ctx| memory.size(&ctx)).unwrap_or(0)
    }
}
