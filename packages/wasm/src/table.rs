//! External reference table
//!
//! Gives module code integer handles to arbitrary host values. Slots 0..=3
//! hold the constants `undefined`, `null`, `true` and `false` and are never
//! allocated or freed. Allocation always returns the lowest free slot.

use crate::config::RESERVED_SLOTS;
use crate::error::{BoundaryError, BoundaryResult};
use crate::value::HostValue;
use std::collections::BTreeSet;

/// Handle of the reserved `undefined` slot
pub const UNDEFINED_HANDLE: u32 = 0;
/// Handle of the reserved `null` slot
pub const NULL_HANDLE: u32 = 1;
/// Handle of the reserved `true` slot
pub const TRUE_HANDLE: u32 = 2;
/// Handle of the reserved `false` slot
pub const FALSE_HANDLE: u32 = 3;

#[derive(Debug)]
pub struct ExternRefTable {
    slots: Vec<Option<HostValue>>,
    free: BTreeSet<u32>,
    capacity: u32,
    max_slots: u32,
    live: usize,
}

impl ExternRefTable {
    pub fn new(initial_size: u32, max_slots: u32) -> Self {
        let capacity = initial_size.max(RESERVED_SLOTS).min(max_slots.max(RESERVED_SLOTS));
        let mut table = Self {
            slots: Vec::with_capacity(capacity as usize),
            free: BTreeSet::new(),
            capacity,
            max_slots: max_slots.max(RESERVED_SLOTS),
            live: 0,
        };
        table.init_reserved();
        table
    }

    /// Re-seed the reserved constants at slots 0..=3
    pub fn init_reserved(&mut self) {
        let constants = [
            HostValue::Undefined,
            HostValue::Null,
            HostValue::Bool(true),
            HostValue::Bool(false),
        ];
        if self.slots.len() < constants.len() {
            self.slots.resize(constants.len(), None);
        }
        for (slot, value) in self.slots.iter_mut().zip(constants) {
            *slot = Some(value);
        }
    }

    /// Store `value` in the lowest free slot at or above the reserved range
    pub fn alloc(&mut self, value: HostValue) -> BoundaryResult<u32> {
        if let Some(handle) = self.free.pop_first() {
            self.slots[handle as usize] = Some(value);
            self.live += 1;
            return Ok(handle);
        }

        let next = self.slots.len() as u32;
        if next >= self.capacity {
            self.grow(next)?;
        }
        self.slots.push(Some(value));
        self.live += 1;
        Ok(next)
    }

    fn grow(&mut self, needed: u32) -> BoundaryResult<()> {
        let grown = self.capacity.saturating_mul(2).min(self.max_slots);
        if grown <= needed {
            return Err(BoundaryError::TableExhausted {
                requested: needed as usize + 1,
                limit: self.max_slots as usize,
            });
        }
        tracing::debug!(from = self.capacity, to = grown, "growing extern reference table");
        self.slots.reserve((grown - self.capacity) as usize);
        self.capacity = grown;
        Ok(())
    }

    pub fn get(&self, handle: u32) -> BoundaryResult<HostValue> {
        self.slots
            .get(handle as usize)
            .and_then(Option::as_ref)
            .cloned()
            .ok_or(BoundaryError::InvalidHandle(handle))
    }

    /// Release a handle. The removed value is returned so the caller can drop
    /// it outside of any lock.
    pub fn free(&mut self, handle: u32) -> BoundaryResult<HostValue> {
        if handle < RESERVED_SLOTS {
            return Err(BoundaryError::ReservedSlot(handle));
        }
        let value = self
            .slots
            .get_mut(handle as usize)
            .and_then(Option::take)
            .ok_or(BoundaryError::InvalidHandle(handle))?;
        self.free.insert(handle);
        self.live -= 1;
        Ok(value)
    }

    /// `get` followed by `free`
    pub fn take(&mut self, handle: u32) -> BoundaryResult<HostValue> {
        self.free(handle)
    }

    /// New handle for the value behind `handle`
    pub fn clone_ref(&mut self, handle: u32) -> BoundaryResult<u32> {
        let value = self.get(handle)?;
        self.alloc(value)
    }

    /// Resolve every handle, then release them. Fails without side effects if
    /// any handle is invalid or repeated. Reserved handles resolve to their
    /// constant and are left in place.
    pub fn take_many(&mut self, handles: &[u32]) -> BoundaryResult<Vec<HostValue>> {
        let mut seen = BTreeSet::new();
        let mut values = Vec::with_capacity(handles.len());
        for &handle in handles {
            if handle >= RESERVED_SLOTS && !seen.insert(handle) {
                return Err(BoundaryError::InvalidHandle(handle));
            }
            values.push(self.get(handle)?);
        }

        for handle in seen {
            self.slots[handle as usize] = None;
            self.free.insert(handle);
            self.live -= 1;
        }
        Ok(values)
    }

    /// Number of occupied non-reserved slots
    pub fn live_count(&self) -> usize {
        self.live
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}
