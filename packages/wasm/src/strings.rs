//! String transcoding between host strings and UTF-8 in linear memory

use crate::abi::exports;
use crate::boundary::Boundary;
use crate::error::{BoundaryError, BoundaryResult};

/// A string written into linear memory. The module owns the allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedString {
    pub ptr: u32,
    pub len: u32,
}

impl Boundary {
    /// Strict UTF-8 decode of `[ptr, ptr + len)`
    pub fn decode_string(&self, ptr: u32, len: u32) -> BoundaryResult<String> {
        self.with_views(|views| {
            let view = views.bytes();
            let bytes = view.read(ptr, len)?;
            std::str::from_utf8(bytes)
                .map(str::to_owned)
                .map_err(|source| BoundaryError::Decode { ptr, len, source })
        })
    }

    /// Like [`decode_string`](Self::decode_string), except that a null `ptr`
    /// means `len` is a table handle holding an interned host string
    pub fn decode_cached(&self, ptr: u32, len: u32) -> BoundaryResult<String> {
        if ptr != 0 {
            return self.decode_string(ptr, len);
        }
        let value = self.get_ref(len)?;
        value
            .as_str()
            .map(str::to_owned)
            .ok_or(BoundaryError::TypeMismatch {
                expected: "string",
                actual: value.type_name(),
            })
    }

    /// Write `value` into module memory.
    ///
    /// Allocates one byte per UTF-16 unit and copies ASCII directly. At the
    /// first non-ASCII character the region is grown to fit the worst case of
    /// three bytes per remaining unit, the suffix is copied, and the region is
    /// shrunk to the exact length.
    pub fn encode_string(&self, value: &str) -> BoundaryResult<EncodedString> {
        if !self.has_export(exports::REALLOC) {
            return self.encode_string_exact(value);
        }

        let units = value.encode_utf16().count() as u32;
        let mut region = EncodedString {
            ptr: self.malloc(units, 1)?,
            len: units,
        };
        match self.fill_string(value, &mut region) {
            Ok(()) => Ok(region),
            Err(e) => {
                // The region still holds the last size the module handed out
                if let Err(free_err) = self.free(region.ptr, region.len, 1) {
                    tracing::warn!(ptr = region.ptr, error = %free_err, "failed to release string region");
                }
                Err(e)
            }
        }
    }

    fn fill_string(&self, value: &str, region: &mut EncodedString) -> BoundaryResult<()> {
        let units = region.len;
        let ptr = region.ptr;
        let offset = self.with_views(|views| {
            let mut view = views.bytes();
            let slots = view.subarray(ptr, units)?;
            let mut offset = 0u32;
            for (slot, &byte) in slots.iter_mut().zip(value.as_bytes()) {
                if !byte.is_ascii() {
                    break;
                }
                *slot = byte;
                offset += 1;
            }
            Ok::<_, BoundaryError>(offset)
        })?;

        if offset != units {
            let rest = &value.as_bytes()[offset as usize..];
            let remaining_units = units - offset;
            let worst_case = offset + remaining_units * 3;
            region.ptr = self.realloc(region.ptr, region.len, worst_case, 1)?;
            region.len = worst_case;

            self.write_bytes(region.ptr + offset, rest)?;
            let written = offset + rest.len() as u32;
            region.ptr = self.realloc(region.ptr, region.len, written, 1)?;
            region.len = written;
        }
        Ok(())
    }

    /// Allocate the exact UTF-8 length once and copy. Used when the module
    /// has no realloc export.
    pub fn encode_string_exact(&self, value: &str) -> BoundaryResult<EncodedString> {
        let len = value.len() as u32;
        let ptr = self.malloc(len, 1)?;
        self.write_bytes(ptr, value.as_bytes())?;
        Ok(EncodedString { ptr, len })
    }

    /// Copy `data` into a fresh module allocation
    pub fn pass_bytes(&self, data: &[u8]) -> BoundaryResult<EncodedString> {
        let len = data.len() as u32;
        let ptr = self.malloc(len, 1)?;
        self.write_bytes(ptr, data)?;
        Ok(EncodedString { ptr, len })
    }

    /// Copy out a module-returned byte range and free it
    pub fn take_bytes(&self, ptr: u32, len: u32) -> BoundaryResult<Vec<u8>> {
        let bytes = self.read_bytes(ptr, len)?;
        self.free(ptr, len, 1)?;
        Ok(bytes)
    }

    /// Copy `len` `f64`s starting at `ptr`
    pub fn decode_f64_array(&self, ptr: u32, len: u32) -> BoundaryResult<Vec<f64>> {
        self.with_views(|views| views.floats().slice_from(ptr, len))
    }

    /// Write a `(ptr, len)` pair as two little-endian words at `retptr`
    pub fn write_return_pair(&self, retptr: u32, ptr: u32, len: u32) -> BoundaryResult<()> {
        self.with_views(|views| {
            let mut view = views.data_view();
            view.set_u32(retptr, ptr)?;
            view.set_u32(retptr + 4, len)
        })
    }
}
