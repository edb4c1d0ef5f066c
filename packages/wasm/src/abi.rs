//! ABI definitions for the module/host boundary
//!
//! Defines the call shapes, export names and import names shared by the
//! compiled module and the host.

use crate::error::{BoundaryError, BoundaryResult};

/// Module name the compiled module imports host intrinsics from
pub const HOST_MODULE_NAME: &str = "wbg";

/// Exports the host expects from a compiled module
pub mod exports {
    /// Linear memory
    pub const MEMORY: &str = "memory";

    /// Function table holding closure destructors and invoke shims
    pub const FUNCTION_TABLE: &str = "__indirect_function_table";

    /// Allocate memory for the host to write into
    /// Signature: (size: i32, align: i32) -> i32 (pointer)
    pub const MALLOC: &str = "__wbindgen_malloc";

    /// Resize a previous allocation
    /// Signature: (ptr: i32, old_size: i32, new_size: i32, align: i32) -> i32 (pointer)
    pub const REALLOC: &str = "__wbindgen_realloc";

    /// Free a previous allocation with its original size and alignment
    /// Signature: (ptr: i32, size: i32, align: i32) -> ()
    pub const FREE: &str = "__wbindgen_free";

    /// Optional: called once after attach
    /// Signature: () -> ()
    pub const START: &str = "__wbindgen_start";

    /// Readable byte stream source backed by a module object
    pub const BYTE_SOURCE_TYPE: &str = "intounderlyingbytesource_type";
    pub const BYTE_SOURCE_AUTO_ALLOCATE_CHUNK_SIZE: &str =
        "intounderlyingbytesource_autoAllocateChunkSize";
    pub const BYTE_SOURCE_START: &str = "intounderlyingbytesource_start";
    pub const BYTE_SOURCE_PULL: &str = "intounderlyingbytesource_pull";
    pub const BYTE_SOURCE_CANCEL: &str = "intounderlyingbytesource_cancel";
    pub const BYTE_SOURCE_FREE: &str = "__wbg_intounderlyingbytesource_free";

    /// Writable stream sink backed by a module object
    pub const SINK_WRITE: &str = "intounderlyingsink_write";
    pub const SINK_CLOSE: &str = "intounderlyingsink_close";
    pub const SINK_ABORT: &str = "intounderlyingsink_abort";
    pub const SINK_FREE: &str = "__wbg_intounderlyingsink_free";

    /// Readable stream source backed by a module object
    pub const SOURCE_PULL: &str = "intounderlyingsource_pull";
    pub const SOURCE_CANCEL: &str = "intounderlyingsource_cancel";
    pub const SOURCE_FREE: &str = "__wbg_intounderlyingsource_free";
}

/// Host imports the module links against under [`HOST_MODULE_NAME`]
pub mod imports {
    // Values
    pub const STRING_NEW: &str = "__wbindgen_string_new";
    /// Signature: (retptr, handle); writes `(ptr, len)` or `(0, 0)` for non-strings
    pub const STRING_GET: &str = "__wbindgen_string_get";
    /// Returns 0 for false, 1 for true and 2 for non-booleans
    pub const BOOLEAN_GET: &str = "__wbindgen_boolean_get";
    /// Signature: (retptr, handle); writes a presence word at `retptr` and the
    /// value at `retptr + 8`
    pub const NUMBER_GET: &str = "__wbindgen_number_get";
    pub const NUMBER_NEW: &str = "__wbindgen_number_new";
    pub const IS_UNDEFINED: &str = "__wbindgen_is_undefined";
    pub const IS_NULL: &str = "__wbindgen_is_null";
    pub const IS_OBJECT: &str = "__wbindgen_is_object";
    pub const IS_STRING: &str = "__wbindgen_is_string";
    pub const IS_FUNCTION: &str = "__wbindgen_is_function";
    pub const IS_FALSY: &str = "__wbindgen_is_falsy";
    pub const JSVAL_EQ: &str = "__wbindgen_jsval_eq";
    pub const OBJECT_IS: &str = "__wbg_is";
    pub const OBJECT_CLONE_REF: &str = "__wbindgen_object_clone_ref";
    pub const OBJECT_DROP_REF: &str = "__wbindgen_object_drop_ref";
    pub const DEBUG_STRING: &str = "__wbindgen_debug_string";
    pub const LENGTH: &str = "__wbg_length";
    pub const ARRAY_GET: &str = "__wbg_get";
    pub const JSON_PARSE: &str = "__wbg_parse";
    pub const JSON_SERIALIZE: &str = "__wbindgen_json_serialize";

    // Errors
    pub const THROW: &str = "__wbindgen_throw";
    pub const RETHROW: &str = "__wbindgen_rethrow";
    /// Take the pending exception handle, 0 if none
    pub const EXN_TAKE: &str = "__wbindgen_exn_take";
    pub const ERROR_NEW: &str = "__wbg_new_error";
    pub const ERROR_NEW_WITH_MESSAGE: &str = "__wbg_new_error_with_message";
    pub const ERROR_STACK: &str = "__wbg_stack";

    // Tables and buffers
    pub const INIT_EXTERNREF_TABLE: &str = "__wbindgen_init_externref_table";
    pub const FLOAT64_ARRAY_NEW: &str = "__wbindgen_float64_array_new";
    pub const UINT8_ARRAY_NEW_WITH_LENGTH: &str = "__wbg_newwithlength";
    pub const UINT8_ARRAY_SUBARRAY: &str = "__wbg_subarray";
    pub const UINT8_ARRAY_SET: &str = "__wbg_set";
    pub const BYTE_LENGTH: &str = "__wbg_byteLength";
    pub const BYTE_OFFSET: &str = "__wbg_byteOffset";
    /// Signature: (ptr, len, handle); copies module bytes into a host array
    pub const COPY_TO_TYPED_ARRAY: &str = "__wbindgen_copy_to_typed_array";
    /// Signature: (retptr, handle); copies a host array into a fresh module
    /// allocation
    pub const BYTES_GET: &str = "__wbindgen_bytes_get";

    // Closures
    /// Signature: (a, b, dtor, invoke, kind, returns) -> handle
    pub const CLOSURE_WRAPPER: &str = "__wbindgen_closure_wrapper";
    pub const CB_DROP: &str = "__wbindgen_cb_drop";
    pub const CALL0: &str = "__wbg_call0";
    pub const CALL1: &str = "__wbg_call1";

    // Promises
    /// Signature: (a, b, invoke) -> handle
    pub const PROMISE_NEW: &str = "__wbg_new_promise";
    pub const PROMISE_RESOLVE: &str = "__wbg_resolve";
    pub const THEN: &str = "__wbg_then";
    pub const THEN2: &str = "__wbg_then2";
    pub const QUEUE_MICROTASK: &str = "__wbg_queueMicrotask";

    // Streams
    pub const BYOB_REQUEST: &str = "__wbg_byobRequest";
    pub const BYOB_VIEW: &str = "__wbg_view";
    pub const BYOB_RESPOND: &str = "__wbg_respond";
    pub const CONTROLLER_ENQUEUE: &str = "__wbg_enqueue";
    pub const CONTROLLER_CLOSE: &str = "__wbg_close";
    pub const CONTROLLER_ERROR: &str = "__wbg_error";

    // Console
    /// Signature: (level, ptr, len)
    pub const CONSOLE_LOG: &str = "__wbg_log";
    /// Signature: (ptr, len); the module string is freed after logging
    pub const CONSOLE_ERROR: &str = "__wbg_console_error";
    /// Signature: (handle)
    pub const CONSOLE_WARN: &str = "__wbg_warn";
}

/// A primitive value crossing the boundary
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AbiValue {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl AbiValue {
    pub fn as_i32(&self) -> Option<i32> {
        match *self {
            AbiValue::I32(v) => Some(v),
            _ => None,
        }
    }

    /// Pointers, lengths and handles travel as `i32` and are reinterpreted
    pub fn as_u32(&self) -> Option<u32> {
        self.as_i32().map(|v| v as u32)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            AbiValue::I64(v) => Some(v),
            AbiValue::I32(v) => Some(v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            AbiValue::F64(v) => Some(v),
            AbiValue::F32(v) => Some(v as f64),
            AbiValue::I32(v) => Some(v as f64),
            AbiValue::I64(v) => Some(v as f64),
        }
    }
}

impl From<i32> for AbiValue {
    fn from(v: i32) -> Self {
        AbiValue::I32(v)
    }
}

impl From<u32> for AbiValue {
    fn from(v: u32) -> Self {
        AbiValue::I32(v as i32)
    }
}

impl From<i64> for AbiValue {
    fn from(v: i64) -> Self {
        AbiValue::I64(v)
    }
}

impl From<f64> for AbiValue {
    fn from(v: f64) -> Self {
        AbiValue::F64(v)
    }
}

impl From<bool> for AbiValue {
    fn from(v: bool) -> Self {
        AbiValue::I32(v as i32)
    }
}

/// ABI helper functions
pub struct WasmAbi;

impl WasmAbi {
    /// Pack pointer and length into i64 for return values
    /// High 32 bits: pointer, Low 32 bits: length
    #[inline]
    pub fn pack_ptr_len(ptr: u32, len: u32) -> i64 {
        ((ptr as i64) << 32) | (len as i64)
    }

    /// Unpack i64 into pointer and length
    #[inline]
    pub fn unpack_ptr_len(packed: i64) -> (u32, u32) {
        let ptr = (packed >> 32) as u32;
        let len = (packed & 0xFFFFFFFF) as u32;
        (ptr, len)
    }

    /// Read the `index`-th result of `function` as a u32
    pub fn result_u32(function: &str, results: &[AbiValue], index: usize) -> BoundaryResult<u32> {
        results
            .get(index)
            .and_then(AbiValue::as_u32)
            .ok_or_else(|| {
                BoundaryError::trap(
                    function,
                    format!("expected i32 result at position {}, got {:?}", index, results),
                )
            })
    }

    pub fn result_f64(function: &str, results: &[AbiValue], index: usize) -> BoundaryResult<f64> {
        results
            .get(index)
            .and_then(AbiValue::as_f64)
            .ok_or_else(|| {
                BoundaryError::trap(
                    function,
                    format!("expected numeric result at position {}, got {:?}", index, results),
                )
            })
    }

    /// Read the `index`-th argument of `function` as a u32
    pub fn arg_u32(function: &str, args: &[AbiValue], index: usize) -> BoundaryResult<u32> {
        args.get(index).and_then(AbiValue::as_u32).ok_or_else(|| {
            BoundaryError::trap(
                function,
                format!("expected i32 argument at position {}, got {:?}", index, args),
            )
        })
    }

    pub fn arg_f64(function: &str, args: &[AbiValue], index: usize) -> BoundaryResult<f64> {
        args.get(index).and_then(AbiValue::as_f64).ok_or_else(|| {
            BoundaryError::trap(
                function,
                format!("expected numeric argument at position {}, got {:?}", index, args),
            )
        })
    }

    /// Read a multi-value `(ptr, len)` result pair
    pub fn result_ptr_len(function: &str, results: &[AbiValue]) -> BoundaryResult<(u32, u32)> {
        Ok((
            Self::result_u32(function, results, 0)?,
            Self::result_u32(function, results, 1)?,
        ))
    }
}

/// Two-word result of a fallible module export.
///
/// The first word (`error`) is zero on success, otherwise a handle to the
/// thrown value which the caller must take and re-raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallibleReturn {
    pub value: u32,
    pub error: u32,
}

impl FallibleReturn {
    pub fn ok(value: u32) -> Self {
        Self { value, error: 0 }
    }

    pub fn err(handle: u32) -> Self {
        Self {
            value: 0,
            error: handle,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error != 0
    }

    pub fn from_results(function: &str, results: &[AbiValue]) -> BoundaryResult<Self> {
        Ok(Self {
            error: WasmAbi::result_u32(function, results, 0)?,
            value: WasmAbi::result_u32(function, results, 1)?,
        })
    }

    pub fn to_results(self) -> Vec<AbiValue> {
        vec![AbiValue::from(self.error), AbiValue::from(self.value)]
    }
}
