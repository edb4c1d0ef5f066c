//! Registration of the host import families

use super::logging::register_console_imports;
use super::ImportLinker;
use crate::abi::{imports, AbiValue, WasmAbi, HOST_MODULE_NAME};
use crate::boundary::Boundary;
use crate::closure::{ClosureKind, ClosureSpec, ReturnKind};
use crate::config::HostCapabilities;
use crate::error::{BoundaryError, BoundaryResult};
use crate::streams::{ByobRequest, ReadableByteStreamController, ReadableStreamDefaultController};
use crate::value::{ByteArray, ErrorObject, HostValue};
use std::sync::Arc;

/// Register the intrinsics and the import families granted by `capabilities`
pub(super) fn register_host_imports(
    linker: &mut ImportLinker,
    capabilities: HostCapabilities,
) -> BoundaryResult<()> {
    register_value_imports(linker)?;
    register_error_imports(linker)?;
    register_buffer_imports(linker)?;

    if capabilities.has(HostCapabilities::CLOSURES) {
        register_closure_imports(linker)?;
    }
    if capabilities.has(HostCapabilities::PROMISES) {
        register_promise_imports(linker)?;
    }
    if capabilities.has(HostCapabilities::STREAMS) {
        register_stream_imports(linker)?;
    }
    if capabilities.has(HostCapabilities::CONSOLE) {
        register_console_imports(linker)?;
    }
    Ok(())
}

/// Read the first `N` arguments as u32 words
pub(super) fn u32_args<const N: usize>(function: &str, args: &[AbiValue]) -> BoundaryResult<[u32; N]> {
    let mut words = [0u32; N];
    for (index, word) in words.iter_mut().enumerate() {
        *word = WasmAbi::arg_u32(function, args, index)?;
    }
    Ok(words)
}

/// Hand `value` to the module under a fresh handle
fn handle_of(cx: &Boundary, value: HostValue) -> BoundaryResult<Vec<AbiValue>> {
    Ok(vec![cx.alloc_ref(value)?.into()])
}

/// Fresh handle, or 0 when there is nothing to return
fn optional_handle(cx: &Boundary, value: Option<HostValue>) -> BoundaryResult<Vec<AbiValue>> {
    match value {
        Some(value) => handle_of(cx, value),
        None => Ok(vec![AbiValue::I32(0)]),
    }
}

/// Encode a host string into module memory and write `(ptr, len)` at `retptr`
fn return_string(cx: &Boundary, retptr: u32, value: Option<&str>) -> BoundaryResult<Vec<AbiValue>> {
    let (ptr, len) = match value {
        Some(s) => {
            let encoded = cx.encode_string(s)?;
            (encoded.ptr, encoded.len)
        }
        None => (0, 0),
    };
    cx.write_return_pair(retptr, ptr, len)?;
    Ok(Vec::new())
}

fn predicate(
    linker: &mut ImportLinker,
    name: &'static str,
    test: fn(&HostValue) -> bool,
) -> BoundaryResult<()> {
    linker.func_wrap(HOST_MODULE_NAME, name, move |cx, args| {
        let [handle] = u32_args(name, args)?;
        Ok(vec![test(&cx.get_ref(handle)?).into()])
    })
}

fn register_value_imports(linker: &mut ImportLinker) -> BoundaryResult<()> {
    linker.func_wrap(HOST_MODULE_NAME, imports::STRING_NEW, |cx, args| {
        let [ptr, len] = u32_args(imports::STRING_NEW, args)?;
        let value = cx.decode_string(ptr, len)?;
        handle_of(cx, value.into())
    })?;

    linker.func_wrap(HOST_MODULE_NAME, imports::STRING_GET, |cx, args| {
        let [retptr, handle] = u32_args(imports::STRING_GET, args)?;
        let value = cx.get_ref(handle)?;
        return_string(cx, retptr, value.as_str())
    })?;

    linker.func_wrap(HOST_MODULE_NAME, imports::BOOLEAN_GET, |cx, args| {
        let [handle] = u32_args(imports::BOOLEAN_GET, args)?;
        let word = match cx.get_ref(handle)?.as_bool() {
            Some(b) => b as i32,
            None => 2,
        };
        Ok(vec![AbiValue::I32(word)])
    })?;

    linker.func_wrap(HOST_MODULE_NAME, imports::NUMBER_GET, |cx, args| {
        let [retptr, handle] = u32_args(imports::NUMBER_GET, args)?;
        match cx.get_ref(handle)?.as_f64() {
            Some(n) => {
                cx.write_u32(retptr, 1)?;
                cx.write_f64(retptr + 8, n)?;
            }
            None => cx.write_u32(retptr, 0)?,
        }
        Ok(Vec::new())
    })?;

    linker.func_wrap(HOST_MODULE_NAME, imports::NUMBER_NEW, |cx, args| {
        let n = WasmAbi::arg_f64(imports::NUMBER_NEW, args, 0)?;
        handle_of(cx, n.into())
    })?;

    predicate(linker, imports::IS_UNDEFINED, HostValue::is_undefined)?;
    predicate(linker, imports::IS_NULL, HostValue::is_null)?;
    predicate(linker, imports::IS_OBJECT, HostValue::is_object)?;
    predicate(linker, imports::IS_STRING, |v| v.as_str().is_some())?;
    predicate(linker, imports::IS_FUNCTION, |v| v.as_function().is_some())?;
    predicate(linker, imports::IS_FALSY, HostValue::is_falsy)?;

    linker.func_wrap(HOST_MODULE_NAME, imports::JSVAL_EQ, |cx, args| {
        let [a, b] = u32_args(imports::JSVAL_EQ, args)?;
        Ok(vec![cx.get_ref(a)?.strict_equals(&cx.get_ref(b)?).into()])
    })?;

    linker.func_wrap(HOST_MODULE_NAME, imports::OBJECT_IS, |cx, args| {
        let [a, b] = u32_args(imports::OBJECT_IS, args)?;
        Ok(vec![cx.get_ref(a)?.same_value(&cx.get_ref(b)?).into()])
    })?;

    linker.func_wrap(HOST_MODULE_NAME, imports::OBJECT_CLONE_REF, |cx, args| {
        let [handle] = u32_args(imports::OBJECT_CLONE_REF, args)?;
        Ok(vec![cx.clone_ref(handle)?.into()])
    })?;

    linker.func_wrap(HOST_MODULE_NAME, imports::OBJECT_DROP_REF, |cx, args| {
        let [handle] = u32_args(imports::OBJECT_DROP_REF, args)?;
        cx.free_ref(handle)?;
        Ok(Vec::new())
    })?;

    linker.func_wrap(HOST_MODULE_NAME, imports::DEBUG_STRING, |cx, args| {
        let [retptr, handle] = u32_args(imports::DEBUG_STRING, args)?;
        let rendered = cx.get_ref(handle)?.debug_string();
        return_string(cx, retptr, Some(&rendered))
    })?;

    linker.func_wrap(HOST_MODULE_NAME, imports::LENGTH, |cx, args| {
        let [handle] = u32_args(imports::LENGTH, args)?;
        let value = cx.get_ref(handle)?;
        let len = value.length().ok_or(BoundaryError::TypeMismatch {
            expected: "value with a length",
            actual: value.type_name(),
        })?;
        Ok(vec![(len as u32).into()])
    })?;

    linker.func_wrap(HOST_MODULE_NAME, imports::ARRAY_GET, |cx, args| {
        let [handle, index] = u32_args(imports::ARRAY_GET, args)?;
        let value = cx.get_ref(handle)?;
        let items = value.as_array().ok_or(BoundaryError::TypeMismatch {
            expected: "Array",
            actual: value.type_name(),
        })?;
        handle_of(cx, items.get(index as usize).cloned().unwrap_or_default())
    })?;

    linker.func_wrap_fallible(HOST_MODULE_NAME, imports::JSON_PARSE, 1, |cx, args| {
        let [ptr, len] = u32_args(imports::JSON_PARSE, args)?;
        let text = cx.decode_string(ptr, len)?;
        let json: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
            BoundaryError::Thrown(ErrorObject::with_name("SyntaxError", e.to_string()).into())
        })?;
        handle_of(cx, HostValue::from_json(&json))
    })?;

    linker.func_wrap(HOST_MODULE_NAME, imports::JSON_SERIALIZE, |cx, args| {
        let [retptr, handle] = u32_args(imports::JSON_SERIALIZE, args)?;
        let value = cx.get_ref(handle)?;
        let json = serde_json::to_string(&value.to_json())?;
        return_string(cx, retptr, Some(&json))
    })?;

    Ok(())
}

fn register_error_imports(linker: &mut ImportLinker) -> BoundaryResult<()> {
    linker.func_wrap(HOST_MODULE_NAME, imports::THROW, |cx, args| {
        let [ptr, len] = u32_args(imports::THROW, args)?;
        Err(cx.raise(ptr, len))
    })?;

    linker.func_wrap(HOST_MODULE_NAME, imports::RETHROW, |cx, args| {
        let [handle] = u32_args(imports::RETHROW, args)?;
        Err(cx.rethrow(handle))
    })?;

    linker.func_wrap(HOST_MODULE_NAME, imports::EXN_TAKE, |cx, _args| {
        Ok(vec![cx.take_exception_handle().unwrap_or(0).into()])
    })?;

    linker.func_wrap(HOST_MODULE_NAME, imports::ERROR_NEW, |cx, _args| {
        handle_of(cx, HostValue::error(""))
    })?;

    linker.func_wrap(HOST_MODULE_NAME, imports::ERROR_NEW_WITH_MESSAGE, |cx, args| {
        let [ptr, len] = u32_args(imports::ERROR_NEW_WITH_MESSAGE, args)?;
        let message = cx.decode_cached(ptr, len)?;
        handle_of(cx, HostValue::error(message))
    })?;

    linker.func_wrap(HOST_MODULE_NAME, imports::ERROR_STACK, |cx, args| {
        let [retptr, handle] = u32_args(imports::ERROR_STACK, args)?;
        let value = cx.get_ref(handle)?;
        let error = value.as_error().ok_or(BoundaryError::TypeMismatch {
            expected: "Error",
            actual: value.type_name(),
        })?;
        return_string(cx, retptr, Some(error.stack()))
    })?;

    linker.func_wrap(HOST_MODULE_NAME, imports::INIT_EXTERNREF_TABLE, |cx, _args| {
        cx.init_externref_table();
        Ok(Vec::new())
    })?;

    Ok(())
}

fn bytes_arg(cx: &Boundary, handle: u32) -> BoundaryResult<ByteArray> {
    Ok(cx.get_ref(handle)?.expect_bytes()?.clone())
}

fn register_buffer_imports(linker: &mut ImportLinker) -> BoundaryResult<()> {
    linker.func_wrap(HOST_MODULE_NAME, imports::FLOAT64_ARRAY_NEW, |cx, args| {
        let [ptr, len] = u32_args(imports::FLOAT64_ARRAY_NEW, args)?;
        let values = cx.decode_f64_array(ptr, len)?;
        cx.free(ptr, len * 8, 8)?;
        handle_of(cx, HostValue::Float64Array(values.into()))
    })?;

    linker.func_wrap(HOST_MODULE_NAME, imports::UINT8_ARRAY_NEW_WITH_LENGTH, |cx, args| {
        let [len] = u32_args(imports::UINT8_ARRAY_NEW_WITH_LENGTH, args)?;
        handle_of(cx, ByteArray::new_zeroed(len as usize).into())
    })?;

    linker.func_wrap(HOST_MODULE_NAME, imports::UINT8_ARRAY_SUBARRAY, |cx, args| {
        let [handle, start, end] = u32_args(imports::UINT8_ARRAY_SUBARRAY, args)?;
        let bytes = bytes_arg(cx, handle)?;
        handle_of(cx, bytes.subarray(start as usize, end as usize).into())
    })?;

    linker.func_wrap_fallible(HOST_MODULE_NAME, imports::UINT8_ARRAY_SET, 0, |cx, args| {
        let [target, source, offset] = u32_args(imports::UINT8_ARRAY_SET, args)?;
        let target = bytes_arg(cx, target)?;
        let source = bytes_arg(cx, source)?.to_vec();
        target.copy_from(&source, offset as usize)?;
        Ok(Vec::new())
    })?;

    linker.func_wrap(HOST_MODULE_NAME, imports::BYTE_LENGTH, |cx, args| {
        let [handle] = u32_args(imports::BYTE_LENGTH, args)?;
        Ok(vec![(bytes_arg(cx, handle)?.len() as u32).into()])
    })?;

    linker.func_wrap(HOST_MODULE_NAME, imports::BYTE_OFFSET, |cx, args| {
        let [handle] = u32_args(imports::BYTE_OFFSET, args)?;
        Ok(vec![(bytes_arg(cx, handle)?.byte_offset() as u32).into()])
    })?;

    linker.func_wrap(HOST_MODULE_NAME, imports::COPY_TO_TYPED_ARRAY, |cx, args| {
        let [ptr, len, handle] = u32_args(imports::COPY_TO_TYPED_ARRAY, args)?;
        let target = bytes_arg(cx, handle)?;
        let data = cx.read_bytes(ptr, len)?;
        target.copy_from(&data, 0)?;
        Ok(Vec::new())
    })?;

    linker.func_wrap(HOST_MODULE_NAME, imports::BYTES_GET, |cx, args| {
        let [retptr, handle] = u32_args(imports::BYTES_GET, args)?;
        let data = bytes_arg(cx, handle)?.to_vec();
        let passed = cx.pass_bytes(&data)?;
        cx.write_return_pair(retptr, passed.ptr, passed.len)?;
        Ok(Vec::new())
    })?;

    Ok(())
}

fn register_closure_imports(linker: &mut ImportLinker) -> BoundaryResult<()> {
    linker.func_wrap(HOST_MODULE_NAME, imports::CLOSURE_WRAPPER, |cx, args| {
        let [a, b, dtor, invoke, kind, returns] = u32_args(imports::CLOSURE_WRAPPER, args)?;
        let kind = ClosureKind::from_abi(kind).ok_or_else(|| {
            BoundaryError::trap(imports::CLOSURE_WRAPPER, format!("unknown closure kind {}", kind))
        })?;
        let returns = ReturnKind::from_abi(returns).ok_or_else(|| {
            BoundaryError::trap(imports::CLOSURE_WRAPPER, format!("unknown return kind {}", returns))
        })?;
        let spec = ClosureSpec {
            kind,
            returns,
            ..ClosureSpec::new(a, b, dtor, invoke)
        };
        handle_of(cx, cx.wrap_closure(spec).into())
    })?;

    linker.func_wrap(HOST_MODULE_NAME, imports::CB_DROP, |cx, args| {
        let [handle] = u32_args(imports::CB_DROP, args)?;
        let value = cx.get_ref(handle)?;
        let destroyed = cx.drop_closure(value.expect_function()?)?;
        Ok(vec![destroyed.into()])
    })?;

    // The receiver argument is accepted for ABI compatibility; host
    // functions have no `this`.
    linker.func_wrap_fallible(HOST_MODULE_NAME, imports::CALL0, 1, |cx, args| {
        let [function, _this] = u32_args(imports::CALL0, args)?;
        let result = cx.call_handle(function, &[])?;
        handle_of(cx, result)
    })?;

    linker.func_wrap_fallible(HOST_MODULE_NAME, imports::CALL1, 1, |cx, args| {
        let [function, _this, arg] = u32_args(imports::CALL1, args)?;
        let arg = cx.get_ref(arg)?;
        let result = cx.call_handle(function, &[arg])?;
        handle_of(cx, result)
    })?;

    Ok(())
}

fn register_promise_imports(linker: &mut ImportLinker) -> BoundaryResult<()> {
    linker.func_wrap(HOST_MODULE_NAME, imports::PROMISE_NEW, |cx, args| {
        let [a, b, invoke] = u32_args(imports::PROMISE_NEW, args)?;
        let op = cx.new_promise(a, b, invoke)?;
        handle_of(cx, op.promise().clone().into())
    })?;

    linker.func_wrap(HOST_MODULE_NAME, imports::PROMISE_RESOLVE, |cx, args| {
        let [handle] = u32_args(imports::PROMISE_RESOLVE, args)?;
        let promise = cx.promise_resolve(cx.get_ref(handle)?);
        handle_of(cx, promise.into())
    })?;

    linker.func_wrap(HOST_MODULE_NAME, imports::THEN, |cx, args| {
        let [promise, on_fulfilled] = u32_args(imports::THEN, args)?;
        let promise = cx.get_ref(promise)?;
        let on_fulfilled = cx.get_ref(on_fulfilled)?;
        let chained = cx.chain(promise.expect_promise()?, on_fulfilled.expect_function()?.clone(), None);
        handle_of(cx, chained.into())
    })?;

    linker.func_wrap(HOST_MODULE_NAME, imports::THEN2, |cx, args| {
        let [promise, on_fulfilled, on_rejected] = u32_args(imports::THEN2, args)?;
        let promise = cx.get_ref(promise)?;
        let on_fulfilled = cx.get_ref(on_fulfilled)?;
        let on_rejected = cx.get_ref(on_rejected)?;
        let chained = cx.chain(
            promise.expect_promise()?,
            on_fulfilled.expect_function()?.clone(),
            Some(on_rejected.expect_function()?.clone()),
        );
        handle_of(cx, chained.into())
    })?;

    linker.func_wrap(HOST_MODULE_NAME, imports::QUEUE_MICROTASK, |cx, args| {
        let [callback] = u32_args(imports::QUEUE_MICROTASK, args)?;
        let callback = cx.get_ref(callback)?;
        cx.queue_microtask(callback.expect_function()?.clone());
        Ok(Vec::new())
    })?;

    Ok(())
}

enum Controller {
    Bytes(Arc<ReadableByteStreamController>),
    Values(Arc<ReadableStreamDefaultController>),
}

impl Controller {
    fn from_value(value: &HostValue) -> BoundaryResult<Self> {
        let object = value.as_object();
        if let Some(controller) = object.and_then(|o| o.downcast_arc::<ReadableByteStreamController>()) {
            return Ok(Controller::Bytes(controller));
        }
        if let Some(controller) = object.and_then(|o| o.downcast_arc::<ReadableStreamDefaultController>()) {
            return Ok(Controller::Values(controller));
        }
        Err(BoundaryError::TypeMismatch {
            expected: "stream controller",
            actual: value.type_name(),
        })
    }
}

fn register_stream_imports(linker: &mut ImportLinker) -> BoundaryResult<()> {
    linker.func_wrap(HOST_MODULE_NAME, imports::BYOB_REQUEST, |cx, args| {
        let [controller] = u32_args(imports::BYOB_REQUEST, args)?;
        let controller = cx.get_ref(controller)?.expect_object::<ReadableByteStreamController>()?;
        optional_handle(cx, controller.byob_request().map(HostValue::object))
    })?;

    linker.func_wrap(HOST_MODULE_NAME, imports::BYOB_VIEW, |cx, args| {
        let [request] = u32_args(imports::BYOB_VIEW, args)?;
        let request = cx.get_ref(request)?.expect_object::<ByobRequest>()?;
        handle_of(cx, request.view().clone().into())
    })?;

    linker.func_wrap_fallible(HOST_MODULE_NAME, imports::BYOB_RESPOND, 0, |cx, args| {
        let [request, written] = u32_args(imports::BYOB_RESPOND, args)?;
        let request = cx.get_ref(request)?.expect_object::<ByobRequest>()?;
        request.respond(written as usize)?;
        Ok(Vec::new())
    })?;

    linker.func_wrap_fallible(HOST_MODULE_NAME, imports::CONTROLLER_ENQUEUE, 0, |cx, args| {
        let [controller, chunk] = u32_args(imports::CONTROLLER_ENQUEUE, args)?;
        let chunk = cx.get_ref(chunk)?;
        match Controller::from_value(&cx.get_ref(controller)?)? {
            Controller::Bytes(c) => c.enqueue(chunk.expect_bytes()?)?,
            Controller::Values(c) => c.enqueue(chunk)?,
        }
        Ok(Vec::new())
    })?;

    linker.func_wrap_fallible(HOST_MODULE_NAME, imports::CONTROLLER_CLOSE, 0, |cx, args| {
        let [controller] = u32_args(imports::CONTROLLER_CLOSE, args)?;
        match Controller::from_value(&cx.get_ref(controller)?)? {
            Controller::Bytes(c) => c.close()?,
            Controller::Values(c) => c.close()?,
        }
        Ok(Vec::new())
    })?;

    linker.func_wrap(HOST_MODULE_NAME, imports::CONTROLLER_ERROR, |cx, args| {
        let [controller, reason] = u32_args(imports::CONTROLLER_ERROR, args)?;
        let reason = cx.get_ref(reason)?;
        match Controller::from_value(&cx.get_ref(controller)?)? {
            Controller::Bytes(c) => c.error(reason),
            Controller::Values(c) => c.error(reason),
        }
        Ok(Vec::new())
    })?;

    Ok(())
}
