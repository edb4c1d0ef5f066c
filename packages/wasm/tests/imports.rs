//! Host imports called the way module code calls them

mod common;

use common::attach_default;
use wasm_boundary::abi::{imports, HOST_MODULE_NAME};
use wasm_boundary::{
    AbiValue, Boundary, BoundaryConfig, BoundaryError, ByteArray, HostCapabilities, HostValue,
    InProcessModule, LogLevel, WasmAbi,
};

fn call(cx: &Boundary, name: &str, args: &[AbiValue]) -> Vec<AbiValue> {
    cx.call_import(HOST_MODULE_NAME, name, args).unwrap()
}

fn call_u32(cx: &Boundary, name: &str, args: &[AbiValue]) -> u32 {
    WasmAbi::result_u32(name, &call(cx, name, args), 0).unwrap()
}

/// Read and free a `(ptr, len)` string written at `retptr`
fn read_returned_string(cx: &Boundary, retptr: u32) -> Option<String> {
    let (ptr, len) = (cx.read_u32(retptr).unwrap(), cx.read_u32(retptr + 4).unwrap());
    if ptr == 0 {
        return None;
    }
    let bytes = cx.take_bytes(ptr, len).unwrap();
    Some(String::from_utf8(bytes).unwrap())
}

#[test]
fn test_json_round_trip() {
    let (cx, _) = attach_default();
    let text = cx.encode_string(r#"{"b":null,"a":[1.5,true,"x"]}"#).unwrap();
    let parsed = call_u32(&cx, imports::JSON_PARSE, &[text.ptr.into(), text.len.into()]);
    assert!(!cx.has_pending_exception());
    assert_eq!(call_u32(&cx, imports::IS_OBJECT, &[parsed.into()]), 1);

    let retptr = cx.malloc(8, 4).unwrap();
    call(&cx, imports::JSON_SERIALIZE, &[retptr.into(), parsed.into()]);
    assert_eq!(
        read_returned_string(&cx, retptr).as_deref(),
        Some(r#"{"a":[1.5,true,"x"],"b":null}"#)
    );
}

#[test]
fn test_number_get_writes_presence_word() {
    let (cx, _) = attach_default();
    let retptr = cx.malloc(16, 8).unwrap();

    let number = call_u32(&cx, imports::NUMBER_NEW, &[0.25f64.into()]);
    call(&cx, imports::NUMBER_GET, &[retptr.into(), number.into()]);
    assert_eq!(cx.read_u32(retptr).unwrap(), 1);
    assert_eq!(cx.read_f64(retptr + 8).unwrap(), 0.25);

    let text = cx.alloc_ref("not a number".into()).unwrap();
    call(&cx, imports::NUMBER_GET, &[retptr.into(), text.into()]);
    assert_eq!(cx.read_u32(retptr).unwrap(), 0);
}

#[test]
fn test_predicates_and_equality() {
    let (cx, _) = attach_default();
    let empty = cx.alloc_ref("".into()).unwrap();
    let zero = cx.alloc_ref(0.0.into()).unwrap();
    let record = cx.alloc_ref(HostValue::from_json(&serde_json::json!({"k": 1}))).unwrap();
    let nan_a = cx.alloc_ref(f64::NAN.into()).unwrap();
    let nan_b = cx.alloc_ref(f64::NAN.into()).unwrap();

    assert_eq!(call_u32(&cx, imports::IS_FALSY, &[empty.into()]), 1);
    assert_eq!(call_u32(&cx, imports::IS_FALSY, &[zero.into()]), 1);
    assert_eq!(call_u32(&cx, imports::IS_FALSY, &[record.into()]), 0);
    assert_eq!(call_u32(&cx, imports::IS_STRING, &[empty.into()]), 1);
    assert_eq!(call_u32(&cx, imports::IS_FUNCTION, &[record.into()]), 0);
    assert_eq!(call_u32(&cx, imports::BOOLEAN_GET, &[record.into()]), 2);

    // NaN differs under strict equality but not under Object.is
    assert_eq!(call_u32(&cx, imports::JSVAL_EQ, &[nan_a.into(), nan_b.into()]), 0);
    assert_eq!(call_u32(&cx, imports::OBJECT_IS, &[nan_a.into(), nan_b.into()]), 1);
    assert_eq!(call_u32(&cx, imports::LENGTH, &[empty.into()]), 0);
}

#[test]
fn test_debug_string() {
    let (cx, _) = attach_default();
    let retptr = cx.malloc(8, 4).unwrap();
    let value = cx
        .alloc_ref(HostValue::array([HostValue::Null, 2.0.into(), "s".into()]))
        .unwrap();
    call(&cx, imports::DEBUG_STRING, &[retptr.into(), value.into()]);
    assert_eq!(read_returned_string(&cx, retptr).as_deref(), Some(r#"[null, 2, "s"]"#));
}

#[test]
fn test_byte_buffers() {
    let (cx, module) = attach_default();
    let buffer = call_u32(&cx, imports::UINT8_ARRAY_NEW_WITH_LENGTH, &[8u32.into()]);
    let window = call_u32(
        &cx,
        imports::UINT8_ARRAY_SUBARRAY,
        &[buffer.into(), 2u32.into(), 6u32.into()],
    );
    assert_eq!(call_u32(&cx, imports::BYTE_LENGTH, &[window.into()]), 4);
    assert_eq!(call_u32(&cx, imports::BYTE_OFFSET, &[window.into()]), 2);

    let staged = cx.pass_bytes(b"wxyz").unwrap();
    call(
        &cx,
        imports::COPY_TO_TYPED_ARRAY,
        &[staged.ptr.into(), staged.len.into(), window.into()],
    );
    cx.free(staged.ptr, staged.len, 1).unwrap();
    assert_eq!(
        cx.get_ref(buffer).unwrap().as_bytes().unwrap().to_vec(),
        b"\0\0wxyz\0\0"
    );

    let retptr = cx.malloc(8, 4).unwrap();
    call(&cx, imports::BYTES_GET, &[retptr.into(), buffer.into()]);
    let (ptr, len) = (cx.read_u32(retptr).unwrap(), cx.read_u32(retptr + 4).unwrap());
    assert_eq!(cx.take_bytes(ptr, len).unwrap(), b"\0\0wxyz\0\0");

    // Overrunning set throws into the exception slot
    let source = cx.alloc_ref(ByteArray::from_slice(&[1u8, 2, 3]).into()).unwrap();
    call(&cx, imports::UINT8_ARRAY_SET, &[window.into(), source.into(), 3u32.into()]);
    assert!(cx.take_exception().unwrap().is_some());

    cx.free(retptr, 8, 4).unwrap();
    assert_eq!(module.live_allocations(), 0);
}

#[test]
fn test_float64_array_takes_module_allocation() {
    let (cx, module) = attach_default();
    let ptr = cx.malloc(24, 8).unwrap();
    for (i, v) in [1.0, -2.5, 1e10].into_iter().enumerate() {
        cx.write_f64(ptr + 8 * i as u32, v).unwrap();
    }
    let handle = call_u32(&cx, imports::FLOAT64_ARRAY_NEW, &[ptr.into(), 3u32.into()]);
    assert_eq!(module.live_allocations(), 0);
    assert_eq!(call_u32(&cx, imports::LENGTH, &[handle.into()]), 3);
}

#[test]
fn test_console_imports() {
    let (cx, _) = attach_default();
    let info = cx.encode_string("module started").unwrap();
    call(
        &cx,
        imports::CONSOLE_LOG,
        &[(LogLevel::Info as u32).into(), info.ptr.into(), info.len.into()],
    );

    let failure = cx.encode_string("module failed").unwrap();
    call(&cx, imports::CONSOLE_ERROR, &[failure.ptr.into(), failure.len.into()]);

    let warning = cx.alloc_ref(HostValue::array([1.0.into()])).unwrap();
    call(&cx, imports::CONSOLE_WARN, &[warning.into()]);

    let entries = cx.drain_console();
    let summary: Vec<(LogLevel, &str)> = entries
        .iter()
        .map(|e| (e.level, e.message.as_str()))
        .collect();
    assert_eq!(
        summary,
        vec![
            (LogLevel::Info, "module started"),
            (LogLevel::Error, "module failed"),
            (LogLevel::Warn, "[1]"),
        ]
    );
    assert!(cx.console_entries().is_empty());
}

#[test]
fn test_capabilities_gate_linked_imports() {
    let config = BoundaryConfig::development().with_capabilities(HostCapabilities::NONE);
    let cx = Boundary::in_memory(config, 1).unwrap();
    cx.attach(std::sync::Arc::new(InProcessModule::new())).unwrap();

    assert!(cx.has_import(HOST_MODULE_NAME, imports::STRING_NEW));
    assert!(!cx.has_import(HOST_MODULE_NAME, imports::CONSOLE_LOG));
    assert!(matches!(
        cx.call_import(HOST_MODULE_NAME, imports::CLOSURE_WRAPPER, &[]),
        Err(BoundaryError::MissingImport { .. })
    ));
}

#[test]
fn test_embedder_defined_import() {
    let (cx, _) = attach_default();
    cx.define_import("env", "double", |_, args| {
        let n = WasmAbi::arg_f64("double", args, 0)?;
        Ok(vec![AbiValue::F64(n * 2.0)])
    })
    .unwrap();
    assert_eq!(
        cx.call_import("env", "double", &[AbiValue::F64(4.0)]).unwrap(),
        vec![AbiValue::F64(8.0)]
    );
    assert!(matches!(
        cx.define_import(HOST_MODULE_NAME, imports::STRING_NEW, |_, _| Ok(Vec::new())),
        Err(BoundaryError::Initialization(_))
    ));
}
