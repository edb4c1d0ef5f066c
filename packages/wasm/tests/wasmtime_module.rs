//! Compiled modules linked against the host imports through wasmtime

#![cfg(feature = "wasmtime")]

use wasm_boundary::{AbiValue, Boundary, BoundaryConfig, BoundaryError, HostValue, WasmAbi};
use wasmtime::{Engine, Module};

/// Bump allocator, a function table holding a closure destructor (1) and
/// invoke shim (2), and exports that reach into the host.
const MODULE: &str = r#"
(module
  (import "wbg" "__wbindgen_string_new" (func $string_new (param i32 i32) (result i32)))
  (import "wbg" "__wbindgen_closure_wrapper"
    (func $closure_wrapper (param i32 i32 i32 i32 i32 i32) (result i32)))
  (import "wbg" "__wbg_call1" (func $call1 (param i32 i32 i32) (result i32)))
  (import "wbg" "__wbg_parse" (func $parse (param i32 i32) (result i32)))
  (import "wbg" "__wbindgen_exn_take" (func $exn_take (result i32)))
  (import "wbg" "__wbindgen_throw" (func $throw (param i32 i32)))
  (import "wbg" "__wbindgen_object_drop_ref" (func $drop_ref (param i32)))

  (memory (export "memory") 1 4)
  (table (export "__indirect_function_table") 3 funcref)
  (elem (i32.const 1) $dtor $invoke)
  (global $heap (mut i32) (i32.const 1024))

  (data (i32.const 16) "h\c3\a9llo")
  (data (i32.const 32) "{not json")
  (data (i32.const 48) "boom")

  (func $malloc (export "__wbindgen_malloc") (param $size i32) (param $align i32) (result i32)
    (local $ptr i32)
    global.get $heap
    local.set $ptr
    global.get $heap
    local.get $size
    i32.add
    global.set $heap
    local.get $ptr)

  (func (export "__wbindgen_realloc")
    (param $ptr i32) (param $old i32) (param $new i32) (param $align i32) (result i32)
    (local $moved i32)
    local.get $new
    local.get $align
    call $malloc
    local.set $moved
    local.get $moved
    local.get $ptr
    local.get $old
    memory.copy
    local.get $moved)

  (func (export "__wbindgen_free") (param i32 i32 i32))

  ;; counts destructor runs at address 8
  (func $dtor (param $a i32) (param $b i32)
    i32.const 8
    i32.const 8
    i32.load
    i32.const 1
    i32.add
    i32.store)

  (func $invoke (param $a i32) (param $b i32) (param $arg i32) (result f64)
    local.get $arg
    call $drop_ref
    local.get $a
    local.get $b
    i32.add
    f64.convert_i32_u)

  (func (export "greeting") (result i32)
    i32.const 16
    i32.const 6
    call $string_new)

  ;; shared closure over (7, 8) returning a number
  (func (export "make_callback") (result i32)
    i32.const 7
    i32.const 8
    i32.const 1
    i32.const 2
    i32.const 2
    i32.const 1
    call $closure_wrapper)

  (func (export "call_with") (param $f i32) (param $arg i32) (result i32)
    local.get $f
    i32.const 0
    local.get $arg
    call $call1)

  (func (export "parse_bad") (result i32)
    i32.const 32
    i32.const 9
    call $parse
    drop
    call $exn_take)

  (func (export "fail")
    i32.const 48
    i32.const 4
    call $throw))
"#;

fn boundary() -> Boundary {
    let engine = Engine::default();
    let wasm = wat::parse_str(MODULE).expect("valid wat");
    let module = Module::new(&engine, wasm).expect("module compiles");
    Boundary::instantiate(BoundaryConfig::development(), &engine, &module).expect("instantiate")
}

fn call_for_handle(cx: &Boundary, name: &str, args: &[AbiValue]) -> u32 {
    let results = cx.call_export(name, args).unwrap();
    WasmAbi::result_u32(name, &results, 0).unwrap()
}

#[test]
fn test_module_creates_string_from_its_memory() {
    let cx = boundary();
    let handle = call_for_handle(&cx, "greeting", &[]);
    assert_eq!(cx.take_ref(handle).unwrap().as_str(), Some("héllo"));
    assert_eq!(cx.live_refs(), 0);
}

#[test]
fn test_host_strings_use_module_allocator() {
    let cx = boundary();
    let encoded = cx.encode_string("naïve café").unwrap();
    assert!(encoded.ptr >= 1024);
    assert_eq!(cx.decode_string(encoded.ptr, encoded.len).unwrap(), "naïve café");
}

#[test]
fn test_closure_invoked_from_host_and_from_module() {
    let cx = boundary();
    let handle = call_for_handle(&cx, "make_callback", &[]);
    let callback = cx.get_ref(handle).unwrap().expect_function().unwrap().clone();

    let direct = callback.call(&["clicked".into()]).unwrap();
    assert!(matches!(direct, HostValue::Number(n) if n == 15.0));

    // The module calls back into the host, which re-enters the module
    let arg = cx.alloc_ref(2.0.into()).unwrap();
    let result = call_for_handle(&cx, "call_with", &[handle.into(), arg.into()]);
    assert!(matches!(cx.take_ref(result).unwrap(), HostValue::Number(n) if n == 15.0));
    cx.free_ref(arg).unwrap();
    assert!(!cx.has_pending_exception());

    assert!(cx.drop_closure(&callback).unwrap());
    assert_eq!(cx.read_u32(8).unwrap(), 1);
    cx.free_ref(handle).unwrap();
    assert_eq!(cx.live_refs(), 0);
}

#[test]
fn test_module_takes_exception_after_failed_import() {
    let cx = boundary();
    let handle = call_for_handle(&cx, "parse_bad", &[]);
    assert_ne!(handle, 0);
    assert!(!cx.has_pending_exception());

    let thrown = cx.take_ref(handle).unwrap();
    assert_eq!(thrown.as_error().unwrap().name(), "SyntaxError");
}

#[test]
fn test_throwing_import_unwinds_module_call() {
    let cx = boundary();
    match cx.call_export("fail", &[]) {
        Err(BoundaryError::Thrown(value)) => {
            assert_eq!(value.as_error().unwrap().message(), "boom");
        }
        other => panic!("expected a throw, got {:?}", other),
    }

    // The instance stays usable after the trap
    let handle = call_for_handle(&cx, "greeting", &[]);
    assert_eq!(cx.take_ref(handle).unwrap().as_str(), Some("héllo"));
}

#[test]
fn test_calls_from_another_thread() {
    let cx = boundary();
    let worker = cx.clone();
    let handle = std::thread::spawn(move || call_for_handle(&worker, "greeting", &[]))
        .join()
        .unwrap();
    assert_eq!(cx.take_ref(handle).unwrap().as_str(), Some("héllo"));
}

#[test]
fn test_null_table_entry_traps() {
    let cx = boundary();
    let err = cx.call_indirect(0, &[]).unwrap_err();
    assert!(matches!(err, BoundaryError::Trap { .. }));
}

#[test]
fn test_unknown_import_fails_instantiation() {
    let engine = Engine::default();
    let wasm = wat::parse_str(
        r#"(module
             (import "wbg" "__wbg_not_a_host_function" (func))
             (memory (export "memory") 1))"#,
    )
    .expect("valid wat");
    let module = Module::new(&engine, wasm).expect("module compiles");
    let err = Boundary::instantiate(BoundaryConfig::development(), &engine, &module).unwrap_err();
    assert!(matches!(err, BoundaryError::MissingImport { ref name, .. } if name == "__wbg_not_a_host_function"));
}
