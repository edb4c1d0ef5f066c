//! Boundary over the linear memory of a real wasmtime instance

#![cfg(feature = "wasmtime")]

use wasm_boundary::{Boundary, BoundaryConfig, BoundaryError};
use wasmtime::{Engine, Module};

const MODULE: &str = r#"
(module
  (memory (export "memory") 1 3)
  (data (i32.const 16) "h\c3\a9llo"))
"#;

fn boundary() -> Boundary {
    let engine = Engine::default();
    let wasm = wat::parse_str(MODULE).expect("valid wat");
    let module = Module::new(&engine, wasm).expect("module compiles");
    Boundary::instantiate(BoundaryConfig::development(), &engine, &module).expect("instantiate")
}

#[test]
fn test_reads_data_segment() {
    let cx = boundary();
    assert_eq!(cx.memory_size(), 65536);
    assert_eq!(cx.decode_string(16, 6).unwrap(), "héllo");
}

#[test]
fn test_growth_revalidates_views() {
    let cx = boundary();
    cx.write_u32(64, 0xfeed).unwrap();
    let rebuilds = cx.view_rebuilds();

    assert_eq!(cx.grow_memory(1).unwrap(), 1);
    assert_eq!(cx.memory_size(), 2 * 65536);

    // The write lands past the old end, so a stale view would fail
    cx.write_u32(65536 + 8, 7).unwrap();
    assert!(cx.view_rebuilds() > rebuilds);
    assert_eq!(cx.read_u32(64).unwrap(), 0xfeed);
    assert_eq!(cx.read_u32(65536 + 8).unwrap(), 7);
}

#[test]
fn test_module_without_memory_is_rejected() {
    let engine = Engine::default();
    let wasm = wat::parse_str("(module (func (export \"noop\")))").expect("valid wat");
    let module = Module::new(&engine, wasm).expect("module compiles");
    let err = Boundary::instantiate(BoundaryConfig::development(), &engine, &module).unwrap_err();
    assert!(matches!(err, BoundaryError::MissingExport { .. }));
}

#[test]
fn test_growth_past_module_maximum_fails() {
    let cx = boundary();
    cx.grow_memory(2).unwrap();
    assert!(matches!(cx.grow_memory(1), Err(BoundaryError::MemoryGrow { .. })));
    assert_eq!(cx.memory_size(), 3 * 65536);
}
