//! Stream adapters over module-owned sources and sinks

mod common;

use common::attach;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use wasm_boundary::abi::{exports, imports, HOST_MODULE_NAME};
use wasm_boundary::{
    AbiValue, Boundary, BoundaryError, BoundaryResult, ByteRead, ByteSourceAdapter,
    InProcessModule, PromiseStatus, ReadableByteStreamController,
    ReadableStreamDefaultController, SinkAdapter, SourceAdapter, SourceRead, WasmAbi,
};

const OBJECT: u32 = 0x2000;

type FreeLog = Arc<Mutex<Vec<(&'static str, u32, u32)>>>;

fn import(cx: &Boundary, name: &str, args: &[AbiValue]) -> BoundaryResult<Vec<AbiValue>> {
    cx.call_import(HOST_MODULE_NAME, name, args)
}

fn import_u32(cx: &Boundary, name: &str, args: &[AbiValue]) -> BoundaryResult<u32> {
    let results = import(cx, name, args)?;
    WasmAbi::result_u32(name, &results, 0)
}

/// Resolved promise handle, as module code returns from async methods
fn resolved(cx: &Boundary) -> BoundaryResult<Vec<AbiValue>> {
    Ok(vec![import_u32(cx, imports::PROMISE_RESOLVE, &[0u32.into()])?.into()])
}

fn with_free_exports(module: InProcessModule, log: &FreeLog) -> InProcessModule {
    let mut module = module;
    for (label, name) in [
        ("byte_source", exports::BYTE_SOURCE_FREE),
        ("sink", exports::SINK_FREE),
        ("source", exports::SOURCE_FREE),
    ] {
        let log = Arc::clone(log);
        module = module.export(name, move |_, args| {
            let ptr = args[0].as_u32().unwrap_or_default();
            let finalizer = args[1].as_u32().unwrap_or_default();
            log.lock().push((label, ptr, finalizer));
            Ok(Vec::new())
        });
    }
    module
}

/// Byte source filling each BYOB request with `payload`. The first pull
/// throws when `fail_first` is set.
fn byte_source_module(payload: &'static [u8], fail_first: bool, log: &FreeLog) -> InProcessModule {
    let failed = Arc::new(AtomicBool::new(!fail_first));
    let module = InProcessModule::new()
        .export(exports::BYTE_SOURCE_TYPE, |cx, _| {
            let kind = cx.encode_string("bytes")?;
            Ok(vec![kind.ptr.into(), kind.len.into()])
        })
        .export(exports::BYTE_SOURCE_AUTO_ALLOCATE_CHUNK_SIZE, |_, _| {
            Ok(vec![16u32.into()])
        })
        .export(exports::BYTE_SOURCE_PULL, move |cx, args| {
            let controller = args[1].as_u32().unwrap_or_default();
            if !failed.swap(true, Ordering::SeqCst) {
                cx.free_ref(controller)?;
                return Err(BoundaryError::thrown("source not ready"));
            }

            let request = import_u32(cx, imports::BYOB_REQUEST, &[controller.into()])?;
            let view = import_u32(cx, imports::BYOB_VIEW, &[request.into()])?;
            let staged = cx.pass_bytes(payload)?;
            import(
                cx,
                imports::COPY_TO_TYPED_ARRAY,
                &[staged.ptr.into(), staged.len.into(), view.into()],
            )?;
            cx.free(staged.ptr, staged.len, 1)?;
            import(cx, imports::BYOB_RESPOND, &[request.into(), staged.len.into()])?;

            for handle in [view, request, controller] {
                import(cx, imports::OBJECT_DROP_REF, &[handle.into()])?;
            }
            resolved(cx)
        })
        .export(exports::BYTE_SOURCE_CANCEL, |_, _| Ok(Vec::new()));
    with_free_exports(module, log)
}

#[test]
fn test_byte_source_fills_byob_request_in_place() {
    let log = FreeLog::default();
    let (cx, module) = attach(byte_source_module(b"hello", false, &log));
    let source = ByteSourceAdapter::new(&cx, OBJECT);

    assert_eq!(source.kind().unwrap(), "bytes");
    let chunk_size = source.auto_allocate_chunk_size().unwrap();
    assert_eq!(chunk_size, 16);

    let controller = ReadableByteStreamController::new(chunk_size);
    let promise = source.pull(&controller).unwrap();
    assert!(matches!(promise.status(), PromiseStatus::Fulfilled(ref v) if v.is_undefined()));

    match controller.read() {
        ByteRead::Filled { view, len } => {
            assert_eq!(len, 5);
            assert_eq!(view.to_vec(), b"hello");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(cx.live_refs(), 0);
    assert_eq!(module.live_allocations(), 0);

    source.free().unwrap();
    assert_eq!(*log.lock(), vec![("byte_source", OBJECT, 0)]);
}

#[test]
fn test_pull_throw_rejects_and_source_stays_usable() {
    let log = FreeLog::default();
    let (cx, _) = attach(byte_source_module(b"late", true, &log));
    let source = ByteSourceAdapter::new(&cx, OBJECT);
    let controller = ReadableByteStreamController::new(8);

    let first = source.pull(&controller).unwrap();
    match first.status() {
        PromiseStatus::Rejected(reason) => {
            assert_eq!(reason.as_error().unwrap().message(), "source not ready")
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(!source.is_consumed());

    let second = source.pull(&controller).unwrap();
    assert!(matches!(second.status(), PromiseStatus::Fulfilled(_)));
    assert!(matches!(controller.read(), ByteRead::Filled { len: 4, .. }));

    source.cancel().unwrap();
    assert!(matches!(
        source.pull(&controller),
        Err(BoundaryError::AdapterConsumed { kind: "IntoUnderlyingByteSource" })
    ));
    assert!(matches!(source.free(), Err(BoundaryError::AdapterConsumed { .. })));
    drop(source);
    assert_eq!(cx.pending_adapter_leaks(), 0);
    assert!(log.lock().is_empty());
}

fn sink_module(log: &FreeLog, written: &Arc<Mutex<Vec<String>>>) -> InProcessModule {
    let sink = Arc::clone(written);
    let module = InProcessModule::new()
        .export(exports::SINK_WRITE, move |cx, args| {
            let chunk = cx.take_ref(args[1].as_u32().unwrap_or_default())?;
            match chunk.as_str() {
                Some(text) => sink.lock().push(text.to_string()),
                None => return Err(BoundaryError::thrown("sink accepts strings only")),
            }
            resolved(cx)
        })
        .export(exports::SINK_CLOSE, |cx, _| resolved(cx))
        .export(exports::SINK_ABORT, |cx, args| {
            cx.free_ref(args[1].as_u32().unwrap_or_default())?;
            resolved(cx)
        });
    with_free_exports(module, log)
}

#[test]
fn test_sink_close_takes_ownership_once() {
    let log = FreeLog::default();
    let written = Arc::new(Mutex::new(Vec::new()));
    let (cx, _) = attach(sink_module(&log, &written));
    let sink = SinkAdapter::new(&cx, OBJECT);

    sink.write("first".into()).unwrap();
    let rejected = sink.write(7.0.into()).unwrap();
    assert!(matches!(rejected.status(), PromiseStatus::Rejected(_)));
    sink.write("second".into()).unwrap();
    assert_eq!(*written.lock(), vec!["first", "second"]);

    let closed = sink.close().unwrap();
    assert!(matches!(closed.status(), PromiseStatus::Fulfilled(_)));
    assert!(sink.is_consumed());

    for result in [sink.close(), sink.abort("late".into()), sink.write("third".into())] {
        assert!(matches!(
            result,
            Err(BoundaryError::AdapterConsumed { kind: "IntoUnderlyingSink" })
        ));
    }
    assert!(matches!(sink.free(), Err(BoundaryError::AdapterConsumed { .. })));
    assert_eq!(cx.live_refs(), 0);
}

#[test]
fn test_dropped_adapter_is_freed_by_sweep() {
    let log = FreeLog::default();
    let written = Arc::new(Mutex::new(Vec::new()));
    let (cx, _) = attach(sink_module(&log, &written));

    let released = SinkAdapter::new(&cx, OBJECT);
    released.free().unwrap();
    drop(released);

    let leaked = SinkAdapter::new(&cx, OBJECT + 64);
    drop(leaked);
    assert_eq!(cx.pending_adapter_leaks(), 1);
    assert_eq!(*log.lock(), vec![("sink", OBJECT, 0)]);

    assert_eq!(cx.sweep_finalizers().adapters, 1);
    assert_eq!(log.lock()[1], ("sink", OBJECT + 64, 1));
    assert_eq!(cx.sweep_finalizers().adapters, 0);
}

#[test]
fn test_failed_write_reclaims_chunk_handle() {
    let log = FreeLog::default();
    let module = InProcessModule::new()
        .export(exports::SINK_WRITE, |_, _| Err(BoundaryError::trap("write", "unreachable")));
    let (cx, _) = attach(with_free_exports(module, &log));
    let sink = SinkAdapter::new(&cx, OBJECT);

    assert!(matches!(sink.write("chunk".into()), Err(BoundaryError::Trap { .. })));
    assert_eq!(cx.live_refs(), 0);

    // No abort export: the reason handle is reclaimed too
    assert!(matches!(
        sink.abort("reason".into()),
        Err(BoundaryError::MissingExport { .. })
    ));
    assert_eq!(cx.live_refs(), 0);
}

#[test]
fn test_failed_pull_reclaims_controller_handle() {
    let log = FreeLog::default();
    let (cx, _) = attach(with_free_exports(InProcessModule::new(), &log));
    let source = ByteSourceAdapter::new(&cx, OBJECT);
    let controller = ReadableByteStreamController::new(8);

    assert!(matches!(source.start(&controller), Err(BoundaryError::MissingExport { .. })));
    assert!(matches!(source.pull(&controller), Err(BoundaryError::MissingExport { .. })));
    assert_eq!(cx.live_refs(), 0);
    source.free().unwrap();
}

/// What module code does after a fallible import: rethrow a parked exception
fn rethrow_pending(cx: &Boundary) -> BoundaryResult<()> {
    match import_u32(cx, imports::EXN_TAKE, &[])? {
        0 => Ok(()),
        handle => Err(cx.rethrow(handle)),
    }
}

#[test]
fn test_value_source_enqueues_through_imports() {
    let log = FreeLog::default();
    let module = InProcessModule::new()
        .export(exports::SOURCE_PULL, |cx, args| {
            let controller = args[1].as_u32().unwrap_or_default();
            let chunk = import_u32(cx, imports::NUMBER_NEW, &[1.5f64.into()])?;
            let outcome = import(cx, imports::CONTROLLER_ENQUEUE, &[controller.into(), chunk.into()])
                .and_then(|_| rethrow_pending(cx))
                .and_then(|_| import(cx, imports::CONTROLLER_CLOSE, &[controller.into()]))
                .and_then(|_| rethrow_pending(cx));
            cx.free_ref(chunk)?;
            cx.free_ref(controller)?;
            outcome?;
            resolved(cx)
        })
        .export(exports::SOURCE_CANCEL, |_, _| Ok(Vec::new()));
    let (cx, _) = attach(with_free_exports(module, &log));
    let source = SourceAdapter::new(&cx, OBJECT);
    let controller = ReadableStreamDefaultController::new();

    let first = source.pull(&controller).unwrap();
    assert!(matches!(first.status(), PromiseStatus::Fulfilled(_)));
    assert!(matches!(controller.read(), SourceRead::Value(v) if v.as_f64() == Some(1.5)));
    assert!(matches!(controller.read(), SourceRead::Done));

    // The controller throws inside the import and the module rethrows it
    let second = source.pull(&controller).unwrap();
    match second.status() {
        PromiseStatus::Rejected(reason) => {
            assert_eq!(reason.as_error().unwrap().name(), "TypeError")
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(!cx.has_pending_exception());
    assert_eq!(cx.live_refs(), 0);

    source.cancel().unwrap();
    drop(source);
    assert_eq!(cx.sweep_finalizers().adapters, 0);
    assert!(log.lock().is_empty());
}
