//! WASM Boundary Runtime
//!
//! Host side of the boundary between a compiled module running in a
//! linear-memory sandbox and the embedding program that owns real objects.
//! Strings, buffers, callbacks, errors, promises and streams cross the
//! boundary through this crate, which also keeps the lifetimes of both sides
//! consistent: the module's allocator and explicit releases on one side,
//! host-side reachability on the other.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Boundary                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐  ┌──────────────┐  ┌──────────────────┐    │
//! │  │ Memory View │  │ ExternRef    │  │ Exception Slot   │    │
//! │  │ Cache       │  │ Table        │  │                  │    │
//! │  └──────┬──────┘  └──────┬───────┘  └──────────────────┘    │
//! │         │                │                                  │
//! │  ┌──────▼──────┐  ┌──────▼───────┐  ┌──────────────────┐    │
//! │  │ Strings     │  │ Closures     │  │ Promises/Streams │    │
//! │  └─────────────┘  └──────────────┘  └──────────────────┘    │
//! │                                                             │
//! │      ImportLinker ("wbg")        ModuleExports (module)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use wasm_boundary::{Boundary, BoundaryConfig, ClosureSpec};
//!
//! let engine = wasmtime::Engine::default();
//! let module = wasmtime::Module::new(&engine, wasm_bytes)?;
//! let cx = Boundary::instantiate(BoundaryConfig::development(), &engine, &module)?;
//!
//! // Strings
//! let encoded = cx.encode_string("héllo")?;
//! assert_eq!(cx.decode_string(encoded.ptr, encoded.len)?, "héllo");
//!
//! // Module closures become host functions
//! let callback = cx.wrap_closure(ClosureSpec::new(a, b, dtor, invoke));
//! callback.call(&["clicked".into()])?;
//! cx.drop_closure(&callback)?;
//!
//! // Continuations run when the embedder drains the microtask queue
//! cx.run_microtasks();
//! ```

pub mod abi;
pub mod async_bridge;
pub mod boundary;
pub mod closure;
pub mod config;
pub mod error;
pub mod exception;
pub mod imports;
#[cfg(feature = "wasmtime")]
pub mod instance;
pub mod memory;
pub mod module;
pub mod promise;
pub mod streams;
pub mod strings;
pub mod table;
pub mod value;

pub use abi::{AbiValue, FallibleReturn, WasmAbi, HOST_MODULE_NAME};
pub use async_bridge::PendingAsyncOp;
pub use boundary::{Boundary, SweepReport};
pub use closure::{ClosureInfo, ClosureKind, ClosureSpec, ClosureStats, ReturnKind};
pub use config::{BoundaryConfig, BoundaryLimits, HostCapabilities};
pub use error::{BoundaryError, BoundaryErrorCode, BoundaryResult};
pub use exception::report_uncaught;
pub use imports::{ImportFn, ImportLinker, LogEntry, LogLevel};
pub use memory::{BufferId, LinearMemory, MemoryViews, VecMemory};
#[cfg(feature = "wasmtime")]
pub use instance::{StoreData, WasmtimeModule};
#[cfg(feature = "wasmtime")]
pub use memory::WasmtimeMemory;
pub use module::{AllocEvent, InProcessModule, ModuleExports};
pub use promise::{HostPromise, PromiseFuture, PromiseStatus};
pub use streams::{
    AdapterKind, ByobRequest, ByteRead, ByteSourceAdapter, ReadableByteStreamController,
    ReadableStreamDefaultController, SinkAdapter, SourceAdapter, SourceRead,
};
pub use strings::EncodedString;
pub use table::ExternRefTable;
pub use value::{ByteArray, ErrorObject, HostFunction, HostObject, HostValue};
