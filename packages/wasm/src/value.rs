//! Host values
//!
//! Everything the module refers to through an extern reference handle is a
//! [`HostValue`]: a tagged union of primitives, shared buffers, functions,
//! promises, errors and opaque host resources. Reference variants are cheap to
//! clone and compare by identity.

use crate::closure::{ClosureCell, ClosureInfo};
use crate::error::{BoundaryError, BoundaryResult};
use crate::promise::HostPromise;
use parking_lot::RwLock;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

type NativeFn = dyn Fn(&[HostValue]) -> BoundaryResult<HostValue> + Send + Sync;
type Finalizer = Box<dyn FnOnce() + Send + Sync>;

/// A host value the module can only hold by handle
#[derive(Clone, Default)]
pub enum HostValue {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Arc<str>),
    /// Byte array view over a shared buffer (`Uint8Array`)
    Bytes(ByteArray),
    Float64Array(Arc<[f64]>),
    Array(Arc<[HostValue]>),
    /// Plain structured data (string-keyed record)
    Record(Arc<BTreeMap<String, HostValue>>),
    Function(HostFunction),
    Promise(HostPromise),
    Error(Arc<ErrorObject>),
    /// Opaque host resource (DOM node, stream controller, timer, ...)
    Object(HostObject),
}

impl HostValue {
    pub fn string(s: impl Into<Arc<str>>) -> Self {
        HostValue::String(s.into())
    }

    pub fn error(message: impl Into<String>) -> Self {
        HostValue::Error(Arc::new(ErrorObject::new(message)))
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        HostValue::Error(Arc::new(ErrorObject::with_name("TypeError", message)))
    }

    pub fn array(values: impl IntoIterator<Item = HostValue>) -> Self {
        HostValue::Array(values.into_iter().collect())
    }

    pub fn object<T: Any + Send + Sync>(value: T) -> Self {
        HostValue::Object(HostObject::new(value))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            HostValue::Undefined => "undefined",
            HostValue::Null => "null",
            HostValue::Bool(_) => "boolean",
            HostValue::Number(_) => "number",
            HostValue::String(_) => "string",
            HostValue::Bytes(_) => "Uint8Array",
            HostValue::Float64Array(_) => "Float64Array",
            HostValue::Array(_) => "Array",
            HostValue::Record(_) => "Object",
            HostValue::Function(_) => "function",
            HostValue::Promise(_) => "Promise",
            HostValue::Error(_) => "Error",
            HostValue::Object(_) => "object",
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, HostValue::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, HostValue::Null)
    }

    /// `undefined` or `null`
    pub fn is_like_none(&self) -> bool {
        matches!(self, HostValue::Undefined | HostValue::Null)
    }

    /// `typeof value === "object" && value !== null`
    pub fn is_object(&self) -> bool {
        !matches!(
            self,
            HostValue::Undefined
                | HostValue::Null
                | HostValue::Bool(_)
                | HostValue::Number(_)
                | HostValue::String(_)
                | HostValue::Function(_)
        )
    }

    pub fn is_falsy(&self) -> bool {
        match self {
            HostValue::Undefined | HostValue::Null => true,
            HostValue::Bool(b) => !b,
            HostValue::Number(n) => *n == 0.0 || n.is_nan(),
            HostValue::String(s) => s.is_empty(),
            _ => false,
        }
    }

    /// `===`: like [`same_value`](Self::same_value) except that `NaN` is
    /// never equal and `+0 === -0`
    pub fn strict_equals(&self, other: &HostValue) -> bool {
        match (self, other) {
            (HostValue::Number(a), HostValue::Number(b)) => a == b,
            _ => self.same_value(other),
        }
    }

    /// `length` of strings (UTF-16 units), arrays and typed arrays
    pub fn length(&self) -> Option<usize> {
        match self {
            HostValue::String(s) => Some(s.encode_utf16().count()),
            HostValue::Bytes(b) => Some(b.len()),
            HostValue::Float64Array(values) => Some(values.len()),
            HostValue::Array(values) => Some(values.len()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HostValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&ByteArray> {
        match self {
            HostValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[HostValue]> {
        match self {
            HostValue::Array(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&BTreeMap<String, HostValue>> {
        match self {
            HostValue::Record(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&HostFunction> {
        match self {
            HostValue::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_promise(&self) -> Option<&HostPromise> {
        match self {
            HostValue::Promise(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorObject> {
        match self {
            HostValue::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&HostObject> {
        match self {
            HostValue::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn expect_function(&self) -> BoundaryResult<&HostFunction> {
        self.as_function().ok_or_else(|| self.mismatch("function"))
    }

    pub fn expect_promise(&self) -> BoundaryResult<&HostPromise> {
        self.as_promise().ok_or_else(|| self.mismatch("Promise"))
    }

    pub fn expect_bytes(&self) -> BoundaryResult<&ByteArray> {
        self.as_bytes().ok_or_else(|| self.mismatch("Uint8Array"))
    }

    /// Checked access to an opaque host resource of type `T`
    pub fn expect_object<T: Any + Send + Sync>(&self) -> BoundaryResult<Arc<T>> {
        self.as_object()
            .and_then(HostObject::downcast_arc::<T>)
            .ok_or_else(|| self.mismatch(std::any::type_name::<T>()))
    }

    fn mismatch(&self, expected: &'static str) -> BoundaryError {
        BoundaryError::TypeMismatch {
            expected,
            actual: self.type_name(),
        }
    }

    /// `Object.is` semantics: reference variants compare by identity
    pub fn same_value(&self, other: &HostValue) -> bool {
        match (self, other) {
            (HostValue::Undefined, HostValue::Undefined) => true,
            (HostValue::Null, HostValue::Null) => true,
            (HostValue::Bool(a), HostValue::Bool(b)) => a == b,
            (HostValue::Number(a), HostValue::Number(b)) => {
                (a.is_nan() && b.is_nan()) || a.to_bits() == b.to_bits()
            }
            (HostValue::String(a), HostValue::String(b)) => a == b,
            (HostValue::Bytes(a), HostValue::Bytes(b)) => a.same_view(b),
            (HostValue::Float64Array(a), HostValue::Float64Array(b)) => Arc::ptr_eq(a, b),
            (HostValue::Array(a), HostValue::Array(b)) => Arc::ptr_eq(a, b),
            (HostValue::Record(a), HostValue::Record(b)) => Arc::ptr_eq(a, b),
            (HostValue::Function(a), HostValue::Function(b)) => a.ptr_eq(b),
            (HostValue::Promise(a), HostValue::Promise(b)) => a.ptr_eq(b),
            (HostValue::Error(a), HostValue::Error(b)) => Arc::ptr_eq(a, b),
            (HostValue::Object(a), HostValue::Object(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    /// Build a host value from JSON; objects become records
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => HostValue::Null,
            serde_json::Value::Bool(b) => HostValue::Bool(*b),
            serde_json::Value::Number(n) => HostValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => HostValue::string(s.as_str()),
            serde_json::Value::Array(items) => HostValue::array(items.iter().map(Self::from_json)),
            serde_json::Value::Object(map) => HostValue::Record(Arc::new(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            )),
        }
    }

    /// Serialize to JSON. Values JSON cannot represent (functions, promises,
    /// opaque objects, undefined) become `null`, as `JSON.stringify` does in arrays.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            HostValue::Bool(b) => serde_json::Value::Bool(*b),
            HostValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            HostValue::String(s) => serde_json::Value::String(s.to_string()),
            HostValue::Array(values) => {
                serde_json::Value::Array(values.iter().map(HostValue::to_json).collect())
            }
            HostValue::Float64Array(values) => serde_json::Value::Array(
                values
                    .iter()
                    .map(|v| HostValue::Number(*v).to_json())
                    .collect(),
            ),
            HostValue::Bytes(bytes) => serde_json::Value::Array(
                bytes.to_vec().into_iter().map(serde_json::Value::from).collect(),
            ),
            HostValue::Record(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            HostValue::Error(e) => serde_json::json!({ "name": e.name(), "message": e.message() }),
            _ => serde_json::Value::Null,
        }
    }

    /// Human-readable rendering used by `debug_string` and error reports
    pub fn debug_string(&self) -> String {
        match self {
            HostValue::Undefined => "undefined".to_string(),
            HostValue::Null => "null".to_string(),
            HostValue::Bool(b) => b.to_string(),
            HostValue::Number(n) => format_number(*n),
            HostValue::String(s) => format!("\"{}\"", s),
            HostValue::Function(f) => match f.name() {
                Some(name) if !name.is_empty() => format!("Function({})", name),
                _ => "Function".to_string(),
            },
            HostValue::Array(values) => {
                let inner: Vec<String> = values.iter().map(HostValue::debug_string).collect();
                format!("[{}]", inner.join(", "))
            }
            HostValue::Record(_) => format!("Object({})", self.to_json()),
            HostValue::Error(e) => format!("{}: {}\n{}", e.name(), e.message(), e.stack()),
            HostValue::Bytes(_) => "Uint8Array".to_string(),
            HostValue::Float64Array(_) => "Float64Array".to_string(),
            HostValue::Promise(_) => "Promise".to_string(),
            HostValue::Object(o) => o.short_type_name().to_string(),
        }
    }
}

/// Number formatting matching the host's `String(number)`
fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n == 0.0 {
        "0".to_string()
    } else {
        n.to_string()
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.debug_string())
    }
}

impl From<bool> for HostValue {
    fn from(v: bool) -> Self {
        HostValue::Bool(v)
    }
}

impl From<f64> for HostValue {
    fn from(v: f64) -> Self {
        HostValue::Number(v)
    }
}

impl From<u32> for HostValue {
    fn from(v: u32) -> Self {
        HostValue::Number(v as f64)
    }
}

impl From<i32> for HostValue {
    fn from(v: i32) -> Self {
        HostValue::Number(v as f64)
    }
}

impl From<&str> for HostValue {
    fn from(v: &str) -> Self {
        HostValue::string(v)
    }
}

impl From<String> for HostValue {
    fn from(v: String) -> Self {
        HostValue::string(v)
    }
}

impl From<HostFunction> for HostValue {
    fn from(v: HostFunction) -> Self {
        HostValue::Function(v)
    }
}

impl From<HostPromise> for HostValue {
    fn from(v: HostPromise) -> Self {
        HostValue::Promise(v)
    }
}

impl From<ByteArray> for HostValue {
    fn from(v: ByteArray) -> Self {
        HostValue::Bytes(v)
    }
}

impl From<ErrorObject> for HostValue {
    fn from(v: ErrorObject) -> Self {
        HostValue::Error(Arc::new(v))
    }
}

/// A host-callable function.
///
/// Functions produced by the closure registry carry their closure state, and
/// run a finalizer when the last clone is dropped.
#[derive(Clone)]
pub struct HostFunction {
    inner: Arc<FunctionInner>,
}

struct FunctionInner {
    name: Option<String>,
    call: Box<NativeFn>,
    closure: Option<Arc<ClosureCell>>,
    on_unreachable: Option<Finalizer>,
}

impl Drop for FunctionInner {
    fn drop(&mut self) {
        if let Some(finalizer) = self.on_unreachable.take() {
            finalizer();
        }
    }
}

impl HostFunction {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[HostValue]) -> BoundaryResult<HostValue> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(FunctionInner {
                name: None,
                call: Box::new(f),
                closure: None,
                on_unreachable: None,
            }),
        }
    }

    pub fn named<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[HostValue]) -> BoundaryResult<HostValue> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(FunctionInner {
                name: Some(name.into()),
                call: Box::new(f),
                closure: None,
                on_unreachable: None,
            }),
        }
    }

    /// A plain function that runs `finalizer` once its last clone is dropped
    pub(crate) fn with_finalizer<F>(name: impl Into<String>, f: F, finalizer: Finalizer) -> Self
    where
        F: Fn(&[HostValue]) -> BoundaryResult<HostValue> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(FunctionInner {
                name: Some(name.into()),
                call: Box::new(f),
                closure: None,
                on_unreachable: Some(finalizer),
            }),
        }
    }

    pub(crate) fn from_closure<F>(cell: Arc<ClosureCell>, f: F, finalizer: Finalizer) -> Self
    where
        F: Fn(&[HostValue]) -> BoundaryResult<HostValue> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(FunctionInner {
                name: None,
                call: Box::new(f),
                closure: Some(cell),
                on_unreachable: Some(finalizer),
            }),
        }
    }

    pub fn call(&self, args: &[HostValue]) -> BoundaryResult<HostValue> {
        (self.inner.call)(args)
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub fn ptr_eq(&self, other: &HostFunction) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn closure_cell(&self) -> Option<&Arc<ClosureCell>> {
        self.inner.closure.as_ref()
    }

    /// Snapshot of the closure state if this function wraps a module closure
    pub fn closure_info(&self) -> Option<ClosureInfo> {
        self.inner.closure.as_ref().map(|cell| cell.info())
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("name", &self.inner.name)
            .field("closure", &self.closure_info())
            .finish()
    }
}

/// Host `Error` object with a captured stack trace
#[derive(Debug)]
pub struct ErrorObject {
    name: String,
    message: String,
    stack: String,
}

impl ErrorObject {
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_name("Error", message)
    }

    pub fn with_name(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: std::backtrace::Backtrace::capture().to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn stack(&self) -> &str {
        &self.stack
    }
}

/// Byte array view over a shared, host-owned buffer
#[derive(Clone)]
pub struct ByteArray {
    buffer: Arc<RwLock<Vec<u8>>>,
    offset: usize,
    len: usize,
}

impl ByteArray {
    pub fn new_zeroed(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            buffer: Arc::new(RwLock::new(data)),
            offset: 0,
            len,
        }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self::from_vec(data.to_vec())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn byte_offset(&self) -> usize {
        self.offset
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.buffer.read()[self.offset..self.offset + self.len].to_vec()
    }

    /// View over `[start, end)` of this view, sharing the buffer.
    /// Bounds are clamped like `TypedArray.prototype.subarray`.
    pub fn subarray(&self, start: usize, end: usize) -> ByteArray {
        let start = start.min(self.len);
        let end = end.clamp(start, self.len);
        ByteArray {
            buffer: Arc::clone(&self.buffer),
            offset: self.offset + start,
            len: end - start,
        }
    }

    /// Copy `src` into this view at `at`
    pub fn copy_from(&self, src: &[u8], at: usize) -> BoundaryResult<()> {
        let end = at
            .checked_add(src.len())
            .filter(|end| *end <= self.len)
            .ok_or_else(|| {
                BoundaryError::thrown(format!(
                    "offset {} + length {} is out of bounds for a view of {} bytes",
                    at,
                    src.len(),
                    self.len
                ))
            })?;
        let mut buffer = self.buffer.write();
        buffer[self.offset + at..self.offset + end].copy_from_slice(src);
        Ok(())
    }

    pub fn shares_buffer(&self, other: &ByteArray) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }

    fn same_view(&self, other: &ByteArray) -> bool {
        self.shares_buffer(other) && self.offset == other.offset && self.len == other.len
    }
}

impl fmt::Debug for ByteArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteArray")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// Opaque host resource with checked downcasts
#[derive(Clone)]
pub struct HostObject {
    type_name: &'static str,
    inner: Arc<dyn Any + Send + Sync>,
}

impl HostObject {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self::from_arc(Arc::new(value))
    }

    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            inner: value,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn short_type_name(&self) -> &'static str {
        self.type_name.rsplit("::").next().unwrap_or(self.type_name)
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        (*self.inner).downcast_ref::<T>()
    }

    pub fn downcast_arc<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.inner).downcast::<T>().ok()
    }

    pub fn ptr_eq(&self, other: &HostObject) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostObject({})", self.type_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_string_matches_host_rendering() {
        assert_eq!(HostValue::Number(42.0).debug_string(), "42");
        assert_eq!(HostValue::Number(1.5).debug_string(), "1.5");
        assert_eq!(HostValue::Number(f64::NEG_INFINITY).debug_string(), "-Infinity");
        assert_eq!(HostValue::from("hi").debug_string(), "\"hi\"");
        assert_eq!(
            HostValue::array([HostValue::Null, true.into(), HostValue::Undefined]).debug_string(),
            "[null, true, undefined]"
        );
        let named = HostFunction::named("tick", |_| Ok(HostValue::Undefined));
        assert_eq!(HostValue::from(named).debug_string(), "Function(tick)");
    }

    #[test]
    fn test_json_records() {
        let json = serde_json::json!({ "a": [1, "x"], "b": null });
        let value = HostValue::from_json(&json);
        assert!(value.as_record().is_some());
        assert_eq!(value.to_json(), json);
        assert_eq!(value.debug_string(), format!("Object({})", json));
    }

    #[test]
    fn test_same_value_identity() {
        let a = HostValue::array([HostValue::Number(1.0)]);
        let b = HostValue::array([HostValue::Number(1.0)]);
        assert!(a.same_value(&a.clone()));
        assert!(!a.same_value(&b));
        assert!(HostValue::Number(f64::NAN).same_value(&HostValue::Number(f64::NAN)));
        assert!(HostValue::from("s").same_value(&HostValue::from("s")));
    }

    #[test]
    fn test_object_downcast() {
        #[derive(Debug, PartialEq)]
        struct Timer(u32);

        let value = HostValue::object(Timer(7));
        assert_eq!(*value.expect_object::<Timer>().unwrap(), Timer(7));
        assert!(matches!(
            value.expect_object::<String>(),
            Err(BoundaryError::TypeMismatch { .. })
        ));
        assert_eq!(value.debug_string(), "Timer");
    }

    #[test]
    fn test_byte_array_subarray_shares_buffer() {
        let bytes = ByteArray::new_zeroed(8);
        let view = bytes.subarray(2, 6);
        view.copy_from(&[1, 2], 1).unwrap();
        assert_eq!(bytes.to_vec(), vec![0, 0, 0, 1, 2, 0, 0, 0]);
        assert!(view.copy_from(&[0; 5], 0).is_err());
        assert_eq!(bytes.subarray(6, 100).len(), 2);
    }

    #[test]
    fn test_function_finalizer_runs_on_last_drop() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let cell = ClosureCell::detached_for_tests();
        let f = HostFunction::from_closure(
            cell,
            |_| Ok(HostValue::Undefined),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let g = f.clone();
        drop(f);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        drop(g);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
