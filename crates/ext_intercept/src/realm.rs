//! Value model of the instrumented context.
//!
//! A [`Realm`] plays the role of the page's global scope: it owns the global
//! [`Object`] that page functions live on, and the current bindings of the
//! native communication primitives. Objects and functions are shared handles
//! with reference identity, so replacing a property on an object is observed
//! by every holder of that object.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::{Map, Number, Value as Json};

use crate::net::{
    Fetch, HttpRequestFactory, NativeFetch, NativeHttpRequestFactory, NativeSocketFactory,
    SocketFactory,
};
use crate::InterceptError;

/// Nesting deeper than this is serialized as `null`.
const MAX_JSON_DEPTH: usize = 32;

/// Integers up to 2^53 survive the f64 round trip exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

thread_local! {
    static CALL_STACK: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

// ============================================================================
// Call Stack
// ============================================================================

/// Guard for one realm call frame; pops on drop so unwinding keeps the stack sane.
struct Frame;

impl Frame {
    fn enter(name: &str) -> Self {
        CALL_STACK.with(|stack| stack.borrow_mut().push(name.to_string()));
        Frame
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        CALL_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Snapshot of the realm call stack, innermost frame first, one `    at name` line per frame.
pub fn capture_stack() -> String {
    CALL_STACK.with(|stack| {
        stack
            .borrow()
            .iter()
            .rev()
            .map(|frame| format!("    at {}", frame))
            .collect::<Vec<_>>()
            .join("\n")
    })
}

// ============================================================================
// Exception
// ============================================================================

/// An error thrown by a realm function, with the call stack at the throw site.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct Exception {
    pub message: String,
    pub stack: String,
}

impl Exception {
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        let frames = capture_stack();
        let stack = if frames.is_empty() {
            format!("Error: {}", message)
        } else {
            format!("Error: {}\n{}", message, frames)
        };
        Self { message, stack }
    }
}

impl From<InterceptError> for Exception {
    fn from(e: InterceptError) -> Self {
        Exception::new(e.to_string())
    }
}

// ============================================================================
// Function
// ============================================================================

type NativeFn = dyn Fn(&Value, &[Value]) -> Result<Value, Exception> + Send + Sync;

struct FunctionInner {
    name: String,
    body: Box<NativeFn>,
}

/// A callable realm value. Clones share identity.
#[derive(Clone)]
pub struct Function {
    inner: Arc<FunctionInner>,
}

impl Function {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&Value, &[Value]) -> Result<Value, Exception> + Send + Sync + 'static,
    {
        let name = name.into();
        Self {
            inner: Arc::new(FunctionInner {
                name: if name.is_empty() {
                    "<anonymous>".to_string()
                } else {
                    name
                },
                body: Box::new(body),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Invoke with an explicit receiver (`this`).
    pub fn call(&self, receiver: &Value, args: &[Value]) -> Result<Value, Exception> {
        let _frame = Frame::enter(&self.inner.name);
        (self.inner.body)(receiver, args)
    }

    pub fn ptr_eq(&self, other: &Function) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Function {}]", self.inner.name)
    }
}

// ============================================================================
// Object
// ============================================================================

/// A shared, mutable property map. Clones share identity.
#[derive(Clone, Default)]
pub struct Object {
    props: Arc<RwLock<BTreeMap<String, Value>>>,
}

impl Object {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Value>> {
        self.props.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Value>> {
        self.props.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.read().get(key).cloned()
    }

    /// Set a property, returning the previous value.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.write().insert(key.into(), value.into())
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.write().remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Cloned snapshot of all properties; the lock is not held afterwards.
    pub fn entries(&self) -> Vec<(String, Value)> {
        self.read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn ptr_eq(&self, other: &Object) -> bool {
        Arc::ptr_eq(&self.props, &other.props)
    }

    fn id(&self) -> usize {
        Arc::as_ptr(&self.props) as *const () as usize
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object").field("keys", &self.keys()).finish()
    }
}

// ============================================================================
// Value
// ============================================================================

/// Any value reachable from the realm.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    Object(Object),
    Function(Function),
}

impl Value {
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, Value::Function(_))
    }

    /// Primitives serialize as themselves rather than as JSON text.
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Value::Undefined | Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_)
        )
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
        }
    }

    /// JSON form; `undefined` and functions become `null`.
    ///
    /// An object that contains itself is written as `null` where it repeats.
    pub fn to_json(&self) -> Json {
        self.to_json_opt().unwrap_or(Json::Null)
    }

    /// JSON form, or `None` where JSON.stringify would omit the value.
    pub fn to_json_opt(&self) -> Option<Json> {
        let mut path = Vec::new();
        self.json_at(&mut path, Cycles::Cut).unwrap_or(Some(Json::Null))
    }

    /// Like [`Value::to_json_opt`], but a circular structure is an error,
    /// as with JSON.stringify.
    pub fn try_to_json(&self) -> Result<Option<Json>, Exception> {
        let mut path = Vec::new();
        self.json_at(&mut path, Cycles::Reject)
    }

    /// `path` holds the identities of the objects currently being written.
    fn json_at(&self, path: &mut Vec<usize>, cycles: Cycles) -> Result<Option<Json>, Exception> {
        if path.len() > MAX_JSON_DEPTH {
            return Ok(Some(Json::Null));
        }
        let json = match self {
            Value::Undefined | Value::Function(_) => None,
            Value::Null => Some(Json::Null),
            Value::Bool(b) => Some(Json::Bool(*b)),
            Value::Number(n) => Some(number_to_json(*n)),
            Value::String(s) => Some(Json::String(s.clone())),
            Value::Array(items) => {
                let mut array = Vec::with_capacity(items.len());
                for item in items {
                    array.push(item.json_at(path, cycles)?.unwrap_or(Json::Null));
                }
                Some(Json::Array(array))
            }
            Value::Object(obj) => {
                let id = obj.id();
                if path.contains(&id) {
                    return match cycles {
                        Cycles::Cut => Ok(Some(Json::Null)),
                        Cycles::Reject => Err(Exception::new("Converting circular structure to JSON")),
                    };
                }
                path.push(id);
                let mut map = Map::new();
                let mut written = Ok(());
                for (key, value) in obj.entries() {
                    match value.json_at(path, cycles) {
                        Ok(Some(json)) => {
                            map.insert(key, json);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            written = Err(e);
                            break;
                        }
                    }
                }
                path.pop();
                written?;
                Some(Json::Object(map))
            }
        };
        Ok(json)
    }
}

#[derive(Debug, Clone, Copy)]
enum Cycles {
    /// Write `null` where an object repeats on the current path.
    Cut,
    Reject,
}

fn number_to_json(n: f64) -> Json {
    if n.is_finite() && n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        Json::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Json::Number).unwrap_or(Json::Null)
    }
}

/// Primitives and arrays compare structurally; objects and functions by identity.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl From<Json> for Value {
    fn from(json: Json) -> Self {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            Json::String(s) => Value::String(s),
            Json::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            Json::Object(map) => {
                let obj = Object::new();
                for (key, value) in map {
                    obj.set(key, Value::from(value));
                }
                Value::Object(obj)
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Object> for Value {
    fn from(obj: Object) -> Self {
        Value::Object(obj)
    }
}

impl From<Function> for Value {
    fn from(f: Function) -> Self {
        Value::Function(f)
    }
}

// ============================================================================
// Realm
// ============================================================================

/// Current bindings of the native communication primitives.
#[derive(Clone)]
pub struct Primitives {
    pub websocket: Arc<dyn SocketFactory>,
    pub fetch: Arc<dyn Fetch>,
    pub xhr: Arc<dyn HttpRequestFactory>,
}

impl Primitives {
    /// tokio-tungstenite sockets and reqwest-backed fetch/XHR.
    pub fn native() -> Result<Self, InterceptError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("astra/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            websocket: Arc::new(NativeSocketFactory::new()),
            fetch: Arc::new(NativeFetch::with_client(client.clone())),
            xhr: Arc::new(NativeHttpRequestFactory::with_client(client)),
        })
    }
}

/// The instrumented context: a global object plus primitive bindings.
///
/// Page code looks primitives up through the realm on every use, so swapping
/// a binding (as capture adapters do) is seen by all later callers.
pub struct Realm {
    global: Object,
    primitives: RwLock<Primitives>,
}

impl Realm {
    pub fn new(primitives: Primitives) -> Self {
        Self {
            global: Object::new(),
            primitives: RwLock::new(primitives),
        }
    }

    pub fn native() -> Result<Self, InterceptError> {
        Ok(Self::new(Primitives::native()?))
    }

    pub fn global(&self) -> &Object {
        &self.global
    }

    fn bindings(&self) -> RwLockReadGuard<'_, Primitives> {
        self.primitives.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn websocket(&self) -> Arc<dyn SocketFactory> {
        self.bindings().websocket.clone()
    }

    pub fn fetch(&self) -> Arc<dyn Fetch> {
        self.bindings().fetch.clone()
    }

    pub fn xhr(&self) -> Arc<dyn HttpRequestFactory> {
        self.bindings().xhr.clone()
    }

    pub fn primitives(&self) -> Primitives {
        self.bindings().clone()
    }

    /// Install new bindings, returning the previous ones.
    pub fn replace_primitives(&self, primitives: Primitives) -> Primitives {
        let mut guard = self
            .primitives
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, primitives)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_object_identity() {
        let a = Object::new();
        let b = a.clone();
        b.set("x", 1);
        assert_eq!(a.get("x"), Some(Value::Number(1.0)));
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&Object::new()));
    }

    #[test]
    fn test_function_call_and_identity() {
        let f = Function::new("double", |_, args| {
            let n = args.first().and_then(Value::as_f64).unwrap_or(0.0);
            Ok(Value::Number(n * 2.0))
        });
        assert_eq!(
            f.call(&Value::Undefined, &[Value::from(21)]).unwrap(),
            Value::Number(42.0)
        );
        assert!(f.ptr_eq(&f.clone()));
        assert_eq!(f.name(), "double");
        assert_eq!(Function::new("", |_, _| Ok(Value::Null)).name(), "<anonymous>");
    }

    #[test]
    fn test_exception_stack_reflects_call_frames() {
        let inner = Function::new("inner", |_, _| Err(Exception::new("boom")));
        let outer = {
            let inner = inner.clone();
            Function::new("outer", move |this, _| inner.call(this, &[]))
        };

        let err = outer.call(&Value::Undefined, &[]).unwrap_err();
        assert_eq!(err.message, "boom");
        assert_eq!(err.stack, "Error: boom\n    at inner\n    at outer");
        assert!(capture_stack().is_empty());
    }

    #[test]
    fn test_json_conversion_follows_stringify_rules() {
        let obj = Object::new();
        obj.set("n", 42);
        obj.set("half", 0.5);
        obj.set("skip", Function::new("f", |_, _| Ok(Value::Undefined)));
        obj.set("undef", Value::Undefined);
        obj.set(
            "list",
            vec![Value::Undefined, Value::from("a"), Value::Number(f64::NAN)],
        );

        assert_eq!(
            Value::Object(obj).to_json(),
            json!({"n": 42, "half": 0.5, "list": [null, "a", null]})
        );
        assert_eq!(Value::Undefined.to_json_opt(), None);
    }

    #[test]
    fn test_json_cycle_is_cut() {
        let obj = Object::new();
        obj.set("me", obj.clone());
        let json = Value::Object(obj.clone()).to_json();
        assert_eq!(json, json!({"me": null}));
        obj.remove("me");
    }

    #[test]
    fn test_json_many_self_references_finish() {
        let global = Object::new();
        global.set("window", global.clone());
        global.set("self", global.clone());
        global.set("globalThis", global.clone());
        global.set("title", "page");
        let nested = Object::new();
        nested.set("owner", global.clone());
        global.set("doc", nested.clone());

        let value = Value::Object(global.clone());
        assert_eq!(
            value.to_json(),
            json!({"window": null, "self": null, "globalThis": null, "title": "page", "doc": {"owner": null}})
        );
        let err = value.try_to_json().unwrap_err();
        assert!(err.message.contains("circular"));

        for key in ["window", "self", "globalThis", "doc"] {
            global.remove(key);
        }
    }

    #[test]
    fn test_json_shared_object_is_not_a_cycle() {
        let shared = Object::new();
        shared.set("v", 1);
        let root = Object::new();
        root.set("a", shared.clone());
        root.set("b", vec![Value::from(shared.clone()), Value::from(shared)]);
        assert_eq!(
            Value::Object(root).try_to_json().unwrap(),
            Some(json!({"a": {"v": 1}, "b": [{"v": 1}, {"v": 1}]}))
        );
    }

    #[test]
    fn test_value_from_json() {
        let value = Value::from(json!({"a": [1, "two", null], "b": true}));
        let obj = value.as_object().unwrap();
        assert_eq!(obj.get("b"), Some(Value::Bool(true)));
        assert_eq!(
            obj.get("a"),
            Some(Value::Array(vec![
                Value::Number(1.0),
                Value::from("two"),
                Value::Null
            ]))
        );
    }
}
