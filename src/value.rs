//! The host-side value model.
//!
//! [`Value`] is what native code hands to, and receives from, the script
//! runtime. Plain data (null, booleans, numbers, strings, sequences, maps and
//! points) round-trips through the runtime without changing kind. Native
//! objects and closures are exposed to scripts as wrapper instances and come
//! back as the very same reference.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::error::BridgeResult;

/// A 2D point, exposed to scripts as `Point(x, y)`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Point { x, y }
    }
}

/// Signature of every closure callable from script code.
type NativeFn = dyn Fn(&[Value]) -> BridgeResult<Value>;

/// A native closure that scripts can call.
///
/// Arguments arrive already converted to [`Value`]s; the returned value is
/// converted back for the script. Returning `Err` raises a `NativeError`
/// exception in the script.
#[derive(Clone)]
pub struct NativeFunction(Rc<NativeFn>);

impl NativeFunction {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> BridgeResult<Value> + 'static,
    {
        NativeFunction(Rc::new(f))
    }

    pub fn call(&self, params: &[Value]) -> BridgeResult<Value> {
        (self.0)(params)
    }

    pub fn ptr_eq(&self, other: &NativeFunction) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeFunction({:p})", Rc::as_ptr(&self.0) as *const ())
    }
}

/// Name → closure mapping, used both for native-object method tables and
/// for function groups ("suites").
#[derive(Debug, Clone, Default)]
pub struct FunctionTable {
    entries: HashMap<String, NativeFunction>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[Value]) -> BridgeResult<Value> + 'static,
    {
        self.insert(name, NativeFunction::new(f));
        self
    }

    /// Insert or replace an entry.
    pub fn insert(&mut self, name: impl Into<String>, function: NativeFunction) {
        self.entries.insert(name.into(), function);
    }

    pub fn get(&self, name: &str) -> Option<&NativeFunction> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &NativeFunction)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<S: Into<String>> FromIterator<(S, NativeFunction)> for FunctionTable {
    fn from_iter<I: IntoIterator<Item = (S, NativeFunction)>>(iter: I) -> Self {
        let mut table = FunctionTable::new();
        for (name, function) in iter {
            table.insert(name, function);
        }
        table
    }
}

/// Native types that publish a method table to scripts.
///
/// The returned closures are expected to capture `self` (typically a clone
/// or a `Weak` of the `Rc`) so that calling them acts on this instance.
pub trait Scriptable: Any {
    fn script_methods(self: Rc<Self>) -> FunctionTable;
}

/// A native object reference together with the methods scripts may call.
#[derive(Clone)]
pub struct NativeObject {
    instance: Rc<dyn Any>,
    methods: FunctionTable,
}

impl NativeObject {
    /// Pair an instance with an explicit method table.
    pub fn new(instance: Rc<dyn Any>, methods: FunctionTable) -> Self {
        NativeObject { instance, methods }
    }

    /// Build from a type that publishes its own method table.
    pub fn from_scriptable<T: Scriptable>(instance: Rc<T>) -> Self {
        let methods = Rc::clone(&instance).script_methods();
        NativeObject {
            instance,
            methods,
        }
    }

    pub fn instance(&self) -> &Rc<dyn Any> {
        &self.instance
    }

    /// Typed access to the wrapped instance.
    pub fn downcast<T: Any>(&self) -> Option<Rc<T>> {
        Rc::clone(&self.instance).downcast::<T>().ok()
    }

    pub fn methods(&self) -> &FunctionTable {
        &self.methods
    }

    pub fn ptr_eq(&self, other: &NativeObject) -> bool {
        Rc::ptr_eq(&self.instance, &other.instance)
    }
}

impl fmt::Debug for NativeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeObject")
            .field("instance", &(Rc::as_ptr(&self.instance) as *const ()))
            .field("methods", &self.methods.names())
            .finish()
    }
}

/// A host value with no script representation.
#[derive(Clone)]
pub struct Opaque {
    type_name: &'static str,
    value: Rc<dyn Any>,
}

impl Opaque {
    pub fn new<T: Any>(value: T) -> Self {
        Opaque {
            type_name: std::any::type_name::<T>(),
            value: Rc::new(value),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Opaque({})", self.type_name)
    }
}

/// Kind tag of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    Float,
    String,
    Array,
    Map,
    Point,
    Object,
    Function,
    Opaque,
}

/// A native value crossing the bridge.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Map(HashMap<String, Value>),
    Point(Point),
    Object(NativeObject),
    Function(NativeFunction),
    Opaque(Opaque),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::String(_) => ValueKind::String,
            Value::Array(_) => ValueKind::Array,
            Value::Map(_) => ValueKind::Map,
            Value::Point(_) => ValueKind::Point,
            Value::Object(_) => ValueKind::Object,
            Value::Function(_) => ValueKind::Function,
            Value::Opaque(_) => ValueKind::Opaque,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric value of either number kind.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&HashMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_point(&self) -> Option<Point> {
        match self {
            Value::Point(p) => Some(*p),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&NativeObject> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }
}

/// Structural equality for data kinds; identity for objects, closures and
/// opaque values.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Point(a), Value::Point(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            (Value::Opaque(a), Value::Opaque(b)) => Rc::ptr_eq(&a.value, &b.value),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Point> for Value {
    fn from(v: Point) -> Self {
        Value::Point(v)
    }
}

impl From<NativeObject> for Value {
    fn from(v: NativeObject) -> Self {
        Value::Object(v)
    }
}

impl From<NativeFunction> for Value {
    fn from(v: NativeFunction) -> Self {
        Value::Function(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<HashMap<String, T>> for Value {
    fn from(v: HashMap<String, T>) -> Self {
        Value::Map(v.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}
