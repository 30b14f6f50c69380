//! Opaque handles to values living in a context's script runtime.

use std::fmt;

use pyo3::prelude::*;
use pyo3::types::*;

use crate::context::{member, WeakContext};
use crate::error::{BridgeError, BridgeResult};
use crate::value::Value;
use crate::wrapper::{ObjectWrapper, ScriptPoint};

/// Coarse type tag of a script value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptKind {
    Null,
    Bool,
    Number,
    String,
    Sequence,
    Mapping,
    Point,
    NativeObject,
    Function,
    Object,
}

/// A script value owned by a context.
///
/// The handle does not keep its context alive. Once the context is disposed
/// or dropped every operation fails with [`BridgeError::ContextNotActive`].
pub struct ScriptValue {
    object: Py<PyAny>,
    context: WeakContext,
}

impl ScriptValue {
    pub(crate) fn new(object: Py<PyAny>, context: WeakContext) -> Self {
        ScriptValue { object, context }
    }

    pub(crate) fn bind<'a, 'py>(&'a self, py: Python<'py>) -> &'a Bound<'py, PyAny> {
        self.object.bind(py)
    }

    pub fn kind(&self) -> BridgeResult<ScriptKind> {
        self.context.upgrade_active()?;
        Ok(Python::with_gil(|py| kind_of(self.bind(py))))
    }

    pub fn is_callable(&self) -> BridgeResult<bool> {
        self.context.upgrade_active()?;
        Ok(Python::with_gil(|py| self.bind(py).is_callable()))
    }

    /// Property (or mapping entry) `name`. Missing properties yield a
    /// handle to `None`.
    pub fn get(&self, name: &str) -> BridgeResult<ScriptValue> {
        self.context.upgrade_active()?;
        Python::with_gil(|py| {
            let found = member(self.bind(py), name)
                .map(Bound::unbind)
                .unwrap_or_else(|| py.None());
            Ok(ScriptValue::new(found, self.context.clone()))
        })
    }

    pub fn set(&self, name: &str, value: impl Into<Value>) -> BridgeResult<()> {
        let context = self.context.upgrade_active()?;
        let value = value.into();
        Python::with_gil(|py| {
            let target = self.bind(py);
            let value = context.converter().to_script(py, &value)?;
            let result = match target.downcast::<PyDict>() {
                Ok(dict) => dict.set_item(name, value),
                Err(_) => target.setattr(name, value),
            };
            result.map_err(|e| BridgeError::from_script(py, e))
        })
    }

    /// Call this value as a function.
    pub fn call(&self, params: &[Value]) -> BridgeResult<Value> {
        let context = self.context.upgrade_active()?;
        Python::with_gil(|py| {
            let function = self.bind(py);
            if !function.is_callable() {
                return Err(BridgeError::FunctionNotFound(format!(
                    "value of type {} is not callable",
                    crate::convert::type_name(function)
                )));
            }
            context.invoke(py, function, None, params)
        })
    }

    pub fn to_native(&self) -> BridgeResult<Value> {
        let context = self.context.upgrade_active()?;
        Python::with_gil(|py| context.converter().to_native(self.bind(py)))
    }

    /// Whether both handles refer to the same script object.
    pub fn is_same(&self, other: &ScriptValue) -> bool {
        self.object.as_ptr() == other.object.as_ptr()
    }
}

impl Clone for ScriptValue {
    fn clone(&self) -> Self {
        let object = Python::with_gil(|py| self.object.clone_ref(py));
        ScriptValue::new(object, self.context.clone())
    }
}

impl fmt::Debug for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScriptValue({:p})", self.object.as_ptr())
    }
}

fn kind_of(value: &Bound<'_, PyAny>) -> ScriptKind {
    if value.is_none() {
        ScriptKind::Null
    } else if value.is_instance_of::<PyBool>() {
        ScriptKind::Bool
    } else if value.is_instance_of::<PyInt>() || value.is_instance_of::<PyFloat>() {
        ScriptKind::Number
    } else if value.is_instance_of::<PyString>() {
        ScriptKind::String
    } else if value.is_instance_of::<ScriptPoint>() {
        ScriptKind::Point
    } else if value.is_instance_of::<ObjectWrapper>() {
        ScriptKind::NativeObject
    } else if value.is_instance_of::<PyList>() || value.is_instance_of::<PyTuple>() {
        ScriptKind::Sequence
    } else if value.is_instance_of::<PyDict>() {
        ScriptKind::Mapping
    } else if value.is_callable() {
        ScriptKind::Function
    } else {
        ScriptKind::Object
    }
}
