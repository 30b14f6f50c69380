//! Script classes backing native entities.
//!
//! - [`BlockFunction`] wraps one [`NativeFunction`]; calling it from a script
//!   converts the arguments, runs the closure and converts the result back.
//! - [`ObjectWrapper`] (`NativeObject` in scripts) wraps a [`NativeObject`];
//!   attribute access yields a `BlockFunction` per method-table entry.
//! - [`ScriptPoint`] (`Point` in scripts) carries a 2D point.
//!
//! Each class's type object is built by pyo3 the first time an instance is
//! created (or the type is requested) and is shared by every instance and
//! every context for the rest of the process; nothing mutates it afterwards.
//! The per-instance data (closure, object reference, owner) lives in the
//! instance itself.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use log::warn;
use pyo3::exceptions::{PyAttributeError, PyException};
use pyo3::prelude::*;
use pyo3::types::PyTuple;

use crate::convert::Converter;
use crate::error::{set_last_error, BridgeError, BridgeResult};
use crate::value::{NativeFunction, NativeObject, Point, Value};

pyo3::create_exception!(
    scrybridge,
    NativeError,
    PyException,
    "Raised in scripts when a native function fails."
);

/// Shared on/off flag tying wrappers to the context that created them.
#[derive(Clone)]
pub(crate) struct Liveness(Rc<Cell<bool>>);

impl Liveness {
    pub(crate) fn new() -> Self {
        Liveness(Rc::new(Cell::new(true)))
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.0.get()
    }

    pub(crate) fn revoke(&self) {
        self.0.set(false);
    }
}

impl fmt::Debug for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Liveness({})", self.is_alive())
    }
}

// ==================== BlockFunction ====================

#[pyclass(name = "BlockFunction", module = "scrybridge", unsendable)]
pub struct BlockFunction {
    function: NativeFunction,
    converter: Converter,
}

impl BlockFunction {
    pub(crate) fn new(function: NativeFunction, converter: Converter) -> Self {
        BlockFunction {
            function,
            converter,
        }
    }

    pub fn function(&self) -> &NativeFunction {
        &self.function
    }
}

#[pymethods]
impl BlockFunction {
    #[pyo3(signature = (*args))]
    fn __call__(&self, args: &Bound<'_, PyTuple>) -> PyResult<PyObject> {
        let py = args.py();
        let function = self.function.clone();
        let converter = self.converter.clone();
        match call_native(py, &function, &converter, args) {
            Ok(result) => Ok(result.unbind()),
            Err(err) => {
                warn!("native function failed: {err}");
                let message = err.to_string();
                set_last_error(err);
                Err(NativeError::new_err(message))
            }
        }
    }

    fn __repr__(&self) -> String {
        format!("<BlockFunction {:?}>", self.function)
    }
}

fn call_native<'py>(
    py: Python<'py>,
    function: &NativeFunction,
    converter: &Converter,
    args: &Bound<'py, PyTuple>,
) -> BridgeResult<Bound<'py, PyAny>> {
    if !converter.is_live() {
        return Err(BridgeError::ContextNotActive);
    }
    let params = args
        .iter()
        .map(|arg| converter.to_native(&arg))
        .collect::<BridgeResult<Vec<Value>>>()?;
    let result = function.call(&params)?;
    converter.to_script(py, &result)
}

// ==================== NativeObject ====================

#[pyclass(name = "NativeObject", module = "scrybridge", unsendable)]
pub struct ObjectWrapper {
    object: NativeObject,
    converter: Converter,
}

impl ObjectWrapper {
    pub(crate) fn new(object: NativeObject, converter: Converter) -> Self {
        ObjectWrapper { object, converter }
    }

    pub fn object(&self) -> &NativeObject {
        &self.object
    }
}

#[pymethods]
impl ObjectWrapper {
    /// Known methods resolve to a fresh `BlockFunction`. Unknown names
    /// resolve to `None` so scripts can probe for optional methods; dunder
    /// names stay an `AttributeError` so Python's own protocol probes behave.
    fn __getattr__(&self, py: Python<'_>, name: &str) -> PyResult<PyObject> {
        if let Some(function) = self.object.methods().get(name) {
            let block = BlockFunction::new(function.clone(), self.converter.clone());
            return Ok(Bound::new(py, block)?.into_any().unbind());
        }
        if name.starts_with("__") && name.ends_with("__") {
            return Err(PyAttributeError::new_err(name.to_owned()));
        }
        Ok(py.None())
    }

    fn __dir__(&self) -> Vec<String> {
        self.object.methods().names()
    }

    fn __repr__(&self) -> String {
        format!("<NativeObject methods={:?}>", self.object.methods().names())
    }
}

// ==================== Point ====================

#[pyclass(name = "Point", module = "scrybridge")]
#[derive(Debug, Clone, Copy)]
pub struct ScriptPoint {
    #[pyo3(get, set)]
    pub x: f64,
    #[pyo3(get, set)]
    pub y: f64,
}

#[pymethods]
impl ScriptPoint {
    #[new]
    #[pyo3(signature = (x = 0.0, y = 0.0))]
    fn py_new(x: f64, y: f64) -> Self {
        ScriptPoint { x, y }
    }

    fn __eq__(&self, other: &Bound<'_, PyAny>) -> bool {
        match other.downcast::<ScriptPoint>() {
            Ok(other) => {
                let other = other.borrow();
                self.x == other.x && self.y == other.y
            }
            Err(_) => false,
        }
    }

    fn __repr__(&self) -> String {
        format!("Point({}, {})", self.x, self.y)
    }
}

impl From<Point> for ScriptPoint {
    fn from(p: Point) -> Self {
        ScriptPoint { x: p.x, y: p.y }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{clear_last_error, last_error};
    use crate::value::FunctionTable;

    fn with_py<R>(f: impl FnOnce(Python<'_>) -> R) -> R {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(f)
    }

    fn adder() -> NativeFunction {
        NativeFunction::new(|params| {
            let total: i64 = params.iter().filter_map(Value::as_i64).sum();
            Ok(Value::Int(total))
        })
    }

    #[test]
    fn block_function_is_callable_from_script() {
        with_py(|py| {
            let block = Bound::new(py, BlockFunction::new(adder(), Converter::new())).unwrap();
            let result = block.call1((1, 2, 3)).unwrap();
            assert_eq!(result.extract::<i64>().unwrap(), 6);
        });
    }

    #[test]
    fn failing_closure_raises_native_error_and_records_it() {
        with_py(|py| {
            clear_last_error();
            let failing = NativeFunction::new(|_| Err(BridgeError::native("disk on fire")));
            let block = Bound::new(py, BlockFunction::new(failing, Converter::new())).unwrap();
            let err = block.call0().unwrap_err();
            assert!(err.is_instance_of::<NativeError>(py));
            assert_eq!(last_error(), Some(BridgeError::Native("disk on fire".into())));
        });
    }

    #[test]
    fn revoked_owner_blocks_calls() {
        with_py(|py| {
            clear_last_error();
            let owner = Liveness::new();
            let block =
                Bound::new(py, BlockFunction::new(adder(), Converter::owned_by(owner.clone())))
                    .unwrap();
            assert!(block.call0().is_ok());
            owner.revoke();
            assert!(block.call0().is_err());
            assert_eq!(last_error(), Some(BridgeError::ContextNotActive));
        });
    }

    #[test]
    fn object_wrapper_exposes_methods_and_none_for_unknown() {
        with_py(|py| {
            let methods = FunctionTable::new().with("greet", |params| {
                let name = params.first().and_then(Value::as_str).unwrap_or("world");
                Ok(Value::from(format!("hello, {name}")))
            });
            let object = NativeObject::new(Rc::new(()), methods);
            let wrapper = Bound::new(py, ObjectWrapper::new(object, Converter::new())).unwrap();

            let greeting = wrapper.call_method1("greet", ("ada",)).unwrap();
            assert_eq!(greeting.extract::<String>().unwrap(), "hello, ada");

            assert!(wrapper.getattr("missing").unwrap().is_none());
            assert!(wrapper.getattr("__missing__").is_err());
        });
    }

    #[test]
    fn point_class_constructs_and_compares() {
        with_py(|py| {
            let a = Bound::new(py, ScriptPoint::from(Point::new(1.0, 2.0))).unwrap();
            let b = Bound::new(py, ScriptPoint::from(Point::new(1.0, 2.0))).unwrap();
            assert!(a.eq(&b).unwrap());
            assert_eq!(a.repr().unwrap().to_string(), "Point(1, 2)");
        });
    }
}
