//! Value conversion between native [`Value`]s and Python objects.
//!
//! | native            | script                          |
//! |-------------------|---------------------------------|
//! | `Null`            | `None`                          |
//! | `Bool`            | `bool`                          |
//! | `Int` / `Float`   | `int` / `float`                 |
//! | `String`          | `str`                           |
//! | `Array`           | `list` (tuples come back too)   |
//! | `Map`             | `dict` with `str` keys          |
//! | `Point`           | `Point(x, y)`                   |
//! | `Object`          | `NativeObject` wrapper          |
//! | `Function`        | `BlockFunction` wrapper         |
//!
//! Python has a single absence sentinel, so `None` and `Null` map onto each
//! other; anything a script reports as "no value" comes back as `Null`.
//!
//! Failures from the interpreter's own introspection never escape as a
//! `PyErr`: they are reported as [`BridgeError::ConversionFailed`].

use std::collections::HashMap;

use pyo3::prelude::*;
use pyo3::types::*;

use crate::error::{BridgeError, BridgeResult};
use crate::value::{Point, Value};
use crate::wrapper::{BlockFunction, Liveness, ObjectWrapper, ScriptPoint};

/// Containers nested deeper than this fail to convert. Guards against
/// self-referential lists and dicts on the script side.
pub const MAX_DEPTH: usize = 128;

/// Converts values in both directions.
///
/// A converter is stateless apart from the owner it stamps on the wrappers
/// it creates: wrappers made on behalf of a context stop working once that
/// context is disposed.
#[derive(Debug, Clone, Default)]
pub struct Converter {
    owner: Option<Liveness>,
}

impl Converter {
    /// A converter whose wrappers are not tied to any context.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn owned_by(owner: Liveness) -> Self {
        Converter { owner: Some(owner) }
    }

    /// False once the owning context has been disposed.
    pub(crate) fn is_live(&self) -> bool {
        self.owner.as_ref().map_or(true, Liveness::is_alive)
    }

    // ==================== Native → Script ====================

    pub fn to_script<'py>(&self, py: Python<'py>, value: &Value) -> BridgeResult<Bound<'py, PyAny>> {
        self.to_script_at(py, value, 0)
    }

    fn to_script_at<'py>(
        &self,
        py: Python<'py>,
        value: &Value,
        depth: usize,
    ) -> BridgeResult<Bound<'py, PyAny>> {
        if depth > MAX_DEPTH {
            return Err(too_deep());
        }
        let obj = match value {
            Value::Null => py.None().into_bound(py),
            Value::Bool(b) => PyBool::new(py, *b).to_owned().into_any(),
            Value::Int(i) => i
                .into_pyobject(py)
                .map_err(|e| BridgeError::ConversionFailed(format!("into_pyobject: {e}")))?
                .into_any(),
            Value::Float(f) => PyFloat::new(py, *f).into_any(),
            Value::String(s) => PyString::new(py, s).into_any(),
            Value::Array(items) => {
                let items = items
                    .iter()
                    .map(|item| self.to_script_at(py, item, depth + 1))
                    .collect::<BridgeResult<Vec<_>>>()?;
                PyList::new(py, items).map_err(failed)?.into_any()
            }
            Value::Map(map) => {
                let dict = PyDict::new(py);
                for (key, item) in map {
                    let item = self.to_script_at(py, item, depth + 1)?;
                    dict.set_item(key, item).map_err(failed)?;
                }
                dict.into_any()
            }
            Value::Point(p) => Bound::new(py, ScriptPoint::from(*p))
                .map_err(failed)?
                .into_any(),
            Value::Object(object) => Bound::new(py, ObjectWrapper::new(object.clone(), self.clone()))
                .map_err(failed)?
                .into_any(),
            Value::Function(function) => {
                Bound::new(py, BlockFunction::new(function.clone(), self.clone()))
                    .map_err(failed)?
                    .into_any()
            }
            Value::Opaque(opaque) => {
                return Err(BridgeError::UnsupportedValueKind(opaque.type_name().to_owned()))
            }
        };
        Ok(obj)
    }

    /// Convert a parameter list into an argument tuple.
    pub fn to_script_args<'py>(
        &self,
        py: Python<'py>,
        params: &[Value],
    ) -> BridgeResult<Bound<'py, PyTuple>> {
        let items = params
            .iter()
            .map(|param| self.to_script(py, param))
            .collect::<BridgeResult<Vec<_>>>()?;
        PyTuple::new(py, items).map_err(failed)
    }

    // ==================== Script → Native ====================

    pub fn to_native(&self, value: &Bound<'_, PyAny>) -> BridgeResult<Value> {
        self.to_native_at(value, 0)
    }

    fn to_native_at(&self, value: &Bound<'_, PyAny>, depth: usize) -> BridgeResult<Value> {
        if depth > MAX_DEPTH {
            return Err(too_deep());
        }
        if value.is_none() {
            return Ok(Value::Null);
        }
        // bool is a subclass of int: test it first.
        if let Ok(b) = value.downcast::<PyBool>() {
            return Ok(Value::Bool(b.is_true()));
        }
        if value.is_instance_of::<PyInt>() {
            return match value.extract::<i64>() {
                Ok(i) => Ok(Value::Int(i)),
                Err(_) => value.extract::<f64>().map(Value::Float).map_err(failed),
            };
        }
        if value.is_instance_of::<PyFloat>() {
            return value.extract::<f64>().map(Value::Float).map_err(failed);
        }
        if value.is_instance_of::<PyString>() {
            return value.extract::<String>().map(Value::String).map_err(failed);
        }
        if let Ok(point) = value.downcast::<ScriptPoint>() {
            let point = point.borrow();
            return Ok(Value::Point(Point::new(point.x, point.y)));
        }
        if let Ok(block) = value.downcast::<BlockFunction>() {
            return Ok(Value::Function(block.borrow().function().clone()));
        }
        if let Ok(wrapper) = value.downcast::<ObjectWrapper>() {
            return Ok(Value::Object(wrapper.borrow().object().clone()));
        }
        if let Ok(list) = value.downcast::<PyList>() {
            return list
                .iter()
                .map(|item| self.to_native_at(&item, depth + 1))
                .collect::<BridgeResult<Vec<_>>>()
                .map(Value::Array);
        }
        if let Ok(tuple) = value.downcast::<PyTuple>() {
            return tuple
                .iter()
                .map(|item| self.to_native_at(&item, depth + 1))
                .collect::<BridgeResult<Vec<_>>>()
                .map(Value::Array);
        }
        if let Ok(dict) = value.downcast::<PyDict>() {
            let mut map = HashMap::with_capacity(dict.len());
            for (key, item) in dict.iter() {
                let key = key.extract::<String>().map_err(|_| {
                    BridgeError::ConversionFailed(format!(
                        "mapping key of type {} is not a string",
                        type_name(&key)
                    ))
                })?;
                map.insert(key, self.to_native_at(&item, depth + 1)?);
            }
            return Ok(Value::Map(map));
        }
        Err(BridgeError::ConversionFailed(format!(
            "no native representation for script value of type {}",
            type_name(value)
        )))
    }

    /// Read a point from any script value exposing numeric `x` and `y`,
    /// either as attributes or as mapping keys.
    pub fn to_point(&self, value: &Bound<'_, PyAny>) -> BridgeResult<Point> {
        if let Ok(point) = value.downcast::<ScriptPoint>() {
            let point = point.borrow();
            return Ok(Point::new(point.x, point.y));
        }
        let x = point_field(value, "x")?;
        let y = point_field(value, "y")?;
        Ok(Point::new(x, y))
    }
}

/// Convert with a detached [`Converter`].
pub fn to_script<'py>(py: Python<'py>, value: &Value) -> BridgeResult<Bound<'py, PyAny>> {
    Converter::new().to_script(py, value)
}

/// Convert with a detached [`Converter`].
pub fn to_native(value: &Bound<'_, PyAny>) -> BridgeResult<Value> {
    Converter::new().to_native(value)
}

fn point_field(value: &Bound<'_, PyAny>, field: &str) -> BridgeResult<f64> {
    let raw = match value.downcast::<PyDict>() {
        Ok(dict) => dict.get_item(field).ok().flatten(),
        Err(_) => value.getattr(field).ok(),
    };
    let raw = raw.ok_or_else(|| BridgeError::MalformedPointValue(format!("missing field '{field}'")))?;
    if raw.is_instance_of::<PyBool>() {
        return Err(BridgeError::MalformedPointValue(format!(
            "field '{field}' is not numeric"
        )));
    }
    raw.extract::<f64>().map_err(|_| {
        BridgeError::MalformedPointValue(format!(
            "field '{field}' is not numeric (got {})",
            type_name(&raw)
        ))
    })
}

/// Best-effort name of a script value's type, for diagnostics.
pub(crate) fn type_name(value: &Bound<'_, PyAny>) -> String {
    value
        .get_type()
        .getattr("__name__")
        .and_then(|name| name.extract::<String>())
        .unwrap_or_else(|_| "<unknown>".to_string())
}

fn failed(err: PyErr) -> BridgeError {
    BridgeError::ConversionFailed(err.to_string())
}

fn too_deep() -> BridgeError {
    BridgeError::ConversionFailed(format!("value nesting exceeds {MAX_DEPTH} levels"))
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::value::{FunctionTable, NativeFunction, NativeObject, Opaque};

    fn with_py<R>(f: impl FnOnce(Python<'_>) -> R) -> R {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(f)
    }

    fn round_trip(value: &Value) -> Value {
        with_py(|py| {
            let converter = Converter::new();
            let script = converter.to_script(py, value).expect("to_script");
            converter.to_native(&script).expect("to_native")
        })
    }

    #[test]
    fn plain_data_round_trips() {
        let samples = vec![
            Value::Null,
            Value::Bool(true),
            Value::Bool(false),
            Value::Int(-42),
            Value::Int(i64::MAX),
            Value::Float(2.5),
            Value::from("héllo wörld ✓"),
            Value::from(""),
            Value::Point(Point::new(3.0, -4.5)),
        ];
        for value in samples {
            assert_eq!(round_trip(&value), value);
        }
    }

    #[test]
    fn nested_containers_round_trip() {
        let inner: Value = HashMap::from([
            ("name".to_string(), Value::from("inner")),
            ("points".to_string(), Value::from(vec![Point::new(1.0, 2.0)])),
        ])
        .into();
        let value: Value = HashMap::from([
            ("list".to_string(), Value::from(vec![Value::Int(1), Value::Null, inner])),
            ("flag".to_string(), Value::Bool(false)),
            ("empty".to_string(), Value::Map(HashMap::new())),
        ])
        .into();

        let back = round_trip(&value);
        assert_eq!(back, value);
        let map = back.as_map().expect("map");
        assert_eq!(map.len(), 3);
        assert_eq!(
            map["list"].as_array().map(|items| items.len()),
            Some(3),
            "sequence order and length preserved"
        );
    }

    #[test]
    fn script_values_convert_to_native() {
        with_py(|py| {
            let value = py
                .eval(c"{'a': (1, 2.0), 'b': None, 'c': [True, 'x']}", None, None)
                .unwrap();
            let native = to_native(&value).unwrap();
            let expected: Value = HashMap::from([
                ("a".to_string(), Value::from(vec![Value::Int(1), Value::Float(2.0)])),
                ("b".to_string(), Value::Null),
                ("c".to_string(), Value::from(vec![Value::Bool(true), Value::from("x")])),
            ])
            .into();
            assert_eq!(native, expected);
        });
    }

    #[test]
    fn huge_ints_become_floats() {
        with_py(|py| {
            let value = py.eval(c"2 ** 70", None, None).unwrap();
            assert_eq!(to_native(&value).unwrap(), Value::Float(2f64.powi(70)));
        });
    }

    #[test]
    fn unsupported_kinds_fail_cleanly() {
        with_py(|py| {
            let opaque = Value::Opaque(Opaque::new(17u8));
            assert!(matches!(
                to_script(py, &opaque),
                Err(BridgeError::UnsupportedValueKind(_))
            ));

            let set = py.eval(c"{1, 2}", None, None).unwrap();
            assert!(matches!(to_native(&set), Err(BridgeError::ConversionFailed(_))));

            let dict = py.eval(c"{1: 'one'}", None, None).unwrap();
            assert!(matches!(to_native(&dict), Err(BridgeError::ConversionFailed(_))));
        });
    }

    #[test]
    fn self_referential_list_fails_instead_of_overflowing() {
        with_py(|py| {
            let list = PyList::empty(py);
            list.append(&list).unwrap();
            assert!(matches!(
                to_native(list.as_any()),
                Err(BridgeError::ConversionFailed(_))
            ));
        });
    }

    #[test]
    fn points_are_read_from_any_xy_shape() {
        with_py(|py| {
            let converter = Converter::new();
            let dict = py.eval(c"{'x': 1, 'y': 2.5}", None, None).unwrap();
            assert_eq!(converter.to_point(&dict).unwrap(), Point::new(1.0, 2.5));

            let missing = py.eval(c"{'x': 1}", None, None).unwrap();
            assert_eq!(
                converter.to_point(&missing),
                Err(BridgeError::MalformedPointValue("missing field 'y'".into()))
            );

            let wrong = py.eval(c"{'x': 'a', 'y': 1}", None, None).unwrap();
            assert!(matches!(
                converter.to_point(&wrong),
                Err(BridgeError::MalformedPointValue(_))
            ));
        });
    }

    #[test]
    fn wrappers_return_the_same_native_reference() {
        let function = NativeFunction::new(|params| Ok(Value::Int(params.len() as i64)));
        let object = NativeObject::new(Rc::new(5u32), FunctionTable::new());

        let back = round_trip(&Value::Function(function.clone()));
        assert!(matches!(&back, Value::Function(f) if f.ptr_eq(&function)));

        let back = round_trip(&Value::Object(object.clone()));
        assert!(matches!(&back, Value::Object(o) if o.ptr_eq(&object)));
    }
}
