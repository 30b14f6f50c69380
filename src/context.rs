//! Script execution contexts.
//!
//! A [`Context`] owns one global namespace in the embedded interpreter and
//! everything registered into it. Operations follow the same contract:
//!
//! 1. Check the context is `Active` (otherwise `ContextNotActive`)
//! 2. Acquire the GIL
//! 3. Convert inputs, run the script-side operation, convert the result
//! 4. Repackage any Python exception as `ScriptExecution`
//!
//! Contexts are single-threaded: they are neither `Send` nor `Sync`, and
//! re-entrant use from a native closure running inside the same context is
//! fine. Disposing a context from inside one of its own native closures is
//! not supported.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use log::{debug, warn};
use pyo3::prelude::*;
use pyo3::types::*;

use crate::config::ContextConfig;
use crate::convert::Converter;
use crate::error::{clear_last_error, BridgeError, BridgeResult};
use crate::loader::{LoadedScript, ScriptDirectories, ScriptLoader};
use crate::script_value::ScriptValue;
use crate::value::{FunctionTable, NativeFunction, Value};
use crate::wrapper::{BlockFunction, Liveness, NativeError, ScriptPoint};

const PRELUDE: &str = include_str!("prelude.py");

/// Lifecycle of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Uninitialized,
    Active,
    Disposed,
}

/// A function invocation: bare, suite-qualified, receiver-bound, or both.
#[derive(Debug, Clone)]
pub struct Call {
    function: String,
    suite: Option<String>,
    params: Vec<Value>,
    receiver: Option<Value>,
}

impl Call {
    pub fn new(function: impl Into<String>) -> Self {
        Call {
            function: function.into(),
            suite: None,
            params: Vec::new(),
            receiver: None,
        }
    }

    /// Resolve the function as a member of the global object `suite`.
    pub fn in_suite(mut self, suite: impl Into<String>) -> Self {
        self.suite = Some(suite.into());
        self
    }

    pub fn with_params<I, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }

    /// Bind a receiver. Plain script functions get it as their first
    /// parameter (`self`); native wrappers ignore it.
    pub fn on(mut self, receiver: impl Into<Value>) -> Self {
        self.receiver = Some(receiver.into());
        self
    }

    fn qualified_name(&self) -> String {
        match &self.suite {
            Some(suite) => format!("{suite}.{}", self.function),
            None => self.function.clone(),
        }
    }
}

impl From<&str> for Call {
    fn from(function: &str) -> Self {
        Call::new(function)
    }
}

impl From<String> for Call {
    fn from(function: String) -> Self {
        Call::new(function)
    }
}

/// Something registered by name on the global object.
#[derive(Debug, Clone)]
enum Registration {
    Function(NativeFunction),
    Group(FunctionTable),
}

struct Runtime {
    globals: Py<PyDict>,
    registrations: HashMap<String, Registration>,
    properties: HashMap<String, Value>,
}

enum State {
    Uninitialized,
    Active(Runtime),
    Disposed,
}

pub(crate) struct ContextInner {
    config: RefCell<ContextConfig>,
    loader: RefCell<Option<Rc<dyn ScriptLoader>>>,
    state: RefCell<State>,
    liveness: Liveness,
    converter: Converter,
}

/// Non-owning reference to a context.
#[derive(Clone)]
pub(crate) struct WeakContext(Weak<ContextInner>);

impl WeakContext {
    pub(crate) fn upgrade(&self) -> Option<Context> {
        self.0.upgrade().map(|inner| Context { inner })
    }

    /// The context, provided it still exists and is active.
    pub(crate) fn upgrade_active(&self) -> BridgeResult<Rc<ContextInner>> {
        let inner = self.0.upgrade().ok_or(BridgeError::ContextNotActive)?;
        if inner.state() != ContextState::Active {
            return Err(BridgeError::ContextNotActive);
        }
        Ok(inner)
    }
}

impl fmt::Debug for WeakContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WeakContext({:p})", self.0.as_ptr())
    }
}

/// Member `name` of a script value: a key for mappings, an attribute
/// otherwise. `None` counts as absent.
pub(crate) fn member<'py>(target: &Bound<'py, PyAny>, name: &str) -> Option<Bound<'py, PyAny>> {
    let found = match target.downcast::<PyDict>() {
        Ok(dict) => dict.get_item(name).ok().flatten(),
        Err(_) => target.getattr(name).ok(),
    };
    found.filter(|value| !value.is_none())
}

/// Run `source` against `globals` and return the value of its last
/// statement when that statement is an expression, `None` otherwise.
///
/// The source is parsed once; a trailing expression statement is split off
/// and evaluated after the preceding statements have run.
fn run_source<'py>(
    py: Python<'py>,
    globals: &Bound<'py, PyDict>,
    source: &str,
    filename: &str,
) -> PyResult<Bound<'py, PyAny>> {
    let builtins = py.import("builtins")?;
    let ast = py.import("ast")?;
    let module = ast.call_method1("parse", (source, filename, "exec"))?;
    let body = module.getattr("body")?;
    let body = body.downcast::<PyList>()?;

    let tail = match body.len() {
        0 => None,
        n => {
            let last = body.get_item(n - 1)?;
            if last.is_instance(&ast.getattr("Expr")?)? {
                body.del_item(n - 1)?;
                Some(last)
            } else {
                None
            }
        }
    };

    let statements = builtins.call_method1("compile", (&module, filename, "exec"))?;
    builtins.call_method1("exec", (statements, globals))?;

    match tail {
        Some(last) => {
            let expression = ast.call_method1("Expression", (last.getattr("value")?,))?;
            let code = builtins.call_method1("compile", (expression, filename, "eval"))?;
            builtins.call_method1("eval", (code, globals))
        }
        None => Ok(py.None().into_bound(py)),
    }
}

impl ContextInner {
    fn state(&self) -> ContextState {
        match &*self.state.borrow() {
            State::Uninitialized => ContextState::Uninitialized,
            State::Active(_) => ContextState::Active,
            State::Disposed => ContextState::Disposed,
        }
    }

    pub(crate) fn converter(&self) -> &Converter {
        &self.converter
    }

    /// The global namespace. The state borrow is released before returning,
    /// so script code may re-enter the context.
    fn globals<'py>(&self, py: Python<'py>) -> BridgeResult<Bound<'py, PyDict>> {
        match &*self.state.borrow() {
            State::Active(runtime) => Ok(runtime.globals.bind(py).clone()),
            _ => Err(BridgeError::ContextNotActive),
        }
    }

    fn with_runtime<R>(&self, f: impl FnOnce(&mut Runtime) -> R) -> BridgeResult<R> {
        match &mut *self.state.borrow_mut() {
            State::Active(runtime) => Ok(f(runtime)),
            _ => Err(BridgeError::ContextNotActive),
        }
    }

    fn create_runtime(&self, py: Python<'_>) -> BridgeResult<Runtime> {
        let config = self.config.borrow();
        let script_err = |e| BridgeError::from_script(py, e);

        let globals = PyDict::new(py);
        globals
            .set_item("__builtins__", py.import("builtins").map_err(script_err)?)
            .map_err(script_err)?;
        globals.set_item("__name__", "__main__").map_err(script_err)?;
        globals
            .set_item("Point", py.get_type::<ScriptPoint>())
            .map_err(script_err)?;
        globals
            .set_item("NativeError", py.get_type::<NativeError>())
            .map_err(script_err)?;

        if !config.module_paths.is_empty() {
            let path = py
                .import("sys")
                .and_then(|sys| sys.getattr("path"))
                .map_err(script_err)?;
            for dir in config.module_paths.iter().rev() {
                let dir = dir.to_string_lossy();
                if !path.contains(&*dir).map_err(script_err)? {
                    path.call_method1("insert", (0i32, &*dir))
                        .map_err(script_err)?;
                }
            }
        }

        if config.load_prelude {
            run_source(py, &globals, PRELUDE, "<prelude>").map_err(script_err)?;
        }

        Ok(Runtime {
            globals: globals.unbind(),
            registrations: HashMap::new(),
            properties: HashMap::new(),
        })
    }

    /// Call `function` with converted `params`. A receiver is bound as
    /// `self` when `function` is a plain script function.
    pub(crate) fn invoke<'py>(
        &self,
        py: Python<'py>,
        function: &Bound<'py, PyAny>,
        receiver: Option<&Bound<'py, PyAny>>,
        params: &[Value],
    ) -> BridgeResult<Value> {
        let args = self.converter.to_script_args(py, params)?;
        let script_err = |e| BridgeError::from_script(py, e);
        let result = match receiver {
            Some(receiver) if function.is_instance_of::<PyFunction>() => {
                let method_type = py
                    .import("types")
                    .and_then(|types| types.getattr("MethodType"))
                    .map_err(script_err)?;
                let bound = method_type
                    .call1((function, receiver))
                    .map_err(script_err)?;
                bound.call1(args)
            }
            _ => function.call1(args),
        };
        let result = result.map_err(script_err)?;
        self.converter.to_native(&result)
    }

    fn execute(&self, source: &str, filename: &str) -> BridgeResult<Py<PyAny>> {
        Python::with_gil(|py| {
            let globals = self.globals(py)?;
            run_source(py, &globals, source, filename)
                .map(Bound::unbind)
                .map_err(|e| BridgeError::from_script(py, e))
        })
    }

    fn dispose(&self) {
        let previous = std::mem::replace(&mut *self.state.borrow_mut(), State::Disposed);
        self.liveness.revoke();
        if let State::Active(runtime) = previous {
            Python::with_gil(|py| {
                // Break reference cycles through script functions' __globals__.
                runtime.globals.bind(py).clear();
                drop(runtime);
            });
            debug!("context disposed");
        }
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// An independent script execution environment.
///
/// Cloning yields another handle to the same context. The context is torn
/// down by [`Context::dispose`] or when the last handle is dropped.
#[derive(Clone)]
pub struct Context {
    inner: Rc<ContextInner>,
}

impl Context {
    /// A context in the `Uninitialized` state. Call [`Context::initialize`]
    /// before use.
    pub fn new(config: ContextConfig) -> Self {
        let liveness = Liveness::new();
        Context {
            inner: Rc::new(ContextInner {
                config: RefCell::new(config),
                loader: RefCell::new(None),
                state: RefCell::new(State::Uninitialized),
                converter: Converter::owned_by(liveness.clone()),
                liveness,
            }),
        }
    }

    /// A default-configured, active context.
    pub fn create() -> BridgeResult<Self> {
        Self::with_config(ContextConfig::default())
    }

    /// An active context with the given configuration.
    pub fn with_config(config: ContextConfig) -> BridgeResult<Self> {
        let context = Self::new(config);
        context.initialize()?;
        Ok(context)
    }

    /// Create the runtime: `Uninitialized` → `Active`. A no-op when already
    /// active; a disposed context cannot be revived.
    pub fn initialize(&self) -> BridgeResult<()> {
        match self.state() {
            ContextState::Active => return Ok(()),
            ContextState::Disposed => return Err(BridgeError::ContextNotActive),
            ContextState::Uninitialized => {}
        }
        pyo3::prepare_freethreaded_python();
        let runtime = Python::with_gil(|py| self.inner.create_runtime(py))?;
        *self.inner.state.borrow_mut() = State::Active(runtime);
        debug!("context activated");
        Ok(())
    }

    pub fn state(&self) -> ContextState {
        self.inner.state()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ContextState::Active
    }

    /// Tear down the runtime. Every script value, wrapper and association
    /// created under this context stops working.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    pub(crate) fn downgrade(&self) -> WeakContext {
        WeakContext(Rc::downgrade(&self.inner))
    }

    pub fn converter(&self) -> &Converter {
        self.inner.converter()
    }

    // ==================== Registration ====================

    /// Expose `f` as the global function `name`. Replaces any earlier
    /// global of that name.
    pub fn register_function<F>(&self, name: &str, f: F) -> BridgeResult<()>
    where
        F: Fn(&[Value]) -> BridgeResult<Value> + 'static,
    {
        self.register_native_function(name, NativeFunction::new(f))
    }

    pub fn register_native_function(&self, name: &str, function: NativeFunction) -> BridgeResult<()> {
        Python::with_gil(|py| {
            let globals = self.inner.globals(py)?;
            let block = BlockFunction::new(function.clone(), self.inner.converter.clone());
            let block = Bound::new(py, block).map_err(|e| BridgeError::from_script(py, e))?;
            globals
                .set_item(name, block)
                .map_err(|e| BridgeError::from_script(py, e))
        })?;
        self.inner.with_runtime(|runtime| {
            runtime.properties.remove(name);
            runtime
                .registrations
                .insert(name.to_string(), Registration::Function(function));
        })?;
        debug!("registered function '{name}'");
        Ok(())
    }

    /// Expose a group of functions as the global object `group` ("suite"),
    /// one attribute per table entry.
    pub fn register_function_group(&self, group: &str, functions: FunctionTable) -> BridgeResult<()> {
        Python::with_gil(|py| {
            let globals = self.inner.globals(py)?;
            let script_err = |e| BridgeError::from_script(py, e);
            let members = PyDict::new(py);
            for (name, function) in functions.iter() {
                let block = BlockFunction::new(function.clone(), self.inner.converter.clone());
                members
                    .set_item(name, Bound::new(py, block).map_err(script_err)?)
                    .map_err(script_err)?;
            }
            let suite = py
                .import("types")
                .and_then(|types| types.getattr("SimpleNamespace"))
                .and_then(|namespace| namespace.call((), Some(&members)))
                .map_err(script_err)?;
            globals.set_item(group, suite).map_err(script_err)
        })?;
        debug!("registered function group '{group}' ({} functions)", functions.len());
        self.inner.with_runtime(|runtime| {
            runtime.properties.remove(group);
            runtime
                .registrations
                .insert(group.to_string(), Registration::Group(functions));
        })
    }

    /// Set the global `name` to a converted copy of `value`. Maps become
    /// plain script dicts.
    pub fn set_property(&self, name: &str, value: impl Into<Value>) -> BridgeResult<()> {
        let value = value.into();
        Python::with_gil(|py| {
            let globals = self.inner.globals(py)?;
            let converted = self.inner.converter.to_script(py, &value)?;
            globals
                .set_item(name, converted)
                .map_err(|e| BridgeError::from_script(py, e))
        })?;
        self.inner.with_runtime(|runtime| {
            runtime.registrations.remove(name);
            runtime.properties.insert(name.to_string(), value);
        })
    }

    /// Current value of the global `name`; `Null` when absent.
    pub fn property(&self, name: &str) -> BridgeResult<Value> {
        Python::with_gil(|py| {
            let globals = self.inner.globals(py)?;
            match member(globals.as_any(), name) {
                Some(value) => self.inner.converter.to_native(&value),
                None => Ok(Value::Null),
            }
        })
    }

    /// Handle to the global `name` (a handle to `None` when absent).
    pub fn global(&self, name: &str) -> BridgeResult<ScriptValue> {
        Python::with_gil(|py| {
            let globals = self.inner.globals(py)?;
            let value = member(globals.as_any(), name)
                .map(Bound::unbind)
                .unwrap_or_else(|| py.None());
            Ok(ScriptValue::new(value, self.downgrade()))
        })
    }

    /// Remove the global `name`. Returns whether it existed.
    pub fn unregister(&self, name: &str) -> BridgeResult<bool> {
        let existed = Python::with_gil(|py| {
            let globals = self.inner.globals(py)?;
            let script_err = |e| BridgeError::from_script(py, e);
            let existed = globals.contains(name).map_err(script_err)?;
            if existed {
                globals.del_item(name).map_err(script_err)?;
            }
            Ok::<_, BridgeError>(existed)
        })?;
        self.inner.with_runtime(|runtime| {
            runtime.registrations.remove(name);
            runtime.properties.remove(name);
        })?;
        Ok(existed)
    }

    /// Names registered through `register_function` / `register_function_group`.
    pub fn registered_functions(&self) -> BridgeResult<Vec<String>> {
        self.inner.with_runtime(|runtime| {
            let mut names: Vec<String> = runtime.registrations.keys().cloned().collect();
            names.sort();
            names
        })
    }

    /// The native value last stored with `set_property` under `name`, if it
    /// has not been replaced since.
    pub fn registered_property(&self, name: &str) -> BridgeResult<Option<Value>> {
        self.inner
            .with_runtime(|runtime| runtime.properties.get(name).cloned())
    }

    /// The closure registered under `name`, if it is still bound there.
    pub fn registered_function(&self, name: &str) -> BridgeResult<Option<NativeFunction>> {
        self.inner.with_runtime(|runtime| match runtime.registrations.get(name) {
            Some(Registration::Function(function)) => Some(function.clone()),
            _ => None,
        })
    }

    /// The function table behind a registered group.
    pub fn registered_group(&self, group: &str) -> BridgeResult<Option<FunctionTable>> {
        self.inner.with_runtime(|runtime| match runtime.registrations.get(group) {
            Some(Registration::Group(table)) => Some(table.clone()),
            _ => None,
        })
    }

    // ==================== Evaluation ====================

    /// Run `source` against the global namespace and return its value
    /// (`Null` for statements).
    pub fn evaluate(&self, source: &str) -> BridgeResult<Value> {
        self.evaluate_value(source)?.to_native()
    }

    /// Like [`Context::evaluate`] but keeps the result on the script side.
    pub fn evaluate_value(&self, source: &str) -> BridgeResult<ScriptValue> {
        clear_last_error();
        let filename = self.inner.config.borrow().source_name.clone();
        let result = self.inner.execute(source, &filename)?;
        Ok(ScriptValue::new(result, self.downgrade()))
    }

    /// Call a function.
    ///
    /// With a suite, the function is a member of that global; otherwise it
    /// is a global itself (falling back to the interpreter's builtins).
    pub fn call(&self, call: impl Into<Call>) -> BridgeResult<Value> {
        let call = call.into();
        clear_last_error();
        Python::with_gil(|py| {
            let globals = self.inner.globals(py)?;
            let function = self.resolve(py, &globals, &call)?;
            let receiver = call
                .receiver
                .as_ref()
                .map(|receiver| self.inner.converter.to_script(py, receiver))
                .transpose()?;
            self.inner
                .invoke(py, &function, receiver.as_ref(), &call.params)
        })
    }

    /// `call(name)` with parameters, the most common shape.
    pub fn call_function<I, V>(&self, name: &str, params: I) -> BridgeResult<Value>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.call(Call::new(name).with_params(params))
    }

    fn resolve<'py>(
        &self,
        py: Python<'py>,
        globals: &Bound<'py, PyDict>,
        call: &Call,
    ) -> BridgeResult<Bound<'py, PyAny>> {
        let not_found = || BridgeError::FunctionNotFound(call.qualified_name());
        let found = match &call.suite {
            Some(suite) => {
                let suite = member(globals.as_any(), suite).ok_or_else(not_found)?;
                member(&suite, &call.function)
            }
            None => member(globals.as_any(), &call.function).or_else(|| {
                py.import("builtins")
                    .ok()
                    .and_then(|builtins| member(builtins.as_any(), &call.function))
            }),
        };
        found.filter(|f| f.is_callable()).ok_or_else(not_found)
    }

    // ==================== Script Loading ====================

    /// Replace the directory-based loader built from the configuration.
    pub fn set_loader(&self, loader: Rc<dyn ScriptLoader>) {
        *self.inner.loader.borrow_mut() = Some(loader);
    }

    fn loader(&self) -> Rc<dyn ScriptLoader> {
        if let Some(loader) = self.inner.loader.borrow().as_ref() {
            return Rc::clone(loader);
        }
        Rc::new(ScriptDirectories::from_config(&self.inner.config.borrow()))
    }

    pub fn search_prefix(&self) -> Option<String> {
        self.inner.config.borrow().search_prefix.clone()
    }

    pub fn set_search_prefix(&self, prefix: Option<String>) {
        self.inner.config.borrow_mut().search_prefix = prefix;
    }

    fn run_loaded(&self, script: &LoadedScript) -> BridgeResult<Py<PyAny>> {
        debug!("loading script '{}' from {}", script.name, script.path.display());
        let filename = script.path.to_string_lossy();
        self.inner.execute(&script.source, &filename)
    }

    /// Load and run the named script.
    pub fn load_script(&self, name: &str) -> BridgeResult<()> {
        if !self.is_active() {
            return Err(BridgeError::ContextNotActive);
        }
        clear_last_error();
        let script = self.loader().resolve(name)?;
        self.run_loaded(&script).map(drop)
    }

    /// Load and run the named script, returning its value.
    pub fn evaluate_file(&self, name: &str) -> BridgeResult<Value> {
        if !self.is_active() {
            return Err(BridgeError::ContextNotActive);
        }
        clear_last_error();
        let script = self.loader().resolve(name)?;
        let result = self.run_loaded(&script)?;
        Python::with_gil(|py| self.inner.converter.to_native(result.bind(py)))
    }

    /// Load every available script in name order. Keeps going after a
    /// failure and reports the first error; returns the number loaded.
    pub fn load_all_available(&self) -> BridgeResult<usize> {
        if !self.is_active() {
            return Err(BridgeError::ContextNotActive);
        }
        let loader = self.loader();
        let mut loaded = 0;
        let mut first_error = None;
        for name in loader.list_available()? {
            let result = loader
                .resolve(&name)
                .and_then(|script| self.run_loaded(&script));
            match result {
                Ok(_) => loaded += 1,
                Err(err) => {
                    warn!("failed to load script '{name}': {err}");
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(loaded),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("state", &self.state())
            .finish()
    }
}
