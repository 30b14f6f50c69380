//! Association registry: binds a script object (and its owning context) to a
//! native instance.
//!
//! Entries are keyed by `Rc` allocation identity, so the native type needs no
//! extra fields. Each entry keeps a `Weak` to its instance: once the last
//! strong reference goes away the association counts as absent and is purged
//! on the next registry access. Holding the `Weak` also keeps the allocation
//! (not the value) alive, so an address can never be reused while its entry
//! exists.
//!
//! The registry is thread-local: associations hold `Rc`-based handles and a
//! context never leaves the thread that created it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use log::debug;
use pyo3::prelude::*;

use crate::context::{member, Context, WeakContext};
use crate::error::{BridgeError, BridgeResult};
use crate::script_value::ScriptValue;
use crate::value::Value;

thread_local! {
    static REGISTRY: RefCell<HashMap<usize, Entry>> = RefCell::new(HashMap::new());
}

struct Entry {
    alive: Box<dyn Fn() -> bool>,
    association: Association,
}

/// A script object attached to a native instance.
#[derive(Clone, Debug)]
pub struct Association {
    script_object: ScriptValue,
    context: WeakContext,
}

impl Association {
    pub fn script_object(&self) -> &ScriptValue {
        &self.script_object
    }

    /// The owning context, if it still exists. Does not keep it alive.
    pub fn context(&self) -> Option<Context> {
        self.context.upgrade()
    }
}

fn key<T: ?Sized>(instance: &Rc<T>) -> usize {
    Rc::as_ptr(instance) as *const () as usize
}

fn purge(entries: &mut HashMap<usize, Entry>) {
    entries.retain(|_, entry| (entry.alive)());
}

// ==================== Public API ====================

/// Attach `script_object` to `instance`, replacing any earlier association.
///
/// The previous script object is merely released; its lifetime belongs to
/// the script runtime.
pub fn attach<T: ?Sized + 'static>(
    instance: &Rc<T>,
    script_object: &ScriptValue,
    context: &Context,
) -> BridgeResult<()> {
    if !context.is_active() {
        return Err(BridgeError::ContextNotActive);
    }
    let weak: Weak<T> = Rc::downgrade(instance);
    let entry = Entry {
        alive: Box::new(move || weak.strong_count() > 0),
        association: Association {
            script_object: script_object.clone(),
            context: context.downgrade(),
        },
    };
    let replaced = REGISTRY.with(|cell| {
        let mut entries = cell.borrow_mut();
        purge(&mut entries);
        entries.insert(key(instance), entry)
    });
    // Dropped outside the registry borrow.
    if replaced.is_some() {
        debug!("replaced script object association for {:#x}", key(instance));
    }
    Ok(())
}

/// The association for `instance`, if any.
pub fn lookup<T: ?Sized>(instance: &Rc<T>) -> Option<Association> {
    REGISTRY.with(|cell| {
        let entries = cell.borrow();
        entries
            .get(&key(instance))
            .filter(|entry| (entry.alive)())
            .map(|entry| entry.association.clone())
    })
}

/// Remove the association for `instance`. Returns whether one existed.
pub fn detach<T: ?Sized>(instance: &Rc<T>) -> bool {
    let removed = REGISTRY.with(|cell| cell.borrow_mut().remove(&key(instance)));
    removed.is_some()
}

/// Call `method` on the script object associated with `instance`.
///
/// The method is looked up as an attribute of the script object (or as a key
/// when the script object is a mapping) and called with the script object as
/// its receiver: methods of class instances are already bound, plain
/// functions stored on the object get it as `self`.
pub fn invoke_on_self<T: ?Sized>(
    instance: &Rc<T>,
    method: &str,
    params: &[Value],
) -> BridgeResult<Value> {
    let association = lookup(instance).ok_or(BridgeError::NoAssociatedScriptObject)?;
    let context = association.context.upgrade_active()?;
    Python::with_gil(|py| {
        let target = association.script_object.bind(py);
        let function = member(target, method)
            .filter(|f| f.is_callable())
            .ok_or_else(|| BridgeError::MethodNotFound(method.to_owned()))?;
        context.invoke(py, &function, Some(target), params)
    })
}

/// Number of live associations on this thread (for diagnostics).
pub fn len() -> usize {
    REGISTRY.with(|cell| {
        let mut entries = cell.borrow_mut();
        purge(&mut entries);
        entries.len()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Widget;

    #[test]
    fn lookup_without_attach_is_absent() {
        let widget = Rc::new(Widget);
        assert!(lookup(&widget).is_none());
        assert_eq!(
            invoke_on_self(&widget, "anything", &[]),
            Err(BridgeError::NoAssociatedScriptObject)
        );
    }

    #[test]
    fn attach_requires_active_context() {
        let context = Context::new(Default::default());
        let widget = Rc::new(Widget);
        let created = Context::create().unwrap();
        let script_object = created.evaluate_value("object()").unwrap();
        assert_eq!(
            attach(&widget, &script_object, &context),
            Err(BridgeError::ContextNotActive)
        );
    }

    #[test]
    fn association_ends_with_the_instance() {
        let context = Context::create().unwrap();
        let script_object = context.evaluate_value("{'n': 1}").unwrap();
        let widget = Rc::new(Widget);
        attach(&widget, &script_object, &context).unwrap();
        assert!(lookup(&widget).is_some());

        let before = len();
        drop(widget);
        assert_eq!(len(), before - 1);
    }

    #[test]
    fn detach_removes_association() {
        let context = Context::create().unwrap();
        let script_object = context.evaluate_value("[]").unwrap();
        let widget = Rc::new(Widget);
        attach(&widget, &script_object, &context).unwrap();
        assert!(detach(&widget));
        assert!(!detach(&widget));
        assert!(lookup(&widget).is_none());
    }
}
