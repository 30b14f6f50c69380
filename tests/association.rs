use std::rc::Rc;

use scrybridge::{
    attach, detach, invoke_on_self, lookup, BridgeError, Context, FunctionTable, NativeObject,
    Value,
};

struct Npc {
    name: String,
}

const GREETER: &str = "\
class Greeter:
    def __init__(self, greeting):
        self.greeting = greeting
    def greet(self, name='stranger'):
        return self.greeting + ', ' + name
";

#[test]
fn invoke_on_self_calls_the_associated_script_method() {
    let context = Context::create().unwrap();
    context.evaluate(GREETER).unwrap();
    let script_object = context.evaluate_value("Greeter('hi')").unwrap();

    let npc = Rc::new(Npc {
        name: "guard".to_string(),
    });
    attach(&npc, &script_object, &context).unwrap();

    assert_eq!(
        invoke_on_self(&npc, "greet", &[]).unwrap(),
        Value::from("hi, stranger")
    );
    assert_eq!(
        invoke_on_self(&npc, "greet", &[Value::from(npc.name.as_str())]).unwrap(),
        Value::from("hi, guard")
    );
    assert_eq!(
        invoke_on_self(&npc, "wave", &[]),
        Err(BridgeError::MethodNotFound("wave".into()))
    );
    // Present but not callable.
    assert_eq!(
        invoke_on_self(&npc, "greeting", &[]),
        Err(BridgeError::MethodNotFound("greeting".into()))
    );
}

#[test]
fn plain_functions_receive_the_script_object_as_self() {
    let context = Context::create().unwrap();
    context
        .evaluate(
            "import types\n\
             def _greet(self, name):\n\
             \x20   return self.greeting + ', ' + name\n\
             scripted = types.SimpleNamespace(greeting='ahoy', greet=_greet)\n\
             table = {'greeting': 'hey', 'greet': lambda self, name: self['greeting'] + ' ' + name}\n",
        )
        .unwrap();

    let sailor = Rc::new(Npc {
        name: "sailor".to_string(),
    });
    attach(&sailor, &context.global("scripted").unwrap(), &context).unwrap();
    assert_eq!(
        invoke_on_self(&sailor, "greet", &[Value::from("matey")]).unwrap(),
        Value::from("ahoy, matey")
    );

    let clerk = Rc::new(Npc {
        name: "clerk".to_string(),
    });
    attach(&clerk, &context.global("table").unwrap(), &context).unwrap();
    assert_eq!(
        invoke_on_self(&clerk, "greet", &[Value::from(clerk.name.as_str())]).unwrap(),
        Value::from("hey clerk")
    );
}

#[test]
fn unattached_instances_have_no_script_object() {
    let npc = Rc::new(Npc {
        name: "nobody".to_string(),
    });
    assert!(lookup(&npc).is_none());
    assert_eq!(
        invoke_on_self(&npc, "greet", &[]),
        Err(BridgeError::NoAssociatedScriptObject)
    );
}

#[test]
fn reattaching_replaces_the_association() {
    let context = Context::create().unwrap();
    context.evaluate(GREETER).unwrap();
    let first = context.evaluate_value("Greeter('hello')").unwrap();
    let second = context.evaluate_value("Greeter('howdy')").unwrap();

    let npc = Rc::new(Npc {
        name: "bard".to_string(),
    });
    attach(&npc, &first, &context).unwrap();
    attach(&npc, &second, &context).unwrap();

    let association = lookup(&npc).unwrap();
    assert!(association.script_object().is_same(&second));
    assert!(association.context().is_some());
    assert_eq!(
        invoke_on_self(&npc, "greet", &[Value::from("you")]).unwrap(),
        Value::from("howdy, you")
    );

    // The replaced script object is still usable on its own.
    assert_eq!(
        first.get("greet").unwrap().call(&[]).unwrap(),
        Value::from("hello, stranger")
    );

    assert!(detach(&npc));
    assert_eq!(
        invoke_on_self(&npc, "greet", &[]),
        Err(BridgeError::NoAssociatedScriptObject)
    );
}

#[test]
fn association_does_not_keep_the_context_alive() {
    let npc = Rc::new(Npc {
        name: "ghost".to_string(),
    });
    {
        let context = Context::create().unwrap();
        let script_object = context.evaluate_value("{'greet': lambda self: 'boo'}").unwrap();
        attach(&npc, &script_object, &context).unwrap();
        assert_eq!(invoke_on_self(&npc, "greet", &[]).unwrap(), Value::from("boo"));
    }
    let association = lookup(&npc).unwrap();
    assert!(association.context().is_none());
    assert_eq!(
        invoke_on_self(&npc, "greet", &[]),
        Err(BridgeError::ContextNotActive)
    );
}

#[test]
fn native_objects_and_scripts_call_each_other() {
    let context = Context::create().unwrap();
    context
        .evaluate(
            "class Brain:\n    def decide(self, body):\n        return body.sense() * 2\n",
        )
        .unwrap();
    let brain = context.evaluate_value("Brain()").unwrap();

    let body: Rc<u32> = Rc::new(21);
    let sensed = Rc::clone(&body);
    let object = NativeObject::new(
        body.clone(),
        FunctionTable::new().with("sense", move |_| Ok(Value::Int(i64::from(*sensed)))),
    );
    attach(&body, &brain, &context).unwrap();

    // Lookup works through the type-erased instance held by the object too.
    assert!(lookup(object.instance()).is_some());
    assert_eq!(
        invoke_on_self(&body, "decide", &[Value::Object(object)]).unwrap(),
        Value::Int(42)
    );
}

#[test]
fn disposed_context_invalidates_associations() {
    let context = Context::create().unwrap();
    let script_object = context.evaluate_value("{'ping': lambda self: 'pong'}").unwrap();
    let npc = Rc::new(Npc {
        name: "echo".to_string(),
    });
    attach(&npc, &script_object, &context).unwrap();
    context.dispose();

    assert_eq!(
        invoke_on_self(&npc, "ping", &[]),
        Err(BridgeError::ContextNotActive)
    );
    assert_eq!(script_object.to_native(), Err(BridgeError::ContextNotActive));
}
