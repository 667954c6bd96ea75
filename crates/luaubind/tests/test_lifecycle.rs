//! Instance lifecycle: loading, execution, disposal and handle validity.

use std::sync::Arc;

use luaubind::Error;
use luaubind::HostFunction;
use luaubind::Object;
use luaubind::ParamType;
use luaubind::Phase;
use luaubind::RuntimeInstance;
use luaubind::ScriptFunction;
use luaubind::TypeBuilder;
use luaubind::TypeRegistry;
use luaubind::Value;
use luaubind::handles::Invalid;
use luaubind::registry;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Counter {
    value: i32,
}

fn counter_type() -> TypeBuilder<Counter> {
    TypeBuilder::<Counter>::new("Counter")
        .constructor(&[ParamType::Integer], |_, frame| Ok(Counter { value: frame.get(0)? }))
        .method_mut("Increment", &[], |c, _, _| {
            c.value += 1;
            Ok(Value::from(c.value))
        })
}

fn instance() -> RuntimeInstance {
    let instance = RuntimeInstance::builder()
        .registry(Arc::new(TypeRegistry::new()))
        .build()
        .expect("Failed to create instance");
    instance.register(counter_type()).expect("Failed to register Counter");
    instance
}

#[test]
fn test_phases() {
    let mut instance = instance();
    assert_eq!(instance.phase(), Phase::Created);

    instance.load("return 1").unwrap();
    assert_eq!(instance.phase(), Phase::Loaded);

    assert_eq!(instance.execute().unwrap(), [Value::Number(1.0)]);
    assert_eq!(instance.phase(), Phase::Loaded);

    // The chunk can run again.
    assert_eq!(instance.execute().unwrap(), [Value::Number(1.0)]);

    instance.dispose();
    assert_eq!(instance.phase(), Phase::Disposed);
    assert!(!instance.is_live());
}

#[test]
fn test_single_chunk() {
    let instance = instance();
    assert!(matches!(instance.execute(), Err(Error::NotLoaded)));
    instance.load("return 1").unwrap();
    assert!(matches!(instance.load("return 2"), Err(Error::AlreadyLoaded)));
}

#[test]
fn test_compile_error() {
    let instance = instance();
    match instance.load("return +") {
        Err(Error::Compile(message)) => assert!(!message.is_empty()),
        other => panic!("expected a compile error, got {:?}", other),
    }
    assert_eq!(instance.phase(), Phase::Created);

    // A failed compile leaves the slot free.
    instance.load("return 2").unwrap();
    assert_eq!(instance.execute().unwrap(), [Value::Number(2.0)]);
}

#[test]
fn test_precompiled_bytecode() {
    let instance = instance();
    let bytecode = instance.compile("return Counter.New(4):Increment()").unwrap();
    instance.load_bytecode(&bytecode, "counter").unwrap();
    assert_eq!(instance.execute().unwrap(), [Value::Number(5.0)]);
}

#[test]
fn test_script_error_keeps_instance_usable() {
    let instance = instance();
    instance.load("error('boom')").unwrap();
    match instance.execute() {
        Err(Error::Script(message)) => assert!(message.contains("boom"), "{}", message),
        other => panic!("expected a script error, got {:?}", other),
    }
    assert_eq!(instance.phase(), Phase::Loaded);
    assert!(instance.is_live());
    instance.globals().set("answer", 42).unwrap();
    assert_eq!(instance.globals().get_as::<i32>("answer").unwrap(), 42);
}

#[test]
fn test_dispose_is_idempotent() {
    let mut instance = instance();
    instance.load("return 1").unwrap();
    instance.dispose();
    instance.dispose();
    assert_eq!(instance.phase(), Phase::Disposed);
}

#[test]
fn test_operations_after_dispose() {
    let mut instance = instance();
    instance.dispose();
    assert!(matches!(instance.load("return 1"), Err(Error::Disposed)));
    assert!(matches!(instance.execute(), Err(Error::Disposed)));
    assert!(matches!(instance.globals().get("print"), Err(Error::Disposed)));
    assert!(matches!(instance.globals().set("x", 1), Err(Error::Disposed)));
    assert!(matches!(instance.create_table(), Err(Error::Disposed)));
    assert!(matches!(instance.compile("return 1"), Err(Error::Disposed)));
    assert!(matches!(instance.create_handle(Object::new(Counter { value: 0 })), Err(Error::Disposed)));
    assert!(matches!(instance.expose::<Counter>(), Err(Error::Disposed)));
    assert!(matches!(instance.collect_garbage(), Err(Error::Disposed)));
}

#[test]
fn test_dispose_invalidates_handles() {
    let mut instance = instance();
    let handle = instance.create_handle(Object::new(Counter { value: 3 })).unwrap();
    assert_eq!(instance.resolve_handle(handle).unwrap().borrow::<Counter>().unwrap().value, 3);

    instance.dispose();
    assert_eq!(instance.live_handles(), 0);
    match instance.resolve_handle(handle) {
        Err(Error::Handle(luaubind::handles::Error::InvalidHandle { reason, .. })) => {
            assert_eq!(reason, Invalid::Destroyed)
        }
        other => panic!("expected an invalid handle, got {:?}", other),
    }
}

#[test]
fn test_destroy_handle_twice() {
    let instance = instance();
    let handle = instance.create_handle(Object::new(Counter { value: 0 })).unwrap();
    assert!(instance.destroy_handle(handle));
    assert!(!instance.destroy_handle(handle));
    assert!(instance.resolve_handle(handle).is_err());

    // The freed slot is reused under a new generation.
    let next = instance.create_handle(Object::new(Counter { value: 1 })).unwrap();
    assert_ne!(next, handle);
    assert!(instance.resolve_handle(handle).is_err());
    assert_eq!(instance.resolve_handle(next).unwrap().borrow::<Counter>().unwrap().value, 1);
}

#[test]
fn test_handles_are_instance_scoped() {
    let a = instance();
    let b = instance();
    let handle = a.create_handle(Object::new(Counter { value: 0 })).unwrap();
    match b.resolve_handle(handle) {
        Err(Error::Handle(luaubind::handles::Error::InvalidHandle { reason, .. })) => {
            assert_eq!(reason, Invalid::ForeignInstance)
        }
        other => panic!("expected a foreign handle, got {:?}", other),
    }
    assert!(!b.destroy_handle(handle));
    assert!(a.resolve_handle(handle).is_ok());
}

#[test]
fn test_references_after_dispose() {
    let mut instance = instance();
    instance.load("return function() return 1 end, {}").unwrap();
    let results = instance.execute().unwrap();
    let function: ScriptFunction = results[0].get().unwrap();
    assert!(function.is_pinned());

    instance.dispose();
    assert!(!function.is_pinned());
    assert!(matches!(function.call(Vec::new()), Err(Error::Disposed)));
    match &results[1] {
        Value::Table(table) => assert!(matches!(table.get("x"), Err(Error::Disposed))),
        other => panic!("expected a table, got {:?}", other),
    }
    // Releasing after dispose is a no-op.
    function.unpin();
    drop(results);
}

#[test]
fn test_references_outlive_instance() {
    let function = {
        let instance = instance();
        instance.load("return function() return 1 end").unwrap();
        instance.execute().unwrap().remove(0).get::<ScriptFunction>().unwrap()
    };
    assert!(!function.is_pinned());
    assert!(matches!(function.call(Vec::new()), Err(Error::Disposed)));
}

#[test]
fn test_references_are_instance_scoped() {
    let a = instance();
    let b = instance();
    a.load("return function() return 1 end").unwrap();
    let function = a.execute().unwrap().remove(0);
    match b.globals().set("f", function) {
        Err(Error::Marshal(luaubind::marshal::Error::ForeignReference { owner, target })) => {
            assert_eq!(owner, a.id());
            assert_eq!(target, b.id());
        }
        other => panic!("expected a foreign reference, got {:?}", other),
    }
}

#[test]
fn test_duplicate_registration() {
    let instance = instance();
    match instance.register(counter_type()) {
        Err(Error::Registry(registry::Error::DuplicateRegistration { type_name })) => {
            assert!(type_name.contains("Counter"), "{}", type_name)
        }
        other => panic!("expected a duplicate registration, got {:?}", other),
    }
    // Exposing again is harmless.
    instance.expose::<Counter>().unwrap();
}

#[test]
fn test_shared_registry() {
    let registry = Arc::new(TypeRegistry::new());
    registry.register(counter_type()).unwrap();
    let a = RuntimeInstance::builder().registry(registry.clone()).build().unwrap();
    let b = RuntimeInstance::builder().registry(registry.clone()).build().unwrap();
    a.expose::<Counter>().unwrap();
    b.expose::<Counter>().unwrap();

    a.load("return Counter.New(1):Increment()").unwrap();
    b.load("return Counter.New(10):Increment()").unwrap();
    assert_eq!(a.execute().unwrap(), [Value::Number(2.0)]);
    assert_eq!(b.execute().unwrap(), [Value::Number(11.0)]);
    assert_ne!(a.id(), b.id());
}

#[test]
fn test_unexposed_type_is_absent() {
    let registry = Arc::new(TypeRegistry::new());
    registry.register(counter_type()).unwrap();
    let instance = RuntimeInstance::builder().registry(registry).build().unwrap();
    instance.load("return Counter").unwrap();
    assert_eq!(instance.execute().unwrap(), [Value::Nil]);
}

#[test]
fn test_type_tokens_read_as_nil() {
    let instance = instance();
    assert_eq!(instance.globals().get("Counter").unwrap(), Value::Nil);
    instance.load("return Counter, typeof(Counter) ~= 'nil'").unwrap();
    assert_eq!(instance.execute().unwrap(), [Value::Nil, Value::Boolean(true)]);
}

#[test]
fn test_dispose_during_call() {
    let instance = instance();
    let shutdown = HostFunction::new("shutdown", &[], |ctx, _| {
        ctx.dispose_instance();
        Ok(Value::Nil)
    });
    instance.globals().set("shutdown", shutdown).unwrap();
    instance.load("shutdown() return Counter.New(1)").unwrap();

    assert!(matches!(instance.execute(), Err(Error::Disposed)));
    assert!(!instance.is_live());
    assert_eq!(instance.phase(), Phase::Disposed);
    assert!(matches!(instance.execute(), Err(Error::Disposed)));
}
