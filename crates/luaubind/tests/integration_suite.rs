//! Integration tests for luaubind runtime instances.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;

use anyhow::anyhow;
use tracing_subscriber::EnvFilter;

use luaubind::Error;
use luaubind::EnumBuilder;
use luaubind::HostFunction;
use luaubind::Object;
use luaubind::Operator;
use luaubind::ParamType;
use luaubind::RuntimeInstance;
use luaubind::ScriptFunction;
use luaubind::TypeBuilder;
use luaubind::TypeRegistry;
use luaubind::Value;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Vector {
    x: f32,
    y: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Color {
    Red,
    Green,
    Blue,
}

struct Secret;

fn vector_type(count: Arc<AtomicI32>) -> TypeBuilder<Vector> {
    let read_count = count.clone();
    TypeBuilder::<Vector>::new("Vector")
        .constructor(&[ParamType::Float, ParamType::Float], |_, frame| {
            Ok(Vector { x: frame.get(0)?, y: frame.get(1)? })
        })
        .method("Length", &[], |v, _, _| Ok(Value::from(((v.x * v.x + v.y * v.y) as f64).sqrt())))
        .method("Scale", &[ParamType::Float], |v, _, frame| {
            let k: f32 = frame.get(0)?;
            Ok(Value::Object(Object::new(Vector { x: v.x * k, y: v.y * k })))
        })
        .method_mut("Normalize", &[], |v, _, _| {
            let length = (v.x * v.x + v.y * v.y).sqrt();
            if length == 0.0 {
                return Err(anyhow!("cannot normalize a zero vector"));
            }
            v.x /= length;
            v.y /= length;
            Ok(Value::Nil)
        })
        .method_mut("Visit", &[ParamType::Function], |v, ctx, frame| {
            let callback: ScriptFunction = frame.get(0)?;
            v.x += 1.0;
            let results = ctx.call(&callback, Vec::new())?;
            Ok(results.into_iter().next().unwrap_or_default())
        })
        .method("Explode", &[], |_, _, _| -> anyhow::Result<Value> { panic!("kaboom") })
        .method("Leak", &[], |_, _, _| Ok(Value::Object(Object::new(Secret))))
        .field("x", ParamType::Float, |v| Value::from(v.x), |v, x| {
            v.x = x.get()?;
            Ok(())
        })
        .field("y", ParamType::Float, |v| Value::from(v.y), |v, y| {
            v.y = y.get()?;
            Ok(())
        })
        .readonly_property("Magnitude", ParamType::Number, |v| {
            Ok(Value::from(((v.x * v.x + v.y * v.y) as f64).sqrt()))
        })
        .static_method("Zero", &[], |_, _| Ok(Value::Object(Object::new(Vector { x: 0.0, y: 0.0 }))))
        .static_field(
            "Count",
            ParamType::Integer,
            move || Value::from(read_count.load(Ordering::SeqCst)),
            move |value| {
                count.store(value.get()?, Ordering::SeqCst);
                Ok(())
            },
        )
        .static_property("Dimensions", ParamType::Integer, || Ok(Value::from(2)))
        .operator(Operator::Add, &[ParamType::object::<Vector>(), ParamType::object::<Vector>()], |_, frame| {
            let a = *frame.object(0)?.borrow::<Vector>()?;
            let b = *frame.object(1)?.borrow::<Vector>()?;
            Ok(Value::Object(Object::new(Vector { x: a.x + b.x, y: a.y + b.y })))
        })
        .operator(Operator::Neg, &[ParamType::object::<Vector>()], |_, frame| {
            let a = *frame.object(0)?.borrow::<Vector>()?;
            Ok(Value::Object(Object::new(Vector { x: -a.x, y: -a.y })))
        })
        .operator(Operator::Eq, &[ParamType::object::<Vector>(), ParamType::object::<Vector>()], |_, frame| {
            let a = *frame.object(0)?.borrow::<Vector>()?;
            let b = *frame.object(1)?.borrow::<Vector>()?;
            Ok(Value::from(a == b))
        })
        .operator(Operator::Lt, &[ParamType::object::<Vector>(), ParamType::object::<Vector>()], |_, frame| {
            let a = *frame.object(0)?.borrow::<Vector>()?;
            let b = *frame.object(1)?.borrow::<Vector>()?;
            Ok(Value::from(a.x * a.x + a.y * a.y < b.x * b.x + b.y * b.y))
        })
}

fn color_type() -> EnumBuilder<Color> {
    EnumBuilder::<Color>::new("Color")
        .variant("Red", Color::Red)
        .variant("Green", Color::Green)
        .variant("Blue", Color::Blue)
}

/// Routes runtime diagnostics to the test output, filtered by `RUST_LOG`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A fresh instance with its own registry and `Vector` exposed.
fn instance() -> RuntimeInstance {
    init_tracing();
    let instance = RuntimeInstance::builder()
        .registry(Arc::new(TypeRegistry::new()))
        .build()
        .expect("Failed to create instance");
    instance.register(vector_type(Arc::new(AtomicI32::new(0)))).expect("Failed to register Vector");
    instance
}

fn run(instance: &RuntimeInstance, source: &str) -> Vec<Value> {
    instance.load(source).expect("Failed to load chunk");
    instance.execute().expect("Failed to execute chunk")
}

fn script_error(instance: &RuntimeInstance, source: &str) -> String {
    instance.load(source).expect("Failed to load chunk");
    match instance.execute() {
        Err(Error::Script(message)) => message,
        other => panic!("expected a script error, got {:?}", other),
    }
}

// --- Test 1: Construct and call ---

#[test]
fn test_construct_and_call() {
    let instance = instance();
    let results = run(&instance, "local v = Vector.New(3, 4) return v:Length()");
    assert_eq!(results, [Value::Number(5.0)]);
}

// --- Test 2: Methods returning objects ---

#[test]
fn test_method_returns_object() {
    let instance = instance();
    let results = run(&instance, "local v = Vector.New(1, 2):Scale(3) return v.x, v.y, typeof(v)");
    assert_eq!(results, [Value::Number(3.0), Value::Number(6.0), Value::from("Vector")]);
}

// --- Test 3: Fields and properties ---

#[test]
fn test_fields_and_properties() {
    let instance = instance();
    let results = run(
        &instance,
        r#"
        local v = Vector.New(1, 2)
        v.x = 3
        v.y = 4
        v.Magnitude = 100
        v.Unknown = 1
        return v.x, v.Magnitude, v.Unknown
        "#,
    );
    assert_eq!(results, [Value::Number(3.0), Value::Number(5.0), Value::Nil]);
}

// --- Test 4: Mutating methods ---

#[test]
fn test_mutating_method() {
    let instance = instance();
    let results = run(&instance, "local v = Vector.New(3, 4) v:Normalize() return v.x, v.y");
    let x = results[0].as_number().unwrap();
    let y = results[1].as_number().unwrap();
    assert!((x - 0.6).abs() < 1e-6);
    assert!((y - 0.8).abs() < 1e-6);
}

// --- Test 5: Static members ---

#[test]
fn test_static_members() {
    let count = Arc::new(AtomicI32::new(1));
    let instance = RuntimeInstance::builder()
        .registry(Arc::new(TypeRegistry::new()))
        .build()
        .expect("Failed to create instance");
    instance.register(vector_type(count.clone())).expect("Failed to register Vector");

    let results = run(
        &instance,
        r#"
        local before = Vector.Count
        Vector.Count = 7.9
        Vector.Dimensions = 3
        return before, Vector.Count, Vector.Dimensions, Vector.Zero().x, Vector.Missing
        "#,
    );
    assert_eq!(
        results,
        [Value::Number(1.0), Value::Number(7.0), Value::Number(2.0), Value::Number(0.0), Value::Nil]
    );
    assert_eq!(count.load(Ordering::SeqCst), 7);
}

// --- Test 6: Operators ---

#[test]
fn test_operators() {
    let instance = instance();
    let results = run(
        &instance,
        r#"
        local a = Vector.New(1, 2)
        local b = Vector.New(3, 4)
        local sum = a + b
        local neg = -a
        return sum.x, sum.y, neg.x, a == Vector.New(1, 2), a == b, a < b
        "#,
    );
    assert_eq!(
        results,
        [
            Value::Number(4.0),
            Value::Number(6.0),
            Value::Number(-1.0),
            Value::Boolean(true),
            Value::Boolean(false),
            Value::Boolean(true),
        ]
    );
}

#[test]
fn test_undeclared_operator_is_a_script_error() {
    let instance = instance();
    let message = script_error(&instance, "return Vector.New(1, 2) * Vector.New(3, 4)");
    assert!(message.contains("arithmetic"), "unexpected message: {}", message);
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Meters(f64);

fn meters_type() -> TypeBuilder<Meters> {
    let pair = [ParamType::object::<Meters>(), ParamType::object::<Meters>()];
    TypeBuilder::<Meters>::new("Meters")
        .constructor(&[ParamType::Number], |_, frame| Ok(Meters(frame.get(0)?)))
        .field("value", ParamType::Number, |m| Value::from(m.0), |m, value| {
            m.0 = value.get()?;
            Ok(())
        })
        .operator(Operator::Sub, &pair, |_, frame| {
            let a = *frame.object(0)?.borrow::<Meters>()?;
            let b = *frame.object(1)?.borrow::<Meters>()?;
            Ok(Value::Object(Object::new(Meters(a.0 - b.0))))
        })
        .operator(Operator::Mul, &[ParamType::object::<Meters>(), ParamType::Number], |_, frame| {
            let a = *frame.object(0)?.borrow::<Meters>()?;
            let k: f64 = frame.get(1)?;
            Ok(Value::Object(Object::new(Meters(a.0 * k))))
        })
        .operator(Operator::Div, &pair, |_, frame| {
            let a = *frame.object(0)?.borrow::<Meters>()?;
            let b = *frame.object(1)?.borrow::<Meters>()?;
            Ok(Value::from(a.0 / b.0))
        })
        .operator(Operator::Le, &pair, |_, frame| {
            let a = *frame.object(0)?.borrow::<Meters>()?;
            let b = *frame.object(1)?.borrow::<Meters>()?;
            Ok(Value::from(a.0 <= b.0))
        })
}

#[test]
fn test_remaining_operators() {
    let instance = instance();
    instance.register(meters_type()).expect("Failed to register Meters");
    let results = run(
        &instance,
        r#"
        local a = Meters.New(6)
        local b = Meters.New(2)
        return (a - b).value, (a * 1.5).value, a / b, b <= a, a <= b, a <= Meters.New(6), a >= b
        "#,
    );
    assert_eq!(
        results,
        [
            Value::Number(4.0),
            Value::Number(9.0),
            Value::Number(3.0),
            Value::Boolean(true),
            Value::Boolean(false),
            Value::Boolean(true),
            Value::Boolean(true),
        ]
    );
}

#[test]
fn test_operator_overloads_check_operands() {
    let instance = instance();
    instance.register(meters_type()).expect("Failed to register Meters");
    let message = script_error(&instance, "return Meters.New(1) - 1");
    assert!(
        message.contains("no matching overload for 'Meters.op_Subtraction' with arguments (Meters, number)"),
        "unexpected message: {}",
        message
    );
}

// --- Test 7: Enumerations ---

#[test]
fn test_enumerations() {
    let instance = instance();
    instance.register_enum(color_type()).expect("Failed to register Color");
    instance
        .globals()
        .set(
            "favorite",
            HostFunction::new("favorite", &[], |_, _| Ok(Value::Object(Object::new(Color::Green)))),
        )
        .unwrap();
    instance
        .globals()
        .set(
            "is_red",
            HostFunction::new("is_red", &[ParamType::enumeration::<Color>()], |_, frame| {
                Ok(Value::from(*frame.object(0)?.borrow::<Color>()? == Color::Red))
            }),
        )
        .unwrap();

    let results = run(
        &instance,
        "return favorite() == Color.Green, favorite() == Color.Blue, is_red(Color.Red), is_red(Color.Blue)",
    );
    assert_eq!(
        results,
        [Value::Boolean(true), Value::Boolean(false), Value::Boolean(true), Value::Boolean(false)]
    );
}

#[test]
fn test_enumeration_rejects_nil() {
    let instance = instance();
    instance.register_enum(color_type()).expect("Failed to register Color");
    instance
        .globals()
        .set(
            "is_red",
            HostFunction::new("is_red", &[ParamType::enumeration::<Color>()], |_, _| Ok(Value::from(true))),
        )
        .unwrap();
    let message = script_error(&instance, "return is_red(nil)");
    assert!(message.contains("no matching overload for 'is_red' with arguments (nil)"), "{}", message);
}

// --- Test 8: Host closures ---

#[test]
fn test_host_closures() {
    let instance = instance();
    let add = HostFunction::new("add", &[ParamType::Number, ParamType::Number], |_, frame| {
        Ok(Value::from(frame.get::<f64>(0)? + frame.get::<f64>(1)?))
    });
    instance.globals().set("add", add.clone()).unwrap();

    assert_eq!(run(&instance, "return add(2, 3)"), [Value::Number(5.0)]);
    match instance.globals().get("add").unwrap() {
        Value::Closure(read) => assert!(read.ptr_eq(&add)),
        other => panic!("expected a closure, got {:?}", other),
    }
}

#[test]
fn test_host_calls_back_into_script() {
    let instance = instance();
    let apply = HostFunction::new("apply", &[ParamType::Function, ParamType::Number], |ctx, frame| {
        let function: ScriptFunction = frame.get(0)?;
        let results = ctx.call(&function, [frame.value(1).clone()])?;
        Ok(results.into_iter().next().unwrap_or_default())
    });
    instance.globals().set("apply", apply).unwrap();
    let results = run(&instance, "return apply(function(n) return n * 10 end, 4)");
    assert_eq!(results, [Value::Number(40.0)]);
}

// --- Test 9: Script functions and tables on the host side ---

#[test]
fn test_script_function_from_host() {
    let instance = instance();
    let results = run(&instance, "return function(a, b) return a * b, a + b end");
    let function: ScriptFunction = results[0].get().unwrap();
    assert!(function.is_pinned());
    assert_eq!(instance.pinned_references(), 1);

    let products = function.call([Value::from(6.0), Value::from(7.0)]).unwrap();
    assert_eq!(products, [Value::Number(42.0), Value::Number(13.0)]);

    function.unpin();
    assert!(!function.is_pinned());
    assert!(matches!(function.call(Vec::new()), Err(Error::Released)));
    assert_eq!(instance.pinned_references(), 0);
}

#[test]
fn test_script_table_from_host() {
    let instance = instance();
    let config = instance.create_table().unwrap();
    config.set("name", "sample").unwrap();
    config.set("origin", Object::new(Vector { x: 1.0, y: 1.0 })).unwrap();
    instance.globals().set("config", config.clone()).unwrap();

    let results = run(&instance, "config.size = 3 return config.name, config.origin.x");
    assert_eq!(results, [Value::from("sample"), Value::Number(1.0)]);
    assert_eq!(config.get("size").unwrap(), Value::Number(3.0));
    assert_eq!(config.get("absent").unwrap(), Value::Nil);
}

// --- Test 10: Host objects through globals ---

#[test]
fn test_object_identity_through_script() {
    let instance = instance();
    let origin = Object::new(Vector { x: 0.0, y: 0.0 });
    instance.globals().set("origin", origin.clone()).unwrap();

    let results = run(&instance, "origin.x = 5 return origin");
    match &results[0] {
        Value::Object(read) => assert!(read.ptr_eq(&origin)),
        other => panic!("expected an object, got {:?}", other),
    }
    assert_eq!(origin.borrow::<Vector>().unwrap().x, 5.0);
    assert_eq!(instance.globals().get_as::<Object>("origin").unwrap().type_name(), "Vector");
}

#[test]
fn test_unregistered_type_is_rejected() {
    let instance = instance();
    let message = script_error(&instance, "return Vector.New(1, 2):Leak()");
    assert!(message.contains("type 'Secret' is not a registered type"), "{}", message);

    let result = instance.globals().set("secret", Object::new(Secret));
    assert!(matches!(result, Err(Error::Marshal(_))));
}

// --- Test 11: Host failures surface as script errors ---

#[test]
fn test_host_error_becomes_script_error() {
    let instance = instance();
    let message = script_error(&instance, "Vector.New(0, 0):Normalize()");
    assert!(message.contains("error in 'Vector.Normalize': cannot normalize a zero vector"), "{}", message);
}

#[test]
fn test_host_error_can_be_caught() {
    let instance = instance();
    let results = run(
        &instance,
        "local ok, err = pcall(function() Vector.New(0, 0):Normalize() end) return ok, string.find(err, 'zero') ~= nil",
    );
    assert_eq!(results, [Value::Boolean(false), Value::Boolean(true)]);
}

#[test]
fn test_host_panic_becomes_script_error() {
    let instance = instance();
    let message = script_error(&instance, "Vector.New(1, 1):Explode()");
    assert!(message.contains("host code panicked: kaboom"), "{}", message);
    assert!(instance.is_live());
}

#[test]
fn test_reentrant_borrow_is_a_script_error() {
    let instance = instance();
    let message = script_error(&instance, "local v = Vector.New(1, 1) return v:Visit(function() return v.x end)");
    assert!(message.contains("error in 'Vector.Visit'"), "{}", message);
    assert!(message.contains("already borrowed"), "{}", message);
}

// --- Test 12: Print sink ---

#[test]
fn test_print_sink() {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    let instance = RuntimeInstance::builder()
        .registry(Arc::new(TypeRegistry::new()))
        .print(move |line| sink.lock().unwrap().push(line.to_string()))
        .build()
        .expect("Failed to create instance");

    run(&instance, "print('hello', 1, nil, true) print()");
    assert_eq!(*lines.lock().unwrap(), ["hello\t1\tnil\ttrue", ""]);
}

// --- Test 13: Application data ---

struct Tally(u32);

#[test]
fn test_app_data() {
    let instance = RuntimeInstance::builder()
        .registry(Arc::new(TypeRegistry::new()))
        .app_data(Tally(0))
        .build()
        .expect("Failed to create instance");
    let bump = HostFunction::new("bump", &[], |ctx, _| {
        let mut tally = ctx.app_data_mut::<Tally>().ok_or_else(|| anyhow!("no tally"))?;
        tally.0 += 1;
        Ok(Value::from(tally.0 as f64))
    });
    instance.globals().set("bump", bump).unwrap();

    assert_eq!(run(&instance, "bump() bump() return bump()"), [Value::Number(3.0)]);
    assert!(instance.insert_app_data(Tally(10)).is_some());
}

// --- Test 14: Handles released by the collector ---

#[test]
fn test_collected_values_release_handles() {
    let instance = instance();
    run(&instance, "items = {} for i = 1, 50 do items[i] = Vector.New(i, i) end");
    let before = instance.live_handles();
    assert!(before >= 50);

    instance.globals().set("items", Value::Nil).unwrap();
    instance.collect_garbage().unwrap();
    assert!(instance.live_handles() <= before - 50);
}
