//! # Dispatch protocol
//!
//! The native callbacks the runtime consults through metatables whenever a
//! script touches a host value:
//!
//! - `__index` / `__newindex` on objects and on type tokens,
//! - `__call` on callables (method groups, constructors, operators, closures),
//! - `__eq` on enumeration values.
//!
//! Every callback runs behind `protect`, which turns host errors and panics
//! into script errors raised with `lua_error`. Nothing that needs dropping is
//! alive in the callback frame when the error unwinds through it.

use std::any::TypeId;
use std::ffi::c_int;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::context::CallContext;
use crate::context::CallFrame;
use crate::context::InstanceCtx;
use crate::descriptor::HostFunction;
use crate::descriptor::MethodCandidateSet;
use crate::descriptor::TypeDescriptor;
use crate::marshal;
use crate::resolve;
use crate::stack::Stack;
use crate::stack::lua_State;
use crate::value::Object;
use crate::value::Value;

/// What a script-held opaque value stands for.
#[derive(Clone)]
pub(crate) enum Target {
    Object(Object),
    Type(Arc<TypeDescriptor>),
    Callable(Arc<Callable>),
}

/// A callable opaque value: one candidate set plus how to bind its arguments.
pub(crate) struct Callable {
    label: String,
    set: Arc<MethodCandidateSet>,
    receiver: Option<Arc<TypeDescriptor>>,
    unary: bool,
    closure: bool,
}

impl Callable {
    pub(crate) fn closure(function: &HostFunction) -> Self {
        Self {
            label: function.name().to_string(),
            set: function.candidates().clone(),
            receiver: None,
            unary: false,
            closure: true,
        }
    }

    pub(crate) fn as_closure(&self) -> Option<HostFunction> {
        self.closure.then(|| HostFunction::from_candidates(self.set.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Scope {
    Instance,
    Static,
    Constructor,
    Operator,
}

pub(crate) type CallableKey = (TypeId, Scope, String);

#[derive(Debug)]
pub enum Error {
    /// No candidate of the group accepts the arguments.
    NoMatchingOverload { member: String, arguments: String },
    /// An instance method was called without an instance of its type first.
    MissingReceiver { member: String },
    /// The indexed value is not a live host object.
    NotAnObject,
    /// The called value is not a host callable.
    NotCallable,
    /// The host implementation failed.
    Host { member: String, source: anyhow::Error },
    Marshal(marshal::Error),
    Disposed,
    Panic(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoMatchingOverload { member, arguments } => {
                write!(f, "no matching overload for '{}' with arguments ({})", member, arguments)
            }
            Self::MissingReceiver { member } => {
                write!(f, "'{}' must be called on an instance (use ':' instead of '.')", member)
            }
            Self::NotAnObject => write!(f, "value is not a host object"),
            Self::NotCallable => write!(f, "value is not a host callable"),
            Self::Host { member, source } => write!(f, "error in '{}': {:#}", member, source),
            Self::Marshal(e) => write!(f, "{}", e),
            Self::Disposed => write!(f, "runtime instance has been disposed"),
            Self::Panic(message) => write!(f, "host code panicked: {}", message),
        }
    }
}

impl std::error::Error for Error {}

impl From<marshal::Error> for Error {
    fn from(e: marshal::Error) -> Self {
        Self::Marshal(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

type Callback = fn(&InstanceCtx, Stack) -> Result<c_int>;

/// Runs `callback` and converts any failure into a script error.
unsafe fn protect(state: *mut lua_State, callback: Callback) -> c_int {
    let stack = unsafe { Stack::from_raw(state) };
    let outcome = match unsafe { InstanceCtx::from_stack(stack) } {
        Some(ctx) if ctx.is_live() => {
            ctx.flush_released(stack);
            match panic::catch_unwind(AssertUnwindSafe(|| callback(ctx, stack))) {
                Ok(Ok(results)) => Ok(results),
                Ok(Err(error)) => Err(error.to_string()),
                Err(payload) => {
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    Err(Error::Panic(message).to_string())
                }
            }
        }
        _ => Err(Error::Disposed.to_string()),
    };
    match outcome {
        Ok(results) => results,
        Err(message) => {
            tracing::debug!(%message, "raising script error from host callback");
            stack.push_string(&message);
            drop(message);
            unsafe { stack.raise_error() }
        }
    }
}

unsafe extern "C-unwind" fn object_index(state: *mut lua_State) -> c_int {
    unsafe { protect(state, index_object) }
}

unsafe extern "C-unwind" fn object_newindex(state: *mut lua_State) -> c_int {
    unsafe { protect(state, newindex_object) }
}

unsafe extern "C-unwind" fn type_index(state: *mut lua_State) -> c_int {
    unsafe { protect(state, index_type) }
}

unsafe extern "C-unwind" fn type_newindex(state: *mut lua_State) -> c_int {
    unsafe { protect(state, newindex_type) }
}

unsafe extern "C-unwind" fn callable_call(state: *mut lua_State) -> c_int {
    unsafe { protect(state, call) }
}

unsafe extern "C-unwind" fn enum_eq(state: *mut lua_State) -> c_int {
    unsafe { protect(state, equal_values) }
}

fn descriptor_of(ctx: &InstanceCtx, object: &Object) -> Result<Arc<TypeDescriptor>> {
    ctx.registry()
        .get(object.type_id())
        .ok_or_else(|| Error::Marshal(marshal::Error::UnregisteredType { type_name: object.type_name().to_string() }))
}

fn host_error(descriptor: &TypeDescriptor, member: &str, source: anyhow::Error) -> Error {
    Error::Host { member: format!("{}.{}", descriptor.name(), member), source }
}

fn receiver(ctx: &InstanceCtx, stack: Stack) -> Result<(Object, Arc<TypeDescriptor>)> {
    match marshal::read_target(ctx, stack, 1)? {
        Some(Target::Object(object)) => {
            let descriptor = descriptor_of(ctx, &object)?;
            Ok((object, descriptor))
        }
        _ => Err(Error::NotAnObject),
    }
}

fn type_token(ctx: &InstanceCtx, stack: Stack) -> Result<Arc<TypeDescriptor>> {
    match marshal::read_target(ctx, stack, 1)? {
        Some(Target::Type(descriptor)) => Ok(descriptor),
        _ => Err(Error::NotAnObject),
    }
}

fn index_object(ctx: &InstanceCtx, stack: Stack) -> Result<c_int> {
    let (object, descriptor) = receiver(ctx, stack)?;
    let Some(name) = stack.to_string_lossy(2) else {
        stack.push_nil();
        return Ok(1);
    };
    tracing::trace!(type_name = descriptor.name(), member = %name, "index");

    if let Some(set) = descriptor.instance_method(&name) {
        let key = (descriptor.type_id(), Scope::Instance, name.clone());
        push_callable(ctx, stack, key, || Callable {
            label: format!("{}.{}", descriptor.name(), name),
            set: set.clone(),
            receiver: Some(descriptor.clone()),
            unary: false,
            closure: false,
        });
        return Ok(1);
    }
    match descriptor.instance_field(&name).or_else(|| descriptor.instance_property(&name)) {
        Some(accessor) => {
            let value = accessor.read(Some(&object)).map_err(|e| host_error(&descriptor, &name, e))?;
            marshal::push(ctx, stack, &value)?;
        }
        None => stack.push_nil(),
    }
    Ok(1)
}

fn newindex_object(ctx: &InstanceCtx, stack: Stack) -> Result<c_int> {
    let (object, descriptor) = receiver(ctx, stack)?;
    let Some(name) = stack.to_string_lossy(2) else {
        return Ok(0);
    };
    tracing::trace!(type_name = descriptor.name(), member = %name, "newindex");

    match descriptor.instance_field(&name).or_else(|| descriptor.instance_property(&name)) {
        Some(accessor) if accessor.is_writable() => {
            let value = resolve::coerce(accessor.ty(), marshal::read(ctx, stack, 3)?);
            accessor.write(Some(&object), value).map_err(|e| host_error(&descriptor, &name, e))?;
        }
        _ => tracing::trace!(type_name = descriptor.name(), member = %name, "ignored write to unknown or read-only member"),
    }
    Ok(0)
}

fn index_type(ctx: &InstanceCtx, stack: Stack) -> Result<c_int> {
    let descriptor = type_token(ctx, stack)?;
    let Some(name) = stack.to_string_lossy(2) else {
        stack.push_nil();
        return Ok(1);
    };
    tracing::trace!(type_name = descriptor.name(), member = %name, "static index");

    if name == "New" && !descriptor.constructors().is_empty() {
        let key = (descriptor.type_id(), Scope::Constructor, name);
        push_callable(ctx, stack, key, || Callable {
            label: descriptor.constructors().name().to_string(),
            set: descriptor.constructors().clone(),
            receiver: None,
            unary: false,
            closure: false,
        });
        return Ok(1);
    }
    if let Some(set) = descriptor.static_method(&name) {
        let key = (descriptor.type_id(), Scope::Static, name.clone());
        push_callable(ctx, stack, key, || Callable {
            label: format!("{}.{}", descriptor.name(), name),
            set: set.clone(),
            receiver: None,
            unary: false,
            closure: false,
        });
        return Ok(1);
    }
    match descriptor.static_field(&name).or_else(|| descriptor.static_property(&name)) {
        Some(accessor) => {
            let value = accessor.read(None).map_err(|e| host_error(&descriptor, &name, e))?;
            marshal::push(ctx, stack, &value)?;
        }
        None => stack.push_nil(),
    }
    Ok(1)
}

fn newindex_type(ctx: &InstanceCtx, stack: Stack) -> Result<c_int> {
    let descriptor = type_token(ctx, stack)?;
    let Some(name) = stack.to_string_lossy(2) else {
        return Ok(0);
    };
    match descriptor.static_field(&name).or_else(|| descriptor.static_property(&name)) {
        Some(accessor) if accessor.is_writable() => {
            let value = resolve::coerce(accessor.ty(), marshal::read(ctx, stack, 3)?);
            accessor.write(None, value).map_err(|e| host_error(&descriptor, &name, e))?;
        }
        _ => tracing::trace!(type_name = descriptor.name(), member = %name, "ignored static write"),
    }
    Ok(0)
}

fn call(ctx: &InstanceCtx, stack: Stack) -> Result<c_int> {
    let callable = match marshal::read_target(ctx, stack, 1)? {
        Some(Target::Callable(callable)) => callable,
        _ => return Err(Error::NotCallable),
    };
    let (receiver, first) = match &callable.receiver {
        Some(descriptor) => match marshal::read(ctx, stack, 2)? {
            Value::Object(object) if object.type_id() == descriptor.type_id() => (Some(object), 3),
            _ => return Err(Error::MissingReceiver { member: callable.label.clone() }),
        },
        None => (None, 2),
    };
    let mut args = marshal::read_from(ctx, stack, first)?;
    if callable.unary {
        // The runtime passes the operand twice to unary metamethods.
        args.truncate(1);
    }
    let value = invoke(ctx, &callable, receiver.as_ref(), args)?;
    if !ctx.is_live() {
        return Err(Error::Disposed);
    }
    marshal::push(ctx, stack, &value)?;
    Ok(1)
}

/// Resolves, coerces and runs one call against a callable's candidates.
fn invoke(ctx: &InstanceCtx, callable: &Callable, receiver: Option<&Object>, args: Vec<Value>) -> Result<Value> {
    let Some(method) = resolve::resolve(&callable.set, &args) else {
        return Err(Error::NoMatchingOverload {
            member: callable.label.clone(),
            arguments: resolve::describe_arguments(&args),
        });
    };
    let frame = CallFrame::new(resolve::coerce_all(method, args));
    tracing::trace!(member = %callable.label, arguments = frame.len(), "dispatching host call");
    let mut call = CallContext::new(ctx);
    method
        .call(&mut call, receiver, &frame)
        .map_err(|source| Error::Host { member: callable.label.clone(), source })
}

fn equal_values(ctx: &InstanceCtx, stack: Stack) -> Result<c_int> {
    let equal = match (marshal::read(ctx, stack, 1)?, marshal::read(ctx, stack, 2)?) {
        (Value::Object(a), Value::Object(b)) if a.type_id() == b.type_id() => {
            descriptor_of(ctx, &a)?.values_equal(&a, &b)
        }
        _ => false,
    };
    stack.push_boolean(equal);
    Ok(1)
}

/// Pushes the callable for `key`, minting and caching it on first use.
fn push_callable(ctx: &InstanceCtx, stack: Stack, key: CallableKey, make: impl FnOnce() -> Callable) {
    let cached = ctx.callables.borrow().get(&key).copied();
    match cached {
        Some(id) => {
            stack.push_reference(id);
        }
        None => {
            let target = Target::Callable(Arc::new(make()));
            marshal::push_target(ctx, stack, target, ctx.callable_metatable.get());
            let id = stack.create_reference(-1);
            ctx.callables.borrow_mut().insert(key, id);
        }
    }
}

/// Builds the metatable shared by every callable of the instance.
pub(crate) fn install_callable_metatable(ctx: &InstanceCtx, stack: Stack) {
    stack.new_table();
    stack.push_function(callable_call);
    stack.set_field(-2, "__call");
    stack.push_string("function");
    stack.set_field(-2, "__type");
    let id = stack.create_reference(-1);
    stack.pop(1);
    ctx.callable_metatable.set(id);
}

/// The metatable for values of `descriptor`'s type, built once per instance.
pub(crate) fn object_metatable(ctx: &InstanceCtx, stack: Stack, descriptor: &Arc<TypeDescriptor>) -> c_int {
    let cached = ctx.metatables.borrow().get(&descriptor.type_id()).copied();
    if let Some(id) = cached {
        return id;
    }

    stack.new_table();
    let table = stack.top();
    if descriptor.is_enum() {
        stack.push_function(enum_eq);
        stack.set_field(table, "__eq");
    } else {
        stack.push_function(object_index);
        stack.set_field(table, "__index");
        stack.push_function(object_newindex);
        stack.set_field(table, "__newindex");
        for (op, set) in descriptor.operators() {
            let key = (descriptor.type_id(), Scope::Operator, op.host_name().to_string());
            push_callable(ctx, stack, key, || Callable {
                label: format!("{}.{}", descriptor.name(), op.host_name()),
                set: set.clone(),
                receiver: None,
                unary: op.is_unary(),
                closure: false,
            });
            stack.set_field(table, op.slot());
        }
    }
    stack.push_string(descriptor.name());
    stack.set_field(table, "__type");

    let id = stack.create_reference(table);
    stack.pop(1);
    ctx.metatables.borrow_mut().insert(descriptor.type_id(), id);
    tracing::debug!(instance = %ctx.id(), type_name = descriptor.name(), "installed metatable");
    id
}

/// Installs the global binding for a type: a type token for classes, a table
/// of variant values for enumerations.
pub(crate) fn expose(ctx: &InstanceCtx, stack: Stack, descriptor: &Arc<TypeDescriptor>) {
    let metatable = object_metatable(ctx, stack, descriptor);
    if descriptor.is_enum() {
        stack.new_table();
        for (name, make) in descriptor.variants() {
            marshal::push_target(ctx, stack, Target::Object(make()), metatable);
            stack.set_field(-2, name);
        }
        stack.push_string(descriptor.name());
        stack.set_field(-2, "__type");
    } else {
        stack.new_table();
        stack.push_function(type_index);
        stack.set_field(-2, "__index");
        stack.push_function(type_newindex);
        stack.set_field(-2, "__newindex");
        stack.push_string(descriptor.name());
        stack.set_field(-2, "__type");
        let token_metatable = stack.create_reference(-1);
        stack.pop(1);
        marshal::push_target(ctx, stack, Target::Type(descriptor.clone()), token_metatable);
        stack.release_reference(token_metatable);
    }
    stack.set_global(descriptor.name());
    tracing::debug!(instance = %ctx.id(), type_name = descriptor.name(), "exposed type");
}
