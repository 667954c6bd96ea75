//! # Value marshaling
//!
//! Moves values across the boundary: `push` turns a host `Value` into a stack
//! slot and `read` turns a stack slot into a host `Value`.
//!
//! Host objects, type tokens and callables all travel as opaque userdata
//! holding a `Payload`: a handle into the instance's handle table and a weak
//! link back to that table, so the collector's destructor can free the slot
//! without touching the runtime state.

use std::ffi::c_int;
use std::ffi::c_void;
use std::mem::size_of;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::ptr;

use crate::context::InstanceCtx;
use crate::descriptor::HostFunction;
use crate::dispatch;
use crate::dispatch::Callable;
use crate::dispatch::Target;
use crate::handles;
use crate::handles::Handle;
use crate::handles::InstanceId;
use crate::handles::WeakHandleTable;
use crate::reference::Reference;
use crate::reference::ScriptFunction;
use crate::reference::ScriptTable;
use crate::stack::Kind;
use crate::stack::Stack;
use crate::value::Object;
use crate::value::Value;

const PAYLOAD_MAGIC: u64 = 0x6c75_6175_6269_6e64;

#[repr(C)]
struct Payload {
    magic: u64,
    handle: Handle,
    table: WeakHandleTable<Target>,
}

#[derive(Debug, Clone)]
pub enum Error {
    /// A host object of a type with no descriptor was sent to script.
    UnregisteredType { type_name: String },
    /// A script-held opaque value no longer resolves.
    InvalidHandle(handles::Error),
    /// A pinned reference was pushed into an instance that does not own it.
    ForeignReference { owner: InstanceId, target: InstanceId },
    /// The pinned reference was already released.
    Released,
    /// The stack cannot grow any further.
    StackExhausted,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnregisteredType { type_name } => write!(f, "type '{}' is not a registered type", type_name),
            Self::InvalidHandle(e) => write!(f, "{}", e),
            Self::ForeignReference { owner, target } => {
                write!(f, "reference owned by {} cannot be used in {}", owner, target)
            }
            Self::Released => write!(f, "reference has been released"),
            Self::StackExhausted => write!(f, "script stack exhausted"),
        }
    }
}

impl std::error::Error for Error {}

impl From<handles::Error> for Error {
    fn from(e: handles::Error) -> Self {
        Self::InvalidHandle(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Pushes `value` as exactly one stack slot. Nothing is left on the stack on error.
pub(crate) fn push(ctx: &InstanceCtx, stack: Stack, value: &Value) -> Result<()> {
    if !stack.reserve(2) {
        return Err(Error::StackExhausted);
    }
    match value {
        Value::Nil => stack.push_nil(),
        Value::Boolean(b) => stack.push_boolean(*b),
        Value::Number(n) => stack.push_number(*n),
        Value::Integer(i) => stack.push_number(*i as f64),
        Value::Float(x) => stack.push_number(*x as f64),
        Value::String(s) => stack.push_string(s),
        Value::Object(object) => push_object(ctx, stack, object)?,
        Value::Function(ScriptFunction(reference)) | Value::Table(ScriptTable(reference)) => {
            reference.push(ctx, stack)?
        }
        Value::Closure(function) => push_closure(ctx, stack, function),
    }
    Ok(())
}

pub(crate) fn push_object(ctx: &InstanceCtx, stack: Stack, object: &Object) -> Result<()> {
    let descriptor = ctx
        .registry()
        .get(object.type_id())
        .ok_or_else(|| Error::UnregisteredType { type_name: object.type_name().to_string() })?;
    let metatable = dispatch::object_metatable(ctx, stack, &descriptor);
    push_target(ctx, stack, Target::Object(object.clone()), metatable);
    Ok(())
}

fn push_closure(ctx: &InstanceCtx, stack: Stack, function: &HostFunction) {
    let callable = Callable::closure(function);
    push_target(ctx, stack, Target::Callable(callable.into()), ctx.callable_metatable.get());
}

/// Mints a handle for `target` and pushes it as userdata carrying `metatable`.
pub(crate) fn push_target(ctx: &InstanceCtx, stack: Stack, target: Target, metatable: c_int) {
    let pointer = stack.new_opaque(size_of::<Payload>(), release_payload) as *mut Payload;
    let handle = ctx.handles.create(target);
    unsafe {
        ptr::write(pointer, Payload { magic: PAYLOAD_MAGIC, handle, table: ctx.handles.downgrade() });
    }
    stack.push_reference(metatable);
    stack.set_metatable(-2);
}

unsafe extern "C-unwind" fn release_payload(data: *mut c_void) {
    let payload = unsafe { ptr::read(data as *const Payload) };
    let _ = panic::catch_unwind(AssertUnwindSafe(move || {
        if let Some(table) = payload.table.upgrade() {
            table.destroy(payload.handle);
        }
    }));
}

/// Resolves the userdata at `index` if it is one of ours; other values yield `None`.
pub(crate) fn read_target(ctx: &InstanceCtx, stack: Stack, index: c_int) -> Result<Option<Target>> {
    if stack.kind(index) != Kind::Userdata || stack.opaque_len(index) < size_of::<Payload>() {
        return Ok(None);
    }
    let pointer = stack.to_pointer(index) as *const Payload;
    if pointer.is_null() || unsafe { (*pointer).magic } != PAYLOAD_MAGIC {
        return Ok(None);
    }
    let handle = unsafe { (*pointer).handle };
    Ok(Some(ctx.handles.resolve(handle)?))
}

/// Converts the slot at `index` to a host value. Functions and tables are pinned.
///
/// Type tokens (the globals a type is exposed under) and userdata created
/// outside this crate have no host counterpart and read as `Value::Nil`.
pub(crate) fn read(ctx: &InstanceCtx, stack: Stack, index: c_int) -> Result<Value> {
    let index = stack.absolute(index);
    let value = match stack.kind(index) {
        Kind::None | Kind::Nil | Kind::Other => Value::Nil,
        Kind::Boolean => Value::Boolean(stack.to_boolean(index)),
        Kind::Number => Value::Number(stack.to_number(index)),
        Kind::String => Value::String(stack.to_string_lossy(index).unwrap_or_default()),
        Kind::Function => Value::Function(ScriptFunction(Reference::pin(ctx, stack, index))),
        Kind::Table => Value::Table(ScriptTable(Reference::pin(ctx, stack, index))),
        Kind::Userdata => match read_target(ctx, stack, index)? {
            Some(Target::Object(object)) => Value::Object(object),
            Some(Target::Callable(callable)) => match callable.as_closure() {
                Some(function) => Value::Closure(function),
                None => Value::Function(ScriptFunction(Reference::pin(ctx, stack, index))),
            },
            Some(Target::Type(_)) | None => Value::Nil,
        },
    };
    Ok(value)
}

/// Reads every slot from `first` to the top of the stack.
pub(crate) fn read_from(ctx: &InstanceCtx, stack: Stack, first: c_int) -> Result<Vec<Value>> {
    (first..=stack.top()).map(|index| read(ctx, stack, index)).collect()
}
