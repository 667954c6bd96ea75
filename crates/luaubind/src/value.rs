//! # Host values
//!
//! `Value` is the host-side image of anything that crosses the script boundary.
//! Primitives are copied; host objects travel as shared, type-erased `Object`s;
//! script functions and tables travel as pinned references.

use std::any::Any;
use std::any::TypeId;
use std::cell::Ref;
use std::cell::RefCell;
use std::cell::RefMut;
use std::fmt;
use std::rc::Rc;

use crate::descriptor::HostFunction;
use crate::reference::ScriptFunction;
use crate::reference::ScriptTable;

/// Value conversion errors.
#[derive(Debug, Clone)]
pub enum Error {
    /// The value is not of the requested kind.
    TypeMismatch { expected: &'static str, found: String },
    /// The object is already borrowed in a conflicting way.
    Borrowed { type_name: &'static str },
    /// The call frame holds fewer arguments than requested.
    MissingArgument { index: usize },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::TypeMismatch { expected, found } => write!(f, "expected {}, found {}", expected, found),
            Error::Borrowed { type_name } => write!(f, "object of type '{}' is already borrowed", type_name),
            Error::MissingArgument { index } => write!(f, "missing argument #{}", index + 1),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Strips the module path from a Rust type name, keeping generic arguments intact.
pub(crate) fn short_name(full: &'static str) -> &'static str {
    let head = full.find('<').unwrap_or(full.len());
    match full[..head].rfind("::") {
        Some(i) => &full[i + 2..],
        None => full,
    }
}

/// A shared host object.
///
/// Clones share the same underlying value; the handle table and any number of
/// host `Value`s may hold the object at once.
#[derive(Clone)]
pub struct Object {
    cell: Rc<dyn Any>,
    type_id: TypeId,
    type_name: &'static str,
}

impl Object {
    pub fn new<T: 'static>(value: T) -> Self {
        Self {
            cell: Rc::new(RefCell::new(value)),
            type_id: TypeId::of::<T>(),
            type_name: short_name(std::any::type_name::<T>()),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Rust name of the wrapped type, without its module path.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    fn cell<T: 'static>(&self) -> Result<&RefCell<T>> {
        self.cell.downcast_ref::<RefCell<T>>().ok_or_else(|| Error::TypeMismatch {
            expected: short_name(std::any::type_name::<T>()),
            found: self.type_name.to_string(),
        })
    }

    pub fn borrow<T: 'static>(&self) -> Result<Ref<'_, T>> {
        self.cell::<T>()?
            .try_borrow()
            .map_err(|_| Error::Borrowed { type_name: self.type_name })
    }

    pub fn borrow_mut<T: 'static>(&self) -> Result<RefMut<'_, T>> {
        self.cell::<T>()?
            .try_borrow_mut()
            .map_err(|_| Error::Borrowed { type_name: self.type_name })
    }

    /// Whether both handles point at the same object.
    pub fn ptr_eq(&self, other: &Object) -> bool {
        Rc::as_ptr(&self.cell) as *const () == Rc::as_ptr(&other.cell) as *const ()
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Object({} @ {:p})", self.type_name, Rc::as_ptr(&self.cell) as *const ())
    }
}

/// A value on the host side of the boundary.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Boolean(bool),
    Number(f64),
    Integer(i32),
    Float(f32),
    String(String),
    Object(Object),
    Function(ScriptFunction),
    Table(ScriptTable),
    Closure(HostFunction),
}

impl Value {
    /// Name used for this value's kind in diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Number(_) | Value::Integer(_) | Value::Float(_) => "number",
            Value::String(_) => "string",
            Value::Object(object) => object.type_name(),
            Value::Function(_) | Value::Closure(_) => "function",
            Value::Table(_) => "table",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Integer(i) => Some(*i as f64),
            Value::Float(x) => Some(*x as f64),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(object) => Some(object),
            _ => None,
        }
    }

    /// Textual rendering used when a string is expected but something else arrived.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::Nil => None,
            Value::Boolean(b) => Some(b.to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Integer(i) => Some(i.to_string()),
            Value::Float(x) => Some(x.to_string()),
            Value::String(s) => Some(s.clone()),
            other => Some(other.kind_name().to_string()),
        }
    }

    pub fn get<T: FromValue>(&self) -> Result<T> {
        T::from_value(self)
    }

    fn mismatch(&self, expected: &'static str) -> Error {
        Error::TypeMismatch { expected, found: self.kind_name().to_string() }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::Function(a), Value::Function(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => a == b,
            (Value::Closure(a), Value::Closure(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "Nil"),
            Value::Boolean(b) => write!(f, "Boolean({})", b),
            Value::Number(n) => write!(f, "Number({})", n),
            Value::Integer(i) => write!(f, "Integer({})", i),
            Value::Float(x) => write!(f, "Float({})", x),
            Value::String(s) => write!(f, "String({:?})", s),
            Value::Object(o) => write!(f, "{:?}", o),
            Value::Function(func) => write!(f, "{:?}", func),
            Value::Table(table) => write!(f, "{:?}", table),
            Value::Closure(closure) => write!(f, "Closure({:?})", closure.name()),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Float(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Object> for Value {
    fn from(value: Object) -> Self {
        Value::Object(value)
    }
}

impl From<ScriptFunction> for Value {
    fn from(value: ScriptFunction) -> Self {
        Value::Function(value)
    }
}

impl From<ScriptTable> for Value {
    fn from(value: ScriptTable) -> Self {
        Value::Table(value)
    }
}

impl From<HostFunction> for Value {
    fn from(value: HostFunction) -> Self {
        Value::Closure(value)
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Nil
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Nil, Into::into)
    }
}

/// Extraction of a typed host value from a `Value`.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self>;
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Boolean(b) => Ok(*b),
            other => Err(other.mismatch("boolean")),
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_number().ok_or_else(|| value.mismatch("number"))
    }
}

impl FromValue for f32 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Float(x) => Ok(*x),
            other => other.as_number().map(|n| n as f32).ok_or_else(|| other.mismatch("number")),
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Integer(i) => Ok(*i),
            other => other.as_number().map(|n| n as i32).ok_or_else(|| other.mismatch("integer")),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(s.clone()),
            other => Err(other.mismatch("string")),
        }
    }
}

impl FromValue for Object {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Object(o) => Ok(o.clone()),
            other => Err(other.mismatch("object")),
        }
    }
}

impl FromValue for ScriptFunction {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Function(f) => Ok(f.clone()),
            other => Err(other.mismatch("function")),
        }
    }
}

impl FromValue for ScriptTable {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Table(t) => Ok(t.clone()),
            other => Err(other.mismatch("table")),
        }
    }
}

impl FromValue for HostFunction {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Closure(c) => Ok(c.clone()),
            other => Err(other.mismatch("function")),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Nil => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Point {
        x: i32,
    }

    #[test]
    fn test_short_name() {
        assert_eq!(short_name("my_crate::geometry::Vector"), "Vector");
        assert_eq!(short_name("Vector"), "Vector");
        assert_eq!(short_name("alloc::vec::Vec<core::option::Option<u8>>"), "Vec<core::option::Option<u8>>");
    }

    #[test]
    fn test_object_borrow() {
        let object = Object::new(Point { x: 1 });
        assert!(object.is::<Point>());
        assert_eq!(object.type_name(), "Point");

        object.borrow_mut::<Point>().unwrap().x = 7;
        assert_eq!(object.borrow::<Point>().unwrap().x, 7);

        let _guard = object.borrow_mut::<Point>().unwrap();
        assert!(matches!(object.borrow::<Point>(), Err(Error::Borrowed { .. })));
    }

    #[test]
    fn test_object_wrong_type() {
        let object = Object::new(Point { x: 1 });
        match object.borrow::<String>() {
            Err(Error::TypeMismatch { expected, found }) => {
                assert_eq!(expected, "String");
                assert_eq!(found, "Point");
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("borrowed a Point as a String"),
        }
    }

    #[test]
    fn test_object_identity() {
        let a = Object::new(Point { x: 1 });
        let b = a.clone();
        let c = Object::new(Point { x: 1 });
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
        assert_eq!(Value::Object(a.clone()), Value::Object(b));
        assert_ne!(Value::Object(a), Value::Object(c));
    }

    #[test]
    fn test_numeric_extraction() {
        assert_eq!(Value::Number(2.9).get::<i32>().unwrap(), 2);
        assert_eq!(Value::Number(-2.9).get::<i32>().unwrap(), -2);
        assert_eq!(Value::Number(1.5).get::<f32>().unwrap(), 1.5);
        assert_eq!(Value::Integer(3).get::<f64>().unwrap(), 3.0);
        assert!(Value::from("3").get::<f64>().is_err());
    }

    #[test]
    fn test_option_extraction() {
        assert_eq!(Value::Nil.get::<Option<String>>().unwrap(), None);
        assert_eq!(Value::from("hi").get::<Option<String>>().unwrap(), Some("hi".to_string()));
        assert!(Value::Boolean(true).get::<Option<String>>().is_err());
    }

    #[test]
    fn test_text_fallback() {
        assert_eq!(Value::Number(3.0).to_text().as_deref(), Some("3"));
        assert_eq!(Value::Number(1.5).to_text().as_deref(), Some("1.5"));
        assert_eq!(Value::Boolean(false).to_text().as_deref(), Some("false"));
        assert_eq!(Value::Object(Object::new(Point { x: 0 })).to_text().as_deref(), Some("Point"));
        assert_eq!(Value::Nil.to_text(), None);
    }
}
