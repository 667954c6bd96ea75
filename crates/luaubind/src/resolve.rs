//! # Overload resolution
//!
//! Picks the candidate to invoke for a call: the first candidate, in
//! declaration order, whose arity and parameter kinds accept the marshaled
//! arguments. There is no specificity ranking; an earlier candidate that
//! accepts the call always wins over a later, more precise one.
//!
//! Once a candidate is chosen its arguments are coerced to the declared
//! parameter types (number narrowing, textual fallback for strings).

use crate::descriptor::Method;
use crate::descriptor::MethodCandidateSet;
use crate::descriptor::ParamType;
use crate::value::Value;

/// Whether a single argument is acceptable for a declared parameter.
pub fn accepts(param: &ParamType, arg: &Value) -> bool {
    match (param, arg) {
        (ParamType::Any, _) => true,
        (param, Value::Nil) => param.permits_nil(),
        (ParamType::Integer | ParamType::Float | ParamType::Number, Value::Number(_))
        | (ParamType::Integer | ParamType::Float | ParamType::Number, Value::Integer(_))
        | (ParamType::Integer | ParamType::Float | ParamType::Number, Value::Float(_)) => true,
        (ParamType::Boolean, Value::Boolean(_)) => true,
        (ParamType::String, Value::String(_)) => true,
        (ParamType::Object { type_id, .. }, Value::Object(object)) => object.type_id() == *type_id,
        (ParamType::Function, Value::Function(_)) => true,
        (ParamType::Table, Value::Table(_)) => true,
        _ => false,
    }
}

fn arity_matches(method: &Method, count: usize) -> bool {
    if method.is_variadic() {
        count >= method.params().len()
    } else {
        count == method.params().len()
    }
}

/// Returns the first applicable candidate, if any.
pub fn resolve<'a>(set: &'a MethodCandidateSet, args: &[Value]) -> Option<&'a Method> {
    let chosen = set.candidates().iter().find(|method| {
        arity_matches(method, args.len()) && method.params().iter().zip(args).all(|(param, arg)| accepts(param, arg))
    });
    tracing::trace!(group = set.name(), candidates = set.len(), arguments = args.len(), found = chosen.is_some(), "resolved overload");
    chosen
}

/// Converts an accepted argument to the exact representation its parameter declares.
pub fn coerce(param: &ParamType, arg: Value) -> Value {
    match (param, arg) {
        (ParamType::Integer, arg @ (Value::Number(_) | Value::Float(_))) => {
            Value::Integer(arg.as_number().unwrap_or_default() as i32)
        }
        (ParamType::Float, arg @ (Value::Number(_) | Value::Integer(_))) => {
            Value::Float(arg.as_number().unwrap_or_default() as f32)
        }
        (ParamType::Number, arg @ (Value::Integer(_) | Value::Float(_))) => {
            Value::Number(arg.as_number().unwrap_or_default())
        }
        (ParamType::String, arg @ (Value::String(_) | Value::Nil)) => arg,
        (ParamType::String, arg) => arg.to_text().map(Value::String).unwrap_or(Value::Nil),
        (_, arg) => arg,
    }
}

/// Coerces a whole argument list for the chosen candidate. Variadic extras pass through.
pub(crate) fn coerce_all(method: &Method, args: Vec<Value>) -> Vec<Value> {
    let params = method.params();
    args.into_iter()
        .enumerate()
        .map(|(index, arg)| match params.get(index) {
            Some(param) => coerce(param, arg),
            None => arg,
        })
        .collect()
}

/// Renders argument kinds for diagnostics, e.g. `number, string`.
pub(crate) fn describe_arguments(args: &[Value]) -> String {
    args.iter().map(Value::kind_name).collect::<Vec<_>>().join(", ")
}
