//! # Type descriptors
//!
//! A `TypeDescriptor` is the immutable, introspected shape of one host type:
//! its constructors, method groups, fields, properties and operators. It is
//! built once by a `TypeBuilder`, registered once, and then shared read-only by
//! every runtime instance that exposes the type.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::context::CallContext;
use crate::context::CallFrame;
use crate::value::Object;
use crate::value::Value;
use crate::value::short_name;

/// Declared type of one parameter, used for overload resolution and coercion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamType {
    Integer,
    Float,
    Number,
    Boolean,
    String,
    Object { type_id: TypeId, name: &'static str, nullable: bool },
    Function,
    Table,
    Any,
}

impl ParamType {
    /// A reference-typed object parameter; accepts nil.
    pub fn object<T: 'static>() -> Self {
        ParamType::Object {
            type_id: TypeId::of::<T>(),
            name: short_name(std::any::type_name::<T>()),
            nullable: true,
        }
    }

    /// A value-typed enumeration parameter; rejects nil.
    pub fn enumeration<E: 'static>() -> Self {
        ParamType::Object {
            type_id: TypeId::of::<E>(),
            name: short_name(std::any::type_name::<E>()),
            nullable: false,
        }
    }

    /// Whether a nil argument is acceptable for this parameter.
    pub fn permits_nil(&self) -> bool {
        match self {
            ParamType::String | ParamType::Function | ParamType::Table | ParamType::Any => true,
            ParamType::Object { nullable, .. } => *nullable,
            ParamType::Integer | ParamType::Float | ParamType::Number | ParamType::Boolean => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ParamType::Integer => "int",
            ParamType::Float => "float",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::String => "string",
            ParamType::Object { name, .. } => name,
            ParamType::Function => "function",
            ParamType::Table => "table",
            ParamType::Any => "any",
        }
    }
}

pub type Invoke =
    Arc<dyn Fn(&mut CallContext<'_>, Option<&Object>, &CallFrame) -> anyhow::Result<Value> + Send + Sync>;

/// One overload candidate.
#[derive(Clone)]
pub struct Method {
    params: Vec<ParamType>,
    variadic: bool,
    invoke: Invoke,
}

impl Method {
    pub fn new<F>(params: &[ParamType], invoke: F) -> Self
    where
        F: Fn(&mut CallContext<'_>, Option<&Object>, &CallFrame) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self { params: params.to_vec(), variadic: false, invoke: Arc::new(invoke) }
    }

    /// Marks the candidate as accepting any number of trailing arguments.
    pub fn variadic(mut self) -> Self {
        self.variadic = true;
        self
    }

    pub fn params(&self) -> &[ParamType] {
        &self.params
    }

    pub fn is_variadic(&self) -> bool {
        self.variadic
    }

    pub(crate) fn call(
        &self,
        ctx: &mut CallContext<'_>,
        receiver: Option<&Object>,
        frame: &CallFrame,
    ) -> anyhow::Result<Value> {
        (self.invoke)(ctx, receiver, frame)
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<&str> = self.params.iter().map(ParamType::name).collect();
        write!(f, "Method({}{})", params.join(", "), if self.variadic { ", ..." } else { "" })
    }
}

/// All same-named callables of a type and scope, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct MethodCandidateSet {
    name: String,
    candidates: Vec<Method>,
}

impl MethodCandidateSet {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), candidates: Vec::new() }
    }

    pub fn push(&mut self, method: Method) {
        self.candidates.push(method);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn candidates(&self) -> &[Method] {
        &self.candidates
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

pub type Getter = Arc<dyn Fn(Option<&Object>) -> anyhow::Result<Value> + Send + Sync>;
pub type Setter = Arc<dyn Fn(Option<&Object>, Value) -> anyhow::Result<()> + Send + Sync>;

/// Read and write access to a field or property. Static members receive no object.
#[derive(Clone)]
pub struct Accessor {
    ty: ParamType,
    get: Option<Getter>,
    set: Option<Setter>,
}

impl Accessor {
    pub(crate) fn new(ty: ParamType, get: Option<Getter>, set: Option<Setter>) -> Self {
        Self { ty, get, set }
    }

    pub fn ty(&self) -> &ParamType {
        &self.ty
    }

    pub fn is_readable(&self) -> bool {
        self.get.is_some()
    }

    pub fn is_writable(&self) -> bool {
        self.set.is_some()
    }

    /// Reads the member. A write-only member reads as nil.
    pub fn read(&self, object: Option<&Object>) -> anyhow::Result<Value> {
        match &self.get {
            Some(get) => get(object),
            None => Ok(Value::Nil),
        }
    }

    /// Writes the member. Returns whether a setter ran.
    pub fn write(&self, object: Option<&Object>, value: Value) -> anyhow::Result<bool> {
        match &self.set {
            Some(set) => set(object, value).map(|_| true),
            None => Ok(false),
        }
    }
}

/// Operators a type may overload, with their host method names and script slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Eq,
    Lt,
    Le,
}

impl Operator {
    pub const ALL: [Operator; 8] = [
        Operator::Add,
        Operator::Sub,
        Operator::Mul,
        Operator::Div,
        Operator::Neg,
        Operator::Eq,
        Operator::Lt,
        Operator::Le,
    ];

    pub fn host_name(self) -> &'static str {
        match self {
            Operator::Add => "op_Addition",
            Operator::Sub => "op_Subtraction",
            Operator::Mul => "op_Multiply",
            Operator::Div => "op_Division",
            Operator::Neg => "op_UnaryNegation",
            Operator::Eq => "op_Equality",
            Operator::Lt => "op_LessThan",
            Operator::Le => "op_LessThanOrEqual",
        }
    }

    pub fn slot(self) -> &'static str {
        match self {
            Operator::Add => "__add",
            Operator::Sub => "__sub",
            Operator::Mul => "__mul",
            Operator::Div => "__div",
            Operator::Neg => "__unm",
            Operator::Eq => "__eq",
            Operator::Lt => "__lt",
            Operator::Le => "__le",
        }
    }

    pub fn is_unary(self) -> bool {
        self == Operator::Neg
    }
}

pub type VariantFactory = Arc<dyn Fn() -> Object + Send + Sync>;

pub enum TypeKind {
    Class,
    Enum { variants: Vec<(String, VariantFactory)>, eq: fn(&Object, &Object) -> bool },
}

pub struct TypeDescriptor {
    pub(crate) type_id: TypeId,
    pub(crate) name: String,
    pub(crate) kind: TypeKind,
    pub(crate) constructors: Arc<MethodCandidateSet>,
    pub(crate) instance_methods: HashMap<String, Arc<MethodCandidateSet>>,
    pub(crate) static_methods: HashMap<String, Arc<MethodCandidateSet>>,
    pub(crate) instance_fields: HashMap<String, Accessor>,
    pub(crate) instance_properties: HashMap<String, Accessor>,
    pub(crate) static_fields: HashMap<String, Accessor>,
    pub(crate) static_properties: HashMap<String, Accessor>,
    pub(crate) operators: Vec<(Operator, Arc<MethodCandidateSet>)>,
}

impl TypeDescriptor {
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Name under which the type appears to scripts.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enum(&self) -> bool {
        matches!(self.kind, TypeKind::Enum { .. })
    }

    pub fn constructors(&self) -> &Arc<MethodCandidateSet> {
        &self.constructors
    }

    pub fn instance_method(&self, name: &str) -> Option<&Arc<MethodCandidateSet>> {
        self.instance_methods.get(name)
    }

    pub fn static_method(&self, name: &str) -> Option<&Arc<MethodCandidateSet>> {
        self.static_methods.get(name)
    }

    pub fn instance_field(&self, name: &str) -> Option<&Accessor> {
        self.instance_fields.get(name)
    }

    pub fn instance_property(&self, name: &str) -> Option<&Accessor> {
        self.instance_properties.get(name)
    }

    pub fn static_field(&self, name: &str) -> Option<&Accessor> {
        self.static_fields.get(name)
    }

    pub fn static_property(&self, name: &str) -> Option<&Accessor> {
        self.static_properties.get(name)
    }

    /// Implemented operators, in the fixed `Operator::ALL` order.
    pub fn operators(&self) -> &[(Operator, Arc<MethodCandidateSet>)] {
        &self.operators
    }

    pub fn variants(&self) -> &[(String, VariantFactory)] {
        match &self.kind {
            TypeKind::Enum { variants, .. } => variants,
            TypeKind::Class => &[],
        }
    }

    /// Value equality for enumeration instances, identity for everything else.
    pub fn values_equal(&self, a: &Object, b: &Object) -> bool {
        match &self.kind {
            TypeKind::Enum { eq, .. } => eq(a, b),
            TypeKind::Class => a.ptr_eq(b),
        }
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("name", &self.name)
            .field("enum", &self.is_enum())
            .field("constructors", &self.constructors.len())
            .field("instance_methods", &self.instance_methods.len())
            .field("static_methods", &self.static_methods.len())
            .field("operators", &self.operators.iter().map(|(op, _)| *op).collect::<Vec<_>>())
            .finish()
    }
}

/// A host closure exposed to scripts as a single-candidate callable.
#[derive(Clone)]
pub struct HostFunction {
    set: Arc<MethodCandidateSet>,
}

impl HostFunction {
    /// A closure with a fixed parameter list, resolved and coerced like any method.
    pub fn new<F>(name: impl Into<String>, params: &[ParamType], f: F) -> Self
    where
        F: Fn(&mut CallContext<'_>, &CallFrame) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self::from_method(name, Method::new(params, move |ctx, _, frame| f(ctx, frame)))
    }

    /// A closure accepting any arguments, uncoerced.
    pub fn variadic<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut CallContext<'_>, &CallFrame) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self::from_method(name, Method::new(&[], move |ctx, _, frame| f(ctx, frame)).variadic())
    }

    fn from_method(name: impl Into<String>, method: Method) -> Self {
        let mut set = MethodCandidateSet::new(name);
        set.push(method);
        Self { set: Arc::new(set) }
    }

    pub(crate) fn from_candidates(set: Arc<MethodCandidateSet>) -> Self {
        Self { set }
    }

    pub fn name(&self) -> &str {
        self.set.name()
    }

    pub(crate) fn candidates(&self) -> &Arc<MethodCandidateSet> {
        &self.set
    }

    pub fn ptr_eq(&self, other: &HostFunction) -> bool {
        Arc::ptr_eq(&self.set, &other.set)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostFunction({})", self.set.name())
    }
}
