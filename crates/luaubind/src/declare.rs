//! # Declaring types
//!
//! Host types describe themselves to scripts through a fluent `TypeBuilder`.
//! Every declared member becomes part of the type's descriptor; same-named
//! methods accumulate into one overload group in declaration order.
//!
//! ```ignore
//! let vector = TypeBuilder::<Vector>::new("Vector")
//!     .constructor(&[ParamType::Float, ParamType::Float], |_, frame| {
//!         Ok(Vector { x: frame.get(0)?, y: frame.get(1)? })
//!     })
//!     .method("Length", &[], |v, _, _| Ok(Value::from((v.x * v.x + v.y * v.y).sqrt())))
//!     .field("x", ParamType::Float, |v| Value::from(v.x), |v, x| {
//!         v.x = x.get()?;
//!         Ok(())
//!     });
//! ```

use std::any::TypeId;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::anyhow;

use crate::context::CallContext;
use crate::context::CallFrame;
use crate::descriptor::Accessor;
use crate::descriptor::Getter;
use crate::descriptor::Method;
use crate::descriptor::MethodCandidateSet;
use crate::descriptor::Operator;
use crate::descriptor::ParamType;
use crate::descriptor::Setter;
use crate::descriptor::TypeDescriptor;
use crate::descriptor::TypeKind;
use crate::descriptor::VariantFactory;
use crate::value::Object;
use crate::value::Value;

fn receiver<'a>(type_name: &str, member: &str, receiver: Option<&'a Object>) -> anyhow::Result<&'a Object> {
    receiver.ok_or_else(|| anyhow!("'{}.{}' requires an instance", type_name, member))
}

fn accumulate(groups: &mut HashMap<String, MethodCandidateSet>, name: String, method: Method) {
    groups.entry(name.clone()).or_insert_with(|| MethodCandidateSet::new(name)).push(method);
}

fn freeze(groups: HashMap<String, MethodCandidateSet>) -> HashMap<String, Arc<MethodCandidateSet>> {
    groups.into_iter().map(|(name, set)| (name, Arc::new(set))).collect()
}

/// Fluent declaration of a host type's script-visible surface.
pub struct TypeBuilder<T> {
    name: String,
    constructors: MethodCandidateSet,
    instance_methods: HashMap<String, MethodCandidateSet>,
    static_methods: HashMap<String, MethodCandidateSet>,
    instance_fields: HashMap<String, Accessor>,
    instance_properties: HashMap<String, Accessor>,
    static_fields: HashMap<String, Accessor>,
    static_properties: HashMap<String, Accessor>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> TypeBuilder<T> {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            constructors: MethodCandidateSet::new(format!("{}.New", name)),
            name,
            instance_methods: HashMap::new(),
            static_methods: HashMap::new(),
            instance_fields: HashMap::new(),
            instance_properties: HashMap::new(),
            static_fields: HashMap::new(),
            static_properties: HashMap::new(),
            _marker: PhantomData,
        }
    }

    /// Adds a constructor overload, reachable from scripts as `Type.New(...)`.
    pub fn constructor<F>(mut self, params: &[ParamType], f: F) -> Self
    where
        F: Fn(&mut CallContext<'_>, &CallFrame) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.constructors.push(Method::new(params, move |ctx, _, frame| {
            f(ctx, frame).map(|value| Value::Object(Object::new(value)))
        }));
        self
    }

    /// Adds an instance method overload that reads the receiver.
    pub fn method<F>(mut self, name: impl Into<String>, params: &[ParamType], f: F) -> Self
    where
        F: Fn(&T, &mut CallContext<'_>, &CallFrame) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let name = name.into();
        let (type_name, member) = (self.name.clone(), name.clone());
        let method = Method::new(params, move |ctx, this, frame| {
            let this = receiver(&type_name, &member, this)?;
            let this = this.borrow::<T>()?;
            f(&this, ctx, frame)
        });
        accumulate(&mut self.instance_methods, name, method);
        self
    }

    /// Adds an instance method overload that mutates the receiver.
    pub fn method_mut<F>(mut self, name: impl Into<String>, params: &[ParamType], f: F) -> Self
    where
        F: Fn(&mut T, &mut CallContext<'_>, &CallFrame) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let name = name.into();
        let (type_name, member) = (self.name.clone(), name.clone());
        let method = Method::new(params, move |ctx, this, frame| {
            let this = receiver(&type_name, &member, this)?;
            let mut this = this.borrow_mut::<T>()?;
            f(&mut this, ctx, frame)
        });
        accumulate(&mut self.instance_methods, name, method);
        self
    }

    /// Adds an instance method overload that takes any trailing arguments.
    pub fn method_variadic<F>(mut self, name: impl Into<String>, params: &[ParamType], f: F) -> Self
    where
        F: Fn(&T, &mut CallContext<'_>, &CallFrame) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let name = name.into();
        let (type_name, member) = (self.name.clone(), name.clone());
        let method = Method::new(params, move |ctx, this, frame| {
            let this = receiver(&type_name, &member, this)?;
            let this = this.borrow::<T>()?;
            f(&this, ctx, frame)
        })
        .variadic();
        accumulate(&mut self.instance_methods, name, method);
        self
    }

    pub fn static_method<F>(mut self, name: impl Into<String>, params: &[ParamType], f: F) -> Self
    where
        F: Fn(&mut CallContext<'_>, &CallFrame) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let method = Method::new(params, move |ctx, _, frame| f(ctx, frame));
        accumulate(&mut self.static_methods, name.into(), method);
        self
    }

    /// Declares an operator overload. It lives in the static group named by
    /// `Operator::host_name` and is wired into the matching metatable slot.
    pub fn operator<F>(self, op: Operator, params: &[ParamType], f: F) -> Self
    where
        F: Fn(&mut CallContext<'_>, &CallFrame) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.static_method(op.host_name(), params, f)
    }

    /// A plain data member: always readable and writable.
    pub fn field<G, S>(mut self, name: impl Into<String>, ty: ParamType, get: G, set: S) -> Self
    where
        G: Fn(&T) -> Value + Send + Sync + 'static,
        S: Fn(&mut T, Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        let accessor = self.instance_accessor(&name, ty, Some(move |this: &T| Ok::<Value, anyhow::Error>(get(this))), Some(set));
        self.instance_fields.insert(name, accessor);
        self
    }

    /// A computed member with a getter and a setter.
    pub fn property<G, S>(mut self, name: impl Into<String>, ty: ParamType, get: G, set: S) -> Self
    where
        G: Fn(&T) -> anyhow::Result<Value> + Send + Sync + 'static,
        S: Fn(&mut T, Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        let accessor = self.instance_accessor(&name, ty, Some(get), Some(set));
        self.instance_properties.insert(name, accessor);
        self
    }

    pub fn readonly_property<G>(mut self, name: impl Into<String>, ty: ParamType, get: G) -> Self
    where
        G: Fn(&T) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let name = name.into();
        let accessor = self.instance_accessor(&name, ty, Some(get), None::<fn(&mut T, Value) -> anyhow::Result<()>>);
        self.instance_properties.insert(name, accessor);
        self
    }

    pub fn writeonly_property<S>(mut self, name: impl Into<String>, ty: ParamType, set: S) -> Self
    where
        S: Fn(&mut T, Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        let accessor = self.instance_accessor(&name, ty, None::<fn(&T) -> anyhow::Result<Value>>, Some(set));
        self.instance_properties.insert(name, accessor);
        self
    }

    pub fn static_field<G, S>(mut self, name: impl Into<String>, ty: ParamType, get: G, set: S) -> Self
    where
        G: Fn() -> Value + Send + Sync + 'static,
        S: Fn(Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let accessor = Accessor::new(
            ty,
            Some(Arc::new(move |_: Option<&Object>| Ok::<Value, anyhow::Error>(get()))),
            Some(Arc::new(move |_: Option<&Object>, value: Value| set(value))),
        );
        self.static_fields.insert(name.into(), accessor);
        self
    }

    pub fn static_property<G>(mut self, name: impl Into<String>, ty: ParamType, get: G) -> Self
    where
        G: Fn() -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let accessor = Accessor::new(ty, Some(Arc::new(move |_: Option<&Object>| get())), None);
        self.static_properties.insert(name.into(), accessor);
        self
    }

    fn instance_accessor<G, S>(&self, member: &str, ty: ParamType, get: Option<G>, set: Option<S>) -> Accessor
    where
        G: Fn(&T) -> anyhow::Result<Value> + Send + Sync + 'static,
        S: Fn(&mut T, Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let get = get.map(|get| {
            let (type_name, member) = (self.name.clone(), member.to_string());
            Arc::new(move |this: Option<&Object>| {
                let this = receiver(&type_name, &member, this)?;
                let this = this.borrow::<T>()?;
                get(&this)
            }) as Getter
        });
        let set = set.map(|set| {
            let (type_name, member) = (self.name.clone(), member.to_string());
            Arc::new(move |this: Option<&Object>, value: Value| {
                let this = receiver(&type_name, &member, this)?;
                let mut this = this.borrow_mut::<T>()?;
                set(&mut this, value)
            }) as Setter
        });
        Accessor::new(ty, get, set)
    }

    pub fn build(self) -> TypeDescriptor {
        let static_methods = freeze(self.static_methods);
        let operators = Operator::ALL
            .iter()
            .filter_map(|op| static_methods.get(op.host_name()).map(|set| (*op, set.clone())))
            .collect();
        TypeDescriptor {
            type_id: TypeId::of::<T>(),
            name: self.name,
            kind: TypeKind::Class,
            constructors: Arc::new(self.constructors),
            instance_methods: freeze(self.instance_methods),
            static_methods,
            instance_fields: self.instance_fields,
            instance_properties: self.instance_properties,
            static_fields: self.static_fields,
            static_properties: self.static_properties,
            operators,
        }
    }
}

/// Declaration of an enumeration: a fixed set of named values compared by value.
pub struct EnumBuilder<E> {
    name: String,
    variants: Vec<(String, VariantFactory)>,
    _marker: PhantomData<fn() -> E>,
}

fn enum_eq<E: PartialEq + 'static>(a: &Object, b: &Object) -> bool {
    match (a.borrow::<E>(), b.borrow::<E>()) {
        (Ok(a), Ok(b)) => *a == *b,
        _ => false,
    }
}

impl<E> EnumBuilder<E>
where
    E: Copy + PartialEq + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), variants: Vec::new(), _marker: PhantomData }
    }

    pub fn variant(mut self, name: impl Into<String>, value: E) -> Self {
        self.variants.push((name.into(), Arc::new(move || Object::new(value))));
        self
    }

    pub fn build(self) -> TypeDescriptor {
        TypeDescriptor {
            type_id: TypeId::of::<E>(),
            constructors: Arc::new(MethodCandidateSet::new(format!("{}.New", self.name))),
            name: self.name,
            kind: TypeKind::Enum { variants: self.variants, eq: enum_eq::<E> },
            instance_methods: HashMap::new(),
            static_methods: HashMap::new(),
            instance_fields: HashMap::new(),
            instance_properties: HashMap::new(),
            static_fields: HashMap::new(),
            static_properties: HashMap::new(),
            operators: Vec::new(),
        }
    }
}
