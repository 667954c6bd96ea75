//! # luaubind
//!
//! Exposes Rust types, methods and closures to embedded Luau scripts.
//!
//! Types are described once with a [`TypeBuilder`] and registered in a
//! [`TypeRegistry`]; each [`RuntimeInstance`] then exposes them as globals.
//! Scripts only ever hold opaque, generation-checked handles to host objects,
//! and every attribute access or call is routed back through a small set of
//! native callbacks that resolve overloads and marshal values.
//!
//! ```ignore
//! let mut instance = RuntimeInstance::create()?;
//! instance.register(vector_type())?;
//! instance.load("local v = Vector.New(3, 4) return v:Length()")?;
//! assert_eq!(instance.execute()?, vec![Value::Number(5.0)]);
//! ```

pub mod builder;
pub mod context;
pub mod declare;
pub mod descriptor;
pub mod dispatch;
pub mod handles;
pub mod instance;
pub mod marshal;
pub mod reference;
pub mod registry;
pub mod resolve;
pub mod value;

mod stack;

pub use builder::CompileOptions;
pub use builder::InstanceBuilder;
pub use context::CallContext;
pub use context::CallFrame;
pub use context::Globals;
pub use context::Phase;
pub use declare::EnumBuilder;
pub use declare::TypeBuilder;
pub use descriptor::HostFunction;
pub use descriptor::Operator;
pub use descriptor::ParamType;
pub use descriptor::TypeDescriptor;
pub use handles::Handle;
pub use handles::InstanceId;
pub use instance::Error;
pub use instance::Result;
pub use instance::RuntimeInstance;
pub use reference::ScriptFunction;
pub use reference::ScriptTable;
pub use registry::TypeRegistry;
pub use value::FromValue;
pub use value::Object;
pub use value::Value;
