//! # Runtime instances
//!
//! A `RuntimeInstance` owns one Luau state together with its handle table and
//! dispatch caches. It moves through `Created → Loaded → Executing → Disposed`;
//! every public operation checks liveness first, and disposal invalidates every
//! handle the instance ever minted.

use std::rc::Rc;
use std::sync::Arc;

use crate::builder::CompileOptions;
use crate::builder::InstanceBuilder;
use crate::context::Globals;
use crate::context::InstanceCtx;
use crate::context::Phase;
use crate::declare::EnumBuilder;
use crate::declare::TypeBuilder;
use crate::descriptor::TypeDescriptor;
use crate::dispatch;
use crate::handles;
use crate::handles::Handle;
use crate::handles::InstanceId;
use crate::marshal;
use crate::reference::ScriptTable;
use crate::registry;
use crate::registry::TypeRegistry;
use crate::stack;
use crate::stack::OK;
use crate::value;
use crate::value::Object;
use crate::value::Value;

#[derive(Debug)]
pub enum Error {
    /// A chunk was already loaded into this instance.
    AlreadyLoaded,
    /// `execute` was called before anything was loaded.
    NotLoaded,
    /// The instance has been disposed.
    Disposed,
    /// The pinned reference was released.
    Released,
    /// The Luau state could not be allocated.
    StateAllocation,
    Compile(String),
    /// The script raised an error, or a host callback failed inside it.
    Script(String),
    Registry(registry::Error),
    Marshal(marshal::Error),
    Handle(handles::Error),
    Value(value::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyLoaded => write!(f, "a chunk is already loaded"),
            Self::NotLoaded => write!(f, "no chunk has been loaded"),
            Self::Disposed => write!(f, "runtime instance has been disposed"),
            Self::Released => write!(f, "reference has been released"),
            Self::StateAllocation => write!(f, "failed to allocate a Luau state"),
            Self::Compile(message) => write!(f, "compile error: {}", message),
            Self::Script(message) => write!(f, "script error: {}", message),
            Self::Registry(e) => write!(f, "registry error: {}", e),
            Self::Marshal(e) => write!(f, "marshal error: {}", e),
            Self::Handle(e) => write!(f, "handle error: {}", e),
            Self::Value(e) => write!(f, "value error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<registry::Error> for Error {
    fn from(e: registry::Error) -> Self {
        Self::Registry(e)
    }
}

impl From<marshal::Error> for Error {
    fn from(e: marshal::Error) -> Self {
        Self::Marshal(e)
    }
}

impl From<handles::Error> for Error {
    fn from(e: handles::Error) -> Self {
        Self::Handle(e)
    }
}

impl From<value::Error> for Error {
    fn from(e: value::Error) -> Self {
        Self::Value(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// One embedded Luau runtime with host types exposed to it.
pub struct RuntimeInstance {
    ctx: Rc<InstanceCtx>,
    options: CompileOptions,
    chunk_name: String,
}

impl RuntimeInstance {
    pub(crate) fn new(ctx: Rc<InstanceCtx>, options: CompileOptions, chunk_name: String) -> Self {
        Self { ctx, options, chunk_name }
    }

    /// An instance with default settings, backed by the process-wide registry.
    pub fn create() -> Result<Self> {
        InstanceBuilder::new().build()
    }

    pub fn builder() -> InstanceBuilder {
        InstanceBuilder::new()
    }

    pub fn id(&self) -> InstanceId {
        self.ctx.id()
    }

    pub fn phase(&self) -> Phase {
        self.ctx.phase()
    }

    pub fn is_live(&self) -> bool {
        self.ctx.is_live()
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        self.ctx.registry()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.ctx.is_live() { Ok(()) } else { Err(Error::Disposed) }
    }

    /// Registers a type with this instance's registry and exposes it to scripts.
    pub fn register<T: 'static>(&self, builder: TypeBuilder<T>) -> Result<Arc<TypeDescriptor>> {
        self.ensure_live()?;
        let descriptor = self.ctx.registry().register(builder)?;
        self.expose_descriptor(&descriptor)?;
        Ok(descriptor)
    }

    pub fn register_enum<E>(&self, builder: EnumBuilder<E>) -> Result<Arc<TypeDescriptor>>
    where
        E: Copy + PartialEq + Send + Sync + 'static,
    {
        self.ensure_live()?;
        let descriptor = self.ctx.registry().register_enum(builder)?;
        self.expose_descriptor(&descriptor)?;
        Ok(descriptor)
    }

    /// Exposes an already registered type. Exposing twice is a no-op.
    pub fn expose<T: 'static>(&self) -> Result<()> {
        self.ensure_live()?;
        let descriptor = self.ctx.registry().lookup::<T>()?;
        self.expose_descriptor(&descriptor)
    }

    fn expose_descriptor(&self, descriptor: &Arc<TypeDescriptor>) -> Result<()> {
        let stack = self.ctx.stack()?;
        if self.ctx.mark_exposed(descriptor.type_id()) {
            dispatch::expose(&self.ctx, stack, descriptor);
        }
        Ok(())
    }

    /// Compiles source with this instance's compiler settings.
    pub fn compile(&self, source: &str) -> Result<Vec<u8>> {
        self.ensure_live()?;
        stack::compile(source, &self.options).map_err(Error::Compile)
    }

    /// Compiles and loads the instance's single chunk.
    pub fn load(&self, source: &str) -> Result<()> {
        self.ensure_live()?;
        if self.ctx.chunk().is_some() {
            return Err(Error::AlreadyLoaded);
        }
        let bytecode = self.compile(source)?;
        let chunk_name = self.chunk_name.clone();
        self.load_bytecode(&bytecode, &chunk_name)
    }

    /// Loads precompiled bytecode as the instance's single chunk.
    pub fn load_bytecode(&self, bytecode: &[u8], chunk_name: &str) -> Result<()> {
        let stack = self.ctx.stack()?;
        if self.ctx.chunk().is_some() {
            return Err(Error::AlreadyLoaded);
        }
        if stack.load(chunk_name, bytecode) != OK {
            let message = stack.error_message();
            stack.pop(1);
            return Err(Error::Compile(message));
        }
        let chunk = stack.create_reference(-1);
        stack.pop(1);
        self.ctx.set_chunk(chunk);
        tracing::debug!(instance = %self.id(), chunk = chunk_name, bytes = bytecode.len(), "loaded chunk");
        Ok(())
    }

    /// Runs the loaded chunk and returns everything it returned.
    pub fn execute(&self) -> Result<Vec<Value>> {
        let stack = self.ctx.stack()?;
        let chunk = self.ctx.chunk().ok_or(Error::NotLoaded)?;
        let base = stack.top();
        stack.push_reference(chunk);
        self.ctx.run_protected(stack, base, 0)
    }

    pub fn globals(&self) -> Globals<'_> {
        Globals::new(&self.ctx)
    }

    pub fn create_table(&self) -> Result<ScriptTable> {
        self.ctx.create_table()
    }

    /// Mints a handle for a host object without handing it to a script.
    pub fn create_handle(&self, object: Object) -> Result<Handle> {
        self.ensure_live()?;
        Ok(self.ctx.handles.create(dispatch::Target::Object(object)))
    }

    /// Resolves a handle minted by this instance back to its object.
    pub fn resolve_handle(&self, handle: Handle) -> Result<Object> {
        match self.ctx.handles.resolve(handle)? {
            dispatch::Target::Object(object) => Ok(object),
            _ => Err(Error::Value(value::Error::TypeMismatch { expected: "object", found: "internal value".to_string() })),
        }
    }

    /// Releases a handle. Destroying a handle twice is a no-op.
    pub fn destroy_handle(&self, handle: Handle) -> bool {
        self.ctx.handles.destroy(handle)
    }

    /// Number of live handles, including those held by scripts.
    pub fn live_handles(&self) -> usize {
        self.ctx.handles.len()
    }

    /// Runs a full collection cycle. Handles held only by unreachable script
    /// values are released by their finalizers.
    pub fn collect_garbage(&self) -> Result<()> {
        let stack = self.ctx.stack()?;
        stack.collect_garbage();
        Ok(())
    }

    /// Number of script values currently pinned by host references.
    pub fn pinned_references(&self) -> usize {
        self.ctx.pinned()
    }

    /// Adds or replaces a typed application data value.
    pub fn insert_app_data<T: 'static>(&self, value: T) -> Option<T> {
        self.ctx.insert_app_data(value)
    }

    /// Invalidates every handle and reference and closes the Luau state. Idempotent.
    pub fn dispose(&mut self) {
        self.ctx.dispose();
    }
}

impl Drop for RuntimeInstance {
    fn drop(&mut self) {
        self.dispose();
    }
}
