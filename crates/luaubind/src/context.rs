//! # Instance context
//!
//! `InstanceCtx` is the state one runtime instance shares between the host API
//! and the native callbacks the runtime invokes: the Luau state itself, the
//! handle table, cached metatables, pinned references and application data.
//! Callbacks find it through a light pointer stored in the Luau registry.
//!
//! `CallContext` is the view of that state handed to host member
//! implementations while they run.

use std::any::TypeId;
use std::cell::Cell;
use std::cell::Ref;
use std::cell::RefCell;
use std::cell::RefMut;
use std::collections::HashMap;
use std::collections::HashSet;
use std::ffi::c_int;
use std::ffi::c_void;
use std::rc::Rc;
use std::rc::Weak;
use std::sync::Arc;

use anymap::AnyMap;

use crate::dispatch::CallableKey;
use crate::dispatch::Target;
use crate::handles::HandleTable;
use crate::handles::InstanceId;
use crate::instance::Error;
use crate::instance::Result;
use crate::marshal;
use crate::reference::Reference;
use crate::reference::ScriptFunction;
use crate::reference::ScriptTable;
use crate::registry::TypeRegistry;
use crate::stack::MULTRET;
use crate::stack::OK;
use crate::stack::REGISTRY;
use crate::stack::Stack;
use crate::value::FromValue;
use crate::value::Object;
use crate::value::Value;

const CONTEXT_KEY: &str = "luaubind.context";

/// Lifecycle of a runtime instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Created,
    Loaded,
    Executing,
    Disposed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Created => write!(f, "created"),
            Phase::Loaded => write!(f, "loaded"),
            Phase::Executing => write!(f, "executing"),
            Phase::Disposed => write!(f, "disposed"),
        }
    }
}

pub(crate) struct InstanceCtx {
    id: InstanceId,
    stack: Cell<Option<Stack>>,
    live: Cell<bool>,
    phase: Cell<Phase>,
    depth: Cell<u32>,
    close_pending: Cell<bool>,
    registry: Arc<TypeRegistry>,
    pub(crate) handles: HandleTable<Target>,
    pub(crate) metatables: RefCell<HashMap<TypeId, c_int>>,
    pub(crate) callables: RefCell<HashMap<CallableKey, c_int>>,
    pub(crate) callable_metatable: Cell<c_int>,
    exposed: RefCell<HashSet<TypeId>>,
    chunk: Cell<Option<c_int>>,
    pinned: Cell<usize>,
    released: RefCell<Vec<c_int>>,
    app_data: RefCell<AnyMap>,
    self_ref: Weak<InstanceCtx>,
}

impl InstanceCtx {
    /// Creates the context for a freshly opened state and links the state back to it.
    pub(crate) fn install(stack: Stack, registry: Arc<TypeRegistry>, app_data: AnyMap) -> Rc<Self> {
        let id = InstanceId::next();
        let ctx = Rc::new_cyclic(|self_ref| Self {
            id,
            stack: Cell::new(Some(stack)),
            live: Cell::new(true),
            phase: Cell::new(Phase::Created),
            depth: Cell::new(0),
            close_pending: Cell::new(false),
            registry,
            handles: HandleTable::new(id),
            metatables: RefCell::new(HashMap::new()),
            callables: RefCell::new(HashMap::new()),
            callable_metatable: Cell::new(0),
            exposed: RefCell::new(HashSet::new()),
            chunk: Cell::new(None),
            pinned: Cell::new(0),
            released: RefCell::new(Vec::new()),
            app_data: RefCell::new(app_data),
            self_ref: self_ref.clone(),
        });
        stack.push_pointer(Rc::as_ptr(&ctx) as *mut c_void);
        stack.set_field(REGISTRY, CONTEXT_KEY);
        ctx
    }

    /// Finds the context owning the state a callback was invoked on.
    ///
    /// # Safety
    /// The state must have been set up by `install`, and the owning
    /// `RuntimeInstance` must outlive the returned reference. Both hold for
    /// callbacks, which only run while the host is inside a runtime call.
    pub(crate) unsafe fn from_stack<'a>(stack: Stack) -> Option<&'a InstanceCtx> {
        stack.get_field(REGISTRY, CONTEXT_KEY);
        let pointer = stack.to_pointer(-1) as *const InstanceCtx;
        stack.pop(1);
        if pointer.is_null() { None } else { Some(unsafe { &*pointer }) }
    }

    pub(crate) fn id(&self) -> InstanceId {
        self.id
    }

    pub(crate) fn is_live(&self) -> bool {
        self.live.get()
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase.get()
    }

    pub(crate) fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub(crate) fn weak(&self) -> Weak<InstanceCtx> {
        self.self_ref.clone()
    }

    /// The live state, after releasing any references dropped since the last call.
    pub(crate) fn stack(&self) -> Result<Stack> {
        match self.stack.get() {
            Some(stack) if self.is_live() => {
                self.flush_released(stack);
                Ok(stack)
            }
            _ => Err(Error::Disposed),
        }
    }

    pub(crate) fn flush_released(&self, stack: Stack) {
        let released = std::mem::take(&mut *self.released.borrow_mut());
        for id in released {
            stack.release_reference(id);
        }
    }

    pub(crate) fn note_pinned(&self) {
        self.pinned.set(self.pinned.get() + 1);
    }

    pub(crate) fn note_unpinned(&self) {
        self.pinned.set(self.pinned.get().saturating_sub(1));
    }

    pub(crate) fn pinned(&self) -> usize {
        self.pinned.get()
    }

    /// Queues a reference for release at the next safe point. References may be
    /// dropped from inside collector finalizers, where the state must not be touched.
    pub(crate) fn defer_release(&self, id: c_int) {
        self.note_unpinned();
        if self.is_live() {
            self.released.borrow_mut().push(id);
        }
    }

    /// Records `type_id` as exposed; returns false if it already was.
    pub(crate) fn mark_exposed(&self, type_id: TypeId) -> bool {
        self.exposed.borrow_mut().insert(type_id)
    }

    pub(crate) fn chunk(&self) -> Option<c_int> {
        self.chunk.get()
    }

    pub(crate) fn set_chunk(&self, id: c_int) {
        self.chunk.set(Some(id));
        self.phase.set(Phase::Loaded);
    }

    /// Runs the callable sitting below `nargs` arguments on top of `base`, and
    /// collects everything it returned.
    pub(crate) fn run_protected(&self, stack: Stack, base: c_int, nargs: c_int) -> Result<Vec<Value>> {
        let previous = self.phase.replace(Phase::Executing);
        self.depth.set(self.depth.get() + 1);
        let status = stack.protected_call(nargs, MULTRET);
        self.depth.set(self.depth.get() - 1);

        let outcome = if !self.is_live() {
            Err(Error::Disposed)
        } else {
            self.phase.set(previous);
            let outcome = if status == OK {
                self.collect(stack, base)
            } else {
                Err(Error::Script(stack.error_message()))
            };
            stack.set_top(base);
            outcome
        };
        self.finish_deferred_close();
        outcome
    }

    fn collect(&self, stack: Stack, base: c_int) -> Result<Vec<Value>> {
        let top = stack.top();
        (base + 1..=top)
            .map(|index| marshal::read(self, stack, index).map_err(Error::from))
            .collect()
    }

    pub(crate) fn call_function(&self, reference: &Reference, args: Vec<Value>) -> Result<Vec<Value>> {
        let stack = self.stack()?;
        let base = stack.top();
        if !stack.reserve(args.len() as c_int + 1) {
            return Err(Error::Script("stack overflow".to_string()));
        }
        let pushed = reference
            .push(self, stack)
            .and_then(|_| args.iter().try_for_each(|arg| marshal::push(self, stack, arg)));
        if let Err(error) = pushed {
            stack.set_top(base);
            return Err(error.into());
        }
        self.run_protected(stack, base, args.len() as c_int)
    }

    pub(crate) fn create_table(&self) -> Result<ScriptTable> {
        let stack = self.stack()?;
        stack.new_table();
        let table = ScriptTable(Reference::pin(self, stack, -1));
        stack.pop(1);
        Ok(table)
    }

    /// Marks the instance dead and closes the state, or defers the close until
    /// the outermost protected call unwinds. Idempotent.
    pub(crate) fn dispose(&self) {
        if !self.live.replace(false) {
            return;
        }
        self.phase.set(Phase::Disposed);
        let handles = self.handles.invalidate_all();
        let pinned = self.pinned.get();
        if pinned > 0 {
            tracing::warn!(instance = %self.id, pinned, "disposing runtime instance with outstanding script references");
        }
        self.released.borrow_mut().clear();
        self.metatables.borrow_mut().clear();
        self.callables.borrow_mut().clear();
        self.chunk.set(None);
        if self.depth.get() == 0 {
            self.close();
        } else {
            tracing::debug!(instance = %self.id, depth = self.depth.get(), "deferring close until the running call returns");
            self.close_pending.set(true);
        }
        tracing::debug!(instance = %self.id, handles, "disposed runtime instance");
    }

    fn finish_deferred_close(&self) {
        if self.close_pending.get() && self.depth.get() == 0 {
            self.close_pending.set(false);
            self.close();
        }
    }

    fn close(&self) {
        if let Some(stack) = self.stack.take() {
            unsafe { stack.close() };
        }
    }

    fn app_data<T: 'static>(&self) -> Option<Ref<'_, T>> {
        let map = self.app_data.try_borrow().ok()?;
        Ref::filter_map(map, |map| map.get::<T>()).ok()
    }

    fn app_data_mut<T: 'static>(&self) -> Option<RefMut<'_, T>> {
        let map = self.app_data.try_borrow_mut().ok()?;
        RefMut::filter_map(map, |map| map.get_mut::<T>()).ok()
    }

    pub(crate) fn insert_app_data<T: 'static>(&self, value: T) -> Option<T> {
        self.app_data.borrow_mut().insert(value)
    }
}

impl Drop for InstanceCtx {
    fn drop(&mut self) {
        self.dispose();
        self.finish_deferred_close();
    }
}

/// Arguments of one native call, already resolved and coerced.
#[derive(Debug, Clone, Default)]
pub struct CallFrame {
    args: Vec<Value>,
}

impl CallFrame {
    pub(crate) fn new(args: Vec<Value>) -> Self {
        Self { args }
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// The argument at `index`, or nil past the end.
    pub fn value(&self, index: usize) -> &Value {
        self.args.get(index).unwrap_or(&Value::Nil)
    }

    /// Typed argument at `index`. A missing argument reads as nil, so optional
    /// parameters extract as `None`.
    pub fn get<T: FromValue>(&self, index: usize) -> crate::value::Result<T> {
        match self.args.get(index) {
            Some(value) => T::from_value(value),
            None => T::from_value(&Value::Nil).map_err(|_| crate::value::Error::MissingArgument { index }),
        }
    }

    pub fn object(&self, index: usize) -> crate::value::Result<&Object> {
        match self.args.get(index) {
            Some(Value::Object(object)) => Ok(object),
            Some(other) => Err(crate::value::Error::TypeMismatch {
                expected: "object",
                found: other.kind_name().to_string(),
            }),
            None => Err(crate::value::Error::MissingArgument { index }),
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.args.iter()
    }

    pub fn as_slice(&self) -> &[Value] {
        &self.args
    }
}

/// Host-side view of the instance during a native call.
pub struct CallContext<'a> {
    ctx: &'a InstanceCtx,
}

impl<'a> CallContext<'a> {
    pub(crate) fn new(ctx: &'a InstanceCtx) -> Self {
        Self { ctx }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.ctx.id()
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        self.ctx.registry()
    }

    pub fn app_data<T: 'static>(&self) -> Option<Ref<'_, T>> {
        self.ctx.app_data::<T>()
    }

    pub fn app_data_mut<T: 'static>(&mut self) -> Option<RefMut<'_, T>> {
        self.ctx.app_data_mut::<T>()
    }

    pub fn globals(&self) -> Globals<'a> {
        Globals { ctx: self.ctx }
    }

    pub fn create_table(&self) -> Result<ScriptTable> {
        self.ctx.create_table()
    }

    /// Calls back into script from inside a host call.
    pub fn call(&self, function: &ScriptFunction, args: impl IntoIterator<Item = Value>) -> Result<Vec<Value>> {
        function.call(args)
    }

    /// Disposes the instance from inside a running call. The state is closed
    /// once the outermost call returns; until then every callback fails.
    pub fn dispose_instance(&self) {
        self.ctx.dispose();
    }
}

/// Access to the global environment of an instance.
pub struct Globals<'a> {
    ctx: &'a InstanceCtx,
}

impl<'a> Globals<'a> {
    pub(crate) fn new(ctx: &'a InstanceCtx) -> Self {
        Self { ctx }
    }

    pub fn get(&self, name: &str) -> Result<Value> {
        let stack = self.ctx.stack()?;
        stack.get_global(name);
        let value = marshal::read(self.ctx, stack, -1);
        stack.pop(1);
        Ok(value?)
    }

    pub fn get_as<T: FromValue>(&self, name: &str) -> Result<T> {
        Ok(self.get(name)?.get::<T>()?)
    }

    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let stack = self.ctx.stack()?;
        marshal::push(self.ctx, stack, &value.into())?;
        stack.set_global(name);
        Ok(())
    }
}
