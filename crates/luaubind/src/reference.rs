//! # Persistent references
//!
//! A script value the host wants to keep beyond the current call (a callback
//! function, a configuration table) is pinned in the Luau registry. The pin
//! is released on `unpin()` or when the last host copy drops; once the instance
//! is disposed, every operation fails and releasing is a no-op.

use std::cell::Cell;
use std::ffi::c_int;
use std::fmt;
use std::rc::Rc;
use std::rc::Weak;

use crate::context::InstanceCtx;
use crate::handles::InstanceId;
use crate::instance::Error;
use crate::instance::Result;
use crate::marshal;
use crate::stack::Stack;
use crate::value::Value;

pub(crate) struct Reference {
    id: c_int,
    instance: InstanceId,
    owner: Weak<InstanceCtx>,
    released: Cell<bool>,
}

impl Reference {
    /// Pins the value at `index`. The value stays on the stack.
    pub(crate) fn pin(ctx: &InstanceCtx, stack: Stack, index: c_int) -> Rc<Self> {
        let id = stack.create_reference(index);
        ctx.note_pinned();
        Rc::new(Self { id, instance: ctx.id(), owner: ctx.weak(), released: Cell::new(false) })
    }

    pub(crate) fn instance(&self) -> InstanceId {
        self.instance
    }

    pub(crate) fn is_pinned(&self) -> bool {
        !self.released.get() && self.owner.upgrade().is_some_and(|ctx| ctx.is_live())
    }

    /// The owning context, if it is still live.
    pub(crate) fn owner(&self) -> Result<Rc<InstanceCtx>> {
        if self.released.get() {
            return Err(Error::Released);
        }
        match self.owner.upgrade() {
            Some(ctx) if ctx.is_live() => Ok(ctx),
            _ => Err(Error::Disposed),
        }
    }

    /// Pushes the pinned value onto `stack`, which must belong to `ctx`.
    pub(crate) fn push(&self, ctx: &InstanceCtx, stack: Stack) -> marshal::Result<()> {
        if self.instance != ctx.id() {
            return Err(marshal::Error::ForeignReference { owner: self.instance, target: ctx.id() });
        }
        if self.released.get() {
            return Err(marshal::Error::Released);
        }
        stack.push_reference(self.id);
        Ok(())
    }

    pub(crate) fn release(&self) {
        if self.released.replace(true) {
            return;
        }
        if let Some(ctx) = self.owner.upgrade() {
            if let Ok(stack) = ctx.stack() {
                stack.release_reference(self.id);
            }
            ctx.note_unpinned();
        }
    }
}

impl Drop for Reference {
    fn drop(&mut self) {
        if !self.released.replace(true) {
            if let Some(ctx) = self.owner.upgrade() {
                ctx.defer_release(self.id);
            }
        }
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/ref-{}", self.instance, self.id)
    }
}

/// A script function pinned for host use. Clones share one pin.
#[derive(Clone)]
pub struct ScriptFunction(pub(crate) Rc<Reference>);

impl ScriptFunction {
    /// Calls the function in protected mode and returns every result it produced.
    pub fn call(&self, args: impl IntoIterator<Item = Value>) -> Result<Vec<Value>> {
        let ctx = self.0.owner()?;
        ctx.call_function(&self.0, args.into_iter().collect())
    }

    /// Releases the pin for this and every clone.
    pub fn unpin(&self) {
        self.0.release();
    }

    pub fn is_pinned(&self) -> bool {
        self.0.is_pinned()
    }

    pub fn instance(&self) -> InstanceId {
        self.0.instance()
    }
}

impl PartialEq for ScriptFunction {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ScriptFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScriptFunction({:?})", self.0)
    }
}

/// A script table pinned for host use. Clones share one pin.
///
/// Reads and writes are raw: they never run the table's metamethods.
#[derive(Clone)]
pub struct ScriptTable(pub(crate) Rc<Reference>);

impl ScriptTable {
    pub fn get(&self, key: &str) -> Result<Value> {
        let ctx = self.0.owner()?;
        let stack = ctx.stack()?;
        self.0.push(&ctx, stack)?;
        stack.get_field(-1, key);
        let value = marshal::read(&ctx, stack, -1);
        stack.pop(2);
        Ok(value?)
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        let ctx = self.0.owner()?;
        let stack = ctx.stack()?;
        self.0.push(&ctx, stack)?;
        if let Err(error) = marshal::push(&ctx, stack, &value.into()) {
            stack.pop(1);
            return Err(error.into());
        }
        stack.set_field(-2, key);
        stack.pop(1);
        Ok(())
    }

    pub fn unpin(&self) {
        self.0.release();
    }

    pub fn is_pinned(&self) -> bool {
        self.0.is_pinned()
    }

    pub fn instance(&self) -> InstanceId {
        self.0.instance()
    }
}

impl PartialEq for ScriptTable {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ScriptTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScriptTable({:?})", self.0)
    }
}
