//! # Handles
//!
//! Scripts never hold host pointers. Every host object they see is addressed by
//! a `Handle`: an index into a per-instance slot arena plus a generation stamp,
//! so a handle that outlives its slot (or its instance) resolves to an error
//! instead of a dangling object.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::rc::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a runtime instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(pub u64);

impl InstanceId {
    pub(crate) fn next() -> Self {
        Self(NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance-{}", self.0)
    }
}

/// Opaque, instance-scoped token standing in for a host object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct Handle {
    instance: InstanceId,
    slot: u32,
    generation: u32,
}

impl Handle {
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.instance, self.slot, self.generation)
    }
}

/// Why a handle failed to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalid {
    /// The slot was destroyed, or the whole table was invalidated.
    Destroyed,
    /// The handle was minted by another instance.
    ForeignInstance,
}

/// Handle errors.
#[derive(Debug, Clone)]
pub enum Error {
    InvalidHandle { handle: Handle, reason: Invalid },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidHandle { handle, reason: Invalid::Destroyed } => {
                write!(f, "invalid handle {}: object has been destroyed", handle)
            }
            Error::InvalidHandle { handle, reason: Invalid::ForeignInstance } => {
                write!(f, "invalid handle {}: belongs to another runtime instance", handle)
            }
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

struct Slots<T> {
    entries: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

/// Generation-checked arena mapping handles to host values.
///
/// Clones share the same arena.
pub struct HandleTable<T> {
    instance: InstanceId,
    slots: Rc<RefCell<Slots<T>>>,
}

impl<T> Clone for HandleTable<T> {
    fn clone(&self) -> Self {
        Self { instance: self.instance, slots: self.slots.clone() }
    }
}

impl<T: Clone> HandleTable<T> {
    pub fn new(instance: InstanceId) -> Self {
        Self {
            instance,
            slots: Rc::new(RefCell::new(Slots { entries: Vec::new(), free: Vec::new(), live: 0 })),
        }
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Stores `value` in a free slot and mints a handle for it.
    pub fn create(&self, value: T) -> Handle {
        let mut slots = self.slots.borrow_mut();
        slots.live += 1;
        let slot = match slots.free.pop() {
            Some(slot) => {
                slots.entries[slot as usize].value = Some(value);
                slot
            }
            None => {
                slots.entries.push(Slot { generation: 0, value: Some(value) });
                (slots.entries.len() - 1) as u32
            }
        };
        let generation = slots.entries[slot as usize].generation;
        let handle = Handle { instance: self.instance, slot, generation };
        tracing::trace!(%handle, "created handle");
        handle
    }

    pub fn resolve(&self, handle: Handle) -> Result<T> {
        if handle.instance != self.instance {
            return Err(Error::InvalidHandle { handle, reason: Invalid::ForeignInstance });
        }
        let slots = self.slots.borrow();
        slots
            .entries
            .get(handle.slot as usize)
            .filter(|entry| entry.generation == handle.generation)
            .and_then(|entry| entry.value.clone())
            .ok_or(Error::InvalidHandle { handle, reason: Invalid::Destroyed })
    }

    /// Frees the handle's slot. Destroying a stale or foreign handle is a no-op.
    ///
    /// Returns whether a live value was released.
    pub fn destroy(&self, handle: Handle) -> bool {
        if handle.instance != self.instance {
            return false;
        }
        let released = {
            let mut slots = self.slots.borrow_mut();
            let taken = match slots.entries.get_mut(handle.slot as usize) {
                Some(entry) if entry.generation == handle.generation && entry.value.is_some() => {
                    entry.generation = entry.generation.wrapping_add(1);
                    entry.value.take()
                }
                _ => None,
            };
            if taken.is_some() {
                slots.live -= 1;
                slots.free.push(handle.slot);
            }
            taken
        };
        // The value is dropped after the borrow ends: its destructor may reach back in.
        let destroyed = released.is_some();
        drop(released);
        if destroyed {
            tracing::trace!(%handle, "destroyed handle");
        }
        destroyed
    }

    /// Destroys every live slot. Returns how many were released.
    pub fn invalidate_all(&self) -> usize {
        let released: Vec<T> = {
            let mut slots = self.slots.borrow_mut();
            let mut released = Vec::with_capacity(slots.live);
            let mut freed = Vec::new();
            for (index, entry) in slots.entries.iter_mut().enumerate() {
                if let Some(value) = entry.value.take() {
                    entry.generation = entry.generation.wrapping_add(1);
                    released.push(value);
                    freed.push(index as u32);
                }
            }
            slots.free.extend(freed);
            slots.live = 0;
            released
        };
        released.len()
    }

    pub fn len(&self) -> usize {
        self.slots.borrow().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn downgrade(&self) -> WeakHandleTable<T> {
        WeakHandleTable { instance: self.instance, slots: Rc::downgrade(&self.slots) }
    }
}

/// Non-owning link back to a handle table, held by script-side values.
pub(crate) struct WeakHandleTable<T> {
    instance: InstanceId,
    slots: Weak<RefCell<Slots<T>>>,
}

impl<T: Clone> WeakHandleTable<T> {
    pub(crate) fn upgrade(&self) -> Option<HandleTable<T>> {
        self.slots.upgrade().map(|slots| HandleTable { instance: self.instance, slots })
    }
}
