//! Handle Registry
//!
//! Process-wide arena mapping opaque handles to host-side objects. The script
//! side only ever holds a [`Handle`]; the object itself stays owned by its slot
//! until the script runtime reports the handle unreachable and calls
//! [`HandleRegistry::release`].
//!
//! # Handle layout
//!
//! ```text
//!  63                 32 31                  0
//! ┌─────────────────────┬─────────────────────┐
//! │  slot generation    │     slot index      │
//! └─────────────────────┴─────────────────────┘
//! ```
//!
//! Generation 0 is never issued, so the raw value 0 is always invalid. A slot's
//! generation is bumped when it is released; a stale copy of an old handle
//! therefore never resolves to the object that later reuses the slot.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{BridgeError, BridgeResult};

/// A host object stored in the registry.
pub type HostObject = Arc<dyn Any + Send + Sync>;

/// Callback run exactly once when a handle is released.
pub type ReleaseFn = Box<dyn FnOnce() + Send>;

const INDEX_BITS: u32 = 32;
const INDEX_MASK: u64 = (1u64 << INDEX_BITS) - 1;

lazy_static::lazy_static! {
    /// The process-wide registry shared by every bridge in this process
    static ref GLOBAL_REGISTRY: Arc<HandleRegistry> = Arc::new(HandleRegistry::new());
}

/// Get the process-wide registry
pub fn global() -> Arc<HandleRegistry> {
    Arc::clone(&GLOBAL_REGISTRY)
}

/// Opaque token exposed to the script side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Handle(u64);

impl Handle {
    fn encode(index: u32, generation: u32) -> Self {
        Handle(((generation as u64) << INDEX_BITS) | index as u64)
    }

    fn decode(self) -> Option<(u32, u32)> {
        let index = (self.0 & INDEX_MASK) as u32;
        let generation = (self.0 >> INDEX_BITS) as u32;
        if generation == 0 {
            return None;
        }
        Some((index, generation))
    }

    /// Rebuild a handle from the raw value a script stored
    pub fn from_raw(raw: u64) -> Self {
        Handle(raw)
    }

    /// Raw value suitable for storing in a script userdata
    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.decode() {
            Some((index, generation)) => write!(f, "handle#{}.{}", index, generation),
            None => write!(f, "handle#invalid"),
        }
    }
}

struct Entry {
    object: HostObject,
    release: Option<ReleaseFn>,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

#[derive(Default)]
struct Table {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

/// Registry of live handles
///
/// A single mutex serialises allocate/lookup/release. Handle churn is low
/// (one handle per task and per polled connection), so contention is not a
/// concern. Release callbacks always run after the lock has been dropped, so
/// a callback may freely call back into the registry.
pub struct HandleRegistry {
    table: Mutex<Table>,
}

impl HandleRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table::default()),
        }
    }

    /// Insert an object and return a fresh handle for it
    pub fn allocate(&self, object: HostObject, release: Option<ReleaseFn>) -> Handle {
        let entry = Entry { object, release };
        let mut table = self.table.lock();
        let handle = if let Some(index) = table.free.pop() {
            let slot = &mut table.slots[index as usize];
            slot.entry = Some(entry);
            Handle::encode(index, slot.generation)
        } else {
            debug_assert!(table.slots.len() < u32::MAX as usize);
            let index = table.slots.len() as u32;
            table.slots.push(Slot {
                generation: 1,
                entry: Some(entry),
            });
            Handle::encode(index, 1)
        };
        table.live += 1;
        tracing::trace!(%handle, live = table.live, "handle allocated");
        handle
    }

    /// Resolve a handle back to its object
    ///
    /// Returns `None` for foreign, stale, or released handles.
    pub fn lookup(&self, handle: Handle) -> Option<HostObject> {
        let (index, generation) = handle.decode()?;
        let table = self.table.lock();
        let slot = table.slots.get(index as usize)?;
        if slot.generation != generation {
            return None;
        }
        slot.entry.as_ref().map(|entry| Arc::clone(&entry.object))
    }

    /// Resolve a handle and downcast it to a concrete host type
    ///
    /// `kind` names the expected object in the mismatch error.
    pub fn resolve<T>(&self, handle: Handle, kind: &'static str) -> BridgeResult<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let object = self.lookup(handle).ok_or(BridgeError::InvalidHandle)?;
        object
            .downcast::<T>()
            .map_err(|_| BridgeError::WrongKind { expected: kind })
    }

    /// Release a handle, running its release callback
    ///
    /// Returns `false` if the handle was not live. The callback and the drop
    /// of the stored object both happen outside the registry lock.
    pub fn release(&self, handle: Handle) -> bool {
        let entry = {
            let mut table = self.table.lock();
            let Some((index, generation)) = handle.decode() else {
                return false;
            };
            let Some(slot) = table.slots.get_mut(index as usize) else {
                return false;
            };
            if slot.generation != generation {
                return false;
            }
            let Some(entry) = slot.entry.take() else {
                return false;
            };
            // A slot whose generation would wrap is retired instead of reused.
            if generation < u32::MAX {
                slot.generation = generation + 1;
                table.free.push(index);
            }
            table.live -= 1;
            tracing::trace!(%handle, live = table.live, "handle released");
            entry
        };

        let Entry { object, release } = entry;
        if let Some(release) = release {
            if panic::catch_unwind(AssertUnwindSafe(release)).is_err() {
                tracing::warn!(%handle, "release callback panicked");
            }
        }
        drop(object);
        true
    }

    /// Number of live handles
    pub fn len(&self) -> usize {
        self.table.lock().live
    }

    /// Whether no handles are live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
