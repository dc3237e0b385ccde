//! Registry of attached cores
//!
//! The registry is an arena owned by whoever attaches engines; it is passed
//! explicitly rather than living in a global. Cores are addressed by
//! [`CoreId`], the index of their slot. Detached slots are reused.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::engine::Core;

/// Index of a core in a [`CoreRegistry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoreId(pub usize);

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "core{}", self.0)
    }
}

/// Arena of cores, one per attached engine
#[derive(Debug, Default)]
pub struct CoreRegistry {
    slots: RwLock<Vec<Option<Arc<Core>>>>,
}

impl CoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a core, reusing the lowest free slot
    pub fn attach(&self, core: Arc<Core>) -> CoreId {
        let mut slots = self.slots.write();
        let id = match slots.iter().position(Option::is_none) {
            Some(free) => {
                slots[free] = Some(core);
                CoreId(free)
            }
            None => {
                slots.push(Some(core));
                CoreId(slots.len() - 1)
            }
        };
        tracing::info!("Attached {}", id);
        id
    }

    pub fn get(&self, id: CoreId) -> Option<Arc<Core>> {
        self.slots.read().get(id.0).and_then(|slot| slot.clone())
    }

    /// Remove a core, returning it if the slot was occupied
    pub fn detach(&self, id: CoreId) -> Option<Arc<Core>> {
        let core = self.slots.write().get_mut(id.0).and_then(Option::take);
        if core.is_some() {
            tracing::info!("Detached {}", id);
        }
        core
    }

    /// Snapshot of every attached core
    pub fn iter(&self) -> impl Iterator<Item = (CoreId, Arc<Core>)> {
        let attached: Vec<_> = self
            .slots
            .read()
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.clone().map(|core| (CoreId(index), core)))
            .collect();
        attached.into_iter()
    }

    pub fn len(&self) -> usize {
        self.slots.read().iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
