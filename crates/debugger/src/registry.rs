//! Breakpoints set by the user and states reported active by the engine
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use crate::{types::EntityId, utils::with_lock};

/// Entities at which the engine should pause
#[derive(Debug, Default)]
pub(crate) struct Breakpoints {
    ids: Mutex<BTreeSet<EntityId>>,
}

impl Breakpoints {
    pub(crate) fn insert(&self, id: EntityId) -> bool {
        with_lock("breakpoints", &self.ids, |mut ids| ids.insert(id))
    }

    pub(crate) fn remove(&self, id: EntityId) -> bool {
        with_lock("breakpoints", &self.ids, |mut ids| ids.remove(&id))
    }

    pub(crate) fn ids(&self) -> Vec<EntityId> {
        with_lock("breakpoints", &self.ids, |ids| ids.iter().copied().collect())
    }
}

/// Token count of every active state, as last reported by the engine
///
/// Each report replaces the whole map.
#[derive(Debug, Default)]
pub(crate) struct ActiveStates {
    counts: Mutex<BTreeMap<EntityId, u32>>,
}

impl ActiveStates {
    /// Replace the map, calling `notify` with the new contents before the lock is released
    pub(crate) fn replace<F>(&self, counts: BTreeMap<EntityId, u32>, notify: F)
    where
        F: FnOnce(&BTreeMap<EntityId, u32>),
    {
        with_lock("active states", &self.counts, |mut current| {
            *current = counts;
            notify(&current);
        })
    }

    /// Empty the map, calling `notify` only if it held anything
    pub(crate) fn clear<F>(&self, notify: F)
    where
        F: FnOnce(&BTreeMap<EntityId, u32>),
    {
        with_lock("active states", &self.counts, |mut current| {
            if !current.is_empty() {
                current.clear();
                notify(&current);
            }
        })
    }

    pub(crate) fn snapshot(&self) -> BTreeMap<EntityId, u32> {
        with_lock("active states", &self.counts, |counts| counts.clone())
    }

    pub(crate) fn count(&self, id: EntityId) -> Option<u32> {
        with_lock("active states", &self.counts, |counts| {
            counts.get(&id).copied()
        })
    }
}
