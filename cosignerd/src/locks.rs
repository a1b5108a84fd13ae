//! Per-entity reader/writer locks.
//!
//! Commands lock the entities they use for their whole duration: signing holds the key and the
//! wallet in shared mode and the PSBT in exclusive mode, deletion requires exclusive access and
//! never waits for it.

use std::{
    collections::HashMap,
    fmt,
    sync::{Condvar, Mutex},
};

use serde::{Deserialize, Serialize};

/// An imported entity, identified by its kind and its name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "lowercase")]
pub enum EntityId {
    Key(String),
    Wallet(String),
    Psbt(String),
}

impl EntityId {
    pub fn name(&self) -> &str {
        match self {
            Self::Key(name) | Self::Wallet(name) | Self::Psbt(name) => name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Key(_) => "key",
            Self::Wallet(_) => "wallet",
            Self::Psbt(_) => "psbt",
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} '{}'", self.kind(), self.name())
    }
}

#[derive(Debug, Default)]
struct LockState {
    readers: usize,
    writer: bool,
}

impl LockState {
    fn is_free(&self) -> bool {
        self.readers == 0 && !self.writer
    }
}

/// A registry of reader/writer locks keyed by entity.
#[derive(Debug, Default)]
pub struct EntityLocks {
    states: Mutex<HashMap<EntityId, LockState>>,
    released: Condvar,
}

/// Holds a lock on an entity until dropped.
#[derive(Debug)]
pub struct EntityGuard<'a> {
    locks: &'a EntityLocks,
    id: EntityId,
    exclusive: bool,
}

impl<'a> EntityGuard<'a> {
    pub fn id(&self) -> &EntityId {
        &self.id
    }
}

impl<'a> Drop for EntityGuard<'a> {
    fn drop(&mut self) {
        let mut states = self.locks.states.lock().unwrap();
        let free = match states.get_mut(&self.id) {
            Some(state) => {
                if self.exclusive {
                    state.writer = false;
                } else {
                    state.readers -= 1;
                }
                state.is_free()
            }
            None => {
                log::error!("Releasing a lock on {} which isn't held.", self.id);
                false
            }
        };
        if free {
            states.remove(&self.id);
        }
        self.locks.released.notify_all();
    }
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock this entity in shared mode, waiting for an exclusive holder to release it.
    pub fn read(&self, id: EntityId) -> EntityGuard<'_> {
        let mut states = self.states.lock().unwrap();
        while states.get(&id).map(|s| s.writer).unwrap_or(false) {
            states = self.released.wait(states).unwrap();
        }
        states.entry(id.clone()).or_default().readers += 1;
        EntityGuard {
            locks: self,
            id,
            exclusive: false,
        }
    }

    /// Lock this entity in exclusive mode, waiting for all holders to release it.
    pub fn write(&self, id: EntityId) -> EntityGuard<'_> {
        let mut states = self.states.lock().unwrap();
        while !states.get(&id).map(LockState::is_free).unwrap_or(true) {
            states = self.released.wait(states).unwrap();
        }
        states.entry(id.clone()).or_default().writer = true;
        EntityGuard {
            locks: self,
            id,
            exclusive: true,
        }
    }

    /// Lock this entity in exclusive mode if nobody holds it.
    pub fn try_write(&self, id: EntityId) -> Option<EntityGuard<'_>> {
        let mut states = self.states.lock().unwrap();
        if !states.get(&id).map(LockState::is_free).unwrap_or(true) {
            return None;
        }
        states.entry(id.clone()).or_default().writer = true;
        Some(EntityGuard {
            locks: self,
            id,
            exclusive: true,
        })
    }

    pub fn is_locked(&self, id: &EntityId) -> bool {
        self.states
            .lock()
            .unwrap()
            .get(id)
            .map(|s| !s.is_free())
            .unwrap_or(false)
    }
}
