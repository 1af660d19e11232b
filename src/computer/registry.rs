// CLASSIFICATION: COMMUNITY
// Filename: registry.rs v0.2
// Author: Lukas Bower
// Date Modified: 2027-08-25

//! Instance registries.
//!
//! The server registry owns live [`Computer`]s and allocates their ids. The
//! client registry mirrors what the server publishes as
//! [`ComputerSnapshot`]s; it never holds a runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::{Computer, ComputerId, ComputerState};

/// Serialisable view of a computer, published to client mirrors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputerSnapshot {
    pub id: ComputerId,
    pub state: ComputerState,
    pub label: Option<String>,
    pub pending_events: usize,
}

/// Id-keyed map safe for concurrent lookup.
#[derive(Debug)]
pub struct ComputerRegistry<T> {
    entries: RwLock<HashMap<ComputerId, T>>,
}

impl<T> Default for ComputerRegistry<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Clone> ComputerRegistry<T> {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<ComputerId, T>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ComputerId, T>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, id: ComputerId, entry: T) -> Option<T> {
        self.write().insert(id, entry)
    }

    pub fn remove(&self, id: ComputerId) -> Option<T> {
        self.write().remove(&id)
    }

    pub fn get(&self, id: ComputerId) -> Option<T> {
        self.read().get(&id).cloned()
    }

    pub fn contains(&self, id: ComputerId) -> bool {
        self.read().contains_key(&id)
    }

    pub fn all(&self) -> Vec<T> {
        self.read().values().cloned().collect()
    }

    /// Ids in ascending order.
    pub fn ids(&self) -> Vec<ComputerId> {
        let mut ids: Vec<_> = self.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn clear(&self) {
        self.write().clear();
    }
}

/// Authoritative registry of live computers.
#[derive(Debug)]
pub struct ServerComputerRegistry {
    inner: ComputerRegistry<Arc<Computer>>,
    next_id: AtomicU32,
    session_id: u32,
}

impl Default for ServerComputerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerComputerRegistry {
    pub fn new() -> Self {
        // Changes on every host start so clients can tell a stale mirror.
        let session_id = chrono::Utc::now().timestamp_subsec_nanos();
        Self {
            inner: ComputerRegistry::default(),
            next_id: AtomicU32::new(0),
            session_id,
        }
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Reserve a fresh id.
    pub fn allocate_id(&self) -> ComputerId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Reserve ids at or above `id`. Used when restoring saved computers.
    pub fn reserve_up_to(&self, id: ComputerId) {
        self.next_id.fetch_max(id.saturating_add(1), Ordering::Relaxed);
    }

    pub fn register(&self, computer: Arc<Computer>) {
        let id = computer.id();
        self.reserve_up_to(id);
        if self.inner.insert(id, computer).is_some() {
            debug!("computer #{id} replaced in registry");
        }
        info!("computer #{id} registered");
    }

    pub fn unregister(&self, id: ComputerId) -> Option<Arc<Computer>> {
        let removed = self.inner.remove(id);
        if removed.is_some() {
            info!("computer #{id} unregistered");
        }
        removed
    }

    pub fn get(&self, id: ComputerId) -> Option<Arc<Computer>> {
        self.inner.get(id)
    }

    pub fn all(&self) -> Vec<Arc<Computer>> {
        self.inner.all()
    }

    pub fn ids(&self) -> Vec<ComputerId> {
        self.inner.ids()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn snapshots(&self) -> Vec<ComputerSnapshot> {
        let mut snaps: Vec<_> = self.all().iter().map(|c| c.snapshot()).collect();
        snaps.sort_by_key(|s| s.id);
        snaps
    }
}

/// Client-side mirror entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientComputer {
    pub snapshot: ComputerSnapshot,
    pub session_id: u32,
}

impl ClientComputer {
    pub fn is_on(&self) -> bool {
        self.snapshot.state == ComputerState::On
    }
}

/// Mirror of the server registry built from published snapshots.
#[derive(Debug, Default)]
pub struct ClientComputerRegistry {
    inner: ComputerRegistry<ClientComputer>,
}

impl ClientComputerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a published snapshot. Entries from an older session are
    /// replaced wholesale.
    pub fn apply(&self, session_id: u32, snapshot: ComputerSnapshot) {
        let id = snapshot.id;
        self.inner.insert(id, ClientComputer { snapshot, session_id });
    }

    /// Apply a batch, dropping entries the server no longer reports.
    pub fn sync(&self, session_id: u32, snapshots: Vec<ComputerSnapshot>) {
        let keep: Vec<ComputerId> = snapshots.iter().map(|s| s.id).collect();
        for id in self.inner.ids() {
            if !keep.contains(&id) {
                self.inner.remove(id);
            }
        }
        for snap in snapshots {
            self.apply(session_id, snap);
        }
    }

    pub fn remove(&self, id: ComputerId) -> Option<ClientComputer> {
        self.inner.remove(id)
    }

    pub fn get(&self, id: ComputerId) -> Option<ClientComputer> {
        self.inner.get(id)
    }

    pub fn all(&self) -> Vec<ClientComputer> {
        self.inner.all()
    }

    pub fn ids(&self) -> Vec<ComputerId> {
        self.inner.ids()
    }

    /// Drop every entry not belonging to `session_id`.
    pub fn retain_session(&self, session_id: u32) {
        for entry in self.inner.all() {
            if entry.session_id != session_id {
                self.inner.remove(entry.snapshot.id);
            }
        }
    }

    pub fn clear(&self) {
        self.inner.clear();
    }
}
