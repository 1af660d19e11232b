// CLASSIFICATION: COMMUNITY
// Filename: quota.rs v0.4
// Author: Lukas Bower
// Date Modified: 2027-08-22

//! Per-owner resource quota tracker.
//!
//! Every countable resource a computer can hold (filesystem bytes, open file
//! handles, in-flight HTTP requests, websockets and buffered websocket
//! message bytes) is charged here before the operation starts. The ceiling
//! check and the increment happen under one lock, so two concurrent
//! operations can never jointly overshoot a limit.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;
use serde::Serialize;

use crate::computer::ComputerId;

/// Countable resources governed by a quota.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    FilesystemBytes,
    OpenFileHandles,
    NetworkRequests,
    WebsocketConnections,
    WebsocketMessageBytes,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::FilesystemBytes,
        ResourceKind::OpenFileHandles,
        ResourceKind::NetworkRequests,
        ResourceKind::WebsocketConnections,
        ResourceKind::WebsocketMessageBytes,
    ];

    fn index(self) -> usize {
        match self {
            ResourceKind::FilesystemBytes => 0,
            ResourceKind::OpenFileHandles => 1,
            ResourceKind::NetworkRequests => 2,
            ResourceKind::WebsocketConnections => 3,
            ResourceKind::WebsocketMessageBytes => 4,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::FilesystemBytes => "filesystem-bytes",
            ResourceKind::OpenFileHandles => "open-file-handles",
            ResourceKind::NetworkRequests => "network-requests",
            ResourceKind::WebsocketConnections => "websocket-connections",
            ResourceKind::WebsocketMessageBytes => "websocket-message-bytes",
        };
        f.write_str(name)
    }
}

/// Who a quota is charged to. Removable disks carry their own usage so it
/// follows the disk between computers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum QuotaOwner {
    Computer(ComputerId),
    Disk(u32),
}

impl fmt::Display for QuotaOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaOwner::Computer(id) => write!(f, "computer#{id}"),
            QuotaOwner::Disk(id) => write!(f, "disk#{id}"),
        }
    }
}

/// Ceilings for one owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct QuotaLimits {
    pub filesystem_bytes: u64,
    pub open_file_handles: u64,
    pub network_requests: u64,
    pub websocket_connections: u64,
    pub websocket_message_bytes: u64,
}

impl QuotaLimits {
    pub fn limit(&self, kind: ResourceKind) -> u64 {
        match kind {
            ResourceKind::FilesystemBytes => self.filesystem_bytes,
            ResourceKind::OpenFileHandles => self.open_file_handles,
            ResourceKind::NetworkRequests => self.network_requests,
            ResourceKind::WebsocketConnections => self.websocket_connections,
            ResourceKind::WebsocketMessageBytes => self.websocket_message_bytes,
        }
    }

    /// Limits for a removable disk: only storage is meaningful.
    pub fn storage_only(bytes: u64) -> Self {
        Self {
            filesystem_bytes: bytes,
            open_file_handles: 0,
            network_requests: 0,
            websocket_connections: 0,
            websocket_message_bytes: 0,
        }
    }
}

/// A refused acquisition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuotaRejection {
    pub owner: QuotaOwner,
    pub kind: ResourceKind,
    pub limit: u64,
    pub in_use: u64,
    pub requested: u64,
}

/// Point-in-time view of an owner's counters.
#[derive(Clone, Debug, Serialize)]
pub struct QuotaUsage {
    pub limits: QuotaLimits,
    pub used: HashMap<ResourceKind, u64>,
}

#[derive(Debug)]
struct Counters {
    limits: QuotaLimits,
    used: [u64; 5],
}

/// Tracker shared by the filesystem layer and the network gateway.
#[derive(Debug, Default)]
pub struct QuotaTracker {
    owners: Mutex<HashMap<QuotaOwner, Counters>>,
}

impl QuotaTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn owners(&self) -> MutexGuard<'_, HashMap<QuotaOwner, Counters>> {
        // Counters stay consistent even if a holder panicked mid-update:
        // every mutation is a single add or subtract.
        self.owners.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register an owner with its ceilings. Re-registering keeps the current
    /// usage and replaces the limits.
    pub fn register(&self, owner: QuotaOwner, limits: QuotaLimits) {
        let mut owners = self.owners();
        owners
            .entry(owner)
            .and_modify(|c| c.limits = limits)
            .or_insert(Counters { limits, used: [0; 5] });
        debug!("quota registered for {owner}");
    }

    /// Forget an owner. Outstanding permits release into nothing.
    pub fn unregister(&self, owner: QuotaOwner) {
        self.owners().remove(&owner);
        debug!("quota unregistered for {owner}");
    }

    pub fn is_registered(&self, owner: QuotaOwner) -> bool {
        self.owners().contains_key(&owner)
    }

    /// Atomically check the ceiling and charge `amount`.
    pub fn try_acquire(
        self: &Arc<Self>,
        owner: QuotaOwner,
        kind: ResourceKind,
        amount: u64,
    ) -> Result<QuotaPermit, QuotaRejection> {
        self.charge(owner, kind, amount)?;
        Ok(QuotaPermit {
            tracker: Arc::clone(self),
            owner,
            kind,
            amount,
            released: AtomicBool::new(false),
        })
    }

    fn charge(&self, owner: QuotaOwner, kind: ResourceKind, amount: u64) -> Result<(), QuotaRejection> {
        let mut owners = self.owners();
        let Some(counters) = owners.get_mut(&owner) else {
            return Err(QuotaRejection {
                owner,
                kind,
                limit: 0,
                in_use: 0,
                requested: amount,
            });
        };
        let limit = counters.limits.limit(kind);
        let slot = &mut counters.used[kind.index()];
        match slot.checked_add(amount) {
            Some(next) if next <= limit => {
                *slot = next;
                Ok(())
            }
            _ => {
                debug!("quota rejected for {owner}: {kind} {} + {amount} > {limit}", *slot);
                Err(QuotaRejection {
                    owner,
                    kind,
                    limit,
                    in_use: *slot,
                    requested: amount,
                })
            }
        }
    }

    /// Return `amount` of `kind` to the owner. Saturates at zero.
    pub fn release(&self, owner: QuotaOwner, kind: ResourceKind, amount: u64) {
        if let Some(counters) = self.owners().get_mut(&owner) {
            let slot = &mut counters.used[kind.index()];
            *slot = slot.saturating_sub(amount);
        }
    }

    pub fn in_use(&self, owner: QuotaOwner, kind: ResourceKind) -> u64 {
        self.owners()
            .get(&owner)
            .map(|c| c.used[kind.index()])
            .unwrap_or(0)
    }

    pub fn usage(&self, owner: QuotaOwner) -> Option<QuotaUsage> {
        self.owners().get(&owner).map(|c| QuotaUsage {
            limits: c.limits,
            used: ResourceKind::ALL
                .iter()
                .map(|k| (*k, c.used[k.index()]))
                .collect(),
        })
    }
}

/// A granted acquisition. Released exactly once: either by an explicit
/// [`QuotaPermit::release`] or on drop.
#[derive(Debug)]
pub struct QuotaPermit {
    tracker: Arc<QuotaTracker>,
    owner: QuotaOwner,
    kind: ResourceKind,
    amount: u64,
    released: AtomicBool,
}

impl QuotaPermit {
    pub fn owner(&self) -> QuotaOwner {
        self.owner
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn amount(&self) -> u64 {
        self.amount
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Give the capacity back. Returns `true` only for the call that
    /// actually released it.
    pub fn release(&self) -> bool {
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.tracker.release(self.owner, self.kind, self.amount);
            true
        } else {
            false
        }
    }

    /// Keep the charge after the permit goes away. Used for stored bytes,
    /// which remain charged until the file shrinks or is deleted.
    pub fn into_persistent(self) -> u64 {
        self.released.store(true, Ordering::Release);
        self.amount
    }
}

impl Drop for QuotaPermit {
    fn drop(&mut self) {
        self.release();
    }
}
