// CLASSIFICATION: COMMUNITY
// Filename: host.rs v0.4
// Author: Lukas Bower
// Date Modified: 2027-08-29

//! Host facade.
//!
//! Owns the quota tracker, network gateway, scheduler and server registry,
//! and exposes the interface the embedding simulation drives: computer
//! lifecycle, event injection, the per-tick hook and configuration reload.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use log::{info, warn};
use serde::Serialize;
use serde_json::{json, Value};

use crate::computer::{
    Computer, ComputerId, Event, FileSystem, MediaChange, MediaOutcome, RuntimeFactory,
    ServerComputerRegistry,
};
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::net::{HostResolver, NetworkGateway, SystemResolver};
use crate::quota::{QuotaOwner, QuotaTracker};
use crate::scheduler::{Scheduler, SchedulerSettings, Services};

/// Result of one host tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub tick: u64,
    pub consumed_us: u64,
    pub deferred: bool,
    pub queued: usize,
    pub timeouts: usize,
}

pub struct ComputerHost {
    config: RwLock<CoreConfig>,
    data_dir: PathBuf,
    factory: RuntimeFactory,
    quotas: Arc<QuotaTracker>,
    gateway: Arc<NetworkGateway>,
    scheduler: Scheduler,
    registry: ServerComputerRegistry,
    disks: Mutex<HashMap<u32, PathBuf>>,
    next_disk: AtomicU32,
}

impl ComputerHost {
    pub fn new(config: CoreConfig, data_dir: impl Into<PathBuf>, factory: RuntimeFactory) -> CoreResult<Self> {
        Self::with_resolver(config, data_dir, factory, Arc::new(SystemResolver))
    }

    pub fn with_resolver(
        config: CoreConfig,
        data_dir: impl Into<PathBuf>,
        factory: RuntimeFactory,
        resolver: Arc<dyn HostResolver>,
    ) -> CoreResult<Self> {
        config.validate()?;
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)?;
        let quotas = QuotaTracker::new();
        let gateway = Arc::new(NetworkGateway::with_resolver(
            &config.http,
            Arc::clone(&quotas),
            resolver,
        )?);
        let services = Services {
            gateway: Arc::clone(&gateway),
            quotas: Arc::clone(&quotas),
        };
        let scheduler = Scheduler::start(SchedulerSettings::from(&config.execution), services)?;
        info!("computer host ready at {}", data_dir.display());
        Ok(Self {
            config: RwLock::new(config),
            data_dir,
            factory,
            quotas,
            gateway,
            scheduler,
            registry: ServerComputerRegistry::new(),
            disks: Mutex::new(HashMap::new()),
            next_disk: AtomicU32::new(0),
        })
    }

    pub fn config(&self) -> CoreConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn registry(&self) -> &ServerComputerRegistry {
        &self.registry
    }

    pub fn gateway(&self) -> &Arc<NetworkGateway> {
        &self.gateway
    }

    pub fn quotas(&self) -> &Arc<QuotaTracker> {
        &self.quotas
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Create a computer with a fresh id. It starts off.
    pub fn create_computer(&self) -> CoreResult<Arc<Computer>> {
        self.restore_computer(self.registry.allocate_id())
    }

    /// Create a computer with a known id, reusing its storage if present.
    pub fn restore_computer(&self, id: ComputerId) -> CoreResult<Arc<Computer>> {
        if self.registry.get(id).is_some() {
            return Err(CoreError::MalformedRequest(format!("computer #{id} already exists")));
        }
        let root = self.data_dir.join("computer").join(id.to_string());
        fs::create_dir_all(&root)?;
        let owner = QuotaOwner::Computer(id);
        self.quotas.register(owner, self.config().computer_limits());
        let filesystem = match FileSystem::new(&root, owner, Arc::clone(&self.quotas)) {
            Ok(filesystem) => filesystem,
            Err(e) => {
                self.quotas.unregister(owner);
                return Err(e);
            }
        };
        let computer = Computer::new(
            id,
            Arc::clone(&self.factory),
            filesystem,
            self.scheduler.run_queue(),
        );
        self.registry.register(Arc::clone(&computer));
        Ok(computer)
    }

    fn computer(&self, id: ComputerId) -> CoreResult<Arc<Computer>> {
        self.registry.get(id).ok_or(CoreError::NoSuchComputer(id))
    }

    /// Remove a computer. Its runtime is shut down by the scheduler; its
    /// network operations are cancelled at once.
    pub fn destroy_computer(&self, id: ComputerId) -> CoreResult<()> {
        let computer = self.registry.unregister(id).ok_or(CoreError::NoSuchComputer(id))?;
        computer.shutdown();
        self.gateway.cancel_all(id);
        self.quotas.unregister(QuotaOwner::Computer(id));
        Ok(())
    }

    /// Create a removable disk with its own storage quota.
    pub fn register_disk(&self) -> CoreResult<u32> {
        let id = self.next_disk.fetch_add(1, Ordering::Relaxed);
        let root = self.data_dir.join("disk").join(id.to_string());
        fs::create_dir_all(&root)?;
        self.quotas.register(QuotaOwner::Disk(id), self.config().floppy_limits());
        self.disks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, root);
        Ok(id)
    }

    /// Attach a registered disk under `/<name>`. Never waits on a running
    /// resume: a busy computer gets the mount before its next step.
    pub fn mount_disk(&self, computer: ComputerId, disk: u32, name: &str) -> CoreResult<MediaOutcome> {
        let root = self
            .disks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&disk)
            .cloned()
            .ok_or_else(|| CoreError::InvalidPath(format!("no disk {disk}")))?;
        self.computer(computer)?.change_media(MediaChange::Mount {
            name: name.to_string(),
            root,
            owner: QuotaOwner::Disk(disk),
        })
    }

    pub fn unmount_disk(&self, computer: ComputerId, name: &str) -> CoreResult<MediaOutcome> {
        self.computer(computer)?.change_media(MediaChange::Unmount {
            name: name.to_string(),
        })
    }

    pub fn turn_on(&self, id: ComputerId) -> CoreResult<()> {
        self.computer(id)?.turn_on();
        Ok(())
    }

    pub fn shutdown(&self, id: ComputerId) -> CoreResult<()> {
        self.computer(id)?.shutdown();
        Ok(())
    }

    pub fn reboot(&self, id: ComputerId) -> CoreResult<()> {
        self.computer(id)?.reboot();
        Ok(())
    }

    /// Inject an event. Returns `false` if the computer is not running.
    pub fn queue_event(&self, id: ComputerId, event: Event) -> CoreResult<bool> {
        Ok(self.computer(id)?.queue_event(event))
    }

    /// Per-tick hook: restores the global budget and expires network
    /// timeouts. Never waits on a computer.
    pub fn scheduler_tick(&self) -> TickReport {
        let stats = self.scheduler.tick();
        let timeouts = self.gateway.expire_timeouts(Instant::now());
        TickReport {
            tick: stats.tick,
            consumed_us: stats.consumed.as_micros() as u64,
            deferred: stats.deferred,
            queued: stats.queued,
            timeouts,
        }
    }

    /// Apply a new configuration. Address policy, HTTP limits and quota
    /// ceilings change at once; execution settings apply on the next start.
    pub fn reload(&self, config: CoreConfig) -> CoreResult<()> {
        config.validate()?;
        self.gateway.reconfigure(&config.http)?;
        let limits = config.computer_limits();
        for id in self.registry.ids() {
            self.quotas.register(QuotaOwner::Computer(id), limits);
        }
        let floppy = config.floppy_limits();
        for disk in self.disks.lock().unwrap_or_else(|e| e.into_inner()).keys() {
            self.quotas.register(QuotaOwner::Disk(*disk), floppy);
        }
        let mut current = self.config.write().unwrap_or_else(|e| e.into_inner());
        if current.execution != config.execution {
            warn!("execution settings changed; they take effect after a restart");
        }
        *current = config;
        info!("configuration reloaded");
        Ok(())
    }

    pub fn metrics(&self) -> Value {
        let computers: Vec<Value> = self
            .registry
            .all()
            .iter()
            .map(|c| {
                json!({
                    "id": c.id(),
                    "state": c.state(),
                    "timings": c.timings(),
                })
            })
            .collect();
        json!({
            "scheduler": self.scheduler.metrics().snapshot(),
            "gateway": self.gateway.metrics().snapshot(),
            "computers": computers,
        })
    }

    /// Shut every computer down and stop the worker pool and gateway.
    /// Runtimes get their shutdown hook unless they stay stuck past the
    /// abort grace.
    pub fn stop(&self) {
        let computers = self.registry.all();
        for computer in &computers {
            computer.shutdown();
            self.gateway.cancel_all(computer.id());
        }
        self.scheduler.settle(&computers);
        self.scheduler.stop();
        self.gateway.shutdown();
    }
}

impl Drop for ComputerHost {
    fn drop(&mut self) {
        self.stop();
    }
}
