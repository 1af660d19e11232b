// CLASSIFICATION: COMMUNITY
// Filename: slice.rs v0.3
// Author: Lukas Bower
// Date Modified: 2027-08-26

//! The runtime's view of one resume.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::computer::{Computer, ComputerId, Event, FaultKind, FileSystem, HandleId};
use crate::error::CoreResult;
use crate::net::{HttpRequest, NetworkGateway};
use crate::quota::QuotaTracker;

/// Shared collaborators handed to every slice.
#[derive(Clone)]
pub struct Services {
    pub gateway: Arc<NetworkGateway>,
    pub quotas: Arc<QuotaTracker>,
}

/// Cooperative cancellation flag shared between a slice and the monitor.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Returned by [`Slice::checkpoint`] once the slice is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Too long without yielding")
    }
}

impl std::error::Error for Interrupted {}

pub struct Slice<'a> {
    computer: &'a Arc<Computer>,
    fs: &'a mut FileSystem,
    services: &'a Services,
    started: Instant,
    deadline: Instant,
    token: CancelToken,
}

impl<'a> Slice<'a> {
    pub(crate) fn new(
        computer: &'a Arc<Computer>,
        fs: &'a mut FileSystem,
        services: &'a Services,
        started: Instant,
        budget: Duration,
        token: CancelToken,
    ) -> Self {
        Self {
            computer,
            fs,
            services,
            started,
            deadline: started + budget,
            token,
        }
    }

    pub fn computer_id(&self) -> ComputerId {
        self.computer.id()
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_interrupted(&self) -> bool {
        self.token.is_cancelled() || Instant::now() >= self.deadline
    }

    /// Yield point. Once the budget is spent the runtime must unwind and
    /// return from `resume`.
    pub fn checkpoint(&self) -> Result<(), Interrupted> {
        if self.is_interrupted() {
            self.token.cancel();
            Err(Interrupted)
        } else {
            Ok(())
        }
    }

    pub fn pop_event(&mut self) -> Option<Event> {
        self.computer.pop_event()
    }

    pub fn pending_events(&self) -> usize {
        self.computer.pending_events()
    }

    pub fn queue_event(&mut self, event: Event) -> bool {
        self.computer.queue_event(event)
    }

    pub fn push_error(&mut self, kind: FaultKind, message: impl Into<String>) -> bool {
        self.computer.push_error(kind, message)
    }

    pub fn fs(&mut self) -> &mut FileSystem {
        &mut *self.fs
    }

    pub fn http_request(&mut self, request: HttpRequest) -> CoreResult<HandleId> {
        self.services.gateway.request(self.computer, request)
    }

    pub fn websocket_connect(
        &mut self,
        url: &str,
        headers: BTreeMap<String, String>,
    ) -> CoreResult<HandleId> {
        self.services.gateway.websocket(self.computer, url, headers)
    }

    pub fn websocket_send(&mut self, handle: HandleId, data: Vec<u8>, binary: bool) -> CoreResult<()> {
        self.services
            .gateway
            .websocket_send(self.computer.id(), handle, data, binary)
    }

    pub fn websocket_close(&mut self, handle: HandleId) -> CoreResult<()> {
        self.services.gateway.websocket_close(self.computer.id(), handle)
    }

    pub fn quotas(&self) -> &QuotaTracker {
        &self.services.quotas
    }

    /// Ask the scheduler to turn this computer off after the resume.
    pub fn request_shutdown(&mut self) {
        self.computer.shutdown();
    }

    pub fn request_reboot(&mut self) {
        self.computer.reboot();
    }
}
