// CLASSIFICATION: COMMUNITY
// Filename: gateway.rs v0.5
// Author: Lukas Bower
// Date Modified: 2027-08-28

//! Network gateway.
//!
//! Every outbound HTTP request and websocket passes through here. Cheap
//! checks run synchronously on the caller's thread and fail immediately;
//! resolution, connection and transfer run off the scheduler on the I/O pool
//! (HTTP) or a dedicated thread (websockets). Results come back as events.
//!
//! Completion, timeout and cancellation all race through one atomic state
//! transition on the operation, so its quota permit is released exactly once
//! and at most one terminal event is delivered.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::thread;
use std::time::Instant;

use log::{debug, info, warn};
use url::Url;

use super::http::{self, HttpRequest};
use super::policy::{HostResolver, NetworkPolicy, PolicyHandle, SystemResolver, Verdict};
use super::pool::IoPool;
use super::websocket::{self, WsCommand};
use crate::computer::{Computer, ComputerId, Event, HandleId};
use crate::config::HttpConfig;
use crate::error::{CoreError, CoreResult};
use crate::metrics::GatewayMetrics;
use crate::quota::{QuotaOwner, QuotaPermit, QuotaTracker, ResourceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Http,
    Websocket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpState {
    Pending,
    /// Websocket handshake finished.
    Open,
    Done,
    Cancelled,
    TimedOut,
}

impl OpState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => OpState::Pending,
            1 => OpState::Open,
            2 => OpState::Done,
            3 => OpState::Cancelled,
            _ => OpState::TimedOut,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            OpState::Pending => 0,
            OpState::Open => 1,
            OpState::Done => 2,
            OpState::Cancelled => 3,
            OpState::TimedOut => 4,
        }
    }

    pub fn is_live(self) -> bool {
        matches!(self, OpState::Pending | OpState::Open)
    }
}

/// One in-flight request or websocket.
pub(crate) struct Operation {
    pub(crate) id: HandleId,
    pub(crate) owner: ComputerId,
    pub(crate) url: String,
    pub(crate) kind: OpKind,
    state: AtomicU8,
    deadline: Instant,
    computer: Weak<Computer>,
    permit: Mutex<Option<QuotaPermit>>,
    counts_global: bool,
    commands: Mutex<Option<mpsc::Sender<WsCommand>>>,
}

impl Operation {
    pub(crate) fn state(&self) -> OpState {
        OpState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn is_live(&self) -> bool {
        self.state().is_live()
    }

    /// Pending -> Open. Fails if the operation already ended.
    pub(crate) fn mark_open(&self) -> bool {
        self.state
            .compare_exchange(
                OpState::Pending.as_u8(),
                OpState::Open.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn try_finish(&self, to: OpState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if !OpState::from_u8(current).is_live() {
                return false;
            }
            match self.state.compare_exchange(
                current,
                to.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(seen) => current = seen,
            }
        }
    }

    /// Queue an event on the owning computer, if it still exists.
    pub(crate) fn deliver(&self, event: Event) -> bool {
        match self.computer.upgrade() {
            Some(computer) => computer.queue_event(event),
            None => false,
        }
    }

    fn commands(&self) -> MutexGuard<'_, Option<mpsc::Sender<WsCommand>>> {
        self.commands.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// State shared between the gateway handle and its I/O threads.
pub(crate) struct Inner {
    config: RwLock<Arc<HttpConfig>>,
    policy: PolicyHandle,
    quotas: Arc<QuotaTracker>,
    resolver: Arc<dyn HostResolver>,
    ops: Mutex<HashMap<HandleId, Arc<Operation>>>,
    next_handle: AtomicU64,
    global_in_flight: AtomicU64,
    pub(crate) metrics: GatewayMetrics,
}

impl Inner {
    pub(crate) fn config(&self) -> Arc<HttpConfig> {
        Arc::clone(&self.config.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub(crate) fn policy(&self) -> Arc<NetworkPolicy> {
        self.policy.load()
    }

    pub(crate) fn resolver(&self) -> Arc<dyn HostResolver> {
        Arc::clone(&self.resolver)
    }

    pub(crate) fn quotas(&self) -> &Arc<QuotaTracker> {
        &self.quotas
    }

    fn ops(&self) -> MutexGuard<'_, HashMap<HandleId, Arc<Operation>>> {
        self.ops.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lookup(&self, owner: ComputerId, handle: HandleId) -> CoreResult<Arc<Operation>> {
        self.ops()
            .get(&handle)
            .filter(|op| op.owner == owner)
            .cloned()
            .ok_or(CoreError::NoSuchHandle(handle))
    }

    /// Move the operation to a terminal state and release what it holds.
    /// Returns `false` if another path already finished it.
    pub(crate) fn finish(&self, op: &Operation, to: OpState) -> bool {
        if !op.try_finish(to) {
            return false;
        }
        let permit = op.permit.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(permit) = permit {
            permit.release();
        }
        if op.counts_global {
            self.global_in_flight.fetch_sub(1, Ordering::AcqRel);
        }
        op.commands().take();
        self.ops().remove(&op.id);
        match to {
            OpState::Cancelled => GatewayMetrics::bump(&self.metrics.cancelled),
            OpState::TimedOut => GatewayMetrics::bump(&self.metrics.timed_out),
            _ => {}
        }
        true
    }

    /// Finish successfully and deliver `event`.
    pub(crate) fn complete(&self, op: &Operation, event: Event) -> bool {
        if !self.finish(op, OpState::Done) {
            return false;
        }
        GatewayMetrics::bump(&self.metrics.succeeded);
        op.deliver(event);
        true
    }

    /// Finish with a failure event appropriate to the operation kind.
    pub(crate) fn fail(&self, op: &Operation, message: String, status: Option<u16>) -> bool {
        if !self.finish(op, OpState::Done) {
            return false;
        }
        GatewayMetrics::bump(&self.metrics.failed);
        debug!("handle {} ({}) failed: {message}", op.id, op.url);
        let event = match op.kind {
            OpKind::Http => Event::HttpFailure {
                handle: op.id,
                url: op.url.clone(),
                message,
                status,
            },
            OpKind::Websocket => Event::WebsocketFailure {
                handle: op.id,
                url: op.url.clone(),
                message,
            },
        };
        op.deliver(event);
        true
    }

    fn acquire_global(&self, cfg: &HttpConfig) -> CoreResult<bool> {
        let max = cfg.global_max_requests;
        if max == 0 {
            return Ok(false);
        }
        let prev = self.global_in_flight.fetch_add(1, Ordering::AcqRel);
        if prev >= max {
            self.global_in_flight.fetch_sub(1, Ordering::AcqRel);
            return Err(CoreError::QuotaExceeded {
                kind: ResourceKind::NetworkRequests,
                limit: max,
                in_use: prev,
                requested: 1,
            });
        }
        Ok(true)
    }

    fn register(
        &self,
        computer: &Arc<Computer>,
        url: &Url,
        kind: OpKind,
        permit: QuotaPermit,
        counts_global: bool,
        commands: Option<mpsc::Sender<WsCommand>>,
        deadline: Instant,
    ) -> Arc<Operation> {
        let op = Arc::new(Operation {
            id: self.next_handle.fetch_add(1, Ordering::Relaxed),
            owner: computer.id(),
            url: url.to_string(),
            kind,
            state: AtomicU8::new(OpState::Pending.as_u8()),
            deadline,
            computer: Arc::downgrade(computer),
            permit: Mutex::new(Some(permit)),
            counts_global,
            commands: Mutex::new(commands),
        });
        self.ops().insert(op.id, Arc::clone(&op));
        op
    }
}

/// Parse `raw` and check its scheme against `schemes`.
fn parse_url(raw: &str, schemes: &[&str]) -> CoreResult<Url> {
    let url = Url::parse(raw).map_err(|_| CoreError::MalformedRequest("URL malformed".into()))?;
    if !schemes.contains(&url.scheme()) {
        return Err(CoreError::MalformedRequest(format!(
            "Invalid protocol '{}'",
            url.scheme()
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(CoreError::MalformedRequest("URL malformed".into()));
    }
    Ok(url)
}

pub struct NetworkGateway {
    inner: Arc<Inner>,
    pool: IoPool,
}

impl NetworkGateway {
    pub fn new(config: &HttpConfig, quotas: Arc<QuotaTracker>) -> CoreResult<Self> {
        Self::with_resolver(config, quotas, Arc::new(SystemResolver))
    }

    /// Build a gateway that resolves names through `resolver`.
    pub fn with_resolver(
        config: &HttpConfig,
        quotas: Arc<QuotaTracker>,
        resolver: Arc<dyn HostResolver>,
    ) -> CoreResult<Self> {
        let policy = NetworkPolicy::from_config(config)?;
        let pool = IoPool::new("http-io", config.io_threads)?;
        info!(
            "network gateway ready: {} I/O threads, {} whitelist / {} blacklist rules",
            pool.size(),
            policy.whitelist().rules().len(),
            policy.blacklist().rules().len()
        );
        Ok(Self {
            inner: Arc::new(Inner {
                config: RwLock::new(Arc::new(config.clone())),
                policy: PolicyHandle::new(policy),
                quotas,
                resolver,
                ops: Mutex::new(HashMap::new()),
                next_handle: AtomicU64::new(1),
                global_in_flight: AtomicU64::new(0),
                metrics: GatewayMetrics::default(),
            }),
            pool,
        })
    }

    /// Swap in a new policy and limits. Operations already running keep the
    /// settings they started with.
    pub fn reconfigure(&self, config: &HttpConfig) -> CoreResult<()> {
        let policy = NetworkPolicy::from_config(config)?;
        self.inner.policy.store(policy);
        *self.inner.config.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(config.clone());
        info!("network gateway reconfigured");
        Ok(())
    }

    pub fn policy(&self) -> Arc<NetworkPolicy> {
        self.inner.policy()
    }

    pub fn config(&self) -> Arc<HttpConfig> {
        self.inner.config()
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.inner.metrics
    }

    /// Classify a target against the active policy, resolving if needed.
    pub fn check_address(&self, host: &str, port: Option<u16>) -> Verdict {
        self.inner.policy().classify(host, port, &*self.inner.resolver)
    }

    fn deny(&self, host: &str, verdict: Option<Verdict>) -> CoreResult<()> {
        if let Some(Verdict::Denied(reason)) = verdict {
            GatewayMetrics::bump(&self.inner.metrics.denied);
            warn!("refused connection to {host}: {reason}");
            return Err(reason.into());
        }
        Ok(())
    }

    fn acquire(&self, computer: &Arc<Computer>, kind: ResourceKind) -> CoreResult<QuotaPermit> {
        self.inner
            .quotas
            .try_acquire(QuotaOwner::Computer(computer.id()), kind, 1)
            .map_err(|rejection| {
                GatewayMetrics::bump(&self.inner.metrics.rejected);
                CoreError::from(rejection)
            })
    }

    /// Start an HTTP request. The handle identifies the eventual
    /// `HttpSuccess`, `HttpFailure` or `Timeout` event.
    pub fn request(&self, computer: &Arc<Computer>, request: HttpRequest) -> CoreResult<HandleId> {
        let cfg = self.inner.config();
        if !cfg.enabled {
            return Err(CoreError::Disabled("http"));
        }
        let url = parse_url(&request.url, &["http", "https"])?;
        let body_len = request.body.as_ref().map_or(0, Vec::len) as u64;
        if body_len > cfg.max_upload {
            return Err(CoreError::MalformedRequest("Request body is too large".into()));
        }
        let host = url.host_str().unwrap_or_default();
        self.deny(host, self.inner.policy().precheck(host, url.port_or_known_default()))?;
        let permit = self.acquire(computer, ResourceKind::NetworkRequests)?;
        let counts_global = match self.inner.acquire_global(&cfg) {
            Ok(counted) => counted,
            Err(e) => {
                GatewayMetrics::bump(&self.inner.metrics.rejected);
                return Err(e);
            }
        };
        let timeout = request.timeout.unwrap_or_else(|| cfg.timeout());
        let op = self.inner.register(
            computer,
            &url,
            OpKind::Http,
            permit,
            counts_global,
            None,
            Instant::now() + timeout,
        );
        GatewayMetrics::bump(&self.inner.metrics.requests);
        debug!("computer #{} http {} {} as handle {}", op.owner, request.method, op.url, op.id);

        let id = op.id;
        let inner = Arc::clone(&self.inner);
        let job_op = Arc::clone(&op);
        if !self
            .pool
            .execute(move || http::perform(&inner, &job_op, request, url, timeout))
        {
            self.inner.finish(&op, OpState::Cancelled);
            return Err(CoreError::Disabled("network gateway"));
        }
        Ok(id)
    }

    /// Open a websocket. Success is reported with `WebsocketSuccess`.
    pub fn websocket(
        &self,
        computer: &Arc<Computer>,
        url: &str,
        headers: BTreeMap<String, String>,
    ) -> CoreResult<HandleId> {
        let cfg = self.inner.config();
        if !cfg.enabled || !cfg.websocket_enabled {
            return Err(CoreError::Disabled("websocket"));
        }
        let url = parse_url(url, &["ws", "wss"])?;
        let host = url.host_str().unwrap_or_default();
        self.deny(host, self.inner.policy().precheck(host, url.port_or_known_default()))?;
        let permit = self.acquire(computer, ResourceKind::WebsocketConnections)?;
        let (tx, rx) = mpsc::channel();
        let op = self.inner.register(
            computer,
            &url,
            OpKind::Websocket,
            permit,
            false,
            Some(tx),
            Instant::now() + cfg.timeout(),
        );
        GatewayMetrics::bump(&self.inner.metrics.websockets);
        debug!("computer #{} websocket {} as handle {}", op.owner, op.url, op.id);

        let inner = Arc::clone(&self.inner);
        let thread_op = Arc::clone(&op);
        let spawned = thread::Builder::new()
            .name(format!("websocket-{}", op.id))
            .spawn(move || websocket::run(&inner, &thread_op, url, headers, rx));
        if let Err(e) = spawned {
            self.inner.finish(&op, OpState::Cancelled);
            return Err(e.into());
        }
        Ok(op.id)
    }

    /// Send a message on an open websocket.
    pub fn websocket_send(
        &self,
        owner: ComputerId,
        handle: HandleId,
        data: Vec<u8>,
        binary: bool,
    ) -> CoreResult<()> {
        let op = self.inner.lookup(owner, handle)?;
        if op.kind != OpKind::Websocket || op.state() != OpState::Open {
            return Err(CoreError::NoSuchHandle(handle));
        }
        let cfg = self.inner.config();
        if data.len() as u64 > cfg.max_websocket_message {
            return Err(CoreError::MalformedRequest("Message is too large".into()));
        }
        let permit = self.inner.quotas.try_acquire(
            QuotaOwner::Computer(owner),
            ResourceKind::WebsocketMessageBytes,
            data.len() as u64,
        )?;
        let commands = op.commands();
        let sent = commands
            .as_ref()
            .map(|tx| tx.send(WsCommand::Send { data, binary, permit }).is_ok())
            .unwrap_or(false);
        if sent {
            Ok(())
        } else {
            Err(CoreError::NoSuchHandle(handle))
        }
    }

    /// Close a websocket from the script side. No event is delivered.
    pub fn websocket_close(&self, owner: ComputerId, handle: HandleId) -> CoreResult<()> {
        let op = self.inner.lookup(owner, handle)?;
        if op.kind != OpKind::Websocket {
            return Err(CoreError::NoSuchHandle(handle));
        }
        if let Some(tx) = op.commands().as_ref() {
            let _ = tx.send(WsCommand::Close);
        }
        self.inner.finish(&op, OpState::Done);
        Ok(())
    }

    /// Cancel every operation owned by `owner` without delivering events.
    pub fn cancel_all(&self, owner: ComputerId) -> usize {
        let owned: Vec<Arc<Operation>> = self
            .inner
            .ops()
            .values()
            .filter(|op| op.owner == owner)
            .cloned()
            .collect();
        let mut cancelled = 0;
        for op in owned {
            if let Some(tx) = op.commands().as_ref() {
                let _ = tx.send(WsCommand::Close);
            }
            if self.inner.finish(&op, OpState::Cancelled) {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            debug!("cancelled {cancelled} network operations for computer #{owner}");
        }
        cancelled
    }

    /// Time out operations whose deadline has passed. Websockets only time
    /// out while connecting.
    pub fn expire_timeouts(&self, now: Instant) -> usize {
        let due: Vec<Arc<Operation>> = self
            .inner
            .ops()
            .values()
            .filter(|op| op.state() == OpState::Pending && op.deadline <= now)
            .cloned()
            .collect();
        let mut expired = 0;
        for op in due {
            if !self.inner.finish(&op, OpState::TimedOut) {
                continue;
            }
            expired += 1;
            debug!("handle {} ({}) timed out", op.id, op.url);
            let event = match op.kind {
                OpKind::Http => Event::Timeout {
                    handle: op.id,
                    url: op.url.clone(),
                },
                OpKind::Websocket => Event::WebsocketFailure {
                    handle: op.id,
                    url: op.url.clone(),
                    message: CoreError::Timeout.to_string(),
                },
            };
            op.deliver(event);
        }
        expired
    }

    /// Live operations owned by `owner`.
    pub fn in_flight(&self, owner: ComputerId) -> usize {
        self.inner.ops().values().filter(|op| op.owner == owner).count()
    }

    pub fn total_in_flight(&self) -> usize {
        self.inner.ops().len()
    }

    /// Cancel everything and stop the I/O pool.
    pub fn shutdown(&self) {
        let owners: Vec<ComputerId> = self.inner.ops().values().map(|op| op.owner).collect();
        for owner in owners {
            self.cancel_all(owner);
        }
        self.pool.shutdown();
        info!("network gateway stopped");
    }
}

impl Drop for NetworkGateway {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_checks() {
        assert!(parse_url("http://example.com/", &["http", "https"]).is_ok());
        assert!(matches!(
            parse_url("ftp://example.com/", &["http", "https"]),
            Err(CoreError::MalformedRequest(m)) if m == "Invalid protocol 'ftp'"
        ));
        assert!(matches!(
            parse_url("not a url", &["http"]),
            Err(CoreError::MalformedRequest(_))
        ));
    }

    #[test]
    fn finish_is_single_shot() {
        let op = Operation {
            id: 1,
            owner: 1,
            url: "http://example.com/".into(),
            kind: OpKind::Http,
            state: AtomicU8::new(OpState::Pending.as_u8()),
            deadline: Instant::now(),
            computer: Weak::new(),
            permit: Mutex::new(None),
            counts_global: false,
            commands: Mutex::new(None),
        };
        assert!(op.try_finish(OpState::TimedOut));
        assert!(!op.try_finish(OpState::Done));
        assert!(!op.try_finish(OpState::Cancelled));
        assert_eq!(op.state(), OpState::TimedOut);
    }
}
