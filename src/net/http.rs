// CLASSIFICATION: COMMUNITY
// Filename: http.rs v0.3
// Author: Lukas Bower
// Date Modified: 2027-08-28

//! HTTP transfers, executed on the gateway's I/O pool.

use std::collections::BTreeMap;
use std::io::{self, Read};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use url::Url;

use super::gateway::{Inner, Operation};
use super::policy::{HostResolver, NetworkPolicy, Verdict};
use crate::computer::Event;
use crate::error::DenyReason;
use crate::metrics::GatewayMetrics;

const MAX_REDIRECTS: u32 = 16;
const TOO_LARGE: &str = "Response is too large";

/// An outbound HTTP request as issued by a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Vec<u8>>,
    pub follow_redirects: bool,
    /// Overrides the configured timeout.
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".into(),
            headers: BTreeMap::new(),
            body: None,
            follow_redirects: true,
            timeout: None,
        }
    }

    pub fn post(url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            method: "POST".into(),
            body: Some(body.into()),
            ..Self::get(url)
        }
    }

    pub fn method(mut self, method: &str) -> Self {
        self.method = method.to_ascii_uppercase();
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Resolver handed to the HTTP client. The requested host and port answer
/// with the addresses that already passed the policy; any other netloc (a
/// redirect target) is classified before the client may connect.
struct PinnedResolver {
    host: String,
    port: u16,
    addrs: Vec<IpAddr>,
    policy: Arc<NetworkPolicy>,
    resolver: Arc<dyn HostResolver>,
    denied: Arc<Mutex<Option<DenyReason>>>,
}

fn split_netloc(netloc: &str) -> Option<(&str, u16)> {
    let (host, port) = netloc.rsplit_once(':')?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Some((host, port.parse().ok()?))
}

impl ureq::Resolver for PinnedResolver {
    fn resolve(&self, netloc: &str) -> io::Result<Vec<SocketAddr>> {
        let (host, port) = split_netloc(netloc)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "bad netloc"))?;
        let host_key = host.to_ascii_lowercase();
        let addrs = if host_key == self.host && port == self.port {
            self.addrs.clone()
        } else {
            match self.policy.classify(host, Some(port), &*self.resolver) {
                Verdict::Allowed(addrs) => addrs,
                Verdict::Denied(reason) => {
                    debug!("redirect to {host} refused: {reason}");
                    *self.denied.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason.clone());
                    return Err(io::Error::new(io::ErrorKind::PermissionDenied, reason.to_string()));
                }
            }
        };
        Ok(addrs.into_iter().map(|ip| SocketAddr::new(ip, port)).collect())
    }
}

type Parsed = (u16, BTreeMap<String, String>, Vec<u8>);

fn read_response(resp: ureq::Response, max: u64) -> Result<Parsed, String> {
    let status = resp.status();
    let headers: BTreeMap<String, String> = resp
        .headers_names()
        .into_iter()
        .filter_map(|name| {
            let value = resp.header(&name)?.to_string();
            Some((name, value))
        })
        .collect();
    let declared = resp
        .header("content-length")
        .and_then(|v| v.trim().parse::<u64>().ok());
    if declared.map_or(false, |len| len > max) {
        return Err(TOO_LARGE.into());
    }
    let mut body = Vec::new();
    resp.into_reader()
        .take(max.saturating_add(1))
        .read_to_end(&mut body)
        .map_err(|e| e.to_string())?;
    if body.len() as u64 > max {
        return Err(TOO_LARGE.into());
    }
    Ok((status, headers, body))
}

fn transport_message(err: &ureq::Transport) -> String {
    match err.kind() {
        ureq::ErrorKind::Dns => "Could not resolve host".into(),
        ureq::ErrorKind::ConnectionFailed => "Could not connect".into(),
        ureq::ErrorKind::TooManyRedirects => "Too many redirects".into(),
        _ => err.to_string(),
    }
}

/// Run one request to completion and report the result through `inner`.
/// Results for operations that already timed out or were cancelled are
/// discarded.
pub(crate) fn perform(inner: &Inner, op: &Operation, request: HttpRequest, url: Url, timeout: Duration) {
    if !op.is_live() {
        return;
    }
    let cfg = inner.config();
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
    let policy = inner.policy();
    let resolver = inner.resolver();
    let port = url.port_or_known_default().unwrap_or(0);
    let addrs = match policy.classify(&host, Some(port), &*resolver) {
        Verdict::Allowed(addrs) => addrs,
        Verdict::Denied(reason) => {
            GatewayMetrics::bump(&inner.metrics.denied);
            warn!("refused connection to {host}: {reason}");
            inner.fail(op, reason.to_string(), None);
            return;
        }
    };
    if !op.is_live() {
        return;
    }

    let denied = Arc::new(Mutex::new(None));
    let agent = ureq::AgentBuilder::new()
        .timeout(timeout)
        .redirects(if request.follow_redirects { MAX_REDIRECTS } else { 0 })
        .resolver(PinnedResolver {
            host,
            port,
            addrs,
            policy,
            resolver,
            denied: Arc::clone(&denied),
        })
        .build();
    let mut call = agent.request(&request.method, url.as_str());
    for (name, value) in &request.headers {
        call = call.set(name, value);
    }
    let result = match &request.body {
        Some(body) => call.send_bytes(body),
        None => call.call(),
    };

    match result {
        Ok(resp) => match read_response(resp, cfg.max_download) {
            Ok((status, headers, body)) => {
                debug!("handle {} got {status} ({} bytes)", op.id, body.len());
                inner.complete(
                    op,
                    Event::HttpSuccess {
                        handle: op.id,
                        url: op.url.clone(),
                        status,
                        headers,
                        body,
                    },
                );
            }
            Err(message) => {
                inner.fail(op, message, None);
            }
        },
        Err(ureq::Error::Status(code, resp)) => {
            let text = resp.status_text().to_string();
            let message = if text.is_empty() {
                format!("HTTP {code}")
            } else {
                text
            };
            inner.fail(op, message, Some(code));
        }
        Err(ureq::Error::Transport(t)) => {
            let reason = denied.lock().unwrap_or_else(|e| e.into_inner()).take();
            let message = match reason {
                Some(reason) => reason.to_string(),
                None => transport_message(&t),
            };
            inner.fail(op, message, None);
        }
    }
}
