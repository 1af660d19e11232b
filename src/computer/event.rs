// CLASSIFICATION: COMMUNITY
// Filename: event.rs v0.2
// Author: Lukas Bower
// Date Modified: 2027-08-23

//! Script-visible events delivered through a computer's FIFO queue.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

/// Identifier of an asynchronous network operation.
pub type HandleId = u64;

/// Category of a fault surfaced to the script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// The last resume overran its per-computer budget.
    SoftFault,
    /// The runtime reported a recoverable error.
    RuntimeError,
    /// An asynchronous operation hit a quota ceiling.
    Quota,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    HttpSuccess {
        handle: HandleId,
        url: String,
        status: u16,
        headers: BTreeMap<String, String>,
        body: Vec<u8>,
    },
    HttpFailure {
        handle: HandleId,
        url: String,
        message: String,
        /// Present when the server answered with an error status.
        status: Option<u16>,
    },
    WebsocketSuccess {
        handle: HandleId,
        url: String,
    },
    WebsocketFailure {
        handle: HandleId,
        url: String,
        message: String,
    },
    WebsocketMessage {
        handle: HandleId,
        url: String,
        data: Vec<u8>,
        binary: bool,
    },
    WebsocketClosed {
        handle: HandleId,
        url: String,
        reason: Option<String>,
    },
    Timeout {
        handle: HandleId,
        url: String,
    },
    Fault {
        kind: FaultKind,
        message: String,
    },
    /// Host- or script-injected event.
    Custom {
        name: String,
        args: Vec<Value>,
    },
}

impl Event {
    pub fn custom(name: &str, args: Vec<Value>) -> Self {
        Event::Custom {
            name: name.to_string(),
            args,
        }
    }

    pub fn fault(kind: FaultKind, message: impl Into<String>) -> Self {
        Event::Fault {
            kind,
            message: message.into(),
        }
    }

    /// Name the script sees for this event.
    pub fn name(&self) -> &str {
        match self {
            Event::HttpSuccess { .. } => "http_success",
            Event::HttpFailure { .. } => "http_failure",
            Event::WebsocketSuccess { .. } => "websocket_success",
            Event::WebsocketFailure { .. } => "websocket_failure",
            Event::WebsocketMessage { .. } => "websocket_message",
            Event::WebsocketClosed { .. } => "websocket_closed",
            Event::Timeout { .. } => "timeout",
            Event::Fault { .. } => "fault",
            Event::Custom { name, .. } => name,
        }
    }

    /// The network handle this event reports on, if any.
    pub fn handle(&self) -> Option<HandleId> {
        match self {
            Event::HttpSuccess { handle, .. }
            | Event::HttpFailure { handle, .. }
            | Event::WebsocketSuccess { handle, .. }
            | Event::WebsocketFailure { handle, .. }
            | Event::WebsocketMessage { handle, .. }
            | Event::WebsocketClosed { handle, .. }
            | Event::Timeout { handle, .. } => Some(*handle),
            Event::Fault { .. } | Event::Custom { .. } => None,
        }
    }
}
