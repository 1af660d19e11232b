// CLASSIFICATION: COMMUNITY
// Filename: websocket.rs v0.3
// Author: Lukas Bower
// Date Modified: 2027-08-28

//! Websocket connections. Each socket owns one thread that alternates
//! between draining outbound commands and polling for inbound frames.

use std::collections::BTreeMap;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::time::Duration;

use log::{debug, warn};
use tungstenite::client::IntoClientRequest;
use tungstenite::http::header::{HeaderName, HeaderValue};
use tungstenite::protocol::WebSocketConfig;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};
use url::Url;

use super::gateway::{Inner, OpState, Operation};
use super::policy::Verdict;
use crate::computer::{Event, FaultKind};
use crate::metrics::GatewayMetrics;
use crate::quota::QuotaPermit;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Script-side request for an open socket.
pub(crate) enum WsCommand {
    Send {
        data: Vec<u8>,
        binary: bool,
        /// Held until the frame is written.
        permit: QuotaPermit,
    },
    Close,
}

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

fn connect(addrs: &[std::net::IpAddr], port: u16, timeout: Duration) -> io::Result<TcpStream> {
    let mut last = io::Error::new(io::ErrorKind::NotFound, "no addresses");
    for ip in addrs {
        match TcpStream::connect_timeout(&SocketAddr::new(*ip, port), timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last = e,
        }
    }
    Err(last)
}

/// Frame limits are lifted at the protocol layer so an oversized message is
/// read whole and dropped by [`inbound`] instead of failing the connection.
fn socket_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = None;
    config.max_frame_size = None;
    config
}

fn build_request(
    url: &Url,
    headers: &BTreeMap<String, String>,
) -> Result<tungstenite::handshake::client::Request, String> {
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| e.to_string())?;
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| format!("Invalid header '{name}'"))?;
        let value = HeaderValue::from_str(value).map_err(|_| "Invalid header value".to_string())?;
        request.headers_mut().insert(name, value);
    }
    Ok(request)
}

/// Connection thread body.
pub(crate) fn run(
    inner: &Inner,
    op: &Operation,
    url: Url,
    headers: BTreeMap<String, String>,
    commands: Receiver<WsCommand>,
) {
    let cfg = inner.config();
    let host = url.host_str().unwrap_or_default().to_string();
    let port = url.port_or_known_default().unwrap_or(80);
    let addrs = match inner.policy().classify(&host, Some(port), &*inner.resolver()) {
        Verdict::Allowed(addrs) => addrs,
        Verdict::Denied(reason) => {
            GatewayMetrics::bump(&inner.metrics.denied);
            warn!("refused websocket to {host}: {reason}");
            inner.fail(op, reason.to_string(), None);
            return;
        }
    };

    let stream = match connect(&addrs, port, cfg.timeout()) {
        Ok(stream) => stream,
        Err(e) => {
            debug!("websocket {} connect failed: {e}", op.id);
            inner.fail(op, "Could not connect".into(), None);
            return;
        }
    };
    if !op.is_live() {
        return;
    }
    let _ = stream.set_nodelay(true);
    let _ = stream.set_read_timeout(Some(cfg.timeout()));
    let poller = match stream.try_clone() {
        Ok(poller) => poller,
        Err(e) => {
            inner.fail(op, e.to_string(), None);
            return;
        }
    };
    let request = match build_request(&url, &headers) {
        Ok(request) => request,
        Err(message) => {
            inner.fail(op, message, None);
            return;
        }
    };
    let mut socket = match tungstenite::client_tls_with_config(
        request,
        stream,
        Some(socket_config()),
        None,
    ) {
        Ok((socket, _response)) => socket,
        Err(e) => {
            inner.fail(op, e.to_string(), None);
            return;
        }
    };

    if !op.mark_open() {
        let _ = socket.close(None);
        let _ = socket.flush();
        return;
    }
    op.deliver(Event::WebsocketSuccess {
        handle: op.id,
        url: op.url.clone(),
    });
    let _ = poller.set_read_timeout(Some(POLL_INTERVAL));
    pump(inner, op, &mut socket, &commands, cfg.max_websocket_message);
    debug!("websocket {} thread exiting", op.id);
}

fn pump(
    inner: &Inner,
    op: &Operation,
    socket: &mut Socket,
    commands: &Receiver<WsCommand>,
    max_message: u64,
) {
    loop {
        if !op.is_live() {
            let _ = socket.close(None);
            let _ = socket.flush();
            return;
        }
        loop {
            match commands.try_recv() {
                Ok(WsCommand::Send { data, binary, permit }) => {
                    let message = if binary {
                        Message::Binary(data)
                    } else {
                        Message::Text(String::from_utf8_lossy(&data).into_owned())
                    };
                    let sent = socket.send(message);
                    permit.release();
                    if let Err(e) = sent {
                        closed(inner, op, Some(e.to_string()));
                        return;
                    }
                }
                Ok(WsCommand::Close) | Err(TryRecvError::Disconnected) => {
                    let _ = socket.close(None);
                    let _ = socket.flush();
                    return;
                }
                Err(TryRecvError::Empty) => break,
            }
        }
        match socket.read() {
            Ok(Message::Text(text)) => inbound(op, text.into_bytes(), false, max_message),
            Ok(Message::Binary(data)) => inbound(op, data, true, max_message),
            Ok(Message::Close(frame)) => {
                let _ = socket.flush();
                closed(inner, op, frame.map(|f| f.reason.to_string()));
                return;
            }
            Ok(_) => {}
            Err(tungstenite::Error::Io(e))
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                let _ = socket.flush();
            }
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                closed(inner, op, None);
                return;
            }
            Err(e) => {
                closed(inner, op, Some(e.to_string()));
                return;
            }
        }
    }
}

fn closed(inner: &Inner, op: &Operation, reason: Option<String>) {
    if inner.finish(op, OpState::Done) {
        op.deliver(Event::WebsocketClosed {
            handle: op.id,
            url: op.url.clone(),
            reason,
        });
    }
}

/// Deliver an inbound message, or drop it with a quota fault when it is
/// larger than the per-message cap. The connection stays open either way.
fn inbound(op: &Operation, data: Vec<u8>, binary: bool, max_message: u64) {
    if op.state() != OpState::Open {
        return;
    }
    let len = data.len() as u64;
    if len > max_message {
        warn!("websocket {} dropped {len}-byte message (limit {max_message})", op.id);
        op.deliver(Event::fault(FaultKind::Quota, "Message is too large"));
        return;
    }
    op.deliver(Event::WebsocketMessage {
        handle: op.id,
        url: op.url.clone(),
        data,
        binary,
    });
}
