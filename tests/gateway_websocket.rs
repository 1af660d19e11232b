// CLASSIFICATION: COMMUNITY
// Filename: gateway_websocket.rs v0.2
// Author: Lukas Bower
// Date Modified: 2027-08-30

mod common;

use std::collections::BTreeMap;
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::CloseFrame;
use tungstenite::Message;

use computer_core::quota::{QuotaOwner, ResourceKind};
use computer_core::{ComputerState, CoreError, Event, FaultKind};

use common::{events, recorder, start_host, test_config, tick_until};

const WAIT: Duration = Duration::from_secs(5);

fn bind() -> Option<TcpListener> {
    match TcpListener::bind("127.0.0.1:0") {
        Ok(listener) => Some(listener),
        Err(_) => {
            eprintln!("skipping test: cannot bind local port");
            None
        }
    }
}

#[test]
fn echo_oversized_inbound_and_remote_close() {
    let Some(listener) = bind() else {
        return;
    };
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut ws = tungstenite::accept(stream).unwrap();
        let first = ws.read().unwrap();
        ws.send(first).unwrap();
        ws.send(Message::Binary(vec![7u8; 200])).unwrap();
        ws.send(Message::Text("after".into())).unwrap();
        ws.close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        }))
        .unwrap();
        while ws.read().is_ok() {}
    });

    let mut cfg = test_config();
    cfg.http.max_websocket_message = 64;
    let (factory, log) = recorder();
    let (host, _dir) = start_host(cfg, factory);
    let computer = host.create_computer().unwrap();
    computer.turn_on();
    assert!(tick_until(&host, WAIT, || computer.state() == ComputerState::On));

    let url = format!("ws://127.0.0.1:{port}/echo");
    let handle = host
        .gateway()
        .websocket(&computer, &url, BTreeMap::new())
        .unwrap();
    assert!(tick_until(&host, WAIT, || !events(&log).is_empty()));
    assert_eq!(
        events(&log)[0],
        Event::WebsocketSuccess {
            handle,
            url: url.clone()
        }
    );

    host.gateway()
        .websocket_send(computer.id(), handle, b"hello".to_vec(), false)
        .unwrap();
    assert!(tick_until(&host, WAIT, || events(&log).len() == 5));
    server.join().unwrap();

    let seen = events(&log);
    assert_eq!(
        seen[1],
        Event::WebsocketMessage {
            handle,
            url: url.clone(),
            data: b"hello".to_vec(),
            binary: false,
        }
    );
    assert_eq!(seen[2], Event::fault(FaultKind::Quota, "Message is too large"));
    assert!(matches!(&seen[3], Event::WebsocketMessage { data, .. } if data == b"after"));
    assert_eq!(
        seen[4],
        Event::WebsocketClosed {
            handle,
            url,
            reason: Some("bye".into()),
        }
    );
    let owner = QuotaOwner::Computer(computer.id());
    assert_eq!(host.quotas().in_use(owner, ResourceKind::WebsocketConnections), 0);
    assert_eq!(host.quotas().in_use(owner, ResourceKind::WebsocketMessageBytes), 0);
}

#[test]
fn inbound_cap_applies_per_message() {
    let Some(listener) = bind() else {
        return;
    };
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut ws = tungstenite::accept(stream).unwrap();
        ws.send(Message::Binary(vec![1u8; 64])).unwrap();
        ws.send(Message::Binary(vec![2u8; 65])).unwrap();
        ws.close(None).unwrap();
        while ws.read().is_ok() {}
    });

    let mut cfg = test_config();
    cfg.http.max_websocket_message = 64;
    let (factory, log) = recorder();
    let (host, _dir) = start_host(cfg, factory);
    let computer = host.create_computer().unwrap();
    computer.turn_on();
    assert!(tick_until(&host, WAIT, || computer.state() == ComputerState::On));

    // Outbound traffic elsewhere holds the whole message-byte budget.
    let owner = QuotaOwner::Computer(computer.id());
    let held = host
        .quotas()
        .try_acquire(owner, ResourceKind::WebsocketMessageBytes, 64)
        .unwrap();

    let url = format!("ws://127.0.0.1:{port}/");
    host.gateway()
        .websocket(&computer, &url, BTreeMap::new())
        .unwrap();
    assert!(tick_until(&host, WAIT, || events(&log).len() == 4));
    server.join().unwrap();

    let seen = events(&log);
    assert!(matches!(&seen[0], Event::WebsocketSuccess { .. }));
    assert!(matches!(&seen[1], Event::WebsocketMessage { data, binary: true, .. } if data.len() == 64));
    assert_eq!(seen[2], Event::fault(FaultKind::Quota, "Message is too large"));
    assert!(matches!(&seen[3], Event::WebsocketClosed { .. }));
    held.release();
}

#[test]
fn connection_quota_and_local_close() {
    let Some(listener) = bind() else {
        return;
    };
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            thread::spawn(move || {
                if let Ok(mut ws) = tungstenite::accept(stream) {
                    while ws.read().is_ok() {}
                }
            });
        }
    });

    let (factory, log) = recorder();
    let (host, _dir) = start_host(test_config(), factory);
    let computer = host.create_computer().unwrap();
    computer.turn_on();
    assert!(tick_until(&host, WAIT, || computer.state() == ComputerState::On));
    let gateway = host.gateway();
    let owner = QuotaOwner::Computer(computer.id());
    let url = format!("ws://127.0.0.1:{port}/");

    let handles: Vec<u64> = (0..4)
        .map(|_| gateway.websocket(&computer, &url, BTreeMap::new()).unwrap())
        .collect();
    let err = gateway
        .websocket(&computer, &url, BTreeMap::new())
        .unwrap_err();
    assert_eq!(err.quota_kind(), Some(ResourceKind::WebsocketConnections));
    assert!(tick_until(&host, WAIT, || events(&log).len() == 4));

    let err = gateway
        .websocket_send(computer.id(), handles[0], vec![0u8; 200 * 1024], true)
        .unwrap_err();
    assert_eq!(err.to_string(), "malformed request: Message is too large");
    assert!(matches!(
        gateway.websocket_send(computer.id(), 9999, b"x".to_vec(), false),
        Err(CoreError::NoSuchHandle(9999))
    ));

    gateway.websocket_close(computer.id(), handles[0]).unwrap();
    assert_eq!(host.quotas().in_use(owner, ResourceKind::WebsocketConnections), 3);
    assert!(gateway.websocket_send(computer.id(), handles[0], b"x".to_vec(), false).is_err());

    thread::sleep(Duration::from_millis(100));
    host.scheduler_tick();
    assert!(events(&log)
        .iter()
        .all(|e| !matches!(e, Event::WebsocketClosed { .. })));

    host.shutdown(computer.id()).unwrap();
    assert!(tick_until(&host, WAIT, || computer.state() == ComputerState::Off));
    assert_eq!(host.quotas().in_use(owner, ResourceKind::WebsocketConnections), 0);
}

#[test]
fn disabled_websockets_are_refused() {
    let mut cfg = test_config();
    cfg.http.websocket_enabled = false;
    let (factory, _log) = recorder();
    let (host, _dir) = start_host(cfg, factory);
    let computer = host.create_computer().unwrap();
    let err = host
        .gateway()
        .websocket(&computer, "ws://127.0.0.1:9/", BTreeMap::new())
        .unwrap_err();
    assert!(matches!(err, CoreError::Disabled("websocket")));
}
