//! End-to-end tests of two connections talking directly, without a daemon.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rbus_core::address::generate_guid;
use rbus_core::auth::{
    client_handshake, server_handshake, ClientAuth, Mechanism, Mechanisms, PeerCredentials,
    ServerAuth,
};
use rbus_core::bus::{errors, signals, LOCAL_INTERFACE, PEER_INTERFACE};
use rbus_core::config::ConnectionConfig;
use rbus_core::connection::{Connection, Interface, MethodError};
use rbus_core::match_rule::MatchRule;
use rbus_core::wire::{Message, Value};
use rbus_core::BusError;
use tokio::net::UnixStream;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// Authenticates both ends of a socket pair and wraps them in connections.
async fn connected_pair() -> (Connection, Connection) {
    let (mut server_io, mut client_io) = UnixStream::pair().unwrap();
    let guid = generate_guid();
    let server_auth = ServerAuth::new(guid.clone(), Mechanisms::EXTERNAL)
        .with_peer_credentials(PeerCredentials::from_stream(&server_io).ok());
    let client_auth = ClientAuth::new(Mechanisms::ALL);

    let (outcome, server_guid) = tokio::join!(
        server_handshake(&mut server_io, server_auth),
        client_handshake(&mut client_io, client_auth),
    );
    assert_eq!(outcome.unwrap().mechanism, Mechanism::External);
    assert_eq!(server_guid.unwrap(), guid);

    let config = ConnectionConfig::default().with_reply_timeout(WAIT);
    (
        Connection::from_stream(server_io, config.clone()),
        Connection::from_stream(client_io, config),
    )
}

fn calculator() -> Interface {
    Interface::new("org.example.Calculator")
        .with_method("Add", "uu", "u", |call| {
            let a = call.body()[0].as_u32().unwrap_or_default();
            let b = call.body()[1].as_u32().unwrap_or_default();
            a.checked_add(b)
                .map(|sum| vec![sum.into()])
                .ok_or_else(|| MethodError::named("org.example.Error.Overflow", "sum overflows"))
        })
        .with_method("Fail", "", "", |_| Err(MethodError::failed("broken")))
        .with_signal("Computed", "u")
}

fn add_call(a: u32, b: u32) -> Message {
    Message::method_call("/org/example/Calculator", "Add")
        .unwrap()
        .with_interface("org.example.Calculator")
        .with_body(vec![a.into(), b.into()])
        .unwrap()
}

#[tokio::test]
async fn test_method_call_round_trip() {
    let (server, client) = connected_pair().await;
    server
        .export("/org/example/Calculator", calculator())
        .unwrap();

    let reply = timeout(WAIT, client.call(add_call(2, 3)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.body(), &[Value::UInt32(5)]);

    let err = client.call(add_call(u32::MAX, 1)).await.unwrap_err();
    assert_eq!(err.error_name(), Some("org.example.Error.Overflow"));

    let fail = Message::method_call("/org/example/Calculator", "Fail")
        .unwrap()
        .with_interface("org.example.Calculator");
    match client.call(fail).await.unwrap_err() {
        BusError::MethodError { name, message } => {
            assert_eq!(name, errors::FAILED);
            assert_eq!(
                message,
                "Error Executing Method org.example.Calculator.Fail: broken"
            );
        },
        other => panic!("unexpected error {other:?}"),
    }

    client.disconnect().await;
    server.disconnect().await;
}

#[tokio::test]
async fn test_unknown_object_and_method() {
    let (server, client) = connected_pair().await;
    server
        .export("/org/example/Calculator", calculator())
        .unwrap();

    let missing = Message::method_call("/nowhere", "Add")
        .unwrap()
        .with_interface("org.example.Calculator");
    let err = client.call(missing).await.unwrap_err();
    assert_eq!(err.error_name(), Some(errors::UNKNOWN_OBJECT));

    // Right member, wrong signature.
    let wrong = Message::method_call("/org/example/Calculator", "Add")
        .unwrap()
        .with_interface("org.example.Calculator")
        .with_body(vec!["two".into()])
        .unwrap();
    let err = client.call(wrong).await.unwrap_err();
    assert_eq!(err.error_name(), Some(errors::UNKNOWN_METHOD));

    let ping = Message::method_call("/nowhere", "Ping")
        .unwrap()
        .with_interface(PEER_INTERFACE);
    assert!(client.call(ping).await.is_ok());

    client.disconnect().await;
    server.disconnect().await;
}

#[tokio::test]
async fn test_async_and_callback_calls() {
    let (server, client) = connected_pair().await;
    server
        .export("/org/example/Calculator", calculator())
        .unwrap();

    let pending = client.call_async(add_call(40, 2)).unwrap();
    let reply = timeout(WAIT, pending).await.unwrap().unwrap();
    assert_eq!(reply.body()[0].as_u32(), Some(42));

    let (tx, rx) = tokio::sync::oneshot::channel();
    client
        .call_with_callback(add_call(1, 1), move |result| {
            let _ = tx.send(result.map(|reply| reply.body()[0].as_u32()));
        })
        .unwrap();
    let sum = timeout(WAIT, rx).await.unwrap().unwrap().unwrap();
    assert_eq!(sum, Some(2));

    client.disconnect().await;
    server.disconnect().await;
}

#[tokio::test]
async fn test_signals_reach_matching_handlers() {
    let (server, client) = connected_pair().await;
    let hits = Arc::new(AtomicUsize::new(0));
    let values = Arc::new(Mutex::new(Vec::new()));

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let counter = Arc::clone(&hits);
    let seen = Arc::clone(&values);
    client.add_signal_handler(
        MatchRule::signal("org.example.Calculator", "Computed"),
        move |signal| {
            counter.fetch_add(1, Ordering::SeqCst);
            seen.lock().unwrap().push(signal.body()[0].clone());
            let _ = tx.send(());
        },
    );

    server
        .emit_signal(
            "/org/example/Calculator",
            "org.example.Calculator",
            "Other",
            vec![],
        )
        .unwrap();
    server
        .emit_signal(
            "/org/example/Calculator",
            "org.example.Calculator",
            "Computed",
            vec![7u32.into()],
        )
        .unwrap();

    timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(*values.lock().unwrap(), vec![Value::UInt32(7)]);

    client.disconnect().await;
    server.disconnect().await;
}

#[tokio::test]
async fn test_calls_after_peer_disconnect_fail() {
    let (server, client) = connected_pair().await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    client.add_signal_handler(
        MatchRule::new().with_interface(LOCAL_INTERFACE).with_member(signals::DISCONNECTED),
        move |_| {
            let _ = tx.send(());
        },
    );

    server.disconnect().await;
    let result = timeout(WAIT, async {
        match client.call_async(add_call(1, 2)) {
            Ok(pending) => pending.await,
            Err(e) => Err(e),
        }
    })
    .await
    .unwrap();
    match result {
        Err(BusError::Disconnected) => {},
        Err(e) => assert_eq!(e.error_name(), Some(errors::DISCONNECTED)),
        Ok(reply) => panic!("unexpected reply {reply}"),
    }

    timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert!(!client.is_connected());
    let err = client.take_error().unwrap();
    assert_eq!(err.error_name(), Some(errors::DISCONNECTED));
    client.disconnect().await;
}
