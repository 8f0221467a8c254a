//! Integration tests for end-to-end WebSocket synchronization.
//!
//! These tests start a real server and connect real clients,
//! verifying the full sync pipeline.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use quire_delta::Delta;
use quire_sync::{
    ClientError, ClientMessage, ConnectionState, DuplicatePolicy, HubConfig, ReplicaState,
    ServerConfig, ServerMessage, SyncClient, SyncEvent, SyncServer, WirePayload,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return the port and the server.
async fn start_server(config: ServerConfig) -> (u16, Arc<SyncServer>) {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..config
    };
    let server = Arc::new(SyncServer::new(config));
    let running = server.clone();
    tokio::spawn(async move {
        running.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    (port, server)
}

async fn start_server_with(hub: HubConfig) -> (u16, Arc<SyncServer>) {
    start_server(ServerConfig {
        hub,
        ..ServerConfig::default()
    })
    .await
}

async fn start_test_server() -> u16 {
    start_server_with(HubConfig::default()).await.0
}

async fn connected_client(
    id: &str,
    doc_id: Uuid,
    url: &str,
) -> (SyncClient, UnboundedReceiver<SyncEvent>) {
    let mut client = SyncClient::new(id, doc_id, url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    match timeout(Duration::from_secs(1), events.recv()).await {
        Ok(Some(SyncEvent::Connected { .. })) => {}
        other => panic!("Expected Connected event, got {other:?}"),
    }
    (client, events)
}

/// Wait for the first event matching `pred`, skipping others.
async fn wait_for(
    events: &mut UnboundedReceiver<SyncEvent>,
    pred: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("Event channel closed"),
            }
        }
    })
    .await
    .expect("Timed out waiting for event")
}

/// Poll until every client is idle and shows `expected`.
async fn wait_converged(clients: &[&SyncClient], expected: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let done = clients.iter().all(|c| {
            c.replica().state() == ReplicaState::Idle
                && c.replica().lock().pending_len() == 0
                && c.document().text() == expected
        });
        if done {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            let docs: Vec<_> = clients.iter().map(|c| c.document().text()).collect();
            panic!("Clients did not converge on {expected:?}: {docs:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_client_joins_empty_document() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let mut client = SyncClient::new("alice", Uuid::new_v4(), &url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    let event = timeout(Duration::from_secs(2), events.recv()).await.unwrap();
    assert_eq!(event, Some(SyncEvent::Connected { rev: 0 }));
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
    assert!(client.document().is_empty());
}

#[tokio::test]
async fn test_edit_reaches_other_client() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let doc_id = Uuid::new_v4();

    let (alice, mut alice_events) = connected_client("alice", doc_id, &url).await;
    let (bob, mut bob_events) = connected_client("bob", doc_id, &url).await;

    assert!(alice.apply_local(&Delta::new().insert("Hello")).await.unwrap());

    let acked = wait_for(&mut alice_events, |e| matches!(e, SyncEvent::Acked { .. })).await;
    assert_eq!(acked, SyncEvent::Acked { rev: 1 });
    let remote = wait_for(&mut bob_events, |e| matches!(e, SyncEvent::RemoteApplied { .. })).await;
    assert_eq!(remote, SyncEvent::RemoteApplied { rev: 1 });

    assert_eq!(bob.document().text(), "Hello");
    assert_eq!(bob.last_synced_rev(), 1);
}

#[tokio::test]
async fn test_concurrent_edits_converge() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let doc_id = Uuid::new_v4();

    let (alice, _alice_events) = connected_client("alice", doc_id, &url).await;
    let (bob, _bob_events) = connected_client("bob", doc_id, &url).await;

    alice.apply_local(&Delta::new().insert("Hello")).await.unwrap();
    wait_converged(&[&alice, &bob], "Hello").await;

    // Typed at the same time against rev 1, in either arrival order.
    alice.apply_local(&Delta::new().retain(5).insert(" World")).await.unwrap();
    bob.apply_local(&Delta::new().retain(4).delete(1).insert("O")).await.unwrap();
    // Buffered behind alice's in-flight change, flushed on ack.
    alice.apply_local(&Delta::new().insert(">> ")).await.unwrap();

    wait_converged(&[&alice, &bob], ">> HellO World").await;
    assert_eq!(alice.last_synced_rev(), bob.last_synced_rev());
}

#[tokio::test]
async fn test_late_joiner_gets_snapshot() {
    let (port, server) = start_server_with(HubConfig::default()).await;
    let url = format!("ws://127.0.0.1:{port}");
    let doc_id = Uuid::new_v4();

    let (alice, mut alice_events) = connected_client("alice", doc_id, &url).await;
    alice.apply_local(&Delta::new().insert("draft")).await.unwrap();
    wait_for(&mut alice_events, |e| matches!(e, SyncEvent::Acked { .. })).await;

    let mut carol = SyncClient::new("carol", doc_id, &url);
    let mut events = carol.take_event_rx().unwrap();
    carol.connect().await.unwrap();
    let event = timeout(Duration::from_secs(1), events.recv()).await.unwrap();
    assert_eq!(event, Some(SyncEvent::Connected { rev: 1 }));
    assert_eq!(carol.document().text(), "draft");

    let room = server.room_manager().get_or_create(doc_id).await;
    assert_eq!(room.stats().await.unwrap().clients, 2);
}

#[tokio::test]
async fn test_documents_are_isolated() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let (alice, mut alice_events) = connected_client("alice", Uuid::new_v4(), &url).await;
    let (_bob, mut bob_events) = connected_client("bob", Uuid::new_v4(), &url).await;

    alice.apply_local(&Delta::new().insert("mine")).await.unwrap();
    wait_for(&mut alice_events, |e| matches!(e, SyncEvent::Acked { .. })).await;

    let result = timeout(Duration::from_millis(100), bob_events.recv()).await;
    assert!(result.is_err(), "Bob should not hear about another document");
}

#[tokio::test]
async fn test_disconnect_unregisters() {
    let (port, server) = start_server_with(HubConfig::default()).await;
    let url = format!("ws://127.0.0.1:{port}");
    let doc_id = Uuid::new_v4();

    let (mut alice, _events) = connected_client("alice", doc_id, &url).await;
    let room = server.room_manager().get_or_create(doc_id).await;
    assert_eq!(room.stats().await.unwrap().clients, 1);

    alice.disconnect().await.unwrap();
    assert_eq!(alice.connection_state().await, ConnectionState::Disconnected);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while room.stats().await.unwrap().clients > 0 {
        assert!(tokio::time::Instant::now() < deadline, "Session was never unregistered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_duplicate_session_rejected() {
    let hub = HubConfig {
        duplicate_policy: DuplicatePolicy::Reject,
        ..HubConfig::default()
    };
    let (port, _server) = start_server_with(hub).await;
    let url = format!("ws://127.0.0.1:{port}");
    let doc_id = Uuid::new_v4();

    let (_first, _events) = connected_client("alice", doc_id, &url).await;
    let mut second = SyncClient::new("alice", doc_id, &url);
    let result = second.connect().await;

    assert!(matches!(result, Err(ClientError::Rejected(_))), "Got {result:?}");
    assert_eq!(second.connection_state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_replaced_session_is_closed() {
    let (port, server) = start_server_with(HubConfig::default()).await;
    let url = format!("ws://127.0.0.1:{port}");
    let doc_id = Uuid::new_v4();

    let (first, mut first_events) = connected_client("alice", doc_id, &url).await;
    let (second, mut second_events) = connected_client("alice", doc_id, &url).await;

    let closed = wait_for(&mut first_events, |e| matches!(e, SyncEvent::Closed { .. })).await;
    assert!(matches!(closed, SyncEvent::Closed { .. }));
    wait_for(&mut first_events, |e| *e == SyncEvent::Disconnected).await;
    assert_eq!(first.connection_state().await, ConnectionState::Disconnected);
    assert!(!first.apply_local(&Delta::new().insert("x")).await.unwrap());

    assert!(second.apply_local(&Delta::new().insert("y")).await.unwrap());
    let acked = wait_for(&mut second_events, |e| matches!(e, SyncEvent::Acked { .. })).await;
    assert_eq!(acked, SyncEvent::Acked { rev: 1 });
    assert_eq!(second.document().text(), "y");

    let room = server.room_manager().get_or_create(doc_id).await;
    let stats = room.stats().await.unwrap();
    assert_eq!(stats.clients, 1);
    assert_eq!(stats.processed_rev, 1);
}

#[tokio::test]
async fn test_offline_edits_sent_on_connect() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let doc_id = Uuid::new_v4();
    let (bob, _bob_events) = connected_client("bob", doc_id, &url).await;

    let mut alice = SyncClient::new("alice", doc_id, &url);
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.apply_local(&Delta::new().insert("offline draft")).await.unwrap();
    alice.connect().await.unwrap();

    let event = timeout(Duration::from_secs(1), alice_events.recv()).await.unwrap();
    assert_eq!(event, Some(SyncEvent::Connected { rev: 0 }));
    let acked = wait_for(&mut alice_events, |e| matches!(e, SyncEvent::Acked { .. })).await;
    assert_eq!(acked, SyncEvent::Acked { rev: 1 });
    wait_converged(&[&alice, &bob], "offline draft").await;
}

#[tokio::test]
async fn test_stale_offline_edits_are_reported() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let doc_id = Uuid::new_v4();

    let (alice, mut alice_events) = connected_client("alice", doc_id, &url).await;
    alice.apply_local(&Delta::new().insert("Hello")).await.unwrap();
    wait_for(&mut alice_events, |e| matches!(e, SyncEvent::Acked { .. })).await;

    let mut carol = SyncClient::new("carol", doc_id, &url);
    let mut carol_events = carol.take_event_rx().unwrap();
    carol.apply_local(&Delta::new().insert("mine")).await.unwrap();
    carol.connect().await.unwrap();

    let event = timeout(Duration::from_secs(1), carol_events.recv()).await.unwrap();
    assert_eq!(event, Some(SyncEvent::Connected { rev: 1 }));
    let event = timeout(Duration::from_secs(1), carol_events.recv()).await.unwrap();
    assert_eq!(
        event,
        Some(SyncEvent::Resynced {
            rev: 1,
            discarded: Delta::new().insert("mine"),
        })
    );
    assert_eq!(carol.document().text(), "Hello");
}

/// Poll until the server holds `expected` rooms.
async fn wait_for_rooms(server: &SyncServer, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while server.room_manager().room_count().await != expected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "Room count never reached {expected}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_empty_room_evicted_when_enabled() {
    let (port, server) = start_server(ServerConfig {
        evict_empty_rooms: true,
        ..ServerConfig::default()
    })
    .await;
    let url = format!("ws://127.0.0.1:{port}");

    let (mut alice, _events) = connected_client("alice", Uuid::new_v4(), &url).await;
    assert_eq!(server.room_manager().room_count().await, 1);

    alice.disconnect().await.unwrap();
    wait_for_rooms(&server, 0).await;
    assert_eq!(server.stats().await.active_rooms, 0);
}

#[tokio::test]
async fn test_empty_room_kept_by_default() {
    let (port, server) = start_server_with(HubConfig::default()).await;
    let url = format!("ws://127.0.0.1:{port}");
    let doc_id = Uuid::new_v4();

    let (mut alice, _events) = connected_client("alice", doc_id, &url).await;
    alice.disconnect().await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while server.stats().await.active_connections > 0 {
        assert!(tokio::time::Instant::now() < deadline, "Session never ended");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.room_manager().room_count().await, 1);
    assert!(server.room_manager().active_documents().await.contains(&doc_id));
}

#[tokio::test]
async fn test_submit_before_join_is_refused() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let submit = ClientMessage::Submit(WirePayload {
        op: r#"{"ops":[{"insert":"x"}]}"#.to_string(),
        client_id: "mallory".into(),
        base_rev: 0,
    });
    ws.send(Message::Binary(submit.encode().unwrap().into())).await.unwrap();

    let reply = timeout(Duration::from_secs(1), ws.next()).await.unwrap().unwrap().unwrap();
    let bytes: Vec<u8> = reply.into_data().into();
    assert!(matches!(
        ServerMessage::decode(&bytes).unwrap(),
        ServerMessage::Error { .. }
    ));
}

#[tokio::test]
async fn test_garbage_is_answered_with_error() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    ws.send(Message::Binary(vec![0xFF, 0xFE, 0xFD].into())).await.unwrap();

    let reply = timeout(Duration::from_secs(1), ws.next()).await.unwrap().unwrap().unwrap();
    let bytes: Vec<u8> = reply.into_data().into();
    assert!(matches!(
        ServerMessage::decode(&bytes).unwrap(),
        ServerMessage::Error { .. }
    ));
}

#[tokio::test]
async fn test_bad_operation_triggers_resync() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let doc_id = Uuid::new_v4();
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let join = ClientMessage::Join {
        client_id: "mallory".into(),
        doc_id,
    };
    ws.send(Message::Binary(join.encode().unwrap().into())).await.unwrap();
    let welcome = timeout(Duration::from_secs(1), ws.next()).await.unwrap().unwrap().unwrap();
    let bytes: Vec<u8> = welcome.into_data().into();
    assert!(matches!(
        ServerMessage::decode(&bytes).unwrap(),
        ServerMessage::Welcome { rev: 0, .. }
    ));

    let submit = ClientMessage::Submit(WirePayload {
        op: r#"{"ops":[{"retain":0}]}"#.to_string(),
        client_id: "mallory".into(),
        base_rev: 0,
    });
    ws.send(Message::Binary(submit.encode().unwrap().into())).await.unwrap();

    let mut replies = Vec::new();
    for _ in 0..2 {
        let reply = timeout(Duration::from_secs(1), ws.next()).await.unwrap().unwrap().unwrap();
        let bytes: Vec<u8> = reply.into_data().into();
        replies.push(ServerMessage::decode(&bytes).unwrap());
    }
    assert!(matches!(replies[0], ServerMessage::Error { .. }));
    assert!(matches!(replies[1], ServerMessage::Resync { rev: 0, .. }));
}

#[tokio::test]
async fn test_connect_to_missing_server_fails() {
    let port = free_port().await;
    let mut client = SyncClient::new("alice", Uuid::new_v4(), format!("ws://127.0.0.1:{port}"));
    assert!(matches!(client.connect().await, Err(ClientError::Connect(_))));
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_ping_pong() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let (client, mut events) = connected_client("pinger", Uuid::new_v4(), &url).await;

    client.send_ping().await.unwrap();
    let pong = wait_for(&mut events, |e| *e == SyncEvent::Pong).await;
    assert_eq!(pong, SyncEvent::Pong);
}
