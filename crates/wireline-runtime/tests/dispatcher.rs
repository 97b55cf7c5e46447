//! End-to-end dispatcher tests against a scripted in-memory daemon.

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use wireline_core::message::{DeliveryState, Message, ReceiptKind, Recipient};
use wireline_core::types::{Identity, Timestamp};
use wireline_runtime::{
    start_with_connections, AccountConfig, AccountEvent, AccountRuntime, DaemonConnection,
    ServerAddress,
};

const ACCOUNT: &str = "+15550000001";
const ALICE: &str = "+15551230001";
const SEND_TIMESTAMP: u64 = 1_700_000_001_000;

/// Answers command-channel requests the way the daemon would.
fn spawn_command_daemon(server: DuplexStream) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (read, mut write) = tokio::io::split(server);
        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let request: Value = serde_json::from_str(&line).unwrap();
            let id = request["id"].clone();
            let result = match request["method"].as_str().unwrap() {
                "listContacts" | "listGroups" | "listDevices" => json!([]),
                "send" => json!({
                    "timestamp": SEND_TIMESTAMP,
                    "results": [{
                        "recipientAddress": {"number": ALICE},
                        "type": "SUCCESS",
                    }],
                }),
                _ => Value::Null,
            };
            let response = json!({"jsonrpc": "2.0", "id": id, "result": result});
            let frame = format!("{response}\n");
            write.write_all(frame.as_bytes()).await.unwrap();
        }
    })
}

/// Acknowledges the subscription, then forwards scripted envelopes. The
/// connection stays open until the sender is dropped.
fn spawn_event_daemon(
    server: DuplexStream,
    mut frames: mpsc::UnboundedReceiver<Value>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (read, mut write) = tokio::io::split(server);
        let mut lines = BufReader::new(read).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let request: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(request["method"], "subscribeReceive");
        let ack = json!({"jsonrpc": "2.0", "id": request["id"], "result": 0});
        write
            .write_all(format!("{ack}\n").as_bytes())
            .await
            .unwrap();

        while let Some(envelope) = frames.recv().await {
            let notification = json!({
                "jsonrpc": "2.0",
                "method": "receive",
                "params": {"envelope": envelope, "account": ACCOUNT},
            });
            write
                .write_all(format!("{notification}\n").as_bytes())
                .await
                .unwrap();
        }
    })
}

struct Harness {
    runtime: AccountRuntime,
    envelopes: mpsc::UnboundedSender<Value>,
    _command_daemon: JoinHandle<()>,
    _event_daemon: JoinHandle<()>,
}

fn start_harness(data_dir: &std::path::Path) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let (command_client, command_server) = tokio::io::duplex(64 * 1024);
    let (event_client, event_server) = tokio::io::duplex(64 * 1024);
    let (envelope_tx, envelope_rx) = mpsc::unbounded_channel();

    let command_daemon = spawn_command_daemon(command_server);
    let event_daemon = spawn_event_daemon(event_server, envelope_rx);

    let config = AccountConfig::new(
        ACCOUNT,
        ServerAddress::Tcp("unused:0".to_string()),
        data_dir,
    );
    let runtime = start_with_connections(
        config,
        DaemonConnection::from_stream(command_client),
        DaemonConnection::from_stream(event_client),
    )
    .unwrap();

    Harness {
        runtime,
        envelopes: envelope_tx,
        _command_daemon: command_daemon,
        _event_daemon: event_daemon,
    }
}

fn data_envelope(from: &str, timestamp: u64, body: &str) -> Value {
    json!({
        "sourceNumber": from,
        "sourceName": "Alice",
        "sourceDevice": 1,
        "timestamp": timestamp,
        "dataMessage": {"message": body, "timestamp": timestamp},
    })
}

fn receipt_envelope(from: &str, kind: &str, when: u64, targets: &[u64]) -> Value {
    json!({
        "sourceNumber": from,
        "sourceDevice": 1,
        "timestamp": when,
        "receiptMessage": {
            "when": when,
            "isDelivery": kind == "delivery",
            "isRead": kind == "read",
            "isViewed": kind == "viewed",
            "timestamps": targets,
        },
    })
}

fn reaction_envelope(from: &str, emoji: &str, target_ts: u64, remove: bool) -> Value {
    json!({
        "sourceNumber": from,
        "sourceDevice": 1,
        "timestamp": target_ts + 10,
        "dataMessage": {
            "reaction": {
                "emoji": emoji,
                "targetAuthorNumber": from,
                "targetSentTimestamp": target_ts,
                "isRemove": remove,
            },
        },
    })
}

#[tokio::test]
async fn inbound_message_creates_contact_and_lands_in_conversation() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = start_harness(dir.path());

    harness
        .envelopes
        .send(data_envelope(ALICE, 1_000, "hello"))
        .unwrap();
    let event = harness.runtime.events.recv().await.unwrap();
    let AccountEvent::Message { message } = event else {
        panic!("expected a message event, got {event:?}");
    };
    assert_eq!(message.sender().as_str(), ALICE);

    let account = Identity::parse(ACCOUNT).unwrap();
    let alice = Identity::parse(ALICE).unwrap();
    let conversation = harness
        .runtime
        .handle
        .conversation(Recipient::Contact(alice.clone()))
        .await
        .unwrap();
    assert_eq!(conversation.len(), 1);
    // Inbound 1:1 messages are addressed to us and delivered on arrival.
    let meta = conversation[0].meta();
    assert_eq!(meta.recipient, Recipient::Contact(account.clone()));
    assert!(meta.is_delivered);
    assert_eq!(meta.time_delivered, Some(Timestamp::new(1_000)));

    // The Note-to-Self conversation stays empty.
    let with_self = harness
        .runtime
        .handle
        .conversation(Recipient::Contact(account))
        .await
        .unwrap();
    assert!(with_self.is_empty());

    // The sender was registered exactly once, with the envelope's name.
    let contacts = harness.runtime.handle.contacts().await.unwrap();
    let alice_entries: Vec<_> = contacts.iter().filter(|c| c.matches(&alice)).collect();
    assert_eq!(alice_entries.len(), 1);
    assert_eq!(alice_entries[0].name.as_deref(), Some("Alice"));

    harness.runtime.handle.shutdown().await.unwrap();
    harness.runtime.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn sent_message_reconciles_inbound_receipt() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = start_harness(dir.path());

    let alice = Identity::parse(ALICE).unwrap();
    let timestamp = harness
        .runtime
        .handle
        .send_message(Recipient::Contact(alice.clone()), "ping")
        .await
        .unwrap();
    assert_eq!(timestamp, Timestamp::new(SEND_TIMESTAMP));

    harness
        .envelopes
        .send(receipt_envelope(ALICE, "read", SEND_TIMESTAMP + 50, &[SEND_TIMESTAMP]))
        .unwrap();
    let event = harness.runtime.events.recv().await.unwrap();
    let AccountEvent::Receipt { receipt, matched } = event else {
        panic!("expected a receipt event, got {event:?}");
    };
    assert_eq!(receipt.kind, ReceiptKind::Read);
    assert_eq!(matched, 1);

    let conversation = harness
        .runtime
        .handle
        .conversation(Recipient::Contact(alice))
        .await
        .unwrap();
    let Message::Sent(sent) = &conversation[0] else {
        panic!("expected the sent message first");
    };
    assert_eq!(sent.delivery_state(), DeliveryState::Read);
    assert_eq!(sent.sent_to, vec![Identity::parse(ALICE).unwrap()]);

    // A message sent to Alice does not surface in the self conversation.
    let account = Identity::parse(ACCOUNT).unwrap();
    let with_self = harness
        .runtime
        .handle
        .conversation(Recipient::Contact(account))
        .await
        .unwrap();
    assert!(with_self.is_empty());

    harness.runtime.handle.shutdown().await.unwrap();
    harness.runtime.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn repeated_reaction_replaces_instead_of_stacking() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = start_harness(dir.path());

    harness
        .envelopes
        .send(data_envelope(ALICE, 1_000, "rate this"))
        .unwrap();
    assert!(matches!(
        harness.runtime.events.recv().await.unwrap(),
        AccountEvent::Message { .. }
    ));

    harness
        .envelopes
        .send(reaction_envelope(ALICE, "\u{1F44D}", 1_000, false))
        .unwrap();
    let AccountEvent::Reaction { applied, .. } = harness.runtime.events.recv().await.unwrap()
    else {
        panic!("expected a reaction event");
    };
    assert!(applied);

    harness
        .envelopes
        .send(reaction_envelope(ALICE, "\u{1F44E}", 1_000, false))
        .unwrap();
    assert!(matches!(
        harness.runtime.events.recv().await.unwrap(),
        AccountEvent::Reaction { applied: true, .. }
    ));

    let alice = Identity::parse(ALICE).unwrap();
    let conversation = harness
        .runtime
        .handle
        .conversation(Recipient::Contact(alice.clone()))
        .await
        .unwrap();
    let reactions = conversation[0].reactions().unwrap();
    assert_eq!(reactions.len(), 1);
    let stored = reactions.iter().next().unwrap();
    assert_eq!(stored.emoji, "\u{1F44E}");
    assert!(stored.is_change);
    assert_eq!(stored.previous_emoji.as_deref(), Some("\u{1F44D}"));

    // A reaction against a message nobody stored is surfaced, not applied.
    harness
        .envelopes
        .send(reaction_envelope(ALICE, "\u{2764}", 9_999, false))
        .unwrap();
    assert!(matches!(
        harness.runtime.events.recv().await.unwrap(),
        AccountEvent::Reaction { applied: false, .. }
    ));

    harness.runtime.handle.shutdown().await.unwrap();
    harness.runtime.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn typing_envelopes_toggle_the_contact_flag() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = start_harness(dir.path());

    let typing = |action: &str| {
        json!({
            "sourceNumber": ALICE,
            "sourceDevice": 1,
            "timestamp": 1_000,
            "typingMessage": {"action": action, "timestamp": 1_000},
        })
    };

    harness.envelopes.send(typing("STARTED")).unwrap();
    let AccountEvent::Typing { sender, started } = harness.runtime.events.recv().await.unwrap()
    else {
        panic!("expected a typing event");
    };
    assert_eq!(sender.as_str(), ALICE);
    assert!(started);

    let alice = Identity::parse(ALICE).unwrap();
    let contacts = harness.runtime.handle.contacts().await.unwrap();
    assert!(contacts.iter().find(|c| c.matches(&alice)).unwrap().is_typing);

    harness.envelopes.send(typing("STOPPED")).unwrap();
    assert!(matches!(
        harness.runtime.events.recv().await.unwrap(),
        AccountEvent::Typing { started: false, .. }
    ));

    harness.runtime.handle.shutdown().await.unwrap();
    harness.runtime.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn blocked_sync_is_authoritative() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = start_harness(dir.path());

    harness
        .envelopes
        .send(data_envelope(ALICE, 1_000, "hi"))
        .unwrap();
    harness.runtime.events.recv().await.unwrap();

    harness
        .envelopes
        .send(json!({
            "sourceNumber": ACCOUNT,
            "sourceDevice": 2,
            "timestamp": 2_000,
            "syncMessage": {"blockedNumbers": [ALICE], "blockedGroupIds": []},
        }))
        .unwrap();
    assert!(matches!(
        harness.runtime.events.recv().await.unwrap(),
        AccountEvent::Sync { .. }
    ));

    let alice = Identity::parse(ALICE).unwrap();
    let contacts = harness.runtime.handle.contacts().await.unwrap();
    assert!(contacts.iter().find(|c| c.matches(&alice)).unwrap().is_blocked);

    // An empty list unblocks everyone.
    harness
        .envelopes
        .send(json!({
            "sourceNumber": ACCOUNT,
            "sourceDevice": 2,
            "timestamp": 3_000,
            "syncMessage": {"blockedNumbers": [], "blockedGroupIds": []},
        }))
        .unwrap();
    harness.runtime.events.recv().await.unwrap();

    let contacts = harness.runtime.handle.contacts().await.unwrap();
    assert!(!contacts.iter().find(|c| c.matches(&alice)).unwrap().is_blocked);

    harness.runtime.handle.shutdown().await.unwrap();
    harness.runtime.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn state_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let mut harness = start_harness(dir.path());
        harness
            .envelopes
            .send(data_envelope(ALICE, 1_000, "remember me"))
            .unwrap();
        harness.runtime.events.recv().await.unwrap();
        harness.runtime.handle.shutdown().await.unwrap();
        harness.runtime.task.await.unwrap().unwrap();
    }

    let harness = start_harness(dir.path());
    let alice = Identity::parse(ALICE).unwrap();
    let conversation = harness
        .runtime
        .handle
        .conversation(Recipient::Contact(alice.clone()))
        .await
        .unwrap();
    assert_eq!(conversation.len(), 1);
    let contacts = harness.runtime.handle.contacts().await.unwrap();
    assert!(contacts.iter().any(|c| c.matches(&alice)));

    harness.runtime.handle.shutdown().await.unwrap();
    harness.runtime.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn unrecognized_envelopes_are_dropped_without_stopping_the_loop() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = start_harness(dir.path());

    harness
        .envelopes
        .send(json!({"sourceNumber": ALICE, "timestamp": 500}))
        .unwrap();
    harness
        .envelopes
        .send(data_envelope(ALICE, 1_000, "still here"))
        .unwrap();

    // Only the real message surfaces.
    let event = harness.runtime.events.recv().await.unwrap();
    assert!(matches!(event, AccountEvent::Message { .. }));

    let stats = harness.runtime.handle.stats().await.unwrap();
    assert_eq!(stats.messages, 1);

    harness.runtime.handle.shutdown().await.unwrap();
    harness.runtime.task.await.unwrap().unwrap();
}
