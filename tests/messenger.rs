//! Component messenger behavior: registration rules, request/response,
//! timeout bounds, and registry desync detection.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use common::test_config;
use phoenix_net::auth::handshake::{InsecureClientAuth, InsecureServerAuth};
use phoenix_net::channel::ChannelRegistry;
use phoenix_net::codec::Value;
use phoenix_net::connection::{loopback, Connection};
use phoenix_net::error::{NetError, Result};
use phoenix_net::messenger::{
    ComponentMessageChannel, ComponentMessenger, DebugHeaders, MessengerCoordinates, WireMessage,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
struct Damage {
    amount: i32,
}

impl WireMessage for Damage {
    fn message_id() -> &'static str {
        "damage"
    }

    fn encode(&self) -> Value {
        [("amount".to_string(), Value::I32(self.amount))]
            .into_iter()
            .collect()
    }

    fn decode(value: &Value) -> Result<Self> {
        let map = value
            .as_map()
            .ok_or_else(|| NetError::Decode("damage payload must be a map".into()))?;
        let amount = map
            .get("amount")
            .and_then(Value::as_i32)
            .ok_or_else(|| NetError::Decode("damage payload missing amount".into()))?;
        Ok(Self { amount })
    }
}

#[derive(Debug, Clone, PartialEq)]
struct DamageAck {
    amount: i32,
}

impl WireMessage for DamageAck {
    fn message_id() -> &'static str {
        "damage_ack"
    }

    fn encode(&self) -> Value {
        [("amount".to_string(), Value::I32(self.amount))]
            .into_iter()
            .collect()
    }

    fn decode(value: &Value) -> Result<Self> {
        let map = value
            .as_map()
            .ok_or_else(|| NetError::Decode("ack payload must be a map".into()))?;
        let amount = map
            .get("amount")
            .and_then(Value::as_i32)
            .ok_or_else(|| NetError::Decode("ack payload missing amount".into()))?;
        Ok(Self { amount })
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Heal {
    amount: i32,
}

impl WireMessage for Heal {
    fn message_id() -> &'static str {
        "heal"
    }

    fn encode(&self) -> Value {
        [("amount".to_string(), Value::I32(self.amount))]
            .into_iter()
            .collect()
    }

    fn decode(value: &Value) -> Result<Self> {
        let amount = value
            .as_map()
            .and_then(|m| m.get("amount"))
            .and_then(Value::as_i32)
            .ok_or_else(|| NetError::Decode("heal payload missing amount".into()))?;
        Ok(Self { amount })
    }
}

fn coords() -> MessengerCoordinates {
    MessengerCoordinates {
        scene_path: "scenes/arena".into(),
        room: "room-1".into(),
        object_id: "obj-42".into(),
        component_index: 0,
    }
}

async fn open_pair() -> (Arc<Connection>, Arc<Connection>) {
    let registry = ChannelRegistry::new();
    registry.register::<ComponentMessageChannel>().unwrap();
    let client_auth = InsecureClientAuth::new("acc1", "Disp");
    let server_auth = InsecureServerAuth::new();
    loopback::pair(&registry, &registry, &client_auth, &server_auth, &test_config())
        .await
        .unwrap()
}

fn messenger_on(conn: &Arc<Connection>, debug_mode: bool) -> Arc<ComponentMessenger> {
    let channel = conn.channel::<ComponentMessageChannel>().unwrap();
    let m = ComponentMessenger::new(channel, coords(), "HealthSync", debug_mode);
    m.attach();
    m
}

#[test]
fn duplicate_message_ids_rejected() {
    // Registration rules need no live connection; drive them through a
    // throwaway pair.
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let (client, _server) = open_pair().await;
        let m = messenger_on(&client, false);
        m.register::<Damage>().unwrap();
        assert!(matches!(
            m.register::<Damage>(),
            Err(NetError::DuplicateMessage(id)) if id == "damage"
        ));
    });
}

#[tokio::test]
async fn unregistered_message_send_fails() {
    let (client, _server) = open_pair().await;
    let m = messenger_on(&client, false);
    assert!(matches!(
        m.send_message(&Damage { amount: 1 }).await,
        Err(NetError::UnregisteredMessage(id)) if id == "damage"
    ));
}

#[tokio::test]
async fn typed_handlers_and_catch_all_both_run() {
    let (client, server) = open_pair().await;
    let sender = messenger_on(&client, false);
    let receiver = messenger_on(&server, false);

    for m in [&sender, &receiver] {
        m.register::<Damage>().unwrap();
        m.register::<DamageAck>().unwrap();
    }

    let typed_hits = Arc::new(AtomicU32::new(0));
    let catch_all_hits = Arc::new(AtomicU32::new(0));
    {
        let hits = typed_hits.clone();
        receiver.on::<Damage>(move |d| {
            assert_eq!(d.amount, 12);
            hits.fetch_add(1, Ordering::SeqCst);
        });
        let hits = catch_all_hits.clone();
        receiver.on_default(move |id, _payload| {
            assert_eq!(id, "damage");
            hits.fetch_add(1, Ordering::SeqCst);
        });
    }

    sender.send_message(&Damage { amount: 12 }).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(typed_hits.load(Ordering::SeqCst), 1);
    assert_eq!(catch_all_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn request_response_roundtrip() {
    let (client, server) = open_pair().await;
    let requester = messenger_on(&client, false);
    let responder = messenger_on(&server, false);

    for m in [&requester, &responder] {
        m.register::<Damage>().unwrap();
        m.register::<DamageAck>().unwrap();
    }

    {
        let responder_handle = responder.clone();
        responder.on::<Damage>(move |d| {
            let m = responder_handle.clone();
            let amount = d.amount;
            tokio::spawn(async move {
                m.send_message(&DamageAck { amount }).await.ok();
            });
        });
    }

    let ack: DamageAck = requester
        .send_request(&Damage { amount: 5 }, 5.0)
        .await
        .unwrap();
    assert_eq!(ack.amount, 5);
    assert_eq!(requester.pending_responses(), 0);
}

#[tokio::test]
async fn callback_request_fires_on_response() {
    let (client, server) = open_pair().await;
    let requester = messenger_on(&client, false);
    let responder = messenger_on(&server, false);

    for m in [&requester, &responder] {
        m.register::<Damage>().unwrap();
        m.register::<DamageAck>().unwrap();
    }

    {
        let responder_handle = responder.clone();
        responder.on::<Damage>(move |d| {
            let m = responder_handle.clone();
            let amount = d.amount;
            tokio::spawn(async move {
                m.send_message(&DamageAck { amount }).await.ok();
            });
        });
    }

    let (tx, rx) = tokio::sync::oneshot::channel();
    requester
        .send_request_callback(
            &Damage { amount: 3 },
            None::<fn(&DamageAck) -> bool>,
            move |ack: DamageAck| {
                tx.send(ack.amount).ok();
            },
        )
        .await
        .unwrap();

    let amount = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("callback should fire")
        .unwrap();
    assert_eq!(amount, 3);
}

#[tokio::test]
async fn request_times_out_within_bound() {
    let (client, server) = open_pair().await;
    let requester = messenger_on(&client, false);
    let silent = messenger_on(&server, false);

    for m in [&requester, &silent] {
        m.register::<Damage>().unwrap();
        m.register::<DamageAck>().unwrap();
    }
    // No responder registered: the request must fail by timeout, not hang.

    let started = Instant::now();
    let result = requester
        .send_request::<Damage, DamageAck>(&Damage { amount: 1 }, 1.0)
        .await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(NetError::Timeout)));
    assert!(
        elapsed >= Duration::from_millis(900),
        "timed out too early: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_millis(1_600),
        "timed out too late: {elapsed:?}"
    );
    assert_eq!(requester.pending_responses(), 0);
}

#[tokio::test]
async fn request_fails_fast_on_connection_loss() {
    let (client, server) = open_pair().await;
    let requester = messenger_on(&client, false);
    let silent = messenger_on(&server, false);
    for m in [&requester, &silent] {
        m.register::<Damage>().unwrap();
        m.register::<DamageAck>().unwrap();
    }

    let pending = tokio::spawn({
        let requester = requester.clone();
        async move {
            requester
                .send_request::<Damage, DamageAck>(&Damage { amount: 1 }, -1.0)
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    server
        .close(phoenix_net::error::Disconnect::new("closed"))
        .await;

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(NetError::ConnectionLost)));
}

#[tokio::test]
async fn registry_mismatch_detected_in_both_stages() {
    let (client, _server) = open_pair().await;
    let local = messenger_on(&client, false);
    local.register::<Damage>().unwrap();
    local.register::<Heal>().unwrap();

    // Count mismatch: remote advertises one message, we hold two.
    let short = DebugHeaders {
        remote_component_type: "HealthSync".into(),
        registry: vec![("damage".into(), 0)],
    };
    assert!(matches!(
        local.validate_registry(&short),
        Err(NetError::ProtocolDesync(msg)) if msg.contains("count")
    ));

    // Identity mismatch: same count, drifted order.
    let drifted = DebugHeaders {
        remote_component_type: "HealthSync".into(),
        registry: vec![("heal".into(), 0), ("damage".into(), 1)],
    };
    assert!(matches!(
        local.validate_registry(&drifted),
        Err(NetError::ProtocolDesync(msg)) if msg.contains("identity")
    ));

    // Agreement passes.
    let aligned = DebugHeaders {
        remote_component_type: "HealthSync".into(),
        registry: vec![("damage".into(), 0), ("heal".into(), 1)],
    };
    assert!(local.validate_registry(&aligned).is_ok());
}

#[tokio::test]
async fn drifted_registries_do_not_misroute_in_debug_mode() {
    let (client, server) = open_pair().await;

    // Debug mode on: outbound messages carry registry snapshots.
    let sender = messenger_on(&client, true);
    let receiver = messenger_on(&server, true);

    // Same message set, different registration order.
    sender.register::<Damage>().unwrap();
    sender.register::<Heal>().unwrap();
    receiver.register::<Heal>().unwrap();
    receiver.register::<Damage>().unwrap();

    let misrouted = Arc::new(AtomicU32::new(0));
    {
        let hits = misrouted.clone();
        receiver.on::<Heal>(move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        });
    }

    // Positionally, sender's damage (index 0) would land on receiver's
    // heal; the debug headers must catch the drift instead.
    sender.send_message(&Damage { amount: 9 }).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(
        misrouted.load(Ordering::SeqCst),
        0,
        "drifted registries silently misrouted a payload"
    );
}
