//! End-to-end integration tests: two engines on loopback, real TCP links,
//! real handshakes, real dispatch.
//!
//! Each test builds two complete engines bound to ephemeral ports and
//! drives them through the public API only: dial, subscribe, send_packet,
//! and the pairing calls. The discovery broadcast interval is set far out
//! so connections happen exactly when a test dials.

use std::time::Duration;

use lanlink_engine::application::events::EngineEvent;
use lanlink_engine::application::registry::{DeviceFilter, DisconnectReason, LinkState};
use lanlink_engine::application::trust::{TrustState, TrustStore};
use lanlink_engine::config::{CommandEntry, EngineConfig};
use lanlink_engine::engine::Engine;
use lanlink_engine::infrastructure::discovery::DiscoveryEvent;

use lanlink_core::{DeviceId, IdentityKeypair, Packet};
use serde_json::json;
use tokio::sync::broadcast;

fn test_config(commands: Vec<CommandEntry>) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.network.bind_address = "127.0.0.1".to_string();
    config.network.broadcast_address = "127.0.0.1".to_string();
    config.network.discovery_port = 0;
    config.network.control_port = 0;
    config.timing.broadcast_interval_secs = 3600;
    config.timing.eviction_sweep_secs = 3600;
    config.commands = commands;
    config
}

struct TestPeer {
    engine: Engine,
    device_id: DeviceId,
    keys_public: String,
}

async fn start_peer(
    name: &str,
    keys: IdentityKeypair,
    trust: TrustStore,
    commands: Vec<CommandEntry>,
) -> TestPeer {
    let device_id = DeviceId::from(name);
    let keys_public = keys.public_base64();
    let mut engine = Engine::with_state(test_config(commands), keys, device_id.clone(), trust);
    engine.start().await.expect("engine must start");
    TestPeer {
        engine,
        device_id,
        keys_public,
    }
}

/// Builds two trust stores already paired with each other's real keys.
fn paired_stores(
    a_id: &DeviceId,
    a_keys: &IdentityKeypair,
    b_id: &DeviceId,
    b_keys: &IdentityKeypair,
) -> (TrustStore, TrustStore) {
    let mut a_store = TrustStore::in_memory();
    a_store.request_pairing(b_id).unwrap();
    a_store
        .handle_pair_packet(b_id, &b_keys.public_base64(), true)
        .unwrap();

    let mut b_store = TrustStore::in_memory();
    b_store.request_pairing(a_id).unwrap();
    b_store
        .handle_pair_packet(a_id, &a_keys.public_base64(), true)
        .unwrap();

    (a_store, b_store)
}

/// A discovery event pointing at a started peer, as its announcement
/// would look on the wire.
fn announcement_of(peer: &TestPeer) -> DiscoveryEvent {
    DiscoveryEvent {
        info: peer.engine.our_info().clone(),
        addr: peer.engine.control_addr().expect("peer is started"),
    }
}

async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<EngineEvent>,
    description: &str,
    mut pred: F,
) -> EngineEvent
where
    F: FnMut(&EngineEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event stream closed: {e}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {description}"))
}

fn connected(device_id: &DeviceId) -> impl FnMut(&EngineEvent) -> bool + '_ {
    move |event| {
        matches!(
            event,
            EngineEvent::DeviceStateChanged {
                device_id: id,
                state: LinkState::Connected,
                ..
            } if id == device_id
        )
    }
}

fn reboot_command() -> Vec<CommandEntry> {
    vec![CommandEntry {
        key: "k1".to_string(),
        name: "Reboot".to_string(),
        command: "reboot".to_string(),
    }]
}

#[tokio::test]
async fn test_dial_connects_both_sides() {
    let a_keys = IdentityKeypair::generate();
    let b_keys = IdentityKeypair::generate();
    let (a_store, b_store) = paired_stores(
        &DeviceId::from("aaa"),
        &a_keys,
        &DeviceId::from("bbb"),
        &b_keys,
    );

    let mut a = start_peer("aaa", a_keys, a_store, vec![]).await;
    let mut b = start_peer("bbb", b_keys, b_store, vec![]).await;
    let mut a_events = a.engine.subscribe();
    let mut b_events = b.engine.subscribe();

    b.engine.dial(announcement_of(&a)).await;

    wait_for_event(&mut b_events, "b sees a connected", connected(&a.device_id)).await;
    wait_for_event(&mut a_events, "a sees b connected", connected(&b.device_id)).await;

    let a_list = a.engine.list_devices(DeviceFilter::Connected).await;
    assert_eq!(a_list.len(), 1);
    assert_eq!(a_list[0].info.device_id, b.device_id);
    assert_eq!(a_list[0].info.identity_key, b.keys_public);

    a.engine.stop().await;
    b.engine.stop().await;
}

#[tokio::test]
async fn test_command_list_scenario_delivers_exactly_once() {
    // Device A advertises runcommand and holds a command table; device B
    // asks for the list and must see exactly one response packet on its
    // subscription.
    let a_keys = IdentityKeypair::generate();
    let b_keys = IdentityKeypair::generate();
    let (a_store, b_store) = paired_stores(
        &DeviceId::from("aaa"),
        &a_keys,
        &DeviceId::from("bbb"),
        &b_keys,
    );

    let mut a = start_peer("aaa", a_keys, a_store, reboot_command()).await;
    let mut b = start_peer("bbb", b_keys, b_store, vec![]).await;
    let mut b_events = b.engine.subscribe();

    b.engine.dial(announcement_of(&a)).await;
    wait_for_event(&mut b_events, "b sees a connected", connected(&a.device_id)).await;

    b.engine
        .send_packet(
            &a.device_id,
            lanlink_engine::application::plugins::run_command::request_list_packet(),
        )
        .await
        .expect("send request");

    let event = wait_for_event(&mut b_events, "command list response", |event| {
        matches!(
            event,
            EngineEvent::PacketReceived { packet, .. } if packet.packet_type == "runcommand"
        )
    })
    .await;

    let EngineEvent::PacketReceived { device_id, packet } = event else {
        unreachable!()
    };
    assert_eq!(device_id, a.device_id);
    let list = packet.body_object("commandList").expect("commandList");
    let entry = list.get("k1").and_then(|v| v.as_object()).expect("k1");
    assert_eq!(entry.get("name"), Some(&json!("Reboot")));
    assert_eq!(entry.get("command"), Some(&json!("reboot")));

    // Exactly once: no second runcommand delivery follows.
    tokio::time::sleep(Duration::from_millis(300)).await;
    while let Ok(extra) = b_events.try_recv() {
        assert!(
            !matches!(
                &extra,
                EngineEvent::PacketReceived { packet, .. }
                    if packet.packet_type == "runcommand"
            ),
            "command list must be delivered exactly once, got duplicate: {extra:?}"
        );
    }

    a.engine.stop().await;
    b.engine.stop().await;
}

#[tokio::test]
async fn test_unadvertised_capability_is_dropped_silently() {
    let a_keys = IdentityKeypair::generate();
    let b_keys = IdentityKeypair::generate();
    let (a_store, b_store) = paired_stores(
        &DeviceId::from("aaa"),
        &a_keys,
        &DeviceId::from("bbb"),
        &b_keys,
    );

    let mut a = start_peer("aaa", a_keys, a_store, vec![]).await;
    let mut b = start_peer("bbb", b_keys, b_store, vec![]).await;
    let mut a_events = a.engine.subscribe();
    let mut b_events = b.engine.subscribe();

    b.engine.dial(announcement_of(&a)).await;
    wait_for_event(&mut b_events, "b sees a connected", connected(&a.device_id)).await;
    wait_for_event(&mut a_events, "a sees b connected", connected(&b.device_id)).await;

    // B never advertises "clipboard"; the send itself succeeds (outbound
    // only requires a live link) but A drops the packet.
    b.engine
        .send_packet(&a.device_id, Packet::empty("clipboard"))
        .await
        .expect("outbound hand-off succeeds");

    tokio::time::sleep(Duration::from_millis(300)).await;
    while let Ok(event) = a_events.try_recv() {
        assert!(
            !matches!(&event, EngineEvent::PacketReceived { .. }),
            "unadvertised packet must not surface, got: {event:?}"
        );
    }
    // No error came back to B and the link survived.
    assert_eq!(
        b.engine.list_devices(DeviceFilter::Connected).await.len(),
        1
    );

    a.engine.stop().await;
    b.engine.stop().await;
}

#[tokio::test]
async fn test_pairing_flow_gates_capability_packets() {
    // Both sides start unpaired: capability packets are dropped, the
    // pairing negotiation itself always goes through, and after accept
    // the same packet is routed.
    let a_keys = IdentityKeypair::generate();
    let b_keys = IdentityKeypair::generate();

    let mut a = start_peer("aaa", a_keys, TrustStore::in_memory(), reboot_command()).await;
    let mut b = start_peer("bbb", b_keys, TrustStore::in_memory(), vec![]).await;
    let mut a_events = a.engine.subscribe();
    let mut b_events = b.engine.subscribe();

    b.engine.dial(announcement_of(&a)).await;
    wait_for_event(&mut b_events, "b sees a connected", connected(&a.device_id)).await;
    wait_for_event(&mut a_events, "a sees b connected", connected(&b.device_id)).await;

    // Untrusted: dropped without a trace on the subscription.
    b.engine
        .send_packet(
            &a.device_id,
            lanlink_engine::application::plugins::run_command::request_list_packet(),
        )
        .await
        .expect("send");
    tokio::time::sleep(Duration::from_millis(300)).await;
    while let Ok(event) = a_events.try_recv() {
        assert!(!matches!(&event, EngineEvent::PacketReceived { .. }));
    }

    // Pairing negotiation is accepted regardless of trust state.
    b.engine
        .request_pairing(&a.device_id)
        .await
        .expect("request pairing");
    wait_for_event(&mut a_events, "a sees pairing request", |event| {
        matches!(
            event,
            EngineEvent::PairingRequested { device_id } if *device_id == b.device_id
        )
    })
    .await;

    a.engine
        .accept_pairing(&b.device_id)
        .await
        .expect("accept pairing");

    // Both ends converge on Paired.
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let a_paired = a.engine.trust_state(&b.device_id).await == TrustState::Paired;
            let b_paired = b.engine.trust_state(&a.device_id).await == TrustState::Paired;
            if a_paired && b_paired {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("both sides must become paired");

    // The same capability packet now reaches the plugin and B gets the
    // command list back.
    b.engine
        .send_packet(
            &a.device_id,
            lanlink_engine::application::plugins::run_command::request_list_packet(),
        )
        .await
        .expect("send after pairing");
    wait_for_event(&mut b_events, "command list after pairing", |event| {
        matches!(
            event,
            EngineEvent::PacketReceived { packet, .. }
                if packet.body_object("commandList").is_some()
        )
    })
    .await;

    a.engine.stop().await;
    b.engine.stop().await;
}

#[tokio::test]
async fn test_identity_key_mismatch_demotes_and_refuses() {
    let a_keys = IdentityKeypair::generate();
    let b_keys = IdentityKeypair::generate();
    let imposter_keys = IdentityKeypair::generate();

    // A pinned a different key for B than the one B will present.
    let mut a_store = TrustStore::in_memory();
    a_store.request_pairing(&DeviceId::from("bbb")).unwrap();
    a_store
        .handle_pair_packet(
            &DeviceId::from("bbb"),
            &imposter_keys.public_base64(),
            true,
        )
        .unwrap();

    let mut b_store = TrustStore::in_memory();
    b_store.request_pairing(&DeviceId::from("aaa")).unwrap();
    b_store
        .handle_pair_packet(&DeviceId::from("aaa"), &a_keys.public_base64(), true)
        .unwrap();

    let mut a = start_peer("aaa", a_keys, a_store, vec![]).await;
    let mut b = start_peer("bbb", b_keys, b_store, vec![]).await;
    let mut a_events = a.engine.subscribe();

    assert_eq!(
        a.engine.trust_state(&b.device_id).await,
        TrustState::Paired
    );

    b.engine.dial(announcement_of(&a)).await;

    wait_for_event(&mut a_events, "trust violation event", |event| {
        matches!(
            event,
            EngineEvent::TrustViolation { device_id } if *device_id == b.device_id
        )
    })
    .await;
    wait_for_event(&mut a_events, "disconnect with trust reason", |event| {
        matches!(
            event,
            EngineEvent::DeviceStateChanged {
                device_id,
                state: LinkState::Disconnected,
                reason: Some(DisconnectReason::TrustViolation),
            } if *device_id == b.device_id
        )
    })
    .await;

    // Demoted: explicit re-pairing required from here on.
    assert_eq!(
        a.engine.trust_state(&b.device_id).await,
        TrustState::Unpaired
    );
    assert!(a
        .engine
        .list_devices(DeviceFilter::Connected)
        .await
        .is_empty());

    a.engine.stop().await;
    b.engine.stop().await;
}

#[tokio::test]
async fn test_simultaneous_connects_converge_to_one_link() {
    let a_keys = IdentityKeypair::generate();
    let b_keys = IdentityKeypair::generate();
    let (a_store, b_store) = paired_stores(
        &DeviceId::from("aaa"),
        &a_keys,
        &DeviceId::from("bbb"),
        &b_keys,
    );

    let mut a = start_peer("aaa", a_keys, a_store, vec![]).await;
    let mut b = start_peer("bbb", b_keys, b_store, vec![]).await;
    let mut a_events = a.engine.subscribe();
    let mut b_events = b.engine.subscribe();

    // Both directions dial at once.
    tokio::join!(
        a.engine.dial(announcement_of(&b)),
        b.engine.dial(announcement_of(&a)),
    );

    wait_for_event(&mut a_events, "a sees b connected", connected(&b.device_id)).await;
    wait_for_event(&mut b_events, "b sees a connected", connected(&a.device_id)).await;

    // Let the duplicate-link resolution settle, then verify the invariant:
    // at most one connected link per device id, on both sides.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        a.engine.list_devices(DeviceFilter::Connected).await.len(),
        1
    );
    assert_eq!(
        b.engine.list_devices(DeviceFilter::Connected).await.len(),
        1
    );

    // The surviving link carries traffic exactly once.
    let mut a_fresh = a.engine.subscribe();
    b.engine
        .send_packet(
            &a.device_id,
            lanlink_engine::application::plugins::ping::ping_packet(),
        )
        .await
        .expect("ping over surviving link");

    wait_for_event(&mut a_fresh, "ping arrives", |event| {
        matches!(
            event,
            EngineEvent::PacketReceived { packet, .. } if packet.packet_type == "ping"
        )
    })
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    while let Ok(event) = a_fresh.try_recv() {
        assert!(
            !matches!(
                &event,
                EngineEvent::PacketReceived { packet, .. } if packet.packet_type == "ping"
            ),
            "ping must arrive exactly once"
        );
    }

    a.engine.stop().await;
    b.engine.stop().await;
}

#[tokio::test]
async fn test_stop_closes_links_and_notifies_peer() {
    let a_keys = IdentityKeypair::generate();
    let b_keys = IdentityKeypair::generate();
    let (a_store, b_store) = paired_stores(
        &DeviceId::from("aaa"),
        &a_keys,
        &DeviceId::from("bbb"),
        &b_keys,
    );

    let mut a = start_peer("aaa", a_keys, a_store, vec![]).await;
    let mut b = start_peer("bbb", b_keys, b_store, vec![]).await;
    let mut b_events = b.engine.subscribe();

    b.engine.dial(announcement_of(&a)).await;
    wait_for_event(&mut b_events, "b sees a connected", connected(&a.device_id)).await;

    // Stopping must resolve promptly even with a live link and parked
    // accept/read loops.
    tokio::time::timeout(Duration::from_secs(5), a.engine.stop())
        .await
        .expect("stop must not hang");

    // The peer observes the closed link as a disconnect.
    wait_for_event(&mut b_events, "b sees a disconnect", |event| {
        matches!(
            event,
            EngineEvent::DeviceStateChanged {
                device_id,
                state: LinkState::Disconnected,
                ..
            } if *device_id == a.device_id
        )
    })
    .await;

    b.engine.stop().await;
}
