use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tempfile::tempdir;

use kyromesh::qos::{Admission, AdmissionControl, RejectReason, DEFAULT_WINDOW};
use kyromesh::transport::ChannelHub;
use kyromesh::{
    DropPolicy, DropRate, InMemoryKnowledgeStore, KnowledgeStore, Operation, Packet, PolicySettings, QosPolicy,
    ReceiveOutcome, Record, SendOutcome, Transport, TransportConfig, TransportContext, Value,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A packet whose accounted payload is exactly 50 bytes.
fn fifty_byte_packet(n: usize) -> Packet {
    let key = format!("k{n}");
    let value = "x".repeat(50 - key.len());
    let mut packet = Packet::new();
    packet.insert(key, Record::new(value).with_clock(1));
    packet
}

#[test]
fn send_cap_defers_instead_of_dropping() {
    init_tracing();
    let hub = ChannelHub::new();
    let (network, _own) = hub.join("host.s").unwrap();
    let (_peer, inbox) = hub.join("host.r").unwrap();

    let store = Arc::new(InMemoryKnowledgeStore::new());
    let transport = Transport::new(TransportConfig::new("agent.s", "qos"), store.clone(), Arc::new(network)).unwrap();
    transport.policy().set_send_bandwidth_limit(Some(100)).unwrap();

    let started = Instant::now();
    for n in 0..10 {
        let packet = fifty_byte_packet(n);
        assert_eq!(store.packet_size(&packet), 50);
        let outcome = transport.send(packet).unwrap();
        assert!(outcome.is_sent(), "packet {n} was not sent: {outcome:?}");
    }
    let elapsed = started.elapsed();

    // (10 * 50 - 100) / 100 seconds of deferral
    assert!(elapsed >= Duration::from_secs(4), "finished too early: {elapsed:?}");
    assert_eq!(inbox.try_iter().count(), 10);
    assert_eq!(transport.drop_scheduler().dropped(), 0);
}

#[test]
fn deterministic_drop_rate_loses_exact_share() {
    init_tracing();
    let hub = ChannelHub::new();
    let (network, _own) = hub.join("host.s").unwrap();
    let (_peer, inbox) = hub.join("host.r").unwrap();

    let transport = Transport::new(
        TransportConfig::new("agent.s", "qos"),
        Arc::new(InMemoryKnowledgeStore::new()),
        Arc::new(network),
    )
    .unwrap();
    transport
        .policy()
        .set_drop_rate(DropRate::new(50.0, DropPolicy::Deterministic))
        .unwrap();

    let mut lost = 0;
    for n in 0..10 {
        match transport.send(fifty_byte_packet(n)).unwrap() {
            SendOutcome::Sent { .. } => {}
            SendOutcome::Rejected(RejectReason::SimulatedLoss) => lost += 1,
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    assert_eq!(lost, 5);
    assert_eq!(inbox.try_iter().count(), 5);
    assert_eq!(transport.drop_scheduler().sent(), 5);
    assert_eq!(transport.drop_scheduler().dropped(), 5);
}

#[test]
fn banned_beats_trusted() {
    init_tracing();
    let hub = ChannelHub::new();
    let (net_s, _own) = hub.join("host.s").unwrap();
    let (net_r, inbox) = hub.join("host.r").unwrap();

    let sender = Transport::new(
        TransportConfig::new("agent.s", "qos"),
        Arc::new(InMemoryKnowledgeStore::new()),
        Arc::new(net_s),
    )
    .unwrap();

    // the sending host is trusted, its participant id is banned
    let receiver_policy = Arc::new(QosPolicy::new());
    receiver_policy.add_trusted_peer("host.s").unwrap();
    receiver_policy.add_banned_peer("agent.s").unwrap();
    let receiver_store = Arc::new(InMemoryKnowledgeStore::new());
    let receiver = Transport::with_policy(
        TransportConfig::new("agent.r", "qos"),
        receiver_store.clone(),
        Arc::new(net_r),
        receiver_policy,
    )
    .unwrap();

    assert!(sender.send(fifty_byte_packet(0)).unwrap().is_sent());
    let datagram = inbox.try_recv().unwrap();
    let outcome = receiver.receive(&datagram.bytes, &datagram.from).unwrap();

    assert_eq!(
        outcome,
        ReceiveOutcome::Rejected(RejectReason::BannedPeer {
            peer: "agent.s".to_string()
        })
    );
    assert_eq!(receiver_store.len().unwrap(), 0);
}

#[test]
fn banned_beats_trusted_in_raw_settings() {
    let settings = PolicySettings {
        trusted_peers: BTreeSet::from(["peer".to_string()]),
        banned_peers: BTreeSet::from(["peer".to_string()]),
        ..PolicySettings::default()
    };
    assert!(!settings.is_trusted("peer"));

    let policy = Arc::new(QosPolicy::with_settings(settings));
    let control = AdmissionControl::new(policy, DEFAULT_WINDOW);
    let context = TransportContext::new(Operation::Receive, "qos", "peer");
    assert!(matches!(
        control.admit_inbound("peer", &context).unwrap(),
        Admission::Reject(RejectReason::BannedPeer { .. })
    ));
}

#[test]
fn trust_list_filters_unknown_peers() {
    let policy = Arc::new(QosPolicy::new());
    policy.add_trusted_peer("friend").unwrap();
    let control = AdmissionControl::new(Arc::clone(&policy), DEFAULT_WINDOW);

    let from_friend = TransportContext::new(Operation::Receive, "qos", "friend");
    assert!(control.admit_inbound("10.0.0.1", &from_friend).unwrap().is_admitted());

    let from_stranger = TransportContext::new(Operation::Receive, "qos", "stranger");
    assert!(matches!(
        control.admit_inbound("10.0.0.2", &from_stranger).unwrap(),
        Admission::Reject(RejectReason::UntrustedPeer { .. })
    ));

    // trusting again after a ban lifts the ban
    policy.add_banned_peer("friend").unwrap();
    assert!(!policy.is_trusted("friend").unwrap());
    policy.add_trusted_peer("friend").unwrap();
    assert!(policy.is_trusted("friend").unwrap());
    assert!(policy.banned_peers().unwrap().is_empty());
}

#[test]
fn stale_packets_miss_the_deadline() {
    let policy = Arc::new(QosPolicy::new());
    policy.set_deadline(Some(Duration::from_secs(2))).unwrap();
    let control = AdmissionControl::new(policy, DEFAULT_WINDOW);

    let now = Utc::now();
    let stale = TransportContext::new(Operation::Receive, "qos", "peer")
        .with_message_time(now - chrono::Duration::seconds(5))
        .with_current_time(now);
    assert!(matches!(
        control.admit_inbound("host", &stale).unwrap(),
        Admission::Reject(RejectReason::DeadlineExceeded { .. })
    ));
    assert!(matches!(
        control.admit_outbound(10, &stale).unwrap(),
        Admission::Reject(RejectReason::DeadlineExceeded { .. })
    ));

    let fresh = TransportContext::new(Operation::Receive, "qos", "peer");
    assert!(control.admit_inbound("host", &fresh).unwrap().is_admitted());
}

#[test]
fn policy_snapshot_round_trip_replaces_state() {
    init_tracing();
    let dir = tempdir().unwrap();
    let path = dir.path().join("policy.kmqp");

    let policy = QosPolicy::new();
    policy.set_rebroadcast_ttl(3).unwrap();
    policy.set_participant_ttl(5).unwrap();
    policy.set_send_bandwidth_limit(Some(4_096)).unwrap();
    policy
        .set_drop_rate(DropRate::new(12.5, DropPolicy::Deterministic).with_burst(3))
        .unwrap();
    policy.set_deadline(Some(Duration::from_micros(1500))).unwrap();
    policy.add_trusted_peer("agent.1").unwrap();
    policy.add_banned_peer("agent.9").unwrap();
    policy.save(&path, "mesh.qos").unwrap();

    let restored = QosPolicy::new();
    restored.set_deadline(Some(Duration::from_millis(750))).unwrap();
    restored.set_total_bandwidth_limit(Some(1)).unwrap();
    restored.add_trusted_peer("agent.stale").unwrap();
    restored.load(&path, "mesh.qos").unwrap();

    assert_eq!(restored.settings().unwrap(), policy.settings().unwrap());
    assert_eq!(restored.deadline().unwrap(), Some(Duration::from_micros(1500)));
    assert_eq!(restored.total_bandwidth_limit().unwrap(), None);
    assert_eq!(restored.trusted_peers().unwrap(), vec!["agent.1".to_string()]);

    // a different prefix sees nothing and falls back to defaults
    let other = QosPolicy::new();
    other.set_rebroadcast_ttl(7).unwrap();
    other.load(&path, "other").unwrap();
    assert_eq!(other.settings().unwrap(), PolicySettings::default());
}

#[test]
fn released_policy_is_unusable() {
    let policy = QosPolicy::new();
    policy.release().unwrap();
    assert!(policy.rebroadcast_ttl().unwrap_err().is_release());
    assert!(policy.set_deadline(None).unwrap_err().is_release());
    assert!(policy.release().unwrap_err().is_release());
}

#[test]
fn shared_policy_governs_every_transport() {
    let hub = ChannelHub::new();
    let policy = Arc::new(QosPolicy::new());
    let transports: Vec<Transport> = (0..3)
        .map(|n| {
            let (network, _) = hub.join(&format!("host.{n}")).unwrap();
            let store: Arc<dyn KnowledgeStore> = Arc::new(InMemoryKnowledgeStore::new());
            Transport::with_policy(
                TransportConfig::new(format!("agent.{n}"), "qos"),
                store,
                Arc::new(network),
                Arc::clone(&policy),
            )
            .unwrap()
        })
        .collect();

    policy.set_rebroadcast_ttl(4).unwrap();
    for transport in &transports {
        assert_eq!(transport.policy().rebroadcast_ttl().unwrap(), 4);
    }

    // releasing a transport leaves the shared policy alive
    transports[0].release().unwrap();
    assert_eq!(policy.rebroadcast_ttl().unwrap(), 4);
    assert!(transports[1].store().set("still", Value::Integer(1)).is_ok());
}
