use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::Receiver;

use kyromesh::filter::{BufferFilterChain, CompressionFilter, IdentityFilter};
use kyromesh::transport::{wire, ChannelHub, Datagram, Message};
use kyromesh::{
    FilterError, InMemoryKnowledgeStore, KnowledgeStore, Packet, QosPolicy, ReceiveOutcome, Record, RecordOutcome,
    RecordType, RecordTypes, SendOutcome, Transport, TransportConfig, TransportContext, Value,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Node {
    transport: Transport,
    store: Arc<InMemoryKnowledgeStore>,
    inbox: Receiver<Datagram>,
}

fn node(hub: &ChannelHub, id: &str) -> Node {
    node_with_policy(hub, id, Arc::new(QosPolicy::new()))
}

fn node_with_policy(hub: &ChannelHub, id: &str, policy: Arc<QosPolicy>) -> Node {
    let (network, inbox) = hub.join(&format!("host.{id}")).unwrap();
    let store = Arc::new(InMemoryKnowledgeStore::new());
    let transport = Transport::with_policy(
        TransportConfig::new(id, "e2e"),
        store.clone(),
        Arc::new(network),
        policy,
    )
    .unwrap();
    Node { transport, store, inbox }
}

fn deliver(to: &Node) -> ReceiveOutcome {
    let datagram = to.inbox.try_recv().unwrap();
    to.transport.receive(&datagram.bytes, &datagram.from).unwrap()
}

fn uppercase(_key: &str, record: Record, _context: &mut TransportContext) -> RecordOutcome {
    let upper = record.value.as_string().map(str::to_uppercase);
    Ok(Some(match upper {
        Some(upper) => record.with_value(upper),
        None => record,
    }))
}

#[test]
fn alice_is_uppercased_counted_and_applied() {
    init_tracing();
    let hub = ChannelHub::new();
    let alice = node(&hub, "agent.alice");
    let bob = node(&hub, "agent.bob");

    let counter = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&counter);

    alice.transport.filters().add_buffer_filter(IdentityFilter).unwrap();
    alice
        .transport
        .filters()
        .add_send_filter(RecordType::String.into(), uppercase)
        .unwrap();
    alice
        .transport
        .filters()
        .add_send_aggregate_filter(move |_: &Packet, _: &mut TransportContext| -> Result<(), FilterError> {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    bob.transport.filters().add_buffer_filter(IdentityFilter).unwrap();

    alice.store.set("name", Value::from("alice")).unwrap();
    let outcome = alice.transport.send_modifieds().unwrap();
    assert!(matches!(outcome, SendOutcome::Sent { records: 1, .. }));
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    // inspect what actually went over the wire
    let datagram = bob.inbox.try_recv().unwrap();
    let mut chain = BufferFilterChain::new();
    chain.push(Arc::new(IdentityFilter));
    let framed = chain.decode_vec(&datagram.bytes, 64 * 1024).unwrap();
    let Message { header, packet } = wire::decode(&framed).unwrap();
    assert_eq!(header.originator, "agent.alice");
    assert_eq!(packet.len(), 1);
    assert_eq!(packet.get("name").unwrap().value, Value::from("ALICE"));

    let outcome = bob.transport.receive(&datagram.bytes, &datagram.from).unwrap();
    assert!(matches!(outcome, ReceiveOutcome::Applied { accepted: 1, .. }));
    assert_eq!(bob.store.value("name").unwrap(), Some(Value::from("ALICE")));
}

#[test]
fn infinite_double_is_applied_alongside_its_packet() {
    init_tracing();
    let hub = ChannelHub::new();
    let sender = node(&hub, "agent.s");
    let receiver = node(&hub, "agent.r");

    let packet: Packet = vec![
        ("name", Record::new("alice").with_clock(1)),
        ("speed", Record::new(Value::Double(f64::INFINITY)).with_clock(1)),
    ]
    .into_iter()
    .collect();
    assert!(sender.transport.send(packet).unwrap().is_sent());

    let outcome = deliver(&receiver);
    assert!(matches!(outcome, ReceiveOutcome::Applied { accepted: 2, .. }), "{outcome:?}");
    assert_eq!(receiver.store.value("speed").unwrap(), Some(Value::Double(f64::INFINITY)));
    assert_eq!(receiver.store.value("name").unwrap(), Some(Value::from("alice")));
}

#[test]
fn discarded_key_never_reaches_the_store() {
    init_tracing();
    let hub = ChannelHub::new();
    let sender = node(&hub, "agent.s");
    let receiver = node(&hub, "agent.r");

    receiver
        .transport
        .filters()
        .add_receive_filter(RecordTypes::ALL, |key: &str, record: Record, _: &mut TransportContext| -> RecordOutcome {
            Ok((key != "secret").then_some(record))
        })
        .unwrap();

    let packet: Packet = vec![
        ("secret", Record::new("hunter2").with_clock(1)),
        ("public", Record::new(7).with_clock(1)),
    ]
    .into_iter()
    .collect();
    assert!(sender.transport.send(packet).unwrap().is_sent());

    let outcome = deliver(&receiver);
    assert!(matches!(outcome, ReceiveOutcome::Applied { accepted: 1, .. }));
    assert_eq!(receiver.store.value("secret").unwrap(), None);
    assert_eq!(receiver.store.value("public").unwrap(), Some(Value::Integer(7)));
}

#[test]
fn ttl_zero_is_never_rebroadcast() {
    init_tracing();
    let hub = ChannelHub::new();
    let sender = node(&hub, "agent.s");
    let relay_policy = Arc::new(QosPolicy::new());
    relay_policy.set_participant_ttl(8).unwrap();
    let relay = node_with_policy(&hub, "agent.relay", relay_policy);
    let listener = node(&hub, "agent.l");

    // staging a record on every rebroadcast pass must not force a relay
    relay
        .transport
        .filters()
        .add_receive_aggregate_filter(|_: &Packet, ctx: &mut TransportContext| -> Result<(), FilterError> {
            ctx.add_record("seen_by_relay", Record::new(1));
            Ok(())
        })
        .unwrap();

    let mut packet = Packet::new();
    packet.insert("x", Record::new(1).with_clock(1));
    assert!(sender.transport.send(packet).unwrap().is_sent());

    let outcome = deliver(&relay);
    assert!(matches!(
        outcome,
        ReceiveOutcome::Applied {
            rebroadcast: false,
            ..
        }
    ));
    let _ = listener.inbox.try_recv().unwrap();
    assert!(listener.inbox.try_recv().is_err());
}

#[test]
fn relay_decrements_ttl_until_exhausted() {
    init_tracing();
    let hub = ChannelHub::new();

    let origin_policy = Arc::new(QosPolicy::new());
    origin_policy.set_rebroadcast_ttl(2).unwrap();
    let origin = node_with_policy(&hub, "agent.origin", origin_policy);

    let relay_policy = Arc::new(QosPolicy::new());
    relay_policy.set_participant_ttl(2).unwrap();
    let relay = node_with_policy(&hub, "agent.relay", relay_policy);

    let edge_policy = Arc::new(QosPolicy::new());
    edge_policy.set_participant_ttl(2).unwrap();
    let edge = node_with_policy(&hub, "agent.edge", edge_policy);

    let mut packet = Packet::new();
    packet.insert("temperature", Record::new(21.5).with_clock(3));
    assert!(origin.transport.send(packet).unwrap().is_sent());

    let outcome = deliver(&relay);
    assert!(matches!(outcome, ReceiveOutcome::Applied { rebroadcast: true, .. }));

    // the edge sees the original and the relayed copy
    let direct = edge.inbox.try_recv().unwrap();
    let relayed = edge.inbox.try_recv().unwrap();
    assert_eq!(direct.from, "host.agent.origin");
    assert_eq!(relayed.from, "host.agent.relay");

    let Message { header, .. } = wire::decode(&relayed.bytes).unwrap();
    assert_eq!(header.ttl, 1);
    assert_eq!(header.originator, "agent.origin");

    // ttl 1 arrives, is applied, but has no hops left
    let outcome = edge.transport.receive(&relayed.bytes, &relayed.from).unwrap();
    assert!(matches!(outcome, ReceiveOutcome::Applied { rebroadcast: false, .. }));
    assert_eq!(edge.store.value("temperature").unwrap(), Some(Value::Double(21.5)));

    // the origin ignores its own packet coming back
    let echo = origin.inbox.try_recv().unwrap();
    assert_eq!(origin.transport.receive(&echo.bytes, &echo.from).unwrap(), ReceiveOutcome::Ignored);
}

#[test]
fn staged_records_ride_along_unfiltered() {
    init_tracing();
    let hub = ChannelHub::new();
    let sender = node(&hub, "agent.s");
    let receiver = node(&hub, "agent.r");

    sender
        .transport
        .filters()
        .add_send_aggregate_filter(|packet: &Packet, ctx: &mut TransportContext| -> Result<(), FilterError> {
            let count = i64::try_from(packet.len()).map_err(|e| FilterError::aggregate(e.to_string()))?;
            ctx.add_record("batch_size", Record::new(count));
            Ok(())
        })
        .unwrap();
    // would drop every integer, but staged records are merged after the record pass
    sender
        .transport
        .filters()
        .add_send_filter(RecordType::Integer.into(), kyromesh::filter::DiscardAll)
        .unwrap();

    sender.store.set("a", Value::from("one")).unwrap();
    sender.store.set("b", Value::from("two")).unwrap();
    assert!(sender.transport.send_modifieds().unwrap().is_sent());

    deliver(&receiver);
    assert_eq!(receiver.store.value("batch_size").unwrap(), Some(Value::Integer(2)));
    assert_eq!(receiver.store.len().unwrap(), 3);
}

#[cfg(feature = "compression")]
#[test]
fn compressed_buffers_round_trip_between_peers() {
    init_tracing();
    let hub = ChannelHub::new();
    let sender = node(&hub, "agent.s");
    let receiver = node(&hub, "agent.r");

    for n in [&sender, &receiver] {
        n.transport.filters().add_buffer_filter(IdentityFilter).unwrap();
        n.transport.filters().add_buffer_filter(CompressionFilter::new().unwrap()).unwrap();
    }

    let readings: Vec<f64> = std::iter::repeat(0.25).take(512).collect();
    let mut packet = Packet::new();
    packet.insert("readings", Record::new(readings.clone()).with_clock(1));

    let SendOutcome::Sent { bytes, .. } = sender.transport.send(packet).unwrap() else {
        panic!("expected the packet to be sent");
    };
    assert!(bytes < readings.len() * 8);

    deliver(&receiver);
    assert_eq!(receiver.store.value("readings").unwrap(), Some(Value::DoubleArray(readings)));
}

#[test]
fn record_filter_errors_are_skipped() {
    init_tracing();
    let hub = ChannelHub::new();
    let sender = node(&hub, "agent.s");
    let receiver = node(&hub, "agent.r");

    sender
        .transport
        .filters()
        .add_send_filter(RecordTypes::ALL, |key: &str, _: Record, _: &mut TransportContext| -> RecordOutcome {
            Err(FilterError::record(key, "always fails"))
        })
        .unwrap();
    sender.transport.filters().add_send_filter(RecordType::String.into(), uppercase).unwrap();

    sender.store.set("greeting", Value::from("hello")).unwrap();
    assert!(sender.transport.send_modifieds().unwrap().is_sent());

    deliver(&receiver);
    assert_eq!(receiver.store.value("greeting").unwrap(), Some(Value::from("HELLO")));
}
