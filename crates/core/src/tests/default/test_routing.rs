use bytes::Bytes;

use crate::message::Encoder;
use crate::message::Envelope;
use crate::message::Message;
use crate::message::Publication;
use crate::message::RoutingMode;
use crate::message::Subscription;
use crate::params::Parameters;
use crate::pubsub::Event;
use crate::pubsub::Interest;
use crate::tests::default::range;
use crate::tests::default::Datagram;
use crate::tests::default::SimNet;
use crate::tests::default::HUB;
use crate::tests::setup_tracing;

fn nonces(net: &SimNet, a: crate::peer::Address) -> Vec<u64> {
    let mut v: Vec<u64> = net.record(a).received.iter().map(|e| e.nonce).collect();
    v.sort();
    v
}

#[test]
fn test_point_publication_delivered_once() {
    setup_tracing();
    let mut net = SimNet::new();
    let nodes = net.ring(7000, &[(7001, 500)]);
    let (a, b) = (nodes[0], nodes[1]);

    net.subscribe(b, 1, 250, 350);
    net.run_for(1_000);
    assert_eq!(net.node(a).stored_items(HUB), Some((1, 0)));
    assert_eq!(net.node(b).stored_items(HUB), Some((0, 0)));

    net.publish(a, 42, 300, 300);
    net.run_for(1_000);
    assert_eq!(nonces(&net, b), vec![42]);
    assert!(net.record(a).received.is_empty());

    // Outside the interest.
    net.publish(a, 43, 400, 400);
    net.run_for(1_000);
    assert_eq!(nonces(&net, b), vec![42]);
    assert!(net.errors.is_empty());
}

#[test]
fn test_own_publications_are_not_delivered_back() {
    let mut net = SimNet::new();
    let nodes = net.ring(7000, &[(7001, 500)]);
    net.subscribe(nodes[1], 1, 0, 999);
    net.run_for(1_000);
    net.publish(nodes[1], 7, 600, 600);
    net.run_for(1_000);
    assert!(net.record(nodes[1]).received.is_empty());
}

fn range_subscription_fanout(fanout: bool) {
    let params = Parameters {
        fanout,
        ..Default::default()
    };
    let mut net = SimNet::with_params(params);
    let nodes = net.ring(7000, &[(7001, 250), (7002, 500), (7003, 750)]);
    net.run_for(5_000);
    let d = nodes[3];

    net.subscribe(d, 1, 100, 800);
    net.run_for(1_000);
    for n in &nodes {
        assert_eq!(net.node(*n).stored_items(HUB).map(|s| s.0), Some(1));
    }

    // Lands on one node only.
    net.publish(nodes[0], 10, 600, 600);
    net.run_for(1_000);
    assert_eq!(nonces(&net, d), vec![10]);

    // Spans every node, still matched once.
    net.publish(nodes[1], 11, 200, 900);
    net.run_for(1_000);
    assert_eq!(nonces(&net, d), vec![10, 11]);
    assert!(net.errors.is_empty());
}

#[test]
fn test_range_subscription_with_fanout() {
    range_subscription_fanout(true);
}

#[test]
fn test_range_subscription_with_successor_walk() {
    range_subscription_fanout(false);
}

#[test]
fn test_stored_publication_triggers_later_subscription() {
    let mut net = SimNet::new();
    let nodes = net.ring(7000, &[(7001, 500), (7002, 800)]);
    let (a, b, c) = (nodes[0], nodes[1], nodes[2]);
    net.record_mut(b).store_publications = true;

    net.publish(a, 5, 700, 700);
    net.run_for(1_000);
    assert_eq!(net.node(b).stored_items(HUB), Some((0, 1)));

    net.subscribe(c, 1, 650, 750);
    net.run_for(1_000);
    assert_eq!(nonces(&net, c), vec![5]);
    assert_eq!(net.node(b).stored_items(HUB), Some((1, 1)));
}

#[test]
fn test_long_neighbors_found_in_large_ring() {
    use crate::metric::FixedPopulation;

    let mut net = SimNet::new();
    let mut nodes = vec![net.join_with_metric(7000, None, None, FixedPopulation(16))];
    for (i, target) in [125u64, 250, 375, 500, 625, 750, 875].iter().enumerate() {
        nodes.push(net.join_with_metric(7001 + i as u16, Some(7000), Some(*target), FixedPopulation(16)));
        net.run_for(3_000);
    }
    net.run_for(15_000);
    net.assert_partition();

    let longs: usize = nodes
        .iter()
        .map(|n| net.node(*n).hub(HUB).unwrap().long_neighbors().len())
        .sum();
    assert!(longs > 0);
    let reverse = nodes.iter().any(|n| {
        net.node(*n)
            .hub(HUB)
            .unwrap()
            .peers()
            .any(|p| p.is_reverse_long_neighbor())
    });
    assert!(reverse);
    assert!(net.errors.is_empty());
}

#[test]
fn test_messages_past_ttl_are_dropped() {
    let mut net = SimNet::new();
    let nodes = net.ring(7000, &[(7001, 500)]);
    let (a, b) = (nodes[0], nodes[1]);
    net.subscribe(a, 1, 700, 700);
    net.run_for(1_000);
    assert_eq!(net.node(b).stored_items(HUB), Some((1, 0)));

    let max = net.params.max_message_ttl;
    let datagram = |message| Datagram {
        from: a,
        to: b,
        bytes: Envelope::new(HUB, message).encode().unwrap(),
    };
    let publication = |nonce, hop_count| {
        Message::Publication(Publication {
            event: Event {
                nonce,
                creator: b,
                constraint: range(700, 700),
                lifetime: 60_000,
                payload: Bytes::from_static(b"ev"),
            },
            mode: RoutingMode::Greedy,
            hop_count,
        })
    };

    net.inject(&datagram(publication(2, max)));
    net.run_for(1_000);
    assert!(nonces(&net, a).is_empty());

    // Close to the limit only warns.
    net.inject(&datagram(publication(3, max - 1)));
    net.run_for(1_000);
    assert_eq!(nonces(&net, a), vec![3]);

    net.inject(&datagram(Message::Subscription(Subscription {
        interest: Interest {
            nonce: 4,
            subscriber: a,
            constraint: range(600, 600),
            lifetime: 600_000,
        },
        mode: RoutingMode::Greedy,
        hop_count: max + 3,
    })));
    net.run_for(1_000);
    assert_eq!(net.node(b).stored_items(HUB), Some((1, 0)));
    assert!(net.errors.is_empty());
}
