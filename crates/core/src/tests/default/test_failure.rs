use crate::error::Error;
use crate::hub::HubStatus;
use crate::tests::default::range;
use crate::tests::default::SimNet;
use crate::tests::default::HUB;
use crate::tests::setup_tracing;

#[test]
fn test_ring_heals_after_node_failure() {
    setup_tracing();
    let mut net = SimNet::new();
    let nodes = net.ring(7000, &[(7001, 500), (7002, 750)]);
    let (a, b, c) = (nodes[0], nodes[1], nodes[2]);
    net.run_for(5_000);
    assert_eq!(net.node(a).range(HUB), Some(range(0, 500)));
    assert_eq!(net.node(b).range(HUB), Some(range(500, 750)));
    assert_eq!(net.node(c).range(HUB), Some(range(750, 1000)));

    net.kill(b);
    // Still inside the pong timeout: nothing changed.
    net.run_for(30_000);
    assert_eq!(net.node(a).successor(HUB), Some(b));

    net.run_for(30_000);
    assert_eq!(net.node(a).successor(HUB), Some(c));
    assert_eq!(net.node(c).predecessor(HUB), Some(a));
    assert_eq!(net.node(a).range(HUB), Some(range(0, 750)));
    net.assert_partition();
    assert!(net.errors.is_empty());
}

#[test]
fn test_losing_every_successor_is_fatal() {
    let mut net = SimNet::new();
    let nodes = net.ring(7000, &[(7001, 500)]);
    net.kill(nodes[1]);
    net.run_for(60_000);
    assert!(net
        .errors
        .iter()
        .any(|(a, e)| *a == nodes[0] && matches!(e, Error::AllSuccessorsDead(HUB))));
}

#[test]
fn test_graceful_leave_hands_over_range_and_state() {
    setup_tracing();
    let mut net = SimNet::new();
    let nodes = net.ring(7000, &[(7001, 500), (7002, 750)]);
    let (a, b, c) = (nodes[0], nodes[1], nodes[2]);
    net.run_for(5_000);

    net.subscribe(a, 1, 600, 600);
    net.run_for(1_000);
    assert_eq!(net.node(b).stored_items(HUB), Some((1, 0)));

    net.with_node(b, |n, now| n.leave(now, HUB)).unwrap();
    assert_eq!(net.node(b).status(HUB), Some(HubStatus::Left));
    assert_eq!(net.node(b).range(HUB), None);
    assert_eq!(net.record(b).leave_begin, 1);
    assert_eq!(net.record(b).leave_end, 1);

    net.run_for(5_000);
    assert_eq!(net.node(c).range(HUB), Some(range(500, 1000)));
    assert_eq!(net.node(c).stored_items(HUB), Some((1, 0)));
    assert_eq!(net.node(a).successor(HUB), Some(c));
    assert_eq!(net.node(c).predecessor(HUB), Some(a));
    net.assert_partition();

    // The handed over interest still matches.
    net.publish(c, 9, 600, 600);
    net.run_for(1_000);
    assert_eq!(net.record(a).received.len(), 1);
    assert!(net.errors.is_empty());
}

#[test]
fn test_leave_when_not_joined() {
    let mut net = SimNet::new();
    let b = net.join(7001, Some(7999), None);
    let res = net.with_node(b, |n, now| n.leave(now, HUB));
    assert!(matches!(res, Err(Error::HubNotJoined(HUB))));
}
