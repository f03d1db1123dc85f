use crate::error::Error;
use crate::hub::HubStatus;
use crate::message::Message;
use crate::params::Parameters;
use crate::tests::default::addr;
use crate::tests::default::range;
use crate::tests::default::SimNet;
use crate::tests::default::HUB;
use crate::tests::setup_tracing;
use crate::value::Value;

#[test]
fn test_first_node_owns_the_whole_domain() {
    setup_tracing();
    let mut net = SimNet::new();
    let a = net.join(7000, None, None);
    net.run_for(3_000);

    assert_eq!(net.node(a).status(HUB), Some(HubStatus::Joined));
    assert_eq!(net.node(a).range(HUB), Some(range(0, 1000)));
    assert_eq!(net.node(a).successor(HUB), None);
    assert_eq!(net.record(a).join_begin, 1);
    assert_eq!(net.record(a).join_end, 1);
    net.assert_partition();
    assert!(net.errors.is_empty());
}

#[test]
fn test_second_node_takes_upper_half() {
    setup_tracing();
    let mut net = SimNet::new();
    let a = net.join(7000, None, None);
    let b = net.join(7001, Some(7000), None);
    net.run_for(5_000);

    assert_eq!(net.node(a).range(HUB), Some(range(0, 500)));
    assert_eq!(net.node(b).range(HUB), Some(range(500, 1000)));
    assert_eq!(net.node(a).successor(HUB), Some(b));
    assert_eq!(net.node(a).predecessor(HUB), Some(b));
    assert_eq!(net.node(b).successor(HUB), Some(a));
    assert_eq!(net.node(b).predecessor(HUB), Some(a));
    assert_eq!(net.record(b).join_begin, 1);
    assert_eq!(net.record(b).join_end, 1);
    net.assert_partition();
    assert!(net.errors.is_empty());
}

#[test]
fn test_join_at_target() {
    let mut net = SimNet::new();
    let a = net.join(7000, None, None);
    let b = net.join(7001, Some(7000), Some(250));
    net.run_for(5_000);

    assert_eq!(net.node(a).range(HUB), Some(range(0, 250)));
    assert_eq!(net.node(b).range(HUB), Some(range(250, 1000)));
    net.assert_partition();
}

#[test]
fn test_join_request_is_routed_to_the_owner() {
    let mut net = SimNet::new();
    let nodes = net.ring(7000, &[(7001, 500), (7002, 750), (7003, 250)]);
    net.run_for(10_000);

    let ranges: Vec<_> = net.ranges().into_iter().map(|(_, r)| r).collect();
    assert_eq!(
        ranges,
        vec![range(0, 250), range(250, 500), range(500, 750), range(750, 1000)]
    );
    // 7002 joined through 7000 but split 7001's range.
    assert_eq!(net.node(nodes[2]).predecessor(HUB), Some(nodes[1]));
    assert_eq!(net.node(nodes[3]).successor(HUB), Some(nodes[1]));
    assert_eq!(net.node(nodes[0]).successor(HUB), Some(nodes[3]));
    assert_eq!(net.node(nodes[0]).predecessor(HUB), Some(nodes[2]));
    for n in &nodes {
        assert_eq!(net.record(*n).join_end, 1);
    }
    net.assert_partition();
    assert!(net.errors.is_empty());
}

#[test]
fn test_duplicate_join_request_gets_the_cached_response() {
    let mut net = SimNet::new();
    let a = net.join(7000, None, None);
    net.run_for(1_000);
    let b = addr(7001);
    net.hold_where(move |from, to, m| {
        from == b && to == a && matches!(m, Message::JoinRequest(_))
    });
    net.join(7001, Some(7000), None);
    net.run_for(100);
    let requests = net.take_held();
    assert_eq!(requests.len(), 1);

    net.hold_where(move |from, to, m| {
        from == a && to == b && matches!(m, Message::JoinResponse(_))
    });
    net.inject(&requests[0]);
    net.inject(&requests[0]);
    net.run_for(100);
    let responses = net.take_held();
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0].bytes, responses[1].bytes);
    // Split once.
    assert_eq!(net.node(a).range(HUB), Some(range(0, 500)));

    for r in &responses {
        net.inject(r);
    }
    net.run_for(5_000);
    assert_eq!(net.node(a).range(HUB), Some(range(0, 500)));
    assert_eq!(net.node(b).range(HUB), Some(range(500, 1000)));
    assert_eq!(net.record(b).join_begin, 1);
    assert_eq!(net.record(b).join_end, 1);
    net.assert_partition();
}

#[test]
fn test_late_join_response_is_ignored() {
    let mut net = SimNet::new();
    let a = net.join(7000, None, None);
    net.run_for(1_000);
    net.hold_where(move |from, _, m| from == a && matches!(m, Message::JoinResponse(_)));
    let b = net.join(7001, Some(7000), None);
    net.run_for(100);
    let responses = net.take_held();
    assert_eq!(responses.len(), 1);

    net.inject(&responses[0]);
    net.run_for(5_000);
    assert_eq!(net.node(b).status(HUB), Some(HubStatus::Joined));
    assert_eq!(net.node(b).range(HUB), Some(range(500, 1000)));

    net.inject(&responses[0]);
    net.run_for(5_000);
    assert_eq!(net.node(a).range(HUB), Some(range(0, 500)));
    assert_eq!(net.node(b).range(HUB), Some(range(500, 1000)));
    assert_eq!(net.record(b).join_begin, 1);
    assert_eq!(net.record(b).join_end, 1);
    net.assert_partition();
}

#[test]
fn test_join_twice_is_refused() {
    let mut net = SimNet::new();
    let a = net.join(7000, None, None);
    net.run_for(1_000);
    let res = net.with_node(a, |n, now| n.join_hub(now, HUB, None, None));
    assert!(matches!(res, Err(Error::HubAlreadyJoined(HUB))));
}

#[test]
fn test_join_gives_up_on_dead_representative() {
    let params = Parameters {
        max_join_attempts: 3,
        ..Default::default()
    };
    let mut net = SimNet::with_params(params);
    let b = net.join(7001, Some(7999), None);
    net.run_for(20_000);

    assert_eq!(net.node(b).status(HUB), Some(HubStatus::NotJoined));
    assert_eq!(net.record(b).join_failed, 1);
    assert_eq!(net.record(b).join_begin, 0);
    // 3 requests, all lost.
    assert_eq!(net.dropped, 3);
}

#[test]
fn test_publish_before_join_fails() {
    let mut net = SimNet::new();
    let b = net.join(7001, Some(7999), None);
    let res = net.with_node(b, |n, now| {
        n.publish(
            now,
            HUB,
            crate::pubsub::Event {
                nonce: 1,
                creator: addr(7001),
                constraint: range(1, 1),
                lifetime: 0,
                payload: bytes::Bytes::new(),
            },
        )
    });
    assert!(matches!(res, Err(Error::HubNotJoined(HUB))));
}

#[test]
fn test_static_topology_skips_negotiation() {
    use crate::bootstrap::StaticTopology;
    use crate::peer::PeerInfo;

    let (a, b) = (addr(7000), addr(7001));
    let topo = |mine, other, other_range| StaticTopology {
        range: mine,
        successors: vec![PeerInfo {
            addr: other,
            range: other_range,
        }],
        predecessors: vec![PeerInfo {
            addr: other,
            range: other_range,
        }],
    };
    let mut nodes = vec![];
    for (me, mine, other, theirs) in [
        (a, range(0, 400), b, range(400, 1000)),
        (b, range(400, 1000), a, range(0, 400)),
    ] {
        let mut info = crate::tests::default::hub_info();
        info.static_topology = Some(topo(mine, other, theirs));
        let mut node = crate::MercuryNode::new(
            me,
            Parameters::default(),
            crate::app::NullApplication,
        )
        .unwrap();
        node.add_hub(info).unwrap();
        node.start(crate::time::Timestamp::ZERO).unwrap();
        nodes.push(node);
    }
    assert_eq!(nodes[0].range(HUB), Some(range(0, 400)));
    assert_eq!(nodes[0].successor(HUB), Some(b));
    assert_eq!(nodes[1].status(HUB), Some(HubStatus::Joined));
    assert_eq!(nodes[1].predecessor(HUB), Some(a));
    assert_eq!(nodes[1].range(HUB).map(|r| r.min), Some(Value(400)));
}
