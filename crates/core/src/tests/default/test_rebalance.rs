use crate::error::Error;
use crate::hub::HubStatus;
use crate::message::Message;
use crate::node::RebalanceState;
use crate::node::Side;
use crate::peer::Address;
use crate::tests::default::addr;
use crate::tests::default::range;
use crate::tests::default::SimNet;
use crate::tests::default::HUB;
use crate::tests::setup_tracing;

/// A [0,250) B [250,500) C [500,750) D [750,1000)
fn four_node_ring(net: &mut SimNet) -> Vec<Address> {
    let nodes = net.ring(7000, &[(7001, 250), (7002, 500), (7003, 750)]);
    net.run_for(5_000);
    net.assert_partition();
    nodes
}

#[test]
fn test_leave_join_relocates_light_node() {
    setup_tracing();
    let mut net = SimNet::new();
    let nodes = four_node_ring(&mut net);
    let (a, b, c, d) = (nodes[0], nodes[1], nodes[2], nodes[3]);

    net.with_node(a, |n, now| n.initiate_leave_join(now, HUB, c, range(125, 250)))
        .unwrap();
    assert_eq!(
        net.node(a).rebalance_state(HUB),
        Some(RebalanceState::WaitingForLeaveJoinResponse)
    );
    net.run_for(30_000);

    assert_eq!(net.node(a).range(HUB), Some(range(0, 125)));
    assert_eq!(net.node(c).range(HUB), Some(range(125, 250)));
    assert_eq!(net.node(b).range(HUB), Some(range(250, 625)));
    assert_eq!(net.node(d).range(HUB), Some(range(625, 1000)));
    assert_eq!(net.node(c).status(HUB), Some(HubStatus::Joined));
    assert_eq!(net.node(a).successor(HUB), Some(c));
    assert_eq!(net.node(c).successor(HUB), Some(b));
    assert_eq!(net.node(b).successor(HUB), Some(d));
    assert_eq!(net.node(a).rebalance_state(HUB), Some(RebalanceState::DoingNothing));
    assert_eq!(net.node(c).rebalance_state(HUB), Some(RebalanceState::DoingNothing));
    assert_eq!(net.record(c).leave_end, 1);
    assert_eq!(net.record(c).join_end, 2);
    net.assert_partition();
    assert!(net.errors.is_empty());
}

#[test]
fn test_leave_join_denied_to_adjacent_node() {
    let mut net = SimNet::new();
    let nodes = four_node_ring(&mut net);
    let (a, b) = (nodes[0], nodes[1]);

    net.with_node(a, |n, now| n.initiate_leave_join(now, HUB, b, range(125, 250)))
        .unwrap();
    net.run_for(1_000);
    assert_eq!(net.node(a).rebalance_state(HUB), Some(RebalanceState::DoingNothing));
    assert_eq!(net.node(b).rebalance_state(HUB), Some(RebalanceState::DoingNothing));
    assert_eq!(net.node(a).range(HUB), Some(range(0, 250)));
    assert_eq!(net.node(b).range(HUB), Some(range(250, 500)));
}

#[test]
fn test_leave_join_denied_by_application() {
    let mut net = SimNet::new();
    let nodes = four_node_ring(&mut net);
    let (a, c) = (nodes[0], nodes[2]);
    net.record_mut(c).refuse_leave_join = true;

    net.with_node(a, |n, now| n.initiate_leave_join(now, HUB, c, range(0, 125)))
        .unwrap();
    net.run_for(1_000);
    assert_eq!(net.node(a).rebalance_state(HUB), Some(RebalanceState::DoingNothing));
    assert_eq!(net.node(a).range(HUB), Some(range(0, 250)));
    assert_eq!(net.node(c).range(HUB), Some(range(500, 750)));
    net.assert_partition();
}

#[test]
fn test_leave_join_times_out() {
    let mut net = SimNet::new();
    let nodes = four_node_ring(&mut net);
    let a = nodes[0];

    net.with_node(a, |n, now| {
        n.initiate_leave_join(now, HUB, addr(7999), range(125, 250))
    })
    .unwrap();
    net.run_for(30_000);
    assert_eq!(
        net.node(a).rebalance_state(HUB),
        Some(RebalanceState::WaitingForLeaveJoinResponse)
    );
    // A second operation must wait.
    let res = net.with_node(a, |n, now| n.request_local_rebalance(now, HUB, Side::Successor));
    assert!(matches!(res, Err(Error::RebalanceInProgress(HUB))));

    net.run_for(31_000);
    assert_eq!(net.node(a).rebalance_state(HUB), Some(RebalanceState::DoingNothing));
    assert_eq!(net.node(a).range(HUB), Some(range(0, 250)));
}

#[test]
fn test_leave_join_proposal_must_share_an_end() {
    let mut net = SimNet::new();
    let nodes = four_node_ring(&mut net);
    let (a, c) = (nodes[0], nodes[2]);

    let res = net.with_node(a, |n, now| n.initiate_leave_join(now, HUB, c, range(50, 100)));
    assert!(matches!(res, Err(Error::InvalidRebalanceProposal { .. })));
    let res = net.with_node(a, |n, now| n.initiate_leave_join(now, HUB, c, range(0, 250)));
    assert!(matches!(res, Err(Error::InvalidRebalanceProposal { .. })));
    assert_eq!(net.node(a).rebalance_state(HUB), Some(RebalanceState::DoingNothing));
}

/// A [0,500) B [500,750) C [750,1000), B loaded ten times more than C, and an interest of A
/// stored at B.
fn unbalanced_ring(net: &mut SimNet) -> (Address, Address, Address) {
    let nodes = net.ring(7000, &[(7001, 500), (7002, 750)]);
    net.run_for(5_000);
    let (a, b, c) = (nodes[0], nodes[1], nodes[2]);
    net.record_mut(b).load = 10.0;
    net.record_mut(c).load = 1.0;
    net.subscribe(a, 1, 700, 700);
    net.run_for(1_000);
    assert_eq!(net.node(b).stored_items(HUB), Some((1, 0)));
    (a, b, c)
}

/// A publication at 700 still reaches A.
fn assert_interest_survives(net: &mut SimNet, a: Address, b: Address, nonce: u64) {
    let before = net.record(a).received.len();
    net.publish(b, nonce, 700, 700);
    net.run_for(1_000);
    let received: Vec<u64> = net.record(a).received.iter().map(|e| e.nonce).collect();
    assert_eq!(received.len(), before + 1);
    assert_eq!(received.last(), Some(&nonce));
}

#[test]
fn test_local_rebalance_moves_shared_boundary() {
    setup_tracing();
    let mut net = SimNet::new();
    let (a, b, c) = unbalanced_ring(&mut net);

    net.with_node(b, |n, now| n.request_local_rebalance(now, HUB, Side::Successor))
        .unwrap();
    assert_eq!(
        net.node(b).rebalance_state(HUB),
        Some(RebalanceState::SentReqLocalNbr)
    );
    net.run_for(5_000);

    // C takes (10 - 1) / 20 of the 250 B owned.
    assert_eq!(net.node(b).range(HUB), Some(range(500, 638)));
    assert_eq!(net.node(c).range(HUB), Some(range(638, 1000)));
    assert_eq!(net.node(a).range(HUB), Some(range(0, 500)));
    assert_eq!(net.node(b).rebalance_state(HUB), Some(RebalanceState::DoingNothing));
    net.assert_partition();

    assert_eq!(net.node(c).stored_items(HUB), Some((1, 0)));

    // Survives the next rounds of successor maintenance.
    net.run_for(20_000);
    assert_eq!(net.node(b).range(HUB), Some(range(500, 638)));
    net.assert_partition();
    assert_interest_survives(&mut net, a, b, 9);
    assert!(net.errors.is_empty());
}

#[test]
fn test_local_rebalance_with_lost_response_changes_nothing() {
    setup_tracing();
    let mut net = SimNet::new();
    let (a, b, c) = unbalanced_ring(&mut net);
    net.hold_where(move |from, to, m| {
        from == c && to == b && matches!(m, Message::LocalLBResponse(_))
    });

    net.with_node(b, |n, now| n.request_local_rebalance(now, HUB, Side::Successor))
        .unwrap();
    net.run_for(1_000);
    assert_eq!(net.take_held().len(), 1);
    assert_eq!(
        net.node(c).rebalance_state(HUB),
        Some(RebalanceState::AwaitingLocalHandover)
    );
    // Granting alone does not move the boundary.
    assert_eq!(net.node(c).range(HUB), Some(range(750, 1000)));

    net.run_for(30_000);
    assert_eq!(net.node(b).range(HUB), Some(range(500, 750)));
    assert_eq!(net.node(c).range(HUB), Some(range(750, 1000)));
    assert_eq!(net.node(b).rebalance_state(HUB), Some(RebalanceState::DoingNothing));
    assert_eq!(net.node(c).rebalance_state(HUB), Some(RebalanceState::DoingNothing));
    net.assert_partition();
    assert_interest_survives(&mut net, a, b, 9);
    assert!(net.errors.is_empty());
}

#[test]
fn test_local_rebalance_with_late_response_changes_nothing() {
    let mut net = SimNet::new();
    let (a, b, c) = unbalanced_ring(&mut net);
    net.hold_where(move |from, to, m| {
        from == c && to == b && matches!(m, Message::LocalLBResponse(_))
    });

    net.with_node(b, |n, now| n.request_local_rebalance(now, HUB, Side::Successor))
        .unwrap();
    net.run_for(3_000);
    assert_eq!(net.node(b).rebalance_state(HUB), Some(RebalanceState::DoingNothing));
    for d in net.take_held() {
        net.inject(&d);
    }
    net.run_for(500);
    assert_eq!(net.node(b).range(HUB), Some(range(500, 750)));
    assert_eq!(net.node(c).range(HUB), Some(range(750, 1000)));

    net.run_for(30_000);
    assert_eq!(net.node(b).range(HUB), Some(range(500, 750)));
    assert_eq!(net.node(c).range(HUB), Some(range(750, 1000)));
    assert_eq!(net.node(c).rebalance_state(HUB), Some(RebalanceState::DoingNothing));
    net.assert_partition();
    assert_interest_survives(&mut net, a, b, 9);
    assert!(net.errors.is_empty());
}

#[test]
fn test_local_rebalance_with_lost_handover_heals_the_gap() {
    let mut net = SimNet::new();
    let (a, b, c) = unbalanced_ring(&mut net);
    net.hold_where(move |from, to, m| {
        from == b && to == c && matches!(m, Message::StateHandover(_))
    });

    net.with_node(b, |n, now| n.request_local_rebalance(now, HUB, Side::Successor))
        .unwrap();
    net.run_for(1_000);
    assert_eq!(net.take_held().len(), 1);
    // B shrank first, C never grew: a gap, not a doubly owned slice.
    assert_eq!(net.node(b).range(HUB), Some(range(500, 638)));
    assert_eq!(net.node(c).range(HUB), Some(range(750, 1000)));

    net.run_for(30_000);
    assert_eq!(net.node(b).range(HUB), Some(range(500, 750)));
    assert_eq!(net.node(c).range(HUB), Some(range(750, 1000)));
    net.assert_partition();
    assert_interest_survives(&mut net, a, b, 9);
    assert!(net.errors.is_empty());
}

#[test]
fn test_local_rebalance_refused_without_imbalance() {
    let mut net = SimNet::new();
    let nodes = net.ring(7000, &[(7001, 500)]);
    let (a, b) = (nodes[0], nodes[1]);
    net.record_mut(a).load = 3.0;
    net.record_mut(b).load = 2.0;

    net.with_node(a, |n, now| n.request_local_rebalance(now, HUB, Side::Predecessor))
        .unwrap();
    net.run_for(2_000);
    assert_eq!(net.node(a).range(HUB), Some(range(0, 500)));
    assert_eq!(net.node(b).range(HUB), Some(range(500, 1000)));
    assert_eq!(net.node(a).rebalance_state(HUB), Some(RebalanceState::DoingNothing));
}
