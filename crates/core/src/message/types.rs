#![warn(missing_docs)]
//! This module defines the messages exchanged by members of a hub.
//! Most of them come in request/response pairs, such as `GetPred`/`Pred` and
//! `NeighborRequest`/`NeighborResponse`.

use serde::Deserialize;
use serde::Serialize;

use crate::bootstrap::HubInitInfo;
use crate::peer::Address;
use crate::peer::PeerInfo;
use crate::peer::PeerType;
use crate::pubsub::Event;
use crate::pubsub::Handover;
use crate::pubsub::Interest;
use crate::range::NodeRange;
use crate::time::Timestamp;
use crate::value::Value;

/// MessageType asking for a slice of the ring, routed to the owner of `target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Node that wants to join.
    pub joiner: Address,
    /// Position to split at. None splits the first member reached at its midpoint.
    pub target: Option<Value>,
    /// Exact range requested by a leave-join relocation.
    pub requested: Option<NodeRange>,
    /// The joiner is relocating to relieve the receiving node.
    pub leave_join: bool,
    /// Hops travelled.
    pub hop_count: u32,
}

/// Why a join request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinError {
    /// The node asked is not a member itself.
    AmUnjoined,
    /// The node is in the middle of another split.
    Busy,
    /// The range is too small to split.
    RangeTooSmall,
}

/// MessageType answering a join request with the range handed out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinResponse {
    /// Set when the request was refused, the joiner retries.
    pub error: Option<JoinError>,
    /// Range now owned by the joiner.
    pub assigned: Option<NodeRange>,
    /// Successor list of the joiner, nearest first.
    pub successors: Vec<PeerInfo>,
    /// Predecessor of the joiner.
    pub predecessor: Option<PeerInfo>,
    /// Interests and triggers of the assigned range.
    pub handover: Handover,
}

impl JoinResponse {
    /// A refusal.
    pub fn error(e: JoinError) -> Self {
        Self {
            error: Some(e),
            assigned: None,
            successors: vec![],
            predecessor: None,
            handover: Handover::default(),
        }
    }
}

/// MessageType telling the receiver the sender believes to be its predecessor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifySuccessor {
    /// Range of the sender.
    pub range: NodeRange,
}

/// MessageType asking a successor for its predecessor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetPred;

/// MessageType answering [GetPred].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pred {
    /// Range of the sender.
    pub range: NodeRange,
    /// Predecessor of the sender, if any.
    pub predecessor: Option<PeerInfo>,
}

/// MessageType asking a successor for its successor list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetSuccessorList;

/// MessageType answering [GetSuccessorList].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessorList {
    /// Range of the sender.
    pub range: NodeRange,
    /// Successors of the sender, nearest first.
    pub entries: Vec<PeerInfo>,
}

/// MessageType probing liveness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessPing {
    /// Range of the sender.
    pub range: Option<NodeRange>,
    /// Sequence number echoed by the pong.
    pub seqno: u32,
    /// Roles the receiver plays for the sender.
    pub role: PeerType,
}

/// MessageType answering a [LivenessPing], doubling as range gossip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessPong {
    /// Sequence number of the ping answered.
    pub seqno: u32,
    /// Range of the sender.
    pub range: Option<NodeRange>,
    /// When the ping was received.
    pub recv_time: Timestamp,
}

/// MessageType routed to the owner of `target` to install a long neighbor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborRequest {
    /// Node asking for a long neighbor.
    pub origin: Address,
    /// Value whose owner should answer.
    pub target: Value,
    /// Request id.
    pub nonce: u32,
    /// Repair epoch of the origin.
    pub epoch: u32,
    /// Hops travelled.
    pub hop_count: u32,
}

/// MessageType answering a [NeighborRequest].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborResponse {
    /// Range of the responder.
    pub range: NodeRange,
    /// Request id.
    pub nonce: u32,
    /// Repair epoch of the request.
    pub epoch: u32,
}

/// MessageType handing the sender's range and state over to the receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaveNotification {
    /// New range of the receiver.
    pub merged_range: NodeRange,
    /// State of the handed over range.
    pub handover: Handover,
}

/// Why a link is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkBreakReason {
    /// The sender leaves the hub.
    Leaving,
    /// The sender no longer keeps the receiver as a long neighbor.
    LongNeighborReplaced,
}

/// MessageType dropping a link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkBreak {
    /// Why.
    pub reason: LinkBreakReason,
}

/// MessageType asking an adjacent node to take part of the sender's range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalLBRequest {
    /// Range of the sender.
    pub range: NodeRange,
    /// Load of the sender.
    pub load: f64,
}

/// MessageType answering a [LocalLBRequest].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalLBResponse {
    /// New range of the requester, None when refused.
    pub assigned: Option<NodeRange>,
    /// Range of the responder after the move.
    pub peer_range: NodeRange,
}

/// MessageType moving stored state along with a range boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateHandover {
    /// The state.
    pub handover: Handover,
}

/// MessageType asking a lightly loaded node to relocate into part of the sender's range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaveJoinLBRequest {
    /// Range the receiver would own after relocating.
    pub proposed: NodeRange,
    /// Load of the sender.
    pub load: f64,
}

/// Why a leave-join was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DenialReason {
    /// Already rebalancing.
    Busy,
    /// The application does not allow it now.
    NotAllowed,
    /// The neighborhood is still settling after a topology change.
    Unstable,
    /// Not a member.
    NotJoined,
    /// No predecessor or successor to hand the range to.
    NoNeighbors,
    /// The requester is a direct neighbor.
    Adjacent,
    /// Only two members left.
    TooFewNodes,
    /// The successor refused to absorb the range.
    SuccessorRefused,
}

/// MessageType refusing a [LeaveJoinLBRequest].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaveJoinDenial {
    /// Why.
    pub reason: DenialReason,
}

/// MessageType asking the successor whether it can absorb the sender's range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaveCheckRequest;

/// MessageType answering [LeaveCheckRequest].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaveCheckResponse {
    /// The successor agrees.
    pub ok: bool,
}

/// How a routed item currently travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutingMode {
    /// Greedy jumps toward the lower end of the constraint.
    Greedy,
    /// Successor by successor.
    Linear,
}

/// MessageType carrying a publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    /// The event.
    pub event: Event,
    /// Current routing mode.
    pub mode: RoutingMode,
    /// Hops travelled.
    pub hop_count: u32,
}

/// MessageType carrying a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    /// The interest.
    pub interest: Interest,
    /// Current routing mode.
    pub mode: RoutingMode,
    /// Hops travelled.
    pub hop_count: u32,
}

/// MessageType carrying a fanned out publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearPublication {
    /// The event.
    pub event: Event,
    /// The receiver and whatever it reaches must not go past this value.
    pub stop: Value,
    /// Hops travelled.
    pub hop_count: u32,
}

/// MessageType carrying a fanned out subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearSubscription {
    /// The interest.
    pub interest: Interest,
    /// The receiver and whatever it reaches must not go past this value.
    pub stop: Value,
    /// Hops travelled.
    pub hop_count: u32,
}

/// MessageType delivering a publication to a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedPublication {
    /// The event.
    pub event: Event,
}

/// MessageType asking the bootstrap server for the hubs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapRequest {
    /// Address of the asking node.
    pub addr: Address,
}

/// MessageType describing the hubs to join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapResponse {
    /// The hubs.
    pub hubs: Vec<HubInitInfo>,
}

/// MessageType reporting liveness and range to the bootstrap server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartBeat {
    /// Address of the node.
    pub addr: Address,
    /// Owned range in the hub of the envelope.
    pub range: Option<NodeRange>,
}

/// MessageType broadcast by the bootstrap server once every expected node joined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllJoined;

/// All wire messages.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Message {
    /// Join request.
    JoinRequest(JoinRequest),
    /// Join response.
    JoinResponse(JoinResponse),
    /// Notify successor.
    NotifySuccessor(NotifySuccessor),
    /// Get predecessor.
    GetPred(GetPred),
    /// Predecessor.
    Pred(Pred),
    /// Get successor list.
    GetSuccessorList(GetSuccessorList),
    /// Successor list.
    SuccessorList(SuccessorList),
    /// Liveness ping.
    LivenessPing(LivenessPing),
    /// Liveness pong.
    LivenessPong(LivenessPong),
    /// Long-neighbor request.
    NeighborRequest(NeighborRequest),
    /// Long-neighbor response.
    NeighborResponse(NeighborResponse),
    /// Range handover on leave.
    LeaveNotification(LeaveNotification),
    /// Link break.
    LinkBreak(LinkBreak),
    /// Local load balance request.
    LocalLBRequest(LocalLBRequest),
    /// Local load balance response.
    LocalLBResponse(LocalLBResponse),
    /// State moved with a boundary.
    StateHandover(StateHandover),
    /// Leave-join load balance request.
    LeaveJoinLBRequest(LeaveJoinLBRequest),
    /// Leave-join denial.
    LeaveJoinDenial(LeaveJoinDenial),
    /// Leave check request.
    LeaveCheckRequest(LeaveCheckRequest),
    /// Leave check response.
    LeaveCheckResponse(LeaveCheckResponse),
    /// Publication.
    Publication(Publication),
    /// Subscription.
    Subscription(Subscription),
    /// Fanned out publication.
    LinearPublication(LinearPublication),
    /// Fanned out subscription.
    LinearSubscription(LinearSubscription),
    /// Matched publication.
    MatchedPublication(MatchedPublication),
    /// Bootstrap request.
    BootstrapRequest(BootstrapRequest),
    /// Bootstrap response.
    BootstrapResponse(BootstrapResponse),
    /// Heartbeat to bootstrap.
    HeartBeat(HeartBeat),
    /// All expected nodes joined.
    AllJoined(AllJoined),
}
