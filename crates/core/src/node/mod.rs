#![warn(missing_docs)]
//! The sans-IO node.
//!
//! [MercuryNode] owns every hub this node takes part in, the timer heap and the queue of datagrams
//! waiting to be sent. It never touches a socket or a clock: the caller feeds it received datagrams
//! and the current time, and drains [Outgoing] datagrams.
//!
//! Protocol handlers are split by concern:
//! - `membership`: joining, splitting, successor and predecessor maintenance;
//! - `link`: liveness pings, long neighbors and link breaks;
//! - `router`: publication and subscription routing;
//! - `rebalance`: leaving, leave-join and local load balancing;
//! - `bootstrap`: the bootstrap-server client.

mod bootstrap;
mod link;
mod membership;
mod rebalance;
mod router;

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::SeedableRng;

use self::bootstrap::BootstrapClient;
use self::link::LinkState;
use self::membership::JoinState;
use self::rebalance::Rebalance;
pub use self::rebalance::RebalanceState;
pub use self::rebalance::Side;
use self::router::Routed;
use crate::app::Application;
use crate::bootstrap::HubInitInfo;
use crate::error::Error;
use crate::error::Result;
use crate::hub::HubStatus;
use crate::hub::MemberHub;
use crate::message::Decoder;
use crate::message::Encoder;
use crate::message::Envelope;
use crate::message::HubId;
use crate::message::Message;
use crate::message::RoutingMode;
use crate::message::NODE_SCOPE;
use crate::metric::MetricSource;
use crate::metric::UniformDensity;
use crate::params::Parameters;
use crate::peer::Address;
use crate::pubsub::Event;
use crate::pubsub::Interest;
use crate::pubsub::PubsubStore;
use crate::range::NodeRange;
use crate::scheduler::Scheduler;
use crate::scheduler::TimerHandle;
use crate::time::Timestamp;
use crate::value::Value;

/// A datagram the node wants sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    /// Destination.
    pub to: Address,
    /// Encoded envelope.
    pub bytes: Bytes,
}

/// Timers of one hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HubTimer {
    Join,
    SuccessorMaintenance,
    PingPeers,
    RepairLongNeighbors,
    NeighborRequest { nonce: u32 },
    KickOldPeers { epoch: u32 },
    LeaveJoinResponse,
    LeaveCheck,
    LeaveContinuation,
    LocalLbResponse,
    LocalLbHandover,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Timer {
    Hub { hub: HubId, kind: HubTimer },
    BootstrapRequest,
    BootstrapHeartbeat,
}

/// Everything a hub handler may touch besides its own hub.
pub(crate) struct Context<'a> {
    pub(crate) now: Timestamp,
    pub(crate) me: Address,
    pub(crate) params: &'a Parameters,
    pub(crate) app: &'a mut dyn Application,
    pub(crate) metric: &'a dyn MetricSource,
    pub(crate) rng: &'a mut StdRng,
    scheduler: &'a mut Scheduler<Timer>,
    outbox: &'a mut VecDeque<Outgoing>,
}

impl<'a> Context<'a> {
    /// Queue `message` for `to`. Messages to ourselves are dropped.
    pub(crate) fn send(&mut self, to: Address, hub: HubId, message: Message) -> Result<()> {
        if to == self.me {
            tracing::debug!("dropping {} addressed to ourselves", message.name());
            return Ok(());
        }
        tracing::trace!("send {} to {} on hub {}", message.name(), to, hub);
        let bytes = Envelope::new(hub, message).encode()?;
        self.outbox.push_back(Outgoing { to, bytes });
        Ok(())
    }

    pub(crate) fn schedule(&mut self, after: Duration, hub: HubId, kind: HubTimer) -> TimerHandle {
        self.scheduler
            .schedule(self.now + after, Timer::Hub { hub, kind })
    }

    pub(crate) fn cancel(&mut self, handle: Option<TimerHandle>) {
        if let Some(h) = handle {
            self.scheduler.cancel(h);
        }
    }

    pub(crate) fn cancel_hub_timers(&mut self, hub: HubId) {
        let n = self
            .scheduler
            .cancel_where(|t| matches!(t, Timer::Hub { hub: h, .. } if *h == hub));
        tracing::debug!("cancelled {} timers of hub {}", n, hub);
    }

    pub(crate) fn ms(&self, v: u64) -> Duration {
        Parameters::ms(v)
    }
}

/// Generic trait for handling a message, inspired by the actor model.
pub(crate) trait HandleMsg<T> {
    /// Message handler.
    fn handle(&mut self, cx: &mut Context<'_>, from: Address, msg: T) -> Result<()>;
}

/// Per-hub protocol state.
pub(crate) struct Hub {
    pub(crate) member: MemberHub,
    pub(crate) store: PubsubStore,
    pub(crate) info: HubInitInfo,
    pub(crate) join: JoinState,
    pub(crate) links: LinkState,
    pub(crate) lb: Rebalance,
    unstable_until: Option<Timestamp>,
}

impl Hub {
    fn new(info: HubInitInfo, me: Address) -> Self {
        Self {
            member: MemberHub::new(&info, me),
            store: PubsubStore::default(),
            info,
            join: JoinState::default(),
            links: LinkState::default(),
            lb: Rebalance::default(),
            unstable_until: None,
        }
    }

    pub(crate) fn id(&self) -> HubId {
        self.member.id()
    }

    /// A recent range change is still settling; gap absorption and rebalancing wait.
    pub(crate) fn is_unstable(&self, now: Timestamp) -> bool {
        self.unstable_until.map(|t| now < t).unwrap_or(false)
    }

    pub(crate) fn mark_unstable(&mut self, now: Timestamp, period: Duration) {
        let until = now + period;
        if self.unstable_until.map(|t| t < until).unwrap_or(true) {
            self.unstable_until = Some(until);
        }
    }

    fn on_timer(&mut self, cx: &mut Context<'_>, handle: TimerHandle, kind: HubTimer) -> Result<()> {
        match kind {
            HubTimer::Join => self.on_join_timer(cx),
            HubTimer::SuccessorMaintenance => self.on_successor_maintenance(cx),
            HubTimer::PingPeers => self.on_ping_peers(cx),
            HubTimer::RepairLongNeighbors => self.on_repair_long_neighbors(cx),
            HubTimer::NeighborRequest { nonce } => {
                self.on_neighbor_request_timeout(nonce, handle);
                Ok(())
            }
            HubTimer::KickOldPeers { epoch } => self.on_kick_old_peers(cx, epoch),
            HubTimer::LeaveJoinResponse => {
                self.on_leave_join_timeout(handle);
                Ok(())
            }
            HubTimer::LeaveCheck => self.on_leave_check_timeout(cx, handle),
            HubTimer::LeaveContinuation => self.on_leave_continuation(cx),
            HubTimer::LocalLbResponse => {
                self.on_local_lb_timeout(handle);
                Ok(())
            }
            HubTimer::LocalLbHandover => {
                self.on_local_handover_timeout(handle);
                Ok(())
            }
        }
    }

    fn dispatch(&mut self, cx: &mut Context<'_>, from: Address, message: Message) -> Result<()> {
        match message {
            Message::JoinRequest(msg) => self.handle(cx, from, msg),
            Message::JoinResponse(msg) => self.handle(cx, from, msg),
            Message::NotifySuccessor(msg) => self.handle(cx, from, msg),
            Message::GetPred(msg) => self.handle(cx, from, msg),
            Message::Pred(msg) => self.handle(cx, from, msg),
            Message::GetSuccessorList(msg) => self.handle(cx, from, msg),
            Message::SuccessorList(msg) => self.handle(cx, from, msg),
            Message::LivenessPing(msg) => self.handle(cx, from, msg),
            Message::LivenessPong(msg) => self.handle(cx, from, msg),
            Message::NeighborRequest(msg) => self.handle(cx, from, msg),
            Message::NeighborResponse(msg) => self.handle(cx, from, msg),
            Message::LeaveNotification(msg) => self.handle(cx, from, msg),
            Message::LinkBreak(msg) => self.handle(cx, from, msg),
            Message::LocalLBRequest(msg) => self.handle(cx, from, msg),
            Message::LocalLBResponse(msg) => self.handle(cx, from, msg),
            Message::StateHandover(msg) => self.handle(cx, from, msg),
            Message::LeaveJoinLBRequest(msg) => self.handle(cx, from, msg),
            Message::LeaveJoinDenial(msg) => self.handle(cx, from, msg),
            Message::LeaveCheckRequest(msg) => self.handle(cx, from, msg),
            Message::LeaveCheckResponse(msg) => self.handle(cx, from, msg),
            Message::Publication(msg) => self.handle(cx, from, msg),
            Message::Subscription(msg) => self.handle(cx, from, msg),
            Message::LinearPublication(msg) => self.handle(cx, from, msg),
            Message::LinearSubscription(msg) => self.handle(cx, from, msg),
            Message::MatchedPublication(msg) => self.handle(cx, from, msg),
            Message::BootstrapRequest(_)
            | Message::BootstrapResponse(_)
            | Message::HeartBeat(_)
            | Message::AllJoined(_) => {
                tracing::warn!(
                    "node scoped {} from {} arrived on hub {}",
                    message.name(),
                    from,
                    self.id()
                );
                Ok(())
            }
        }
    }
}

/// A Mercury node: the set of hubs it takes part in plus the event loop state.
pub struct MercuryNode {
    address: Address,
    params: Parameters,
    hubs: BTreeMap<HubId, Hub>,
    scheduler: Scheduler<Timer>,
    outbox: VecDeque<Outgoing>,
    app: Box<dyn Application>,
    metric: Box<dyn MetricSource>,
    rng: StdRng,
    bootstrap: Option<BootstrapClient>,
}

impl MercuryNode {
    /// Create a node listening at `address`.
    pub fn new(
        address: Address,
        params: Parameters,
        app: impl Application + 'static,
    ) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            address,
            params,
            hubs: BTreeMap::new(),
            scheduler: Scheduler::new(),
            outbox: VecDeque::new(),
            app: Box::new(app),
            metric: Box::new(UniformDensity),
            rng: StdRng::from_entropy(),
            bootstrap: None,
        })
    }

    /// Replace the population estimator used to place long neighbors.
    pub fn with_metric_source(mut self, metric: impl MetricSource + 'static) -> Self {
        self.metric = Box::new(metric);
        self
    }

    /// Make long-neighbor sampling deterministic.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Fetch hub descriptions from a bootstrap server on [MercuryNode::start].
    pub fn with_bootstrap(mut self, server: Address) -> Self {
        self.bootstrap = Some(BootstrapClient::new(server));
        self
    }

    /// Address of this node.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Protocol parameters.
    pub fn params(&self) -> &Parameters {
        &self.params
    }

    /// Register a hub. Joining happens on [MercuryNode::start] or [MercuryNode::join_hub].
    pub fn add_hub(&mut self, info: HubInitInfo) -> Result<()> {
        info.validate()?;
        if info.id == NODE_SCOPE {
            return Err(Error::InvalidParameters(format!(
                "hub id {} is reserved",
                NODE_SCOPE
            )));
        }
        if self.hubs.contains_key(&info.id) {
            return Err(Error::HubAlreadyRegistered(info.id));
        }
        tracing::info!(
            "registered hub {} ({}) over [{}, {})",
            info.id,
            info.name,
            info.absmin,
            info.absmax
        );
        self.hubs.insert(info.id, Hub::new(info, self.address));
        Ok(())
    }

    /// Join every registered hub through its configured representative and start the bootstrap
    /// client, if any.
    pub fn start(&mut self, now: Timestamp) -> Result<()> {
        let pending: Vec<(HubId, Option<Address>)> = self
            .hubs
            .values()
            .filter(|h| h.member.status() == HubStatus::NotJoined)
            .map(|h| (h.id(), h.info.representative))
            .collect();
        for (id, rep) in pending {
            self.join_hub(now, id, rep, None)?;
        }
        if self.bootstrap.is_some() {
            self.scheduler.schedule(now, Timer::BootstrapRequest);
        }
        Ok(())
    }

    /// Join `hub` through `representative`, asking for the range starting at `target` if given.
    /// Without a representative this node founds the ring and owns the whole domain.
    pub fn join_hub(
        &mut self,
        now: Timestamp,
        hub: HubId,
        representative: Option<Address>,
        target: Option<Value>,
    ) -> Result<()> {
        self.with_hub(now, hub, |h, cx| {
            h.begin_join(cx, representative, target, None, false)
        })
    }

    /// Process a received datagram.
    pub fn handle_message(&mut self, now: Timestamp, from: Address, data: &[u8]) -> Result<()> {
        let envelope = Envelope::from_encoded(data)?;
        tracing::trace!(
            "recv {} from {} on hub {}",
            envelope.message.name(),
            from,
            envelope.hub
        );
        if envelope.hub == NODE_SCOPE {
            return self.handle_node_message(now, from, envelope.message);
        }
        let hub = envelope.hub;
        if !self.hubs.contains_key(&hub) {
            tracing::warn!(
                "{} from {} for unknown hub {}",
                envelope.message.name(),
                from,
                hub
            );
            return Ok(());
        }
        let message = envelope.message;
        self.with_hub(now, hub, |h, cx| {
            h.member.clear_tombstone(&from);
            if let Some(p) = h.member.peer_by_addr_mut(&from) {
                p.touch(now);
            }
            h.dispatch(cx, from, message)
        })
    }

    /// Fire every timer due at or before `now`. An error means the node lost its place in a
    /// ring and cannot recover on its own.
    pub fn handle_timers(&mut self, now: Timestamp) -> Result<()> {
        while let Some((handle, timer)) = self.scheduler.pop_expired(now) {
            match timer {
                Timer::Hub { hub, kind } => {
                    if self.hubs.contains_key(&hub) {
                        self.with_hub(now, hub, |h, cx| h.on_timer(cx, handle, kind))?;
                    }
                }
                Timer::BootstrapRequest => self.on_bootstrap_request(now)?,
                Timer::BootstrapHeartbeat => self.on_bootstrap_heartbeat(now)?,
            }
        }
        Ok(())
    }

    /// When [MercuryNode::handle_timers] next has work.
    pub fn next_deadline(&mut self) -> Option<Timestamp> {
        self.scheduler.next_deadline()
    }

    /// Next datagram to send.
    pub fn poll_outgoing(&mut self) -> Option<Outgoing> {
        self.outbox.pop_front()
    }

    /// Route a publication into `hub`.
    pub fn publish(&mut self, now: Timestamp, hub: HubId, event: Event) -> Result<()> {
        self.with_hub(now, hub, |h, cx| {
            if !h.member.is_joined() {
                return Err(Error::HubNotJoined(hub));
            }
            h.route(cx, None, Routed::Event(event), RoutingMode::Greedy, 0)
        })
    }

    /// Route a subscription into `hub`.
    pub fn subscribe(&mut self, now: Timestamp, hub: HubId, interest: Interest) -> Result<()> {
        self.with_hub(now, hub, |h, cx| {
            if !h.member.is_joined() {
                return Err(Error::HubNotJoined(hub));
            }
            h.route(cx, None, Routed::Interest(interest), RoutingMode::Greedy, 0)
        })
    }

    /// Leave `hub` for good, handing the range and stored state to the successor.
    pub fn leave(&mut self, now: Timestamp, hub: HubId) -> Result<()> {
        self.with_hub(now, hub, |h, cx| h.leave(cx))
    }

    /// Ask `candidate` to leave its position and rejoin owning `proposed`, a part of our range.
    pub fn initiate_leave_join(
        &mut self,
        now: Timestamp,
        hub: HubId,
        candidate: Address,
        proposed: NodeRange,
    ) -> Result<()> {
        self.with_hub(now, hub, |h, cx| {
            h.initiate_leave_join(cx, candidate, proposed)
        })
    }

    /// Offer part of our range to the neighbor on `side`.
    pub fn request_local_rebalance(&mut self, now: Timestamp, hub: HubId, side: Side) -> Result<()> {
        self.with_hub(now, hub, |h, cx| h.request_local_rebalance(cx, side))
    }

    /// Membership state of a hub.
    pub fn hub(&self, hub: HubId) -> Option<&MemberHub> {
        self.hubs.get(&hub).map(|h| &h.member)
    }

    /// Registered hub ids.
    pub fn hub_ids(&self) -> Vec<HubId> {
        self.hubs.keys().copied().collect()
    }

    /// Owned range in `hub`.
    pub fn range(&self, hub: HubId) -> Option<NodeRange> {
        self.hub(hub).and_then(|h| h.range())
    }

    /// Membership state in `hub`.
    pub fn status(&self, hub: HubId) -> Option<HubStatus> {
        self.hub(hub).map(|h| h.status())
    }

    /// Successor in `hub`.
    pub fn successor(&self, hub: HubId) -> Option<Address> {
        self.hub(hub).and_then(|h| h.successor()).map(|p| p.addr)
    }

    /// Predecessor in `hub`.
    pub fn predecessor(&self, hub: HubId) -> Option<Address> {
        self.hub(hub).and_then(|h| h.predecessor()).map(|p| p.addr)
    }

    /// Load balancing state in `hub`.
    pub fn rebalance_state(&self, hub: HubId) -> Option<RebalanceState> {
        self.hubs.get(&hub).map(|h| h.lb.state)
    }

    /// Number of interests and triggers stored in `hub`.
    pub fn stored_items(&self, hub: HubId) -> Option<(usize, usize)> {
        self.hubs
            .get(&hub)
            .map(|h| (h.store.interest_count(), h.store.trigger_count()))
    }

    /// The bootstrap server reported every member joined.
    pub fn all_joined(&self) -> bool {
        self.bootstrap
            .as_ref()
            .map(|b| b.all_joined)
            .unwrap_or(false)
    }

    fn with_hub<R>(
        &mut self,
        now: Timestamp,
        hub: HubId,
        f: impl FnOnce(&mut Hub, &mut Context<'_>) -> Result<R>,
    ) -> Result<R> {
        let Self {
            address,
            params,
            hubs,
            scheduler,
            outbox,
            app,
            metric,
            rng,
            ..
        } = self;
        let h = hubs.get_mut(&hub).ok_or(Error::UnknownHub(hub))?;
        let mut cx = Context {
            now,
            me: *address,
            params,
            app: &mut **app,
            metric: &**metric,
            rng,
            scheduler,
            outbox,
        };
        f(h, &mut cx)
    }

    /// Queue a message sent by the node itself rather than by a hub handler.
    fn send_envelope(&mut self, to: Address, hub: HubId, message: Message) -> Result<()> {
        tracing::trace!("send {} to {} on hub {}", message.name(), to, hub);
        let bytes = Envelope::new(hub, message).encode()?;
        self.outbox.push_back(Outgoing { to, bytes });
        Ok(())
    }
}
