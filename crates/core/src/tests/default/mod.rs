//! A deterministic in-memory network driving several [MercuryNode]s on one simulated clock.

use std::cell::Ref;
use std::cell::RefMut;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::rc::Rc;

use bytes::Bytes;

use crate::app::Application;
use crate::app::EventProcessType;
use crate::bootstrap::HubInitInfo;
use crate::error::Error;
use crate::message::Decoder;
use crate::message::Envelope;
use crate::message::HubId;
use crate::message::Message;
use crate::metric::MetricSource;
use crate::params::Parameters;
use crate::peer::Address;
use crate::pubsub::Event;
use crate::pubsub::Interest;
use crate::range::NodeRange;
use crate::range::Range;
use crate::time::Timestamp;
use crate::value::Value;
use crate::MercuryNode;

mod test_failure;
mod test_join;
mod test_rebalance;
mod test_routing;

pub const HUB: HubId = 0;
pub const ABSMIN: u64 = 0;
pub const ABSMAX: u64 = 1000;
/// One way delay of every simulated datagram.
pub const LATENCY_MS: u64 = 5;

pub fn addr(port: u16) -> Address {
    format!("127.0.0.1:{}", port).parse().unwrap()
}

pub fn hub_info() -> HubInitInfo {
    HubInitInfo::new(HUB, "attr", ABSMIN, ABSMAX)
}

pub fn range(min: u64, max: u64) -> NodeRange {
    Range::new(HUB, min, max)
}

/// What the application saw.
#[derive(Debug, Default)]
pub struct Record {
    pub join_begin: usize,
    pub join_end: usize,
    pub join_failed: usize,
    pub leave_begin: usize,
    pub leave_end: usize,
    pub received: Vec<Event>,
    pub load: f64,
    pub refuse_leave_join: bool,
    pub store_publications: bool,
}

pub struct RecordingApp {
    record: Rc<RefCell<Record>>,
}

impl Application for RecordingApp {
    fn join_begin(&mut self, _hub: HubId, _successor: Address) {
        self.record.borrow_mut().join_begin += 1;
    }

    fn join_end(&mut self, _hub: HubId, _successor: Address) {
        self.record.borrow_mut().join_end += 1;
    }

    fn join_failed(&mut self, _hub: HubId, _representative: Option<Address>) {
        self.record.borrow_mut().join_failed += 1;
    }

    fn leave_begin(&mut self, _hub: HubId) {
        self.record.borrow_mut().leave_begin += 1;
    }

    fn leave_end(&mut self, _hub: HubId) {
        self.record.borrow_mut().leave_end += 1;
    }

    fn publication_received(&mut self, _hub: HubId, event: &Event) {
        self.record.borrow_mut().received.push(event.clone());
    }

    fn event_at_rendezvous(
        &mut self,
        _hub: HubId,
        _event: &Event,
        _last_hop: Option<Address>,
        _hop_count: u32,
    ) -> EventProcessType {
        if self.record.borrow().store_publications {
            EventProcessType::MatchAndStore
        } else {
            EventProcessType::Match
        }
    }

    fn is_leave_join_ok(&mut self, _hub: HubId) -> bool {
        !self.record.borrow().refuse_leave_join
    }

    fn current_load(&mut self, _hub: HubId) -> f64 {
        self.record.borrow().load
    }
}

pub struct SimNode {
    pub node: MercuryNode,
    pub record: Rc<RefCell<Record>>,
}

struct InFlight {
    at: Timestamp,
    from: Address,
    to: Address,
    bytes: Bytes,
}

/// A datagram taken off the wire.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub from: Address,
    pub to: Address,
    pub bytes: Bytes,
}

type HoldFilter = Box<dyn FnMut(Address, Address, &Message) -> bool>;

pub struct SimNet {
    pub now: Timestamp,
    pub params: Parameters,
    nodes: BTreeMap<Address, SimNode>,
    in_flight: VecDeque<InFlight>,
    pub errors: Vec<(Address, Error)>,
    pub dropped: usize,
    hold: Option<HoldFilter>,
    held: Vec<Datagram>,
}

impl SimNet {
    pub fn new() -> Self {
        Self::with_params(Parameters::default())
    }

    pub fn with_params(params: Parameters) -> Self {
        Self {
            now: Timestamp::ZERO,
            params,
            nodes: BTreeMap::new(),
            in_flight: VecDeque::new(),
            errors: vec![],
            dropped: 0,
            hold: None,
            held: vec![],
        }
    }

    fn build(&self, port: u16, customize: impl FnOnce(MercuryNode) -> MercuryNode) -> SimNode {
        let record = Rc::new(RefCell::new(Record::default()));
        let app = RecordingApp {
            record: record.clone(),
        };
        let node = MercuryNode::new(addr(port), self.params.clone(), app)
            .unwrap()
            .with_rng_seed(port as u64);
        let mut node = customize(node);
        node.add_hub(hub_info()).unwrap();
        SimNode { node, record }
    }

    /// Add a node and join the hub through `representative`, splitting at `target`.
    pub fn join(&mut self, port: u16, representative: Option<u16>, target: Option<u64>) -> Address {
        let sim = self.build(port, |n| n);
        self.insert_and_join(sim, representative, target)
    }

    /// Like [SimNet::join] with a custom population estimate.
    pub fn join_with_metric(
        &mut self,
        port: u16,
        representative: Option<u16>,
        target: Option<u64>,
        metric: impl MetricSource + 'static,
    ) -> Address {
        let sim = self.build(port, move |n| n.with_metric_source(metric));
        self.insert_and_join(sim, representative, target)
    }

    fn insert_and_join(
        &mut self,
        mut sim: SimNode,
        representative: Option<u16>,
        target: Option<u64>,
    ) -> Address {
        let a = sim.node.address();
        sim.node
            .join_hub(self.now, HUB, representative.map(addr), target.map(Value))
            .unwrap();
        self.nodes.insert(a, sim);
        a
    }

    /// Found a ring with the first port, then join the others one by one at their targets.
    pub fn ring(&mut self, founder: u16, joiners: &[(u16, u64)]) -> Vec<Address> {
        let mut all = vec![self.join(founder, None, None)];
        for (port, target) in joiners {
            all.push(self.join(*port, Some(founder), Some(*target)));
            self.run_for(5_000);
        }
        all
    }

    /// Remove a node without it saying goodbye.
    pub fn kill(&mut self, a: Address) {
        self.nodes.remove(&a);
    }

    pub fn node(&self, a: Address) -> &MercuryNode {
        &self.nodes[&a].node
    }

    pub fn record(&self, a: Address) -> Ref<'_, Record> {
        self.nodes[&a].record.borrow()
    }

    pub fn record_mut(&self, a: Address) -> RefMut<'_, Record> {
        self.nodes[&a].record.borrow_mut()
    }

    /// Call into a node at the current simulated time.
    pub fn with_node<R>(&mut self, a: Address, f: impl FnOnce(&mut MercuryNode, Timestamp) -> R) -> R {
        let now = self.now;
        let sim = self.nodes.get_mut(&a).unwrap();
        f(&mut sim.node, now)
    }

    pub fn publish(&mut self, a: Address, nonce: u64, min: u64, max: u64) {
        let event = Event {
            nonce,
            creator: a,
            constraint: range(min, max),
            lifetime: 60_000,
            payload: Bytes::from_static(b"ev"),
        };
        self.with_node(a, |n, now| n.publish(now, HUB, event)).unwrap();
    }

    pub fn subscribe(&mut self, a: Address, nonce: u64, min: u64, max: u64) {
        let interest = Interest {
            nonce,
            subscriber: a,
            constraint: range(min, max),
            lifetime: 600_000,
        };
        self.with_node(a, |n, now| n.subscribe(now, HUB, interest))
            .unwrap();
    }

    /// Keep datagrams matching `f` off the wire until [SimNet::take_held].
    pub fn hold_where(&mut self, f: impl FnMut(Address, Address, &Message) -> bool + 'static) {
        self.hold = Some(Box::new(f));
    }

    /// Stop holding and hand out what was held.
    pub fn take_held(&mut self) -> Vec<Datagram> {
        self.hold = None;
        std::mem::take(&mut self.held)
    }

    /// Put a datagram on the wire now.
    pub fn inject(&mut self, d: &Datagram) {
        self.in_flight.push_back(InFlight {
            at: self.now + std::time::Duration::from_millis(LATENCY_MS),
            from: d.from,
            to: d.to,
            bytes: d.bytes.clone(),
        });
    }

    fn collect_outgoing(&mut self) {
        let at = self.now + std::time::Duration::from_millis(LATENCY_MS);
        for (from, sim) in self.nodes.iter_mut() {
            while let Some(out) = sim.node.poll_outgoing() {
                if let Some(f) = self.hold.as_mut() {
                    let keep = Envelope::from_encoded(&out.bytes)
                        .map(|e| f(*from, out.to, &e.message))
                        .unwrap_or(false);
                    if keep {
                        self.held.push(Datagram {
                            from: *from,
                            to: out.to,
                            bytes: out.bytes,
                        });
                        continue;
                    }
                }
                self.in_flight.push_back(InFlight {
                    at,
                    from: *from,
                    to: out.to,
                    bytes: out.bytes,
                });
            }
        }
    }

    fn step(&mut self, t: Timestamp) {
        self.now = t;
        while self.in_flight.front().map(|m| m.at <= t).unwrap_or(false) {
            let Some(m) = self.in_flight.pop_front() else {
                break;
            };
            match self.nodes.get_mut(&m.to) {
                Some(sim) => {
                    if let Err(e) = sim.node.handle_message(t, m.from, &m.bytes) {
                        self.errors.push((m.to, e));
                    }
                }
                None => self.dropped += 1,
            }
        }
        for (a, sim) in self.nodes.iter_mut() {
            if let Err(e) = sim.node.handle_timers(t) {
                self.errors.push((*a, e));
            }
        }
    }

    pub fn run_for(&mut self, ms: u64) {
        let end = self.now + std::time::Duration::from_millis(ms);
        loop {
            self.collect_outgoing();
            let next_msg = self.in_flight.front().map(|m| m.at);
            let next_timer = self
                .nodes
                .values_mut()
                .filter_map(|s| s.node.next_deadline())
                .min();
            match next_msg.into_iter().chain(next_timer).min() {
                Some(t) if t <= end => self.step(t.max(self.now)),
                _ => break,
            }
        }
        self.now = end;
    }

    /// Joined nodes and their ranges, lowest first.
    pub fn ranges(&self) -> Vec<(Address, NodeRange)> {
        let mut v: Vec<_> = self
            .nodes
            .iter()
            .filter_map(|(a, s)| {
                let h = s.node.hub(HUB)?;
                h.is_joined().then_some(())?;
                h.range().map(|r| (*a, r))
            })
            .collect();
        v.sort_by_key(|(_, r)| r.min);
        v
    }

    /// Joined nodes' ranges tile the domain exactly once.
    pub fn assert_partition(&self) {
        let ranges = self.ranges();
        assert!(!ranges.is_empty(), "no joined node");
        let wrap = |v: Value| if v == Value(ABSMAX) { Value(ABSMIN) } else { v };
        let total: u64 = ranges
            .iter()
            .map(|(_, r)| r.span(Value(ABSMIN), Value(ABSMAX)).get())
            .sum();
        assert_eq!(total, ABSMAX - ABSMIN, "ranges {:?} do not tile the domain", ranges);
        for (i, (a, r)) in ranges.iter().enumerate() {
            let (b, next) = &ranges[(i + 1) % ranges.len()];
            assert_eq!(
                wrap(r.max),
                wrap(next.min),
                "{} {} is not followed by {} {}",
                a,
                r,
                b,
                next
            );
        }
    }
}
