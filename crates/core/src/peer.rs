#![warn(missing_docs)]
//! Per-neighbor liveness and role bookkeeping.
//!
//! Liveness predicates ([Peer::lost_pongs], [Peer::lost_pings]) never mutate. Removing a dead peer
//! and repairing around it is up to the hub.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::ops::BitOr;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::consts::MAX_RTT_SAMPLES;
use crate::range::NodeRange;
use crate::time::Timestamp;

/// Network address of a node.
pub type Address = SocketAddr;

/// Index of a peer in the peer table of one hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub(crate) u32);

/// Set of roles a peer plays for us. Roles are not exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PeerType(u8);

impl PeerType {
    /// No role.
    pub const NONE: PeerType = PeerType(0);
    /// The peer follows us on the ring.
    pub const SUCCESSOR: PeerType = PeerType(1);
    /// The peer precedes us on the ring.
    pub const PREDECESSOR: PeerType = PeerType(2);
    /// We hold a shortcut pointer to the peer.
    pub const LONG_NEIGHBOR: PeerType = PeerType(4);
    /// The peer holds a shortcut pointer to us.
    pub const REVERSE_LONG_NEIGHBOR: PeerType = PeerType(8);

    /// All roles in `other` are set.
    pub fn contains(self, other: PeerType) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    /// Any role in `other` is set.
    pub fn intersects(self, other: PeerType) -> bool {
        self.0 & other.0 != 0
    }

    /// Set roles.
    pub fn insert(&mut self, other: PeerType) {
        self.0 |= other.0;
    }

    /// Clear roles.
    pub fn remove(&mut self, other: PeerType) {
        self.0 &= !other.0;
    }

    /// No role left.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for PeerType {
    type Output = PeerType;

    fn bitor(self, rhs: PeerType) -> PeerType {
        PeerType(self.0 | rhs.0)
    }
}

impl fmt::Display for PeerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (PeerType::SUCCESSOR, "succ"),
            (PeerType::PREDECESSOR, "pred"),
            (PeerType::LONG_NEIGHBOR, "long"),
            (PeerType::REVERSE_LONG_NEIGHBOR, "revlong"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(t, _)| self.contains(*t))
            .map(|(_, n)| *n)
            .collect();
        write!(f, "{{{}}}", set.join("|"))
    }
}

/// What other nodes learn about a peer: where it is and what it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Address of the peer.
    pub addr: Address,
    /// Last known owned range.
    pub range: NodeRange,
}

/// A neighbor relationship.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Address of the peer.
    pub addr: Address,
    /// Last known owned range, refreshed by any range-bearing message.
    pub range: NodeRange,
    /// Roles played.
    pub kind: PeerType,
    /// Repair epoch in which this peer became a long neighbor.
    pub epoch: u32,
    last_heard: Timestamp,
    last_ping_as_successor: Timestamp,
    last_ping_as_long: Timestamp,
    next_seqno: u32,
    outstanding: VecDeque<(u32, Timestamp)>,
    rtt_samples: VecDeque<Duration>,
}

impl Peer {
    /// Create a peer first heard of at `now`.
    pub fn new(addr: Address, range: NodeRange, now: Timestamp) -> Self {
        Self {
            addr,
            range,
            kind: PeerType::NONE,
            epoch: 0,
            last_heard: now,
            last_ping_as_successor: now,
            last_ping_as_long: now,
            next_seqno: 0,
            outstanding: VecDeque::new(),
            rtt_samples: VecDeque::with_capacity(MAX_RTT_SAMPLES),
        }
    }

    /// Describe the peer for the wire.
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            addr: self.addr,
            range: self.range,
        }
    }

    /// Union a role in. Roles that rely on the peer pinging us restart their liveness clock.
    pub fn add_type(&mut self, kind: PeerType, now: Timestamp) {
        if kind.contains(PeerType::PREDECESSOR) && !self.kind.contains(PeerType::PREDECESSOR) {
            self.last_ping_as_successor = now;
        }
        if kind.contains(PeerType::REVERSE_LONG_NEIGHBOR)
            && !self.kind.contains(PeerType::REVERSE_LONG_NEIGHBOR)
        {
            self.last_ping_as_long = now;
        }
        if kind.intersects(PeerType::SUCCESSOR | PeerType::LONG_NEIGHBOR)
            && !self.kind.intersects(PeerType::SUCCESSOR | PeerType::LONG_NEIGHBOR)
        {
            self.last_heard = now;
        }
        self.kind.insert(kind);
    }

    /// Any message from the peer.
    pub fn touch(&mut self, now: Timestamp) {
        self.last_heard = now;
    }

    /// The peer pinged us in the roles `role`, the roles it believes we play for it.
    pub fn record_ping(&mut self, role: PeerType, now: Timestamp) {
        if role.intersects(PeerType::SUCCESSOR) {
            self.last_ping_as_successor = now;
        }
        if role.intersects(PeerType::LONG_NEIGHBOR) {
            self.last_ping_as_long = now;
        }
        self.last_heard = now;
    }

    /// Allocate the sequence number of an outgoing ping.
    pub fn register_sent_ping(&mut self, now: Timestamp) -> u32 {
        self.next_seqno = self.next_seqno.wrapping_add(1);
        if self.next_seqno == crate::consts::QUICK_PONG_SEQNO {
            self.next_seqno = self.next_seqno.wrapping_add(1);
        }
        if self.outstanding.len() >= MAX_RTT_SAMPLES {
            self.outstanding.pop_front();
        }
        self.outstanding.push_back((self.next_seqno, now));
        self.next_seqno
    }

    /// Account a pong: sample the RTT if it answers an outstanding ping and absorb the gossiped
    /// range.
    pub fn handle_liveness_pong(&mut self, seqno: u32, range: Option<NodeRange>, now: Timestamp) {
        if let Some(pos) = self.outstanding.iter().position(|(s, _)| *s == seqno) {
            let (_, sent) = self.outstanding.remove(pos).unwrap_or((seqno, now));
            if self.rtt_samples.len() >= MAX_RTT_SAMPLES {
                self.rtt_samples.pop_front();
            }
            self.rtt_samples.push_back(now.saturating_since(sent));
        }
        if let Some(r) = range {
            self.range = r;
        }
        self.last_heard = now;
    }

    /// Mean of the retained RTT samples.
    pub fn rtt(&self) -> Option<Duration> {
        if self.rtt_samples.is_empty() {
            return None;
        }
        let total: Duration = self.rtt_samples.iter().sum();
        Some(total / self.rtt_samples.len() as u32)
    }

    /// Number of retained RTT samples.
    pub fn rtt_sample_count(&self) -> usize {
        self.rtt_samples.len()
    }

    /// Nothing heard from the peer within `timeout`.
    pub fn lost_pongs(&self, now: Timestamp, timeout: Duration) -> bool {
        now.saturating_since(self.last_heard) > timeout
    }

    /// The peer stopped pinging us in role `role` for longer than `timeout`.
    pub fn lost_pings(&self, role: PeerType, now: Timestamp, timeout: Duration) -> bool {
        let last = if role.intersects(PeerType::SUCCESSOR) {
            self.last_ping_as_successor
        } else {
            self.last_ping_as_long
        };
        now.saturating_since(last) > timeout
    }

    /// True when the peer is a successor.
    pub fn is_successor(&self) -> bool {
        self.kind.contains(PeerType::SUCCESSOR)
    }

    /// True when the peer is a predecessor.
    pub fn is_predecessor(&self) -> bool {
        self.kind.contains(PeerType::PREDECESSOR)
    }

    /// True when the peer is a long neighbor.
    pub fn is_long_neighbor(&self) -> bool {
        self.kind.contains(PeerType::LONG_NEIGHBOR)
    }

    /// True when the peer is a reverse long neighbor.
    pub fn is_reverse_long_neighbor(&self) -> bool {
        self.kind.contains(PeerType::REVERSE_LONG_NEIGHBOR)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.addr, self.range, self.kind)
    }
}
