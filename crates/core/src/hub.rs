#![warn(missing_docs)]
//! Membership state of one ring: owned range, peer table, successor, predecessor and long-neighbor
//! lists.
//!
//! Peers live in an arena indexed by [PeerId]. The successor, predecessor and long-neighbor lists hold
//! ids, a peer is freed once it plays no role anymore.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;

use crate::bootstrap::HubInitInfo;
use crate::message::HubId;
use crate::peer::Address;
use crate::peer::Peer;
use crate::peer::PeerId;
use crate::peer::PeerInfo;
use crate::peer::PeerType;
use crate::range::is_between_inclusive;
use crate::range::is_between_left_inclusive;
use crate::range::Constraint;
use crate::range::NodeRange;
use crate::range::Range;
use crate::time::Timestamp;
use crate::value::Value;

/// Membership state of this node in a hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubStatus {
    /// Not a member, no join in progress.
    NotJoined,
    /// Join request sent, waiting for a response.
    Joining,
    /// Owning a range.
    Joined,
    /// Handing the range over.
    Leaving,
    /// Left the ring.
    Left,
}

/// Order predecessors closest first, counter-clockwise from `myself`.
fn predecessor_order(myself: Value, a: Value, b: Value) -> Ordering {
    if a == myself && b == myself {
        return Ordering::Equal;
    }
    if a == myself {
        return Ordering::Greater;
    }
    if b == myself {
        return Ordering::Less;
    }
    if (a <= myself && b <= myself) || (a >= myself && b >= myself) {
        return b.cmp(&a);
    }
    if a <= myself {
        Ordering::Less
    } else {
        Ordering::Greater
    }
}

/// Order successors closest first, clockwise from `myself`.
fn successor_order(myself: Value, a: Value, b: Value) -> Ordering {
    if (a <= myself && b <= myself) || (a >= myself && b >= myself) {
        return a.cmp(&b);
    }
    if a <= myself {
        Ordering::Greater
    } else {
        Ordering::Less
    }
}

/// One ring this node takes part in.
#[derive(Debug)]
pub struct MemberHub {
    id: HubId,
    name: String,
    absmin: Value,
    absmax: Value,
    me: Address,
    range: Option<NodeRange>,
    status: HubStatus,
    peers: Vec<Option<Peer>>,
    free: Vec<u32>,
    by_addr: HashMap<Address, PeerId>,
    successors: Vec<PeerId>,
    predecessors: Vec<PeerId>,
    long_neighbors: Vec<PeerId>,
    tombstones: HashMap<Address, Timestamp>,
}

impl MemberHub {
    /// Create the hub described by `info`, not joined yet.
    pub fn new(info: &HubInitInfo, me: Address) -> Self {
        Self {
            id: info.id,
            name: info.name.clone(),
            absmin: info.absmin,
            absmax: info.absmax,
            me,
            range: None,
            status: HubStatus::NotJoined,
            peers: vec![],
            free: vec![],
            by_addr: HashMap::new(),
            successors: vec![],
            predecessors: vec![],
            long_neighbors: vec![],
            tombstones: HashMap::new(),
        }
    }

    /// Hub id.
    pub fn id(&self) -> HubId {
        self.id
    }

    /// Hub name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lower end of the domain.
    pub fn absmin(&self) -> Value {
        self.absmin
    }

    /// Upper end of the domain.
    pub fn absmax(&self) -> Value {
        self.absmax
    }

    /// Size of the domain.
    pub fn domain_size(&self) -> Value {
        self.absmax - self.absmin
    }

    /// Address of this node.
    pub fn address(&self) -> Address {
        self.me
    }

    /// The whole domain as a node range.
    pub fn whole_range(&self) -> NodeRange {
        Range::new(self.id, self.absmin, self.absmax)
    }

    /// Owned range.
    pub fn range(&self) -> Option<NodeRange> {
        self.range
    }

    /// Membership state.
    pub fn status(&self) -> HubStatus {
        self.status
    }

    /// Set the membership state.
    pub fn set_status(&mut self, status: HubStatus) {
        if self.status != status {
            tracing::debug!("hub {} status {:?} -> {:?}", self.id, self.status, status);
        }
        self.status = status;
    }

    /// Joined and owning a range.
    pub fn is_joined(&self) -> bool {
        self.status == HubStatus::Joined && self.range.is_some()
    }

    /// Bring a range to canonical form: a range starting at `absmax` starts at `absmin`, a range
    /// ending at `absmin` ends at `absmax`, an empty wrap is the whole domain.
    pub fn normalize(&self, r: NodeRange) -> NodeRange {
        let mut r = Range::new(self.id, r.min, r.max);
        if r.min == self.absmax {
            r.min = self.absmin;
        }
        if r.max == self.absmin {
            r.max = self.absmax;
        }
        if r.min == r.max {
            return self.whole_range();
        }
        r
    }

    /// Install a new owned range, returning the previous one.
    pub fn set_range(&mut self, r: NodeRange) -> Option<NodeRange> {
        let r = self.normalize(r);
        tracing::debug!("hub {} range {:?} -> {}", self.id, self.range, r);
        self.range.replace(r)
    }

    /// Forget the owned range.
    pub fn clear_range(&mut self) -> Option<NodeRange> {
        self.range.take()
    }

    /// The owned range is the whole domain.
    pub fn owns_whole_ring(&self) -> bool {
        self.range
            .map(|r| r.span(self.absmin, self.absmax) == self.domain_size())
            .unwrap_or(false)
    }

    /// The owned range ends at the domain maximum.
    pub fn am_rightmost(&self) -> bool {
        self.range.map(|r| r.max == self.absmax).unwrap_or(false)
    }

    /// Ordering used by nearest-peer lookups. The domain maximum belongs to the owner of the wrap.
    pub fn less(&self, val: Value, other: Value) -> bool {
        if val == self.absmax {
            val <= other
        } else {
            val < other
        }
    }

    /// Peer by id.
    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(id.0 as usize).and_then(|p| p.as_ref())
    }

    /// Peer by id, mutable.
    pub fn peer_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(id.0 as usize).and_then(|p| p.as_mut())
    }

    /// Id of the peer at `addr`.
    pub fn lookup(&self, addr: &Address) -> Option<PeerId> {
        self.by_addr.get(addr).copied()
    }

    /// Peer at `addr`.
    pub fn peer_by_addr(&self, addr: &Address) -> Option<&Peer> {
        self.lookup(addr).and_then(|id| self.peer(id))
    }

    /// Peer at `addr`, mutable.
    pub fn peer_by_addr_mut(&mut self, addr: &Address) -> Option<&mut Peer> {
        let id = self.lookup(addr)?;
        self.peer_mut(id)
    }

    /// All known peers.
    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter().filter_map(|p| p.as_ref())
    }

    /// Number of known peers.
    pub fn peer_count(&self) -> usize {
        self.by_addr.len()
    }

    /// Ids of all known peers.
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.by_addr.values().copied().collect()
    }

    /// Refresh the range of a known peer.
    pub fn update_peer_range(&mut self, addr: &Address, range: NodeRange) {
        let range = self.normalize(range);
        if let Some(p) = self.peer_by_addr_mut(addr) {
            p.range = range;
        }
        self.resort();
    }

    fn upsert(&mut self, info: PeerInfo, now: Timestamp) -> PeerId {
        let range = self.normalize(info.range);
        if let Some(id) = self.lookup(&info.addr) {
            if let Some(p) = self.peer_mut(id) {
                p.range = range;
            }
            return id;
        }
        self.alloc(Peer::new(info.addr, range, now))
    }

    fn alloc(&mut self, peer: Peer) -> PeerId {
        let addr = peer.addr;
        let id = match self.free.pop() {
            Some(i) => {
                self.peers[i as usize] = Some(peer);
                PeerId(i)
            }
            None => {
                self.peers.push(Some(peer));
                PeerId((self.peers.len() - 1) as u32)
            }
        };
        self.by_addr.insert(addr, id);
        id
    }

    fn add_type(&mut self, id: PeerId, kind: PeerType, now: Timestamp) {
        if let Some(p) = self.peer_mut(id) {
            p.add_type(kind, now);
        }
    }

    /// Clear roles of a peer, freeing it when none is left. Returns the peer if it was freed.
    pub fn remove_peer_type(&mut self, addr: &Address, kind: PeerType) -> Option<Peer> {
        let id = self.lookup(addr)?;
        if kind.intersects(PeerType::SUCCESSOR) {
            self.successors.retain(|p| *p != id);
        }
        if kind.intersects(PeerType::PREDECESSOR) {
            self.predecessors.retain(|p| *p != id);
        }
        if kind.intersects(PeerType::LONG_NEIGHBOR) {
            self.long_neighbors.retain(|p| *p != id);
        }
        let empty = match self.peer_mut(id) {
            Some(p) => {
                p.kind.remove(kind);
                p.kind.is_empty()
            }
            None => false,
        };
        if !empty {
            return None;
        }
        self.by_addr.remove(addr);
        self.free.push(id.0);
        self.peers.get_mut(id.0 as usize).and_then(|p| p.take())
    }

    /// Drop a peer in every role.
    pub fn remove_peer(&mut self, addr: &Address) -> Option<Peer> {
        let all = PeerType::SUCCESSOR
            | PeerType::PREDECESSOR
            | PeerType::LONG_NEIGHBOR
            | PeerType::REVERSE_LONG_NEIGHBOR;
        self.remove_peer_type(addr, all)
    }

    /// Forget every peer.
    pub fn clear_peers(&mut self) {
        self.peers.clear();
        self.free.clear();
        self.by_addr.clear();
        self.successors.clear();
        self.predecessors.clear();
        self.long_neighbors.clear();
    }

    /// Remember that `addr` was found dead, so gossip does not bring it back right away.
    pub fn tombstone(&mut self, addr: Address, now: Timestamp) {
        self.tombstones.insert(addr, now);
    }

    /// `addr` was found dead less than `window` ago.
    pub fn is_tombstoned(&self, addr: &Address, now: Timestamp, window: Duration) -> bool {
        self.tombstones
            .get(addr)
            .map(|t| now.saturating_since(*t) <= window)
            .unwrap_or(false)
    }

    /// Forget tombstones older than `window`.
    pub fn expire_tombstones(&mut self, now: Timestamp, window: Duration) {
        self.tombstones
            .retain(|_, t| now.saturating_since(*t) <= window);
    }

    fn my_min(&self) -> Value {
        self.range.map(|r| r.min).unwrap_or(self.absmin)
    }

    fn resort(&mut self) {
        let myself = self.my_min();
        let mins: HashMap<PeerId, Value> = self
            .by_addr
            .values()
            .filter_map(|id| self.peer(*id).map(|p| (*id, p.range.min)))
            .collect();
        let key = |id: &PeerId| mins.get(id).copied().unwrap_or(myself);
        self.successors
            .sort_by(|a, b| successor_order(myself, key(a), key(b)));
        self.predecessors
            .sort_by(|a, b| predecessor_order(myself, key(a), key(b)));
    }

    /// Current successor.
    pub fn successor(&self) -> Option<&Peer> {
        self.successors.first().and_then(|id| self.peer(*id))
    }

    /// Successor list, nearest first.
    pub fn successor_list(&self) -> Vec<PeerInfo> {
        self.successors
            .iter()
            .filter_map(|id| self.peer(*id).map(|p| p.info()))
            .collect()
    }

    /// Add a successor. The list is kept ordered clockwise from our range.
    pub fn add_successor(&mut self, info: PeerInfo, now: Timestamp) -> PeerId {
        let id = self.upsert(info, now);
        self.add_type(id, PeerType::SUCCESSOR, now);
        if !self.successors.contains(&id) {
            self.successors.push(id);
        }
        self.resort();
        id
    }

    /// Replace the successor list with `head` followed by `head`'s own list. The list stops at
    /// this node, skips tombstoned peers and keeps at most `keep` entries. Peers falling off lose
    /// their successor role.
    pub fn merge_successor_list(
        &mut self,
        head: PeerInfo,
        entries: &[PeerInfo],
        keep: usize,
        now: Timestamp,
        tombstone_window: Duration,
    ) {
        let mut wanted: Vec<PeerInfo> = vec![head];
        for e in entries {
            if wanted.len() >= keep || e.addr == self.me {
                break;
            }
            if wanted.iter().any(|w| w.addr == e.addr)
                || self.is_tombstoned(&e.addr, now, tombstone_window)
            {
                continue;
            }
            wanted.push(*e);
        }
        let stale: Vec<Address> = self
            .successor_list()
            .into_iter()
            .map(|p| p.addr)
            .filter(|a| !wanted.iter().any(|w| w.addr == *a))
            .collect();
        for a in stale {
            self.remove_peer_type(&a, PeerType::SUCCESSOR);
        }
        for w in wanted {
            self.add_successor(w, now);
        }
    }

    /// Current predecessor.
    pub fn predecessor(&self) -> Option<&Peer> {
        self.predecessors.first().and_then(|id| self.peer(*id))
    }

    /// Predecessor list, nearest first.
    pub fn predecessor_list(&self) -> Vec<PeerInfo> {
        self.predecessors
            .iter()
            .filter_map(|id| self.peer(*id).map(|p| p.info()))
            .collect()
    }

    /// Add a predecessor. The list is kept ordered counter-clockwise from our range, the head is the
    /// predecessor.
    pub fn add_predecessor(&mut self, info: PeerInfo, now: Timestamp) -> PeerId {
        let id = self.upsert(info, now);
        self.add_type(id, PeerType::PREDECESSOR, now);
        if !self.predecessors.contains(&id) {
            self.predecessors.push(id);
        }
        self.resort();
        id
    }

    /// Long neighbors.
    pub fn long_neighbors(&self) -> Vec<PeerInfo> {
        self.long_neighbors
            .iter()
            .filter_map(|id| self.peer(*id).map(|p| p.info()))
            .collect()
    }

    /// Add a long neighbor found in repair pass `epoch`.
    pub fn add_long_neighbor(&mut self, info: PeerInfo, epoch: u32, now: Timestamp) -> PeerId {
        let id = self.upsert(info, now);
        self.add_type(id, PeerType::LONG_NEIGHBOR, now);
        if let Some(p) = self.peer_mut(id) {
            p.epoch = epoch;
        }
        if !self.long_neighbors.contains(&id) {
            self.long_neighbors.push(id);
        }
        id
    }

    /// Record a node that keeps us as its long neighbor. Its range is unknown, a peer first seen
    /// this way gets a placeholder range and is never routed through until it plays another role.
    pub fn add_reverse_long_neighbor(&mut self, addr: Address, now: Timestamp) -> PeerId {
        let id = match self.lookup(&addr) {
            Some(id) => id,
            None => self.alloc(Peer::new(addr, Range::point(self.id, self.absmin), now)),
        };
        self.add_type(id, PeerType::REVERSE_LONG_NEIGHBOR, now);
        id
    }

    /// Forget that `addr` was found dead.
    pub fn clear_tombstone(&mut self, addr: &Address) {
        self.tombstones.remove(addr);
    }

    /// Known peers that can be routed through, by ascending range minimum. Peers sharing a minimum
    /// appear once, successors first, then long neighbors, then predecessors.
    pub fn sorted_peers(&self) -> Vec<PeerId> {
        let mut out: Vec<(Value, PeerId)> = vec![];
        let candidates = self
            .successors
            .iter()
            .chain(self.long_neighbors.iter())
            .chain(self.predecessors.iter());
        for id in candidates {
            if let Some(p) = self.peer(*id) {
                if !out.iter().any(|(v, _)| *v == p.range.min) {
                    out.push((p.range.min, *id));
                }
            }
        }
        out.sort_by_key(|(v, _)| *v);
        out.into_iter().map(|(_, id)| id).collect()
    }

    /// The known peer making the most progress toward `val` without passing it. At a boundary the
    /// peer whose range starts at `val` wins.
    pub fn nearest_peer(&self, val: Value) -> Option<PeerId> {
        let sorted = self.sorted_peers();
        let first = *sorted.first()?;
        for (i, id) in sorted.iter().enumerate() {
            let cur = self.peer(*id)?.range;
            match sorted.get(i + 1) {
                Some(nid) => {
                    let next = self.peer(*nid)?.range;
                    let comp = if next.is_wrapped() {
                        self.absmax
                    } else {
                        next.max
                    };
                    if val >= cur.max && self.less(val, comp) {
                        return Some(if val < next.min { *id } else { *nid });
                    }
                }
                None => {
                    if val >= cur.max {
                        return Some(*id);
                    }
                    let head = self.peer(first)?.range;
                    return Some(if val >= head.min { first } else { *id });
                }
            }
        }
        None
    }

    /// Known peers whose ranges intersect `cst`, in clockwise order from `cst.min`.
    pub fn covering_peers(&self, cst: &Constraint) -> Vec<PeerId> {
        if cst.min == cst.max {
            return vec![];
        }
        let mut found: Vec<(Value, PeerId)> = self
            .sorted_peers()
            .into_iter()
            .filter_map(|id| {
                let r = self.peer(id)?.range;
                let holds_start = is_between_left_inclusive(cst.min, r.min, r.max);
                if is_between_inclusive(r.min, cst.min, cst.max) || holds_start {
                    let key = if holds_start {
                        Value(0)
                    } else {
                        cst.min.distance_to(r.min, self.absmin, self.absmax)
                    };
                    Some((key, id))
                } else {
                    None
                }
            })
            .collect();
        found.sort_by_key(|(k, _)| *k);
        found.into_iter().map(|(_, id)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> Address {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn info(port: u16, min: u64, max: u64) -> PeerInfo {
        PeerInfo {
            addr: addr(port),
            range: Range::new(0, min, max),
        }
    }

    fn hub(min: u64, max: u64) -> MemberHub {
        let mut h = MemberHub::new(&HubInitInfo::new(0, "x", 0, 1000), addr(1));
        h.set_range(Range::new(0, min, max));
        h.set_status(HubStatus::Joined);
        h
    }

    #[test]
    fn test_normalize() {
        let h = hub(0, 250);
        assert_eq!(h.normalize(Range::new(0, 500, 0)), Range::new(0, 500, 1000));
        assert_eq!(h.normalize(Range::new(0, 875, 875)), h.whole_range());
        assert_eq!(h.normalize(Range::new(0, 1000, 250)), Range::new(0, 0, 250));
        assert_eq!(h.normalize(Range::new(0, 875, 250)), Range::new(0, 875, 250));
    }

    #[test]
    fn test_predecessors_closest_first() {
        let mut h = hub(500, 1000);
        let now = Timestamp::ZERO;
        h.add_predecessor(info(2, 0, 500), now);
        h.add_predecessor(info(3, 250, 500), now);
        assert_eq!(h.predecessor().map(|p| p.addr), Some(addr(3)));
        h.remove_peer_type(&addr(3), PeerType::PREDECESSOR);
        assert_eq!(h.predecessor().map(|p| p.addr), Some(addr(2)));
    }

    #[test]
    fn test_predecessors_across_wrap() {
        let mut h = hub(100, 300);
        let now = Timestamp::ZERO;
        h.add_predecessor(info(2, 900, 950), now);
        h.add_predecessor(info(3, 950, 100), now);
        h.add_predecessor(info(4, 50, 100), now);
        let order: Vec<_> = h.predecessor_list().iter().map(|p| p.addr).collect();
        assert_eq!(order, vec![addr(4), addr(3), addr(2)]);
    }

    #[test]
    fn test_successors_clockwise() {
        let mut h = hub(875, 250);
        let now = Timestamp::ZERO;
        h.add_successor(info(2, 500, 875), now);
        h.add_successor(info(3, 250, 500), now);
        let order: Vec<_> = h.successor_list().iter().map(|p| p.addr).collect();
        assert_eq!(order, vec![addr(3), addr(2)]);
    }

    #[test]
    fn test_merge_successor_list_stops_at_self_and_skips_dead() {
        let mut h = hub(0, 250);
        let now = Timestamp::ZERO;
        h.add_successor(info(9, 600, 700), now);
        h.tombstone(addr(4), now);
        h.merge_successor_list(
            info(2, 250, 500),
            &[info(4, 500, 600), info(3, 500, 1000), info(1, 0, 250), info(5, 0, 0)],
            10,
            now,
            Duration::from_secs(45),
        );
        let order: Vec<_> = h.successor_list().iter().map(|p| p.addr).collect();
        assert_eq!(order, vec![addr(2), addr(3)]);
        assert!(h.lookup(&addr(9)).is_none());
    }

    #[test]
    fn test_peer_freed_when_last_role_removed() {
        let mut h = hub(0, 500);
        let now = Timestamp::ZERO;
        h.add_successor(info(2, 500, 1000), now);
        h.add_predecessor(info(2, 500, 1000), now);
        assert!(h.remove_peer_type(&addr(2), PeerType::SUCCESSOR).is_none());
        assert_eq!(h.peer_count(), 1);
        assert!(h.remove_peer_type(&addr(2), PeerType::PREDECESSOR).is_some());
        assert_eq!(h.peer_count(), 0);
        // slot is reused
        let id = h.add_successor(info(3, 500, 1000), now);
        assert_eq!(id, PeerId(0));
    }

    #[test]
    fn test_nearest_peer() {
        let mut h = hub(0, 250);
        let now = Timestamp::ZERO;
        h.add_successor(info(2, 250, 500), now);
        h.add_successor(info(3, 500, 1000), now);
        h.add_predecessor(info(3, 500, 1000), now);
        let near = |h: &MemberHub, v: u64| {
            h.nearest_peer(Value(v))
                .and_then(|id| h.peer(id))
                .map(|p| p.addr)
        };
        assert_eq!(near(&h, 300), Some(addr(2)));
        assert_eq!(near(&h, 500), Some(addr(3)));
        assert_eq!(near(&h, 999), Some(addr(3)));
        assert_eq!(near(&h, 1000), Some(addr(3)));
    }

    #[test]
    fn test_nearest_peer_makes_progress_without_passing() {
        let mut h = hub(0, 100);
        let now = Timestamp::ZERO;
        h.add_successor(info(2, 100, 200), now);
        h.add_long_neighbor(info(3, 400, 500), 1, now);
        h.add_long_neighbor(info(4, 800, 900), 1, now);
        let near = |v: u64| {
            h.nearest_peer(Value(v))
                .and_then(|id| h.peer(id))
                .map(|p| p.addr)
        };
        assert_eq!(near(450), Some(addr(3)));
        assert_eq!(near(650), Some(addr(3)));
        assert_eq!(near(300), Some(addr(2)));
        assert_eq!(near(950), Some(addr(4)));
    }

    #[test]
    fn test_covering_peers_in_clockwise_order() {
        let mut h = hub(0, 250);
        let now = Timestamp::ZERO;
        h.add_successor(info(2, 250, 500), now);
        h.add_successor(info(3, 500, 1000), now);
        h.add_predecessor(info(3, 500, 1000), now);
        let got: Vec<_> = h
            .covering_peers(&Range::new(0, 100, 700))
            .into_iter()
            .filter_map(|id| h.peer(id).map(|p| p.addr))
            .collect();
        assert_eq!(got, vec![addr(2), addr(3)]);
        assert!(h.covering_peers(&Range::new(0, 100, 200)).is_empty());
    }

    #[test]
    fn test_tombstones_expire() {
        let mut h = hub(0, 250);
        let window = Duration::from_secs(45);
        h.tombstone(addr(2), Timestamp::ZERO);
        assert!(h.is_tombstoned(&addr(2), Timestamp::from_millis(45_000), window));
        assert!(!h.is_tombstoned(&addr(2), Timestamp::from_millis(45_001), window));
        h.expire_tombstones(Timestamp::from_millis(45_001), window);
        assert!(h.tombstones.is_empty());
    }
}
