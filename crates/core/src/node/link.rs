//! Liveness checking, long neighbors and link breaks.

use std::collections::HashMap;

use rand::Rng;

use super::Context;
use super::HandleMsg;
use super::Hub;
use super::HubTimer;
use crate::consts::LONG_NEIGHBOR_REPAIR_ATTEMPTS;
use crate::consts::MIN_LONG_NEIGHBOR_BITS;
use crate::consts::QUICK_PONG_SEQNO;
use crate::error::Error;
use crate::error::Result;
use crate::message::GetPred;
use crate::message::GetSuccessorList;
use crate::message::LinkBreak;
use crate::message::LinkBreakReason;
use crate::message::LivenessPing;
use crate::message::LivenessPong;
use crate::message::Message;
use crate::message::NeighborRequest;
use crate::message::NeighborResponse;
use crate::peer::Address;
use crate::peer::PeerInfo;
use crate::peer::PeerType;
use crate::scheduler::TimerHandle;

#[derive(Debug, Default)]
pub(crate) struct LinkState {
    /// Long-neighbor repair pass counter.
    pub(crate) epoch: u32,
    /// Outstanding long-neighbor requests by nonce.
    pending: HashMap<u32, TimerHandle>,
}

fn floor_log2(n: u64) -> u32 {
    if n == 0 {
        0
    } else {
        63 - n.leading_zeros()
    }
}

impl Hub {
    pub(crate) fn start_maintenance(&mut self, cx: &mut Context<'_>) {
        let id = self.id();
        let p = cx.params;
        cx.schedule(
            cx.ms(p.successor_maintenance_timeout),
            id,
            HubTimer::SuccessorMaintenance,
        );
        cx.schedule(cx.ms(p.peer_ping_interval), id, HubTimer::PingPeers);
        cx.schedule(
            cx.ms(p.long_neighbor_repair_interval),
            id,
            HubTimer::RepairLongNeighbors,
        );
    }

    /// Cancel every timer of this hub.
    pub(crate) fn stop_timers(&mut self, cx: &mut Context<'_>) {
        cx.cancel_hub_timers(self.id());
        self.links.pending.clear();
    }

    fn ping(&mut self, cx: &mut Context<'_>, addr: Address, role: PeerType) -> Result<()> {
        let range = self.member.range();
        let Some(peer) = self.member.peer_by_addr_mut(&addr) else {
            return Ok(());
        };
        let seqno = peer.register_sent_ping(cx.now);
        cx.send(
            addr,
            self.member.id(),
            Message::LivenessPing(LivenessPing { range, seqno, role }),
        )
    }

    pub(crate) fn on_successor_maintenance(&mut self, cx: &mut Context<'_>) -> Result<()> {
        let id = self.id();
        if !self.member.is_joined() {
            return Ok(());
        }
        cx.schedule(
            cx.ms(cx.params.successor_maintenance_timeout),
            id,
            HubTimer::SuccessorMaintenance,
        );
        for s in self.member.successor_list() {
            self.ping(cx, s.addr, PeerType::SUCCESSOR)?;
        }
        if let Some(head) = self.member.successor().map(|s| s.addr) {
            cx.send(head, id, Message::GetPred(GetPred))?;
            cx.send(head, id, Message::GetSuccessorList(GetSuccessorList))?;
        }
        Ok(())
    }

    pub(crate) fn on_ping_peers(&mut self, cx: &mut Context<'_>) -> Result<()> {
        let id = self.id();
        if !self.member.is_joined() {
            return Ok(());
        }
        cx.schedule(cx.ms(cx.params.peer_ping_interval), id, HubTimer::PingPeers);
        self.member
            .expire_tombstones(cx.now, cx.params.pong_timeout());
        self.store.expire(cx.now);
        self.join.expire(cx.now);
        self.lb.expire(cx.now, cx.ms(cx.params.tcp_failure_timeout));

        self.check_liveness(cx)?;
        for l in self.member.long_neighbors() {
            self.ping(cx, l.addr, PeerType::LONG_NEIGHBOR)?;
        }
        Ok(())
    }

    /// Drop peers that went silent. Losing the last successor while not owning the whole domain
    /// leaves the ring partitioned, which is fatal.
    fn check_liveness(&mut self, cx: &mut Context<'_>) -> Result<()> {
        let id = self.id();
        let now = cx.now;
        let timeout = cx.params.pong_timeout();
        let head = self.member.successor().map(|s| s.addr);
        let verdicts: Vec<_> = self
            .member
            .peers()
            .map(|p| {
                (
                    p.addr,
                    p.kind,
                    p.lost_pongs(now, timeout),
                    p.lost_pings(PeerType::SUCCESSOR, now, timeout),
                    p.lost_pings(PeerType::LONG_NEIGHBOR, now, timeout),
                )
            })
            .collect();

        let mut head_died = false;
        let mut lost_long = 0;
        for (addr, kind, lost_pongs, lost_succ_pings, lost_long_pings) in verdicts {
            if kind.contains(PeerType::SUCCESSOR) && lost_pongs {
                tracing::info!("hub {} successor {} timed out", id, addr);
                head_died |= head == Some(addr);
                self.member.tombstone(addr, now);
                self.member.remove_peer_type(&addr, PeerType::SUCCESSOR);
            }
            if kind.contains(PeerType::LONG_NEIGHBOR) && lost_pongs {
                tracing::debug!("hub {} long neighbor {} timed out", id, addr);
                self.member.tombstone(addr, now);
                self.member.remove_peer_type(&addr, PeerType::LONG_NEIGHBOR);
                lost_long += 1;
            }
            if kind.contains(PeerType::PREDECESSOR) && lost_succ_pings {
                tracing::info!("hub {} predecessor {} stopped pinging", id, addr);
                self.member.remove_peer_type(&addr, PeerType::PREDECESSOR);
            }
            if kind.contains(PeerType::REVERSE_LONG_NEIGHBOR) && lost_long_pings {
                self.member
                    .remove_peer_type(&addr, PeerType::REVERSE_LONG_NEIGHBOR);
            }
        }

        if head_died {
            if self.member.successor().is_none() && !self.member.owns_whole_ring() {
                tracing::error!("hub {} lost every successor", id);
                return Err(Error::AllSuccessorsDead(id));
            }
            self.notify_successor(cx)?;
        }
        for _ in 0..lost_long {
            self.repair_pointer(cx)?;
        }
        Ok(())
    }

    pub(crate) fn on_repair_long_neighbors(&mut self, cx: &mut Context<'_>) -> Result<()> {
        let id = self.id();
        if !self.member.is_joined() {
            return Ok(());
        }
        cx.schedule(
            cx.ms(cx.params.long_neighbor_repair_interval),
            id,
            HubTimer::RepairLongNeighbors,
        );
        let Some(n) = cx.metric.estimate_node_count(&self.member) else {
            return Ok(());
        };
        let k = floor_log2(n);
        if k < MIN_LONG_NEIGHBOR_BITS {
            return Ok(());
        }
        self.links.epoch = self.links.epoch.wrapping_add(1);
        for (_, h) in self.links.pending.drain() {
            cx.cancel(Some(h));
        }
        let epoch = self.links.epoch;
        tracing::debug!("hub {} long neighbor pass {}: {} pointers for ~{} nodes", id, epoch, k, n);
        cx.schedule(
            cx.ms(cx.params.kick_old_peers_timeout),
            id,
            HubTimer::KickOldPeers { epoch },
        );
        for _ in 0..k {
            self.repair_pointer(cx)?;
        }
        Ok(())
    }

    /// Look for one long neighbor at a harmonically distributed distance.
    fn repair_pointer(&mut self, cx: &mut Context<'_>) -> Result<()> {
        let id = self.id();
        let Some(my) = self.member.range() else {
            return Ok(());
        };
        let Some(n) = cx.metric.estimate_node_count(&self.member) else {
            return Ok(());
        };
        if n < 2 {
            return Ok(());
        }
        for _ in 0..LONG_NEIGHBOR_REPAIR_ATTEMPTS {
            let x: f64 = cx.rng.gen();
            let dist = (x * ((n - 1) as f64).ln()).exp().floor() as u64;
            if dist < 1 {
                continue;
            }
            let Some(target) = cx.metric.value_at_distance(&self.member, dist) else {
                continue;
            };
            if my.covers(target) {
                continue;
            }
            let Some(next) = self.compute_next_hop(target) else {
                continue;
            };
            let nonce: u32 = cx.rng.gen();
            cx.send(
                next,
                id,
                Message::NeighborRequest(NeighborRequest {
                    origin: cx.me,
                    target,
                    nonce,
                    epoch: self.links.epoch,
                    hop_count: 0,
                }),
            )?;
            let handle = cx.schedule(
                cx.ms(cx.params.long_neighbor_response_timeout),
                id,
                HubTimer::NeighborRequest { nonce },
            );
            self.links.pending.insert(nonce, handle);
            return Ok(());
        }
        Ok(())
    }

    pub(crate) fn on_neighbor_request_timeout(&mut self, nonce: u32, handle: TimerHandle) {
        if self.links.pending.get(&nonce) == Some(&handle) {
            self.links.pending.remove(&nonce);
            tracing::debug!("hub {} long neighbor request {} timed out", self.id(), nonce);
        }
    }

    /// Drop long neighbors found before pass `epoch` and reverse long neighbors that went
    /// silent.
    pub(crate) fn on_kick_old_peers(&mut self, cx: &mut Context<'_>, epoch: u32) -> Result<()> {
        let id = self.id();
        let now = cx.now;
        let timeout = cx.params.pong_timeout();
        let old: Vec<Address> = self
            .member
            .peers()
            .filter(|p| p.is_long_neighbor() && p.epoch < epoch)
            .map(|p| p.addr)
            .collect();
        for addr in old {
            if self
                .member
                .remove_peer_type(&addr, PeerType::LONG_NEIGHBOR)
                .is_some()
            {
                cx.send(
                    addr,
                    id,
                    Message::LinkBreak(LinkBreak {
                        reason: LinkBreakReason::LongNeighborReplaced,
                    }),
                )?;
            }
        }
        let silent: Vec<Address> = self
            .member
            .peers()
            .filter(|p| {
                p.is_reverse_long_neighbor() && p.lost_pings(PeerType::LONG_NEIGHBOR, now, timeout)
            })
            .map(|p| p.addr)
            .collect();
        for addr in silent {
            self.member
                .remove_peer_type(&addr, PeerType::REVERSE_LONG_NEIGHBOR);
        }
        Ok(())
    }
}

impl HandleMsg<LivenessPing> for Hub {
    fn handle(&mut self, cx: &mut Context<'_>, from: Address, msg: LivenessPing) -> Result<()> {
        let now = cx.now;
        if let Some(r) = msg.range {
            self.member.update_peer_range(&from, r);
        }
        let known = self.member.peer_by_addr(&from).map(|p| p.kind);
        if msg.role.contains(PeerType::SUCCESSOR) {
            let is_pred = known
                .map(|k| k.contains(PeerType::PREDECESSOR))
                .unwrap_or(false);
            if is_pred {
                if let Some(p) = self.member.peer_by_addr_mut(&from) {
                    p.record_ping(PeerType::SUCCESSOR, now);
                }
            } else if self.member.is_joined() && self.member.predecessor().is_some() {
                if let Some(range) = msg.range {
                    self.member
                        .add_predecessor(PeerInfo { addr: from, range }, now);
                }
            }
        }
        if msg.role.contains(PeerType::LONG_NEIGHBOR)
            && known
                .map(|k| k.contains(PeerType::REVERSE_LONG_NEIGHBOR))
                .unwrap_or(false)
        {
            if let Some(p) = self.member.peer_by_addr_mut(&from) {
                p.record_ping(PeerType::LONG_NEIGHBOR, now);
            }
        }
        cx.send(
            from,
            self.id(),
            Message::LivenessPong(LivenessPong {
                seqno: msg.seqno,
                range: self.member.range(),
                recv_time: now,
            }),
        )
    }
}

impl HandleMsg<LivenessPong> for Hub {
    fn handle(&mut self, cx: &mut Context<'_>, from: Address, msg: LivenessPong) -> Result<()> {
        if let Some(r) = msg.range {
            self.member.update_peer_range(&from, r);
        }
        if let Some(p) = self.member.peer_by_addr_mut(&from) {
            p.handle_liveness_pong(msg.seqno, None, cx.now);
        }
        Ok(())
    }
}

impl HandleMsg<NeighborRequest> for Hub {
    fn handle(&mut self, cx: &mut Context<'_>, from: Address, msg: NeighborRequest) -> Result<()> {
        let id = self.id();
        let Some(my) = self.member.range().filter(|_| self.member.is_joined()) else {
            return Ok(());
        };
        if my.covers(msg.target) {
            if msg.origin != cx.me {
                self.member.add_reverse_long_neighbor(msg.origin, cx.now);
            }
            return cx.send(
                msg.origin,
                id,
                Message::NeighborResponse(NeighborResponse {
                    range: my,
                    nonce: msg.nonce,
                    epoch: msg.epoch,
                }),
            );
        }
        // Let the previous hop refresh our range.
        cx.send(
            from,
            id,
            Message::LivenessPong(LivenessPong {
                seqno: QUICK_PONG_SEQNO,
                range: Some(my),
                recv_time: cx.now,
            }),
        )?;
        if msg.hop_count + 1 >= cx.params.max_message_ttl {
            tracing::warn!("dropping neighbor request of {}: ttl exceeded", msg.origin);
            return Ok(());
        }
        match self.compute_next_hop(msg.target) {
            Some(next) => cx.send(
                next,
                id,
                Message::NeighborRequest(NeighborRequest {
                    hop_count: msg.hop_count + 1,
                    ..msg
                }),
            ),
            None => Ok(()),
        }
    }
}

impl HandleMsg<NeighborResponse> for Hub {
    fn handle(&mut self, cx: &mut Context<'_>, from: Address, msg: NeighborResponse) -> Result<()> {
        if msg.epoch != self.links.epoch {
            return Ok(());
        }
        let Some(handle) = self.links.pending.remove(&msg.nonce) else {
            return Ok(());
        };
        cx.cancel(Some(handle));
        if from == cx.me || !self.member.is_joined() {
            return Ok(());
        }
        tracing::debug!("hub {} long neighbor {} owns {}", self.id(), from, msg.range);
        self.member.add_long_neighbor(
            PeerInfo {
                addr: from,
                range: msg.range,
            },
            msg.epoch,
            cx.now,
        );
        Ok(())
    }
}

impl HandleMsg<LinkBreak> for Hub {
    fn handle(&mut self, cx: &mut Context<'_>, from: Address, msg: LinkBreak) -> Result<()> {
        match msg.reason {
            LinkBreakReason::Leaving => {
                let was_head = self.member.successor().map(|s| s.addr) == Some(from);
                let was_long = self
                    .member
                    .peer_by_addr(&from)
                    .map(|p| p.is_long_neighbor())
                    .unwrap_or(false);
                self.member.remove_peer(&from);
                self.member.tombstone(from, cx.now);
                tracing::debug!("hub {} peer {} left", self.id(), from);
                if was_head {
                    self.notify_successor(cx)?;
                }
                if was_long {
                    self.repair_pointer(cx)?;
                }
                Ok(())
            }
            LinkBreakReason::LongNeighborReplaced => {
                self.member
                    .remove_peer_type(&from, PeerType::REVERSE_LONG_NEIGHBOR);
                Ok(())
            }
        }
    }
}
