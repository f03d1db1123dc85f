//! Leaving and load balancing.
//!
//! Two mechanisms move range boundaries:
//! - leave-join: a lightly loaded node L, away from a heavy node H, hands its range to its
//!   neighbors and rejoins owning part of H's range;
//! - local rebalance: H shifts the boundary it shares with an adjacent neighbor. The neighbor
//!   only answers with the new boundary; H shrinks and ships the state, and the neighbor grows
//!   when that state arrives. A lost message leaves a gap at worst, never a doubly owned slice.
//!
//! Both mark the nodes involved unstable for a while so that gap absorption does not undo the
//! move before every neighbor has seen it.

use std::collections::HashMap;
use std::time::Duration;

use super::Context;
use super::HandleMsg;
use super::Hub;
use super::HubTimer;
use crate::error::Error;
use crate::error::Result;
use crate::hub::HubStatus;
use crate::message::DenialReason;
use crate::message::LeaveCheckRequest;
use crate::message::LeaveCheckResponse;
use crate::message::LeaveJoinDenial;
use crate::message::LeaveJoinLBRequest;
use crate::message::LeaveNotification;
use crate::message::LinkBreak;
use crate::message::LinkBreakReason;
use crate::message::LocalLBRequest;
use crate::message::LocalLBResponse;
use crate::message::Message;
use crate::message::StateHandover;
use crate::peer::Address;
use crate::range::NodeRange;
use crate::range::Range;
use crate::scheduler::TimerHandle;
use crate::time::Timestamp;
use crate::value::Value;

/// Load balancing state of a hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RebalanceState {
    /// Idle.
    #[default]
    DoingNothing,
    /// Sent a local rebalance request, waiting for the neighbor.
    SentReqLocalNbr,
    /// Leaving to rejoin elsewhere.
    StartedLeaveJoin,
    /// Asked a remote node to leave-join next to us.
    WaitingForLeaveJoinResponse,
    /// Asked our successor whether we may leave.
    CheckingSucc,
    /// Granted a local rebalance, growing once the neighbor's state arrives.
    AwaitingLocalHandover,
}

/// Which neighbor a local rebalance talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The successor.
    Successor,
    /// The predecessor.
    Predecessor,
}

#[derive(Debug, Default)]
pub(crate) struct Rebalance {
    pub(crate) state: RebalanceState,
    timer: Option<TimerHandle>,
    /// The other party of the operation in progress.
    pub(crate) candidate: Option<Address>,
    proposed: Option<NodeRange>,
    peer_after: Option<NodeRange>,
    leave_point: Option<Value>,
    local_requests: HashMap<Address, Timestamp>,
}

impl Rebalance {
    pub(crate) fn reset(&mut self, cx: &mut Context<'_>) {
        cx.cancel(self.timer.take());
        self.state = RebalanceState::DoingNothing;
        self.candidate = None;
        self.proposed = None;
        self.peer_after = None;
        self.leave_point = None;
    }

    pub(crate) fn expire(&mut self, now: Timestamp, window: Duration) {
        self.local_requests
            .retain(|_, t| now.saturating_since(*t) <= window);
    }
}

/// Shift `v` clockwise by `d` on the ring.
fn advance(v: Value, d: u64, absmin: Value, absmax: Value) -> Value {
    let total = (absmax - absmin).get();
    let off = (v - absmin).get();
    Value(absmin.get() + (off + d % total) % total)
}

/// Shift `v` counter-clockwise by `d` on the ring.
fn retreat(v: Value, d: u64, absmin: Value, absmax: Value) -> Value {
    let total = (absmax - absmin).get();
    advance(v, total - d % total, absmin, absmax)
}

/// Midpoint of a possibly wrapped range.
fn midpoint(r: &NodeRange, absmin: Value, absmax: Value) -> Option<Value> {
    let span = r.span(absmin, absmax).get();
    if span < 2 {
        return None;
    }
    Some(advance(r.min, span / 2, absmin, absmax))
}

impl Hub {
    fn settle_period(&self, cx: &Context<'_>) -> Duration {
        cx.ms(cx.params.join_request_timeout)
    }

    pub(crate) fn finish_leave_join(&mut self, cx: &mut Context<'_>) {
        if self.lb.state == RebalanceState::WaitingForLeaveJoinResponse {
            tracing::info!("hub {} leave-join with {:?} done", self.id(), self.lb.candidate);
            self.lb.reset(cx);
        }
    }

    pub(crate) fn initiate_leave_join(
        &mut self,
        cx: &mut Context<'_>,
        candidate: Address,
        proposed: NodeRange,
    ) -> Result<()> {
        let id = self.id();
        let Some(my) = self.member.range().filter(|_| self.member.is_joined()) else {
            return Err(Error::HubNotJoined(id));
        };
        if self.lb.state != RebalanceState::DoingNothing {
            return Err(Error::RebalanceInProgress(id));
        }
        let proposed = Range::new(id, proposed.min, proposed.max);
        let shares_min = proposed.min == my.min && proposed.max != my.max && my.covers(proposed.max);
        let shares_max = proposed.max == my.max && proposed.min != my.min && my.covers(proposed.min);
        if !(shares_min || shares_max) || candidate == cx.me {
            return Err(Error::InvalidRebalanceProposal {
                proposed,
                owned: my,
            });
        }
        let load = cx.app.current_load(id);
        tracing::info!("hub {} asking {} to leave-join into {}", id, candidate, proposed);
        cx.send(
            candidate,
            id,
            Message::LeaveJoinLBRequest(LeaveJoinLBRequest { proposed, load }),
        )?;
        self.lb.state = RebalanceState::WaitingForLeaveJoinResponse;
        self.lb.candidate = Some(candidate);
        self.lb.proposed = Some(proposed);
        self.lb.timer = Some(cx.schedule(
            cx.ms(cx.params.leave_join_response_timeout),
            id,
            HubTimer::LeaveJoinResponse,
        ));
        Ok(())
    }

    pub(crate) fn on_leave_join_timeout(&mut self, handle: TimerHandle) {
        if self.lb.timer != Some(handle) {
            return;
        }
        self.lb.timer = None;
        if self.lb.state == RebalanceState::WaitingForLeaveJoinResponse {
            tracing::info!("hub {} leave-join with {:?} timed out", self.id(), self.lb.candidate);
            self.lb.state = RebalanceState::DoingNothing;
            self.lb.candidate = None;
            self.lb.proposed = None;
        }
    }

    fn deny(&mut self, cx: &mut Context<'_>, to: Address, reason: DenialReason) -> Result<()> {
        tracing::debug!("hub {} denying leave-join to {}: {:?}", self.id(), to, reason);
        cx.send(
            to,
            self.id(),
            Message::LeaveJoinDenial(LeaveJoinDenial { reason }),
        )
    }

    pub(crate) fn on_leave_check_timeout(
        &mut self,
        cx: &mut Context<'_>,
        handle: TimerHandle,
    ) -> Result<()> {
        if self.lb.timer != Some(handle) || self.lb.state != RebalanceState::CheckingSucc {
            return Ok(());
        }
        self.lb.timer = None;
        let heavy = self.lb.candidate;
        self.lb.reset(cx);
        match heavy {
            Some(h) => self.deny(cx, h, DenialReason::SuccessorRefused),
            None => Ok(()),
        }
    }

    /// Hand both halves of our range to the neighbors and rejoin next to the heavy node.
    fn start_leave_join(&mut self, cx: &mut Context<'_>) -> Result<()> {
        let id = self.id();
        let (absmin, absmax) = (self.member.absmin(), self.member.absmax());
        let (Some(my), Some(succ)) = (
            self.member.range(),
            self.member.successor().map(|s| s.info()),
        ) else {
            return Ok(());
        };
        let Some(mid) = midpoint(&my, absmin, absmax) else {
            if let Some(h) = self.lb.candidate {
                self.deny(cx, h, DenialReason::NotAllowed)?;
            }
            self.lb.reset(cx);
            return Ok(());
        };
        self.lb.state = RebalanceState::StartedLeaveJoin;
        self.lb.leave_point = Some(mid);

        let upper = Range::new(id, mid, my.max);
        let handover = self.store.handover_for(&upper, cx.now);
        let merged_range = self.member.normalize(Range::new(id, mid, succ.range.max));
        cx.send(
            succ.addr,
            id,
            Message::LeaveNotification(LeaveNotification {
                merged_range,
                handover,
            }),
        )?;
        let pred = self.member.predecessor().map(|p| p.addr);
        for p in self.member.peers().map(|p| p.addr).collect::<Vec<_>>() {
            if p != succ.addr && Some(p) != pred {
                cx.send(
                    p,
                    id,
                    Message::LinkBreak(LinkBreak {
                        reason: LinkBreakReason::Leaving,
                    }),
                )?;
            }
        }
        self.member.set_status(HubStatus::Leaving);
        tracing::info!("hub {} leaving {} to rejoin at {:?}", id, my, self.lb.candidate);
        cx.app.leave_begin(id);
        self.stop_timers(cx);
        cx.schedule(
            cx.ms(cx.params.peer_ping_interval),
            id,
            HubTimer::LeaveContinuation,
        );
        Ok(())
    }

    /// Second half of a leave-join: hand the lower half to the predecessor, then rejoin.
    pub(crate) fn on_leave_continuation(&mut self, cx: &mut Context<'_>) -> Result<()> {
        let id = self.id();
        if self.member.status() != HubStatus::Leaving {
            return Ok(());
        }
        let (Some(my), Some(mid)) = (self.member.range(), self.lb.leave_point) else {
            return Ok(());
        };
        if let Some(pred) = self.member.predecessor().map(|p| p.info()) {
            let lower = Range::new(id, my.min, mid);
            let handover = self.store.handover_for(&lower, cx.now);
            let merged_range = self.member.normalize(Range::new(id, pred.range.min, mid));
            cx.send(
                pred.addr,
                id,
                Message::LeaveNotification(LeaveNotification {
                    merged_range,
                    handover,
                }),
            )?;
        }
        cx.app.leave_end(id);

        let heavy = self.lb.candidate;
        let proposed = self.lb.proposed;
        self.member.clear_peers();
        self.store.clear();
        self.member.clear_range();
        self.member.set_status(HubStatus::NotJoined);
        self.begin_join(cx, heavy, None, proposed, true)?;
        self.lb.state = RebalanceState::StartedLeaveJoin;
        Ok(())
    }

    /// Leave the hub for good.
    pub(crate) fn leave(&mut self, cx: &mut Context<'_>) -> Result<()> {
        let id = self.id();
        let Some(my) = self.member.range().filter(|_| self.member.is_joined()) else {
            return Err(Error::HubNotJoined(id));
        };
        self.member.set_status(HubStatus::Leaving);
        cx.app.leave_begin(id);
        if let Some(succ) = self.member.successor().map(|s| s.info()) {
            let merged_range = self.member.normalize(Range::new(id, my.min, succ.range.max));
            let handover = self.store.handover_all(cx.now);
            cx.send(
                succ.addr,
                id,
                Message::LeaveNotification(LeaveNotification {
                    merged_range,
                    handover,
                }),
            )?;
            for p in self.member.peers().map(|p| p.addr).collect::<Vec<_>>() {
                if p != succ.addr {
                    cx.send(
                        p,
                        id,
                        Message::LinkBreak(LinkBreak {
                            reason: LinkBreakReason::Leaving,
                        }),
                    )?;
                }
            }
        }
        self.stop_timers(cx);
        self.lb.reset(cx);
        self.member.clear_peers();
        self.store.clear();
        self.member.clear_range();
        self.member.set_status(HubStatus::Left);
        tracing::info!("hub {} left, handed over {}", id, my);
        cx.app.leave_end(id);
        Ok(())
    }

    pub(crate) fn request_local_rebalance(&mut self, cx: &mut Context<'_>, side: Side) -> Result<()> {
        let id = self.id();
        let Some(range) = self.member.range().filter(|_| self.member.is_joined()) else {
            return Err(Error::HubNotJoined(id));
        };
        if self.lb.state != RebalanceState::DoingNothing {
            return Err(Error::RebalanceInProgress(id));
        }
        let neighbor = match side {
            Side::Successor => self.member.successor(),
            Side::Predecessor => self.member.predecessor(),
        }
        .map(|p| p.addr)
        .ok_or(Error::NoRebalanceNeighbor(id))?;
        let load = cx.app.current_load(id);
        tracing::debug!("hub {} offering load {} to {:?} {}", id, load, side, neighbor);
        cx.send(
            neighbor,
            id,
            Message::LocalLBRequest(LocalLBRequest { range, load }),
        )?;
        self.lb.state = RebalanceState::SentReqLocalNbr;
        self.lb.candidate = Some(neighbor);
        self.lb.timer = Some(cx.schedule(
            cx.ms(cx.params.join_request_timeout),
            id,
            HubTimer::LocalLbResponse,
        ));
        Ok(())
    }

    fn refuse_local(
        &self,
        cx: &mut Context<'_>,
        to: Address,
        my: NodeRange,
        why: &str,
    ) -> Result<()> {
        tracing::debug!("hub {} refusing local rebalance from {}: {}", self.id(), to, why);
        cx.send(
            to,
            self.id(),
            Message::LocalLBResponse(LocalLBResponse {
                assigned: None,
                peer_range: my,
            }),
        )
    }

    pub(crate) fn on_local_lb_timeout(&mut self, handle: TimerHandle) {
        if self.lb.timer != Some(handle) {
            return;
        }
        self.lb.timer = None;
        if self.lb.state == RebalanceState::SentReqLocalNbr {
            tracing::debug!("hub {} local rebalance timed out", self.id());
            self.lb.state = RebalanceState::DoingNothing;
            self.lb.candidate = None;
        }
    }

    pub(crate) fn on_local_handover_timeout(&mut self, handle: TimerHandle) {
        if self.lb.timer != Some(handle) {
            return;
        }
        self.lb.timer = None;
        if self.lb.state == RebalanceState::AwaitingLocalHandover {
            tracing::info!(
                "hub {} no state from {:?}, keeping {:?}",
                self.id(),
                self.lb.candidate,
                self.member.range()
            );
            self.lb.state = RebalanceState::DoingNothing;
            self.lb.candidate = None;
            self.lb.proposed = None;
            self.lb.peer_after = None;
        }
    }
}

impl HandleMsg<LeaveJoinLBRequest> for Hub {
    fn handle(&mut self, cx: &mut Context<'_>, from: Address, msg: LeaveJoinLBRequest) -> Result<()> {
        let id = self.id();
        if !self.member.is_joined() {
            return self.deny(cx, from, DenialReason::NotJoined);
        }
        if self.lb.state != RebalanceState::DoingNothing {
            return self.deny(cx, from, DenialReason::Busy);
        }
        if !cx.app.is_leave_join_ok(id) {
            return self.deny(cx, from, DenialReason::NotAllowed);
        }
        if self.is_unstable(cx.now) {
            return self.deny(cx, from, DenialReason::Unstable);
        }
        let (Some(succ), Some(pred)) = (
            self.member.successor().map(|p| p.addr),
            self.member.predecessor().map(|p| p.addr),
        ) else {
            return self.deny(cx, from, DenialReason::NoNeighbors);
        };
        if succ == from || pred == from {
            return self.deny(cx, from, DenialReason::Adjacent);
        }
        if succ == pred {
            return self.deny(cx, from, DenialReason::TooFewNodes);
        }
        tracing::info!(
            "hub {} considering leave-join into {} for {} (load {})",
            id,
            msg.proposed,
            from,
            msg.load
        );
        cx.send(succ, id, Message::LeaveCheckRequest(LeaveCheckRequest))?;
        self.lb.state = RebalanceState::CheckingSucc;
        self.lb.candidate = Some(from);
        self.lb.proposed = Some(msg.proposed);
        self.lb.timer = Some(cx.schedule(
            cx.ms(cx.params.join_request_timeout),
            id,
            HubTimer::LeaveCheck,
        ));
        Ok(())
    }
}

impl HandleMsg<LeaveJoinDenial> for Hub {
    fn handle(&mut self, cx: &mut Context<'_>, from: Address, msg: LeaveJoinDenial) -> Result<()> {
        if self.lb.state == RebalanceState::WaitingForLeaveJoinResponse
            && self.lb.candidate == Some(from)
        {
            tracing::info!("hub {} leave-join denied by {}: {:?}", self.id(), from, msg.reason);
            self.lb.reset(cx);
        }
        Ok(())
    }
}

impl HandleMsg<LeaveCheckRequest> for Hub {
    fn handle(&mut self, cx: &mut Context<'_>, from: Address, _msg: LeaveCheckRequest) -> Result<()> {
        let ok = self.member.is_joined()
            && self.lb.state == RebalanceState::DoingNothing
            && !self.is_unstable(cx.now);
        if ok {
            let period = self.settle_period(cx);
            self.mark_unstable(cx.now, period);
        }
        cx.send(
            from,
            self.id(),
            Message::LeaveCheckResponse(LeaveCheckResponse { ok }),
        )
    }
}

impl HandleMsg<LeaveCheckResponse> for Hub {
    fn handle(&mut self, cx: &mut Context<'_>, from: Address, msg: LeaveCheckResponse) -> Result<()> {
        if self.lb.state != RebalanceState::CheckingSucc
            || self.member.successor().map(|s| s.addr) != Some(from)
        {
            return Ok(());
        }
        cx.cancel(self.lb.timer.take());
        if !msg.ok {
            let heavy = self.lb.candidate;
            self.lb.reset(cx);
            if let Some(h) = heavy {
                self.deny(cx, h, DenialReason::SuccessorRefused)?;
            }
            return Ok(());
        }
        self.start_leave_join(cx)
    }
}

impl HandleMsg<LeaveNotification> for Hub {
    fn handle(&mut self, cx: &mut Context<'_>, from: Address, msg: LeaveNotification) -> Result<()> {
        let id = self.id();
        if !self.member.is_joined() {
            return Ok(());
        }
        let old = self.member.range();
        let new = self.member.normalize(msg.merged_range);
        self.member.set_range(new);
        tracing::info!("hub {} took over from leaving {}: {:?} -> {}", id, from, old, new);
        cx.app.range_expanded(id, old, new);
        self.store.absorb(msg.handover, cx.now);

        let old_head = self.member.successor().map(|s| s.addr);
        self.member.remove_peer(&from);
        self.member.tombstone(from, cx.now);
        let period = self.settle_period(cx);
        self.mark_unstable(cx.now, period);
        if old_head == Some(from) {
            self.notify_successor(cx)?;
        }
        Ok(())
    }
}

impl HandleMsg<LocalLBRequest> for Hub {
    fn handle(&mut self, cx: &mut Context<'_>, from: Address, msg: LocalLBRequest) -> Result<()> {
        let id = self.id();
        let (absmin, absmax) = (self.member.absmin(), self.member.absmax());
        let Some(my) = self.member.range().filter(|_| self.member.is_joined()) else {
            return Ok(());
        };
        if self.lb.state != RebalanceState::DoingNothing || self.is_unstable(cx.now) {
            return self.refuse_local(cx, from, my, "busy");
        }
        let window = cx.ms(cx.params.tcp_failure_timeout);
        if let Some(t) = self.lb.local_requests.get(&from) {
            if cx.now.saturating_since(*t) <= window {
                return self.refuse_local(cx, from, my, "duplicate");
            }
        }
        self.lb.local_requests.insert(from, cx.now);

        let is_succ = self.member.successor().map(|s| s.addr) == Some(from);
        let is_pred = self.member.predecessor().map(|p| p.addr) == Some(from);
        if !is_succ && !is_pred {
            return self.refuse_local(cx, from, my, "not adjacent");
        }
        let heavy = msg.load;
        let light = cx.app.current_load(id);
        if heavy <= 0.0 || light >= heavy || (light > 0.0 && heavy / light < cx.params.loadbal_delta)
        {
            return self.refuse_local(cx, from, my, "not imbalanced");
        }
        let frac = (heavy - light) / (2.0 * heavy);
        let span = msg.range.span(absmin, absmax).get();
        let shift = (span as f64 * frac) as u64;
        if shift == 0 || shift >= span {
            return self.refuse_local(cx, from, my, "nothing to move");
        }

        let h = msg.range;
        let (mine, theirs) = if is_succ {
            // They follow us: take their lower part.
            let b = advance(h.min, shift, absmin, absmax);
            (Range::new(id, my.min, b), Range::new(id, b, h.max))
        } else {
            // They precede us: take their upper part.
            let b = retreat(h.max, shift, absmin, absmax);
            (Range::new(id, b, my.max), Range::new(id, h.min, b))
        };
        let mine = self.member.normalize(mine);
        let theirs = self.member.normalize(theirs);
        tracing::info!(
            "hub {} granting {} a shrink to {}, growing to {} on handover",
            id,
            from,
            theirs,
            mine
        );
        // Outlives the requester's own timeout so a handover sent in time is still accepted.
        let window = cx.params.join_request_timeout.saturating_mul(2);
        self.lb.state = RebalanceState::AwaitingLocalHandover;
        self.lb.candidate = Some(from);
        self.lb.proposed = Some(mine);
        self.lb.peer_after = Some(theirs);
        self.lb.timer = Some(cx.schedule(cx.ms(window), id, HubTimer::LocalLbHandover));
        cx.send(
            from,
            id,
            Message::LocalLBResponse(LocalLBResponse {
                assigned: Some(theirs),
                peer_range: mine,
            }),
        )
    }
}

impl HandleMsg<LocalLBResponse> for Hub {
    fn handle(&mut self, cx: &mut Context<'_>, from: Address, msg: LocalLBResponse) -> Result<()> {
        let id = self.id();
        if self.lb.state != RebalanceState::SentReqLocalNbr || self.lb.candidate != Some(from) {
            return Ok(());
        }
        self.lb.reset(cx);
        self.member.update_peer_range(&from, msg.peer_range);
        let (Some(new), Some(old)) = (msg.assigned, self.member.range()) else {
            tracing::debug!("hub {} local rebalance refused by {}", id, from);
            return Ok(());
        };
        let new = self.member.normalize(new);
        let given = if new.min == old.min {
            Range::new(id, new.max, old.max)
        } else {
            Range::new(id, old.min, new.min)
        };
        let handover = self.store.handover_for(&given, cx.now);
        // The given slice keeps its state until expiry: if the handover is lost the gap comes
        // back to us.
        self.member.set_range(new);
        let period = self.settle_period(cx);
        self.mark_unstable(cx.now, period);
        tracing::info!("hub {} gave {} to {}", id, given, from);
        cx.app.range_contracted(id, old, new);
        cx.send(
            from,
            id,
            Message::StateHandover(StateHandover { handover }),
        )
    }
}

impl HandleMsg<StateHandover> for Hub {
    fn handle(&mut self, cx: &mut Context<'_>, from: Address, msg: StateHandover) -> Result<()> {
        let id = self.id();
        if self.lb.state == RebalanceState::AwaitingLocalHandover && self.lb.candidate == Some(from)
        {
            cx.cancel(self.lb.timer.take());
            if let (Some(old), Some(new)) = (self.member.range(), self.lb.proposed) {
                self.member.set_range(new);
                if let Some(theirs) = self.lb.peer_after {
                    self.member.update_peer_range(&from, theirs);
                }
                let period = self.settle_period(cx);
                self.mark_unstable(cx.now, period);
                tracing::info!("hub {} took load from {}: {} -> {}", id, from, old, new);
                cx.app.range_expanded(id, Some(old), new);
            }
            self.lb.reset(cx);
        }
        self.store.absorb(msg.handover, cx.now);
        Ok(())
    }
}
