//! Joining, splitting, and successor and predecessor maintenance.

use std::collections::HashMap;
use std::time::Duration;

use super::rebalance::RebalanceState;
use super::Context;
use super::HandleMsg;
use super::Hub;
use super::HubTimer;
use crate::bootstrap::StaticTopology;
use crate::consts::JOIN_BACKOFF_FACTOR;
use crate::error::Error;
use crate::error::Result;
use crate::hub::HubStatus;
use crate::message::GetPred;
use crate::message::GetSuccessorList;
use crate::message::JoinError;
use crate::message::JoinRequest;
use crate::message::JoinResponse;
use crate::message::Message;
use crate::message::NotifySuccessor;
use crate::message::Pred;
use crate::message::StateHandover;
use crate::message::SuccessorList;
use crate::peer::Address;
use crate::peer::PeerInfo;
use crate::peer::PeerType;
use crate::range::is_between_right_inclusive;
use crate::range::NodeRange;
use crate::range::Range;
use crate::scheduler::TimerHandle;
use crate::time::Timestamp;
use crate::value::Value;

/// Join progress of this node plus what it remembers about joins it served.
#[derive(Debug, Default)]
pub(crate) struct JoinState {
    timer: Option<TimerHandle>,
    attempts: u32,
    timeout: Duration,
    representative: Option<Address>,
    target: Option<Value>,
    requested: Option<NodeRange>,
    leave_join: bool,
    /// join_end fires once the successor lists us as its predecessor.
    end_pending: bool,
    /// A split is settling; other joiners are told to retry.
    pending_split: Option<(Address, Timestamp)>,
    /// Responses sent recently, resent verbatim when a joiner retries.
    responses: HashMap<Address, (Timestamp, JoinResponse)>,
}

impl JoinState {
    pub(crate) fn expire(&mut self, now: Timestamp) {
        self.responses.retain(|_, (until, _)| *until >= now);
        if matches!(self.pending_split, Some((_, until)) if until <= now) {
            self.pending_split = None;
        }
    }
}

impl Hub {
    pub(crate) fn begin_join(
        &mut self,
        cx: &mut Context<'_>,
        representative: Option<Address>,
        target: Option<Value>,
        requested: Option<NodeRange>,
        leave_join: bool,
    ) -> Result<()> {
        let id = self.id();
        match self.member.status() {
            HubStatus::Joining | HubStatus::Joined | HubStatus::Leaving => {
                return Err(Error::HubAlreadyJoined(id))
            }
            HubStatus::NotJoined | HubStatus::Left => {}
        }
        if !leave_join {
            if let Some(topology) = self.info.static_topology.clone() {
                return self.install_static(cx, topology);
            }
        }
        let Some(rep) = representative.filter(|r| *r != cx.me) else {
            return self.found_ring(cx);
        };
        self.join = JoinState {
            timeout: cx.ms(cx.params.join_request_timeout),
            representative: Some(rep),
            target,
            requested,
            leave_join,
            ..Default::default()
        };
        self.member.set_status(HubStatus::Joining);
        tracing::info!("hub {} joining through {}", id, rep);
        self.join.timer = Some(cx.schedule(Duration::ZERO, id, HubTimer::Join));
        Ok(())
    }

    fn found_ring(&mut self, cx: &mut Context<'_>) -> Result<()> {
        let id = self.id();
        let whole = self.member.whole_range();
        self.member.set_range(whole);
        self.member.set_status(HubStatus::Joined);
        tracing::info!("hub {} founded, owning {}", id, whole);
        cx.app.range_expanded(id, None, whole);
        self.start_maintenance(cx);
        cx.app.join_begin(id, cx.me);
        cx.app.join_end(id, cx.me);
        Ok(())
    }

    fn install_static(&mut self, cx: &mut Context<'_>, topology: StaticTopology) -> Result<()> {
        let id = self.id();
        let now = cx.now;
        self.member.set_range(topology.range);
        for s in topology
            .successors
            .iter()
            .filter(|s| s.addr != cx.me)
            .take(cx.params.n_successors_to_keep)
        {
            self.member.add_successor(*s, now);
        }
        for p in topology.predecessors.iter().filter(|p| p.addr != cx.me) {
            self.member.add_predecessor(*p, now);
        }
        self.member.set_status(HubStatus::Joined);
        let range = self
            .member
            .range()
            .unwrap_or_else(|| self.member.whole_range());
        tracing::info!("hub {} installed static range {}", id, range);
        cx.app.range_expanded(id, None, range);
        self.start_maintenance(cx);
        let succ = self.member.successor().map(|s| s.addr).unwrap_or(cx.me);
        cx.app.join_begin(id, succ);
        cx.app.join_end(id, succ);
        Ok(())
    }

    pub(crate) fn on_join_timer(&mut self, cx: &mut Context<'_>) -> Result<()> {
        let id = self.id();
        self.join.timer = None;
        if self.member.status() != HubStatus::Joining {
            return Ok(());
        }
        self.join.attempts += 1;
        if self.join.attempts > cx.params.max_join_attempts {
            tracing::warn!(
                "hub {} giving up after {} join attempts",
                id,
                cx.params.max_join_attempts
            );
            self.member.set_status(HubStatus::NotJoined);
            cx.app.join_failed(id, self.join.representative);
            return Ok(());
        }
        for p in self.member.predecessor_list() {
            self.member.remove_peer_type(&p.addr, PeerType::PREDECESSOR);
        }
        let Some(rep) = self.join.representative else {
            return Ok(());
        };
        tracing::debug!("hub {} join attempt {} via {}", id, self.join.attempts, rep);
        cx.send(
            rep,
            id,
            Message::JoinRequest(JoinRequest {
                joiner: cx.me,
                target: self.join.target,
                requested: self.join.requested,
                leave_join: self.join.leave_join,
                hop_count: 0,
            }),
        )?;
        let wait = self.join.timeout;
        self.join.timeout = wait.mul_f64(JOIN_BACKOFF_FACTOR);
        self.join.timer = Some(cx.schedule(wait, id, HubTimer::Join));
        Ok(())
    }

    /// Tell the successor about us and ask for its predecessor.
    pub(crate) fn notify_successor(&mut self, cx: &mut Context<'_>) -> Result<()> {
        let id = self.id();
        let (Some(range), Some(succ)) = (
            self.member.range(),
            self.member.successor().map(|s| s.addr),
        ) else {
            return Ok(());
        };
        cx.send(succ, id, Message::NotifySuccessor(NotifySuccessor { range }))?;
        cx.send(succ, id, Message::GetPred(GetPred))
    }

    fn forward_join(&mut self, cx: &mut Context<'_>, msg: JoinRequest, toward: Value) -> Result<()> {
        let id = self.id();
        if msg.hop_count + 1 >= cx.params.max_message_ttl {
            tracing::warn!("dropping join request of {}: ttl exceeded", msg.joiner);
            return Ok(());
        }
        match self.compute_next_hop(toward) {
            Some(next) => cx.send(
                next,
                id,
                Message::JoinRequest(JoinRequest {
                    hop_count: msg.hop_count + 1,
                    ..msg
                }),
            ),
            None => {
                tracing::debug!("no route toward {} for joiner {}", toward, msg.joiner);
                Ok(())
            }
        }
    }

    /// Split `my` at `target`, or at its midpoint. We keep the lower part, the joiner gets the
    /// upper part and becomes our successor.
    fn split(
        &mut self,
        cx: &mut Context<'_>,
        joiner: Address,
        my: NodeRange,
        target: Option<Value>,
    ) -> std::result::Result<JoinResponse, JoinError> {
        let id = self.id();
        let (absmin, absmax) = (self.member.absmin(), self.member.absmax());
        let split = match target {
            Some(t) if my.covers(t) && t != my.min => t,
            _ => {
                let span = my.span(absmin, absmax).get();
                if span < 2 {
                    return Err(JoinError::RangeTooSmall);
                }
                (my.min + Value(span / 2)).wrap(absmin, absmax)
            }
        };
        let kept = self.member.normalize(Range::new(id, my.min, split));
        let given = self.member.normalize(Range::new(id, split, my.max));

        let mut successors = self.member.successor_list();
        if successors.is_empty() {
            successors.push(PeerInfo {
                addr: cx.me,
                range: kept,
            });
        }
        successors.truncate(cx.params.n_successors_to_keep);

        let handover = self.store.handover_for(&given, cx.now);
        self.member.set_range(kept);
        self.store.purge_outside(&kept);
        self.member.add_successor(
            PeerInfo {
                addr: joiner,
                range: given,
            },
            cx.now,
        );
        tracing::info!(
            "hub {} split {} for {}: keeping {}, giving {}",
            id,
            my,
            joiner,
            kept,
            given
        );
        cx.app.range_contracted(id, my, kept);
        Ok(JoinResponse {
            error: None,
            assigned: Some(given),
            successors,
            predecessor: Some(PeerInfo {
                addr: cx.me,
                range: kept,
            }),
            handover,
        })
    }

    /// Hand `req`, agreed on in a leave-join, to the rejoining node.
    fn split_for_leave_join(
        &mut self,
        cx: &mut Context<'_>,
        joiner: Address,
        my: NodeRange,
        req: NodeRange,
    ) -> std::result::Result<JoinResponse, JoinError> {
        let id = self.id();
        let req = self.member.normalize(req);
        self.finish_leave_join(cx);

        if req.max == my.max && req.min != my.min && my.covers(req.min) {
            return self.split(cx, joiner, my, Some(req.min));
        }
        if !(req.min == my.min && req.max != my.max && my.covers(req.max)) {
            tracing::warn!(
                "requested range {} no longer fits {}, splitting at the midpoint",
                req,
                my
            );
            return self.split(cx, joiner, my, None);
        }

        // The joiner takes our lower part and becomes our predecessor.
        let kept = self.member.normalize(Range::new(id, req.max, my.max));
        let old_pred = self.member.predecessor().map(|p| p.info());
        let mut successors = vec![PeerInfo {
            addr: cx.me,
            range: kept,
        }];
        successors.extend(self.member.successor_list());
        successors.truncate(cx.params.n_successors_to_keep);

        let handover = self.store.handover_for(&req, cx.now);
        self.member.set_range(kept);
        self.store.purge_outside(&kept);
        self.member.add_predecessor(
            PeerInfo {
                addr: joiner,
                range: req,
            },
            cx.now,
        );
        tracing::info!(
            "hub {} gave {} to rejoining {}, keeping {}",
            id,
            req,
            joiner,
            kept
        );
        cx.app.range_contracted(id, my, kept);
        Ok(JoinResponse {
            error: None,
            assigned: Some(req),
            successors,
            predecessor: old_pred,
            handover,
        })
    }

    /// Take over the gap between us and the successor once it names us its predecessor.
    /// A slice the successor already claims is handed to it along with its state.
    fn absorb_gap(
        &mut self,
        cx: &mut Context<'_>,
        from: Address,
        my: NodeRange,
        succ: NodeRange,
    ) -> Result<()> {
        let id = self.id();
        let (absmin, absmax) = (self.member.absmin(), self.member.absmax());
        let new_max = if succ.min == absmin { absmax } else { succ.min };
        if new_max == my.max || new_max == my.min {
            return Ok(());
        }
        if self.lb.state != RebalanceState::DoingNothing || self.is_unstable(cx.now) {
            tracing::debug!("hub {} not absorbing up to {} while rebalancing", id, new_max);
            return Ok(());
        }
        let new = self.member.normalize(Range::new(id, my.min, new_max));
        self.member.set_range(new);
        if new.span(absmin, absmax) > my.span(absmin, absmax) {
            tracing::info!("hub {} absorbed gap: {} -> {}", id, my, new);
            cx.app.range_expanded(id, Some(my), new);
        } else {
            let given = self.member.normalize(Range::new(id, new_max, my.max));
            let handover = self.store.handover_for(&given, cx.now);
            self.store.purge_outside(&new);
            tracing::info!("hub {} gave up overlap {} to {}: {} -> {}", id, given, from, my, new);
            cx.app.range_contracted(id, my, new);
            if !handover.is_empty() {
                return cx.send(from, id, Message::StateHandover(StateHandover { handover }));
            }
        }
        Ok(())
    }
}

impl HandleMsg<JoinRequest> for Hub {
    fn handle(&mut self, cx: &mut Context<'_>, _from: Address, msg: JoinRequest) -> Result<()> {
        let id = self.id();
        let joiner = msg.joiner;
        let Some(my) = self.member.range().filter(|_| self.member.is_joined()) else {
            return cx.send(
                joiner,
                id,
                Message::JoinResponse(JoinResponse::error(JoinError::AmUnjoined)),
            );
        };

        if let Some((until, cached)) = self.join.responses.get(&joiner) {
            if cx.now <= *until {
                tracing::debug!("duplicate join request from {}, resending", joiner);
                let cached = cached.clone();
                return cx.send(joiner, id, Message::JoinResponse(cached));
            }
        }

        let toward = msg.requested.map(|r| r.min).or(msg.target);
        if let Some(v) = toward {
            if !my.covers(v) {
                return self.forward_join(cx, msg, v);
            }
        }

        if let Some((pending, until)) = self.join.pending_split {
            if cx.now < until {
                tracing::debug!("join of {} refused, split for {} in progress", joiner, pending);
                return cx.send(
                    joiner,
                    id,
                    Message::JoinResponse(JoinResponse::error(JoinError::Busy)),
                );
            }
        }

        let leave_join = msg.leave_join
            && self.lb.state == RebalanceState::WaitingForLeaveJoinResponse
            && self.lb.candidate == Some(joiner);
        let outcome = match msg.requested {
            Some(req) if leave_join => self.split_for_leave_join(cx, joiner, my, req),
            _ => self.split(cx, joiner, my, msg.target),
        };
        let response = match outcome {
            Ok(r) => {
                let until = cx.now + cx.ms(cx.params.tcp_failure_timeout);
                self.join.pending_split = Some((joiner, until));
                self.join.responses.insert(joiner, (until, r.clone()));
                r
            }
            Err(e) => {
                tracing::debug!("join of {} refused: {:?}", joiner, e);
                JoinResponse::error(e)
            }
        };
        cx.send(joiner, id, Message::JoinResponse(response))
    }
}

impl HandleMsg<JoinResponse> for Hub {
    fn handle(&mut self, cx: &mut Context<'_>, from: Address, msg: JoinResponse) -> Result<()> {
        let id = self.id();
        let now = cx.now;
        if self.member.status() != HubStatus::Joining || self.member.range().is_some() {
            tracing::debug!("hub {} ignoring join response from {}", id, from);
            return Ok(());
        }
        if let Some(e) = msg.error {
            tracing::debug!("hub {} join refused by {}: {:?}", id, from, e);
            return Ok(());
        }
        let Some(assigned) = msg.assigned else {
            return Ok(());
        };
        cx.cancel(self.join.timer.take());

        let range = self.member.normalize(assigned);
        self.member.set_range(range);
        cx.app.range_expanded(id, None, range);

        let mut successors = msg.successors.iter().copied().skip_while(|s| s.addr == cx.me);
        if let Some(head) = successors.next() {
            let rest: Vec<PeerInfo> = successors.collect();
            self.member.merge_successor_list(
                head,
                &rest,
                cx.params.n_successors_to_keep,
                now,
                cx.params.pong_timeout(),
            );
        }
        if let Some(p) = msg.predecessor.filter(|p| p.addr != cx.me) {
            self.member.add_predecessor(p, now);
        }
        self.store.absorb(msg.handover, now);
        self.member.set_status(HubStatus::Joined);
        self.lb.reset(cx);
        self.start_maintenance(cx);

        let succ = self.member.successor().map(|s| s.addr).unwrap_or(from);
        tracing::info!("hub {} joined owning {}, successor {}", id, range, succ);
        cx.app.join_begin(id, succ);
        self.join.end_pending = true;
        self.notify_successor(cx)
    }
}

impl HandleMsg<NotifySuccessor> for Hub {
    fn handle(&mut self, cx: &mut Context<'_>, from: Address, msg: NotifySuccessor) -> Result<()> {
        if !self.member.is_joined() {
            return Ok(());
        }
        let info = PeerInfo {
            addr: from,
            range: msg.range,
        };
        let had_successor = self.member.successor().is_some();
        self.member.add_predecessor(info, cx.now);
        if !had_successor {
            tracing::debug!("hub {} takes {} as first successor", self.id(), from);
            self.member.add_successor(info, cx.now);
        }
        Ok(())
    }
}

impl HandleMsg<GetPred> for Hub {
    fn handle(&mut self, cx: &mut Context<'_>, from: Address, _msg: GetPred) -> Result<()> {
        let Some(range) = self.member.range().filter(|_| self.member.is_joined()) else {
            return Ok(());
        };
        let predecessor = self.member.predecessor().map(|p| p.info());
        cx.send(from, self.id(), Message::Pred(Pred { range, predecessor }))
    }
}

impl HandleMsg<Pred> for Hub {
    fn handle(&mut self, cx: &mut Context<'_>, from: Address, msg: Pred) -> Result<()> {
        let id = self.id();
        self.member.update_peer_range(&from, msg.range);
        let Some(my) = self.member.range().filter(|_| self.member.is_joined()) else {
            return Ok(());
        };
        if self.member.successor().map(|s| s.addr) != Some(from) {
            return Ok(());
        }

        let pred_is_me = msg.predecessor.map(|p| p.addr == cx.me).unwrap_or(false);
        if pred_is_me && self.join.end_pending {
            self.join.end_pending = false;
            tracing::info!("hub {} join complete", id);
            cx.app.join_end(id, from);
        }
        if pred_is_me && matches!(self.join.pending_split, Some((j, _)) if j == from) {
            self.join.pending_split = None;
        }

        match msg.predecessor {
            None => cx.send(from, id, Message::NotifySuccessor(NotifySuccessor { range: my })),
            Some(_) if pred_is_me => self.absorb_gap(cx, from, my, msg.range),
            Some(p) => {
                let closer = is_between_right_inclusive(p.range.min, my.min, msg.range.min)
                    && p.addr != from
                    && !self
                        .member
                        .is_tombstoned(&p.addr, cx.now, cx.params.pong_timeout());
                if closer {
                    tracing::debug!("hub {} adopting {} as successor", id, p.addr);
                    self.member.add_successor(p, cx.now);
                    cx.send(p.addr, id, Message::NotifySuccessor(NotifySuccessor { range: my }))
                } else {
                    cx.send(from, id, Message::NotifySuccessor(NotifySuccessor { range: my }))
                }
            }
        }
    }
}

impl HandleMsg<GetSuccessorList> for Hub {
    fn handle(&mut self, cx: &mut Context<'_>, from: Address, _msg: GetSuccessorList) -> Result<()> {
        let Some(range) = self.member.range().filter(|_| self.member.is_joined()) else {
            return Ok(());
        };
        if self.member.predecessor().map(|p| p.addr) != Some(from) {
            return Ok(());
        }
        let mut entries = vec![PeerInfo {
            addr: cx.me,
            range,
        }];
        entries.extend(self.member.successor_list());
        entries.truncate(cx.params.n_successors_to_keep);
        cx.send(
            from,
            self.id(),
            Message::SuccessorList(SuccessorList { range, entries }),
        )
    }
}

impl HandleMsg<SuccessorList> for Hub {
    fn handle(&mut self, cx: &mut Context<'_>, from: Address, msg: SuccessorList) -> Result<()> {
        self.member.update_peer_range(&from, msg.range);
        if !self.member.is_joined() || self.member.successor().map(|s| s.addr) != Some(from) {
            return Ok(());
        }
        self.member.merge_successor_list(
            PeerInfo {
                addr: from,
                range: msg.range,
            },
            &msg.entries,
            cx.params.n_successors_to_keep,
            cx.now,
            cx.params.pong_timeout(),
        );
        Ok(())
    }
}
