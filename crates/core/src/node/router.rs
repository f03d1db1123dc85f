//! Range routing of publications and subscriptions.
//!
//! A message travels greedily towards the owner of its constraint's lower end, using long
//! neighbors. Once there it switches to linear mode and either walks the successor chain or fans
//! out to every known peer covering the rest of the constraint.

use super::Context;
use super::HandleMsg;
use super::Hub;
use crate::app::Application;
use crate::consts::LOOPING_MESSAGE_MARGIN;
use crate::error::Result;
use crate::message::HubId;
use crate::message::LinearPublication;
use crate::message::LinearSubscription;
use crate::message::MatchedPublication;
use crate::message::Message;
use crate::message::Publication;
use crate::message::RoutingMode;
use crate::message::Subscription;
use crate::peer::Address;
use crate::pubsub::Event;
use crate::pubsub::Interest;
use crate::range::Constraint;
use crate::range::Range;
use crate::range::RouteDirections;
use crate::value::Value;

/// What is being routed.
#[derive(Debug, Clone)]
pub(crate) enum Routed {
    Event(Event),
    Interest(Interest),
}

impl Routed {
    fn constraint(&self) -> Constraint {
        match self {
            Routed::Event(e) => e.constraint,
            Routed::Interest(i) => i.constraint,
        }
    }

    fn set_constraint(&mut self, cst: Constraint) {
        match self {
            Routed::Event(e) => e.constraint = cst,
            Routed::Interest(i) => i.constraint = cst,
        }
    }

    fn greedy(&self, mode: RoutingMode, hop_count: u32) -> Message {
        match self {
            Routed::Event(e) => Message::Publication(Publication {
                event: e.clone(),
                mode,
                hop_count,
            }),
            Routed::Interest(i) => Message::Subscription(Subscription {
                interest: i.clone(),
                mode,
                hop_count,
            }),
        }
    }

    fn linear(&self, stop: Value, hop_count: u32) -> Message {
        match self {
            Routed::Event(e) => Message::LinearPublication(LinearPublication {
                event: e.clone(),
                stop,
                hop_count,
            }),
            Routed::Interest(i) => Message::LinearSubscription(LinearSubscription {
                interest: i.clone(),
                stop,
                hop_count,
            }),
        }
    }

    fn app_route(&self, app: &mut dyn Application, hub: HubId, last_hop: Option<Address>) -> bool {
        match self {
            Routed::Event(e) => app.event_route(hub, e, last_hop),
            Routed::Interest(i) => app.interest_route(hub, i, last_hop),
        }
    }

    fn app_linear(&self, app: &mut dyn Application, hub: HubId, last_hop: Option<Address>) -> bool {
        match self {
            Routed::Event(e) => app.event_linear(hub, e, last_hop),
            Routed::Interest(i) => app.interest_linear(hub, i, last_hop),
        }
    }
}

impl Hub {
    /// Next hop towards the owner of `val`. None when the only candidate is our predecessor,
    /// which would send the message backwards.
    pub(crate) fn compute_next_hop(&self, val: Value) -> Option<Address> {
        let id = self.member.nearest_peer(val)?;
        let peer = self.member.peer(id)?;
        if peer.range.covers(val) {
            return Some(peer.addr);
        }
        let is_pred_head = self.member.predecessor().map(|p| p.addr) == Some(peer.addr);
        if is_pred_head && !peer.is_successor() {
            tracing::warn!(
                "hub {} ring looks unstable: routing {} would go back to {}",
                self.id(),
                val,
                peer.addr
            );
            return None;
        }
        Some(peer.addr)
    }

    fn check_ttl(&self, hop_count: u32, max: u32) -> bool {
        if hop_count >= max {
            tracing::warn!("hub {} dropping message after {} hops", self.id(), hop_count);
            return false;
        }
        if hop_count >= max.saturating_sub(LOOPING_MESSAGE_MARGIN) {
            tracing::warn!("hub {} possibly looping message, {} hops", self.id(), hop_count);
        }
        true
    }

    /// Where the rest of `cst` lies relative to us. A wrapped owner only continues when the
    /// constraint starts in its lower part and reaches past it.
    fn directions(&self, cst: &Constraint) -> Option<RouteDirections> {
        let my = self.member.range()?;
        let mut dirs = cst.route_directions(&my, self.member.am_rightmost());
        if my.is_wrapped() {
            dirs.right = cst.min < my.max && cst.max >= my.max;
        }
        Some(dirs)
    }

    pub(crate) fn route(
        &mut self,
        cx: &mut Context<'_>,
        last_hop: Option<Address>,
        mut item: Routed,
        mode: RoutingMode,
        hop_count: u32,
    ) -> Result<()> {
        let id = self.id();
        let Some(my) = self.member.range().filter(|_| self.member.is_joined()) else {
            tracing::debug!("hub {} asked to route while not joined", id);
            return Ok(());
        };
        let mut cst = item.constraint();
        cst.clamp(self.member.absmin(), self.member.absmax());
        if cst.min > cst.max {
            tracing::debug!("hub {} dropping inverted constraint {}", id, cst);
            return Ok(());
        }
        item.set_constraint(cst);
        if !self.check_ttl(hop_count, cx.params.max_message_ttl) {
            return Ok(());
        }
        let Some(dirs) = self.directions(&cst) else {
            return Ok(());
        };

        match mode {
            RoutingMode::Greedy if !dirs.left && dirs.center => {
                self.rendezvous(cx, &item, last_hop, hop_count)?;
                if !dirs.right {
                    return Ok(());
                }
                if cx.params.fanout {
                    self.fanout(cx, &item, last_hop, cst, hop_count)
                } else {
                    self.walk(cx, &item, last_hop, hop_count)
                }
            }
            RoutingMode::Greedy => {
                if !item.app_route(cx.app, id, last_hop) {
                    return Ok(());
                }
                match self.compute_next_hop(cst.min) {
                    Some(next) => cx.send(next, id, item.greedy(RoutingMode::Greedy, hop_count + 1)),
                    None => Ok(()),
                }
            }
            RoutingMode::Linear => {
                // Only the node that switched to linear mode owns the lower end.
                if my.covers(cst.min) {
                    tracing::debug!("hub {} linear walk came back around", id);
                    return Ok(());
                }
                if dirs.center {
                    self.rendezvous(cx, &item, last_hop, hop_count)?;
                }
                if dirs.right {
                    self.walk(cx, &item, last_hop, hop_count)?;
                }
                Ok(())
            }
        }
    }

    /// Continue linearly at the successor.
    fn walk(
        &mut self,
        cx: &mut Context<'_>,
        item: &Routed,
        last_hop: Option<Address>,
        hop_count: u32,
    ) -> Result<()> {
        let id = self.id();
        if !item.app_linear(cx.app, id, last_hop) {
            return Ok(());
        }
        match self.member.successor().map(|s| s.addr) {
            Some(succ) => cx.send(succ, id, item.greedy(RoutingMode::Linear, hop_count + 1)),
            None => Ok(()),
        }
    }

    /// Send `item` to every known peer covering `cst`, each one responsible up to the next one's
    /// range.
    fn fanout(
        &mut self,
        cx: &mut Context<'_>,
        item: &Routed,
        last_hop: Option<Address>,
        cst: Constraint,
        hop_count: u32,
    ) -> Result<()> {
        let id = self.id();
        if !item.app_linear(cx.app, id, last_hop) {
            return Ok(());
        }
        let peers: Vec<(Address, Value)> = self
            .member
            .covering_peers(&cst)
            .into_iter()
            .filter_map(|pid| self.member.peer(pid).map(|p| (p.addr, p.range.min)))
            .collect();
        for (i, (addr, _)) in peers.iter().enumerate() {
            let stop = match peers.get(i + 1) {
                Some((_, next_min)) => *next_min - Value::EPSILON,
                None => cst.max,
            };
            cx.send(*addr, id, item.linear(stop, hop_count + 1))?;
        }
        Ok(())
    }

    /// A fanned out copy: handle our part, then fan out whatever lies beyond our range up to
    /// `stop`.
    fn route_linear(
        &mut self,
        cx: &mut Context<'_>,
        from: Address,
        mut item: Routed,
        stop: Value,
        hop_count: u32,
    ) -> Result<()> {
        let id = self.id();
        let Some(my) = self.member.range().filter(|_| self.member.is_joined()) else {
            return Ok(());
        };
        if !self.check_ttl(hop_count, cx.params.max_message_ttl) {
            return Ok(());
        }
        let mut cst = item.constraint();
        cst.clamp(self.member.absmin(), self.member.absmax());
        item.set_constraint(cst);
        if my.covers(cst.min) {
            tracing::debug!("hub {} fan out came back around", id);
            return Ok(());
        }
        let rest = Range::new(cst.attr, my.max, stop);
        let mut dirs = rest.route_directions(&my, self.member.am_rightmost());
        if my.is_wrapped() {
            dirs.right = false;
        }
        self.rendezvous(cx, &item, Some(from), hop_count)?;
        if dirs.right {
            self.fanout(cx, &item, Some(from), rest, hop_count)?;
        }
        Ok(())
    }

    fn rendezvous(
        &mut self,
        cx: &mut Context<'_>,
        item: &Routed,
        last_hop: Option<Address>,
        hop_count: u32,
    ) -> Result<()> {
        match item {
            Routed::Event(e) => self.event_at_rendezvous(cx, e, last_hop, hop_count),
            Routed::Interest(i) => self.interest_at_rendezvous(cx, i, last_hop),
        }
    }

    fn event_at_rendezvous(
        &mut self,
        cx: &mut Context<'_>,
        event: &Event,
        last_hop: Option<Address>,
        hop_count: u32,
    ) -> Result<()> {
        let id = self.id();
        let Some(my) = self.member.range() else {
            return Ok(());
        };
        let action = cx.app.event_at_rendezvous(id, event, last_hop, hop_count);
        if action.matches() {
            for interest in self.store.matching_interests(event, &my, cx.now) {
                if interest.subscriber == event.creator {
                    continue;
                }
                cx.app
                    .event_interest_match(id, event, &interest, interest.subscriber);
                self.deliver(cx, interest.subscriber, event)?;
            }
        }
        if action.stores() {
            tracing::debug!("hub {} storing trigger {}", id, event.nonce);
            self.store.store_trigger(event.clone(), cx.now);
        }
        Ok(())
    }

    fn interest_at_rendezvous(
        &mut self,
        cx: &mut Context<'_>,
        interest: &Interest,
        last_hop: Option<Address>,
    ) -> Result<()> {
        let id = self.id();
        let Some(my) = self.member.range() else {
            return Ok(());
        };
        let action = cx.app.interest_at_rendezvous(id, interest, last_hop);
        if action.stores() {
            self.store.store_interest(interest.clone(), cx.now);
        }
        if action.triggers() {
            for event in self.store.matching_triggers(interest, &my, cx.now) {
                if event.creator == interest.subscriber {
                    continue;
                }
                self.deliver(cx, interest.subscriber, &event)?;
            }
        }
        Ok(())
    }

    fn deliver(&mut self, cx: &mut Context<'_>, subscriber: Address, event: &Event) -> Result<()> {
        let id = self.id();
        if subscriber == cx.me {
            cx.app.publication_received(id, event);
            return Ok(());
        }
        cx.send(
            subscriber,
            id,
            Message::MatchedPublication(MatchedPublication {
                event: event.clone(),
            }),
        )
    }
}

impl HandleMsg<Publication> for Hub {
    fn handle(&mut self, cx: &mut Context<'_>, from: Address, msg: Publication) -> Result<()> {
        self.route(cx, Some(from), Routed::Event(msg.event), msg.mode, msg.hop_count)
    }
}

impl HandleMsg<Subscription> for Hub {
    fn handle(&mut self, cx: &mut Context<'_>, from: Address, msg: Subscription) -> Result<()> {
        self.route(
            cx,
            Some(from),
            Routed::Interest(msg.interest),
            msg.mode,
            msg.hop_count,
        )
    }
}

impl HandleMsg<LinearPublication> for Hub {
    fn handle(&mut self, cx: &mut Context<'_>, from: Address, msg: LinearPublication) -> Result<()> {
        self.route_linear(cx, from, Routed::Event(msg.event), msg.stop, msg.hop_count)
    }
}

impl HandleMsg<LinearSubscription> for Hub {
    fn handle(&mut self, cx: &mut Context<'_>, from: Address, msg: LinearSubscription) -> Result<()> {
        self.route_linear(
            cx,
            from,
            Routed::Interest(msg.interest),
            msg.stop,
            msg.hop_count,
        )
    }
}

impl HandleMsg<MatchedPublication> for Hub {
    fn handle(&mut self, cx: &mut Context<'_>, from: Address, msg: MatchedPublication) -> Result<()> {
        tracing::debug!("hub {} matched publication {} via {}", self.id(), msg.event.nonce, from);
        cx.app.publication_received(self.id(), &msg.event);
        Ok(())
    }
}
