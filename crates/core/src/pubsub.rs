//! Publications, subscriptions and the per-hub rendezvous store.

use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;

use crate::peer::Address;
use crate::range::Constraint;
use crate::range::NodeRange;
use crate::time::Timestamp;
use crate::value::Value;

/// A publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Identifier chosen by the creator.
    pub nonce: u64,
    /// Node that published the event.
    pub creator: Address,
    /// Routed constraint, a single value for point publications.
    pub constraint: Constraint,
    /// How long the event stays stored as a trigger, in milliseconds.
    pub lifetime: u64,
    /// Application payload.
    pub payload: Bytes,
}

/// A subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interest {
    /// Identifier chosen by the subscriber.
    pub nonce: u64,
    /// Node to deliver matches to.
    pub subscriber: Address,
    /// Routed constraint.
    pub constraint: Constraint,
    /// How long the interest stays stored, in milliseconds.
    pub lifetime: u64,
}

/// State moved along with a range: interests and stored publications.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handover {
    /// Interests, lifetimes rewritten to the time remaining.
    pub interests: Vec<Interest>,
    /// Stored publications, lifetimes rewritten to the time remaining.
    pub triggers: Vec<Event>,
}

impl Handover {
    /// Nothing to move.
    pub fn is_empty(&self) -> bool {
        self.interests.is_empty() && self.triggers.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Stored<T> {
    item: T,
    death: Timestamp,
}

/// Interests and triggers stored at this rendezvous point.
#[derive(Debug, Default)]
pub struct PubsubStore {
    interests: Vec<Stored<Interest>>,
    triggers: Vec<Stored<Event>>,
}

fn overlap_start(a: &Constraint, b: &Constraint) -> Value {
    a.min.max(b.min)
}

impl PubsubStore {
    /// Store an interest until its lifetime runs out.
    pub fn store_interest(&mut self, interest: Interest, now: Timestamp) {
        let death = now + Duration::from_millis(interest.lifetime);
        self.interests
            .retain(|s| !(s.item.nonce == interest.nonce && s.item.subscriber == interest.subscriber));
        self.interests.push(Stored {
            item: interest,
            death,
        });
    }

    /// Store a publication as a trigger for later interests.
    pub fn store_trigger(&mut self, event: Event, now: Timestamp) {
        let death = now + Duration::from_millis(event.lifetime);
        self.triggers
            .retain(|s| !(s.item.nonce == event.nonce && s.item.creator == event.creator));
        self.triggers.push(Stored { item: event, death });
    }

    /// Live interests matching `event` for which `owner` is the node that delivers: it covers the
    /// lower end of the overlap. Every other node on the fan-out path skips the pair.
    pub fn matching_interests(
        &self,
        event: &Event,
        owner: &NodeRange,
        now: Timestamp,
    ) -> Vec<Interest> {
        self.interests
            .iter()
            .filter(|s| s.death > now)
            .filter(|s| s.item.constraint.overlaps(&event.constraint))
            .filter(|s| owner.covers(overlap_start(&s.item.constraint, &event.constraint)))
            .map(|s| s.item.clone())
            .collect()
    }

    /// Live triggers matching `interest` that `owner` delivers, lifetimes rewritten to the time
    /// remaining.
    pub fn matching_triggers(
        &self,
        interest: &Interest,
        owner: &NodeRange,
        now: Timestamp,
    ) -> Vec<Event> {
        self.triggers
            .iter()
            .filter(|s| s.death > now)
            .filter(|s| s.item.constraint.overlaps(&interest.constraint))
            .filter(|s| owner.covers(overlap_start(&s.item.constraint, &interest.constraint)))
            .map(|s| {
                let mut ev = s.item.clone();
                ev.lifetime = s.death.saturating_since(now).as_millis() as u64;
                ev
            })
            .collect()
    }

    /// Drop everything past its lifetime.
    pub fn expire(&mut self, now: Timestamp) {
        self.interests.retain(|s| s.death > now);
        self.triggers.retain(|s| s.death > now);
    }

    /// Copy out the live state relevant to `range`.
    pub fn handover_for(&self, range: &NodeRange, now: Timestamp) -> Handover {
        let remaining = |death: Timestamp| death.saturating_since(now).as_millis() as u64;
        Handover {
            interests: self
                .interests
                .iter()
                .filter(|s| s.death > now && s.item.constraint.overlaps_node_range(range))
                .map(|s| Interest {
                    lifetime: remaining(s.death),
                    ..s.item.clone()
                })
                .collect(),
            triggers: self
                .triggers
                .iter()
                .filter(|s| s.death > now && s.item.constraint.overlaps_node_range(range))
                .map(|s| Event {
                    lifetime: remaining(s.death),
                    ..s.item.clone()
                })
                .collect(),
        }
    }

    /// Copy out all live state.
    pub fn handover_all(&self, now: Timestamp) -> Handover {
        let remaining = |death: Timestamp| death.saturating_since(now).as_millis() as u64;
        Handover {
            interests: self
                .interests
                .iter()
                .filter(|s| s.death > now)
                .map(|s| Interest {
                    lifetime: remaining(s.death),
                    ..s.item.clone()
                })
                .collect(),
            triggers: self
                .triggers
                .iter()
                .filter(|s| s.death > now)
                .map(|s| Event {
                    lifetime: remaining(s.death),
                    ..s.item.clone()
                })
                .collect(),
        }
    }

    /// Take over state handed to us.
    pub fn absorb(&mut self, handover: Handover, now: Timestamp) {
        for i in handover.interests {
            self.store_interest(i, now);
        }
        for t in handover.triggers {
            self.store_trigger(t, now);
        }
    }

    /// Forget state that no longer touches the owned range.
    pub fn purge_outside(&mut self, range: &NodeRange) {
        self.interests
            .retain(|s| s.item.constraint.overlaps_node_range(range));
        self.triggers
            .retain(|s| s.item.constraint.overlaps_node_range(range));
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.interests.clear();
        self.triggers.clear();
    }

    /// Number of stored interests.
    pub fn interest_count(&self) -> usize {
        self.interests.len()
    }

    /// Number of stored triggers.
    pub fn trigger_count(&self) -> usize {
        self.triggers.len()
    }
}
