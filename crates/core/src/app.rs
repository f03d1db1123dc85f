//! The contract between the overlay and the application on top of it.
//!
//! Every method has a default so applications implement only what they use.

use crate::message::HubId;
use crate::peer::Address;
use crate::pubsub::Event;
use crate::pubsub::Interest;
use crate::range::NodeRange;

/// What to do with a publication that reached its rendezvous point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventProcessType {
    /// Drop it.
    Nuke,
    /// Match it against stored interests.
    Match,
    /// Store it as a trigger for later interests.
    Store,
    /// Both.
    MatchAndStore,
}

impl EventProcessType {
    /// Matching against interests is requested.
    pub fn matches(self) -> bool {
        matches!(self, Self::Match | Self::MatchAndStore)
    }

    /// Storing is requested.
    pub fn stores(self) -> bool {
        matches!(self, Self::Store | Self::MatchAndStore)
    }
}

/// What to do with a subscription that reached its rendezvous point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterestProcessType {
    /// Drop it.
    Nuke,
    /// Store it for later publications.
    Store,
    /// Match it against stored triggers.
    Trigger,
    /// Both.
    StoreAndTrigger,
}

impl InterestProcessType {
    /// Storing is requested.
    pub fn stores(self) -> bool {
        matches!(self, Self::Store | Self::StoreAndTrigger)
    }

    /// Matching against stored triggers is requested.
    pub fn triggers(self) -> bool {
        matches!(self, Self::Trigger | Self::StoreAndTrigger)
    }
}

/// Callbacks from the overlay.
#[allow(unused_variables)]
pub trait Application {
    /// A successor is known, routing may start.
    fn join_begin(&mut self, hub: HubId, successor: Address) {}

    /// The successor confirmed us as its predecessor.
    fn join_end(&mut self, hub: HubId, successor: Address) {}

    /// All join attempts failed.
    fn join_failed(&mut self, hub: HubId, representative: Option<Address>) {}

    /// Leaving started.
    fn leave_begin(&mut self, hub: HubId) {}

    /// Leaving finished, the node no longer owns a range.
    fn leave_end(&mut self, hub: HubId) {}

    /// The owned range grew.
    fn range_expanded(&mut self, hub: HubId, old: Option<NodeRange>, new: NodeRange) {}

    /// The owned range shrank.
    fn range_contracted(&mut self, hub: HubId, old: NodeRange, new: NodeRange) {}

    /// Forward a publication on its greedy leg?
    fn event_route(&mut self, hub: HubId, event: &Event, last_hop: Option<Address>) -> bool {
        true
    }

    /// Forward a publication on its linear leg?
    fn event_linear(&mut self, hub: HubId, event: &Event, last_hop: Option<Address>) -> bool {
        true
    }

    /// Forward a subscription on its greedy leg?
    fn interest_route(&mut self, hub: HubId, interest: &Interest, last_hop: Option<Address>) -> bool {
        true
    }

    /// Forward a subscription on its linear leg?
    fn interest_linear(
        &mut self,
        hub: HubId,
        interest: &Interest,
        last_hop: Option<Address>,
    ) -> bool {
        true
    }

    /// A publication reached a node whose range it touches.
    fn event_at_rendezvous(
        &mut self,
        hub: HubId,
        event: &Event,
        last_hop: Option<Address>,
        hop_count: u32,
    ) -> EventProcessType {
        EventProcessType::Match
    }

    /// A subscription reached a node whose range it touches.
    fn interest_at_rendezvous(
        &mut self,
        hub: HubId,
        interest: &Interest,
        last_hop: Option<Address>,
    ) -> InterestProcessType {
        InterestProcessType::StoreAndTrigger
    }

    /// A publication matched an interest here, it is being sent to `subscriber`.
    fn event_interest_match(
        &mut self,
        hub: HubId,
        event: &Event,
        interest: &Interest,
        subscriber: Address,
    ) {
    }

    /// A publication matching one of our interests arrived.
    fn publication_received(&mut self, hub: HubId, event: &Event) {}

    /// May this node leave its position to relieve a loaded node?
    fn is_leave_join_ok(&mut self, hub: HubId) -> bool {
        true
    }

    /// Current load, compared between neighbors by the local load balancer.
    fn current_load(&mut self, hub: HubId) -> f64 {
        0.0
    }
}

/// An application that accepts every default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullApplication;

impl Application for NullApplication {}
