//! Mercury: a range-partitioned publish/subscribe overlay.
//! --------------
//! - [Range](crate::range::Range) is the wrap-aware interval type every ownership and routing decision is built on.
//! - [MemberHub](crate::hub::MemberHub) keeps the successor, predecessor and long-neighbor tables of one ring.
//! - [MercuryNode](crate::node::MercuryNode) is the sans-IO event loop: feed it datagrams and timer ticks,
//!   drain the datagrams it wants sent.
//!
//! # Hubs
//!
//! A hub is one ring partitioning `[absmin, absmax)` of a single attribute among its members.
//! Each member owns one contiguous, possibly wrapped, slice. A node may be a member of several hubs;
//! hubs never share state.
//!
//! # Joining
//!
//! 1. The first member of a hub claims the whole domain.
//! 2. A joiner sends a join request to a representative. The request is routed to the owner of the
//!    wanted position, which splits its range, keeps the lower part and hands the upper part to the joiner.
//! 3. The joiner notifies its new successor; once the successor reports the joiner as its predecessor
//!    the join is complete.
//!
//! # Routing
//!
//! Publications and subscriptions carry a closed constraint `[min, max]`. They are routed greedily towards
//! `min` using long neighbors, then walk the ring linearly (or fan out) until `max` is covered.
//!
//! # Driving a node
//!
//! ```text
//! loop {
//!     node.handle_message(now, from, &datagram)?;   // on every datagram
//!     node.handle_timers(now)?;                      // whenever next_deadline() passes
//!     while let Some(out) = node.poll_outgoing() { socket.send_to(&out.bytes, out.to) }
//! }
//! ```
#![warn(missing_docs)]

pub mod app;
pub mod bootstrap;
pub mod consts;
pub mod error;
pub mod hub;
pub mod message;
pub mod metric;
pub mod node;
pub mod params;
pub mod peer;
pub mod pubsub;
pub mod range;
pub mod scheduler;
pub mod time;
pub mod value;

#[cfg(test)]
mod tests;

pub use app::Application;
pub use error::Error;
pub use error::Result;
pub use hub::HubStatus;
pub use hub::MemberHub;
pub use node::MercuryNode;
pub use node::Outgoing;
pub use params::Parameters;
pub use peer::Address;
pub use range::Constraint;
pub use range::NodeRange;
pub use range::Range;
pub use time::Timestamp;
pub use value::Value;
