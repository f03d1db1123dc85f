//! Wire messages of the overlay.
mod encoder;
pub use encoder::Decoder;
pub use encoder::Encoder;

pub mod types;
pub use types::*;

/// Identifier of a hub.
pub type HubId = u8;

/// Hub id carried by messages addressed to the node rather than to one of its hubs.
pub const NODE_SCOPE: HubId = 0xff;

/// A message and the hub it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Target hub.
    pub hub: HubId,
    /// The message.
    pub message: Message,
}

impl Envelope {
    /// Wrap a message for `hub`.
    pub fn new(hub: HubId, message: Message) -> Self {
        Self { hub, message }
    }
}
