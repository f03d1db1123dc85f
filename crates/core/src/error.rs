//! Error of mercury_core

use crate::message::HubId;
use crate::range::Range;

/// A wrap `Result` contains custom errors.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors collections in mercury-core.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Bincode serialization error")]
    BincodeSerialize(#[source] bincode::Error),

    #[error("Bincode deserialization error")]
    BincodeDeserialize(#[source] bincode::Error),

    #[error("Empty datagram")]
    EmptyFrame,

    #[error("Unknown message tag {0:#04x}")]
    UnknownMessageTag(u8),

    #[error("Hub {0} is not registered on this node")]
    UnknownHub(HubId),

    #[error("Hub {0} is already registered")]
    HubAlreadyRegistered(HubId),

    #[error("Hub {0} has an empty domain")]
    EmptyHubDomain(HubId),

    #[error("Hub {0} is not joined")]
    HubNotJoined(HubId),

    #[error("Hub {0} is already joining or joined")]
    HubAlreadyJoined(HubId),

    #[error("Range {0} is outside the hub domain")]
    RangeOutOfDomain(Range),

    #[error("Invalid rebalance proposal {proposed} for owned range {owned}")]
    InvalidRebalanceProposal { proposed: Range, owned: Range },

    #[error("Hub {0} is already rebalancing")]
    RebalanceInProgress(HubId),

    #[error("Hub {0} has no neighbor to rebalance with")]
    NoRebalanceNeighbor(HubId),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("All successors of hub {0} are dead, the ring is partitioned")]
    AllSuccessorsDead(HubId),

    #[error("Bootstrap server did not answer after {0} attempts")]
    BootstrapUnreachable(u32),
}
