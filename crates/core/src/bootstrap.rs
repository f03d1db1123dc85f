//! Hub descriptions handed out by a bootstrap server or read from configuration.

use serde::Deserialize;
use serde::Serialize;

use crate::error::Error;
use crate::error::Result;
use crate::message::HubId;
use crate::peer::Address;
use crate::peer::PeerInfo;
use crate::range::NodeRange;
use crate::value::Value;

/// Pre-assigned position of a node, skipping the split negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticTopology {
    /// Owned range.
    pub range: NodeRange,
    /// Successor list, nearest first.
    pub successors: Vec<PeerInfo>,
    /// Predecessor list, nearest first.
    pub predecessors: Vec<PeerInfo>,
}

/// Everything a node needs to take part in a hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubInitInfo {
    /// Hub id, also the attribute index of its constraints.
    pub id: HubId,
    /// Human readable name.
    pub name: String,
    /// Lower end of the domain.
    pub absmin: Value,
    /// Upper end of the domain, exclusive.
    pub absmax: Value,
    /// Member to send the join request to. None means this node starts the ring.
    #[serde(default)]
    pub representative: Option<Address>,
    /// Position assigned up front.
    #[serde(default)]
    pub static_topology: Option<StaticTopology>,
}

impl HubInitInfo {
    /// A hub over `[absmin, absmax)` with no representative.
    pub fn new(id: HubId, name: impl Into<String>, absmin: u64, absmax: u64) -> Self {
        Self {
            id,
            name: name.into(),
            absmin: Value(absmin),
            absmax: Value(absmax),
            representative: None,
            static_topology: None,
        }
    }

    /// Set the representative.
    pub fn with_representative(mut self, addr: Address) -> Self {
        self.representative = Some(addr);
        self
    }

    /// Check the domain and a static range, if any, against it.
    pub fn validate(&self) -> Result<()> {
        if self.absmin >= self.absmax {
            return Err(Error::EmptyHubDomain(self.id));
        }
        if let Some(t) = &self.static_topology {
            let r = t.range;
            let inside = |v: Value| v >= self.absmin && v <= self.absmax;
            if !inside(r.min) || !inside(r.max) {
                return Err(Error::RangeOutOfDomain(r));
            }
        }
        Ok(())
    }
}
