//! Ring population estimates for long-neighbor placement.

use crate::hub::MemberHub;
use crate::value::Value;

/// Source of the node-count estimate and of the value `dist` nodes away.
pub trait MetricSource {
    /// Estimated number of members of the hub.
    fn estimate_node_count(&self, hub: &MemberHub) -> Option<u64>;

    /// Value owned by the node roughly `dist` members clockwise from us.
    fn value_at_distance(&self, hub: &MemberHub, dist: u64) -> Option<Value>;
}

/// Assume every member owns as much as we do.
#[derive(Debug, Default, Clone, Copy)]
pub struct UniformDensity;

impl MetricSource for UniformDensity {
    fn estimate_node_count(&self, hub: &MemberHub) -> Option<u64> {
        let range = hub.range()?;
        let span = range.span(hub.absmin(), hub.absmax()).get();
        if span == 0 {
            return None;
        }
        Some((hub.domain_size().get() / span).max(1))
    }

    fn value_at_distance(&self, hub: &MemberHub, dist: u64) -> Option<Value> {
        let range = hub.range()?;
        let total = hub.domain_size().get();
        let n = self.estimate_node_count(hub)?;
        let offset = (dist as u128 * total as u128 / n as u128) as u64 % total;
        Some((range.min + Value(offset)).wrap(hub.absmin(), hub.absmax()))
    }
}

/// A fixed population, useful when an external sampler already knows it.
#[derive(Debug, Clone, Copy)]
pub struct FixedPopulation(pub u64);

impl MetricSource for FixedPopulation {
    fn estimate_node_count(&self, _hub: &MemberHub) -> Option<u64> {
        Some(self.0.max(1))
    }

    fn value_at_distance(&self, hub: &MemberHub, dist: u64) -> Option<Value> {
        let range = hub.range()?;
        let total = hub.domain_size().get();
        let offset = (dist as u128 * total as u128 / self.0.max(1) as u128) as u64 % total;
        Some((range.min + Value(offset)).wrap(hub.absmin(), hub.absmax()))
    }
}
