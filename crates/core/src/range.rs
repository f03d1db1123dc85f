//! Intervals over an attribute domain.
//!
//! The same triple `(attr, min, max)` plays two roles:
//! - a [Constraint] is a closed query interval `[min, max]` carried by publications and subscriptions;
//! - a [NodeRange] is the half open slice `[min, max)` a node owns. It wraps around the ring when
//!   `min > max`.
//!
//! The comparisons below are not symmetric between `min` and `max`. Peers must agree bit for bit on
//! ownership, so they are kept exactly as they are.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::value::Value;

/// An interval of one attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    /// Index of the attribute, the hub id.
    pub attr: u8,
    /// Lower end.
    pub min: Value,
    /// Upper end.
    pub max: Value,
}

/// A closed query interval.
pub type Constraint = Range;

/// An owned, left-inclusive right-exclusive, possibly wrapped interval.
pub type NodeRange = Range;

/// Where a query must continue relative to the current node's range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteDirections {
    /// Part of the query lies before this node.
    pub left: bool,
    /// This node's range intersects the query.
    pub center: bool,
    /// Part of the query lies after this node.
    pub right: bool,
}

impl Range {
    /// Create a range.
    pub fn new(attr: u8, min: impl Into<Value>, max: impl Into<Value>) -> Self {
        Self {
            attr,
            min: min.into(),
            max: max.into(),
        }
    }

    /// A closed interval holding a single value.
    pub fn point(attr: u8, v: impl Into<Value>) -> Self {
        let v = v.into();
        Self::new(attr, v, v)
    }

    /// The interval crosses the `absmax -> absmin` boundary.
    pub fn is_wrapped(&self) -> bool {
        self.min > self.max
    }

    /// Ownership test, left-inclusive and right-exclusive, wrap-aware.
    pub fn covers(&self, val: Value) -> bool {
        if self.is_wrapped() {
            return val >= self.min || val < self.max;
        }
        self.min <= val && val < self.max
    }

    /// Closed interval intersection test. Touching intervals overlap.
    pub fn overlaps(&self, other: &Range) -> bool {
        (self.min >= other.min && self.min <= other.max)
            || (other.min >= self.min && other.min <= self.max)
    }

    /// Intersection test of this constraint against a possibly wrapped node range.
    pub fn overlaps_node_range(&self, nr: &NodeRange) -> bool {
        if nr.min < nr.max {
            return self.overlaps(nr);
        }
        !(self.min >= nr.max && self.max < nr.min)
    }

    /// Size of the interval, accounting for wrap.
    pub fn span(&self, absmin: Value, absmax: Value) -> Value {
        if self.min < self.max {
            return self.max - self.min;
        }
        if self.min == self.max {
            return Value(0);
        }
        (absmax - self.min) + (self.max - absmin)
    }

    /// Magnitude of the intersection with `cst`, zero when disjoint. Unwrapped intervals only.
    pub fn overlap(&self, cst: &Constraint) -> Value {
        let (r, s) = (self, cst);
        if s.min <= r.min && s.max > r.min {
            if s.max > r.max {
                r.max - r.min
            } else {
                s.max - r.min
            }
        } else if s.min < r.max && s.max >= r.max {
            r.max - s.min
        } else if r.min < s.max && s.max < r.max {
            s.max - s.min
        } else {
            Value(0)
        }
    }

    /// Clip both ends into the hub domain.
    pub fn clamp(&mut self, absmin: Value, absmax: Value) {
        if self.min < absmin {
            tracing::debug!("clamping left end {} to {}", self.min, absmin);
            self.min = absmin;
        }
        if self.max > absmax {
            tracing::debug!("clamping right end {} to {}", self.max, absmax);
            self.max = absmax;
        }
    }

    /// Decide where this query goes relative to the owned range `r`. `am_rightmost` is true when
    /// `r` ends at the domain maximum, nothing lies to its right.
    pub fn route_directions(&self, r: &NodeRange, am_rightmost: bool) -> RouteDirections {
        if r.is_wrapped() {
            return self.route_directions_wrapped(r);
        }

        let mut dirs = RouteDirections {
            left: self.min < r.min,
            ..Default::default()
        };

        if !am_rightmost && self.max >= r.max {
            dirs.right = true;
        }

        dirs.center = if am_rightmost {
            !(self.max < r.min || self.min > r.max)
        } else {
            !(self.max < r.min || self.min >= r.max)
        };
        dirs
    }

    fn route_directions_wrapped(&self, r: &NodeRange) -> RouteDirections {
        RouteDirections {
            left: false,
            center: !(self.min >= r.max && self.max < r.min),
            right: true,
        }
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:[{},{})", self.attr, self.min, self.max)
    }
}

/// `val` lies strictly inside the clockwise arc from `left` to `right`. A degenerate arc
/// (`left == right`) is the whole ring.
pub fn is_between(val: Value, left: Value, right: Value) -> bool {
    match left.cmp(&right) {
        std::cmp::Ordering::Less => left < val && val < right,
        std::cmp::Ordering::Greater => val > left || val < right,
        std::cmp::Ordering::Equal => true,
    }
}

/// Like [is_between] with both ends included.
pub fn is_between_inclusive(val: Value, left: Value, right: Value) -> bool {
    match left.cmp(&right) {
        std::cmp::Ordering::Less => left <= val && val <= right,
        std::cmp::Ordering::Greater => val >= left || val <= right,
        std::cmp::Ordering::Equal => true,
    }
}

/// Like [is_between] with `left` included.
pub fn is_between_left_inclusive(val: Value, left: Value, right: Value) -> bool {
    match left.cmp(&right) {
        std::cmp::Ordering::Less => left <= val && val < right,
        std::cmp::Ordering::Greater => val >= left || val < right,
        std::cmp::Ordering::Equal => true,
    }
}

/// Like [is_between] with `right` included.
pub fn is_between_right_inclusive(val: Value, left: Value, right: Value) -> bool {
    match left.cmp(&right) {
        std::cmp::Ordering::Less => left < val && val <= right,
        std::cmp::Ordering::Greater => val > left || val <= right,
        std::cmp::Ordering::Equal => true,
    }
}
