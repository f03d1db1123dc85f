//! Scalar attribute values.

use std::fmt;
use std::ops::Add;
use std::ops::Sub;

use serde::Deserialize;
use serde::Serialize;

/// An ordered scalar of an attribute domain. Arithmetic saturates instead of panicking, callers
/// that need modular arithmetic over a hub domain go through [Value::wrap].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Value(pub u64);

impl Value {
    /// Smallest step between two distinct values.
    pub const EPSILON: Value = Value(1);

    /// Raw integer.
    pub fn get(self) -> u64 {
        self.0
    }

    /// Fold a value that overran `absmax` back into `[absmin, absmax)`.
    pub fn wrap(self, absmin: Value, absmax: Value) -> Value {
        let total = absmax.0.saturating_sub(absmin.0);
        if total == 0 || self < absmax {
            return self;
        }
        Value(absmin.0 + (self.0 - absmin.0) % total)
    }

    /// Clockwise distance from `self` to `to` on the ring `[absmin, absmax)`.
    pub fn distance_to(self, to: Value, absmin: Value, absmax: Value) -> Value {
        if to >= self {
            to - self
        } else {
            (absmax - self) + (to - absmin)
        }
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value(v)
    }
}

impl Add for Value {
    type Output = Value;

    fn add(self, rhs: Value) -> Value {
        Value(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Value {
    type Output = Value;

    fn sub(self, rhs: Value) -> Value {
        Value(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
