//! Protocol tunables shared by every hub of a node.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::consts::*;
use crate::error::Error;
use crate::error::Result;

/// Timing and sizing parameters of the overlay. Durations are stored in milliseconds so the
/// struct reads naturally from YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Parameters {
    /// A peer silent for this long is dead.
    pub peer_pong_timeout: u64,
    /// Interval of liveness checks and long-neighbor pings.
    pub peer_ping_interval: u64,
    /// Interval of successor pings and successor-list refresh.
    pub successor_maintenance_timeout: u64,
    /// First join retry interval, grows by [JOIN_BACKOFF_FACTOR] per attempt.
    pub join_request_timeout: u64,
    /// Join attempts before giving up.
    pub max_join_attempts: u32,
    /// Deadline of a single long-neighbor request.
    pub long_neighbor_response_timeout: u64,
    /// Interval of long-neighbor repair passes.
    pub long_neighbor_repair_interval: u64,
    /// Age after which stale long neighbors and silent reverse long neighbors are dropped.
    pub kick_old_peers_timeout: u64,
    /// Deadline of a leave-join load balance request.
    pub leave_join_response_timeout: u64,
    /// Window in which a repeated join or load balance request counts as a duplicate.
    pub tcp_failure_timeout: u64,
    /// Interval between bootstrap requests.
    pub bootstrap_request_timeout: u64,
    /// Bootstrap requests before giving up.
    pub max_bootstrap_request_attempts: u32,
    /// Interval of heartbeats to the bootstrap server.
    pub bootstrap_heartbeat_interval: u64,
    /// Length of the successor list.
    pub n_successors_to_keep: usize,
    /// Hop count at which routed messages are dropped.
    pub max_message_ttl: u32,
    /// Fan a range out to every covering peer instead of walking successor by successor.
    pub fanout: bool,
    /// Minimum heavy/light load ratio for a local rebalance to proceed.
    pub loadbal_delta: f64,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            peer_pong_timeout: PEER_PONG_TIMEOUT,
            peer_ping_interval: PEER_PING_INTERVAL,
            successor_maintenance_timeout: SUCCESSOR_MAINTENANCE_TIMEOUT,
            join_request_timeout: JOIN_REQUEST_TIMEOUT,
            max_join_attempts: MAX_JOIN_ATTEMPTS,
            long_neighbor_response_timeout: LONG_NEIGHBOR_RESPONSE_TIMEOUT,
            long_neighbor_repair_interval: LONG_NEIGHBOR_REPAIR_INTERVAL,
            kick_old_peers_timeout: KICK_OLD_PEERS_TIMEOUT,
            leave_join_response_timeout: LEAVE_JOIN_RESPONSE_TIMEOUT,
            tcp_failure_timeout: TCP_FAILURE_TIMEOUT,
            bootstrap_request_timeout: BOOTSTRAP_REQUEST_TIMEOUT,
            max_bootstrap_request_attempts: MAX_BOOTSTRAP_REQUEST_ATTEMPTS,
            bootstrap_heartbeat_interval: BOOTSTRAP_HEARTBEAT_INTERVAL,
            n_successors_to_keep: N_SUCCESSORS_TO_KEEP,
            max_message_ttl: MAX_MESSAGE_TTL,
            fanout: true,
            loadbal_delta: LOADBAL_DELTA,
        }
    }
}

impl Parameters {
    /// Reject combinations that would break failure detection.
    pub fn validate(&self) -> Result<()> {
        if self.peer_ping_interval >= self.peer_pong_timeout {
            return Err(Error::InvalidParameters(format!(
                "peer_ping_interval ({}ms) must be shorter than peer_pong_timeout ({}ms)",
                self.peer_ping_interval, self.peer_pong_timeout
            )));
        }
        if self.successor_maintenance_timeout >= self.peer_pong_timeout {
            return Err(Error::InvalidParameters(format!(
                "successor_maintenance_timeout ({}ms) must be shorter than peer_pong_timeout ({}ms)",
                self.successor_maintenance_timeout, self.peer_pong_timeout
            )));
        }
        if self.n_successors_to_keep == 0 {
            return Err(Error::InvalidParameters(
                "n_successors_to_keep must be positive".to_string(),
            ));
        }
        if self.max_message_ttl <= LOOPING_MESSAGE_MARGIN {
            return Err(Error::InvalidParameters(format!(
                "max_message_ttl must exceed {}",
                LOOPING_MESSAGE_MARGIN
            )));
        }
        Ok(())
    }

    pub(crate) fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    pub(crate) fn pong_timeout(&self) -> Duration {
        Self::ms(self.peer_pong_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_parameters_are_valid() {
        assert!(Parameters::default().validate().is_ok());
    }

    #[test]
    fn test_ping_interval_must_be_shorter_than_pong_timeout() {
        let params = Parameters {
            peer_ping_interval: 45_000,
            ..Default::default()
        };
        assert!(matches!(
            params.validate(),
            Err(Error::InvalidParameters(_))
        ));
    }
}
