//! Constant variables.
//!
//! Durations are in milliseconds.

/// Default PEER_PONG_TIMEOUT, a peer silent for this long is considered dead.
pub const PEER_PONG_TIMEOUT: u64 = 45_000;
/// Default PEER_PING_INTERVAL, liveness check and long-neighbor pings.
pub const PEER_PING_INTERVAL: u64 = 500;
/// Default SUCCESSOR_MAINTENANCE_TIMEOUT.
pub const SUCCESSOR_MAINTENANCE_TIMEOUT: u64 = 1_000;
/// Default JOIN_REQUEST_TIMEOUT, the first join retry interval.
pub const JOIN_REQUEST_TIMEOUT: u64 = 2_000;
/// Growth factor applied to the join retry interval after every attempt.
pub const JOIN_BACKOFF_FACTOR: f64 = 1.2;
/// Default MAX_JOIN_ATTEMPTS.
pub const MAX_JOIN_ATTEMPTS: u32 = 25;
/// Default LONG_NEIGHBOR_RESPONSE_TIMEOUT.
pub const LONG_NEIGHBOR_RESPONSE_TIMEOUT: u64 = 1_000;
/// Default LONG_NEIGHBOR_REPAIR_INTERVAL.
pub const LONG_NEIGHBOR_REPAIR_INTERVAL: u64 = 5_000;
/// Default KICK_OLD_PEERS_TIMEOUT.
pub const KICK_OLD_PEERS_TIMEOUT: u64 = 60_000;
/// Default LEAVE_JOIN_RESPONSE_TIMEOUT.
pub const LEAVE_JOIN_RESPONSE_TIMEOUT: u64 = 60_000;
/// Default TCP_FAILURE_TIMEOUT, window of duplicate detection for join and load balance requests.
pub const TCP_FAILURE_TIMEOUT: u64 = 10_000;
/// Default BOOTSTRAP_REQUEST_TIMEOUT.
pub const BOOTSTRAP_REQUEST_TIMEOUT: u64 = 1_000;
/// Default MAX_BOOTSTRAP_REQUEST_ATTEMPTS.
pub const MAX_BOOTSTRAP_REQUEST_ATTEMPTS: u32 = 20;
/// Default BOOTSTRAP_HEARTBEAT_INTERVAL.
pub const BOOTSTRAP_HEARTBEAT_INTERVAL: u64 = 5_000;
/// Default N_SUCCESSORS_TO_KEEP.
pub const N_SUCCESSORS_TO_KEEP: usize = 10;
/// Default MAX_MESSAGE_TTL.
pub const MAX_MESSAGE_TTL: u32 = 1000;
/// Hop count margin below the TTL at which a routed message is reported as looping.
pub const LOOPING_MESSAGE_MARGIN: u32 = 5;
/// Default LOADBAL_DELTA, heavy/light ratio above which a neighbor accepts a local rebalance.
pub const LOADBAL_DELTA: f64 = 2.0;
/// Size of the RTT sample ring buffer kept per peer.
pub const MAX_RTT_SAMPLES: usize = 20;
/// Attempts made by one long-neighbor repair before giving up until the next pass.
pub const LONG_NEIGHBOR_REPAIR_ATTEMPTS: usize = 3;
/// A ring estimated smaller than 2^MIN_LONG_NEIGHBOR_BITS nodes keeps no long neighbors.
pub const MIN_LONG_NEIGHBOR_BITS: u32 = 3;
/// Sequence number of a pong sent without a matching ping, carrying only range gossip.
pub const QUICK_PONG_SEQNO: u32 = 0xff;
