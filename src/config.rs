//! Engine configuration.
//!
//! Every limit and cadence the engine uses lives in [`EngineConfig`]. The
//! defaults are the production values; tests shrink the intervals.

use std::time::Duration;

use crate::peer_state::PeerStateConfig;
use crate::reputation::ReputationConfig;
use crate::routing::{DEFAULT_BUCKET_SIZE, DEFAULT_MIN_POPULATION, UriFilter};
use crate::session::SessionConfig;

/// Maximum concurrent sessions.
pub const DEFAULT_CONNECTION_LIMIT: usize = 32;

/// Minimum connected peers before upload dissemination runs.
pub const DEFAULT_UPLOAD_PEER_LOWER_BOUND: usize = 3;

/// Minimum connected peers before download dissemination runs.
pub const DEFAULT_DOWNLOAD_PEER_LOWER_BOUND: usize = 3;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_SEARCH_REFRESH_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_UPLOAD_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_DOWNLOAD_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_CHURN_INTERVAL: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_CHECK_SEEDS_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// A peer that delivered no content for this long is dropped.
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(30 * 60);

pub const DEFAULT_NODE_GOSSIP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_QUEUE_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Keys gathered per upload pass from the upload set.
pub const DEFAULT_UPLOAD_BATCH: usize = 1024;

/// Keys gathered per upload pass from the diffusion set.
pub const DEFAULT_DIFFUSION_BATCH: usize = 1024;

/// Advertise/request candidates taken per source per download pass.
pub const DEFAULT_CANDIDATES_PER_SOURCE: usize = 256;

/// Wanted signatures considered per download pass.
pub const DEFAULT_SIGNATURE_BATCH: usize = 128;

/// Links or requests flushed to one peer per flush.
pub const DEFAULT_FLUSH_CAP: usize = 2048;

/// Seed requests flushed to the fastest peer; scaled down by rank.
pub const DEFAULT_SEED_REQUEST_SCALE: usize = 128;

/// Seeds pushed to one peer per tick.
pub const DEFAULT_SEEDS_PER_TICK: usize = 4;

/// Uris tried per outbound candidate.
pub const DEFAULT_URIS_PER_CANDIDATE: usize = 12;

/// Peers pushed per node-gossip round.
pub const DEFAULT_GOSSIP_NODES: usize = 12;

/// Connected peers a wanted signature is requested from.
pub const DEFAULT_SEED_REQUEST_FANOUT: usize = 2;

/// Capacity of the session event channel.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub connection_limit: usize,
    /// Bytes per second across all sessions; `None` is unlimited.
    pub bandwidth_limit: Option<u64>,
    pub upload_peer_lower_bound: usize,
    pub download_peer_lower_bound: usize,

    pub bucket_size: usize,
    pub min_population: usize,
    pub uri_filter: UriFilter,

    pub session: SessionConfig,
    pub peer_state: PeerStateConfig,
    pub reputation: ReputationConfig,

    pub poll_interval: Duration,
    pub search_refresh_interval: Duration,
    pub upload_interval: Duration,
    pub download_interval: Duration,
    pub churn_interval: Duration,
    pub sweep_interval: Duration,
    pub check_seeds_interval: Duration,
    pub liveness_timeout: Duration,
    pub node_gossip_interval: Duration,
    pub queue_flush_interval: Duration,

    pub upload_batch: usize,
    pub diffusion_batch: usize,
    pub candidates_per_source: usize,
    pub signature_batch: usize,
    pub flush_cap: usize,
    pub seed_request_scale: usize,
    pub seeds_per_tick: usize,
    pub uris_per_candidate: usize,
    pub gossip_nodes: usize,
    pub seed_request_fanout: usize,
    pub event_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connection_limit: DEFAULT_CONNECTION_LIMIT,
            bandwidth_limit: None,
            upload_peer_lower_bound: DEFAULT_UPLOAD_PEER_LOWER_BOUND,
            download_peer_lower_bound: DEFAULT_DOWNLOAD_PEER_LOWER_BOUND,
            bucket_size: DEFAULT_BUCKET_SIZE,
            min_population: DEFAULT_MIN_POPULATION,
            uri_filter: UriFilter::default(),
            session: SessionConfig::default(),
            peer_state: PeerStateConfig::default(),
            reputation: ReputationConfig::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            search_refresh_interval: DEFAULT_SEARCH_REFRESH_INTERVAL,
            upload_interval: DEFAULT_UPLOAD_INTERVAL,
            download_interval: DEFAULT_DOWNLOAD_INTERVAL,
            churn_interval: DEFAULT_CHURN_INTERVAL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            check_seeds_interval: DEFAULT_CHECK_SEEDS_INTERVAL,
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            node_gossip_interval: DEFAULT_NODE_GOSSIP_INTERVAL,
            queue_flush_interval: DEFAULT_QUEUE_FLUSH_INTERVAL,
            upload_batch: DEFAULT_UPLOAD_BATCH,
            diffusion_batch: DEFAULT_DIFFUSION_BATCH,
            candidates_per_source: DEFAULT_CANDIDATES_PER_SOURCE,
            signature_batch: DEFAULT_SIGNATURE_BATCH,
            flush_cap: DEFAULT_FLUSH_CAP,
            seed_request_scale: DEFAULT_SEED_REQUEST_SCALE,
            seeds_per_tick: DEFAULT_SEEDS_PER_TICK,
            uris_per_candidate: DEFAULT_URIS_PER_CANDIDATE,
            gossip_nodes: DEFAULT_GOSSIP_NODES,
            seed_request_fanout: DEFAULT_SEED_REQUEST_FANOUT,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Outbound dialing runs while outbound sessions are under a third of the limit.
    pub fn outbound_allowed(&self, outbound: usize) -> bool {
        outbound * 3 < self.connection_limit
    }

    /// Inbound accepts run while inbound sessions are under two thirds of the limit.
    pub fn inbound_allowed(&self, inbound: usize) -> bool {
        inbound * 3 < self.connection_limit * 2
    }

    /// Churn only runs once outbound sessions exceed a third of the limit.
    pub fn churn_allowed(&self, outbound: usize) -> bool {
        outbound * 3 > self.connection_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_budgets() {
        let config = EngineConfig {
            connection_limit: 9,
            ..Default::default()
        };
        assert!(config.outbound_allowed(2));
        assert!(!config.outbound_allowed(3));
        assert!(config.inbound_allowed(5));
        assert!(!config.inbound_allowed(6));
        assert!(!config.churn_allowed(3));
        assert!(config.churn_allowed(4));
    }

    #[test]
    fn test_zero_limit_admits_nothing() {
        let config = EngineConfig {
            connection_limit: 0,
            ..Default::default()
        };
        assert!(!config.outbound_allowed(0));
        assert!(!config.inbound_allowed(0));
    }
}
