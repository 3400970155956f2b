//! Reconnect candidates, blacklist and abnormal-close strikes.
//!
//! - *Reconnect candidates*: recently disconnected peers worth dialing again
//!   (short TTL). Outbound workers try these before random table members.
//! - *Blacklist*: peers excluded from routing and reconnects (medium TTL).
//! - *Strikes*: consecutive abnormal closes per peer. Reaching the limit
//!   blacklists the peer; any successful pull resets the count.

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;

use crate::identity::{Node, NodeId};
use crate::ttl::{TtlMap, TtlSet};

pub const DEFAULT_RECONNECT_TTL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_BLACKLIST_TTL: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_STRIKE_LIMIT: u32 = 3;

/// Maximum peers tracked in each set.
/// SECURITY: bounds memory under identity churn.
pub const DEFAULT_MAX_TRACKED: usize = 4096;

#[derive(Clone, Debug)]
pub struct ReputationConfig {
    pub reconnect_ttl: Duration,
    pub blacklist_ttl: Duration,
    pub strike_limit: u32,
    pub max_tracked: usize,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            reconnect_ttl: DEFAULT_RECONNECT_TTL,
            blacklist_ttl: DEFAULT_BLACKLIST_TTL,
            strike_limit: DEFAULT_STRIKE_LIMIT,
            max_tracked: DEFAULT_MAX_TRACKED,
        }
    }
}

pub struct Reputation {
    reconnect: TtlMap<NodeId, Node>,
    blacklist: TtlSet<NodeId>,
    strikes: LruCache<NodeId, u32>,
    strike_limit: u32,
}

impl Reputation {
    pub fn new(config: &ReputationConfig) -> Self {
        let tracked = NonZeroUsize::new(config.max_tracked).unwrap_or(NonZeroUsize::MIN);
        Self {
            reconnect: TtlMap::new(config.reconnect_ttl, config.max_tracked),
            blacklist: TtlSet::new(config.blacklist_ttl, config.max_tracked),
            strikes: LruCache::new(tracked),
            strike_limit: config.strike_limit.max(1),
        }
    }

    pub fn add_reconnect_candidate(&mut self, node: Node) {
        if !self.blacklist.contains(&node.id) {
            self.reconnect.insert(node.id, node);
        }
    }

    pub fn remove_reconnect_candidate(&mut self, id: &NodeId) {
        self.reconnect.remove(id);
    }

    pub fn reconnect_candidates(&self) -> Vec<Node> {
        self.reconnect.iter().map(|(_, n)| n.clone()).collect()
    }

    pub fn blacklist(&mut self, id: NodeId) {
        self.reconnect.remove(&id);
        self.strikes.pop(&id);
        self.blacklist.insert(id);
    }

    pub fn is_blacklisted(&self, id: &NodeId) -> bool {
        self.blacklist.contains(id)
    }

    pub fn blacklist_len(&self) -> usize {
        self.blacklist.len()
    }

    /// Count one abnormal close. Returns true if this strike blacklisted the peer.
    pub fn record_abnormal_close(&mut self, id: NodeId) -> bool {
        let strikes = self.strikes.get_or_insert_mut(id, || 0);
        *strikes += 1;
        if *strikes >= self.strike_limit {
            self.blacklist(id);
            true
        } else {
            false
        }
    }

    pub fn clear_strikes(&mut self, id: &NodeId) {
        self.strikes.pop(id);
    }

    pub fn strikes(&self, id: &NodeId) -> u32 {
        self.strikes.peek(id).copied().unwrap_or(0)
    }

    pub fn sweep(&mut self) {
        self.reconnect.sweep();
        self.blacklist.sweep();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(i: u8) -> Node {
        Node::new(NodeId::from_bytes([i; 32]), vec![format!("mem:{}", i)])
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_strikes_blacklist() {
        let mut rep = Reputation::new(&ReputationConfig::default());
        let id = node(1).id;
        rep.add_reconnect_candidate(node(1));

        assert!(!rep.record_abnormal_close(id));
        assert!(!rep.record_abnormal_close(id));
        assert!(rep.record_abnormal_close(id));
        assert!(rep.is_blacklisted(&id));
        assert!(rep.reconnect_candidates().is_empty());
        assert_eq!(rep.strikes(&id), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_pull_resets_strikes() {
        let mut rep = Reputation::new(&ReputationConfig::default());
        let id = node(1).id;
        rep.record_abnormal_close(id);
        rep.record_abnormal_close(id);
        rep.clear_strikes(&id);
        assert!(!rep.record_abnormal_close(id));
        assert!(!rep.is_blacklisted(&id));
        assert_eq!(rep.strikes(&id), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blacklist_expires() {
        let mut rep = Reputation::new(&ReputationConfig::default());
        rep.blacklist(node(1).id);
        rep.add_reconnect_candidate(node(1));
        assert!(rep.reconnect_candidates().is_empty());

        tokio::time::advance(DEFAULT_BLACKLIST_TTL + Duration::from_secs(1)).await;
        rep.sweep();
        assert!(!rep.is_blacklisted(&node(1).id));
        assert_eq!(rep.blacklist_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_candidates_expire() {
        let mut rep = Reputation::new(&ReputationConfig::default());
        rep.add_reconnect_candidate(node(2));
        assert_eq!(rep.reconnect_candidates(), vec![node(2)]);
        tokio::time::advance(DEFAULT_RECONNECT_TTL + Duration::from_secs(1)).await;
        assert!(rep.reconnect_candidates().is_empty());
    }
}
