//! # Peer State Table
//!
//! One ephemeral record per peer, created lazily on first reference and
//! discarded when the peer goes idle or the table grows past its capacity.
//!
//! ## Record contents
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `priority` | reputation, clamped to [-128, 128] |
//! | `sent_bytes` / `received_bytes` | cumulative traffic |
//! | `last_pull` | last content frame received from the peer |
//! | `session_id` | binding to the live session, if any |
//! | `pushed_links` | blocks we told the peer we have |
//! | `pulled_links` | blocks the peer told us it has |
//! | `pushed_requests` | blocks we requested from the peer |
//! | `pulled_requests` | blocks the peer requested from us |
//! | `pushed_seed_requests` | signatures we requested |
//! | `pulled_seed_requests` | signatures the peer requested |
//! | `surrounding_nodes` | the peer's self-reported best neighbours |
//!
//! Every set expires entries after a fixed TTL unless refreshed.
//!
//! ## Eviction
//!
//! The table keeps an access-time index (`BTreeMap` keyed by last touch) so
//! the least-recently-touched records are found in O(log n). Which records go
//! is decided by an [`EvictionPolicy`]; records of protected nodes (those
//! holding an open session) are never offered to the policy.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;

use crate::identity::{Key, Node, NodeId};
use crate::ttl::{TtlMap, TtlSet};

pub const MIN_PRIORITY: i32 = -128;
pub const MAX_PRIORITY: i32 = 128;

/// Default TTL of per-peer want/have sets.
pub const DEFAULT_SET_TTL: Duration = Duration::from_secs(30 * 60);

/// Default TTL of a peer's advertised surrounding nodes.
pub const DEFAULT_SURROUNDING_TTL: Duration = Duration::from_secs(10 * 60);

/// Default entry cap of each per-peer set.
pub const DEFAULT_SET_CAPACITY: usize = 8192;

/// Maximum surrounding nodes kept per peer.
pub const MAX_SURROUNDING_NODES: usize = 12;

/// Default number of records in the table.
pub const DEFAULT_TABLE_CAPACITY: usize = 1024;

/// Default idle time after which an unprotected record is dropped.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

#[derive(Clone, Debug)]
pub struct PeerStateConfig {
    pub set_ttl: Duration,
    pub surrounding_ttl: Duration,
    pub set_capacity: usize,
    pub table_capacity: usize,
    pub idle_timeout: Duration,
}

impl Default for PeerStateConfig {
    fn default() -> Self {
        Self {
            set_ttl: DEFAULT_SET_TTL,
            surrounding_ttl: DEFAULT_SURROUNDING_TTL,
            set_capacity: DEFAULT_SET_CAPACITY,
            table_capacity: DEFAULT_TABLE_CAPACITY,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

// ============================================================================
// PeerState
// ============================================================================

#[derive(Debug)]
pub struct PeerState {
    pub node: Node,
    priority: i32,
    pub sent_bytes: u64,
    pub received_bytes: u64,
    pub last_pull: Option<Instant>,
    pub session_id: Option<[u8; 32]>,
    pub pushed_links: TtlSet<Key>,
    pub pulled_links: TtlSet<Key>,
    pub pushed_requests: TtlSet<Key>,
    pub pulled_requests: TtlSet<Key>,
    pub pushed_seed_requests: TtlSet<String>,
    pub pulled_seed_requests: TtlSet<String>,
    surrounding_nodes: TtlMap<NodeId, Node>,
    /// Creation time of the last seed pushed per signature.
    pub pushed_seed_times: TtlMap<String, u64>,
}

impl PeerState {
    pub fn new(node: Node, config: &PeerStateConfig) -> Self {
        let (ttl, cap) = (config.set_ttl, config.set_capacity);
        Self {
            node,
            priority: 0,
            sent_bytes: 0,
            received_bytes: 0,
            last_pull: None,
            session_id: None,
            pushed_links: TtlSet::new(ttl, cap),
            pulled_links: TtlSet::new(ttl, cap),
            pushed_requests: TtlSet::new(ttl, cap),
            pulled_requests: TtlSet::new(ttl, cap),
            pushed_seed_requests: TtlSet::new(ttl, cap),
            pulled_seed_requests: TtlSet::new(ttl, cap),
            surrounding_nodes: TtlMap::new(config.surrounding_ttl, MAX_SURROUNDING_NODES),
            pushed_seed_times: TtlMap::new(ttl, cap),
        }
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Adjust priority by `delta`, saturating at the clamp bounds.
    pub fn add_priority(&mut self, delta: i32) {
        self.priority = self
            .priority
            .saturating_add(delta)
            .clamp(MIN_PRIORITY, MAX_PRIORITY);
    }

    pub fn increment_priority(&mut self) {
        self.add_priority(1);
    }

    pub fn decrement_priority(&mut self) {
        self.add_priority(-1);
    }

    /// Probability of serving one of this peer's requests on a tick:
    /// `min(1, reputation / 256)`. Peers without positive reputation are
    /// never served.
    pub fn serve_probability(&self) -> f64 {
        (self.priority.max(0) as f64 / 256.0).min(1.0)
    }

    /// Replace the advertised neighbour set; at most [`MAX_SURROUNDING_NODES`] kept.
    pub fn set_surrounding_nodes(&mut self, nodes: impl IntoIterator<Item = Node>) {
        self.surrounding_nodes.clear();
        for node in nodes.into_iter().take(MAX_SURROUNDING_NODES) {
            self.surrounding_nodes.insert(node.id, node);
        }
    }

    pub fn surrounding_nodes(&self) -> Vec<Node> {
        self.surrounding_nodes.iter().map(|(_, n)| n.clone()).collect()
    }

    /// Drop expired entries from every set.
    pub fn sweep(&mut self) -> usize {
        self.pushed_links.sweep()
            + self.pulled_links.sweep()
            + self.pushed_requests.sweep()
            + self.pulled_requests.sweep()
            + self.pushed_seed_requests.sweep()
            + self.pulled_seed_requests.sweep()
            + self.surrounding_nodes.sweep()
            + self.pushed_seed_times.sweep()
    }
}

// ============================================================================
// Eviction policy
// ============================================================================

/// Chooses which records leave the table.
pub trait EvictionPolicy: Send + Sync + 'static {
    /// `by_access` yields unprotected records least-recently-touched first,
    /// with their last touch time. `excess` is how many records the table is
    /// over capacity. Returns the ids to evict.
    fn select(
        &self,
        by_access: &mut dyn Iterator<Item = (NodeId, Instant)>,
        now: Instant,
        excess: usize,
    ) -> Vec<NodeId>;
}

/// Evicts idle records, then the least recently touched until within capacity.
#[derive(Debug, Clone)]
pub struct LeastRecentlyTouched {
    pub idle_timeout: Duration,
}

impl EvictionPolicy for LeastRecentlyTouched {
    fn select(
        &self,
        by_access: &mut dyn Iterator<Item = (NodeId, Instant)>,
        now: Instant,
        excess: usize,
    ) -> Vec<NodeId> {
        let mut victims = Vec::new();
        for (id, touched) in by_access {
            let idle = now.saturating_duration_since(touched) >= self.idle_timeout;
            if !idle && victims.len() >= excess {
                break;
            }
            victims.push(id);
        }
        victims
    }
}

// ============================================================================
// PeerStateTable
// ============================================================================

type AccessKey = (Instant, u64);

struct Slot {
    state: PeerState,
    access: AccessKey,
}

pub struct PeerStateTable {
    slots: HashMap<NodeId, Slot>,
    by_access: BTreeMap<AccessKey, NodeId>,
    protected: HashSet<NodeId>,
    seq: u64,
    config: PeerStateConfig,
    policy: Box<dyn EvictionPolicy>,
}

impl PeerStateTable {
    pub fn new(config: PeerStateConfig) -> Self {
        let policy = LeastRecentlyTouched {
            idle_timeout: config.idle_timeout,
        };
        Self::with_policy(config, Box::new(policy))
    }

    pub fn with_policy(config: PeerStateConfig, policy: Box<dyn EvictionPolicy>) -> Self {
        Self {
            slots: HashMap::new(),
            by_access: BTreeMap::new(),
            protected: HashSet::new(),
            seq: 0,
            config,
            policy,
        }
    }

    fn next_access(&mut self) -> AccessKey {
        self.seq += 1;
        (Instant::now(), self.seq)
    }

    fn touch_slot(&mut self, id: &NodeId) {
        let access = self.next_access();
        if let Some(slot) = self.slots.get_mut(id) {
            self.by_access.remove(&slot.access);
            slot.access = access;
            self.by_access.insert(access, *id);
        }
    }

    /// Record for `node`, created if missing. Refreshes the stored descriptor
    /// when `node` carries uris, and counts as a touch.
    pub fn get_or_create(&mut self, node: &Node) -> &mut PeerState {
        if self.slots.contains_key(&node.id) {
            self.touch_slot(&node.id);
        } else {
            self.enforce_capacity(1);
        }

        let config = &self.config;
        let by_access = &mut self.by_access;
        let seq = &mut self.seq;
        let slot = self.slots.entry(node.id).or_insert_with(|| {
            *seq += 1;
            let access = (Instant::now(), *seq);
            by_access.insert(access, node.id);
            Slot {
                state: PeerState::new(node.clone(), config),
                access,
            }
        });
        if !node.uris.is_empty() {
            slot.state.node = node.clone();
        }
        &mut slot.state
    }

    /// Mutable record for `id`; counts as a touch.
    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut PeerState> {
        self.touch_slot(id);
        self.slots.get_mut(id).map(|slot| &mut slot.state)
    }

    /// Read-only lookup that does not count as a touch.
    pub fn get(&self, id: &NodeId) -> Option<&PeerState> {
        self.slots.get(id).map(|slot| &slot.state)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.slots.contains_key(id)
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<PeerState> {
        self.protected.remove(id);
        let slot = self.slots.remove(id)?;
        self.by_access.remove(&slot.access);
        Some(slot.state)
    }

    /// Shield `id` from eviction while it holds an open session.
    pub fn protect(&mut self, id: NodeId) {
        self.protected.insert(id);
    }

    pub fn unprotect(&mut self, id: &NodeId) {
        self.protected.remove(id);
    }

    pub fn is_protected(&self, id: &NodeId) -> bool {
        self.protected.contains(id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.config.table_capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &PeerState)> {
        self.slots.iter().map(|(id, slot)| (id, &slot.state))
    }

    /// Ask the policy for victims so that `reserve` more records fit.
    /// Protected nodes are never offered.
    fn enforce_capacity(&mut self, reserve: usize) -> Vec<NodeId> {
        let excess = (self.slots.len() + reserve).saturating_sub(self.config.table_capacity);
        let protected = &self.protected;
        let mut candidates = self
            .by_access
            .iter()
            .filter(|(_, id)| !protected.contains(*id))
            .map(|((at, _), id)| (*id, *at));
        let victims = self.policy.select(&mut candidates, Instant::now(), excess);
        for id in &victims {
            if !self.protected.contains(id) {
                self.remove(id);
            }
        }
        victims
    }

    /// Expire set entries and evict idle or excess records. Returns evicted ids.
    pub fn sweep(&mut self) -> Vec<NodeId> {
        for slot in self.slots.values_mut() {
            slot.state.sweep();
        }
        self.enforce_capacity(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(i: u8) -> Node {
        Node::new(NodeId::from_bytes([i; 32]), vec![format!("mem:{}", i)])
    }

    fn table(capacity: usize) -> PeerStateTable {
        PeerStateTable::new(PeerStateConfig {
            table_capacity: capacity,
            ..Default::default()
        })
    }

    #[test]
    fn test_priority_is_clamped() {
        let mut state = PeerState::new(node(1), &PeerStateConfig::default());
        for _ in 0..500 {
            state.increment_priority();
        }
        assert_eq!(state.priority(), MAX_PRIORITY);
        state.add_priority(i32::MIN);
        assert_eq!(state.priority(), MIN_PRIORITY);
        state.add_priority(i32::MAX);
        assert_eq!(state.priority(), MAX_PRIORITY);
    }

    #[test]
    fn test_serve_probability_bounds() {
        let mut state = PeerState::new(node(1), &PeerStateConfig::default());
        assert_eq!(state.serve_probability(), 0.0);
        state.add_priority(64);
        assert_eq!(state.serve_probability(), 0.25);
        state.add_priority(-1000);
        assert_eq!(state.priority(), MIN_PRIORITY);
        assert_eq!(state.serve_probability(), 0.0);
        state.add_priority(1000);
        assert_eq!(state.priority(), MAX_PRIORITY);
        assert_eq!(state.serve_probability(), 0.5);
    }

    #[test]
    fn test_surrounding_nodes_capped() {
        let mut state = PeerState::new(node(1), &PeerStateConfig::default());
        state.set_surrounding_nodes((0..30).map(node));
        assert_eq!(state.surrounding_nodes().len(), MAX_SURROUNDING_NODES);
        state.set_surrounding_nodes(vec![node(99)]);
        assert_eq!(state.surrounding_nodes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_creation_and_descriptor_refresh() {
        let mut table = table(8);
        table.get_or_create(&node(1)).increment_priority();
        let bare = Node::new(node(1).id, vec![]);
        assert_eq!(table.get_or_create(&bare).priority(), 1);
        assert_eq!(table.get(&bare.id).unwrap().node.uris, vec!["mem:1"]);
        assert_eq!(table.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicts_least_recently_touched() {
        let mut table = table(2);
        table.get_or_create(&node(1));
        tokio::time::advance(Duration::from_secs(1)).await;
        table.get_or_create(&node(2));
        tokio::time::advance(Duration::from_secs(1)).await;
        table.get_mut(&node(1).id);
        table.get_or_create(&node(3));

        assert!(table.contains(&node(1).id));
        assert!(!table.contains(&node(2).id));
        assert!(table.contains(&node(3).id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_protected_nodes_survive_eviction() {
        let mut table = table(1);
        table.get_or_create(&node(1));
        table.protect(node(1).id);
        table.get_or_create(&node(2));

        // over capacity, but the only candidate is the node just inserted
        assert!(table.contains(&node(1).id));
        assert!(table.contains(&node(2).id));

        table.get_or_create(&node(3));
        assert!(table.contains(&node(1).id));
        assert!(!table.contains(&node(2).id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_drops_idle_records() {
        let mut table = table(16);
        table.get_or_create(&node(1));
        table.get_or_create(&node(2));
        table.protect(node(2).id);
        table
            .get_mut(&node(1).id)
            .unwrap()
            .pulled_requests
            .insert(Key::from_content(b"k"));

        tokio::time::advance(DEFAULT_IDLE_TIMEOUT + Duration::from_secs(1)).await;
        let evicted = table.sweep();
        assert_eq!(evicted, vec![node(1).id]);
        assert!(table.contains(&node(2).id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_policy_is_consulted() {
        struct NeverEvict;
        impl EvictionPolicy for NeverEvict {
            fn select(
                &self,
                _: &mut dyn Iterator<Item = (NodeId, Instant)>,
                _: Instant,
                _: usize,
            ) -> Vec<NodeId> {
                Vec::new()
            }
        }

        let mut table = PeerStateTable::with_policy(
            PeerStateConfig {
                table_capacity: 1,
                ..Default::default()
            },
            Box::new(NeverEvict),
        );
        table.get_or_create(&node(1));
        table.get_or_create(&node(2));
        assert_eq!(table.len(), 2);
    }
}
