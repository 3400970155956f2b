//! # Routing Table
//!
//! Distance-ranked view of known peers, relative to the local node id.
//!
//! ## Structure
//!
//! 256 buckets indexed by the first differing bit between a node id and the
//! local id. Each bucket holds at most `k` nodes ordered oldest-first; a
//! refresh moves a node to the back.
//!
//! ## Insertion paths
//!
//! | Call | Source | When the bucket is full |
//! |------|--------|-------------------------|
//! | [`Router::live`] | second-hand gossip | ignored |
//! | [`Router::add`] | post-handshake, directly verified | oldest entry evicted |
//!
//! Both paths only accept nodes with at least one uri passing the
//! [`UriFilter`], and strip the uris that do not.
//!
//! ## Minimum population
//!
//! While the table holds `min_population` nodes or fewer, removals are
//! suppressed so a burst of failures cannot starve the table.

use std::collections::BinaryHeap;
use std::net::IpAddr;

use crate::identity::{Node, NodeId, distance_cmp};
use crate::transport::TCP_SCHEME;

/// Number of buckets (one per bit of the id).
pub const BUCKET_COUNT: usize = 256;

/// Default nodes per bucket.
pub const DEFAULT_BUCKET_SIZE: usize = 20;

/// Default population below which removals are suppressed.
pub const DEFAULT_MIN_POPULATION: usize = 20;

fn bucket_index(self_id: &NodeId, other: &NodeId) -> usize {
    let dist = self_id.xor_distance(other);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    BUCKET_COUNT - 1
}

/// Sort `candidates` by ascending XOR distance to `target`.
///
/// Ties (identical ids) keep their input order.
pub fn sort_by_distance<T>(target: &NodeId, candidates: &mut [T], id_of: impl Fn(&T) -> NodeId) {
    candidates.sort_by(|a, b| {
        let da = target.xor_distance(&id_of(a));
        let db = target.xor_distance(&id_of(b));
        distance_cmp(&da, &db)
    });
}

// ============================================================================
// Buckets
// ============================================================================

#[derive(Debug, Default)]
struct RoutingBucket {
    nodes: Vec<Node>,
}

enum TouchOutcome {
    Inserted,
    Refreshed,
    Full,
}

impl RoutingBucket {
    fn touch(&mut self, node: Node, k: usize) -> TouchOutcome {
        if let Some(pos) = self.nodes.iter().position(|n| n.id == node.id) {
            let existing = self.nodes.remove(pos);
            let updated = if node.uris.is_empty() { existing } else { node };
            self.nodes.push(updated);
            return TouchOutcome::Refreshed;
        }
        if self.nodes.len() < k {
            self.nodes.push(node);
            TouchOutcome::Inserted
        } else {
            TouchOutcome::Full
        }
    }

    fn remove(&mut self, id: &NodeId) -> bool {
        if let Some(pos) = self.nodes.iter().position(|n| &n.id == id) {
            self.nodes.remove(pos);
            true
        } else {
            false
        }
    }
}

// ============================================================================
// RoutingTable
// ============================================================================

#[derive(Debug)]
pub struct RoutingTable {
    self_id: NodeId,
    k: usize,
    min_population: usize,
    buckets: Vec<RoutingBucket>,
    len: usize,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, k: usize, min_population: usize) -> Self {
        let mut buckets = Vec::with_capacity(BUCKET_COUNT);
        buckets.resize_with(BUCKET_COUNT, RoutingBucket::default);
        Self {
            self_id,
            k: k.max(1),
            min_population,
            buckets,
            len: 0,
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Refresh `node`, inserting it only if its bucket has room.
    pub fn live(&mut self, node: Node) -> bool {
        if node.id == self.self_id {
            return false;
        }
        let idx = bucket_index(&self.self_id, &node.id);
        match self.buckets[idx].touch(node, self.k) {
            TouchOutcome::Inserted => {
                self.len += 1;
                true
            }
            TouchOutcome::Refreshed => true,
            TouchOutcome::Full => false,
        }
    }

    /// Refresh or insert `node`, evicting the bucket's oldest entry if full.
    pub fn add(&mut self, node: Node) -> bool {
        if node.id == self.self_id {
            return false;
        }
        let idx = bucket_index(&self.self_id, &node.id);
        let bucket = &mut self.buckets[idx];
        match bucket.touch(node.clone(), self.k) {
            TouchOutcome::Inserted => self.len += 1,
            TouchOutcome::Refreshed => {}
            TouchOutcome::Full => {
                bucket.nodes.remove(0);
                bucket.nodes.push(node);
            }
        }
        true
    }

    /// Remove `id` unless the table is at or below its minimum population.
    pub fn remove(&mut self, id: &NodeId) -> bool {
        if self.len <= self.min_population {
            return false;
        }
        let idx = bucket_index(&self.self_id, id);
        if self.buckets[idx].remove(id) {
            self.len -= 1;
            true
        } else {
            false
        }
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        if *id == self.self_id {
            return None;
        }
        let idx = bucket_index(&self.self_id, id);
        self.buckets[idx].nodes.iter().find(|n| &n.id == id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.get(id).is_some()
    }

    /// Snapshot of every node.
    pub fn all(&self) -> Vec<Node> {
        self.buckets
            .iter()
            .flat_map(|b| b.nodes.iter().cloned())
            .collect()
    }

    /// The `k` nodes closest to `target`, nearest first.
    pub fn closest(&self, target: &NodeId, k: usize) -> Vec<Node> {
        if k == 0 {
            return Vec::new();
        }

        #[derive(Eq, PartialEq)]
        struct DistNode {
            dist: [u8; 32],
            node: Node,
        }

        impl Ord for DistNode {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                distance_cmp(&self.dist, &other.dist)
            }
        }

        impl PartialOrd for DistNode {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut heap: BinaryHeap<DistNode> = BinaryHeap::with_capacity(k + 1);
        for node in self.buckets.iter().flat_map(|b| b.nodes.iter()) {
            let dist = node.id.xor_distance(target);
            if heap.len() < k {
                heap.push(DistNode {
                    dist,
                    node: node.clone(),
                });
            } else if let Some(max_entry) = heap.peek()
                && distance_cmp(&dist, &max_entry.dist) == std::cmp::Ordering::Less
            {
                heap.push(DistNode {
                    dist,
                    node: node.clone(),
                });
                heap.pop();
            }
        }

        let mut result: Vec<Node> = heap.into_iter().map(|d| d.node).collect();
        sort_by_distance(target, &mut result, |n| n.id);
        result
    }
}

// ============================================================================
// Destination filter
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterAction {
    Allow,
    Deny,
}

/// One wildcard rule. `*` matches any run of characters, `?` exactly one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UriRule {
    pub pattern: String,
    pub action: FilterAction,
}

impl UriRule {
    pub fn allow(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            action: FilterAction::Allow,
        }
    }

    pub fn deny(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            action: FilterAction::Deny,
        }
    }
}

fn wildcard_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == b'*')
}

/// IP literal carried by a `tcp:` uri, if any.
fn uri_ip(uri: &str) -> Option<IpAddr> {
    let rest = uri.strip_prefix(TCP_SCHEME)?;
    let host = if let Some(stripped) = rest.strip_prefix('[') {
        &stripped[..stripped.find(']')?]
    } else if let Some(colon) = rest.rfind(':') {
        &rest[..colon]
    } else {
        rest
    };
    host.parse().ok()
}

/// Private, loopback, link-local, broadcast or unspecified addresses.
pub fn is_non_routable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => {
            ip.is_private()
                || ip.is_loopback()
                || ip.is_link_local()
                || ip.is_broadcast()
                || ip.is_unspecified()
        }
        IpAddr::V6(ip) => {
            ip.is_loopback()
                || ip.is_unspecified()
                || (ip.segments()[0] & 0xfe00) == 0xfc00 // fc00::/7
                || (ip.segments()[0] & 0xffc0) == 0xfe80 // fe80::/10
        }
    }
}

/// Destination allow/deny filter applied to every uri we store or dial.
///
/// Rules are evaluated in order and the first match decides. A uri matching
/// no rule is allowed. Non-routable IP literals are rejected before rules
/// are consulted when `reject_non_routable` is set.
#[derive(Clone, Debug)]
pub struct UriFilter {
    pub rules: Vec<UriRule>,
    pub reject_non_routable: bool,
}

impl Default for UriFilter {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            reject_non_routable: true,
        }
    }
}

impl UriFilter {
    /// Accepts everything, including loopback. Local testing only.
    pub fn permissive() -> Self {
        Self {
            rules: Vec::new(),
            reject_non_routable: false,
        }
    }

    pub fn with_rule(mut self, rule: UriRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn allows(&self, uri: &str) -> bool {
        if uri.is_empty() {
            return false;
        }
        if self.reject_non_routable && uri_ip(uri).is_some_and(|ip| is_non_routable(&ip)) {
            return false;
        }
        self.rules
            .iter()
            .find(|rule| wildcard_match(rule.pattern.as_bytes(), uri.as_bytes()))
            .is_none_or(|rule| rule.action == FilterAction::Allow)
    }
}

// ============================================================================
// Router
// ============================================================================

/// Routing table plus destination filtering.
#[derive(Debug)]
pub struct Router {
    table: RoutingTable,
    filter: UriFilter,
}

impl Router {
    pub fn new(self_id: NodeId, k: usize, min_population: usize, filter: UriFilter) -> Self {
        Self {
            table: RoutingTable::new(self_id, k, min_population),
            filter,
        }
    }

    pub fn filter(&self) -> &UriFilter {
        &self.filter
    }

    /// `node` with only the uris passing the filter, or `None` if none do.
    pub fn reachable(&self, node: &Node) -> Option<Node> {
        if !node.validate_structure() {
            return None;
        }
        let uris: Vec<String> = node
            .uris
            .iter()
            .filter(|uri| self.filter.allows(uri))
            .cloned()
            .collect();
        if uris.is_empty() {
            return None;
        }
        Some(Node::new(node.id, uris))
    }

    /// Second-hand sighting: refresh recency without validating reachability.
    pub fn live(&mut self, node: &Node) -> bool {
        match self.reachable(node) {
            Some(node) => self.table.live(node),
            None => false,
        }
    }

    /// Directly verified peer.
    pub fn add(&mut self, node: &Node) -> bool {
        match self.reachable(node) {
            Some(node) => self.table.add(node),
            None => false,
        }
    }

    pub fn remove(&mut self, id: &NodeId) -> bool {
        self.table.remove(id)
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.table.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.table.contains(id)
    }

    pub fn all(&self) -> Vec<Node> {
        self.table.all()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn closest(&self, target: &NodeId, k: usize) -> Vec<Node> {
        self.table.closest(target, k)
    }

    /// `candidates` ordered by ascending distance to `target`.
    pub fn sort(&self, target: &NodeId, mut candidates: Vec<Node>) -> Vec<Node> {
        sort_by_distance(target, &mut candidates, |n| n.id);
        candidates
    }
}
