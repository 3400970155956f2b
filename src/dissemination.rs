//! # Dissemination Planning
//!
//! The scheduler turns local want/have sets into per-peer work; each peer's
//! worker later drains its share on its own cadence.
//!
//! | Plan | Source | Destination |
//! |------|--------|-------------|
//! | upload | upload keys, diffusion keys | 1 nearest connected peer |
//! | seed offer | published signatures | `fanout` nearest connected peers |
//! | advertise | cached keys not yet advertised | 1 nearest connected peer |
//! | request | wanted keys, keys peers asked us for | a peer that has it, else 1 nearest |
//! | seed request | wanted signatures (local + relayed) | `fanout` nearest connected peers |
//!
//! Planning reads only in-memory snapshots: no network I/O, no store calls.

use std::collections::{HashMap, HashSet};

use rand::seq::SliceRandom;

use crate::identity::{Key, NodeId, signature_target};
use crate::peer_state::PeerStateTable;
use crate::search::SearchSnapshot;

// ============================================================================
// Assignments
// ============================================================================

/// Work queued for one peer.
#[derive(Debug, Default, Clone)]
pub struct Assignment {
    /// Blocks to push.
    pub upload: HashSet<Key>,
    /// Blocks to advertise.
    pub links: HashSet<Key>,
    /// Blocks to request.
    pub requests: HashSet<Key>,
    /// Signatures to request.
    pub seed_requests: HashSet<String>,
}

impl Assignment {
    pub fn is_empty(&self) -> bool {
        self.upload.is_empty()
            && self.links.is_empty()
            && self.requests.is_empty()
            && self.seed_requests.is_empty()
    }
}

fn drain_up_to<T: Clone + Eq + std::hash::Hash>(set: &mut HashSet<T>, cap: usize) -> Vec<T> {
    let taken: Vec<T> = set.iter().take(cap).cloned().collect();
    for item in &taken {
        set.remove(item);
    }
    taken
}

/// Per-peer assignment queues. Only connected peers hold an entry; removing a
/// peer discards everything queued for it.
#[derive(Debug, Default)]
pub struct Assignments {
    peers: HashMap<NodeId, Assignment>,
}

impl Assignments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer: &NodeId) -> Option<&Assignment> {
        self.peers.get(peer)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn assign_upload(&mut self, peer: NodeId, key: Key) -> bool {
        self.peers.entry(peer).or_default().upload.insert(key)
    }

    pub fn assign_link(&mut self, peer: NodeId, key: Key) -> bool {
        self.peers.entry(peer).or_default().links.insert(key)
    }

    pub fn assign_request(&mut self, peer: NodeId, key: Key) -> bool {
        self.peers.entry(peer).or_default().requests.insert(key)
    }

    pub fn assign_seed_request(&mut self, peer: NodeId, signature: String) -> bool {
        self.peers
            .entry(peer)
            .or_default()
            .seed_requests
            .insert(signature)
    }

    pub fn is_request_assigned(&self, key: &Key) -> bool {
        self.peers.values().any(|a| a.requests.contains(key))
    }

    /// One queued upload key for `peer`, chosen at random.
    pub fn pick_upload(&self, peer: &NodeId) -> Option<Key> {
        let upload = &self.peers.get(peer)?.upload;
        let keys: Vec<&Key> = upload.iter().collect();
        keys.choose(&mut rand::thread_rng()).map(|k| (*k).clone())
    }

    pub fn remove_upload(&mut self, peer: &NodeId, key: &Key) -> bool {
        self.peers
            .get_mut(peer)
            .is_some_and(|a| a.upload.remove(key))
    }

    pub fn drain_links(&mut self, peer: &NodeId, cap: usize) -> Vec<Key> {
        self.peers
            .get_mut(peer)
            .map(|a| drain_up_to(&mut a.links, cap))
            .unwrap_or_default()
    }

    pub fn drain_requests(&mut self, peer: &NodeId, cap: usize) -> Vec<Key> {
        self.peers
            .get_mut(peer)
            .map(|a| drain_up_to(&mut a.requests, cap))
            .unwrap_or_default()
    }

    pub fn drain_seed_requests(&mut self, peer: &NodeId, cap: usize) -> Vec<String> {
        self.peers
            .get_mut(peer)
            .map(|a| drain_up_to(&mut a.seed_requests, cap))
            .unwrap_or_default()
    }

    /// Discard everything queued for a disconnected peer.
    pub fn remove_peer(&mut self, peer: &NodeId) -> Option<Assignment> {
        self.peers.remove(peer)
    }

    /// Drop entries of peers no longer connected.
    pub fn retain_connected(&mut self, snapshot: &SearchSnapshot) {
        self.peers.retain(|id, _| snapshot.is_connected(id));
    }
}

/// Seed requests flushed to a peer: `scale` for the fastest peer, scaled
/// down by response-time rank, at least one.
pub fn seed_request_cap(rank: Option<f64>, scale: usize) -> usize {
    let rank = rank.unwrap_or(0.0).clamp(0.0, 1.0);
    ((scale as f64 * rank).ceil() as usize).max(1)
}

fn sample<T: Clone>(items: &[T], cap: usize) -> Vec<T> {
    if items.len() <= cap {
        return items.to_vec();
    }
    items
        .choose_multiple(&mut rand::thread_rng(), cap)
        .cloned()
        .collect()
}

// ============================================================================
// Upload planning
// ============================================================================

#[derive(Debug, Default)]
pub struct UploadPlan {
    pub uploads: Vec<(NodeId, Key)>,
    /// Published signatures to offer; applied as if the peer had asked.
    pub seed_offers: Vec<(NodeId, String)>,
}

pub struct UploadInput<'a> {
    pub snapshot: &'a SearchSnapshot,
    pub upload_keys: &'a [Key],
    pub diffusion_keys: &'a [Key],
    pub published_signatures: &'a [String],
    pub upload_batch: usize,
    pub diffusion_batch: usize,
    pub fanout: usize,
}

pub fn plan_uploads(input: UploadInput<'_>) -> UploadPlan {
    let mut plan = UploadPlan::default();
    if input.snapshot.connected_count() == 0 {
        return plan;
    }

    let keys = sample(input.upload_keys, input.upload_batch)
        .into_iter()
        .chain(sample(input.diffusion_keys, input.diffusion_batch));
    for key in keys {
        if let Some(peer) = input
            .snapshot
            .get_search_nodes(&key.target_id(), 1)
            .into_iter()
            .next()
        {
            plan.uploads.push((peer, key));
        }
    }

    for signature in input.published_signatures {
        let target = signature_target(signature);
        for peer in input.snapshot.get_search_nodes(&target, input.fanout) {
            plan.seed_offers.push((peer, signature.clone()));
        }
    }
    plan
}

// ============================================================================
// Download planning
// ============================================================================

#[derive(Debug, Default)]
pub struct DownloadPlan {
    pub links: Vec<(NodeId, Key)>,
    pub requests: Vec<(NodeId, Key)>,
    pub seed_requests: Vec<(NodeId, String)>,
}

pub struct DownloadInput<'a> {
    pub snapshot: &'a SearchSnapshot,
    pub peers: &'a PeerStateTable,
    pub assignments: &'a Assignments,
    /// Keys held by the local store.
    pub cached: &'a HashSet<Key>,
    /// Keys the local node wants.
    pub wanted: &'a [Key],
    /// Signatures the local node wants.
    pub wanted_signatures: &'a [String],
    /// Signatures held locally; relayed wants for these are skipped.
    pub known_signatures: &'a HashSet<String>,
    pub per_source: usize,
    pub signature_batch: usize,
    pub fanout: usize,
}

pub fn plan_downloads(input: DownloadInput<'_>) -> DownloadPlan {
    let mut plan = DownloadPlan::default();
    let snapshot = input.snapshot;
    if snapshot.connected_count() == 0 {
        return plan;
    }
    let connected: Vec<NodeId> = snapshot.by_response_time().to_vec();

    // advertise
    let cached: Vec<Key> = input.cached.iter().cloned().collect();
    for key in sample(&cached, input.per_source) {
        let Some(peer) = snapshot.get_search_nodes(&key.target_id(), 1).into_iter().next() else {
            continue;
        };
        let already = input
            .peers
            .get(&peer)
            .is_some_and(|state| state.pushed_links.contains(&key));
        if !already {
            plan.links.push((peer, key));
        }
    }

    // request: local wants, then keys peers asked us for
    let local: Vec<Key> = input
        .wanted
        .iter()
        .filter(|k| !input.cached.contains(*k))
        .cloned()
        .collect();
    let relayed: Vec<Key> = connected
        .iter()
        .filter_map(|id| input.peers.get(id))
        .flat_map(|state| state.pulled_requests.iter())
        .filter(|k| !input.cached.contains(*k))
        .cloned()
        .collect::<HashSet<Key>>()
        .into_iter()
        .collect();

    let mut planned: HashSet<Key> = HashSet::new();
    for key in sample(&local, input.per_source)
        .into_iter()
        .chain(sample(&relayed, input.per_source))
    {
        if planned.contains(&key) || input.assignments.is_request_assigned(&key) {
            continue;
        }
        let requested = connected.iter().any(|id| {
            input
                .peers
                .get(id)
                .is_some_and(|state| state.pushed_requests.contains(&key))
        });
        if requested {
            continue;
        }
        let holder = connected.iter().copied().find(|id| {
            input
                .peers
                .get(id)
                .is_some_and(|state| state.pulled_links.contains(&key))
        });
        let peer = holder.or_else(|| {
            snapshot
                .get_search_nodes(&key.target_id(), 1)
                .into_iter()
                .next()
        });
        if let Some(peer) = peer {
            planned.insert(key.clone());
            plan.requests.push((peer, key));
        }
    }

    // seed requests
    let mut signatures: Vec<String> = input.wanted_signatures.to_vec();
    let mut seen: HashSet<String> = signatures.iter().cloned().collect();
    for state in connected.iter().filter_map(|id| input.peers.get(id)) {
        for signature in state.pulled_seed_requests.iter() {
            if !input.known_signatures.contains(signature) && seen.insert(signature.clone()) {
                signatures.push(signature.clone());
            }
        }
    }
    for signature in sample(&signatures, input.signature_batch) {
        let target = signature_target(&signature);
        for peer in snapshot.get_search_nodes(&target, input.fanout) {
            let already = input
                .peers
                .get(&peer)
                .is_some_and(|state| state.pushed_seed_requests.contains(&signature));
            if !already {
                plan.seed_requests.push((peer, signature.clone()));
            }
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Node;
    use crate::peer_state::PeerStateConfig;
    use crate::search::PeerSample;
    use std::time::Duration;

    fn node(i: u8) -> Node {
        Node::new(NodeId::from_bytes([i; 32]), vec![format!("mem:{}", i)])
    }

    fn snapshot(ids: &[u8]) -> SearchSnapshot {
        let peers = ids
            .iter()
            .map(|i| PeerSample {
                id: node(*i).id,
                response_time: Some(Duration::from_millis(*i as u64)),
                surrounding: vec![],
            })
            .collect();
        SearchSnapshot::build(node(0xEE).id, peers)
    }

    fn table(ids: &[u8]) -> PeerStateTable {
        let mut table = PeerStateTable::new(PeerStateConfig::default());
        for i in ids {
            table.get_or_create(&node(*i));
        }
        table
    }

    #[test]
    fn test_assignment_queues_dedupe_and_drain() {
        let mut a = Assignments::new();
        let peer = node(1).id;
        let key = Key::from_content(b"k");
        assert!(a.assign_link(peer, key.clone()));
        assert!(!a.assign_link(peer, key.clone()));
        for i in 0..10u8 {
            a.assign_request(peer, Key::from_content(&[i]));
        }
        assert!(a.is_request_assigned(&Key::from_content(&[3])));

        assert_eq!(a.drain_links(&peer, 5), vec![key]);
        assert_eq!(a.drain_requests(&peer, 4).len(), 4);
        assert_eq!(a.drain_requests(&peer, 100).len(), 6);
        assert!(a.drain_requests(&peer, 100).is_empty());
        assert!(a.drain_links(&node(9).id, 5).is_empty());
    }

    #[test]
    fn test_removed_peer_loses_uploads() {
        let mut a = Assignments::new();
        let peer = node(1).id;
        let key = Key::from_content(b"up");
        a.assign_upload(peer, key.clone());
        assert_eq!(a.pick_upload(&peer), Some(key.clone()));
        assert!(a.remove_upload(&peer, &key));
        assert!(!a.remove_upload(&peer, &key));

        a.assign_upload(peer, key.clone());
        a.remove_peer(&peer);
        assert_eq!(a.pick_upload(&peer), None);
    }

    #[test]
    fn test_retain_connected() {
        let mut a = Assignments::new();
        a.assign_link(node(1).id, Key::from_content(b"a"));
        a.assign_link(node(2).id, Key::from_content(b"b"));
        a.retain_connected(&snapshot(&[2]));
        assert!(a.get(&node(1).id).is_none());
        assert!(a.get(&node(2).id).is_some());
    }

    #[test]
    fn test_seed_request_cap_scales_with_rank() {
        assert_eq!(seed_request_cap(Some(1.0), 128), 128);
        assert_eq!(seed_request_cap(Some(0.5), 128), 64);
        assert_eq!(seed_request_cap(Some(0.001), 128), 1);
        assert_eq!(seed_request_cap(None, 128), 1);
    }

    #[test]
    fn test_upload_plan_without_peers_is_empty() {
        let keys = vec![Key::from_content(b"a")];
        let plan = plan_uploads(UploadInput {
            snapshot: &SearchSnapshot::default(),
            upload_keys: &keys,
            diffusion_keys: &[],
            published_signatures: &["sig".to_string()],
            upload_batch: 10,
            diffusion_batch: 10,
            fanout: 2,
        });
        assert!(plan.uploads.is_empty());
        assert!(plan.seed_offers.is_empty());
    }

    #[test]
    fn test_upload_plan_routes_each_key_once() {
        let snap = snapshot(&[1, 2, 3]);
        let keys: Vec<Key> = (0..20u8).map(|i| Key::from_content(&[i])).collect();
        let plan = plan_uploads(UploadInput {
            snapshot: &snap,
            upload_keys: &keys[..10],
            diffusion_keys: &keys[10..],
            published_signatures: &["sig".to_string()],
            upload_batch: 5,
            diffusion_batch: 100,
            fanout: 2,
        });
        assert_eq!(plan.uploads.len(), 15);
        assert!(plan.uploads.iter().all(|(p, _)| snap.is_connected(p)));
        assert_eq!(plan.seed_offers.len(), 2);
        assert_ne!(plan.seed_offers[0].0, plan.seed_offers[1].0);
    }

    #[test]
    fn test_download_plan_prefers_peer_holding_key() {
        let snap = snapshot(&[1, 2, 3]);
        let mut peers = table(&[1, 2, 3]);
        let wanted = Key::from_content(b"wanted");
        peers
            .get_mut(&node(3).id)
            .unwrap()
            .pulled_links
            .insert(wanted.clone());

        let plan = plan_downloads(DownloadInput {
            snapshot: &snap,
            peers: &peers,
            assignments: &Assignments::new(),
            cached: &HashSet::new(),
            wanted: std::slice::from_ref(&wanted),
            wanted_signatures: &[],
            known_signatures: &HashSet::new(),
            per_source: 256,
            signature_batch: 128,
            fanout: 2,
        });
        assert_eq!(plan.requests, vec![(node(3).id, wanted)]);
    }

    #[test]
    fn test_download_plan_skips_requested_and_cached() {
        let snap = snapshot(&[1, 2]);
        let mut peers = table(&[1, 2]);
        let requested = Key::from_content(b"requested");
        let cached_key = Key::from_content(b"cached");
        peers
            .get_mut(&node(1).id)
            .unwrap()
            .pushed_requests
            .insert(requested.clone());
        let cached: HashSet<Key> = [cached_key.clone()].into_iter().collect();

        let plan = plan_downloads(DownloadInput {
            snapshot: &snap,
            peers: &peers,
            assignments: &Assignments::new(),
            cached: &cached,
            wanted: &[requested, cached_key.clone()],
            wanted_signatures: &[],
            known_signatures: &HashSet::new(),
            per_source: 256,
            signature_batch: 128,
            fanout: 2,
        });
        assert!(plan.requests.is_empty());
        // the cached key is advertised instead
        assert_eq!(plan.links.len(), 1);
        assert_eq!(plan.links[0].1, cached_key);
    }

    #[test]
    fn test_download_plan_does_not_readvertise() {
        let snap = snapshot(&[1]);
        let mut peers = table(&[1]);
        let key = Key::from_content(b"have");
        peers
            .get_mut(&node(1).id)
            .unwrap()
            .pushed_links
            .insert(key.clone());
        let cached: HashSet<Key> = [key].into_iter().collect();
        let plan = plan_downloads(DownloadInput {
            snapshot: &snap,
            peers: &peers,
            assignments: &Assignments::new(),
            cached: &cached,
            wanted: &[],
            wanted_signatures: &[],
            known_signatures: &HashSet::new(),
            per_source: 256,
            signature_batch: 128,
            fanout: 2,
        });
        assert!(plan.links.is_empty());
    }

    #[test]
    fn test_download_plan_relays_seed_wants() {
        let snap = snapshot(&[1, 2, 3]);
        let mut peers = table(&[1, 2, 3]);
        peers
            .get_mut(&node(2).id)
            .unwrap()
            .pulled_seed_requests
            .insert("relayed".to_string());
        peers
            .get_mut(&node(3).id)
            .unwrap()
            .pulled_seed_requests
            .insert("known".to_string());
        let known: HashSet<String> = ["known".to_string()].into_iter().collect();

        let plan = plan_downloads(DownloadInput {
            snapshot: &snap,
            peers: &peers,
            assignments: &Assignments::new(),
            cached: &HashSet::new(),
            wanted: &[],
            wanted_signatures: &["local".to_string()],
            known_signatures: &known,
            per_source: 256,
            signature_batch: 128,
            fanout: 2,
        });
        let signatures: HashSet<&str> = plan
            .seed_requests
            .iter()
            .map(|(_, s)| s.as_str())
            .collect();
        assert_eq!(signatures, ["local", "relayed"].into_iter().collect());
        assert_eq!(plan.seed_requests.len(), 4);
    }
}
