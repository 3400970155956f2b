//! Nearest-peer lookup over an in-memory snapshot.
//!
//! Instead of a networked DHT walk, the engine periodically snapshots its
//! connected peers, the surrounding nodes each of them advertised, and their
//! measured response times. A lookup ranks every known candidate (connected
//! peers plus their surrounding nodes) by XOR distance to the target and walks
//! the ranking: a connected candidate is taken as is, any other candidate is
//! replaced by the connected peers that advertised it, fastest first. The
//! result answers "which of my direct peers is closest to X, or best placed
//! to relay towards it".
//!
//! Lookups never touch the network and never take a lock beyond the one
//! guarding the current snapshot.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::identity::NodeId;
use crate::routing::sort_by_distance;

/// One connected peer as seen by the snapshot builder.
#[derive(Clone, Debug)]
pub struct PeerSample {
    pub id: NodeId,
    pub response_time: Option<Duration>,
    pub surrounding: Vec<NodeId>,
}

/// Ascending response time, unmeasured peers last, id as tie-break.
fn response_order(a: (&NodeId, Option<Duration>), b: (&NodeId, Option<Duration>)) -> Ordering {
    match (a.1, b.1) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.0.cmp(b.0))
}

#[derive(Clone, Debug, Default)]
pub struct SearchSnapshot {
    connected: HashMap<NodeId, Option<Duration>>,
    /// Connected peers sorted fastest first.
    ranked: Vec<NodeId>,
    /// Surrounding node -> advertising peers, fastest first.
    relays: HashMap<NodeId, Vec<NodeId>>,
    candidates: Vec<NodeId>,
}

impl SearchSnapshot {
    pub fn build(local_id: NodeId, peers: Vec<PeerSample>) -> Self {
        let connected: HashMap<NodeId, Option<Duration>> = peers
            .iter()
            .filter(|p| p.id != local_id)
            .map(|p| (p.id, p.response_time))
            .collect();

        let mut ranked: Vec<NodeId> = connected.keys().copied().collect();
        ranked.sort_by(|a, b| response_order((a, connected[a]), (b, connected[b])));

        let mut relays: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for peer in peers.iter().filter(|p| connected.contains_key(&p.id)) {
            for surrounding in &peer.surrounding {
                if *surrounding == local_id || *surrounding == peer.id {
                    continue;
                }
                let entry = relays.entry(*surrounding).or_default();
                if !entry.contains(&peer.id) {
                    entry.push(peer.id);
                }
            }
        }
        for advertisers in relays.values_mut() {
            advertisers.sort_by(|a, b| response_order((a, connected[a]), (b, connected[b])));
        }

        let candidates: HashSet<NodeId> = connected
            .keys()
            .chain(relays.keys())
            .copied()
            .collect();

        Self {
            connected,
            ranked,
            relays,
            candidates: candidates.into_iter().collect(),
        }
    }

    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }

    pub fn is_connected(&self, id: &NodeId) -> bool {
        self.connected.contains_key(id)
    }

    pub fn response_time(&self, id: &NodeId) -> Option<Duration> {
        self.connected.get(id).copied().flatten()
    }

    /// Connected peers, fastest first.
    pub fn by_response_time(&self) -> &[NodeId] {
        &self.ranked
    }

    /// Percentile rank of `id` by response time: the fastest of `n` peers
    /// scores 1.0, the slowest `1/n`.
    pub fn response_rank(&self, id: &NodeId) -> Option<f64> {
        let n = self.ranked.len();
        let index = self.ranked.iter().position(|p| p == id)?;
        Some((n - index) as f64 / n as f64)
    }

    /// Up to `k` distinct connected peers nearest to (or best placed to relay
    /// towards) `target`.
    pub fn get_search_nodes(&self, target: &NodeId, k: usize) -> Vec<NodeId> {
        if k == 0 || self.connected.is_empty() {
            return Vec::new();
        }
        let mut ranked = self.candidates.clone();
        sort_by_distance(target, &mut ranked, |id| *id);

        let mut result = Vec::with_capacity(k);
        let mut seen = HashSet::with_capacity(k);
        'walk: for candidate in ranked {
            if self.connected.contains_key(&candidate) {
                if seen.insert(candidate) {
                    result.push(candidate);
                    if result.len() >= k {
                        break 'walk;
                    }
                }
                continue;
            }
            for relay in self.relays.get(&candidate).into_iter().flatten() {
                if seen.insert(*relay) {
                    result.push(*relay);
                    if result.len() >= k {
                        break 'walk;
                    }
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(first: u8) -> NodeId {
        let mut bytes = [0u8; 32];
        bytes[0] = first;
        NodeId::from_bytes(bytes)
    }

    fn sample(peer: NodeId, ms: Option<u64>, surrounding: Vec<NodeId>) -> PeerSample {
        PeerSample {
            id: peer,
            response_time: ms.map(Duration::from_millis),
            surrounding,
        }
    }

    #[test]
    fn test_no_connected_peers_returns_nothing() {
        let snapshot = SearchSnapshot::build(id(0xFF), vec![]);
        assert!(snapshot.get_search_nodes(&id(1), 3).is_empty());
    }

    #[test]
    fn test_connected_peer_returned_directly() {
        let snapshot = SearchSnapshot::build(
            id(0xFF),
            vec![sample(id(0x10), Some(5), vec![]), sample(id(0x80), Some(5), vec![])],
        );
        assert_eq!(snapshot.get_search_nodes(&id(0x11), 1), vec![id(0x10)]);
        assert_eq!(
            snapshot.get_search_nodes(&id(0x11), 5),
            vec![id(0x10), id(0x80)]
        );
    }

    #[test]
    fn test_faster_relay_preferred_for_shared_surrounding_node() {
        let target = id(0x01);
        let slow = id(0x70);
        let fast = id(0x60);
        let snapshot = SearchSnapshot::build(
            id(0xFF),
            vec![
                sample(slow, Some(200), vec![target]),
                sample(fast, Some(20), vec![target]),
            ],
        );
        let found = snapshot.get_search_nodes(&target, 2);
        assert_eq!(found, vec![fast, slow]);
        assert_eq!(snapshot.get_search_nodes(&target, 1), vec![fast]);
    }

    #[test]
    fn test_results_are_distinct_and_bounded() {
        let peers: Vec<PeerSample> = (1..=6u8)
            .map(|i| sample(id(i * 16), Some(i as u64), (1..=12).map(id).collect()))
            .collect();
        let snapshot = SearchSnapshot::build(id(0xFF), peers);
        for k in 0..10 {
            let found = snapshot.get_search_nodes(&id(3), k);
            assert!(found.len() <= k);
            let unique: HashSet<_> = found.iter().collect();
            assert_eq!(unique.len(), found.len());
            assert!(found.iter().all(|p| snapshot.is_connected(p)));
        }
        assert_eq!(snapshot.get_search_nodes(&id(3), 10).len(), 6);
    }

    #[test]
    fn test_unmeasured_relays_rank_last() {
        let target = id(0x02);
        let unmeasured = id(0x40);
        let measured = id(0x50);
        let snapshot = SearchSnapshot::build(
            id(0xFF),
            vec![
                sample(unmeasured, None, vec![target]),
                sample(measured, Some(900), vec![target]),
            ],
        );
        assert_eq!(snapshot.get_search_nodes(&target, 1), vec![measured]);
    }

    #[test]
    fn test_local_id_never_candidate() {
        let local = id(0x01);
        let peer = id(0x80);
        let snapshot = SearchSnapshot::build(local, vec![sample(peer, Some(1), vec![local])]);
        assert_eq!(snapshot.get_search_nodes(&local, 3), vec![peer]);
    }

    #[test]
    fn test_response_rank() {
        let snapshot = SearchSnapshot::build(
            id(0xFF),
            vec![
                sample(id(1), Some(10), vec![]),
                sample(id(2), Some(30), vec![]),
                sample(id(3), None, vec![]),
                sample(id(4), Some(20), vec![]),
            ],
        );
        assert_eq!(snapshot.by_response_time(), &[id(1), id(4), id(2), id(3)]);
        assert_eq!(snapshot.response_rank(&id(1)), Some(1.0));
        assert_eq!(snapshot.response_rank(&id(3)), Some(0.25));
        assert_eq!(snapshot.response_rank(&id(9)), None);
    }
}
