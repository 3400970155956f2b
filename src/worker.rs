//! # Per-Peer Worker
//!
//! One [`Scheduler`] per admitted session, scoped to the session's
//! cancellation token so closing the session stops its worker.
//!
//! | Task | Cadence | Gate |
//! |------|---------|------|
//! | liveness | `poll_interval` | none |
//! | node gossip | `node_gossip_interval` | none |
//! | queue flush | `queue_flush_interval` | connected >= download lower bound |
//! | block push | `poll_interval` | connected >= upload lower bound |
//! | seed push | `poll_interval` | none |
//!
//! Block push runs two independent draws per tick: the assigned-upload draw
//! succeeds with the peer's response-time rank, the request-serving draw
//! with `min(1, reputation / 256)`. Serving costs the peer one point of
//! reputation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use rand::seq::SliceRandom;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::crypto::Seed;
use crate::dissemination::seed_request_cap;
use crate::identity::Key;
use crate::manager::{EngineEvent, Shared};
use crate::scheduler::Scheduler;
use crate::session::Session;
use crate::ttl::TtlMap;

/// Start the worker tasks for `session`.
pub(crate) fn spawn(shared: Arc<Shared>, session: Arc<Session>) -> Scheduler {
    let mut scheduler = Scheduler::new(session.cancel_token());
    let config = &shared.config;

    let tasks: [(&'static str, Duration, Task); 5] = [
        ("liveness", config.poll_interval, Task::Liveness),
        ("node-gossip", config.node_gossip_interval, Task::NodeGossip),
        ("queue-flush", config.queue_flush_interval, Task::QueueFlush),
        ("block-push", config.poll_interval, Task::BlockPush),
        ("seed-push", config.poll_interval, Task::SeedPush),
    ];
    for (name, period, task) in tasks {
        let shared = shared.clone();
        let session = session.clone();
        scheduler.spawn_periodic(name, period, move || {
            task.run(shared.clone(), session.clone())
        });
    }
    scheduler
}

#[derive(Clone, Copy, Debug)]
enum Task {
    Liveness,
    NodeGossip,
    QueueFlush,
    BlockPush,
    SeedPush,
}

impl Task {
    async fn run(self, shared: Arc<Shared>, session: Arc<Session>) -> Result<()> {
        match self {
            Task::Liveness => check_liveness(&shared, &session).await,
            Task::NodeGossip => gossip_nodes(&shared, &session).await,
            Task::QueueFlush => flush_queues(&shared, &session).await,
            Task::BlockPush => push_blocks(&shared, &session).await,
            Task::SeedPush => push_seeds(&shared, &session).await,
        }
    }
}

/// True once a peer has gone `timeout` without delivering content.
fn is_idle(last_pull: Option<Instant>, now: Instant, timeout: Duration) -> bool {
    last_pull.is_some_and(|at| now.saturating_duration_since(at) >= timeout)
}

async fn check_liveness(shared: &Arc<Shared>, session: &Session) -> Result<()> {
    let id = session.peer_id();
    let last_pull = shared.peers.lock().await.get(&id).and_then(|s| s.last_pull);
    if is_idle(last_pull, Instant::now(), shared.config.liveness_timeout) {
        info!(peer = ?id, "peer idle, disconnecting");
        shared.disconnect_and_blacklist(session).await;
    }
    Ok(())
}

async fn gossip_nodes(shared: &Arc<Shared>, session: &Session) -> Result<()> {
    let nodes = shared.gossip_nodes(&session.peer_id()).await;
    if nodes.is_empty() {
        return Ok(());
    }
    trace!(peer = ?session.peer_id(), count = nodes.len(), "node gossip");
    session.push_nodes(nodes).await
}

async fn flush_queues(shared: &Arc<Shared>, session: &Session) -> Result<()> {
    let id = session.peer_id();
    let (connected, rank) = {
        let search = shared.search.read().await;
        (search.connected_count(), search.response_rank(&id))
    };
    if connected < shared.config.download_peer_lower_bound {
        return Ok(());
    }

    let seed_cap = seed_request_cap(rank, shared.config.seed_request_scale);
    let (links, requests, seed_requests) = {
        let mut assignments = shared.assignments.lock().await;
        (
            assignments.drain_links(&id, shared.config.flush_cap),
            assignments.drain_requests(&id, shared.config.flush_cap),
            assignments.drain_seed_requests(&id, seed_cap),
        )
    };

    if !links.is_empty() {
        session.push_blocks_link(links.clone()).await?;
        if let Some(state) = shared.peers.lock().await.get_mut(&id) {
            for key in links.iter().cloned() {
                state.pushed_links.insert(key);
            }
        }
    }
    if !requests.is_empty() {
        session.push_blocks_request(requests.clone()).await?;
        if let Some(state) = shared.peers.lock().await.get_mut(&id) {
            for key in requests.iter().cloned() {
                state.pushed_requests.insert(key);
            }
        }
        let mut wants = shared.wants.lock().await;
        for key in &requests {
            wants.download.remove(key);
        }
    }
    if !seed_requests.is_empty() {
        session.push_seeds_request(seed_requests.clone()).await?;
        if let Some(state) = shared.peers.lock().await.get_mut(&id) {
            for signature in seed_requests.iter().cloned() {
                state.pushed_seed_requests.insert(signature);
            }
        }
        let mut wants = shared.wants.lock().await;
        for signature in &seed_requests {
            wants.signatures.remove(signature);
        }
    }
    debug!(
        peer = ?id,
        links = links.len(),
        requests = requests.len(),
        seed_requests = seed_requests.len(),
        "queues flushed"
    );
    Ok(())
}

async fn push_blocks(shared: &Arc<Shared>, session: &Session) -> Result<()> {
    let id = session.peer_id();
    let (connected, rank) = {
        let search = shared.search.read().await;
        (search.connected_count(), search.response_rank(&id).unwrap_or(0.0))
    };
    if connected < shared.config.upload_peer_lower_bound {
        return Ok(());
    }

    let push_assigned = rand::thread_rng().gen_bool(rank.clamp(0.0, 1.0));
    if push_assigned {
        let key = shared.assignments.lock().await.pick_upload(&id);
        if let Some(key) = key {
            push_assigned_block(shared, session, key).await?;
        }
    }

    let serve_probability = shared
        .peers
        .lock()
        .await
        .get(&id)
        .map_or(0.0, |state| state.serve_probability());
    let serve = rand::thread_rng().gen_bool(serve_probability.clamp(0.0, 1.0));
    if serve {
        serve_request(shared, session).await?;
    }
    Ok(())
}

/// Push a scheduler-assigned upload key. Keys the store no longer has are
/// dropped from the assignment.
async fn push_assigned_block(shared: &Arc<Shared>, session: &Session, key: Key) -> Result<()> {
    let id = session.peer_id();
    let value = match shared.store.get(&key).await {
        Ok(value) => value,
        Err(e) => {
            debug!(peer = ?id, key = ?key, error = %e, "assigned block unavailable");
            shared.assignments.lock().await.remove_upload(&id, &key);
            return Ok(());
        }
    };
    session.push_block(key.clone(), value).await?;
    shared.assignments.lock().await.remove_upload(&id, &key);
    if let Some(state) = shared.peers.lock().await.get_mut(&id) {
        state.pushed_links.insert(key.clone());
    }
    let uploaded = {
        let mut wants = shared.wants.lock().await;
        wants.diffusion.remove(&key);
        wants.upload.remove(&key)
    };
    if uploaded {
        shared.store.unlock(&key).await;
        shared.emit(EngineEvent::BlockUploaded(key.clone()));
    }
    trace!(peer = ?id, key = ?key, uploaded, "block pushed");
    Ok(())
}

/// Push one locally cached block the peer asked for, chosen at random.
async fn serve_request(shared: &Arc<Shared>, session: &Session) -> Result<()> {
    let id = session.peer_id();
    let mut requests: Vec<Key> = shared
        .peers
        .lock()
        .await
        .get(&id)
        .map(|state| state.pulled_requests.iter().cloned().collect())
        .unwrap_or_default();
    requests.shuffle(&mut rand::thread_rng());

    for key in requests {
        let Ok(value) = shared.store.get(&key).await else {
            continue;
        };
        session.push_block(key.clone(), value).await?;
        if let Some(state) = shared.peers.lock().await.get_mut(&id) {
            state.pulled_requests.remove(&key);
            state.pushed_links.insert(key.clone());
            state.decrement_priority();
        }
        trace!(peer = ?id, key = ?key, "request served");
        break;
    }
    Ok(())
}

/// Seeds not yet sent at their current creation time, at most `cap`.
fn unsent_seeds(
    candidates: Vec<(String, Seed)>,
    sent: &TtlMap<String, u64>,
    cap: usize,
) -> Vec<(String, Seed)> {
    candidates
        .into_iter()
        .filter(|(signature, seed)| sent.get(signature).is_none_or(|t| *t < seed.creation_time))
        .take(cap)
        .collect()
}

async fn push_seeds(shared: &Arc<Shared>, session: &Session) -> Result<()> {
    let id = session.peer_id();
    let wanted: Vec<String> = shared
        .peers
        .lock()
        .await
        .get(&id)
        .map(|state| state.pulled_seed_requests.iter().cloned().collect())
        .unwrap_or_default();
    if wanted.is_empty() {
        return Ok(());
    }

    let candidates: Vec<(String, Seed)> = {
        let seeds = shared.seeds.lock().await;
        wanted
            .into_iter()
            .filter_map(|signature| {
                let seed = seeds.get(&signature)?.clone();
                Some((signature, seed))
            })
            .collect()
    };
    let batch = {
        let peers = shared.peers.lock().await;
        let Some(state) = peers.get(&id) else {
            return Ok(());
        };
        unsent_seeds(candidates, &state.pushed_seed_times, shared.config.seeds_per_tick)
    };

    for (signature, seed) in batch {
        let created = seed.creation_time;
        session.push_seed(seed).await?;
        if let Some(state) = shared.peers.lock().await.get_mut(&id) {
            state.pushed_seed_times.insert(signature.clone(), created);
            state.pulled_seed_requests.remove(&signature);
        }
        trace!(peer = ?id, signature = %signature, "seed pushed");
    }
    Ok(())
}
