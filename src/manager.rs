//! # Connections Manager
//!
//! The engine facade. Owns every shared structure and the background workers
//! that keep the overlay populated and content moving.
//!
//! ## Workers
//!
//! | Worker | Count | Cadence | Job |
//! |--------|-------|---------|-----|
//! | session events | 1 | event driven | apply pulled frames and closes |
//! | outbound | 3 | `poll_interval` | dial one candidate |
//! | inbound | 3 | continuous | accept and handshake one stream |
//! | search refresh | 1 | `search_refresh_interval` | rebuild the nearest-peer snapshot |
//! | upload | 1 | `upload_interval` | assign upload/diffusion keys, offer seeds |
//! | download | 1 | `download_interval` | assign advertisements, requests, seed requests |
//! | churn | 1 | `churn_interval` | drop the least useful outbound peer |
//! | sweep | 1 | `sweep_interval` | expire TTL state, trim the peer table |
//! | check seeds | 1 | `check_seeds_interval` | store consistency sweep |
//! | per-peer | 1 per session | see [`crate::worker`] | flush work to one peer |
//!
//! ## Locking
//!
//! Each structure has its own lock. Only admission holds more than one at a
//! time, always in this order: `sessions`, `reputation`, `peers`, `router`,
//! `workers`. Everything else takes one lock, copies what it needs and
//! releases it before touching the next structure or the network.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use lru::LruCache;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::bandwidth::BandwidthLimiter;
use crate::config::EngineConfig;
use crate::crypto::{Seed, SeedError};
use crate::dissemination::{
    Assignments, DownloadInput, UploadInput, plan_downloads, plan_uploads,
};
use crate::identity::{Key, Node, NodeId};
use crate::messages::{MAX_SIGNATURE_LEN, Message};
use crate::peer_state::{MAX_SURROUNDING_NODES, PeerStateTable};
use crate::protocols::{BlockStore, PeerStream, Transport};
use crate::reputation::Reputation;
use crate::routing::Router;
use crate::scheduler::Scheduler;
use crate::search::{PeerSample, SearchSnapshot};
use crate::session::{CloseReason, Direction, Session, SessionEvent};
use crate::ttl::TtlSet;
use crate::worker;

/// Replicated dialing workers.
pub const OUTBOUND_WORKERS: usize = 3;

/// Replicated accepting workers.
pub const INBOUND_WORKERS: usize = 3;

/// Seeds received from peers kept in memory.
/// SECURITY: bounds memory against seed flooding.
pub const MAX_CACHED_SEEDS: usize = 8192;

/// Buffered engine events per subscriber.
pub const ENGINE_EVENT_CAPACITY: usize = 1024;

/// Notifications for the job managers above the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineEvent {
    /// A directly verified peer entered the routing table.
    NodeReachable(Node),
    /// A block from `peer` was accepted by the store.
    BlockPulled { peer: NodeId, key: Key },
    /// `peer` asked us to drop the session.
    CancelRequested(NodeId),
    /// An upload-requested block was pushed to its assigned peer.
    BlockUploaded(Key),
}

/// Engine state worth keeping across restarts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedState {
    pub base_node: Node,
    pub other_nodes: Vec<Node>,
    pub published_seeds: Vec<Seed>,
    pub upload_keys: Vec<Key>,
    pub diffusion_keys: Vec<Key>,
}

/// Engine-wide counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Information {
    pub sessions: usize,
    pub inbound_sessions: usize,
    pub outbound_sessions: usize,
    pub routing_nodes: usize,
    pub peer_states: usize,
    pub blacklisted: usize,
    pub download_waiting: usize,
    pub upload_waiting: usize,
    pub diffusion_waiting: usize,
    pub seed_waiting: usize,
    pub published_seeds: usize,
    pub cached_seeds: usize,
    pub sent_bytes: u64,
    pub received_bytes: u64,
}

/// One row per live session.
#[derive(Clone, Debug)]
pub struct ConnectionInformation {
    pub node: Node,
    pub uri: String,
    pub direction: Direction,
    pub response_time: Option<Duration>,
    pub priority: i32,
    pub sent_bytes: u64,
    pub received_bytes: u64,
    pub age: Duration,
}

// ============================================================================
// Local want-lists and seeds
// ============================================================================

pub(crate) struct WantLists {
    pub(crate) download: HashSet<Key>,
    pub(crate) upload: HashSet<Key>,
    /// Blocks received without a request, spread opportunistically.
    pub(crate) diffusion: TtlSet<Key>,
    pub(crate) signatures: TtlSet<String>,
}

pub(crate) struct SeedCache {
    published: HashMap<String, Seed>,
    received: LruCache<String, Seed>,
}

impl SeedCache {
    fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            published: HashMap::new(),
            received: LruCache::new(capacity),
        }
    }

    pub(crate) fn get(&self, signature: &str) -> Option<&Seed> {
        self.published
            .get(signature)
            .or_else(|| self.received.peek(signature))
    }

    fn check(seed: &Seed, current: Option<&Seed>) -> Result<String, SeedError> {
        seed.verify()?;
        let signature = seed.signature().ok_or(SeedError::Unsigned)?;
        if current.is_some_and(|c| c.creation_time >= seed.creation_time) {
            return Err(SeedError::Stale);
        }
        Ok(signature)
    }

    fn publish(&mut self, seed: Seed) -> Result<String, SeedError> {
        if !seed.is_published_index() {
            return Err(SeedError::NotPublishedIndex);
        }
        let current = seed
            .signature()
            .and_then(|signature| self.published.get(&signature));
        let signature = Self::check(&seed, current)?;
        self.received.pop(&signature);
        self.published.insert(signature.clone(), seed);
        Ok(signature)
    }

    fn accept(&mut self, seed: Seed) -> Result<String, SeedError> {
        let current = seed.signature().and_then(|signature| self.get(&signature));
        let signature = Self::check(&seed, current)?;
        if self.published.contains_key(&signature) {
            return Err(SeedError::Stale);
        }
        self.received.put(signature.clone(), seed);
        Ok(signature)
    }

    fn published_signatures(&self) -> Vec<String> {
        self.published.keys().cloned().collect()
    }

    fn known_signatures(&self) -> HashSet<String> {
        self.published
            .keys()
            .chain(self.received.iter().map(|(k, _)| k))
            .cloned()
            .collect()
    }
}

// ============================================================================
// Shared engine state
// ============================================================================

pub(crate) struct Shared {
    pub(crate) config: EngineConfig,
    pub(crate) local: Node,
    pub(crate) store: Arc<dyn BlockStore>,
    transport: Arc<dyn Transport>,
    limiter: Arc<BandwidthLimiter>,
    pub(crate) router: RwLock<Router>,
    pub(crate) peers: Mutex<PeerStateTable>,
    pub(crate) reputation: Mutex<Reputation>,
    pub(crate) sessions: RwLock<HashMap<NodeId, Arc<Session>>>,
    connecting: Mutex<HashSet<NodeId>>,
    pub(crate) search: RwLock<SearchSnapshot>,
    pub(crate) assignments: Mutex<Assignments>,
    pub(crate) wants: Mutex<WantLists>,
    pub(crate) seeds: Mutex<SeedCache>,
    workers: Mutex<HashMap<NodeId, Scheduler>>,
    events: broadcast::Sender<EngineEvent>,
    session_events: mpsc::Sender<SessionEvent>,
    root: CancellationToken,
    /// Traffic of sessions that already closed.
    closed_sent: AtomicU64,
    closed_received: AtomicU64,
}

impl Shared {
    pub(crate) fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    /// (total, inbound, outbound) session counts.
    async fn session_counts(&self) -> (usize, usize, usize) {
        let sessions = self.sessions.read().await;
        let inbound = sessions
            .values()
            .filter(|s| s.direction() == Direction::Inbound)
            .count();
        (sessions.len(), inbound, sessions.len() - inbound)
    }

    async fn current_session(&self, peer: &NodeId, session_id: &[u8; 32]) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(peer)
            .filter(|s| s.session_id() == *session_id)
            .cloned()
    }

    // ------------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------------

    /// Register a handshaked session and give it a worker.
    pub(crate) async fn admit(
        self: &Arc<Self>,
        session: &Arc<Session>,
    ) -> Result<(), &'static str> {
        let id = session.peer_id();
        let node = session.remote().clone();
        let reachable = {
            let mut sessions = self.sessions.write().await;
            if id == self.local.id {
                return Err("self");
            }
            if self.reputation.lock().await.is_blacklisted(&id) {
                return Err("blacklisted");
            }
            if sessions.contains_key(&id) {
                return Err("duplicate");
            }
            if sessions.len() >= self.config.connection_limit {
                return Err("connection limit");
            }
            sessions.insert(id, session.clone());
            self.reputation
                .lock()
                .await
                .remove_reconnect_candidate(&id);
            {
                let mut peers = self.peers.lock().await;
                peers.protect(id);
                let state = peers.get_or_create(&node);
                state.session_id = Some(session.session_id());
                state.last_pull = Some(Instant::now());
            }
            let reachable = {
                let mut router = self.router.write().await;
                router.add(&node);
                router.contains(&id)
            };
            let worker = worker::spawn(self.clone(), session.clone());
            self.workers.lock().await.insert(id, worker);
            reachable
        };

        if reachable {
            self.emit(EngineEvent::NodeReachable(node));
        }
        session.start().await;
        let s = session.clone();
        tokio::spawn(async move {
            let _ = s.push_nodes_request().await;
        });
        self.refresh_search().await;
        info!(
            peer = ?id,
            uri = %session.uri(),
            direction = ?session.direction(),
            "peer connected"
        );
        Ok(())
    }

    async fn admit_or_close(self: &Arc<Self>, session: Arc<Session>) {
        if let Err(why) = self.admit(&session).await {
            debug!(peer = ?session.peer_id(), reason = why, "session rejected");
            session.cancel_and_close(CloseReason::Rejected(why)).await;
        }
    }

    async fn handshake(
        &self,
        stream: Box<dyn PeerStream>,
        uri: String,
        direction: Direction,
    ) -> Result<Arc<Session>> {
        Session::handshake(
            stream,
            uri,
            direction,
            &self.local,
            self.config.session.clone(),
            self.limiter.clone(),
            self.session_events.clone(),
            &self.root,
        )
        .await
    }

    // ------------------------------------------------------------------------
    // Outbound / inbound
    // ------------------------------------------------------------------------

    async fn outbound_pass(self: Arc<Self>) -> Result<()> {
        let (total, _, outbound) = self.session_counts().await;
        if total >= self.config.connection_limit || !self.config.outbound_allowed(outbound) {
            return Ok(());
        }
        let Some(candidate) = self.claim_candidate().await else {
            return Ok(());
        };
        let outcome = self.dial(&candidate).await;
        self.connecting.lock().await.remove(&candidate.id);
        if let Err(e) = outcome {
            debug!(peer = ?candidate.id, error = %e, "outbound connect failed");
            self.demote(&candidate.id).await;
        }
        Ok(())
    }

    /// Reconnect candidates first, then random table members. The chosen
    /// node is marked as being dialed so no other worker picks it.
    async fn claim_candidate(&self) -> Option<Node> {
        let mut reconnect = self.reputation.lock().await.reconnect_candidates();
        reconnect.shuffle(&mut rand::thread_rng());
        let mut table = self.router.read().await.all();
        table.shuffle(&mut rand::thread_rng());

        let blacklisted: HashSet<NodeId> = {
            let reputation = self.reputation.lock().await;
            reconnect
                .iter()
                .chain(table.iter())
                .filter(|n| reputation.is_blacklisted(&n.id))
                .map(|n| n.id)
                .collect()
        };

        let sessions = self.sessions.read().await;
        let mut connecting = self.connecting.lock().await;
        for node in reconnect.into_iter().chain(table) {
            if node.id == self.local.id
                || blacklisted.contains(&node.id)
                || sessions.contains_key(&node.id)
                || connecting.contains(&node.id)
            {
                continue;
            }
            connecting.insert(node.id);
            return Some(node);
        }
        None
    }

    async fn dial(self: &Arc<Self>, candidate: &Node) -> Result<()> {
        let mut uris = match self.router.read().await.reachable(candidate) {
            Some(node) => node.uris,
            None => bail!("no uri passes the filter"),
        };
        uris.shuffle(&mut rand::thread_rng());
        uris.truncate(self.config.uris_per_candidate);

        let mut last_error = anyhow!("no transport handles the candidate's uris");
        for uri in uris {
            let stream = match self.transport.create_connection(&uri).await {
                Ok(Some(stream)) => stream,
                Ok(None) => continue,
                Err(e) => {
                    trace!(uri = %uri, error = %e, "connect failed");
                    last_error = e;
                    continue;
                }
            };
            match self.handshake(stream, uri.clone(), Direction::Outbound).await {
                Ok(session) => {
                    if session.peer_id() != candidate.id {
                        debug!(
                            expected = ?candidate.id,
                            actual = ?session.peer_id(),
                            uri = %uri,
                            "peer identity changed"
                        );
                        self.reputation
                            .lock()
                            .await
                            .remove_reconnect_candidate(&candidate.id);
                        self.router.write().await.remove(&candidate.id);
                    }
                    self.admit_or_close(session).await;
                    return Ok(());
                }
                Err(e) => {
                    trace!(uri = %uri, error = %e, "handshake failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Blacklist and drop from the table (subject to minimum population).
    pub(crate) async fn demote(&self, id: &NodeId) {
        self.reputation.lock().await.blacklist(*id);
        self.router.write().await.remove(id);
    }

    async fn inbound_loop(self: Arc<Self>) {
        loop {
            let (_, inbound, _) = self.session_counts().await;
            if !self.config.inbound_allowed(inbound) {
                tokio::time::sleep(self.config.poll_interval).await;
                continue;
            }
            let (stream, uri) = match self.transport.accept_connection().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    debug!(error = %e, "accept failed");
                    tokio::time::sleep(self.config.poll_interval).await;
                    continue;
                }
            };
            match self.handshake(stream, uri.clone(), Direction::Inbound).await {
                Ok(session) => self.admit_or_close(session).await,
                Err(e) => debug!(uri = %uri, error = %e, "inbound handshake failed"),
            }
        }
    }

    // ------------------------------------------------------------------------
    // Session events
    // ------------------------------------------------------------------------

    async fn run_events(self: Arc<Self>, mut events: mpsc::Receiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Pulled {
                    peer,
                    session_id,
                    message,
                    ..
                } => {
                    if let Some(session) = self.current_session(&peer, &session_id).await {
                        self.on_pull(&session, message).await;
                    }
                }
                SessionEvent::Closed {
                    peer,
                    session_id,
                    reason,
                } => self.on_closed(peer, session_id, reason).await,
            }
        }
    }

    async fn on_pull(self: &Arc<Self>, session: &Arc<Session>, message: Message) {
        let peer = session.peer_id();
        if message.is_content() {
            if let Some(state) = self.peers.lock().await.get_mut(&peer) {
                state.last_pull = Some(Instant::now());
            }
            self.reputation.lock().await.clear_strikes(&peer);
        }

        match message {
            Message::NodesRequest => {
                let nodes = self.gossip_nodes(&peer).await;
                let session = session.clone();
                tokio::spawn(async move {
                    let _ = session.push_nodes(nodes).await;
                });
            }
            Message::Nodes(nodes) => self.on_nodes(peer, nodes).await,
            Message::BlocksLink(keys) => {
                if let Some(state) = self.peers.lock().await.get_mut(&peer) {
                    for key in keys.into_iter().filter(Key::validate_structure) {
                        state.pulled_links.insert(key);
                    }
                }
            }
            Message::BlocksRequest(keys) => {
                if let Some(state) = self.peers.lock().await.get_mut(&peer) {
                    for key in keys.into_iter().filter(Key::validate_structure) {
                        state.pulled_requests.insert(key);
                    }
                }
            }
            Message::Block { key, value } => self.on_block(peer, key, value).await,
            Message::SeedsRequest(signatures) => {
                if let Some(state) = self.peers.lock().await.get_mut(&peer) {
                    for signature in signatures
                        .into_iter()
                        .filter(|s| !s.is_empty() && s.len() <= MAX_SIGNATURE_LEN)
                    {
                        state.pulled_seed_requests.insert(signature);
                    }
                }
            }
            Message::Seed(seed) => self.on_seed(peer, *seed).await,
            Message::LegacySeeds(seeds) => {
                for seed in seeds {
                    self.on_seed(peer, seed).await;
                }
            }
            Message::Cancel => self.emit(EngineEvent::CancelRequested(peer)),
            Message::Alive | Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    async fn on_nodes(&self, peer: NodeId, nodes: Vec<Node>) {
        let mut nodes: Vec<Node> = nodes
            .into_iter()
            .filter(|n| n.id != self.local.id && n.id != peer && n.validate_structure())
            .take(MAX_SURROUNDING_NODES)
            .collect();
        {
            let reputation = self.reputation.lock().await;
            nodes.retain(|n| !reputation.is_blacklisted(&n.id));
        }
        {
            let mut router = self.router.write().await;
            for node in &nodes {
                router.live(node);
            }
        }
        trace!(peer = ?peer, count = nodes.len(), "surrounding nodes");
        if let Some(state) = self.peers.lock().await.get_mut(&peer) {
            state.set_surrounding_nodes(nodes);
        }
    }

    async fn on_block(&self, peer: NodeId, key: Key, value: Vec<u8>) {
        let requested = self
            .peers
            .lock()
            .await
            .get_mut(&peer)
            .is_some_and(|state| state.pushed_requests.remove(&key));

        let cached = self.store.contains(&key).await;
        match self.store.set(&key, value).await {
            Ok(()) => {
                if let Some(state) = self.peers.lock().await.get_mut(&peer) {
                    if !requested {
                        state.increment_priority();
                    }
                    state.pulled_links.insert(key.clone());
                }
                {
                    let mut wants = self.wants.lock().await;
                    let wanted = wants.download.remove(&key);
                    if !requested && !wanted && !cached {
                        wants.diffusion.insert(key.clone());
                    }
                }
                trace!(peer = ?peer, key = ?key, requested, "block pulled");
                self.emit(EngineEvent::BlockPulled { peer, key });
            }
            Err(e) => {
                warn!(peer = ?peer, key = ?key, error = %e, "block rejected by store");
                if let Some(state) = self.peers.lock().await.get_mut(&peer) {
                    state.decrement_priority();
                }
            }
        }
    }

    async fn on_seed(&self, peer: NodeId, seed: Seed) {
        let accepted = self.seeds.lock().await.accept(seed);
        let signature = match accepted {
            Ok(signature) => signature,
            Err(SeedError::Stale) => return,
            Err(e) => {
                debug!(peer = ?peer, error = %e, "dropped seed");
                return;
            }
        };
        self.wants.lock().await.signatures.remove(&signature);
        if let Some(state) = self.peers.lock().await.get_mut(&peer) {
            state.pushed_seed_requests.remove(&signature);
        }
        trace!(peer = ?peer, signature = %signature, "seed pulled");
    }

    async fn on_closed(&self, peer: NodeId, session_id: [u8; 32], reason: CloseReason) {
        let session = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(&peer) {
                Some(s) if s.session_id() == session_id => sessions.remove(&peer),
                _ => None,
            }
        };
        let Some(session) = session else {
            return;
        };

        if let Some(mut worker) = self.workers.lock().await.remove(&peer) {
            tokio::spawn(async move { worker.shutdown().await });
        }
        let (sent, received) = (session.sent_bytes(), session.received_bytes());
        self.closed_sent.fetch_add(sent, Ordering::Relaxed);
        self.closed_received.fetch_add(received, Ordering::Relaxed);
        {
            let mut peers = self.peers.lock().await;
            peers.unprotect(&peer);
            if let Some(state) = peers.get_mut(&peer) {
                state.session_id = None;
                state.sent_bytes += sent;
                state.received_bytes += received;
            }
        }
        self.assignments.lock().await.remove_peer(&peer);
        self.record_close(session.remote(), &reason).await;
        self.refresh_search().await;
        info!(peer = ?peer, reason = %reason, "peer disconnected");
    }

    /// Reputation bookkeeping for a closed session.
    pub(crate) async fn record_close(&self, node: &Node, reason: &CloseReason) {
        let blacklisted = {
            let mut reputation = self.reputation.lock().await;
            if reason.is_abnormal() {
                let blacklisted = reputation.record_abnormal_close(node.id);
                if !blacklisted {
                    reputation.add_reconnect_candidate(node.clone());
                }
                blacklisted
            } else {
                if *reason == CloseReason::RemoteCancel {
                    reputation.add_reconnect_candidate(node.clone());
                }
                false
            }
        };
        if blacklisted {
            self.router.write().await.remove(&node.id);
            info!(peer = ?node.id, "blacklisted after repeated abnormal closes");
        }
    }

    /// Blacklist `session`'s peer, tell it we are leaving, and close.
    pub(crate) async fn disconnect_and_blacklist(&self, session: &Session) {
        self.demote(&session.peer_id()).await;
        session.cancel_and_close(CloseReason::Local).await;
    }

    // ------------------------------------------------------------------------
    // Gossip and search
    // ------------------------------------------------------------------------

    /// Fastest connected peers other than `exclude` with a reachable uri.
    pub(crate) async fn gossip_nodes(&self, exclude: &NodeId) -> Vec<Node> {
        let order: Vec<NodeId> = self.search.read().await.by_response_time().to_vec();
        let sessions = self.sessions.read().await;
        let router = self.router.read().await;
        let mut seen = HashSet::new();
        order
            .iter()
            .chain(sessions.keys())
            .filter(|id| *id != exclude && seen.insert(**id))
            .filter_map(|id| sessions.get(id))
            .filter_map(|s| router.reachable(s.remote()))
            .take(self.config.gossip_nodes)
            .collect()
    }

    pub(crate) async fn refresh_search(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let mut samples = Vec::with_capacity(sessions.len());
        for session in &sessions {
            samples.push(PeerSample {
                id: session.peer_id(),
                response_time: session.response_time().await,
                surrounding: Vec::new(),
            });
        }
        {
            let peers = self.peers.lock().await;
            for sample in &mut samples {
                if let Some(state) = peers.get(&sample.id) {
                    sample.surrounding = state.surrounding_nodes().iter().map(|n| n.id).collect();
                }
            }
        }
        let snapshot = SearchSnapshot::build(self.local.id, samples);
        self.assignments.lock().await.retain_connected(&snapshot);
        *self.search.write().await = snapshot;
    }

    // ------------------------------------------------------------------------
    // Scheduler passes
    // ------------------------------------------------------------------------

    async fn upload_pass(self: Arc<Self>) -> Result<()> {
        let snapshot = self.search.read().await.clone();
        let connected = snapshot.connected_count();
        if connected == 0 || connected < self.config.upload_peer_lower_bound {
            return Ok(());
        }
        let (upload_keys, diffusion_keys): (Vec<Key>, Vec<Key>) = {
            let wants = self.wants.lock().await;
            (
                wants.upload.iter().cloned().collect(),
                wants.diffusion.iter().cloned().collect(),
            )
        };
        let published = self.seeds.lock().await.published_signatures();

        let plan = plan_uploads(UploadInput {
            snapshot: &snapshot,
            upload_keys: &upload_keys,
            diffusion_keys: &diffusion_keys,
            published_signatures: &published,
            upload_batch: self.config.upload_batch,
            diffusion_batch: self.config.diffusion_batch,
            fanout: self.config.seed_request_fanout,
        });

        let assigned = {
            let mut assignments = self.assignments.lock().await;
            plan.uploads
                .into_iter()
                .filter(|(peer, key)| assignments.assign_upload(*peer, key.clone()))
                .count()
        };
        {
            let mut peers = self.peers.lock().await;
            for (peer, signature) in plan.seed_offers {
                if let Some(state) = peers.get_mut(&peer) {
                    state.pulled_seed_requests.insert(signature);
                }
            }
        }
        debug!(assigned, published = published.len(), "upload pass");
        Ok(())
    }

    async fn download_pass(self: Arc<Self>) -> Result<()> {
        let snapshot = self.search.read().await.clone();
        let connected = snapshot.connected_count();
        if connected == 0 || connected < self.config.download_peer_lower_bound {
            return Ok(());
        }
        let cached: HashSet<Key> = self.store.keys().await.into_iter().collect();
        let (wanted, wanted_signatures): (Vec<Key>, Vec<String>) = {
            let wants = self.wants.lock().await;
            (
                wants.download.iter().cloned().collect(),
                wants.signatures.iter().cloned().collect(),
            )
        };
        let known = self.seeds.lock().await.known_signatures();

        let plan = {
            let peers = self.peers.lock().await;
            let assignments = self.assignments.lock().await;
            plan_downloads(DownloadInput {
                snapshot: &snapshot,
                peers: &peers,
                assignments: &assignments,
                cached: &cached,
                wanted: &wanted,
                wanted_signatures: &wanted_signatures,
                known_signatures: &known,
                per_source: self.config.candidates_per_source,
                signature_batch: self.config.signature_batch,
                fanout: self.config.seed_request_fanout,
            })
        };

        let mut assignments = self.assignments.lock().await;
        let (links, requests, seed_requests) = (
            plan.links.len(),
            plan.requests.len(),
            plan.seed_requests.len(),
        );
        for (peer, key) in plan.links {
            assignments.assign_link(peer, key);
        }
        for (peer, key) in plan.requests {
            assignments.assign_request(peer, key);
        }
        for (peer, signature) in plan.seed_requests {
            assignments.assign_seed_request(peer, signature);
        }
        debug!(links, requests, seed_requests, "download pass");
        Ok(())
    }

    /// Drop the outbound peer that delivered least recently, slowest first on ties.
    async fn churn_pass(self: Arc<Self>) -> Result<()> {
        let (_, _, outbound) = self.session_counts().await;
        if !self.config.churn_allowed(outbound) {
            return Ok(());
        }
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let mut candidates = Vec::with_capacity(sessions.len());
        for session in &sessions {
            candidates.push(ChurnCandidate {
                id: session.peer_id(),
                last_pull: None,
                response_time: session.response_time().await,
            });
        }
        {
            let peers = self.peers.lock().await;
            for candidate in &mut candidates {
                candidate.last_pull = peers.get(&candidate.id).and_then(|p| p.last_pull);
            }
        }
        let victim = churn_victim(&candidates);
        if let Some(session) = sessions.iter().find(|s| Some(s.peer_id()) == victim) {
            info!(peer = ?session.peer_id(), "churning peer");
            self.disconnect_and_blacklist(session).await;
        }
        Ok(())
    }

    async fn sweep_pass(self: Arc<Self>) -> Result<()> {
        let evicted = self.peers.lock().await.sweep();
        self.reputation.lock().await.sweep();
        {
            let mut wants = self.wants.lock().await;
            wants.diffusion.sweep();
            wants.signatures.sweep();
        }
        if !evicted.is_empty() {
            debug!(evicted = evicted.len(), "peer states evicted");
        }
        Ok(())
    }

    async fn check_seeds_pass(self: Arc<Self>) -> Result<()> {
        self.store.check_seeds().await;
        Ok(())
    }

    async fn search_pass(self: Arc<Self>) -> Result<()> {
        self.refresh_search().await;
        Ok(())
    }
}

fn periodic<F, Fut>(
    scheduler: &mut Scheduler,
    shared: &Arc<Shared>,
    name: &'static str,
    period: Duration,
    pass: F,
) where
    F: Fn(Arc<Shared>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let shared = shared.clone();
    scheduler.spawn_periodic(name, period, move || pass(shared.clone()));
}

// ============================================================================
// ConnectionsManager
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunState {
    Idle,
    Running,
    Stopped,
}

/// Peer routing and dissemination engine.
pub struct ConnectionsManager {
    shared: Arc<Shared>,
    session_events: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    scheduler: Mutex<Option<Scheduler>>,
    state: Mutex<RunState>,
}

impl ConnectionsManager {
    pub fn new(
        base_node: Node,
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn BlockStore>,
    ) -> Self {
        let (session_tx, session_rx) = mpsc::channel(config.event_channel_capacity.max(1));
        let (events, _) = broadcast::channel(ENGINE_EVENT_CAPACITY);
        let router = Router::new(
            base_node.id,
            config.bucket_size,
            config.min_population,
            config.uri_filter.clone(),
        );
        let set_ttl = config.peer_state.set_ttl;
        let set_capacity = config.peer_state.set_capacity;
        let shared = Shared {
            local: base_node,
            store,
            transport,
            limiter: Arc::new(BandwidthLimiter::new(config.bandwidth_limit)),
            router: RwLock::new(router),
            peers: Mutex::new(PeerStateTable::new(config.peer_state.clone())),
            reputation: Mutex::new(Reputation::new(&config.reputation)),
            sessions: RwLock::new(HashMap::new()),
            connecting: Mutex::new(HashSet::new()),
            search: RwLock::new(SearchSnapshot::default()),
            assignments: Mutex::new(Assignments::new()),
            wants: Mutex::new(WantLists {
                download: HashSet::new(),
                upload: HashSet::new(),
                diffusion: TtlSet::new(set_ttl, set_capacity),
                signatures: TtlSet::new(set_ttl, set_capacity),
            }),
            seeds: Mutex::new(SeedCache::new(MAX_CACHED_SEEDS)),
            workers: Mutex::new(HashMap::new()),
            events,
            session_events: session_tx,
            root: CancellationToken::new(),
            closed_sent: AtomicU64::new(0),
            closed_received: AtomicU64::new(0),
            config,
        };
        Self {
            shared: Arc::new(shared),
            session_events: Mutex::new(Some(session_rx)),
            scheduler: Mutex::new(None),
            state: Mutex::new(RunState::Idle),
        }
    }

    pub fn base_node(&self) -> &Node {
        &self.shared.local
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Start every background worker. Starting a running engine is a no-op;
    /// a stopped engine cannot be restarted.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        match *state {
            RunState::Running => return Ok(()),
            RunState::Stopped => bail!("engine already stopped"),
            RunState::Idle => {}
        }
        let events = self
            .session_events
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("session event receiver missing"))?;

        let shared = &self.shared;
        let config = &shared.config;
        let mut scheduler = Scheduler::new(&shared.root);

        scheduler.spawn("session-events", shared.clone().run_events(events));
        for _ in 0..INBOUND_WORKERS {
            scheduler.spawn("inbound", shared.clone().inbound_loop());
        }
        for _ in 0..OUTBOUND_WORKERS {
            periodic(&mut scheduler, shared, "outbound", config.poll_interval, |s| {
                s.outbound_pass()
            });
        }
        periodic(
            &mut scheduler,
            shared,
            "search-refresh",
            config.search_refresh_interval,
            |s| s.search_pass(),
        );
        periodic(&mut scheduler, shared, "upload", config.upload_interval, |s| {
            s.upload_pass()
        });
        periodic(&mut scheduler, shared, "download", config.download_interval, |s| {
            s.download_pass()
        });
        periodic(&mut scheduler, shared, "churn", config.churn_interval, |s| {
            s.churn_pass()
        });
        periodic(&mut scheduler, shared, "sweep", config.sweep_interval, |s| {
            s.sweep_pass()
        });
        periodic(
            &mut scheduler,
            shared,
            "check-seeds",
            config.check_seeds_interval,
            |s| s.check_seeds_pass(),
        );

        *self.scheduler.lock().await = Some(scheduler);
        *state = RunState::Running;
        info!(node = ?shared.local.id, uris = ?shared.local.uris, "engine started");
        Ok(())
    }

    /// Stop every worker, wait for each, then close all remaining sessions.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if *state != RunState::Running {
            *state = RunState::Stopped;
            return;
        }
        if let Some(mut scheduler) = self.scheduler.lock().await.take() {
            scheduler.shutdown().await;
        }
        let workers: Vec<Scheduler> = self
            .shared
            .workers
            .lock()
            .await
            .drain()
            .map(|(_, w)| w)
            .collect();
        for mut worker in workers {
            worker.shutdown().await;
        }
        let sessions: Vec<Arc<Session>> = self
            .shared
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, s)| s)
            .collect();
        for session in &sessions {
            self.shared
                .closed_sent
                .fetch_add(session.sent_bytes(), Ordering::Relaxed);
            self.shared
                .closed_received
                .fetch_add(session.received_bytes(), Ordering::Relaxed);
            session.cancel_and_close(CloseReason::Shutdown).await;
        }
        self.shared.root.cancel();
        *state = RunState::Stopped;
        info!(closed = sessions.len(), "engine stopped");
    }

    // ------------------------------------------------------------------------
    // Want-lists
    // ------------------------------------------------------------------------

    /// Ask the network for `key`.
    pub async fn download(&self, key: Key) {
        if key.validate_structure() {
            self.shared.wants.lock().await.download.insert(key);
        }
    }

    pub async fn is_download_waiting(&self, key: &Key) -> bool {
        self.shared.wants.lock().await.download.contains(key)
    }

    /// Push `key` to the peer nearest to it. The block stays locked in the
    /// store until it has been pushed.
    pub async fn upload(&self, key: Key) {
        if !key.validate_structure() {
            return;
        }
        let inserted = self.shared.wants.lock().await.upload.insert(key.clone());
        if inserted {
            self.shared.store.lock(&key).await;
        }
    }

    pub async fn is_upload_waiting(&self, key: &Key) -> bool {
        self.shared.wants.lock().await.upload.contains(key)
    }

    // ------------------------------------------------------------------------
    // Seeds
    // ------------------------------------------------------------------------

    /// The stored seed for `signature`, or `None` after registering it as wanted.
    pub async fn get_store_seed(&self, signature: &str) -> Option<Seed> {
        if let Some(seed) = self.shared.seeds.lock().await.get(signature) {
            return Some(seed.clone());
        }
        if !signature.is_empty() && signature.len() <= MAX_SIGNATURE_LEN {
            self.shared
                .wants
                .lock()
                .await
                .signatures
                .insert(signature.to_string());
        }
        None
    }

    /// Publish a signed index seed under its signer's signature string.
    pub async fn upload_seed(&self, seed: Seed) -> Result<String, SeedError> {
        let signature = self.shared.seeds.lock().await.publish(seed)?;
        self.shared.wants.lock().await.signatures.remove(&signature);
        debug!(signature = %signature, "seed published");
        Ok(signature)
    }

    pub async fn is_seed_waiting(&self, signature: &str) -> bool {
        self.shared
            .wants
            .lock()
            .await
            .signatures
            .contains(&signature.to_string())
    }

    // ------------------------------------------------------------------------
    // Routing table
    // ------------------------------------------------------------------------

    /// Seed the routing table with second-hand nodes.
    pub async fn set_other_nodes(&self, nodes: Vec<Node>) {
        let mut router = self.shared.router.write().await;
        let added = nodes
            .iter()
            .filter(|n| n.id != self.shared.local.id)
            .filter(|n| router.live(n))
            .count();
        debug!(offered = nodes.len(), added, "other nodes set");
    }

    pub async fn other_nodes(&self) -> Vec<Node> {
        self.shared.router.read().await.all()
    }

    // ------------------------------------------------------------------------
    // Information
    // ------------------------------------------------------------------------

    pub async fn information(&self) -> Information {
        let shared = &self.shared;
        let (sessions, inbound, outbound) = shared.session_counts().await;
        let (live_sent, live_received) = shared
            .sessions
            .read()
            .await
            .values()
            .fold((0, 0), |(s, r), session| {
                (s + session.sent_bytes(), r + session.received_bytes())
            });
        let routing_nodes = shared.router.read().await.len();
        let peer_states = shared.peers.lock().await.len();
        let blacklisted = shared.reputation.lock().await.blacklist_len();
        let (download_waiting, upload_waiting, diffusion_waiting, seed_waiting) = {
            let wants = shared.wants.lock().await;
            (
                wants.download.len(),
                wants.upload.len(),
                wants.diffusion.len(),
                wants.signatures.len(),
            )
        };
        let (published_seeds, cached_seeds) = {
            let seeds = shared.seeds.lock().await;
            (seeds.published.len(), seeds.received.len())
        };
        Information {
            sessions,
            inbound_sessions: inbound,
            outbound_sessions: outbound,
            routing_nodes,
            peer_states,
            blacklisted,
            download_waiting,
            upload_waiting,
            diffusion_waiting,
            seed_waiting,
            published_seeds,
            cached_seeds,
            sent_bytes: shared.closed_sent.load(Ordering::Relaxed) + live_sent,
            received_bytes: shared.closed_received.load(Ordering::Relaxed) + live_received,
        }
    }

    pub async fn connection_informations(&self) -> Vec<ConnectionInformation> {
        let sessions: Vec<Arc<Session>> =
            self.shared.sessions.read().await.values().cloned().collect();
        let mut rows = Vec::with_capacity(sessions.len());
        for session in sessions {
            let info = session.info().await;
            rows.push(ConnectionInformation {
                node: info.node,
                uri: info.uri,
                direction: info.direction,
                response_time: info.response_time,
                priority: 0,
                sent_bytes: info.sent_bytes,
                received_bytes: info.received_bytes,
                age: info.age,
            });
        }
        let peers = self.shared.peers.lock().await;
        for row in &mut rows {
            if let Some(state) = peers.get(&row.node.id) {
                row.priority = state.priority();
            }
        }
        rows
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    pub async fn persisted_state(&self) -> PersistedState {
        let other_nodes = self.shared.router.read().await.all();
        let published_seeds = self
            .shared
            .seeds
            .lock()
            .await
            .published
            .values()
            .cloned()
            .collect();
        let (upload_keys, diffusion_keys) = {
            let wants = self.shared.wants.lock().await;
            (
                wants.upload.iter().cloned().collect(),
                wants.diffusion.iter().cloned().collect(),
            )
        };
        PersistedState {
            base_node: self.shared.local.clone(),
            other_nodes,
            published_seeds,
            upload_keys,
            diffusion_keys,
        }
    }

    pub async fn restore(&self, state: PersistedState) {
        if state.base_node.id != self.shared.local.id {
            warn!(
                persisted = ?state.base_node.id,
                local = ?self.shared.local.id,
                "persisted state belongs to another identity"
            );
        }
        self.set_other_nodes(state.other_nodes).await;
        for seed in state.published_seeds {
            if let Err(e) = self.upload_seed(seed).await {
                warn!(error = %e, "persisted seed rejected");
            }
        }
        for key in state.upload_keys {
            self.upload(key).await;
        }
        let mut wants = self.shared.wants.lock().await;
        for key in state
            .diffusion_keys
            .into_iter()
            .filter(Key::validate_structure)
        {
            wants.diffusion.insert(key);
        }
    }
}

// ============================================================================
// Churn ranking
// ============================================================================

struct ChurnCandidate {
    id: NodeId,
    last_pull: Option<Instant>,
    response_time: Option<Duration>,
}

/// The peer longest without a successful pull. Ties go to the slowest
/// responder; unmeasured peers count as slowest.
fn churn_victim(candidates: &[ChurnCandidate]) -> Option<NodeId> {
    candidates
        .iter()
        .min_by(|a, b| {
            let slow = |c: &ChurnCandidate| c.response_time.unwrap_or(Duration::MAX);
            a.last_pull
                .cmp(&b.last_pull)
                .then_with(|| slow(b).cmp(&slow(a)))
        })
        .map(|c| c.id)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::session::SessionConfig;
    use crate::store::MemoryBlockStore;
    use crate::transport::MemoryNetwork;

    pub(crate) fn node(i: u8) -> Node {
        Node::new(NodeId::from_bytes([i; 32]), vec![format!("mem:{}", i)])
    }

    pub(crate) async fn manager(config: EngineConfig) -> ConnectionsManager {
        let network = MemoryNetwork::new();
        let transport = network.bind("mem:1").await;
        ConnectionsManager::new(
            node(1),
            config,
            Arc::new(transport),
            Arc::new(MemoryBlockStore::default()),
        )
    }

    pub(crate) fn shared(manager: &ConnectionsManager) -> Arc<Shared> {
        manager.shared.clone()
    }

    /// A handshaked, unadmitted session to `remote`, plus the event stream of
    /// its far end, which runs a plain started session.
    pub(crate) async fn session_pair(
        manager: &ConnectionsManager,
        remote: Node,
        direction: Direction,
    ) -> (Arc<Session>, mpsc::Receiver<SessionEvent>) {
        let (a, b) = tokio::io::duplex(1 << 16);
        let (tx, rx) = mpsc::channel(16);
        let far_direction = match direction {
            Direction::Inbound => Direction::Outbound,
            Direction::Outbound => Direction::Inbound,
        };
        let far_token = CancellationToken::new();
        let (local, far) = tokio::join!(
            manager
                .shared
                .handshake(Box::new(a), remote.uris[0].clone(), direction),
            Session::connect(
                Box::new(b),
                "mem:1".into(),
                far_direction,
                &remote,
                SessionConfig::default(),
                Arc::new(BandwidthLimiter::unlimited()),
                tx,
                &far_token,
            ),
        );
        far.unwrap();
        (local.unwrap(), rx)
    }

    /// An inbound session to `remote` whose far end ignores its own events.
    pub(crate) async fn session_to(manager: &ConnectionsManager, remote: Node) -> Arc<Session> {
        session_pair(manager, remote, Direction::Inbound).await.0
    }

    /// The close reason the far end eventually reports.
    pub(crate) async fn far_close(events: &mut mpsc::Receiver<SessionEvent>) -> CloseReason {
        let reason = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(event) = events.recv().await {
                if let SessionEvent::Closed { reason, .. } = event {
                    return Some(reason);
                }
            }
            None
        })
        .await;
        match reason {
            Ok(Some(reason)) => reason,
            other => panic!("far end never closed: {:?}", other),
        }
    }
}
