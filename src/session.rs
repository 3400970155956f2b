//! # Peer Session
//!
//! One established stream to one peer, driven through
//! `Connecting → Negotiated → Active → Closed`.
//!
//! ## Handshake
//!
//! 1. Both sides send a [`Hello`] listing supported versions; the highest
//!    common version is chosen, or the session fails closed.
//! 2. Both sides send a [`SessionInit`] with a random 32-byte id and their
//!    [`Node`] descriptor. The session id is the XOR of both halves so each
//!    side derives the same value.
//!
//! The whole handshake runs under `handshake_timeout`. A failed handshake
//! produces no session and no events.
//!
//! ## Active sessions
//!
//! Two loops run per session:
//!
//! - **pull loop**: reads frames under the receive timeout, answers pings,
//!   matches pongs, and forwards everything else as [`SessionEvent::Pulled`]
//! - **keepalive loop**: probes RTT once, then sends `Alive` whenever nothing
//!   was sent for `keepalive_interval`
//!
//! ## Close
//!
//! [`Session::close`] is idempotent. Whatever triggers it first (send failure,
//! read failure, protocol violation, local request) wins; exactly one
//! [`SessionEvent::Closed`] is emitted per session.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use rand::RngCore;
use rand::rngs::OsRng;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::bandwidth::BandwidthLimiter;
use crate::crypto::Seed;
use crate::identity::{Key, Node, NodeId};
use crate::messages::{
    FrameError, Hello, MAX_FRAME_SIZE, MAX_HANDSHAKE_SIZE, Message, ProtocolError,
    SUPPORTED_VERSIONS, SessionInit, decode_handshake, encode_handshake, negotiate_version,
    read_frame, write_frame,
};
use crate::protocols::PeerStream;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Send `Alive` after this long without sending anything.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(3 * 60);

/// Close the session after this long without receiving anything.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(6 * 60);

pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(60);

/// Length of the RTT probe nonce.
const PING_NONCE_LEN: usize = 32;

/// Upper bound on delivering a cancel frame before a deliberate close.
const CANCEL_NOTICE_TIMEOUT: Duration = Duration::from_secs(5);

/// Weight of a new RTT sample in the moving average.
const RTT_EMA_ALPHA: f64 = 0.2;

/// Bytes of framing added to each message.
const FRAME_OVERHEAD: usize = 4;

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub handshake_timeout: Duration,
    pub keepalive_interval: Duration,
    pub receive_timeout: Duration,
    pub send_timeout: Duration,
    pub versions: Vec<u32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            versions: SUPPORTED_VERSIONS.to_vec(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Negotiated = 1,
    Active = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Connecting,
            1 => SessionState::Negotiated,
            2 => SessionState::Active,
            _ => SessionState::Closed,
        }
    }
}

/// Why a session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by the local engine (disconnect, churn, liveness).
    Local,
    /// The peer sent `Cancel`.
    RemoteCancel,
    /// Refused at admission (limit, duplicate, blacklisted, self).
    Rejected(&'static str),
    /// Engine shutdown.
    Shutdown,
    Transport(String),
    ReceiveTimeout,
    SendTimeout,
    Protocol(ProtocolError),
}

impl CloseReason {
    /// Abnormal closes count as strikes against the peer.
    pub fn is_abnormal(&self) -> bool {
        matches!(
            self,
            CloseReason::Transport(_)
                | CloseReason::ReceiveTimeout
                | CloseReason::SendTimeout
                | CloseReason::Protocol(_)
        )
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Local => write!(f, "closed locally"),
            CloseReason::RemoteCancel => write!(f, "cancelled by peer"),
            CloseReason::Rejected(why) => write!(f, "rejected: {}", why),
            CloseReason::Shutdown => write!(f, "engine shutdown"),
            CloseReason::Transport(e) => write!(f, "transport error: {}", e),
            CloseReason::ReceiveTimeout => write!(f, "receive timeout"),
            CloseReason::SendTimeout => write!(f, "send timeout"),
            CloseReason::Protocol(e) => write!(f, "protocol violation: {}", e),
        }
    }
}

/// Events a session delivers to its owner, in stream order.
#[derive(Debug)]
pub enum SessionEvent {
    Pulled {
        peer: NodeId,
        session_id: [u8; 32],
        message: Message,
        bytes: usize,
    },
    Closed {
        peer: NodeId,
        session_id: [u8; 32],
        reason: CloseReason,
    },
}

/// Point-in-time view of a session.
#[derive(Clone, Debug)]
pub struct SessionInfo {
    pub node: Node,
    pub uri: String,
    pub direction: Direction,
    pub version: u32,
    pub response_time: Option<Duration>,
    pub sent_bytes: u64,
    pub received_bytes: u64,
    pub age: Duration,
}

pub struct Session {
    remote: Node,
    uri: String,
    direction: Direction,
    version: u32,
    session_id: [u8; 32],
    config: SessionConfig,
    state: AtomicU8,
    closed: AtomicBool,
    created: Instant,
    /// Milliseconds since `created` of the last successful send.
    last_sent_ms: AtomicU64,
    sent_bytes: AtomicU64,
    received_bytes: AtomicU64,
    /// Held until the pull loop starts.
    reader: Mutex<Option<ReadHalf<Box<dyn PeerStream>>>>,
    writer: Mutex<WriteHalf<Box<dyn PeerStream>>>,
    pending_ping: Mutex<Option<(Vec<u8>, Instant)>>,
    response_time: Mutex<Option<Duration>>,
    limiter: Arc<BandwidthLimiter>,
    events: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.remote.id)
            .field("uri", &self.uri)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

async fn send_doc(
    writer: &mut WriteHalf<Box<dyn PeerStream>>,
    bytes: &[u8],
) -> Result<()> {
    write_frame(writer, bytes)
        .await
        .context("handshake write failed")
}

async fn recv_doc(reader: &mut ReadHalf<Box<dyn PeerStream>>) -> Result<Vec<u8>> {
    match read_frame(reader, MAX_HANDSHAKE_SIZE).await {
        Ok(frame) => Ok(frame),
        Err(FrameError::TooLarge(_)) => Err(ProtocolError::BadHandshake.into()),
        Err(FrameError::Io(e)) => Err(anyhow!(e).context("handshake read failed")),
    }
}

impl Session {
    /// Run the handshake over `stream`. The returned session is `Negotiated`;
    /// nothing is read from the peer until [`Session::start`].
    ///
    /// Events for the new session are delivered on `events`.
    #[allow(clippy::too_many_arguments)]
    pub async fn handshake(
        stream: Box<dyn PeerStream>,
        uri: String,
        direction: Direction,
        local: &Node,
        config: SessionConfig,
        limiter: Arc<BandwidthLimiter>,
        events: mpsc::Sender<SessionEvent>,
        parent: &CancellationToken,
    ) -> Result<Arc<Session>> {
        let handshake_timeout = config.handshake_timeout;
        let exchange = Self::exchange(stream, local, &config);
        let (reader, writer, version, session_id, remote) =
            tokio::time::timeout(handshake_timeout, exchange)
                .await
                .map_err(|_| anyhow!("handshake with {} timed out", uri))??;

        Ok(Arc::new(Session {
            remote,
            uri,
            direction,
            version,
            session_id,
            config,
            state: AtomicU8::new(SessionState::Negotiated as u8),
            closed: AtomicBool::new(false),
            created: Instant::now(),
            last_sent_ms: AtomicU64::new(0),
            sent_bytes: AtomicU64::new(0),
            received_bytes: AtomicU64::new(0),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(writer),
            pending_ping: Mutex::new(None),
            response_time: Mutex::new(None),
            limiter,
            events,
            cancel: parent.child_token(),
        }))
    }

    /// Handshake and start in one step.
    #[allow(clippy::too_many_arguments)]
    pub async fn connect(
        stream: Box<dyn PeerStream>,
        uri: String,
        direction: Direction,
        local: &Node,
        config: SessionConfig,
        limiter: Arc<BandwidthLimiter>,
        events: mpsc::Sender<SessionEvent>,
        parent: &CancellationToken,
    ) -> Result<Arc<Session>> {
        let session =
            Self::handshake(stream, uri, direction, local, config, limiter, events, parent)
                .await?;
        session.start().await;
        Ok(session)
    }

    /// Enter `Active` and spawn the pull and keepalive loops. Only the first
    /// call on a `Negotiated` session has any effect.
    pub async fn start(self: &Arc<Self>) -> bool {
        let entered = self
            .state
            .compare_exchange(
                SessionState::Negotiated as u8,
                SessionState::Active as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if !entered {
            return false;
        }
        let Some(reader) = self.reader.lock().await.take() else {
            return false;
        };
        debug!(
            peer = ?self.remote.id,
            uri = %self.uri,
            direction = ?self.direction,
            version = self.version,
            "session active"
        );
        tokio::spawn(self.clone().pull_loop(reader));
        tokio::spawn(self.clone().keepalive_loop());
        true
    }

    #[allow(clippy::type_complexity)]
    async fn exchange(
        stream: Box<dyn PeerStream>,
        local: &Node,
        config: &SessionConfig,
    ) -> Result<(
        ReadHalf<Box<dyn PeerStream>>,
        WriteHalf<Box<dyn PeerStream>>,
        u32,
        [u8; 32],
        Node,
    )> {
        let (mut reader, mut writer) = tokio::io::split(stream);

        let hello = Hello {
            versions: config.versions.clone(),
        };
        send_doc(&mut writer, &encode_handshake(&hello)?).await?;
        let remote_hello: Hello = decode_handshake(&recv_doc(&mut reader).await?)?;
        let version = negotiate_version(&config.versions, &remote_hello.versions)
            .ok_or(ProtocolError::VersionMismatch)?;

        let mut half = [0u8; 32];
        OsRng.fill_bytes(&mut half);
        let init = SessionInit {
            session_id: half,
            node: local.clone(),
        };
        send_doc(&mut writer, &encode_handshake(&init)?).await?;
        let remote_init: SessionInit = decode_handshake(&recv_doc(&mut reader).await?)?;
        if !remote_init.node.validate_structure() {
            bail!(ProtocolError::BadHandshake);
        }
        if remote_init.node.id == local.id {
            bail!(ProtocolError::SelfConnection);
        }

        let mut session_id = [0u8; 32];
        for (i, byte) in session_id.iter_mut().enumerate() {
            *byte = half[i] ^ remote_init.session_id[i];
        }
        Ok((reader, writer, version, session_id, remote_init.node))
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn remote(&self) -> &Node {
        &self.remote
    }

    pub fn peer_id(&self) -> NodeId {
        self.remote.id
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn session_id(&self) -> [u8; 32] {
        self.session_id
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Token cancelled when the session closes.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn response_time(&self) -> Option<Duration> {
        *self.response_time.lock().await
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes.load(Ordering::Relaxed)
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes.load(Ordering::Relaxed)
    }

    pub async fn info(&self) -> SessionInfo {
        SessionInfo {
            node: self.remote.clone(),
            uri: self.uri.clone(),
            direction: self.direction,
            version: self.version,
            response_time: self.response_time().await,
            sent_bytes: self.sent_bytes(),
            received_bytes: self.received_bytes(),
            age: self.created.elapsed(),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.created.elapsed().as_millis() as u64
    }

    /// Time since the last successful send.
    pub fn send_idle(&self) -> Duration {
        let last = self.last_sent_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.elapsed_ms().saturating_sub(last))
    }

    // ------------------------------------------------------------------------
    // Close
    // ------------------------------------------------------------------------

    /// Close the session. Returns true if this call performed the close.
    ///
    /// The `Closed` event is queued and the writer shut down before the
    /// session token is cancelled, so a caller running under that token
    /// (a worker pass) cannot be dropped halfway through.
    pub async fn close(&self, reason: CloseReason) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.state
            .store(SessionState::Closed as u8, Ordering::SeqCst);

        if reason.is_abnormal() {
            debug!(peer = ?self.remote.id, reason = %reason, "session closed");
        } else {
            trace!(peer = ?self.remote.id, reason = %reason, "session closed");
        }
        let event = SessionEvent::Closed {
            peer: self.remote.id,
            session_id: self.session_id,
            reason,
        };
        match self.events.try_send(event) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                let events = self.events.clone();
                tokio::spawn(async move {
                    let _ = events.send(event).await;
                });
            }
        }

        if let Ok(mut writer) = self.writer.try_lock() {
            let _ = tokio::time::timeout(Duration::from_secs(1), writer.shutdown()).await;
        }
        self.cancel.cancel();
        true
    }

    /// Tell the remote we are leaving, then close. The remote records
    /// `RemoteCancel` instead of a transport failure.
    pub async fn cancel_and_close(&self, reason: CloseReason) -> bool {
        if self.is_closed() {
            return false;
        }
        let _ = tokio::time::timeout(CANCEL_NOTICE_TIMEOUT, self.push_cancel()).await;
        self.close(reason).await
    }

    // ------------------------------------------------------------------------
    // Push
    // ------------------------------------------------------------------------

    /// Send one message under the send timeout. A send failure closes the session.
    pub async fn push(&self, message: Message) -> Result<()> {
        if self.is_closed() {
            bail!("session closed");
        }
        let frame = message.encode()?;
        let bytes = frame.len() + FRAME_OVERHEAD;

        let send = async {
            self.limiter.acquire(bytes).await;
            let mut writer = self.writer.lock().await;
            write_frame(&mut *writer, &frame).await
        };
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => bail!("session closed"),
            r = tokio::time::timeout(self.config.send_timeout, send) => r,
        };

        match outcome {
            Ok(Ok(())) => {
                self.sent_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
                self.last_sent_ms
                    .store(self.elapsed_ms(), Ordering::Relaxed);
                Ok(())
            }
            Ok(Err(e)) => {
                let reason = CloseReason::Transport(e.to_string());
                self.close(reason).await;
                Err(anyhow!(e).context("push failed"))
            }
            Err(_) => {
                self.close(CloseReason::SendTimeout).await;
                bail!("push timed out")
            }
        }
    }

    pub async fn push_alive(&self) -> Result<()> {
        self.push(Message::Alive).await
    }

    pub async fn push_cancel(&self) -> Result<()> {
        self.push(Message::Cancel).await
    }

    pub async fn push_nodes_request(&self) -> Result<()> {
        self.push(Message::NodesRequest).await
    }

    pub async fn push_nodes(&self, nodes: Vec<Node>) -> Result<()> {
        self.push(Message::Nodes(nodes)).await
    }

    pub async fn push_blocks_link(&self, keys: Vec<Key>) -> Result<()> {
        self.push(Message::BlocksLink(keys)).await
    }

    pub async fn push_blocks_request(&self, keys: Vec<Key>) -> Result<()> {
        self.push(Message::BlocksRequest(keys)).await
    }

    pub async fn push_block(&self, key: Key, value: Vec<u8>) -> Result<()> {
        self.push(Message::Block { key, value }).await
    }

    pub async fn push_seeds_request(&self, signatures: Vec<String>) -> Result<()> {
        self.push(Message::SeedsRequest(signatures)).await
    }

    pub async fn push_seed(&self, seed: Seed) -> Result<()> {
        self.push(Message::Seed(Box::new(seed))).await
    }

    /// Send an RTT probe; the matching pong updates the response time.
    pub async fn ping(&self) -> Result<()> {
        let mut nonce = vec![0u8; PING_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        *self.pending_ping.lock().await = Some((nonce.clone(), Instant::now()));
        self.push(Message::Ping(nonce)).await
    }

    // ------------------------------------------------------------------------
    // Loops
    // ------------------------------------------------------------------------

    async fn pull_loop(self: Arc<Self>, mut reader: ReadHalf<Box<dyn PeerStream>>) {
        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return,
                r = tokio::time::timeout(
                    self.config.receive_timeout,
                    read_frame(&mut reader, MAX_FRAME_SIZE),
                ) => r,
            };
            let frame = match read {
                Ok(Ok(frame)) => frame,
                Ok(Err(FrameError::TooLarge(len))) => {
                    self.close(CloseReason::Protocol(ProtocolError::FrameTooLarge(len)))
                        .await;
                    return;
                }
                Ok(Err(FrameError::Io(e))) => {
                    self.close(CloseReason::Transport(e.to_string())).await;
                    return;
                }
                Err(_) => {
                    self.close(CloseReason::ReceiveTimeout).await;
                    return;
                }
            };

            let bytes = frame.len() + FRAME_OVERHEAD;
            self.received_bytes
                .fetch_add(bytes as u64, Ordering::Relaxed);

            let message = match Message::decode(&frame) {
                Ok(message) => message,
                Err(e) => {
                    warn!(peer = ?self.remote.id, error = %e, "protocol violation");
                    self.close(CloseReason::Protocol(e)).await;
                    return;
                }
            };
            trace!(peer = ?self.remote.id, kind = ?message.message_type(), bytes, "pulled");

            match message {
                Message::Alive => {}
                Message::Ping(nonce) => {
                    if self.push(Message::Pong(nonce)).await.is_err() {
                        return;
                    }
                }
                Message::Pong(nonce) => {
                    if let Err(e) = self.on_pong(&nonce).await {
                        warn!(peer = ?self.remote.id, error = %e, "protocol violation");
                        self.close(CloseReason::Protocol(e)).await;
                        return;
                    }
                }
                Message::Cancel => {
                    self.emit(Message::Cancel, bytes).await;
                    self.close(CloseReason::RemoteCancel).await;
                    return;
                }
                other => {
                    if !self.emit(other, bytes).await {
                        return;
                    }
                }
            }
        }
    }

    async fn emit(&self, message: Message, bytes: usize) -> bool {
        self.events
            .send(SessionEvent::Pulled {
                peer: self.remote.id,
                session_id: self.session_id,
                message,
                bytes,
            })
            .await
            .is_ok()
    }

    async fn on_pong(&self, nonce: &[u8]) -> Result<(), ProtocolError> {
        let mut pending = self.pending_ping.lock().await;
        match pending.take() {
            Some((expected, sent_at)) if expected == nonce => {
                let sample = sent_at.elapsed();
                let mut rtt = self.response_time.lock().await;
                *rtt = Some(match *rtt {
                    None => sample,
                    Some(prev) => prev.mul_f64(1.0 - RTT_EMA_ALPHA) + sample.mul_f64(RTT_EMA_ALPHA),
                });
                trace!(peer = ?self.remote.id, rtt_ms = sample.as_millis() as u64, "pong");
                Ok(())
            }
            _ => Err(ProtocolError::UnsolicitedPong),
        }
    }

    async fn keepalive_loop(self: Arc<Self>) {
        if self.ping().await.is_err() {
            return;
        }
        let interval = self.config.keepalive_interval;
        loop {
            let wait = interval.saturating_sub(self.send_idle());
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            if self.send_idle() >= interval && self.push_alive().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MessageType;
    use crate::scheduler::Scheduler;

    fn node(i: u8) -> Node {
        Node::new(NodeId::from_bytes([i; 32]), vec![format!("mem:{}", i)])
    }

    struct Pair {
        a: Arc<Session>,
        b: Arc<Session>,
        a_events: mpsc::Receiver<SessionEvent>,
        b_events: mpsc::Receiver<SessionEvent>,
    }

    async fn connect_pair(config: SessionConfig) -> Pair {
        let (sa, sb) = tokio::io::duplex(1 << 20);
        let (a_tx, a_events) = mpsc::channel(64);
        let (b_tx, b_events) = mpsc::channel(64);
        let root = CancellationToken::new();
        let (one, two) = (node(1), node(2));
        let limiter = Arc::new(BandwidthLimiter::unlimited());
        let (a, b) = tokio::join!(
            Session::connect(
                Box::new(sa),
                "mem:2".into(),
                Direction::Outbound,
                &one,
                config.clone(),
                limiter.clone(),
                a_tx,
                &root,
            ),
            Session::connect(
                Box::new(sb),
                "mem:1".into(),
                Direction::Inbound,
                &two,
                config,
                limiter,
                b_tx,
                &root,
            ),
        );
        Pair {
            a: a.unwrap(),
            b: b.unwrap(),
            a_events,
            b_events,
        }
    }

    async fn next_pulled(events: &mut mpsc::Receiver<SessionEvent>) -> Message {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("event timeout")
                .expect("channel open")
            {
                SessionEvent::Pulled { message, .. } => return message,
                SessionEvent::Closed { reason, .. } => panic!("unexpected close: {}", reason),
            }
        }
    }

    async fn next_close(events: &mut mpsc::Receiver<SessionEvent>) -> CloseReason {
        loop {
            match tokio::time::timeout(Duration::from_secs(600), events.recv())
                .await
                .expect("event timeout")
                .expect("channel open")
            {
                SessionEvent::Closed { reason, .. } => return reason,
                SessionEvent::Pulled { .. } => continue,
            }
        }
    }

    /// Drive the peer side of a handshake by hand, returning the raw halves.
    async fn raw_handshake(
        stream: tokio::io::DuplexStream,
        me: Node,
        versions: Vec<u32>,
    ) -> (
        ReadHalf<tokio::io::DuplexStream>,
        WriteHalf<tokio::io::DuplexStream>,
    ) {
        let (mut r, mut w) = tokio::io::split(stream);
        write_frame(&mut w, &encode_handshake(&Hello { versions }).unwrap())
            .await
            .unwrap();
        let _: Hello = decode_handshake(&read_frame(&mut r, MAX_HANDSHAKE_SIZE).await.unwrap())
            .unwrap();
        let init = SessionInit {
            session_id: [7u8; 32],
            node: me,
        };
        write_frame(&mut w, &encode_handshake(&init).unwrap())
            .await
            .unwrap();
        let _: SessionInit =
            decode_handshake(&read_frame(&mut r, MAX_HANDSHAKE_SIZE).await.unwrap()).unwrap();
        (r, w)
    }

    async fn connect_raw(
        config: SessionConfig,
    ) -> (
        Arc<Session>,
        mpsc::Receiver<SessionEvent>,
        ReadHalf<tokio::io::DuplexStream>,
        WriteHalf<tokio::io::DuplexStream>,
    ) {
        let (sa, sb) = tokio::io::duplex(1 << 20);
        let (tx, rx) = mpsc::channel(64);
        let root = CancellationToken::new();
        let one = node(1);
        let (session, (r, w)) = tokio::join!(
            Session::connect(
                Box::new(sa),
                "mem:2".into(),
                Direction::Outbound,
                &one,
                config,
                Arc::new(BandwidthLimiter::unlimited()),
                tx,
                &root,
            ),
            raw_handshake(sb, node(2), vec![1]),
        );
        (session.unwrap(), rx, r, w)
    }

    #[tokio::test]
    async fn test_handshake_exchanges_nodes_and_session_id() {
        let pair = connect_pair(SessionConfig::default()).await;
        assert_eq!(pair.a.remote().id, node(2).id);
        assert_eq!(pair.b.remote().id, node(1).id);
        assert_eq!(pair.a.session_id(), pair.b.session_id());
        assert_eq!(pair.a.state(), SessionState::Active);
        assert_eq!(pair.b.direction(), Direction::Inbound);
    }

    #[tokio::test]
    async fn test_start_enters_active_once() {
        let (sa, sb) = tokio::io::duplex(1 << 16);
        let (tx, _rx) = mpsc::channel(8);
        let root = CancellationToken::new();
        let (one, two) = (node(1), node(2));
        let limiter = Arc::new(BandwidthLimiter::unlimited());
        let (a, _b) = tokio::join!(
            Session::handshake(
                Box::new(sa),
                "mem:2".into(),
                Direction::Outbound,
                &one,
                SessionConfig::default(),
                limiter.clone(),
                tx.clone(),
                &root,
            ),
            Session::handshake(
                Box::new(sb),
                "mem:1".into(),
                Direction::Inbound,
                &two,
                SessionConfig::default(),
                limiter,
                tx,
                &root,
            ),
        );
        let a = a.unwrap();
        assert_eq!(a.state(), SessionState::Negotiated);
        assert!(a.start().await);
        assert!(!a.start().await);
        assert_eq!(a.state(), SessionState::Active);
        a.close(CloseReason::Local).await;
        assert!(!a.start().await);
    }

    #[tokio::test]
    async fn test_version_mismatch_fails_closed() {
        let (sa, sb) = tokio::io::duplex(1 << 16);
        let (tx, _rx) = mpsc::channel(8);
        let root = CancellationToken::new();
        let one = node(1);
        let (session, _) = tokio::join!(
            Session::connect(
                Box::new(sa),
                "mem:2".into(),
                Direction::Outbound,
                &one,
                SessionConfig::default(),
                Arc::new(BandwidthLimiter::unlimited()),
                tx,
                &root,
            ),
            async move {
                let (mut r, mut w) = tokio::io::split(sb);
                let hello = Hello { versions: vec![99] };
                write_frame(&mut w, &encode_handshake(&hello).unwrap())
                    .await
                    .unwrap();
                let _ = read_frame(&mut r, MAX_HANDSHAKE_SIZE).await;
                (r, w)
            },
        );
        let err = session.unwrap_err();
        assert_eq!(
            err.downcast_ref::<ProtocolError>(),
            Some(&ProtocolError::VersionMismatch)
        );
    }

    #[tokio::test]
    async fn test_self_connection_rejected() {
        let (sa, sb) = tokio::io::duplex(1 << 16);
        let (tx, _rx) = mpsc::channel(8);
        let root = CancellationToken::new();
        let one = node(1);
        let (session, _) = tokio::join!(
            Session::connect(
                Box::new(sa),
                "mem:1".into(),
                Direction::Outbound,
                &one,
                SessionConfig::default(),
                Arc::new(BandwidthLimiter::unlimited()),
                tx,
                &root,
            ),
            raw_handshake(sb, node(1), vec![1]),
        );
        assert_eq!(
            session.unwrap_err().downcast_ref::<ProtocolError>(),
            Some(&ProtocolError::SelfConnection)
        );
    }

    #[tokio::test]
    async fn test_push_delivers_pull_event() {
        let mut pair = connect_pair(SessionConfig::default()).await;
        let keys = vec![Key::from_content(b"x")];
        pair.a.push_blocks_link(keys.clone()).await.unwrap();
        assert_eq!(next_pulled(&mut pair.b_events).await, Message::BlocksLink(keys));
        assert!(pair.a.sent_bytes() > 0);
    }

    #[tokio::test]
    async fn test_ping_pong_measures_response_time() {
        let pair = connect_pair(SessionConfig::default()).await;
        for _ in 0..100 {
            if pair.a.response_time().await.is_some() && pair.b.response_time().await.is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("response time never measured");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut pair = connect_pair(SessionConfig::default()).await;
        assert!(pair.a.close(CloseReason::Local).await);
        assert!(!pair.a.close(CloseReason::Local).await);
        assert!(pair.a.push_alive().await.is_err());

        assert_eq!(next_close(&mut pair.a_events).await, CloseReason::Local);
        // the remote sees the stream end
        assert!(next_close(&mut pair.b_events).await.is_abnormal());

        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(event) = pair.a_events.try_recv() {
            assert!(
                !matches!(event, SessionEvent::Closed { .. }),
                "second close event"
            );
        }
        assert_eq!(pair.a.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_close_from_own_task_reports_with_full_channel() {
        let (sa, sb) = tokio::io::duplex(1 << 16);
        let (a_tx, mut a_events) = mpsc::channel(1);
        let (b_tx, _b_events) = mpsc::channel(8);
        let root = CancellationToken::new();
        let (one, two) = (node(1), node(2));
        let limiter = Arc::new(BandwidthLimiter::unlimited());
        let (a, b) = tokio::join!(
            Session::handshake(
                Box::new(sa),
                "mem:2".into(),
                Direction::Outbound,
                &one,
                SessionConfig::default(),
                limiter.clone(),
                a_tx.clone(),
                &root,
            ),
            Session::handshake(
                Box::new(sb),
                "mem:1".into(),
                Direction::Inbound,
                &two,
                SessionConfig::default(),
                limiter,
                b_tx,
                &root,
            ),
        );
        let (a, _b) = (a.unwrap(), b.unwrap());

        // the only slot is taken, so the close notice cannot be sent inline
        a_tx.send(SessionEvent::Pulled {
            peer: node(2).id,
            session_id: a.session_id(),
            message: Message::Alive,
            bytes: 0,
        })
        .await
        .unwrap();

        let mut tasks = Scheduler::new(a.cancel_token());
        let closing = a.clone();
        tasks.spawn("close", async move {
            closing.close(CloseReason::Local).await;
        });
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            while !a.is_closed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(closed.is_ok());

        assert!(matches!(
            a_events.recv().await,
            Some(SessionEvent::Pulled { .. })
        ));
        match tokio::time::timeout(Duration::from_secs(5), a_events.recv()).await {
            Ok(Some(SessionEvent::Closed { reason, .. })) => assert_eq!(reason, CloseReason::Local),
            other => panic!("expected close event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_and_close_reports_remote_cancel() {
        let mut pair = connect_pair(SessionConfig::default()).await;
        assert!(pair.a.cancel_and_close(CloseReason::Shutdown).await);
        assert!(!pair.a.cancel_and_close(CloseReason::Shutdown).await);
        assert_eq!(next_close(&mut pair.a_events).await, CloseReason::Shutdown);
        assert_eq!(next_close(&mut pair.b_events).await, CloseReason::RemoteCancel);
    }

    #[tokio::test]
    async fn test_cancel_frame_is_reported_then_closes() {
        let mut pair = connect_pair(SessionConfig::default()).await;
        pair.a.push_cancel().await.unwrap();
        assert_eq!(next_pulled(&mut pair.b_events).await, Message::Cancel);
        assert_eq!(
            next_close(&mut pair.b_events).await,
            CloseReason::RemoteCancel
        );
    }

    #[tokio::test]
    async fn test_unknown_frame_is_protocol_violation() {
        let (session, mut events, _r, mut w) = connect_raw(SessionConfig::default()).await;
        write_frame(&mut w, &[0xEE, 1, 2]).await.unwrap();
        assert_eq!(
            next_close(&mut events).await,
            CloseReason::Protocol(ProtocolError::UnknownType(0xEE))
        );
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_unsolicited_pong_is_protocol_violation() {
        let (_session, mut events, _r, mut w) = connect_raw(SessionConfig::default()).await;
        let pong = Message::Pong(vec![1, 2, 3]).encode().unwrap();
        write_frame(&mut w, &pong).await.unwrap();
        assert_eq!(
            next_close(&mut events).await,
            CloseReason::Protocol(ProtocolError::UnsolicitedPong)
        );
    }

    #[tokio::test]
    async fn test_oversized_ping_is_protocol_violation() {
        let (_session, mut events, _r, mut w) = connect_raw(SessionConfig::default()).await;
        let mut frame = vec![MessageType::Ping as u8];
        frame.extend_from_slice(&[0u8; 65]);
        write_frame(&mut w, &frame).await.unwrap();
        assert!(matches!(
            next_close(&mut events).await,
            CloseReason::Protocol(ProtocolError::Oversized { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_sent_when_idle() {
        let (_session, _events, mut r, _w) = connect_raw(SessionConfig::default()).await;
        // first frame is the RTT probe
        let first = Message::decode(&read_frame(&mut r, MAX_FRAME_SIZE).await.unwrap()).unwrap();
        assert!(matches!(first, Message::Ping(_)));

        let started = Instant::now();
        let second = Message::decode(&read_frame(&mut r, MAX_FRAME_SIZE).await.unwrap()).unwrap();
        assert_eq!(second, Message::Alive);
        assert!(started.elapsed() >= DEFAULT_KEEPALIVE_INTERVAL - Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_hits_receive_timeout() {
        let (_session, mut events, _r, _w) = connect_raw(SessionConfig::default()).await;
        assert_eq!(next_close(&mut events).await, CloseReason::ReceiveTimeout);
    }
}
