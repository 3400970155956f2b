//! # SeedMesh - Peer Routing and Gossip Dissemination
//!
//! SeedMesh is the overlay engine of an anonymous content-distribution
//! network. Nodes find each other without a directory, advertise and request
//! content-addressed blocks, and spread small signed descriptors ("seeds").
//!
//! - **Routing**: XOR-distance routing table behind a destination filter
//! - **Sessions**: framed, versioned peer sessions with keepalive and RTT probing
//! - **Peer state**: bounded, time-decaying per-peer want/have sets and reputation
//! - **Dissemination**: a scheduler that maps wanted/held blocks and seeds onto
//!   the connected peers nearest to them, flushed by one worker per peer
//!
//! ## Architecture
//!
//! [`ConnectionsManager`] owns all shared state. Sessions report pulled frames
//! and closes as [`SessionEvent`]s on a single channel consumed by the
//! manager; periodic work runs as independent [`Scheduler`] tasks, each with
//! its own interval and cancellation token.
//!
//! ## Security Model
//!
//! - Every peer-supplied frame is decoded under an explicit size bound
//! - Seeds are ed25519-signed; invalid certificates are dropped on receipt
//! - Blocks are verified against their key by the store before acceptance
//! - Abnormal closes accumulate strikes; three strikes blacklist the peer
//! - Every table, set and cache is capacity-bounded
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `identity` | Node ids, node descriptors, content keys, keypairs |
//! | `crypto` | Domain-separated signatures, certificates, seeds |
//! | `messages` | Wire messages, framing, handshake documents |
//! | `protocols` | Block store and transport collaborator traits |
//! | `transport` | TCP and in-memory transports |
//! | `store` | In-memory block store |
//! | `ttl` | Time-bounded sets and maps |
//! | `bandwidth` | Shared token-bucket send budget |
//! | `session` | Peer session state machine |
//! | `routing` | Routing table, uri filter, router adapter |
//! | `peer_state` | Per-peer state records and the bounded table |
//! | `reputation` | Reconnect candidates, blacklist, strikes |
//! | `search` | Nearest-peer lookup snapshot |
//! | `scheduler` | Periodic task runner |
//! | `dissemination` | Per-peer assignments and planning |
//! | `worker` | Per-peer worker tasks |
//! | `manager` | Engine facade |
//! | `config` | Engine configuration |

mod bandwidth;
mod config;
mod crypto;
mod dissemination;
mod identity;
mod manager;
mod messages;
mod peer_state;
mod protocols;
mod reputation;
mod routing;
mod scheduler;
mod search;
mod session;
mod store;
mod transport;
mod ttl;
mod worker;

pub use bandwidth::BandwidthLimiter;
pub use config::EngineConfig;
pub use crypto::{
    Certificate, CompressionAlgorithm, CryptoAlgorithm, PUBLISHED_INDEX_KEYWORD, Seed, SeedError,
    SignatureError, signature_string_of,
};
pub use dissemination::{Assignment, Assignments};
pub use identity::{HashAlgorithm, Key, Keypair, Node, NodeId, signature_target};
pub use manager::{
    ConnectionInformation, ConnectionsManager, EngineEvent, Information, PersistedState,
};
pub use messages::{
    FrameError, Hello, MAX_BLOCK_SIZE, MAX_FRAME_SIZE, Message, MessageType, ProtocolError,
    SessionInit, read_frame, write_frame,
};
pub use peer_state::{
    EvictionPolicy, LeastRecentlyTouched, PeerState, PeerStateConfig, PeerStateTable,
};
pub use protocols::{BlockStore, PeerStream, StoreError, Transport};
pub use reputation::{Reputation, ReputationConfig};
pub use routing::{FilterAction, Router, RoutingTable, UriFilter, UriRule};
pub use scheduler::Scheduler;
pub use search::{PeerSample, SearchSnapshot};
pub use session::{
    CloseReason, Direction, Session, SessionConfig, SessionEvent, SessionInfo, SessionState,
};
pub use store::MemoryBlockStore;
pub use transport::{MemoryNetwork, MemoryTransport, TCP_SCHEME, TcpTransport};
pub use ttl::{TtlMap, TtlSet};
