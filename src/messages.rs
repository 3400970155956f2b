//! # Wire Protocol Messages
//!
//! Every frame on a peer stream is laid out as:
//!
//! ```text
//! u32 big-endian length || tag (1 byte) || type-specific payload
//! ```
//!
//! The payload of list and record types is bincode with size limits. Ping and
//! pong carry their nonce as raw bytes; keepalive, cancel and node-list-request
//! carry nothing.
//!
//! | Tag | Message | Payload |
//! |-----|---------|---------|
//! | 0 | `Alive` | empty |
//! | 1 | `Cancel` | empty |
//! | 2 | `Ping` | nonce, ≤ 64 bytes |
//! | 3 | `Pong` | echoed nonce, ≤ 64 bytes |
//! | 4 | `NodesRequest` | empty |
//! | 5 | `Nodes` | `Vec<Node>` |
//! | 6 | `BlocksLink` | `Vec<Key>` |
//! | 7 | `BlocksRequest` | `Vec<Key>` |
//! | 8 | `Block` | `(Key, bytes)` |
//! | 9 | `SeedsRequest` | `Vec<String>` signatures |
//! | 10 | `Seed` | `Seed` |
//! | 11 | `LegacySeeds` | `Vec<Seed>` (decode only) |
//!
//! ## Security Limits
//!
//! - Whole frames are capped at [`MAX_FRAME_SIZE`] before any allocation
//! - Each type decodes with its own bincode limit and element-count cap
//! - Anything unrecognized or oversized is a [`ProtocolError`]

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::Seed;
use crate::identity::{Key, Node};

/// Protocol versions this implementation speaks, highest preferred.
pub const SUPPORTED_VERSIONS: &[u32] = &[1];

/// Maximum size of one content block (4 MiB).
pub const MAX_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Maximum frame length on the wire. Block frames dominate.
pub const MAX_FRAME_SIZE: usize = MAX_BLOCK_SIZE + 64 * 1024;

/// Maximum size of a handshake document.
pub const MAX_HANDSHAKE_SIZE: usize = 16 * 1024;

/// Maximum ping/pong nonce size.
pub const MAX_PING_SIZE: usize = 64;

/// Maximum encoded size of one seed.
pub const MAX_SEED_SIZE: usize = 64 * 1024;

/// Maximum nodes in one node-list frame.
pub const MAX_NODES_PER_FRAME: usize = 1024;

/// Maximum keys in one links/request frame.
pub const MAX_KEYS_PER_FRAME: usize = 8192;

/// Maximum signatures in one seed-request frame.
pub const MAX_SIGNATURES_PER_FRAME: usize = 1024;

/// Maximum length of one signature string.
pub const MAX_SIGNATURE_LEN: usize = 128;

/// Maximum seeds in one legacy multi-seed frame.
pub const MAX_LEGACY_SEEDS: usize = 128;

fn bincode_options(limit: usize) -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(limit as u64)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
/// SECURITY: use this instead of raw bincode::deserialize for peer data.
pub fn deserialize_bounded<T: DeserializeOwned>(
    bytes: &[u8],
    limit: usize,
) -> Result<T, bincode::Error> {
    bincode_options(limit).deserialize(bytes)
}

fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options(MAX_FRAME_SIZE).serialize(value)
}

// ============================================================================
// Errors
// ============================================================================

/// Violations of the wire protocol. Always fatal to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The tag byte does not name a message type.
    UnknownType(u8),
    /// The frame has no tag byte.
    EmptyFrame,
    /// A payload exceeds its per-type cap.
    Oversized { kind: MessageType, len: usize },
    /// A payload failed to decode or validate.
    Malformed(MessageType),
    /// A frame length prefix exceeds [`MAX_FRAME_SIZE`].
    FrameTooLarge(usize),
    /// A handshake document failed to decode.
    BadHandshake,
    /// No protocol version is supported by both sides.
    VersionMismatch,
    /// A pong arrived with no matching ping outstanding.
    UnsolicitedPong,
    /// The peer presented our own identity.
    SelfConnection,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::UnknownType(tag) => write!(f, "unknown message type {}", tag),
            ProtocolError::EmptyFrame => write!(f, "empty frame"),
            ProtocolError::Oversized { kind, len } => {
                write!(f, "{:?} payload too large: {} bytes", kind, len)
            }
            ProtocolError::Malformed(kind) => write!(f, "malformed {:?} payload", kind),
            ProtocolError::FrameTooLarge(len) => {
                write!(f, "frame too large: {} bytes (max {})", len, MAX_FRAME_SIZE)
            }
            ProtocolError::BadHandshake => write!(f, "malformed handshake document"),
            ProtocolError::VersionMismatch => write!(f, "no common protocol version"),
            ProtocolError::UnsolicitedPong => write!(f, "pong without outstanding ping"),
            ProtocolError::SelfConnection => write!(f, "peer presented our own identity"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Failure reading one frame off the stream.
#[derive(Debug)]
pub enum FrameError {
    Io(std::io::Error),
    TooLarge(usize),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Io(e) => write!(f, "frame read failed: {}", e),
            FrameError::TooLarge(len) => write!(f, "frame too large: {} bytes", len),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        FrameError::Io(e)
    }
}

// ============================================================================
// Framing
// ============================================================================

/// Write one length-prefixed frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    frame: &[u8],
) -> std::io::Result<()> {
    let len = u32::try_from(frame.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too large"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(frame).await?;
    writer.flush().await
}

/// Read one length-prefixed frame of at most `max_len` bytes.
pub async fn read_frame<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    max_len: usize,
) -> Result<Vec<u8>, FrameError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(FrameError::TooLarge(len));
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Ok(frame)
}

// ============================================================================
// Handshake documents
// ============================================================================

/// Capability document sent first by both sides.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub versions: Vec<u32>,
}

/// Sent by both sides once a version is agreed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionInit {
    pub session_id: [u8; 32],
    pub node: Node,
}

pub fn encode_handshake<T: Serialize>(doc: &T) -> Result<Vec<u8>, ProtocolError> {
    serialize(doc).map_err(|_| ProtocolError::BadHandshake)
}

pub fn decode_handshake<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    deserialize_bounded(bytes, MAX_HANDSHAKE_SIZE).map_err(|_| ProtocolError::BadHandshake)
}

/// Highest version present in both lists.
pub fn negotiate_version(local: &[u32], remote: &[u32]) -> Option<u32> {
    local
        .iter()
        .filter(|v| remote.contains(v))
        .max()
        .copied()
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Alive = 0,
    Cancel = 1,
    Ping = 2,
    Pong = 3,
    NodesRequest = 4,
    Nodes = 5,
    BlocksLink = 6,
    BlocksRequest = 7,
    Block = 8,
    SeedsRequest = 9,
    Seed = 10,
    LegacySeeds = 11,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Ok(match tag {
            0 => MessageType::Alive,
            1 => MessageType::Cancel,
            2 => MessageType::Ping,
            3 => MessageType::Pong,
            4 => MessageType::NodesRequest,
            5 => MessageType::Nodes,
            6 => MessageType::BlocksLink,
            7 => MessageType::BlocksRequest,
            8 => MessageType::Block,
            9 => MessageType::SeedsRequest,
            10 => MessageType::Seed,
            11 => MessageType::LegacySeeds,
            other => return Err(ProtocolError::UnknownType(other)),
        })
    }
}

impl MessageType {
    /// Largest payload accepted for this type.
    fn payload_limit(self) -> usize {
        match self {
            MessageType::Alive | MessageType::Cancel | MessageType::NodesRequest => 0,
            MessageType::Ping | MessageType::Pong => MAX_PING_SIZE,
            MessageType::Seed => MAX_SEED_SIZE,
            MessageType::LegacySeeds => MAX_SEED_SIZE * 4,
            MessageType::Nodes => 1024 * 1024,
            MessageType::BlocksLink | MessageType::BlocksRequest => 1024 * 1024,
            MessageType::SeedsRequest => 256 * 1024,
            MessageType::Block => MAX_FRAME_SIZE - 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// Keepalive no-op.
    Alive,
    /// The sender is about to close the session.
    Cancel,
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    NodesRequest,
    Nodes(Vec<Node>),
    /// Blocks the sender holds.
    BlocksLink(Vec<Key>),
    /// Blocks the sender wants.
    BlocksRequest(Vec<Key>),
    Block { key: Key, value: Vec<u8> },
    /// Seed signatures the sender wants.
    SeedsRequest(Vec<String>),
    Seed(Box<Seed>),
    /// Legacy multi-seed frame; accepted on receive, never sent.
    LegacySeeds(Vec<Seed>),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Alive => MessageType::Alive,
            Message::Cancel => MessageType::Cancel,
            Message::Ping(_) => MessageType::Ping,
            Message::Pong(_) => MessageType::Pong,
            Message::NodesRequest => MessageType::NodesRequest,
            Message::Nodes(_) => MessageType::Nodes,
            Message::BlocksLink(_) => MessageType::BlocksLink,
            Message::BlocksRequest(_) => MessageType::BlocksRequest,
            Message::Block { .. } => MessageType::Block,
            Message::SeedsRequest(_) => MessageType::SeedsRequest,
            Message::Seed(_) => MessageType::Seed,
            Message::LegacySeeds(_) => MessageType::LegacySeeds,
        }
    }

    /// True for frames that carry dissemination content, as opposed to
    /// session maintenance (keepalive, cancel, ping, pong).
    pub fn is_content(&self) -> bool {
        !matches!(
            self,
            Message::Alive | Message::Cancel | Message::Ping(_) | Message::Pong(_)
        )
    }

    /// Encode as `tag || payload` (without the length prefix).
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let kind = self.message_type();
        let mut out = vec![kind as u8];
        let payload = match self {
            Message::Alive | Message::Cancel | Message::NodesRequest => Ok(Vec::new()),
            Message::Ping(nonce) | Message::Pong(nonce) => Ok(nonce.clone()),
            Message::Nodes(nodes) => serialize(nodes),
            Message::BlocksLink(keys) | Message::BlocksRequest(keys) => serialize(keys),
            Message::Block { key, value } => serialize(&(key, value)),
            Message::SeedsRequest(signatures) => serialize(signatures),
            Message::Seed(seed) => serialize(seed.as_ref()),
            Message::LegacySeeds(seeds) => serialize(seeds),
        }
        .map_err(|_| ProtocolError::Malformed(kind))?;

        if payload.len() > kind.payload_limit() {
            return Err(ProtocolError::Oversized {
                kind,
                len: payload.len(),
            });
        }
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Decode `tag || payload`, enforcing every per-type bound.
    pub fn decode(frame: &[u8]) -> Result<Message, ProtocolError> {
        let (&tag, payload) = frame.split_first().ok_or(ProtocolError::EmptyFrame)?;
        let kind = MessageType::try_from(tag)?;
        let limit = kind.payload_limit();
        if payload.len() > limit {
            return Err(ProtocolError::Oversized {
                kind,
                len: payload.len(),
            });
        }
        let malformed = |_| ProtocolError::Malformed(kind);

        let message = match kind {
            MessageType::Alive => Message::Alive,
            MessageType::Cancel => Message::Cancel,
            MessageType::NodesRequest => Message::NodesRequest,
            MessageType::Ping => Message::Ping(payload.to_vec()),
            MessageType::Pong => Message::Pong(payload.to_vec()),
            MessageType::Nodes => {
                let nodes: Vec<Node> = deserialize_bounded(payload, limit).map_err(malformed)?;
                if nodes.len() > MAX_NODES_PER_FRAME || !nodes.iter().all(Node::validate_structure)
                {
                    return Err(ProtocolError::Malformed(kind));
                }
                Message::Nodes(nodes)
            }
            MessageType::BlocksLink | MessageType::BlocksRequest => {
                let keys: Vec<Key> = deserialize_bounded(payload, limit).map_err(malformed)?;
                if keys.len() > MAX_KEYS_PER_FRAME || !keys.iter().all(Key::validate_structure) {
                    return Err(ProtocolError::Malformed(kind));
                }
                if kind == MessageType::BlocksLink {
                    Message::BlocksLink(keys)
                } else {
                    Message::BlocksRequest(keys)
                }
            }
            MessageType::Block => {
                let (key, value): (Key, Vec<u8>) =
                    deserialize_bounded(payload, limit).map_err(malformed)?;
                if !key.validate_structure() || value.len() > MAX_BLOCK_SIZE {
                    return Err(ProtocolError::Malformed(kind));
                }
                Message::Block { key, value }
            }
            MessageType::SeedsRequest => {
                let signatures: Vec<String> =
                    deserialize_bounded(payload, limit).map_err(malformed)?;
                if signatures.len() > MAX_SIGNATURES_PER_FRAME
                    || signatures.iter().any(|s| s.len() > MAX_SIGNATURE_LEN)
                {
                    return Err(ProtocolError::Malformed(kind));
                }
                Message::SeedsRequest(signatures)
            }
            MessageType::Seed => {
                let seed: Seed = deserialize_bounded(payload, limit).map_err(malformed)?;
                seed.validate_structure()
                    .map_err(|_| ProtocolError::Malformed(kind))?;
                Message::Seed(Box::new(seed))
            }
            MessageType::LegacySeeds => {
                let seeds: Vec<Seed> = deserialize_bounded(payload, limit).map_err(malformed)?;
                if seeds.len() > MAX_LEGACY_SEEDS
                    || seeds.iter().any(|s| s.validate_structure().is_err())
                {
                    return Err(ProtocolError::Malformed(kind));
                }
                Message::LegacySeeds(seeds)
            }
        };
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Keypair, NodeId};

    fn signed_seed() -> Seed {
        let mut seed = Seed::new(Some("doc".into()), Key::from_content(b"doc"), 10, 1)
            .into_published_index();
        seed.sign(&Keypair::generate()).unwrap();
        seed
    }

    #[test]
    fn test_version_negotiation_picks_highest_common() {
        assert_eq!(negotiate_version(&[1, 2, 3], &[2, 3, 4]), Some(3));
        assert_eq!(negotiate_version(&[1], &[2]), None);
        assert_eq!(negotiate_version(&[], &[1]), None);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert_eq!(Message::decode(&[200]), Err(ProtocolError::UnknownType(200)));
        assert_eq!(Message::decode(&[]), Err(ProtocolError::EmptyFrame));
    }

    #[test]
    fn test_oversized_ping_rejected() {
        let mut frame = vec![MessageType::Ping as u8];
        frame.extend_from_slice(&[0u8; MAX_PING_SIZE + 1]);
        assert!(matches!(
            Message::decode(&frame),
            Err(ProtocolError::Oversized { kind: MessageType::Ping, .. })
        ));
        assert!(Message::Pong(vec![0u8; MAX_PING_SIZE + 1]).encode().is_err());
    }

    #[test]
    fn test_alive_with_payload_rejected() {
        let frame = [MessageType::Alive as u8, 0];
        assert!(matches!(
            Message::decode(&frame),
            Err(ProtocolError::Oversized { .. })
        ));
    }

    #[test]
    fn test_block_frame_decodes() {
        let value = b"payload".to_vec();
        let key = Key::from_content(&value);
        let frame = Message::Block {
            key: key.clone(),
            value: value.clone(),
        }
        .encode()
        .unwrap();
        assert_eq!(frame[0], MessageType::Block as u8);
        assert_eq!(Message::decode(&frame).unwrap(), Message::Block { key, value });
    }

    #[test]
    fn test_truncated_payload_is_malformed() {
        let frame = Message::BlocksLink(vec![Key::from_content(b"a"), Key::from_content(b"b")])
            .encode()
            .unwrap();
        let truncated = &frame[..frame.len() - 3];
        assert_eq!(
            Message::decode(truncated),
            Err(ProtocolError::Malformed(MessageType::BlocksLink))
        );
    }

    #[test]
    fn test_invalid_node_in_list_rejected() {
        let bad = Node::new(NodeId::random(), vec![String::new()]);
        let frame = Message::Nodes(vec![bad]).encode().unwrap();
        assert_eq!(
            Message::decode(&frame),
            Err(ProtocolError::Malformed(MessageType::Nodes))
        );
    }

    #[test]
    fn test_legacy_seeds_decode_to_list() {
        let seeds = vec![signed_seed(), signed_seed()];
        let frame = Message::LegacySeeds(seeds.clone()).encode().unwrap();
        assert_eq!(Message::decode(&frame).unwrap(), Message::LegacySeeds(seeds));
    }

    #[test]
    fn test_content_classification() {
        assert!(!Message::Alive.is_content());
        assert!(!Message::Pong(vec![1]).is_content());
        // a cancel ends the session rather than proving it useful
        assert!(!Message::Cancel.is_content());
        assert!(Message::NodesRequest.is_content());
        assert!(Message::Seed(Box::new(signed_seed())).is_content());
    }

    #[tokio::test]
    async fn test_frame_length_limit_enforced() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &[7u8; 100]).await.unwrap();
        match read_frame(&mut b, 10).await {
            Err(FrameError::TooLarge(100)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handshake_documents_over_stream() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let hello = Hello { versions: vec![1, 2] };
        write_frame(&mut a, &encode_handshake(&hello).unwrap())
            .await
            .unwrap();
        let frame = read_frame(&mut b, MAX_HANDSHAKE_SIZE).await.unwrap();
        let decoded: Hello = decode_handshake(&frame).unwrap();
        assert_eq!(decoded, hello);
        assert_eq!(
            decode_handshake::<SessionInit>(&[1, 2, 3]).unwrap_err(),
            ProtocolError::BadHandshake
        );
    }
}
