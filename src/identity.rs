//! # Node Identity and Content Keys
//!
//! This module defines the identity types shared by every other component:
//!
//! - [`NodeId`]: 32-byte fingerprint naming a peer in the XOR metric space
//! - [`Node`]: a peer fingerprint plus the transport uris it can be reached on
//! - [`Key`]: content hash naming one fixed-size block
//! - [`Keypair`]: Ed25519 signing keypair used to certify published seeds
//!
//! ## Identity Model
//!
//! Node fingerprints are random and carry no key material: the overlay is
//! anonymous, so a node id only needs to be unique and uniformly distributed.
//! Signing keys exist solely to certify [`crate::Seed`] descriptors, and the
//! published signature string is derived from the signer's public key.
//!
//! ## Distance
//!
//! Equality and distance between nodes are computed on `id` only. Block keys
//! and seed signatures are mapped into the same space by hashing
//! ([`Key::target_id`], [`signature_target`]) so one nearest-peer lookup serves
//! both blocks and seeds.

use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Length of a node fingerprint in bytes.
pub const NODE_ID_LEN: usize = 32;

/// Maximum number of uris a node descriptor may carry.
/// SECURITY: bounds memory held per gossiped node.
pub const MAX_NODE_URIS: usize = 32;

/// Maximum length of a single uri string.
pub const MAX_URI_LEN: usize = 256;

/// Maximum length of a content hash.
pub const MAX_HASH_LEN: usize = 64;

/// Returns current time as seconds since Unix epoch.
#[inline]
pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ============================================================================
// NodeId
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    #[inline]
    pub const fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Fresh uniformly random fingerprint.
    pub fn random() -> Self {
        let mut bytes = [0u8; NODE_ID_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Fingerprint derived from arbitrary bytes (BLAKE3).
    pub fn hash_of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &NodeId) -> [u8; NODE_ID_LEN] {
        let mut out = [0u8; NODE_ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; NODE_ID_LEN];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

/// Compare two XOR distances lexicographically.
///
/// `Less` means the first distance is closer to the shared target.
#[inline]
pub fn distance_cmp(a: &[u8; NODE_ID_LEN], b: &[u8; NODE_ID_LEN]) -> std::cmp::Ordering {
    a.cmp(b)
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; NODE_ID_LEN]> for NodeId {
    fn from(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// ============================================================================
// Node
// ============================================================================

/// A peer descriptor: fingerprint plus ordered transport uris.
///
/// Equality and hashing use `id` only, so two descriptors of the same peer
/// with different uri lists collapse to one entry in sets and tables.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub uris: Vec<String>,
}

impl Node {
    pub fn new(id: NodeId, uris: Vec<String>) -> Self {
        Self { id, uris }
    }

    /// Checks the bounds applied to descriptors received from peers.
    pub fn validate_structure(&self) -> bool {
        if self.uris.len() > MAX_NODE_URIS {
            return false;
        }
        self.uris
            .iter()
            .all(|uri| !uri.is_empty() && uri.len() <= MAX_URI_LEN)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Node {}

impl std::hash::Hash for Node {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

// ============================================================================
// Content keys
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HashAlgorithm {
    Blake3,
}

/// Identity of one content block. Never mutated once created.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key {
    pub hash_algorithm: HashAlgorithm,
    pub hash: Vec<u8>,
}

impl Key {
    pub fn new(hash_algorithm: HashAlgorithm, hash: Vec<u8>) -> Self {
        Self {
            hash_algorithm,
            hash,
        }
    }

    /// Key naming `content` under the default algorithm.
    pub fn from_content(content: &[u8]) -> Self {
        Self::new(
            HashAlgorithm::Blake3,
            blake3::hash(content).as_bytes().to_vec(),
        )
    }

    /// True if `content` hashes to this key.
    pub fn matches(&self, content: &[u8]) -> bool {
        match self.hash_algorithm {
            HashAlgorithm::Blake3 => blake3::hash(content).as_bytes().as_slice() == self.hash,
        }
    }

    /// Position of this key in the node id space.
    ///
    /// 32-byte hashes map onto themselves; anything else is rehashed.
    pub fn target_id(&self) -> NodeId {
        match <[u8; NODE_ID_LEN]>::try_from(self.hash.as_slice()) {
            Ok(bytes) => NodeId::from_bytes(bytes),
            Err(_) => NodeId::hash_of(&self.hash),
        }
    }

    pub fn validate_structure(&self) -> bool {
        !self.hash.is_empty() && self.hash.len() <= MAX_HASH_LEN
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hex = hex::encode(&self.hash);
        write!(f, "Key({})", &hex[..hex.len().min(16)])
    }
}

/// Position of a seed signature string in the node id space.
pub fn signature_target(signature: &str) -> NodeId {
    NodeId::hash_of(signature.as_bytes())
}

// ============================================================================
// Keypair
// ============================================================================

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key
            .verifying_key()
            .verify(message, signature)
            .is_ok()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_node_id_xor_distance() {
        let a = NodeId::from_bytes([0xFF; 32]);
        let b = NodeId::from_bytes([0x00; 32]);

        assert_eq!(a.xor_distance(&a), [0u8; 32]);
        assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
        assert_eq!(a.xor_distance(&b), [0xFF; 32]);
    }

    #[test]
    fn test_distance_cmp_is_lexicographic() {
        let target = NodeId::from_bytes([0u8; 32]);
        let mut near = [0u8; 32];
        near[31] = 0xFF;
        let mut far = [0u8; 32];
        far[0] = 0x01;

        let d_near = target.xor_distance(&NodeId::from_bytes(near));
        let d_far = target.xor_distance(&NodeId::from_bytes(far));
        assert_eq!(distance_cmp(&d_near, &d_far), std::cmp::Ordering::Less);
        assert_eq!(distance_cmp(&d_far, &d_far), std::cmp::Ordering::Equal);
    }

    #[test]
    fn test_node_id_hex_round_trip() {
        let id = NodeId::random();
        assert_eq!(NodeId::from_hex(&id.to_hex()).unwrap(), id);
        assert!(NodeId::from_hex("zz").is_err());
    }

    #[test]
    fn test_node_equality_ignores_uris() {
        let id = NodeId::random();
        let a = Node::new(id, vec!["tcp:1.2.3.4:4050".into()]);
        let b = Node::new(id, vec![]);

        assert_eq!(a, b);
        let set: HashSet<Node> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_node_structure_limits() {
        let id = NodeId::random();
        assert!(Node::new(id, vec!["tcp:1.2.3.4:1".into()]).validate_structure());
        assert!(!Node::new(id, vec![String::new()]).validate_structure());
        assert!(!Node::new(id, vec!["x".repeat(MAX_URI_LEN + 1)]).validate_structure());
        assert!(!Node::new(id, vec!["a".into(); MAX_NODE_URIS + 1]).validate_structure());
    }

    #[test]
    fn test_key_from_content_matches() {
        let key = Key::from_content(b"block body");
        assert!(key.matches(b"block body"));
        assert!(!key.matches(b"other body"));
        assert_eq!(key.target_id().as_bytes().as_slice(), key.hash.as_slice());
    }

    #[test]
    fn test_short_key_is_rehashed_into_id_space() {
        let key = Key::new(HashAlgorithm::Blake3, vec![1, 2, 3]);
        assert_eq!(key.target_id(), NodeId::hash_of(&[1, 2, 3]));
        assert!(key.validate_structure());
        assert!(!Key::new(HashAlgorithm::Blake3, vec![]).validate_structure());
    }

    #[test]
    fn test_keypair_sign_and_verify() {
        let kp = Keypair::generate();
        let signature = kp.sign(b"hello");
        assert!(kp.verify(b"hello", &signature));
        assert!(!kp.verify(b"other", &signature));

        let restored = Keypair::from_secret_key_bytes(&kp.secret_key_bytes());
        assert_eq!(restored.public_key_bytes(), kp.public_key_bytes());
    }
}
