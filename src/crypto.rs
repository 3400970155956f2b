//! # Seed Certificates
//!
//! Seeds are small signed descriptors pointing at content. This module owns:
//!
//! - **Signatures**: domain-separated Ed25519 signing and verification
//! - [`Certificate`]: public key + signature attached to a seed
//! - [`Seed`]: the descriptor itself and its canonical signed payload
//!
//! ## Signature strings
//!
//! A published seed is discoverable by the signer's *signature string*: the
//! hex BLAKE3 digest of the signer's public key. Every seed signed by the same
//! key shares one signature string, and a newer `creation_time` supersedes an
//! older seed under that string.
//!
//! ## Security Properties
//!
//! - Domain separation prevents cross-protocol signature replay
//! - Only Ed25519 signatures are accepted
//! - The certificate covers every field of the seed except itself

use bincode::Options;
use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::identity::{Key, Keypair, now_secs};

// ============================================================================
// Signature Error Types
// ============================================================================

/// Error type for signature verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Domain separation prefix for seed certificates.
pub const SEED_SIGNATURE_DOMAIN: &[u8] = b"seedmesh-seed-v1:";

/// Keyword marking a seed as a globally discoverable published index.
pub const PUBLISHED_INDEX_KEYWORD: &str = "_published_index_";

/// Maximum seed name length in bytes.
pub const MAX_SEED_NAME_LEN: usize = 256;

/// Maximum number of keywords on one seed.
pub const MAX_SEED_KEYWORDS: usize = 3;

/// Maximum length of one keyword.
pub const MAX_KEYWORD_LEN: usize = 256;

/// Maximum length of the content crypto key.
pub const MAX_CRYPTO_KEY_LEN: usize = 64;

/// Sign data with domain separation.
///
/// Returns the 64-byte Ed25519 signature.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    keypair.sign(&prefixed).to_bytes().to_vec()
}

/// Verify a domain-separated signature against a raw Ed25519 public key.
pub fn verify_with_domain(
    public_key: &[u8; 32],
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let verifying_key =
        VerifyingKey::from_bytes(public_key).map_err(|_| SignatureError::InvalidPublicKey)?;
    let sig = Signature::from_bytes(&sig_bytes);

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    verifying_key
        .verify_strict(&prefixed, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

// ============================================================================
// Certificate
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub public_key: [u8; 32],
    pub signature: Vec<u8>,
}

impl Certificate {
    /// Hex BLAKE3 digest of the public key; the name a published seed is found by.
    pub fn signature_string(&self) -> String {
        signature_string_of(&self.public_key)
    }
}

pub fn signature_string_of(public_key: &[u8; 32]) -> String {
    hex::encode(blake3::hash(public_key).as_bytes())
}

// ============================================================================
// Seed
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionAlgorithm {
    None,
    Xz,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CryptoAlgorithm {
    None,
    Aes256,
}

/// Why a seed was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedError {
    /// The seed carries no certificate.
    Unsigned,
    /// The certificate does not verify.
    BadCertificate(SignatureError),
    /// A field exceeds its bound.
    Malformed(&'static str),
    /// The first keyword is not the published-index marker.
    NotPublishedIndex,
    /// A newer or identical seed is already stored under this signature.
    Stale,
}

impl std::fmt::Display for SeedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SeedError::Unsigned => write!(f, "seed is not signed"),
            SeedError::BadCertificate(e) => write!(f, "seed certificate invalid: {}", e),
            SeedError::Malformed(field) => write!(f, "seed field out of bounds: {}", field),
            SeedError::NotPublishedIndex => write!(f, "seed is not a published index"),
            SeedError::Stale => write!(f, "a newer seed is already stored"),
        }
    }
}

impl std::error::Error for SeedError {}

/// Signed descriptor pointing at content by root key and index rank.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seed {
    pub name: Option<String>,
    pub length: u64,
    /// Depth of the index tree under `key`; 1 means `key` is the content itself.
    pub rank: u32,
    pub key: Option<Key>,
    pub compression_algorithm: CompressionAlgorithm,
    pub crypto_algorithm: CryptoAlgorithm,
    pub crypto_key: Vec<u8>,
    /// Seconds since Unix epoch.
    pub creation_time: u64,
    pub keywords: Vec<String>,
    pub certificate: Option<Certificate>,
}

/// Borrowed view of the signed fields, serialized in a fixed layout.
#[derive(Serialize)]
struct SeedBody<'a> {
    name: &'a Option<String>,
    length: u64,
    rank: u32,
    key: &'a Option<Key>,
    compression_algorithm: CompressionAlgorithm,
    crypto_algorithm: CryptoAlgorithm,
    crypto_key: &'a [u8],
    creation_time: u64,
    keywords: &'a [String],
}

impl Seed {
    /// Unsigned seed for `key` created now.
    pub fn new(name: Option<String>, key: Key, length: u64, rank: u32) -> Self {
        Self {
            name,
            length,
            rank,
            key: Some(key),
            compression_algorithm: CompressionAlgorithm::None,
            crypto_algorithm: CryptoAlgorithm::None,
            crypto_key: Vec::new(),
            creation_time: now_secs(),
            keywords: Vec::new(),
            certificate: None,
        }
    }

    /// Marks the seed as a published index by prepending the marker keyword.
    pub fn into_published_index(mut self) -> Self {
        if !self.is_published_index() {
            self.keywords.insert(0, PUBLISHED_INDEX_KEYWORD.to_string());
        }
        self
    }

    pub fn is_published_index(&self) -> bool {
        self.keywords
            .first()
            .is_some_and(|k| k == PUBLISHED_INDEX_KEYWORD)
    }

    fn signed_payload(&self) -> Result<Vec<u8>, bincode::Error> {
        let body = SeedBody {
            name: &self.name,
            length: self.length,
            rank: self.rank,
            key: &self.key,
            compression_algorithm: self.compression_algorithm,
            crypto_algorithm: self.crypto_algorithm,
            crypto_key: &self.crypto_key,
            creation_time: self.creation_time,
            keywords: &self.keywords,
        };
        bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .serialize(&body)
    }

    /// Attach a certificate signed by `keypair`.
    pub fn sign(&mut self, keypair: &Keypair) -> Result<(), SeedError> {
        self.validate_structure()?;
        let payload = self
            .signed_payload()
            .map_err(|_| SeedError::Malformed("payload"))?;
        let signature = sign_with_domain(keypair, SEED_SIGNATURE_DOMAIN, &payload);
        self.certificate = Some(Certificate {
            public_key: keypair.public_key_bytes(),
            signature,
        });
        Ok(())
    }

    /// Checks bounds and the certificate.
    pub fn verify(&self) -> Result<(), SeedError> {
        self.validate_structure()?;
        let certificate = self.certificate.as_ref().ok_or(SeedError::Unsigned)?;
        let payload = self
            .signed_payload()
            .map_err(|_| SeedError::Malformed("payload"))?;
        verify_with_domain(
            &certificate.public_key,
            SEED_SIGNATURE_DOMAIN,
            &payload,
            &certificate.signature,
        )
        .map_err(SeedError::BadCertificate)
    }

    /// Signature string of the signer, if signed.
    pub fn signature(&self) -> Option<String> {
        self.certificate.as_ref().map(Certificate::signature_string)
    }

    pub fn validate_structure(&self) -> Result<(), SeedError> {
        if self.name.as_ref().is_some_and(|n| n.len() > MAX_SEED_NAME_LEN) {
            return Err(SeedError::Malformed("name"));
        }
        if self.keywords.len() > MAX_SEED_KEYWORDS
            || self.keywords.iter().any(|k| k.len() > MAX_KEYWORD_LEN)
        {
            return Err(SeedError::Malformed("keywords"));
        }
        if self.crypto_key.len() > MAX_CRYPTO_KEY_LEN {
            return Err(SeedError::Malformed("crypto_key"));
        }
        if self.rank == 0 {
            return Err(SeedError::Malformed("rank"));
        }
        if self.key.as_ref().is_some_and(|k| !k.validate_structure()) {
            return Err(SeedError::Malformed("key"));
        }
        Ok(())
    }
}
