// src/tokenizer/mod.rs
// Tokenizers turn blobs (usually raw IP addresses) into opaque tokens under
// a rotating secret. The key epoch is exposed as a key ID that downstream
// consumers use to correlate tokens.

pub mod cryptopan;
pub mod hmac;
pub mod verbatim;

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub use cryptopan::CryptoPanTokenizer;
pub use hmac::HmacTokenizer;
pub use verbatim::VerbatimTokenizer;

/// Namespace for deriving key IDs. Pre-defined UUID namespaces aren't a
/// great fit for our use case, so we use our own, based on a
/// randomly-generated V4 UUID.
pub const KEY_ID_NAMESPACE: Uuid = uuid::uuid!("c298cccd-3c75-4e72-a73b-47811ac13f4f");

pub type Token = Vec<u8>;

/// Identifies a key epoch. Two tokenizers holding the same key derive the
/// same key ID; rotating the key yields a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(pub Uuid);

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Derives the key ID for the given key material. A v5 UUID is supposed to
/// hash the given name (in our case: the key) using SHA-1 but let's be extra
/// careful and hash the key using SHA-256 before handing it over to the uuid
/// crate.
pub(crate) fn derive_key_id(key: &[u8]) -> KeyId {
    let sum = Sha256::digest(key);
    KeyId(Uuid::new_v5(&KEY_ID_NAMESPACE, hex::encode(sum).as_bytes()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenizerError {
    #[error("key has not been initialized yet")]
    NoKey,
    #[error("blob length not supported")]
    UnsupportedLen,
}

/// A tokenizer turns blobs into tokens, which typically involves a secret
/// key. All methods are safe to call concurrently; `tokenize_with_key_id`
/// guarantees that the returned token and key ID belong to the same key
/// epoch, even if `reset_key` runs in parallel.
pub trait Tokenize: Send + Sync {
    fn tokenize(&self, blob: &[u8]) -> Result<Token, TokenizerError>;

    /// Tokenizes the blob and returns the key ID of the epoch the token was
    /// produced in, atomically with respect to `reset_key`.
    fn tokenize_with_key_id(&self, blob: &[u8]) -> Result<(Token, KeyId), TokenizerError>;

    /// Returns the ID of the currently used key. Stable across calls until
    /// the next `reset_key`.
    fn key_id(&self) -> Result<KeyId, TokenizerError>;

    /// Draws fresh key material, beginning a new epoch.
    fn reset_key(&self);

    /// True if a token always has the same length as its input blob.
    fn preserves_len(&self) -> bool;
}
