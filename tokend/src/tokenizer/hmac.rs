// src/tokenizer/hmac.rs
use hmac::{Hmac, Mac};
use log::info;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use super::{derive_key_id, KeyId, Token, Tokenize, TokenizerError};

type HmacSha256 = Hmac<Sha256>;

const HMAC_KEY_SIZE: usize = 20; // In bytes.

/// A tokenizer that produces HMAC-SHA256 tags. Tokens are always 32 bytes,
/// regardless of the input length.
pub struct HmacTokenizer {
    key: RwLock<Option<Vec<u8>>>,
}

impl HmacTokenizer {
    pub fn new() -> Self {
        Self {
            key: RwLock::new(None),
        }
    }
}

impl Default for HmacTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

fn mac(key: &[u8], blob: &[u8]) -> Token {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(blob);
    mac.finalize().into_bytes().to_vec()
}

impl Tokenize for HmacTokenizer {
    fn tokenize(&self, blob: &[u8]) -> Result<Token, TokenizerError> {
        let guard = self.key.read();
        let key = guard.as_ref().ok_or(TokenizerError::NoKey)?;
        Ok(mac(key, blob))
    }

    fn tokenize_with_key_id(&self, blob: &[u8]) -> Result<(Token, KeyId), TokenizerError> {
        // Hold the read lock across both steps so a concurrent key reset
        // cannot slip in between token and key ID.
        let guard = self.key.read();
        let key = guard.as_ref().ok_or(TokenizerError::NoKey)?;
        Ok((mac(key, blob), derive_key_id(key)))
    }

    fn key_id(&self) -> Result<KeyId, TokenizerError> {
        let guard = self.key.read();
        let key = guard.as_ref().ok_or(TokenizerError::NoKey)?;
        Ok(derive_key_id(key))
    }

    fn reset_key(&self) {
        let mut key = vec![0u8; HMAC_KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        *self.key.write() = Some(key);
        info!("Generated HMAC-SHA256 key for tokenization.");
    }

    fn preserves_len(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_32_bytes() {
        let t = HmacTokenizer::new();
        t.reset_key();
        assert_eq!(t.tokenize(&[1, 2, 3, 4]).unwrap().len(), 32);
        assert_eq!(t.tokenize(&[0u8; 16]).unwrap().len(), 32);
    }

    #[test]
    fn empty_input_is_accepted() {
        let t = HmacTokenizer::new();
        t.reset_key();
        assert_eq!(t.tokenize(&[]).unwrap().len(), 32);
    }

    #[test]
    fn reset_changes_tokens() {
        let t = HmacTokenizer::new();
        t.reset_key();
        let before = t.tokenize(&[1, 2, 3, 4]).unwrap();
        t.reset_key();
        let after = t.tokenize(&[1, 2, 3, 4]).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn does_not_preserve_len() {
        assert!(!HmacTokenizer::new().preserves_len());
    }
}
