// src/tokenizer/verbatim.rs
use parking_lot::RwLock;
use uuid::Uuid;

use super::{KeyId, Token, Tokenize, TokenizerError};

/// A pseudo tokenizer that returns its input verbatim. Useful for tests and
/// for dry-running the pipeline; it still tracks a key ID that changes on
/// every reset.
pub struct VerbatimTokenizer {
    key: RwLock<Option<KeyId>>,
}

impl VerbatimTokenizer {
    pub fn new() -> Self {
        Self {
            key: RwLock::new(None),
        }
    }
}

impl Default for VerbatimTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tokenize for VerbatimTokenizer {
    fn tokenize(&self, blob: &[u8]) -> Result<Token, TokenizerError> {
        self.key.read().ok_or(TokenizerError::NoKey)?;
        Ok(blob.to_vec())
    }

    fn tokenize_with_key_id(&self, blob: &[u8]) -> Result<(Token, KeyId), TokenizerError> {
        let key = self.key.read().ok_or(TokenizerError::NoKey)?;
        Ok((blob.to_vec(), key))
    }

    fn key_id(&self) -> Result<KeyId, TokenizerError> {
        self.key.read().ok_or(TokenizerError::NoKey)
    }

    fn reset_key(&self) {
        *self.key.write() = Some(KeyId(Uuid::new_v4()));
    }

    fn preserves_len(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_input_verbatim() {
        let t = VerbatimTokenizer::new();
        t.reset_key();
        assert_eq!(t.tokenize(&[1, 2, 3, 4]).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(t.tokenize(&[]).unwrap(), Vec::<u8>::new());
    }
}
