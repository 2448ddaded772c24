// src/tokenizer/cryptopan.rs
// Prefix-preserving IP address anonymization (Crypto-PAn). Addresses that
// share a k-bit prefix map to tokens that share a k-bit prefix, which keeps
// subnet structure visible to downstream consumers without revealing the
// addresses themselves.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use log::info;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;

use super::{derive_key_id, KeyId, Token, Tokenize, TokenizerError};

/// Total key material: 16 bytes of AES-128 key plus 16 bytes that are
/// encrypted under that key to form the one-time pad.
pub const KEY_SIZE: usize = 32;

const IPV4_LEN: usize = 4;
const IPV6_LEN: usize = 16;

/// The keyed prefix-preserving permutation. For each bit position i of the
/// input, the AES input is the pad with its first i bits replaced by the
/// input's first i bits; the most significant bit of the first ciphertext
/// byte becomes the i-th pad bit, which is XORed onto the i-th input bit.
struct PrefixCipher {
    cipher: Aes128,
    pad: [u8; 16],
}

impl PrefixCipher {
    fn new(key: &[u8; KEY_SIZE]) -> Self {
        let cipher = Aes128::new(GenericArray::from_slice(&key[..16]));
        let mut pad = GenericArray::clone_from_slice(&key[16..]);
        cipher.encrypt_block(&mut pad);
        Self {
            cipher,
            pad: pad.into(),
        }
    }

    fn anonymize(&self, addr: &[u8]) -> Token {
        let nbits = addr.len() * 8;
        let mut otp = vec![0u8; addr.len()];

        for pos in 0..nbits {
            let mut block = GenericArray::clone_from_slice(&self.pad);
            let nbytes = pos / 8;
            let rembits = pos % 8;

            block[..nbytes].copy_from_slice(&addr[..nbytes]);
            if rembits > 0 {
                let mask = 0xffu8 << (8 - rembits);
                block[nbytes] = (addr[nbytes] & mask) | (self.pad[nbytes] & !mask);
            }

            self.cipher.encrypt_block(&mut block);
            otp[pos / 8] |= (block[0] >> 7) << (7 - rembits);
        }

        addr.iter().zip(otp.iter()).map(|(a, p)| a ^ p).collect()
    }
}

struct KeyState {
    key: [u8; KEY_SIZE],
    prf: PrefixCipher,
}

/// A tokenizer whose tokens are prefix-preserving pseudonyms of IP
/// addresses. Only 4- and 16-byte inputs are accepted.
pub struct CryptoPanTokenizer {
    state: RwLock<Option<KeyState>>,
}

impl CryptoPanTokenizer {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(None),
        }
    }

    fn is_blob_supported(blob: &[u8]) -> bool {
        blob.len() == IPV4_LEN || blob.len() == IPV6_LEN
    }
}

impl Default for CryptoPanTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tokenize for CryptoPanTokenizer {
    fn tokenize(&self, blob: &[u8]) -> Result<Token, TokenizerError> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or(TokenizerError::NoKey)?;
        if !Self::is_blob_supported(blob) {
            return Err(TokenizerError::UnsupportedLen);
        }
        Ok(state.prf.anonymize(blob))
    }

    fn tokenize_with_key_id(&self, blob: &[u8]) -> Result<(Token, KeyId), TokenizerError> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or(TokenizerError::NoKey)?;
        if !Self::is_blob_supported(blob) {
            return Err(TokenizerError::UnsupportedLen);
        }
        Ok((state.prf.anonymize(blob), derive_key_id(&state.key)))
    }

    fn key_id(&self) -> Result<KeyId, TokenizerError> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or(TokenizerError::NoKey)?;
        Ok(derive_key_id(&state.key))
    }

    fn reset_key(&self) {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        let prf = PrefixCipher::new(&key);
        *self.state.write() = Some(KeyState { key, prf });
        info!("Generated Crypto-PAn key for tokenization.");
    }

    fn preserves_len(&self) -> bool {
        true
    }
}
