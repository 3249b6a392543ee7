//! Encrypted UDP search replies (SUDP).
//!
//! Datagrams are AES-128-CBC with a zero IV under a per-search 16-byte
//! key announced in the search. Padding appends n bytes of value n,
//! 1..=16. A receiver trial-decrypts an incoming datagram against every
//! active search key and accepts the first whose padding checks out.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::NoPadding};
use rand::Rng;

type Enc = cbc::Encryptor<aes::Aes128>;
type Dec = cbc::Decryptor<aes::Aes128>;

const BLOCK: usize = 16;
const ZERO_IV: [u8; BLOCK] = [0u8; BLOCK];

/// Generate a fresh search key.
#[must_use]
pub fn generate_key() -> [u8; 16] {
    rand::thread_rng().gen()
}

/// Encrypt a search reply for the given key.
#[must_use]
pub fn encrypt(key: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    let pad = BLOCK - plaintext.len() % BLOCK;
    let mut buf = Vec::with_capacity(plaintext.len() + pad);
    buf.extend_from_slice(plaintext);
    buf.resize(plaintext.len() + pad, pad as u8);
    Enc::new(key.into(), &ZERO_IV.into()).encrypt_padded_vec_mut::<NoPadding>(&buf)
}

/// Trial-decrypt a datagram with one key.
///
/// Returns `None` when the length is not a whole number of blocks or the
/// padding rule fails, which is how a wrong key manifests.
#[must_use]
pub fn decrypt(key: &[u8; 16], ciphertext: &[u8]) -> Option<Vec<u8>> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK != 0 {
        return None;
    }
    let mut buf = Dec::new(key.into(), &ZERO_IV.into())
        .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
        .ok()?;
    let pad = *buf.last()? as usize;
    if pad == 0 || pad > BLOCK || pad > buf.len() {
        return None;
    }
    if !buf[buf.len() - pad..].iter().all(|&b| b as usize == pad) {
        return None;
    }
    buf.truncate(buf.len() - pad);
    Some(buf)
}
