//! Unguessable identifier minting.
//!
//! Conversation ids, session cookies and CSRF tokens all come from one
//! place: HMAC-SHA256 over a monotonic counter, keyed by a secret drawn
//! from the OS RNG at broker construction.

use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use std::sync::atomic::{AtomicU64, Ordering};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

pub const SECRET_KEY_LEN: usize = 128;

/// Nonce source. The key is immutable after construction and zeroed when
/// the minter drops.
pub struct NonceMinter {
    key: Zeroizing<[u8; SECRET_KEY_LEN]>,
    counter: AtomicU64,
}

impl NonceMinter {
    /// Draw the secret key. Failure here is fatal at startup: a broker
    /// without an unguessable key must not serve logins.
    pub fn new() -> Result<Self> {
        let mut key = Zeroizing::new([0u8; SECRET_KEY_LEN]);
        OsRng
            .try_fill_bytes(&mut key[..])
            .map_err(|e| Error::Internal(format!("cannot seed secret key: {}", e)))?;
        Ok(Self {
            key,
            counter: AtomicU64::new(0),
        })
    }

    /// Mint a fresh lowercase hex nonce. Unique for the lifetime of the
    /// broker under standard cryptographic assumptions.
    pub fn mint(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        hex::encode(hmac_sha256(&self.key[..], &n.to_le_bytes()))
    }
}

/// HMAC-SHA-256
fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}
