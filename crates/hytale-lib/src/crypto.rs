//! Keyring-backed keys and the HMAC used to sign the self-update handoff.

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Keyring service name all launcher keys live under.
const KEYRING_SERVICE: &str = "hytale-launcher";

/// Key id for the self-update argument signature.
pub const SELF_UPDATE_KEY_ID: &str = "3BA63AC3-1B08-425B-AC1A-3B19841B660D";

/// HMAC-SHA256 over `data`, hex encoded.
pub fn hmac_hex(data: &[u8], key: &[u8]) -> String {
    // A zero-length key is still a valid HMAC key; new_from_slice only
    // fails for lengths the hash cannot absorb, which SHA-256 never hits.
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

/// Fetch a named key from the OS keyring, generating and storing a fresh
/// 32-byte key if none exists yet.
pub fn get_or_gen_key(name: &str) -> Result<Vec<u8>> {
    let entry = keyring::Entry::new(KEYRING_SERVICE, name)
        .with_context(|| format!("unable to open keyring entry {}", name))?;

    match entry.get_password() {
        Ok(stored) => hex::decode(&stored)
            .with_context(|| format!("keyring entry {} holds malformed key material", name)),
        Err(keyring::Error::NoEntry) => {
            log::info!("generating new keyring key: {}", name);
            let mut key = vec![0u8; 32];
            rand::thread_rng().fill_bytes(&mut key);
            entry
                .set_password(&hex::encode(&key))
                .with_context(|| format!("unable to store keyring entry {}", name))?;
            Ok(key)
        }
        Err(err) => Err(err).with_context(|| format!("unable to read keyring entry {}", name)),
    }
}

/// The key used to sign and validate self-update argument vectors.
pub fn load_self_update_key() -> Result<Vec<u8>> {
    get_or_gen_key(SELF_UPDATE_KEY_ID)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_hex_matches_known_vector() {
        // RFC 4231 test case 2.
        let sig = hmac_hex(b"what do ya want for nothing?", b"Jefe");
        assert_eq!(
            sig,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn hmac_hex_is_key_sensitive() {
        let a = hmac_hex(b"/tmp/hytale-launcher", b"key-one");
        let b = hmac_hex(b"/tmp/hytale-launcher", b"key-two");
        assert_ne!(a, b);
    }
}
