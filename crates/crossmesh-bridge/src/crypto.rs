//! Channel payload decryption
//!
//! Some wire type codes are ambiguous between plaintext and ciphertext
//! depending on how the sending node is configured. The policy here is to
//! attempt decryption with every locally configured channel key and accept
//! the first authenticated result. All keys failing is routine, not an
//! error: a directed message encrypted for somebody else is supposed to
//! fail on our keys.
//!
//! Wire layout of an encrypted payload: 12-byte nonce followed by the
//! ChaCha20-Poly1305 ciphertext and tag, with the channel index bound in as
//! associated data.

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload as AeadPayload},
    ChaCha20Poly1305, Nonce,
};
use tracing::{debug, trace};

use crate::config::ChannelKeyConfig;
use crate::error::Result;

/// Nonce length preceding the ciphertext
const NONCE_LEN: usize = 12;

/// Poly1305 tag length
const TAG_LEN: usize = 16;

/// One configured channel key
#[derive(Clone)]
struct ChannelKey {
    name: String,
    cipher: ChaCha20Poly1305,
}

impl std::fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelKey")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Decryption against all locally configured channel keys.
#[derive(Debug, Clone, Default)]
pub struct ChannelCrypto {
    keys: Vec<ChannelKey>,
}

impl ChannelCrypto {
    /// Build from configuration, decoding each hex key.
    pub fn from_config(config: &ChannelKeyConfig) -> Result<Self> {
        let mut keys = Vec::with_capacity(config.keys.len());
        for named in &config.keys {
            let key_bytes = named.decode()?;
            keys.push(ChannelKey {
                name: named.name.clone(),
                cipher: ChaCha20Poly1305::new(&key_bytes.into()),
            });
        }
        Ok(Self { keys })
    }

    /// Number of configured keys
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Attempt decryption with every configured key.
    ///
    /// Returns the first plaintext that authenticates, or `None` when no key
    /// fits — which for traffic keyed to another recipient is the expected
    /// outcome, not a failure worth reporting.
    pub fn try_decrypt(&self, payload: &[u8], channel: u8) -> Option<Vec<u8>> {
        if payload.len() < NONCE_LEN + TAG_LEN {
            trace!(len = payload.len(), "payload too short to be ciphertext");
            return None;
        }

        let nonce = Nonce::from_slice(&payload[..NONCE_LEN]);
        let ciphertext = &payload[NONCE_LEN..];
        let aad = [channel];

        for key in &self.keys {
            match key.cipher.decrypt(
                nonce,
                AeadPayload {
                    msg: ciphertext,
                    aad: &aad,
                },
            ) {
                Ok(plaintext) => {
                    debug!(key = %key.name, channel, "payload decrypted");
                    return Some(plaintext);
                }
                Err(_) => continue,
            }
        }
        None
    }

    /// Encrypt a payload under a named key.
    ///
    /// Used for outbound channel traffic and by tests to fabricate inbound
    /// ciphertext.
    pub fn encrypt(&self, key_name: &str, plaintext: &[u8], channel: u8) -> Option<Vec<u8>> {
        let key = self.keys.iter().find(|k| k.name == key_name)?;
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let aad = [channel];
        let ciphertext = key
            .cipher
            .encrypt(
                &nonce,
                AeadPayload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .ok()?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Some(out)
    }
}

/// Whether decoded bytes still look encrypted.
///
/// Plaintext commands are always printable, so anything that fails UTF-8 or
/// contains a non-printable character is treated as ciphertext. A plain
/// "non-empty string" check is not enough: partially decoded ciphertext can
/// produce a non-empty garbage string that passes it.
pub fn looks_encrypted(bytes: &[u8]) -> bool {
    match std::str::from_utf8(bytes) {
        Ok(text) => !is_printable(text),
        Err(_) => true,
    }
}

/// Printable: no control characters other than common whitespace.
fn is_printable(text: &str) -> bool {
    text.chars()
        .all(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
}
