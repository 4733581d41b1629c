//! Payload encryption.
//!
//! Data packet payloads are encrypted with AES in counter mode. The session key is derived
//! from the connection passphrase with PBKDF2-SHA256 over a salt exchanged during the
//! handshake. The per-packet IV is the 4-byte big-endian sequence number followed by 12
//! zero bytes; sequence numbers are unique per key, so the keystream never repeats.
//!
//! Keys are rotated after a configurable number of packets. The parity of the key
//! generation is announced in the KK header flag; both the old and the new key stay valid
//! during the overlap so that reordered packets around the rotation point still decrypt.

use aes::{Aes128, Aes192, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use crate::config::Encryption;
use crate::metrics::Counter;
use crate::packet::KeyFlag;
use crate::utils::sequence::Sequence;

/// Size of the key derivation salt in bytes.
pub const SALT_SIZE: usize = 16;

/// PBKDF2 round count for session key derivation.
pub const PBKDF2_ITERATIONS: u32 = 10_000;

/// A typed error from the packet cipher.
///
/// Crypto failures are per-packet: the affected packet is dropped and counted, the
/// connection continues.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("unsupported cipher algorithm")]
    UnsupportedAlgorithm,
    #[error("session key has the wrong length")]
    InvalidKeyLength,
    #[error("passphrase length {0} outside 10..=79")]
    PassphraseLength(usize),
    #[error("unencrypted payload on an encrypted session")]
    NotEncrypted,
    #[error("no session key for parity {0:?}")]
    UnknownKey(KeyFlag),
}

/// The cipher strength in use.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CipherKind {
    Aes128,
    Aes192,
    Aes256,
}

impl CipherKind {
    pub const fn key_len(self) -> usize {
        match self {
            Self::Aes128 => 16,
            Self::Aes192 => 24,
            Self::Aes256 => 32,
        }
    }

    pub const fn from_encryption(encryption: Encryption) -> Option<Self> {
        match encryption {
            Encryption::Off => None,
            Encryption::Aes128 => Some(Self::Aes128),
            Encryption::Aes192 => Some(Self::Aes192),
            Encryption::Aes256 => Some(Self::Aes256),
        }
    }
}

/// Counters of the packet cipher.
#[derive(Copy, Clone, Debug, Default)]
pub struct CryptoStats {
    pub packets_encrypted: Counter,
    pub packets_decrypted: Counter,
    pub failures: Counter,
    pub key_refreshes: Counter,
}

/// The per-connection packet cipher with key rotation state.
#[derive(Debug)]
pub struct SessionCrypto {
    kind: CipherKind,
    passphrase: String,
    salt: [u8; SALT_SIZE],
    /// Derived keys by parity slot; index 0 holds even generations, 1 odd ones.
    keys: [Option<Vec<u8>>; 2],
    generation: u64,
    usage: u64,
    refresh_threshold: u64,
    stats: CryptoStats,
}

impl SessionCrypto {
    /// Creates the cipher state and derives the generation-zero key.
    pub fn new(
        kind: CipherKind,
        passphrase: &str,
        salt: [u8; SALT_SIZE],
        refresh_threshold: u64,
    ) -> Result<Self, CryptoError> {
        if !(10..=79).contains(&passphrase.len()) {
            return Err(CryptoError::PassphraseLength(passphrase.len()));
        }

        let mut crypto = Self {
            kind,
            passphrase: passphrase.to_owned(),
            salt,
            keys: [None, None],
            generation: 0,
            usage: 0,
            refresh_threshold,
            stats: CryptoStats::default(),
        };

        crypto.keys[0] = Some(crypto.derive_key(0));
        Ok(crypto)
    }

    /// Generates a fresh random salt for a new session.
    pub fn generate_salt() -> [u8; SALT_SIZE] {
        let mut salt = [0; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);
        salt
    }

    /// The KK flag announcing the currently active key.
    pub fn active_flag(&self) -> KeyFlag {
        parity_flag(self.generation)
    }

    /// Encrypts `payload` in place, returning the KK flag to stamp on the packet.
    ///
    /// Rotates the session key once the active key has encrypted `refresh_threshold`
    /// packets.
    pub fn encrypt(&mut self, seq: Sequence, payload: &mut [u8]) -> Result<KeyFlag, CryptoError> {
        let flag = self.active_flag();

        // The active slot is always populated.
        let key = self.keys[(self.generation % 2) as usize]
            .as_deref()
            .unwrap_or_default();

        if let Err(err) = apply_keystream(self.kind, key, seq, payload) {
            self.stats.failures.inc();
            return Err(err);
        }

        self.stats.packets_encrypted.inc();
        self.usage += 1;

        if self.usage >= self.refresh_threshold {
            self.refresh();
        }

        Ok(flag)
    }

    /// Decrypts `payload` in place, selecting the key announced by `flag`.
    ///
    /// When the peer rotated ahead of us the next generation is derived on first sight of
    /// the flipped parity; the previous key stays valid for reordered packets.
    pub fn decrypt(
        &mut self,
        seq: Sequence,
        flag: KeyFlag,
        payload: &mut [u8],
    ) -> Result<(), CryptoError> {
        let slot = match flag {
            KeyFlag::Even => 0,
            KeyFlag::Odd => 1,
            KeyFlag::None => {
                self.stats.failures.inc();
                return Err(CryptoError::NotEncrypted);
            }
            KeyFlag::Both => {
                self.stats.failures.inc();
                return Err(CryptoError::UnknownKey(flag));
            }
        };

        // The peer flipped parity ahead of us: derive the next generation, keep the old
        // key. A populated slot is never rederived, so reordered old-parity packets do
        // not advance the generation.
        if self.keys[slot].is_none() && self.peer_advanced(flag) {
            let next = self.generation + 1;
            self.keys[(next % 2) as usize] = Some(self.derive_key(next));
            self.generation = next;
            self.usage = 0;
            self.stats.key_refreshes.inc();
        }

        let Some(key) = self.keys[slot].as_deref() else {
            self.stats.failures.inc();
            return Err(CryptoError::UnknownKey(flag));
        };

        if let Err(err) = apply_keystream(self.kind, key, seq, payload) {
            self.stats.failures.inc();
            return Err(err);
        }

        self.stats.packets_decrypted.inc();
        Ok(())
    }

    pub fn stats(&self) -> CryptoStats {
        self.stats
    }

    fn refresh(&mut self) {
        self.generation += 1;
        self.keys[(self.generation % 2) as usize] = Some(self.derive_key(self.generation));
        self.usage = 0;
        self.stats.key_refreshes.inc();

        tracing::debug!(
            "Rotated session key to generation {} ({:?})",
            self.generation,
            self.active_flag()
        );
    }

    fn peer_advanced(&self, flag: KeyFlag) -> bool {
        parity_flag(self.generation + 1) == flag
    }

    /// Derives the key of the given generation from the passphrase, salt and generation
    /// counter. Both peers derive identical keys from the shared passphrase.
    fn derive_key(&self, generation: u64) -> Vec<u8> {
        let mut material = [0; SALT_SIZE + 8];
        material[..SALT_SIZE].copy_from_slice(&self.salt);
        material[SALT_SIZE..].copy_from_slice(&generation.to_be_bytes());

        let mut key = vec![0; self.kind.key_len()];
        pbkdf2_hmac::<Sha256>(
            self.passphrase.as_bytes(),
            &material,
            PBKDF2_ITERATIONS,
            &mut key,
        );
        key
    }
}

fn parity_flag(generation: u64) -> KeyFlag {
    if generation % 2 == 0 {
        KeyFlag::Even
    } else {
        KeyFlag::Odd
    }
}

/// Applies the AES-CTR keystream for `seq` over `payload` in place.
///
/// Encryption and decryption are the same operation in counter mode.
fn apply_keystream(
    kind: CipherKind,
    key: &[u8],
    seq: Sequence,
    payload: &mut [u8],
) -> Result<(), CryptoError> {
    let mut iv = [0; 16];
    iv[..4].copy_from_slice(&seq.get().to_be_bytes());

    let result = match kind {
        CipherKind::Aes128 => Ctr128BE::<Aes128>::new_from_slices(key, &iv)
            .map(|mut cipher| cipher.apply_keystream(payload)),
        CipherKind::Aes192 => Ctr128BE::<Aes192>::new_from_slices(key, &iv)
            .map(|mut cipher| cipher.apply_keystream(payload)),
        CipherKind::Aes256 => Ctr128BE::<Aes256>::new_from_slices(key, &iv)
            .map(|mut cipher| cipher.apply_keystream(payload)),
    };

    result.map_err(|_| CryptoError::InvalidKeyLength)
}

#[cfg(test)]
mod tests {
    use crate::packet::KeyFlag;
    use crate::utils::sequence::Sequence;

    use super::{CipherKind, CryptoError, SessionCrypto, SALT_SIZE};

    const PASSPHRASE: &str = "my_secret_passphrase";

    fn pair() -> (SessionCrypto, SessionCrypto) {
        let salt = [0x42; SALT_SIZE];
        let tx = SessionCrypto::new(CipherKind::Aes256, PASSPHRASE, salt, 1_000_000).unwrap();
        let rx = SessionCrypto::new(CipherKind::Aes256, PASSPHRASE, salt, 1_000_000).unwrap();
        (tx, rx)
    }

    #[test]
    fn test_encrypt_decrypt_identity() {
        let (mut tx, mut rx) = pair();

        let plaintext = b"Hello, SRT World!";
        let mut payload = plaintext.to_vec();

        let flag = tx.encrypt(Sequence::new(12345), &mut payload).unwrap();
        assert_eq!(flag, KeyFlag::Even);
        assert_eq!(payload.len(), plaintext.len());
        assert_ne!(&payload[..], plaintext);

        rx.decrypt(Sequence::new(12345), flag, &mut payload).unwrap();
        assert_eq!(&payload[..], plaintext);
    }

    #[test]
    fn test_distinct_sequences_produce_distinct_ciphertext() {
        let (mut tx, _) = pair();

        let mut first = vec![0u8; 32];
        let mut second = vec![0u8; 32];
        tx.encrypt(Sequence::new(1), &mut first).unwrap();
        tx.encrypt(Sequence::new(2), &mut second).unwrap();

        assert_ne!(first, second);
    }

    #[test]
    fn test_key_refresh_flips_parity_and_keeps_overlap() {
        let salt = [7; SALT_SIZE];
        let mut tx = SessionCrypto::new(CipherKind::Aes256, PASSPHRASE, salt, 2).unwrap();
        let mut rx = SessionCrypto::new(CipherKind::Aes256, PASSPHRASE, salt, 2).unwrap();

        let mut a = b"packet a".to_vec();
        let mut b = b"packet b".to_vec();
        let mut c = b"packet c".to_vec();

        assert_eq!(tx.encrypt(Sequence::new(0), &mut a).unwrap(), KeyFlag::Even);
        assert_eq!(tx.encrypt(Sequence::new(1), &mut b).unwrap(), KeyFlag::Even);
        // Threshold reached, the third packet uses the odd key.
        assert_eq!(tx.encrypt(Sequence::new(2), &mut c).unwrap(), KeyFlag::Odd);
        assert_eq!(tx.stats().key_refreshes.get(), 1);

        // The receiver sees the rotated packet first, then a reordered old-key packet.
        rx.decrypt(Sequence::new(2), KeyFlag::Odd, &mut c).unwrap();
        rx.decrypt(Sequence::new(0), KeyFlag::Even, &mut a).unwrap();
        assert_eq!(&c[..], b"packet c");
        assert_eq!(&a[..], b"packet a");
    }

    #[test]
    fn test_unencrypted_packet_rejected() {
        let (_, mut rx) = pair();

        let mut payload = b"plaintext!".to_vec();
        assert_eq!(
            rx.decrypt(Sequence::new(5), KeyFlag::None, &mut payload),
            Err(CryptoError::NotEncrypted)
        );
        assert_eq!(rx.stats().failures.get(), 1);
    }

    #[test]
    fn test_bad_passphrase_length() {
        let err = SessionCrypto::new(CipherKind::Aes128, "short", [0; SALT_SIZE], 1000);
        assert!(matches!(err, Err(CryptoError::PassphraseLength(5))));
    }
}
