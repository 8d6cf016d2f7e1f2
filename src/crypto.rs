//! Key agreement and message sealing.
//!
//! Each process holds a static X25519 keypair. A connection's symmetric
//! secret is the raw Diffie-Hellman output of our private key and the
//! remote side's public key, so both ends derive the same 32 bytes without
//! a dedicated key-confirmation round trip. Sealed messages are
//! XChaCha20-Poly1305 ciphertexts with a fresh random nonce prepended.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{Error, Result};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;

const ID_CONTEXT: &str = "puncher v1 peer id from public key";

/// Generate a fresh static keypair for one process identity.
pub fn gen_keypair() -> (StaticSecret, PublicKey) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret, public)
}

/// Raw Diffie-Hellman output, symmetric in its inputs when roles swap.
pub fn shared_secret(private: &StaticSecret, peer_public: &PublicKey) -> [u8; KEY_LEN] {
    private.diffie_hellman(peer_public).to_bytes()
}

/// Stable peer identifier: keyed hash of the public key, hex encoded.
pub fn peer_id(public: &PublicKey) -> String {
    hex::encode(blake3::derive_key(ID_CONTEXT, public.as_bytes()))
}

pub fn encode_public_key(key: &PublicKey) -> String {
    BASE64.encode(key.as_bytes())
}

pub fn decode_public_key(encoded: &str) -> Result<PublicKey> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|_| Error::Crypto("could not decode public key"))?;
    let bytes: [u8; KEY_LEN] = bytes
        .try_into()
        .map_err(|_| Error::Crypto("public key must be 32 bytes"))?;
    Ok(PublicKey::from(bytes))
}

/// Encrypt `plaintext`, returning `nonce || ciphertext`.
pub fn seal(secret: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(secret));
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| Error::Crypto("encryption failed"))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Inverse of [`seal`]. Fails on truncated input or a bad auth tag.
pub fn open(secret: &[u8; KEY_LEN], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() <= NONCE_LEN {
        return Err(Error::Crypto("ciphertext too short"));
    }
    let (nonce, ciphertext) = data.split_at(NONCE_LEN);

    let cipher = XChaCha20Poly1305::new(Key::from_slice(secret));
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::Crypto("message authentication failed"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_secret_is_symmetric() {
        let (a_private, a_public) = gen_keypair();
        let (b_private, b_public) = gen_keypair();

        assert_eq!(
            shared_secret(&a_private, &b_public),
            shared_secret(&b_private, &a_public)
        );
    }

    #[test]
    fn seal_open_round_trip() {
        let secret = [7u8; KEY_LEN];
        let sealed = seal(&secret, b"attack at dawn").unwrap();

        assert_ne!(sealed, b"attack at dawn".to_vec());
        assert_eq!(open(&secret, &sealed).unwrap(), b"attack at dawn");
    }

    #[test]
    fn open_rejects_tampering() {
        let secret = [7u8; KEY_LEN];
        let mut sealed = seal(&secret, b"hello").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 1;

        assert!(open(&secret, &sealed).is_err());
    }

    #[test]
    fn open_rejects_wrong_key() {
        let sealed = seal(&[1u8; KEY_LEN], b"hello").unwrap();
        assert!(open(&[2u8; KEY_LEN], &sealed).is_err());
    }

    #[test]
    fn open_rejects_short_input() {
        assert!(open(&[0u8; KEY_LEN], &[0u8; 10]).is_err());
    }

    #[test]
    fn peer_id_is_a_deterministic_hash() {
        let (_, public) = gen_keypair();
        let id = peer_id(&public);

        assert_eq!(id.len(), 64);
        assert_eq!(id, peer_id(&public));
    }

    #[test]
    fn peer_ids_differ_between_keys() {
        let (_, a) = gen_keypair();
        let (_, b) = gen_keypair();
        assert_ne!(peer_id(&a), peer_id(&b));
    }

    #[test]
    fn public_key_codec_round_trip() {
        let (_, public) = gen_keypair();
        let decoded = decode_public_key(&encode_public_key(&public)).unwrap();
        assert_eq!(decoded.as_bytes(), public.as_bytes());
    }

    #[test]
    fn decode_public_key_rejects_bad_input() {
        assert!(decode_public_key("not base64 at all!!!").is_err());
        assert!(decode_public_key(&BASE64.encode(b"too short")).is_err());
    }
}
