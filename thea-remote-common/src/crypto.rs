use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use bytes::Bytes;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use p256::ecdh::diffie_hellman;
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use p256::{PublicKey, SecretKey};
use rand::Rng;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::consts::SESSION_KEY_INFO;
use crate::helpers::rng::get_crypto_rng;
use crate::TheaError;

pub const SESSION_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

pub type SessionKey = Zeroizing<[u8; SESSION_KEY_LEN]>;

/// The server's long-lived P-256 keypair, used both for challenge signing
/// metadata and as the static half of the ECDH exchange.
pub struct ServerKeypair {
    secret: SecretKey,
}

impl ServerKeypair {
    pub fn generate() -> Self {
        Self {
            secret: SecretKey::random(&mut get_crypto_rng()),
        }
    }

    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, TheaError> {
        let secret = SecretKey::from_pkcs8_der(der).map_err(|_| TheaError::InvalidServerKey)?;
        Ok(Self { secret })
    }

    pub fn to_pkcs8_der(&self) -> Result<Zeroizing<Vec<u8>>, TheaError> {
        let doc = self
            .secret
            .to_pkcs8_der()
            .map_err(|e| TheaError::Crypto(e.to_string()))?;
        Ok(Zeroizing::new(doc.as_bytes().to_vec()))
    }

    /// Uncompressed SEC1 encoding of the public half.
    pub fn public_key_bytes(&self) -> Bytes {
        Bytes::from(self.secret.public_key().to_sec1_bytes().to_vec())
    }

    /// ECDH with the peer's public key, then HKDF-SHA256 (zero salt) down
    /// to a 32-byte AES-256-GCM session key.
    pub fn derive_session_key(&self, client_public: &[u8]) -> Result<SessionKey, TheaError> {
        let peer = PublicKey::from_sec1_bytes(client_public)
            .map_err(|_| TheaError::Crypto("invalid client public key".into()))?;
        let shared = diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());

        let hkdf = Hkdf::<Sha256>::new(None, shared.raw_secret_bytes().as_slice());
        let mut key = Zeroizing::new([0u8; SESSION_KEY_LEN]);
        hkdf.expand(SESSION_KEY_INFO, key.as_mut())
            .map_err(|_| TheaError::Crypto("HKDF expand failed".into()))?;
        Ok(key)
    }
}

/// AES-256-GCM seal; returns nonce-prefixed combined form.
pub fn encrypt(key: &SessionKey, plaintext: &[u8]) -> Result<Bytes, TheaError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_ref())
        .map_err(|e| TheaError::Crypto(e.to_string()))?;
    let nonce_bytes: [u8; NONCE_LEN] = get_crypto_rng().gen();
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| TheaError::Crypto("AES-GCM encryption failed".into()))?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out.into())
}

/// Inverse of [encrypt]: expects the nonce in the first 12 bytes.
pub fn decrypt(key: &SessionKey, combined: &[u8]) -> Result<Bytes, TheaError> {
    if combined.len() < NONCE_LEN {
        return Err(TheaError::Crypto("ciphertext too short".into()));
    }
    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key.as_ref())
        .map_err(|e| TheaError::Crypto(e.to_string()))?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| TheaError::Crypto("AES-GCM decryption failed".into()))?;
    Ok(plaintext.into())
}

/// HMAC-SHA256 over a challenge nonce, keyed by the shared secret.
pub fn challenge_response(nonce: &[u8], shared_secret: &[u8]) -> Result<Bytes, TheaError> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(shared_secret)
        .map_err(|e| TheaError::Crypto(e.to_string()))?;
    mac.update(nonce);
    Ok(Bytes::from(mac.finalize().into_bytes().to_vec()))
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
