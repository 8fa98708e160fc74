use bytes::Bytes;
use pbkdf2::pbkdf2_hmac;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::rng::get_crypto_rng;

const PBKDF2_ITERATIONS: u32 = 210_000;
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

/// Salted PBKDF2-HMAC-SHA256 record for the unattended-access password.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordRecord {
    #[serde(with = "super::serde_base64")]
    pub salt: Bytes,
    #[serde(with = "super::serde_base64")]
    pub hash: Bytes,
    pub iterations: u32,
}

pub fn hash_password(password: &str) -> PasswordRecord {
    let salt: [u8; SALT_LEN] = get_crypto_rng().gen();
    let mut hash = [0u8; HASH_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, PBKDF2_ITERATIONS, &mut hash);
    PasswordRecord {
        salt: Bytes::copy_from_slice(&salt),
        hash: Bytes::copy_from_slice(&hash),
        iterations: PBKDF2_ITERATIONS,
    }
}

pub fn verify_password(password: &str, record: &PasswordRecord) -> bool {
    let mut hash = vec![0u8; record.hash.len()];
    pbkdf2_hmac::<Sha256>(
        password.as_bytes(),
        &record.salt,
        record.iterations,
        &mut hash,
    );
    hash.ct_eq(&record.hash).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_round_trip() {
        let record = hash_password("correct horse");
        assert!(verify_password("correct horse", &record));
        assert!(!verify_password("battery staple", &record));
    }

    #[test]
    fn test_salts_differ_between_records() {
        let a = hash_password("same");
        let b = hash_password("same");
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.hash, b.hash);
    }
}
