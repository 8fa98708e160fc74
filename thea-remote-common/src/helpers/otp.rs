use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use totp_rs::{Algorithm, TOTP};

use super::rng::get_crypto_rng;
use crate::consts::TOTP_ISSUER;
use crate::types::Sensitive;

const SECRET_LEN: usize = 32;
const CODE_DIGITS: usize = 6;
const STEP_SECONDS: u64 = 30;
/// Codes from the adjacent window on either side are accepted, absorbing
/// client clock drift of up to one step.
const STEP_SKEW: u8 = 1;

const RECOVERY_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const RECOVERY_CODE_COUNT: usize = 8;
const RECOVERY_CODE_LEN: usize = 8;

/// The second-factor key shared with the client's authenticator app.
/// Stored as opaque bytes in the secret store; the otpauth URL is the
/// only enrolment surface.
#[derive(Clone)]
pub struct TotpSecret(Sensitive<Bytes>);

impl TotpSecret {
    pub fn generate() -> Self {
        let mut raw = [0u8; SECRET_LEN];
        get_crypto_rng().fill(&mut raw[..]);
        Self::from_bytes(Bytes::copy_from_slice(&raw))
    }

    pub fn from_bytes(raw: Bytes) -> Self {
        Self(Sensitive::new(raw))
    }

    /// Raw key bytes for persisting into the secret store.
    pub fn key_material(&self) -> &Bytes {
        self.0.reveal()
    }

    fn authenticator(&self, account_name: String) -> TOTP {
        TOTP {
            algorithm: Algorithm::SHA1,
            digits: CODE_DIGITS,
            skew: STEP_SKEW,
            step: STEP_SECONDS,
            secret: self.0.reveal().to_vec(),
            issuer: Some(TOTP_ISSUER.to_owned()),
            account_name,
        }
    }

    /// otpauth:// enrolment URL, labelled with the host this server runs
    /// on so the authenticator entry is recognisable.
    pub fn setup_url(&self, host_name: &str) -> Sensitive<String> {
        Sensitive::new(self.authenticator(host_name.to_owned()).get_url())
    }

    pub fn verify(&self, code: &str) -> bool {
        self.authenticator(String::new()).check(code, unix_now())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// Fallback codes issued alongside the TOTP secret. Each is usable once;
/// the consumed set is written back to the secret store.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RecoveryCodeSet {
    codes: Vec<Sensitive<String>>,
}

impl RecoveryCodeSet {
    pub fn generate() -> Self {
        let mut rng = get_crypto_rng();
        let codes = (0..RECOVERY_CODE_COUNT)
            .map(|_| {
                let mut code = String::with_capacity(RECOVERY_CODE_LEN + 1);
                for i in 0..RECOVERY_CODE_LEN {
                    if i == RECOVERY_CODE_LEN / 2 {
                        code.push('-');
                    }
                    let idx = rng.gen_range(0..RECOVERY_ALPHABET.len());
                    code.push(RECOVERY_ALPHABET[idx] as char);
                }
                Sensitive::new(code)
            })
            .collect();
        Self { codes }
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.codes.iter().map(|c| c.reveal().as_str())
    }

    pub fn remaining(&self) -> usize {
        self.codes.len()
    }

    /// Consumes a matching code. Comparison is constant time over the
    /// whole set so a miss costs the same as a hit.
    pub fn consume(&mut self, attempt: &str) -> bool {
        let attempt = attempt.trim().to_uppercase();
        let mut matched = None;
        for (i, code) in self.codes.iter().enumerate() {
            if code.reveal().as_bytes().ct_eq(attempt.as_bytes()).into() {
                matched = Some(i);
            }
        }
        match matched {
            Some(i) => {
                self.codes.remove(i);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totp_verifies_current_code() {
        let secret = TotpSecret::generate();
        let code = secret.authenticator(String::new()).generate(unix_now());
        assert!(secret.verify(&code));
        assert!(!secret.verify("000000") || code == "000000");
    }

    #[test]
    fn test_key_round_trips_through_raw_bytes() {
        let secret = TotpSecret::generate();
        let restored = TotpSecret::from_bytes(secret.key_material().clone());
        let code = restored.authenticator(String::new()).generate(unix_now());
        assert!(secret.verify(&code));
    }

    #[test]
    fn test_setup_url_carries_issuer_and_host() {
        let secret = TotpSecret::generate();
        let url = secret.setup_url("study.local");
        assert!(url.reveal().starts_with("otpauth://totp/"));
        assert!(url.reveal().contains("Thea%20Remote%20Desktop"));
        assert!(url.reveal().contains("study.local"));
    }

    #[test]
    fn test_recovery_codes_are_single_use() {
        let mut set = RecoveryCodeSet::generate();
        assert_eq!(set.remaining(), 8);
        let code = set.codes().next().unwrap().to_string();
        assert!(set.consume(&code));
        assert!(!set.consume(&code));
        assert_eq!(set.remaining(), 7);
    }

    #[test]
    fn test_recovery_code_format() {
        let set = RecoveryCodeSet::generate();
        for code in set.codes() {
            assert_eq!(code.len(), 9);
            assert_eq!(code.chars().nth(4), Some('-'));
            for c in code.chars().filter(|c| *c != '-') {
                assert!(RECOVERY_ALPHABET.contains(&(c as u8)));
            }
        }
    }
}
