mod rate_limit;

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tokio::sync::Mutex;
use tracing::*;

use thea_remote_common::crypto::{self, ServerKeypair, SessionKey};
use thea_remote_common::helpers::otp::{RecoveryCodeSet, TotpSecret};
use thea_remote_common::helpers::rng::get_crypto_rng;
use thea_remote_common::{
    AuthMethod, Sensitive, ServerConfig, TheaError, SECRET_STORE_SERVICE,
    SECRET_STORE_TOTP_SERVICE, SERVER_KEY_ACCOUNT,
};
use thea_remote_protocol::{AuthChallenge, AuthResponse, Permission};

use crate::platform::SecretStore;

pub use rate_limit::AttemptRateLimiter;

const SHARED_SECRET_ACCOUNT: &str = "thea.remote.shared.secret";
const TOTP_KEY_ACCOUNT: &str = "thea.remote.totp.secret";
const TOTP_RECOVERY_ACCOUNT: &str = "thea.remote.totp.recovery";

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("Challenge mismatch")]
    ChallengeMismatch,
    #[error("Challenge expired")]
    ChallengeExpired,
    #[error("Invalid pairing code")]
    InvalidPairingCode,
    #[error("Pairing code expired")]
    PairingCodeExpired,
    #[error("Pairing code already used")]
    PairingCodeUsed,
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Authentication method not available")]
    MethodUnsupported,
    #[error("Two-factor code required")]
    TotpRequired,
    #[error("Two-factor code invalid")]
    TotpFailed,
}

struct PairingSession {
    code: Sensitive<String>,
    expires_at: DateTime<Utc>,
    used: bool,
}

/// Owns the server keypair and everything needed to decide whether a
/// connection may become a session: pairing codes, stored credentials,
/// the attempt rate limiter and the whitelist.
pub struct ConnectionManager {
    config: Arc<ServerConfig>,
    keypair: ServerKeypair,
    secrets: Arc<dyn SecretStore>,
    pairing: Mutex<Option<PairingSession>>,
    rate_limiter: AttemptRateLimiter,
}

impl ConnectionManager {
    /// Loads the server private key from the secret store, generating and
    /// persisting a fresh one on first start.
    pub async fn new(
        config: Arc<ServerConfig>,
        secrets: Arc<dyn SecretStore>,
    ) -> Result<Self, TheaError> {
        let keypair = match secrets
            .get(SECRET_STORE_SERVICE, SERVER_KEY_ACCOUNT)
            .await
            .map_err(|e| TheaError::SecretStore(e.to_string()))?
        {
            Some(der) => ServerKeypair::from_pkcs8_der(&der)?,
            None => {
                info!("No server key found, generating a new P-256 keypair");
                let keypair = ServerKeypair::generate();
                secrets
                    .put(
                        SECRET_STORE_SERVICE,
                        SERVER_KEY_ACCOUNT,
                        &keypair.to_pkcs8_der()?,
                    )
                    .await
                    .map_err(|e| TheaError::SecretStore(e.to_string()))?;
                keypair
            }
        };

        Ok(Self {
            rate_limiter: AttemptRateLimiter::new(config.rate_limit_per_minute),
            config,
            keypair,
            secrets,
            pairing: Mutex::new(None),
        })
    }

    pub fn generate_challenge(&self) -> AuthChallenge {
        AuthChallenge {
            challenge_id: uuid::Uuid::new_v4(),
            nonce: Bytes::from_iter(get_crypto_rng().gen::<[u8; 32]>()),
            timestamp: Utc::now(),
            server_public_key: Some(self.keypair.public_key_bytes()),
        }
    }

    /// Issues a fresh 6-digit pairing code, replacing any active one.
    pub async fn generate_pairing_code(&self, valid_for: std::time::Duration) -> String {
        let code = format!("{:06}", get_crypto_rng().gen_range(0..1_000_000u32));
        let mut pairing = self.pairing.lock().await;
        *pairing = Some(PairingSession {
            code: Sensitive::new(code.clone()),
            expires_at: Utc::now() + Duration::from_std(valid_for).unwrap_or(Duration::zero()),
            used: false,
        });
        code
    }

    pub async fn active_pairing_expiry(&self) -> Option<DateTime<Utc>> {
        self.pairing.lock().await.as_ref().map(|p| p.expires_at)
    }

    pub async fn check_rate_limit(&self, host: &str) -> bool {
        self.rate_limiter.check(host).await
    }

    /// An empty whitelist admits everyone; otherwise the host must match
    /// an entry exactly.
    pub fn is_whitelisted(&self, host: &str) -> bool {
        self.config.whitelist.is_empty() || self.config.whitelist.iter().any(|w| w == host)
    }

    pub fn derive_session_key(&self, client_public: &[u8]) -> Result<SessionKey, TheaError> {
        self.keypair.derive_session_key(client_public)
    }

    pub fn server_public_key(&self) -> Bytes {
        self.keypair.public_key_bytes()
    }

    fn verify_challenge_window(&self, challenge: &AuthChallenge) -> Result<(), AuthError> {
        let timeout = Duration::from_std(self.config.auth_timeout)
            .unwrap_or_else(|_| Duration::seconds(30));
        let elapsed = Utc::now() - challenge.timestamp;
        // Tolerate the clock stepping backwards by up to half the window
        if elapsed > timeout || elapsed < -(timeout / 2) {
            return Err(AuthError::ChallengeExpired);
        }
        Ok(())
    }

    /// Method-specific credential verification for one challenge/response
    /// pair. Does not touch session state.
    pub async fn verify_authentication(
        &self,
        challenge: &AuthChallenge,
        response: &AuthResponse,
    ) -> Result<(), AuthError> {
        if response.challenge_id != challenge.challenge_id {
            return Err(AuthError::ChallengeMismatch);
        }
        self.verify_challenge_window(challenge)?;

        // Second factor first: a missing TOTP code must not consume the
        // single-use pairing code.
        if self.config.capabilities.totp {
            self.verify_second_factor(response).await?;
        }

        match self.config.auth_method {
            AuthMethod::PairingCode => self.verify_pairing_code(response).await?,
            AuthMethod::SharedSecret => self.verify_shared_secret(challenge, response).await?,
            AuthMethod::Certificate => self.verify_certificate(response)?,
            AuthMethod::AccountIdentity | AuthMethod::Biometric => {
                // Stubs: these methods need an external identity provider.
                return Err(AuthError::MethodUnsupported);
            }
        }
        Ok(())
    }

    async fn verify_pairing_code(&self, response: &AuthResponse) -> Result<(), AuthError> {
        let Some(attempt) = &response.pairing_code else {
            return Err(AuthError::InvalidPairingCode);
        };
        let mut pairing = self.pairing.lock().await;
        let Some(session) = pairing.as_mut() else {
            return Err(AuthError::InvalidPairingCode);
        };
        if session.used {
            return Err(AuthError::PairingCodeUsed);
        }
        if Utc::now() > session.expires_at {
            *pairing = None;
            return Err(AuthError::PairingCodeExpired);
        }
        if !crypto::constant_time_eq(
            session.code.reveal().as_bytes(),
            attempt.as_bytes(),
        ) {
            return Err(AuthError::InvalidPairingCode);
        }
        session.used = true;
        *pairing = None;
        Ok(())
    }

    async fn verify_shared_secret(
        &self,
        challenge: &AuthChallenge,
        response: &AuthResponse,
    ) -> Result<(), AuthError> {
        let Some(proof) = &response.shared_secret_proof else {
            return Err(AuthError::InvalidCredentials);
        };
        let secret = self
            .secrets
            .get(SECRET_STORE_SERVICE, SHARED_SECRET_ACCOUNT)
            .await
            .map_err(|_| AuthError::MethodUnsupported)?
            .ok_or(AuthError::MethodUnsupported)?;
        let expected = crypto::challenge_response(&challenge.nonce, &secret)
            .map_err(|_| AuthError::InvalidCredentials)?;
        if !crypto::constant_time_eq(&expected, proof) {
            return Err(AuthError::InvalidCredentials);
        }
        Ok(())
    }

    fn verify_certificate(&self, response: &AuthResponse) -> Result<(), AuthError> {
        let Some(certificate) = &response.certificate else {
            return Err(AuthError::InvalidCredentials);
        };
        let trusted = self
            .config
            .trusted_certificates
            .iter()
            .any(|t| crypto::constant_time_eq(&t.data, certificate));
        if !trusted {
            return Err(AuthError::InvalidCredentials);
        }
        Ok(())
    }

    async fn verify_second_factor(&self, response: &AuthResponse) -> Result<(), AuthError> {
        if let Some(code) = &response.totp_code {
            let key = self
                .totp_key()
                .await
                .map_err(|_| AuthError::MethodUnsupported)?
                .ok_or(AuthError::MethodUnsupported)?;
            if key.verify(code) {
                return Ok(());
            }
            return Err(AuthError::TotpFailed);
        }
        if let Some(code) = &response.recovery_code {
            if self.consume_recovery_code(code).await {
                return Ok(());
            }
            return Err(AuthError::TotpFailed);
        }
        Err(AuthError::TotpRequired)
    }

    async fn totp_key(&self) -> Result<Option<TotpSecret>, TheaError> {
        Ok(self
            .secrets
            .get(SECRET_STORE_TOTP_SERVICE, TOTP_KEY_ACCOUNT)
            .await
            .map_err(|e| TheaError::SecretStore(e.to_string()))?
            .map(TotpSecret::from_bytes))
    }

    /// Generates and stores a new TOTP secret plus recovery codes,
    /// returning the otpauth URL and the plain codes for one-time display.
    pub async fn setup_totp(
        &self,
        account_label: &str,
    ) -> Result<(Sensitive<String>, Vec<String>), TheaError> {
        let key = TotpSecret::generate();
        self.secrets
            .put(SECRET_STORE_TOTP_SERVICE, TOTP_KEY_ACCOUNT, key.key_material())
            .await
            .map_err(|e| TheaError::SecretStore(e.to_string()))?;

        let recovery = RecoveryCodeSet::generate();
        let codes: Vec<String> = recovery.codes().map(str::to_owned).collect();
        self.secrets
            .put(
                SECRET_STORE_TOTP_SERVICE,
                TOTP_RECOVERY_ACCOUNT,
                &serde_json::to_vec(&recovery)?,
            )
            .await
            .map_err(|e| TheaError::SecretStore(e.to_string()))?;

        Ok((key.setup_url(account_label), codes))
    }

    async fn consume_recovery_code(&self, attempt: &str) -> bool {
        let Ok(Some(stored)) = self
            .secrets
            .get(SECRET_STORE_TOTP_SERVICE, TOTP_RECOVERY_ACCOUNT)
            .await
        else {
            return false;
        };
        let Ok(mut set) = serde_json::from_slice::<RecoveryCodeSet>(&stored) else {
            return false;
        };
        if !set.consume(attempt) {
            return false;
        }
        match serde_json::to_vec(&set) {
            Ok(data) => {
                if let Err(error) = self
                    .secrets
                    .put(SECRET_STORE_TOTP_SERVICE, TOTP_RECOVERY_ACCOUNT, &data)
                    .await
                {
                    error!(%error, "Failed to persist consumed recovery code");
                    return false;
                }
                true
            }
            Err(_) => false,
        }
    }

    /// Stores the salted PBKDF2 record for the unattended-access password.
    pub async fn set_unattended_password(&self, password: &str) -> Result<(), TheaError> {
        let record = thea_remote_common::helpers::hash::hash_password(password);
        self.secrets
            .put(
                SECRET_STORE_SERVICE,
                thea_remote_common::UNATTENDED_PASSWORD_ACCOUNT,
                &serde_json::to_vec(&record)?,
            )
            .await
            .map_err(|e| TheaError::SecretStore(e.to_string()))
    }

    pub async fn verify_unattended_password(&self, password: &str) -> Result<bool, TheaError> {
        let Some(stored) = self
            .secrets
            .get(
                SECRET_STORE_SERVICE,
                thea_remote_common::UNATTENDED_PASSWORD_ACCOUNT,
            )
            .await
            .map_err(|e| TheaError::SecretStore(e.to_string()))?
        else {
            return Ok(false);
        };
        let record: thea_remote_common::helpers::hash::PasswordRecord =
            serde_json::from_slice(&stored)?;
        Ok(thea_remote_common::helpers::hash::verify_password(
            password, &record,
        ))
    }

    pub async fn set_shared_secret(&self, secret: &Sensitive<String>) -> Result<(), TheaError> {
        self.secrets
            .put(
                SECRET_STORE_SERVICE,
                SHARED_SECRET_ACCOUNT,
                secret.reveal().as_bytes(),
            )
            .await
            .map_err(|e| TheaError::SecretStore(e.to_string()))
    }

    /// Permissions the server is willing to grant under the current
    /// configuration. Requested permissions outside this set are dropped
    /// silently at authentication.
    pub fn allowed_permissions(&self) -> HashSet<Permission> {
        let caps = &self.config.capabilities;
        let mut allowed = HashSet::new();
        if caps.screen {
            allowed.insert(Permission::ViewScreen);
        }
        if caps.input {
            allowed.insert(Permission::ControlScreen);
        }
        if caps.files {
            allowed.insert(Permission::ViewFiles);
            allowed.insert(Permission::ReadFiles);
            allowed.insert(Permission::WriteFiles);
            allowed.insert(Permission::DeleteFiles);
        }
        if caps.system {
            allowed.insert(Permission::ExecuteCommands);
            allowed.insert(Permission::SystemControl);
        }
        allowed.insert(Permission::InferenceRelay);
        // NetworkAccess is never granted: the proxy feature is disabled
        // permanently.
        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::MemorySecretStore;
    use thea_remote_protocol::DeviceKind;

    fn test_config(method: AuthMethod) -> Arc<ServerConfig> {
        let mut config = ServerConfig::defaults_with_data_dir("/tmp/thea-test".into());
        config.auth_method = method;
        Arc::new(config)
    }

    fn response_for(challenge: &AuthChallenge) -> AuthResponse {
        AuthResponse {
            challenge_id: challenge.challenge_id,
            client_name: "Laptop".into(),
            device_type: DeviceKind::Mac,
            client_id: None,
            requested_permissions: vec![Permission::ViewScreen],
            pairing_code: None,
            shared_secret_proof: None,
            certificate: None,
            totp_code: None,
            recovery_code: None,
            client_public_key: None,
        }
    }

    async fn manager(method: AuthMethod) -> ConnectionManager {
        ConnectionManager::new(test_config(method), Arc::new(MemorySecretStore::default()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_keypair_is_persisted_across_restarts() {
        let secrets = Arc::new(MemorySecretStore::default());
        let a = ConnectionManager::new(test_config(AuthMethod::PairingCode), secrets.clone())
            .await
            .unwrap();
        let b = ConnectionManager::new(test_config(AuthMethod::PairingCode), secrets)
            .await
            .unwrap();
        assert_eq!(a.server_public_key(), b.server_public_key());
    }

    #[tokio::test]
    async fn test_pairing_code_happy_path() {
        let manager = manager(AuthMethod::PairingCode).await;
        let code = manager
            .generate_pairing_code(std::time::Duration::from_secs(300))
            .await;
        assert_eq!(code.len(), 6);

        let challenge = manager.generate_challenge();
        let mut response = response_for(&challenge);
        response.pairing_code = Some(code);
        manager
            .verify_authentication(&challenge, &response)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pairing_code_is_single_use() {
        let manager = manager(AuthMethod::PairingCode).await;
        let code = manager
            .generate_pairing_code(std::time::Duration::from_secs(300))
            .await;
        let challenge = manager.generate_challenge();
        let mut response = response_for(&challenge);
        response.pairing_code = Some(code);
        manager
            .verify_authentication(&challenge, &response)
            .await
            .unwrap();

        // active code was cleared on success
        let challenge = manager.generate_challenge();
        let err = manager
            .verify_authentication(&challenge, &response)
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::InvalidPairingCode);
    }

    #[tokio::test]
    async fn test_wrong_pairing_code_is_rejected() {
        let manager = manager(AuthMethod::PairingCode).await;
        let _ = manager
            .generate_pairing_code(std::time::Duration::from_secs(300))
            .await;
        let challenge = manager.generate_challenge();
        let mut response = response_for(&challenge);
        response.pairing_code = Some("000000".into());
        assert_eq!(
            manager
                .verify_authentication(&challenge, &response)
                .await
                .unwrap_err(),
            AuthError::InvalidPairingCode
        );
    }

    #[tokio::test]
    async fn test_new_code_overwrites_active_one() {
        let manager = manager(AuthMethod::PairingCode).await;
        let first = manager
            .generate_pairing_code(std::time::Duration::from_secs(300))
            .await;
        let second = manager
            .generate_pairing_code(std::time::Duration::from_secs(300))
            .await;

        let challenge = manager.generate_challenge();
        let mut response = response_for(&challenge);
        response.pairing_code = Some(first.clone());
        if first != second {
            assert!(manager
                .verify_authentication(&challenge, &response)
                .await
                .is_err());
        }
        response.pairing_code = Some(second);
        manager
            .verify_authentication(&challenge, &response)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_challenge_mismatch_is_rejected() {
        let manager = manager(AuthMethod::PairingCode).await;
        let code = manager
            .generate_pairing_code(std::time::Duration::from_secs(300))
            .await;
        let challenge = manager.generate_challenge();
        let other = manager.generate_challenge();
        let mut response = response_for(&other);
        response.pairing_code = Some(code);
        assert_eq!(
            manager
                .verify_authentication(&challenge, &response)
                .await
                .unwrap_err(),
            AuthError::ChallengeMismatch
        );
    }

    #[tokio::test]
    async fn test_expired_challenge_is_rejected() {
        let manager = manager(AuthMethod::PairingCode).await;
        let code = manager
            .generate_pairing_code(std::time::Duration::from_secs(300))
            .await;
        let mut challenge = manager.generate_challenge();
        challenge.timestamp = Utc::now() - Duration::seconds(31);
        let mut response = response_for(&challenge);
        response.pairing_code = Some(code);
        assert_eq!(
            manager
                .verify_authentication(&challenge, &response)
                .await
                .unwrap_err(),
            AuthError::ChallengeExpired
        );
    }

    #[tokio::test]
    async fn test_shared_secret_hmac() {
        let secrets = Arc::new(MemorySecretStore::default());
        let manager =
            ConnectionManager::new(test_config(AuthMethod::SharedSecret), secrets.clone())
                .await
                .unwrap();
        manager
            .set_shared_secret(&Sensitive::new("hunter2".to_owned()))
            .await
            .unwrap();

        let challenge = manager.generate_challenge();
        let mut response = response_for(&challenge);
        response.shared_secret_proof =
            Some(crypto::challenge_response(&challenge.nonce, b"hunter2").unwrap());
        manager
            .verify_authentication(&challenge, &response)
            .await
            .unwrap();

        response.shared_secret_proof =
            Some(crypto::challenge_response(&challenge.nonce, b"wrong").unwrap());
        assert_eq!(
            manager
                .verify_authentication(&challenge, &response)
                .await
                .unwrap_err(),
            AuthError::InvalidCredentials
        );
    }

    #[tokio::test]
    async fn test_unsupported_methods_reject() {
        let manager = manager(AuthMethod::Biometric).await;
        let challenge = manager.generate_challenge();
        let response = response_for(&challenge);
        assert_eq!(
            manager
                .verify_authentication(&challenge, &response)
                .await
                .unwrap_err(),
            AuthError::MethodUnsupported
        );
    }

    #[tokio::test]
    async fn test_whitelist_empty_admits_all() {
        let manager = manager(AuthMethod::PairingCode).await;
        assert!(manager.is_whitelisted("10.1.2.3"));
    }

    #[tokio::test]
    async fn test_whitelist_exact_match() {
        let mut config = ServerConfig::defaults_with_data_dir("/tmp/thea-test".into());
        config.whitelist = vec!["10.0.0.5".into()];
        let manager = ConnectionManager::new(
            Arc::new(config),
            Arc::new(MemorySecretStore::default()),
        )
        .await
        .unwrap();
        assert!(manager.is_whitelisted("10.0.0.5"));
        assert!(!manager.is_whitelisted("10.0.0.6"));
        assert!(!manager.is_whitelisted("10.0.0"));
    }

    #[tokio::test]
    async fn test_allowed_permissions_follow_toggles() {
        let mut config = ServerConfig::defaults_with_data_dir("/tmp/thea-test".into());
        config.capabilities.system = false;
        let manager = ConnectionManager::new(
            Arc::new(config),
            Arc::new(MemorySecretStore::default()),
        )
        .await
        .unwrap();
        let allowed = manager.allowed_permissions();
        assert!(allowed.contains(&Permission::ViewScreen));
        assert!(!allowed.contains(&Permission::ExecuteCommands));
        assert!(!allowed.contains(&Permission::NetworkAccess));
    }

    #[tokio::test]
    async fn test_unattended_password_round_trip() {
        let manager = manager(AuthMethod::PairingCode).await;
        assert!(!manager.verify_unattended_password("pw").await.unwrap());
        manager.set_unattended_password("pw").await.unwrap();
        assert!(manager.verify_unattended_password("pw").await.unwrap());
        assert!(!manager.verify_unattended_password("other").await.unwrap());
    }

    #[tokio::test]
    async fn test_totp_second_factor() {
        let secrets = Arc::new(MemorySecretStore::default());
        let mut config = ServerConfig::defaults_with_data_dir("/tmp/thea-test".into());
        config.auth_method = AuthMethod::PairingCode;
        config.capabilities.totp = true;
        let manager = ConnectionManager::new(Arc::new(config), secrets)
            .await
            .unwrap();
        let (_url, codes) = manager.setup_totp("host.local").await.unwrap();

        let code = manager
            .generate_pairing_code(std::time::Duration::from_secs(300))
            .await;
        let challenge = manager.generate_challenge();
        let mut response = response_for(&challenge);
        response.pairing_code = Some(code);

        // No second factor provided
        assert_eq!(
            manager
                .verify_authentication(&challenge, &response)
                .await
                .unwrap_err(),
            AuthError::TotpRequired
        );

        // The failed attempt above must not have consumed the pairing code
        response.recovery_code = Some(codes[0].clone());
        manager
            .verify_authentication(&challenge, &response)
            .await
            .unwrap();
    }
}
