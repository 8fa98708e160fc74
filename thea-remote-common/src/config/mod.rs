mod defaults;

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use defaults::*;
use serde::{Deserialize, Serialize};

use crate::helpers::fs::atomic_write;
use crate::TheaError;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AuthMethod {
    PairingCode,
    SharedSecret,
    Certificate,
    AccountIdentity,
    Biometric,
}

/// Per-capability feature switches. A disabled capability refuses the
/// corresponding requests regardless of session permissions.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityToggles {
    #[serde(default = "_default_true")]
    pub screen: bool,
    #[serde(default = "_default_true")]
    pub input: bool,
    #[serde(default = "_default_true")]
    pub files: bool,
    #[serde(default = "_default_true")]
    pub system: bool,
    #[serde(default = "_default_false")]
    pub audio: bool,
    #[serde(default = "_default_true")]
    pub recording: bool,
    #[serde(default = "_default_true")]
    pub clipboard: bool,
    #[serde(default = "_default_true")]
    pub chat: bool,
    #[serde(default = "_default_true")]
    pub annotations: bool,
    #[serde(default = "_default_false")]
    pub totp: bool,
}

impl Default for CapabilityToggles {
    fn default() -> Self {
        #[allow(clippy::unwrap_used)]
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "_default_server_name")]
    pub name: String,

    #[serde(default = "_default_port")]
    pub port: u16,

    #[serde(default = "_default_max_sessions")]
    pub max_sessions: usize,

    pub auth_method: AuthMethod,

    #[serde(default = "_default_auth_timeout", with = "humantime_serde")]
    pub auth_timeout: Duration,

    #[serde(default = "_default_session_timeout", with = "humantime_serde")]
    pub session_timeout: Duration,

    #[serde(default = "_default_pairing_code_validity", with = "humantime_serde")]
    pub pairing_code_validity: Duration,

    #[serde(default = "_default_confirmation_timeout", with = "humantime_serde")]
    pub confirmation_timeout: Duration,

    #[serde(default = "_default_true")]
    pub require_confirmation: bool,

    #[serde(default = "_default_false")]
    pub discovery_enabled: bool,

    #[serde(default)]
    pub capabilities: CapabilityToggles,

    /// Exact-match host whitelist. Empty means any host may connect.
    #[serde(default)]
    pub whitelist: Vec<String>,

    #[serde(default = "_default_max_file_transfer_size")]
    pub max_file_transfer_size: u64,

    #[serde(default)]
    pub allowed_paths: Vec<PathBuf>,

    #[serde(default)]
    pub blocked_paths: Vec<PathBuf>,

    #[serde(default = "_default_audit_retention_days")]
    pub audit_retention_days: u32,

    #[serde(default = "_default_max_audit_entries_in_memory")]
    pub max_audit_entries_in_memory: usize,

    #[serde(default = "_default_rate_limit_per_minute")]
    pub rate_limit_per_minute: usize,

    /// DER blobs of client certificates accepted by the certificate auth
    /// method.
    #[serde(default)]
    pub trusted_certificates: Vec<TrustedCertificate>,

    /// Where audit logs and recordings live. Resolved by the host.
    pub data_dir: PathBuf,

    /// Optional PEM certificate + key paths for the TLS listener. When
    /// absent a self-signed certificate is generated under `data_dir`.
    #[serde(default)]
    pub tls_certificate: Option<PathBuf>,
    #[serde(default)]
    pub tls_private_key: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TrustedCertificate {
    pub label: String,
    #[serde(with = "crate::helpers::serde_base64")]
    pub data: Bytes,
}

impl ServerConfig {
    pub fn defaults_with_data_dir(data_dir: PathBuf) -> Self {
        #[allow(clippy::unwrap_used)]
        serde_json::from_value(serde_json::json!({
            "authMethod": "pairingCode",
            "dataDir": data_dir,
        }))
        .unwrap()
    }

    pub fn load(path: &Path) -> Result<Self, TheaError> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), TheaError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        atomic_write(path, &serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.data_dir.join("audit").join("audit_log.json")
    }

    pub fn recordings_dir(&self) -> PathBuf {
        self.data_dir.join("recordings")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::defaults_with_data_dir("/tmp/thea".into());
        assert_eq!(config.port, 9847);
        assert_eq!(config.max_sessions, 5);
        assert_eq!(config.auth_timeout, Duration::from_secs(30));
        assert_eq!(config.session_timeout, Duration::from_secs(3600));
        assert!(config.require_confirmation);
        assert!(!config.discovery_enabled);
        assert!(config.whitelist.is_empty());
        assert!(config.capabilities.screen);
        assert!(!config.capabilities.totp);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = ServerConfig::defaults_with_data_dir(dir.path().into());
        config.whitelist.push("10.0.0.5".into());
        config.capabilities.audio = true;
        config.save(&path).unwrap();
        let loaded = ServerConfig::load(&path).unwrap();
        assert_eq!(config, loaded);
    }
}
