pub mod check;
pub mod otp;
pub mod run;
pub mod secrets;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use thea_remote_common::ServerConfig;
use thea_remote_core::platform::{FileSecretStore, Platform, SecretStore};

pub(crate) fn load_or_create_config(path: &Path) -> Result<ServerConfig> {
    if path.exists() {
        ServerConfig::load(path).with_context(|| format!("Loading config from {path:?}"))
    } else {
        let data_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| ".".into());
        let config = ServerConfig::defaults_with_data_dir(data_dir);
        config
            .save(path)
            .with_context(|| format!("Writing default config to {path:?}"))?;
        tracing::info!(?path, "Wrote default configuration");
        Ok(config)
    }
}

/// The reference host platform: null capture/input/encode plus a
/// file-backed secret store under the data directory.
pub(crate) fn host_platform(config: &ServerConfig) -> Result<Platform> {
    let secrets: Arc<dyn SecretStore> = Arc::new(
        FileSecretStore::open(config.data_dir.join("secrets.json"))
            .context("Opening the secret store")?,
    );
    let mut platform = Platform::null();
    platform.secrets = secrets;
    Ok(platform)
}
