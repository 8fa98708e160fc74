use anyhow::{bail, Result};

use thea_remote_common::ServerConfig;

use crate::Cli;

pub(crate) async fn command(cli: &Cli) -> Result<()> {
    let path = cli.config_path();
    let config = ServerConfig::load(&path)?;
    validate(&config)?;
    println!("{}: no problems found", path.display());
    Ok(())
}

fn validate(config: &ServerConfig) -> Result<()> {
    if config.port == 0 {
        bail!("port must be non-zero");
    }
    if config.max_sessions == 0 {
        bail!("maxSessions must be at least 1");
    }
    if config.auth_timeout.is_zero() || config.session_timeout.is_zero() {
        bail!("timeouts must be non-zero");
    }
    if config.tls_certificate.is_some() != config.tls_private_key.is_some() {
        bail!("tlsCertificate and tlsPrivateKey must be set together");
    }
    for path in config.allowed_paths.iter().chain(&config.blocked_paths) {
        if !path.is_absolute() {
            bail!("path list entries must be absolute: {}", path.display());
        }
    }
    Ok(())
}
