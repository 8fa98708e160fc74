use std::sync::Arc;

use anyhow::Result;

use thea_remote_common::Sensitive;
use thea_remote_core::auth::ConnectionManager;

use crate::Cli;

pub(crate) async fn set_password(cli: &Cli, password: &str) -> Result<()> {
    let config = super::load_or_create_config(&cli.config_path())?;
    let platform = super::host_platform(&config)?;
    let manager = ConnectionManager::new(Arc::new(config), platform.secrets.clone()).await?;
    manager.set_unattended_password(password).await?;
    println!("Unattended-access password updated");
    Ok(())
}

pub(crate) async fn set_secret(cli: &Cli, secret: &str) -> Result<()> {
    let config = super::load_or_create_config(&cli.config_path())?;
    let platform = super::host_platform(&config)?;
    let manager = ConnectionManager::new(Arc::new(config), platform.secrets.clone()).await?;
    manager
        .set_shared_secret(&Sensitive::new(secret.to_owned()))
        .await?;
    println!("Shared secret updated");
    Ok(())
}
