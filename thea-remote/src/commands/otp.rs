use std::sync::Arc;

use anyhow::Result;

use thea_remote_core::auth::ConnectionManager;

use crate::Cli;

pub(crate) async fn command(cli: &Cli) -> Result<()> {
    let config = super::load_or_create_config(&cli.config_path())?;
    let platform = super::host_platform(&config)?;
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| config.name.clone());

    let manager = ConnectionManager::new(Arc::new(config), platform.secrets.clone()).await?;
    let (url, recovery_codes) = manager.setup_totp(&host).await?;

    println!("Scan this URL with your authenticator app:");
    println!("  {}", url.reveal());
    println!();
    println!("Recovery codes (single use, store them somewhere safe):");
    for code in recovery_codes {
        println!("  {code}");
    }
    println!();
    println!("Enable the `totp` capability in the config to enforce the second factor.");
    Ok(())
}
