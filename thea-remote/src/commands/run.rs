use anyhow::Result;
use tracing::*;

use thea_remote_core::{RemoteServer, ServerEvent, Services};

use crate::Cli;

pub(crate) async fn command(cli: &Cli) -> Result<()> {
    let config = super::load_or_create_config(&cli.config_path())?;
    let platform = super::host_platform(&config)?;
    let pairing_validity = config.pairing_code_validity;

    let (services, mut hub) = Services::new(config, platform).await?;
    let mut events = hub.subscribe(|_| true).await;
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ServerEvent::ClientAuthenticated {
                    session_id,
                    client_name,
                    ..
                } => info!(%session_id, %client_name, "Client authenticated"),
                ServerEvent::ClientDisconnected { session_id, reason } => {
                    info!(%session_id, %reason, "Client disconnected")
                }
                ServerEvent::AuthenticationFailed { address, reason } => {
                    warn!(%address, %reason, "Authentication failed")
                }
                _ => {}
            }
        }
    });

    let code = services
        .connections
        .generate_pairing_code(pairing_validity)
        .await;
    info!(%code, ?pairing_validity, "Pairing code issued");
    if let Some(expires_at) = services.connections.active_pairing_expiry().await {
        let _ = services
            .events
            .send(ServerEvent::PairingCodeIssued {
                code: code.clone(),
                expires_at,
            })
            .await;
    }

    let server = RemoteServer::new(services).await?;
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            server.stop().await;
        }
    }
    info!("Exiting");
    Ok(())
}
