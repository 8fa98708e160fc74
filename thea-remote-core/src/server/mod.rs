pub(crate) mod session;
#[cfg(test)]
mod tests;
pub(crate) mod writer;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::*;

use thea_remote_common::tls::{make_server_config, TlsCertificateAndPrivateKey};
use thea_remote_common::TheaError;

use crate::audit::{AuditAction, AuditResult};
use crate::events::ServerEvent;
use crate::services::Services;

pub use writer::WriterQueue;

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// The listener and accept pipeline. Whitelist, rate limit and the
/// session cap are all enforced here, before a session exists.
pub struct RemoteServer {
    services: Services,
    tls_acceptor: TlsAcceptor,
    shutdown: watch::Sender<bool>,
}

impl RemoteServer {
    pub async fn new(services: Services) -> Result<Self, TheaError> {
        let config = &services.config;
        let tls = match (&config.tls_certificate, &config.tls_private_key) {
            (Some(cert), Some(key)) => {
                TlsCertificateAndPrivateKey::from_files(cert, key).await?
            }
            _ => {
                TlsCertificateAndPrivateKey::load_or_generate(
                    &config.data_dir.join("tls"),
                    &config.name,
                )
                .await?
            }
        };
        let tls_acceptor = TlsAcceptor::from(make_server_config(tls)?);
        Ok(Self {
            services,
            tls_acceptor,
            shutdown: watch::channel(false).0,
        })
    }

    /// Accepts connections until [RemoteServer::stop] is called. Refused
    /// connections never enter the session table.
    pub async fn run(&self) -> Result<(), TheaError> {
        let config = &self.services.config;
        let address: SocketAddr = ([0, 0, 0, 0], config.port).into();
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(address)?;
        let listener = socket.listen(64)?;
        info!(%address, "Server listening");

        self.services
            .audit
            .log(
                AuditAction::ServerStarted,
                AuditResult::Success,
                None,
                None,
                format!("port {}", config.port),
            )
            .await;
        let _ = self
            .services
            .events
            .send(ServerEvent::Started { port: config.port })
            .await;

        if config.discovery_enabled {
            if let Err(error) = self
                .services
                .platform
                .discovery
                .start(&config.name, config.port)
                .await
            {
                warn!(%error, "Discovery advertising failed to start");
            }
        }

        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.handle_connection(stream, peer).await,
                    Err(error) => {
                        warn!(%error, "Accept failed");
                    }
                },
            }
        }

        drop(listener);
        info!("Listener closed");
        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let host = peer.ip().to_string();

        if !self.services.connections.is_whitelisted(&host) {
            info!(%peer, "Connection refused: not whitelisted");
            self.services
                .audit
                .log(
                    AuditAction::WhitelistRejected,
                    AuditResult::Denied,
                    None,
                    None,
                    host,
                )
                .await;
            return;
        }

        if !self.services.connections.check_rate_limit(&host).await {
            info!(%peer, "Connection refused: rate limited");
            self.services
                .audit
                .log(
                    AuditAction::RateLimitExceeded,
                    AuditResult::Blocked,
                    None,
                    None,
                    host,
                )
                .await;
            return;
        }

        // Enforced again at registration; this keeps refused connections
        // from paying for a TLS handshake
        if !self.services.state.lock().await.has_capacity() {
            info!(%peer, "Connection refused: session limit reached");
            self.services
                .audit
                .log(
                    AuditAction::ConnectionRejected,
                    AuditResult::Denied,
                    None,
                    None,
                    format!("{host}: session limit reached"),
                )
                .await;
            return;
        }

        let acceptor = self.tls_acceptor.clone();
        let services = self.services.clone();
        tokio::spawn(async move {
            let tls_stream =
                match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await
                {
                    Ok(Ok(tls_stream)) => tls_stream,
                    Ok(Err(error)) => {
                        debug!(%peer, %error, "TLS handshake failed");
                        services
                            .audit
                            .log(
                                AuditAction::ConnectionRejected,
                                AuditResult::Failure,
                                None,
                                None,
                                format!("{peer}: TLS handshake failed"),
                            )
                            .await;
                        return;
                    }
                    Err(_) => {
                        debug!(%peer, "TLS handshake timed out");
                        return;
                    }
                };
            session::run_session(services, tls_stream, peer).await;
        });
    }

    /// Terminates every session, stops accepting and withdraws the
    /// discovery advertisement.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.services
            .state
            .lock()
            .await
            .disconnect_all("server shutting down");
        if self.services.config.discovery_enabled {
            self.services.platform.discovery.stop().await;
        }
        self.services
            .audit
            .log(
                AuditAction::ServerStopped,
                AuditResult::Success,
                None,
                None,
                "",
            )
            .await;
        let _ = self.services.events.send(ServerEvent::Stopped).await;
    }

    pub fn services(&self) -> &Services {
        &self.services
    }
}

// Used by tests to drive a session over an in-memory duplex instead of a
// real TLS socket.
#[cfg(test)]
pub(crate) async fn run_plain_session<S>(services: Services, stream: S, peer: SocketAddr)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
{
    session::run_session(services, stream, peer).await;
}
