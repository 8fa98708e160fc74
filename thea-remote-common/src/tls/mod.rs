mod cert;

use std::sync::Arc;

pub use cert::{TlsCertificateAndPrivateKey, TlsCertificateBundle, TlsPrivateKey};

#[derive(thiserror::Error, Debug)]
pub enum TlsSetupError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Tls(#[from] rustls::Error),
    #[error("no certificates found in certificate file")]
    NoCertificates,
    #[error("no private keys found in key file")]
    NoKeys,
    #[error("certificate generation: {0}")]
    CertGen(#[from] rcgen::Error),
}

/// Builds the listener's TLS configuration. TLS 1.3 only; clients do not
/// present certificates (application-level auth supplants them).
pub fn make_server_config(
    bundle: TlsCertificateAndPrivateKey,
) -> Result<Arc<rustls::ServerConfig>, TlsSetupError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(
            bundle.certificate.into_certificates(),
            bundle.private_key.into_key(),
        )?;
    Ok(Arc::new(config))
}
