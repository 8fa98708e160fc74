use std::path::Path;

use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use super::TlsSetupError;
use crate::helpers::fs::secure_file;

#[derive(Debug)]
pub struct TlsCertificateBundle {
    certificates: Vec<CertificateDer<'static>>,
}

#[derive(Debug)]
pub struct TlsPrivateKey {
    key: PrivateKeyDer<'static>,
}

#[derive(Debug)]
pub struct TlsCertificateAndPrivateKey {
    pub certificate: TlsCertificateBundle,
    pub private_key: TlsPrivateKey,
}

impl TlsCertificateBundle {
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, TlsSetupError> {
        let mut file = File::open(path).await?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).await?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TlsSetupError> {
        let certificates = rustls_pemfile::certs(&mut &bytes[..])
            .collect::<Result<Vec<CertificateDer<'static>>, _>>()?;
        if certificates.is_empty() {
            return Err(TlsSetupError::NoCertificates);
        }
        Ok(Self { certificates })
    }

    pub fn certificates(&self) -> &[CertificateDer<'static>] {
        &self.certificates
    }

    pub fn into_certificates(self) -> Vec<CertificateDer<'static>> {
        self.certificates
    }
}

impl TlsPrivateKey {
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, TlsSetupError> {
        let mut file = File::open(path).await?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).await?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TlsSetupError> {
        let key = rustls_pemfile::private_key(&mut &bytes[..])?.ok_or(TlsSetupError::NoKeys)?;
        Ok(Self { key })
    }

    pub fn into_key(self) -> PrivateKeyDer<'static> {
        self.key
    }
}

impl TlsCertificateAndPrivateKey {
    pub async fn from_files<P: AsRef<Path>>(
        cert_path: P,
        key_path: P,
    ) -> Result<Self, TlsSetupError> {
        Ok(Self {
            certificate: TlsCertificateBundle::from_file(cert_path).await?,
            private_key: TlsPrivateKey::from_file(key_path).await?,
        })
    }

    /// Loads the PEM pair under `dir`, generating a self-signed pair on
    /// first use.
    pub async fn load_or_generate(dir: &Path, host_name: &str) -> Result<Self, TlsSetupError> {
        let cert_path = dir.join("tls.certificate.pem");
        let key_path = dir.join("tls.key.pem");

        if !cert_path.exists() || !key_path.exists() {
            tokio::fs::create_dir_all(dir).await?;
            let generated = rcgen::generate_simple_self_signed(vec![
                host_name.to_owned(),
                "localhost".to_owned(),
            ])?;
            tokio::fs::write(&cert_path, generated.cert.pem()).await?;
            tokio::fs::write(&key_path, generated.key_pair.serialize_pem()).await?;
            secure_file(&key_path)?;
        }

        Self::from_files(cert_path, key_path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_generates_and_reloads_self_signed_pair() {
        let dir = tempfile::tempdir().unwrap();
        let pair = TlsCertificateAndPrivateKey::load_or_generate(dir.path(), "unit.test")
            .await
            .unwrap();
        assert!(!pair.certificate.certificates().is_empty());

        // Second call must load the same files rather than regenerate
        let first = std::fs::read(dir.path().join("tls.certificate.pem")).unwrap();
        let _ = TlsCertificateAndPrivateKey::load_or_generate(dir.path(), "unit.test")
            .await
            .unwrap();
        let second = std::fs::read(dir.path().join("tls.certificate.pem")).unwrap();
        assert_eq!(first, second);
    }
}
