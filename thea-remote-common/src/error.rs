use uuid::Uuid;

use crate::tls::TlsSetupError;

#[derive(thiserror::Error, Debug)]
pub enum TheaError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("deserialization failed: {0}")]
    DeserializeJson(#[from] serde_json::Error),
    #[error("session not found: {0}")]
    SessionNotFound(Uuid),
    #[error("session limit reached")]
    SessionLimitReached,
    #[error("secret store: {0}")]
    SecretStore(String),
    #[error("invalid server key in the secret store")]
    InvalidServerKey,
    #[error("crypto failure: {0}")]
    Crypto(String),
    #[error("no session key has been negotiated")]
    NoSessionKey,
    #[error(transparent)]
    Tls(#[from] TlsSetupError),
    #[error("session end")]
    SessionEnd,
    #[error("inconsistent state error")]
    InconsistentState,
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl TheaError {
    pub fn other<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        Self::Other(Box::new(err))
    }
}
