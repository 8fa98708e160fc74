use std::collections::HashSet;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};

use thea_remote_common::SessionId;
use thea_remote_protocol::Permission;

use crate::audit::AuditEntry;

/// State changes surfaced to the host over the event hub. The host feeds
/// these to whatever UI it has; the core never renders anything.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Started {
        port: u16,
    },
    Stopped,
    ClientConnected {
        session_id: SessionId,
        address: SocketAddr,
    },
    ClientAuthenticated {
        session_id: SessionId,
        client_name: String,
        permissions: HashSet<Permission>,
    },
    ClientDisconnected {
        session_id: SessionId,
        reason: String,
    },
    AuthenticationFailed {
        address: SocketAddr,
        reason: String,
    },
    PairingCodeIssued {
        code: String,
        expires_at: DateTime<Utc>,
    },
    SecurityEvent {
        entry: AuditEntry,
    },
    ChatReceived {
        session_id: SessionId,
        text: String,
    },
    TransferStats {
        session_id: SessionId,
        bytes_sent: u64,
        bytes_received: u64,
    },
}
