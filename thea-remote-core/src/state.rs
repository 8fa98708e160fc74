use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};
use tracing::*;
use uuid::Uuid;

use thea_remote_common::crypto::SessionKey;
use thea_remote_common::{SessionId, TheaError};
use thea_remote_protocol::{DeviceKind, Permission};

const SESSION_HISTORY_LIMIT: usize = 100;

/// Lets the session registry ask a running session to shut down without
/// owning its tasks.
pub trait SessionHandle: Send + Sync {
    fn close(&self, reason: &str);
}

#[derive(Debug, Clone)]
pub struct ClientDescriptor {
    pub name: String,
    pub device: DeviceKind,
    pub address: SocketAddr,
}

pub struct SessionState {
    pub id: SessionId,
    pub remote_address: SocketAddr,
    pub created_at: DateTime<Utc>,
    pub authenticated: bool,
    pub authenticated_at: Option<DateTime<Utc>>,
    pub permissions: HashSet<Permission>,
    pub session_key: Option<SessionKey>,
    pub client: Option<ClientDescriptor>,
    pub last_activity: DateTime<Utc>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub handle: Arc<dyn SessionHandle>,
}

impl SessionState {
    /// Marks the session authenticated. The permission set is fixed here
    /// for the session's whole lifetime.
    pub fn authenticate(&mut self, client: ClientDescriptor, permissions: HashSet<Permission>) {
        self.authenticated = true;
        self.authenticated_at = Some(Utc::now());
        self.permissions = permissions;
        self.client = Some(client);
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.authenticated && self.permissions.contains(&permission)
    }

    /// Application-level AES-GCM wrapping for opaque payloads, available
    /// once an ECDH session key has been negotiated.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<bytes::Bytes, TheaError> {
        let key = self.session_key.as_ref().ok_or(TheaError::NoSessionKey)?;
        thea_remote_common::crypto::encrypt(key, plaintext)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<bytes::Bytes, TheaError> {
        let key = self.session_key.as_ref().ok_or(TheaError::NoSessionKey)?;
        thea_remote_common::crypto::decrypt(key, ciphertext)
    }
}

#[derive(Debug, Clone)]
pub struct SessionHistoryRecord {
    pub id: SessionId,
    pub remote_address: SocketAddr,
    pub client_name: Option<String>,
    pub started: DateTime<Utc>,
    pub ended: Option<DateTime<Utc>>,
    pub end_reason: Option<String>,
}

/// Registry of live sessions plus a bounded ring of finished ones.
pub struct State {
    pub sessions: HashMap<SessionId, Arc<Mutex<SessionState>>>,
    handles: HashMap<SessionId, Arc<dyn SessionHandle>>,
    history: VecDeque<SessionHistoryRecord>,
    max_sessions: usize,
    change_sender: broadcast::Sender<()>,
}

impl State {
    pub fn new(max_sessions: usize) -> Arc<Mutex<Self>> {
        let sender = broadcast::channel(2).0;
        Arc::new(Mutex::new(Self {
            sessions: HashMap::new(),
            handles: HashMap::new(),
            history: VecDeque::new(),
            max_sessions,
            change_sender: sender,
        }))
    }

    pub fn has_capacity(&self) -> bool {
        self.sessions.len() < self.max_sessions
    }

    pub fn register_session(
        &mut self,
        remote_address: SocketAddr,
        handle: Arc<dyn SessionHandle>,
    ) -> Result<(SessionId, Arc<Mutex<SessionState>>), TheaError> {
        if !self.has_capacity() {
            return Err(TheaError::SessionLimitReached);
        }
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.handles.insert(id, handle.clone());
        let state = Arc::new(Mutex::new(SessionState {
            id,
            remote_address,
            created_at: now,
            authenticated: false,
            authenticated_at: None,
            permissions: HashSet::new(),
            session_key: None,
            client: None,
            last_activity: now,
            bytes_sent: 0,
            bytes_received: 0,
            handle,
        }));
        self.sessions.insert(id, state.clone());
        self.history.push_front(SessionHistoryRecord {
            id,
            remote_address,
            client_name: None,
            started: now,
            ended: None,
            end_reason: None,
        });
        self.history.truncate(SESSION_HISTORY_LIMIT);
        let _ = self.change_sender.send(());
        Ok((id, state))
    }

    pub async fn remove_session(&mut self, id: SessionId, reason: &str) {
        self.handles.remove(&id);
        let Some(state) = self.sessions.remove(&id) else {
            return;
        };
        let client_name = state.lock().await.client.as_ref().map(|c| c.name.clone());
        if let Some(record) = self.history.iter_mut().find(|r| r.id == id) {
            record.ended = Some(Utc::now());
            record.end_reason = Some(reason.to_owned());
            record.client_name = client_name;
        }
        let _ = self.change_sender.send(());
    }

    /// Asks every live session to shut down. Sessions unregister
    /// themselves as their tasks unwind.
    pub fn disconnect_all(&self, reason: &str) {
        for (id, handle) in &self.handles {
            debug!(%id, "Requesting session shutdown");
            handle.close(reason);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.change_sender.subscribe()
    }

    pub fn history(&self) -> impl Iterator<Item = &SessionHistoryRecord> {
        self.history.iter()
    }
}
