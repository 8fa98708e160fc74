use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::*;
use uuid::Uuid;

use thea_remote_common::helpers::fs::{atomic_write, secure_directory};
use thea_remote_common::{SessionId, TheaError};

/// Everything the server considers securely relevant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuditAction {
    ServerStarted,
    ServerStopped,
    ClientConnected,
    ClientDisconnected,
    ConnectionRejected,
    SessionStarted,
    SessionEnded,
    SessionTimeout,
    AuthenticationSucceeded,
    AuthenticationFailed,
    RateLimitExceeded,
    WhitelistRejected,
    PairingCodeGenerated,
    PairingCodeUsed,
    TotpVerified,
    TotpFailed,
    PermissionGranted,
    PermissionDenied,
    ScreenCaptured,
    StreamStarted,
    StreamStopped,
    KeyFrameRequested,
    InputInjected,
    ClipboardRead,
    ClipboardWritten,
    FileListed,
    FileRead,
    FileWritten,
    FileDeleted,
    FileMoved,
    FileCopied,
    FileDownloaded,
    FileUploaded,
    FileAccessBlocked,
    CommandExecuted,
    CommandBlocked,
    SystemInfoQueried,
    ProcessesQueried,
    SystemControlPerformed,
    ConfirmationRequested,
    ConfirmationDenied,
    WakeOnLanSent,
    RecordingStarted,
    RecordingStopped,
    RecordingDeleted,
    AnnotationReceived,
    ChatReceived,
    AuditPurged,
    AuditExported,
    ServerError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuditResult {
    Success,
    Failure,
    Denied,
    Blocked,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Severity {
    Info,
    Elevated,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub client_id: Option<Uuid>,
    #[serde(default)]
    pub client_name: Option<String>,
    pub details: String,
    pub result: AuditResult,
    pub severity: Severity,
}

fn derive_severity(action: AuditAction, result: AuditResult) -> Severity {
    use AuditAction::*;
    match (action, result) {
        (ServerError, _) => Severity::Critical,
        (_, AuditResult::Blocked) => Severity::Critical,
        (AuthenticationFailed | RateLimitExceeded | WhitelistRejected | TotpFailed, _) => {
            Severity::Warning
        }
        (_, AuditResult::Denied | AuditResult::Failure | AuditResult::Timeout) => {
            Severity::Warning
        }
        (
            CommandExecuted | SystemControlPerformed | FileDeleted | InputInjected
            | WakeOnLanSent,
            _,
        ) => Severity::Elevated,
        _ => Severity::Info,
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub action: Option<AuditAction>,
    pub session_id: Option<SessionId>,
    pub client_id: Option<Uuid>,
    pub result: Option<AuditResult>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Free-text match over details, client name and action name.
    pub search: Option<String>,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditStatistics {
    pub total: usize,
    pub last_24h: usize,
    pub last_week: usize,
    pub failed_auth: usize,
    pub blocked: usize,
    pub unique_clients: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// Append-only security log. Newest entries first; every append rewrites
/// the JSON file atomically. Purging by retention is the only removal.
pub struct AuditLog {
    path: PathBuf,
    retention_days: u32,
    max_in_memory: usize,
    entries: Mutex<Vec<AuditEntry>>,
}

impl AuditLog {
    pub async fn open(
        path: PathBuf,
        retention_days: u32,
        max_in_memory: usize,
    ) -> Result<Self, TheaError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
            secure_directory(parent)?;
        }
        let mut entries: Vec<AuditEntry> = match std::fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|error| {
                warn!(%error, "Audit log is unreadable, starting fresh");
                vec![]
            }),
            Err(_) => vec![],
        };
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let log = Self {
            path,
            retention_days,
            max_in_memory,
            entries: Mutex::new(entries),
        };
        log.purge_expired().await?;
        Ok(log)
    }

    pub async fn log(
        &self,
        action: AuditAction,
        result: AuditResult,
        session_id: Option<SessionId>,
        client_name: Option<&str>,
        details: impl Into<String>,
    ) -> AuditEntry {
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            action,
            session_id,
            client_id: None,
            client_name: client_name.map(str::to_owned),
            details: details.into(),
            result,
            severity: derive_severity(action, result),
        };
        let mut entries = self.entries.lock().await;
        entries.insert(0, entry.clone());
        if let Err(error) = self.persist(&entries) {
            error!(%error, "Failed to persist audit log");
        }
        entry
    }

    fn persist(&self, entries: &[AuditEntry]) -> Result<(), TheaError> {
        atomic_write(&self.path, &serde_json::to_vec(entries)?)?;
        Ok(())
    }

    /// Drops entries older than the retention window.
    pub async fn purge_expired(&self) -> Result<usize, TheaError> {
        let cutoff = Utc::now() - Duration::days(self.retention_days as i64);
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|e| e.timestamp >= cutoff);
        let removed = before - entries.len();
        if removed > 0 {
            self.persist(&entries)?;
        }
        Ok(removed)
    }

    /// The most recent entries, capped for UI display.
    pub async fn recent(&self) -> Vec<AuditEntry> {
        let entries = self.entries.lock().await;
        entries.iter().take(self.max_in_memory).cloned().collect()
    }

    pub async fn query(&self, query: &AuditQuery) -> Vec<AuditEntry> {
        let entries = self.entries.lock().await;
        let needle = query.search.as_ref().map(|s| s.to_lowercase());
        entries
            .iter()
            .filter(|e| query.action.map_or(true, |a| e.action == a))
            .filter(|e| query.session_id.map_or(true, |s| e.session_id == Some(s)))
            .filter(|e| query.client_id.map_or(true, |c| e.client_id == Some(c)))
            .filter(|e| query.result.map_or(true, |r| e.result == r))
            .filter(|e| query.from.map_or(true, |t| e.timestamp >= t))
            .filter(|e| query.to.map_or(true, |t| e.timestamp <= t))
            .filter(|e| {
                needle.as_ref().map_or(true, |needle| {
                    e.details.to_lowercase().contains(needle)
                        || e.client_name
                            .as_deref()
                            .is_some_and(|n| n.to_lowercase().contains(needle))
                        || format!("{:?}", e.action).to_lowercase().contains(needle)
                })
            })
            .take(if query.limit == 0 {
                usize::MAX
            } else {
                query.limit
            })
            .cloned()
            .collect()
    }

    pub async fn export_csv(&self) -> String {
        fn escape(field: &str) -> String {
            if field.contains(',') || field.contains('"') || field.contains('\n') {
                format!("\"{}\"", field.replace('"', "\"\""))
            } else {
                field.to_owned()
            }
        }

        let entries = self.entries.lock().await;
        let mut out =
            String::from("id,timestamp,action,sessionId,clientName,details,result,severity\n");
        for e in entries.iter() {
            out.push_str(&format!(
                "{},{},{:?},{},{},{},{:?},{:?}\n",
                e.id,
                e.timestamp.to_rfc3339(),
                e.action,
                e.session_id.map(|s| s.to_string()).unwrap_or_default(),
                escape(e.client_name.as_deref().unwrap_or("")),
                escape(&e.details),
                e.result,
                e.severity,
            ));
        }
        out
    }

    pub async fn export_json(&self) -> Result<String, TheaError> {
        let entries = self.entries.lock().await;
        Ok(serde_json::to_string_pretty(&*entries)?)
    }

    pub async fn statistics(&self) -> AuditStatistics {
        let entries = self.entries.lock().await;
        let now = Utc::now();
        let day_ago = now - Duration::hours(24);
        let week_ago = now - Duration::days(7);
        let mut clients = std::collections::HashSet::new();
        for e in entries.iter() {
            if let Some(name) = &e.client_name {
                clients.insert(name.clone());
            }
        }
        AuditStatistics {
            total: entries.len(),
            last_24h: entries.iter().filter(|e| e.timestamp >= day_ago).count(),
            last_week: entries.iter().filter(|e| e.timestamp >= week_ago).count(),
            failed_auth: entries
                .iter()
                .filter(|e| e.action == AuditAction::AuthenticationFailed)
                .count(),
            blocked: entries
                .iter()
                .filter(|e| e.result == AuditResult::Blocked)
                .count(),
            unique_clients: clients.len(),
            oldest: entries.last().map(|e| e.timestamp),
            newest: entries.first().map(|e| e.timestamp),
        }
    }
}
