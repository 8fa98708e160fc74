use std::fmt;

use serde::{Deserialize, Serialize};

use crate::messages::{
    ClipboardRequest, FileRequest, RemoteMessage, SystemRequest,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// A capability a client may hold within a session. The set is granted
/// once at authentication and never widens afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Permission {
    ViewScreen,
    ControlScreen,
    ViewFiles,
    ReadFiles,
    WriteFiles,
    DeleteFiles,
    ExecuteCommands,
    SystemControl,
    NetworkAccess,
    InferenceRelay,
}

impl Permission {
    pub const ALL: [Permission; 10] = [
        Permission::ViewScreen,
        Permission::ControlScreen,
        Permission::ViewFiles,
        Permission::ReadFiles,
        Permission::WriteFiles,
        Permission::DeleteFiles,
        Permission::ExecuteCommands,
        Permission::SystemControl,
        Permission::NetworkAccess,
        Permission::InferenceRelay,
    ];

    pub fn risk_level(&self) -> RiskLevel {
        match self {
            Permission::ViewScreen => RiskLevel::Low,
            Permission::ViewFiles | Permission::ReadFiles | Permission::InferenceRelay => {
                RiskLevel::Medium
            }
            Permission::ControlScreen | Permission::WriteFiles | Permission::NetworkAccess => {
                RiskLevel::High
            }
            Permission::DeleteFiles
            | Permission::ExecuteCommands
            | Permission::SystemControl => RiskLevel::Critical,
        }
    }

    /// Wire name, also used in user-facing denial messages.
    pub fn name(&self) -> &'static str {
        match self {
            Permission::ViewScreen => "viewScreen",
            Permission::ControlScreen => "controlScreen",
            Permission::ViewFiles => "viewFiles",
            Permission::ReadFiles => "readFiles",
            Permission::WriteFiles => "writeFiles",
            Permission::DeleteFiles => "deleteFiles",
            Permission::ExecuteCommands => "executeCommands",
            Permission::SystemControl => "systemControl",
            Permission::NetworkAccess => "networkAccess",
            Permission::InferenceRelay => "inferenceRelay",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Static permission requirement per request variant. `None` means the
/// message needs no permission (heartbeats, chat, control messages) or is
/// not a request at all.
pub fn required_permission(message: &RemoteMessage) -> Option<Permission> {
    match message {
        RemoteMessage::ScreenRequest(_) => Some(Permission::ViewScreen),
        RemoteMessage::InputRequest(_) => Some(Permission::ControlScreen),
        RemoteMessage::FileRequest(request) => Some(match request {
            FileRequest::List { .. } | FileRequest::Info { .. } => Permission::ViewFiles,
            FileRequest::Read { .. } | FileRequest::Download { .. } => Permission::ReadFiles,
            FileRequest::Write { .. }
            | FileRequest::Upload { .. }
            | FileRequest::Move { .. }
            | FileRequest::Copy { .. } => Permission::WriteFiles,
            FileRequest::Delete { .. } => Permission::DeleteFiles,
        }),
        RemoteMessage::SystemRequest(request) => Some(match request {
            SystemRequest::ExecuteCommand { .. } => Permission::ExecuteCommands,
            SystemRequest::NetworkProxy(_) => Permission::NetworkAccess,
            SystemRequest::GetInfo
            | SystemRequest::GetProcesses
            | SystemRequest::SystemControl { .. }
            | SystemRequest::WakeOnLan { .. } => Permission::SystemControl,
        }),
        RemoteMessage::ClipboardRequest(request) => Some(match request {
            ClipboardRequest::Get => Permission::ViewScreen,
            ClipboardRequest::Set { .. } => Permission::ControlScreen,
        }),
        RemoteMessage::AnnotationRequest(_) => Some(Permission::ControlScreen),
        RemoteMessage::RecordingRequest(_) => Some(Permission::ViewScreen),
        RemoteMessage::AudioRequest(_) => Some(Permission::ViewScreen),
        RemoteMessage::InventoryRequest(_) => Some(Permission::ViewScreen),
        RemoteMessage::InferenceRequest(_) => Some(Permission::InferenceRelay),
        _ => None,
    }
}
