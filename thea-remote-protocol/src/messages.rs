use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use thea_remote_common::helpers::serde_base64;
use thea_remote_common::SessionId;

use crate::permissions::Permission;

/// Top-level wire envelope. Externally tagged: the JSON object's single
/// key names the variant (`{"screenRequest": {...}}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RemoteMessage {
    AuthChallenge(AuthChallenge),
    AuthResponse(AuthResponse),
    AuthSuccess(AuthSuccess),
    AuthFailure(AuthFailure),
    ScreenRequest(ScreenRequest),
    ScreenResponse(ScreenResponse),
    InputRequest(InputRequest),
    InputResponse(InputResponse),
    FileRequest(FileRequest),
    FileResponse(FileResponse),
    SystemRequest(SystemRequest),
    SystemResponse(SystemResponse),
    ClipboardRequest(ClipboardRequest),
    ClipboardResponse(ClipboardResponse),
    AnnotationRequest(AnnotationRequest),
    AnnotationResponse(AnnotationResponse),
    RecordingRequest(RecordingRequest),
    RecordingResponse(RecordingResponse),
    AudioRequest(AudioRequest),
    AudioResponse(AudioResponse),
    InventoryRequest(InventoryRequest),
    InventoryResponse(InventoryResponse),
    InferenceRequest(serde_json::Value),
    InferenceResponse(InferenceResponse),
    Chat(ChatMessage),
    Ping(Heartbeat),
    Pong(Heartbeat),
    Disconnect(Disconnect),
    Error(String),
}

const KNOWN_TAGS: &[&str] = &[
    "authChallenge",
    "authResponse",
    "authSuccess",
    "authFailure",
    "screenRequest",
    "screenResponse",
    "inputRequest",
    "inputResponse",
    "fileRequest",
    "fileResponse",
    "systemRequest",
    "systemResponse",
    "clipboardRequest",
    "clipboardResponse",
    "annotationRequest",
    "annotationResponse",
    "recordingRequest",
    "recordingResponse",
    "audioRequest",
    "audioResponse",
    "inventoryRequest",
    "inventoryResponse",
    "inferenceRequest",
    "inferenceResponse",
    "chat",
    "ping",
    "pong",
    "disconnect",
    "error",
];

/// Outcome of decoding a frame body. Unknown tags are distinguished from
/// malformed JSON so the dispatcher can reply with an application-level
/// error instead of dropping the session.
#[derive(Debug)]
pub enum DecodedMessage {
    Known(RemoteMessage),
    Unknown { tag: String },
    Malformed(serde_json::Error),
}

impl RemoteMessage {
    pub fn decode(body: &[u8]) -> DecodedMessage {
        match serde_json::from_slice::<RemoteMessage>(body) {
            Ok(message) => DecodedMessage::Known(message),
            Err(error) => {
                if let Ok(serde_json::Value::Object(map)) =
                    serde_json::from_slice::<serde_json::Value>(body)
                {
                    if map.len() == 1 {
                        #[allow(clippy::unwrap_used)]
                        let tag = map.keys().next().unwrap();
                        if !KNOWN_TAGS.contains(&tag.as_str()) {
                            return DecodedMessage::Unknown { tag: tag.clone() };
                        }
                    }
                }
                DecodedMessage::Malformed(error)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Authentication

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthChallenge {
    pub challenge_id: Uuid,
    #[serde(with = "serde_base64")]
    pub nonce: Bytes,
    pub timestamp: DateTime<Utc>,
    #[serde(default, with = "serde_base64::opt")]
    pub server_public_key: Option<Bytes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceKind {
    Mac,
    Iphone,
    Ipad,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub challenge_id: Uuid,
    pub client_name: String,
    pub device_type: DeviceKind,
    #[serde(default)]
    pub client_id: Option<Uuid>,
    pub requested_permissions: Vec<Permission>,
    #[serde(default)]
    pub pairing_code: Option<String>,
    #[serde(default, with = "serde_base64::opt")]
    pub shared_secret_proof: Option<Bytes>,
    #[serde(default, with = "serde_base64::opt")]
    pub certificate: Option<Bytes>,
    #[serde(default)]
    pub totp_code: Option<String>,
    #[serde(default)]
    pub recovery_code: Option<String>,
    #[serde(default, with = "serde_base64::opt")]
    pub client_public_key: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSuccess {
    pub session_id: SessionId,
    pub permissions: Vec<Permission>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthFailure {
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Screen

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CaptureTarget {
    FullScreen,
    #[serde(rename_all = "camelCase")]
    Display {
        display_id: u32,
    },
    #[serde(rename_all = "camelCase")]
    Window {
        window_id: u32,
    },
    #[serde(rename_all = "camelCase")]
    Region {
        x: f64,
        y: f64,
        width: f64,
        height: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScreenRequest {
    #[serde(rename_all = "camelCase")]
    Capture {
        target: CaptureTarget,
        quality: f32,
        scale: f32,
    },
    #[serde(rename_all = "camelCase")]
    StartStream {
        fps: u32,
        quality: f32,
        scale: f32,
    },
    StopStream,
    RequestKeyFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameFormat {
    H264,
    H265,
    Jpeg,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorInfo {
    pub x: f64,
    pub y: f64,
    pub visible: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenFrame {
    pub width: u32,
    pub height: u32,
    pub format: FrameFormat,
    #[serde(with = "serde_base64")]
    pub data: Bytes,
    pub is_key_frame: bool,
    pub cursor: CursorInfo,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScreenResponse {
    Captured {
        frame: ScreenFrame,
    },
    #[serde(rename_all = "camelCase")]
    StreamStarted {
        stream_id: Uuid,
    },
    StreamStopped,
    KeyFrameScheduled,
    Frame {
        frame: ScreenFrame,
    },
    Error(String),
}

// ---------------------------------------------------------------------------
// Input

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyModifier {
    Shift,
    Control,
    Option,
    Command,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InputRequest {
    MouseMove {
        x: f64,
        y: f64,
    },
    MouseDown {
        button: MouseButton,
    },
    MouseUp {
        button: MouseButton,
    },
    #[serde(rename_all = "camelCase")]
    Click {
        x: f64,
        y: f64,
        button: MouseButton,
        click_count: u32,
    },
    #[serde(rename_all = "camelCase")]
    Scroll {
        delta_x: f64,
        delta_y: f64,
    },
    #[serde(rename_all = "camelCase")]
    KeyDown {
        key_code: u16,
        modifiers: Vec<KeyModifier>,
    },
    #[serde(rename_all = "camelCase")]
    KeyUp {
        key_code: u16,
        modifiers: Vec<KeyModifier>,
    },
    TypeText {
        text: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InputResponse {
    Done,
    Error(String),
}

// ---------------------------------------------------------------------------
// Files

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileRequest {
    #[serde(rename_all = "camelCase")]
    List {
        path: String,
        recursive: bool,
        show_hidden: bool,
    },
    Info {
        path: String,
    },
    #[serde(rename_all = "camelCase")]
    Read {
        path: String,
        offset: u64,
        length: u64,
    },
    #[serde(rename_all = "camelCase")]
    Write {
        path: String,
        #[serde(with = "serde_base64")]
        data: Bytes,
        offset: u64,
        append: bool,
    },
    #[serde(rename_all = "camelCase")]
    Delete {
        path: String,
        recursive: bool,
    },
    Move {
        from: String,
        to: String,
    },
    Copy {
        from: String,
        to: String,
    },
    Download {
        path: String,
    },
    #[serde(rename_all = "camelCase")]
    Upload {
        path: String,
        #[serde(with = "serde_base64")]
        data: Bytes,
        overwrite: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub path: PathBuf,
    pub is_directory: bool,
    pub size: u64,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    /// `rwxr-xr-x`-style permission triple.
    pub permissions: String,
    pub is_hidden: bool,
    #[serde(default)]
    pub symlink_target: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileResponse {
    Entries(Vec<FileEntry>),
    Entry(FileEntry),
    #[serde(rename_all = "camelCase")]
    Data {
        #[serde(with = "serde_base64")]
        data: Bytes,
        offset: u64,
        is_complete: bool,
    },
    Success(String),
    Error(String),
}

// ---------------------------------------------------------------------------
// System

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SystemControlAction {
    Reboot,
    Shutdown,
    Logout,
    Sleep,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SystemRequest {
    GetInfo,
    GetProcesses,
    #[serde(rename_all = "camelCase")]
    ExecuteCommand {
        command: String,
        #[serde(default)]
        working_directory: Option<String>,
        #[serde(default)]
        timeout_seconds: Option<u64>,
    },
    SystemControl {
        action: SystemControlAction,
    },
    #[serde(rename_all = "camelCase")]
    WakeOnLan {
        mac_address: String,
    },
    /// Permanently disabled; kept decodable for backwards-compatible
    /// error replies.
    NetworkProxy(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    pub hostname: String,
    pub os_version: String,
    pub architecture: String,
    pub cpu_count: usize,
    pub total_memory: u64,
    pub available_memory: u64,
    pub total_disk: u64,
    pub available_disk: u64,
    pub uptime_seconds: u64,
    #[serde(default)]
    pub battery_level: Option<f32>,
    #[serde(default)]
    pub battery_charging: Option<bool>,
    pub current_user: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parent_pid: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SystemResponse {
    Info(SystemInfo),
    Processes(Vec<ProcessInfo>),
    #[serde(rename_all = "camelCase")]
    CommandResult {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    Success(String),
    Error(String),
}

// ---------------------------------------------------------------------------
// Clipboard, annotations, chat

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClipboardRequest {
    Get,
    Set { content: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClipboardResponse {
    Content(Option<String>),
    Done,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationStroke {
    pub points: Vec<Point>,
    pub color: String,
    pub width: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AnnotationRequest {
    Draw(AnnotationStroke),
    Clear,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AnnotationResponse {
    Acknowledged,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(default)]
    pub sender: Option<String>,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Recording

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordingRequest {
    Start,
    Stop,
    List,
    Delete { id: Uuid },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingMeta {
    pub id: Uuid,
    pub session_id: SessionId,
    pub started: DateTime<Utc>,
    pub duration_seconds: f64,
    pub file_size: u64,
    pub resolution: String,
    pub codec: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordingResponse {
    Started { id: Uuid },
    Stopped(RecordingMeta),
    Listing(Vec<RecordingMeta>),
    Success(String),
    Error(String),
}

// ---------------------------------------------------------------------------
// Audio

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AudioRequest {
    Start,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AudioResponse {
    Started,
    Stopped,
    Frame {
        #[serde(with = "serde_base64")]
        data: Bytes,
        timestamp: DateTime<Utc>,
    },
    Error(String),
}

// ---------------------------------------------------------------------------
// Inventory

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InventoryRequest {
    Displays,
    Windows,
    Applications,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayInfo {
    pub id: u32,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub is_main: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowInfo {
    pub id: u32,
    pub title: String,
    pub application: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationInfo {
    pub name: String,
    #[serde(default)]
    pub bundle_id: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InventoryResponse {
    Displays(Vec<DisplayInfo>),
    Windows(Vec<WindowInfo>),
    Applications(Vec<ApplicationInfo>),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InferenceResponse {
    Result(serde_json::Value),
    Error(String),
}

// ---------------------------------------------------------------------------
// Control

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Disconnect {
    #[serde(default)]
    pub reason: Option<String>,
}
