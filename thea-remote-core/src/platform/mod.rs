//! Capability interfaces for everything the core cannot do portably.
//!
//! Hosts construct the server with real implementations (ScreenCaptureKit,
//! VideoToolbox, CGEvent posting, the keychain). The null implementations
//! here keep the core buildable and testable on every target.

mod null;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use thea_remote_protocol::{
    ApplicationInfo, CaptureTarget, CursorInfo, DisplayInfo, FrameFormat, InputRequest,
    SystemControlAction, WindowInfo,
};

pub use null::{
    AutoApproveConfirmations, DenyConfirmations, NullDiscovery, NullInputPoster, NullRecorder,
    NullScreenCapture, NullSystemControl, PassthroughEncoderFactory,
};

#[derive(thiserror::Error, Debug)]
pub enum CaptureError {
    #[error("screen capture permission has not been granted")]
    PermissionMissing,
    #[error("no such display or window")]
    TargetNotFound,
    #[error("capture failed: {0}")]
    Failed(String),
}

#[derive(thiserror::Error, Debug)]
pub enum EncoderError {
    #[error("encoder configuration rejected: {0}")]
    Configuration(String),
    #[error("encode failed: {0}")]
    Failed(String),
}

#[derive(thiserror::Error, Debug)]
pub enum PlatformError {
    #[error("not supported on this platform")]
    Unsupported,
    #[error("{0}")]
    Failed(String),
}

/// A raw captured frame. Pixel data is BGRA, row-major, no padding.
#[derive(Debug, Clone)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Bytes,
    pub format: FrameFormat,
    pub is_key_frame: bool,
}

#[async_trait]
pub trait ScreenCapture: Send + Sync {
    async fn capture(&self, target: &CaptureTarget, scale: f32) -> Result<PixelBuffer, CaptureError>;
    async fn cursor(&self) -> CursorInfo;
    async fn list_displays(&self) -> Result<Vec<DisplayInfo>, CaptureError>;
    async fn list_windows(&self) -> Result<Vec<WindowInfo>, CaptureError>;
    async fn list_applications(&self) -> Result<Vec<ApplicationInfo>, CaptureError>;
}

/// One encoder session. Owned exclusively by the stream task that created
/// it; reconfiguration tears the session down and builds a new one.
#[async_trait]
pub trait VideoEncoder: Send {
    async fn configure(&mut self, settings: &crate::encoder::EncoderSettings)
        -> Result<(), EncoderError>;
    async fn encode(
        &mut self,
        frame: &PixelBuffer,
        force_key_frame: bool,
    ) -> Result<EncodedFrame, EncoderError>;
    /// Completes all pending frames so the next output is a keyframe.
    async fn flush(&mut self) -> Result<(), EncoderError>;
}

pub trait VideoEncoderFactory: Send + Sync {
    fn create(&self) -> Box<dyn VideoEncoder>;
}

#[async_trait]
pub trait InputPoster: Send + Sync {
    async fn post(&self, event: &InputRequest) -> Result<(), PlatformError>;
}

#[async_trait]
pub trait ClipboardAccess: Send + Sync {
    async fn get(&self) -> Result<Option<String>, PlatformError>;
    async fn set(&self, content: &str) -> Result<(), PlatformError>;
}

#[async_trait]
pub trait SystemControl: Send + Sync {
    async fn perform(&self, action: SystemControlAction) -> Result<(), PlatformError>;
    async fn battery(&self) -> Option<(f32, bool)> {
        None
    }
}

/// Host confirmation prompt for dangerous operations. The returned bool
/// is the user's decision; the caller applies its own timeout.
#[async_trait]
pub trait ConfirmationHandler: Send + Sync {
    async fn confirm(&self, prompt: &str) -> bool;
}

#[derive(thiserror::Error, Debug)]
pub enum SecretStoreError {
    #[error("secret store unavailable: {0}")]
    Unavailable(String),
    #[error("secret store I/O: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, service: &str, account: &str) -> Result<Option<Bytes>, SecretStoreError>;
    async fn put(&self, service: &str, account: &str, value: &[u8])
        -> Result<(), SecretStoreError>;
    async fn delete(&self, service: &str, account: &str) -> Result<(), SecretStoreError>;
}

/// In-memory secret store for tests and ephemeral servers.
#[derive(Default)]
pub struct MemorySecretStore {
    entries: Mutex<HashMap<(String, String), Bytes>>,
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, service: &str, account: &str) -> Result<Option<Bytes>, SecretStoreError> {
        let entries = self.entries.lock().await;
        Ok(entries.get(&(service.to_owned(), account.to_owned())).cloned())
    }

    async fn put(
        &self,
        service: &str,
        account: &str,
        value: &[u8],
    ) -> Result<(), SecretStoreError> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            (service.to_owned(), account.to_owned()),
            Bytes::copy_from_slice(value),
        );
        Ok(())
    }

    async fn delete(&self, service: &str, account: &str) -> Result<(), SecretStoreError> {
        let mut entries = self.entries.lock().await;
        entries.remove(&(service.to_owned(), account.to_owned()));
        Ok(())
    }
}

/// JSON-file secret store for hosts without a keychain. Values are kept
/// base64-encoded in a 0600 file under the data directory.
pub struct FileSecretStore {
    path: std::path::PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl FileSecretStore {
    pub fn open(path: std::path::PathBuf) -> Result<Self, SecretStoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let entries = match std::fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data)
                .map_err(|e| SecretStoreError::Unavailable(e.to_string()))?,
            Err(_) => HashMap::new(),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn persist(&self, entries: &HashMap<String, String>) -> Result<(), SecretStoreError> {
        let data = serde_json::to_vec_pretty(entries)
            .map_err(|e| SecretStoreError::Unavailable(e.to_string()))?;
        thea_remote_common::helpers::fs::atomic_write(&self.path, &data)?;
        Ok(())
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn get(&self, service: &str, account: &str) -> Result<Option<Bytes>, SecretStoreError> {
        let entries = self.entries.lock().await;
        entries
            .get(&format!("{service}/{account}"))
            .map(|encoded| {
                data_encoding::BASE64
                    .decode(encoded.as_bytes())
                    .map(Bytes::from)
                    .map_err(|e| SecretStoreError::Unavailable(e.to_string()))
            })
            .transpose()
    }

    async fn put(
        &self,
        service: &str,
        account: &str,
        value: &[u8],
    ) -> Result<(), SecretStoreError> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            format!("{service}/{account}"),
            data_encoding::BASE64.encode(value),
        );
        self.persist(&entries)
    }

    async fn delete(&self, service: &str, account: &str) -> Result<(), SecretStoreError> {
        let mut entries = self.entries.lock().await;
        entries.remove(&format!("{service}/{account}"));
        self.persist(&entries)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RecordingSinkError {
    #[error("recorder I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("recorder failure: {0}")]
    Failed(String),
}

/// Creates MP4 sinks. The null implementation produces empty containers;
/// a real one wraps AVAssetWriter or similar.
#[async_trait]
pub trait Recorder: Send + Sync {
    async fn open(
        &self,
        path: &Path,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<Box<dyn RecorderSink>, RecordingSinkError>;
}

#[async_trait]
pub trait RecorderSink: Send {
    async fn append(&mut self, frame: &PixelBuffer) -> Result<(), RecordingSinkError>;
    /// Finalizes the container and returns its size in bytes.
    async fn finish(&mut self) -> Result<u64, RecordingSinkError>;
}

#[async_trait]
pub trait DiscoveryAdvertiser: Send + Sync {
    async fn start(&self, name: &str, port: u16) -> Result<(), PlatformError>;
    async fn stop(&self);
}

/// Bundle of all capabilities the server is constructed with.
#[derive(Clone)]
pub struct Platform {
    pub capture: Arc<dyn ScreenCapture>,
    pub encoders: Arc<dyn VideoEncoderFactory>,
    pub input: Arc<dyn InputPoster>,
    pub clipboard: Arc<dyn ClipboardAccess>,
    pub secrets: Arc<dyn SecretStore>,
    pub system_control: Arc<dyn SystemControl>,
    pub confirmations: Arc<dyn ConfirmationHandler>,
    pub recorder: Arc<dyn Recorder>,
    pub discovery: Arc<dyn DiscoveryAdvertiser>,
}

impl Platform {
    /// All-null platform: every capability present, none touching the host.
    pub fn null() -> Self {
        Self {
            capture: Arc::new(NullScreenCapture::default()),
            encoders: Arc::new(PassthroughEncoderFactory),
            input: Arc::new(NullInputPoster),
            clipboard: Arc::new(null::MemoryClipboard::default()),
            secrets: Arc::new(MemorySecretStore::default()),
            system_control: Arc::new(NullSystemControl),
            confirmations: Arc::new(DenyConfirmations),
            recorder: Arc::new(NullRecorder),
            discovery: Arc::new(NullDiscovery),
        }
    }
}
