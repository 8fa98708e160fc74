use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use thea_remote_protocol::{
    ApplicationInfo, CaptureTarget, CursorInfo, DisplayInfo, FrameFormat, InputRequest,
    SystemControlAction, WindowInfo,
};

use super::{
    CaptureError, ClipboardAccess, ConfirmationHandler, DiscoveryAdvertiser, EncodedFrame,
    EncoderError, InputPoster, PixelBuffer, PlatformError, Recorder, RecorderSink,
    RecordingSinkError, ScreenCapture, SystemControl, VideoEncoder, VideoEncoderFactory,
};
use crate::encoder::EncoderSettings;

/// Produces a fixed-size black frame. Good enough to exercise the whole
/// streaming pipeline without a display server.
pub struct NullScreenCapture {
    width: u32,
    height: u32,
}

impl Default for NullScreenCapture {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 800,
        }
    }
}

#[async_trait]
impl ScreenCapture for NullScreenCapture {
    async fn capture(
        &self,
        _target: &CaptureTarget,
        scale: f32,
    ) -> Result<PixelBuffer, CaptureError> {
        let width = ((self.width as f32 * scale) as u32).max(1);
        let height = ((self.height as f32 * scale) as u32).max(1);
        Ok(PixelBuffer {
            width,
            height,
            data: Bytes::from(vec![0u8; (width * height * 4) as usize]),
        })
    }

    async fn cursor(&self) -> CursorInfo {
        CursorInfo {
            x: 0.0,
            y: 0.0,
            visible: false,
        }
    }

    async fn list_displays(&self) -> Result<Vec<DisplayInfo>, CaptureError> {
        Ok(vec![DisplayInfo {
            id: 1,
            name: "Virtual Display".into(),
            width: self.width,
            height: self.height,
            is_main: true,
        }])
    }

    async fn list_windows(&self) -> Result<Vec<WindowInfo>, CaptureError> {
        Ok(vec![])
    }

    async fn list_applications(&self) -> Result<Vec<ApplicationInfo>, CaptureError> {
        Ok(vec![])
    }
}

/// Encoder that passes pixel data through untouched, labelled as JPEG.
/// JPEG output is keyframe-only, which matches the fallback codec path.
pub struct PassthroughEncoder {
    configured: bool,
}

#[async_trait]
impl VideoEncoder for PassthroughEncoder {
    async fn configure(&mut self, _settings: &EncoderSettings) -> Result<(), EncoderError> {
        self.configured = true;
        Ok(())
    }

    async fn encode(
        &mut self,
        frame: &PixelBuffer,
        _force_key_frame: bool,
    ) -> Result<EncodedFrame, EncoderError> {
        if !self.configured {
            return Err(EncoderError::Configuration("encoder not configured".into()));
        }
        Ok(EncodedFrame {
            data: frame.data.clone(),
            format: FrameFormat::Jpeg,
            is_key_frame: true,
        })
    }

    async fn flush(&mut self) -> Result<(), EncoderError> {
        Ok(())
    }
}

pub struct PassthroughEncoderFactory;

impl VideoEncoderFactory for PassthroughEncoderFactory {
    fn create(&self) -> Box<dyn VideoEncoder> {
        Box::new(PassthroughEncoder { configured: false })
    }
}

pub struct NullInputPoster;

#[async_trait]
impl InputPoster for NullInputPoster {
    async fn post(&self, _event: &InputRequest) -> Result<(), PlatformError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryClipboard {
    content: Mutex<Option<String>>,
}

#[async_trait]
impl ClipboardAccess for MemoryClipboard {
    async fn get(&self) -> Result<Option<String>, PlatformError> {
        Ok(self.content.lock().await.clone())
    }

    async fn set(&self, content: &str) -> Result<(), PlatformError> {
        *self.content.lock().await = Some(content.to_owned());
        Ok(())
    }
}

pub struct NullSystemControl;

#[async_trait]
impl SystemControl for NullSystemControl {
    async fn perform(&self, _action: SystemControlAction) -> Result<(), PlatformError> {
        Err(PlatformError::Unsupported)
    }
}

pub struct DenyConfirmations;

#[async_trait]
impl ConfirmationHandler for DenyConfirmations {
    async fn confirm(&self, _prompt: &str) -> bool {
        false
    }
}

pub struct AutoApproveConfirmations;

#[async_trait]
impl ConfirmationHandler for AutoApproveConfirmations {
    async fn confirm(&self, _prompt: &str) -> bool {
        true
    }
}

/// Writes nothing but an empty file, so recording metadata can still be
/// exercised end to end.
pub struct NullRecorder;

#[async_trait]
impl Recorder for NullRecorder {
    async fn open(
        &self,
        path: &Path,
        _width: u32,
        _height: u32,
        _fps: u32,
    ) -> Result<Box<dyn RecorderSink>, RecordingSinkError> {
        tokio::fs::File::create(path).await?;
        Ok(Box::new(NullRecorderSink { bytes: 0 }))
    }
}

struct NullRecorderSink {
    bytes: u64,
}

#[async_trait]
impl RecorderSink for NullRecorderSink {
    async fn append(&mut self, frame: &PixelBuffer) -> Result<(), RecordingSinkError> {
        self.bytes += frame.data.len() as u64;
        Ok(())
    }

    async fn finish(&mut self) -> Result<u64, RecordingSinkError> {
        Ok(0)
    }
}

pub struct NullDiscovery;

#[async_trait]
impl DiscoveryAdvertiser for NullDiscovery {
    async fn start(&self, _name: &str, _port: u16) -> Result<(), PlatformError> {
        Ok(())
    }

    async fn stop(&self) {}
}
