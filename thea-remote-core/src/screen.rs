use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::*;
use uuid::Uuid;

use thea_remote_common::SessionId;
use thea_remote_protocol::{
    CaptureTarget, FrameFormat, RemoteMessage, ScreenFrame, ScreenResponse,
};

use crate::encoder::{BitrateController, EncoderSettings, KeyframePolicy, QualityProfile};
use crate::platform::{
    CaptureError, EncoderError, ScreenCapture, VideoEncoderFactory,
};
use crate::recordings::RecordingService;
use crate::server::writer::WriterQueue;

const ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(thiserror::Error, Debug)]
pub enum ScreenError {
    #[error("Stream already active")]
    StreamActive,
    #[error("Invalid parameters")]
    InvalidParameters,
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Encoder(#[from] EncoderError),
}

pub enum StreamControl {
    RequestKeyFrame,
    Bandwidth(u64),
    Stop,
}

struct RunningStream {
    id: Uuid,
    control: mpsc::UnboundedSender<StreamControl>,
    task: JoinHandle<()>,
}

/// Per-session screen service: one-shot captures plus at most one live
/// stream. Owned by the session actor; dropped (and its stream with it)
/// on disconnect.
pub struct ScreenService {
    session_id: SessionId,
    capture: Arc<dyn ScreenCapture>,
    encoders: Arc<dyn VideoEncoderFactory>,
    recordings: Arc<RecordingService>,
    stream: Option<RunningStream>,
}

impl ScreenService {
    pub fn new(
        session_id: SessionId,
        capture: Arc<dyn ScreenCapture>,
        encoders: Arc<dyn VideoEncoderFactory>,
        recordings: Arc<RecordingService>,
    ) -> Self {
        Self {
            session_id,
            capture,
            encoders,
            recordings,
            stream: None,
        }
    }

    pub fn stream_id(&self) -> Option<Uuid> {
        self.stream.as_ref().map(|s| s.id)
    }

    /// One-shot capture: grab, encode, return a single frame.
    pub async fn capture_once(
        &self,
        target: &CaptureTarget,
        quality: f32,
        scale: f32,
    ) -> Result<ScreenFrame, ScreenError> {
        validate_params(quality, scale)?;
        let profile = QualityProfile::from_quality(quality);
        let buffer = self.capture.capture(target, scale).await?;
        self.recordings.append_pixels(self.session_id, &buffer).await;

        let mut encoder = self.encoders.create();
        let settings = EncoderSettings::new(
            FrameFormat::Jpeg,
            profile,
            buffer.width,
            buffer.height,
            profile.max_fps(),
        );
        encoder.configure(&settings).await?;
        let encoded = encoder.encode(&buffer, true).await?;
        let cursor = self.capture.cursor().await;
        Ok(ScreenFrame {
            width: buffer.width,
            height: buffer.height,
            format: encoded.format,
            data: encoded.data,
            is_key_frame: encoded.is_key_frame,
            cursor,
            timestamp: Utc::now(),
        })
    }

    /// Starts the capture → encode → emit loop. Exactly one stream per
    /// session.
    pub fn start_stream(
        &mut self,
        fps: u32,
        quality: f32,
        scale: f32,
        writer: Arc<WriterQueue>,
    ) -> Result<Uuid, ScreenError> {
        if self.stream.is_some() {
            return Err(ScreenError::StreamActive);
        }
        validate_params(quality, scale)?;
        if fps == 0 {
            return Err(ScreenError::InvalidParameters);
        }

        let id = Uuid::new_v4();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_stream(
            StreamContext {
                session_id: self.session_id,
                capture: self.capture.clone(),
                encoders: self.encoders.clone(),
                recordings: self.recordings.clone(),
                writer,
                fps,
                quality,
                scale,
            },
            control_rx,
        ));
        self.stream = Some(RunningStream {
            id,
            control: control_tx,
            task,
        });
        info!(session = %self.session_id, stream = %id, fps, "Stream started");
        Ok(id)
    }

    /// Idempotent: stopping an idle stream is a no-op.
    pub fn stop_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.control.send(StreamControl::Stop);
            info!(session = %self.session_id, stream = %stream.id, "Stream stopped");
        }
    }

    pub fn request_key_frame(&self) -> bool {
        match &self.stream {
            Some(stream) => stream.control.send(StreamControl::RequestKeyFrame).is_ok(),
            None => false,
        }
    }

    pub fn adjust_bandwidth(&self, bandwidth_bps: u64) {
        if let Some(stream) = &self.stream {
            let _ = stream.control.send(StreamControl::Bandwidth(bandwidth_bps));
        }
    }

    /// Hard teardown for session termination; cancellation is not an
    /// error for the stream task.
    pub fn shutdown(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.task.abort();
        }
    }
}

fn validate_params(quality: f32, scale: f32) -> Result<(), ScreenError> {
    if !(0.0..=1.0).contains(&quality) || !(scale > 0.0 && scale <= 1.0) {
        return Err(ScreenError::InvalidParameters);
    }
    Ok(())
}

struct StreamContext {
    session_id: SessionId,
    capture: Arc<dyn ScreenCapture>,
    encoders: Arc<dyn VideoEncoderFactory>,
    recordings: Arc<RecordingService>,
    writer: Arc<WriterQueue>,
    fps: u32,
    quality: f32,
    scale: f32,
}

async fn run_stream(ctx: StreamContext, mut control: mpsc::UnboundedReceiver<StreamControl>) {
    let profile = QualityProfile::from_quality(ctx.quality);
    let fps = ctx.fps.min(profile.max_fps()).max(1);
    let interval = Duration::from_secs_f64(1.0 / fps as f64);

    let mut encoder = ctx.encoders.create();
    let mut settings: Option<EncoderSettings> = None;
    let mut keyframes = KeyframePolicy::new(profile);
    let mut bitrate = BitrateController::new(profile);

    loop {
        // Apply any pending control messages before the next frame
        loop {
            match control.try_recv() {
                Ok(StreamControl::Stop) => return,
                Ok(StreamControl::RequestKeyFrame) => {
                    // Flush completes pending frames so the next output
                    // starts clean
                    if let Err(error) = encoder.flush().await {
                        warn!(%error, "Encoder flush failed");
                    }
                    keyframes.request_refresh();
                }
                Ok(StreamControl::Bandwidth(bps)) => {
                    if let Some(new_bitrate) = bitrate.adjust(bps) {
                        if let Some(settings) = settings.as_mut() {
                            settings.average_bitrate = new_bitrate;
                            if let Err(error) = encoder.configure(settings).await {
                                warn!(%error, "Bitrate reconfiguration failed");
                            } else {
                                debug!(bitrate = new_bitrate, "Encoder bitrate adjusted");
                                keyframes.request_refresh();
                            }
                        }
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => return,
            }
        }

        let started = Instant::now();
        match ctx.capture.capture(&CaptureTarget::FullScreen, ctx.scale).await {
            Ok(buffer) => {
                let dims_changed = settings
                    .as_ref()
                    .map(|s| s.width != buffer.width || s.height != buffer.height)
                    != Some(false);
                if dims_changed {
                    let mut fresh = EncoderSettings::new(
                        FrameFormat::H264,
                        profile,
                        buffer.width,
                        buffer.height,
                        fps,
                    );
                    fresh.average_bitrate = bitrate.current();
                    match encoder.configure(&fresh).await {
                        Ok(()) => {
                            settings = Some(fresh);
                            keyframes.request_refresh();
                        }
                        Err(error) => {
                            warn!(%error, "Encoder configuration failed");
                            tokio::time::sleep(ERROR_BACKOFF).await;
                            continue;
                        }
                    }
                }

                ctx.recordings.append_pixels(ctx.session_id, &buffer).await;

                let force_key_frame = keyframes.wants_key_frame();
                match encoder.encode(&buffer, force_key_frame).await {
                    Ok(encoded) => {
                        keyframes.produced(encoded.is_key_frame);
                        let frame = ScreenFrame {
                            width: buffer.width,
                            height: buffer.height,
                            format: encoded.format,
                            data: encoded.data,
                            is_key_frame: encoded.is_key_frame,
                            cursor: ctx.capture.cursor().await,
                            timestamp: Utc::now(),
                        };
                        ctx.writer.send_frame(
                            RemoteMessage::ScreenResponse(ScreenResponse::Frame { frame }),
                            encoded.is_key_frame,
                        );
                    }
                    Err(error) => {
                        warn!(%error, "Frame encode failed");
                        tokio::time::sleep(ERROR_BACKOFF).await;
                        continue;
                    }
                }
            }
            Err(error) => {
                warn!(%error, "Screen capture failed");
                tokio::time::sleep(ERROR_BACKOFF).await;
                continue;
            }
        }

        let elapsed = started.elapsed();
        tokio::time::sleep(interval.saturating_sub(elapsed)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{NullRecorder, NullScreenCapture, PassthroughEncoderFactory};
    use crate::recordings::RecordingService;

    fn service(dir: &tempfile::TempDir) -> ScreenService {
        ScreenService::new(
            Uuid::new_v4(),
            Arc::new(NullScreenCapture::default()),
            Arc::new(PassthroughEncoderFactory),
            Arc::new(
                RecordingService::new(
                    true,
                    dir.path().join("recordings"),
                    Arc::new(NullRecorder),
                )
                .unwrap(),
            ),
        )
    }

    #[tokio::test]
    async fn test_capture_once_returns_key_frame() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir);
        let frame = service
            .capture_once(&CaptureTarget::FullScreen, 0.5, 1.0)
            .await
            .unwrap();
        assert!(frame.is_key_frame);
        assert_eq!(frame.width, 1280);
    }

    #[tokio::test]
    async fn test_scaled_capture_shrinks_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir);
        let frame = service
            .capture_once(&CaptureTarget::FullScreen, 0.5, 0.5)
            .await
            .unwrap();
        assert_eq!(frame.width, 640);
        assert_eq!(frame.height, 400);
    }

    #[tokio::test]
    async fn test_invalid_parameters_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir);
        assert!(matches!(
            service.capture_once(&CaptureTarget::FullScreen, 1.5, 1.0).await,
            Err(ScreenError::InvalidParameters)
        ));
        assert!(matches!(
            service.capture_once(&CaptureTarget::FullScreen, 0.5, 0.0).await,
            Err(ScreenError::InvalidParameters)
        ));
    }

    #[tokio::test]
    async fn test_stream_state_machine() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = service(&dir);
        let writer = WriterQueue::new();

        let first = service.start_stream(30, 0.5, 0.5, writer.clone()).unwrap();
        assert_eq!(service.stream_id(), Some(first));

        // second start while running
        assert!(matches!(
            service.start_stream(30, 0.5, 0.5, writer.clone()),
            Err(ScreenError::StreamActive)
        ));

        service.stop_stream();
        assert_eq!(service.stream_id(), None);
        // stop on idle is a no-op
        service.stop_stream();

        // restart succeeds and produces a different id
        let second = service.start_stream(30, 0.5, 0.5, writer).unwrap();
        assert_ne!(first, second);
        service.shutdown();
    }

    #[tokio::test]
    async fn test_stream_delivers_frames() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = service(&dir);
        let writer = WriterQueue::new();
        service.start_stream(60, 0.5, 0.25, writer.clone()).unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if writer.queued() >= 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("stream should be producing frames");
        service.shutdown();
    }

    #[tokio::test]
    async fn test_key_frame_request_only_while_streaming() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = service(&dir);
        assert!(!service.request_key_frame());
        let writer = WriterQueue::new();
        service.start_stream(30, 0.5, 0.5, writer).unwrap();
        assert!(service.request_key_frame());
        service.shutdown();
    }
}
