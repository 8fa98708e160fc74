mod writer;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::*;
use uuid::Uuid;

use thea_remote_common::helpers::fs::{atomic_write, secure_directory};
use thea_remote_common::SessionId;
use thea_remote_protocol::RecordingMeta;

use crate::platform::{PixelBuffer, Recorder, RecordingSinkError};

pub use writer::RecordingWriter;

#[derive(thiserror::Error, Debug)]
pub enum RecordingError {
    #[error("Recording already active")]
    AlreadyActive,
    #[error("No active recording")]
    NotActive,
    #[error("Recording not found")]
    NotFound,
    #[error("Recording is disabled")]
    Disabled,
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sink(#[from] RecordingSinkError),
    #[error("index: {0}")]
    Index(#[from] serde_json::Error),
}

struct ActiveRecording {
    id: Uuid,
    started: DateTime<Utc>,
    path: PathBuf,
    resolution: String,
    codec: String,
    writer: RecordingWriter,
    /// Encoded frames are counted but never muxed; re-compressing an
    /// already-encoded stream is out of the question.
    encoded_frames_ignored: AtomicU64,
}

/// Per-session MP4 recordings plus the `recordings.json` metadata index.
pub struct RecordingService {
    enabled: bool,
    dir: PathBuf,
    index_path: PathBuf,
    recorder: std::sync::Arc<dyn Recorder>,
    active: Mutex<HashMap<SessionId, ActiveRecording>>,
    index: Mutex<Vec<RecordingMeta>>,
}

impl RecordingService {
    pub fn new(
        enabled: bool,
        dir: PathBuf,
        recorder: std::sync::Arc<dyn Recorder>,
    ) -> Result<Self, RecordingError> {
        let index_path = dir.join("recordings.json");
        let mut index = vec![];
        if enabled {
            std::fs::create_dir_all(&dir)?;
            secure_directory(&dir)?;
            if let Ok(data) = std::fs::read(&index_path) {
                index = serde_json::from_slice(&data).unwrap_or_else(|error| {
                    warn!(%error, "Recording index is unreadable, starting fresh");
                    vec![]
                });
            }
        }
        Ok(Self {
            enabled,
            dir,
            index_path,
            recorder,
            active: Mutex::new(HashMap::new()),
            index: Mutex::new(index),
        })
    }

    pub async fn start(
        &self,
        session_id: SessionId,
        width: u32,
        height: u32,
        fps: u32,
        codec: &str,
    ) -> Result<Uuid, RecordingError> {
        if !self.enabled {
            return Err(RecordingError::Disabled);
        }
        let mut active = self.active.lock().await;
        if active.contains_key(&session_id) {
            return Err(RecordingError::AlreadyActive);
        }
        let id = Uuid::new_v4();
        let path = self.dir.join(format!("{id}.mp4"));
        let sink = self.recorder.open(&path, width, height, fps).await?;
        info!(%session_id, %id, ?path, "Recording session");
        active.insert(
            session_id,
            ActiveRecording {
                id,
                started: Utc::now(),
                path,
                resolution: format!("{width}x{height}"),
                codec: codec.to_owned(),
                writer: RecordingWriter::new(sink),
                encoded_frames_ignored: AtomicU64::new(0),
            },
        );
        Ok(id)
    }

    /// Muxes one raw frame into the active recording, if any.
    pub async fn append_pixels(&self, session_id: SessionId, buffer: &PixelBuffer) {
        let active = self.active.lock().await;
        if let Some(recording) = active.get(&session_id) {
            if let Err(error) = recording.writer.write(buffer.clone()).await {
                warn!(%error, %session_id, "Dropping recording frame");
            }
        }
    }

    /// Encoded-frame input is deliberately not written to the container;
    /// only the counter moves.
    pub async fn append_encoded(&self, session_id: SessionId) {
        let active = self.active.lock().await;
        if let Some(recording) = active.get(&session_id) {
            recording.encoded_frames_ignored.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub async fn is_recording(&self, session_id: SessionId) -> bool {
        self.active.lock().await.contains_key(&session_id)
    }

    pub async fn stop(&self, session_id: SessionId) -> Result<RecordingMeta, RecordingError> {
        let recording = {
            let mut active = self.active.lock().await;
            active.remove(&session_id).ok_or(RecordingError::NotActive)?
        };
        let duration = (Utc::now() - recording.started)
            .to_std()
            .unwrap_or_default()
            .as_secs_f64();
        let reported = recording.writer.finish().await?;
        let file_size = match tokio::fs::metadata(&recording.path).await {
            Ok(metadata) => metadata.len().max(reported),
            Err(_) => reported,
        };
        let meta = RecordingMeta {
            id: recording.id,
            session_id,
            started: recording.started,
            duration_seconds: duration,
            file_size,
            resolution: recording.resolution,
            codec: recording.codec,
            path: recording.path,
        };
        let mut index = self.index.lock().await;
        index.push(meta.clone());
        self.persist_index(&index)?;
        Ok(meta)
    }

    /// Stops the session's recording if one is running. Used on session
    /// teardown where a missing recording is not an error.
    pub async fn stop_if_active(&self, session_id: SessionId) {
        match self.stop(session_id).await {
            Ok(meta) => debug!(%session_id, id=%meta.id, "Recording finalized on disconnect"),
            Err(RecordingError::NotActive) => {}
            Err(error) => warn!(%error, %session_id, "Failed to finalize recording"),
        }
    }

    pub async fn list(&self) -> Vec<RecordingMeta> {
        self.index.lock().await.clone()
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), RecordingError> {
        let mut index = self.index.lock().await;
        let Some(position) = index.iter().position(|m| m.id == id) else {
            return Err(RecordingError::NotFound);
        };
        let meta = index.remove(position);
        self.persist_index(&index)?;
        drop(index);
        if let Err(error) = tokio::fs::remove_file(&meta.path).await {
            warn!(%error, path = ?meta.path, "Recording file could not be removed");
        }
        Ok(())
    }

    fn persist_index(&self, index: &[RecordingMeta]) -> Result<(), RecordingError> {
        atomic_write(&self.index_path, &serde_json::to_vec_pretty(index)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::NullRecorder;
    use bytes::Bytes;
    use std::sync::Arc;

    fn service(dir: &tempfile::TempDir) -> RecordingService {
        RecordingService::new(true, dir.path().join("recordings"), Arc::new(NullRecorder))
            .unwrap()
    }

    fn buffer() -> PixelBuffer {
        PixelBuffer {
            width: 2,
            height: 2,
            data: Bytes::from_static(&[0; 16]),
        }
    }

    #[tokio::test]
    async fn test_one_recording_per_session() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir);
        let session = Uuid::new_v4();
        service.start(session, 1280, 800, 30, "h264").await.unwrap();
        assert!(matches!(
            service.start(session, 1280, 800, 30, "h264").await,
            Err(RecordingError::AlreadyActive)
        ));
    }

    #[tokio::test]
    async fn test_stop_writes_index_entry() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir);
        let session = Uuid::new_v4();
        let id = service.start(session, 1280, 800, 30, "h264").await.unwrap();
        service.append_pixels(session, &buffer()).await;
        let meta = service.stop(session).await.unwrap();
        assert_eq!(meta.id, id);
        assert_eq!(meta.resolution, "1280x800");

        let listed = service.list().await;
        assert_eq!(listed.len(), 1);

        // index survives a restart
        let reopened = RecordingService::new(
            true,
            dir.path().join("recordings"),
            Arc::new(NullRecorder),
        )
        .unwrap();
        assert_eq!(reopened.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_encoded_frames_are_counted_not_muxed() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir);
        let session = Uuid::new_v4();
        service.start(session, 640, 480, 30, "h264").await.unwrap();
        service.append_encoded(session).await;
        service.append_encoded(session).await;
        {
            let active = service.active.lock().await;
            let recording = active.get(&session).unwrap();
            assert_eq!(recording.encoded_frames_ignored.load(Ordering::Relaxed), 2);
            assert_eq!(recording.writer.frames_written(), 0);
        }
        service.stop(session).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_removes_index_entry() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir);
        let session = Uuid::new_v4();
        service.start(session, 640, 480, 30, "h264").await.unwrap();
        let meta = service.stop(session).await.unwrap();
        service.delete(meta.id).await.unwrap();
        assert!(service.list().await.is_empty());
        assert!(matches!(
            service.delete(meta.id).await,
            Err(RecordingError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_disabled_service_refuses() {
        let dir = tempfile::tempdir().unwrap();
        let service = RecordingService::new(
            false,
            dir.path().join("recordings"),
            Arc::new(NullRecorder),
        )
        .unwrap();
        assert!(matches!(
            service.start(Uuid::new_v4(), 1, 1, 30, "h264").await,
            Err(RecordingError::Disabled)
        ));
    }
}
