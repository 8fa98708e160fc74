use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::*;

use crate::platform::{PixelBuffer, RecorderSink, RecordingSinkError};

/// Feeds pixel buffers to a recorder sink from a dedicated task, so the
/// capture loop never blocks on container I/O.
pub struct RecordingWriter {
    sender: mpsc::Sender<PixelBuffer>,
    finish: Option<oneshot::Receiver<Result<u64, RecordingSinkError>>>,
    frames_written: Arc<AtomicU64>,
}

impl RecordingWriter {
    pub fn new(mut sink: Box<dyn RecorderSink>) -> Self {
        let (sender, mut receiver) = mpsc::channel::<PixelBuffer>(1024);
        let (finish_tx, finish_rx) = oneshot::channel();
        let frames_written = Arc::new(AtomicU64::new(0));
        let frames = frames_written.clone();

        tokio::spawn(async move {
            let mut failed = false;
            while let Some(buffer) = receiver.recv().await {
                if failed {
                    continue;
                }
                if let Err(error) = sink.append(&buffer).await {
                    error!(%error, "Failed to write recording frame");
                    failed = true;
                    continue;
                }
                frames.fetch_add(1, Ordering::Relaxed);
            }
            let _ = finish_tx.send(sink.finish().await);
        });

        Self {
            sender,
            finish: Some(finish_rx),
            frames_written,
        }
    }

    pub async fn write(&self, buffer: PixelBuffer) -> Result<(), RecordingSinkError> {
        self.sender
            .send(buffer)
            .await
            .map_err(|_| RecordingSinkError::Failed("recording writer is closed".into()))
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    /// Closes the channel and waits for the container to finalize.
    /// Returns the file size reported by the sink.
    pub async fn finish(mut self) -> Result<u64, RecordingSinkError> {
        let finish = self
            .finish
            .take()
            .ok_or_else(|| RecordingSinkError::Failed("already finished".into()))?;
        drop(self.sender);
        finish
            .await
            .map_err(|_| RecordingSinkError::Failed("recording task died".into()))?
    }
}
