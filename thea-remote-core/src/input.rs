use std::sync::Arc;

use crate::platform::{ClipboardAccess, InputPoster, PlatformError};
use thea_remote_protocol::InputRequest;

/// Forwards synthetic input and clipboard traffic to the platform.
pub struct InputService {
    poster: Arc<dyn InputPoster>,
    clipboard: Arc<dyn ClipboardAccess>,
}

impl InputService {
    pub fn new(poster: Arc<dyn InputPoster>, clipboard: Arc<dyn ClipboardAccess>) -> Self {
        Self { poster, clipboard }
    }

    pub async fn post(&self, event: &InputRequest) -> Result<(), PlatformError> {
        self.poster.post(event).await
    }

    pub async fn clipboard_get(&self) -> Result<Option<String>, PlatformError> {
        self.clipboard.get().await
    }

    pub async fn clipboard_set(&self, content: &str) -> Result<(), PlatformError> {
        self.clipboard.set(content).await
    }
}
