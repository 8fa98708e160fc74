use std::sync::Arc;

use tokio::sync::Mutex;

use thea_remote_common::{EventHub, EventSender, ServerConfig, TheaError};

use crate::audit::AuditLog;
use crate::auth::ConnectionManager;
use crate::events::ServerEvent;
use crate::files::FileService;
use crate::input::InputService;
use crate::platform::Platform;
use crate::recordings::RecordingService;
use crate::state::State;
use crate::system::SystemService;

/// Everything a session needs, wired once at server construction. The
/// configuration is immutable while the server runs; restart to apply
/// changes.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<ServerConfig>,
    pub platform: Platform,
    pub state: Arc<Mutex<State>>,
    pub connections: Arc<ConnectionManager>,
    pub audit: Arc<AuditLog>,
    pub recordings: Arc<RecordingService>,
    pub files: Arc<FileService>,
    pub system: Arc<SystemService>,
    pub input: Arc<InputService>,
    pub events: EventSender<ServerEvent>,
}

impl Services {
    /// Builds the full service graph. Returns the event hub alongside so
    /// the host can subscribe before the server starts.
    pub async fn new(
        config: ServerConfig,
        platform: Platform,
    ) -> Result<(Self, EventHub<ServerEvent>), TheaError> {
        let config = Arc::new(config);
        let (hub, events) = EventHub::setup();

        let connections =
            Arc::new(ConnectionManager::new(config.clone(), platform.secrets.clone()).await?);
        let audit = Arc::new(
            AuditLog::open(
                config.audit_log_path(),
                config.audit_retention_days,
                config.max_audit_entries_in_memory,
            )
            .await?,
        );
        let recordings = Arc::new(
            RecordingService::new(
                config.capabilities.recording,
                config.recordings_dir(),
                platform.recorder.clone(),
            )
            .map_err(|e| TheaError::Other(Box::new(e)))?,
        );
        let files = Arc::new(FileService::new(
            config.allowed_paths.clone(),
            config.blocked_paths.clone(),
            config.max_file_transfer_size,
        ));
        let system = Arc::new(SystemService::new(
            platform.system_control.clone(),
            platform.confirmations.clone(),
            config.require_confirmation,
            config.confirmation_timeout,
        ));
        let input = Arc::new(InputService::new(
            platform.input.clone(),
            platform.clipboard.clone(),
        ));

        Ok((
            Self {
                state: State::new(config.max_sessions),
                config,
                platform,
                connections,
                audit,
                recordings,
                files,
                system,
                input,
                events,
            },
            hub,
        ))
    }
}
