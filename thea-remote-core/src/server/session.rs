use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tracing::*;

use thea_remote_common::SessionId;
use thea_remote_protocol::{
    required_permission, AudioRequest, AudioResponse, AuthFailure, AuthSuccess,
    ClipboardRequest, ClipboardResponse, DecodedMessage, FileRequest, FileResponse, Heartbeat,
    InferenceResponse, InventoryRequest, InventoryResponse, MessageStream, RecordingRequest,
    RecordingResponse, RemoteMessage, ScreenRequest, ScreenResponse, SystemRequest,
    SystemResponse, WireError,
};

use crate::audit::{AuditAction, AuditResult};
use crate::events::ServerEvent;
use crate::screen::{ScreenError, ScreenService};
use crate::server::writer::{run_writer, WriterQueue};
use crate::services::Services;
use crate::state::{ClientDescriptor, SessionHandle, SessionState};
use crate::system::SystemServiceError;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const LISTING_TIMEOUT: Duration = Duration::from_secs(60);
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(300);
const COMMAND_GRACE: Duration = Duration::from_secs(10);

struct SessionTerminator {
    sender: mpsc::UnboundedSender<String>,
}

impl SessionHandle for SessionTerminator {
    fn close(&self, reason: &str) {
        let _ = self.sender.send(reason.to_owned());
    }
}

/// Runs one connection from TLS handshake completion to teardown.
pub(crate) async fn run_session<S>(services: Services, stream: S, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let queue = WriterQueue::new();
    let bytes_sent = Arc::new(AtomicU64::new(0));
    let bytes_received = Arc::new(AtomicU64::new(0));
    let writer_task = tokio::spawn(run_writer(
        queue.clone(),
        MessageStream::new(write_half),
        bytes_sent.clone(),
    ));

    let (term_tx, term_rx) = mpsc::unbounded_channel();
    let registered = {
        let mut state = services.state.lock().await;
        state.register_session(peer, Arc::new(SessionTerminator { sender: term_tx }))
    };
    let (session_id, session) = match registered {
        Ok(pair) => pair,
        Err(error) => {
            // The accept path checks capacity, but sessions race
            warn!(%peer, %error, "Refusing connection");
            queue.send_rpc(RemoteMessage::Error("Server is at capacity".into()));
            queue.close();
            let _ = writer_task.await;
            return;
        }
    };

    info!(%session_id, %peer, "Connection accepted");
    services
        .audit
        .log(
            AuditAction::ClientConnected,
            AuditResult::Success,
            Some(session_id),
            None,
            peer.to_string(),
        )
        .await;
    let _ = services
        .events
        .send(ServerEvent::ClientConnected {
            session_id,
            address: peer,
        })
        .await;

    let mut actor = SessionActor {
        services: services.clone(),
        session_id,
        session: session.clone(),
        peer,
        queue: queue.clone(),
        screen: ScreenService::new(
            session_id,
            services.platform.capture.clone(),
            services.platform.encoders.clone(),
            services.recordings.clone(),
        ),
        reader: MessageStream::new(read_half),
        term_rx,
        bytes_sent,
        bytes_received,
    };

    let reason = actor.run().await;

    // Teardown: cancel stream, finalize recordings, drain the writer
    actor.screen.shutdown();
    services.recordings.stop_if_active(session_id).await;
    queue.close();
    let _ = writer_task.await;

    let client_name = session.lock().await.client.as_ref().map(|c| c.name.clone());
    services.state.lock().await.remove_session(session_id, &reason).await;
    services
        .audit
        .log(
            AuditAction::SessionEnded,
            AuditResult::Success,
            Some(session_id),
            client_name.as_deref(),
            reason.clone(),
        )
        .await;
    let _ = services
        .events
        .send(ServerEvent::ClientDisconnected { session_id, reason })
        .await;
}

struct SessionActor<R> {
    services: Services,
    session_id: SessionId,
    session: Arc<Mutex<SessionState>>,
    peer: SocketAddr,
    queue: Arc<WriterQueue>,
    screen: ScreenService,
    reader: MessageStream<R>,
    term_rx: mpsc::UnboundedReceiver<String>,
    bytes_sent: Arc<AtomicU64>,
    bytes_received: Arc<AtomicU64>,
}

impl<R> SessionActor<R>
where
    R: AsyncRead + Unpin,
{
    /// Returns the termination reason.
    async fn run(&mut self) -> String {
        match self.authenticate().await {
            Ok(()) => {}
            Err(reason) => return reason,
        }

        let heartbeat = tokio::spawn(heartbeat_loop(
            self.services.clone(),
            self.session_id,
            self.queue.clone(),
            self.bytes_sent.clone(),
            self.bytes_received.clone(),
        ));
        let watchdog = tokio::spawn(idle_watchdog(
            self.session.clone(),
            self.services.config.session_timeout,
        ));

        let reason = self.dispatch_loop().await;

        heartbeat.abort();
        watchdog.abort();
        reason
    }

    async fn authenticate(&mut self) -> Result<(), String> {
        let challenge = self.services.connections.generate_challenge();
        self.queue
            .send_rpc(RemoteMessage::AuthChallenge(challenge.clone()));

        // Exactly one message is awaited here; anything that is not the
        // auth response rejects the connection
        let deadline =
            tokio::time::Instant::now() + self.services.config.auth_timeout;
        let body = tokio::select! {
            reason = recv_termination(&mut self.term_rx) => return Err(reason),
            result = tokio::time::timeout_at(deadline, self.reader.recv()) => match result {
                Err(_) => {
                    self.queue.send_rpc(RemoteMessage::AuthFailure(AuthFailure {
                        reason: "Authentication timed out".into(),
                    }));
                    return Err(self.reject("authentication timeout").await);
                }
                Ok(Ok(Some(body))) => body,
                Ok(Ok(None)) => return Err("client disconnected".into()),
                Ok(Err(error)) => return Err(self.transport_error(error).await),
            },
        };
        self.bytes_received
            .fetch_add(4 + body.len() as u64, Ordering::Relaxed);

        let response = match RemoteMessage::decode(&body) {
            DecodedMessage::Known(RemoteMessage::AuthResponse(response)) => response,
            DecodedMessage::Known(RemoteMessage::Disconnect(_)) => {
                return Err("client disconnected".into());
            }
            _ => {
                // Nothing but the auth response is admissible before
                // authSuccess; even a ping rejects here
                self.queue.send_rpc(RemoteMessage::AuthFailure(AuthFailure {
                    reason: "Authentication required".into(),
                }));
                return Err(self.reject("message before authentication").await);
            }
        };

        if let Err(error) = self
            .services
            .connections
            .verify_authentication(&challenge, &response)
            .await
        {
            self.queue.send_rpc(RemoteMessage::AuthFailure(AuthFailure {
                reason: error.to_string(),
            }));
            let _ = self
                .services
                .events
                .send(ServerEvent::AuthenticationFailed {
                    address: self.peer,
                    reason: error.to_string(),
                })
                .await;
            return Err(self.reject(&error.to_string()).await);
        }

        // Session key is optional; a bad client key still fails the auth
        let session_key = match &response.client_public_key {
            Some(client_public) => {
                match self.services.connections.derive_session_key(client_public) {
                    Ok(key) => Some(key),
                    Err(_) => {
                        self.queue.send_rpc(RemoteMessage::AuthFailure(AuthFailure {
                            reason: "Invalid client public key".into(),
                        }));
                        return Err(self.reject("invalid client public key").await);
                    }
                }
            }
            None => None,
        };

        if matches!(
            self.services.config.auth_method,
            thea_remote_common::AuthMethod::PairingCode
        ) {
            self.services
                .audit
                .log(
                    AuditAction::PairingCodeUsed,
                    AuditResult::Success,
                    Some(self.session_id),
                    Some(&response.client_name),
                    "",
                )
                .await;
        }

        let allowed = self.services.connections.allowed_permissions();
        let granted: HashSet<_> = response
            .requested_permissions
            .iter()
            .copied()
            .filter(|p| allowed.contains(p))
            .collect();

        let descriptor = ClientDescriptor {
            name: response.client_name.clone(),
            device: response.device_type,
            address: self.peer,
        };
        {
            let mut session = self.session.lock().await;
            session.session_key = session_key;
            session.authenticate(descriptor, granted.clone());
        }

        self.services
            .audit
            .log(
                AuditAction::AuthenticationSucceeded,
                AuditResult::Success,
                Some(self.session_id),
                Some(&response.client_name),
                format!("{:?}", self.services.config.auth_method),
            )
            .await;
        self.services
            .audit
            .log(
                AuditAction::SessionStarted,
                AuditResult::Success,
                Some(self.session_id),
                Some(&response.client_name),
                format!(
                    "permissions: {}",
                    granted
                        .iter()
                        .map(|p| p.name())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            )
            .await;
        let _ = self
            .services
            .events
            .send(ServerEvent::ClientAuthenticated {
                session_id: self.session_id,
                client_name: response.client_name.clone(),
                permissions: granted.clone(),
            })
            .await;

        self.queue.send_rpc(RemoteMessage::AuthSuccess(AuthSuccess {
            session_id: self.session_id,
            permissions: granted.into_iter().collect(),
        }));
        Ok(())
    }

    async fn reject(&self, reason: &str) -> String {
        self.services
            .audit
            .log(
                AuditAction::AuthenticationFailed,
                AuditResult::Failure,
                Some(self.session_id),
                None,
                reason.to_owned(),
            )
            .await;
        reason.to_owned()
    }

    async fn transport_error(&self, error: WireError) -> String {
        let reason = match &error {
            WireError::FrameTooLarge(_) => "invalid frame".to_owned(),
            other => other.to_string(),
        };
        self.services
            .audit
            .log(
                AuditAction::ServerError,
                AuditResult::Failure,
                Some(self.session_id),
                None,
                error.to_string(),
            )
            .await;
        reason
    }

    async fn dispatch_loop(&mut self) -> String {
        loop {
            let body = tokio::select! {
                reason = recv_termination(&mut self.term_rx) => return reason,
                result = self.reader.recv() => match result {
                    Ok(Some(body)) => body,
                    Ok(None) => return "client disconnected".into(),
                    Err(error) => return self.transport_error(error).await,
                },
            };
            self.bytes_received
                .fetch_add(4 + body.len() as u64, Ordering::Relaxed);
            self.session.lock().await.touch();

            let message = match RemoteMessage::decode(&body) {
                DecodedMessage::Known(message) => message,
                DecodedMessage::Unknown { tag } => {
                    debug!(%tag, "Unknown message tag");
                    self.queue
                        .send_rpc(RemoteMessage::Error(format!("Unknown message type: {tag}")));
                    continue;
                }
                DecodedMessage::Malformed(error) => {
                    return self
                        .transport_error(WireError::Encode(error))
                        .await;
                }
            };

            match message {
                RemoteMessage::Ping(beat) => {
                    self.queue.send_rpc(RemoteMessage::Pong(beat));
                    continue;
                }
                RemoteMessage::Pong(_) => continue,
                RemoteMessage::Disconnect(disconnect) => {
                    return disconnect
                        .reason
                        .unwrap_or_else(|| "client disconnected".into());
                }
                RemoteMessage::AuthResponse(_) => {
                    // Sessions authenticate exactly once
                    self.queue.send_rpc(RemoteMessage::AuthFailure(AuthFailure {
                        reason: "Session is already authenticated".into(),
                    }));
                    return "repeated authentication".into();
                }
                // The network proxy is permanently disabled; answer before
                // the permission gate so the reply is stable for old peers
                RemoteMessage::SystemRequest(SystemRequest::NetworkProxy(_)) => {
                    self.services
                        .audit
                        .log(
                            AuditAction::CommandBlocked,
                            AuditResult::Blocked,
                            Some(self.session_id),
                            self.client_name().await.as_deref(),
                            "network proxy request",
                        )
                        .await;
                    self.queue.send_rpc(RemoteMessage::Error(
                        "Network proxy feature is disabled".into(),
                    ));
                    continue;
                }
                message => {
                    if let Some(permission) = required_permission(&message) {
                        let held = self.session.lock().await.has_permission(permission);
                        if !held {
                            self.services
                                .audit
                                .log(
                                    AuditAction::PermissionDenied,
                                    AuditResult::Denied,
                                    Some(self.session_id),
                                    self.client_name().await.as_deref(),
                                    permission.name(),
                                )
                                .await;
                            self.queue.send_rpc(RemoteMessage::Error(format!(
                                "Permission denied for {permission}"
                            )));
                            continue;
                        }
                    }
                    self.handle_request(message).await;
                }
            }
        }
    }

    async fn client_name(&self) -> Option<String> {
        self.session
            .lock()
            .await
            .client
            .as_ref()
            .map(|c| c.name.clone())
    }

    async fn handle_request(&mut self, message: RemoteMessage) {
        let timeout = request_timeout(&message);
        let response = match message {
            RemoteMessage::ScreenRequest(request) => {
                match tokio::time::timeout(timeout, self.handle_screen(request)).await {
                    Ok(response) => response,
                    Err(_) => RemoteMessage::ScreenResponse(ScreenResponse::Error(
                        "timeout".into(),
                    )),
                }
            }
            RemoteMessage::InputRequest(request) => self.handle_input(request).await,
            RemoteMessage::FileRequest(request) => {
                match tokio::time::timeout(timeout, self.handle_file(request)).await {
                    Ok(response) => response,
                    Err(_) => {
                        RemoteMessage::FileResponse(FileResponse::Error("timeout".into()))
                    }
                }
            }
            RemoteMessage::SystemRequest(request) => {
                match tokio::time::timeout(timeout, self.handle_system(request)).await {
                    Ok(response) => response,
                    Err(_) => {
                        RemoteMessage::SystemResponse(SystemResponse::Error("timeout".into()))
                    }
                }
            }
            RemoteMessage::ClipboardRequest(request) => self.handle_clipboard(request).await,
            RemoteMessage::AnnotationRequest(request) => self.handle_annotation(request).await,
            RemoteMessage::RecordingRequest(request) => self.handle_recording(request).await,
            RemoteMessage::AudioRequest(request) => self.handle_audio(request).await,
            RemoteMessage::InventoryRequest(request) => self.handle_inventory(request).await,
            RemoteMessage::InferenceRequest(_) => RemoteMessage::InferenceResponse(
                InferenceResponse::Error("No inference provider configured".into()),
            ),
            RemoteMessage::Chat(chat) => {
                if !self.services.config.capabilities.chat {
                    RemoteMessage::Error("Chat capability is disabled".into())
                } else {
                    self.services
                        .audit
                        .log(
                            AuditAction::ChatReceived,
                            AuditResult::Success,
                            Some(self.session_id),
                            chat.sender.as_deref(),
                            chat.text.clone(),
                        )
                        .await;
                    let _ = self
                        .services
                        .events
                        .send(ServerEvent::ChatReceived {
                            session_id: self.session_id,
                            text: chat.text.clone(),
                        })
                        .await;
                    return;
                }
            }
            other => {
                debug!(?other, "Ignoring unexpected message");
                return;
            }
        };
        self.queue.send_rpc(response);
    }

    async fn handle_screen(&mut self, request: ScreenRequest) -> RemoteMessage {
        match request {
            ScreenRequest::Capture {
                target,
                quality,
                scale,
            } => match self.screen.capture_once(&target, quality, scale).await {
                Ok(frame) => {
                    self.audit_ok(AuditAction::ScreenCaptured, format!("{target:?}")).await;
                    RemoteMessage::ScreenResponse(ScreenResponse::Captured { frame })
                }
                Err(error) => {
                    self.audit_failure(AuditAction::ScreenCaptured, &error.to_string())
                        .await;
                    RemoteMessage::ScreenResponse(ScreenResponse::Error(error.to_string()))
                }
            },
            ScreenRequest::StartStream { fps, quality, scale } => {
                match self
                    .screen
                    .start_stream(fps, quality, scale, self.queue.clone())
                {
                    Ok(stream_id) => {
                        self.audit_ok(AuditAction::StreamStarted, stream_id.to_string())
                            .await;
                        RemoteMessage::ScreenResponse(ScreenResponse::StreamStarted {
                            stream_id,
                        })
                    }
                    Err(error @ ScreenError::StreamActive) => {
                        RemoteMessage::ScreenResponse(ScreenResponse::Error(error.to_string()))
                    }
                    Err(error) => {
                        self.audit_failure(AuditAction::StreamStarted, &error.to_string())
                            .await;
                        RemoteMessage::ScreenResponse(ScreenResponse::Error(error.to_string()))
                    }
                }
            }
            ScreenRequest::StopStream => {
                self.screen.stop_stream();
                self.audit_ok(AuditAction::StreamStopped, "").await;
                RemoteMessage::ScreenResponse(ScreenResponse::StreamStopped)
            }
            ScreenRequest::RequestKeyFrame => {
                if self.screen.request_key_frame() {
                    self.audit_ok(AuditAction::KeyFrameRequested, "").await;
                    RemoteMessage::ScreenResponse(ScreenResponse::KeyFrameScheduled)
                } else {
                    RemoteMessage::ScreenResponse(ScreenResponse::Error(
                        "No active stream".into(),
                    ))
                }
            }
        }
    }

    async fn handle_input(
        &self,
        request: thea_remote_protocol::InputRequest,
    ) -> RemoteMessage {
        match self.services.input.post(&request).await {
            Ok(()) => {
                self.audit_ok(AuditAction::InputInjected, "").await;
                RemoteMessage::InputResponse(thea_remote_protocol::InputResponse::Done)
            }
            Err(error) => RemoteMessage::InputResponse(
                thea_remote_protocol::InputResponse::Error(error.to_string()),
            ),
        }
    }

    async fn handle_file(&self, request: FileRequest) -> RemoteMessage {
        let files = &self.services.files;
        let (action, result) = match request {
            FileRequest::List {
                ref path,
                recursive,
                show_hidden,
            } => (
                AuditAction::FileListed,
                files
                    .list(path, recursive, show_hidden)
                    .await
                    .map(FileResponse::Entries),
            ),
            FileRequest::Info { ref path } => (
                AuditAction::FileListed,
                files.info(path).await.map(FileResponse::Entry),
            ),
            FileRequest::Read {
                ref path,
                offset,
                length,
            } => (AuditAction::FileRead, files.read(path, offset, length).await),
            FileRequest::Write {
                ref path,
                ref data,
                offset,
                append,
            } => (
                AuditAction::FileWritten,
                files.write(path, data, offset, append).await,
            ),
            FileRequest::Delete {
                ref path,
                recursive,
            } => (AuditAction::FileDeleted, files.delete(path, recursive).await),
            FileRequest::Move { ref from, ref to } => {
                (AuditAction::FileMoved, files.move_entry(from, to).await)
            }
            FileRequest::Copy { ref from, ref to } => {
                (AuditAction::FileCopied, files.copy_entry(from, to).await)
            }
            FileRequest::Download { ref path } => {
                (AuditAction::FileDownloaded, files.download(path).await)
            }
            FileRequest::Upload {
                ref path,
                ref data,
                overwrite,
            } => (
                AuditAction::FileUploaded,
                files.upload(path, data, overwrite).await,
            ),
        };

        match result {
            Ok(response) => {
                self.audit_ok(action, "").await;
                RemoteMessage::FileResponse(response)
            }
            Err(error) => {
                if error.is_policy_rejection() {
                    self.services
                        .audit
                        .log(
                            AuditAction::FileAccessBlocked,
                            AuditResult::Blocked,
                            Some(self.session_id),
                            self.client_name().await.as_deref(),
                            error.to_string(),
                        )
                        .await;
                } else {
                    self.audit_failure(action, &error.to_string()).await;
                }
                RemoteMessage::FileResponse(FileResponse::Error(error.to_string()))
            }
        }
    }

    async fn handle_system(&self, request: SystemRequest) -> RemoteMessage {
        let system = &self.services.system;
        match request {
            SystemRequest::GetInfo => match system.get_info().await {
                Ok(info) => {
                    self.audit_ok(AuditAction::SystemInfoQueried, "").await;
                    RemoteMessage::SystemResponse(SystemResponse::Info(info))
                }
                Err(error) => {
                    RemoteMessage::SystemResponse(SystemResponse::Error(error.to_string()))
                }
            },
            SystemRequest::GetProcesses => match system.get_processes().await {
                Ok(processes) => {
                    self.audit_ok(AuditAction::ProcessesQueried, "").await;
                    RemoteMessage::SystemResponse(SystemResponse::Processes(processes))
                }
                Err(error) => {
                    RemoteMessage::SystemResponse(SystemResponse::Error(error.to_string()))
                }
            },
            SystemRequest::ExecuteCommand {
                ref command,
                ref working_directory,
                timeout_seconds,
            } => {
                let timeout = timeout_seconds.map(Duration::from_secs);
                match system
                    .execute_command(command, working_directory.as_deref(), timeout)
                    .await
                {
                    Ok(output) => {
                        self.audit_ok(AuditAction::CommandExecuted, command.clone()).await;
                        RemoteMessage::SystemResponse(SystemResponse::CommandResult {
                            exit_code: output.exit_code,
                            stdout: output.stdout,
                            stderr: output.stderr,
                        })
                    }
                    Err(SystemServiceError::CommandBlocked) => {
                        self.services
                            .audit
                            .log(
                                AuditAction::CommandBlocked,
                                AuditResult::Blocked,
                                Some(self.session_id),
                                self.client_name().await.as_deref(),
                                command.clone(),
                            )
                            .await;
                        RemoteMessage::SystemResponse(SystemResponse::Error(
                            "Command blocked".into(),
                        ))
                    }
                    Err(SystemServiceError::ConfirmationDenied) => {
                        self.services
                            .audit
                            .log(
                                AuditAction::ConfirmationDenied,
                                AuditResult::Denied,
                                Some(self.session_id),
                                self.client_name().await.as_deref(),
                                command.clone(),
                            )
                            .await;
                        RemoteMessage::SystemResponse(SystemResponse::Error(
                            "Operation not confirmed".into(),
                        ))
                    }
                    Err(error) => {
                        self.audit_failure(AuditAction::CommandExecuted, &error.to_string())
                            .await;
                        RemoteMessage::SystemResponse(SystemResponse::Error(error.to_string()))
                    }
                }
            }
            SystemRequest::SystemControl { action } => {
                match system.system_control(action).await {
                    Ok(()) => {
                        self.audit_ok(
                            AuditAction::SystemControlPerformed,
                            format!("{action:?}"),
                        )
                        .await;
                        RemoteMessage::SystemResponse(SystemResponse::Success(format!(
                            "{action:?} performed"
                        )))
                    }
                    Err(SystemServiceError::ConfirmationDenied) => {
                        self.services
                            .audit
                            .log(
                                AuditAction::ConfirmationDenied,
                                AuditResult::Denied,
                                Some(self.session_id),
                                self.client_name().await.as_deref(),
                                format!("{action:?}"),
                            )
                            .await;
                        RemoteMessage::SystemResponse(SystemResponse::Error(
                            "Operation not confirmed".into(),
                        ))
                    }
                    Err(error) => {
                        self.audit_failure(
                            AuditAction::SystemControlPerformed,
                            &error.to_string(),
                        )
                        .await;
                        RemoteMessage::SystemResponse(SystemResponse::Error(error.to_string()))
                    }
                }
            }
            SystemRequest::WakeOnLan { ref mac_address } => {
                match system.wake_on_lan(mac_address).await {
                    Ok(()) => {
                        self.audit_ok(AuditAction::WakeOnLanSent, mac_address.clone()).await;
                        RemoteMessage::SystemResponse(SystemResponse::Success(format!(
                            "Magic packet sent to {mac_address}"
                        )))
                    }
                    Err(error) => {
                        self.audit_failure(AuditAction::WakeOnLanSent, &error.to_string())
                            .await;
                        RemoteMessage::SystemResponse(SystemResponse::Error(error.to_string()))
                    }
                }
            }
            SystemRequest::NetworkProxy(_) => {
                // Short-circuited in the dispatch loop; kept for
                // exhaustiveness
                RemoteMessage::Error("Network proxy feature is disabled".into())
            }
        }
    }

    async fn handle_clipboard(&self, request: ClipboardRequest) -> RemoteMessage {
        if !self.services.config.capabilities.clipboard {
            return RemoteMessage::ClipboardResponse(ClipboardResponse::Error(
                "Clipboard capability is disabled".into(),
            ));
        }
        match request {
            ClipboardRequest::Get => match self.services.input.clipboard_get().await {
                Ok(content) => {
                    self.audit_ok(AuditAction::ClipboardRead, "").await;
                    RemoteMessage::ClipboardResponse(ClipboardResponse::Content(content))
                }
                Err(error) => RemoteMessage::ClipboardResponse(ClipboardResponse::Error(
                    error.to_string(),
                )),
            },
            ClipboardRequest::Set { ref content } => {
                match self.services.input.clipboard_set(content).await {
                    Ok(()) => {
                        self.audit_ok(AuditAction::ClipboardWritten, "").await;
                        RemoteMessage::ClipboardResponse(ClipboardResponse::Done)
                    }
                    Err(error) => RemoteMessage::ClipboardResponse(
                        ClipboardResponse::Error(error.to_string()),
                    ),
                }
            }
        }
    }

    async fn handle_annotation(
        &self,
        request: thea_remote_protocol::AnnotationRequest,
    ) -> RemoteMessage {
        use thea_remote_protocol::{AnnotationRequest, AnnotationResponse};
        if !self.services.config.capabilities.annotations {
            return RemoteMessage::AnnotationResponse(AnnotationResponse::Error(
                "Annotation capability is disabled".into(),
            ));
        }
        match request {
            AnnotationRequest::Draw(ref stroke) => {
                if stroke.points.is_empty() || stroke.width <= 0.0 {
                    return RemoteMessage::AnnotationResponse(AnnotationResponse::Error(
                        "Invalid annotation stroke".into(),
                    ));
                }
                self.audit_ok(
                    AuditAction::AnnotationReceived,
                    format!("{} points", stroke.points.len()),
                )
                .await;
                RemoteMessage::AnnotationResponse(AnnotationResponse::Acknowledged)
            }
            AnnotationRequest::Clear => {
                self.audit_ok(AuditAction::AnnotationReceived, "clear").await;
                RemoteMessage::AnnotationResponse(AnnotationResponse::Acknowledged)
            }
        }
    }

    async fn handle_recording(&self, request: RecordingRequest) -> RemoteMessage {
        let recordings = &self.services.recordings;
        match request {
            RecordingRequest::Start => {
                let (width, height) = match self.services.platform.capture.list_displays().await
                {
                    Ok(displays) => displays
                        .iter()
                        .find(|d| d.is_main)
                        .or_else(|| displays.first())
                        .map(|d| (d.width, d.height))
                        .unwrap_or((1920, 1080)),
                    Err(_) => (1920, 1080),
                };
                match recordings
                    .start(self.session_id, width, height, 30, "h264")
                    .await
                {
                    Ok(id) => {
                        self.audit_ok(AuditAction::RecordingStarted, id.to_string()).await;
                        RemoteMessage::RecordingResponse(RecordingResponse::Started { id })
                    }
                    Err(error) => RemoteMessage::RecordingResponse(RecordingResponse::Error(
                        error.to_string(),
                    )),
                }
            }
            RecordingRequest::Stop => match recordings.stop(self.session_id).await {
                Ok(meta) => {
                    self.audit_ok(AuditAction::RecordingStopped, meta.id.to_string())
                        .await;
                    RemoteMessage::RecordingResponse(RecordingResponse::Stopped(meta))
                }
                Err(error) => RemoteMessage::RecordingResponse(RecordingResponse::Error(
                    error.to_string(),
                )),
            },
            RecordingRequest::List => RemoteMessage::RecordingResponse(
                RecordingResponse::Listing(recordings.list().await),
            ),
            RecordingRequest::Delete { id } => match recordings.delete(id).await {
                Ok(()) => {
                    self.audit_ok(AuditAction::RecordingDeleted, id.to_string()).await;
                    RemoteMessage::RecordingResponse(RecordingResponse::Success(format!(
                        "Deleted recording {id}"
                    )))
                }
                Err(error) => RemoteMessage::RecordingResponse(RecordingResponse::Error(
                    error.to_string(),
                )),
            },
        }
    }

    async fn handle_audio(&self, request: AudioRequest) -> RemoteMessage {
        if !self.services.config.capabilities.audio {
            return RemoteMessage::AudioResponse(AudioResponse::Error(
                "Audio capability is disabled".into(),
            ));
        }
        match request {
            AudioRequest::Start => RemoteMessage::AudioResponse(AudioResponse::Started),
            AudioRequest::Stop => RemoteMessage::AudioResponse(AudioResponse::Stopped),
        }
    }

    async fn handle_inventory(&self, request: InventoryRequest) -> RemoteMessage {
        let capture = &self.services.platform.capture;
        let response = match request {
            InventoryRequest::Displays => capture
                .list_displays()
                .await
                .map(InventoryResponse::Displays),
            InventoryRequest::Windows => {
                capture.list_windows().await.map(InventoryResponse::Windows)
            }
            InventoryRequest::Applications => capture
                .list_applications()
                .await
                .map(InventoryResponse::Applications),
        };
        match response {
            Ok(response) => RemoteMessage::InventoryResponse(response),
            Err(error) => {
                RemoteMessage::InventoryResponse(InventoryResponse::Error(error.to_string()))
            }
        }
    }

    async fn audit_ok(&self, action: AuditAction, details: impl Into<String>) {
        self.services
            .audit
            .log(
                action,
                AuditResult::Success,
                Some(self.session_id),
                self.client_name().await.as_deref(),
                details,
            )
            .await;
    }

    async fn audit_failure(&self, action: AuditAction, details: &str) {
        self.services
            .audit
            .log(
                action,
                AuditResult::Failure,
                Some(self.session_id),
                self.client_name().await.as_deref(),
                details.to_owned(),
            )
            .await;
    }
}

async fn recv_termination(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    rx.recv().await.unwrap_or_else(|| "terminated".into())
}

fn request_timeout(message: &RemoteMessage) -> Duration {
    match message {
        RemoteMessage::ScreenRequest(_) => DEFAULT_REQUEST_TIMEOUT,
        RemoteMessage::FileRequest(FileRequest::List { .. })
        | RemoteMessage::FileRequest(FileRequest::Info { .. }) => LISTING_TIMEOUT,
        RemoteMessage::FileRequest(_) => TRANSFER_TIMEOUT,
        RemoteMessage::SystemRequest(SystemRequest::ExecuteCommand {
            timeout_seconds, ..
        }) => {
            Duration::from_secs(timeout_seconds.unwrap_or(60)) + COMMAND_GRACE
        }
        _ => DEFAULT_REQUEST_TIMEOUT,
    }
}

/// Sends a keepalive ping every five seconds and surfaces transfer
/// statistics to the host.
async fn heartbeat_loop(
    services: Services,
    session_id: SessionId,
    queue: Arc<WriterQueue>,
    bytes_sent: Arc<AtomicU64>,
    bytes_received: Arc<AtomicU64>,
) {
    let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        queue.send_rpc(RemoteMessage::Ping(Heartbeat {
            timestamp: Utc::now(),
        }));
        let sent = bytes_sent.load(Ordering::Relaxed);
        let received = bytes_received.load(Ordering::Relaxed);
        if let Some(session) = services.state.lock().await.sessions.get(&session_id) {
            let mut session = session.lock().await;
            session.bytes_sent = sent;
            session.bytes_received = received;
        }
        let _ = services
            .events
            .send(ServerEvent::TransferStats {
                session_id,
                bytes_sent: sent,
                bytes_received: received,
            })
            .await;
    }
}

/// Terminates the session once it has been idle past the configured
/// timeout.
async fn idle_watchdog(session: Arc<Mutex<SessionState>>, timeout: Duration) {
    loop {
        let (last_activity, deadline) = {
            let session = session.lock().await;
            let deadline = session.last_activity
                + chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
            (session.last_activity, deadline)
        };
        let now = Utc::now();
        if now >= deadline {
            let session = session.lock().await;
            if session.last_activity == last_activity {
                session.handle.close("session timeout");
                return;
            }
            continue;
        }
        let remaining = (deadline - now)
            .to_std()
            .unwrap_or(Duration::from_secs(1))
            .max(Duration::from_millis(250));
        tokio::time::sleep(remaining).await;
    }
}
