use std::future::Future;
use std::time::Duration;

use tokio::io::DuplexStream;
use tokio::task::JoinHandle;

use thea_remote_common::{AuthMethod, ServerConfig};
use thea_remote_protocol::{
    AuthResponse, DecodedMessage, DeviceKind, FileRequest, Heartbeat, MessageStream, Permission,
    RemoteMessage, ScreenRequest, ScreenResponse, SystemRequest,
};

use crate::audit::{AuditAction, AuditQuery};
use crate::platform::Platform;
use crate::services::Services;

struct TestPeer {
    stream: MessageStream<DuplexStream>,
    services: Services,
    session_task: JoinHandle<()>,
    _data_dir: tempfile::TempDir,
}

impl TestPeer {
    async fn connect(configure: impl FnOnce(&mut ServerConfig)) -> Self {
        let data_dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig::defaults_with_data_dir(data_dir.path().into());
        config.auth_method = AuthMethod::PairingCode;
        config.require_confirmation = false;
        configure(&mut config);

        let (services, _hub) = Services::new(config, Platform::null()).await.unwrap();
        let (client, server) = tokio::io::duplex(4 * 1024 * 1024);
        let session_task = tokio::spawn(super::run_plain_session(
            services.clone(),
            server,
            "192.0.2.10:52000".parse().unwrap(),
        ));
        Self {
            stream: MessageStream::new(client),
            services,
            session_task,
            _data_dir: data_dir,
        }
    }

    async fn send(&mut self, message: RemoteMessage) {
        self.stream.push(&message).unwrap();
        self.stream.flush().await.unwrap();
    }

    /// Next message that is not a heartbeat or a stream frame.
    async fn recv_response(&mut self) -> Option<RemoteMessage> {
        loop {
            let body = tokio::time::timeout(Duration::from_secs(5), self.stream.recv())
                .await
                .expect("timed out waiting for a response")
                .unwrap()?;
            match RemoteMessage::decode(&body) {
                DecodedMessage::Known(RemoteMessage::Ping(_))
                | DecodedMessage::Known(RemoteMessage::Pong(_))
                | DecodedMessage::Known(RemoteMessage::ScreenResponse(
                    ScreenResponse::Frame { .. },
                )) => continue,
                DecodedMessage::Known(message) => return Some(message),
                other => panic!("undecodable server message: {other:?}"),
            }
        }
    }

    async fn authenticate(&mut self, permissions: Vec<Permission>) -> RemoteMessage {
        let code = self
            .services
            .connections
            .generate_pairing_code(Duration::from_secs(300))
            .await;
        self.authenticate_with_code(permissions, &code).await
    }

    async fn authenticate_with_code(
        &mut self,
        permissions: Vec<Permission>,
        code: &str,
    ) -> RemoteMessage {
        let challenge = match self.recv_response().await.unwrap() {
            RemoteMessage::AuthChallenge(challenge) => challenge,
            other => panic!("expected a challenge, got {other:?}"),
        };
        assert_eq!(challenge.nonce.len(), 32);
        assert!(challenge.server_public_key.is_some());

        self.send(RemoteMessage::AuthResponse(AuthResponse {
            challenge_id: challenge.challenge_id,
            client_name: "Laptop".into(),
            device_type: DeviceKind::Mac,
            client_id: None,
            requested_permissions: permissions,
            pairing_code: Some(code.to_owned()),
            shared_secret_proof: None,
            certificate: None,
            totp_code: None,
            recovery_code: None,
            client_public_key: None,
        }))
        .await;
        self.recv_response().await.unwrap()
    }

    async fn join_session(&mut self) {
        std::future::poll_fn(|cx| std::pin::Pin::new(&mut self.session_task).poll(cx))
            .await
            .unwrap();
    }

    async fn audit_has(&self, action: AuditAction) -> bool {
        !self
            .services
            .audit
            .query(&AuditQuery {
                action: Some(action),
                ..Default::default()
            })
            .await
            .is_empty()
    }
}

#[tokio::test]
async fn test_happy_path_pairing() {
    let mut peer = TestPeer::connect(|_| {}).await;
    let response = peer.authenticate(vec![Permission::ViewScreen]).await;
    match response {
        RemoteMessage::AuthSuccess(success) => {
            assert_eq!(success.permissions, vec![Permission::ViewScreen]);
        }
        other => panic!("expected authSuccess, got {other:?}"),
    }
    assert!(peer.audit_has(AuditAction::SessionStarted).await);
    assert!(peer.audit_has(AuditAction::ClientConnected).await);
    assert!(peer.audit_has(AuditAction::PairingCodeUsed).await);
}

#[tokio::test]
async fn test_wrong_pairing_code_terminates() {
    let mut peer = TestPeer::connect(|_| {}).await;
    let _ = peer
        .services
        .connections
        .generate_pairing_code(Duration::from_secs(300))
        .await;
    let response = peer
        .authenticate_with_code(vec![Permission::ViewScreen], "000000")
        .await;
    match response {
        RemoteMessage::AuthFailure(failure) => {
            assert_eq!(failure.reason, "Invalid pairing code");
        }
        other => panic!("expected authFailure, got {other:?}"),
    }
    // the session closes and unregisters
    assert!(peer.recv_response().await.is_none());
    peer.join_session().await;
    assert!(peer.services.state.lock().await.sessions.is_empty());
    assert!(peer.audit_has(AuditAction::AuthenticationFailed).await);
}

#[tokio::test]
async fn test_requests_before_auth_are_refused() {
    let mut peer = TestPeer::connect(|_| {}).await;
    let _challenge = peer.recv_response().await.unwrap();
    peer.send(RemoteMessage::FileRequest(FileRequest::Info {
        path: "/etc".into(),
    }))
    .await;
    match peer.recv_response().await.unwrap() {
        RemoteMessage::AuthFailure(failure) => {
            assert_eq!(failure.reason, "Authentication required");
        }
        other => panic!("expected authFailure, got {other:?}"),
    }
    assert!(peer.recv_response().await.is_none());
}

#[tokio::test]
async fn test_ping_before_auth_is_refused() {
    let mut peer = TestPeer::connect(|_| {}).await;
    let _challenge = peer.recv_response().await.unwrap();
    peer.send(RemoteMessage::Ping(Heartbeat {
        timestamp: chrono::Utc::now(),
    }))
    .await;
    // Only the auth response may follow the challenge; a ping is refused
    // like any other message
    match peer.recv_response().await.unwrap() {
        RemoteMessage::AuthFailure(failure) => {
            assert_eq!(failure.reason, "Authentication required");
        }
        other => panic!("expected authFailure, got {other:?}"),
    }
    assert!(peer.recv_response().await.is_none());
    peer.join_session().await;
    assert!(peer.services.state.lock().await.sessions.is_empty());
}

#[tokio::test]
async fn test_unrequested_permissions_are_not_granted() {
    let mut peer = TestPeer::connect(|_| {}).await;
    let response = peer
        .authenticate(vec![Permission::ViewScreen, Permission::NetworkAccess])
        .await;
    match response {
        RemoteMessage::AuthSuccess(success) => {
            // NetworkAccess is dropped silently
            assert_eq!(success.permissions, vec![Permission::ViewScreen]);
        }
        other => panic!("expected authSuccess, got {other:?}"),
    }
}

#[tokio::test]
async fn test_permission_denied_is_recoverable() {
    let mut peer = TestPeer::connect(|_| {}).await;
    peer.authenticate(vec![Permission::ViewScreen]).await;

    peer.send(RemoteMessage::FileRequest(FileRequest::Read {
        path: "/etc/hostname".into(),
        offset: 0,
        length: 64,
    }))
    .await;
    match peer.recv_response().await.unwrap() {
        RemoteMessage::Error(message) => {
            assert_eq!(message, "Permission denied for readFiles");
        }
        other => panic!("expected error, got {other:?}"),
    }
    assert!(peer.audit_has(AuditAction::PermissionDenied).await);

    // the session survives the denial
    peer.send(RemoteMessage::Ping(Heartbeat {
        timestamp: chrono::Utc::now(),
    }))
    .await;
    let body = tokio::time::timeout(Duration::from_secs(5), peer.stream.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(matches!(
        RemoteMessage::decode(&body),
        DecodedMessage::Known(RemoteMessage::Pong(_)) | DecodedMessage::Known(RemoteMessage::Ping(_))
    ));
}

#[tokio::test]
async fn test_unknown_tag_is_answered_not_fatal() {
    let mut peer = TestPeer::connect(|_| {}).await;
    peer.authenticate(vec![Permission::ViewScreen]).await;

    // hand-rolled frame with an unknown tag
    let body = br#"{"quantumRequest": {"qubits": 8}}"#;
    let mut frame = Vec::new();
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);
    tokio::io::AsyncWriteExt::write_all(peer.stream.stream_mut(), &frame)
        .await
        .unwrap();

    match peer.recv_response().await.unwrap() {
        RemoteMessage::Error(message) => {
            assert!(message.contains("quantumRequest"));
        }
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_path_traversal_is_blocked_and_audited() {
    let mut peer = TestPeer::connect(|_| {}).await;
    peer.authenticate(vec![Permission::ViewFiles, Permission::ReadFiles])
        .await;

    peer.send(RemoteMessage::FileRequest(FileRequest::Read {
        path: "/Users/alice/../../etc/passwd".into(),
        offset: 0,
        length: 1024,
    }))
    .await;
    match peer.recv_response().await.unwrap() {
        RemoteMessage::FileResponse(thea_remote_protocol::FileResponse::Error(message)) => {
            assert_eq!(message, "Path traversal attack detected");
        }
        other => panic!("expected fileResponse error, got {other:?}"),
    }
    assert!(peer.audit_has(AuditAction::FileAccessBlocked).await);
}

#[tokio::test]
async fn test_stream_restart_cycle() {
    let mut peer = TestPeer::connect(|_| {}).await;
    peer.authenticate(vec![Permission::ViewScreen]).await;

    let start = RemoteMessage::ScreenRequest(ScreenRequest::StartStream {
        fps: 10,
        quality: 0.5,
        scale: 0.05,
    });
    peer.send(start.clone()).await;
    let first_id = match peer.recv_response().await.unwrap() {
        RemoteMessage::ScreenResponse(ScreenResponse::StreamStarted { stream_id }) => stream_id,
        other => panic!("expected streamStarted, got {other:?}"),
    };

    peer.send(start.clone()).await;
    match peer.recv_response().await.unwrap() {
        RemoteMessage::ScreenResponse(ScreenResponse::Error(message)) => {
            assert_eq!(message, "Stream already active");
        }
        other => panic!("expected error, got {other:?}"),
    }

    peer.send(RemoteMessage::ScreenRequest(ScreenRequest::StopStream))
        .await;
    match peer.recv_response().await.unwrap() {
        RemoteMessage::ScreenResponse(ScreenResponse::StreamStopped) => {}
        other => panic!("expected streamStopped, got {other:?}"),
    }

    peer.send(start).await;
    match peer.recv_response().await.unwrap() {
        RemoteMessage::ScreenResponse(ScreenResponse::StreamStarted { stream_id }) => {
            assert_ne!(stream_id, first_id);
        }
        other => panic!("expected streamStarted, got {other:?}"),
    }
}

#[tokio::test]
async fn test_network_proxy_is_permanently_disabled() {
    let mut peer = TestPeer::connect(|_| {}).await;
    peer.authenticate(vec![Permission::ViewScreen]).await;

    peer.send(RemoteMessage::SystemRequest(SystemRequest::NetworkProxy(
        serde_json::json!({"host": "169.254.169.254", "port": 80}),
    )))
    .await;
    match peer.recv_response().await.unwrap() {
        RemoteMessage::Error(message) => {
            assert_eq!(message, "Network proxy feature is disabled");
        }
        other => panic!("expected error, got {other:?}"),
    }
    assert!(peer.audit_has(AuditAction::CommandBlocked).await);
}

#[tokio::test]
async fn test_disconnect_message_ends_session() {
    let mut peer = TestPeer::connect(|_| {}).await;
    peer.authenticate(vec![Permission::ViewScreen]).await;
    peer.send(RemoteMessage::Disconnect(thea_remote_protocol::Disconnect {
        reason: Some("done".into()),
    }))
    .await;
    assert!(peer.recv_response().await.is_none());
    peer.join_session().await;

    let state = peer.services.state.lock().await;
    assert!(state.sessions.is_empty());
    let record = state.history().next().unwrap();
    assert_eq!(record.end_reason.as_deref(), Some("done"));
}

#[tokio::test]
async fn test_second_auth_response_is_rejected() {
    let mut peer = TestPeer::connect(|_| {}).await;
    let success = peer.authenticate(vec![Permission::ViewScreen]).await;
    let challenge_id = match success {
        RemoteMessage::AuthSuccess(_) => uuid::Uuid::new_v4(),
        other => panic!("expected authSuccess, got {other:?}"),
    };

    peer.send(RemoteMessage::AuthResponse(AuthResponse {
        challenge_id,
        client_name: "Laptop".into(),
        device_type: DeviceKind::Mac,
        client_id: None,
        requested_permissions: vec![],
        pairing_code: Some("123456".into()),
        shared_secret_proof: None,
        certificate: None,
        totp_code: None,
        recovery_code: None,
        client_public_key: None,
    }))
    .await;
    match peer.recv_response().await.unwrap() {
        RemoteMessage::AuthFailure(failure) => {
            assert_eq!(failure.reason, "Session is already authenticated");
        }
        other => panic!("expected authFailure, got {other:?}"),
    }
    assert!(peer.recv_response().await.is_none());
}

#[tokio::test]
async fn test_clipboard_round_trip_through_dispatcher() {
    let mut peer = TestPeer::connect(|_| {}).await;
    peer.authenticate(vec![Permission::ViewScreen, Permission::ControlScreen])
        .await;

    peer.send(RemoteMessage::ClipboardRequest(
        thea_remote_protocol::ClipboardRequest::Set {
            content: "shared text".into(),
        },
    ))
    .await;
    assert!(matches!(
        peer.recv_response().await.unwrap(),
        RemoteMessage::ClipboardResponse(thea_remote_protocol::ClipboardResponse::Done)
    ));

    peer.send(RemoteMessage::ClipboardRequest(
        thea_remote_protocol::ClipboardRequest::Get,
    ))
    .await;
    match peer.recv_response().await.unwrap() {
        RemoteMessage::ClipboardResponse(thea_remote_protocol::ClipboardResponse::Content(
            content,
        )) => assert_eq!(content.as_deref(), Some("shared text")),
        other => panic!("expected clipboard content, got {other:?}"),
    }
}
