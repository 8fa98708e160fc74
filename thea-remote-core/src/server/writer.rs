use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::AsyncWrite;
use tokio::sync::Notify;
use tracing::*;

use thea_remote_protocol::{MessageStream, RemoteMessage, WireError};

const OUTGOING_QUEUE_LIMIT: usize = 64;

enum Outgoing {
    Rpc(RemoteMessage),
    Frame {
        message: RemoteMessage,
        is_key_frame: bool,
    },
}

/// Single-writer outgoing queue for one session socket.
///
/// RPC responses are never dropped. Stream frames are bounded: when the
/// queue is full the oldest non-keyframe is evicted first, and an
/// incoming non-keyframe is discarded if only keyframes remain.
pub struct WriterQueue {
    queue: Mutex<VecDeque<Outgoing>>,
    notify: Notify,
    closed: std::sync::atomic::AtomicBool,
    dropped_frames: AtomicU64,
}

impl WriterQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: std::sync::atomic::AtomicBool::new(false),
            dropped_frames: AtomicU64::new(0),
        })
    }

    pub fn send_rpc(&self, message: RemoteMessage) {
        #[allow(clippy::unwrap_used)]
        self.queue.lock().unwrap().push_back(Outgoing::Rpc(message));
        self.notify.notify_one();
    }

    pub fn send_frame(&self, message: RemoteMessage, is_key_frame: bool) {
        {
            #[allow(clippy::unwrap_used)]
            let mut queue = self.queue.lock().unwrap();
            if queue.len() >= OUTGOING_QUEUE_LIMIT {
                let evictable = queue.iter().position(
                    |o| matches!(o, Outgoing::Frame { is_key_frame: false, .. }),
                );
                match evictable {
                    Some(index) => {
                        queue.remove(index);
                        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                    }
                    None if !is_key_frame => {
                        // Only keyframes and RPCs queued; the new delta
                        // frame is the one to lose.
                        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    None => {}
                }
            }
            queue.push_back(Outgoing::Frame {
                message,
                is_key_frame,
            });
        }
        self.notify.notify_one();
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    pub fn queued(&self) -> usize {
        #[allow(clippy::unwrap_used)]
        self.queue.lock().unwrap().len()
    }

    fn pop(&self) -> Option<Outgoing> {
        #[allow(clippy::unwrap_used)]
        self.queue.lock().unwrap().pop_front()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Drains the queue onto the socket until the queue is closed or the
/// socket fails. All serialization happens here, so messages are atomic
/// on the wire.
pub async fn run_writer<S>(
    queue: Arc<WriterQueue>,
    mut stream: MessageStream<S>,
    bytes_sent: Arc<AtomicU64>,
) -> Result<(), WireError>
where
    S: AsyncWrite + Unpin,
{
    loop {
        let Some(outgoing) = queue.pop() else {
            if queue.is_closed() {
                return Ok(());
            }
            queue.notify.notified().await;
            continue;
        };
        let message = match outgoing {
            Outgoing::Rpc(m) => m,
            Outgoing::Frame { message, .. } => message,
        };
        match stream.push(&message) {
            Ok(wire_size) => {
                stream.flush().await?;
                bytes_sent.fetch_add(wire_size as u64, Ordering::Relaxed);
            }
            Err(error) => {
                warn!(%error, "Failed to encode outgoing message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use thea_remote_protocol::{CursorInfo, FrameFormat, Heartbeat, ScreenFrame, ScreenResponse};

    fn frame_message(key: bool) -> RemoteMessage {
        RemoteMessage::ScreenResponse(ScreenResponse::Frame {
            frame: ScreenFrame {
                width: 1,
                height: 1,
                format: FrameFormat::Jpeg,
                data: bytes::Bytes::from_static(&[0]),
                is_key_frame: key,
                cursor: CursorInfo {
                    x: 0.0,
                    y: 0.0,
                    visible: false,
                },
                timestamp: Utc::now(),
            },
        })
    }

    #[test]
    fn test_rpc_is_never_dropped() {
        let queue = WriterQueue::new();
        for _ in 0..(OUTGOING_QUEUE_LIMIT * 2) {
            queue.send_rpc(RemoteMessage::Pong(Heartbeat {
                timestamp: Utc::now(),
            }));
        }
        assert_eq!(
            queue.queue.lock().unwrap().len(),
            OUTGOING_QUEUE_LIMIT * 2
        );
        assert_eq!(queue.dropped_frames(), 0);
    }

    #[test]
    fn test_full_queue_evicts_oldest_delta_frame() {
        let queue = WriterQueue::new();
        queue.send_frame(frame_message(true), true);
        for _ in 0..(OUTGOING_QUEUE_LIMIT - 1) {
            queue.send_frame(frame_message(false), false);
        }
        assert_eq!(queue.queue.lock().unwrap().len(), OUTGOING_QUEUE_LIMIT);

        queue.send_frame(frame_message(false), false);
        assert_eq!(queue.queue.lock().unwrap().len(), OUTGOING_QUEUE_LIMIT);
        assert_eq!(queue.dropped_frames(), 1);

        // the keyframe at the head is still there
        let head = queue.pop().unwrap();
        assert!(matches!(head, Outgoing::Frame { is_key_frame: true, .. }));
    }

    #[test]
    fn test_incoming_delta_dropped_when_only_keyframes_remain() {
        let queue = WriterQueue::new();
        for _ in 0..OUTGOING_QUEUE_LIMIT {
            queue.send_frame(frame_message(true), true);
        }
        queue.send_frame(frame_message(false), false);
        assert_eq!(queue.queue.lock().unwrap().len(), OUTGOING_QUEUE_LIMIT);
        assert_eq!(queue.dropped_frames(), 1);

        // keyframes are always kept, even over the limit
        queue.send_frame(frame_message(true), true);
        assert_eq!(
            queue.queue.lock().unwrap().len(),
            OUTGOING_QUEUE_LIMIT + 1
        );
    }

    #[tokio::test]
    async fn test_writer_drains_to_stream() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let queue = WriterQueue::new();
        let bytes_sent = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(run_writer(
            queue.clone(),
            MessageStream::new(server),
            bytes_sent.clone(),
        ));

        queue.send_rpc(RemoteMessage::Error("one".into()));
        queue.send_rpc(RemoteMessage::Error("two".into()));

        let mut reader = MessageStream::new(client);
        let first = reader.recv().await.unwrap().unwrap();
        let second = reader.recv().await.unwrap().unwrap();
        assert!(std::str::from_utf8(&first).unwrap().contains("one"));
        assert!(std::str::from_utf8(&second).unwrap().contains("two"));

        queue.close();
        task.await.unwrap().unwrap();
        assert!(bytes_sent.load(Ordering::Relaxed) > 0);
    }
}
