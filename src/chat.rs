//! Upstream chat ingestion.
//!
//! One logical websocket connection per process, owned here. The ingestor
//! normalizes provider frames into [`ChatEvent`]s and reports connectivity;
//! transport errors never leave this module.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Normalized chat message. Timestamps are preserved from the source.
#[derive(Debug, Clone)]
pub struct ChatEvent {
    pub username: String,
    pub message: String,
    pub ts_ms: u64,
}

#[derive(Debug)]
pub enum ChatFeedEvent {
    Message(ChatEvent),
    Status { connected: bool },
    /// Reconnect attempts exhausted; the feed is dead until restart.
    Terminal,
}

pub struct ChatIngestor {
    url: String,
    room: String,
    tx: mpsc::Sender<ChatFeedEvent>,
    started: AtomicBool,
    connecting: AtomicBool,
    connected: AtomicBool,
}

impl ChatIngestor {
    pub fn new(url: String, room: String, tx: mpsc::Sender<ChatFeedEvent>) -> Arc<Self> {
        Arc::new(Self {
            url,
            room,
            tx,
            started: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            connected: AtomicBool::new(false),
        })
    }

    /// Connect-attempt guard: an attempt may begin only while no connection
    /// is live and no other attempt is in flight.
    fn try_begin_connect(&self) -> bool {
        !self.connected.load(Ordering::SeqCst)
            && self
                .connecting
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }

    /// Start the connection loop. Idempotent: the loop is spawned at most
    /// once no matter how many callers race here, so there is never more than
    /// one live upstream connection or pending reconnect.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.started.swap(true, Ordering::SeqCst) {
            return None;
        }
        let this = Arc::clone(self);
        Some(tokio::spawn(this.run()))
    }

    async fn run(self: Arc<Self>) {
        let mut attempts: u32 = 0;
        loop {
            if !self.try_begin_connect() {
                // a connection or attempt is already live; never stack another
                tokio::time::sleep(RECONNECT_BACKOFF).await;
                continue;
            }
            info!(url = %self.url, room = %self.room, "connecting to chat");
            match connect_async(self.url.as_str()).await {
                Ok((ws, _)) => {
                    self.connecting.store(false, Ordering::SeqCst);
                    self.connected.store(true, Ordering::SeqCst);
                    attempts = 0;
                    self.emit(ChatFeedEvent::Status { connected: true }).await;

                    let (mut sink, mut stream) = ws.split();
                    let join = json!({ "action": "join", "room": self.room });
                    if let Err(e) = sink.send(Message::Text(join.to_string())).await {
                        warn!(error = %e, "failed to send join frame");
                    }

                    while let Some(frame) = stream.next().await {
                        match frame {
                            Ok(Message::Text(text)) => {
                                if let Some(ev) = normalize(&text) {
                                    self.emit(ChatFeedEvent::Message(ev)).await;
                                }
                            }
                            Ok(Message::Close(_)) => {
                                info!("chat closed by upstream");
                                break;
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!(error = %e, "chat transport error");
                                break;
                            }
                        }
                    }

                    self.connected.store(false, Ordering::SeqCst);
                    self.emit(ChatFeedEvent::Status { connected: false }).await;
                }
                Err(e) => {
                    self.connecting.store(false, Ordering::SeqCst);
                    warn!(error = %e, "chat connect failed");
                }
            }

            if attempts >= MAX_RECONNECT_ATTEMPTS {
                error!(
                    attempts,
                    "max reconnect attempts reached, giving up on chat feed"
                );
                self.emit(ChatFeedEvent::Terminal).await;
                return;
            }
            attempts += 1;
            tokio::time::sleep(RECONNECT_BACKOFF).await;
        }
    }

    async fn emit(&self, event: ChatFeedEvent) {
        // receiver gone means we are shutting down; nothing to report
        let _ = self.tx.send(event).await;
    }
}

#[derive(Deserialize)]
struct ChatFrame {
    username: String,
    message: String,
    #[serde(default)]
    timestamp: Option<u64>,
}

/// Decode one provider frame into a normalized event. Frames that are not
/// chat messages (presence, acks, malformed payloads) yield `None`.
fn normalize(text: &str) -> Option<ChatEvent> {
    let frame: ChatFrame = serde_json::from_str(text).ok()?;
    Some(ChatEvent {
        username: frame.username,
        message: frame.message,
        ts_ms: frame.timestamp.unwrap_or_else(crate::now_ms),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_accepts_chat_frames() {
        let ev = normalize(r#"{"username":"alice","message":"HIT","timestamp":1700000000000}"#)
            .expect("valid frame");
        assert_eq!(ev.username, "alice");
        assert_eq!(ev.message, "HIT");
        assert_eq!(ev.ts_ms, 1_700_000_000_000);
    }

    #[test]
    fn normalize_defaults_missing_timestamp() {
        let ev = normalize(r#"{"username":"bob","message":"hi"}"#).expect("valid frame");
        assert!(ev.ts_ms > 0);
    }

    #[test]
    fn normalize_skips_non_chat_frames() {
        assert!(normalize(r#"{"action":"ack"}"#).is_none());
        assert!(normalize("not json").is_none());
        assert!(normalize("").is_none());
    }

    #[tokio::test]
    async fn connect_guard_admits_one_attempt_at_a_time() {
        let (tx, _rx) = mpsc::channel(8);
        let ingestor = ChatIngestor::new("ws://127.0.0.1:1".into(), "room".into(), tx);
        assert!(ingestor.try_begin_connect());
        assert!(!ingestor.try_begin_connect(), "attempt already in flight");
        ingestor.connecting.store(false, Ordering::SeqCst);
        ingestor.connected.store(true, Ordering::SeqCst);
        assert!(!ingestor.try_begin_connect(), "connection already live");
        ingestor.connected.store(false, Ordering::SeqCst);
        assert!(ingestor.try_begin_connect());
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let (tx, _rx) = mpsc::channel(8);
        let ingestor = ChatIngestor::new("ws://127.0.0.1:1".into(), "room".into(), tx);
        let first = ingestor.start();
        let second = ingestor.start();
        assert!(first.is_some());
        assert!(second.is_none());
        first.unwrap().abort();
    }
}
