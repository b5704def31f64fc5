//! Socket abstraction for the persistent transport.
//!
//! A [`Dialer`] opens one connection and hands back a [`FrameSink`] for
//! outgoing text frames plus a channel of [`SocketEvent`]s for everything
//! arriving. The host plugs in its WebSocket library here; tests use
//! [`MemoryDialer`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tidesync_protocol::Frame;
use tokio::sync::mpsc;

/// Something that happened on an open socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// A text frame arrived.
    Frame(String),
    /// The socket closed or failed.
    Closed {
        /// Close reason.
        reason: String,
    },
}

/// Outgoing half of an open socket.
///
/// `send` must not block; implementations buffer internally.
pub trait FrameSink: Send + Sync {
    /// Sends one text frame.
    fn send(&self, text: String) -> Result<(), String>;

    /// Closes the socket. Idempotent.
    fn close(&self);
}

/// An open socket.
pub struct Connection {
    /// Outgoing half.
    pub sink: Box<dyn FrameSink>,
    /// Incoming events. The channel closing counts as a close event.
    pub events: mpsc::UnboundedReceiver<SocketEvent>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Opens sockets.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connects to `url`, authenticating with `token`.
    async fn dial(&self, url: &str, token: &str) -> Result<Connection, String>;
}

type Responder = Arc<dyn Fn(&Frame) -> Option<Frame> + Send + Sync>;

struct PeerState {
    generation: u64,
    events: Option<mpsc::UnboundedSender<SocketEvent>>,
    sent: Vec<String>,
    dials: usize,
    last_token: Option<String>,
    refuse_dials: bool,
    failing_sends: usize,
    client_closes: usize,
    auto_heartbeat: bool,
    responder: Option<Responder>,
}

impl PeerState {
    fn new() -> Self {
        Self {
            generation: 0,
            events: None,
            sent: Vec::new(),
            dials: 0,
            last_token: None,
            refuse_dials: false,
            failing_sends: 0,
            client_closes: 0,
            auto_heartbeat: true,
            responder: None,
        }
    }
}

/// In-memory dialer connected to a [`RemotePeer`].
#[derive(Clone)]
pub struct MemoryDialer {
    state: Arc<Mutex<PeerState>>,
}

impl fmt::Debug for MemoryDialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryDialer").finish_non_exhaustive()
    }
}

impl MemoryDialer {
    /// Creates a dialer and the peer playing the server side.
    pub fn pair() -> (MemoryDialer, RemotePeer) {
        let state = Arc::new(Mutex::new(PeerState::new()));
        (
            MemoryDialer {
                state: Arc::clone(&state),
            },
            RemotePeer { state },
        )
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self, _url: &str, token: &str) -> Result<Connection, String> {
        let mut state = self.state.lock();
        state.dials += 1;
        state.last_token = Some(token.to_string());
        if state.refuse_dials {
            return Err("connection refused".into());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.generation += 1;
        state.events = Some(tx);
        Ok(Connection {
            sink: Box::new(MemorySink {
                state: Arc::clone(&self.state),
                generation: state.generation,
            }),
            events: rx,
        })
    }
}

struct MemorySink {
    state: Arc<Mutex<PeerState>>,
    generation: u64,
}

impl FrameSink for MemorySink {
    fn send(&self, text: String) -> Result<(), String> {
        let (events, auto_heartbeat, responder) = {
            let mut state = self.state.lock();
            if state.generation != self.generation || state.events.is_none() {
                return Err("socket closed".into());
            }
            if state.failing_sends > 0 {
                state.failing_sends -= 1;
                return Err("send failed".into());
            }
            state.sent.push(text.clone());
            (
                state.events.clone(),
                state.auto_heartbeat,
                state.responder.clone(),
            )
        };

        // Replies are produced outside the lock so responders may inspect the peer.
        let reply = match Frame::decode(&text) {
            Ok(Frame::Heartbeat { timestamp }) if auto_heartbeat => {
                Some(Frame::HeartbeatResponse {
                    timestamp: Some(timestamp),
                })
            }
            Ok(frame) => responder.and_then(|responder| responder(&frame)),
            Err(_) => None,
        };
        if let (Some(events), Some(reply)) = (events, reply) {
            if let Ok(text) = reply.encode() {
                let _ = events.send(SocketEvent::Frame(text));
            }
        }
        Ok(())
    }

    fn close(&self) {
        let mut state = self.state.lock();
        if state.generation == self.generation && state.events.take().is_some() {
            state.client_closes += 1;
        }
    }
}

/// The server side of a [`MemoryDialer`] connection.
///
/// Heartbeats are answered automatically unless disabled. A responder can
/// be installed to answer requests as they are sent.
#[derive(Clone)]
pub struct RemotePeer {
    state: Arc<Mutex<PeerState>>,
}

impl fmt::Debug for RemotePeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemotePeer").finish_non_exhaustive()
    }
}

impl RemotePeer {
    /// Returns true while a connection is open.
    pub fn is_connected(&self) -> bool {
        self.state.lock().events.is_some()
    }

    /// Number of dial attempts seen, successful or not.
    pub fn dial_count(&self) -> usize {
        self.state.lock().dials
    }

    /// Token presented on the last dial.
    pub fn last_token(&self) -> Option<String> {
        self.state.lock().last_token.clone()
    }

    /// Number of connections the client closed itself.
    pub fn client_closes(&self) -> usize {
        self.state.lock().client_closes
    }

    /// Every text frame received, across connections.
    pub fn sent(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    /// Every decodable frame received, across connections.
    pub fn sent_frames(&self) -> Vec<Frame> {
        self.state
            .lock()
            .sent
            .iter()
            .filter_map(|text| Frame::decode(text).ok())
            .collect()
    }

    /// Received frames of one `type`.
    pub fn sent_of_kind(&self, kind: &str) -> Vec<Frame> {
        self.sent_frames()
            .into_iter()
            .filter(|frame| frame.kind() == kind)
            .collect()
    }

    /// Makes subsequent dials fail (or succeed again).
    pub fn refuse_dials(&self, refuse: bool) {
        self.state.lock().refuse_dials = refuse;
    }

    /// Makes the next `count` sends fail.
    pub fn fail_next_sends(&self, count: usize) {
        self.state.lock().failing_sends = count;
    }

    /// Enables or disables automatic heartbeat answers.
    pub fn set_auto_heartbeat(&self, enabled: bool) {
        self.state.lock().auto_heartbeat = enabled;
    }

    /// Installs a function answering received frames.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&Frame) -> Option<Frame> + Send + Sync + 'static,
    {
        self.state.lock().responder = Some(Arc::new(responder));
    }

    /// Delivers a frame to the client. Returns false if nothing is connected.
    pub fn inject(&self, frame: &Frame) -> bool {
        match frame.encode() {
            Ok(text) => self.inject_raw(text),
            Err(_) => false,
        }
    }

    /// Delivers raw text to the client.
    pub fn inject_raw(&self, text: impl Into<String>) -> bool {
        match &self.state.lock().events {
            Some(events) => events.send(SocketEvent::Frame(text.into())).is_ok(),
            None => false,
        }
    }

    /// Closes the connection from the server side.
    pub fn close(&self, reason: &str) {
        if let Some(events) = self.state.lock().events.take() {
            let _ = events.send(SocketEvent::Closed {
                reason: reason.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn dial_send_and_receive() {
        let (dialer, peer) = MemoryDialer::pair();
        let mut conn = dialer.dial("wss://x", "tok").await.unwrap();
        assert!(peer.is_connected());
        assert_eq!(peer.last_token().as_deref(), Some("tok"));

        conn.sink.send(r#"{"type":"subscribe","entityType":"task"}"#.into()).unwrap();
        assert_eq!(peer.sent_of_kind("subscribe").len(), 1);

        assert!(peer.inject(&Frame::Delete {
            entity_type: "task".into(),
            entity_id: "t1".into(),
        }));
        match conn.events.recv().await.unwrap() {
            SocketEvent::Frame(text) => assert!(text.contains("\"delete\"")),
            other => panic!("unexpected event {other:?}"),
        }

        peer.close("bye");
        assert_eq!(
            conn.events.recv().await.unwrap(),
            SocketEvent::Closed {
                reason: "bye".into()
            }
        );
        assert!(conn.events.recv().await.is_none());
        assert!(conn.sink.send("late".into()).is_err());
    }

    #[tokio::test]
    async fn heartbeats_are_answered() {
        let (dialer, _peer) = MemoryDialer::pair();
        let mut conn = dialer.dial("wss://x", "tok").await.unwrap();
        let heartbeat = Frame::Heartbeat {
            timestamp: Utc.timestamp_opt(5, 0).unwrap(),
        };
        conn.sink.send(heartbeat.encode().unwrap()).unwrap();

        let SocketEvent::Frame(text) = conn.events.recv().await.unwrap() else {
            panic!("expected frame");
        };
        assert_eq!(Frame::decode(&text).unwrap().kind(), "heartbeat_response");
    }

    #[tokio::test]
    async fn refused_dials_and_failing_sends() {
        let (dialer, peer) = MemoryDialer::pair();
        peer.refuse_dials(true);
        assert!(dialer.dial("wss://x", "tok").await.is_err());
        peer.refuse_dials(false);

        let conn = dialer.dial("wss://x", "tok").await.unwrap();
        peer.fail_next_sends(1);
        assert!(conn.sink.send("a".into()).is_err());
        assert!(conn.sink.send("b".into()).is_ok());
        assert_eq!(peer.sent(), ["b"]);
        assert_eq!(peer.dial_count(), 2);

        conn.sink.close();
        conn.sink.close();
        assert_eq!(peer.client_closes(), 1);
        assert!(!peer.is_connected());
    }

    #[tokio::test]
    async fn stale_sink_cannot_send_on_new_connection() {
        let (dialer, peer) = MemoryDialer::pair();
        let old = dialer.dial("wss://x", "tok").await.unwrap();
        let _new = dialer.dial("wss://x", "tok").await.unwrap();

        assert!(old.sink.send("x".into()).is_err());
        old.sink.close();
        assert!(peer.is_connected());
    }
}
