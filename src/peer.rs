//! Per-connection peer handle and hub-side peer state.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::Message;
use tracing::error;

use crate::protocol::{PeerInfo, PeerName, ServerMessage};

/// Channel sender feeding a connection's writer task. All outbound frames for
/// a peer flow through this single channel, which keeps socket writes
/// serialized.
pub type PeerSender = mpsc::UnboundedSender<Message>;

struct PeerShared {
    id: String,
    ip: String,
    name: PeerName,
    rtc_supported: bool,
    sender: PeerSender,
    closed: Notify,
    last_beat: Mutex<Instant>,
}

/// A connected peer. Cheap to clone; clones share the connection handle.
///
/// Mutable bookkeeping (occupied rooms, pair key, rate bucket) lives in
/// [`PeerState`] under the hub's state lock, not here.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerShared>,
}

impl Peer {
    pub fn new(id: String, ip: String, name: PeerName, rtc_supported: bool, sender: PeerSender) -> Self {
        Self {
            inner: Arc::new(PeerShared {
                id,
                ip,
                name,
                rtc_supported,
                sender,
                closed: Notify::new(),
                last_beat: Mutex::new(Instant::now()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn ip(&self) -> &str {
        &self.inner.ip
    }

    pub fn name(&self) -> &PeerName {
        &self.inner.name
    }

    pub fn rtc_supported(&self) -> bool {
        self.inner.rtc_supported
    }

    /// Public projection broadcast to room members.
    pub fn get_info(&self) -> PeerInfo {
        PeerInfo {
            id: self.inner.id.clone(),
            name: self.inner.name.clone(),
            rtc_supported: self.inner.rtc_supported,
        }
    }

    /// Queue a control message. Sends to a gone peer are dropped silently.
    pub fn send(&self, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => {
                let _ = self.inner.sender.send(Message::Text(json));
            }
            Err(e) => error!(peer_id = %self.inner.id, error = %e, "failed to serialize message"),
        }
    }

    /// Queue a raw JSON value (the relay path, where unknown fields must
    /// survive untouched).
    pub fn send_raw(&self, message: &Value) {
        let _ = self.inner.sender.send(Message::Text(message.to_string()));
    }

    /// Queue an opaque binary payload.
    pub fn send_binary(&self, payload: Vec<u8>) {
        let _ = self.inner.sender.send(Message::Binary(payload));
    }

    /// Whether the connection can still accept frames.
    pub fn is_open(&self) -> bool {
        !self.inner.sender.is_closed()
    }

    /// Record a heartbeat acknowledgement.
    pub fn mark_beat(&self) {
        if let Ok(mut beat) = self.inner.last_beat.lock() {
            *beat = Instant::now();
        }
    }

    /// Time since the last `pong` (or since connect).
    pub fn beat_elapsed(&self) -> Duration {
        self.inner
            .last_beat
            .lock()
            .map(|beat| beat.elapsed())
            .unwrap_or_default()
    }

    /// Ask the connection tasks to tear the socket down. A close frame is
    /// queued behind any pending messages, so everything emitted before this
    /// call still reaches the wire.
    pub fn close(&self) {
        let _ = self.inner.sender.send(Message::Close(None));
        self.inner.closed.notify_one();
    }

    /// Resolves once [`Peer::close`] has been called.
    pub async fn closed(&self) {
        self.inner.closed.notified().await;
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.inner.id)
            .field("ip", &self.inner.ip)
            .field("rtc_supported", &self.inner.rtc_supported)
            .finish()
    }
}

/// Mutable per-peer bookkeeping owned by the hub state.
#[derive(Debug, Default)]
pub struct PeerState {
    /// Secret rooms this peer occupies, in insertion order, no duplicates.
    pub room_secrets: Vec<String>,
    /// At most one public room.
    pub public_room_id: Option<String>,
    /// At most one active pair key created by this peer.
    pub pair_key: Option<String>,
    /// Rolling-window limiter for join-family messages.
    pub rate: RateBucket,
}

/// Rolling-window rate limiter: at most `limit` hits per `window`.
#[derive(Debug, Default)]
pub struct RateBucket {
    hits: VecDeque<Instant>,
}

impl RateBucket {
    /// Record an attempt and report whether the bound was already exhausted.
    /// Attempts over the limit are not recorded, so a peer that keeps trying
    /// is readmitted once the window slides past its admitted hits.
    pub fn limit_reached(&mut self, limit: usize, window: Duration) -> bool {
        self.limit_reached_at(Instant::now(), limit, window)
    }

    fn limit_reached_at(&mut self, now: Instant, limit: usize, window: Duration) -> bool {
        while let Some(&front) = self.hits.front() {
            if now.duration_since(front) >= window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
        if self.hits.len() >= limit {
            return true;
        }
        self.hits.push_back(now);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_bucket_admits_up_to_limit() {
        let mut bucket = RateBucket::default();
        let now = Instant::now();
        let window = Duration::from_secs(10);
        for _ in 0..10 {
            assert!(!bucket.limit_reached_at(now, 10, window));
        }
        assert!(bucket.limit_reached_at(now, 10, window));
    }

    #[test]
    fn rate_bucket_window_slides() {
        let mut bucket = RateBucket::default();
        let start = Instant::now();
        let window = Duration::from_secs(10);
        for _ in 0..3 {
            assert!(!bucket.limit_reached_at(start, 3, window));
        }
        assert!(bucket.limit_reached_at(start + Duration::from_secs(5), 3, window));
        // all three admitted hits have aged out
        assert!(!bucket.limit_reached_at(start + Duration::from_secs(11), 3, window));
    }

    #[test]
    fn closed_channel_reports_not_open() {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Peer::new(
            crate::identity::mint_peer_id(),
            "127.0.0.1".into(),
            PeerName {
                display_name: "Quiet Lynx".into(),
                device_name: "Linux Firefox".into(),
            },
            true,
            tx,
        );
        assert!(peer.is_open());
        drop(rx);
        assert!(!peer.is_open());
    }
}
