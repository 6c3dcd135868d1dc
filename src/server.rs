//! Connection lifecycle, message dispatch and relaying.
//!
//! Each accepted TCP connection is upgraded to a WebSocket; the handshake
//! callback captures the identity cookie, User-Agent, forwarded header and
//! request path. A writer task owns the sink half so socket writes stay
//! serialized, and a keep-alive task pings the peer until it stops answering.
//!
//! All room, pairing and peer-state mutations happen under one state lock
//! and never across an await, so observers see a total order of events per
//! room.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SET_COOKIE;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::identity;
use crate::pairing;
use crate::peer::{Peer, PeerState};
use crate::protocol::{
    self, ClientMessage, RelayFrame, RelayRoom, RoomType, ServerMessage, WsConfig,
};
use crate::room::RoomRegistry;
use crate::Hub;

/// Maximum WebSocket payload the hub accepts.
const MAX_PAYLOAD_BYTES: usize = 100 * 1024 * 1024;

/// TCP keep-alive idle time. Liveness is detected by the application ping
/// supervisor; the socket option only reaps dead NAT mappings.
const TCP_KEEPALIVE_TIME: Duration = Duration::from_secs(10);

/// Everything behind the hub's state lock.
pub(crate) struct HubState {
    pub(crate) registry: RoomRegistry,
    pub(crate) peers: HashMap<String, PeerState>,
    pub(crate) pairs: pairing::PairDirectory,
}

impl HubState {
    pub(crate) fn new() -> Self {
        Self {
            registry: RoomRegistry::new(),
            peers: HashMap::new(),
            pairs: pairing::PairDirectory::default(),
        }
    }
}

/// Request data captured during the WebSocket handshake.
struct UpgradeInfo {
    peer_id: String,
    user_agent: String,
    forwarded: Option<String>,
    rtc_supported: bool,
}

/// Handle one incoming TCP connection: upgrade, register, read until close.
pub(crate) async fn handle_connection(hub: Hub, stream: TcpStream, addr: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(addr = %addr, error = %e, "failed to disable Nagle");
    }
    {
        let sock = socket2::SockRef::from(&stream);
        let keepalive = socket2::TcpKeepalive::new().with_time(TCP_KEEPALIVE_TIME);
        if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
            debug!(addr = %addr, error = %e, "failed to enable TCP keep-alive");
        }
    }

    // The handshake callback captures request headers; results are passed
    // out through a shared slot.
    let upgrade = Arc::new(StdMutex::new(None::<UpgradeInfo>));
    let callback = {
        let upgrade = upgrade.clone();
        let proxy_header = hub.inner.config.proxy_header.clone();
        move |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
            let headers = req.headers();
            let cookie = headers.get("cookie").and_then(|v| v.to_str().ok());
            let (peer_id, minted) = match identity::peer_id_from_cookie(cookie) {
                Some(id) => (id, false),
                None => (identity::mint_peer_id(), true),
            };
            if minted {
                // Hand the minted id back so the next connect reuses it.
                let cookie = format!("peerid={peer_id}; SameSite=Strict; Secure");
                if let Ok(value) = HeaderValue::from_str(&cookie) {
                    resp.headers_mut().append(SET_COOKIE, value);
                }
            }
            let user_agent = headers
                .get("user-agent")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let forwarded = proxy_header
                .as_deref()
                .and_then(|name| headers.get(name))
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let rtc_supported = req.uri().path().contains("webrtc");
            if let Ok(mut slot) = upgrade.lock() {
                *slot = Some(UpgradeInfo {
                    peer_id,
                    user_agent,
                    forwarded,
                    rtc_supported,
                });
            }
            Ok(resp)
        }
    };

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(MAX_PAYLOAD_BYTES);
    ws_config.max_frame_size = Some(MAX_PAYLOAD_BYTES);

    let ws_stream =
        match tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config))
            .await
        {
            Ok(ws) => ws,
            Err(e) => {
                debug!(addr = %addr, error = %e, "WebSocket handshake failed");
                return;
            }
        };

    let Some(info) = upgrade.lock().ok().and_then(|mut slot| slot.take()) else {
        debug!(addr = %addr, "handshake callback did not run");
        return;
    };

    let ip = identity::resolve_ip(addr, info.forwarded.as_deref());
    let name = identity::derive_name(&info.peer_id, &info.user_agent);

    let (mut ws_sink, mut ws_rx) = ws_stream.split();

    // Single writer per socket: every outbound frame goes through this task.
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let is_close = matches!(msg, Message::Close(_));
            if ws_sink.send(msg).await.is_err() {
                break;
            }
            if is_close {
                break;
            }
        }
    });

    let peer = Peer::new(info.peer_id, ip, name, info.rtc_supported, tx);
    info!(peer_id = %peer.id(), ip = %peer.ip(), "peer connected");
    hub.register(&peer).await;

    loop {
        tokio::select! {
            _ = peer.closed() => break,
            next = ws_rx.next() => match next {
                Some(Ok(Message::Text(text))) => hub.handle_text(&peer, &text).await,
                Some(Ok(Message::Binary(data))) => hub.handle_binary(&peer, &data).await,
                Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!(peer_id = %peer.id(), error = %e, "WebSocket error");
                    break;
                }
                None => break,
            }
        }
    }

    info!(peer_id = %peer.id(), "peer disconnected");
    hub.disconnect(&peer).await;
    write_task.abort();
}

impl Hub {
    /// Register a fresh peer: state entry, the two initial framed messages
    /// (`ws-config` then `display-name`), then the keep-alive supervisor.
    async fn register(&self, peer: &Peer) {
        {
            let mut guard = self.inner.state.lock().await;
            guard.peers.insert(peer.id().to_string(), PeerState::default());
        }

        let config = &self.inner.config;
        peer.send(&ServerMessage::WsConfig {
            ws_config: WsConfig {
                rtc_config: config.rtc_config.clone(),
                ws_fallback: config.ws_fallback,
                chunk_size: protocol::CHUNK_SIZE,
                max_parallel_transfers: protocol::MAX_PARALLEL_TRANSFERS,
                disable_throttling: true,
            },
        });
        peer.send(&ServerMessage::DisplayName {
            display_name: peer.name().display_name.clone(),
            device_name: peer.name().device_name.clone(),
            peer_id: peer.id().to_string(),
            peer_id_hash: identity::peer_id_hash(peer.id(), &self.inner.salt),
        });

        self.spawn_keepalive(peer);
    }

    /// Start the per-peer ping schedule. A peer that misses two consecutive
    /// periods is disconnected.
    fn spawn_keepalive(&self, peer: &Peer) {
        let hub = self.clone();
        let peer = peer.clone();
        let period = self.inner.config.keepalive_period();
        let peer_id = peer.id().to_string();
        let handle = tokio::spawn(async move {
            loop {
                if peer.beat_elapsed() > period * 2 {
                    warn!(peer_id = %peer.id(), "missed heartbeats, disconnecting");
                    hub.disconnect(&peer).await;
                    return;
                }
                peer.send(&ServerMessage::Ping);
                tokio::time::sleep(period).await;
            }
        });
        // A reconnect under the same id supersedes the old supervisor.
        if let Some(old) = self.inner.keepalive.insert(peer_id, handle) {
            old.abort();
        }
    }

    /// Cascading disconnect. Idempotent; every `peer-left` is emitted before
    /// the socket is torn down.
    pub(crate) async fn disconnect(&self, peer: &Peer) {
        let mut guard = self.inner.state.lock().await;
        let st = &mut *guard;
        let Some(mut state) = st.peers.remove(peer.id()) else {
            return;
        };

        if let Some(key) = state.pair_key.take() {
            st.pairs.remove(&key);
        }

        // No awaits follow in this scope, so aborting the supervisor is safe
        // even when the supervisor itself is the caller.
        if let Some((_, handle)) = self.inner.keepalive.remove(peer.id()) {
            handle.abort();
        }

        st.registry
            .leave(peer.id(), &mut state, RoomType::Ip, peer.ip(), true);
        for secret in std::mem::take(&mut state.room_secrets) {
            st.registry
                .leave(peer.id(), &mut state, RoomType::Secret, &secret, true);
        }
        if let Some(public_room_id) = state.public_room_id.take() {
            st.registry
                .leave(peer.id(), &mut state, RoomType::PublicId, &public_room_id, true);
        }
        drop(guard);

        peer.close();
        debug!(peer_id = %peer.id(), "disconnect cascade complete");
    }

    /// Dispatch one inbound text frame.
    pub(crate) async fn handle_text(&self, peer: &Peer, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                warn!(peer_id = %peer.id(), error = %e, "malformed message");
                return;
            }
        };
        let Some(msg_type) = value
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            warn!(peer_id = %peer.id(), "message without a type");
            return;
        };

        if msg_type == "signal" {
            self.signal_and_relay(peer, value).await;
            return;
        }
        if protocol::is_relay_type(&msg_type) {
            // Payload relaying is only available on fallback-enabled hubs.
            if self.inner.config.ws_fallback {
                self.signal_and_relay(peer, value).await;
            }
            return;
        }

        match serde_json::from_value::<ClientMessage>(value) {
            Ok(message) => self.handle_control(peer, message).await,
            Err(e) => debug!(peer_id = %peer.id(), msg_type = %msg_type, error = %e, "dropped message"),
        }
    }

    async fn handle_control(&self, peer: &Peer, message: ClientMessage) {
        let rate_limit = self.inner.config.rate_limit_attempts;
        let rate_window = self.inner.config.rate_window();

        match message {
            ClientMessage::Disconnect => self.disconnect(peer).await,
            ClientMessage::Pong => peer.mark_beat(),

            ClientMessage::JoinIpRoom => {
                let mut guard = self.inner.state.lock().await;
                let st = &mut *guard;
                if let Some(state) = st.peers.get_mut(peer.id()) {
                    st.registry.join(peer, state, RoomType::Ip, peer.ip());
                }
            }

            ClientMessage::RoomSecrets { room_secrets } => {
                let mut guard = self.inner.state.lock().await;
                let st = &mut *guard;
                let Some(state) = st.peers.get_mut(peer.id()) else {
                    return;
                };
                for secret in room_secrets
                    .iter()
                    .filter(|s| protocol::is_valid_room_secret(s))
                {
                    st.registry.join(peer, state, RoomType::Secret, secret);
                }
            }

            ClientMessage::RoomSecretsDeleted { room_secrets } => {
                let mut guard = self.inner.state.lock().await;
                let st = &mut *guard;
                for secret in &room_secrets {
                    let occupants = st.registry.occupants(secret);
                    for occupant in occupants {
                        if let Some(state) = st.peers.get_mut(occupant.id()) {
                            st.registry
                                .leave(occupant.id(), state, RoomType::Secret, secret, false);
                        }
                        occupant.send(&ServerMessage::SecretRoomDeleted {
                            room_secret: secret.clone(),
                        });
                    }
                }
            }

            ClientMessage::PairDeviceInitiate => {
                let mut guard = self.inner.state.lock().await;
                let st = &mut *guard;
                let Some(state) = st.peers.get_mut(peer.id()) else {
                    return;
                };
                // A new offer revokes any previous one by the same peer.
                if let Some(old_key) = state.pair_key.take() {
                    st.pairs.remove(&old_key);
                }
                let room_secret = pairing::mint_room_secret();
                let pair_key = st.pairs.allocate(room_secret.clone(), peer.clone());
                state.pair_key = Some(pair_key.clone());
                peer.send(&ServerMessage::PairDeviceInitiated {
                    room_secret: room_secret.clone(),
                    pair_key,
                });
                st.registry.join(peer, state, RoomType::Secret, &room_secret);
            }

            ClientMessage::PairDeviceJoin { pair_key } => {
                let mut guard = self.inner.state.lock().await;
                let st = &mut *guard;
                {
                    let Some(state) = st.peers.get_mut(peer.id()) else {
                        return;
                    };
                    if state.rate.limit_reached(rate_limit, rate_window) {
                        peer.send(&ServerMessage::JoinKeyRateLimit);
                        return;
                    }
                }
                // A creator cannot pair with itself; the key stays live.
                let usable = st
                    .pairs
                    .get(&pair_key)
                    .map(|entry| entry.creator.id() != peer.id());
                if usable != Some(true) {
                    peer.send(&ServerMessage::PairDeviceJoinKeyInvalid);
                    return;
                }
                let Some(entry) = st.pairs.remove(&pair_key) else {
                    return;
                };
                if let Some(creator_state) = st.peers.get_mut(entry.creator.id()) {
                    if creator_state.pair_key.as_deref() == Some(pair_key.as_str()) {
                        creator_state.pair_key = None;
                    }
                }
                entry.creator.send(&ServerMessage::PairDeviceJoined {
                    room_secret: entry.room_secret.clone(),
                    peer_id: peer.id().to_string(),
                });
                peer.send(&ServerMessage::PairDeviceJoined {
                    room_secret: entry.room_secret.clone(),
                    peer_id: entry.creator.id().to_string(),
                });
                if let Some(state) = st.peers.get_mut(peer.id()) {
                    st.registry
                        .join(peer, state, RoomType::Secret, &entry.room_secret);
                }
            }

            ClientMessage::PairDeviceCancel => {
                let mut guard = self.inner.state.lock().await;
                let st = &mut *guard;
                let Some(state) = st.peers.get_mut(peer.id()) else {
                    return;
                };
                if let Some(pair_key) = state.pair_key.take() {
                    st.pairs.remove(&pair_key);
                    peer.send(&ServerMessage::PairDeviceCanceled { pair_key });
                }
            }

            ClientMessage::RegenerateRoomSecret { room_secret } => {
                let mut guard = self.inner.state.lock().await;
                let st = &mut *guard;
                let Some(occupants) = st.registry.remove_room(&room_secret) else {
                    return;
                };
                let new_secret = pairing::mint_room_secret();
                // Occupants re-join with the new secret via a subsequent
                // room-secrets message; no room entry is created here.
                for occupant in occupants.values() {
                    occupant.send(&ServerMessage::RoomSecretRegenerated {
                        old_room_secret: room_secret.clone(),
                        new_room_secret: new_secret.clone(),
                    });
                    if let Some(state) = st.peers.get_mut(occupant.id()) {
                        state.room_secrets.retain(|s| s != &room_secret);
                    }
                }
            }

            ClientMessage::CreatePublicRoom => {
                let mut guard = self.inner.state.lock().await;
                let st = &mut *guard;
                let Some(state) = st.peers.get_mut(peer.id()) else {
                    return;
                };
                if let Some(current) = state.public_room_id.clone() {
                    st.registry
                        .leave(peer.id(), state, RoomType::PublicId, &current, false);
                }
                let room_id = loop {
                    let candidate = pairing::mint_public_room_id();
                    if !st.registry.contains(&candidate) {
                        break candidate;
                    }
                };
                peer.send(&ServerMessage::PublicRoomCreated {
                    room_id: room_id.clone(),
                });
                st.registry.join(peer, state, RoomType::PublicId, &room_id);
            }

            ClientMessage::JoinPublicRoom {
                public_room_id,
                create_if_invalid,
            } => {
                let mut guard = self.inner.state.lock().await;
                let st = &mut *guard;
                let Some(state) = st.peers.get_mut(peer.id()) else {
                    return;
                };
                if state.rate.limit_reached(rate_limit, rate_window) {
                    peer.send(&ServerMessage::JoinKeyRateLimit);
                    return;
                }
                let room_id = public_room_id.to_lowercase();
                if !protocol::is_valid_public_room_id(&room_id)
                    || (!st.registry.contains(&room_id) && !create_if_invalid)
                {
                    peer.send(&ServerMessage::PublicRoomIdInvalid {
                        public_room_id: room_id,
                    });
                    return;
                }
                if let Some(current) = state.public_room_id.clone() {
                    if current != room_id {
                        st.registry
                            .leave(peer.id(), state, RoomType::PublicId, &current, false);
                    }
                }
                st.registry.join(peer, state, RoomType::PublicId, &room_id);
            }

            ClientMessage::LeavePublicRoom => {
                let mut guard = self.inner.state.lock().await;
                let st = &mut *guard;
                let Some(state) = st.peers.get_mut(peer.id()) else {
                    return;
                };
                if let Some(current) = state.public_room_id.clone() {
                    st.registry
                        .leave(peer.id(), state, RoomType::PublicId, &current, false);
                }
                peer.send(&ServerMessage::PublicRoomLeft);
            }
        }
    }

    /// Forward a `signal` or relay-family message to its addressee, with the
    /// `to` field stripped and a `sender` tag attached. Every failure mode
    /// (missing room, missing recipient, malformed addressee) is a silent
    /// drop.
    async fn signal_and_relay(&self, peer: &Peer, mut message: Value) {
        let room_id = match message.get("roomType").and_then(Value::as_str) {
            Some("ip") => peer.ip().to_string(),
            _ => match message.get("roomId").and_then(Value::as_str) {
                Some(room_id) => room_id.to_string(),
                None => return,
            },
        };
        let Some(to) = message.get("to").and_then(Value::as_str).map(str::to_string) else {
            return;
        };
        if !identity::is_peer_id(&to) {
            return;
        }

        let recipient = {
            let guard = self.inner.state.lock().await;
            match guard.registry.find(&room_id, &to) {
                Some(recipient) => recipient.clone(),
                None => return,
            }
        };

        if let Some(object) = message.as_object_mut() {
            object.remove("to");
            object.insert(
                "sender".to_string(),
                json!({ "id": peer.id(), "rtcSupported": peer.rtc_supported() }),
            );
        }
        recipient.send_raw(&message);
    }

    /// Forward the payload of a binary frame to the recipient named in its
    /// routing header. Unconditionally dropped on non-fallback hubs.
    pub(crate) async fn handle_binary(&self, peer: &Peer, data: &[u8]) {
        if !self.inner.config.ws_fallback {
            return;
        }
        let Some(frame) = RelayFrame::parse(data) else {
            debug!(peer_id = %peer.id(), "dropped binary frame with bad routing header");
            return;
        };
        let room_id = match frame.room {
            RelayRoom::Ip => peer.ip(),
            RelayRoom::Secret(secret) => secret,
        };

        let guard = self.inner.state.lock().await;
        let Some(recipient) = guard.registry.find(room_id, frame.recipient_id) else {
            return;
        };
        if recipient.is_open() {
            recipient.send_binary(frame.payload.to_vec());
        }
    }
}
