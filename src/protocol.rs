//! Wire format for the PairHub WebSocket protocol.
//!
//! Text frames carry JSON objects tagged with a `type` field. Control messages
//! are modeled as serde enums with `#[serde(tag = "type")]`; relay messages
//! (`signal` and the transfer family) are forwarded as raw [`serde_json::Value`]s
//! because the hub must preserve fields it does not understand.
//!
//! Binary frames carry a fixed routing header followed by an opaque payload,
//! decoded by [`RelayFrame`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::is_peer_id;

/// Transfer chunk size advertised to clients in `ws-config`.
pub const CHUNK_SIZE: u32 = 10_485_760;

/// Maximum number of parallel transfers advertised to clients.
pub const MAX_PARALLEL_TRANSFERS: u8 = 8;

/// The three room namespaces. The tag rides on every membership event so
/// clients can tell which of their room lists changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoomType {
    Ip,
    Secret,
    PublicId,
}

/// Display and device name pair derived for a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerName {
    pub display_name: String,
    pub device_name: String,
}

/// Public peer information broadcast to room members.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: String,
    pub name: PeerName,
    pub rtc_supported: bool,
}

/// Payload of the `ws-config` message pushed right after the upgrade.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WsConfig {
    /// Opaque ICE/TURN configuration blob, forwarded to clients unmodified.
    pub rtc_config: Value,
    pub ws_fallback: bool,
    pub chunk_size: u32,
    pub max_parallel_transfers: u8,
    pub disable_throttling: bool,
}

// ---------------------------------------------------------------------------
// Client -> Server control messages
// ---------------------------------------------------------------------------

/// Control messages sent from a client to the hub.
///
/// `signal` and the relay family are not listed here; they are routed from the
/// raw JSON value so unknown fields survive the trip to the recipient.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Disconnect,
    Pong,
    JoinIpRoom,
    #[serde(rename_all = "camelCase")]
    RoomSecrets { room_secrets: Vec<String> },
    #[serde(rename_all = "camelCase")]
    RoomSecretsDeleted { room_secrets: Vec<String> },
    PairDeviceInitiate,
    #[serde(rename_all = "camelCase")]
    PairDeviceJoin { pair_key: String },
    PairDeviceCancel,
    #[serde(rename_all = "camelCase")]
    RegenerateRoomSecret { room_secret: String },
    CreatePublicRoom,
    #[serde(rename_all = "camelCase")]
    JoinPublicRoom {
        public_room_id: String,
        #[serde(default)]
        create_if_invalid: bool,
    },
    LeavePublicRoom,
}

// ---------------------------------------------------------------------------
// Server -> Client messages
// ---------------------------------------------------------------------------

/// Messages sent from the hub to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    WsConfig { ws_config: WsConfig },
    #[serde(rename_all = "camelCase")]
    DisplayName {
        display_name: String,
        device_name: String,
        peer_id: String,
        peer_id_hash: String,
    },
    Ping,
    #[serde(rename_all = "camelCase")]
    Peers {
        peers: Vec<PeerInfo>,
        room_type: RoomType,
        room_id: String,
    },
    #[serde(rename_all = "camelCase")]
    PeerJoined {
        peer: PeerInfo,
        room_type: RoomType,
        room_id: String,
    },
    #[serde(rename_all = "camelCase")]
    PeerLeft {
        peer_id: String,
        room_type: RoomType,
        room_id: String,
        disconnect: bool,
    },
    #[serde(rename_all = "camelCase")]
    PairDeviceInitiated {
        room_secret: String,
        pair_key: String,
    },
    #[serde(rename_all = "camelCase")]
    PairDeviceJoined { room_secret: String, peer_id: String },
    #[serde(rename_all = "camelCase")]
    PairDeviceCanceled { pair_key: String },
    PairDeviceJoinKeyInvalid,
    JoinKeyRateLimit,
    #[serde(rename_all = "camelCase")]
    SecretRoomDeleted { room_secret: String },
    #[serde(rename_all = "camelCase")]
    RoomSecretRegenerated {
        old_room_secret: String,
        new_room_secret: String,
    },
    #[serde(rename_all = "camelCase")]
    PublicRoomCreated { room_id: String },
    #[serde(rename_all = "camelCase")]
    PublicRoomIdInvalid { public_room_id: String },
    PublicRoomLeft,
}

// ---------------------------------------------------------------------------
// Relay routing
// ---------------------------------------------------------------------------

/// Message types relayed through the hub only when `wsFallback` is enabled.
pub const RELAY_TYPES: &[&str] = &[
    "request",
    "header",
    "partition",
    "partition-received",
    "progress",
    "files-transfer-response",
    "file-transfer-complete",
    "message-transfer-complete",
    "text",
    "display-name-changed",
    "ws-chunk",
    "ws-chunk-binary",
];

pub fn is_relay_type(msg_type: &str) -> bool {
    RELAY_TYPES.contains(&msg_type)
}

/// A room secret must be 64-256 characters of 7-bit ASCII.
pub fn is_valid_room_secret(secret: &str) -> bool {
    (64..=256).contains(&secret.len()) && secret.is_ascii()
}

/// A public room id is exactly 5 lowercase alphanumeric characters.
pub fn is_valid_public_room_id(room_id: &str) -> bool {
    room_id.len() == 5
        && room_id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

/// Length of the fixed routing header on binary frames.
pub const BINARY_HEADER_LEN: usize = 101;

const RECIPIENT_LEN: usize = 36;
const MARKER_OFFSET: usize = 36;
const SECRET_FIELD: std::ops::Range<usize> = 37..101;

/// Room selector carried in a binary frame's routing header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayRoom<'a> {
    /// Route through the sender's IP room.
    Ip,
    /// Route through the secret room named by the (trimmed) header field.
    Secret(&'a str),
}

/// A decoded binary relay frame. Borrows from the raw frame bytes; the
/// payload is never copied or inspected.
#[derive(Debug)]
pub struct RelayFrame<'a> {
    pub recipient_id: &'a str,
    pub room: RelayRoom<'a>,
    pub payload: &'a [u8],
}

impl<'a> RelayFrame<'a> {
    /// Decode the routing header. Returns `None` for frames that are too
    /// short, carry a malformed recipient id, or use an unknown room marker.
    pub fn parse(frame: &'a [u8]) -> Option<Self> {
        if frame.len() < BINARY_HEADER_LEN {
            return None;
        }
        let recipient_id = std::str::from_utf8(&frame[..RECIPIENT_LEN]).ok()?;
        if !is_peer_id(recipient_id) {
            return None;
        }
        let room = match frame[MARKER_OFFSET] {
            b'i' => RelayRoom::Ip,
            b's' => {
                let field = std::str::from_utf8(&frame[SECRET_FIELD]).ok()?;
                RelayRoom::Secret(field.trim_end_matches(|c| c == '\0' || c == ' '))
            }
            _ => return None,
        };
        Some(Self {
            recipient_id,
            room,
            payload: &frame[BINARY_HEADER_LEN..],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::mint_peer_id;

    #[test]
    fn deserialize_join_public_room() {
        let json = r#"{"type":"join-public-room","publicRoomId":"ab1cd","createIfInvalid":true}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::JoinPublicRoom {
                public_room_id,
                create_if_invalid,
            } => {
                assert_eq!(public_room_id, "ab1cd");
                assert!(create_if_invalid);
            }
            _ => panic!("expected JoinPublicRoom"),
        }
    }

    #[test]
    fn create_if_invalid_defaults_to_false() {
        let json = r#"{"type":"join-public-room","publicRoomId":"ab1cd"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::JoinPublicRoom {
                create_if_invalid, ..
            } => assert!(!create_if_invalid),
            _ => panic!("expected JoinPublicRoom"),
        }
    }

    #[test]
    fn deserialize_pair_device_join() {
        let json = r#"{"type":"pair-device-join","pairKey":"012345"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::PairDeviceJoin { pair_key } => assert_eq!(pair_key, "012345"),
            _ => panic!("expected PairDeviceJoin"),
        }
    }

    #[test]
    fn serialize_peer_joined() {
        let msg = ServerMessage::PeerJoined {
            peer: PeerInfo {
                id: "f47ac10b-58cc-4372-a567-0e02b2c3d479".into(),
                name: PeerName {
                    display_name: "Crimson Otter".into(),
                    device_name: "Mac Firefox".into(),
                },
                rtc_supported: true,
            },
            room_type: RoomType::PublicId,
            room_id: "ab1cd".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"peer-joined""#));
        assert!(json.contains(r#""roomType":"public-id""#));
        assert!(json.contains(r#""displayName":"Crimson Otter""#));
        assert!(json.contains(r#""rtcSupported":true"#));
    }

    #[test]
    fn serialize_peer_left() {
        let msg = ServerMessage::PeerLeft {
            peer_id: "f47ac10b-58cc-4372-a567-0e02b2c3d479".into(),
            room_type: RoomType::Ip,
            room_id: "10.0.0.1".into(),
            disconnect: true,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"peer-left""#));
        assert!(json.contains(r#""roomType":"ip""#));
        assert!(json.contains(r#""disconnect":true"#));
    }

    #[test]
    fn serialize_ws_config() {
        let msg = ServerMessage::WsConfig {
            ws_config: WsConfig {
                rtc_config: serde_json::json!({"iceServers": []}),
                ws_fallback: true,
                chunk_size: CHUNK_SIZE,
                max_parallel_transfers: MAX_PARALLEL_TRANSFERS,
                disable_throttling: true,
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"ws-config""#));
        assert!(json.contains(r#""chunkSize":10485760"#));
        assert!(json.contains(r#""maxParallelTransfers":8"#));
    }

    #[test]
    fn unit_messages_have_no_extra_fields() {
        let json = serde_json::to_string(&ServerMessage::PairDeviceJoinKeyInvalid).unwrap();
        assert_eq!(json, r#"{"type":"pair-device-join-key-invalid"}"#);
        let json = serde_json::to_string(&ServerMessage::JoinKeyRateLimit).unwrap();
        assert_eq!(json, r#"{"type":"join-key-rate-limit"}"#);
    }

    #[test]
    fn room_secret_validation_bounds() {
        assert!(!is_valid_room_secret(&"a".repeat(63)));
        assert!(is_valid_room_secret(&"a".repeat(64)));
        assert!(is_valid_room_secret(&"a".repeat(256)));
        assert!(!is_valid_room_secret(&"a".repeat(257)));
        assert!(!is_valid_room_secret(&"ä".repeat(64)));
    }

    #[test]
    fn public_room_id_validation() {
        assert!(is_valid_public_room_id("ab1cd"));
        assert!(!is_valid_public_room_id("AB1CD"));
        assert!(!is_valid_public_room_id("ab1c"));
        assert!(!is_valid_public_room_id("ab1cde"));
        assert!(!is_valid_public_room_id("ab-cd"));
    }

    #[test]
    fn relay_types_gated() {
        assert!(is_relay_type("ws-chunk"));
        assert!(is_relay_type("display-name-changed"));
        assert!(!is_relay_type("signal"));
        assert!(!is_relay_type("join-ip-room"));
    }

    fn binary_frame(recipient: &str, marker: u8, secret: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(recipient.as_bytes());
        frame.push(marker);
        let mut field = [0u8; 64];
        field[..secret.len()].copy_from_slice(secret);
        frame.extend_from_slice(&field);
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn parse_ip_relay_frame() {
        let recipient = mint_peer_id();
        let frame = binary_frame(&recipient, b'i', b"", b"HELLO");
        let parsed = RelayFrame::parse(&frame).unwrap();
        assert_eq!(parsed.recipient_id, recipient);
        assert_eq!(parsed.room, RelayRoom::Ip);
        assert_eq!(parsed.payload, b"HELLO");
    }

    #[test]
    fn parse_secret_relay_frame_trims_padding() {
        let recipient = mint_peer_id();
        let frame = binary_frame(&recipient, b's', b"sesame", b"payload");
        let parsed = RelayFrame::parse(&frame).unwrap();
        assert_eq!(parsed.room, RelayRoom::Secret("sesame"));
        assert_eq!(parsed.payload, b"payload");
    }

    #[test]
    fn reject_short_and_malformed_frames() {
        assert!(RelayFrame::parse(b"too short").is_none());
        let frame = binary_frame(&"x".repeat(36), b'i', b"", b"HELLO");
        assert!(RelayFrame::parse(&frame).is_none());
        let frame = binary_frame(&mint_peer_id(), b'x', b"", b"HELLO");
        assert!(RelayFrame::parse(&frame).is_none());
    }
}
