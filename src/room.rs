//! Room membership across the three namespaces.
//!
//! One map spans ip rooms (keyed by the peer's observed address), secret
//! rooms (64-256 character ASCII secrets) and public rooms (5-character
//! codes); the key shapes cannot collide. The registry keeps the peer-side
//! membership lists in [`PeerState`] in sync with the room map, so the
//! disconnect cascade can walk a peer's own lists without scanning rooms.

use std::collections::HashMap;

use tracing::debug;

use crate::peer::{Peer, PeerState};
use crate::protocol::{PeerInfo, RoomType, ServerMessage};

/// The three-namespace membership map: room id -> (peer id -> peer).
#[derive(Default)]
pub struct RoomRegistry {
    rooms: HashMap<String, HashMap<String, Peer>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer to a room.
    ///
    /// A peer already in the room is made to leave first, so observers of a
    /// reconnect always see `peer-left` before the fresh `peer-joined` and
    /// never a dangling `peer-left` afterwards. Existing occupants are
    /// notified and the joiner receives a `peers` snapshot *before* the
    /// membership insert, which keeps the joiner out of its own snapshot.
    pub fn join(&mut self, peer: &Peer, state: &mut PeerState, room_type: RoomType, room_id: &str) {
        if self.is_member(room_id, peer.id()) {
            self.leave(peer.id(), state, room_type, room_id, false);
        }

        let room = self.rooms.entry(room_id.to_string()).or_default();

        let joined = ServerMessage::PeerJoined {
            peer: peer.get_info(),
            room_type,
            room_id: room_id.to_string(),
        };
        for other in room.values() {
            other.send(&joined);
        }

        let peers: Vec<PeerInfo> = room.values().map(Peer::get_info).collect();
        peer.send(&ServerMessage::Peers {
            peers,
            room_type,
            room_id: room_id.to_string(),
        });

        room.insert(peer.id().to_string(), peer.clone());
        match room_type {
            RoomType::Ip => {}
            RoomType::Secret => {
                if !state.room_secrets.iter().any(|s| s == room_id) {
                    state.room_secrets.push(room_id.to_string());
                }
            }
            RoomType::PublicId => state.public_room_id = Some(room_id.to_string()),
        }

        debug!(peer_id = %peer.id(), room_type = ?room_type, room_id = %room_id, "peer joined room");
    }

    /// Remove a peer from a room. No-op if the peer is not a member.
    ///
    /// The room entry is deleted as soon as it empties; otherwise the
    /// remaining occupants receive `peer-left`.
    pub fn leave(
        &mut self,
        peer_id: &str,
        state: &mut PeerState,
        room_type: RoomType,
        room_id: &str,
        disconnect: bool,
    ) {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return;
        };
        if room.remove(peer_id).is_none() {
            return;
        }

        match room_type {
            RoomType::Ip => {}
            RoomType::Secret => state.room_secrets.retain(|s| s != room_id),
            RoomType::PublicId => {
                if state.public_room_id.as_deref() == Some(room_id) {
                    state.public_room_id = None;
                }
            }
        }

        debug!(peer_id = %peer_id, room_type = ?room_type, room_id = %room_id, "peer left room");

        if room.is_empty() {
            self.rooms.remove(room_id);
            return;
        }
        let left = ServerMessage::PeerLeft {
            peer_id: peer_id.to_string(),
            room_type,
            room_id: room_id.to_string(),
            disconnect,
        };
        for other in room.values() {
            other.send(&left);
        }
    }

    /// Drop a whole room without per-peer `peer-left` emissions. Used by
    /// secret regeneration, where every occupant is told about the new secret
    /// instead. Callers strip the peer-side lists themselves.
    pub fn remove_room(&mut self, room_id: &str) -> Option<HashMap<String, Peer>> {
        self.rooms.remove(room_id)
    }

    pub fn contains(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    pub fn is_member(&self, room_id: &str, peer_id: &str) -> bool {
        self.rooms
            .get(room_id)
            .is_some_and(|room| room.contains_key(peer_id))
    }

    /// Look up a peer in a specific room.
    pub fn find(&self, room_id: &str, peer_id: &str) -> Option<&Peer> {
        self.rooms.get(room_id)?.get(peer_id)
    }

    /// Snapshot of a room's occupants.
    pub fn occupants(&self, room_id: &str) -> Vec<Peer> {
        self.rooms
            .get(room_id)
            .map(|room| room.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
