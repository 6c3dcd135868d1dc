//! Device pairing: the short-lived key directory and secret minting.
//!
//! A pair key rendezvous two devices into a freshly minted long-lived room
//! secret. Keys are 6-digit decimal strings with leading zeros preserved;
//! the directory is the owner of each entry, while the creating peer holds
//! only the key string as a back-link.

use std::collections::HashMap;

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::peer::Peer;

/// Length of minted room secrets. Within the 64-256 range the hub accepts
/// from clients.
pub const ROOM_SECRET_LEN: usize = 256;

const PUBLIC_ROOM_ID_LEN: usize = 5;
const PUBLIC_ROOM_ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// A live pairing offer.
pub struct PairEntry {
    pub room_secret: String,
    pub creator: Peer,
}

/// Directory of active pair keys. Injective by construction: allocation
/// retries until it finds an unused key.
#[derive(Default)]
pub struct PairDirectory {
    entries: HashMap<String, PairEntry>,
}

impl PairDirectory {
    /// Allocate a fresh unique key for `(room_secret, creator)`.
    pub fn allocate(&mut self, room_secret: String, creator: Peer) -> String {
        let mut rng = rand::thread_rng();
        let key = loop {
            let candidate = format!("{:06}", rng.gen_range(0..1_000_000u32));
            if !self.entries.contains_key(&candidate) {
                break candidate;
            }
        };
        self.entries.insert(
            key.clone(),
            PairEntry {
                room_secret,
                creator,
            },
        );
        key
    }

    pub fn get(&self, key: &str) -> Option<&PairEntry> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<PairEntry> {
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Mint a new room secret from a cryptographic RNG.
pub fn mint_room_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ROOM_SECRET_LEN)
        .map(char::from)
        .collect()
}

/// Mint a candidate public room id. Callers loop until the id is free in the
/// registry.
pub fn mint_public_room_id() -> String {
    let mut rng = rand::thread_rng();
    (0..PUBLIC_ROOM_ID_LEN)
        .map(|_| {
            let index = rng.gen_range(0..PUBLIC_ROOM_ID_CHARSET.len());
            PUBLIC_ROOM_ID_CHARSET[index] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::mint_peer_id;
    use crate::protocol::{is_valid_public_room_id, is_valid_room_secret, PeerName};
    use tokio::sync::mpsc;

    fn test_peer() -> Peer {
        let (tx, _rx) = mpsc::unbounded_channel();
        Peer::new(
            mint_peer_id(),
            "10.0.0.1".into(),
            PeerName {
                display_name: "Quiet Lynx".into(),
                device_name: "Linux Firefox".into(),
            },
            true,
            tx,
        )
    }

    #[test]
    fn keys_are_six_decimal_digits() {
        let mut directory = PairDirectory::default();
        for _ in 0..32 {
            let key = directory.allocate(mint_room_secret(), test_peer());
            assert_eq!(key.len(), 6);
            assert!(key.bytes().all(|b| b.is_ascii_digit()));
        }
    }

    #[test]
    fn allocation_never_duplicates() {
        let mut directory = PairDirectory::default();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..256 {
            let key = directory.allocate(mint_room_secret(), test_peer());
            assert!(seen.insert(key));
        }
        assert_eq!(directory.len(), 256);
    }

    #[test]
    fn remove_frees_the_key() {
        let mut directory = PairDirectory::default();
        let key = directory.allocate(mint_room_secret(), test_peer());
        assert!(directory.contains(&key));
        let entry = directory.remove(&key).unwrap();
        assert!(!directory.contains(&key));
        assert!(is_valid_room_secret(&entry.room_secret));
    }

    #[test]
    fn minted_secrets_and_ids_validate() {
        let secret = mint_room_secret();
        assert_eq!(secret.len(), ROOM_SECRET_LEN);
        assert!(is_valid_room_secret(&secret));

        let room_id = mint_public_room_id();
        assert!(is_valid_public_room_id(&room_id));
    }
}
