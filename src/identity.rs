//! Peer identity and naming.
//!
//! A peer's id is a UUID carried in the `peerid` cookie so it survives
//! reconnects; the hub mints one when the client has none. The display name
//! is derived deterministically from the id, the device name from the
//! User-Agent header, and the salted id hash uses a key drawn once per
//! process.

use std::net::SocketAddr;

use rand::RngCore;
use uuid::Uuid;

use crate::protocol::PeerName;

/// True if `value` is a canonically formatted (36-character, hyphenated) UUID.
pub fn is_peer_id(value: &str) -> bool {
    value.len() == 36 && Uuid::try_parse(value).is_ok()
}

/// Mint a fresh peer id.
pub fn mint_peer_id() -> String {
    Uuid::new_v4().to_string()
}

/// Extract a valid peer id from a `Cookie` request header, if present.
pub fn peer_id_from_cookie(header: Option<&str>) -> Option<String> {
    let header = header?;
    for pair in header.split(';') {
        let mut parts = pair.trim().splitn(2, '=');
        if parts.next() == Some("peerid") {
            if let Some(value) = parts.next() {
                if is_peer_id(value) {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

/// Resolve the peer's network address.
///
/// A configured reverse-proxy header takes precedence (first entry of a
/// comma-separated list); otherwise the socket address is used. Mapped IPv4
/// and IPv6 loopback are canonicalized so peers behind either stack land in
/// the same IP room.
pub fn resolve_ip(remote: SocketAddr, forwarded: Option<&str>) -> String {
    let raw = forwarded
        .map(|value| value.split(',').next().unwrap_or(value).trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| remote.ip().to_string());
    canonicalize_ip(raw)
}

fn canonicalize_ip(ip: String) -> String {
    let ip = match ip.strip_prefix("::ffff:") {
        Some(v4) => v4.to_string(),
        None => ip,
    };
    if ip == "::1" {
        "127.0.0.1".to_string()
    } else {
        ip
    }
}

/// Draw the process-lifetime salt for peer id hashing.
pub fn new_salt() -> [u8; 32] {
    let mut salt = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Salted hash of a peer id, stable for the process lifetime.
pub fn peer_id_hash(peer_id: &str, salt: &[u8; 32]) -> String {
    blake3::keyed_hash(salt, peer_id.as_bytes())
        .to_hex()
        .to_string()
}

/// Derive the `{displayName, deviceName}` pair for a peer.
pub fn derive_name(peer_id: &str, user_agent: &str) -> PeerName {
    PeerName {
        display_name: display_name_for(peer_id),
        device_name: device_name_for(user_agent),
    }
}

const ADJECTIVES: &[&str] = &[
    "Amber", "Azure", "Bold", "Bright", "Brisk", "Calm", "Cobalt", "Coral", "Crimson", "Daring",
    "Emerald", "Gentle", "Golden", "Ivory", "Jade", "Keen", "Lively", "Mellow", "Noble", "Olive",
    "Quiet", "Scarlet", "Silver", "Swift", "Teal", "Violet", "Vivid", "Witty",
];

const ANIMALS: &[&str] = &[
    "Badger", "Bison", "Crane", "Dolphin", "Falcon", "Ferret", "Fox", "Gecko", "Heron", "Ibex",
    "Jackal", "Koala", "Lemur", "Lynx", "Magpie", "Marten", "Mole", "Otter", "Owl", "Panda",
    "Raven", "Seal", "Stoat", "Swan", "Tapir", "Toucan", "Walrus", "Wren",
];

/// Deterministic adjective-animal name; the same id always maps to the same
/// name, with no dependence on the process salt.
fn display_name_for(peer_id: &str) -> String {
    let digest = blake3::hash(peer_id.as_bytes());
    let bytes = digest.as_bytes();
    let adjective = ADJECTIVES[bytes[0] as usize % ADJECTIVES.len()];
    let animal = ANIMALS[bytes[1] as usize % ANIMALS.len()];
    format!("{adjective} {animal}")
}

/// Coarse device classification from the User-Agent header.
fn device_name_for(user_agent: &str) -> String {
    let os = if user_agent.contains("Android") {
        Some("Android")
    } else if user_agent.contains("iPhone") {
        Some("iPhone")
    } else if user_agent.contains("iPad") {
        Some("iPad")
    } else if user_agent.contains("Windows") {
        Some("Windows")
    } else if user_agent.contains("Mac OS") || user_agent.contains("Macintosh") {
        Some("Mac")
    } else if user_agent.contains("CrOS") {
        Some("Chrome OS")
    } else if user_agent.contains("Linux") {
        Some("Linux")
    } else {
        None
    };
    let browser = if user_agent.contains("Firefox") {
        Some("Firefox")
    } else if user_agent.contains("Edg") {
        Some("Edge")
    } else if user_agent.contains("OPR") || user_agent.contains("Opera") {
        Some("Opera")
    } else if user_agent.contains("Chrome") {
        Some("Chrome")
    } else if user_agent.contains("Safari") {
        Some("Safari")
    } else {
        None
    };
    match (os, browser) {
        (Some(os), Some(browser)) => format!("{os} {browser}"),
        (Some(os), None) => os.to_string(),
        (None, Some(browser)) => browser.to_string(),
        (None, None) => "Unknown Device".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_ids_validate() {
        let id = mint_peer_id();
        assert_eq!(id.len(), 36);
        assert!(is_peer_id(&id));
        assert!(!is_peer_id("not-a-uuid"));
        // simple (unhyphenated) form is not accepted on the wire
        assert!(!is_peer_id(&id.replace('-', "")));
    }

    #[test]
    fn cookie_extraction() {
        let id = mint_peer_id();
        let header = format!("theme=dark; peerid={id}; lang=en");
        assert_eq!(peer_id_from_cookie(Some(&header)), Some(id));
        assert_eq!(peer_id_from_cookie(Some("peerid=bogus")), None);
        assert_eq!(peer_id_from_cookie(None), None);
    }

    #[test]
    fn forwarded_header_wins() {
        let remote: SocketAddr = "10.0.0.9:1234".parse().unwrap();
        assert_eq!(
            resolve_ip(remote, Some("203.0.113.7, 10.0.0.1")),
            "203.0.113.7"
        );
        assert_eq!(resolve_ip(remote, None), "10.0.0.9");
    }

    #[test]
    fn loopback_is_canonicalized() {
        let remote: SocketAddr = "[::1]:1234".parse().unwrap();
        assert_eq!(resolve_ip(remote, None), "127.0.0.1");
        assert_eq!(resolve_ip(remote, Some("::ffff:127.0.0.1")), "127.0.0.1");
        assert_eq!(resolve_ip(remote, Some("::ffff:192.0.2.4")), "192.0.2.4");
    }

    #[test]
    fn display_name_is_deterministic() {
        let id = mint_peer_id();
        let a = derive_name(&id, "");
        let b = derive_name(&id, "");
        assert_eq!(a.display_name, b.display_name);
        assert!(a.display_name.contains(' '));
    }

    #[test]
    fn device_name_from_user_agent() {
        let ua = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) Gecko/20100101 Firefox/119.0";
        assert_eq!(device_name_for(ua), "Mac Firefox");
        assert_eq!(device_name_for(""), "Unknown Device");
    }

    #[test]
    fn hash_depends_on_salt_but_not_time() {
        let id = mint_peer_id();
        let salt_a = new_salt();
        let salt_b = new_salt();
        assert_eq!(peer_id_hash(&id, &salt_a), peer_id_hash(&id, &salt_a));
        assert_ne!(peer_id_hash(&id, &salt_a), peer_id_hash(&id, &salt_b));
    }
}
