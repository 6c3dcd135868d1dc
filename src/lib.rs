//! PairHub signaling and fallback-relay hub.
//!
//! Provides a reusable [`Hub`] that can be embedded inside a larger
//! application or run as a standalone binary. Peers connect over WebSocket,
//! discover each other through ip, secret and public rooms, exchange
//! negotiation messages, and, on fallback-enabled hubs, relay payload
//! traffic through the server when a direct connection is not possible.
//!
//! # Example
//!
//! ```rust,no_run
//! use pairhub::{config::HubConfig, Hub};
//! use std::net::SocketAddr;
//!
//! #[tokio::main]
//! async fn main() {
//!     let addr: SocketAddr = "0.0.0.0:3000".parse().unwrap();
//!     let hub = Hub::bind(addr, HubConfig::default()).await.unwrap();
//!     hub.run().await.unwrap();
//! }
//! ```

pub mod config;
pub mod identity;
pub mod pairing;
pub mod peer;
pub mod protocol;
pub mod room;
mod server;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info};

use config::HubConfig;
use server::HubState;

/// The signaling hub. Cheap to clone; clones share the listener and state.
#[derive(Clone)]
pub struct Hub {
    pub(crate) inner: Arc<HubInner>,
}

pub(crate) struct HubInner {
    pub(crate) listener: TcpListener,
    pub(crate) config: HubConfig,
    /// Process-lifetime salt for peer id hashing.
    pub(crate) salt: [u8; 32],
    /// The single serialization domain for rooms, peers and pair keys.
    pub(crate) state: Mutex<HubState>,
    /// Keep-alive supervisor handles, keyed by peer id. Lives outside the
    /// state lock so pong bookkeeping never contends with room mutations.
    pub(crate) keepalive: DashMap<String, JoinHandle<()>>,
}

impl Hub {
    /// Bind a hub to the given address. Pass port 0 to pick an ephemeral
    /// port, then read it back with [`Hub::local_addr`].
    pub async fn bind(addr: SocketAddr, mut config: HubConfig) -> io::Result<Self> {
        config.validate();
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            inner: Arc::new(HubInner {
                listener,
                config,
                salt: identity::new_salt(),
                state: Mutex::new(HubState::new()),
                keepalive: DashMap::new(),
            }),
        })
    }

    /// The address the hub is listening on.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.listener.local_addr()
    }

    /// Accept connections until the process is terminated. Only returns on a
    /// fatal listener error; per-connection failures are logged and skipped.
    pub async fn run(&self) -> io::Result<()> {
        info!(
            addr = %self.local_addr()?,
            ws_fallback = self.inner.config.ws_fallback,
            "hub listening"
        );
        loop {
            match self.inner.listener.accept().await {
                Ok((stream, addr)) => {
                    let hub = self.clone();
                    tokio::spawn(async move {
                        server::handle_connection(hub, stream, addr).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                }
            }
        }
    }

    /// Number of active rooms across all three namespaces.
    pub async fn room_count(&self) -> usize {
        self.inner.state.lock().await.registry.room_count()
    }

    /// Number of connected peers.
    pub async fn peer_count(&self) -> usize {
        self.inner.state.lock().await.peers.len()
    }
}
