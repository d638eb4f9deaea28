//! Peer configuration. Everything is passed explicitly; only logging reads
//! the environment.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use libp2p::Multiaddr;

use astrid_crypto::{Crypto, Keypair};

/// Operation deadlines. Defaults are sized for WAN round-trips.
#[derive(Debug, Clone, Copy)]
pub struct AcnTimeouts {
    /// Confirming bootstrap (notif round-trip) after connecting.
    pub bootstrap: Duration,
    /// Overall budget for one address resolution, all providers included.
    pub lookup: Duration,
    /// One DHT provider announcement call.
    pub store: Duration,
    /// Opening an outbound stream / dialing a resolved peer.
    pub stream_open: Duration,
    /// Client registration handshake (relay and delegate).
    pub registration: Duration,
}

impl Default for AcnTimeouts {
    fn default() -> Self {
        Self {
            bootstrap: Duration::from_secs(10),
            lookup: Duration::from_secs(20),
            store: Duration::from_secs(3),
            stream_open: Duration::from_secs(5),
            registration: Duration::from_secs(3),
        }
    }
}

/// Configuration for one [`crate::peer::AcnPeer`].
pub struct AcnConfig {
    /// Node identity; the peer id is derived from this key.
    pub keypair: Keypair,
    /// Agent identity represented by this node.
    pub crypto: Crypto,
    /// Local listen multiaddress.
    pub listen_addr: Multiaddr,
    /// Advertised multiaddress, when externally reachable.
    pub public_addr: Option<Multiaddr>,
    /// Bootstrap peers (multiaddresses carrying a `/p2p/` component).
    pub bootstrap: Vec<Multiaddr>,
    /// Run as a relay client of this node instead of announcing ourselves:
    /// the relay announces our address and all traffic goes through it.
    pub relay: Option<Multiaddr>,
    /// Bind address of the delegate TCP service, when enabled.
    pub delegate_addr: Option<SocketAddr>,
    /// Path of the persistent record store. Defaults to
    /// `./agent_records_store_<peer_id>`.
    pub store_path: Option<PathBuf>,
    /// Validity window of freshly signed agent records.
    pub record_validity: chrono::Duration,
    pub timeouts: AcnTimeouts,
    /// Capacity of the local inbound envelope queue.
    pub local_queue: usize,
    /// Local delivery retries while the agent is not yet attached.
    pub local_retries: u32,
    pub local_retry_delay: Duration,
}

impl AcnConfig {
    pub fn new(keypair: Keypair, crypto: Crypto) -> Self {
        Self {
            keypair,
            crypto,
            listen_addr: "/ip4/127.0.0.1/tcp/0".parse().expect("static multiaddr"),
            public_addr: None,
            bootstrap: Vec::new(),
            relay: None,
            delegate_addr: None,
            store_path: None,
            record_validity: chrono::Duration::hours(24),
            timeouts: AcnTimeouts::default(),
            local_queue: 256,
            local_retries: 10,
            local_retry_delay: Duration::from_millis(200),
        }
    }

    pub fn with_listen_addr(mut self, addr: Multiaddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_public_addr(mut self, addr: Multiaddr) -> Self {
        self.public_addr = Some(addr);
        self
    }

    pub fn with_bootstrap(mut self, peers: Vec<Multiaddr>) -> Self {
        self.bootstrap = peers;
        self
    }

    pub fn with_relay(mut self, relay: Multiaddr) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn with_delegate_addr(mut self, addr: SocketAddr) -> Self {
        self.delegate_addr = Some(addr);
        self
    }

    pub fn with_store_path(mut self, path: PathBuf) -> Self {
        self.store_path = Some(path);
        self
    }

    pub fn with_timeouts(mut self, timeouts: AcnTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}
