//! Agent communication network (ACN) peer.
//!
//! A libp2p overlay node that resolves agent addresses to network peers via
//! a Kademlia DHT, routes envelopes best-effort, announces NAT-bound relay
//! clients on their behalf, and accepts plain-TCP delegate clients that
//! cannot speak libp2p.
//!
//! Obtain an [`AcnHandle`] before calling [`AcnPeer::run`] so you can route
//! envelopes and take the inbound receiver while the event loop runs in a
//! spawned task.

pub mod behaviour;
pub mod codec;
pub mod config;
pub mod connection;
pub mod delegate;
pub mod error;
pub mod metrics;
pub mod peer;
pub mod proto;
pub mod store;

pub use config::{AcnConfig, AcnTimeouts};
pub use connection::{AcnConnection, DelegateConnection, DelegateFactory};
pub use delegate::DelegateClient;
pub use error::AcnError;
pub use metrics::Metrics;
pub use peer::{AcnHandle, AcnPeer};
pub use store::RecordStore;
