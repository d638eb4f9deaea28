// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Agent identities and proof-of-representation records.
//!
//! An *agent address* is derived from a public key and is the only identifier
//! other agents ever see; the keypair behind it never leaves the local host.
//! An [`AgentRecord`] is a signed statement that a named *representative* key
//! (usually a network peer) is authorized to speak for an address within a
//! bounded validity window.

pub mod error;
pub mod keys;
pub mod record;

pub use error::CryptoError;
pub use keys::{derive_address, private_key_env_var, verify, Address, Crypto, LedgerId};
pub use record::{AgentRecord, DEFAULT_MESSAGE_FORMAT};

// Agent keys and network peer keys share one provider; re-export it so
// downstream crates need no direct libp2p dependency for key handling.
pub use libp2p::identity::{Keypair, PublicKey};
