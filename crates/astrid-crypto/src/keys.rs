// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Keypair management and agent-address derivation.
//!
//! Agent keys and network peer keys share one provider
//! ([`libp2p::identity`]) so a single keypair format covers both. Keys are
//! persisted in libp2p's protobuf encoding; a file that cannot be decoded is
//! a hard error rather than a silently regenerated identity, because a
//! rotated key changes the agent address without anything else noticing.

use std::{fmt, fs, path::Path, str::FromStr, sync::OnceLock};

use libp2p::identity::{self, Keypair, PublicKey};
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::error::CryptoError;

/// Named curve under which an agent keypair was generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerId {
    Ed25519,
    Secp256k1,
}

impl LedgerId {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerId::Ed25519 => "ed25519",
            LedgerId::Secp256k1 => "secp256k1",
        }
    }
}

impl fmt::Display for LedgerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerId {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ed25519" => Ok(LedgerId::Ed25519),
            "secp256k1" => Ok(LedgerId::Secp256k1),
            other => Err(CryptoError::UnknownLedger(other.to_string())),
        }
    }
}

/// Environment variable holding the private-key path for `ledger_id`,
/// e.g. `AEA_PRIVATE_KEY_PATH_ED25519`.
pub fn private_key_env_var(ledger_id: LedgerId) -> String {
    format!("AEA_PRIVATE_KEY_PATH_{}", ledger_id.as_str().to_uppercase())
}

// ── Addresses ─────────────────────────────────────────────────────────────────

const ADDRESS_PREFIX: &str = "aa1";

fn address_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^aa1[0-9a-f]{40}$").expect("static regex"))
}

/// An agent address: `aa1` followed by 40 hex chars of the public-key hash.
///
/// Construction always validates, so holding an `Address` means holding a
/// well-formed one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(String);

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `true` when `s` matches the address shape without allocating.
    pub fn is_valid(s: &str) -> bool {
        address_regex().is_match(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if Address::is_valid(s) {
            Ok(Address(s.to_string()))
        } else {
            Err(CryptoError::InvalidAddress(s.to_string()))
        }
    }
}

/// Derive the agent address for a public key: `aa1` plus the hex encoding of
/// the first 20 bytes of `sha256(protobuf(public_key))`.
pub fn derive_address(public_key: &PublicKey) -> Address {
    let digest = Sha256::digest(public_key.encode_protobuf());
    Address(format!("{ADDRESS_PREFIX}{}", hex::encode(&digest[..20])))
}

/// Verify `signature` over `message` with `public_key`.
pub fn verify(public_key: &PublicKey, message: &[u8], signature: &[u8]) -> bool {
    public_key.verify(message, signature)
}

// ── Crypto provider ───────────────────────────────────────────────────────────

/// A keypair bound to its ledger and derived address.
#[derive(Clone)]
pub struct Crypto {
    keypair: Keypair,
    ledger_id: LedgerId,
    address: Address,
}

impl fmt::Debug for Crypto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Crypto")
            .field("ledger_id", &self.ledger_id)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl Crypto {
    /// Generate a fresh keypair under `ledger_id`.
    pub fn generate(ledger_id: LedgerId) -> Self {
        let keypair = match ledger_id {
            LedgerId::Ed25519 => Keypair::generate_ed25519(),
            LedgerId::Secp256k1 => Keypair::generate_secp256k1(),
        };
        let address = derive_address(&keypair.public());
        Self {
            keypair,
            ledger_id,
            address,
        }
    }

    /// Wrap an existing keypair, inferring the ledger from the key type.
    pub fn from_keypair(keypair: Keypair) -> Result<Self, CryptoError> {
        let ledger_id = match keypair.key_type() {
            identity::KeyType::Ed25519 => LedgerId::Ed25519,
            identity::KeyType::Secp256k1 => LedgerId::Secp256k1,
            other => return Err(CryptoError::UnknownLedger(other.to_string())),
        };
        let address = derive_address(&keypair.public());
        Ok(Self {
            keypair,
            ledger_id,
            address,
        })
    }

    /// Load a protobuf-encoded keypair from `path` and require it to belong
    /// to `ledger_id`.
    pub fn load(path: &Path, ledger_id: LedgerId) -> Result<Self, CryptoError> {
        let raw = fs::read(path)?;
        let keypair = Keypair::from_protobuf_encoding(&raw).map_err(|e| {
            CryptoError::Keypair(format!(
                "key file '{}' could not be decoded: {e}. Delete the file to \
                 generate a new identity (this changes the agent address).",
                path.display()
            ))
        })?;
        let crypto = Self::from_keypair(keypair)?;
        if crypto.ledger_id != ledger_id {
            return Err(CryptoError::Keypair(format!(
                "key file '{}' holds a {} key, expected {ledger_id}",
                path.display(),
                crypto.ledger_id
            )));
        }
        Ok(crypto)
    }

    /// Load from the path named by `AEA_PRIVATE_KEY_PATH_<LEDGER>`, or
    /// `Ok(None)` when the variable is unset.
    pub fn load_from_env(ledger_id: LedgerId) -> Result<Option<Self>, CryptoError> {
        match std::env::var(private_key_env_var(ledger_id)) {
            Ok(path) => Self::load(Path::new(&path), ledger_id).map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Persist the keypair in protobuf encoding.
    pub fn save(&self, path: &Path) -> Result<(), CryptoError> {
        let raw = self
            .keypair
            .to_protobuf_encoding()
            .map_err(|e| CryptoError::Keypair(e.to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, raw)?;
        Ok(())
    }

    pub fn ledger_id(&self) -> LedgerId {
        self.ledger_id
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.keypair
            .sign(message)
            .map_err(|e| CryptoError::Signing(e.to_string()))
    }
}
