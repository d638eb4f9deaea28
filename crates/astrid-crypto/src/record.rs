// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Proof-of-representation records.
//!
//! An [`AgentRecord`] is created once at client startup and presented on
//! every peer handshake. The signed payload is rebuilt from the record's own
//! fields via its `message_format` template, so any holder of the record can
//! re-verify it without out-of-band context.

use chrono::{DateTime, Duration, Utc};
use libp2p::identity::PublicKey;

use crate::error::CryptoError;
use crate::keys::{derive_address, Address, Crypto, LedgerId};

/// Template for the signed payload. Placeholders are substituted from the
/// record: `{representative}` (hex of the representative public key),
/// `{not_before}` / `{not_after}` (unix seconds), `{ledger_id}`, and
/// `{identifier}` (the represented agent address).
pub const DEFAULT_MESSAGE_FORMAT: &str =
    "{representative}:{not_before}:{not_after}:{ledger_id}:{identifier}";

/// A signed authorization for one key to represent one agent address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRecord {
    pub address: Address,
    /// Protobuf encoding of the agent's own public key. The address is a
    /// hash, so verifiers need the key to ride along.
    pub public_key: Vec<u8>,
    /// Protobuf encoding of the authorized representative's public key.
    pub representative_public_key: Vec<u8>,
    /// Stored verbatim so the signed bytes are reconstructible forever,
    /// even if the default template changes.
    pub message_format: String,
    pub signature: Vec<u8>,
    pub ledger_id: LedgerId,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl AgentRecord {
    /// Create and sign a record authorizing `representative` to act for
    /// `crypto`'s address for the next `validity` period.
    pub fn new_signed(
        crypto: &Crypto,
        representative: &PublicKey,
        validity: Duration,
    ) -> Result<Self, CryptoError> {
        let not_before = Utc::now();
        let not_after = not_before + validity;
        let mut record = Self {
            address: crypto.address().clone(),
            public_key: crypto.public_key().encode_protobuf(),
            representative_public_key: representative.encode_protobuf(),
            message_format: DEFAULT_MESSAGE_FORMAT.to_string(),
            signature: Vec::new(),
            ledger_id: crypto.ledger_id(),
            not_before,
            not_after,
        };
        record.signature = crypto.sign(&record.signed_payload())?;
        Ok(record)
    }

    /// Render the byte string the signature covers.
    pub fn signed_payload(&self) -> Vec<u8> {
        self.message_format
            .replace(
                "{representative}",
                &hex::encode(&self.representative_public_key),
            )
            .replace("{not_before}", &self.not_before.timestamp().to_string())
            .replace("{not_after}", &self.not_after.timestamp().to_string())
            .replace("{ledger_id}", self.ledger_id.as_str())
            .replace("{identifier}", self.address.as_str())
            .into_bytes()
    }

    /// The agent's own public key, decoded.
    pub fn agent_public_key(&self) -> Result<PublicKey, CryptoError> {
        PublicKey::try_decode_protobuf(&self.public_key)
            .map_err(|e| CryptoError::MalformedRecord(format!("agent public key: {e}")))
    }

    /// The representative's public key, decoded.
    pub fn representative_key(&self) -> Result<PublicKey, CryptoError> {
        PublicKey::try_decode_protobuf(&self.representative_public_key)
            .map_err(|e| CryptoError::MalformedRecord(format!("representative key: {e}")))
    }

    /// Full proof-of-representation check at time `now`: the address must
    /// match the embedded public key, `now` must fall inside the validity
    /// window, and the signature must verify over [`Self::signed_payload`].
    pub fn verify(&self, now: DateTime<Utc>) -> Result<(), CryptoError> {
        let public_key = self.agent_public_key()?;
        if derive_address(&public_key) != self.address {
            return Err(CryptoError::AddressMismatch);
        }
        if now < self.not_before || now >= self.not_after {
            return Err(CryptoError::OutsideValidityWindow {
                at: now.timestamp(),
                not_before: self.not_before.timestamp(),
                not_after: self.not_after.timestamp(),
            });
        }
        if !public_key.verify(&self.signed_payload(), &self.signature) {
            return Err(CryptoError::InvalidSignature);
        }
        Ok(())
    }

    /// Check that the key observed on the transport is the one this record
    /// authorizes. Called by peers on every handshake, after [`Self::verify`].
    pub fn verify_representative(&self, observed: &PublicKey) -> Result<(), CryptoError> {
        if self.representative_public_key == observed.encode_protobuf() {
            Ok(())
        } else {
            Err(CryptoError::RepresentativeMismatch)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::identity::Keypair;

    fn record_pair() -> (Crypto, Keypair, AgentRecord) {
        let agent = Crypto::generate(LedgerId::Ed25519);
        let peer = Keypair::generate_ed25519();
        let record = AgentRecord::new_signed(&agent, &peer.public(), Duration::hours(1)).unwrap();
        (agent, peer, record)
    }

    #[test]
    fn valid_record_verifies() {
        let (_, peer, record) = record_pair();
        record.verify(Utc::now()).unwrap();
        record.verify_representative(&peer.public()).unwrap();
    }

    #[test]
    fn expired_record_rejected_even_with_valid_signature() {
        let (_, _, record) = record_pair();
        let after_expiry = record.not_after + Duration::seconds(1);
        assert!(matches!(
            record.verify(after_expiry),
            Err(CryptoError::OutsideValidityWindow { .. })
        ));
    }

    #[test]
    fn not_yet_valid_record_rejected() {
        let (_, _, record) = record_pair();
        let before = record.not_before - Duration::seconds(1);
        assert!(record.verify(before).is_err());
    }

    #[test]
    fn tampered_signature_rejected() {
        let (_, _, mut record) = record_pair();
        record.signature[0] ^= 0xff;
        assert!(matches!(
            record.verify(Utc::now()),
            Err(CryptoError::InvalidSignature)
        ));
    }

    #[test]
    fn tampered_window_invalidates_signature() {
        let (_, _, mut record) = record_pair();
        record.not_after = record.not_after + Duration::hours(24);
        assert!(matches!(
            record.verify(Utc::now()),
            Err(CryptoError::InvalidSignature)
        ));
    }

    #[test]
    fn wrong_representative_rejected() {
        let (_, _, record) = record_pair();
        let imposter = Keypair::generate_ed25519();
        assert!(matches!(
            record.verify_representative(&imposter.public()),
            Err(CryptoError::RepresentativeMismatch)
        ));
    }

    #[test]
    fn address_mismatch_rejected() {
        let (_, peer, mut record) = record_pair();
        let other = Crypto::generate(LedgerId::Ed25519);
        record.public_key = other.public_key().encode_protobuf();
        let _ = peer;
        assert!(matches!(
            record.verify(Utc::now()),
            Err(CryptoError::AddressMismatch)
        ));
    }
}
