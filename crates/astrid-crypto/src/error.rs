// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid agent address: {0}")]
    InvalidAddress(String),

    #[error("unknown ledger id: {0}")]
    UnknownLedger(String),

    #[error("keypair error: {0}")]
    Keypair(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("record signature verification failed")]
    InvalidSignature,

    #[error("record address does not match its public key")]
    AddressMismatch,

    #[error("record representative key does not match the observed peer key")]
    RepresentativeMismatch,

    #[error("record not valid at {at}: window is [{not_before}, {not_after})")]
    OutsideValidityWindow {
        at: i64,
        not_before: i64,
        not_after: i64,
    },

    #[error("malformed record field: {0}")]
    MalformedRecord(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
