// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

use crate::envelope::ProtocolId;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("envelope field '{0}' must not be empty")]
    EmptyField(&'static str),

    #[error("invalid agent address in '{field}': {value}")]
    InvalidAddress { field: &'static str, value: String },

    #[error("invalid protocol id '{0}': expected author/name/x.y.z")]
    InvalidProtocolId(String),

    #[error("decoding error: {0}")]
    Decoding(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(ProtocolId),

    #[error("protocol already registered: {0}")]
    DuplicateProtocol(ProtocolId),

    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
