// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The envelope is the atomic unit of agent communication: a routed wrapper
//! carrying sender, destination, a protocol id, and an opaque payload whose
//! meaning only the named protocol's codec understands.
//!
//! This crate owns the canonical wire format (4-byte big-endian length prefix
//! followed by a protobuf payload), the [`registry::ProtocolRegistry`] that
//! maps protocol ids to codecs, and the built-in `default` protocol used for
//! error replies.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod registry;

pub use codec::{read_envelope, read_envelope_sync, write_envelope, write_envelope_sync};
pub use envelope::{ConnectionId, Envelope, EnvelopeContext, ProtocolId};
pub use error::EnvelopeError;
pub use registry::{
    default_protocol, DefaultMessage, ErrorCode, Message, ProtocolCodec, ProtocolRegistry,
};
