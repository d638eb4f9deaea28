// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Envelope and protocol-id types.

use std::{fmt, str::FromStr};

use astrid_crypto::Address;

use crate::error::EnvelopeError;

// ── Protocol ids ──────────────────────────────────────────────────────────────

/// Globally unique protocol identifier: `author/name/x.y.z`.
///
/// The author segment may be empty (`fipa/1.0.0` parses with an empty
/// author), and `Display` reproduces exactly the form that was parsed so a
/// protocol id string survives an encode/decode round trip byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolId {
    author: String,
    name: String,
    version: semver::Version,
}

impl ProtocolId {
    pub fn new(
        author: impl Into<String>,
        name: impl Into<String>,
        version: semver::Version,
    ) -> Self {
        Self {
            author: author.into(),
            name: name.into(),
            version,
        }
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &semver::Version {
        &self.version
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.author.is_empty() {
            write!(f, "{}/{}", self.name, self.version)
        } else {
            write!(f, "{}/{}/{}", self.author, self.name, self.version)
        }
    }
}

impl FromStr for ProtocolId {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        let (author, name, version) = match parts.as_slice() {
            [name, version] => ("", *name, *version),
            [author, name, version] => (*author, *name, *version),
            _ => return Err(EnvelopeError::InvalidProtocolId(s.to_string())),
        };
        if name.is_empty() {
            return Err(EnvelopeError::InvalidProtocolId(s.to_string()));
        }
        let version = semver::Version::parse(version)
            .map_err(|_| EnvelopeError::InvalidProtocolId(s.to_string()))?;
        Ok(Self {
            author: author.to_string(),
            name: name.to_string(),
            version,
        })
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// Identifier of a connection within the multiplexer, used in routing hints.
pub type ConnectionId = String;

/// Optional routing hints attached to an envelope. Only `uri` travels on the
/// wire; `connection_id` is meaningful to the local multiplexer alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvelopeContext {
    pub connection_id: Option<ConnectionId>,
    pub uri: Option<String>,
}

/// The routed message wrapper. All fields except `context` are required and
/// validated at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub to: Address,
    pub sender: Address,
    pub protocol_id: ProtocolId,
    pub message: Vec<u8>,
    pub context: Option<EnvelopeContext>,
}

impl Envelope {
    pub fn new(
        to: Address,
        sender: Address,
        protocol_id: ProtocolId,
        message: Vec<u8>,
    ) -> Self {
        Self {
            to,
            sender,
            protocol_id,
            message,
            context: None,
        }
    }

    pub fn with_context(mut self, context: EnvelopeContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Parse and validate raw string fields (as read off the wire).
    pub fn from_parts(
        to: &str,
        sender: &str,
        protocol_id: &str,
        message: Vec<u8>,
        uri: Option<String>,
    ) -> Result<Self, EnvelopeError> {
        if to.is_empty() {
            return Err(EnvelopeError::EmptyField("to"));
        }
        if sender.is_empty() {
            return Err(EnvelopeError::EmptyField("sender"));
        }
        let to = to.parse::<Address>().map_err(|_| EnvelopeError::InvalidAddress {
            field: "to",
            value: to.to_string(),
        })?;
        let sender = sender
            .parse::<Address>()
            .map_err(|_| EnvelopeError::InvalidAddress {
                field: "sender",
                value: sender.to_string(),
            })?;
        let protocol_id = protocol_id.parse::<ProtocolId>()?;
        let context = uri.filter(|u| !u.is_empty()).map(|uri| EnvelopeContext {
            connection_id: None,
            uri: Some(uri),
        });
        Ok(Self {
            to,
            sender,
            protocol_id,
            message,
            context,
        })
    }

    /// The uri hint, if any.
    pub fn uri(&self) -> Option<&str> {
        self.context.as_ref().and_then(|c| c.uri.as_deref())
    }

    /// The connection hint, if any.
    pub fn connection_id(&self) -> Option<&str> {
        self.context.as_ref().and_then(|c| c.connection_id.as_deref())
    }
}
