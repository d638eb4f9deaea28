// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Protocol registry: maps protocol ids to pluggable message codecs.
//!
//! The runtime core treats message payloads as opaque bytes; a
//! [`ProtocolCodec`] is the only component that understands them. Concrete
//! protocol packages register their codec here and handlers receive the
//! decoded [`Message`] values.

use std::{any::Any, collections::HashMap, fmt, sync::Arc};

use prost::Message as _;

use crate::envelope::ProtocolId;
use crate::error::EnvelopeError;

// ── Decoded messages ──────────────────────────────────────────────────────────

/// A decoded protocol message. Handlers downcast to the concrete type of the
/// protocol they are bound to.
pub trait Message: fmt::Debug + Send + Sync + 'static {
    /// The performative (speech act) this message carries.
    fn performative(&self) -> &str;

    fn as_any(&self) -> &dyn Any;
}

impl dyn Message {
    /// Downcast to a concrete message type.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

// ── Codec capability ──────────────────────────────────────────────────────────

/// Encode/decode capability for exactly one protocol.
pub trait ProtocolCodec: Send + Sync {
    fn protocol_id(&self) -> &ProtocolId;

    /// Decode payload bytes into a message. Fails with
    /// [`EnvelopeError::Decoding`] when the bytes do not conform.
    fn decode(&self, bytes: &[u8]) -> Result<Box<dyn Message>, EnvelopeError>;

    fn encode(&self, message: &dyn Message) -> Result<Vec<u8>, EnvelopeError>;

    /// The set of performatives this protocol defines.
    fn performatives(&self) -> &[&'static str];
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Registry of protocol codecs, keyed by protocol id.
#[derive(Default)]
pub struct ProtocolRegistry {
    codecs: HashMap<ProtocolId, Arc<dyn ProtocolCodec>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in `default` protocol already present.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register(Arc::new(default_protocol::DefaultCodec))
            .expect("empty registry accepts the default codec");
        registry
    }

    /// Register a codec. Protocol ids are globally unique, so a second
    /// registration under the same id is refused.
    pub fn register(&mut self, codec: Arc<dyn ProtocolCodec>) -> Result<(), EnvelopeError> {
        let id = codec.protocol_id().clone();
        if self.codecs.contains_key(&id) {
            return Err(EnvelopeError::DuplicateProtocol(id));
        }
        self.codecs.insert(id, codec);
        Ok(())
    }

    /// Look up the codec for `id`, failing with
    /// [`EnvelopeError::UnsupportedProtocol`] when none is registered.
    pub fn lookup(&self, id: &ProtocolId) -> Result<Arc<dyn ProtocolCodec>, EnvelopeError> {
        self.codecs
            .get(id)
            .cloned()
            .ok_or_else(|| EnvelopeError::UnsupportedProtocol(id.clone()))
    }

    pub fn is_registered(&self, id: &ProtocolId) -> bool {
        self.codecs.contains_key(id)
    }

    pub fn protocol_ids(&self) -> impl Iterator<Item = &ProtocolId> {
        self.codecs.keys()
    }
}

// ── Built-in default protocol ─────────────────────────────────────────────────

/// The `default` protocol: plain byte payloads plus the error performative
/// the runtime's error handler speaks.
pub mod default_protocol {
    use super::*;

    pub const PERFORMATIVE_BYTES: &str = "bytes";
    pub const PERFORMATIVE_ERROR: &str = "error";

    /// `astrid/default/1.0.0`.
    pub fn id() -> ProtocolId {
        ProtocolId::new("astrid", "default", semver::Version::new(1, 0, 0))
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    struct DefaultProto {
        #[prost(string, tag = "1")]
        performative: String,
        #[prost(bytes = "vec", tag = "2")]
        content: Vec<u8>,
        #[prost(int32, tag = "3")]
        error_code: i32,
        #[prost(string, tag = "4")]
        error_msg: String,
    }

    /// Failure codes carried by the error performative.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ErrorCode {
        UnsupportedProtocol,
        DecodingError,
        NoActiveHandler,
        InternalError,
    }

    impl ErrorCode {
        fn from_i32(v: i32) -> Result<Self, EnvelopeError> {
            match v {
                0 => Ok(ErrorCode::UnsupportedProtocol),
                1 => Ok(ErrorCode::DecodingError),
                2 => Ok(ErrorCode::NoActiveHandler),
                3 => Ok(ErrorCode::InternalError),
                other => Err(EnvelopeError::Decoding(format!(
                    "unknown error code {other}"
                ))),
            }
        }

        fn as_i32(self) -> i32 {
            match self {
                ErrorCode::UnsupportedProtocol => 0,
                ErrorCode::DecodingError => 1,
                ErrorCode::NoActiveHandler => 2,
                ErrorCode::InternalError => 3,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum DefaultMessage {
        /// An opaque byte payload.
        Bytes { content: Vec<u8> },
        /// A failure reply echoing the original payload back to the sender.
        Error {
            code: ErrorCode,
            message: String,
            original: Vec<u8>,
        },
    }

    impl Message for DefaultMessage {
        fn performative(&self) -> &str {
            match self {
                DefaultMessage::Bytes { .. } => PERFORMATIVE_BYTES,
                DefaultMessage::Error { .. } => PERFORMATIVE_ERROR,
            }
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    pub struct DefaultCodec;

    impl DefaultCodec {
        fn id_static() -> &'static ProtocolId {
            static ID: std::sync::OnceLock<ProtocolId> = std::sync::OnceLock::new();
            ID.get_or_init(id)
        }
    }

    impl ProtocolCodec for DefaultCodec {
        fn protocol_id(&self) -> &ProtocolId {
            Self::id_static()
        }

        fn decode(&self, bytes: &[u8]) -> Result<Box<dyn Message>, EnvelopeError> {
            let proto = DefaultProto::decode(bytes)
                .map_err(|e| EnvelopeError::Decoding(e.to_string()))?;
            let message = match proto.performative.as_str() {
                PERFORMATIVE_BYTES => DefaultMessage::Bytes {
                    content: proto.content,
                },
                PERFORMATIVE_ERROR => DefaultMessage::Error {
                    code: ErrorCode::from_i32(proto.error_code)?,
                    message: proto.error_msg,
                    original: proto.content,
                },
                other => {
                    return Err(EnvelopeError::Decoding(format!(
                        "unknown performative {other:?}"
                    )))
                }
            };
            Ok(Box::new(message))
        }

        fn encode(&self, message: &dyn Message) -> Result<Vec<u8>, EnvelopeError> {
            let message = message
                .as_any()
                .downcast_ref::<DefaultMessage>()
                .ok_or_else(|| {
                    EnvelopeError::Encoding("not a default-protocol message".into())
                })?;
            let proto = match message {
                DefaultMessage::Bytes { content } => DefaultProto {
                    performative: PERFORMATIVE_BYTES.to_string(),
                    content: content.clone(),
                    error_code: 0,
                    error_msg: String::new(),
                },
                DefaultMessage::Error {
                    code,
                    message,
                    original,
                } => DefaultProto {
                    performative: PERFORMATIVE_ERROR.to_string(),
                    content: original.clone(),
                    error_code: code.as_i32(),
                    error_msg: message.clone(),
                },
            };
            Ok(proto.encode_to_vec())
        }

        fn performatives(&self) -> &[&'static str] {
            &[PERFORMATIVE_BYTES, PERFORMATIVE_ERROR]
        }
    }
}

pub use default_protocol::{DefaultMessage, ErrorCode};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_unknown_protocol_fails() {
        let registry = ProtocolRegistry::new();
        let id: ProtocolId = "fipa/1.0.0".parse().unwrap();
        assert!(matches!(
            registry.lookup(&id),
            Err(EnvelopeError::UnsupportedProtocol(_))
        ));
    }

    #[test]
    fn duplicate_registration_refused() {
        let mut registry = ProtocolRegistry::with_defaults();
        assert!(matches!(
            registry.register(Arc::new(default_protocol::DefaultCodec)),
            Err(EnvelopeError::DuplicateProtocol(_))
        ));
    }

    #[test]
    fn default_bytes_roundtrip() {
        let codec = default_protocol::DefaultCodec;
        let msg = DefaultMessage::Bytes {
            content: vec![1, 2, 3],
        };
        let bytes = codec.encode(&msg).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded.performative(), "bytes");
        assert_eq!(decoded.downcast_ref::<DefaultMessage>(), Some(&msg));
    }

    #[test]
    fn default_error_roundtrip() {
        let codec = default_protocol::DefaultCodec;
        let msg = DefaultMessage::Error {
            code: ErrorCode::NoActiveHandler,
            message: "no handler for fipa/1.0.0".into(),
            original: vec![0xde, 0xad],
        };
        let bytes = codec.encode(&msg).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded.downcast_ref::<DefaultMessage>(), Some(&msg));
    }

    #[test]
    fn default_decode_rejects_unknown_performative() {
        let codec = default_protocol::DefaultCodec;
        // Valid protobuf, invalid performative.
        let msg = DefaultMessage::Bytes { content: vec![] };
        let mut bytes = codec.encode(&msg).unwrap();
        // Patch the performative string "bytes" -> "zytes".
        let pos = bytes
            .windows(5)
            .position(|w| w == b"bytes")
            .expect("performative present");
        bytes[pos] = b'z';
        assert!(codec.decode(&bytes).is_err());
    }
}
