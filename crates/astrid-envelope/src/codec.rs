// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Framed envelope codec.
//!
//! Wire format per envelope:
//!   [4 bytes big-endian length][protobuf payload]
//!
//! Over a stream, envelopes are self-delimiting; over a datagram transport a
//! message carries exactly one envelope. Max frame size: 8 MiB.

use std::io::{Read, Write};

use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use prost::Message as _;

use crate::envelope::Envelope;
use crate::error::EnvelopeError;

/// Upper bound on a single envelope frame.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// On-the-wire envelope payload. Field order is fixed; `connection_id` is a
/// local routing hint and deliberately has no wire representation.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EnvelopeProto {
    #[prost(string, tag = "1")]
    pub to: String,
    #[prost(string, tag = "2")]
    pub sender: String,
    #[prost(string, tag = "3")]
    pub protocol_id: String,
    #[prost(bytes = "vec", tag = "4")]
    pub message: Vec<u8>,
    #[prost(string, optional, tag = "5")]
    pub uri: Option<String>,
}

impl From<&Envelope> for EnvelopeProto {
    fn from(env: &Envelope) -> Self {
        Self {
            to: env.to.to_string(),
            sender: env.sender.to_string(),
            protocol_id: env.protocol_id.to_string(),
            message: env.message.clone(),
            uri: env.uri().map(str::to_string),
        }
    }
}

impl TryFrom<EnvelopeProto> for Envelope {
    type Error = EnvelopeError;

    fn try_from(proto: EnvelopeProto) -> Result<Self, Self::Error> {
        Envelope::from_parts(
            &proto.to,
            &proto.sender,
            &proto.protocol_id,
            proto.message,
            proto.uri,
        )
    }
}

// ── Payload encode / decode ───────────────────────────────────────────────────

/// Encode the protobuf payload without the length prefix.
pub fn encode_payload(env: &Envelope) -> Vec<u8> {
    EnvelopeProto::from(env).encode_to_vec()
}

/// Decode a protobuf payload (no length prefix).
pub fn decode_payload(bytes: &[u8]) -> Result<Envelope, EnvelopeError> {
    let proto =
        EnvelopeProto::decode(bytes).map_err(|e| EnvelopeError::Decoding(e.to_string()))?;
    Envelope::try_from(proto)
}

/// Encode a complete frame: length prefix plus payload.
pub fn encode_frame(env: &Envelope) -> Result<Vec<u8>, EnvelopeError> {
    let payload = encode_payload(env);
    if payload.len() > MAX_FRAME_BYTES {
        return Err(EnvelopeError::FrameTooLarge(payload.len()));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

// ── Async framed io ───────────────────────────────────────────────────────────

pub async fn write_envelope<W>(io: &mut W, env: &Envelope) -> Result<(), EnvelopeError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(env)?;
    io.write_all(&frame).await?;
    Ok(())
}

pub async fn read_envelope<R>(io: &mut R) -> Result<Envelope, EnvelopeError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(EnvelopeError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    io.read_exact(&mut payload).await?;
    decode_payload(&payload)
}

// ── Sync framed io (files, std streams) ───────────────────────────────────────

pub fn write_envelope_sync<W: Write>(io: &mut W, env: &Envelope) -> Result<(), EnvelopeError> {
    let frame = encode_frame(env)?;
    io.write_all(&frame)?;
    Ok(())
}

pub fn read_envelope_sync<R: Read>(io: &mut R) -> Result<Envelope, EnvelopeError> {
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(EnvelopeError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    io.read_exact(&mut payload)?;
    decode_payload(&payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeContext;
    use astrid_crypto::{Crypto, LedgerId};

    fn sample() -> Envelope {
        let a = Crypto::generate(LedgerId::Ed25519);
        let b = Crypto::generate(LedgerId::Ed25519);
        Envelope::new(
            a.address().clone(),
            b.address().clone(),
            "fipa/1.0.0".parse().unwrap(),
            vec![0x01, 0x02],
        )
    }

    #[test]
    fn frame_roundtrip_is_byte_exact() {
        let env = sample();
        let frame = encode_frame(&env).unwrap();
        let decoded = decode_payload(&frame[4..]).unwrap();
        assert_eq!(decoded, env);
        // Re-encoding the decoded envelope reproduces the same bytes.
        assert_eq!(encode_frame(&decoded).unwrap(), frame);
    }

    #[test]
    fn uri_survives_and_connection_id_does_not() {
        let env = sample().with_context(EnvelopeContext {
            connection_id: Some("acn".into()),
            uri: Some("tcp://10.0.0.1:9000".into()),
        });
        let decoded = decode_payload(&encode_payload(&env)).unwrap();
        assert_eq!(decoded.uri(), Some("tcp://10.0.0.1:9000"));
        assert_eq!(decoded.connection_id(), None);
    }

    #[test]
    fn empty_context_canonicalizes_to_none() {
        let env = sample().with_context(EnvelopeContext::default());
        let decoded = decode_payload(&encode_payload(&env)).unwrap();
        assert!(decoded.context.is_none());
    }

    #[test]
    fn garbage_payload_fails_decoding() {
        assert!(matches!(
            decode_payload(&[0xff, 0xff, 0xff]),
            Err(EnvelopeError::Decoding(_))
        ));
    }

    #[test]
    fn sync_roundtrip_through_a_buffer() {
        let env = sample();
        let mut buf = Vec::new();
        write_envelope_sync(&mut buf, &env).unwrap();
        write_envelope_sync(&mut buf, &env).unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(read_envelope_sync(&mut cursor).unwrap(), env);
        assert_eq!(read_envelope_sync(&mut cursor).unwrap(), env);
        // Stream exhausted.
        assert!(read_envelope_sync(&mut cursor).is_err());
    }

    #[tokio::test]
    async fn async_roundtrip_through_a_buffer() {
        let env = sample();
        let mut buf = Vec::new();
        {
            let mut cursor = futures::io::Cursor::new(&mut buf);
            write_envelope(&mut cursor, &env).await.unwrap();
        }
        let mut cursor = futures::io::Cursor::new(buf);
        assert_eq!(read_envelope(&mut cursor).await.unwrap(), env);
    }

    #[test]
    fn oversized_length_prefix_rejected() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&(u32::MAX).to_be_bytes());
        frame.extend_from_slice(&[0u8; 16]);
        let mut cursor = std::io::Cursor::new(frame);
        assert!(matches!(
            read_envelope_sync(&mut cursor),
            Err(EnvelopeError::FrameTooLarge(_))
        ));
    }
}
