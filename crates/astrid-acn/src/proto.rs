//! ACN control messages and their wire framing.
//!
//! Every control message travels as a length-prefixed protobuf `AcnMessage`
//! union carrying a single outermost version tag. Envelopes themselves use
//! the canonical envelope framing from `astrid-envelope`; on a delegate TCP
//! connection the two kinds are interleaved on one stream and told apart by
//! [`DelegateFrame::parse`].

use std::str::FromStr;

use chrono::{DateTime, Utc};
use prost::Message as _;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use astrid_crypto::{AgentRecord, LedgerId};
use astrid_envelope::{codec as envelope_codec, Envelope};

use crate::error::AcnError;

/// Version tag carried by every [`AcnMessage`].
pub const ACN_VERSION: &str = "0.1.0";

/// Upper bound on a single control frame.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

// ── Stream protocols ──────────────────────────────────────────────────────────

pub const PROTO_REGISTER: libp2p::StreamProtocol =
    libp2p::StreamProtocol::new("/aea-register-relay/0.1.0");
pub const PROTO_ADDRESS: libp2p::StreamProtocol =
    libp2p::StreamProtocol::new("/aea-address/0.1.0");
pub const PROTO_ENVELOPE: libp2p::StreamProtocol =
    libp2p::StreamProtocol::new("/aea-envelope/0.1.0");
pub const PROTO_NOTIF: libp2p::StreamProtocol = libp2p::StreamProtocol::new("/aea-notif/0.1.0");

// ── Messages ──────────────────────────────────────────────────────────────────

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AgentRecordProto {
    #[prost(string, tag = "1")]
    pub address: String,
    #[prost(bytes = "vec", tag = "2")]
    pub public_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub representative_public_key: Vec<u8>,
    #[prost(string, tag = "4")]
    pub message_format: String,
    #[prost(bytes = "vec", tag = "5")]
    pub signature: Vec<u8>,
    #[prost(string, tag = "6")]
    pub ledger_id: String,
    #[prost(int64, tag = "7")]
    pub not_before: i64,
    #[prost(int64, tag = "8")]
    pub not_after: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Register {
    #[prost(message, optional, tag = "1")]
    pub record: Option<AgentRecordProto>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LookupRequest {
    #[prost(string, tag = "1")]
    pub agent_address: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LookupResponse {
    #[prost(message, optional, tag = "1")]
    pub record: Option<AgentRecordProto>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AeaEnvelope {
    #[prost(bytes = "vec", tag = "1")]
    pub envelope: Vec<u8>,
    #[prost(message, optional, tag = "2")]
    pub record: Option<AgentRecordProto>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum StatusCode {
    Success = 0,
    ErrorSerialization = 1,
    ErrorUnexpectedPayload = 2,
    ErrorUnknownAgentAddress = 3,
    ErrorInvalidPor = 4,
    ErrorAgentNotReady = 5,
    ErrorGeneric = 6,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Status {
    #[prost(enumeration = "StatusCode", tag = "1")]
    pub code: i32,
    #[prost(string, repeated, tag = "2")]
    pub msgs: Vec<String>,
}

/// Bootstrap-complete notification; intentionally empty.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Notification {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AcnMessage {
    #[prost(string, tag = "1")]
    pub version: String,
    #[prost(oneof = "Payload", tags = "2, 3, 4, 5, 6, 7")]
    pub payload: Option<Payload>,
}

#[derive(Clone, PartialEq, ::prost::Oneof)]
pub enum Payload {
    #[prost(message, tag = "2")]
    Register(Register),
    #[prost(message, tag = "3")]
    LookupRequest(LookupRequest),
    #[prost(message, tag = "4")]
    LookupResponse(LookupResponse),
    #[prost(message, tag = "5")]
    AeaEnvelope(AeaEnvelope),
    #[prost(message, tag = "6")]
    Status(Status),
    #[prost(message, tag = "7")]
    Notif(Notification),
}

impl AcnMessage {
    fn with_payload(payload: Payload) -> Self {
        Self {
            version: ACN_VERSION.to_string(),
            payload: Some(payload),
        }
    }

    pub fn register(record: &AgentRecord) -> Self {
        Self::with_payload(Payload::Register(Register {
            record: Some(record.into()),
        }))
    }

    pub fn lookup_request(address: &str) -> Self {
        Self::with_payload(Payload::LookupRequest(LookupRequest {
            agent_address: address.to_string(),
        }))
    }

    pub fn lookup_response(record: &AgentRecord) -> Self {
        Self::with_payload(Payload::LookupResponse(LookupResponse {
            record: Some(record.into()),
        }))
    }

    pub fn aea_envelope(envelope_bytes: Vec<u8>, record: &AgentRecord) -> Self {
        Self::with_payload(Payload::AeaEnvelope(AeaEnvelope {
            envelope: envelope_bytes,
            record: Some(record.into()),
        }))
    }

    pub fn success() -> Self {
        Self::with_payload(Payload::Status(Status {
            code: StatusCode::Success as i32,
            msgs: Vec::new(),
        }))
    }

    pub fn error(code: StatusCode, msg: impl Into<String>) -> Self {
        Self::with_payload(Payload::Status(Status {
            code: code as i32,
            msgs: vec![msg.into()],
        }))
    }

    pub fn notif() -> Self {
        Self::with_payload(Payload::Notif(Notification {}))
    }

    pub fn encode_to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, AcnError> {
        AcnMessage::decode(bytes).map_err(|e| AcnError::Serialization(e.to_string()))
    }

    /// Interpret a `Status` payload as a result.
    pub fn into_result(self) -> Result<(), AcnError> {
        match self.payload {
            Some(Payload::Status(status)) => {
                let code = StatusCode::try_from(status.code)
                    .unwrap_or(StatusCode::ErrorGeneric);
                if code == StatusCode::Success {
                    Ok(())
                } else {
                    Err(AcnError::from_status(code, &status.msgs))
                }
            }
            other => Err(AcnError::UnexpectedPayload(format!(
                "expected status, got {}",
                payload_name(&other)
            ))),
        }
    }
}

pub fn payload_name(payload: &Option<Payload>) -> &'static str {
    match payload {
        None => "empty",
        Some(Payload::Register(_)) => "register",
        Some(Payload::LookupRequest(_)) => "lookup_request",
        Some(Payload::LookupResponse(_)) => "lookup_response",
        Some(Payload::AeaEnvelope(_)) => "aea_envelope",
        Some(Payload::Status(_)) => "status",
        Some(Payload::Notif(_)) => "notif",
    }
}

// ── Record conversions ────────────────────────────────────────────────────────

impl From<&AgentRecord> for AgentRecordProto {
    fn from(record: &AgentRecord) -> Self {
        Self {
            address: record.address.to_string(),
            public_key: record.public_key.clone(),
            representative_public_key: record.representative_public_key.clone(),
            message_format: record.message_format.clone(),
            signature: record.signature.clone(),
            ledger_id: record.ledger_id.as_str().to_string(),
            not_before: record.not_before.timestamp(),
            not_after: record.not_after.timestamp(),
        }
    }
}

impl TryFrom<AgentRecordProto> for AgentRecord {
    type Error = AcnError;

    fn try_from(proto: AgentRecordProto) -> Result<Self, Self::Error> {
        let address = proto
            .address
            .parse()
            .map_err(|e| AcnError::Serialization(format!("record address: {e}")))?;
        let ledger_id = LedgerId::from_str(&proto.ledger_id)
            .map_err(|e| AcnError::Serialization(format!("record ledger: {e}")))?;
        let not_before = timestamp(proto.not_before)?;
        let not_after = timestamp(proto.not_after)?;
        Ok(AgentRecord {
            address,
            public_key: proto.public_key,
            representative_public_key: proto.representative_public_key,
            message_format: proto.message_format,
            signature: proto.signature,
            ledger_id,
            not_before,
            not_after,
        })
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, AcnError> {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| AcnError::Serialization(format!("timestamp {secs} out of range")))
}

/// Encode a record alone, as persisted by the record store.
pub fn encode_record(record: &AgentRecord) -> Vec<u8> {
    AgentRecordProto::from(record).encode_to_vec()
}

pub fn decode_record(bytes: &[u8]) -> Result<AgentRecord, AcnError> {
    let proto =
        AgentRecordProto::decode(bytes).map_err(|e| AcnError::Serialization(e.to_string()))?;
    AgentRecord::try_from(proto)
}

// ── Framing (tokio io, used by the delegate TCP service) ──────────────────────

pub async fn write_frame<W>(io: &mut W, payload: &[u8]) -> Result<(), AcnError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_BYTES {
        return Err(AcnError::Serialization(format!(
            "frame of {} bytes exceeds the maximum",
            payload.len()
        )));
    }
    io.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    io.write_all(payload).await?;
    io.flush().await?;
    Ok(())
}

pub async fn read_frame<R>(io: &mut R) -> Result<Vec<u8>, AcnError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(AcnError::Serialization(format!(
            "incoming frame of {len} bytes exceeds the maximum"
        )));
    }
    let mut payload = vec![0u8; len];
    io.read_exact(&mut payload).await?;
    Ok(payload)
}

// ── Delegate stream frames ────────────────────────────────────────────────────

/// A frame on a delegate TCP connection after the handshake: either a plain
/// envelope or a control message (status replies, mostly).
pub enum DelegateFrame {
    Envelope(Envelope),
    Control(AcnMessage),
}

impl DelegateFrame {
    /// Envelopes are tried first: a control message never validates as an
    /// envelope (its status payload trips the empty-sender check), so the
    /// order is deterministic.
    pub fn parse(bytes: &[u8]) -> Result<Self, AcnError> {
        if let Ok(envelope) = envelope_codec::decode_payload(bytes) {
            return Ok(DelegateFrame::Envelope(envelope));
        }
        AcnMessage::decode_bytes(bytes).map(DelegateFrame::Control)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use astrid_crypto::{Crypto, Keypair};

    fn sample_record() -> AgentRecord {
        let agent = Crypto::generate(astrid_crypto::LedgerId::Ed25519);
        let peer = Keypair::generate_ed25519();
        AgentRecord::new_signed(&agent, &peer.public(), chrono::Duration::hours(1)).unwrap()
    }

    #[test]
    fn record_roundtrip_preserves_validity() {
        let record = sample_record();
        let bytes = encode_record(&record);
        let decoded = decode_record(&bytes).unwrap();
        assert_eq!(decoded, record);
        decoded.verify(Utc::now()).unwrap();
    }

    #[test]
    fn tampered_record_fails_verification_after_roundtrip() {
        let mut record = sample_record();
        record.signature[0] ^= 0x01;
        let decoded = decode_record(&encode_record(&record)).unwrap();
        assert!(decoded.verify(Utc::now()).is_err());
    }

    #[test]
    fn acn_message_roundtrip() {
        let record = sample_record();
        for msg in [
            AcnMessage::register(&record),
            AcnMessage::lookup_request(record.address.as_str()),
            AcnMessage::lookup_response(&record),
            AcnMessage::aea_envelope(vec![1, 2, 3], &record),
            AcnMessage::success(),
            AcnMessage::error(StatusCode::ErrorInvalidPor, "bad signature"),
            AcnMessage::notif(),
        ] {
            let decoded = AcnMessage::decode_bytes(&msg.encode_to_bytes()).unwrap();
            assert_eq!(decoded, msg);
            assert_eq!(decoded.version, ACN_VERSION);
        }
    }

    #[test]
    fn status_into_result() {
        assert!(AcnMessage::success().into_result().is_ok());
        let err = AcnMessage::error(StatusCode::ErrorAgentNotReady, "still booting")
            .into_result()
            .unwrap_err();
        assert!(matches!(err, AcnError::AgentNotReady(_)));
        assert!(AcnMessage::notif().into_result().is_err());
    }

    #[test]
    fn delegate_frame_disambiguation() {
        // A control frame parses as control.
        let control = AcnMessage::error(StatusCode::ErrorGeneric, "nope");
        match DelegateFrame::parse(&control.encode_to_bytes()).unwrap() {
            DelegateFrame::Control(msg) => assert_eq!(msg, control),
            DelegateFrame::Envelope(_) => panic!("status frame parsed as envelope"),
        }

        // An envelope frame parses as envelope.
        let a = Crypto::generate(astrid_crypto::LedgerId::Ed25519);
        let b = Crypto::generate(astrid_crypto::LedgerId::Ed25519);
        let env = Envelope::new(
            a.address().clone(),
            b.address().clone(),
            "fipa/1.0.0".parse().unwrap(),
            vec![0xaa],
        );
        let bytes = envelope_codec::encode_payload(&env);
        match DelegateFrame::parse(&bytes).unwrap() {
            DelegateFrame::Envelope(decoded) => assert_eq!(decoded, env),
            DelegateFrame::Control(_) => panic!("envelope frame parsed as control"),
        }
    }

    #[tokio::test]
    async fn framing_roundtrip_over_a_duplex_pipe() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let msg = AcnMessage::lookup_request("aa1aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        write_frame(&mut client, &msg.encode_to_bytes()).await.unwrap();
        let bytes = read_frame(&mut server).await.unwrap();
        assert_eq!(AcnMessage::decode_bytes(&bytes).unwrap(), msg);
    }
}
