//! Request/response codec for the four ACN stream protocols.
//!
//! Wire format per message:
//!   [4 bytes big-endian length][protobuf `AcnMessage`]

use std::io;

use async_trait::async_trait;
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use libp2p::{request_response, StreamProtocol};
use prost::Message as _;

use crate::proto::{AcnMessage, MAX_FRAME_BYTES};

/// libp2p `request_response::Codec` exchanging framed [`AcnMessage`]s on all
/// four ACN protocols.
#[derive(Clone, Default, Debug)]
pub struct AcnCodec;

async fn write_framed<W>(io: &mut W, msg: AcnMessage) -> io::Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let payload = msg.encode_to_vec();
    if payload.len() > MAX_FRAME_BYTES {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "message too large"));
    }
    io.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    io.write_all(&payload).await?;
    io.close().await
}

async fn read_framed<R>(io: &mut R) -> io::Result<AcnMessage>
where
    R: AsyncRead + Unpin + Send,
{
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "incoming message too large"));
    }
    let mut payload = vec![0u8; len];
    io.read_exact(&mut payload).await?;
    AcnMessage::decode(payload.as_slice())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

#[async_trait]
impl request_response::Codec for AcnCodec {
    type Protocol = StreamProtocol;
    type Request = AcnMessage;
    type Response = AcnMessage;

    async fn read_request<T>(&mut self, _proto: &StreamProtocol, io: &mut T) -> io::Result<AcnMessage>
    where T: AsyncRead + Unpin + Send {
        read_framed(io).await
    }

    async fn read_response<T>(&mut self, _proto: &StreamProtocol, io: &mut T) -> io::Result<AcnMessage>
    where T: AsyncRead + Unpin + Send {
        read_framed(io).await
    }

    async fn write_request<T>(&mut self, _proto: &StreamProtocol, io: &mut T, req: AcnMessage) -> io::Result<()>
    where T: AsyncWrite + Unpin + Send {
        write_framed(io, req).await
    }

    async fn write_response<T>(&mut self, _proto: &StreamProtocol, io: &mut T, resp: AcnMessage) -> io::Result<()>
    where T: AsyncWrite + Unpin + Send {
        write_framed(io, resp).await
    }
}
