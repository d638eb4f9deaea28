//! Delegate TCP service and client.
//!
//! Non-libp2p agents connect over plain TCP with length-prefixed frames.
//! The handshake is a `Register{record}` / `Status` exchange; afterwards the
//! client writes envelope frames and receives inbound envelopes (and error
//! statuses) on the same connection.

use std::{net::SocketAddr, sync::Arc};

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use astrid_crypto::{AgentRecord, Crypto, PublicKey};
use astrid_envelope::{codec as envelope_codec, Envelope};

use crate::error::AcnError;
use crate::metrics::Metrics;
use crate::peer::AcnCommand;
use crate::proto::{self, AcnMessage, DelegateFrame, Payload, StatusCode};

/// Capacity of the per-client outbound envelope queue.
const CLIENT_QUEUE: usize = 64;

// ── Service ───────────────────────────────────────────────────────────────────

/// Accept loop. One task per client; registration and routing go through the
/// peer's command channel, so this module never touches the tables directly.
pub(crate) async fn run_service(
    listener: TcpListener,
    cmd_tx: mpsc::Sender<AcnCommand>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
    registration_timeout: Duration,
) {
    info!(addr = ?listener.local_addr().ok(), "delegate service listening");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    debug!(%remote, "delegate client connected");
                    tokio::spawn(handle_client(
                        stream,
                        cmd_tx.clone(),
                        Arc::clone(&metrics),
                        cancel.clone(),
                        registration_timeout,
                    ));
                }
                Err(e) => {
                    warn!("delegate accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    cmd_tx: mpsc::Sender<AcnCommand>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
    registration_timeout: Duration,
) {
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(Mutex::new(writer));

    match handshake(&mut reader, &writer, &cmd_tx, registration_timeout).await
    {
        Ok((record, sink_rx)) => {
            metrics.active_delegates.inc();
            let address = record.address.clone();
            client_loop(reader, writer, sink_rx, &address, &cmd_tx, &cancel).await;
            metrics.active_delegates.dec();
            let _ = cmd_tx
                .send(AcnCommand::UnregisterDelegate {
                    address: address.clone(),
                })
                .await;
            debug!(%address, "delegate client disconnected");
        }
        Err(e) => debug!("delegate handshake failed: {e}"),
    }
}

/// Returns the verified record and the receiver the peer pushes inbound
/// envelopes into; on failure the error status has already been written.
async fn handshake(
    reader: &mut OwnedReadHalf,
    writer: &Arc<Mutex<OwnedWriteHalf>>,
    cmd_tx: &mpsc::Sender<AcnCommand>,
    registration_timeout: Duration,
) -> Result<(AgentRecord, mpsc::Receiver<Envelope>), AcnError> {
    let started = Instant::now();
    let frame = match timeout(registration_timeout, proto::read_frame(reader)).await {
        Ok(Ok(frame)) => frame,
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(AcnError::Timeout("delegate registration".into())),
    };

    let msg = match AcnMessage::decode_bytes(&frame) {
        Ok(msg) => msg,
        Err(e) => {
            write_status(writer, StatusCode::ErrorSerialization, &e.to_string()).await;
            return Err(e);
        }
    };
    let record = match msg.payload {
        Some(Payload::Register(register)) => match register.record {
            Some(proto) => match AgentRecord::try_from(proto) {
                Ok(record) => record,
                Err(e) => {
                    write_status(writer, StatusCode::ErrorSerialization, &e.to_string()).await;
                    return Err(e);
                }
            },
            None => {
                let e = AcnError::UnexpectedPayload("register without record".into());
                write_status(writer, StatusCode::ErrorUnexpectedPayload, &e.to_string()).await;
                return Err(e);
            }
        },
        other => {
            let e = AcnError::UnexpectedPayload(format!(
                "expected register, got {}",
                proto::payload_name(&other)
            ));
            write_status(writer, StatusCode::ErrorUnexpectedPayload, &e.to_string()).await;
            return Err(e);
        }
    };
    let (sink_tx, sink_rx) = mpsc::channel(CLIENT_QUEUE);
    let (reply_tx, reply_rx) = oneshot::channel();
    if cmd_tx
        .send(AcnCommand::RegisterDelegate {
            record: record.clone(),
            sink: sink_tx,
            reply: reply_tx,
            started,
        })
        .await
        .is_err()
    {
        write_status(writer, StatusCode::ErrorGeneric, "peer shutting down").await;
        return Err(AcnError::Shutdown);
    }
    match reply_rx.await {
        Ok(Ok(())) => {
            let frame = AcnMessage::success().encode_to_bytes();
            let write_result = {
                let mut w = writer.lock().await;
                proto::write_frame(&mut *w, &frame).await
            };
            if let Err(e) = write_result {
                // The table entry exists but the client never learned of it.
                let _ = cmd_tx
                    .send(AcnCommand::UnregisterDelegate {
                        address: record.address.clone(),
                    })
                    .await;
                return Err(e);
            }
            Ok((record, sink_rx))
        }
        Ok(Err(e)) => {
            write_status(writer, e.status_code(), &e.to_string()).await;
            Err(e)
        }
        Err(_) => {
            write_status(writer, StatusCode::ErrorGeneric, "peer shutting down").await;
            Err(AcnError::Shutdown)
        }
    }
}

async fn client_loop(
    mut reader: OwnedReadHalf,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    mut sink_rx: mpsc::Receiver<Envelope>,
    address: &astrid_crypto::Address,
    cmd_tx: &mpsc::Sender<AcnCommand>,
    cancel: &CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            outbound = sink_rx.recv() => match outbound {
                Some(env) => {
                    let bytes = envelope_codec::encode_payload(&env);
                    let mut w = writer.lock().await;
                    if proto::write_frame(&mut *w, &bytes).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            frame = proto::read_frame(&mut reader) => {
                let bytes = match frame {
                    Ok(bytes) => bytes,
                    Err(_) => break,
                };
                match DelegateFrame::parse(&bytes) {
                    Ok(DelegateFrame::Envelope(env)) => {
                        if env.sender != *address {
                            // Spoofed sender: reject without routing.
                            write_status(
                                &writer,
                                StatusCode::ErrorGeneric,
                                &format!("sender {} is not the registered address", env.sender),
                            )
                            .await;
                            continue;
                        }
                        route_from_client(env, cmd_tx, &writer).await;
                    }
                    Ok(DelegateFrame::Control(msg)) => {
                        debug!("ignoring control frame from delegate client: {:?}",
                               proto::payload_name(&msg.payload));
                    }
                    Err(e) => {
                        debug!("unparseable delegate frame: {e}");
                        break;
                    }
                }
            }
        }
    }
}

/// Hand the envelope to the peer and report failures back on the wire
/// without blocking the read loop.
async fn route_from_client(
    env: Envelope,
    cmd_tx: &mpsc::Sender<AcnCommand>,
    writer: &Arc<Mutex<OwnedWriteHalf>>,
) {
    let (reply_tx, reply_rx) = oneshot::channel();
    if cmd_tx
        .send(AcnCommand::Route {
            env,
            reply: reply_tx,
        })
        .await
        .is_err()
    {
        write_status(writer, StatusCode::ErrorGeneric, "peer shutting down").await;
        return;
    }
    let writer = Arc::clone(writer);
    tokio::spawn(async move {
        match reply_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => write_status(&writer, e.status_code(), &e.to_string()).await,
            Err(_) => {}
        }
    });
}

async fn write_status(writer: &Arc<Mutex<OwnedWriteHalf>>, code: StatusCode, msg: &str) {
    let frame = AcnMessage::error(code, msg).encode_to_bytes();
    let mut w = writer.lock().await;
    if let Err(e) = proto::write_frame(&mut *w, &frame).await {
        debug!("status write failed: {e}");
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

/// A delegate client: connects to a peer's delegate TCP service, registers
/// with a proof of representation naming the peer, then exchanges envelopes.
pub struct DelegateClient {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    record: AgentRecord,
}

impl DelegateClient {
    /// Connect and register. `node_public_key` is the peer's identity key,
    /// which the record authorizes as this agent's representative.
    pub async fn connect(
        addr: SocketAddr,
        crypto: &Crypto,
        node_public_key: &PublicKey,
        validity: chrono::Duration,
    ) -> Result<Self, AcnError> {
        let record = AgentRecord::new_signed(crypto, node_public_key, validity)
            .map_err(|e| AcnError::Generic(format!("record signing failed: {e}")))?;

        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        let frame = AcnMessage::register(&record).encode_to_bytes();
        proto::write_frame(&mut writer, &frame).await?;
        let reply = proto::read_frame(&mut reader).await?;
        AcnMessage::decode_bytes(&reply)?.into_result()?;

        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            record,
        })
    }

    pub fn record(&self) -> &AgentRecord {
        &self.record
    }

    pub fn address(&self) -> &astrid_crypto::Address {
        &self.record.address
    }

    /// Send one envelope. The sender field must be this client's address or
    /// the peer will reject the frame.
    pub async fn send(&self, env: &Envelope) -> Result<(), AcnError> {
        let bytes = envelope_codec::encode_payload(env);
        let mut writer = self.writer.lock().await;
        proto::write_frame(&mut *writer, &bytes).await
    }

    /// Receive the next inbound envelope. A status frame reporting a failed
    /// earlier send surfaces as an error.
    pub async fn recv(&self) -> Result<Envelope, AcnError> {
        loop {
            let bytes = {
                let mut reader = self.reader.lock().await;
                proto::read_frame(&mut *reader).await?
            };
            match DelegateFrame::parse(&bytes)? {
                DelegateFrame::Envelope(env) => return Ok(env),
                DelegateFrame::Control(msg) => match msg.into_result() {
                    Ok(()) => continue,
                    Err(e) => return Err(e),
                },
            }
        }
    }
}
