//! Adapters implementing the runtime `Connection` trait.
//!
//! [`AcnConnection`] owns an in-process [`AcnPeer`] running in a spawned
//! task; [`DelegateConnection`] wraps a [`DelegateClient`] for agents that
//! reach the network over plain TCP. Both only move envelopes across the
//! queue boundary; neither calls back into the runtime.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex as StdMutex,
};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use astrid_envelope::Envelope;
use astrid_runtime::{Connection, ConnectionId, RuntimeError};

use crate::config::AcnConfig;
use crate::delegate::DelegateClient;
use crate::error::AcnError;
use crate::peer::{AcnHandle, AcnPeer};

fn to_runtime_error(e: AcnError) -> RuntimeError {
    match e {
        AcnError::Timeout(t) => RuntimeError::Timeout(t),
        other => RuntimeError::Connection(other.to_string()),
    }
}

// ── In-process peer connection ────────────────────────────────────────────────

/// The ACN peer as an agent connection: `send` routes through the overlay,
/// `receive` drains envelopes addressed to this agent.
pub struct AcnConnection {
    id: ConnectionId,
    handle: AcnHandle,
    inbound: Mutex<Option<mpsc::Receiver<Envelope>>>,
    task: StdMutex<Option<JoinHandle<Result<(), AcnError>>>>,
    connected: AtomicBool,
}

impl AcnConnection {
    /// Spawn the peer's event loop and wrap its handle as a connection.
    pub fn spawn(config: AcnConfig) -> Self {
        let peer = AcnPeer::new(config);
        let handle = peer.handle();
        let task = tokio::spawn(peer.run());
        Self {
            id: "acn".to_string(),
            handle,
            inbound: Mutex::new(None),
            task: StdMutex::new(Some(task)),
            connected: AtomicBool::new(false),
        }
    }

    pub fn handle(&self) -> &AcnHandle {
        &self.handle
    }
}

#[async_trait]
impl Connection for AcnConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn connect(&self) -> Result<(), RuntimeError> {
        let rx = self
            .handle
            .take_inbound()
            .ok_or_else(|| RuntimeError::Config("ACN inbound receiver already taken".into()))?;
        *self.inbound.lock().await = Some(rx);
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), RuntimeError> {
        self.connected.store(false, Ordering::Release);
        self.handle.shutdown().await;
        let task = self.task.lock().expect("task lock").take();
        if let Some(task) = task {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("ACN peer exited with error: {e}"),
                Err(e) => debug!("ACN peer task join failed: {e}"),
            }
        }
        Ok(())
    }

    async fn send(&self, env: Envelope) -> Result<(), RuntimeError> {
        self.handle.route(env).await.map_err(to_runtime_error)
    }

    async fn receive(&self) -> Result<Envelope, RuntimeError> {
        let mut guard = self.inbound.lock().await;
        let rx = guard
            .as_mut()
            .ok_or(RuntimeError::NotRunning("acn connection"))?;
        rx.recv()
            .await
            .ok_or(RuntimeError::NotRunning("acn connection"))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

// ── Delegate TCP connection ───────────────────────────────────────────────────

/// A [`DelegateClient`] as an agent connection. The TCP handshake happens in
/// `connect` via the provided factory so that construction stays synchronous
/// and failures surface through the connection lifecycle.
pub struct DelegateConnection {
    id: ConnectionId,
    client: StdMutex<Option<Arc<DelegateClient>>>,
    factory: Box<dyn DelegateFactory>,
    connected: AtomicBool,
}

/// How to (re)establish the delegate TCP session.
#[async_trait]
pub trait DelegateFactory: Send + Sync {
    async fn connect(&self) -> Result<DelegateClient, AcnError>;
}

impl DelegateConnection {
    pub fn new(factory: Box<dyn DelegateFactory>) -> Self {
        Self {
            id: "acn-delegate".to_string(),
            client: StdMutex::new(None),
            factory,
            connected: AtomicBool::new(false),
        }
    }

    /// Grab the live client without holding the slot lock across awaits;
    /// the client's reader and writer carry their own locks.
    fn client(&self) -> Result<Arc<DelegateClient>, RuntimeError> {
        self.client
            .lock()
            .expect("client lock")
            .clone()
            .ok_or(RuntimeError::NotRunning("delegate connection"))
    }
}

#[async_trait]
impl Connection for DelegateConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn connect(&self) -> Result<(), RuntimeError> {
        let client = self.factory.connect().await.map_err(to_runtime_error)?;
        *self.client.lock().expect("client lock") = Some(Arc::new(client));
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), RuntimeError> {
        self.connected.store(false, Ordering::Release);
        self.client.lock().expect("client lock").take();
        Ok(())
    }

    async fn send(&self, env: Envelope) -> Result<(), RuntimeError> {
        let client = self.client()?;
        client.send(&env).await.map_err(to_runtime_error)
    }

    async fn receive(&self) -> Result<Envelope, RuntimeError> {
        let client = self.client()?;
        client.recv().await.map_err(to_runtime_error)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}
