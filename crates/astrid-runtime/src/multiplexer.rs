// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Connection multiplexer: fan-in from all connections to the inbox, fan-out
//! from the outbox to the connection chosen by the routing rules.
//!
//! Each connection gets its own receive task; a single send task drains the
//! outbox. Failures are handled per connection according to its
//! [`ExceptionPolicy`]. A `Propagate` failure trips the shared fatal token,
//! which the agent runtime observes and turns into the `Error` state.
//!
//! Retry delays carry multiplicative jitter: connections that fail together
//! (a network blip, a peer restart) must not come back in lockstep.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use astrid_envelope::{Envelope, ProtocolId};

use crate::connection::{Connection, ConnectionId, ExceptionPolicy};
use crate::error::RuntimeError;
use crate::queue::{Inbox, Outbox, Queue};

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(5);
const MAX_SEND_RETRIES: u32 = 5;

/// Spread a nominal backoff over [0.5x, 1.5x].
fn jittered(backoff: Duration) -> Duration {
    backoff.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
}

// ── Routing table ─────────────────────────────────────────────────────────────

/// Shared view of the active connections and routing preferences. The outbox
/// consults it synchronously on `put` so producers learn about unroutable
/// envelopes immediately.
#[derive(Default)]
pub struct RoutingTable {
    connections: RwLock<HashSet<ConnectionId>>,
    default_routing: RwLock<HashMap<ProtocolId, ConnectionId>>,
    default_connection: RwLock<Option<ConnectionId>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve an outbound envelope to a connection:
    /// 1. the envelope's `connection_id` hint, if that connection exists;
    /// 2. the default routing entry for the envelope's protocol;
    /// 3. the default connection;
    /// 4. otherwise a routing error.
    pub fn resolve(&self, env: &Envelope) -> Result<ConnectionId, RuntimeError> {
        let connections = self.connections.read().expect("routing lock");
        if let Some(hint) = env.connection_id() {
            if connections.contains(hint) {
                return Ok(hint.to_string());
            }
            debug!(connection = hint, "routing hint names an unknown connection");
        }
        if let Some(cid) = self
            .default_routing
            .read()
            .expect("routing lock")
            .get(&env.protocol_id)
        {
            if connections.contains(cid) {
                return Ok(cid.clone());
            }
        }
        if let Some(cid) = self
            .default_connection
            .read()
            .expect("routing lock")
            .as_ref()
        {
            if connections.contains(cid) {
                return Ok(cid.clone());
            }
        }
        Err(RuntimeError::Routing(format!(
            "no connection for envelope to {} ({})",
            env.to, env.protocol_id
        )))
    }

    pub fn set_default_routing(&self, protocol_id: ProtocolId, connection_id: ConnectionId) {
        self.default_routing
            .write()
            .expect("routing lock")
            .insert(protocol_id, connection_id);
    }

    fn set_default_connection(&self, connection_id: ConnectionId) {
        *self.default_connection.write().expect("routing lock") = Some(connection_id);
    }

    fn add_connection(&self, connection_id: ConnectionId) {
        self.connections
            .write()
            .expect("routing lock")
            .insert(connection_id);
    }

    fn remove_connection(&self, connection_id: &str) {
        self.connections
            .write()
            .expect("routing lock")
            .remove(connection_id);
    }

    fn clear_connections(&self) {
        self.connections.write().expect("routing lock").clear();
    }
}

// ── Multiplexer ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiplexerState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

struct Entry {
    conn: Arc<dyn Connection>,
    policy: ExceptionPolicy,
}

pub struct Multiplexer {
    entries: Vec<Entry>,
    routing: Arc<RoutingTable>,
    inbox: Inbox,
    outbox: Outbox,
    state: Arc<Mutex<MultiplexerState>>,
    default_connection: Option<ConnectionId>,
    cancel: CancellationToken,
    fatal: CancellationToken,
    fatal_reason: Arc<Mutex<Option<String>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Multiplexer {
    pub fn new(inbox: Inbox, outbox: Outbox, routing: Arc<RoutingTable>) -> Self {
        Self {
            entries: Vec::new(),
            routing,
            inbox,
            outbox,
            state: Arc::new(Mutex::new(MultiplexerState::Disconnected)),
            default_connection: None,
            cancel: CancellationToken::new(),
            fatal: CancellationToken::new(),
            fatal_reason: Arc::new(Mutex::new(None)),
            tasks: Vec::new(),
        }
    }

    pub fn state(&self) -> MultiplexerState {
        *self.state.lock().expect("state lock")
    }

    /// Token tripped when a `Propagate`-policy connection fails.
    pub fn fatal_token(&self) -> CancellationToken {
        self.fatal.clone()
    }

    pub fn fatal_reason(&self) -> Option<String> {
        self.fatal_reason.lock().expect("fatal lock").clone()
    }

    /// Register a connection. The first one registered becomes the default
    /// unless [`Self::set_default_connection`] overrides it.
    pub fn add_connection(
        &mut self,
        conn: Arc<dyn Connection>,
        policy: ExceptionPolicy,
    ) -> Result<(), RuntimeError> {
        if self.state() != MultiplexerState::Disconnected {
            return Err(RuntimeError::Config(
                "connections must be added while disconnected".into(),
            ));
        }
        if self.entries.iter().any(|e| e.conn.id() == conn.id()) {
            return Err(RuntimeError::Config(format!(
                "duplicate connection id '{}'",
                conn.id()
            )));
        }
        if self.default_connection.is_none() {
            self.default_connection = Some(conn.id().clone());
        }
        self.entries.push(Entry { conn, policy });
        Ok(())
    }

    pub fn set_default_connection(&mut self, connection_id: &str) -> Result<(), RuntimeError> {
        if !self.entries.iter().any(|e| e.conn.id() == connection_id) {
            return Err(RuntimeError::Config(format!(
                "unknown connection id '{connection_id}'"
            )));
        }
        self.default_connection = Some(connection_id.to_string());
        Ok(())
    }

    pub fn set_default_routing(&self, protocol_id: ProtocolId, connection_id: ConnectionId) {
        self.routing.set_default_routing(protocol_id, connection_id);
    }

    /// Bring up all connections and start the send/receive loops.
    pub async fn connect(&mut self) -> Result<(), RuntimeError> {
        if self.state() != MultiplexerState::Disconnected {
            return Err(RuntimeError::Config("multiplexer already connected".into()));
        }
        self.set_state(MultiplexerState::Connecting);

        let mut connected: Vec<Arc<dyn Connection>> = Vec::new();
        for entry in &self.entries {
            match entry.conn.connect().await {
                Ok(()) => connected.push(Arc::clone(&entry.conn)),
                Err(e) => {
                    // Tear down whatever came up, in reverse order.
                    for conn in connected.iter().rev() {
                        let _ = conn.disconnect().await;
                    }
                    self.set_state(MultiplexerState::Disconnected);
                    return Err(RuntimeError::Connection(format!(
                        "connection '{}' failed to connect: {e}",
                        entry.conn.id()
                    )));
                }
            }
        }

        for entry in &self.entries {
            self.routing.add_connection(entry.conn.id().clone());
        }
        if let Some(default) = &self.default_connection {
            self.routing.set_default_connection(default.clone());
        }

        self.cancel = CancellationToken::new();
        for entry in &self.entries {
            self.tasks.push(tokio::spawn(recv_loop(
                Arc::clone(&entry.conn),
                entry.policy,
                self.inbox.clone(),
                Arc::clone(&self.routing),
                self.cancel.clone(),
                self.fatal.clone(),
                Arc::clone(&self.fatal_reason),
            )));
        }
        let conns: HashMap<ConnectionId, (Arc<dyn Connection>, ExceptionPolicy)> = self
            .entries
            .iter()
            .map(|e| (e.conn.id().clone(), (Arc::clone(&e.conn), e.policy)))
            .collect();
        self.tasks.push(tokio::spawn(send_loop(
            self.outbox.queue(),
            conns,
            Arc::clone(&self.routing),
            self.cancel.clone(),
            self.fatal.clone(),
            Arc::clone(&self.fatal_reason),
        )));

        self.set_state(MultiplexerState::Connected);
        Ok(())
    }

    /// Stop the loops and tear the connections down in reverse order.
    pub async fn disconnect(&mut self) {
        match self.state() {
            MultiplexerState::Connected | MultiplexerState::Connecting => {}
            _ => return,
        }
        self.set_state(MultiplexerState::Disconnecting);

        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        for entry in self.entries.iter().rev() {
            if let Err(e) = entry.conn.disconnect().await {
                warn!(connection = %entry.conn.id(), "disconnect failed: {e}");
            }
        }
        self.routing.clear_connections();
        self.set_state(MultiplexerState::Disconnected);
    }

    fn set_state(&self, state: MultiplexerState) {
        *self.state.lock().expect("state lock") = state;
    }
}

// ── Loops ─────────────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn recv_loop(
    conn: Arc<dyn Connection>,
    policy: ExceptionPolicy,
    inbox: Inbox,
    routing: Arc<RoutingTable>,
    cancel: CancellationToken,
    fatal: CancellationToken,
    fatal_reason: Arc<Mutex<Option<String>>>,
) {
    let mut backoff = BACKOFF_BASE;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = conn.receive() => match result {
                Ok(env) => {
                    backoff = BACKOFF_BASE;
                    if inbox.put(env).await.is_err() {
                        debug!(connection = %conn.id(), "inbox closed; stopping receive loop");
                        break;
                    }
                }
                Err(e) => match policy {
                    ExceptionPolicy::JustLog => {
                        let delay = jittered(backoff);
                        warn!(connection = %conn.id(), "receive error: {e}; retrying in {delay:?}");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        backoff = (backoff * 2).min(BACKOFF_MAX);
                    }
                    ExceptionPolicy::StopAndExit => {
                        warn!(connection = %conn.id(), "receive error: {e}; detaching connection");
                        routing.remove_connection(conn.id());
                        break;
                    }
                    ExceptionPolicy::Propagate => {
                        error!(connection = %conn.id(), "receive error: {e}; stopping multiplexer");
                        *fatal_reason.lock().expect("fatal lock") =
                            Some(format!("connection '{}': {e}", conn.id()));
                        fatal.cancel();
                        break;
                    }
                }
            }
        }
    }
}

async fn send_loop(
    queue: Queue<Envelope>,
    conns: HashMap<ConnectionId, (Arc<dyn Connection>, ExceptionPolicy)>,
    routing: Arc<RoutingTable>,
    cancel: CancellationToken,
    fatal: CancellationToken,
    fatal_reason: Arc<Mutex<Option<String>>>,
) {
    loop {
        let env = tokio::select! {
            _ = cancel.cancelled() => break,
            result = queue.recv() => match result {
                Ok(env) => env,
                Err(_) => break,
            }
        };

        let cid = match routing.resolve(&env) {
            Ok(cid) => cid,
            Err(e) => {
                // The outbox checks routability on put, so this only happens
                // when a connection was detached while the envelope waited.
                warn!("dropping envelope to {}: {e}", env.to);
                continue;
            }
        };
        let Some((conn, policy)) = conns.get(&cid) else {
            warn!(connection = %cid, "resolved to an unknown connection; dropping envelope");
            continue;
        };

        let mut attempt: u32 = 0;
        loop {
            match conn.send(env.clone()).await {
                Ok(()) => break,
                Err(e) => match policy {
                    ExceptionPolicy::JustLog if attempt < MAX_SEND_RETRIES => {
                        let delay = jittered(
                            (BACKOFF_BASE * 2u32.saturating_pow(attempt)).min(BACKOFF_MAX),
                        );
                        attempt += 1;
                        warn!(connection = %cid, "send error: {e}; retry {attempt} in {delay:?}");
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    ExceptionPolicy::JustLog => {
                        warn!(connection = %cid, "send error: {e}; giving up on this envelope");
                        break;
                    }
                    ExceptionPolicy::StopAndExit => {
                        warn!(connection = %cid, "send error: {e}; detaching connection");
                        routing.remove_connection(&cid);
                        break;
                    }
                    ExceptionPolicy::Propagate => {
                        error!(connection = %cid, "send error: {e}; stopping multiplexer");
                        *fatal_reason.lock().expect("fatal lock") =
                            Some(format!("connection '{cid}': {e}"));
                        fatal.cancel();
                        return;
                    }
                },
            }
        }
    }
}
