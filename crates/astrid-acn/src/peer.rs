//! The ACN peer: swarm event loop, DHT announcement and resolution, and
//! envelope routing.
//!
//! Obtain an [`AcnHandle`] before calling [`AcnPeer::run`] so you can route
//! envelopes and take the inbound receiver while the event loop runs inside
//! a spawned task. Long operations (DHT lookups, in-flight envelope
//! deliveries) are tracked in pending maps keyed by query/request ids so the
//! loop itself never blocks.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock,
    },
};

use futures::StreamExt;
use libp2p::{
    core::{muxing::StreamMuxerBox, upgrade},
    identify,
    kad::{self, QueryId, RecordKey},
    multiaddr::Protocol,
    noise, request_response,
    swarm::{Config as SwarmConfig, Swarm, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, Transport,
};
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use astrid_crypto::{Address, AgentRecord, Crypto, PublicKey};
use astrid_envelope::{codec as envelope_codec, Envelope};

use crate::behaviour::{AcnBehaviour, AcnBehaviourEvent};
use crate::config::AcnConfig;
use crate::delegate;
use crate::error::AcnError;
use crate::metrics::Metrics;
use crate::proto::{self, AcnMessage, Payload, StatusCode};
use crate::store::RecordStore;

type AcnSwarm = Swarm<AcnBehaviour>;
type ResponseChannel = request_response::ResponseChannel<AcnMessage>;
type OutboundRequestId = request_response::OutboundRequestId;

/// Cadence of the deadline sweep over pending lookups.
const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Provider announcements are retried this many times before giving up and
/// leaving the record in local state only.
const MAX_PROVIDE_ATTEMPTS: u32 = 3;

/// The Kademlia key for an agent address: a content hash of the ASCII
/// address string.
pub fn dht_key(address: &Address) -> RecordKey {
    RecordKey::new(&Sha256::digest(address.as_str().as_bytes()).to_vec())
}

// ── Commands ──────────────────────────────────────────────────────────────────

pub(crate) enum AcnCommand {
    Route {
        env: Envelope,
        reply: oneshot::Sender<Result<(), AcnError>>,
    },
    Lookup {
        address: Address,
        reply: oneshot::Sender<Result<(PeerId, AgentRecord), AcnError>>,
    },
    RegisterDelegate {
        record: AgentRecord,
        sink: mpsc::Sender<Envelope>,
        reply: oneshot::Sender<Result<(), AcnError>>,
        started: Instant,
    },
    UnregisterDelegate {
        address: Address,
    },
    /// Internal: a spawned task finished an inbound delivery and the stored
    /// response channel must be answered from inside the event loop.
    Respond {
        channel: ResponseChannel,
        message: AcnMessage,
    },
    Shutdown,
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Cheap-to-clone handle to a running [`AcnPeer`].
#[derive(Clone)]
pub struct AcnHandle {
    cmd_tx: mpsc::Sender<AcnCommand>,
    peer_id: PeerId,
    agent_address: Address,
    inbound: Arc<Mutex<Option<mpsc::Receiver<Envelope>>>>,
    inbound_taken: Arc<AtomicBool>,
    listen_addrs: Arc<Mutex<Vec<Multiaddr>>>,
    delegate_addr: Arc<Mutex<Option<std::net::SocketAddr>>>,
    metrics: Arc<Metrics>,
}

impl AcnHandle {
    /// Route one envelope; resolves once the envelope is delivered (or a
    /// `Status` from the remote peer arrives) and fails otherwise.
    pub async fn route(&self, env: Envelope) -> Result<(), AcnError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(AcnCommand::Route {
                env,
                reply: reply_tx,
            })
            .await
            .map_err(|_| AcnError::Shutdown)?;
        reply_rx.await.map_err(|_| AcnError::Shutdown)?
    }

    /// Resolve an agent address to `(peer_id, record)` via the local tables
    /// or the DHT.
    pub async fn lookup(&self, address: Address) -> Result<(PeerId, AgentRecord), AcnError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(AcnCommand::Lookup {
                address,
                reply: reply_tx,
            })
            .await
            .map_err(|_| AcnError::Shutdown)?;
        reply_rx.await.map_err(|_| AcnError::Shutdown)?
    }

    /// Take the inbound envelope receiver. The first caller gets it; the
    /// peer treats the local agent as ready from this point on.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<Envelope>> {
        let rx = self.inbound.lock().expect("inbound lock").take();
        if rx.is_some() {
            self.inbound_taken.store(true, Ordering::Release);
        }
        rx
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(AcnCommand::Shutdown).await;
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn agent_address(&self) -> &Address {
        &self.agent_address
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Multiaddresses the peer listens on (with the `/p2p/` suffix), filled
    /// in as listeners come up.
    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.listen_addrs.lock().expect("listen lock").clone()
    }

    /// Bound address of the delegate TCP service, once it is up.
    pub fn delegate_addr(&self) -> Option<std::net::SocketAddr> {
        *self.delegate_addr.lock().expect("delegate addr lock")
    }
}

// ── Peer ──────────────────────────────────────────────────────────────────────

pub struct AcnPeer {
    config: AcnConfig,
    peer_id: PeerId,
    cmd_tx: mpsc::Sender<AcnCommand>,
    cmd_rx: mpsc::Receiver<AcnCommand>,
    local_tx: mpsc::Sender<Envelope>,
    inbound: Arc<Mutex<Option<mpsc::Receiver<Envelope>>>>,
    inbound_taken: Arc<AtomicBool>,
    listen_addrs: Arc<Mutex<Vec<Multiaddr>>>,
    delegate_addr: Arc<Mutex<Option<std::net::SocketAddr>>>,
    metrics: Arc<Metrics>,
}

impl AcnPeer {
    pub fn new(config: AcnConfig) -> Self {
        let peer_id = PeerId::from(config.keypair.public());
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (local_tx, local_rx) = mpsc::channel(config.local_queue);
        Self {
            config,
            peer_id,
            cmd_tx,
            cmd_rx,
            local_tx,
            inbound: Arc::new(Mutex::new(Some(local_rx))),
            inbound_taken: Arc::new(AtomicBool::new(false)),
            listen_addrs: Arc::new(Mutex::new(Vec::new())),
            delegate_addr: Arc::new(Mutex::new(None)),
            metrics: Metrics::new(),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn handle(&self) -> AcnHandle {
        AcnHandle {
            cmd_tx: self.cmd_tx.clone(),
            peer_id: self.peer_id,
            agent_address: self.config.crypto.address().clone(),
            inbound: Arc::clone(&self.inbound),
            inbound_taken: Arc::clone(&self.inbound_taken),
            listen_addrs: Arc::clone(&self.listen_addrs),
            delegate_addr: Arc::clone(&self.delegate_addr),
            metrics: Arc::clone(&self.metrics),
        }
    }

    /// Build the swarm, replay the record store, start the delegate service,
    /// then run the event loop until `Shutdown`.
    pub async fn run(self) -> Result<(), AcnError> {
        let node_public_key = self.config.keypair.public();
        info!(peer_id = %self.peer_id, address = %self.config.crypto.address(), "ACN peer starting");

        let mut swarm = build_swarm(&self.config)?;
        swarm
            .listen_on(self.config.listen_addr.clone())
            .map_err(|e| AcnError::Transport(e.to_string()))?;
        if let Some(public) = &self.config.public_addr {
            swarm.add_external_address(public.clone());
        }

        // Replay persisted relay records. Live routes come back only when
        // the clients reconnect; the records let us answer lookups and
        // re-announce after bootstrap.
        let store_path = self.config.store_path.clone().unwrap_or_else(|| {
            PathBuf::from(format!("./agent_records_store_{}", self.peer_id))
        });
        let (store, restored) = RecordStore::open(&store_path)?;
        let mut relay_table: HashMap<Address, RelayEntry> = HashMap::new();
        for record in restored {
            relay_table.insert(
                record.address.clone(),
                RelayEntry {
                    record,
                    peer_id: None,
                },
            );
        }
        if !relay_table.is_empty() {
            info!(count = relay_table.len(), "restored relay records from {}", store_path.display());
        }

        // Dial bootstrap peers (and the relay, which is implicitly one).
        let mut bootstrap_peers = HashSet::new();
        let mut dial_addrs: Vec<Multiaddr> = self.config.bootstrap.clone();
        if let Some(relay) = &self.config.relay {
            dial_addrs.push(relay.clone());
        }
        for addr in &dial_addrs {
            let Some(peer) = peer_id_from_addr(addr) else {
                return Err(AcnError::Config(format!(
                    "bootstrap address {addr} has no /p2p component"
                )));
            };
            bootstrap_peers.insert(peer);
            let mut transport_addr = addr.clone();
            if matches!(transport_addr.iter().last(), Some(Protocol::P2p(_))) {
                transport_addr.pop();
            }
            swarm
                .behaviour_mut()
                .kad
                .add_address(&peer, transport_addr.clone());
            if let Err(e) = swarm.dial(addr.clone()) {
                warn!("failed to dial bootstrap peer {addr}: {e}");
            }
        }

        let relay_peer = self.config.relay.as_ref().and_then(peer_id_from_addr);
        let relay_mode = self.config.relay.is_some();

        // Own record: in relay mode the representative is the relay node,
        // whose public key arrives via identify after connecting.
        let own_record = if relay_mode {
            None
        } else {
            Some(
                AgentRecord::new_signed(
                    &self.config.crypto,
                    &node_public_key,
                    self.config.record_validity,
                )
                .map_err(|e| AcnError::Config(format!("cannot sign own record: {e}")))?,
            )
        };

        // Delegate TCP service.
        let delegate_cancel = CancellationToken::new();
        if let Some(bind) = self.config.delegate_addr {
            let listener = TcpListener::bind(bind)
                .await
                .map_err(|e| AcnError::Config(format!("delegate bind {bind}: {e}")))?;
            *self.delegate_addr.lock().expect("delegate addr lock") =
                listener.local_addr().ok();
            tokio::spawn(delegate::run_service(
                listener,
                self.cmd_tx.clone(),
                Arc::clone(&self.metrics),
                delegate_cancel.clone(),
                self.config.timeouts.registration,
            ));
        }

        let bootstrapped = bootstrap_peers.is_empty();
        let mut state = PeerState {
            peer_id: self.peer_id,
            node_public_key,
            crypto: self.config.crypto.clone(),
            own_address: self.config.crypto.address().clone(),
            own_record,
            relay_mode,
            relay_peer,
            relay_registered: false,
            notified: HashSet::new(),
            relay_table: Arc::new(RwLock::new(relay_table)),
            delegate_table: Arc::new(RwLock::new(HashMap::new())),
            store: Mutex::new(store),
            metrics: Arc::clone(&self.metrics),
            local_tx: self.local_tx.clone(),
            inbound_taken: Arc::clone(&self.inbound_taken),
            cmd_tx: self.cmd_tx.clone(),
            bootstrap_peers,
            bootstrapped,
            lookups: HashMap::new(),
            next_lookup_id: 0,
            kad_queries: HashMap::new(),
            provides: HashMap::new(),
            requests: HashMap::new(),
            timeouts: self.config.timeouts,
            record_validity: self.config.record_validity,
            local_retries: self.config.local_retries,
            local_retry_delay: self.config.local_retry_delay,
            listen_addrs: Arc::clone(&self.listen_addrs),
            delegate_cancel,
        };

        if state.bootstrapped {
            state.on_bootstrapped(&mut swarm);
        }
        state.event_loop(swarm, self.cmd_rx).await;
        Ok(())
    }
}

// ── Peer state ────────────────────────────────────────────────────────────────

struct RelayEntry {
    record: AgentRecord,
    /// Live route to the client; `None` after a disconnect (or a restart)
    /// until the client registers again.
    peer_id: Option<PeerId>,
}

struct DelegateEntry {
    record: AgentRecord,
    sink: mpsc::Sender<Envelope>,
}

/// Completion side of one route command, carrying the latency sample.
struct RouteReply {
    tx: Option<oneshot::Sender<Result<(), AcnError>>>,
    started: Instant,
    metrics: Arc<Metrics>,
}

impl RouteReply {
    fn new(
        tx: oneshot::Sender<Result<(), AcnError>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        metrics.route_attempts.inc();
        metrics.inflight_routes.inc();
        Self {
            tx: Some(tx),
            started: Instant::now(),
            metrics,
        }
    }

    fn finish(mut self, result: Result<(), AcnError>) {
        self.metrics.inflight_routes.dec();
        Metrics::observe_since(&self.metrics.route_us, self.started);
        if result.is_ok() {
            self.metrics.route_successes.inc();
        }
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(result);
        }
    }
}

impl Drop for RouteReply {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            self.metrics.inflight_routes.dec();
            let _ = tx.send(Err(AcnError::Shutdown));
        }
    }
}

enum LookupPurpose {
    Resolve(oneshot::Sender<Result<(PeerId, AgentRecord), AcnError>>),
    Route { env: Envelope, reply: RouteReply },
}

struct PendingLookup {
    address: Address,
    providers: VecDeque<PeerId>,
    tried: HashSet<PeerId>,
    deadline: Instant,
    started: Instant,
    purpose: LookupPurpose,
    query_done: bool,
    in_flight: bool,
}

enum RequestCtx {
    Notif,
    RelayRegister,
    Lookup { lookup_id: u64 },
    Envelope { reply: RouteReply },
    /// An envelope forwarded to a relay client on behalf of a remote
    /// sender; the client's status is relayed back through this channel.
    ForwardedEnvelope { channel: ResponseChannel },
}

struct PeerState {
    peer_id: PeerId,
    node_public_key: PublicKey,
    crypto: Crypto,
    own_address: Address,
    own_record: Option<AgentRecord>,
    relay_mode: bool,
    relay_peer: Option<PeerId>,
    relay_registered: bool,
    /// Peers we already exchanged a bootstrap notification with.
    notified: HashSet<PeerId>,
    relay_table: Arc<RwLock<HashMap<Address, RelayEntry>>>,
    delegate_table: Arc<RwLock<HashMap<Address, DelegateEntry>>>,
    store: Mutex<RecordStore>,
    metrics: Arc<Metrics>,
    local_tx: mpsc::Sender<Envelope>,
    inbound_taken: Arc<AtomicBool>,
    cmd_tx: mpsc::Sender<AcnCommand>,
    bootstrap_peers: HashSet<PeerId>,
    bootstrapped: bool,
    lookups: HashMap<u64, PendingLookup>,
    next_lookup_id: u64,
    kad_queries: HashMap<QueryId, u64>,
    provides: HashMap<QueryId, ProvideCtx>,
    requests: HashMap<OutboundRequestId, RequestCtx>,
    timeouts: crate::config::AcnTimeouts,
    record_validity: chrono::Duration,
    local_retries: u32,
    local_retry_delay: Duration,
    listen_addrs: Arc<Mutex<Vec<Multiaddr>>>,
    delegate_cancel: CancellationToken,
}

struct ProvideCtx {
    address: Address,
    started: Instant,
    attempts: u32,
}

impl PeerState {
    // ── Event loop ───────────────────────────────────────────────────────────

    async fn event_loop(mut self, mut swarm: AcnSwarm, mut cmd_rx: mpsc::Receiver<AcnCommand>) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = swarm.select_next_some() => {
                    self.on_swarm_event(&mut swarm, event);
                }
                Some(cmd) = cmd_rx.recv() => {
                    if self.on_command(&mut swarm, cmd) { break; }
                }
                _ = sweep.tick() => {
                    self.sweep_deadlines();
                }
            }
        }
        self.delegate_cancel.cancel();
        info!(peer_id = %self.peer_id, "ACN peer shut down");
    }

    // ── Swarm events ─────────────────────────────────────────────────────────

    fn on_swarm_event(&mut self, swarm: &mut AcnSwarm, event: SwarmEvent<AcnBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(peer_id = %self.peer_id, "listening on {address}");
                let full = address.with(Protocol::P2p(self.peer_id));
                self.listen_addrs.lock().expect("listen lock").push(full);
            }

            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                if self.bootstrap_peers.contains(&peer_id) && self.notified.insert(peer_id) {
                    // Confirm the join with a notification round-trip.
                    let id = swarm
                        .behaviour_mut()
                        .acn
                        .send_request(&peer_id, AcnMessage::notif());
                    self.requests.insert(id, RequestCtx::Notif);
                }
            }

            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established: 0,
                ..
            } => {
                self.on_peer_disconnected(peer_id);
            }

            SwarmEvent::Behaviour(AcnBehaviourEvent::Identify(event)) => {
                if let identify::Event::Received { peer_id, info, .. } = *event {
                    for addr in info.listen_addrs {
                        swarm.behaviour_mut().kad.add_address(&peer_id, addr);
                    }
                    if self.relay_mode && Some(peer_id) == self.relay_peer {
                        self.on_relay_identified(swarm, info.public_key);
                    }
                }
            }

            SwarmEvent::Behaviour(AcnBehaviourEvent::Kad(
                kad::Event::OutboundQueryProgressed { id, result, .. },
            )) => {
                self.on_kad_result(swarm, id, result);
            }

            SwarmEvent::Behaviour(AcnBehaviourEvent::Acn(request_response::Event::Message {
                peer,
                message,
                ..
            })) => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => {
                    self.on_request(swarm, peer, request, channel);
                }
                request_response::Message::Response {
                    request_id,
                    response,
                    ..
                } => {
                    self.on_response(swarm, peer, request_id, response);
                }
            },

            SwarmEvent::Behaviour(AcnBehaviourEvent::Acn(
                request_response::Event::OutboundFailure {
                    peer,
                    request_id,
                    error,
                    ..
                },
            )) => {
                self.on_outbound_failure(swarm, peer, request_id, &error.to_string());
            }

            SwarmEvent::Behaviour(AcnBehaviourEvent::Acn(
                request_response::Event::InboundFailure { peer, error, .. },
            )) => {
                debug!(%peer, "inbound stream failure: {error}");
            }

            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                debug!(?peer_id, "outgoing connection error: {error}");
            }

            _ => {}
        }
    }

    fn on_peer_disconnected(&mut self, peer_id: PeerId) {
        let mut lost = Vec::new();
        {
            let mut table = self.relay_table.write().expect("relay lock");
            for (address, entry) in table.iter_mut() {
                if entry.peer_id == Some(peer_id) {
                    entry.peer_id = None;
                    lost.push(address.clone());
                }
            }
        }
        for address in lost {
            self.metrics.active_relays.dec();
            debug!(%address, "relay client disconnected; record kept");
        }
        if self.relay_mode && Some(peer_id) == self.relay_peer {
            warn!("relay connection lost; routing is degraded until it returns");
            self.relay_registered = false;
        }
    }

    fn on_relay_identified(&mut self, swarm: &mut AcnSwarm, relay_key: PublicKey) {
        if self.own_record.is_none() {
            match AgentRecord::new_signed(&self.crypto, &relay_key, self.record_validity) {
                Ok(record) => self.own_record = Some(record),
                Err(e) => {
                    warn!("cannot sign own record for relay: {e}");
                    return;
                }
            }
        }
        self.maybe_register_with_relay(swarm);
    }

    fn maybe_register_with_relay(&mut self, swarm: &mut AcnSwarm) {
        if self.relay_registered || !self.bootstrapped {
            return;
        }
        let (Some(relay), Some(record)) = (self.relay_peer, self.own_record.as_ref()) else {
            return;
        };
        let id = swarm
            .behaviour_mut()
            .acn
            .send_request(&relay, AcnMessage::register(record));
        self.requests.insert(id, RequestCtx::RelayRegister);
    }

    fn on_bootstrapped(&mut self, swarm: &mut AcnSwarm) {
        info!(peer_id = %self.peer_id, "bootstrap confirmed");
        if let Err(e) = swarm.behaviour_mut().kad.bootstrap() {
            debug!("kad bootstrap skipped: {e}");
        }
        if !self.relay_mode {
            let own = self.own_address.clone();
            self.announce(swarm, &own);
        }
        // One table lock at a time.
        let mut addresses: Vec<Address> = self
            .relay_table
            .read()
            .expect("relay lock")
            .keys()
            .cloned()
            .collect();
        addresses.extend(
            self.delegate_table
                .read()
                .expect("delegate lock")
                .keys()
                .cloned(),
        );
        for address in addresses {
            self.announce(swarm, &address);
        }
        self.maybe_register_with_relay(swarm);
    }

    // ── DHT ──────────────────────────────────────────────────────────────────

    fn announce(&mut self, swarm: &mut AcnSwarm, address: &Address) {
        if self.relay_mode {
            return; // the relay announces on our behalf
        }
        if !self.bootstrapped {
            return; // re-announced once bootstrap is confirmed
        }
        match swarm.behaviour_mut().kad.start_providing(dht_key(address)) {
            Ok(query_id) => {
                self.provides.insert(
                    query_id,
                    ProvideCtx {
                        address: address.clone(),
                        started: Instant::now(),
                        attempts: 1,
                    },
                );
            }
            Err(e) => warn!(%address, "provider announcement failed: {e}"),
        }
    }

    fn on_kad_result(&mut self, swarm: &mut AcnSwarm, id: QueryId, result: kad::QueryResult) {
        match result {
            kad::QueryResult::StartProviding(outcome) => {
                let Some(ctx) = self.provides.remove(&id) else { return };
                match outcome {
                    Ok(_) => {
                        Metrics::observe_since(&self.metrics.dht_store_us, ctx.started);
                        debug!(address = %ctx.address, "announced on the DHT");
                    }
                    Err(e) => {
                        if ctx.attempts < MAX_PROVIDE_ATTEMPTS {
                            debug!(address = %ctx.address, "announcement retry: {e}");
                            match swarm
                                .behaviour_mut()
                                .kad
                                .start_providing(dht_key(&ctx.address))
                            {
                                Ok(query_id) => {
                                    self.provides.insert(
                                        query_id,
                                        ProvideCtx {
                                            attempts: ctx.attempts + 1,
                                            ..ctx
                                        },
                                    );
                                }
                                Err(e) => warn!(address = %ctx.address, "announcement failed: {e}"),
                            }
                        } else {
                            // The record stays in local state; lookups served
                            // from our tables still succeed.
                            warn!(address = %ctx.address, "announcement gave up: {e}");
                        }
                    }
                }
            }

            kad::QueryResult::GetProviders(outcome) => {
                let Some(&lookup_id) = self.kad_queries.get(&id) else { return };
                let local_peer = self.peer_id;
                let mut ready = false;
                match outcome {
                    Ok(kad::GetProvidersOk::FoundProviders { providers, .. }) => {
                        if let Some(lookup) = self.lookups.get_mut(&lookup_id) {
                            for provider in providers {
                                if provider != local_peer && !lookup.tried.contains(&provider) {
                                    lookup.providers.push_back(provider);
                                }
                            }
                            ready = !lookup.in_flight;
                        }
                    }
                    Ok(kad::GetProvidersOk::FinishedWithNoAdditionalRecord { .. }) => {
                        self.kad_queries.remove(&id);
                        if let Some(lookup) = self.lookups.get_mut(&lookup_id) {
                            lookup.query_done = true;
                            ready = !lookup.in_flight;
                        }
                    }
                    Err(e) => {
                        self.kad_queries.remove(&id);
                        if let Some(lookup) = self.lookups.get_mut(&lookup_id) {
                            debug!(address = %lookup.address, "provider query failed: {e}");
                            lookup.query_done = true;
                            ready = !lookup.in_flight;
                        }
                    }
                }
                if ready {
                    self.try_next_provider(swarm, lookup_id);
                }
            }

            _ => {}
        }
    }

    // ── Lookups ──────────────────────────────────────────────────────────────

    fn start_lookup(&mut self, swarm: &mut AcnSwarm, address: Address, purpose: LookupPurpose) {
        let now = Instant::now();
        let lookup_id = self.next_lookup_id;
        self.next_lookup_id += 1;

        let query_id = swarm.behaviour_mut().kad.get_providers(dht_key(&address));
        self.kad_queries.insert(query_id, lookup_id);
        self.lookups.insert(
            lookup_id,
            PendingLookup {
                address,
                providers: VecDeque::new(),
                tried: HashSet::new(),
                deadline: now + self.timeouts.lookup,
                started: now,
                purpose,
                query_done: false,
                in_flight: false,
            },
        );
    }

    fn try_next_provider(&mut self, swarm: &mut AcnSwarm, lookup_id: u64) {
        let Some(lookup) = self.lookups.get_mut(&lookup_id) else { return };
        if Instant::now() >= lookup.deadline {
            self.fail_lookup(lookup_id, "resolution timed out");
            return;
        }
        while let Some(provider) = lookup.providers.pop_front() {
            if !lookup.tried.insert(provider) {
                continue;
            }
            let request_id = swarm
                .behaviour_mut()
                .acn
                .send_request(&provider, AcnMessage::lookup_request(lookup.address.as_str()));
            self.requests
                .insert(request_id, RequestCtx::Lookup { lookup_id });
            lookup.in_flight = true;
            return;
        }
        lookup.in_flight = false;
        if lookup.query_done {
            self.fail_lookup(lookup_id, "no valid provider found");
        }
    }

    fn fail_lookup(&mut self, lookup_id: u64, reason: &str) {
        let Some(lookup) = self.lookups.remove(&lookup_id) else { return };
        debug!(address = %lookup.address, "lookup failed: {reason}");
        let err = || AcnError::AgentNotFound(format!("{}: {reason}", lookup.address));
        match lookup.purpose {
            LookupPurpose::Resolve(tx) => {
                let _ = tx.send(Err(err()));
            }
            LookupPurpose::Route { reply, .. } => reply.finish(Err(err())),
        }
    }

    fn complete_lookup(
        &mut self,
        swarm: &mut AcnSwarm,
        lookup_id: u64,
        provider: PeerId,
        record: AgentRecord,
    ) {
        let Some(lookup) = self.lookups.remove(&lookup_id) else { return };
        Metrics::observe_since(&self.metrics.dht_lookup_us, lookup.started);
        match lookup.purpose {
            LookupPurpose::Resolve(tx) => {
                let _ = tx.send(Ok((provider, record)));
            }
            LookupPurpose::Route { env, reply } => {
                self.send_envelope(swarm, provider, env, reply);
            }
        }
    }

    /// Validate a lookup response against the provider that sent it: the
    /// record must be a valid PoR and its representative key must be the
    /// provider's own identity key.
    fn validate_lookup_record(
        &self,
        provider: PeerId,
        record: &AgentRecord,
        address: &Address,
    ) -> Result<(), AcnError> {
        if record.address != *address {
            return Err(AcnError::InvalidPor(format!(
                "record is for {}, requested {address}",
                record.address
            )));
        }
        record
            .verify(chrono::Utc::now())
            .map_err(|e| AcnError::InvalidPor(e.to_string()))?;
        let representative = record
            .representative_key()
            .map_err(|e| AcnError::InvalidPor(e.to_string()))?;
        if representative.to_peer_id() != provider {
            return Err(AcnError::InvalidPor(
                "representative key does not match the answering provider".into(),
            ));
        }
        Ok(())
    }

    // ── Requests from remote peers ───────────────────────────────────────────

    fn on_request(
        &mut self,
        swarm: &mut AcnSwarm,
        peer: PeerId,
        request: AcnMessage,
        channel: ResponseChannel,
    ) {
        match request.payload {
            Some(Payload::Register(register)) => {
                let response = self.handle_register(swarm, peer, register.record);
                respond(swarm, channel, response);
            }
            Some(Payload::LookupRequest(lookup)) => {
                let response = self.handle_lookup_request(&lookup.agent_address);
                respond(swarm, channel, response);
            }
            Some(Payload::AeaEnvelope(aea)) => {
                self.handle_inbound_envelope(swarm, aea, channel);
            }
            Some(Payload::Notif(_)) => {
                respond(swarm, channel, AcnMessage::success());
            }
            other => {
                respond(
                    swarm,
                    channel,
                    AcnMessage::error(
                        StatusCode::ErrorUnexpectedPayload,
                        format!("unexpected request: {}", proto::payload_name(&other)),
                    ),
                );
            }
        }
    }

    fn handle_register(
        &mut self,
        swarm: &mut AcnSwarm,
        peer: PeerId,
        record: Option<proto::AgentRecordProto>,
    ) -> AcnMessage {
        let started = Instant::now();
        let record = match record.ok_or_else(|| AcnError::UnexpectedPayload("register without record".into()))
            .and_then(AgentRecord::try_from)
        {
            Ok(record) => record,
            Err(e) => return AcnMessage::error(e.status_code(), e.to_string()),
        };
        if let Err(e) = self.verify_client_record(&record) {
            return AcnMessage::error(e.status_code(), e.to_string());
        }

        let address = record.address.clone();
        if let Err(e) = self.store.lock().expect("store lock").append(&record) {
            return AcnMessage::error(StatusCode::ErrorGeneric, e.to_string());
        }
        {
            let mut table = self.relay_table.write().expect("relay lock");
            table.insert(
                address.clone(),
                RelayEntry {
                    record,
                    peer_id: Some(peer),
                },
            );
        }
        self.metrics.relay_registrations.inc();
        self.metrics.active_relays.inc();
        Metrics::observe_since(&self.metrics.register_us, started);
        info!(%address, client = %peer, "relay client registered");

        self.announce(swarm, &address);
        AcnMessage::success()
    }

    /// PoR check for registering clients (relay and delegate): valid record,
    /// and the representative must be this node, since that is what the
    /// client authorizes us to be.
    fn verify_client_record(&self, record: &AgentRecord) -> Result<(), AcnError> {
        record
            .verify(chrono::Utc::now())
            .map_err(|e| AcnError::InvalidPor(e.to_string()))?;
        record
            .verify_representative(&self.node_public_key)
            .map_err(|e| AcnError::InvalidPor(e.to_string()))?;
        Ok(())
    }

    fn handle_lookup_request(&self, raw_address: &str) -> AcnMessage {
        let Ok(address) = raw_address.parse::<Address>() else {
            return AcnMessage::error(
                StatusCode::ErrorSerialization,
                format!("malformed address {raw_address:?}"),
            );
        };
        if address == self.own_address {
            if let Some(record) = &self.own_record {
                return AcnMessage::lookup_response(record);
            }
        }
        if let Some(entry) = self.relay_table.read().expect("relay lock").get(&address) {
            return AcnMessage::lookup_response(&entry.record);
        }
        if let Some(entry) = self
            .delegate_table
            .read()
            .expect("delegate lock")
            .get(&address)
        {
            return AcnMessage::lookup_response(&entry.record);
        }
        AcnMessage::error(
            StatusCode::ErrorUnknownAgentAddress,
            format!("{address} is not registered here"),
        )
    }

    fn handle_inbound_envelope(
        &mut self,
        swarm: &mut AcnSwarm,
        aea: proto::AeaEnvelope,
        channel: ResponseChannel,
    ) {
        let envelope = match envelope_codec::decode_payload(&aea.envelope) {
            Ok(env) => env,
            Err(e) => {
                respond(
                    swarm,
                    channel,
                    AcnMessage::error(StatusCode::ErrorSerialization, e.to_string()),
                );
                return;
            }
        };
        // The sender record proves the originating agent authorized some
        // node to speak for it; transport identity is already covered by the
        // Noise handshake of the connection it arrived on.
        let record = match aea
            .record
            .ok_or_else(|| AcnError::InvalidPor("envelope without sender record".into()))
            .and_then(|r| AgentRecord::try_from(r).map_err(|e| AcnError::InvalidPor(e.to_string())))
        {
            Ok(record) => record,
            Err(e) => {
                respond(swarm, channel, AcnMessage::error(e.status_code(), e.to_string()));
                return;
            }
        };
        if let Err(e) = record.verify(chrono::Utc::now()) {
            respond(
                swarm,
                channel,
                AcnMessage::error(StatusCode::ErrorInvalidPor, e.to_string()),
            );
            return;
        }
        if record.address != envelope.sender {
            respond(
                swarm,
                channel,
                AcnMessage::error(
                    StatusCode::ErrorInvalidPor,
                    format!(
                        "record is for {}, envelope sender is {}",
                        record.address, envelope.sender
                    ),
                ),
            );
            return;
        }

        // Local cases first, then relay forwarding; everything else is not
        // ours to route.
        if envelope.to == self.own_address {
            self.deliver_local_with_channel(envelope, channel);
            return;
        }
        let delegate_sink = self
            .delegate_table
            .read()
            .expect("delegate lock")
            .get(&envelope.to)
            .map(|entry| entry.sink.clone());
        if let Some(sink) = delegate_sink {
            self.deliver_delegate_with_channel(sink, envelope, channel);
            return;
        }
        let relay_route = self
            .relay_table
            .read()
            .expect("relay lock")
            .get(&envelope.to)
            .map(|entry| entry.peer_id);
        match relay_route {
            Some(Some(client)) => {
                let request_id = swarm.behaviour_mut().acn.send_request(
                    &client,
                    AcnMessage::aea_envelope(aea.envelope, &record),
                );
                self.requests
                    .insert(request_id, RequestCtx::ForwardedEnvelope { channel });
            }
            Some(None) => {
                respond(
                    swarm,
                    channel,
                    AcnMessage::error(
                        StatusCode::ErrorAgentNotReady,
                        format!("{} is registered but not connected", envelope.to),
                    ),
                );
            }
            None => {
                respond(
                    swarm,
                    channel,
                    AcnMessage::error(
                        StatusCode::ErrorUnknownAgentAddress,
                        format!("{} is not registered here", envelope.to),
                    ),
                );
            }
        }
    }

    /// Deliver to the local agent, answering the stored response channel via
    /// the internal command queue once the outcome is known.
    fn deliver_local_with_channel(&self, envelope: Envelope, channel: ResponseChannel) {
        let (tx, rx) = oneshot::channel();
        self.deliver_local(envelope, tx);
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let message = match rx.await {
                Ok(Ok(())) => AcnMessage::success(),
                Ok(Err(e)) => AcnMessage::error(e.status_code(), e.to_string()),
                Err(_) => AcnMessage::error(StatusCode::ErrorGeneric, "delivery aborted"),
            };
            let _ = cmd_tx.send(AcnCommand::Respond { channel, message }).await;
        });
    }

    fn deliver_delegate_with_channel(
        &self,
        sink: mpsc::Sender<Envelope>,
        envelope: Envelope,
        channel: ResponseChannel,
    ) {
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let message = match sink.send(envelope).await {
                Ok(()) => AcnMessage::success(),
                Err(_) => AcnMessage::error(
                    StatusCode::ErrorAgentNotReady,
                    "delegate connection closed",
                ),
            };
            let _ = cmd_tx.send(AcnCommand::Respond { channel, message }).await;
        });
    }

    /// Local delivery with backoff while the agent has not yet attached its
    /// inbox (or the queue is full), up to the configured cap.
    fn deliver_local(&self, envelope: Envelope, reply: oneshot::Sender<Result<(), AcnError>>) {
        let local_tx = self.local_tx.clone();
        let attached = Arc::clone(&self.inbound_taken);
        let retries = self.local_retries;
        let delay = self.local_retry_delay;
        tokio::spawn(async move {
            let mut attempts = 0;
            loop {
                if attached.load(Ordering::Acquire) {
                    match tokio::time::timeout(delay, local_tx.send(envelope.clone())).await {
                        Ok(Ok(())) => {
                            let _ = reply.send(Ok(()));
                            return;
                        }
                        Ok(Err(_)) => {
                            let _ = reply.send(Err(AcnError::AgentNotReady(
                                "local agent inbox closed".into(),
                            )));
                            return;
                        }
                        Err(_) => {} // queue full; retry below
                    }
                }
                attempts += 1;
                if attempts > retries {
                    let _ = reply.send(Err(AcnError::AgentNotReady(
                        "local agent did not become ready in time".into(),
                    )));
                    return;
                }
                tokio::time::sleep(delay).await;
            }
        });
    }

    // ── Responses to our requests ────────────────────────────────────────────

    fn on_response(
        &mut self,
        swarm: &mut AcnSwarm,
        peer: PeerId,
        request_id: OutboundRequestId,
        response: AcnMessage,
    ) {
        let Some(ctx) = self.requests.remove(&request_id) else { return };
        match ctx {
            RequestCtx::Notif => match response.into_result() {
                Ok(()) => {
                    if !self.bootstrapped {
                        self.bootstrapped = true;
                        self.on_bootstrapped(swarm);
                    }
                }
                Err(e) => warn!("bootstrap notification rejected: {e}"),
            },

            RequestCtx::RelayRegister => match response.into_result() {
                Ok(()) => {
                    self.relay_registered = true;
                    info!("registered with relay peer");
                }
                Err(e) => warn!("relay registration failed: {e}"),
            },

            RequestCtx::Lookup { lookup_id } => {
                self.on_lookup_response(swarm, peer, lookup_id, response);
            }

            RequestCtx::Envelope { reply } => {
                reply.finish(response.into_result());
            }

            RequestCtx::ForwardedEnvelope { channel } => {
                respond(swarm, channel, response);
            }
        }
    }

    fn on_lookup_response(
        &mut self,
        swarm: &mut AcnSwarm,
        provider: PeerId,
        lookup_id: u64,
        response: AcnMessage,
    ) {
        let address = match self.lookups.get_mut(&lookup_id) {
            Some(lookup) => {
                lookup.in_flight = false;
                lookup.address.clone()
            }
            None => return,
        };
        match response.payload {
            Some(Payload::LookupResponse(resp)) => {
                let validated = resp
                    .record
                    .ok_or_else(|| {
                        AcnError::UnexpectedPayload("lookup response without record".into())
                    })
                    .and_then(|r| {
                        AgentRecord::try_from(r).map_err(|e| AcnError::InvalidPor(e.to_string()))
                    })
                    .and_then(|record| {
                        self.validate_lookup_record(provider, &record, &address)?;
                        Ok(record)
                    });
                match validated {
                    Ok(record) => {
                        self.complete_lookup(swarm, lookup_id, provider, record);
                        return;
                    }
                    Err(e) => debug!(%address, %provider, "rejected lookup response: {e}"),
                }
            }
            Some(Payload::Status(status)) => {
                let code =
                    StatusCode::try_from(status.code).unwrap_or(StatusCode::ErrorGeneric);
                debug!(%address, %provider, "provider answered: {}",
                       AcnError::from_status(code, &status.msgs));
            }
            ref other => {
                debug!(%address, "unexpected lookup response payload: {}",
                       proto::payload_name(other));
            }
        }
        self.try_next_provider(swarm, lookup_id);
    }

    fn on_outbound_failure(
        &mut self,
        swarm: &mut AcnSwarm,
        peer: PeerId,
        request_id: OutboundRequestId,
        error: &str,
    ) {
        let Some(ctx) = self.requests.remove(&request_id) else { return };
        match ctx {
            RequestCtx::Notif => {
                // Allow another notification attempt on the next connection.
                self.notified.remove(&peer);
                debug!(%peer, "bootstrap notification failed: {error}");
            }
            RequestCtx::RelayRegister => warn!("relay registration failed: {error}"),
            RequestCtx::Lookup { lookup_id } => {
                if let Some(lookup) = self.lookups.get_mut(&lookup_id) {
                    lookup.in_flight = false;
                }
                self.try_next_provider(swarm, lookup_id);
            }
            RequestCtx::Envelope { reply } => {
                reply.finish(Err(AcnError::Transport(error.to_string())));
            }
            RequestCtx::ForwardedEnvelope { channel } => {
                respond(
                    swarm,
                    channel,
                    AcnMessage::error(StatusCode::ErrorGeneric, error),
                );
            }
        }
    }

    // ── Commands ─────────────────────────────────────────────────────────────

    /// Returns `true` when the loop should exit.
    fn on_command(&mut self, swarm: &mut AcnSwarm, cmd: AcnCommand) -> bool {
        match cmd {
            AcnCommand::Route { env, reply } => {
                let reply = RouteReply::new(reply, Arc::clone(&self.metrics));
                self.route_envelope(swarm, env, reply);
                false
            }
            AcnCommand::Lookup { address, reply } => {
                self.start_lookup(swarm, address, LookupPurpose::Resolve(reply));
                false
            }
            AcnCommand::RegisterDelegate {
                record,
                sink,
                reply,
                started,
            } => {
                let result = self.register_delegate(swarm, record, sink, started);
                let _ = reply.send(result);
                false
            }
            AcnCommand::UnregisterDelegate { address } => {
                let removed = self
                    .delegate_table
                    .write()
                    .expect("delegate lock")
                    .remove(&address);
                if removed.is_some() {
                    debug!(%address, "delegate client removed; record kept");
                }
                false
            }
            AcnCommand::Respond { channel, message } => {
                respond(swarm, channel, message);
                false
            }
            AcnCommand::Shutdown => true,
        }
    }

    fn register_delegate(
        &mut self,
        swarm: &mut AcnSwarm,
        record: AgentRecord,
        sink: mpsc::Sender<Envelope>,
        started: Instant,
    ) -> Result<(), AcnError> {
        self.verify_client_record(&record)?;
        let address = record.address.clone();
        // Only relay records persist; a delegate lives exactly as long as
        // its TCP connection.
        self.delegate_table
            .write()
            .expect("delegate lock")
            .insert(address.clone(), DelegateEntry { record, sink });
        self.metrics.delegate_registrations.inc();
        Metrics::observe_since(&self.metrics.register_us, started);
        info!(%address, "delegate client registered");
        self.announce(swarm, &address);
        Ok(())
    }

    // ── Outbound routing ─────────────────────────────────────────────────────

    /// Route an envelope by priority: self, delegate table, relay table,
    /// DHT resolution.
    fn route_envelope(&mut self, swarm: &mut AcnSwarm, env: Envelope, reply: RouteReply) {
        if env.to == self.own_address {
            let (tx, rx) = oneshot::channel();
            self.deliver_local(env, tx);
            tokio::spawn(async move {
                let result = rx
                    .await
                    .unwrap_or_else(|_| Err(AcnError::Generic("delivery aborted".into())));
                reply.finish(result);
            });
            return;
        }

        let delegate_sink = self
            .delegate_table
            .read()
            .expect("delegate lock")
            .get(&env.to)
            .map(|entry| entry.sink.clone());
        if let Some(sink) = delegate_sink {
            tokio::spawn(async move {
                let result = sink
                    .send(env)
                    .await
                    .map_err(|_| AcnError::AgentNotReady("delegate connection closed".into()));
                reply.finish(result);
            });
            return;
        }

        let Some(record) = self.record_for_sender(&env.sender) else {
            reply.finish(Err(AcnError::InvalidPor(format!(
                "no record for sender {}",
                env.sender
            ))));
            return;
        };

        let relay_route = self
            .relay_table
            .read()
            .expect("relay lock")
            .get(&env.to)
            .map(|entry| entry.peer_id);
        match relay_route {
            Some(Some(client)) => {
                self.send_envelope_with_record(swarm, client, env, record, reply);
                return;
            }
            Some(None) => {
                reply.finish(Err(AcnError::AgentNotReady(format!(
                    "{} is registered but not connected",
                    env.to
                ))));
                return;
            }
            None => {}
        }

        if self.relay_mode {
            // Everything non-local goes through the relay.
            match self.relay_peer {
                Some(relay) => self.send_envelope_with_record(swarm, relay, env, record, reply),
                None => reply.finish(Err(AcnError::Transport(
                    "relay peer is not connected".into(),
                ))),
            }
            return;
        }

        self.start_lookup(swarm, env.to.clone(), LookupPurpose::Route { env, reply });
    }

    fn send_envelope(&mut self, swarm: &mut AcnSwarm, peer: PeerId, env: Envelope, reply: RouteReply) {
        let Some(record) = self.record_for_sender(&env.sender) else {
            reply.finish(Err(AcnError::InvalidPor(format!(
                "no record for sender {}",
                env.sender
            ))));
            return;
        };
        self.send_envelope_with_record(swarm, peer, env, record, reply);
    }

    fn send_envelope_with_record(
        &mut self,
        swarm: &mut AcnSwarm,
        peer: PeerId,
        env: Envelope,
        record: AgentRecord,
        reply: RouteReply,
    ) {
        let bytes = envelope_codec::encode_payload(&env);
        let request_id = swarm
            .behaviour_mut()
            .acn
            .send_request(&peer, AcnMessage::aea_envelope(bytes, &record));
        self.requests
            .insert(request_id, RequestCtx::Envelope { reply });
    }

    /// The proof-of-representation attached to outbound envelopes: the
    /// record of whichever agent the envelope claims as sender.
    fn record_for_sender(&self, sender: &Address) -> Option<AgentRecord> {
        if *sender == self.own_address {
            return self.own_record.clone();
        }
        if let Some(entry) = self.delegate_table.read().expect("delegate lock").get(sender) {
            return Some(entry.record.clone());
        }
        if let Some(entry) = self.relay_table.read().expect("relay lock").get(sender) {
            return Some(entry.record.clone());
        }
        None
    }

    // ── Deadline sweep ───────────────────────────────────────────────────────

    fn sweep_deadlines(&mut self) {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .lookups
            .iter()
            .filter(|(_, lookup)| now >= lookup.deadline)
            .map(|(&id, _)| id)
            .collect();
        for id in expired {
            self.fail_lookup(id, "resolution timed out");
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn respond(swarm: &mut AcnSwarm, channel: ResponseChannel, message: AcnMessage) {
    if swarm
        .behaviour_mut()
        .acn
        .send_response(channel, message)
        .is_err()
    {
        debug!("response channel expired before we could answer");
    }
}

/// Build a TCP swarm with Noise encryption and Yamux multiplexing.
fn build_swarm(config: &AcnConfig) -> Result<AcnSwarm, AcnError> {
    let key = &config.keypair;
    let peer_id = PeerId::from(key.public());

    let transport = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true))
        .upgrade(upgrade::Version::V1)
        .authenticate(noise::Config::new(key).map_err(|e| AcnError::Transport(e.to_string()))?)
        .multiplex(yamux::Config::default())
        .map(|(p, m), _| (p, StreamMuxerBox::new(m)))
        .boxed();

    let behaviour = AcnBehaviour::new(key, config.timeouts.lookup, config.timeouts.lookup);
    let swarm_config = SwarmConfig::with_tokio_executor()
        .with_idle_connection_timeout(Duration::from_secs(60));
    Ok(Swarm::new(transport, behaviour, peer_id, swarm_config))
}

fn peer_id_from_addr(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| match p {
        Protocol::P2p(mh) => PeerId::from_multihash(mh.into()).ok(),
        _ => None,
    })
}
