//! Multi-peer integration tests.
//!
//! All tests run real libp2p swarms on loopback TCP with port 0; no external
//! network is needed. Peers bootstrap against each other, announce agent
//! addresses on the DHT, and exchange envelopes end to end.

use std::time::Duration;

use libp2p::Multiaddr;
use tokio::time::timeout;

use astrid_acn::{AcnConfig, AcnHandle, AcnPeer, AcnTimeouts, DelegateClient};
use astrid_crypto::{Address, AgentRecord, Crypto, Keypair, LedgerId, PublicKey};
use astrid_envelope::Envelope;

// ── Helpers ───────────────────────────────────────────────────────────────────

struct TestPeer {
    handle: AcnHandle,
    crypto: Crypto,
    node_public_key: PublicKey,
    _dir: tempfile::TempDir,
    task: tokio::task::JoinHandle<Result<(), astrid_acn::AcnError>>,
}

async fn spawn_peer(configure: impl FnOnce(AcnConfig) -> AcnConfig) -> TestPeer {
    let keypair = Keypair::generate_ed25519();
    let node_public_key = keypair.public();
    let crypto = Crypto::generate(LedgerId::Ed25519);
    let dir = tempfile::tempdir().unwrap();

    let config = AcnConfig::new(keypair, crypto.clone())
        .with_listen_addr("/ip4/127.0.0.1/tcp/0".parse().unwrap())
        .with_store_path(dir.path().join("records"));
    let config = configure(config);

    let peer = AcnPeer::new(config);
    let handle = peer.handle();
    let task = tokio::spawn(peer.run());

    TestPeer {
        handle,
        crypto,
        node_public_key,
        _dir: dir,
        task,
    }
}

/// Wait for the peer's first listen address.
async fn listen_addr(peer: &TestPeer) -> Multiaddr {
    timeout(Duration::from_secs(5), async {
        loop {
            if let Some(addr) = peer.handle.listen_addrs().into_iter().next() {
                return addr;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("listen address timeout")
}

async fn delegate_addr(peer: &TestPeer) -> std::net::SocketAddr {
    timeout(Duration::from_secs(5), async {
        loop {
            if let Some(addr) = peer.handle.delegate_addr() {
                return addr;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("delegate address timeout")
}

fn envelope(sender: &Crypto, to: &Address, payload: Vec<u8>) -> Envelope {
    Envelope::new(
        to.clone(),
        sender.address().clone(),
        "fipa/1.0.0".parse().unwrap(),
        payload,
    )
}

/// Route with retries: right after startup the DHT may not have converged,
/// which surfaces as `AgentNotFound`. Anything else fails the test.
async fn route_eventually(handle: &AcnHandle, env: Envelope, deadline: Duration) {
    let started = tokio::time::Instant::now();
    loop {
        match handle.route(env.clone()).await {
            Ok(()) => return,
            Err(e) if started.elapsed() < deadline => {
                tracing::debug!("route retry after: {e}");
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Err(e) => panic!("route did not succeed within {deadline:?}: {e}"),
        }
    }
}

async fn shutdown(peer: TestPeer) {
    peer.handle.shutdown().await;
    let _ = peer.task.await;
}

// ── Two peers, direct routing ─────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn envelope_routes_between_two_peers() {
    let p1 = spawn_peer(|c| c).await;
    let addr1 = listen_addr(&p1).await;
    let mut inbox1 = p1.handle.take_inbound().unwrap();

    let p2 = spawn_peer(|c| c.with_bootstrap(vec![addr1])).await;

    let env = envelope(&p2.crypto, p1.crypto.address(), vec![0x01, 0x02]);
    route_eventually(&p2.handle, env.clone(), Duration::from_secs(10)).await;

    let received = timeout(Duration::from_secs(2), inbox1.recv())
        .await
        .expect("delivery deadline")
        .expect("inbox open");
    assert_eq!(received.to, env.to);
    assert_eq!(received.sender, env.sender);
    assert_eq!(received.message, vec![0x01, 0x02]);

    // The sending side recorded the route and the DHT lookup.
    let metrics = p2.handle.metrics();
    assert!(metrics.route_attempts.get() >= 1);
    assert!(metrics.route_successes.get() >= 1);
    assert!(metrics.route_us.get_sample_count() >= 1);
    assert!(metrics.dht_lookup_us.get_sample_count() >= 1);

    shutdown(p2).await;
    shutdown(p1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lookup_resolves_peer_id_and_record() {
    let p1 = spawn_peer(|c| c).await;
    let addr1 = listen_addr(&p1).await;
    let p2 = spawn_peer(|c| c.with_bootstrap(vec![addr1])).await;

    let target = p1.crypto.address().clone();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let (peer_id, record) = loop {
        match p2.handle.lookup(target.clone()).await {
            Ok(found) => break found,
            Err(e) => {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "lookup did not resolve: {e}"
                );
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
    };
    assert_eq!(peer_id, p1.handle.peer_id());
    assert_eq!(record.address, target);
    record.verify(chrono::Utc::now()).unwrap();

    shutdown(p2).await;
    shutdown(p1).await;
}

// ── Unknown addresses ─────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_address_fails_within_the_lookup_timeout() {
    let p1 = spawn_peer(|c| c).await;
    let addr1 = listen_addr(&p1).await;
    let short = AcnTimeouts {
        lookup: Duration::from_secs(2),
        ..AcnTimeouts::default()
    };
    let p2 = spawn_peer(|c| c.with_bootstrap(vec![addr1]).with_timeouts(short)).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let ghost = Crypto::generate(LedgerId::Ed25519).address().clone();
    let started = tokio::time::Instant::now();
    let err = p2.handle.lookup(ghost).await.unwrap_err();
    assert!(matches!(err, astrid_acn::AcnError::AgentNotFound(_)), "got {err}");
    assert!(
        started.elapsed() < Duration::from_secs(4),
        "lookup failure took {:?}",
        started.elapsed()
    );

    shutdown(p2).await;
    shutdown(p1).await;
}

// ── Four peers in a chain ─────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn envelopes_cross_a_four_peer_chain_in_both_directions() {
    let p1 = spawn_peer(|c| c).await;
    let a1 = listen_addr(&p1).await;
    let p2 = spawn_peer({
        let a1 = a1.clone();
        move |c| c.with_bootstrap(vec![a1])
    })
    .await;
    let a2 = listen_addr(&p2).await;
    let p3 = spawn_peer(move |c| c.with_bootstrap(vec![a2])).await;
    let a3 = listen_addr(&p3).await;
    let p4 = spawn_peer(move |c| c.with_bootstrap(vec![a3])).await;

    let mut inbox1 = p1.handle.take_inbound().unwrap();
    let mut inbox4 = p4.handle.take_inbound().unwrap();

    // A1 -> A4 across the chain.
    let env = envelope(&p1.crypto, p4.crypto.address(), vec![0x14]);
    route_eventually(&p1.handle, env, Duration::from_secs(15)).await;
    let received = timeout(Duration::from_secs(2), inbox4.recv())
        .await
        .expect("a1->a4 deadline")
        .expect("inbox open");
    assert_eq!(received.message, vec![0x14]);

    // A4 -> A1 back again.
    let env = envelope(&p4.crypto, p1.crypto.address(), vec![0x41]);
    route_eventually(&p4.handle, env, Duration::from_secs(15)).await;
    let received = timeout(Duration::from_secs(2), inbox1.recv())
        .await
        .expect("a4->a1 deadline")
        .expect("inbox open");
    assert_eq!(received.message, vec![0x41]);

    // Each sender recorded a route latency sample.
    assert!(p1.handle.metrics().route_us.get_sample_count() >= 1);
    assert!(p4.handle.metrics().route_us.get_sample_count() >= 1);

    for peer in [p4, p3, p2, p1] {
        shutdown(peer).await;
    }
}

// ── Delegate clients ──────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delegate_client_sends_and_receives() {
    let p1 = spawn_peer(|c| c.with_delegate_addr("127.0.0.1:0".parse().unwrap())).await;
    let addr1 = listen_addr(&p1).await;
    let delegate = delegate_addr(&p1).await;

    let client_crypto = Crypto::generate(LedgerId::Ed25519);
    let client = DelegateClient::connect(
        delegate,
        &client_crypto,
        &p1.node_public_key,
        chrono::Duration::hours(1),
    )
    .await
    .expect("delegate registration");

    assert_eq!(p1.handle.metrics().delegate_registrations.get(), 1);
    assert_eq!(p1.handle.metrics().active_delegates.get(), 1);

    // A second peer learns the delegate's address via the DHT and routes to it.
    let p2 = spawn_peer(|c| c.with_bootstrap(vec![addr1])).await;
    let env = envelope(&p2.crypto, client_crypto.address(), vec![0xca, 0xfe]);
    route_eventually(&p2.handle, env.clone(), Duration::from_secs(10)).await;

    let received = timeout(Duration::from_secs(2), client.recv())
        .await
        .expect("delegate delivery deadline")
        .expect("delegate frame");
    assert_eq!(received.sender, *p2.crypto.address());
    assert_eq!(received.message, vec![0xca, 0xfe]);

    // The client can answer through the same connection.
    let mut inbox2 = p2.handle.take_inbound().unwrap();
    let reply = envelope(&client_crypto, p2.crypto.address(), vec![0x99]);
    client.send(&reply).await.unwrap();
    let received = timeout(Duration::from_secs(5), inbox2.recv())
        .await
        .expect("reply deadline")
        .expect("inbox open");
    assert_eq!(received.sender, *client_crypto.address());

    shutdown(p2).await;
    shutdown(p1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delegate_rejects_spoofed_sender() {
    let p1 = spawn_peer(|c| c.with_delegate_addr("127.0.0.1:0".parse().unwrap())).await;
    let delegate = delegate_addr(&p1).await;

    let client_crypto = Crypto::generate(LedgerId::Ed25519);
    let client = DelegateClient::connect(
        delegate,
        &client_crypto,
        &p1.node_public_key,
        chrono::Duration::hours(1),
    )
    .await
    .unwrap();

    // Envelope claiming to come from someone else.
    let imposter = Crypto::generate(LedgerId::Ed25519);
    let spoofed = envelope(&imposter, p1.crypto.address(), vec![0x66]);
    client.send(&spoofed).await.unwrap();

    // The peer answers with an error status instead of routing.
    let err = timeout(Duration::from_secs(2), client.recv())
        .await
        .expect("status deadline")
        .unwrap_err();
    assert!(err.to_string().contains("not the registered address"), "got {err}");

    shutdown(p1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn expired_record_rejected_at_registration() {
    use astrid_acn::proto::{self, AcnMessage, Payload, StatusCode};

    let p1 = spawn_peer(|c| c.with_delegate_addr("127.0.0.1:0".parse().unwrap())).await;
    let delegate = delegate_addr(&p1).await;

    // A correctly signed record whose validity window is already over.
    let client_crypto = Crypto::generate(LedgerId::Ed25519);
    let expired = AgentRecord::new_signed(
        &client_crypto,
        &p1.node_public_key,
        chrono::Duration::seconds(-10),
    )
    .unwrap();

    let mut stream = tokio::net::TcpStream::connect(delegate).await.unwrap();
    proto::write_frame(&mut stream, &AcnMessage::register(&expired).encode_to_bytes())
        .await
        .unwrap();
    let frame = proto::read_frame(&mut stream).await.unwrap();
    let reply = AcnMessage::decode_bytes(&frame).unwrap();
    match reply.payload {
        Some(Payload::Status(status)) => {
            assert_eq!(status.code, StatusCode::ErrorInvalidPor as i32);
        }
        other => panic!("expected status, got {:?}", proto::payload_name(&other)),
    }
    assert_eq!(p1.handle.metrics().delegate_registrations.get(), 0);

    shutdown(p1).await;
}

// ── Relay clients ─────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn relay_client_is_reachable_directly_and_via_dht() {
    let p1 = spawn_peer(|c| c).await;
    let addr1 = listen_addr(&p1).await;

    // NAT-bound client: announces through p1 and routes everything via it.
    let relay_client = spawn_peer({
        let addr1 = addr1.clone();
        move |c| c.with_relay(addr1)
    })
    .await;
    let mut client_inbox = relay_client.handle.take_inbound().unwrap();

    // Wait until p1 accepted the registration.
    timeout(Duration::from_secs(10), async {
        while p1.handle.metrics().relay_registrations.get() == 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("relay registration deadline");
    assert_eq!(p1.handle.metrics().active_relays.get(), 1);

    // Case 3: p1's own agent routes directly via its relay table.
    let env = envelope(&p1.crypto, relay_client.crypto.address(), vec![0x01]);
    p1.handle.route(env).await.expect("direct relay route");
    let received = timeout(Duration::from_secs(2), client_inbox.recv())
        .await
        .expect("relay delivery deadline")
        .expect("inbox open");
    assert_eq!(received.sender, *p1.crypto.address());

    // Case 4: a third peer resolves the client via the DHT and goes through p1.
    let p2 = spawn_peer(|c| c.with_bootstrap(vec![addr1])).await;
    let env = envelope(&p2.crypto, relay_client.crypto.address(), vec![0x02]);
    route_eventually(&p2.handle, env, Duration::from_secs(10)).await;
    let received = timeout(Duration::from_secs(2), client_inbox.recv())
        .await
        .expect("relayed delivery deadline")
        .expect("inbox open");
    assert_eq!(received.sender, *p2.crypto.address());
    assert_eq!(received.message, vec![0x02]);

    shutdown(p2).await;
    shutdown(relay_client).await;
    shutdown(p1).await;
}
