//! libp2p `NetworkBehaviour` composition for the ACN peer.
//!
//! - `kad`      — Kademlia DHT holding agent-address provider records
//! - `identify` — multiaddr and public-key exchange with peers
//! - `ping`     — keeps idle connections alive
//! - `acn`      — framed `AcnMessage` request/response on the four ACN
//!                stream protocols

use std::time::Duration;

use libp2p::{
    identify,
    kad::{self, store::MemoryStore},
    ping, request_response,
    swarm::NetworkBehaviour,
    PeerId, StreamProtocol,
};

use crate::codec::AcnCodec;
use crate::proto::{PROTO_ADDRESS, PROTO_ENVELOPE, PROTO_NOTIF, PROTO_REGISTER};

const IDENTIFY_PROTO: &str = "/aea/1.0.0";
const KAD_PROTO: StreamProtocol = StreamProtocol::new("/aea/kad/1.0.0");

#[derive(NetworkBehaviour)]
#[behaviour(out_event = "AcnBehaviourEvent")]
pub struct AcnBehaviour {
    pub kad: kad::Behaviour<MemoryStore>,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
    pub acn: request_response::Behaviour<AcnCodec>,
}

#[derive(Debug)]
pub enum AcnBehaviourEvent {
    Kad(kad::Event),
    Identify(Box<identify::Event>),
    Ping(ping::Event),
    Acn(request_response::Event<crate::proto::AcnMessage, crate::proto::AcnMessage>),
}

impl From<kad::Event> for AcnBehaviourEvent {
    fn from(e: kad::Event) -> Self {
        AcnBehaviourEvent::Kad(e)
    }
}
impl From<identify::Event> for AcnBehaviourEvent {
    fn from(e: identify::Event) -> Self {
        AcnBehaviourEvent::Identify(Box::new(e))
    }
}
impl From<ping::Event> for AcnBehaviourEvent {
    fn from(e: ping::Event) -> Self {
        AcnBehaviourEvent::Ping(e)
    }
}
impl From<request_response::Event<crate::proto::AcnMessage, crate::proto::AcnMessage>>
    for AcnBehaviourEvent
{
    fn from(
        e: request_response::Event<crate::proto::AcnMessage, crate::proto::AcnMessage>,
    ) -> Self {
        AcnBehaviourEvent::Acn(e)
    }
}

impl AcnBehaviour {
    pub fn new(
        key: &libp2p::identity::Keypair,
        request_timeout: Duration,
        query_timeout: Duration,
    ) -> Self {
        let local_peer_id = PeerId::from(key.public());

        let mut kad_config = kad::Config::new(KAD_PROTO);
        kad_config.set_query_timeout(query_timeout);
        let mut kad = kad::Behaviour::with_config(
            local_peer_id,
            MemoryStore::new(local_peer_id),
            kad_config,
        );
        kad.set_mode(Some(kad::Mode::Server));

        let protocols = [
            (PROTO_REGISTER, request_response::ProtocolSupport::Full),
            (PROTO_ADDRESS, request_response::ProtocolSupport::Full),
            (PROTO_ENVELOPE, request_response::ProtocolSupport::Full),
            (PROTO_NOTIF, request_response::ProtocolSupport::Full),
        ];

        Self {
            kad,
            identify: identify::Behaviour::new(identify::Config::new(
                IDENTIFY_PROTO.into(),
                key.public(),
            )),
            ping: ping::Behaviour::new(ping::Config::new().with_interval(Duration::from_secs(15))),
            acn: request_response::Behaviour::with_codec(
                AcnCodec,
                protocols,
                request_response::Config::default().with_request_timeout(request_timeout),
            ),
        }
    }
}
