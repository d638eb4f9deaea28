// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The immutable agent context handed to skills and connections.

use std::sync::Arc;

use astrid_crypto::{Address, PublicKey};
use astrid_envelope::{Envelope, EnvelopeContext, Message, ProtocolId};

use crate::error::RuntimeError;
use crate::queue::Outbox;

struct Inner {
    name: String,
    address: Address,
    public_key: PublicKey,
    outbox: Outbox,
}

/// Identity of the running agent plus its outbox handle.
///
/// Cheap to clone and deliberately write-free: components holding a context
/// can enqueue outbound envelopes but cannot reach back into the runtime.
#[derive(Clone)]
pub struct AgentContext {
    inner: Arc<Inner>,
}

impl AgentContext {
    pub fn new(name: String, address: Address, public_key: PublicKey, outbox: Outbox) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                address,
                public_key,
                outbox,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.inner.public_key
    }

    pub fn outbox(&self) -> &Outbox {
        &self.inner.outbox
    }

    /// Enqueue an outbound envelope.
    pub async fn send(&self, env: Envelope) -> Result<(), RuntimeError> {
        self.inner.outbox.put(env).await
    }

    /// Encode and enqueue a message from this agent's identity.
    pub async fn send_message(
        &self,
        to: Address,
        protocol_id: &ProtocolId,
        message: &dyn Message,
        context: Option<EnvelopeContext>,
    ) -> Result<(), RuntimeError> {
        self.inner
            .outbox
            .put_message(to, protocol_id, message, context)
            .await
    }
}

impl std::fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentContext")
            .field("name", &self.inner.name)
            .field("address", &self.inner.address)
            .finish_non_exhaustive()
    }
}
