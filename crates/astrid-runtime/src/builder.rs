// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Agent assembly from named component packages.
//!
//! The runtime core knows nothing about how protocol codecs, skills, or
//! connections come into existence; a [`ComponentLoader`] resolves their
//! identifiers and the [`AgentBuilder`] wires the result into a ready
//! [`AgentRuntime`]. Project tooling implements the loader; tests stub it.

use std::sync::Arc;

use astrid_crypto::Crypto;
use astrid_envelope::{ProtocolCodec, ProtocolId, ProtocolRegistry};

use crate::agent::{AgentRuntime, RuntimeConfig};
use crate::connection::{Connection, ConnectionId, ExceptionPolicy};
use crate::context::AgentContext;
use crate::dispatcher::{DefaultErrorHandler, Dispatcher};
use crate::error::RuntimeError;
use crate::multiplexer::{Multiplexer, RoutingTable};
use crate::queue::{Inbox, Outbox, Queue};
use crate::skill::Skill;

/// Resolves component identifiers to live components.
///
/// Implementations fail with [`RuntimeError::Config`] for unknown
/// identifiers; the builder aborts assembly on the first failure.
pub trait ComponentLoader: Send + Sync {
    fn protocol(&self, id: &ProtocolId) -> Result<Arc<dyn ProtocolCodec>, RuntimeError>;

    fn skill(&self, name: &str) -> Result<Skill, RuntimeError>;

    /// Connections receive the immutable agent context; they must not hold
    /// anything that reaches back into the runtime.
    fn connection(
        &self,
        name: &str,
        context: &AgentContext,
    ) -> Result<Arc<dyn Connection>, RuntimeError>;
}

/// Declarative description of one agent, resolved against a loader.
pub struct AgentBuilder {
    name: String,
    crypto: Crypto,
    config: RuntimeConfig,
    queue_capacity: usize,
    protocols: Vec<ProtocolId>,
    skills: Vec<String>,
    connections: Vec<(String, ExceptionPolicy)>,
    default_routing: Vec<(ProtocolId, ConnectionId)>,
    handler_policy: ExceptionPolicy,
}

impl AgentBuilder {
    pub fn new(name: impl Into<String>, crypto: Crypto) -> Self {
        Self {
            name: name.into(),
            crypto,
            config: RuntimeConfig::default(),
            queue_capacity: 1024,
            protocols: Vec::new(),
            skills: Vec::new(),
            connections: Vec::new(),
            default_routing: Vec::new(),
            handler_policy: ExceptionPolicy::JustLog,
        }
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_protocol(mut self, id: ProtocolId) -> Self {
        self.protocols.push(id);
        self
    }

    pub fn with_skill(mut self, name: impl Into<String>) -> Self {
        self.skills.push(name.into());
        self
    }

    pub fn with_connection(mut self, name: impl Into<String>, policy: ExceptionPolicy) -> Self {
        self.connections.push((name.into(), policy));
        self
    }

    /// Route all envelopes of `protocol` through the named connection.
    pub fn with_default_routing(
        mut self,
        protocol: ProtocolId,
        connection: impl Into<ConnectionId>,
    ) -> Self {
        self.default_routing.push((protocol, connection.into()));
        self
    }

    pub fn with_handler_policy(mut self, policy: ExceptionPolicy) -> Self {
        self.handler_policy = policy;
        self
    }

    /// Resolve everything against `loader` and assemble the runtime.
    pub fn build(self, loader: &dyn ComponentLoader) -> Result<AgentRuntime, RuntimeError> {
        let mut registry = ProtocolRegistry::with_defaults();
        for id in &self.protocols {
            registry.register(loader.protocol(id)?)?;
        }
        let registry = Arc::new(registry);

        let routing = Arc::new(RoutingTable::new());
        let inbox: Inbox = Queue::new(self.queue_capacity);
        let outbox = Outbox::new(
            self.queue_capacity,
            self.crypto.address().clone(),
            Arc::clone(&registry),
            Arc::clone(&routing),
        );
        let context = AgentContext::new(
            self.name,
            self.crypto.address().clone(),
            self.crypto.public_key(),
            outbox.clone(),
        );

        let mut multiplexer = Multiplexer::new(inbox.clone(), outbox, routing);
        for (name, policy) in &self.connections {
            let connection = loader.connection(name, &context)?;
            multiplexer.add_connection(connection, *policy)?;
        }
        for (protocol, connection) in self.default_routing {
            multiplexer.set_default_routing(protocol, connection);
        }

        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Box::new(DefaultErrorHandler::new(context.clone())),
            self.handler_policy,
        )
        .with_handler_timeout(self.config.execution_timeout);

        let mut runtime =
            AgentRuntime::new(context, inbox, multiplexer, dispatcher, self.config);
        for name in &self.skills {
            runtime.add_skill(loader.skill(name)?);
        }
        Ok(runtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use astrid_crypto::LedgerId;

    struct EmptyLoader;

    impl ComponentLoader for EmptyLoader {
        fn protocol(&self, id: &ProtocolId) -> Result<Arc<dyn ProtocolCodec>, RuntimeError> {
            Err(RuntimeError::Config(format!("unknown protocol {id}")))
        }

        fn skill(&self, name: &str) -> Result<Skill, RuntimeError> {
            if name == "bare" {
                Ok(Skill::new("bare"))
            } else {
                Err(RuntimeError::Config(format!("unknown skill {name}")))
            }
        }

        fn connection(
            &self,
            name: &str,
            _context: &AgentContext,
        ) -> Result<Arc<dyn Connection>, RuntimeError> {
            Err(RuntimeError::Config(format!("unknown connection {name}")))
        }
    }

    #[tokio::test]
    async fn builds_a_minimal_agent() {
        let crypto = Crypto::generate(LedgerId::Ed25519);
        let runtime = AgentBuilder::new("minimal", crypto)
            .with_skill("bare")
            .build(&EmptyLoader)
            .unwrap();
        assert_eq!(runtime.context().name(), "minimal");
    }

    #[tokio::test]
    async fn unknown_identifiers_abort_assembly() {
        let crypto = Crypto::generate(LedgerId::Ed25519);
        let result = AgentBuilder::new("broken", crypto)
            .with_skill("ghost")
            .build(&EmptyLoader);
        assert!(matches!(result, Err(RuntimeError::Config(_))));

        let crypto = Crypto::generate(LedgerId::Ed25519);
        let result = AgentBuilder::new("broken", crypto)
            .with_connection("ghost", ExceptionPolicy::JustLog)
            .build(&EmptyLoader);
        assert!(matches!(result, Err(RuntimeError::Config(_))));
    }
}
