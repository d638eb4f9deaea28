// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Shared fixtures for unit tests.

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use astrid_crypto::{Crypto, LedgerId};
use astrid_envelope::ProtocolRegistry;

use crate::behaviour::Behaviour;
use crate::context::AgentContext;
use crate::error::RuntimeError;
use crate::multiplexer::RoutingTable;
use crate::queue::Outbox;
use crate::skill::SkillContext;
use crate::tasks::TaskManager;

/// A skill context wired to a throwaway identity and an unroutable outbox.
/// Requires a tokio runtime (the task manager spawns workers).
pub fn noop_context(skill: &str) -> SkillContext {
    let crypto = Crypto::generate(LedgerId::Ed25519);
    let registry = Arc::new(ProtocolRegistry::with_defaults());
    let routing = Arc::new(RoutingTable::new());
    let outbox = Outbox::new(16, crypto.address().clone(), registry, routing);
    let agent = AgentContext::new(
        "test-agent".into(),
        crypto.address().clone(),
        crypto.public_key(),
        outbox,
    );
    SkillContext::new(
        skill.into(),
        agent,
        TaskManager::new(1),
        CancellationToken::new(),
    )
}

/// Behaviour that counts invocations, optionally sleeps inside `act`, and
/// reports done after a fixed number of calls.
pub struct CountingBehaviour {
    counter: Arc<AtomicU32>,
    done_after: Option<u32>,
    event: Option<&'static str>,
    delay: Option<Duration>,
}

impl CountingBehaviour {
    /// Done after `n` invocations, emitting `event` on completion.
    pub fn done_after(n: u32, event: Option<&'static str>) -> Self {
        Self {
            counter: Arc::new(AtomicU32::new(0)),
            done_after: Some(n),
            event,
            delay: None,
        }
    }

    /// Never done; counts into the shared counter.
    pub fn endless(counter: Arc<AtomicU32>) -> Self {
        Self {
            counter,
            done_after: None,
            event: None,
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.counter)
    }

    fn count(&self) -> u32 {
        self.counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Behaviour for CountingBehaviour {
    async fn act(&mut self, _ctx: &SkillContext) -> Result<(), RuntimeError> {
        self.counter.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.done_after.is_some_and(|n| self.count() >= n)
    }

    fn event(&self) -> Option<&str> {
        self.event
    }
}
