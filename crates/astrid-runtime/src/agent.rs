// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The agent runtime: state machine and main loop.
//!
//! State graph:
//!
//! ```text
//!   Stopped ─► Starting ─► Running ─► Stopping ─► Stopped
//!                               │         ▲
//!                               └► Error ─┘
//! ```
//!
//! Each loop iteration (every `period`, default 50 ms) advances the
//! scheduler, drains up to `max_reactions` envelopes from the inbox, and
//! checks the stop token. Teardown runs in reverse start order: scheduler,
//! multiplexer, task pool.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::context::AgentContext;
use crate::dispatcher::Dispatcher;
use crate::error::RuntimeError;
use crate::multiplexer::Multiplexer;
use crate::queue::Inbox;
use crate::scheduler::Scheduler;
use crate::skill::{Skill, SkillContext};
use crate::tasks::TaskManager;

/// Runtime lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Main loop period.
    pub period: Duration,
    /// Maximum envelopes drained from the inbox per iteration.
    pub max_reactions: usize,
    /// Default per-invocation behaviour timeout; `None` disables it.
    pub execution_timeout: Option<Duration>,
    /// Worker count of the background task pool.
    pub task_workers: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(50),
            max_reactions: 20,
            execution_timeout: None,
            task_workers: 4,
        }
    }
}

/// Cheap-to-clone handle for observing and stopping a running agent.
#[derive(Clone)]
pub struct RuntimeHandle {
    cancel: CancellationToken,
    state: watch::Receiver<RuntimeState>,
}

impl RuntimeHandle {
    /// Request a cooperative stop.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> RuntimeState {
        *self.state.borrow()
    }

    /// Wait until the runtime reaches `target`.
    pub async fn wait_for(&mut self, target: RuntimeState) -> Result<(), RuntimeError> {
        self.state
            .wait_for(|s| *s == target)
            .await
            .map(|_| ())
            .map_err(|_| RuntimeError::NotRunning("agent runtime"))
    }
}

/// One agent: owns the scheduler, dispatcher, and multiplexer exclusively.
pub struct AgentRuntime {
    context: AgentContext,
    inbox: Inbox,
    multiplexer: Multiplexer,
    scheduler: Scheduler,
    dispatcher: Dispatcher,
    tasks: TaskManager,
    skills: Vec<Skill>,
    config: RuntimeConfig,
    cancel: CancellationToken,
    state_tx: watch::Sender<RuntimeState>,
}

impl AgentRuntime {
    pub fn new(
        context: AgentContext,
        inbox: Inbox,
        multiplexer: Multiplexer,
        dispatcher: Dispatcher,
        config: RuntimeConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(RuntimeState::Stopped);
        Self {
            context,
            inbox,
            multiplexer,
            scheduler: Scheduler::new(config.execution_timeout),
            dispatcher,
            tasks: TaskManager::new(config.task_workers),
            skills: Vec::new(),
            config,
            cancel: CancellationToken::new(),
            state_tx,
        }
    }

    /// Register a skill; wired into the dispatcher and scheduler at start.
    pub fn add_skill(&mut self, skill: Skill) {
        self.skills.push(skill);
    }

    pub fn handle(&self) -> RuntimeHandle {
        RuntimeHandle {
            cancel: self.cancel.clone(),
            state: self.state_tx.subscribe(),
        }
    }

    pub fn context(&self) -> &AgentContext {
        &self.context
    }

    pub fn state(&self) -> RuntimeState {
        *self.state_tx.borrow()
    }

    /// All-time handler failures for `protocol` (see the dispatcher).
    pub fn handler_errors(&self, protocol: &astrid_envelope::ProtocolId) -> u64 {
        self.dispatcher.handler_errors(protocol)
    }

    fn set_state(&self, state: RuntimeState) {
        let _ = self.state_tx.send(state);
    }

    fn install_skills(&mut self) -> Result<(), RuntimeError> {
        let skills = std::mem::take(&mut self.skills);
        for skill in skills {
            let (name, handlers, behaviours) = skill.into_parts();
            let ctx = SkillContext::new(
                name.clone(),
                self.context.clone(),
                self.tasks.clone(),
                self.cancel.clone(),
            );
            for (handler_name, handler) in handlers {
                self.dispatcher
                    .register_handler(&name, &handler_name, handler, ctx.clone());
            }
            for spec in behaviours {
                self.scheduler.register(
                    &name,
                    &spec.name,
                    spec.behaviour,
                    ctx.clone(),
                    spec.schedule,
                    spec.execution_timeout,
                )?;
            }
        }
        Ok(())
    }

    /// Run the agent until stopped. Consumes the runtime; use
    /// [`Self::handle`] beforehand to stop it and observe its state.
    pub async fn run(mut self) -> Result<(), RuntimeError> {
        self.set_state(RuntimeState::Starting);
        info!(agent = %self.context.name(), "agent starting");

        if let Err(e) = self.install_skills() {
            self.teardown().await;
            return Err(e);
        }
        if let Err(e) = self.multiplexer.connect().await {
            error!("multiplexer failed to start: {e}");
            self.teardown().await;
            return Err(e);
        }

        self.set_state(RuntimeState::Running);
        info!(agent = %self.context.name(), address = %self.context.address(), "agent running");

        let fatal = self.multiplexer.fatal_token();
        let mut tick = tokio::time::interval(self.config.period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let result: Result<(), RuntimeError> = 'main: loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break 'main Ok(()),
                _ = fatal.cancelled() => {
                    let reason = self
                        .multiplexer
                        .fatal_reason()
                        .unwrap_or_else(|| "connection failure".into());
                    error!("unrecoverable connection failure: {reason}");
                    self.set_state(RuntimeState::Error);
                    break 'main Err(RuntimeError::Connection(reason));
                }
                _ = tick.tick() => {
                    self.scheduler.advance().await;
                    let mut drained = 0;
                    while drained < self.config.max_reactions {
                        let Some(env) = self.inbox.try_get() else { break };
                        drained += 1;
                        if let Err(e) = self.dispatcher.dispatch(env).await {
                            error!("handler failure under propagate policy: {e}");
                            self.set_state(RuntimeState::Error);
                            break 'main Err(e);
                        }
                    }
                }
            }
        };

        self.teardown().await;
        if result.is_ok() {
            info!(agent = %self.context.name(), "agent stopped");
        }
        result
    }

    /// Reverse-order teardown; always ends in `Stopped`.
    async fn teardown(&mut self) {
        self.set_state(RuntimeState::Stopping);
        self.cancel.cancel();
        self.scheduler.teardown().await;
        self.multiplexer.disconnect().await;
        self.tasks.shutdown().await;
        self.inbox.close();
        self.context.outbox().close();
        self.set_state(RuntimeState::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ExceptionPolicy;
    use crate::dispatcher::{DefaultErrorHandler, Handler};
    use crate::multiplexer::RoutingTable;
    use crate::queue::{Outbox, Queue};
    use astrid_crypto::{Crypto, LedgerId};
    use astrid_envelope::{
        default_protocol, DefaultMessage, Envelope, Message, ProtocolCodec, ProtocolId,
        ProtocolRegistry,
    };
    use async_trait::async_trait;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    fn make_runtime() -> (AgentRuntime, Inbox, AgentContext) {
        let crypto = Crypto::generate(LedgerId::Ed25519);
        let registry = Arc::new(ProtocolRegistry::with_defaults());
        let routing = Arc::new(RoutingTable::new());
        let inbox: Inbox = Queue::new(64);
        let outbox = Outbox::new(
            64,
            crypto.address().clone(),
            Arc::clone(&registry),
            Arc::clone(&routing),
        );
        let context = AgentContext::new(
            "test-agent".into(),
            crypto.address().clone(),
            crypto.public_key(),
            outbox.clone(),
        );
        let multiplexer = Multiplexer::new(inbox.clone(), outbox, routing);
        let dispatcher = Dispatcher::new(
            registry,
            Box::new(DefaultErrorHandler::new(context.clone())),
            ExceptionPolicy::JustLog,
        );
        let config = RuntimeConfig {
            period: Duration::from_millis(10),
            ..RuntimeConfig::default()
        };
        let runtime = AgentRuntime::new(context.clone(), inbox.clone(), multiplexer, dispatcher, config);
        (runtime, inbox, context)
    }

    struct CountingHandler {
        protocol: ProtocolId,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Handler for CountingHandler {
        fn supported_protocol(&self) -> &ProtocolId {
            &self.protocol
        }

        async fn handle(
            &mut self,
            _message: &dyn Message,
            _envelope: &Envelope,
            _ctx: &SkillContext,
        ) -> Result<(), RuntimeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lifecycle_walks_the_state_graph() {
        let (runtime, _inbox, _context) = make_runtime();
        let mut handle = runtime.handle();
        let join = tokio::spawn(runtime.run());

        handle.wait_for(RuntimeState::Running).await.unwrap();
        handle.stop();
        handle.wait_for(RuntimeState::Stopped).await.unwrap();
        join.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn inbound_envelopes_reach_handlers() {
        let (mut runtime, inbox, context) = make_runtime();

        let calls = Arc::new(AtomicU32::new(0));
        let mut skill = Skill::new("echo");
        skill
            .add_handler(
                "default",
                Box::new(CountingHandler {
                    protocol: default_protocol::id(),
                    calls: Arc::clone(&calls),
                }),
            )
            .unwrap();
        runtime.add_skill(skill);

        let mut handle = runtime.handle();
        let join = tokio::spawn(runtime.run());
        handle.wait_for(RuntimeState::Running).await.unwrap();

        let codec = default_protocol::DefaultCodec;
        let msg = DefaultMessage::Bytes {
            content: vec![1, 2, 3],
        };
        let peer = Crypto::generate(LedgerId::Ed25519);
        for _ in 0..3 {
            let env = Envelope::new(
                context.address().clone(),
                peer.address().clone(),
                default_protocol::id(),
                codec.encode(&msg).unwrap(),
            );
            inbox.put(env).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while calls.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("handlers should run within the deadline");

        handle.stop();
        handle.wait_for(RuntimeState::Stopped).await.unwrap();
        join.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_behaviour_name_aborts_start() {
        let (mut runtime, _inbox, _context) = make_runtime();
        let mut skill = Skill::new("s");
        skill
            .add_behaviour(
                "b",
                Box::new(crate::test_support::CountingBehaviour::done_after(1, None)),
                crate::scheduler::Schedule::Cyclic,
            )
            .unwrap();
        assert!(skill
            .add_behaviour(
                "b",
                Box::new(crate::test_support::CountingBehaviour::done_after(1, None)),
                crate::scheduler::Schedule::Cyclic,
            )
            .is_err());
        runtime.add_skill(skill);
        // The runtime itself still starts; the duplicate was rejected at the
        // skill level before registration.
        let mut handle = runtime.handle();
        let join = tokio::spawn(runtime.run());
        handle.wait_for(RuntimeState::Running).await.unwrap();
        handle.stop();
        join.await.unwrap().unwrap();
    }
}
