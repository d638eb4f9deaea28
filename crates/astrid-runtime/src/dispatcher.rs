// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Skill dispatcher: routes decoded inbound messages to handlers.
//!
//! For every inbound envelope exactly one of two things happens: the error
//! handler runs (unknown protocol, undecodable payload, or no handler), or
//! every handler registered for the envelope's protocol runs. Handler
//! failures are governed by the runtime's exception policy and never escape
//! under `JustLog` or `StopAndExit`.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tracing::{debug, warn};

use astrid_envelope::{
    default_protocol, DefaultMessage, Envelope, ErrorCode, Message, ProtocolId, ProtocolRegistry,
};

use crate::connection::ExceptionPolicy;
use crate::context::AgentContext;
use crate::error::RuntimeError;
use crate::skill::SkillContext;

// ── Handler capability ────────────────────────────────────────────────────────

/// A unit of message-triggered work, bound to exactly one protocol.
#[async_trait]
pub trait Handler: Send {
    fn supported_protocol(&self) -> &ProtocolId;

    async fn handle(
        &mut self,
        message: &dyn Message,
        envelope: &Envelope,
        ctx: &SkillContext,
    ) -> Result<(), RuntimeError>;
}

// ── Error handler ─────────────────────────────────────────────────────────────

/// Why an envelope was routed to the error handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorReason {
    UnsupportedProtocol,
    DecodingError,
    NoActiveHandler,
}

impl ErrorReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorReason::UnsupportedProtocol => "unsupported_protocol",
            ErrorReason::DecodingError => "decoding_error",
            ErrorReason::NoActiveHandler => "no_active_handler",
        }
    }

    fn code(&self) -> ErrorCode {
        match self {
            ErrorReason::UnsupportedProtocol => ErrorCode::UnsupportedProtocol,
            ErrorReason::DecodingError => ErrorCode::DecodingError,
            ErrorReason::NoActiveHandler => ErrorCode::NoActiveHandler,
        }
    }
}

/// Receives envelopes the dispatch pipeline could not deliver.
///
/// Implementations must not fail: anything going wrong inside the error
/// handler is logged and the envelope dropped.
#[async_trait]
pub trait ErrorHandler: Send {
    async fn on_error(&mut self, reason: ErrorReason, envelope: &Envelope);
}

/// The standard error handler: replies to the sender on the `default`
/// protocol, echoing the original payload with a failure code.
pub struct DefaultErrorHandler {
    context: AgentContext,
}

impl DefaultErrorHandler {
    pub fn new(context: AgentContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl ErrorHandler for DefaultErrorHandler {
    async fn on_error(&mut self, reason: ErrorReason, envelope: &Envelope) {
        warn!(
            protocol = %envelope.protocol_id,
            sender = %envelope.sender,
            reason = reason.as_str(),
            "dispatch failed; replying with error"
        );
        let reply = DefaultMessage::Error {
            code: reason.code(),
            message: format!("{} for {}", reason.as_str(), envelope.protocol_id),
            original: envelope.message.clone(),
        };
        if let Err(e) = self
            .context
            .send_message(
                envelope.sender.clone(),
                &default_protocol::id(),
                &reply,
                None,
            )
            .await
        {
            // Never raise out of the error handler.
            debug!("error reply dropped: {e}");
        }
    }
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

struct HandlerEntry {
    skill: String,
    name: String,
    handler: Box<dyn Handler>,
    ctx: SkillContext,
}

pub struct Dispatcher {
    registry: Arc<ProtocolRegistry>,
    handlers: HashMap<ProtocolId, Vec<HandlerEntry>>,
    error_handler: Box<dyn ErrorHandler>,
    policy: ExceptionPolicy,
    /// Per-handler invocation cap; `None` (or zero) disables it.
    handler_timeout: Option<std::time::Duration>,
    handler_errors: HashMap<ProtocolId, u64>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ProtocolRegistry>,
        error_handler: Box<dyn ErrorHandler>,
        policy: ExceptionPolicy,
    ) -> Self {
        Self {
            registry,
            handlers: HashMap::new(),
            error_handler,
            policy,
            handler_timeout: None,
            handler_errors: HashMap::new(),
        }
    }

    pub fn with_handler_timeout(mut self, timeout: Option<std::time::Duration>) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn register_handler(
        &mut self,
        skill: &str,
        name: &str,
        handler: Box<dyn Handler>,
        ctx: SkillContext,
    ) {
        let protocol = handler.supported_protocol().clone();
        self.handlers.entry(protocol).or_default().push(HandlerEntry {
            skill: skill.to_string(),
            name: name.to_string(),
            handler,
            ctx,
        });
    }

    /// Number of active handlers for `protocol`.
    pub fn handler_count(&self, protocol: &ProtocolId) -> usize {
        self.handlers.get(protocol).map_or(0, Vec::len)
    }

    /// All-time handler failures for `protocol`.
    pub fn handler_errors(&self, protocol: &ProtocolId) -> u64 {
        self.handler_errors.get(protocol).copied().unwrap_or(0)
    }

    /// Run one envelope through the pipeline.
    ///
    /// Returns an error only under the `Propagate` policy, in which case the
    /// runtime transitions to its error state.
    pub async fn dispatch(&mut self, envelope: Envelope) -> Result<(), RuntimeError> {
        let codec = match self.registry.lookup(&envelope.protocol_id) {
            Ok(codec) => codec,
            Err(_) => {
                self.error_handler
                    .on_error(ErrorReason::UnsupportedProtocol, &envelope)
                    .await;
                return Ok(());
            }
        };
        let message = match codec.decode(&envelope.message) {
            Ok(message) => message,
            Err(e) => {
                debug!(protocol = %envelope.protocol_id, "decode failed: {e}");
                self.error_handler
                    .on_error(ErrorReason::DecodingError, &envelope)
                    .await;
                return Ok(());
            }
        };

        let policy = self.policy;
        let Some(entries) = self
            .handlers
            .get_mut(&envelope.protocol_id)
            .filter(|entries| !entries.is_empty())
        else {
            self.error_handler
                .on_error(ErrorReason::NoActiveHandler, &envelope)
                .await;
            return Ok(());
        };

        let handler_timeout = self.handler_timeout.filter(|t| !t.is_zero());
        let mut failures = 0u64;
        let mut detached: Vec<usize> = Vec::new();
        let mut fatal: Option<RuntimeError> = None;
        for (idx, entry) in entries.iter_mut().enumerate() {
            let invocation = entry.handler.handle(message.as_ref(), &envelope, &entry.ctx);
            let result = match handler_timeout {
                Some(limit) => match tokio::time::timeout(limit, invocation).await {
                    Ok(result) => result,
                    Err(_) => Err(RuntimeError::Timeout(format!(
                        "handler '{}' exceeded {limit:?}",
                        entry.name
                    ))),
                },
                None => invocation.await,
            };
            match result {
                Ok(()) => {}
                Err(e) => {
                    failures += 1;
                    match policy {
                        ExceptionPolicy::JustLog => {
                            warn!(
                                skill = %entry.skill,
                                handler = %entry.name,
                                "handler error: {e}"
                            );
                        }
                        ExceptionPolicy::StopAndExit => {
                            warn!(
                                skill = %entry.skill,
                                handler = %entry.name,
                                "handler error: {e}; deactivating handler"
                            );
                            detached.push(idx);
                        }
                        ExceptionPolicy::Propagate => {
                            fatal = Some(e);
                            break;
                        }
                    }
                }
            }
        }
        for idx in detached.into_iter().rev() {
            entries.remove(idx);
        }
        if failures > 0 {
            *self
                .handler_errors
                .entry(envelope.protocol_id.clone())
                .or_default() += failures;
        }
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::noop_context;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    };

    fn sample_envelope(protocol: &str) -> Envelope {
        let a = astrid_crypto::Crypto::generate(astrid_crypto::LedgerId::Ed25519);
        let b = astrid_crypto::Crypto::generate(astrid_crypto::LedgerId::Ed25519);
        Envelope::new(
            a.address().clone(),
            b.address().clone(),
            protocol.parse().unwrap(),
            Vec::new(),
        )
    }

    struct RecordingErrorHandler {
        seen: Arc<Mutex<Vec<ErrorReason>>>,
    }

    #[async_trait]
    impl ErrorHandler for RecordingErrorHandler {
        async fn on_error(&mut self, reason: ErrorReason, _envelope: &Envelope) {
            self.seen.lock().unwrap().push(reason);
        }
    }

    struct CountingHandler {
        protocol: ProtocolId,
        calls: Arc<AtomicU32>,
        fail: bool,
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
            if self.fail {
                Err(RuntimeError::Internal("boom".into()))
            } else {
                Ok(())
            }
        }
    }

    fn dispatcher_with_recorder(
        policy: ExceptionPolicy,
    ) -> (Dispatcher, Arc<Mutex<Vec<ErrorReason>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = Dispatcher::new(
            Arc::new(ProtocolRegistry::with_defaults()),
            Box::new(RecordingErrorHandler {
                seen: Arc::clone(&seen),
            }),
            policy,
        );
        (dispatcher, seen)
    }

    #[tokio::test]
    async fn unknown_protocol_goes_to_error_handler() {
        let (mut dispatcher, seen) = dispatcher_with_recorder(ExceptionPolicy::JustLog);
        dispatcher
            .dispatch(sample_envelope("fipa/1.0.0"))
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![ErrorReason::UnsupportedProtocol]);
    }

    #[tokio::test]
    async fn undecodable_payload_goes_to_error_handler() {
        let (mut dispatcher, seen) = dispatcher_with_recorder(ExceptionPolicy::JustLog);
        let mut env = sample_envelope("astrid/default/1.0.0");
        env.message = vec![0xff, 0xff, 0xff, 0xff];
        dispatcher.dispatch(env).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![ErrorReason::DecodingError]);
    }

    #[tokio::test]
    async fn known_protocol_without_handlers_goes_to_error_handler() {
        let (mut dispatcher, seen) = dispatcher_with_recorder(ExceptionPolicy::JustLog);
        let codec = default_protocol::DefaultCodec;
        let msg = DefaultMessage::Bytes { content: vec![1] };
        let mut env = sample_envelope("astrid/default/1.0.0");
        env.message = astrid_envelope::ProtocolCodec::encode(&codec, &msg).unwrap();
        dispatcher.dispatch(env).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![ErrorReason::NoActiveHandler]);
    }

    #[tokio::test]
    async fn matching_handlers_run_and_error_handler_does_not() {
        let (mut dispatcher, seen) = dispatcher_with_recorder(ExceptionPolicy::JustLog);
        let calls = Arc::new(AtomicU32::new(0));
        for name in ["h1", "h2"] {
            dispatcher.register_handler(
                "skill",
                name,
                Box::new(CountingHandler {
                    protocol: "astrid/default/1.0.0".parse().unwrap(),
                    calls: Arc::clone(&calls),
                    fail: false,
                }),
                noop_context("skill"),
            );
        }
        let codec = default_protocol::DefaultCodec;
        let msg = DefaultMessage::Bytes { content: vec![1] };
        let mut env = sample_envelope("astrid/default/1.0.0");
        env.message = astrid_envelope::ProtocolCodec::encode(&codec, &msg).unwrap();
        dispatcher.dispatch(env).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_handler_under_just_log_keeps_delivering() {
        let (mut dispatcher, _seen) = dispatcher_with_recorder(ExceptionPolicy::JustLog);
        let calls = Arc::new(AtomicU32::new(0));
        let protocol: ProtocolId = "astrid/default/1.0.0".parse().unwrap();
        dispatcher.register_handler(
            "skill",
            "flaky",
            Box::new(CountingHandler {
                protocol: protocol.clone(),
                calls: Arc::clone(&calls),
                fail: true,
            }),
            noop_context("skill"),
        );

        let codec = default_protocol::DefaultCodec;
        let msg = DefaultMessage::Bytes { content: vec![1] };
        for _ in 0..3 {
            let mut env = sample_envelope("astrid/default/1.0.0");
            env.message = astrid_envelope::ProtocolCodec::encode(&codec, &msg).unwrap();
            dispatcher.dispatch(env).await.unwrap();
        }
        // Delivery continued and every failure was counted.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(dispatcher.handler_errors(&protocol), 3);
        assert_eq!(dispatcher.handler_count(&protocol), 1);
    }

    #[tokio::test]
    async fn failing_handler_under_stop_and_exit_is_detached() {
        let (mut dispatcher, seen) = dispatcher_with_recorder(ExceptionPolicy::StopAndExit);
        let calls = Arc::new(AtomicU32::new(0));
        let protocol: ProtocolId = "astrid/default/1.0.0".parse().unwrap();
        dispatcher.register_handler(
            "skill",
            "flaky",
            Box::new(CountingHandler {
                protocol: protocol.clone(),
                calls: Arc::clone(&calls),
                fail: true,
            }),
            noop_context("skill"),
        );

        let codec = default_protocol::DefaultCodec;
        let msg = DefaultMessage::Bytes { content: vec![1] };
        let mut env = sample_envelope("astrid/default/1.0.0");
        env.message = astrid_envelope::ProtocolCodec::encode(&codec, &msg).unwrap();
        dispatcher.dispatch(env).await.unwrap();
        assert_eq!(dispatcher.handler_count(&protocol), 0);

        // The next envelope finds no active handler.
        let mut env = sample_envelope("astrid/default/1.0.0");
        env.message = astrid_envelope::ProtocolCodec::encode(&codec, &msg).unwrap();
        dispatcher.dispatch(env).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![ErrorReason::NoActiveHandler]);
    }

    #[tokio::test]
    async fn failing_handler_under_propagate_surfaces() {
        let (mut dispatcher, _seen) = dispatcher_with_recorder(ExceptionPolicy::Propagate);
        let protocol: ProtocolId = "astrid/default/1.0.0".parse().unwrap();
        dispatcher.register_handler(
            "skill",
            "flaky",
            Box::new(CountingHandler {
                protocol: protocol.clone(),
                calls: Arc::new(AtomicU32::new(0)),
                fail: true,
            }),
            noop_context("skill"),
        );
        let codec = default_protocol::DefaultCodec;
        let msg = DefaultMessage::Bytes { content: vec![1] };
        let mut env = sample_envelope("astrid/default/1.0.0");
        env.message = astrid_envelope::ProtocolCodec::encode(&codec, &msg).unwrap();
        assert!(dispatcher.dispatch(env).await.is_err());
    }
}
