// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The built-in echo skill: answers every `default`-protocol byte payload
//! with the same bytes and keeps a liveness heartbeat ticking.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use astrid_envelope::{default_protocol, DefaultMessage, Envelope, Message, ProtocolId};
use astrid_runtime::{Behaviour, Handler, RuntimeError, Schedule, Skill, SkillContext};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

pub fn echo_skill() -> Skill {
    let mut skill = Skill::new("echo");
    skill
        .add_handler("echo", Box::new(EchoHandler::new()))
        .expect("fresh skill accepts the handler");
    skill
        .add_behaviour(
            "heartbeat",
            Box::new(Heartbeat::default()),
            Schedule::Ticker {
                interval: HEARTBEAT_INTERVAL,
                start_at: None,
            },
        )
        .expect("fresh skill accepts the behaviour");
    skill
}

struct EchoHandler {
    protocol: ProtocolId,
}

impl EchoHandler {
    fn new() -> Self {
        Self {
            protocol: default_protocol::id(),
        }
    }
}

#[async_trait]
impl Handler for EchoHandler {
    fn supported_protocol(&self) -> &ProtocolId {
        &self.protocol
    }

    async fn handle(
        &mut self,
        message: &dyn Message,
        envelope: &Envelope,
        ctx: &SkillContext,
    ) -> Result<(), RuntimeError> {
        match message.downcast_ref::<DefaultMessage>() {
            Some(DefaultMessage::Bytes { content }) => {
                debug!(
                    sender = %envelope.sender,
                    bytes = content.len(),
                    "echoing payload"
                );
                let reply = DefaultMessage::Bytes {
                    content: content.clone(),
                };
                ctx.agent()
                    .send_message(envelope.sender.clone(), &self.protocol, &reply, None)
                    .await?;
                let echoed = ctx.get::<u64>("echoed").unwrap_or(0);
                ctx.set("echoed", echoed + 1);
                Ok(())
            }
            Some(DefaultMessage::Error { code, message, .. }) => {
                warn!(sender = %envelope.sender, ?code, "peer reported an error: {message}");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[derive(Default)]
struct Heartbeat {
    ticks: u64,
}

#[async_trait]
impl Behaviour for Heartbeat {
    async fn act(&mut self, ctx: &SkillContext) -> Result<(), RuntimeError> {
        self.ticks += 1;
        let echoed = ctx.get::<u64>("echoed").unwrap_or(0);
        info!(
            agent = %ctx.agent().name(),
            ticks = self.ticks,
            echoed,
            "heartbeat"
        );
        Ok(())
    }
}
