// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The per-agent runtime: a single-task cooperative event loop that drives
//! periodic behaviours, drains inbound envelopes, and dispatches them to
//! skill handlers.
//!
//! # Architecture
//!
//! ```text
//!   Connection ──┐                               ┌── Handler (skill A)
//!   Connection ──┼─► Inbox ──► AgentRuntime ─────┼── Handler (skill B)
//!   Connection ──┘              │    │           └── ErrorHandler
//!        ▲                      │    └─► Scheduler ─► Behaviours
//!        │                      ▼
//!        └──── Multiplexer ◄── Outbox ◄─── handlers / behaviours
//! ```
//!
//! The agent loop is strictly single-task: handlers and behaviours run
//! serially and synchronize with the connection tasks only through the
//! bounded [`queue::Inbox`] / [`queue::Outbox`] pair. Connections receive an
//! immutable [`context::AgentContext`] and never call back into the runtime.

pub mod agent;
pub mod behaviour;
pub mod builder;
pub mod connection;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod multiplexer;
pub mod queue;
pub mod scheduler;
pub mod skill;
pub mod tasks;

#[cfg(test)]
pub(crate) mod test_support;

pub use agent::{AgentRuntime, RuntimeConfig, RuntimeHandle, RuntimeState};
pub use behaviour::{Behaviour, BehaviourState, FsmBehaviour, SequenceBehaviour};
pub use builder::{AgentBuilder, ComponentLoader};
pub use connection::{Connection, ConnectionId, ExceptionPolicy};
pub use context::AgentContext;
pub use dispatcher::{DefaultErrorHandler, Dispatcher, ErrorHandler, ErrorReason, Handler};
pub use error::{QueueError, RuntimeError};
pub use multiplexer::{Multiplexer, MultiplexerState, RoutingTable};
pub use queue::{Inbox, Outbox, Queue};
pub use scheduler::{Schedule, Scheduler};
pub use skill::{Skill, SkillContext};
pub use tasks::{TaskHandle, TaskManager};
