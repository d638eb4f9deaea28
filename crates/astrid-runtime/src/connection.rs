// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The connection seam between the agent and its transports.

use async_trait::async_trait;

use astrid_envelope::Envelope;

use crate::error::RuntimeError;

/// Identifier of a connection within the multiplexer.
pub type ConnectionId = String;

/// What the multiplexer does when a connection's send or receive loop fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExceptionPolicy {
    /// Stop the whole multiplexer; the runtime transitions to `Error`.
    Propagate,
    /// Detach the failing connection and continue with the rest.
    StopAndExit,
    /// Log and retry with bounded backoff.
    #[default]
    JustLog,
}

/// A pluggable transport.
///
/// Implementations are handles over their own internal tasks: all methods
/// take `&self` and use interior channels, so the multiplexer can run a send
/// loop and a receive loop against the same connection concurrently.
#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> &ConnectionId;

    async fn connect(&self) -> Result<(), RuntimeError>;

    async fn disconnect(&self) -> Result<(), RuntimeError>;

    /// Transmit one envelope.
    async fn send(&self, env: Envelope) -> Result<(), RuntimeError>;

    /// Wait for the next inbound envelope.
    async fn receive(&self) -> Result<Envelope, RuntimeError>;

    fn is_connected(&self) -> bool;
}
