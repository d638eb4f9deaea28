// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

use astrid_envelope::EnvelopeError;

/// Outcome of a queue `get` with a timeout.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue empty")]
    Empty,

    #[error("queue closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("routing error: {0}")]
    Routing(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("{0} is not running")]
    NotRunning(&'static str),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("duplicate handler '{name}' in skill '{skill}'")]
    DuplicateHandler { skill: String, name: String },

    #[error("duplicate behaviour '{name}' in skill '{skill}'")]
    DuplicateBehaviour { skill: String, name: String },

    #[error("duplicate state '{0}' in finite-state machine")]
    DuplicateState(String),

    #[error("duplicate transition ({state}, {event})")]
    DuplicateTransition { state: String, event: String },

    #[error("unknown state '{0}' in finite-state machine")]
    UnknownState(String),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("internal error: {0}")]
    Internal(String),
}
