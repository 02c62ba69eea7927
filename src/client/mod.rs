// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

pub mod breaker;
pub mod client;
pub mod common;
pub mod rpc;

/// Lifecycle failures surfaced to callers of the client API.
///
/// Transport-level errors (refused, reset, timeout) never reach callers
/// directly; connection tasks absorb them and feed the circuit breaker.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ClientError {
    /// The client is shutting down; no further work is accepted.
    #[error("client is shut down")]
    Closed,
    /// A suspended call was woken by context cancellation.
    #[error("operation cancelled")]
    Cancelled,
    /// The circuit breaker refused to dial; broadcast to every caller
    /// blocked on connection establishment.
    #[error("connect refused: circuit breaker open")]
    CircuitBreakerTripped,
}
