// SPDX-FileCopyrightText: 2026 Nightjar Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! API Error Types
//!
//! Unified error type for the client API layer.

use thiserror::Error;

use crate::contact::ContactError;
use crate::state::StateError;
use crate::transport::TransportError;

/// Unified error type for client operations.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Session operation failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// State persistence or decoding failed.
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Contact registry rejected an entry.
    #[error("contact error: {0}")]
    Contact(#[from] ContactError),

    /// The client was started twice.
    #[error("client already started")]
    AlreadyStarted,

    /// The command loop is gone; the client is shutting down.
    #[error("client is shutting down")]
    ShuttingDown,
}

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;
