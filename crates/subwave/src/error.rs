// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error taxonomy for the bot core.
//!
//! The core catches only where recovery is defined (401 refresh, 429 wait,
//! socket reconnect). Everything else propagates to the embedder through
//! [`EventBot::hold`](crate::bot::EventBot::hold).

use crate::storage::StorageError;

/// Errors surfaced by the bot core.
#[derive(Debug, thiserror::Error)]
pub enum BotError {
    /// Non-200 from the token endpoint during code exchange or refresh.
    #[error("token exchange failed ({status}): {body}")]
    TokenExchange { status: u16, body: String },

    /// A second consecutive 401 after a refresh, or no token held at all.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// 429 responses outlasted the bounded retry budget.
    #[error("rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },

    /// Any other non-2xx API response.
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },

    /// The EventSub socket closed, failed mid-read, or ran out of reconnects.
    #[error("websocket closed: {0}")]
    WebSocketClosed(String),

    /// OAuth callback arrived with a `state` that does not match ours.
    #[error("oauth state mismatch")]
    StateMismatch,

    /// A recognized but unusable configuration value.
    #[error("invalid config: {0}")]
    Config(String),

    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BotError>;
