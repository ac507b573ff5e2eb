// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pluggable persistence for tokens, queue snapshots, and event archives.
//!
//! Three namespaces share one trait: tokens by name, queue snapshots by name,
//! and per-topic archive tables. Backends are interchangeable; the core calls
//! only the operations below.

pub mod json;
pub mod sqlite;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::token::UserToken;

/// A flat archive row: column name to scalar-ish JSON value.
pub type Record = serde_json::Map<String, Value>;

/// Typed storage failure with the backend subfailure attached.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("unsupported selector: {0}")]
    Selector(String),

    #[error("empty record")]
    EmptyRecord,

    #[error("backend task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Uniform persistence contract shared by all backends.
///
/// `load_token` / `load_queue` report absence as `None` / empty, never as an
/// error. Every other failure carries the backend subfailure.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Atomically overwrite the token stored under `name`.
    async fn save_token(&self, name: &str, token: &UserToken) -> Result<(), StorageError>;

    /// Load the token stored under `name`, or `None` when absent.
    async fn load_token(&self, name: &str) -> Result<Option<UserToken>, StorageError>;

    /// Overwrite the queue snapshot stored under `name`.
    async fn save_queue(&self, name: &str, entries: &[Value]) -> Result<(), StorageError>;

    /// Load the queue snapshot stored under `name`, empty when absent.
    async fn load_queue(&self, name: &str) -> Result<Vec<Value>, StorageError>;

    /// Insert a row into an archive table, evolving the schema on first use.
    ///
    /// The row is keyed by `message_id` when present, else `name`, else the
    /// first column. With `upsert` the key decides replacement.
    async fn insert(&self, table: &str, record: Record, upsert: bool) -> Result<(), StorageError>;

    /// Select rows matching a `col = ?` selector with bound parameters.
    async fn query(
        &self,
        table: &str,
        where_clause: &str,
        params: &[Value],
    ) -> Result<Vec<Record>, StorageError>;

    /// Delete rows matching a `col = ?` selector. Returns the removed count.
    async fn delete(
        &self,
        table: &str,
        where_clause: &str,
        params: &[Value],
    ) -> Result<usize, StorageError>;
}

/// Which reference backend to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Json,
    Sqlite,
}

/// Build a reference backend rooted at `dir`.
pub fn create_storage(kind: StorageKind, dir: PathBuf) -> Result<Arc<dyn Storage>, StorageError> {
    match kind {
        StorageKind::Json => Ok(Arc::new(json::JsonStorage::new(dir)?)),
        StorageKind::Sqlite => Ok(Arc::new(sqlite::SqliteStorage::open(dir.join("subwave.db"))?)),
    }
}

/// Replace every non-word character with `_`.
///
/// Applied to every table name before it reaches an underlying engine, so
/// topic strings like `channel.chat.message` become valid identifiers.
pub fn sanitize_identifier(name: &str) -> String {
    name.chars().map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' }).collect()
}

/// Pick the key column for an archive row.
pub(crate) fn record_key(record: &Record) -> Result<(String, Value), StorageError> {
    if let Some(v) = record.get("message_id") {
        return Ok(("message_id".to_owned(), v.clone()));
    }
    if let Some(v) = record.get("name") {
        return Ok(("name".to_owned(), v.clone()));
    }
    record
        .iter()
        .next()
        .map(|(k, v)| (k.clone(), v.clone()))
        .ok_or(StorageError::EmptyRecord)
}

/// Parse a `col = ?` selector into the column name.
///
/// Both reference backends accept only single-column equality, which is all
/// the core issues.
pub(crate) fn parse_eq_selector(where_clause: &str) -> Result<String, StorageError> {
    let mut parts = where_clause.split('=');
    let col = parts.next().unwrap_or("").trim();
    let rhs = parts.next().unwrap_or("").trim();
    if col.is_empty() || rhs != "?" || parts.next().is_some() {
        return Err(StorageError::Selector(where_clause.to_owned()));
    }
    Ok(sanitize_identifier(col))
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
