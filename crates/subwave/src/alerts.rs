// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Alert model and per-topic handler registry.
//!
//! An [`Alert`] is pure data: the normalized form of one notification
//! envelope. Behavior lives in [`AlertHandler`] implementations registered by
//! the embedder; topics without a handler fall through to [`GenericAlert`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::HelixClient;
use crate::storage::{sanitize_identifier, Record, Storage, StorageError};
use crate::token::TokenManager;

/// Normalized notification. Constructed once per envelope, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub message_id: String,
    /// The subscription topic this arrived on.
    pub channel: String,
    /// Opaque event body from the envelope.
    pub data: Value,
    /// Envelope timestamp, epoch seconds (fractional).
    pub timestamp: f64,
    /// Lower runs sooner. Copied from the handler at construction.
    pub priority: i64,
}

/// Shared context handed to handlers.
#[derive(Clone)]
pub struct BotCx {
    pub api: Arc<HelixClient>,
    pub token: Arc<TokenManager>,
    pub storage: Option<Arc<dyn Storage>>,
}

/// Per-topic behavior: dispatch priority, queue bypass, archival, processing.
///
/// `process` must be idempotent with respect to its side effects: the queue
/// is restored from disk after a crash, so an alert can be delivered again.
#[async_trait]
pub trait AlertHandler: Send + Sync {
    /// Queue priority for this topic. Lower is sooner.
    fn priority(&self) -> i64 {
        3
    }

    /// Bypass the queue and process immediately as a detached task.
    fn queue_skip(&self) -> bool {
        false
    }

    /// Whether notifications on this topic are archived at all.
    fn wants_store(&self) -> bool {
        true
    }

    /// Write the alert to its per-topic archive table.
    ///
    /// The default flattens the event one level and upserts keyed by
    /// `message_id`; override for a custom projection.
    async fn store(&self, alert: &Alert, storage: &dyn Storage) -> Result<(), StorageError> {
        let mut record = flatten_event(&alert.data);
        record.insert("timestamp".to_owned(), Value::from(alert.timestamp));
        record.insert("message_id".to_owned(), Value::String(alert.message_id.clone()));
        storage.insert(&channel_table(&alert.channel), record, true).await
    }

    /// User code. Errors are logged by the dispatcher and never kill it.
    async fn process(&self, alert: &Alert, cx: &BotCx) -> anyhow::Result<()>;
}

/// Fallback for topics without a registered handler.
pub struct GenericAlert;

#[async_trait]
impl AlertHandler for GenericAlert {
    fn priority(&self) -> i64 {
        4
    }

    fn queue_skip(&self) -> bool {
        true
    }

    fn wants_store(&self) -> bool {
        false
    }

    async fn process(&self, alert: &Alert, _cx: &BotCx) -> anyhow::Result<()> {
        tracing::warn!(
            channel = %alert.channel,
            message_id = %alert.message_id,
            "processing generic alert"
        );
        tracing::debug!(data = %alert.data, "generic alert payload");
        Ok(())
    }
}

/// Topic to handler map, populated by the embedder at construction.
pub struct AlertRegistry {
    handlers: HashMap<String, Arc<dyn AlertHandler>>,
    fallback: Arc<dyn AlertHandler>,
}

impl AlertRegistry {
    pub fn new() -> Self {
        Self { handlers: HashMap::new(), fallback: Arc::new(GenericAlert) }
    }

    /// Register `handler` for an exact topic string.
    pub fn register(&mut self, topic: impl Into<String>, handler: Arc<dyn AlertHandler>) {
        self.handlers.insert(topic.into(), handler);
    }

    /// Look up the handler for `topic`, falling back to [`GenericAlert`].
    pub fn resolve(&self, topic: &str) -> Arc<dyn AlertHandler> {
        self.handlers.get(topic).map(Arc::clone).unwrap_or_else(|| Arc::clone(&self.fallback))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for AlertRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Archive table name for a topic.
pub fn channel_table(channel: &str) -> String {
    sanitize_identifier(channel)
}

/// Flatten an event body into a flat archive row.
///
/// Nested maps become `key_subkey` columns; lists (and anything nested deeper)
/// are serialized to JSON strings.
pub fn flatten_event(data: &Value) -> Record {
    let mut out = Record::new();
    let Some(map) = data.as_object() else {
        out.insert("data".to_owned(), Value::String(data.to_string()));
        return out;
    };
    for (key, value) in map {
        match value {
            Value::Array(_) => {
                out.insert(key.clone(), Value::String(value.to_string()));
            }
            Value::Object(inner) => {
                for (sub, sub_value) in inner {
                    let column = format!("{key}_{sub}");
                    match sub_value {
                        Value::Array(_) | Value::Object(_) => {
                            out.insert(column, Value::String(sub_value.to_string()));
                        }
                        other => {
                            out.insert(column, other.clone());
                        }
                    }
                }
            }
            other => {
                out.insert(key.clone(), other.clone());
            }
        }
    }
    out
}

#[cfg(test)]
#[path = "alerts_tests.rs"]
mod tests;
