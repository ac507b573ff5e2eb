// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Notification ingestion: classify, archive, then enqueue or fast-path.

use std::collections::HashSet;
use std::sync::Arc;

use crate::alerts::{Alert, AlertRegistry, BotCx};
use crate::eventsub::{parse_timestamp, Metadata, NotificationPayload};
use crate::queue::AlertQueue;
use crate::token::epoch_secs;

/// Synthetic envelopes carry this id prefix and are never archived.
const TEST_ID_PREFIX: &str = "test_";

pub struct NotificationHandler {
    registry: Arc<AlertRegistry>,
    queue: Arc<AlertQueue>,
    cx: BotCx,
    /// Topics forced to bypass the queue regardless of their handler.
    skip_topics: HashSet<String>,
}

impl NotificationHandler {
    pub fn new(
        registry: Arc<AlertRegistry>,
        queue: Arc<AlertQueue>,
        cx: BotCx,
        skip_topics: HashSet<String>,
    ) -> Arc<Self> {
        Arc::new(Self { registry, queue, cx, skip_topics })
    }

    /// Ingest one notification envelope.
    ///
    /// Archive failures are logged and never block dispatch; a topic without
    /// a registered handler flows through the generic fallback.
    pub async fn handle(&self, metadata: Metadata, payload: NotificationPayload) {
        let channel = payload.subscription.topic.clone();
        let timestamp = match parse_timestamp(&metadata.message_timestamp) {
            Some(ts) => ts,
            None => {
                tracing::warn!(
                    raw = %metadata.message_timestamp,
                    "unparseable envelope timestamp, substituting now"
                );
                epoch_secs() as f64
            }
        };

        let handler = self.registry.resolve(&channel);
        let alert = Alert {
            message_id: metadata.message_id,
            channel: channel.clone(),
            data: payload.event,
            timestamp,
            priority: handler.priority(),
        };

        if let Some(storage) = &self.cx.storage {
            if handler.wants_store() && !alert.message_id.starts_with(TEST_ID_PREFIX) {
                if let Err(e) = handler.store(&alert, storage.as_ref()).await {
                    tracing::warn!(
                        channel = %alert.channel,
                        message_id = %alert.message_id,
                        err = %e,
                        "failed to archive alert"
                    );
                }
            }
        }

        if handler.queue_skip() || self.skip_topics.contains(&channel) {
            let cx = self.cx.clone();
            tokio::spawn(async move {
                if let Err(e) = handler.process(&alert, &cx).await {
                    tracing::error!(
                        channel = %alert.channel,
                        message_id = %alert.message_id,
                        err = %e,
                        "detached alert handler failed"
                    );
                }
            });
        } else if let Err(e) = self.queue.put(alert).await {
            tracing::error!(channel = %channel, err = %e, "failed to enqueue alert");
        }
    }
}

#[cfg(test)]
#[path = "notify_tests.rs"]
mod tests;
