// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! EventSub WebSocket session machine.
//!
//! One reader per socket. Frames are deduplicated against the seen-ids cache,
//! then dispatched by message type; notification handling is spawned as
//! independent tasks so a slow handler cannot stall keepalives. A
//! `session_reconnect` swaps the socket in place; transport failures re-enter
//! the dial loop with linear backoff until the reconnect budget is exhausted.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::error::{BotError, Result};
use crate::eventsub::reconcile::SubscriptionReconciler;
use crate::eventsub::seen::SeenCache;
use crate::eventsub::{Envelope, MessageType, NotificationPayload, SessionPayload};
use crate::notify::NotificationHandler;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Seconds of backoff added per failed reconnect attempt.
const BACKOFF_UNIT_SECS: u64 = 5;

/// How long a replacement socket gets to deliver its welcome.
const WELCOME_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// EventSub dial URL.
    pub url: String,
    /// Give up permanently after this many failed (re)connects.
    pub max_reconnect: u32,
    /// Seen-ids window; at least the platform duplicate window of 15.
    pub seen_cache_size: usize,
}

/// What a handled frame asks the connection loop to do next.
enum FrameAction {
    Ignored,
    Established,
    Reconnect(String),
    Close,
    Protocol(String),
}

/// Why a connection ended.
enum ConnectionEnd {
    /// Cancelled or server-directed close; do not redial.
    Shutdown,
    /// Transport drop; redial with backoff.
    Dropped(String),
}

pub struct SessionMachine {
    cfg: SessionConfig,
    reconciler: Arc<SubscriptionReconciler>,
    notify: Arc<NotificationHandler>,
    seen: Mutex<SeenCache>,
    session_id: RwLock<Option<String>>,
    cancel: CancellationToken,
}

impl SessionMachine {
    pub fn new(
        cfg: SessionConfig,
        reconciler: Arc<SubscriptionReconciler>,
        notify: Arc<NotificationHandler>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let seen = SeenCache::new(cfg.seen_cache_size);
        Arc::new(Self {
            cfg,
            reconciler,
            notify,
            seen: Mutex::new(seen),
            session_id: RwLock::new(None),
            cancel,
        })
    }

    /// Current session id, `None` until the first welcome.
    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    /// Dial-and-read loop. Returns `Ok` on clean shutdown, `Err` once the
    /// reconnect budget is exhausted.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut reconnect_count: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            match self.run_connection().await {
                Ok(ConnectionEnd::Shutdown) => return Ok(()),
                Ok(ConnectionEnd::Dropped(reason)) => {
                    tracing::warn!(reason = %reason, "eventsub socket dropped");
                }
                Err(e) => {
                    tracing::warn!(err = %e, "eventsub connect failed");
                }
            }

            reconnect_count += 1;
            if reconnect_count > self.cfg.max_reconnect {
                return Err(BotError::WebSocketClosed(format!(
                    "reconnect budget exhausted after {} attempts",
                    self.cfg.max_reconnect
                )));
            }
            let delay = Duration::from_secs(BACKOFF_UNIT_SECS * u64::from(reconnect_count));
            tracing::warn!(
                attempt = reconnect_count,
                delay_secs = delay.as_secs(),
                "reconnecting after backoff"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_connection(self: &Arc<Self>) -> Result<ConnectionEnd> {
        let (mut stream, _) = tokio_tungstenite::connect_async(&self.cfg.url)
            .await
            .map_err(|e| BotError::WebSocketClosed(e.to_string()))?;
        tracing::info!("eventsub socket connected");

        let mut established = false;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = stream.close(None).await;
                    return Ok(ConnectionEnd::Shutdown);
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        match self.handle_frame(&text.to_string(), established).await {
                            FrameAction::Ignored => {}
                            FrameAction::Established => established = true,
                            FrameAction::Reconnect(url) => {
                                match self.dial_replacement(&url).await {
                                    Ok(replacement) => {
                                        let _ = stream.close(None).await;
                                        stream = replacement;
                                        tracing::info!("session reconnect complete, socket swapped");
                                    }
                                    Err(e) => {
                                        return Ok(ConnectionEnd::Dropped(format!(
                                            "reconnect dial failed: {e}"
                                        )));
                                    }
                                }
                            }
                            FrameAction::Close => {
                                tracing::warn!("server requested close");
                                let _ = stream.close(None).await;
                                return Ok(ConnectionEnd::Shutdown);
                            }
                            FrameAction::Protocol(reason) => {
                                let _ = stream.close(None).await;
                                return Ok(ConnectionEnd::Dropped(reason));
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Ok(ConnectionEnd::Dropped("peer closed".to_owned()));
                    }
                    Some(Err(e)) => return Ok(ConnectionEnd::Dropped(e.to_string())),
                    Some(Ok(_)) => {} // ping/pong/binary
                }
            }
        }
    }

    /// Decode, deduplicate, and dispatch one text frame.
    async fn handle_frame(self: &Arc<Self>, raw: &str, established: bool) -> FrameAction {
        let envelope: Envelope = match serde_json::from_str(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(err = %e, "undecodable frame dropped");
                return FrameAction::Ignored;
            }
        };

        // Strict dedup across all message types, including across reconnects.
        if !self.seen.lock().await.insert(&envelope.metadata.message_id) {
            tracing::debug!(
                message_id = %envelope.metadata.message_id,
                "duplicate envelope dropped"
            );
            return FrameAction::Ignored;
        }

        if !established && envelope.metadata.message_type != MessageType::SessionWelcome {
            return FrameAction::Protocol("first frame was not session_welcome".to_owned());
        }

        match envelope.metadata.message_type {
            MessageType::SessionWelcome => {
                let payload: SessionPayload = match serde_json::from_value(envelope.payload) {
                    Ok(payload) => payload,
                    Err(e) => {
                        return FrameAction::Protocol(format!("malformed welcome: {e}"));
                    }
                };
                let session_id = payload.session.id;
                tracing::info!(session_id = %session_id, "session established");
                *self.session_id.write().await = Some(session_id.clone());

                let reconciler = Arc::clone(&self.reconciler);
                tokio::spawn(async move {
                    if let Err(e) = reconciler.reconcile(&session_id).await {
                        tracing::error!(err = %e, "subscription reconciliation failed");
                    }
                });
                FrameAction::Established
            }
            MessageType::SessionKeepalive => FrameAction::Ignored,
            MessageType::Notification => {
                let payload: NotificationPayload =
                    match serde_json::from_value(envelope.payload) {
                        Ok(payload) => payload,
                        Err(e) => {
                            tracing::error!(err = %e, "malformed notification dropped");
                            return FrameAction::Ignored;
                        }
                    };
                let notify = Arc::clone(&self.notify);
                let metadata = envelope.metadata;
                tokio::spawn(async move {
                    notify.handle(metadata, payload).await;
                });
                FrameAction::Ignored
            }
            MessageType::SessionReconnect => {
                let payload: std::result::Result<SessionPayload, _> =
                    serde_json::from_value(envelope.payload);
                match payload.ok().and_then(|p| p.session.reconnect_url) {
                    Some(url) => FrameAction::Reconnect(url),
                    None => FrameAction::Protocol("reconnect frame without url".to_owned()),
                }
            }
            MessageType::Close => FrameAction::Close,
            MessageType::Unknown => {
                tracing::error!(
                    message_id = %envelope.metadata.message_id,
                    "unknown message type dropped"
                );
                FrameAction::Ignored
            }
        }
    }

    /// Dial the reconnect URL and wait for its welcome.
    ///
    /// The welcome flows through [`handle_frame`](Self::handle_frame), so the
    /// session id swaps atomically and its envelope id lands in the dedup
    /// window like any other frame.
    async fn dial_replacement(self: &Arc<Self>, url: &str) -> Result<WsStream> {
        let (mut stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| BotError::WebSocketClosed(e.to_string()))?;

        let deadline = tokio::time::Instant::now() + WELCOME_TIMEOUT;
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = stream.close(None).await;
                    return Err(BotError::WebSocketClosed("cancelled".to_owned()));
                }
                frame = tokio::time::timeout_at(deadline, stream.next()) => match frame {
                    Ok(frame) => frame,
                    Err(_) => {
                        let _ = stream.close(None).await;
                        return Err(BotError::WebSocketClosed(
                            "no welcome on replacement socket".to_owned(),
                        ));
                    }
                }
            };
            match frame {
                Some(Ok(Message::Text(text))) => {
                    match self.handle_frame(&text.to_string(), false).await {
                        FrameAction::Established => return Ok(stream),
                        FrameAction::Ignored => {} // duplicate or undecodable
                        _ => {
                            let _ = stream.close(None).await;
                            return Err(BotError::WebSocketClosed(
                                "replacement socket sent non-welcome frame".to_owned(),
                            ));
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(BotError::WebSocketClosed(
                        "replacement socket closed before welcome".to_owned(),
                    ));
                }
                Some(Err(e)) => return Err(BotError::WebSocketClosed(e.to_string())),
                Some(Ok(_)) => {} // ping/pong/binary
            }
        }
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
