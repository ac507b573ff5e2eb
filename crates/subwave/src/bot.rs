// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bot shell: wires storage, token lifecycle, API client, queue, and the
//! session machine into one embeddable unit.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::alerts::{AlertRegistry, BotCx};
use crate::api::HelixClient;
use crate::config::BotConfig;
use crate::error::{BotError, Result};
use crate::eventsub::reconcile::{SubscriptionReconciler, DOCS_URL};
use crate::eventsub::session::{SessionConfig, SessionMachine};
use crate::notify::NotificationHandler;
use crate::queue::AlertQueue;
use crate::storage::{create_storage, Storage};
use crate::token::{AuthSettings, TokenManager};

/// Grace period for the socket reader after cancellation.
const READER_GRACE: Duration = Duration::from_secs(5);

/// Storage name for the queue snapshot.
const QUEUE_NAME: &str = "alerts";

pub struct EventBot {
    config: BotConfig,
    registry: Arc<AlertRegistry>,
    storage: Arc<dyn Storage>,
    token: Arc<TokenManager>,
    api: Arc<HelixClient>,
    queue: Arc<AlertQueue>,
    cancel: CancellationToken,
    session: Mutex<Option<Arc<SessionMachine>>>,
    session_task: Mutex<Option<JoinHandle<Result<()>>>>,
    worker_task: Mutex<Option<JoinHandle<()>>>,
}

impl EventBot {
    /// Build the bot from config and the handler registry.
    ///
    /// The registry is fixed at construction; topics without a handler flow
    /// through the generic fallback.
    pub fn new(config: BotConfig, registry: AlertRegistry) -> Result<Arc<Self>> {
        config.validate()?;
        let storage = create_storage(config.storage_type, config.data_dir())?;
        let token = TokenManager::new(
            AuthSettings {
                client_id: config.client_id.clone(),
                client_secret: config.client_secret.clone(),
                redirect_uri: config.redirect_uri.clone(),
                scopes: config.scopes.clone(),
                auth_base_url: config.auth_base_url.clone(),
            },
            Some(Arc::clone(&storage)),
        );
        let api = HelixClient::new(Arc::clone(&token), config.helix_base_url.clone());
        let queue = AlertQueue::new(QUEUE_NAME, Some(Arc::clone(&storage)));

        Ok(Arc::new(Self {
            config,
            registry: Arc::new(registry),
            storage,
            token,
            api,
            queue,
            cancel: CancellationToken::new(),
            session: Mutex::new(None),
            session_task: Mutex::new(None),
            worker_task: Mutex::new(None),
        }))
    }

    pub fn api(&self) -> Arc<HelixClient> {
        Arc::clone(&self.api)
    }

    pub fn token(&self) -> Arc<TokenManager> {
        Arc::clone(&self.token)
    }

    pub fn queue(&self) -> Arc<AlertQueue> {
        Arc::clone(&self.queue)
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        Arc::clone(&self.storage)
    }

    /// Serve extra routes on the OAuth redirect host/port. Must be called
    /// before [`start`](Self::start); keeps the embedded server up after the
    /// flow completes.
    pub fn set_user_routes(&self, routes: axum::Router) {
        self.token.set_user_routes(routes);
    }

    /// Authenticate, restore the queue, and spawn the worker and socket loop.
    pub async fn start(&self) -> Result<()> {
        self.token.start(None).await?;
        self.queue.load_state(&self.registry).await?;

        let cx = BotCx {
            api: Arc::clone(&self.api),
            token: Arc::clone(&self.token),
            storage: Some(Arc::clone(&self.storage)),
        };

        let worker = tokio::spawn(Arc::clone(&self.queue).run_worker(
            Arc::clone(&self.registry),
            cx.clone(),
            self.cancel.child_token(),
        ));
        *self.worker_task.lock().await = Some(worker);

        let docs_url = self.config.fetch_versions.then(|| DOCS_URL.to_owned());
        let reconciler = SubscriptionReconciler::new(
            Arc::clone(&self.api),
            Arc::clone(&self.token),
            Some(Arc::clone(&self.storage)),
            self.config.desired_subscriptions(),
            docs_url,
        );
        let notify = NotificationHandler::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.queue),
            cx,
            self.config.queue_skip.clone(),
        );
        let session = SessionMachine::new(
            SessionConfig {
                url: self.config.eventsub_ws_url.clone(),
                max_reconnect: self.config.max_reconnect,
                seen_cache_size: self.config.seen_cache_size,
            },
            reconciler,
            notify,
            self.cancel.child_token(),
        );
        *self.session.lock().await = Some(Arc::clone(&session));
        *self.session_task.lock().await = Some(tokio::spawn(session.run()));
        Ok(())
    }

    /// Current EventSub session id, when established.
    pub async fn session_id(&self) -> Option<String> {
        match self.session.lock().await.as_ref() {
            Some(session) => session.session_id().await,
            None => None,
        }
    }

    /// Block until the socket loop exits (reconnect budget exhausted) or
    /// [`stop`](Self::stop) is invoked, then shut everything down.
    pub async fn hold(&self) -> Result<()> {
        let handle = self.session_task.lock().await.take();
        let outcome = match handle {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => Err(BotError::WebSocketClosed(format!("session task failed: {e}"))),
            },
            None => Ok(()),
        };
        self.stop().await;
        outcome
    }

    /// Cancellation sequence: flip the run flag, close the socket, give the
    /// reader a grace period, then stop the worker and token validator.
    pub async fn stop(&self) {
        tracing::warn!("shutting down bot");
        self.cancel.cancel();

        if let Some(mut handle) = self.session_task.lock().await.take() {
            if tokio::time::timeout(READER_GRACE, &mut handle).await.is_err() {
                tracing::warn!("socket reader did not stop in time, aborting");
                handle.abort();
            }
        }
        if let Some(handle) = self.worker_task.lock().await.take() {
            let _ = handle.await;
        }
        self.token.stop().await;
        tracing::warn!("bot shutdown complete");
    }
}
