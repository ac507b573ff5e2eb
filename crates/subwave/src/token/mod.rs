// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! OAuth user-token lifecycle: acquire, refresh, validate, hand out.
//!
//! One manager owns the token. Readers take snapshots through [`TokenManager::get`],
//! which blocks while a refresh is in flight, so nobody ever observes a
//! half-updated token. Refresh is single-flight: concurrent triggers collapse
//! onto one in-flight request.

pub mod callback;
pub mod flow;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{BotError, Result};
use crate::storage::Storage;
use crate::token::callback::CallbackServer;
use crate::token::flow::TokenResponse;

/// Storage key the token is persisted under.
const TOKEN_NAME: &str = "twitch";

/// Validation cadence, and the expiry margin that triggers a preemptive refresh.
const VALIDATE_INTERVAL_SECS: u64 = 3600;

/// The OAuth user token as held and persisted by the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserToken {
    pub access: String,
    pub refresh: String,
    /// Absolute expiry, epoch seconds.
    pub expires_at: u64,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Filled in after the first successful validation.
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Credentials and endpoints the manager talks to.
#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    /// Base for `/oauth2/{authorize,token,validate}`.
    pub auth_base_url: String,
}

impl AuthSettings {
    fn authorize_url(&self) -> String {
        format!("{}/oauth2/authorize", self.auth_base_url)
    }

    fn token_url(&self) -> String {
        format!("{}/oauth2/token", self.auth_base_url)
    }

    fn validate_url(&self) -> String {
        format!("{}/oauth2/validate", self.auth_base_url)
    }
}

pub struct TokenManager {
    settings: AuthSettings,
    storage: Option<Arc<dyn Storage>>,
    http: reqwest::Client,
    token: RwLock<Option<UserToken>>,
    /// Open while a token is available; closed during refresh.
    gate: watch::Sender<bool>,
    /// Held by the one in-flight refresh.
    refresh_lock: Mutex<()>,
    cancel: CancellationToken,
    validator: Mutex<Option<JoinHandle<()>>>,
    /// Routes the embedder wants served alongside the OAuth callback.
    user_routes: std::sync::Mutex<Option<axum::Router>>,
    /// Kept alive after the flow when user routes were registered.
    callback_server: Mutex<Option<CallbackServer>>,
}

/// Installs the rustls crypto provider the first time a client is built.
///
/// `rustls-no-provider` leaves this to the embedder; `main.rs` does it for the
/// binary, but anything building a [`TokenManager`] directly (including
/// tests) needs the same install or `reqwest::Client::builder().build()`
/// panics.
fn ensure_crypto_provider() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

impl TokenManager {
    pub fn new(settings: AuthSettings, storage: Option<Arc<dyn Storage>>) -> Arc<Self> {
        ensure_crypto_provider();
        let (gate, _) = watch::channel(false);
        Arc::new(Self {
            settings,
            storage,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            token: RwLock::new(None),
            gate,
            refresh_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
            validator: Mutex::new(None),
            user_routes: std::sync::Mutex::new(None),
            callback_server: Mutex::new(None),
        })
    }

    /// Register routes to serve on the redirect host/port alongside the
    /// callback. When present, the embedded server stays up after the flow.
    pub fn set_user_routes(&self, routes: axum::Router) {
        *self.user_routes.lock().unwrap_or_else(std::sync::PoisonError::into_inner) =
            Some(routes);
    }

    /// Acquire a token and start the background validator.
    ///
    /// Uses `token` when supplied, else the persisted token, else runs the
    /// authorization-code flow. Returns once a valid token is held and
    /// `user_id` is known.
    pub async fn start(self: &Arc<Self>, token: Option<UserToken>) -> Result<()> {
        let mut held = token;
        if held.is_none() {
            if let Some(storage) = &self.storage {
                held = storage.load_token(TOKEN_NAME).await?;
                if held.is_some() {
                    tracing::info!("loaded saved token from storage");
                }
            }
        }
        let held = match held {
            Some(t) => t,
            None => self.authorize().await?,
        };

        *self.token.write().await = Some(held);
        self.gate.send_replace(true);

        self.ensure_validated().await?;

        let mgr = Arc::clone(self);
        *self.validator.lock().await = Some(tokio::spawn(async move {
            mgr.validator_loop().await;
        }));
        Ok(())
    }

    /// Snapshot the current token, waiting out any in-flight refresh.
    pub async fn get(&self) -> Result<UserToken> {
        let mut rx = self.gate.subscribe();
        rx.wait_for(|open| *open)
            .await
            .map_err(|_| BotError::AuthFailed("token manager stopped".to_owned()))?;
        self.token
            .read()
            .await
            .clone()
            .ok_or_else(|| BotError::AuthFailed("no token held".to_owned()))
    }

    /// The validated user id, once known.
    pub async fn user_id(&self) -> Option<String> {
        self.token.read().await.as_ref().and_then(|t| t.user_id.clone())
    }

    pub fn client_id(&self) -> &str {
        &self.settings.client_id
    }

    /// Refresh the token, falling back to a fresh authorization flow when the
    /// refresh grant is rejected.
    ///
    /// Single-flight: a caller that loses the race waits for the winner and
    /// returns the token it produced.
    pub async fn refresh(self: &Arc<Self>) -> Result<UserToken> {
        let Ok(_guard) = self.refresh_lock.try_lock() else {
            let _wait = self.refresh_lock.lock().await;
            return self.get().await;
        };

        self.gate.send_replace(false);
        let result = self.refresh_inner().await;
        // Reopen even on failure so callers degrade to errors instead of
        // blocking forever; the validator keeps retrying on its cadence.
        self.gate.send_replace(true);
        result
    }

    async fn refresh_inner(self: &Arc<Self>) -> Result<UserToken> {
        tracing::warn!("refreshing token");
        let previous = self.token.read().await.clone();
        let refresh = previous.as_ref().map(|t| t.refresh.clone()).unwrap_or_default();

        let response = flow::refresh_token(
            &self.http,
            &self.settings.token_url(),
            &self.settings.client_id,
            &self.settings.client_secret,
            &refresh,
        )
        .await;

        match response {
            Ok(resp) => self.accept(resp, previous).await,
            Err(e) => {
                tracing::error!(err = %e, "token refresh failed, starting a fresh flow");
                self.authorize().await
            }
        }
    }

    /// Run the authorization-code flow end to end and persist the result.
    async fn authorize(self: &Arc<Self>) -> Result<UserToken> {
        let redirect = reqwest::Url::parse(&self.settings.redirect_uri)
            .map_err(|e| BotError::Config(format!("redirect_uri: {e}")))?;
        let host = redirect
            .host_str()
            .ok_or_else(|| BotError::Config("redirect_uri has no host".to_owned()))?
            .to_owned();
        let port = redirect.port_or_known_default().unwrap_or(80);
        let path = redirect.path().to_owned();

        let state = flow::generate_state();
        let auth_url = flow::build_auth_url(
            &self.settings.authorize_url(),
            &self.settings.client_id,
            &self.settings.redirect_uri,
            &self.settings.scopes,
            &state,
        );

        let user_routes =
            self.user_routes.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take();
        let keep_serving = user_routes.is_some();
        let (server, code_rx) =
            CallbackServer::start(&host, port, &path, state, user_routes).await?;

        tracing::warn!("authorization required, open this URL to continue: {auth_url}");

        let code = code_rx
            .await
            .map_err(|_| BotError::AuthFailed("callback server closed before redirect".to_owned()))?;
        tracing::warn!("authorization code received");

        if keep_serving {
            *self.callback_server.lock().await = Some(server);
        } else {
            server.stop().await;
        }

        let resp = flow::exchange_code(
            &self.http,
            &self.settings.token_url(),
            &self.settings.client_id,
            &self.settings.client_secret,
            &code,
            &self.settings.redirect_uri,
        )
        .await?;
        self.accept(resp, None).await
    }

    /// Fold a token endpoint response into the held token and persist it.
    async fn accept(&self, resp: TokenResponse, previous: Option<UserToken>) -> Result<UserToken> {
        let refresh = match resp.refresh_token {
            Some(r) => r,
            // Provider quirk: refresh responses may omit the refresh token.
            None => previous.as_ref().map(|t| t.refresh.clone()).unwrap_or_default(),
        };
        let token = UserToken {
            access: resp.access_token,
            refresh,
            expires_at: epoch_secs() + resp.expires_in,
            scopes: resp.scope.unwrap_or_else(|| self.settings.scopes.clone()),
            user_id: previous.and_then(|t| t.user_id),
        };
        self.persist(&token).await?;
        *self.token.write().await = Some(token.clone());
        Ok(token)
    }

    async fn persist(&self, token: &UserToken) -> Result<()> {
        if let Some(storage) = &self.storage {
            storage.save_token(TOKEN_NAME, token).await?;
        }
        Ok(())
    }

    /// One validation pass, refreshing once if the held token is rejected.
    async fn ensure_validated(self: &Arc<Self>) -> Result<()> {
        if self.validate_once().await.is_ok() {
            return Ok(());
        }
        self.refresh().await?;
        self.validate_once().await
    }

    async fn validate_once(self: &Arc<Self>) -> Result<()> {
        let token = self.get().await?;
        let resp = flow::validate(&self.http, &self.settings.validate_url(), &token.access).await?;
        let mut guard = self.token.write().await;
        if let Some(held) = guard.as_mut() {
            if held.user_id.as_deref() != Some(resp.user_id.as_str()) {
                held.user_id = Some(resp.user_id.clone());
                let snapshot = held.clone();
                drop(guard);
                self.persist(&snapshot).await?;
            }
        }
        Ok(())
    }

    /// Hourly validation loop. Refreshes on rejection or when the token
    /// expires within the next interval.
    async fn validator_loop(self: Arc<Self>) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            match self.validate_once().await {
                Ok(()) => {
                    let expires_at =
                        self.token.read().await.as_ref().map(|t| t.expires_at).unwrap_or(0);
                    if expires_at <= epoch_secs() + VALIDATE_INTERVAL_SECS {
                        tracing::warn!("token expires within the hour, refreshing early");
                        if let Err(e) = self.refresh().await {
                            tracing::warn!(err = %e, "preemptive refresh failed");
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(err = %e, "token validation failed, refreshing");
                    if let Err(e) = self.refresh().await {
                        tracing::warn!(err = %e, "refresh after failed validation also failed");
                    } else {
                        // Re-validate the fresh token right away.
                        continue;
                    }
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(VALIDATE_INTERVAL_SECS)) => {}
            }
        }
    }

    /// Cancel the validator and the embedded server. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.validator.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        if let Some(server) = self.callback_server.lock().await.take() {
            server.stop().await;
        }
    }
}

pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}
