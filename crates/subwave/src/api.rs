// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Authenticated REST helper for the platform API.
//!
//! Every request carries `Client-ID` and a bearer token from the
//! [`TokenManager`]. A 401 triggers one refresh-and-retry; a 429 sleeps until
//! the advertised reset. Retries are bounded, never infinite.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde_json::Value;

use crate::error::{BotError, Result};
use crate::eventsub::ServerSubscription;
use crate::token::{epoch_secs, TokenManager};

/// Bound on refresh/rate-limit retries for a single logical request.
const MAX_ATTEMPTS: u32 = 20;

/// Grace added on top of the `Ratelimit-Reset` header, seconds.
const RATELIMIT_GRACE_SECS: u64 = 3;

/// A 2xx response body.
#[derive(Debug, Clone)]
pub enum ApiBody {
    Json(Value),
    /// Non-JSON body, returned as-is.
    Raw(String),
}

impl ApiBody {
    /// The parsed JSON body, or `Null` for raw responses.
    pub fn into_json(self) -> Value {
        match self {
            ApiBody::Json(v) => v,
            ApiBody::Raw(_) => Value::Null,
        }
    }
}

pub struct HelixClient {
    http: reqwest::Client,
    token: Arc<TokenManager>,
    helix_base_url: String,
}

impl HelixClient {
    pub fn new(token: Arc<TokenManager>, helix_base_url: String) -> Arc<Self> {
        Arc::new(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            token,
            helix_base_url,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.helix_base_url, path)
    }

    /// Issue an authenticated request with the retry policy applied.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        query: &[(&str, &str)],
    ) -> Result<ApiBody> {
        let mut refreshed = false;
        for _attempt in 0..MAX_ATTEMPTS {
            let token = self.token.get().await?;
            let mut req = self
                .http
                .request(method.clone(), url)
                .header("Client-ID", self.token.client_id())
                .header("Authorization", format!("Bearer {}", token.access));
            if !query.is_empty() {
                req = req.query(query);
            }
            if let Some(body) = body {
                req = req.json(body);
            }

            let resp = req.send().await?;
            let status = resp.status();
            tracing::debug!(method = %method, url, status = status.as_u16(), "api request");

            if status.as_u16() == 401 {
                let body = resp.text().await.unwrap_or_default();
                if refreshed {
                    return Err(BotError::AuthFailed(body));
                }
                tracing::error!("token rejected, refreshing");
                self.token.refresh().await?;
                refreshed = true;
                continue;
            }
            if status.as_u16() == 429 {
                let reset: u64 = resp
                    .headers()
                    .get("Ratelimit-Reset")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(epoch_secs);
                let wait = reset.saturating_sub(epoch_secs()) + RATELIMIT_GRACE_SECS;
                tracing::warn!(wait_secs = wait, "rate limited, backing off");
                tokio::time::sleep(Duration::from_secs(wait)).await;
                continue;
            }
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(BotError::Http { status: status.as_u16(), body });
            }

            // GET/POST bodies are JSON on this API; anything else (or a body
            // that fails to parse) is handed back raw.
            let text = resp.text().await.unwrap_or_default();
            if method == Method::GET || method == Method::POST {
                match serde_json::from_str(&text) {
                    Ok(value) => return Ok(ApiBody::Json(value)),
                    Err(_) => {
                        tracing::warn!(url, "response body is not JSON, returning raw");
                        return Ok(ApiBody::Raw(text));
                    }
                }
            }
            return Ok(ApiBody::Raw(text));
        }
        Err(BotError::RateLimited { attempts: MAX_ATTEMPTS })
    }

    /// Create an EventSub subscription bound to `session_id`.
    pub async fn create_sub(
        &self,
        topic: &str,
        version: &str,
        condition: Value,
        session_id: &str,
    ) -> Result<Value> {
        let body = serde_json::json!({
            "type": topic,
            "version": version,
            "condition": condition,
            "transport": { "method": "websocket", "session_id": session_id },
        });
        tracing::debug!(topic, version, "creating subscription");
        let resp = self
            .request(Method::POST, &self.url("/eventsub/subscriptions"), Some(&body), &[])
            .await?;
        Ok(resp.into_json())
    }

    /// Delete a subscription by id.
    pub async fn delete_sub(&self, id: &str) -> Result<()> {
        self.request(
            Method::DELETE,
            &self.url("/eventsub/subscriptions"),
            None,
            &[("id", id)],
        )
        .await?;
        Ok(())
    }

    /// List all subscriptions for this client.
    pub async fn list_subs(&self) -> Result<Vec<ServerSubscription>> {
        let resp = self
            .request(Method::GET, &self.url("/eventsub/subscriptions"), None, &[])
            .await?;
        let data = resp.into_json();
        let subs = data.get("data").cloned().unwrap_or(Value::Array(Vec::new()));
        Ok(serde_json::from_value(subs)?)
    }
}
