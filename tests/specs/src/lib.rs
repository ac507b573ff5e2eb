// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness: an in-process fake of the platform.
//!
//! One axum server provides the OAuth endpoints, the subscription CRUD
//! surface, and an EventSub WebSocket that replays whatever frames a test
//! pushes. Every interaction is recorded, so specs can assert on refresh
//! counts, create payloads, and delete calls.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Form, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

static CRYPTO_INIT: Once = Once::new();

/// Install the ring crypto provider for reqwest/rustls.
/// Safe to call multiple times — only the first call has effect.
pub fn ensure_crypto() {
    CRYPTO_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

pub fn epoch_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// A one-shot failure injected into the subscription list endpoint.
#[derive(Debug, Clone, Copy)]
pub struct InjectedFailure {
    pub status: u16,
    /// Value for the `Ratelimit-Reset` header on 429 responses.
    pub ratelimit_reset: Option<u64>,
}

/// Shared, inspectable state of the fake platform.
pub struct PlatformState {
    /// `grant_type` of every token endpoint hit, in order.
    pub token_grants: Mutex<Vec<String>>,
    /// Omit `refresh_token` from refresh responses (provider quirk).
    pub omit_refresh_token: AtomicBool,
    /// Fail the next `/oauth2/validate` with 401.
    pub validate_unauthorized_once: AtomicBool,
    token_counter: AtomicU32,
    sub_counter: AtomicU32,
    /// Current server-side subscription records.
    pub subs: Mutex<Vec<Value>>,
    /// Bodies of every subscription create, in order.
    pub created: Mutex<Vec<Value>>,
    /// Ids of every subscription delete, in order.
    pub deleted: Mutex<Vec<String>>,
    /// Failures consumed in order by subsequent subscription list calls.
    pub list_failures: Mutex<Vec<InjectedFailure>>,
    frames: broadcast::Sender<String>,
    /// Total WebSocket connections ever accepted.
    pub ws_accepts: AtomicU32,
}

pub struct FakePlatform {
    pub state: Arc<PlatformState>,
    addr: SocketAddr,
    cancel: CancellationToken,
}

impl FakePlatform {
    /// Bind the fake platform on an ephemeral port.
    pub async fn start() -> anyhow::Result<Self> {
        ensure_crypto();
        let (frames, _) = broadcast::channel(64);
        let state = Arc::new(PlatformState {
            token_grants: Mutex::new(Vec::new()),
            omit_refresh_token: AtomicBool::new(false),
            validate_unauthorized_once: AtomicBool::new(false),
            token_counter: AtomicU32::new(0),
            sub_counter: AtomicU32::new(0),
            subs: Mutex::new(Vec::new()),
            created: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            list_failures: Mutex::new(Vec::new()),
            frames,
            ws_accepts: AtomicU32::new(0),
        });

        let router = Router::new()
            .route("/oauth2/token", axum::routing::post(token_endpoint))
            .route("/oauth2/validate", get(validate_endpoint))
            .route(
                "/eventsub/subscriptions",
                get(list_subs).post(create_sub).delete(delete_sub),
            )
            .route("/ws", get(ws_upgrade))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await;
        });

        Ok(Self { state, addr, cancel })
    }

    /// Base URL for both the OAuth and API surfaces.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Push a frame to every connected EventSub socket.
    pub fn send_frame(&self, frame: &Value) {
        let _ = self.state.frames.send(frame.to_string());
    }

    /// Wait until the platform has accepted `n` WebSocket connections total.
    pub async fn wait_ws_accepts(&self, n: u32, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.state.ws_accepts.load(Ordering::SeqCst) < n {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("never reached {n} websocket connections");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for FakePlatform {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Poll until `cond` is true or `timeout` elapses.
pub async fn wait_for<F>(mut cond: F, timeout: Duration) -> anyhow::Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("condition not reached within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

async fn token_endpoint(
    State(state): State<Arc<PlatformState>>,
    Form(form): Form<Vec<(String, String)>>,
) -> Json<Value> {
    let grant = form
        .iter()
        .find(|(k, _)| k == "grant_type")
        .map(|(_, v)| v.clone())
        .unwrap_or_default();
    let is_refresh = grant == "refresh_token";
    state.token_grants.lock().await.push(grant);

    let n = state.token_counter.fetch_add(1, Ordering::SeqCst) + 1;
    let mut body = json!({
        "access_token": format!("access-{n}"),
        "refresh_token": format!("refresh-{n}"),
        "expires_in": 14400,
        "scope": ["chat:read"],
        "token_type": "bearer",
    });
    if is_refresh && state.omit_refresh_token.load(Ordering::SeqCst) {
        if let Some(obj) = body.as_object_mut() {
            obj.remove("refresh_token");
        }
    }
    Json(body)
}

async fn validate_endpoint(State(state): State<Arc<PlatformState>>) -> Response {
    if state.validate_unauthorized_once.swap(false, Ordering::SeqCst) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"status": 401, "message": "invalid access token"})),
        )
            .into_response();
    }
    Json(json!({
        "client_id": "cid",
        "login": "tester",
        "scopes": ["chat:read"],
        "user_id": "42",
        "expires_in": 3600,
    }))
    .into_response()
}

async fn list_subs(State(state): State<Arc<PlatformState>>) -> Response {
    let next_failure = {
        let mut failures = state.list_failures.lock().await;
        if failures.is_empty() { None } else { Some(failures.remove(0)) }
    };
    if let Some(failure) = next_failure {
        let status = StatusCode::from_u16(failure.status).unwrap_or(StatusCode::IM_A_TEAPOT);
        let mut resp = (status, Json(json!({"status": failure.status}))).into_response();
        if let Some(reset) = failure.ratelimit_reset {
            if let Ok(value) = reset.to_string().parse() {
                resp.headers_mut().insert("Ratelimit-Reset", value);
            }
        }
        return resp;
    }
    let subs = state.subs.lock().await.clone();
    Json(json!({"data": subs, "total": subs.len(), "pagination": {}})).into_response()
}

async fn create_sub(State(state): State<Arc<PlatformState>>, Json(body): Json<Value>) -> Response {
    state.created.lock().await.push(body.clone());
    let n = state.sub_counter.fetch_add(1, Ordering::SeqCst) + 1;
    let record = json!({
        "id": format!("sub-{n}"),
        "status": "enabled",
        "type": body["type"],
        "version": body["version"],
        "condition": body["condition"],
        "transport": body["transport"],
        "created_at": "2024-01-01T00:00:00Z",
    });
    state.subs.lock().await.push(record.clone());
    (StatusCode::ACCEPTED, Json(json!({"data": [record]}))).into_response()
}

async fn delete_sub(
    State(state): State<Arc<PlatformState>>,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    let Some(id) = params.iter().find(|(k, _)| k == "id").map(|(_, v)| v.clone()) else {
        return (StatusCode::BAD_REQUEST, "missing id").into_response();
    };
    state.deleted.lock().await.push(id.clone());
    state.subs.lock().await.retain(|sub| sub["id"] != json!(id));
    StatusCode::NO_CONTENT.into_response()
}

async fn ws_upgrade(
    State(state): State<Arc<PlatformState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(mut socket: WebSocket, state: Arc<PlatformState>) {
    let mut rx = state.frames.subscribe();
    state.ws_accepts.fetch_add(1, Ordering::SeqCst);
    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Ok(text) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            },
            msg = socket.recv() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            }
        }
    }
}
