// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Embedded web server for the OAuth redirect.
//!
//! Started on demand for the duration of an authorization flow. The embedder
//! may merge its own routes; the server then stays up after the flow instead
//! of being torn down.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{BotError, Result};

/// Page returned to the browser after a successful redirect. Closes the tab.
const CLOSE_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
    <head>
        <script>
            function closeWindow() {
                window.close();
            };
        </script>
    </head>
    <body>
        <button id="closeButton" onclick="closeWindow()">Close Window</button>
        <script>
            document.getElementById("closeButton").click();
        </script>
    </body>
</html>
"#;

/// Per-flow callback state.
struct FlowState {
    expected_state: String,
    /// Consumed by the first valid callback; later duplicates are no-ops.
    code_tx: Mutex<Option<oneshot::Sender<String>>>,
}

/// A running callback server bound to the redirect host/port.
pub struct CallbackServer {
    addr: SocketAddr,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl CallbackServer {
    /// Bind and serve the redirect route, returning the receiver the
    /// authorization code will arrive on.
    pub async fn start(
        host: &str,
        port: u16,
        path: &str,
        expected_state: String,
        user_routes: Option<Router>,
    ) -> Result<(Self, oneshot::Receiver<String>)> {
        let (code_tx, code_rx) = oneshot::channel();
        let flow = Arc::new(FlowState { expected_state, code_tx: Mutex::new(Some(code_tx)) });

        let route_path = if path.is_empty() { "/" } else { path };
        let mut router = Router::new().route(route_path, get(callback)).with_state(flow);
        if let Some(extra) = user_routes {
            router = router.merge(extra);
        }

        let listener = tokio::net::TcpListener::bind((host, port))
            .await
            .map_err(|e| BotError::Config(format!("cannot bind redirect address: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| BotError::Config(format!("redirect address: {e}")))?;

        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown.cancelled_owned());
            if let Err(e) = serve.await {
                tracing::warn!(err = %e, "callback server exited with error");
            }
        });

        tracing::debug!(%addr, "callback server started");
        Ok((Self { addr, cancel, handle }, code_rx))
    }

    /// The address the server actually bound (port 0 resolves here).
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Gracefully stop the server. Idempotent.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
        tracing::debug!("callback server stopped");
    }
}

/// `GET <redirect path>` — receives `code`, `state`, `error` query params.
async fn callback(
    State(flow): State<Arc<FlowState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    // State must match byte-for-byte before anything else is looked at.
    if params.get("state").map(String::as_str) != Some(flow.expected_state.as_str()) {
        tracing::error!(err = %BotError::StateMismatch, "oauth callback rejected");
        return (StatusCode::BAD_REQUEST, "State mismatch. Authorization failed.").into_response();
    }
    if let Some(error) = params.get("error") {
        return (StatusCode::BAD_REQUEST, format!("Authorization failed: {error}"))
            .into_response();
    }
    let Some(code) = params.get("code") else {
        return (StatusCode::BAD_REQUEST, "Authorization failed: no code").into_response();
    };

    // A refreshed redirect page re-delivers the same code; only the first
    // callback resolves the flow.
    let tx = flow.code_tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(tx) = tx {
        let _ = tx.send(code.clone());
    }
    Html(CLOSE_PAGE).into_response()
}

#[cfg(test)]
#[path = "callback_tests.rs"]
mod tests;
