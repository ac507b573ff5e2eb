// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Retry-policy specs for the authenticated REST helper.

use std::sync::Arc;
use std::time::{Duration, Instant};

use subwave::api::HelixClient;
use subwave::token::{AuthSettings, TokenManager, UserToken};
use subwave::BotError;
use subwave_specs::{epoch_secs, FakePlatform, InjectedFailure};

fn seed_token() -> UserToken {
    UserToken {
        access: "seed-access".to_owned(),
        refresh: "seed-refresh".to_owned(),
        expires_at: epoch_secs() + 7200,
        scopes: vec!["chat:read".to_owned()],
        user_id: None,
    }
}

async fn client_for(platform: &FakePlatform) -> anyhow::Result<(Arc<TokenManager>, Arc<HelixClient>)> {
    let manager = TokenManager::new(
        AuthSettings {
            client_id: "cid".to_owned(),
            client_secret: "secret".to_owned(),
            redirect_uri: "http://127.0.0.1:53953/callback".to_owned(),
            scopes: vec!["chat:read".to_owned()],
            auth_base_url: platform.base_url(),
        },
        None,
    );
    manager.start(Some(seed_token())).await?;
    let client = HelixClient::new(Arc::clone(&manager), platform.base_url());
    Ok((manager, client))
}

#[tokio::test]
async fn unauthorized_triggers_one_refresh_then_retry() -> anyhow::Result<()> {
    let platform = FakePlatform::start().await?;
    let (manager, client) = client_for(&platform).await?;

    platform
        .state
        .list_failures
        .lock()
        .await
        .push(InjectedFailure { status: 401, ratelimit_reset: None });

    let subs = client.list_subs().await?;
    assert!(subs.is_empty());

    let grants = platform.state.token_grants.lock().await.clone();
    assert_eq!(grants, vec!["refresh_token".to_owned()]);

    manager.stop().await;
    Ok(())
}

#[tokio::test]
async fn second_consecutive_unauthorized_surfaces_auth_failure() -> anyhow::Result<()> {
    let platform = FakePlatform::start().await?;
    let (manager, client) = client_for(&platform).await?;

    {
        let mut failures = platform.state.list_failures.lock().await;
        failures.push(InjectedFailure { status: 401, ratelimit_reset: None });
        failures.push(InjectedFailure { status: 401, ratelimit_reset: None });
    }

    match client.list_subs().await {
        Err(BotError::AuthFailed(_)) => {}
        other => panic!("expected AuthFailed, got {other:?}"),
    }
    // The refresh between the two 401s still happened exactly once.
    assert_eq!(platform.state.token_grants.lock().await.len(), 1);

    manager.stop().await;
    Ok(())
}

#[tokio::test]
async fn rate_limit_sleeps_until_reset_then_retries() -> anyhow::Result<()> {
    let platform = FakePlatform::start().await?;
    let (manager, client) = client_for(&platform).await?;

    platform.state.list_failures.lock().await.push(InjectedFailure {
        status: 429,
        ratelimit_reset: Some(epoch_secs() + 2),
    });

    let started = Instant::now();
    let subs = client.list_subs().await?;
    let elapsed = started.elapsed();

    assert!(subs.is_empty());
    // Reset was 2s out plus the fixed 3s grace.
    assert!(elapsed >= Duration::from_secs(4), "slept only {elapsed:?}");
    // No refresh involved in rate-limit handling.
    assert!(platform.state.token_grants.lock().await.is_empty());

    manager.stop().await;
    Ok(())
}

#[tokio::test]
async fn other_http_errors_surface_status_and_body() -> anyhow::Result<()> {
    let platform = FakePlatform::start().await?;
    let (manager, client) = client_for(&platform).await?;

    platform
        .state
        .list_failures
        .lock()
        .await
        .push(InjectedFailure { status: 500, ratelimit_reset: None });

    match client.list_subs().await {
        Err(BotError::Http { status: 500, body }) => assert!(body.contains("500")),
        other => panic!("expected Http error, got {other:?}"),
    }

    manager.stop().await;
    Ok(())
}
