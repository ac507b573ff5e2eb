// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Token lifecycle specs: single-flight refresh, the omitted-refresh-token
//! quirk, validation-driven refresh, and persistence.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use subwave::storage::json::JsonStorage;
use subwave::storage::Storage;
use subwave::token::{AuthSettings, TokenManager, UserToken};
use subwave_specs::{epoch_secs, wait_for, FakePlatform};

fn seed_token(expires_in: u64) -> UserToken {
    UserToken {
        access: "seed-access".to_owned(),
        refresh: "seed-refresh".to_owned(),
        expires_at: epoch_secs() + expires_in,
        scopes: vec!["chat:read".to_owned()],
        user_id: None,
    }
}

fn settings(platform: &FakePlatform) -> AuthSettings {
    AuthSettings {
        client_id: "cid".to_owned(),
        client_secret: "secret".to_owned(),
        redirect_uri: "http://127.0.0.1:53953/callback".to_owned(),
        scopes: vec!["chat:read".to_owned()],
        auth_base_url: platform.base_url(),
    }
}

#[tokio::test]
async fn concurrent_refreshes_collapse_to_one_request() -> anyhow::Result<()> {
    let platform = FakePlatform::start().await?;
    let manager = TokenManager::new(settings(&platform), None);
    manager.start(Some(seed_token(7200))).await?;

    let (a, b, c, d) = tokio::join!(
        manager.refresh(),
        manager.refresh(),
        manager.get(),
        manager.get(),
    );
    let a = a?;
    let b = b?;
    let c = c?;
    let d = d?;

    // Everyone observes the same post-refresh token, never an intermediate.
    assert_eq!(a.access, "access-1");
    assert_eq!(b.access, a.access);
    assert_eq!(c.access, a.access);
    assert_eq!(d.access, a.access);

    let grants = platform.state.token_grants.lock().await.clone();
    assert_eq!(grants, vec!["refresh_token".to_owned()]);

    manager.stop().await;
    Ok(())
}

#[tokio::test]
async fn omitted_refresh_token_preserves_the_previous_one() -> anyhow::Result<()> {
    let platform = FakePlatform::start().await?;
    platform.state.omit_refresh_token.store(true, Ordering::SeqCst);

    let dir = tempfile::tempdir()?;
    let storage: Arc<JsonStorage> = Arc::new(JsonStorage::new(dir.path().to_path_buf())?);
    let manager = TokenManager::new(settings(&platform), Some(storage.clone()));
    manager.start(Some(seed_token(7200))).await?;

    let refreshed = manager.refresh().await?;
    assert_eq!(refreshed.access, "access-1");
    assert_eq!(refreshed.refresh, "seed-refresh");

    // The change was persisted under the fixed name.
    let persisted = storage.load_token("twitch").await?.ok_or_else(|| anyhow::anyhow!("no token"))?;
    assert_eq!(persisted.access, "access-1");
    assert_eq!(persisted.refresh, "seed-refresh");

    manager.stop().await;
    Ok(())
}

#[tokio::test]
async fn rejected_validation_refreshes_before_start_returns() -> anyhow::Result<()> {
    let platform = FakePlatform::start().await?;
    platform.state.validate_unauthorized_once.store(true, Ordering::SeqCst);

    let manager = TokenManager::new(settings(&platform), None);
    manager.start(Some(seed_token(7200))).await?;

    assert_eq!(manager.user_id().await, Some("42".to_owned()));
    let grants = platform.state.token_grants.lock().await.clone();
    assert_eq!(grants, vec!["refresh_token".to_owned()]);

    manager.stop().await;
    Ok(())
}

#[tokio::test]
async fn token_expiring_within_the_hour_is_refreshed_preemptively() -> anyhow::Result<()> {
    let platform = FakePlatform::start().await?;
    let manager = TokenManager::new(settings(&platform), None);
    // Validation succeeds, but the token expires well inside the margin.
    manager.start(Some(seed_token(100))).await?;

    let state = Arc::clone(&platform.state);
    wait_for(
        || {
            state
                .token_grants
                .try_lock()
                .map(|g| g.iter().any(|grant| grant == "refresh_token"))
                .unwrap_or(false)
        },
        Duration::from_secs(5),
    )
    .await?;

    let token = manager.get().await?;
    assert!(token.expires_at > epoch_secs() + 3000);

    manager.stop().await;
    Ok(())
}

#[tokio::test]
async fn start_loads_the_persisted_token() -> anyhow::Result<()> {
    let platform = FakePlatform::start().await?;
    let dir = tempfile::tempdir()?;
    let storage: Arc<JsonStorage> = Arc::new(JsonStorage::new(dir.path().to_path_buf())?);
    storage.save_token("twitch", &seed_token(7200)).await?;

    let manager = TokenManager::new(settings(&platform), Some(storage));
    manager.start(None).await?;

    let token = manager.get().await?;
    assert_eq!(token.access, "seed-access");
    assert_eq!(manager.user_id().await, Some("42".to_owned()));

    manager.stop().await;
    Ok(())
}
