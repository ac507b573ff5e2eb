// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end pipeline specs: welcome, subscription creation, notification
//! dispatch, duplicate suppression, and session reconnect.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use subwave::storage::json::JsonStorage;
use subwave::storage::Storage;
use subwave::{Alert, AlertHandler, AlertRegistry, BotConfig, BotCx, EventBot, UserToken};
use subwave_specs::{epoch_secs, wait_for, FakePlatform};

const TIMEOUT: Duration = Duration::from_secs(10);

struct FollowHandler {
    processed: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl AlertHandler for FollowHandler {
    async fn process(&self, _alert: &Alert, _cx: &BotCx) -> anyhow::Result<()> {
        self.processed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn config_for(platform: &FakePlatform, data_dir: &std::path::Path) -> anyhow::Result<BotConfig> {
    let raw = json!({
        "client_id": "cid",
        "client_secret": "secret",
        "redirect_uri": "http://127.0.0.1:53953/callback",
        "scopes": ["chat:read"],
        "channels": { "channel.follow": null },
        "storage_type": "json",
        "data_dir": data_dir,
        "auth_base_url": platform.base_url(),
        "helix_base_url": platform.base_url(),
        "eventsub_ws_url": platform.ws_url(),
    });
    Ok(serde_json::from_value(raw)?)
}

async fn seed_token(data_dir: &std::path::Path) -> anyhow::Result<()> {
    let storage = JsonStorage::new(data_dir.to_path_buf())?;
    storage
        .save_token(
            "twitch",
            &UserToken {
                access: "seed-access".to_owned(),
                refresh: "seed-refresh".to_owned(),
                expires_at: epoch_secs() + 7200,
                scopes: vec!["chat:read".to_owned()],
                user_id: None,
            },
        )
        .await?;
    Ok(())
}

fn welcome(message_id: &str, session_id: &str) -> serde_json::Value {
    json!({
        "metadata": {
            "message_id": message_id,
            "message_type": "session_welcome",
            "message_timestamp": "2024-01-01T00:00:00Z",
        },
        "payload": { "session": { "id": session_id } },
    })
}

fn follow_notification(message_id: &str) -> serde_json::Value {
    json!({
        "metadata": {
            "message_id": message_id,
            "message_type": "notification",
            "message_timestamp": "2024-01-01T00:00:01Z",
        },
        "payload": {
            "subscription": { "id": "sub-1", "type": "channel.follow", "version": "2" },
            "event": { "user_id": "42", "user_name": "follower" },
        },
    })
}

struct Pipeline {
    platform: FakePlatform,
    bot: Arc<EventBot>,
    processed: Arc<AtomicUsize>,
    _dir: tempfile::TempDir,
}

async fn start_pipeline() -> anyhow::Result<Pipeline> {
    let platform = FakePlatform::start().await?;
    let dir = tempfile::tempdir()?;
    seed_token(dir.path()).await?;

    let processed = Arc::new(AtomicUsize::new(0));
    let mut registry = AlertRegistry::new();
    registry
        .register("channel.follow", Arc::new(FollowHandler { processed: Arc::clone(&processed) }));

    let bot = EventBot::new(config_for(&platform, dir.path())?, registry)?;
    bot.start().await?;
    platform.wait_ws_accepts(1, TIMEOUT).await?;
    Ok(Pipeline { platform, bot, processed, _dir: dir })
}

#[tokio::test]
async fn welcome_then_notification_creates_sub_and_dispatches() -> anyhow::Result<()> {
    let p = start_pipeline().await?;

    p.platform.send_frame(&welcome("w1", "sess-A"));
    wait_for(
        || p.platform.state.created.try_lock().map(|c| c.len() == 1).unwrap_or(false),
        TIMEOUT,
    )
    .await?;

    {
        let created = p.platform.state.created.lock().await;
        assert_eq!(created[0]["type"], json!("channel.follow"));
        assert_eq!(created[0]["version"], json!("2"));
        assert_eq!(
            created[0]["condition"],
            json!({"broadcaster_user_id": "42", "moderator_user_id": "42"})
        );
        assert_eq!(created[0]["transport"]["session_id"], json!("sess-A"));
    }
    assert_eq!(p.bot.session_id().await, Some("sess-A".to_owned()));

    p.platform.send_frame(&follow_notification("n1"));
    let processed = Arc::clone(&p.processed);
    wait_for(|| processed.load(Ordering::SeqCst) == 1, TIMEOUT).await?;

    p.bot.stop().await;
    Ok(())
}

#[tokio::test]
async fn reconciliation_is_idempotent() -> anyhow::Result<()> {
    let p = start_pipeline().await?;

    p.platform.send_frame(&welcome("w1", "sess-A"));
    wait_for(
        || p.platform.state.created.try_lock().map(|c| c.len() == 1).unwrap_or(false),
        TIMEOUT,
    )
    .await?;

    // A second welcome for the same session finds the live subscription and
    // makes zero create calls.
    p.platform.send_frame(&welcome("w1-again", "sess-A"));
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(p.platform.state.created.lock().await.len(), 1);
    assert!(p.platform.state.deleted.lock().await.is_empty());

    p.bot.stop().await;
    Ok(())
}

#[tokio::test]
async fn duplicate_envelope_is_processed_once() -> anyhow::Result<()> {
    let p = start_pipeline().await?;

    p.platform.send_frame(&welcome("w1", "sess-A"));
    p.platform.send_frame(&follow_notification("n1"));
    let processed = Arc::clone(&p.processed);
    wait_for(|| processed.load(Ordering::SeqCst) == 1, TIMEOUT).await?;

    p.platform.send_frame(&follow_notification("n1"));
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(p.processed.load(Ordering::SeqCst), 1);

    p.bot.stop().await;
    Ok(())
}

#[tokio::test]
async fn reconnect_swaps_session_and_preserves_dedup() -> anyhow::Result<()> {
    let p = start_pipeline().await?;

    p.platform.send_frame(&welcome("w1", "sess-A"));
    p.platform.send_frame(&follow_notification("n1"));
    let processed = Arc::clone(&p.processed);
    wait_for(|| processed.load(Ordering::SeqCst) == 1, TIMEOUT).await?;

    p.platform.send_frame(&json!({
        "metadata": {
            "message_id": "r1",
            "message_type": "session_reconnect",
            "message_timestamp": "2024-01-01T00:00:02Z",
        },
        "payload": {
            "session": { "id": "sess-A", "reconnect_url": p.platform.ws_url() },
        },
    }));
    p.platform.wait_ws_accepts(2, TIMEOUT).await?;

    p.platform.send_frame(&welcome("w2", "sess-B"));
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while p.bot.session_id().await.as_deref() != Some("sess-B") {
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "session never swapped");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // New notifications flow; the old envelope stays deduplicated.
    p.platform.send_frame(&follow_notification("n2"));
    wait_for(|| processed.load(Ordering::SeqCst) == 2, TIMEOUT).await?;
    p.platform.send_frame(&follow_notification("n1"));
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(p.processed.load(Ordering::SeqCst), 2);

    p.bot.stop().await;
    Ok(())
}
