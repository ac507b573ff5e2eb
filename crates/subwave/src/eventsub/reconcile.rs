// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Subscription reconciler.
//!
//! Turns the declarative `topic -> broadcasters` map into server-side
//! subscriptions bound to the current session: keep what is already live,
//! reap everything else, create the full desired set only when nothing
//! usable remains. Rerunning against a populated session is a no-op.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::OnceCell;

use crate::api::HelixClient;
use crate::error::Result;
use crate::storage::Storage;
use crate::token::TokenManager;

/// Storage table caching `topic -> version`.
const VERSIONS_TABLE: &str = "subpub_versions";

/// Documentation page listing every subscription type and its version.
pub const DOCS_URL: &str = "https://dev.twitch.tv/docs/eventsub/eventsub-subscription-types/";

/// Pause between subscription creates, keeping under the server's rate limit.
const CREATE_PACING: Duration = Duration::from_millis(200);

/// Compiled-in topic versions for everything the platform serves above v1.
/// Topics missing here (and from the cache) fall back to version "1".
const KNOWN_VERSIONS: &[(&str, &str)] = &[
    ("automod.message.hold", "2"),
    ("automod.message.update", "2"),
    ("channel.channel_points_automatic_reward_redemption.add", "2"),
    ("channel.follow", "2"),
    ("channel.guest_star_guest.update", "beta"),
    ("channel.guest_star_session.begin", "beta"),
    ("channel.guest_star_session.end", "beta"),
    ("channel.guest_star_settings.update", "beta"),
    ("channel.moderate", "2"),
    ("channel.update", "2"),
];

/// Desired subscriptions: topic to broadcaster ids (`None` = own user id).
pub type DesiredSubscriptions = HashMap<String, Vec<Option<String>>>;

pub struct SubscriptionReconciler {
    api: Arc<HelixClient>,
    token: Arc<TokenManager>,
    storage: Option<Arc<dyn Storage>>,
    desired: DesiredSubscriptions,
    versions_seeded: OnceCell<()>,
    /// When set, the documentation page is scraped once per process to learn
    /// versions instead of relying on the compiled-in table alone.
    docs_url: Option<String>,
    http: reqwest::Client,
}

impl SubscriptionReconciler {
    pub fn new(
        api: Arc<HelixClient>,
        token: Arc<TokenManager>,
        storage: Option<Arc<dyn Storage>>,
        desired: DesiredSubscriptions,
        docs_url: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            api,
            token,
            storage,
            desired,
            versions_seeded: OnceCell::new(),
            docs_url,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        })
    }

    /// Make the server-side subscription set match `desired` for `session_id`.
    pub async fn reconcile(&self, session_id: &str) -> Result<()> {
        let subs = self.api.list_subs().await?;
        let (live, stale): (Vec<_>, Vec<_>) =
            subs.into_iter().partition(|s| s.is_live(session_id));

        // Reap orphans from dead sessions in parallel; a failed delete is
        // retried implicitly on the next reconcile.
        let deletes = stale.iter().map(|sub| {
            let api = Arc::clone(&self.api);
            let id = sub.id.clone();
            let topic = sub.topic.clone();
            async move {
                if let Err(e) = api.delete_sub(&id).await {
                    tracing::warn!(topic = %topic, err = %e, "failed to delete stale subscription");
                }
            }
        });
        futures_util::future::join_all(deletes).await;

        if live.is_empty() {
            let uid = self.token.user_id().await.unwrap_or_default();
            for (topic, broadcasters) in &self.desired {
                let version = self.version_for(topic).await;
                for bid in broadcasters {
                    let condition = build_condition(
                        topic,
                        bid.as_deref(),
                        &uid,
                        self.token.client_id(),
                    );
                    match self.api.create_sub(topic, &version, condition, session_id).await {
                        Ok(_) => tracing::info!(topic = %topic, "subscription created"),
                        Err(e) => {
                            // One bad topic must not block the rest.
                            tracing::warn!(topic = %topic, err = %e, "failed to create subscription");
                        }
                    }
                    tokio::time::sleep(CREATE_PACING).await;
                }
            }
        } else {
            tracing::info!(count = live.len(), "existing subscriptions already bound to session");
        }

        let all = self.api.list_subs().await?;
        let topics: Vec<&str> = all.iter().map(|s| s.topic.as_str()).collect();
        tracing::info!(session_id, subscriptions = ?topics, "reconciliation complete");
        Ok(())
    }

    /// Resolve the version for `topic`: cache table, then compiled-in table,
    /// then "1".
    async fn version_for(&self, topic: &str) -> String {
        self.versions_seeded
            .get_or_init(|| async {
                if let Err(e) = self.seed_versions().await {
                    tracing::warn!(err = %e, "failed to seed subscription versions");
                }
            })
            .await;

        if let Some(storage) = &self.storage {
            let found = storage
                .query(VERSIONS_TABLE, "name = ?", &[Value::String(topic.to_owned())])
                .await;
            if let Ok(rows) = found {
                if let Some(version) = rows
                    .first()
                    .and_then(|row| row.get("version"))
                    .and_then(Value::as_str)
                {
                    return version.to_owned();
                }
            }
        }
        KNOWN_VERSIONS
            .iter()
            .find(|(name, _)| *name == topic)
            .map(|(_, v)| (*v).to_owned())
            .unwrap_or_else(|| "1".to_owned())
    }

    /// Populate the version cache once per process.
    async fn seed_versions(&self) -> Result<()> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let mut entries: Vec<(String, String)> = KNOWN_VERSIONS
            .iter()
            .map(|(n, v)| ((*n).to_owned(), (*v).to_owned()))
            .collect();
        if let Some(url) = &self.docs_url {
            match fetch_topic_versions(&self.http, url).await {
                Ok(scraped) => entries = scraped,
                Err(e) => {
                    tracing::warn!(err = %e, "scraping subscription versions failed, using built-in table");
                }
            }
        }
        for (name, version) in entries {
            let mut record = serde_json::Map::new();
            record.insert("name".to_owned(), Value::String(name));
            record.insert("version".to_owned(), Value::String(version));
            storage.insert(VERSIONS_TABLE, record, true).await?;
        }
        Ok(())
    }
}

/// Build the topic-specific condition.
///
/// `bid` is the explicit broadcaster id, `uid` the authenticated user, and
/// topics not matched below subscribe to `broadcaster_user_id = bid or uid`.
pub fn build_condition(topic: &str, bid: Option<&str>, uid: &str, client_id: &str) -> Value {
    let broadcaster = bid.unwrap_or(uid);
    if topic.starts_with("channel.chat.message")
        || topic.starts_with("channel.chat.clear")
        || topic == "channel.chat.notification"
    {
        serde_json::json!({ "broadcaster_user_id": broadcaster, "user_id": uid })
    } else if topic == "channel.raid" {
        serde_json::json!({ "to_broadcaster_user_id": uid })
    } else if topic == "channel.follow"
        || topic.starts_with("channel.shield_mode.")
        || topic == "channel.suspicious_user.message"
    {
        serde_json::json!({ "broadcaster_user_id": broadcaster, "moderator_user_id": uid })
    } else if topic == "user.update" {
        serde_json::json!({ "user_id": uid })
    } else if topic.starts_with("user.authorization.") {
        serde_json::json!({ "client_id": client_id })
    } else {
        serde_json::json!({ "broadcaster_user_id": broadcaster })
    }
}

/// Scrape `topic -> version` pairs from the subscription-types documentation.
///
/// Brittle by nature; callers fall back to the compiled-in table when the
/// page layout changes.
pub async fn fetch_topic_versions(
    client: &reqwest::Client,
    docs_url: &str,
) -> Result<Vec<(String, String)>> {
    let resp = client.get(docs_url).send().await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(crate::error::BotError::Http {
            status: status.as_u16(),
            body: "failed to fetch subscription types page".to_owned(),
        });
    }
    let html = resp.text().await?;
    Ok(parse_topic_versions(&html))
}

fn parse_topic_versions(html: &str) -> Vec<(String, String)> {
    let section = regex_find(
        html,
        r#"(?s)<h1 id="subscription-types">Subscription Types</h1>.*?<tbody>(.*?)</tbody>"#,
    );
    let Some(tbody) = section else {
        return Vec::new();
    };
    let row_re = match regex::Regex::new(r"(?s)<tr>(.*?)</tr>") {
        Ok(re) => re,
        Err(_) => return Vec::new(),
    };
    let code_re = match regex::Regex::new(r"<code[^>]*>(.*?)</code>") {
        Ok(re) => re,
        Err(_) => return Vec::new(),
    };
    let mut out = Vec::new();
    for row in row_re.captures_iter(&tbody) {
        let codes: Vec<&str> =
            code_re.captures_iter(&row[1]).filter_map(|c| c.get(1)).map(|m| m.as_str()).collect();
        if let [topic, version, ..] = codes[..] {
            // Filter obvious non-topic rows the table mixes in.
            if topic.len() > 4 && version.len() < 5 {
                out.push((topic.to_owned(), version.to_owned()));
            }
        }
    }
    out
}

fn regex_find(html: &str, pattern: &str) -> Option<String> {
    let re = regex::Regex::new(pattern).ok()?;
    re.captures(html).and_then(|c| c.get(1)).map(|m| m.as_str().to_owned())
}

#[cfg(test)]
#[path = "reconcile_tests.rs"]
mod tests;
