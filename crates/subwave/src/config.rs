// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bot configuration record.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BotError, Result};
use crate::eventsub::reconcile::DesiredSubscriptions;
use crate::storage::StorageKind;

/// The one configuration record the core recognizes.
///
/// Unknown keys are rejected, not silently accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BotConfig {
    pub client_id: String,
    pub client_secret: String,
    /// OAuth redirect; host, port, and path drive the embedded callback server.
    pub redirect_uri: String,

    #[serde(default)]
    pub scopes: Vec<String>,

    /// Desired event topics: `topic -> [broadcaster-id | null, ...]`, or
    /// `topic -> null` as shorthand for one subscription conditioned on self.
    #[serde(default)]
    pub channels: HashMap<String, Option<Vec<Option<String>>>>,

    /// Topics that bypass the queue. Legacy spelling of per-handler
    /// `queue_skip`; the union of both applies.
    #[serde(default)]
    pub queue_skip: HashSet<String>,

    #[serde(default = "default_max_reconnect")]
    pub max_reconnect: u32,

    #[serde(default = "default_storage_type")]
    pub storage_type: StorageKind,

    /// Directory for the reference storage backends.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Scrape the documentation page for topic versions once per process
    /// instead of relying on the compiled-in table.
    #[serde(default)]
    pub fetch_versions: bool,

    /// Seen-ids dedup window. Values below the platform duplicate window of
    /// 15 are raised to it.
    #[serde(default = "default_seen_cache_size")]
    pub seen_cache_size: usize,

    // Endpoint overrides, used by tests to point at a local platform.
    #[serde(default = "default_auth_base_url")]
    pub auth_base_url: String,
    #[serde(default = "default_helix_base_url")]
    pub helix_base_url: String,
    #[serde(default = "default_eventsub_ws_url")]
    pub eventsub_ws_url: String,
}

fn default_max_reconnect() -> u32 {
    20
}

fn default_storage_type() -> StorageKind {
    StorageKind::Json
}

fn default_seen_cache_size() -> usize {
    15
}

fn default_auth_base_url() -> String {
    "https://id.twitch.tv".to_owned()
}

fn default_helix_base_url() -> String {
    "https://api.twitch.tv/helix".to_owned()
}

fn default_eventsub_ws_url() -> String {
    crate::eventsub::EVENTSUB_WS_URL.to_owned()
}

impl BotConfig {
    /// Load and validate a configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| BotError::Config(format!("{}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| BotError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() || self.client_secret.is_empty() {
            return Err(BotError::Config("client_id and client_secret are required".to_owned()));
        }
        reqwest::Url::parse(&self.redirect_uri)
            .map_err(|e| BotError::Config(format!("redirect_uri: {e}")))?;
        Ok(())
    }

    /// Expand the `channels` map into the reconciler's desired set.
    pub fn desired_subscriptions(&self) -> DesiredSubscriptions {
        self.channels
            .iter()
            .map(|(topic, broadcasters)| {
                let list = broadcasters.clone().unwrap_or_else(|| vec![None]);
                (topic.clone(), list)
            })
            .collect()
    }

    /// Data directory, defaulting next to the working directory.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| PathBuf::from("subwave-data"))
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
