// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! File-backed storage: one JSON file per namespace with atomic writes.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::storage::{
    parse_eq_selector, record_key, sanitize_identifier, Record, Storage, StorageError,
};
use crate::token::UserToken;

/// JSON-file backend. Every write goes tmp-then-rename under one lock, so a
/// crash mid-write never leaves a torn file behind.
pub struct JsonStorage {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl JsonStorage {
    /// Create the backend rooted at `dir`, creating the directory if needed.
    pub fn new(dir: PathBuf) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, lock: Mutex::new(()) })
    }

    fn token_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("token_{}.json", sanitize_identifier(name)))
    }

    fn queue_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("queue_{}.json", sanitize_identifier(name)))
    }

    fn table_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("table_{}.json", sanitize_identifier(table)))
    }

    fn load_table(&self, table: &str) -> Result<serde_json::Map<String, Value>, StorageError> {
        match std::fs::read_to_string(self.table_path(table)) {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(serde_json::Map::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save_table(
        &self,
        table: &str,
        rows: &serde_json::Map<String, Value>,
    ) -> Result<(), StorageError> {
        write_atomic(&self.table_path(table), &serde_json::to_string_pretty(rows)?)
    }
}

/// Write `contents` to `path` via tmp file + rename.
fn write_atomic(path: &Path, contents: &str) -> Result<(), StorageError> {
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, contents)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Stringify a key value the same way for insert and query.
fn key_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl Storage for JsonStorage {
    async fn save_token(&self, name: &str, token: &UserToken) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        write_atomic(&self.token_path(name), &serde_json::to_string_pretty(token)?)
    }

    async fn load_token(&self, name: &str) -> Result<Option<UserToken>, StorageError> {
        let _guard = self.lock.lock().await;
        match std::fs::read_to_string(self.token_path(name)) {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_queue(&self, name: &str, entries: &[Value]) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        write_atomic(&self.queue_path(name), &serde_json::to_string_pretty(entries)?)
    }

    async fn load_queue(&self, name: &str) -> Result<Vec<Value>, StorageError> {
        let _guard = self.lock.lock().await;
        match std::fs::read_to_string(self.queue_path(name)) {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn insert(&self, table: &str, record: Record, upsert: bool) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let (_, key_value) = record_key(&record)?;
        let key = key_string(&key_value);
        let mut rows = self.load_table(table)?;
        if !upsert && rows.contains_key(&key) {
            return Ok(());
        }
        rows.insert(key, Value::Object(record));
        self.save_table(table, &rows)
    }

    async fn query(
        &self,
        table: &str,
        where_clause: &str,
        params: &[Value],
    ) -> Result<Vec<Record>, StorageError> {
        let _guard = self.lock.lock().await;
        let col = parse_eq_selector(where_clause)?;
        let wanted = params.first().ok_or_else(|| {
            StorageError::Selector(format!("{where_clause} (missing parameter)"))
        })?;
        let rows = self.load_table(table)?;
        Ok(rows
            .values()
            .filter_map(|row| row.as_object())
            .filter(|row| row.get(&col) == Some(wanted))
            .cloned()
            .collect())
    }

    async fn delete(
        &self,
        table: &str,
        where_clause: &str,
        params: &[Value],
    ) -> Result<usize, StorageError> {
        let _guard = self.lock.lock().await;
        let col = parse_eq_selector(where_clause)?;
        let wanted = params.first().ok_or_else(|| {
            StorageError::Selector(format!("{where_clause} (missing parameter)"))
        })?;
        let rows = self.load_table(table)?;
        let before = rows.len();
        let kept: serde_json::Map<String, Value> = rows
            .into_iter()
            .filter(|(_, row)| {
                row.as_object().map(|r| r.get(&col) != Some(wanted)).unwrap_or(true)
            })
            .collect();
        let removed = before - kept.len();
        if removed > 0 {
            self.save_table(table, &kept)?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
#[path = "json_tests.rs"]
mod tests;
