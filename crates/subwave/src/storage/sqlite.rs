// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! SQLite storage over `rusqlite`.
//!
//! One connection guarded by a mutex; every call runs on the blocking pool.
//! Archive tables are created lazily from the first inserted row and widened
//! with `ALTER TABLE` when later rows carry new columns.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use serde_json::Value;

use crate::storage::{
    parse_eq_selector, record_key, sanitize_identifier, Record, Storage, StorageError,
};
use crate::token::UserToken;

pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open (or create) the database at `path` and apply the fixed schema.
    pub fn open(path: PathBuf) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             CREATE TABLE IF NOT EXISTS tokens (name TEXT PRIMARY KEY, data TEXT NOT NULL);
             CREATE TABLE IF NOT EXISTS queues (name TEXT PRIMARY KEY, data TEXT NOT NULL);",
        )?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&guard)
        })
        .await?
    }
}

/// SQL column type for a JSON value.
fn column_type(value: &Value) -> &'static str {
    match value {
        Value::Number(n) if n.is_i64() || n.is_u64() => "INTEGER",
        Value::Number(_) => "REAL",
        Value::Bool(_) => "INTEGER",
        _ => "TEXT",
    }
}

/// Bindable SQL value for a JSON value. Compound values are stored as JSON text.
fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql_value(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::from(i),
        SqlValue::Real(r) => serde_json::Number::from_f64(r).map(Value::Number).unwrap_or(Value::Null),
        SqlValue::Text(s) => Value::String(s),
        SqlValue::Blob(_) => Value::Null,
    }
}

/// Existing column names of `table`, empty when the table is missing.
fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>, StorageError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let cols = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(cols)
}

/// Create `table` for `record` if missing, else add any new columns.
fn evolve_schema(
    conn: &Connection,
    table: &str,
    record: &Record,
    key_col: &str,
) -> Result<(), StorageError> {
    let existing = table_columns(conn, table)?;
    if existing.is_empty() {
        let cols: Vec<String> = record
            .iter()
            .map(|(name, value)| {
                let name = sanitize_identifier(name);
                let ty = column_type(value);
                if name == key_col {
                    format!("{name} {ty} PRIMARY KEY")
                } else {
                    format!("{name} {ty}")
                }
            })
            .collect();
        conn.execute(&format!("CREATE TABLE {table} ({})", cols.join(", ")), [])?;
        return Ok(());
    }
    for (name, value) in record {
        let name = sanitize_identifier(name);
        if !existing.contains(&name) {
            conn.execute(
                &format!("ALTER TABLE {table} ADD COLUMN {name} {}", column_type(value)),
                [],
            )?;
        }
    }
    Ok(())
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn save_token(&self, name: &str, token: &UserToken) -> Result<(), StorageError> {
        let name = name.to_owned();
        let data = serde_json::to_string(token)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO tokens (name, data) VALUES (?1, ?2)",
                rusqlite::params![name, data],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_token(&self, name: &str) -> Result<Option<UserToken>, StorageError> {
        let name = name.to_owned();
        let data: Option<String> = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare("SELECT data FROM tokens WHERE name = ?1")?;
                let mut rows = stmt.query(rusqlite::params![name])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get(0)?)),
                    None => Ok(None),
                }
            })
            .await?;
        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn save_queue(&self, name: &str, entries: &[Value]) -> Result<(), StorageError> {
        let name = name.to_owned();
        let data = serde_json::to_string(entries)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO queues (name, data) VALUES (?1, ?2)",
                rusqlite::params![name, data],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_queue(&self, name: &str) -> Result<Vec<Value>, StorageError> {
        let name = name.to_owned();
        let data: Option<String> = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare("SELECT data FROM queues WHERE name = ?1")?;
                let mut rows = stmt.query(rusqlite::params![name])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get(0)?)),
                    None => Ok(None),
                }
            })
            .await?;
        match data {
            Some(data) => Ok(serde_json::from_str(&data)?),
            None => Ok(Vec::new()),
        }
    }

    async fn insert(&self, table: &str, record: Record, upsert: bool) -> Result<(), StorageError> {
        let table = sanitize_identifier(table);
        let (key_col, _) = record_key(&record)?;
        let key_col = sanitize_identifier(&key_col);
        self.with_conn(move |conn| {
            evolve_schema(conn, &table, &record, &key_col)?;
            let cols: Vec<String> =
                record.keys().map(|name| sanitize_identifier(name)).collect();
            let placeholders: Vec<String> =
                (1..=cols.len()).map(|i| format!("?{i}")).collect();
            let verb = if upsert { "INSERT OR REPLACE" } else { "INSERT OR IGNORE" };
            let sql = format!(
                "{verb} INTO {table} ({}) VALUES ({})",
                cols.join(", "),
                placeholders.join(", ")
            );
            let values: Vec<SqlValue> = record.values().map(to_sql_value).collect();
            conn.execute(&sql, rusqlite::params_from_iter(values))?;
            Ok(())
        })
        .await
    }

    async fn query(
        &self,
        table: &str,
        where_clause: &str,
        params: &[Value],
    ) -> Result<Vec<Record>, StorageError> {
        let table = sanitize_identifier(table);
        let col = parse_eq_selector(where_clause)?;
        let bound: Vec<SqlValue> = params.iter().map(to_sql_value).collect();
        self.with_conn(move |conn| {
            if table_columns(conn, &table)?.is_empty() {
                return Ok(Vec::new());
            }
            let mut stmt =
                conn.prepare(&format!("SELECT * FROM {table} WHERE {col} = ?1"))?;
            let names: Vec<String> =
                stmt.column_names().iter().map(|s| (*s).to_owned()).collect();
            let mut rows = stmt.query(rusqlite::params_from_iter(bound))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut record = Record::new();
                for (i, name) in names.iter().enumerate() {
                    record.insert(name.clone(), from_sql_value(row.get::<_, SqlValue>(i)?));
                }
                out.push(record);
            }
            Ok(out)
        })
        .await
    }

    async fn delete(
        &self,
        table: &str,
        where_clause: &str,
        params: &[Value],
    ) -> Result<usize, StorageError> {
        let table = sanitize_identifier(table);
        let col = parse_eq_selector(where_clause)?;
        let bound: Vec<SqlValue> = params.iter().map(to_sql_value).collect();
        self.with_conn(move |conn| {
            if table_columns(conn, &table)?.is_empty() {
                return Ok(0);
            }
            let removed = conn.execute(
                &format!("DELETE FROM {table} WHERE {col} = ?1"),
                rusqlite::params_from_iter(bound),
            )?;
            Ok(removed)
        })
        .await
    }
}

#[cfg(test)]
#[path = "sqlite_tests.rs"]
mod tests;
