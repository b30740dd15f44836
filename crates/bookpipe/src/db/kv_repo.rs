//! Key-value repository for the `kv_store` table.
//!
//! Values are opaque strings; the JSON helpers cover the common case of
//! storing a serialized document under a fixed key.

use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{Database, DatabaseError};

pub fn get(db: &Database, key: &str) -> Result<Option<String>, DatabaseError> {
    db.with_conn(|conn| {
        let value = conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    })
}

/// Inserts or replaces the value stored under `key`.
pub fn put(db: &Database, key: &str, value: &str) -> Result<(), DatabaseError> {
    let now = chrono::Utc::now().to_rfc3339();
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
            params![key, value, now],
        )?;
        Ok(())
    })
}

/// Removes `key`. Returns true if a value was stored.
pub fn delete(db: &Database, key: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let removed = conn.execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
        Ok(removed > 0)
    })
}

pub fn get_json<T: DeserializeOwned>(db: &Database, key: &str) -> Result<Option<T>, DatabaseError> {
    match get(db, key)? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| DatabaseError::Serialization {
                key: key.to_string(),
                source: e,
            }),
        None => Ok(None),
    }
}

pub fn put_json<T: Serialize + ?Sized>(
    db: &Database,
    key: &str,
    value: &T,
) -> Result<(), DatabaseError> {
    let raw = serde_json::to_string(value).map_err(|e| DatabaseError::Serialization {
        key: key.to_string(),
        source: e,
    })?;
    put(db, key, &raw)
}
