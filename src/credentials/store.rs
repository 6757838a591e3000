//! SQLite-backed persistence for `ApiKey` records.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

use super::{ApiKey, ApiKeyPermissions};

pub struct CredentialStore {
    db: Mutex<Connection>,
}

impl CredentialStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        let db = Connection::open(db_path).context("failed to open credential store database")?;

        db.pragma_update(None, "journal_mode", "WAL")?;
        db.pragma_update(None, "foreign_keys", "ON")?;

        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                org_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                lookup_hash TEXT NOT NULL UNIQUE,
                slow_hash TEXT NOT NULL,
                preview TEXT NOT NULL,
                expires_at TEXT,
                last_used_at TEXT,
                is_active BOOLEAN NOT NULL DEFAULT 1,
                can_read BOOLEAN NOT NULL DEFAULT 1,
                can_write BOOLEAN NOT NULL DEFAULT 1,
                can_manage_keys BOOLEAN NOT NULL DEFAULT 0,
                is_admin BOOLEAN NOT NULL DEFAULT 0,
                rate_limit_per_minute INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_api_keys_lookup_hash ON api_keys(lookup_hash);
            CREATE INDEX IF NOT EXISTS idx_api_keys_org ON api_keys(org_id);
            ",
        )?;

        Ok(Self { db: Mutex::new(db) })
    }

    pub fn save(&self, key: &ApiKey) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO api_keys
                (id, org_id, user_id, name, lookup_hash, slow_hash, preview, expires_at,
                 last_used_at, is_active, can_read, can_write, can_manage_keys, is_admin,
                 rate_limit_per_minute)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                key.id,
                key.org_id,
                key.user_id,
                key.name,
                key.lookup_hash,
                key.slow_hash,
                key.preview,
                key.expires_at.map(|t| t.to_rfc3339()),
                key.last_used_at.map(|t| t.to_rfc3339()),
                key.is_active,
                key.permissions.can_read,
                key.permissions.can_write,
                key.permissions.can_manage_keys,
                key.permissions.is_admin,
                key.permissions.rate_limit_per_minute,
            ],
        )?;
        tracing::info!(key_id = %key.id, org_id = %key.org_id, "api key issued");
        Ok(())
    }

    pub fn get_by_hash(&self, lookup_hash: &str) -> Result<Option<ApiKey>> {
        let db = self.db.lock().unwrap();
        let result = db.query_row(
            "SELECT id, org_id, user_id, name, lookup_hash, slow_hash, preview, expires_at,
                    last_used_at, is_active, can_read, can_write, can_manage_keys, is_admin,
                    rate_limit_per_minute
             FROM api_keys WHERE lookup_hash = ?1",
            params![lookup_hash],
            Self::row_to_key,
        );
        match result {
            Ok(key) => Ok(Some(key)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn touch_last_used(&self, id: &str, when: DateTime<Utc>) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE api_keys SET last_used_at = ?1 WHERE id = ?2",
            params![when.to_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn deactivate(&self, id: &str) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let rows = db.execute("UPDATE api_keys SET is_active = 0 WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    pub fn list_for_org(&self, org_id: &str) -> Result<Vec<ApiKey>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, org_id, user_id, name, lookup_hash, slow_hash, preview, expires_at,
                    last_used_at, is_active, can_read, can_write, can_manage_keys, is_admin,
                    rate_limit_per_minute
             FROM api_keys WHERE org_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![org_id], Self::row_to_key)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn row_to_key(row: &rusqlite::Row) -> rusqlite::Result<ApiKey> {
        Ok(ApiKey {
            id: row.get(0)?,
            org_id: row.get(1)?,
            user_id: row.get(2)?,
            name: row.get(3)?,
            lookup_hash: row.get(4)?,
            slow_hash: row.get(5)?,
            preview: row.get(6)?,
            expires_at: row
                .get::<_, Option<String>>(7)?
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            last_used_at: row
                .get::<_, Option<String>>(8)?
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            is_active: row.get(9)?,
            permissions: ApiKeyPermissions {
                can_read: row.get(10)?,
                can_write: row.get(11)?,
                can_manage_keys: row.get(12)?,
                is_admin: row.get(13)?,
                rate_limit_per_minute: row.get::<_, i64>(14)? as u32,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::ApiKeyPermissions;

    #[test]
    fn save_and_lookup_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::open(&dir.path().join("creds.db")).unwrap();

        let key = ApiKey {
            id: "id1".to_string(),
            org_id: "org1".to_string(),
            user_id: "user1".to_string(),
            name: "test".to_string(),
            lookup_hash: "hash1".to_string(),
            slow_hash: "slow1".to_string(),
            preview: "lkg_abcd".to_string(),
            expires_at: None,
            last_used_at: None,
            is_active: true,
            permissions: ApiKeyPermissions::default_for(1200),
        };
        store.save(&key).unwrap();

        let found = store.get_by_hash("hash1").unwrap().expect("key should exist");
        assert_eq!(found.id, "id1");
        assert_eq!(found.org_id, "org1");

        assert!(store.get_by_hash("missing").unwrap().is_none());
    }
}
