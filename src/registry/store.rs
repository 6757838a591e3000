//! SQLite-backed persistence for the model catalogue.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

use super::{ModelCapability, ModelConfig};

pub struct ModelCatalogueStore {
    db: Mutex<Connection>,
}

impl ModelCatalogueStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        let db = Connection::open(db_path).context("failed to open model catalogue database")?;

        db.pragma_update(None, "journal_mode", "WAL")?;

        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS model_catalog (
                id TEXT PRIMARY KEY,
                provider TEXT NOT NULL,
                model_name TEXT NOT NULL,
                display_name TEXT NOT NULL,
                context_window INTEGER NOT NULL,
                max_output_tokens INTEGER NOT NULL,
                capabilities TEXT NOT NULL,
                cost_per_1k_input REAL NOT NULL,
                cost_per_1k_output REAL NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT 1,
                priority INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_model_catalog_provider ON model_catalog(provider);
            CREATE INDEX IF NOT EXISTS idx_model_catalog_active ON model_catalog(is_active);
            ",
        )?;

        Ok(Self { db: Mutex::new(db) })
    }

    /// Insert or update a model's catalogue entry.
    pub fn upsert_model(&self, model: &ModelConfig) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let caps = serde_json::to_string(&model.capabilities)?;
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO model_catalog
                (id, provider, model_name, display_name, context_window, max_output_tokens,
                 capabilities, cost_per_1k_input, cost_per_1k_output, is_active, priority,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
             ON CONFLICT(id) DO UPDATE SET
                provider = excluded.provider,
                model_name = excluded.model_name,
                display_name = excluded.display_name,
                context_window = excluded.context_window,
                max_output_tokens = excluded.max_output_tokens,
                capabilities = excluded.capabilities,
                cost_per_1k_input = excluded.cost_per_1k_input,
                cost_per_1k_output = excluded.cost_per_1k_output,
                is_active = excluded.is_active,
                priority = excluded.priority,
                updated_at = excluded.updated_at",
            params![
                model.id,
                model.provider,
                model.model_name,
                model.display_name,
                model.context_window as i64,
                model.max_output_tokens as i64,
                caps,
                model.cost_per_1k_input,
                model.cost_per_1k_output,
                model.is_active,
                model.priority as i64,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn set_active(&self, id: &str, is_active: bool) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let rows = db.execute(
            "UPDATE model_catalog SET is_active = ?1, updated_at = ?2 WHERE id = ?3",
            params![is_active, Utc::now().to_rfc3339(), id],
        )?;
        Ok(rows > 0)
    }

    /// All models, active or not — used to rebuild the registry snapshot.
    pub fn list_all_models(&self) -> Result<Vec<ModelConfig>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, provider, model_name, display_name, context_window, max_output_tokens,
                    capabilities, cost_per_1k_input, cost_per_1k_output, is_active, priority,
                    created_at, updated_at
             FROM model_catalog ORDER BY priority DESC, provider ASC",
        )?;
        let rows = stmt
            .query_map([], Self::row_to_model)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn row_to_model(row: &rusqlite::Row) -> rusqlite::Result<ModelConfig> {
        let caps_json: String = row.get(6)?;
        let capabilities: Vec<ModelCapability> = serde_json::from_str(&caps_json).unwrap_or_default();
        Ok(ModelConfig {
            id: row.get(0)?,
            provider: row.get(1)?,
            model_name: row.get(2)?,
            display_name: row.get(3)?,
            context_window: row.get::<_, i64>(4)? as u32,
            max_output_tokens: row.get::<_, i64>(5)? as u32,
            capabilities,
            cost_per_1k_input: row.get(7)?,
            cost_per_1k_output: row.get(8)?,
            is_active: row.get(9)?,
            priority: row.get::<_, i64>(10)? as i32,
            created_at: row
                .get::<_, String>(11)
                .map(|s| DateTime::parse_from_rfc3339(&s).unwrap_or_default().with_timezone(&Utc))
                .unwrap_or_default(),
            updated_at: row
                .get::<_, String>(12)
                .map(|s| DateTime::parse_from_rfc3339(&s).unwrap_or_default().with_timezone(&Utc))
                .unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str, provider: &str, priority: i32) -> ModelConfig {
        let now = Utc::now();
        ModelConfig {
            id: id.to_string(),
            provider: provider.to_string(),
            model_name: id.to_string(),
            display_name: id.to_string(),
            context_window: 128_000,
            max_output_tokens: 4096,
            capabilities: vec![ModelCapability::Streaming],
            cost_per_1k_input: 0.01,
            cost_per_1k_output: 0.02,
            is_active: true,
            priority,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn upsert_and_list_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelCatalogueStore::open(&dir.path().join("models.db")).unwrap();

        store.upsert_model(&sample("gpt-4o", "openai", 10)).unwrap();
        store.upsert_model(&sample("claude-sonnet", "anthropic", 20)).unwrap();

        let models = store.list_all_models().unwrap();
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].id, "claude-sonnet");

        store.set_active("gpt-4o", false).unwrap();
        let models = store.list_all_models().unwrap();
        assert!(!models.iter().find(|m| m.id == "gpt-4o").unwrap().is_active);
    }
}
