//! Model registry — a refreshable catalogue snapshot with alias and
//! capability indices, backed by a local atomic-swap snapshot and mirrored
//! into the shared KV cache for other readers.

pub mod store;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::kv::{KvCache, PipelineOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelCapability {
    Streaming,
    Tools,
    Vision,
    JsonMode,
    LongContext,
}

impl ModelCapability {
    fn as_str(&self) -> &'static str {
        match self {
            ModelCapability::Streaming => "streaming",
            ModelCapability::Tools => "tools",
            ModelCapability::Vision => "vision",
            ModelCapability::JsonMode => "json_mode",
            ModelCapability::LongContext => "long_context",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub provider: String,
    pub model_name: String,
    pub display_name: String,
    pub context_window: u32,
    pub max_output_tokens: u32,
    pub capabilities: Vec<ModelCapability>,
    pub cost_per_1k_input: f64,
    pub cost_per_1k_output: f64,
    pub is_active: bool,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ModelConfig {
    pub fn canonical_name(&self) -> String {
        format!("{}:{}", self.provider, self.model_name)
    }
}

/// An immutable point-in-time view of the catalogue. Readers hold an `Arc`
/// clone; a refresh swaps the registry's pointer, never mutates in place.
#[derive(Default)]
struct Snapshot {
    by_canonical: HashMap<String, Arc<ModelConfig>>,
    aliases: HashMap<String, String>,
    by_capability: HashMap<ModelCapability, Vec<String>>,
}

pub struct ModelRegistry {
    store: store::ModelCatalogueStore,
    kv: Arc<dyn KvCache>,
    snapshot: std::sync::Mutex<Arc<Snapshot>>,
}

impl ModelRegistry {
    pub fn new(store: store::ModelCatalogueStore, kv: Arc<dyn KvCache>) -> Self {
        Self {
            store,
            kv,
            snapshot: std::sync::Mutex::new(Arc::new(Snapshot::default())),
        }
    }

    /// Spawn the background refresh task: one immediate synchronous
    /// refresh, then a periodic refresh every `interval`.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        self.refresh();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; already refreshed above
            loop {
                ticker.tick().await;
                this.refresh();
            }
        });
    }

    /// Rebuild the snapshot from the catalogue store. On error or an empty
    /// result, the prior snapshot is retained.
    pub fn refresh(&self) {
        let models = match self.store.list_all_models() {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "model registry refresh failed, keeping prior snapshot");
                return;
            }
        };

        let active: Vec<ModelConfig> = models.into_iter().filter(|m| m.is_active).collect();
        if active.is_empty() {
            metrics::counter!("lkg_registry_empty_refresh_total").increment(1);
            tracing::warn!("model registry refresh returned zero active models, keeping prior snapshot");
            return;
        }

        let mut by_canonical = HashMap::new();
        let mut aliases = HashMap::new();
        let mut by_capability: HashMap<ModelCapability, Vec<String>> = HashMap::new();

        for model in active {
            let canonical = model.canonical_name();
            aliases.entry(model.model_name.clone()).or_insert_with(|| canonical.clone());
            aliases.entry(model.display_name.clone()).or_insert_with(|| canonical.clone());
            for cap in &model.capabilities {
                by_capability.entry(*cap).or_default().push(canonical.clone());
            }
            by_canonical.insert(canonical, Arc::new(model));
        }

        let snapshot = Snapshot { by_canonical, aliases, by_capability };
        self.mirror_to_kv(&snapshot);
        *self.snapshot.lock().unwrap() = Arc::new(snapshot);
    }

    fn mirror_to_kv(&self, snapshot: &Snapshot) {
        let mut ops = vec![
            PipelineOp::HClear { key: "lkg:models:active".to_string() },
            PipelineOp::HClear { key: "lkg:models:aliases".to_string() },
        ];
        for cap in [
            ModelCapability::Streaming,
            ModelCapability::Tools,
            ModelCapability::Vision,
            ModelCapability::JsonMode,
            ModelCapability::LongContext,
        ] {
            ops.push(PipelineOp::SClear { key: format!("lkg:models:capability:{}", cap.as_str()) });
        }
        for (canonical, model) in &snapshot.by_canonical {
            if let Ok(packed) = serde_json::to_vec(model.as_ref()) {
                ops.push(PipelineOp::HSet {
                    key: "lkg:models:active".to_string(),
                    field: canonical.clone(),
                    value: packed,
                });
            }
        }
        for (alias, canonical) in &snapshot.aliases {
            ops.push(PipelineOp::HSet {
                key: "lkg:models:aliases".to_string(),
                field: alias.clone(),
                value: canonical.clone().into_bytes(),
            });
        }
        for (cap, members) in &snapshot.by_capability {
            for member in members {
                ops.push(PipelineOp::SAdd {
                    key: format!("lkg:models:capability:{}", cap.as_str()),
                    member: member.clone(),
                });
            }
        }
        self.kv.pipeline(ops);
    }

    /// Resolve a bare model name, display name, or `provider:model_name`.
    pub fn get(&self, identifier: &str) -> Option<Arc<ModelConfig>> {
        let snapshot = self.snapshot.lock().unwrap().clone();
        if let Some(model) = snapshot.by_canonical.get(identifier) {
            return Some(Arc::clone(model));
        }
        let canonical = snapshot.aliases.get(identifier)?;
        snapshot.by_canonical.get(canonical).cloned()
    }

    /// List active models, optionally filtered, sorted by priority desc
    /// then provider asc.
    pub fn list(&self, provider: Option<&str>, capability: Option<ModelCapability>) -> Vec<Arc<ModelConfig>> {
        let snapshot = self.snapshot.lock().unwrap().clone();
        let mut models: Vec<Arc<ModelConfig>> = if let Some(cap) = capability {
            snapshot
                .by_capability
                .get(&cap)
                .map(|names| names.iter().filter_map(|n| snapshot.by_canonical.get(n).cloned()).collect())
                .unwrap_or_default()
        } else {
            snapshot.by_canonical.values().cloned().collect()
        };
        if let Some(provider) = provider {
            models.retain(|m| m.provider == provider);
        }
        models.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.provider.cmp(&b.provider)));
        models
    }

    /// Active models of the same provider as the failed identifier,
    /// excluding it, ordered by priority descending.
    pub fn fallback_chain(&self, failed_identifier: &str) -> Vec<Arc<ModelConfig>> {
        let Some(failed) = self.get(failed_identifier) else {
            return Vec::new();
        };
        self.list(Some(&failed.provider), None)
            .into_iter()
            .filter(|m| m.canonical_name() != failed.canonical_name())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;

    fn model(provider: &str, name: &str, priority: i32, caps: Vec<ModelCapability>) -> ModelConfig {
        let now = Utc::now();
        ModelConfig {
            id: format!("{provider}-{name}"),
            provider: provider.to_string(),
            model_name: name.to_string(),
            display_name: name.to_string(),
            context_window: 128_000,
            max_output_tokens: 4096,
            capabilities: caps,
            cost_per_1k_input: 0.01,
            cost_per_1k_output: 0.02,
            is_active: true,
            priority,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn refresh_then_get_and_fallback_chain() {
        let dir = tempfile::tempdir().unwrap();
        let store = store::ModelCatalogueStore::open(&dir.path().join("models.db")).unwrap();
        store.upsert_model(&model("openai", "gpt-4o", 20, vec![ModelCapability::Streaming])).unwrap();
        store.upsert_model(&model("openai", "gpt-4o-mini", 10, vec![ModelCapability::Streaming])).unwrap();
        store.upsert_model(&model("anthropic", "claude-sonnet", 15, vec![ModelCapability::Tools])).unwrap();

        let kv = Arc::new(InMemoryKv::new());
        let registry = ModelRegistry::new(store, kv);
        registry.refresh();

        let resolved = registry.get("openai:gpt-4o").expect("should resolve canonical name");
        assert_eq!(resolved.model_name, "gpt-4o");

        let by_alias = registry.get("gpt-4o-mini").expect("should resolve bare alias");
        assert_eq!(by_alias.provider, "openai");

        let chain = registry.fallback_chain("openai:gpt-4o");
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].model_name, "gpt-4o-mini");

        let tool_models = registry.list(None, Some(ModelCapability::Tools));
        assert_eq!(tool_models.len(), 1);
        assert_eq!(tool_models[0].provider, "anthropic");
    }

    #[test]
    fn empty_refresh_retains_prior_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = store::ModelCatalogueStore::open(&dir.path().join("models.db")).unwrap();
        store.upsert_model(&model("openai", "gpt-4o", 20, vec![])).unwrap();

        let kv = Arc::new(InMemoryKv::new());
        let registry = ModelRegistry::new(store, kv);
        registry.refresh();
        assert!(registry.get("gpt-4o").is_some());

        registry.store.set_active("openai-gpt-4o", false).unwrap();
        registry.refresh();
        assert!(registry.get("gpt-4o").is_some(), "prior snapshot should survive an empty refresh");
    }
}
