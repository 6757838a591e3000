//! Model router — cache probe, chain construction, per-provider breaker and
//! concurrency gating, retry/backoff, and write-through caching around one
//! logical completion request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::adapters::{CompletionRequest, CompletionResult, ProviderAdapter, ProviderError};
use crate::breaker::CircuitBreakerRegistry;
use crate::error::GatewayError;
use crate::fingerprint::{response_cache_key, FingerprintInput};
use crate::kv::KvCache;
use crate::metrics;
use crate::registry::ModelRegistry;

const DEFAULT_CACHE_TTL_SECS: u64 = 300;
const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheOpts {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FallbackOpts {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub models: Vec<String>,
}

/// What the router decided, surfaced to the caller as response headers.
#[derive(Debug, Clone, Serialize)]
pub struct RouterDecision {
    pub provider: String,
    pub provider_model: String,
    pub logical_model: String,
    pub from_cache: bool,
    pub fallback_chain: Vec<String>,
}

/// The outcome of `Router::route`. The streaming variant hands the adapter
/// and request straight back — the router never consumes a stream itself.
pub enum RouteOutcome {
    Completed {
        decision: RouterDecision,
        result: CompletionResult,
    },
    Stream {
        decision: RouterDecision,
        adapter: Arc<dyn ProviderAdapter>,
        request: CompletionRequest,
        permit: OwnedSemaphorePermit,
    },
}

pub struct Router {
    registry: Arc<ModelRegistry>,
    breaker: Arc<CircuitBreakerRegistry>,
    kv: Arc<dyn KvCache>,
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    semaphores: HashMap<String, Arc<Semaphore>>,
}

impl Router {
    pub fn new(
        registry: Arc<ModelRegistry>,
        breaker: Arc<CircuitBreakerRegistry>,
        kv: Arc<dyn KvCache>,
        adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
        semaphore_sizes: HashMap<String, usize>,
    ) -> Self {
        let semaphores = adapters
            .keys()
            .map(|provider| {
                let size = semaphore_sizes.get(provider).copied().unwrap_or(100);
                (provider.clone(), Arc::new(Semaphore::new(size)))
            })
            .collect();
        Self { registry, breaker, kv, adapters, semaphores }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn route(
        &self,
        req: CompletionRequest,
        cache_opts: CacheOpts,
        fallback_opts: FallbackOpts,
        user_id: &str,
        org_id: &str,
        streaming: bool,
    ) -> Result<RouteOutcome, GatewayError> {
        let cache_eligible = cache_opts.enabled && !streaming;
        let cache_key = if cache_eligible {
            Some(response_cache_key(&FingerprintInput {
                model: &req.model,
                messages: &req.messages,
                temperature: req.temperature,
                max_tokens: req.max_tokens,
                user_id,
                org_id,
            }))
        } else {
            None
        };

        if let Some(ref key) = cache_key {
            if let Some(bytes) = self.kv.get(key) {
                if let Ok(result) = serde_json::from_slice::<CompletionResult>(&bytes) {
                    metrics::record_response_cache_outcome(true);
                    return Ok(RouteOutcome::Completed {
                        decision: RouterDecision {
                            provider: result.provider.clone(),
                            provider_model: result.model.clone(),
                            logical_model: req.model.clone(),
                            from_cache: true,
                            fallback_chain: Vec::new(),
                        },
                        result,
                    });
                }
            }
            metrics::record_response_cache_outcome(false);
        }

        let primary = self
            .registry
            .get(&req.model)
            .ok_or_else(|| GatewayError::ModelNotFound(req.model.clone()))?;

        let mut chain = vec![Arc::clone(&primary)];
        if fallback_opts.enabled {
            let candidates = self.registry.fallback_chain(&primary.canonical_name());
            let restricted = if fallback_opts.models.is_empty() {
                candidates
            } else {
                candidates
                    .into_iter()
                    .filter(|m| {
                        fallback_opts.models.iter().any(|name| name == &m.canonical_name() || name == &m.model_name)
                    })
                    .collect()
            };
            chain.extend(restricted);
        }

        let mut last_error: Option<ProviderError> = None;

        for (idx, candidate) in chain.iter().enumerate() {
            let provider = candidate.provider.as_str();

            if !self.breaker.allow_request(provider) {
                metrics::record_circuit_open(provider);
                continue;
            }

            let Some(semaphore) = self.semaphores.get(provider).cloned() else {
                continue;
            };
            let Ok(permit) = semaphore.acquire_owned().await else {
                continue;
            };

            let Some(adapter) = self.adapters.get(provider).cloned() else {
                continue;
            };

            let mut candidate_req = req.clone();
            candidate_req.model = candidate.model_name.clone();

            let rest: Vec<String> = chain[idx + 1..].iter().map(|m| m.canonical_name()).collect();
            let decision = RouterDecision {
                provider: provider.to_string(),
                provider_model: candidate.model_name.clone(),
                logical_model: req.model.clone(),
                from_cache: false,
                fallback_chain: rest,
            };

            if streaming {
                return Ok(RouteOutcome::Stream { decision, adapter, request: candidate_req, permit });
            }

            match complete_with_retry(adapter.as_ref(), &candidate_req).await {
                Ok(result) => {
                    drop(permit);
                    self.breaker.on_success(provider);
                    if let Some(ref key) = cache_key {
                        if let Ok(packed) = serde_json::to_vec(&result) {
                            let ttl = Duration::from_secs(cache_opts.ttl_seconds.unwrap_or(DEFAULT_CACHE_TTL_SECS));
                            self.kv.set(key, packed, Some(ttl));
                        }
                    }
                    return Ok(RouteOutcome::Completed { decision, result });
                }
                Err(e) => {
                    drop(permit);
                    self.breaker.on_failure(provider);
                    let should_fall_back = e.fallback;
                    last_error = Some(e);
                    if !should_fall_back {
                        break;
                    }
                }
            }
        }

        Err(GatewayError::AllProvidersFailed(last_error.unwrap_or_else(|| {
            ProviderError::transport(primary.provider.as_str(), primary.model_name.as_str(), "no candidate in chain was reachable")
        })))
    }
}

/// Same-model retry with exponential backoff on retryable errors, up to
/// `MAX_ATTEMPTS` tries. Records the four adapter observability signals
/// around every attempt.
async fn complete_with_retry(adapter: &dyn ProviderAdapter, req: &CompletionRequest) -> Result<CompletionResult, ProviderError> {
    let mut attempt = 0u32;
    loop {
        let started = Instant::now();
        let outcome = adapter.complete(req).await;
        let elapsed = started.elapsed().as_secs_f64();

        match outcome {
            Ok(result) => {
                metrics::record_adapter_call(adapter.provider_id(), &req.model, "ok", elapsed);
                metrics::record_tokens(adapter.provider_id(), &req.model, "prompt", result.usage.prompt_tokens);
                metrics::record_tokens(adapter.provider_id(), &req.model, "completion", result.usage.completion_tokens);
                metrics::record_cost(adapter.provider_id(), &req.model, adapter.estimate_cost(&req.model, &result.usage));
                return Ok(result);
            }
            Err(e) => {
                metrics::record_adapter_call(adapter.provider_id(), &req.model, "error", elapsed);
                if e.retryable && attempt + 1 < MAX_ATTEMPTS {
                    tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
                    attempt += 1;
                    continue;
                }
                return Err(if e.retryable { e.retries_exhausted() } else { e });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{ChunkStream, Usage};
    use crate::kv::InMemoryKv;
    use crate::registry::store::ModelCatalogueStore;
    use crate::registry::ModelConfig;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyAdapter {
        id: &'static str,
        failures_before_success: AtomicUsize,
    }

    #[async_trait]
    impl ProviderAdapter for FlakyAdapter {
        fn provider_id(&self) -> &str {
            self.id
        }

        async fn complete(&self, req: &CompletionRequest) -> Result<CompletionResult, ProviderError> {
            if self.failures_before_success.load(Ordering::SeqCst) > 0 {
                self.failures_before_success.fetch_sub(1, Ordering::SeqCst);
                return Err(ProviderError::transient(self.id, &req.model, 503, "temporarily unavailable"));
            }
            Ok(CompletionResult {
                provider: self.id.to_string(),
                model: req.model.clone(),
                content: "ok".to_string(),
                usage: Usage::estimate(10, 10),
                finish_reason: Some("stop".to_string()),
                raw: serde_json::json!({}),
            })
        }

        async fn stream(&self, _req: &CompletionRequest) -> Result<ChunkStream, ProviderError> {
            unimplemented!("not exercised in these tests")
        }

        fn estimate_cost(&self, _model: &str, _usage: &Usage) -> f64 {
            0.0
        }
    }

    struct AlwaysFailsAdapter {
        id: &'static str,
    }

    #[async_trait]
    impl ProviderAdapter for AlwaysFailsAdapter {
        fn provider_id(&self) -> &str {
            self.id
        }

        async fn complete(&self, req: &CompletionRequest) -> Result<CompletionResult, ProviderError> {
            Err(ProviderError::client(self.id, &req.model, 400, "bad request"))
        }

        async fn stream(&self, _req: &CompletionRequest) -> Result<ChunkStream, ProviderError> {
            unimplemented!("not exercised in these tests")
        }

        fn estimate_cost(&self, _model: &str, _usage: &Usage) -> f64 {
            0.0
        }
    }

    fn sample_model(provider: &str, name: &str, priority: i32) -> ModelConfig {
        let now = Utc::now();
        ModelConfig {
            id: format!("{provider}-{name}"),
            provider: provider.to_string(),
            model_name: name.to_string(),
            display_name: name.to_string(),
            context_window: 128_000,
            max_output_tokens: 4096,
            capabilities: vec![],
            cost_per_1k_input: 0.0,
            cost_per_1k_output: 0.0,
            is_active: true,
            priority,
            created_at: now,
            updated_at: now,
        }
    }

    fn sample_request(model: &str) -> CompletionRequest {
        CompletionRequest {
            model: model.to_string(),
            messages: vec![crate::adapters::Message { role: "user".to_string(), content: "hi".to_string() }],
            temperature: None,
            max_tokens: None,
            tools: None,
            tool_choice: None,
            request_id: "req-1".to_string(),
            metadata: HashMap::new(),
        }
    }

    async fn build_router(adapters: HashMap<String, Arc<dyn ProviderAdapter>>) -> (Router, Arc<ModelRegistry>) {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelCatalogueStore::open(&dir.path().join("models.db")).unwrap();
        store.upsert_model(&sample_model("openai", "gpt-primary", 20)).unwrap();
        store.upsert_model(&sample_model("openai", "gpt-secondary", 10)).unwrap();

        let kv: Arc<dyn KvCache> = Arc::new(InMemoryKv::new());
        let registry = Arc::new(ModelRegistry::new(store, Arc::clone(&kv)));
        registry.refresh();

        let breaker = Arc::new(CircuitBreakerRegistry::new(5, Duration::from_secs(60)));
        let router = Router::new(Arc::clone(&registry), breaker, kv, adapters, HashMap::new());
        (router, registry)
    }

    #[tokio::test]
    async fn retries_transient_errors_then_succeeds() {
        let adapter: Arc<dyn ProviderAdapter> =
            Arc::new(FlakyAdapter { id: "openai", failures_before_success: AtomicUsize::new(2) });
        let mut adapters: HashMap<String, Arc<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert("openai".to_string(), adapter);
        let (router, _registry) = build_router(adapters).await;

        let outcome = router
            .route(sample_request("gpt-primary"), CacheOpts::default(), FallbackOpts::default(), "u1", "o1", false)
            .await
            .unwrap();

        match outcome {
            RouteOutcome::Completed { result, .. } => assert_eq!(result.content, "ok"),
            RouteOutcome::Stream { .. } => panic!("expected a completed result"),
        }
    }

    #[tokio::test]
    async fn falls_back_to_next_candidate_on_client_error() {
        let primary: Arc<dyn ProviderAdapter> = Arc::new(AlwaysFailsAdapter { id: "openai" });
        let mut adapters: HashMap<String, Arc<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert("openai".to_string(), primary);
        let (router, _registry) = build_router(adapters).await;

        // Both candidates share the same (always-failing) adapter, so the
        // chain is exhausted and AllProvidersFailed surfaces.
        let result = router
            .route(
                sample_request("gpt-primary"),
                CacheOpts::default(),
                FallbackOpts { enabled: true, models: vec![] },
                "u1",
                "o1",
                false,
            )
            .await;
        assert!(matches!(result, Err(GatewayError::AllProvidersFailed(_))));
    }

    #[tokio::test]
    async fn cache_hit_short_circuits_the_chain() {
        let adapter: Arc<dyn ProviderAdapter> = Arc::new(AlwaysFailsAdapter { id: "openai" });
        let mut adapters: HashMap<String, Arc<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert("openai".to_string(), adapter);
        let (router, _registry) = build_router(adapters).await;

        let cache_opts = CacheOpts { enabled: true, ttl_seconds: Some(60) };
        let key = response_cache_key(&FingerprintInput {
            model: "gpt-primary",
            messages: &[crate::adapters::Message { role: "user".to_string(), content: "hi".to_string() }],
            temperature: None,
            max_tokens: None,
            user_id: "u1",
            org_id: "o1",
        });
        let cached = CompletionResult {
            provider: "openai".to_string(),
            model: "gpt-primary".to_string(),
            content: "from cache".to_string(),
            usage: Usage::estimate(1, 1),
            finish_reason: Some("stop".to_string()),
            raw: serde_json::json!({}),
        };
        router.kv.set(&key, serde_json::to_vec(&cached).unwrap(), None);

        let outcome = router
            .route(sample_request("gpt-primary"), cache_opts, FallbackOpts::default(), "u1", "o1", false)
            .await
            .unwrap();
        match outcome {
            RouteOutcome::Completed { decision, result } => {
                assert!(decision.from_cache);
                assert_eq!(result.content, "from cache");
            }
            RouteOutcome::Stream { .. } => panic!("expected a cached completed result"),
        }
    }

    #[tokio::test]
    async fn unknown_model_surfaces_model_not_found() {
        let (router, _registry) = build_router(HashMap::new()).await;
        let result = router
            .route(sample_request("does-not-exist"), CacheOpts::default(), FallbackOpts::default(), "u1", "o1", false)
            .await;
        assert!(matches!(result, Err(GatewayError::ModelNotFound(_))));
    }
}
