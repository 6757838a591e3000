//! LLM Gateway — authenticated, rate-limited routing proxy over multiple
//! model providers.
//!
//! Boot order: config → tracing/metrics → stores → registry + breaker +
//! adapters → router → auth gate → axum app → serve.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod adapters;
mod auth;
mod breaker;
mod config;
mod credentials;
mod error;
mod fingerprint;
mod http;
mod kv;
mod metrics;
mod registry;
mod router;

use adapters::{AdapterTimeouts, ProviderAdapter};
use auth::AuthGate;
use breaker::CircuitBreakerRegistry;
use config::{GatewayConfig, LogFormat};
use credentials::store::CredentialStore;
use credentials::ApiKeyService;
use kv::{InMemoryKv, KvCache};
use metrics::MetricsExporter;
use registry::store::ModelCatalogueStore;
use registry::ModelRegistry;
use router::Router as GatewayRouter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = GatewayConfig::from_env().context("failed to load configuration")?;
    init_tracing(&config);

    let metrics_exporter = MetricsExporter::install().context("failed to install metrics recorder")?;

    let credential_store =
        CredentialStore::open(std::path::Path::new(&config.database_url)).context("failed to open credential store")?;
    let catalogue_path = derive_catalogue_path(&config.database_url);
    let catalogue_store = Arc::new(
        ModelCatalogueStore::open(&catalogue_path).context("failed to open model catalogue store")?,
    );

    let kv: Arc<dyn KvCache> = Arc::new(InMemoryKv::new());

    let registry = Arc::new(ModelRegistry::new(
        // The registry owns a second handle to the same database file; the
        // Arc alongside it is what the admin HTTP surface mutates through.
        ModelCatalogueStore::open(&catalogue_path).context("failed to re-open model catalogue store for registry")?,
        Arc::clone(&kv),
    ));
    registry.start(config.model_registry_refresh_interval);

    let breaker = Arc::new(CircuitBreakerRegistry::new(5, std::time::Duration::from_secs(60)));

    let timeouts = AdapterTimeouts { connect: config.http_connect_timeout, read: config.http_read_timeout };
    let provider_adapters = build_adapters(&config, &timeouts);
    let semaphore_sizes: HashMap<String, usize> = [
        ("openai".to_string(), config.openai.max_concurrent),
        ("anthropic".to_string(), config.anthropic.max_concurrent),
        ("google".to_string(), config.gemini.max_concurrent),
    ]
    .into_iter()
    .collect();

    let gateway_router = Arc::new(GatewayRouter::new(
        Arc::clone(&registry),
        Arc::clone(&breaker),
        Arc::clone(&kv),
        provider_adapters,
        semaphore_sizes,
    ));

    let credentials = Arc::new(ApiKeyService::new(
        credential_store,
        config.api_key_prefix.clone(),
        config.api_key_bcrypt_rounds,
    ));
    let auth_gate = Arc::new(AuthGate::new(
        Arc::clone(&credentials),
        Arc::clone(&kv),
        config.rate_limit_key_mode,
        config.rate_limit_requests_per_minute,
    ));

    let state = http::AppState {
        router: gateway_router,
        auth: auth_gate,
        metrics: metrics_exporter,
        registry,
        catalogue: catalogue_store,
    };

    let cors = if config.allowed_origins.iter().any(|o| o == "*") {
        CorsLayer::new().allow_origin(Any)
    } else {
        let origins: Vec<_> = config.allowed_origins.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new().allow_origin(origins)
    };

    let app = http::build_router(state).layer(cors).layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await.context("failed to bind listener")?;
    info!(%addr, environment = %config.environment, "LLM gateway listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("server exited with an error")?;

    Ok(())
}

fn init_tracing(config: &GatewayConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "llm_gateway=info".into());
    let registry = tracing_subscriber::registry().with(env_filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// The credential store and the model catalogue store are separate SQLite
/// files so an admin rebuilding one never touches the other.
fn derive_catalogue_path(database_url: &str) -> std::path::PathBuf {
    let path = std::path::Path::new(database_url);
    match (path.parent(), path.file_stem(), path.extension()) {
        (Some(parent), Some(stem), Some(ext)) => {
            parent.join(format!("{}-models.{}", stem.to_string_lossy(), ext.to_string_lossy()))
        }
        _ => std::path::PathBuf::from("./gateway-models.db"),
    }
}

fn build_adapters(config: &GatewayConfig, timeouts: &AdapterTimeouts) -> HashMap<String, Arc<dyn ProviderAdapter>> {
    let mut adapters: HashMap<String, Arc<dyn ProviderAdapter>> = HashMap::new();

    if !config.openai.api_key.is_empty() {
        adapters.insert(
            "openai".to_string(),
            Arc::new(adapters::openai::OpenAIAdapter::new(
                config.openai.api_key.clone(),
                config.openai.base_url.clone(),
                timeouts,
            )),
        );
    }
    if !config.anthropic.api_key.is_empty() {
        adapters.insert(
            "anthropic".to_string(),
            Arc::new(adapters::anthropic::AnthropicAdapter::new(
                config.anthropic.api_key.clone(),
                config.anthropic.base_url.clone(),
                timeouts,
            )),
        );
    }
    if !config.gemini.api_key.is_empty() {
        adapters.insert(
            "google".to_string(),
            Arc::new(adapters::google::GoogleAdapter::new(config.gemini.api_key.clone(), timeouts)),
        );
    }

    if let Ok(groq_key) = std::env::var("LKG_GROQ_API_KEY") {
        if !groq_key.is_empty() {
            adapters.insert("groq".to_string(), Arc::new(adapters::groq::GroqAdapter::new(groq_key, timeouts)));
        }
    }
    if let Ok(deepseek_key) = std::env::var("LKG_DEEPSEEK_API_KEY") {
        if !deepseek_key.is_empty() {
            adapters.insert(
                "deepseek".to_string(),
                Arc::new(adapters::deepseek::DeepSeekAdapter::new(deepseek_key, timeouts)),
            );
        }
    }

    adapters
}
