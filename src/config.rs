//! Gateway configuration — environment-sourced settings, prefix `LKG_`.

use std::time::Duration;

/// Per-provider settings: API key, optional base URL override, and the
/// concurrency semaphore size.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_key: String,
    pub base_url: Option<String>,
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitKeyMode {
    KeyAndIp,
    KeyOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

pub struct GatewayConfig {
    pub environment: String,
    pub database_url: String,
    pub redis_url: String,
    pub api_key_prefix: String,
    pub api_key_bcrypt_rounds: u32,
    pub rate_limit_requests_per_minute: u32,
    pub rate_limit_key_mode: RateLimitKeyMode,
    pub http_connect_timeout: Duration,
    pub http_read_timeout: Duration,
    pub openai: ProviderConfig,
    pub anthropic: ProviderConfig,
    pub gemini: ProviderConfig,
    pub model_registry_refresh_interval: Duration,
    pub allowed_origins: Vec<String>,
    pub allowed_regions: Vec<String>,
    pub port: u16,
    pub log_format: LogFormat,
}

impl GatewayConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let environment = env_or("LKG_ENVIRONMENT", "dev");
        let is_prod = environment == "prod";

        let redis_url = env_or("LKG_REDIS_URL", "memory://");
        if redis_url != "memory://" {
            anyhow::bail!(
                "LKG_REDIS_URL must be 'memory://' — this build only ships the in-process KV cache (got '{}')",
                redis_url
            );
        }

        Ok(Self {
            database_url: env_or("LKG_DATABASE_URL", "./gateway.db"),
            redis_url,
            api_key_prefix: env_or("LKG_API_KEY_PREFIX", "lkg_"),
            api_key_bcrypt_rounds: env_parse("LKG_API_KEY_BCRYPT_ROUNDS", 12)?,
            rate_limit_requests_per_minute: env_parse("LKG_RATE_LIMIT_REQUESTS_PER_MINUTE", 1200)?,
            rate_limit_key_mode: match env_or("LKG_RATE_LIMIT_KEY_MODE", "key_and_ip").as_str() {
                "key_only" => RateLimitKeyMode::KeyOnly,
                _ => RateLimitKeyMode::KeyAndIp,
            },
            http_connect_timeout: Duration::from_secs_f64(env_parse("LKG_HTTP_CONNECT_TIMEOUT_S", 5.0)?),
            http_read_timeout: Duration::from_secs_f64(env_parse("LKG_HTTP_READ_TIMEOUT_S", 30.0)?),
            openai: provider_config("OPENAI")?,
            anthropic: provider_config("ANTHROPIC")?,
            gemini: provider_config("GEMINI")?,
            model_registry_refresh_interval: Duration::from_secs(env_parse("LKG_MODEL_REGISTRY_REFRESH_INTERVAL_S", 60)?),
            allowed_origins: env_list("LKG_ALLOWED_ORIGINS", &["*"]),
            allowed_regions: env_list("LKG_ALLOWED_REGIONS", &[]),
            port: env_parse("LKG_PORT", 8080)?,
            log_format: match env_or("LKG_LOG_FORMAT", if is_prod { "json" } else { "pretty" }).as_str() {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
            environment,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|e| anyhow::anyhow!("invalid value for {key}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(raw) => raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect(),
        Err(_) => default.iter().map(|s| s.to_string()).collect(),
    }
}

fn provider_config(prefix: &str) -> anyhow::Result<ProviderConfig> {
    Ok(ProviderConfig {
        api_key: env_or(&format!("LKG_{prefix}_API_KEY"), ""),
        base_url: std::env::var(format!("LKG_{prefix}_BASE_URL")).ok(),
        max_concurrent: env_parse(&format!("LKG_{prefix}_MAX_CONCURRENT"), 100usize)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_memory_redis_url() {
        std::env::set_var("LKG_REDIS_URL", "redis://localhost:6379");
        let result = GatewayConfig::from_env();
        std::env::remove_var("LKG_REDIS_URL");
        assert!(result.is_err());
    }

    #[test]
    fn defaults_apply_when_unset() {
        std::env::remove_var("LKG_REDIS_URL");
        std::env::remove_var("LKG_PORT");
        let config = GatewayConfig::from_env().unwrap();
        assert_eq!(config.redis_url, "memory://");
        assert_eq!(config.port, 8080);
        assert_eq!(config.api_key_prefix, "lkg_");
    }
}
