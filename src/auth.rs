//! Auth gate — bearer-key extraction, two-tier cache lookup, and
//! fixed-window rate limiting in front of every routed request.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::config::RateLimitKeyMode;
use crate::credentials::{ApiKeyPermissions, ApiKeyService};
use crate::error::GatewayError;
use crate::kv::KvCache;
use crate::metrics;

type HmacSha256 = Hmac<Sha256>;

const AUTH_CACHE_TTL_CAP_SECS: i64 = 300;
const RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// The authenticated principal attached to a request after a successful
/// auth gate pass.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub api_key_id: String,
    pub org_id: String,
    pub user_id: String,
    pub lookup_hash: String,
    pub permissions: ApiKeyPermissions,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitInfo {
    pub limit: u32,
    pub remaining: u32,
    pub reset_unix_ts: i64,
}

/// Result of a full gate pass: the attached principal, rate-limit info for
/// outbound headers, whether the lookup was an auth-cache hit, and lookup
/// latency in milliseconds.
pub struct AuthOutcome {
    pub context: RequestContext,
    pub rate_limit: RateLimitInfo,
    pub cache_hit: bool,
    pub latency_ms: u64,
}

/// What gets serialized into the KV cache on a successful auth lookup. The
/// slow hash never enters this payload — a cache hit is trusted, the
/// security boundary is the KV Cache itself.
#[derive(Debug, Serialize, Deserialize)]
struct CachedAuth {
    id: String,
    org_id: String,
    user_id: String,
    lookup_hash: String,
    is_active: bool,
    expires_at_ts: Option<i64>,
    permissions: ApiKeyPermissions,
}

pub struct AuthGate {
    credentials: Arc<ApiKeyService>,
    kv: Arc<dyn KvCache>,
    key_mode: RateLimitKeyMode,
    default_rate_limit_per_minute: u32,
}

impl AuthGate {
    pub fn new(
        credentials: Arc<ApiKeyService>,
        kv: Arc<dyn KvCache>,
        key_mode: RateLimitKeyMode,
        default_rate_limit_per_minute: u32,
    ) -> Self {
        Self { credentials, kv, key_mode, default_rate_limit_per_minute }
    }

    /// Full gate: extract → lookup → rate-limit. Returns the attached
    /// principal, whether the lookup was served from the auth cache, the
    /// lookup latency, and rate-limit info for outbound headers — or a
    /// typed rejection.
    pub fn authenticate(&self, headers: &HeaderMap, client_ip: &str) -> Result<AuthOutcome, GatewayError> {
        let key = extract_key(headers).ok_or(GatewayError::MissingCredential)?;
        let lookup_hash = sha256_hex(&key);

        let started = Instant::now();
        let (context, cache_hit) = self.lookup(&key, &lookup_hash)?;
        let latency_ms = started.elapsed().as_millis() as u64;

        metrics::record_auth_cache_hit(cache_hit);
        metrics::record_auth_outcome("ok");

        let rate_limit = self.check_rate_limit(&context, client_ip)?;
        Ok(AuthOutcome { context, rate_limit, cache_hit, latency_ms })
    }

    fn lookup(&self, presented_key: &str, lookup_hash: &str) -> Result<(RequestContext, bool), GatewayError> {
        let cache_key = format!("lkg:auth:apikey:{lookup_hash}");

        if let Some(bytes) = self.kv.get(&cache_key) {
            if let Ok(cached) = serde_json::from_slice::<CachedAuth>(&bytes) {
                let not_expired = cached.expires_at_ts.map(|ts| ts > Utc::now().timestamp()).unwrap_or(true);
                let hash_matches = constant_time_eq(&cached.lookup_hash, lookup_hash);
                if cached.is_active && not_expired && hash_matches {
                    return Ok((
                        RequestContext {
                            api_key_id: cached.id,
                            org_id: cached.org_id,
                            user_id: cached.user_id,
                            lookup_hash: lookup_hash.to_string(),
                            permissions: cached.permissions,
                        },
                        true,
                    ));
                }
            }
        }

        let key = self
            .credentials
            .authenticate(presented_key)
            .map_err(GatewayError::Internal)?
            .ok_or(GatewayError::InvalidCredential)?;

        let expires_at_ts = key.expires_at.map(|t| t.timestamp());
        let ttl_secs = expires_at_ts
            .map(|ts| (ts - Utc::now().timestamp()).clamp(0, AUTH_CACHE_TTL_CAP_SECS))
            .unwrap_or(AUTH_CACHE_TTL_CAP_SECS);
        if ttl_secs > 0 {
            let payload = CachedAuth {
                id: key.id.clone(),
                org_id: key.org_id.clone(),
                user_id: key.user_id.clone(),
                lookup_hash: lookup_hash.to_string(),
                is_active: key.is_active,
                expires_at_ts,
                permissions: key.permissions,
            };
            if let Ok(packed) = serde_json::to_vec(&payload) {
                self.kv.set(&cache_key, packed, Some(Duration::from_secs(ttl_secs as u64)));
            }
        }

        Ok((
            RequestContext {
                api_key_id: key.id,
                org_id: key.org_id,
                user_id: key.user_id,
                lookup_hash: lookup_hash.to_string(),
                permissions: key.permissions,
            },
            false,
        ))
    }

    fn check_rate_limit(&self, context: &RequestContext, client_ip: &str) -> Result<RateLimitInfo, GatewayError> {
        let limit = if context.permissions.rate_limit_per_minute > 0 {
            context.permissions.rate_limit_per_minute
        } else {
            self.default_rate_limit_per_minute
        };

        let counter_key = match self.key_mode {
            RateLimitKeyMode::KeyAndIp => format!("lkg:ratelimit:{}:{}", context.lookup_hash, client_ip),
            RateLimitKeyMode::KeyOnly => format!("lkg:ratelimit:{}", context.lookup_hash),
        };

        let count = self.kv.incr(&counter_key);
        if count == 1 {
            self.kv.expire(&counter_key, Duration::from_secs(RATE_LIMIT_WINDOW_SECS));
        }

        let reset_unix_ts = Utc::now().timestamp()
            + self.kv.ttl(&counter_key).map(|d| d.as_secs() as i64).unwrap_or(RATE_LIMIT_WINDOW_SECS as i64);

        if count as u32 > limit {
            metrics::record_auth_outcome("rate_limited");
            return Err(GatewayError::RateLimited { reset_unix_ts });
        }

        Ok(RateLimitInfo {
            limit,
            remaining: limit.saturating_sub(count as u32),
            reset_unix_ts,
        })
    }
}

fn extract_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-api-key") {
        if let Ok(s) = value.to_str() {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(s) = value.to_str() {
            if let Some(rest) = s.strip_prefix("Bearer ").or_else(|| s.strip_prefix("bearer ")) {
                let trimmed = rest.trim();
                if !trimmed.is_empty() {
                    return Some(trimmed.to_string());
                }
            }
        }
    }
    None
}

fn sha256_hex(s: &str) -> String {
    use sha2::Digest;
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    hex::encode(hasher.finalize())
}

/// Constant-time string comparison via HMAC, used to check a cached auth
/// payload's embedded `lookup_hash` against the freshly computed one rather
/// than a plain `==`.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let key = b"lkg-auth-cache-consistency-key";
    let mut mac_a = HmacSha256::new_from_slice(key).unwrap();
    let mut mac_b = HmacSha256::new_from_slice(key).unwrap();
    mac_a.update(a.as_bytes());
    mac_b.update(b.as_bytes());
    mac_a.finalize().into_bytes() == mac_b.finalize().into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::store::CredentialStore;
    use crate::kv::InMemoryKv;
    use axum::http::HeaderValue;

    fn gate() -> (AuthGate, String) {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::open(&dir.path().join("creds.db")).unwrap();
        let service = Arc::new(ApiKeyService::new(store, "lkg_".to_string(), 12));
        let (_entity, plaintext) = service.generate_key("org1", "user1", "test", None, None, 5).unwrap();
        let kv: Arc<dyn KvCache> = Arc::new(InMemoryKv::new());
        (AuthGate::new(service, kv, RateLimitKeyMode::KeyAndIp, 1200), plaintext)
    }

    #[test]
    fn missing_credential_when_no_header_present() {
        let (gate, _key) = gate();
        let headers = HeaderMap::new();
        let result = gate.authenticate(&headers, "127.0.0.1");
        assert!(matches!(result, Err(GatewayError::MissingCredential)));
    }

    #[test]
    fn valid_key_authenticates_and_caches() {
        let (gate, key) = gate();
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_str(&key).unwrap());

        let outcome = gate.authenticate(&headers, "127.0.0.1").unwrap();
        assert_eq!(outcome.context.org_id, "org1");
        assert_eq!(outcome.rate_limit.limit, 5);
        assert_eq!(outcome.rate_limit.remaining, 4);
        assert!(!outcome.cache_hit);

        // Second call should hit the auth cache and still rate-limit correctly.
        let outcome2 = gate.authenticate(&headers, "127.0.0.1").unwrap();
        assert_eq!(outcome2.rate_limit.remaining, 3);
        assert!(outcome2.cache_hit);
    }

    #[test]
    fn bearer_header_is_also_accepted() {
        let (gate, key) = gate();
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {key}")).unwrap());
        assert!(gate.authenticate(&headers, "127.0.0.1").is_ok());
    }

    #[test]
    fn invalid_key_is_rejected() {
        let (gate, _key) = gate();
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_str("lkg_not-a-real-key").unwrap());
        let result = gate.authenticate(&headers, "127.0.0.1");
        assert!(matches!(result, Err(GatewayError::InvalidCredential)));
    }

    #[test]
    fn exceeding_rate_limit_returns_rate_limited() {
        let (gate, key) = gate();
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_str(&key).unwrap());

        for _ in 0..5 {
            assert!(gate.authenticate(&headers, "127.0.0.1").is_ok());
        }
        let result = gate.authenticate(&headers, "127.0.0.1");
        assert!(matches!(result, Err(GatewayError::RateLimited { .. })));
    }
}
