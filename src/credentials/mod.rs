//! API key issuance and authentication.
//!
//! A caller-facing key is never stored in plaintext. We keep two derived
//! values: a fast SHA-256 `lookup_hash` used for cache/database lookups,
//! and a slow argon2 `slow_hash` used to verify the key actually presented
//! by the caller before trusting a lookup hit.

pub mod store;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};

/// Permissions and limits associated with an API key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ApiKeyPermissions {
    pub can_read: bool,
    pub can_write: bool,
    pub can_manage_keys: bool,
    pub is_admin: bool,
    pub rate_limit_per_minute: u32,
}

impl ApiKeyPermissions {
    pub fn default_for(rate_limit_per_minute: u32) -> Self {
        Self {
            can_read: true,
            can_write: true,
            can_manage_keys: false,
            is_admin: false,
            rate_limit_per_minute,
        }
    }
}

/// Domain entity representing an API key, without the plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub org_id: String,
    pub user_id: String,
    pub name: String,
    pub lookup_hash: String,
    pub slow_hash: String,
    pub preview: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub permissions: ApiKeyPermissions,
}

/// Service responsible for generating and validating API keys.
pub struct ApiKeyService {
    store: store::CredentialStore,
    key_prefix: String,
    hasher: Argon2<'static>,
}

impl ApiKeyService {
    /// `cost_rounds` sets argon2's time cost (`LKG_API_KEY_BCRYPT_ROUNDS`,
    /// named for the knob's original bcrypt-rounds shape); memory/parallelism
    /// costs stay at argon2's own defaults.
    pub fn new(store: store::CredentialStore, key_prefix: String, cost_rounds: u32) -> Self {
        let params = Params::new(Params::DEFAULT_M_COST, cost_rounds.max(1), Params::DEFAULT_P_COST, None)
            .expect("valid argon2 params");
        let hasher = Argon2::new(Algorithm::default(), Version::default(), params);
        Self { store, key_prefix, hasher }
    }

    /// Generate a new API key and return `(entity, plaintext_key)`. The
    /// plaintext is returned once to be shown to the caller; it is never
    /// persisted.
    pub fn generate_key(
        &self,
        org_id: &str,
        user_id: &str,
        name: &str,
        permissions: Option<ApiKeyPermissions>,
        ttl: Option<chrono::Duration>,
        default_rate_limit_per_minute: u32,
    ) -> anyhow::Result<(ApiKey, String)> {
        let mut suffix_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut suffix_bytes);
        let mut plaintext_key = format!("{}{}", self.key_prefix, base64_urlsafe(&suffix_bytes));

        let preview = plaintext_key.chars().take(8).collect::<String>();
        let lookup_hash = sha256_hex(&plaintext_key);

        let salt = SaltString::generate(&mut rand::rngs::OsRng);
        let slow_hash = self
            .hasher
            .hash_password(plaintext_key.as_bytes(), &salt)
            .map_err(|e| anyhow::anyhow!("argon2 hashing failed: {e}"))?
            .to_string();

        let now = Utc::now();
        let expires_at = ttl.map(|d| now + d);
        let permissions = permissions.unwrap_or_else(|| ApiKeyPermissions::default_for(default_rate_limit_per_minute));

        let mut id_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut id_bytes);
        let id = sha256_hex_bytes(&id_bytes);

        let entity = ApiKey {
            id,
            org_id: org_id.to_string(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            lookup_hash,
            slow_hash,
            preview,
            expires_at,
            last_used_at: None,
            is_active: true,
            permissions,
        };

        self.store.save(&entity)?;
        let returned = plaintext_key.clone();
        plaintext_key.zeroize();
        Ok((entity, returned))
    }

    /// Validate a presented plaintext key, returning its `ApiKey` entity.
    /// Used for cache warm-up; the hot path looks up `lookup_hash` directly
    /// against the KV cache and only falls back here on a miss.
    pub fn authenticate(&self, plaintext_key: &str) -> anyhow::Result<Option<ApiKey>> {
        let lookup_hash = sha256_hex(plaintext_key);
        let Some(stored) = self.store.get_by_hash(&lookup_hash)? else {
            return Ok(None);
        };

        if !stored.is_active {
            return Ok(None);
        }
        if let Some(expires_at) = stored.expires_at {
            if expires_at < Utc::now() {
                return Ok(None);
            }
        }

        let parsed = PasswordHash::new(&stored.slow_hash)
            .map_err(|e| anyhow::anyhow!("stored argon2 hash is malformed: {e}"))?;
        if self.hasher.verify_password(plaintext_key.as_bytes(), &parsed).is_err() {
            return Ok(None);
        }

        self.store.touch_last_used(&stored.id, Utc::now())?;
        Ok(Some(stored))
    }
}

fn sha256_hex(s: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    hex::encode(hasher.finalize())
}

fn sha256_hex_bytes(b: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b);
    hex::encode(hasher.finalize())
}

/// URL-safe base64 without padding, matching `secrets.token_urlsafe`'s shape.
fn base64_urlsafe(bytes: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";
    let mut out = String::with_capacity((bytes.len() * 4) / 3 + 4);
    for chunk in bytes.chunks(3) {
        let b0 = chunk[0] as u32;
        let b1 = *chunk.get(1).unwrap_or(&0) as u32;
        let b2 = *chunk.get(2).unwrap_or(&0) as u32;
        let n = (b0 << 16) | (b1 << 8) | b2;
        out.push(ALPHABET[((n >> 18) & 0x3f) as usize] as char);
        out.push(ALPHABET[((n >> 12) & 0x3f) as usize] as char);
        if chunk.len() > 1 {
            out.push(ALPHABET[((n >> 6) & 0x3f) as usize] as char);
        }
        if chunk.len() > 2 {
            out.push(ALPHABET[(n & 0x3f) as usize] as char);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_then_authenticate_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store::CredentialStore::open(&dir.path().join("creds.db")).unwrap();
        let svc = ApiKeyService::new(store, "lkg_".to_string(), 12);

        let (entity, plaintext) = svc
            .generate_key("org1", "user1", "test key", None, None, 1200)
            .unwrap();
        assert!(plaintext.starts_with("lkg_"));
        assert_eq!(entity.preview.len(), 8);

        let authed = svc.authenticate(&plaintext).unwrap();
        assert!(authed.is_some());
        assert_eq!(authed.unwrap().id, entity.id);
    }

    #[test]
    fn wrong_key_does_not_authenticate() {
        let dir = tempfile::tempdir().unwrap();
        let store = store::CredentialStore::open(&dir.path().join("creds.db")).unwrap();
        let svc = ApiKeyService::new(store, "lkg_".to_string(), 12);

        let (_entity, _plaintext) = svc
            .generate_key("org1", "user1", "test key", None, None, 1200)
            .unwrap();

        let authed = svc.authenticate("lkg_not-the-right-key").unwrap();
        assert!(authed.is_none());
    }

    #[test]
    fn expired_key_does_not_authenticate() {
        let dir = tempfile::tempdir().unwrap();
        let store = store::CredentialStore::open(&dir.path().join("creds.db")).unwrap();
        let svc = ApiKeyService::new(store, "lkg_".to_string(), 12);

        let (_entity, plaintext) = svc
            .generate_key("org1", "user1", "test key", None, Some(chrono::Duration::seconds(-1)), 1200)
            .unwrap();

        let authed = svc.authenticate(&plaintext).unwrap();
        assert!(authed.is_none());
    }
}
