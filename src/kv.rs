//! Shared key/value cache — the narrow port the auth gate, router, and
//! registry all consume. The only implementation this crate ships is an
//! in-process `InMemoryKv`, selected whenever `redis_url=memory://` (the
//! crate's only supported value; see `config.rs`).

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Narrow KV contract consumed by the auth gate, router, and registry.
/// Values are opaque bytes; callers choose their own codec.
pub trait KvCache: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>);
    fn incr(&self, key: &str) -> i64;
    fn expire(&self, key: &str, ttl: Duration);
    fn ttl(&self, key: &str) -> Option<Duration>;
    fn delete(&self, key: &str);

    fn hget(&self, key: &str, field: &str) -> Option<Vec<u8>>;
    fn hset(&self, key: &str, field: &str, value: Vec<u8>);
    fn hgetall(&self, key: &str) -> HashMap<String, Vec<u8>>;
    fn hmget(&self, key: &str, fields: &[String]) -> Vec<Option<Vec<u8>>>;
    fn hdelete_all(&self, key: &str);

    fn smembers(&self, key: &str) -> Vec<String>;
    fn sadd(&self, key: &str, member: &str);
    fn sclear(&self, key: &str);

    /// Execute a batch of write operations as one unit against the
    /// in-process lock — the closest this port gets to a `MULTI`.
    fn pipeline(&self, ops: Vec<PipelineOp>);
}

/// One write operation eligible for batching inside `pipeline`.
pub enum PipelineOp {
    Set { key: String, value: Vec<u8>, ttl: Option<Duration> },
    HSet { key: String, field: String, value: Vec<u8> },
    HClear { key: String },
    SAdd { key: String, member: String },
    SClear { key: String },
    Delete { key: String },
}

#[derive(Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self) -> bool {
        self.expires_at.map(|at| at > Instant::now()).unwrap_or(true)
    }
}

/// In-memory `KvCache` — a `RwLock<HashMap>` guarding strings, hashes, and
/// sets, with lazy TTL expiry checked on read.
pub struct InMemoryKv {
    strings: RwLock<HashMap<String, Entry>>,
    hashes: RwLock<HashMap<String, HashMap<String, Vec<u8>>>>,
    sets: RwLock<HashMap<String, std::collections::HashSet<String>>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self {
            strings: RwLock::new(HashMap::new()),
            hashes: RwLock::new(HashMap::new()),
            sets: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl KvCache for InMemoryKv {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        let map = self.strings.read().unwrap();
        let entry = map.get(key)?;
        if entry.is_live() {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) {
        let mut map = self.strings.write().unwrap();
        map.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
    }

    fn incr(&self, key: &str) -> i64 {
        let mut map = self.strings.write().unwrap();
        let entry = map.entry(key.to_string()).or_insert(Entry { value: b"0".to_vec(), expires_at: None });
        if !entry.is_live() {
            entry.value = b"0".to_vec();
            entry.expires_at = None;
        }
        let current: i64 = std::str::from_utf8(&entry.value).ok().and_then(|s| s.parse().ok()).unwrap_or(0);
        let next = current + 1;
        entry.value = next.to_string().into_bytes();
        next
    }

    fn expire(&self, key: &str, ttl: Duration) {
        let mut map = self.strings.write().unwrap();
        if let Some(entry) = map.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
    }

    fn ttl(&self, key: &str) -> Option<Duration> {
        let map = self.strings.read().unwrap();
        let entry = map.get(key)?;
        if !entry.is_live() {
            return None;
        }
        entry.expires_at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    fn delete(&self, key: &str) {
        self.strings.write().unwrap().remove(key);
        self.hashes.write().unwrap().remove(key);
        self.sets.write().unwrap().remove(key);
    }

    fn hget(&self, key: &str, field: &str) -> Option<Vec<u8>> {
        self.hashes.read().unwrap().get(key)?.get(field).cloned()
    }

    fn hset(&self, key: &str, field: &str, value: Vec<u8>) {
        self.hashes
            .write()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
    }

    fn hgetall(&self, key: &str) -> HashMap<String, Vec<u8>> {
        self.hashes.read().unwrap().get(key).cloned().unwrap_or_default()
    }

    fn hmget(&self, key: &str, fields: &[String]) -> Vec<Option<Vec<u8>>> {
        let hashes = self.hashes.read().unwrap();
        let hash = hashes.get(key);
        fields.iter().map(|f| hash.and_then(|h| h.get(f)).cloned()).collect()
    }

    fn hdelete_all(&self, key: &str) {
        self.hashes.write().unwrap().remove(key);
    }

    fn smembers(&self, key: &str) -> Vec<String> {
        self.sets.read().unwrap().get(key).map(|s| s.iter().cloned().collect()).unwrap_or_default()
    }

    fn sadd(&self, key: &str, member: &str) {
        self.sets
            .write()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
    }

    fn sclear(&self, key: &str) {
        self.sets.write().unwrap().remove(key);
    }

    fn pipeline(&self, ops: Vec<PipelineOp>) {
        // One write-guard per map, held for the whole batch — a concurrent
        // `hget`/`hgetall`/`smembers` blocks until the batch finishes, so it
        // never observes an `HClear` with only some of the following `HSet`s
        // applied. Per-op locking (calling back into `set`/`hset`/... here)
        // would let a reader interleave between ops.
        let mut strings = self.strings.write().unwrap();
        let mut hashes = self.hashes.write().unwrap();
        let mut sets = self.sets.write().unwrap();
        for op in ops {
            match op {
                PipelineOp::Set { key, value, ttl } => {
                    strings.insert(key, Entry { value, expires_at: ttl.map(|d| Instant::now() + d) });
                }
                PipelineOp::HSet { key, field, value } => {
                    hashes.entry(key).or_default().insert(field, value);
                }
                PipelineOp::HClear { key } => {
                    hashes.remove(&key);
                }
                PipelineOp::SAdd { key, member } => {
                    sets.entry(key).or_default().insert(member);
                }
                PipelineOp::SClear { key } => {
                    sets.remove(&key);
                }
                PipelineOp::Delete { key } => {
                    strings.remove(&key);
                    hashes.remove(&key);
                    sets.remove(&key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_and_expire() {
        let kv = InMemoryKv::new();
        kv.set("k", b"v".to_vec(), None);
        assert_eq!(kv.get("k"), Some(b"v".to_vec()));

        kv.set("k2", b"v2".to_vec(), Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(kv.get("k2"), None);
    }

    #[test]
    fn incr_is_monotonic_and_resets_on_expiry() {
        let kv = InMemoryKv::new();
        assert_eq!(kv.incr("counter"), 1);
        assert_eq!(kv.incr("counter"), 2);
        kv.expire("counter", Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(kv.incr("counter"), 1);
    }

    #[test]
    fn hash_and_set_ops() {
        let kv = InMemoryKv::new();
        kv.hset("h", "a", b"1".to_vec());
        kv.hset("h", "b", b"2".to_vec());
        assert_eq!(kv.hget("h", "a"), Some(b"1".to_vec()));
        assert_eq!(kv.hgetall("h").len(), 2);

        kv.sadd("s", "x");
        kv.sadd("s", "y");
        let mut members = kv.smembers("s");
        members.sort();
        assert_eq!(members, vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn pipeline_applies_all_ops() {
        let kv = InMemoryKv::new();
        kv.pipeline(vec![
            PipelineOp::Set { key: "a".into(), value: b"1".to_vec(), ttl: None },
            PipelineOp::SAdd { key: "s".into(), member: "m".into() },
        ]);
        assert_eq!(kv.get("a"), Some(b"1".to_vec()));
        assert_eq!(kv.smembers("s"), vec!["m".to_string()]);
    }
}
