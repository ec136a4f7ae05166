//! Result cache for pure commands, sharded by skill name.
//!
//! A hit requires both an unexpired TTL and an unchanged bundle mtime,
//! so editing a skill on disk invalidates its cached results the moment
//! the registry reloads. Keys are sha256 over the skill, command and the
//! canonical JSON of the *validated* arguments: coercion runs before
//! hashing, so `{"n": "3"}` and `{"n": 3}` share an entry.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use omnihive_schema::canonical_json;
use sha2::{Digest, Sha256};

const SHARDS: usize = 8;

struct CacheEntry {
    value: serde_json::Value,
    stored_at: Instant,
    ttl: Duration,
    skill_mtime: i64,
}

pub struct ResultCache {
    shards: Vec<Mutex<HashMap<String, CacheEntry>>>,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultCache {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    pub fn cache_key(skill: &str, command: &str, args: &serde_json::Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(skill.as_bytes());
        hasher.update(b"\0");
        hasher.update(command.as_bytes());
        hasher.update(b"\0");
        hasher.update(canonical_json(args).as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn shard(&self, skill: &str) -> &Mutex<HashMap<String, CacheEntry>> {
        let mut hasher = DefaultHasher::new();
        skill.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }

    pub fn get(&self, skill: &str, key: &str, current_mtime: i64) -> Option<serde_json::Value> {
        let shard = self.shard(skill).lock().ok()?;
        let entry = shard.get(key)?;
        if entry.stored_at.elapsed() >= entry.ttl {
            return None;
        }
        if entry.skill_mtime != current_mtime {
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn put(
        &self,
        skill: &str,
        key: String,
        value: serde_json::Value,
        ttl: Duration,
        skill_mtime: i64,
    ) {
        if let Ok(mut shard) = self.shard(skill).lock() {
            let now = Instant::now();
            shard.retain(|_, entry| now.duration_since(entry.stored_at) < entry.ttl);
            shard.insert(
                key,
                CacheEntry {
                    value,
                    stored_at: now,
                    ttl,
                    skill_mtime,
                },
            );
        }
    }

    /// Drop every entry for a skill (called on reload).
    pub fn invalidate_skill(&self, skill: &str) {
        if let Ok(mut shard) = self.shard(skill).lock() {
            // Shards are keyed by skill, so clearing the shard is safe; a
            // few co-resident skills lose warm entries, never correctness.
            shard.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_stable_across_arg_order() {
        let a = ResultCache::cache_key("demo", "echo", &json!({"a": 1, "b": 2}));
        let b = ResultCache::cache_key("demo", "echo", &json!({"b": 2, "a": 1}));
        assert_eq!(a, b);
    }

    #[test]
    fn keys_differ_per_command_and_args() {
        let base = ResultCache::cache_key("demo", "echo", &json!({"a": 1}));
        assert_ne!(
            base,
            ResultCache::cache_key("demo", "other", &json!({"a": 1}))
        );
        assert_ne!(
            base,
            ResultCache::cache_key("demo", "echo", &json!({"a": 2}))
        );
    }

    #[test]
    fn hit_requires_ttl_and_mtime() {
        let cache = ResultCache::new();
        let key = ResultCache::cache_key("demo", "echo", &json!({}));
        cache.put(
            "demo",
            key.clone(),
            json!("cached"),
            Duration::from_secs(60),
            100,
        );

        assert_eq!(cache.get("demo", &key, 100), Some(json!("cached")));
        // mtime moved: miss.
        assert_eq!(cache.get("demo", &key, 101), None);
    }

    #[test]
    fn expired_entries_miss() {
        let cache = ResultCache::new();
        let key = ResultCache::cache_key("demo", "echo", &json!({}));
        cache.put("demo", key.clone(), json!("x"), Duration::from_millis(0), 1);
        assert_eq!(cache.get("demo", &key, 1), None);
    }

    #[test]
    fn invalidate_skill_clears_entries() {
        let cache = ResultCache::new();
        let key = ResultCache::cache_key("demo", "echo", &json!({}));
        cache.put("demo", key.clone(), json!("x"), Duration::from_secs(60), 1);
        cache.invalidate_skill("demo");
        assert_eq!(cache.get("demo", &key, 1), None);
    }
}
