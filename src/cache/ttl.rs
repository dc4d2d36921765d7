//! Generic keyed store with TTL, negative entries, stale-while-revalidate, and
//! max-entries eviction.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Entry<V> {
    /// `None` for negative entries, which carry no value.
    value: Option<V>,
    expires_at: Instant,
    stale_at: Option<Instant>,
    is_negative: bool,
    etag: Option<String>,
    inserted_seq: u64,
}

/// Outcome of a [`TtlCache::get`] call.
#[derive(Debug, Clone)]
pub struct GetResult<V> {
    pub value: Option<V>,
    pub found: bool,
    pub is_stale: bool,
    pub is_negative: bool,
}

/// Tunables for a [`TtlCache`] instance.
#[derive(Debug, Clone)]
pub struct TtlCacheConfig {
    pub default_ttl: Duration,
    pub negative_ttl: Duration,
    /// `None` disables stale-while-revalidate.
    pub stale_window: Option<Duration>,
    pub max_entries: Option<usize>,
}

impl Default for TtlCacheConfig {
    fn default() -> Self {
        TtlCacheConfig {
            default_ttl: Duration::from_secs(300),
            negative_ttl: Duration::from_secs(10),
            stale_window: None,
            max_entries: None,
        }
    }
}

/// A generic TTL-keyed cache. Access is serialized behind a [`Mutex`] exactly
/// as spec'd for shared resources mutated concurrently from multiple tasks.
pub struct TtlCache<V: Clone> {
    config: TtlCacheConfig,
    entries: Mutex<HashMap<String, Entry<V>>>,
    seq: Mutex<u64>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(config: TtlCacheConfig) -> Self {
        TtlCache {
            config,
            entries: Mutex::new(HashMap::new()),
            seq: Mutex::new(0),
        }
    }

    fn next_seq(&self) -> u64 {
        let mut seq = self.seq.lock().unwrap();
        *seq += 1;
        *seq
    }

    /// Inserts a value. `ttl` of `None` uses `defaultTtlMs`. `ttl` of
    /// `Some(Duration::MAX)` never expires.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>, etag: Option<String>) {
        self.insert(key, Some(value), ttl, false, etag);
    }

    /// Marks `key` as a known-absent entry using the shorter `negativeTtlMs`.
    pub fn set_negative(&self, key: impl Into<String>) {
        self.insert(key, None, None, true, None);
    }

    fn insert(&self, key: impl Into<String>, value: Option<V>, ttl: Option<Duration>, is_negative: bool, etag: Option<String>) {
        let now = Instant::now();
        let ttl = ttl.unwrap_or(if is_negative {
            self.config.negative_ttl
        } else {
            self.config.default_ttl
        });
        let expires_at = now.checked_add(ttl).unwrap_or(far_future());
        let stale_at = self
            .config
            .stale_window
            .filter(|_| ttl != Duration::MAX && !is_negative)
            .and_then(|w| expires_at.checked_add(w));

        let entry = Entry {
            value,
            expires_at,
            stale_at,
            is_negative,
            etag,
            inserted_seq: self.next_seq(),
        };

        let mut entries = self.entries.lock().unwrap();
        entries.insert(key.into(), entry);
        self.evict_if_over_capacity(&mut entries);
    }

    fn evict_if_over_capacity(&self, entries: &mut HashMap<String, Entry<V>>) {
        if let Some(max) = self.config.max_entries {
            while entries.len() > max {
                if let Some(oldest_key) = entries
                    .iter()
                    .min_by_key(|(_, e)| e.inserted_seq)
                    .map(|(k, _)| k.clone())
                {
                    entries.remove(&oldest_key);
                } else {
                    break;
                }
            }
        }
    }

    pub fn get(&self, key: &str) -> GetResult<V> {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get(key) else {
            return GetResult {
                value: None,
                found: false,
                is_stale: false,
                is_negative: false,
            };
        };

        if now <= entry.expires_at {
            return GetResult {
                value: entry.value.clone(),
                found: true,
                is_stale: false,
                is_negative: entry.is_negative,
            };
        }

        if let Some(stale_at) = entry.stale_at {
            if now <= stale_at {
                return GetResult {
                    value: entry.value.clone(),
                    found: true,
                    is_stale: true,
                    is_negative: entry.is_negative,
                };
            }
        }

        GetResult {
            value: None,
            found: false,
            is_stale: false,
            is_negative: false,
        }
    }

    /// True only for entries that are fresh (not expired, not stale).
    pub fn has(&self, key: &str) -> bool {
        let result = self.get(key);
        result.found && !result.is_stale
    }

    pub fn get_etag(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).and_then(|e| e.etag.clone())
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    pub fn invalidate_matching(&self, mut predicate: impl FnMut(&str) -> bool) {
        self.entries.lock().unwrap().retain(|k, _| !predicate(k));
    }

    /// Keeps only entries whose value satisfies `keep`; negative entries
    /// (whose `value` is `None`) are always kept, since `keep` only inspects
    /// real values.
    pub fn retain_values(&self, mut keep: impl FnMut(&V) -> bool) {
        self.entries
            .lock()
            .unwrap()
            .retain(|_, e| e.value.as_ref().map(&mut keep).unwrap_or(true));
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn size(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(u32::MAX as u64)
}
