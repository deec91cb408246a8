//! Sharded in-memory TTL store.
//!
//! Values are raw bytes; typed access lives at the cluster layer. The store
//! is split into power-of-two shards, each behind its own lock, so readers
//! and writers on different keys rarely contend. Entries age out after a
//! fixed life window; a janitor task sweeps expired entries, and a per-shard
//! capacity cap overwrites the oldest entry when a shard fills up.
//!
//! Removal callbacks run synchronously on the thread performing the removal,
//! while the shard lock is held. Callbacks must not call back into the store.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::RandomState;
use parking_lot::RwLock;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default number of shards. Power of two, matching the slot-table scale.
const DEFAULT_SHARDS: usize = 1024;

/// How long an entry lives before it is eligible for expiration.
const DEFAULT_LIFE_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Interval between janitor sweeps of expired entries.
const DEFAULT_CLEAN_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Hard cap on entries per shard. When a shard is full the oldest entry is
/// overwritten to make room.
const DEFAULT_SHARD_CAPACITY: usize = 4096;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("NotFound")]
    NotFound,
    #[error("BlankKey")]
    BlankKey,
}

/// Callback reporting `(key, bytes)` as an entry leaves the store.
pub type RemovalCallback = Box<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Hooks fired as entries are removed, keyed by the reason for removal.
#[derive(Default)]
pub struct RemovalHooks {
    /// Entry aged past the life window.
    pub on_expired: Option<RemovalCallback>,
    /// Entry overwritten because its shard was full.
    pub on_evicted: Option<RemovalCallback>,
    /// Entry explicitly deleted.
    pub on_deleted: Option<RemovalCallback>,
}

pub struct StoreConfig {
    /// Shard count; rounded up to the next power of two.
    pub shards: usize,
    pub life_window: Duration,
    pub clean_window: Duration,
    pub shard_capacity: usize,
    pub hooks: RemovalHooks,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            shards: DEFAULT_SHARDS,
            life_window: DEFAULT_LIFE_WINDOW,
            clean_window: DEFAULT_CLEAN_WINDOW,
            shard_capacity: DEFAULT_SHARD_CAPACITY,
            hooks: RemovalHooks::default(),
        }
    }
}

struct Entry {
    bytes: Vec<u8>,
    stored_at: Instant,
}

#[derive(Default)]
struct ShardInner {
    map: HashMap<String, Entry>,
    /// Insertion order for oldest-first overwrite. Keys deleted from the map
    /// may linger here and are skipped during eviction.
    order: VecDeque<String>,
}

struct Shard {
    inner: RwLock<ShardInner>,
}

/// Sharded TTL byte store.
pub struct Store {
    shards: Box<[Shard]>,
    mask: usize,
    hasher: RandomState,
    life_window: Duration,
    clean_window: Duration,
    shard_capacity: usize,
    hooks: RemovalHooks,
}

impl Store {
    pub fn new(config: StoreConfig) -> Self {
        let shard_count = config.shards.max(1).next_power_of_two();
        let shards = (0..shard_count)
            .map(|_| Shard {
                inner: RwLock::new(ShardInner::default()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            shards,
            mask: shard_count - 1,
            hasher: RandomState::new(),
            life_window: config.life_window,
            // The sweep interval must be non-zero.
            clean_window: config.clean_window.max(Duration::from_secs(1)),
            shard_capacity: config.shard_capacity.max(1),
            hooks: config.hooks,
        }
    }

    fn shard(&self, key: &str) -> &Shard {
        let hash = self.hasher.hash_one(key);
        &self.shards[(hash as usize) & self.mask]
    }

    fn expired(&self, entry: &Entry, now: Instant) -> bool {
        now.duration_since(entry.stored_at) > self.life_window
    }

    /// Fetch the bytes stored for `key`.
    ///
    /// Entries past the life window read as missing even before the janitor
    /// removes them.
    pub fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        if key.is_empty() {
            return Err(StoreError::BlankKey);
        }

        let inner = self.shard(key).inner.read();
        match inner.map.get(key) {
            Some(entry) if !self.expired(entry, Instant::now()) => Ok(entry.bytes.clone()),
            _ => Err(StoreError::NotFound),
        }
    }

    /// Store `bytes` under `key`, overwriting any previous value.
    ///
    /// When the shard is at capacity, the oldest entry in the shard is
    /// evicted first and reported through `on_evicted`.
    pub fn set(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::BlankKey);
        }

        let mut inner = self.shard(key).inner.write();
        if !inner.map.contains_key(key) {
            while inner.map.len() >= self.shard_capacity {
                let Some(oldest) = inner.order.pop_front() else {
                    break;
                };
                if let Some(evicted) = inner.map.remove(&oldest) {
                    if let Some(hook) = &self.hooks.on_evicted {
                        hook(&oldest, &evicted.bytes);
                    }
                }
            }
            inner.order.push_back(key.to_string());
        }
        inner.map.insert(
            key.to_string(),
            Entry {
                bytes,
                stored_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Remove `key`, reporting it through `on_deleted` when present.
    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::BlankKey);
        }

        let mut inner = self.shard(key).inner.write();
        match inner.map.remove(key) {
            Some(entry) => {
                if let Some(hook) = &self.hooks.on_deleted {
                    hook(key, &entry.bytes);
                }
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    /// Number of live (non-expired) entries across all shards.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.shards
            .iter()
            .map(|shard| {
                let inner = shard.inner.read();
                inner
                    .map
                    .values()
                    .filter(|entry| !self.expired(entry, now))
                    .count()
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweep expired entries out of every shard, firing `on_expired` for
    /// each. Returns the number of removed entries.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;

        for shard in self.shards.iter() {
            let mut inner = shard.inner.write();
            let expired_keys: Vec<String> = inner
                .map
                .iter()
                .filter(|(_, entry)| self.expired(entry, now))
                .map(|(key, _)| key.clone())
                .collect();

            for key in expired_keys {
                if let Some(entry) = inner.map.remove(&key) {
                    if let Some(hook) = &self.hooks.on_expired {
                        hook(&key, &entry.bytes);
                    }
                    removed += 1;
                }
            }

            let ShardInner { map, order } = &mut *inner;
            order.retain(|key| map.contains_key(key));
        }

        removed
    }

    /// Spawn the background sweep task. Runs until the token is canceled.
    pub fn start_janitor(store: Arc<Store>, shutdown: CancellationToken) {
        let clean_window = store.clean_window;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(clean_window);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of an interval fires immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = store.cleanup();
                        if removed > 0 {
                            debug!(removed, "swept expired entries");
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn small_store(hooks: RemovalHooks) -> Store {
        Store::new(StoreConfig {
            shards: 4,
            life_window: Duration::from_millis(50),
            clean_window: Duration::from_millis(20),
            shard_capacity: 2,
            hooks,
        })
    }

    #[test]
    fn set_get_delete_round_trip() {
        let store = Store::new(StoreConfig::default());

        store.set("key", b"value".to_vec()).unwrap();
        assert_eq!(store.get("key").unwrap(), b"value");

        store.delete("key").unwrap();
        assert_eq!(store.get("key"), Err(StoreError::NotFound));
        assert_eq!(store.delete("key"), Err(StoreError::NotFound));
    }

    #[test]
    fn blank_key_is_rejected() {
        let store = Store::new(StoreConfig::default());
        assert_eq!(store.get(""), Err(StoreError::BlankKey));
        assert_eq!(store.set("", vec![1]), Err(StoreError::BlankKey));
        assert_eq!(store.delete(""), Err(StoreError::BlankKey));
    }

    #[test]
    fn overwrite_replaces_value() {
        let store = Store::new(StoreConfig::default());
        store.set("key", b"one".to_vec()).unwrap();
        store.set("key", b"two".to_vec()).unwrap();
        assert_eq!(store.get("key").unwrap(), b"two");
    }

    #[test]
    fn expired_entries_read_as_missing() {
        let store = small_store(RemovalHooks::default());
        store.set("key", b"value".to_vec()).unwrap();
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(store.get("key"), Err(StoreError::NotFound));
    }

    #[test]
    fn cleanup_fires_expired_hook() {
        static EXPIRED: AtomicUsize = AtomicUsize::new(0);

        let store = small_store(RemovalHooks {
            on_expired: Some(Box::new(|_, _| {
                EXPIRED.fetch_add(1, Ordering::SeqCst);
            })),
            ..RemovalHooks::default()
        });

        store.set("key", b"value".to_vec()).unwrap();
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(store.cleanup(), 1);
        assert_eq!(EXPIRED.load(Ordering::SeqCst), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn full_shard_overwrites_oldest() {
        let evicted = Arc::new(AtomicUsize::new(0));
        let hook_count = evicted.clone();

        // One shard so every key competes for the same capacity.
        let store = Store::new(StoreConfig {
            shards: 1,
            shard_capacity: 2,
            hooks: RemovalHooks {
                on_evicted: Some(Box::new(move |_, _| {
                    hook_count.fetch_add(1, Ordering::SeqCst);
                })),
                ..RemovalHooks::default()
            },
            ..StoreConfig::default()
        });

        store.set("a", vec![1]).unwrap();
        store.set("b", vec![2]).unwrap();
        store.set("c", vec![3]).unwrap();

        assert_eq!(evicted.load(Ordering::SeqCst), 1);
        assert_eq!(store.get("a"), Err(StoreError::NotFound));
        assert_eq!(store.get("b").unwrap(), vec![2]);
        assert_eq!(store.get("c").unwrap(), vec![3]);
    }

    #[test]
    fn delete_fires_deleted_hook() {
        let deleted = Arc::new(AtomicUsize::new(0));
        let hook_count = deleted.clone();

        let store = Store::new(StoreConfig {
            hooks: RemovalHooks {
                on_deleted: Some(Box::new(move |key, bytes| {
                    assert_eq!(key, "key");
                    assert_eq!(bytes, b"value");
                    hook_count.fetch_add(1, Ordering::SeqCst);
                })),
                ..RemovalHooks::default()
            },
            ..StoreConfig::default()
        });

        store.set("key", b"value".to_vec()).unwrap();
        store.delete("key").unwrap();
        assert_eq!(deleted.load(Ordering::SeqCst), 1);
    }
}
