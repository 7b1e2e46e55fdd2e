use std::collections::HashMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use indexmap::IndexMap;
use tokio::sync::Notify;

const DEFAULT_SHARDS: usize = 16;

/// Immutable cache entry. Entries whose expiry has passed are treated as
/// absent on lookup; the background sweep only reclaims their memory early.
#[derive(Clone, Debug)]
pub struct Entry {
    pub bytes: Bytes,
    pub expiry: SystemTime,
}

impl Entry {
    pub fn size_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expiry <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(SystemTime::now())
    }
}

/// Loader outcomes are shared by every waiter on the same key, so the error
/// arm has to be cloneable.
pub type LoadResult = Result<Entry, Arc<anyhow::Error>>;

struct Flight {
    notify: Notify,
    result: Mutex<Option<LoadResult>>,
}

impl Flight {
    fn new() -> Self {
        Self {
            notify: Notify::new(),
            result: Mutex::new(None),
        }
    }

    async fn wait(&self) -> LoadResult {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before the check so a set() in between cannot be missed
            notified.as_mut().enable();
            if let Some(val) = self.result.lock().expect("flight").clone() {
                return val;
            }
            notified.await;
        }
    }

    fn set(&self, val: LoadResult) {
        let mut slot = self.result.lock().expect("flight");
        *slot = Some(val);
        drop(slot);
        self.notify.notify_waiters();
    }
}

enum FlightRole {
    Lead(Arc<Flight>),
    Wait(Arc<Flight>),
}

/// Completes an abandoned flight when the leader's future is dropped
/// mid-load.
struct FlightGuard {
    shard: Arc<Shard>,
    key: String,
    flight: Arc<Flight>,
    armed: bool,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.shard.state.lock().expect("shard");
        state.inflight.remove(&self.key);
        drop(state);
        self.flight
            .set(Err(Arc::new(anyhow!("load cancelled: '{}'", self.key))));
    }
}

struct ShardState {
    entries: IndexMap<String, Entry>,
    inflight: HashMap<String, Arc<Flight>>,
    used_bytes: u64,
}

struct Shard {
    state: Mutex<ShardState>,
}

impl Shard {
    fn new() -> Self {
        Self {
            state: Mutex::new(ShardState {
                entries: IndexMap::new(),
                inflight: HashMap::new(),
                used_bytes: 0,
            }),
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StoreStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub used_bytes: u64,
}

/// Bounded, sharded, TTL-aware byte cache with per-key single-flight.
///
/// Each shard owns its entry map and its in-flight map under one lock. The
/// lock is never held across a loader invocation: the flight record is the
/// synchronization object waiters attach to. The loader itself runs inside
/// the leader's future, so cancelling the leader aborts the in-flight load
/// and waiters observe the cancellation; cancelling a waiter detaches only
/// that waiter.
pub struct Store {
    shards: Vec<Arc<Shard>>,
    shard_budget: u64,
    counters: Arc<Counters>,
}

impl Store {
    pub fn new(size_bytes: u64) -> Self {
        Self::with_shards(size_bytes, DEFAULT_SHARDS)
    }

    pub fn with_shards(size_bytes: u64, shards: usize) -> Self {
        let shards = shards.next_power_of_two().max(1);
        Self {
            shards: (0..shards).map(|_| Arc::new(Shard::new())).collect(),
            shard_budget: (size_bytes / shards as u64).max(1),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Serve `key` from a live entry, or collapse concurrent callers onto a
    /// single `load` invocation. Errors are delivered to every waiter and
    /// never cached; the next arrival retries.
    pub async fn get<F, Fut>(&self, key: &str, load: F) -> LoadResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Entry>>,
    {
        let shard = self.shard(key);
        let role = {
            let mut state = shard.state.lock().expect("shard");
            if let Some(entry) = lookup_live(&mut state, key) {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry);
            }
            if let Some(flight) = state.inflight.get(key) {
                FlightRole::Wait(Arc::clone(flight))
            } else {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                let flight = Arc::new(Flight::new());
                state.inflight.insert(key.to_string(), Arc::clone(&flight));
                FlightRole::Lead(flight)
            }
        };
        match role {
            FlightRole::Wait(flight) => flight.wait().await,
            FlightRole::Lead(flight) => self.lead(shard, key, flight, load()).await,
        }
    }

    /// Drive the loader as the flight leader. Dropping this future mid-load
    /// cancels the loader call; the guard then deregisters the flight and
    /// hands the cancellation error to every waiter.
    async fn lead<Fut>(
        &self,
        shard: &Arc<Shard>,
        key: &str,
        flight: Arc<Flight>,
        load: Fut,
    ) -> LoadResult
    where
        Fut: Future<Output = Result<Entry>>,
    {
        let mut guard = FlightGuard {
            shard: Arc::clone(shard),
            key: key.to_string(),
            flight,
            armed: true,
        };

        let loaded = load.await;

        guard.armed = false;
        let result: LoadResult = {
            let mut state = guard.shard.state.lock().expect("shard");
            state.inflight.remove(&guard.key);
            match loaded {
                Ok(entry) => {
                    install(
                        &mut state,
                        self.shard_budget,
                        &self.counters,
                        guard.key.clone(),
                        entry.clone(),
                    );
                    Ok(entry)
                }
                Err(err) => Err(Arc::new(err)),
            }
        };
        guard.flight.set(result.clone());
        result
    }

    /// Install an entry directly, evicting least-recently-used entries if the
    /// shard budget is exceeded.
    pub async fn set(&self, key: &str, bytes: Bytes, expiry: SystemTime) {
        let shard = self.shard(key);
        let mut state = shard.state.lock().expect("shard");
        install(
            &mut state,
            self.shard_budget,
            &self.counters,
            key.to_string(),
            Entry { bytes, expiry },
        );
    }

    pub async fn remove(&self, key: &str) -> bool {
        let shard = self.shard(key);
        let mut state = shard.state.lock().expect("shard");
        match state.entries.shift_remove(key) {
            Some(old) => {
                state.used_bytes -= old.size_bytes();
                true
            }
            None => false,
        }
    }

    /// Drop expired entries across all shards. Optional: lookups re-check
    /// expiry regardless.
    pub async fn purge_expired(&self) -> usize {
        let now = SystemTime::now();
        let mut removed = 0;
        for shard in &self.shards {
            let mut state = shard.state.lock().expect("shard");
            let expired: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, e)| e.is_expired_at(now))
                .map(|(k, _)| k.clone())
                .collect();
            for key in expired {
                if let Some(old) = state.entries.shift_remove(&key) {
                    state.used_bytes -= old.size_bytes();
                    removed += 1;
                }
            }
        }
        removed
    }

    pub async fn contains_live(&self, key: &str) -> bool {
        let shard = self.shard(key);
        let state = shard.state.lock().expect("shard");
        state
            .entries
            .get(key)
            .map(|e| !e.is_expired())
            .unwrap_or(false)
    }

    pub async fn stats(&self) -> StoreStats {
        let mut used = 0;
        for shard in &self.shards {
            used += shard.state.lock().expect("shard").used_bytes;
        }
        StoreStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            used_bytes: used,
        }
    }

    fn shard(&self, key: &str) -> &Arc<Shard> {
        // SipHash here, crc32 on the ring: local contention patterns stay
        // independent of peer routing.
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) & (self.shards.len() - 1);
        &self.shards[idx]
    }
}

fn lookup_live(state: &mut ShardState, key: &str) -> Option<Entry> {
    let expired = match state.entries.get(key) {
        Some(entry) if !entry.is_expired() => {
            let entry = entry.clone();
            // bump recency
            state.entries.shift_remove(key);
            state.entries.insert(key.to_string(), entry.clone());
            return Some(entry);
        }
        Some(_) => true,
        None => false,
    };
    if expired {
        if let Some(old) = state.entries.shift_remove(key) {
            state.used_bytes -= old.size_bytes();
        }
    }
    None
}

fn install(state: &mut ShardState, budget: u64, counters: &Counters, key: String, entry: Entry) {
    if let Some(old) = state.entries.shift_remove(&key) {
        state.used_bytes -= old.size_bytes();
    }
    state.used_bytes += entry.size_bytes();
    state.entries.insert(key, entry);
    while state.used_bytes > budget && state.entries.len() > 1 {
        match state.entries.shift_remove_index(0) {
            Some((_, evicted)) => {
                state.used_bytes -= evicted.size_bytes();
                counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
            None => break,
        }
    }
}
