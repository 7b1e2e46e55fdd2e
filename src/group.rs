use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use anyhow::{anyhow, Result};
use bytes::Bytes;

use crate::peer::PeerClient;
use crate::ring::Ring;
use crate::store::{Entry, Store};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Turns a cache miss into entry bytes plus an absolute expiry.
pub trait Loader: Send + Sync {
    fn load(&self, key: &str) -> BoxFuture<Result<(Bytes, SystemTime)>>;
}

/// Read-only view of a group's counters, for exporters.
#[derive(Clone, Copy, Debug, Default)]
pub struct GroupStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub used_bytes: u64,
    pub peer_loads: u64,
    pub peer_errors: u64,
}

/// Named cache bucket binding the ring, the local store, the peer client and
/// the loader. The single public operation is `get`.
pub struct Group {
    name: String,
    self_addr: String,
    ring: Arc<Ring>,
    store: Arc<Store>,
    peers: PeerClient,
    loader: Arc<dyn Loader>,
    peer_loads: AtomicU64,
    peer_errors: AtomicU64,
}

impl Group {
    pub fn new(
        name: &str,
        self_addr: String,
        ring: Arc<Ring>,
        store: Arc<Store>,
        peers: PeerClient,
        loader: Arc<dyn Loader>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            self_addr,
            ring,
            store,
            peers,
            loader,
            peer_loads: AtomicU64::new(0),
            peer_errors: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get(&self, key: &str) -> Result<Bytes> {
        Ok(self.get_entry(key).await?.bytes)
    }

    /// Route `key` to its owner: locally when this instance owns it,
    /// otherwise over the peer transport. A peer transport failure falls back
    /// to the local loader, the only tolerated wrong-owner path.
    pub async fn get_entry(&self, key: &str) -> Result<Entry> {
        let owner = self.ring.owner(key);
        if owner == self.self_addr {
            return self.local_entry(key).await;
        }

        match self.peers.fetch(&self.name, key, &owner).await {
            Ok(entry) => {
                self.peer_loads.fetch_add(1, Ordering::Relaxed);
                Ok(entry)
            }
            Err(err) => {
                self.peer_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "group {}: peer {} unreachable, loading locally: {err:#}",
                    self.name,
                    owner
                );
                self.local_entry(key).await
            }
        }
    }

    /// Serve from the local store only. The peer server uses this so lookups
    /// never chain across more than one hop while rings disagree.
    pub async fn local_entry(&self, key: &str) -> Result<Entry> {
        let loader = Arc::clone(&self.loader);
        let key_owned = key.to_string();
        self.store
            .get(key, move || async move {
                let (bytes, expiry) = loader.load(&key_owned).await?;
                Ok(Entry { bytes, expiry })
            })
            .await
            .map_err(|err| anyhow!("{err:#}"))
    }

    pub async fn stats(&self) -> GroupStats {
        let store = self.store.stats().await;
        GroupStats {
            hits: store.hits,
            misses: store.misses,
            evictions: store.evictions,
            used_bytes: store.used_bytes,
            peer_loads: self.peer_loads.load(Ordering::Relaxed),
            peer_errors: self.peer_errors.load(Ordering::Relaxed),
        }
    }
}

/// Shared name -> group map; the peer server resolves request paths
/// against it.
#[derive(Clone, Default)]
pub struct GroupRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<Group>>>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, group: Arc<Group>) {
        let mut map = self.inner.write().expect("group registry");
        map.insert(group.name().to_string(), group);
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<Group>> {
        let map = self.inner.read().expect("group registry");
        map.get(name).cloned()
    }
}
