use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::group::BoxFuture;
use crate::ring::Ring;

/// External enumeration of live peer addresses (`ip:port`). Cloud-specific
/// discoverers implement this outside the crate.
pub trait PeerSource: Send + Sync {
    fn enumerate(&self) -> BoxFuture<Result<Vec<String>>>;
}

/// Fixed list from configuration.
pub struct StaticPeerSource {
    addrs: Vec<String>,
}

impl StaticPeerSource {
    pub fn new(addrs: Vec<String>) -> Self {
        Self { addrs }
    }
}

impl PeerSource for StaticPeerSource {
    fn enumerate(&self) -> BoxFuture<Result<Vec<String>>> {
        let addrs = self.addrs.clone();
        Box::pin(async move { Ok(addrs) })
    }
}

/// Control loop pushing fresh peer sets into the ring. Enumeration failures
/// keep the previous set authoritative.
pub struct Discovery {
    ring: Arc<Ring>,
    source: Arc<dyn PeerSource>,
    self_addr: String,
    interval: Duration,
    force_single_task: bool,
}

impl Discovery {
    pub fn new(
        ring: Arc<Ring>,
        source: Arc<dyn PeerSource>,
        self_addr: String,
        interval: Duration,
        force_single_task: bool,
    ) -> Self {
        Self {
            ring,
            source,
            self_addr,
            interval,
            force_single_task,
        }
    }

    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        if self.force_single_task {
            log::info!("peer discovery: force_single_task, peer set pinned to self");
            self.ring
                .replace([self.self_addr.clone()].into_iter().collect());
            return;
        }

        self.tick().await;
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => self.tick().await,
            }
        }
    }

    pub async fn tick(&self) {
        match self.source.enumerate().await {
            Ok(addrs) => {
                let mut set: BTreeSet<String> = addrs.into_iter().collect();
                set.insert(self.self_addr.clone());
                log::debug!("peer discovery: {} peers", set.len());
                self.ring.replace(set);
            }
            Err(err) => {
                log::warn!("peer discovery failed, keeping previous peer set: {err:#}");
            }
        }
    }
}
