use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use crc32fast::Hasher;

const DEFAULT_REPLICAS: usize = 64;

#[derive(Clone)]
struct RingPoint {
    hash: u32,
    peer_index: usize,
}

struct RingState {
    peers: Vec<String>,
    points: Vec<RingPoint>,
}

/// Consistent-hash map from cache key to owning peer address.
///
/// Every peer hashes each address at `replicas` virtual positions on the
/// crc32 space; a key is owned by the peer of the first position at or after
/// the key's hash, wrapping to the lowest. Ties are broken by lexicographic
/// address so all peers independently agree on the owner.
pub struct Ring {
    replicas: usize,
    state: RwLock<Arc<RingState>>,
}

impl Ring {
    pub fn new(self_addr: String) -> Self {
        Self::with_replicas(self_addr, DEFAULT_REPLICAS)
    }

    pub fn with_replicas(self_addr: String, replicas: usize) -> Self {
        let peers: BTreeSet<String> = [self_addr].into_iter().collect();
        let state = Arc::new(build_state(&peers, replicas));
        Self {
            replicas,
            state: RwLock::new(state),
        }
    }

    /// Owner of `key` under the current snapshot. Total: the peer set always
    /// contains at least self.
    pub fn owner(&self, key: &str) -> String {
        let state = {
            let guard = self.state.read().expect("ring");
            Arc::clone(&guard)
        };
        let hash = hash_bytes(key.as_bytes());
        // first virtual position at or after the key hash, wrapping to the
        // lowest; equal hashes resolve to the lexicographically first peer
        let mut idx = state.points.partition_point(|p| p.hash < hash);
        if idx >= state.points.len() {
            idx = 0;
        }
        state.peers[state.points[idx].peer_index].clone()
    }

    /// Swap in a new peer set as one snapshot. Replacing with an identical
    /// set is a no-op.
    pub fn replace(&self, peers: BTreeSet<String>) {
        if peers.is_empty() {
            return;
        }
        {
            let guard = self.state.read().expect("ring");
            if guard.peers.len() == peers.len()
                && guard.peers.iter().all(|p| peers.contains(p))
            {
                return;
            }
        }
        let state = Arc::new(build_state(&peers, self.replicas));
        let mut guard = self.state.write().expect("ring");
        *guard = state;
    }

    pub fn peers(&self) -> Vec<String> {
        let guard = self.state.read().expect("ring");
        guard.peers.clone()
    }
}

fn build_state(peers: &BTreeSet<String>, replicas: usize) -> RingState {
    // BTreeSet iteration is lexicographic, which fixes peer_index ordering
    // for the tie-break below.
    let peers: Vec<String> = peers.iter().cloned().collect();
    let mut points = Vec::with_capacity(peers.len() * replicas);
    for (peer_index, addr) in peers.iter().enumerate() {
        for replica in 0..replicas {
            let hash = hash_bytes(format!("{addr}#{replica}").as_bytes());
            points.push(RingPoint { hash, peer_index });
        }
    }
    points.sort_by(|a, b| a.hash.cmp(&b.hash).then(a.peer_index.cmp(&b.peer_index)));
    RingState { peers, points }
}

fn hash_bytes(input: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(input);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_set(addrs: &[&str]) -> BTreeSet<String> {
        addrs.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn single_peer_owns_everything() {
        let ring = Ring::new("10.0.0.1:5000".to_string());
        for i in 0..100 {
            assert_eq!(ring.owner(&format!("GET /key/{i}")), "10.0.0.1:5000");
        }
    }

    #[test]
    fn owner_is_deterministic_across_instances() {
        let peers = peer_set(&["10.0.0.1:5000", "10.0.0.2:5000", "10.0.0.3:5000"]);

        let a = Ring::new("10.0.0.1:5000".to_string());
        a.replace(peers.clone());
        let b = Ring::new("10.0.0.3:5000".to_string());
        b.replace(peers);

        for i in 0..500 {
            let key = format!("GET /path/{i}?q={i}");
            assert_eq!(a.owner(&key), b.owner(&key), "key {key}");
        }
    }

    #[test]
    fn replace_with_identical_set_keeps_snapshot() {
        let ring = Ring::new("10.0.0.1:5000".to_string());
        ring.replace(peer_set(&["10.0.0.1:5000", "10.0.0.2:5000"]));
        let before: Vec<String> = (0..50).map(|i| ring.owner(&format!("k{i}"))).collect();
        ring.replace(peer_set(&["10.0.0.2:5000", "10.0.0.1:5000"]));
        let after: Vec<String> = (0..50).map(|i| ring.owner(&format!("k{i}"))).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn removing_one_peer_moves_bounded_share_of_keys() {
        use rand::distributions::Alphanumeric;
        use rand::{Rng, SeedableRng};

        let all = peer_set(&[
            "10.0.0.1:5000",
            "10.0.0.2:5000",
            "10.0.0.3:5000",
            "10.0.0.4:5000",
            "10.0.0.5:5000",
        ]);
        let ring = Ring::new("10.0.0.1:5000".to_string());
        ring.replace(all.clone());

        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let keys: Vec<String> = (0..2000)
            .map(|_| {
                let s: String = (&mut rng)
                    .sample_iter(&Alphanumeric)
                    .take(24)
                    .map(char::from)
                    .collect();
                format!("GET /{s}")
            })
            .collect();

        let before: Vec<String> = keys.iter().map(|k| ring.owner(k)).collect();

        let mut smaller = all.clone();
        smaller.remove("10.0.0.4:5000");
        ring.replace(smaller);

        let mut moved = 0usize;
        for (key, old_owner) in keys.iter().zip(&before) {
            let new_owner = ring.owner(key);
            if &new_owner != old_owner {
                // keys may only move off the removed peer
                assert_eq!(old_owner, "10.0.0.4:5000", "key {key} moved from live peer");
                moved += 1;
            }
        }
        // expected share is |keys|/|peers| = 400; allow generous slack for
        // virtual-node imbalance
        assert!(moved > 200 && moved < 700, "moved {moved} of {}", keys.len());
    }

    #[test]
    fn empty_replace_is_ignored() {
        let ring = Ring::new("10.0.0.1:5000".to_string());
        ring.replace(BTreeSet::new());
        assert_eq!(ring.owner("GET /x"), "10.0.0.1:5000");
    }
}
