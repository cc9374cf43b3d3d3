//! LRU + TTL cache for minted leaf certificates.
//!
//! Generalizes the single-map, LRU-only cache pattern the proxy used to
//! keep per-host `ServerConfig`s in, adding a TTL and a periodic sweeper so
//! a cache entry for a host that's gone quiet eventually drops out even if
//! nothing ever evicts it by size.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cert::leaf::LeafBundle;

const DEFAULT_MAX_SIZE: usize = 1000;
const DEFAULT_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

struct Entry {
    bundle: Arc<LeafBundle>,
    inserted_at: Instant,
}

struct State {
    entries: HashMap<String, Entry>,
    /// Least-recently-used ordering, front = oldest. Kept in exact sync with
    /// `entries`'s keys.
    order: VecDeque<String>,
}

impl State {
    fn touch(&mut self, hostname: &str) {
        if let Some(pos) = self.order.iter().position(|h| h == hostname) {
            self.order.remove(pos);
        }
        self.order.push_back(hostname.to_string());
    }

    fn remove(&mut self, hostname: &str) {
        self.entries.remove(hostname);
        if let Some(pos) = self.order.iter().position(|h| h == hostname) {
            self.order.remove(pos);
        }
    }
}

/// Thread-safe cache of minted leaf certificates, keyed by hostname.
pub struct CertificateCache {
    state: Arc<Mutex<State>>,
    max_size: usize,
    ttl: Duration,
    token: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl CertificateCache {
    pub fn new() -> Arc<Self> {
        Self::with_params(DEFAULT_MAX_SIZE, DEFAULT_TTL, DEFAULT_CLEANUP_INTERVAL)
    }

    pub fn with_params(max_size: usize, ttl: Duration, cleanup_interval: Duration) -> Arc<Self> {
        let cache = Arc::new(Self {
            state: Arc::new(Mutex::new(State {
                entries: HashMap::new(),
                order: VecDeque::new(),
            })),
            max_size,
            ttl,
            token: CancellationToken::new(),
            sweeper: Mutex::new(None),
        });
        cache.clone().spawn_sweeper(cleanup_interval);
        cache
    }

    fn spawn_sweeper(self: Arc<Self>, cleanup_interval: Duration) {
        let state = self.state.clone();
        let ttl = self.ttl;
        let token = self.token.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(cleanup_interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        sweep_expired(&state, ttl);
                    }
                    _ = token.cancelled() => break,
                }
            }
        });
        *self.sweeper.lock().unwrap() = Some(handle);
    }

    /// Returns a cached bundle for `hostname` if present and not expired,
    /// marking it most-recently-used.
    pub fn get(&self, hostname: &str) -> Option<Arc<LeafBundle>> {
        let mut state = self.state.lock().unwrap();
        let expired = match state.entries.get(hostname) {
            Some(entry) => entry.inserted_at.elapsed() > self.ttl,
            None => return None,
        };
        if expired {
            state.remove(hostname);
            return None;
        }
        state.touch(hostname);
        state.entries.get(hostname).map(|e| e.bundle.clone())
    }

    /// Inserts a freshly minted bundle, evicting the least-recently-used
    /// entry first if the cache is already at `max_size`.
    pub fn put(&self, hostname: &str, bundle: Arc<LeafBundle>) {
        let mut state = self.state.lock().unwrap();
        if !state.entries.contains_key(hostname) && state.entries.len() >= self.max_size {
            if let Some(oldest) = state.order.pop_front() {
                state.entries.remove(&oldest);
            }
        }
        state.entries.insert(
            hostname.to_string(),
            Entry {
                bundle,
                inserted_at: Instant::now(),
            },
        );
        state.touch(hostname);
    }

    pub fn size(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    /// Stops the background sweeper task. Idempotent.
    pub fn stop(&self) {
        self.token.cancel();
    }
}

fn sweep_expired(state: &Arc<Mutex<State>>, ttl: Duration) {
    let mut state = state.lock().unwrap();
    let expired: Vec<String> = state
        .entries
        .iter()
        .filter(|(_, entry)| entry.inserted_at.elapsed() > ttl)
        .map(|(host, _)| host.clone())
        .collect();
    for host in expired {
        state.remove(&host);
    }
}

impl Drop for CertificateCache {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::ca::{KeyAlgorithm, RootCa};
    use crate::cert::leaf;

    fn dummy_bundle(ca: &RootCa, host: &str) -> Arc<LeafBundle> {
        Arc::new(leaf::mint(ca, host).unwrap())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn get_returns_none_for_missing_entry() {
        let cache = CertificateCache::new();
        assert!(cache.get("example.com").is_none());
        cache.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn put_then_get_round_trips() {
        let ca = RootCa::generate(KeyAlgorithm::EcdsaP256).unwrap();
        let cache = CertificateCache::new();
        let bundle = dummy_bundle(&ca, "example.com");
        cache.put("example.com", bundle.clone());
        let fetched = cache.get("example.com").unwrap();
        assert_eq!(fetched.cert_der, bundle.cert_der);
        cache.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn evicts_least_recently_used_entry_at_capacity() {
        let ca = RootCa::generate(KeyAlgorithm::EcdsaP256).unwrap();
        let cache = CertificateCache::with_params(2, Duration::from_secs(3600), Duration::from_secs(3600));

        cache.put("a.com", dummy_bundle(&ca, "a.com"));
        cache.put("b.com", dummy_bundle(&ca, "b.com"));
        // touch a.com so b.com becomes the LRU entry
        cache.get("a.com");
        cache.put("c.com", dummy_bundle(&ca, "c.com"));

        assert_eq!(cache.size(), 2);
        assert!(cache.get("b.com").is_none());
        assert!(cache.get("a.com").is_some());
        assert!(cache.get("c.com").is_some());
        cache.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sweeper_evicts_expired_entries_in_background() {
        let ca = RootCa::generate(KeyAlgorithm::EcdsaP256).unwrap();
        let cache = CertificateCache::with_params(
            10,
            Duration::from_millis(50),
            Duration::from_millis(10),
        );
        cache.put("example.com", dummy_bundle(&ca, "example.com"));
        assert_eq!(cache.size(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(cache.size(), 0);
        cache.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn order_matches_entries_keys_exactly() {
        let ca = RootCa::generate(KeyAlgorithm::EcdsaP256).unwrap();
        let cache = CertificateCache::with_params(5, Duration::from_secs(3600), Duration::from_secs(3600));
        cache.put("a.com", dummy_bundle(&ca, "a.com"));
        cache.put("b.com", dummy_bundle(&ca, "b.com"));

        let state = cache.state.lock().unwrap();
        let mut order_set: Vec<&String> = state.order.iter().collect();
        let mut key_set: Vec<&String> = state.entries.keys().collect();
        order_set.sort();
        key_set.sort();
        assert_eq!(order_set, key_set);
        drop(state);
        cache.stop();
    }
}
