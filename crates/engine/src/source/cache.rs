use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use serde_json::Value;
use stepwise_types::{FetchRequest, SourceEvent};
use stepwise_util::FetchError;
use tokio::{runtime::Handle, sync::broadcast};
use tracing::{debug, info, warn};

use super::fetch::{HttpFetcher, JsonFetcher};
use crate::config::CacheConfig;

const EVENT_CAPACITY: usize = 256;

/// What a caller observes for a request.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheStatus {
    /// A fetch is in flight; a [`SourceEvent`] will announce its settlement.
    Pending,
    Complete(Value),
    Failed(String),
}

#[derive(Debug, Clone)]
enum EntryState {
    Pending,
    Complete(Value),
    Failed(String),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    state: EntryState,
    /// Identifies the fetch that owns a pending entry.
    fetch_id: u64,
    settled_at: Option<Instant>,
    last_access: Instant,
}

impl CacheEntry {
    fn pending(fetch_id: u64, now: Instant) -> Self {
        Self {
            state: EntryState::Pending,
            fetch_id,
            settled_at: None,
            last_access: now,
        }
    }

    fn status(&self) -> CacheStatus {
        match &self.state {
            EntryState::Pending => CacheStatus::Pending,
            EntryState::Complete(value) => CacheStatus::Complete(value.clone()),
            EntryState::Failed(message) => CacheStatus::Failed(message.clone()),
        }
    }

    fn is_expired(&self, config: &CacheConfig, now: Instant) -> bool {
        let Some(settled_at) = self.settled_at else {
            return false;
        };
        let lifetime = match self.state {
            EntryState::Pending => return false,
            EntryState::Complete(_) => config.ttl(),
            EntryState::Failed(_) => config.failure_ttl(),
        };
        now.saturating_duration_since(settled_at) >= lifetime
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// Lease counts for keys that must survive capacity pressure.
    pins: HashMap<String, usize>,
    next_fetch_id: u64,
}

impl CacheState {
    /// Drop least recently used settled entries until the map fits
    /// `max_entries`. Pending, pinned, and `keep` entries are never chosen.
    fn evict_over_capacity(&mut self, max_entries: usize, keep: &str) {
        while self.entries.len() > max_entries {
            let victim = self
                .entries
                .iter()
                .filter(|(key, entry)| {
                    entry.settled_at.is_some() && key.as_str() != keep && !self.pins.contains_key(key.as_str())
                })
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(key, _)| key.clone());
            let Some(key) = victim else {
                debug!(entries = self.entries.len(), max_entries, "async source over capacity; every entry is in use");
                break;
            };
            debug!(key = %key, "async source entry evicted");
            self.entries.remove(&key);
        }
    }
}

struct Shared {
    state: Mutex<CacheState>,
    events: broadcast::Sender<SourceEvent>,
    config: CacheConfig,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, key: String, fetch_id: u64, result: anyhow::Result<Value>) {
        let now = Instant::now();
        let event = {
            let mut state = self.lock();
            let Some(entry) = state
                .entries
                .get_mut(&key)
                .filter(|entry| matches!(entry.state, EntryState::Pending) && entry.fetch_id == fetch_id)
            else {
                debug!(key = %key, fetch_id, "discarding settlement from a superseded fetch");
                return;
            };

            let event = match result {
                Ok(value) => {
                    info!(key = %key, "async source entry resolved");
                    entry.state = EntryState::Complete(value);
                    SourceEvent::Resolved { key: key.clone() }
                }
                Err(error) => {
                    let message = format!("{error:#}");
                    warn!(key = %key, error = %message, "async source entry failed");
                    entry.state = EntryState::Failed(message.clone());
                    SourceEvent::Failed {
                        key: key.clone(),
                        message,
                    }
                }
            };
            entry.settled_at = Some(now);
            entry.last_access = now;
            state.evict_over_capacity(self.config.max_entries, &key);
            event
        };

        // No subscribers is fine; the entry is still cached.
        let _ = self.events.send(event);
    }
}

/// Keys pinned by one leased view of the cache; released on drop.
struct Lease {
    shared: Arc<Shared>,
    keys: Mutex<HashSet<String>>,
}

impl Lease {
    fn pin(&self, state: &mut CacheState, key: &str) {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        if keys.insert(key.to_string()) {
            *state.pins.entry(key.to_string()).or_default() += 1;
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let keys = std::mem::take(self.keys.get_mut().unwrap_or_else(PoisonError::into_inner));
        let mut state = self.shared.lock();
        for key in keys {
            if let Some(count) = state.pins.get_mut(&key) {
                *count -= 1;
                if *count == 0 {
                    state.pins.remove(&key);
                }
            }
        }
        state.evict_over_capacity(self.shared.config.max_entries, "");
    }
}

/// Keyed cache of fetched JSON resources with in-flight de-duplication.
///
/// Completed entries live for `ttl`, failed entries for `failure_ttl` (a later
/// request retries them), and the map is capped at `max_entries` by dropping
/// the least recently used settled entries. Pending entries are never
/// evicted, and neither is anything requested through a live [`leased`]
/// view, so a pipeline whose working set exceeds the cap still converges.
///
/// [`leased`]: CachedSource::leased
#[derive(Clone)]
pub struct CachedSource {
    fetcher: Arc<dyn JsonFetcher>,
    shared: Arc<Shared>,
    runtime: Handle,
    lease: Option<Arc<Lease>>,
}

impl fmt::Debug for CachedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedSource")
            .field("config", &self.shared.config)
            .field("entries", &self.len())
            .field("leased", &self.lease.is_some())
            .finish()
    }
}

impl CachedSource {
    /// Source that spawns fetches on `runtime`.
    pub fn new(fetcher: Arc<dyn JsonFetcher>, config: CacheConfig, runtime: Handle) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            fetcher,
            shared: Arc::new(Shared {
                state: Mutex::new(CacheState::default()),
                events,
                config,
            }),
            runtime,
            lease: None,
        }
    }

    /// Source backed by the default HTTP fetcher.
    pub fn http(config: CacheConfig, runtime: Handle) -> Result<Self, FetchError> {
        let fetcher = HttpFetcher::new(config.request_timeout())?;
        Ok(Self::new(Arc::new(fetcher), config, runtime))
    }

    /// A view over the same cache whose requested keys stay pinned, exempt
    /// from capacity eviction, until the view and all its clones are dropped.
    /// Expiry still applies.
    pub fn leased(&self) -> Self {
        Self {
            fetcher: Arc::clone(&self.fetcher),
            shared: Arc::clone(&self.shared),
            runtime: self.runtime.clone(),
            lease: Some(Arc::new(Lease {
                shared: Arc::clone(&self.shared),
                keys: Mutex::new(HashSet::new()),
            })),
        }
    }

    /// Current status for `request`, starting a fetch on a miss.
    ///
    /// Only the first caller for a key spawns the fetch; callers arriving
    /// while it is in flight observe [`CacheStatus::Pending`].
    pub fn request(&self, request: &FetchRequest) -> CacheStatus {
        let key = request.cache_key();
        let fetch_id = {
            let mut state = self.shared.lock();
            let now = Instant::now();
            if let Some(lease) = &self.lease {
                lease.pin(&mut state, &key);
            }
            match state.entries.get_mut(&key) {
                Some(entry) if !entry.is_expired(&self.shared.config, now) => {
                    debug!(key = %key, "async source cache hit");
                    entry.last_access = now;
                    return entry.status();
                }
                Some(_) => {
                    debug!(key = %key, "async source entry expired; refetching");
                }
                None => {
                    debug!(key = %key, "async source cache miss");
                }
            }
            state.next_fetch_id += 1;
            let fetch_id = state.next_fetch_id;
            state.entries.insert(key.clone(), CacheEntry::pending(fetch_id, now));
            let config = &self.shared.config;
            state.entries.retain(|_, entry| !entry.is_expired(config, now));
            state.evict_over_capacity(config.max_entries, &key);
            fetch_id
        };

        let fetcher = Arc::clone(&self.fetcher);
        let shared = Arc::clone(&self.shared);
        let request = request.clone();
        debug!(key = %key, fetch_id, "async source fetch started");
        self.runtime.spawn(async move {
            let result = fetcher.fetch(&request).await;
            shared.settle(key, fetch_id, result);
        });
        CacheStatus::Pending
    }

    /// Receiver for settlement events.
    pub fn subscribe(&self) -> broadcast::Receiver<SourceEvent> {
        self.shared.events.subscribe()
    }

    /// Status for `key` without starting a fetch. Expired entries read as absent.
    pub fn peek(&self, key: &str) -> Option<CacheStatus> {
        let state = self.shared.lock();
        state
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired(&self.shared.config, Instant::now()))
            .map(CacheEntry::status)
    }

    /// Drop the entry for `key`. A fetch already in flight for it is
    /// superseded: its settlement is discarded and announces nothing.
    pub fn invalidate(&self, key: &str) -> bool {
        self.shared.lock().entries.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Notify;

    struct GatedFetcher {
        calls: AtomicUsize,
        gate: Notify,
        fail: bool,
    }

    impl GatedFetcher {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Notify::new(),
                fail,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl JsonFetcher for GatedFetcher {
        async fn fetch(&self, request: &FetchRequest) -> anyhow::Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            if self.fail {
                return Err(anyhow!("HTTP 500 from {}", request.url));
            }
            Ok(json!({ "url": request.url }))
        }
    }

    fn source(fetcher: Arc<GatedFetcher>, config: CacheConfig) -> CachedSource {
        CachedSource::new(fetcher, config, Handle::current())
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_fetch() {
        let fetcher = GatedFetcher::new(false);
        let source = source(Arc::clone(&fetcher), CacheConfig::default());
        let mut events = source.subscribe();
        let request = FetchRequest::new("https://example.com/items");

        assert_eq!(source.request(&request), CacheStatus::Pending);
        assert_eq!(source.request(&request), CacheStatus::Pending);

        fetcher.gate.notify_one();
        let event = events.recv().await.expect("event");
        assert_eq!(event, SourceEvent::Resolved { key: request.cache_key() });
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(
            source.request(&request),
            CacheStatus::Complete(json!({ "url": "https://example.com/items" }))
        );
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn failures_are_remembered_until_failure_ttl() {
        let fetcher = GatedFetcher::new(true);
        let source = source(Arc::clone(&fetcher), CacheConfig::default());
        let mut events = source.subscribe();
        let request = FetchRequest::new("https://example.com/broken");

        source.request(&request);
        fetcher.gate.notify_one();
        let event = events.recv().await.expect("event");
        assert!(matches!(event, SourceEvent::Failed { ref message, .. } if message.contains("HTTP 500")));

        match source.request(&request) {
            CacheStatus::Failed(message) => assert!(message.contains("HTTP 500")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn expired_failures_are_retried() {
        let fetcher = GatedFetcher::new(true);
        let config = CacheConfig {
            failure_ttl_sec: 0,
            ..Default::default()
        };
        let source = source(Arc::clone(&fetcher), config);
        let mut events = source.subscribe();
        let request = FetchRequest::new("https://example.com/flaky");

        source.request(&request);
        fetcher.gate.notify_one();
        events.recv().await.expect("event");

        assert_eq!(source.peek(&request.cache_key()), None);
        assert_eq!(source.request(&request), CacheStatus::Pending);
        fetcher.gate.notify_one();
        events.recv().await.expect("event");
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn least_recently_used_entries_are_evicted_first() {
        let fetcher = GatedFetcher::new(false);
        let config = CacheConfig {
            max_entries: 2,
            ..Default::default()
        };
        let source = source(Arc::clone(&fetcher), config);
        let mut events = source.subscribe();
        let first = FetchRequest::new("https://example.com/1");
        let second = FetchRequest::new("https://example.com/2");
        let third = FetchRequest::new("https://example.com/3");

        for request in [&first, &second] {
            source.request(request);
            fetcher.gate.notify_one();
            events.recv().await.expect("event");
        }
        assert_eq!(source.len(), 2);
        assert!(matches!(source.request(&first), CacheStatus::Complete(_)));

        assert_eq!(source.request(&third), CacheStatus::Pending);
        assert_eq!(source.len(), 2);
        assert!(matches!(source.peek(&first.cache_key()), Some(CacheStatus::Complete(_))));
        assert_eq!(source.peek(&second.cache_key()), None);
        assert_eq!(source.peek(&third.cache_key()), Some(CacheStatus::Pending));
    }

    #[tokio::test]
    async fn leased_keys_outlive_capacity_until_released() {
        let fetcher = GatedFetcher::new(false);
        let config = CacheConfig {
            max_entries: 1,
            ..Default::default()
        };
        let source = source(Arc::clone(&fetcher), config);
        let mut events = source.subscribe();
        let first = FetchRequest::new("https://example.com/a");
        let second = FetchRequest::new("https://example.com/b");

        let leased = source.leased();
        for request in [&first, &second] {
            leased.request(request);
            fetcher.gate.notify_one();
            events.recv().await.expect("event");
        }
        assert_eq!(source.len(), 2);
        assert!(matches!(leased.request(&first), CacheStatus::Complete(_)));
        assert!(matches!(leased.request(&second), CacheStatus::Complete(_)));
        assert_eq!(fetcher.calls(), 2);

        drop(leased);
        assert_eq!(source.len(), 1);
    }

    /// Each call waits on its own gate and returns its own value.
    struct SequencedFetcher {
        calls: AtomicUsize,
        gates: [Notify; 2],
        values: [Value; 2],
    }

    #[async_trait]
    impl JsonFetcher for SequencedFetcher {
        async fn fetch(&self, _request: &FetchRequest) -> anyhow::Result<Value> {
            let index = self.calls.fetch_add(1, Ordering::SeqCst);
            self.gates[index].notified().await;
            Ok(self.values[index].clone())
        }
    }

    #[tokio::test]
    async fn superseded_fetch_cannot_overwrite_a_newer_result() {
        let fetcher = Arc::new(SequencedFetcher {
            calls: AtomicUsize::new(0),
            gates: [Notify::new(), Notify::new()],
            values: [json!("old"), json!("fresh")],
        });
        let source = CachedSource::new(fetcher.clone(), CacheConfig::default(), Handle::current());
        let mut events = source.subscribe();
        let request = FetchRequest::new("https://example.com/x");
        let key = request.cache_key();
        let wait_for_calls = |count: usize| {
            let fetcher = Arc::clone(&fetcher);
            async move {
                while fetcher.calls.load(Ordering::SeqCst) < count {
                    tokio::task::yield_now().await;
                }
            }
        };

        assert_eq!(source.request(&request), CacheStatus::Pending);
        wait_for_calls(1).await;
        assert!(source.invalidate(&key));
        assert_eq!(source.request(&request), CacheStatus::Pending);
        wait_for_calls(2).await;

        fetcher.gates[1].notify_one();
        assert_eq!(events.recv().await.expect("event"), SourceEvent::Resolved { key: key.clone() });
        assert_eq!(source.peek(&key), Some(CacheStatus::Complete(json!("fresh"))));

        fetcher.gates[0].notify_one();
        let late = tokio::time::timeout(std::time::Duration::from_millis(100), events.recv()).await;
        assert!(late.is_err(), "superseded fetch announced a settlement: {late:?}");
        assert_eq!(source.peek(&key), Some(CacheStatus::Complete(json!("fresh"))));
    }

    #[tokio::test]
    async fn pending_entries_survive_capacity_pressure() {
        let fetcher = GatedFetcher::new(false);
        let config = CacheConfig {
            max_entries: 1,
            ..Default::default()
        };
        let source = source(Arc::clone(&fetcher), config);

        source.request(&FetchRequest::new("https://example.com/a"));
        source.request(&FetchRequest::new("https://example.com/b"));
        assert_eq!(source.len(), 2);
    }

    #[tokio::test]
    async fn invalidate_forces_a_new_fetch() {
        let fetcher = GatedFetcher::new(false);
        let source = source(Arc::clone(&fetcher), CacheConfig::default());
        let mut events = source.subscribe();
        let request = FetchRequest::new("https://example.com/items");

        source.request(&request);
        fetcher.gate.notify_one();
        events.recv().await.expect("event");

        assert!(source.invalidate(&request.cache_key()));
        assert!(source.is_empty());
        assert_eq!(source.request(&request), CacheStatus::Pending);
        fetcher.gate.notify_one();
        events.recv().await.expect("event");
        assert_eq!(fetcher.calls(), 2);
    }
}
