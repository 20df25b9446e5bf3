use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;

use model::TileIdentifier;

use crate::fetch::{FetchCompletion, TileFetcher};
use crate::unused_ring::UnusedRing;

pub const DEFAULT_UNUSED_CAPACITY: usize = 256;
pub const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureCacheConfig {
    /// Number of unreferenced textures kept before the oldest is evicted.
    pub unused_capacity: usize,
    pub max_concurrent_fetches: usize,
}

impl Default for TextureCacheConfig {
    fn default() -> Self {
        Self {
            unused_capacity: DEFAULT_UNUSED_CAPACITY,
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureCacheConfigError {
    ZeroUnusedCapacity,
    ZeroConcurrency,
}

impl fmt::Display for TextureCacheConfigError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TextureCacheConfigError::ZeroUnusedCapacity => {
                write!(formatter, "texture cache unused_capacity must be at least 1")
            }
            TextureCacheConfigError::ZeroConcurrency => {
                write!(
                    formatter,
                    "texture cache max_concurrent_fetches must be at least 1"
                )
            }
        }
    }
}

impl std::error::Error for TextureCacheConfigError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoadRequestId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Every identifier was already cached; nothing to wait for.
    Ready,
    Pending(LoadRequestId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// One identifier of `request` finished, successfully or not.
    TileSettled {
        request: LoadRequestId,
        identifier: TileIdentifier,
        loaded: bool,
    },
    /// All identifiers of `request` settled. Emitted once per request.
    RequestComplete { request: LoadRequestId },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub fetches_started: u64,
    pub fetches_failed: u64,
    pub evictions: u64,
    pub requests_completed: u64,
}

#[derive(Debug)]
struct CacheEntry<T> {
    refcount: u32,
    texture: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchState {
    Queued,
    Dispatched,
}

#[derive(Debug)]
struct LoadingRecord {
    claimants: BTreeSet<LoadRequestId>,
    state: FetchState,
}

#[derive(Debug)]
struct PendingRequest {
    remaining: HashSet<TileIdentifier>,
}

/// Session-wide cache of decoded tile textures shared by every grid.
///
/// Loads are deduplicated against cached and in-flight identifiers and
/// dispatched FIFO with bounded concurrency. Textures are reference counted
/// by the slots displaying them; unreferenced textures wait in an
/// [`UnusedRing`] and are dropped when it overflows.
///
/// Textures loaded by one `pump` stay out of the ring until the next `pump`,
/// so handlers of the returned events can always take a reference on them.
pub struct TextureCache<F: TileFetcher> {
    config: TextureCacheConfig,
    fetcher: F,
    entries: HashMap<TileIdentifier, CacheEntry<F::Texture>>,
    loading: HashMap<TileIdentifier, LoadingRecord>,
    queue: VecDeque<TileIdentifier>,
    requests: HashMap<LoadRequestId, PendingRequest>,
    unused: UnusedRing,
    fresh: Vec<TileIdentifier>,
    dispatched: usize,
    next_request_id: u64,
    evicted: Vec<TileIdentifier>,
    stats: CacheStats,
}

impl<F: TileFetcher> TextureCache<F> {
    pub fn new(config: TextureCacheConfig, fetcher: F) -> Result<Self, TextureCacheConfigError> {
        if config.unused_capacity == 0 {
            return Err(TextureCacheConfigError::ZeroUnusedCapacity);
        }
        if config.max_concurrent_fetches == 0 {
            return Err(TextureCacheConfigError::ZeroConcurrency);
        }
        Ok(Self {
            config,
            fetcher,
            entries: HashMap::new(),
            loading: HashMap::new(),
            queue: VecDeque::new(),
            requests: HashMap::new(),
            unused: UnusedRing::new(config.unused_capacity),
            fresh: Vec::new(),
            dispatched: 0,
            next_request_id: 0,
            evicted: Vec::new(),
            stats: CacheStats::default(),
        })
    }

    pub fn config(&self) -> TextureCacheConfig {
        self.config
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    pub fn fetcher_mut(&mut self) -> &mut F {
        &mut self.fetcher
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn is_cached(&self, identifier: &TileIdentifier) -> bool {
        self.entries.contains_key(identifier)
    }

    pub fn is_loading(&self, identifier: &TileIdentifier) -> bool {
        self.loading.contains_key(identifier)
    }

    pub fn is_queued(&self, identifier: &TileIdentifier) -> bool {
        self.loading
            .get(identifier)
            .is_some_and(|record| record.state == FetchState::Queued)
    }

    pub fn texture(&self, identifier: &TileIdentifier) -> Option<&F::Texture> {
        self.entries.get(identifier).map(|entry| &entry.texture)
    }

    pub fn refcount(&self, identifier: &TileIdentifier) -> Option<u32> {
        self.entries.get(identifier).map(|entry| entry.refcount)
    }

    pub fn cached_len(&self) -> usize {
        self.entries.len()
    }

    /// Cached textures nobody references.
    pub fn unused_len(&self) -> usize {
        self.unused.len() + self.fresh.len()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn dispatched_len(&self) -> usize {
        self.dispatched
    }

    pub fn pending_request_count(&self) -> usize {
        self.requests.len()
    }

    pub fn is_request_pending(&self, request: LoadRequestId) -> bool {
        self.requests.contains_key(&request)
    }

    pub fn load(&mut self, identifiers: impl IntoIterator<Item = TileIdentifier>) -> LoadOutcome {
        let mut remaining = HashSet::new();
        let mut ordered = Vec::new();
        for identifier in identifiers {
            if self.entries.contains_key(&identifier) {
                continue;
            }
            if remaining.insert(identifier.clone()) {
                ordered.push(identifier);
            }
        }
        if remaining.is_empty() {
            return LoadOutcome::Ready;
        }

        let request = LoadRequestId(self.next_request_id);
        self.next_request_id = self
            .next_request_id
            .checked_add(1)
            .unwrap_or_else(|| panic!("load request id overflow"));

        for identifier in ordered {
            match self.loading.get_mut(&identifier) {
                Some(record) => {
                    record.claimants.insert(request);
                }
                None => {
                    self.loading.insert(
                        identifier.clone(),
                        LoadingRecord {
                            claimants: BTreeSet::from([request]),
                            state: FetchState::Queued,
                        },
                    );
                    self.queue.push_back(identifier);
                }
            }
        }
        self.requests
            .insert(request, PendingRequest { remaining });
        self.dispatch_queued();
        LoadOutcome::Pending(request)
    }

    /// Drops `request`'s claims. Identifiers nobody else waits for are
    /// removed from the queue if they were not dispatched yet; dispatched
    /// fetches run to completion and their result is cached.
    pub fn cancel(&mut self, request: LoadRequestId) -> bool {
        let Some(pending) = self.requests.remove(&request) else {
            return false;
        };
        for identifier in pending.remaining {
            let Some(record) = self.loading.get_mut(&identifier) else {
                continue;
            };
            record.claimants.remove(&request);
            if record.claimants.is_empty() && record.state == FetchState::Queued {
                self.loading.remove(&identifier);
                self.queue.retain(|queued| *queued != identifier);
            }
        }
        true
    }

    /// Takes a reference on a cached texture. Returns `false` when the
    /// identifier is not cached.
    pub fn inc(&mut self, identifier: &TileIdentifier) -> bool {
        let Some(entry) = self.entries.get_mut(identifier) else {
            return false;
        };
        if entry.refcount == 0 && !self.unused.reclaim(identifier) {
            let Some(position) = self.fresh.iter().position(|fresh| fresh == identifier) else {
                panic!("unreferenced texture {identifier} missing from unused ring");
            };
            self.fresh.swap_remove(position);
        }
        entry.refcount = entry
            .refcount
            .checked_add(1)
            .unwrap_or_else(|| panic!("refcount overflow for {identifier}"));
        true
    }

    pub fn dec(&mut self, identifier: &TileIdentifier) {
        let Some(entry) = self.entries.get_mut(identifier) else {
            log::warn!("refcount decrement on untracked tile {identifier}");
            return;
        };
        if entry.refcount == 0 {
            log::warn!("refcount decrement below zero on tile {identifier}");
            return;
        }
        entry.refcount -= 1;
        if entry.refcount == 0 {
            self.mark_unused(identifier.clone());
        }
    }

    /// Applies finished fetches and starts queued ones. Call on the owning
    /// thread whenever the fetcher may have progressed.
    pub fn pump(&mut self) -> Vec<CacheEvent> {
        for identifier in std::mem::take(&mut self.fresh) {
            self.mark_unused(identifier);
        }
        let mut events = Vec::new();
        for completion in self.fetcher.poll_completions() {
            self.apply_completion(completion, &mut events);
        }
        self.dispatch_queued();
        events
    }

    /// Identifiers evicted since the previous call.
    pub fn drain_evicted(&mut self) -> Vec<TileIdentifier> {
        std::mem::take(&mut self.evicted)
    }

    fn apply_completion(
        &mut self,
        completion: FetchCompletion<F::Texture>,
        events: &mut Vec<CacheEvent>,
    ) {
        let FetchCompletion { identifier, result } = completion;
        let Some(record) = self.loading.remove(&identifier) else {
            log::warn!("ignoring completion for tile {identifier} that was never dispatched");
            return;
        };
        if record.state == FetchState::Dispatched {
            self.dispatched -= 1;
        }

        let loaded = match result {
            Ok(texture) => {
                if !self.entries.contains_key(&identifier) {
                    self.entries.insert(
                        identifier.clone(),
                        CacheEntry {
                            refcount: 0,
                            texture,
                        },
                    );
                    self.fresh.push(identifier.clone());
                }
                true
            }
            Err(error) => {
                self.stats.fetches_failed += 1;
                log::warn!("tile {identifier} failed to load: {error}");
                false
            }
        };

        for request in record.claimants {
            let Some(pending) = self.requests.get_mut(&request) else {
                continue;
            };
            pending.remaining.remove(&identifier);
            events.push(CacheEvent::TileSettled {
                request,
                identifier: identifier.clone(),
                loaded,
            });
            if pending.remaining.is_empty() {
                self.requests.remove(&request);
                self.stats.requests_completed += 1;
                events.push(CacheEvent::RequestComplete { request });
            }
        }
    }

    fn dispatch_queued(&mut self) {
        while self.dispatched < self.config.max_concurrent_fetches {
            let Some(identifier) = self.queue.pop_front() else {
                break;
            };
            let Some(record) = self.loading.get_mut(&identifier) else {
                continue;
            };
            record.state = FetchState::Dispatched;
            self.dispatched += 1;
            self.stats.fetches_started += 1;
            self.fetcher.begin_fetch(&identifier);
        }
    }

    fn mark_unused(&mut self, identifier: TileIdentifier) {
        let Some(evicted) = self.unused.insert(identifier) else {
            return;
        };
        if self.entries.remove(&evicted).is_none() {
            panic!("evicted tile {evicted} missing from texture cache");
        }
        self.stats.evictions += 1;
        log::debug!("evicted unused tile texture {evicted}");
        self.evicted.push(evicted);
    }
}

impl<F: TileFetcher> fmt::Debug for TextureCache<F> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("TextureCache")
            .field("config", &self.config)
            .field("cached", &self.entries.len())
            .field("unused", &self.unused_len())
            .field("queued", &self.queue.len())
            .field("dispatched", &self.dispatched)
            .field("requests", &self.requests.len())
            .field("stats", &self.stats)
            .finish()
    }
}
