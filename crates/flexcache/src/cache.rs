//! FlexCache: two-level render cache over cost-weighted LRU lists
//!
//! Level one maps a resource to its variation map, level two maps a
//! [`Variation`] to a rendered [`CacheEntry`]. Entries are budgeted by bytes,
//! resources by count. Both lists live next to the maps under one lock, which
//! is also the atomicity boundary of the bulk clears: a sweep never
//! interleaves with a concurrent `get` or `put`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use ahash::RandomState;
use flexlru::{Admission, LruList, NodeId, Weighted};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::FlexCacheConfig;
use crate::entry::CacheEntry;
use crate::error::Result;
use crate::events::{ClearAction, Event, EventBus, EventListener, Principal, Subscription};
use crate::key::ResourceKey;
use crate::repository;
use crate::request::{Project, RequestKey, ResourceName};
use crate::stats::CacheStats;
use crate::variation::Variation;

const INITIAL_CAPACITY_CACHE: usize = 512;
const INITIAL_CAPACITY_VARIATIONS: usize = 8;

/// Entry as linked into the byte-budgeted list
///
/// Knows where it is referenced from so an eviction can detach it.
struct EntryNode {
    resource: ResourceName,
    variation: Variation,
    entry: Arc<CacheEntry>,
}

impl Weighted for EntryNode {
    fn cost(&self) -> usize {
        self.entry.byte_size()
    }
}

/// Resource as linked into the count-budgeted list
struct ResourceNode {
    resource: ResourceName,
}

impl Weighted for ResourceNode {
    fn cost(&self) -> usize {
        1
    }
}

struct VariationMap {
    key: Arc<ResourceKey>,
    node: NodeId,
    variations: HashMap<Variation, NodeId, RandomState>,
}

struct CacheState {
    resources: HashMap<ResourceName, VariationMap, RandomState>,
    entries: LruList<EntryNode>,
    keys: LruList<ResourceNode>,
    max_keys: usize,
}

impl CacheState {
    fn new(config: &FlexCacheConfig) -> Self {
        Self {
            resources: HashMap::with_capacity_and_hasher(INITIAL_CAPACITY_CACHE, RandomState::new()),
            entries: LruList::new(config.entry_limits()),
            keys: LruList::new(config.resource_limits()),
            max_keys: config.max_keys,
        }
    }

    /// Create the variation map of a resource
    ///
    /// Returns `false` if the resource budget dropped the new map right away.
    fn register(&mut self, resource: &ResourceName, key: Arc<ResourceKey>) -> bool {
        let node = ResourceNode {
            resource: resource.clone(),
        };
        match self.keys.add(node) {
            Admission::Admitted { id, evicted } => {
                self.drop_resources(evicted);
                if !self.keys.contains(id) {
                    return false;
                }
                self.resources.insert(
                    resource.clone(),
                    VariationMap {
                        key,
                        node: id,
                        variations: HashMap::with_capacity_and_hasher(
                            INITIAL_CAPACITY_VARIATIONS,
                            RandomState::new(),
                        ),
                    },
                );
                debug!(resource = %resource, "registered cache key");

                while self.resources.len() > self.max_keys {
                    let Some(coldest) = self.keys.pop_lru() else {
                        break;
                    };
                    self.drop_resources(vec![coldest]);
                }
                true
            }
            Admission::Rejected(_) => false,
        }
    }

    /// Detach evicted entries from their variation maps
    fn detach_entries(&mut self, evicted: Vec<(NodeId, EntryNode)>) -> usize {
        let count = evicted.len();
        for (id, node) in evicted {
            if let Some(map) = self.resources.get_mut(&node.resource) {
                // The slot may already hold a newer entry for this variation
                if map.variations.get(&node.variation) == Some(&id) {
                    map.variations.remove(&node.variation);
                }
            }
            debug!(resource = %node.resource, variation = %node.variation, "evicted cache entry");
        }
        count
    }

    /// Drop resources evicted from the resource list together with their entries
    fn drop_resources(&mut self, evicted: Vec<(NodeId, ResourceNode)>) {
        for (_, node) in evicted {
            if let Some(map) = self.resources.remove(&node.resource) {
                for id in map.variations.into_values() {
                    self.entries.remove(id);
                }
            }
            debug!(resource = %node.resource, "evicted cached resource");
        }
    }

    fn remove_entry(&mut self, resource: &ResourceName, variation: &Variation) -> bool {
        let Some(map) = self.resources.get_mut(resource) else {
            return false;
        };
        let Some(id) = map.variations.remove(variation) else {
            return false;
        };
        self.entries.remove(id).is_some()
    }

    /// Drop all entries of a resource, keeping its key
    fn clear_entries_of(&mut self, resource: &ResourceName) -> usize {
        let Some(map) = self.resources.get_mut(resource) else {
            return 0;
        };
        let ids: Vec<NodeId> = map.variations.drain().map(|(_, id)| id).collect();
        for id in &ids {
            self.entries.remove(*id);
        }
        ids.len()
    }

    /// Drop a resource together with its key and entries
    fn remove_resource(&mut self, resource: &ResourceName) -> usize {
        let Some(map) = self.resources.remove(resource) else {
            return 0;
        };
        let count = map.variations.len();
        for id in map.variations.into_values() {
            self.entries.remove(id);
        }
        self.keys.remove(map.node);
        count
    }

    fn clear(&mut self) {
        self.resources.clear();
        self.entries.clear();
        self.keys.clear();
    }
}

/// Render-output cache shared by all request threads
pub struct FlexCache {
    config: FlexCacheConfig,
    state: RwLock<CacheState>,
    stats: CacheStats,
    clock: Arc<dyn Clock>,
    _subscription: Option<Subscription>,
}

impl FlexCache {
    /// Create a cache using the system clock, without event subscription
    pub fn new(config: FlexCacheConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a cache with an explicit clock, without event subscription
    pub fn with_clock(config: FlexCacheConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, clock, None))
    }

    /// Create a cache that listens for invalidation events on `bus`
    ///
    /// The subscription lives exactly as long as the cache. A disabled cache
    /// does not subscribe.
    pub fn attach(
        config: FlexCacheConfig,
        clock: Arc<dyn Clock>,
        bus: &Arc<EventBus>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new_cyclic(|cache: &Weak<FlexCache>| {
            let subscription = if config.enabled {
                let listener: Weak<dyn EventListener> = cache.clone();
                Some(bus.subscribe(listener))
            } else {
                None
            };
            Self::build(config, clock, subscription)
        }))
    }

    fn build(
        config: FlexCacheConfig,
        clock: Arc<dyn Clock>,
        subscription: Option<Subscription>,
    ) -> Self {
        info!(
            enabled = config.enabled,
            cache_offline = config.cache_offline,
            max_cache_bytes = config.max_cache_bytes,
            max_variations = config.max_variations,
            max_keys = config.max_keys,
            "initializing flex cache"
        );
        Self {
            state: RwLock::new(CacheState::new(&config)),
            config,
            stats: CacheStats::new(),
            clock,
            _subscription: subscription,
        }
    }

    /// Check if the cache is enabled
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Check if offline resources are cached
    pub fn cache_offline(&self) -> bool {
        self.config.cache_offline
    }

    /// Configuration the cache was built with
    pub fn config(&self) -> &FlexCacheConfig {
        &self.config
    }

    /// Get cache statistics
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    fn accepts(&self, resource: &ResourceName) -> bool {
        self.config.enabled && (self.config.cache_offline || resource.project() == Project::Online)
    }

    /// Get the parsed cache key of a resource
    pub fn get_key(&self, resource: &ResourceName) -> Option<Arc<ResourceKey>> {
        if !self.config.enabled {
            return None;
        }
        let mut guard = self.state.write();
        let state = &mut *guard;
        let map = state.resources.get(resource)?;
        state.keys.touch(map.node);
        Some(Arc::clone(&map.key))
    }

    /// Register the parsed cache key of a resource
    ///
    /// Does nothing if the resource already has a key.
    pub fn put_key(&self, resource: &ResourceName, key: ResourceKey) {
        if !self.accepts(resource) {
            return;
        }
        let mut state = self.state.write();
        if !state.resources.contains_key(resource) {
            state.register(resource, Arc::new(key));
        }
    }

    /// Look up the entry a request would be served from
    ///
    /// An entry found past its timeout is evicted and reported as a miss.
    pub fn get(&self, request: &RequestKey) -> Option<Arc<CacheEntry>> {
        if !self.config.enabled {
            return None;
        }
        let resource = request.resource();
        let mut guard = self.state.write();
        let state = &mut *guard;

        let Some(map) = state.resources.get(resource) else {
            debug!(resource = %resource, "no cached key for resource");
            self.stats.record_miss();
            return None;
        };
        state.keys.touch(map.node);

        let Some(variation) = map.key.match_request(request) else {
            debug!(resource = %resource, "resource not cacheable for this request");
            self.stats.record_miss();
            return None;
        };

        let Some(&id) = map.variations.get(&variation) else {
            debug!(resource = %resource, variation = %variation, "no entry for variation");
            self.stats.record_miss();
            return None;
        };
        let timeout = map.key.timeout();

        let Some(node) = state.entries.get(id) else {
            self.stats.record_miss();
            return None;
        };

        if timeout.is_some() && node.entry.is_expired(request.timestamp_millis()) {
            debug!(resource = %resource, variation = %variation, "entry reached timeout");
            state.remove_entry(resource, &variation);
            self.stats.record_expiration();
            self.stats.record_miss();
            return None;
        }

        let entry = Arc::clone(&node.entry);
        state.entries.touch(id);
        self.stats.record_hit();
        debug!(resource = %resource, variation = %variation, "cache hit");
        Some(entry)
    }

    /// Check if a request would be served from the cache
    pub fn contains(&self, request: &RequestKey) -> bool {
        self.get(request).is_some()
    }

    /// Store a rendered entry under a variation
    ///
    /// A `None` variation means the response must not be cached; nothing is
    /// touched and `false` is returned. Otherwise the entry is completed,
    /// given the timeout of the registered key and submitted to the byte
    /// budget. `key` is registered when the resource has none yet. Returns
    /// whether the entry is now cached.
    pub fn put(
        &self,
        resource: &ResourceName,
        key: &ResourceKey,
        mut entry: CacheEntry,
        variation: Option<Variation>,
    ) -> bool {
        if !self.accepts(resource) {
            return false;
        }
        let Some(variation) = variation else {
            debug!(resource = %resource, "response not cacheable, nothing stored");
            return false;
        };

        let mut guard = self.state.write();
        let state = &mut *guard;

        if !state.resources.contains_key(resource) && !state.register(resource, Arc::new(key.clone())) {
            self.stats.record_rejection();
            return false;
        }
        let Some(map) = state.resources.get(resource) else {
            return false;
        };

        // The registered key decides the timeout, it is what lookups check
        entry.complete();
        if let Some(minutes) = map.key.timeout() {
            entry.set_timeout(minutes, self.clock.now_millis());
        }
        let entry = Arc::new(entry);

        if map.variations.contains_key(&variation) {
            state.remove_entry(resource, &variation);
        }

        let node = EntryNode {
            resource: resource.clone(),
            variation: variation.clone(),
            entry,
        };
        match state.entries.add(node) {
            Admission::Rejected(node) => {
                debug!(
                    resource = %resource,
                    bytes = node.entry.byte_size(),
                    "entry too large, not cached"
                );
                self.stats.record_rejection();
                false
            }
            Admission::Admitted { id, evicted } => {
                let evicted = state.detach_entries(evicted);
                self.stats.record_evictions(evicted);

                if !state.entries.contains(id) {
                    self.stats.record_rejection();
                    return false;
                }
                let Some(map) = state.resources.get_mut(resource) else {
                    state.entries.remove(id);
                    return false;
                };
                map.variations.insert(variation, id);
                let map_node = map.node;
                state.keys.touch(map_node);

                self.stats.record_insert();
                debug!(resource = %resource, "entry added");
                true
            }
        }
    }

    /// Drop the entry stored under a variation, keeping the resource key
    pub fn remove(&self, resource: &ResourceName, variation: &Variation) -> bool {
        if !self.config.enabled {
            return false;
        }
        self.state.write().remove_entry(resource, variation)
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    /// Number of resources with a registered key
    pub fn key_count(&self) -> usize {
        self.state.read().resources.len()
    }

    /// Check if no resource is registered
    pub fn is_empty(&self) -> bool {
        self.state.read().resources.is_empty()
    }

    /// Summed cost of all cached entries
    pub fn total_bytes(&self) -> usize {
        self.state.read().entries.total_cost()
    }

    /// Names of all registered resources (administrators only)
    pub fn cached_resources(&self, principal: &dyn Principal) -> Option<Vec<ResourceName>> {
        if !self.config.enabled || !principal.is_admin() {
            return None;
        }
        let mut names: Vec<ResourceName> = self.state.read().resources.keys().cloned().collect();
        names.sort();
        Some(names)
    }

    /// Variations cached for a resource (administrators only)
    pub fn cached_variations(
        &self,
        principal: &dyn Principal,
        resource: &ResourceName,
    ) -> Option<Vec<Variation>> {
        if !self.config.enabled || !principal.is_admin() {
            return None;
        }
        let mut guard = self.state.write();
        let state = &mut *guard;
        let map = state.resources.get(resource)?;
        state.keys.touch(map.node);
        let mut variations: Vec<Variation> = map.variations.keys().cloned().collect();
        variations.sort();
        Some(variations)
    }

    /// Cache key of a resource (administrators only)
    pub fn cached_key(
        &self,
        principal: &dyn Principal,
        resource: &ResourceName,
    ) -> Option<Arc<ResourceKey>> {
        if !principal.is_admin() {
            return None;
        }
        self.get_key(resource)
    }

    /// Run a clear action (administrators only)
    ///
    /// Returns whether the clear was carried out.
    pub fn clear(&self, principal: &dyn Principal, action: ClearAction) -> bool {
        if !self.config.enabled || !principal.is_admin() {
            return false;
        }
        match action {
            ClearAction::All => self.clear_everything(),
            ClearAction::Entries => self.sweep(None, true),
            ClearAction::OnlineAll => self.sweep(Some(Project::Online), false),
            ClearAction::OnlineEntries => self.sweep(Some(Project::Online), true),
            ClearAction::OfflineAll => self.sweep(Some(Project::Offline), false),
            ClearAction::OfflineEntries => self.sweep(Some(Project::Offline), true),
        }
        true
    }

    /// Drop all keys and entries
    pub fn clear_all(&self, principal: &dyn Principal) -> bool {
        self.clear(principal, ClearAction::All)
    }

    /// Drop all entries, keeping the keys
    pub fn clear_entries(&self, principal: &dyn Principal) -> bool {
        self.clear(principal, ClearAction::Entries)
    }

    /// Drop keys and entries of online resources
    pub fn clear_online(&self, principal: &dyn Principal) -> bool {
        self.clear(principal, ClearAction::OnlineAll)
    }

    /// Drop entries of online resources
    pub fn clear_online_entries(&self, principal: &dyn Principal) -> bool {
        self.clear(principal, ClearAction::OnlineEntries)
    }

    /// Drop keys and entries of offline resources
    pub fn clear_offline(&self, principal: &dyn Principal) -> bool {
        self.clear(principal, ClearAction::OfflineAll)
    }

    /// Drop entries of offline resources
    pub fn clear_offline_entries(&self, principal: &dyn Principal) -> bool {
        self.clear(principal, ClearAction::OfflineEntries)
    }

    /// Delete the materialized output repository, then clear the cache
    ///
    /// Allowed for administrators and for event-controlled callers. Returns
    /// whether the purge was carried out.
    pub fn purge_repository(&self, principal: &dyn Principal) -> Result<bool> {
        if !principal.is_admin() && !principal.is_event_controlled() {
            return Ok(false);
        }
        if let Some(dir) = &self.config.repository {
            let removed = repository::purge(dir)?;
            info!(repository = %dir.display(), removed, "output repository purged");
        }
        if self.config.enabled {
            self.clear_everything();
        }
        Ok(true)
    }

    fn clear_everything(&self) {
        self.state.write().clear();
        info!("complete flex cache cleared");
    }

    fn sweep(&self, project: Option<Project>, entries_only: bool) {
        let mut state = self.state.write();
        let targets: Vec<ResourceName> = state
            .resources
            .keys()
            .filter(|resource| project.map_or(true, |p| resource.project() == p))
            .cloned()
            .collect();

        let mut entries = 0;
        for resource in &targets {
            entries += if entries_only {
                state.clear_entries_of(resource)
            } else {
                state.remove_resource(resource)
            };
        }
        info!(
            project = ?project,
            entries_only,
            resources = targets.len(),
            entries,
            "flex cache partially cleared"
        );
    }
}

impl EventListener for FlexCache {
    fn on_event(&self, event: &Event) {
        if !self.config.enabled {
            return;
        }
        match event {
            Event::PublishProject | Event::ClearCaches => {
                debug!("received invalidation event, clearing cache");
                self.clear_everything();
            }
            Event::PurgeRepository { principal } => {
                if let Err(e) = self.purge_repository(principal.as_ref()) {
                    warn!(error = %e, "repository purge failed");
                }
            }
            Event::CacheClear { principal, action } => match ClearAction::try_from(*action) {
                Ok(action) => {
                    self.clear(principal.as_ref(), action);
                }
                Err(code) => debug!(code, "ignoring unknown clear action"),
            },
        }
    }
}

impl fmt::Debug for FlexCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("FlexCache")
            .field("enabled", &self.config.enabled)
            .field("resources", &state.resources.len())
            .field("entries", &state.entries.len())
            .field("bytes", &state.entries.total_cost())
            .field("clock", &self.clock)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::entry::{Headers, PlaybackSink};
    use crate::events::Caller;
    use crate::request::Params;
    use bytes::Bytes;
    use chrono::NaiveDate;
    use std::thread;
    use tempfile::TempDir;

    fn at(hour: u32, minute: u32) -> u64 {
        NaiveDate::from_ymd_opt(2024, 3, 14)
            .and_then(|d| d.and_hms_opt(hour, minute, 0))
            .unwrap()
            .and_utc()
            .timestamp_millis() as u64
    }

    fn small_config() -> FlexCacheConfig {
        FlexCacheConfig {
            max_cache_bytes: 100,
            avg_cache_bytes: 60,
            max_entry_bytes: 50,
            ..Default::default()
        }
    }

    fn entry(content: &str) -> CacheEntry {
        let mut entry = CacheEntry::new();
        entry.add_output(Bytes::copy_from_slice(content.as_bytes()));
        entry
    }

    fn request(resource: &ResourceName, at_millis: u64) -> RequestKey {
        RequestKey::builder(resource.clone())
            .uri("/index.html")
            .group("guests")
            .timestamp_millis(at_millis)
            .build()
    }

    /// Store `content` the way a renderer would after a miss
    fn render(cache: &FlexCache, req: &RequestKey, directives: &str, content: &str) -> bool {
        let resource = req.resource();
        let key = match cache.get_key(resource) {
            Some(key) => key,
            None => {
                cache.put_key(resource, ResourceKey::parse(directives));
                cache
                    .get_key(resource)
                    .unwrap_or_else(|| Arc::new(ResourceKey::parse(directives)))
            }
        };
        let variation = key.match_request(req);
        cache.put(resource, &key, entry(content), variation)
    }

    fn body(entry: &CacheEntry) -> String {
        entry
            .elements()
            .iter()
            .map(|e| match e {
                crate::entry::Element::Output(b) => String::from_utf8_lossy(b).into_owned(),
                crate::entry::Element::Include { target, .. } => format!("<{}>", target),
            })
            .collect()
    }

    fn assert_consistent(cache: &FlexCache) {
        let state = cache.state.read();
        let mapped: usize = state.resources.values().map(|m| m.variations.len()).sum();
        assert_eq!(mapped, state.entries.len());
        assert_eq!(state.resources.len(), state.keys.len());
        for map in state.resources.values() {
            assert!(state.keys.contains(map.node));
            for id in map.variations.values() {
                assert!(state.entries.contains(*id));
            }
        }
    }

    #[test]
    fn test_put_and_get() {
        let cache = FlexCache::new(FlexCacheConfig::default()).unwrap();
        let resource = ResourceName::online("/a.jsp");
        let req = request(&resource, 0);

        assert!(cache.get(&req).is_none());
        assert!(render(&cache, &req, "always", "hello"));

        let hit = cache.get(&req).unwrap();
        assert_eq!(body(&hit), "hello");
        assert!(hit.is_completed());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.key_count(), 1);
        assert_eq!(cache.total_bytes(), 5);
        assert_eq!(cache.stats().hits(), 1);
        assert_eq!(cache.stats().misses(), 1);
        assert_consistent(&cache);
    }

    #[test]
    fn test_variations_are_separate() {
        let cache = FlexCache::new(FlexCacheConfig::default()).unwrap();
        let resource = ResourceName::online("/list.jsp");
        let page = |n: &str| {
            RequestKey::builder(resource.clone())
                .param("page", n)
                .timestamp_millis(0)
                .build()
        };

        assert!(render(&cache, &page("1"), "params=(page)", "first"));
        assert!(render(&cache, &page("2"), "params=(page)", "second"));

        assert_eq!(body(&cache.get(&page("1")).unwrap()), "first");
        assert_eq!(body(&cache.get(&page("2")).unwrap()), "second");
        assert!(cache.get(&page("3")).is_none());

        let variations = cache.cached_variations(&Caller::ADMIN, &resource).unwrap();
        let rendered: Vec<String> = variations.iter().map(|v| v.to_string()).collect();
        assert_eq!(rendered, vec!["params=(page=1)", "params=(page=2)"]);
    }

    #[test]
    fn test_put_without_variation_changes_nothing() {
        let cache = FlexCache::new(FlexCacheConfig::default()).unwrap();
        let resource = ResourceName::online("/a.jsp");
        let key = ResourceKey::parse("never");

        assert!(!cache.put(&resource, &key, entry("x"), None));
        assert!(cache.is_empty());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.total_bytes(), 0);
        assert_eq!(cache.stats().inserts(), 0);
        assert_eq!(cache.stats().rejections(), 0);
    }

    #[test]
    fn test_never_key_is_registered_but_never_hits() {
        let cache = FlexCache::new(FlexCacheConfig::default()).unwrap();
        let resource = ResourceName::online("/a.jsp");
        let req = request(&resource, 0);

        assert!(!render(&cache, &req, "always;never", "x"));
        assert_eq!(cache.key_count(), 1);
        assert!(cache.get(&req).is_none());
        assert!(!cache.get_key(&resource).unwrap().is_cacheable());
    }

    #[test]
    fn test_replace_existing_variation() {
        let cache = FlexCache::new(FlexCacheConfig::default()).unwrap();
        let resource = ResourceName::online("/a.jsp");
        let req = request(&resource, 0);

        assert!(render(&cache, &req, "uri", "old"));
        assert!(render(&cache, &req, "uri", "newer"));

        assert_eq!(body(&cache.get(&req).unwrap()), "newer");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_bytes(), 5);
        assert_consistent(&cache);
    }

    #[test]
    fn test_oversized_entry_is_not_cached() {
        let cache = FlexCache::new(small_config()).unwrap();
        let resource = ResourceName::online("/big.jsp");
        let req = request(&resource, 0);

        assert!(!render(&cache, &req, "always", &"x".repeat(51)));
        assert!(cache.get(&req).is_none());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.total_bytes(), 0);
        assert_eq!(cache.stats().rejections(), 1);

        // Replacing a cached entry with an oversized one leaves nothing behind
        assert!(render(&cache, &req, "always", "small"));
        assert!(!render(&cache, &req, "always", &"x".repeat(51)));
        assert!(cache.get(&req).is_none());
        assert_consistent(&cache);
    }

    #[test]
    fn test_byte_budget_evicts_least_recent() {
        let cache = FlexCache::new(small_config()).unwrap();
        let resources: Vec<ResourceName> =
            (0..6).map(|i| ResourceName::online(format!("/{}.jsp", i))).collect();

        for resource in &resources[..5] {
            assert!(render(&cache, &request(resource, 0), "always", &"x".repeat(20)));
        }
        assert_eq!(cache.total_bytes(), 100);

        // Keep /0 warm, so /1../3 are the coldest
        assert!(cache.get(&request(&resources[0], 0)).is_some());
        assert!(render(&cache, &request(&resources[5], 0), "always", &"x".repeat(20)));

        assert!(cache.total_bytes() <= 60);
        assert_eq!(cache.stats().evictions(), 3);
        for (i, resource) in resources.iter().enumerate() {
            let cached = cache.get(&request(resource, 0)).is_some();
            assert_eq!(cached, [0, 4, 5].contains(&i), "resource {}", i);
        }
        // Keys survive entry eviction
        assert_eq!(cache.key_count(), 6);
        assert_consistent(&cache);
    }

    #[test]
    fn test_key_ceiling_drops_coldest_resource() {
        let config = FlexCacheConfig {
            max_keys: 4,
            ..Default::default()
        };
        let cache = FlexCache::new(config).unwrap();
        let resources: Vec<ResourceName> =
            (0..5).map(|i| ResourceName::online(format!("/{}.jsp", i))).collect();

        for resource in &resources[..4] {
            assert!(render(&cache, &request(resource, 0), "always", "content"));
        }
        assert!(cache.get_key(&resources[0]).is_some());
        assert!(render(&cache, &request(&resources[4], 0), "always", "content"));

        // Only the coldest resource goes, with its entry
        assert_eq!(cache.key_count(), 4);
        assert_eq!(cache.len(), 4);
        assert!(cache.get_key(&resources[1]).is_none());
        assert!(cache.get_key(&resources[2]).is_some());
        assert!(cache.get(&request(&resources[0], 0)).is_some());
        assert_consistent(&cache);
    }

    #[test]
    fn test_variation_map_budget() {
        let config = FlexCacheConfig {
            max_variations: 4,
            ..Default::default()
        };
        let cache = FlexCache::new(config).unwrap();
        let resources: Vec<ResourceName> =
            (0..10).map(|i| ResourceName::online(format!("/{}.jsp", i))).collect();

        for resource in &resources {
            assert!(render(&cache, &request(resource, 0), "always", "content"));
            assert!(cache.key_count() <= 4);
        }
        assert!(cache.get(&request(&resources[9], 0)).is_some());
        assert!(cache.get_key(&resources[0]).is_none());
        assert_eq!(cache.len(), cache.key_count());

        // The budget counts resources, not variations of one resource
        let list = ResourceName::online("/p.jsp");
        for n in 0..6 {
            let req = RequestKey::builder(list.clone())
                .param("p", n.to_string())
                .timestamp_millis(0)
                .build();
            assert!(render(&cache, &req, "params", "page"));
        }
        assert_eq!(cache.cached_variations(&Caller::ADMIN, &list).map(|v| v.len()), Some(6));
        assert!(cache.key_count() <= 4);
        assert_consistent(&cache);
    }

    #[test]
    fn test_timeout_scenario() {
        let clock = Arc::new(ManualClock::new(at(10, 5)));
        let cache = FlexCache::with_clock(FlexCacheConfig::default(), clock.clone()).unwrap();
        let resource = ResourceName::online("/a.jsp");
        let directives = "groups=(guests);timeout=20";

        let first = request(&resource, at(10, 5));
        assert!(cache.get(&first).is_none());
        assert!(render(&cache, &first, directives, "cached"));

        let key = cache.get_key(&resource).unwrap();
        assert_eq!(key.match_request(&first).unwrap().to_string(), "groups=(guests)");
        let hit = cache.get(&first).unwrap();
        assert_eq!(hit.expires_at(), Some(at(10, 20)));

        assert!(cache.get(&request(&resource, at(10, 20))).is_some());

        let replay = request(&resource, at(10, 25));
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&replay).is_none());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.key_count(), 1);
        assert_eq!(cache.stats().expirations(), 1);

        // Rendering again at 10:25 lands on the next grid slot
        clock.set(at(10, 25));
        assert!(render(&cache, &replay, directives, "fresh"));
        assert_eq!(cache.get(&replay).unwrap().expires_at(), Some(at(10, 40)));
    }

    #[test]
    fn test_registered_key_decides_timeout() {
        let clock = Arc::new(ManualClock::new(at(10, 5)));
        let cache = FlexCache::with_clock(FlexCacheConfig::default(), clock).unwrap();
        let resource = ResourceName::online("/a.jsp");
        cache.put_key(&resource, ResourceKey::parse("always;timeout=20"));

        // Stored with a key that declares no timeout
        let untimed = ResourceKey::parse("always");
        assert!(cache.put(&resource, &untimed, entry("x"), Some(Variation::Always)));

        let hit = cache.get(&request(&resource, at(10, 5))).unwrap();
        assert_eq!(hit.expires_at(), Some(at(10, 20)));
        assert!(cache.get(&request(&resource, at(20, 5))).is_none());
        assert_eq!(cache.stats().expirations(), 1);
    }

    #[test]
    fn test_no_timeout_never_expires() {
        let cache = FlexCache::with_clock(FlexCacheConfig::default(), Arc::new(ManualClock::new(0)))
            .unwrap();
        let resource = ResourceName::online("/a.jsp");

        assert!(render(&cache, &request(&resource, 0), "uri", "x"));
        assert!(cache.get(&request(&resource, u64::MAX)).is_some());
    }

    #[test]
    fn test_clear_online_keeps_offline() {
        let cache = FlexCache::new(FlexCacheConfig::default()).unwrap();
        let online = ResourceName::online("/a.jsp");
        let offline = ResourceName::offline("/a.jsp");

        assert!(render(&cache, &request(&online, 0), "always", "published"));
        assert!(render(&cache, &request(&offline, 0), "always", "draft"));

        assert!(cache.clear_online(&Caller::ADMIN));

        assert!(cache.get(&request(&online, 0)).is_none());
        assert!(cache.get_key(&online).is_none());
        assert_eq!(body(&cache.get(&request(&offline, 0)).unwrap()), "draft");
        assert_eq!(cache.key_count(), 1);
        assert_consistent(&cache);
    }

    #[test]
    fn test_clear_entries_keeps_keys() {
        let cache = FlexCache::new(FlexCacheConfig::default()).unwrap();
        let online = ResourceName::online("/a.jsp");
        let offline = ResourceName::offline("/b.jsp");

        assert!(render(&cache, &request(&online, 0), "always", "a"));
        assert!(render(&cache, &request(&offline, 0), "always", "b"));

        assert!(cache.clear_offline_entries(&Caller::ADMIN));
        assert!(cache.get(&request(&offline, 0)).is_none());
        assert!(cache.get_key(&offline).is_some());
        assert!(cache.get(&request(&online, 0)).is_some());

        assert!(cache.clear_entries(&Caller::ADMIN));
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.total_bytes(), 0);
        assert_eq!(cache.key_count(), 2);

        assert!(cache.clear_offline(&Caller::ADMIN));
        assert_eq!(cache.key_count(), 1);
        assert!(cache.clear_online_entries(&Caller::ADMIN));
        assert_eq!(cache.key_count(), 1);
        assert!(cache.clear_all(&Caller::ADMIN));
        assert!(cache.is_empty());
        assert_consistent(&cache);
    }

    #[test]
    fn test_admin_operations_require_admin() {
        let cache = FlexCache::new(FlexCacheConfig::default()).unwrap();
        let resource = ResourceName::online("/a.jsp");
        assert!(render(&cache, &request(&resource, 0), "always", "x"));

        assert!(!cache.clear_all(&Caller::GUEST));
        assert!(!cache.clear(&Caller::SYSTEM, ClearAction::Entries));
        assert!(cache.cached_resources(&Caller::GUEST).is_none());
        assert!(cache.cached_key(&Caller::GUEST, &resource).is_none());
        assert_eq!(cache.len(), 1);

        assert_eq!(cache.cached_resources(&Caller::ADMIN), Some(vec![resource.clone()]));
        assert_eq!(
            cache.cached_key(&Caller::ADMIN, &resource).map(|k| k.to_string()),
            Some("always".to_string())
        );
    }

    #[test]
    fn test_remove_entry() {
        let cache = FlexCache::new(FlexCacheConfig::default()).unwrap();
        let resource = ResourceName::online("/a.jsp");
        let req = request(&resource, 0);
        assert!(render(&cache, &req, "always", "x"));

        assert!(cache.remove(&resource, &Variation::Always));
        assert!(!cache.remove(&resource, &Variation::Always));
        assert!(!cache.contains(&req));
        assert_eq!(cache.key_count(), 1);
    }

    #[test]
    fn test_disabled_cache_is_inert() {
        let config = FlexCacheConfig {
            enabled: false,
            ..Default::default()
        };
        let cache = FlexCache::new(config).unwrap();
        let resource = ResourceName::online("/a.jsp");
        let req = request(&resource, 0);
        let key = ResourceKey::parse("always");

        cache.put_key(&resource, key.clone());
        assert!(cache.get_key(&resource).is_none());
        assert!(!cache.put(&resource, &key, entry("x"), Some(Variation::Always)));
        assert!(cache.get(&req).is_none());
        assert!(!cache.clear_all(&Caller::ADMIN));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_offline_caching_can_be_disabled() {
        let config = FlexCacheConfig {
            cache_offline: false,
            ..Default::default()
        };
        let cache = FlexCache::new(config).unwrap();
        let key = ResourceKey::parse("always");

        let offline = ResourceName::offline("/a.jsp");
        assert!(!cache.put(&offline, &key, entry("x"), Some(Variation::Always)));
        assert!(cache.is_empty());

        let online = ResourceName::online("/a.jsp");
        assert!(cache.put(&online, &key, entry("x"), Some(Variation::Always)));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = FlexCacheConfig {
            avg_cache_bytes: 10,
            max_cache_bytes: 10,
            max_entry_bytes: 5,
            ..Default::default()
        };
        assert!(FlexCache::new(config).is_err());
    }

    #[test]
    fn test_events_clear_cache() {
        let bus = EventBus::new();
        let cache =
            FlexCache::attach(FlexCacheConfig::default(), Arc::new(SystemClock), &bus).unwrap();
        let online = ResourceName::online("/a.jsp");
        let offline = ResourceName::offline("/a.jsp");
        let fill = || {
            assert!(render(&cache, &request(&online, 0), "always", "on"));
            assert!(render(&cache, &request(&offline, 0), "always", "off"));
        };

        fill();
        assert_eq!(bus.publish(&Event::PublishProject), 1);
        assert!(cache.is_empty());

        fill();
        bus.publish(&Event::CacheClear {
            principal: Arc::new(Caller::ADMIN),
            action: ClearAction::OnlineEntries.code(),
        });
        assert!(cache.get(&request(&online, 0)).is_none());
        assert!(cache.get_key(&online).is_some());
        assert!(cache.get(&request(&offline, 0)).is_some());

        // Unknown codes and non-admin callers are ignored
        bus.publish(&Event::CacheClear {
            principal: Arc::new(Caller::ADMIN),
            action: 42,
        });
        bus.publish(&Event::CacheClear {
            principal: Arc::new(Caller::GUEST),
            action: ClearAction::All.code(),
        });
        assert_eq!(cache.key_count(), 2);

        bus.publish(&Event::ClearCaches);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_subscription_ends_with_cache() {
        let bus = EventBus::new();
        let cache =
            FlexCache::attach(FlexCacheConfig::default(), Arc::new(SystemClock), &bus).unwrap();
        assert_eq!(bus.listener_count(), 1);

        drop(cache);
        assert_eq!(bus.listener_count(), 0);
        assert_eq!(bus.publish(&Event::ClearCaches), 0);

        let disabled = FlexCacheConfig {
            enabled: false,
            ..Default::default()
        };
        let _cache = FlexCache::attach(disabled, Arc::new(SystemClock), &bus).unwrap();
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_purge_repository() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("online")).unwrap();
        std::fs::write(dir.path().join("online").join("a.html"), b"a").unwrap();

        let config = FlexCacheConfig {
            repository: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let bus = EventBus::new();
        let cache = FlexCache::attach(config, Arc::new(SystemClock), &bus).unwrap();
        let resource = ResourceName::online("/a.jsp");
        assert!(render(&cache, &request(&resource, 0), "always", "x"));

        assert!(!cache.purge_repository(&Caller::GUEST).unwrap());
        assert_eq!(cache.len(), 1);

        bus.publish(&Event::PurgeRepository {
            principal: Arc::new(Caller::SYSTEM),
        });
        assert!(cache.is_empty());
        assert!(!dir.path().join("online").join("a.html").exists());
        assert!(dir.path().join("online").exists());
    }

    /// Renderer side of a playback: includes go through the cache again
    struct Renderer<'a> {
        cache: &'a FlexCache,
        out: Vec<u8>,
        params: Params,
        headers: Vec<String>,
        redirect: Option<String>,
    }

    impl<'a> Renderer<'a> {
        fn new(cache: &'a FlexCache) -> Self {
            Self {
                cache,
                out: Vec::new(),
                params: Params::new(),
                headers: Vec::new(),
                redirect: None,
            }
        }
    }

    impl PlaybackSink for Renderer<'_> {
        type Error = String;

        fn redirect(&mut self, target: &str) -> std::result::Result<(), String> {
            self.redirect = Some(target.to_string());
            Ok(())
        }

        fn headers(&mut self, headers: &Headers) -> std::result::Result<(), String> {
            self.headers.extend(headers.keys().cloned());
            Ok(())
        }

        fn write(&mut self, output: &Bytes, _leaf: bool) -> std::result::Result<(), String> {
            self.out.extend_from_slice(output);
            Ok(())
        }

        fn parameters(&mut self) -> &mut Params {
            &mut self.params
        }

        fn include(&mut self, target: &str) -> std::result::Result<(), String> {
            let req = RequestKey::builder(ResourceName::online(target))
                .params(self.params.clone())
                .timestamp_millis(0)
                .build();
            let entry = self
                .cache
                .get(&req)
                .ok_or_else(|| format!("{} not cached", target))?;
            entry.playback(self)
        }
    }

    #[test]
    fn test_nested_playback_through_cache() {
        let cache = FlexCache::new(FlexCacheConfig::default()).unwrap();
        let key = ResourceKey::parse("params=(lang)");

        for lang in ["de", "en"] {
            let nav = ResourceName::online("/nav.jsp");
            let req = RequestKey::builder(nav.clone())
                .param("lang", lang)
                .timestamp_millis(0)
                .build();
            cache.put_key(&nav, key.clone());
            assert!(cache.put(&nav, &key, entry(&format!("[nav {}]", lang)), key.match_request(&req)));
        }

        let page = ResourceName::online("/page.jsp");
        let mut outer = CacheEntry::new();
        outer.add_headers(Headers::from([("Content-Type".to_string(), vec!["text/html".to_string()])]));
        outer.add_output("<body>");
        outer.add_include("/nav.jsp", Params::from([("lang".to_string(), vec!["de".to_string()])]));
        outer.add_output("|");
        outer.add_include("/nav.jsp", Params::from([("lang".to_string(), vec!["en".to_string()])]));
        outer.add_output("</body>");
        let always = ResourceKey::parse("always");
        assert!(cache.put(&page, &always, outer, Some(Variation::Always)));

        let mut renderer = Renderer::new(&cache);
        let hit = cache.get(&request(&page, 0)).unwrap();
        hit.playback(&mut renderer).unwrap();

        assert_eq!(
            String::from_utf8(renderer.out).unwrap(),
            "<body>[nav de]|[nav en]</body>"
        );
        assert_eq!(renderer.headers, vec!["Content-Type"]);
        assert!(renderer.params.is_empty());
        assert!(renderer.redirect.is_none());
    }

    #[test]
    fn test_redirect_entry_playback() {
        let cache = FlexCache::new(FlexCacheConfig::default()).unwrap();
        let resource = ResourceName::online("/old.jsp");
        let mut redirect = CacheEntry::new();
        redirect.set_redirect("/new.jsp");
        assert!(cache.put(&resource, &ResourceKey::parse("always"), redirect, Some(Variation::Always)));

        let mut renderer = Renderer::new(&cache);
        cache.get(&request(&resource, 0)).unwrap().playback(&mut renderer).unwrap();
        assert_eq!(renderer.redirect.as_deref(), Some("/new.jsp"));
        assert!(renderer.out.is_empty());
    }

    #[test]
    fn test_concurrent_access() {
        let config = FlexCacheConfig {
            max_cache_bytes: 2_000,
            avg_cache_bytes: 1_500,
            max_entry_bytes: 400,
            max_keys: 64,
            ..Default::default()
        };
        let cache = Arc::new(FlexCache::new(config).unwrap());

        thread::scope(|scope| {
            for worker in 0..8 {
                let cache = Arc::clone(&cache);
                scope.spawn(move || {
                    for i in 0..200 {
                        let project = if i % 2 == 0 { Project::Online } else { Project::Offline };
                        let resource = ResourceName::new(format!("/{}.jsp", (worker * 7 + i) % 40), project);
                        let req = RequestKey::builder(resource)
                            .param("n", (i % 5).to_string())
                            .timestamp_millis(0)
                            .build();
                        if cache.get(&req).is_none() {
                            render(&cache, &req, "params", &"x".repeat(10 + i % 90));
                        }
                        if i % 50 == 49 {
                            cache.clear(&Caller::ADMIN, ClearAction::try_from((worker % 6) as i32).unwrap());
                        }
                    }
                });
            }
        });

        assert!(cache.total_bytes() <= 2_000);
        assert!(cache.key_count() <= 64);
        assert_consistent(&cache);
    }
}
