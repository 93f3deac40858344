//! # flexcache
//!
//! Render-output cache for dynamically generated resources.
//!
//! A resource declares how its output may be cached through a small directive
//! language (`always`, `uri`, `user`, `groups=(...)`, `params=(...)`,
//! `timeout=...` and friends, see [`ResourceKey`]). For every request the key
//! either refuses caching or yields a [`Variation`]; rendered output is stored
//! and replayed per variation.
//!
//! ## Architecture
//! - **Keys**: directive strings parsed with nom into [`ResourceKey`]
//! - **Variations**: [`ResourceKey::match_request`] maps a [`RequestKey`] to
//!   a structured [`Variation`]
//! - **Entries**: [`CacheEntry`] records output, includes, headers or a
//!   redirect and replays them onto a [`PlaybackSink`]
//! - **Budgets**: two `flexlru` lists, entries weighted by bytes and
//!   resources weighted by count
//! - **Invalidation**: [`FlexCache`] listens on an [`EventBus`] and purges the
//!   materialized output repository on request
//!
//! ## Example
//!
//! ```
//! use flexcache::{CacheEntry, FlexCache, FlexCacheConfig, RequestKey, ResourceKey, ResourceName};
//!
//! let cache = FlexCache::new(FlexCacheConfig::default()).unwrap();
//! let resource = ResourceName::online("/index.jsp");
//! let request = RequestKey::builder(resource.clone()).group("guests").build();
//!
//! let key = ResourceKey::parse("groups=(guests);timeout=20");
//! cache.put_key(&resource, key.clone());
//!
//! let mut entry = CacheEntry::new();
//! entry.add_output("<html>...</html>");
//! assert!(cache.put(&resource, &key, entry, key.match_request(&request)));
//! assert!(cache.get(&request).is_some());
//! ```

#![warn(missing_docs)]

mod cache;
mod clock;
mod config;
mod entry;
mod error;
mod events;
mod key;
mod repository;
mod request;
mod stats;
mod variation;

pub use cache::FlexCache;
pub use clock::{epoch_millis, Clock, ManualClock, SystemClock};
pub use config::FlexCacheConfig;
pub use entry::{CacheEntry, Element, Headers, PlaybackSink};
pub use error::{Error, Result};
pub use events::{Caller, ClearAction, Event, EventBus, EventListener, Principal, Subscription};
pub use key::{Cacheability, ResourceKey};
pub use repository::{project_dir, purge as purge_repository};
pub use request::{Params, Project, RequestKey, RequestKeyBuilder, ResourceName};
pub use stats::CacheStats;
pub use variation::{Dimension, Variation};
