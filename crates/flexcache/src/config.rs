//! Cache configuration
//!
//! Values come either from a deserialized document (camelCase fields) or
//! from flat `flex.cache.*` properties.

use std::path::PathBuf;

use flexlru::LruLimits;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const PROPERTY_PREFIX: &str = "flex.cache.";

/// Settings of a [`FlexCache`](crate::FlexCache)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlexCacheConfig {
    /// Cache anything at all
    pub enabled: bool,
    /// Cache resources of the offline project
    pub cache_offline: bool,
    /// Leave a collection hint after every eviction pass
    pub force_gc: bool,
    /// Total entry bytes that trigger eviction
    pub max_cache_bytes: usize,
    /// Total entry bytes eviction shrinks the cache down to
    pub avg_cache_bytes: usize,
    /// Largest cacheable entry
    pub max_entry_bytes: usize,
    /// Variation maps kept before the least recently used are evicted
    pub max_variations: usize,
    /// Hard ceiling on registered resources
    pub max_keys: usize,
    /// Directory holding materialized output (`online/` and `offline/`)
    pub repository: Option<PathBuf>,
}

impl Default for FlexCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_offline: true,
            force_gc: false,
            max_cache_bytes: 2_000_000,
            avg_cache_bytes: 1_500_000,
            max_entry_bytes: 400_000,
            max_variations: 4_000,
            max_keys: 4_000,
            repository: None,
        }
    }
}

impl FlexCacheConfig {
    /// Build a configuration from `flex.cache.*` properties
    ///
    /// Unknown properties are ignored and missing ones keep their default.
    /// `flex.cache.maxEntries` is accepted as the older name of
    /// `flex.cache.maxVariations`.
    pub fn from_properties<'a, I>(properties: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut config = Self::default();

        for (name, value) in properties {
            let Some(setting) = name.strip_prefix(PROPERTY_PREFIX) else {
                continue;
            };
            let value = value.trim();
            match setting {
                "enabled" => config.enabled = parse_bool(name, value)?,
                "offline" => config.cache_offline = parse_bool(name, value)?,
                "forceGC" => config.force_gc = parse_bool(name, value)?,
                "maxCacheBytes" => config.max_cache_bytes = parse_number(name, value)?,
                "avgCacheBytes" => config.avg_cache_bytes = parse_number(name, value)?,
                "maxEntryBytes" => config.max_entry_bytes = parse_number(name, value)?,
                "maxVariations" | "maxEntries" => config.max_variations = parse_number(name, value)?,
                "maxKeys" => config.max_keys = parse_number(name, value)?,
                "repository" => config.repository = Some(PathBuf::from(value)),
                _ => {}
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the budgets are consistent
    pub fn validate(&self) -> Result<()> {
        if self.max_cache_bytes == 0 {
            return Err(Error::Config("maxCacheBytes must be greater than 0".to_string()));
        }
        if self.avg_cache_bytes >= self.max_cache_bytes {
            return Err(Error::Config(format!(
                "avgCacheBytes ({}) must be below maxCacheBytes ({})",
                self.avg_cache_bytes, self.max_cache_bytes
            )));
        }
        if self.max_entry_bytes == 0 || self.max_entry_bytes > self.max_cache_bytes {
            return Err(Error::Config(format!(
                "maxEntryBytes ({}) must be between 1 and maxCacheBytes ({})",
                self.max_entry_bytes, self.max_cache_bytes
            )));
        }
        if self.max_variations == 0 {
            return Err(Error::Config("maxVariations must be greater than 0".to_string()));
        }
        if self.max_keys == 0 {
            return Err(Error::Config("maxKeys must be greater than 0".to_string()));
        }
        Ok(())
    }

    pub(crate) fn entry_limits(&self) -> LruLimits {
        LruLimits::new(self.max_cache_bytes, self.avg_cache_bytes)
            .with_max_node_cost(self.max_entry_bytes)
            .with_force_gc(self.force_gc)
    }

    pub(crate) fn resource_limits(&self) -> LruLimits {
        LruLimits::new(self.max_variations, self.max_variations * 3 / 4)
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" => Ok(true),
        "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Parse(format!("{}: expected a boolean, got '{}'", name, value))),
    }
}

fn parse_number(name: &str, value: &str) -> Result<usize> {
    value
        .parse()
        .map_err(|e| Error::Parse(format!("{}: '{}' is not a number ({})", name, value, e)))
}
