//! Hotness counters
//!
//! Counters are per dispatcher (and therefore per thread). They only ever
//! grow; nothing resets them for the lifetime of the process. Promotion
//! observations go through [`promotion_key`], so a site that turned generic
//! stops growing one counter per value.

use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};

use super::install::{CodeCache, MergePointKey};
use crate::bytecode::Location;
use crate::runtime::{Observer, Value};

/// What a counter counts
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SiteKey {
    /// Arrivals at a merge point instance
    MergePoint(MergePointKey),
    /// Observations of one value at a promotion site
    Promotion { site: Location, value: Value },
    /// Observations at a promotion site that turned generic
    GenericPromotion(Location),
    /// Passes through one arm of a split
    Split { site: Location, taken: bool },
}

#[derive(Debug, Clone, Default)]
pub struct HotnessCounters {
    counts: HashMap<SiteKey, u64>,
    dedup: bool,
    segment: Option<HashSet<SiteKey>>,
}

impl HotnessCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters that count each site at most once per segment
    pub fn with_dedup(dedup: bool) -> Self {
        Self {
            dedup,
            ..Self::default()
        }
    }

    /// Record one observation of `key` and return its count
    pub fn observe(&mut self, key: SiteKey) -> u64 {
        if let Some(seen) = self.segment.as_mut() {
            if seen.contains(&key) {
                return self.count(&key);
            }
            seen.insert(key.clone());
        }
        let count = self.counts.entry(key).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Current count of `key` without observing it
    pub fn count(&self, key: &SiteKey) -> u64 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    /// Open a de-duplication window, if de-duplication is on
    pub fn begin_segment(&mut self) {
        if self.dedup {
            self.segment = Some(HashSet::default());
        }
    }

    pub fn end_segment(&mut self) {
        self.segment = None;
    }

    /// Number of distinct keys observed
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// The `n` hottest keys, hottest first
    pub fn hottest(&self, n: usize) -> Vec<(&SiteKey, u64)> {
        let mut entries: Vec<(&SiteKey, u64)> = self.counts.iter().map(|(k, c)| (k, *c)).collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        entries.truncate(n);
        entries
    }
}

/// The counter an observation of `value` at `site` belongs to
///
/// Records the value with the code cache first, which may flip the site to
/// generic.
pub fn promotion_key(cache: &CodeCache, site: Location, value: &Value) -> SiteKey {
    if cache.observe_promotion(site, value) {
        SiteKey::GenericPromotion(site)
    } else {
        SiteKey::Promotion {
            site,
            value: value.clone(),
        }
    }
}

/// Feeds what the interpreter passes into the counters
pub struct Profiler<'a> {
    counters: &'a mut HotnessCounters,
    cache: &'a CodeCache,
}

impl<'a> Profiler<'a> {
    pub fn new(counters: &'a mut HotnessCounters, cache: &'a CodeCache) -> Self {
        Self { counters, cache }
    }
}

impl Observer for Profiler<'_> {
    fn promotion(&mut self, site: Location, value: &Value) {
        self.counters.observe(promotion_key(self.cache, site, value));
    }

    fn split(&mut self, site: Location, taken: bool) {
        self.counters.observe(SiteKey::Split { site, taken });
    }
}
