//! Installation tables for compiled units
//!
//! The [`CodeCache`] is the only state dispatchers share. Lookups take a read
//! lock; installation replaces whatever was there (last writer wins), so two
//! dispatchers racing to compile the same key only waste work.

use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

use super::backend::{CompiledUnit, UnitId};
use crate::bytecode::{Location, Reg};
use crate::runtime::{Bindings, Value};

/// The fixed values identifying a merge point instance
///
/// Green registers holding values derived from I/O never become fixed; they
/// contribute `nil` here and are told apart by the provenance mask.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GreenKey {
    pub values: Vec<Value>,
    pub taint: u64,
}

impl GreenKey {
    pub fn new(greens: &[Reg], bindings: &Bindings) -> Self {
        let values = greens
            .iter()
            .map(|&reg| {
                if bindings.is_tainted(reg) {
                    Value::Nil
                } else {
                    bindings.get(reg).clone()
                }
            })
            .collect();
        Self {
            values,
            taint: bindings.taint_mask(),
        }
    }
}

/// A merge point instance: its location plus its green key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MergePointKey {
    pub location: Location,
    pub greens: GreenKey,
}

impl MergePointKey {
    pub fn new(location: Location, greens: &[Reg], bindings: &Bindings) -> Self {
        Self {
            location,
            greens: GreenKey::new(greens, bindings),
        }
    }
}

impl fmt::Display for MergePointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values: Vec<String> = self.greens.values.iter().map(|v| v.to_string()).collect();
        write!(f, "{} [{}]", self.location, values.join(", "))
    }
}

/// One per-value unit, valid for arrivals with the provenance mask it was
/// compiled under
#[derive(Debug, Clone)]
pub struct PromotionEntry {
    pub value: Value,
    pub taint: u64,
    pub unit: Arc<CompiledUnit>,
}

impl PromotionEntry {
    fn matches(&self, value: &Value, taint: u64) -> bool {
        self.value == *value && self.taint == taint
    }
}

/// Promotion cache of one site
#[derive(Debug, Clone, Default)]
pub enum PromotionCache {
    /// Nothing installed yet
    #[default]
    Uninitialized,
    /// One value specialized
    Monomorphic(PromotionEntry),
    /// Several values specialized, up to the megamorphic threshold
    Polymorphic(Vec<PromotionEntry>),
    /// Too many values; the site stays generic for good
    Megamorphic { generic: Option<Arc<CompiledUnit>> },
}

impl PromotionCache {
    pub fn lookup(&self, value: &Value, taint: u64) -> Option<Arc<CompiledUnit>> {
        match self {
            Self::Monomorphic(entry) if entry.matches(value, taint) => Some(entry.unit.clone()),
            Self::Polymorphic(entries) => entries
                .iter()
                .find(|e| e.matches(value, taint))
                .map(|e| e.unit.clone()),
            _ => None,
        }
    }

    /// Install a unit for `value` under `taint`; returns false if the site
    /// is, or just turned, megamorphic
    ///
    /// `limit` bounds the distinct values, not the entries: one value may
    /// hold a unit per provenance mask.
    pub fn update(&mut self, value: Value, taint: u64, unit: Arc<CompiledUnit>, limit: usize) -> bool {
        let entry = PromotionEntry { value, taint, unit };
        match self {
            Self::Uninitialized => {
                *self = Self::Monomorphic(entry);
                true
            }
            Self::Monomorphic(old) if old.matches(&entry.value, entry.taint) => {
                old.unit = entry.unit;
                true
            }
            Self::Monomorphic(old) => {
                if old.value != entry.value && limit < 2 {
                    *self = Self::Megamorphic { generic: None };
                    return false;
                }
                let old = old.clone();
                *self = Self::Polymorphic(vec![old, entry]);
                true
            }
            Self::Polymorphic(entries) => {
                if let Some(old) = entries.iter_mut().find(|e| e.matches(&entry.value, entry.taint)) {
                    old.unit = entry.unit;
                    return true;
                }
                let known = entries.iter().any(|e| e.value == entry.value);
                if !known && distinct_values(entries) >= limit {
                    *self = Self::Megamorphic { generic: None };
                    return false;
                }
                entries.push(entry);
                true
            }
            Self::Megamorphic { .. } => false,
        }
    }

    /// Number of per-value units
    pub fn len(&self) -> usize {
        match self {
            Self::Uninitialized | Self::Megamorphic { .. } => 0,
            Self::Monomorphic(_) => 1,
            Self::Polymorphic(entries) => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Distinct values with at least one unit
    pub fn values(&self) -> usize {
        match self {
            Self::Polymorphic(entries) => distinct_values(entries),
            other => other.len(),
        }
    }

    pub fn contains(&self, value: &Value) -> bool {
        match self {
            Self::Monomorphic(entry) => entry.value == *value,
            Self::Polymorphic(entries) => entries.iter().any(|e| e.value == *value),
            _ => false,
        }
    }

    pub fn is_megamorphic(&self) -> bool {
        matches!(self, Self::Megamorphic { .. })
    }
}

fn distinct_values(entries: &[PromotionEntry]) -> usize {
    entries
        .iter()
        .enumerate()
        .filter(|(i, e)| !entries[..*i].iter().any(|earlier| earlier.value == e.value))
        .count()
}

/// Shared installation tables
#[derive(Debug)]
pub struct CodeCache {
    merge_points: RwLock<HashMap<MergePointKey, Arc<CompiledUnit>>>,
    promotions: RwLock<HashMap<Location, PromotionCache>>,
    observed: RwLock<HashMap<Location, HashSet<Value>>>,
    megamorphic_threshold: usize,
    next_unit: AtomicU64,
    disabled: AtomicBool,
}

impl CodeCache {
    pub fn new(megamorphic_threshold: usize) -> Self {
        Self {
            merge_points: RwLock::new(HashMap::default()),
            promotions: RwLock::new(HashMap::default()),
            observed: RwLock::new(HashMap::default()),
            megamorphic_threshold: megamorphic_threshold.max(1),
            next_unit: AtomicU64::new(1),
            disabled: AtomicBool::new(false),
        }
    }

    pub fn megamorphic_threshold(&self) -> usize {
        self.megamorphic_threshold
    }

    pub fn next_unit_id(&self) -> UnitId {
        self.next_unit.fetch_add(1, Ordering::Relaxed)
    }

    pub fn lookup(&self, key: &MergePointKey) -> Option<Arc<CompiledUnit>> {
        self.merge_points
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Install `unit` for `key`, replacing any earlier unit
    pub fn install(&self, key: MergePointKey, unit: Arc<CompiledUnit>) {
        debug!(key = %key, unit = unit.id(), ops = unit.op_count(), "installing merge point unit");
        self.merge_points
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, unit);
    }

    pub fn lookup_promotion(&self, site: Location, value: &Value, taint: u64) -> Option<Arc<CompiledUnit>> {
        self.promotions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&site)
            .and_then(|cache| cache.lookup(value, taint))
    }

    /// Install a per-value unit compiled under provenance mask `taint`;
    /// returns false if the site is generic
    pub fn install_promotion(
        &self,
        site: Location,
        value: Value,
        taint: u64,
        unit: Arc<CompiledUnit>,
    ) -> bool {
        let mut promotions = self.promotions.write().unwrap_or_else(PoisonError::into_inner);
        let cache = promotions.entry(site).or_default();
        let was_megamorphic = cache.is_megamorphic();
        let shown = value.to_string();
        let installed = cache.update(value, taint, unit, self.megamorphic_threshold);
        if installed {
            debug!(site = %site, value = %shown, entries = cache.len(), "installed promotion unit");
        } else if !was_megamorphic {
            warn!(site = %site, limit = self.megamorphic_threshold, "promotion site turned megamorphic");
        }
        installed
    }

    /// Per-value units installed at `site`
    pub fn promotion_entries(&self, site: Location) -> usize {
        self.promotions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&site)
            .map_or(0, PromotionCache::len)
    }

    /// Whether a unit for `value` would fit under the megamorphic threshold
    pub fn promotion_has_room(&self, site: Location, value: &Value) -> bool {
        let promotions = self.promotions.read().unwrap_or_else(PoisonError::into_inner);
        match promotions.get(&site) {
            None => true,
            Some(cache) if cache.is_megamorphic() => false,
            Some(cache) => cache.contains(value) || cache.values() < self.megamorphic_threshold,
        }
    }

    /// Record that `site` saw `value`, returning whether the site is generic
    ///
    /// At most `megamorphic_threshold + 1` distinct values are remembered per
    /// site; seeing one more than the threshold flips the site to generic.
    pub fn observe_promotion(&self, site: Location, value: &Value) -> bool {
        if self.is_generic(site) {
            return true;
        }
        let distinct = {
            let mut observed = self.observed.write().unwrap_or_else(PoisonError::into_inner);
            let values = observed.entry(site).or_default();
            if values.len() <= self.megamorphic_threshold && !values.contains(value) {
                values.insert(value.clone());
            }
            values.len()
        };
        if distinct <= self.megamorphic_threshold {
            return false;
        }
        self.make_generic(site);
        self.observed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&site);
        true
    }

    pub fn is_generic(&self, site: Location) -> bool {
        self.promotions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&site)
            .is_some_and(PromotionCache::is_megamorphic)
    }

    /// Flip `site` to generic; returns true if it was not generic yet
    pub fn make_generic(&self, site: Location) -> bool {
        let mut promotions = self.promotions.write().unwrap_or_else(PoisonError::into_inner);
        let cache = promotions.entry(site).or_default();
        if cache.is_megamorphic() {
            return false;
        }
        warn!(site = %site, entries = cache.len(), "promotion site turned megamorphic");
        *cache = PromotionCache::Megamorphic { generic: None };
        true
    }

    pub fn generic_unit(&self, site: Location) -> Option<Arc<CompiledUnit>> {
        match self
            .promotions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&site)
        {
            Some(PromotionCache::Megamorphic { generic }) => generic.clone(),
            _ => None,
        }
    }

    /// Install the single generic unit of a megamorphic site
    pub fn install_generic(&self, site: Location, unit: Arc<CompiledUnit>) -> bool {
        let mut promotions = self.promotions.write().unwrap_or_else(PoisonError::into_inner);
        match promotions.get_mut(&site) {
            Some(PromotionCache::Megamorphic { generic }) => {
                debug!(site = %site, unit = unit.id(), "installed generic promotion unit");
                *generic = Some(unit);
                true
            }
            _ => false,
        }
    }

    /// Stop all further specialization in the process
    pub fn disable(&self) {
        self.disabled.store(true, Ordering::SeqCst);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    /// Number of installed merge point units
    pub fn merge_point_units(&self) -> usize {
        self.merge_points
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for CodeCache {
    fn default() -> Self {
        Self::new(4)
    }
}
