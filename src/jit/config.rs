//! Engine configuration

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};
use crate::runtime::DEFAULT_MAX_CALL_DEPTH;

/// Tuning knobs for the dispatcher and the specializer
///
/// Every field has a default, so a JSON configuration only needs to name the
/// values it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitConfig {
    /// Specialize at all; when off the dispatcher only interprets
    pub enabled: bool,
    /// Arrivals at a merge point before it is compiled
    pub merge_point_threshold: u64,
    /// Observations of a (site, value) pair before it is promoted
    pub promotion_threshold: u64,
    /// Passes through one arm of a complicated split before that arm is
    /// compiled behind a guard
    pub split_threshold: u64,
    /// Distinct promoted values a site may hold before it turns generic
    pub megamorphic_threshold: usize,
    /// Count each site at most once per fallback segment
    pub dedup_counters: bool,
    /// Treat only loop headers as merge points
    pub loop_headers_only: bool,
    /// Instructions one specialization attempt may process
    pub max_region_instrs: usize,
    /// Limit on nested calls
    pub max_call_depth: usize,
    /// Keep a log of dispatcher transitions
    pub record_events: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            merge_point_threshold: 10,
            promotion_threshold: 10,
            split_threshold: 10,
            megamorphic_threshold: 4,
            dedup_counters: false,
            loop_headers_only: false,
            max_region_instrs: 10_000,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            record_events: false,
        }
    }
}

impl JitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// A configuration that never specializes
    pub fn interpreted_only() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Parse a JSON configuration and validate it
    pub fn from_json_str(source: &str) -> Result<Self> {
        let config: JitConfig = serde_json::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("merge_point_threshold", self.merge_point_threshold as usize),
            ("promotion_threshold", self.promotion_threshold as usize),
            ("split_threshold", self.split_threshold as usize),
            ("megamorphic_threshold", self.megamorphic_threshold),
            ("max_region_instrs", self.max_region_instrs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::config(format!("{} must be at least 1", name)));
            }
        }
        Ok(())
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the merge point and promotion thresholds together
    pub fn with_threshold(mut self, threshold: u64) -> Self {
        self.merge_point_threshold = threshold;
        self.promotion_threshold = threshold;
        self
    }

    pub fn with_merge_point_threshold(mut self, threshold: u64) -> Self {
        self.merge_point_threshold = threshold;
        self
    }

    pub fn with_promotion_threshold(mut self, threshold: u64) -> Self {
        self.promotion_threshold = threshold;
        self
    }

    pub fn with_split_threshold(mut self, threshold: u64) -> Self {
        self.split_threshold = threshold;
        self
    }

    pub fn with_megamorphic_threshold(mut self, threshold: usize) -> Self {
        self.megamorphic_threshold = threshold;
        self
    }

    pub fn with_dedup_counters(mut self, dedup: bool) -> Self {
        self.dedup_counters = dedup;
        self
    }

    pub fn with_loop_headers_only(mut self, enabled: bool) -> Self {
        self.loop_headers_only = enabled;
        self
    }

    pub fn with_max_region_instrs(mut self, limit: usize) -> Self {
        self.max_region_instrs = limit;
        self
    }

    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    pub fn with_record_events(mut self, record: bool) -> Self {
        self.record_events = record;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = JitConfig::default();
        assert!(config.enabled);
        assert_eq!(config.merge_point_threshold, 10);
        assert_eq!(config.promotion_threshold, 10);
        assert_eq!(config.megamorphic_threshold, 4);
        assert!(!config.dedup_counters);
        assert!(!config.loop_headers_only);
    }

    #[test]
    fn test_partial_json() {
        let config = JitConfig::from_json_str(r#"{"merge_point_threshold": 3, "record_events": true}"#)
            .unwrap();
        assert_eq!(config.merge_point_threshold, 3);
        assert!(config.record_events);
        assert_eq!(config.promotion_threshold, 10);
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let err = JitConfig::from_json_str(r#"{"promotion_threshold": 0}"#).unwrap_err();
        assert_eq!(err.to_string(), "ConfigError: promotion_threshold must be at least 1");
        assert!(JitConfig::from_json_str(r#"{"bogus": 1}"#).is_ok());
    }
}
