//! Optimizer session configuration
//!
//! Loaded from JSON. Every section has defaults, so an empty object is a
//! valid configuration.

use crate::query_optimizer::cost_model::DEFAULT_BROADCAST_THRESHOLD;
use crate::query_optimizer::hints::PlanHint;
use crate::query_optimizer::params::{CostModelParams, CostParam};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Largest user skew factor accepted.
pub const MAX_SKEW_FACTOR: u32 = 100;

/// Which bitmap scan formulas the cost model uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostModelKind {
    #[default]
    Calibrated,
    Legacy,
}

/// Session knobs that shape motion and join costing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionHints {
    /// User skew factor in `0..=100`; 0 leaves skew to the NDV heuristic
    pub skew_factor: u32,
    /// Input rows above which a broadcast motion is penalised, 0 disables
    pub broadcast_threshold: u64,
}

impl Default for SessionHints {
    fn default() -> Self {
        Self {
            skew_factor: 0,
            broadcast_threshold: DEFAULT_BROADCAST_THRESHOLD,
        }
    }
}

/// Optimizer trace flags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceFlags {
    /// Scale hash joins over low-NDV redistributions by the skew ratio
    pub penalize_skewed_hash_join: bool,
    /// Make hash joins over hash redistributions prohibitively expensive
    pub discard_redistribute_hash_join: bool,
}

impl Default for TraceFlags {
    fn default() -> Self {
        Self {
            penalize_skewed_hash_join: true,
            discard_redistribute_hash_join: false,
        }
    }
}

/// Complete configuration of one optimizer session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Number of primary segments in the cluster
    pub segments: u32,
    pub hints: SessionHints,
    /// Parsed plan hints of the query
    pub plan_hints: PlanHint,
    pub traces: TraceFlags,
    pub cost_model: CostModelKind,
    /// Overrides of individual cost parameters
    pub cost_params: BTreeMap<CostParam, f64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            segments: 3,
            hints: SessionHints::default(),
            plan_hints: PlanHint::default(),
            traces: TraceFlags::default(),
            cost_model: CostModelKind::default(),
            cost_params: BTreeMap::new(),
        }
    }
}

impl OptimizerConfig {
    /// Parse a JSON configuration and validate it.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: OptimizerConfig =
            serde_json::from_str(content).map_err(|e| Error::Config(format!("JSON parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("JSON serialization error: {}", e)))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.segments == 0 {
            return Err(Error::Config("Segment count must be greater than 0".into()));
        }

        if self.hints.skew_factor > MAX_SKEW_FACTOR {
            return Err(Error::Config(format!(
                "Skew factor must be between 0 and {}",
                MAX_SKEW_FACTOR
            )));
        }

        for hint in &self.plan_hints.scan_hints {
            if hint.types.is_empty() {
                return Err(Error::Config(format!("Scan hint for {} lists no scan types", hint.relation)));
            }
        }

        for hint in &self.plan_hints.join_type_hints {
            if hint.aliases.len() < 2 {
                return Err(Error::Config("Join type hint must name at least two relations".into()));
            }
        }

        CostModelParams::with_overrides(&self.cost_params)?.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_gives_defaults() {
        let config = OptimizerConfig::from_json("{}").unwrap();
        assert_eq!(config, OptimizerConfig::default());
        assert_eq!(config.hints.broadcast_threshold, 100_000);
        assert!(config.traces.penalize_skewed_hash_join);
    }

    #[test]
    fn test_config_validation() {
        let mut config = OptimizerConfig::default();
        assert!(config.validate().is_ok());

        config.segments = 0;
        assert!(config.validate().is_err());

        let mut config = OptimizerConfig::default();
        config.hints.skew_factor = 101;
        assert!(config.validate().is_err());

        let mut config = OptimizerConfig::default();
        config.cost_params.insert(CostParam::NljFactor, -1.0);
        assert!(matches!(
            config.validate(),
            Err(Error::ConfigurationInvariantViolation { .. })
        ));
    }

    #[test]
    fn test_param_overrides_parse() {
        let config = OptimizerConfig::from_json(
            r#"{"segments": 16, "cost_model": "legacy", "cost_params": {"SortTupWidthCostUnit": 1e-5}}"#,
        )
        .unwrap();
        assert_eq!(config.segments, 16);
        assert_eq!(config.cost_model, CostModelKind::Legacy);
        assert_eq!(config.cost_params.get(&CostParam::SortTupWidthCostUnit), Some(&1e-5));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("optimizer.json");
        let mut config = OptimizerConfig::default();
        config.hints.skew_factor = 40;
        config.save(&path).unwrap();
        assert_eq!(OptimizerConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        assert!(matches!(OptimizerConfig::from_json("{segments"), Err(Error::Config(_))));
    }
}
