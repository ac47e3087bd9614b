//! Tunable unit costs of the calibrated MPP cost model.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Key of one cost model tunable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CostParam {
    SeqIoBandwidth,
    RandomIoBandwidth,
    TupProcBandwidth,
    OutputBandwidth,
    InitScanFactor,
    TableScanCostUnit,
    InitIndexScanFactor,
    IndexBlockCostUnit,
    IndexFilterCostUnit,
    IndexScanTupCostUnit,
    IndexScanTupRandomFactor,
    IndexOnlyScanTupCostUnit,
    IndexCostConversionFactor,
    FilterColCostUnit,
    OutputTupCostUnit,
    GatherSendCostUnit,
    GatherRecvCostUnit,
    RedistributeSendCostUnit,
    RedistributeRecvCostUnit,
    BroadcastSendCostUnit,
    BroadcastRecvCostUnit,
    NoOpCostUnit,
    JoinFeedingTupColumnCostUnit,
    JoinFeedingTupWidthCostUnit,
    JoinOutputTupCostUnit,
    HjSpillingMemThreshold,
    HjHashTableInitCostFactor,
    HjHashTableColumnCostUnit,
    HjHashTableWidthCostUnit,
    HjHashingTupWidthCostUnit,
    HjFeedingTupColumnSpillingCostUnit,
    HjFeedingTupWidthSpillingCostUnit,
    HjHashingTupWidthSpillingCostUnit,
    HashAggInputTupColumnCostUnit,
    HashAggInputTupWidthCostUnit,
    HashAggOutputTupWidthCostUnit,
    SortTupWidthCostUnit,
    TupDefaultProcCostUnit,
    MaterializeCostUnit,
    TupUpdateBandwidth,
    NetworkBandwidth,
    NljFactor,
    HjFactor,
    HashFactor,
    DefaultCost,
    IndexJoinAllowedRiskThreshold,
    BitmapIoCostLargeNdv,
    BitmapIoCostSmallNdv,
    BitmapPageCostLargeNdv,
    BitmapPageCostSmallNdv,
    BitmapPageCost,
    BitmapNdvThreshold,
    BitmapScanRebindCost,
    PenalizeHjSkewUpperLimit,
    ScalarFuncCost,
}

impl CostParam {
    pub const COUNT: usize = 55;

    pub const ALL: [CostParam; CostParam::COUNT] = [
        CostParam::SeqIoBandwidth,
        CostParam::RandomIoBandwidth,
        CostParam::TupProcBandwidth,
        CostParam::OutputBandwidth,
        CostParam::InitScanFactor,
        CostParam::TableScanCostUnit,
        CostParam::InitIndexScanFactor,
        CostParam::IndexBlockCostUnit,
        CostParam::IndexFilterCostUnit,
        CostParam::IndexScanTupCostUnit,
        CostParam::IndexScanTupRandomFactor,
        CostParam::IndexOnlyScanTupCostUnit,
        CostParam::IndexCostConversionFactor,
        CostParam::FilterColCostUnit,
        CostParam::OutputTupCostUnit,
        CostParam::GatherSendCostUnit,
        CostParam::GatherRecvCostUnit,
        CostParam::RedistributeSendCostUnit,
        CostParam::RedistributeRecvCostUnit,
        CostParam::BroadcastSendCostUnit,
        CostParam::BroadcastRecvCostUnit,
        CostParam::NoOpCostUnit,
        CostParam::JoinFeedingTupColumnCostUnit,
        CostParam::JoinFeedingTupWidthCostUnit,
        CostParam::JoinOutputTupCostUnit,
        CostParam::HjSpillingMemThreshold,
        CostParam::HjHashTableInitCostFactor,
        CostParam::HjHashTableColumnCostUnit,
        CostParam::HjHashTableWidthCostUnit,
        CostParam::HjHashingTupWidthCostUnit,
        CostParam::HjFeedingTupColumnSpillingCostUnit,
        CostParam::HjFeedingTupWidthSpillingCostUnit,
        CostParam::HjHashingTupWidthSpillingCostUnit,
        CostParam::HashAggInputTupColumnCostUnit,
        CostParam::HashAggInputTupWidthCostUnit,
        CostParam::HashAggOutputTupWidthCostUnit,
        CostParam::SortTupWidthCostUnit,
        CostParam::TupDefaultProcCostUnit,
        CostParam::MaterializeCostUnit,
        CostParam::TupUpdateBandwidth,
        CostParam::NetworkBandwidth,
        CostParam::NljFactor,
        CostParam::HjFactor,
        CostParam::HashFactor,
        CostParam::DefaultCost,
        CostParam::IndexJoinAllowedRiskThreshold,
        CostParam::BitmapIoCostLargeNdv,
        CostParam::BitmapIoCostSmallNdv,
        CostParam::BitmapPageCostLargeNdv,
        CostParam::BitmapPageCostSmallNdv,
        CostParam::BitmapPageCost,
        CostParam::BitmapNdvThreshold,
        CostParam::BitmapScanRebindCost,
        CostParam::PenalizeHjSkewUpperLimit,
        CostParam::ScalarFuncCost,
    ];

    /// Calibrated default for a fresh session.
    pub fn default_value(self) -> f64 {
        match self {
            CostParam::SeqIoBandwidth => 1024.0,
            CostParam::RandomIoBandwidth => 30.0,
            CostParam::TupProcBandwidth => 512.0,
            CostParam::OutputBandwidth => 256.0,
            CostParam::InitScanFactor => 431.0,
            CostParam::TableScanCostUnit => 5.50e-07,
            CostParam::InitIndexScanFactor => 142.0,
            CostParam::IndexBlockCostUnit => 1.27e-06,
            CostParam::IndexFilterCostUnit => 1.65e-04,
            CostParam::IndexScanTupCostUnit => 3.66e-06,
            CostParam::IndexScanTupRandomFactor => 6.0,
            CostParam::IndexOnlyScanTupCostUnit => 1.0e-06,
            CostParam::IndexCostConversionFactor => 1.0e-04,
            CostParam::FilterColCostUnit => 3.29e-05,
            CostParam::OutputTupCostUnit => 1.86e-06,
            CostParam::GatherSendCostUnit => 4.58e-06,
            CostParam::GatherRecvCostUnit => 2.20e-06,
            CostParam::RedistributeSendCostUnit => 2.33e-06,
            CostParam::RedistributeRecvCostUnit => 8.0e-07,
            CostParam::BroadcastSendCostUnit => 4.965e-05,
            CostParam::BroadcastRecvCostUnit => 1.35e-06,
            CostParam::NoOpCostUnit => 1.0e-10,
            CostParam::JoinFeedingTupColumnCostUnit => 8.69e-05,
            CostParam::JoinFeedingTupWidthCostUnit => 6.09e-07,
            CostParam::JoinOutputTupCostUnit => 3.50e-06,
            CostParam::HjSpillingMemThreshold => 50.0 * 1024.0 * 1024.0,
            CostParam::HjHashTableInitCostFactor => 500.0,
            CostParam::HjHashTableColumnCostUnit => 5.0e-05,
            CostParam::HjHashTableWidthCostUnit => 3.0e-06,
            CostParam::HjHashingTupWidthCostUnit => 1.97e-08,
            CostParam::HjFeedingTupColumnSpillingCostUnit => 1.97e-04,
            CostParam::HjFeedingTupWidthSpillingCostUnit => 3.0e-06,
            CostParam::HjHashingTupWidthSpillingCostUnit => 2.30e-05,
            CostParam::HashAggInputTupColumnCostUnit => 1.20e-04,
            CostParam::HashAggInputTupWidthCostUnit => 1.12e-07,
            CostParam::HashAggOutputTupWidthCostUnit => 5.61e-07,
            CostParam::SortTupWidthCostUnit => 5.67e-06,
            CostParam::TupDefaultProcCostUnit => 1.0e-06,
            CostParam::MaterializeCostUnit => 4.68e-06,
            CostParam::TupUpdateBandwidth => 256.0,
            CostParam::NetworkBandwidth => 1024.0,
            CostParam::NljFactor => 1.0,
            CostParam::HjFactor => 1.0,
            CostParam::HashFactor => 2.0,
            CostParam::DefaultCost => 100.0,
            CostParam::IndexJoinAllowedRiskThreshold => 3.0,
            CostParam::BitmapIoCostLargeNdv => 0.0082,
            CostParam::BitmapIoCostSmallNdv => 0.2138,
            CostParam::BitmapPageCostLargeNdv => 83.1651,
            CostParam::BitmapPageCostSmallNdv => 204.3810,
            CostParam::BitmapPageCost => 10.0,
            CostParam::BitmapNdvThreshold => 200.0,
            CostParam::BitmapScanRebindCost => 0.06,
            CostParam::PenalizeHjSkewUpperLimit => 10.0,
            CostParam::ScalarFuncCost => 1.0e-04,
        }
    }

    /// Smallest value the cost model accepts for this key. The skew cap must
    /// not shrink a ratio below one, and the nested-loop factor must keep plain
    /// nested-loop joins at least as penalised as index nested-loop joins.
    fn minimum(self) -> f64 {
        match self {
            CostParam::PenalizeHjSkewUpperLimit | CostParam::NljFactor => 1.0,
            _ => 0.0,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for CostParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A parameter value with the range it may be moved within by calibration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamValue {
    pub value: f64,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

impl ParamValue {
    pub fn new(value: f64) -> Self {
        Self {
            value,
            lower: None,
            upper: None,
        }
    }

    fn in_bounds(&self, value: f64) -> bool {
        self.lower.map_or(true, |l| value >= l) && self.upper.map_or(true, |u| value <= u)
    }
}

/// The full parameter table, built once per session and read-only afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct CostModelParams {
    values: [ParamValue; CostParam::COUNT],
}

impl Default for CostModelParams {
    fn default() -> Self {
        let mut values = [ParamValue::new(0.0); CostParam::COUNT];
        for param in CostParam::ALL {
            values[param.index()] = ParamValue::new(param.default_value());
        }
        Self { values }
    }
}

impl CostModelParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with `overrides` applied on top.
    pub fn with_overrides(overrides: &BTreeMap<CostParam, f64>) -> Result<Self> {
        let mut params = Self::default();
        for (param, value) in overrides {
            params.set(*param, *value)?;
        }
        Ok(params)
    }

    pub fn get(&self, param: CostParam) -> f64 {
        self.values[param.index()].value
    }

    pub fn lookup(&self, param: CostParam) -> &ParamValue {
        &self.values[param.index()]
    }

    /// Change one value. Values outside the key's calibration bounds are rejected.
    pub fn set(&mut self, param: CostParam, value: f64) -> Result<()> {
        let slot = &mut self.values[param.index()];
        if !value.is_finite() || !slot.in_bounds(value) {
            return Err(Error::Config(format!(
                "value {value} for {param} is outside [{:?}, {:?}]",
                slot.lower, slot.upper
            )));
        }
        slot.value = value;
        Ok(())
    }

    pub fn set_bounds(&mut self, param: CostParam, lower: Option<f64>, upper: Option<f64>) -> Result<()> {
        if let (Some(l), Some(u)) = (lower, upper) {
            if l > u {
                return Err(Error::Config(format!("empty bounds [{l}, {u}] for {param}")));
            }
        }
        let slot = &mut self.values[param.index()];
        slot.lower = lower;
        slot.upper = upper;
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (CostParam, &ParamValue)> + '_ {
        CostParam::ALL.iter().map(move |p| (*p, &self.values[p.index()]))
    }

    /// Every tunable must be strictly positive, and at least its minimum,
    /// before a cost model may be built on this table.
    pub fn validate(&self) -> Result<()> {
        for (param, value) in self.iter() {
            let v = value.value;
            if !(v.is_finite() && v > 0.0 && v >= param.minimum()) {
                return Err(Error::ConfigurationInvariantViolation {
                    param: param.to_string(),
                    value: v,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_lists_every_param_once() {
        for (i, param) in CostParam::ALL.iter().enumerate() {
            assert_eq!(param.index(), i);
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let params = CostModelParams::new();
        params.validate().unwrap();
        assert_eq!(params.get(CostParam::InitScanFactor), 431.0);
        assert_eq!(params.get(CostParam::HjSpillingMemThreshold), 52_428_800.0);
    }

    #[test]
    fn test_non_positive_param_is_rejected() {
        let mut overrides = BTreeMap::new();
        overrides.insert(CostParam::SortTupWidthCostUnit, 0.0);
        let params = CostModelParams::with_overrides(&overrides).unwrap();
        match params.validate() {
            Err(Error::ConfigurationInvariantViolation { param, value }) => {
                assert_eq!(param, "SortTupWidthCostUnit");
                assert_eq!(value, 0.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_skew_cap_below_one_is_rejected() {
        let mut params = CostModelParams::new();
        params.set(CostParam::PenalizeHjSkewUpperLimit, 0.5).unwrap();
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_bounds_are_enforced() {
        let mut params = CostModelParams::new();
        params
            .set_bounds(CostParam::NljFactor, Some(1.0), Some(4.0))
            .unwrap();
        params.set(CostParam::NljFactor, 2.0).unwrap();
        assert!(params.set(CostParam::NljFactor, 5.0).is_err());
        assert_eq!(params.get(CostParam::NljFactor), 2.0);
        assert!(params.set_bounds(CostParam::NljFactor, Some(3.0), Some(1.0)).is_err());
    }
}
