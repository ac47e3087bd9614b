//! Hash join spill detection, redistribution skew penalties and the
//! unused-index-column weight used by index scan costing.

use super::plan::{ColumnId, NodeStats, TableStats};

/// Base of the exponential skew factor scaling; factor 100 gives about 20x.
pub const SKEW_FACTOR_BASE: f64 = 1.0307;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpillRegime {
    InMemory,
    Spilling,
}

/// The inner side of a hash join spills once `rows * width` passes `threshold`.
pub fn spill_regime(inner_rows: f64, inner_width: f64, threshold: f64) -> SpillRegime {
    if inner_rows * inner_width <= threshold {
        SpillRegime::InMemory
    } else {
        SpillRegime::Spilling
    }
}

/// `1.0307^(factor - 1)` for a user skew factor in `1..=100`.
pub fn skew_factor_multiplier(factor: u32) -> f64 {
    SKEW_FACTOR_BASE.powi(factor as i32 - 1)
}

/// Combined NDV of the redistribution key: the product of per-column NDVs.
/// Zero when any key column has no statistics.
pub fn redistribution_ndv(columns: &[ColumnId], stats: &NodeStats) -> f64 {
    columns
        .iter()
        .map(|c| stats.ndv(*c).unwrap_or(0.0))
        .product()
}

/// A redistribute motion feeding a hash join.
#[derive(Debug, Clone, Copy)]
pub struct RedistributedInput<'a> {
    pub columns: &'a [ColumnId],
    pub stats: &'a NodeStats,
}

/// Settings that bound the skew ratio of one hash join.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkewPolicy {
    pub segments: u32,
    /// User skew factor; 0 disables it and applies `upper_limit` instead.
    pub skew_factor: u32,
    pub upper_limit: f64,
}

impl SkewPolicy {
    /// Multiplier (never below 1) applied to the local cost of a hash join
    /// whose redistributed inputs are `inputs`.
    pub fn skew_ratio<'a, I>(&self, inputs: I) -> f64
    where
        I: IntoIterator<Item = RedistributedInput<'a>>,
    {
        let segments = f64::from(self.segments);
        let mut ratio: f64 = 1.0;
        for input in inputs {
            let ndv = redistribution_ndv(input.columns, input.stats);
            if ndv < segments && ndv >= 1.0 {
                ratio = ratio.max(segments / ndv);
            }
            if self.skew_factor > 0 {
                let scaled = skew_factor_multiplier(self.skew_factor) * input.stats.histogram_skew;
                ratio = ratio.max(scaled);
            } else {
                ratio = ratio.min(self.upper_limit);
            }
        }
        ratio.max(1.0)
    }
}

/// Penalty for index key columns the predicate does not use. Column `i` of
/// `n` key columns weighs `(n - i) * ndv / table_rows`, so leading gaps cost more.
pub fn unused_index_weight(index_columns: &[ColumnId], used_columns: &[ColumnId], table: &TableStats) -> f64 {
    if index_columns.is_empty() || used_columns.is_empty() || table.rows <= 0.0 {
        return 0.0;
    }
    let n = index_columns.len();
    index_columns
        .iter()
        .enumerate()
        .filter(|(_, col)| !used_columns.contains(*col))
        .map(|(pos, col)| {
            let ndv = table.ndv(*col).unwrap_or(0.0);
            (n - pos) as f64 * (ndv / table.rows)
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(skew_factor: u32) -> SkewPolicy {
        SkewPolicy {
            segments: 8,
            skew_factor,
            upper_limit: 10.0,
        }
    }

    #[test]
    fn test_spill_threshold_is_inclusive() {
        assert_eq!(spill_regime(1000.0, 50.0, 50_000.0), SpillRegime::InMemory);
        assert_eq!(spill_regime(1000.0, 50.01, 50_000.0), SpillRegime::Spilling);
    }

    #[test]
    fn test_multiplier_scale() {
        assert_eq!(skew_factor_multiplier(1), 1.0);
        let hundred = skew_factor_multiplier(100);
        assert!(hundred > 19.0 && hundred < 21.0, "{hundred}");
    }

    #[test]
    fn test_low_ndv_is_penalised() {
        let stats = NodeStats::new(1000.0, 8.0).with_ndv(1, 2.0);
        let ratio = policy(0).skew_ratio([RedistributedInput {
            columns: &[1],
            stats: &stats,
        }]);
        assert_eq!(ratio, 4.0);
    }

    #[test]
    fn test_enough_ndv_means_no_penalty() {
        let stats = NodeStats::new(1000.0, 8.0).with_ndv(1, 8.0).with_ndv(2, 3.0);
        let ratio = policy(0).skew_ratio([RedistributedInput {
            columns: &[1, 2],
            stats: &stats,
        }]);
        assert_eq!(ratio, 1.0);
    }

    #[test]
    fn test_missing_stats_are_not_penalised() {
        let stats = NodeStats::new(1000.0, 8.0);
        let ratio = policy(0).skew_ratio([RedistributedInput {
            columns: &[1],
            stats: &stats,
        }]);
        assert_eq!(ratio, 1.0);
    }

    #[test]
    fn test_upper_limit_caps_ratio() {
        let stats = NodeStats::new(1000.0, 8.0).with_ndv(1, 1.0);
        let p = SkewPolicy {
            segments: 64,
            skew_factor: 0,
            upper_limit: 10.0,
        };
        let ratio = p.skew_ratio([RedistributedInput {
            columns: &[1],
            stats: &stats,
        }]);
        assert_eq!(ratio, 10.0);
    }

    #[test]
    fn test_skew_factor_uses_histogram_skew() {
        let stats = NodeStats::new(1000.0, 8.0)
            .with_ndv(1, 100.0)
            .with_histogram_skew(3.0);
        let ratio = policy(1).skew_ratio([RedistributedInput {
            columns: &[1],
            stats: &stats,
        }]);
        assert_eq!(ratio, 3.0);
    }

    #[test]
    fn test_unused_index_weight_prefers_leading_columns() {
        let mut table = TableStats::new(1000.0, 32.0);
        table.column_ndvs.insert(1, 100.0);
        table.column_ndvs.insert(2, 100.0);
        table.column_ndvs.insert(3, 100.0);
        let leading_gap = unused_index_weight(&[1, 2, 3], &[2, 3], &table);
        let trailing_gap = unused_index_weight(&[1, 2, 3], &[1, 2], &table);
        assert!((leading_gap - 0.3).abs() < 1e-12);
        assert!((trailing_gap - 0.1).abs() < 1e-12);
        assert_eq!(unused_index_weight(&[1, 2, 3], &[], &table), 0.0);
        assert_eq!(unused_index_weight(&[1], &[2], &TableStats::new(0.0, 1.0)), 0.0);
    }
}
