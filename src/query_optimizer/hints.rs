//! Plan hints and the predicate the search uses to filter alternatives.
//!
//! Hints arrive already parsed. A scan hint names a relation (and optionally
//! some of its indexes) and lists the access methods that are required or
//! forbidden for it; a join type hint names the set of relations below a join
//! and the join method required or forbidden for it. Relations and joins with
//! no matching hint accept every alternative.

use super::plan::PhysicalOperator;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanHintType {
    SeqScan,
    NoSeqScan,
    IndexScan,
    NoIndexScan,
    IndexOnlyScan,
    NoIndexOnlyScan,
    BitmapScan,
    NoBitmapScan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMethod {
    SeqScan,
    IndexScan,
    IndexOnlyScan,
    BitmapScan,
}

impl ScanHintType {
    fn accepts(self, method: AccessMethod) -> bool {
        match self {
            ScanHintType::SeqScan => method == AccessMethod::SeqScan,
            ScanHintType::NoSeqScan => method != AccessMethod::SeqScan,
            ScanHintType::IndexScan => method == AccessMethod::IndexScan,
            ScanHintType::NoIndexScan => method != AccessMethod::IndexScan,
            ScanHintType::IndexOnlyScan => method == AccessMethod::IndexOnlyScan,
            ScanHintType::NoIndexOnlyScan => method != AccessMethod::IndexOnlyScan,
            ScanHintType::BitmapScan => method == AccessMethod::BitmapScan,
            ScanHintType::NoBitmapScan => method != AccessMethod::BitmapScan,
        }
    }
}

/// Access method constraints for one relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanHint {
    /// Relation name or alias
    pub relation: String,
    /// Indexes the hint applies to; empty means any index
    #[serde(default)]
    pub index_names: Vec<String>,
    /// Constraints that must all hold
    pub types: Vec<ScanHintType>,
}

impl ScanHint {
    pub fn new(relation: impl Into<String>, types: Vec<ScanHintType>) -> Self {
        Self {
            relation: relation.into(),
            index_names: Vec::new(),
            types,
        }
    }

    pub fn with_index(mut self, name: impl Into<String>) -> Self {
        self.index_names.push(name.into());
        self
    }

    pub fn satisfied_by(&self, method: AccessMethod) -> bool {
        self.types.iter().all(|t| t.accepts(method))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinTypeHintType {
    NestLoop,
    NoNestLoop,
    HashJoin,
    NoHashJoin,
    MergeJoin,
    NoMergeJoin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinMethod {
    NestLoop,
    HashJoin,
    MergeJoin,
}

/// Join method constraint for the join of exactly `aliases`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinTypeHint {
    pub aliases: Vec<String>,
    pub join_type: JoinTypeHintType,
}

impl JoinTypeHint {
    pub fn satisfied_by(&self, method: JoinMethod) -> bool {
        match self.join_type {
            JoinTypeHintType::NestLoop => method == JoinMethod::NestLoop,
            JoinTypeHintType::NoNestLoop => method != JoinMethod::NestLoop,
            JoinTypeHintType::HashJoin => method == JoinMethod::HashJoin,
            JoinTypeHintType::NoHashJoin => method != JoinMethod::HashJoin,
            JoinTypeHintType::MergeJoin => method == JoinMethod::MergeJoin,
            JoinTypeHintType::NoMergeJoin => method != JoinMethod::MergeJoin,
        }
    }

    fn covers_exactly(&self, aliases: &[String]) -> bool {
        sorted(&self.aliases) == sorted(aliases)
    }
}

fn sorted(names: &[String]) -> Vec<&str> {
    let mut names: Vec<&str> = names.iter().map(String::as_str).collect();
    names.sort_unstable();
    names.dedup();
    names
}

/// All hints of one query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanHint {
    #[serde(default)]
    pub scan_hints: Vec<ScanHint>,
    #[serde(default)]
    pub join_type_hints: Vec<JoinTypeHint>,
}

impl PlanHint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.scan_hints.is_empty() && self.join_type_hints.is_empty()
    }

    pub fn with_scan_hint(mut self, hint: ScanHint) -> Self {
        self.scan_hints.push(hint);
        self
    }

    pub fn with_join_type_hint(mut self, hint: JoinTypeHint) -> Self {
        self.join_type_hints.push(hint);
        self
    }

    pub fn scan_hint(&self, relation: &str) -> Option<&ScanHint> {
        self.scan_hints.iter().find(|h| h.relation == relation)
    }

    pub fn join_type_hint(&self, aliases: &[String]) -> Option<&JoinTypeHint> {
        self.join_type_hints.iter().find(|h| h.covers_exactly(aliases))
    }
}

/// What a hint sees of one search alternative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Candidate<'a> {
    Scan {
        relation: &'a str,
        method: AccessMethod,
        index: Option<&'a str>,
    },
    Join {
        aliases: &'a [String],
        method: JoinMethod,
    },
}

impl<'a> Candidate<'a> {
    /// The candidate `op` represents, or `None` for operators hints never
    /// constrain. `aliases` are the relations below a join.
    pub fn for_operator(op: &'a PhysicalOperator, aliases: &'a [String]) -> Option<Self> {
        let scan = |table: &'a str, method, index: Option<&'a str>| {
            Some(Candidate::Scan {
                relation: table,
                method,
                index,
            })
        };
        match op {
            PhysicalOperator::TableScan { table }
            | PhysicalOperator::DynamicTableScan { table, .. }
            | PhysicalOperator::ForeignScan { table }
            | PhysicalOperator::DynamicForeignScan { table, .. } => scan(table.name.as_str(), AccessMethod::SeqScan, None),
            PhysicalOperator::IndexScan { table, index, .. }
            | PhysicalOperator::DynamicIndexScan { table, index, .. } => {
                scan(table.name.as_str(), AccessMethod::IndexScan, Some(index.name.as_str()))
            }
            PhysicalOperator::IndexOnlyScan { table, index, .. }
            | PhysicalOperator::DynamicIndexOnlyScan { table, index, .. } => {
                scan(table.name.as_str(), AccessMethod::IndexOnlyScan, Some(index.name.as_str()))
            }
            PhysicalOperator::BitmapTableScan { table, condition }
            | PhysicalOperator::DynamicBitmapTableScan { table, condition, .. } => scan(
                table.name.as_str(),
                AccessMethod::BitmapScan,
                condition.probe.as_ref().map(|p| p.index.name.as_str()),
            ),
            PhysicalOperator::HashJoin { .. } => Some(Candidate::Join {
                aliases,
                method: JoinMethod::HashJoin,
            }),
            PhysicalOperator::NLJoin { .. } | PhysicalOperator::IndexNLJoin { .. } => Some(Candidate::Join {
                aliases,
                method: JoinMethod::NestLoop,
            }),
            PhysicalOperator::FullMergeJoin { .. } => Some(Candidate::Join {
                aliases,
                method: JoinMethod::MergeJoin,
            }),
            _ => None,
        }
    }
}

impl fmt::Display for Candidate<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Candidate::Scan {
                relation,
                method,
                index: Some(index),
            } => write!(f, "{method:?}({relation} using {index})"),
            Candidate::Scan { relation, method, .. } => write!(f, "{method:?}({relation})"),
            Candidate::Join { aliases, method } => write!(f, "{method:?}({})", aliases.join(" ")),
        }
    }
}

/// Decides whether a search alternative may be costed under the query's hints.
pub trait HintPredicate: Send + Sync + fmt::Debug {
    fn satisfies_hints(&self, candidate: &Candidate<'_>, hints: &PlanHint) -> bool;
}

/// Default predicate: a scan hint applies to an index-based alternative only
/// when it lists that index or lists no index at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanHintPredicate;

impl HintPredicate for PlanHintPredicate {
    fn satisfies_hints(&self, candidate: &Candidate<'_>, hints: &PlanHint) -> bool {
        match candidate {
            Candidate::Scan {
                relation,
                method,
                index,
            } => {
                let Some(hint) = hints.scan_hint(relation) else {
                    return true;
                };
                match index {
                    Some(name) if hint.index_names.iter().any(|n| n == name) => hint.satisfied_by(*method),
                    Some(_) => hint.index_names.is_empty() && hint.satisfied_by(*method),
                    None => hint.satisfied_by(*method),
                }
            }
            Candidate::Join { aliases, method } => hints
                .join_type_hint(aliases)
                .map_or(true, |hint| hint.satisfied_by(*method)),
        }
    }
}
