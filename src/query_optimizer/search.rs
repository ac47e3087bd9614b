//! Memo-based plan search
//!
//! A logical query tree is copied into a memo of groups, one per logical
//! subexpression. Exploration xforms add equivalent logical expressions to a
//! group; implementation xforms turn logical expressions into physical
//! alternatives together with the distribution each child must deliver.
//! Groups are optimized top-down per required distribution (and sort order),
//! with motions and sorts inserted where a child cannot deliver what its parent
//! needs. Every alternative is filtered through the plan hints before it is
//! costed.

use super::cost_model::CostModel;
use super::hints::{Candidate, HintPredicate, PlanHint, PlanHintPredicate};
use super::plan::{
    AggStage, BitmapCondition, BitmapProbe, ColumnId, Cost, Distribution, HashJoinKind, IndexCondition,
    IndexDescriptor, IndexType, MotionKind, NLJoinKind, NodeId, NodeStats, PhysicalOperator, PlanArena,
    StorageKind, TableDescriptor,
};
use crate::config::OptimizerConfig;
use crate::interrupt::Interrupt;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

pub type GroupId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    #[default]
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
}

impl CompareOp {
    /// Whether an index on the column can evaluate the comparison.
    pub fn is_indexable(self) -> bool {
        self != CompareOp::Ne
    }
}

/// One conjunct of a selection, `column <op> constant`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Predicate {
    pub column: ColumnId,
    #[serde(default)]
    pub op: CompareOp,
}

/// Equi-join key pair, `left = right`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinKey {
    pub left: ColumnId,
    pub right: ColumnId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregate {
    pub function: String,
    #[serde(default)]
    pub column: Option<ColumnId>,
}

/// Logical query tree, annotated with the statistics derived for each node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LogicalExpr {
    Get {
        table: String,
        /// Columns read; all table columns when absent
        #[serde(default)]
        columns: Option<Vec<ColumnId>>,
        stats: NodeStats,
    },
    Select {
        predicates: Vec<Predicate>,
        input: Box<LogicalExpr>,
        stats: NodeStats,
    },
    InnerJoin {
        keys: Vec<JoinKey>,
        left: Box<LogicalExpr>,
        right: Box<LogicalExpr>,
        stats: NodeStats,
    },
    GbAgg {
        #[serde(default)]
        grouping: Vec<ColumnId>,
        #[serde(default)]
        aggregates: Vec<Aggregate>,
        input: Box<LogicalExpr>,
        stats: NodeStats,
    },
}

impl LogicalExpr {
    pub fn stats(&self) -> &NodeStats {
        match self {
            LogicalExpr::Get { stats, .. }
            | LogicalExpr::Select { stats, .. }
            | LogicalExpr::InnerJoin { stats, .. }
            | LogicalExpr::GbAgg { stats, .. } => stats,
        }
    }
}

/// A query to optimize: the relations it reads and its logical tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryInput {
    pub tables: Vec<TableDescriptor>,
    pub plan: LogicalExpr,
}

impl QueryInput {
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| Error::Serialization(format!("JSON parse error: {}", e)))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }
}

/// Relations visible to one query, by name.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    tables: HashMap<String, Arc<TableDescriptor>>,
}

impl Catalog {
    pub fn new(tables: impl IntoIterator<Item = TableDescriptor>) -> Result<Self> {
        let mut catalog = Catalog::default();
        for table in tables {
            if catalog.tables.contains_key(&table.name) {
                return Err(Error::InvalidPlan(format!("relation {} defined twice", table.name)));
            }
            catalog.tables.insert(table.name.clone(), Arc::new(table));
        }
        Ok(catalog)
    }

    pub fn table(&self, name: &str) -> Result<Arc<TableDescriptor>> {
        self.tables
            .get(name)
            .cloned()
            .ok_or_else(|| Error::InvalidPlan(format!("unknown relation {name}")))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogicalOperator {
    Get {
        table: Arc<TableDescriptor>,
        columns: Vec<ColumnId>,
    },
    Select {
        predicates: Vec<Predicate>,
    },
    InnerJoin {
        keys: Vec<JoinKey>,
    },
    GbAgg {
        grouping: Vec<ColumnId>,
        aggregates: Vec<Aggregate>,
    },
}

/// A logical expression whose inputs are memo groups.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupExpr {
    pub op: LogicalOperator,
    pub children: SmallVec<[GroupId; 2]>,
}

/// Physical properties a group's plan must deliver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Requirement {
    pub distribution: Distribution,
    pub sort: Vec<ColumnId>,
}

impl Requirement {
    pub fn any() -> Self {
        Self::distributed(Distribution::Any)
    }

    pub fn distributed(distribution: Distribution) -> Self {
        Self {
            distribution,
            sort: Vec::new(),
        }
    }

    pub fn sorted(mut self, columns: Vec<ColumnId>) -> Self {
        self.sort = columns;
        self
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.distribution)?;
        if !self.sort.is_empty() {
            write!(f, " sorted{:?}", self.sort)?;
        }
        Ok(())
    }
}

/// What an alternative asks of one child group.
#[derive(Debug, Clone, PartialEq)]
pub enum ChildRequirement {
    /// The parent's required distribution, unsorted
    Inherit,
    Exact(Requirement),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChildRequest {
    pub group: GroupId,
    pub requirement: ChildRequirement,
}

/// Distribution of an alternative's output.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivered {
    Fixed(Distribution),
    /// Whatever the given child delivers
    Child(usize),
}

/// One physical implementation of a group expression.
#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalAlternative {
    pub xform: &'static str,
    pub op: PhysicalOperator,
    pub children: SmallVec<[ChildRequest; 2]>,
    pub delivers: Delivered,
}

impl PhysicalAlternative {
    fn leaf(xform: &'static str, op: PhysicalOperator, distribution: Distribution) -> Self {
        Self {
            xform,
            op,
            children: SmallVec::new(),
            delivers: Delivered::Fixed(distribution),
        }
    }
}

pub enum XformResult {
    /// A logically equivalent expression for the same group
    Logical(GroupExpr),
    Physical(PhysicalAlternative),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XformKind {
    Exploration,
    Implementation,
}

/// A transformation rule applied to one expression of a memo group.
pub trait Xform: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;
    fn kind(&self) -> XformKind;
    /// Results for `expr` of `group`; empty when the pattern does not match.
    fn apply(&self, memo: &Memo, group: GroupId, expr: &GroupExpr) -> Vec<XformResult>;
}

#[derive(Debug, Clone)]
struct Winner {
    node: NodeId,
    cost: Cost,
    distribution: Distribution,
    /// Groups below (and including) this one whose hints had to be ignored
    violations: u32,
}

impl Winner {
    fn beats(&self, other: &Winner) -> bool {
        self.violations < other.violations || (self.violations == other.violations && self.cost < other.cost)
    }
}

#[derive(Debug)]
pub struct Group {
    exprs: Vec<GroupExpr>,
    stats: NodeStats,
    aliases: Vec<String>,
    columns: Vec<ColumnId>,
    explored: bool,
    alternatives: Option<Vec<PhysicalAlternative>>,
    winners: HashMap<Requirement, Option<Winner>>,
}

impl Group {
    pub fn exprs(&self) -> &[GroupExpr] {
        &self.exprs
    }

    pub fn stats(&self) -> &NodeStats {
        &self.stats
    }

    /// Relations read below this group.
    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    /// Columns this group produces.
    pub fn columns(&self) -> &[ColumnId] {
        &self.columns
    }
}

#[derive(Debug, Default)]
pub struct Memo {
    groups: Vec<Group>,
}

impl Memo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn group(&self, id: GroupId) -> &Group {
        &self.groups[id]
    }

    pub fn expr_count(&self) -> usize {
        self.groups.iter().map(|g| g.exprs.len()).sum()
    }

    /// Copy `expr` into the memo, one new group per node, returning its root group.
    pub fn insert(&mut self, expr: &LogicalExpr, catalog: &Catalog) -> Result<GroupId> {
        check_stats(expr.stats())?;
        let (op, children, aliases, columns) = match expr {
            LogicalExpr::Get { table, columns, .. } => {
                let table = catalog.table(table)?;
                let columns = columns.clone().unwrap_or_else(|| table.columns.clone());
                if let Some(bad) = columns.iter().find(|c| !table.columns.contains(c)) {
                    return Err(Error::InvalidPlan(format!("column {bad} is not in {}", table.name)));
                }
                let aliases = vec![table.name.clone()];
                let op = LogicalOperator::Get {
                    table,
                    columns: columns.clone(),
                };
                (op, SmallVec::new(), aliases, columns)
            }
            LogicalExpr::Select { predicates, input, .. } => {
                let child = self.insert(input, catalog)?;
                let group = &self.groups[child];
                require_columns(predicates.iter().map(|p| p.column), &group.columns, "selection")?;
                let op = LogicalOperator::Select {
                    predicates: predicates.clone(),
                };
                (op, smallvec![child], group.aliases.clone(), group.columns.clone())
            }
            LogicalExpr::InnerJoin { keys, left, right, .. } => {
                let left = self.insert(left, catalog)?;
                let right = self.insert(right, catalog)?;
                let (l, r) = (&self.groups[left], &self.groups[right]);
                require_columns(keys.iter().map(|k| k.left), &l.columns, "join key")?;
                require_columns(keys.iter().map(|k| k.right), &r.columns, "join key")?;
                let aliases = l.aliases.iter().chain(&r.aliases).cloned().collect();
                let columns = l.columns.iter().chain(&r.columns).copied().collect();
                let op = LogicalOperator::InnerJoin { keys: keys.clone() };
                (op, smallvec![left, right], aliases, columns)
            }
            LogicalExpr::GbAgg {
                grouping,
                aggregates,
                input,
                ..
            } => {
                let child = self.insert(input, catalog)?;
                let group = &self.groups[child];
                require_columns(grouping.iter().copied(), &group.columns, "grouping")?;
                require_columns(aggregates.iter().filter_map(|a| a.column), &group.columns, "aggregate")?;
                let op = LogicalOperator::GbAgg {
                    grouping: grouping.clone(),
                    aggregates: aggregates.clone(),
                };
                (op, smallvec![child], group.aliases.clone(), grouping.clone())
            }
        };
        let id = self.groups.len();
        self.groups.push(Group {
            exprs: vec![GroupExpr { op, children }],
            stats: expr.stats().clone(),
            aliases,
            columns,
            explored: false,
            alternatives: None,
            winners: HashMap::new(),
        });
        Ok(id)
    }

    /// Add `expr` to `group` unless an identical expression is already there.
    fn add_expr(&mut self, group: GroupId, expr: GroupExpr) -> bool {
        let exprs = &mut self.groups[group].exprs;
        if exprs.contains(&expr) {
            return false;
        }
        exprs.push(expr);
        true
    }
}

fn check_stats(stats: &NodeStats) -> Result<()> {
    let valid = [stats.rows, stats.width, stats.rebinds]
        .iter()
        .all(|v| v.is_finite() && *v >= 0.0);
    if !valid {
        return Err(Error::InvalidPlan(format!(
            "statistics must be finite and non-negative (rows={} width={} rebinds={})",
            stats.rows, stats.width, stats.rebinds
        )));
    }
    Ok(())
}

fn require_columns(mut used: impl Iterator<Item = ColumnId>, available: &[ColumnId], what: &str) -> Result<()> {
    match used.find(|c| !available.contains(c)) {
        Some(bad) => Err(Error::InvalidPlan(format!("{what} column {bad} is not produced by its input"))),
        None => Ok(()),
    }
}

fn scan_id(group: GroupId) -> u32 {
    group as u32
}

/// The Select-over-Get shape index xforms match on.
fn select_over_get<'m>(
    memo: &'m Memo,
    expr: &'m GroupExpr,
) -> Option<(&'m [Predicate], &'m Arc<TableDescriptor>, &'m [ColumnId])> {
    let LogicalOperator::Select { predicates } = &expr.op else {
        return None;
    };
    let child = *expr.children.first()?;
    memo.group(child).exprs.iter().find_map(|e| match &e.op {
        LogicalOperator::Get { table, columns } => Some((predicates.as_slice(), table, columns.as_slice())),
        _ => None,
    })
}

/// Key columns of `index` the predicates can probe, or `None` if there are none.
fn index_condition(index: &IndexDescriptor, predicates: &[Predicate]) -> Option<IndexCondition> {
    let used: Vec<ColumnId> = index
        .key_columns
        .iter()
        .copied()
        .filter(|k| predicates.iter().any(|p| p.column == *k && p.op.is_indexable()))
        .collect();
    if used.is_empty() {
        return None;
    }
    let residual_predicates = predicates.iter().filter(|p| !used.contains(&p.column)).count();
    Some(IndexCondition {
        used_columns: used,
        residual_predicates,
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Get2TableScan;

impl Xform for Get2TableScan {
    fn name(&self) -> &'static str {
        "Get2TableScan"
    }

    fn kind(&self) -> XformKind {
        XformKind::Implementation
    }

    fn apply(&self, _memo: &Memo, group: GroupId, expr: &GroupExpr) -> Vec<XformResult> {
        let LogicalOperator::Get { table, .. } = &expr.op else {
            return Vec::new();
        };
        let table = Arc::clone(table);
        let distribution = table.distribution.clone();
        let op = match (table.storage, table.partitioned) {
            (StorageKind::Foreign, false) => PhysicalOperator::ForeignScan { table },
            (StorageKind::Foreign, true) => PhysicalOperator::DynamicForeignScan {
                table,
                scan_id: scan_id(group),
            },
            (_, false) => PhysicalOperator::TableScan { table },
            (_, true) => PhysicalOperator::DynamicTableScan {
                table,
                scan_id: scan_id(group),
            },
        };
        vec![XformResult::Physical(PhysicalAlternative::leaf(self.name(), op, distribution))]
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Get2IndexScan;

impl Xform for Get2IndexScan {
    fn name(&self) -> &'static str {
        "Get2IndexScan"
    }

    fn kind(&self) -> XformKind {
        XformKind::Implementation
    }

    fn apply(&self, memo: &Memo, group: GroupId, expr: &GroupExpr) -> Vec<XformResult> {
        let Some((predicates, table, _)) = select_over_get(memo, expr) else {
            return Vec::new();
        };
        table
            .indexes
            .iter()
            .filter(|index| matches!(index.index_type, IndexType::Btree | IndexType::Hash))
            .filter_map(|index| {
                let condition = index_condition(index, predicates)?;
                let table = Arc::clone(table);
                let index = index.clone();
                let op = if table.partitioned {
                    PhysicalOperator::DynamicIndexScan {
                        table,
                        index,
                        condition,
                        scan_id: scan_id(group),
                    }
                } else {
                    PhysicalOperator::IndexScan {
                        table,
                        index,
                        condition,
                    }
                };
                let distribution = op.table()?.distribution.clone();
                Some(XformResult::Physical(PhysicalAlternative::leaf(self.name(), op, distribution)))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Get2IndexOnlyScan;

impl Xform for Get2IndexOnlyScan {
    fn name(&self) -> &'static str {
        "Get2IndexOnlyScan"
    }

    fn kind(&self) -> XformKind {
        XformKind::Implementation
    }

    fn apply(&self, memo: &Memo, group: GroupId, expr: &GroupExpr) -> Vec<XformResult> {
        let Some((predicates, table, columns)) = select_over_get(memo, expr) else {
            return Vec::new();
        };
        let mut needed: Vec<ColumnId> = columns.to_vec();
        needed.extend(predicates.iter().map(|p| p.column));
        table
            .indexes
            .iter()
            .filter(|index| index.index_type == IndexType::Btree && index.covers(&needed))
            .filter_map(|index| {
                let condition = index_condition(index, predicates)?;
                let table = Arc::clone(table);
                let index = index.clone();
                let distribution = table.distribution.clone();
                let op = if table.partitioned {
                    PhysicalOperator::DynamicIndexOnlyScan {
                        table,
                        index,
                        condition,
                        scan_id: scan_id(group),
                    }
                } else {
                    PhysicalOperator::IndexOnlyScan {
                        table,
                        index,
                        condition,
                    }
                };
                Some(XformResult::Physical(PhysicalAlternative::leaf(self.name(), op, distribution)))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Get2BitmapScan;

impl Xform for Get2BitmapScan {
    fn name(&self) -> &'static str {
        "Get2BitmapScan"
    }

    fn kind(&self) -> XformKind {
        XformKind::Implementation
    }

    fn apply(&self, memo: &Memo, group: GroupId, expr: &GroupExpr) -> Vec<XformResult> {
        let Some((predicates, table, _)) = select_over_get(memo, expr) else {
            return Vec::new();
        };
        table
            .indexes
            .iter()
            .filter(|index| index.index_type != IndexType::Hash)
            .filter_map(|index| {
                let used = index_condition(index, predicates)?.used_columns;
                let probed: Vec<&Predicate> = predicates.iter().filter(|p| used.contains(&p.column)).collect();
                let probe = BitmapProbe {
                    index: index.clone(),
                    equality: probed.iter().all(|p| p.op == CompareOp::Eq),
                    array_compare: probed.iter().any(|p| p.op == CompareOp::In),
                };
                let condition = BitmapCondition {
                    probe: Some(probe),
                    used_columns: used,
                    outer_refs: Vec::new(),
                };
                let table = Arc::clone(table);
                let distribution = table.distribution.clone();
                let op = if table.partitioned {
                    PhysicalOperator::DynamicBitmapTableScan {
                        table,
                        condition,
                        scan_id: scan_id(group),
                    }
                } else {
                    PhysicalOperator::BitmapTableScan { table, condition }
                };
                Some(XformResult::Physical(PhysicalAlternative::leaf(self.name(), op, distribution)))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Select2Filter;

impl Xform for Select2Filter {
    fn name(&self) -> &'static str {
        "Select2Filter"
    }

    fn kind(&self) -> XformKind {
        XformKind::Implementation
    }

    fn apply(&self, _memo: &Memo, _group: GroupId, expr: &GroupExpr) -> Vec<XformResult> {
        let (LogicalOperator::Select { predicates }, [child]) = (&expr.op, expr.children.as_slice()) else {
            return Vec::new();
        };
        // filter where the rows already are, or after moving them where the parent wants them
        [ChildRequirement::Exact(Requirement::any()), ChildRequirement::Inherit]
            .into_iter()
            .map(|requirement| {
                XformResult::Physical(PhysicalAlternative {
                    xform: self.name(),
                    op: PhysicalOperator::Filter {
                        predicate_columns: predicates.iter().map(|p| p.column).collect(),
                    },
                    children: smallvec![ChildRequest {
                        group: *child,
                        requirement,
                    }],
                    delivers: Delivered::Child(0),
                })
            })
            .collect()
    }
}

fn join_keys(keys: &[JoinKey]) -> (Vec<ColumnId>, Vec<ColumnId>) {
    keys.iter().map(|k| (k.left, k.right)).unzip()
}

/// The join's inner side copied to every segment; the outer stays where it is.
fn broadcast_inner(outer: GroupId, inner: GroupId) -> SmallVec<[ChildRequest; 2]> {
    smallvec![
        ChildRequest {
            group: outer,
            requirement: ChildRequirement::Exact(Requirement::any()),
        },
        ChildRequest {
            group: inner,
            requirement: ChildRequirement::Exact(Requirement::distributed(Distribution::Replicated)),
        },
    ]
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InnerJoin2HashJoin;

impl Xform for InnerJoin2HashJoin {
    fn name(&self) -> &'static str {
        "InnerJoin2HashJoin"
    }

    fn kind(&self) -> XformKind {
        XformKind::Implementation
    }

    fn apply(&self, _memo: &Memo, _group: GroupId, expr: &GroupExpr) -> Vec<XformResult> {
        let (LogicalOperator::InnerJoin { keys }, [outer, inner]) = (&expr.op, expr.children.as_slice()) else {
            return Vec::new();
        };
        if keys.is_empty() {
            return Vec::new();
        }
        let (left, right) = join_keys(keys);
        let mut condition_columns = left.clone();
        condition_columns.extend(&right);
        let op = PhysicalOperator::HashJoin {
            kind: HashJoinKind::Inner,
            condition_columns,
        };
        let co_located = PhysicalAlternative {
            xform: self.name(),
            op: op.clone(),
            children: smallvec![
                ChildRequest {
                    group: *outer,
                    requirement: ChildRequirement::Exact(Requirement::distributed(Distribution::Hashed(left.clone()))),
                },
                ChildRequest {
                    group: *inner,
                    requirement: ChildRequirement::Exact(Requirement::distributed(Distribution::Hashed(right))),
                },
            ],
            delivers: Delivered::Fixed(Distribution::Hashed(left)),
        };
        let broadcast = PhysicalAlternative {
            xform: self.name(),
            op,
            children: broadcast_inner(*outer, *inner),
            delivers: Delivered::Child(0),
        };
        vec![XformResult::Physical(co_located), XformResult::Physical(broadcast)]
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InnerJoin2NLJoin;

impl Xform for InnerJoin2NLJoin {
    fn name(&self) -> &'static str {
        "InnerJoin2NLJoin"
    }

    fn kind(&self) -> XformKind {
        XformKind::Implementation
    }

    fn apply(&self, _memo: &Memo, _group: GroupId, expr: &GroupExpr) -> Vec<XformResult> {
        let (LogicalOperator::InnerJoin { keys }, [outer, inner]) = (&expr.op, expr.children.as_slice()) else {
            return Vec::new();
        };
        let (mut condition_columns, right) = join_keys(keys);
        condition_columns.extend(right);
        vec![XformResult::Physical(PhysicalAlternative {
            xform: self.name(),
            op: PhysicalOperator::NLJoin {
                kind: NLJoinKind::Inner,
                condition_columns,
            },
            children: broadcast_inner(*outer, *inner),
            delivers: Delivered::Child(0),
        })]
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JoinCommutativity;

impl Xform for JoinCommutativity {
    fn name(&self) -> &'static str {
        "JoinCommutativity"
    }

    fn kind(&self) -> XformKind {
        XformKind::Exploration
    }

    fn apply(&self, _memo: &Memo, _group: GroupId, expr: &GroupExpr) -> Vec<XformResult> {
        let (LogicalOperator::InnerJoin { keys }, [outer, inner]) = (&expr.op, expr.children.as_slice()) else {
            return Vec::new();
        };
        let keys = keys
            .iter()
            .map(|k| JoinKey {
                left: k.right,
                right: k.left,
            })
            .collect();
        vec![XformResult::Logical(GroupExpr {
            op: LogicalOperator::InnerJoin { keys },
            children: smallvec![*inner, *outer],
        })]
    }
}

fn scalar_agg(aggregates: &[Aggregate]) -> PhysicalOperator {
    let mut columns: Vec<ColumnId> = aggregates.iter().filter_map(|a| a.column).collect();
    columns.sort_unstable();
    columns.dedup();
    PhysicalOperator::ScalarAgg {
        agg_columns: columns.len().max(1),
        agg_functions: aggregates.len().max(1),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GbAgg2HashAgg;

impl Xform for GbAgg2HashAgg {
    fn name(&self) -> &'static str {
        "GbAgg2HashAgg"
    }

    fn kind(&self) -> XformKind {
        XformKind::Implementation
    }

    fn apply(&self, _memo: &Memo, _group: GroupId, expr: &GroupExpr) -> Vec<XformResult> {
        let (LogicalOperator::GbAgg { grouping, aggregates }, [child]) = (&expr.op, expr.children.as_slice()) else {
            return Vec::new();
        };
        let (op, distribution) = if grouping.is_empty() {
            (scalar_agg(aggregates), Distribution::Singleton)
        } else {
            let op = PhysicalOperator::HashAgg {
                grouping_columns: grouping.clone(),
                stage: AggStage::Global,
                generates_duplicates: false,
            };
            (op, Distribution::Hashed(grouping.clone()))
        };
        vec![XformResult::Physical(PhysicalAlternative {
            xform: self.name(),
            op,
            children: smallvec![ChildRequest {
                group: *child,
                requirement: ChildRequirement::Exact(Requirement::distributed(distribution.clone())),
            }],
            delivers: Delivered::Fixed(distribution),
        })]
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GbAgg2StreamAgg;

impl Xform for GbAgg2StreamAgg {
    fn name(&self) -> &'static str {
        "GbAgg2StreamAgg"
    }

    fn kind(&self) -> XformKind {
        XformKind::Implementation
    }

    fn apply(&self, _memo: &Memo, _group: GroupId, expr: &GroupExpr) -> Vec<XformResult> {
        let (LogicalOperator::GbAgg { grouping, .. }, [child]) = (&expr.op, expr.children.as_slice()) else {
            return Vec::new();
        };
        if grouping.is_empty() {
            return Vec::new();
        }
        let distribution = Distribution::Hashed(grouping.clone());
        vec![XformResult::Physical(PhysicalAlternative {
            xform: self.name(),
            op: PhysicalOperator::StreamAgg {
                grouping_columns: grouping.clone(),
                stage: AggStage::Global,
                generates_duplicates: false,
            },
            children: smallvec![ChildRequest {
                group: *child,
                requirement: ChildRequirement::Exact(
                    Requirement::distributed(distribution.clone()).sorted(grouping.clone())
                ),
            }],
            delivers: Delivered::Fixed(distribution),
        })]
    }
}

/// Every xform the search knows.
pub fn default_xforms() -> Vec<Box<dyn Xform>> {
    vec![
        Box::new(Get2TableScan),
        Box::new(Get2IndexScan),
        Box::new(Get2IndexOnlyScan),
        Box::new(Get2BitmapScan),
        Box::new(Select2Filter),
        Box::new(InnerJoin2HashJoin),
        Box::new(InnerJoin2NLJoin),
        Box::new(JoinCommutativity),
        Box::new(GbAgg2HashAgg),
        Box::new(GbAgg2StreamAgg),
    ]
}

/// Counters of one search.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SearchStats {
    pub groups: usize,
    pub group_exprs: usize,
    pub alternatives_costed: usize,
    pub alternatives_rejected: usize,
    pub hint_fallbacks: usize,
}

/// The cheapest plan found for a query.
#[derive(Debug, Clone)]
pub struct OptimizedPlan {
    pub arena: PlanArena,
    pub root: NodeId,
    pub cost: Cost,
    /// Groups whose plan hints could not be honoured
    pub hint_violations: u32,
    pub stats: SearchStats,
}

impl OptimizedPlan {
    pub fn explain(&self) -> Result<String> {
        self.arena.explain(self.root)
    }
}

/// Cost-based optimizer: a cost model, plan hints and a set of xforms.
#[derive(Debug)]
pub struct Optimizer {
    cost_model: CostModel,
    hints: PlanHint,
    predicate: Box<dyn HintPredicate>,
    xforms: Vec<Box<dyn Xform>>,
    interrupt: Interrupt,
}

impl Optimizer {
    pub fn new(cost_model: CostModel) -> Self {
        Self {
            cost_model,
            hints: PlanHint::default(),
            predicate: Box::new(PlanHintPredicate),
            xforms: default_xforms(),
            interrupt: Interrupt::new(),
        }
    }

    pub fn from_config(config: &OptimizerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(CostModel::from_config(config)?).with_hints(config.plan_hints.clone()))
    }

    pub fn with_hints(mut self, hints: PlanHint) -> Self {
        self.hints = hints;
        self
    }

    pub fn with_hint_predicate(mut self, predicate: Box<dyn HintPredicate>) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn with_xforms(mut self, xforms: Vec<Box<dyn Xform>>) -> Self {
        self.xforms = xforms;
        self
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn cost_model(&self) -> &CostModel {
        &self.cost_model
    }

    /// Find the cheapest plan delivering the query's rows on a single node.
    pub fn optimize(&self, query: &QueryInput) -> Result<OptimizedPlan> {
        let catalog = Catalog::new(query.tables.iter().cloned())?;
        let mut memo = Memo::new();
        let root = memo.insert(&query.plan, &catalog)?;
        let mut search = Search {
            memo,
            arena: PlanArena::new(),
            optimizer: self,
            stats: SearchStats::default(),
        };
        let required = Requirement::distributed(Distribution::Singleton);
        let winner = search
            .optimize_group(root, &required)?
            .ok_or_else(|| Error::NoPlanFound(format!("group {root} under {required}")))?;

        let mut stats = search.stats;
        stats.groups = search.memo.len();
        stats.group_exprs = search.memo.expr_count();
        let (arena, plan_root) = search.arena.extract(winner.node)?;
        info!(
            cost = %winner.cost,
            groups = stats.groups,
            costed = stats.alternatives_costed,
            rejected = stats.alternatives_rejected,
            "plan chosen"
        );
        if winner.violations > 0 {
            warn!(violations = winner.violations, "chosen plan ignores some plan hints");
        }
        Ok(OptimizedPlan {
            arena,
            root: plan_root,
            cost: winner.cost,
            hint_violations: winner.violations,
            stats,
        })
    }
}

struct Search<'a> {
    memo: Memo,
    arena: PlanArena,
    optimizer: &'a Optimizer,
    stats: SearchStats,
}

impl Search<'_> {
    fn optimize_group(&mut self, group: GroupId, required: &Requirement) -> Result<Option<Winner>> {
        if let Some(found) = self.memo.groups[group].winners.get(required) {
            return Ok(found.clone());
        }
        self.optimizer.interrupt.check()?;
        self.explore(group);

        let winner = if required.sort.is_empty() {
            self.implement(group, required)?
        } else {
            self.enforce_sort(group, required)?
        };
        match &winner {
            Some(w) => debug!(group, requirement = %required, cost = %w.cost, "group optimized"),
            None => debug!(group, requirement = %required, "no plan for group"),
        }
        self.memo.groups[group]
            .winners
            .insert(required.clone(), winner.clone());
        Ok(winner)
    }

    fn explore(&mut self, group: GroupId) {
        if self.memo.groups[group].explored {
            return;
        }
        self.memo.groups[group].explored = true;
        let optimizer = self.optimizer;
        let mut i = 0;
        while i < self.memo.groups[group].exprs.len() {
            let expr = self.memo.groups[group].exprs[i].clone();
            for child in &expr.children {
                self.explore(*child);
            }
            for xform in optimizer.xforms.iter().filter(|x| x.kind() == XformKind::Exploration) {
                for result in xform.apply(&self.memo, group, &expr) {
                    if let XformResult::Logical(new_expr) = result {
                        if self.memo.add_expr(group, new_expr) {
                            trace!(group, xform = xform.name(), "expression added");
                        }
                    }
                }
            }
            i += 1;
        }
    }

    fn alternatives(&mut self, group: GroupId) -> Vec<PhysicalAlternative> {
        if let Some(alternatives) = &self.memo.groups[group].alternatives {
            return alternatives.clone();
        }
        let mut alternatives = Vec::new();
        for expr in &self.memo.groups[group].exprs {
            for xform in self.optimizer.xforms.iter().filter(|x| x.kind() == XformKind::Implementation) {
                for result in xform.apply(&self.memo, group, expr) {
                    if let XformResult::Physical(alternative) = result {
                        alternatives.push(alternative);
                    }
                }
            }
        }
        self.memo.groups[group].alternatives = Some(alternatives.clone());
        alternatives
    }

    fn satisfies_hints(&self, alternative: &PhysicalAlternative, aliases: &[String]) -> bool {
        if self.optimizer.hints.is_empty() {
            return true;
        }
        match Candidate::for_operator(&alternative.op, aliases) {
            Some(candidate) => self.optimizer.predicate.satisfies_hints(&candidate, &self.optimizer.hints),
            None => true,
        }
    }

    fn implement(&mut self, group: GroupId, required: &Requirement) -> Result<Option<Winner>> {
        let alternatives = self.alternatives(group);
        let aliases = self.memo.groups[group].aliases.clone();
        let (accepted, rejected): (Vec<_>, Vec<_>) = alternatives
            .into_iter()
            .partition(|alternative| self.satisfies_hints(alternative, &aliases));
        self.stats.alternatives_rejected += rejected.len();

        let mut best = self.best_of(group, required, &accepted, 0)?;
        if best.is_none() && !rejected.is_empty() {
            warn!(group, relations = ?aliases, "no alternative satisfies the plan hints, ignoring them for this group");
            self.stats.hint_fallbacks += 1;
            best = self.best_of(group, required, &rejected, 1)?;
        }
        Ok(best)
    }

    fn best_of(
        &mut self,
        group: GroupId,
        required: &Requirement,
        alternatives: &[PhysicalAlternative],
        penalty: u32,
    ) -> Result<Option<Winner>> {
        let mut best: Option<Winner> = None;
        'alternatives: for alternative in alternatives {
            let mut children: SmallVec<[NodeId; 2]> = SmallVec::new();
            let mut delivered: SmallVec<[Distribution; 2]> = SmallVec::new();
            let mut violations = penalty;
            for request in &alternative.children {
                let child_required = match &request.requirement {
                    ChildRequirement::Inherit => Requirement::distributed(required.distribution.clone()),
                    ChildRequirement::Exact(r) => r.clone(),
                };
                match self.optimize_group(request.group, &child_required)? {
                    Some(child) => {
                        children.push(child.node);
                        delivered.push(child.distribution);
                        violations += child.violations;
                    }
                    None => continue 'alternatives,
                }
            }

            let stats = self.memo.groups[group].stats.clone();
            let node = self.arena.add(alternative.op.clone(), &children, stats)?;
            let cost = self.cost(node)?;
            self.stats.alternatives_costed += 1;
            let distribution = match &alternative.delivers {
                Delivered::Fixed(d) => d.clone(),
                Delivered::Child(i) => delivered
                    .get(*i)
                    .cloned()
                    .ok_or_else(|| Error::InvalidPlan(format!("{} has no child {i}", alternative.xform)))?,
            };
            let candidate = self.enforce_distribution(
                group,
                Winner {
                    node,
                    cost,
                    distribution,
                    violations,
                },
                &required.distribution,
            )?;
            trace!(
                group,
                xform = alternative.xform,
                op = alternative.op.name(),
                cost = %candidate.cost,
                "alternative costed"
            );
            if best.as_ref().map_or(true, |b| candidate.beats(b)) {
                best = Some(candidate);
            }
        }
        Ok(best)
    }

    fn cost(&mut self, node: NodeId) -> Result<Cost> {
        let cost = self.optimizer.cost_model.cost_node(&self.arena, node)?;
        self.arena.set_cost(node, cost)?;
        Ok(cost)
    }

    /// Put a motion on top of `input` if it does not already deliver `required`.
    fn enforce_distribution(&mut self, group: GroupId, input: Winner, required: &Distribution) -> Result<Winner> {
        if input.distribution.satisfies(required) {
            return Ok(input);
        }
        let kind = match required {
            Distribution::Any => return Ok(input),
            Distribution::Singleton => MotionKind::Gather,
            Distribution::Replicated => MotionKind::Broadcast {
                ignore_broadcast_threshold: false,
            },
            Distribution::Hashed(columns) => MotionKind::HashDistribute {
                columns: columns.clone(),
                no_op: false,
            },
            Distribution::Random => MotionKind::Random,
        };
        let stats = self.memo.groups[group].stats.clone();
        let node = self.arena.add(PhysicalOperator::Motion(kind), &[input.node], stats)?;
        let cost = self.cost(node)?;
        Ok(Winner {
            node,
            cost,
            distribution: required.clone(),
            violations: input.violations,
        })
    }

    /// Sort the best plan for the required distribution.
    fn enforce_sort(&mut self, group: GroupId, required: &Requirement) -> Result<Option<Winner>> {
        let unsorted = Requirement::distributed(required.distribution.clone());
        let Some(input) = self.optimize_group(group, &unsorted)? else {
            return Ok(None);
        };
        let stats = self.memo.groups[group].stats.clone();
        let op = PhysicalOperator::Sort {
            sort_columns: required.sort.clone(),
        };
        let node = self.arena.add(op, &[input.node], stats)?;
        let cost = self.cost(node)?;
        Ok(Some(Winner {
            node,
            cost,
            distribution: input.distribution,
            violations: input.violations,
        }))
    }
}
