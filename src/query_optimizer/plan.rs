//! Physical plan trees, stored in an arena so that costing can walk parents,
//! children and grandchildren through typed node ids.

use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::iter::Sum;
use std::ops::{Add, Mul};
use std::sync::Arc;

pub type ColumnId = u32;

/// Map key of a per-column statistic. JSON object keys are always strings, and
/// serde does not coerce them to integers once the value sits inside a tagged enum.
#[derive(PartialEq, Eq, Hash, Deserialize)]
#[serde(untagged)]
enum ColumnKey {
    Id(ColumnId),
    Text(String),
}

fn deserialize_column_map<'de, D>(deserializer: D) -> std::result::Result<HashMap<ColumnId, f64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;

    let raw = HashMap::<ColumnKey, f64>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(key, value)| match key {
            ColumnKey::Id(column) => Ok((column, value)),
            ColumnKey::Text(text) => text
                .trim()
                .parse::<ColumnId>()
                .map(|column| (column, value))
                .map_err(|_| D::Error::custom(format!("invalid column id {text:?}"))),
        })
        .collect()
}

/// Non-negative plan cost.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct Cost(f64);

impl Cost {
    pub const ZERO: Cost = Cost(0.0);

    pub fn new(value: f64) -> Self {
        debug_assert!(value >= 0.0, "negative cost {value}");
        Cost(value.max(0.0))
    }

    pub fn value(self) -> f64 {
        self.0
    }

    pub fn max(self, other: Cost) -> Cost {
        if other.0 > self.0 {
            other
        } else {
            self
        }
    }
}

impl Add for Cost {
    type Output = Cost;

    fn add(self, rhs: Cost) -> Cost {
        Cost(self.0 + rhs.0)
    }
}

impl Mul<f64> for Cost {
    type Output = Cost;

    fn mul(self, rhs: f64) -> Cost {
        Cost::new(self.0 * rhs)
    }
}

impl Sum for Cost {
    fn sum<I: Iterator<Item = Cost>>(iter: I) -> Cost {
        iter.fold(Cost::ZERO, Add::add)
    }
}

impl fmt::Display for Cost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}", self.0)
    }
}

/// Derived statistics of one plan node, supplied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStats {
    pub rows: f64,
    pub width: f64,
    #[serde(default = "one")]
    pub rebinds: f64,
    #[serde(default, deserialize_with = "deserialize_column_map")]
    pub column_ndvs: HashMap<ColumnId, f64>,
    /// Skew of the histogram over the node's distribution columns (1 = uniform).
    #[serde(default = "one")]
    pub histogram_skew: f64,
    /// Cardinality estimation risk (1 = exact).
    #[serde(default = "one")]
    pub risk: f64,
}

fn one() -> f64 {
    1.0
}

impl NodeStats {
    pub fn new(rows: f64, width: f64) -> Self {
        Self {
            rows,
            width,
            rebinds: 1.0,
            column_ndvs: HashMap::new(),
            histogram_skew: 1.0,
            risk: 1.0,
        }
    }

    pub fn with_rebinds(mut self, rebinds: f64) -> Self {
        self.rebinds = rebinds;
        self
    }

    pub fn with_ndv(mut self, column: ColumnId, ndv: f64) -> Self {
        self.column_ndvs.insert(column, ndv);
        self
    }

    pub fn with_histogram_skew(mut self, skew: f64) -> Self {
        self.histogram_skew = skew;
        self
    }

    pub fn with_risk(mut self, risk: f64) -> Self {
        self.risk = risk;
        self
    }

    /// NDV of `column`, `None` when no statistics exist for it.
    pub fn ndv(&self, column: ColumnId) -> Option<f64> {
        self.column_ndvs.get(&column).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    Heap,
    AppendOnlyRow,
    AppendOnlyColumn,
    Foreign,
}

impl StorageKind {
    pub fn is_append_only(self) -> bool {
        matches!(self, StorageKind::AppendOnlyRow | StorageKind::AppendOnlyColumn)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexType {
    Btree,
    Bitmap,
    Brin,
    Hash,
    Gist,
    Gin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub name: String,
    pub index_type: IndexType,
    pub key_columns: Vec<ColumnId>,
    #[serde(default)]
    pub included_columns: Vec<ColumnId>,
    /// Sum of the widths of the included columns.
    #[serde(default)]
    pub included_width: f64,
}

impl IndexDescriptor {
    pub fn keys(&self) -> usize {
        self.key_columns.len()
    }

    /// Whether `columns` can all be produced from the index alone.
    pub fn covers(&self, columns: &[ColumnId]) -> bool {
        columns
            .iter()
            .all(|c| self.key_columns.contains(c) || self.included_columns.contains(c))
    }
}

/// Base-table statistics, as opposed to the per-node estimates in [`NodeStats`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableStats {
    pub rows: f64,
    pub width: f64,
    #[serde(default)]
    pub rel_pages: u64,
    #[serde(default)]
    pub rel_all_visible: u64,
    #[serde(default, deserialize_with = "deserialize_column_map")]
    pub column_ndvs: HashMap<ColumnId, f64>,
}

impl TableStats {
    pub fn new(rows: f64, width: f64) -> Self {
        Self {
            rows,
            width,
            rel_pages: 0,
            rel_all_visible: 0,
            column_ndvs: HashMap::new(),
        }
    }

    pub fn ndv(&self, column: ColumnId) -> Option<f64> {
        self.column_ndvs.get(&column).copied()
    }
}

/// How rows of a relation or intermediate result are spread over segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distribution {
    Any,
    Singleton,
    Replicated,
    Hashed(Vec<ColumnId>),
    Random,
}

impl Distribution {
    /// Whether rows already laid out as `self` meet the requirement `required`.
    pub fn satisfies(&self, required: &Distribution) -> bool {
        match (required, self) {
            (Distribution::Any, _) => true,
            (Distribution::Singleton, Distribution::Singleton) => true,
            (Distribution::Replicated, Distribution::Replicated) => true,
            (Distribution::Hashed(want), Distribution::Hashed(have)) => {
                want.len() == have.len() && want.iter().all(|c| have.contains(c))
            }
            (Distribution::Random, Distribution::Random) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Distribution::Any => write!(f, "any"),
            Distribution::Singleton => write!(f, "singleton"),
            Distribution::Replicated => write!(f, "replicated"),
            Distribution::Hashed(cols) => write!(f, "hashed{cols:?}"),
            Distribution::Random => write!(f, "random"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub storage: StorageKind,
    pub distribution: Distribution,
    #[serde(default)]
    pub partitioned: bool,
    pub columns: Vec<ColumnId>,
    pub stats: TableStats,
    #[serde(default)]
    pub indexes: Vec<IndexDescriptor>,
}

/// Index lookup condition of an index or index-only scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexCondition {
    pub used_columns: Vec<ColumnId>,
    /// Predicates applied on top of the index lookup.
    pub residual_predicates: usize,
}

/// Index probe of a bitmap heap scan.
#[derive(Debug, Clone, PartialEq)]
pub struct BitmapProbe {
    pub index: IndexDescriptor,
    /// The probe compares with `=`.
    pub equality: bool,
    /// The probe is a scalar array comparison (`col IN (...)`).
    pub array_compare: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BitmapCondition {
    /// `None` for a boolean combination of several probes.
    pub probe: Option<BitmapProbe>,
    pub used_columns: Vec<ColumnId>,
    pub outer_refs: Vec<ColumnId>,
}

impl BitmapCondition {
    /// Columns of the condition that are bound within the scan itself.
    pub fn local_columns(&self) -> Vec<ColumnId> {
        let mut local: Vec<ColumnId> = self
            .used_columns
            .iter()
            .copied()
            .filter(|c| !self.outer_refs.contains(c))
            .collect();
        local.sort_unstable();
        local.dedup();
        local
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggStage {
    Global,
    Intermediate,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashJoinKind {
    Inner,
    LeftSemi,
    LeftAntiSemi,
    LeftAntiSemiNotIn,
    LeftOuter,
    RightOuter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexNLJoinKind {
    Inner,
    LeftOuter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NLJoinKind {
    Inner,
    LeftSemi,
    LeftAntiSemi,
    LeftAntiSemiNotIn,
    LeftOuter,
    CorrelatedInner,
    CorrelatedLeftOuter,
    CorrelatedLeftSemi,
    CorrelatedInLeftSemi,
    CorrelatedLeftAntiSemi,
    CorrelatedNotInLeftAntiSemi,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MotionKind {
    Gather,
    Broadcast { ignore_broadcast_threshold: bool },
    /// `no_op` marks a redistribution onto the distribution the input already has.
    HashDistribute { columns: Vec<ColumnId>, no_op: bool },
    Random,
    RoutedDistribute,
}

/// Every physical operator the cost model knows how to cost.
#[derive(Debug, Clone, PartialEq)]
pub enum PhysicalOperator {
    TableScan { table: Arc<TableDescriptor> },
    DynamicTableScan { table: Arc<TableDescriptor>, scan_id: u32 },
    ForeignScan { table: Arc<TableDescriptor> },
    DynamicForeignScan { table: Arc<TableDescriptor>, scan_id: u32 },
    IndexScan {
        table: Arc<TableDescriptor>,
        index: IndexDescriptor,
        condition: IndexCondition,
    },
    DynamicIndexScan {
        table: Arc<TableDescriptor>,
        index: IndexDescriptor,
        condition: IndexCondition,
        scan_id: u32,
    },
    IndexOnlyScan {
        table: Arc<TableDescriptor>,
        index: IndexDescriptor,
        condition: IndexCondition,
    },
    DynamicIndexOnlyScan {
        table: Arc<TableDescriptor>,
        index: IndexDescriptor,
        condition: IndexCondition,
        scan_id: u32,
    },
    BitmapTableScan { table: Arc<TableDescriptor>, condition: BitmapCondition },
    DynamicBitmapTableScan {
        table: Arc<TableDescriptor>,
        condition: BitmapCondition,
        scan_id: u32,
    },
    Filter { predicate_columns: Vec<ColumnId> },
    ComputeScalar { has_scalar_func: bool },
    Assert,
    Limit,
    PartitionSelector { scan_id: u32 },
    Split,
    Spool,
    SequenceProject { sort_columns: usize },
    CteProducer { cte_id: u32 },
    CteConsumer { cte_id: u32 },
    ConstTableGet,
    Tvf,
    Dml,
    HashAgg {
        grouping_columns: Vec<ColumnId>,
        stage: AggStage,
        generates_duplicates: bool,
    },
    HashAggDeduplicate {
        grouping_columns: Vec<ColumnId>,
        stage: AggStage,
        generates_duplicates: bool,
    },
    StreamAgg {
        grouping_columns: Vec<ColumnId>,
        stage: AggStage,
        generates_duplicates: bool,
    },
    StreamAggDeduplicate {
        grouping_columns: Vec<ColumnId>,
        stage: AggStage,
        generates_duplicates: bool,
    },
    ScalarAgg { agg_columns: usize, agg_functions: usize },
    Sequence,
    SerialUnionAll,
    ParallelUnionAll,
    Sort { sort_columns: Vec<ColumnId> },
    HashJoin { kind: HashJoinKind, condition_columns: Vec<ColumnId> },
    FullMergeJoin { condition_columns: Vec<ColumnId> },
    IndexNLJoin { kind: IndexNLJoinKind, condition_columns: Vec<ColumnId> },
    NLJoin { kind: NLJoinKind, condition_columns: Vec<ColumnId> },
    Motion(MotionKind),
}

/// Number of relational children an operator takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    fn accepts(self, n: usize) -> bool {
        match self {
            Arity::Exact(k) => n == k,
            Arity::AtLeast(k) => n >= k,
        }
    }
}

impl PhysicalOperator {
    pub fn name(&self) -> &'static str {
        match self {
            PhysicalOperator::TableScan { .. } => "TableScan",
            PhysicalOperator::DynamicTableScan { .. } => "DynamicTableScan",
            PhysicalOperator::ForeignScan { .. } => "ForeignScan",
            PhysicalOperator::DynamicForeignScan { .. } => "DynamicForeignScan",
            PhysicalOperator::IndexScan { .. } => "IndexScan",
            PhysicalOperator::DynamicIndexScan { .. } => "DynamicIndexScan",
            PhysicalOperator::IndexOnlyScan { .. } => "IndexOnlyScan",
            PhysicalOperator::DynamicIndexOnlyScan { .. } => "DynamicIndexOnlyScan",
            PhysicalOperator::BitmapTableScan { .. } => "BitmapTableScan",
            PhysicalOperator::DynamicBitmapTableScan { .. } => "DynamicBitmapTableScan",
            PhysicalOperator::Filter { .. } => "Filter",
            PhysicalOperator::ComputeScalar { .. } => "ComputeScalar",
            PhysicalOperator::Assert => "Assert",
            PhysicalOperator::Limit => "Limit",
            PhysicalOperator::PartitionSelector { .. } => "PartitionSelector",
            PhysicalOperator::Split => "Split",
            PhysicalOperator::Spool => "Spool",
            PhysicalOperator::SequenceProject { .. } => "SequenceProject",
            PhysicalOperator::CteProducer { .. } => "CteProducer",
            PhysicalOperator::CteConsumer { .. } => "CteConsumer",
            PhysicalOperator::ConstTableGet => "ConstTableGet",
            PhysicalOperator::Tvf => "Tvf",
            PhysicalOperator::Dml => "Dml",
            PhysicalOperator::HashAgg { .. } => "HashAgg",
            PhysicalOperator::HashAggDeduplicate { .. } => "HashAggDeduplicate",
            PhysicalOperator::StreamAgg { .. } => "StreamAgg",
            PhysicalOperator::StreamAggDeduplicate { .. } => "StreamAggDeduplicate",
            PhysicalOperator::ScalarAgg { .. } => "ScalarAgg",
            PhysicalOperator::Sequence => "Sequence",
            PhysicalOperator::SerialUnionAll => "SerialUnionAll",
            PhysicalOperator::ParallelUnionAll => "ParallelUnionAll",
            PhysicalOperator::Sort { .. } => "Sort",
            PhysicalOperator::HashJoin { .. } => "HashJoin",
            PhysicalOperator::FullMergeJoin { .. } => "FullMergeJoin",
            PhysicalOperator::IndexNLJoin { .. } => "IndexNLJoin",
            PhysicalOperator::NLJoin { .. } => "NLJoin",
            PhysicalOperator::Motion(MotionKind::Gather) => "GatherMotion",
            PhysicalOperator::Motion(MotionKind::Broadcast { .. }) => "BroadcastMotion",
            PhysicalOperator::Motion(MotionKind::HashDistribute { .. }) => "RedistributeMotion",
            PhysicalOperator::Motion(MotionKind::Random) => "RandomMotion",
            PhysicalOperator::Motion(MotionKind::RoutedDistribute) => "RoutedDistributeMotion",
        }
    }

    pub fn arity(&self) -> Arity {
        match self {
            PhysicalOperator::TableScan { .. }
            | PhysicalOperator::DynamicTableScan { .. }
            | PhysicalOperator::ForeignScan { .. }
            | PhysicalOperator::DynamicForeignScan { .. }
            | PhysicalOperator::IndexScan { .. }
            | PhysicalOperator::DynamicIndexScan { .. }
            | PhysicalOperator::IndexOnlyScan { .. }
            | PhysicalOperator::DynamicIndexOnlyScan { .. }
            | PhysicalOperator::BitmapTableScan { .. }
            | PhysicalOperator::DynamicBitmapTableScan { .. }
            | PhysicalOperator::CteConsumer { .. }
            | PhysicalOperator::ConstTableGet
            | PhysicalOperator::Tvf => Arity::Exact(0),
            PhysicalOperator::Sequence
            | PhysicalOperator::SerialUnionAll
            | PhysicalOperator::ParallelUnionAll => Arity::AtLeast(1),
            PhysicalOperator::HashJoin { .. }
            | PhysicalOperator::FullMergeJoin { .. }
            | PhysicalOperator::IndexNLJoin { .. }
            | PhysicalOperator::NLJoin { .. } => Arity::Exact(2),
            PhysicalOperator::PartitionSelector { .. } => Arity::AtLeast(0),
            _ => Arity::Exact(1),
        }
    }

    /// Operators that read a base relation.
    pub fn is_scan(&self) -> bool {
        self.table().is_some()
    }

    pub fn table(&self) -> Option<&TableDescriptor> {
        match self {
            PhysicalOperator::TableScan { table }
            | PhysicalOperator::DynamicTableScan { table, .. }
            | PhysicalOperator::ForeignScan { table }
            | PhysicalOperator::DynamicForeignScan { table, .. }
            | PhysicalOperator::IndexScan { table, .. }
            | PhysicalOperator::DynamicIndexScan { table, .. }
            | PhysicalOperator::IndexOnlyScan { table, .. }
            | PhysicalOperator::DynamicIndexOnlyScan { table, .. }
            | PhysicalOperator::BitmapTableScan { table, .. }
            | PhysicalOperator::DynamicBitmapTableScan { table, .. } => Some(table),
            _ => None,
        }
    }

    /// Scan id of a dynamic (partitioned) scan.
    pub fn dynamic_scan_id(&self) -> Option<u32> {
        match self {
            PhysicalOperator::DynamicTableScan { scan_id, .. }
            | PhysicalOperator::DynamicForeignScan { scan_id, .. }
            | PhysicalOperator::DynamicIndexScan { scan_id, .. }
            | PhysicalOperator::DynamicIndexOnlyScan { scan_id, .. }
            | PhysicalOperator::DynamicBitmapTableScan { scan_id, .. } => Some(*scan_id),
            _ => None,
        }
    }

    pub fn is_hash_join(&self) -> bool {
        matches!(self, PhysicalOperator::HashJoin { .. })
    }

    pub fn is_nl_join(&self) -> bool {
        matches!(
            self,
            PhysicalOperator::NLJoin { .. } | PhysicalOperator::IndexNLJoin { .. }
        )
    }

    pub fn is_motion(&self) -> bool {
        matches!(self, PhysicalOperator::Motion(_))
    }

    fn detail(&self) -> String {
        match self {
            PhysicalOperator::IndexScan { table, index, .. }
            | PhysicalOperator::DynamicIndexScan { table, index, .. }
            | PhysicalOperator::IndexOnlyScan { table, index, .. }
            | PhysicalOperator::DynamicIndexOnlyScan { table, index, .. } => {
                format!(" {} using {}", table.name, index.name)
            }
            PhysicalOperator::HashJoin { kind, .. } => format!(" ({kind:?})"),
            PhysicalOperator::NLJoin { kind, .. } => format!(" ({kind:?})"),
            PhysicalOperator::IndexNLJoin { kind, .. } => format!(" ({kind:?})"),
            PhysicalOperator::HashAgg { stage, .. } | PhysicalOperator::StreamAgg { stage, .. } => {
                format!(" ({stage:?})")
            }
            PhysicalOperator::Motion(MotionKind::HashDistribute { columns, .. }) => {
                format!(" {columns:?}")
            }
            op => match op.table() {
                Some(table) => format!(" {}", table.name),
                None => String::new(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct PlanNode {
    pub op: PhysicalOperator,
    pub children: SmallVec<[NodeId; 2]>,
    pub stats: NodeStats,
    pub cost: Option<Cost>,
}

/// What the cost model sees of one child while costing its parent.
#[derive(Debug, Clone, Copy)]
pub struct ChildCosting<'a> {
    pub id: NodeId,
    pub op: &'a PhysicalOperator,
    pub stats: &'a NodeStats,
    pub cost: Cost,
}

/// Inputs for costing one node: its own statistics and its costed children.
#[derive(Debug, Clone)]
pub struct CostingInfo<'a> {
    pub stats: &'a NodeStats,
    pub children: SmallVec<[ChildCosting<'a>; 2]>,
}

impl<'a> CostingInfo<'a> {
    pub fn rows(&self) -> f64 {
        self.stats.rows
    }

    pub fn width(&self) -> f64 {
        self.stats.width
    }

    pub fn rebinds(&self) -> f64 {
        self.stats.rebinds
    }

    pub fn child(&self, index: usize) -> Result<&ChildCosting<'a>> {
        self.children
            .get(index)
            .ok_or_else(|| Error::InvalidPlan(format!("missing child {index}")))
    }
}

/// Arena of plan nodes. Children are always added before their parents.
#[derive(Debug, Clone, Default)]
pub struct PlanArena {
    nodes: Vec<PlanNode>,
}

impl PlanArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn add(&mut self, op: PhysicalOperator, children: &[NodeId], stats: NodeStats) -> Result<NodeId> {
        if !op.arity().accepts(children.len()) {
            return Err(Error::InvalidPlan(format!(
                "{} cannot take {} children",
                op.name(),
                children.len()
            )));
        }
        if let Some(bad) = children.iter().find(|c| c.index() >= self.nodes.len()) {
            return Err(Error::InvalidPlan(format!("unknown child node {bad}")));
        }
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(PlanNode {
            op,
            children: SmallVec::from_slice(children),
            stats,
            cost: None,
        });
        Ok(id)
    }

    pub fn node(&self, id: NodeId) -> Result<&PlanNode> {
        self.nodes
            .get(id.index())
            .ok_or_else(|| Error::InvalidPlan(format!("unknown node {id}")))
    }

    pub fn set_cost(&mut self, id: NodeId, cost: Cost) -> Result<()> {
        let node = self
            .nodes
            .get_mut(id.index())
            .ok_or_else(|| Error::InvalidPlan(format!("unknown node {id}")))?;
        node.cost = Some(cost);
        Ok(())
    }

    pub fn cost(&self, id: NodeId) -> Option<Cost> {
        self.nodes.get(id.index()).and_then(|n| n.cost)
    }

    /// The `grandchild`-th child of the `child`-th child of `id`, if the tree has that shape.
    pub fn grandchild(&self, id: NodeId, child: usize, grandchild: usize) -> Option<&PlanNode> {
        let node = self.nodes.get(id.index())?;
        let child = self.nodes.get(node.children.get(child)?.index())?;
        self.nodes.get(child.children.get(grandchild)?.index())
    }

    /// Costing inputs for `id`. Every child must already be costed.
    pub fn costing_info(&self, id: NodeId) -> Result<CostingInfo<'_>> {
        let node = self.node(id)?;
        let mut children = SmallVec::new();
        for child_id in &node.children {
            let child = self.node(*child_id)?;
            let cost = child
                .cost
                .ok_or_else(|| Error::InvalidPlan(format!("child {child_id} of {id} is not costed")))?;
            children.push(ChildCosting {
                id: *child_id,
                op: &child.op,
                stats: &child.stats,
                cost,
            });
        }
        Ok(CostingInfo {
            stats: &node.stats,
            children,
        })
    }

    /// Copy the subtree under `root` into a fresh arena, returning its new root.
    pub fn extract(&self, root: NodeId) -> Result<(PlanArena, NodeId)> {
        let mut out = PlanArena::new();
        let new_root = self.copy_into(root, &mut out)?;
        Ok((out, new_root))
    }

    fn copy_into(&self, id: NodeId, out: &mut PlanArena) -> Result<NodeId> {
        let node = self.node(id)?;
        let mut children: SmallVec<[NodeId; 2]> = SmallVec::new();
        for child in &node.children {
            children.push(self.copy_into(*child, out)?);
        }
        let new_id = out.add(node.op.clone(), &children, node.stats.clone())?;
        if let Some(cost) = node.cost {
            out.set_cost(new_id, cost)?;
        }
        Ok(new_id)
    }

    /// Indented one-line-per-node rendering of the tree under `root`.
    pub fn explain(&self, root: NodeId) -> Result<String> {
        let mut out = String::new();
        self.explain_into(root, 0, &mut out)?;
        Ok(out)
    }

    fn explain_into(&self, id: NodeId, depth: usize, out: &mut String) -> Result<()> {
        let node = self.node(id)?;
        let cost = node
            .cost
            .map(|c| c.to_string())
            .unwrap_or_else(|| "?".to_string());
        let _ = writeln!(
            out,
            "{:indent$}-> {}{}  (rows={} width={} cost={})",
            "",
            node.op.name(),
            node.op.detail(),
            node.stats.rows,
            node.stats.width,
            cost,
            indent = depth * 2
        );
        for child in &node.children {
            self.explain_into(*child, depth + 1, out)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(name: &str) -> Arc<TableDescriptor> {
        Arc::new(TableDescriptor {
            name: name.to_string(),
            storage: StorageKind::Heap,
            distribution: Distribution::Hashed(vec![1]),
            partitioned: false,
            columns: vec![1, 2],
            stats: TableStats::new(1000.0, 16.0),
            indexes: Vec::new(),
        })
    }

    #[test]
    fn test_arity_is_checked() {
        let mut arena = PlanArena::new();
        let scan = arena
            .add(PhysicalOperator::TableScan { table: table("t") }, &[], NodeStats::new(10.0, 8.0))
            .unwrap();
        let err = arena
            .add(
                PhysicalOperator::HashJoin {
                    kind: HashJoinKind::Inner,
                    condition_columns: vec![1],
                },
                &[scan],
                NodeStats::new(10.0, 8.0),
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPlan(_)));
    }

    #[test]
    fn test_costing_info_requires_costed_children() {
        let mut arena = PlanArena::new();
        let scan = arena
            .add(PhysicalOperator::TableScan { table: table("t") }, &[], NodeStats::new(10.0, 8.0))
            .unwrap();
        let filter = arena
            .add(
                PhysicalOperator::Filter {
                    predicate_columns: vec![1],
                },
                &[scan],
                NodeStats::new(5.0, 8.0),
            )
            .unwrap();
        assert!(arena.costing_info(filter).is_err());
        arena.set_cost(scan, Cost::new(3.0)).unwrap();
        let info = arena.costing_info(filter).unwrap();
        assert_eq!(info.rows(), 5.0);
        assert_eq!(info.child(0).unwrap().cost, Cost::new(3.0));
        assert!(info.child(1).is_err());
    }

    #[test]
    fn test_grandchild_peek_is_fallible() {
        let mut arena = PlanArena::new();
        let scan = arena
            .add(
                PhysicalOperator::DynamicTableScan {
                    table: table("p"),
                    scan_id: 7,
                },
                &[],
                NodeStats::new(10.0, 8.0),
            )
            .unwrap();
        let selector = arena
            .add(PhysicalOperator::PartitionSelector { scan_id: 7 }, &[scan], NodeStats::new(10.0, 8.0))
            .unwrap();
        let filter = arena
            .add(
                PhysicalOperator::Filter {
                    predicate_columns: vec![2],
                },
                &[selector],
                NodeStats::new(2.0, 8.0),
            )
            .unwrap();
        let peeked = arena.grandchild(filter, 0, 0).unwrap();
        assert_eq!(peeked.op.dynamic_scan_id(), Some(7));
        assert!(arena.grandchild(filter, 0, 1).is_none());
        assert!(arena.grandchild(scan, 0, 0).is_none());
    }

    #[test]
    fn test_distribution_satisfaction() {
        let hashed = Distribution::Hashed(vec![1, 2]);
        assert!(hashed.satisfies(&Distribution::Any));
        assert!(hashed.satisfies(&Distribution::Hashed(vec![2, 1])));
        assert!(!hashed.satisfies(&Distribution::Hashed(vec![1])));
        assert!(!hashed.satisfies(&Distribution::Singleton));
        assert!(Distribution::Replicated.satisfies(&Distribution::Replicated));
    }

    #[test]
    fn test_extract_and_explain() {
        let mut arena = PlanArena::new();
        let _unused = arena
            .add(PhysicalOperator::ConstTableGet, &[], NodeStats::new(1.0, 1.0))
            .unwrap();
        let scan = arena
            .add(PhysicalOperator::TableScan { table: table("t") }, &[], NodeStats::new(10.0, 8.0))
            .unwrap();
        arena.set_cost(scan, Cost::new(1.5)).unwrap();
        let gather = arena
            .add(PhysicalOperator::Motion(MotionKind::Gather), &[scan], NodeStats::new(10.0, 8.0))
            .unwrap();
        let (copy, root) = arena.extract(gather).unwrap();
        assert_eq!(copy.len(), 2);
        let text = copy.explain(root).unwrap();
        assert!(text.starts_with("-> GatherMotion"));
        assert!(text.contains("  -> TableScan t"));
        assert!(text.contains("cost=1.500000"));
    }
}
