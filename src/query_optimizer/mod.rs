//! Cost-based query optimizer for segmented (MPP) clusters
//!
//! This module contains:
//! - A calibrated cost model for every physical operator, including motions
//! - Spill and skew policy shared by hash joins and aggregates
//! - Plan hints and the predicate that filters alternatives against them
//! - A memo-based search driving xforms, enforcers and the cost model

pub mod cost_model;
pub mod hints;
pub mod params;
pub mod plan;
pub mod search;
pub mod skew;

pub use cost_model::{CostModel, BROADCAST_PENALTY, DEFAULT_BROADCAST_THRESHOLD, DISCARDED_PLAN_COST};
pub use hints::{
    AccessMethod, Candidate, HintPredicate, JoinMethod, JoinTypeHint, JoinTypeHintType, PlanHint,
    PlanHintPredicate, ScanHint, ScanHintType,
};
pub use params::{CostModelParams, CostParam, ParamValue};
pub use plan::{
    ColumnId, Cost, Distribution, IndexDescriptor, IndexType, NodeId, NodeStats, PhysicalOperator, PlanArena,
    StorageKind, TableDescriptor, TableStats,
};
pub use search::{
    default_xforms, CompareOp, LogicalExpr, OptimizedPlan, Optimizer, Predicate, QueryInput, SearchStats, Xform,
    XformKind,
};
pub use skew::{SkewPolicy, SpillRegime};
