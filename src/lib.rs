//! Planning and index-maintenance core of a massively parallel (MPP) database:
//! a calibrated cost model with skew and spill handling, a memo-based plan
//! search driven by plan hints, and the block range index (BRIN) reverse map
//! for both heap and append-only storage, with its write-ahead log.

pub mod brin;
pub mod config;
pub mod error;
pub mod interrupt;
pub mod logging;
pub mod query_optimizer;
pub mod storage;
pub mod wal;

pub use config::OptimizerConfig;
pub use error::{Error, Result};
pub use interrupt::Interrupt;
pub use query_optimizer::{CostModel, OptimizedPlan, Optimizer, PlanHint, QueryInput};
pub use storage::IndexRelation;
