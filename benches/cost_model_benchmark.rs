use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mpp_core::brin::{init_metapage, insert_summary, RevmapAccessor};
use mpp_core::query_optimizer::plan::{HashJoinKind, MotionKind};
use mpp_core::query_optimizer::search::JoinKey;
use mpp_core::query_optimizer::{
    CostModel, CostModelParams, Distribution, LogicalExpr, NodeStats, Optimizer, PhysicalOperator, PlanArena,
    QueryInput, StorageKind, TableDescriptor, TableStats,
};
use mpp_core::IndexRelation;
use std::sync::Arc;

fn table(name: &str, column: u32) -> TableDescriptor {
    TableDescriptor {
        name: name.to_string(),
        storage: StorageKind::Heap,
        distribution: Distribution::Hashed(vec![column]),
        partitioned: false,
        columns: vec![column, column + 1],
        stats: TableStats::new(1_000_000.0, 64.0),
        indexes: Vec::new(),
    }
}

/// Left-deep join of `n` tables, each hashed on its own first column.
fn join_chain(n: u32) -> QueryInput {
    let tables: Vec<TableDescriptor> = (0..n).map(|i| table(&format!("t{i}"), i * 10)).collect();
    let get = |i: u32| {
        Box::new(LogicalExpr::Get {
            table: format!("t{i}"),
            columns: None,
            stats: NodeStats::new(1_000_000.0, 64.0).with_ndv(i * 10 + 1, 50_000.0),
        })
    };
    let mut plan = get(0);
    for i in 1..n {
        plan = Box::new(LogicalExpr::InnerJoin {
            keys: vec![JoinKey {
                left: 1,
                right: i * 10 + 1,
            }],
            left: plan,
            right: get(i),
            stats: NodeStats::new(1_000_000.0, 64.0 * (i + 1) as f64).with_ndv(1, 50_000.0),
        });
    }
    QueryInput { tables, plan: *plan }
}

/// Hash joins over redistributed scans, `depth` levels deep.
fn physical_tree(depth: usize) -> (PlanArena, mpp_core::query_optimizer::NodeId) {
    let mut arena = PlanArena::new();
    let scan = |arena: &mut PlanArena, i: usize| {
        let op = PhysicalOperator::TableScan {
            table: Arc::new(table(&format!("t{i}"), 1)),
        };
        let scan = arena.add(op, &[], NodeStats::new(100_000.0, 32.0)).unwrap();
        let motion = PhysicalOperator::Motion(MotionKind::HashDistribute {
            columns: vec![2],
            no_op: false,
        });
        arena
            .add(motion, &[scan], NodeStats::new(100_000.0, 32.0).with_ndv(2, 1_000.0))
            .unwrap()
    };
    let mut root = scan(&mut arena, 0);
    for i in 1..=depth {
        let inner = scan(&mut arena, i);
        let join = PhysicalOperator::HashJoin {
            kind: HashJoinKind::Inner,
            condition_columns: vec![2],
        };
        root = arena
            .add(join, &[root, inner], NodeStats::new(100_000.0, 32.0 * i as f64))
            .unwrap();
    }
    (arena, root)
}

fn bench_cost_tree(c: &mut Criterion) {
    let mut group = c.benchmark_group("cost_tree");
    let model = CostModel::new(CostModelParams::new(), 64).unwrap();

    for depth in [4, 16, 64] {
        let (arena, root) = physical_tree(depth);
        group.throughput(Throughput::Elements(arena.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            b.iter(|| {
                let mut arena = arena.clone();
                black_box(model.cost_tree(&mut arena, root).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_optimize(c: &mut Criterion) {
    let mut group = c.benchmark_group("optimize_join_chain");
    let optimizer = Optimizer::new(CostModel::new(CostModelParams::new(), 16).unwrap());

    for tables in [2, 4, 6] {
        let query = join_chain(tables);
        group.bench_with_input(BenchmarkId::from_parameter(tables), &query, |b, query| {
            b.iter(|| black_box(optimizer.optimize(query).unwrap().cost));
        });
    }

    group.finish();
}

fn bench_revmap_summaries(c: &mut Criterion) {
    let mut group = c.benchmark_group("revmap_insert_summary");

    for (label, is_ao) in [("heap", false), ("append_only", true)] {
        group.throughput(Throughput::Elements(1_000));
        group.bench_function(label, |b| {
            b.iter(|| {
                let rel = Arc::new(IndexRelation::in_memory("bench_brin"));
                init_metapage(&rel, 1, is_ao).unwrap();
                let mut revmap = RevmapAccessor::initialize(Arc::clone(&rel)).unwrap();
                for blk in 0..1_000u32 {
                    black_box(insert_summary(&mut revmap, blk, &blk.to_le_bytes()).unwrap());
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_cost_tree, bench_optimize, bench_revmap_summaries);
criterion_main!(benches);
