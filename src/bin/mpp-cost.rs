use clap::{Arg, ArgAction, ArgMatches, Command};
use mpp_core::brin::layout::BRIN_METAPAGE_BLKNO;
use mpp_core::brin::{MetaPageData, RevmapAccessor};
use mpp_core::logging::init_logging;
use mpp_core::query_optimizer::{CostModelParams, NodeId, PlanArena};
use mpp_core::wal::{replay, FileWal};
use mpp_core::{Error, IndexRelation, OptimizedPlan, Optimizer, OptimizerConfig, QueryInput, Result};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::Level;

/// MPP planner tool
///
/// - optimize: cost a query tree and print the cheapest plan
/// - params: show the effective cost model parameters
/// - brin-inspect: rebuild a range index from its WAL and inspect the revmap
fn main() {
    let matches = create_cli().get_matches();

    let level = match matches.get_count("verbose") {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    init_logging(level, matches.get_flag("log-json"));

    if let Err(e) = run_command(&matches) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn create_cli() -> Command {
    Command::new("mpp-cost")
        .about("MPP plan costing and range index inspection")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .help("Increase log verbosity")
                .short('v')
                .long("verbose")
                .global(true)
                .action(ArgAction::Count),
        )
        .arg(
            Arg::new("log-json")
                .help("Emit logs as JSON")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue),
        )
        .subcommand(
            Command::new("optimize")
                .about("Find the cheapest plan for a query")
                .arg(Arg::new("query").help("Query JSON file").required(true).index(1))
                .arg(Arg::new("config").help("Optimizer configuration file").long("config"))
                .arg(
                    Arg::new("format")
                        .help("Output format")
                        .long("format")
                        .value_parser(["text", "json"])
                        .default_value("text"),
                ),
        )
        .subcommand(
            Command::new("params")
                .about("Print the effective cost model parameters")
                .arg(Arg::new("config").help("Optimizer configuration file").long("config")),
        )
        .subcommand(
            Command::new("brin-inspect")
                .about("Replay a range index WAL and inspect its revmap")
                .arg(Arg::new("wal").help("WAL file").required(true).index(1))
                .arg(
                    Arg::new("heap-block")
                        .help("Heap block whose summary to look up")
                        .long("heap-block")
                        .value_parser(clap::value_parser!(u32))
                        .action(ArgAction::Append),
                ),
        )
}

fn run_command(matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("optimize", sub)) => cmd_optimize(sub),
        Some(("params", sub)) => cmd_params(sub),
        Some(("brin-inspect", sub)) => cmd_brin_inspect(sub),
        _ => unreachable!("subcommand is required"),
    }
}

fn required<'a>(matches: &'a ArgMatches, name: &str) -> Result<&'a String> {
    matches
        .get_one::<String>(name)
        .ok_or_else(|| Error::Config(format!("missing argument <{name}>")))
}

fn load_config(matches: &ArgMatches) -> Result<OptimizerConfig> {
    match matches.get_one::<String>("config") {
        Some(path) => OptimizerConfig::load(Path::new(path)),
        None => Ok(OptimizerConfig::default()),
    }
}

fn cmd_optimize(matches: &ArgMatches) -> Result<()> {
    let config = load_config(matches)?;
    let query_path = required(matches, "query")?;
    let query = QueryInput::load(Path::new(query_path))?;
    let optimizer = Optimizer::from_config(&config)?;

    let start = Instant::now();
    let plan = optimizer.optimize(&query)?;
    let elapsed = start.elapsed();

    match matches.get_one::<String>("format").map(String::as_str) {
        Some("json") => {
            let report = json!({
                "cost": plan.cost.value(),
                "hint_violations": plan.hint_violations,
                "stats": plan.stats,
                "elapsed_us": elapsed.as_micros() as u64,
                "plan": plan_json(&plan.arena, plan.root)?,
            });
            println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
        }
        _ => print_plan(&plan, elapsed.as_secs_f64())?,
    }
    Ok(())
}

fn print_plan(plan: &OptimizedPlan, elapsed_secs: f64) -> Result<()> {
    print!("{}", plan.explain()?);
    println!();
    println!("Total cost:       {}", plan.cost);
    println!("Groups:           {}", plan.stats.groups);
    println!(
        "Alternatives:     {} costed, {} rejected by hints",
        plan.stats.alternatives_costed, plan.stats.alternatives_rejected
    );
    if plan.hint_violations > 0 {
        println!("Hints ignored in: {} group(s)", plan.hint_violations);
    }
    println!("Planning time:    {:.3} ms", elapsed_secs * 1000.0);
    Ok(())
}

fn plan_json(arena: &PlanArena, id: NodeId) -> Result<Value> {
    let node = arena.node(id)?;
    let children = node
        .children
        .iter()
        .map(|child| plan_json(arena, *child))
        .collect::<Result<Vec<_>>>()?;
    Ok(json!({
        "op": node.op.name(),
        "relation": node.op.table().map(|t| t.name.clone()),
        "rows": node.stats.rows,
        "width": node.stats.width,
        "cost": node.cost.map(|c| c.value()),
        "children": children,
    }))
}

fn cmd_params(matches: &ArgMatches) -> Result<()> {
    let config = load_config(matches)?;
    let params = CostModelParams::with_overrides(&config.cost_params)?;
    for (param, value) in params.iter() {
        let marker = if config.cost_params.contains_key(&param) { " *" } else { "" };
        println!("{:<40} {:>16e}{}", param.to_string(), value.value, marker);
    }
    Ok(())
}

fn cmd_brin_inspect(matches: &ArgMatches) -> Result<()> {
    let wal_path = required(matches, "wal")?;
    let records = FileWal::read_all(Path::new(wal_path))?;
    let rel = Arc::new(IndexRelation::in_memory(wal_path.as_str()));
    replay(&records, &rel)?;

    let meta = {
        let buf = rel.buffers().read_buffer(BRIN_METAPAGE_BLKNO)?;
        let page = buf.lock_shared();
        MetaPageData::read(&page, rel.name(), BRIN_METAPAGE_BLKNO)?
    };
    println!("Records replayed:  {}", records.len());
    println!("Pages per range:   {}", meta.pages_per_range);
    println!("Append-optimized:  {}", meta.is_ao);
    println!("Last revmap page:  {}", meta.last_revmap_page);
    if meta.is_ao {
        for (seq, chain) in meta.chains.iter().enumerate().filter(|(_, c)| !c.is_empty()) {
            println!(
                "  seq {:>3}: first={} last={} logical pages={}",
                seq, chain.first_page, chain.last_page, chain.last_logical_page_num
            );
        }
    }

    let blocks: Vec<u32> = matches
        .get_many::<u32>("heap-block")
        .map(|values| values.copied().collect())
        .unwrap_or_default();
    if blocks.is_empty() {
        return Ok(());
    }
    let mut revmap = RevmapAccessor::initialize(Arc::clone(&rel))?;
    for heap_blk in blocks {
        match revmap.get_tuple_for_heap_block(heap_blk)? {
            Some(found) => println!(
                "heap block {}: summary at ({}, {}) for range starting {}, {} payload bytes",
                heap_blk,
                found.block,
                found.offset,
                found.tuple.heap_blk,
                found.tuple.payload.len()
            ),
            None => println!("heap block {}: not summarized", heap_blk),
        }
    }
    Ok(())
}
