#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use pp_cache::EvictionPolicy;
use pp_harness::{
    CoalesceDemoReport, DefragDemoReport, WorkloadConfig, run_cache_demo, run_coalesce_demo,
    run_defrag_demo, run_workload,
};
use std::env;

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str);
    let json = args.iter().any(|arg| arg == "--json");

    match cmd {
        Some("demo-coalesce") => {
            let report = run_coalesce_demo().context("coalesce demo failed")?;
            print_coalesce(&report, json)
        }
        Some("demo-defrag") => {
            let report = run_defrag_demo().context("defrag demo failed")?;
            print_defrag(&report, json)
        }
        Some("demo-workload") => {
            let config = parse_workload_config(&args[1..])?;
            let report = run_workload(&config).context("workload failed")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "workload: {} ops, seed {}, {} failed allocation(s)",
                    report.config.operations, report.config.seed, report.failed_allocations
                );
                for line in report.final_state.output_lines() {
                    println!("{line}");
                }
            }
            Ok(())
        }
        Some("demo-cache") => {
            let policy = parse_policy(&args[1..])?;
            let report = run_cache_demo(policy).context("cache demo failed")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("policy: {}", report.policy);
                println!("inserted: {}", report.inserted);
                println!("evictions: {}", report.counters.evictions);
                println!("survivors: {}", report.survivors.join(", "));
            }
            Ok(())
        }
        Some("--help" | "-h" | "help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

fn print_coalesce(report: &CoalesceDemoReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!("== after fill ==");
    for line in report.after_fill.output_lines() {
        println!("{line}");
    }
    println!("== after alternating frees ==");
    for line in report.after_gaps.output_lines() {
        println!("{line}");
    }
    println!("coalesces so far: {}", report.coalesces_after_gaps);
    println!("== after freeing the rest ==");
    for line in report.after_all_freed.output_lines() {
        println!("{line}");
    }
    println!("total coalesces: {}", report.coalesces_total);
    println!(
        "single extent restored: {}",
        if report.restored_single_extent {
            "yes"
        } else {
            "no"
        }
    );
    Ok(())
}

fn print_defrag(report: &DefragDemoReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!("== before ==");
    for line in report.before.output_lines() {
        println!("{line}");
    }
    println!(
        "placing {} pages triggered {} compaction(s), {} entries moved",
        report.requested_pages, report.compactions, report.relocated_entries
    );
    println!("== after ==");
    for line in report.after.output_lines() {
        println!("{line}");
    }
    Ok(())
}

fn parse_workload_config(args: &[String]) -> Result<WorkloadConfig> {
    let mut config = WorkloadConfig::default();
    let mut index = 0_usize;
    while index < args.len() {
        match args[index].as_str() {
            "--seed" => {
                let raw = args.get(index + 1).context("--seed requires a value")?;
                config.seed = raw.parse().context("invalid --seed value")?;
                index += 2;
            }
            "--ops" => {
                let raw = args.get(index + 1).context("--ops requires a value")?;
                config.operations = raw.parse().context("invalid --ops value")?;
                index += 2;
            }
            "--pages" => {
                let raw = args.get(index + 1).context("--pages requires a value")?;
                config.total_pages = raw.parse().context("invalid --pages value")?;
                index += 2;
            }
            "--json" => {
                index += 1;
            }
            other => {
                bail!("unknown demo-workload option: {other}");
            }
        }
    }
    Ok(config)
}

fn parse_policy(args: &[String]) -> Result<EvictionPolicy> {
    let mut policy = EvictionPolicy::Lru;
    let mut index = 0_usize;
    while index < args.len() {
        match args[index].as_str() {
            "--policy" => {
                let raw = args.get(index + 1).context("--policy requires a value")?;
                policy = raw.parse().context("invalid --policy value")?;
                index += 2;
            }
            "--json" => {
                index += 1;
            }
            other => {
                bail!("unknown demo-cache option: {other}");
            }
        }
    }
    Ok(policy)
}

fn print_usage() {
    println!("pp-harness — allocator demos and workload simulation");
    println!();
    println!("USAGE:");
    println!("  pp-harness demo-coalesce [--json]");
    println!("  pp-harness demo-defrag [--json]");
    println!("  pp-harness demo-workload [--seed N] [--ops N] [--pages N] [--json]");
    println!("  pp-harness demo-cache [--policy lru|fifo|sieve|clock] [--json]");
    println!();
    println!("DEMOS:");
    println!("  demo-coalesce  adjacent free ranges merging back into one extent");
    println!("  demo-defrag    automatic compaction recovering a fragmented pool");
    println!("  demo-workload  seeded random allocate/free stream with a final report");
    println!("  demo-cache     eviction policies under memory pressure");
}
