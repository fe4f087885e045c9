// Scenario Runner - Load and execute scenario files
//
// Usage:
//   cargo run --bin scenario_runner scenarios/two_groups.yaml
//   cargo run --bin scenario_runner scenarios/  (runs all .yaml/.json files in directory)
//   cargo run --bin scenario_runner scenarios/two_groups.yaml --seed 0x1234...
//   cargo run --bin scenario_runner scenarios/two_groups.yaml --pace --quiet
//
// Exit codes: 0 completed, 1 report i/o, 2 configuration, 3 registration, 4 internal invariant

use log::{error, info, warn, LevelFilter};
use sam_scenario::{
    FsReportWriter, LoopbackDispatcher, NoOpSink, ReportWriter, RunOptions, Scenario,
    ScenarioRunner, Seed, SimError,
};
use simple_logger::SimpleLogger;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

struct Args {
    path: PathBuf,
    seed: Option<Seed>,
    pace: bool,
    quiet: bool,
    reports: PathBuf,
}

fn usage(program: &str) -> ! {
    eprintln!(
        "Usage: {} <scenario.yaml | directory/> [--seed SEED_HEX] [--pace] [--quiet] [--reports DIR]",
        program
    );
    eprintln!("\nExamples:");
    eprintln!("  {} scenarios/two_groups.yaml", program);
    eprintln!("  {} scenarios/", program);
    eprintln!("  {} scenarios/two_groups.yaml --seed 0x123456...", program);
    process::exit(2);
}

fn parse_args() -> Args {
    let args: Vec<String> = env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("scenario_runner");

    let mut path = None;
    let mut seed = None;
    let mut pace = false;
    let mut quiet = false;
    let mut reports = PathBuf::from("reports");

    let mut rest = args.iter().skip(1);
    while let Some(arg) = rest.next() {
        match arg.as_str() {
            "--seed" => match rest.next().map(|s| parse_seed_hex(s)) {
                Some(Ok(s)) => seed = Some(s),
                Some(Err(e)) => {
                    eprintln!("Invalid hex seed: {}", e);
                    process::exit(2);
                }
                None => usage(program),
            },
            "--reports" => match rest.next() {
                Some(dir) => reports = PathBuf::from(dir),
                None => usage(program),
            },
            "--pace" => pace = true,
            "--quiet" => quiet = true,
            other if path.is_none() && !other.starts_with("--") => path = Some(PathBuf::from(other)),
            _ => usage(program),
        }
    }

    let Some(path) = path else { usage(program) };
    Args {
        path,
        seed,
        pace,
        quiet,
        reports,
    }
}

#[tokio::main]
async fn main() {
    let args = parse_args();

    let level = if args.quiet { LevelFilter::Info } else { LevelFilter::Debug };
    if let Err(e) = SimpleLogger::new().with_level(level).init() {
        eprintln!("logger init failed: {}", e);
    }

    let scenarios = if args.path.is_dir() {
        scenario_files(&args.path)
    } else if args.path.is_file() {
        vec![args.path.clone()]
    } else {
        error!("Path does not exist: {}", args.path.display());
        process::exit(2);
    };

    if scenarios.is_empty() {
        error!("No scenario files found in {}", args.path.display());
        process::exit(2);
    }

    let mut exit_code = 0;
    for (i, scenario_path) in scenarios.iter().enumerate() {
        info!("{}/{} Running: {}", i + 1, scenarios.len(), scenario_path.display());
        if let Err(e) = run_scenario_file(scenario_path, &args).await {
            error!("{}: {}", scenario_path.display(), e);
            exit_code = e.exit_code();
        }
    }

    process::exit(exit_code);
}

fn scenario_files(dir: &Path) -> Vec<PathBuf> {
    let mut scenarios: Vec<PathBuf> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|entry| entry.path())
                .filter(|path| {
                    matches!(
                        path.extension().and_then(|s| s.to_str()),
                        Some("yaml" | "yml" | "json")
                    )
                })
                .collect()
        })
        .unwrap_or_default();

    scenarios.sort();
    scenarios
}

async fn run_scenario_file(path: &Path, args: &Args) -> Result<(), SimError> {
    let scenario = Scenario::load(path)?;

    info!(
        "{}: {} clients, groups {:?}, {} ticks of {}ms against {:?} at {}",
        scenario.name,
        scenario.clients,
        scenario.group_fractions(),
        scenario.duration_ticks,
        scenario.tick_millis,
        scenario.infrastructure,
        scenario.address
    );

    let dispatcher = LoopbackDispatcher::new(scenario.address.clone());
    let options = RunOptions {
        seed: args.seed,
        pace: args.pace,
    };
    let mut runner = ScenarioRunner::new(scenario, dispatcher, options)?;
    info!("seed: 0x{}", hex_seed(runner.seed()));

    // ctrl-c finishes the current tick and still writes a partial report
    let stop = runner.stop_handle();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("stop requested");
            stop.stop();
        }
    });

    let result = if args.quiet {
        runner.run_with_sink(&mut NoOpSink).await
    } else {
        runner.run().await
    };
    watcher.abort();
    let report = result?;

    report.print_summary();
    let stats = runner.dispatcher().stats();
    info!(
        "loopback {}: {} clients, {} messages ({} bytes), {} dropped",
        runner.dispatcher().address(),
        stats.registered,
        stats.transmitted,
        stats.bytes,
        stats.dropped
    );

    let mut writer = FsReportWriter::new(args.reports.clone());
    writer.write(&report.scenario.report_path(), &report)?;
    Ok(())
}

fn hex_seed(seed: &Seed) -> String {
    seed.iter().map(|b| format!("{:02x}", b)).collect()
}

fn parse_seed_hex(hex: &str) -> Result<Seed, String> {
    let hex = hex.strip_prefix("0x").unwrap_or(hex);
    let mut seed = [0u8; 32];

    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        if i >= 32 {
            break;
        }
        let byte_str = std::str::from_utf8(chunk).map_err(|e| e.to_string())?;
        seed[i] = u8::from_str_radix(byte_str, 16).map_err(|e| e.to_string())?;
    }

    Ok(seed)
}
