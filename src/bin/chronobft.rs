//! Batch runner: the CLI that loads one or more scenario TOML files, drives
//! the configured `(attacker, protocol, (f, N))` matrix through
//! [`chronobft::run::RunController`], and prints an aggregated result table.
//! This binary is deliberately thin glue over the kernel; the kernel never
//! depends on it.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Serialize;

use chronobft::config::Config;
use chronobft::protocols::babble::{self, BabbleConfig, BabbleReplica};
use chronobft::run::{RunController, RunDiagnostics, RunResult};
use chronobft::Error;

/// Discrete-event simulator for BFT consensus protocols under adversarial
/// network conditions.
#[derive(Parser)]
#[command(name = "chronobft", version, about)]
struct Cli {
    /// Path to a scenario TOML file, or a directory of `*.toml` scenarios.
    scenario: PathBuf,

    /// Append one JSON-lines record per run here, overriding `results_path`
    /// in each scenario file.
    #[arg(long)]
    results: Option<PathBuf>,

    /// `tracing-subscriber` env-filter directive (e.g. `info`, `debug`,
    /// `chronobft=trace`).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(cli.log_level.clone()))
        .with_target(false)
        .init();

    let scenarios = match collect_scenarios(&cli.scenario) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    print_header();
    let mut any_failed = false;
    for path in scenarios {
        if let Err(e) = run_scenario(&path, cli.results.as_deref()) {
            eprintln!("error running {}: {e:#}", path.display());
            any_failed = true;
        }
    }
    if any_failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn collect_scenarios(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_dir() {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(path).with_context(|| format!("reading directory {}", path.display()))? {
            let entry = entry?;
            let candidate = entry.path();
            if candidate.extension().and_then(|e| e.to_str()) == Some("toml") {
                out.push(candidate);
            }
        }
        out.sort();
        if out.is_empty() {
            bail!("no *.toml scenarios found under {}", path.display());
        }
        Ok(out)
    } else {
        Ok(vec![path.to_path_buf()])
    }
}

/// One JSON-lines record appended per run when `--results`/`results_path` is
/// set. The sink is write-only append: this binary never reads it back.
#[derive(Serialize)]
struct ResultRecord<'a> {
    scenario: &'a str,
    protocol: &'a str,
    attacker: &'a str,
    node_num: u32,
    byzantine_node_num: u32,
    run_index: usize,
    #[serde(flatten)]
    result: RunResult,
    #[serde(flatten)]
    diagnostics: RunDiagnostics,
}

fn run_scenario(path: &Path, results_override: Option<&Path>) -> Result<()> {
    let config = Config::from_path(path).context("loading scenario config")?;

    let runs: Vec<(RunResult, RunDiagnostics)> = match config.protocol.as_str() {
        "ssb-babble" | "libp2p-babble" => {
            let protocol_config = BabbleConfig::from_table(&config.protocol_config, config.lambda as f64)?;
            let controller =
                RunController::<BabbleReplica>::new(&config, protocol_config, babble::equivocation_mutation)?;
            controller.run_all()
        }
        other => return Err(Error::ProtocolNotImplemented(other.to_string()).into()),
    };

    print_row(path, &config, &runs);

    let results_path = results_override.or_else(|| config.results_path.as_deref().map(Path::new));
    if let Some(results_path) = results_path {
        append_results(results_path, path, &config, &runs)?;
    }

    Ok(())
}

fn append_results(results_path: &Path, scenario: &Path, config: &Config, runs: &[(RunResult, RunDiagnostics)]) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(results_path)
        .with_context(|| format!("opening results file {}", results_path.display()))?;
    let scenario_name = scenario.display().to_string();
    for (index, (result, diagnostics)) in runs.iter().enumerate() {
        let record = ResultRecord {
            scenario: &scenario_name,
            protocol: &config.protocol,
            attacker: &config.attacker,
            node_num: config.node_num,
            byzantine_node_num: config.byzantine_node_num,
            run_index: index,
            result: *result,
            diagnostics: *diagnostics,
        };
        let line = serde_json::to_string(&record)?;
        writeln!(file, "{line}")?;
    }
    Ok(())
}

fn print_header() {
    println!(
        "{:<28} {:<12} {:<14} {:>4} {:>3} {:>9} {:>12} {:>11} {:>9} {:>9}",
        "scenario", "protocol", "attacker", "N", "f", "success", "mean_lat", "mean_msgs", "dropped", "aborted"
    );
}

fn print_row(path: &Path, config: &Config, runs: &[(RunResult, RunDiagnostics)]) {
    let total = runs.len();
    let successes = runs.iter().filter(|(r, _)| r.success).count();

    let latencies: Vec<f64> = runs.iter().filter_map(|(r, _)| r.latency).map(|t| t.as_secs_f64()).collect();
    let mean_latency =
        if latencies.is_empty() { "-".to_string() } else { format!("{:.4}s", latencies.iter().sum::<f64>() / latencies.len() as f64) };

    let mean_msgs = runs.iter().map(|(r, _)| r.delivered_message_count as f64).sum::<f64>() / total.max(1) as f64;
    let dropped: u64 = runs.iter().map(|(_, d)| d.dropped_packets).sum();
    let aborted: u64 = runs.iter().map(|(_, d)| d.aborted_dispatches).sum();

    println!(
        "{:<28} {:<12} {:<14} {:>4} {:>3} {:>5}/{:<3} {:>12} {:>11.1} {:>9} {:>9}",
        truncate(&path.display().to_string(), 28),
        config.protocol,
        config.attacker,
        config.node_num,
        config.byzantine_node_num,
        successes,
        total,
        mean_latency,
        mean_msgs,
        dropped,
        aborted,
    );
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("...{}", &s[s.len() - (max - 3)..])
    }
}
