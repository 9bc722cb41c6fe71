// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Simulator throughput sweep.
//!
//! Builds the integrator and chain benchmark networks and times them across
//! planners and unroll factors. Results are printed as a table and can be
//! written to a JSON file for comparison between commits.

use std::env;
use std::fs;
use std::path::PathBuf;
use std::process;

use dlsim::config::{PlannerKind, Precision};
use dlsim::engine::benchmarks::{chain, integrator, run_profile, BenchmarkResult};
use dlsim::engine::{SimFloat, SimulatorOptions};
use dlsim::model::{Network, NeuronType};
use dlsim::observability::{init_console_logging, parse_debug_flags, LoggingOptions};

struct Args {
    dimensions: usize,
    neurons_per_d: usize,
    layers: usize,
    width: usize,
    steps: usize,
    dtype: Precision,
    output: Option<PathBuf>,
}

fn usage_and_exit() -> ! {
    eprintln!(
        "Usage: run_benchmarks [--dimensions <n>] [--neurons-per-d <n>] [--layers <n>]\n\
         \x20                     [--width <n>] [--steps <n>] [--dtype float32|float64]\n\
         \x20                     [--output <path>] [--debug-<crate>]\n\n\
         Defaults:\n\
         - dimensions: 4, neurons-per-d: 32\n\
         - layers: 4, width: 64\n\
         - steps: 1000, dtype: float32\n"
    );
    process::exit(2);
}

fn parse_number(value: Option<String>) -> usize {
    let value = value.unwrap_or_else(|| usage_and_exit());
    value.parse().unwrap_or_else(|_| {
        eprintln!("Expected a positive integer, got '{value}'");
        usage_and_exit();
    })
}

fn parse_args() -> Args {
    let mut parsed = Args {
        dimensions: 4,
        neurons_per_d: 32,
        layers: 4,
        width: 64,
        steps: 1000,
        dtype: Precision::Float32,
        output: None,
    };

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--dimensions" => parsed.dimensions = parse_number(args.next()),
            "--neurons-per-d" => parsed.neurons_per_d = parse_number(args.next()),
            "--layers" => parsed.layers = parse_number(args.next()),
            "--width" => parsed.width = parse_number(args.next()),
            "--steps" => parsed.steps = parse_number(args.next()),
            "--dtype" => {
                let v = args.next().unwrap_or_else(|| usage_and_exit());
                parsed.dtype = v.parse().unwrap_or_else(|e| {
                    eprintln!("{e}");
                    usage_and_exit();
                });
            }
            "--output" => {
                let v = args.next().unwrap_or_else(|| usage_and_exit());
                parsed.output = Some(PathBuf::from(v));
            }
            "-h" | "--help" => usage_and_exit(),
            // handled by parse_debug_flags
            other if other.starts_with("--debug-") => {}
            other => {
                eprintln!("Unknown argument: {other}");
                usage_and_exit();
            }
        }
    }

    parsed
}

fn sweep<T: SimFloat>(
    name: &str,
    network: &Network,
    steps: usize,
    dtype: Precision,
    results: &mut Vec<BenchmarkResult>,
) {
    let options = SimulatorOptions::default()
        .with_seed(0)
        .with_dtype(dtype)
        .with_progress_bar(false);

    for planner in [PlannerKind::Noop, PlannerKind::Greedy, PlannerKind::Transitive] {
        for unroll in [1, 10] {
            let options = options.clone().with_planner(planner).with_unroll(unroll);
            match run_profile::<T>(name, network, options, steps) {
                Ok(result) => results.push(result),
                Err(e) => {
                    eprintln!("{name} (planner={planner}, unroll={unroll}) failed: {e}");
                    process::exit(1);
                }
            }
        }
    }
}

fn run_all<T: SimFloat>(args: &Args) -> Vec<BenchmarkResult> {
    let networks = [
        (
            "integrator",
            integrator(args.dimensions, args.neurons_per_d, NeuronType::lif(), 0),
        ),
        ("chain", chain(args.layers, args.width, NeuronType::rectified_linear(), 0)),
    ];

    let mut results = Vec::new();
    for (name, built) in networks {
        let (network, _) = built.unwrap_or_else(|e| {
            eprintln!("Failed to build {name} network: {e}");
            process::exit(2);
        });
        sweep::<T>(name, &network, args.steps, args.dtype, &mut results);
    }
    results
}

fn print_table(results: &[BenchmarkResult]) {
    println!(
        "{:<12} {:<8} {:<11} {:>6} {:>7} {:>9} {:>9} {:>12}",
        "network", "dtype", "planner", "unroll", "groups", "build_s", "run_s", "steps/s"
    );
    for r in results {
        println!(
            "{:<12} {:<8} {:<11} {:>6} {:>7} {:>9.3} {:>9.3} {:>12.0}",
            r.name, r.dtype, r.planner, r.unroll, r.n_groups, r.build_secs, r.run_secs, r.steps_per_sec
        );
    }
}

fn main() {
    let args = parse_args();
    if let Err(e) = init_console_logging(&parse_debug_flags(), &LoggingOptions::default()) {
        eprintln!("{e}");
    }

    let results = match args.dtype {
        Precision::Float32 => run_all::<f32>(&args),
        Precision::Float64 => run_all::<f64>(&args),
    };
    print_table(&results);

    if let Some(path) = &args.output {
        let json = serde_json::to_string_pretty(&results).unwrap_or_else(|e| {
            eprintln!("Failed to serialize results: {e}");
            process::exit(2);
        });
        if let Err(e) = fs::write(path, json) {
            eprintln!("Failed to write {}: {e}", path.display());
            process::exit(2);
        }
        println!("\nWrote {} results to {}", results.len(), path.display());
    }
}
