use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use speed_bump::cli::{Cli, Command, OutputFormat};
use speed_bump::{clock, delay, pattern};
use std::path::Path;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber (warnings by default, everything with --debug)
fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[derive(Debug, Serialize)]
struct CheckReport<'a> {
    path: String,
    patterns: &'a [pattern::TargetPattern],
    #[serde(skip_serializing_if = "Option::is_none")]
    probe: Option<ProbeReport<'a>>,
}

#[derive(Debug, Serialize)]
struct ProbeReport<'a> {
    module: &'a str,
    name: &'a str,
    matched: bool,
    matching_patterns: Vec<&'a str>,
}

#[derive(Debug, Serialize)]
struct DelayReport {
    requested_ns: u64,
    iterations: u32,
    min_ns: u64,
    mean_ns: u64,
    max_ns: u64,
    worst_overshoot_ns: u64,
    min_delay_ns: u64,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize report")?
    );
    Ok(())
}

fn run_calibrate(format: OutputFormat) -> Result<()> {
    let calibration = clock::calibrate();
    match format {
        OutputFormat::Json => print_json(&calibration)?,
        OutputFormat::Text => {
            println!("clock overhead: {} ns", calibration.overhead_ns);
            println!("minimum delay:  {} ns", calibration.min_delay_ns);
        }
    }
    Ok(())
}

fn run_check(
    targets: &Path,
    probe: Option<(&str, &str)>,
    format: OutputFormat,
) -> Result<()> {
    let patterns = pattern::load_targets(targets)
        .with_context(|| format!("Invalid targets file {}", targets.display()))?;

    if patterns.is_empty() {
        tracing::warn!(
            path = %targets.display(),
            "no patterns found, speed-bump would be disabled"
        );
    }

    let probe = probe.map(|(module, name)| {
        let matching_patterns: Vec<&str> = patterns
            .iter()
            .filter(|p| p.matches(module, name))
            .map(|p| p.original())
            .collect();
        ProbeReport {
            module,
            name,
            matched: !matching_patterns.is_empty(),
            matching_patterns,
        }
    });

    match format {
        OutputFormat::Json => print_json(&CheckReport {
            path: targets.display().to_string(),
            patterns: &patterns,
            probe,
        })?,
        OutputFormat::Text => {
            println!(
                "{} patterns loaded from {}",
                patterns.len(),
                targets.display()
            );
            for p in &patterns {
                println!("  {}", p);
            }
            if let Some(probe) = probe {
                if probe.matched {
                    println!("{}:{} matches", probe.module, probe.name);
                    for original in &probe.matching_patterns {
                        println!("  via {}", original);
                    }
                } else {
                    println!("{}:{} does not match", probe.module, probe.name);
                }
            }
        }
    }
    Ok(())
}

fn run_delay(requested_ns: u64, iterations: u32, format: OutputFormat) -> Result<()> {
    let iterations = iterations.max(1);
    let min_delay_ns = clock::min_delay_ns();
    if requested_ns < min_delay_ns {
        tracing::warn!(
            requested_ns,
            min_delay_ns,
            "requested delay is below the calibrated minimum and cannot be honored accurately"
        );
    }

    let mut min_ns = u64::MAX;
    let mut max_ns = 0u64;
    let mut total_ns = 0u128;
    for _ in 0..iterations {
        let start = Instant::now();
        delay::spin_delay_ns(requested_ns);
        let elapsed = start.elapsed().as_nanos() as u64;
        min_ns = min_ns.min(elapsed);
        max_ns = max_ns.max(elapsed);
        total_ns += u128::from(elapsed);
    }

    let report = DelayReport {
        requested_ns,
        iterations,
        min_ns,
        mean_ns: (total_ns / u128::from(iterations)) as u64,
        max_ns,
        worst_overshoot_ns: max_ns.saturating_sub(requested_ns),
        min_delay_ns,
    };

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Text => {
            println!(
                "spin_delay_ns({}) x {}",
                report.requested_ns, report.iterations
            );
            println!("  min:  {} ns", report.min_ns);
            println!("  mean: {} ns", report.mean_ns);
            println!("  max:  {} ns", report.max_ns);
            println!("  worst overshoot: {} ns", report.worst_overshoot_ns);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.debug);

    match &args.command {
        Command::Calibrate => run_calibrate(args.format),
        Command::Check {
            targets,
            module,
            name,
        } => {
            let probe = module.as_deref().zip(name.as_deref());
            run_check(targets, probe, args.format)
        }
        Command::Delay { ns, iterations } => run_delay(*ns, *iterations, args.format),
    }
}
