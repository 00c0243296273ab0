//! svmem-probe
//!
//! Runs the atomic capability probe on every device (or one selected
//! device) that advertises fine-grained atomics.
//!
//! Exit codes: 0 all probed devices passed, 1 error, 2 a device
//! advertises atomics but does not honor them.

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use svmem_core::probe::PROBE_FLAGS;
use svmem_core::{default_runtime, run_atomic_probe, Config, Error, SvmManager};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

const EXIT_MISMATCH: i32 = 2;

#[derive(Parser)]
#[command(name = "svmem-probe")]
#[command(version)]
#[command(about = "Check that SVM atomics advertised by each device actually work")]
struct Cli {
    /// Concurrent increments per device (default from config, 1000)
    #[arg(long)]
    work_items: Option<usize>,

    /// Probe only the device at this flat index
    #[arg(long)]
    device: Option<usize>,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

enum Outcome {
    Passed { observed: u64 },
    Skipped { reason: String },
    Mismatch { expected: u64, observed: u64 },
    Failed { error: String },
}

struct DeviceResult {
    index: usize,
    name: String,
    outcome: Outcome,
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            Config::from_toml_str(&text).with_context(|| format!("parsing {}", path.display()))
        }
        None => Ok(Config::default()),
    }
}

fn probe_all(
    manager: &SvmManager,
    only: Option<usize>,
    work_items: usize,
) -> Result<Vec<DeviceResult>> {
    let platforms = manager.discover().context("device discovery failed")?;
    let devices: Vec<_> = platforms
        .iter()
        .flat_map(|p| p.devices.iter())
        .enumerate()
        .collect();
    if let Some(index) = only {
        if index >= devices.len() {
            bail!("device index {} out of range ({} devices)", index, devices.len());
        }
    }

    let mut results = Vec::new();
    for (index, device) in devices {
        if only.is_some_and(|i| i != index) {
            continue;
        }
        let name = device.name.to_string();
        let outcome = if let Err(e) = device.record.validate(PROBE_FLAGS) {
            info!(device = %name, "skipped: {}", e);
            Outcome::Skipped {
                reason: e.to_string(),
            }
        } else {
            match manager.create_context(device.platform, device.id) {
                Ok(mut context) => {
                    let outcome = match run_atomic_probe(&mut context, work_items) {
                        Ok(report) => Outcome::Passed {
                            observed: report.observed,
                        },
                        Err(Error::CapabilityMismatch {
                            expected, observed, ..
                        }) => Outcome::Mismatch { expected, observed },
                        Err(e) => Outcome::Failed {
                            error: e.to_string(),
                        },
                    };
                    if let Err(e) = context.destroy() {
                        warn!(device = %name, error = %e, "context destroy failed");
                    }
                    outcome
                }
                Err(e) => Outcome::Failed {
                    error: e.to_string(),
                },
            }
        };
        results.push(DeviceResult { index, name, outcome });
    }
    Ok(results)
}

fn print_text(results: &[DeviceResult], work_items: usize) {
    for r in results {
        let line = match &r.outcome {
            Outcome::Passed { observed } => format!("PASS     {}/{}", observed, work_items),
            Outcome::Skipped { reason } => format!("SKIP     {}", reason),
            Outcome::Mismatch { expected, observed } => {
                format!("MISMATCH expected {}, observed {}", expected, observed)
            }
            Outcome::Failed { error } => format!("ERROR    {}", error),
        };
        println!("[{}] {:<32} {}", r.index, r.name, line);
    }
}

fn print_json(results: &[DeviceResult], work_items: usize) -> Result<()> {
    let devices: Vec<_> = results
        .iter()
        .map(|r| {
            let mut entry = json!({ "index": r.index, "name": r.name });
            let detail = match &r.outcome {
                Outcome::Passed { observed } => json!({ "status": "passed", "observed": observed }),
                Outcome::Skipped { reason } => json!({ "status": "skipped", "reason": reason }),
                Outcome::Mismatch { expected, observed } => {
                    json!({ "status": "mismatch", "expected": expected, "observed": observed })
                }
                Outcome::Failed { error } => json!({ "status": "error", "error": error }),
            };
            if let (Some(entry), Some(detail)) = (entry.as_object_mut(), detail.as_object()) {
                entry.extend(detail.clone());
            }
            entry
        })
        .collect();
    let doc = json!({ "work_items": work_items, "devices": devices });
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(cli.config.as_ref())?;
    let work_items = cli.work_items.unwrap_or(config.probe_work_items);
    let manager = SvmManager::with_config(default_runtime(), config)?;

    let results = probe_all(&manager, cli.device, work_items)?;
    if cli.json {
        print_json(&results, work_items)?;
    } else {
        print_text(&results, work_items);
    }
    manager.shutdown()?;

    if results.iter().any(|r| matches!(r.outcome, Outcome::Mismatch { .. })) {
        std::process::exit(EXIT_MISMATCH);
    }
    if results.iter().any(|r| matches!(r.outcome, Outcome::Failed { .. })) {
        bail!("probe failed on at least one device");
    }
    Ok(())
}
