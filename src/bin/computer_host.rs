// CLASSIFICATION: COMMUNITY
// Filename: computer_host.rs v0.2
// Author: Lukas Bower
// Date Modified: 2027-08-29

//! Command-line front end for the computer core: policy checks and a
//! synthetic scheduling workload.

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use log::info;

use computer_core::computer::{runtime_factory, ResumeOutcome, ScriptRuntime};
use computer_core::config::CoreConfig;
use computer_core::net::{NetworkPolicy, SystemResolver, Verdict};
use computer_core::scheduler::Slice;
use computer_core::ComputerHost;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Configuration file. Defaults to $COMPUTER_CORE_CONFIG, then built-ins.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: HostCommand,
}

#[derive(Subcommand)]
enum HostCommand {
    /// Classify a host against the configured address policy.
    CheckAddress {
        host: String,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run a synthetic workload and print metrics as JSON.
    Simulate {
        #[arg(long, default_value_t = 8)]
        computers: u32,
        #[arg(long, default_value_t = 100)]
        ticks: u64,
        /// Host tick length in milliseconds.
        #[arg(long, default_value_t = 50)]
        tick_ms: u64,
        /// Busy time per resume in microseconds.
        #[arg(long, default_value_t = 2000)]
        work_us: u64,
        /// Computers that never yield on their own.
        #[arg(long, default_value_t = 0)]
        greedy: u32,
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

/// Spins for a fixed amount of work per resume, checking in regularly.
struct Spinner {
    work: Duration,
    greedy: bool,
}

impl ScriptRuntime for Spinner {
    fn resume(&mut self, slice: &mut Slice<'_>) -> ResumeOutcome {
        while slice.pop_event().is_some() {}
        let start = Instant::now();
        while self.greedy || start.elapsed() < self.work {
            if slice.checkpoint().is_err() {
                return ResumeOutcome::Yielded;
            }
            std::hint::spin_loop();
        }
        ResumeOutcome::Yielded
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<CoreConfig> {
    match path {
        Some(path) => CoreConfig::load(&path).with_context(|| format!("loading {}", path.display())),
        None => Ok(CoreConfig::load_active()),
    }
}

fn check_address(cfg: &CoreConfig, host: &str, port: Option<u16>) -> anyhow::Result<()> {
    let policy = NetworkPolicy::from_config(&cfg.http)?;
    match policy.classify(host, port, &SystemResolver) {
        Verdict::Allowed(addrs) => {
            let list: Vec<String> = addrs.iter().map(|a| a.to_string()).collect();
            println!("allowed {host} via {}", list.join(", "));
        }
        Verdict::Denied(reason) => println!("denied {host}: {reason}"),
    }
    Ok(())
}

fn simulate(
    cfg: CoreConfig,
    computers: u32,
    ticks: u64,
    tick: Duration,
    work: Duration,
    greedy: u32,
    data_dir: PathBuf,
) -> anyhow::Result<()> {
    let host = ComputerHost::new(
        cfg,
        &data_dir,
        runtime_factory(move |id| Spinner {
            work,
            greedy: id < greedy,
        }),
    )?;
    for _ in 0..computers {
        let computer = host.create_computer()?;
        computer.turn_on();
    }
    info!("simulating {computers} computers for {ticks} ticks");
    let mut deferred = 0;
    for _ in 0..ticks {
        thread::sleep(tick);
        if host.scheduler_tick().deferred {
            deferred += 1;
        }
    }
    let mut report = host.metrics();
    report["finished_at"] = Utc::now().to_rfc3339().into();
    report["deferred_ticks_observed"] = deferred.into();
    host.stop();
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let cfg = load_config(cli.config)?;
    match cli.command {
        HostCommand::CheckAddress { host, port } => check_address(&cfg, &host, port),
        HostCommand::Simulate {
            computers,
            ticks,
            tick_ms,
            work_us,
            greedy,
            data_dir,
        } => {
            let data_dir = data_dir.unwrap_or_else(|| std::env::temp_dir().join("computer-host"));
            simulate(
                cfg,
                computers,
                ticks,
                Duration::from_millis(tick_ms),
                Duration::from_micros(work_us),
                greedy,
                data_dir,
            )
        }
    }
}
