//! SRF setup CLI
//!
//! Entry point for the `srf-setup` command-line tool. Runs the engine against
//! the in-process control-point transport with simulated cavities.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use srf_setup::allocator::{Allocation, AmplitudeAllocator, ChildAmplitude};
use srf_setup::cavity::StageFlags;
use srf_setup::config::SetupConfig;
use srf_setup::control_point::LocalTransport;
use srf_setup::listener::RequestListeners;
use srf_setup::logging;
use srf_setup::naming;
use srf_setup::orchestrator::{DeviceOrchestrator, LaunchReport, SetupNode};
use srf_setup::topology::Topology;

#[derive(Parser)]
#[command(name = "srf-setup")]
#[command(about = "Staged setup and shutdown of SRF cavities", version)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Which part of the machine a command addresses; the whole machine if empty.
#[derive(Args, Debug, Clone)]
struct Scope {
    /// Linac section, e.g. L2B
    #[arg(long, conflicts_with = "cryomodule")]
    linac: Option<String>,

    /// Cryomodule, e.g. 02 or CM02
    #[arg(long)]
    cryomodule: Option<String>,

    /// Cavity number within the cryomodule (1-8)
    #[arg(long, requires = "cryomodule")]
    cavity: Option<u8>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the setup pipeline toward a target amplitude
    Setup {
        #[command(flatten)]
        scope: Scope,

        /// Target amplitude in MV (0 runs the shutdown path)
        #[arg(long)]
        amplitude: f64,

        /// Skip the amplifier calibration
        #[arg(long)]
        skip_calibration: bool,

        /// Skip auto-tune
        #[arg(long)]
        skip_tune: bool,

        /// Skip cavity characterization
        #[arg(long)]
        skip_characterization: bool,

        /// Skip the RF ramp
        #[arg(long)]
        skip_ramp: bool,
    },

    /// Turn RF and amplifiers off
    Off {
        #[command(flatten)]
        scope: Scope,
    },

    /// Print how a target amplitude would be split
    Allocate {
        /// Group target amplitude in MV
        #[arg(long)]
        target: f64,

        /// Per-child maxima, comma-separated
        #[arg(long, value_delimiter = ',', required = true)]
        max: Vec<f64>,

        /// Per-child current setpoints, comma-separated (default all zero)
        #[arg(long, value_delimiter = ',')]
        current: Option<Vec<f64>>,
    },

    /// Print the machine tree and control-point prefixes
    Topology,

    /// Listen for setup and shutoff requests on every cavity until Ctrl-C
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => SetupConfig::load_from(path),
        None => SetupConfig::load(),
    }
    .context("failed to load configuration")?;
    logging::init(&config.log_level);

    match cli.command {
        Commands::Setup {
            scope,
            amplitude,
            skip_calibration,
            skip_tune,
            skip_characterization,
            skip_ramp,
        } => {
            let flags = StageFlags {
                calibrate_amplifier: !skip_calibration,
                auto_tune: !skip_tune,
                characterize: !skip_characterization,
                ramp_rf: !skip_ramp,
            };
            run_setup(&config, &scope, flags, amplitude).await
        }
        Commands::Off { scope } => run_off(&config, &scope).await,
        Commands::Allocate {
            target,
            max,
            current,
        } => run_allocate(&config, target, &max, current.as_deref()),
        Commands::Topology => {
            print_topology(&config);
            Ok(())
        }
        Commands::Serve => serve(&config).await,
    }
}

async fn run_setup(
    config: &SetupConfig,
    scope: &Scope,
    flags: StageFlags,
    amplitude: f64,
) -> Result<()> {
    let transport = LocalTransport::new();
    let topology = Topology::simulated(config, &transport)?;
    let (node, devices) = resolve(&topology, scope)?;

    let report = node.start(flags, amplitude).await?;
    print_report(&report);
    node.join().await;
    print_devices(&devices);
    println!("Total readback: {:.2} MV", node.readback()?);
    Ok(())
}

async fn run_off(config: &SetupConfig, scope: &Scope) -> Result<()> {
    let transport = LocalTransport::new();
    let topology = Topology::simulated(config, &transport)?;
    let (node, devices) = resolve(&topology, scope)?;

    let report = node.turn_off().await?;
    print_report(&report);
    node.join().await;
    print_devices(&devices);
    Ok(())
}

async fn serve(config: &SetupConfig) -> Result<()> {
    let transport = LocalTransport::new();
    let topology = Topology::simulated(config, &transport)?;

    let mut listeners = RequestListeners::spawn_all(&topology);
    let mut telemetry = vec![topology.machine().watch_readback()];
    for linac in topology.machine().children() {
        telemetry.push(linac.watch_readback());
        telemetry.extend(linac.children().iter().map(|cm| cm.watch_readback()));
    }
    tracing::info!(
        listeners = listeners.len(),
        workers = topology.pool().max_workers(),
        "waiting for requests"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    tracing::info!("shutting down");
    listeners.shutdown();
    topology.pool().close();
    for task in telemetry {
        task.abort();
    }
    topology.machine().kill_all().await?;
    topology.machine().join().await;
    Ok(())
}

fn run_allocate(
    config: &SetupConfig,
    target: f64,
    max: &[f64],
    current: Option<&[f64]>,
) -> Result<()> {
    if let Some(current) = current {
        anyhow::ensure!(
            current.len() == max.len(),
            "--current has {} values but --max has {}",
            current.len(),
            max.len()
        );
    }
    let children: Vec<ChildAmplitude> = max
        .iter()
        .enumerate()
        .map(|(i, &max)| ChildAmplitude {
            setpoint: current.map_or(0.0, |c| c[i]),
            max,
        })
        .collect();

    match AmplitudeAllocator::new(config.amplitude_tolerance).allocate(target, &children) {
        Allocation::Unchanged => println!("Unchanged: children already sum to {target} MV"),
        Allocation::Assigned(shares) => {
            for (i, (share, child)) in shares.iter().zip(&children).enumerate() {
                let flag = if *share > child.max { "  (over max)" } else { "" };
                println!("child {:>2}: {share:>8.3} MV / max {:>8.3}{flag}", i + 1, child.max);
            }
            println!("total:    {:>8.3} MV", shares.iter().sum::<f64>());
        }
    }
    Ok(())
}

fn print_topology(config: &SetupConfig) {
    println!("{}{}", naming::MACHINE_PREFIX, naming::GROUP_READBACK);
    for linac in &config.linacs {
        println!(
            "{:<6} {}",
            linac.name,
            naming::linac_prefix(linac.index, linac.harmonic_linearizer)
        );
        for cm in &linac.cryomodules {
            println!(
                "  CM{cm:<4} {}",
                naming::cryomodule_prefix(linac.index, cm)
            );
        }
    }
}

fn resolve(
    topology: &Topology,
    scope: &Scope,
) -> Result<(Arc<dyn SetupNode>, Vec<Arc<DeviceOrchestrator>>)> {
    if let Some(cm_name) = &scope.cryomodule {
        if let Some(number) = scope.cavity {
            let device = Arc::clone(topology.cavity(cm_name, number)?);
            let node: Arc<dyn SetupNode> = device.clone();
            return Ok((node, vec![device]));
        }
        let cm = Arc::clone(topology.cryomodule(cm_name)?);
        let devices = cm.children().to_vec();
        let node: Arc<dyn SetupNode> = cm;
        return Ok((node, devices));
    }

    if let Some(linac_name) = &scope.linac {
        let linac = Arc::clone(topology.linac(linac_name)?);
        let devices = linac
            .children()
            .iter()
            .flat_map(|cm| cm.children().iter().cloned())
            .collect();
        let node: Arc<dyn SetupNode> = linac;
        return Ok((node, devices));
    }

    let machine: Arc<dyn SetupNode> = topology.machine().clone();
    let devices = topology.devices().cloned().collect();
    Ok((machine, devices))
}

fn print_report(report: &LaunchReport) {
    println!(
        "Scheduled {}, already running {}, failed {}",
        report.scheduled.len(),
        report.already_running.len(),
        report.failed.len()
    );
    for (device, reason) in &report.failed {
        eprintln!("  {device}: {reason}");
    }
}

fn print_devices(devices: &[Arc<DeviceOrchestrator>]) {
    for device in devices {
        let cavity = device.cavity();
        let reporter = cavity.reporter();
        println!(
            "{:<16} {:<8} {:>5.1}%  {}",
            cavity.name(),
            reporter
                .status()
                .map(|s| s.to_string())
                .unwrap_or_else(|e| e.to_string()),
            reporter.progress().unwrap_or(0.0),
            reporter.message().unwrap_or_default()
        );
    }
}
