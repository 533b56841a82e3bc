// Copyright (c) Advanced Micro Devices, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use crossbeam::channel::bounded;
use crossbeam::channel::Sender;
use log::info;

use adp_utils::passthrough;
use adp_utils::{HealthClient, NamingStrategy, SysfsPaths};

use adp_plugin::config::{resolve_driver_type, DriverProbePaths, DriverType};
use adp_plugin::plugin::{self, LogSink, Snapshot};

#[derive(Debug, Parser)]
#[command(
    name = "adp_plugin",
    version,
    about = "Topology-aware AMD GPU device plugin daemon."
)]
struct Opts {
    /// Seconds between health check polls. 0 disables the heartbeat.
    #[clap(long, default_value = "30")]
    pulse: u64,

    /// Driver stack to serve: container, vf-passthrough or pf-passthrough.
    /// When omitted the modes are probed in that order.
    #[clap(long)]
    driver_type: Option<String>,

    /// Resource naming strategy: single or mixed.
    #[clap(long, default_value = "single")]
    resource_naming_strategy: String,

    /// Override the KFD sysfs root.
    #[clap(long, default_value = adp_utils::topology::KFD_ROOT)]
    kfd_root: String,

    /// Increase log verbosity. Repeat for more.
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logger(verbose: u8) -> Result<()> {
    let level = match verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        level,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;
    Ok(())
}

/// Fire a tick every `pulse` seconds. A zero pulse disables the heartbeat
/// entirely; the serve loop then only ever sees shutdown.
fn spawn_heartbeat(pulse: u64, tx: Sender<()>) {
    if pulse == 0 {
        return;
    }
    thread::spawn(move || loop {
        thread::sleep(Duration::from_secs(pulse));
        if tx.send(()).is_err() {
            break;
        }
    });
}

fn run_container(opts: &Opts, strategy: NamingStrategy, shutdown: Arc<AtomicBool>) -> Result<()> {
    let mut paths = SysfsPaths::default();
    paths.kfd_root = Path::new(&opts.kfd_root).to_path_buf();

    let snapshot = Arc::new(Snapshot::build(paths, strategy)?);
    info!(
        "serving {} devices as {:?} (allocator {})",
        snapshot.inventory.len(),
        snapshot.resources,
        if snapshot.allocator_ready() { "ready" } else { "disabled" },
    );

    let (tx, rx) = bounded(0);
    spawn_heartbeat(opts.pulse, tx);

    // The registration adapter pushes replacement snapshots here when the
    // inventory changes; until then the sender just stays open.
    let (_refresh_tx, refresh_rx) = bounded::<Arc<Snapshot>>(1);

    let client = HealthClient::new();
    plugin::serve(snapshot, &rx, &refresh_rx, &shutdown, &client, &mut LogSink)
}

fn run_passthrough(
    opts: &Opts,
    driver_type: DriverType,
    strategy: NamingStrategy,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let (groups, resource, driver_path) = match driver_type {
        DriverType::VfPassthrough => {
            let vf_map = passthrough::vf_mapping(passthrough::PCI_DEVICE_PATH)
                .context("generating VF map")?;
            if let Ok((version, src)) = passthrough::gim_versions(passthrough::GIM_MODULE_PATH) {
                info!("gim driver {} ({})", version, src);
            }
            let groups: std::collections::HashMap<String, Vec<String>> = vf_map
                .into_iter()
                .map(|(iommu, vfs)| (iommu, vfs.into_iter().map(|v| v.vf).collect()))
                .collect();
            (
                groups,
                adp_utils::DEVICE_TYPE_GPU,
                Path::new(passthrough::GIM_DRIVER_PATH),
            )
        }
        DriverType::PfPassthrough => {
            let pf_map = passthrough::pf_mapping(passthrough::PCI_DEVICE_PATH)
                .context("generating PF map")?;
            let groups: std::collections::HashMap<String, Vec<String>> = pf_map
                .into_iter()
                .map(|(iommu, pfs)| (iommu, pfs.into_iter().map(|p| p.pf).collect()))
                .collect();
            let resource = match strategy {
                NamingStrategy::Mixed => adp_utils::DEVICE_TYPE_GPU_PF,
                NamingStrategy::Single => adp_utils::DEVICE_TYPE_GPU,
            };
            (groups, resource, Path::new(passthrough::VFIO_DRIVER_PATH))
        }
        DriverType::Container => unreachable!("container mode served elsewhere"),
    };

    info!("serving {} IOMMU groups as {}", groups.len(), resource);
    let mut group_ids: Vec<String> = groups.keys().cloned().collect();
    group_ids.sort();

    let (tx, rx) = bounded(0);
    spawn_heartbeat(opts.pulse, tx);

    plugin::serve_passthrough(resource, &group_ids, driver_path, &rx, &shutdown, &mut LogSink)
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    init_logger(opts.verbose)?;

    let strategy: NamingStrategy = opts.resource_naming_strategy.parse()?;
    let requested = opts
        .driver_type
        .as_deref()
        .map(str::parse::<DriverType>)
        .transpose()?;
    let driver_type = resolve_driver_type(requested, &DriverProbePaths::default())?;
    info!("starting in {} mode, {} naming", driver_type, strategy);

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("setting signal handler")?;

    match driver_type {
        DriverType::Container => run_container(&opts, strategy, shutdown),
        _ => run_passthrough(&opts, driver_type, strategy, shutdown),
    }
}
