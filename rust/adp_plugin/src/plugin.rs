// Copyright (c) Advanced Micro Devices, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The serving side of the daemon: immutable snapshots of the discovered
//! world, the advertised device records, allocate-response assembly for
//! every driver mode, and the heartbeat loop that re-evaluates health.
//!
//! The snapshot is built once before serving starts and never mutated; a
//! refresh builds a new one and swaps the `Arc`. The loop owns no other
//! shared state, so allocation queries can run concurrently against the
//! same snapshot from any thread.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use crossbeam::channel::Receiver;
use crossbeam::channel::RecvTimeoutError;
use log::info;
use log::warn;

use adp_utils::passthrough;
use adp_utils::topology;
use adp_utils::{
    AllocError, BestEffortPolicy, DeviceInventory, Health, HealthClient, NamingStrategy, Policy,
    SysfsPaths,
};

/// How often the serve loop wakes up to notice a shutdown request.
const SHUTDOWN_POLL: Duration = Duration::from_millis(500);

/// One device record as advertised to the node agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisedDevice {
    pub id: String,
    pub health: Health,
    pub numa_nodes: Vec<i64>,
}

/// A host device mounted into the workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    pub host_path: String,
    pub container_path: String,
    pub permissions: &'static str,
}

impl DeviceSpec {
    fn same_path(path: impl Into<String>, permissions: &'static str) -> Self {
        let path = path.into();
        Self {
            host_path: path.clone(),
            container_path: path,
            permissions,
        }
    }
}

/// Mounts and environment handed back for one allocation request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocateResponse {
    pub devices: Vec<DeviceSpec>,
    pub envs: HashMap<String, String>,
}

/// Where advertised device lists go. The kubelet registration adapter
/// implements this; tests collect into memory.
pub trait DeviceSink: Send {
    fn advertise(&mut self, resource: &str, devices: &[AdvertisedDevice]) -> Result<()>;
}

/// Fallback sink that just logs what would be advertised.
pub struct LogSink;

impl DeviceSink for LogSink {
    fn advertise(&mut self, resource: &str, devices: &[AdvertisedDevice]) -> Result<()> {
        info!("advertising {} devices under {}", devices.len(), resource);
        for dev in devices {
            info!(
                "  {} [{}] numa {:?}",
                dev.id,
                dev.health.as_str(),
                dev.numa_nodes
            );
        }
        Ok(())
    }
}

/// Immutable view of the node used by the serving path.
pub struct Snapshot {
    pub paths: SysfsPaths,
    pub strategy: NamingStrategy,
    pub inventory: DeviceInventory,
    pub resources: Vec<String>,
    policy: BestEffortPolicy,
    allocator_ready: bool,
}

impl Snapshot {
    /// Discover the inventory and bring up the allocator. A heterogeneous
    /// inventory under the single strategy is a configuration error and
    /// fails startup; a broken affinity graph only disables preferred
    /// allocation.
    pub fn build(paths: SysfsPaths, strategy: NamingStrategy) -> Result<Self> {
        let inventory = DeviceInventory::discover(&paths).context("device discovery")?;
        let resources = strategy
            .resource_names(&inventory)
            .context("resolving resource names")?;

        let mut policy = BestEffortPolicy::new();
        let mut allocator_ready = false;
        if !inventory.is_empty() {
            match policy.init_from_topology(inventory.devices().to_vec(), &paths.kfd_root) {
                Ok(()) => allocator_ready = true,
                Err(e) => {
                    warn!("allocator init failed, falling back to default allocation: {}", e);
                }
            }
        }

        Ok(Self {
            paths,
            strategy,
            inventory,
            resources,
            policy,
            allocator_ready,
        })
    }

    /// Whether preferred-allocation queries can be answered.
    pub fn allocator_ready(&self) -> bool {
        self.allocator_ready
    }

    /// Devices advertised under `resource`, all healthy until the first
    /// heartbeat says otherwise.
    pub fn device_list(&self, resource: &str) -> Vec<AdvertisedDevice> {
        self.device_list_with_health(resource, Health::Healthy, &HashMap::new())
    }

    /// Same, with an overall health verdict and per-device overrides from
    /// the exporter feed.
    pub fn device_list_with_health(
        &self,
        resource: &str,
        overall: Health,
        per_device: &HashMap<String, Health>,
    ) -> Vec<AdvertisedDevice> {
        self.inventory
            .devices()
            .iter()
            .filter(|d| {
                if self.inventory.is_homogeneous() {
                    true
                } else {
                    d.resource_tag().as_deref() == Some(resource)
                }
            })
            .map(|d| AdvertisedDevice {
                id: d.id.clone(),
                health: per_device.get(&d.id).copied().unwrap_or(overall),
                numa_nodes: vec![d.numa_node],
            })
            .collect()
    }

    /// Topology-aware preferred allocation for one container request.
    pub fn preferred_allocation(
        &self,
        available: &[String],
        required: &[String],
        size: usize,
    ) -> Result<Vec<String>, AllocError> {
        if !self.allocator_ready {
            return Err(AllocError::NotInitialized);
        }
        self.policy.allocate(available, required, size)
    }

    /// Mounts for a container-mode allocation: the single node-wide
    /// /dev/kfd plus each device's DRM nodes.
    pub fn container_allocate(&self, ids: &[String]) -> AllocateResponse {
        let mut resp = AllocateResponse::default();
        resp.devices.push(DeviceSpec::same_path("/dev/kfd", "rw"));

        for id in ids {
            info!("allocating device {}", id);
            let dev = match self.inventory.get(id) {
                Some(d) => d,
                None => {
                    warn!("allocation request names unknown device {}", id);
                    continue;
                }
            };
            resp.devices
                .push(DeviceSpec::same_path(format!("/dev/dri/card{}", dev.card), "rw"));
            resp.devices
                .push(DeviceSpec::same_path(format!("/dev/dri/renderD{}", dev.render_d), "rw"));
        }
        resp
    }
}

/// Mounts and env for a passthrough allocation. `groups` maps an IOMMU
/// group id to the PCI addresses it carries (VFs in vf mode, PFs in pf
/// mode). Each requested group mounts its /dev/vfio node; the shared
/// /dev/vfio/vfio container rides along, and the launcher learns the PCI
/// addresses through one env var per resource.
pub fn vfio_allocate(
    groups: &HashMap<String, Vec<String>>,
    resource: &str,
    ids: &[String],
) -> Result<AllocateResponse> {
    let mut resp = AllocateResponse::default();
    let mut addresses = Vec::new();

    for id in ids {
        let members = match groups.get(id) {
            Some(m) => m,
            None => bail!("device {} not found", id),
        };
        resp.devices
            .push(DeviceSpec::same_path(format!("/dev/vfio/{}", id), "mrw"));
        resp.devices
            .push(DeviceSpec::same_path("/dev/vfio/vfio", "mrw"));
        addresses.extend(members.iter().cloned());
    }

    let env_name = format!(
        "{}_{}",
        passthrough::PCI_GPU_PREFIX,
        resource.to_uppercase()
    );
    resp.envs.insert(env_name, addresses.join(","));
    Ok(resp)
}

/// Overall plus per-device health for the container mode. The exporter
/// feed wins when it answers; otherwise the topology probe decides for
/// every device at once.
pub fn evaluate_health(
    snap: &Snapshot,
    client: &HealthClient,
) -> (Health, HashMap<String, Health>) {
    let overall = Health::from_bool(topology::simple_health_check(&snap.paths.kfd_root));
    match client.gpu_health() {
        Ok(map) => (overall, map),
        Err(e) => {
            info!("health exporter unavailable, using topology probe: {}", e);
            (overall, HashMap::new())
        }
    }
}

/// Advertise the device lists, then wait on either a heartbeat tick (health
/// re-evaluation) or a replacement snapshot (re-advertise everything) until
/// shutdown. The snapshot swap is the only state change; each published
/// snapshot stays immutable.
pub fn serve(
    mut snap: Arc<Snapshot>,
    heartbeat: &Receiver<()>,
    refresh: &Receiver<Arc<Snapshot>>,
    shutdown: &AtomicBool,
    client: &HealthClient,
    sink: &mut dyn DeviceSink,
) -> Result<()> {
    for resource in &snap.resources {
        sink.advertise(resource, &snap.device_list(resource))?;
    }

    // A closed channel (disabled heartbeat, dropped refresh sender) must
    // not end the loop; only shutdown does. A closed heartbeat is parked
    // on a never-ready receiver so the loop keeps its poll cadence.
    let mut heartbeat = heartbeat.clone();

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        if let Ok(next) = refresh.try_recv() {
            snap = next;
            info!("inventory refreshed, re-advertising {:?}", snap.resources);
            for resource in &snap.resources {
                sink.advertise(resource, &snap.device_list(resource))?;
            }
            continue;
        }

        match heartbeat.recv_timeout(SHUTDOWN_POLL) {
            Ok(()) => {
                let (overall, per_device) = evaluate_health(&snap, client);
                for resource in &snap.resources {
                    let list = snap.device_list_with_health(resource, overall, &per_device);
                    sink.advertise(resource, &list)?;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => heartbeat = crossbeam::channel::never(),
        }
    }

    info!("serve loop exiting");
    Ok(())
}

/// Serve loop for the passthrough modes: IOMMU groups are the devices and
/// health is simply whether the backing driver is still loaded.
pub fn serve_passthrough(
    resource: &str,
    group_ids: &[String],
    driver_path: &Path,
    heartbeat: &Receiver<()>,
    shutdown: &AtomicBool,
    sink: &mut dyn DeviceSink,
) -> Result<()> {
    let list = |health: Health| -> Vec<AdvertisedDevice> {
        group_ids
            .iter()
            .map(|id| AdvertisedDevice {
                id: id.clone(),
                health,
                numa_nodes: Vec::new(),
            })
            .collect()
    };

    sink.advertise(resource, &list(Health::Healthy))?;

    let mut heartbeat = heartbeat.clone();
    loop {
        match heartbeat.recv_timeout(SHUTDOWN_POLL) {
            Ok(()) => {
                let health = Health::from_bool(driver_path.exists());
                sink.advertise(resource, &list(health))?;
            }
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
            }
            // disabled heartbeat: keep serving, only shutdown ends the loop
            Err(RecvTimeoutError::Disconnected) => heartbeat = crossbeam::channel::never(),
        }
    }

    info!("passthrough serve loop exiting");
    Ok(())
}
