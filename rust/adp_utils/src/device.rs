// Copyright (c) Advanced Micro Devices, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Device inventory
//!
//! Merges two sysfs scans into one flat collection of allocatable devices:
//!
//! * PCI parents under the amdgpu driver directory, one entry per physical
//!   GPU (or per SR-IOV function exposed to this host).
//! * Platform children (`amdgpu_xcp_*`), the extra DRM devices a partitioned
//!   GPU exposes for its compute/memory slices.
//!
//! Both kinds resolve through the KFD render-minor tables so that every
//! device ends up with a KFD node id and a parent grouping key. Entries that
//! cannot be resolved are dropped; discovery prefers a partial inventory
//! over none.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use glob::glob;
use log::info;
use log::warn;
use serde::Deserialize;
use serde::Serialize;

use crate::misc::read_file_lowercase;
use crate::misc::read_from_file;
use crate::topology;

/// PCI entries of the amdgpu driver, e.g. `.../pci:amdgpu/0000:19:00.0`.
pub const AMDGPU_PCI_ROOT: &str = "/sys/module/amdgpu/drivers/pci:amdgpu";

/// Parent directory of the partition platform devices.
pub const PLATFORM_ROOT: &str = "/sys/devices/platform";

/// Platform children carry this id prefix; everything else is a PCI parent.
pub const PARTITION_ID_PREFIX: &str = "amdgpu_xcp_";

/// Sysfs locations discovery reads from. Overridable for tests and for
/// hosts with a relocated sysfs.
#[derive(Debug, Clone)]
pub struct SysfsPaths {
    pub amdgpu_pci_root: PathBuf,
    pub platform_root: PathBuf,
    pub kfd_root: PathBuf,
}

impl Default for SysfsPaths {
    fn default() -> Self {
        Self {
            amdgpu_pci_root: PathBuf::from(AMDGPU_PCI_ROOT),
            platform_root: PathBuf::from(PLATFORM_ROOT),
            kfd_root: PathBuf::from(topology::KFD_ROOT),
        }
    }
}

/// Whether a device is a whole GPU or one of its partitions. Decided once,
/// at discovery, from the id prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    Parent,
    Partition,
}

/// One logical allocatable unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// PCI address for whole GPUs, platform child name for partitions.
    pub id: String,
    /// KFD `unique_id`, shared between a GPU and its partitions.
    pub parent_key: String,
    pub kind: DeviceKind,
    /// DRM card index under /dev/dri.
    pub card: u32,
    /// DRM render minor under /dev/dri.
    pub render_d: u32,
    /// KFD topology node index.
    pub node_id: u32,
    /// Host NUMA node; -1 would mean unknown but such entries are dropped
    /// during discovery.
    pub numa_node: i64,
    /// Current compute partition style, lower-case, empty when the hardware
    /// does not support partitioning.
    pub compute_partition: String,
    /// Current memory partition style, same conventions.
    pub memory_partition: String,
}

impl Device {
    /// `<compute>_<memory>` tag used for mixed resource naming. `None`
    /// unless both partition styles are known.
    pub fn resource_tag(&self) -> Option<String> {
        if self.compute_partition.is_empty() || self.memory_partition.is_empty() {
            return None;
        }
        Some(format!("{}_{}", self.compute_partition, self.memory_partition))
    }
}

/// The discovered device collection. Ordered by discovery, unique by id,
/// with an id lookup table on the side.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceInventory {
    devices: Vec<Device>,
    #[serde(skip)]
    by_id: HashMap<String, usize>,
}

impl DeviceInventory {
    pub fn new(devices: Vec<Device>) -> Self {
        let by_id = devices
            .iter()
            .enumerate()
            .map(|(i, d)| (d.id.clone(), i))
            .collect();
        Self { devices, by_id }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn get(&self, id: &str) -> Option<&Device> {
        self.by_id.get(id).map(|&i| &self.devices[i])
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Rebuild the id table after deserializing.
    pub fn reindex(&mut self) {
        self.by_id = self
            .devices
            .iter()
            .enumerate()
            .map(|(i, d)| (d.id.clone(), i))
            .collect();
    }

    fn push(&mut self, dev: Device) {
        if let Some(&i) = self.by_id.get(&dev.id) {
            self.devices[i] = dev;
            return;
        }
        self.by_id.insert(dev.id.clone(), self.devices.len());
        self.devices.push(dev);
    }

    /// Count devices per `<compute>_<memory>` tag. Devices with either tag
    /// empty are not counted.
    pub fn unique_partition_config_count(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for dev in &self.devices {
            if let Some(tag) = dev.resource_tag() {
                *counts.entry(tag).or_insert(0) += 1;
            }
        }
        counts
    }

    /// A node is homogeneous when at most one partition style is present.
    pub fn is_homogeneous(&self) -> bool {
        self.unique_partition_config_count().len() <= 1
    }

    /// Scan sysfs and build the inventory.
    pub fn discover(paths: &SysfsPaths) -> Result<Self> {
        let render_keys = topology::render_minor_to_parent_key(&paths.kfd_root)
            .context("reading KFD render-minor table")?;
        let render_nodes = topology::render_minor_to_node_id(&paths.kfd_root)
            .context("reading KFD node-id table")?;

        let mut inv = DeviceInventory::default();

        for path in pci_parent_paths(&paths.amdgpu_pci_root) {
            match read_pci_parent(&path, &render_keys, &render_nodes) {
                Some(dev) => inv.push(dev),
                None => continue,
            }
        }

        let pattern = paths
            .platform_root
            .join(format!("{}*", PARTITION_ID_PREFIX))
            .to_string_lossy()
            .into_owned();
        for path in glob(&pattern).into_iter().flatten().filter_map(Result::ok) {
            if let Some(dev) = read_platform_child(&path, &render_keys, &render_nodes, &inv) {
                inv.push(dev);
            }
        }

        info!("discovered {} devices", inv.len());
        Ok(inv)
    }
}

/// PCI entries look like `0000:19:00.0`; match on the four-hex-digit domain.
fn pci_parent_paths(pci_root: &Path) -> Vec<PathBuf> {
    let pattern = pci_root
        .join("[0-9a-fA-F][0-9a-fA-F][0-9a-fA-F][0-9a-fA-F]:*")
        .to_string_lossy()
        .into_owned();
    match glob(&pattern) {
        Ok(paths) => paths.filter_map(Result::ok).collect(),
        Err(e) => {
            warn!("glob error under {:?}: {}", pci_root, e);
            Vec::new()
        }
    }
}

/// Locate the `cardN` and `renderDN` entries under a device's `drm/`.
fn drm_indices(dev_path: &Path) -> (Option<u32>, Option<u32>) {
    let mut card = None;
    let mut render_d = None;

    let pattern = dev_path.join("drm/*").to_string_lossy().into_owned();
    for entry in glob(&pattern).into_iter().flatten().filter_map(Result::ok) {
        let name = match entry.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_string(),
            None => continue,
        };
        if let Some(rest) = name.strip_prefix("renderD") {
            render_d = rest.parse().ok();
        } else if let Some(rest) = name.strip_prefix("card") {
            card = rest.parse().ok();
        }
    }
    (card, render_d)
}

fn read_pci_parent(
    path: &Path,
    render_keys: &HashMap<u32, String>,
    render_nodes: &HashMap<u32, u32>,
) -> Option<Device> {
    let id = path.file_name()?.to_string_lossy().into_owned();

    // Empty partition tags are fine: the hardware predates partitioning.
    let compute_partition = read_file_lowercase(path.join("current_compute_partition"))
        .map_err(|e| warn!("{}: no current_compute_partition: {}", id, e))
        .unwrap_or_default();
    let memory_partition = read_file_lowercase(path.join("current_memory_partition"))
        .map_err(|e| warn!("{}: no current_memory_partition: {}", id, e))
        .unwrap_or_default();

    let numa_node: i64 = match read_from_file(path.join("numa_node")) {
        Ok(v) => v,
        Err(e) => {
            warn!("{}: dropping, unreadable numa_node: {}", id, e);
            return None;
        }
    };

    let (card, render_d) = drm_indices(path);
    let (card, render_d) = match (card, render_d) {
        (Some(c), Some(r)) => (c, r),
        _ => {
            warn!("{}: dropping, no drm card/renderD entries", id);
            return None;
        }
    };

    let parent_key = match render_keys.get(&render_d) {
        Some(key) => key.clone(),
        None => {
            warn!("{}: dropping, render minor {} not in KFD topology", id, render_d);
            return None;
        }
    };
    let node_id = match render_nodes.get(&render_d) {
        Some(&n) => n,
        None => {
            warn!("{}: dropping, no KFD node for render minor {}", id, render_d);
            return None;
        }
    };

    Some(Device {
        id,
        parent_key,
        kind: DeviceKind::Parent,
        card,
        render_d,
        node_id,
        numa_node,
        compute_partition,
        memory_partition,
    })
}

fn read_platform_child(
    path: &Path,
    render_keys: &HashMap<u32, String>,
    render_nodes: &HashMap<u32, u32>,
    inv: &DeviceInventory,
) -> Option<Device> {
    let id = path.file_name()?.to_string_lossy().into_owned();

    let (card, render_d) = drm_indices(path);
    let (card, render_d) = match (card, render_d) {
        (Some(c), Some(r)) => (c, r),
        _ => {
            warn!("{}: dropping, no drm card/renderD entries", id);
            return None;
        }
    };

    // Some visible platform entries are phantoms; only render minors known
    // to KFD are real partitions.
    let parent_key = match render_keys.get(&render_d) {
        Some(key) => key.clone(),
        None => {
            warn!("{}: dropping, render minor {} not in KFD topology", id, render_d);
            return None;
        }
    };
    let node_id = match render_nodes.get(&render_d) {
        Some(&n) => n,
        None => {
            warn!("{}: dropping, no KFD node for render minor {}", id, render_d);
            return None;
        }
    };

    // Partition tags and NUMA placement are not exposed on the platform
    // device; inherit them from the PCI parent sharing the unique id.
    let parent = inv
        .devices()
        .iter()
        .find(|d| d.parent_key == parent_key && d.resource_tag().is_some());
    let parent = match parent {
        Some(p) => p,
        None => {
            warn!("{}: dropping, no parent with partition tags for key {}", id, parent_key);
            return None;
        }
    };
    if parent.numa_node < 0 {
        warn!("{}: dropping, parent {} has unknown NUMA node", id, parent.id);
        return None;
    }

    Some(Device {
        id,
        parent_key,
        kind: DeviceKind::Partition,
        card,
        render_d,
        node_id,
        numa_node: parent.numa_node,
        compute_partition: parent.compute_partition.clone(),
        memory_partition: parent.memory_partition.clone(),
    })
}

/// True when any sampled PCI parent exposes `available_compute_partition`.
pub fn is_compute_partition_supported(paths: &SysfsPaths) -> bool {
    pci_parent_paths(&paths.amdgpu_pci_root)
        .iter()
        .any(|p| p.join("available_compute_partition").exists())
}

/// True when any sampled PCI parent exposes `available_memory_partition`.
pub fn is_memory_partition_supported(paths: &SysfsPaths) -> bool {
    pci_parent_paths(&paths.amdgpu_pci_root)
        .iter()
        .any(|p| p.join("available_memory_partition").exists())
}
