// Copyright (c) Advanced Micro Devices, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # SR-IOV VF and PF passthrough discovery
//!
//! In the passthrough modes the allocatable unit is an IOMMU group rather
//! than a DRM device: the kernel can only hand a whole group to a VM. PFs
//! bound to the `gim` driver host VFs meant for guests; PFs bound directly
//! to `vfio-pci` are themselves passed through. Either way the maps here
//! key by IOMMU group id and carry the PCI addresses a group resolves to.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use glob::glob;
use log::info;

use crate::misc::read_link_basename;

/// PCI device directory scanned for passthrough candidates.
pub const PCI_DEVICE_PATH: &str = "/sys/bus/pci/devices";

/// Driver directory whose presence means VF passthrough is possible.
pub const GIM_DRIVER_PATH: &str = "/sys/bus/pci/drivers/gim";

/// Driver directory whose presence means PF passthrough is possible.
pub const VFIO_DRIVER_PATH: &str = "/sys/bus/pci/drivers/vfio-pci";

/// Module directory carrying the gim version attributes.
pub const GIM_MODULE_PATH: &str = "/sys/module/gim";

pub const GIM_DRIVER_NAME: &str = "gim";
pub const VFIO_DRIVER_NAME: &str = "vfio-pci";

/// Env var prefix carrying PCI addresses into the VM launcher.
pub const PCI_GPU_PREFIX: &str = "PCI_RESOURCE_AMD_COM";

/// AMD PCI vendor id as sysfs reports it.
pub const AMD_VENDOR_ID: &str = "0x1002";

/// One VF and the PF it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfInfo {
    pub pf: String,
    pub vf: String,
    pub device_id: String,
}

/// One passthrough PF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PfInfo {
    pub pf: String,
    pub device_id: String,
}

fn is_amd_device(pci_path: &Path) -> bool {
    matches!(
        std::fs::read_to_string(pci_path.join("vendor")),
        Ok(v) if v.trim() == AMD_VENDOR_ID
    )
}

fn bound_driver(pci_path: &Path) -> Option<String> {
    read_link_basename(pci_path.join("driver")).ok()
}

/// Map IOMMU group id to the VFs it contains. A group usually holds one VF,
/// but when all of a PF's VFs share a group they are allocated to the same
/// VM together.
pub fn vf_mapping<P: AsRef<Path>>(pci_root: P) -> Result<HashMap<String, Vec<VfInfo>>> {
    let pci_root = pci_root.as_ref();
    let mut vf_map: HashMap<String, Vec<VfInfo>> = HashMap::new();

    let entries = std::fs::read_dir(pci_root)
        .with_context(|| format!("reading {:?}", pci_root))?;

    for entry in entries.filter_map(Result::ok) {
        let pci_path = entry.path();
        let pf_name = entry.file_name().to_string_lossy().into_owned();

        if !is_amd_device(&pci_path) {
            continue;
        }
        if bound_driver(&pci_path).as_deref() != Some(GIM_DRIVER_NAME) {
            continue;
        }

        // VFs appear as virtfn0, virtfn1, ... symlinks on the PF.
        let pattern = pci_path.join("virtfn*").to_string_lossy().into_owned();
        for vf_link in glob(&pattern).into_iter().flatten().filter_map(Result::ok) {
            let vf_addr = match std::fs::read_link(&vf_link) {
                Ok(target) => match target.file_name() {
                    Some(name) => name.to_string_lossy().into_owned(),
                    None => continue,
                },
                Err(_) => continue,
            };

            let vf_path = pci_root.join(&vf_addr);
            let iommu_group = match read_link_basename(vf_path.join("iommu_group")) {
                Ok(group) => group,
                Err(_) => continue,
            };
            let device_id = match std::fs::read_to_string(vf_path.join("device")) {
                Ok(id) => id.trim().to_string(),
                Err(_) => continue,
            };

            info!("mapping IOMMU group {}: PF {} -> VF {}", iommu_group, pf_name, vf_addr);
            vf_map.entry(iommu_group).or_default().push(VfInfo {
                pf: pf_name.clone(),
                vf: vf_addr,
                device_id,
            });
        }
    }
    Ok(vf_map)
}

/// Map IOMMU group id to the vfio-bound PFs it contains.
pub fn pf_mapping<P: AsRef<Path>>(pci_root: P) -> Result<HashMap<String, Vec<PfInfo>>> {
    let pci_root = pci_root.as_ref();
    let mut pf_map: HashMap<String, Vec<PfInfo>> = HashMap::new();

    let entries = std::fs::read_dir(pci_root)
        .with_context(|| format!("reading {:?}", pci_root))?;

    for entry in entries.filter_map(Result::ok) {
        let pci_path = entry.path();
        let pf_name = entry.file_name().to_string_lossy().into_owned();

        if !is_amd_device(&pci_path) {
            continue;
        }
        if bound_driver(&pci_path).as_deref() != Some(VFIO_DRIVER_NAME) {
            continue;
        }

        let iommu_group = match read_link_basename(pci_path.join("iommu_group")) {
            Ok(group) => group,
            Err(_) => continue,
        };
        let device_id = match std::fs::read_to_string(pci_path.join("device")) {
            Ok(id) => id.trim().to_string(),
            Err(_) => continue,
        };

        info!("PF {} in IOMMU group {}", pf_name, iommu_group);
        pf_map.entry(iommu_group).or_default().push(PfInfo {
            pf: pf_name,
            device_id,
        });
    }
    Ok(pf_map)
}

/// Driver and source versions of the loaded gim module. The version string
/// may carry a local `+suffix`; only the release part is reported.
pub fn gim_versions<P: AsRef<Path>>(module_root: P) -> Result<(String, String)> {
    let module_root = module_root.as_ref();
    let version = std::fs::read_to_string(module_root.join("version"))
        .with_context(|| format!("reading {:?}/version", module_root))?;
    let srcversion = std::fs::read_to_string(module_root.join("srcversion"))
        .with_context(|| format!("reading {:?}/srcversion", module_root))?;

    let mut version = version.trim().to_string();
    if let Some(idx) = version.find('+') {
        version.truncate(idx);
    }
    Ok((version, srcversion.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::symlink;

    struct FakePci {
        root: tempfile::TempDir,
    }

    impl FakePci {
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            fs::create_dir_all(root.path().join("devices")).unwrap();
            fs::create_dir_all(root.path().join("drivers/gim")).unwrap();
            fs::create_dir_all(root.path().join("drivers/vfio-pci")).unwrap();
            fs::create_dir_all(root.path().join("iommu_groups")).unwrap();
            Self { root }
        }

        fn devices(&self) -> std::path::PathBuf {
            self.root.path().join("devices")
        }

        fn add_device(&self, bdf: &str, vendor: &str, device: &str, driver: &str, group: &str) {
            let dev = self.devices().join(bdf);
            fs::create_dir_all(&dev).unwrap();
            fs::write(dev.join("vendor"), format!("{}\n", vendor)).unwrap();
            fs::write(dev.join("device"), format!("{}\n", device)).unwrap();
            symlink(self.root.path().join("drivers").join(driver), dev.join("driver")).unwrap();

            let group_dir = self.root.path().join("iommu_groups").join(group);
            let _ = fs::create_dir_all(&group_dir);
            symlink(&group_dir, dev.join("iommu_group")).unwrap();
        }

        fn add_virtfn(&self, pf: &str, idx: usize, vf: &str) {
            symlink(self.devices().join(vf), self.devices().join(pf).join(format!("virtfn{}", idx)))
                .unwrap();
        }
    }

    #[test]
    fn vf_mapping_groups_by_iommu() {
        let pci = FakePci::new();
        pci.add_device("0000:c0:00.0", "0x1002", "0x74a1", "gim", "200");
        pci.add_device("0000:c0:02.0", "0x1002", "0x74b5", "vfio-pci", "218");
        pci.add_device("0000:c0:02.1", "0x1002", "0x74b5", "vfio-pci", "230");
        pci.add_virtfn("0000:c0:00.0", 0, "0000:c0:02.0");
        pci.add_virtfn("0000:c0:00.0", 1, "0000:c0:02.1");
        // a non-AMD device bound to gim must not be picked up
        pci.add_device("0000:d0:00.0", "0x10de", "0x2330", "gim", "240");

        let map = vf_mapping(pci.devices()).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(
            map.get("218").unwrap(),
            &vec![VfInfo {
                pf: "0000:c0:00.0".into(),
                vf: "0000:c0:02.0".into(),
                device_id: "0x74b5".into(),
            }]
        );
        assert_eq!(map.get("230").unwrap()[0].vf, "0000:c0:02.1");
    }

    #[test]
    fn pf_mapping_requires_vfio_binding() {
        let pci = FakePci::new();
        pci.add_device("0000:c0:00.0", "0x1002", "0x74a1", "vfio-pci", "218");
        pci.add_device("0000:d0:00.0", "0x1002", "0x74a1", "vfio-pci", "218");
        pci.add_device("0000:e0:00.0", "0x1002", "0x74a1", "vfio-pci", "230");
        // bound to amdgpu, not passthrough
        fs::create_dir_all(pci.root.path().join("drivers/amdgpu")).unwrap();
        pci.add_device("0000:f0:00.0", "0x1002", "0x74a1", "amdgpu", "250");

        let map = pf_mapping(pci.devices()).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("218").unwrap().len(), 2);
        assert_eq!(map.get("230").unwrap().len(), 1);
        assert!(!map.contains_key("250"));
    }

    #[test]
    fn gim_version_strips_local_suffix() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("version"), "8.1.0.K+20240115\n").unwrap();
        fs::write(tmp.path().join("srcversion"), "ABCDEF123456\n").unwrap();

        let (version, src) = gim_versions(tmp.path()).unwrap();
        assert_eq!(version, "8.1.0.K");
        assert_eq!(src, "ABCDEF123456");
    }
}
