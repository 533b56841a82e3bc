// Copyright (c) Advanced Micro Devices, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Daemon configuration: which driver stack serves the node and how
//! resources are named. The driver type is normally left empty and probed,
//! in which case container mode wins over the virtualised modes.

use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use log::info;
use thiserror::Error;

use adp_utils::passthrough::{GIM_DRIVER_PATH, VFIO_DRIVER_PATH};

/// Presence of this class directory means the amdgpu/KFD stack is loaded.
pub const KFD_CLASS_PATH: &str = "/sys/class/kfd";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("unknown driver type {0:?}, expected \"container\", \"vf-passthrough\" or \"pf-passthrough\"")]
    UnknownDriverType(String),

    #[error("driver for {0} mode is not loaded")]
    DriverUnavailable(DriverType),

    #[error("no usable GPU driver found on this node")]
    NoDriverFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverType {
    /// ROCm/KFD container workloads.
    Container,
    /// SR-IOV virtual functions handed to VMs.
    VfPassthrough,
    /// Whole physical functions handed to VMs.
    PfPassthrough,
}

impl FromStr for DriverType {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "container" => Ok(Self::Container),
            "vf-passthrough" => Ok(Self::VfPassthrough),
            "pf-passthrough" => Ok(Self::PfPassthrough),
            other => Err(DriverError::UnknownDriverType(other.to_string())),
        }
    }
}

impl fmt::Display for DriverType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Container => write!(f, "container"),
            Self::VfPassthrough => write!(f, "vf-passthrough"),
            Self::PfPassthrough => write!(f, "pf-passthrough"),
        }
    }
}

/// Probe locations for driver detection, overridable in tests.
#[derive(Debug, Clone)]
pub struct DriverProbePaths {
    pub kfd_class: PathBuf,
    pub gim_driver: PathBuf,
    pub vfio_driver: PathBuf,
}

impl Default for DriverProbePaths {
    fn default() -> Self {
        Self {
            kfd_class: PathBuf::from(KFD_CLASS_PATH),
            gim_driver: PathBuf::from(GIM_DRIVER_PATH),
            vfio_driver: PathBuf::from(VFIO_DRIVER_PATH),
        }
    }
}

fn probe_path(ty: DriverType, paths: &DriverProbePaths) -> &Path {
    match ty {
        DriverType::Container => &paths.kfd_class,
        DriverType::VfPassthrough => &paths.gim_driver,
        DriverType::PfPassthrough => &paths.vfio_driver,
    }
}

/// Check that the driver backing `ty` is actually loaded.
pub fn driver_available(ty: DriverType, paths: &DriverProbePaths) -> Result<(), DriverError> {
    if probe_path(ty, paths).exists() {
        Ok(())
    } else {
        Err(DriverError::DriverUnavailable(ty))
    }
}

/// Resolve the driver mode to run in. An explicit request must be
/// satisfiable; with no request the modes are tried in order.
pub fn resolve_driver_type(
    requested: Option<DriverType>,
    paths: &DriverProbePaths,
) -> Result<DriverType, DriverError> {
    if let Some(ty) = requested {
        driver_available(ty, paths)?;
        return Ok(ty);
    }

    for ty in [
        DriverType::Container,
        DriverType::VfPassthrough,
        DriverType::PfPassthrough,
    ] {
        if driver_available(ty, paths).is_ok() {
            info!("auto-selected {} driver mode", ty);
            return Ok(ty);
        }
    }
    Err(DriverError::NoDriverFound)
}
