// Copyright (c) Advanced Micro Devices, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Maps an inventory to the advertised resource names. Under the `single`
//! strategy every device is a `gpu`; under `mixed` each partition style gets
//! its own name so differently partitioned dies can be requested
//! separately.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::device::DeviceInventory;

/// Resource name advertised for whole GPUs and unpartitioned hardware.
pub const DEVICE_TYPE_GPU: &str = "gpu";

/// Resource name for PF passthrough devices under the mixed strategy.
pub const DEVICE_TYPE_GPU_PF: &str = "gpu_pf";

/// Vendor namespace all resource names are advertised under.
pub const RESOURCE_NAMESPACE: &str = "amd.com";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error(
        "partitions of different styles across GPUs are not supported with the \
         single strategy, restart the device plugin with the mixed strategy"
    )]
    HeterogeneousSingle,

    #[error("unknown resource naming strategy {0:?}, expected \"single\" or \"mixed\"")]
    UnknownStrategy(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamingStrategy {
    #[default]
    Single,
    Mixed,
}

impl FromStr for NamingStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(Self::Single),
            "mixed" => Ok(Self::Mixed),
            other => Err(ConfigError::UnknownStrategy(other.to_string())),
        }
    }
}

impl fmt::Display for NamingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single => write!(f, "single"),
            Self::Mixed => write!(f, "mixed"),
        }
    }
}

impl NamingStrategy {
    /// Resource names to advertise for `inventory`. A heterogeneous node
    /// cannot start under `single`; the caller aborts startup on the error.
    pub fn resource_names(&self, inventory: &DeviceInventory) -> Result<Vec<String>, ConfigError> {
        if inventory.is_empty() {
            return Ok(Vec::new());
        }

        let partition_counts = inventory.unique_partition_config_count();

        if inventory.is_homogeneous() {
            return Ok(match self {
                Self::Single => vec![DEVICE_TYPE_GPU.to_string()],
                Self::Mixed => {
                    if partition_counts.is_empty() {
                        // partitioning unsupported: report plain gpus
                        // regardless of strategy
                        vec![DEVICE_TYPE_GPU.to_string()]
                    } else {
                        partition_counts.into_keys().collect()
                    }
                }
            });
        }

        match self {
            Self::Single => Err(ConfigError::HeterogeneousSingle),
            Self::Mixed => {
                let mut names: Vec<String> = partition_counts
                    .into_iter()
                    .filter(|(_, count)| *count > 0)
                    .map(|(tag, _)| tag)
                    .collect();
                names.sort();
                Ok(names)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceKind};

    fn dev(id: &str, c: &str, m: &str) -> Device {
        Device {
            id: id.into(),
            parent_key: id.into(),
            kind: DeviceKind::Parent,
            card: 0,
            render_d: 128,
            node_id: 1,
            numa_node: 0,
            compute_partition: c.into(),
            memory_partition: m.into(),
        }
    }

    #[test]
    fn strategy_from_str() {
        assert_eq!("single".parse::<NamingStrategy>().unwrap(), NamingStrategy::Single);
        assert_eq!("mixed".parse::<NamingStrategy>().unwrap(), NamingStrategy::Mixed);
        assert!(matches!(
            "both".parse::<NamingStrategy>(),
            Err(ConfigError::UnknownStrategy(_))
        ));
    }

    #[test]
    fn empty_inventory_yields_no_resources() {
        let inv = DeviceInventory::default();
        assert!(NamingStrategy::Single.resource_names(&inv).unwrap().is_empty());
        assert!(NamingStrategy::Mixed.resource_names(&inv).unwrap().is_empty());
    }

    #[test]
    fn unpartitioned_hardware_is_gpu_either_way() {
        let inv = DeviceInventory::new(vec![dev("a", "", ""), dev("b", "", "")]);
        assert_eq!(NamingStrategy::Single.resource_names(&inv).unwrap(), vec!["gpu"]);
        assert_eq!(NamingStrategy::Mixed.resource_names(&inv).unwrap(), vec!["gpu"]);
    }

    #[test]
    fn homogeneous_partitioned() {
        let inv = DeviceInventory::new(vec![dev("a", "cpx", "nps4"), dev("b", "cpx", "nps4")]);
        assert_eq!(NamingStrategy::Single.resource_names(&inv).unwrap(), vec!["gpu"]);
        assert_eq!(
            NamingStrategy::Mixed.resource_names(&inv).unwrap(),
            vec!["cpx_nps4"]
        );
    }

    #[test]
    fn heterogeneous_single_is_fatal() {
        let inv = DeviceInventory::new(vec![dev("a", "spx", "nps1"), dev("b", "cpx", "nps4")]);
        assert_eq!(
            NamingStrategy::Single.resource_names(&inv).unwrap_err(),
            ConfigError::HeterogeneousSingle
        );
    }

    #[test]
    fn heterogeneous_mixed_reports_each_tag() {
        let inv = DeviceInventory::new(vec![
            dev("a", "spx", "nps1"),
            dev("b", "cpx", "nps4"),
            dev("c", "cpx", "nps4"),
        ]);
        assert_eq!(
            NamingStrategy::Mixed.resource_names(&inv).unwrap(),
            vec!["cpx_nps4", "spx_nps1"]
        );
    }
}
