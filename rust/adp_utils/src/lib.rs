// Copyright (c) Advanced Micro Devices, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Utility collection for the AMD GPU device plugin
//!
//! The device plugin daemon advertises AMD GPUs (whole dies or their
//! compute/memory partitions) to a node agent and answers preferred
//! allocation queries with topology awareness. This crate is the daemon's
//! core, layered leaves-first:
//!
//! * [`topology`] reads the KFD sysfs tree: per-node properties and the
//!   io/p2p link tables.
//! * [`device`] reconciles the PCI and platform scans into one inventory of
//!   allocatable devices.
//! * [`affinity`] weighs every linked pair of inventoried nodes; lower
//!   weight means closer.
//! * [`groups`] buckets the inventory by parent GPU.
//! * [`allocator`] picks the cheapest subset of a requested size from an
//!   available pool.
//! * [`naming`] maps the inventory onto advertised resource names.
//! * [`health`] talks to the metrics-exporter health feed.
//! * [`passthrough`] discovers VF/PF IOMMU groups for the virtualised
//!   modes.
//!
//! Everything here is synchronous and stateless between calls; the daemon
//! assembles the pieces into an immutable snapshot and republishes it on
//! refresh.

pub mod misc;

pub mod topology;

mod device;
pub use device::is_compute_partition_supported;
pub use device::is_memory_partition_supported;
pub use device::Device;
pub use device::DeviceInventory;
pub use device::DeviceKind;
pub use device::SysfsPaths;
pub use device::PARTITION_ID_PREFIX;

mod affinity;
pub use affinity::pair_weight;
pub use affinity::AffinityError;
pub use affinity::AffinityGraph;

mod groups;
pub use groups::group_by_parent;
pub use groups::PartitionGroup;

mod allocator;
pub use allocator::AllocError;
pub use allocator::BestEffortPolicy;
pub use allocator::Policy;

mod naming;
pub use naming::ConfigError;
pub use naming::NamingStrategy;
pub use naming::DEVICE_TYPE_GPU;
pub use naming::DEVICE_TYPE_GPU_PF;
pub use naming::RESOURCE_NAMESPACE;

mod health;
pub use health::Health;
pub use health::HealthClient;
pub use health::HEALTH_QUERY_TIMEOUT;
pub use health::HEALTH_SOCKET;

pub mod passthrough;
