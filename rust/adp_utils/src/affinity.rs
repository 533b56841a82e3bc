// Copyright (c) Advanced Micro Devices, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Pairwise communication affinity
//!
//! Builds a sparse, symmetric weight table over the KFD nodes of the
//! inventory from the `io_links` and `p2p_links` tables. A pair's weight
//! sums three contributions: whether the endpoints share a parent GPU, the
//! link class between them, and whether they share a NUMA node. Lower is
//! better; the cheapest possible pair (co-located partitions on XGMI) costs
//! 30, the dearest (cross-GPU, exotic link, cross-NUMA) costs 90.

use std::collections::HashMap;
use std::collections::HashSet;

use glob::glob;
use lazy_static::lazy_static;
use log::warn;
use regex::Regex;
use thiserror::Error;

use crate::device::Device;
use crate::topology;

/// Partitions (or a GPU paired with its own partition) on the same die.
pub const SAME_PARENT_WEIGHT: u32 = 10;
/// Endpoints on different GPUs.
pub const DIFFERENT_PARENT_WEIGHT: u32 = 20;
/// Pair connected over XGMI.
pub const XGMI_LINK_WEIGHT: u32 = 10;
/// Pair connected over PCIe.
pub const PCIE_LINK_WEIGHT: u32 = 40;
/// Any other link class.
pub const OTHER_LINK_WEIGHT: u32 = 50;
/// Endpoints on the same host NUMA node.
pub const SAME_NUMA_WEIGHT: u32 = 10;
/// Endpoints on different NUMA nodes.
pub const DIFFERENT_NUMA_WEIGHT: u32 = 20;

/// KFD io link `type` values.
const XGMI_LINK_TYPE: i64 = 11;
const PCIE_LINK_TYPE: i64 = 2;

lazy_static! {
    static ref NODE_FROM_RE: Regex = Regex::new(r"node_from\s(\d+)").unwrap();
    static ref NODE_TO_RE: Regex = Regex::new(r"node_to\s(\d+)").unwrap();
    static ref LINK_TYPE_RE: Regex = Regex::new(r"type\s(\d+)").unwrap();
}

#[derive(Error, Debug)]
pub enum AffinityError {
    #[error("device list is empty, unable to calculate pair weights")]
    EmptyInventory,

    #[error("unable to scan io_links/p2p_links: {0}")]
    LinkScan(String),
}

/// Sparse symmetric weight table, canonicalised so the smaller node id
/// always keys first.
#[derive(Debug, Clone, Default)]
pub struct AffinityGraph {
    weights: HashMap<(u32, u32), u32>,
}

impl AffinityGraph {
    pub fn insert(&mut self, a: u32, b: u32, weight: u32) {
        let key = if a < b { (a, b) } else { (b, a) };
        self.weights.insert(key, weight);
    }

    /// Weight of a pair. Pairs without a topology link score 0, which
    /// biases subset selection toward disconnected nodes; kept compatible
    /// with the original behaviour pending a product decision.
    pub fn weight(&self, a: u32, b: u32) -> u32 {
        let key = if a < b { (a, b) } else { (b, a) };
        self.weights.get(&key).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Walk every GPU node's link tables and score the pairs whose both
    /// endpoints are in `devices`.
    pub fn from_topology<P: AsRef<std::path::Path>>(
        kfd_root: P,
        devices: &[Device],
    ) -> Result<Self, AffinityError> {
        if devices.is_empty() {
            return Err(AffinityError::EmptyInventory);
        }

        let by_node: HashMap<u32, &Device> = devices.iter().map(|d| (d.node_id, d)).collect();
        let live: HashSet<u32> = by_node.keys().copied().collect();

        let nodes = topology::gpu_nodes(&kfd_root)
            .map_err(|e| AffinityError::LinkScan(e.to_string()))?;

        let mut graph = AffinityGraph::default();
        for node in &nodes {
            graph.scan_node_links(&node.dir, &by_node, &live)?;
        }
        Ok(graph)
    }

    fn scan_node_links(
        &mut self,
        node_dir: &std::path::Path,
        by_node: &HashMap<u32, &Device>,
        live: &HashSet<u32>,
    ) -> Result<(), AffinityError> {
        let mut link_dirs = Vec::new();
        for table in ["io_links", "p2p_links"] {
            let pattern = node_dir
                .join(table)
                .join("[0-9]*")
                .to_string_lossy()
                .into_owned();
            let paths = glob(&pattern)
                .map_err(|e| AffinityError::LinkScan(format!("{}: {}", table, e)))?;
            link_dirs.extend(paths.filter_map(Result::ok));
        }

        for link_dir in link_dirs {
            let props = link_dir.join("properties");

            // A single malformed link entry is not fatal to the graph.
            let parsed = (
                topology::parse_node_property(&props, &NODE_FROM_RE),
                topology::parse_node_property(&props, &NODE_TO_RE),
                topology::parse_node_property(&props, &LINK_TYPE_RE),
            );
            let (from, to, link_type) = match parsed {
                (Ok(f), Ok(t), Ok(l)) => (f as u32, t as u32, l),
                _ => {
                    warn!("skipping malformed link entry {:?}", props);
                    continue;
                }
            };

            let (from, to) = if from < to { (from, to) } else { (to, from) };
            if !live.contains(&from) || !live.contains(&to) {
                continue;
            }

            let (from_dev, to_dev) = match (by_node.get(&from), by_node.get(&to)) {
                (Some(f), Some(t)) => (*f, *t),
                _ => continue,
            };
            self.insert(from, to, pair_weight(from_dev, to_dev, link_type));
        }
        Ok(())
    }
}

/// Score one ordered pair from parent identity, link class and NUMA
/// colocation.
pub fn pair_weight(from: &Device, to: &Device, link_type: i64) -> u32 {
    let mut weight = if from.parent_key == to.parent_key {
        SAME_PARENT_WEIGHT
    } else {
        DIFFERENT_PARENT_WEIGHT
    };

    weight += match link_type {
        XGMI_LINK_TYPE => XGMI_LINK_WEIGHT,
        PCIE_LINK_TYPE => PCIE_LINK_WEIGHT,
        _ => OTHER_LINK_WEIGHT,
    };

    weight += if from.numa_node == to.numa_node {
        SAME_NUMA_WEIGHT
    } else {
        DIFFERENT_NUMA_WEIGHT
    };

    weight
}
