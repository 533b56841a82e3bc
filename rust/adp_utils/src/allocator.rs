// Copyright (c) Advanced Micro Devices, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Best-effort subset allocator
//!
//! Given an available pool, a must-include subset and a target size, returns
//! the subset of exactly that size with the lowest aggregate pairwise
//! weight. Exhaustive enumeration is `C(n, m)` and explodes on partitioned
//! hardware (a node with 64 partitions asked for 8 would visit billions of
//! subsets), so candidates are generated from partition-group prefixes
//! instead: co-located partitions are always the cheapest pairs, and groups
//! are visited fat-first, so the earliest candidates are already close to
//! optimal.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::path::Path;

use log::info;
use thiserror::Error;

use crate::affinity::AffinityError;
use crate::affinity::AffinityGraph;
use crate::device::Device;
use crate::groups::group_by_parent;
use crate::groups::PartitionGroup;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("allocation size must be a positive integer")]
    InvalidSize,

    #[error("available device count is less than the allocation size")]
    InsufficientAvailable,

    #[error("must-include device count exceeds the allocation size")]
    RequiredTooLarge,

    #[error("no candidate subset found with matching criteria")]
    NoCandidate,

    #[error("allocator must be initialised before allocating")]
    NotInitialized,
}

/// The allocation seam the serving path calls through.
pub trait Policy: Send + Sync {
    fn allocate(
        &self,
        available: &[String],
        required: &[String],
        size: usize,
    ) -> Result<Vec<String>, AllocError>;
}

/// A partial candidate during enumeration.
#[derive(Debug, Clone)]
struct Subset {
    node_ids: Vec<u32>,
    weight: u32,
    last_group_idx: usize,
}

impl Subset {
    fn new(group_idx: usize) -> Self {
        Self {
            node_ids: Vec::new(),
            weight: 0,
            last_group_idx: group_idx,
        }
    }

    /// Append a node, charging its pairwise weight against every member
    /// already in the subset.
    fn push(&mut self, node: u32, weights: &AffinityGraph) {
        for &other in &self.node_ids {
            self.weight += weights.weight(other, node);
        }
        self.node_ids.push(node);
    }
}

#[derive(Default)]
pub struct BestEffortPolicy {
    devices: HashMap<String, Device>,
    groups: Vec<PartitionGroup>,
    weights: AffinityGraph,
}

impl BestEffortPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialise from an inventory and a prebuilt affinity graph.
    pub fn init(&mut self, devices: Vec<Device>, weights: AffinityGraph) {
        self.groups = group_by_parent(&devices);
        self.devices = devices.into_iter().map(|d| (d.id.clone(), d)).collect();
        self.weights = weights;
    }

    /// Initialise by reading the link tables under `kfd_root`.
    pub fn init_from_topology<P: AsRef<Path>>(
        &mut self,
        devices: Vec<Device>,
        kfd_root: P,
    ) -> Result<(), AffinityError> {
        let weights = AffinityGraph::from_topology(kfd_root, &devices)?;
        self.init(devices, weights);
        Ok(())
    }

    fn node_id(&self, id: &str) -> Option<u32> {
        self.devices.get(id).map(|d| d.node_id)
    }

    /// Restrict the sorted groups to nodes still in the candidate pool and
    /// re-establish the fat-first order on what remains.
    fn filtered_groups(&self, pool: &HashSet<u32>) -> Vec<Vec<u32>> {
        let mut filtered: Vec<(&PartitionGroup, Vec<u32>)> = self
            .groups
            .iter()
            .map(|g| {
                let nodes: Vec<u32> = g
                    .node_ids
                    .iter()
                    .copied()
                    .filter(|n| pool.contains(n))
                    .collect();
                (g, nodes)
            })
            .filter(|(_, nodes)| !nodes.is_empty())
            .collect();

        filtered.sort_by(|(ga, na), (gb, nb)| {
            nb.len().cmp(&na.len()).then_with(|| {
                let ia = ga.parent_id.as_deref().unwrap_or(&ga.parent_key);
                let ib = gb.parent_id.as_deref().unwrap_or(&gb.parent_key);
                ia.cmp(ib)
            })
        });
        filtered.into_iter().map(|(_, nodes)| nodes).collect()
    }
}

impl Policy for BestEffortPolicy {
    fn allocate(
        &self,
        available: &[String],
        required: &[String],
        size: usize,
    ) -> Result<Vec<String>, AllocError> {
        if size == 0 {
            return Err(AllocError::InvalidSize);
        }
        if available.len() < size {
            return Err(AllocError::InsufficientAvailable);
        }
        if required.len() > size {
            return Err(AllocError::RequiredTooLarge);
        }
        let available_set: HashSet<&str> = available.iter().map(String::as_str).collect();
        if !required.iter().all(|r| available_set.contains(r.as_str())) {
            return Err(AllocError::NoCandidate);
        }
        if self.devices.is_empty() {
            return Err(AllocError::NotInitialized);
        }

        if available.len() == size {
            return Ok(available.to_vec());
        }
        if required.len() == size {
            return Ok(required.to_vec());
        }

        if self.weights.is_empty() {
            return Err(AllocError::NotInitialized);
        }

        let required_nodes: Vec<u32> = required
            .iter()
            .map(|id| self.node_id(id).ok_or(AllocError::NoCandidate))
            .collect::<Result<_, _>>()?;
        let required_set: HashSet<u32> = required_nodes.iter().copied().collect();

        // Enumeration pool: available minus required; ids the allocator has
        // never seen cannot be scored and are left out.
        let pool: HashSet<u32> = available
            .iter()
            .filter_map(|id| self.node_id(id))
            .filter(|n| !required_set.contains(n))
            .collect();
        let want = size - required.len();

        let best = enumerate_best(
            &self.filtered_groups(&pool),
            &required_nodes,
            want,
            &self.weights,
        )
        .ok_or(AllocError::NoCandidate)?;

        // Translate the enumerated nodes back to device ids; required ids
        // ride along verbatim.
        let node_to_id: HashMap<u32, &str> = available
            .iter()
            .filter_map(|id| self.node_id(id).map(|n| (n, id.as_str())))
            .collect();
        let mut out: Vec<String> = best.node_ids[..want]
            .iter()
            .map(|n| node_to_id[n].to_string())
            .collect();
        out.extend(required.iter().cloned());

        info!("best device subset: {:?} score: {}", out, best.weight);
        Ok(out)
    }
}

/// Walk group prefixes and report the cheapest candidate of exactly `want`
/// enumerated nodes (plus the required tail). Within one group the nodes
/// are taken in order; a group that runs dry hands its partial over to
/// every later group in turn. The first candidate at the minimum weight
/// wins, which together with the group ordering makes the result
/// deterministic.
fn enumerate_best(
    groups: &[Vec<u32>],
    required_nodes: &[u32],
    want: usize,
    weights: &AffinityGraph,
) -> Option<Subset> {
    let mut best: Option<Subset> = None;
    let mut queue: VecDeque<Subset> = VecDeque::new();

    let mut consider = |mut candidate: Subset, best: &mut Option<Subset>| {
        for &node in required_nodes {
            candidate.push(node, weights);
        }
        match best {
            Some(b) if candidate.weight >= b.weight => {}
            _ => *best = Some(candidate),
        }
    };

    for (gi, group) in groups.iter().enumerate() {
        let mut sub = Subset::new(gi);
        for &node in group {
            sub.push(node, weights);
            if sub.node_ids.len() == want {
                break;
            }
        }
        if sub.node_ids.len() == want {
            consider(sub, &mut best);
        } else {
            queue.push_back(sub);
        }
    }

    while let Some(sub) = queue.pop_front() {
        for gj in (sub.last_group_idx + 1)..groups.len() {
            let mut ext = sub.clone();
            ext.last_group_idx = gj;
            for &node in &groups[gj] {
                ext.push(node, weights);
                if ext.node_ids.len() == want {
                    break;
                }
            }
            if ext.node_ids.len() == want {
                consider(ext, &mut best);
            } else {
                queue.push_back(ext);
            }
        }
    }

    best
}
