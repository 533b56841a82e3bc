// Copyright (c) Advanced Micro Devices, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Groups inventory entries by their parent GPU. Partitions of one die
//! always form the cheapest subsets, so the allocator wants to see "fat"
//! groups first and, within a group, the parent device before its
//! partitions.

use std::collections::BTreeMap;

use crate::device::Device;
use crate::device::DeviceKind;

/// A parent GPU together with all of its partitions.
#[derive(Debug, Clone, Default)]
pub struct PartitionGroup {
    /// KFD unique id shared by the members.
    pub parent_key: String,
    /// Id of the non-partition member, when present.
    pub parent_id: Option<String>,
    /// Member KFD node ids, parent first, partitions in ascending node id
    /// order.
    pub node_ids: Vec<u32>,
    /// Member device ids, same order as `node_ids`.
    pub ids: Vec<String>,
}

impl PartitionGroup {
    pub fn len(&self) -> usize {
        self.node_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_ids.is_empty()
    }

    /// Sort key fallback for groups that somehow lack a parent entry.
    fn order_id(&self) -> &str {
        self.parent_id.as_deref().unwrap_or(&self.parent_key)
    }
}

/// Partition the inventory by parent key and order the groups fat-first,
/// ties broken by ascending parent id.
pub fn group_by_parent(devices: &[Device]) -> Vec<PartitionGroup> {
    let mut members: BTreeMap<&str, Vec<&Device>> = BTreeMap::new();
    for dev in devices {
        members.entry(&dev.parent_key).or_default().push(dev);
    }

    let mut groups: Vec<PartitionGroup> = members
        .into_iter()
        .map(|(key, mut devs)| {
            devs.sort_by_key(|d| (d.kind == DeviceKind::Partition, d.node_id));
            PartitionGroup {
                parent_key: key.to_string(),
                parent_id: devs
                    .iter()
                    .find(|d| d.kind == DeviceKind::Parent)
                    .map(|d| d.id.clone()),
                node_ids: devs.iter().map(|d| d.node_id).collect(),
                ids: devs.iter().map(|d| d.id.clone()).collect(),
            }
        })
        .collect();

    groups.sort_by(|a, b| {
        b.len()
            .cmp(&a.len())
            .then_with(|| a.order_id().cmp(b.order_id()))
    });
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(id: &str, parent_key: &str, kind: DeviceKind, node_id: u32) -> Device {
        Device {
            id: id.into(),
            parent_key: parent_key.into(),
            kind,
            card: node_id,
            render_d: 127 + node_id,
            node_id,
            numa_node: 0,
            compute_partition: "cpx".into(),
            memory_partition: "nps1".into(),
        }
    }

    #[test]
    fn every_device_in_exactly_one_group() {
        let devices = vec![
            dev("0000:19:00.0", "111", DeviceKind::Parent, 2),
            dev("amdgpu_xcp_1", "111", DeviceKind::Partition, 3),
            dev("0000:2a:00.0", "222", DeviceKind::Parent, 4),
        ];
        let groups = group_by_parent(&devices);
        let total: usize = groups.iter().map(|g| g.len()).sum();
        assert_eq!(total, devices.len());
    }

    #[test]
    fn parent_leads_its_group() {
        let devices = vec![
            dev("amdgpu_xcp_2", "111", DeviceKind::Partition, 4),
            dev("amdgpu_xcp_1", "111", DeviceKind::Partition, 3),
            dev("0000:19:00.0", "111", DeviceKind::Parent, 2),
        ];
        let groups = group_by_parent(&devices);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].parent_id.as_deref(), Some("0000:19:00.0"));
        assert_eq!(groups[0].node_ids, vec![2, 3, 4]);
        assert_eq!(groups[0].ids[0], "0000:19:00.0");
    }

    #[test]
    fn fat_groups_first_then_parent_id() {
        let devices = vec![
            dev("0000:30:00.0", "333", DeviceKind::Parent, 8),
            dev("0000:19:00.0", "111", DeviceKind::Parent, 2),
            dev("amdgpu_xcp_1", "111", DeviceKind::Partition, 3),
            dev("0000:2a:00.0", "222", DeviceKind::Parent, 5),
        ];
        let groups = group_by_parent(&devices);
        assert_eq!(groups[0].parent_key, "111");
        // singleton groups tie on size, parent id breaks the tie
        assert_eq!(groups[1].parent_id.as_deref(), Some("0000:2a:00.0"));
        assert_eq!(groups[2].parent_id.as_deref(), Some("0000:30:00.0"));
    }
}
