// Copyright (c) Advanced Micro Devices, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use adp_utils::topology::{
    self, DRM_RENDER_MINOR_RE, GFX_TARGET_VERSION_RE, UNIQUE_ID_RE,
};
use adp_utils::{AffinityGraph, Device, DeviceKind};

const PARSING_ROOT: &str = "testdata/topology-parsing";

#[test]
fn enumerates_gpu_nodes_only() {
    let nodes = topology::gpu_nodes(PARSING_ROOT).unwrap();
    let ids: Vec<u32> = nodes.iter().map(|n| n.node_id).collect();
    // node 0 is the CPU package
    assert_eq!(ids, vec![1, 2]);
}

#[test]
fn parses_properties_from_fixture() {
    let props = format!("{}/topology/nodes/1/properties", PARSING_ROOT);
    assert_eq!(
        topology::parse_node_property(&props, &DRM_RENDER_MINOR_RE).unwrap(),
        128
    );
    assert_eq!(
        topology::parse_node_property(&props, &GFX_TARGET_VERSION_RE).unwrap(),
        90402
    );
    assert_eq!(
        topology::parse_node_property_string(&props, &UNIQUE_ID_RE).unwrap(),
        "9217160085217199745"
    );
}

#[test]
fn render_minor_tables() {
    let keys = topology::render_minor_to_parent_key(PARSING_ROOT).unwrap();
    let nodes = topology::render_minor_to_node_id(PARSING_ROOT).unwrap();

    assert_eq!(keys.get(&128).map(String::as_str), Some("9217160085217199745"));
    assert_eq!(keys.get(&129).map(String::as_str), Some("9217160085217199746"));
    assert_eq!(nodes.get(&128), Some(&1));
    assert_eq!(nodes.get(&129), Some(&2));
}

#[test]
fn health_and_census() {
    assert!(topology::simple_health_check(PARSING_ROOT));
    assert_eq!(topology::count_gpu_nodes(PARSING_ROOT), 2);
}

#[test]
fn graph_from_fixture_links() {
    let dev = |id: &str, key: &str, node_id: u32| Device {
        id: id.into(),
        parent_key: key.into(),
        kind: DeviceKind::Parent,
        card: node_id,
        render_d: 127 + node_id,
        node_id,
        numa_node: 0,
        compute_partition: String::new(),
        memory_partition: String::new(),
    };
    let devices = vec![
        dev("0000:19:00.0", "9217160085217199745", 1),
        dev("0000:2a:00.0", "9217160085217199746", 2),
    ];

    let graph = AffinityGraph::from_topology(PARSING_ROOT, &devices).unwrap();
    assert_eq!(graph.len(), 1);
    // different parents, xgmi, same numa
    assert_eq!(graph.weight(1, 2), 40);
}
