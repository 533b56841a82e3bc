// Copyright (c) Advanced Micro Devices, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # KFD topology reader
//!
//! The amdgpu KFD driver exposes the compute topology as a directory tree,
//! one subdirectory per node under `<root>/topology/nodes/<n>/`. Each node
//! carries a line-oriented `properties` file (`name value` pairs) plus
//! `io_links/` and `p2p_links/` subtrees describing connectivity.
//!
//! A node may represent a CPU package or a GPU/partition; only nodes with a
//! positive `drm_render_minor` are GPUs. The `unique_id` property is shared
//! between a GPU and all of its partitions, which makes it the grouping key
//! for everything downstream.
//!
//! The reader holds no state and caches nothing; callers re-read the tree
//! whenever they need a fresh view.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::path::Path;
use std::path::PathBuf;

use glob::glob;
use lazy_static::lazy_static;
use log::warn;
use regex::Regex;
use thiserror::Error;

/// Default sysfs root of the KFD topology tree.
pub const KFD_ROOT: &str = "/sys/class/kfd/kfd";

lazy_static! {
    pub static ref DRM_RENDER_MINOR_RE: Regex = Regex::new(r"drm_render_minor\s(\d+)").unwrap();
    pub static ref UNIQUE_ID_RE: Regex = Regex::new(r"unique_id\s(\d+)").unwrap();
    pub static ref SIMD_COUNT_RE: Regex = Regex::new(r"simd_count\s(\d+)").unwrap();
    pub static ref CPU_CORES_COUNT_RE: Regex = Regex::new(r"cpu_cores_count\s(\d+)").unwrap();
    pub static ref GFX_TARGET_VERSION_RE: Regex = Regex::new(r"gfx_target_version\s(\d+)").unwrap();
}

#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("I/O error reading topology: {0}")]
    Io(#[from] std::io::Error),

    #[error("topology property not found, regex: {0}")]
    PropertyNotFound(String),

    #[error("unable to parse topology property: {0}")]
    Parse(String),
}

/// A GPU vertex of the KFD topology graph.
#[derive(Debug, Clone)]
pub struct GpuNode {
    /// KFD node index, taken from the directory name.
    pub node_id: u32,
    /// The node directory, parent of `properties`, `io_links` and
    /// `p2p_links`.
    pub dir: PathBuf,
}

impl GpuNode {
    pub fn properties_path(&self) -> PathBuf {
        self.dir.join("properties")
    }
}

fn parse_prop_int(raw: &str) -> Result<i64, TopologyError> {
    let parsed = if let Some(hex) = raw.strip_prefix("0x") {
        i64::from_str_radix(hex, 16)
    } else {
        raw.parse::<i64>()
    };
    parsed.map_err(|_| TopologyError::Parse(raw.to_string()))
}

/// Scan a `properties` file for the first line matching `re` and return the
/// capture group parsed as an integer.
pub fn parse_node_property<P: AsRef<Path>>(path: P, re: &Regex) -> Result<i64, TopologyError> {
    let raw = parse_node_property_string(path, re)?;
    parse_prop_int(&raw)
}

/// Same as [`parse_node_property`] but returns the raw capture.
pub fn parse_node_property_string<P: AsRef<Path>>(
    path: P,
    re: &Regex,
) -> Result<String, TopologyError> {
    let f = File::open(path.as_ref())?;
    let reader = BufReader::new(f);
    for line in reader.lines() {
        let line = line?;
        if let Some(caps) = re.captures(&line) {
            return Ok(caps[1].to_string());
        }
    }
    Err(TopologyError::PropertyNotFound(re.to_string()))
}

/// Enumerate the GPU nodes under `<root>/topology/nodes/`. Nodes whose
/// `drm_render_minor` is zero or negative are CPU packages and are filtered
/// out, as are nodes with unreadable properties.
pub fn gpu_nodes<P: AsRef<Path>>(kfd_root: P) -> Result<Vec<GpuNode>, TopologyError> {
    let pattern = kfd_root
        .as_ref()
        .join("topology/nodes/[0-9]*")
        .to_string_lossy()
        .into_owned();
    let paths = glob(&pattern).map_err(|e| TopologyError::Parse(e.to_string()))?;

    let mut nodes = Vec::new();
    for dir in paths.filter_map(Result::ok) {
        let node_id: u32 = match dir.file_name().and_then(|n| n.to_str()) {
            Some(name) => match name.parse() {
                Ok(id) => id,
                Err(_) => continue,
            },
            None => continue,
        };

        match parse_node_property(dir.join("properties"), &DRM_RENDER_MINOR_RE) {
            Ok(v) if v > 0 => nodes.push(GpuNode { node_id, dir }),
            Ok(_) => {}
            Err(e) => {
                warn!("skipping topology node {}: {}", node_id, e);
            }
        }
    }
    nodes.sort_by_key(|n| n.node_id);
    Ok(nodes)
}

/// Build the render-minor to `unique_id` table. The unique id is identical
/// for a GPU and all of its partitions, so it later serves as the parent
/// grouping key. Nodes without a `unique_id` (some integrated parts) are
/// left out; devices resolving to them are rejected at inventory time.
pub fn render_minor_to_parent_key<P: AsRef<Path>>(
    kfd_root: P,
) -> Result<HashMap<u32, String>, TopologyError> {
    let mut map = HashMap::new();
    for node in gpu_nodes(kfd_root)? {
        let props = node.properties_path();
        let minor = match parse_node_property(&props, &DRM_RENDER_MINOR_RE) {
            Ok(v) => v as u32,
            Err(e) => {
                warn!("skipping {:?}: {}", props, e);
                continue;
            }
        };
        match parse_node_property_string(&props, &UNIQUE_ID_RE) {
            Ok(uid) => {
                map.insert(minor, uid);
            }
            Err(e) => warn!("node {} has no unique_id: {}", node.node_id, e),
        }
    }
    Ok(map)
}

/// Build the render-minor to KFD node id table.
pub fn render_minor_to_node_id<P: AsRef<Path>>(
    kfd_root: P,
) -> Result<HashMap<u32, u32>, TopologyError> {
    let mut map = HashMap::new();
    for node in gpu_nodes(kfd_root)? {
        match parse_node_property(node.properties_path(), &DRM_RENDER_MINOR_RE) {
            Ok(minor) => {
                map.insert(minor as u32, node.node_id);
            }
            Err(e) => warn!("skipping node {}: {}", node.node_id, e),
        }
    }
    Ok(map)
}

/// Count GPU devices by their `simd_count`. CPU packages report zero SIMDs.
pub fn count_gpu_nodes<P: AsRef<Path>>(kfd_root: P) -> usize {
    let pattern = kfd_root
        .as_ref()
        .join("topology/nodes/*/properties")
        .to_string_lossy()
        .into_owned();
    let paths = match glob(&pattern) {
        Ok(p) => p,
        Err(e) => {
            warn!("glob error: {}", e);
            return 0;
        }
    };

    paths
        .filter_map(Result::ok)
        .filter(|p| matches!(parse_node_property(p, &SIMD_COUNT_RE), Ok(v) if v > 0))
        .count()
}

/// Coarse node-level health probe: the KFD tree is considered healthy when
/// any node looks like a live GPU (no CPU cores, positive gfx target).
/// Used as the fallback when the metrics-exporter feed is unreachable.
pub fn simple_health_check<P: AsRef<Path>>(kfd_root: P) -> bool {
    let pattern = kfd_root
        .as_ref()
        .join("topology/nodes/*/properties")
        .to_string_lossy()
        .into_owned();
    let paths = match glob(&pattern) {
        Ok(p) => p,
        Err(e) => {
            warn!("glob error: {}", e);
            return false;
        }
    };

    for props in paths.filter_map(Result::ok) {
        let cpu_cores = parse_node_property(&props, &CPU_CORES_COUNT_RE).unwrap_or(0);
        let gfx_ver = parse_node_property(&props, &GFX_TARGET_VERSION_RE).unwrap_or(0);
        if cpu_cores == 0 && gfx_ver > 0 {
            return true;
        }
    }

    warn!("no GPU nodes found via topology properties");
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_node(root: &Path, id: u32, props: &str) {
        let dir = root.join(format!("topology/nodes/{}", id));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("properties"), props).unwrap();
    }

    #[test]
    fn property_int_and_string() {
        let tmp = tempfile::tempdir().unwrap();
        write_node(
            tmp.path(),
            1,
            "cpu_cores_count 0\nsimd_count 304\ndrm_render_minor 128\nunique_id 9217160085217199745\ngfx_target_version 90402\n",
        );
        let props = tmp.path().join("topology/nodes/1/properties");

        assert_eq!(parse_node_property(&props, &DRM_RENDER_MINOR_RE).unwrap(), 128);
        assert_eq!(
            parse_node_property_string(&props, &UNIQUE_ID_RE).unwrap(),
            "9217160085217199745"
        );
    }

    #[test]
    fn property_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        write_node(tmp.path(), 1, "cpu_cores_count 96\n");
        let props = tmp.path().join("topology/nodes/1/properties");
        assert!(matches!(
            parse_node_property(&props, &DRM_RENDER_MINOR_RE),
            Err(TopologyError::PropertyNotFound(_))
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        assert!(matches!(
            parse_node_property("/nonexistent/properties", &DRM_RENDER_MINOR_RE),
            Err(TopologyError::Io(_))
        ));
    }

    #[test]
    fn cpu_nodes_filtered_out() {
        let tmp = tempfile::tempdir().unwrap();
        write_node(tmp.path(), 0, "cpu_cores_count 96\ndrm_render_minor 0\n");
        write_node(tmp.path(), 1, "cpu_cores_count 0\ndrm_render_minor 128\nsimd_count 304\n");
        write_node(tmp.path(), 2, "cpu_cores_count 0\ndrm_render_minor 129\nsimd_count 304\n");

        let nodes = gpu_nodes(tmp.path()).unwrap();
        let ids: Vec<u32> = nodes.iter().map(|n| n.node_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(count_gpu_nodes(tmp.path()), 2);
    }

    #[test]
    fn render_minor_maps() {
        let tmp = tempfile::tempdir().unwrap();
        write_node(tmp.path(), 0, "cpu_cores_count 96\ndrm_render_minor 0\n");
        write_node(tmp.path(), 3, "drm_render_minor 128\nunique_id 111\n");
        write_node(tmp.path(), 4, "drm_render_minor 129\nunique_id 222\n");
        // a GPU node without unique_id stays out of the parent-key map
        write_node(tmp.path(), 5, "drm_render_minor 130\n");

        let keys = render_minor_to_parent_key(tmp.path()).unwrap();
        assert_eq!(keys.get(&128).map(String::as_str), Some("111"));
        assert_eq!(keys.get(&129).map(String::as_str), Some("222"));
        assert!(!keys.contains_key(&130));

        let nodes = render_minor_to_node_id(tmp.path()).unwrap();
        assert_eq!(nodes.get(&128), Some(&3));
        assert_eq!(nodes.get(&129), Some(&4));
        assert_eq!(nodes.get(&130), Some(&5));
    }

    #[test]
    fn simple_health_needs_a_gpu_node() {
        let tmp = tempfile::tempdir().unwrap();
        write_node(tmp.path(), 0, "cpu_cores_count 96\ngfx_target_version 0\n");
        assert!(!simple_health_check(tmp.path()));

        write_node(tmp.path(), 1, "cpu_cores_count 0\ngfx_target_version 90402\n");
        assert!(simple_health_check(tmp.path()));
    }
}
