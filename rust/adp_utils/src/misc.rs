// Copyright (c) Advanced Micro Devices, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::path::Path;
use std::str::FromStr;

use anyhow::bail;
use anyhow::Result;

/// Read a whole sysfs attribute and parse its trimmed contents.
pub fn read_from_file<T: FromStr, P: AsRef<Path>>(path: P) -> Result<T> {
    let path = path.as_ref();
    let val = match std::fs::read_to_string(path) {
        Ok(val) => val,
        Err(_) => {
            bail!("Failed to open or read file {:?}", path);
        }
    };

    match val.trim().parse::<T>() {
        Ok(parsed) => Ok(parsed),
        Err(_) => {
            bail!("Failed to parse {:?} content {:?}", path, val.trim());
        }
    }
}

/// Read a sysfs attribute as a trimmed, lower-cased string. Sysfs values
/// such as `current_compute_partition` are reported upper-case by the
/// driver but compared lower-case everywhere else.
pub fn read_file_lowercase<P: AsRef<Path>>(path: P) -> Result<String> {
    let val = std::fs::read_to_string(path.as_ref())?;
    Ok(val.trim().to_lowercase())
}

/// Resolve the basename of a symlink target, e.g. the driver bound to a PCI
/// device or the iommu_group a device belongs to.
pub fn read_link_basename<P: AsRef<Path>>(path: P) -> Result<String> {
    let target = std::fs::read_link(path.as_ref())?;
    match target.file_name() {
        Some(name) => Ok(name.to_string_lossy().into_owned()),
        None => bail!("symlink {:?} has no basename", path.as_ref()),
    }
}
