//! Block device discovery
//!
//! Finds candidate driver disk devices, their partitions and devices carrying
//! a given filesystem label by reading sysfs, the udev database and the
//! `/dev/disk` links. Nothing here shells out.

use crate::error::{DriverDiskError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use strum::{Display, EnumString};
use tracing::{debug, warn};

/// Device classes a driver disk may be loaded for
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    #[default]
    Any,
    Network,
    Disk,
    Cdrom,
}

/// Device enumeration used by the acquisition flow.
pub trait DeviceProbe {
    /// Disks and optical drives that could hold a driver disk.
    fn candidate_devices(&self) -> Result<Vec<String>>;

    /// Partitions of `device`, by kernel name.
    fn partitions(&self, device: &str) -> Result<Vec<String>>;

    /// Number of present devices of `class`.
    fn count_devices(&self, class: DeviceClass) -> usize;

    /// Devices whose filesystem label is `label`.
    fn devices_with_label(&self, label: &str) -> Result<Vec<String>>;

    /// Device node for a kernel device name.
    fn device_node(&self, name: &str) -> PathBuf {
        Path::new("/dev").join(name)
    }
}

/// RAM disks and loop devices are never driver disk candidates.
pub fn is_candidate_device(name: &str) -> bool {
    !name.is_empty() && !name.starts_with("ram") && !name.starts_with("loop")
}

fn is_optical(name: &str) -> bool {
    name.starts_with("sr")
}

const UDEV_DATA: &str = "/run/udev/data";
const LABEL_PROPERTY: &str = "E:ID_FS_LABEL=";

/// sysfs-backed [`DeviceProbe`]
#[derive(Debug, Clone)]
pub struct SysfsDeviceProbe {
    sys_root: PathBuf,
    dev_root: PathBuf,
    udev_data: PathBuf,
}

impl Default for SysfsDeviceProbe {
    fn default() -> Self {
        Self::new("/sys", "/dev")
    }
}

impl SysfsDeviceProbe {
    pub fn new(sys_root: impl Into<PathBuf>, dev_root: impl Into<PathBuf>) -> Self {
        Self {
            sys_root: sys_root.into(),
            dev_root: dev_root.into(),
            udev_data: PathBuf::from(UDEV_DATA),
        }
    }

    /// Read udev properties from `dir` instead of `/run/udev/data`.
    pub fn with_udev_data(mut self, dir: impl Into<PathBuf>) -> Self {
        self.udev_data = dir.into();
        self
    }

    fn block_devices(&self) -> Result<Vec<String>> {
        let dir = self.sys_root.join("block");
        let mut names = dir_names(&dir)?;
        names.retain(|name| is_candidate_device(name));
        names.sort();
        Ok(names)
    }

    /// Filesystem label udev recorded for a block device or partition.
    fn udev_label(&self, name: &str) -> Option<String> {
        let dev = self.sys_root.join("class/block").join(name).join("dev");
        let numbers = fs::read_to_string(&dev).ok()?;
        let record = self.udev_data.join(format!("b{}", numbers.trim()));
        let properties = fs::read_to_string(&record).ok()?;
        properties
            .lines()
            .find_map(|line| line.strip_prefix(LABEL_PROPERTY))
            .map(str::to_string)
    }

    /// Devices with `label` according to the udev database.
    fn labelled_in_udev(&self, label: &str) -> Vec<String> {
        let dir = self.sys_root.join("class/block");
        match dir_names(&dir) {
            Ok(names) => names
                .into_iter()
                .filter(|name| self.udev_label(name).as_deref() == Some(label))
                .collect(),
            Err(e) => {
                debug!("No block class in sysfs: {}", e);
                Vec::new()
            }
        }
    }

    /// Device the `/dev/disk/by-label` link points at, if any.
    fn labelled_by_link(&self, label: &str) -> Result<Option<String>> {
        let link = self.dev_root.join("disk/by-label").join(label);
        match fs::canonicalize(&link) {
            Ok(target) => Ok(target
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                warn!("Unable to resolve {}: {}", link.display(), e);
                Err(DriverDiskError::io_at(link, e))
            }
        }
    }
}

impl DeviceProbe for SysfsDeviceProbe {
    fn candidate_devices(&self) -> Result<Vec<String>> {
        let devices = self.block_devices()?;
        debug!("candidate devices: {:?}", devices);
        Ok(devices)
    }

    fn partitions(&self, device: &str) -> Result<Vec<String>> {
        let dir = self.sys_root.join("block").join(device);
        let mut parts: Vec<String> = dir_names(&dir)?
            .into_iter()
            .filter(|name| name.starts_with(device) && dir.join(name).join("partition").exists())
            .collect();
        parts.sort();
        Ok(parts)
    }

    fn count_devices(&self, class: DeviceClass) -> usize {
        let network = || {
            dir_names(&self.sys_root.join("class/net"))
                .map(|names| names.iter().filter(|n| n.as_str() != "lo").count())
                .unwrap_or(0)
        };
        let block = |optical: bool| {
            self.block_devices()
                .map(|names| names.iter().filter(|n| is_optical(n) == optical).count())
                .unwrap_or(0)
        };
        match class {
            DeviceClass::Network => network(),
            DeviceClass::Disk => block(false),
            DeviceClass::Cdrom => block(true),
            DeviceClass::Any => network() + block(false) + block(true),
        }
    }

    /// Every labelled device udev knows about, plus the by-label link
    /// target. The link alone names only one of several equally labelled
    /// devices.
    fn devices_with_label(&self, label: &str) -> Result<Vec<String>> {
        let mut found: BTreeSet<String> = self.labelled_in_udev(label).into_iter().collect();
        if let Some(device) = self.labelled_by_link(label)? {
            found.insert(device);
        }
        debug!("devices labelled {}: {:?}", label, found);
        Ok(found.into_iter().collect())
    }

    fn device_node(&self, name: &str) -> PathBuf {
        self.dev_root.join(name)
    }
}

fn dir_names(dir: &Path) -> Result<Vec<String>> {
    let entries = fs::read_dir(dir).map_err(|e| DriverDiskError::io_at(dir, e))?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| DriverDiskError::io_at(dir, e))?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    Ok(names)
}
