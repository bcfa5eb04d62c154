//! Loader configuration
//!
//! All fixed paths and names the loader relies on live here so that tests and
//! unusual installer images can relocate them. Every field has a default;
//! a JSON file only needs the fields it changes.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Loader configuration that can be saved/loaded as JSON
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Product name shown in messages; read from the buildstamp when unset
    pub product_name: Option<String>,
    /// Package architecture directory (`rpms/<arch>`); buildstamp or host arch when unset
    pub product_arch: Option<String>,
    /// Installer buildstamp file
    pub buildstamp: PathBuf,

    /// Marker file at the root of every driver disk
    pub marker_file: String,
    /// Entry that must exist inside `rpms/<arch>`
    pub package_index: String,

    /// Scratch mountpoint for partitions holding image files
    pub partition_mountpoint: PathBuf,
    /// Scratch mountpoint for the driver disk itself
    pub drivers_mountpoint: PathBuf,
    /// Shared extraction root; per-disk package copies go to `<staging_dir>-<n>`
    pub staging_dir: PathBuf,
    /// System kernel module tree
    pub modules_root: PathBuf,

    /// Where network-fetched images are stored
    pub download_path: PathBuf,
    /// Image loaded automatically at boot when present
    pub boot_image: PathBuf,
    /// Filesystem label of automatically detected driver disks
    pub disk_label: String,
    pub detect_labelled_disks: bool,

    /// Skip the probe stage after installing
    pub no_probe: bool,
    /// Log destination for interactive sessions
    pub log_file: Option<PathBuf>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            product_name: None,
            product_arch: None,
            buildstamp: PathBuf::from("/.buildstamp"),
            marker_file: "rhdd3".to_string(),
            package_index: "repodata".to_string(),
            partition_mountpoint: PathBuf::from("/tmp/dpart"),
            drivers_mountpoint: PathBuf::from("/tmp/drivers"),
            staging_dir: PathBuf::from("/tmp/DD"),
            modules_root: PathBuf::from("/lib/modules"),
            download_path: PathBuf::from("/tmp/dd.img"),
            boot_image: PathBuf::from("/dd.img"),
            disk_label: "OEMDRV".to_string(),
            detect_labelled_disks: true,
            no_probe: false,
            log_file: Some(PathBuf::from("/tmp/ddloader.log")),
        }
    }
}

impl LoaderConfig {
    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;
        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;
        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        for (what, name) in [
            ("Marker file", &self.marker_file),
            ("Package index entry", &self.package_index),
            ("Disk label", &self.disk_label),
        ] {
            if name.trim().is_empty() {
                anyhow::bail!("{} must be specified", what);
            }
            if name.contains('/') {
                anyhow::bail!("{} must be a plain name, got {:?}", what, name);
            }
        }

        for (what, path) in [
            ("Partition mountpoint", &self.partition_mountpoint),
            ("Drivers mountpoint", &self.drivers_mountpoint),
            ("Staging directory", &self.staging_dir),
            ("Modules root", &self.modules_root),
            ("Download path", &self.download_path),
        ] {
            if !path.is_absolute() {
                anyhow::bail!("{} must be an absolute path, got {:?}", what, path);
            }
        }

        if self.partition_mountpoint == self.drivers_mountpoint {
            anyhow::bail!("Partition and drivers mountpoints must differ");
        }
        if self.staging_dir == self.partition_mountpoint
            || self.staging_dir == self.drivers_mountpoint
        {
            anyhow::bail!("Staging directory cannot be a scratch mountpoint");
        }

        if let Some(arch) = &self.product_arch {
            if arch.trim().is_empty() || arch.contains('/') {
                anyhow::bail!("Product architecture {:?} is not a valid directory name", arch);
            }
        }

        Ok(())
    }

    /// Resolve product name and architecture.
    pub fn product(&self) -> ProductIdentity {
        let stamp = fs::read_to_string(&self.buildstamp)
            .ok()
            .map(|content| BuildStamp::parse(&content))
            .unwrap_or_default();
        debug!("buildstamp: {:?}", stamp);

        ProductIdentity {
            name: self
                .product_name
                .clone()
                .or(stamp.product)
                .unwrap_or_else(|| "Linux".to_string()),
            arch: self
                .product_arch
                .clone()
                .or(stamp.arch)
                .unwrap_or_else(|| std::env::consts::ARCH.to_string()),
        }
    }
}

/// Name and package architecture of the product being installed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductIdentity {
    pub name: String,
    pub arch: String,
}

/// Fields of an installer buildstamp: `<stamp>.<arch>` on line one, product
/// name on line two.
#[derive(Debug, Default, PartialEq, Eq)]
struct BuildStamp {
    arch: Option<String>,
    product: Option<String>,
}

impl BuildStamp {
    fn parse(content: &str) -> Self {
        let mut lines = content.lines();
        let arch = lines
            .next()
            .and_then(|line| line.trim().rsplit_once('.'))
            .map(|(_, arch)| arch.to_string())
            .filter(|arch| !arch.is_empty());
        let product = lines
            .next()
            .map(|line| line.trim().to_string())
            .filter(|name| !name.is_empty());
        Self { arch, product }
    }
}
