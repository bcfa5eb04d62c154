//! Driver disk verification and installation
//!
//! A mounted tree becomes a [`DriverDiskDescriptor`] only through
//! [`Verifier::verify`]; [`Installer::install`] consumes the descriptor, so
//! packages are never unpacked from a tree that was not checked first.
//!
//! Installing disk `N` copies its packages to `<staging>-N`, unpacks driver
//! payloads into the shared `<staging>/lib/{modules,firmware}` tree and links
//! that tree into the system module directory.

use crate::config::{LoaderConfig, ProductIdentity};
use crate::copy::{CopyObserver, copy_tree};
use crate::error::{DriverDiskError, Result};
use crate::modules::{FirmwareSearch, ModuleDatabase};
use crate::unpack::extract_packages_from;
use nix::unistd::{AccessFlags, access};
use std::ffi::OsString;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Staging paths derived from the staging root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingLayout {
    root: PathBuf,
}

impl StagingLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>-<sequence>`: private copy of one disk's packages.
    pub fn package_copy_dir(&self, sequence: u32) -> PathBuf {
        let mut name = OsString::from(self.root.as_os_str());
        name.push(format!("-{}", sequence));
        PathBuf::from(name)
    }

    pub fn modules_dir(&self) -> PathBuf {
        self.root.join("lib/modules")
    }

    pub fn firmware_dir(&self) -> PathBuf {
        self.root.join("lib/firmware")
    }
}

/// Sequence number of the next install attempt.
///
/// Owned by whoever drives installs and passed to [`Installer::install`],
/// which advances it once per attempt whatever the outcome.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiskCounter {
    next: u32,
}

impl DiskCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u32 {
        self.next
    }

    pub fn advance(&mut self) -> u32 {
        let used = self.next;
        self.next += 1;
        used
    }
}

/// A mounted tree that passed verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverDiskDescriptor {
    root: PathBuf,
    title: String,
    package_dir: PathBuf,
}

impl DriverDiskDescriptor {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// `rpms/<arch>` below the root
    pub fn package_dir(&self) -> &Path {
        &self.package_dir
    }
}

/// Disk title from marker file content, minus exactly one trailing newline.
pub fn parse_title(content: &[u8]) -> String {
    let content = content.strip_suffix(b"\n").unwrap_or(content);
    String::from_utf8_lossy(content).into_owned()
}

/// Checks that a mounted tree is a driver disk for this product.
#[derive(Debug, Clone)]
pub struct Verifier {
    marker_file: String,
    package_index: String,
    arch: String,
}

impl Verifier {
    pub fn new(
        marker_file: impl Into<String>,
        package_index: impl Into<String>,
        arch: impl Into<String>,
    ) -> Self {
        Self {
            marker_file: marker_file.into(),
            package_index: package_index.into(),
            arch: arch.into(),
        }
    }

    pub fn from_config(config: &LoaderConfig, product: &ProductIdentity) -> Self {
        Self::new(&config.marker_file, &config.package_index, &product.arch)
    }

    pub fn verify(&self, mountpoint: &Path) -> Result<DriverDiskDescriptor> {
        let marker = mountpoint.join(&self.marker_file);
        let content = fs::read(&marker).map_err(|e| {
            error!("can't find driver disk identifier {}: {}", marker.display(), e);
            DriverDiskError::invalid_disk(format!("{} is not readable", marker.display()))
        })?;
        if content.is_empty() {
            error!("driver disk identifier {} is empty", marker.display());
            return Err(DriverDiskError::invalid_disk(format!(
                "{} is empty",
                marker.display()
            )));
        }

        let package_dir = mountpoint.join("rpms").join(&self.arch);
        let index = package_dir.join(&self.package_index);
        if let Err(errno) = access(&index, AccessFlags::R_OK) {
            error!("cannot find {}, bad driver disk: {}", index.display(), errno);
            return Err(DriverDiskError::invalid_disk(format!(
                "{} is not readable",
                index.display()
            )));
        }

        let descriptor = DriverDiskDescriptor {
            root: mountpoint.to_path_buf(),
            title: parse_title(&content),
            package_dir,
        };
        debug!("verified driver disk {:?}", descriptor.title);
        Ok(descriptor)
    }
}

/// What an install produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledDisk {
    pub sequence: u32,
    pub title: String,
    pub package_copy: PathBuf,
    pub extracted_files: usize,
}

/// Copy warnings go to the log; errors are reported by the returned error.
struct LogObserver;

impl CopyObserver for LogObserver {
    fn warning(&mut self, message: &str) {
        warn!("{}", message);
    }

    fn error(&mut self, message: &str) {
        error!("{}", message);
    }
}

/// Installs verified driver disks into the staging tree.
pub struct Installer {
    layout: StagingLayout,
    modules_root: PathBuf,
    kernel_version: String,
    database: Box<dyn ModuleDatabase>,
    firmware: Box<dyn FirmwareSearch>,
}

impl Installer {
    pub fn new(
        layout: StagingLayout,
        modules_root: impl Into<PathBuf>,
        kernel_version: impl Into<String>,
        database: Box<dyn ModuleDatabase>,
        firmware: Box<dyn FirmwareSearch>,
    ) -> Self {
        Self {
            layout,
            modules_root: modules_root.into(),
            kernel_version: kernel_version.into(),
            database,
            firmware,
        }
    }

    pub fn layout(&self) -> &StagingLayout {
        &self.layout
    }

    pub fn kernel_version(&self) -> &str {
        &self.kernel_version
    }

    /// `<modules_root>/<kver>/updates/DD`
    pub fn updates_link(&self) -> PathBuf {
        self.modules_root
            .join(&self.kernel_version)
            .join("updates")
            .join("DD")
    }

    /// Install `descriptor` as disk number `counter.current()`.
    ///
    /// The counter is advanced even when the install fails so that a later
    /// disk never reuses a half-written package copy.
    pub fn install(
        &mut self,
        descriptor: DriverDiskDescriptor,
        counter: &mut DiskCounter,
    ) -> Result<InstalledDisk> {
        let sequence = counter.advance();
        let result = self.install_as(descriptor, sequence);
        if let Err(e) = &result {
            error!("Driver disk #{} not installed: {}", sequence, e);
        }
        result
    }

    fn install_as(&mut self, descriptor: DriverDiskDescriptor, sequence: u32) -> Result<InstalledDisk> {
        info!(
            "Loading driver disk #{} {:?} (kernel {})",
            sequence, descriptor.title, self.kernel_version
        );
        // Media can disappear between verification and install
        if !descriptor.package_dir.is_dir() {
            return Err(DriverDiskError::invalid_disk(format!(
                "{} is gone",
                descriptor.package_dir.display()
            )));
        }

        let package_copy = self.layout.package_copy_dir(sequence);
        let modules_dir = self.layout.modules_dir();
        let firmware_dir = self.layout.firmware_dir();
        for dir in [&package_copy, &modules_dir, &firmware_dir] {
            fs::create_dir_all(dir).map_err(|source| DriverDiskError::Staging {
                path: dir.clone(),
                source,
            })?;
        }

        copy_tree(&descriptor.package_dir, &package_copy, &mut LogObserver)?;

        let report = extract_packages_from(&package_copy, self.layout.root(), &self.kernel_version)?;
        if !report.is_success() {
            return Err(DriverDiskError::Extraction { sequence });
        }

        self.link_updates(&modules_dir)?;

        if let Err(e) = self.database.refresh() {
            error!("Error refreshing module database for driver disk #{}: {}", sequence, e);
        }

        if has_entries(&firmware_dir) {
            self.firmware.add_search_dir(&firmware_dir);
            if let Err(e) = self.firmware.restart() {
                error!("Unable to restart firmware loader: {}", e);
            }
        }

        Ok(InstalledDisk {
            sequence,
            title: descriptor.title,
            package_copy,
            extracted_files: report.extracted_files(),
        })
    }

    fn link_updates(&self, modules_dir: &Path) -> Result<()> {
        let link = self.updates_link();
        let updates = link.parent().unwrap_or(&self.modules_root);
        fs::create_dir_all(updates).map_err(|source| DriverDiskError::Staging {
            path: updates.to_path_buf(),
            source,
        })?;

        match fs::read_link(&link) {
            Ok(target) if target == modules_dir => {
                debug!("{} already links to {}", link.display(), target.display());
                return Ok(());
            }
            Ok(target) => {
                warn!("replacing {} -> {}", link.display(), target.display());
                fs::remove_file(&link).map_err(|e| DriverDiskError::io_at(&link, e))?;
            }
            Err(_) => {}
        }
        symlink(modules_dir, &link).map_err(|e| DriverDiskError::io_at(&link, e))?;
        info!("Linked {} -> {}", link.display(), modules_dir.display());
        Ok(())
    }
}

fn has_entries(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}
