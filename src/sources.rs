//! Non-interactive driver disk entry points
//!
//! Source strings from kickstart files and the boot command line, explicit
//! devices and partitions, disks found by filesystem label and the boot-time
//! sequence that ties them together.

use crate::acquisition::load_driver_disks;
use crate::context::LoaderContext;
use crate::devices::DeviceClass;
use crate::disk::InstalledDisk;
use crate::error::{DriverDiskError, Result};
use crate::mount::{ensure_unmounted, release_scratch};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{error, info, warn};

/// Where a driver disk image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverDiskSource {
    /// `nfs:[options:]host:/path/file`
    Nfs(String),
    /// `ftp://...`, `http://...`, `https://...`
    Url(String),
    /// `cdrom`: ask interactively
    Cdrom,
    /// `path:/local/image`
    Path(PathBuf),
}

impl DriverDiskSource {
    pub fn parse(source: &str) -> Result<Self> {
        if let Some(location) = source.strip_prefix("nfs:") {
            Ok(Self::Nfs(location.to_string()))
        } else if source.starts_with("ftp://") || source.starts_with("http") {
            Ok(Self::Url(source.to_string()))
        } else if source.starts_with("cdrom") {
            Ok(Self::Cdrom)
        } else if let Some(path) = source.strip_prefix("path:") {
            Ok(Self::Path(PathBuf::from(path)))
        } else {
            Err(DriverDiskError::UnknownSource(source.to_string()))
        }
    }
}

impl FromStr for DriverDiskSource {
    type Err = DriverDiskError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Result of loading from a partition, with the loader's numeric codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionLoad {
    Loaded,
    MountFailed,
    Invalid,
    InstallBack,
}

impl PartitionLoad {
    pub fn code(self) -> i32 {
        match self {
            PartitionLoad::Loaded => 0,
            PartitionLoad::MountFailed => -1,
            PartitionLoad::Invalid => -2,
            PartitionLoad::InstallBack => -3,
        }
    }
}

/// Log a failed load unless it must stop the process.
fn non_fatal<T>(result: Result<T>, what: &str) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            error!("{}: {}", what, e);
            Ok(())
        }
    }
}

/// Verify and install the disk mounted at `dir`, then let updated drivers
/// bind.
pub fn load_from_location(ctx: &mut LoaderContext, dir: &Path) -> Result<InstalledDisk> {
    let descriptor = ctx.verifier.verify(dir).inspect_err(|_| {
        error!("not a valid driver disk");
    })?;
    let installed = ctx.install(descriptor);
    ctx.refresh_drivers();
    installed
}

/// Load the disk named by a kickstart-style source string.
pub fn load_from_source(ctx: &mut LoaderContext, source: &str) -> Result<()> {
    let parsed = match DriverDiskSource::parse(source) {
        Ok(parsed) => parsed,
        Err(e) => {
            ctx.prompter.message("Kickstart Error", &e.to_string())?;
            return Err(e);
        }
    };

    let download = ctx.config.download_path.clone();
    let (image, downloaded) = match parsed {
        DriverDiskSource::Nfs(location) => {
            ctx.fetcher
                .fetch_nfs(&location, &download)
                .inspect_err(|_| error!("unable to retrieve driver disk: {}", source))?;
            (download, true)
        }
        DriverDiskSource::Url(url) => {
            ctx.fetcher
                .fetch_url(&url, &download)
                .inspect_err(|_| error!("unable to retrieve driver disk: {}", source))?;
            (download, true)
        }
        DriverDiskSource::Cdrom => return load_driver_disks(ctx, DeviceClass::Any),
        DriverDiskSource::Path(path) => (path, false),
    };

    let result = load_mounted(ctx, &image);
    if downloaded {
        if let Err(e) = fs::remove_file(&image) {
            warn!("Unable to remove {}: {}", image.display(), e);
        }
    }
    result.map(|disk| info!("Loaded driver disk {:?} from {}", disk.title, source))
}

/// Load from a block device given by name (`sdb1`) or node (`/dev/sdb1`).
pub fn load_from_device(ctx: &mut LoaderContext, device: &str) -> Result<InstalledDisk> {
    let node = device_path(ctx, device);
    load_mounted(ctx, &node).inspect_err(|e| error!("unable to load driver disk {}: {}", device, e))
}

fn device_path(ctx: &LoaderContext, device: &str) -> PathBuf {
    if device.starts_with('/') {
        PathBuf::from(device)
    } else {
        ctx.devices.device_node(device)
    }
}

/// Mount `source` at the drivers scratch mountpoint, load from it and
/// release the mountpoint again.
fn load_mounted(ctx: &mut LoaderContext, source: &Path) -> Result<InstalledDisk> {
    let drivers = ctx.config.drivers_mountpoint.clone();
    ensure_unmounted(ctx.mounter.as_ref(), &drivers)?;
    ctx.mounter.mount_readonly(source, &drivers)?;
    let result = load_from_location(ctx, &drivers);
    release_scratch(ctx.mounter.as_ref(), &drivers);
    result
}

/// Load the driver disk on partition `device`.
///
/// Only a stuck scratch mountpoint is returned as an error; everything else
/// is reported through the [`PartitionLoad`] variant. An install that fails
/// for reasons other than the media going away still counts as loaded.
pub fn load_from_partition(ctx: &mut LoaderContext, device: &str) -> Result<PartitionLoad> {
    let drivers = ctx.config.drivers_mountpoint.clone();
    let node = device_path(ctx, device);
    ensure_unmounted(ctx.mounter.as_ref(), &drivers)?;

    info!("trying to mount {}", device);
    if let Err(e) = ctx.mounter.mount_readonly(&node, &drivers) {
        error!("Failed to mount driver disk: {}", e);
        return Ok(PartitionLoad::MountFailed);
    }

    let descriptor = match ctx.verifier.verify(&drivers) {
        Ok(descriptor) => descriptor,
        Err(_) => {
            error!(
                "Driver disk is invalid for this release of {}.",
                ctx.product.name
            );
            release_scratch(ctx.mounter.as_ref(), &drivers);
            return Ok(PartitionLoad::Invalid);
        }
    };

    let result = ctx.install(descriptor);
    release_scratch(ctx.mounter.as_ref(), &drivers);
    match result {
        Ok(_) => Ok(PartitionLoad::Loaded),
        Err(e) if e.is_back_signal() => Ok(PartitionLoad::InstallBack),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            error!("Driver disk on {} not fully installed: {}", device, e);
            Ok(PartitionLoad::Loaded)
        }
    }
}

/// Load every disk carrying the configured filesystem label. Interactive
/// sessions ask before each one. Returns the number loaded.
pub fn load_labelled_disks(ctx: &mut LoaderContext, interactive: bool) -> Result<usize> {
    info!("Trying to detect vendor driver discs");
    let label = ctx.config.disk_label.clone();
    let devices = ctx.devices.devices_with_label(&label).unwrap_or_else(|e| {
        error!("Cannot look up devices labelled {}: {}", label, e);
        Vec::new()
    });

    let mut loaded = 0;
    for device in devices {
        if interactive {
            let text = format!(
                "Driver disc was detected in {}. Do you want to use it?",
                device
            );
            if !ctx
                .prompter
                .confirm("Driver disc detected", &text, "Use it", "Skip it")?
            {
                info!("Skipping driver disk {}.", device);
                continue;
            }
        }

        match load_from_partition(ctx, &device)? {
            PartitionLoad::Loaded => {
                info!("Automatic driver disk loader succeeded for {}.", device);
                ctx.refresh_drivers();
                loaded += 1;
            }
            other => error!(
                "Automatic driver disk loader failed for {} ({}).",
                device,
                other.code()
            ),
        }
    }
    Ok(loaded)
}

/// Driver disk options from the kernel command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootOptions {
    /// Bare `dd` / `driverdisk`: ask for disks interactively
    pub interactive: bool,
    /// `dd=<source>`; the last one wins
    pub source: Option<String>,
    /// `dlabel=on|off`
    pub labelled: Option<bool>,
}

impl BootOptions {
    pub fn from_cmdline(cmdline: &str) -> Self {
        let mut options = Self::default();
        for arg in cmdline.split_whitespace() {
            let (key, value) = match arg.split_once('=') {
                Some((key, value)) => (key, Some(value)),
                None => (arg, None),
            };
            if key.eq_ignore_ascii_case("dd") || key.eq_ignore_ascii_case("driverdisk") {
                match value {
                    Some(source) => options.source = Some(source.to_string()),
                    None => options.interactive = true,
                }
            } else if key.eq_ignore_ascii_case("dlabel") {
                match value {
                    Some(v) if v.eq_ignore_ascii_case("on") => options.labelled = Some(true),
                    Some(v) if v.eq_ignore_ascii_case("off") => options.labelled = Some(false),
                    _ => {}
                }
            }
        }
        options
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| DriverDiskError::io_at(path, e))?;
        Ok(Self::from_cmdline(&content))
    }
}

/// One `driverdisk` kickstart command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KickstartDriverDisk {
    Source(String),
    Partition(String),
    /// BIOS disk reference such as `82p2`
    BiosPart(String),
}

impl KickstartDriverDisk {
    /// `driverdisk` commands in a kickstart file, in order.
    pub fn parse(content: &str) -> Vec<Self> {
        content.lines().filter_map(Self::parse_line).collect()
    }

    pub fn parse_file(path: &Path) -> Result<Vec<Self>> {
        let content = fs::read_to_string(path).map_err(|e| DriverDiskError::io_at(path, e))?;
        Ok(Self::parse(&content))
    }

    fn parse_line(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        if words.next()? != "driverdisk" {
            return None;
        }

        let (mut source, mut partition, mut biospart) = (None, None, None);
        while let Some(word) = words.next() {
            let (option, inline) = match word.split_once('=') {
                Some((option, value)) => (option, Some(value.to_string())),
                None => (word, None),
            };
            let mut value = || inline.clone().or_else(|| words.next().map(str::to_string));
            match option {
                "--source" => source = value(),
                "--biospart" => biospart = value(),
                "--type" => {
                    value();
                }
                opt if opt.starts_with("--") => warn!("Ignoring driverdisk option {}", opt),
                _ => partition = Some(word.to_string()),
            }
        }

        // Same precedence as the loader: source, then partition, then BIOS disk
        let entry = source
            .map(Self::Source)
            .or(partition.map(Self::Partition))
            .or(biospart.map(Self::BiosPart));
        if entry.is_none() {
            warn!("driverdisk command without a disk: {:?}", line.trim());
        }
        entry
    }
}

/// Load every kickstart driver disk; failures are logged.
pub fn load_kickstart_disks(ctx: &mut LoaderContext, disks: &[KickstartDriverDisk]) -> Result<()> {
    for disk in disks {
        match disk {
            KickstartDriverDisk::Source(source) => {
                non_fatal(load_from_source(ctx, source), source)?;
            }
            KickstartDriverDisk::Partition(device) => {
                non_fatal(load_from_device(ctx, device), device)?;
            }
            KickstartDriverDisk::BiosPart(part) => {
                warn!("BIOS disk lookup is not supported, ignoring --biospart={}", part);
            }
        }
    }
    Ok(())
}

/// Everything the loader does with driver disks at boot, in order:
/// labelled disks, the interactive loop, the built-in image, `dd=<source>`.
pub fn boot_sequence(ctx: &mut LoaderContext, options: &BootOptions, interactive: bool) -> Result<()> {
    if options.labelled.unwrap_or(ctx.config.detect_labelled_disks) {
        let loaded = load_labelled_disks(ctx, interactive)?;
        info!("{} labelled driver disk(s) loaded", loaded);
    }

    if options.interactive {
        load_driver_disks(ctx, DeviceClass::Any)?;
    }

    let boot_image = ctx.config.boot_image.clone();
    if fs::metadata(&boot_image).is_ok() {
        info!("found {}, loading drivers", boot_image.display());
        let source = format!("path:{}", boot_image.display());
        non_fatal(load_from_source(ctx, &source), &source)?;
    }

    if let Some(source) = &options.source {
        non_fatal(load_from_source(ctx, source), source)?;
    }
    Ok(())
}
