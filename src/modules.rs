//! Kernel module and firmware plumbing
//!
//! Everything that touches the running kernel after files have been staged:
//! the module dependency database, firmware search path, module state
//! snapshots used to notice newly bound drivers, and manual module loading.

use crate::command::run_command;
use crate::devices::DeviceClass;
use crate::error::{DriverDiskError, Result};
use crate::prompt::Prompter;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Release of the running kernel, or `"unknown"` if uname fails.
pub fn running_kernel_version() -> String {
    match nix::sys::utsname::uname() {
        Ok(uts) => uts.release().to_string_lossy().into_owned(),
        Err(e) => {
            warn!("uname failed: {}", e);
            "unknown".to_string()
        }
    }
}

/// Module dependency database that must be rebuilt after new modules appear.
pub trait ModuleDatabase {
    fn refresh(&self) -> Result<()>;
}

/// `depmod -a`
#[derive(Debug, Default, Clone)]
pub struct Depmod;

impl ModuleDatabase for Depmod {
    fn refresh(&self) -> Result<()> {
        run_command("depmod", &["-a"])?.check("depmod -a")?;
        Ok(())
    }
}

/// Firmware loader search path.
pub trait FirmwareSearch {
    fn add_search_dir(&mut self, dir: &Path);
    /// Apply the search directories to the running loader.
    fn restart(&mut self) -> Result<()>;
}

/// Kernel firmware loader configured through the `firmware_class.path`
/// parameter. The kernel accepts a single custom directory; the most recent
/// one wins.
#[derive(Debug, Clone)]
pub struct FirmwareClassPath {
    parameter: PathBuf,
    dirs: Vec<PathBuf>,
}

impl Default for FirmwareClassPath {
    fn default() -> Self {
        Self::new("/sys/module/firmware_class/parameters/path")
    }
}

impl FirmwareClassPath {
    pub fn new(parameter: impl Into<PathBuf>) -> Self {
        Self {
            parameter: parameter.into(),
            dirs: Vec::new(),
        }
    }

    pub fn search_dirs(&self) -> &[PathBuf] {
        &self.dirs
    }
}

impl FirmwareSearch for FirmwareClassPath {
    fn add_search_dir(&mut self, dir: &Path) {
        if !self.dirs.iter().any(|d| d == dir) {
            self.dirs.push(dir.to_path_buf());
        }
    }

    fn restart(&mut self) -> Result<()> {
        let Some(dir) = self.dirs.last() else {
            return Ok(());
        };
        if self.dirs.len() > 1 {
            debug!("firmware_class.path takes one directory, using {}", dir.display());
        }
        fs::write(&self.parameter, dir.as_os_str().as_encoded_bytes())
            .map_err(|e| DriverDiskError::io_at(&self.parameter, e))?;
        info!("Firmware search path set to {}", dir.display());
        Ok(())
    }
}

/// Loaded module name to version (srcversion when present).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleSnapshot(pub BTreeMap<String, String>);

impl ModuleSnapshot {
    /// Modules new in `after` or whose version changed.
    pub fn updated_in(&self, after: &ModuleSnapshot) -> Vec<String> {
        after
            .0
            .iter()
            .filter(|(name, version)| self.0.get(*name) != Some(*version))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// True when `after` shows a module that was absent or different in `before`.
pub fn detect_update(before: &ModuleSnapshot, after: &ModuleSnapshot) -> bool {
    !before.updated_in(after).is_empty()
}

/// Module loading subsystem driven around an install.
pub trait ModuleSubsystem {
    fn snapshot(&self) -> Result<ModuleSnapshot>;
    /// Return loaded modules to the state saved at start-up so updated
    /// drivers can bind on the next probe.
    fn restore_state(&mut self) -> Result<()>;
    /// Ask the bus drivers to announce devices again and wait for it.
    fn bus_probe(&mut self) -> Result<()>;
}

/// [`ModuleSubsystem`] over `/proc/modules`, `/sys/module`, modprobe and udevadm
#[derive(Debug, Clone)]
pub struct KernelModules {
    proc_modules: PathBuf,
    sys_module: PathBuf,
    saved: BTreeSet<String>,
}

impl KernelModules {
    /// Capture the currently loaded modules as the state to restore to.
    pub fn save_state() -> Self {
        Self::with_paths("/proc/modules", "/sys/module")
    }

    pub fn with_paths(proc_modules: impl Into<PathBuf>, sys_module: impl Into<PathBuf>) -> Self {
        let proc_modules = proc_modules.into();
        let saved = loaded_modules(&proc_modules).unwrap_or_else(|e| {
            warn!("Unable to save module state: {}", e);
            BTreeSet::new()
        });
        debug!("saved module state: {} module(s)", saved.len());
        Self {
            proc_modules,
            sys_module: sys_module.into(),
            saved,
        }
    }

    pub fn saved(&self) -> &BTreeSet<String> {
        &self.saved
    }
}

impl ModuleSubsystem for KernelModules {
    fn snapshot(&self) -> Result<ModuleSnapshot> {
        let entries = fs::read_dir(&self.sys_module)
            .map_err(|e| DriverDiskError::io_at(&self.sys_module, e))?;
        let mut modules = BTreeMap::new();
        for entry in entries.flatten() {
            let dir = entry.path();
            let version = ["srcversion", "version"]
                .iter()
                .find_map(|attr| fs::read_to_string(dir.join(attr)).ok())
                .map(|v| v.trim().to_string())
                .unwrap_or_default();
            modules.insert(entry.file_name().to_string_lossy().into_owned(), version);
        }
        Ok(ModuleSnapshot(modules))
    }

    fn restore_state(&mut self) -> Result<()> {
        let loaded = loaded_modules(&self.proc_modules)?;
        for module in loaded.difference(&self.saved) {
            let out = run_command("modprobe", &["-r", module.as_str()])?;
            if !out.success {
                debug!("{} stays loaded: {}", module, out.stderr.trim());
            }
        }
        Ok(())
    }

    fn bus_probe(&mut self) -> Result<()> {
        run_command("udevadm", &["trigger", "--action=add"])?.check("udevadm trigger")?;
        run_command("udevadm", &["settle"])?.check("udevadm settle")?;
        Ok(())
    }
}

fn loaded_modules(proc_modules: &Path) -> Result<BTreeSet<String>> {
    let content =
        fs::read_to_string(proc_modules).map_err(|e| DriverDiskError::io_at(proc_modules, e))?;
    Ok(content
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect())
}

/// Outcome of a manual driver selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManualChoice {
    Loaded(String),
    Back,
}

/// Lets the user load a driver by hand when probing found nothing.
pub trait ManualDriverChooser {
    fn choose(&mut self, class: DeviceClass, prompter: &mut dyn Prompter) -> Result<ManualChoice>;
}

/// Offers every module staged from driver disks, with `modinfo` descriptions.
#[derive(Debug, Clone)]
pub struct ModuleListChooser {
    modules_dir: PathBuf,
}

impl ModuleListChooser {
    pub fn new(modules_dir: impl Into<PathBuf>) -> Self {
        Self {
            modules_dir: modules_dir.into(),
        }
    }

    /// `(module name, path)` of every `.ko` below the staging tree, sorted.
    pub fn staged_modules(&self) -> Vec<(String, PathBuf)> {
        let mut modules: Vec<(String, PathBuf)> = WalkDir::new(&self.modules_dir)
            .follow_links(true)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let path = entry.into_path();
                let name = path.file_name()?.to_str()?.strip_suffix(".ko")?.to_string();
                Some((name, path))
            })
            .collect();
        modules.sort();
        modules.dedup_by(|a, b| a.0 == b.0);
        modules
    }
}

fn module_description(path: &Path) -> Option<String> {
    let out = run_command("modinfo", &[std::ffi::OsStr::new("--description"), path.as_os_str()])
        .ok()?;
    let text = out.stdout.trim();
    (out.success && !text.is_empty()).then(|| text.to_string())
}

impl ManualDriverChooser for ModuleListChooser {
    fn choose(&mut self, class: DeviceClass, prompter: &mut dyn Prompter) -> Result<ManualChoice> {
        let modules = self.staged_modules();
        if modules.is_empty() {
            prompter.message(
                "Error",
                "No drivers from driver disks are available to load manually.",
            )?;
            return Ok(ManualChoice::Back);
        }

        let items: Vec<String> = modules
            .iter()
            .map(|(name, path)| match module_description(path) {
                Some(desc) => format!("{} - {}", name, desc),
                None => name.clone(),
            })
            .collect();
        let text = format!("Please select the {} driver you wish to load.", class);
        let Some(index) = prompter.menu("Select Driver", &text, &items, "Back")? else {
            return Ok(ManualChoice::Back);
        };
        let (name, _) = &modules[index];

        let out = run_command("modprobe", &[name.as_str()])?;
        if !out.success {
            prompter.message(
                "Error",
                &format!("Failed to load {}: {}", name, out.stderr.trim()),
            )?;
            return Ok(ManualChoice::Back);
        }
        info!("Manually loaded {}", name);
        Ok(ManualChoice::Loaded(name.clone()))
    }
}
