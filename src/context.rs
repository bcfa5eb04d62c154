//! Everything a driver disk load needs, in one place
//!
//! `LoaderContext` owns the configuration, the collaborators that touch the
//! system and the installed-disk counter. The acquisition flow and the
//! non-interactive entry points all take `&mut LoaderContext`.

use crate::config::{LoaderConfig, ProductIdentity};
use crate::devices::{DeviceProbe, SysfsDeviceProbe};
use crate::disk::{
    DiskCounter, DriverDiskDescriptor, InstalledDisk, Installer, StagingLayout, Verifier,
};
use crate::error::Result;
use crate::fetch::{CommandFetcher, ImageFetcher};
use crate::modules::{
    Depmod, FirmwareClassPath, KernelModules, ManualDriverChooser, ModuleListChooser,
    ModuleSubsystem, running_kernel_version,
};
use crate::mount::{Mounter, SystemMounter};
use crate::prompt::Prompter;
use tracing::{info, warn};

pub struct LoaderContext {
    pub config: LoaderConfig,
    pub product: ProductIdentity,
    pub prompter: Box<dyn Prompter>,
    pub devices: Box<dyn DeviceProbe>,
    pub mounter: Box<dyn Mounter>,
    pub modules: Box<dyn ModuleSubsystem>,
    pub manual: Box<dyn ManualDriverChooser>,
    pub fetcher: Box<dyn ImageFetcher>,
    pub verifier: Verifier,
    pub installer: Installer,
    pub counter: DiskCounter,
}

impl LoaderContext {
    /// Context wired to the running system.
    ///
    /// Loaded kernel modules are recorded here; later module state restores
    /// go back to this set.
    pub fn system(config: LoaderConfig, prompter: Box<dyn Prompter>) -> Self {
        let product = config.product();
        let kernel_version = running_kernel_version();
        info!(
            "Driver disks for {} ({}), kernel {}",
            product.name, product.arch, kernel_version
        );

        let layout = StagingLayout::new(&config.staging_dir);
        let manual = ModuleListChooser::new(layout.modules_dir());
        let installer = Installer::new(
            layout,
            &config.modules_root,
            kernel_version,
            Box::new(Depmod),
            Box::new(FirmwareClassPath::default()),
        );

        Self {
            verifier: Verifier::from_config(&config, &product),
            installer,
            config,
            product,
            prompter,
            devices: Box::new(SysfsDeviceProbe::default()),
            mounter: Box::new(SystemMounter),
            modules: Box::new(KernelModules::save_state()),
            manual: Box::new(manual),
            fetcher: Box::new(CommandFetcher::default()),
            counter: DiskCounter::new(),
        }
    }

    /// Install a verified disk as the next numbered disk.
    pub fn install(&mut self, descriptor: DriverDiskDescriptor) -> Result<InstalledDisk> {
        if let Err(e) = self.prompter.status("Loading", "Reading driver disk") {
            warn!("Unable to show status: {}", e);
        }
        self.installer.install(descriptor, &mut self.counter)
    }

    /// Unload modules loaded since start-up and re-probe, so updated drivers
    /// can bind. Failures are logged.
    pub fn refresh_drivers(&mut self) {
        info!("Trying to refresh loaded drivers");
        if let Err(e) = self.modules.restore_state() {
            warn!("Unable to restore module state: {}", e);
        }
        if let Err(e) = self.modules.bus_probe() {
            warn!("Bus probe failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::testutil::FakeSystem;

    #[test]
    fn test_refresh_drivers_restores_then_probes() {
        let mut sys = FakeSystem::new();
        sys.ctx.refresh_drivers();
        let journal = sys.journal.borrow();
        assert_eq!(journal.events, vec!["restore_state", "bus_probe"]);
    }

    #[test]
    fn test_install_advances_shared_counter() {
        let mut sys = FakeSystem::new();
        let root = sys.disk_at("dev/sdb");
        let descriptor = sys.ctx.verifier.verify(&root).unwrap();
        let installed = sys.ctx.install(descriptor).unwrap();
        assert_eq!(installed.sequence, 0);
        assert_eq!(sys.ctx.counter.current(), 1);
        assert!(
            sys.journal
                .borrow()
                .events
                .iter()
                .any(|e| e == "status:Loading")
        );
    }
}
