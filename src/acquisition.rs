//! Interactive driver disk acquisition
//!
//! The user picks a device, optionally a partition and an image file on it,
//! and the disk found there is verified, installed and probed. Each screen is
//! a [`Stage`]; [`Acquisition::step`] performs one stage and returns the next,
//! so every transition can be driven and checked on its own.
//!
//! Two scratch mountpoints are shared by every pass: the partition mountpoint
//! (holding image files) and the drivers mountpoint (holding the disk
//! itself). Both are always unmounted before they are mounted again.

use crate::context::LoaderContext;
use crate::devices::DeviceClass;
use crate::disk::DriverDiskDescriptor;
use crate::error::Result;
use crate::modules::{ManualChoice, detect_update};
use crate::mount::{ensure_unmounted, release_scratch};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

const SOURCE_TITLE: &str = "Driver Disk Source";
const NO_DEVICES_TEXT: &str = "No devices of the appropriate type were found on this driver \
    disk.  Would you like to manually select the driver, continue anyway, or load another \
    driver disk?";
const PROBE_BUTTONS: [&str; 3] = ["Manually choose", "Continue", "Load another disk"];

/// How an acquisition pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionOutcome {
    /// A disk was handled (or the user chose to continue without one)
    Ok,
    /// The user backed out, or there was nothing to choose from
    Back,
}

/// One screen of the acquisition flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    SelectDevice,
    SelectPartition,
    ChooseFile,
    LoadFile,
    Insert,
    LoadAndInstall,
    Probe,
    Done(AcquisitionOutcome),
}

impl Stage {
    pub fn description(&self) -> &'static str {
        match self {
            Stage::SelectDevice => "Selecting source device",
            Stage::SelectPartition => "Selecting partition",
            Stage::ChooseFile => "Choosing image file",
            Stage::LoadFile => "Mounting image file",
            Stage::Insert => "Waiting for driver disk",
            Stage::LoadAndInstall => "Installing driver disk",
            Stage::Probe => "Probing for new devices",
            Stage::Done(_) => "Done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Forward,
    Backward,
}

/// What one pass has selected so far.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub device: Option<String>,
    pub partition: Option<String>,
    pub image_file: Option<PathBuf>,
    /// Verified disk waiting to be installed
    pub descriptor: Option<DriverDiskDescriptor>,
    pub direction: Direction,
    /// Devices of the requested class before the install
    pub devices_before: usize,
}

impl SessionState {
    fn backward(&self) -> bool {
        self.direction == Direction::Backward
    }

    /// Stage to return to when the current disk has to be replaced.
    fn reload_stage(&self) -> Stage {
        if self.image_file.is_some() {
            Stage::ChooseFile
        } else {
            Stage::Insert
        }
    }
}

/// Parameters of one acquisition pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaRequest {
    pub class: DeviceClass,
    /// Label the first menu's back button "Cancel"
    pub use_cancel: bool,
    /// Stop after installing without re-probing drivers
    pub no_probe: bool,
}

impl MediaRequest {
    pub fn new(class: DeviceClass) -> Self {
        Self {
            class,
            use_cancel: false,
            no_probe: false,
        }
    }
}

pub struct Acquisition<'c> {
    ctx: &'c mut LoaderContext,
    request: MediaRequest,
    session: SessionState,
}

impl<'c> Acquisition<'c> {
    pub fn new(ctx: &'c mut LoaderContext, request: MediaRequest) -> Self {
        Self::with_session(ctx, request, SessionState::default())
    }

    /// Resume from an existing session, e.g. to drive a single stage.
    pub fn with_session(
        ctx: &'c mut LoaderContext,
        request: MediaRequest,
        session: SessionState,
    ) -> Self {
        Self {
            ctx,
            request,
            session,
        }
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// Run stages from device selection until the pass is done.
    pub fn run(&mut self) -> Result<AcquisitionOutcome> {
        let mut stage = Stage::SelectDevice;
        loop {
            if let Stage::Done(outcome) = stage {
                info!("Driver disk acquisition finished: {:?}", outcome);
                return Ok(outcome);
            }
            debug!("acquisition stage: {} ({:?})", stage, self.session.direction);
            stage = self.step(stage)?;
        }
    }

    /// Perform `stage` and return the next one.
    ///
    /// Errors are only returned for things the flow cannot navigate around:
    /// a stuck scratch mountpoint or a broken terminal.
    pub fn step(&mut self, stage: Stage) -> Result<Stage> {
        match stage {
            Stage::SelectDevice => self.select_device(),
            Stage::SelectPartition => self.select_partition(),
            Stage::ChooseFile => self.choose_file(),
            Stage::LoadFile => self.load_file(),
            Stage::Insert => self.insert(),
            Stage::LoadAndInstall => self.load_and_install(),
            Stage::Probe => self.probe(),
            Stage::Done(outcome) => Ok(Stage::Done(outcome)),
        }
    }

    fn partition_mountpoint(&self) -> PathBuf {
        self.ctx.config.partition_mountpoint.clone()
    }

    fn drivers_mountpoint(&self) -> PathBuf {
        self.ctx.config.drivers_mountpoint.clone()
    }

    fn unmount_quietly(&self, target: &Path) {
        if let Err(e) = self.ctx.mounter.unmount(target) {
            debug!("unmount {}: {:?}", target.display(), e);
        }
    }

    fn select_device(&mut self) -> Result<Stage> {
        let devices = self.ctx.devices.candidate_devices().unwrap_or_else(|e| {
            warn!("Device enumeration failed: {}", e);
            Vec::new()
        });

        match devices.as_slice() {
            [] => {
                error!("no devices found to load drivers from");
                Ok(Stage::Done(AcquisitionOutcome::Back))
            }
            [only] => {
                self.session.device = Some(only.clone());
                if self.session.backward() {
                    return Ok(Stage::Done(AcquisitionOutcome::Back));
                }
                Ok(Stage::SelectPartition)
            }
            _ => {
                self.session.direction = Direction::Forward;
                let back = if self.request.use_cancel { "Cancel" } else { "Back" };
                let choice = self.ctx.prompter.menu(
                    SOURCE_TITLE,
                    "You have multiple devices which could serve as sources for a driver \
                     disk.  Which would you like to use?",
                    &devices,
                    back,
                )?;
                match choice.and_then(|i| devices.get(i)) {
                    Some(device) => {
                        self.session.device = Some(device.clone());
                        Ok(Stage::SelectPartition)
                    }
                    None => Ok(Stage::Done(AcquisitionOutcome::Back)),
                }
            }
        }
    }

    fn select_partition(&mut self) -> Result<Stage> {
        self.session.partition = None;
        let Some(device) = self.session.device.clone() else {
            return Ok(Stage::SelectDevice);
        };

        let partitions = self.ctx.devices.partitions(&device).unwrap_or_else(|e| {
            warn!("Unable to list partitions of {}: {}", device, e);
            Vec::new()
        });
        if partitions.is_empty() {
            return Ok(if self.session.backward() {
                Stage::SelectDevice
            } else {
                Stage::Insert
            });
        }

        self.session.direction = Direction::Forward;
        let choice = self.ctx.prompter.menu(
            SOURCE_TITLE,
            "There are multiple partitions on this device which could contain the driver \
             disk image.  Which would you like to use?",
            &partitions,
            "Back",
        )?;
        match choice.and_then(|i| partitions.get(i)) {
            Some(partition) => {
                self.session.partition = Some(partition.clone());
                Ok(Stage::ChooseFile)
            }
            None => {
                self.session.direction = Direction::Backward;
                Ok(Stage::SelectDevice)
            }
        }
    }

    fn choose_file(&mut self) -> Result<Stage> {
        let Some(partition) = self.session.partition.clone() else {
            error!("somehow got to choosing file without a partition, going back");
            return Ok(Stage::SelectPartition);
        };
        let mountpoint = self.partition_mountpoint();
        ensure_unmounted(self.ctx.mounter.as_ref(), &mountpoint)?;

        info!("trying to mount {} as partition", partition);
        let node = self.ctx.devices.device_node(&partition);
        if let Err(e) = self.ctx.mounter.mount_readonly(&node, &mountpoint) {
            warn!("{}", e);
            self.ctx.prompter.message("Error", "Failed to mount partition.")?;
            return Ok(Stage::SelectPartition);
        }

        let file = self.ctx.prompter.select_file(
            "Select driver disk image",
            "Select the file which is your driver disk image.",
            &mountpoint,
        )?;
        match file {
            Some(file) => {
                self.session.direction = Direction::Forward;
                self.session.image_file = Some(file);
                Ok(Stage::LoadFile)
            }
            None => {
                self.unmount_quietly(&mountpoint);
                self.session.direction = Direction::Backward;
                Ok(Stage::SelectPartition)
            }
        }
    }

    fn load_file(&mut self) -> Result<Stage> {
        let Some(file) = self.session.image_file.clone() else {
            debug!("trying to load a driver disk without an image file");
            return Ok(Stage::ChooseFile);
        };
        let drivers = self.drivers_mountpoint();

        if self.session.backward() {
            release_scratch(self.ctx.mounter.as_ref(), &drivers);
            self.session.image_file = None;
            return Ok(Stage::ChooseFile);
        }

        ensure_unmounted(self.ctx.mounter.as_ref(), &drivers)?;
        if let Err(e) = self.ctx.mounter.mount_readonly(&file, &drivers) {
            warn!("{}", e);
            self.ctx
                .prompter
                .message("Error", "Failed to load driver disk from file.")?;
            return Ok(Stage::ChooseFile);
        }

        self.verify_mounted(&drivers, Stage::ChooseFile)
    }

    fn insert(&mut self) -> Result<Stage> {
        let Some(device) = self.session.device.clone() else {
            return Ok(Stage::SelectDevice);
        };

        let text = format!(
            "Insert your driver disk into /dev/{} and press \"OK\" to continue.",
            device
        );
        if !self
            .ctx
            .prompter
            .confirm("Insert Driver Disk", &text, "OK", "Back")?
        {
            self.session.direction = Direction::Backward;
            return Ok(Stage::SelectDevice);
        }
        self.session.direction = Direction::Forward;

        let drivers = self.drivers_mountpoint();
        ensure_unmounted(self.ctx.mounter.as_ref(), &drivers)?;
        info!("trying to mount {}", device);
        let node = self.ctx.devices.device_node(&device);
        if let Err(e) = self.ctx.mounter.mount_readonly(&node, &drivers) {
            warn!("{}", e);
            self.ctx.prompter.message("Error", "Failed to mount driver disk.")?;
            return Ok(Stage::Insert);
        }

        self.verify_mounted(&drivers, Stage::Insert)
    }

    /// Verify the tree at the drivers mountpoint; on failure tell the user,
    /// unmount and go to `retry`.
    fn verify_mounted(&mut self, drivers: &Path, retry: Stage) -> Result<Stage> {
        match self.ctx.verifier.verify(drivers) {
            Ok(descriptor) => {
                self.session.descriptor = Some(descriptor);
                Ok(Stage::LoadAndInstall)
            }
            Err(e) => {
                warn!("{}", e);
                let text = format!(
                    "Driver disk is invalid for this release of {}.",
                    self.ctx.product.name
                );
                self.ctx.prompter.message("Error", &text)?;
                self.unmount_quietly(drivers);
                Ok(retry)
            }
        }
    }

    fn load_and_install(&mut self) -> Result<Stage> {
        let drivers = self.drivers_mountpoint();
        let Some(descriptor) = self.session.descriptor.take() else {
            self.session.direction = Direction::Backward;
            return Ok(self.session.reload_stage());
        };

        self.session.devices_before = self.ctx.devices.count_devices(self.request.class);
        let result = self.ctx.install(descriptor);
        self.unmount_quietly(&drivers);

        match result {
            Ok(disk) => info!(
                "Driver disk #{} {:?} installed, {} file(s)",
                disk.sequence, disk.title, disk.extracted_files
            ),
            Err(e) if e.is_back_signal() => {
                warn!("{}", e);
                self.session.direction = Direction::Backward;
                return Ok(self.session.reload_stage());
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                self.ctx
                    .prompter
                    .message("Error", &format!("Failed to load driver disk: {}", e))?;
            }
        }

        if self.session.image_file.is_some() {
            release_scratch(self.ctx.mounter.as_ref(), &drivers);
            let partition = self.partition_mountpoint();
            self.unmount_quietly(&partition);
        }
        Ok(Stage::Probe)
    }

    fn probe(&mut self) -> Result<Stage> {
        if self.request.no_probe {
            return Ok(Stage::Done(AcquisitionOutcome::Ok));
        }

        let before = self.ctx.modules.snapshot().unwrap_or_else(|e| {
            warn!("Unable to read module versions: {}", e);
            Default::default()
        });
        self.ctx.refresh_drivers();
        let after = self.ctx.modules.snapshot().unwrap_or_else(|e| {
            warn!("Unable to read module versions: {}", e);
            Default::default()
        });

        let updated = detect_update(&before, &after);
        let devices_after = self.ctx.devices.count_devices(self.request.class);
        debug!(
            "module update detected: {}, devices {} -> {}",
            updated, self.session.devices_before, devices_after
        );
        if updated || devices_after > self.session.devices_before {
            return Ok(Stage::Done(AcquisitionOutcome::Ok));
        }

        loop {
            let choice = self
                .ctx
                .prompter
                .ternary("Error", NO_DEVICES_TEXT, PROBE_BUTTONS)?;
            match choice {
                1 => return Ok(Stage::Done(AcquisitionOutcome::Ok)),
                2 => {
                    self.session = SessionState::default();
                    return Ok(Stage::SelectDevice);
                }
                _ => {
                    let ctx = &mut *self.ctx;
                    let manual = ctx.manual.choose(self.request.class, ctx.prompter.as_mut())?;
                    if let ManualChoice::Loaded(module) = manual {
                        info!("Using manually loaded {}", module);
                        return Ok(Stage::Done(AcquisitionOutcome::Ok));
                    }
                }
            }
        }
    }
}

/// One acquisition pass for `request`.
pub fn load_driver_from_media(
    ctx: &mut LoaderContext,
    request: MediaRequest,
) -> Result<AcquisitionOutcome> {
    Acquisition::new(ctx, request).run()
}

/// Ask for driver disks until the user has no more.
pub fn load_driver_disks(ctx: &mut LoaderContext, class: DeviceClass) -> Result<()> {
    if !ctx
        .prompter
        .confirm("Driver disk", "Do you have a driver disk?", "Yes", "No")?
    {
        return Ok(());
    }

    let no_probe = ctx.config.no_probe;
    let first = MediaRequest {
        class,
        use_cancel: true,
        no_probe,
    };
    if load_driver_from_media(ctx, first)? == AcquisitionOutcome::Back {
        return Ok(());
    }

    while ctx.prompter.confirm(
        "More Driver Disks?",
        "Do you wish to load any more driver disks?",
        "Yes",
        "No",
    )? {
        load_driver_from_media(
            ctx,
            MediaRequest {
                class,
                use_cancel: false,
                no_probe,
            },
        )?;
    }
    Ok(())
}
