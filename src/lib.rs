//! ddloader Library
//!
//! Driver disk loading for installer environments: find a driver disk on
//! removable media, an image file, a partition or the network, verify it,
//! extract the kernel modules and firmware its packages carry and make them
//! visible to the running kernel.

pub mod acquisition;
pub mod archive;
pub mod cli;
pub mod command;
pub mod config;
pub mod context;
pub mod copy;
pub mod devices;
pub mod disk;
pub mod error;
pub mod fetch;
pub mod modules;
pub mod mount;
pub mod package;
pub mod preflight;
pub mod process_guard;
pub mod prompt;
pub mod sources;
pub mod theme;
pub mod ui;
pub mod unpack;

#[cfg(test)]
mod testutil;

// Re-export main types for convenience
pub use acquisition::{AcquisitionOutcome, MediaRequest, Stage};
pub use config::LoaderConfig;
pub use context::LoaderContext;
pub use disk::{DiskCounter, DriverDiskDescriptor, InstalledDisk, Installer, StagingLayout, Verifier};
pub use error::{DriverDiskError, Result};
pub use process_guard::{ChildRegistry, CommandProcessGroup};
pub use sources::{BootOptions, DriverDiskSource, KickstartDriverDisk, PartitionLoad};
pub use unpack::{CapabilityPredicate, DriverPayloadFilter, ProvidesKernelModules, extract_packages_from};
