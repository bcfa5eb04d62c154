use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// ddloader - driver disk loader for installer environments
#[derive(Parser, Debug)]
#[command(name = "ddloader")]
#[command(about = "Locate, verify and install kernel-module driver disks")]
#[command(version)]
pub struct Cli {
    /// JSON configuration file overriding the built-in paths
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Write logs here instead of the configured log file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Never draw dialogs: log messages and decline every question.
    ///
    /// Logs go to stderr in this mode.
    #[arg(long, global = true)]
    pub headless: bool,

    /// Skip checking for new devices after a disk is installed
    #[arg(long, global = true)]
    pub no_probe: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Ask for driver disks until the user has no more (default)
    Interactive {
        /// Device class the drivers are for (any, network, disk, cdrom)
        #[arg(long, default_value = "any")]
        class: String,
    },
    /// Load one driver disk from removable media or an image file
    Media {
        /// Device class the drivers are for (any, network, disk, cdrom)
        #[arg(long, default_value = "any")]
        class: String,
        /// Label the back button "Cancel"
        #[arg(long)]
        cancel: bool,
    },
    /// Load from a source string: nfs:, http(s)://, ftp://, cdrom or path:
    Source {
        source: String,
    },
    /// Load a driver disk from a block device (name or /dev path)
    Device {
        device: String,
    },
    /// Load from a partition; exits with 0, 1 (mount), 2 (invalid) or 3 (back)
    Partition {
        device: String,
    },
    /// Load every disk whose filesystem carries the driver disk label
    Auto,
    /// Process driverdisk lines of a kickstart file
    Kickstart {
        file: PathBuf,
    },
    /// Run the boot-time sequence driven by the kernel command line
    Boot {
        /// Command line file to read
        #[arg(long, default_value = "/proc/cmdline")]
        cmdline: PathBuf,
    },
    /// Check whether a directory is a valid driver disk
    Verify {
        dir: PathBuf,
    },
    /// Extract driver payloads of every package in a directory
    Extract {
        dir: PathBuf,
        dest: PathBuf,
        /// Kernel version packages must provide modules for
        #[arg(long)]
        kernel: Option<String>,
    },
    /// Print a package header ("-" reads standard input)
    Inspect {
        package: PathBuf,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
