//! Pre-flight checks for the runtime environment
//!
//! Verifies, before any dialog is shown, that the loader runs as root and
//! that the helpers it shells out to are installed. A missing optional
//! helper only disables the feature that needs it.

use crate::command::is_available;
use tracing::debug;

/// Result of environment verification
#[derive(Debug)]
pub struct PreflightReport {
    pub missing_binaries: Vec<String>,
    pub missing_optional: Vec<String>,
    pub is_root: bool,
}

impl PreflightReport {
    /// Returns true if all required checks passed
    pub fn is_ok(&self) -> bool {
        self.missing_binaries.is_empty() && self.is_root
    }
}

/// Helpers every load needs
pub const REQUIRED_BINARIES: &[&str] = &[
    "mount",    // partitions and image files
    "depmod",   // module database refresh
    "modprobe", // unloading and manual loading
    "udevadm",  // bus re-probe after install
];

/// Helpers only some sources need
pub const OPTIONAL_BINARIES: &[&str] = &[
    "curl",    // dd=http(s)/ftp sources
    "modinfo", // descriptions in the manual driver list
];

/// Check if running as root (EUID 0)
fn is_running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

fn missing_from(names: &[&str], available: &dyn Fn(&str) -> bool) -> Vec<String> {
    names
        .iter()
        .filter(|&&name| !available(name))
        .map(|name| name.to_string())
        .collect()
}

fn build_report(available: &dyn Fn(&str) -> bool, is_root: bool) -> PreflightReport {
    let missing_optional = missing_from(OPTIONAL_BINARIES, available);
    for binary in &missing_optional {
        debug!("Optional binary not found: {}", binary);
    }
    PreflightReport {
        missing_binaries: missing_from(REQUIRED_BINARIES, available),
        missing_optional,
        is_root,
    }
}

/// Perform all checks and return the result
pub fn verify_environment() -> PreflightReport {
    build_report(&is_available, is_running_as_root())
}

/// Print a human-readable failure report to stderr.
pub fn print_failure(report: &PreflightReport) {
    eprintln!("ddloader: environment check failed");
    if !report.is_root {
        eprintln!("  - must be run as root (mounting and loading modules need it)");
    }
    for binary in &report.missing_binaries {
        eprintln!("  - required program not found in PATH: {}", binary);
    }
}
