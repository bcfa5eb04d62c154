//! Driver package extraction engine
//!
//! Runs every `*.rpm` in a directory through the capability checks and, for
//! the packages that pass, extracts the firmware and kernel module members of
//! the payload into one shared output tree.

use crate::archive::{ArchiveExtractor, EntryKind, EntryMetadata, FilterDecision, MemberFilter};
use crate::error::{DriverDiskError, Result};
use crate::package::{Capability, PackageReader};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Capability every driver package must provide, versioned by kernel release.
pub const KERNEL_MODULES_CAPABILITY: &str = "kernel-modules";

const FIRMWARE_SEGMENT: &str = "lib/firmware/";
const MODULE_EXTENSION: &str = ".ko";

/// Predicate applied to `(name, version)` capability pairs.
pub trait CapabilityPredicate {
    fn accepts(&self, capability: &Capability) -> bool;
}

impl<F> CapabilityPredicate for F
where
    F: Fn(&Capability) -> bool,
{
    fn accepts(&self, capability: &Capability) -> bool {
        self(capability)
    }
}

/// Accepts `kernel-modules = <kernel_version>` only; a missing version never
/// matches.
#[derive(Debug, Clone)]
pub struct ProvidesKernelModules {
    pub kernel_version: String,
}

impl ProvidesKernelModules {
    pub fn new(kernel_version: impl Into<String>) -> Self {
        Self {
            kernel_version: kernel_version.into(),
        }
    }
}

impl CapabilityPredicate for ProvidesKernelModules {
    fn accepts(&self, capability: &Capability) -> bool {
        capability.name == KERNEL_MODULES_CAPABILITY
            && capability.version.as_deref() == Some(self.kernel_version.as_str())
    }
}

/// True for firmware blobs and kernel module binaries.
///
/// `lib/firmware/foo.bin` and `drivers/net/e1000.ko` qualify;
/// `e1000.ko.gz`, a bare `lib/firmware/` and `docs/readme.txt` do not.
pub fn is_driver_payload(path: &str) -> bool {
    if let Some(pos) = path.rfind(FIRMWARE_SEGMENT) {
        if !path[pos + FIRMWARE_SEGMENT.len()..].is_empty() {
            return true;
        }
    }
    path.len() >= MODULE_EXTENSION.len() && path.ends_with(MODULE_EXTENSION)
}

/// Default member filter: firmware and `.ko` files, never directories.
#[derive(Debug, Clone, Copy, Default)]
pub struct DriverPayloadFilter;

impl MemberFilter for DriverPayloadFilter {
    fn decide(&self, path: &str, meta: &EntryMetadata) -> FilterDecision {
        if meta.kind() != EntryKind::Directory && is_driver_payload(path) {
            FilterDecision::Extract
        } else {
            FilterDecision::Skip
        }
    }
}

/// Result of processing one package.
#[derive(Debug)]
pub enum PackageOutcome {
    Extracted { files: usize },
    /// Failed a capability check; nothing was written
    Rejected(DriverDiskError),
    /// Could not be opened or parsed; nothing was written
    Unreadable(DriverDiskError),
    /// Extraction started and hit a hard error
    Failed(DriverDiskError),
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<(PathBuf, PackageOutcome)>,
}

impl BatchReport {
    /// False iff any package hit a hard extraction error.
    pub fn is_success(&self) -> bool {
        !self
            .outcomes
            .iter()
            .any(|(_, outcome)| matches!(outcome, PackageOutcome::Failed(_)))
    }

    pub fn extracted_files(&self) -> usize {
        self.outcomes
            .iter()
            .map(|(_, outcome)| match outcome {
                PackageOutcome::Extracted { files } => *files,
                _ => 0,
            })
            .sum()
    }

    pub fn extracted_packages(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, PackageOutcome::Extracted { .. }))
            .count()
    }
}

/// A configured extraction batch.
pub struct PackageBatch<'a> {
    /// At least one provides pair must satisfy this
    pub provides: &'a dyn CapabilityPredicate,
    /// Every requires pair must satisfy this, when set
    pub requires: Option<&'a dyn CapabilityPredicate>,
    pub filter: &'a dyn MemberFilter,
}

impl PackageBatch<'_> {
    /// Process every package directly under `source_dir`.
    ///
    /// Failing to read `source_dir` or create `destination` is returned as an
    /// error straight away; per-package problems end up in the report.
    pub fn run(&self, source_dir: &Path, destination: &Path) -> Result<BatchReport> {
        fs::create_dir_all(destination).map_err(|e| DriverDiskError::io_at(destination, e))?;
        let packages = list_packages(source_dir)?;
        info!(
            "Unpacking {} package(s) from {}",
            packages.len(),
            source_dir.display()
        );

        let mut extractor = ArchiveExtractor::new();
        let mut report = BatchReport::default();
        for package in packages {
            let outcome = self.process(&mut extractor, &package, destination);
            match &outcome {
                PackageOutcome::Extracted { files } => {
                    info!("{}: extracted {} file(s)", package.display(), files)
                }
                PackageOutcome::Rejected(e) => info!("{}", e),
                PackageOutcome::Unreadable(e) => warn!("Skipping package: {}", e),
                PackageOutcome::Failed(e) => error!("{}: {}", package.display(), e),
            }
            report.outcomes.push((package, outcome));
        }
        Ok(report)
    }

    fn process(
        &self,
        extractor: &mut ArchiveExtractor,
        package: &Path,
        destination: &Path,
    ) -> PackageOutcome {
        let reader = match PackageReader::open(package) {
            Ok(reader) => reader,
            Err(e) => return PackageOutcome::Unreadable(e),
        };
        let header = reader.header();

        if let Some(requires) = self.requires {
            if let Some(unmet) = header.requires().iter().find(|cap| !requires.accepts(cap)) {
                return PackageOutcome::Rejected(DriverDiskError::unmet_dependency(
                    header.label(),
                    format!("requirement {} rejected", unmet),
                ));
            }
        }

        let provides = header.provides();
        if !provides.iter().any(|cap| self.provides.accepts(cap)) {
            return PackageOutcome::Rejected(DriverDiskError::unmet_dependency(
                header.label(),
                "no matching kernel-modules capability provided",
            ));
        }

        let payload = match reader.into_payload() {
            Ok(payload) => payload,
            Err(e) => return PackageOutcome::Unreadable(e),
        };
        match extractor.extract(payload, destination, self.filter) {
            Ok(summary) => PackageOutcome::Extracted {
                files: summary.extracted.len(),
            },
            Err(e) => PackageOutcome::Failed(e),
        }
    }
}

/// Extract driver payloads of every package providing
/// `kernel-modules = <kernel_version>`.
pub fn extract_packages_from(
    source_dir: &Path,
    destination: &Path,
    kernel_version: &str,
) -> Result<BatchReport> {
    let provides = ProvidesKernelModules::new(kernel_version);
    PackageBatch {
        provides: &provides,
        requires: None,
        filter: &DriverPayloadFilter,
    }
    .run(source_dir, destination)
}

/// `*.rpm` files directly under `dir`, in directory order.
fn list_packages(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|e| DriverDiskError::io_at(dir, e))?;
    let mut packages = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| DriverDiskError::io_at(dir, e))?.path();
        if path.extension().is_some_and(|ext| ext == "rpm") && path.is_file() {
            packages.push(path);
        }
    }
    Ok(packages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{CpioBuilder, RpmBuilder};
    use tempfile::TempDir;

    fn meta(mode: u32) -> EntryMetadata {
        EntryMetadata {
            ino: 1,
            mode,
            nlink: 1,
            mtime: 0,
            size: 0,
        }
    }

    fn driver_rpm(kernel: &str) -> Vec<u8> {
        let payload = CpioBuilder::new()
            .dir("./lib/modules")
            .file(
                &format!("./lib/modules/{}/extra/e1000.ko", kernel),
                b"module",
            )
            .file("./lib/firmware/e1000/fw.bin", b"firmware")
            .file("./usr/share/doc/e1000/README", b"docs")
            .finish();
        RpmBuilder::new("e1000-kmod")
            .provides("e1000-kmod", "1.0")
            .provides("kernel-modules", kernel)
            .payload(payload)
            .build()
    }

    #[test]
    fn test_driver_payload_truth_table() {
        assert!(is_driver_payload("lib/firmware/foo.bin"));
        assert!(is_driver_payload("drivers/net/e1000.ko"));
        assert!(!is_driver_payload("drivers/net/e1000.ko.gz"));
        assert!(!is_driver_payload("lib/firmware/"));
        assert!(!is_driver_payload("docs/readme.txt"));
        assert!(is_driver_payload("./lib/firmware/sub/dir/blob"));
    }

    #[test]
    fn test_filter_never_extracts_directories() {
        assert_eq!(
            DriverPayloadFilter.decide("lib/firmware/vendor", &meta(0o040755)),
            FilterDecision::Skip
        );
        assert_eq!(
            DriverPayloadFilter.decide("lib/firmware/vendor/a.bin", &meta(0o100644)),
            FilterDecision::Extract
        );
    }

    #[test]
    fn test_kernel_modules_predicate() {
        let predicate = ProvidesKernelModules::new("5.10.0");
        assert!(predicate.accepts(&Capability::new("kernel-modules", Some("5.10.0"))));
        assert!(!predicate.accepts(&Capability::new("kernel-modules", Some("5.11.0"))));
        assert!(!predicate.accepts(&Capability::new("kernel-modules", None)));
        assert!(!predicate.accepts(&Capability::new("kernel", Some("5.10.0"))));
    }

    #[test]
    fn test_matching_package_is_extracted() {
        let src = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        fs::write(src.path().join("e1000.rpm"), driver_rpm("5.10.0")).unwrap();

        let report = extract_packages_from(src.path(), dest.path(), "5.10.0").unwrap();
        assert!(report.is_success());
        assert_eq!(report.extracted_files(), 2);
        assert!(dest.path().join("lib/modules/5.10.0/extra/e1000.ko").is_file());
        assert!(dest.path().join("lib/firmware/e1000/fw.bin").is_file());
        assert!(!dest.path().join("usr").exists());
    }

    #[test]
    fn test_wrong_kernel_is_rejected_without_writes() {
        let src = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        fs::write(src.path().join("e1000.rpm"), driver_rpm("5.10.0")).unwrap();

        let report = extract_packages_from(src.path(), dest.path(), "5.11.0").unwrap();
        assert!(report.is_success());
        assert_eq!(report.extracted_files(), 0);
        assert!(matches!(
            report.outcomes[0].1,
            PackageOutcome::Rejected(DriverDiskError::UnmetDependency { .. })
        ));
        assert_eq!(fs::read_dir(dest.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_requires_predicate_rejects_on_any_pair() {
        let src = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let rpm = RpmBuilder::new("needs-newer")
            .provides("kernel-modules", "5.10.0")
            .requires("kernel", "5.10.0")
            .requires("firmware-tools", "2.0")
            .payload(CpioBuilder::new().file("x.ko", b"m").finish())
            .build();
        fs::write(src.path().join("needs-newer.rpm"), rpm).unwrap();

        let provides = ProvidesKernelModules::new("5.10.0");
        let only_kernel = |cap: &Capability| cap.name == "kernel";
        let batch = PackageBatch {
            provides: &provides,
            requires: Some(&only_kernel as &dyn CapabilityPredicate),
            filter: &DriverPayloadFilter,
        };
        let report = batch.run(src.path(), dest.path()).unwrap();
        assert_eq!(report.extracted_packages(), 0);
        assert!(!dest.path().join("x.ko").exists());
    }

    #[test]
    fn test_rejected_and_unreadable_packages_do_not_fail_batch() {
        let src = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        fs::write(src.path().join("good.rpm"), driver_rpm("5.10.0")).unwrap();
        fs::write(src.path().join("other.rpm"), driver_rpm("4.18.0")).unwrap();
        fs::write(src.path().join("junk.rpm"), b"not a package").unwrap();
        fs::write(src.path().join("notes.txt"), b"ignored").unwrap();

        let report = extract_packages_from(src.path(), dest.path(), "5.10.0").unwrap();
        assert!(report.is_success());
        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(report.extracted_packages(), 1);
    }

    #[test]
    fn test_broken_payload_fails_batch() {
        let src = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let rpm = RpmBuilder::new("broken")
            .provides("kernel-modules", "5.10.0")
            .payload(CpioBuilder::new().file("a.ko", b"m").finish_without_trailer())
            .build();
        fs::write(src.path().join("broken.rpm"), rpm).unwrap();
        fs::write(src.path().join("good.rpm"), driver_rpm("5.10.0")).unwrap();

        let report = extract_packages_from(src.path(), dest.path(), "5.10.0").unwrap();
        assert!(!report.is_success());
        // The other package is still processed
        assert_eq!(report.extracted_packages(), 1);
    }

    #[test]
    fn test_missing_source_dir_is_engine_error() {
        let dest = TempDir::new().unwrap();
        let result = extract_packages_from(Path::new("/nonexistent/rpms"), dest.path(), "5.10.0");
        assert!(matches!(result, Err(DriverDiskError::IoAt { .. })));
    }

    #[test]
    fn test_packages_are_not_searched_recursively() {
        let src = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        fs::create_dir(src.path().join("nested")).unwrap();
        fs::write(src.path().join("nested/e1000.rpm"), driver_rpm("5.10.0")).unwrap();

        let report = extract_packages_from(src.path(), dest.path(), "5.10.0").unwrap();
        assert!(report.outcomes.is_empty());
    }
}
