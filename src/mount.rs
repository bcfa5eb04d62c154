//! Mount and unmount primitives
//!
//! Mounting goes through `mount(8)` so that filesystem type detection and
//! loop setup for image files behave like the rest of the installer.
//! Unmounting uses umount(2) directly because the errno decides whether the
//! loader can continue.

use crate::command::run_command;
use crate::error::{DriverDiskError, Result};
use nix::errno::Errno;
use std::ffi::OsStr;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Why an unmount did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmountError {
    /// Nothing mounted there (EINVAL) or the path is missing (ENOENT)
    NotMounted,
    /// Any other errno; the mountpoint is stuck
    Failed(Errno),
}

impl UnmountError {
    pub fn from_errno(errno: Errno) -> Self {
        match errno {
            Errno::EINVAL | Errno::ENOENT => Self::NotMounted,
            other => Self::Failed(other),
        }
    }
}

/// Mount operations the loader needs.
pub trait Mounter {
    /// Mount `source` (block device or image file) read-only on `target`,
    /// creating `target` if needed.
    fn mount_readonly(&self, source: &Path, target: &Path) -> Result<()>;

    /// Unmount whatever is mounted on `target`.
    fn unmount(&self, target: &Path) -> std::result::Result<(), UnmountError>;
}

/// Unmount `target`, treating "not mounted" as success and anything else as
/// fatal.
pub fn ensure_unmounted(mounter: &dyn Mounter, target: &Path) -> Result<()> {
    match mounter.unmount(target) {
        Ok(()) | Err(UnmountError::NotMounted) => Ok(()),
        Err(UnmountError::Failed(errno)) => Err(DriverDiskError::StuckMount {
            path: target.to_path_buf(),
            errno,
        }),
    }
}

/// Unmount and remove a scratch mountpoint, logging instead of failing.
pub fn release_scratch(mounter: &dyn Mounter, target: &Path) {
    if let Err(UnmountError::Failed(errno)) = mounter.unmount(target) {
        info!("Unable to unmount {}: {}", target.display(), errno);
    }
    match fs::remove_dir(target) {
        Ok(()) => debug!("removed {}", target.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => debug!("leaving {}: {}", target.display(), e),
    }
}

/// [`Mounter`] backed by mount(8) and umount(2)
#[derive(Debug, Clone, Default)]
pub struct SystemMounter;

impl Mounter for SystemMounter {
    fn mount_readonly(&self, source: &Path, target: &Path) -> Result<()> {
        fs::create_dir_all(target).map_err(|e| DriverDiskError::io_at(target, e))?;

        let mut options = String::from("ro");
        if source.is_file() {
            options.push_str(",loop");
        }
        let args = [
            OsStr::new("-o"),
            OsStr::new(&options),
            source.as_os_str(),
            target.as_os_str(),
        ];
        let output = run_command("mount", &args)?;
        if !output.success {
            return Err(DriverDiskError::mount(format!(
                "{} on {}: {}",
                source.display(),
                target.display(),
                output.stderr.trim()
            )));
        }
        info!("Mounted {} on {}", source.display(), target.display());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> std::result::Result<(), UnmountError> {
        nix::mount::umount(target).map_err(UnmountError::from_errno)?;
        info!("Unmounted {}", target.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::path::PathBuf;

    struct Scripted {
        result: std::result::Result<(), UnmountError>,
        calls: RefCell<Vec<PathBuf>>,
    }

    impl Mounter for Scripted {
        fn mount_readonly(&self, _: &Path, _: &Path) -> Result<()> {
            Ok(())
        }

        fn unmount(&self, target: &Path) -> std::result::Result<(), UnmountError> {
            self.calls.borrow_mut().push(target.to_path_buf());
            self.result
        }
    }

    #[test]
    fn test_errno_classification() {
        assert_eq!(UnmountError::from_errno(Errno::EINVAL), UnmountError::NotMounted);
        assert_eq!(UnmountError::from_errno(Errno::ENOENT), UnmountError::NotMounted);
        assert_eq!(
            UnmountError::from_errno(Errno::EBUSY),
            UnmountError::Failed(Errno::EBUSY)
        );
    }

    #[test]
    fn test_ensure_unmounted_tolerates_not_mounted() {
        let mounter = Scripted {
            result: Err(UnmountError::NotMounted),
            calls: RefCell::new(Vec::new()),
        };
        assert!(ensure_unmounted(&mounter, Path::new("/tmp/dpart")).is_ok());
    }

    #[test]
    fn test_ensure_unmounted_busy_is_fatal() {
        let mounter = Scripted {
            result: Err(UnmountError::Failed(Errno::EBUSY)),
            calls: RefCell::new(Vec::new()),
        };
        let err = ensure_unmounted(&mounter, Path::new("/tmp/dpart")).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_release_scratch_removes_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let scratch = dir.path().join("drivers");
        fs::create_dir(&scratch).unwrap();
        let mounter = Scripted {
            result: Ok(()),
            calls: RefCell::new(Vec::new()),
        };
        release_scratch(&mounter, &scratch);
        assert!(!scratch.exists());
        assert_eq!(mounter.calls.borrow().as_slice(), &[scratch]);
    }

    #[test]
    fn test_unmounting_plain_directory_reports_not_mounted() {
        let dir = tempfile::TempDir::new().unwrap();
        // Unprivileged callers get EPERM before the path is looked up
        let missing = dir.path().join("missing");
        let result = SystemMounter.unmount(&missing);
        assert!(matches!(
            result,
            Err(UnmountError::NotMounted) | Err(UnmountError::Failed(Errno::EPERM))
        ));
    }
}
