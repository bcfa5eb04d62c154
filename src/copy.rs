//! Recursive directory copy with caller-visible problems
//!
//! Problems come in two flavours: warnings (something odd that does not stop
//! the copy, such as an entry type we do not copy) and errors (anything that
//! leaves the destination incomplete). Both go to a [`CopyObserver`]; the first
//! error also ends the copy.

use crate::error::{DriverDiskError, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

/// Receives copy problems as they happen.
pub trait CopyObserver {
    fn warning(&mut self, message: &str);
    fn error(&mut self, message: &str);
}

/// Copy the tree below `source` into `destination`, creating it.
pub fn copy_tree(source: &Path, destination: &Path, observer: &mut dyn CopyObserver) -> Result<u64> {
    let mut copied = 0u64;
    let fail = |observer: &mut dyn CopyObserver, message: String| {
        observer.error(&message);
        DriverDiskError::copy(message)
    };

    for entry in WalkDir::new(source).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => return Err(fail(observer, format!("reading {}: {}", source.display(), e))),
        };
        let relative = match entry.path().strip_prefix(source) {
            Ok(relative) => relative,
            Err(_) => continue,
        };
        let target = destination.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            if let Err(e) = fs::create_dir_all(&target) {
                return Err(fail(observer, format!("creating {}: {}", target.display(), e)));
            }
        } else if file_type.is_file() {
            match fs::copy(entry.path(), &target) {
                Ok(bytes) => copied += bytes,
                Err(e) => {
                    return Err(fail(
                        observer,
                        format!("copying {}: {}", entry.path().display(), e),
                    ));
                }
            }
            // Media is often mounted with odd permissions; keep the copy writable
            if let Ok(meta) = fs::metadata(&target) {
                let mode = meta.permissions().mode() | 0o600;
                if let Err(e) = fs::set_permissions(&target, fs::Permissions::from_mode(mode)) {
                    observer.warning(&format!("permissions of {}: {}", target.display(), e));
                }
            }
        } else {
            observer.warning(&format!(
                "skipping special file {}",
                entry.path().display()
            ));
        }
    }

    debug!(
        "copied {} bytes from {} to {}",
        copied,
        source.display(),
        destination.display()
    );
    Ok(copied)
}
