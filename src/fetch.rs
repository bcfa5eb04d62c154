//! Retrieval of driver disk images from the network
//!
//! Kickstart sources may name an image on an NFS export or behind an
//! ftp/http(s) URL. Either way the image ends up as a local file that the
//! loader then loop-mounts.

use crate::command::run_command;
use crate::error::{DriverDiskError, Result};
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Network image retrieval.
pub trait ImageFetcher {
    /// Copy the file at `location` (`[options:]host:/path/file`) to `dest`.
    fn fetch_nfs(&mut self, location: &str, dest: &Path) -> Result<()>;
    /// Download `url` to `dest`.
    fn fetch_url(&mut self, url: &str, dest: &Path) -> Result<()>;
}

/// Parsed `[options:]host:/path/file` NFS location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NfsLocation {
    pub options: Option<String>,
    pub host: String,
    pub path: PathBuf,
}

impl NfsLocation {
    pub fn parse(location: &str) -> Result<Self> {
        let invalid = || DriverDiskError::fetch(format!("bad NFS location {:?}", location));

        let split = location.find(":/").ok_or_else(invalid)?;
        let (prefix, path) = (&location[..split], &location[split + 1..]);
        let (options, host) = match prefix.rsplit_once(':') {
            Some((options, host)) => (Some(options.to_string()), host),
            None => (None, prefix),
        };
        if host.is_empty() || path.len() < 2 || path.ends_with('/') {
            return Err(invalid());
        }
        Ok(Self {
            options: options.filter(|o| !o.is_empty()),
            host: host.to_string(),
            path: PathBuf::from(path),
        })
    }

    /// `host:/dir` export holding the file, and the file name.
    fn export_and_file(&self) -> Option<(String, &OsStr)> {
        let dir = self.path.parent()?;
        let file = self.path.file_name()?;
        Some((format!("{}:{}", self.host, dir.display()), file))
    }
}

/// [`ImageFetcher`] using `curl` and an NFS mount
#[derive(Debug, Clone)]
pub struct CommandFetcher {
    nfs_mountpoint: PathBuf,
}

impl Default for CommandFetcher {
    fn default() -> Self {
        Self::new("/tmp/ddnfs")
    }
}

impl CommandFetcher {
    pub fn new(nfs_mountpoint: impl Into<PathBuf>) -> Self {
        Self {
            nfs_mountpoint: nfs_mountpoint.into(),
        }
    }
}

impl ImageFetcher for CommandFetcher {
    fn fetch_nfs(&mut self, location: &str, dest: &Path) -> Result<()> {
        let nfs = NfsLocation::parse(location)?;
        let (export, file) = nfs
            .export_and_file()
            .ok_or_else(|| DriverDiskError::fetch(format!("bad NFS location {:?}", location)))?;

        fs::create_dir_all(&self.nfs_mountpoint)
            .map_err(|e| DriverDiskError::io_at(&self.nfs_mountpoint, e))?;
        let mut options = String::from("ro,nolock");
        if let Some(extra) = &nfs.options {
            options.push(',');
            options.push_str(extra);
        }
        let args = [
            OsStr::new("-t"),
            OsStr::new("nfs"),
            OsStr::new("-o"),
            OsStr::new(&options),
            OsStr::new(&export),
            self.nfs_mountpoint.as_os_str(),
        ];
        run_command("mount", &args)?
            .check(&format!("mounting {}", export))
            .map_err(|e| DriverDiskError::fetch(e.to_string()))?;

        let copied = fs::copy(self.nfs_mountpoint.join(file), dest)
            .map_err(|e| DriverDiskError::fetch(format!("{}: {}", location, e)));

        if let Err(e) = nix::mount::umount(&self.nfs_mountpoint) {
            warn!("Unable to unmount {}: {}", self.nfs_mountpoint.display(), e);
        }
        let bytes = copied?;
        info!("Retrieved {} ({} bytes)", location, bytes);
        Ok(())
    }

    fn fetch_url(&mut self, url: &str, dest: &Path) -> Result<()> {
        let args = [
            OsStr::new("--fail"),
            OsStr::new("--silent"),
            OsStr::new("--show-error"),
            OsStr::new("--location"),
            OsStr::new("--retry"),
            OsStr::new("3"),
            OsStr::new("--output"),
            dest.as_os_str(),
            OsStr::new(url),
        ];
        run_command("curl", &args)?
            .check(&format!("downloading {}", url))
            .map_err(|e| DriverDiskError::fetch(e.to_string()))?;
        info!("Retrieved {}", url);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_location() {
        let nfs = NfsLocation::parse("server.example.com:/exports/dd.img").unwrap();
        assert_eq!(nfs.host, "server.example.com");
        assert_eq!(nfs.path, PathBuf::from("/exports/dd.img"));
        assert_eq!(nfs.options, None);
        let (export, file) = nfs.export_and_file().unwrap();
        assert_eq!(export, "server.example.com:/exports");
        assert_eq!(file, "dd.img");
    }

    #[test]
    fn test_parse_location_with_options() {
        let nfs = NfsLocation::parse("nfsvers=3:10.0.0.1:/dd/disk.img").unwrap();
        assert_eq!(nfs.options.as_deref(), Some("nfsvers=3"));
        assert_eq!(nfs.host, "10.0.0.1");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(NfsLocation::parse("just-a-host").is_err());
        assert!(NfsLocation::parse(":/path/dd.img").is_err());
        assert!(NfsLocation::parse("host:/exports/").is_err());
    }
}
