//! Selective cpio (newc) extraction
//!
//! Walks a decompressed payload strictly forward, asks a [`MemberFilter`]
//! about every entry and writes only the accepted ones below a destination
//! root. Entry data always moves through one fixed-size buffer owned by the
//! extractor.

use crate::error::{DriverDiskError, Result};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, trace};

/// Size of the reusable transfer buffer.
pub const BUFFER_SIZE: usize = 8192;

const HEADER_LEN: usize = 110;
const TRAILER: &str = "TRAILER!!!";
const MAX_NAME_LEN: usize = 4096;

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;

/// Per-entry verdict returned by a [`MemberFilter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Extract,
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

/// Metadata decoded from a newc entry header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMetadata {
    pub ino: u32,
    pub mode: u32,
    pub nlink: u32,
    pub mtime: u32,
    pub size: u64,
}

impl EntryMetadata {
    pub fn kind(&self) -> EntryKind {
        match self.mode & S_IFMT {
            S_IFREG => EntryKind::File,
            S_IFDIR => EntryKind::Directory,
            S_IFLNK => EntryKind::Symlink,
            _ => EntryKind::Other,
        }
    }

    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }
}

/// Decides which archive members are written out.
///
/// Filters carry their own parameters; closures work too.
pub trait MemberFilter {
    fn decide(&self, path: &str, meta: &EntryMetadata) -> FilterDecision;
}

impl<F> MemberFilter for F
where
    F: Fn(&str, &EntryMetadata) -> FilterDecision,
{
    fn decide(&self, path: &str, meta: &EntryMetadata) -> FilterDecision {
        self(path, meta)
    }
}

/// What an extraction run wrote.
#[derive(Debug, Default, Clone)]
pub struct ExtractSummary {
    pub entries_seen: usize,
    /// Relative paths written, in archive order
    pub extracted: Vec<PathBuf>,
}

/// Streaming newc extractor with a reusable transfer buffer.
pub struct ArchiveExtractor {
    buffer: Box<[u8]>,
}

impl Default for ArchiveExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveExtractor {
    pub fn new() -> Self {
        Self {
            buffer: vec![0u8; BUFFER_SIZE].into_boxed_slice(),
        }
    }

    /// Extract every member `filter` accepts from `stream` into `destination`.
    ///
    /// Succeeds only when the trailer was reached and the rest of the stream
    /// drained cleanly. Any failure to create a path or write content aborts.
    pub fn extract<R, F>(
        &mut self,
        mut stream: R,
        destination: &Path,
        filter: &F,
    ) -> Result<ExtractSummary>
    where
        R: Read,
        F: MemberFilter + ?Sized,
    {
        let mut summary = ExtractSummary::default();
        // Hard-link names waiting for the member that carries the data
        let mut pending_links: HashMap<u32, Vec<PathBuf>> = HashMap::new();

        loop {
            let (name, meta) = read_entry_header(&mut stream)?;
            if name == TRAILER {
                break;
            }
            summary.entries_seen += 1;

            let decision = filter.decide(&name, &meta);
            if decision == FilterDecision::Skip {
                // A rejected member may still carry data for accepted links
                let carries_links =
                    meta.kind() == EntryKind::File && meta.nlink > 1 && meta.size > 0;
                if carries_links {
                    if let Some(links) = pending_links.remove(&meta.ino) {
                        trace!("{} holds the data of {} accepted link(s)", name, links.len());
                        self.write_link_group(&mut stream, destination, &links, &meta)?;
                        continue;
                    }
                }
                trace!("skip {}", name);
                self.discard(&mut stream, padded(meta.size))?;
                continue;
            }

            let relative = sanitize(&name)?;
            let target = resolve_target(destination, &relative)?;
            debug!("extract {} -> {}", name, target.display());

            match meta.kind() {
                EntryKind::Directory => {
                    fs::create_dir_all(&target).map_err(|e| DriverDiskError::io_at(&target, e))?;
                    self.discard(&mut stream, padded(meta.size))?;
                }
                EntryKind::Symlink => {
                    let link_target = self.read_small(&mut stream, meta.size)?;
                    self.discard(&mut stream, padding(meta.size))?;
                    create_parent(&target)?;
                    remove_existing(&target)?;
                    std::os::unix::fs::symlink(&link_target, &target)
                        .map_err(|e| DriverDiskError::io_at(&target, e))?;
                }
                EntryKind::File if meta.nlink > 1 && meta.size == 0 => {
                    // Data arrives with a later member of the same inode
                    pending_links.entry(meta.ino).or_default().push(relative.clone());
                }
                EntryKind::File => {
                    let mut group = pending_links.remove(&meta.ino).unwrap_or_default();
                    group.insert(0, relative.clone());
                    self.write_link_group(&mut stream, destination, &group, &meta)?;
                }
                EntryKind::Other => {
                    debug!("{}: unsupported entry type {:o}, skipping", name, meta.mode);
                    self.discard(&mut stream, padded(meta.size))?;
                    continue;
                }
            }
            summary.extracted.push(relative);
        }

        // Links whose data never showed up are empty files
        for (_, links) in pending_links {
            for link in links {
                let link = resolve_target(destination, &link)?;
                create_parent(&link)?;
                remove_existing(&link)?;
                File::create(&link).map_err(|e| DriverDiskError::io_at(&link, e))?;
            }
        }

        // Consume the rest so decoder checksums get verified
        loop {
            match stream.read(&mut self.buffer) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    return Err(DriverDiskError::archive(format!(
                        "payload decode error after trailer: {}",
                        e
                    )));
                }
            }
        }

        Ok(summary)
    }

    /// Write the member data to the first name of a hard-link group and link
    /// the remaining names to it.
    fn write_link_group<R: Read>(
        &mut self,
        stream: &mut R,
        destination: &Path,
        group: &[PathBuf],
        meta: &EntryMetadata,
    ) -> Result<()> {
        let Some((first, rest)) = group.split_first() else {
            return self.discard(stream, padded(meta.size));
        };
        let target = resolve_target(destination, first)?;
        create_parent(&target)?;
        self.write_file(stream, &target, meta)?;
        self.discard(stream, padding(meta.size))?;

        for link in rest {
            let link = resolve_target(destination, link)?;
            create_parent(&link)?;
            remove_existing(&link)?;
            fs::hard_link(&target, &link).map_err(|e| DriverDiskError::io_at(&link, e))?;
        }
        Ok(())
    }

    fn write_file<R: Read>(&mut self, stream: &mut R, target: &Path, meta: &EntryMetadata) -> Result<()> {
        remove_existing(target)?;
        let mut out = File::create(target).map_err(|e| DriverDiskError::io_at(target, e))?;

        let mut remaining = meta.size;
        while remaining > 0 {
            let chunk = remaining.min(self.buffer.len() as u64) as usize;
            stream
                .read_exact(&mut self.buffer[..chunk])
                .map_err(|e| truncated(&format!("data of {}", target.display()), e))?;
            out.write_all(&self.buffer[..chunk])
                .map_err(|e| DriverDiskError::io_at(target, e))?;
            remaining -= chunk as u64;
        }

        fs::set_permissions(target, fs::Permissions::from_mode(meta.permissions()))
            .map_err(|e| DriverDiskError::io_at(target, e))
    }

    fn read_small<R: Read>(&mut self, stream: &mut R, size: u64) -> Result<String> {
        let len = usize::try_from(size)
            .ok()
            .filter(|&len| len <= self.buffer.len())
            .ok_or_else(|| DriverDiskError::archive(format!("symlink target of {} bytes", size)))?;
        stream
            .read_exact(&mut self.buffer[..len])
            .map_err(|e| truncated("symlink target", e))?;
        Ok(String::from_utf8_lossy(&self.buffer[..len]).into_owned())
    }

    fn discard<R: Read>(&mut self, stream: &mut R, mut len: u64) -> Result<()> {
        while len > 0 {
            let chunk = len.min(self.buffer.len() as u64) as usize;
            stream
                .read_exact(&mut self.buffer[..chunk])
                .map_err(|e| truncated("entry data", e))?;
            len -= chunk as u64;
        }
        Ok(())
    }
}

fn read_entry_header<R: Read>(stream: &mut R) -> Result<(String, EntryMetadata)> {
    let mut header = [0u8; HEADER_LEN];
    stream
        .read_exact(&mut header)
        .map_err(|e| truncated("entry header (missing trailer?)", e))?;

    let magic = &header[..6];
    if magic != b"070701" && magic != b"070702" {
        return Err(DriverDiskError::archive(format!(
            "bad entry magic {:?}",
            String::from_utf8_lossy(magic)
        )));
    }

    let field = |index: usize| -> Result<u32> {
        let start = 6 + index * 8;
        let text = std::str::from_utf8(&header[start..start + 8])
            .map_err(|_| DriverDiskError::archive("non-ASCII header field"))?;
        u32::from_str_radix(text, 16)
            .map_err(|_| DriverDiskError::archive(format!("bad header field {:?}", text)))
    };

    let meta = EntryMetadata {
        ino: field(0)?,
        mode: field(1)?,
        nlink: field(4)?,
        mtime: field(5)?,
        size: u64::from(field(6)?),
    };
    let namesize = field(11)? as usize;
    if namesize == 0 || namesize > MAX_NAME_LEN {
        return Err(DriverDiskError::archive(format!("bad name size {}", namesize)));
    }

    let mut name = vec![0u8; namesize];
    stream
        .read_exact(&mut name)
        .map_err(|e| truncated("entry name", e))?;
    let name_pad = (4 - (HEADER_LEN + namesize) % 4) % 4;
    let mut pad = [0u8; 4];
    stream
        .read_exact(&mut pad[..name_pad])
        .map_err(|e| truncated("name padding", e))?;

    // Name size counts the terminating NUL
    name.truncate(namesize - 1);
    let name = String::from_utf8(name)
        .map_err(|_| DriverDiskError::archive("entry name is not UTF-8"))?;
    Ok((name, meta))
}

/// Relative path below the destination root; rejects escapes.
fn sanitize(name: &str) -> Result<PathBuf> {
    let mut relative = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(DriverDiskError::archive(format!(
                    "entry {:?} escapes the destination",
                    name
                )));
            }
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(DriverDiskError::archive(format!("entry {:?} has no path", name)));
    }
    Ok(relative)
}

/// Full path of `relative` below `destination`.
///
/// Refuses members whose parent directories include a symlink, so nothing an
/// earlier member linked can redirect a write outside the destination.
fn resolve_target(destination: &Path, relative: &Path) -> Result<PathBuf> {
    if let Some(parent) = relative.parent() {
        let mut ancestor = destination.to_path_buf();
        for component in parent.components() {
            ancestor.push(component);
            match fs::symlink_metadata(&ancestor) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    return Err(DriverDiskError::archive(format!(
                        "entry {} passes through symlink {}",
                        relative.display(),
                        ancestor.display()
                    )));
                }
                Ok(_) => {}
                // Nothing deeper exists yet
                Err(_) => break,
            }
        }
    }
    Ok(destination.join(relative))
}

fn padding(size: u64) -> u64 {
    (4 - size % 4) % 4
}

fn padded(size: u64) -> u64 {
    size + padding(size)
}

fn truncated(what: &str, e: io::Error) -> DriverDiskError {
    DriverDiskError::archive(format!("truncated {}: {}", what, e))
}

fn create_parent(target: &Path) -> Result<()> {
    match target.parent() {
        Some(parent) => {
            fs::create_dir_all(parent).map_err(|e| DriverDiskError::io_at(parent, e))
        }
        None => Ok(()),
    }
}

fn remove_existing(target: &Path) -> Result<()> {
    match fs::symlink_metadata(target) {
        Ok(meta) if !meta.is_dir() => {
            fs::remove_file(target).map_err(|e| DriverDiskError::io_at(target, e))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::CpioBuilder;
    use crate::unpack::DriverPayloadFilter;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn accept_all(_: &str, _: &EntryMetadata) -> FilterDecision {
        FilterDecision::Extract
    }

    fn extract_with<F: MemberFilter>(archive: Vec<u8>, filter: &F) -> (TempDir, Result<ExtractSummary>) {
        let dest = TempDir::new().unwrap();
        let result = ArchiveExtractor::new().extract(Cursor::new(archive), dest.path(), filter);
        (dest, result)
    }

    #[test]
    fn test_extracts_files_with_parents() {
        let archive = CpioBuilder::new()
            .file("./lib/modules/5.10.0/extra/e1000.ko", b"ELF module")
            .file("./lib/firmware/e1000/fw.bin", b"\x00\x01\x02")
            .finish();

        let (dest, result) = extract_with(archive, &accept_all);
        let summary = result.unwrap();
        assert_eq!(summary.entries_seen, 2);
        assert_eq!(
            fs::read(dest.path().join("lib/modules/5.10.0/extra/e1000.ko")).unwrap(),
            b"ELF module"
        );
        assert_eq!(
            fs::read(dest.path().join("lib/firmware/e1000/fw.bin")).unwrap(),
            b"\x00\x01\x02"
        );
    }

    #[test]
    fn test_filter_skips_members() {
        let archive = CpioBuilder::new()
            .file("./usr/share/doc/README", b"docs")
            .file("./keep.ko", b"module")
            .finish();

        let only_modules = |path: &str, _: &EntryMetadata| {
            if path.ends_with(".ko") {
                FilterDecision::Extract
            } else {
                FilterDecision::Skip
            }
        };
        let (dest, result) = extract_with(archive, &only_modules);
        let summary = result.unwrap();
        assert_eq!(summary.extracted, vec![PathBuf::from("keep.ko")]);
        assert!(!dest.path().join("usr").exists());
    }

    #[test]
    fn test_data_larger_than_buffer() {
        let big: Vec<u8> = (0..BUFFER_SIZE * 3 + 17).map(|i| (i % 251) as u8).collect();
        let archive = CpioBuilder::new().file("big.bin", &big).finish();

        let (dest, result) = extract_with(archive, &accept_all);
        result.unwrap();
        assert_eq!(fs::read(dest.path().join("big.bin")).unwrap(), big);
    }

    #[test]
    fn test_preserves_mode_bits() {
        let archive = CpioBuilder::new().executable("bin/tool", b"#!/bin/sh\n").finish();
        let (dest, result) = extract_with(archive, &accept_all);
        result.unwrap();
        let mode = fs::metadata(dest.path().join("bin/tool")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn test_symlinks_and_directories() {
        let archive = CpioBuilder::new()
            .dir("./lib/firmware/vendor")
            .file("./lib/firmware/vendor/fw-1.bin", b"fw")
            .symlink("./lib/firmware/vendor/fw.bin", "fw-1.bin")
            .finish();
        let (dest, result) = extract_with(archive, &accept_all);
        result.unwrap();

        let link = dest.path().join("lib/firmware/vendor/fw.bin");
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("fw-1.bin"));
        assert_eq!(fs::read(&link).unwrap(), b"fw");
    }

    #[test]
    fn test_hardlink_group() {
        let archive = CpioBuilder::new()
            .hardlinks(&["a/one.ko", "b/two.ko"], b"shared")
            .finish();
        let (dest, result) = extract_with(archive, &accept_all);
        result.unwrap();
        assert_eq!(fs::read(dest.path().join("a/one.ko")).unwrap(), b"shared");
        assert_eq!(fs::read(dest.path().join("b/two.ko")).unwrap(), b"shared");
    }

    #[test]
    fn test_hardlink_data_kept_when_data_member_rejected() {
        let archive = CpioBuilder::new()
            .hardlinks(&["a/one.ko", "a/one.txt"], b"module bytes")
            .finish();
        let (dest, result) = extract_with(archive, &DriverPayloadFilter);
        let summary = result.unwrap();
        assert_eq!(summary.extracted, vec![PathBuf::from("a/one.ko")]);
        assert_eq!(fs::read(dest.path().join("a/one.ko")).unwrap(), b"module bytes");
        assert!(!dest.path().join("a/one.txt").exists());
    }

    #[test]
    fn test_hardlink_group_with_several_accepted_names() {
        let archive = CpioBuilder::new()
            .hardlinks(&["a/one.ko", "b/two.ko", "doc/one.txt"], b"shared")
            .finish();
        let (dest, result) = extract_with(archive, &DriverPayloadFilter);
        result.unwrap();
        assert_eq!(fs::read(dest.path().join("a/one.ko")).unwrap(), b"shared");
        assert_eq!(fs::read(dest.path().join("b/two.ko")).unwrap(), b"shared");
        assert!(!dest.path().join("doc").exists());
    }

    #[test]
    fn test_write_through_symlinked_directory_rejected() {
        let outside = TempDir::new().unwrap();
        let archive = CpioBuilder::new()
            .symlink("./lib/firmware/evil", outside.path().to_str().unwrap())
            .file("./lib/firmware/evil/pwned.bin", b"owned")
            .finish();

        let (_dest, result) = extract_with(archive, &DriverPayloadFilter);
        assert!(matches!(result, Err(DriverDiskError::Archive(_))));
        assert!(!outside.path().join("pwned.bin").exists());
    }

    #[test]
    fn test_relative_symlink_escape_rejected() {
        let archive = CpioBuilder::new()
            .symlink("lib/firmware/up", "../../..")
            .file("lib/firmware/up/escaped.bin", b"x")
            .finish();
        let (dest, result) = extract_with(archive, &accept_all);
        assert!(matches!(result, Err(DriverDiskError::Archive(_))));
        assert!(!dest.path().parent().unwrap().join("escaped.bin").exists());
    }

    #[test]
    fn test_missing_trailer_is_archive_error() {
        let archive = CpioBuilder::new().file("x.ko", b"data").finish_without_trailer();
        let (_dest, result) = extract_with(archive, &accept_all);
        assert!(matches!(result, Err(DriverDiskError::Archive(_))));
    }

    #[test]
    fn test_bad_magic_is_archive_error() {
        let mut archive = CpioBuilder::new().file("x.ko", b"data").finish();
        archive[0] = b'9';
        let (_dest, result) = extract_with(archive, &accept_all);
        assert!(matches!(result, Err(DriverDiskError::Archive(_))));
    }

    #[test]
    fn test_path_escape_rejected() {
        let archive = CpioBuilder::new().file("../../etc/passwd", b"root").finish();
        let (_dest, result) = extract_with(archive, &accept_all);
        assert!(matches!(result, Err(DriverDiskError::Archive(_))));
    }

    #[test]
    fn test_unwritable_destination_is_hard_error() {
        let dest = TempDir::new().unwrap();
        // A regular file where a directory is needed
        fs::write(dest.path().join("lib"), b"not a dir").unwrap();
        let archive = CpioBuilder::new().file("lib/firmware/a.bin", b"a").finish();

        let result =
            ArchiveExtractor::new().extract(Cursor::new(archive), dest.path(), &accept_all);
        assert!(matches!(result, Err(DriverDiskError::IoAt { .. })));
    }

    #[test]
    fn test_sanitize_strips_prefixes() {
        assert_eq!(sanitize("./lib/x.ko").unwrap(), PathBuf::from("lib/x.ko"));
        assert_eq!(sanitize("/lib/x.ko").unwrap(), PathBuf::from("lib/x.ko"));
        assert!(sanitize(".").is_err());
    }
}
