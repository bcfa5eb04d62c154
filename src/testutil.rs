//! Test fixtures: in-memory RPM and cpio builders, and a fake system to run
//! the acquisition flow against.

use crate::config::{LoaderConfig, ProductIdentity};
use crate::devices::{DeviceClass, DeviceProbe};
use crate::disk::{DiskCounter, Installer, StagingLayout, Verifier};
use crate::error::{DriverDiskError, Result};
use crate::fetch::ImageFetcher;
use crate::context::LoaderContext;
use crate::modules::{
    FirmwareSearch, ManualChoice, ManualDriverChooser, ModuleDatabase, ModuleSnapshot,
    ModuleSubsystem,
};
use crate::mount::{Mounter, UnmountError};
use crate::prompt::Prompter;
use nix::errno::Errno;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::io::Write;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tempfile::TempDir;

const NEWC_MAGIC: &str = "070701";

struct Member {
    name: String,
    mode: u32,
    ino: u32,
    nlink: u32,
    data: Vec<u8>,
}

/// Builds a cpio newc archive.
pub struct CpioBuilder {
    members: Vec<Member>,
    next_ino: u32,
}

impl CpioBuilder {
    pub fn new() -> Self {
        Self {
            members: Vec::new(),
            next_ino: 1,
        }
    }

    fn push(&mut self, name: &str, mode: u32, data: &[u8]) {
        let ino = self.next_ino;
        self.next_ino += 1;
        self.members.push(Member {
            name: name.to_string(),
            mode,
            ino,
            nlink: 1,
            data: data.to_vec(),
        });
    }

    pub fn file(mut self, name: &str, data: &[u8]) -> Self {
        self.push(name, 0o100644, data);
        self
    }

    pub fn executable(mut self, name: &str, data: &[u8]) -> Self {
        self.push(name, 0o100755, data);
        self
    }

    pub fn dir(mut self, name: &str) -> Self {
        self.push(name, 0o040755, b"");
        self
    }

    pub fn symlink(mut self, name: &str, target: &str) -> Self {
        self.push(name, 0o120777, target.as_bytes());
        self
    }

    /// Hard-link group: data is stored with the last name only, as newc does.
    pub fn hardlinks(mut self, names: &[&str], data: &[u8]) -> Self {
        let ino = self.next_ino;
        self.next_ino += 1;
        for (i, name) in names.iter().enumerate() {
            let last = i + 1 == names.len();
            self.members.push(Member {
                name: name.to_string(),
                mode: 0o100644,
                ino,
                nlink: names.len() as u32,
                data: if last { data.to_vec() } else { Vec::new() },
            });
        }
        self
    }

    pub fn finish(self) -> Vec<u8> {
        let mut out = self.finish_without_trailer();
        write_entry(&mut out, "TRAILER!!!", 0, 0, 1, b"");
        out
    }

    pub fn finish_without_trailer(self) -> Vec<u8> {
        let mut out = Vec::new();
        for m in &self.members {
            write_entry(&mut out, &m.name, m.mode, m.ino, m.nlink, &m.data);
        }
        out
    }
}

fn write_entry(out: &mut Vec<u8>, name: &str, mode: u32, ino: u32, nlink: u32, data: &[u8]) {
    let namesize = name.len() + 1;
    let header = format!(
        "{}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}",
        NEWC_MAGIC,
        ino,
        mode,
        0,
        0,
        nlink,
        0,
        data.len(),
        0,
        0,
        0,
        0,
        namesize,
        0
    );
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(name.as_bytes());
    out.push(0);
    pad4(out);
    out.extend_from_slice(data);
    pad4(out);
}

fn pad4(out: &mut Vec<u8>) {
    while out.len() % 4 != 0 {
        out.push(0);
    }
}

/// Builds a minimal RPM: lead, one-entry signature header, main header and
/// a compressed payload.
pub struct RpmBuilder {
    name: String,
    provides: Vec<(String, Option<String>)>,
    requires: Vec<(String, String)>,
    compressor: Option<String>,
    payload: Vec<u8>,
}

impl RpmBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            provides: Vec::new(),
            requires: Vec::new(),
            compressor: Some("gzip".to_string()),
            payload: CpioBuilder::new().finish(),
        }
    }

    pub fn provides(mut self, name: &str, version: &str) -> Self {
        self.provides
            .push((name.to_string(), Some(version.to_string())));
        self
    }

    pub fn provides_unversioned(mut self, name: &str) -> Self {
        self.provides.push((name.to_string(), None));
        self
    }

    pub fn requires(mut self, name: &str, version: &str) -> Self {
        self.requires.push((name.to_string(), version.to_string()));
        self
    }

    pub fn compressor(mut self, compressor: &str) -> Self {
        self.compressor = Some(compressor.to_string());
        self
    }

    pub fn without_compressor_tag(mut self) -> Self {
        self.compressor = None;
        self
    }

    /// Uncompressed cpio archive to embed.
    pub fn payload(mut self, cpio: Vec<u8>) -> Self {
        self.payload = cpio;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut out = lead(&self.name);

        let payload = compress(&self.payload, self.compressor.as_deref());

        // SIGTAG_SIZE leaves a 20-byte signature store, forcing 4 pad bytes.
        let signature = encode_header(&[(1000, Value::Int32(vec![payload.len() as u32]))]);
        out.extend_from_slice(&signature);
        while out.len() % 8 != 0 {
            out.push(0);
        }

        let mut entries = vec![
            (1000, Value::String(self.name.clone())),
            (1001, Value::String("1.0".to_string())),
            (1124, Value::String("cpio".to_string())),
        ];
        if let Some(compressor) = &self.compressor {
            entries.push((1125, Value::String(compressor.clone())));
        }
        if !self.provides.is_empty() {
            entries.push((
                1047,
                Value::StringArray(self.provides.iter().map(|(n, _)| n.clone()).collect()),
            ));
            let versions: Vec<String> = self
                .provides
                .iter()
                .map_while(|(_, v)| v.clone())
                .collect();
            if !versions.is_empty() {
                entries.push((1113, Value::StringArray(versions)));
            }
        }
        if !self.requires.is_empty() {
            entries.push((
                1049,
                Value::StringArray(self.requires.iter().map(|(n, _)| n.clone()).collect()),
            ));
            entries.push((
                1050,
                Value::StringArray(self.requires.iter().map(|(_, v)| v.clone()).collect()),
            ));
        }
        out.extend_from_slice(&encode_header(&entries));
        out.extend_from_slice(&payload);
        out
    }
}

fn lead(name: &str) -> Vec<u8> {
    let mut lead = vec![0xed, 0xab, 0xee, 0xdb, 3, 0];
    lead.extend_from_slice(&0u16.to_be_bytes());
    lead.extend_from_slice(&1u16.to_be_bytes());
    let mut pkg_name = [0u8; 66];
    for (slot, byte) in pkg_name.iter_mut().zip(name.bytes().take(65)) {
        *slot = byte;
    }
    lead.extend_from_slice(&pkg_name);
    lead.extend_from_slice(&1u16.to_be_bytes());
    lead.extend_from_slice(&5u16.to_be_bytes());
    lead.extend_from_slice(&[0u8; 16]);
    assert_eq!(lead.len(), 96);
    lead
}

enum Value {
    Int32(Vec<u32>),
    String(String),
    StringArray(Vec<String>),
}

fn encode_header(entries: &[(u32, Value)]) -> Vec<u8> {
    let mut index = Vec::new();
    let mut store: Vec<u8> = Vec::new();

    for (tag, value) in entries {
        let (kind, count) = match value {
            Value::Int32(v) => {
                while store.len() % 4 != 0 {
                    store.push(0);
                }
                (4u32, v.len())
            }
            Value::String(_) => (6u32, 1),
            Value::StringArray(v) => (8u32, v.len()),
        };
        let offset = store.len() as u32;
        match value {
            Value::Int32(v) => v.iter().for_each(|n| store.extend_from_slice(&n.to_be_bytes())),
            Value::String(s) => {
                store.extend_from_slice(s.as_bytes());
                store.push(0);
            }
            Value::StringArray(v) => {
                for s in v {
                    store.extend_from_slice(s.as_bytes());
                    store.push(0);
                }
            }
        }
        index.extend_from_slice(&tag.to_be_bytes());
        index.extend_from_slice(&kind.to_be_bytes());
        index.extend_from_slice(&offset.to_be_bytes());
        index.extend_from_slice(&(count as u32).to_be_bytes());
    }

    let mut out = vec![0x8e, 0xad, 0xe8, 0x01, 0, 0, 0, 0];
    out.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    out.extend_from_slice(&(store.len() as u32).to_be_bytes());
    out.extend_from_slice(&index);
    out.extend_from_slice(&store);
    out
}

fn compress(data: &[u8], compressor: Option<&str>) -> Vec<u8> {
    match compressor {
        None | Some("gzip") => {
            let mut enc =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(data).unwrap();
            enc.finish().unwrap()
        }
        Some("bzip2") => {
            let mut enc = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
            enc.write_all(data).unwrap();
            enc.finish().unwrap()
        }
        Some("xz") => {
            let mut enc = xz2::write::XzEncoder::new(Vec::new(), 6);
            enc.write_all(data).unwrap();
            enc.finish().unwrap()
        }
        Some("zstd") => zstd::stream::encode_all(data, 3).unwrap(),
        Some(_) => data.to_vec(),
    }
}

// ==================== Fake system ====================

pub const TEST_KERNEL: &str = "5.10.0-test";

/// Scripted answer for the next prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    Confirm(bool),
    Menu(Option<usize>),
    Ternary(usize),
    File(Option<PathBuf>),
}

/// Shared record of everything the fakes saw, plus their scripted behaviour.
#[derive(Debug, Default)]
pub struct Journal {
    pub events: Vec<String>,
    pub answers: VecDeque<Answer>,

    /// target -> source of every live fake mount
    pub mounted: BTreeMap<PathBuf, PathBuf>,
    /// targets mounted while something was already mounted there
    pub overmounts: Vec<PathBuf>,
    pub stuck: BTreeSet<PathBuf>,
    pub failing_mounts: BTreeSet<PathBuf>,

    pub devices: Vec<String>,
    pub partitions: BTreeMap<String, Vec<String>>,
    pub device_counts: VecDeque<usize>,
    pub labelled: Vec<String>,

    pub snapshots: VecDeque<ModuleSnapshot>,
    pub manual: VecDeque<ManualChoice>,
    /// remote location -> fixture directory standing in for the image
    pub remote: BTreeMap<String, PathBuf>,
}

impl Journal {
    fn log(&mut self, event: impl Into<String>) {
        self.events.push(event.into());
    }

    fn answer(&mut self, kind: &str) -> Answer {
        match self.answers.pop_front() {
            Some(answer) => answer,
            None => panic!("no scripted answer left for {}", kind),
        }
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events.iter().filter(|e| e.starts_with(prefix)).count()
    }
}

type Shared = Rc<RefCell<Journal>>;

pub struct ScriptedPrompter(Shared);

impl Prompter for ScriptedPrompter {
    fn message(&mut self, title: &str, text: &str) -> Result<()> {
        self.0.borrow_mut().log(format!("message:{}:{}", title, text));
        Ok(())
    }

    fn confirm(&mut self, title: &str, _text: &str, _accept: &str, _decline: &str) -> Result<bool> {
        let mut journal = self.0.borrow_mut();
        journal.log(format!("confirm:{}", title));
        match journal.answer("confirm") {
            Answer::Confirm(yes) => Ok(yes),
            other => panic!("confirm {:?} got {:?}", title, other),
        }
    }

    fn menu(
        &mut self,
        title: &str,
        _text: &str,
        items: &[String],
        back_label: &str,
    ) -> Result<Option<usize>> {
        let mut journal = self.0.borrow_mut();
        journal.log(format!("menu:{}:{}:{}", title, back_label, items.join(",")));
        match journal.answer("menu") {
            Answer::Menu(choice) => Ok(choice),
            other => panic!("menu {:?} got {:?}", title, other),
        }
    }

    fn ternary(&mut self, title: &str, _text: &str, _buttons: [&str; 3]) -> Result<usize> {
        let mut journal = self.0.borrow_mut();
        journal.log(format!("ternary:{}", title));
        match journal.answer("ternary") {
            Answer::Ternary(choice) => Ok(choice),
            other => panic!("ternary {:?} got {:?}", title, other),
        }
    }

    fn select_file(&mut self, title: &str, _text: &str, root: &Path) -> Result<Option<PathBuf>> {
        let mut journal = self.0.borrow_mut();
        journal.log(format!("select_file:{}", root.display()));
        match journal.answer("select_file") {
            Answer::File(file) => Ok(file),
            other => panic!("select_file {:?} got {:?}", title, other),
        }
    }

    fn status(&mut self, title: &str, _text: &str) -> Result<()> {
        self.0.borrow_mut().log(format!("status:{}", title));
        Ok(())
    }
}

pub struct FakeDevices {
    journal: Shared,
    dev_root: PathBuf,
}

impl DeviceProbe for FakeDevices {
    fn candidate_devices(&self) -> Result<Vec<String>> {
        Ok(self.journal.borrow().devices.clone())
    }

    fn partitions(&self, device: &str) -> Result<Vec<String>> {
        Ok(self
            .journal
            .borrow()
            .partitions
            .get(device)
            .cloned()
            .unwrap_or_default())
    }

    fn count_devices(&self, _class: DeviceClass) -> usize {
        self.journal.borrow_mut().device_counts.pop_front().unwrap_or(0)
    }

    fn devices_with_label(&self, _label: &str) -> Result<Vec<String>> {
        Ok(self.journal.borrow().labelled.clone())
    }

    fn device_node(&self, name: &str) -> PathBuf {
        self.dev_root.join(name)
    }
}

/// "Mounts" by pointing the target at the source with a symlink.
pub struct FakeMounter(Shared);

impl Mounter for FakeMounter {
    fn mount_readonly(&self, source: &Path, target: &Path) -> Result<()> {
        let mut journal = self.0.borrow_mut();
        journal.log(format!("mount:{}->{}", source.display(), target.display()));
        if journal.mounted.contains_key(target) {
            journal.overmounts.push(target.to_path_buf());
        }
        if journal.failing_mounts.contains(source) || !source.exists() {
            return Err(DriverDiskError::mount(format!("{} has no medium", source.display())));
        }

        if let Ok(meta) = fs::symlink_metadata(target) {
            if meta.file_type().is_symlink() {
                fs::remove_file(target)?;
            } else {
                fs::remove_dir(target)?;
            }
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        symlink(source, target)?;
        journal.mounted.insert(target.to_path_buf(), source.to_path_buf());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> std::result::Result<(), UnmountError> {
        let mut journal = self.0.borrow_mut();
        journal.log(format!("unmount:{}", target.display()));
        if journal.stuck.contains(target) {
            return Err(UnmountError::Failed(Errno::EBUSY));
        }
        match journal.mounted.remove(target) {
            None => Err(UnmountError::NotMounted),
            Some(_) => {
                let _ = fs::remove_file(target);
                let _ = fs::create_dir(target);
                Ok(())
            }
        }
    }
}

pub struct FakeModules(Shared);

impl ModuleSubsystem for FakeModules {
    fn snapshot(&self) -> Result<ModuleSnapshot> {
        Ok(self.0.borrow_mut().snapshots.pop_front().unwrap_or_default())
    }

    fn restore_state(&mut self) -> Result<()> {
        self.0.borrow_mut().log("restore_state");
        Ok(())
    }

    fn bus_probe(&mut self) -> Result<()> {
        self.0.borrow_mut().log("bus_probe");
        Ok(())
    }
}

pub struct FakeManual(Shared);

impl ManualDriverChooser for FakeManual {
    fn choose(&mut self, class: DeviceClass, _prompter: &mut dyn Prompter) -> Result<ManualChoice> {
        let mut journal = self.0.borrow_mut();
        journal.log(format!("manual:{}", class));
        Ok(journal.manual.pop_front().unwrap_or(ManualChoice::Back))
    }
}

pub struct FakeFetcher(Shared);

impl FakeFetcher {
    fn fetch(&self, location: &str, dest: &Path) -> Result<()> {
        let journal = self.0.borrow();
        let fixture = journal
            .remote
            .get(location)
            .ok_or_else(|| DriverDiskError::fetch(format!("{} not found", location)))?;
        symlink(fixture, dest)?;
        Ok(())
    }
}

impl ImageFetcher for FakeFetcher {
    fn fetch_nfs(&mut self, location: &str, dest: &Path) -> Result<()> {
        self.0.borrow_mut().log(format!("fetch_nfs:{}", location));
        self.fetch(location, dest)
    }

    fn fetch_url(&mut self, url: &str, dest: &Path) -> Result<()> {
        self.0.borrow_mut().log(format!("fetch_url:{}", url));
        self.fetch(url, dest)
    }
}

struct FakeDatabase(Shared);

impl ModuleDatabase for FakeDatabase {
    fn refresh(&self) -> Result<()> {
        self.0.borrow_mut().log("depmod");
        Ok(())
    }
}

struct FakeFirmware(Shared);

impl FirmwareSearch for FakeFirmware {
    fn add_search_dir(&mut self, dir: &Path) {
        self.0.borrow_mut().log(format!("firmware:{}", dir.display()));
    }

    fn restart(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A [`LoaderContext`] whose collaborators are all fakes rooted in a
/// temporary directory.
pub struct FakeSystem {
    pub tmp: TempDir,
    pub journal: Shared,
    pub ctx: LoaderContext,
}

impl FakeSystem {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let journal: Shared = Rc::new(RefCell::new(Journal::default()));

        let config = LoaderConfig {
            product_name: Some("TestOS".to_string()),
            product_arch: Some("x86_64".to_string()),
            buildstamp: root.join(".buildstamp"),
            partition_mountpoint: root.join("dpart"),
            drivers_mountpoint: root.join("drivers"),
            staging_dir: root.join("DD"),
            modules_root: root.join("lib/modules"),
            download_path: root.join("dd.img"),
            boot_image: root.join("boot/dd.img"),
            log_file: None,
            ..LoaderConfig::default()
        };
        let product = ProductIdentity {
            name: "TestOS".to_string(),
            arch: "x86_64".to_string(),
        };
        let installer = Installer::new(
            StagingLayout::new(&config.staging_dir),
            &config.modules_root,
            TEST_KERNEL,
            Box::new(FakeDatabase(journal.clone())),
            Box::new(FakeFirmware(journal.clone())),
        );

        let ctx = LoaderContext {
            verifier: Verifier::from_config(&config, &product),
            installer,
            config,
            product,
            prompter: Box::new(ScriptedPrompter(journal.clone())),
            devices: Box::new(FakeDevices {
                journal: journal.clone(),
                dev_root: root.join("dev"),
            }),
            mounter: Box::new(FakeMounter(journal.clone())),
            modules: Box::new(FakeModules(journal.clone())),
            manual: Box::new(FakeManual(journal.clone())),
            fetcher: Box::new(FakeFetcher(journal.clone())),
            counter: DiskCounter::new(),
        };
        Self { tmp, journal, ctx }
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.tmp.path().join(relative)
    }

    /// Write a valid driver disk tree at `<tmp>/<relative>`.
    pub fn disk_at(&self, relative: &str) -> PathBuf {
        let root = self.path(relative);
        write_driver_disk(&root);
        root
    }

    pub fn script(&self, answers: impl IntoIterator<Item = Answer>) {
        self.journal.borrow_mut().answers.extend(answers);
    }

    pub fn events(&self) -> Vec<String> {
        self.journal.borrow().events.clone()
    }
}

/// Driver disk tree with one package carrying a module and a firmware blob
/// for [`TEST_KERNEL`].
pub fn write_driver_disk(root: &Path) {
    let rpms = root.join("rpms/x86_64");
    fs::create_dir_all(rpms.join("repodata")).unwrap();
    fs::write(root.join("rhdd3"), "Test Driver Update\n").unwrap();
    let payload = CpioBuilder::new()
        .file(&format!("./lib/modules/{}/extra/e1000.ko", TEST_KERNEL), b"module")
        .file("./lib/firmware/e1000/fw.bin", b"firmware")
        .finish();
    let package = RpmBuilder::new("kmod-e1000")
        .provides("kernel-modules", TEST_KERNEL)
        .payload(payload)
        .build();
    fs::write(rpms.join("kmod-e1000.rpm"), package).unwrap();
}

/// Tree that mounts fine but is not a driver disk.
pub fn write_plain_tree(root: &Path) {
    fs::create_dir_all(root).unwrap();
    fs::write(root.join("README"), "not a driver disk").unwrap();
}
