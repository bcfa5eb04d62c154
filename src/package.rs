//! RPM package reader
//!
//! Parses the lead, the signature header and the main header of an RPM
//! container and hands back the still-compressed payload as a forward-only
//! stream. Signature and digest verification are disabled: the signature
//! header is parsed for structure only.
//!
//! ```text
//! +------+---------------------+-----+-------------+---------------------+
//! | lead | signature header    | pad | main header | payload (cpio, zip) |
//! | 96 B | magic/index/store   | 0-7 | same layout |                     |
//! +------+---------------------+-----+-------------+---------------------+
//! ```

use crate::error::{DriverDiskError, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use strum::{Display, EnumString};
use tracing::{debug, warn};

/// Path sentinel that makes [`PackageReader::open`] read standard input.
pub const STDIN_SENTINEL: &str = "-";

const LEAD_SIZE: usize = 96;
const LEAD_MAGIC: [u8; 4] = [0xed, 0xab, 0xee, 0xdb];
const HEADER_MAGIC: [u8; 4] = [0x8e, 0xad, 0xe8, 0x01];
const HEADER_INTRO_SIZE: usize = 16;
const INDEX_ENTRY_SIZE: usize = 16;

// Limits enforced by rpm's own header checks.
const MAX_INDEX_ENTRIES: u32 = 0xffff;
const MAX_DATA_SIZE: u32 = 0x0fff_ffff;

/// Header tags this reader knows by name.
pub mod tag {
    pub const NAME: u32 = 1000;
    pub const VERSION: u32 = 1001;
    pub const RELEASE: u32 = 1002;
    pub const ARCH: u32 = 1022;
    pub const PROVIDENAME: u32 = 1047;
    pub const REQUIRENAME: u32 = 1049;
    pub const REQUIREVERSION: u32 = 1050;
    pub const PROVIDEVERSION: u32 = 1113;
    pub const PAYLOADFORMAT: u32 = 1124;
    pub const PAYLOADCOMPRESSOR: u32 = 1125;
}

/// On-disk tag data types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum TagType {
    Null = 0,
    Char = 1,
    Int8 = 2,
    Int16 = 3,
    Int32 = 4,
    Int64 = 5,
    String = 6,
    Bin = 7,
    StringArray = 8,
    I18nString = 9,
}

impl TagType {
    fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Null,
            1 => Self::Char,
            2 => Self::Int8,
            3 => Self::Int16,
            4 => Self::Int32,
            5 => Self::Int64,
            6 => Self::String,
            7 => Self::Bin,
            8 => Self::StringArray,
            9 => Self::I18nString,
            _ => return None,
        })
    }
}

/// Decoded value of one header tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagValue {
    Int8(Vec<u8>),
    Int16(Vec<u16>),
    Int32(Vec<u32>),
    Int64(Vec<u64>),
    String(String),
    StringArray(Vec<String>),
    Binary(Vec<u8>),
}

/// Payload compression kinds, named as in the PAYLOADCOMPRESSOR tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum PayloadCompression {
    #[default]
    Gzip,
    Bzip2,
    Xz,
    Lzma,
    Zstd,
}

/// A `(name, version)` pair from the requires or provides list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub name: String,
    pub version: Option<String>,
}

impl Capability {
    pub fn new(name: impl Into<String>, version: Option<&str>) -> Self {
        Self {
            name: name.into(),
            version: version.map(str::to_string),
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.version {
            Some(version) if !version.is_empty() => write!(f, "{} = {}", self.name, version),
            _ => write!(f, "{}", self.name),
        }
    }
}

/// Parsed main header of a package
#[derive(Debug, Clone)]
pub struct PackageHeader {
    label: String,
    tags: HashMap<u32, TagValue>,
}

impl PackageHeader {
    /// Label used in logs and errors (file path or `<stdin>`)
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn tag(&self, tag: u32) -> Option<&TagValue> {
        self.tags.get(&tag)
    }

    pub fn string(&self, tag: u32) -> Option<&str> {
        match self.tags.get(&tag)? {
            TagValue::String(s) => Some(s),
            TagValue::StringArray(values) => values.first().map(String::as_str),
            _ => None,
        }
    }

    fn strings(&self, tag: u32) -> &[String] {
        match self.tags.get(&tag) {
            Some(TagValue::StringArray(values)) => values,
            _ => &[],
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.string(tag::NAME)
    }

    pub fn version(&self) -> Option<&str> {
        self.string(tag::VERSION)
    }

    pub fn release(&self) -> Option<&str> {
        self.string(tag::RELEASE)
    }

    pub fn arch(&self) -> Option<&str> {
        self.string(tag::ARCH)
    }

    /// Requires list, names paired with versions by position.
    pub fn requires(&self) -> Vec<Capability> {
        self.capabilities(tag::REQUIRENAME, tag::REQUIREVERSION)
    }

    /// Provides list, names paired with versions by position.
    pub fn provides(&self) -> Vec<Capability> {
        self.capabilities(tag::PROVIDENAME, tag::PROVIDEVERSION)
    }

    fn capabilities(&self, name_tag: u32, version_tag: u32) -> Vec<Capability> {
        let versions = self.strings(version_tag);
        self.strings(name_tag)
            .iter()
            .enumerate()
            .map(|(i, name)| Capability {
                name: name.clone(),
                version: versions.get(i).cloned(),
            })
            .collect()
    }

    /// Payload compression; gzip when the tag is absent.
    pub fn payload_compression(&self) -> Result<PayloadCompression> {
        match self.string(tag::PAYLOADCOMPRESSOR) {
            None => Ok(PayloadCompression::default()),
            Some(name) => name.parse().map_err(|_| {
                DriverDiskError::read_error(
                    &self.label,
                    format!("unsupported payload compressor '{}'", name),
                )
            }),
        }
    }

    fn check_payload_format(&self) -> Result<()> {
        match self.string(tag::PAYLOADFORMAT) {
            None | Some("cpio") => Ok(()),
            Some(other) => Err(DriverDiskError::read_error(
                &self.label,
                format!("unsupported payload format '{}'", other),
            )),
        }
    }
}

/// An opened package positioned at the start of its payload.
pub struct PackageReader<R: Read> {
    header: PackageHeader,
    source: R,
}

impl<R: Read> std::fmt::Debug for PackageReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageReader")
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

impl PackageReader<Box<dyn Read>> {
    /// Open a package file, or standard input when `path` is `-`.
    pub fn open(path: &Path) -> Result<Self> {
        if path.as_os_str() == STDIN_SENTINEL {
            debug!("Reading package from standard input");
            let stdin: Box<dyn Read> = Box::new(BufReader::new(io::stdin()));
            return Self::from_reader(stdin, "<stdin>");
        }

        let file = File::open(path).map_err(|e| DriverDiskError::io_at(path, e))?;
        let reader: Box<dyn Read> = Box::new(BufReader::new(file));
        Self::from_reader(reader, path.display().to_string())
    }
}

impl<R: Read> PackageReader<R> {
    /// Parse lead and headers from an arbitrary forward-only stream.
    pub fn from_reader(mut source: R, label: impl Into<String>) -> Result<Self> {
        let label = label.into();

        read_lead(&mut source, &label)?;

        // Signature content is ignored: digest and signature checks are off.
        let signature = read_header_structure(&mut source, &label)?;
        let padding = (8 - signature.stored_size % 8) % 8;
        skip(&mut source, padding as u64)
            .map_err(|e| DriverDiskError::read_error(&label, format!("signature padding: {}", e)))?;
        debug!(
            "{}: skipped signature header ({} entries)",
            label,
            signature.tags.len()
        );

        let main = read_header_structure(&mut source, &label)?;
        let header = PackageHeader {
            label,
            tags: main.tags,
        };
        header.check_payload_format()?;

        Ok(Self { header, source })
    }

    pub fn header(&self) -> &PackageHeader {
        &self.header
    }

    /// Split into the header and the raw (still compressed) payload stream.
    pub fn into_parts(self) -> (PackageHeader, R) {
        (self.header, self.source)
    }
}

impl<R: Read + 'static> PackageReader<R> {
    /// Wrap the remaining stream in the decoder named by the header.
    pub fn into_payload(self) -> Result<Box<dyn Read>> {
        let compression = self.header.payload_compression()?;
        debug!(
            "{}: payload compressed with {}",
            self.header.label, compression
        );
        decompress(self.source, compression)
    }
}

/// Build a decoding reader for a payload stream.
pub fn decompress<R: Read + 'static>(
    source: R,
    compression: PayloadCompression,
) -> Result<Box<dyn Read>> {
    Ok(match compression {
        PayloadCompression::Gzip => Box::new(flate2::read::GzDecoder::new(source)),
        PayloadCompression::Bzip2 => Box::new(bzip2::read::BzDecoder::new(source)),
        PayloadCompression::Xz => Box::new(xz2::read::XzDecoder::new(source)),
        PayloadCompression::Lzma => {
            let stream = xz2::stream::Stream::new_lzma_decoder(u64::MAX)
                .map_err(|e| DriverDiskError::archive(format!("lzma decoder: {}", e)))?;
            Box::new(xz2::read::XzDecoder::new_stream(source, stream))
        }
        PayloadCompression::Zstd => Box::new(zstd::stream::read::Decoder::new(source)?),
    })
}

fn read_lead<R: Read>(source: &mut R, label: &str) -> Result<()> {
    let mut lead = [0u8; LEAD_SIZE];
    source
        .read_exact(&mut lead)
        .map_err(|_| DriverDiskError::NotAPackage(label.to_string()))?;
    if lead[..4] != LEAD_MAGIC {
        return Err(DriverDiskError::NotAPackage(label.to_string()));
    }
    Ok(())
}

struct RawHeader {
    tags: HashMap<u32, TagValue>,
    /// Bytes after the 16-byte intro: index plus data store
    stored_size: usize,
}

fn read_header_structure<R: Read>(source: &mut R, label: &str) -> Result<RawHeader> {
    let fail = |reason: String| DriverDiskError::read_error(label, reason);

    let mut intro = [0u8; HEADER_INTRO_SIZE];
    source
        .read_exact(&mut intro)
        .map_err(|e| fail(format!("truncated header: {}", e)))?;
    if intro[..4] != HEADER_MAGIC {
        return Err(fail("bad header magic".to_string()));
    }

    let index_count = be_u32(&intro[8..12]);
    let data_size = be_u32(&intro[12..16]);
    if index_count > MAX_INDEX_ENTRIES {
        return Err(fail(format!("{} index entries exceeds limit", index_count)));
    }
    if data_size > MAX_DATA_SIZE {
        return Err(fail(format!("{} byte data store exceeds limit", data_size)));
    }

    let index_len = index_count as usize * INDEX_ENTRY_SIZE;
    let mut index = vec![0u8; index_len];
    source
        .read_exact(&mut index)
        .map_err(|e| fail(format!("truncated index: {}", e)))?;
    let mut store = vec![0u8; data_size as usize];
    source
        .read_exact(&mut store)
        .map_err(|e| fail(format!("truncated data store: {}", e)))?;

    let mut tags = HashMap::with_capacity(index_count as usize);
    for entry in index.chunks_exact(INDEX_ENTRY_SIZE) {
        let tag = be_u32(&entry[0..4]);
        let raw_type = be_u32(&entry[4..8]);
        let offset = be_u32(&entry[8..12]) as usize;
        let count = be_u32(&entry[12..16]) as usize;

        if offset > store.len() {
            return Err(fail(format!("tag {} offset {} out of range", tag, offset)));
        }
        let Some(kind) = TagType::from_raw(raw_type) else {
            warn!("{}: tag {} has unknown type {}, ignoring", label, tag, raw_type);
            continue;
        };
        if let Some(value) = decode_tag(kind, &store[offset..], count)
            .map_err(|reason| fail(format!("tag {}: {}", tag, reason)))?
        {
            tags.insert(tag, value);
        }
    }

    Ok(RawHeader {
        tags,
        stored_size: index_len + data_size as usize,
    })
}

fn decode_tag(
    kind: TagType,
    data: &[u8],
    count: usize,
) -> std::result::Result<Option<TagValue>, String> {
    let need = |width: usize| -> std::result::Result<&[u8], String> {
        let len = width
            .checked_mul(count)
            .ok_or_else(|| "count overflow".to_string())?;
        data.get(..len)
            .ok_or_else(|| format!("{} bytes requested past end of store", len))
    };

    Ok(Some(match kind {
        TagType::Null => return Ok(None),
        TagType::Char | TagType::Int8 => TagValue::Int8(need(1)?.to_vec()),
        TagType::Bin => TagValue::Binary(need(1)?.to_vec()),
        TagType::Int16 => TagValue::Int16(
            need(2)?
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect(),
        ),
        TagType::Int32 => TagValue::Int32(need(4)?.chunks_exact(4).map(be_u32).collect()),
        TagType::Int64 => TagValue::Int64(
            need(8)?
                .chunks_exact(8)
                .map(|c| {
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(c);
                    u64::from_be_bytes(bytes)
                })
                .collect(),
        ),
        TagType::String => TagValue::String(read_strings(data, 1)?.remove(0)),
        TagType::StringArray | TagType::I18nString => {
            TagValue::StringArray(read_strings(data, count)?)
        }
    }))
}

fn read_strings(data: &[u8], count: usize) -> std::result::Result<Vec<String>, String> {
    let mut strings = Vec::with_capacity(count);
    let mut rest = data;
    for _ in 0..count.max(1) {
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| "unterminated string".to_string())?;
        strings.push(String::from_utf8_lossy(&rest[..end]).into_owned());
        rest = &rest[end + 1..];
    }
    Ok(strings)
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn skip<R: Read>(source: &mut R, len: u64) -> io::Result<()> {
    let copied = io::copy(&mut source.take(len), &mut io::sink())?;
    if copied < len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "stream ended early",
        ));
    }
    Ok(())
}
