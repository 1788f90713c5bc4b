//! Index a raw filesystem-layer tar without unpacking it.
//!
//! [`TarIndex`] scans a layer tar once, recording for every path its header
//! metadata, a streaming content hash, and the byte range of its data in the
//! backing file. Later passes (data matchers, dump sinks, the merge writer)
//! re-read entry contents through bounded section reads instead of keeping
//! file data in memory.
//!
//! Gzipped layer blobs are decompressed to a scratch file first so byte
//! ranges stay seekable; the scratch file lives as long as the index.

use crate::hash;
use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use log::{debug, warn};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use tar_rs as tar;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Byte range of an entry's data inside the backing plain tar file.
///
/// A non-owning descriptor: the [`TarIndex`] that produced it owns the file
/// handle and resolves the range on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRange {
    pub offset: u64,
    pub size: u64,
}

/// One record per unique path observed while scanning a layer tar.
#[derive(Debug, Clone)]
pub struct TarEntryMeta {
    /// Normalized path, relative, forward slashes, no leading `./`.
    pub name: String,
    /// Raw tar typeflag byte.
    pub entry_type: u8,
    pub size: u64,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub mtime: u64,
    pub link_target: Option<String>,
    /// xxHash64 over the entry's data; `None` for empty or data-less entries.
    pub hash: Option<u64>,
    /// `None` for zero-byte and data-less entries (header-only on rewrite).
    pub data: Option<DataRange>,
    /// Physical position of this entry in the tar stream.
    pub occurrence: usize,
}

impl TarEntryMeta {
    pub fn is_dir(&self) -> bool {
        tar::EntryType::new(self.entry_type).is_dir()
    }

    pub fn is_file(&self) -> bool {
        tar::EntryType::new(self.entry_type).is_file()
    }

    pub fn is_symlink(&self) -> bool {
        tar::EntryType::new(self.entry_type).is_symlink()
    }

    pub fn is_hardlink(&self) -> bool {
        tar::EntryType::new(self.entry_type).is_hard_link()
    }

    /// Identical typeflag, size and content hash.
    pub fn same_content(&self, other: &TarEntryMeta) -> bool {
        self.entry_type == other.entry_type
            && self.size == other.size
            && self.hash == other.hash
    }
}

/// Path -> entry index over a single layer tar, preserving physical order.
pub struct TarIndex {
    path: PathBuf,
    file: File,
    // Scratch file backing a decompressed gzip blob; deleted on drop.
    _plain: Option<tempfile::TempPath>,
    entries: HashMap<String, TarEntryMeta>,
    order: Vec<String>,
}

impl TarIndex {
    /// Scans a layer tar (plain or gzipped) and builds the index.
    ///
    /// A single corrupt header is logged and skipped; an I/O error from the
    /// underlying file fails the whole scan. Duplicate paths within one tar
    /// keep only the later occurrence.
    pub fn open(path: &Path) -> Result<TarIndex> {
        let (mut file, plain) = open_plain_tar(path)
            .with_context(|| format!("failed to open layer tar: {}", path.display()))?;

        let mut entries: HashMap<String, TarEntryMeta> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        let mut occurrence = 0usize;

        file.seek(SeekFrom::Start(0))?;
        let mut archive = tar::Archive::new(&file);

        for entry_result in archive
            .entries()
            .with_context(|| format!("failed to read tar entries: {}", path.display()))?
        {
            let mut entry = match entry_result {
                Ok(e) => e,
                Err(err) => match err.kind() {
                    // Malformed headers surface as parse errors; skip them
                    // and keep whatever the stream still yields.
                    ErrorKind::InvalidData | ErrorKind::InvalidInput | ErrorKind::Other => {
                        warn!(
                            "skipping corrupt tar header in {}: {}",
                            path.display(),
                            err
                        );
                        continue;
                    }
                    ErrorKind::UnexpectedEof => {
                        warn!("truncated tar stream in {}: {}", path.display(), err);
                        break;
                    }
                    _ => {
                        return Err(err)
                            .with_context(|| format!("I/O error reading {}", path.display()));
                    }
                },
            };

            let raw_path = match entry.path() {
                Ok(p) => p.into_owned(),
                Err(err) => {
                    warn!("skipping tar entry with unreadable path: {}", err);
                    continue;
                }
            };
            let name = normalize_entry_path(&raw_path);
            if name.is_empty() {
                continue;
            }

            let header = entry.header();
            let entry_type = header.entry_type().as_byte();
            let size = entry.size();
            let mode = header.mode().unwrap_or(0);
            let uid = header.uid().unwrap_or(0);
            let gid = header.gid().unwrap_or(0);
            let mtime = header.mtime().unwrap_or(0);
            let link_target = entry
                .link_name()
                .ok()
                .flatten()
                .map(|p| p.to_string_lossy().into_owned());
            let offset = entry.raw_file_position();

            let (entry_hash, data) = if size > 0 {
                // Stream the body through the hasher; the entry reader is
                // already bounded to the data range.
                let h = hash::hash_reader(&mut entry)
                    .with_context(|| format!("failed hashing entry {name}"))?;
                (Some(h), Some(DataRange { offset, size }))
            } else {
                (None, None)
            };

            let meta = TarEntryMeta {
                name: name.clone(),
                entry_type,
                size,
                mode,
                uid,
                gid,
                mtime,
                link_target,
                hash: entry_hash,
                data,
                occurrence,
            };
            occurrence += 1;

            // Last write wins: retire the earlier occurrence's order slot.
            if entries.insert(name.clone(), meta).is_some() {
                debug!("duplicate path in tar, keeping later occurrence: {name}");
                order.retain(|n| n != &name);
            }
            order.push(name);
        }

        drop(archive);

        Ok(TarIndex {
            path: path.to_path_buf(),
            file,
            _plain: plain,
            entries,
            order,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&TarEntryMeta> {
        self.entries.get(name)
    }

    /// Entries in physical tar occurrence order.
    pub fn iter_order(&self) -> impl Iterator<Item = &TarEntryMeta> {
        self.order.iter().filter_map(|n| self.entries.get(n))
    }

    /// Reads an entry's full content through a bounded section read.
    ///
    /// Returns an empty buffer for entries without a data range.
    pub fn read_entry(&self, meta: &TarEntryMeta) -> Result<Vec<u8>> {
        let Some(range) = meta.data else {
            return Ok(Vec::new());
        };
        let mut file = &self.file;
        file.seek(SeekFrom::Start(range.offset))?;
        let mut buf = vec![0u8; range.size as usize];
        file.read_exact(&mut buf)
            .with_context(|| format!("failed reading data for {}", meta.name))?;
        Ok(buf)
    }

    /// A bounded reader over an entry's byte range, positioned and limited.
    pub fn entry_reader(&self, meta: &TarEntryMeta) -> Result<io::Take<&File>> {
        let Some(range) = meta.data else {
            return Ok((&self.file).take(0));
        };
        let mut file = &self.file;
        file.seek(SeekFrom::Start(range.offset))?;
        Ok((&self.file).take(range.size))
    }

    /// Copies an entry's content into a writer without buffering it whole.
    pub fn copy_entry<W: Write>(&self, meta: &TarEntryMeta, writer: &mut W) -> Result<u64> {
        let Some(range) = meta.data else {
            return Ok(0);
        };
        let mut file = &self.file;
        file.seek(SeekFrom::Start(range.offset))?;
        let mut section = file.take(range.size);
        let copied = io::copy(&mut section, writer)
            .with_context(|| format!("failed copying data for {}", meta.name))?;
        Ok(copied)
    }
}

/// Opens a layer blob as a seekable plain tar.
///
/// Gzip is detected by magic bytes and inflated into a scratch file so the
/// index can hand out seekable byte ranges.
fn open_plain_tar(path: &Path) -> Result<(File, Option<tempfile::TempPath>)> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;

    let mut magic = [0u8; 2];
    let n = file.read(&mut magic)?;
    file.seek(SeekFrom::Start(0))?;

    if n == 2 && magic == GZIP_MAGIC {
        let scratch = tempfile::NamedTempFile::new().context("failed to create scratch file")?;
        let (mut plain_file, plain_path) = scratch.into_parts();
        let mut decoder = GzDecoder::new(BufReader::new(file));
        io::copy(&mut decoder, &mut plain_file)
            .with_context(|| format!("failed to decompress {}", path.display()))?;
        plain_file.seek(SeekFrom::Start(0))?;
        Ok((plain_file, Some(plain_path)))
    } else {
        Ok((file, None))
    }
}

/// Normalizes a tar entry path: relative, forward slashes, no `.`/`..`
/// escapes, no trailing slash.
pub fn normalize_entry_path(p: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();
    for comp in p.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop();
            }
            Component::Normal(c) => parts.push(c.to_string_lossy().into_owned()),
            Component::RootDir | Component::Prefix(_) => {}
        }
    }
    parts.join("/")
}
