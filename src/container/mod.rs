//! # Binary Package Container
//!
//! Immutable index-then-data archive used for mod and asset
//! distribution: an i32 entry count, then per-entry `(key, start, end)`
//! byte ranges into the same seekable stream, then the entry data.
//!
//! Two index sub-formats exist in the wild:
//! - **Explicit end** (canonical): every entry records both offsets
//! - **Implied end** (legacy, read-only): entries record only their start;
//!   the next entry's start terminates the previous one, and the stream
//!   length terminates the last
//!
//! The writer emits only the canonical explicit-end form.
//!
//! Strings are i32-length-prefixed UTF-8 and integers little-endian,
//! matching the rest of the protocol; byte-compatibility with any legacy
//! archive layout is explicitly not a goal.

use crate::error::{NetError, Result};
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use tracing::debug;

/// Hard cap on index entries; anything larger is a corrupt header.
const MAX_ENTRIES: i32 = 1_000_000;

/// Hard cap on an entry key's byte length.
const MAX_KEY_LEN: i32 = 4096;

/// Which index layout a reader should expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexFormat {
    /// Per-entry `(key, start, end)`. Canonical.
    #[default]
    ExplicitEnd,
    /// Per-entry `(key, start)`; ends are implied by the next start.
    /// Legacy archives only.
    ImpliedEnd,
}

/// One archived entry: a key and the `[start, end)` byte range holding
/// its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageEntry {
    pub key: String,
    pub start: u64,
    pub end: u64,
}

impl PackageEntry {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Reader over a seekable package stream.
pub struct PackageReader<R: Read + Seek> {
    entries: Vec<PackageEntry>,
    by_key: HashMap<String, usize>,
    source: R,
}

impl<R: Read + Seek> PackageReader<R> {
    /// Parse the index in the canonical explicit-end format.
    pub fn open(source: R) -> Result<Self> {
        Self::open_format(source, IndexFormat::ExplicitEnd)
    }

    /// Parse the index in the given format.
    pub fn open_format(mut source: R, format: IndexFormat) -> Result<Self> {
        source
            .seek(SeekFrom::Start(0))
            .map_err(|e| NetError::Container(format!("seek to index: {e}")))?;

        let count = read_i32(&mut source)?;
        if !(0..=MAX_ENTRIES).contains(&count) {
            return Err(NetError::Container(format!("bad entry count {count}")));
        }

        let entries = match format {
            IndexFormat::ExplicitEnd => Self::read_explicit_index(&mut source, count)?,
            IndexFormat::ImpliedEnd => Self::read_implied_index(&mut source, count)?,
        };

        let mut by_key = HashMap::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            if entry.end < entry.start {
                return Err(NetError::Container(format!(
                    "entry '{}' has inverted range {}..{}",
                    entry.key, entry.start, entry.end
                )));
            }
            if by_key.insert(entry.key.clone(), i).is_some() {
                return Err(NetError::Container(format!(
                    "duplicate entry key '{}'",
                    entry.key
                )));
            }
        }

        debug!(entries = entries.len(), ?format, "package index parsed");
        Ok(Self {
            entries,
            by_key,
            source,
        })
    }

    fn read_explicit_index(source: &mut R, count: i32) -> Result<Vec<PackageEntry>> {
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let key = read_string(source)?;
            let start = read_i64(source)?;
            let end = read_i64(source)?;
            if start < 0 || end < 0 {
                return Err(NetError::Container(format!(
                    "entry '{key}' has negative offsets"
                )));
            }
            entries.push(PackageEntry {
                key,
                start: start as u64,
                end: end as u64,
            });
        }
        Ok(entries)
    }

    fn read_implied_index(source: &mut R, count: i32) -> Result<Vec<PackageEntry>> {
        let mut keyed_starts = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let key = read_string(source)?;
            let start = read_i64(source)?;
            if start < 0 {
                return Err(NetError::Container(format!(
                    "entry '{key}' has negative offset"
                )));
            }
            keyed_starts.push((key, start as u64));
        }

        let stream_len = source
            .seek(SeekFrom::End(0))
            .map_err(|e| NetError::Container(format!("seek to end: {e}")))?;

        let mut entries = Vec::with_capacity(keyed_starts.len());
        for i in 0..keyed_starts.len() {
            let (key, start) = keyed_starts[i].clone();
            let end = keyed_starts
                .get(i + 1)
                .map(|(_, next_start)| *next_start)
                .unwrap_or(stream_len);
            entries.push(PackageEntry { key, start, end });
        }
        Ok(entries)
    }

    /// All entries, in index order.
    pub fn entries(&self) -> &[PackageEntry] {
        &self.entries
    }

    /// Entries directly under `prefix`, one path segment deep.
    ///
    /// With entries `a/x`, `a/b/y`, `c`: prefix `"a"` lists only `a/x` —
    /// `a/b/y` is a level deeper and `c` is outside the prefix.
    pub fn entries_in(&self, prefix: &str) -> Vec<&PackageEntry> {
        let prefix = prefix.trim_end_matches('/');
        self.entries
            .iter()
            .filter(|e| {
                let rest = if prefix.is_empty() {
                    e.key.as_str()
                } else {
                    match e.key.strip_prefix(prefix) {
                        Some(rest) => match rest.strip_prefix('/') {
                            Some(rest) => rest,
                            None => return false,
                        },
                        None => return false,
                    }
                };
                !rest.is_empty() && !rest.contains('/')
            })
            .collect()
    }

    /// Look up one entry by key.
    pub fn entry(&self, key: &str) -> Option<&PackageEntry> {
        self.by_key.get(key).map(|&i| &self.entries[i])
    }

    /// Open a bounded reader over one entry's `[start, end)` range.
    ///
    /// Borrows the underlying stream exclusively; only one entry can be
    /// read at a time.
    pub fn open_entry(&mut self, key: &str) -> Result<EntryReader<'_, R>> {
        let index = *self
            .by_key
            .get(key)
            .ok_or_else(|| NetError::Container(format!("no entry '{key}'")))?;
        let entry = self.entries[index].clone();
        self.source
            .seek(SeekFrom::Start(entry.start))
            .map_err(|e| NetError::Container(format!("seek to '{key}': {e}")))?;
        Ok(EntryReader {
            source: &mut self.source,
            remaining: entry.len(),
        })
    }

    /// Read one entry fully into memory.
    pub fn read_entry(&mut self, key: &str) -> Result<Vec<u8>> {
        let mut reader = self.open_entry(key)?;
        let mut buf = Vec::with_capacity(reader.remaining as usize);
        reader
            .read_to_end(&mut buf)
            .map_err(|e| NetError::Container(format!("read '{key}': {e}")))?;
        Ok(buf)
    }
}

/// Bounded sub-stream over one entry's byte range.
pub struct EntryReader<'a, R: Read + Seek> {
    source: &'a mut R,
    remaining: u64,
}

impl<R: Read + Seek> Read for EntryReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let cap = buf.len().min(self.remaining as usize);
        let n = self.source.read(&mut buf[..cap])?;
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Writer producing the canonical explicit-end layout.
///
/// Entries are collected in memory and the archive is written in one
/// pass by [`finish`](Self::finish): count, index, then data.
#[derive(Default)]
pub struct PackageWriter {
    entries: Vec<(String, Vec<u8>)>,
}

impl PackageWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one entry. Keys must be unique.
    pub fn add(&mut self, key: impl Into<String>, data: Vec<u8>) -> Result<()> {
        let key = key.into();
        if key.is_empty() || key.len() > MAX_KEY_LEN as usize {
            return Err(NetError::Container(format!("bad key length {}", key.len())));
        }
        if self.entries.iter().any(|(k, _)| *k == key) {
            return Err(NetError::Container(format!("duplicate entry key '{key}'")));
        }
        self.entries.push((key, data));
        Ok(())
    }

    /// Write the archive: i32 count, explicit-end index, then data.
    pub fn finish<W: Write>(self, mut sink: W) -> Result<()> {
        // The index size must be known before offsets can be assigned.
        let mut index_len = 4u64;
        for (key, _) in &self.entries {
            index_len += 4 + key.len() as u64 + 8 + 8;
        }

        let mut offset = index_len;
        let mut index = Vec::with_capacity(self.entries.len());
        for (key, data) in &self.entries {
            let start = offset;
            let end = start + data.len() as u64;
            index.push((key.clone(), start, end));
            offset = end;
        }

        write_i32(&mut sink, self.entries.len() as i32)?;
        for (key, start, end) in &index {
            write_string(&mut sink, key)?;
            write_i64(&mut sink, *start as i64)?;
            write_i64(&mut sink, *end as i64)?;
        }
        for (_, data) in &self.entries {
            sink.write_all(data)
                .map_err(|e| NetError::Container(format!("write data: {e}")))?;
        }
        sink.flush()
            .map_err(|e| NetError::Container(format!("flush: {e}")))?;
        Ok(())
    }
}

fn read_i32<R: Read>(source: &mut R) -> Result<i32> {
    let mut b = [0u8; 4];
    source
        .read_exact(&mut b)
        .map_err(|e| NetError::Container(format!("read i32: {e}")))?;
    Ok(i32::from_le_bytes(b))
}

fn read_i64<R: Read>(source: &mut R) -> Result<i64> {
    let mut b = [0u8; 8];
    source
        .read_exact(&mut b)
        .map_err(|e| NetError::Container(format!("read i64: {e}")))?;
    Ok(i64::from_le_bytes(b))
}

fn read_string<R: Read>(source: &mut R) -> Result<String> {
    let len = read_i32(source)?;
    if !(0..=MAX_KEY_LEN).contains(&len) {
        return Err(NetError::Container(format!("bad string length {len}")));
    }
    let mut buf = vec![0u8; len as usize];
    source
        .read_exact(&mut buf)
        .map_err(|e| NetError::Container(format!("read string: {e}")))?;
    String::from_utf8(buf).map_err(|e| NetError::Container(format!("invalid UTF-8 key: {e}")))
}

fn write_i32<W: Write>(sink: &mut W, v: i32) -> Result<()> {
    sink.write_all(&v.to_le_bytes())
        .map_err(|e| NetError::Container(format!("write i32: {e}")))
}

fn write_i64<W: Write>(sink: &mut W, v: i64) -> Result<()> {
    sink.write_all(&v.to_le_bytes())
        .map_err(|e| NetError::Container(format!("write i64: {e}")))
}

fn write_string<W: Write>(sink: &mut W, s: &str) -> Result<()> {
    write_i32(sink, s.len() as i32)?;
    sink.write_all(s.as_bytes())
        .map_err(|e| NetError::Container(format!("write string: {e}")))
}
