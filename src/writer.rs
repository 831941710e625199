//! Segment writer: splits a plain capture log into per-minute gzip objects.
//!
//! A new segment starts whenever a timestamped record (`msg`, `end`) falls in
//! a later minute than the open segment. Untimestamped records go to the
//! open segment; those seen before any timestamp are held back and written
//! at the head of the first segment. Every segment becomes one
//! [`ManifestEntry`] keyed by its first timestamp.
use std::fs::{self, File};
use std::io::{self, BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use tracing::{debug, info, warn};

use crate::error::{Result, StorageError};
use crate::manifest::{MANIFEST_FILE, ManifestEntry, read_manifest_file, write_manifest_file};
use crate::record::{RECORD_END, Tokenizer};
use crate::segment::{SegmentKey, minute_of};

struct OpenSegment {
    minute: i64,
    key: SegmentKey,
    encoder: GzEncoder<BufWriter<File>>,
}

impl OpenSegment {
    fn write(&mut self, bytes: &[u8]) -> std::result::Result<(), StorageError> {
        self.encoder.write_all(bytes).map_err(|source| StorageError::Write { key: self.key.to_string(), source })
    }

    fn finish(self) -> std::result::Result<(), StorageError> {
        let key = self.key.to_string();
        self.encoder
            .finish()
            .and_then(|mut w| w.flush())
            .map_err(|source| StorageError::Write { key, source })
    }
}

pub struct SegmentWriter {
    out_dir: PathBuf,
    exchange: String,
    current: Option<OpenSegment>,
    pending: Vec<u8>,
    entries: Vec<ManifestEntry>,
    lines: u64,
}

impl SegmentWriter {
    pub fn create(out_dir: &Path, exchange: &str) -> std::result::Result<Self, StorageError> {
        let plain = !exchange.is_empty() && !exchange.contains(['/', '\\']) && exchange != "." && exchange != "..";
        if !plain {
            return Err(StorageError::InvalidKey(exchange.to_string()));
        }
        fs::create_dir_all(out_dir)
            .map_err(|source| StorageError::Write { key: out_dir.display().to_string(), source })?;
        Ok(Self {
            out_dir: out_dir.to_path_buf(),
            exchange: exchange.to_string(),
            current: None,
            pending: Vec::new(),
            entries: Vec::new(),
            lines: 0,
        })
    }

    /// Append one record line. A missing trailing line feed is added.
    pub fn write_line(&mut self, line: &[u8]) -> Result<()> {
        if line.is_empty() {
            return Ok(());
        }
        let mut owned;
        let line = if line.ends_with(&[RECORD_END]) {
            line
        } else {
            owned = line.to_vec();
            owned.push(RECORD_END);
            &owned[..]
        };
        let head = Tokenizer::new(line).next_head()?;
        let timestamp = head.and_then(|h| h.timestamp());
        self.lines += 1;

        if let Some(ts) = timestamp {
            let minute = minute_of(ts);
            let rotate = match &self.current {
                None => true,
                Some(open) => minute > open.minute,
            };
            if rotate {
                self.rotate(minute, ts)?;
            }
        }
        match self.current.as_mut() {
            Some(open) => open.write(line)?,
            None => self.pending.extend_from_slice(line),
        }
        Ok(())
    }

    fn rotate(&mut self, minute: i64, first_timestamp: i64) -> std::result::Result<(), StorageError> {
        if let Some(open) = self.current.take() {
            debug!(key = %open.key, "segment complete");
            open.finish()?;
        }
        let key = SegmentKey::for_minute(&self.exchange, minute);
        let path = self.out_dir.join(key.as_str());
        let file = File::create(&path).map_err(|source| StorageError::Write { key: key.to_string(), source })?;
        let mut open = OpenSegment {
            minute,
            key: key.clone(),
            encoder: GzEncoder::new(BufWriter::new(file), Compression::default()),
        };
        if !self.pending.is_empty() {
            open.write(&self.pending)?;
            self.pending.clear();
        }
        self.entries.push(ManifestEntry { exchange: self.exchange.clone(), first_timestamp, key: key.to_string() });
        self.current = Some(open);
        Ok(())
    }

    /// Close the open segment and return the entries written.
    pub fn finish(mut self) -> std::result::Result<Vec<ManifestEntry>, StorageError> {
        if let Some(open) = self.current.take() {
            open.finish()?;
        }
        if !self.pending.is_empty() {
            warn!(bytes = self.pending.len(), "capture has no timestamped record; untimestamped lines dropped");
        }
        info!(exchange = %self.exchange, segments = self.entries.len(), lines = self.lines, "segments written");
        Ok(self.entries)
    }
}

/// Split `input` into segments under `out_dir` and update the manifest there.
///
/// Manifest entries of other exchanges are preserved.
pub fn pack<R: BufRead>(mut input: R, out_dir: &Path, exchange: &str) -> Result<Vec<ManifestEntry>> {
    let mut writer = SegmentWriter::create(out_dir, exchange)?;
    let mut line = Vec::with_capacity(4096);
    loop {
        line.clear();
        let n = input.read_until(RECORD_END, &mut line).map_err(StorageError::Read)?;
        if n == 0 {
            break;
        }
        writer.write_line(&line)?;
    }
    let entries = writer.finish()?;

    let manifest = out_dir.join(MANIFEST_FILE);
    let mut all: Vec<ManifestEntry> = match read_manifest_file(&manifest) {
        Ok(existing) => existing.into_iter().filter(|e| e.exchange != exchange).collect(),
        Err(_) if !manifest.exists() => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    all.extend(entries.iter().cloned());
    write_manifest_file(&manifest, &all)?;
    Ok(entries)
}

/// Read a whole segment back as plain text.
pub fn read_segment(path: &Path) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut decoder = flate2::read::MultiGzDecoder::new(File::open(path)?);
    io::Read::read_to_end(&mut decoder, &mut out)?;
    Ok(out)
}
