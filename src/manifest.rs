//! Segment manifest: a durable index of which segment objects exist.
//!
//! The manifest is a sequence of frames, each `[len:u32][crc32:u32][payload]`
//! where the payload is a bincode-encoded [`ManifestFrame`]. The first frame
//! is a header; every following frame describes one segment.
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

pub const MANIFEST_VERSION: u16 = 1;
pub const MANIFEST_FILE: &str = "manifest.bin";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestHeader {
    pub version: u16,
    pub created_unix_ns: u128,
}

/// One segment object and the first timestamp it contains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub exchange: String,
    pub first_timestamp: i64,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ManifestFrame {
    Header(ManifestHeader),
    Entry(ManifestEntry),
}

fn now_unix_ns() -> u128 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos()
}

fn invalid(path: &Path, reason: impl Into<String>) -> StorageError {
    StorageError::Manifest { path: path.display().to_string(), reason: reason.into() }
}

pub fn write_frame<W: Write>(w: &mut W, frame: &ManifestFrame) -> io::Result<()> {
    let payload = bincode::serialize(frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut hasher = Crc32::new();
    hasher.update(&payload);
    let crc = hasher.finalize();

    let len = payload.len() as u32;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&crc.to_le_bytes())?;
    w.write_all(&payload)?;
    Ok(())
}

/// Write a header frame followed by one frame per entry.
pub fn write_manifest<W: Write>(w: &mut W, entries: &[ManifestEntry]) -> io::Result<()> {
    let header = ManifestHeader { version: MANIFEST_VERSION, created_unix_ns: now_unix_ns() };
    write_frame(w, &ManifestFrame::Header(header))?;
    for e in entries {
        write_frame(w, &ManifestFrame::Entry(e.clone()))?;
    }
    Ok(())
}

fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Read every entry frame, checking CRCs and the header version.
pub fn read_manifest<R: Read>(r: &mut R, path: &Path) -> Result<Vec<ManifestEntry>, StorageError> {
    let mut entries = Vec::new();
    let mut frames = 0usize;
    loop {
        let len = match read_u32(r) {
            Ok(v) => v as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(invalid(path, e.to_string())),
        };
        let crc_on_file = read_u32(r).map_err(|e| invalid(path, format!("frame {frames}: {e}")))?;
        let mut payload = vec![0u8; len];
        r.read_exact(&mut payload).map_err(|e| invalid(path, format!("frame {frames}: {e}")))?;
        let mut hasher = Crc32::new();
        hasher.update(&payload);
        let crc_calc = hasher.finalize();
        if crc_calc != crc_on_file {
            let reason = format!("CRC mismatch at frame {frames}: file={crc_on_file:#x}, calc={crc_calc:#x}");
            return Err(invalid(path, reason));
        }
        let frame: ManifestFrame =
            bincode::deserialize(&payload).map_err(|e| invalid(path, format!("frame {frames}: {e}")))?;
        match frame {
            ManifestFrame::Header(h) if frames == 0 => {
                if h.version != MANIFEST_VERSION {
                    return Err(invalid(path, format!("unsupported version {}", h.version)));
                }
            }
            ManifestFrame::Header(_) => return Err(invalid(path, format!("unexpected header at frame {frames}"))),
            ManifestFrame::Entry(_) if frames == 0 => return Err(invalid(path, "missing header")),
            ManifestFrame::Entry(e) => entries.push(e),
        }
        frames += 1;
    }
    Ok(entries)
}

pub fn read_manifest_file(path: &Path) -> Result<Vec<ManifestEntry>, StorageError> {
    let file = File::open(path).map_err(|e| invalid(path, e.to_string()))?;
    read_manifest(&mut BufReader::new(file), path)
}

pub fn write_manifest_file(path: &Path, entries: &[ManifestEntry]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| invalid(path, e.to_string()))?;
        }
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(|e| invalid(path, e.to_string()))?;
    let mut w = BufWriter::new(file);
    write_manifest(&mut w, entries).and_then(|_| w.flush()).map_err(|e| invalid(path, e.to_string()))
}
