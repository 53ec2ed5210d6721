//! The frame index: one fixed 8-byte record per frame start, enabling
//! random access into segment files.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use log::error;

pub const INDEX_FILE_NAME: &str = "index";

/// One frame start inside a recording.
///
/// On-disk layout (little-endian): `offset_low32 : u32` followed by
/// `packed : u32` with `packed = independent << 31 | file_number << 16 |
/// offset_high16` — offsets up to 2^48 per segment with an 8-byte record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub independent: bool,
    pub file_number: u16,
    pub offset:      u64,
}

impl IndexEntry {
    pub fn pack(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        let packed = ((self.independent as u32) << 31)
            | ((self.file_number as u32) << 16)
            | ((self.offset >> 32) as u32 & 0xFFFF);
        out[..4].copy_from_slice(&(self.offset as u32).to_le_bytes());
        out[4..].copy_from_slice(&packed.to_le_bytes());
        out
    }

    pub fn unpack(record: &[u8; 8]) -> Self {
        let low = u32::from_le_bytes(record[..4].try_into().unwrap());
        let packed = u32::from_le_bytes(record[4..].try_into().unwrap());
        Self {
            independent: packed & 0x8000_0000 != 0,
            file_number: ((packed >> 16) & 0x7FFF) as u16,
            offset:      ((packed as u64 & 0xFFFF) << 32) | low as u64,
        }
    }
}

/// Append-only index writer. A failed write logs once and disables the
/// index; the recording itself continues.
pub struct IndexFile {
    file: Option<File>,
}

impl IndexFile {
    pub fn create(dir: &Path) -> Self {
        let path = dir.join(INDEX_FILE_NAME);
        match OpenOptions::new().write(true).create(true).truncate(true).open(&path) {
            Ok(file) => Self { file: Some(file) },
            Err(e) => {
                // continue without index, so we'll at least have the recording
                error!("can't create index {}: {e}", path.display());
                Self { file: None }
            }
        }
    }

    pub fn disabled() -> Self {
        Self { file: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.file.is_some()
    }

    pub fn write(&mut self, independent: bool, file_number: u16, offset: u64) {
        if let Some(file) = &mut self.file {
            let entry = IndexEntry { independent, file_number, offset };
            if let Err(e) = file.write_all(&entry.pack()) {
                error!("index write failed, continuing without index: {e}");
                self.file = None;
            }
        }
    }
}

/// Reads a complete index file; a trailing partial record is dropped.
pub fn read_index(path: &Path) -> anyhow::Result<Vec<IndexEntry>> {
    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;
    Ok(data
        .chunks_exact(8)
        .map(|c| IndexEntry::unpack(c.try_into().unwrap()))
        .collect())
}
