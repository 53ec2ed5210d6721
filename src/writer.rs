//! Segment writing: file-name rotation, disk-space policy, PAT/PMT
//! injection and the recording-info sidecar.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::{FreeSpaceProbe, RecorderConfig, MEGABYTE};
use crate::file::FadviseFile;
use crate::index::IndexFile;
use crate::psi::PatPmtGenerator;
use crate::ts::TS_SIZE;

pub const INFO_FILE_NAME: &str = "info.json";
const MAX_FILES_PER_RECORDING: u16 = 999;

/// Free space in MiB on the filesystem holding `path`, via `statvfs`.
#[cfg(unix)]
pub fn free_disk_space_mib(path: &Path) -> Option<u64> {
    use std::os::unix::ffi::OsStrExt;
    let c = std::ffi::CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(c.as_ptr(), &mut stat) } != 0 {
        return None;
    }
    Some((stat.f_bavail as u64).saturating_mul(stat.f_bsize as u64) / MEGABYTE)
}

#[cfg(not(unix))]
pub fn free_disk_space_mib(_path: &Path) -> Option<u64> {
    None
}

/// The learned stream parameters, written once after sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingInfo {
    pub frames_per_second: f64,
    pub frame_duration:    u32,
    pub started_at:        String,
}

/// The segment-file cursor: `001.ts` … `999.ts` inside the recording
/// directory.
pub struct FileName {
    dir:    PathBuf,
    number: u16,
}

impl FileName {
    pub fn new(dir: &Path) -> Self {
        Self { dir: dir.to_path_buf(), number: 1 }
    }

    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(format!("{:03}.ts", self.number))
    }

    pub fn open(&self) -> anyhow::Result<FadviseFile> {
        FadviseFile::create(&self.path())
            .with_context(|| format!("can't create {}", self.path().display()))
    }

    pub fn next(&mut self) -> anyhow::Result<FadviseFile> {
        if self.number >= MAX_FILES_PER_RECORDING {
            anyhow::bail!("too many files in recording ({})", self.number);
        }
        self.number += 1;
        self.open()
    }
}

/// Owns the current segment file, the index and the rotation policy.
pub struct SegmentWriter {
    dir:             PathBuf,
    file_name:       FileName,
    file:            FadviseFile,
    index:           IndexFile,
    file_size:       u64,
    max_file_size:   u64,
    min_free_mib:    u64,
    check_interval:  std::time::Duration,
    last_disk_check: Option<Instant>,
    read_ahead:      usize,
    probe:           Option<FreeSpaceProbe>,
}

impl SegmentWriter {
    pub fn new(dir: &Path, config: &RecorderConfig) -> anyhow::Result<Self> {
        let file_name = FileName::new(dir);
        let mut file = file_name.open()?;
        file.set_read_ahead(config.read_ahead_initial_bytes);
        let index = if config.index_enabled { IndexFile::create(dir) } else { IndexFile::disabled() };
        Ok(Self {
            dir: dir.to_path_buf(),
            file_name,
            file,
            index,
            file_size: 0,
            max_file_size: config.max_video_file_size_mib * MEGABYTE,
            min_free_mib: config.min_free_disk_space_mib,
            check_interval: config.disk_check_interval,
            last_disk_check: None,
            read_ahead: config.read_ahead_initial_bytes,
            probe: config.free_space_probe.clone(),
        })
    }

    pub fn file_number(&self) -> u16 {
        self.file_name.number()
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    fn running_low_on_disk_space(&mut self) -> bool {
        if let Some(last) = self.last_disk_check {
            if last.elapsed() < self.check_interval {
                return false;
            }
        }
        self.last_disk_check = Some(Instant::now());
        let free = match &self.probe {
            Some(probe) => Some(probe(&self.dir)),
            None => free_disk_space_mib(&self.dir),
        };
        match free {
            Some(free) if free < self.min_free_mib => {
                warn!("low disk space ({free} MB, limit is {} MB)", self.min_free_mib);
                true
            }
            _ => false,
        }
    }

    /// Every file shall start with an independent frame: rotation happens
    /// only when one is imminent, and only when the size limit or the
    /// disk-space floor demands it. Returns whether a new file was opened.
    pub fn next_file_if_needed(&mut self, independent: bool) -> anyhow::Result<bool> {
        if independent && (self.file_size > self.max_file_size || self.running_low_on_disk_space())
        {
            self.file = self.file_name.next()?;
            self.file.set_read_ahead(self.read_ahead);
            self.file_size = 0;
            info!("recording continues on {}", self.file_name.path().display());
            return Ok(true);
        }
        Ok(false)
    }

    /// Appends an index record for a frame starting at the current write
    /// position.
    pub fn write_index(&mut self, independent: bool) {
        self.index.write(independent, self.file_name.number(), self.file_size);
    }

    /// Writes one frame's packets; an independent frame is preceded by a
    /// fresh PAT and the PMT packets. Short writes are fatal.
    pub fn write_frame(
        &mut self,
        generator: &mut PatPmtGenerator,
        payload: &[u8],
        independent: bool,
    ) -> anyhow::Result<()> {
        if independent {
            self.file.write(generator.next_pat())?;
            self.file_size += TS_SIZE as u64;
            let mut i = 0;
            while let Some(pmt) = generator.next_pmt(i) {
                self.file.write(pmt)?;
                self.file_size += TS_SIZE as u64;
                i += 1;
            }
        }
        self.file
            .write(payload)
            .with_context(|| format!("write to {} failed", self.file_name.path().display()))?;
        self.file_size += payload.len() as u64;
        Ok(())
    }

    /// Serializes the sidecar with the learned stream parameters.
    pub fn write_info(&self, frames_per_second: f64, frame_duration: u32) -> anyhow::Result<()> {
        let info = RecordingInfo {
            frames_per_second,
            frame_duration,
            started_at: chrono::Utc::now().to_rfc3339(),
        };
        let path = self.dir.join(INFO_FILE_NAME);
        std::fs::write(&path, serde_json::to_string_pretty(&info)?)
            .with_context(|| format!("can't write {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelDescriptor;
    use crate::index::{read_index, INDEX_FILE_NAME};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("mpegts_recorder_writer_{}_{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn test_config() -> RecorderConfig {
        RecorderConfig {
            free_space_probe: Some(Arc::new(|_: &Path| 100_000)),
            disk_check_interval: std::time::Duration::ZERO,
            ..Default::default()
        }
    }

    fn video_channel() -> ChannelDescriptor {
        ChannelDescriptor { vpid: 100, vtype: 0x02, ..Default::default() }
    }

    #[test]
    fn independent_frames_get_tables_first() {
        let dir = temp_dir("tables");
        let mut gen = PatPmtGenerator::new(&video_channel());
        let mut writer = SegmentWriter::new(&dir, &test_config()).unwrap();
        let payload = [0xAB; 188];
        writer.write_index(true);
        writer.write_frame(&mut gen, &payload, true).unwrap();
        writer.write_index(false);
        writer.write_frame(&mut gen, &payload, false).unwrap();
        drop(writer);

        let data = std::fs::read(dir.join("001.ts")).unwrap();
        // PAT, PMT, frame, frame
        assert_eq!(data.len(), 4 * 188);
        assert_eq!(crate::ts::ts_pid(&data[..188]), 0);
        assert_eq!(crate::ts::ts_pid(&data[188..376]), gen.pmt_pid());
        assert_eq!(data[2 * 188], 0xAB);

        let entries = read_index(&dir.join(INDEX_FILE_NAME)).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].offset, 0);
        assert!(entries[0].independent);
        assert_eq!(entries[1].offset, 3 * 188);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn rotates_on_size_at_independent_frames_only() {
        let dir = temp_dir("size");
        let mut cfg = test_config();
        cfg.max_video_file_size_mib = 0; // any non-empty file is over the limit
        let mut gen = PatPmtGenerator::new(&video_channel());
        let mut writer = SegmentWriter::new(&dir, &cfg).unwrap();
        writer.write_frame(&mut gen, &[0u8; 188], true).unwrap();
        // mid-GOP: no rotation even though the size limit is exceeded
        assert!(!writer.next_file_if_needed(false).unwrap());
        assert_eq!(writer.file_number(), 1);
        // next independent frame: rotate
        assert!(writer.next_file_if_needed(true).unwrap());
        assert_eq!(writer.file_number(), 2);
        assert_eq!(writer.file_size(), 0);
        assert!(dir.join("002.ts").exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn rotates_when_disk_space_is_low() {
        let dir = temp_dir("disk");
        let free = Arc::new(AtomicU64::new(100_000));
        let probe = {
            let free = Arc::clone(&free);
            move |_: &Path| free.load(Ordering::Relaxed)
        };
        let mut cfg = test_config();
        cfg.free_space_probe = Some(Arc::new(probe));
        let mut gen = PatPmtGenerator::new(&video_channel());
        let mut writer = SegmentWriter::new(&dir, &cfg).unwrap();
        writer.write_frame(&mut gen, &[0u8; 188], true).unwrap();
        assert!(!writer.next_file_if_needed(true).unwrap());
        free.store(500, Ordering::Relaxed);
        // below the 512 MiB floor: the next independent frame rotates
        assert!(!writer.next_file_if_needed(false).unwrap());
        assert!(writer.next_file_if_needed(true).unwrap());
        assert_eq!(writer.file_number(), 2);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn disk_checks_are_throttled() {
        let dir = temp_dir("throttle");
        let mut cfg = test_config();
        cfg.disk_check_interval = std::time::Duration::from_secs(100);
        cfg.free_space_probe = Some(Arc::new(|_: &Path| 500)); // always low
        let mut writer = SegmentWriter::new(&dir, &cfg).unwrap();
        // first check fires immediately and rotates
        assert!(writer.next_file_if_needed(true).unwrap());
        // throttled: no further statvfs for 100 s, so no rotation
        assert!(!writer.next_file_if_needed(true).unwrap());
        assert_eq!(writer.file_number(), 2);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn info_sidecar_roundtrips() {
        let dir = temp_dir("info");
        let writer = SegmentWriter::new(&dir, &test_config()).unwrap();
        writer.write_info(25.0, 3600).unwrap();
        let info: RecordingInfo =
            serde_json::from_str(&std::fs::read_to_string(dir.join(INFO_FILE_NAME)).unwrap())
                .unwrap();
        assert_eq!(info.frames_per_second, 25.0);
        assert_eq!(info.frame_duration, 3600);
        assert!(!info.started_at.is_empty());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
