//! Recorder configuration. One record passed at construction; no
//! process-wide state.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const MEGABYTE: u64 = 1024 * 1024;

/// Invoked when the watchdog declares the incoming stream dead.
pub type EmergencyHook = Arc<dyn Fn() + Send + Sync>;

/// Returns free disk space in MiB for a path; tests inject one of these
/// in place of `statvfs`.
pub type FreeSpaceProbe = Arc<dyn Fn(&Path) -> u64 + Send + Sync>;

#[derive(Clone)]
pub struct RecorderConfig {
    /// Segment rotation threshold.
    pub max_video_file_size_mib: u64,
    /// Low-space rotation threshold.
    pub min_free_disk_space_mib: u64,
    /// Throttle for free-space checks.
    pub disk_check_interval: Duration,
    /// Watchdog grace period before the emergency hook fires.
    pub max_broken_timeout: Duration,
    /// SPSC buffer capacity.
    pub ring_buffer_bytes: usize,
    /// Playback-side prefetch window.
    pub read_ahead_initial_bytes: usize,
    /// Whether to maintain the frame index.
    pub index_enabled: bool,
    pub on_emergency: Option<EmergencyHook>,
    pub free_space_probe: Option<FreeSpaceProbe>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            max_video_file_size_mib: 2000,
            min_free_disk_space_mib: 512,
            disk_check_interval: Duration::from_secs(100),
            max_broken_timeout: Duration::from_secs(30),
            ring_buffer_bytes: 5 * MEGABYTE as usize,
            read_ahead_initial_bytes: 128 * 1024,
            index_enabled: true,
            on_emergency: None,
            free_space_probe: None,
        }
    }
}
