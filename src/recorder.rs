//! The recorder: couples the real-time receiver callback to the
//! analyzer/writer thread through the ring buffer, and owns teardown.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Context;
use log::{debug, error, info};

use crate::channel::ChannelDescriptor;
use crate::config::{EmergencyHook, RecorderConfig};
use crate::detector::FrameDetector;
use crate::psi::PatPmtGenerator;
use crate::ring::RingBuffer;
use crate::writer::SegmentWriter;

/// Grace period for the analyzer thread to finish on teardown.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RecorderState {
    /// Collecting PTS samples, nothing on disk yet.
    Learning = 0,
    /// Frame duration known, first independent frame seen.
    Synced   = 1,
    /// Frames are being written.
    Writing  = 2,
    /// Stop requested, finishing the current group of pictures.
    Stopping = 3,
    Terminal = 4,
}

impl RecorderState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Learning,
            1 => Self::Synced,
            2 => Self::Writing,
            3 => Self::Stopping,
            _ => Self::Terminal,
        }
    }
}

/// A recording in progress.
///
/// The tuner (or any TS source) calls [`receive`](Self::receive) from its
/// own thread; [`activate`](Self::activate) starts and stops the
/// analyzer/writer thread. Dropping the recorder stops it, joining the
/// thread with a three-second grace period.
pub struct Recorder {
    ring:      Arc<RingBuffer>,
    running:   Arc<AtomicBool>,
    accepting: Arc<AtomicBool>,
    state:     Arc<AtomicU8>,
    handle:    Option<JoinHandle<()>>,
    analyzer:  Option<Analyzer>,
}

impl Recorder {
    pub fn new(
        dir: &Path,
        channel: &ChannelDescriptor,
        config: RecorderConfig,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("can't create recording directory {}", dir.display()))?;
        let (pid, stream_type) =
            channel.detector_target().context("channel has no recordable streams")?;

        let ring = Arc::new(RingBuffer::new(config.ring_buffer_bytes));
        let running = Arc::new(AtomicBool::new(false));
        let accepting = Arc::new(AtomicBool::new(false));
        let state = Arc::new(AtomicU8::new(RecorderState::Learning as u8));

        let analyzer = Analyzer {
            ring: Arc::clone(&ring),
            running: Arc::clone(&running),
            accepting: Arc::clone(&accepting),
            state: Arc::clone(&state),
            detector: FrameDetector::new(pid, stream_type),
            generator: PatPmtGenerator::new(channel),
            writer: SegmentWriter::new(dir, &config)?,
            max_broken_timeout: config.max_broken_timeout,
            on_emergency: config.on_emergency.clone(),
        };

        Ok(Self { ring, running, accepting, state, handle: None, analyzer: Some(analyzer) })
    }

    /// Tuner callback: copies a burst of TS packets into the ring buffer.
    /// Never blocks; shortfall is counted as overflow.
    pub fn receive(&self, data: &[u8]) {
        if self.accepting.load(Ordering::Relaxed) {
            let accepted = self.ring.put(data);
            if accepted != data.len() {
                self.ring.report_overflow(data.len() - accepted);
            }
        }
    }

    /// Starts (`true`) or soft-stops (`false`) the analyzer thread. A
    /// stopped recording still runs until the next independent frame so
    /// the final segment stays playable.
    pub fn activate(&mut self, on: bool) {
        if on {
            if let Some(analyzer) = self.analyzer.take() {
                self.running.store(true, Ordering::Relaxed);
                self.accepting.store(true, Ordering::Relaxed);
                let handle = std::thread::Builder::new()
                    .name("recorder".into())
                    .spawn(move || analyzer.run())
                    .expect("can't spawn recorder thread");
                self.handle = Some(handle);
            }
        } else {
            self.running.store(false, Ordering::Relaxed);
        }
    }

    pub fn state(&self) -> RecorderState {
        RecorderState::from_u8(self.state.load(Ordering::Relaxed))
    }

    /// Bytes dropped so far because the analyzer could not keep up.
    pub fn overflow_bytes(&self) -> u64 {
        self.ring.overflow_bytes()
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let deadline = Instant::now() + TEARDOWN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                error!("recorder thread did not finish within {TEARDOWN_TIMEOUT:?}, detaching");
            }
        }
    }
}

struct Analyzer {
    ring:               Arc<RingBuffer>,
    running:            Arc<AtomicBool>,
    accepting:          Arc<AtomicBool>,
    state:              Arc<AtomicU8>,
    detector:           FrameDetector,
    generator:          PatPmtGenerator,
    writer:             SegmentWriter,
    max_broken_timeout: Duration,
    on_emergency:       Option<EmergencyHook>,
}

impl Analyzer {
    fn set_state(&self, state: RecorderState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    fn state(&self) -> RecorderState {
        RecorderState::from_u8(self.state.load(Ordering::Relaxed))
    }

    fn stopped(&self) -> bool {
        !self.running.load(Ordering::Relaxed)
    }

    fn run(mut self) {
        let mut last_write = Instant::now();
        let mut info_written = false;
        loop {
            if self.stopped() && self.state() < RecorderState::Stopping {
                debug!("stop requested, finishing at the next independent frame");
                self.set_state(RecorderState::Stopping);
            }
            match self.ring.get() {
                Some(buf) => {
                    let count = self.detector.analyze(buf);
                    if count == 0 {
                        // a partial packet: wait for the rest of it
                        if self.stopped() {
                            break;
                        }
                        std::thread::sleep(Duration::from_millis(10));
                        continue;
                    }
                    if self.stopped() && self.detector.independent_frame() {
                        // finish the recording before the next independent frame
                        break;
                    }
                    if self.detector.synced() {
                        if !info_written {
                            info!(
                                "recording synced ({:.2} fps, frame duration {})",
                                self.detector.frames_per_second(),
                                self.detector.frame_duration()
                            );
                            if let Err(e) = self.writer.write_info(
                                self.detector.frames_per_second(),
                                self.detector.frame_duration(),
                            ) {
                                error!("{e:#}");
                            }
                            info_written = true;
                            self.set_state(RecorderState::Synced);
                        }
                        let independent = self.detector.new_frame()
                            && self.detector.independent_frame();
                        if self.detector.new_frame() {
                            match self.writer.next_file_if_needed(independent) {
                                Ok(_) => {}
                                Err(e) => {
                                    error!("{e:#}");
                                    break;
                                }
                            }
                            self.writer.write_index(independent);
                        }
                        if let Err(e) =
                            self.writer.write_frame(&mut self.generator, &buf[..count], independent)
                        {
                            error!("{e:#}");
                            break;
                        }
                        last_write = Instant::now();
                        if self.state() < RecorderState::Writing {
                            self.set_state(RecorderState::Writing);
                        }
                    }
                    self.ring.del(count);
                }
                None => {
                    if self.stopped() {
                        // the stream went away; nothing left to align on
                        break;
                    }
                }
            }
            if !self.stopped() && last_write.elapsed() > self.max_broken_timeout {
                error!("video data stream broken");
                if let Some(hook) = &self.on_emergency {
                    hook();
                }
                last_write = Instant::now();
            }
        }
        self.set_state(RecorderState::Terminal);
        self.accepting.store(false, Ordering::Relaxed);
        debug!("recorder thread ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::AudioTrack;
    use crate::detector::testutil::audio_frame_packet;
    use crate::index::{read_index, INDEX_FILE_NAME};
    use std::path::PathBuf;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("mpegts_recorder_rec_{}_{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn audio_channel() -> ChannelDescriptor {
        let mut ch = ChannelDescriptor::default();
        ch.dpids.push(AudioTrack { pid: 200, lang: "deu".into() });
        ch
    }

    fn test_config() -> RecorderConfig {
        RecorderConfig {
            free_space_probe: Some(std::sync::Arc::new(|_: &Path| 100_000)),
            ..Default::default()
        }
    }

    #[test]
    fn audio_only_recording_produces_aligned_segment() {
        let dir = temp_dir("audio");
        let mut rec = Recorder::new(&dir, &audio_channel(), test_config()).unwrap();
        assert_eq!(rec.state(), RecorderState::Learning);
        rec.activate(true);

        for n in 0..40u64 {
            rec.receive(&audio_frame_packet(200, 10_000 + n * 2880));
        }
        // wait until the analyzer has written a useful number of frames
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let entries = read_index(&dir.join(INDEX_FILE_NAME)).unwrap_or_default();
            if entries.len() >= 20 || Instant::now() > deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        rec.activate(false);
        drop(rec);

        let entries = read_index(&dir.join(INDEX_FILE_NAME)).unwrap();
        assert!(entries.len() >= 20, "only {} index entries", entries.len());
        // every audio frame is independent
        assert!(entries.iter().all(|e| e.independent && e.file_number == 1));

        // the segment starts with a PAT, then the PMT describing the stream
        let data = std::fs::read(dir.join("001.ts")).unwrap();
        assert_eq!(data.len() % 188, 0);
        assert_eq!(crate::ts::ts_pid(&data[..188]), 0);
        let mut parser = crate::psi::PatPmtParser::new();
        parser.feed(&data[..4 * 188]);
        let parsed = parser.channel().expect("PMT before the first frame");
        assert_eq!(parsed.dpids, audio_channel().dpids);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn drop_joins_within_grace_period() {
        let dir = temp_dir("drop");
        let mut rec = Recorder::new(&dir, &audio_channel(), test_config()).unwrap();
        rec.activate(true);
        let started = Instant::now();
        drop(rec);
        assert!(started.elapsed() < Duration::from_secs(3));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn receive_before_activation_is_dropped() {
        let dir = temp_dir("inactive");
        let rec = Recorder::new(&dir, &audio_channel(), test_config()).unwrap();
        rec.receive(&audio_frame_packet(200, 1000));
        assert_eq!(rec.overflow_bytes(), 0);
        drop(rec);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn watchdog_requests_emergency_stop() {
        let dir = temp_dir("watchdog");
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut cfg = test_config();
        cfg.max_broken_timeout = Duration::from_millis(100);
        cfg.on_emergency = Some(std::sync::Arc::new({
            let fired = Arc::clone(&fired);
            move || fired.store(true, Ordering::Relaxed)
        }));
        let mut rec = Recorder::new(&dir, &audio_channel(), cfg).unwrap();
        rec.activate(true);
        // no data arrives at all: the stream counts as broken
        let deadline = Instant::now() + Duration::from_secs(3);
        while !fired.load(Ordering::Relaxed) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(fired.load(Ordering::Relaxed));
        drop(rec);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn channel_without_streams_is_rejected() {
        let dir = temp_dir("empty");
        let err = Recorder::new(&dir, &ChannelDescriptor::default(), test_config());
        assert!(err.is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
