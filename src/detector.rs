//! Frame detection: learns the frame rate of a stream it knows nothing
//! about, then marks frame starts and independent frames so the recorder
//! can cut files on seekable boundaries.

use log::{debug, error};

use crate::ts::{
    pes_get_pts, pes_has_pts, pes_payload_offset, ts_has_payload, ts_is_scrambled,
    ts_payload_offset, ts_payload_start, ts_pid, TS_SIZE, TS_SYNC_BYTE,
};

/// PTS samples collected during frame-duration learning.
const MAX_PTS_VALUES: usize = 16;

/// Detects frame boundaries for one elementary stream inside a TS.
///
/// Call [`analyze`](Self::analyze) with raw TS data; it returns how many
/// bytes it consumed. Once synced, a call raising
/// [`new_frame`](Self::new_frame) has consumed exactly up to (excluding)
/// the packet that starts the next frame, so the caller can emit PAT/PMT
/// in front of it.
pub struct FrameDetector {
    pid: u16,
    stream_type: u8,
    is_video: bool,
    disabled: bool,
    synced: bool,
    new_frame: bool,
    independent_frame: bool,
    /// 90 kHz ticks per frame; 0 while still learning.
    frame_duration: u32,
    frames_in_payload_unit: i32,
    /// Negative: one frame spans that many payload units.
    frames_per_payload_unit: i32,
    payload_unit_of_frame: i32,
    scanning: bool,
    scanner: u32,
    pts_values: [u32; MAX_PTS_VALUES],
    num_pts_values: usize,
    num_i_frames: usize,
}

impl FrameDetector {
    pub fn new(pid: u16, stream_type: u8) -> Self {
        Self {
            pid,
            stream_type,
            is_video: matches!(stream_type, 0x01 | 0x02 | 0x1B),
            disabled: false,
            synced: false,
            new_frame: false,
            independent_frame: false,
            frame_duration: 0,
            frames_in_payload_unit: 0,
            frames_per_payload_unit: 0,
            payload_unit_of_frame: 0,
            scanning: false,
            scanner: 0,
            pts_values: [0; MAX_PTS_VALUES],
            num_pts_values: 0,
            num_i_frames: 0,
        }
    }

    pub fn synced(&self) -> bool {
        self.synced
    }

    /// True when the last [`analyze`](Self::analyze) call found a frame start.
    pub fn new_frame(&self) -> bool {
        self.new_frame
    }

    /// True when that frame is an I-frame / IDR frame / audio frame.
    pub fn independent_frame(&self) -> bool {
        self.independent_frame
    }

    /// Learned frame duration in 90 kHz ticks (0 while learning).
    pub fn frame_duration(&self) -> u32 {
        self.frame_duration
    }

    pub fn frames_per_second(&self) -> f64 {
        if self.frame_duration == 0 {
            0.0
        } else {
            90_000.0 / self.frame_duration as f64
        }
    }

    /// Consumes TS packets from `data` and returns the number of bytes
    /// processed. Flags refer to the last frame start found in that span.
    pub fn analyze(&mut self, data: &[u8]) -> usize {
        let mut processed = 0;
        self.new_frame = false;
        self.independent_frame = false;
        if self.disabled {
            return data.len();
        }
        while data.len() - processed >= TS_SIZE {
            let rest = &data[processed..];
            if rest[0] != TS_SYNC_BYTE {
                let mut skipped = 1;
                while skipped < rest.len()
                    && (rest[skipped] != TS_SYNC_BYTE
                        || (rest.len() - skipped > TS_SIZE
                            && rest[skipped + TS_SIZE] != TS_SYNC_BYTE))
                {
                    skipped += 1;
                }
                error!("skipped {skipped} bytes to sync on start of TS packet");
                return processed + skipped;
            }
            let packet = &rest[..TS_SIZE];
            if ts_has_payload(packet) && !ts_is_scrambled(packet) && ts_pid(packet) == self.pid {
                if ts_payload_start(packet) {
                    if self.frame_duration == 0 {
                        self.learn_frame_duration(packet);
                    }
                    self.scanner = 0;
                    self.scanning = true;
                }
                if self.scanning && !self.scan_packet(packet, processed > 0) {
                    return processed;
                }
                if self.disabled {
                    return data.len();
                }
                if !self.synced && self.frame_duration != 0 && self.independent_frame {
                    self.synced = true;
                    debug!(
                        "frame detector synced on pid {} ({:.2} fps)",
                        self.pid,
                        self.frames_per_second()
                    );
                }
            }
            processed += TS_SIZE;
        }
        processed
    }

    /// Collects PTS samples at payload-unit starts; once enough samples
    /// or independent frames have been seen, derives the frame duration
    /// from the smallest successive PTS delta.
    fn learn_frame_duration(&mut self, packet: &[u8]) {
        if self.num_pts_values < MAX_PTS_VALUES && self.num_i_frames < 2 {
            // collect a sequence containing at least two I-frames
            let pes = &packet[ts_payload_offset(packet)..];
            if pes_has_pts(pes) {
                let pts = pes_get_pts(pes) as u32;
                // a rollover of the 33-bit PTS invalidates the samples
                if self.num_pts_values > 0
                    && self.pts_values[self.num_pts_values - 1] > 0xF000_0000
                    && pts < 0x1000_0000
                {
                    debug!("PTS rollover, restarting frame duration detection");
                    self.num_pts_values = 0;
                    self.num_i_frames = 0;
                } else {
                    self.pts_values[self.num_pts_values] = pts;
                    self.num_pts_values += 1;
                }
            }
            return;
        }

        if self.num_pts_values < 2 {
            return; // no deltas without timestamps; the stream stays unlearnable
        }
        // find the smallest PTS delta:
        self.pts_values[..self.num_pts_values].sort_unstable();
        self.num_pts_values -= 1;
        for i in 0..self.num_pts_values {
            self.pts_values[i] = self.pts_values[i + 1] - self.pts_values[i];
        }
        self.pts_values[..self.num_pts_values].sort_unstable();
        let delta = self.pts_values[0];
        // determine frame info:
        if self.is_video {
            if delta % 3600 == 0 {
                self.frame_duration = 3600; // PAL, 25 fps
            } else if delta % 3003 == 0 {
                self.frame_duration = 3003; // NTSC, 29.97 fps
            } else if delta == 1800 {
                self.frame_duration = 3600; // PAL, 25 fps
                self.frames_per_payload_unit = -2;
            } else if delta == 1501 {
                self.frame_duration = 3003; // NTSC, 29.97 fps
                self.frames_per_payload_unit = -2;
            } else {
                self.frame_duration = 3600;
                debug!("unknown frame duration ({delta}), assuming 25 fps");
            }
        } else {
            // PTS of audio frames is always increasing
            self.frame_duration = delta;
        }
        debug!(
            "frame duration = {}  FPS = {:.2}  FPPU = {}",
            self.frame_duration,
            self.frames_per_second(),
            self.frames_per_payload_unit
        );
    }

    /// Runs the start-code scanner over one packet's payload. Returns
    /// `false` when the caller should return `processed` immediately
    /// (a new frame begins in this packet).
    fn scan_packet(&mut self, packet: &[u8], have_processed: bool) -> bool {
        let mut offset = ts_payload_offset(packet);
        if ts_payload_start(packet) {
            if offset + 9 <= TS_SIZE {
                offset += pes_payload_offset(&packet[offset..]);
            } else {
                offset = TS_SIZE;
            }
            if self.frames_per_payload_unit == 0 {
                self.frames_per_payload_unit = self.frames_in_payload_unit;
            }
        }
        let mut i = offset;
        while self.scanning && i < TS_SIZE {
            self.scanner = (self.scanner << 8) | packet[i] as u32;
            match self.stream_type {
                0x01 | 0x02 => {
                    // MPEG 1/2 video: Picture Start Code
                    if self.scanner == 0x0000_0100 {
                        if self.synced && have_processed {
                            return false;
                        }
                        self.new_frame = true;
                        self.independent_frame =
                            i + 2 < TS_SIZE && ((packet[i + 2] >> 3) & 0x07) == 1;
                        if self.synced {
                            if self.frames_per_payload_unit <= 1 {
                                self.scanning = false;
                            }
                        } else {
                            self.frames_in_payload_unit += 1;
                            if self.independent_frame {
                                self.num_i_frames += 1;
                            }
                        }
                        self.scanner = 0;
                    }
                }
                0x1B => {
                    // MPEG 4 video: Access Unit Delimiter
                    if self.scanner == 0x0000_0109 {
                        if self.synced && have_processed {
                            return false;
                        }
                        self.new_frame = true;
                        self.independent_frame = i + 1 < TS_SIZE && packet[i + 1] == 0x10;
                        if self.synced {
                            if self.frames_per_payload_unit < 0 {
                                self.payload_unit_of_frame =
                                    (self.payload_unit_of_frame + 1) % -self.frames_per_payload_unit;
                                if self.payload_unit_of_frame != 0 && self.independent_frame {
                                    self.payload_unit_of_frame = 0;
                                }
                                if self.payload_unit_of_frame != 0 {
                                    self.new_frame = false;
                                }
                            }
                            if self.frames_per_payload_unit <= 1 {
                                self.scanning = false;
                            }
                        } else {
                            self.frames_in_payload_unit += 1;
                            if self.independent_frame {
                                self.num_i_frames += 1;
                            }
                        }
                        self.scanner = 0;
                    }
                }
                0x04 | 0x06 => {
                    // MPEG audio / AC3: every payload unit is one frame
                    if self.synced && have_processed {
                        return false;
                    }
                    self.new_frame = true;
                    self.independent_frame = true;
                    if !self.synced {
                        self.frames_in_payload_unit = 1;
                        if ts_payload_start(packet) {
                            self.num_i_frames += 1;
                        }
                    }
                    self.scanning = false;
                }
                _ => {
                    error!(
                        "unknown stream type {} (PID {}) in frame detector",
                        self.stream_type, self.pid
                    );
                    self.disabled = true; // ignore any further data
                    return true;
                }
            }
            i += 1;
        }
        true
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use crate::ts::{TS_PAYLOAD_EXISTS, TS_PAYLOAD_START, TS_SIZE, TS_SYNC_BYTE};

    /// One MPEG-2 video frame as a single payload-unit TS packet:
    /// PES header with PTS, picture start code, coding type, stuffing.
    pub fn video_frame_packet(pid: u16, pts: u64, independent: bool) -> [u8; TS_SIZE] {
        let mut p = [0xFFu8; TS_SIZE];
        p[0] = TS_SYNC_BYTE;
        p[1] = TS_PAYLOAD_START | (pid >> 8) as u8;
        p[2] = pid as u8;
        p[3] = TS_PAYLOAD_EXISTS;
        // MPEG-2 PES header, PTS only
        p[4..10].copy_from_slice(&[0x00, 0x00, 0x01, 0xE0, 0x00, 0x00]);
        p[10] = 0x80;
        p[11] = 0x80;
        p[12] = 0x05;
        p[13] = 0x21 | (((pts >> 30) & 0x07) as u8) << 1;
        p[14] = (pts >> 22) as u8;
        p[15] = 0x01 | (((pts >> 15) & 0x7F) as u8) << 1;
        p[16] = (pts >> 7) as u8;
        p[17] = 0x01 | ((pts & 0x7F) as u8) << 1;
        // picture start code + temporal reference + picture coding type
        p[18..22].copy_from_slice(&[0x00, 0x00, 0x01, 0x00]);
        p[22] = 0x00;
        p[23] = if independent { 1 << 3 } else { 2 << 3 };
        p
    }

    /// A non-payload-start continuation packet for the same PID.
    pub fn continuation_packet(pid: u16) -> [u8; TS_SIZE] {
        let mut p = [0xAAu8; TS_SIZE];
        p[0] = TS_SYNC_BYTE;
        p[1] = (pid >> 8) as u8;
        p[2] = pid as u8;
        p[3] = TS_PAYLOAD_EXISTS;
        p
    }

    /// One audio frame (payload-unit start with PTS, opaque payload).
    pub fn audio_frame_packet(pid: u16, pts: u64) -> [u8; TS_SIZE] {
        let mut p = video_frame_packet(pid, pts, false);
        p[4..8].copy_from_slice(&[0x00, 0x00, 0x01, 0xBD]);
        // overwrite the picture start code with sync-frame-ish bytes
        p[18..24].copy_from_slice(&[0x0B, 0x77, 0x12, 0x34, 0x56, 0x78]);
        p
    }

    /// A PAL GOP structure: I-frame every `gop` frames, PTS step `delta`.
    pub fn video_stream(pid: u16, frames: usize, gop: usize, pts0: u64, delta: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(frames * TS_SIZE);
        for n in 0..frames {
            let pts = (pts0 + n as u64 * delta) & (crate::ts::MAX_PTS - 1);
            out.extend_from_slice(&video_frame_packet(pid, pts, n % gop == 0));
        }
        out
    }
}
